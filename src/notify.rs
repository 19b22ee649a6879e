//! Completion events for downstream consumers.
//!
//! When an index reaches `ready`, the pipeline sends a [`CompletionEvent`]
//! over a bounded channel to a background worker, which hands it to a
//! [`CompletionHandler`]. Handler failures are logged and never touch the
//! index status.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::NotifyConfig;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionEvent {
    pub submission_id: String,
    pub owner: String,
    pub repo: String,
    pub revision: String,
    pub file_count: u64,
    pub chunk_count: u64,
    pub completed_at: String,
}

#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn handle(&self, event: &CompletionEvent) -> Result<()>;
}

/// Logs each event.
pub struct LogHandler;

#[async_trait]
impl CompletionHandler for LogHandler {
    async fn handle(&self, event: &CompletionEvent) -> Result<()> {
        info!(
            submission_id = %event.submission_id,
            revision = %event.revision,
            chunks = event.chunk_count,
            "index ready"
        );
        Ok(())
    }
}

/// POSTs each event as JSON.
pub struct WebhookHandler {
    client: reqwest::Client,
    url: String,
}

impl WebhookHandler {
    pub fn new(url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl CompletionHandler for WebhookHandler {
    async fn handle(&self, event: &CompletionEvent) -> Result<()> {
        let response = self.client.post(&self.url).json(event).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned {}", response.status());
        }
        Ok(())
    }
}

/// Sending half handed to the pipeline.
#[derive(Clone)]
pub struct CompletionNotifier {
    tx: mpsc::Sender<CompletionEvent>,
}

impl CompletionNotifier {
    /// Enqueue without waiting. A full or closed channel drops the event
    /// with a warning.
    pub fn notify(&self, event: CompletionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "completion event dropped");
        }
    }
}

/// Start the worker task. It exits once every notifier is dropped.
pub fn spawn_worker(handler: Arc<dyn CompletionHandler>) -> (CompletionNotifier, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<CompletionEvent>(CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = handler.handle(&event).await {
                let message = format!("{:#}", e);
                warn!(
                    submission_id = %event.submission_id,
                    error = %message,
                    "completion handler failed"
                );
            }
        }
    });
    (CompletionNotifier { tx }, handle)
}

/// Handler selected by `[notify]`.
pub fn create_handler(config: &NotifyConfig) -> Result<Arc<dyn CompletionHandler>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookHandler::new(url.clone())?)),
        None => Ok(Arc::new(LogHandler)),
    }
}
