//! Indexing orchestration.
//!
//! [`IndexService`] runs one submission revision through
//! acquire → chunk → embed/upsert, keeping the control plane current at
//! each step. [`Engine`] builds every client once from configuration and
//! hands shared handles to the service, the retriever and the HTTP server.
//!
//! # Single flight
//!
//! A run starts only if [`StatusStore::try_begin_indexing`] wins the
//! `queued|failed → indexing` transition. Losers observe the current
//! record instead:
//!
//! | Record | `start_indexing` result |
//! |--------|-------------------------|
//! | `ready` | cached counts, no work |
//! | `indexing` | in-flight status, no work |
//! | absent / `queued` / `failed` | fresh run |

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::chunk::{chunk_tree, ChunkReport};
use crate::config::{ChunkingConfig, Config};
use crate::control::{SqliteStatusStore, StatusStore};
use crate::embedding::{create_embedder, Embedder};
use crate::error::{IndexError, Result};
use crate::models::{
    IndexFailure, IndexOutcome, IndexStats, IndexStatus, IndexStatusRecord, RepoReference,
};
use crate::notify::{self, CompletionEvent, CompletionNotifier};
use crate::retrieval::Retriever;
use crate::snapshot::{RepositoryHost, Snapshot};
use crate::vector_index::{create_index, VectorIndex};
use crate::writer::IndexWriter;
use crate::{db, migrate};

/// A claimed run: the caller won the transition to `indexing`.
#[derive(Debug, Clone)]
pub struct IndexRun {
    pub submission_id: String,
    pub repo: RepoReference,
}

/// Result of trying to claim a run.
#[derive(Debug)]
pub enum Claim {
    /// Already `ready`; nothing to do.
    Cached(IndexStatusRecord),
    /// Another run holds `indexing`.
    InFlight(IndexStatusRecord),
    Started(IndexRun),
}

pub struct IndexService {
    status: Arc<dyn StatusStore>,
    host: Arc<RepositoryHost>,
    writer: IndexWriter,
    chunking: ChunkingConfig,
    notifier: Option<CompletionNotifier>,
}

impl IndexService {
    pub fn new(
        status: Arc<dyn StatusStore>,
        host: Arc<RepositoryHost>,
        writer: IndexWriter,
        chunking: ChunkingConfig,
        notifier: Option<CompletionNotifier>,
    ) -> Self {
        Self {
            status,
            host,
            writer,
            chunking,
            notifier,
        }
    }

    pub async fn register(&self, submission_id: &str, repo: &RepoReference) -> Result<()> {
        self.status.register_submission(submission_id, repo).await?;
        info!(submission_id, %repo, "submission registered");
        Ok(())
    }

    async fn resolve(&self, submission_id: &str) -> Result<RepoReference> {
        self.status
            .resolve_submission(submission_id)
            .await?
            .ok_or_else(|| IndexError::UnknownSubmission(submission_id.to_string()))
    }

    /// Status record for the submission's registered revision.
    pub async fn get_index_status(&self, submission_id: &str) -> Result<IndexStatusRecord> {
        let repo = self.resolve(submission_id).await?;
        self.status
            .get(submission_id, &repo.revision)
            .await?
            .ok_or_else(|| IndexError::NoIndex(submission_id.to_string()))
    }

    /// Claim the right to index the submission's current revision.
    pub async fn begin(&self, submission_id: &str) -> Result<Claim> {
        let repo = self.resolve(submission_id).await?;
        self.status.ensure_queued(submission_id, &repo).await?;

        if self.status.try_begin_indexing(submission_id, &repo.revision).await? {
            info!(submission_id, %repo, "indexing started");
            return Ok(Claim::Started(IndexRun {
                submission_id: submission_id.to_string(),
                repo,
            }));
        }

        let record = self
            .status
            .get(submission_id, &repo.revision)
            .await?
            .ok_or_else(|| IndexError::NoIndex(submission_id.to_string()))?;

        match record.status {
            IndexStatus::Ready => Ok(Claim::Cached(record)),
            _ => Ok(Claim::InFlight(record)),
        }
    }

    /// Run a claimed indexing job to completion and return the final
    /// record. Run failures are recorded as `failed`, not returned.
    pub async fn execute(&self, run: IndexRun) -> Result<IndexStatusRecord> {
        let started = Instant::now();
        let revision = run.repo.revision.clone();

        let outcome = match self.run(&run).await {
            Ok(stats) => self
                .status
                .mark_ready(&run.submission_id, &revision, stats)
                .await
                .map(|()| stats),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(stats) => {
                info!(
                    submission_id = %run.submission_id,
                    files = stats.file_count,
                    chunks = stats.chunk_count,
                    skipped = stats.files_skipped,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "indexing complete"
                );
                if let Some(ref notifier) = self.notifier {
                    notifier.notify(CompletionEvent {
                        submission_id: run.submission_id.clone(),
                        owner: run.repo.owner.clone(),
                        repo: run.repo.repo.clone(),
                        revision: revision.clone(),
                        file_count: stats.file_count,
                        chunk_count: stats.chunk_count,
                        completed_at: chrono::Utc::now().to_rfc3339(),
                    });
                }
            }
            // Also covers a failed `ready` write: no run ends at `indexing`.
            Err(e) => {
                error!(
                    submission_id = %run.submission_id,
                    code = e.code(),
                    error = %e.chain(),
                    "indexing failed"
                );
                let failure = IndexFailure {
                    message: e.to_string(),
                    detail: e.chain(),
                    failed_at: chrono::Utc::now().to_rfc3339(),
                };
                self.status
                    .mark_failed(&run.submission_id, &revision, failure)
                    .await?;
            }
        }

        self.status
            .get(&run.submission_id, &revision)
            .await?
            .ok_or_else(|| IndexError::NoIndex(run.submission_id.clone()))
    }

    /// Index the submission's revision unless it is already ready or in
    /// flight. Idempotent per (submission, revision).
    pub async fn start_indexing(&self, submission_id: &str) -> Result<IndexOutcome> {
        let record = match self.begin(submission_id).await? {
            Claim::Cached(record) | Claim::InFlight(record) => record,
            Claim::Started(run) => self.execute(run).await?,
        };
        Ok(IndexOutcome::from(&record))
    }

    async fn run(&self, run: &IndexRun) -> Result<IndexStats> {
        let snapshot = self.host.acquire(&run.repo).await?;
        let result = self.index_snapshot(run, &snapshot).await;
        snapshot.cleanup().await;
        result
    }

    async fn index_snapshot(&self, run: &IndexRun, snapshot: &Snapshot) -> Result<IndexStats> {
        let root = snapshot.root_path.clone();
        let chunking = self.chunking.clone();
        let report: ChunkReport = tokio::task::spawn_blocking(move || chunk_tree(&root, &chunking))
            .await
            .map_err(|e| IndexError::Other(format!("chunking task failed: {}", e)))??;

        info!(
            submission_id = %run.submission_id,
            files = report.files_indexed,
            chunks = report.chunks.len(),
            skipped = report.skipped.len(),
            "snapshot chunked"
        );
        if report.chunks.is_empty() {
            warn!(submission_id = %run.submission_id, "snapshot produced no chunks");
        }

        let written = self
            .writer
            .write(&run.submission_id, &run.repo, &report.chunks)
            .await?;

        Ok(IndexStats {
            file_count: report.files_indexed as u64,
            chunk_count: written as u64,
            total_chars: report.total_chars(),
            files_skipped: report.skipped.len() as u64,
        })
    }
}

/// Every long-lived client, built once.
#[derive(Clone)]
pub struct Engine {
    pub indexer: Arc<IndexService>,
    pub retriever: Arc<Retriever>,
}

impl Engine {
    /// Connect to the database, apply migrations and build all clients
    /// from `config`. Fails fast on missing credentials.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let (engine, _worker) = Self::with_worker(config).await?;
        Ok(engine)
    }

    /// Like [`Engine::from_config`], also returning the completion worker.
    /// The worker finishes once every clone of the engine is dropped and
    /// pending events are handled.
    pub async fn with_worker(config: &Config) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let embedder = create_embedder(&config.embedding)?;
        let index = create_index(&config.index, &pool)?;
        let status: Arc<dyn StatusStore> = Arc::new(SqliteStatusStore::new(pool));
        let handler = notify::create_handler(&config.notify)?;
        let (notifier, worker) = notify::spawn_worker(handler);

        let engine = Self::new(config, status, index, embedder, Some(notifier))?;
        Ok((engine, worker))
    }

    /// Assemble an engine from explicit collaborators.
    pub fn new(
        config: &Config,
        status: Arc<dyn StatusStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        notifier: Option<CompletionNotifier>,
    ) -> Result<Self> {
        let host = Arc::new(RepositoryHost::new(&config.snapshot)?);
        let writer = IndexWriter::new(
            embedder.clone(),
            index.clone(),
            &config.embedding,
            &config.index,
        );
        let indexer = Arc::new(IndexService::new(
            status.clone(),
            host,
            writer,
            config.chunking.clone(),
            notifier,
        ));
        let retriever = Arc::new(Retriever::new(
            status,
            index,
            embedder,
            config.retrieval.clone(),
        ));
        Ok(Self { indexer, retriever })
    }
}
