//! In-memory [`StatusStore`] for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{now_rfc3339, StatusStore};
use crate::error::{IndexError, Result};
use crate::models::{IndexFailure, IndexStats, IndexStatus, IndexStatusRecord, RepoReference};

#[derive(Default)]
struct State {
    submissions: HashMap<String, RepoReference>,
    records: HashMap<(String, String), IndexStatusRecord>,
}

#[derive(Default)]
pub struct InMemoryStatusStore {
    state: Mutex<State>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| IndexError::Other("status store lock poisoned".into()))?;
        Ok(f(&mut state))
    }
}

fn key(submission_id: &str, revision: &str) -> (String, String) {
    (submission_id.to_string(), revision.to_string())
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn register_submission(&self, submission_id: &str, repo: &RepoReference) -> Result<()> {
        self.with_state(|s| {
            s.submissions.insert(submission_id.to_string(), repo.clone());
        })
    }

    async fn resolve_submission(&self, submission_id: &str) -> Result<Option<RepoReference>> {
        self.with_state(|s| s.submissions.get(submission_id).cloned())
    }

    async fn get(&self, submission_id: &str, revision: &str) -> Result<Option<IndexStatusRecord>> {
        self.with_state(|s| s.records.get(&key(submission_id, revision)).cloned())
    }

    async fn ensure_queued(&self, submission_id: &str, repo: &RepoReference) -> Result<()> {
        self.with_state(|s| {
            s.records
                .entry(key(submission_id, &repo.revision))
                .or_insert_with(|| {
                    let now = now_rfc3339();
                    IndexStatusRecord {
                        submission_id: submission_id.to_string(),
                        repo: repo.clone(),
                        status: IndexStatus::Queued,
                        stats: IndexStats::default(),
                        error: None,
                        created_at: now.clone(),
                        updated_at: now,
                    }
                });
        })
    }

    async fn try_begin_indexing(&self, submission_id: &str, revision: &str) -> Result<bool> {
        self.with_state(|s| match s.records.get_mut(&key(submission_id, revision)) {
            Some(r) if matches!(r.status, IndexStatus::Queued | IndexStatus::Failed) => {
                r.status = IndexStatus::Indexing;
                r.stats = IndexStats::default();
                r.error = None;
                r.updated_at = now_rfc3339();
                true
            }
            _ => false,
        })
    }

    async fn mark_ready(&self, submission_id: &str, revision: &str, stats: IndexStats) -> Result<()> {
        self.with_state(|s| {
            if let Some(r) = s.records.get_mut(&key(submission_id, revision)) {
                r.status = IndexStatus::Ready;
                r.stats = stats;
                r.updated_at = now_rfc3339();
            }
        })
    }

    async fn mark_failed(
        &self,
        submission_id: &str,
        revision: &str,
        failure: IndexFailure,
    ) -> Result<()> {
        self.with_state(|s| {
            if let Some(r) = s.records.get_mut(&key(submission_id, revision)) {
                r.status = IndexStatus::Failed;
                r.error = Some(failure);
                r.updated_at = now_rfc3339();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_begin_has_one_winner() {
        let store = std::sync::Arc::new(InMemoryStatusStore::new());
        let repo = RepoReference::new("a", "b", "abcdef1").unwrap();
        store.ensure_queued("s", &repo).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_begin_indexing("s", "abcdef1").await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_begin_without_record_is_refused() {
        let store = InMemoryStatusStore::new();
        assert!(!store.try_begin_indexing("missing", "abcdef1").await.unwrap());
    }
}
