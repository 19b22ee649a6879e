//! Index control plane.
//!
//! One durable [`IndexStatusRecord`] per (submission, revision). The record
//! is the single gate for both indexing and retrieval:
//!
//! ```text
//! (absent) ──ensure_queued──▶ queued ──try_begin_indexing──▶ indexing
//!                                                              │
//!                                    failed ◀──mark_failed─────┤
//!                                      │                       │
//!                      try_begin_indexing           mark_ready ▼
//!                                      └──────▶ indexing     ready
//! ```
//!
//! [`StatusStore::try_begin_indexing`] is an atomic conditional transition,
//! so at most one caller wins the right to run a given revision.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{IndexFailure, IndexStats, IndexStatusRecord, RepoReference};

pub use memory::InMemoryStatusStore;
pub use sqlite::SqliteStatusStore;

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Associate a submission with a repository reference. Re-registering
    /// replaces the reference.
    async fn register_submission(&self, submission_id: &str, repo: &RepoReference) -> Result<()>;

    async fn resolve_submission(&self, submission_id: &str) -> Result<Option<RepoReference>>;

    async fn get(&self, submission_id: &str, revision: &str) -> Result<Option<IndexStatusRecord>>;

    /// Create a `queued` record if none exists. Existing records are left
    /// untouched.
    async fn ensure_queued(&self, submission_id: &str, repo: &RepoReference) -> Result<()>;

    /// Move `queued` or `failed` to `indexing`, clearing stats and error.
    /// Returns `false` when the record was in any other state.
    async fn try_begin_indexing(&self, submission_id: &str, revision: &str) -> Result<bool>;

    async fn mark_ready(&self, submission_id: &str, revision: &str, stats: IndexStats) -> Result<()>;

    async fn mark_failed(
        &self,
        submission_id: &str,
        revision: &str,
        failure: IndexFailure,
    ) -> Result<()>;
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
