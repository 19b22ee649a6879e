//! Core data models used throughout the indexing and retrieval pipeline.
//!
//! These types represent repository references, chunks, vector records,
//! control-plane status records and retrieval results.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{IndexError, Result};

/// An immutable source: one repository pinned to one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoReference {
    pub owner: String,
    pub repo: String,
    pub revision: String,
}

impl RepoReference {
    /// Build a reference, rejecting anything that is not a commit hash.
    ///
    /// Branch and tag names are mutable and would make the index key
    /// meaningless, so only 7–64 hex characters are accepted as revision.
    pub fn new(owner: &str, repo: &str, revision: &str) -> Result<Self> {
        let valid_name = |s: &str| {
            !s.is_empty()
                && s != "."
                && s != ".."
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !valid_name(owner) {
            return Err(IndexError::InvalidReference(format!(
                "invalid owner: '{}'",
                owner
            )));
        }
        if !valid_name(repo) {
            return Err(IndexError::InvalidReference(format!(
                "invalid repo: '{}'",
                repo
            )));
        }
        if !(7..=64).contains(&revision.len()) || !revision.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(IndexError::InvalidReference(format!(
                "revision '{}' is not a commit hash",
                revision
            )));
        }
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            revision: revision.to_ascii_lowercase(),
        })
    }

    /// Parse `owner/repo@revision`.
    pub fn parse(input: &str) -> Result<Self> {
        let (path, revision) = input
            .split_once('@')
            .ok_or_else(|| IndexError::InvalidReference(format!("missing '@revision' in '{}'", input)))?;
        let (owner, repo) = path
            .split_once('/')
            .ok_or_else(|| IndexError::InvalidReference(format!("expected owner/repo in '{}'", input)))?;
        Self::new(owner, repo, revision)
    }
}

impl fmt::Display for RepoReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.revision)
    }
}

/// A contiguous line range from one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Path relative to the snapshot root, `/`-separated.
    pub file_path: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub content: String,
    pub language: String,
}

/// Metadata stored next to each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub submission_id: String,
    pub owner: String,
    pub repo: String,
    pub revision: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub language: String,
    /// Truncated copy of the chunk content.
    pub content: String,
}

/// A vector ready for upsert.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// A nearest-neighbour hit returned by a vector index.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub metadata: VectorMetadata,
}

/// Indexing lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Queued,
    Indexing,
    Ready,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Queued => "queued",
            IndexStatus::Indexing => "indexing",
            IndexStatus::Ready => "ready",
            IndexStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(IndexStatus::Queued),
            "indexing" => Ok(IndexStatus::Indexing),
            "ready" => Ok(IndexStatus::Ready),
            "failed" => Ok(IndexStatus::Failed),
            other => Err(IndexError::Other(format!("unknown index status '{}'", other))),
        }
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub file_count: u64,
    pub chunk_count: u64,
    pub total_chars: u64,
    pub files_skipped: u64,
}

/// Failure recorded on a `failed` status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFailure {
    /// Top-level message, surfaced verbatim by status queries.
    pub message: String,
    /// Full cause chain.
    pub detail: String,
    /// RFC 3339 timestamp.
    pub failed_at: String,
}

/// Durable control-plane record for one (submission, revision).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStatusRecord {
    pub submission_id: String,
    pub repo: RepoReference,
    pub status: IndexStatus,
    pub stats: IndexStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IndexFailure>,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of a `start_indexing` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexOutcome {
    pub status: IndexStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&IndexStatusRecord> for IndexOutcome {
    fn from(record: &IndexStatusRecord) -> Self {
        let finished = record.status == IndexStatus::Ready;
        Self {
            status: record.status,
            chunk_count: finished.then_some(record.stats.chunk_count),
            file_count: finished.then_some(record.stats.file_count),
            error: record.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// A retrieved chunk, ranked by similarity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeChunkResult {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub score: f32,
    pub language: String,
}

/// Per-call overrides for retrieval limits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchOptions {
    pub top_k: Option<usize>,
    pub max_chunks: Option<usize>,
    pub max_total_chars: Option<usize>,
    pub max_chunk_chars: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchStats {
    /// `top_k` actually sent to the index after clamping.
    pub top_k: usize,
    pub candidates: usize,
    pub after_dedup: usize,
    pub returned: usize,
    pub total_chars: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub chunks: Vec<CodeChunkResult>,
    pub stats: SearchStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let r = RepoReference::parse("acme/widgets@0123456789ABCDEF0123456789abcdef01234567").unwrap();
        assert_eq!(r.owner, "acme");
        assert_eq!(r.repo, "widgets");
        assert_eq!(r.revision, "0123456789abcdef0123456789abcdef01234567");
    }

    #[test]
    fn test_branch_name_rejected() {
        assert!(matches!(
            RepoReference::new("acme", "widgets", "main"),
            Err(IndexError::InvalidReference(_))
        ));
        assert!(RepoReference::parse("acme/widgets@feature/x").is_err());
    }

    #[test]
    fn test_traversal_owner_rejected() {
        assert!(RepoReference::new("..", "widgets", "abcdef1").is_err());
        assert!(RepoReference::new("a/b", "widgets", "abcdef1").is_err());
    }

    #[test]
    fn test_outcome_hides_counts_until_ready() {
        let record = IndexStatusRecord {
            submission_id: "s1".into(),
            repo: RepoReference::new("a", "b", "abcdef1").unwrap(),
            status: IndexStatus::Indexing,
            stats: IndexStats::default(),
            error: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let outcome = IndexOutcome::from(&record);
        assert_eq!(outcome.status, IndexStatus::Indexing);
        assert!(outcome.chunk_count.is_none());
    }
}
