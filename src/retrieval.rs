//! Query-time retrieval.
//!
//! A search runs in three stages after the status gate:
//!
//! 1. **Nearest neighbours.** The query is embedded with the same model used
//!    at index time and the namespace of the submission's registered
//!    revision is queried for `top_k` candidates.
//! 2. **Overlap dedup.** Candidates are scanned best-first; a candidate is
//!    dropped when an already-kept chunk from the same file overlaps it by
//!    more than the configured ratio (shared lines ÷ lines covered by
//!    either).
//! 3. **Budget.** Each chunk's content is cut to `max_chunk_chars`, then
//!    chunks are accepted in order until the count or total-character
//!    budget would be exceeded. The first chunk that does not fit ends
//!    the scan.
//!
//! Per-call [`SearchOptions`] may tighten the configured limits but never
//! loosen them.

use std::sync::Arc;

use tracing::debug;

use crate::config::RetrievalConfig;
use crate::control::StatusStore;
use crate::embedding::{embed_query, Embedder};
use crate::error::{IndexError, Result};
use crate::models::{
    CodeChunkResult, IndexStatus, RepoReference, SearchOptions, SearchResponse, SearchStats,
    VectorMatch,
};
use crate::vector_index::VectorIndex;
use crate::writer::{namespace_for, truncate_chars};

pub struct Retriever {
    status: Arc<dyn StatusStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        status: Arc<dyn StatusStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            status,
            index,
            embedder,
            config,
        }
    }

    /// Most relevant chunks of the submission's ready index for `query`.
    pub async fn search(
        &self,
        submission_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(IndexError::EmptyQuery);
        }

        let repo = self.ensure_ready(submission_id).await?;

        let top_k = options
            .top_k
            .unwrap_or(self.config.default_top_k)
            .clamp(1, self.config.max_top_k.max(1));
        let max_chunks = tighten(options.max_chunks, self.config.max_chunks).max(1);
        let max_total_chars = tighten(options.max_total_chars, self.config.max_total_chars);
        let max_chunk_chars = tighten(options.max_chunk_chars, self.config.max_chunk_chars);

        let vector = embed_query(self.embedder.as_ref(), query)
            .await
            .map_err(|e| IndexError::Embedding(format!("{:#}", e)))?;

        let matches = self
            .index
            .query(&namespace_for(submission_id, &repo.revision), &vector, top_k)
            .await
            .map_err(|e| IndexError::VectorIndex(format!("{:#}", e)))?;
        let candidates: Vec<CodeChunkResult> = matches.into_iter().map(to_result).collect();
        let candidate_count = candidates.len();

        let deduped = dedupe_overlapping(candidates, self.config.dedup_overlap_threshold);
        let after_dedup = deduped.len();

        let (chunks, total_chars) =
            apply_budget(deduped, max_chunks, max_total_chars, max_chunk_chars);

        debug!(
            submission_id,
            top_k,
            candidates = candidate_count,
            after_dedup,
            returned = chunks.len(),
            total_chars,
            "search complete"
        );

        Ok(SearchResponse {
            stats: SearchStats {
                top_k,
                candidates: candidate_count,
                after_dedup,
                returned: chunks.len(),
                total_chars,
            },
            chunks,
        })
    }

    /// The registered reference, provided its index is `ready`.
    async fn ensure_ready(&self, submission_id: &str) -> Result<RepoReference> {
        let repo = self
            .status
            .resolve_submission(submission_id)
            .await?
            .ok_or_else(|| IndexError::UnknownSubmission(submission_id.to_string()))?;

        let record = self
            .status
            .get(submission_id, &repo.revision)
            .await?
            .ok_or_else(|| IndexError::NoIndex(submission_id.to_string()))?;

        match record.status {
            IndexStatus::Ready => Ok(repo),
            IndexStatus::Queued | IndexStatus::Indexing => Err(IndexError::IndexNotReady {
                submission_id: submission_id.to_string(),
                status: record.status.to_string(),
            }),
            IndexStatus::Failed => Err(IndexError::IndexFailed(submission_id.to_string())),
        }
    }
}

fn tighten(requested: Option<usize>, configured: usize) -> usize {
    requested.map_or(configured, |r| r.min(configured))
}

fn to_result(m: VectorMatch) -> CodeChunkResult {
    CodeChunkResult {
        path: m.metadata.file_path,
        start_line: m.metadata.start_line,
        end_line: m.metadata.end_line,
        content: m.metadata.content,
        score: m.score,
        language: m.metadata.language,
    }
}

/// Shared lines over lines covered by either range, both inclusive.
pub fn overlap_ratio(a: (usize, usize), b: (usize, usize)) -> f64 {
    let start = a.0.max(b.0);
    let end = a.1.min(b.1);
    if end < start {
        return 0.0;
    }
    let shared = (end - start + 1) as f64;
    let len_a = (a.1.saturating_sub(a.0) + 1) as f64;
    let len_b = (b.1.saturating_sub(b.0) + 1) as f64;
    shared / (len_a + len_b - shared)
}

/// Greedy best-first dedup of same-file chunks overlapping above `threshold`.
pub fn dedupe_overlapping(mut candidates: Vec<CodeChunkResult>, threshold: f64) -> Vec<CodeChunkResult> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<CodeChunkResult> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let duplicate = kept.iter().any(|k| {
            k.path == candidate.path
                && overlap_ratio(
                    (k.start_line, k.end_line),
                    (candidate.start_line, candidate.end_line),
                ) > threshold
        });
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

/// Truncate and accept chunks in order until a budget would be exceeded.
///
/// Returns the accepted chunks and their total character count.
pub fn apply_budget(
    chunks: Vec<CodeChunkResult>,
    max_chunks: usize,
    max_total_chars: usize,
    max_chunk_chars: usize,
) -> (Vec<CodeChunkResult>, usize) {
    let mut accepted = Vec::new();
    let mut total = 0usize;

    for mut chunk in chunks {
        if accepted.len() >= max_chunks {
            break;
        }
        chunk.content = truncate_chars(&chunk.content, max_chunk_chars);
        let len = chunk.content.chars().count();
        if total + len > max_total_chars {
            break;
        }
        total += len;
        accepted.push(chunk);
    }

    (accepted, total)
}
