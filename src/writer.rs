//! Embedding and index writing.
//!
//! Turns chunks into [`VectorRecord`]s and upserts them into the
//! namespace of the submission's revision. Embedding calls and upserts are batched
//! independently and issued one batch at a time.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::config::{EmbeddingConfig, IndexConfig};
use crate::embedding::Embedder;
use crate::error::{IndexError, Result};
use crate::models::{Chunk, RepoReference, VectorMetadata, VectorRecord};
use crate::vector_index::VectorIndex;

const MAX_ID_BYTES: usize = 512;

/// Vector index namespace holding one submission revision's vectors.
///
/// Every namespace belongs to exactly one submission. A re-registered
/// revision gets a fresh namespace, so files deleted since an earlier
/// revision can never be retrieved against the new one.
pub fn namespace_for(submission_id: &str, revision: &str) -> String {
    format!("{}@{}", submission_id, revision)
}

/// Text sent to the embedder for a chunk: a small header naming the file
/// and line range, then the content.
pub fn embedding_input(chunk: &Chunk) -> String {
    format!(
        "File: {}\nLines: {}-{}\n\n{}",
        chunk.file_path, chunk.start_line, chunk.end_line, chunk.content
    )
}

/// Deterministic vector id: `{submission}:{path}:{start}-{end}`.
///
/// Path characters outside `[A-Za-z0-9/._-]` become `_`. Ids longer than
/// 512 bytes use a SHA-256 prefix of the path instead.
pub fn vector_id(submission_id: &str, chunk: &Chunk) -> String {
    let sanitized: String = chunk
        .file_path
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let id = format!(
        "{}:{}:{}-{}",
        submission_id, sanitized, chunk.start_line, chunk.end_line
    );
    if id.len() <= MAX_ID_BYTES {
        return id;
    }

    let mut hasher = Sha256::new();
    hasher.update(chunk.file_path.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    format!(
        "{}:{}:{}-{}",
        submission_id,
        &hash[..32],
        chunk.start_line,
        chunk.end_line
    )
}

/// First `max_chars` characters of `s`.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}

pub struct IndexWriter {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    embed_batch_size: usize,
    upsert_batch_size: usize,
    metadata_content_chars: usize,
}

impl IndexWriter {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        embedding: &EmbeddingConfig,
        index_config: &IndexConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            embed_batch_size: embedding.batch_size.max(1),
            upsert_batch_size: index_config.upsert_batch_size.max(1),
            metadata_content_chars: index_config.metadata_content_chars,
        }
    }

    /// Embed and upsert every chunk. Returns the number of vectors written.
    pub async fn write(
        &self,
        submission_id: &str,
        repo: &RepoReference,
        chunks: &[Chunk],
    ) -> Result<usize> {
        let namespace = namespace_for(submission_id, &repo.revision);
        let mut pending: Vec<VectorRecord> = Vec::with_capacity(self.upsert_batch_size);
        let mut written = 0usize;

        for (batch_no, batch) in chunks.chunks(self.embed_batch_size).enumerate() {
            let inputs: Vec<String> = batch.iter().map(embedding_input).collect();
            let vectors = self
                .embedder
                .embed(&inputs)
                .await
                .map_err(|e| IndexError::Embedding(format!("{:#}", e)))?;

            if vectors.len() != batch.len() {
                return Err(IndexError::Embedding(format!(
                    "embedder returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            debug!(submission_id, batch = batch_no, size = batch.len(), "embedded batch");

            for (chunk, values) in batch.iter().zip(vectors) {
                pending.push(self.record(submission_id, repo, chunk, values));
                if pending.len() >= self.upsert_batch_size {
                    written += self.flush(&namespace, &mut pending).await?;
                }
            }
        }

        written += self.flush(&namespace, &mut pending).await?;
        Ok(written)
    }

    fn record(
        &self,
        submission_id: &str,
        repo: &RepoReference,
        chunk: &Chunk,
        values: Vec<f32>,
    ) -> VectorRecord {
        VectorRecord {
            id: vector_id(submission_id, chunk),
            values,
            metadata: VectorMetadata {
                submission_id: submission_id.to_string(),
                owner: repo.owner.clone(),
                repo: repo.repo.clone(),
                revision: repo.revision.clone(),
                file_path: chunk.file_path.clone(),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                language: chunk.language.clone(),
                content: truncate_chars(&chunk.content, self.metadata_content_chars),
            },
        }
    }

    async fn flush(&self, namespace: &str, pending: &mut Vec<VectorRecord>) -> Result<usize> {
        if pending.is_empty() {
            return Ok(0);
        }
        let count = pending.len();
        self.index
            .upsert(namespace, pending)
            .await
            .map_err(|e| IndexError::VectorIndex(format!("{:#}", e)))?;
        debug!(namespace, count, "upserted vectors");
        pending.clear();
        Ok(count)
    }
}
