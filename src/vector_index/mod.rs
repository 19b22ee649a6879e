//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the seam between the indexing pipeline and
//! whatever stores the vectors. Every operation is scoped to a namespace;
//! the pipeline uses one namespace per submission revision, so one
//! submission's vectors are never visible to another's queries, and an
//! earlier revision's vectors never answer for the current one.
//!
//! | Backend | Module | Notes |
//! |---------|--------|-------|
//! | `sqlite` | [`sqlite`] | BLOB vectors, brute-force cosine |
//! | `memory` | [`memory`] | process-local, for tests |
//! | `pinecone` | [`pinecone`] | hosted index over HTTP |

pub mod memory;
pub mod pinecone;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::IndexConfig;
use crate::models::{VectorMatch, VectorRecord};

pub use memory::InMemoryVectorIndex;
pub use pinecone::PineconeIndex;
pub use sqlite::SqliteVectorIndex;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records by id within `namespace`.
    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<()>;

    /// Return up to `top_k` nearest records in `namespace`, best first.
    async fn query(&self, namespace: &str, vector: &[f32], top_k: usize)
        -> Result<Vec<VectorMatch>>;
}

/// Build the configured backend.
pub fn create_index(config: &IndexConfig, pool: &SqlitePool) -> Result<Arc<dyn VectorIndex>> {
    match config.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteVectorIndex::new(pool.clone()))),
        "memory" => Ok(Arc::new(InMemoryVectorIndex::new())),
        "pinecone" => Ok(Arc::new(PineconeIndex::new(config)?)),
        other => anyhow::bail!("Unknown index backend: {}", other),
    }
}

/// Sort matches by descending score and keep the first `top_k`.
pub(crate) fn rank(mut matches: Vec<VectorMatch>, top_k: usize) -> Vec<VectorMatch> {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    matches.truncate(top_k);
    matches
}
