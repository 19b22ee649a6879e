//! SQLite-backed [`VectorIndex`].
//!
//! Vectors live in the `vectors` table as little-endian f32 BLOBs next to
//! their JSON metadata. Queries load every vector in the namespace and
//! rank by cosine similarity, which is adequate for a single submission's
//! worth of chunks.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::{rank, VectorIndex};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{VectorMatch, VectorMetadata, VectorRecord};

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        for record in records {
            let blob = vec_to_blob(&record.values);
            let metadata_json = serde_json::to_string(&record.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO vectors (namespace, id, dims, embedding, metadata_json, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(namespace, id) DO UPDATE SET
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    metadata_json = excluded.metadata_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(namespace)
            .bind(&record.id)
            .bind(record.values.len() as i64)
            .bind(&blob)
            .bind(&metadata_json)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        let rows = sqlx::query("SELECT id, embedding, metadata_json FROM vectors WHERE namespace = ?")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let metadata_json: String = row.get("metadata_json");
            let metadata: VectorMetadata = serde_json::from_str(&metadata_json)?;
            matches.push(VectorMatch {
                id: row.get("id"),
                score: cosine_similarity(vector, &blob_to_vec(&blob)),
                metadata,
            });
        }

        Ok(rank(matches, top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use tempfile::TempDir;

    fn record(id: &str, values: Vec<f32>, path: &str) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            values,
            metadata: VectorMetadata {
                submission_id: "s1".into(),
                owner: "acme".into(),
                repo: "widgets".into(),
                revision: "abcdef1".into(),
                file_path: path.into(),
                start_line: 1,
                end_line: 10,
                language: "rust".into(),
                content: "fn main() {}".into(),
            },
        }
    }

    async fn setup() -> (TempDir, SqliteVectorIndex) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("t.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (tmp, SqliteVectorIndex::new(pool))
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity() {
        let (_tmp, index) = setup().await;
        index
            .upsert(
                "ns",
                &[
                    record("a", vec![1.0, 0.0], "a.rs"),
                    record("b", vec![0.0, 1.0], "b.rs"),
                    record("c", vec![0.7, 0.7], "c.rs"),
                ],
            )
            .await
            .unwrap();

        let hits = index.query("ns", &[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "c");
        assert_eq!(hits[0].metadata.file_path, "a.rs");
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_namespaces_isolate() {
        let (_tmp, index) = setup().await;
        index.upsert("one", &[record("x", vec![1.0, 0.0], "old.rs")]).await.unwrap();
        index.upsert("one", &[record("x", vec![1.0, 0.0], "new.rs")]).await.unwrap();
        index.upsert("two", &[record("y", vec![1.0, 0.0], "other.rs")]).await.unwrap();

        let hits = index.query("one", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.file_path, "new.rs");
    }
}
