//! SQLite-backed [`StatusStore`].

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{now_rfc3339, StatusStore};
use crate::error::Result;
use crate::models::{IndexFailure, IndexStats, IndexStatus, IndexStatusRecord, RepoReference};

pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &SqliteRow) -> Result<IndexStatusRecord> {
    let status: String = row.get("status");
    let error_message: Option<String> = row.get("error_message");
    let error = error_message.map(|message| IndexFailure {
        message,
        detail: row.get::<Option<String>, _>("error_detail").unwrap_or_default(),
        failed_at: row.get::<Option<String>, _>("failed_at").unwrap_or_default(),
    });

    Ok(IndexStatusRecord {
        submission_id: row.get("submission_id"),
        repo: RepoReference {
            owner: row.get("owner"),
            repo: row.get("repo"),
            revision: row.get("revision"),
        },
        status: IndexStatus::parse(&status)?,
        stats: IndexStats {
            file_count: row.get::<i64, _>("file_count") as u64,
            chunk_count: row.get::<i64, _>("chunk_count") as u64,
            total_chars: row.get::<i64, _>("total_chars") as u64,
            files_skipped: row.get::<i64, _>("files_skipped") as u64,
        },
        error,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn register_submission(&self, submission_id: &str, repo: &RepoReference) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO submissions (submission_id, owner, repo, revision, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(submission_id) DO UPDATE SET
                owner = excluded.owner,
                repo = excluded.repo,
                revision = excluded.revision
            "#,
        )
        .bind(submission_id)
        .bind(&repo.owner)
        .bind(&repo.repo)
        .bind(&repo.revision)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_submission(&self, submission_id: &str) -> Result<Option<RepoReference>> {
        let row = sqlx::query("SELECT owner, repo, revision FROM submissions WHERE submission_id = ?")
            .bind(submission_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| RepoReference {
            owner: r.get("owner"),
            repo: r.get("repo"),
            revision: r.get("revision"),
        }))
    }

    async fn get(&self, submission_id: &str, revision: &str) -> Result<Option<IndexStatusRecord>> {
        let row = sqlx::query("SELECT * FROM index_status WHERE submission_id = ? AND revision = ?")
            .bind(submission_id)
            .bind(revision)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn ensure_queued(&self, submission_id: &str, repo: &RepoReference) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO index_status
                (submission_id, revision, owner, repo, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'queued', ?, ?)
            "#,
        )
        .bind(submission_id)
        .bind(&repo.revision)
        .bind(&repo.owner)
        .bind(&repo.repo)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_begin_indexing(&self, submission_id: &str, revision: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE index_status SET
                status = 'indexing',
                file_count = 0,
                chunk_count = 0,
                total_chars = 0,
                files_skipped = 0,
                error_message = NULL,
                error_detail = NULL,
                failed_at = NULL,
                updated_at = ?
            WHERE submission_id = ? AND revision = ? AND status IN ('queued', 'failed')
            "#,
        )
        .bind(now_rfc3339())
        .bind(submission_id)
        .bind(revision)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_ready(&self, submission_id: &str, revision: &str, stats: IndexStats) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE index_status SET
                status = 'ready',
                file_count = ?,
                chunk_count = ?,
                total_chars = ?,
                files_skipped = ?,
                updated_at = ?
            WHERE submission_id = ? AND revision = ?
            "#,
        )
        .bind(stats.file_count as i64)
        .bind(stats.chunk_count as i64)
        .bind(stats.total_chars as i64)
        .bind(stats.files_skipped as i64)
        .bind(now_rfc3339())
        .bind(submission_id)
        .bind(revision)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        submission_id: &str,
        revision: &str,
        failure: IndexFailure,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE index_status SET
                status = 'failed',
                error_message = ?,
                error_detail = ?,
                failed_at = ?,
                updated_at = ?
            WHERE submission_id = ? AND revision = ?
            "#,
        )
        .bind(&failure.message)
        .bind(&failure.detail)
        .bind(&failure.failed_at)
        .bind(now_rfc3339())
        .bind(submission_id)
        .bind(revision)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
