//! Relational persistence for normalized records.
//!
//! One idempotent operation: `upsert` replaces the whole record set for a
//! document inside a single transaction. Because the queue is at-least-once,
//! the same document may be committed again after a crash between commit and
//! cleanup; replace-wholesale makes the second commit a no-op in effect.

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::NormalizedRecord;

/// Outcome of a successful upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub rows: u64,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Worth retrying: the message stays on the queue.
    #[error("transient repository error: {0}")]
    Transient(String),

    /// Not worth retrying: schema or data problem.
    #[error("permanent repository error: {0}")]
    Permanent(String),
}

/// Trait abstracting the relational store.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Atomically replace all records stored under `document_id`.
    ///
    /// Either every record in `records` is visible afterwards or none is;
    /// re-invocation with the same input yields the same stored state.
    async fn upsert(
        &self,
        document_id: &str,
        records: &[NormalizedRecord],
        degraded: bool,
    ) -> Result<CommitResult, RepositoryError>;

    /// Whether a commit exists for `document_id`. Diagnostics only; the
    /// worker relies on upsert idempotency, never on a pre-check.
    async fn exists(&self, document_id: &str) -> Result<bool, RepositoryError>;
}

const CREATE_DOCUMENTS: &str = "\
CREATE TABLE IF NOT EXISTS documents (
    document_id  text PRIMARY KEY,
    record_count bigint NOT NULL,
    degraded     boolean NOT NULL,
    committed_at timestamptz NOT NULL DEFAULT now()
)";

const CREATE_RECORDS: &str = "\
CREATE TABLE IF NOT EXISTS document_records (
    document_id text NOT NULL REFERENCES documents (document_id) ON DELETE CASCADE,
    page        integer NOT NULL,
    row_index   integer NOT NULL,
    fields      jsonb NOT NULL,
    PRIMARY KEY (document_id, page, row_index)
)";

/// Postgres-backed repository.
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: sqlx::PgPool,
}

impl PgRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::query(CREATE_DOCUMENTS)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        sqlx::query(CREATE_RECORDS)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn upsert(
        &self,
        document_id: &str,
        records: &[NormalizedRecord],
        degraded: bool,
    ) -> Result<CommitResult, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        sqlx::query(
            "INSERT INTO documents (document_id, record_count, degraded, committed_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (document_id) DO UPDATE
             SET record_count = EXCLUDED.record_count,
                 degraded = EXCLUDED.degraded,
                 committed_at = EXCLUDED.committed_at",
        )
        .bind(document_id)
        .bind(records.len() as i64)
        .bind(degraded)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        sqlx::query("DELETE FROM document_records WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        for record in records {
            let fields = serde_json::to_value(&record.fields)
                .map_err(|err| RepositoryError::Permanent(err.to_string()))?;
            sqlx::query(
                "INSERT INTO document_records (document_id, page, row_index, fields)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(document_id)
            .bind(record.page as i32)
            .bind(record.row as i32)
            .bind(fields)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        Ok(CommitResult {
            rows: records.len() as u64,
        })
    }

    async fn exists(&self, document_id: &str) -> Result<bool, RepositoryError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM documents WHERE document_id = $1)")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)
    }
}

/// Connection-level failures are retryable; errors the database itself
/// reports (constraint, type, syntax) are not, except the SQLSTATEs that
/// signal a transient condition and resolve on retry.
fn classify(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            if is_transient_sqlstate(db_err.code().as_deref()) {
                RepositoryError::Transient(db_err.to_string())
            } else {
                RepositoryError::Permanent(db_err.to_string())
            }
        }
        other => RepositoryError::Transient(other.to_string()),
    }
}

/// 40001 serialization_failure, 40P01 deadlock_detected, 57P03
/// cannot_connect_now: all clear on their own under redelivery.
fn is_transient_sqlstate(code: Option<&str>) -> bool {
    matches!(code, Some("40001") | Some("40P01") | Some("57P03"))
}
