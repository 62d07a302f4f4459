//! Batch job persistence.
//!
//! The database is the authoritative record of intent and observed status;
//! all status transitions made by the reconciler and the cancel endpoint go
//! through [`JobStore::transition`], a compare-and-set on the current status,
//! so concurrent writers converge on a single terminal state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{BatchJob, BatchJobParameters, BatchJobStatus};

/// Persistence operations for batch job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a fresh record. Fails with `InvalidParameters` when the name is
    /// already taken.
    async fn insert(&self, job: &BatchJob) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<BatchJob>>;

    async fn list_by_status(&self, status: BatchJobStatus) -> Result<Vec<BatchJob>>;

    /// All records the reconciler cares about: `created`, `running`,
    /// `cleaning`.
    async fn list_unfinished(&self) -> Result<Vec<BatchJob>>;

    /// Compare-and-set the status. Returns `true` when this call performed
    /// the transition, `false` when the record was no longer in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: BatchJobStatus,
        to: BatchJobStatus,
    ) -> Result<bool>;

    async fn set_start_time(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn set_stop_time(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn set_output_file_url(&self, id: Uuid, url: &str) -> Result<()>;

    async fn set_last_pod_response(&self, id: Uuid, response: serde_json::Value) -> Result<()>;
}

/// Postgres-backed store.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "id, name, account_id, parameters, has_input_file, status, \
                              created, start_time, stop_time, output_file_url, last_pod_response";

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &BatchJob) -> Result<()> {
        let parameters = serde_json::to_value(&job.job_parameters)
            .map_err(|e| Error::InvalidState(format!("unserializable parameters: {e}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO batch_jobs
                (id, name, account_id, parameters, has_input_file, status, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.account_id)
        .bind(parameters)
        .bind(job.has_input_file)
        .bind(job.status.as_str())
        .bind(job.created)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(Error::invalid_field("name", "Fields must be unique: name."))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<BatchJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM batch_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BatchJob::try_from).transpose()
    }

    async fn list_by_status(&self, status: BatchJobStatus) -> Result<Vec<BatchJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM batch_jobs WHERE status = $1 ORDER BY created DESC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BatchJob::try_from).collect()
    }

    async fn list_unfinished(&self) -> Result<Vec<BatchJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM batch_jobs \
             WHERE status IN ('created', 'running', 'cleaning') ORDER BY created ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BatchJob::try_from).collect()
    }

    async fn transition(
        &self,
        id: Uuid,
        from: BatchJobStatus,
        to: BatchJobStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE batch_jobs SET status = $1 WHERE id = $2 AND status = $3",
        )
        .bind(to.as_str())
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_start_time(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE batch_jobs SET start_time = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_stop_time(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE batch_jobs SET stop_time = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_output_file_url(&self, id: Uuid, url: &str) -> Result<()> {
        sqlx::query("UPDATE batch_jobs SET output_file_url = $1 WHERE id = $2")
            .bind(url)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_last_pod_response(&self, id: Uuid, response: serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE batch_jobs SET last_pod_response = $1 WHERE id = $2")
            .bind(response)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =========================================================================
// Row mapping
// =========================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    account_id: String,
    parameters: serde_json::Value,
    has_input_file: bool,
    status: String,
    created: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    output_file_url: Option<String>,
    last_pod_response: Option<serde_json::Value>,
}

impl TryFrom<JobRow> for BatchJob {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<BatchJob> {
        let status = BatchJobStatus::parse(&row.status)
            .ok_or_else(|| Error::InvalidState(format!("unknown status '{}'", row.status)))?;
        let job_parameters: BatchJobParameters = serde_json::from_value(row.parameters)
            .map_err(|e| Error::InvalidState(format!("corrupt parameters: {e}")))?;

        Ok(BatchJob {
            id: row.id,
            name: row.name,
            account_id: row.account_id,
            job_parameters,
            has_input_file: row.has_input_file,
            status,
            created: row.created,
            start_time: row.start_time,
            stop_time: row.stop_time,
            output_file_url: row.output_file_url,
            last_pod_response: row.last_pod_response,
        })
    }
}

// =========================================================================
// In-memory store for tests
// =========================================================================
