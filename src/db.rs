//! Database pool construction and schema migration.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_jobs (
            id UUID PRIMARY KEY,
            name VARCHAR(63) NOT NULL UNIQUE,
            account_id TEXT NOT NULL,
            parameters JSONB NOT NULL,
            has_input_file BOOLEAN NOT NULL DEFAULT FALSE,
            status VARCHAR(16) NOT NULL,
            created TIMESTAMPTZ NOT NULL,
            start_time TIMESTAMPTZ,
            stop_time TIMESTAMPTZ,
            output_file_url TEXT,
            last_pod_response JSONB
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_batch_jobs_status ON batch_jobs(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_batch_jobs_created ON batch_jobs(created DESC)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
