//! Durable job queue on the relational store.
//!
//! A single `refinery_jobs` table with `FOR UPDATE SKIP LOCKED` pops,
//! so concurrent workers never hand the same job to two consumers. The
//! queue carries no authoritative state; the document stage column does.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;
use crate::traits::queue::JobQueue;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Postgres-backed FIFO job queues.
pub struct PostgresQueue {
    pool: PgPool,
}

impl PostgresQueue {
    /// Create the queue over an existing pool, ensuring the table
    /// exists.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refinery_jobs (
                id BIGSERIAL PRIMARY KEY,
                queue_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_refinery_jobs_queue ON refinery_jobs(queue_name, id)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn try_pop(&self, queue: &str) -> Result<Option<String>> {
        let payload: Option<String> = sqlx::query_scalar(
            r#"
            DELETE FROM refinery_jobs
            WHERE id = (
                SELECT id FROM refinery_jobs
                WHERE queue_name = $1
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING payload
            "#,
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payload)
    }
}

#[async_trait]
impl JobQueue for PostgresQueue {
    async fn push(&self, queue: &str, payload: &str) -> Result<()> {
        sqlx::query("INSERT INTO refinery_jobs (queue_name, payload) VALUES ($1, $2)")
            .bind(queue)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.try_pop(queue).await? {
                return Ok(Some(payload));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
        }
    }

    async fn depth(&self, queue: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM refinery_jobs WHERE queue_name = $1")
                .bind(queue)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }
}
