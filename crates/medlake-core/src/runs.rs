//! Job receipts in `raw.pipeline_runs` and the lock that serializes runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tokio::task;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{self, DbPool};
use crate::error::Result;
use crate::events::EventSink;
use crate::orchestrator::{JobRun, Orchestrator, PipelineStages, Trigger};

/// Advisory lock key shared by manual and scheduled runs.
pub const JOB_LOCK_KEY: i64 = 0x4D45444C414B45; // "MEDLAKE"

/// Inserts the receipt, or replaces it when the run was already recorded.
pub async fn record_run(pool: &DbPool, run: &JobRun) -> Result<()> {
    sqlx::query(
        r#"
            INSERT INTO raw.pipeline_runs
                (run_id, trigger, started_at, finished_at, outcome, receipt)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (run_id) DO UPDATE
            SET finished_at = EXCLUDED.finished_at,
                outcome = EXCLUDED.outcome,
                receipt = EXCLUDED.receipt
        "#,
    )
    .bind(run.run_id)
    .bind(run.trigger.as_str())
    .bind(run.started_at)
    .bind(run.finished_at)
    .bind(run.outcome.as_db_str())
    .bind(serde_json::to_value(run)?)
    .execute(pool)
    .await?;

    tracing::info!(run_id = %run.run_id, outcome = run.outcome.as_db_str(), "job run recorded");
    Ok(())
}

/// Session-level `pg_advisory_lock` held on a dedicated pool connection for
/// the length of one job.
pub struct JobLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
    acquired_at: DateTime<Utc>,
}

impl JobLock {
    /// Waits until no other run holds `key`. Logs once when it has to wait.
    pub async fn acquire(pool: &DbPool, key: i64) -> Result<Self> {
        if let Some(lock) = Self::try_acquire(pool, key).await? {
            return Ok(lock);
        }

        tracing::info!(key, "another job run holds the lock, waiting");
        let mut conn = pool.acquire().await?;
        sqlx::query::<Postgres>("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(conn.as_mut())
            .await?;
        Ok(Self::held(conn, key))
    }

    /// Returns `None` when another session holds the lock.
    pub async fn try_acquire(pool: &DbPool, key: i64) -> Result<Option<Self>> {
        let mut conn = pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(conn.as_mut())
            .await?;
        if !locked {
            return Ok(None);
        }
        Ok(Some(Self::held(conn, key)))
    }

    fn held(conn: PoolConnection<Postgres>, key: i64) -> Self {
        tracing::debug!(key, "job lock acquired");
        Self {
            conn: Some(conn),
            key,
            acquired_at: Utc::now(),
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            unlock(&mut conn, self.key).await?;
            let held_ms = (Utc::now() - self.acquired_at).num_milliseconds();
            tracing::debug!(key = self.key, held_ms, "job lock released");
        }
        Ok(())
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let key = self.key;
            task::spawn(async move {
                if let Err(err) = unlock(&mut conn, key).await {
                    tracing::warn!(key, error = %err, "failed to release job lock on drop");
                }
            });
        }
    }
}

async fn unlock(conn: &mut PoolConnection<Postgres>, key: i64) -> Result<()> {
    sqlx::query::<Postgres>("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .execute(conn.as_mut())
        .await?;
    Ok(())
}

/// A finished job plus what happened around it in the database.
#[derive(Debug)]
pub struct JobExecution {
    pub run: JobRun,
    pub locked: bool,
    pub recorded: bool,
}

/// Runs the stage graph once under [`JOB_LOCK_KEY`] and records its receipt.
///
/// When the database cannot be reached the graph still runs without the
/// lock: Collect proceeds and the stages that need the database fail under
/// their own names. Errors are returned only when the database is reachable
/// but migrating or locking fails.
pub async fn execute_job(
    stages: Arc<PipelineStages>,
    trigger: Trigger,
    cancel: &CancellationToken,
    sink: &dyn EventSink,
) -> Result<JobExecution> {
    let pool = match stages.pool().await {
        Ok(pool) => Some(pool.clone()),
        Err(err) => {
            tracing::warn!(error = %err, "database unavailable, running without the job lock");
            None
        }
    };

    let lock = match &pool {
        Some(pool) => {
            db::run_migrations(pool).await?;
            Some(JobLock::acquire(pool, JOB_LOCK_KEY).await?)
        }
        None => None,
    };

    let run = Orchestrator::new(stages).run(trigger, cancel, sink).await;
    let recorded = match &pool {
        Some(pool) => store_receipt(pool, &run).await,
        None => {
            tracing::warn!(run_id = %run.run_id, "job run not recorded: no database connection");
            false
        }
    };

    let locked = lock.is_some();
    if let Some(lock) = lock {
        if let Err(err) = lock.release().await {
            tracing::warn!(run_id = %run.run_id, error = %err, "failed to release job lock");
        }
    }

    Ok(JobExecution {
        run,
        locked,
        recorded,
    })
}

async fn store_receipt(pool: &DbPool, run: &JobRun) -> bool {
    match record_run(pool, run).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(run_id = %run.run_id, error = %err, "failed to record job run");
            false
        }
    }
}

/// Looks up the stored outcome of `run_id`.
pub async fn recorded_outcome(pool: &DbPool, run_id: Uuid) -> Result<Option<String>> {
    let outcome = sqlx::query_scalar("SELECT outcome FROM raw.pipeline_runs WHERE run_id = $1")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    Ok(outcome)
}
