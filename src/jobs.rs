//! Ingestion job store: creation, exclusive leasing, state transitions,
//! and per-connector checkpoints.
//!
//! The `jobs` table carries a partial unique index on `connector_id`
//! over pending/running rows, so at most one active job exists per
//! connector. Leasing is a conditional UPDATE; whichever worker's
//! update sticks owns the job.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{IngestionJob, JobStatus};

/// Create a pending job for the connector, or hand back the already
/// active one. The boolean is true when a new job was created.
pub async fn enqueue(pool: &SqlitePool, connector_id: &str) -> Result<(IngestionJob, bool)> {
    let checkpoint = get_checkpoint(pool, connector_id).await?;
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    let inserted = sqlx::query(
        r#"
        INSERT INTO jobs (id, connector_id, status, checkpoint, created_at)
        VALUES (?, ?, 'pending', ?, ?)
        "#,
    )
    .bind(&id)
    .bind(connector_id)
    .bind(checkpoint)
    .bind(now)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {
            let job = get(pool, &id)
                .await?
                .ok_or_else(|| sqlx::Error::RowNotFound)?;
            Ok((job, true))
        }
        Err(err) if is_unique_violation(&err) => {
            let job = active_for_connector(pool, connector_id)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            Ok((job, false))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn get(pool: &SqlitePool, job_id: &str) -> Result<Option<IngestionJob>> {
    let row = sqlx::query(
        "SELECT id, connector_id, status, checkpoint, started_at, finished_at, error_message, lease_expires_at
         FROM jobs WHERE id = ?",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(job_from_row))
}

pub async fn active_for_connector(
    pool: &SqlitePool,
    connector_id: &str,
) -> Result<Option<IngestionJob>> {
    let row = sqlx::query(
        "SELECT id, connector_id, status, checkpoint, started_at, finished_at, error_message, lease_expires_at
         FROM jobs WHERE connector_id = ? AND status IN ('pending', 'running')",
    )
    .bind(connector_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(job_from_row))
}

/// The connector's most recent job of any status, if it has ever run.
pub async fn last_for_connector(
    pool: &SqlitePool,
    connector_id: &str,
) -> Result<Option<IngestionJob>> {
    let row = sqlx::query(
        "SELECT id, connector_id, status, checkpoint, started_at, finished_at, error_message, lease_expires_at
         FROM jobs WHERE connector_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(connector_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(job_from_row))
}

/// Most recent jobs, newest first.
pub async fn list(pool: &SqlitePool, limit: i64) -> Result<Vec<IngestionJob>> {
    let rows = sqlx::query(
        "SELECT id, connector_id, status, checkpoint, started_at, finished_at, error_message, lease_expires_at
         FROM jobs ORDER BY created_at DESC, id LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(job_from_row).collect())
}

/// Claim the oldest pending job: `pending → running` with a fresh lease.
/// The conditional UPDATE guarantees at most one worker wins a given
/// job even when several poll at once. Returns None when nothing is
/// pending.
pub async fn lease_next(pool: &SqlitePool, lease_secs: i64) -> Result<Option<IngestionJob>> {
    loop {
        let candidate: Option<String> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE status = 'pending' ORDER BY created_at, id LIMIT 1",
        )
        .fetch_optional(pool)
        .await?;

        let job_id = match candidate {
            Some(id) => id,
            None => return Ok(None),
        };

        let now = chrono::Utc::now().timestamp();
        let claimed = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ?, lease_expires_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(now + lease_secs)
        .bind(&job_id)
        .execute(pool)
        .await?;

        if claimed.rows_affected() == 1 {
            return get(pool, &job_id).await;
        }
        // Another worker claimed it first; look again
    }
}

/// Claim a specific pending job. Returns false if it is no longer
/// pending (already claimed, finished, or never existed).
pub async fn lease(pool: &SqlitePool, job_id: &str, lease_secs: i64) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let claimed = sqlx::query(
        "UPDATE jobs SET status = 'running', started_at = ?, lease_expires_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(now)
    .bind(now + lease_secs)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(claimed.rows_affected() == 1)
}

/// Extend a running job's lease. Returns false if the job is no longer
/// running (finished, or reclaimed out from under the worker).
pub async fn renew_lease(pool: &SqlitePool, job_id: &str, lease_secs: i64) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let renewed = sqlx::query(
        "UPDATE jobs SET lease_expires_at = ? WHERE id = ? AND status = 'running'",
    )
    .bind(now + lease_secs)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(renewed.rows_affected() == 1)
}

/// Finish a running job. Returns false if the job was reclaimed first,
/// in which case the terminal state set by the reclaimer stands.
pub async fn finish(
    pool: &SqlitePool,
    job_id: &str,
    status: JobStatus,
    checkpoint: i64,
    error_message: Option<&str>,
) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let updated = sqlx::query(
        r#"
        UPDATE jobs SET
            status = ?,
            checkpoint = ?,
            finished_at = ?,
            error_message = ?,
            lease_expires_at = NULL
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(status.as_str())
    .bind(checkpoint)
    .bind(now)
    .bind(error_message)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Mark running jobs whose lease lapsed as failed so their connectors
/// can be scheduled again. Returns how many were reclaimed.
pub async fn reclaim_expired(pool: &SqlitePool) -> Result<u64> {
    let now = chrono::Utc::now().timestamp();
    let reclaimed = sqlx::query(
        r#"
        UPDATE jobs SET
            status = 'failed',
            finished_at = ?,
            error_message = 'lease expired; reclaimed',
            lease_expires_at = NULL
        WHERE status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?
        "#,
    )
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    let count = reclaimed.rows_affected();
    if count > 0 {
        tracing::warn!(count, "reclaimed expired job leases");
    }
    Ok(count)
}

/// Last fully processed event timestamp for a connector, 0 when the
/// connector has never synced.
pub async fn get_checkpoint(pool: &SqlitePool, connector_id: &str) -> Result<i64> {
    let checkpoint: Option<i64> =
        sqlx::query_scalar("SELECT last_event_ts FROM checkpoints WHERE connector_id = ?")
            .bind(connector_id)
            .fetch_optional(pool)
            .await?;
    Ok(checkpoint.unwrap_or(0))
}

/// Advance a connector's checkpoint. Monotonic: a value older than the
/// stored one is ignored, so a slow worker can never rewind progress.
pub async fn set_checkpoint(pool: &SqlitePool, connector_id: &str, last_event_ts: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (connector_id, last_event_ts, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(connector_id) DO UPDATE SET
            last_event_ts = MAX(checkpoints.last_event_ts, excluded.last_event_ts),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(connector_id)
    .bind(last_event_ts)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drop a connector's checkpoint entirely so the next sync refetches
/// from the beginning of history. Used by `sync --full`.
pub async fn reset_checkpoint(pool: &SqlitePool, connector_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM checkpoints WHERE connector_id = ?")
        .bind(connector_id)
        .execute(pool)
        .await?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

fn job_from_row(row: &SqliteRow) -> IngestionJob {
    let status_str: String = row.get("status");
    IngestionJob {
        id: row.get("id"),
        connector_id: row.get("connector_id"),
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Failed),
        checkpoint: row.get("checkpoint"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        error_message: row.get("error_message"),
        lease_expires_at: row.get("lease_expires_at"),
    }
}
