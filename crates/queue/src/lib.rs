#![forbid(unsafe_code, clippy::unwrap_used)]
#![allow(clippy::needless_return)]

//! Relational-store-backed job queue.
//!
//! Claims use a `FOR UPDATE SKIP LOCKED` CTE so two workers racing
//! `claim` on the same node never receive the same row. Wake-ups are a
//! two-layer design (DESIGN NOTES): `LISTEN`/`NOTIFY` is the fast path,
//! but every wake re-reads the row from the table — a missed or
//! coalesced notification never causes a stuck wait, only a late one
//! bounded by the fallback poll interval.

mod notify;

pub use notify::Notifier;

use chrono::{DateTime, Utc};
use livedb_model::job::{Job, JobState, OperationName};
use livedb_model::{Error, Principal};
use sqlx::PgPool;
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

/// Bounded poll interval used by `await_response` as a fallback against
/// a missed notification. The spec calls this out explicitly as a
/// required fallback, not an optimisation.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(600);

fn channel_for_node(node: &str) -> String {
  format!("livedb_queue_node_{node}")
}

fn channel_for_job(job_id: i64) -> String {
  format!("livedb_queue_job_{job_id}")
}

#[derive(Debug, Clone)]
pub struct NewJob {
  pub target_node: String,
  pub requesting_user: String,
  pub owner: String,
  pub name: String,
  pub operation: OperationName,
  pub payload: serde_json::Value,
}

pub struct Queue {
  pool: PgPool,
  notifier: Notifier,
}

impl Queue {
  pub async fn connect(pool: PgPool) -> Result<Self, Error> {
    let notifier = Notifier::connect(pool.clone())
      .await
      .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
    Ok(Self { pool, notifier })
  }

  pub fn pool(&self) -> &PgPool {
    &self.pool
  }

  /// Atomically inserts a `pending` row, then publishes a wake-up on
  /// the channel keyed by `target_node`.
  pub async fn submit(&self, job: NewJob) -> Result<i64, Error> {
    let correlation_id = Uuid::new_v4();

    let row = sqlx::query(
      r#"
      INSERT INTO job_queue
        (target_node, requesting_user, owner, name, operation, payload, state,
         correlation_id, submitted_at)
      VALUES
        ($1, $2, $3, $4, $5, $6, 'pending', $7, NOW())
      RETURNING job_id
      "#,
    )
    .bind(&job.target_node)
    .bind(&job.requesting_user)
    .bind(&job.owner)
    .bind(&job.name)
    .bind(job.operation.as_str())
    .bind(&job.payload)
    .bind(correlation_id)
    .fetch_one(&self.pool)
    .await
    .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

    let job_id: i64 = row.try_get("job_id").map_err(|e| Error::Internal(e.into()))?;

    sqlx::query("SELECT pg_notify($1, $2)")
      .bind(channel_for_node(&job.target_node))
      .bind(job_id.to_string())
      .execute(&self.pool)
      .await
      .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

    Ok(job_id)
  }

  /// Atomically selects one `pending` row targeting `node`, locks it
  /// with skip-locked semantics, flips it to `in_progress`, and returns
  /// it. FIFO per node, best effort, ties broken by `job_id`.
  pub async fn claim(&self, node: &str) -> Result<Option<Job>, Error> {
    self.claim_matching(node, None).await
  }

  /// Like [`Queue::claim`], but only considers jobs whose operation is
  /// (or isn't) `op`. Used to split the general worker pool from the
  /// dedicated `create` worker (spec.md §4.4) without either one
  /// stealing the other's jobs.
  pub async fn claim_excluding(&self, node: &str, op: OperationName) -> Result<Option<Job>, Error> {
    self.claim_matching(node, Some((op, false))).await
  }

  pub async fn claim_only(&self, node: &str, op: OperationName) -> Result<Option<Job>, Error> {
    self.claim_matching(node, Some((op, true))).await
  }

  async fn claim_matching(
    &self,
    node: &str,
    op_filter: Option<(OperationName, bool)>,
  ) -> Result<Option<Job>, Error> {
    let op_clause = match op_filter {
      Some((_, true)) => "AND operation = $2",
      Some((_, false)) => "AND operation <> $2",
      None => "",
    };

    let query = format!(
      r#"
      WITH next_job AS (
        SELECT job_id
        FROM job_queue
        WHERE state = 'pending' AND target_node = $1 {op_clause}
        ORDER BY job_id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
      )
      UPDATE job_queue
      SET state = 'in_progress', taken_at = NOW()
      FROM next_job
      WHERE job_queue.job_id = next_job.job_id
      RETURNING job_queue.job_id, job_queue.correlation_id, job_queue.target_node,
                job_queue.requesting_user, job_queue.owner, job_queue.name,
                job_queue.operation, job_queue.payload, job_queue.state,
                job_queue.submitted_at, job_queue.taken_at, job_queue.completed_at,
                job_queue.response
      "#
    );

    let mut q = sqlx::query(&query).bind(node);
    if let Some((op, _)) = op_filter {
      q = q.bind(op.as_str());
    }

    let row = q
      .fetch_optional(&self.pool)
      .await
      .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

    row.map(row_to_job).transpose()
  }

  pub async fn complete(&self, job_id: i64, response: serde_json::Value) -> Result<(), Error> {
    self.finish(job_id, JobState::Complete, response).await
  }

  pub async fn fail(&self, job_id: i64, error: &Error) -> Result<(), Error> {
    let response = serde_json::json!({ "error": error.user_message() });
    self.finish(job_id, JobState::Error, response).await
  }

  async fn finish(
    &self,
    job_id: i64,
    state: JobState,
    response: serde_json::Value,
  ) -> Result<(), Error> {
    let state_str = match state {
      JobState::Complete => "complete",
      JobState::Error => "error",
      _ => unreachable!("finish only transitions to a terminal state"),
    };

    sqlx::query(
      r#"
      UPDATE job_queue
      SET state = $1, response = $2, completed_at = NOW()
      WHERE job_id = $3
      "#,
    )
    .bind(state_str)
    .bind(&response)
    .bind(job_id)
    .execute(&self.pool)
    .await
    .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

    sqlx::query("SELECT pg_notify($1, $2)")
      .bind(channel_for_job(job_id))
      .bind(job_id.to_string())
      .execute(&self.pool)
      .await
      .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

    Ok(())
  }

  /// Blocks until `job_id`'s row reaches a terminal state or `timeout`
  /// fires. Subscribes to the per-job channel first, then re-reads the
  /// row on every wake-up (including the bounded poll fallback) — never
  /// trusts the notification payload alone.
  pub async fn await_response(&self, job_id: i64, timeout: Duration) -> Result<Job, Error> {
    let mut rx = self.notifier.subscribe(channel_for_job(job_id)).await;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
      if let Some(job) = self.read_job(job_id).await? {
        if job.state.is_terminal() {
          return Ok(job);
        }
      }

      let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
      if remaining.is_zero() {
        return Err(Error::Timeout);
      }

      let wait = remaining.min(DEFAULT_POLL_INTERVAL);
      let _ = tokio::time::timeout(wait, rx.recv()).await;
    }
  }

  async fn read_job(&self, job_id: i64) -> Result<Option<Job>, Error> {
    let row = sqlx::query(
      r#"
      SELECT job_id, correlation_id, target_node, requesting_user, owner, name,
             operation, payload, state, submitted_at, taken_at, completed_at, response
      FROM job_queue
      WHERE job_id = $1
      "#,
    )
    .bind(job_id)
    .fetch_optional(&self.pool)
    .await
    .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

    row.map(row_to_job).transpose()
  }

  /// Deletes terminal rows older than the grace window.
  pub async fn reap(&self, older_than: Duration) -> Result<u64, Error> {
    let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
    let result = sqlx::query(
      r#"
      DELETE FROM job_queue
      WHERE state IN ('complete', 'error') AND completed_at < $1
      "#,
    )
    .bind(cutoff)
    .execute(&self.pool)
    .await
    .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

    Ok(result.rows_affected())
  }

  /// Recovery sweep: reclaims `in_progress` jobs targeting `node` whose
  /// `taken_at` predates the visibility timeout. Idempotent operations
  /// go back to `pending`; non-idempotent ones are failed with
  /// `WorkerLost`.
  pub async fn reenqueue_orphaned(
    &self,
    node: &str,
    visibility_timeout: Duration,
  ) -> Result<u64, Error> {
    let cutoff = Utc::now() - chrono::Duration::from_std(visibility_timeout).unwrap_or_default();

    let rows = sqlx::query(
      r#"
      SELECT job_id, operation
      FROM job_queue
      WHERE state = 'in_progress' AND target_node = $1 AND taken_at < $2
      "#,
    )
    .bind(node)
    .bind(cutoff)
    .fetch_all(&self.pool)
    .await
    .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

    let mut reclaimed = 0u64;
    for row in rows {
      let job_id: i64 = row.try_get("job_id").map_err(|e| Error::Internal(e.into()))?;
      let op_str: String = row.try_get("operation").map_err(|e| Error::Internal(e.into()))?;
      let idempotent = OperationName::from_str(&op_str)
        .map(|op| op.is_idempotent())
        .unwrap_or(false);

      if idempotent {
        sqlx::query(
          "UPDATE job_queue SET state = 'pending', taken_at = NULL WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
      } else {
        self.fail(job_id, &Error::WorkerLost).await?;
      }
      reclaimed += 1;
    }

    Ok(reclaimed)
  }
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<Job, Error> {
  let state_str: String = row.try_get("state").map_err(|e| Error::Internal(e.into()))?;
  let state = match state_str.as_str() {
    "pending" => JobState::Pending,
    "in_progress" => JobState::InProgress,
    "complete" => JobState::Complete,
    "error" => JobState::Error,
    other => return Err(Error::Internal(format!("unknown job state: {other}").into())),
  };

  let op_str: String = row.try_get("operation").map_err(|e| Error::Internal(e.into()))?;
  let operation = OperationName::from_str(&op_str)
    .ok_or_else(|| Error::Internal(format!("unknown operation in storage: {op_str}").into()))?;

  Ok(Job {
    job_id: row.try_get("job_id").map_err(|e| Error::Internal(e.into()))?,
    correlation_id: row.try_get("correlation_id").map_err(|e| Error::Internal(e.into()))?,
    target_node: row.try_get("target_node").map_err(|e| Error::Internal(e.into()))?,
    requesting_user: row.try_get("requesting_user").map_err(|e| Error::Internal(e.into()))?,
    owner: row.try_get("owner").map_err(|e| Error::Internal(e.into()))?,
    name: row.try_get("name").map_err(|e| Error::Internal(e.into()))?,
    operation,
    payload: row.try_get("payload").map_err(|e| Error::Internal(e.into()))?,
    state,
    submitted_at: row.try_get::<DateTime<Utc>, _>("submitted_at").map_err(|e| Error::Internal(e.into()))?,
    taken_at: row.try_get("taken_at").map_err(|e| Error::Internal(e.into()))?,
    completed_at: row.try_get("completed_at").map_err(|e| Error::Internal(e.into()))?,
    response: row.try_get("response").map_err(|e| Error::Internal(e.into()))?,
  })
}

/// Computes whether `principal` is allowed to submit `operation` for
/// `owner`/`name`, independent of any rate limiting. Permission checks
/// happen here, before `submit`, per the error-handling policy.
pub fn require_permission(
  principal: &Principal,
  operation: OperationName,
) -> Result<(), Error> {
  use livedb_model::Permission;

  let required = match operation {
    OperationName::Execute
    | OperationName::Create
    | OperationName::Delete
    | OperationName::Backup => Permission::ReadWrite,
    _ => Permission::ReadOnly,
  };

  principal.require(required)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn execute_requires_read_write() {
    let ro = Principal {
      username: "alice".into(),
      permission: livedb_model::Permission::ReadOnly,
      api_key_id: None,
    };
    assert!(require_permission(&ro, OperationName::Query).is_ok());
    assert!(require_permission(&ro, OperationName::Execute).is_err());
  }
}
