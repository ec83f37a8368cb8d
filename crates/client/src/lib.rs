#![forbid(unsafe_code, clippy::unwrap_used)]
#![allow(clippy::needless_return)]

//! Single entry point the front-end and the CLI submit work through:
//! checks permission and rate limit, submits the job, waits for a
//! terminal row, and decodes the response into a typed result.

use std::time::Duration;

use livedb_model::{Error, OperationName, Principal};
use livedb_protocol::{Operation, OperationResult};
use livedb_queue::{NewJob, Queue};
use livedb_ratelimit::RateLimiter;
use tracing::warn;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Retries transient infrastructure failures (`QueueUnavailable`,
/// `BlobStoreUnavailable`) with capped exponential backoff. Every other
/// error, including the worker's own `Error` responses, is surfaced on
/// the first attempt.
fn is_retryable(err: &Error) -> bool {
  matches!(err, Error::QueueUnavailable(_) | Error::BlobStoreUnavailable(_))
}

pub struct Client {
  queue: Queue,
  rate_limiter: RateLimiter,
}

impl Client {
  pub fn new(queue: Queue, rate_limiter: RateLimiter) -> Self {
    Self { queue, rate_limiter }
  }

  /// Submits `operation` against `owner`/`name` on `target_node` as
  /// `principal`, then blocks until the worker's response arrives or
  /// `timeout` elapses.
  pub async fn dispatch(
    &self,
    principal: &Principal,
    target_node: &str,
    owner: &str,
    name: &str,
    operation: Operation,
    timeout: Duration,
  ) -> Result<OperationResult, Error> {
    let op_name = operation.name();
    livedb_queue::require_permission(principal, op_name)?;

    if let Some(api_key_id) = &principal.api_key_id {
      self.rate_limiter.check(api_key_id).await?;
    }

    let mut attempt = 0u32;
    loop {
      attempt += 1;
      match self
        .try_dispatch_once(principal, target_node, owner, name, op_name, &operation, timeout)
        .await
      {
        Ok(result) => return Ok(result),
        Err(e) if attempt < MAX_ATTEMPTS && is_retryable(&e) => {
          let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(4))).min(BACKOFF_CAP);
          warn!(attempt, error = %e, "retrying after transient dispatch failure");
          tokio::time::sleep(backoff).await;
        }
        Err(e) => return Err(e),
      }
    }
  }

  async fn try_dispatch_once(
    &self,
    principal: &Principal,
    target_node: &str,
    owner: &str,
    name: &str,
    op_name: OperationName,
    operation: &Operation,
    timeout: Duration,
  ) -> Result<OperationResult, Error> {
    let job_id = self
      .queue
      .submit(NewJob {
        target_node: target_node.to_string(),
        requesting_user: principal.username.clone(),
        owner: owner.to_string(),
        name: name.to_string(),
        operation: op_name,
        payload: operation.encode(),
      })
      .await?;

    let job = self.queue.await_response(job_id, timeout).await?;

    if job.state == livedb_model::JobState::Error {
      let message = job
        .response
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|v| v.as_str())
        .unwrap_or("job failed")
        .to_string();
      return Err(Error::Internal(message.into()));
    }

    let response = job.response.unwrap_or(serde_json::Value::Null);
    OperationResult::decode(op_name, &response)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn only_infra_errors_are_retryable() {
    assert!(is_retryable(&Error::QueueUnavailable("down".into())));
    assert!(is_retryable(&Error::BlobStoreUnavailable("down".into())));
    assert!(!is_retryable(&Error::RateLimited));
    assert!(!is_retryable(&Error::Validation("bad".into())));
    assert!(!is_retryable(&Error::WorkerLost));
  }
}
