/// Error taxonomy shared by every component of the job-dispatch subsystem.
///
/// Validation and permission errors are decided before a job is submitted;
/// everything else either rides back in a job's `response` column or is
/// produced by infra (queue/blob store) connectivity.
#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("validation error: {0}")]
  Validation(String),

  #[error("unauthorized: {0}")]
  Unauthorized(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("rate limited")]
  RateLimited,

  #[error("database is not live: {0}/{1}")]
  NotLive(String, String),

  #[error("worker lost the in-flight job")]
  WorkerLost,

  #[error("query cancelled: {0}")]
  QueryCancelled(String),

  #[error("queue unavailable: {0}")]
  QueueUnavailable(String),

  #[error("blob store unavailable: {0}")]
  BlobStoreUnavailable(String),

  #[error("request timed out")]
  Timeout,

  #[error("unknown operation: {0}")]
  UnknownOperation(String),

  #[error("internal error")]
  Internal(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
  /// A message safe to return to a caller. Internal details never cross
  /// this boundary; they're expected to already have been logged by the
  /// caller with `tracing::error!`.
  pub fn user_message(&self) -> String {
    match self {
      Error::Internal(_) => "internal error".to_string(),
      other => other.to_string(),
    }
  }

  pub fn is_idempotent_retry(&self) -> bool {
    matches!(
      self,
      Error::QueueUnavailable(_) | Error::BlobStoreUnavailable(_)
    )
  }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for Error {
  fn into_response(self) -> axum::response::Response {
    use axum::http::StatusCode;
    use axum::response::Json;

    let status = match &self {
      Error::Validation(_) | Error::UnknownOperation(_) => StatusCode::BAD_REQUEST,
      Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
      Error::NotFound(_) | Error::NotLive(..) => StatusCode::NOT_FOUND,
      Error::Conflict(_) => StatusCode::CONFLICT,
      Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
      Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
      Error::QueryCancelled(_) => StatusCode::REQUEST_TIMEOUT,
      Error::QueueUnavailable(_) | Error::BlobStoreUnavailable(_) => {
        StatusCode::SERVICE_UNAVAILABLE
      }
      Error::WorkerLost | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
      tracing::error!(error = %self, "internal error surfaced to caller");
    }

    (status, Json(serde_json::json!({ "error": self.user_message() }))).into_response()
  }
}

pub type Result<T> = std::result::Result<T, Error>;
