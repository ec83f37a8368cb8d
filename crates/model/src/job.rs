use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed operation vocabulary a job can carry. Idempotence governs
/// how the recovery sweep treats a job abandoned mid-flight: idempotent
/// operations are safe to re-claim and re-run, non-idempotent ones are
/// failed with `WorkerLost` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationName {
  Create,
  Delete,
  Backup,
  Columns,
  Tables,
  Views,
  Indexes,
  Query,
  Execute,
  Rowdata,
  Size,
}

impl OperationName {
  pub fn as_str(self) -> &'static str {
    match self {
      OperationName::Create => "create",
      OperationName::Delete => "delete",
      OperationName::Backup => "backup",
      OperationName::Columns => "columns",
      OperationName::Tables => "tables",
      OperationName::Views => "views",
      OperationName::Indexes => "indexes",
      OperationName::Query => "query",
      OperationName::Execute => "execute",
      OperationName::Rowdata => "rowdata",
      OperationName::Size => "size",
    }
  }

  pub fn from_str(s: &str) -> Option<Self> {
    Some(match s {
      "create" => OperationName::Create,
      "delete" => OperationName::Delete,
      "backup" => OperationName::Backup,
      "columns" => OperationName::Columns,
      "tables" => OperationName::Tables,
      "views" => OperationName::Views,
      "indexes" => OperationName::Indexes,
      "query" => OperationName::Query,
      "execute" => OperationName::Execute,
      "rowdata" => OperationName::Rowdata,
      "size" => OperationName::Size,
      _ => return None,
    })
  }

  /// `true` if re-running this operation after an abandoned claim cannot
  /// double-apply an effect. `query` is listed here only for read-only
  /// execution; a `query` containing side effects is out of scope (the
  /// worker enforces read-only at the connection level, see
  /// `livedb-worker`).
  pub fn is_idempotent(self) -> bool {
    matches!(
      self,
      OperationName::Columns
        | OperationName::Tables
        | OperationName::Views
        | OperationName::Indexes
        | OperationName::Size
        | OperationName::Backup
        | OperationName::Query
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
  Pending,
  InProgress,
  Complete,
  Error,
}

impl JobState {
  pub fn is_terminal(self) -> bool {
    matches!(self, JobState::Complete | JobState::Error)
  }
}

/// Persisted job envelope. `payload`/`response` are opaque structured
/// blobs at this layer; `livedb-protocol` gives them a fully-typed shape
/// at the edges (submitter encodes, worker decodes once after `claim`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
  pub job_id: i64,
  pub correlation_id: uuid::Uuid,
  pub target_node: String,
  pub requesting_user: String,
  pub owner: String,
  pub name: String,
  pub operation: OperationName,
  pub payload: serde_json::Value,
  pub state: JobState,
  pub submitted_at: DateTime<Utc>,
  pub taken_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub response: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn operation_name_roundtrip() {
    for op in [
      OperationName::Create,
      OperationName::Delete,
      OperationName::Backup,
      OperationName::Columns,
      OperationName::Tables,
      OperationName::Views,
      OperationName::Indexes,
      OperationName::Query,
      OperationName::Execute,
      OperationName::Rowdata,
      OperationName::Size,
    ] {
      assert_eq!(OperationName::from_str(op.as_str()), Some(op));
    }
    assert_eq!(OperationName::from_str("bogus"), None);
  }

  #[test]
  fn idempotence_classification() {
    assert!(OperationName::Columns.is_idempotent());
    assert!(OperationName::Backup.is_idempotent());
    assert!(!OperationName::Execute.is_idempotent());
    assert!(!OperationName::Create.is_idempotent());
    assert!(!OperationName::Delete.is_idempotent());
  }
}
