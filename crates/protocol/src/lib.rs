#![forbid(unsafe_code, clippy::unwrap_used)]
#![allow(clippy::needless_return)]

//! Single-byte-versioned, tagged-variant request/response envelope.
//!
//! A [`Job`](livedb_model::Job) stores its payload/response as opaque
//! `serde_json::Value`s; this crate gives that value a fully-typed shape
//! at the edges — the submitter encodes an [`Operation`] once before
//! `submit`, the worker decodes it once after `claim`, and never passes
//! a loosely-typed envelope between handlers.

use livedb_model::result::{
  BackupResult, ColumnsResult, ExecuteResult, IndexesResult, NamesResult, OkResult, QueryResult,
  RowdataResult, SizeResult,
};
use livedb_model::{Error, OperationName};
use serde::{Deserialize, Serialize};

/// Major version of the envelope shape. Bumped only on breaking changes
/// to the variants below; unrelated to any individual operation schema
/// version.
pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
  Asc,
  Desc,
}

impl Default for SortDirection {
  fn default() -> Self {
    SortDirection::Asc
  }
}

impl Serialize for SortDirection {
  fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(match self {
      SortDirection::Asc => "asc",
      SortDirection::Desc => "desc",
    })
  }
}

impl<'de> Deserialize<'de> for SortDirection {
  fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let s = String::deserialize(d)?;
    match s.to_ascii_lowercase().as_str() {
      "asc" => Ok(SortDirection::Asc),
      "desc" => Ok(SortDirection::Desc),
      other => Err(serde::de::Error::custom(format!(
        "invalid sort direction: {other}"
      ))),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePayload {
  pub seed_object_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnsPayload {
  pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPayload {
  /// SQL text, base64-encoded over the wire per the external interface.
  pub sql_base64: String,
  pub row_cap: Option<u32>,
  pub byte_cap: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePayload {
  pub sql_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowdataPayload {
  pub table: Option<String>,
  pub sort_col: Option<String>,
  #[serde(default)]
  pub sort_dir: SortDirection,
  #[serde(default)]
  pub offset: u64,
  pub max_rows: Option<u32>,
}

/// One variant per entry in the fixed operation vocabulary. Each carries
/// its own fully-typed payload; ops with no parameters carry none.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
  Create(CreatePayload),
  Delete,
  Backup,
  Columns(ColumnsPayload),
  Tables,
  Views,
  Indexes,
  Query(QueryPayload),
  Execute(ExecutePayload),
  Rowdata(RowdataPayload),
  Size,
}

impl Operation {
  pub fn name(&self) -> OperationName {
    match self {
      Operation::Create(_) => OperationName::Create,
      Operation::Delete => OperationName::Delete,
      Operation::Backup => OperationName::Backup,
      Operation::Columns(_) => OperationName::Columns,
      Operation::Tables => OperationName::Tables,
      Operation::Views => OperationName::Views,
      Operation::Indexes => OperationName::Indexes,
      Operation::Query(_) => OperationName::Query,
      Operation::Execute(_) => OperationName::Execute,
      Operation::Rowdata(_) => OperationName::Rowdata,
      Operation::Size => OperationName::Size,
    }
  }

  /// Encodes to the opaque payload value a [`Job`](livedb_model::Job) row
  /// stores.
  pub fn encode(&self) -> serde_json::Value {
    serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
  }

  /// Decodes a job's `(operation, payload)` pair into a typed
  /// [`Operation`]. An operation name the decoder doesn't recognise
  /// surfaces [`Error::UnknownOperation`] without ever touching queue
  /// state — callers must check this before `submit`, and the worker
  /// double-checks it defensively after `claim`.
  pub fn decode(name: OperationName, payload: &serde_json::Value) -> Result<Self, Error> {
    let mut tagged = payload.clone();
    if let serde_json::Value::Object(ref mut map) = tagged {
      map.insert(
        "op".to_string(),
        serde_json::Value::String(name.as_str().to_string()),
      );
    } else {
      let mut map = serde_json::Map::new();
      map.insert(
        "op".to_string(),
        serde_json::Value::String(name.as_str().to_string()),
      );
      tagged = serde_json::Value::Object(map);
    }

    serde_json::from_value(tagged)
      .map_err(|e| Error::Validation(format!("malformed payload for {}: {e}", name.as_str())))
  }
}

/// Per-operation result, tagged the same way as [`Operation`] so a
/// caller can match on the op it submitted without re-deriving the
/// shape from `OperationName`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperationResult {
  Create(OkResult),
  Delete(OkResult),
  Backup(BackupResult),
  Columns(ColumnsResult),
  Tables(NamesResult),
  Views(NamesResult),
  Indexes(IndexesResult),
  Query(QueryResult),
  Execute(ExecuteResult),
  Rowdata(RowdataResult),
  Size(SizeResult),
}

impl OperationResult {
  pub fn encode(&self) -> serde_json::Value {
    serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
  }

  pub fn decode(name: OperationName, value: &serde_json::Value) -> Result<Self, Error> {
    let mut tagged = value.clone();
    if let serde_json::Value::Object(ref mut map) = tagged {
      map.insert(
        "op".to_string(),
        serde_json::Value::String(name.as_str().to_string()),
      );
    }
    serde_json::from_value(tagged)
      .map_err(|e| Error::Internal(format!("malformed result for {}: {e}", name.as_str()).into()))
  }
}

/// Envelope wrapping a single operation with its correlation id and the
/// wire version. Workers copy `correlation_id` verbatim into the
/// response; submitters index pending waits by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
  pub version: u8,
  pub correlation_id: uuid::Uuid,
  pub operation: Operation,
}

impl Envelope {
  pub fn new(operation: Operation) -> Self {
    Self {
      version: ENVELOPE_VERSION,
      correlation_id: uuid::Uuid::new_v4(),
      operation,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encode_decode_roundtrip() {
    let op = Operation::Columns(ColumnsPayload {
      table: "Candidate_Information".into(),
    });
    let payload = op.encode();
    let decoded = Operation::decode(OperationName::Columns, &payload).unwrap();
    assert_eq!(decoded.name(), OperationName::Columns);
  }

  #[test]
  fn parameterless_op_roundtrip() {
    let payload = Operation::Tables.encode();
    let decoded = Operation::decode(OperationName::Tables, &payload).unwrap();
    assert!(matches!(decoded, Operation::Tables));
  }

  #[test]
  fn unknown_operation_is_an_error() {
    let payload = serde_json::json!({});
    let err = Operation::decode(OperationName::Columns, &payload).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
  }

  #[test]
  fn envelope_preserves_correlation_id() {
    let env = Envelope::new(Operation::Size);
    let id = env.correlation_id;
    let json = serde_json::to_value(&env).unwrap();
    let back: Envelope = serde_json::from_value(json).unwrap();
    assert_eq!(back.correlation_id, id);
  }
}
