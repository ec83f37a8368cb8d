use serde::{Deserialize, Serialize};

/// Value type tag for a `query` result cell. Mirrors SQLite's storage
/// classes; the numeric values match the historic wire contract
/// (`3 == text`) that scenario tests in this workspace assert against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
  Integer = 1,
  Float = 2,
  Text = 3,
  Blob = 4,
  Null = 5,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
  pub column_id: i64,
  pub name: String,
  pub declared_type: String,
  pub not_null: bool,
  pub default_value: Option<String>,
  pub pk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnsResult {
  pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamesResult {
  pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexColumn {
  pub id: i64,
  pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
  pub name: String,
  pub table: String,
  pub columns: Vec<IndexColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexesResult {
  pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
  pub name: String,
  #[serde(rename = "type")]
  pub value_type: ValueType,
  /// `null` for `ValueType::Null`; base64 text for `ValueType::Blob`;
  /// otherwise the natural JSON representation.
  pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
  pub column_names: Vec<String>,
  pub rows: Vec<Vec<Cell>>,
  pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResult {
  pub rows_changed: i64,
  pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowdataResult {
  pub tables: Vec<String>,
  pub default_table: String,
  pub records: QueryResult,
  pub total_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeResult {
  pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResult {
  pub ok: bool,
  pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResult {
  pub ok: bool,
  pub object_id: Option<String>,
  pub error: Option<String>,
}
