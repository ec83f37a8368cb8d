//! Per-operation handlers. Each receives a fully-typed payload (decoded
//! once by `livedb-protocol` at the worker's edge) and an open
//! [`livedb_sqlite::Connection`] for the target live database.

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use livedb_model::result::{
  BackupResult, Cell, ColumnInfo, ColumnsResult, ExecuteResult, IndexColumn, IndexInfo,
  IndexesResult, NamesResult, OkResult, QueryResult, RowdataResult, SizeResult, ValueType,
};
use livedb_model::{Error, validate_identifier};
use livedb_protocol::{ColumnsPayload, ExecutePayload, QueryPayload, RowdataPayload, SortDirection};
use livedb_sqlite::{Connection, Row, Value as SqlValue};
use object_store::ObjectStore;

fn sql_value_to_cell(name: &str, value: &SqlValue) -> Cell {
  let (value_type, json) = match value {
    SqlValue::Null => (ValueType::Null, serde_json::Value::Null),
    SqlValue::Integer(i) => (ValueType::Integer, serde_json::json!(i)),
    SqlValue::Real(f) => (ValueType::Float, serde_json::json!(f)),
    SqlValue::Text(s) => (ValueType::Text, serde_json::json!(s)),
    SqlValue::Blob(b) => (ValueType::Blob, serde_json::json!(BASE64.encode(b))),
  };

  Cell {
    name: name.to_string(),
    value_type,
    value: json,
  }
}

fn row_to_cells(row: &Row, column_names: &[String]) -> Vec<Cell> {
  column_names
    .iter()
    .enumerate()
    .map(|(idx, name)| {
      let value = row.get_value(idx).unwrap_or(&SqlValue::Null);
      sql_value_to_cell(name, value)
    })
    .collect()
}

pub async fn columns(conn: &Connection, payload: &ColumnsPayload) -> Result<ColumnsResult, Error> {
  validate_identifier(&payload.table)?;

  let exists = table_exists(conn, &payload.table).await?;
  if !exists {
    return Err(Error::NotFound(format!("table {:?}", payload.table)));
  }

  let sql = format!("PRAGMA table_info({})", payload.table);
  let rows = conn
    .read_query_rows(sql, ())
    .await
    .map_err(|e| Error::Internal(e.into()))?;

  let mut columns = Vec::with_capacity(rows.len());
  for row in rows.iter() {
    // PRAGMA table_info columns: cid, name, type, notnull, dflt_value, pk
    let column_id: i64 = row.get(0).map_err(|e| Error::Internal(e.into()))?;
    let name: String = row.get(1).map_err(|e| Error::Internal(e.into()))?;
    let declared_type: String = row.get(2).unwrap_or_default();
    let not_null: bool = row.get::<i64>(3).map(|v| v != 0).map_err(|e| Error::Internal(e.into()))?;
    let default_value: Option<String> = row.get(4).ok();
    let pk_index: i64 = row.get(5).map_err(|e| Error::Internal(e.into()))?;

    columns.push(ColumnInfo {
      column_id,
      name,
      declared_type,
      not_null,
      default_value,
      pk_index,
    });
  }

  Ok(ColumnsResult { columns })
}

async fn table_exists(conn: &Connection, table: &str) -> Result<bool, Error> {
  let count: Option<i64> = conn
    .read_query_value(
      "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
      livedb_sqlite::params!(table.to_string()),
    )
    .await
    .map_err(|e| Error::Internal(e.into()))?;
  Ok(count.unwrap_or(0) > 0)
}

async fn list_names(conn: &Connection, kind: &str) -> Result<Vec<String>, Error> {
  conn
    .read_query_values::<String>(
      "SELECT name FROM sqlite_master WHERE type = ?1 ORDER BY name",
      livedb_sqlite::params!(kind.to_string()),
    )
    .await
    .map_err(|e| Error::Internal(e.into()))
}

pub async fn tables(conn: &Connection) -> Result<NamesResult, Error> {
  Ok(NamesResult {
    names: list_names(conn, "table").await?,
  })
}

pub async fn views(conn: &Connection) -> Result<NamesResult, Error> {
  Ok(NamesResult {
    names: list_names(conn, "view").await?,
  })
}

pub async fn indexes(conn: &Connection) -> Result<IndexesResult, Error> {
  let index_rows = conn
    .read_query_rows(
      "SELECT name, tbl_name FROM sqlite_master WHERE type = 'index' ORDER BY name",
      (),
    )
    .await
    .map_err(|e| Error::Internal(e.into()))?;

  let mut indexes = Vec::with_capacity(index_rows.len());
  for row in index_rows.iter() {
    let name: String = row.get(0).map_err(|e| Error::Internal(e.into()))?;
    let table: String = row.get(1).map_err(|e| Error::Internal(e.into()))?;

    let col_rows = conn
      .read_query_rows(format!("PRAGMA index_info({name})"), ())
      .await
      .map_err(|e| Error::Internal(e.into()))?;

    let mut columns = Vec::with_capacity(col_rows.len());
    for col_row in col_rows.iter() {
      // PRAGMA index_info columns: seqno, cid, name
      let id: i64 = col_row.get(1).map_err(|e| Error::Internal(e.into()))?;
      let col_name: String = col_row.get(2).unwrap_or_default();
      columns.push(IndexColumn { id, name: col_name });
    }

    indexes.push(IndexInfo {
      name,
      table,
      columns,
    });
  }

  Ok(IndexesResult { indexes })
}

/// Executes a read-only `query`. Enforced read-only by
/// `Connection::read_query_rows`'s internal `assert!(stmt.readonly())`;
/// truncates at `row_cap`/`byte_cap` and sets `truncated = true` rather
/// than returning partial silence.
pub async fn query(
  conn: &Connection,
  payload: &QueryPayload,
  default_row_cap: u32,
  default_byte_cap: u64,
  wall_clock: Duration,
) -> Result<QueryResult, Error> {
  let sql = BASE64
    .decode(&payload.sql_base64)
    .map_err(|e| Error::Validation(format!("sql is not valid base64: {e}")))?;
  let sql = String::from_utf8(sql).map_err(|e| Error::Validation(format!("sql is not utf8: {e}")))?;

  let row_cap = payload.row_cap.unwrap_or(default_row_cap).max(1) as usize;
  let byte_cap = payload.byte_cap.unwrap_or(default_byte_cap);

  let result = tokio::time::timeout(wall_clock, conn.read_query_rows(sql, ()))
    .await
    .map_err(|_| Error::QueryCancelled("wall-clock limit exceeded".into()))?
    .map_err(|e| Error::Internal(e.into()))?;

  let column_names: Vec<String> = (0..result.column_count())
    .map(|i| result.column_name(i).unwrap_or("").to_string())
    .collect();

  let mut rows = Vec::new();
  let mut bytes_returned: u64 = 0;
  let mut truncated = false;

  for row in result.iter() {
    if rows.len() >= row_cap || bytes_returned >= byte_cap {
      truncated = true;
      break;
    }

    let cells = row_to_cells(row, &column_names);
    bytes_returned += cells
      .iter()
      .map(|c| c.value.to_string().len() as u64)
      .sum::<u64>();
    rows.push(cells);
  }

  Ok(QueryResult {
    column_names,
    rows,
    truncated,
  })
}

/// Executes one statement, or a semicolon-terminated sequence, in a
/// single transaction. Caller must already have checked the principal
/// has read-write permission.
pub async fn execute(conn: &Connection, payload: &ExecutePayload) -> Result<ExecuteResult, Error> {
  let sql = BASE64
    .decode(&payload.sql_base64)
    .map_err(|e| Error::Validation(format!("sql is not valid base64: {e}")))?;
  let sql = String::from_utf8(sql).map_err(|e| Error::Validation(format!("sql is not utf8: {e}")))?;

  let wrapped = format!("BEGIN;\n{sql}\nCOMMIT;");

  let rows_changed = conn
    .call(move |conn: &mut rusqlite::Connection| {
      let changes_before = conn.total_changes();
      let batch = rusqlite::Batch::new(conn, &wrapped);
      let mut p = batch.peekable();
      while let Some(mut stmt) = p.next()? {
        stmt.raw_execute()?;
      }
      drop(p);
      Ok((conn.total_changes() - changes_before) as i64)
    })
    .await
    .map_err(|e| Error::Internal(e.into()))?;

  Ok(ExecuteResult {
    rows_changed,
    status: "OK".to_string(),
  })
}

pub async fn rowdata(
  conn: &Connection,
  payload: &RowdataPayload,
  default_row_cap: u32,
  default_byte_cap: u64,
  db_path: &Path,
) -> Result<RowdataResult, Error> {
  let table_names = list_names(conn, "table").await?;
  let default_table = payload
    .table
    .clone()
    .or_else(|| table_names.first().cloned())
    .ok_or_else(|| Error::NotFound("database has no tables".into()))?;

  validate_identifier(&default_table)?;
  if !table_names.iter().any(|t| t == &default_table) {
    return Err(Error::NotFound(format!("table {default_table:?}")));
  }

  let sort_col = match &payload.sort_col {
    Some(col) => {
      validate_identifier(col)?;
      col.clone()
    }
    None => "rowid".to_string(),
  };
  let sort_dir = match payload.sort_dir {
    SortDirection::Asc => "ASC",
    SortDirection::Desc => "DESC",
  };
  let max_rows = payload.max_rows.unwrap_or(default_row_cap).max(1) as i64;

  let sql = format!(
    "SELECT * FROM {default_table} ORDER BY {sort_col} {sort_dir} LIMIT ?1 OFFSET ?2"
  );

  let result = conn
    .read_query_rows(sql, livedb_sqlite::params!(max_rows, payload.offset as i64))
    .await
    .map_err(|e| Error::Internal(e.into()))?;

  let column_names: Vec<String> = (0..result.column_count())
    .map(|i| result.column_name(i).unwrap_or("").to_string())
    .collect();

  let mut rows = Vec::new();
  let mut bytes_returned = 0u64;
  let mut truncated = false;
  for row in result.iter() {
    if bytes_returned >= default_byte_cap {
      truncated = true;
      break;
    }
    let cells = row_to_cells(row, &column_names);
    bytes_returned += cells.iter().map(|c| c.value.to_string().len() as u64).sum::<u64>();
    rows.push(cells);
  }

  let total_size_bytes = tokio::fs::metadata(db_path)
    .await
    .map(|m| m.len())
    .unwrap_or(0);

  Ok(RowdataResult {
    tables: table_names,
    default_table,
    records: QueryResult {
      column_names,
      rows,
      truncated,
    },
    total_size_bytes,
  })
}

pub async fn size(db_path: &Path) -> Result<SizeResult, Error> {
  let metadata = tokio::fs::metadata(db_path)
    .await
    .map_err(|_| Error::NotFound(format!("{}", db_path.display())))?;
  Ok(SizeResult {
    bytes: metadata.len(),
  })
}

pub async fn delete(db_path: &Path) -> Result<OkResult, Error> {
  match tokio::fs::remove_file(db_path).await {
    Ok(()) => {}
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      // Idempotent: a missing file is a successful delete.
    }
    Err(e) => return Err(Error::Internal(e.into())),
  }

  if let Some(dir) = db_path.parent() {
    // Never remove the owner directory, only the per-database one.
    let _ = tokio::fs::remove_dir(dir).await;
  }

  Ok(OkResult {
    ok: true,
    error: None,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use livedb_protocol::SortDirection;

  async fn fixture() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory sqlite");
    conn
      .execute_batch(
        "CREATE TABLE players (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score INTEGER);\
         INSERT INTO players (id, name, score) VALUES (1, 'ada', 10), (2, 'grace', 20);",
      )
      .await
      .expect("seed fixture");
    conn
  }

  #[tokio::test]
  async fn tables_lists_created_table() {
    let conn = fixture().await;
    let result = tables(&conn).await.expect("tables");
    assert_eq!(result.names, vec!["players".to_string()]);
  }

  #[tokio::test]
  async fn columns_rejects_unknown_table() {
    let conn = fixture().await;
    let payload = ColumnsPayload { table: "ghosts".to_string() };
    assert!(matches!(columns(&conn, &payload).await, Err(Error::NotFound(_))));
  }

  #[tokio::test]
  async fn columns_reports_declared_types() {
    let conn = fixture().await;
    let payload = ColumnsPayload { table: "players".to_string() };
    let result = columns(&conn, &payload).await.expect("columns");
    assert_eq!(result.columns.len(), 3);
    assert_eq!(result.columns[1].name, "name");
  }

  #[tokio::test]
  async fn query_truncates_at_row_cap() {
    let conn = fixture().await;
    let payload = QueryPayload {
      sql_base64: BASE64.encode("SELECT * FROM players ORDER BY id"),
      row_cap: Some(1),
      byte_cap: None,
    };
    let result = query(&conn, &payload, 1000, 1_000_000, Duration::from_secs(5))
      .await
      .expect("query");
    assert_eq!(result.rows.len(), 1);
    assert!(result.truncated);
  }

  #[tokio::test]
  async fn execute_runs_statement_in_a_transaction() {
    let conn = fixture().await;
    let payload = ExecutePayload {
      sql_base64: BASE64.encode("UPDATE players SET score = score + 1"),
    };
    let result = execute(&conn, &payload).await.expect("execute");
    assert_eq!(result.rows_changed, 2);
  }

  #[tokio::test]
  async fn rowdata_defaults_to_first_table_and_rowid_order() {
    let conn = fixture().await;
    let payload = RowdataPayload {
      table: None,
      sort_col: None,
      sort_dir: SortDirection::Desc,
      offset: 0,
      max_rows: None,
    };
    let db_path = std::path::Path::new(":memory:");
    let result = rowdata(&conn, &payload, 1000, 1_000_000, db_path)
      .await
      .expect("rowdata");
    assert_eq!(result.default_table, "players");
    assert_eq!(result.records.rows.len(), 2);
  }

  #[tokio::test]
  async fn size_reports_file_length() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("live.sqlite");
    std::fs::write(&path, b"not a real sqlite file, just bytes").expect("write fixture");
    let result = size(&path).await.expect("size");
    assert_eq!(result.bytes, 34);
  }

  #[tokio::test]
  async fn delete_is_idempotent_for_a_missing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("owner").join("name").join("live.sqlite");
    let result = delete(&path).await.expect("delete");
    assert!(result.ok);
  }
}

pub async fn backup(
  conn: &Connection,
  store: &dyn ObjectStore,
  owner: &str,
  db_path: &Path,
) -> Result<BackupResult, Error> {
  let temp_path = db_path.with_extension("backup-tmp");
  let temp_path_for_blocking = temp_path.clone();

  conn
    .call(move |src: &mut rusqlite::Connection| {
      let mut dst = rusqlite::Connection::open(&temp_path_for_blocking)?;
      let backup = rusqlite::backup::Backup::new(src, &mut dst)?;
      backup.run_to_completion(100, std::time::Duration::from_millis(50), None)?;
      Ok(())
    })
    .await
    .map_err(|e| Error::Internal(e.into()))?;

  let bytes = tokio::fs::read(&temp_path).await.map_err(|e| Error::Internal(e.into()))?;
  let _ = tokio::fs::remove_file(&temp_path).await;

  let object_id = livedb_placement::upload_blob(store, owner, bytes.into()).await?;

  Ok(BackupResult {
    ok: true,
    object_id: Some(object_id),
    error: None,
  })
}
