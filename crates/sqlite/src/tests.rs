use super::*;

fn test_conn() -> Connection {
  Connection::open_in_memory().expect("open in-memory db")
}

#[tokio::test]
async fn execute_and_read_back() {
  let conn = test_conn();

  conn
    .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", ())
    .await
    .unwrap();

  let n = conn
    .execute("INSERT INTO t (id, name) VALUES (1, 'alice')", ())
    .await
    .unwrap();
  assert_eq!(n, 1);

  let row = conn
    .read_query_row("SELECT name FROM t WHERE id = 1", ())
    .await
    .unwrap()
    .expect("row present");
  let name: String = row.get(0).unwrap();
  assert_eq!(name, "alice");
}

#[tokio::test]
async fn write_query_rows_in_one_transaction() {
  let conn = test_conn();
  conn
    .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", ())
    .await
    .unwrap();

  conn.execute("INSERT INTO t (id) VALUES (1)", ()).await.unwrap();
  conn.execute("INSERT INTO t (id) VALUES (2)", ()).await.unwrap();

  let rows = conn
    .read_query_values::<i64>("SELECT id FROM t ORDER BY id", ())
    .await
    .unwrap();
  assert_eq!(rows, vec![1, 2]);
}

#[tokio::test]
async fn execute_batch_returns_last_statement_rows() {
  let conn = test_conn();
  let rows = conn
    .execute_batch(
      "CREATE TABLE t (id INTEGER PRIMARY KEY); \
       INSERT INTO t (id) VALUES (1); \
       SELECT id FROM t;",
    )
    .await
    .unwrap();
  assert!(rows.is_some());
}

#[tokio::test]
async fn close_is_idempotent_on_success() {
  let conn = test_conn();
  conn.close().await.unwrap();
}
