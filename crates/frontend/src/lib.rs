#![forbid(unsafe_code, clippy::unwrap_used)]
#![allow(clippy::needless_return)]

//! Thin HTTP surface translating the external wire protocol into
//! [`livedb_client::Client::dispatch`] calls. Auth (`api_keys`/`users`)
//! and the versioned-snapshot store are external collaborators; this
//! crate only resolves an already-issued API key to a [`Principal`] via
//! an injected [`PrincipalDirectory`] and looks up the target node via
//! placement before dispatching.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Form, State};
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use livedb_client::Client;
use livedb_model::{DatabaseRef, Error, Principal};
use livedb_protocol::{
  ColumnsPayload, CreatePayload, ExecutePayload, Operation, QueryPayload, RowdataPayload,
  SortDirection,
};
use serde::Deserialize;
use sqlx::PgPool;

/// Default time a request waits for a job to reach a terminal state
/// before surfacing `Error::Timeout`.
const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves an API key to the principal submitting on its behalf.
/// The real implementation lives in the (out-of-scope) users/api_keys
/// service; this trait is the seam `livedb-frontend` depends on instead
/// of that service directly.
pub trait PrincipalDirectory: Send + Sync {
  fn resolve(&self, apikey: &str) -> Result<Principal, Error>;
}

#[derive(Clone)]
pub struct AppState {
  client: Arc<Client>,
  placement_pool: PgPool,
  principals: Arc<dyn PrincipalDirectory>,
  dispatch_timeout: Duration,
}

impl AppState {
  pub fn new(
    client: Arc<Client>,
    placement_pool: PgPool,
    principals: Arc<dyn PrincipalDirectory>,
  ) -> Self {
    Self {
      client,
      placement_pool,
      principals,
      dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
    }
  }
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/v1/create", post(create_handler))
    .route("/v1/delete", post(delete_handler))
    .route("/v1/backup", post(backup_handler))
    .route("/v1/columns", post(columns_handler))
    .route("/v1/tables", post(tables_handler))
    .route("/v1/views", post(views_handler))
    .route("/v1/indexes", post(indexes_handler))
    .route("/v1/query", post(query_handler))
    .route("/v1/execute", post(execute_handler))
    .route("/v1/rowdata", post(rowdata_handler))
    .route("/v1/size", post(size_handler))
    .with_state(state)
}

async fn resolve_target(
  state: &AppState,
  apikey: &str,
  dbowner: &str,
  dbname: &str,
) -> Result<(Principal, String), Error> {
  let principal = state.principals.resolve(apikey)?;
  let database = DatabaseRef::new(dbowner, dbname)?;
  let placement = livedb_placement::lookup(&state.placement_pool, &database)
    .await?
    .filter(|p| p.live)
    .ok_or_else(|| Error::NotLive(database.owner.clone(), database.name.clone()))?;
  Ok((principal, placement.node_name))
}

async fn dispatch(
  state: &AppState,
  principal: &Principal,
  target_node: &str,
  dbowner: &str,
  dbname: &str,
  operation: Operation,
) -> Result<Json<serde_json::Value>, Error> {
  let result = state
    .client
    .dispatch(principal, target_node, dbowner, dbname, operation, state.dispatch_timeout)
    .await?;
  Ok(Json(result.encode()))
}

#[derive(Debug, Deserialize)]
pub struct CreateForm {
  pub apikey: String,
  pub dbowner: String,
  pub dbname: String,
  pub seed_object_id: String,
}

async fn create_handler(
  State(state): State<AppState>,
  Form(form): Form<CreateForm>,
) -> Result<Json<serde_json::Value>, Error> {
  let principal = state.principals.resolve(&form.apikey)?;
  let database = DatabaseRef::new(&form.dbowner, &form.dbname)?;
  let placement = livedb_placement::lookup(&state.placement_pool, &database)
    .await?
    .ok_or_else(|| Error::NotLive(database.owner.clone(), database.name.clone()))?;

  dispatch(
    &state,
    &principal,
    &placement.node_name,
    &form.dbowner,
    &form.dbname,
    Operation::Create(CreatePayload {
      seed_object_id: form.seed_object_id,
    }),
  )
  .await
}

#[derive(Debug, Deserialize)]
pub struct DeleteForm {
  pub apikey: String,
  pub dbowner: Option<String>,
  pub dbname: String,
}

async fn delete_handler(
  State(state): State<AppState>,
  Form(form): Form<DeleteForm>,
) -> Result<Json<serde_json::Value>, Error> {
  let owner = form.dbowner.as_deref().unwrap_or(&form.apikey);
  let (principal, target_node) = resolve_target(&state, &form.apikey, owner, &form.dbname).await?;
  dispatch(&state, &principal, &target_node, owner, &form.dbname, Operation::Delete).await
}

#[derive(Debug, Deserialize)]
pub struct SimpleForm {
  pub apikey: String,
  pub dbowner: String,
  pub dbname: String,
}

async fn backup_handler(
  State(state): State<AppState>,
  Form(form): Form<SimpleForm>,
) -> Result<Json<serde_json::Value>, Error> {
  let (principal, target_node) =
    resolve_target(&state, &form.apikey, &form.dbowner, &form.dbname).await?;
  dispatch(&state, &principal, &target_node, &form.dbowner, &form.dbname, Operation::Backup).await
}

async fn tables_handler(
  State(state): State<AppState>,
  Form(form): Form<SimpleForm>,
) -> Result<Json<serde_json::Value>, Error> {
  let (principal, target_node) =
    resolve_target(&state, &form.apikey, &form.dbowner, &form.dbname).await?;
  dispatch(&state, &principal, &target_node, &form.dbowner, &form.dbname, Operation::Tables).await
}

async fn views_handler(
  State(state): State<AppState>,
  Form(form): Form<SimpleForm>,
) -> Result<Json<serde_json::Value>, Error> {
  let (principal, target_node) =
    resolve_target(&state, &form.apikey, &form.dbowner, &form.dbname).await?;
  dispatch(&state, &principal, &target_node, &form.dbowner, &form.dbname, Operation::Views).await
}

async fn indexes_handler(
  State(state): State<AppState>,
  Form(form): Form<SimpleForm>,
) -> Result<Json<serde_json::Value>, Error> {
  let (principal, target_node) =
    resolve_target(&state, &form.apikey, &form.dbowner, &form.dbname).await?;
  dispatch(&state, &principal, &target_node, &form.dbowner, &form.dbname, Operation::Indexes).await
}

async fn size_handler(
  State(state): State<AppState>,
  Form(form): Form<SimpleForm>,
) -> Result<Json<serde_json::Value>, Error> {
  let (principal, target_node) =
    resolve_target(&state, &form.apikey, &form.dbowner, &form.dbname).await?;
  dispatch(&state, &principal, &target_node, &form.dbowner, &form.dbname, Operation::Size).await
}

#[derive(Debug, Deserialize)]
pub struct ColumnsForm {
  pub apikey: String,
  pub dbowner: String,
  pub dbname: String,
  pub table: String,
}

async fn columns_handler(
  State(state): State<AppState>,
  Form(form): Form<ColumnsForm>,
) -> Result<Json<serde_json::Value>, Error> {
  let (principal, target_node) =
    resolve_target(&state, &form.apikey, &form.dbowner, &form.dbname).await?;
  dispatch(
    &state,
    &principal,
    &target_node,
    &form.dbowner,
    &form.dbname,
    Operation::Columns(ColumnsPayload { table: form.table }),
  )
  .await
}

#[derive(Debug, Deserialize)]
pub struct SqlForm {
  pub apikey: String,
  pub dbowner: String,
  pub dbname: String,
  pub sql: String,
  pub row_cap: Option<u32>,
  pub byte_cap: Option<u64>,
}

async fn query_handler(
  State(state): State<AppState>,
  Form(form): Form<SqlForm>,
) -> Result<Json<serde_json::Value>, Error> {
  let (principal, target_node) =
    resolve_target(&state, &form.apikey, &form.dbowner, &form.dbname).await?;
  dispatch(
    &state,
    &principal,
    &target_node,
    &form.dbowner,
    &form.dbname,
    Operation::Query(QueryPayload {
      sql_base64: form.sql,
      row_cap: form.row_cap,
      byte_cap: form.byte_cap,
    }),
  )
  .await
}

async fn execute_handler(
  State(state): State<AppState>,
  Form(form): Form<SqlForm>,
) -> Result<Json<serde_json::Value>, Error> {
  let (principal, target_node) =
    resolve_target(&state, &form.apikey, &form.dbowner, &form.dbname).await?;
  dispatch(
    &state,
    &principal,
    &target_node,
    &form.dbowner,
    &form.dbname,
    Operation::Execute(ExecutePayload { sql_base64: form.sql }),
  )
  .await
}

#[derive(Debug, Deserialize)]
pub struct RowdataForm {
  pub apikey: String,
  pub dbowner: String,
  pub dbname: String,
  pub table: Option<String>,
  pub sort_col: Option<String>,
  pub sort_dir: Option<String>,
  pub offset: Option<u64>,
  pub max_rows: Option<u32>,
}

async fn rowdata_handler(
  State(state): State<AppState>,
  Form(form): Form<RowdataForm>,
) -> Result<Json<serde_json::Value>, Error> {
  let (principal, target_node) =
    resolve_target(&state, &form.apikey, &form.dbowner, &form.dbname).await?;

  let sort_dir = match form.sort_dir.as_deref() {
    Some("desc") => SortDirection::Desc,
    _ => SortDirection::Asc,
  };

  dispatch(
    &state,
    &principal,
    &target_node,
    &form.dbowner,
    &form.dbname,
    Operation::Rowdata(RowdataPayload {
      table: form.table,
      sort_col: form.sort_col,
      sort_dir,
      offset: form.offset.unwrap_or(0),
      max_rows: form.max_rows,
    }),
  )
  .await
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::http::StatusCode;
  use axum::response::IntoResponse;

  struct DenyAllDirectory;
  impl PrincipalDirectory for DenyAllDirectory {
    fn resolve(&self, _apikey: &str) -> Result<Principal, Error> {
      Err(Error::Unauthorized("no such api key".into()))
    }
  }

  #[test]
  fn unknown_apikey_is_rejected_before_any_dispatch() {
    // Every handler calls `principals.resolve` first; a directory that
    // never issues a principal must fail closed without needing a queue
    // or placement pool at all.
    let directory = DenyAllDirectory;
    assert!(matches!(directory.resolve("x"), Err(Error::Unauthorized(_))));
  }

  #[test]
  fn unauthorized_maps_to_401() {
    // `livedb-frontend` reuses `livedb_model::Error`'s `IntoResponse`
    // impl rather than mapping errors itself; this pins that contract.
    let response = Error::Unauthorized("no such api key".into()).into_response();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[test]
  fn rowdata_form_defaults_sort_direction_to_asc() {
    let form: RowdataForm = serde_urlencoded::from_str("apikey=k&dbowner=alice&dbname=scores.sqlite")
      .expect("all required fields present");
    assert!(form.sort_col.is_none());
    assert!(form.sort_dir.is_none());
  }
}
