#![forbid(unsafe_code, clippy::unwrap_used)]
#![allow(clippy::needless_return)]

//! Live-node worker loop.
//!
//! Each live node runs one of these: a bounded pool of general workers
//! claiming any operation but `create`, plus exactly one dedicated
//! worker claiming only `create` jobs, so a burst of reads or writes
//! against already-live databases can never starve the one path that
//! brings a new database online. A background sweep reclaims jobs
//! abandoned by a crashed claim.

mod handlers;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use livedb_model::{DatabaseRef, Error, Job, OperationName};
use livedb_protocol::{Operation, OperationResult};
use livedb_queue::Queue;
use livedb_sqlite::{Connection, Options};
use object_store::ObjectStore;
use parking_lot::Mutex;
use sqlx::PgPool;
use tracing::{error, info, warn};

const CLAIM_IDLE_BACKOFF: Duration = Duration::from_millis(200);
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub n_workers: usize,
  pub default_row_cap: u32,
  pub default_byte_cap: u64,
  pub query_wall_clock: Duration,
  pub visibility_timeout: Duration,
  pub recovery_sweep_interval: Duration,
  pub max_reader_threads: usize,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      n_workers: 4,
      default_row_cap: 1_000,
      default_byte_cap: 10 * 1024 * 1024,
      query_wall_clock: Duration::from_secs(30),
      visibility_timeout: livedb_queue::DEFAULT_VISIBILITY_TIMEOUT,
      recovery_sweep_interval: Duration::from_secs(30),
      max_reader_threads: 4,
    }
  }
}

/// Owns every live SQLite file materialised on this node and the worker
/// tasks that serve jobs targeting it.
pub struct LiveNodeWorker {
  node_name: String,
  storage_dir: PathBuf,
  queue: Arc<Queue>,
  placement_pool: PgPool,
  object_store: Arc<dyn ObjectStore>,
  connections: Mutex<HashMap<(String, String), Connection>>,
  config: WorkerConfig,
}

impl LiveNodeWorker {
  pub fn new(
    node_name: impl Into<String>,
    storage_dir: PathBuf,
    queue: Arc<Queue>,
    placement_pool: PgPool,
    object_store: Arc<dyn ObjectStore>,
    config: WorkerConfig,
  ) -> Arc<Self> {
    Arc::new(Self {
      node_name: node_name.into(),
      storage_dir,
      queue,
      placement_pool,
      object_store,
      connections: Mutex::new(HashMap::new()),
      config,
    })
  }

  /// Runs the recovery sweep, the general worker pool, and the
  /// dedicated `create` worker until the process is torn down.
  pub async fn run(self: Arc<Self>) {
    let sweeper = self.clone();
    let mut tasks = vec![tokio::spawn(async move { sweeper.recovery_sweep_loop().await })];

    for _ in 0..self.config.n_workers {
      let worker = self.clone();
      tasks.push(tokio::spawn(async move { worker.worker_loop(false).await }));
    }

    let create_worker = self.clone();
    tasks.push(tokio::spawn(async move {
      create_worker.worker_loop(true).await
    }));

    for task in tasks {
      let _ = task.await;
    }
  }

  async fn recovery_sweep_loop(self: Arc<Self>) {
    let mut interval = tokio::time::interval(self.config.recovery_sweep_interval);
    loop {
      interval.tick().await;
      match self
        .queue
        .reenqueue_orphaned(&self.node_name, self.config.visibility_timeout)
        .await
      {
        Ok(0) => {}
        Ok(reclaimed) => info!(node = %self.node_name, reclaimed, "recovery sweep reclaimed orphaned jobs"),
        Err(e) => warn!(node = %self.node_name, error = %e, "recovery sweep failed"),
      }
    }
  }

  async fn worker_loop(self: Arc<Self>, only_create: bool) {
    loop {
      let claimed = if only_create {
        self.queue.claim_only(&self.node_name, OperationName::Create).await
      } else {
        self.queue.claim_excluding(&self.node_name, OperationName::Create).await
      };

      let job = match claimed {
        Ok(Some(job)) => job,
        Ok(None) => {
          tokio::time::sleep(CLAIM_IDLE_BACKOFF).await;
          continue;
        }
        Err(e) => {
          warn!(node = %self.node_name, error = %e, "claim failed");
          tokio::time::sleep(CLAIM_ERROR_BACKOFF).await;
          continue;
        }
      };

      self.handle_job(job).await;
    }
  }

  async fn handle_job(&self, job: Job) {
    let job_id = job.job_id;
    match self.execute_job(&job).await {
      Ok(result) => {
        if let Err(e) = self.queue.complete(job_id, result.encode()).await {
          error!(job_id, error = %e, "failed to record job completion");
        }
      }
      Err(e) => {
        warn!(job_id, owner = %job.owner, name = %job.name, error = %e, "job failed");
        if let Err(e2) = self.queue.fail(job_id, &e).await {
          error!(job_id, error = %e2, "failed to record job failure");
        }
      }
    }
  }

  async fn execute_job(&self, job: &Job) -> Result<OperationResult, Error> {
    let database = DatabaseRef::new(job.owner.clone(), job.name.clone())?;
    let operation = Operation::decode(job.operation, &job.payload)?;

    livedb_placement::require_placed_on(&self.placement_pool, &database, &self.node_name).await?;

    let db_path = self.storage_dir.join(database.storage_subpath());

    match operation {
      Operation::Create(payload) => {
        livedb_placement::materialize_seed(
          self.object_store.as_ref(),
          &database.owner,
          &payload.seed_object_id,
          &db_path,
        )
        .await?;
        self.open_connection(&database, &db_path)?;
        Ok(OperationResult::Create(livedb_model::result::OkResult {
          ok: true,
          error: None,
        }))
      }
      Operation::Delete => {
        self.evict_connection(&database);
        let result = handlers::delete(&db_path).await?;
        livedb_placement::remove(&self.placement_pool, &database).await?;
        Ok(OperationResult::Delete(result))
      }
      Operation::Backup => {
        let conn = self.connection_for(&database, &db_path)?;
        let result = handlers::backup(&conn, self.object_store.as_ref(), &database.owner, &db_path).await?;
        Ok(OperationResult::Backup(result))
      }
      Operation::Columns(payload) => {
        let conn = self.connection_for(&database, &db_path)?;
        Ok(OperationResult::Columns(handlers::columns(&conn, &payload).await?))
      }
      Operation::Tables => {
        let conn = self.connection_for(&database, &db_path)?;
        Ok(OperationResult::Tables(handlers::tables(&conn).await?))
      }
      Operation::Views => {
        let conn = self.connection_for(&database, &db_path)?;
        Ok(OperationResult::Views(handlers::views(&conn).await?))
      }
      Operation::Indexes => {
        let conn = self.connection_for(&database, &db_path)?;
        Ok(OperationResult::Indexes(handlers::indexes(&conn).await?))
      }
      Operation::Query(payload) => {
        let conn = self.connection_for(&database, &db_path)?;
        let result = handlers::query(
          &conn,
          &payload,
          self.config.default_row_cap,
          self.config.default_byte_cap,
          self.config.query_wall_clock,
        )
        .await?;
        Ok(OperationResult::Query(result))
      }
      Operation::Execute(payload) => {
        let conn = self.connection_for(&database, &db_path)?;
        Ok(OperationResult::Execute(handlers::execute(&conn, &payload).await?))
      }
      Operation::Rowdata(payload) => {
        let conn = self.connection_for(&database, &db_path)?;
        let result = handlers::rowdata(
          &conn,
          &payload,
          self.config.default_row_cap,
          self.config.default_byte_cap,
          &db_path,
        )
        .await?;
        Ok(OperationResult::Rowdata(result))
      }
      Operation::Size => Ok(OperationResult::Size(handlers::size(&db_path).await?)),
    }
  }

  fn connection_key(database: &DatabaseRef) -> (String, String) {
    (database.owner.clone(), database.name.clone())
  }

  /// Returns the cached connection for `database`, opening it on first
  /// use. `create` always opens explicitly via [`Self::open_connection`]
  /// right after materialising the seed file; every other handler goes
  /// through here.
  fn connection_for(&self, database: &DatabaseRef, db_path: &Path) -> Result<Connection, Error> {
    let key = Self::connection_key(database);
    if let Some(conn) = self.connections.lock().get(&key) {
      return Ok(conn.clone());
    }
    self.open_connection(database, db_path)
  }

  fn open_connection(&self, database: &DatabaseRef, db_path: &Path) -> Result<Connection, Error> {
    let key = Self::connection_key(database);
    let mut guard = self.connections.lock();
    if let Some(conn) = guard.get(&key) {
      return Ok(conn.clone());
    }

    let path = db_path.to_path_buf();
    let n_read_threads = std::thread::available_parallelism()
      .map(|n| n.get())
      .unwrap_or(1)
      .min(self.config.max_reader_threads);

    let conn = Connection::new(
      move || rusqlite::Connection::open(&path),
      Some(Options {
        n_read_threads,
        ..Default::default()
      }),
    )
    .map_err(|e: rusqlite::Error| Error::Internal(e.into()))?;

    guard.insert(key, conn.clone());
    Ok(conn)
  }

  fn evict_connection(&self, database: &DatabaseRef) {
    self.connections.lock().remove(&Self::connection_key(database));
  }
}
