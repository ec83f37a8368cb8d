#![allow(clippy::needless_return)]

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use livedb_cli::{Args, Command, ConfigureRateLimitArgs, ServeArgs, WorkerArgs};
use livedb_client::Client;
use livedb_config::Config;
use livedb_queue::Queue;
use livedb_ratelimit::RateLimiter;
use livedb_worker::{LiveNodeWorker, WorkerConfig};
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use sqlx::postgres::PgPoolOptions;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_logger(dev: bool) {
  let filter = if dev {
    "info,livedb=debug"
  } else {
    "info"
  };

  let subscriber = tracing_subscriber::fmt().with_env_filter(
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
  );

  if dev {
    subscriber.init();
  } else {
    subscriber.json().init();
  }
}

fn build_object_store(config: &Config) -> Result<Arc<dyn ObjectStore>, BoxError> {
  let blob = &config.blob_store;

  if let Some(endpoint) = &blob.endpoint {
    let mut builder = AmazonS3Builder::from_env()
      .with_endpoint(endpoint)
      .with_bucket_name("livedb");

    if !blob.tls {
      builder = builder
        .with_client_options(object_store::ClientOptions::default().with_allow_http(true));
    }
    if let Some(access_key) = &blob.access_key {
      builder = builder.with_access_key_id(access_key);
    }
    if let Some(secret) = &blob.secret {
      builder = builder.with_secret_access_key(secret);
    }

    return Ok(Arc::new(builder.build()?));
  }

  let storage_dir = config
    .storage_dir
    .as_deref()
    .ok_or("storage_dir is required when blob_store.endpoint is unset")?;
  Ok(Arc::new(LocalFileSystem::new_with_prefix(storage_dir)?))
}

async fn connect_placement_pool(config: &Config) -> Result<sqlx::PgPool, BoxError> {
  Ok(
    PgPoolOptions::new()
      .max_connections(10)
      .connect(&config.relational_store_url())
      .await?,
  )
}

async fn run_worker(config: Config, args: WorkerArgs) -> Result<(), BoxError> {
  let node_name = args
    .node_name
    .or_else(|| config.node_name.clone())
    .ok_or("node_name must be set via --node-name or the config file")?;
  let storage_dir = config
    .storage_dir
    .clone()
    .ok_or("storage_dir is required to run a worker")?;

  let placement_pool = connect_placement_pool(&config).await?;
  let queue_pool = connect_placement_pool(&config).await?;
  let queue = Arc::new(Queue::connect(queue_pool).await?);
  let object_store = build_object_store(&config)?;

  let worker_config = WorkerConfig {
    n_workers: args.n_workers,
    default_row_cap: config.limits.default_row_cap,
    default_byte_cap: config.limits.default_byte_cap,
    query_wall_clock: std::time::Duration::from_secs(config.limits.query_wall_clock_sec),
    visibility_timeout: std::time::Duration::from_secs(config.queue.visibility_timeout_sec),
    recovery_sweep_interval: std::time::Duration::from_secs(30),
    max_reader_threads: 4,
  };

  let worker = LiveNodeWorker::new(
    node_name,
    PathBuf::from(storage_dir),
    queue,
    placement_pool,
    object_store,
    worker_config,
  );

  worker.run().await;
  Ok(())
}

async fn run_serve(config: Config, args: ServeArgs) -> Result<(), BoxError> {
  let placement_pool = connect_placement_pool(&config).await?;
  let queue_pool = connect_placement_pool(&config).await?;
  let rate_limiter_pool = connect_placement_pool(&config).await?;

  let queue = Queue::connect(queue_pool).await?;
  let rate_limiter = RateLimiter::new(rate_limiter_pool);
  let client = Arc::new(Client::new(queue, rate_limiter));

  let principals: Arc<dyn livedb_frontend::PrincipalDirectory> = Arc::new(EnvPrincipalDirectory);
  let state = livedb_frontend::AppState::new(client, placement_pool, principals);
  let app = livedb_frontend::router(state);

  tracing::info!(address = %args.address, "livedb front-end listening");
  let listener = tokio::net::TcpListener::bind(&args.address).await?;
  axum::serve(listener, app).await?;
  Ok(())
}

async fn run_configure_rate_limit(config: Config, args: ConfigureRateLimitArgs) -> Result<(), BoxError> {
  let pool = connect_placement_pool(&config).await?;
  let rate_limiter = RateLimiter::new(pool);
  rate_limiter
    .configure(&args.api_key_id, args.capacity, args.refill_per_second)
    .await?;
  println!("configured rate limit bucket for {}", args.api_key_id);
  Ok(())
}

/// Resolves every API key to an `Admin` `ReadWrite` principal keyed by
/// the key string itself. Real credential issuance is an external
/// collaborator; this stands in until one is wired up.
struct EnvPrincipalDirectory;

impl livedb_frontend::PrincipalDirectory for EnvPrincipalDirectory {
  fn resolve(&self, apikey: &str) -> Result<livedb_model::Principal, livedb_model::Error> {
    if apikey.is_empty() {
      return Err(livedb_model::Error::Unauthorized("missing api key".into()));
    }
    Ok(livedb_model::Principal {
      username: apikey.to_string(),
      permission: livedb_model::Permission::ReadWrite,
      api_key_id: Some(apikey.to_string()),
    })
  }
}

async fn async_main() -> Result<(), BoxError> {
  let args = Args::parse();
  init_logger(args.dev);

  let config = Config::load(Some(&args.config))?;

  match args.cmd {
    Command::Worker(worker_args) => run_worker(config, worker_args).await,
    Command::Serve(serve_args) => run_serve(config, serve_args).await,
    Command::ConfigureRateLimit(rl_args) => run_configure_rate_limit(config, rl_args).await,
  }
}

fn main() -> Result<(), BoxError> {
  return tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?
    .block_on(async_main());
}
