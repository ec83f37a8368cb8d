use clap::{Args as ClapArgs, Parser, Subcommand};

/// Command line arguments shared by every `livedb` subcommand.
///
/// NOTE: same rule of thumb as always — if it requires a process restart
/// it's a CLI flag here, otherwise it belongs in the layered config file.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
  /// Path to a TOML config file (without extension), overridden by any
  /// `LIVEDB_`-prefixed environment variable.
  #[arg(long, env, default_value = "livedb")]
  pub config: String,

  /// Enables verbose, human-readable logging instead of the default
  /// structured JSON output.
  #[arg(long, env)]
  pub dev: bool,

  #[command(subcommand)]
  pub cmd: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// Runs a live-node SQLite worker for the configured node.
  Worker(WorkerArgs),
  /// Runs the HTTP front-end that dispatches jobs to live-node workers.
  Serve(ServeArgs),
  /// Sets or updates a rate-limit bucket's capacity and refill rate.
  ConfigureRateLimit(ConfigureRateLimitArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct WorkerArgs {
  /// Overrides `node_name` from the config file.
  #[arg(long, env)]
  pub node_name: Option<String>,

  /// Number of general-purpose worker tasks claiming non-`create` jobs.
  #[arg(long, env, default_value_t = 4)]
  pub n_workers: usize,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ServeArgs {
  /// Authority (`<host>:<port>`) the HTTP front-end binds to.
  #[arg(long, env, default_value = "localhost:4100")]
  pub address: String,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ConfigureRateLimitArgs {
  /// API key id the bucket is keyed by.
  pub api_key_id: String,
  /// Bucket capacity in tokens; omit to leave uncapped.
  #[arg(long)]
  pub capacity: Option<f64>,
  /// Tokens refilled per second.
  #[arg(long)]
  pub refill_per_second: f64,
}
