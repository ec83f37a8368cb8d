#![forbid(unsafe_code, clippy::unwrap_used)]
#![allow(clippy::needless_return)]

//! Layered configuration: an optional TOML file overridden by
//! `LIVEDB_`-prefixed environment variables, following the field names
//! workers and the front-end read from their environment.

use livedb_model::Error;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct BlobStoreConfig {
  pub endpoint: Option<String>,
  pub access_key: Option<String>,
  pub secret: Option<String>,
  #[serde(default = "default_true")]
  pub tls: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationalStoreConfig {
  pub host: String,
  #[serde(default = "default_pg_port")]
  pub port: u16,
  pub user: String,
  pub password: String,
  pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  #[serde(default = "default_claim_batch")]
  pub claim_batch: u32,
  #[serde(default = "default_visibility_timeout_sec")]
  pub visibility_timeout_sec: u64,
  #[serde(default = "default_reap_grace_sec")]
  pub reap_grace_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
  #[serde(default = "default_row_cap")]
  pub default_row_cap: u32,
  #[serde(default = "default_byte_cap")]
  pub default_byte_cap: u64,
  #[serde(default = "default_wall_clock_sec")]
  pub query_wall_clock_sec: u64,
}

/// Top-level configuration object every `livedb-*` binary reads at
/// startup. `node_name`/`storage_dir` are only required on workers; the
/// front-end leaves them unset.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub node_name: Option<String>,
  pub storage_dir: Option<String>,
  pub blob_store: BlobStoreConfig,
  pub relational_store: RelationalStoreConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub limits: LimitsConfig,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      claim_batch: default_claim_batch(),
      visibility_timeout_sec: default_visibility_timeout_sec(),
      reap_grace_sec: default_reap_grace_sec(),
    }
  }
}

impl Default for LimitsConfig {
  fn default() -> Self {
    Self {
      default_row_cap: default_row_cap(),
      default_byte_cap: default_byte_cap(),
      query_wall_clock_sec: default_wall_clock_sec(),
    }
  }
}

fn default_true() -> bool {
  true
}
fn default_pg_port() -> u16 {
  5432
}
fn default_claim_batch() -> u32 {
  1
}
fn default_visibility_timeout_sec() -> u64 {
  30
}
fn default_reap_grace_sec() -> u64 {
  3600
}
fn default_row_cap() -> u32 {
  1_000
}
fn default_byte_cap() -> u64 {
  10 * 1024 * 1024
}
fn default_wall_clock_sec() -> u64 {
  30
}

impl Config {
  /// Loads configuration from `path` (if it exists) then overlays
  /// `LIVEDB_`-prefixed environment variables, `__`-separated for nested
  /// keys (e.g. `LIVEDB_RELATIONAL_STORE__HOST`).
  pub fn load(path: Option<&str>) -> Result<Self, Error> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
      builder = builder.add_source(config::File::with_name(path).required(false));
    }

    builder = builder.add_source(
      config::Environment::with_prefix("LIVEDB")
        .separator("__")
        .try_parsing(true),
    );

    builder
      .build()
      .and_then(|c| c.try_deserialize())
      .map_err(|e| Error::Validation(format!("invalid configuration: {e}")))
  }

  pub fn relational_store_url(&self) -> String {
    let rs = &self.relational_store;
    format!(
      "postgres://{}:{}@{}:{}/{}",
      rs.user, rs.password, rs.host, rs.port, rs.database
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_toml(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn loads_required_fields_and_fills_in_defaults() {
    let file = write_toml(
      r#"
      node_name = "node-a"
      storage_dir = "/var/lib/livedb"

      [blob_store]
      tls = true

      [relational_store]
      host = "db.internal"
      user = "livedb"
      password = "secret"
      database = "livedb"
      "#,
    );

    let config = Config::load(Some(file.path().with_extension("").to_str().unwrap())).unwrap();

    assert_eq!(config.node_name.as_deref(), Some("node-a"));
    assert_eq!(config.relational_store.port, 5432);
    assert_eq!(config.queue.claim_batch, 1);
    assert_eq!(config.limits.default_row_cap, 1_000);
  }

  #[test]
  fn missing_required_field_is_a_validation_error() {
    let file = write_toml(
      r#"
      [blob_store]

      [relational_store]
      host = "db.internal"
      user = "livedb"
      password = "secret"
      database = "livedb"
      "#,
    );

    let err = Config::load(Some(file.path().with_extension("").to_str().unwrap())).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
  }
}
