#![forbid(unsafe_code, clippy::unwrap_used)]
#![allow(clippy::needless_return)]

//! Per-api-key token bucket, persisted to the relational store so a
//! restart doesn't reset it, fronted by a short-lived in-memory cache of
//! each key's (capacity, refill_per_second) pair so high-volume callers
//! don't pay a config lookup on every decision. Token state itself is
//! always read and written inside one transaction per decision —the
//! cache coalesces the config join, not the durability guarantee.

use chrono::Utc;
use livedb_model::{Error, RateLimitBucket};
use mini_moka::sync::Cache;
use sqlx::{PgPool, Row};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct BucketConfig {
  capacity: Option<f64>,
  refill_per_second: f64,
}

pub struct RateLimiter {
  pool: PgPool,
  config_cache: Cache<String, BucketConfig>,
}

impl RateLimiter {
  pub fn new(pool: PgPool) -> Self {
    Self {
      pool,
      config_cache: Cache::builder()
        .max_capacity(10_000)
        .time_to_live(Duration::from_secs(60))
        .build(),
    }
  }

  /// Registers (or updates) the bucket configuration for `api_key_id`.
  /// `capacity: None` means unlimited; such keys bypass the check
  /// entirely.
  pub async fn configure(
    &self,
    api_key_id: &str,
    capacity: Option<f64>,
    refill_per_second: f64,
  ) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO rate_limits (api_key_id, tokens, last_refill_ts, capacity, refill_per_second)
      VALUES ($1, $2, NOW(), $3, $4)
      ON CONFLICT (api_key_id) DO UPDATE
      SET capacity = EXCLUDED.capacity, refill_per_second = EXCLUDED.refill_per_second
      "#,
    )
    .bind(api_key_id)
    .bind(capacity.unwrap_or(0.0))
    .bind(capacity)
    .bind(refill_per_second)
    .execute(&self.pool)
    .await
    .map_err(|e| Error::Internal(e.into()))?;

    self.config_cache.insert(
      api_key_id.to_string(),
      BucketConfig {
        capacity,
        refill_per_second,
      },
    );

    Ok(())
  }

  /// Returns `Ok(())` if the request is allowed, `Err(Error::RateLimited)`
  /// if the bucket is empty. Unlimited keys (no row, or `capacity = NULL`)
  /// always succeed without touching the store.
  pub async fn check(&self, api_key_id: &str) -> Result<(), Error> {
    let config = self.load_config(api_key_id).await?;

    let Some(config) = config else {
      return Ok(());
    };
    if config.capacity.is_none() {
      return Ok(());
    }

    let mut tx = self
      .pool
      .begin()
      .await
      .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

    let row = sqlx::query(
      "SELECT tokens, last_refill_ts FROM rate_limits WHERE api_key_id = $1 FOR UPDATE",
    )
    .bind(api_key_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| Error::Internal(e.into()))?;

    let mut bucket = RateLimitBucket {
      tokens: row.try_get("tokens").map_err(|e| Error::Internal(e.into()))?,
      last_refill: row
        .try_get("last_refill_ts")
        .map_err(|e| Error::Internal(e.into()))?,
      capacity: config.capacity,
      refill_per_second: config.refill_per_second,
    };

    let allowed = bucket.try_take(Utc::now());

    sqlx::query("UPDATE rate_limits SET tokens = $1, last_refill_ts = $2 WHERE api_key_id = $3")
      .bind(bucket.tokens)
      .bind(bucket.last_refill)
      .bind(api_key_id)
      .execute(&mut *tx)
      .await
      .map_err(|e| Error::Internal(e.into()))?;

    tx.commit().await.map_err(|e| Error::Internal(e.into()))?;

    if allowed {
      Ok(())
    } else {
      Err(Error::RateLimited)
    }
  }

  async fn load_config(&self, api_key_id: &str) -> Result<Option<BucketConfig>, Error> {
    if let Some(config) = self.config_cache.get(api_key_id) {
      return Ok(Some(config));
    }

    let row = sqlx::query("SELECT capacity, refill_per_second FROM rate_limits WHERE api_key_id = $1")
      .bind(api_key_id)
      .fetch_optional(&self.pool)
      .await
      .map_err(|e| Error::Internal(e.into()))?;

    let Some(row) = row else {
      return Ok(None);
    };

    let config = BucketConfig {
      capacity: row.try_get("capacity").map_err(|e| Error::Internal(e.into()))?,
      refill_per_second: row
        .try_get("refill_per_second")
        .map_err(|e| Error::Internal(e.into()))?,
    };
    self.config_cache.insert(api_key_id.to_string(), config);

    Ok(Some(config))
  }
}
