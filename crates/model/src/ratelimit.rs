/// In-memory view of a token bucket row. `tokens`/`last_refill` are kept
/// as plain fields rather than behind a lock; `livedb-ratelimit` owns
/// concurrency control (one transaction per decision).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitBucket {
  pub tokens: f64,
  pub last_refill: chrono::DateTime<chrono::Utc>,
  pub capacity: Option<f64>,
  pub refill_per_second: f64,
}

impl RateLimitBucket {
  pub fn unlimited() -> Self {
    Self {
      tokens: 0.0,
      last_refill: chrono::Utc::now(),
      capacity: None,
      refill_per_second: 0.0,
    }
  }

  /// Refills to `now`, then attempts to take one token. Returns `true`
  /// (and mutates `self`) if the request is allowed.
  pub fn try_take(&mut self, now: chrono::DateTime<chrono::Utc>) -> bool {
    let Some(capacity) = self.capacity else {
      return true;
    };

    let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
    self.tokens = (self.tokens + elapsed * self.refill_per_second).min(capacity);
    self.last_refill = now;

    if self.tokens >= 1.0 {
      self.tokens -= 1.0;
      true
    } else {
      false
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn unlimited_always_allows() {
    let mut b = RateLimitBucket::unlimited();
    let now = chrono::Utc::now();
    for _ in 0..1000 {
      assert!(b.try_take(now));
    }
  }

  #[test]
  fn capacity_one_rate_one_matches_scenario_5() {
    // capacity=1, rate=1/s: first allowed, second immediately denied,
    // then allowed again after a 2s pause (see spec scenario 5).
    let t0 = chrono::Utc::now();
    let mut b = RateLimitBucket {
      tokens: 1.0,
      last_refill: t0,
      capacity: Some(1.0),
      refill_per_second: 1.0,
    };

    assert!(b.try_take(t0));
    assert!(!b.try_take(t0));

    let t1 = t0 + Duration::seconds(2);
    assert!(b.try_take(t1));
    assert!(!b.try_take(t1));
  }

  #[test]
  fn invariant_5_bound_over_window() {
    // allowed requests in any window W <= C + floor(R*W)
    let t0 = chrono::Utc::now();
    let capacity = 5.0;
    let rate = 2.0;
    let mut b = RateLimitBucket {
      tokens: capacity,
      last_refill: t0,
      capacity: Some(capacity),
      refill_per_second: rate,
    };

    let window_secs = 10i64;
    let mut allowed = 0u32;
    for i in 0..(window_secs * 10) {
      let now = t0 + Duration::milliseconds(i * 100);
      if b.try_take(now) {
        allowed += 1;
      }
    }

    let bound = capacity + (rate * window_secs as f64).floor();
    assert!((allowed as f64) <= bound);
  }
}
