//! Per-user token buckets.
//!
//! Each key owns a bucket holding at most `burst` tokens that refills at
//! `rate` tokens per second. Taking from an empty bucket fails immediately;
//! nothing is queued. Time comes from the caller so tests can drive it with a
//! fixed clock.
//!
//! Once more than `max_keys` buckets are tracked, buckets that have refilled
//! to `burst` are dropped; a fresh bucket for the same key is identical.

use std::{collections::HashMap, sync::Mutex};

use chrono::{DateTime, Utc};

use crate::{Error, Result};

/// Default number of tracked keys before idle buckets are pruned.
pub const DEFAULT_MAX_KEYS: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Bucket {
  tokens:      f64,
  last_refill: DateTime<Utc>,
}

impl Bucket {
  fn refilled(&self, now: DateTime<Utc>, rate: f64, burst: f64) -> f64 {
    let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
    (self.tokens + elapsed * rate).min(burst)
  }
}

/// A token bucket per `i64` key (user id).
#[derive(Debug)]
pub struct RateLimiter {
  name:     &'static str,
  rate:     f64,
  burst:    f64,
  max_keys: usize,
  buckets:  Mutex<HashMap<i64, Bucket>>,
}

impl RateLimiter {
  pub fn new(name: &'static str, rate: f64, burst: u32) -> Self {
    Self {
      name,
      rate: rate.max(0.0),
      burst: f64::from(burst.max(1)),
      max_keys: DEFAULT_MAX_KEYS,
      buckets: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_max_keys(mut self, max_keys: usize) -> Self {
    self.max_keys = max_keys.max(1);
    self
  }

  /// Number of buckets currently tracked.
  pub fn tracked(&self) -> usize {
    self.buckets.lock().map(|b| b.len()).unwrap_or(0)
  }

  /// Take one token for `key` at `now`, or fail with `RateLimited`.
  pub fn try_acquire(&self, key: i64, now: DateTime<Utc>) -> Result<()> {
    let mut buckets = self
      .buckets
      .lock()
      .map_err(|_| Error::Transient(format!("{} limiter poisoned", self.name)))?;
    if buckets.len() >= self.max_keys && !buckets.contains_key(&key) {
      let (rate, burst) = (self.rate, self.burst);
      let before = buckets.len();
      buckets.retain(|_, b| b.refilled(now, rate, burst) < burst);
      tracing::debug!(limiter = self.name, pruned = before - buckets.len(), "idle buckets pruned");
    }
    let bucket = buckets
      .entry(key)
      .or_insert(Bucket { tokens: self.burst, last_refill: now });

    if now > bucket.last_refill {
      bucket.tokens = bucket.refilled(now, self.rate, self.burst);
      bucket.last_refill = now;
    }

    if bucket.tokens < 1.0 {
      return Err(Error::RateLimited(format!("{} rate limit exceeded", self.name)));
    }
    bucket.tokens -= 1.0;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone};

  use super::*;

  #[test]
  fn burst_then_refill() {
    let limiter = RateLimiter::new("wiki", 1.0, 2);
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    assert!(limiter.try_acquire(1, t0).is_ok());
    assert!(limiter.try_acquire(1, t0).is_ok());
    let err = limiter.try_acquire(1, t0).unwrap_err();
    assert!(err.is_rate_limited());

    // Other users have their own bucket.
    assert!(limiter.try_acquire(2, t0).is_ok());

    assert!(limiter.try_acquire(1, t0 + Duration::seconds(1)).is_ok());
    assert!(limiter.try_acquire(1, t0 + Duration::seconds(1)).is_err());
  }

  #[test]
  fn refill_never_exceeds_burst() {
    let limiter = RateLimiter::new("mark", 10.0, 1);
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let later = t0 + Duration::hours(1);
    assert!(limiter.try_acquire(1, later).is_ok());
    assert!(limiter.try_acquire(1, later).is_err());
  }

  #[test]
  fn full_buckets_are_pruned_past_the_key_limit() {
    let limiter = RateLimiter::new("wiki", 1.0, 2).with_max_keys(2);
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    limiter.try_acquire(1, t0).unwrap();
    limiter.try_acquire(2, t0).unwrap();
    assert_eq!(limiter.tracked(), 2);

    // Both have refilled by now, so neither survives the next new key.
    limiter.try_acquire(3, t0 + Duration::seconds(5)).unwrap();
    assert_eq!(limiter.tracked(), 1);

    // Draining buckets are kept even past the limit.
    let t1 = t0 + Duration::seconds(5);
    limiter.try_acquire(3, t1).unwrap();
    assert!(limiter.try_acquire(3, t1).is_err());
    limiter.try_acquire(4, t1).unwrap();
    limiter.try_acquire(5, t1).unwrap();
    assert_eq!(limiter.tracked(), 3);
  }
}
