//! Outbound HTTP pacing: per-host token buckets and bounded retry.
//!
//! Callers block (sleep) when a bucket is drained rather than failing; a
//! projected wait above the hard ceiling surfaces as a transient error so a
//! single starved host cannot stall a scoring task past its deadline.

use std::{
   collections::HashMap,
   thread,
   time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::error::{OssuaryError, Result};

/// Hard ceiling on how long one `acquire` may sleep.
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Unauthenticated GitHub REST budget (requests per hour).
pub const GITHUB_UNAUTHENTICATED_PER_HOUR: u32 = 60;
/// Authenticated GitHub REST budget (requests per hour).
pub const GITHUB_AUTHENTICATED_PER_HOUR: u32 = 5000;
/// Default budget for registry hosts (requests per minute).
pub const REGISTRY_PER_MINUTE: u32 = 120;

#[derive(Debug)]
struct Bucket {
   capacity:       f64,
   tokens:         f64,
   refill_per_sec: f64,
   last_refill:    Instant,
}

impl Bucket {
   fn new(capacity: u32, refill_per_sec: f64) -> Self {
      Self {
         capacity: f64::from(capacity),
         tokens: f64::from(capacity),
         refill_per_sec,
         last_refill: Instant::now(),
      }
   }

   fn refill(&mut self) {
      let elapsed = self.last_refill.elapsed().as_secs_f64();
      self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
      self.last_refill = Instant::now();
   }

   /// Seconds until one token is available; 0 when a token can be taken now.
   fn take_or_wait(&mut self) -> f64 {
      self.refill();
      if self.tokens >= 1.0 {
         self.tokens -= 1.0;
         return 0.0;
      }
      (1.0 - self.tokens) / self.refill_per_sec
   }
}

/// Shared per-host rate limiter. Hosts without a registered budget get the
/// registry default.
#[derive(Debug, Default)]
pub struct RateLimiter {
   buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
   pub fn new() -> Self {
      Self::default()
   }

   /// Register an explicit budget for a host, replacing any existing bucket.
   pub fn set_budget(&self, host: &str, capacity: u32, per_hour: u32) {
      let refill = f64::from(per_hour) / 3600.0;
      self
         .buckets
         .lock()
         .insert(host.to_string(), Bucket::new(capacity, refill));
   }

   /// Take one token for `host`, sleeping while the bucket refills. Returns
   /// `Transient` if the projected wait exceeds the 60 s ceiling.
   pub fn acquire(&self, host: &str) -> Result<()> {
      loop {
         let wait_secs = {
            let mut buckets = self.buckets.lock();
            let bucket = buckets.entry(host.to_string()).or_insert_with(|| {
               Bucket::new(REGISTRY_PER_MINUTE, f64::from(REGISTRY_PER_MINUTE) / 60.0)
            });
            bucket.take_or_wait()
         };

         if wait_secs <= 0.0 {
            return Ok(());
         }
         let wait = Duration::from_secs_f64(wait_secs);
         if wait > MAX_WAIT {
            return Err(OssuaryError::Transient(format!(
               "rate limit on {host} would require waiting {}s",
               wait.as_secs()
            )));
         }
         thread::sleep(wait);
      }
   }
}

/// Run `f` up to `max_retries` times, sleeping a jittered exponential backoff
/// between transient failures. Non-transient errors propagate immediately.
pub fn retry_transient<T, F>(max_retries: u32, initial_backoff_ms: u64, mut f: F) -> Result<T>
where
   F: FnMut() -> Result<T>,
{
   let mut attempt = 0;
   loop {
      attempt += 1;
      match f() {
         Ok(value) => return Ok(value),
         Err(e) if e.is_transient() && attempt < max_retries => {
            let base = initial_backoff_ms * (1 << (attempt - 1));
            let jitter = rand::random_range(0..=base / 2);
            let backoff = Duration::from_millis(base + jitter);
            eprintln!(
               "{}",
               crate::style::warning(&format!(
                  "retry {attempt}/{max_retries} after {}ms: {e}",
                  backoff.as_millis()
               ))
            );
            thread::sleep(backoff);
         },
         Err(e) if e.is_transient() => {
            return Err(OssuaryError::RetryExhausted { retries: max_retries, source: Box::new(e) });
         },
         Err(e) => return Err(e),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   // ========== Bucket Tests ==========

   #[test]
   fn test_bucket_takes_until_empty() {
      let mut bucket = Bucket::new(2, 0.001);
      assert_eq!(bucket.take_or_wait(), 0.0);
      assert_eq!(bucket.take_or_wait(), 0.0);
      assert!(bucket.take_or_wait() > 0.0);
   }

   #[test]
   fn test_bucket_refills_over_time() {
      let mut bucket = Bucket::new(1, 1000.0);
      assert_eq!(bucket.take_or_wait(), 0.0);
      std::thread::sleep(Duration::from_millis(5));
      assert_eq!(bucket.take_or_wait(), 0.0);
   }

   // ========== RateLimiter Tests ==========

   #[test]
   fn test_limiter_default_budget_allows_burst() {
      let limiter = RateLimiter::new();
      for _ in 0..10 {
         limiter.acquire("registry.npmjs.org").unwrap();
      }
   }

   #[test]
   fn test_limiter_starved_host_errors_past_ceiling() {
      let limiter = RateLimiter::new();
      // 1-token bucket refilling once per hour: draining it projects a
      // wait far past the 60 s ceiling.
      limiter.set_budget("api.github.com", 1, 1);
      limiter.acquire("api.github.com").unwrap();
      let err = limiter.acquire("api.github.com").unwrap_err();
      assert!(err.is_transient());
   }

   #[test]
   fn test_limiter_hosts_are_independent() {
      let limiter = RateLimiter::new();
      limiter.set_budget("a.example", 1, 1);
      limiter.acquire("a.example").unwrap();
      // b.example has its own default bucket
      limiter.acquire("b.example").unwrap();
   }

   // ========== retry_transient Tests ==========

   #[test]
   fn test_retry_succeeds_after_transient_failures() {
      let mut calls = 0;
      let result = retry_transient(3, 1, || {
         calls += 1;
         if calls < 3 {
            Err(OssuaryError::Transient("flaky".to_string()))
         } else {
            Ok(42)
         }
      });
      assert_eq!(result.unwrap(), 42);
      assert_eq!(calls, 3);
   }

   #[test]
   fn test_retry_exhaustion_wraps_source() {
      let result: Result<()> =
         retry_transient(2, 1, || Err(OssuaryError::Transient("down".to_string())));
      match result.unwrap_err() {
         OssuaryError::RetryExhausted { retries, .. } => assert_eq!(retries, 2),
         other => panic!("expected RetryExhausted, got {other}"),
      }
   }

   #[test]
   fn test_retry_does_not_retry_terminal_errors() {
      let mut calls = 0;
      let result: Result<()> = retry_transient(5, 1, || {
         calls += 1;
         Err(OssuaryError::RepoGone("deleted".to_string()))
      });
      assert!(matches!(result.unwrap_err(), OssuaryError::RepoGone(_)));
      assert_eq!(calls, 1);
   }
}
