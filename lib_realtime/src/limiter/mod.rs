//! # Admission Control
//!
//! A token bucket per caller, stored in a `BucketStore` shared by every server
//! instance. The store runs refill-and-consume as one atomic step per key, so
//! concurrent checks for the same caller never both spend the last token.
//!
//! A store failure is an error, never an implicit allow: `admit` turns it into
//! a rejection.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{LimiterError, RealtimeError};

pub mod bucket;
pub mod memory;

pub use bucket::{Admission, BucketState};
pub use memory::MemoryBucketStore;

/// Bucket parameters for one protected operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BucketPolicy {
    pub capacity: f64,
    pub refill_per_sec: f64,
    /// Idle buckets are deleted after this many seconds.
    pub expiry_secs: u64,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            capacity: 15.0,
            refill_per_sec: 0.25,
            expiry_secs: 60,
        }
    }
}

impl BucketPolicy {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

/// Where bucket state lives.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Atomically refills the bucket under `key` and takes one token.
    /// `Ok(false)` is a denial; `Err` means the store could not decide.
    async fn refill_and_consume(
        &self,
        key: &str,
        policy: &BucketPolicy,
    ) -> Result<bool, LimiterError>;
}

/// Millisecond time source for stores that keep their own clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Token-bucket limiter for one scope, e.g. `http` or `ws_write`.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    policy: BucketPolicy,
    scope: String,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn BucketStore>,
        policy: BucketPolicy,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            store,
            policy,
            scope: scope.into(),
        }
    }

    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }

    /// Store key for `identity` in this scope.
    pub fn key_for(&self, identity: &str) -> String {
        format!("token_bucket:{}:{}", self.scope, identity)
    }

    /// `Ok(true)` admits, `Ok(false)` denies, `Err` means undecided.
    pub async fn allow(&self, identity: &str) -> Result<bool, LimiterError> {
        let key = self.key_for(identity);
        let allowed = self.store.refill_and_consume(&key, &self.policy).await?;
        if !allowed {
            debug!(scope = %self.scope, identity, "admission denied");
        }
        Ok(allowed)
    }

    /// Fail-closed wrapper around [`allow`](Self::allow).
    pub async fn admit(&self, identity: &str) -> Result<(), RealtimeError> {
        match self.allow(identity).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(RealtimeError::AdmissionDenied),
            Err(e) => {
                warn!(scope = %self.scope, identity, error = %e, "limiter unavailable, rejecting");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    #[async_trait]
    impl BucketStore for Unreachable {
        async fn refill_and_consume(
            &self,
            _key: &str,
            _policy: &BucketPolicy,
        ) -> Result<bool, LimiterError> {
            Err(LimiterError::Unreachable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn boundary_with_manual_clock() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryBucketStore::with_clock(clock.clone()));
        let limiter = RateLimiter::new(store, BucketPolicy::default(), "http");

        for _ in 0..15 {
            assert!(limiter.allow("10.0.0.1").await.unwrap());
        }
        assert!(!limiter.allow("10.0.0.1").await.unwrap());
        // Other callers have their own bucket.
        assert!(limiter.allow("10.0.0.2").await.unwrap());

        clock.advance(Duration::from_secs(4));
        assert!(limiter.allow("10.0.0.1").await.unwrap());
        assert!(!limiter.allow("10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn store_failure_is_rejection() {
        let limiter = RateLimiter::new(Arc::new(Unreachable), BucketPolicy::default(), "http");
        assert!(limiter.allow("x").await.is_err());
        let err = limiter.admit("x").await.unwrap_err();
        assert_eq!(err.kind(), "dependency");
    }

    #[tokio::test]
    async fn denial_is_distinct() {
        let policy = BucketPolicy {
            capacity: 1.0,
            ..Default::default()
        };
        let limiter = RateLimiter::new(Arc::new(MemoryBucketStore::new()), policy, "ws_write");
        assert!(limiter.admit("u1").await.is_ok());
        assert_eq!(limiter.admit("u1").await, Err(RealtimeError::AdmissionDenied));
    }

    #[test]
    fn keys_are_scoped() {
        let store = Arc::new(MemoryBucketStore::new());
        let limiter = RateLimiter::new(store, BucketPolicy::default(), "http");
        assert_eq!(limiter.key_for("1.2.3.4"), "token_bucket:http:1.2.3.4");
    }
}
