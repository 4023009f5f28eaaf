use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use tokio::sync::RwLock;

/// Per-source politeness limit: `capacity` requests burst, one token back every
/// `refill_every_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_every_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            refill_every_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    fn quota(&self) -> Quota {
        let burst = NonZeroU32::new(self.capacity.max(1)).unwrap_or(NonZeroU32::MIN);
        match Quota::with_period(Duration::from_millis(self.refill_every_ms)) {
            Some(quota) => quota.allow_burst(burst),
            // A zero refill period means the source is not throttled.
            None => Quota::per_second(NonZeroU32::MAX),
        }
    }
}

type SourceLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Token bucket for one source, backed by a GCRA limiter.
pub struct TokenBucket {
    config: RateLimitConfig,
    limiter: SourceLimiter,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket").field("config", &self.config).finish()
    }
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self::from_config(RateLimitConfig {
            capacity,
            refill_every_ms: refill_every.as_millis() as u64,
        })
    }

    pub fn from_config(config: RateLimitConfig) -> Self {
        Self {
            config,
            limiter: RateLimiter::direct(config.quota()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Take one token, suspending until one is available.
    pub async fn take(&self) {
        self.limiter.until_ready().await;
    }

    pub fn try_take(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// Shared registry so every fetch against one source draws from the same bucket.
#[derive(Default)]
pub struct RateLimiterRegistry {
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl std::fmt::Debug for RateLimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterRegistry")
            .field("buckets", &"<HashMap>")
            .finish()
    }
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any bucket already installed for the source.
    pub async fn register(&self, source_id: &str, config: RateLimitConfig) {
        let mut buckets = self.buckets.write().await;
        buckets.insert(source_id.to_string(), Arc::new(TokenBucket::from_config(config)));
    }

    pub async fn bucket_for(&self, source_id: &str) -> Arc<TokenBucket> {
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(source_id) {
                return Arc::clone(bucket);
            }
        }

        let mut buckets = self.buckets.write().await;
        Arc::clone(
            buckets
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::from_config(RateLimitConfig::default()))),
        )
    }

    pub async fn acquire(&self, source_id: &str) {
        self.bucket_for(source_id).await.take().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn bucket_suspends_caller_until_refill() {
        let bucket = TokenBucket::new(2, Duration::from_millis(200));
        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() < Duration::from_millis(100));

        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn try_take_reports_exhaustion_and_refills_up_to_capacity() {
        let bucket = TokenBucket::new(1, Duration::from_millis(100));
        assert!(bucket.try_take());
        assert!(!bucket.try_take());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
    }

    #[test]
    fn zero_refill_period_never_throttles() {
        let bucket = TokenBucket::new(1, Duration::ZERO);
        assert!((0..50).all(|_| bucket.try_take()));
    }

    #[tokio::test]
    async fn registry_shares_one_bucket_per_source() {
        let registry = RateLimiterRegistry::new();
        registry
            .register(
                "bizinfo",
                RateLimitConfig {
                    capacity: 1,
                    refill_every_ms: 60_000,
                },
            )
            .await;
        let a = registry.bucket_for("bizinfo").await;
        let b = registry.bucket_for("bizinfo").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.try_take());
        assert!(!b.try_take());

        let unknown = registry.bucket_for("kstartup").await;
        assert_eq!(unknown.config(), RateLimitConfig::default());
    }
}
