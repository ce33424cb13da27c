//! In-process token bucket rate limiter.
//!
//! Buckets live in LRU maps split into shards by key hash, so callers using
//! different keys rarely contend and memory stays bounded however many
//! client IPs show up.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{Rate, RateLimitInfo, RateLimiter};
use super::key::RateLimitKey;
use crate::error::Result;
use crate::metrics::GatehouseMetrics;

/// Default number of keys tracked before the least recently used is evicted.
const DEFAULT_MAX_KEYS: usize = 10000;
/// Number of independently locked shards.
const DEFAULT_SHARDS: usize = 16;
/// Refill shortfall treated as a whole token. Waiting exactly `1/rate` can
/// land a nanosecond short of one token when `1/rate` is not a whole number
/// of nanoseconds.
const TOKEN_EPSILON: f64 = 1e-6;

/// Token bucket state for a single key.
#[derive(Debug, Clone)]
struct TokenBucket {
    /// Tokens currently available
    tokens: f64,
    /// When tokens were last added
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Tokens available at `now`, without recording the refill.
    fn projected(&self, capacity: f64, rate: f64, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        (self.tokens + elapsed.as_secs_f64() * rate).min(capacity)
    }

    fn refill(&mut self, capacity: f64, rate: f64, now: Instant) {
        self.tokens = self.projected(capacity, rate, now);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

/// A rate limiter that keeps one token bucket per key in process memory.
///
/// Decisions are exact and cheap but are not shared with other processes.
pub struct TokenBucketLimiter {
    /// Buckets indexed by `kind:value`, split across shards
    shards: Box<[Mutex<LruCache<String, TokenBucket>>]>,
    /// Refill rate
    rate: Rate,
    /// Bucket capacity
    burst: u32,
    metrics: Option<Arc<GatehouseMetrics>>,
}

impl TokenBucketLimiter {
    /// Create a new limiter tracking up to the default number of keys.
    pub fn new(rate: Rate, burst: u32) -> Self {
        Self::with_max_keys(rate, burst, DEFAULT_MAX_KEYS)
    }

    /// Create a new limiter tracking at most `max_keys` keys.
    pub fn with_max_keys(rate: Rate, burst: u32, max_keys: usize) -> Self {
        Self::with_shards(rate, burst, max_keys, DEFAULT_SHARDS)
    }

    pub(crate) fn with_shards(rate: Rate, burst: u32, max_keys: usize, shards: usize) -> Self {
        let max_keys = max_keys.max(1);
        let shard_count = shards.clamp(1, max_keys);
        // Floor division keeps the total at or under max_keys
        let per_shard = NonZeroUsize::new(max_keys / shard_count).unwrap_or(NonZeroUsize::MIN);

        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();

        Self {
            shards,
            rate,
            burst,
            metrics: None,
        }
    }

    /// Count every decision in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<GatehouseMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn shard_for(&self, id: &str) -> &Mutex<LruCache<String, TokenBucket>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    pub(crate) fn allow_n_at(&self, key: &RateLimitKey, n: u32, now: Instant) -> bool {
        let allowed = self.take_at(key, n, now);
        if let Some(metrics) = &self.metrics {
            metrics.record_decision(key.kind(), allowed);
        }
        allowed
    }

    fn take_at(&self, key: &RateLimitKey, n: u32, now: Instant) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.burst {
            trace!(key = %key, hits = n, burst = self.burst, "Request larger than bucket");
            return false;
        }

        let id = key.to_string_key();
        let capacity = f64::from(self.burst);
        let rate = self.rate.as_per_second();

        let mut shard = self.shard_for(&id).lock();
        if !shard.contains(&id) {
            debug!(key = %key, burst = self.burst, "Creating token bucket");
        }
        let bucket = shard.get_or_insert_mut(id, || TokenBucket::full(capacity, now));
        bucket.refill(capacity, rate, now);

        let needed = f64::from(n);
        if bucket.tokens + TOKEN_EPSILON >= needed {
            bucket.tokens = (bucket.tokens - needed).max(0.0);
            true
        } else {
            debug!(key = %key, tokens = bucket.tokens, hits = n, "Rate limit exceeded");
            false
        }
    }

    pub(crate) fn rate_limit_info_at(
        &self,
        key: &RateLimitKey,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> RateLimitInfo {
        let id = key.to_string_key();
        let capacity = f64::from(self.burst);
        let rate = self.rate.as_per_second();

        let tokens = {
            let shard = self.shard_for(&id).lock();
            shard
                .peek(&id)
                .map(|bucket| bucket.projected(capacity, rate, now))
                .unwrap_or(capacity)
        };

        let whole_tokens = (tokens + TOKEN_EPSILON).floor();
        let allowed = whole_tokens >= 1.0;
        let reset_time = add_duration(wall_now, secs_to_duration((capacity - tokens) / rate));
        let retry_after = if allowed {
            None
        } else {
            Some(secs_to_duration((1.0 - tokens) / rate))
        };

        RateLimitInfo {
            allowed,
            limit: u64::from(self.burst),
            remaining: whole_tokens.clamp(0.0, capacity) as u64,
            reset_time,
            retry_after,
        }
    }

    /// Get the number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn add_duration(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| time.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn allow_n(&self, key: &RateLimitKey, n: u32) -> bool {
        self.allow_n_at(key, n, Instant::now())
    }

    fn limit(&self, _key: &RateLimitKey) -> Rate {
        self.rate
    }

    fn burst(&self, _key: &RateLimitKey) -> u32 {
        self.burst
    }

    async fn rate_limit_info(&self, key: &RateLimitKey) -> Result<RateLimitInfo> {
        Ok(self.rate_limit_info_at(key, Instant::now(), Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::KeyKind;

    fn key(value: &str) -> RateLimitKey {
        RateLimitKey::ip(value).unwrap()
    }

    #[test]
    fn test_burst_then_refill() {
        let limiter = TokenBucketLimiter::new(Rate::per_second(2.0), 5);
        let client = key("10.0.0.1");
        let t0 = Instant::now();

        for i in 1..=5 {
            assert!(limiter.allow_n_at(&client, 1, t0), "Request {} should be admitted", i);
        }
        assert!(!limiter.allow_n_at(&client, 1, t0));

        // 1/rate seconds later exactly one more token is available
        let t1 = t0 + Duration::from_millis(500);
        assert!(limiter.allow_n_at(&client, 1, t1));
        assert!(!limiter.allow_n_at(&client, 1, t1));
    }

    #[test]
    fn test_refill_interval_with_inexact_nanoseconds() {
        // 1/3 s is not a whole number of nanoseconds
        let limiter = TokenBucketLimiter::new(Rate::per_second(3.0), 2);
        let client = key("10.0.0.9");
        let t0 = Instant::now();

        assert!(limiter.allow_n_at(&client, 2, t0));
        assert!(!limiter.allow_n_at(&client, 1, t0));

        let t1 = t0 + Duration::from_secs_f64(1.0 / 3.0);
        assert!(limiter.rate_limit_info_at(&client, t1, Utc::now()).allowed);
        assert!(limiter.allow_n_at(&client, 1, t1));
        assert!(!limiter.allow_n_at(&client, 1, t1));

        let t2 = t1 + Duration::from_secs_f64(1.0 / 3.0);
        assert!(limiter.allow_n_at(&client, 1, t2));
        assert!(!limiter.allow_n_at(&client, 1, t2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_bucket() {
        let metrics = Arc::new(GatehouseMetrics::new().unwrap());
        let limiter = Arc::new(
            TokenBucketLimiter::new(Rate::new(1, Duration::from_secs(3600)), 50)
                .with_metrics(metrics.clone()),
        );
        let client = key("10.0.0.10");

        let tasks: Vec<_> = (0..400)
            .map(|_| {
                let limiter = limiter.clone();
                let client = client.clone();
                tokio::spawn(async move { limiter.allow(&client).await })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(metrics.rate_limit_hits(KeyKind::Ip), 50);
        assert_eq!(metrics.rate_limit_blocks(KeyKind::Ip), 350);
    }

    #[test]
    fn test_oversized_request_counts_as_block() {
        let metrics = Arc::new(GatehouseMetrics::new().unwrap());
        let limiter = TokenBucketLimiter::new(Rate::per_second(1.0), 2).with_metrics(metrics.clone());
        let user = RateLimitKey::user("alice").unwrap();
        let t0 = Instant::now();

        assert!(!limiter.allow_n_at(&user, 5, t0));
        assert!(limiter.allow_n_at(&user, 2, t0));

        assert_eq!(metrics.rate_limit_blocks(KeyKind::User), 1);
        assert_eq!(metrics.rate_limit_hits(KeyKind::User), 1);
        assert_eq!(metrics.rate_limit_hits(KeyKind::Ip), 0);
    }

    #[test]
    fn test_refill_is_capped_at_burst() {
        let limiter = TokenBucketLimiter::new(Rate::per_second(100.0), 3);
        let client = key("10.0.0.2");
        let t0 = Instant::now();

        assert!(limiter.allow_n_at(&client, 3, t0));
        let later = t0 + Duration::from_secs(60);
        assert!(limiter.allow_n_at(&client, 3, later));
        assert!(!limiter.allow_n_at(&client, 1, later));
    }

    #[test]
    fn test_rejection_has_no_side_effects() {
        let limiter = TokenBucketLimiter::new(Rate::per_second(1.0), 4);
        let client = key("10.0.0.3");
        let t0 = Instant::now();

        assert!(limiter.allow_n_at(&client, 3, t0));
        assert!(!limiter.allow_n_at(&client, 2, t0));
        // The failed request took nothing
        assert!(limiter.allow_n_at(&client, 1, t0));
    }

    #[test]
    fn test_oversized_and_empty_requests() {
        let limiter = TokenBucketLimiter::new(Rate::per_second(1.0), 2);
        let client = key("10.0.0.4");
        let t0 = Instant::now();

        assert!(!limiter.allow_n_at(&client, 3, t0));
        assert!(limiter.allow_n_at(&client, 0, t0));
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_keys_have_separate_buckets() {
        let limiter = TokenBucketLimiter::new(Rate::per_second(1.0), 1);
        let t0 = Instant::now();

        assert!(limiter.allow_n_at(&key("10.0.0.5"), 1, t0));
        assert!(limiter.allow_n_at(&key("10.0.0.6"), 1, t0));
        assert!(!limiter.allow_n_at(&key("10.0.0.5"), 1, t0));
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_tracked_keys_are_bounded() {
        let limiter = TokenBucketLimiter::with_max_keys(Rate::per_second(1.0), 1, 32);
        let t0 = Instant::now();

        for i in 0..1000 {
            limiter.allow_n_at(&key(&format!("10.1.{}.{}", i / 256, i % 256)), 1, t0);
        }
        assert!(limiter.tracked_keys() <= 32);
        assert!(limiter.tracked_keys() > 0);
    }

    #[test]
    fn test_least_recently_used_key_is_evicted() {
        let limiter = TokenBucketLimiter::with_shards(Rate::per_second(0.001), 1, 2, 1);
        let t0 = Instant::now();
        let (a, b, c) = (key("10.2.0.1"), key("10.2.0.2"), key("10.2.0.3"));

        assert!(limiter.allow_n_at(&a, 1, t0));
        assert!(limiter.allow_n_at(&b, 1, t0));
        // Touch `a` so `b` becomes the eviction candidate
        assert!(!limiter.allow_n_at(&a, 1, t0));
        assert!(limiter.allow_n_at(&c, 1, t0));

        // `a` kept its drained bucket, `b` was forgotten and starts full
        assert!(!limiter.allow_n_at(&a, 1, t0));
        assert!(limiter.allow_n_at(&b, 1, t0));
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_info_projects_refill_without_consuming() {
        let limiter = TokenBucketLimiter::new(Rate::per_second(2.0), 4);
        let client = key("10.0.0.7");
        let t0 = Instant::now();
        let wall = Utc::now();

        // Unseen keys report a full bucket and are not created
        let info = limiter.rate_limit_info_at(&client, t0, wall);
        assert!(info.allowed);
        assert_eq!(info.remaining, 4);
        assert_eq!(info.reset_time, wall);
        assert_eq!(limiter.tracked_keys(), 0);

        assert!(limiter.allow_n_at(&client, 4, t0));
        let info = limiter.rate_limit_info_at(&client, t0, wall);
        assert!(!info.allowed);
        assert_eq!(info.limit, 4);
        assert_eq!(info.remaining, 0);
        assert_eq!(info.retry_after, Some(Duration::from_millis(500)));
        assert_eq!(info.reset_time, wall + chrono::Duration::seconds(2));

        let info = limiter.rate_limit_info_at(&client, t0 + Duration::from_secs(1), wall);
        assert!(info.allowed);
        assert_eq!(info.remaining, 2);
        // Reading twice changed nothing
        assert!(limiter.allow_n_at(&client, 2, t0 + Duration::from_secs(1)));
        assert!(!limiter.allow_n_at(&client, 1, t0 + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_trait_introspection() {
        let limiter = TokenBucketLimiter::new(Rate::per_second(1000.0), 2000);
        let client = key("10.0.0.8");

        assert_eq!(limiter.limit(&client), Rate::per_second(1000.0));
        assert_eq!(limiter.burst(&client), 2000);
        assert!(limiter.allow(&client).await);

        limiter.clear();
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
