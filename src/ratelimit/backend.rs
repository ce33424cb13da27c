//! Rate limiter trait for abstracting in-process and distributed implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::key::RateLimitKey;
use crate::error::Result;

/// A sustained request rate.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Rate(f64);

impl Rate {
    /// `count` requests for every `per` interval.
    pub fn new(count: u64, per: Duration) -> Self {
        Self(count as f64 / per.as_secs_f64())
    }

    /// A rate given directly in requests per second.
    pub fn per_second(requests: f64) -> Self {
        Self(requests)
    }

    /// Requests per second.
    pub fn as_per_second(&self) -> f64 {
        self.0
    }

    /// Whole requests allowed in a window of the given length.
    pub fn budget_for(&self, window: Duration) -> u64 {
        (self.0 * window.as_secs_f64()).floor() as u64
    }
}

/// Point-in-time admission state for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    /// Whether a request made now would be admitted
    pub allowed: bool,
    /// Budget for the current window
    pub limit: u64,
    /// Budget left in the current window
    pub remaining: u64,
    /// When the budget is fully available again
    pub reset_time: DateTime<Utc>,
    /// How long to wait before retrying; set only when not allowed
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    /// Response headers describing this quota.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_time.timestamp().to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            // Retry-After carries whole seconds; round up so clients never retry early
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            headers.push(("Retry-After", secs.to_string()));
        }
        headers
    }
}

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the in-process `TokenBucketLimiter` and the
/// store-backed `FixedWindowLimiter` so the gRPC service can work with either.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admit a single request for the key.
    async fn allow(&self, key: &RateLimitKey) -> bool {
        self.allow_n(key, 1).await
    }

    /// Admit `n` units of consumption against the key's budget.
    async fn allow_n(&self, key: &RateLimitKey, n: u32) -> bool;

    /// Configured sustained rate for the key.
    fn limit(&self, key: &RateLimitKey) -> Rate;

    /// Configured burst size for the key.
    fn burst(&self, key: &RateLimitKey) -> u32;

    /// Current quota for the key. Never consumes quota.
    async fn rate_limit_info(&self, key: &RateLimitKey) -> Result<RateLimitInfo>;
}
