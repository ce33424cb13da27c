//! Distributed fixed-window rate limiter backed by a shared counter store.
//!
//! Every gateway instance increments the same store record for a given
//! `(key, window)` pair, so the budget is enforced across the whole fleet.
//! When the store misbehaves the limiter falls back to its `FailMode`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::backend::{Rate, RateLimitInfo, RateLimiter};
use super::key::RateLimitKey;
use super::store::CounterStore;
use super::window::{CounterKey, FixedWindow};
use crate::error::{GatehouseError, Result};
use crate::metrics::GatehouseMetrics;

/// Default window length.
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Default deadline for one store round trip.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Decision taken when the counter store cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit the request
    #[default]
    Open,
    /// Reject the request
    Closed,
}

/// A rate limiter that counts requests in fixed windows held in a shared store.
pub struct FixedWindowLimiter<S: CounterStore> {
    /// The shared counter store
    store: Arc<S>,
    /// Sustained rate; the window budget is rate × window length
    rate: Rate,
    /// Reported burst size
    burst: u32,
    /// Counting window
    window: FixedWindow,
    /// Deadline for one store round trip
    store_timeout: Duration,
    /// What to decide when the store fails
    fail_mode: FailMode,
    /// Decision counters, when exported
    metrics: Option<Arc<GatehouseMetrics>>,
}

impl<S: CounterStore> FixedWindowLimiter<S> {
    /// Create a new limiter with a one-minute window.
    pub fn new(store: Arc<S>, rate: Rate, burst: u32) -> Self {
        Self {
            store,
            rate,
            burst,
            window: FixedWindow::new(DEFAULT_WINDOW),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            fail_mode: FailMode::default(),
            metrics: None,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = FixedWindow::new(window);
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    /// Count every decision in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<GatehouseMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Total requests admitted per key in one window.
    pub fn window_limit(&self) -> u64 {
        self.rate.budget_for(self.window.duration())
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub(crate) async fn allow_n_at(&self, key: &RateLimitKey, n: u32, now: DateTime<Utc>) -> bool {
        let allowed = self.check_at(key, n, now).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_decision(key.kind(), allowed);
        }
        allowed
    }

    async fn check_at(&self, key: &RateLimitKey, n: u32, now: DateTime<Utc>) -> bool {
        if n == 0 {
            return true;
        }

        let window_start = self.window.start_at(now);
        let record = CounterKey::new(&key.to_string_key(), window_start);
        let limit = self.window_limit();

        trace!(
            key = %key,
            window = window_start,
            hits = n,
            "Checking fixed-window rate limit"
        );

        let increment = self
            .store
            .incr_with_expiry(&record, u64::from(n), self.window.record_ttl());
        let count = match tokio::time::timeout(self.store_timeout, increment).await {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => return self.on_store_failure(key, &e),
            Err(_) => {
                return self.on_store_failure(key, &GatehouseError::StoreTimeout(self.store_timeout))
            }
        };

        let allowed = count <= limit;
        if !allowed {
            debug!(
                key = %key,
                current = count,
                limit = limit,
                window = window_start,
                "Rate limit exceeded"
            );
        }
        allowed
    }

    pub(crate) async fn rate_limit_info_at(
        &self,
        key: &RateLimitKey,
        now: DateTime<Utc>,
    ) -> Result<RateLimitInfo> {
        let window_start = self.window.start_at(now);
        let record = CounterKey::new(&key.to_string_key(), window_start);
        let limit = self.window_limit();

        let current = tokio::time::timeout(self.store_timeout, self.store.get(&record))
            .await
            .map_err(|_| GatehouseError::StoreTimeout(self.store_timeout))??
            .unwrap_or(0);

        let allowed = current < limit;
        let reset_time = self.window.reset_time(window_start);
        let retry_after = if allowed {
            None
        } else {
            Some((reset_time - now).to_std().unwrap_or(Duration::ZERO))
        };

        Ok(RateLimitInfo {
            allowed,
            limit,
            remaining: limit.saturating_sub(current),
            reset_time,
            retry_after,
        })
    }

    fn on_store_failure(&self, key: &RateLimitKey, error: &GatehouseError) -> bool {
        match self.fail_mode {
            FailMode::Open => {
                warn!(key = %key, error = %error, "Counter store unavailable, admitting request");
                true
            }
            FailMode::Closed => {
                warn!(key = %key, error = %error, "Counter store unavailable, rejecting request");
                false
            }
        }
    }
}

#[async_trait]
impl<S: CounterStore + 'static> RateLimiter for FixedWindowLimiter<S> {
    async fn allow_n(&self, key: &RateLimitKey, n: u32) -> bool {
        self.allow_n_at(key, n, Utc::now()).await
    }

    fn limit(&self, _key: &RateLimitKey) -> Rate {
        self.rate
    }

    fn burst(&self, _key: &RateLimitKey) -> u32 {
        self.burst
    }

    async fn rate_limit_info(&self, key: &RateLimitKey) -> Result<RateLimitInfo> {
        self.rate_limit_info_at(key, Utc::now()).await
    }
}
