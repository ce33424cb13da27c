//! Prometheus metrics for admission decisions and backend health.
//!
//! Metrics live in a registry owned by [`GatehouseMetrics`] rather than the
//! process-global default, so every limiter and supervisor can be handed the
//! same instance and tests can read an isolated one.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::error::Result;
use crate::ratelimit::KeyKind;

/// Counters and gauges recorded by the limiters and the health supervisor.
#[derive(Clone)]
pub struct GatehouseMetrics {
    registry: Registry,
    /// Admitted requests by key type
    rate_limit_hits: IntCounterVec,
    /// Denied requests by key type
    rate_limit_blocks: IntCounterVec,
    /// 1 when the last sweep found the service healthy, 0 otherwise
    service_health: IntGaugeVec,
}

impl GatehouseMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let rate_limit_hits = IntCounterVec::new(
            Opts::new(
                "gatehouse_rate_limit_hits_total",
                "Total number of requests admitted by the rate limiter",
            ),
            &["key_type"],
        )?;
        let rate_limit_blocks = IntCounterVec::new(
            Opts::new(
                "gatehouse_rate_limit_blocks_total",
                "Total number of requests denied by the rate limiter",
            ),
            &["key_type"],
        )?;
        let service_health = IntGaugeVec::new(
            Opts::new(
                "gatehouse_service_health",
                "Health status of backend services (1=healthy, 0=unhealthy)",
            ),
            &["service"],
        )?;

        registry.register(Box::new(rate_limit_hits.clone()))?;
        registry.register(Box::new(rate_limit_blocks.clone()))?;
        registry.register(Box::new(service_health.clone()))?;

        Ok(Self {
            registry,
            rate_limit_hits,
            rate_limit_blocks,
            service_health,
        })
    }

    /// Count one admission decision for a key of the given kind.
    pub fn record_decision(&self, kind: KeyKind, allowed: bool) {
        let counter = if allowed {
            &self.rate_limit_hits
        } else {
            &self.rate_limit_blocks
        };
        counter.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn set_service_health(&self, service: &str, healthy: bool) {
        self.service_health
            .with_label_values(&[service])
            .set(i64::from(healthy));
    }

    pub fn rate_limit_hits(&self, kind: KeyKind) -> u64 {
        self.rate_limit_hits.with_label_values(&[kind.as_str()]).get()
    }

    pub fn rate_limit_blocks(&self, kind: KeyKind) -> u64 {
        self.rate_limit_blocks.with_label_values(&[kind.as_str()]).get()
    }

    pub fn service_health(&self, service: &str) -> i64 {
        self.service_health.with_label_values(&[service]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
