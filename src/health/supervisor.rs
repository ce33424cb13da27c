//! Background health supervision for backend services.
//!
//! A single sweep probes every configured service concurrently and publishes
//! one new immutable snapshot. The supervised loop repeats the sweep on a
//! fixed interval until shutdown is signalled; readers only ever see whole
//! snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::probe::{ProbeError, ServiceProber};
use super::snapshot::{
    HealthSnapshot, LivenessReport, ReadinessReport, ServiceHealthReport, ServiceHealthStatus,
    ServicesStatusReport, SweepStamp,
};
use crate::config::HealthCheckConfig;
use crate::error::{GatehouseError, Result};
use crate::metrics::GatehouseMetrics;

/// Timing for the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Upper bound for a single probe
    pub probe_timeout: Duration,
    /// Age after which the last sweep no longer counts for readiness
    pub staleness_threshold: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            staleness_threshold: Duration::from_secs(300),
        }
    }
}

impl From<&HealthCheckConfig> for SupervisorConfig {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            interval: config.interval(),
            probe_timeout: config.probe_timeout(),
            staleness_threshold: config.staleness_threshold(),
        }
    }
}

struct Inner {
    /// Configured service names, sorted and unique
    services: Vec<String>,
    prober: Arc<dyn ServiceProber>,
    config: SupervisorConfig,
    /// Latest published snapshot; only sweeps write to it
    state: watch::Sender<Arc<HealthSnapshot>>,
    /// Serializes sweeps so there is one writer at a time
    sweep_lock: Mutex<()>,
    /// Per-service gauge, updated whenever a sweep publishes
    metrics: OnceLock<Arc<GatehouseMetrics>>,
}

/// Keeps a cached health verdict for each configured backend.
///
/// Cloning is cheap; all clones share the same snapshot.
#[derive(Clone)]
pub struct HealthSupervisor {
    inner: Arc<Inner>,
}

impl HealthSupervisor {
    /// Create a supervisor. Every service starts out unknown.
    pub fn new<I, S>(services: I, prober: Arc<dyn ServiceProber>, config: SupervisorConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let services: Vec<String> = services
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let (state, _) = watch::channel(Arc::new(HealthSnapshot::unknown(services.iter().cloned())));

        Self {
            inner: Arc::new(Inner {
                services,
                prober,
                config,
                state,
                sweep_lock: Mutex::new(()),
                metrics: OnceLock::new(),
            }),
        }
    }

    /// Export the verdict of every sweep to `metrics`. Only the first call
    /// takes effect; clones share the same exporter.
    pub fn with_metrics(self, metrics: Arc<GatehouseMetrics>) -> Self {
        if self.inner.metrics.set(metrics).is_err() {
            debug!("Health supervisor metrics already attached");
        }
        self
    }

    /// Configured service names.
    pub fn services(&self) -> &[String] {
        &self.inner.services
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.inner.state.borrow().clone()
    }

    /// Receive every newly published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<HealthSnapshot>> {
        self.inner.state.subscribe()
    }

    /// Probe one service, bounded by the probe timeout. A panicking prober
    /// is reported as a failure rather than unwinding into the caller.
    pub async fn probe(&self, service: &str) -> std::result::Result<(), ProbeError> {
        let timeout = self.inner.config.probe_timeout;
        let probe = AssertUnwindSafe(self.inner.prober.probe(service)).catch_unwind();

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProbeError::Panicked),
            Err(_) => Err(ProbeError::Timeout(timeout)),
        }
    }

    /// Probe every service once and publish the resulting snapshot.
    pub async fn sweep_once(&self) -> Arc<HealthSnapshot> {
        let _guard = self.inner.sweep_lock.lock().await;

        debug!(services = self.inner.services.len(), "Starting health check for all services");

        let results = join_all(self.inner.services.iter().map(|name| async move {
            let result = self.probe(name).await;
            (name, result)
        }))
        .await;

        let checked_at = Utc::now();
        let mut statuses = BTreeMap::new();
        for (name, result) in results {
            let status = match result {
                Ok(()) => {
                    debug!(service = %name, healthy = true, "Service health check completed");
                    ServiceHealthStatus::healthy(checked_at)
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "Service health check failed");
                    ServiceHealthStatus::unhealthy(checked_at, e.to_string())
                }
            };
            statuses.insert(name.clone(), status);
        }

        let previous = self.snapshot();
        let stamp = SweepStamp::after(previous.last_sweep(), checked_at, Instant::now());
        let healthy = statuses.values().filter(|s| s.is_healthy()).count();
        let snapshot = Arc::new(HealthSnapshot::new(statuses, stamp));
        self.inner.state.send_replace(snapshot.clone());
        if let Some(metrics) = self.inner.metrics.get() {
            for (name, status) in snapshot.services() {
                metrics.set_service_health(name, status.is_healthy());
            }
        }

        info!(
            healthy = healthy,
            total = self.inner.services.len(),
            timestamp = %stamp.completed_at,
            "Health check completed for all services"
        );

        snapshot
    }

    /// Run the sweep loop until `shutdown` turns true or its sender is dropped.
    ///
    /// The first sweep runs immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }

        let mut ticker = interval(self.inner.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.inner.config.interval.as_secs(),
            services = self.inner.services.len(),
            "Health supervisor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health supervisor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Start the sweep loop as a background task.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(supervisor.run(shutdown))
    }

    /// Cached verdict; false for unknown, unhealthy and unconfigured services.
    pub fn is_service_healthy(&self, service: &str) -> bool {
        self.inner.state.borrow().is_healthy(service)
    }

    /// Aggregated readiness from the cached snapshot.
    pub fn readiness(&self) -> ReadinessReport {
        self.snapshot()
            .readiness(self.inner.config.staleness_threshold, Instant::now())
    }

    /// Cached verdicts with healthy/unhealthy/total counts.
    pub fn services_status(&self) -> ServicesStatusReport {
        self.snapshot().services_status()
    }

    /// Probe one configured service live. Does not touch the cache.
    pub async fn check_service(&self, service: &str) -> Result<ServiceHealthReport> {
        if !self.inner.services.iter().any(|name| name == service) {
            return Err(GatehouseError::ServiceNotFound(service.to_string()));
        }

        let result = self.probe(service).await;
        if let Err(ref e) = result {
            warn!(service = %service, error = %e, "Service health check failed");
        }

        Ok(ServiceHealthReport {
            service: service.to_string(),
            healthy: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
            timestamp: Utc::now(),
        })
    }

    pub fn liveness(&self) -> LivenessReport {
        LivenessReport::alive()
    }
}
