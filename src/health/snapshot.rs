//! Immutable health snapshots and the reports derived from them.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Name reported by liveness checks.
pub const SERVICE_NAME: &str = "gatehouse";

/// Verdict for a single backend service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// No sweep has completed yet
    Unknown,
    Healthy,
    Unhealthy,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Unknown => "unknown",
            ServiceState::Healthy => "healthy",
            ServiceState::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached health of one backend service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealthStatus {
    pub state: ServiceState,
    /// Probe failure detail, when unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the verdict was recorded
    pub checked_at: Option<DateTime<Utc>>,
}

impl ServiceHealthStatus {
    pub fn unknown() -> Self {
        Self {
            state: ServiceState::Unknown,
            error: None,
            checked_at: None,
        }
    }

    pub fn healthy(checked_at: DateTime<Utc>) -> Self {
        Self {
            state: ServiceState::Healthy,
            error: None,
            checked_at: Some(checked_at),
        }
    }

    pub fn unhealthy(checked_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            state: ServiceState::Unhealthy,
            error: Some(error.into()),
            checked_at: Some(checked_at),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == ServiceState::Healthy
    }
}

/// When a sweep completed, on both clocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepStamp {
    /// Wall-clock completion time, for reporting
    pub completed_at: DateTime<Utc>,
    /// Monotonic completion time, for staleness
    pub completed: Instant,
}

impl SweepStamp {
    /// A stamp for `now` that never precedes `previous`.
    pub fn after(previous: Option<&SweepStamp>, wall_now: DateTime<Utc>, now: Instant) -> Self {
        match previous {
            Some(prev) => Self {
                completed_at: wall_now.max(prev.completed_at),
                completed: now.max(prev.completed),
            },
            None => Self {
                completed_at: wall_now,
                completed: now,
            },
        }
    }
}

/// Whether the last sweep is recent enough to trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepFreshness {
    /// No sweep has completed
    Never,
    Current,
    Stale,
}

impl SweepFreshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepFreshness::Never => "never",
            SweepFreshness::Current => "current",
            SweepFreshness::Stale => "stale",
        }
    }
}

/// Point-in-time health of every configured service.
///
/// Snapshots are never modified after publication; each sweep replaces
/// the whole snapshot.
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    services: BTreeMap<String, ServiceHealthStatus>,
    last_sweep: Option<SweepStamp>,
}

impl HealthSnapshot {
    /// A snapshot in which every service is still unknown.
    pub fn unknown<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            services: services
                .into_iter()
                .map(|name| (name.into(), ServiceHealthStatus::unknown()))
                .collect(),
            last_sweep: None,
        }
    }

    pub fn new(services: BTreeMap<String, ServiceHealthStatus>, sweep: SweepStamp) -> Self {
        Self {
            services,
            last_sweep: Some(sweep),
        }
    }

    pub fn status(&self, service: &str) -> Option<&ServiceHealthStatus> {
        self.services.get(service)
    }

    /// False for unknown, unhealthy and unconfigured services.
    pub fn is_healthy(&self, service: &str) -> bool {
        self.status(service).is_some_and(ServiceHealthStatus::is_healthy)
    }

    pub fn services(&self) -> &BTreeMap<String, ServiceHealthStatus> {
        &self.services
    }

    pub fn last_sweep(&self) -> Option<&SweepStamp> {
        self.last_sweep.as_ref()
    }

    pub fn freshness(&self, staleness_threshold: Duration, now: Instant) -> SweepFreshness {
        match &self.last_sweep {
            None => SweepFreshness::Never,
            Some(stamp) if now.saturating_duration_since(stamp.completed) > staleness_threshold => {
                SweepFreshness::Stale
            }
            Some(_) => SweepFreshness::Current,
        }
    }

    /// Ready iff every service is healthy and the last sweep is current.
    pub fn readiness(&self, staleness_threshold: Duration, now: Instant) -> ReadinessReport {
        let components: BTreeMap<String, ServiceState> = self
            .services
            .iter()
            .map(|(name, status)| (name.clone(), status.state))
            .collect();
        let sweep = self.freshness(staleness_threshold, now);
        let ready = sweep == SweepFreshness::Current
            && components.values().all(|state| *state == ServiceState::Healthy);

        ReadinessReport {
            ready,
            status: if ready { "ready" } else { "not_ready" },
            components,
            sweep,
            last_check: self.last_sweep.map(|stamp| stamp.completed_at),
            timestamp: Utc::now(),
        }
    }

    /// Per-service states with healthy/unhealthy/total counts.
    pub fn services_status(&self) -> ServicesStatusReport {
        let total = self.services.len();
        let healthy = self.services.values().filter(|s| s.is_healthy()).count();

        ServicesStatusReport {
            services: self.services.clone(),
            total,
            healthy,
            unhealthy: total - healthy,
            last_check: self.last_sweep.map(|stamp| stamp.completed_at),
            timestamp: Utc::now(),
        }
    }
}

/// Aggregated readiness.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub status: &'static str,
    pub components: BTreeMap<String, ServiceState>,
    /// Freshness of the sweep the verdicts came from
    pub sweep: SweepFreshness,
    pub last_check: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl ReadinessReport {
    /// HTTP-equivalent status code.
    pub fn status_code(&self) -> u16 {
        if self.ready {
            200
        } else {
            503
        }
    }
}

/// Summary of every service's cached verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ServicesStatusReport {
    pub services: BTreeMap<String, ServiceHealthStatus>,
    pub total: usize,
    pub healthy: usize,
    /// Unhealthy plus not yet checked
    pub unhealthy: usize,
    pub last_check: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// Result of a live probe of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthReport {
    pub service: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ServiceHealthReport {
    pub fn status(&self) -> ServiceState {
        if self.healthy {
            ServiceState::Healthy
        } else {
            ServiceState::Unhealthy
        }
    }

    pub fn status_code(&self) -> u16 {
        if self.healthy {
            200
        } else {
            503
        }
    }
}

/// Process liveness.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessReport {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl LivenessReport {
    pub fn alive() -> Self {
        Self {
            status: "alive",
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
            timestamp: Utc::now(),
        }
    }
}
