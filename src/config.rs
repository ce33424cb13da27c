//! Configuration management for Gatehouse.
//!
//! Settings come from an optional YAML file layered under environment
//! variables prefixed with `GATEHOUSE__` (nested keys separated by `__`, e.g.
//! `GATEHOUSE__RATE_LIMITING__REDIS_URL`).

use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatehouseError, Result};
use crate::ratelimit::{FailMode, Rate};

/// Environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "GATEHOUSE";

/// Main configuration for the Gatehouse service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatehouseConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Backend health supervision configuration
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Whether admission control is enabled at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redis URL for the shared fixed-window counters. When unset or
    /// unreachable, the in-process token bucket is used instead.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Sustained request budget per key
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Token bucket capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Fixed counting window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Deadline for a single counter store round trip in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// What to decide when the counter store is unavailable
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Maximum number of keys tracked by the in-process token bucket
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            redis_url: None,
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            window_secs: default_window_secs(),
            store_timeout_ms: default_store_timeout_ms(),
            fail_mode: FailMode::default(),
            max_tracked_keys: default_max_tracked_keys(),
        }
    }
}

impl RateLimitingConfig {
    /// The configured sustained rate.
    pub fn rate(&self) -> Rate {
        Rate::per_second(self.requests_per_second)
    }

    /// The fixed counting window.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Deadline for one counter store round trip.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_requests_per_second() -> f64 {
    1000.0
}

fn default_burst() -> u32 {
    2000
}

fn default_window_secs() -> u64 {
    60
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_max_tracked_keys() -> usize {
    10000
}

/// Backend health supervision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Whether the background sweep loop runs
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Upper bound for a single probe in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Age in seconds after which the last sweep is considered stale
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,

    /// Backend services keyed by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            staleness_threshold_secs: default_staleness_threshold_secs(),
            services: BTreeMap::new(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }
}

fn default_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_staleness_threshold_secs() -> u64 {
    300
}

/// A single backend service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the service
    pub url: String,

    /// Path appended to the base URL for health probes
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,

    /// Request timeout in seconds
    #[serde(default = "default_service_timeout_secs")]
    pub timeout_secs: u64,
}

impl ServiceConfig {
    /// Full URL of the health endpoint.
    pub fn health_url(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), self.health_endpoint)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

fn default_service_timeout_secs() -> u64 {
    30
}

impl GatehouseConfig {
    /// Load configuration from an optional YAML file plus `GATEHOUSE__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        Self::from_builder(builder)
    }

    /// Layer environment overrides on top of `builder`, then deserialize and
    /// validate.
    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: GatehouseConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| GatehouseError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter and supervisor cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if !(rl.requests_per_second.is_finite() && rl.requests_per_second > 0.0) {
            return Err(GatehouseError::Config(format!(
                "rate_limiting.requests_per_second must be positive, got {}",
                rl.requests_per_second
            )));
        }
        if rl.window_secs == 0 {
            return Err(GatehouseError::Config(
                "rate_limiting.window_secs must be at least 1".to_string(),
            ));
        }
        if rl.rate().budget_for(rl.window()) == 0 {
            return Err(GatehouseError::Config(format!(
                "rate_limiting.requests_per_second ({}) over window_secs ({}) allows no requests",
                rl.requests_per_second, rl.window_secs
            )));
        }
        if rl.burst == 0 {
            return Err(GatehouseError::Config(
                "rate_limiting.burst must be at least 1".to_string(),
            ));
        }
        if rl.store_timeout_ms == 0 {
            return Err(GatehouseError::Config(
                "rate_limiting.store_timeout_ms must be at least 1".to_string(),
            ));
        }
        if rl.max_tracked_keys == 0 {
            return Err(GatehouseError::Config(
                "rate_limiting.max_tracked_keys must be at least 1".to_string(),
            ));
        }

        let hc = &self.health_check;
        if hc.interval_secs == 0 {
            return Err(GatehouseError::Config(
                "health_check.interval_secs must be at least 1".to_string(),
            ));
        }
        if hc.probe_timeout_secs == 0 {
            return Err(GatehouseError::Config(
                "health_check.probe_timeout_secs must be at least 1".to_string(),
            ));
        }
        if hc.staleness_threshold_secs == 0 {
            return Err(GatehouseError::Config(
                "health_check.staleness_threshold_secs must be at least 1".to_string(),
            ));
        }
        for (name, service) in &hc.services {
            if service.url.is_empty() {
                return Err(GatehouseError::Config(format!(
                    "health_check.services.{name}.url must not be empty"
                )));
            }
        }

        Ok(())
    }
}
