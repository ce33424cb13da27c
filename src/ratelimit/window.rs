//! Fixed counting windows and the counter records they map to.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Prefix shared by every counter record in the store.
const RECORD_PREFIX: &str = "rate_limit";

/// Extra lifetime given to a counter record beyond its window, to absorb
/// clock and network skew between gateway instances.
pub const RECORD_TTL_SLACK: Duration = Duration::from_secs(1);

/// A fixed, wall-clock aligned counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    /// Window length in whole seconds
    secs: u64,
}

impl FixedWindow {
    /// Create a window of the given length, rounded down to whole seconds
    /// and never shorter than one second.
    pub fn new(length: Duration) -> Self {
        Self {
            secs: length.as_secs().max(1),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.secs)
    }

    /// Start of the window containing `unix_secs`.
    pub fn start_of(&self, unix_secs: u64) -> u64 {
        (unix_secs / self.secs) * self.secs
    }

    /// Start of the window containing `now`.
    pub fn start_at(&self, now: DateTime<Utc>) -> u64 {
        self.start_of(now.timestamp().max(0) as u64)
    }

    /// When the window starting at `window_start` ends.
    pub fn reset_time(&self, window_start: u64) -> DateTime<Utc> {
        let end = window_start.saturating_add(self.secs);
        Utc.timestamp_opt(end as i64, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Lifetime of a counter record for this window.
    pub fn record_ttl(&self) -> Duration {
        self.duration() + RECORD_TTL_SLACK
    }
}

/// Key identifying one counter record in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The rate limit key (serialized `kind:value`).
    pub key: String,
    /// The window start (epoch seconds, floored to the window boundary).
    pub window_start: u64,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(key: &str, window_start: u64) -> Self {
        Self {
            key: key.to_string(),
            window_start,
        }
    }

    /// Convert to the store key string.
    /// Format: "rate_limit:{key}:{window_start}"
    pub fn to_store_key(&self) -> String {
        format!("{}:{}:{}", RECORD_PREFIX, self.key, self.window_start)
    }

    /// Parse from a store key string.
    pub fn from_store_key(store_key: &str) -> Option<Self> {
        let rest = store_key.strip_prefix(RECORD_PREFIX)?.strip_prefix(':')?;

        // Keys contain ':' themselves, so the window is after the last one
        let (key, window) = rest.rsplit_once(':')?;
        if key.is_empty() {
            return None;
        }
        let window_start: u64 = window.parse().ok()?;

        Some(Self {
            key: key.to_string(),
            window_start,
        })
    }
}
