//! Rate limit key construction and handling.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GatehouseError, Result};

/// What a rate limit key identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// Client IP address
    Ip,
    /// Authenticated user ID
    User,
    /// Endpoint or route name
    Endpoint,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Ip => "ip",
            KeyKind::User => "user",
            KeyKind::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyKind {
    type Err = GatehouseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ip" => Ok(KeyKind::Ip),
            "user" => Ok(KeyKind::User),
            "endpoint" => Ok(KeyKind::Endpoint),
            other => Err(GatehouseError::InvalidKey(format!("unknown key kind '{}'", other))),
        }
    }
}

/// A key that identifies one rate limit budget.
///
/// Serializes to `kind:value`, which is the bucket identity used by both
/// limiter strategies. Keys are immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    kind: KeyKind,
    value: String,
}

impl RateLimitKey {
    /// Create a new key, rejecting empty values and values containing
    /// whitespace or control characters.
    pub fn new(kind: KeyKind, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(GatehouseError::InvalidKey(format!("empty {} value", kind)));
        }
        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(GatehouseError::InvalidKey(format!(
                "{} value {:?} contains whitespace or control characters",
                kind, value
            )));
        }
        Ok(Self { kind, value })
    }

    /// Key for a client IP address.
    pub fn ip(ip: impl Into<String>) -> Result<Self> {
        let ip = ip.into();
        // Bracketed IPv6 literals share a bucket with the bare form
        let normalized = ip.trim_start_matches('[').trim_end_matches(']');
        Self::new(KeyKind::Ip, normalized)
    }

    /// Key for an authenticated user.
    pub fn user(user_id: impl Into<String>) -> Result<Self> {
        Self::new(KeyKind::User, user_id)
    }

    /// Key for an endpoint.
    pub fn endpoint(endpoint: impl Into<String>) -> Result<Self> {
        Self::new(KeyKind::Endpoint, endpoint)
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The stable `kind:value` bucket identity.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.kind, self.value)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

impl FromStr for RateLimitKey {
    type Err = GatehouseError;

    /// Parse `kind:value`. Only the first `:` separates, so IPv6 values
    /// survive intact.
    fn from_str(s: &str) -> Result<Self> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| GatehouseError::InvalidKey(format!("missing ':' in '{}'", s)))?;
        Self::new(kind.parse()?, value)
    }
}
