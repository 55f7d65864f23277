//! Core value types shared between the daemon and the client library.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Endpoint Key
// ============================================================================

/// Key identifying an upstream TCP endpoint.
///
/// Used as the index of the connection pool and the statistics table.
/// The canonical string form is `host:port`, which is also how the key
/// appears in stats and metrics output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
}

impl EndpointKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Canonical `host:port` form used for map keys and log fields.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address tuple for connecting.
    pub fn addr(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for EndpointKey {
    type Err = String;

    /// Parse the canonical `host:port` form. The port is taken from the
    /// last colon so IPv6-ish hosts with embedded colons still parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {s:?}"))?;
        if host.is_empty() {
            return Err(format!("empty host in {s:?}"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in {s:?}"))?;
        Ok(Self::new(host, port))
    }
}

// ============================================================================
// Endpoint Statistics
// ============================================================================

/// Per-endpoint request counters, as reported by `get_stats`.
///
/// `total` is always `success + failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub success: u64,
    pub failed: u64,
    pub total: u64,
}

// ============================================================================
// Circuit Breaker Types
// ============================================================================

/// Circuit breaker state, per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Failure threshold reached, requests fail fast
    Open,
    /// Cooldown elapsed, a single probe request is allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a per-endpoint circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before allowing a half-open probe
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_seconds: 30,
        }
    }
}
