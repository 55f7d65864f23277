//! Request and response envelopes for the IPC protocol.
//!
//! # Wire Format
//!
//! One connection, one round trip. Both directions carry a single
//! UTF-8 JSON object with no length prefix; the server reads at most
//! [`MAX_REQUEST_BYTES`] and the client at most [`MAX_RESPONSE_BYTES`]
//! before decoding. The server closes the connection after writing its
//! response.
//!
//! Requests are a tagged union over `action`:
//!
//! ```json
//! {"action": "send_gps", "host": "10.0.0.5", "port": 5027,
//!  "message": "...", "vehicle_id": "V1"}
//! ```
//!
//! Responses always carry `success`; on failure an `error` string; the
//! server adds `request_id` and `processing_time` (milliseconds).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sockpool_common::{EndpointStats, PoolError, PoolResult};

/// Cap on a single request read by the server.
pub const MAX_REQUEST_BYTES: usize = 4096;
/// Cap on a single response read by the client.
pub const MAX_RESPONSE_BYTES: usize = 8192;

// ============================================================================
// Requests
// ============================================================================

/// A decoded IPC request.
///
/// Field-level validation (empty host, zero port) is the dispatcher's
/// job so that every validation failure produces the same
/// `invalid_request` shape on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    SendGps {
        #[serde(default)]
        host: String,
        #[serde(default)]
        port: u16,
        #[serde(default)]
        message: String,
        #[serde(default)]
        vehicle_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Value>,
    },
    GetStats,
    GetMetrics,
    CloseConnection {
        #[serde(default)]
        host: String,
        #[serde(default)]
        port: u16,
    },
    HealthCheck,
    GetConfig,
}

impl Request {
    /// The action tag, as it appears on the wire.
    pub fn action(&self) -> &'static str {
        match self {
            Self::SendGps { .. } => "send_gps",
            Self::GetStats => "get_stats",
            Self::GetMetrics => "get_metrics",
            Self::CloseConnection { .. } => "close_connection",
            Self::HealthCheck => "health_check",
            Self::GetConfig => "get_config",
        }
    }

    /// Decode a request from raw bytes, distinguishing the three
    /// failure shapes the protocol promises: malformed JSON, a missing
    /// action field, and an unrecognized action.
    pub fn from_slice(bytes: &[u8]) -> PoolResult<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| PoolError::InvalidRequest {
            reason: format!("Invalid JSON: {e}"),
        })?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| PoolError::missing_field("action"))?
            .to_string();
        serde_json::from_value(value).map_err(|e| {
            // serde reports an unknown tag as an "unknown variant" error;
            // everything else is a malformed payload for a known action.
            if e.to_string().contains("unknown variant") {
                PoolError::UnknownAction { action }
            } else {
                PoolError::InvalidRequest {
                    reason: format!("Invalid {action} request: {e}"),
                }
            }
        })
    }
}

// ============================================================================
// Responses
// ============================================================================

/// The IPC response envelope.
///
/// The action-specific payload is flattened into the top level, so the
/// wire shape is `{"success": true, "pool_size": 3, ...}` rather than
/// a nested object. [`Response::decode`] recovers the typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Server-side handling time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    /// Client-side round-trip time in milliseconds, merged in by the
    /// client library.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(flatten)]
    pub payload: Value,
}

impl Response {
    /// Successful response wrapping an action payload.
    ///
    /// The payload must serialize to a JSON object (all reply types in
    /// this module do); anything else is collapsed to an empty payload.
    pub fn ok<T: Serialize>(payload: &T) -> Self {
        let payload = match serde_json::to_value(payload) {
            Ok(value @ Value::Object(_)) => value,
            _ => Value::Object(serde_json::Map::new()),
        };
        Self {
            success: true,
            error: None,
            request_id: None,
            processing_time: None,
            duration_ms: None,
            payload,
        }
    }

    /// Successful response with no payload.
    pub fn ok_empty() -> Self {
        Self {
            success: true,
            error: None,
            request_id: None,
            processing_time: None,
            duration_ms: None,
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Failure response carrying the error's display string.
    pub fn failure(error: &PoolError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            request_id: None,
            processing_time: None,
            duration_ms: None,
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Decode the flattened payload into a typed reply.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> PoolResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| PoolError::Internal {
            message: format!("unexpected response payload: {e}"),
        })
    }
}

// ============================================================================
// Action payloads
// ============================================================================

/// Reply to `send_gps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendGpsReply {
    /// Upstream reply bytes as UTF-8 (lossy)
    pub response: String,
    /// Upstream reply bytes as lowercase hex
    pub hex_response: String,
    /// Bytes written to the upstream socket, including the trailing CR
    pub bytes_sent: usize,
    pub vehicle_id: String,
    /// Unix seconds at completion
    pub timestamp: i64,
}

/// Reply to `get_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReply {
    pub pool_size: usize,
    pub max_pool_size: usize,
    /// Per-endpoint counters keyed by `host:port`
    pub connection_stats: BTreeMap<String, EndpointStats>,
    /// Currently pooled endpoint keys
    pub active_connections: Vec<String>,
    pub instance_id: String,
}

/// Reply to `get_metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReply {
    pub pool_size: usize,
    pub max_pool_size: usize,
    pub instance_id: String,
    pub uptime_s: u64,
    /// Resident set size in bytes
    pub memory_usage: u64,
    /// Peak resident set size observed since startup, in bytes
    pub peak_memory: u64,
}

/// Overall daemon health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Individual checks backing a health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthChecks {
    /// Whether the IPC socket path exists on disk
    pub ipc_socket: bool,
    /// External cache reachability; absent when the cache is disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_cache: Option<bool>,
    /// Number of pooled upstream connections
    pub active_connections: usize,
}

/// Reply to `health_check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReply {
    pub status: HealthStatus,
    pub instance_id: String,
    /// Unix seconds when the check ran
    pub timestamp: i64,
    pub checks: HealthChecks,
}
