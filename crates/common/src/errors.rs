//! Error types for sockpool.
//!
//! Every failure a client can observe maps to one variant here, and
//! every variant carries a stable wire code (the `error` classification
//! of the IPC protocol). Display strings for the socket-level failures
//! start with their wire code so callers can match on the prefix.

use thiserror::Error;

/// Main error type for sockpool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Request envelope was malformed or missing required fields.
    /// The reason is shown to the client verbatim.
    #[error("{reason}")]
    InvalidRequest { reason: String },

    /// Request named an action the daemon does not implement.
    #[error("Unknown action: {action}")]
    UnknownAction { action: String },

    /// The upstream socket could not be created (address resolution,
    /// descriptor limits).
    #[error("socket_create_failed: {endpoint}: {message}")]
    SocketCreateFailed { endpoint: String, message: String },

    /// All connect attempts to the upstream endpoint failed.
    #[error("connect_failed: {endpoint}: {message} ({attempts} attempts)")]
    ConnectFailed {
        endpoint: String,
        attempts: u32,
        message: String,
    },

    /// Writing the payload to the upstream socket failed.
    #[error("write_failed: {endpoint}: {message}")]
    WriteFailed { endpoint: String, message: String },

    /// Reading the upstream reply failed or timed out.
    #[error("read_failed: {endpoint}: {message}")]
    ReadFailed { endpoint: String, message: String },

    /// Pool is at capacity. Informational: the pool evicts silently,
    /// so clients do not normally observe this.
    #[error("pool_full: {size}/{max}")]
    PoolFull { size: usize, max: usize },

    /// Client-side circuit breaker is open for this endpoint.
    #[error("circuit_open: {endpoint}: retry in {retry_in_ms} ms")]
    CircuitOpen { endpoint: String, retry_in_ms: u64 },

    /// External cache operation failed. Never surfaced on the request
    /// path; logged and reported through health checks.
    #[error("cache error: {message}")]
    Cache { message: String },

    /// IPC transport failure (client side: daemon unreachable,
    /// truncated response, closed socket).
    #[error("internal: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything unexpected.
    #[error("internal: {message}")]
    Internal { message: String },
}

/// Result type alias for sockpool operations.
pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    /// Stable wire classification for this error.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::UnknownAction { .. } => "unknown_action",
            Self::SocketCreateFailed { .. } => "socket_create_failed",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::WriteFailed { .. } => "write_failed",
            Self::ReadFailed { .. } => "read_failed",
            Self::PoolFull { .. } => "pool_full",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Cache { .. } | Self::Io(_) | Self::Internal { .. } => "internal",
        }
    }

    /// Whether the client retry loop should attempt this request again.
    ///
    /// Validation failures and an open circuit are final; transport and
    /// upstream failures may be transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidRequest { .. }
            | Self::UnknownAction { .. }
            | Self::CircuitOpen { .. } => false,
            Self::SocketCreateFailed { .. }
            | Self::ConnectFailed { .. }
            | Self::WriteFailed { .. }
            | Self::ReadFailed { .. }
            | Self::PoolFull { .. }
            | Self::Cache { .. }
            | Self::Io(_)
            | Self::Internal { .. } => true,
        }
    }

    /// Create an internal error from any message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an invalid-request error for a missing field.
    pub fn missing_field(field: &str) -> Self {
        Self::InvalidRequest {
            reason: format!("Missing required field: {field}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        let err = PoolError::ConnectFailed {
            endpoint: "127.0.0.1:1".to_string(),
            attempts: 3,
            message: "connection refused".to_string(),
        };
        assert_eq!(err.wire_code(), "connect_failed");
        assert!(err.to_string().starts_with("connect_failed"));

        assert_eq!(
            PoolError::UnknownAction {
                action: "reboot".to_string()
            }
            .to_string(),
            "Unknown action: reboot"
        );
    }

    #[test]
    fn retryability() {
        assert!(!PoolError::missing_field("host").is_retryable());
        assert!(!PoolError::CircuitOpen {
            endpoint: "h:1".to_string(),
            retry_in_ms: 500
        }
        .is_retryable());
        assert!(PoolError::ReadFailed {
            endpoint: "h:1".to_string(),
            message: "timed out".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn io_errors_map_to_internal() {
        let err: PoolError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(err.wire_code(), "internal");
        assert!(err.is_retryable());
    }
}
