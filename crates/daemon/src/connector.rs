//! Upstream connector: opens fresh TCP sockets with bounded retries.
//!
//! Send/receive deadlines are the dispatcher's job (per-operation
//! timeouts); here we only establish the connection, enable keep-alive
//! and disable Nagle for the short telemetry frames this daemon moves.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use sockpool_common::{EndpointKey, PoolError, PoolResult};
use sockpool_config::DaemonConfig;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Open a fresh connection to an upstream endpoint.
///
/// Resolution failure is a `socket_create_failed`; connect failures
/// after `max_retries` attempts (spaced by `retry_delay`) surface as
/// `connect_failed` carrying the last error.
pub async fn connect(key: &EndpointKey, config: &DaemonConfig) -> PoolResult<TcpStream> {
    let addr = resolve(key).await?;
    let attempts = config.max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        trace!(endpoint = %key, attempt, "Connecting to upstream");
        match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = tune(&stream) {
                    // Keep-alive is best effort; the socket still works.
                    warn!(endpoint = %key, error = %e, "Could not set socket options");
                }
                debug!(endpoint = %key, attempt, "Upstream connection established");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                last_error = e.to_string();
            }
            Err(_) => {
                last_error = format!(
                    "connect timed out after {} ms",
                    config.connect_timeout.as_millis()
                );
            }
        }
        if attempt < attempts {
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    warn!(endpoint = %key, attempts, error = %last_error, "Upstream connect failed");
    Err(PoolError::ConnectFailed {
        endpoint: key.canonical(),
        attempts,
        message: last_error,
    })
}

async fn resolve(key: &EndpointKey) -> PoolResult<SocketAddr> {
    let mut addrs = lookup_host(key.canonical())
        .await
        .map_err(|e| PoolError::SocketCreateFailed {
            endpoint: key.canonical(),
            message: format!("address resolution failed: {e}"),
        })?;
    addrs.next().ok_or_else(|| PoolError::SocketCreateFailed {
        endpoint: key.canonical(),
        message: "address resolution returned no addresses".to_string(),
    })
}

fn tune(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.max_retries = 2;
        config.retry_delay = Duration::from_millis(10);
        config.connect_timeout = Duration::from_millis(500);
        config
    }

    #[tokio::test]
    async fn connects_to_listening_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let key = EndpointKey::new("127.0.0.1", port);

        let stream = connect(&key, &test_config()).await.unwrap();
        assert!(stream.peer_addr().is_ok());
    }

    #[tokio::test]
    async fn refused_endpoint_reports_connect_failed_with_attempts() {
        // Port 1 is practically never listening locally.
        let key = EndpointKey::new("127.0.0.1", 1);
        let err = connect(&key, &test_config()).await.unwrap_err();
        match err {
            PoolError::ConnectFailed {
                endpoint, attempts, ..
            } => {
                assert_eq!(endpoint, "127.0.0.1:1");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresolvable_host_is_socket_create_failed() {
        let key = EndpointKey::new("this.host.does.not.exist.invalid", 80);
        let err = connect(&key, &test_config()).await.unwrap_err();
        assert_eq!(err.wire_code(), "socket_create_failed");
    }
}
