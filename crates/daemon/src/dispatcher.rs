//! Request dispatcher: one decoded IPC request in, one response out.
//!
//! For `send_gps` this is where the pool, the connector and the
//! statistics meet: acquire or establish a connection, perform one
//! write/read exchange, and on an I/O failure drop the socket,
//! reconnect and retry the exchange exactly once before giving up.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use sockpool_common::{EndpointKey, InstanceId, PoolError, PoolResult};
use sockpool_config::Config;
use sockpool_ipc::protocol::{
    HealthChecks, HealthReply, HealthStatus, MetricsReply, Request, Response, SendGpsReply,
    StatsReply,
};

use crate::cache::CacheClient;
use crate::connector;
use crate::metrics::ProcessMetrics;
use crate::pool::{ConnectionPool, PoolEntry};
use crate::stats::StatsTable;

pub struct Dispatcher {
    config: Config,
    pool: Arc<ConnectionPool>,
    stats: Arc<StatsTable>,
    metrics: Arc<ProcessMetrics>,
    cache: Option<Arc<CacheClient>>,
    instance_id: InstanceId,
    /// The socket path the server actually bound (the configured path
    /// may have been amended at startup).
    socket_path: PathBuf,
}

impl Dispatcher {
    pub fn new(
        config: Config,
        pool: Arc<ConnectionPool>,
        stats: Arc<StatsTable>,
        metrics: Arc<ProcessMetrics>,
        cache: Option<Arc<CacheClient>>,
        instance_id: InstanceId,
        socket_path: PathBuf,
    ) -> Self {
        Self {
            config,
            pool,
            stats,
            metrics,
            cache,
            instance_id,
            socket_path,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Handle one request. Errors become `{success: false, error}`
    /// envelopes; nothing here can take down the accept loop.
    pub async fn dispatch(&self, request: Request) -> Response {
        let result = match request {
            Request::SendGps {
                host,
                port,
                message,
                vehicle_id,
                options: _,
            } => self.handle_send_gps(host, port, message, vehicle_id).await,
            Request::GetStats => self.handle_get_stats(),
            Request::GetMetrics => self.handle_get_metrics(),
            Request::CloseConnection { host, port } => self.handle_close_connection(host, port),
            Request::HealthCheck => Ok(Response::ok(&self.health_report().await)),
            Request::GetConfig => Ok(Response::ok(&self.config.to_redacted_json())),
        };
        result.unwrap_or_else(|error| Response::failure(&error))
    }

    // ========================================================================
    // send_gps
    // ========================================================================

    async fn handle_send_gps(
        &self,
        host: String,
        port: u16,
        message: String,
        vehicle_id: String,
    ) -> PoolResult<Response> {
        if host.is_empty() {
            return Err(PoolError::missing_field("host"));
        }
        if port == 0 {
            return Err(PoolError::InvalidRequest {
                reason: "Port must be non-zero".to_string(),
            });
        }
        if message.is_empty() {
            return Err(PoolError::missing_field("message"));
        }

        let key = EndpointKey::new(host, port);
        match self.deliver(&key, &message).await {
            Ok((reply, bytes_sent)) => {
                self.stats.record_success(&key);
                Ok(Response::ok(&SendGpsReply {
                    response: String::from_utf8_lossy(&reply).into_owned(),
                    hex_response: hex::encode(&reply),
                    bytes_sent,
                    vehicle_id,
                    timestamp: chrono::Utc::now().timestamp(),
                }))
            }
            Err(error) => {
                self.stats.record_failure(&key);
                Err(error)
            }
        }
    }

    /// Acquire a connection, run the exchange, and on failure drop the
    /// socket, reconnect once and retry the exchange once.
    async fn deliver(&self, key: &EndpointKey, message: &str) -> PoolResult<(Vec<u8>, usize)> {
        let mut entry = match self.pool.acquire(key) {
            Some(entry) => entry,
            None => self.fresh_entry(key).await?,
        };

        match self.exchange(&mut entry, message).await {
            Ok(result) => {
                self.pool.release(entry);
                Ok(result)
            }
            Err(first_error) => {
                warn!(
                    endpoint = %key,
                    connection_id = %entry.connection_id,
                    error = %first_error,
                    "Upstream exchange failed, reconnecting once"
                );
                self.pool.discard(entry);

                let mut entry = self.fresh_entry(key).await?;
                match self.exchange(&mut entry, message).await {
                    Ok(result) => {
                        self.pool.release(entry);
                        Ok(result)
                    }
                    Err(error) => {
                        self.pool.discard(entry);
                        Err(error)
                    }
                }
            }
        }
    }

    async fn fresh_entry(&self, key: &EndpointKey) -> PoolResult<PoolEntry> {
        let socket = connector::connect(key, &self.config.daemon).await?;
        Ok(self.pool.register(key.clone(), socket))
    }

    /// One framed write plus one bounded read on the upstream socket.
    /// The trailing CR is part of the wire contract.
    async fn exchange(
        &self,
        entry: &mut PoolEntry,
        message: &str,
    ) -> PoolResult<(Vec<u8>, usize)> {
        let io_timeout = self.config.daemon.io_timeout;
        let frame = format!("{message}\r");

        timeout(io_timeout, entry.socket.write_all(frame.as_bytes()))
            .await
            .map_err(|_| PoolError::WriteFailed {
                endpoint: entry.key.canonical(),
                message: format!("write timed out after {} ms", io_timeout.as_millis()),
            })?
            .map_err(|e| PoolError::WriteFailed {
                endpoint: entry.key.canonical(),
                message: e.to_string(),
            })?;

        let mut buf = vec![0u8; self.config.daemon.response_buffer];
        let n = timeout(io_timeout, entry.socket.read(&mut buf))
            .await
            .map_err(|_| PoolError::ReadFailed {
                endpoint: entry.key.canonical(),
                message: format!("read timed out after {} ms", io_timeout.as_millis()),
            })?
            .map_err(|e| PoolError::ReadFailed {
                endpoint: entry.key.canonical(),
                message: e.to_string(),
            })?;
        if n == 0 {
            return Err(PoolError::ReadFailed {
                endpoint: entry.key.canonical(),
                message: "connection closed by peer".to_string(),
            });
        }

        buf.truncate(n);
        debug!(
            endpoint = %entry.key,
            connection_id = %entry.connection_id,
            bytes_sent = frame.len(),
            bytes_received = n,
            "Upstream exchange complete"
        );
        Ok((buf, frame.len()))
    }

    // ========================================================================
    // Introspection actions
    // ========================================================================

    fn handle_get_stats(&self) -> PoolResult<Response> {
        let snapshot = self.pool.snapshot();
        Ok(Response::ok(&StatsReply {
            pool_size: snapshot.size,
            max_pool_size: snapshot.max_size,
            connection_stats: self.stats.snapshot(),
            active_connections: snapshot.keys.iter().map(|k| k.canonical()).collect(),
            instance_id: self.instance_id.to_string(),
        }))
    }

    fn handle_get_metrics(&self) -> PoolResult<Response> {
        let snapshot = self.pool.snapshot();
        let sample = self.metrics.sample();
        Ok(Response::ok(&MetricsReply {
            pool_size: snapshot.size,
            max_pool_size: snapshot.max_size,
            instance_id: self.instance_id.to_string(),
            uptime_s: sample.uptime_s,
            memory_usage: sample.memory_usage,
            peak_memory: sample.peak_memory,
        }))
    }

    fn handle_close_connection(&self, host: String, port: u16) -> PoolResult<Response> {
        if host.is_empty() {
            return Err(PoolError::missing_field("host"));
        }
        let key = EndpointKey::new(host, port);
        let closed = self.pool.remove(&key);
        Ok(Response::ok(&json!({
            "endpoint": key.canonical(),
            "closed": closed,
        })))
    }

    /// Build a health report from live checks. Also used by the
    /// periodic self-check.
    pub async fn health_report(&self) -> HealthReply {
        let ipc_socket = self.socket_path.exists();
        let external_cache = match &self.cache {
            Some(cache) => Some(cache.ping().await.is_ok()),
            None => None,
        };
        let active_connections = self.pool.size();

        let status = if !ipc_socket {
            HealthStatus::Unhealthy
        } else if external_cache == Some(false) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReply {
            status,
            instance_id: self.instance_id.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            checks: HealthChecks {
                ipc_socket,
                external_cache,
                active_connections,
            },
        }
    }
}
