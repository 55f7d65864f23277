//! Client library for the sockpool daemon.
//!
//! [`PoolClient`] is what frontend processes link. Every call opens a
//! fresh connection to the daemon's IPC socket, performs one JSON round
//! trip and closes. On top of that transport the client layers:
//!
//! - a retry loop with linear backoff (`retry_delay × attempt`),
//! - a per-endpoint circuit breaker that fails fast without touching
//!   the IPC socket while an endpoint is misbehaving,
//! - an opt-in result cache keyed by `(action, host, port, md5(payload))`,
//! - a bounded-concurrency batch path for fan-out senders.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use sockpool_common::{BreakerDecision, CircuitBreaker, CircuitBreakerConfig, EndpointKey};
use sockpool_common::{PoolError, PoolResult};
use sockpool_config::ClientConfig;

use crate::protocol::{Request, Response};

/// Per-call options for endpoint-addressed requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Consult and populate the client result cache for this request.
    /// Only meaningful when the cache is enabled in [`ClientConfig`].
    pub use_cache: bool,
}

/// One entry of a batch send.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub host: String,
    pub port: u16,
    pub message: String,
    pub vehicle_id: String,
    pub options: SendOptions,
}

/// Outcome of one batch entry.
#[derive(Debug, Clone)]
pub struct BatchItemResult {
    pub host: String,
    pub port: u16,
    pub vehicle_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: Option<f64>,
}

/// Batch summary plus per-entry results, in submission order.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_ms: f64,
    pub results: Vec<BatchItemResult>,
}

struct CachedEntry {
    response: Response,
    stored_at: Instant,
}

/// Client handle to a running sockpool daemon.
///
/// Cheap to share behind an `Arc`; all state (breakers, cache) is
/// internally synchronized.
pub struct PoolClient {
    config: ClientConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    cache: DashMap<String, CachedEntry>,
}

impl PoolClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            cache: DashMap::new(),
        }
    }

    /// Build a client from `SOCKET_POOL_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(sockpool_config::Config::from_env().client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Submit one telemetry frame for delivery through the pool.
    pub async fn send_gps(
        &self,
        host: &str,
        port: u16,
        message: &str,
        vehicle_id: &str,
        options: SendOptions,
    ) -> PoolResult<Response> {
        let request = Request::SendGps {
            host: host.to_string(),
            port,
            message: message.to_string(),
            vehicle_id: vehicle_id.to_string(),
            options: None,
        };
        let endpoint = EndpointKey::new(host, port);
        let cache_key = (self.config.cache_enabled && options.use_cache)
            .then(|| cache_key(request.action(), host, port, message));
        self.execute(&request, Some(&endpoint), cache_key).await
    }

    /// Ask the daemon to drop its pooled connection to an endpoint.
    pub async fn close_connection(&self, host: &str, port: u16) -> PoolResult<Response> {
        let request = Request::CloseConnection {
            host: host.to_string(),
            port,
        };
        self.execute(&request, None, None).await
    }

    pub async fn get_stats(&self) -> PoolResult<Response> {
        self.execute(&Request::GetStats, None, None).await
    }

    pub async fn get_metrics(&self) -> PoolResult<Response> {
        self.execute(&Request::GetMetrics, None, None).await
    }

    pub async fn health_check(&self) -> PoolResult<Response> {
        self.execute(&Request::HealthCheck, None, None).await
    }

    pub async fn get_config(&self) -> PoolResult<Response> {
        self.execute(&Request::GetConfig, None, None).await
    }

    /// Pre-establish pooled connections by sending a literal `TEST`
    /// probe to each endpoint. Whether a remote peer tolerates the
    /// probe payload is endpoint-specific, so this is never automatic.
    pub async fn warm_up(&self, endpoints: &[EndpointKey]) -> Vec<(EndpointKey, bool)> {
        let mut results = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let outcome = self
                .send_gps(
                    &endpoint.host,
                    endpoint.port,
                    "TEST",
                    "warm-up",
                    SendOptions::default(),
                )
                .await;
            let ok = matches!(&outcome, Ok(response) if response.success);
            if !ok {
                debug!(endpoint = %endpoint, "Warm-up probe failed");
            }
            results.push((endpoint.clone(), ok));
        }
        results
    }

    /// Send a batch of frames with bounded concurrency.
    ///
    /// Per-entry failures are reported in the result list; the call
    /// itself never fails.
    pub async fn send_batch(&self, items: Vec<BatchItem>) -> BatchResult {
        let started = Instant::now();
        let batch_id = Uuid::new_v4().to_string();
        let total = items.len();
        let semaphore = Arc::new(Semaphore::new(self.config.batch_concurrency));

        let tasks = items.into_iter().map(|item| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return BatchItemResult {
                            host: item.host,
                            port: item.port,
                            vehicle_id: item.vehicle_id,
                            success: false,
                            error: Some("batch cancelled".to_string()),
                            duration_ms: None,
                        }
                    }
                };
                let item_started = Instant::now();
                let outcome = self
                    .send_gps(
                        &item.host,
                        item.port,
                        &item.message,
                        &item.vehicle_id,
                        item.options,
                    )
                    .await;
                let duration_ms = item_started.elapsed().as_secs_f64() * 1000.0;
                match outcome {
                    Ok(response) => BatchItemResult {
                        host: item.host,
                        port: item.port,
                        vehicle_id: item.vehicle_id,
                        success: response.success,
                        error: response.error,
                        duration_ms: Some(duration_ms),
                    },
                    Err(error) => BatchItemResult {
                        host: item.host,
                        port: item.port,
                        vehicle_id: item.vehicle_id,
                        success: false,
                        error: Some(error.to_string()),
                        duration_ms: Some(duration_ms),
                    },
                }
            }
        });

        let results = join_all(tasks).await;
        let successful = results.iter().filter(|r| r.success).count();
        let summary = BatchResult {
            batch_id,
            total,
            successful,
            failed: total - successful,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            results,
        };
        debug!(
            batch_id = %summary.batch_id,
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "Batch send complete"
        );
        summary
    }

    // ========================================================================
    // Request pipeline
    // ========================================================================

    async fn execute(
        &self,
        request: &Request,
        endpoint: Option<&EndpointKey>,
        cache_key: Option<String>,
    ) -> PoolResult<Response> {
        let breaker = match endpoint {
            Some(endpoint) if self.config.circuit_breaker_enabled => {
                Some(self.breaker_for(endpoint))
            }
            _ => None,
        };

        let mut probing = false;
        if let Some(breaker) = &breaker {
            match breaker.check() {
                BreakerDecision::Allow => {}
                BreakerDecision::AllowProbe => {
                    trace!(action = request.action(), "Half-open probe permitted");
                    probing = true;
                }
                BreakerDecision::Reject { retry_in } => {
                    let endpoint = endpoint.map(|e| e.canonical()).unwrap_or_default();
                    return Err(PoolError::CircuitOpen {
                        endpoint,
                        retry_in_ms: retry_in.as_millis() as u64,
                    });
                }
            }
        }

        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache_get(key) {
                trace!(action = request.action(), "Result cache hit");
                if probing {
                    // The probe never reached the wire; hand the slot back.
                    if let Some(breaker) = &breaker {
                        breaker.release_probe();
                    }
                }
                return Ok(hit);
            }
        }

        let started = Instant::now();
        let attempts = self.config.retry_attempts.max(1);
        let mut outcome: PoolResult<Response> =
            Err(PoolError::internal("request loop did not run"));

        for attempt in 1..=attempts {
            outcome = self.round_trip(request).await;
            match &outcome {
                Ok(response) if response.success => break,
                Ok(response) => {
                    trace!(
                        action = request.action(),
                        attempt,
                        error = response.error.as_deref().unwrap_or(""),
                        "Daemon reported failure"
                    );
                }
                Err(error) if !error.is_retryable() => break,
                Err(error) => {
                    trace!(action = request.action(), attempt, error = %error, "Request attempt failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let succeeded = matches!(&outcome, Ok(response) if response.success);
        if let Some(breaker) = &breaker {
            if succeeded {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }

        debug!(
            action = request.action(),
            success = succeeded,
            duration_ms,
            "Request complete"
        );

        match outcome {
            Ok(mut response) => {
                response.duration_ms = Some(duration_ms);
                if succeeded {
                    if let Some(key) = cache_key {
                        self.cache_put(key, &response);
                    }
                }
                Ok(response)
            }
            Err(error) => Err(error),
        }
    }

    /// One connect/write/read/parse cycle against the daemon socket.
    async fn round_trip(&self, request: &Request) -> PoolResult<Response> {
        let raw = serde_json::to_vec(request)
            .map_err(|e| PoolError::internal(format!("request serialization: {e}")))?;

        let exchange = async {
            let mut stream = UnixStream::connect(&self.config.socket_path).await?;
            stream.write_all(&raw).await?;

            // The daemon writes one response and closes; read to EOF
            // bounded by the protocol cap.
            let mut buf = vec![0u8; self.config.max_response_bytes];
            let mut filled = 0;
            loop {
                let n = stream.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
                if filled == buf.len() {
                    break;
                }
            }
            Ok::<Vec<u8>, std::io::Error>(buf[..filled].to_vec())
        };

        let raw_response = timeout(self.config.timeout, exchange)
            .await
            .map_err(|_| {
                PoolError::internal(format!(
                    "daemon did not respond within {} ms",
                    self.config.timeout.as_millis()
                ))
            })??;

        if raw_response.is_empty() {
            return Err(PoolError::internal("daemon closed connection without response"));
        }
        serde_json::from_slice(&raw_response)
            .map_err(|e| PoolError::internal(format!("invalid response from daemon: {e}")))
    }

    fn breaker_for(&self, endpoint: &EndpointKey) -> Arc<CircuitBreaker> {
        let key = endpoint.canonical();
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    CircuitBreakerConfig {
                        failure_threshold: self.config.cb_threshold,
                        cooldown_seconds: self.config.cb_timeout.as_secs(),
                    },
                    key,
                ))
            })
            .clone()
    }

    fn cache_get(&self, key: &str) -> Option<Response> {
        let entry = self.cache.get(key)?;
        if entry.stored_at.elapsed() > self.config.cache_ttl {
            drop(entry);
            self.cache.remove(key);
            return None;
        }
        Some(entry.response.clone())
    }

    fn cache_put(&self, key: String, response: &Response) {
        self.cache.insert(
            key,
            CachedEntry {
                response: response.clone(),
                stored_at: Instant::now(),
            },
        );
        // Opportunistic expiry so the map does not grow unbounded under
        // a churning key space.
        if self.cache.len() > 1024 {
            let ttl = self.config.cache_ttl;
            self.cache.retain(|_, entry| entry.stored_at.elapsed() <= ttl);
            warn!(size = self.cache.len(), "Result cache swept");
        }
    }
}

fn cache_key(action: &str, host: &str, port: u16, payload: &str) -> String {
    format!("{}:{}:{}:{:x}", action, host, port, md5::compute(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UnixListener;

    fn test_client(path: PathBuf) -> PoolClient {
        let mut config = ClientConfig::default();
        config.socket_path = path;
        config.retry_attempts = 2;
        config.retry_delay = std::time::Duration::from_millis(5);
        config.cb_threshold = 2;
        config.cb_timeout = std::time::Duration::from_secs(60);
        PoolClient::new(config)
    }

    /// Mock daemon answering every connection with a canned response.
    /// Returns a counter of served connections.
    fn spawn_mock_daemon(path: &Path, response: serde_json::Value) -> Arc<AtomicUsize> {
        let listener = UnixListener::bind(path).unwrap();
        let served = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&served);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let body = response.to_string();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(body.as_bytes()).await;
                });
            }
        });
        served
    }

    #[tokio::test]
    async fn round_trip_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        spawn_mock_daemon(
            &path,
            serde_json::json!({"success": true, "response": "OK\r", "hex_response": "4f4b0d",
                               "bytes_sent": 3, "vehicle_id": "V1", "timestamp": 1}),
        );

        let client = test_client(path);
        let response = client
            .send_gps("10.0.0.1", 5027, "PING", "V1", SendOptions::default())
            .await
            .unwrap();
        assert!(response.success);
        assert!(response.duration_ms.is_some());
        let reply: crate::protocol::SendGpsReply = response.decode().unwrap();
        assert_eq!(reply.hex_response, "4f4b0d");
    }

    #[tokio::test]
    async fn daemon_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let served = spawn_mock_daemon(
            &path,
            serde_json::json!({"success": false, "error": "read_failed: upstream: timed out"}),
        );

        let client = test_client(path);
        let response = client
            .send_gps("10.0.0.1", 5027, "PING", "V1", SendOptions::default())
            .await
            .unwrap();
        assert!(!response.success);
        // retry_attempts = 2 means both attempts hit the daemon.
        assert_eq!(served.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn circuit_opens_and_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens here: every attempt is a transport error.
        let path = dir.path().join("missing.sock");
        let client = test_client(path);

        for _ in 0..2 {
            let err = client
                .send_gps("10.0.0.9", 5027, "PING", "V1", SendOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err.wire_code(), "internal");
        }

        // Threshold reached: the next call must fail fast without I/O.
        let err = client
            .send_gps("10.0.0.9", 5027, "PING", "V1", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::CircuitOpen { .. }));

        // A different endpoint is unaffected (its own breaker, which
        // still sees transport errors, not circuit_open).
        let err = client
            .send_gps("10.0.0.10", 5027, "PING", "V1", SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.wire_code(), "internal");
    }

    #[tokio::test]
    async fn result_cache_short_circuits_transport() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let served = spawn_mock_daemon(
            &path,
            serde_json::json!({"success": true, "response": "A\r", "hex_response": "410d",
                               "bytes_sent": 2, "vehicle_id": "V1", "timestamp": 1}),
        );

        let mut config = ClientConfig::default();
        config.socket_path = path;
        config.cache_enabled = true;
        let client = PoolClient::new(config);
        let options = SendOptions { use_cache: true };

        let first = client.send_gps("h", 1, "A", "V1", options).await.unwrap();
        let second = client.send_gps("h", 1, "A", "V1", options).await.unwrap();
        assert!(first.success && second.success);
        assert_eq!(served.load(Ordering::SeqCst), 1);

        // A different payload misses the cache.
        client.send_gps("h", 1, "B", "V1", options).await.unwrap();
        assert_eq!(served.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batch_reports_per_entry_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        spawn_mock_daemon(
            &path,
            serde_json::json!({"success": true, "response": "X\r", "hex_response": "580d",
                               "bytes_sent": 2, "vehicle_id": "V1", "timestamp": 1}),
        );

        let client = test_client(path);
        let items: Vec<BatchItem> = (0..5)
            .map(|i| BatchItem {
                host: "10.0.0.1".to_string(),
                port: 5027,
                message: format!("frame-{i}"),
                vehicle_id: format!("V{i}"),
                options: SendOptions::default(),
            })
            .collect();

        let summary = client.send_batch(items).await;
        assert_eq!(summary.total, 5);
        assert_eq!(summary.successful, 5);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.results.len(), 5);
        assert!(summary.results.iter().all(|r| r.success));
    }

    #[test]
    fn cache_key_distinguishes_payloads() {
        let a = cache_key("send_gps", "h", 1, "AAA");
        let b = cache_key("send_gps", "h", 1, "BBB");
        assert_ne!(a, b);
        assert!(a.starts_with("send_gps:h:1:"));
    }
}
