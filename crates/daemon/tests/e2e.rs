//! End-to-end tests: a real daemon on a temp-dir Unix socket, real
//! client library, and mock TCP echo peers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use sockpool_common::{PoolError, PoolResult};
use sockpool_config::{ClientConfig, Config};
use sockpool_daemon::PoolService;
use sockpool_ipc::protocol::{SendGpsReply, StatsReply};
use sockpool_ipc::{PoolClient, SendOptions};

// ============================================================================
// Harness
// ============================================================================

struct TestDaemon {
    socket_path: PathBuf,
    pid_file: PathBuf,
    trigger: watch::Sender<bool>,
    handle: JoinHandle<PoolResult<()>>,
    client_config: ClientConfig,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    async fn spawn(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.daemon.socket_path = dir.path().join("daemon.sock");
        config.daemon.pid_file = dir.path().join("daemon.pid");
        config.client.socket_path = config.daemon.socket_path.clone();
        config.daemon.max_retries = 2;
        config.daemon.retry_delay = Duration::from_millis(20);
        tweak(&mut config);

        let socket_path = config.daemon.socket_path.clone();
        let pid_file = config.daemon.pid_file.clone();
        let client_config = ClientConfig {
            retry_attempts: 1,
            circuit_breaker_enabled: false,
            ..config.client.clone()
        };

        let service = PoolService::new(config);
        let trigger = service.shutdown_trigger();
        let handle = tokio::spawn(service.run());

        // Wait for the listener to come up.
        for _ in 0..200 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(socket_path.exists(), "daemon did not bind its socket");

        Self {
            socket_path,
            pid_file,
            trigger,
            handle,
            client_config,
            _dir: dir,
        }
    }

    fn client(&self) -> PoolClient {
        PoolClient::new(self.client_config.clone())
    }

    fn client_with(&self, tweak: impl FnOnce(&mut ClientConfig)) -> PoolClient {
        let mut config = self.client_config.clone();
        tweak(&mut config);
        PoolClient::new(config)
    }

    async fn shutdown(self) {
        let _ = self.trigger.send(true);
        let result = self.handle.await.expect("daemon task panicked");
        result.expect("daemon exited with error");
    }
}

/// TCP echo peer. Binds with SO_REUSEADDR so tests can restart a peer
/// on the same port; `stop` drops every open socket so pooled
/// connections observe the close.
struct EchoServer {
    port: u16,
    accept_task: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl EchoServer {
    fn start(port: u16, delay: Duration) -> Self {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        socket.set_reuse_address(true).unwrap();
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        socket.bind(&addr.into()).unwrap();
        socket.listen(16).unwrap();
        socket.set_nonblocking(true).unwrap();
        let listener = tokio::net::TcpListener::from_std(socket.into()).unwrap();
        let port = listener.local_addr().unwrap().port();

        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&connections);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let handle = tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if !delay.is_zero() {
                                    tokio::time::sleep(delay).await;
                                }
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
                tracked.lock().unwrap().push(handle);
            }
        });

        Self {
            port,
            accept_task,
            connections,
        }
    }

    /// Stop listening and sever every open connection.
    fn stop(self) {
        self.accept_task.abort();
        for handle in self.connections.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

/// Reserve a port that is currently free.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn fetch_stats(client: &PoolClient) -> StatsReply {
    client
        .get_stats()
        .await
        .expect("get_stats transport")
        .decode()
        .expect("get_stats payload")
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn cold_miss_then_warm_hit() {
    let daemon = TestDaemon::spawn(|config| {
        config.daemon.max_pool_size = 10;
        config.daemon.connection_timeout = Duration::from_secs(60);
    })
    .await;
    let echo = EchoServer::start(0, Duration::ZERO);
    let client = daemon.client();

    let first = client
        .send_gps("127.0.0.1", echo.port, "ABC", "V1", SendOptions::default())
        .await
        .unwrap();
    assert!(first.success, "error: {:?}", first.error);
    let reply: SendGpsReply = first.decode().unwrap();
    assert_eq!(reply.response, "ABC\r");
    assert_eq!(reply.hex_response, "4142430d");
    assert_eq!(reply.bytes_sent, 4);
    assert_eq!(reply.vehicle_id, "V1");
    assert!(first.request_id.is_some());
    assert!(first.processing_time.is_some());

    let second = client
        .send_gps("127.0.0.1", echo.port, "ABC", "V1", SendOptions::default())
        .await
        .unwrap();
    assert!(second.success);

    let stats = fetch_stats(&client).await;
    assert_eq!(stats.pool_size, 1, "second request must reuse the socket");
    let key = format!("127.0.0.1:{}", echo.port);
    let counters = &stats.connection_stats[&key];
    assert_eq!((counters.success, counters.failed, counters.total), (2, 0, 2));

    echo.stop();
    daemon.shutdown().await;
}

#[tokio::test]
async fn peer_drop_triggers_reconnect_and_retry() {
    let daemon = TestDaemon::spawn(|_| {}).await;
    let echo = EchoServer::start(0, Duration::ZERO);
    let port = echo.port;
    let client = daemon.client();

    let first = client
        .send_gps("127.0.0.1", port, "A1", "V1", SendOptions::default())
        .await
        .unwrap();
    assert!(first.success);

    // Kill the peer; the pooled socket is now dead. Bring up a fresh
    // peer on the same port.
    echo.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let echo = EchoServer::start(port, Duration::ZERO);

    let second = client
        .send_gps("127.0.0.1", port, "A2", "V1", SendOptions::default())
        .await
        .unwrap();
    assert!(
        second.success,
        "must reconnect through the dead socket: {:?}",
        second.error
    );

    let stats = fetch_stats(&client).await;
    let counters = &stats.connection_stats[&format!("127.0.0.1:{port}")];
    assert_eq!((counters.success, counters.failed, counters.total), (2, 0, 2));

    echo.stop();
    daemon.shutdown().await;
}

#[tokio::test]
async fn unreachable_endpoint_reports_connect_failed() {
    let daemon = TestDaemon::spawn(|_| {}).await;
    let client = daemon.client();

    let response = client
        .send_gps("127.0.0.1", 1, "X", "V1", SendOptions::default())
        .await
        .unwrap();
    assert!(!response.success);
    assert!(
        response.error.as_deref().unwrap().starts_with("connect_failed"),
        "got: {:?}",
        response.error
    );

    let stats = fetch_stats(&client).await;
    let counters = &stats.connection_stats["127.0.0.1:1"];
    assert_eq!((counters.failed, counters.total), (1, 1));
    assert_eq!(stats.pool_size, 0);

    daemon.shutdown().await;
}

#[tokio::test]
async fn lru_eviction_under_pressure() {
    let daemon = TestDaemon::spawn(|config| {
        config.daemon.max_pool_size = 2;
    })
    .await;
    let a = EchoServer::start(0, Duration::ZERO);
    let b = EchoServer::start(0, Duration::ZERO);
    let c = EchoServer::start(0, Duration::ZERO);
    let client = daemon.client();

    for echo in [&a, &b, &c] {
        let response = client
            .send_gps("127.0.0.1", echo.port, "W", "V1", SendOptions::default())
            .await
            .unwrap();
        assert!(response.success);
        // Distinct last-used instants for a deterministic LRU order.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = fetch_stats(&client).await;
    assert_eq!(stats.pool_size, 2);
    let key = |port: u16| format!("127.0.0.1:{port}");
    assert!(
        !stats.active_connections.contains(&key(a.port)),
        "oldest endpoint must be evicted: {:?}",
        stats.active_connections
    );
    assert!(stats.active_connections.contains(&key(b.port)));
    assert!(stats.active_connections.contains(&key(c.port)));

    a.stop();
    b.stop();
    c.stop();
    daemon.shutdown().await;
}

#[tokio::test]
async fn client_circuit_breaker_opens_and_recovers() {
    let daemon = TestDaemon::spawn(|config| {
        // Fail fast on the daemon side so the test stays quick.
        config.daemon.max_retries = 1;
    })
    .await;
    let port = free_port();
    let client = daemon.client_with(|config| {
        config.circuit_breaker_enabled = true;
        config.cb_threshold = 3;
        config.cb_timeout = Duration::from_secs(2);
        config.retry_attempts = 1;
    });

    // Three failing calls against a closed port.
    for _ in 0..3 {
        let response = client
            .send_gps("127.0.0.1", port, "X", "V1", SendOptions::default())
            .await
            .unwrap();
        assert!(!response.success);
    }

    // Fourth call: circuit is open, no IPC round trip.
    let err = client
        .send_gps("127.0.0.1", port, "X", "V1", SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen { .. }), "got: {err:?}");

    // Cooldown passes and the endpoint comes up: half-open probe
    // succeeds and the circuit closes.
    tokio::time::sleep(Duration::from_millis(2100)).await;
    let echo = EchoServer::start(port, Duration::ZERO);

    let probe = client
        .send_gps("127.0.0.1", port, "X", "V1", SendOptions::default())
        .await
        .unwrap();
    assert!(probe.success, "half-open probe failed: {:?}", probe.error);

    let normal = client
        .send_gps("127.0.0.1", port, "X", "V1", SendOptions::default())
        .await
        .unwrap();
    assert!(normal.success);

    echo.stop();
    daemon.shutdown().await;
}

#[tokio::test]
async fn graceful_shutdown_finishes_in_flight_request() {
    let daemon = TestDaemon::spawn(|_| {}).await;
    let echo = EchoServer::start(0, Duration::from_millis(500));
    let port = echo.port;

    let client = daemon.client();
    let in_flight = tokio::spawn(async move {
        client
            .send_gps("127.0.0.1", port, "SLOW", "V1", SendOptions::default())
            .await
    });

    // Let the request reach the slow peer, then request shutdown.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let socket_path = daemon.socket_path.clone();
    let pid_file = daemon.pid_file.clone();
    daemon.shutdown().await;

    let response = in_flight.await.unwrap().expect("in-flight request failed");
    assert!(response.success, "error: {:?}", response.error);

    assert!(!socket_path.exists(), "IPC socket must be unlinked");
    assert!(!pid_file.exists(), "PID file must be removed");

    echo.stop();
}

// ============================================================================
// Protocol edge cases over the raw socket
// ============================================================================

async fn raw_round_trip(path: &std::path::Path, payload: &[u8]) -> serde_json::Value {
    let mut stream = UnixStream::connect(path).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    serde_json::from_slice(&buf).expect("response must be JSON")
}

#[tokio::test]
async fn malformed_json_is_rejected_cleanly() {
    let daemon = TestDaemon::spawn(|_| {}).await;

    let response = raw_round_trip(&daemon.socket_path, b"{this is not json").await;
    assert_eq!(response["success"], false);
    let error = response["error"].as_str().unwrap();
    assert!(error.starts_with("Invalid JSON"), "got: {error}");
    assert!(response["request_id"].is_string());

    daemon.shutdown().await;
}

#[tokio::test]
async fn unknown_action_is_named_in_the_error() {
    let daemon = TestDaemon::spawn(|_| {}).await;

    let response = raw_round_trip(&daemon.socket_path, br#"{"action":"reboot"}"#).await;
    assert_eq!(response["success"], false);
    assert_eq!(response["error"], "Unknown action: reboot");

    daemon.shutdown().await;
}

#[tokio::test]
async fn close_connection_via_client_is_idempotent() {
    let daemon = TestDaemon::spawn(|_| {}).await;
    let echo = EchoServer::start(0, Duration::ZERO);
    let client = daemon.client();

    let response = client
        .send_gps("127.0.0.1", echo.port, "A", "V1", SendOptions::default())
        .await
        .unwrap();
    assert!(response.success);

    let first = client.close_connection("127.0.0.1", echo.port).await.unwrap();
    assert!(first.success);
    assert_eq!(first.payload["closed"], true);

    let second = client.close_connection("127.0.0.1", echo.port).await.unwrap();
    assert!(second.success);
    assert_eq!(second.payload["closed"], false);

    assert_eq!(fetch_stats(&client).await.pool_size, 0);

    echo.stop();
    daemon.shutdown().await;
}
