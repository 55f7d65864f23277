//! sockpool daemon: multiplexes short-lived local clients onto a
//! shared pool of persistent upstream TCP connections.
//!
//! Clients connect over a Unix stream socket, submit one JSON request
//! naming a remote `host:port` plus a payload, and receive one JSON
//! response after the daemon performs the exchange on a pooled
//! connection. [`PoolService`] wires the pieces together and owns the
//! lifecycle; the individual modules carry the mechanics.

pub mod cache;
pub mod cli;
pub mod connector;
pub mod dispatcher;
pub mod logging;
pub mod maintenance;
pub mod metrics;
pub mod pidfile;
pub mod pool;
pub mod server;
pub mod stats;

use std::fs;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use sockpool_common::{InstanceId, PoolResult};
use sockpool_config::Config;

use crate::cache::CacheClient;
use crate::dispatcher::Dispatcher;
use crate::maintenance::HealthMonitor;
use crate::metrics::{MetricsPublisher, ProcessMetrics};
use crate::pool::ConnectionPool;
use crate::server::IpcServer;
use crate::stats::StatsTable;

/// The assembled daemon.
///
/// Construct exactly one per process with an explicit configuration;
/// [`PoolService::run`] serves until shutdown is triggered by signal
/// or by a [`PoolService::shutdown_trigger`] handle.
pub struct PoolService {
    config: Config,
    shutdown_tx: watch::Sender<bool>,
}

impl PoolService {
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            shutdown_tx,
        }
    }

    /// Handle for requesting shutdown from outside (tests, embedding).
    pub fn shutdown_trigger(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Run the daemon to completion.
    ///
    /// On shutdown: the accept loop stops, in-flight requests drain
    /// within the configured grace period, all pooled sockets close,
    /// and the IPC socket and PID file are removed.
    pub async fn run(self) -> PoolResult<()> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| sockpool_common::PoolError::internal(e.to_string()))?;
        let instance_id = InstanceId::new();
        info!(
            instance_id = %instance_id,
            max_pool_size = config.daemon.max_pool_size,
            socket_path = %config.daemon.socket_path.display(),
            "Starting sockpool daemon"
        );

        let socket_path = server::prepare_socket_path(&config.daemon);
        let pool = Arc::new(ConnectionPool::new(config.daemon.max_pool_size));
        let stats = Arc::new(StatsTable::new());
        let metrics = Arc::new(ProcessMetrics::new());

        let cache = if config.redis.enabled {
            let cache = Arc::new(CacheClient::new(&config.redis));
            if let Err(e) = cache.connect().await {
                warn!(error = %e, "External cache unreachable at startup, continuing without it");
            }
            Some(cache)
        } else {
            None
        };

        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            Arc::clone(&pool),
            Arc::clone(&stats),
            Arc::clone(&metrics),
            cache.clone(),
            instance_id.clone(),
            socket_path.clone(),
        ));

        // Bind failure is fatal; there is no daemon without the socket.
        let ipc = IpcServer::bind(socket_path.clone(), Arc::clone(&dispatcher), &config.daemon)?;
        pidfile::write(&config.daemon.pid_file)?;

        let publisher = Arc::new(MetricsPublisher::new(
            cache,
            config.daemon.metrics_enabled,
            instance_id.clone(),
            &config.redis,
        ));
        let monitor = Arc::new(HealthMonitor::new());
        let maintenance_tasks = maintenance::spawn_all(
            &config.daemon,
            Arc::clone(&pool),
            Arc::clone(&dispatcher),
            metrics,
            publisher,
            monitor,
            self.shutdown_tx.subscribe(),
        );

        spawn_signal_listener(self.shutdown_tx.clone());

        ipc.run(self.shutdown_tx.subscribe(), config.daemon.shutdown_timeout)
            .await;

        // Teardown, in the order the protocol promises.
        for task in maintenance_tasks {
            task.abort();
        }
        let closed = pool.clear();
        info!(closed, "Closed pooled upstream connections");
        if let Err(e) = fs::remove_file(&socket_path) {
            warn!(path = %socket_path.display(), error = %e, "Could not unlink IPC socket");
        }
        pidfile::remove(&config.daemon.pid_file);
        info!(instance_id = %instance_id, "Shutdown complete");
        Ok(())
    }
}

/// SIGTERM / SIGINT both request a graceful shutdown.
fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });
}
