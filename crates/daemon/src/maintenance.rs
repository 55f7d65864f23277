//! Periodic background tasks: idle eviction, metric snapshots and the
//! health self-check.
//!
//! Each task runs on its own interval with skipped (not bunched)
//! missed ticks, observes the shared shutdown signal, and never
//! re-enters: the next tick waits for the previous body to finish.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use sockpool_config::DaemonConfig;
use sockpool_ipc::protocol::{HealthReply, HealthStatus};

use crate::dispatcher::Dispatcher;
use crate::metrics::{MetricsPublisher, ProcessMetrics};
use crate::pool::ConnectionPool;

/// Most recent health self-check result, shared with whoever wants it.
#[derive(Default)]
pub struct HealthMonitor {
    last: RwLock<Option<HealthReply>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, report: HealthReply) {
        *self.last.write().await = Some(report);
    }

    pub async fn last(&self) -> Option<HealthReply> {
        self.last.read().await.clone()
    }
}

/// Spawn the three maintenance tasks. The returned handles finish once
/// shutdown is signalled.
pub fn spawn_all(
    config: &DaemonConfig,
    pool: Arc<ConnectionPool>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<ProcessMetrics>,
    publisher: Arc<MetricsPublisher>,
    monitor: Arc<HealthMonitor>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_cleanup(config, pool, shutdown.clone()),
        spawn_metrics(config, dispatcher.clone(), metrics, publisher, shutdown.clone()),
        spawn_health(config, dispatcher, monitor, shutdown),
    ]
}

fn spawn_cleanup(
    config: &DaemonConfig,
    pool: Arc<ConnectionPool>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let ttl = config.connection_timeout;
    let period = config.cleanup_interval;
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let evicted = pool.evict_expired(ttl);
                    if !evicted.is_empty() {
                        info!(
                            evicted = evicted.len(),
                            ttl_s = ttl.as_secs(),
                            "Evicted idle-expired connections"
                        );
                    }
                }
            }
        }
        debug!("Cleanup task stopped");
    })
}

fn spawn_metrics(
    config: &DaemonConfig,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<ProcessMetrics>,
    publisher: Arc<MetricsPublisher>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = config.metrics_interval;
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let snapshot = dispatcher.pool().snapshot();
                    let sample = metrics.sample();
                    publisher.publish_snapshot(&snapshot, &sample).await;
                    publisher
                        .push_record("pool_size", snapshot.size as f64, BTreeMap::new())
                        .await;
                }
            }
        }
        debug!("Metrics task stopped");
    })
}

fn spawn_health(
    config: &DaemonConfig,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<HealthMonitor>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = config.health_check_interval;
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let report = dispatcher.health_report().await;
                    if report.status != HealthStatus::Healthy {
                        warn!(status = ?report.status, "Health self-check degraded");
                    }
                    monitor.record(report).await;
                }
            }
        }
        debug!("Health check task stopped");
    })
}
