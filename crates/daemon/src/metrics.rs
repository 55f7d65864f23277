//! Process-level gauges and metric record publication.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tracing::warn;

use sockpool_common::InstanceId;
use sockpool_config::RedisConfig;

use crate::cache::CacheClient;
use crate::pool::PoolSnapshot;

/// Redis key holding the bounded metric record list.
const METRICS_LIST_KEY: &str = "sockpool:metrics:records";

/// One emitted metric sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub metric_name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    /// Unix seconds
    pub timestamp: i64,
    pub instance_id: String,
}

/// Process gauges for `get_metrics`.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSample {
    pub uptime_s: u64,
    pub memory_usage: u64,
    pub peak_memory: u64,
}

/// Samples uptime and resident memory, tracking the peak since startup.
pub struct ProcessMetrics {
    started: Instant,
    pid: Pid,
    system: Mutex<System>,
    peak_rss: AtomicU64,
}

impl ProcessMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            pid: Pid::from_u32(std::process::id()),
            system: Mutex::new(System::new()),
            peak_rss: AtomicU64::new(0),
        }
    }

    pub fn sample(&self) -> ProcessSample {
        let rss = {
            let mut system = self.system.lock().expect("metrics lock poisoned");
            system.refresh_process(self.pid);
            system.process(self.pid).map(|p| p.memory()).unwrap_or(0)
        };
        let peak = self.peak_rss.fetch_max(rss, Ordering::Relaxed).max(rss);
        ProcessSample {
            uptime_s: self.started.elapsed().as_secs(),
            memory_usage: rss,
            peak_memory: peak,
        }
    }
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes pool snapshots and metric records to the external cache.
///
/// Everything here is fire-and-forget: failures are logged at warning
/// level and never reach the request path.
pub struct MetricsPublisher {
    cache: Option<Arc<CacheClient>>,
    enabled: bool,
    instance_id: InstanceId,
    snapshot_ttl_s: u64,
    list_cap: usize,
}

impl MetricsPublisher {
    pub fn new(
        cache: Option<Arc<CacheClient>>,
        enabled: bool,
        instance_id: InstanceId,
        redis: &RedisConfig,
    ) -> Self {
        Self {
            cache,
            enabled,
            instance_id,
            snapshot_ttl_s: redis.snapshot_ttl.as_secs(),
            list_cap: redis.metrics_list_cap,
        }
    }

    /// Publish a keyed pool snapshot with TTL.
    pub async fn publish_snapshot(&self, pool: &PoolSnapshot, sample: &ProcessSample) {
        if !self.enabled {
            return;
        }
        let Some(cache) = &self.cache else {
            return;
        };
        let key = format!("sockpool:metrics:{}", self.instance_id);
        let body = serde_json::json!({
            "instance_id": self.instance_id.as_str(),
            "pool_size": pool.size,
            "max_pool_size": pool.max_size,
            "active_connections": pool.keys.len(),
            "uptime_s": sample.uptime_s,
            "memory_usage": sample.memory_usage,
            "timestamp": chrono::Utc::now().timestamp(),
        });
        if let Err(e) = cache
            .set_with_ttl(&key, &body.to_string(), self.snapshot_ttl_s)
            .await
        {
            warn!(error = %e, "Failed to publish metrics snapshot");
        }
    }

    /// Append one metric record to the bounded list.
    pub async fn push_record(&self, name: &str, value: f64, tags: BTreeMap<String, String>) {
        if !self.enabled {
            return;
        }
        let Some(cache) = &self.cache else {
            return;
        };
        let record = MetricRecord {
            metric_name: name.to_string(),
            value,
            tags,
            timestamp: chrono::Utc::now().timestamp(),
            instance_id: self.instance_id.to_string(),
        };
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to serialize metric record");
                return;
            }
        };
        if let Err(e) = cache.push_trimmed(METRICS_LIST_KEY, &raw, self.list_cap).await {
            warn!(metric = name, error = %e, "Failed to push metric record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_reports_uptime_and_tracks_peak() {
        let metrics = ProcessMetrics::new();
        let first = metrics.sample();
        let second = metrics.sample();
        assert!(second.uptime_s >= first.uptime_s);
        assert!(second.peak_memory >= second.memory_usage.min(first.memory_usage));
    }

    #[test]
    fn metric_record_serializes_flat() {
        let mut tags = BTreeMap::new();
        tags.insert("endpoint".to_string(), "10.0.0.1:5027".to_string());
        let record = MetricRecord {
            metric_name: "requests_total".to_string(),
            value: 42.0,
            tags,
            timestamp: 1_700_000_000,
            instance_id: "i-1".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["metric_name"], "requests_total");
        assert_eq!(json["tags"]["endpoint"], "10.0.0.1:5027");
    }

    #[tokio::test]
    async fn disabled_publisher_is_a_noop() {
        let publisher = MetricsPublisher::new(
            None,
            false,
            InstanceId::new(),
            &RedisConfig::default(),
        );
        let snapshot = PoolSnapshot {
            size: 0,
            max_size: 10,
            keys: Vec::new(),
        };
        let sample = ProcessSample {
            uptime_s: 1,
            memory_usage: 0,
            peak_memory: 0,
        };
        // Must not panic or block without a cache.
        publisher.publish_snapshot(&snapshot, &sample).await;
        publisher.push_record("noop", 1.0, BTreeMap::new()).await;
    }
}
