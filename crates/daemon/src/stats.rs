//! Per-endpoint request counters.
//!
//! Only the dispatcher mutates these. `total` is maintained alongside
//! the outcome counters so `total = success + failed` holds after every
//! recorded request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use sockpool_common::{EndpointKey, EndpointStats};

#[derive(Default)]
struct EndpointCounters {
    success: AtomicU64,
    failed: AtomicU64,
    total: AtomicU64,
}

/// Concurrent table of per-endpoint counters.
#[derive(Default)]
pub struct StatsTable {
    inner: DashMap<EndpointKey, EndpointCounters>,
}

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, key: &EndpointKey) {
        let counters = self.inner.entry(key.clone()).or_default();
        counters.success.fetch_add(1, Ordering::Relaxed);
        counters.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, key: &EndpointKey) {
        let counters = self.inner.entry(key.clone()).or_default();
        counters.failed.fetch_add(1, Ordering::Relaxed);
        counters.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, key: &EndpointKey) -> EndpointStats {
        self.inner
            .get(key)
            .map(|counters| EndpointStats {
                success: counters.success.load(Ordering::Relaxed),
                failed: counters.failed.load(Ordering::Relaxed),
                total: counters.total.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    /// Ordered snapshot keyed by canonical endpoint, for `get_stats`.
    pub fn snapshot(&self) -> BTreeMap<String, EndpointStats> {
        self.inner
            .iter()
            .map(|entry| {
                (
                    entry.key().canonical(),
                    EndpointStats {
                        success: entry.success.load(Ordering::Relaxed),
                        failed: entry.failed.load(Ordering::Relaxed),
                        total: entry.total.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_endpoint() {
        let stats = StatsTable::new();
        let a = EndpointKey::new("a", 1);
        let b = EndpointKey::new("b", 2);

        stats.record_success(&a);
        stats.record_success(&a);
        stats.record_failure(&a);
        stats.record_failure(&b);

        assert_eq!(
            stats.get(&a),
            EndpointStats {
                success: 2,
                failed: 1,
                total: 3
            }
        );
        assert_eq!(
            stats.get(&b),
            EndpointStats {
                success: 0,
                failed: 1,
                total: 1
            }
        );
        // Untouched endpoints read as zero.
        assert_eq!(stats.get(&EndpointKey::new("c", 3)), EndpointStats::default());
    }

    #[test]
    fn total_equals_success_plus_failed() {
        let stats = StatsTable::new();
        let key = EndpointKey::new("a", 1);
        for i in 0..100 {
            if i % 3 == 0 {
                stats.record_failure(&key);
            } else {
                stats.record_success(&key);
            }
            let s = stats.get(&key);
            assert_eq!(s.total, s.success + s.failed);
        }
    }

    #[test]
    fn snapshot_is_keyed_canonically() {
        let stats = StatsTable::new();
        stats.record_success(&EndpointKey::new("10.0.0.2", 5027));
        stats.record_failure(&EndpointKey::new("10.0.0.1", 5027));

        let snapshot = stats.snapshot();
        let keys: Vec<&String> = snapshot.keys().collect();
        assert_eq!(keys, ["10.0.0.1:5027", "10.0.0.2:5027"]);
    }
}
