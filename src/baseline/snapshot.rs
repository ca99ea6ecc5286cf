//! Point-in-time metric snapshots and their significance-gated diff.

use crate::clock::Clock;
use crate::governor::{Reclaimer, SystemProbe};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Percent change above which a memory metric is reported.
pub const MEMORY_SIGNIFICANCE_PERCENT: f64 = 20.0;
/// Percent change above which CPU load is reported.
pub const CPU_SIGNIFICANCE_PERCENT: f64 = 30.0;
/// Absolute query-count change above which db queries are reported.
pub const DB_QUERY_SIGNIFICANCE: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub name: String,
    pub memory_usage: u64,
    pub memory_peak: u64,
    pub cpu_load: f64,
    pub db_queries: u64,
    pub active_plugins: Vec<String>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn capture(name: impl Into<String>, probe: &dyn SystemProbe, now: DateTime<Utc>) -> Self {
        let mut active_plugins = probe.active_components();
        active_plugins.sort();
        Self {
            name: name.into(),
            memory_usage: probe.memory_usage(),
            memory_peak: probe.memory_peak(),
            cpu_load: probe.cpu_load(),
            db_queries: probe.db_queries(),
            active_plugins,
            taken_at: now,
        }
    }

    fn approximate_size(&self) -> u64 {
        let strings: usize = self.name.len() + self.active_plugins.iter().map(String::len).sum::<usize>();
        (std::mem::size_of::<Self>() + strings) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDelta {
    pub before: f64,
    pub after: f64,
    pub delta: f64,
    pub delta_percent: f64,
}

impl MetricDelta {
    pub fn new(before: f64, after: f64) -> Self {
        let delta = after - before;
        let delta_percent = if before == 0.0 {
            if after > 0.0 { 100.0 } else { 0.0 }
        } else {
            delta / before * 100.0
        };
        Self {
            before,
            after,
            delta,
            delta_percent,
        }
    }
}

/// Metrics that moved significantly between two snapshots, keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diff {
    pub metrics: BTreeMap<String, MetricDelta>,
}

impl Diff {
    pub fn between(before: &Snapshot, after: &Snapshot) -> Self {
        let mut metrics = BTreeMap::new();

        let memory = [
            ("memory_usage", before.memory_usage, after.memory_usage),
            ("memory_peak", before.memory_peak, after.memory_peak),
        ];
        for (name, b, a) in memory {
            let delta = MetricDelta::new(b as f64, a as f64);
            if delta.delta_percent.abs() > MEMORY_SIGNIFICANCE_PERCENT {
                metrics.insert(name.to_string(), delta);
            }
        }

        let cpu = MetricDelta::new(before.cpu_load, after.cpu_load);
        if cpu.delta_percent.abs() > CPU_SIGNIFICANCE_PERCENT {
            metrics.insert("cpu_load".to_string(), cpu);
        }

        let queries = MetricDelta::new(before.db_queries as f64, after.db_queries as f64);
        if queries.delta.abs() > DB_QUERY_SIGNIFICANCE {
            metrics.insert("db_queries".to_string(), queries);
        }

        Self { metrics }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn get(&self, metric: &str) -> Option<&MetricDelta> {
        self.metrics.get(metric)
    }
}

/// Label-keyed snapshot store whose entries expire after a TTL.
#[derive(Debug)]
pub struct SnapshotCache {
    entries: RwLock<HashMap<String, Snapshot>>,
    ttl_secs: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl SnapshotCache {
    pub fn new(ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl_secs: AtomicI64::new(ttl_secs as i64),
            clock,
        }
    }

    pub fn set_ttl(&self, ttl_secs: u64) {
        self.ttl_secs.store(ttl_secs as i64, Ordering::SeqCst);
    }

    fn is_expired(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> bool {
        now - snapshot.taken_at > Duration::seconds(self.ttl_secs.load(Ordering::SeqCst))
    }

    pub fn insert(&self, snapshot: Snapshot) {
        self.entries
            .write()
            .insert(snapshot.name.clone(), snapshot);
    }

    /// The snapshot under `label`, unless missing or expired.
    pub fn get(&self, label: &str) -> Option<Snapshot> {
        let now = self.clock.now();
        self.entries
            .read()
            .get(label)
            .filter(|s| !self.is_expired(s, now))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops expired entries, returning how many were removed and their approximate size.
    pub fn expire(&self) -> (usize, u64) {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let mut removed = 0;
        let mut bytes = 0;
        entries.retain(|_, snapshot| {
            if self.is_expired(snapshot, now) {
                removed += 1;
                bytes += snapshot.approximate_size();
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!("Expired snapshots: count={}, bytes={}", removed, bytes);
        }
        (removed, bytes)
    }
}

impl Reclaimer for SnapshotCache {
    fn name(&self) -> &str {
        "snapshot_cache"
    }

    fn reclaim(&self) -> u64 {
        self.expire().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn snapshot(name: &str, memory: u64, cpu: f64, queries: u64) -> Snapshot {
        Snapshot {
            name: name.to_string(),
            memory_usage: memory,
            memory_peak: memory,
            cpu_load: cpu,
            db_queries: queries,
            active_plugins: Vec::new(),
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn test_memory_growth_below_threshold_is_ignored() {
        let diff = Diff::between(
            &snapshot("before", 1000, 0.5, 10),
            &snapshot("after", 1100, 0.5, 10),
        );
        assert!(diff.is_empty());
    }

    #[test]
    fn test_memory_growth_above_threshold_is_reported() {
        let diff = Diff::between(
            &snapshot("before", 1000, 0.5, 10),
            &snapshot("after", 1250, 0.5, 10),
        );
        let memory = diff.get("memory_usage").unwrap();
        assert_eq!(memory.before, 1000.0);
        assert_eq!(memory.after, 1250.0);
        assert_eq!(memory.delta, 250.0);
        assert!((memory.delta_percent - 25.0).abs() < 1e-9);
        assert!(diff.get("cpu_load").is_none());
    }

    #[test]
    fn test_cpu_and_query_thresholds() {
        let diff = Diff::between(
            &snapshot("before", 1000, 0.5, 10),
            &snapshot("after", 1000, 0.7, 61),
        );
        assert!(diff.get("cpu_load").is_some());
        assert_eq!(diff.get("db_queries").unwrap().delta, 51.0);

        let quiet = Diff::between(
            &snapshot("before", 1000, 0.5, 10),
            &snapshot("after", 1000, 0.6, 60),
        );
        assert!(quiet.is_empty());
    }

    #[test]
    fn test_zero_before_counts_as_full_increase() {
        assert_eq!(MetricDelta::new(0.0, 5.0).delta_percent, 100.0);
        assert_eq!(MetricDelta::new(0.0, 0.0).delta_percent, 0.0);
    }

    #[test]
    fn test_cache_expiry() {
        let clock = Arc::new(ManualClock::default());
        let cache = SnapshotCache::new(3600, clock.clone());
        let mut entry = snapshot("before_seo", 1, 0.0, 0);
        entry.taken_at = clock.now();
        cache.insert(entry);
        assert!(cache.get("before_seo").is_some());

        clock.advance(Duration::seconds(3601));
        assert!(cache.get("before_seo").is_none());
        assert_eq!(cache.len(), 1);
        assert!(cache.reclaim() > 0);
        assert!(cache.is_empty());
    }
}
