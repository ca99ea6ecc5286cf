//! Adaptive metric baselines.
//!
//! Each `(metric_name, metric_context)` pair carries an exponential moving
//! average. The first sample is stored as-is; later samples move the average by
//! `ema_weight`. Deviation tests only become meaningful once `min_samples`
//! observations exist.

pub mod snapshot;

pub use snapshot::{Diff, MetricDelta, Snapshot, SnapshotCache};

use crate::bus::{Component, EventBus, EventHandler};
use crate::clock::Clock;
use crate::config::BaselineConfig;
use crate::error::{HandlerResult, WardenResult};
use crate::event::{EventType, MonitoringEvent, Priority};
use crate::governor::SystemProbe;
use crate::store::{Baseline, BaselineKey, MonitorStore};
use log::{debug, error};
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use std::sync::Arc;

pub const COMPONENT_NAME: &str = "baseline_engine";

/// Payload fields recorded from performance events.
const RECORDED_FIELDS: [&str; 3] = ["memory_usage", "cpu_usage", "execution_time"];

/// Runs after the conflict detector so deviations are judged against the
/// baseline before the new sample moves it.
const HANDLER_PRIORITY: Priority = Priority::new(60);

/// Relative deviation test. A zero baseline deviates for any positive value.
pub fn deviates(baseline: &Baseline, value: f64, threshold: f64, min_samples: u64) -> bool {
    if baseline.sample_count < min_samples {
        return false;
    }
    if baseline.value == 0.0 {
        return value > 0.0;
    }
    ((value - baseline.value) / baseline.value).abs() > threshold
}

#[derive(Debug)]
struct EngineInner {
    store: Arc<dyn MonitorStore>,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn SystemProbe>,
    config: RwLock<BaselineConfig>,
    snapshots: Arc<SnapshotCache>,
}

#[derive(Debug, Clone)]
pub struct BaselineEngine {
    inner: Arc<EngineInner>,
}

impl BaselineEngine {
    pub fn new(
        config: BaselineConfig,
        store: Arc<dyn MonitorStore>,
        probe: Arc<dyn SystemProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let snapshots = Arc::new(SnapshotCache::new(config.snapshot_ttl_secs, clock.clone()));
        Self {
            inner: Arc::new(EngineInner {
                store,
                clock,
                probe,
                config: RwLock::new(config),
                snapshots,
            }),
        }
    }

    pub fn config(&self) -> BaselineConfig {
        self.inner.config.read().clone()
    }

    /// The snapshot cache, for registration as a reclaimer.
    pub fn snapshots(&self) -> Arc<SnapshotCache> {
        self.inner.snapshots.clone()
    }

    /// Records a sample with the configured EMA weight.
    pub fn record_metric(
        &self,
        metric_name: &str,
        metric_context: &str,
        value: f64,
        metadata: Option<Map<String, Value>>,
    ) -> WardenResult<Baseline> {
        let weight = self.inner.config.read().ema_weight;
        self.record_metric_weighted(metric_name, metric_context, value, metadata, weight)
    }

    /// Records a sample with an explicit EMA weight for callers that want a
    /// faster- or slower-moving average than the configured one.
    pub fn record_metric_weighted(
        &self,
        metric_name: &str,
        metric_context: &str,
        value: f64,
        metadata: Option<Map<String, Value>>,
        weight: f64,
    ) -> WardenResult<Baseline> {
        let key = BaselineKey::new(metric_name, metric_context);
        let now = self.inner.clock.now();
        let weight = weight.clamp(0.0, 1.0);
        let metadata = metadata.unwrap_or_default();

        let mut update = |current: Option<&Baseline>| match current {
            None => Baseline {
                metric_name: key.metric_name.clone(),
                metric_context: key.metric_context.clone(),
                value,
                sample_count: 1,
                last_updated: now,
                metadata: metadata.clone(),
            },
            Some(existing) => {
                let mut merged = existing.metadata.clone();
                for (k, v) in &metadata {
                    merged.insert(k.clone(), v.clone());
                }
                Baseline {
                    value: existing.value * (1.0 - weight) + value * weight,
                    sample_count: existing.sample_count + 1,
                    last_updated: now,
                    metadata: merged,
                    ..existing.clone()
                }
            }
        };
        let baseline = self.inner.store.update_baseline(&key, &mut update)?;

        debug!(
            "Baseline updated: metric={}, context={}, value={:.3}, samples={}",
            baseline.metric_name, baseline.metric_context, baseline.value, baseline.sample_count
        );
        Ok(baseline)
    }

    pub fn get_baseline(
        &self,
        metric_name: &str,
        metric_context: &str,
    ) -> WardenResult<Option<Baseline>> {
        self.inner
            .store
            .get_baseline(&BaselineKey::new(metric_name, metric_context))
    }

    /// Whether `value` deviates from the baseline by more than `threshold`
    /// (a fraction, 0.5 meaning 50%). Unknown baselines and store failures
    /// never deviate.
    pub fn is_significant_deviation(
        &self,
        metric_name: &str,
        metric_context: &str,
        value: f64,
        threshold: f64,
    ) -> bool {
        let min_samples = self.inner.config.read().min_samples;
        match self.get_baseline(metric_name, metric_context) {
            Ok(Some(baseline)) => deviates(&baseline, value, threshold, min_samples),
            Ok(None) => false,
            Err(e) => {
                error!(
                    "Failed to read baseline: metric={}, context={}, error={}",
                    metric_name, metric_context, e
                );
                false
            }
        }
    }

    /// Captures the current system metrics under `label`.
    pub fn snapshot(&self, label: &str) -> Snapshot {
        let snapshot = Snapshot::capture(label, self.inner.probe.as_ref(), self.inner.clock.now());
        self.inner.snapshots.insert(snapshot.clone());
        snapshot
    }

    pub fn snapshot_before(&self, plugin: &str) -> Snapshot {
        self.snapshot(&format!("before_{}", plugin))
    }

    pub fn snapshot_after(&self, plugin: &str) -> Snapshot {
        self.snapshot(&format!("after_{}", plugin))
    }

    pub fn get_snapshot(&self, label: &str) -> Option<Snapshot> {
        self.inner.snapshots.get(label)
    }

    /// Significant changes between two cached snapshots. A missing or expired
    /// snapshot on either side gives an empty diff.
    pub fn diff(&self, before_label: &str, after_label: &str) -> Diff {
        match (
            self.inner.snapshots.get(before_label),
            self.inner.snapshots.get(after_label),
        ) {
            (Some(before), Some(after)) => Diff::between(&before, &after),
            _ => Diff::default(),
        }
    }

    fn record_event(&self, event: &MonitoringEvent) -> HandlerResult {
        let mut recorded = false;
        for field in RECORDED_FIELDS {
            if let Some(value) = event.data_f64(field) {
                let mut metadata = Map::new();
                metadata.insert("source".to_string(), json!(event.source()));
                self.record_metric(field, event.context(), value, Some(metadata))?;
                recorded = true;
            }
        }
        Ok(recorded)
    }
}

impl EventHandler for BaselineEngine {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    fn priority(&self) -> Priority {
        HANDLER_PRIORITY
    }

    fn handled_types(&self) -> Vec<EventType> {
        vec![EventType::Performance]
    }

    fn can_handle(&self, event: &MonitoringEvent) -> bool {
        RECORDED_FIELDS
            .iter()
            .any(|field| event.data().contains_key(*field))
    }

    fn handle(&self, event: &MonitoringEvent, bus: &EventBus) -> HandlerResult {
        self.process_event(event, bus)
    }
}

impl Component for BaselineEngine {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    fn init(&self) -> WardenResult<()> {
        Ok(())
    }

    fn register_handlers(&self, bus: &EventBus) {
        bus.register_handler(Arc::new(self.clone()));
    }

    fn process_event(&self, event: &MonitoringEvent, _bus: &EventBus) -> HandlerResult {
        match event.event_type() {
            EventType::Performance => self.record_event(event),
            _ => Ok(false),
        }
    }

    fn get_status(&self) -> Value {
        let baselines = self.inner.store.baselines().map(|b| b.len()).unwrap_or(0);
        json!({
            "baselines": baselines,
            "snapshots": self.inner.snapshots.len(),
        })
    }

    fn get_config(&self) -> Value {
        serde_json::to_value(self.config()).unwrap_or(Value::Null)
    }

    fn update_config(&self, config: Value) -> WardenResult<()> {
        let config: BaselineConfig = serde_json::from_value(config)?;
        self.inner.snapshots.set_ttl(config.snapshot_ttl_secs);
        *self.inner.config.write() = config;
        Ok(())
    }
}
