//! Self-monitoring and retention.

use crate::baseline::SnapshotCache;
use crate::bus::{Component, EventBus, EventHandler};
use crate::clock::Clock;
use crate::config::RetentionConfig;
use crate::error::{HandlerResult, WardenResult};
use crate::event::{EventType, MonitoringEvent, Priority};
use crate::store::MonitorStore;
use chrono::Duration;
use log::{error, info};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const COMPONENT_NAME: &str = "self_monitor";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub events_purged: usize,
    pub task_runs_purged: usize,
    pub snapshots_expired: usize,
}

#[derive(Debug)]
struct MonitorInner {
    store: Arc<dyn MonitorStore>,
    clock: Arc<dyn Clock>,
    snapshots: Arc<SnapshotCache>,
    retention: RwLock<RetentionConfig>,
    counts: Mutex<BTreeMap<EventType, u64>>,
}

/// Sees every event last and keeps per-type counters.
#[derive(Debug, Clone)]
pub struct SelfMonitor {
    inner: Arc<MonitorInner>,
}

impl SelfMonitor {
    pub fn new(
        retention: RetentionConfig,
        store: Arc<dyn MonitorStore>,
        snapshots: Arc<SnapshotCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                store,
                clock,
                snapshots,
                retention: RwLock::new(retention),
                counts: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn counts(&self) -> BTreeMap<EventType, u64> {
        self.inner.counts.lock().clone()
    }

    pub fn count(&self, event_type: EventType) -> u64 {
        self.inner
            .counts
            .lock()
            .get(&event_type)
            .copied()
            .unwrap_or(0)
    }

    /// Deletes events and finished task runs past their retention and drops
    /// expired snapshots.
    pub fn cleanup(&self) -> WardenResult<CleanupReport> {
        let retention = self.inner.retention.read().clone();
        let now = self.inner.clock.now();

        let events_purged = self
            .inner
            .store
            .purge_events_before(now - Duration::days(retention.event_days))?;
        let task_runs_purged = self
            .inner
            .store
            .purge_task_runs_before(now - Duration::days(retention.task_run_days))?;
        let (snapshots_expired, _) = self.inner.snapshots.expire();

        let report = CleanupReport {
            events_purged,
            task_runs_purged,
            snapshots_expired,
        };
        info!(
            "Cleanup finished: events={}, task_runs={}, snapshots={}",
            report.events_purged, report.task_runs_purged, report.snapshots_expired
        );
        Ok(report)
    }
}

impl EventHandler for SelfMonitor {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    fn priority(&self) -> Priority {
        Priority::LOW
    }

    fn handled_types(&self) -> Vec<EventType> {
        EventType::ALL.to_vec()
    }

    fn handle(&self, event: &MonitoringEvent, bus: &EventBus) -> HandlerResult {
        self.process_event(event, bus)
    }
}

impl Component for SelfMonitor {
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
        *self
            .inner
            .counts
            .lock()
            .entry(event.event_type())
            .or_insert(0) += 1;
        if event.event_type() == EventType::Critical {
            error!(
                "Critical event: source={}, context={}, message={}",
                event.source(),
                event.context(),
                event.message()
            );
        }
        // Counting alone does not make an event handled.
        Ok(false)
    }

    fn get_status(&self) -> Value {
        let counts: BTreeMap<String, u64> = self
            .counts()
            .into_iter()
            .map(|(event_type, count)| (event_type.to_string(), count))
            .collect();
        json!({ "event_counts": counts })
    }

    fn get_config(&self) -> Value {
        serde_json::to_value(self.inner.retention.read().clone()).unwrap_or(Value::Null)
    }

    fn update_config(&self, config: Value) -> WardenResult<()> {
        *self.inner.retention.write() = serde_json::from_value(config)?;
        Ok(())
    }
}
