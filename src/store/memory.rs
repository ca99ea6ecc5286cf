//! In-process implementation of [`MonitorStore`].

use super::{
    Baseline, BaselineKey, EventQuery, MonitorStore, ScheduledTask, TaskRun, TaskRunQuery,
};
use crate::error::WardenResult;
use crate::event::{EventType, MonitoringEvent};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredEvent {
    seq: u64,
    event: MonitoringEvent,
}

#[derive(Debug, Default)]
struct EventTable {
    rows: Vec<StoredEvent>,
    next_seq: u64,
}

/// Everything except the event log, in a form that serialises cleanly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub baselines: Vec<Baseline>,
    pub task_runs: Vec<TaskRun>,
    pub recovery_attempts: BTreeMap<String, u32>,
    pub scheduled: Vec<ScheduledTask>,
}

#[derive(Debug, Default)]
struct StateTables {
    baselines: HashMap<BaselineKey, Baseline>,
    task_runs: HashMap<Uuid, TaskRun>,
    recovery_attempts: BTreeMap<String, u32>,
    scheduled: Vec<ScheduledTask>,
}

/// A store whose tables live behind `parking_lot` locks.
///
/// ```
/// use warden::store::{BaselineKey, MemoryStore, MonitorStore};
///
/// let store = MemoryStore::new();
/// let key = BaselineKey::new("task_duration", "import");
/// assert!(store.get_baseline(&key).unwrap().is_none());
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: RwLock<EventTable>,
    state: RwLock<StateTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from a persisted event log and state.
    pub fn from_parts(events: Vec<MonitoringEvent>, state: StoreState) -> Self {
        let store = Self::new();
        {
            let mut table = store.events.write();
            for event in events {
                let seq = table.next_seq;
                table.next_seq += 1;
                table.rows.push(StoredEvent { seq, event });
            }
        }
        {
            let mut tables = store.state.write();
            tables.baselines = state
                .baselines
                .into_iter()
                .map(|baseline| (baseline.key(), baseline))
                .collect();
            tables.task_runs = state
                .task_runs
                .into_iter()
                .map(|run| (run.id, run))
                .collect();
            tables.recovery_attempts = state.recovery_attempts;
            tables.scheduled = state.scheduled;
        }
        store
    }

    pub fn export_state(&self) -> StoreState {
        let tables = self.state.read();
        let mut baselines: Vec<Baseline> = tables.baselines.values().cloned().collect();
        baselines.sort_by(|a, b| a.key().cmp(&b.key()));
        let mut task_runs: Vec<TaskRun> = tables.task_runs.values().cloned().collect();
        task_runs.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        StoreState {
            baselines,
            task_runs,
            recovery_attempts: tables.recovery_attempts.clone(),
            scheduled: tables.scheduled.clone(),
        }
    }

    /// Events in insertion order.
    pub fn export_events(&self) -> Vec<MonitoringEvent> {
        self.events
            .read()
            .rows
            .iter()
            .map(|row| row.event.clone())
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().rows.len()
    }
}

impl MonitorStore for MemoryStore {
    fn insert_event(&self, event: &MonitoringEvent) -> WardenResult<()> {
        let mut table = self.events.write();
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.push(StoredEvent {
            seq,
            event: event.clone(),
        });
        Ok(())
    }

    fn get_events(&self, query: &EventQuery) -> WardenResult<Vec<MonitoringEvent>> {
        let table = self.events.read();
        let mut rows: Vec<&StoredEvent> = table
            .rows
            .iter()
            .filter(|row| query.matches(&row.event))
            .collect();
        rows.sort_by(|a, b| {
            b.event
                .timestamp()
                .cmp(&a.event.timestamp())
                .then(b.seq.cmp(&a.seq))
        });
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|row| row.event.clone())
            .collect())
    }

    fn count_events_since(&self, since: DateTime<Utc>) -> WardenResult<u64> {
        Ok(self
            .events
            .read()
            .rows
            .iter()
            .filter(|row| row.event.timestamp() >= since)
            .count() as u64)
    }

    fn event_counts(&self, since: Option<DateTime<Utc>>) -> WardenResult<HashMap<EventType, u64>> {
        let mut counts = HashMap::new();
        for row in self.events.read().rows.iter() {
            if since.is_none_or(|since| row.event.timestamp() >= since) {
                *counts.entry(row.event.event_type()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    fn purge_events_before(&self, cutoff: DateTime<Utc>) -> WardenResult<usize> {
        let mut table = self.events.write();
        let before = table.rows.len();
        table.rows.retain(|row| row.event.timestamp() >= cutoff);
        Ok(before - table.rows.len())
    }

    fn get_baseline(&self, key: &BaselineKey) -> WardenResult<Option<Baseline>> {
        Ok(self.state.read().baselines.get(key).cloned())
    }

    fn update_baseline(
        &self,
        key: &BaselineKey,
        update: &mut dyn FnMut(Option<&Baseline>) -> Baseline,
    ) -> WardenResult<Baseline> {
        let mut tables = self.state.write();
        let updated = update(tables.baselines.get(key));
        tables.baselines.insert(key.clone(), updated.clone());
        Ok(updated)
    }

    fn baselines(&self) -> WardenResult<Vec<Baseline>> {
        Ok(self.export_state().baselines)
    }

    fn save_task_run(&self, run: &TaskRun) -> WardenResult<()> {
        self.state.write().task_runs.insert(run.id, run.clone());
        Ok(())
    }

    fn get_task_run(&self, id: Uuid) -> WardenResult<Option<TaskRun>> {
        Ok(self.state.read().task_runs.get(&id).cloned())
    }

    fn task_runs(&self, query: &TaskRunQuery) -> WardenResult<Vec<TaskRun>> {
        let tables = self.state.read();
        let mut runs: Vec<TaskRun> = tables
            .task_runs
            .values()
            .filter(|run| query.matches(run))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        if let Some(limit) = query.limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    fn purge_task_runs_before(&self, cutoff: DateTime<Utc>) -> WardenResult<usize> {
        let mut tables = self.state.write();
        let before = tables.task_runs.len();
        tables
            .task_runs
            .retain(|_, run| run.end_time.is_none() || run.start_time >= cutoff);
        Ok(before - tables.task_runs.len())
    }

    fn recovery_attempts(&self, task_name: &str) -> WardenResult<u32> {
        Ok(self
            .state
            .read()
            .recovery_attempts
            .get(task_name)
            .copied()
            .unwrap_or(0))
    }

    fn increment_recovery_attempts(&self, task_name: &str) -> WardenResult<u32> {
        let mut tables = self.state.write();
        let counter = tables
            .recovery_attempts
            .entry(task_name.to_string())
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    fn reset_recovery_attempts(&self, task_name: &str) -> WardenResult<()> {
        self.state.write().recovery_attempts.remove(task_name);
        Ok(())
    }

    fn schedule_task(&self, task: ScheduledTask) -> WardenResult<()> {
        self.state.write().scheduled.push(task);
        Ok(())
    }

    fn take_due_tasks(&self, now: DateTime<Utc>) -> WardenResult<Vec<ScheduledTask>> {
        let mut tables = self.state.write();
        let (due, pending): (Vec<_>, Vec<_>) = tables
            .scheduled
            .drain(..)
            .partition(|task| task.run_at <= now);
        tables.scheduled = pending;
        Ok(due)
    }

    fn scheduled_tasks(&self) -> WardenResult<Vec<ScheduledTask>> {
        Ok(self.state.read().scheduled.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventData;
    use crate::governor::Tier;
    use chrono::Duration;

    fn event_at(event_type: EventType, at: DateTime<Utc>) -> MonitoringEvent {
        MonitoringEvent::at(event_type, "tests", "unit", "m", EventData::new(), 50, at)
    }

    #[test]
    fn test_get_events_is_newest_first_with_stable_ties() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = event_at(EventType::Info, now);
        let second = event_at(EventType::Info, now);
        let older = event_at(EventType::Info, now - Duration::seconds(10));
        store.insert_event(&first).unwrap();
        store.insert_event(&older).unwrap();
        store.insert_event(&second).unwrap();

        let events = store.get_events(&EventQuery::new()).unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![second.id(), first.id(), older.id()]);

        let page = store.get_events(&EventQuery::new().page(1, 1)).unwrap();
        assert_eq!(page[0].id(), first.id());
    }

    #[test]
    fn test_event_counts_and_purge() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_event(&event_at(EventType::Error, now)).unwrap();
        store.insert_event(&event_at(EventType::Error, now)).unwrap();
        store
            .insert_event(&event_at(EventType::Info, now - Duration::days(40)))
            .unwrap();

        let counts = store.event_counts(None).unwrap();
        assert_eq!(counts.get(&EventType::Error), Some(&2));
        assert_eq!(counts.get(&EventType::Info), Some(&1));
        assert_eq!(store.count_events_since(now - Duration::seconds(60)).unwrap(), 2);

        assert_eq!(store.purge_events_before(now - Duration::days(30)).unwrap(), 1);
        assert_eq!(store.event_count(), 2);
    }

    #[test]
    fn test_update_baseline_sees_previous_row() {
        let store = MemoryStore::new();
        let key = BaselineKey::new("m", "c");
        for expected in 1..=3u64 {
            let row = store
                .update_baseline(&key, &mut |old| Baseline {
                    metric_name: "m".to_string(),
                    metric_context: "c".to_string(),
                    value: 1.0,
                    sample_count: old.map_or(1, |b| b.sample_count + 1),
                    last_updated: Utc::now(),
                    metadata: Default::default(),
                })
                .unwrap();
            assert_eq!(row.sample_count, expected);
        }
    }

    #[test]
    fn test_recovery_counters_and_schedule() {
        let store = MemoryStore::new();
        assert_eq!(store.increment_recovery_attempts("import").unwrap(), 1);
        assert_eq!(store.increment_recovery_attempts("import").unwrap(), 2);
        store.reset_recovery_attempts("import").unwrap();
        assert_eq!(store.recovery_attempts("import").unwrap(), 0);

        let now = Utc::now();
        for (name, offset) in [("due", -1), ("later", 60)] {
            store
                .schedule_task(ScheduledTask {
                    task_name: name.to_string(),
                    run_at: now + Duration::seconds(offset),
                    attempt: 1,
                    reason: "test".to_string(),
                })
                .unwrap();
        }
        let due = store.take_due_tasks(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task_name, "due");
        assert_eq!(store.scheduled_tasks().unwrap().len(), 1);
    }

    #[test]
    fn test_state_round_trip() {
        let store = MemoryStore::new();
        let run = TaskRun::start("import", Tier::Report, Utc::now(), 10);
        store.save_task_run(&run).unwrap();
        store.increment_recovery_attempts("import").unwrap();

        let restored = MemoryStore::from_parts(store.export_events(), store.export_state());
        assert_eq!(restored.get_task_run(run.id).unwrap(), Some(run));
        assert_eq!(restored.recovery_attempts("import").unwrap(), 1);
    }
}
