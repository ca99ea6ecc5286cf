//! Task-runner side of the monitoring core.
//!
//! A background task brackets its work with [`TaskTracker::start_task`] and
//! [`TaskTracker::end_task`], polling [`TaskTracker::should_continue`] in between.
//! Ending a task persists its run, feeds the duration and memory baselines and
//! reports the outcome on the bus.

use crate::baseline::BaselineEngine;
use crate::bus::EventBus;
use crate::error::WardenResult;
use crate::event::{EventData, EventType, Priority};
use crate::governor::{ResourceGovernor, SystemProbe, Tier};
use crate::store::{MonitorStore, TaskRun, TaskStatus};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;

pub const SOURCE: &str = "task_tracker";

/// An in-flight task run.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    run: TaskRun,
    queries_start: u64,
}

impl TaskHandle {
    pub fn run(&self) -> &TaskRun {
        &self.run
    }

    pub fn task_name(&self) -> &str {
        &self.run.task_name
    }

    pub fn tier(&self) -> Tier {
        self.run.tier
    }
}

#[derive(Debug, Clone)]
pub struct TaskTracker {
    bus: Arc<EventBus>,
    governor: ResourceGovernor,
    baseline: BaselineEngine,
    probe: Arc<dyn SystemProbe>,
}

impl TaskTracker {
    pub fn new(
        bus: Arc<EventBus>,
        governor: ResourceGovernor,
        baseline: BaselineEngine,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        Self {
            bus,
            governor,
            baseline,
            probe,
        }
    }

    pub fn start_task(&self, task_name: &str, tier: Tier) -> WardenResult<TaskHandle> {
        let run = TaskRun::start(task_name, tier, self.bus.now(), self.probe.memory_usage());
        self.bus.store().save_task_run(&run)?;
        debug!(
            "Task started: task={}, tier={}, run_id={}",
            task_name, tier, run.id
        );
        Ok(TaskHandle {
            run,
            queries_start: self.probe.db_queries(),
        })
    }

    /// Whether the task is still inside its tier budget and the system is not
    /// overloaded. Tasks are expected to poll this and stop on `false`.
    pub fn should_continue(&self, handle: &TaskHandle) -> bool {
        let queries = self.probe.db_queries().saturating_sub(handle.queries_start);
        self.governor.should_continue(
            handle.run.tier,
            handle.run.start_time,
            handle.run.memory_start,
            queries,
        )
    }

    /// Finalises the run and returns it as stored.
    pub fn end_task(
        &self,
        handle: TaskHandle,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> WardenResult<TaskRun> {
        let now = self.bus.now();
        let memory_now = self.probe.memory_usage();
        let mut run = handle.run;
        let duration = (now - run.start_time).num_milliseconds().max(0) as f64 / 1000.0;
        let memory_used = memory_now.saturating_sub(run.memory_start);

        run.end_time = Some(now);
        run.duration = Some(duration);
        run.memory_peak = Some(self.probe.memory_peak().max(memory_now));
        run.status = status;
        run.error_message = error_message;
        run.metadata.insert(
            "db_queries".to_string(),
            json!(self.probe.db_queries().saturating_sub(handle.queries_start)),
        );
        self.bus.store().save_task_run(&run)?;

        // Reported before the baselines move so deviations are judged against
        // the previous average.
        self.report(&run, memory_now, memory_used);

        if matches!(status, TaskStatus::Completed | TaskStatus::Partial) {
            let mut metadata = EventData::new();
            metadata.insert("tier".to_string(), json!(run.tier.as_str()));
            self.baseline.record_metric(
                "task_duration",
                &run.task_name,
                duration,
                Some(metadata.clone()),
            )?;
            self.baseline.record_metric(
                "task_memory_usage",
                &run.task_name,
                memory_used as f64,
                Some(metadata),
            )?;
        }

        if status == TaskStatus::Completed {
            self.bus.store().reset_recovery_attempts(&run.task_name)?;
        }

        if self.governor.should_trigger_gc_after_task(&run.task_name) {
            let forced = self.governor.is_forced_gc_task(&run.task_name);
            self.governor.trigger_gc(forced);
        }

        info!(
            "Task ended: task={}, status={}, duration={:.3}s, memory={} bytes",
            run.task_name,
            status.as_str(),
            duration,
            memory_used
        );
        Ok(run)
    }

    /// Runs `work` between `start_task` and `end_task`. The closure reports the
    /// final status or a failure message.
    pub fn run_task<F>(&self, task_name: &str, tier: Tier, work: F) -> WardenResult<TaskRun>
    where
        F: FnOnce(&TaskHandle, &TaskTracker) -> Result<TaskStatus, String>,
    {
        let handle = self.start_task(task_name, tier)?;
        let (status, error) = match work(&handle, self) {
            Ok(status) => (status, None),
            Err(message) => (TaskStatus::Failed, Some(message)),
        };
        self.end_task(handle, status, error)
    }

    fn report(&self, run: &TaskRun, memory_now: u64, memory_used: u64) {
        let duration = run.duration.unwrap_or_default();
        let mut data = EventData::new();
        data.insert("run_id".to_string(), json!(run.id.to_string()));
        data.insert("tier".to_string(), json!(run.tier.as_str()));
        data.insert("status".to_string(), json!(run.status.as_str()));
        data.insert("metric_name".to_string(), json!("task_duration"));
        data.insert("metric_value".to_string(), json!(duration));
        data.insert("execution_time".to_string(), json!(duration));
        data.insert("memory_usage".to_string(), json!(memory_now));
        data.insert("task_memory_usage".to_string(), json!(memory_used));
        self.bus.emit(
            EventType::Performance,
            SOURCE,
            run.task_name.as_str(),
            format!("{} finished with status {}", run.task_name, run.status.as_str()),
            data,
            Priority::NORMAL.into(),
        );

        if matches!(run.status, TaskStatus::Failed | TaskStatus::Aborted) {
            let message = run
                .error_message
                .clone()
                .unwrap_or_else(|| format!("{} {}", run.task_name, run.status.as_str()));
            warn!("Task did not complete: task={}, error={}", run.task_name, message);
            let mut data = EventData::new();
            data.insert("run_id".to_string(), json!(run.id.to_string()));
            data.insert("status".to_string(), json!(run.status.as_str()));
            self.bus.emit(
                EventType::Error,
                SOURCE,
                run.task_name.as_str(),
                message,
                data,
                Priority::HIGH.into(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{BaselineConfig, BudgetConfig, BusConfig, GovernorConfig};
    use crate::governor::ManualProbe;
    use crate::store::{EventQuery, MemoryStore};
    use chrono::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        probe: Arc<ManualProbe>,
        store: Arc<MemoryStore>,
        tracker: TaskTracker,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let probe = Arc::new(ManualProbe::new());
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(BusConfig::default(), store.clone(), clock.clone()));
        let governor = ResourceGovernor::new(
            BudgetConfig::default(),
            GovernorConfig::default(),
            store.clone(),
            probe.clone(),
            clock.clone(),
        );
        let baseline = BaselineEngine::new(
            BaselineConfig::default(),
            store.clone(),
            probe.clone(),
            clock.clone(),
        );
        let tracker = TaskTracker::new(bus, governor, baseline, probe.clone());
        Fixture {
            clock,
            probe,
            store,
            tracker,
        }
    }

    #[test]
    fn test_completed_task_records_baselines_and_resets_attempts() {
        let f = fixture();
        f.store.increment_recovery_attempts("import").unwrap();
        f.probe.set_memory_usage(1000);
        let handle = f.tracker.start_task("import", Tier::Standard).unwrap();
        f.clock.advance(Duration::seconds(4));
        f.probe.set_memory_usage(1500);

        let run = f.tracker.end_task(handle, TaskStatus::Completed, None).unwrap();
        assert_eq!(run.duration, Some(4.0));
        assert_eq!(run.memory_peak, Some(1500));

        let duration = f
            .store
            .get_baseline(&crate::store::BaselineKey::new("task_duration", "import"))
            .unwrap()
            .unwrap();
        assert_eq!(duration.value, 4.0);
        let memory = f
            .store
            .get_baseline(&crate::store::BaselineKey::new("task_memory_usage", "import"))
            .unwrap()
            .unwrap();
        assert_eq!(memory.value, 500.0);
        assert_eq!(f.store.recovery_attempts("import").unwrap(), 0);

        let performance = f
            .store
            .get_events(&EventQuery::new().with_type(EventType::Performance))
            .unwrap();
        assert_eq!(performance.len(), 1);
        assert_eq!(performance[0].data_f64("metric_value"), Some(4.0));
    }

    #[test]
    fn test_failed_task_emits_error() {
        let f = fixture();
        f.store.increment_recovery_attempts("export").unwrap();
        let run = f
            .tracker
            .run_task("export", Tier::Report, |_, _| Err("disk full".to_string()))
            .unwrap();
        assert_eq!(run.status, TaskStatus::Failed);
        assert_eq!(f.store.recovery_attempts("export").unwrap(), 1);

        let errors = f
            .store
            .get_events(&EventQuery::new().with_type(EventType::Error))
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message(), "disk full");
        assert!(
            f.store
                .get_baseline(&crate::store::BaselineKey::new("task_duration", "export"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_should_continue_tracks_budget() {
        let f = fixture();
        let handle = f.tracker.start_task("sync", Tier::Critical).unwrap();
        assert!(f.tracker.should_continue(&handle));

        f.probe.add_db_queries(51);
        assert!(!f.tracker.should_continue(&handle));

        f.probe.set_db_queries(0);
        let handle = f.tracker.start_task("sync", Tier::Critical).unwrap();
        f.clock.advance(Duration::seconds(11));
        assert!(!f.tracker.should_continue(&handle));
        assert!(f.clock.now() > handle.run().start_time);
    }
}
