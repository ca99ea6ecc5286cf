//! Task health checks and bounded-retry recovery.
//!
//! A check run looks for two kinds of unhealthy task: runs still marked
//! `running` long after they started, and runs that failed recently. Each
//! affected task is retried after a fixed delay until its recovery counter
//! reaches the maximum; after that a `critical` event declares recovery
//! exhausted. The counter is reset by whoever observes a successful run, never
//! by the checker itself.

use crate::bus::{Component, EventBus, EventHandler};
use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::error::{HandlerResult, WardenResult};
use crate::event::{EventData, EventType, MonitoringEvent, Priority};
use crate::store::{MonitorStore, ScheduledTask, TaskRun, TaskRunQuery, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub const COMPONENT_NAME: &str = "health_checker";

/// Context of the `health` event that asks for a check run.
pub const SCHEDULED_CHECK: &str = "scheduled_check";

/// Task run metadata flag set once a failed run has been recovered or declared
/// exhausted.
pub const RECOVERY_HANDLED: &str = "recovery_handled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn event_type(&self) -> EventType {
        match self {
            HealthStatus::Ok => EventType::Info,
            HealthStatus::Warning => EventType::Warning,
            HealthStatus::Critical => EventType::Critical,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Outcome of one check run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    /// Task names with a run stuck in `running`.
    pub stuck: Vec<String>,
    /// Task names whose latest finished run failed recently and has not been
    /// handled by an earlier check.
    pub failed: Vec<String>,
    pub rescheduled: Vec<ScheduledTask>,
    /// Task names whose recovery attempts are used up.
    pub exhausted: Vec<String>,
    pub errors: Vec<String>,
}

impl HealthReport {
    fn summary(&self) -> String {
        format!(
            "Health check {}: {} stuck, {} failed, {} rescheduled, {} exhausted",
            self.status,
            self.stuck.len(),
            self.failed.len(),
            self.rescheduled.len(),
            self.exhausted.len()
        )
    }
}

#[derive(Debug)]
struct CheckerInner {
    store: Arc<dyn MonitorStore>,
    clock: Arc<dyn Clock>,
    config: RwLock<HealthConfig>,
    bus: RwLock<Weak<EventBus>>,
    last_report: Mutex<Option<HealthReport>>,
    runs: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    inner: Arc<CheckerInner>,
}

impl HealthChecker {
    pub fn new(config: HealthConfig, store: Arc<dyn MonitorStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(CheckerInner {
                store,
                clock,
                config: RwLock::new(config),
                bus: RwLock::new(Weak::new()),
                last_report: Mutex::new(None),
                runs: AtomicU64::new(0),
            }),
        }
    }

    pub fn attach(&self, bus: &Arc<EventBus>) {
        *self.inner.bus.write() = Arc::downgrade(bus);
    }

    pub fn config(&self) -> HealthConfig {
        self.inner.config.read().clone()
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        self.inner.last_report.lock().clone()
    }

    /// Number of completed check runs.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Runs a check and emits its summary on the attached bus, if any.
    pub fn run_check(&self) -> HealthReport {
        let bus = self.inner.bus.read().upgrade();
        self.check_with(bus.as_deref())
    }

    fn check_with(&self, bus: Option<&EventBus>) -> HealthReport {
        let config = self.config();
        let now = self.inner.clock.now();
        let mut report = HealthReport {
            status: HealthStatus::Ok,
            checked_at: now,
            stuck: Vec::new(),
            failed: Vec::new(),
            rescheduled: Vec::new(),
            exhausted: Vec::new(),
            errors: Vec::new(),
        };

        let stuck_runs = self.find_stuck(&config, now).unwrap_or_else(|e| {
            report.errors.push(e.to_string());
            Vec::new()
        });
        let failed_runs = self.find_failed(&config, now).unwrap_or_else(|e| {
            report.errors.push(e.to_string());
            Vec::new()
        });

        for run in &stuck_runs {
            if let Err(e) = self.abort_stuck(run, now) {
                report.errors.push(e.to_string());
            }
        }

        report.stuck = stuck_runs.iter().map(|r| r.task_name.clone()).collect();
        report.failed = failed_runs.iter().map(|r| r.task_name.clone()).collect();

        let pending: BTreeSet<String> = match self.inner.store.scheduled_tasks() {
            Ok(tasks) => tasks.into_iter().map(|t| t.task_name).collect(),
            Err(e) => {
                report.errors.push(e.to_string());
                BTreeSet::new()
            }
        };

        let candidates: BTreeSet<&str> = stuck_runs
            .iter()
            .chain(failed_runs.iter())
            .map(|run| run.task_name.as_str())
            .collect();
        for task_name in candidates {
            if pending.contains(task_name) {
                continue;
            }
            match self.recover(&config, task_name, now) {
                Ok(Some(task)) => report.rescheduled.push(task),
                Ok(None) => report.exhausted.push(task_name.to_string()),
                Err(e) => {
                    report.errors.push(e.to_string());
                    continue;
                }
            }
            for run in failed_runs.iter().filter(|r| r.task_name == task_name) {
                if let Err(e) = self.mark_handled(run) {
                    report.errors.push(e.to_string());
                }
            }
        }

        report.status = if report.failed.len() > config.critical_failure_count
            || !report.exhausted.is_empty()
        {
            HealthStatus::Critical
        } else if !report.stuck.is_empty() || !report.failed.is_empty() || !report.errors.is_empty()
        {
            HealthStatus::Warning
        } else {
            HealthStatus::Ok
        };

        if let Some(bus) = bus {
            for task_name in &report.exhausted {
                self.emit_exhausted(bus, task_name, config.max_recovery_attempts);
            }
            self.emit_summary(bus, &report);
        }

        info!("{}", report.summary());
        *self.inner.last_report.lock() = Some(report.clone());
        self.inner.runs.fetch_add(1, Ordering::SeqCst);
        report
    }

    fn find_stuck(&self, config: &HealthConfig, now: DateTime<Utc>) -> WardenResult<Vec<TaskRun>> {
        self.inner.store.task_runs(&TaskRunQuery {
            status: Some(TaskStatus::Running),
            started_before: Some(now - Duration::seconds(config.stuck_threshold_secs as i64)),
            ..TaskRunQuery::default()
        })
    }

    /// Recent failed runs still awaiting recovery. A failure is skipped once a
    /// check has handled it, or once a later run of the same task finished.
    fn find_failed(&self, config: &HealthConfig, now: DateTime<Utc>) -> WardenResult<Vec<TaskRun>> {
        let recent = self.inner.store.task_runs(&TaskRunQuery {
            status: Some(TaskStatus::Failed),
            ended_after: Some(now - Duration::seconds(config.failure_window_secs as i64)),
            ..TaskRunQuery::default()
        })?;

        let mut failed = Vec::new();
        for run in recent {
            if failed.len() == config.recent_failures {
                break;
            }
            if is_handled(&run) || self.is_superseded(&run)? {
                continue;
            }
            failed.push(run);
        }
        Ok(failed)
    }

    fn is_superseded(&self, failed: &TaskRun) -> WardenResult<bool> {
        let runs = self.inner.store.task_runs(&TaskRunQuery {
            task_name: Some(failed.task_name.clone()),
            ..TaskRunQuery::default()
        })?;
        Ok(runs.iter().any(|run| {
            run.id != failed.id
                && matches!(
                    (run.end_time, failed.end_time),
                    (Some(ended), Some(failed_at)) if ended > failed_at
                )
        }))
    }

    fn mark_handled(&self, run: &TaskRun) -> WardenResult<()> {
        let mut handled = run.clone();
        handled.metadata.insert(RECOVERY_HANDLED.to_string(), json!(true));
        self.inner.store.save_task_run(&handled)
    }

    /// Closes a stuck run as aborted so the next check does not find it again.
    fn abort_stuck(&self, run: &TaskRun, now: DateTime<Utc>) -> WardenResult<()> {
        let mut aborted = run.clone();
        aborted.status = TaskStatus::Aborted;
        aborted.end_time = Some(now);
        aborted.duration = Some((now - run.start_time).num_milliseconds() as f64 / 1000.0);
        aborted.error_message = Some("aborted after exceeding the stuck threshold".to_string());
        warn!(
            "Aborting stuck task run: task={}, run_id={}, started={}",
            run.task_name, run.id, run.start_time
        );
        self.inner.store.save_task_run(&aborted)
    }

    /// Schedules a retry, or returns `None` once the attempts are used up.
    fn recover(
        &self,
        config: &HealthConfig,
        task_name: &str,
        now: DateTime<Utc>,
    ) -> WardenResult<Option<ScheduledTask>> {
        let attempts = self.inner.store.recovery_attempts(task_name)?;
        if attempts >= config.max_recovery_attempts {
            error!(
                "Recovery exhausted: task={}, attempts={}",
                task_name, attempts
            );
            return Ok(None);
        }

        let attempt = self.inner.store.increment_recovery_attempts(task_name)?;
        let task = ScheduledTask {
            task_name: task_name.to_string(),
            run_at: now + Duration::seconds(config.retry_delay_secs as i64),
            attempt,
            reason: "health_check_recovery".to_string(),
        };
        self.inner.store.schedule_task(task.clone())?;
        info!(
            "Task rescheduled: task={}, attempt={}, run_at={}",
            task_name, attempt, task.run_at
        );
        Ok(Some(task))
    }

    fn emit_exhausted(&self, bus: &EventBus, task_name: &str, max_attempts: u32) {
        let mut data = EventData::new();
        data.insert("task_name".to_string(), json!(task_name));
        data.insert("max_attempts".to_string(), json!(max_attempts));
        bus.emit(
            EventType::Critical,
            COMPONENT_NAME,
            "recovery_exhausted",
            format!(
                "Recovery exhausted for {} after {} attempts",
                task_name, max_attempts
            ),
            data,
            Priority::CRITICAL.into(),
        );
    }

    fn emit_summary(&self, bus: &EventBus, report: &HealthReport) {
        let priority = match report.status {
            HealthStatus::Ok => Priority::LOW,
            HealthStatus::Warning => Priority::NORMAL,
            HealthStatus::Critical => Priority::CRITICAL,
        };
        let data = match serde_json::to_value(report) {
            Ok(Value::Object(map)) => map,
            _ => EventData::new(),
        };
        bus.emit(
            report.status.event_type(),
            COMPONENT_NAME,
            "health_check",
            report.summary(),
            data,
            priority.into(),
        );
    }
}

fn is_handled(run: &TaskRun) -> bool {
    run.metadata
        .get(RECOVERY_HANDLED)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

impl EventHandler for HealthChecker {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    fn priority(&self) -> Priority {
        Priority::NORMAL
    }

    fn handled_types(&self) -> Vec<EventType> {
        vec![EventType::Health]
    }

    fn can_handle(&self, event: &MonitoringEvent) -> bool {
        event.context() == SCHEDULED_CHECK
    }

    fn handle(&self, event: &MonitoringEvent, bus: &EventBus) -> HandlerResult {
        self.process_event(event, bus)
    }
}

impl Component for HealthChecker {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    fn init(&self) -> WardenResult<()> {
        Ok(())
    }

    fn register_handlers(&self, bus: &EventBus) {
        bus.register_handler(Arc::new(self.clone()));
    }

    fn process_event(&self, event: &MonitoringEvent, bus: &EventBus) -> HandlerResult {
        if event.event_type() != EventType::Health || event.context() != SCHEDULED_CHECK {
            return Ok(false);
        }
        self.check_with(Some(bus));
        Ok(true)
    }

    fn get_status(&self) -> Value {
        json!({ "runs": self.runs(), "last_report": self.last_report() })
    }

    fn get_config(&self) -> Value {
        serde_json::to_value(self.config()).unwrap_or(Value::Null)
    }

    fn update_config(&self, config: Value) -> WardenResult<()> {
        *self.inner.config.write() = serde_json::from_value(config)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BusConfig;
    use crate::governor::Tier;
    use crate::store::{EventQuery, MemoryStore};

    fn checker() -> (Arc<ManualClock>, Arc<MemoryStore>, Arc<EventBus>, HealthChecker) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(BusConfig::default(), store.clone(), clock.clone()));
        let checker = HealthChecker::new(HealthConfig::default(), store.clone(), clock.clone());
        checker.attach(&bus);
        (clock, store, bus, checker)
    }

    fn failed_run(name: &str, now: DateTime<Utc>) -> TaskRun {
        let mut run = TaskRun::start(name, Tier::Standard, now - Duration::minutes(5), 0);
        run.status = TaskStatus::Failed;
        run.end_time = Some(now - Duration::minutes(1));
        run.error_message = Some("boom".to_string());
        run
    }

    #[test]
    fn test_healthy_when_nothing_to_recover() {
        let (_clock, store, _bus, checker) = checker();
        let report = checker.run_check();
        assert_eq!(report.status, HealthStatus::Ok);
        let summary = store
            .get_events(&EventQuery::new().with_source(COMPONENT_NAME))
            .unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].event_type(), EventType::Info);
    }

    #[test]
    fn test_stuck_run_is_aborted_and_rescheduled() {
        let (clock, store, _bus, checker) = checker();
        let run = TaskRun::start("import", Tier::Standard, clock.now() - Duration::hours(2), 0);
        store.save_task_run(&run).unwrap();

        let report = checker.run_check();
        assert_eq!(report.status, HealthStatus::Warning);
        assert_eq!(report.stuck, vec!["import".to_string()]);
        assert_eq!(report.rescheduled.len(), 1);
        assert_eq!(report.rescheduled[0].run_at, clock.now() + Duration::seconds(300));
        assert_eq!(store.recovery_attempts("import").unwrap(), 1);
        assert_eq!(
            store.get_task_run(run.id).unwrap().unwrap().status,
            TaskStatus::Aborted
        );

        // the aborted run is not picked up twice
        let again = checker.run_check();
        assert!(again.stuck.is_empty());
    }

    #[test]
    fn test_recovery_exhausted_after_max_attempts() {
        let (clock, store, _bus, checker) = checker();
        for _ in 0..3 {
            store.increment_recovery_attempts("export").unwrap();
        }
        store.save_task_run(&failed_run("export", clock.now())).unwrap();

        let report = checker.run_check();
        assert_eq!(report.status, HealthStatus::Critical);
        assert_eq!(report.exhausted, vec!["export".to_string()]);
        assert!(report.rescheduled.is_empty());

        let critical = store
            .get_events(&EventQuery::new().with_type(EventType::Critical))
            .unwrap();
        assert!(critical.iter().any(|e| e.context() == "recovery_exhausted"));
    }

    #[test]
    fn test_pending_retry_is_not_rescheduled_again() {
        let (clock, store, _bus, checker) = checker();
        store.save_task_run(&failed_run("sync", clock.now())).unwrap();
        assert_eq!(checker.run_check().rescheduled.len(), 1);
        assert!(checker.run_check().rescheduled.is_empty());
        assert_eq!(store.recovery_attempts("sync").unwrap(), 1);
    }

    #[test]
    fn test_failure_superseded_by_later_run_is_ignored() {
        let (clock, store, _bus, checker) = checker();
        store.save_task_run(&failed_run("sync", clock.now())).unwrap();
        let mut retry = TaskRun::start("sync", Tier::Standard, clock.now(), 0);
        retry.status = TaskStatus::Completed;
        retry.end_time = Some(clock.now());
        store.save_task_run(&retry).unwrap();

        let report = checker.run_check();
        assert_eq!(report.status, HealthStatus::Ok);
        assert!(report.failed.is_empty());
        assert_eq!(store.recovery_attempts("sync").unwrap(), 0);
    }

    #[test]
    fn test_recovered_failure_is_marked_handled() {
        let (clock, store, _bus, checker) = checker();
        let run = failed_run("sync", clock.now());
        store.save_task_run(&run).unwrap();
        assert_eq!(checker.run_check().rescheduled.len(), 1);

        let stored = store.get_task_run(run.id).unwrap().unwrap();
        assert!(is_handled(&stored));
        assert_eq!(stored.status, TaskStatus::Failed);

        store.take_due_tasks(clock.now() + Duration::hours(1)).unwrap();
        assert!(checker.run_check().failed.is_empty());
        assert_eq!(store.recovery_attempts("sync").unwrap(), 1);
    }

    #[test]
    fn test_many_failures_are_critical() {
        let (clock, store, _bus, checker) = checker();
        for i in 0..6 {
            store
                .save_task_run(&failed_run(&format!("task-{}", i), clock.now()))
                .unwrap();
        }
        let report = checker.run_check();
        assert_eq!(report.failed.len(), 6);
        assert_eq!(report.status, HealthStatus::Critical);
    }

    #[test]
    fn test_scheduled_check_event_triggers_run() {
        let (_clock, _store, bus, checker) = checker();
        bus.register_component(COMPONENT_NAME, Arc::new(checker.clone()))
            .unwrap();
        assert!(bus.emit(
            EventType::Health,
            "scheduler",
            SCHEDULED_CHECK,
            "tick",
            EventData::new(),
            50
        ));
        assert!(checker.last_report().is_some());
        assert!(!bus.emit(EventType::Health, "scheduler", "other", "tick", EventData::new(), 50));
    }
}
