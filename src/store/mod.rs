//! Durable state used by the monitoring core.
//!
//! The core talks to four logical tables: events, baselines, task runs and task
//! state (recovery counters and scheduled retries). [`MonitorStore`] is the only
//! contract; it issues keyed upserts and filtered selects, nothing else.
//! Read-modify-write on baselines and counters happens inside the store so that
//! separate invocations sharing one backend never lose updates.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::WardenResult;
use crate::event::{EventType, MonitoringEvent};
use crate::governor::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use uuid::Uuid;

/// `(metric_name, metric_context)`, unique together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BaselineKey {
    pub metric_name: String,
    pub metric_context: String,
}

impl BaselineKey {
    pub fn new(metric_name: impl Into<String>, metric_context: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            metric_context: metric_context.into(),
        }
    }
}

/// Rolling expected value of a metric in a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub metric_name: String,
    pub metric_context: String,
    pub value: f64,
    pub sample_count: u64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Baseline {
    pub fn key(&self) -> BaselineKey {
        BaselineKey::new(self.metric_name.clone(), self.metric_context.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Aborted,
    Partial,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Partial => "partial",
        }
    }
}

/// One execution of a background task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_name: String,
    pub tier: Tier,
    pub start_time: DateTime<Utc>,
    pub memory_start: u64,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds.
    pub duration: Option<f64>,
    pub memory_peak: Option<u64>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TaskRun {
    pub fn start(
        task_name: impl Into<String>,
        tier: Tier,
        start_time: DateTime<Utc>,
        memory_start: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_name: task_name.into(),
            tier,
            start_time,
            memory_start,
            end_time: None,
            duration: None,
            memory_peak: None,
            status: TaskStatus::Running,
            error_message: None,
            metadata: Map::new(),
        }
    }
}

/// A retry queued by the health checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_name: String,
    pub run_at: DateTime<Utc>,
    pub attempt: u32,
    pub reason: String,
}

/// Filter for event reads. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub event_type: Option<EventType>,
    pub source: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn matches(&self, event: &MonitoringEvent) -> bool {
        self.event_type.is_none_or(|t| t == event.event_type())
            && self
                .source
                .as_deref()
                .is_none_or(|source| source == event.source())
            && self.since.is_none_or(|since| event.timestamp() >= since)
    }
}

/// Filter for task-run reads. Results are most recently started first.
#[derive(Debug, Clone, Default)]
pub struct TaskRunQuery {
    pub task_name: Option<String>,
    pub status: Option<TaskStatus>,
    pub started_before: Option<DateTime<Utc>>,
    pub ended_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl TaskRunQuery {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, run: &TaskRun) -> bool {
        self.task_name
            .as_deref()
            .is_none_or(|name| name == run.task_name)
            && self.status.is_none_or(|status| status == run.status)
            && self.started_before.is_none_or(|t| run.start_time < t)
            && self
                .ended_after
                .is_none_or(|t| run.end_time.is_some_and(|end| end >= t))
    }
}

/// Storage contract for the monitoring core.
pub trait MonitorStore: Send + Sync + Debug {
    fn insert_event(&self, event: &MonitoringEvent) -> WardenResult<()>;

    fn get_events(&self, query: &EventQuery) -> WardenResult<Vec<MonitoringEvent>>;

    /// Number of events stored at or after `since`.
    fn count_events_since(&self, since: DateTime<Utc>) -> WardenResult<u64>;

    /// Per-type counts, optionally restricted to events at or after `since`.
    fn event_counts(&self, since: Option<DateTime<Utc>>) -> WardenResult<HashMap<EventType, u64>>;

    /// Deletes events older than `cutoff`, returning how many were removed.
    fn purge_events_before(&self, cutoff: DateTime<Utc>) -> WardenResult<usize>;

    fn get_baseline(&self, key: &BaselineKey) -> WardenResult<Option<Baseline>>;

    /// Atomic read-modify-write of a single baseline row.
    fn update_baseline(
        &self,
        key: &BaselineKey,
        update: &mut dyn FnMut(Option<&Baseline>) -> Baseline,
    ) -> WardenResult<Baseline>;

    fn baselines(&self) -> WardenResult<Vec<Baseline>>;

    /// Upsert by run id.
    fn save_task_run(&self, run: &TaskRun) -> WardenResult<()>;

    fn get_task_run(&self, id: Uuid) -> WardenResult<Option<TaskRun>>;

    fn task_runs(&self, query: &TaskRunQuery) -> WardenResult<Vec<TaskRun>>;

    fn purge_task_runs_before(&self, cutoff: DateTime<Utc>) -> WardenResult<usize>;

    fn recovery_attempts(&self, task_name: &str) -> WardenResult<u32>;

    /// Increments and returns the new counter value.
    fn increment_recovery_attempts(&self, task_name: &str) -> WardenResult<u32>;

    fn reset_recovery_attempts(&self, task_name: &str) -> WardenResult<()>;

    fn schedule_task(&self, task: ScheduledTask) -> WardenResult<()>;

    /// Removes and returns every scheduled retry due at or before `now`.
    fn take_due_tasks(&self, now: DateTime<Utc>) -> WardenResult<Vec<ScheduledTask>>;

    fn scheduled_tasks(&self) -> WardenResult<Vec<ScheduledTask>>;
}
