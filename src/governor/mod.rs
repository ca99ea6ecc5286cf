//! Resource governance.
//!
//! The [`ResourceGovernor`] answers two questions for a running task: may it keep
//! going (`should_continue`, a hard stop checked against the tier budget and the
//! overload gate) and how loaded is the system (`get_system_load`, a soft score
//! used to stretch scheduling delays). It also decides when to reclaim memory.
//!
//! The overload gate and the load score are deliberately different: the gate is
//! "memory above 90% of the limit or high event traffic", the score is a weighted
//! blend of CPU, memory and traffic.

pub mod budget;
pub mod gc;
pub mod probe;

pub use budget::Tier;
pub use gc::{GcReport, Reclaimer};
pub use probe::{ManualProbe, SysinfoProbe, SystemProbe};

use crate::bus::{Component, EventBus, EventHandler};
use crate::clock::Clock;
use crate::config::{BudgetConfig, GovernorConfig, ResourceBudget};
use crate::error::{HandlerResult, WardenResult};
use crate::event::{EventData, EventType, MonitoringEvent, Priority};
use crate::store::MonitorStore;
use chrono::{DateTime, Duration, Utc};
use log::{error, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;

pub const COMPONENT_NAME: &str = "resource_governor";

/// The first budget check a task failed.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetExceeded {
    Memory { used: u64, budget: u64 },
    Time { elapsed_secs: i64, budget: u64 },
    DbQueries { count: u64, budget: u64 },
    SystemOverload,
}

impl fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetExceeded::Memory { used, budget } => {
                write!(f, "memory budget exceeded: {} of {} bytes", used, budget)
            }
            BudgetExceeded::Time {
                elapsed_secs,
                budget,
            } => write!(f, "time budget exceeded: {}s of {}s", elapsed_secs, budget),
            BudgetExceeded::DbQueries { count, budget } => {
                write!(f, "db query budget exceeded: {} of {}", count, budget)
            }
            BudgetExceeded::SystemOverload => write!(f, "system overloaded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GovernorStatus {
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_fraction: f64,
    pub cpu_load: f64,
    /// CPU load above `cpu_threshold`. Reported only; it never stops a task.
    pub cpu_high: bool,
    pub high_traffic: bool,
    pub overloaded: bool,
    pub system_load: f64,
}

/// Budgets and governor settings, as exposed through the component config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    pub budgets: BudgetConfig,
    pub governor: GovernorConfig,
}

#[derive(Debug)]
struct GovernorInner {
    store: Arc<dyn MonitorStore>,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn SystemProbe>,
    settings: RwLock<GovernorSettings>,
    reclaimers: RwLock<Vec<Arc<dyn Reclaimer>>>,
    last_gc: Mutex<Option<GcReport>>,
}

/// Cheap-to-clone handle; clones share state.
#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    inner: Arc<GovernorInner>,
}

impl ResourceGovernor {
    pub fn new(
        budgets: BudgetConfig,
        config: GovernorConfig,
        store: Arc<dyn MonitorStore>,
        probe: Arc<dyn SystemProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(GovernorInner {
                store,
                clock,
                probe,
                settings: RwLock::new(GovernorSettings {
                    budgets,
                    governor: config,
                }),
                reclaimers: RwLock::new(Vec::new()),
                last_gc: Mutex::new(None),
            }),
        }
    }

    pub fn add_reclaimer(&self, reclaimer: Arc<dyn Reclaimer>) {
        self.inner.reclaimers.write().push(reclaimer);
    }

    pub fn settings(&self) -> GovernorSettings {
        self.inner.settings.read().clone()
    }

    pub fn get_budget(&self, tier: Tier) -> ResourceBudget {
        self.inner.settings.read().budgets.for_tier(tier)
    }

    /// Budget lookup by tier name; unknown names get the standard budget.
    pub fn budget_for(&self, tier_name: &str) -> ResourceBudget {
        self.get_budget(Tier::from_name(tier_name))
    }

    /// Short-circuit budget check: memory delta, elapsed time, query count, overload.
    pub fn check_budget(
        &self,
        tier: Tier,
        start_time: DateTime<Utc>,
        memory_start: u64,
        db_queries: u64,
    ) -> Result<(), BudgetExceeded> {
        let budget = self.get_budget(tier);

        let used = self.inner.probe.memory_usage().saturating_sub(memory_start);
        if used > budget.memory_bytes {
            return Err(BudgetExceeded::Memory {
                used,
                budget: budget.memory_bytes,
            });
        }

        let elapsed = self.inner.clock.now() - start_time;
        if elapsed > Duration::seconds(budget.time_seconds as i64) {
            return Err(BudgetExceeded::Time {
                elapsed_secs: elapsed.num_seconds(),
                budget: budget.time_seconds,
            });
        }

        if db_queries > budget.db_query_count {
            return Err(BudgetExceeded::DbQueries {
                count: db_queries,
                budget: budget.db_query_count,
            });
        }

        if self.is_overloaded() {
            return Err(BudgetExceeded::SystemOverload);
        }

        Ok(())
    }

    pub fn should_continue(
        &self,
        tier: Tier,
        start_time: DateTime<Utc>,
        memory_start: u64,
        db_queries: u64,
    ) -> bool {
        match self.check_budget(tier, start_time, memory_start, db_queries) {
            Ok(()) => true,
            Err(reason) => {
                warn!("Task should stop: tier={}, reason={}", tier, reason);
                false
            }
        }
    }

    pub fn memory_fraction(&self) -> f64 {
        let limit = self.inner.settings.read().governor.memory_limit_bytes;
        if limit == 0 {
            return 1.0;
        }
        self.inner.probe.memory_usage() as f64 / limit as f64
    }

    /// More than `high_traffic_events` events stored inside the traffic window.
    pub fn is_high_traffic(&self) -> bool {
        let (threshold, window) = {
            let settings = self.inner.settings.read();
            (
                settings.governor.high_traffic_events,
                settings.governor.high_traffic_window_secs,
            )
        };
        let since = self.inner.clock.now() - Duration::seconds(window as i64);
        match self.inner.store.count_events_since(since) {
            Ok(count) => count > threshold,
            Err(e) => {
                error!("Failed to count recent events: error={}", e);
                false
            }
        }
    }

    pub fn is_cpu_high(&self) -> bool {
        let threshold = self.inner.settings.read().governor.cpu_threshold;
        self.inner.probe.cpu_load() > threshold
    }

    pub fn is_overloaded(&self) -> bool {
        let overload_fraction = self.inner.settings.read().governor.overload_memory_fraction;
        self.memory_fraction() > overload_fraction || self.is_high_traffic()
    }

    /// Weighted load score in `[0, 1]`.
    pub fn get_system_load(&self) -> f64 {
        let cpu = self.inner.probe.cpu_load().clamp(0.0, 1.0);
        let memory = self.memory_fraction().clamp(0.0, 1.0);
        let traffic = if self.is_high_traffic() { 1.0 } else { 0.0 };
        0.4 * cpu + 0.4 * memory + 0.2 * traffic
    }

    /// Stretches `base` by the current load, up to twice its length.
    pub fn scaled_delay(&self, base: std::time::Duration) -> std::time::Duration {
        base.mul_f64(1.0 + self.get_system_load())
    }

    pub fn get_status(&self) -> GovernorStatus {
        let limit = self.inner.settings.read().governor.memory_limit_bytes;
        let high_traffic = self.is_high_traffic();
        GovernorStatus {
            memory_usage: self.inner.probe.memory_usage(),
            memory_limit: limit,
            memory_fraction: self.memory_fraction(),
            cpu_load: self.inner.probe.cpu_load(),
            cpu_high: self.is_cpu_high(),
            high_traffic,
            overloaded: self.is_overloaded(),
            system_load: self.get_system_load(),
        }
    }

    /// Runs reclamation cycles unless memory is below the GC threshold and
    /// `force` is false.
    pub fn trigger_gc(&self, force: bool) -> GcReport {
        let (threshold, cycles, min_freed) = {
            let settings = self.inner.settings.read();
            (
                settings.governor.gc_threshold,
                settings.governor.gc_cycles,
                settings.governor.gc_min_freed_bytes,
            )
        };

        let report = if !force && self.memory_fraction() < threshold {
            GcReport::skipped(self.inner.probe.memory_usage())
        } else {
            let reclaimers = self.inner.reclaimers.read().clone();
            gc::run_cycles(
                self.inner.probe.as_ref(),
                &reclaimers,
                cycles,
                min_freed,
                force,
            )
        };
        *self.inner.last_gc.lock() = Some(report.clone());
        report
    }

    pub fn is_forced_gc_task(&self, task_name: &str) -> bool {
        self.inner
            .settings
            .read()
            .governor
            .gc_force_tasks
            .iter()
            .any(|name| name == task_name)
    }

    pub fn should_trigger_gc_after_task(&self, task_name: &str) -> bool {
        let threshold = self.inner.settings.read().governor.gc_threshold;
        self.is_forced_gc_task(task_name) || self.memory_fraction() >= threshold
    }

    pub fn last_gc(&self) -> Option<GcReport> {
        self.inner.last_gc.lock().clone()
    }

    fn on_performance(&self, event: &MonitoringEvent) -> HandlerResult {
        let Some(memory) = event.data_f64("memory_usage") else {
            return Ok(false);
        };
        let (limit, threshold) = {
            let settings = self.inner.settings.read();
            (
                settings.governor.memory_limit_bytes,
                settings.governor.gc_threshold,
            )
        };
        if limit == 0 || memory / (limit as f64) < threshold {
            return Ok(false);
        }
        let report = self.trigger_gc(false);
        Ok(!report.skipped)
    }

    fn on_health(&self, bus: &EventBus) -> HandlerResult {
        let status = self.get_status();
        if !status.overloaded {
            if status.cpu_high {
                warn!("CPU load high: load={:.2}", status.cpu_load);
            }
            return Ok(true);
        }
        let mut data = EventData::new();
        data.insert("memory_usage".to_string(), json!(status.memory_usage));
        data.insert("memory_fraction".to_string(), json!(status.memory_fraction));
        data.insert("high_traffic".to_string(), json!(status.high_traffic));
        data.insert("cpu_load".to_string(), json!(status.cpu_load));
        data.insert("cpu_high".to_string(), json!(status.cpu_high));
        data.insert("system_load".to_string(), json!(status.system_load));
        bus.emit(
            EventType::Warning,
            COMPONENT_NAME,
            "system_overload",
            format!(
                "System overloaded: memory at {:.0}% of limit, high traffic: {}",
                status.memory_fraction * 100.0,
                status.high_traffic
            ),
            data,
            Priority::HIGH.into(),
        );
        Ok(true)
    }
}

impl EventHandler for ResourceGovernor {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    fn priority(&self) -> Priority {
        Priority::NORMAL
    }

    fn handled_types(&self) -> Vec<EventType> {
        vec![EventType::Performance, EventType::Health]
    }

    fn can_handle(&self, event: &MonitoringEvent) -> bool {
        match event.event_type() {
            EventType::Performance => event.data().contains_key("memory_usage"),
            EventType::Health => true,
            _ => false,
        }
    }

    fn handle(&self, event: &MonitoringEvent, bus: &EventBus) -> HandlerResult {
        self.process_event(event, bus)
    }
}

impl Component for ResourceGovernor {
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
        match event.event_type() {
            EventType::Performance => self.on_performance(event),
            EventType::Health => self.on_health(bus),
            _ => Ok(false),
        }
    }

    fn get_status(&self) -> Value {
        json!({
            "status": self.get_status(),
            "last_gc": self.last_gc(),
            "reclaimers": self
                .inner
                .reclaimers
                .read()
                .iter()
                .map(|r| r.name().to_string())
                .collect::<Vec<_>>(),
        })
    }

    fn get_config(&self) -> Value {
        serde_json::to_value(self.settings()).unwrap_or(Value::Null)
    }

    fn update_config(&self, config: Value) -> WardenResult<()> {
        let settings: GovernorSettings = serde_json::from_value(config)?;
        *self.inner.settings.write() = settings;
        Ok(())
    }
}
