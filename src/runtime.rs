//! Wires the monitoring core together.
//!
//! [`Warden`] owns one [`EventBus`] and the components registered on it. It is
//! what a host constructs at startup and what the scheduler calls into.

use crate::baseline::BaselineEngine;
use crate::bus::{BusStats, Component, EventBus};
use crate::clock::Clock;
use crate::config::{BusConfig, WardenConfig};
use crate::conflict::ConflictDetector;
use crate::error::{WardenError, WardenResult};
use crate::event::{EventData, EventType, Priority};
use crate::governor::{ResourceGovernor, SystemProbe};
use crate::health::{HealthChecker, HealthReport, SCHEDULED_CHECK};
use crate::monitor::{CleanupReport, SelfMonitor};
use crate::store::{MonitorStore, ScheduledTask};
use crate::tasks::TaskTracker;
use crate::{baseline, conflict, governor, health, monitor};
use log::{info, warn};
use serde_json::{Map, Value, json};
use std::sync::Arc;

pub const SCHEDULER_SOURCE: &str = "scheduler";

/// Name under which [`Warden::update_component_config`] reaches the bus.
pub const BUS_CONFIG_NAME: &str = "bus";

#[derive(Debug)]
pub struct Warden {
    config: WardenConfig,
    bus: Arc<EventBus>,
    baseline: BaselineEngine,
    governor: ResourceGovernor,
    conflicts: ConflictDetector,
    health: HealthChecker,
    monitor: SelfMonitor,
    tasks: TaskTracker,
}

impl Warden {
    /// Validates `config`, builds every component and registers it on a new bus.
    pub fn new(
        config: WardenConfig,
        store: Arc<dyn MonitorStore>,
        probe: Arc<dyn SystemProbe>,
        clock: Arc<dyn Clock>,
    ) -> WardenResult<Self> {
        config
            .validate()
            .map_err(|problems| WardenError::Config(problems.join("; ")))?;

        let bus = Arc::new(EventBus::new(config.bus.clone(), store.clone(), clock.clone()));

        let baseline = BaselineEngine::new(
            config.baseline.clone(),
            store.clone(),
            probe.clone(),
            clock.clone(),
        );
        let governor = ResourceGovernor::new(
            config.budgets.clone(),
            config.governor.clone(),
            store.clone(),
            probe.clone(),
            clock.clone(),
        );
        governor.add_reclaimer(baseline.snapshots());

        let conflicts = ConflictDetector::new(config.conflicts.clone(), baseline.clone());
        conflicts.attach(&bus);

        let health = HealthChecker::new(config.health.clone(), store.clone(), clock.clone());
        health.attach(&bus);

        let monitor = SelfMonitor::new(
            config.retention.clone(),
            store,
            baseline.snapshots(),
            clock,
        );

        let components: [(&str, Arc<dyn Component>); 5] = [
            (conflict::COMPONENT_NAME, Arc::new(conflicts.clone())),
            (baseline::COMPONENT_NAME, Arc::new(baseline.clone())),
            (governor::COMPONENT_NAME, Arc::new(governor.clone())),
            (health::COMPONENT_NAME, Arc::new(health.clone())),
            (monitor::COMPONENT_NAME, Arc::new(monitor.clone())),
        ];
        for (name, component) in components {
            bus.register_component(name, component)?;
        }

        let tasks = TaskTracker::new(bus.clone(), governor.clone(), baseline.clone(), probe);
        info!(
            "Warden started: components={:?}, enabled={}",
            bus.component_names(),
            bus.is_enabled()
        );

        Ok(Self {
            config,
            bus,
            baseline,
            governor,
            conflicts,
            health,
            monitor,
            tasks,
        })
    }

    /// The configuration the warden was built with.
    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn baseline(&self) -> &BaselineEngine {
        &self.baseline
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }

    pub fn conflicts(&self) -> &ConflictDetector {
        &self.conflicts
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    pub fn monitor(&self) -> &SelfMonitor {
        &self.monitor
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Emits the periodic `health` event. The health checker runs on it and the
    /// governor reports overload. Returns the resulting report, if the event got
    /// through the bus gates.
    pub fn scheduled_check(&self) -> Option<HealthReport> {
        let before = self.health.runs();
        self.bus.emit(
            EventType::Health,
            SCHEDULER_SOURCE,
            SCHEDULED_CHECK,
            "Scheduled health check",
            EventData::new(),
            Priority::NORMAL.into(),
        );
        if self.health.runs() == before {
            warn!("Scheduled health check did not run");
            return None;
        }
        self.health.last_report()
    }

    /// Retention cleanup.
    pub fn cleanup(&self) -> WardenResult<CleanupReport> {
        self.monitor.cleanup()
    }

    /// Removes and returns the retries that are due now. Only the host that
    /// executes retries should call this.
    pub fn due_retries(&self) -> WardenResult<Vec<ScheduledTask>> {
        self.bus.store().take_due_tasks(self.bus.now())
    }

    /// Every queued retry, left in place.
    pub fn pending_retries(&self) -> WardenResult<Vec<ScheduledTask>> {
        self.bus.store().scheduled_tasks()
    }

    pub fn stats(&self) -> BusStats {
        self.bus.stats()
    }

    /// Status of every registered component plus the bus counters.
    pub fn status(&self) -> Value {
        let mut components = Map::new();
        for name in self.bus.component_names() {
            if let Some(component) = self.bus.component(&name) {
                components.insert(name, component.get_status());
            }
        }
        let pending_retries = self.pending_retries().unwrap_or_else(|e| {
            warn!("Failed to read pending retries: {}", e);
            Vec::new()
        });
        json!({
            "enabled": self.bus.is_enabled(),
            "bus": self.bus.stats(),
            "circuit": self.bus.circuit_state(crate::bus::GLOBAL_SCOPE),
            "throttle": self.bus.throttle_state(crate::bus::GLOBAL_SCOPE),
            "components": components,
            "pending_retries": pending_retries,
        })
    }

    /// Replaces the settings of the component registered as `name`. The name
    /// `bus` reconfigures the event bus itself.
    pub fn update_component_config(&self, name: &str, config: Value) -> WardenResult<()> {
        if name == BUS_CONFIG_NAME {
            let bus: BusConfig = serde_json::from_value(config)?;
            let candidate = WardenConfig {
                bus: bus.clone(),
                ..self.config.clone()
            };
            candidate
                .validate()
                .map_err(|problems| WardenError::Config(problems.join("; ")))?;
            self.bus.configure(&bus);
            info!("Bus reconfigured: {:?}", bus);
            return Ok(());
        }

        let component = self
            .bus
            .component(name)
            .ok_or_else(|| WardenError::NotFound(format!("component '{}'", name)))?;
        component.update_config(config)
    }
}
