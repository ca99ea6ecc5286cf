//! The monitoring event bus.
//!
//! [`EventBus`] is the single dispatcher of a process. It is constructed once and
//! handed to every component; there is no global instance. A dispatch runs the
//! following gates in order, dropping the event at the first one that fails:
//!
//! 1. the bus is enabled,
//! 2. the `global` circuit breaker is closed,
//! 3. the `global` throttle window has room,
//!
//! then counts the event against the throttle, persists it (a storage failure is
//! logged and ignored) and fans it out to the handlers registered for its type.
//! Handler failures, including panics, are caught one by one and only feed the
//! breaker's trip count.
//!
//! Breaker and throttle state is process-local.
//!
//! # Examples
//! ```
//! use std::sync::Arc;
//! use warden::bus::EventBus;
//! use warden::clock::SystemClock;
//! use warden::config::BusConfig;
//! use warden::event::{EventData, EventType};
//! use warden::store::MemoryStore;
//!
//! let bus = EventBus::new(BusConfig::default(), Arc::new(MemoryStore::new()), Arc::new(SystemClock));
//! bus.register_callback(EventType::Warning, |event| Ok(event.message() == "disk"));
//! assert!(bus.emit("warning", "doc", "test", "disk", EventData::new(), 50));
//! ```

pub mod circuit;
pub mod handler;
pub mod throttle;

pub use circuit::{CircuitBreaker, CircuitBreakers, GLOBAL_SCOPE};
pub use handler::{CallbackHandler, Component, EventHandler};
pub use throttle::{ThrottleWindow, Throttles};

use crate::clock::Clock;
use crate::config::BusConfig;
use crate::error::{HandlerError, HandlerResult, WardenError, WardenResult};
use crate::event::{EventData, EventType, MonitoringEvent, Priority};
use crate::store::{Baseline, BaselineKey, EventQuery, MonitorStore};
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Clone)]
struct HandlerEntry {
    priority: Priority,
    handler: Arc<dyn EventHandler>,
}

/// Dispatch counters since the bus was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStats {
    pub dispatched: u64,
    pub handled: u64,
    pub dropped_disabled: u64,
    pub dropped_circuit_open: u64,
    pub dropped_throttled: u64,
    pub dropped_too_deep: u64,
    pub persist_failures: u64,
    pub handler_failures: u64,
}

pub struct EventBus {
    enabled: AtomicBool,
    max_depth: AtomicUsize,
    store: Arc<dyn MonitorStore>,
    clock: Arc<dyn Clock>,
    handlers: RwLock<HashMap<EventType, Vec<HandlerEntry>>>,
    components: RwLock<BTreeMap<String, Arc<dyn Component>>>,
    breakers: CircuitBreakers,
    throttles: Throttles,
    stats: Mutex<BusStats>,
}

thread_local! {
    /// Nesting of dispatches on the current thread. Concurrent top-level
    /// dispatches on other threads do not count.
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Holds one level of dispatch nesting until dropped, including on unwind.
struct DepthGuard;

impl DepthGuard {
    /// Enters a dispatch, returning the guard and the depth before entering.
    fn enter() -> (Self, usize) {
        let depth = DISPATCH_DEPTH.with(|d| {
            let depth = d.get();
            d.set(depth + 1);
            depth
        });
        (DepthGuard, depth)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

impl EventBus {
    pub fn new(config: BusConfig, store: Arc<dyn MonitorStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            max_depth: AtomicUsize::new(config.max_dispatch_depth),
            breakers: CircuitBreakers::new(
                config.breaker_threshold,
                config.breaker_reset_secs,
                clock.clone(),
            ),
            throttles: Throttles::new(
                config.throttle_limit,
                config.throttle_window_secs,
                clock.clone(),
            ),
            store,
            clock,
            handlers: RwLock::new(HashMap::new()),
            components: RwLock::new(BTreeMap::new()),
            stats: Mutex::new(BusStats::default()),
        }
    }

    pub fn configure(&self, config: &BusConfig) {
        self.enabled.store(config.enabled, Ordering::SeqCst);
        self.max_depth
            .store(config.max_dispatch_depth, Ordering::SeqCst);
        self.breakers
            .configure(config.breaker_threshold, config.breaker_reset_secs);
        self.throttles
            .configure(config.throttle_limit, config.throttle_window_secs);
    }

    pub fn store(&self) -> &Arc<dyn MonitorStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Registers a component: runs `init`, then lets it register its handlers.
    pub fn register_component(
        &self,
        name: impl Into<String>,
        component: Arc<dyn Component>,
    ) -> WardenResult<()> {
        let name = name.into();
        if self.components.read().contains_key(&name) {
            return Err(WardenError::Component(format!(
                "component '{}' is already registered",
                name
            )));
        }
        component.init().map_err(|e| {
            error!("Component init failed: component={}, error={}", name, e);
            e
        })?;
        self.components
            .write()
            .insert(name.clone(), component.clone());
        component.register_handlers(self);
        debug!("Component registered: component={}", name);
        Ok(())
    }

    pub fn component(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.components.read().get(name).cloned()
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components.read().keys().cloned().collect()
    }

    /// Registers a handler for each of its declared types.
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        let priority = handler.priority();
        let mut handlers = self.handlers.write();
        for event_type in handler.handled_types() {
            let entries = handlers.entry(event_type).or_default();
            entries.push(HandlerEntry {
                priority,
                handler: handler.clone(),
            });
            // Stable: equal priorities keep registration order.
            entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        debug!(
            "Handler registered: handler={}, priority={}",
            handler.name(),
            priority.value()
        );
    }

    /// Registers a bare callback for one event type at normal priority.
    pub fn register_callback<F>(&self, event_type: EventType, callback: F)
    where
        F: Fn(&MonitoringEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_handler(Arc::new(CallbackHandler::new(
            event_type,
            Priority::NORMAL,
            callback,
        )));
    }

    pub fn handler_names(&self, event_type: EventType) -> Vec<String> {
        self.handlers
            .read()
            .get(&event_type)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| entry.handler.name().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Constructs an event stamped with the bus clock and dispatches it.
    pub fn emit(
        &self,
        event_type: impl Into<EventType>,
        source: impl Into<String>,
        context: impl Into<String>,
        message: impl Into<String>,
        data: EventData,
        priority: i64,
    ) -> bool {
        let event = MonitoringEvent::at(
            event_type,
            source,
            context,
            message,
            data,
            priority,
            self.clock.now(),
        );
        self.dispatch(&event)
    }

    /// Runs the dispatch pipeline. Returns true iff at least one handler reported
    /// that it handled the event. Never panics and never fails.
    pub fn dispatch(&self, event: &MonitoringEvent) -> bool {
        if !self.is_enabled() {
            self.stats.lock().dropped_disabled += 1;
            return false;
        }

        let (_guard, depth) = DepthGuard::enter();
        if depth >= self.max_depth.load(Ordering::SeqCst) {
            warn!(
                "Dispatch dropped, nesting too deep: event_id={}, type={}, depth={}",
                event.id(),
                event.event_type(),
                depth
            );
            self.stats.lock().dropped_too_deep += 1;
            return false;
        }

        if self.breakers.is_open(GLOBAL_SCOPE) {
            warn!(
                "Dispatch dropped, circuit open: event_id={}, type={}, source={}",
                event.id(),
                event.event_type(),
                event.source()
            );
            self.stats.lock().dropped_circuit_open += 1;
            return false;
        }

        if self.throttles.is_throttled(GLOBAL_SCOPE) {
            warn!(
                "Dispatch dropped, throttled: event_id={}, type={}, source={}",
                event.id(),
                event.event_type(),
                event.source()
            );
            self.stats.lock().dropped_throttled += 1;
            return false;
        }
        self.throttles.increment(GLOBAL_SCOPE);
        self.stats.lock().dispatched += 1;

        if let Err(e) = self.store.insert_event(event) {
            error!(
                "Failed to persist event: event_id={}, error={}",
                event.id(),
                e
            );
            self.stats.lock().persist_failures += 1;
        }

        let entries: Vec<HandlerEntry> = self
            .handlers
            .read()
            .get(&event.event_type())
            .cloned()
            .unwrap_or_default();

        let mut handled = false;
        for entry in entries {
            match self.invoke(&entry, event) {
                Ok(true) => handled = true,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        "Handler failed: handler={}, event_id={}, type={}, error={}",
                        entry.handler.name(),
                        event.id(),
                        event.event_type(),
                        e
                    );
                    self.stats.lock().handler_failures += 1;
                    self.breakers.increment_trip_count(GLOBAL_SCOPE);
                }
            }
        }

        if handled {
            self.stats.lock().handled += 1;
        }
        handled
    }

    fn invoke(&self, entry: &HandlerEntry, event: &MonitoringEvent) -> HandlerResult {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if entry.handler.can_handle(event) {
                entry.handler.handle(event, self)
            } else {
                Ok(false)
            }
        }));
        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(HandlerError::Panicked(reason))
            }
        }
    }

    pub fn is_circuit_open(&self, scope: &str) -> bool {
        self.breakers.is_open(scope)
    }

    pub fn trip_circuit(&self, scope: &str) {
        self.breakers.trip(scope);
    }

    pub fn reset_circuit(&self, scope: &str) {
        self.breakers.reset(scope);
    }

    pub fn increment_trip_count(&self, scope: &str) -> u32 {
        self.breakers.increment_trip_count(scope)
    }

    pub fn circuit_state(&self, scope: &str) -> CircuitBreaker {
        self.breakers.state(scope)
    }

    pub fn is_throttled(&self, scope: &str) -> bool {
        self.throttles.is_throttled(scope)
    }

    pub fn increment_throttle(&self, scope: &str) -> u64 {
        self.throttles.increment(scope)
    }

    pub fn throttle_state(&self, scope: &str) -> ThrottleWindow {
        self.throttles.state(scope)
    }

    pub fn stats(&self) -> BusStats {
        self.stats.lock().clone()
    }

    /// Most recent events first.
    pub fn get_events(&self, query: &EventQuery) -> WardenResult<Vec<MonitoringEvent>> {
        self.store.get_events(query)
    }

    pub fn get_event_counts(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> WardenResult<HashMap<EventType, u64>> {
        self.store.event_counts(since)
    }

    pub fn get_baseline(
        &self,
        metric_name: &str,
        metric_context: &str,
    ) -> WardenResult<Option<Baseline>> {
        self.store
            .get_baseline(&BaselineKey::new(metric_name, metric_context))
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("enabled", &self.is_enabled())
            .field("components", &self.component_names())
            .field("stats", &self.stats())
            .finish()
    }
}
