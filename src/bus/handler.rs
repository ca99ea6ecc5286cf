//! Handler and component contracts.

use super::EventBus;
use crate::error::{HandlerResult, WardenResult};
use crate::event::{EventType, MonitoringEvent, Priority};
use serde_json::Value;

/// Something that reacts to dispatched events.
///
/// Handlers for a type run in descending [`Priority`]; equal priorities run in
/// registration order. The bus passed to [`EventHandler::handle`] may be used to
/// emit follow-up events.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> Priority;

    fn handled_types(&self) -> Vec<EventType>;

    fn can_handle(&self, _event: &MonitoringEvent) -> bool {
        true
    }

    fn handle(&self, event: &MonitoringEvent, bus: &EventBus) -> HandlerResult;
}

/// A long-lived part of the monitoring core registered by name.
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self) -> WardenResult<()>;

    /// Registers this component's handlers on `bus`.
    fn register_handlers(&self, bus: &EventBus);

    fn process_event(&self, event: &MonitoringEvent, bus: &EventBus) -> HandlerResult;

    fn get_status(&self) -> Value;

    fn get_config(&self) -> Value;

    fn update_config(&self, config: Value) -> WardenResult<()>;
}

type Callback = dyn Fn(&MonitoringEvent) -> HandlerResult + Send + Sync;

/// Adapter for bare `(event_type, callback)` registrations.
pub struct CallbackHandler {
    name: String,
    event_type: EventType,
    priority: Priority,
    callback: Box<Callback>,
}

impl CallbackHandler {
    pub fn new<F>(event_type: EventType, priority: Priority, callback: F) -> Self
    where
        F: Fn(&MonitoringEvent) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            name: format!("callback:{}", event_type),
            event_type,
            priority,
            callback: Box::new(callback),
        }
    }
}

impl EventHandler for CallbackHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn handled_types(&self) -> Vec<EventType> {
        vec![self.event_type]
    }

    fn handle(&self, event: &MonitoringEvent, _bus: &EventBus) -> HandlerResult {
        (self.callback)(event)
    }
}
