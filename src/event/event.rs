//! Module for the [`MonitoringEvent`] struct.
//!
//! # Example
//! ```
//! use warden::event::{EventData, EventType, MonitoringEvent, Priority};
//!
//! let event = MonitoringEvent::new("bogus", "scheduler", "cron", "tick", EventData::new(), 250);
//! assert_eq!(event.event_type(), EventType::Info);
//! assert_eq!(event.priority(), Priority::CRITICAL);
//! ```

use crate::error::{WardenError, WardenResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Arbitrary key/value payload carried by an event.
pub type EventData = Map<String, Value>;

/// The closed set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Info,
    Warning,
    Error,
    Critical,
    Performance,
    Security,
    Conflict,
    Health,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::Info,
        EventType::Warning,
        EventType::Error,
        EventType::Critical,
        EventType::Performance,
        EventType::Security,
        EventType::Conflict,
        EventType::Health,
    ];

    /// Lenient parse: anything unrecognised is `Info`.
    pub fn parse(raw: &str) -> EventType {
        match raw.trim().to_ascii_lowercase().as_str() {
            "warning" => EventType::Warning,
            "error" => EventType::Error,
            "critical" => EventType::Critical,
            "performance" => EventType::Performance,
            "security" => EventType::Security,
            "conflict" => EventType::Conflict,
            "health" => EventType::Health,
            _ => EventType::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Info => "info",
            EventType::Warning => "warning",
            EventType::Error => "error",
            EventType::Critical => "critical",
            EventType::Performance => "performance",
            EventType::Security => "security",
            EventType::Conflict => "conflict",
            EventType::Health => "health",
        }
    }
}

impl From<&str> for EventType {
    fn from(raw: &str) -> Self {
        EventType::parse(raw)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event priority in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Priority = Priority(10);
    pub const NORMAL: Priority = Priority(50);
    pub const HIGH: Priority = Priority(80);
    pub const CRITICAL: Priority = Priority(100);

    /// Normalises a raw priority: negative values fall back to `LOW`, values
    /// above 100 are capped at `CRITICAL`.
    pub const fn new(raw: i64) -> Priority {
        if raw < 0 {
            Priority::LOW
        } else if raw > 100 {
            Priority::CRITICAL
        } else {
            Priority(raw as u8)
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl From<Priority> for i64 {
    fn from(priority: Priority) -> Self {
        priority.0 as i64
    }
}

/// An immutable monitoring event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringEvent {
    id: Uuid,
    #[serde(rename = "type")]
    event_type: EventType,
    priority: Priority,
    source: String,
    context: String,
    message: String,
    data: EventData,
    timestamp: DateTime<Utc>,
}

impl MonitoringEvent {
    /// Creates a new event with a fresh id and the current timestamp.
    pub fn new(
        event_type: impl Into<EventType>,
        source: impl Into<String>,
        context: impl Into<String>,
        message: impl Into<String>,
        data: EventData,
        priority: i64,
    ) -> Self {
        Self::at(event_type, source, context, message, data, priority, Utc::now())
    }

    /// Same as [`MonitoringEvent::new`] with an explicit creation instant.
    pub fn at(
        event_type: impl Into<EventType>,
        source: impl Into<String>,
        context: impl Into<String>,
        message: impl Into<String>,
        data: EventData,
        priority: i64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            priority: Priority::new(priority),
            source: source.into(),
            context: context.into(),
            message: message.into(),
            data,
            timestamp,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Numeric payload field, if present and numeric.
    pub fn data_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }

    /// String payload field, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Flat JSON object form used for persistence.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.to_string()));
        map.insert("type".to_string(), Value::String(self.event_type.to_string()));
        map.insert("priority".to_string(), Value::from(self.priority.value()));
        map.insert("source".to_string(), Value::String(self.source.clone()));
        map.insert("context".to_string(), Value::String(self.context.clone()));
        map.insert("message".to_string(), Value::String(self.message.clone()));
        map.insert("data".to_string(), Value::Object(self.data.clone()));
        map.insert(
            "timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        Value::Object(map)
    }

    /// Rehydrates an event persisted with [`MonitoringEvent::to_value`], keeping its
    /// id and timestamp. Type and priority go through the same normalisation as
    /// construction.
    pub fn from_value(value: &Value) -> WardenResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| WardenError::Serialization("event is not an object".to_string()))?;

        let id = map
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| WardenError::Serialization("event id missing".to_string()))
            .and_then(|raw| {
                Uuid::parse_str(raw).map_err(|e| WardenError::Serialization(e.to_string()))
            })?;

        let timestamp = map
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| WardenError::Serialization("event timestamp missing".to_string()))
            .and_then(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| WardenError::Serialization(e.to_string()))
            })?;

        let text = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Ok(Self {
            id,
            event_type: EventType::parse(&text("type")),
            priority: Priority::new(
                map.get("priority")
                    .and_then(Value::as_i64)
                    .unwrap_or(Priority::NORMAL.into()),
            ),
            source: text("source"),
            context: text("context"),
            message: text("message"),
            data: map
                .get("data")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            timestamp,
        })
    }
}

impl fmt::Display for MonitoringEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} p{} {}/{}: {}",
            self.timestamp.to_rfc3339(),
            self.event_type,
            self.priority.value(),
            self.source,
            self.context,
            self.message
        )
    }
}
