//! Monitoring events.
//!
//! A [`MonitoringEvent`] is an immutable record of something a component observed.
//! Construction never fails: an unknown type becomes [`EventType::Info`] and the
//! priority is forced into `0..=100`.

pub mod event;

pub use event::{EventData, EventType, MonitoringEvent, Priority};
