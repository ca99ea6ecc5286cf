//! # warden
//!
//! Warden is a self-monitoring and resource-governance layer for hosts that run
//! background tasks. It tracks task executions, keeps rolling performance
//! baselines, infers conflicts between host components from their side effects
//! and backs off when the system is under load.
//!
//! ## Features
//!
//! - Event bus with priority-ordered handlers, a circuit breaker and a throttle
//! - Per-tier resource budgets (memory, time, database queries)
//! - Exponential moving average baselines with deviation detection
//! - Before/after snapshots and significance-gated diffs
//! - Pattern-driven conflict detection
//! - Stuck and failed task recovery with bounded retries
//! - In-memory and file-backed stores
//! - CLI host that acts as the periodic scheduler
//!
//! ## Basic Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use warden::prelude::*;
//!
//! let warden = Warden::new(
//!     WardenConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(SysinfoProbe::new()),
//!     Arc::new(SystemClock),
//! )
//! .unwrap();
//!
//! let run = warden
//!     .tasks()
//!     .run_task("import", Tier::Standard, |handle, tracker| {
//!         if !tracker.should_continue(handle) {
//!             return Ok(TaskStatus::Partial);
//!         }
//!         Ok(TaskStatus::Completed)
//!     })
//!     .unwrap();
//! assert_eq!(run.status, TaskStatus::Completed);
//!
//! let report = warden.scheduled_check().unwrap();
//! assert_eq!(report.status, HealthStatus::Ok);
//! ```

pub mod baseline;
pub mod bus;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod error;
pub mod event;
pub mod governor;
pub mod health;
pub mod monitor;
pub mod runtime;
pub mod store;
pub mod tasks;

pub use error::{HandlerError, HandlerResult, WardenError, WardenResult};
pub use runtime::Warden;

/// The types most hosts need.
pub mod prelude {
    pub use crate::baseline::{BaselineEngine, Diff, Snapshot};
    pub use crate::bus::{Component, EventBus, EventHandler};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::WardenConfig;
    pub use crate::conflict::ConflictDetector;
    pub use crate::error::{HandlerError, HandlerResult, WardenError, WardenResult};
    pub use crate::event::{EventData, EventType, MonitoringEvent, Priority};
    pub use crate::governor::{ManualProbe, ResourceGovernor, SysinfoProbe, SystemProbe, Tier};
    pub use crate::health::{HealthChecker, HealthReport, HealthStatus};
    pub use crate::monitor::SelfMonitor;
    pub use crate::runtime::Warden;
    pub use crate::store::{FileStore, MemoryStore, MonitorStore, TaskRun, TaskStatus};
    pub use crate::tasks::{TaskHandle, TaskTracker};
}
