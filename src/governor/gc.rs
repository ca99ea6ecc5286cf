//! Memory reclamation.
//!
//! Rust has no collector to poke, so "garbage collection" here means asking every
//! registered [`Reclaimer`] to drop what it can (expired cache entries, buffers),
//! cycle after cycle, until a cycle stops paying off.

use super::probe::SystemProbe;
use log::{debug, info};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// A cache or pool that can release memory on demand.
pub trait Reclaimer: Send + Sync {
    fn name(&self) -> &str;

    /// Releases what can be released; returns an estimate of bytes freed.
    fn reclaim(&self) -> u64;
}

impl fmt::Debug for dyn Reclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reclaimer({})", self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GcReport {
    pub skipped: bool,
    pub forced: bool,
    pub cycles: u32,
    pub bytes_freed: u64,
    pub memory_before: u64,
    pub memory_after: u64,
}

impl GcReport {
    pub fn skipped(memory: u64) -> Self {
        Self {
            skipped: true,
            memory_before: memory,
            memory_after: memory,
            ..Self::default()
        }
    }
}

/// Runs up to `max_cycles` reclamation cycles, stopping after the first cycle that
/// frees less than `min_freed` bytes.
pub(crate) fn run_cycles(
    probe: &dyn SystemProbe,
    reclaimers: &[Arc<dyn Reclaimer>],
    max_cycles: u32,
    min_freed: u64,
    forced: bool,
) -> GcReport {
    let memory_before = probe.memory_usage();
    let mut report = GcReport {
        forced,
        memory_before,
        ..GcReport::default()
    };

    for cycle in 1..=max_cycles {
        let before = probe.memory_usage();
        let reported: u64 = reclaimers.iter().map(|r| r.reclaim()).sum();
        let measured = before.saturating_sub(probe.memory_usage());
        let freed = measured.max(reported);

        report.cycles = cycle;
        report.bytes_freed += freed;
        debug!("GC cycle: cycle={}, freed={} bytes", cycle, freed);

        if freed < min_freed {
            break;
        }
    }

    report.memory_after = probe.memory_usage();
    info!(
        "GC finished: cycles={}, freed={} bytes, forced={}",
        report.cycles, report.bytes_freed, forced
    );
    report
}
