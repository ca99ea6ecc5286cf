//! System measurements consumed by the governor and the baseline snapshots.

use parking_lot::{Mutex, RwLock};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Point-in-time readings of the host process.
pub trait SystemProbe: Send + Sync + Debug {
    /// Resident memory of the process in bytes.
    fn memory_usage(&self) -> u64;

    /// Highest `memory_usage` observed so far.
    fn memory_peak(&self) -> u64;

    /// Load normalised by core count; 1.0 means every core is busy.
    fn cpu_load(&self) -> f64;

    /// Database operations issued by the host since startup.
    fn db_queries(&self) -> u64;

    /// Names of the host components currently active.
    fn active_components(&self) -> Vec<String>;
}

/// Probe backed by the `sysinfo` crate. Query counts and the active component
/// set are fed by the host.
#[derive(Debug)]
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    peak: AtomicU64,
    queries: AtomicU64,
    components: RwLock<Vec<String>>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
            peak: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            components: RwLock::new(Vec::new()),
        }
    }

    pub fn record_queries(&self, count: u64) {
        self.queries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_active_components(&self, components: Vec<String>) {
        *self.components.write() = components;
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn memory_usage(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let usage = system.process(pid).map(|p| p.memory()).unwrap_or(0);
        self.peak.fetch_max(usage, Ordering::Relaxed);
        usage
    }

    fn memory_peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed).max(self.memory_usage())
    }

    fn cpu_load(&self) -> f64 {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        System::load_average().one / cores as f64
    }

    fn db_queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn active_components(&self) -> Vec<String> {
        self.components.read().clone()
    }
}

/// A probe whose readings are set explicitly.
#[derive(Debug, Default)]
pub struct ManualProbe {
    memory: AtomicU64,
    peak: AtomicU64,
    cpu_bits: AtomicU64,
    queries: AtomicU64,
    components: RwLock<Vec<String>>,
}

impl ManualProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_memory_usage(&self, bytes: u64) {
        self.memory.store(bytes, Ordering::SeqCst);
        self.peak.fetch_max(bytes, Ordering::SeqCst);
    }

    pub fn set_cpu_load(&self, load: f64) {
        self.cpu_bits.store(load.to_bits(), Ordering::SeqCst);
    }

    pub fn set_db_queries(&self, count: u64) {
        self.queries.store(count, Ordering::SeqCst);
    }

    pub fn add_db_queries(&self, count: u64) {
        self.queries.fetch_add(count, Ordering::SeqCst);
    }

    pub fn set_active_components(&self, components: Vec<String>) {
        *self.components.write() = components;
    }
}

impl SystemProbe for ManualProbe {
    fn memory_usage(&self) -> u64 {
        self.memory.load(Ordering::SeqCst)
    }

    fn memory_peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    fn cpu_load(&self) -> f64 {
        f64::from_bits(self.cpu_bits.load(Ordering::SeqCst))
    }

    fn db_queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    fn active_components(&self) -> Vec<String> {
        self.components.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_probe_tracks_peak() {
        let probe = ManualProbe::new();
        probe.set_memory_usage(300);
        probe.set_memory_usage(100);
        assert_eq!(probe.memory_usage(), 100);
        assert_eq!(probe.memory_peak(), 300);
        assert_eq!(probe.cpu_load(), 0.0);
    }

    #[test]
    fn test_sysinfo_probe_reads_current_process() {
        let probe = SysinfoProbe::new();
        probe.record_queries(3);
        assert_eq!(probe.db_queries(), 3);
        assert!(probe.cpu_load() >= 0.0);
        let usage = probe.memory_usage();
        assert!(probe.memory_peak() >= usage);
        #[cfg(target_os = "linux")]
        assert!(usage > 0);
    }
}
