//! Configuration for the monitoring core.
//!
//! [`WardenConfig`] groups one section per component. Every section has defaults,
//! can be loaded from a TOML or JSON file, and a handful of settings can be
//! overridden from the environment at startup.
//!
//! ```
//! use warden::config::WardenConfig;
//!
//! let config = WardenConfig::default();
//! assert_eq!(config.bus.throttle_limit, 1000);
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{WardenError, WardenResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WardenConfig {
    pub bus: BusConfig,
    pub budgets: BudgetConfig,
    pub governor: GovernorConfig,
    pub baseline: BaselineConfig,
    pub conflicts: ConflictConfig,
    pub health: HealthConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub enabled: bool,
    pub breaker_threshold: u32,
    pub breaker_reset_secs: u64,
    pub throttle_limit: u64,
    pub throttle_window_secs: u64,
    pub max_dispatch_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            breaker_threshold: 5,
            breaker_reset_secs: 300,
            throttle_limit: 1000,
            throttle_window_secs: 60,
            max_dispatch_depth: 8,
        }
    }
}

/// Limits applied to a single task run of a given tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceBudget {
    pub memory_bytes: u64,
    pub time_seconds: u64,
    pub db_query_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub critical: ResourceBudget,
    pub standard: ResourceBudget,
    pub intensive: ResourceBudget,
    pub report: ResourceBudget,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            critical: ResourceBudget {
                memory_bytes: 32 * MIB,
                time_seconds: 10,
                db_query_count: 50,
            },
            standard: ResourceBudget {
                memory_bytes: 64 * MIB,
                time_seconds: 30,
                db_query_count: 200,
            },
            intensive: ResourceBudget {
                memory_bytes: 256 * MIB,
                time_seconds: 300,
                db_query_count: 2000,
            },
            report: ResourceBudget {
                memory_bytes: 128 * MIB,
                time_seconds: 120,
                db_query_count: 1000,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GovernorConfig {
    pub memory_limit_bytes: u64,
    pub overload_memory_fraction: f64,
    pub high_traffic_events: u64,
    pub high_traffic_window_secs: u64,
    pub cpu_threshold: f64,
    pub gc_threshold: f64,
    pub gc_cycles: u32,
    pub gc_min_freed_bytes: u64,
    pub gc_force_tasks: Vec<String>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 512 * MIB,
            overload_memory_fraction: 0.9,
            high_traffic_events: 100,
            high_traffic_window_secs: 60,
            cpu_threshold: 0.8,
            gc_threshold: 0.8,
            gc_cycles: 3,
            gc_min_freed_bytes: 10 * 1024,
            gc_force_tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BaselineConfig {
    /// Weight given to a new sample in the moving average.
    pub ema_weight: f64,
    pub deviation_threshold: f64,
    pub min_samples: u64,
    pub snapshot_ttl_secs: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            ema_weight: 0.1,
            deviation_threshold: 0.5,
            min_samples: 5,
            snapshot_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Increase,
    Decrease,
}

/// A known regression signature: a metric moving in one direction by at least
/// `threshold_percent` is attributed to one of `plugins`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformancePattern {
    pub name: String,
    pub metric: String,
    pub direction: Direction,
    pub threshold_percent: f64,
    pub plugins: Vec<(String, String)>,
}

/// A known error signature matched against event messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPattern {
    pub name: String,
    pub pattern: String,
    pub plugins: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConflictConfig {
    pub deviation_threshold: f64,
    pub performance_patterns: Vec<PerformancePattern>,
    pub error_patterns: Vec<ErrorPattern>,
}

fn pair(a: &str, b: &str) -> (String, String) {
    (a.to_string(), b.to_string())
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            deviation_threshold: 0.5,
            performance_patterns: vec![
                PerformancePattern {
                    name: "duration_regression".to_string(),
                    metric: "task_duration".to_string(),
                    direction: Direction::Increase,
                    threshold_percent: 100.0,
                    plugins: vec![pair("object-cache", "page-cache")],
                },
                PerformancePattern {
                    name: "memory_growth".to_string(),
                    metric: "memory_usage".to_string(),
                    direction: Direction::Increase,
                    threshold_percent: 50.0,
                    plugins: vec![pair("image-optimizer", "lazy-loader")],
                },
                PerformancePattern {
                    name: "query_storm".to_string(),
                    metric: "db_queries".to_string(),
                    direction: Direction::Increase,
                    threshold_percent: 100.0,
                    plugins: vec![pair("search-index", "related-content")],
                },
            ],
            error_patterns: vec![
                ErrorPattern {
                    name: "duplicate_symbol".to_string(),
                    pattern: r"(?i)cannot redeclare".to_string(),
                    plugins: vec![pair("object-cache", "page-cache")],
                },
                ErrorPattern {
                    name: "memory_exhausted".to_string(),
                    pattern: r"(?i)allowed memory size of \d+ bytes exhausted".to_string(),
                    plugins: vec![pair("image-optimizer", "lazy-loader")],
                },
                ErrorPattern {
                    name: "execution_timeout".to_string(),
                    pattern: r"(?i)maximum execution time of \d+ seconds exceeded".to_string(),
                    plugins: vec![pair("search-index", "related-content")],
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub stuck_threshold_secs: u64,
    pub recent_failures: usize,
    pub failure_window_secs: u64,
    pub max_recovery_attempts: u32,
    pub retry_delay_secs: u64,
    pub critical_failure_count: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 1800,
            stuck_threshold_secs: 3600,
            recent_failures: 10,
            failure_window_secs: 1800,
            max_recovery_attempts: 3,
            retry_delay_secs: 300,
            critical_failure_count: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    pub event_days: i64,
    pub task_run_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            event_days: 30,
            task_run_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl WardenConfig {
    /// Load a configuration file (by extension) and apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> WardenResult<Self> {
        let mut config = load_config_from_path(path.as_ref())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        use std::env;

        if let Ok(enabled) = env::var("WARDEN_ENABLED") {
            self.bus.enabled = enabled.parse().unwrap_or(self.bus.enabled);
        }

        if let Ok(limit) = env::var("WARDEN_THROTTLE_LIMIT") {
            self.bus.throttle_limit = limit.parse().unwrap_or(self.bus.throttle_limit);
        }

        if let Ok(memory) = env::var("WARDEN_MEMORY_LIMIT_BYTES") {
            self.governor.memory_limit_bytes =
                memory.parse().unwrap_or(self.governor.memory_limit_bytes);
        }

        if let Ok(log_level) = env::var("WARDEN_LOG_LEVEL") {
            self.logging.level = match log_level.to_lowercase().as_str() {
                "trace" => "trace".to_string(),
                "debug" => "debug".to_string(),
                "info" => "info".to_string(),
                "warn" => "warn".to_string(),
                "error" => "error".to_string(),
                _ => self.logging.level.clone(),
            };
        }
    }

    /// Validation with detailed error reporting
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.bus.breaker_threshold == 0 {
            errors.push("Circuit breaker threshold must be at least 1".to_string());
        }
        if self.bus.throttle_limit == 0 {
            errors.push("Throttle limit must be greater than zero".to_string());
        }
        if self.bus.throttle_window_secs == 0 {
            errors.push("Throttle window must be greater than zero".to_string());
        }
        if self.bus.max_dispatch_depth == 0 {
            errors.push("Maximum dispatch depth must be at least 1".to_string());
        }

        if self.governor.memory_limit_bytes == 0 {
            errors.push("Memory limit must be greater than zero".to_string());
        }
        for (name, value) in [
            ("overload_memory_fraction", self.governor.overload_memory_fraction),
            ("gc_threshold", self.governor.gc_threshold),
            ("cpu_threshold", self.governor.cpu_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("Governor {} must be within [0, 1]", name));
            }
        }

        if !(self.baseline.ema_weight > 0.0 && self.baseline.ema_weight <= 1.0) {
            errors.push("Baseline EMA weight must be within (0, 1]".to_string());
        }
        if self.baseline.deviation_threshold <= 0.0 {
            errors.push("Baseline deviation threshold must be positive".to_string());
        }

        for pattern in &self.conflicts.error_patterns {
            if let Err(e) = regex::Regex::new(&pattern.pattern) {
                errors.push(format!("Error pattern '{}' is invalid: {}", pattern.name, e));
            }
        }

        if self.health.max_recovery_attempts == 0 {
            errors.push("Max recovery attempts must be at least 1".to_string());
        }

        if self.retention.event_days <= 0 || self.retention.task_run_days <= 0 {
            errors.push("Retention periods must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load configuration from file path by extension (toml/json)
pub fn load_config_from_path(path: &Path) -> WardenResult<WardenConfig> {
    let content = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase();
    let config = match ext.as_str() {
        "toml" => toml::from_str::<WardenConfig>(&content)?,
        "json" => serde_json::from_str::<WardenConfig>(&content)?,
        _ => {
            return Err(WardenError::Config(format!(
                "Unsupported config extension: {}",
                ext
            )));
        }
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(WardenConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = WardenConfig::default();
        config.bus.throttle_limit = 0;
        config.baseline.ema_weight = 0.0;
        config.conflicts.error_patterns.push(ErrorPattern {
            name: "broken".to_string(),
            pattern: "(".to_string(),
            plugins: Vec::new(),
        });

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("broken")));
    }

    #[test]
    fn test_load_partial_toml_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[bus]\nthrottle_limit = 25\n\n[budgets.critical]").unwrap();
        writeln!(file, "memory_bytes = 1024\ntime_seconds = 5\ndb_query_count = 3").unwrap();

        let config = load_config_from_path(file.path()).unwrap();
        assert_eq!(config.bus.throttle_limit, 25);
        assert_eq!(config.bus.breaker_threshold, 5);
        assert_eq!(config.budgets.critical.time_seconds, 5);
        assert_eq!(config.budgets.standard, BudgetConfig::default().standard);
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"health": {{"max_recovery_attempts": 7}}}}"#).unwrap();

        let config = load_config_from_path(file.path()).unwrap();
        assert_eq!(config.health.max_recovery_attempts, 7);
        assert_eq!(config.health.retry_delay_secs, 300);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(
            load_config_from_path(file.path()),
            Err(WardenError::Config(_))
        ));
    }
}
