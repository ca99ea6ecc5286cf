//! Conflict detection.
//!
//! Conflicts between host components are never observed directly. They are
//! inferred from three kinds of side effect: a metric regressing past its
//! baseline in a way a known pattern describes, an error message matching a
//! known signature, or a significant before/after diff around a component
//! activation. Each inference is emitted as a `conflict` event at high priority.

use crate::baseline::{BaselineEngine, Diff};
use crate::bus::{Component, EventBus, EventHandler};
use crate::config::{ConflictConfig, Direction, ErrorPattern, PerformancePattern};
use crate::error::{HandlerError, HandlerResult, WardenError, WardenResult};
use crate::event::{EventData, EventType, MonitoringEvent, Priority};
use log::{debug, info, warn};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub const COMPONENT_NAME: &str = "conflict_detector";

#[derive(Debug, Clone)]
struct CompiledErrorPattern {
    name: String,
    regex: Regex,
    plugins: Vec<(String, String)>,
}

fn compile(pattern: &ErrorPattern) -> WardenResult<CompiledErrorPattern> {
    let regex = Regex::new(&pattern.pattern).map_err(|e| WardenError::InvalidPattern {
        pattern: pattern.pattern.clone(),
        reason: e.to_string(),
    })?;
    Ok(CompiledErrorPattern {
        name: pattern.name.clone(),
        regex,
        plugins: pattern.plugins.clone(),
    })
}

/// Compiles every error pattern, skipping (and logging) the invalid ones.
fn compile_all(patterns: &[ErrorPattern]) -> Vec<CompiledErrorPattern> {
    patterns
        .iter()
        .filter_map(|pattern| match compile(pattern) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                warn!("Skipping error pattern: name={}, error={}", pattern.name, e);
                None
            }
        })
        .collect()
}

fn percent_change(baseline: f64, value: f64) -> f64 {
    if baseline == 0.0 {
        if value > 0.0 { 100.0 } else { 0.0 }
    } else {
        (value - baseline) / baseline * 100.0
    }
}

fn pattern_matches(pattern: &PerformancePattern, metric: &str, change_percent: f64) -> bool {
    if pattern.metric != metric {
        return false;
    }
    match pattern.direction {
        Direction::Increase => change_percent >= pattern.threshold_percent,
        Direction::Decrease => -change_percent >= pattern.threshold_percent,
    }
}

fn plugin_pairs(pairs: &[(String, String)]) -> Vec<Value> {
    pairs.iter().map(|(a, b)| json!([a, b])).collect()
}

#[derive(Debug)]
struct DetectorInner {
    config: RwLock<ConflictConfig>,
    error_patterns: RwLock<Vec<CompiledErrorPattern>>,
    baseline: BaselineEngine,
    bus: RwLock<Weak<EventBus>>,
    detected: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    inner: Arc<DetectorInner>,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig, baseline: BaselineEngine) -> Self {
        let error_patterns = compile_all(&config.error_patterns);
        Self {
            inner: Arc::new(DetectorInner {
                config: RwLock::new(config),
                error_patterns: RwLock::new(error_patterns),
                baseline,
                bus: RwLock::new(Weak::new()),
                detected: AtomicU64::new(0),
            }),
        }
    }

    /// Gives the activation hooks a bus to emit on outside of a dispatch.
    pub fn attach(&self, bus: &Arc<EventBus>) {
        *self.inner.bus.write() = Arc::downgrade(bus);
    }

    pub fn config(&self) -> ConflictConfig {
        self.inner.config.read().clone()
    }

    pub fn conflicts_detected(&self) -> u64 {
        self.inner.detected.load(Ordering::Relaxed)
    }

    fn report(
        &self,
        bus: &EventBus,
        context: &str,
        message: String,
        data: EventData,
    ) -> bool {
        self.inner.detected.fetch_add(1, Ordering::Relaxed);
        info!("Conflict detected: context={}, {}", context, message);
        bus.emit(
            EventType::Conflict,
            COMPONENT_NAME,
            context,
            message,
            data,
            Priority::HIGH.into(),
        );
        true
    }

    fn check_performance(&self, event: &MonitoringEvent, bus: &EventBus) -> HandlerResult {
        let Some(metric) = event.data_str("metric_name") else {
            return Ok(false);
        };
        let value = event
            .data_f64("metric_value")
            .ok_or_else(|| HandlerError::MissingField("metric_value".to_string()))?;
        let context = event.context();

        let threshold = self.inner.config.read().deviation_threshold;
        if !self
            .inner
            .baseline
            .is_significant_deviation(metric, context, value, threshold)
        {
            return Ok(false);
        }
        let Some(baseline) = self.inner.baseline.get_baseline(metric, context)? else {
            return Ok(false);
        };

        let change = percent_change(baseline.value, value);
        let matched: Vec<PerformancePattern> = self
            .inner
            .config
            .read()
            .performance_patterns
            .iter()
            .filter(|pattern| pattern_matches(pattern, metric, change))
            .cloned()
            .collect();
        if matched.is_empty() {
            debug!(
                "Deviation without known pattern: metric={}, context={}, change={:.1}%",
                metric, context, change
            );
            return Ok(false);
        }

        let plugins: Vec<Value> = matched
            .iter()
            .flat_map(|pattern| plugin_pairs(&pattern.plugins))
            .collect();
        let mut data = EventData::new();
        data.insert("metric_name".to_string(), json!(metric));
        data.insert("metric_context".to_string(), json!(context));
        data.insert("baseline".to_string(), json!(baseline.value));
        data.insert("value".to_string(), json!(value));
        data.insert("delta".to_string(), json!(value - baseline.value));
        data.insert("delta_percent".to_string(), json!(change));
        data.insert(
            "patterns".to_string(),
            json!(matched.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()),
        );
        data.insert("plugins".to_string(), Value::Array(plugins));

        let message = format!(
            "{} in {} moved {:.1}% from baseline {:.3}",
            metric, context, change, baseline.value
        );
        Ok(self.report(bus, "performance", message, data))
    }

    fn check_errors(&self, event: &MonitoringEvent, bus: &EventBus) -> HandlerResult {
        let matched: Vec<CompiledErrorPattern> = self
            .inner
            .error_patterns
            .read()
            .iter()
            .filter(|pattern| pattern.regex.is_match(event.message()))
            .cloned()
            .collect();
        if matched.is_empty() {
            return Ok(false);
        }

        let plugins: Vec<Value> = matched
            .iter()
            .flat_map(|pattern| plugin_pairs(&pattern.plugins))
            .collect();
        let mut data = EventData::new();
        data.insert("original_event".to_string(), json!(event.id().to_string()));
        data.insert("original_source".to_string(), json!(event.source()));
        data.insert("error_message".to_string(), json!(event.message()));
        data.insert(
            "patterns".to_string(),
            json!(matched.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()),
        );
        data.insert("plugins".to_string(), Value::Array(plugins));

        let message = format!(
            "Error signature matched from {}: {}",
            event.source(),
            matched
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(self.report(bus, "error_pattern", message, data))
    }

    /// Takes the `before_{plugin}` snapshot. Call right before activating `plugin`.
    pub fn before_activation(&self, plugin: &str) {
        self.inner.baseline.snapshot_before(plugin);
    }

    /// Takes the `after_{plugin}` snapshot and reports a conflict when the
    /// activation changed any metric significantly.
    pub fn after_activation(&self, plugin: &str) -> Diff {
        self.inner.baseline.snapshot_after(plugin);
        let diff = self
            .inner
            .baseline
            .diff(&format!("before_{}", plugin), &format!("after_{}", plugin));
        if diff.is_empty() {
            return diff;
        }

        let Some(bus) = self.inner.bus.read().upgrade() else {
            warn!(
                "Activation diff not reported, no bus attached: plugin={}",
                plugin
            );
            return diff;
        };
        let mut data = EventData::new();
        data.insert("plugin".to_string(), json!(plugin));
        data.insert(
            "diff".to_string(),
            serde_json::to_value(&diff).unwrap_or(Value::Null),
        );
        let metrics: Vec<&str> = diff.metrics.keys().map(String::as_str).collect();
        let message = format!(
            "Activating {} changed {}",
            plugin,
            metrics.join(", ")
        );
        self.report(&bus, "plugin_activation", message, data);
        diff
    }
}

impl EventHandler for ConflictDetector {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    fn priority(&self) -> Priority {
        Priority::HIGH
    }

    fn handled_types(&self) -> Vec<EventType> {
        vec![EventType::Performance, EventType::Error, EventType::Warning]
    }

    fn can_handle(&self, event: &MonitoringEvent) -> bool {
        match event.event_type() {
            EventType::Performance => event.data().contains_key("metric_name"),
            EventType::Error | EventType::Warning => event.source() != COMPONENT_NAME,
            _ => false,
        }
    }

    fn handle(&self, event: &MonitoringEvent, bus: &EventBus) -> HandlerResult {
        self.process_event(event, bus)
    }
}

impl Component for ConflictDetector {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    fn init(&self) -> WardenResult<()> {
        debug!(
            "Conflict detector ready: performance_patterns={}, error_patterns={}",
            self.inner.config.read().performance_patterns.len(),
            self.inner.error_patterns.read().len()
        );
        Ok(())
    }

    fn register_handlers(&self, bus: &EventBus) {
        bus.register_handler(Arc::new(self.clone()));
    }

    fn process_event(&self, event: &MonitoringEvent, bus: &EventBus) -> HandlerResult {
        match event.event_type() {
            EventType::Performance => self.check_performance(event, bus),
            EventType::Error | EventType::Warning => self.check_errors(event, bus),
            _ => Ok(false),
        }
    }

    fn get_status(&self) -> Value {
        json!({
            "conflicts_detected": self.conflicts_detected(),
            "performance_patterns": self.inner.config.read().performance_patterns.len(),
            "error_patterns": self.inner.error_patterns.read().len(),
        })
    }

    fn get_config(&self) -> Value {
        serde_json::to_value(self.config()).unwrap_or(Value::Null)
    }

    fn update_config(&self, config: Value) -> WardenResult<()> {
        let config: ConflictConfig = serde_json::from_value(config)?;
        *self.inner.error_patterns.write() = compile_all(&config.error_patterns);
        *self.inner.config.write() = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BaselineConfig, BusConfig};
    use crate::governor::ManualProbe;
    use crate::store::{EventQuery, MemoryStore, MonitorStore};

    struct Fixture {
        bus: Arc<EventBus>,
        store: Arc<MemoryStore>,
        probe: Arc<ManualProbe>,
        baseline: BaselineEngine,
        detector: ConflictDetector,
    }

    fn fixture(config: ConflictConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let probe = Arc::new(ManualProbe::new());
        let bus = Arc::new(EventBus::new(BusConfig::default(), store.clone(), clock.clone()));
        let baseline = BaselineEngine::new(
            BaselineConfig::default(),
            store.clone(),
            probe.clone(),
            clock,
        );
        let detector = ConflictDetector::new(config, baseline.clone());
        detector.attach(&bus);
        bus.register_component(COMPONENT_NAME, Arc::new(detector.clone()))
            .unwrap();
        Fixture {
            bus,
            store,
            probe,
            baseline,
            detector,
        }
    }

    fn conflicts(store: &MemoryStore) -> Vec<MonitoringEvent> {
        store
            .get_events(&EventQuery::new().with_type(EventType::Conflict))
            .unwrap()
    }

    fn performance(metric: &str, context: &str, value: f64) -> EventData {
        let mut data = EventData::new();
        data.insert("metric_name".to_string(), json!(metric));
        data.insert("metric_value".to_string(), json!(value));
        data.insert("context".to_string(), json!(context));
        data
    }

    #[test]
    fn test_performance_regression_matching_pattern() {
        let f = fixture(ConflictConfig::default());
        for _ in 0..5 {
            f.baseline
                .record_metric("task_duration", "import", 100.0, None)
                .unwrap();
        }

        assert!(f.bus.emit(
            EventType::Performance,
            "tasks",
            "import",
            "import finished",
            performance("task_duration", "import", 400.0),
            50,
        ));

        let found = conflicts(&f.store);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].priority(), Priority::HIGH);
        assert_eq!(found[0].data_str("metric_name"), Some("task_duration"));
        let delta = found[0].data_f64("delta").unwrap();
        assert!((delta - 300.0).abs() < 1e-9);
        assert_eq!(found[0].data()["plugins"], json!([["object-cache", "page-cache"]]));
        assert_eq!(f.detector.conflicts_detected(), 1);
    }

    #[test]
    fn test_no_conflict_without_enough_samples_or_pattern() {
        let f = fixture(ConflictConfig::default());
        for _ in 0..4 {
            f.baseline.record_metric("task_duration", "import", 100.0, None).unwrap();
        }
        f.bus.emit(
            EventType::Performance,
            "tasks",
            "import",
            "slow",
            performance("task_duration", "import", 1000.0),
            50,
        );
        assert!(conflicts(&f.store).is_empty());

        // a 60% increase deviates but the duration pattern needs 100%
        f.baseline.record_metric("task_duration", "import", 100.0, None).unwrap();
        f.bus.emit(
            EventType::Performance,
            "tasks",
            "import",
            "slow",
            performance("task_duration", "import", 160.0),
            50,
        );
        assert!(conflicts(&f.store).is_empty());
    }

    #[test]
    fn test_error_signature_match() {
        let f = fixture(ConflictConfig::default());
        f.bus.emit(
            EventType::Error,
            "host",
            "php",
            "Fatal: Allowed memory size of 134217728 bytes exhausted",
            EventData::new(),
            80,
        );
        f.bus.emit(EventType::Warning, "host", "php", "all good", EventData::new(), 50);

        let found = conflicts(&f.store);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].context(), "error_pattern");
        assert_eq!(found[0].data()["patterns"], json!(["memory_exhausted"]));
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let mut config = ConflictConfig::default();
        config.error_patterns.push(ErrorPattern {
            name: "broken".to_string(),
            pattern: "(unclosed".to_string(),
            plugins: Vec::new(),
        });
        let f = fixture(config);
        assert_eq!(Component::get_status(&f.detector)["error_patterns"], json!(3));
    }

    #[test]
    fn test_activation_diff_reports_conflict() {
        let f = fixture(ConflictConfig::default());
        f.probe.set_memory_usage(1000);
        f.detector.before_activation("seo");
        f.probe.set_memory_usage(2000);
        let diff = f.detector.after_activation("seo");

        assert!(diff.get("memory_usage").is_some());
        let found = conflicts(&f.store);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].context(), "plugin_activation");
        assert_eq!(found[0].data_str("plugin"), Some("seo"));

        f.detector.before_activation("quiet");
        assert!(f.detector.after_activation("quiet").is_empty());
        assert_eq!(conflicts(&f.store).len(), 1);
    }
}
