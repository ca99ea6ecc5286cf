//! Named circuit breakers.
//!
//! A breaker counts failures per scope. Once the count reaches the threshold the
//! breaker trips (opens) and the bus stops dispatching for that scope. An open
//! breaker closes again by itself once `reset_after` has elapsed since the trip.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

pub const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreaker {
    pub tripped: bool,
    pub trip_count: u32,
    pub last_trip: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_secs")]
    pub reset_after: Duration,
}

fn serialize_secs<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(duration.num_seconds())
}

impl CircuitBreaker {
    fn closed(reset_after: Duration) -> Self {
        Self {
            tripped: false,
            trip_count: 0,
            last_trip: None,
            reset_after,
        }
    }

    fn cooled_down(&self, now: DateTime<Utc>) -> bool {
        self.last_trip
            .is_some_and(|last_trip| now - last_trip > self.reset_after)
    }
}

#[derive(Debug)]
struct Settings {
    threshold: u32,
    reset_after: Duration,
}

/// Process-local breaker registry. Scopes are created lazily with the same
/// defaults; `global` exists from the start.
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    settings: Mutex<Settings>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakers {
    pub fn new(threshold: u32, reset_after_secs: u64, clock: Arc<dyn Clock>) -> Self {
        let reset_after = Duration::seconds(reset_after_secs as i64);
        let mut breakers = HashMap::new();
        breakers.insert(GLOBAL_SCOPE.to_string(), CircuitBreaker::closed(reset_after));
        Self {
            breakers: Mutex::new(breakers),
            settings: Mutex::new(Settings {
                threshold,
                reset_after,
            }),
            clock,
        }
    }

    /// Applies new settings to future trips and to every existing scope.
    pub fn configure(&self, threshold: u32, reset_after_secs: u64) {
        let reset_after = Duration::seconds(reset_after_secs as i64);
        {
            let mut settings = self.settings.lock();
            settings.threshold = threshold;
            settings.reset_after = reset_after;
        }
        for breaker in self.breakers.lock().values_mut() {
            breaker.reset_after = reset_after;
        }
    }

    fn with_breaker<T>(&self, scope: &str, f: impl FnOnce(&mut CircuitBreaker, u32) -> T) -> T {
        let (threshold, reset_after) = {
            let settings = self.settings.lock();
            (settings.threshold, settings.reset_after)
        };
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(scope.to_string())
            .or_insert_with(|| CircuitBreaker::closed(reset_after));
        f(breaker, threshold)
    }

    /// True while the breaker is tripped and its cooldown has not elapsed. An
    /// expired trip is closed here, clearing the trip count.
    pub fn is_open(&self, scope: &str) -> bool {
        let now = self.clock.now();
        self.with_breaker(scope, |breaker, _| {
            if breaker.tripped && breaker.cooled_down(now) {
                info!("Circuit breaker auto-reset: scope={}", scope);
                *breaker = CircuitBreaker::closed(breaker.reset_after);
            }
            breaker.tripped
        })
    }

    pub fn trip(&self, scope: &str) {
        let now = self.clock.now();
        self.with_breaker(scope, |breaker, _| {
            breaker.tripped = true;
            breaker.last_trip = Some(now);
        });
        warn!("Circuit breaker tripped: scope={}", scope);
    }

    pub fn reset(&self, scope: &str) {
        self.with_breaker(scope, |breaker, _| {
            *breaker = CircuitBreaker::closed(breaker.reset_after);
        });
    }

    /// Records one failure; trips the breaker when the count reaches the threshold.
    /// Returns the new count.
    pub fn increment_trip_count(&self, scope: &str) -> u32 {
        let now = self.clock.now();
        let (count, tripped_now) = self.with_breaker(scope, |breaker, threshold| {
            breaker.trip_count += 1;
            let trip = !breaker.tripped && breaker.trip_count >= threshold;
            if trip {
                breaker.tripped = true;
                breaker.last_trip = Some(now);
            }
            (breaker.trip_count, trip)
        });
        if tripped_now {
            warn!(
                "Circuit breaker tripped: scope={}, trip_count={}",
                scope, count
            );
        }
        count
    }

    pub fn state(&self, scope: &str) -> CircuitBreaker {
        self.with_breaker(scope, |breaker, _| breaker.clone())
    }

    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.breakers.lock().keys().cloned().collect();
        scopes.sort();
        scopes
    }
}
