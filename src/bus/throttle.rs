//! Fixed-window rate limiting per named scope.
//!
//! Each scope counts increments inside a window. When the window has expired the
//! count drops straight back to zero; there is no gradual decay.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleWindow {
    pub count: u64,
    pub window_start: DateTime<Utc>,
    pub window_size_secs: i64,
    pub limit: u64,
}

impl ThrottleWindow {
    fn roll(&mut self, now: DateTime<Utc>) {
        if now - self.window_start > Duration::seconds(self.window_size_secs) {
            self.count = 0;
            self.window_start = now;
        }
    }
}

#[derive(Debug)]
pub struct Throttles {
    windows: Mutex<HashMap<String, ThrottleWindow>>,
    defaults: Mutex<(u64, i64)>,
    clock: Arc<dyn Clock>,
}

impl Throttles {
    pub fn new(limit: u64, window_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            defaults: Mutex::new((limit, window_secs as i64)),
            clock,
        }
    }

    pub fn configure(&self, limit: u64, window_secs: u64) {
        *self.defaults.lock() = (limit, window_secs as i64);
        for window in self.windows.lock().values_mut() {
            window.limit = limit;
            window.window_size_secs = window_secs as i64;
        }
    }

    fn with_window<T>(&self, scope: &str, f: impl FnOnce(&mut ThrottleWindow) -> T) -> T {
        let now = self.clock.now();
        let (limit, window_size_secs) = *self.defaults.lock();
        let mut windows = self.windows.lock();
        let window = windows
            .entry(scope.to_string())
            .or_insert_with(|| ThrottleWindow {
                count: 0,
                window_start: now,
                window_size_secs,
                limit,
            });
        window.roll(now);
        f(window)
    }

    pub fn is_throttled(&self, scope: &str) -> bool {
        self.with_window(scope, |window| window.count >= window.limit)
    }

    /// Counts one event; returns the count inside the current window.
    pub fn increment(&self, scope: &str) -> u64 {
        self.with_window(scope, |window| {
            window.count += 1;
            window.count
        })
    }

    pub fn state(&self, scope: &str) -> ThrottleWindow {
        self.with_window(scope, |window| window.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_window_fills_then_resets() {
        let clock = Arc::new(ManualClock::default());
        let throttles = Throttles::new(3, 60, clock.clone());

        for _ in 0..3 {
            assert!(!throttles.is_throttled("global"));
            throttles.increment("global");
        }
        assert!(throttles.is_throttled("global"));

        clock.advance(Duration::seconds(60));
        assert!(throttles.is_throttled("global"));

        clock.advance(Duration::seconds(1));
        assert!(!throttles.is_throttled("global"));
        assert_eq!(throttles.state("global").count, 0);
    }

    #[test]
    fn test_scopes_do_not_share_counts() {
        let clock = Arc::new(ManualClock::default());
        let throttles = Throttles::new(1, 60, clock);
        throttles.increment("a");
        assert!(throttles.is_throttled("a"));
        assert!(!throttles.is_throttled("b"));
    }
}
