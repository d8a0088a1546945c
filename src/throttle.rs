// =============================================================================
// Notification Throttle — per-symbol alert rate limiting
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Source of "now" for time-based decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Bounds how often an alert may be emitted for the same symbol. Symbols are
/// independent of each other; there is no global limit.
pub struct NotificationThrottle {
    interval: Duration,
    clock: Arc<dyn Clock>,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl NotificationThrottle {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            clock,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` and records the current instant iff nothing was sent
    /// for `symbol` within the interval. Returns `false` without side effects
    /// otherwise.
    pub fn should_notify(&self, symbol: &str) -> bool {
        let now = self.clock.now();
        let mut map = self.last_sent.lock();

        if let Some(last) = map.get(symbol) {
            if now.saturating_duration_since(*last) < self.interval {
                debug!(symbol, "alert throttled");
                return false;
            }
        }

        map.insert(symbol.to_string(), now);
        true
    }

    /// Forget `symbol` so its next alert goes out immediately.
    pub fn clear(&self, symbol: &str) {
        if self.last_sent.lock().remove(symbol).is_some() {
            debug!(symbol, "throttle entry cleared");
        }
    }

    /// Drop every entry whose symbol fails `keep`.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.last_sent.lock().retain(|symbol, _| keep(symbol));
    }
}
