// =============================================================================
// Rate-Limit Tracker — monitors futures API usage to avoid 429s
// =============================================================================
//
// The futures API allows 2 400 request weight per minute. The tracker reads the
// `X-MBX-USED-WEIGHT-1M` and `X-MBX-ORDER-COUNT-1M` response headers after every
// request and keeps atomic counters that any task may query lock-free.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Exchange-side weight ceiling per minute.
const WEIGHT_LIMIT_1M: u32 = 2400;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 2000;

/// Thread-safe rate-limit tracker backed by atomic counters.
#[derive(Default)]
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_1m: AtomicU32,
}

/// Immutable snapshot of the current rate-limit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub order_count_1m: u32,
    pub weight_limit_1m: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update counters from the response headers of any exchange call.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(w) = header_u32(headers, "X-MBX-USED-WEIGHT-1M") {
            let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
            if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                warn!(
                    used_weight = w,
                    limit = WEIGHT_LIMIT_1M,
                    "rate-limit weight crossed warning threshold"
                );
            }
            debug!(used_weight_1m = w, "rate-limit weight updated from header");
        }

        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-1M") {
            self.order_count_1m.store(c, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            order_count_1m: self.order_count_1m.load(Ordering::Relaxed),
            weight_limit_1m: WEIGHT_LIMIT_1M,
        }
    }
}

fn header_u32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("order_count_1m", &self.order_count_1m.load(Ordering::Relaxed))
            .finish()
    }
}
