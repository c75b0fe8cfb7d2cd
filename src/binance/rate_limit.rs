// =============================================================================
// Rate-Limit Tracker — keeps trade replay under the Binance request weight
// =============================================================================
//
// Binance caps request weight at 1200 per minute per IP; we hard-cap ourselves
// at 1000 so a burst of replaying sessions cannot get the IP banned. The
// tracker reads `X-MBX-USED-WEIGHT-1M` after every response and keeps an
// atomic counter any task may query lock-free.
// =============================================================================

use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

#[derive(Default)]
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh the weight counter from Binance response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(used_weight = w, hard_limit = WEIGHT_HARD_LIMIT, "rate-limit weight crossed warning threshold");
        }
        debug!(used_weight_1m = w, "rate-limit weight updated from header");
    }

    /// Return `true` if `weight` more request weight stays under the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked, would exceed rate-limit"
            );
        }
        allowed
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            hard_limit: WEIGHT_HARD_LIMIT,
        }
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .finish()
    }
}
