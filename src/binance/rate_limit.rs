// =============================================================================
// Request-Weight Tracker — keeps REST usage under Binance's 1m weight budget
// =============================================================================
//
// Binance allows 1200 request weight per minute per IP.  We hard-cap ourselves
// at 1000.  The tracker reads `X-MBX-USED-WEIGHT-1M` after every response and
// keeps an atomic counter any thread may query lock-free.  Reaching the cap
// makes the REST client fail fast instead of earning a 429 / IP ban.
// =============================================================================

use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

use crate::error::FeedError;

/// Hard ceiling at which we refuse to send additional requests.
pub const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

/// Weight of `GET /api/v3/klines`.
pub const KLINES_WEIGHT: u32 = 2;
/// Weight of `GET /api/v3/exchangeInfo`.
pub const EXCHANGE_INFO_WEIGHT: u32 = 20;

pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
        }
    }

    /// Update the counter from the `X-MBX-USED-WEIGHT-1M` response header.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let prev = self.used_weight_1m.swap(weight, Ordering::Relaxed);
        if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = weight, "rate-limit weight updated from header");
    }

    /// Pre-flight check: `Err(RateLimited)` if spending `weight` would exceed
    /// the hard limit.
    pub fn check(&self, weight: u32) -> Result<(), FeedError> {
        let used = self.used_weight_1m.load(Ordering::Relaxed);
        if used.saturating_add(weight) > WEIGHT_HARD_LIMIT {
            warn!(
                current_weight = used,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked — would exceed rate-limit"
            );
            return Err(FeedError::RateLimited {
                used,
                limit: WEIGHT_HARD_LIMIT,
            });
        }
        Ok(())
    }

    /// Reset the 1-minute weight counter (call from a periodic timer).
    pub fn reset_1m_weight(&self) {
        self.used_weight_1m.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            hard_limit: WEIGHT_HARD_LIMIT,
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers(weight: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_str(weight).unwrap());
        h
    }

    #[test]
    fn header_updates_counter() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&headers("42"));
        assert_eq!(tracker.snapshot().used_weight_1m, 42);
    }

    #[test]
    fn garbage_header_is_ignored() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&headers("7"));
        tracker.update_from_headers(&headers("lots"));
        assert_eq!(tracker.snapshot().used_weight_1m, 7);
    }

    #[test]
    fn check_blocks_at_hard_limit() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&headers("990"));
        assert!(tracker.check(KLINES_WEIGHT).is_ok());
        assert!(matches!(
            tracker.check(EXCHANGE_INFO_WEIGHT),
            Err(FeedError::RateLimited { used: 990, .. })
        ));
        tracker.reset_1m_weight();
        assert!(tracker.check(EXCHANGE_INFO_WEIGHT).is_ok());
    }
}
