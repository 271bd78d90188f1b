// =============================================================================
// Rate-Limit Tracker - paces history pagination against Binance request weight
// =============================================================================
//
// Binance allows 6000 request weight per minute on spot REST (each klines page
// with limit=1000 costs 2). The tracker reads the `X-MBX-USED-WEIGHT-1M`
// response header after every request; the loader asks it whether to back
// off before fetching the next page.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

/// Used weight at which the loader pauses before the next page.
const WEIGHT_PAUSE_THRESHOLD: u32 = 4800;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 3600;
/// How long to wait once the pause threshold is hit.
const PAUSE: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the used weight from a Binance response.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        self.used_weight_1m.store(weight, Ordering::Relaxed);
        if weight >= WEIGHT_WARN_THRESHOLD {
            warn!(used_weight = weight, "Binance request weight high");
        } else {
            debug!(used_weight = weight, "Binance request weight");
        }
    }

    pub fn used_weight(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }

    /// How long to wait before the next request, if at all.
    pub fn backoff(&self) -> Option<Duration> {
        (self.used_weight() >= WEIGHT_PAUSE_THRESHOLD).then_some(PAUSE)
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
    fn tracks_header_weight() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&headers("120"));
        assert_eq!(tracker.used_weight(), 120);
        assert!(tracker.backoff().is_none());
    }

    #[test]
    fn backs_off_near_limit() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&headers("5000"));
        assert_eq!(tracker.backoff(), Some(PAUSE));
    }

    #[test]
    fn ignores_missing_or_garbage_header() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&headers("77"));
        tracker.update_from_headers(&HeaderMap::new());
        tracker.update_from_headers(&headers("lots"));
        assert_eq!(tracker.used_weight(), 77);
    }
}
