//! `TargetState`: one routable model endpoint plus its live traffic counters.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// One backend instance for a model. Counters are atomics so concurrent
/// in-flight requests can update them without a table-wide lock.
pub struct TargetState {
    pub endpoint_url: String,
    pub priority: u8,
    pub weight: u32,
    active: AtomicBool,
    in_flight_count: AtomicU32,
    total_requests: AtomicU64,
    total_response_time_ms: AtomicU64,
    error_count: AtomicU64,
    consecutive_failures: AtomicU32,
}

/// Threshold at which a target is taken out of rotation after repeated
/// transport/5xx failures. C6 restores it on the next healthy probe.
pub const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;

impl TargetState {
    pub fn new(endpoint_url: String, priority: u8, weight: u32) -> Self {
        Self {
            endpoint_url,
            priority,
            weight,
            active: AtomicBool::new(true),
            in_flight_count: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_response_time_ms: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight_count.load(Ordering::Relaxed)
    }

    pub fn begin_request(&self) {
        self.in_flight_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mean_response_time_ms(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed).max(1);
        self.total_response_time_ms.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// Records a completed request and returns whether the target just
    /// crossed the consecutive-failure limit (caller should deactivate it).
    pub fn finish_request(&self, response_time_ms: u64, failed: bool) -> bool {
        self.in_flight_count.fetch_sub(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_ms.fetch_add(response_time_ms, Ordering::Relaxed);
        if failed {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= CONSECUTIVE_FAILURE_LIMIT {
                self.set_active(false);
                return true;
            }
        } else {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deactivates_after_consecutive_failures() {
        let target = TargetState::new("http://x".into(), 5, 1);
        target.begin_request();
        assert!(!target.finish_request(10, true));
        target.begin_request();
        assert!(!target.finish_request(10, true));
        target.begin_request();
        assert!(target.finish_request(10, true));
        assert!(!target.is_active());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let target = TargetState::new("http://x".into(), 5, 1);
        target.begin_request();
        target.finish_request(10, true);
        target.begin_request();
        target.finish_request(10, false);
        target.begin_request();
        target.finish_request(10, true);
        assert!(target.is_active()); // only 1 consecutive failure after the reset
    }
}
