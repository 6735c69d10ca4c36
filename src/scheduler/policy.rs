//! Tunables for the scheduler's placement, preemption, and recovery
//! behavior, loaded from `GG_CTRL_*` environment variables (see
//! `crate::config`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerPolicy {
    /// Minimum priority difference a requester must have over a candidate
    /// victim: `victim.priority < requester.priority - min_priority_gap`.
    pub min_priority_gap: u8,
    /// Maximum models preempted across all decisions in a rolling 1h window.
    pub max_preemptions_per_hour: u32,
    pub recovery_check_interval_s: u64,
    pub max_recovery_attempts: u32,
    pub min_recovery_interval_s: u64,
    pub max_recovery_interval_s: u64,
    pub recovery_backoff_factor: f64,
    /// A RUNNING model not re-confirmed by the scheduler within this window
    /// is eligible for stuck-running detection.
    pub failure_detection_timeout_s: u64,
    /// Bounded ring sizes for in-memory audit history.
    pub decision_history_size: usize,
    pub recovery_history_size: usize,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            min_priority_gap: 1,
            max_preemptions_per_hour: 10,
            recovery_check_interval_s: 60,
            max_recovery_attempts: 3,
            min_recovery_interval_s: 30,
            max_recovery_interval_s: 300,
            recovery_backoff_factor: 2.0,
            failure_detection_timeout_s: 120,
            decision_history_size: 1000,
            recovery_history_size: 500,
        }
    }
}

impl SchedulerPolicy {
    /// Effective wait before the `attempt`-th (0-indexed) recovery attempt,
    /// per `min(min_recovery_interval x backoff_factor^attempt, max_recovery_interval_s)`.
    pub fn recovery_backoff(&self, attempt: u32) -> std::time::Duration {
        let raw = self.min_recovery_interval_s as f64 * self.recovery_backoff_factor.powi(attempt as i32);
        std::time::Duration::from_secs_f64(raw.min(self.max_recovery_interval_s as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_backoff_clamps_to_max() {
        let policy = SchedulerPolicy::default();
        assert_eq!(policy.recovery_backoff(0).as_secs(), 30);
        assert_eq!(policy.recovery_backoff(1).as_secs(), 60);
        assert_eq!(policy.recovery_backoff(10).as_secs(), 300);
    }
}
