//! Process-level health check support.
//!
//! Distinct from C6's per-model HTTP health loop: this reports on the
//! control plane itself, for orchestrator liveness/readiness probes.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::shutdown::ShutdownState;

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Detailed health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub ready: bool,
    pub accepting_requests: bool,
    pub models_running: usize,
    pub models_error: usize,
    pub active_health_loops: usize,
    pub uptime_secs: u64,
}

/// Health check configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub require_model_running: bool,
    pub max_models_in_error: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            require_model_running: false,
            max_models_in_error: usize::MAX,
        }
    }
}

/// Aggregates health information from the control plane's components.
pub struct HealthChecker {
    config: HealthConfig,
    start_time: Instant,
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            start_time: Instant::now(),
        }
    }

    /// Check liveness: process is responsive.
    pub fn is_alive(&self) -> bool {
        true
    }

    /// Check readiness: accepting traffic.
    pub fn is_ready(&self, shutdown_state: ShutdownState, models_running: usize, models_error: usize) -> bool {
        if shutdown_state != ShutdownState::Running {
            return false;
        }
        if self.config.require_model_running && models_running == 0 {
            return false;
        }
        if models_error > self.config.max_models_in_error {
            return false;
        }
        true
    }

    pub fn report(
        &self,
        shutdown_state: ShutdownState,
        models_running: usize,
        models_error: usize,
        active_health_loops: usize,
    ) -> HealthReport {
        let accepting = shutdown_state == ShutdownState::Running;
        let ready = self.is_ready(shutdown_state, models_running, models_error);
        let state = self.compute_state(shutdown_state, models_running, models_error);

        HealthReport {
            state,
            ready,
            accepting_requests: accepting,
            models_running,
            models_error,
            active_health_loops,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    fn compute_state(&self, shutdown_state: ShutdownState, models_running: usize, models_error: usize) -> HealthState {
        if shutdown_state != ShutdownState::Running {
            return HealthState::Unhealthy;
        }
        if self.config.require_model_running && models_running == 0 {
            return HealthState::Degraded;
        }
        if models_error > self.config.max_models_in_error {
            return HealthState::Degraded;
        }
        HealthState::Healthy
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_when_running_with_no_errors() {
        let checker = HealthChecker::new(HealthConfig::default());
        let report = checker.report(ShutdownState::Running, 3, 0, 3);
        assert_eq!(report.state, HealthState::Healthy);
        assert!(report.ready);
    }

    #[test]
    fn unhealthy_once_draining() {
        let checker = HealthChecker::new(HealthConfig::default());
        let report = checker.report(ShutdownState::Draining, 3, 0, 3);
        assert_eq!(report.state, HealthState::Unhealthy);
        assert!(!report.ready);
    }

    #[test]
    fn degraded_when_error_budget_exceeded() {
        let config = HealthConfig { require_model_running: false, max_models_in_error: 1 };
        let checker = HealthChecker::new(config);
        let report = checker.report(ShutdownState::Running, 2, 2, 2);
        assert_eq!(report.state, HealthState::Degraded);
    }
}
