//! `ModelRuntime`: the per-model runtime row C4 owns, plus the lifecycle and
//! health state machines.

use serde::{Deserialize, Serialize};

use crate::resource::ResourceAllocation;

use super::config::ModelConfig;

/// One of {STOPPED, STARTING, RUNNING, STOPPING, ERROR, PREEMPTED}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Preempted,
}

impl LifecycleState {
    /// Whether `to` is a legal transition from `self`.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Preempted)
                | (Running, Stopping)
                | (Running, Error)
                | (Running, Preempted)
                | (Stopping, Stopped)
                | (Error, Starting)
                | (Preempted, Starting)
        )
    }
}

/// The rolling HTTP-probe verdict, distinct from lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Per-model runtime row: lifecycle state, owning adapter reference,
/// allocated resources, and rolling health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRuntime {
    pub config: ModelConfig,
    pub lifecycle_state: LifecycleState,
    pub allocation: Option<ResourceAllocation>,
    pub endpoint_url: Option<String>,
    pub last_scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    pub preemption_count: u64,
    pub current_health: HealthState,
    pub consecutive_health_failures: u32,
}

impl ModelRuntime {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            lifecycle_state: LifecycleState::Stopped,
            allocation: None,
            endpoint_url: None,
            last_scheduled_at: None,
            preemption_count: 0,
            current_health: HealthState::Unknown,
            consecutive_health_failures: 0,
        }
    }

    /// I1: every RUNNING runtime has a non-null allocation and endpoint.
    pub fn satisfies_running_invariant(&self) -> bool {
        self.lifecycle_state != LifecycleState::Running
            || (self.allocation.is_some() && self.endpoint_url.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use LifecycleState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Error.can_transition_to(Starting));
        assert!(Preempted.can_transition_to(Starting));
        assert!(Running.can_transition_to(Preempted));
        assert!(Starting.can_transition_to(Preempted));
    }

    #[test]
    fn illegal_transitions_rejected() {
        use LifecycleState::*;
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Preempted));
        assert!(!Preempted.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
    }
}
