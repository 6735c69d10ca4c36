//! Audit records and introspection views produced by the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::gpu::GpuInfo;
use crate::models::ModelId;
use crate::resource::ResourceAllocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleOutcome {
    Success,
    Failed,
    InsufficientResources,
    PreemptionRateLimited,
}

/// Immutable audit record of one `schedule()` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDecision {
    pub model_id: ModelId,
    pub decided_at: DateTime<Utc>,
    pub outcome: ScheduleOutcome,
    pub allocation: Option<ResourceAllocation>,
    pub preempted_model_ids: Vec<ModelId>,
    pub reason: String,
    pub gpu_snapshot_before: Vec<GpuInfo>,
    pub gpu_snapshot_after: Vec<GpuInfo>,
}

/// A decision reduced for on-disk persistence: runtime-state snapshots are
/// dropped to id+state+preemption_count elsewhere, and the GPU snapshots are
/// omitted entirely - both are re-derivable at recovery time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReducedDecision {
    pub model_id: ModelId,
    pub decided_at: DateTime<Utc>,
    pub outcome: ScheduleOutcome,
    pub preempted_model_ids: Vec<ModelId>,
    pub reason: String,
}

impl From<&ScheduleDecision> for ReducedDecision {
    fn from(d: &ScheduleDecision) -> Self {
        Self {
            model_id: d.model_id.clone(),
            decided_at: d.decided_at,
            outcome: d.outcome,
            preempted_model_ids: d.preempted_model_ids.clone(),
            reason: d.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub model_id: ModelId,
    pub attempted_at: DateTime<Utc>,
    pub reason: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Per-model preemption counters plus the rolling rate-limiter window,
/// derived entirely from data the scheduler already keeps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreemptionStats {
    pub times_preempted: HashMap<ModelId, u64>,
    pub times_as_preemptor: HashMap<ModelId, u64>,
    pub preemptions_in_last_hour: u32,
}
