//! Scheduler (C5): priority-based placement with preemption, rate limiting,
//! decision audit, and a background recovery loop.

pub mod decision;
pub mod persistence;
pub mod policy;
pub mod recovery;

pub use decision::{PreemptionStats, ReducedDecision, RecoveryAttempt, ScheduleDecision, ScheduleOutcome};
pub use policy::SchedulerPolicy;
pub use recovery::RecoveryRunner;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::Mutex;
use tracing::warn;

use crate::adapter::EngineAdapter;
use crate::error::{CoreError, CoreResult, PreemptionError, ResourceError};
use crate::gpu::{GpuInfo, GpuProbe};
use crate::models::config::{Framework, ModelConfig};
use crate::models::{LifecycleState, ModelId, ModelRegistry};
use crate::resource::{ResourceAllocation, ResourceCalculator, ResourceRequirement};

/// Global scheduler-mutex-guarded bookkeeping: decision/recovery history and
/// the rate-limiting windows. Does not include `ModelRuntime` state, which
/// lives exclusively in `ModelRegistry`.
struct SchedulerState {
    decisions: VecDeque<ScheduleDecision>,
    recovery_attempts: VecDeque<RecoveryAttempt>,
    recovery_attempt_log: HashMap<ModelId, Vec<DateTime<Utc>>>,
    preemption_events: Vec<(DateTime<Utc>, ModelId, ModelId)>, // (when, victim, preemptor)
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            decisions: VecDeque::new(),
            recovery_attempts: VecDeque::new(),
            recovery_attempt_log: HashMap::new(),
            preemption_events: Vec::new(),
        }
    }

    fn preemptions_in_last_hour(&self, now: DateTime<Utc>) -> u32 {
        self.preemption_events
            .iter()
            .filter(|(t, ..)| now.signed_duration_since(*t) < chrono::Duration::hours(1))
            .count() as u32
    }

    fn record_preemption(&mut self, now: DateTime<Utc>, victim: ModelId, preemptor: ModelId) {
        self.preemption_events.push((now, victim, preemptor));
    }
}

/// Priority-based resource scheduler. `schedule()` runs under a single
/// global mutex, acquired before any per-model lock, so decisions observe a
/// consistent view of the `ModelRegistry` and GPU inventory.
pub struct Scheduler {
    registry: Arc<ModelRegistry>,
    gpu_probe: Arc<dyn GpuProbe>,
    process_adapter: Arc<dyn EngineAdapter>,
    container_adapter: Arc<dyn EngineAdapter>,
    policy: SyncRwLock<SchedulerPolicy>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<ModelRegistry>,
        gpu_probe: Arc<dyn GpuProbe>,
        process_adapter: Arc<dyn EngineAdapter>,
        container_adapter: Arc<dyn EngineAdapter>,
        policy: SchedulerPolicy,
    ) -> Self {
        Self {
            registry,
            gpu_probe,
            process_adapter,
            container_adapter,
            policy: SyncRwLock::new(policy),
            state: Mutex::new(SchedulerState::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub async fn policy(&self) -> SchedulerPolicy {
        self.policy.read().clone()
    }

    pub fn update_policy(&self, new_policy: SchedulerPolicy) {
        *self.policy.write() = new_policy;
    }

    fn adapter_for(&self, framework: &Framework) -> &Arc<dyn EngineAdapter> {
        match framework {
            Framework::Process(_) => &self.process_adapter,
            Framework::Container(_) => &self.container_adapter,
        }
    }

    async fn held_by_others(&self) -> HashMap<u32, u64> {
        let mut held: HashMap<u32, u64> = HashMap::new();
        for runtime in self.registry.list().await {
            if let Some(alloc) = &runtime.allocation {
                let share = alloc.memory_allocated_mb / alloc.gpu_devices.len().max(1) as u64;
                for device_id in &alloc.gpu_devices {
                    *held.entry(*device_id).or_insert(0) += share;
                }
            }
        }
        held
    }

    async fn free_inventory(&self) -> CoreResult<Vec<GpuInfo>> {
        let gpus = self.gpu_probe.list_gpus().await?;
        let held = self.held_by_others().await;
        Ok(gpus
            .into_iter()
            .map(|mut g| {
                let reserved = held.get(&g.device_id).copied().unwrap_or(0);
                g.memory_free_mb = g.memory_free_mb.saturating_sub(reserved);
                g
            })
            .collect())
    }

    fn overlaps(req: &ResourceRequirement, allocation: Option<&ResourceAllocation>) -> bool {
        match allocation {
            None => false,
            Some(alloc) => {
                req.gpu_devices.is_empty() || alloc.gpu_devices.iter().any(|d| req.gpu_devices.contains(d))
            }
        }
    }

    fn push_decision(&self, state: &mut SchedulerState, policy: &SchedulerPolicy, decision: ScheduleDecision) {
        state.decisions.push_back(decision);
        while state.decisions.len() > policy.decision_history_size {
            state.decisions.pop_front();
        }
    }

    /// Attempt direct allocation, falling back to preemption, for one model.
    /// Runs entirely under the global scheduler mutex.
    pub async fn schedule(&self, model_id: &ModelId) -> CoreResult<ScheduleOutcome> {
        if self.registry.status(model_id).await?.lifecycle_state == LifecycleState::Running {
            return Ok(ScheduleOutcome::Success); // already running: starting it again is a no-op
        }

        let mut state = self.state.lock().await;
        let policy = self.policy.read().clone();
        let now = Utc::now();

        let config = self.registry.begin_starting(model_id).await?;
        let requirement = ResourceCalculator::estimate(&config);
        let before = self.free_inventory().await?;

        match ResourceCalculator::plan(&requirement, &before) {
            Ok(plan) => {
                return self
                    .launch_and_record(&mut state, &policy, model_id, &config, plan, vec![], before.clone(), before)
                    .await;
            }
            Err(ResourceError::InsufficientMemory { .. }) => {}
            Err(other) => {
                self.registry.mark_start_failed(model_id).await?;
                self.push_decision(
                    &mut state,
                    &policy,
                    ScheduleDecision {
                        model_id: model_id.clone(),
                        decided_at: now,
                        outcome: ScheduleOutcome::Failed,
                        allocation: None,
                        preempted_model_ids: vec![],
                        reason: other.to_string(),
                        gpu_snapshot_before: before.clone(),
                        gpu_snapshot_after: before,
                    },
                );
                return Err(other.into());
            }
        }

        if state.preemptions_in_last_hour(now) >= policy.max_preemptions_per_hour {
            self.registry.mark_start_failed(model_id).await?;
            self.push_decision(
                &mut state,
                &policy,
                ScheduleDecision {
                    model_id: model_id.clone(),
                    decided_at: now,
                    outcome: ScheduleOutcome::PreemptionRateLimited,
                    allocation: None,
                    preempted_model_ids: vec![],
                    reason: "preemption rate limit exceeded".into(),
                    gpu_snapshot_before: before.clone(),
                    gpu_snapshot_after: before,
                },
            );
            return Err(PreemptionError::RateLimited {
                count: state.preemptions_in_last_hour(now),
                limit: policy.max_preemptions_per_hour,
            }
            .into());
        }

        let min_priority = config.priority.saturating_sub(policy.min_priority_gap);
        let mut candidates = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|r| r.lifecycle_state == LifecycleState::Running)
            .filter(|r| r.config.priority < min_priority)
            .filter(|r| Self::overlaps(&requirement, r.allocation.as_ref()))
            .collect::<Vec<_>>();
        // Lowest priority first; ties evict the freshest victim first.
        candidates.sort_by(|a, b| {
            a.config
                .priority
                .cmp(&b.config.priority)
                .then_with(|| b.last_scheduled_at.cmp(&a.last_scheduled_at))
        });

        if candidates.is_empty() {
            self.registry.mark_start_failed(model_id).await?;
            self.push_decision(
                &mut state,
                &policy,
                ScheduleDecision {
                    model_id: model_id.clone(),
                    decided_at: now,
                    outcome: ScheduleOutcome::InsufficientResources,
                    allocation: None,
                    preempted_model_ids: vec![],
                    reason: "no eligible preemption victim".into(),
                    gpu_snapshot_before: before.clone(),
                    gpu_snapshot_after: before,
                },
            );
            return Err(PreemptionError::NoEligibleVictim { priority: config.priority }.into());
        }

        let mut freed = 0u64;
        let mut victims = Vec::new();
        for candidate in candidates {
            if freed >= requirement.gpu_memory_mb {
                break;
            }
            let victim_id = candidate.config.id.clone();
            let adapter = self.adapter_for(&candidate.config.framework);
            if let Err(e) = adapter.stop(&victim_id).await {
                warn!(model_id = %victim_id, error = %e, "adapter stop failed during preemption, forcing ERROR anyway");
            }
            self.registry.mark_preempted(&victim_id).await?;
            state.record_preemption(now, victim_id.clone(), model_id.clone());
            freed += candidate.allocation.as_ref().map(|a| a.memory_allocated_mb).unwrap_or(0);
            victims.push(victim_id);
        }

        let after = self.free_inventory().await?;
        match ResourceCalculator::plan(&requirement, &after) {
            Ok(plan) => {
                self.launch_and_record(&mut state, &policy, model_id, &config, plan, victims, before, after)
                    .await
            }
            Err(_) => {
                self.registry.mark_start_failed(model_id).await?;
                let deficits = after
                    .iter()
                    .map(|g| (g.device_id, g.memory_free_mb as i64 - requirement.gpu_memory_mb as i64))
                    .collect();
                self.push_decision(
                    &mut state,
                    &policy,
                    ScheduleDecision {
                        model_id: model_id.clone(),
                        decided_at: now,
                        outcome: ScheduleOutcome::InsufficientResources,
                        allocation: None,
                        preempted_model_ids: victims,
                        reason: "insufficient resources after preemption".into(),
                        gpu_snapshot_before: before,
                        gpu_snapshot_after: after,
                    },
                );
                Err(ResourceError::InsufficientMemory {
                    requested_mb: requirement.gpu_memory_mb,
                    deficits,
                }
                .into())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn launch_and_record(
        &self,
        state: &mut SchedulerState,
        policy: &SchedulerPolicy,
        model_id: &ModelId,
        config: &ModelConfig,
        plan: ResourceAllocation,
        victims: Vec<ModelId>,
        before: Vec<GpuInfo>,
        after: Vec<GpuInfo>,
    ) -> CoreResult<ScheduleOutcome> {
        let adapter = self.adapter_for(&config.framework);
        match adapter.start(config).await {
            Ok(endpoint) => {
                self.registry.mark_running(model_id, plan.clone(), endpoint).await?;
                self.push_decision(
                    state,
                    policy,
                    ScheduleDecision {
                        model_id: model_id.clone(),
                        decided_at: Utc::now(),
                        outcome: ScheduleOutcome::Success,
                        allocation: Some(plan),
                        preempted_model_ids: victims,
                        reason: "placement succeeded".into(),
                        gpu_snapshot_before: before,
                        gpu_snapshot_after: after,
                    },
                );
                Ok(ScheduleOutcome::Success)
            }
            Err(e) => {
                self.registry.mark_start_failed(model_id).await?;
                self.push_decision(
                    state,
                    policy,
                    ScheduleDecision {
                        model_id: model_id.clone(),
                        decided_at: Utc::now(),
                        outcome: ScheduleOutcome::Failed,
                        allocation: None,
                        preempted_model_ids: victims,
                        reason: e.to_string(),
                        gpu_snapshot_before: before,
                        gpu_snapshot_after: after,
                    },
                );
                Err(CoreError::from(e))
            }
        }
    }

    /// Whether a PREEMPTED/ERROR model's recovery backoff window has
    /// elapsed and it hasn't exhausted its hourly attempt budget.
    pub async fn recovery_eligible(&self, model_id: &ModelId) -> bool {
        let state = self.state.lock().await;
        let policy = self.policy.read().clone();
        let now = Utc::now();
        let attempts = state.recovery_attempt_log.get(model_id).cloned().unwrap_or_default();
        let recent = attempts
            .iter()
            .filter(|t| now.signed_duration_since(**t) < chrono::Duration::hours(1))
            .count() as u32;
        if recent >= policy.max_recovery_attempts {
            return false;
        }
        if let Some(last) = attempts.last() {
            let backoff = policy.recovery_backoff(recent);
            if now.signed_duration_since(*last) < chrono::Duration::from_std(backoff).unwrap_or_default() {
                return false;
            }
        }
        true
    }

    pub async fn record_recovery_attempt(&self, attempt: RecoveryAttempt) {
        let mut state = self.state.lock().await;
        let policy = self.policy.read().clone();
        state
            .recovery_attempt_log
            .entry(attempt.model_id.clone())
            .or_default()
            .push(attempt.attempted_at);
        state.recovery_attempts.push_back(attempt);
        while state.recovery_attempts.len() > policy.recovery_history_size {
            state.recovery_attempts.pop_front();
        }
    }

    /// Stuck-running detection: a RUNNING model not re-confirmed within
    /// `failure_detection_timeout_s` whose adapter OS-probe fails is forced
    /// to ERROR and becomes recovery-eligible.
    pub async fn detect_stuck_running(&self) -> CoreResult<()> {
        let policy = self.policy.read().clone();
        let now = Utc::now();
        for runtime in self.registry.list().await {
            if runtime.lifecycle_state != LifecycleState::Running {
                continue;
            }
            let stale = runtime
                .last_scheduled_at
                .map(|t| now.signed_duration_since(t) > chrono::Duration::seconds(policy.failure_detection_timeout_s as i64))
                .unwrap_or(false);
            if !stale {
                continue;
            }
            let adapter = self.adapter_for(&runtime.config.framework);
            if !adapter.probe(&runtime.config.id).await {
                warn!(model_id = %runtime.config.id, "stuck-running model detected, forcing ERROR");
                self.registry.mark_error(&runtime.config.id).await?;
            }
        }
        Ok(())
    }

    pub async fn get_schedule_history(&self, limit: usize, model_id: Option<&ModelId>) -> Vec<ScheduleDecision> {
        let state = self.state.lock().await;
        state
            .decisions
            .iter()
            .rev()
            .filter(|d| match model_id {
                Some(id) => &d.model_id == id,
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_preemption_stats(&self) -> PreemptionStats {
        let state = self.state.lock().await;
        let now = Utc::now();
        let mut times_preempted = HashMap::new();
        let mut times_as_preemptor = HashMap::new();
        for (_, victim, preemptor) in &state.preemption_events {
            *times_preempted.entry(victim.clone()).or_insert(0u64) += 1;
            *times_as_preemptor.entry(preemptor.clone()).or_insert(0u64) += 1;
        }
        PreemptionStats {
            times_preempted,
            times_as_preemptor,
            preemptions_in_last_hour: state.preemptions_in_last_hour(now),
        }
    }

    /// Snapshots the active policy, the recovery queue (models currently
    /// PREEMPTED or ERROR, highest priority first), and a bounded decision
    /// tail to `path`.
    pub async fn save_state(&self, path: &std::path::Path) -> CoreResult<()> {
        let mut recovery_queue: Vec<_> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|r| matches!(r.lifecycle_state, LifecycleState::Preempted | LifecycleState::Error))
            .collect();
        recovery_queue.sort_by(|a, b| b.config.priority.cmp(&a.config.priority));
        let recovery_queue: Vec<ModelId> = recovery_queue.into_iter().map(|r| r.config.id).collect();
        let recent_decisions: Vec<ReducedDecision> =
            self.get_schedule_history(50, None).await.iter().map(ReducedDecision::from).collect();
        let state_file = persistence::SchedulerStateFile::new(recovery_queue, recent_decisions, self.policy().await);
        state_file
            .save(path)
            .await
            .map_err(|e| CoreError::Internal(format!("saving scheduler state: {e}")))
    }

    /// Restores the active policy from `path`, if present and current. The
    /// recovery queue and decision tail are informational only - they are
    /// never replayed into live registry state, which is always re-derived
    /// from the config store and a fresh GPU probe at boot.
    pub async fn restore_state(&self, path: &std::path::Path) -> CoreResult<()> {
        let loaded = persistence::SchedulerStateFile::load(path)
            .await
            .map_err(|e| CoreError::Internal(format!("loading scheduler state: {e}")))?;
        if let Some(file) = loaded {
            self.update_policy(file.config);
        }
        Ok(())
    }
}
