//! End-to-end placement tests driving `Scheduler::schedule` against a real
//! `ModelRegistry`, rather than `ResourceCalculator::plan` in isolation.

use std::sync::Arc;

use async_trait::async_trait;

use gg_ctrl::adapter::EngineAdapter;
use gg_ctrl::error::{AdapterError, ValidationError};
use gg_ctrl::gpu::{GpuInfo, MockGpuProbe};
use gg_ctrl::models::config::{Framework, ProcessEngineParams};
use gg_ctrl::models::{LifecycleState, ModelConfig, ModelId, ModelRegistry};
use gg_ctrl::resource::ResourceRequirement;
use gg_ctrl::scheduler::{Scheduler, SchedulerPolicy};

struct AlwaysHealthyAdapter;

#[async_trait]
impl EngineAdapter for AlwaysHealthyAdapter {
    async fn validate(&self, _config: &ModelConfig) -> Result<(), ValidationError> {
        Ok(())
    }
    async fn start(&self, config: &ModelConfig) -> Result<String, AdapterError> {
        Ok(format!("http://localhost:{}", config.framework.port()))
    }
    async fn stop(&self, _model_id: &ModelId) -> Result<(), AdapterError> {
        Ok(())
    }
    async fn probe(&self, _model_id: &ModelId) -> bool {
        true
    }
    async fn endpoint(&self, _model_id: &ModelId) -> Option<String> {
        None
    }
}

fn scheduler_with_two_gpus() -> Scheduler {
    let registry = Arc::new(ModelRegistry::new());
    let probe = Arc::new(MockGpuProbe::new(vec![
        GpuInfo::idle(0, 24576),
        GpuInfo::idle(1, 24576),
    ]));
    Scheduler::new(
        registry,
        probe,
        Arc::new(AlwaysHealthyAdapter),
        Arc::new(AlwaysHealthyAdapter),
        SchedulerPolicy::default(),
    )
}

fn pinned_config(id: &str, gpu_devices: Vec<u32>, gpu_memory_mb: u64) -> ModelConfig {
    let mut c = ModelConfig::new_for_test(
        id.into(),
        id.into(),
        Framework::Process(ProcessEngineParams::default()),
        "models/7b.gguf".into(),
        5,
        gpu_devices.clone(),
    );
    c.resource_requirements = Some(ResourceRequirement {
        gpu_memory_mb,
        gpu_devices,
        cpu_cores: None,
        system_memory_mb: None,
    });
    c
}

/// A model pinned to two devices, each individually too small to hold it,
/// lands split across both - the full `schedule()` path, not just the
/// planner it delegates to.
#[tokio::test]
async fn pinned_multi_gpu_split_places_model_across_both_devices() {
    let scheduler = scheduler_with_two_gpus();
    let id = ModelId::new("split-model");
    scheduler
        .registry()
        .register(pinned_config("split-model", vec![0, 1], 40000))
        .await
        .unwrap();

    let outcome = scheduler.schedule(&id).await.unwrap();
    assert_eq!(outcome, gg_ctrl::scheduler::ScheduleOutcome::Success);

    let status = scheduler.registry().status(&id).await.unwrap();
    assert_eq!(status.lifecycle_state, LifecycleState::Running);
    let allocation = status.allocation.expect("running model must have an allocation");
    assert_eq!(allocation.gpu_devices, vec![0, 1]);
    assert_eq!(allocation.memory_allocated_mb, 40000);
}

/// Universal invariant: total allocated memory on any one device never
/// exceeds what the probe reported as that device's total capacity.
#[tokio::test]
async fn gpu_memory_is_never_oversubscribed_across_two_models() {
    let scheduler = scheduler_with_two_gpus();
    scheduler
        .registry()
        .register(pinned_config("a", vec![0], 20000))
        .await
        .unwrap();
    scheduler
        .registry()
        .register(pinned_config("b", vec![0], 20000))
        .await
        .unwrap();

    scheduler.schedule(&ModelId::new("a")).await.unwrap();
    // b can't fit alongside a on device 0 (24576 total, 20000 already held)
    // and has no lower-priority victim to preempt (same priority as a), so
    // this must fail rather than silently oversubscribe device 0.
    let err = scheduler.schedule(&ModelId::new("b")).await;
    assert!(err.is_err());

    let status_a = scheduler.registry().status(&ModelId::new("a")).await.unwrap();
    assert_eq!(status_a.lifecycle_state, LifecycleState::Running);
    let status_b = scheduler.registry().status(&ModelId::new("b")).await.unwrap();
    assert_ne!(status_b.lifecycle_state, LifecycleState::Running);
}
