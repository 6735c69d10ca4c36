//! End-to-end health-triggered restart: a model's `/health` endpoint starts
//! failing, `HealthLoopSet` escalates it to unhealthy, takes it out of the
//! router's rotation, and restarts it through the scheduler.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;

use gg_ctrl::adapter::EngineAdapter;
use gg_ctrl::error::{AdapterError, ValidationError};
use gg_ctrl::gpu::{GpuInfo, MockGpuProbe};
use gg_ctrl::healthloop::HealthLoopSet;
use gg_ctrl::models::config::{Framework, HealthCheckConfig, ProcessEngineParams, RetryPolicy};
use gg_ctrl::models::{HealthState, LifecycleState, ModelConfig, ModelId, ModelRegistry};
use gg_ctrl::resource::ResourceRequirement;
use gg_ctrl::router::{LoadBalancePolicy, RequestRouter};
use gg_ctrl::scheduler::{Scheduler, SchedulerPolicy};

/// Serves `/health`: 500 until `fail_until` calls have been made, then 200
/// forever after, so the probe fails exactly once before recovering.
async fn spawn_flaky_health_server(fail_until: u32) -> String {
    let calls = Arc::new(AtomicU32::new(0));
    let app = axum::Router::new().route(
        "/health",
        axum::routing::get(move || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < fail_until {
                    StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    StatusCode::OK
                }
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Always reports the same (flaky) endpoint on start, and tracks how many
/// times it was asked to start the engine.
struct RecordingAdapter {
    endpoint: String,
    start_calls: Arc<AtomicU32>,
}

#[async_trait]
impl EngineAdapter for RecordingAdapter {
    async fn validate(&self, _config: &ModelConfig) -> Result<(), ValidationError> {
        Ok(())
    }
    async fn start(&self, _config: &ModelConfig) -> Result<String, AdapterError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.endpoint.clone())
    }
    async fn stop(&self, _model_id: &ModelId) -> Result<(), AdapterError> {
        Ok(())
    }
    async fn probe(&self, _model_id: &ModelId) -> bool {
        true
    }
    async fn endpoint(&self, _model_id: &ModelId) -> Option<String> {
        Some(self.endpoint.clone())
    }
}

#[tokio::test]
async fn unhealthy_model_is_taken_out_of_rotation_and_restarted() {
    let endpoint = spawn_flaky_health_server(1).await;
    let start_calls = Arc::new(AtomicU32::new(0));
    let adapter: Arc<dyn EngineAdapter> = Arc::new(RecordingAdapter {
        endpoint: endpoint.clone(),
        start_calls: start_calls.clone(),
    });

    let registry = Arc::new(ModelRegistry::new());
    let gpu_probe = Arc::new(MockGpuProbe::new(vec![GpuInfo::idle(0, 24576)]));
    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        gpu_probe,
        adapter.clone(),
        adapter.clone(),
        SchedulerPolicy::default(),
    ));
    let router = RequestRouter::new(LoadBalancePolicy::RoundRobin);
    router.attach(&registry);
    let health_loops = HealthLoopSet::new(registry.clone(), scheduler.clone(), router.clone());

    let id = ModelId::new("flaky");
    let mut config = ModelConfig::new_for_test(
        "flaky".into(),
        "flaky".into(),
        Framework::Process(ProcessEngineParams::default()),
        "models/7b.gguf".into(),
        5,
        vec![],
    );
    config.resource_requirements = Some(ResourceRequirement {
        gpu_memory_mb: 8192,
        gpu_devices: vec![],
        cpu_cores: None,
        system_memory_mb: None,
    });
    config.health_check = HealthCheckConfig {
        enabled: true,
        interval_s: 1,
        timeout_s: 1,
        max_consecutive_failures: 1,
        endpoint_path: Some("/health".into()),
    };
    config.retry_policy = RetryPolicy {
        enabled: true,
        max_attempts: 1,
        initial_delay_s: 0,
        max_delay_s: 0,
        backoff_factor: 1.0,
    };
    registry.register(config.clone()).await.unwrap();

    scheduler.schedule(&id).await.unwrap();
    assert_eq!(router.active_target_count(&id), 1);

    health_loops.start(
        id.clone(),
        endpoint,
        config.health_check.clone(),
        config.retry_policy.clone(),
        adapter,
    );

    // One failed probe (max_consecutive_failures: 1) triggers restart with
    // no extra backoff; give the loop a couple of probe intervals to land.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let status = registry.status(&id).await.unwrap();
    assert_eq!(status.lifecycle_state, LifecycleState::Running);
    assert_eq!(status.current_health, HealthState::Healthy);
    assert_eq!(start_calls.load(Ordering::SeqCst), 2, "initial start plus one health-triggered restart");
    assert_eq!(router.active_target_count(&id), 1);

    health_loops.stop(&id).await;
}
