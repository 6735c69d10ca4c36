//! `ContainerEngine`: drives a container-backed engine (e.g. vLLM) through
//! the Docker CLI. Shells out rather than linking a client library, matching
//! how lightweight adapters in this codebase's sibling tooling talk to
//! external daemons.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::error::{AdapterError, ValidationError};
use crate::models::config::{ContainerEngineParams, Framework};
use crate::models::{ModelConfig, ModelId};

use super::{EngineAdapter, CONTAINER_READY_TIMEOUT_S, STOP_GRACE_PERIOD_S};

struct RunningContainer {
    container_name: String,
    endpoint_url: String,
}

/// Launches and supervises container-backed engines via the `docker` CLI.
pub struct ContainerEngine {
    running: Mutex<HashMap<ModelId, RunningContainer>>,
    http: reqwest::Client,
    docker_bin: String,
}

impl ContainerEngine {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builder with static config never fails"),
            docker_bin: "docker".to_string(),
        }
    }

    fn params(config: &ModelConfig) -> Result<&ContainerEngineParams, ValidationError> {
        match &config.framework {
            Framework::Container(c) => Ok(c),
            Framework::Process(_) => Err(ValidationError::InvalidField {
                field: "framework".into(),
                reason: "ContainerEngine requires Framework::Container".into(),
            }),
        }
    }

    fn container_name(params: &ContainerEngineParams, model_id: &ModelId) -> String {
        format!("{}-{}", params.engine_name, model_id.as_str())
    }

    async fn pull_image(&self, image: &str) -> Result<(), AdapterError> {
        let image = image.to_string();
        let docker_bin = self.docker_bin.clone();
        // Performed on a worker thread so the caller's await doesn't block
        // the scheduler's global mutex for the duration of the pull.
        let output = tokio::task::spawn_blocking(move || {
            std::process::Command::new(&docker_bin).args(["pull", &image]).output()
        })
        .await
        .map_err(|e| AdapterError::ImagePullFailed(format!("join error: {e}")))?
        .map_err(|e| AdapterError::ImagePullFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(AdapterError::ImagePullFailed(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(())
    }

    async fn wait_healthy(&self, endpoint_url: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(CONTAINER_READY_TIMEOUT_S);
        let health_url = format!("{endpoint_url}/health");
        while Instant::now() < deadline {
            if let Ok(resp) = self.http.get(&health_url).send().await {
                if resp.status().is_success() {
                    return true;
                }
            }
            sleep(Duration::from_millis(1000)).await;
        }
        false
    }

    async fn remove_container(&self, name: &str) {
        let _ = Command::new(&self.docker_bin).args(["rm", "-f", name]).output().await;
    }
}

impl Default for ContainerEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineAdapter for ContainerEngine {
    async fn validate(&self, config: &ModelConfig) -> Result<(), ValidationError> {
        config.validate_common()?;
        let params = Self::params(config)?;
        if !(1024..=65535).contains(&params.port) {
            return Err(ValidationError::InvalidField {
                field: "framework.port".into(),
                reason: "must be in [1024, 65535]".into(),
            });
        }
        if params.context_length == 0 {
            return Err(ValidationError::InvalidField {
                field: "framework.context_length".into(),
                reason: "must be > 0".into(),
            });
        }
        if params.image.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: "framework.image".into(),
                reason: "must not be empty".into(),
            });
        }
        if !(params.gpu_memory_utilization > 0.0 && params.gpu_memory_utilization <= 1.0) {
            return Err(ValidationError::InvalidField {
                field: "framework.gpu_memory_utilization".into(),
                reason: "must be in (0, 1]".into(),
            });
        }
        Ok(())
    }

    async fn start(&self, config: &ModelConfig) -> Result<String, AdapterError> {
        let params = Self::params(config).map_err(|e| AdapterError::StartFailed(e.to_string()))?;
        let name = Self::container_name(params, &config.id);

        self.remove_container(&name).await; // reclaim a stale container from a prior run

        self.pull_image(&params.image).await?;

        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.clone(),
            "-p".to_string(),
            format!("{}:{}", params.port, params.port),
            "-v".to_string(),
            format!("{}:{}:ro", config.model_path, params.model_mount_path),
            "-v".to_string(),
            format!("{}-cache:{}:rw", name, params.cache_mount_path),
        ];
        if !config.gpu_devices.is_empty() {
            let device_ids = config.gpu_devices.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
            args.push("--gpus".to_string());
            args.push(format!("\"device={device_ids}\""));
        }
        args.push("--env".to_string());
        args.push(format!("GPU_MEMORY_UTILIZATION={}", params.gpu_memory_utilization));
        args.push(params.image.clone());
        args.extend(params.extra_args.clone());

        let output = Command::new(&self.docker_bin)
            .args(&args)
            .output()
            .await
            .map_err(|e| AdapterError::StartFailed(format!("docker run failed: {e}")))?;
        if !output.status.success() {
            return Err(AdapterError::StartFailed(String::from_utf8_lossy(&output.stderr).into_owned()));
        }

        let endpoint_url = format!("http://127.0.0.1:{}", params.port);
        if !self.wait_healthy(&endpoint_url).await {
            self.remove_container(&name).await;
            return Err(AdapterError::StartTimeout);
        }

        info!(model_id = %config.id, container = %name, endpoint_url, "container engine started");
        self.running.lock().insert(
            config.id.clone(),
            RunningContainer {
                container_name: name,
                endpoint_url: endpoint_url.clone(),
            },
        );
        Ok(endpoint_url)
    }

    async fn stop(&self, model_id: &ModelId) -> Result<(), AdapterError> {
        let entry = self.running.lock().remove(model_id);
        let Some(container) = entry else {
            return Ok(()); // idempotent
        };

        let graceful = Command::new(&self.docker_bin)
            .args(["stop", "--timeout", &STOP_GRACE_PERIOD_S.to_string(), &container.container_name])
            .output()
            .await;
        if graceful.map(|o| o.status.success()).unwrap_or(false) {
            return Ok(());
        }

        warn!(model_id = %model_id, container = %container.container_name, "docker stop failed, escalating to kill");
        let _ = Command::new(&self.docker_bin)
            .args(["kill", &container.container_name])
            .output()
            .await;
        Ok(())
    }

    async fn probe(&self, model_id: &ModelId) -> bool {
        let name = match self.running.lock().get(model_id) {
            Some(c) => c.container_name.clone(),
            None => return false,
        };
        let output = Command::new(&self.docker_bin)
            .args(["inspect", "-f", "{{.State.Running}}", &name])
            .output()
            .await;
        matches!(output, Ok(o) if o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
    }

    async fn endpoint(&self, model_id: &ModelId) -> Option<String> {
        self.running.lock().get(model_id).map(|c| c.endpoint_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_deterministic() {
        let params = ContainerEngineParams::default();
        let name = ContainerEngine::container_name(&params, &ModelId::new("m1"));
        assert_eq!(name, "vllm-m1");
    }
}
