//! `ProcessEngine`: drives a subprocess engine (e.g. llama.cpp) in its own
//! process group so a SIGTERM to the group reaches all of its children.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::process::CommandExt;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use crate::error::{AdapterError, ValidationError};
use crate::models::config::{Framework, ProcessEngineParams};
use crate::models::{ModelConfig, ModelId};

use super::{EngineAdapter, PROCESS_READY_TIMEOUT_S, STOP_GRACE_PERIOD_S};

struct RunningProcess {
    child: Child,
    pid: u32,
    endpoint_url: String,
}

/// Launches and supervises subprocess-backed engines.
pub struct ProcessEngine {
    running: Mutex<HashMap<ModelId, RunningProcess>>,
    http: reqwest::Client,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builder with static config never fails"),
        }
    }

    fn params(config: &ModelConfig) -> Result<&ProcessEngineParams, ValidationError> {
        match &config.framework {
            Framework::Process(p) => Ok(p),
            Framework::Container(_) => Err(ValidationError::InvalidField {
                field: "framework".into(),
                reason: "ProcessEngine requires Framework::Process".into(),
            }),
        }
    }

    /// GPU visibility env vars. NVIDIA-style by default; AMD engines key off
    /// the same `gpu_devices` list via `ROCR_VISIBLE_DEVICES`.
    fn gpu_env(devices: &[u32]) -> Vec<(String, String)> {
        if devices.is_empty() {
            return Vec::new();
        }
        let csv = devices.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        vec![
            ("CUDA_VISIBLE_DEVICES".to_string(), csv.clone()),
            ("ROCR_VISIBLE_DEVICES".to_string(), csv),
        ]
    }

    /// Shell-style tokenization with a whitespace-split fallback on
    /// unbalanced quotes.
    fn tokenize(additional_parameters: &str) -> Vec<String> {
        match shell_words_split(additional_parameters) {
            Some(tokens) => tokens,
            None => additional_parameters
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        }
    }

    async fn wait_healthy(&self, endpoint_url: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(PROCESS_READY_TIMEOUT_S);
        let health_url = format!("{endpoint_url}/health");
        while Instant::now() < deadline {
            if let Ok(resp) = self.http.get(&health_url).send().await {
                if resp.status().is_success() {
                    return true;
                }
            }
            sleep(Duration::from_millis(500)).await;
        }
        false
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal POSIX-shell-like tokenizer: splits on whitespace, honoring single
/// and double quotes. Returns `None` on an unterminated quote.
fn shell_words_split(input: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return None;
    }
    if in_token {
        tokens.push(current);
    }
    Some(tokens)
}

#[async_trait]
impl EngineAdapter for ProcessEngine {
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
        if params.executable_path.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: "framework.executable_path".into(),
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    async fn start(&self, config: &ModelConfig) -> Result<String, AdapterError> {
        let params = Self::params(config).map_err(|e| AdapterError::StartFailed(e.to_string()))?;
        if !std::path::Path::new(&params.executable_path).exists() {
            return Err(AdapterError::BinaryMissing(params.executable_path.clone()));
        }

        let mut args = vec![
            "--model".to_string(),
            config.model_path.clone(),
            "--port".to_string(),
            params.port.to_string(),
            "--ctx-size".to_string(),
            params.context_length.to_string(),
        ];
        args.extend(params.extra_args.clone());
        args.extend(Self::tokenize(&params.additional_parameters));

        let mut std_cmd = std::process::Command::new(&params.executable_path);
        std_cmd.args(&args).stdout(Stdio::null()).stderr(Stdio::null());
        for (key, value) in Self::gpu_env(&config.gpu_devices) {
            std_cmd.env(key, value);
        }
        #[cfg(unix)]
        {
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        let mut child = cmd
            .spawn()
            .map_err(|e| AdapterError::StartFailed(format!("spawn failed: {e}")))?;
        let pid = child.id().ok_or_else(|| AdapterError::StartFailed("process exited immediately".into()))?;

        let endpoint_url = format!("http://127.0.0.1:{}", params.port);
        if !self.wait_healthy(&endpoint_url).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(AdapterError::StartTimeout);
        }

        info!(model_id = %config.id, pid, endpoint_url, "process engine started");
        self.running.lock().insert(
            config.id.clone(),
            RunningProcess {
                child,
                pid,
                endpoint_url: endpoint_url.clone(),
            },
        );
        Ok(endpoint_url)
    }

    async fn stop(&self, model_id: &ModelId) -> Result<(), AdapterError> {
        let entry = self.running.lock().remove(model_id);
        let Some(mut proc) = entry else {
            return Ok(()); // idempotent
        };

        #[cfg(unix)]
        {
            // SIGTERM to the whole process group (negative pid).
            unsafe {
                libc::kill(-(proc.pid as i32), libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = proc.child.start_kill();
        }

        let graceful = timeout(Duration::from_secs(STOP_GRACE_PERIOD_S), proc.child.wait()).await;
        if graceful.is_err() {
            warn!(model_id = %model_id, pid = proc.pid, "process did not exit after SIGTERM, escalating to SIGKILL");
            #[cfg(unix)]
            unsafe {
                libc::kill(-(proc.pid as i32), libc::SIGKILL);
            }
            #[cfg(not(unix))]
            let _ = proc.child.start_kill();
            let _ = proc.child.wait().await;
        }
        Ok(())
    }

    async fn probe(&self, model_id: &ModelId) -> bool {
        let mut running = self.running.lock();
        match running.get_mut(model_id) {
            Some(proc) => matches!(proc.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn endpoint(&self, model_id: &ModelId) -> Option<String> {
        self.running.lock().get(model_id).map(|p| p.endpoint_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_handles_quoted_args() {
        let tokens = ProcessEngine::tokenize("--foo bar --baz \"hello world\"");
        assert_eq!(tokens, vec!["--foo", "bar", "--baz", "hello world"]);
    }

    #[test]
    fn tokenize_falls_back_on_unterminated_quote() {
        let tokens = ProcessEngine::tokenize("--foo \"unterminated");
        assert_eq!(tokens, vec!["--foo", "\"unterminated"]);
    }

    #[test]
    fn gpu_env_empty_for_no_devices() {
        assert!(ProcessEngine::gpu_env(&[]).is_empty());
    }

    #[test]
    fn gpu_env_joins_device_ids() {
        let env = ProcessEngine::gpu_env(&[0, 1, 2]);
        assert_eq!(env[0], ("CUDA_VISIBLE_DEVICES".to_string(), "0,1,2".to_string()));
    }
}
