//! `ModelConfig` and the per-framework parameter tagged union.
//!
//! The source this was distilled from used a free-form `parameters` dict per
//! framework; here that becomes a tagged union (`Framework::Process` /
//! `Framework::Container`), each a struct of known fields with an
//! `extra_args` escape hatch for passthrough flags. Validation never accepts
//! unknown keys outside that hatch because there is no dict to misuse in the
//! first place - unknown fields are simply rejected at deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::resource::ResourceRequirement;

use super::ModelId;

/// Numeric-precision tag used by the resource calculator's heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Fp32,
    Fp16,
    Int8,
    Int4,
}

impl Default for Precision {
    fn default() -> Self {
        Self::Fp16
    }
}

/// Process-engine-specific launch parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEngineParams {
    /// Engine family name (e.g. "llama-cpp"), used for GPU env var selection.
    pub engine_name: String,
    pub executable_path: String,
    pub port: u16,
    pub context_length: u32,
    /// Shell-style string tokenized and appended to the base argument vector.
    /// Tokenization errors fall back to whitespace splitting.
    pub additional_parameters: String,
    /// Escape hatch for flags not otherwise modeled.
    pub extra_args: Vec<String>,
}

impl Default for ProcessEngineParams {
    fn default() -> Self {
        Self {
            engine_name: "llama-cpp".to_string(),
            executable_path: String::new(),
            port: 8080,
            context_length: 2048,
            additional_parameters: String::new(),
            extra_args: Vec::new(),
        }
    }
}

/// Container-engine-specific launch parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEngineParams {
    /// Engine family name (e.g. "vllm"), used in the `<framework>-<model_id>`
    /// container name.
    pub engine_name: String,
    pub image: String,
    pub port: u16,
    pub context_length: u32,
    /// Fraction of device memory the engine is told to target, in (0, 1].
    pub gpu_memory_utilization: f32,
    pub model_mount_path: String,
    pub cache_mount_path: String,
    pub extra_args: Vec<String>,
}

impl Default for ContainerEngineParams {
    fn default() -> Self {
        Self {
            engine_name: "vllm".to_string(),
            image: String::new(),
            port: 8000,
            context_length: 2048,
            gpu_memory_utilization: 0.9,
            model_mount_path: "/models".to_string(),
            cache_mount_path: "/cache".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Which transport drives the engine: a local subprocess or a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Framework {
    Process(ProcessEngineParams),
    Container(ContainerEngineParams),
}

impl Framework {
    pub fn is_container(&self) -> bool {
        matches!(self, Framework::Container(_))
    }

    pub fn port(&self) -> u16 {
        match self {
            Framework::Process(p) => p.port,
            Framework::Container(c) => c.port,
        }
    }

    pub fn context_length(&self) -> u32 {
        match self {
            Framework::Process(p) => p.context_length,
            Framework::Container(c) => c.context_length,
        }
    }

    pub fn engine_name(&self) -> &str {
        match self {
            Framework::Process(p) => &p.engine_name,
            Framework::Container(c) => &c.engine_name,
        }
    }

    pub fn extra_args(&self) -> &[String] {
        match self {
            Framework::Process(p) => &p.extra_args,
            Framework::Container(c) => &c.extra_args,
        }
    }
}

/// Health-check policy for one model (feeds C6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_s: u64,
    pub timeout_s: u64,
    pub max_consecutive_failures: u32,
    pub endpoint_path: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_s: 15,
            timeout_s: 5,
            max_consecutive_failures: 3,
            endpoint_path: Some("/health".to_string()),
        }
    }
}

impl HealthCheckConfig {
    pub fn endpoint_path(&self) -> &str {
        self.endpoint_path.as_deref().unwrap_or("/health")
    }
}

/// Exponential-backoff retry policy, used by C3's restart path and C6's
/// corrective-action path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_s: u64,
    pub max_delay_s: u64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay_s: 2,
            max_delay_s: 30,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the `attempt`-th retry (0-indexed), clamped to `max_delay_s`.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let raw = self.initial_delay_s as f64 * self.backoff_factor.powi(attempt as i32);
        let clamped = raw.min(self.max_delay_s as f64).max(0.0);
        std::time::Duration::from_secs_f64(clamped)
    }
}

/// The declared desired state of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: ModelId,
    pub name: String,
    pub framework: Framework,
    pub model_path: String,
    /// 1-10, 10 = highest.
    pub priority: u8,
    /// Pinned device ids; empty means the scheduler chooses.
    pub gpu_devices: Vec<u32>,
    pub resource_requirements: Option<ResourceRequirement>,
    pub health_check: HealthCheckConfig,
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields whose change on `update()` forces a stop-then-restart rather than
/// an in-place config swap (C4 §4.4).
pub struct RestartRequiredDelta {
    pub framework_changed: bool,
    pub model_path_changed: bool,
    pub gpu_devices_changed: bool,
    pub resource_requirements_changed: bool,
}

impl RestartRequiredDelta {
    pub fn requires_restart(&self) -> bool {
        self.framework_changed
            || self.model_path_changed
            || self.gpu_devices_changed
            || self.resource_requirements_changed
    }
}

impl ModelConfig {
    pub fn new(
        id: ModelId,
        name: String,
        framework: Framework,
        model_path: String,
        priority: u8,
        gpu_devices: Vec<u32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            framework,
            model_path,
            priority,
            gpu_devices,
            resource_requirements: None,
            health_check: HealthCheckConfig::default(),
            retry_policy: RetryPolicy::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn new_for_test(
        id: String,
        name: String,
        framework: Framework,
        model_path: String,
        priority: u8,
        gpu_devices: Vec<u32>,
    ) -> Self {
        Self::new(ModelId::new(id), name, framework, model_path, priority, gpu_devices)
    }

    pub fn context_length(&self) -> u32 {
        self.framework.context_length()
    }

    pub fn diff_for_restart(&self, new: &ModelConfig) -> RestartRequiredDelta {
        RestartRequiredDelta {
            framework_changed: std::mem::discriminant(&self.framework) != std::mem::discriminant(&new.framework)
                || self.framework != new.framework,
            model_path_changed: self.model_path != new.model_path,
            gpu_devices_changed: self.gpu_devices != new.gpu_devices,
            resource_requirements_changed: self.resource_requirements != new.resource_requirements,
        }
    }

    /// Checks shared by both engine families; adapter-specific checks are
    /// layered on top by each `EngineAdapter::validate` implementation.
    pub fn validate_common(&self) -> Result<(), ValidationError> {
        if self.id.as_str().is_empty() {
            return Err(ValidationError::InvalidField {
                field: "id".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.name.is_empty() {
            return Err(ValidationError::InvalidField {
                field: "name".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.model_path.is_empty() {
            return Err(ValidationError::InvalidField {
                field: "model_path".into(),
                reason: "must not be empty".into(),
            });
        }
        if !(1..=10).contains(&self.priority) {
            return Err(ValidationError::InvalidField {
                field: "priority".into(),
                reason: "must be in [1, 10]".into(),
            });
        }
        if let Some(req) = &self.resource_requirements {
            if req.gpu_memory_mb == 0 {
                return Err(ValidationError::InvalidField {
                    field: "resource_requirements.gpu_memory_mb".into(),
                    reason: "must be > 0".into(),
                });
            }
        }
        if self.health_check.enabled {
            if self.health_check.interval_s == 0 {
                return Err(ValidationError::InvalidField {
                    field: "health_check.interval_s".into(),
                    reason: "must be > 0 when enabled".into(),
                });
            }
            if self.health_check.timeout_s == 0 {
                return Err(ValidationError::InvalidField {
                    field: "health_check.timeout_s".into(),
                    reason: "must be > 0 when enabled".into(),
                });
            }
            if self.health_check.max_consecutive_failures == 0 {
                return Err(ValidationError::InvalidField {
                    field: "health_check.max_consecutive_failures".into(),
                    reason: "must be > 0 when enabled".into(),
                });
            }
        }
        if self.retry_policy.enabled {
            if self.retry_policy.max_attempts == 0 {
                return Err(ValidationError::InvalidField {
                    field: "retry_policy.max_attempts".into(),
                    reason: "must be > 0 when enabled".into(),
                });
            }
            if self.retry_policy.initial_delay_s == 0 {
                return Err(ValidationError::InvalidField {
                    field: "retry_policy.initial_delay_s".into(),
                    reason: "must be > 0 when enabled".into(),
                });
            }
            if self.retry_policy.max_delay_s < self.retry_policy.initial_delay_s {
                return Err(ValidationError::InvalidField {
                    field: "retry_policy.max_delay_s".into(),
                    reason: "must be >= initial_delay_s".into(),
                });
            }
            if self.retry_policy.backoff_factor < 1.0 {
                return Err(ValidationError::InvalidField {
                    field: "retry_policy.backoff_factor".into(),
                    reason: "must be >= 1.0".into(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ModelConfig {
        ModelConfig::new(
            ModelId::new("m1"),
            "my-model".into(),
            Framework::Process(ProcessEngineParams::default()),
            "models/7b.gguf".into(),
            5,
            vec![],
        )
    }

    #[test]
    fn valid_config_passes() {
        assert!(base().validate_common().is_ok());
    }

    #[test]
    fn priority_out_of_range_rejected() {
        let mut c = base();
        c.priority = 0;
        assert!(c.validate_common().is_err());
        c.priority = 11;
        assert!(c.validate_common().is_err());
    }

    #[test]
    fn empty_id_rejected() {
        let mut c = base();
        c.id = ModelId::new("");
        assert!(c.validate_common().is_err());
    }

    #[test]
    fn retry_policy_max_delay_below_initial_rejected() {
        let mut c = base();
        c.retry_policy.initial_delay_s = 10;
        c.retry_policy.max_delay_s = 5;
        assert!(c.validate_common().is_err());
    }

    #[test]
    fn retry_delay_clamps_to_max() {
        let policy = RetryPolicy {
            enabled: true,
            max_attempts: 10,
            initial_delay_s: 1,
            max_delay_s: 8,
            backoff_factor: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0).as_secs(), 1);
        assert_eq!(policy.delay_for_attempt(1).as_secs(), 2);
        assert_eq!(policy.delay_for_attempt(2).as_secs(), 4);
        assert_eq!(policy.delay_for_attempt(3).as_secs(), 8);
        assert_eq!(policy.delay_for_attempt(10).as_secs(), 8);
    }

    #[test]
    fn restart_delta_detects_model_path_change() {
        let a = base();
        let mut b = base();
        b.model_path = "models/13b.gguf".into();
        assert!(a.diff_for_restart(&b).requires_restart());
    }

    #[test]
    fn restart_delta_ignores_name_only_change() {
        let a = base();
        let mut b = base();
        b.name = "renamed".into();
        assert!(!a.diff_for_restart(&b).requires_restart());
    }
}
