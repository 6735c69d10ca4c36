//! Crate-wide error taxonomy for the control plane.
//!
//! Every public operation returns `Result<T, CoreError>` (or a narrower error
//! convertible into it via `From`). Nothing in the core panics outside of
//! tests and lock-poisoning, which is treated as an unrecoverable process bug.

use thiserror::Error;

use crate::models::ModelId;

/// Malformed `ModelConfig` or a disallowed operation in the current lifecycle state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("unknown parameter key '{key}' (use extra_args for passthrough flags)")]
    UnknownParameter { key: String },
    #[error("operation not allowed in state {state:?}")]
    InvalidState { state: String },
    #[error("model id '{0}' already registered")]
    DuplicateId(ModelId),
    #[error("model id '{0}' not found")]
    NotFound(ModelId),
}

/// GPU/memory planning failures (C2).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourceError {
    #[error("insufficient GPU memory: requested {requested_mb} MiB, deficits: {deficits:?}")]
    InsufficientMemory {
        requested_mb: u64,
        deficits: Vec<(u32, i64)>,
    },
    #[error("no GPUs visible to the probe")]
    NoGpusVisible,
    #[error("pinned GPU device {0} does not exist")]
    GpuPinnedDeviceMissing(u32),
}

/// Preemption planning failures (C5).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreemptionError {
    #[error("preemption rate limit exceeded ({count}/{limit} in the last hour)")]
    RateLimited { count: u32, limit: u32 },
    #[error("no eligible victim found for requested priority {priority}")]
    NoEligibleVictim { priority: u8 },
    #[error("priority gap too small: requester {requester}, victim {victim}, gap required {gap}")]
    PriorityGapTooSmall { requester: u8, victim: u8, gap: u8 },
}

/// Engine-adapter (C3) failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("engine did not become ready within the startup timeout")]
    StartTimeout,
    #[error("engine failed to start: {0}")]
    StartFailed(String),
    #[error("engine failed to stop cleanly: {0}")]
    StopFailed(String),
    #[error("image pull failed: {0}")]
    ImagePullFailed(String),
    #[error("engine binary not found: {0}")]
    BinaryMissing(String),
}

/// Health-loop (C6) internal failures. Never escape the loop; recorded as state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("health probe timed out after {timeout_s}s")]
    Timeout { timeout_s: u64 },
    #[error("health probe returned status {status}")]
    Unhealthy { status: u16 },
    #[error("health probe transport error: {0}")]
    Transport(String),
}

/// GPU probe (C1) failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("GPU probe unavailable: {0}")]
    Unavailable(String),
}

/// Router (C7) per-request transport failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransientTransportError {
    #[error("connection refused to target")]
    ConnectionRefused,
    #[error("upstream timed out")]
    Timeout,
    #[error("upstream returned {status}")]
    UpstreamError { status: u16 },
    #[error("no healthy targets available for model {0}")]
    NoTargets(ModelId),
}

/// Top-level error kind. Callers can match broadly here or narrowly on the
/// wrapped inner error.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Preemption(#[from] PreemptionError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Health(#[from] HealthError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Transport(#[from] TransientTransportError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

impl PartialEq for CoreError {
    fn eq(&self, other: &Self) -> bool {
        format!("{self:?}") == format!("{other:?}")
    }
}
