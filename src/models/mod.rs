//! Model registry and lifecycle state machine (C4).
//!
//! Holds the authoritative `ModelRuntime` table keyed by `ModelId`. All
//! mutations go through `ModelRegistry`; concurrent requests touching the
//! same model are serialized by a per-model lock, distinct models proceed in
//! parallel.

pub mod config;
mod events;
mod registry;
mod runtime;

pub use config::{Framework, HealthCheckConfig, ModelConfig, Precision, RetryPolicy};
pub use events::{LifecycleEvent, StateChangeListener};
pub use registry::ModelRegistry;
pub use runtime::{HealthState, LifecycleState, ModelRuntime};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, non-empty, globally-unique (among non-deleted models) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId(pub String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ModelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
