//! Requirement and allocation value types shared by C2 and C5.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a model needs to run, independent of any specific GPU inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub gpu_memory_mb: u64,
    /// Pinned device ids, empty if the scheduler is free to choose.
    pub gpu_devices: Vec<u32>,
    pub cpu_cores: Option<u32>,
    pub system_memory_mb: Option<u64>,
}

/// A concrete placement: which devices, how much memory, when it was made.
/// Purely a reservation intent - does not itself mutate inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub gpu_devices: Vec<u32>,
    pub memory_allocated_mb: u64,
    pub allocated_at: DateTime<Utc>,
}
