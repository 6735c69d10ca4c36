//! Data types returned by a [`super::GpuProbe`].

use serde::{Deserialize, Serialize};

/// GPU vendor, as reported by the underlying telemetry shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Unknown,
}

/// A point-in-time snapshot of one physical GPU.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub device_id: u32,
    pub vendor: GpuVendor,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_free_mb: u64,
    pub utilization_pct: f32,
    pub temperature_c: f32,
    pub power_w: f32,
}

impl GpuInfo {
    /// Construct a device with all memory free and zeroed telemetry, for tests.
    pub fn idle(device_id: u32, memory_total_mb: u64) -> Self {
        Self {
            device_id,
            vendor: GpuVendor::Unknown,
            memory_total_mb,
            memory_used_mb: 0,
            memory_free_mb: memory_total_mb,
            utilization_pct: 0.0,
            temperature_c: 0.0,
            power_w: 0.0,
        }
    }
}
