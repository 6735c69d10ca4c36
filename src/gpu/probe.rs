//! The `GpuProbe` trait and its implementations.
//!
//! Vendor telemetry shims (NVML, ROCm-SMI) are out of scope for the core -
//! only the interface is specified. A real deployment supplies its own
//! `GpuProbe` impl (feature-gated the same way vendor compute backends are
//! gated elsewhere in this codebase); this module ships the trait, a
//! TTL-caching decorator any implementation can wrap itself in, and a fixed
//! `MockGpuProbe` for tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ProbeError;

use super::types::GpuInfo;

/// Enumerates GPUs and returns per-device live telemetry. Pure query
/// interface; implementations must not mutate allocation state.
///
/// `device_id` values MUST be stable across calls for the lifetime of the
/// process.
#[async_trait]
pub trait GpuProbe: Send + Sync {
    async fn list_gpus(&self) -> Result<Vec<GpuInfo>, ProbeError>;
}

/// Wraps any `GpuProbe` and serves a short-lived cache to throttle
/// vendor-tool invocations. Defaults to a 5s TTL.
pub struct CachedGpuProbe<P> {
    inner: P,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Arc<Vec<GpuInfo>>)>>,
}

impl<P: GpuProbe> CachedGpuProbe<P> {
    pub fn new(inner: P) -> Self {
        Self::with_ttl(inner, Duration::from_secs(5))
    }

    pub fn with_ttl(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<P: GpuProbe> GpuProbe for CachedGpuProbe<P> {
    async fn list_gpus(&self) -> Result<Vec<GpuInfo>, ProbeError> {
        if let Some((fetched_at, cached)) = self.cache.lock().clone() {
            if fetched_at.elapsed() < self.ttl {
                return Ok((*cached).clone());
            }
        }

        let fresh = self.inner.list_gpus().await?;
        let fresh = Arc::new(fresh);
        *self.cache.lock() = Some((Instant::now(), fresh.clone()));
        Ok((*fresh).clone())
    }
}

/// Fixed-inventory probe for tests and for hosts with no visible GPUs.
#[derive(Debug, Clone, Default)]
pub struct MockGpuProbe {
    devices: Arc<Mutex<Vec<GpuInfo>>>,
    fail: Arc<Mutex<bool>>,
}

impl MockGpuProbe {
    pub fn new(devices: Vec<GpuInfo>) -> Self {
        Self {
            devices: Arc::new(Mutex::new(devices)),
            fail: Arc::new(Mutex::new(false)),
        }
    }

    pub fn set_devices(&self, devices: Vec<GpuInfo>) {
        *self.devices.lock() = devices;
    }

    pub fn set_unavailable(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl GpuProbe for MockGpuProbe {
    async fn list_gpus(&self) -> Result<Vec<GpuInfo>, ProbeError> {
        if *self.fail.lock() {
            return Err(ProbeError::Unavailable("mock probe set to fail".into()));
        }
        Ok(self.devices.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GpuVendor;

    fn dev(id: u32, total: u64) -> GpuInfo {
        GpuInfo {
            device_id: id,
            vendor: GpuVendor::Unknown,
            memory_total_mb: total,
            memory_used_mb: 0,
            memory_free_mb: total,
            utilization_pct: 0.0,
            temperature_c: 0.0,
            power_w: 0.0,
        }
    }

    #[tokio::test]
    async fn mock_probe_returns_configured_devices() {
        let probe = MockGpuProbe::new(vec![dev(0, 24576)]);
        let gpus = probe.list_gpus().await.unwrap();
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].device_id, 0);
    }

    #[tokio::test]
    async fn mock_probe_surfaces_unavailable() {
        let probe = MockGpuProbe::new(vec![]);
        probe.set_unavailable(true);
        assert!(probe.list_gpus().await.is_err());
    }

    #[tokio::test]
    async fn cached_probe_serves_stale_value_within_ttl() {
        let mock = MockGpuProbe::new(vec![dev(0, 1000)]);
        let cached = CachedGpuProbe::with_ttl(mock.clone(), Duration::from_millis(50));
        let first = cached.list_gpus().await.unwrap();
        mock.set_devices(vec![dev(0, 2000)]);
        let second = cached.list_gpus().await.unwrap();
        assert_eq!(first, second);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let third = cached.list_gpus().await.unwrap();
        assert_eq!(third[0].memory_total_mb, 2000);
    }

    #[tokio::test]
    async fn consistent_device_ids_across_calls() {
        let probe = MockGpuProbe::new(vec![dev(0, 1000), dev(1, 2000)]);
        let a = probe.list_gpus().await.unwrap();
        let b = probe.list_gpus().await.unwrap();
        let ids_a: Vec<u32> = a.iter().map(|g| g.device_id).collect();
        let ids_b: Vec<u32> = b.iter().map(|g| g.device_id).collect();
        assert_eq!(ids_a, ids_b);
    }
}
