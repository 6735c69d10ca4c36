//! `ResourceCalculator`: estimates resource requirements and plans GPU
//! placements. Pure and stateless - every method takes its inputs as
//! arguments and returns a fresh value.

use chrono::Utc;

use crate::error::ResourceError;
use crate::gpu::GpuInfo;
use crate::models::config::{ModelConfig, Precision};

use super::types::{ResourceAllocation, ResourceRequirement};

const FRAMEWORK_OVERHEAD_PROCESS_MB: u64 = 512;
const FRAMEWORK_OVERHEAD_CONTAINER_MB: u64 = 1024;
const FRAMEWORK_MULTIPLIER_PROCESS: f64 = 1.0;
const FRAMEWORK_MULTIPLIER_CONTAINER: f64 = 1.1;
const SAFETY_MARGIN: f64 = 1.2;
const DEFAULT_MODEL_SIZE_B: f64 = 7.0;
const DEFAULT_BATCH_SIZE: u32 = 1;
const DEFAULT_CPU_CORES: u32 = 4;

/// `(hidden_size, num_layers)` bucketed by model size in billions of params,
/// inclusive upper bound.
const HIDDEN_LAYER_BUCKETS: &[(f64, u32, u32)] = &[
    (1.0, 2048, 24),
    (3.0, 2560, 32),
    (7.0, 4096, 32),
    (13.0, 5120, 40),
    (30.0, 6656, 60),
    (70.0, 8192, 80),
];
const HIDDEN_LAYER_DEFAULT: (u32, u32) = (12288, 96);

fn precision_bytes(p: Precision) -> f64 {
    match p {
        Precision::Fp32 => 4.0,
        Precision::Fp16 => 2.0,
        Precision::Int8 => 1.0,
        Precision::Int4 => 0.5,
    }
}

fn hidden_and_layers(model_size_b: f64) -> (u32, u32) {
    for (upper, hidden, layers) in HIDDEN_LAYER_BUCKETS {
        if model_size_b <= *upper {
            return (*hidden, *layers);
        }
    }
    HIDDEN_LAYER_DEFAULT
}

/// Extract a `7b`/`13b`/`70b`-style size token from a model path, in billions
/// of parameters.
fn model_size_from_name(model_path: &str) -> Option<f64> {
    let lower = model_path.to_lowercase();
    let bytes = lower.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'b' {
                if let Ok(n) = lower[start..i].parse::<f64>() {
                    return Some(n);
                }
            }
        }
        i += 1;
    }
    None
}

/// Fall back to the on-disk file size when no size token is in the name:
/// on-disk bytes roughly track quantized weights, so scale up by 1.5 to
/// approximate full parameter count.
fn model_size_from_file(model_path: &str) -> Option<f64> {
    let bytes = std::fs::metadata(model_path).ok()?.len();
    Some(bytes as f64 / 1e9 * 1.5)
}

fn precision_from_name(model_path: &str) -> Option<Precision> {
    let lower = model_path.to_lowercase();
    if lower.contains("int4") || lower.contains("q4") {
        Some(Precision::Int4)
    } else if lower.contains("int8") || lower.contains("q8") {
        Some(Precision::Int8)
    } else if lower.contains("fp32") {
        Some(Precision::Fp32)
    } else if lower.contains("fp16") || lower.contains("f16") {
        Some(Precision::Fp16)
    } else {
        None
    }
}

/// Pure, stateless estimator and placement planner (C2).
pub struct ResourceCalculator;

impl ResourceCalculator {
    /// Translate a `ModelConfig` into a `ResourceRequirement`.
    pub fn estimate(config: &ModelConfig) -> ResourceRequirement {
        if let Some(req) = &config.resource_requirements {
            if req.gpu_memory_mb > 0 {
                return req.clone();
            }
        }

        let model_size_b = model_size_from_name(&config.model_path)
            .or_else(|| model_size_from_file(&config.model_path))
            .unwrap_or(DEFAULT_MODEL_SIZE_B);
        let precision = precision_from_name(&config.model_path).unwrap_or(Precision::Fp16);
        let precision_b = precision_bytes(precision);
        let (hidden, layers) = hidden_and_layers(model_size_b);
        let context_length = config.framework.context_length() as f64;
        let batch_size = DEFAULT_BATCH_SIZE as f64;

        let framework_multiplier = if config.framework.is_container() {
            FRAMEWORK_MULTIPLIER_CONTAINER
        } else {
            FRAMEWORK_MULTIPLIER_PROCESS
        };
        let framework_overhead_mb = if config.framework.is_container() {
            FRAMEWORK_OVERHEAD_CONTAINER_MB
        } else {
            FRAMEWORK_OVERHEAD_PROCESS_MB
        };

        let base_model_memory_mb = model_size_b * precision_b * 1024.0 * framework_multiplier;
        let context_memory_mb =
            context_length * batch_size * hidden as f64 * layers as f64 * 2.0 * precision_b / (1024.0 * 1024.0);

        let total_mb =
            ((base_model_memory_mb + context_memory_mb + framework_overhead_mb as f64) * SAFETY_MARGIN) as u64;

        // Recommend our default per-engine core count, but never more than the
        // host actually has - small dev boxes shouldn't get a request they can't
        // satisfy.
        let cpu_cores = DEFAULT_CPU_CORES.min(num_cpus::get() as u32).max(1);
        let system_memory_mb = (total_mb / 4).max(2048);

        ResourceRequirement {
            gpu_memory_mb: total_mb,
            gpu_devices: config.gpu_devices.clone(),
            cpu_cores: Some(cpu_cores),
            system_memory_mb: Some(system_memory_mb),
        }
    }

    /// Check whether `requirement` fits `gpu_inventory` (the *free* view, not
    /// raw totals), returning a concrete allocation candidate.
    pub fn plan(
        requirement: &ResourceRequirement,
        gpu_inventory: &[GpuInfo],
    ) -> Result<ResourceAllocation, ResourceError> {
        if requirement.gpu_devices.is_empty() {
            Self::plan_automatic(requirement, gpu_inventory)
        } else {
            Self::plan_pinned(requirement, gpu_inventory)
        }
    }

    fn plan_pinned(
        requirement: &ResourceRequirement,
        gpu_inventory: &[GpuInfo],
    ) -> Result<ResourceAllocation, ResourceError> {
        let mut pinned = Vec::with_capacity(requirement.gpu_devices.len());
        for device_id in &requirement.gpu_devices {
            let gpu = gpu_inventory
                .iter()
                .find(|g| g.device_id == *device_id)
                .ok_or(ResourceError::GpuPinnedDeviceMissing(*device_id))?;
            pinned.push(gpu);
        }

        if let Some(single) = pinned.iter().find(|g| g.memory_free_mb >= requirement.gpu_memory_mb) {
            return Ok(ResourceAllocation {
                gpu_devices: vec![single.device_id],
                memory_allocated_mb: requirement.gpu_memory_mb,
                allocated_at: Utc::now(),
            });
        }

        let total_free: u64 = pinned.iter().map(|g| g.memory_free_mb).sum();
        if total_free >= requirement.gpu_memory_mb {
            return Ok(ResourceAllocation {
                gpu_devices: pinned.iter().map(|g| g.device_id).collect(),
                memory_allocated_mb: requirement.gpu_memory_mb,
                allocated_at: Utc::now(),
            });
        }

        let deficits = pinned
            .iter()
            .map(|g| (g.device_id, g.memory_free_mb as i64 - requirement.gpu_memory_mb as i64))
            .collect();
        Err(ResourceError::InsufficientMemory {
            requested_mb: requirement.gpu_memory_mb,
            deficits,
        })
    }

    fn plan_automatic(
        requirement: &ResourceRequirement,
        gpu_inventory: &[GpuInfo],
    ) -> Result<ResourceAllocation, ResourceError> {
        if gpu_inventory.is_empty() {
            return Err(ResourceError::NoGpusVisible);
        }

        let mut sorted: Vec<&GpuInfo> = gpu_inventory.iter().collect();
        sorted.sort_by(|a, b| b.memory_free_mb.cmp(&a.memory_free_mb));

        if let Some(single) = sorted.first() {
            if single.memory_free_mb >= requirement.gpu_memory_mb {
                return Ok(ResourceAllocation {
                    gpu_devices: vec![single.device_id],
                    memory_allocated_mb: requirement.gpu_memory_mb,
                    allocated_at: Utc::now(),
                });
            }
        }

        let mut chosen = Vec::new();
        let mut cumulative = 0u64;
        for gpu in &sorted {
            chosen.push(gpu.device_id);
            cumulative += gpu.memory_free_mb;
            if cumulative >= requirement.gpu_memory_mb {
                return Ok(ResourceAllocation {
                    gpu_devices: chosen,
                    memory_allocated_mb: requirement.gpu_memory_mb,
                    allocated_at: Utc::now(),
                });
            }
        }

        let deficits = sorted
            .iter()
            .map(|g| (g.device_id, g.memory_free_mb as i64 - requirement.gpu_memory_mb as i64))
            .collect();
        Err(ResourceError::InsufficientMemory {
            requested_mb: requirement.gpu_memory_mb,
            deficits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GpuVendor;
    use crate::models::config::{Framework, ProcessEngineParams};

    fn gpu(id: u32, total: u64, free: u64) -> GpuInfo {
        GpuInfo {
            device_id: id,
            vendor: GpuVendor::Unknown,
            memory_total_mb: total,
            memory_used_mb: total - free,
            memory_free_mb: free,
            utilization_pct: 0.0,
            temperature_c: 0.0,
            power_w: 0.0,
        }
    }

    fn config(priority: u8, gpu_devices: Vec<u32>) -> ModelConfig {
        ModelConfig::new_for_test(
            "m".into(),
            "m".into(),
            Framework::Process(ProcessEngineParams::default()),
            "models/7b-model.gguf".into(),
            priority,
            gpu_devices,
        )
    }

    #[test]
    fn direct_allocation_single_gpu() {
        let req = ResourceRequirement {
            gpu_memory_mb: 8192,
            gpu_devices: vec![],
            cpu_cores: None,
            system_memory_mb: None,
        };
        let inventory = vec![gpu(0, 24576, 24576)];
        let alloc = ResourceCalculator::plan(&req, &inventory).unwrap();
        assert_eq!(alloc.gpu_devices, vec![0]);
        assert_eq!(alloc.memory_allocated_mb, 8192);
    }

    #[test]
    fn pinned_multi_gpu_split() {
        let req = ResourceRequirement {
            gpu_memory_mb: 40000,
            gpu_devices: vec![0, 1],
            cpu_cores: None,
            system_memory_mb: None,
        };
        let inventory = vec![gpu(0, 24576, 24576), gpu(1, 24576, 24576)];
        let alloc = ResourceCalculator::plan(&req, &inventory).unwrap();
        assert_eq!(alloc.gpu_devices, vec![0, 1]);
        assert_eq!(alloc.memory_allocated_mb, 40000);
    }

    #[test]
    fn pinned_missing_device_is_an_error() {
        let req = ResourceRequirement {
            gpu_memory_mb: 1000,
            gpu_devices: vec![5],
            cpu_cores: None,
            system_memory_mb: None,
        };
        let inventory = vec![gpu(0, 24576, 24576)];
        assert_eq!(
            ResourceCalculator::plan(&req, &inventory),
            Err(ResourceError::GpuPinnedDeviceMissing(5))
        );
    }

    #[test]
    fn automatic_insufficient_memory_reports_deficits() {
        let req = ResourceRequirement {
            gpu_memory_mb: 100_000,
            gpu_devices: vec![],
            cpu_cores: None,
            system_memory_mb: None,
        };
        let inventory = vec![gpu(0, 24576, 24576)];
        match ResourceCalculator::plan(&req, &inventory) {
            Err(ResourceError::InsufficientMemory { deficits, .. }) => {
                assert_eq!(deficits.len(), 1);
                assert!(deficits[0].1 < 0);
            }
            other => panic!("expected InsufficientMemory, got {other:?}"),
        }
    }

    #[test]
    fn no_gpus_visible() {
        let req = ResourceRequirement {
            gpu_memory_mb: 1,
            gpu_devices: vec![],
            cpu_cores: None,
            system_memory_mb: None,
        };
        assert_eq!(ResourceCalculator::plan(&req, &[]), Err(ResourceError::NoGpusVisible));
    }

    #[test]
    fn estimate_uses_declared_requirement_when_present() {
        let mut config = config(5, vec![]);
        config.resource_requirements = Some(ResourceRequirement {
            gpu_memory_mb: 12345,
            gpu_devices: vec![],
            cpu_cores: Some(2),
            system_memory_mb: Some(4096),
        });
        let req = ResourceCalculator::estimate(&config);
        assert_eq!(req.gpu_memory_mb, 12345);
    }

    #[test]
    fn estimate_falls_back_to_heuristic_for_7b_model() {
        let config = config(5, vec![]);
        let req = ResourceCalculator::estimate(&config);
        // 7b * fp16(2.0) * 1024 = 14336 base, plus KV cache and 20% margin.
        assert!(req.gpu_memory_mb > 14336);
        assert!(req.cpu_cores.is_some());
        assert!(req.system_memory_mb.unwrap() >= 2048);
    }
}
