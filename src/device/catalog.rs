//! Device discovery
//!
//! The catalog probes every linked backend once at construction and serves
//! read-only snapshots afterwards, so repeated discovery sees the same
//! physical devices in the same order: backend tag first, native index
//! second, with the configured preferred backend stably biased to the
//! front. Probing never panics; a backend whose library is absent is
//! omitted, a device whose driver fails to initialize stays listed as
//! Unavailable with the reason attached.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;

use super::{BackendKind, Device, DeviceCapabilities, DeviceId, Feature};
use crate::config::PreferredBackend;
use crate::driver::CpuDriver;

/// Backend and capability predicate for discovery
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    /// Restrict to these backends; None admits all
    pub backends: Option<Vec<BackendKind>>,
    /// Every listed feature must be supported
    pub required: Vec<Feature>,
    /// Drop devices that are not currently usable
    pub available_only: bool,
}

impl DeviceFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn backend(kind: BackendKind) -> Self {
        Self {
            backends: Some(vec![kind]),
            ..Self::default()
        }
    }

    pub fn available(mut self) -> Self {
        self.available_only = true;
        self
    }

    pub fn require(mut self, feature: Feature) -> Self {
        self.required.push(feature);
        self
    }

    fn admits(&self, device: &Device) -> bool {
        if let Some(backends) = &self.backends {
            if !backends.contains(&device.id().backend()) {
                return false;
            }
        }
        if self.available_only && !device.status().is_usable() {
            return false;
        }
        self.required.iter().all(|f| device.supports(*f))
    }
}

/// Immutable snapshot of every discovered device
pub struct DeviceCatalog {
    devices: Vec<Device>,
}

impl DeviceCatalog {
    /// Probe all linked backends once
    pub fn probe(preferred: PreferredBackend) -> Self {
        let mut devices: Vec<Device> = Vec::new();

        #[cfg(feature = "cuda")]
        devices.extend(crate::driver::cuda::CudaDriver::enumerate());
        #[cfg(not(feature = "cuda"))]
        info!("CUDA driver not linked; backend omitted");

        #[cfg(feature = "opencl")]
        devices.extend(crate::driver::opencl::OpenClDriver::enumerate());
        #[cfg(not(feature = "opencl"))]
        info!("OpenCL loader not linked; backend omitted");

        devices.push(cpu_device(false));
        devices.push(cpu_device(true));

        devices.sort_by_key(|d| d.id());

        // stable bias: preferred backend first, catalog order within groups
        if let Some(kind) = preferred_kind(preferred) {
            devices.sort_by_key(|d| d.id().backend() != kind);
        }

        info!("device discovery complete: {} devices", devices.len());
        Self { devices }
    }

    /// Filtered snapshot, stable across calls
    pub fn discover(&self, filter: &DeviceFilter) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|d| filter.admits(d))
            .cloned()
            .collect()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id() == id)
    }

    /// First usable device in discovery order
    pub fn default_device(&self) -> Option<&Device> {
        self.devices.iter().find(|d| d.status().is_usable())
    }
}

fn preferred_kind(preferred: PreferredBackend) -> Option<BackendKind> {
    match preferred {
        PreferredBackend::Auto => None,
        PreferredBackend::Cuda => Some(BackendKind::Cuda),
        PreferredBackend::OpenCl => Some(BackendKind::OpenCl),
        PreferredBackend::Cpu => Some(BackendKind::Cpu),
    }
}

fn cpu_config_hash(cores: usize, parallel: bool) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update((cores as u64).to_le_bytes());
    hasher.update([parallel as u8]);
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("sha256 yields 32 bytes"))
}

/// Stand-alone CPU simulator device with an explicit memory budget.
///
/// Embedders use this to model constrained devices without touching real
/// hardware; the returned device behaves exactly like the catalog's CPU
/// entries, including OutOfMemory once the budget is exhausted.
pub fn cpu_simulator(parallel: bool, memory_limit: u64) -> Device {
    let cores = num_cpus::get();
    let hash = cpu_config_hash(cores, parallel) ^ memory_limit;
    let id = if parallel {
        DeviceId::CpuSimd(hash)
    } else {
        DeviceId::Cpu(hash)
    };
    let caps = DeviceCapabilities {
        compute_capability: (1, 0),
        max_work_group_size: 1024,
        unified_memory: true,
        memory_pools: true,
        tensor_cores: Vec::new(),
        async_copy: true,
    };
    Device::new(
        id,
        format!("CPU Simulator ({} cores, {} MiB)", cores, memory_limit / (1024 * 1024)),
        caps,
        "sim-1.0",
        Arc::new(CpuDriver::with_memory_limit(parallel, memory_limit)),
    )
}

fn cpu_device(parallel: bool) -> Device {
    let cores = num_cpus::get();
    let hash = cpu_config_hash(cores, parallel);
    let id = if parallel {
        DeviceId::CpuSimd(hash)
    } else {
        DeviceId::Cpu(hash)
    };
    let name = if parallel {
        format!("CPU Simulator SIMD ({} cores)", cores)
    } else {
        format!("CPU Simulator ({} cores)", cores)
    };
    let caps = DeviceCapabilities {
        compute_capability: (1, 0),
        max_work_group_size: 1024,
        unified_memory: true,
        memory_pools: true,
        tensor_cores: Vec::new(),
        async_copy: true,
    };
    Device::new(id, name, caps, "sim-1.0", Arc::new(CpuDriver::new(parallel)))
}
