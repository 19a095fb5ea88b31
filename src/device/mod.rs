//! Device identity and descriptors
//!
//! A [`DeviceId`] is a small value type identifying one physical (or
//! simulated) accelerator; a [`Device`] is the read-mostly descriptor the
//! catalog hands out, carrying capabilities, memory info, and status.

pub mod catalog;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::driver::{DriverBackend, MemoryInfo};
use crate::error::{Error, Result};

pub use catalog::{cpu_simulator, DeviceCatalog, DeviceFilter};

/// Backend families the runtime can target
///
/// Declaration order defines the discovery tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Cuda,
    OpenCl,
    Cpu,
    CpuSimd,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cuda => write!(f, "CUDA"),
            BackendKind::OpenCl => write!(f, "OpenCL"),
            BackendKind::Cpu => write!(f, "CPU"),
            BackendKind::CpuSimd => write!(f, "CPU-SIMD"),
        }
    }
}

/// Opaque typed device identifier
///
/// Equatable and orderable by (backend tag, payload); never dangles because
/// it carries no resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceId {
    /// CUDA ordinal as reported by the driver
    Cuda(i32),
    /// OpenCL (platform, device) pair
    OpenCl { platform: u32, device: u32 },
    /// In-process CPU simulator, keyed by a hash of its configuration
    Cpu(u64),
    /// SIMD-parallel CPU simulator
    CpuSimd(u64),
}

impl DeviceId {
    pub fn backend(&self) -> BackendKind {
        match self {
            DeviceId::Cuda(_) => BackendKind::Cuda,
            DeviceId::OpenCl { .. } => BackendKind::OpenCl,
            DeviceId::Cpu(_) => BackendKind::Cpu,
            DeviceId::CpuSimd(_) => BackendKind::CpuSimd,
        }
    }

    pub fn is_cpu_class(&self) -> bool {
        matches!(self, DeviceId::Cpu(_) | DeviceId::CpuSimd(_))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            DeviceId::OpenCl { platform, device } => write!(f, "opencl:{}:{}", platform, device),
            DeviceId::Cpu(hash) => write!(f, "cpu:{:08x}", hash),
            DeviceId::CpuSimd(hash) => write!(f, "cpu-simd:{:08x}", hash),
        }
    }
}

/// Precisions a tensor-core class unit accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorPrecision {
    F16,
    Bf16,
    Tf32,
    I8,
}

/// Capability feature probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    UnifiedMemory,
    MemoryPools,
    TensorCores(TensorPrecision),
    AsyncCopy,
}

/// Static capabilities reported at discovery time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub compute_capability: (u32, u32),
    pub max_work_group_size: u32,
    pub unified_memory: bool,
    pub memory_pools: bool,
    pub tensor_cores: Vec<TensorPrecision>,
    pub async_copy: bool,
}

impl DeviceCapabilities {
    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::UnifiedMemory => self.unified_memory,
            Feature::MemoryPools => self.memory_pools,
            Feature::TensorCores(precision) => self.tensor_cores.contains(&precision),
            Feature::AsyncCopy => self.async_copy,
        }
    }
}

/// Device availability as last observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Available,
    Busy,
    Unavailable { reason: String },
    Error { reason: String },
}

impl DeviceStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, DeviceStatus::Available | DeviceStatus::Busy)
    }
}

/// Descriptor for one discovered device
///
/// Created during discovery and read-mostly afterwards; `memory_info`
/// re-reads from the driver on every call.
#[derive(Clone)]
pub struct Device {
    id: DeviceId,
    name: String,
    capabilities: DeviceCapabilities,
    status: DeviceStatus,
    driver_version: String,
    driver: Option<Arc<dyn DriverBackend>>,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        name: impl Into<String>,
        capabilities: DeviceCapabilities,
        driver_version: impl Into<String>,
        driver: Arc<dyn DriverBackend>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            capabilities,
            status: DeviceStatus::Available,
            driver_version: driver_version.into(),
            driver: Some(driver),
        }
    }

    /// Descriptor for a device whose driver is present but failed to
    /// initialize; kept in the catalog with the failure reason attached.
    pub(crate) fn unavailable(
        id: DeviceId,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            capabilities: DeviceCapabilities {
                compute_capability: (0, 0),
                max_work_group_size: 0,
                unified_memory: false,
                memory_pools: false,
                tensor_cores: Vec::new(),
                async_copy: false,
            },
            status: DeviceStatus::Unavailable {
                reason: reason.into(),
            },
            driver_version: String::new(),
            driver: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    pub fn driver_version(&self) -> &str {
        &self.driver_version
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.capabilities.supports(feature)
    }

    /// Re-read total/free/used memory from the driver
    pub fn memory_info(&self) -> Result<MemoryInfo> {
        self.driver()?.memory_info()
    }

    pub(crate) fn driver(&self) -> Result<Arc<dyn DriverBackend>> {
        self.driver.clone().ok_or_else(|| {
            Error::DeviceUnavailable(format!("device {} has no initialized driver", self.id))
        })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} [{}]", self.name, self.id)?;
        writeln!(
            f,
            "  compute capability: {}.{}",
            self.capabilities.compute_capability.0, self.capabilities.compute_capability.1
        )?;
        writeln!(
            f,
            "  max work group: {}  unified memory: {}  pools: {}",
            self.capabilities.max_work_group_size,
            self.capabilities.unified_memory,
            self.capabilities.memory_pools
        )?;
        if let Ok(info) = self.memory_info() {
            writeln!(
                f,
                "  memory: {} MiB total, {} MiB free",
                info.total / (1024 * 1024),
                info.free / (1024 * 1024)
            )?;
        }
        write!(f, "  status: {:?}", self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_order_by_tag_then_payload() {
        let mut ids = vec![
            DeviceId::Cpu(7),
            DeviceId::Cuda(1),
            DeviceId::OpenCl {
                platform: 0,
                device: 2,
            },
            DeviceId::Cuda(0),
            DeviceId::OpenCl {
                platform: 0,
                device: 1,
            },
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                DeviceId::Cuda(0),
                DeviceId::Cuda(1),
                DeviceId::OpenCl {
                    platform: 0,
                    device: 1
                },
                DeviceId::OpenCl {
                    platform: 0,
                    device: 2
                },
                DeviceId::Cpu(7),
            ]
        );
    }

    #[test]
    fn capability_probe_covers_tensor_precisions() {
        let caps = DeviceCapabilities {
            compute_capability: (8, 0),
            max_work_group_size: 1024,
            unified_memory: true,
            memory_pools: true,
            tensor_cores: vec![TensorPrecision::F16, TensorPrecision::Tf32],
            async_copy: true,
        };
        assert!(caps.supports(Feature::TensorCores(TensorPrecision::F16)));
        assert!(!caps.supports(Feature::TensorCores(TensorPrecision::I8)));
        assert!(caps.supports(Feature::UnifiedMemory));
    }

    #[test]
    fn unavailable_device_yields_typed_error() {
        let device = Device::unavailable(DeviceId::Cuda(0), "NVIDIA X", "init failed: CUDA_ERROR_UNKNOWN");
        assert!(!device.status().is_usable());
        assert!(matches!(
            device.memory_info(),
            Err(Error::DeviceUnavailable(_))
        ));
    }
}
