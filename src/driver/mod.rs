//! Driver boundary
//!
//! Everything below the [`DriverBackend`] trait speaks raw pointers and
//! backend status codes; everything above speaks typed buffers and
//! [`crate::error::Error`]. Status codes are translated here and never leak.
//!
//! Three backends exist: CUDA and OpenCL behind their cargo features (a
//! missing library simply disables the backend), and the in-process CPU
//! simulator which is always available.

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
#[cfg(feature = "opencl")]
pub mod opencl;

use crate::device::BackendKind;
use crate::error::Result;
use crate::kernel::{KernelArtifact, ParamBlock};

pub use cpu::{CpuDriver, HostLaunchContext};

/// Opaque device allocation handle
///
/// Never a raw address on the host side; the driver owns the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub(crate) u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Stable handle for diagnostics and identity checks
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Snapshot of device memory occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

/// Grid or block extent for a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl LaunchDims {
    pub const ONE: LaunchDims = LaunchDims { x: 1, y: 1, z: 1 };

    pub fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn xy(x: u32, y: u32) -> Self {
        Self { x, y, z: 1 }
    }

    pub fn count(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Grid covering `n` linear work items with the given block width
    pub fn grid_for(n: usize, block: u32) -> Self {
        let block = block.max(1) as u64;
        Self::linear(((n as u64 + block - 1) / block) as u32)
    }
}

/// One device driver binding
///
/// Implementations are concurrent-safe; callers may issue allocation and
/// copy calls from any thread. Launches are serialized by the stream that
/// submits them, not by the driver.
pub trait DriverBackend: Send + Sync {
    fn backend_kind(&self) -> BackendKind;

    /// Current memory occupancy, re-read on every call
    fn memory_info(&self) -> Result<MemoryInfo>;

    fn alloc(&self, bytes: usize) -> Result<DevicePtr>;

    /// Page-locked host-visible allocation for fast DMA
    fn alloc_pinned(&self, bytes: usize) -> Result<DevicePtr>;

    fn free(&self, ptr: DevicePtr) -> Result<()>;

    fn copy_in(&self, dst: DevicePtr, dst_offset: usize, src: &[u8]) -> Result<()>;

    fn copy_out(&self, src: DevicePtr, src_offset: usize, dst: &mut [u8]) -> Result<()>;

    fn copy_device(
        &self,
        src: DevicePtr,
        src_offset: usize,
        dst: DevicePtr,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<()>;

    fn fill_zero(&self, ptr: DevicePtr, offset: usize, bytes: usize) -> Result<()>;

    /// Submit one kernel launch. The artifact payload stays opaque to the
    /// core; only the driver interprets it.
    fn launch(
        &self,
        artifact: &KernelArtifact,
        grid: LaunchDims,
        block: LaunchDims,
        params: &ParamBlock,
    ) -> Result<()>;

    /// Host mapping for a pinned or unified allocation; None when the
    /// allocation is not host-visible on this backend.
    fn host_ptr(&self, ptr: DevicePtr) -> Option<*mut u8>;
}
