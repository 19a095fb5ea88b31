//! In-process CPU simulator driver
//!
//! Backs device allocations with host memory and executes host-function
//! kernel artifacts directly. The sequential variant runs kernels on the
//! submitting stream's worker thread; the SIMD variant advertises
//! parallelism so kernels may fan out across the rayon pool.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::Pod;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{DevicePtr, DriverBackend, LaunchDims, MemoryInfo};
use crate::device::BackendKind;
use crate::error::{Error, Result};
use crate::kernel::{ArtifactPayload, KernelArtifact, ParamBlock, ParamKind};

const ALLOC_ALIGN: usize = 64;

/// Default simulated device memory budget
pub const DEFAULT_MEMORY_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

struct Allocation {
    ptr: *mut u8,
    layout: Layout,
}

// SAFETY: allocations are plain byte ranges; all access goes through the
// driver's bounds-checked copy entry points or the launch context.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: ptr/layout came from alloc_zeroed in `CpuDriver::alloc`.
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// CPU simulator backend
pub struct CpuDriver {
    parallel: bool,
    allocations: DashMap<u64, Allocation>,
    next_handle: AtomicU64,
    used: AtomicU64,
    limit: u64,
}

impl CpuDriver {
    pub fn new(parallel: bool) -> Self {
        Self::with_memory_limit(parallel, DEFAULT_MEMORY_LIMIT)
    }

    /// Simulator with an explicit memory budget; exceeding it reports
    /// OutOfMemory exactly like a saturated physical device.
    pub fn with_memory_limit(parallel: bool, limit: u64) -> Self {
        Self {
            parallel,
            allocations: DashMap::new(),
            next_handle: AtomicU64::new(1),
            used: AtomicU64::new(0),
            limit,
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    fn lookup(&self, ptr: DevicePtr) -> Result<dashmap::mapref::one::Ref<'_, u64, Allocation>> {
        self.allocations.get(&ptr.0).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown device pointer {:#x}", ptr.0))
        })
    }

    fn check_range(alloc: &Allocation, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len).ok_or_else(|| {
            Error::InvalidArgument("device range overflows address space".into())
        })?;
        if end > alloc.layout.size() {
            return Err(Error::InvalidArgument(format!(
                "device range {}..{} exceeds allocation of {} bytes",
                offset,
                end,
                alloc.layout.size()
            )));
        }
        Ok(())
    }
}

impl DriverBackend for CpuDriver {
    fn backend_kind(&self) -> BackendKind {
        if self.parallel {
            BackendKind::CpuSimd
        } else {
            BackendKind::Cpu
        }
    }

    fn memory_info(&self) -> Result<MemoryInfo> {
        let used = self.used.load(Ordering::Acquire);
        Ok(MemoryInfo {
            total: self.limit,
            free: self.limit.saturating_sub(used),
            used,
        })
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        let charged = bytes.max(1) as u64;
        // reserve budget first so concurrent allocators cannot overshoot
        let prev = self.used.fetch_add(charged, Ordering::AcqRel);
        if prev + charged > self.limit {
            self.used.fetch_sub(charged, Ordering::AcqRel);
            return Err(Error::out_of_memory(bytes as u64));
        }

        let layout = Layout::from_size_align(bytes.max(1), ALLOC_ALIGN)
            .map_err(|e| Error::InvalidArgument(format!("bad allocation layout: {}", e)))?;
        // SAFETY: layout has non-zero size and valid alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            self.used.fetch_sub(charged, Ordering::AcqRel);
            return Err(Error::out_of_memory(bytes as u64));
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.allocations.insert(handle, Allocation { ptr, layout });
        trace!("cpu alloc {:#x}: {} bytes", handle, bytes);
        Ok(DevicePtr(handle))
    }

    fn alloc_pinned(&self, bytes: usize) -> Result<DevicePtr> {
        // Host memory is never paged out of the simulator; pinned and plain
        // allocations share one path.
        self.alloc(bytes)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        match self.allocations.remove(&ptr.0) {
            Some((_, alloc)) => {
                self.used
                    .fetch_sub(alloc.layout.size().max(1) as u64, Ordering::AcqRel);
                trace!("cpu free {:#x}", ptr.0);
                Ok(())
            }
            None => Err(Error::InvalidArgument(format!(
                "free of unknown device pointer {:#x}",
                ptr.0
            ))),
        }
    }

    fn copy_in(&self, dst: DevicePtr, dst_offset: usize, src: &[u8]) -> Result<()> {
        let alloc = self.lookup(dst)?;
        Self::check_range(&alloc, dst_offset, src.len())?;
        // SAFETY: range checked above; source and destination never overlap
        // because `src` is host memory outside the allocation table.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), alloc.ptr.add(dst_offset), src.len());
        }
        Ok(())
    }

    fn copy_out(&self, src: DevicePtr, src_offset: usize, dst: &mut [u8]) -> Result<()> {
        let alloc = self.lookup(src)?;
        Self::check_range(&alloc, src_offset, dst.len())?;
        // SAFETY: range checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(alloc.ptr.add(src_offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn copy_device(
        &self,
        src: DevicePtr,
        src_offset: usize,
        dst: DevicePtr,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<()> {
        let src_alloc = self.lookup(src)?;
        Self::check_range(&src_alloc, src_offset, bytes)?;
        if src == dst {
            let overlap = src_offset.max(dst_offset) < src_offset.min(dst_offset) + bytes;
            if overlap && src_offset != dst_offset {
                return Err(Error::InvalidArgument(
                    "overlapping device-to-device copy".into(),
                ));
            }
            if src_offset == dst_offset {
                return Ok(());
            }
            // SAFETY: non-overlap verified above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src_alloc.ptr.add(src_offset),
                    src_alloc.ptr.add(dst_offset),
                    bytes,
                );
            }
            return Ok(());
        }
        let dst_alloc = self.lookup(dst)?;
        Self::check_range(&dst_alloc, dst_offset, bytes)?;
        // SAFETY: distinct allocations, ranges checked.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src_alloc.ptr.add(src_offset),
                dst_alloc.ptr.add(dst_offset),
                bytes,
            );
        }
        Ok(())
    }

    fn fill_zero(&self, ptr: DevicePtr, offset: usize, bytes: usize) -> Result<()> {
        let alloc = self.lookup(ptr)?;
        Self::check_range(&alloc, offset, bytes)?;
        // SAFETY: range checked above.
        unsafe { std::ptr::write_bytes(alloc.ptr.add(offset), 0, bytes) };
        Ok(())
    }

    fn launch(
        &self,
        artifact: &KernelArtifact,
        grid: LaunchDims,
        block: LaunchDims,
        params: &ParamBlock,
    ) -> Result<()> {
        match artifact.payload() {
            ArtifactPayload::HostFn(f) => {
                let ctx = HostLaunchContext {
                    driver: self,
                    grid,
                    block,
                    params,
                };
                debug!(
                    "cpu launch '{}' over {} work items",
                    artifact.entry_point(),
                    ctx.linear_extent()
                );
                f(&ctx)
            }
            ArtifactPayload::Ptx(_) | ArtifactPayload::SpirV(_) => Err(Error::Unsupported(
                format!(
                    "CPU simulator cannot execute '{}': artifact targets a hardware backend",
                    artifact.entry_point()
                ),
            )),
        }
    }

    fn host_ptr(&self, ptr: DevicePtr) -> Option<*mut u8> {
        self.allocations.get(&ptr.0).map(|a| a.ptr)
    }
}

/// Execution context handed to host-function kernels
///
/// Exposes the launch geometry and typed access to the marshalled parameter
/// block. View access resolves through the driver's allocation table with
/// bounds checks; a kernel must not request overlapping mutable views.
pub struct HostLaunchContext<'a> {
    driver: &'a CpuDriver,
    pub grid: LaunchDims,
    pub block: LaunchDims,
    params: &'a ParamBlock,
}

impl HostLaunchContext<'_> {
    /// Total linear work items covered by (grid × block)
    pub fn linear_extent(&self) -> usize {
        (self.grid.count() * self.block.count()) as usize
    }

    /// Whether this driver wants data-parallel kernels
    pub fn parallel(&self) -> bool {
        self.driver.parallel
    }

    pub fn param_count(&self) -> usize {
        self.params.slot_count()
    }

    /// Read a scalar parameter
    pub fn scalar<T: Pod>(&self, slot: usize) -> Result<T> {
        let bytes = self.params.slot_bytes(slot, ParamKind::Scalar)?;
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(Error::InvalidKernelParameters(format!(
                "slot {} holds {} bytes, kernel reads {}",
                slot,
                bytes.len(),
                std::mem::size_of::<T>()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Read an opaque POD struct parameter
    pub fn arg_struct<T: Pod>(&self, slot: usize) -> Result<T> {
        let bytes = self.params.slot_bytes(slot, ParamKind::Struct)?;
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(Error::InvalidKernelParameters(format!(
                "slot {} holds {} bytes, kernel reads struct of {}",
                slot,
                bytes.len(),
                std::mem::size_of::<T>()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Resolve a view parameter as an immutable slice
    pub fn view<T: Pod>(&self, slot: usize) -> Result<&[T]> {
        let (ptr, len) = self.resolve_view::<T>(slot)?;
        // SAFETY: resolve_view bounds-checked the range and verified the
        // element size; the allocation outlives the launch.
        Ok(unsafe { std::slice::from_raw_parts(ptr as *const T, len) })
    }

    /// Resolve a view parameter as a mutable slice
    ///
    /// The simulator trusts the kernel to keep mutable views disjoint, the
    /// same contract a hardware backend gives global memory.
    pub fn view_mut<T: Pod>(&self, slot: usize) -> Result<&mut [T]> {
        let (ptr, len) = self.resolve_view::<T>(slot)?;
        // SAFETY: see `view`; disjointness is the kernel's contract.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr as *mut T, len) })
    }

    fn resolve_view<T: Pod>(&self, slot: usize) -> Result<(*mut u8, usize)> {
        let view = self.params.view_param(slot)?;
        if view.elem_size != std::mem::size_of::<T>() {
            return Err(Error::InvalidKernelParameters(format!(
                "slot {} views {}-byte elements, kernel expects {}",
                slot,
                view.elem_size,
                std::mem::size_of::<T>()
            )));
        }
        let alloc = self.driver.lookup(view.ptr)?;
        let bytes = view.len * view.elem_size;
        CpuDriver::check_range(&alloc, view.byte_offset, bytes)?;
        // SAFETY: offset within the allocation per the check above.
        let ptr = unsafe { alloc.ptr.add(view.byte_offset) };
        Ok((ptr, view.len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_copy_roundtrip() {
        let driver = CpuDriver::new(false);
        let ptr = driver.alloc(64).unwrap();

        let data: Vec<u8> = (0..64).collect();
        driver.copy_in(ptr, 0, &data).unwrap();

        let mut out = vec![0u8; 64];
        driver.copy_out(ptr, 0, &mut out).unwrap();
        assert_eq!(out, data);

        driver.free(ptr).unwrap();
    }

    #[test]
    fn fresh_allocations_are_zeroed() {
        let driver = CpuDriver::new(false);
        let ptr = driver.alloc(32).unwrap();
        let mut out = vec![0xffu8; 32];
        driver.copy_out(ptr, 0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        driver.free(ptr).unwrap();
    }

    #[test]
    fn out_of_range_copy_is_invalid_argument() {
        let driver = CpuDriver::new(false);
        let ptr = driver.alloc(16).unwrap();
        let data = [0u8; 8];
        assert!(matches!(
            driver.copy_in(ptr, 12, &data),
            Err(Error::InvalidArgument(_))
        ));
        driver.free(ptr).unwrap();
    }

    #[test]
    fn budget_exhaustion_reports_out_of_memory() {
        let driver = CpuDriver::with_memory_limit(false, 1024);
        let a = driver.alloc(512).unwrap();
        let b = driver.alloc(512).unwrap();
        assert!(matches!(
            driver.alloc(1),
            Err(Error::OutOfMemory { .. })
        ));
        driver.free(a).unwrap();
        driver.free(b).unwrap();
        // budget restored after free
        let c = driver.alloc(1024).unwrap();
        driver.free(c).unwrap();
    }

    #[test]
    fn double_free_is_invalid_argument() {
        let driver = CpuDriver::new(false);
        let ptr = driver.alloc(8).unwrap();
        driver.free(ptr).unwrap();
        assert!(matches!(driver.free(ptr), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn device_to_device_copy_moves_bytes() {
        let driver = CpuDriver::new(false);
        let src = driver.alloc(32).unwrap();
        let dst = driver.alloc(32).unwrap();
        let data: Vec<u8> = (0..32).collect();
        driver.copy_in(src, 0, &data).unwrap();
        driver.copy_device(src, 0, dst, 0, 32).unwrap();

        let mut out = vec![0u8; 32];
        driver.copy_out(dst, 0, &mut out).unwrap();
        assert_eq!(out, data);
        driver.free(src).unwrap();
        driver.free(dst).unwrap();
    }
}
