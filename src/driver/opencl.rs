//! OpenCL driver binding
//!
//! Thin binding over the OpenCL loader. Buffers are `cl_mem` objects tracked
//! by handle; kernels come in as SPIR-V artifacts and build lazily per
//! program. Status codes translate to typed errors at this boundary.

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_uint};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{info, warn};

use super::{DevicePtr, DriverBackend, LaunchDims, MemoryInfo};
use crate::device::{BackendKind, Device, DeviceCapabilities, DeviceId};
use crate::error::{Error, Result};
use crate::kernel::{ArtifactPayload, KernelArtifact, ParamBlock, ParamKind};

pub type ClInt = c_int;
pub type ClUint = c_uint;
pub type ClPlatformId = *mut c_void;
pub type ClDeviceId = *mut c_void;
pub type ClContext = *mut c_void;
pub type ClQueue = *mut c_void;
pub type ClMem = *mut c_void;
pub type ClProgram = *mut c_void;
pub type ClKernel = *mut c_void;

const CL_SUCCESS: ClInt = 0;
const CL_MEM_OBJECT_ALLOCATION_FAILURE: ClInt = -4;
const CL_OUT_OF_RESOURCES: ClInt = -5;
const CL_OUT_OF_HOST_MEMORY: ClInt = -6;
const CL_DEVICE_NOT_AVAILABLE: ClInt = -2;

const CL_DEVICE_TYPE_GPU: u64 = 1 << 2;
const CL_MEM_READ_WRITE: u64 = 1 << 0;
const CL_MEM_ALLOC_HOST_PTR: u64 = 1 << 4;
const CL_TRUE: ClUint = 1;

const CL_DEVICE_NAME: ClUint = 0x102B;
const CL_DEVICE_GLOBAL_MEM_SIZE: ClUint = 0x101F;
const CL_DEVICE_MAX_WORK_GROUP_SIZE: ClUint = 0x1004;
const CL_DEVICE_VERSION: ClUint = 0x102F;

#[link(name = "OpenCL")]
extern "system" {
    fn clGetPlatformIDs(
        num_entries: ClUint,
        platforms: *mut ClPlatformId,
        num_platforms: *mut ClUint,
    ) -> ClInt;
    fn clGetDeviceIDs(
        platform: ClPlatformId,
        device_type: u64,
        num_entries: ClUint,
        devices: *mut ClDeviceId,
        num_devices: *mut ClUint,
    ) -> ClInt;
    fn clGetDeviceInfo(
        device: ClDeviceId,
        param: ClUint,
        size: usize,
        value: *mut c_void,
        size_ret: *mut usize,
    ) -> ClInt;
    fn clCreateContext(
        properties: *const isize,
        num_devices: ClUint,
        devices: *const ClDeviceId,
        pfn_notify: *mut c_void,
        user_data: *mut c_void,
        errcode: *mut ClInt,
    ) -> ClContext;
    fn clReleaseContext(ctx: ClContext) -> ClInt;
    fn clCreateCommandQueue(
        ctx: ClContext,
        device: ClDeviceId,
        properties: u64,
        errcode: *mut ClInt,
    ) -> ClQueue;
    fn clReleaseCommandQueue(queue: ClQueue) -> ClInt;
    fn clCreateBuffer(
        ctx: ClContext,
        flags: u64,
        size: usize,
        host_ptr: *mut c_void,
        errcode: *mut ClInt,
    ) -> ClMem;
    fn clReleaseMemObject(mem: ClMem) -> ClInt;
    fn clEnqueueWriteBuffer(
        queue: ClQueue,
        buffer: ClMem,
        blocking: ClUint,
        offset: usize,
        size: usize,
        ptr: *const c_void,
        num_events: ClUint,
        wait_list: *const c_void,
        event: *mut c_void,
    ) -> ClInt;
    fn clEnqueueReadBuffer(
        queue: ClQueue,
        buffer: ClMem,
        blocking: ClUint,
        offset: usize,
        size: usize,
        ptr: *mut c_void,
        num_events: ClUint,
        wait_list: *const c_void,
        event: *mut c_void,
    ) -> ClInt;
    fn clEnqueueCopyBuffer(
        queue: ClQueue,
        src: ClMem,
        dst: ClMem,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        num_events: ClUint,
        wait_list: *const c_void,
        event: *mut c_void,
    ) -> ClInt;
    fn clEnqueueFillBuffer(
        queue: ClQueue,
        buffer: ClMem,
        pattern: *const c_void,
        pattern_size: usize,
        offset: usize,
        size: usize,
        num_events: ClUint,
        wait_list: *const c_void,
        event: *mut c_void,
    ) -> ClInt;
    fn clCreateProgramWithIL(
        ctx: ClContext,
        il: *const c_void,
        length: usize,
        errcode: *mut ClInt,
    ) -> ClProgram;
    fn clBuildProgram(
        program: ClProgram,
        num_devices: ClUint,
        devices: *const ClDeviceId,
        options: *const c_char,
        pfn_notify: *mut c_void,
        user_data: *mut c_void,
    ) -> ClInt;
    fn clReleaseProgram(program: ClProgram) -> ClInt;
    fn clCreateKernel(program: ClProgram, name: *const c_char, errcode: *mut ClInt) -> ClKernel;
    fn clReleaseKernel(kernel: ClKernel) -> ClInt;
    fn clSetKernelArg(
        kernel: ClKernel,
        index: ClUint,
        size: usize,
        value: *const c_void,
    ) -> ClInt;
    fn clEnqueueNDRangeKernel(
        queue: ClQueue,
        kernel: ClKernel,
        work_dim: ClUint,
        global_offset: *const usize,
        global_size: *const usize,
        local_size: *const usize,
        num_events: ClUint,
        wait_list: *const c_void,
        event: *mut c_void,
    ) -> ClInt;
    fn clFinish(queue: ClQueue) -> ClInt;
}

fn check(code: ClInt, what: &str) -> Result<()> {
    if code == CL_SUCCESS {
        return Ok(());
    }
    Err(match code {
        CL_MEM_OBJECT_ALLOCATION_FAILURE | CL_OUT_OF_HOST_MEMORY => Error::out_of_memory(0),
        CL_OUT_OF_RESOURCES => Error::transient_driver(format!("{}: cl error {}", what, code)),
        CL_DEVICE_NOT_AVAILABLE => {
            Error::DeviceUnavailable(format!("{}: cl error {}", what, code))
        }
        _ => Error::driver(format!("{}: cl error {}", what, code)),
    })
}

struct LoadedKernel {
    program: ClProgram,
    kernel: ClKernel,
}

// SAFETY: handles used only through the owning queue's driver calls.
unsafe impl Send for LoadedKernel {}
unsafe impl Sync for LoadedKernel {}

/// One bound OpenCL device
pub struct OpenClDriver {
    device: ClDeviceId,
    ctx: ClContext,
    queue: ClQueue,
    buffers: DashMap<u64, ClMem>,
    kernels: DashMap<u64, LoadedKernel>,
    next_handle: AtomicU64,
    total_mem: u64,
    allocated: AtomicU64,
}

// SAFETY: OpenCL context/queue objects are thread-safe per the spec.
unsafe impl Send for OpenClDriver {}
unsafe impl Sync for OpenClDriver {}

impl OpenClDriver {
    /// Enumerate GPU devices across all platforms
    pub fn enumerate() -> Vec<Device> {
        let mut num_platforms: ClUint = 0;
        if unsafe { clGetPlatformIDs(0, std::ptr::null_mut(), &mut num_platforms) } != CL_SUCCESS
            || num_platforms == 0
        {
            info!("no OpenCL platforms reported");
            return Vec::new();
        }
        let mut platforms = vec![std::ptr::null_mut(); num_platforms as usize];
        unsafe { clGetPlatformIDs(num_platforms, platforms.as_mut_ptr(), &mut num_platforms) };

        let mut devices = Vec::new();
        for (platform_idx, platform) in platforms.into_iter().enumerate() {
            let mut count: ClUint = 0;
            let rc = unsafe {
                clGetDeviceIDs(platform, CL_DEVICE_TYPE_GPU, 0, std::ptr::null_mut(), &mut count)
            };
            if rc != CL_SUCCESS || count == 0 {
                continue;
            }
            let mut ids = vec![std::ptr::null_mut(); count as usize];
            unsafe { clGetDeviceIDs(platform, CL_DEVICE_TYPE_GPU, count, ids.as_mut_ptr(), &mut count) };

            for (device_idx, raw) in ids.into_iter().enumerate() {
                let id = DeviceId::OpenCl {
                    platform: platform_idx as u32,
                    device: device_idx as u32,
                };
                match Self::open(raw) {
                    Ok((driver, name, version, caps)) => {
                        devices.push(Device::new(id, name, caps, version, std::sync::Arc::new(driver)))
                    }
                    Err(e) => {
                        warn!("OpenCL device {} failed to initialize: {}", id, e);
                        devices.push(Device::unavailable(id, "OpenCL device", e.to_string()));
                    }
                }
            }
        }
        devices
    }

    fn open(raw: ClDeviceId) -> Result<(OpenClDriver, String, String, DeviceCapabilities)> {
        let info_string = |param: ClUint| -> String {
            let mut buf = [0u8; 256];
            let mut len = 0usize;
            unsafe {
                clGetDeviceInfo(raw, param, buf.len(), buf.as_mut_ptr() as *mut c_void, &mut len)
            };
            String::from_utf8_lossy(&buf[..len.saturating_sub(1).min(buf.len())]).into_owned()
        };
        let name = info_string(CL_DEVICE_NAME);
        let version = info_string(CL_DEVICE_VERSION);

        let mut total_mem: u64 = 0;
        unsafe {
            clGetDeviceInfo(
                raw,
                CL_DEVICE_GLOBAL_MEM_SIZE,
                8,
                &mut total_mem as *mut u64 as *mut c_void,
                std::ptr::null_mut(),
            )
        };
        let mut max_wg: usize = 0;
        unsafe {
            clGetDeviceInfo(
                raw,
                CL_DEVICE_MAX_WORK_GROUP_SIZE,
                std::mem::size_of::<usize>(),
                &mut max_wg as *mut usize as *mut c_void,
                std::ptr::null_mut(),
            )
        };

        let mut err: ClInt = 0;
        let ctx = unsafe {
            clCreateContext(std::ptr::null(), 1, &raw, std::ptr::null_mut(), std::ptr::null_mut(), &mut err)
        };
        check(err, "clCreateContext")?;
        let queue = unsafe { clCreateCommandQueue(ctx, raw, 0, &mut err) };
        if err != CL_SUCCESS {
            unsafe { clReleaseContext(ctx) };
            check(err, "clCreateCommandQueue")?;
        }

        let caps = DeviceCapabilities {
            compute_capability: (0, 0),
            max_work_group_size: max_wg as u32,
            unified_memory: false,
            memory_pools: false,
            tensor_cores: Vec::new(),
            async_copy: true,
        };

        Ok((
            OpenClDriver {
                device: raw,
                ctx,
                queue,
                buffers: DashMap::new(),
                kernels: DashMap::new(),
                next_handle: AtomicU64::new(1),
                total_mem,
                allocated: AtomicU64::new(0),
            },
            name,
            version,
            caps,
        ))
    }

    fn mem_for(&self, ptr: DevicePtr) -> Result<ClMem> {
        self.buffers
            .get(&ptr.0)
            .map(|m| *m)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown cl buffer {:#x}", ptr.0)))
    }

    fn alloc_flags(&self, bytes: usize, flags: u64) -> Result<DevicePtr> {
        let mut err: ClInt = 0;
        let mem = unsafe {
            clCreateBuffer(self.ctx, flags, bytes.max(1), std::ptr::null_mut(), &mut err)
        };
        check(err, "clCreateBuffer").map_err(|e| match e {
            Error::OutOfMemory { .. } => Error::out_of_memory(bytes as u64),
            other => other,
        })?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.buffers.insert(handle, mem);
        self.allocated.fetch_add(bytes as u64, Ordering::Relaxed);
        Ok(DevicePtr(handle))
    }

    fn kernel_for(&self, artifact: &KernelArtifact) -> Result<ClKernel> {
        if let Some(loaded) = self.kernels.get(&artifact.uid()) {
            return Ok(loaded.kernel);
        }
        let il = match artifact.payload() {
            ArtifactPayload::SpirV(bytes) => bytes,
            _ => {
                return Err(Error::Unsupported(format!(
                    "OpenCL backend requires a SPIR-V artifact for '{}'",
                    artifact.entry_point()
                )))
            }
        };
        let mut err: ClInt = 0;
        let program =
            unsafe { clCreateProgramWithIL(self.ctx, il.as_ptr() as *const c_void, il.len(), &mut err) };
        check(err, "clCreateProgramWithIL")?;
        let rc = unsafe {
            clBuildProgram(program, 1, &self.device, std::ptr::null(), std::ptr::null_mut(), std::ptr::null_mut())
        };
        if rc != CL_SUCCESS {
            unsafe { clReleaseProgram(program) };
            return Err(Error::KernelCompilationFailed {
                kernel: artifact.entry_point().to_string(),
                message: format!("clBuildProgram: cl error {}", rc),
            });
        }
        let entry = std::ffi::CString::new(artifact.entry_point())
            .map_err(|_| Error::InvalidArgument("kernel entry point contains NUL".into()))?;
        let kernel = unsafe { clCreateKernel(program, entry.as_ptr(), &mut err) };
        if err != CL_SUCCESS {
            unsafe { clReleaseProgram(program) };
            check(err, "clCreateKernel")?;
        }
        self.kernels
            .insert(artifact.uid(), LoadedKernel { program, kernel });
        Ok(kernel)
    }
}

impl Drop for OpenClDriver {
    fn drop(&mut self) {
        for entry in self.kernels.iter() {
            unsafe {
                clReleaseKernel(entry.kernel);
                clReleaseProgram(entry.program);
            }
        }
        for entry in self.buffers.iter() {
            unsafe { clReleaseMemObject(*entry) };
        }
        unsafe {
            clReleaseCommandQueue(self.queue);
            clReleaseContext(self.ctx);
        }
    }
}

impl DriverBackend for OpenClDriver {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::OpenCl
    }

    fn memory_info(&self) -> Result<MemoryInfo> {
        let used = self.allocated.load(Ordering::Relaxed);
        Ok(MemoryInfo {
            total: self.total_mem,
            free: self.total_mem.saturating_sub(used),
            used,
        })
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        self.alloc_flags(bytes, CL_MEM_READ_WRITE)
    }

    fn alloc_pinned(&self, bytes: usize) -> Result<DevicePtr> {
        self.alloc_flags(bytes, CL_MEM_READ_WRITE | CL_MEM_ALLOC_HOST_PTR)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        match self.buffers.remove(&ptr.0) {
            Some((_, mem)) => check(unsafe { clReleaseMemObject(mem) }, "clReleaseMemObject"),
            None => Err(Error::InvalidArgument(format!(
                "free of unknown cl buffer {:#x}",
                ptr.0
            ))),
        }
    }

    fn copy_in(&self, dst: DevicePtr, dst_offset: usize, src: &[u8]) -> Result<()> {
        let mem = self.mem_for(dst)?;
        check(
            unsafe {
                clEnqueueWriteBuffer(
                    self.queue,
                    mem,
                    CL_TRUE,
                    dst_offset,
                    src.len(),
                    src.as_ptr() as *const c_void,
                    0,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                )
            },
            "clEnqueueWriteBuffer",
        )
    }

    fn copy_out(&self, src: DevicePtr, src_offset: usize, dst: &mut [u8]) -> Result<()> {
        let mem = self.mem_for(src)?;
        check(
            unsafe {
                clEnqueueReadBuffer(
                    self.queue,
                    mem,
                    CL_TRUE,
                    src_offset,
                    dst.len(),
                    dst.as_mut_ptr() as *mut c_void,
                    0,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                )
            },
            "clEnqueueReadBuffer",
        )
    }

    fn copy_device(
        &self,
        src: DevicePtr,
        src_offset: usize,
        dst: DevicePtr,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<()> {
        let src_mem = self.mem_for(src)?;
        let dst_mem = self.mem_for(dst)?;
        check(
            unsafe {
                clEnqueueCopyBuffer(
                    self.queue,
                    src_mem,
                    dst_mem,
                    src_offset,
                    dst_offset,
                    bytes,
                    0,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                )
            },
            "clEnqueueCopyBuffer",
        )?;
        check(unsafe { clFinish(self.queue) }, "clFinish")
    }

    fn fill_zero(&self, ptr: DevicePtr, offset: usize, bytes: usize) -> Result<()> {
        let mem = self.mem_for(ptr)?;
        let zero: u8 = 0;
        check(
            unsafe {
                clEnqueueFillBuffer(
                    self.queue,
                    mem,
                    &zero as *const u8 as *const c_void,
                    1,
                    offset,
                    bytes,
                    0,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                )
            },
            "clEnqueueFillBuffer",
        )?;
        check(unsafe { clFinish(self.queue) }, "clFinish")
    }

    fn launch(
        &self,
        artifact: &KernelArtifact,
        grid: LaunchDims,
        block: LaunchDims,
        params: &ParamBlock,
    ) -> Result<()> {
        let kernel = self.kernel_for(artifact)?;

        for (index, slot) in params.packed_slots().enumerate() {
            match slot.kind {
                ParamKind::View => {
                    let view = params.view_param(index)?;
                    let mem = self.mem_for(view.ptr)?;
                    check(
                        unsafe {
                            clSetKernelArg(
                                kernel,
                                index as ClUint,
                                std::mem::size_of::<ClMem>(),
                                &mem as *const ClMem as *const c_void,
                            )
                        },
                        "clSetKernelArg",
                    )?;
                }
                ParamKind::Scalar | ParamKind::Struct => {
                    let bytes = params.slot_bytes(index, slot.kind)?;
                    check(
                        unsafe {
                            clSetKernelArg(
                                kernel,
                                index as ClUint,
                                bytes.len(),
                                bytes.as_ptr() as *const c_void,
                            )
                        },
                        "clSetKernelArg",
                    )?;
                }
            }
        }

        let global = [
            (grid.x as usize) * (block.x as usize),
            (grid.y as usize) * (block.y as usize),
            (grid.z as usize) * (block.z as usize),
        ];
        let local = [block.x as usize, block.y as usize, block.z as usize];
        check(
            unsafe {
                clEnqueueNDRangeKernel(
                    self.queue,
                    kernel,
                    3,
                    std::ptr::null(),
                    global.as_ptr(),
                    local.as_ptr(),
                    0,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                )
            },
            "clEnqueueNDRangeKernel",
        )?;
        check(unsafe { clFinish(self.queue) }, "clFinish")
    }

    fn host_ptr(&self, _ptr: DevicePtr) -> Option<*mut u8> {
        // mapping requires clEnqueueMapBuffer bookkeeping; not exposed
        None
    }
}
