//! CUDA driver binding
//!
//! Raw `libcuda` entry points plus the [`DriverBackend`] implementation that
//! translates CUresult codes into typed errors. The `system` ABI resolves to
//! stdcall for the legacy entry points on Windows and cdecl elsewhere.

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_uint};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{DevicePtr, DriverBackend, LaunchDims, MemoryInfo};
use crate::device::{BackendKind, Device, DeviceCapabilities, DeviceId, TensorPrecision};
use crate::error::{Error, Result};
use crate::kernel::{ArtifactPayload, KernelArtifact, ParamBlock};

pub type CUresult = c_int;
pub type CUdevice = c_int;
pub type CUcontext = *mut c_void;
pub type CUmodule = *mut c_void;
pub type CUfunction = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUdeviceptr = u64;

const CUDA_SUCCESS: CUresult = 0;
const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
const CUDA_ERROR_NO_DEVICE: CUresult = 100;
const CUDA_ERROR_INVALID_DEVICE: CUresult = 101;
const CUDA_ERROR_LAUNCH_FAILED: CUresult = 719;
const CUDA_ERROR_LAUNCH_TIMEOUT: CUresult = 702;
const CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES: CUresult = 701;

const CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK: c_int = 1;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: c_int = 75;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: c_int = 76;
const CU_DEVICE_ATTRIBUTE_MANAGED_MEMORY: c_int = 83;
const CU_DEVICE_ATTRIBUTE_MEMORY_POOLS_SUPPORTED: c_int = 115;

#[link(name = "cuda")]
extern "system" {
    fn cuInit(flags: c_uint) -> CUresult;
    fn cuDriverGetVersion(version: *mut c_int) -> CUresult;
    fn cuDeviceGetCount(count: *mut c_int) -> CUresult;
    fn cuDeviceGet(device: *mut CUdevice, ordinal: c_int) -> CUresult;
    fn cuDeviceGetName(name: *mut c_char, len: c_int, device: CUdevice) -> CUresult;
    fn cuDeviceGetAttribute(value: *mut c_int, attribute: c_int, device: CUdevice) -> CUresult;
    fn cuDeviceTotalMem_v2(bytes: *mut usize, device: CUdevice) -> CUresult;
    fn cuCtxCreate_v2(ctx: *mut CUcontext, flags: c_uint, device: CUdevice) -> CUresult;
    fn cuCtxDestroy_v2(ctx: CUcontext) -> CUresult;
    fn cuCtxSetCurrent(ctx: CUcontext) -> CUresult;
    fn cuMemGetInfo_v2(free: *mut usize, total: *mut usize) -> CUresult;
    fn cuMemAlloc_v2(dptr: *mut CUdeviceptr, bytes: usize) -> CUresult;
    fn cuMemAllocHost_v2(pp: *mut *mut c_void, bytes: usize) -> CUresult;
    fn cuMemFree_v2(dptr: CUdeviceptr) -> CUresult;
    fn cuMemFreeHost(p: *mut c_void) -> CUresult;
    fn cuMemcpyHtoD_v2(dst: CUdeviceptr, src: *const c_void, bytes: usize) -> CUresult;
    fn cuMemcpyDtoH_v2(dst: *mut c_void, src: CUdeviceptr, bytes: usize) -> CUresult;
    fn cuMemcpyDtoD_v2(dst: CUdeviceptr, src: CUdeviceptr, bytes: usize) -> CUresult;
    fn cuMemsetD8_v2(dst: CUdeviceptr, value: u8, bytes: usize) -> CUresult;
    fn cuModuleLoadData(module: *mut CUmodule, image: *const c_void) -> CUresult;
    fn cuModuleUnload(module: CUmodule) -> CUresult;
    fn cuModuleGetFunction(func: *mut CUfunction, module: CUmodule, name: *const c_char) -> CUresult;
    fn cuLaunchKernel(
        func: CUfunction,
        grid_x: c_uint,
        grid_y: c_uint,
        grid_z: c_uint,
        block_x: c_uint,
        block_y: c_uint,
        block_z: c_uint,
        shared_bytes: c_uint,
        stream: CUstream,
        params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> CUresult;
    fn cuCtxSynchronize() -> CUresult;
}

fn check(code: CUresult, what: &str) -> Result<()> {
    if code == CUDA_SUCCESS {
        return Ok(());
    }
    Err(match code {
        CUDA_ERROR_OUT_OF_MEMORY => Error::out_of_memory(0),
        CUDA_ERROR_NO_DEVICE | CUDA_ERROR_INVALID_DEVICE => {
            Error::DeviceUnavailable(format!("{}: CUresult {}", what, code))
        }
        CUDA_ERROR_LAUNCH_FAILED | CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES => {
            Error::LaunchFailed(format!("{}: CUresult {}", what, code))
        }
        CUDA_ERROR_LAUNCH_TIMEOUT => Error::Timeout(format!("{}: CUresult {}", what, code)),
        _ => Error::driver(format!("{}: CUresult {}", what, code)),
    })
}

struct LoadedModule {
    module: CUmodule,
    func: CUfunction,
}

// SAFETY: module handles are only used under the owning context.
unsafe impl Send for LoadedModule {}
unsafe impl Sync for LoadedModule {}

/// One bound CUDA device context
pub struct CudaDriver {
    ordinal: i32,
    ctx: Mutex<CUcontext>,
    modules: DashMap<u64, LoadedModule>,
    pinned: DashMap<u64, *mut c_void>,
}

// SAFETY: the raw context pointer is only dereferenced by driver calls that
// are themselves thread-safe once the context is current.
unsafe impl Send for CudaDriver {}
unsafe impl Sync for CudaDriver {}

impl CudaDriver {
    /// Enumerate CUDA devices. Init failure yields a single Unavailable
    /// placeholder so discovery can report the reason; it never panics.
    pub fn enumerate() -> Vec<Device> {
        let rc = unsafe { cuInit(0) };
        if rc != CUDA_SUCCESS {
            info!("CUDA driver present but init failed (CUresult {})", rc);
            return vec![Device::unavailable(
                DeviceId::Cuda(0),
                "CUDA device",
                format!("cuInit failed: CUresult {}", rc),
            )];
        }

        let mut count: c_int = 0;
        if unsafe { cuDeviceGetCount(&mut count) } != CUDA_SUCCESS || count <= 0 {
            info!("no CUDA devices reported");
            return Vec::new();
        }

        let mut version: c_int = 0;
        unsafe { cuDriverGetVersion(&mut version) };
        let driver_version = format!("{}.{}", version / 1000, (version % 1000) / 10);

        (0..count)
            .map(|ordinal| match Self::open(ordinal) {
                Ok((driver, name, caps)) => Device::new(
                    DeviceId::Cuda(ordinal),
                    name,
                    caps,
                    driver_version.clone(),
                    std::sync::Arc::new(driver),
                ),
                Err(e) => {
                    warn!("CUDA device {} failed to initialize: {}", ordinal, e);
                    Device::unavailable(
                        DeviceId::Cuda(ordinal),
                        format!("CUDA device {}", ordinal),
                        e.to_string(),
                    )
                }
            })
            .collect()
    }

    fn open(ordinal: i32) -> Result<(CudaDriver, String, DeviceCapabilities)> {
        let mut dev: CUdevice = 0;
        check(unsafe { cuDeviceGet(&mut dev, ordinal) }, "cuDeviceGet")?;

        let mut name_buf = [0 as c_char; 256];
        check(
            unsafe { cuDeviceGetName(name_buf.as_mut_ptr(), 256, dev) },
            "cuDeviceGetName",
        )?;
        let name = unsafe { std::ffi::CStr::from_ptr(name_buf.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let attr = |attribute: c_int| -> c_int {
            let mut value = 0;
            unsafe { cuDeviceGetAttribute(&mut value, attribute, dev) };
            value
        };
        let major = attr(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR) as u32;
        let minor = attr(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR) as u32;

        let mut tensor_cores = Vec::new();
        if major >= 7 {
            tensor_cores.push(TensorPrecision::F16);
        }
        if major >= 8 {
            tensor_cores.extend([TensorPrecision::Bf16, TensorPrecision::Tf32, TensorPrecision::I8]);
        }

        let caps = DeviceCapabilities {
            compute_capability: (major, minor),
            max_work_group_size: attr(CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK) as u32,
            unified_memory: attr(CU_DEVICE_ATTRIBUTE_MANAGED_MEMORY) != 0,
            memory_pools: attr(CU_DEVICE_ATTRIBUTE_MEMORY_POOLS_SUPPORTED) != 0,
            tensor_cores,
            async_copy: true,
        };

        let mut ctx: CUcontext = std::ptr::null_mut();
        check(unsafe { cuCtxCreate_v2(&mut ctx, 0, dev) }, "cuCtxCreate")?;
        debug!("created CUDA context for device {} ({})", ordinal, name);

        Ok((
            CudaDriver {
                ordinal,
                ctx: Mutex::new(ctx),
                modules: DashMap::new(),
                pinned: DashMap::new(),
            },
            name,
            caps,
        ))
    }

    fn make_current(&self) -> Result<()> {
        check(unsafe { cuCtxSetCurrent(*self.ctx.lock()) }, "cuCtxSetCurrent")
    }

    fn function_for(&self, artifact: &KernelArtifact) -> Result<CUfunction> {
        if let Some(loaded) = self.modules.get(&artifact.uid()) {
            return Ok(loaded.func);
        }
        let image = match artifact.payload() {
            ArtifactPayload::Ptx(bytes) => bytes,
            _ => {
                return Err(Error::Unsupported(format!(
                    "CUDA backend requires a PTX artifact for '{}'",
                    artifact.entry_point()
                )))
            }
        };
        let mut module: CUmodule = std::ptr::null_mut();
        check(
            unsafe { cuModuleLoadData(&mut module, image.as_ptr() as *const c_void) },
            "cuModuleLoadData",
        )?;
        let entry = std::ffi::CString::new(artifact.entry_point())
            .map_err(|_| Error::InvalidArgument("kernel entry point contains NUL".into()))?;
        let mut func: CUfunction = std::ptr::null_mut();
        let rc = unsafe { cuModuleGetFunction(&mut func, module, entry.as_ptr()) };
        if rc != CUDA_SUCCESS {
            unsafe { cuModuleUnload(module) };
            check(rc, "cuModuleGetFunction")?;
        }
        self.modules
            .insert(artifact.uid(), LoadedModule { module, func });
        Ok(func)
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        for entry in self.modules.iter() {
            unsafe { cuModuleUnload(entry.module) };
        }
        let ctx = *self.ctx.lock();
        if !ctx.is_null() {
            unsafe { cuCtxDestroy_v2(ctx) };
        }
    }
}

impl DriverBackend for CudaDriver {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Cuda
    }

    fn memory_info(&self) -> Result<MemoryInfo> {
        self.make_current()?;
        let (mut free, mut total) = (0usize, 0usize);
        check(unsafe { cuMemGetInfo_v2(&mut free, &mut total) }, "cuMemGetInfo")?;
        Ok(MemoryInfo {
            total: total as u64,
            free: free as u64,
            used: (total - free) as u64,
        })
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        self.make_current()?;
        let mut dptr: CUdeviceptr = 0;
        check(unsafe { cuMemAlloc_v2(&mut dptr, bytes.max(1)) }, "cuMemAlloc").map_err(|e| {
            match e {
                Error::OutOfMemory { .. } => Error::out_of_memory(bytes as u64),
                other => other,
            }
        })?;
        Ok(DevicePtr(dptr))
    }

    fn alloc_pinned(&self, bytes: usize) -> Result<DevicePtr> {
        self.make_current()?;
        let mut host: *mut c_void = std::ptr::null_mut();
        check(
            unsafe { cuMemAllocHost_v2(&mut host, bytes.max(1)) },
            "cuMemAllocHost",
        )?;
        let handle = host as u64;
        self.pinned.insert(handle, host);
        Ok(DevicePtr(handle))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.make_current()?;
        if let Some((_, host)) = self.pinned.remove(&ptr.0) {
            return check(unsafe { cuMemFreeHost(host) }, "cuMemFreeHost");
        }
        check(unsafe { cuMemFree_v2(ptr.0) }, "cuMemFree")
    }

    fn copy_in(&self, dst: DevicePtr, dst_offset: usize, src: &[u8]) -> Result<()> {
        self.make_current()?;
        check(
            unsafe {
                cuMemcpyHtoD_v2(
                    dst.0 + dst_offset as u64,
                    src.as_ptr() as *const c_void,
                    src.len(),
                )
            },
            "cuMemcpyHtoD",
        )
    }

    fn copy_out(&self, src: DevicePtr, src_offset: usize, dst: &mut [u8]) -> Result<()> {
        self.make_current()?;
        check(
            unsafe {
                cuMemcpyDtoH_v2(
                    dst.as_mut_ptr() as *mut c_void,
                    src.0 + src_offset as u64,
                    dst.len(),
                )
            },
            "cuMemcpyDtoH",
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
        self.make_current()?;
        check(
            unsafe {
                cuMemcpyDtoD_v2(dst.0 + dst_offset as u64, src.0 + src_offset as u64, bytes)
            },
            "cuMemcpyDtoD",
        )
    }

    fn fill_zero(&self, ptr: DevicePtr, offset: usize, bytes: usize) -> Result<()> {
        self.make_current()?;
        check(
            unsafe { cuMemsetD8_v2(ptr.0 + offset as u64, 0, bytes) },
            "cuMemsetD8",
        )
    }

    fn launch(
        &self,
        artifact: &KernelArtifact,
        grid: LaunchDims,
        block: LaunchDims,
        params: &ParamBlock,
    ) -> Result<()> {
        self.make_current()?;
        let func = self.function_for(artifact)?;
        let mut arg_ptrs = params.abi_pointers();
        check(
            unsafe {
                cuLaunchKernel(
                    func,
                    grid.x,
                    grid.y,
                    grid.z,
                    block.x,
                    block.y,
                    block.z,
                    0,
                    std::ptr::null_mut(),
                    arg_ptrs.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            },
            "cuLaunchKernel",
        )?;
        check(unsafe { cuCtxSynchronize() }, "cuCtxSynchronize")
    }

    fn host_ptr(&self, ptr: DevicePtr) -> Option<*mut u8> {
        self.pinned.get(&ptr.0).map(|p| *p as *mut u8)
    }
}

impl CudaDriver {
    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }
}
