//! Per-device runtime façade
//!
//! One accelerator binds one device: it allocates buffers, creates streams,
//! loads kernels through the accelerator-scoped cache, and tears everything
//! down in a fixed order. `load_kernel_cached` is the integration point
//! with external backends: at most one compile runs per fingerprint, with
//! concurrent callers parked on a per-key slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::device::{Device, DeviceId, TensorPrecision};
use crate::driver::{DriverBackend, MemoryInfo};
use crate::error::recovery::RecoveryHooks;
use crate::error::{
    Error, ErrorEvent, ErrorLogger, RecoveryDispatcher, Result,
};
use crate::kernel::{
    CachedKernel, Fingerprint, KernelArtifact, KernelCache, KernelSignature, Launcher,
};
use crate::memory::buffer::BufferRegistry;
use crate::memory::{
    BufferPool, Element, LayoutHint, MemoryBuffer, MemoryLocation, PoolStats, Shape,
    UnifiedBuffer,
};
use crate::stream::Stream;

static ACCELERATOR_IDS: AtomicU64 = AtomicU64::new(1);

enum SlotState {
    Pending,
    Done,
    Failed(Error),
}

/// Per-fingerprint single-flight barrier
struct CompileSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl CompileSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Pending),
            cond: Condvar::new(),
        })
    }

    fn finish(&self, outcome: std::result::Result<(), Error>) {
        let mut state = self.state.lock();
        *state = match outcome {
            Ok(()) => SlotState::Done,
            Err(e) => SlotState::Failed(e),
        };
        self.cond.notify_all();
    }

    /// Wait for the compiling caller; Ok(()) means the cache now holds the
    /// kernel, Err carries the shared failure.
    fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                SlotState::Done => return Ok(()),
                SlotState::Failed(e) => return Err(e.duplicate()),
                SlotState::Pending => match timeout {
                    Some(timeout) => {
                        if self.cond.wait_for(&mut state, timeout).timed_out() {
                            if matches!(&*state, SlotState::Pending) {
                                return Err(Error::Timeout(
                                    "kernel compile barrier".into(),
                                ));
                            }
                        }
                    }
                    None => self.cond.wait(&mut state),
                },
            }
        }
    }
}

struct AcceleratorInner {
    id: u64,
    device: Device,
    driver: Arc<dyn DriverBackend>,
    config: RuntimeConfig,
    default_stream: Stream,
    streams: Mutex<Vec<Weak<Stream>>>,
    /// Every live allocation made through this accelerator; teardown
    /// cascades dispose through it
    buffers: Arc<BufferRegistry>,
    pool: BufferPool,
    cache: Arc<KernelCache>,
    inflight: DashMap<Fingerprint, Arc<CompileSlot>>,
    recovery: RecoveryDispatcher,
    admitting: AtomicBool,
    closed: AtomicBool,
}

/// Bound device runtime
#[derive(Clone)]
pub struct Accelerator {
    inner: Arc<AcceleratorInner>,
}

impl Accelerator {
    /// Bind `device`. Fails with DeviceUnavailable when the device has no
    /// initialized driver.
    pub fn new(device: Device, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let driver = device.driver()?;
        let id = ACCELERATOR_IDS.fetch_add(1, Ordering::Relaxed);
        let logger = Arc::new(ErrorLogger::default());
        let recovery = RecoveryDispatcher::new(logger, config.retry.clone());
        let buffers = Arc::new(BufferRegistry::default());
        let pool = BufferPool::new(driver.clone(), id, config.pool.clone(), buffers.clone());
        let cache = Arc::new(KernelCache::new(config.cache.clone()));
        if config.cache.persistent {
            if let Err(e) = cache.preload() {
                warn!("kernel cache preload failed: {}", e);
            }
        }
        let default_stream = Stream::spawn(&format!("accel{}", id))?;
        info!("accelerator {} bound to {}", id, device.name());
        Ok(Self {
            inner: Arc::new(AcceleratorInner {
                id,
                device,
                driver,
                config,
                default_stream,
                streams: Mutex::new(Vec::new()),
                buffers,
                pool,
                cache,
                inflight: DashMap::new(),
                recovery,
                admitting: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device.id()
    }

    /// Diagnostic name: runtime, accelerator ordinal, device
    pub fn debug_name(&self) -> String {
        format!(
            "{} accel#{} [{}]",
            env!("CARGO_PKG_NAME"),
            self.inner.id,
            self.inner.device.name()
        )
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn recovery(&self) -> &RecoveryDispatcher {
        &self.inner.recovery
    }

    pub fn cache(&self) -> &Arc<KernelCache> {
        &self.inner.cache
    }

    pub fn memory_info(&self) -> Result<MemoryInfo> {
        self.inner.driver.memory_info()
    }

    pub fn supports_tensor_cores(&self) -> bool {
        !self.inner.device.capabilities().tensor_cores.is_empty()
    }

    pub fn supported_precisions(&self) -> &[TensorPrecision] {
        &self.inner.device.capabilities().tensor_cores
    }

    fn ensure_admitting(&self) -> Result<()> {
        if self.inner.admitting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::DeviceUnavailable(format!(
                "{} is shutting down",
                self.debug_name()
            )))
        }
    }

    /// Allocate a dense buffer. OutOfMemory goes through the recovery
    /// dispatcher: one pool trim, one retry, then it surfaces with its
    /// suggestion attached.
    pub fn allocate<T: Element>(
        &self,
        shape: impl Into<Shape>,
        hint: LayoutHint,
    ) -> Result<MemoryBuffer<T>> {
        self.ensure_admitting()?;
        let shape = shape.into();
        let location = hint.resolve(
            shape.len(),
            self.inner.device.capabilities().unified_memory,
        );
        let bytes = shape.len() * std::mem::size_of::<T>();

        let driver = &self.inner.driver;
        let pool = self.inner.pool.clone();
        let trim = move || pool.trim();
        let ptr = self.inner.recovery.run(
            "allocate",
            RecoveryHooks::with_trim(&trim),
            || match location {
                MemoryLocation::Pinned => driver.alloc_pinned(bytes),
                _ => driver.alloc(bytes),
            },
        )?;
        debug!(
            "allocated {} bytes ({:?}) on {}",
            bytes,
            location,
            self.inner.device.id()
        );
        Ok(MemoryBuffer::from_alloc(
            driver.clone(),
            ptr,
            bytes,
            shape,
            location,
            self.inner.id,
            &self.inner.buffers,
        ))
    }

    /// Allocate a coherent unified buffer
    pub fn allocate_unified<T: Element>(&self, len: usize) -> Result<UnifiedBuffer<T>> {
        self.ensure_admitting()?;
        if !self.inner.device.capabilities().unified_memory {
            return Err(Error::Unsupported(format!(
                "{} has no unified memory",
                self.inner.device.name()
            )));
        }
        let driver = self.inner.driver.clone();
        let pool = self.inner.pool.clone();
        let trim = move || pool.trim();
        self.inner
            .recovery
            .run("allocate_unified", RecoveryHooks::with_trim(&trim), || {
                UnifiedBuffer::allocate(driver.clone(), len, self.inner.id, &self.inner.buffers)
            })
    }

    /// Rent from the pool (or allocate directly when pooling is disabled)
    pub fn rent<T: Element>(&self, min_len: usize) -> Result<MemoryBuffer<T>> {
        self.ensure_admitting()?;
        if !self.inner.config.enable_memory_pool {
            return self.allocate(Shape::D1(min_len), LayoutHint::GpuOptimized);
        }
        let pool = self.inner.pool.clone();
        let trim = move || pool.trim();
        self.inner
            .recovery
            .run("rent", RecoveryHooks::with_trim(&trim), || {
                self.inner.pool.rent::<T>(min_len)
            })
    }

    /// Async rent; the allocation itself is quick, the recovery backoff is
    /// what may suspend.
    pub async fn rent_async<T: Element>(&self, min_len: usize) -> Result<MemoryBuffer<T>> {
        self.ensure_admitting()?;
        let this = self.clone();
        let pool = self.inner.pool.clone();
        let trim: Arc<dyn Fn() + Send + Sync> = Arc::new(move || pool.trim());
        self.inner
            .recovery
            .run_async("rent", Some(trim), move || {
                let this = this.clone();
                async move {
                    if !this.inner.config.enable_memory_pool {
                        this.allocate(Shape::D1(min_len), LayoutHint::GpuOptimized)
                    } else {
                        this.inner.pool.rent::<T>(min_len)
                    }
                }
            })
            .await
    }

    /// Return a rented buffer to the pool
    pub fn return_buffer<T: Element>(&self, buffer: MemoryBuffer<T>, clear: bool) -> Result<()> {
        self.inner.pool.return_buffer(buffer, clear)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn trim_pool(&self) {
        self.inner.pool.trim()
    }

    pub fn default_stream(&self) -> &Stream {
        &self.inner.default_stream
    }

    pub fn create_stream(&self) -> Result<Arc<Stream>> {
        self.ensure_admitting()?;
        let stream = Arc::new(Stream::spawn(&format!("accel{}", self.inner.id))?);
        self.inner.streams.lock().push(Arc::downgrade(&stream));
        Ok(stream)
    }

    /// Wrap a ready artifact without touching the cache
    pub fn load_kernel(
        &self,
        signature: &KernelSignature,
        artifact: KernelArtifact,
    ) -> Result<Launcher> {
        self.ensure_admitting()?;
        if artifact.layout().slots().len() != signature.params.len() {
            return Err(Error::InvalidKernelParameters(format!(
                "artifact for '{}' declares {} parameters, signature has {}",
                signature.name,
                artifact.layout().slots().len(),
                signature.params.len()
            )));
        }
        Ok(Launcher::new(Arc::new(artifact), self.inner.driver.clone()))
    }

    /// Cached kernel load: fingerprint → lookup → compile once on miss.
    ///
    /// Concurrent callers with the same (signature, version) park on a
    /// per-key slot; exactly one invokes `source_fn`, and every caller
    /// receives the same kernel or the same error.
    pub fn load_kernel_cached<F>(
        &self,
        signature: &KernelSignature,
        version: &str,
        source_fn: F,
    ) -> Result<Launcher>
    where
        F: FnOnce() -> Result<KernelArtifact>,
    {
        self.load_kernel_cached_with(signature, version, None, HashMap::new(), source_fn)
    }

    /// As [`load_kernel_cached`](Self::load_kernel_cached) with a barrier
    /// timeout and entry metadata.
    pub fn load_kernel_cached_with<F>(
        &self,
        signature: &KernelSignature,
        version: &str,
        barrier_timeout: Option<Duration>,
        metadata: HashMap<String, String>,
        source_fn: F,
    ) -> Result<Launcher>
    where
        F: FnOnce() -> Result<KernelArtifact>,
    {
        self.ensure_admitting()?;
        let fingerprint = signature.fingerprint(version);

        if let Some(hit) = self.inner.cache.try_get(&fingerprint, version) {
            return Ok(self.launcher_for(&hit));
        }

        loop {
            let slot = match self.inner.inflight.entry(fingerprint) {
                Entry::Vacant(vacant) => {
                    let slot = CompileSlot::new();
                    vacant.insert(slot.clone());
                    // this caller compiles
                    return self.compile_and_publish(
                        fingerprint,
                        signature,
                        version,
                        metadata,
                        slot,
                        source_fn,
                    );
                }
                Entry::Occupied(occupied) => occupied.get().clone(),
            };

            // someone else is compiling; park until they publish
            slot.wait(barrier_timeout)?;
            match self.inner.cache.try_get(&fingerprint, version) {
                Some(hit) => return Ok(self.launcher_for(&hit)),
                // evicted between publish and lookup; start over
                None => continue,
            }
        }
    }

    fn compile_and_publish<F>(
        &self,
        fingerprint: Fingerprint,
        signature: &KernelSignature,
        version: &str,
        metadata: HashMap<String, String>,
        slot: Arc<CompileSlot>,
        source_fn: F,
    ) -> Result<Launcher>
    where
        F: FnOnce() -> Result<KernelArtifact>,
    {
        debug!(
            "compiling kernel '{}' at version {}",
            signature.name, version
        );
        let outcome = source_fn();
        let result = match outcome {
            Ok(artifact) => {
                let cached = self
                    .inner
                    .cache
                    .put(fingerprint, artifact, version, metadata);
                slot.finish(Ok(()));
                Ok(self.launcher_for(&cached))
            }
            Err(e) => {
                let err = match e {
                    already @ Error::KernelCompilationFailed { .. } => already,
                    other => Error::KernelCompilationFailed {
                        kernel: signature.name.clone(),
                        message: other.to_string(),
                    },
                };
                self.inner.recovery.logger().report(
                    ErrorEvent::new(&err, "load_kernel_cached")
                        .with_device(self.device_id())
                        .with_kernel(signature.name.clone()),
                );
                slot.finish(Err(err.duplicate()));
                Err(err)
            }
        };
        self.inner.inflight.remove(&fingerprint);
        result
    }

    fn launcher_for(&self, cached: &CachedKernel) -> Launcher {
        Launcher::new(cached.artifact().clone(), self.inner.driver.clone())
    }

    /// Ordered teardown: stop admission, cancel streams, drain bounded by
    /// `shutdown_timeout`, free every buffer still registered, drain the
    /// pool, persist and clear the cache. Idempotent; later calls are
    /// no-ops.
    pub fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.admitting.store(false, Ordering::Release);
        info!("{} shutting down", self.debug_name());

        self.inner.default_stream.cancel();
        let streams: Vec<Arc<Stream>> = {
            let mut held = self.inner.streams.lock();
            held.retain(|w| w.strong_count() > 0);
            held.iter().filter_map(Weak::upgrade).collect()
        };
        for stream in &streams {
            stream.cancel();
        }

        let timeout = self.inner.config.shutdown_timeout;
        let mut drain_error = None;
        for stream in streams.iter().map(Arc::as_ref).chain([&self.inner.default_stream]) {
            if let Err(e) = stream.flush_for_shutdown(timeout) {
                let fatal = Error::InternalInvariantViolated(format!(
                    "stream {} abandoned {} pending commands at shutdown: {}",
                    stream.id(),
                    stream.pending(),
                    e
                ));
                self.inner
                    .recovery
                    .logger()
                    .report(ErrorEvent::new(&fatal, "shutdown").with_device(self.device_id()));
                drain_error.get_or_insert(fatal);
            }
        }

        // dispose cascades into buffers callers still hold
        let released = self.inner.buffers.dispose_all();
        if released > 0 {
            info!("{} released {} live buffers", self.debug_name(), released);
        }
        self.inner.pool.drain();
        self.inner.pool.stop_maintenance();

        if self.inner.config.cache.persistent {
            if let Err(e) = self.inner.cache.persist() {
                warn!("kernel cache persist at shutdown failed: {}", e);
            }
        }
        self.inner.cache.clear();

        match drain_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Drop for AcceleratorInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.admitting.store(false, Ordering::Release);
            self.buffers.dispose_all();
            self.pool.drain();
            self.pool.stop_maintenance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PreferredBackend;
    use crate::device::{BackendKind, DeviceCatalog, DeviceFilter};
    use crate::driver::LaunchDims;
    use crate::kernel::{ParamDescriptor, ParamLayout};
    use std::sync::atomic::AtomicU32;

    fn cpu_accelerator() -> Accelerator {
        let catalog = DeviceCatalog::probe(PreferredBackend::Cpu);
        let device = catalog
            .discover(&DeviceFilter::backend(BackendKind::Cpu))
            .remove(0);
        Accelerator::new(device, RuntimeConfig::default()).unwrap()
    }

    fn iota_signature() -> KernelSignature {
        KernelSignature::new("iota", BackendKind::Cpu)
            .with_param(ParamDescriptor::view::<i32>())
    }

    fn iota_artifact() -> KernelArtifact {
        let layout = ParamLayout::from_descriptors(&[ParamDescriptor::view::<i32>()]);
        KernelArtifact::host_fn("iota", layout, |ctx| {
            let out = ctx.view_mut::<i32>(0)?;
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = i as i32;
            }
            Ok(())
        })
    }

    #[test]
    fn allocate_upload_download_round_trip() {
        let accel = cpu_accelerator();
        let buffer = accel
            .allocate::<f32>(Shape::D1(256), LayoutHint::GpuOptimized)
            .unwrap();
        let data: Vec<f32> = (0..256).map(|i| i as f32 * 0.5).collect();
        buffer.copy_from_host(&data, None).unwrap();
        let mut back = vec![0.0f32; 256];
        buffer.copy_to_host(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn cached_load_compiles_once_per_version() {
        let accel = cpu_accelerator();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            accel
                .load_kernel_cached(&iota_signature(), "1.0.0", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(iota_artifact())
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // new version compiles again
        accel
            .load_kernel_cached(&iota_signature(), "2.0.0", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(iota_artifact())
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_cached_loads_share_one_compile() {
        let accel = cpu_accelerator();
        let calls = Arc::new(AtomicU32::new(0));
        let start = Arc::new(std::sync::Barrier::new(8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let accel = accel.clone();
            let calls = calls.clone();
            let start = start.clone();
            handles.push(std::thread::spawn(move || {
                start.wait();
                accel.load_kernel_cached(&iota_signature(), "1.0.0", move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // widen the race window
                    std::thread::sleep(Duration::from_millis(50));
                    Ok(iota_artifact())
                })
            }));
        }
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_failures_share_one_error() {
        let accel = cpu_accelerator();
        let calls = Arc::new(AtomicU32::new(0));
        let start = Arc::new(std::sync::Barrier::new(4));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let accel = accel.clone();
            let calls = calls.clone();
            let start = start.clone();
            handles.push(std::thread::spawn(move || {
                start.wait();
                accel.load_kernel_cached(&iota_signature(), "bad", move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    Err(Error::driver("ptxas exited with code 1"))
                })
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // the barrier admits one compile per concurrent burst
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            match result {
                Err(Error::KernelCompilationFailed { kernel, message }) => {
                    assert_eq!(kernel, "iota");
                    assert!(message.contains("ptxas"));
                }
                other => panic!("expected KernelCompilationFailed, got {:?}", other.err()),
            }
        }
    }

    #[test]
    fn end_to_end_iota_launch() {
        let accel = cpu_accelerator();
        let launcher = accel
            .load_kernel_cached(&iota_signature(), "1.0.0", || Ok(iota_artifact()))
            .unwrap();

        let buffer = accel
            .allocate::<i32>(Shape::D1(1000), LayoutHint::GpuOptimized)
            .unwrap();
        launcher
            .launch_sync(
                LaunchDims::grid_for(1000, 256),
                LaunchDims::linear(256),
                vec![buffer.view().arg()],
                accel.default_stream(),
            )
            .unwrap();

        let mut host = vec![0i32; 1000];
        buffer.copy_to_host(&mut host).unwrap();
        for (i, v) in host.iter().enumerate() {
            assert_eq!(*v, i as i32);
        }
    }

    #[test]
    fn shutdown_stops_admission() {
        let accel = cpu_accelerator();
        accel.shutdown().unwrap();
        assert!(accel.is_closed());
        assert!(matches!(
            accel.allocate::<u8>(Shape::D1(16), LayoutHint::GpuOptimized),
            Err(Error::DeviceUnavailable(_))
        ));
        // idempotent
        accel.shutdown().unwrap();
    }

    #[test]
    fn shutdown_cascades_into_buffers_still_held() {
        let accel = cpu_accelerator();
        let direct = accel
            .allocate::<u32>(Shape::D1(64), LayoutHint::GpuOptimized)
            .unwrap();
        let rented = accel.rent::<u32>(64).unwrap();
        let unified = accel.allocate_unified::<u32>(64).unwrap();
        // a buffer already dropped must not confuse the walk
        drop(
            accel
                .allocate::<u32>(Shape::D1(8), LayoutHint::GpuOptimized)
                .unwrap(),
        );

        accel.shutdown().unwrap();

        assert!(direct.is_disposed());
        assert!(rented.is_disposed());
        assert!(unified.is_disposed());
        let mut host = vec![0u32; 64];
        assert!(matches!(
            direct.copy_to_host(&mut host),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            unified.ensure_device(),
            Err(Error::InvalidArgument(_))
        ));
        // the disposed rental can no longer be returned
        assert!(matches!(
            accel.return_buffer(rented, false),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn buffers_disposed_before_shutdown_are_skipped_by_the_cascade() {
        let accel = cpu_accelerator();
        let buffer = accel
            .allocate::<u8>(Shape::D1(32), LayoutHint::GpuOptimized)
            .unwrap();
        buffer.dispose().unwrap();
        // no double free: the registry walk skips it
        accel.shutdown().unwrap();
        assert!(buffer.is_disposed());
    }

    #[test]
    fn oom_recovery_trims_the_pool_and_retries() {
        let catalog = DeviceCatalog::probe(PreferredBackend::Cpu);
        let device = catalog
            .discover(&DeviceFilter::backend(BackendKind::Cpu))
            .remove(0);
        // small simulator: pool residency is the only thing standing
        // between the second allocation and OOM
        let device = {
            use crate::device::DeviceCapabilities;
            let caps = device.capabilities().clone();
            let driver = Arc::new(crate::driver::CpuDriver::with_memory_limit(false, 8 * 1024));
            Device::new(device.id(), device.name(), caps, "sim-1.0", driver)
        };
        let mut config = RuntimeConfig::default();
        config.pool.max_pool_bytes = 8 * 1024;
        config.pool.max_buffer_bytes = 8 * 1024;
        let accel = Accelerator::new(device, config).unwrap();

        // fill device memory through the pool, then return so it sits pooled
        let rented = accel.rent::<u8>(6 * 1024).unwrap();
        accel.return_buffer(rented, false).unwrap();
        assert_eq!(accel.pool_stats().total, 1);

        // direct allocation cannot fit until recovery trims the pool
        let buffer = accel
            .allocate::<u8>(Shape::D1(6 * 1024), LayoutHint::GpuOptimized)
            .unwrap();
        assert_eq!(buffer.len(), 6 * 1024);
        assert_eq!(accel.pool_stats().total, 0);

        // with memory genuinely exhausted the error surfaces with advice
        let err = accel
            .allocate::<u8>(Shape::D1(6 * 1024), LayoutHint::GpuOptimized)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        assert!(err.suggestions()[0].contains("trim"));
    }
}
