//! Coherent dual-residency buffers
//!
//! A unified buffer keeps a host copy and a device allocation logically
//! coherent through explicit migration. Validity bits live under a
//! per-buffer lock: at any instant at least one side is valid, and a
//! mutation on one side invalidates the other until the next migration.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use super::buffer::{ArrayView, BufferRegistry, BufferState, RawBuffer};
use super::Element;
use crate::driver::DriverBackend;
use crate::error::{Error, Result};
use crate::kernel::launcher::KernelArg;

/// Which residency of a unified buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherenceSide {
    Host,
    Device,
}

struct Coherence<T> {
    host: Vec<T>,
    host_valid: bool,
    device_valid: bool,
}

struct UnifiedInner<T: Element> {
    device: Arc<RawBuffer>,
    state: Mutex<Coherence<T>>,
    len: usize,
}

/// Buffer addressable from host and device with runtime-managed coherence
pub struct UnifiedBuffer<T: Element> {
    inner: Arc<UnifiedInner<T>>,
    _marker: PhantomData<T>,
}

impl<T: Element> UnifiedBuffer<T> {
    pub(crate) fn allocate(
        driver: Arc<dyn DriverBackend>,
        len: usize,
        owner: u64,
        registry: &BufferRegistry,
    ) -> Result<Self> {
        let bytes = len * std::mem::size_of::<T>();
        let ptr = driver.alloc(bytes)?;
        let device = Arc::new(RawBuffer {
            driver,
            ptr,
            bytes,
            state: Mutex::new(BufferState::default()),
            owner,
        });
        registry.register(&device);
        Ok(Self {
            inner: Arc::new(UnifiedInner {
                device,
                state: Mutex::new(Coherence {
                    host: vec![T::zeroed(); len],
                    // allocation is zero on both sides, so both start valid
                    host_valid: true,
                    device_valid: true,
                }),
                len,
            }),
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn is_disposed(&self) -> bool {
        let state = self.inner.device.state.lock();
        state.disposed || state.reclaimed
    }

    /// Release the device allocation; all later access fails
    pub fn dispose(&self) -> Result<()> {
        self.inner.device.dispose()
    }

    /// (host_valid, device_valid) snapshot
    pub fn validity(&self) -> (bool, bool) {
        let state = self.inner.state.lock();
        (state.host_valid, state.device_valid)
    }

    /// Migrate so the host side is valid
    pub fn ensure_host(&self) -> Result<()> {
        let ptr = self.inner.device.ensure_live()?;
        let mut state = self.inner.state.lock();
        if state.host_valid {
            return Ok(());
        }
        debug_assert!(state.device_valid, "both coherence sides invalid");
        trace!("unified migrate device -> host ({} elems)", self.inner.len);
        self.inner
            .device
            .driver
            .copy_out(ptr, 0, bytemuck::cast_slice_mut(&mut state.host))?;
        state.host_valid = true;
        Ok(())
    }

    /// Migrate so the device side is valid
    pub fn ensure_device(&self) -> Result<()> {
        let ptr = self.inner.device.ensure_live()?;
        let mut state = self.inner.state.lock();
        if state.device_valid {
            return Ok(());
        }
        debug_assert!(state.host_valid, "both coherence sides invalid");
        trace!("unified migrate host -> device ({} elems)", self.inner.len);
        self.inner
            .device
            .driver
            .copy_in(ptr, 0, bytemuck::cast_slice(&state.host))?;
        state.device_valid = true;
        Ok(())
    }

    pub fn ensure(&self, side: CoherenceSide) -> Result<()> {
        match side {
            CoherenceSide::Host => self.ensure_host(),
            CoherenceSide::Device => self.ensure_device(),
        }
    }

    /// Async migration; the copy runs on the blocking pool
    pub async fn migrate_async(&self, side: CoherenceSide) -> Result<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let shim = UnifiedBuffer {
                inner,
                _marker: PhantomData,
            };
            shim.ensure(side)
        })
        .await
        .map_err(|e| {
            Error::InternalInvariantViolated(format!("migration task failed: {}", e))
        })?
    }

    /// Zero-copy host read; requires a valid host side
    pub fn host(&self) -> Result<HostRef<'_, T>> {
        let state = self.inner.state.lock();
        if !state.host_valid {
            return Err(Error::InvalidArgument(
                "host side is stale; call ensure_host first".into(),
            ));
        }
        Ok(HostRef { guard: state })
    }

    /// Host mutation; requires a valid host side and invalidates the device
    /// side until the next migration.
    pub fn host_mut(&self) -> Result<HostRefMut<'_, T>> {
        let mut state = self.inner.state.lock();
        if !state.host_valid {
            return Err(Error::InvalidArgument(
                "host side is stale; call ensure_host first".into(),
            ));
        }
        state.device_valid = false;
        Ok(HostRefMut { guard: state })
    }

    /// Kernel argument reading the device residency; requires a valid
    /// device side.
    pub fn device_view(&self) -> Result<ArrayView<T>> {
        let state = self.inner.state.lock();
        if !state.device_valid {
            return Err(Error::InvalidArgument(
                "device side is stale; call ensure_device first".into(),
            ));
        }
        drop(state);
        Ok(self.raw_view())
    }

    /// Kernel argument mutating the device residency; requires a valid
    /// device side and invalidates the host side.
    pub fn device_view_mut(&self) -> Result<ArrayView<T>> {
        let mut state = self.inner.state.lock();
        if !state.device_valid {
            return Err(Error::InvalidArgument(
                "device side is stale; call ensure_device first".into(),
            ));
        }
        state.host_valid = false;
        drop(state);
        Ok(self.raw_view())
    }

    fn raw_view(&self) -> ArrayView<T> {
        ArrayView::over_raw(&self.inner.device, self.inner.len)
    }
}

impl<T: Element> ArrayView<T> {
    pub(crate) fn over_raw(raw: &Arc<RawBuffer>, len: usize) -> ArrayView<T> {
        ArrayView::from_parts(Arc::downgrade(raw), 0, len, 1)
    }
}

/// Read guard over the host residency
pub struct HostRef<'a, T: Element> {
    guard: MutexGuard<'a, Coherence<T>>,
}

impl<T: Element> Deref for HostRef<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.guard.host
    }
}

/// Write guard over the host residency
pub struct HostRefMut<'a, T: Element> {
    guard: MutexGuard<'a, Coherence<T>>,
}

impl<T: Element> Deref for HostRefMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.guard.host
    }
}

impl<T: Element> DerefMut for HostRefMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.guard.host
    }
}

impl<T: Element> UnifiedBuffer<T> {
    /// Convenience: `device_view()?.arg()`
    pub fn device_arg(&self) -> Result<KernelArg> {
        Ok(self.device_view()?.arg())
    }

    /// Convenience: `device_view_mut()?.arg()`
    pub fn device_arg_mut(&self) -> Result<KernelArg> {
        Ok(self.device_view_mut()?.arg())
    }
}
