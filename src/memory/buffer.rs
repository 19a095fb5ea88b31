//! Typed device buffers and non-owning views

use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use super::{Element, MemoryLocation, Shape};
use crate::driver::{DevicePtr, DriverBackend};
use crate::error::{Error, Result};
use crate::kernel::launcher::{KernelArg, ViewArg};
use crate::stream::Stream;

/// Shared allocation record behind a buffer handle
///
/// Views hold weak references to this; the strong reference lives in the
/// buffer handle so a view can never keep freed memory reachable.
pub(crate) struct RawBuffer {
    pub(crate) driver: Arc<dyn DriverBackend>,
    pub(crate) ptr: DevicePtr,
    /// Allocation size; may exceed the logical extent for pooled buffers
    pub(crate) bytes: usize,
    pub(crate) state: Mutex<BufferState>,
    /// Owning accelerator tag, used for alien-buffer detection
    pub(crate) owner: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BufferState {
    pub disposed: bool,
    /// Set when the pool reclaims the allocation; suppresses the free on drop
    pub reclaimed: bool,
}

impl RawBuffer {
    pub(crate) fn ensure_live(&self) -> Result<DevicePtr> {
        let state = self.state.lock();
        if state.disposed || state.reclaimed {
            return Err(Error::InvalidArgument(
                "operation on disposed buffer".into(),
            ));
        }
        Ok(self.ptr)
    }

    pub(crate) fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed || state.reclaimed {
            return Err(Error::InvalidArgument("buffer already disposed".into()));
        }
        state.disposed = true;
        drop(state);
        self.driver.free(self.ptr)
    }

    /// Hand the allocation to the pool; the handle keeps its Arc but all
    /// further operations fail as disposed.
    pub(crate) fn surrender(&self) -> Result<(DevicePtr, usize)> {
        let mut state = self.state.lock();
        if state.disposed || state.reclaimed {
            return Err(Error::InvalidArgument(
                "cannot return a disposed buffer".into(),
            ));
        }
        state.reclaimed = true;
        Ok((self.ptr, self.bytes))
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.disposed && !state.reclaimed {
            if let Err(e) = self.driver.free(self.ptr) {
                warn!("buffer free at drop failed: {}", e);
            }
        }
    }
}

/// Accelerator-scoped registry of live allocations
///
/// Every buffer allocated through an accelerator (directly, unified, or
/// rented from its pool) registers here so teardown can cascade: disposal
/// walks the registry and releases whatever callers still hold. Weak
/// entries keep the registry from extending any buffer's lifetime.
#[derive(Default)]
pub(crate) struct BufferRegistry {
    entries: Mutex<Vec<Weak<RawBuffer>>>,
}

impl BufferRegistry {
    pub(crate) fn register(&self, raw: &Arc<RawBuffer>) {
        let mut entries = self.entries.lock();
        entries.retain(|w| w.strong_count() > 0);
        entries.push(Arc::downgrade(raw));
    }

    /// Dispose every registered buffer still alive; returns how many were
    /// released. Already-disposed and pool-reclaimed entries are skipped.
    pub(crate) fn dispose_all(&self) -> usize {
        let drained: Vec<Weak<RawBuffer>> = self.entries.lock().drain(..).collect();
        let mut released = 0;
        for raw in drained.into_iter().filter_map(|w| w.upgrade()) {
            if raw.dispose().is_ok() {
                released += 1;
            }
        }
        released
    }
}

/// Typed dense device allocation
///
/// Owned handle; exactly one exists per live allocation. Sharing happens
/// through [`ArrayView`]s, which cannot outlive the allocation they borrow.
pub struct MemoryBuffer<T: Element> {
    raw: Arc<RawBuffer>,
    shape: Shape,
    strides: [usize; 3],
    location: MemoryLocation,
    _marker: PhantomData<T>,
}

impl<T: Element> std::fmt::Debug for MemoryBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("location", &self.location)
            .finish()
    }
}

impl<T: Element> MemoryBuffer<T> {
    pub(crate) fn from_alloc(
        driver: Arc<dyn DriverBackend>,
        ptr: DevicePtr,
        alloc_bytes: usize,
        shape: Shape,
        location: MemoryLocation,
        owner: u64,
        registry: &BufferRegistry,
    ) -> Self {
        let strides = shape.strides();
        let raw = Arc::new(RawBuffer {
            driver,
            ptr,
            bytes: alloc_bytes,
            state: Mutex::new(BufferState::default()),
            owner,
        });
        registry.register(&raw);
        Self {
            raw,
            shape,
            strides,
            location,
            _marker: PhantomData,
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn rank(&self) -> u8 {
        self.shape.rank()
    }

    /// Total element count
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element strides, row-major
    pub fn strides(&self) -> [usize; 3] {
        self.strides
    }

    pub fn elem_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    /// Logical extent in bytes
    pub fn size_bytes(&self) -> usize {
        self.len() * self.elem_size()
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn is_disposed(&self) -> bool {
        let state = self.raw.state.lock();
        state.disposed || state.reclaimed
    }

    /// Native allocation handle, valid only while the buffer is live and
    /// resident on the device side.
    pub fn native_handle(&self) -> Result<u64> {
        let ptr = self.raw.ensure_live()?;
        match self.location {
            MemoryLocation::Device | MemoryLocation::Unified | MemoryLocation::Pinned => {
                Ok(ptr.raw())
            }
            MemoryLocation::Host => Err(Error::InvalidArgument(
                "host-optimized buffer exposes no device handle".into(),
            )),
        }
    }

    /// Release the allocation now. Every later operation on this buffer or
    /// its views fails with InvalidArgument.
    pub fn dispose(&self) -> Result<()> {
        self.raw.dispose()
    }

    /// Borrowed view over the whole buffer
    pub fn view(&self) -> ArrayView<T> {
        ArrayView {
            raw: Arc::downgrade(&self.raw),
            offset: 0,
            len: self.len(),
            stride: 1,
            _marker: PhantomData,
        }
    }

    /// Bounds-checked sub-range view; `(offset == len, extent == 0)` is the
    /// valid empty edge.
    pub fn subview(&self, offset: usize, extent: usize) -> Result<ArrayView<T>> {
        self.view().subview(offset, extent)
    }

    /// Upload from host memory. With a stream the copy is ordered after
    /// prior stream work and asynchronous to the caller; without one it
    /// completes before returning.
    pub fn copy_from_host(&self, src: &[T], stream: Option<&Stream>) -> Result<()> {
        if src.len() != self.len() {
            return Err(Error::InvalidArgument(format!(
                "host source holds {} elements, buffer holds {}",
                src.len(),
                self.len()
            )));
        }
        match stream {
            None => {
                let ptr = self.raw.ensure_live()?;
                self.raw.driver.copy_in(ptr, 0, bytemuck::cast_slice(src))
            }
            Some(stream) => {
                self.raw.ensure_live()?;
                let raw = self.raw.clone();
                let staged: Vec<u8> = bytemuck::cast_slice(src).to_vec();
                stream.enqueue_op("copy_from_host", move || {
                    let ptr = raw.ensure_live()?;
                    raw.driver.copy_in(ptr, 0, &staged)
                })
            }
        }
    }

    /// Download into host memory, synchronously
    pub fn copy_to_host(&self, dst: &mut [T]) -> Result<()> {
        if dst.len() != self.len() {
            return Err(Error::InvalidArgument(format!(
                "host destination holds {} elements, buffer holds {}",
                dst.len(),
                self.len()
            )));
        }
        let ptr = self.raw.ensure_live()?;
        self.raw
            .driver
            .copy_out(ptr, 0, bytemuck::cast_slice_mut(dst))
    }

    /// Download ordered after prior work on `stream`. The borrowed
    /// destination forces completion before this returns.
    pub fn copy_to_host_on(&self, dst: &mut [T], stream: &Stream) -> Result<()> {
        if dst.len() != self.len() {
            return Err(Error::InvalidArgument(format!(
                "host destination holds {} elements, buffer holds {}",
                dst.len(),
                self.len()
            )));
        }
        self.raw.ensure_live()?;
        let raw = self.raw.clone();
        let bytes = self.size_bytes();
        let staged: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(vec![0u8; bytes]));
        let staged_op = staged.clone();
        stream.run_and_wait("copy_to_host", move || {
            let ptr = raw.ensure_live()?;
            raw.driver.copy_out(ptr, 0, &mut staged_op.lock())
        })?;
        bytemuck::cast_slice_mut::<T, u8>(dst).copy_from_slice(&staged.lock());
        Ok(())
    }

    /// Download asynchronously; resolves to the buffer contents once every
    /// prior command on `stream` and the copy itself have finished.
    pub async fn copy_to_host_async(&self, stream: &Stream) -> Result<Vec<T>> {
        self.raw.ensure_live()?;
        let raw = self.raw.clone();
        let bytes = self.size_bytes();
        let staged: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(vec![0u8; bytes]));
        let staged_op = staged.clone();
        stream.enqueue_op("copy_to_host_async", move || {
            let ptr = raw.ensure_live()?;
            raw.driver.copy_out(ptr, 0, &mut staged_op.lock())
        })?;
        stream.synchronize_async().await?;
        let bytes = std::mem::take(&mut *staged.lock());
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    /// Zero the logical extent
    pub fn fill_zero(&self, stream: Option<&Stream>) -> Result<()> {
        let bytes = self.size_bytes();
        match stream {
            None => {
                let ptr = self.raw.ensure_live()?;
                self.raw.driver.fill_zero(ptr, 0, bytes)
            }
            Some(stream) => {
                self.raw.ensure_live()?;
                let raw = self.raw.clone();
                stream.enqueue_op("fill_zero", move || {
                    let ptr = raw.ensure_live()?;
                    raw.driver.fill_zero(ptr, 0, bytes)
                })
            }
        }
    }

    /// Copy into another buffer of the same element type; lengths must match
    pub fn copy_to(&self, other: &MemoryBuffer<T>, stream: Option<&Stream>) -> Result<()> {
        if other.len() != self.len() {
            return Err(Error::InvalidArgument(format!(
                "destination holds {} elements, source holds {}",
                other.len(),
                self.len()
            )));
        }
        let bytes = self.size_bytes();
        let src = self.raw.clone();
        let dst = other.raw.clone();
        let op = move || -> Result<()> {
            let src_ptr = src.ensure_live()?;
            let dst_ptr = dst.ensure_live()?;
            if same_driver(&src.driver, &dst.driver) {
                src.driver.copy_device(src_ptr, 0, dst_ptr, 0, bytes)
            } else {
                // cross-device: stage through the host
                let mut staging = vec![0u8; bytes];
                src.driver.copy_out(src_ptr, 0, &mut staging)?;
                dst.driver.copy_in(dst_ptr, 0, &staging)
            }
        };
        match stream {
            None => op(),
            Some(stream) => {
                self.raw.ensure_live()?;
                other.raw.ensure_live()?;
                stream.enqueue_op("copy_to", op)
            }
        }
    }

    /// Host mapping for pinned and unified buffers
    pub fn as_host_slice(&self) -> Result<&[T]> {
        let ptr = self.raw.ensure_live()?;
        if !matches!(
            self.location,
            MemoryLocation::Pinned | MemoryLocation::Unified
        ) {
            return Err(Error::InvalidArgument(
                "buffer is not host-visible; copy it to host instead".into(),
            ));
        }
        let host = self.raw.driver.host_ptr(ptr).ok_or_else(|| {
            Error::Unsupported("backend exposes no host mapping for this buffer".into())
        })?;
        // SAFETY: the mapping covers the allocation and lives while `self`
        // holds the strong reference; the range is the logical extent.
        Ok(unsafe { std::slice::from_raw_parts(host as *const T, self.len()) })
    }

    /// Mutable host mapping for pinned and unified buffers
    pub fn as_host_slice_mut(&mut self) -> Result<&mut [T]> {
        let ptr = self.raw.ensure_live()?;
        if !matches!(
            self.location,
            MemoryLocation::Pinned | MemoryLocation::Unified
        ) {
            return Err(Error::InvalidArgument(
                "buffer is not host-visible; copy it to host instead".into(),
            ));
        }
        let host = self.raw.driver.host_ptr(ptr).ok_or_else(|| {
            Error::Unsupported("backend exposes no host mapping for this buffer".into())
        })?;
        // SAFETY: as in `as_host_slice`, plus exclusivity from `&mut self`.
        Ok(unsafe { std::slice::from_raw_parts_mut(host as *mut T, self.len()) })
    }

    pub(crate) fn raw(&self) -> &Arc<RawBuffer> {
        &self.raw
    }

    pub(crate) fn owner_tag(&self) -> u64 {
        self.raw.owner
    }
}

/// Data-pointer identity for `Arc<dyn DriverBackend>`, ignoring vtables
pub(crate) fn same_driver(a: &Arc<dyn DriverBackend>, b: &Arc<dyn DriverBackend>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const u8, Arc::as_ptr(b) as *const u8)
}

/// Non-owning slice of a buffer
///
/// Value type. Holds a weak reference: once the source buffer is dropped or
/// disposed, every operation through the view fails instead of touching
/// freed memory.
pub struct ArrayView<T: Element> {
    raw: Weak<RawBuffer>,
    /// Element offset from the allocation start
    offset: usize,
    len: usize,
    /// Element stride between consecutive view elements
    stride: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> Clone for ArrayView<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            offset: self.offset,
            len: self.len,
            stride: self.stride,
            _marker: PhantomData,
        }
    }
}

impl<T: Element> ArrayView<T> {
    pub(crate) fn from_parts(
        raw: Weak<RawBuffer>,
        offset: usize,
        len: usize,
        stride: usize,
    ) -> Self {
        Self {
            raw,
            offset,
            len,
            stride,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Narrow the view; `(offset == len, extent == 0)` stays valid
    pub fn subview(&self, offset: usize, extent: usize) -> Result<ArrayView<T>> {
        let end = offset.checked_add(extent).ok_or_else(|| {
            Error::InvalidArgument("subview extent overflows".into())
        })?;
        if end > self.len {
            return Err(Error::InvalidArgument(format!(
                "subview {}..{} exceeds view of {} elements",
                offset, end, self.len
            )));
        }
        Ok(ArrayView {
            raw: self.raw.clone(),
            offset: self.offset + offset * self.stride,
            len: extent,
            stride: self.stride,
            _marker: PhantomData,
        })
    }

    fn dense_range(&self) -> Result<(Arc<RawBuffer>, usize, usize)> {
        if self.stride != 1 {
            return Err(Error::InvalidArgument(
                "strided views do not support host transfers".into(),
            ));
        }
        let raw = self.raw.upgrade().ok_or_else(|| {
            Error::InvalidArgument("view outlived its source buffer".into())
        })?;
        Ok((raw, self.offset, self.len))
    }

    /// Synchronously read the viewed range into a fresh Vec
    pub fn read_to_vec(&self) -> Result<Vec<T>> {
        let (raw, offset, len) = self.dense_range()?;
        let ptr = raw.ensure_live()?;
        let mut out = vec![T::zeroed(); len];
        raw.driver.copy_out(
            ptr,
            offset * std::mem::size_of::<T>(),
            bytemuck::cast_slice_mut(&mut out),
        )?;
        Ok(out)
    }

    /// Synchronously overwrite the viewed range from host memory
    pub fn write_from_slice(&self, src: &[T]) -> Result<()> {
        if src.len() != self.len {
            return Err(Error::InvalidArgument(format!(
                "source holds {} elements, view holds {}",
                src.len(),
                self.len
            )));
        }
        let (raw, offset, _) = self.dense_range()?;
        let ptr = raw.ensure_live()?;
        raw.driver.copy_in(
            ptr,
            offset * std::mem::size_of::<T>(),
            bytemuck::cast_slice(src),
        )
    }

    /// Kernel argument referencing this view
    pub fn arg(&self) -> KernelArg {
        KernelArg::View(ViewArg {
            raw: self.raw.clone(),
            offset: self.offset,
            len: self.len,
            elem_size: std::mem::size_of::<T>(),
        })
    }
}
