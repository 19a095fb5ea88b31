//! Kernel identity, artifacts, and parameter layout
//!
//! A [`KernelSignature`] names a kernel request; its [`Fingerprint`] keys the
//! cache. A [`KernelArtifact`] is the opaque compiled payload an external
//! backend produced; the core never parses it, only forwards it to a driver
//! together with a marshalled [`ParamBlock`].

pub mod cache;
pub mod launcher;
pub mod persist;

use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::OptimizationLevel;
use crate::device::BackendKind;
use crate::driver::{DevicePtr, HostLaunchContext};
use crate::error::{Error, Result};

pub use cache::{CacheStats, CachedKernel, KernelCache};
pub use launcher::{KernelArg, LaunchResult, LaunchStatus, Launcher, ScalarValue};

/// Kind of one kernel parameter slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
    Scalar,
    View,
    Struct,
}

impl ParamKind {
    fn tag(self) -> u8 {
        match self {
            ParamKind::Scalar => 0,
            ParamKind::View => 1,
            ParamKind::Struct => 2,
        }
    }
}

/// Declared shape of one parameter slot: kind, element size, alignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub kind: ParamKind,
    pub elem_size: usize,
    pub align: usize,
}

impl ParamDescriptor {
    pub fn scalar<T: bytemuck::Pod>() -> Self {
        Self {
            kind: ParamKind::Scalar,
            elem_size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }

    pub fn view<T: bytemuck::Pod>() -> Self {
        Self {
            kind: ParamKind::View,
            elem_size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }

    pub fn structure<T: bytemuck::Pod>() -> Self {
        Self {
            kind: ParamKind::Struct,
            elem_size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }
}

/// Identity of a kernel request
///
/// Value type; two signatures with equal fields produce equal fingerprints
/// across processes and platforms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSignature {
    pub name: String,
    pub params: Vec<ParamDescriptor>,
    pub device_kind: BackendKind,
    pub optimization: OptimizationLevel,
}

impl KernelSignature {
    pub fn new(name: impl Into<String>, device_kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            device_kind,
            optimization: OptimizationLevel::Default,
        }
    }

    pub fn with_param(mut self, param: ParamDescriptor) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_optimization(mut self, optimization: OptimizationLevel) -> Self {
        self.optimization = optimization;
        self
    }

    /// Stable fingerprint over the signature plus a caller version string
    pub fn fingerprint(&self, version: &str) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update((self.name.len() as u64).to_le_bytes());
        hasher.update(self.name.as_bytes());
        hasher.update((self.params.len() as u64).to_le_bytes());
        for param in &self.params {
            hasher.update([param.kind.tag()]);
            hasher.update((param.elem_size as u64).to_le_bytes());
            hasher.update((param.align as u64).to_le_bytes());
        }
        hasher.update([backend_tag(self.device_kind), optimization_tag(self.optimization)]);
        hasher.update((version.len() as u64).to_le_bytes());
        hasher.update(version.as_bytes());
        Fingerprint(hasher.finalize().into())
    }
}

fn backend_tag(kind: BackendKind) -> u8 {
    match kind {
        BackendKind::Cuda => 0,
        BackendKind::OpenCl => 1,
        BackendKind::Cpu => 2,
        BackendKind::CpuSimd => 3,
    }
}

fn optimization_tag(level: OptimizationLevel) -> u8 {
    match level {
        OptimizationLevel::Default => 0,
        OptimizationLevel::Speed => 1,
        OptimizationLevel::Size => 2,
        OptimizationLevel::Debug => 3,
    }
}

/// Cache key: sha256 of (signature ∥ version)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Host-function kernel body executed by the CPU simulator
pub type HostKernelFn = Arc<dyn Fn(&HostLaunchContext<'_>) -> Result<()> + Send + Sync>;

/// Opaque compiled kernel payload
#[derive(Clone)]
pub enum ArtifactPayload {
    /// PTX text for the CUDA backend
    Ptx(Vec<u8>),
    /// SPIR-V for the OpenCL backend
    SpirV(Vec<u8>),
    /// In-process function for the CPU simulator
    HostFn(HostKernelFn),
}

impl ArtifactPayload {
    /// Serialized size; host functions occupy no artifact bytes
    pub fn byte_len(&self) -> usize {
        match self {
            ArtifactPayload::Ptx(b) | ArtifactPayload::SpirV(b) => b.len(),
            ArtifactPayload::HostFn(_) => 0,
        }
    }
}

impl fmt::Debug for ArtifactPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactPayload::Ptx(b) => write!(f, "Ptx({} bytes)", b.len()),
            ArtifactPayload::SpirV(b) => write!(f, "SpirV({} bytes)", b.len()),
            ArtifactPayload::HostFn(_) => write!(f, "HostFn"),
        }
    }
}

static ARTIFACT_UID: AtomicU64 = AtomicU64::new(1);

/// Compiled kernel handle
///
/// Produced by an external backend, owned by the cache, shared by launchers.
#[derive(Debug, Clone)]
pub struct KernelArtifact {
    uid: u64,
    payload: ArtifactPayload,
    entry_point: String,
    layout: ParamLayout,
}

impl KernelArtifact {
    pub fn ptx(entry_point: impl Into<String>, image: Vec<u8>, layout: ParamLayout) -> Self {
        Self::build(ArtifactPayload::Ptx(image), entry_point, layout)
    }

    pub fn spirv(entry_point: impl Into<String>, image: Vec<u8>, layout: ParamLayout) -> Self {
        Self::build(ArtifactPayload::SpirV(image), entry_point, layout)
    }

    pub fn host_fn<F>(entry_point: impl Into<String>, layout: ParamLayout, f: F) -> Self
    where
        F: Fn(&HostLaunchContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::build(ArtifactPayload::HostFn(Arc::new(f)), entry_point, layout)
    }

    fn build(payload: ArtifactPayload, entry_point: impl Into<String>, layout: ParamLayout) -> Self {
        Self {
            uid: ARTIFACT_UID.fetch_add(1, Ordering::Relaxed),
            payload,
            entry_point: entry_point.into(),
            layout,
        }
    }

    /// Process-unique id, used by drivers to cache loaded modules
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn payload(&self) -> &ArtifactPayload {
        &self.payload
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }
}

/// Packed offset/size assignment for one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSlot {
    pub kind: ParamKind,
    pub size: usize,
    pub align: usize,
    pub offset: usize,
}

/// Parameter layout descriptor for a kernel signature
///
/// View slots pack as (device address, length) regardless of element size;
/// scalar and struct slots pack their declared bytes at their declared
/// alignment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParamLayout {
    slots: Vec<ParamSlot>,
    total_size: usize,
}

const VIEW_SLOT_SIZE: usize = 16;
const VIEW_SLOT_ALIGN: usize = 8;

impl ParamLayout {
    pub fn from_descriptors(descriptors: &[ParamDescriptor]) -> Self {
        let mut slots = Vec::with_capacity(descriptors.len());
        let mut offset = 0usize;
        for d in descriptors {
            let (size, align) = match d.kind {
                ParamKind::View => (VIEW_SLOT_SIZE, VIEW_SLOT_ALIGN),
                ParamKind::Scalar | ParamKind::Struct => (d.elem_size, d.align.max(1)),
            };
            offset = (offset + align - 1) / align * align;
            slots.push(ParamSlot {
                kind: d.kind,
                size,
                align,
                offset,
            });
            offset += size;
        }
        Self {
            slots,
            total_size: offset,
        }
    }

    pub fn for_signature(signature: &KernelSignature) -> Self {
        Self::from_descriptors(&signature.params)
    }

    pub fn slots(&self) -> &[ParamSlot] {
        &self.slots
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

/// Resolved view argument recorded alongside the packed bytes
#[derive(Debug, Clone, Copy)]
pub(crate) struct ViewParam {
    pub slot: usize,
    pub ptr: DevicePtr,
    pub byte_offset: usize,
    pub len: usize,
    pub elem_size: usize,
}

/// Marshalled parameter buffer ready for submission
///
/// `bytes` honors the target ABI's alignment; `views` carries the resolved
/// view descriptors for backends that address buffers by handle.
#[derive(Debug)]
pub struct ParamBlock {
    pub(crate) bytes: Vec<u8>,
    pub(crate) slots: Vec<ParamSlot>,
    pub(crate) views: Vec<ViewParam>,
}

impl ParamBlock {
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn packed_slots(&self) -> impl Iterator<Item = ParamSlot> + '_ {
        self.slots.iter().copied()
    }

    pub(crate) fn slot_bytes(&self, slot: usize, expected: ParamKind) -> Result<&[u8]> {
        let s = self.slots.get(slot).ok_or_else(|| {
            Error::InvalidKernelParameters(format!("no parameter slot {}", slot))
        })?;
        if s.kind != expected {
            return Err(Error::InvalidKernelParameters(format!(
                "slot {} is {:?}, kernel reads {:?}",
                slot, s.kind, expected
            )));
        }
        Ok(&self.bytes[s.offset..s.offset + s.size])
    }

    pub(crate) fn view_param(&self, slot: usize) -> Result<ViewParam> {
        self.views
            .iter()
            .find(|v| v.slot == slot)
            .copied()
            .ok_or_else(|| {
                Error::InvalidKernelParameters(format!("slot {} carries no view", slot))
            })
    }

    /// Per-slot pointers into the packed buffer, in slot order, for ABIs
    /// that take an argument pointer array (CUDA).
    pub(crate) fn abi_pointers(&self) -> Vec<*mut c_void> {
        self.slots
            .iter()
            .map(|s| self.bytes[s.offset..].as_ptr() as *mut c_void)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature() -> KernelSignature {
        KernelSignature::new("vector_add", BackendKind::Cpu)
            .with_param(ParamDescriptor::view::<f32>())
            .with_param(ParamDescriptor::view::<f32>())
            .with_param(ParamDescriptor::scalar::<u32>())
    }

    #[test]
    fn fingerprint_is_stable_and_version_sensitive() {
        let sig = signature();
        assert_eq!(sig.fingerprint("1.0.0"), sig.fingerprint("1.0.0"));
        assert_ne!(sig.fingerprint("1.0.0"), sig.fingerprint("1.0.1"));
    }

    #[test]
    fn fingerprint_discriminates_device_kind_and_params() {
        let cpu = signature();
        let mut cuda = signature();
        cuda.device_kind = BackendKind::Cuda;
        assert_ne!(cpu.fingerprint("1"), cuda.fingerprint("1"));

        let wider = signature().with_param(ParamDescriptor::scalar::<f64>());
        assert_ne!(cpu.fingerprint("1"), wider.fingerprint("1"));
    }

    #[test]
    fn layout_packs_with_alignment() {
        // u8 scalar, then a view (8-aligned), then u32 scalar
        let layout = ParamLayout::from_descriptors(&[
            ParamDescriptor {
                kind: ParamKind::Scalar,
                elem_size: 1,
                align: 1,
            },
            ParamDescriptor::view::<f32>(),
            ParamDescriptor::scalar::<u32>(),
        ]);
        let slots = layout.slots();
        assert_eq!(slots[0].offset, 0);
        assert_eq!(slots[1].offset, 8); // aligned up from 1
        assert_eq!(slots[1].size, 16);
        assert_eq!(slots[2].offset, 24);
        assert_eq!(layout.total_size(), 28);
    }

    #[test]
    fn artifact_uids_are_unique() {
        let layout = ParamLayout::default();
        let a = KernelArtifact::ptx("k", vec![0u8], layout.clone());
        let b = KernelArtifact::ptx("k", vec![0u8], layout);
        assert_ne!(a.uid(), b.uid());
    }
}
