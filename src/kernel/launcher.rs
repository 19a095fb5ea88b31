//! Typed kernel dispatch
//!
//! A launcher pairs a compiled artifact with its parameter layout and turns
//! typed arguments into an ABI-packed parameter block. Mismatched arguments
//! are rejected before anything reaches the driver.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::trace;

use super::{KernelArtifact, ParamBlock, ParamKind, ParamSlot, ViewParam};
use crate::driver::{DriverBackend, LaunchDims};
use crate::error::{Error, Result};
use crate::memory::buffer::RawBuffer;
use crate::stream::{CancelFlag, Stream};

/// Scalar argument value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl ScalarValue {
    pub fn size(&self) -> usize {
        match self {
            ScalarValue::I32(_) | ScalarValue::U32(_) | ScalarValue::F32(_) => 4,
            ScalarValue::I64(_) | ScalarValue::U64(_) | ScalarValue::F64(_) => 8,
        }
    }

    fn write_to(&self, out: &mut [u8]) {
        match self {
            ScalarValue::I32(v) => out.copy_from_slice(&v.to_le_bytes()),
            ScalarValue::U32(v) => out.copy_from_slice(&v.to_le_bytes()),
            ScalarValue::I64(v) => out.copy_from_slice(&v.to_le_bytes()),
            ScalarValue::U64(v) => out.copy_from_slice(&v.to_le_bytes()),
            ScalarValue::F32(v) => out.copy_from_slice(&v.to_le_bytes()),
            ScalarValue::F64(v) => out.copy_from_slice(&v.to_le_bytes()),
        }
    }
}

/// Resolved buffer view passed as a kernel argument
pub struct ViewArg {
    pub(crate) raw: Weak<RawBuffer>,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) elem_size: usize,
}

/// One kernel argument
pub enum KernelArg {
    Scalar(ScalarValue),
    View(ViewArg),
    /// Opaque POD bytes for a struct slot
    Struct(Vec<u8>),
}

impl KernelArg {
    pub fn i32(v: i32) -> Self {
        KernelArg::Scalar(ScalarValue::I32(v))
    }

    pub fn u32(v: u32) -> Self {
        KernelArg::Scalar(ScalarValue::U32(v))
    }

    pub fn i64(v: i64) -> Self {
        KernelArg::Scalar(ScalarValue::I64(v))
    }

    pub fn u64(v: u64) -> Self {
        KernelArg::Scalar(ScalarValue::U64(v))
    }

    pub fn f32(v: f32) -> Self {
        KernelArg::Scalar(ScalarValue::F32(v))
    }

    pub fn f64(v: f64) -> Self {
        KernelArg::Scalar(ScalarValue::F64(v))
    }

    pub fn structure<T: bytemuck::Pod>(value: &T) -> Self {
        KernelArg::Struct(bytemuck::bytes_of(value).to_vec())
    }
}

/// Launch completion status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStatus {
    Completed,
    /// Cancellation was requested; any work already submitted ran to
    /// completion but is reported as cancelled.
    Cancelled,
}

/// Outcome of one asynchronous launch
#[derive(Debug, Clone)]
pub struct LaunchResult {
    pub elapsed: Duration,
    pub status: LaunchStatus,
}

/// Reusable dispatch stub for one compiled kernel
///
/// Cheap to clone; lives at most as long as its artifact stays cached.
#[derive(Clone)]
pub struct Launcher {
    artifact: Arc<KernelArtifact>,
    driver: Arc<dyn DriverBackend>,
}

impl Launcher {
    pub(crate) fn new(artifact: Arc<KernelArtifact>, driver: Arc<dyn DriverBackend>) -> Self {
        Self { artifact, driver }
    }

    pub fn artifact(&self) -> &Arc<KernelArtifact> {
        &self.artifact
    }

    pub fn entry_point(&self) -> &str {
        self.artifact.entry_point()
    }

    /// Pack and validate arguments against the parameter layout
    fn marshal(&self, args: &[KernelArg]) -> Result<ParamBlock> {
        let slots: &[ParamSlot] = self.artifact.layout().slots();
        if args.len() != slots.len() {
            return Err(Error::InvalidKernelParameters(format!(
                "kernel '{}' takes {} parameters, {} supplied",
                self.entry_point(),
                slots.len(),
                args.len()
            )));
        }

        let mut bytes = vec![0u8; self.artifact.layout().total_size()];
        let mut views = Vec::new();

        for (index, (arg, slot)) in args.iter().zip(slots).enumerate() {
            match (arg, slot.kind) {
                (KernelArg::Scalar(value), ParamKind::Scalar) => {
                    if value.size() != slot.size {
                        return Err(Error::InvalidKernelParameters(format!(
                            "slot {} of '{}' is a {}-byte scalar, argument is {} bytes",
                            index,
                            self.entry_point(),
                            slot.size,
                            value.size()
                        )));
                    }
                    value.write_to(&mut bytes[slot.offset..slot.offset + slot.size]);
                }
                (KernelArg::Struct(raw), ParamKind::Struct) => {
                    if raw.len() != slot.size {
                        return Err(Error::InvalidKernelParameters(format!(
                            "slot {} of '{}' is a {}-byte struct, argument is {} bytes",
                            index,
                            self.entry_point(),
                            slot.size,
                            raw.len()
                        )));
                    }
                    bytes[slot.offset..slot.offset + slot.size].copy_from_slice(raw);
                }
                (KernelArg::View(view), ParamKind::View) => {
                    let raw = view.raw.upgrade().ok_or_else(|| {
                        Error::InvalidKernelParameters(format!(
                            "slot {} of '{}' views a dropped buffer",
                            index,
                            self.entry_point()
                        ))
                    })?;
                    let ptr = raw.ensure_live()?;
                    let byte_offset = view.offset * view.elem_size;
                    // pointer + length, the ABI form hardware backends take
                    bytes[slot.offset..slot.offset + 8]
                        .copy_from_slice(&(ptr.raw() + byte_offset as u64).to_le_bytes());
                    bytes[slot.offset + 8..slot.offset + 16]
                        .copy_from_slice(&(view.len as u64).to_le_bytes());
                    views.push(ViewParam {
                        slot: index,
                        ptr,
                        byte_offset,
                        len: view.len,
                        elem_size: view.elem_size,
                    });
                }
                (_, expected) => {
                    return Err(Error::InvalidKernelParameters(format!(
                        "slot {} of '{}' expects a {:?} argument",
                        index,
                        self.entry_point(),
                        expected
                    )));
                }
            }
        }

        Ok(ParamBlock {
            bytes,
            slots: slots.to_vec(),
            views,
        })
    }

    /// Enqueue a launch on `stream`; nonblocking
    pub fn launch(
        &self,
        grid: LaunchDims,
        block: LaunchDims,
        args: Vec<KernelArg>,
        stream: &Stream,
    ) -> Result<()> {
        let params = self.marshal(&args)?;
        let artifact = self.artifact.clone();
        let driver = self.driver.clone();
        trace!("enqueue launch '{}'", artifact.entry_point());
        stream.enqueue_op("launch", move || driver.launch(&artifact, grid, block, &params))
    }

    /// Launch and synchronize the stream
    pub fn launch_sync(
        &self,
        grid: LaunchDims,
        block: LaunchDims,
        args: Vec<KernelArg>,
        stream: &Stream,
    ) -> Result<()> {
        self.launch(grid, block, args, stream)?;
        stream.synchronize()
    }

    /// Launch asynchronously, resolving to a timed [`LaunchResult`].
    ///
    /// A cancellation observed before enqueue drops the launch; one observed
    /// after lets the work finish but reports Cancelled.
    pub async fn launch_async(
        &self,
        grid: LaunchDims,
        block: LaunchDims,
        args: Vec<KernelArg>,
        stream: &Stream,
        cancel: Option<&CancelFlag>,
    ) -> Result<LaunchResult> {
        if let Some(flag) = cancel {
            if flag.is_cancelled() {
                return Ok(LaunchResult {
                    elapsed: Duration::ZERO,
                    status: LaunchStatus::Cancelled,
                });
            }
        }

        let params = self.marshal(&args)?;
        let artifact = self.artifact.clone();
        let driver = self.driver.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();

        stream.enqueue_op("launch_async", move || {
            let started = Instant::now();
            let outcome = driver.launch(&artifact, grid, block, &params);
            let _ = tx.send((outcome, started.elapsed()));
            Ok(())
        })?;

        let (outcome, elapsed) = rx.await.map_err(|_| {
            Error::InternalInvariantViolated("launch retired without reporting".into())
        })?;
        outcome?;

        let status = match cancel {
            Some(flag) if flag.is_cancelled() => LaunchStatus::Cancelled,
            _ => LaunchStatus::Completed,
        };
        Ok(LaunchResult { elapsed, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BackendKind;
    use crate::kernel::{KernelSignature, ParamDescriptor, ParamLayout};

    fn launcher_with_layout(params: &[ParamDescriptor]) -> Launcher {
        let layout = ParamLayout::from_descriptors(params);
        let artifact = KernelArtifact::host_fn("noop", layout, |_| Ok(()));
        Launcher::new(
            Arc::new(artifact),
            Arc::new(crate::driver::CpuDriver::new(false)),
        )
    }

    #[test]
    fn arity_mismatch_is_rejected_before_submission() {
        let launcher = launcher_with_layout(&[ParamDescriptor::scalar::<u32>()]);
        let err = launcher.marshal(&[]).unwrap_err();
        assert!(matches!(err, Error::InvalidKernelParameters(_)));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let launcher = launcher_with_layout(&[ParamDescriptor::scalar::<u32>()]);
        let err = launcher
            .marshal(&[KernelArg::Struct(vec![0u8; 4])])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKernelParameters(_)));
    }

    #[test]
    fn scalar_width_mismatch_is_rejected() {
        let launcher = launcher_with_layout(&[ParamDescriptor::scalar::<u32>()]);
        let err = launcher.marshal(&[KernelArg::f64(1.0)]).unwrap_err();
        assert!(matches!(err, Error::InvalidKernelParameters(_)));
    }

    #[test]
    fn scalars_pack_at_declared_offsets() {
        let launcher = launcher_with_layout(&[
            ParamDescriptor::scalar::<u32>(),
            ParamDescriptor::scalar::<f64>(),
        ]);
        let block = launcher
            .marshal(&[KernelArg::u32(0xdead_beef), KernelArg::f64(2.5)])
            .unwrap();
        assert_eq!(&block.bytes[0..4], &0xdead_beefu32.to_le_bytes());
        // f64 aligned to 8
        assert_eq!(&block.bytes[8..16], &2.5f64.to_le_bytes());
    }

    #[test]
    fn signature_layout_round_trip() {
        let sig = KernelSignature::new("iota", BackendKind::Cpu)
            .with_param(ParamDescriptor::view::<i32>())
            .with_param(ParamDescriptor::scalar::<u32>());
        let layout = ParamLayout::for_signature(&sig);
        assert_eq!(layout.slots().len(), 2);
        assert_eq!(layout.slots()[0].size, 16);
    }
}
