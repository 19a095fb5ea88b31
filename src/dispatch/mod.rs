//! Hybrid CPU/GPU operation dispatch
//!
//! Routes tensor operations to the CPU-SIMD path, general device execution,
//! matrix-multiply hardware, or a split across CPU and device. Strategy
//! resolution is deterministic given the operation, working-set size, and
//! device capabilities.

pub mod kernels;

use rayon::prelude::*;
use tracing::debug;

use crate::accelerator::Accelerator;
use crate::driver::LaunchDims;
use crate::error::{Error, Result};
use crate::kernel::{KernelArg, KernelSignature};
use crate::memory::{MemoryBuffer, Shape};

pub use kernels::{SimdElement, BUILTIN_KERNEL_VERSION};

const DEVICE_BLOCK: u32 = 256;

/// Caller strategy hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Auto,
    CpuSimd,
    GpuGeneral,
    GpuTensorCore,
    Hybrid,
}

/// Operations the dispatcher understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorOp {
    Add,
    MatMul,
    Convolve,
    Reduce,
    Transpose,
}

impl TensorOp {
    /// Operations that map onto matrix-multiply hardware
    fn wmma_class(self) -> bool {
        matches!(self, TensorOp::MatMul | TensorOp::Convolve)
    }
}

/// Per-operation strategy router over one accelerator
pub struct HybridDispatcher {
    accel: Accelerator,
}

impl HybridDispatcher {
    pub fn new(accel: Accelerator) -> Self {
        Self { accel }
    }

    pub fn accelerator(&self) -> &Accelerator {
        &self.accel
    }

    /// Resolve a hint to a concrete strategy. Deterministic given inputs.
    pub fn resolve_strategy<T: SimdElement>(
        &self,
        op: TensorOp,
        total_elems: usize,
        dims: &[usize],
        hint: ExecutionStrategy,
    ) -> Result<ExecutionStrategy> {
        match hint {
            ExecutionStrategy::Auto => Ok(self.auto_strategy::<T>(op, total_elems, dims)),
            ExecutionStrategy::GpuTensorCore => {
                if !op.wmma_class() {
                    return Err(Error::Unsupported(format!(
                        "tensor cores accelerate matmul/convolve, not {:?}",
                        op
                    )));
                }
                let supported = T::tensor_precision()
                    .map(|p| self.accel.supported_precisions().contains(&p))
                    .unwrap_or(false);
                if !supported {
                    return Err(Error::Unsupported(format!(
                        "{} has no tensor cores for {}",
                        self.accel.device().name(),
                        std::any::type_name::<T>()
                    )));
                }
                Ok(ExecutionStrategy::GpuTensorCore)
            }
            other => Ok(other),
        }
    }

    fn auto_strategy<T: SimdElement>(
        &self,
        op: TensorOp,
        total_elems: usize,
        dims: &[usize],
    ) -> ExecutionStrategy {
        let config = &self.accel.config().hybrid;
        if total_elems < config.small_threshold {
            return ExecutionStrategy::CpuSimd;
        }
        let precision_ok = T::tensor_precision()
            .map(|p| self.accel.supported_precisions().contains(&p))
            .unwrap_or(false);
        if self.accel.supports_tensor_cores()
            && op.wmma_class()
            && precision_ok
            && dims.iter().all(|d| *d >= 16)
        {
            return ExecutionStrategy::GpuTensorCore;
        }
        if !self.accel.device_id().is_cpu_class() {
            return ExecutionStrategy::GpuGeneral;
        }
        ExecutionStrategy::CpuSimd
    }

    /// out = a + b, element-wise
    pub fn add<T: SimdElement>(
        &self,
        a: &MemoryBuffer<T>,
        b: &MemoryBuffer<T>,
        out: &MemoryBuffer<T>,
        hint: ExecutionStrategy,
    ) -> Result<()> {
        let len = a.len();
        if b.len() != len || out.len() != len {
            return Err(Error::InvalidArgument(format!(
                "add over mismatched lengths {}/{}/{}",
                a.len(),
                b.len(),
                out.len()
            )));
        }
        let strategy = self.resolve_strategy::<T>(TensorOp::Add, len, &[len], hint)?;
        debug!("add[{}] via {:?}", len, strategy);

        match strategy {
            ExecutionStrategy::CpuSimd => {
                let xs = a.view().read_to_vec()?;
                let ys = b.view().read_to_vec()?;
                let mut zs = vec![T::ZERO; len];
                zs.par_iter_mut()
                    .zip(xs.par_iter().zip(ys.par_iter()))
                    .for_each(|(z, (x, y))| *z = x.add(*y));
                out.view().write_from_slice(&zs)
            }
            ExecutionStrategy::Hybrid => self.add_hybrid(a, b, out),
            _ => self.launch_add_typed::<T>(a, b, out, 0, len),
        }
    }

    /// out = a · b for row-major 2-D buffers
    pub fn matmul<T: SimdElement>(
        &self,
        a: &MemoryBuffer<T>,
        b: &MemoryBuffer<T>,
        out: &MemoryBuffer<T>,
        hint: ExecutionStrategy,
    ) -> Result<()> {
        let (m, k) = match a.shape() {
            Shape::D2(m, k) => (m, k),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "matmul lhs must be rank 2, got rank {}",
                    other.rank()
                )))
            }
        };
        let (k2, n) = match b.shape() {
            Shape::D2(k2, n) => (k2, n),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "matmul rhs must be rank 2, got rank {}",
                    other.rank()
                )))
            }
        };
        if k != k2 || out.shape() != Shape::D2(m, n) {
            return Err(Error::InvalidArgument(format!(
                "matmul shape mismatch: ({}, {}) · ({}, {}) -> {:?}",
                m, k, k2, n, out.shape()
            )));
        }

        let strategy =
            self.resolve_strategy::<T>(TensorOp::MatMul, m * n, &[m, k, n], hint)?;
        debug!("matmul[{}x{}x{}] via {:?}", m, k, n, strategy);

        match strategy {
            ExecutionStrategy::CpuSimd => {
                let xs = a.view().read_to_vec()?;
                let ys = b.view().read_to_vec()?;
                let mut zs = vec![T::ZERO; m * n];
                matmul_rows(&xs, &ys, &mut zs, k, n);
                out.view().write_from_slice(&zs)
            }
            ExecutionStrategy::Hybrid => self.matmul_hybrid(a, b, out, m, k, n),
            wmma_or_general => {
                let wmma = wmma_or_general == ExecutionStrategy::GpuTensorCore;
                self.launch_matmul::<T>(
                    a.view().arg(),
                    b.view().arg(),
                    out.view().arg(),
                    m,
                    k,
                    n,
                    wmma,
                )?;
                self.accel.default_stream().synchronize()
            }
        }
    }

    /// Σ a[i]
    pub fn reduce_sum<T: SimdElement>(
        &self,
        a: &MemoryBuffer<T>,
        hint: ExecutionStrategy,
    ) -> Result<T> {
        let len = a.len();
        let strategy = self.resolve_strategy::<T>(TensorOp::Reduce, len, &[len], hint)?;
        let strategy = match strategy {
            ExecutionStrategy::Hybrid => {
                debug!("reduce has no hybrid split; using general device path");
                ExecutionStrategy::GpuGeneral
            }
            other => other,
        };

        match strategy {
            ExecutionStrategy::CpuSimd => {
                let xs = a.view().read_to_vec()?;
                Ok(xs
                    .par_iter()
                    .copied()
                    .reduce(|| T::ZERO, |x, y| x.add(y)))
            }
            _ => {
                let out = self.accel.rent::<T>(1)?;
                let launcher = self.load_builtin(
                    kernels::reduce_signature::<T>(self.accel.device_id().backend()),
                    || Ok(kernels::reduce_artifact::<T>()),
                )?;
                launcher.launch_sync(
                    LaunchDims::grid_for(len, DEVICE_BLOCK),
                    LaunchDims::linear(DEVICE_BLOCK),
                    vec![a.view().arg(), out.view().arg()],
                    self.accel.default_stream(),
                )?;
                let mut host = vec![T::ZERO; 1];
                out.copy_to_host(&mut host)?;
                let sum = host[0];
                self.accel.return_buffer(out, false)?;
                Ok(sum)
            }
        }
    }

    /// out (n×m) = aᵀ for a (m×n)
    pub fn transpose<T: SimdElement>(
        &self,
        a: &MemoryBuffer<T>,
        out: &MemoryBuffer<T>,
        hint: ExecutionStrategy,
    ) -> Result<()> {
        let (rows, cols) = match a.shape() {
            Shape::D2(r, c) => (r, c),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "transpose input must be rank 2, got rank {}",
                    other.rank()
                )))
            }
        };
        if out.shape() != Shape::D2(cols, rows) {
            return Err(Error::InvalidArgument(format!(
                "transpose of ({}, {}) needs a ({}, {}) destination",
                rows, cols, cols, rows
            )));
        }

        let strategy =
            self.resolve_strategy::<T>(TensorOp::Transpose, rows * cols, &[rows, cols], hint)?;
        let strategy = match strategy {
            ExecutionStrategy::Hybrid => {
                debug!("transpose has no hybrid split; using general device path");
                ExecutionStrategy::GpuGeneral
            }
            other => other,
        };

        match strategy {
            ExecutionStrategy::CpuSimd => {
                let xs = a.view().read_to_vec()?;
                let mut zs = vec![T::ZERO; rows * cols];
                zs.par_chunks_mut(rows)
                    .enumerate()
                    .for_each(|(j, out_row)| {
                        for (i, cell) in out_row.iter_mut().enumerate() {
                            *cell = xs[i * cols + j];
                        }
                    });
                out.view().write_from_slice(&zs)
            }
            _ => {
                let launcher = self.load_builtin(
                    kernels::transpose_signature::<T>(self.accel.device_id().backend()),
                    || Ok(kernels::transpose_artifact::<T>()),
                )?;
                launcher.launch_sync(
                    LaunchDims::grid_for(rows * cols, DEVICE_BLOCK),
                    LaunchDims::linear(DEVICE_BLOCK),
                    vec![
                        a.view().arg(),
                        out.view().arg(),
                        KernelArg::u32(rows as u32),
                        KernelArg::u32(cols as u32),
                    ],
                    self.accel.default_stream(),
                )
            }
        }
    }

    /// Split an add along the flat extent: CPU computes the head share,
    /// the device computes the tail, the two halves join on an event plus
    /// the CPU-side completion.
    fn add_hybrid<T: SimdElement>(
        &self,
        a: &MemoryBuffer<T>,
        b: &MemoryBuffer<T>,
        out: &MemoryBuffer<T>,
    ) -> Result<()> {
        let len = a.len();
        let split = self.cpu_share(len);
        if split == 0 {
            return self.launch_add_typed::<T>(a, b, out, 0, len);
        }
        if split == len {
            return self.add(a, b, out, ExecutionStrategy::CpuSimd);
        }

        // device tail first so it overlaps the CPU head
        self.launch_add_tail::<T>(a, b, out, split, len)?;
        let stream = self.accel.default_stream();
        let event = stream.record_event()?;

        let xs = a.subview(0, split)?.read_to_vec()?;
        let ys = b.subview(0, split)?.read_to_vec()?;
        let mut zs = vec![T::ZERO; split];
        zs.par_iter_mut()
            .zip(xs.par_iter().zip(ys.par_iter()))
            .for_each(|(z, (x, y))| *z = x.add(*y));
        out.subview(0, split)?.write_from_slice(&zs)?;

        event.wait();
        stream.synchronize()
    }

    /// Split a matmul along the output rows
    fn matmul_hybrid<T: SimdElement>(
        &self,
        a: &MemoryBuffer<T>,
        b: &MemoryBuffer<T>,
        out: &MemoryBuffer<T>,
        m: usize,
        k: usize,
        n: usize,
    ) -> Result<()> {
        let cpu_rows = self.cpu_share(m);
        if cpu_rows == 0 {
            self.launch_matmul::<T>(
                a.view().arg(),
                b.view().arg(),
                out.view().arg(),
                m,
                k,
                n,
                false,
            )?;
            return self.accel.default_stream().synchronize();
        }
        if cpu_rows == m {
            return self.matmul(a, b, out, ExecutionStrategy::CpuSimd);
        }

        let gpu_rows = m - cpu_rows;
        self.launch_matmul::<T>(
            a.subview(cpu_rows * k, gpu_rows * k)?.arg(),
            b.view().arg(),
            out.subview(cpu_rows * n, gpu_rows * n)?.arg(),
            gpu_rows,
            k,
            n,
            false,
        )?;
        let stream = self.accel.default_stream();
        let event = stream.record_event()?;

        let xs = a.subview(0, cpu_rows * k)?.read_to_vec()?;
        let ys = b.view().read_to_vec()?;
        let mut zs = vec![T::ZERO; cpu_rows * n];
        matmul_rows(&xs, &ys, &mut zs, k, n);
        out.subview(0, cpu_rows * n)?.write_from_slice(&zs)?;

        event.wait();
        stream.synchronize()
    }

    /// CPU element share under the configured ratio
    fn cpu_share(&self, extent: usize) -> usize {
        let ratio = self.accel.config().hybrid.cpu_gpu_ratio;
        ((extent as f64) * ratio).round() as usize
    }

    fn launch_add_typed<T: SimdElement>(
        &self,
        a: &MemoryBuffer<T>,
        b: &MemoryBuffer<T>,
        out: &MemoryBuffer<T>,
        offset: usize,
        len: usize,
    ) -> Result<()> {
        let extent = len - offset;
        let launcher = self.load_builtin(
            kernels::add_signature::<T>(self.accel.device_id().backend()),
            || Ok(kernels::add_artifact::<T>()),
        )?;
        launcher.launch_sync(
            LaunchDims::grid_for(extent, DEVICE_BLOCK),
            LaunchDims::linear(DEVICE_BLOCK),
            vec![
                a.subview(offset, extent)?.arg(),
                b.subview(offset, extent)?.arg(),
                out.subview(offset, extent)?.arg(),
            ],
            self.accel.default_stream(),
        )
    }

    /// Enqueue the device tail of a hybrid add without synchronizing
    fn launch_add_tail<T: SimdElement>(
        &self,
        a: &MemoryBuffer<T>,
        b: &MemoryBuffer<T>,
        out: &MemoryBuffer<T>,
        offset: usize,
        len: usize,
    ) -> Result<()> {
        let extent = len - offset;
        let launcher = self.load_builtin(
            kernels::add_signature::<T>(self.accel.device_id().backend()),
            || Ok(kernels::add_artifact::<T>()),
        )?;
        launcher.launch(
            LaunchDims::grid_for(extent, DEVICE_BLOCK),
            LaunchDims::linear(DEVICE_BLOCK),
            vec![
                a.subview(offset, extent)?.arg(),
                b.subview(offset, extent)?.arg(),
                out.subview(offset, extent)?.arg(),
            ],
            self.accel.default_stream(),
        )
    }

    fn launch_matmul<T: SimdElement>(
        &self,
        a: KernelArg,
        b: KernelArg,
        out: KernelArg,
        m: usize,
        k: usize,
        n: usize,
        wmma: bool,
    ) -> Result<()> {
        let launcher = self.load_builtin(
            kernels::matmul_signature::<T>(self.accel.device_id().backend(), wmma),
            move || Ok(kernels::matmul_artifact::<T>(wmma)),
        )?;
        launcher.launch(
            LaunchDims::grid_for(m * n, DEVICE_BLOCK),
            LaunchDims::linear(DEVICE_BLOCK),
            vec![
                a,
                b,
                out,
                KernelArg::u32(m as u32),
                KernelArg::u32(k as u32),
                KernelArg::u32(n as u32),
            ],
            self.accel.default_stream(),
        )
    }

    fn load_builtin<F>(
        &self,
        signature: KernelSignature,
        source_fn: F,
    ) -> Result<crate::kernel::Launcher>
    where
        F: FnOnce() -> Result<crate::kernel::KernelArtifact>,
    {
        if !self.accel.device_id().is_cpu_class() {
            // hardware backends take their op kernels from the external
            // code generator, which is not linked into the core
            return Err(Error::Unsupported(format!(
                "no generated op kernels for backend {}",
                self.accel.device_id().backend()
            )));
        }
        self.accel
            .load_kernel_cached(&signature, BUILTIN_KERNEL_VERSION, source_fn)
    }
}

fn matmul_rows<T: SimdElement>(a: &[T], b: &[T], out: &mut [T], k: usize, n: usize) {
    out.par_chunks_mut(n)
        .zip(a.par_chunks(k))
        .for_each(|(out_row, a_row)| {
            for (j, cell) in out_row.iter_mut().enumerate() {
                let mut acc = T::ZERO;
                for (kk, lhs) in a_row.iter().enumerate() {
                    acc = acc.add(lhs.mul(b[kk * n + j]));
                }
                *cell = acc;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PreferredBackend, RuntimeConfig};
    use crate::device::{BackendKind, DeviceCatalog, DeviceFilter};
    use crate::memory::LayoutHint;

    fn dispatcher() -> HybridDispatcher {
        let catalog = DeviceCatalog::probe(PreferredBackend::Cpu);
        let device = catalog
            .discover(&DeviceFilter::backend(BackendKind::CpuSimd))
            .remove(0);
        let accel = Accelerator::new(device, RuntimeConfig::default()).unwrap();
        HybridDispatcher::new(accel)
    }

    fn filled(
        dispatcher: &HybridDispatcher,
        shape: Shape,
        data: &[f32],
    ) -> MemoryBuffer<f32> {
        let buffer = dispatcher
            .accelerator()
            .allocate::<f32>(shape, LayoutHint::GpuOptimized)
            .unwrap();
        buffer.copy_from_host(data, None).unwrap();
        buffer
    }

    #[test]
    fn auto_picks_cpu_simd_below_the_small_threshold() {
        let d = dispatcher();
        let threshold = d.accelerator().config().hybrid.small_threshold;
        let strategy = d
            .resolve_strategy::<f32>(
                TensorOp::Add,
                threshold - 1,
                &[threshold - 1],
                ExecutionStrategy::Auto,
            )
            .unwrap();
        assert_eq!(strategy, ExecutionStrategy::CpuSimd);
    }

    #[test]
    fn auto_keeps_cpu_class_devices_on_the_simd_path() {
        let d = dispatcher();
        let strategy = d
            .resolve_strategy::<f32>(
                TensorOp::MatMul,
                1 << 20,
                &[1024, 1024, 1024],
                ExecutionStrategy::Auto,
            )
            .unwrap();
        assert_eq!(strategy, ExecutionStrategy::CpuSimd);
    }

    #[test]
    fn tensor_core_hint_without_hardware_is_unsupported() {
        let d = dispatcher();
        let err = d
            .resolve_strategy::<f32>(
                TensorOp::MatMul,
                1 << 20,
                &[1024, 1024, 1024],
                ExecutionStrategy::GpuTensorCore,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        // and never for non-wmma operations
        let err = d
            .resolve_strategy::<f32>(
                TensorOp::Add,
                1 << 20,
                &[1 << 20],
                ExecutionStrategy::GpuTensorCore,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn add_agrees_across_strategies() {
        let d = dispatcher();
        let len = 10_000;
        let xs: Vec<f32> = (0..len).map(|i| i as f32).collect();
        let ys: Vec<f32> = (0..len).map(|i| (len - i) as f32).collect();

        let a = filled(&d, Shape::D1(len), &xs);
        let b = filled(&d, Shape::D1(len), &ys);

        for strategy in [
            ExecutionStrategy::CpuSimd,
            ExecutionStrategy::GpuGeneral,
            ExecutionStrategy::Hybrid,
        ] {
            let out = d
                .accelerator()
                .allocate::<f32>(Shape::D1(len), LayoutHint::GpuOptimized)
                .unwrap();
            d.add(&a, &b, &out, strategy).unwrap();
            let mut host = vec![0.0f32; len];
            out.copy_to_host(&mut host).unwrap();
            assert!(
                host.iter().all(|v| *v == len as f32),
                "strategy {:?} disagreed",
                strategy
            );
        }
    }

    #[test]
    fn matmul_matches_the_hand_computed_product() {
        let d = dispatcher();
        // (2×3) · (3×2)
        let a = filled(&d, Shape::D2(2, 3), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = filled(&d, Shape::D2(3, 2), &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let out = d
            .accelerator()
            .allocate::<f32>(Shape::D2(2, 2), LayoutHint::GpuOptimized)
            .unwrap();

        d.matmul(&a, &b, &out, ExecutionStrategy::GpuGeneral).unwrap();
        let mut host = vec![0.0f32; 4];
        out.copy_to_host(&mut host).unwrap();
        assert_eq!(host, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn hybrid_matmul_agrees_with_cpu_simd() {
        let d = dispatcher();
        let (m, k, n) = (64, 32, 48);
        let xs: Vec<f32> = (0..m * k).map(|i| (i % 13) as f32).collect();
        let ys: Vec<f32> = (0..k * n).map(|i| (i % 7) as f32).collect();
        let a = filled(&d, Shape::D2(m, k), &xs);
        let b = filled(&d, Shape::D2(k, n), &ys);

        let reference = d
            .accelerator()
            .allocate::<f32>(Shape::D2(m, n), LayoutHint::GpuOptimized)
            .unwrap();
        d.matmul(&a, &b, &reference, ExecutionStrategy::CpuSimd)
            .unwrap();

        let hybrid = d
            .accelerator()
            .allocate::<f32>(Shape::D2(m, n), LayoutHint::GpuOptimized)
            .unwrap();
        d.matmul(&a, &b, &hybrid, ExecutionStrategy::Hybrid).unwrap();

        let mut want = vec![0.0f32; m * n];
        let mut got = vec![0.0f32; m * n];
        reference.copy_to_host(&mut want).unwrap();
        hybrid.copy_to_host(&mut got).unwrap();
        assert_eq!(want, got);
    }

    #[test]
    fn shape_mismatch_is_rejected_before_dispatch() {
        let d = dispatcher();
        let a = filled(&d, Shape::D2(2, 3), &[0.0; 6]);
        let b = filled(&d, Shape::D2(2, 3), &[0.0; 6]);
        let out = d
            .accelerator()
            .allocate::<f32>(Shape::D2(2, 2), LayoutHint::GpuOptimized)
            .unwrap();
        assert!(matches!(
            d.matmul(&a, &b, &out, ExecutionStrategy::Auto),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn reduce_and_transpose_round_trip() {
        let d = dispatcher();
        let xs: Vec<f32> = (1..=100).map(|i| i as f32).collect();
        let a = filled(&d, Shape::D1(100), &xs);
        let sum = d.reduce_sum(&a, ExecutionStrategy::CpuSimd).unwrap();
        assert_eq!(sum, 5050.0);
        let sum_device = d.reduce_sum(&a, ExecutionStrategy::GpuGeneral).unwrap();
        assert_eq!(sum_device, 5050.0);

        let m = filled(&d, Shape::D2(2, 3), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = d
            .accelerator()
            .allocate::<f32>(Shape::D2(3, 2), LayoutHint::GpuOptimized)
            .unwrap();
        d.transpose(&m, &t, ExecutionStrategy::GpuGeneral).unwrap();
        let mut host = vec![0.0f32; 6];
        t.copy_to_host(&mut host).unwrap();
        assert_eq!(host, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }
}
