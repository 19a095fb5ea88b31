//! Builtin operation kernels
//!
//! Host-function artifacts for the tensor operations the dispatcher routes
//! to device execution. They travel through the same cache and launcher
//! machinery as user kernels; on hardware backends the external code
//! generator would supply PTX/SPIR-V for the same signatures instead.

use rayon::prelude::*;

use crate::device::{BackendKind, TensorPrecision};
use crate::kernel::{KernelArtifact, KernelSignature, ParamDescriptor, ParamLayout};
use crate::memory::Element;

/// Version string for every builtin kernel; cache entries invalidate when
/// the op implementations change.
pub const BUILTIN_KERNEL_VERSION: &str = "builtin-1";

/// Element types the operation kernels accept
pub trait SimdElement: Element {
    const ZERO: Self;

    fn add(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;

    /// Precision class this type occupies on matrix-multiply hardware
    fn tensor_precision() -> Option<TensorPrecision> {
        None
    }

    /// Short type tag used in kernel entry-point names
    fn tag() -> &'static str;
}

macro_rules! simd_element {
    ($ty:ty, $tag:literal, $precision:expr) => {
        impl SimdElement for $ty {
            const ZERO: Self = 0 as $ty;

            fn add(self, rhs: Self) -> Self {
                self + rhs
            }

            fn mul(self, rhs: Self) -> Self {
                self * rhs
            }

            fn tensor_precision() -> Option<TensorPrecision> {
                $precision
            }

            fn tag() -> &'static str {
                $tag
            }
        }
    };
}

simd_element!(f32, "f32", Some(TensorPrecision::Tf32));
simd_element!(f64, "f64", None);
simd_element!(i32, "i32", None);
simd_element!(i64, "i64", None);
simd_element!(u32, "u32", None);
simd_element!(u64, "u64", None);

pub fn add_signature<T: SimdElement>(device_kind: BackendKind) -> KernelSignature {
    KernelSignature::new(format!("ignis.ops.add.{}", T::tag()), device_kind)
        .with_param(ParamDescriptor::view::<T>())
        .with_param(ParamDescriptor::view::<T>())
        .with_param(ParamDescriptor::view::<T>())
}

/// out[i] = a[i] + b[i]
pub fn add_artifact<T: SimdElement>() -> KernelArtifact {
    let layout = ParamLayout::from_descriptors(&[
        ParamDescriptor::view::<T>(),
        ParamDescriptor::view::<T>(),
        ParamDescriptor::view::<T>(),
    ]);
    KernelArtifact::host_fn(format!("ignis.ops.add.{}", T::tag()), layout, |ctx| {
        let a = ctx.view::<T>(0)?;
        let b = ctx.view::<T>(1)?;
        let out = ctx.view_mut::<T>(2)?;
        if ctx.parallel() {
            out.par_iter_mut()
                .zip(a.par_iter().zip(b.par_iter()))
                .for_each(|(o, (x, y))| *o = x.add(*y));
        } else {
            for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
                *o = x.add(*y);
            }
        }
        Ok(())
    })
}

pub fn matmul_signature<T: SimdElement>(device_kind: BackendKind, wmma: bool) -> KernelSignature {
    let name = if wmma {
        format!("ignis.ops.matmul.wmma.{}", T::tag())
    } else {
        format!("ignis.ops.matmul.{}", T::tag())
    };
    KernelSignature::new(name, device_kind)
        .with_param(ParamDescriptor::view::<T>())
        .with_param(ParamDescriptor::view::<T>())
        .with_param(ParamDescriptor::view::<T>())
        .with_param(ParamDescriptor::scalar::<u32>())
        .with_param(ParamDescriptor::scalar::<u32>())
        .with_param(ParamDescriptor::scalar::<u32>())
}

/// out (m×n) = a (m×k) · b (k×n), row-major
pub fn matmul_artifact<T: SimdElement>(wmma: bool) -> KernelArtifact {
    let layout = ParamLayout::from_descriptors(&[
        ParamDescriptor::view::<T>(),
        ParamDescriptor::view::<T>(),
        ParamDescriptor::view::<T>(),
        ParamDescriptor::scalar::<u32>(),
        ParamDescriptor::scalar::<u32>(),
        ParamDescriptor::scalar::<u32>(),
    ]);
    let name = if wmma {
        format!("ignis.ops.matmul.wmma.{}", T::tag())
    } else {
        format!("ignis.ops.matmul.{}", T::tag())
    };
    KernelArtifact::host_fn(name, layout, |ctx| {
        let a = ctx.view::<T>(0)?;
        let b = ctx.view::<T>(1)?;
        let out = ctx.view_mut::<T>(2)?;
        let m = ctx.scalar::<u32>(3)? as usize;
        let k = ctx.scalar::<u32>(4)? as usize;
        let n = ctx.scalar::<u32>(5)? as usize;

        let row = |a_row: &[T], out_row: &mut [T]| {
            for (j, cell) in out_row.iter_mut().enumerate().take(n) {
                let mut acc = T::ZERO;
                for (kk, lhs) in a_row.iter().enumerate().take(k) {
                    acc = acc.add(lhs.mul(b[kk * n + j]));
                }
                *cell = acc;
            }
        };

        if ctx.parallel() {
            out.par_chunks_mut(n)
                .zip(a.par_chunks(k))
                .take(m)
                .for_each(|(out_row, a_row)| row(a_row, out_row));
        } else {
            for (out_row, a_row) in out.chunks_mut(n).zip(a.chunks(k)).take(m) {
                row(a_row, out_row);
            }
        }
        Ok(())
    })
}

pub fn reduce_signature<T: SimdElement>(device_kind: BackendKind) -> KernelSignature {
    KernelSignature::new(format!("ignis.ops.reduce_sum.{}", T::tag()), device_kind)
        .with_param(ParamDescriptor::view::<T>())
        .with_param(ParamDescriptor::view::<T>())
}

/// out[0] = Σ a[i]
pub fn reduce_artifact<T: SimdElement>() -> KernelArtifact {
    let layout = ParamLayout::from_descriptors(&[
        ParamDescriptor::view::<T>(),
        ParamDescriptor::view::<T>(),
    ]);
    KernelArtifact::host_fn(
        format!("ignis.ops.reduce_sum.{}", T::tag()),
        layout,
        |ctx| {
            let a = ctx.view::<T>(0)?;
            let out = ctx.view_mut::<T>(1)?;
            let sum = if ctx.parallel() {
                a.par_iter()
                    .copied()
                    .reduce(|| T::ZERO, |x, y| x.add(y))
            } else {
                a.iter().copied().fold(T::ZERO, |x, y| x.add(y))
            };
            out[0] = sum;
            Ok(())
        },
    )
}

pub fn transpose_signature<T: SimdElement>(device_kind: BackendKind) -> KernelSignature {
    KernelSignature::new(format!("ignis.ops.transpose.{}", T::tag()), device_kind)
        .with_param(ParamDescriptor::view::<T>())
        .with_param(ParamDescriptor::view::<T>())
        .with_param(ParamDescriptor::scalar::<u32>())
        .with_param(ParamDescriptor::scalar::<u32>())
}

/// out (n×m) = aᵀ for a (m×n)
pub fn transpose_artifact<T: SimdElement>() -> KernelArtifact {
    let layout = ParamLayout::from_descriptors(&[
        ParamDescriptor::view::<T>(),
        ParamDescriptor::view::<T>(),
        ParamDescriptor::scalar::<u32>(),
        ParamDescriptor::scalar::<u32>(),
    ]);
    KernelArtifact::host_fn(
        format!("ignis.ops.transpose.{}", T::tag()),
        layout,
        |ctx| {
            let a = ctx.view::<T>(0)?;
            let out = ctx.view_mut::<T>(1)?;
            let rows = ctx.scalar::<u32>(2)? as usize;
            let cols = ctx.scalar::<u32>(3)? as usize;

            if ctx.parallel() {
                out.par_chunks_mut(rows)
                    .enumerate()
                    .take(cols)
                    .for_each(|(j, out_row)| {
                        for (i, cell) in out_row.iter_mut().enumerate().take(rows) {
                            *cell = a[i * cols + j];
                        }
                    });
            } else {
                for j in 0..cols {
                    for i in 0..rows {
                        out[j * rows + i] = a[i * cols + j];
                    }
                }
            }
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simd_elements_expose_precision_classes() {
        assert_eq!(f32::tensor_precision(), Some(TensorPrecision::Tf32));
        assert_eq!(f64::tensor_precision(), None);
        assert_eq!(i32::tensor_precision(), None);
    }

    #[test]
    fn op_signatures_are_type_tagged() {
        let add_f32 = add_signature::<f32>(BackendKind::Cpu);
        let add_f64 = add_signature::<f64>(BackendKind::Cpu);
        assert_ne!(
            add_f32.fingerprint(BUILTIN_KERNEL_VERSION),
            add_f64.fingerprint(BUILTIN_KERNEL_VERSION)
        );
    }

    #[test]
    fn wmma_and_general_matmul_have_distinct_identities() {
        let general = matmul_signature::<f32>(BackendKind::Cuda, false);
        let wmma = matmul_signature::<f32>(BackendKind::Cuda, true);
        assert_ne!(
            general.fingerprint(BUILTIN_KERNEL_VERSION),
            wmma.fingerprint(BUILTIN_KERNEL_VERSION)
        );
    }
}
