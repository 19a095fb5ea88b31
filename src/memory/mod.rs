//! Memory buffer hierarchy
//!
//! Dense rank-1/2/3 buffers with strides, non-owning views, coherent
//! unified buffers, pinned host buffers, and the per-accelerator pool.

pub mod buffer;
pub mod pool;
pub mod unified;

use bytemuck::Pod;

pub use buffer::{ArrayView, MemoryBuffer};
pub use pool::{BufferPool, PoolStats};
pub use unified::{CoherenceSide, UnifiedBuffer};

/// Element types a buffer may hold: fixed size, no references
pub trait Element: Pod + Send + Sync + 'static {}
impl<T: Pod + Send + Sync + 'static> Element for T {}

/// Where a buffer's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    Host,
    Device,
    Unified,
    Pinned,
}

/// Placement request at allocation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutHint {
    CpuOptimized,
    GpuOptimized,
    Unified,
    Pinned,
    Auto,
}

const AUTO_SMALL_ELEMS: usize = 1024;
const AUTO_UNIFIED_ELEMS: usize = 1024 * 1024;

impl LayoutHint {
    /// Resolve Auto against the allocation size and device capability:
    /// small working sets stay CPU-optimized, big ones go unified when the
    /// device can, everything else is GPU-optimized.
    pub(crate) fn resolve(self, len: usize, unified_supported: bool) -> MemoryLocation {
        match self {
            LayoutHint::CpuOptimized => MemoryLocation::Host,
            LayoutHint::GpuOptimized => MemoryLocation::Device,
            LayoutHint::Unified => MemoryLocation::Unified,
            LayoutHint::Pinned => MemoryLocation::Pinned,
            LayoutHint::Auto => {
                if len < AUTO_SMALL_ELEMS {
                    MemoryLocation::Host
                } else if unified_supported && len > AUTO_UNIFIED_ELEMS {
                    MemoryLocation::Unified
                } else {
                    MemoryLocation::Device
                }
            }
        }
    }
}

/// Dense buffer extent, rank 1 to 3
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    D1(usize),
    D2(usize, usize),
    D3(usize, usize, usize),
}

impl Shape {
    pub fn rank(&self) -> u8 {
        match self {
            Shape::D1(_) => 1,
            Shape::D2(..) => 2,
            Shape::D3(..) => 3,
        }
    }

    /// Total element count
    pub fn len(&self) -> usize {
        match *self {
            Shape::D1(x) => x,
            Shape::D2(x, y) => x * y,
            Shape::D3(x, y, z) => x * y * z,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dims(&self) -> [usize; 3] {
        match *self {
            Shape::D1(x) => [x, 1, 1],
            Shape::D2(x, y) => [x, y, 1],
            Shape::D3(x, y, z) => [x, y, z],
        }
    }

    /// Outermost dimension, the axis hybrid dispatch splits along
    pub fn outer(&self) -> usize {
        self.dims()[0]
    }

    /// Row-major element strides, padded to rank 3
    pub fn strides(&self) -> [usize; 3] {
        match *self {
            Shape::D1(_) => [1, 1, 1],
            Shape::D2(_, y) => [y, 1, 1],
            Shape::D3(_, y, z) => [y * z, z, 1],
        }
    }
}

impl From<usize> for Shape {
    fn from(len: usize) -> Self {
        Shape::D1(len)
    }
}

impl From<(usize, usize)> for Shape {
    fn from((x, y): (usize, usize)) -> Self {
        Shape::D2(x, y)
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((x, y, z): (usize, usize, usize)) -> Self {
        Shape::D3(x, y, z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_hint_resolves_by_size() {
        assert_eq!(
            LayoutHint::Auto.resolve(1023, true),
            MemoryLocation::Host
        );
        assert_eq!(
            LayoutHint::Auto.resolve(4096, false),
            MemoryLocation::Device
        );
        assert_eq!(
            LayoutHint::Auto.resolve(2 * 1024 * 1024, true),
            MemoryLocation::Unified
        );
        // unified needs device support
        assert_eq!(
            LayoutHint::Auto.resolve(2 * 1024 * 1024, false),
            MemoryLocation::Device
        );
    }

    #[test]
    fn shape_strides_are_row_major() {
        assert_eq!(Shape::D2(3, 4).strides(), [4, 1, 1]);
        assert_eq!(Shape::D3(2, 3, 4).strides(), [12, 4, 1]);
        assert_eq!(Shape::D2(3, 4).len(), 12);
        assert_eq!(Shape::D3(2, 3, 4).outer(), 2);
    }
}
