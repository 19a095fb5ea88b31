//! ignis - a host-side GPU compute runtime
//!
//! Compiles user kernels once, caches the artifacts, and launches them on
//! heterogeneous accelerators (CUDA, OpenCL, and an in-process CPU
//! simulator) while managing device memory, streams, and error recovery.
//!
//! ```no_run
//! use ignis::{Context, LayoutHint, Shape};
//!
//! let context = Context::new()?;
//! let accel = context.create_default_accelerator()?;
//! let buffer = accel.allocate::<f32>(Shape::D1(1024), LayoutHint::Auto)?;
//! buffer.copy_from_host(&vec![1.0f32; 1024], None)?;
//! # Ok::<(), ignis::Error>(())
//! ```

pub mod accelerator;
pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod stream;

// Re-export the types a typical embedder touches
pub use accelerator::Accelerator;
pub use config::{
    CacheConfig, HybridConfig, KernelConfig, OptimizationLevel, PoolConfig, PreferredBackend,
    RetentionPolicy, RuntimeConfig,
};
pub use context::{Context, ContextBuilder};
pub use device::{
    BackendKind, Device, DeviceCapabilities, DeviceCatalog, DeviceFilter, DeviceId, DeviceStatus,
    Feature, TensorPrecision,
};
pub use dispatch::{ExecutionStrategy, HybridDispatcher, SimdElement, TensorOp};
pub use driver::{DevicePtr, LaunchDims, MemoryInfo};
pub use error::{Error, ErrorSeverity, Result};
pub use kernel::{
    CachedKernel, KernelArg, KernelArtifact, KernelCache, KernelSignature, LaunchResult,
    LaunchStatus, Launcher, ParamDescriptor, ParamKind, ParamLayout,
};
pub use memory::{
    ArrayView, BufferPool, CoherenceSide, Element, LayoutHint, MemoryBuffer, MemoryLocation,
    PoolStats, Shape, UnifiedBuffer,
};
pub use stream::{CancelFlag, Event, Stream};
