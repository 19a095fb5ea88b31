//! Error types and recovery for the ignis runtime
//!
//! Every fallible operation in the runtime returns [`Result`]. Driver status
//! codes are translated into typed [`Error`] values at the FFI boundary so
//! callers never see raw backend codes.

pub mod recovery;
pub mod sink;

use std::time::Duration;
use thiserror::Error;

pub use recovery::{RecoveryDispatcher, RetryConfig};
pub use sink::{ConsoleSink, ErrorEvent, ErrorLogger, ErrorSink, FileSink, MemorySink};

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error severity levels for the structured error logger
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Retry strategies the recovery dispatcher understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Surface to the caller unchanged
    NoRetry,
    /// Call `pool.trim()` once, then retry once
    TrimAndRetry,
    /// Retry with backoff up to the configured attempt count
    Backoff { max_retries: u32 },
}

/// Runtime error taxonomy
///
/// The kind set is closed: everything a driver or subsystem can report maps
/// onto one of these variants before it leaves the module that produced it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid kernel parameters: {0}")]
    InvalidKernelParameters(String),

    #[error("out of device memory: requested {requested} bytes ({message})")]
    OutOfMemory { requested: u64, message: String },

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("driver error: {message}")]
    DriverError { message: String, transient: bool },

    #[error("kernel compilation failed for '{kernel}': {message}")]
    KernelCompilationFailed { kernel: String, message: String },

    #[error("kernel launch failed: {0}")]
    LaunchFailed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolated(String),

    /// Host-side OS failures: persistent-cache I/O and stream worker
    /// spawning. Not part of the device taxonomy; carried so those paths
    /// can use `?` instead of panicking.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an out-of-memory error with the standard recovery suggestion
    pub fn out_of_memory(requested: u64) -> Self {
        Error::OutOfMemory {
            requested,
            message: "Reduce working set or call pool.trim()".to_string(),
        }
    }

    /// Build a transient driver error, eligible for retry
    pub fn transient_driver(message: impl Into<String>) -> Self {
        Error::DriverError {
            message: message.into(),
            transient: true,
        }
    }

    /// Build a permanent driver error
    pub fn driver(message: impl Into<String>) -> Self {
        Error::DriverError {
            message: message.into(),
            transient: false,
        }
    }

    /// Stable error code for telemetry
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "IG001",
            Self::InvalidKernelParameters(_) => "IG002",
            Self::OutOfMemory { .. } => "IG003",
            Self::DeviceUnavailable(_) => "IG004",
            Self::DriverError { .. } => "IG005",
            Self::KernelCompilationFailed { .. } => "IG006",
            Self::LaunchFailed(_) => "IG007",
            Self::Timeout(_) => "IG008",
            Self::Cancelled(_) => "IG009",
            Self::Unsupported(_) => "IG010",
            Self::InternalInvariantViolated(_) => "IG011",
            Self::Io(_) => "IG012",
        }
    }

    /// Severity used by the structured error logger
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::InternalInvariantViolated(_) => ErrorSeverity::Critical,
            Self::KernelCompilationFailed { .. } => ErrorSeverity::Error,
            Self::DriverError { transient, .. } => {
                if *transient {
                    ErrorSeverity::Warning
                } else {
                    ErrorSeverity::Error
                }
            }
            Self::OutOfMemory { .. } | Self::Timeout(_) | Self::DeviceUnavailable(_) => {
                ErrorSeverity::Warning
            }
            Self::Cancelled(_) => ErrorSeverity::Info,
            Self::InvalidArgument(_)
            | Self::InvalidKernelParameters(_)
            | Self::LaunchFailed(_)
            | Self::Unsupported(_)
            | Self::Io(_) => ErrorSeverity::Error,
        }
    }

    /// Recommended recovery strategy for this error
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::OutOfMemory { .. } => RetryStrategy::TrimAndRetry,
            Self::Timeout(_) => RetryStrategy::Backoff { max_retries: 3 },
            Self::DriverError { transient: true, .. } => RetryStrategy::Backoff { max_retries: 1 },
            Self::LaunchFailed(_) => RetryStrategy::Backoff { max_retries: 1 },
            _ => RetryStrategy::NoRetry,
        }
    }

    /// Whether the recovery dispatcher may consume this error and retry
    pub fn is_retryable(&self) -> bool {
        !matches!(self.retry_strategy(), RetryStrategy::NoRetry)
    }

    /// Fatal errors surface to the caller unchanged, always
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_)
                | Self::InvalidKernelParameters(_)
                | Self::InternalInvariantViolated(_)
                | Self::KernelCompilationFailed { .. }
                | Self::DriverError { transient: false, .. }
                | Self::Unsupported(_)
        )
    }

    /// Recovery suggestions attached to this error, if any
    pub fn suggestions(&self) -> Vec<&str> {
        match self {
            Self::OutOfMemory { message, .. } => vec![message.as_str()],
            Self::Timeout(_) => vec!["Retry with a longer timeout"],
            Self::DeviceUnavailable(_) => vec!["Re-poll device status before retrying"],
            _ => Vec::new(),
        }
    }

    /// Clone-lite copy used by the compile barrier to hand the same failure
    /// to every waiter. Io sources collapse to their display form.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Self::InvalidArgument(m) => Self::InvalidArgument(m.clone()),
            Self::InvalidKernelParameters(m) => Self::InvalidKernelParameters(m.clone()),
            Self::OutOfMemory { requested, message } => Self::OutOfMemory {
                requested: *requested,
                message: message.clone(),
            },
            Self::DeviceUnavailable(m) => Self::DeviceUnavailable(m.clone()),
            Self::DriverError { message, transient } => Self::DriverError {
                message: message.clone(),
                transient: *transient,
            },
            Self::KernelCompilationFailed { kernel, message } => Self::KernelCompilationFailed {
                kernel: kernel.clone(),
                message: message.clone(),
            },
            Self::LaunchFailed(m) => Self::LaunchFailed(m.clone()),
            Self::Timeout(m) => Self::Timeout(m.clone()),
            Self::Cancelled(m) => Self::Cancelled(m.clone()),
            Self::Unsupported(m) => Self::Unsupported(m.clone()),
            Self::InternalInvariantViolated(m) => Self::InternalInvariantViolated(m.clone()),
            Self::Io(e) => Self::DriverError {
                message: format!("io: {}", e),
                transient: false,
            },
        }
    }

    /// Backoff delay before the given retry attempt (1-based)
    pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
        base.saturating_mul(1u32 << attempt.min(8))
    }
}
