//! Structured error logging with pluggable sinks
//!
//! The runtime reports every surfaced or recovered error as an
//! [`ErrorEvent`]. Sinks decide where events go: stdout, a file, or an
//! in-memory buffer for tests.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{Error, ErrorSeverity};
use crate::device::DeviceId;

/// One structured error report
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Stable error code
    pub code: &'static str,
    /// Display form of the error
    pub message: String,
    /// Name of the operation that failed
    pub operation: String,
    pub severity: ErrorSeverity,
    /// Device the operation ran against, when known
    pub device: Option<DeviceId>,
    /// Kernel name, when the failure is kernel-scoped
    pub kernel: Option<String>,
    /// 1-based attempt counter; >1 means the recovery dispatcher retried
    pub attempt: u32,
    /// Free-form context map
    pub context: HashMap<String, String>,
    /// Recovery suggestions carried by the error
    pub suggestions: Vec<String>,
}

impl ErrorEvent {
    pub fn new(err: &Error, operation: impl Into<String>) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            operation: operation.into(),
            severity: err.severity(),
            device: None,
            kernel: None,
            attempt: 1,
            context: HashMap::new(),
            suggestions: err.suggestions().iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_kernel(mut self, kernel: impl Into<String>) -> Self {
        self.kernel = Some(kernel.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Destination for structured error events
pub trait ErrorSink: Send + Sync {
    fn write(&self, event: &ErrorEvent);
}

/// Fan-out logger owning the configured sinks
///
/// Also mirrors every event into `tracing` at the mapped level, so the
/// runtime stays observable even with no sink installed.
pub struct ErrorLogger {
    sinks: Mutex<Vec<Arc<dyn ErrorSink>>>,
    min_severity: ErrorSeverity,
}

impl ErrorLogger {
    pub fn new(min_severity: ErrorSeverity) -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            min_severity,
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn ErrorSink>) {
        self.sinks.lock().push(sink);
    }

    pub fn report(&self, event: ErrorEvent) {
        match event.severity {
            ErrorSeverity::Critical => {
                error!(code = event.code, op = %event.operation, attempt = event.attempt,
                       "CRITICAL: {}", event.message)
            }
            ErrorSeverity::Error => {
                error!(code = event.code, op = %event.operation, attempt = event.attempt,
                       "{}", event.message)
            }
            ErrorSeverity::Warning => {
                warn!(code = event.code, op = %event.operation, attempt = event.attempt,
                      "{}", event.message)
            }
            ErrorSeverity::Info => {
                info!(code = event.code, op = %event.operation, "{}", event.message)
            }
        }

        if event.severity < self.min_severity {
            return;
        }
        for sink in self.sinks.lock().iter() {
            sink.write(&event);
        }
    }
}

impl Default for ErrorLogger {
    fn default() -> Self {
        Self::new(ErrorSeverity::Warning)
    }
}

/// Writes events to stdout, one line each
pub struct ConsoleSink;

impl ErrorSink for ConsoleSink {
    fn write(&self, event: &ErrorEvent) {
        println!(
            "[{:?}] {} op={} attempt={} {}",
            event.severity, event.code, event.operation, event.attempt, event.message
        );
    }
}

/// Appends events to a log file; write failures are swallowed after a debug log
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ErrorSink for FileSink {
    fn write(&self, event: &ErrorEvent) {
        let line = format!(
            "{:?}\t{}\t{}\t{}\t{}\n",
            event.severity, event.code, event.operation, event.attempt, event.message
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            debug!("error sink write to {:?} failed: {}", self.path, e);
        }
    }
}

/// Buffers events in memory; used by tests to assert on recovery behavior
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ErrorEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ErrorEvent> {
        self.events.lock().clone()
    }
}

impl ErrorSink for MemorySink {
    fn write(&self, event: &ErrorEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_respects_severity_floor() {
        let logger = ErrorLogger::new(ErrorSeverity::Warning);
        let sink = MemorySink::new();
        logger.add_sink(sink.clone());

        logger.report(ErrorEvent::new(&Error::Cancelled("op".into()), "launch"));
        logger.report(ErrorEvent::new(&Error::out_of_memory(128), "allocate"));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].code, "IG003");
        assert_eq!(events[0].operation, "allocate");
    }

    #[test]
    fn event_builder_collects_context() {
        let event = ErrorEvent::new(&Error::LaunchFailed("grid".into()), "launch")
            .with_kernel("saxpy")
            .with_attempt(2)
            .with_context("grid_x", "4096");
        assert_eq!(event.kernel.as_deref(), Some("saxpy"));
        assert_eq!(event.attempt, 2);
        assert_eq!(event.context.get("grid_x").map(String::as_str), Some("4096"));
    }
}
