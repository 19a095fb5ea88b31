//! Process-level runtime root
//!
//! The context owns the device catalog and every accelerator created
//! through it, and tears them down in reverse creation order. Only one
//! context is live per process at a time: re-creating one is permitted but
//! serialized, so a new context never races a dying one for driver state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::accelerator::Accelerator;
use crate::config::RuntimeConfig;
use crate::device::{Device, DeviceCatalog, DeviceFilter, DeviceId};
use crate::error::{Error, Result};

struct ProcessSlot {
    active: Mutex<bool>,
    cond: Condvar,
}

static PROCESS_SLOT: Lazy<ProcessSlot> = Lazy::new(|| ProcessSlot {
    active: Mutex::new(false),
    cond: Condvar::new(),
});

fn acquire_process_slot() {
    let mut active = PROCESS_SLOT.active.lock();
    while *active {
        PROCESS_SLOT.cond.wait(&mut active);
    }
    *active = true;
}

fn release_process_slot() {
    let mut active = PROCESS_SLOT.active.lock();
    *active = false;
    PROCESS_SLOT.cond.notify_one();
}

/// Builder enumerating backends and applying configuration
#[derive(Default)]
pub struct ContextBuilder {
    config: RuntimeConfig,
}

impl ContextBuilder {
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn preferred_backend(mut self, preferred: crate::config::PreferredBackend) -> Self {
        self.config.preferred_backend = preferred;
        self
    }

    pub fn enable_memory_pool(mut self, enabled: bool) -> Self {
        self.config.enable_memory_pool = enabled;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Validate, claim the process slot, and probe devices. Blocks while a
    /// previous context is still alive.
    pub fn build(self) -> Result<Context> {
        self.config.validate()?;
        acquire_process_slot();
        let catalog = DeviceCatalog::probe(self.config.preferred_backend);
        info!(
            "context created: {} devices, preferred backend {:?}",
            catalog.devices().len(),
            self.config.preferred_backend
        );
        Ok(Context {
            inner: Arc::new(ContextInner {
                config: self.config,
                catalog,
                accelerators: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

struct ContextInner {
    config: RuntimeConfig,
    catalog: DeviceCatalog,
    accelerators: Mutex<Vec<Accelerator>>,
    closed: AtomicBool,
}

impl ContextInner {
    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("context shutting down");
        let mut first_error = None;
        let mut accelerators = self.accelerators.lock();
        // reverse creation order
        while let Some(accel) = accelerators.pop() {
            if let Err(e) = accel.shutdown() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let _ = self.shutdown();
        release_process_slot();
    }
}

/// Process-wide runtime root
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Context with the default configuration
    pub fn new() -> Result<Context> {
        Self::builder().build()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// All discovered devices in catalog order
    pub fn devices(&self) -> &[Device] {
        self.inner.catalog.devices()
    }

    pub fn discover(&self, filter: &DeviceFilter) -> Vec<Device> {
        self.inner.catalog.discover(filter)
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.inner.catalog.device(id)
    }

    pub fn default_device(&self) -> Result<&Device> {
        self.inner
            .catalog
            .default_device()
            .ok_or_else(|| Error::DeviceUnavailable("no usable device discovered".into()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::DeviceUnavailable("context is shut down".into()))
        } else {
            Ok(())
        }
    }

    /// Bind an accelerator to `device`; the context owns it for teardown
    pub fn create_accelerator(&self, device: &Device) -> Result<Accelerator> {
        self.ensure_open()?;
        let accel = Accelerator::new(device.clone(), self.inner.config.clone())?;
        self.inner.accelerators.lock().push(accel.clone());
        Ok(accel)
    }

    /// Accelerator on the first usable device
    pub fn create_default_accelerator(&self) -> Result<Accelerator> {
        let device = self.default_device()?.clone();
        self.create_accelerator(&device)
    }

    /// Drain and release everything in reverse creation order. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
