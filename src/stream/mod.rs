//! Ordered command streams and one-shot events
//!
//! A stream is a FIFO queue drained by a dedicated worker thread, mirroring
//! a driver command queue: enqueue is nonblocking, commands run in program
//! order, and a synchronize establishes a happens-before edge with every
//! prior command. Events join streams: record on one, wait on another.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

static STREAM_IDS: AtomicU64 = AtomicU64::new(1);

type StreamOp = Box<dyn FnOnce() -> Result<()> + Send>;

enum Command {
    /// Run an operation; a failure becomes the stream's sticky first error
    Run { label: &'static str, op: StreamOp },
    /// Run an operation and hand its outcome straight to the waiting caller
    RunAck {
        label: &'static str,
        op: StreamOp,
        ack: Sender<Option<Error>>,
    },
    /// Fence: reply with (and clear) the sticky error once reached
    Fence(FenceReply),
    Record(Event),
    WaitEvent(Event),
    Shutdown,
}

enum FenceReply {
    Sync(Sender<Option<Error>>),
    Async(tokio::sync::oneshot::Sender<Option<Error>>),
}

struct StreamShared {
    /// First error since the last synchronize
    error: Mutex<Option<Error>>,
    cancelled: AtomicBool,
    pending: AtomicUsize,
}

/// Ordered command queue bound to one accelerator
///
/// Enqueue is single-writer by contract: callers serialize their own
/// submissions. Dropping the stream flushes and joins the worker.
pub struct Stream {
    id: u64,
    tx: Sender<Command>,
    shared: Arc<StreamShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Stream {
    /// Spawn the worker thread backing a new stream. Thread creation can
    /// fail under OS resource exhaustion; that surfaces as a typed error,
    /// never a panic.
    pub(crate) fn spawn(label: &str) -> Result<Stream> {
        let id = STREAM_IDS.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        let shared = Arc::new(StreamShared {
            error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
        });
        let worker_shared = shared.clone();
        let thread_name = format!("ignis-stream-{}-{}", label, id);
        let worker = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(rx, worker_shared))?;
        debug!("stream {} created for {}", id, label);
        Ok(Stream {
            id,
            tx,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Commands enqueued but not yet retired
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Signal cancellation. In-flight commands run to completion; the next
    /// enqueue or synchronize returns Cancelled.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    fn check_cancelled(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled(format!("stream {}: {}", self.id, what)))
        } else {
            Ok(())
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(cmd).map_err(|_| {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            Error::Cancelled(format!("stream {} is shut down", self.id))
        })
    }

    /// Enqueue one operation; nonblocking
    pub(crate) fn enqueue_op(
        &self,
        label: &'static str,
        op: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.check_cancelled(label)?;
        self.send(Command::Run {
            label,
            op: Box::new(op),
        })
    }

    /// Enqueue an operation and block until it retires, handing its outcome
    /// directly to the caller instead of the sticky error slot.
    pub(crate) fn run_and_wait(
        &self,
        label: &'static str,
        op: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.check_cancelled(label)?;
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.send(Command::RunAck {
            label,
            op: Box::new(op),
            ack: ack_tx,
        })?;
        match ack_rx.recv() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(Error::InternalInvariantViolated(format!(
                "stream {} worker vanished mid-command",
                self.id
            ))),
        }
    }

    /// Block until all previously enqueued commands finish. Returns and
    /// clears the first error recorded since the last synchronize.
    pub fn synchronize(&self) -> Result<()> {
        self.check_cancelled("synchronize")?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.send(Command::Fence(FenceReply::Sync(tx)))?;
        match rx.recv() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(Error::InternalInvariantViolated(format!(
                "stream {} worker vanished at fence",
                self.id
            ))),
        }
    }

    /// Synchronize with a deadline. Elapsing returns a retryable Timeout;
    /// the fence stays queued and later synchronizes still work.
    pub fn synchronize_timeout(&self, timeout: Duration) -> Result<()> {
        self.check_cancelled("synchronize")?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.send(Command::Fence(FenceReply::Sync(tx)))?;
        match rx.recv_timeout(timeout) {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "stream {} drain exceeded {:?}",
                self.id, timeout
            ))),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(Error::InternalInvariantViolated(format!(
                    "stream {} worker vanished at fence",
                    self.id
                )))
            }
        }
    }

    /// Future resolving once all previously enqueued commands finish
    pub async fn synchronize_async(&self) -> Result<()> {
        self.check_cancelled("synchronize")?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(Command::Fence(FenceReply::Async(tx)))?;
        match rx.await {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(Error::InternalInvariantViolated(format!(
                "stream {} worker vanished at fence",
                self.id
            ))),
        }
    }

    /// Record a fresh one-shot event at the current queue position
    pub fn record_event(&self) -> Result<Event> {
        self.check_cancelled("record_event")?;
        let event = Event::new();
        self.send(Command::Record(event.clone()))?;
        Ok(event)
    }

    /// Order all later commands on this stream after `event`
    pub fn wait_for_event(&self, event: &Event) -> Result<()> {
        self.check_cancelled("wait_for_event")?;
        self.send(Command::WaitEvent(event.clone()))
    }

    /// Drain regardless of cancellation; used at teardown
    pub(crate) fn flush_for_shutdown(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.send(Command::Fence(FenceReply::Sync(tx)))?;
        match rx.recv_timeout(timeout) {
            Ok(_) => Ok(()),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "stream {} did not drain within {:?}",
                self.id, timeout
            ))),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Ok(()),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // flush + sync: Shutdown sits behind every queued command
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("stream {} worker panicked during drain", self.id);
            }
        }
    }
}

fn worker_loop(rx: Receiver<Command>, shared: Arc<StreamShared>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            Command::Run { label, op } => {
                if let Err(e) = op() {
                    trace!("stream command '{}' failed: {}", label, e);
                    shared.error.lock().get_or_insert(e);
                }
                shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
            Command::RunAck { label, op, ack } => {
                let outcome = op().err();
                if outcome.is_some() {
                    trace!("stream command '{}' failed", label);
                }
                let _ = ack.send(outcome);
                shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
            Command::Fence(reply) => {
                let first_error = shared.error.lock().take();
                match reply {
                    FenceReply::Sync(tx) => {
                        let _ = tx.send(first_error);
                    }
                    FenceReply::Async(tx) => {
                        let _ = tx.send(first_error);
                    }
                }
                shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
            Command::Record(event) => {
                event.signal();
                shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
            Command::WaitEvent(event) => {
                event.wait();
                shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
            Command::Shutdown => break,
        }
    }
}

struct EventInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// One-shot cross-stream synchronization point
///
/// Created by [`Stream::record_event`]; once the recording stream reaches
/// it, the event stays signaled forever.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                signaled: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    pub(crate) fn signal(&self) {
        let mut signaled = self.inner.signaled.lock();
        *signaled = true;
        self.inner.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.signaled.lock()
    }

    /// Block the calling thread until the event fires
    pub fn wait(&self) {
        let mut signaled = self.inner.signaled.lock();
        while !*signaled {
            self.inner.cond.wait(&mut signaled);
        }
    }

    /// Block with a deadline; false means the deadline elapsed first
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut signaled = self.inner.signaled.lock();
        while !*signaled {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            self.inner.cond.wait_for(&mut signaled, deadline - now);
        }
        true
    }
}

/// Shared cancellation flag honored at enqueue boundaries
#[derive(Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
