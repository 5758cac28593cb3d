//! Interrupt and notification bridge
//!
//! Turns a device interrupt into completions. The host's interrupt entry
//! point calls [`InterruptBridge::handle`] with the source that fired: the
//! shared legacy INTx line, or one MSI-X vector. The bridge works out which
//! queues may have progressed, drains their used rings and hands each
//! `(cookie, bytes_written)` to the [`CompletionHandler`].
//!
//! Completions are gathered under the queue lock and delivered after it is
//! released, so a handler may submit follow-up work on the same queue.
//!
//! [`InterruptBridge::handle`] never spins. It only try-locks the route table
//! and the queues; anything found locked (because the interrupt landed in
//! the middle of a submission on this CPU) is left for
//! [`InterruptBridge::poll`], which the submission path runs once
//! [`InterruptBridge::needs_poll`] reports deferred work.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use log::{debug, error};
use spin::Mutex;

use crate::{
    error::{VirtioError, VirtioResult},
    queue::SharedQueue,
    transport::{IsrStatus, LegacyPciTransport, RegisterWindow, VIRTIO_MSI_NO_VECTOR},
};

// ---------------------------------------------------------------------------
// Handler and source types
// ---------------------------------------------------------------------------

/// Receives completed chains from the bridge.
///
/// Called from interrupt context; implementations must not block.
pub trait CompletionHandler<T>: Send + Sync {
    /// Chain `cookie` on `queue` finished with `written` bytes placed in its
    /// device-writable buffers.
    fn complete(&self, queue: u16, cookie: T, written: u32);

    /// The device signalled a configuration change.
    fn config_changed(&self) {}
}

/// What raised the interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// Shared INTx line. The ISR register tells what happened.
    Legacy,
    /// MSI-X vector.
    Vector(u16),
}

/// Summary of one [`InterruptBridge::handle`] or [`InterruptBridge::poll`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqOutcome {
    /// Completions delivered to the handler
    pub completions: usize,
    /// The config change hook ran
    pub config_changed: bool,
    /// Nothing was pending for this device
    pub spurious: bool,
    /// A queue or the route table was busy; [`InterruptBridge::poll`] must
    /// finish the job
    pub deferred: bool,
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

struct QueueRoute<T> {
    vector: Option<u16>,
    queue: Arc<SharedQueue<T>>,
}

type Routes<T> = BTreeMap<u16, QueueRoute<T>>;

/// Dispatches device interrupts to queues and the completion handler.
pub struct InterruptBridge<W, T> {
    transport: Arc<LegacyPciTransport<W>>,
    routes: Mutex<Routes<T>>,
    /// `VIRTIO_MSI_NO_VECTOR` when config changes arrive on the legacy line
    config_vector: AtomicU16,
    /// Set when `handle` skipped a busy queue
    deferred: AtomicBool,
    handler: Arc<dyn CompletionHandler<T>>,
}

impl<W: RegisterWindow, T> InterruptBridge<W, T> {
    pub fn new(
        transport: Arc<LegacyPciTransport<W>>,
        handler: Arc<dyn CompletionHandler<T>>,
    ) -> Self {
        Self {
            transport,
            routes: Mutex::new(BTreeMap::new()),
            config_vector: AtomicU16::new(VIRTIO_MSI_NO_VECTOR),
            deferred: AtomicBool::new(false),
            handler,
        }
    }

    /// Serve queue `index` on `vector` (or the legacy line for `None`).
    ///
    /// Replaces any previous route for the same index.
    pub fn register(&self, index: u16, vector: Option<u16>, queue: Arc<SharedQueue<T>>) {
        self.routes.lock().insert(index, QueueRoute { vector, queue });
    }

    /// Stop serving queue `index`, handing back the bridge's reference.
    pub fn unregister(&self, index: u16) -> Option<Arc<SharedQueue<T>>> {
        self.routes.lock().remove(&index).map(|route| route.queue)
    }

    /// Drop every queue route. Needed before the device can be torn down.
    pub fn clear(&self) {
        self.routes.lock().clear();
    }

    /// Route configuration change interrupts from `vector`, or from the
    /// legacy line for `None`.
    pub fn set_config_vector(&self, vector: Option<u16>) {
        self.config_vector
            .store(vector.unwrap_or(VIRTIO_MSI_NO_VECTOR), Ordering::Release);
    }

    /// Whether an interrupt left work behind for [`poll`](Self::poll).
    pub fn needs_poll(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }

    /// Handle one interrupt.
    ///
    /// Safe to call from interrupt context: locks are only tried. Completions
    /// found before a protocol error are still delivered; the first error is
    /// returned afterwards so the caller can fail the device.
    pub fn handle(&self, source: InterruptSource) -> VirtioResult<IrqOutcome> {
        let (config_changed, claimed) = match source {
            InterruptSource::Legacy => {
                let isr = self.transport.read_isr()?;
                (isr.contains(IsrStatus::CONFIG), !isr.is_empty())
            }
            InterruptSource::Vector(vector) => {
                let is_config = vector != VIRTIO_MSI_NO_VECTOR
                    && self.config_vector.load(Ordering::Acquire) == vector;
                (is_config, is_config)
            }
        };

        let mut outcome = IrqOutcome::default();
        if config_changed {
            self.handler.config_changed();
            outcome.config_changed = true;
        }

        let result = match self.routes.try_lock() {
            Some(routes) => {
                let targets = Self::targets(&routes, |route| match source {
                    InterruptSource::Legacy => true,
                    InterruptSource::Vector(vector) => route.vector == Some(vector),
                });
                drop(routes);
                self.drain_all(&targets, false, &mut outcome)
            }
            None => {
                self.defer(&mut outcome);
                debug!("[VIRTIO] route table busy, deferring {:?}", source);
                Ok(())
            }
        };

        outcome.spurious = !claimed && outcome.completions == 0 && !outcome.deferred;
        if outcome.spurious {
            debug!("[VIRTIO] spurious interrupt from {:?}", source);
        }
        result.map(|()| outcome)
    }

    /// Drain every registered queue without reading the ISR.
    ///
    /// Used while interrupts are suppressed and to finish work an interrupt
    /// deferred. Must not run in interrupt context.
    pub fn poll(&self) -> VirtioResult<IrqOutcome> {
        self.deferred.store(false, Ordering::Release);
        let targets = Self::targets(&self.routes.lock(), |_| true);
        let mut outcome = IrqOutcome::default();
        self.drain_all(&targets, true, &mut outcome)?;
        Ok(outcome)
    }

    fn targets(
        routes: &Routes<T>,
        mut wanted: impl FnMut(&QueueRoute<T>) -> bool,
    ) -> Vec<(u16, Arc<SharedQueue<T>>)> {
        routes
            .iter()
            .filter(|(_, route)| wanted(*route))
            .map(|(index, route)| (*index, route.queue.clone()))
            .collect()
    }

    fn defer(&self, outcome: &mut IrqOutcome) {
        self.deferred.store(true, Ordering::Release);
        outcome.deferred = true;
    }

    fn drain_all(
        &self,
        targets: &[(u16, Arc<SharedQueue<T>>)],
        blocking: bool,
        outcome: &mut IrqOutcome,
    ) -> VirtioResult<()> {
        let mut first_error = None;
        for (index, queue) in targets {
            if let Err(err) = self.drain(*index, queue, blocking, outcome) {
                error!("[VIRTIO] queue {}: {}", index, err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn drain(
        &self,
        index: u16,
        queue: &SharedQueue<T>,
        blocking: bool,
        outcome: &mut IrqOutcome,
    ) -> VirtioResult<()> {
        let (done, result) = {
            let mut vq = if blocking {
                queue.lock()
            } else {
                match queue.try_lock() {
                    Some(vq) => vq,
                    None => {
                        self.defer(outcome);
                        debug!("[VIRTIO] queue {} busy, deferring to poll", index);
                        return Ok(());
                    }
                }
            };
            if !vq.has_pending() {
                return Ok(());
            }
            let mut done = Vec::new();
            let mut result: Result<(), VirtioError> = Ok(());
            for item in vq.reclaim() {
                match item {
                    Ok(completion) => done.push(completion),
                    Err(err) => result = Err(err),
                }
            }
            (done, result)
        };

        outcome.completions += done.len();
        for (cookie, written) in done {
            self.handler.complete(index, cookie, written);
        }
        result
    }
}
