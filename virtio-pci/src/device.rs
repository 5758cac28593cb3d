//! Device lifecycle controller
//!
//! Brings a legacy virtio device from reset to DRIVER_OK and back:
//!
//! ```text
//!   Reset --negotiate_features--> FeaturesNegotiated
//!         --setup_queues-------->  QueuesReady
//!         --driver_ok----------->  DriverOk
//!   any   --fatal error--------->  Failed
//!   any   --teardown------------>  Reset
//! ```
//!
//! Protocol and hardware errors are fatal: the controller takes every queue
//! away from the device, writes FAILED and returns the error. Ring memory
//! stays allocated until [`VirtioDevice::teardown`].

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use log::{debug, error, info, warn};
use spin::Mutex;

use crate::{
    config::{DriverConfig, QueueRequest},
    dma::DmaAllocator,
    error::{VirtioError, VirtioResult},
    layout::{validate_queue_size, VirtqLayout},
    queue::{SharedQueue, VirtQueue},
    transport::{DeviceStatus, Features, LegacyPciTransport, QueueNotifier, RegisterWindow},
};

/// Transport features the ring code does not implement. Never accepted,
/// whatever the driver asks for.
const UNSUPPORTED_FEATURES: Features = Features::RING_EVENT_IDX.union(Features::BAD_FEATURE);

/// Where the device is in its bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Reset,
    FeaturesNegotiated,
    QueuesReady,
    DriverOk,
    Failed,
}

impl DeviceState {
    fn name(self) -> &'static str {
        match self {
            Self::Reset => "Reset",
            Self::FeaturesNegotiated => "FeaturesNegotiated",
            Self::QueuesReady => "QueuesReady",
            Self::DriverOk => "DriverOk",
            Self::Failed => "Failed",
        }
    }
}

/// Host-side driver state for one virtio device.
pub struct VirtioDevice<W, T> {
    transport: Arc<LegacyPciTransport<W>>,
    state: DeviceState,
    features: u32,
    queues: BTreeMap<u16, Arc<SharedQueue<T>>>,
}

impl<W: RegisterWindow + 'static, T> VirtioDevice<W, T> {
    pub fn new(transport: Arc<LegacyPciTransport<W>>) -> Self {
        Self {
            transport,
            state: DeviceState::Reset,
            features: 0,
            queues: BTreeMap::new(),
        }
    }

    /// Transport the device was created on.
    pub fn transport(&self) -> &Arc<LegacyPciTransport<W>> {
        &self.transport
    }

    /// Current bring-up state.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Features accepted during negotiation.
    pub fn features(&self) -> u32 {
        self.features
    }

    /// Shared handle to an activated queue.
    pub fn queue(&self, index: u16) -> Option<Arc<SharedQueue<T>>> {
        self.queues.get(&index).cloned()
    }

    /// Indices of the activated queues, ascending.
    pub fn queue_indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.queues.keys().copied()
    }

    /// Run the whole bring-up described by `config`.
    pub fn attach<D: DmaAllocator + ?Sized>(
        &mut self,
        config: &DriverConfig,
        dma: &D,
    ) -> VirtioResult<()> {
        self.transport.set_msix_enabled(config.msix);
        self.negotiate_features(config.driver_features)?;
        if let Some(vector) = config.config_vector {
            if let Err(err) = self.transport.assign_config_vector(vector) {
                return Err(self.fail(err));
            }
        }
        self.setup_queues(&config.queues, dma)?;
        self.driver_ok()
    }

    /// Reset the device and agree on features.
    ///
    /// Accepts the intersection of `supported` and the offered bits, minus
    /// the transport features this crate does not implement, and returns it.
    pub fn negotiate_features(&mut self, supported: u32) -> VirtioResult<u32> {
        self.expect_state(DeviceState::Reset)?;
        match self.try_negotiate(supported) {
            Ok(accepted) => {
                self.features = accepted;
                self.state = DeviceState::FeaturesNegotiated;
                Ok(accepted)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn try_negotiate(&self, supported: u32) -> VirtioResult<u32> {
        let t = &self.transport;
        t.reset();
        t.add_status(DeviceStatus::ACKNOWLEDGE)?;
        t.add_status(DeviceStatus::DRIVER)?;

        let offered = t.host_features()?;
        let accepted = offered & supported & !UNSUPPORTED_FEATURES.bits();
        if offered & supported & UNSUPPORTED_FEATURES.bits() != 0 {
            debug!(
                "[VIRTIO] declining unsupported features {:#010x}",
                offered & supported & UNSUPPORTED_FEATURES.bits()
            );
        }
        t.write_guest_features(accepted)?;

        t.add_status(DeviceStatus::FEATURES_OK)?;
        // Legacy devices predate FEATURES_OK and may not latch it.
        if !t.status()?.contains(DeviceStatus::FEATURES_OK) {
            warn!("[VIRTIO] device did not latch FEATURES_OK, continuing");
        }

        info!(
            "[VIRTIO] features: offered {:#010x}, accepted {:#010x}",
            offered, accepted
        );
        Ok(accepted)
    }

    /// Create and activate the requested queues.
    ///
    /// A queue the device reports with size zero is skipped. Any other
    /// failure undoes the queues activated by this call and fails the
    /// device. Returns the indices that were activated.
    pub fn setup_queues<D: DmaAllocator + ?Sized>(
        &mut self,
        requests: &[QueueRequest],
        dma: &D,
    ) -> VirtioResult<Vec<u16>> {
        if !matches!(
            self.state,
            DeviceState::FeaturesNegotiated | DeviceState::QueuesReady
        ) {
            return Err(self.invalid_state("FeaturesNegotiated"));
        }

        let mut activated = Vec::new();
        for request in requests {
            match self.setup_queue(request, dma) {
                Ok(true) => activated.push(request.index),
                Ok(false) => {}
                Err(err) => {
                    self.rollback(&activated, dma);
                    return Err(self.fail(err));
                }
            }
        }

        self.state = DeviceState::QueuesReady;
        Ok(activated)
    }

    /// Returns `Ok(false)` when the device has no queue at this index.
    fn setup_queue<D: DmaAllocator + ?Sized>(
        &mut self,
        request: &QueueRequest,
        dma: &D,
    ) -> VirtioResult<bool> {
        let index = request.index;
        let size = self.transport.queue_size(index);
        if size == 0 {
            warn!("[VIRTIO] queue {} not available, skipping", index);
            return Ok(false);
        }
        if size == u16::MAX {
            return Err(VirtioError::DeviceRemoved);
        }
        validate_queue_size(index, size)?;
        if self.queues.contains_key(&index) || self.transport.queue_pfn(index)? != 0 {
            return Err(VirtioError::QueueAlreadyActive { index });
        }

        let layout = VirtqLayout::new(size);
        let mut region = dma
            .allocate_contiguous(layout.total_size())
            .ok_or(VirtioError::OutOfMemory {
                requested: layout.total_size(),
            })?;
        region.zero();

        let notifier: Arc<dyn QueueNotifier> = self.transport.clone();
        let vq = match VirtQueue::new(index, size, region, notifier) {
            Ok(vq) => vq,
            Err(rejected) => {
                // SAFETY: the region was never shown to the device.
                unsafe { dma.release(rejected.region) };
                return Err(rejected.error);
            }
        };

        if let Err(err) = self.transport.activate_queue(index, vq.pfn()) {
            // SAFETY: activation failed, so the device never saw this ring.
            unsafe { dma.release(vq.into_region()) };
            return Err(err);
        }
        if let Some(vector) = request.vector {
            if let Err(err) = self.transport.assign_queue_vector(index, vector) {
                self.transport.deactivate_queue(index);
                // SAFETY: the queue was deactivated above.
                unsafe { dma.release(vq.into_region()) };
                return Err(err);
            }
        }
        self.queues.insert(index, Arc::new(Mutex::new(vq)));

        info!(
            "[VIRTIO] queue {}: {} entries, {} bytes of ring",
            index,
            size,
            layout.total_size()
        );
        Ok(true)
    }

    /// Undo the activations of a failed `setup_queues` call.
    fn rollback<D: DmaAllocator + ?Sized>(&mut self, activated: &[u16], dma: &D) {
        for &index in activated {
            self.transport.deactivate_queue(index);
            if let Some(queue) = self.queues.remove(&index) {
                self.release_queue(index, queue, dma);
            }
        }
    }

    /// Give the device its last go-ahead.
    pub fn driver_ok(&mut self) -> VirtioResult<()> {
        self.expect_state(DeviceState::QueuesReady)?;
        if let Err(err) = self.transport.add_status(DeviceStatus::DRIVER_OK) {
            return Err(self.fail(err));
        }
        self.state = DeviceState::DriverOk;
        info!("[VIRTIO] device live with {} queue(s)", self.queues.len());
        Ok(())
    }

    /// Take the device out of service after a fatal error.
    ///
    /// Deactivates every queue and writes FAILED. Returns `err` so callers
    /// can write `return Err(device.fail(err))`.
    pub fn fail(&mut self, err: VirtioError) -> VirtioError {
        error!("[VIRTIO] device failed: {}", err);
        for &index in self.queues.keys() {
            self.transport.deactivate_queue(index);
        }
        if let Err(status_err) = self.transport.set_failed() {
            error!("[VIRTIO] could not write FAILED: {}", status_err);
        }
        self.state = DeviceState::Failed;
        err
    }

    /// Reset the device and release every queue's ring memory.
    ///
    /// All handles obtained from [`queue`](Self::queue), including those
    /// registered with an interrupt bridge, must have been dropped.
    pub fn teardown<D: DmaAllocator + ?Sized>(&mut self, dma: &D) -> VirtioResult<()> {
        if let Some((&index, _)) = self
            .queues
            .iter()
            .find(|(_, queue)| Arc::strong_count(*queue) > 1)
        {
            return Err(VirtioError::QueueInUse { index });
        }

        for &index in self.queues.keys() {
            self.transport.deactivate_queue(index);
        }
        self.transport.reset();

        let queues = core::mem::take(&mut self.queues);
        for (index, queue) in queues {
            self.release_queue(index, queue, dma);
        }

        self.features = 0;
        self.state = DeviceState::Reset;
        debug!("[VIRTIO] device torn down");
        Ok(())
    }

    /// Return a deactivated queue's ring to `dma`.
    fn release_queue<D: DmaAllocator + ?Sized>(
        &self,
        index: u16,
        queue: Arc<SharedQueue<T>>,
        dma: &D,
    ) {
        match Arc::try_unwrap(queue) {
            Ok(queue) => {
                let region = queue.into_inner().into_region();
                // SAFETY: the queue was deactivated on the device before
                // this call and nothing else holds the ring.
                unsafe { dma.release(region) };
            }
            Err(_) => error!("[VIRTIO] queue {} still shared, leaking its ring", index),
        }
    }

    fn expect_state(&self, expected: DeviceState) -> VirtioResult<()> {
        if self.state != expected {
            return Err(self.invalid_state(expected.name()));
        }
        Ok(())
    }

    fn invalid_state(&self, expected: &'static str) -> VirtioError {
        VirtioError::InvalidState {
            expected,
            actual: self.state.name(),
        }
    }
}
