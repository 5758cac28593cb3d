//! Driver-side configuration for bringing up a device

use alloc::vec::Vec;

/// One queue the driver wants the device to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRequest {
    /// Queue index on the device
    pub index: u16,
    /// MSI-X vector for used-buffer interrupts, `None` for the legacy line
    pub vector: Option<u16>,
}

impl QueueRequest {
    pub fn new(index: u16) -> Self {
        Self {
            index,
            vector: None,
        }
    }

    pub fn with_vector(index: u16, vector: u16) -> Self {
        Self {
            index,
            vector: Some(vector),
        }
    }
}

/// Everything [`VirtioDevice::attach`](crate::VirtioDevice::attach) needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Feature bits the driver understands. Negotiation accepts the
    /// intersection with what the device offers.
    pub driver_features: u32,
    /// MSI-X is enabled on the PCI function.
    pub msix: bool,
    /// Vector for configuration change interrupts (MSI-X only).
    pub config_vector: Option<u16>,
    pub queues: Vec<QueueRequest>,
}

impl DriverConfig {
    /// A single legacy-interrupt queue at index 0, no optional features.
    pub fn default_config() -> Self {
        Self {
            driver_features: 0,
            msix: false,
            config_vector: None,
            queues: alloc::vec![QueueRequest::new(0)],
        }
    }

    pub fn features(mut self, features: u32) -> Self {
        self.driver_features = features;
        self
    }

    /// Switch to MSI-X with configuration changes on `config_vector`.
    pub fn msix(mut self, config_vector: u16) -> Self {
        self.msix = true;
        self.config_vector = Some(config_vector);
        self
    }

    /// Replace the queue list.
    pub fn queues(mut self, queues: &[QueueRequest]) -> Self {
        self.queues = queues.to_vec();
        self
    }

    pub fn queue(mut self, request: QueueRequest) -> Self {
        self.queues.push(request);
        self
    }

    /// Whether any request needs an MSI-X vector.
    pub fn uses_vectors(&self) -> bool {
        self.config_vector.is_some() || self.queues.iter().any(|q| q.vector.is_some())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::default_config()
    }
}
