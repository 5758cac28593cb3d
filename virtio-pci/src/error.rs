//! Error types for the virtio transport and virtqueue core
//!
//! Every failure is reported as a [`VirtioError`]. Variants are grouped into
//! four [`ErrorKind`]s which decide how the lifecycle controller reacts:
//! configuration and resource errors stay local to the queue or request that
//! caused them, protocol and hardware errors are fatal to the device.

use core::fmt;

/// Main virtio error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// Queue configuration errors
    InvalidQueueSize {
        index: u16,
        size: u16,
    },
    RegionTooSmall {
        required: usize,
        provided: usize,
    },
    MisalignedRegion {
        phys: u64,
    },
    RegionUnreachable {
        phys: u64,
    },
    EmptyChain,
    BufferTooLarge {
        len: usize,
    },
    ConfigOutOfRange {
        offset: u16,
        len: usize,
    },
    QueueInUse {
        index: u16,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Resource errors
    OutOfDescriptors {
        requested: usize,
        available: u16,
    },
    OutOfMemory {
        requested: usize,
    },

    /// Protocol errors
    NoConfigVector {
        vector: u16,
    },
    NoQueueVector {
        index: u16,
        vector: u16,
    },
    StatusOrder {
        current: u8,
        requested: u8,
    },
    UnofferedFeatures {
        offered: u32,
        requested: u32,
    },
    FeatureWidening {
        accepted: u32,
        requested: u32,
    },
    QueueAlreadyActive {
        index: u16,
    },
    InvalidUsedEntry {
        queue: u16,
        id: u32,
    },
    UsedRingOverrun {
        queue: u16,
        pending: u16,
    },

    /// Hardware errors
    DeviceRemoved,
}

/// Classification of a [`VirtioError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid queue depth, unusable region or misuse of the API. Fatal to
    /// the queue being set up, harmless to other queues.
    Configuration,
    /// No free descriptors or no DMA memory. Recoverable by retrying later.
    ResourceExhaustion,
    /// The device or the driver broke the virtio protocol.
    ProtocolViolation,
    /// Register access shows the device is gone.
    Hardware,
}

/// Result type alias for virtio operations
pub type VirtioResult<T> = Result<T, VirtioError>;

impl VirtioError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidQueueSize { .. }
            | Self::RegionTooSmall { .. }
            | Self::MisalignedRegion { .. }
            | Self::RegionUnreachable { .. }
            | Self::EmptyChain
            | Self::BufferTooLarge { .. }
            | Self::ConfigOutOfRange { .. }
            | Self::QueueInUse { .. }
            | Self::InvalidState { .. } => ErrorKind::Configuration,
            Self::OutOfDescriptors { .. } | Self::OutOfMemory { .. } => {
                ErrorKind::ResourceExhaustion
            }
            Self::NoConfigVector { .. }
            | Self::NoQueueVector { .. }
            | Self::StatusOrder { .. }
            | Self::UnofferedFeatures { .. }
            | Self::FeatureWidening { .. }
            | Self::QueueAlreadyActive { .. }
            | Self::InvalidUsedEntry { .. }
            | Self::UsedRingOverrun { .. } => ErrorKind::ProtocolViolation,
            Self::DeviceRemoved => ErrorKind::Hardware,
        }
    }

    /// Whether this error must take the whole device to FAILED.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProtocolViolation | ErrorKind::Hardware
        )
    }
}

impl fmt::Display for VirtioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidQueueSize { index, size } => {
                write!(f, "Queue {} reports invalid size {}", index, size)
            }
            Self::RegionTooSmall { required, provided } => {
                write!(
                    f,
                    "Ring region too small: {} bytes required, {} provided",
                    required, provided
                )
            }
            Self::MisalignedRegion { phys } => {
                write!(f, "Ring region at 0x{:x} is not page aligned", phys)
            }
            Self::RegionUnreachable { phys } => {
                write!(f, "Ring region at 0x{:x} is beyond the 32-bit PFN range", phys)
            }
            Self::EmptyChain => write!(f, "Descriptor chain has no segments"),
            Self::BufferTooLarge { len } => {
                write!(f, "Buffer of {} bytes exceeds the 32-bit descriptor length", len)
            }
            Self::ConfigOutOfRange { offset, len } => {
                write!(
                    f,
                    "Device config read of {} bytes at offset 0x{:x} leaves the register window",
                    len, offset
                )
            }
            Self::QueueInUse { index } => {
                write!(f, "Queue {} is still referenced outside the device", index)
            }
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, actual {}", expected, actual)
            }
            Self::OutOfDescriptors {
                requested,
                available,
            } => {
                write!(
                    f,
                    "Out of descriptors: requested {}, {} free",
                    requested, available
                )
            }
            Self::OutOfMemory { requested } => {
                write!(f, "Out of DMA memory: requested {} bytes", requested)
            }
            Self::NoConfigVector { vector } => {
                write!(f, "Device refused config vector {}", vector)
            }
            Self::NoQueueVector { index, vector } => {
                write!(f, "Device refused vector {} for queue {}", vector, index)
            }
            Self::StatusOrder { current, requested } => {
                write!(
                    f,
                    "Status ratchet violated: current 0x{:02x}, requested 0x{:02x}",
                    current, requested
                )
            }
            Self::UnofferedFeatures { offered, requested } => {
                write!(
                    f,
                    "Features 0x{:08x} not offered (device offers 0x{:08x})",
                    requested & !offered,
                    offered
                )
            }
            Self::FeatureWidening {
                accepted,
                requested,
            } => {
                write!(
                    f,
                    "Feature set may only narrow: accepted 0x{:08x}, requested 0x{:08x}",
                    accepted, requested
                )
            }
            Self::QueueAlreadyActive { index } => write!(f, "Queue {} is already active", index),
            Self::InvalidUsedEntry { queue, id } => {
                write!(f, "Queue {}: device returned unknown chain head {}", queue, id)
            }
            Self::UsedRingOverrun { queue, pending } => {
                write!(
                    f,
                    "Queue {}: device published {} used entries, more than the ring holds",
                    queue, pending
                )
            }
            Self::DeviceRemoved => write!(f, "Device no longer responds"),
        }
    }
}
