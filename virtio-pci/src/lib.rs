//! Legacy virtio-PCI transport and split virtqueue core.
//!
//! This crate drives a paravirtualized device (for example a virtio-blk
//! storage controller emulated by QEMU/KVM) through the legacy virtio-PCI
//! register block, and manages the split virtqueues shared with it.
//!
//! # Architecture
//!
//! ```text
//!   VirtioDevice (device.rs)          -- reset / negotiate / queues / DRIVER_OK
//!     |-- LegacyPciTransport (transport.rs)
//!     |     +-- RegisterWindow        -- MMIO or I/O-port register access
//!     |-- VirtQueue (queue.rs)        -- split virtqueue, one per queue index
//!     |     +-- VirtqLayout (layout.rs)
//!     +-- InterruptBridge (irq.rs)    -- ISR / MSI-X vector -> queue drain
//! ```
//!
//! The host operating system supplies the mapped register window, physically
//! contiguous DMA memory ([`dma::DmaAllocator`]) and interrupt delivery. The
//! command layer above builds descriptor chains out of [`queue::Segment`]s
//! and receives completions through [`irq::CompletionHandler`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod irq;
pub mod layout;
pub mod queue;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{DriverConfig, QueueRequest};
pub use device::{DeviceState, VirtioDevice};
pub use dma::{DmaAllocator, DmaRegion};
pub use error::{ErrorKind, VirtioError, VirtioResult};
pub use irq::{CompletionHandler, InterruptBridge, InterruptSource, IrqOutcome};
pub use layout::VirtqLayout;
pub use queue::{Segment, SharedQueue, VirtQueue};
pub use transport::{DeviceStatus, Features, LegacyPciTransport, QueueNotifier, RegisterWindow};

/// Page size used for ring alignment and the queue PFN register.
pub const PAGE_SIZE: usize = 4096;

/// Shift applied to a ring's physical address before it is written to the
/// queue PFN register.
pub const PAGE_SHIFT: u32 = 12;

/// Largest queue depth the split ring format allows.
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Virtio vendor ID (Red Hat, Inc.)
pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;
