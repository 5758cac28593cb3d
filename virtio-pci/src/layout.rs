//! Split virtqueue memory layout
//!
//! A legacy virtqueue occupies one physically contiguous region:
//!
//! ```text
//!   +------------------+  0
//!   | descriptor table |  16 * size
//!   +------------------+
//!   | available ring   |  2 * (3 + size)   flags, idx, ring[size], used_event
//!   +------------------+
//!   | padding          |  up to the next page boundary
//!   +------------------+  used_offset (page aligned)
//!   | used ring        |  2 * 3 + 8 * size flags, idx, ring[size], avail_event
//!   +------------------+  total_size
//! ```
//!
//! The device derives the same offsets from the queue size and the page
//! frame number alone, so this must match `vring_size(size, 4096)` exactly.

use crate::{error::VirtioError, MAX_QUEUE_SIZE, PAGE_SIZE};

/// Size of one descriptor table entry.
pub const DESC_SIZE: usize = 16;

/// Size of one used ring element (`id: u32`, `len: u32`).
pub const USED_ELEM_SIZE: usize = 8;

/// Byte offsets and sizes of the three parts of a virtqueue region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtqLayout {
    size: u16,
    avail_offset: usize,
    avail_size: usize,
    used_offset: usize,
    used_size: usize,
}

impl VirtqLayout {
    /// Compute the layout for a queue of `size` entries.
    ///
    /// `size` must already have passed [`validate_queue_size`].
    pub const fn new(size: u16) -> Self {
        let n = size as usize;
        let desc_size = DESC_SIZE * n;
        let avail_size = 2 * (3 + n);
        let used_offset = align_up(desc_size + avail_size, PAGE_SIZE);
        let used_size = 2 * 3 + USED_ELEM_SIZE * n;

        Self {
            size,
            avail_offset: desc_size,
            avail_size,
            used_offset,
            used_size,
        }
    }

    /// Number of entries in the queue.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Offset of the descriptor table (always zero).
    pub fn desc_offset(&self) -> usize {
        0
    }

    /// Size of the descriptor table in bytes.
    pub fn desc_size(&self) -> usize {
        self.avail_offset
    }

    /// Offset of the available ring, right after the descriptor table.
    pub fn avail_offset(&self) -> usize {
        self.avail_offset
    }

    /// Size of the available ring in bytes.
    pub fn avail_size(&self) -> usize {
        self.avail_size
    }

    /// Offset of the used ring, rounded up to a page boundary.
    pub fn used_offset(&self) -> usize {
        self.used_offset
    }

    /// Size of the used ring in bytes.
    pub fn used_size(&self) -> usize {
        self.used_size
    }

    /// Total number of bytes the region must provide.
    pub fn total_size(&self) -> usize {
        self.used_offset + self.used_size
    }

    /// Number of pages needed to back the region.
    pub fn num_pages(&self) -> usize {
        self.total_size().div_ceil(PAGE_SIZE)
    }
}

/// Check a device-reported queue size.
///
/// Zero means the queue does not exist, and is rejected here as well; callers
/// enumerating queues test for zero before calling this.
pub fn validate_queue_size(index: u16, size: u16) -> Result<(), VirtioError> {
    if size == 0 || !size.is_power_of_two() || size > MAX_QUEUE_SIZE {
        return Err(VirtioError::InvalidQueueSize { index, size });
    }
    Ok(())
}

/// Align `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
