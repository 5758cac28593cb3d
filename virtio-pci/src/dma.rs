//! DMA memory handed to the device
//!
//! The host operating system owns physical memory. This module only defines
//! the region type the virtqueues are built on and the allocator interface
//! the lifecycle controller calls to obtain and return ring memory.

use core::ptr::NonNull;

use crate::PAGE_SIZE;

/// A physically contiguous, pinned memory region visible to the device.
///
/// The region is mapped at `virt` in the driver's address space and at
/// `phys` in the device's. It is not freed on drop; it goes back to the
/// [`DmaAllocator`] it came from.
#[derive(Debug)]
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: u64,
    len: usize,
}

impl DmaRegion {
    /// Wrap an allocated region.
    ///
    /// # Safety
    ///
    /// `virt` must be valid for reads and writes of `len` bytes for as long
    /// as the returned value exists, must not be aliased by any other Rust
    /// reference, and must map the physical range starting at `phys`.
    pub unsafe fn new(virt: NonNull<u8>, phys: u64, len: usize) -> Self {
        Self { virt, phys, len }
    }

    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the physical base sits on a page boundary.
    pub fn is_page_aligned(&self) -> bool {
        self.phys % PAGE_SIZE as u64 == 0
    }

    /// Fill the region with zeroes.
    pub fn zero(&mut self) {
        // SAFETY: `virt` is valid for `len` bytes of writes and exclusively
        // owned by this region (constructor contract).
        unsafe {
            core::ptr::write_bytes(self.virt.as_ptr(), 0, self.len);
        }
    }
}

// SAFETY: DmaRegion is a unique handle to memory nobody else references (see
// `DmaRegion::new`). Moving it between threads moves that ownership.
unsafe impl Send for DmaRegion {}

/// Physical memory services provided by the host operating system.
pub trait DmaAllocator {
    /// Allocate `size` bytes of page-aligned, physically contiguous memory.
    ///
    /// Returns `None` if no such range is available. The contents are
    /// unspecified; callers zero the region themselves.
    fn allocate_contiguous(&self, size: usize) -> Option<DmaRegion>;

    /// Give a region back to the allocator.
    ///
    /// # Safety
    ///
    /// `region` must have been returned by `allocate_contiguous` on this
    /// allocator, and the device must no longer be able to access it.
    unsafe fn release(&self, region: DmaRegion);

    /// Translate a driver-visible address into the address the device uses.
    fn virt_to_phys(&self, virt: *const u8) -> u64;
}
