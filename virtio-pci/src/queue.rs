//! Virtqueue implementation
//!
//! Implements the split virtqueue used by legacy virtio devices. A virtqueue
//! lives in one physically contiguous [`DmaRegion`] laid out by
//! [`VirtqLayout`]:
//!
//! 1. **Descriptor table** -- array of [`Descriptor`] entries describing data
//!    buffers
//! 2. **Available ring** -- driver-to-device: ring of descriptor chain heads
//! 3. **Used ring** -- device-to-driver: ring of completed descriptor chain
//!    heads, page aligned
//!
//! The device reads and writes the region concurrently with the driver, so
//! the two ring indices are only touched through atomic accessors: the
//! available index is stored with Release after the descriptors and ring slot
//! it publishes, and the used index is loaded with Acquire before the used
//! entries it covers are read.
//!
//! Everything the device must not be trusted with (free list links, chain
//! layout, the caller's cookies) is kept in driver-private memory.

use alloc::{sync::Arc, vec, vec::Vec};
use core::{
    iter::FusedIterator,
    ptr::NonNull,
    sync::atomic::{fence, AtomicU16, Ordering},
};

use bitflags::bitflags;
use spin::Mutex;

use crate::{
    dma::{DmaAllocator, DmaRegion},
    error::{VirtioError, VirtioResult},
    layout::{validate_queue_size, VirtqLayout, DESC_SIZE, USED_ELEM_SIZE},
    transport::QueueNotifier,
    PAGE_SHIFT, PAGE_SIZE,
};

bitflags! {
    /// Descriptor flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Buffer continues via the `next` field
        const NEXT = 1;
        /// Buffer is device-writable (device writes, driver reads)
        const WRITE = 2;
        /// Buffer contains a list of buffer descriptors
        const INDIRECT = 4;
    }
}

bitflags! {
    /// Available ring flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AvailFlags: u16 {
        /// Ask the device not to interrupt when it consumes buffers
        const NO_INTERRUPT = 1;
    }
}

bitflags! {
    /// Used ring flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsedFlags: u16 {
        /// The device does not need to be notified of new buffers
        const NO_NOTIFY = 1;
    }
}

/// Virtqueue descriptor table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Physical address of the buffer
    pub addr: u64,
    /// Length of the buffer in bytes
    pub len: u32,
    /// [`DescFlags`] bits
    pub flags: u16,
    /// Index of the next descriptor in the chain (valid if NEXT is set)
    pub next: u16,
}

/// Element in the used ring, returned by the device after processing.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsedElem {
    /// Head of the completed descriptor chain
    pub id: u32,
    /// Total bytes the device wrote into the chain's buffers
    pub len: u32,
}

const _: () = assert!(core::mem::size_of::<Descriptor>() == DESC_SIZE);
const _: () = assert!(core::mem::size_of::<UsedElem>() == USED_ELEM_SIZE);

/// One buffer of a descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Physical address of the buffer
    pub addr: u64,
    /// Length of the buffer in bytes
    pub len: u32,
    /// Whether the device writes into this buffer
    pub device_writable: bool,
}

impl Segment {
    /// A buffer the device only reads.
    pub fn readable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            device_writable: false,
        }
    }

    /// A buffer the device fills in.
    pub fn writable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            device_writable: true,
        }
    }

    /// Describe a driver buffer the device will read.
    ///
    /// The buffer must be DMA-capable memory that stays pinned until the
    /// chain it is part of has been reclaimed.
    pub fn from_buffer<D: DmaAllocator + ?Sized>(dma: &D, buf: &[u8]) -> VirtioResult<Self> {
        let len = descriptor_len(buf.len())?;
        Ok(Self::readable(dma.virt_to_phys(buf.as_ptr()), len))
    }

    /// Describe a driver buffer the device will write into.
    pub fn from_buffer_mut<D: DmaAllocator + ?Sized>(
        dma: &D,
        buf: &mut [u8],
    ) -> VirtioResult<Self> {
        let len = descriptor_len(buf.len())?;
        Ok(Self::writable(dma.virt_to_phys(buf.as_ptr()), len))
    }
}

/// Descriptor lengths are 32 bits wide.
fn descriptor_len(len: usize) -> VirtioResult<u32> {
    u32::try_from(len).map_err(|_| VirtioError::BufferTooLarge { len })
}

/// A virtqueue shared between a submission path and a completion path.
///
/// The interrupt path only ever try-locks it. A queue found locked is drained
/// by the next [`InterruptBridge::poll`](crate::irq::InterruptBridge::poll),
/// so submitters should check
/// [`needs_poll`](crate::irq::InterruptBridge::needs_poll) after releasing
/// the lock.
pub type SharedQueue<T> = Mutex<VirtQueue<T>>;

/// Returned by [`VirtQueue::new`] when the region cannot back the queue.
///
/// The region is handed back so the caller can return it to its allocator.
#[derive(Debug)]
pub struct RejectedRegion {
    pub error: VirtioError,
    pub region: DmaRegion,
}

/// A split virtqueue.
///
/// `T` is the cookie the submitter attaches to each chain; it comes back
/// unchanged when the device completes the chain.
pub struct VirtQueue<T> {
    /// Queue index on the device
    index: u16,

    /// Number of entries (descriptors) in this queue
    size: u16,

    layout: VirtqLayout,
    region: DmaRegion,

    /// Start of the region in the driver's address space
    base: NonNull<u8>,

    /// Trusted copy of the descriptor table; also carries the free list
    shadow: Vec<Descriptor>,

    /// Caller context per chain head
    cookies: Vec<Option<T>>,

    /// Head of the free descriptor list
    free_head: u16,

    /// Number of free descriptors remaining
    num_free: u16,

    /// Number of chains owned by the device
    in_flight: u16,

    /// Our copy of the published available index
    avail_idx: u16,

    /// Last used ring index consumed by the driver
    last_used_idx: u16,

    notifier: Arc<dyn QueueNotifier>,
}

impl<T> VirtQueue<T> {
    /// Build a virtqueue over a zeroed region.
    ///
    /// `size` is the queue size the device reported for `index`. The region
    /// must be page aligned and at least [`VirtqLayout::total_size`] bytes.
    pub fn new(
        index: u16,
        size: u16,
        region: DmaRegion,
        notifier: Arc<dyn QueueNotifier>,
    ) -> Result<Self, RejectedRegion> {
        let layout = match Self::check_region(index, size, &region) {
            Ok(layout) => layout,
            Err(error) => return Err(RejectedRegion { error, region }),
        };

        let base = region.virt();

        // Initialize the free descriptor chain: each descriptor's `next` field
        // points to the subsequent descriptor.
        let mut shadow = vec![Descriptor::default(); size as usize];
        for (i, desc) in shadow.iter_mut().enumerate().take(size as usize - 1) {
            desc.next = i as u16 + 1;
        }

        let mut cookies = Vec::with_capacity(size as usize);
        cookies.resize_with(size as usize, || None);

        let queue = Self {
            index,
            size,
            layout,
            region,
            base,
            shadow,
            cookies,
            free_head: 0,
            num_free: size,
            in_flight: 0,
            avail_idx: 0,
            last_used_idx: 0,
            notifier,
        };

        for i in 0..size {
            queue.write_desc(i, queue.shadow[i as usize]);
        }
        queue.avail_flags().store(0, Ordering::Relaxed);
        queue.avail_idx_ref().store(0, Ordering::Relaxed);
        queue.used_flags().store(0, Ordering::Relaxed);
        queue.used_idx().store(0, Ordering::Release);

        Ok(queue)
    }

    /// Check that `region` can back a queue of `size` entries.
    pub fn check_region(index: u16, size: u16, region: &DmaRegion) -> VirtioResult<VirtqLayout> {
        validate_queue_size(index, size)?;

        let layout = VirtqLayout::new(size);
        if region.len() < layout.total_size() {
            return Err(VirtioError::RegionTooSmall {
                required: layout.total_size(),
                provided: region.len(),
            });
        }
        if !region.is_page_aligned() || region.virt().as_ptr() as usize % PAGE_SIZE != 0 {
            return Err(VirtioError::MisalignedRegion {
                phys: region.phys(),
            });
        }
        if region.phys() >> PAGE_SHIFT > u32::MAX as u64 {
            return Err(VirtioError::RegionUnreachable {
                phys: region.phys(),
            });
        }
        Ok(layout)
    }

    /// Queue index on the device.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Get the queue size.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Offsets of the three ring parts inside the region.
    pub fn layout(&self) -> &VirtqLayout {
        &self.layout
    }

    /// Ring memory shared with the device.
    pub fn region(&self) -> &DmaRegion {
        &self.region
    }

    /// Page frame number for the queue PFN register.
    pub fn pfn(&self) -> u32 {
        (self.region.phys() >> PAGE_SHIFT) as u32
    }

    /// Number of free descriptors.
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Number of submitted chains not yet reclaimed.
    pub fn outstanding(&self) -> u16 {
        self.in_flight
    }

    /// Number of descriptors held by outstanding chains.
    pub fn descriptors_in_use(&self) -> u16 {
        self.size - self.num_free
    }

    /// Give up the queue and return its ring memory.
    ///
    /// The queue must already be deactivated on the device. Cookies of chains
    /// that were never reclaimed are dropped.
    pub fn into_region(self) -> DmaRegion {
        self.region
    }

    /// Publish a descriptor chain to the device.
    ///
    /// Takes one descriptor per segment, links them in order and makes the
    /// chain head available. Returns whether the device asked to be
    /// notified; the caller kicks with [`notify`](Self::notify), possibly
    /// after batching several submissions.
    ///
    /// Fails with `OutOfDescriptors` without touching the queue when fewer
    /// than `segments.len()` descriptors are free.
    pub fn submit_chain(&mut self, segments: &[Segment], cookie: T) -> VirtioResult<bool> {
        if segments.is_empty() {
            return Err(VirtioError::EmptyChain);
        }
        if segments.len() > self.num_free as usize {
            return Err(VirtioError::OutOfDescriptors {
                requested: segments.len(),
                available: self.num_free,
            });
        }

        let head = self.free_head;
        let mut idx = head;
        for (i, segment) in segments.iter().enumerate() {
            let next_free = self.shadow[idx as usize].next;
            let last = i + 1 == segments.len();

            let mut flags = DescFlags::empty();
            if segment.device_writable {
                flags |= DescFlags::WRITE;
            }
            if !last {
                flags |= DescFlags::NEXT;
            }

            let desc = Descriptor {
                addr: segment.addr,
                len: segment.len,
                flags: flags.bits(),
                next: if last { 0 } else { next_free },
            };
            self.shadow[idx as usize] = desc;
            self.write_desc(idx, desc);
            idx = next_free;
        }
        self.free_head = idx;
        self.num_free -= segments.len() as u16;

        Ok(self.publish(head, cookie))
    }

    /// Publish a chain described by an indirect descriptor table.
    ///
    /// `table_addr` is the physical address of `entries` descriptors the
    /// caller has laid out. Only one ring descriptor is consumed. The device
    /// must have offered `Features::RING_INDIRECT_DESC`.
    pub fn submit_indirect(&mut self, table_addr: u64, entries: u16, cookie: T) -> VirtioResult<bool> {
        if entries == 0 {
            return Err(VirtioError::EmptyChain);
        }
        if self.num_free == 0 {
            return Err(VirtioError::OutOfDescriptors {
                requested: 1,
                available: 0,
            });
        }

        let head = self.free_head;
        let desc = Descriptor {
            addr: table_addr,
            len: entries as u32 * DESC_SIZE as u32,
            flags: DescFlags::INDIRECT.bits(),
            next: 0,
        };
        self.free_head = self.shadow[head as usize].next;
        self.shadow[head as usize] = desc;
        self.write_desc(head, desc);
        self.num_free -= 1;

        Ok(self.publish(head, cookie))
    }

    /// Kick the device for this queue.
    pub fn notify(&self) {
        self.notifier.notify(self.index);
    }

    /// Whether the device has returned chains the driver has not reclaimed.
    pub fn has_pending(&self) -> bool {
        self.used_idx().load(Ordering::Acquire) != self.last_used_idx
    }

    /// Drain the chains the device has completed so far.
    ///
    /// The returned iterator yields `(cookie, bytes_written)` in the order
    /// the device completed the chains. It stops at the used index observed
    /// when this is called; entries it does not reach (because it was dropped
    /// early) are returned by the next call.
    pub fn reclaim(&mut self) -> Reclaim<'_, T> {
        let end = self.used_idx().load(Ordering::Acquire);
        Reclaim {
            queue: self,
            end,
            done: false,
        }
    }

    /// Ask the device to stop (or resume) interrupting for this queue.
    ///
    /// While suppressed the completion path must poll.
    pub fn set_interrupts_suppressed(&mut self, suppressed: bool) {
        let flags = if suppressed {
            AvailFlags::NO_INTERRUPT
        } else {
            AvailFlags::empty()
        };
        self.avail_flags().store(flags.bits(), Ordering::Release);
    }

    /// Whether NO_INTERRUPT is currently set in the available ring.
    pub fn interrupts_suppressed(&self) -> bool {
        AvailFlags::from_bits_truncate(self.avail_flags().load(Ordering::Relaxed))
            .contains(AvailFlags::NO_INTERRUPT)
    }

    /// Put `head` in the next available slot and advance the available index.
    fn publish(&mut self, head: u16, cookie: T) -> bool {
        debug_assert!(self.cookies[head as usize].is_none());
        self.cookies[head as usize] = Some(cookie);
        self.in_flight += 1;

        let slot = self.avail_idx & (self.size - 1);
        // SAFETY: slot < size, so the pointer stays inside the available ring.
        unsafe {
            core::ptr::write_volatile(self.avail_slot(slot), head);
        }

        // The descriptor writes and the ring slot above must be visible to the
        // device before the new index.
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.avail_idx_ref().store(self.avail_idx, Ordering::Release);

        // Order the index store before the NO_NOTIFY load.
        fence(Ordering::SeqCst);
        let flags = UsedFlags::from_bits_truncate(self.used_flags().load(Ordering::Acquire));
        !flags.contains(UsedFlags::NO_NOTIFY)
    }

    /// Consume the used entry at `last_used_idx`.
    fn pop_used(&mut self, end: u16) -> VirtioResult<(T, u32)> {
        let pending = end.wrapping_sub(self.last_used_idx);
        if pending > self.in_flight {
            return Err(VirtioError::UsedRingOverrun {
                queue: self.index,
                pending,
            });
        }

        let slot = self.last_used_idx & (self.size - 1);
        // SAFETY: slot < size, so the element lies inside the used ring. The
        // Acquire load of the used index in `reclaim` happened before this read.
        let elem = unsafe { core::ptr::read_volatile(self.used_slot(slot)) };

        let invalid = VirtioError::InvalidUsedEntry {
            queue: self.index,
            id: elem.id,
        };
        if elem.id >= self.size as u32 {
            return Err(invalid);
        }
        let head = elem.id as u16;
        let cookie = self.cookies[head as usize].take().ok_or(invalid)?;

        self.free_chain(head);
        self.in_flight -= 1;
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        Ok((cookie, elem.len))
    }

    /// Free a chain of descriptors linked via NEXT flags, starting at `head`.
    fn free_chain(&mut self, head: u16) {
        let mut idx = head;
        loop {
            let desc = self.shadow[idx as usize];
            self.free_desc(idx);
            if !DescFlags::from_bits_truncate(desc.flags).contains(DescFlags::NEXT) {
                break;
            }
            idx = desc.next;
        }
    }

    /// Return a descriptor to the free list.
    fn free_desc(&mut self, idx: u16) {
        debug_assert!(idx < self.size);
        let desc = Descriptor {
            next: self.free_head,
            ..Descriptor::default()
        };
        self.shadow[idx as usize] = desc;
        self.write_desc(idx, desc);
        self.free_head = idx;
        self.num_free += 1;
    }

    // ---- Shared memory accessors ----

    fn write_desc(&self, idx: u16, desc: Descriptor) {
        debug_assert!(idx < self.size);
        // SAFETY: idx < size and the descriptor table starts at the (page
        // aligned) base of a region checked to hold the full layout.
        unsafe {
            core::ptr::write_volatile(self.base.as_ptr().cast::<Descriptor>().add(idx as usize), desc);
        }
    }

    fn atomic_at(&self, offset: usize) -> &AtomicU16 {
        debug_assert!(offset % 2 == 0 && offset + 2 <= self.layout.total_size());
        // SAFETY: offset is one of the 2-byte aligned index/flag fields inside
        // the region, which lives as long as `self`. The device accesses it
        // concurrently, hence the atomic view.
        unsafe { &*self.base.as_ptr().add(offset).cast::<AtomicU16>() }
    }

    fn avail_flags(&self) -> &AtomicU16 {
        self.atomic_at(self.layout.avail_offset())
    }

    fn avail_idx_ref(&self) -> &AtomicU16 {
        self.atomic_at(self.layout.avail_offset() + 2)
    }

    fn avail_slot(&self, slot: u16) -> *mut u16 {
        let offset = self.layout.avail_offset() + 4 + 2 * slot as usize;
        // SAFETY: slot < size keeps the offset inside the available ring.
        unsafe { self.base.as_ptr().add(offset).cast() }
    }

    fn used_flags(&self) -> &AtomicU16 {
        self.atomic_at(self.layout.used_offset())
    }

    fn used_idx(&self) -> &AtomicU16 {
        self.atomic_at(self.layout.used_offset() + 2)
    }

    fn used_slot(&self, slot: u16) -> *const UsedElem {
        let offset = self.layout.used_offset() + 4 + USED_ELEM_SIZE * slot as usize;
        // SAFETY: slot < size keeps the offset inside the used ring.
        unsafe { self.base.as_ptr().add(offset).cast() }
    }
}

// SAFETY: The raw pointer refers to the queue's own DmaRegion, which moves
// with it. Cookies are only sent along if T is Send. Shared access goes
// through `SharedQueue`, a Mutex.
unsafe impl<T: Send> Send for VirtQueue<T> {}

/// Iterator returned by [`VirtQueue::reclaim`].
///
/// Yields an error at most once, then stops; a bad used entry is a protocol
/// violation the caller escalates.
pub struct Reclaim<'a, T> {
    queue: &'a mut VirtQueue<T>,
    end: u16,
    done: bool,
}

impl<T> Iterator for Reclaim<'_, T> {
    type Item = VirtioResult<(T, u32)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.queue.last_used_idx == self.end {
            return None;
        }
        match self.queue.pop_used(self.end) {
            Ok(completion) => Some(Ok(completion)),
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        let pending = self.end.wrapping_sub(self.queue.last_used_idx) as usize;
        (0, Some(pending))
    }
}

impl<T> FusedIterator for Reclaim<'_, T> {}
