//! Test doubles for the transport, DMA and device side of a virtqueue

use alloc::{sync::Arc, vec, vec::Vec};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU16, AtomicUsize, Ordering},
};
use std::alloc::{alloc_zeroed, dealloc, Layout};

use spin::Mutex;

use crate::{
    dma::{DmaAllocator, DmaRegion},
    layout::VirtqLayout,
    queue::{DescFlags, Descriptor, UsedElem, VirtQueue},
    transport::{regs, IsrStatus, QueueNotifier, RegisterWindow, VIRTIO_MSI_NO_VECTOR},
    PAGE_SIZE,
};

// ---------------------------------------------------------------------------
// DMA
// ---------------------------------------------------------------------------

const PHYS_MASK: u64 = (1 << 40) - 1;

/// Page-aligned heap memory standing in for physical memory.
///
/// Physical addresses are the heap address truncated to 40 bits so every
/// region is reachable through the 32-bit PFN register. Nothing in the unit
/// tests translates them back.
#[derive(Default)]
pub struct HeapDma {
    live: AtomicUsize,
    limit: Option<usize>,
}

impl HeapDma {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that fails once `limit` regions are outstanding.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            live: AtomicUsize::new(0),
            limit: Some(limit),
        }
    }

    /// Regions allocated and not yet released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size.max(1), PAGE_SIZE).unwrap()
    }
}

impl DmaAllocator for HeapDma {
    fn allocate_contiguous(&self, size: usize) -> Option<DmaRegion> {
        if self.limit.is_some_and(|limit| self.live() >= limit) {
            return None;
        }
        // SAFETY: the layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(Self::layout(size)) })?;
        self.live.fetch_add(1, Ordering::SeqCst);
        // SAFETY: freshly allocated, exclusively owned, `size` bytes long.
        Some(unsafe { DmaRegion::new(ptr, self.virt_to_phys(ptr.as_ptr()), size) })
    }

    unsafe fn release(&self, region: DmaRegion) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        // SAFETY: the region came from `allocate_contiguous` with this layout.
        unsafe { dealloc(region.virt().as_ptr(), Self::layout(region.len())) }
    }

    fn virt_to_phys(&self, virt: *const u8) -> u64 {
        virt as u64 & PHYS_MASK
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    kicks: Mutex<Vec<u16>>,
}

impl RecordingNotifier {
    pub fn kicks(&self) -> Vec<u16> {
        self.kicks.lock().clone()
    }
}

impl QueueNotifier for RecordingNotifier {
    fn notify(&self, queue_index: u16) {
        self.kicks.lock().push(queue_index);
    }
}

// ---------------------------------------------------------------------------
// Register file
// ---------------------------------------------------------------------------

struct FakeState {
    host_features: u32,
    guest_features: u32,
    queue_sizes: Vec<u16>,
    pfns: Vec<u32>,
    queue_vectors: Vec<u16>,
    selected: u16,
    status: u8,
    status_writes: Vec<u8>,
    isr: u8,
    msix_vectors: Option<u16>,
    config_vector: u16,
    config: Vec<u8>,
    notifications: Vec<u16>,
    removed: bool,
}

impl FakeState {
    fn config_base(&self) -> u16 {
        if self.msix_vectors.is_some() {
            regs::DEVICE_CONFIG_MSIX
        } else {
            regs::DEVICE_CONFIG
        }
    }

    fn selected(&self) -> usize {
        self.selected as usize
    }

    fn assign(&self, vector: u16) -> u16 {
        match self.msix_vectors {
            Some(count) if vector < count => vector,
            _ => VIRTIO_MSI_NO_VECTOR,
        }
    }

    fn config_byte(&self, offset: u16) -> u8 {
        let base = self.config_base();
        offset
            .checked_sub(base)
            .and_then(|i| self.config.get(i as usize).copied())
            .unwrap_or(0)
    }
}

/// Register-level model of a legacy virtio-PCI device.
#[derive(Clone)]
pub struct FakeRegisters {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRegisters {
    pub fn new(host_features: u32, queue_sizes: &[u16]) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                host_features,
                guest_features: 0,
                queue_sizes: queue_sizes.to_vec(),
                pfns: vec![0; queue_sizes.len()],
                queue_vectors: vec![VIRTIO_MSI_NO_VECTOR; queue_sizes.len()],
                selected: 0,
                status: 0,
                status_writes: Vec::new(),
                isr: 0,
                msix_vectors: None,
                config_vector: VIRTIO_MSI_NO_VECTOR,
                config: Vec::new(),
                notifications: Vec::new(),
                removed: false,
            })),
        }
    }

    /// Enable MSI-X with `count` usable vectors.
    pub fn set_msix_vectors(&self, count: u16) {
        self.state.lock().msix_vectors = Some(count);
    }

    pub fn set_config(&self, bytes: &[u8]) {
        self.state.lock().config = bytes.to_vec();
    }

    pub fn raise_isr(&self, isr: IsrStatus) {
        self.state.lock().isr |= isr.bits();
    }

    /// Make every read return all ones, like a surprise-removed device.
    pub fn remove(&self) {
        self.state.lock().removed = true;
    }

    pub fn status_writes(&self) -> Vec<u8> {
        self.state.lock().status_writes.clone()
    }

    pub fn status(&self) -> u8 {
        self.state.lock().status
    }

    pub fn guest_features(&self) -> u32 {
        self.state.lock().guest_features
    }

    pub fn queue_pfn(&self, index: usize) -> u32 {
        self.state.lock().pfns[index]
    }

    pub fn queue_vector(&self, index: usize) -> u16 {
        self.state.lock().queue_vectors[index]
    }

    pub fn notifications(&self) -> Vec<u16> {
        self.state.lock().notifications.clone()
    }
}

impl RegisterWindow for FakeRegisters {
    fn read8(&self, offset: u16) -> u8 {
        let mut s = self.state.lock();
        if s.removed {
            return u8::MAX;
        }
        match offset {
            regs::DEVICE_STATUS => s.status,
            regs::ISR_STATUS => core::mem::take(&mut s.isr),
            _ => s.config_byte(offset),
        }
    }

    fn read16(&self, offset: u16) -> u16 {
        let s = self.state.lock();
        if s.removed {
            return u16::MAX;
        }
        let sel = s.selected();
        match offset {
            regs::QUEUE_SIZE => s.queue_sizes.get(sel).copied().unwrap_or(0),
            regs::QUEUE_SELECT => s.selected,
            regs::MSIX_CONFIG_VECTOR if s.msix_vectors.is_some() => s.config_vector,
            regs::MSIX_QUEUE_VECTOR if s.msix_vectors.is_some() => s
                .queue_vectors
                .get(sel)
                .copied()
                .unwrap_or(VIRTIO_MSI_NO_VECTOR),
            _ => u16::from_le_bytes([s.config_byte(offset), s.config_byte(offset + 1)]),
        }
    }

    fn read32(&self, offset: u16) -> u32 {
        let s = self.state.lock();
        if s.removed {
            return u32::MAX;
        }
        match offset {
            regs::HOST_FEATURES => s.host_features,
            regs::GUEST_FEATURES => s.guest_features,
            regs::QUEUE_PFN => s.pfns.get(s.selected()).copied().unwrap_or(0),
            _ => u32::from_le_bytes([
                s.config_byte(offset),
                s.config_byte(offset + 1),
                s.config_byte(offset + 2),
                s.config_byte(offset + 3),
            ]),
        }
    }

    fn write8(&self, offset: u16, value: u8) {
        let mut s = self.state.lock();
        if offset == regs::DEVICE_STATUS {
            s.status_writes.push(value);
            s.status = value;
            if value == 0 {
                s.guest_features = 0;
                s.pfns.iter_mut().for_each(|pfn| *pfn = 0);
                s.queue_vectors
                    .iter_mut()
                    .for_each(|v| *v = VIRTIO_MSI_NO_VECTOR);
                s.config_vector = VIRTIO_MSI_NO_VECTOR;
                s.isr = 0;
            }
        }
    }

    fn write16(&self, offset: u16, value: u16) {
        let mut s = self.state.lock();
        match offset {
            regs::QUEUE_SELECT => s.selected = value,
            regs::QUEUE_NOTIFY => s.notifications.push(value),
            regs::MSIX_CONFIG_VECTOR if s.msix_vectors.is_some() => {
                s.config_vector = s.assign(value);
            }
            regs::MSIX_QUEUE_VECTOR if s.msix_vectors.is_some() => {
                let assigned = s.assign(value);
                let sel = s.selected();
                if let Some(slot) = s.queue_vectors.get_mut(sel) {
                    *slot = assigned;
                }
            }
            _ => {}
        }
    }

    fn write32(&self, offset: u16, value: u32) {
        let mut s = self.state.lock();
        match offset {
            regs::GUEST_FEATURES => s.guest_features = value,
            regs::QUEUE_PFN => {
                let sel = s.selected();
                if let Some(pfn) = s.pfns.get_mut(sel) {
                    *pfn = value;
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Device side of a ring
// ---------------------------------------------------------------------------

/// The device's view of a virtqueue region.
pub struct RingDevice {
    base: NonNull<u8>,
    layout: VirtqLayout,
    last_avail: u16,
    used_idx: u16,
}

// SAFETY: test-only; the region outlives the device view in every test.
unsafe impl Send for RingDevice {}

impl RingDevice {
    pub fn attach<T>(queue: &VirtQueue<T>) -> Self {
        Self {
            base: queue.region().virt(),
            layout: *queue.layout(),
            last_avail: 0,
            used_idx: 0,
        }
    }

    fn mask(&self) -> u16 {
        self.layout.size() - 1
    }

    fn atomic(&self, offset: usize) -> &AtomicU16 {
        // SAFETY: offset is an aligned index/flags field inside the region.
        unsafe { &*self.base.as_ptr().add(offset).cast::<AtomicU16>() }
    }

    pub fn avail_flags(&self) -> u16 {
        self.atomic(self.layout.avail_offset()).load(Ordering::Acquire)
    }

    pub fn avail_idx(&self) -> u16 {
        self.atomic(self.layout.avail_offset() + 2)
            .load(Ordering::Acquire)
    }

    pub fn used_idx(&self) -> u16 {
        self.atomic(self.layout.used_offset() + 2)
            .load(Ordering::Acquire)
    }

    /// Take the next chain head the driver made available.
    pub fn pop_avail(&mut self) -> Option<u16> {
        if self.avail_idx() == self.last_avail {
            return None;
        }
        let slot = (self.last_avail & self.mask()) as usize;
        let offset = self.layout.avail_offset() + 4 + 2 * slot;
        // SAFETY: slot < size, inside the available ring.
        let head = unsafe { core::ptr::read_volatile(self.base.as_ptr().add(offset).cast::<u16>()) };
        self.last_avail = self.last_avail.wrapping_add(1);
        Some(head)
    }

    pub fn read_desc(&self, idx: u16) -> Descriptor {
        // SAFETY: idx < size, inside the descriptor table.
        unsafe { core::ptr::read_volatile(self.base.as_ptr().cast::<Descriptor>().add(idx as usize)) }
    }

    /// Follow a chain from `head`.
    pub fn read_chain(&self, head: u16) -> Vec<Descriptor> {
        let mut chain = Vec::new();
        let mut idx = head;
        loop {
            let desc = self.read_desc(idx);
            chain.push(desc);
            if desc.flags & DescFlags::NEXT.bits() == 0 || chain.len() > self.layout.size() as usize {
                break;
            }
            idx = desc.next;
        }
        chain
    }

    /// Return chain `id` to the driver with `len` bytes written.
    pub fn push_used(&mut self, id: u16, len: u32) {
        let slot = (self.used_idx & self.mask()) as usize;
        let offset = self.layout.used_offset() + 4 + 8 * slot;
        let elem = UsedElem { id: id as u32, len };
        // SAFETY: slot < size, inside the used ring.
        unsafe { core::ptr::write_volatile(self.base.as_ptr().add(offset).cast::<UsedElem>(), elem) };
        self.used_idx = self.used_idx.wrapping_add(1);
        self.atomic(self.layout.used_offset() + 2)
            .store(self.used_idx, Ordering::Release);
    }

    pub fn set_no_notify(&self, no_notify: bool) {
        self.atomic(self.layout.used_offset())
            .store(no_notify as u16, Ordering::Release);
    }
}
