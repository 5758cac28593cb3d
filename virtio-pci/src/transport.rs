//! Legacy virtio-PCI transport
//!
//! The legacy (transitional) virtio-PCI interface exposes a small register
//! block at the start of BAR0:
//!
//! | Offset | Size | Name               |
//! |--------|------|--------------------|
//! | 0x00   | 4    | host_features      |
//! | 0x04   | 4    | guest_features     |
//! | 0x08   | 4    | queue_pfn          |
//! | 0x0C   | 2    | queue_size         |
//! | 0x0E   | 2    | queue_select       |
//! | 0x10   | 2    | queue_notify       |
//! | 0x12   | 1    | device_status      |
//! | 0x13   | 1    | isr_status         |
//! | 0x14   | 2    | msix_config_vector |
//! | 0x16   | 2    | msix_queue_vector  |
//! | 0x14+  | var  | device config      |
//!
//! The two MSI-X registers only exist while MSI-X is enabled on the PCI
//! function; device configuration starts at 0x18 in that case and at 0x14
//! otherwise.
//!
//! Queue size, PFN and vector registers act on whichever queue was last
//! written to `queue_select`. [`LegacyPciTransport`] never exposes the
//! selector on its own: every select-then-access pair runs under one lock.

use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use log::{debug, warn};
use spin::Mutex;

use crate::error::{VirtioError, VirtioResult};

/// Legacy virtio PCI register offsets
pub mod regs {
    /// Device features (read-only, 32-bit)
    pub const HOST_FEATURES: u16 = 0x00;
    /// Guest (driver) features (read/write, 32-bit)
    pub const GUEST_FEATURES: u16 = 0x04;
    /// Queue page frame number (32-bit)
    pub const QUEUE_PFN: u16 = 0x08;
    /// Queue size (number of entries, 16-bit, read-only)
    pub const QUEUE_SIZE: u16 = 0x0C;
    /// Queue select (16-bit)
    pub const QUEUE_SELECT: u16 = 0x0E;
    /// Queue notify (16-bit, value is the queue index)
    pub const QUEUE_NOTIFY: u16 = 0x10;
    /// Device status (8-bit)
    pub const DEVICE_STATUS: u16 = 0x12;
    /// ISR status (8-bit, read clears)
    pub const ISR_STATUS: u16 = 0x13;
    /// MSI-X vector for configuration changes (16-bit)
    pub const MSIX_CONFIG_VECTOR: u16 = 0x14;
    /// MSI-X vector for the selected queue (16-bit)
    pub const MSIX_QUEUE_VECTOR: u16 = 0x16;
    /// Device-specific configuration without MSI-X
    pub const DEVICE_CONFIG: u16 = 0x14;
    /// Device-specific configuration with MSI-X enabled
    pub const DEVICE_CONFIG_MSIX: u16 = 0x18;
}

/// Vector register read-back meaning "no vector assigned".
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xFFFF;

bitflags! {
    /// Device status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceStatus: u8 {
        /// Guest OS has found the device and recognized it as a valid virtio
        /// device.
        const ACKNOWLEDGE = 1;
        /// Guest OS knows how to drive the device.
        const DRIVER = 2;
        /// Driver is ready.
        const DRIVER_OK = 4;
        /// Feature negotiation is complete.
        const FEATURES_OK = 8;
        /// Device has hit an error and needs a reset.
        const DEVICE_NEEDS_RESET = 64;
        /// Driver has given up on the device.
        const FAILED = 128;
    }
}

bitflags! {
    /// ISR status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IsrStatus: u8 {
        /// At least one queue has new used buffers.
        const QUEUE = 1;
        /// Device configuration changed.
        const CONFIG = 2;
    }
}

bitflags! {
    /// Device-independent feature bits of the legacy interface.
    ///
    /// Bits 0..=23 are device specific and pass through unnamed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        const NOTIFY_ON_EMPTY = 1 << 24;
        const ANY_LAYOUT = 1 << 27;
        const RING_INDIRECT_DESC = 1 << 28;
        const RING_EVENT_IDX = 1 << 29;
        const BAD_FEATURE = 1 << 30;

        const _ = !0;
    }
}

/// Raw access to the device's register block.
///
/// Implementations only move bytes; they perform no sequencing of their own.
/// Offsets are relative to the start of the block.
pub trait RegisterWindow: Send + Sync {
    fn read8(&self, offset: u16) -> u8;
    fn read16(&self, offset: u16) -> u16;
    fn read32(&self, offset: u16) -> u32;
    fn write8(&self, offset: u16, value: u8);
    fn write16(&self, offset: u16, value: u16);
    fn write32(&self, offset: u16, value: u32);
}

/// Register block mapped into memory.
#[derive(Debug)]
pub struct MmioWindow {
    base: core::ptr::NonNull<u8>,
    len: usize,
}

impl MmioWindow {
    /// # Safety
    ///
    /// `base` must point to a device register block of at least `len` bytes
    /// that stays mapped (uncached) for the lifetime of the window.
    pub unsafe fn new(base: core::ptr::NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    fn reg<T>(&self, offset: u16) -> *mut T {
        debug_assert!(offset as usize + core::mem::size_of::<T>() <= self.len);
        // SAFETY: offset is within the mapped block (asserted above, and
        // guaranteed by the fixed register layout).
        unsafe { self.base.as_ptr().add(offset as usize).cast() }
    }
}

// SAFETY: MMIO registers are accessed with volatile operations only; the
// window holds no driver-side state.
unsafe impl Send for MmioWindow {}
// SAFETY: See above. Sequencing between callers is done by the transport.
unsafe impl Sync for MmioWindow {}

impl RegisterWindow for MmioWindow {
    fn read8(&self, offset: u16) -> u8 {
        // SAFETY: reg() yields a pointer into the mapped register block.
        unsafe { core::ptr::read_volatile(self.reg(offset)) }
    }

    fn read16(&self, offset: u16) -> u16 {
        // SAFETY: Same invariants as read8.
        unsafe { core::ptr::read_volatile(self.reg(offset)) }
    }

    fn read32(&self, offset: u16) -> u32 {
        // SAFETY: Same invariants as read8.
        unsafe { core::ptr::read_volatile(self.reg(offset)) }
    }

    fn write8(&self, offset: u16, value: u8) {
        // SAFETY: Same invariants as read8.
        unsafe { core::ptr::write_volatile(self.reg(offset), value) }
    }

    fn write16(&self, offset: u16, value: u16) {
        // SAFETY: Same invariants as read8.
        unsafe { core::ptr::write_volatile(self.reg(offset), value) }
    }

    fn write32(&self, offset: u16, value: u32) {
        // SAFETY: Same invariants as read8.
        unsafe { core::ptr::write_volatile(self.reg(offset), value) }
    }
}

/// Register block in x86 I/O port space (BAR0 of a legacy virtio device).
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
pub struct PortWindow {
    io_base: u16,
}

#[cfg(target_arch = "x86_64")]
impl PortWindow {
    /// # Safety
    ///
    /// `io_base` must be the I/O BAR of a virtio device and the caller must
    /// hold I/O privilege for that range.
    pub unsafe fn new(io_base: u16) -> Self {
        Self { io_base }
    }

    pub fn io_base(&self) -> u16 {
        self.io_base
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterWindow for PortWindow {
    fn read8(&self, offset: u16) -> u8 {
        let mut port = x86_64::instructions::port::Port::<u8>::new(self.io_base + offset);
        // SAFETY: io_base + offset lies in the device's I/O BAR (constructor
        // contract).
        unsafe { port.read() }
    }

    fn read16(&self, offset: u16) -> u16 {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.io_base + offset);
        // SAFETY: Same invariants as read8.
        unsafe { port.read() }
    }

    fn read32(&self, offset: u16) -> u32 {
        let mut port = x86_64::instructions::port::Port::<u32>::new(self.io_base + offset);
        // SAFETY: Same invariants as read8.
        unsafe { port.read() }
    }

    fn write8(&self, offset: u16, value: u8) {
        let mut port = x86_64::instructions::port::Port::<u8>::new(self.io_base + offset);
        // SAFETY: Same invariants as read8.
        unsafe { port.write(value) }
    }

    fn write16(&self, offset: u16, value: u16) {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.io_base + offset);
        // SAFETY: Same invariants as read8.
        unsafe { port.write(value) }
    }

    fn write32(&self, offset: u16, value: u32) {
        let mut port = x86_64::instructions::port::Port::<u32>::new(self.io_base + offset);
        // SAFETY: Same invariants as read8.
        unsafe { port.write(value) }
    }
}

/// Something that can kick a queue.
///
/// Virtqueues hold one of these so `VirtQueue::notify` does not need to know
/// about the transport type.
pub trait QueueNotifier: Send + Sync {
    fn notify(&self, queue_index: u16);
}

/// Driver-side shadow of what has been written to the device.
#[derive(Debug)]
struct RegState {
    status: DeviceStatus,
    accepted: Option<u32>,
}

/// Legacy virtio PCI transport handle.
pub struct LegacyPciTransport<W> {
    window: W,
    /// Held across every select-then-access sequence and every status or
    /// feature write.
    state: Mutex<RegState>,
    msix_enabled: AtomicBool,
}

impl<W: RegisterWindow> LegacyPciTransport<W> {
    pub fn new(window: W) -> Self {
        Self {
            window,
            state: Mutex::new(RegState {
                status: DeviceStatus::empty(),
                accepted: None,
            }),
            msix_enabled: AtomicBool::new(false),
        }
    }

    /// The underlying register window.
    pub fn window(&self) -> &W {
        &self.window
    }

    // ---- Features ----

    /// Read the device-offered feature bits.
    pub fn host_features(&self) -> VirtioResult<u32> {
        let features = self.read32(regs::HOST_FEATURES);
        if features == u32::MAX {
            return Err(VirtioError::DeviceRemoved);
        }
        Ok(features)
    }

    /// Check a single offered feature bit.
    pub fn has_host_feature(&self, bit: u32) -> VirtioResult<bool> {
        debug_assert!(bit < 32);
        Ok(self.host_features()? & (1 << bit) != 0)
    }

    /// Write the driver-accepted feature bits.
    ///
    /// The set must be a subset of what the device offers. After the first
    /// write it may only shrink until the device is reset, and it is frozen
    /// once FEATURES_OK has been set.
    pub fn write_guest_features(&self, features: u32) -> VirtioResult<()> {
        let offered = self.host_features()?;
        let mut state = self.state.lock();

        if state.status.contains(DeviceStatus::FEATURES_OK) {
            return Err(VirtioError::InvalidState {
                expected: "features not yet confirmed",
                actual: "FEATURES_OK set",
            });
        }
        if features & !offered != 0 {
            return Err(VirtioError::UnofferedFeatures {
                offered,
                requested: features,
            });
        }
        if let Some(accepted) = state.accepted {
            if features & !accepted != 0 {
                return Err(VirtioError::FeatureWidening {
                    accepted,
                    requested: features,
                });
            }
        }

        self.write32(regs::GUEST_FEATURES, features);
        state.accepted = Some(features);
        Ok(())
    }

    /// Features written by the driver since the last reset.
    pub fn accepted_features(&self) -> Option<u32> {
        self.state.lock().accepted
    }

    // ---- Status ----

    /// Read the device status register.
    pub fn status(&self) -> VirtioResult<DeviceStatus> {
        let raw = self.read8(regs::DEVICE_STATUS);
        if raw == u8::MAX {
            return Err(VirtioError::DeviceRemoved);
        }
        Ok(DeviceStatus::from_bits_retain(raw))
    }

    /// Reset the device by writing zero to the status register.
    ///
    /// This deactivates every queue on the device side. It does not wait for
    /// in-flight chains; callers quiesce first.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.write8(regs::DEVICE_STATUS, 0);
        state.status = DeviceStatus::empty();
        state.accepted = None;
    }

    /// OR one status bit into the device status.
    ///
    /// Bits must arrive in the order ACKNOWLEDGE, DRIVER, FEATURES_OK,
    /// DRIVER_OK, each exactly once. FAILED is accepted at any point.
    pub fn add_status(&self, bit: DeviceStatus) -> VirtioResult<()> {
        let mut state = self.state.lock();
        let current = state.status;

        if bit != DeviceStatus::FAILED && status_predecessors(bit) != Some(current) {
            return Err(VirtioError::StatusOrder {
                current: current.bits(),
                requested: bit.bits(),
            });
        }

        let next = current | bit;
        self.write8(regs::DEVICE_STATUS, next.bits());
        state.status = next;

        if self.read8(regs::DEVICE_STATUS) == u8::MAX {
            return Err(VirtioError::DeviceRemoved);
        }
        Ok(())
    }

    /// Mark the device as failed.
    pub fn set_failed(&self) -> VirtioResult<()> {
        self.add_status(DeviceStatus::FAILED)
    }

    // ---- Queues ----

    /// Read the size of queue `index`. Zero means the queue does not exist.
    pub fn queue_size(&self, index: u16) -> u16 {
        let _state = self.state.lock();
        self.write16(regs::QUEUE_SELECT, index);
        self.read16(regs::QUEUE_SIZE)
    }

    /// Read the page frame number currently programmed for queue `index`.
    pub fn queue_pfn(&self, index: u16) -> VirtioResult<u32> {
        let _state = self.state.lock();
        self.write16(regs::QUEUE_SELECT, index);
        self.read_pfn()
    }

    /// Hand the ring at page frame `pfn` to the device as queue `index`.
    pub fn activate_queue(&self, index: u16, pfn: u32) -> VirtioResult<()> {
        let _state = self.state.lock();
        self.write16(regs::QUEUE_SELECT, index);
        if self.read_pfn()? != 0 {
            return Err(VirtioError::QueueAlreadyActive { index });
        }
        self.write32(regs::QUEUE_PFN, pfn);
        debug!("[VIRTIO] queue {} activated at pfn {:#x}", index, pfn);
        Ok(())
    }

    /// PFN of the selected queue. The caller holds the state lock.
    fn read_pfn(&self) -> VirtioResult<u32> {
        let pfn = self.read32(regs::QUEUE_PFN);
        if pfn == u32::MAX {
            return Err(VirtioError::DeviceRemoved);
        }
        Ok(pfn)
    }

    /// Take queue `index` away from the device.
    pub fn deactivate_queue(&self, index: u16) {
        let _state = self.state.lock();
        self.write16(regs::QUEUE_SELECT, index);
        self.write32(regs::QUEUE_PFN, 0);
        debug!("[VIRTIO] queue {} deactivated", index);
    }

    /// Notify (kick) the device that queue `index` has new buffers.
    pub fn notify_queue(&self, index: u16) {
        self.write16(regs::QUEUE_NOTIFY, index);
    }

    /// Read and clear the ISR status register.
    pub fn read_isr(&self) -> VirtioResult<IsrStatus> {
        let raw = self.read8(regs::ISR_STATUS);
        if raw == u8::MAX {
            return Err(VirtioError::DeviceRemoved);
        }
        Ok(IsrStatus::from_bits_truncate(raw))
    }

    // ---- MSI-X ----

    /// Record whether MSI-X is enabled on the PCI function.
    ///
    /// This moves the device configuration window and makes the vector
    /// registers available.
    pub fn set_msix_enabled(&self, enabled: bool) {
        self.msix_enabled.store(enabled, Ordering::Release);
    }

    /// Whether MSI-X was recorded as enabled.
    pub fn msix_enabled(&self) -> bool {
        self.msix_enabled.load(Ordering::Acquire)
    }

    /// Route configuration change interrupts to `vector`.
    pub fn assign_config_vector(&self, vector: u16) -> VirtioResult<()> {
        self.require_msix()?;
        let _state = self.state.lock();
        self.write16(regs::MSIX_CONFIG_VECTOR, vector);
        if self.read16(regs::MSIX_CONFIG_VECTOR) == VIRTIO_MSI_NO_VECTOR {
            warn!("[VIRTIO] device refused config vector {}", vector);
            return Err(VirtioError::NoConfigVector { vector });
        }
        Ok(())
    }

    /// Route used-buffer interrupts of queue `index` to `vector`.
    pub fn assign_queue_vector(&self, index: u16, vector: u16) -> VirtioResult<()> {
        self.require_msix()?;
        let _state = self.state.lock();
        self.write16(regs::QUEUE_SELECT, index);
        self.write16(regs::MSIX_QUEUE_VECTOR, vector);
        if self.read16(regs::MSIX_QUEUE_VECTOR) == VIRTIO_MSI_NO_VECTOR {
            warn!("[VIRTIO] device refused vector {} for queue {}", vector, index);
            return Err(VirtioError::NoQueueVector { index, vector });
        }
        Ok(())
    }

    fn require_msix(&self) -> VirtioResult<()> {
        if !self.msix_enabled() {
            return Err(VirtioError::InvalidState {
                expected: "MSI-X enabled",
                actual: "MSI-X disabled",
            });
        }
        Ok(())
    }

    // ---- Device configuration ----

    /// Offset of the device-specific configuration window.
    pub fn config_base(&self) -> u16 {
        if self.msix_enabled() {
            regs::DEVICE_CONFIG_MSIX
        } else {
            regs::DEVICE_CONFIG
        }
    }

    /// Copy `buf.len()` bytes of device configuration starting at `offset`.
    ///
    /// The whole range must fit in the 16-bit register window; nothing is
    /// read otherwise.
    pub fn read_device_config(&self, offset: u16, buf: &mut [u8]) -> VirtioResult<()> {
        let out_of_range = VirtioError::ConfigOutOfRange {
            offset,
            len: buf.len(),
        };
        let start = self.config_base().checked_add(offset).ok_or(out_of_range)?;
        if usize::from(start) + buf.len() > usize::from(u16::MAX) + 1 {
            return Err(out_of_range);
        }
        for (byte, reg) in buf.iter_mut().zip(start..=u16::MAX) {
            *byte = self.read8(reg);
        }
        Ok(())
    }

    /// Read a little-endian 64-bit field of the device configuration.
    pub fn read_device_config_u64(&self, offset: u16) -> VirtioResult<u64> {
        let mut bytes = [0u8; 8];
        self.read_device_config(offset, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    // ---- Low-level helpers ----

    fn read8(&self, offset: u16) -> u8 {
        let value = self.window.read8(offset);
        #[cfg(feature = "trace-registers")]
        log::trace!("[VIRTIO] r8  {:#04x} -> {:#04x}", offset, value);
        value
    }

    fn read16(&self, offset: u16) -> u16 {
        let value = self.window.read16(offset);
        #[cfg(feature = "trace-registers")]
        log::trace!("[VIRTIO] r16 {:#04x} -> {:#06x}", offset, value);
        value
    }

    fn read32(&self, offset: u16) -> u32 {
        let value = self.window.read32(offset);
        #[cfg(feature = "trace-registers")]
        log::trace!("[VIRTIO] r32 {:#04x} -> {:#010x}", offset, value);
        value
    }

    fn write8(&self, offset: u16, value: u8) {
        #[cfg(feature = "trace-registers")]
        log::trace!("[VIRTIO] w8  {:#04x} <- {:#04x}", offset, value);
        self.window.write8(offset, value);
    }

    fn write16(&self, offset: u16, value: u16) {
        #[cfg(feature = "trace-registers")]
        log::trace!("[VIRTIO] w16 {:#04x} <- {:#06x}", offset, value);
        self.window.write16(offset, value);
    }

    fn write32(&self, offset: u16, value: u32) {
        #[cfg(feature = "trace-registers")]
        log::trace!("[VIRTIO] w32 {:#04x} <- {:#010x}", offset, value);
        self.window.write32(offset, value);
    }
}

/// The exact status a device must be in before `bit` may be added.
fn status_predecessors(bit: DeviceStatus) -> Option<DeviceStatus> {
    const ORDER: [DeviceStatus; 4] = [
        DeviceStatus::ACKNOWLEDGE,
        DeviceStatus::DRIVER,
        DeviceStatus::FEATURES_OK,
        DeviceStatus::DRIVER_OK,
    ];
    let pos = ORDER.iter().position(|step| *step == bit)?;
    Some(
        ORDER[..pos]
            .iter()
            .fold(DeviceStatus::empty(), |acc, step| acc | *step),
    )
}

impl<W: RegisterWindow> QueueNotifier for LegacyPciTransport<W> {
    fn notify(&self, queue_index: u16) {
        self.notify_queue(queue_index);
    }
}
