//! WFDMA descriptor rings
//!
//! A `DmaRing` owns N 16-byte descriptors in device-visible memory and the
//! software side of the CPU_IDX / DMA_IDX protocol. CPU_IDX is the producer
//! doorbell, DMA_IDX is where the device has consumed up to. There is no
//! interrupt path: completion is observed by polling DMA_IDX.
//!
//! The ring never blocks on submit. A ring with N descriptors in flight
//! rejects further submissions with `RingFull` until the device index moves.

use alloc::vec::Vec;
use core::ptr::NonNull;

use bitflags::bitflags;
use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};

use crate::device::{Bar, RegisterWindow};
use crate::error::{Error, Result};
use crate::regs::*;

// ============================================================================
// Barriers
// ============================================================================

/// Make descriptor and buffer stores visible to the device before the
/// doorbell write.
#[inline(always)]
pub fn dma_wmb() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: barrier only
    unsafe {
        core::arch::asm!("dsb st", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Order the DMA_DONE check before reading buffer contents.
#[inline(always)]
pub fn dma_rmb() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: barrier only
    unsafe {
        core::arch::asm!("dsb ld", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

// ============================================================================
// Device-visible memory
// ============================================================================

/// A coherent allocation: CPU pointer plus the address the device uses.
#[derive(Debug)]
pub struct DmaBuffer {
    virt: NonNull<u8>,
    phys: u64,
    len: usize,
}

impl DmaBuffer {
    /// # Safety
    ///
    /// `virt` must be valid for reads and writes of `len` bytes, aligned to at
    /// least 16 bytes, and must stay valid until the buffer is returned to
    /// the allocator that produced it. `phys` is the device's view of it.
    pub unsafe fn from_raw_parts(virt: NonNull<u8>, phys: u64, len: usize) -> Self {
        Self { virt, phys, len }
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

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    pub fn read32(&self, off: usize) -> u32 {
        debug_assert!(off % 4 == 0 && off + 4 <= self.len);
        // SAFETY: in bounds and aligned per the constructor contract
        unsafe { core::ptr::read_volatile(self.virt.as_ptr().add(off) as *const u32) }
    }

    pub fn write32(&self, off: usize, val: u32) {
        debug_assert!(off % 4 == 0 && off + 4 <= self.len);
        // SAFETY: as above
        unsafe { core::ptr::write_volatile(self.virt.as_ptr().add(off) as *mut u32, val) }
    }

    pub fn write_bytes(&self, off: usize, data: &[u8]) {
        debug_assert!(off + data.len() <= self.len);
        // SAFETY: destination range checked above, source is a distinct slice
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.virt.as_ptr().add(off), data.len());
        }
    }

    pub fn read_bytes(&self, off: usize, len: usize) -> Vec<u8> {
        debug_assert!(off + len <= self.len);
        let mut out = Vec::with_capacity(len);
        // SAFETY: source range checked above, `out` has `len` bytes of capacity
        unsafe {
            core::ptr::copy_nonoverlapping(self.virt.as_ptr().add(off), out.as_mut_ptr(), len);
            out.set_len(len);
        }
        out
    }

    pub fn zero(&self) {
        // SAFETY: whole buffer
        unsafe { core::ptr::write_bytes(self.virt.as_ptr(), 0, self.len) }
    }
}

/// Source of device-visible memory.
pub trait DmaAllocator {
    /// Zeroed memory of at least `size` bytes, 16-byte aligned or better.
    fn alloc(&self, size: usize) -> Result<DmaBuffer>;
    fn free(&self, buf: DmaBuffer);
}

impl<T: DmaAllocator + ?Sized> DmaAllocator for &T {
    fn alloc(&self, size: usize) -> Result<DmaBuffer> {
        (**self).alloc(size)
    }

    fn free(&self, buf: DmaBuffer) {
        (**self).free(buf)
    }
}

// ============================================================================
// Descriptor
// ============================================================================

#[repr(C, align(4))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mt76Desc {
    pub buf0: u32,
    pub ctrl: u32,
    pub buf1: u32,
    pub info: u32,
}

pub const DESC_SIZE: usize = core::mem::size_of::<Mt76Desc>();

/// Length field of `ctrl`
pub const MT_DMA_CTL_SD_LEN0: u32 = 0xffff;

/// Largest ring the CNT register accepts
pub const MAX_RING_SIZE: u32 = 4096;

bitflags! {
    /// Flag bits of the descriptor control word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescCtrl: u32 {
        const LAST_SEC0 = 1 << 16;
        const BURST = 1 << 17;
        const DMA_DONE = 1 << 31;
    }
}

// ============================================================================
// Ring
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    Tx,
    Rx,
}

struct RxPool {
    buf: DmaBuffer,
    buf_size: u32,
}

pub struct DmaRing {
    name: &'static str,
    kind: RingKind,
    desc: DmaBuffer,
    ndesc: u32,
    regs_base: Option<u32>,
    cpu_idx: u32,
    /// Last DMA_IDX observed
    dma_idx: u32,
    in_flight: u32,
    rx: Option<RxPool>,
    rx_tail: u32,
}

impl DmaRing {
    /// TX ring with every descriptor marked DMA_DONE (software owned).
    pub fn allocate<A: DmaAllocator>(alloc: &A, name: &'static str, ndesc: u32) -> Result<Self> {
        if ndesc == 0 || ndesc > MAX_RING_SIZE {
            return Err(Error::InvalidRingSize(ndesc));
        }
        let desc = alloc.alloc(ndesc as usize * DESC_SIZE)?;
        desc.zero();

        let ring = Self {
            name,
            kind: RingKind::Tx,
            desc,
            ndesc,
            regs_base: None,
            cpu_idx: 0,
            dma_idx: 0,
            in_flight: 0,
            rx: None,
            rx_tail: 0,
        };
        for i in 0..ndesc {
            ring.write_desc(i, Mt76Desc { ctrl: DescCtrl::DMA_DONE.bits(), ..Default::default() });
        }
        dma_wmb();

        debug!(target: "dma", "ring_alloc name={} ndesc={} desc_phys={:#x}",
            name, ndesc, ring.desc.phys());
        Ok(ring)
    }

    /// RX ring with a buffer pool; each descriptor is armed with its buffer.
    pub fn allocate_rx<A: DmaAllocator>(
        alloc: &A,
        name: &'static str,
        ndesc: u32,
        buf_size: u32,
    ) -> Result<Self> {
        if ndesc == 0 || ndesc > MAX_RING_SIZE {
            return Err(Error::InvalidRingSize(ndesc));
        }
        if buf_size == 0 || buf_size > MT_DMA_CTL_SD_LEN0 || buf_size % 4 != 0 {
            return Err(Error::InvalidRingSize(buf_size));
        }
        let desc = alloc.alloc(ndesc as usize * DESC_SIZE)?;
        desc.zero();
        let pool = match alloc.alloc(ndesc as usize * buf_size as usize) {
            Ok(p) => p,
            Err(e) => {
                alloc.free(desc);
                return Err(e);
            }
        };

        let ring = Self {
            name,
            kind: RingKind::Rx,
            desc,
            ndesc,
            regs_base: None,
            cpu_idx: 0,
            dma_idx: 0,
            in_flight: 0,
            rx: Some(RxPool { buf: pool, buf_size }),
            rx_tail: 0,
        };
        for i in 0..ndesc {
            ring.arm_rx(i);
        }
        dma_wmb();

        debug!(target: "dma", "ring_alloc name={} ndesc={} buf_size={} desc_phys={:#x}",
            name, ndesc, buf_size, ring.desc.phys());
        Ok(ring)
    }

    /// Program DESC_BASE / CNT and zero both indices. RX rings then hand
    /// all but one descriptor to the device. Must run before DMA is enabled.
    pub fn configure<B: Bar, D: DelayNs>(&mut self, dev: &RegisterWindow<B, D>, base: u32) -> Result<()> {
        let phys = self.desc.phys();
        if dma_addr_hi(phys) != 0 {
            warn!(target: "dma", "desc_above_4g name={} phys={:#x}", self.name, phys);
        }

        dev.try_write32(base + MT_RING_CPU_IDX, 0)?;
        dev.try_write32(base + MT_RING_DMA_IDX, 0)?;
        dev.try_write32(base + MT_RING_DESC_BASE, dma_addr_lo(phys))?;
        dev.try_write32(base + MT_RING_CNT, self.ndesc)?;

        self.regs_base = Some(base);
        self.cpu_idx = 0;
        self.dma_idx = 0;
        self.in_flight = 0;
        self.rx_tail = 0;

        if self.kind == RingKind::Rx {
            self.cpu_idx = self.ndesc - 1;
            dev.try_write32(base + MT_RING_CPU_IDX, self.cpu_idx)?;
        }

        let readback = dev.read32(base + MT_RING_DESC_BASE);
        let dma = dev.read32(base + MT_RING_DMA_IDX);
        info!(target: "dma", "queue_init name={} reg={:#x} ndesc={} desc_phys={:#x} readback={:#x} dma_idx={}",
            self.name, base, self.ndesc, phys, readback, dma);
        Ok(())
    }

    // ========================================================================
    // TX
    // ========================================================================

    /// Fill the descriptor at CPU_IDX, advance CPU_IDX and ring the doorbell.
    /// Returns the slot used.
    ///
    /// A ring of N descriptors takes N submissions before `RingFull`. The
    /// N-th one brings CPU_IDX back to DMA_IDX, which WFDMA reads as an empty
    /// ring, so that batch stays invisible to the device until the caller
    /// drains and submits again. Drain before filling the last slot.
    pub fn submit<B: Bar, D: DelayNs>(
        &mut self,
        dev: &RegisterWindow<B, D>,
        addr: u64,
        len: u32,
        flags: DescCtrl,
    ) -> Result<u32> {
        let base = self.regs_base.ok_or(Error::NotConfigured(self.name))?;
        if self.kind != RingKind::Tx {
            return Err(Error::NotConfigured(self.name));
        }
        if len > MT_DMA_CTL_SD_LEN0 {
            return Err(Error::PayloadTooLarge { len: len as usize, max: MT_DMA_CTL_SD_LEN0 as usize });
        }
        if self.in_flight >= self.ndesc {
            self.reclaim(dev, base);
            if self.in_flight >= self.ndesc {
                warn!(target: "dma", "ring_full name={} cpu_idx={} dma_idx={}",
                    self.name, self.cpu_idx, self.dma_idx);
                return Err(Error::RingFull(self.name));
            }
        }

        let idx = self.cpu_idx;
        let ctrl = (len & MT_DMA_CTL_SD_LEN0) | (flags - DescCtrl::DMA_DONE).bits();
        self.write_desc(idx, Mt76Desc {
            buf0: dma_addr_lo(addr),
            ctrl,
            buf1: dma_addr_hi(addr),
            info: 0,
        });
        dma_wmb();

        // ring state only moves once the device has been told
        let next = (idx + 1) % self.ndesc;
        dev.try_write32(base + MT_RING_CPU_IDX, next)?;
        self.cpu_idx = next;
        self.in_flight += 1;

        debug!(target: "dma", "submit name={} idx={} len={} ctrl={:#010x} cpu_idx={}",
            self.name, idx, len, ctrl, self.cpu_idx);
        Ok(idx)
    }

    /// Poll DMA_IDX until it reaches CPU_IDX.
    pub fn wait_drain<B: Bar, D: DelayNs>(&mut self, dev: &RegisterWindow<B, D>, timeout_ms: u32) -> Result<()> {
        let base = self.regs_base.ok_or(Error::NotConfigured(self.name))?;
        let target = self.cpu_idx;
        // With every slot in flight CPU_IDX == DMA_IDX before anything has
        // been consumed; the last descriptor's write-back disambiguates.
        let full = self.in_flight >= self.ndesc;
        let last = (target + self.ndesc - 1) % self.ndesc;

        let drained = dev.poll_until(timeout_ms, || {
            dev.read32(base + MT_RING_DMA_IDX) == target
                && (!full || self.desc_done(last))
        });

        if drained {
            self.dma_idx = target;
            self.in_flight = 0;
            Ok(())
        } else {
            let hw = dev.read32(base + MT_RING_DMA_IDX);
            warn!(target: "dma", "drain_timeout name={} cpu_idx={} dma_idx={} in_flight={} timeout_ms={}",
                self.name, target, hw, self.in_flight, timeout_ms);
            Err(Error::Timeout { what: self.name, ms: timeout_ms })
        }
    }

    /// Account for descriptors the device consumed since the last look.
    fn reclaim<B: Bar, D: DelayNs>(&mut self, dev: &RegisterWindow<B, D>, base: u32) {
        let Ok(hw) = dev.try_read32(base + MT_RING_DMA_IDX) else { return };
        if hw >= self.ndesc {
            return;
        }
        let mut consumed = (hw + self.ndesc - self.dma_idx) % self.ndesc;
        // a full lap leaves DMA_IDX where it was
        if consumed == 0 && self.in_flight >= self.ndesc {
            let last = (self.cpu_idx + self.ndesc - 1) % self.ndesc;
            if self.desc_done(last) {
                consumed = self.ndesc;
            }
        }
        let consumed = consumed.min(self.in_flight);
        self.in_flight -= consumed;
        self.dma_idx = hw;
    }

    // ========================================================================
    // RX
    // ========================================================================

    /// Take the next completed RX descriptor, copy its payload out and hand
    /// the descriptor back to the device.
    pub fn recv<B: Bar, D: DelayNs>(&mut self, dev: &RegisterWindow<B, D>) -> Option<Vec<u8>> {
        let base = self.regs_base?;
        let (buf_size, data) = {
            let pool = self.rx.as_ref()?;
            let idx = self.rx_tail;
            let d = self.read_desc(idx);
            if d.ctrl & DescCtrl::DMA_DONE.bits() == 0 {
                return None;
            }
            dma_rmb();
            let len = (d.ctrl & MT_DMA_CTL_SD_LEN0).min(pool.buf_size);
            (pool.buf_size, pool.buf.read_bytes((idx * pool.buf_size) as usize, len as usize))
        };

        let idx = self.rx_tail;
        self.recycle(dev, base, idx, buf_size);
        debug!(target: "dma", "rx name={} idx={} len={}", self.name, idx, data.len());
        Some(data)
    }

    /// Rewrite the whole control word (length = buffer size, DMA_DONE clear)
    /// and return the slot through CPU_IDX.
    fn recycle<B: Bar, D: DelayNs>(&mut self, dev: &RegisterWindow<B, D>, base: u32, idx: u32, buf_size: u32) {
        let mut d = self.read_desc(idx);
        d.ctrl = buf_size & MT_DMA_CTL_SD_LEN0;
        d.info = 0;
        self.write_desc(idx, d);
        dma_wmb();

        self.cpu_idx = idx;
        dev.write32(base + MT_RING_CPU_IDX, idx);
        self.rx_tail = (idx + 1) % self.ndesc;
    }

    fn arm_rx(&self, idx: u32) {
        if let Some(pool) = &self.rx {
            let addr = pool.buf.phys() + idx as u64 * pool.buf_size as u64;
            self.write_desc(idx, Mt76Desc {
                buf0: dma_addr_lo(addr),
                ctrl: pool.buf_size & MT_DMA_CTL_SD_LEN0,
                buf1: dma_addr_hi(addr),
                info: 0,
            });
        }
    }

    // ========================================================================
    // Teardown and accessors
    // ========================================================================

    pub fn free<A: DmaAllocator>(self, alloc: &A) {
        if self.in_flight != 0 {
            warn!(target: "dma", "free_busy name={} in_flight={}", self.name, self.in_flight);
        }
        debug!(target: "dma", "ring_free name={}", self.name);
        alloc.free(self.desc);
        if let Some(pool) = self.rx {
            alloc.free(pool.buf);
        }
    }

    pub fn read_desc(&self, idx: u32) -> Mt76Desc {
        let off = idx as usize * DESC_SIZE;
        Mt76Desc {
            buf0: self.desc.read32(off),
            ctrl: self.desc.read32(off + 4),
            buf1: self.desc.read32(off + 8),
            info: self.desc.read32(off + 12),
        }
    }

    /// ctrl goes last so the descriptor is complete when it turns valid.
    fn write_desc(&self, idx: u32, d: Mt76Desc) {
        let off = idx as usize * DESC_SIZE;
        self.desc.write32(off, d.buf0);
        self.desc.write32(off + 8, d.buf1);
        self.desc.write32(off + 12, d.info);
        self.desc.write32(off + 4, d.ctrl);
    }

    fn desc_done(&self, idx: u32) -> bool {
        self.desc.read32(idx as usize * DESC_SIZE + 4) & DescCtrl::DMA_DONE.bits() != 0
    }

    pub fn name(&self) -> &'static str { self.name }
    pub fn kind(&self) -> RingKind { self.kind }
    pub fn capacity(&self) -> u32 { self.ndesc }
    pub fn cpu_idx(&self) -> u32 { self.cpu_idx }
    pub fn dma_idx(&self) -> u32 { self.dma_idx }
    pub fn in_flight(&self) -> u32 { self.in_flight }
    pub fn regs_base(&self) -> Option<u32> { self.regs_base }
    pub fn desc_phys(&self) -> u64 { self.desc.phys() }
    pub fn rx_buf_size(&self) -> Option<u32> { self.rx.as_ref().map(|p| p.buf_size) }
}
