//! Register window: bounds-checked BAR0 access and L1 remap
//!
//! `RegisterWindow` holds the BAR and the delay source and provides all
//! register access. The DMA, MCU and bring-up code take `&RegisterWindow` and
//! thread it through every call.
//!
//! Accesses outside the BAR never touch hardware: reads return
//! [`OOB_SENTINEL`], writes are dropped, and both are logged. The `try_*`
//! variants report the same condition as [`Error::OutOfBounds`].

use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::delay::DelayNs;
use log::{trace, warn};
use spin::Mutex;

use crate::error::{Error, Result};
use crate::regs::{Reg, RemapConfig};

/// Returned by reads outside the window
pub const OOB_SENTINEL: u32 = 0xdead_beef;

/// Poll cadence of every wait loop
pub const POLL_INTERVAL_MS: u32 = 1;

/// Settle time after programming the remap selector
const REMAP_SETTLE_US: u32 = 1;

// ============================================================================
// BAR capability
// ============================================================================

/// Raw 32-bit MMIO over a mapped BAR. Offsets handed to `read32`/`write32`
/// have already been bounds checked against `len()`.
pub trait Bar {
    fn len(&self) -> usize;
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

impl<T: Bar + ?Sized> Bar for &T {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

/// Volatile access to a BAR mapped into our address space.
pub struct MmioBar {
    base: *mut u32,
    len: usize,
}

impl MmioBar {
    /// # Safety
    ///
    /// `base` must point to `len` bytes of mapped device memory that stays
    /// mapped for the lifetime of the returned value.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base: base as *mut u32, len }
    }
}

impl Bar for MmioBar {
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.len);
        // SAFETY: offset checked by RegisterWindow, mapping guaranteed by `new`
        unsafe { core::ptr::read_volatile(self.base.add(offset / 4)) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.len);
        // SAFETY: as above
        unsafe { core::ptr::write_volatile(self.base.add(offset / 4), value) }
    }
}

// ============================================================================
// Register window
// ============================================================================

pub struct RegisterWindow<B, D> {
    bar: B,
    len: usize,
    remap: RemapConfig,
    /// Serializes selector programming with the access that follows it.
    /// Holds the last selector value written.
    selector: Mutex<u32>,
    delay: Mutex<D>,
    trace: AtomicBool,
}

impl<B: Bar, D: DelayNs> RegisterWindow<B, D> {
    pub fn new(bar: B, delay: D, remap: RemapConfig) -> Self {
        let len = bar.len();
        Self {
            bar,
            len,
            remap,
            selector: Mutex::new(0),
            delay: Mutex::new(delay),
            trace: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn remap_config(&self) -> RemapConfig {
        self.remap
    }

    // ========================================================================
    // Tracing
    // ========================================================================

    pub fn set_trace(&self, on: bool) {
        self.trace.store(on, Ordering::Relaxed);
    }

    pub fn tracing(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    /// Suppress register tracing until the guard drops.
    pub fn quiet(&self) -> TraceGuard<'_> {
        let prev = self.trace.swap(false, Ordering::Relaxed);
        TraceGuard { flag: &self.trace, prev }
    }

    // ========================================================================
    // Direct access
    // ========================================================================

    #[inline]
    fn in_bounds(&self, offset: usize) -> bool {
        offset.checked_add(4).is_some_and(|end| end <= self.len)
    }

    pub fn try_read32(&self, offset: u32) -> Result<u32> {
        let offset = offset as usize;
        if !self.in_bounds(offset) {
            return Err(Error::OutOfBounds { offset, len: self.len });
        }
        let val = self.bar.read32(offset);
        if self.tracing() {
            trace!(target: "mmio", "rr {:#07x} = {:#010x}", offset, val);
        }
        Ok(val)
    }

    pub fn try_write32(&self, offset: u32, val: u32) -> Result<()> {
        let offset = offset as usize;
        if !self.in_bounds(offset) {
            return Err(Error::OutOfBounds { offset, len: self.len });
        }
        if self.tracing() {
            trace!(target: "mmio", "wr {:#07x} <- {:#010x}", offset, val);
        }
        self.bar.write32(offset, val);
        Ok(())
    }

    pub fn read32(&self, offset: u32) -> u32 {
        match self.try_read32(offset) {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "mmio", "read_oob {}", e);
                OOB_SENTINEL
            }
        }
    }

    pub fn write32(&self, offset: u32, val: u32) {
        if let Err(e) = self.try_write32(offset, val) {
            warn!(target: "mmio", "write_oob {} val={:#x}", e, val);
        }
    }

    // ========================================================================
    // L1 remap
    // ========================================================================

    /// Program the selector for `addr` and run `access` on the window offset
    /// while the selector lock is held.
    fn with_remap<T>(&self, addr: u32, access: impl FnOnce(u32) -> Result<T>) -> Result<T> {
        let base = (addr & crate::regs::MT_HIF_REMAP_L1_MASK) >> 16;
        let offset = self.remap.window_base + (addr & crate::regs::MT_HIF_REMAP_L1_OFFSET);
        if (addr & crate::regs::MT_HIF_REMAP_L1_OFFSET) >= self.remap.window_size {
            return Err(Error::OutOfBounds { offset: offset as usize, len: self.len });
        }
        if !self.in_bounds(offset as usize) {
            return Err(Error::OutOfBounds { offset: offset as usize, len: self.len });
        }

        let mut sel = self.selector.lock();
        self.try_write32(self.remap.selector, base)?;
        *sel = base;
        self.delay.lock().delay_us(REMAP_SETTLE_US);
        access(offset)
    }

    pub fn try_read_remap(&self, addr: u32) -> Result<u32> {
        self.with_remap(addr, |off| self.try_read32(off))
    }

    pub fn try_write_remap(&self, addr: u32, val: u32) -> Result<()> {
        self.with_remap(addr, |off| self.try_write32(off, val))
    }

    pub fn read_remap(&self, addr: u32) -> u32 {
        match self.try_read_remap(addr) {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "mmio", "remap_read_oob addr={:#010x} {}", addr, e);
                OOB_SENTINEL
            }
        }
    }

    pub fn write_remap(&self, addr: u32, val: u32) {
        if let Err(e) = self.try_write_remap(addr, val) {
            warn!(target: "mmio", "remap_write_oob addr={:#010x} {}", addr, e);
        }
    }

    // ========================================================================
    // Register-level helpers (direct or remapped)
    // ========================================================================

    pub fn try_read(&self, reg: Reg) -> Result<u32> {
        match reg {
            Reg::Direct(off) => self.try_read32(off),
            Reg::Remap(addr) => self.try_read_remap(addr),
        }
    }

    pub fn try_write(&self, reg: Reg, val: u32) -> Result<()> {
        match reg {
            Reg::Direct(off) => self.try_write32(off, val),
            Reg::Remap(addr) => self.try_write_remap(addr, val),
        }
    }

    pub fn read(&self, reg: Reg) -> u32 {
        match reg {
            Reg::Direct(off) => self.read32(off),
            Reg::Remap(addr) => self.read_remap(addr),
        }
    }

    pub fn write(&self, reg: Reg, val: u32) {
        match reg {
            Reg::Direct(off) => self.write32(off, val),
            Reg::Remap(addr) => self.write_remap(addr, val),
        }
    }

    pub fn read_modify_write(&self, reg: Reg, mask: u32, val: u32) -> Result<u32> {
        let old = self.try_read(reg)?;
        let new = (old & !mask) | (val & mask);
        self.try_write(reg, new)?;
        Ok(new)
    }

    pub fn set_bits(&self, reg: Reg, bits: u32) -> Result<u32> {
        self.read_modify_write(reg, bits, bits)
    }

    pub fn clear_bits(&self, reg: Reg, bits: u32) -> Result<u32> {
        self.read_modify_write(reg, bits, 0)
    }

    // ========================================================================
    // Timing and polling
    // ========================================================================

    pub fn delay_ms(&self, ms: u32) {
        self.delay.lock().delay_ms(ms);
    }

    pub fn delay_us(&self, us: u32) {
        self.delay.lock().delay_us(us);
    }

    /// Re-evaluate `cond` every [`POLL_INTERVAL_MS`] until it holds or
    /// `timeout_ms` has elapsed. The condition is checked once more at the
    /// deadline, so a timeout costs exactly `timeout_ms`.
    pub fn poll_until(&self, timeout_ms: u32, mut cond: impl FnMut() -> bool) -> bool {
        let _quiet = self.quiet();
        let mut waited = 0;
        loop {
            if cond() {
                return true;
            }
            if waited >= timeout_ms {
                return false;
            }
            self.delay_ms(POLL_INTERVAL_MS);
            waited += POLL_INTERVAL_MS;
        }
    }

    /// Poll `reg` until `done(value)`. Returns the matching value, or the last
    /// value read on timeout.
    pub fn poll_with(
        &self,
        reg: Reg,
        timeout_ms: u32,
        mut done: impl FnMut(u32) -> bool,
    ) -> core::result::Result<u32, u32> {
        let mut last = 0;
        let hit = self.poll_until(timeout_ms, || {
            last = self.read(reg);
            done(last)
        });
        if hit { Ok(last) } else { Err(last) }
    }

    /// `(value & mask) == expected` within `timeout_ms`
    pub fn poll(&self, reg: Reg, mask: u32, expected: u32, timeout_ms: u32) -> bool {
        self.poll_with(reg, timeout_ms, |v| v & mask == expected).is_ok()
    }
}

/// Restores the window's previous trace setting when dropped.
pub struct TraceGuard<'a> {
    flag: &'a AtomicBool,
    prev: bool,
}

impl Drop for TraceGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.prev, Ordering::Relaxed);
    }
}
