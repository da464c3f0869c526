//! Fakes shared by the unit tests

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;

use embedded_hal::delay::DelayNs;

use crate::device::{Bar, RegisterWindow};
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::error::{Error, Result};
use crate::regs::{RemapConfig, MT_RING_CPU_IDX, MT_RING_DMA_IDX};

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Plain register file
pub struct FakeBar {
    regs: RefCell<Vec<u32>>,
    consume: RefCell<Vec<u32>>,
}

impl FakeBar {
    pub fn new(len: usize) -> Self {
        init_log();
        Self { regs: RefCell::new(vec![0; len / 4]), consume: RefCell::new(Vec::new()) }
    }

    /// Make the "device" consume everything submitted on the ring at `base`.
    pub fn auto_consume(&self, base: u32) {
        self.consume.borrow_mut().push(base);
    }

    pub fn peek(&self, off: u32) -> u32 {
        self.regs.borrow()[off as usize / 4]
    }

    pub fn poke(&self, off: u32, val: u32) {
        self.regs.borrow_mut()[off as usize / 4] = val;
    }

    pub fn words(&self) -> Vec<u32> {
        self.regs.borrow().clone()
    }
}

impl Bar for FakeBar {
    fn len(&self) -> usize {
        self.regs.borrow().len() * 4
    }

    fn read32(&self, offset: usize) -> u32 {
        self.regs.borrow()[offset / 4]
    }

    fn write32(&self, offset: usize, value: u32) {
        self.regs.borrow_mut()[offset / 4] = value;
        let off = offset as u32;
        if self.consume.borrow().iter().any(|&b| off == b + MT_RING_CPU_IDX) {
            self.regs.borrow_mut()[(off - MT_RING_CPU_IDX + MT_RING_DMA_IDX) as usize / 4] = value;
        }
    }
}

/// Counts requested delay instead of sleeping
#[derive(Clone, Default)]
pub struct FakeDelay {
    ns: Rc<Cell<u64>>,
}

impl FakeDelay {
    pub fn elapsed_ms(&self) -> u64 {
        self.ns.get() / 1_000_000
    }
}

impl DelayNs for FakeDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.ns.set(self.ns.get() + ns as u64);
    }
}

pub fn window(bar: &FakeBar) -> (RegisterWindow<&FakeBar, FakeDelay>, FakeDelay) {
    let delay = FakeDelay::default();
    (RegisterWindow::new(bar, delay.clone(), RemapConfig::default()), delay)
}

/// Heap-backed "coherent" memory whose device address is its CPU address
#[derive(Default)]
pub struct HeapDma {
    live: Cell<usize>,
    budget: Cell<Option<usize>>,
}

impl HeapDma {
    pub fn failing_after(n: usize) -> Self {
        Self { live: Cell::new(0), budget: Cell::new(Some(n)) }
    }

    pub fn live(&self) -> usize {
        self.live.get()
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size.max(16), 4096).unwrap()
    }
}

impl DmaAllocator for HeapDma {
    fn alloc(&self, size: usize) -> Result<DmaBuffer> {
        if let Some(n) = self.budget.get() {
            if n == 0 {
                return Err(Error::AllocationFailure(size));
            }
            self.budget.set(Some(n - 1));
        }
        let ptr = unsafe { std::alloc::alloc_zeroed(Self::layout(size)) };
        let ptr = NonNull::new(ptr).ok_or(Error::AllocationFailure(size))?;
        self.live.set(self.live.get() + 1);
        Ok(unsafe { DmaBuffer::from_raw_parts(ptr, ptr.as_ptr() as u64, size) })
    }

    fn free(&self, buf: DmaBuffer) {
        self.live.set(self.live.get() - 1);
        unsafe { std::alloc::dealloc(buf.as_ptr(), Self::layout(buf.len())) }
    }
}
