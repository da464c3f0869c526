//! Simulated MT6639 for the integration tests
//!
//! `SimDevice` is a BAR0 register file with just enough chip behaviour to
//! carry bring-up and firmware download: the HIF remap window, the
//! ownership handshake, WFSYS reset timing, ConnInfra wakeup, a TX ring
//! consumer that decodes MCU messages and an event responder on RX ring 0.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::alloc::Layout;
use std::ptr::NonNull;

use embedded_hal::delay::DelayNs;
use mt7927::dma::{DescCtrl, DmaAllocator, DmaBuffer};
use mt7927::mcu::{mcu_cmd, McuEvent, McuTxd};
use mt7927::regs::*;
use mt7927::{Bar, Error, RegisterWindow, Result};

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Clock
// ============================================================================

/// Delay source that advances a shared simulated clock.
#[derive(Clone, Default)]
pub struct SimDelay {
    ns: Rc<Cell<u64>>,
}

impl SimDelay {
    pub fn now_ms(&self) -> u64 {
        self.ns.get() / 1_000_000
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.ns.set(self.ns.get() + ns as u64);
    }
}

// ============================================================================
// DMA memory
// ============================================================================

struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

#[derive(Default)]
struct DmaMap {
    next: u64,
    regions: BTreeMap<u64, Region>,
}

/// Heap memory with 32-bit device addresses handed out sequentially, so
/// the low descriptor word alone identifies a buffer.
#[derive(Clone, Default)]
pub struct SimDma {
    map: Rc<RefCell<DmaMap>>,
    budget: Rc<Cell<Option<usize>>>,
}

impl SimDma {
    pub fn failing_after(n: usize) -> Self {
        let dma = Self::default();
        dma.budget.set(Some(n));
        dma
    }

    pub fn live(&self) -> usize {
        self.map.borrow().regions.len()
    }

    fn layout(len: usize) -> Layout {
        Layout::from_size_align(len.max(16), 4096).unwrap()
    }

    fn locate(&self, phys: u64, len: usize) -> *mut u8 {
        let map = self.map.borrow();
        let (base, region) = map
            .regions
            .range(..=phys)
            .next_back()
            .unwrap_or_else(|| panic!("device access to unmapped {phys:#x}"));
        let off = (phys - base) as usize;
        assert!(off + len <= region.len, "device access {phys:#x}+{len} past buffer end");
        unsafe { region.ptr.as_ptr().add(off) }
    }

    pub fn read(&self, phys: u64, len: usize) -> Vec<u8> {
        let p = self.locate(phys, len);
        unsafe { std::slice::from_raw_parts(p, len).to_vec() }
    }

    pub fn write(&self, phys: u64, data: &[u8]) {
        let p = self.locate(phys, data.len());
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), p, data.len()) }
    }

    pub fn read32(&self, phys: u64) -> u32 {
        let b = self.read(phys, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn write32(&self, phys: u64, val: u32) {
        self.write(phys, &val.to_le_bytes());
    }
}

impl DmaAllocator for SimDma {
    fn alloc(&self, size: usize) -> Result<DmaBuffer> {
        if let Some(n) = self.budget.get() {
            if n == 0 {
                return Err(Error::AllocationFailure(size));
            }
            self.budget.set(Some(n - 1));
        }
        let ptr = unsafe { std::alloc::alloc_zeroed(Self::layout(size)) };
        let ptr = NonNull::new(ptr).ok_or(Error::AllocationFailure(size))?;
        let mut map = self.map.borrow_mut();
        let phys = 0x1000_0000 + map.next;
        map.next += (size as u64 + 0xfff) & !0xfff;
        map.regions.insert(phys, Region { ptr, len: size });
        Ok(unsafe { DmaBuffer::from_raw_parts(ptr, phys, size) })
    }

    fn free(&self, buf: DmaBuffer) {
        let region = self
            .map
            .borrow_mut()
            .regions
            .remove(&buf.phys())
            .expect("free of unknown buffer");
        unsafe { std::alloc::dealloc(region.ptr.as_ptr(), Self::layout(region.len)) }
    }
}

// ============================================================================
// Device
// ============================================================================

const LPCTL: u32 = MT_CONN_ON_LPCTL;
const RST: u32 = MT_WFSYS_SW_RST_B;
const GLO_CFG_REMAP: u32 = 0x7c02_4208;
const CMD_RING: u32 = 15;
const FWDL_RING: u32 = 16;

/// One message the device pulled off a TX ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimMsg {
    pub ring: u32,
    pub cid: u8,
    pub pkt_fmt: u32,
    pub seq: u8,
    pub payload: Vec<u8>,
}

/// Knobs for misbehaviour
#[derive(Debug, Clone, Default)]
pub struct SimOptions {
    /// Direct GLO_CFG ignores writes; only the remapped alias works
    pub glo_cfg_locked: bool,
    /// Stop consuming the FWDL ring at this (zero based) chunk
    pub stall_fwdl_at: Option<usize>,
    /// Status byte answered to a semaphore get (default 2, "success")
    pub sem_get_status: Option<u8>,
    /// Never report N9 ready
    pub fw_never_ready: bool,
    /// Never raise OWN_SYNC
    pub own_dead: bool,
    /// Hold the command ring at this (zero based) command ...
    pub stall_cmd_at: Option<usize>,
    /// ... for this long after its doorbell (`u64::MAX`: for good)
    pub stall_cmd_ms: u64,
}

struct SimState {
    direct: HashMap<u32, u32>,
    remote: HashMap<u32, u32>,
    selector: u32,
    opts: SimOptions,
    /// Pending LPCTL sync value and reads left before it shows
    lpctl_pending: Option<(u32, u32)>,
    reset_cleared_at: Option<u64>,
    tx_consumed: HashMap<u32, u32>,
    fwdl_chunks: usize,
    cmds: usize,
    cmd_stall_until: Option<u64>,
    log: Vec<SimMsg>,
}

pub struct SimDevice {
    state: RefCell<SimState>,
    clock: SimDelay,
    dma: SimDma,
}

pub const SIM_BAR_LEN: usize = 0x10_0000;

impl SimDevice {
    pub fn new(clock: SimDelay, dma: SimDma, opts: SimOptions) -> Self {
        init_log();
        let mut remote = HashMap::new();
        remote.insert(CONNAC3X_TOP_HCR, MT6639_CHIP_ID);
        remote.insert(CONNAC3X_TOP_HVR, 0x8a00);
        remote.insert(CONN_INFRA_CFG_VERSION, MT6639_CONNINFRA_VERSION_ID_E2);
        remote.insert(WF_TOP_CFG_ON_ROMCODE_INDEX, ROM_CODE_READY_VALUE);
        remote.insert(RST, WFSYS_SW_RST_B | WFSYS_SW_INIT_DONE);
        Self {
            state: RefCell::new(SimState {
                direct: HashMap::new(),
                remote,
                selector: 0,
                opts,
                lpctl_pending: None,
                reset_cleared_at: None,
                tx_consumed: HashMap::new(),
                fwdl_chunks: 0,
                cmds: 0,
                cmd_stall_until: None,
                log: Vec::new(),
            }),
            clock,
            dma,
        }
    }

    /// Messages consumed so far, in order
    pub fn messages(&self) -> Vec<SimMsg> {
        self.state.borrow().log.clone()
    }

    /// Messages posted on a TX ring that the device has not consumed yet,
    /// decoded from their buffers as they stand now
    pub fn pending(&self, ring: u32) -> Vec<SimMsg> {
        let st = self.state.borrow();
        let base = mt_tx_ring(ring);
        let desc_base = st.direct.get(&(base + MT_RING_DESC_BASE)).copied().unwrap_or(0) as u64;
        let cnt = st.direct.get(&(base + MT_RING_CNT)).copied().unwrap_or(0);
        let cpu_idx = st.direct.get(&(base + MT_RING_CPU_IDX)).copied().unwrap_or(0);
        let mut idx = st.tx_consumed.get(&ring).copied().unwrap_or(0);
        let mut out = Vec::new();
        while cnt != 0 && idx != cpu_idx {
            out.push(self.decode(ring, desc_base, idx));
            idx = (idx + 1) % cnt;
        }
        out
    }

    pub fn remote(&self, addr: u32) -> u32 {
        self.state.borrow().remote.get(&addr).copied().unwrap_or(0)
    }

    pub fn direct(&self, off: u32) -> u32 {
        self.state.borrow().direct.get(&off).copied().unwrap_or(0)
    }

    pub fn set_remote(&self, addr: u32, val: u32) {
        self.state.borrow_mut().remote.insert(addr, val);
    }

    fn window_addr(st: &SimState, offset: u32) -> Option<u32> {
        let base = MT_HIF_REMAP_BASE;
        (base..base + MT_HIF_REMAP_SIZE)
            .contains(&offset)
            .then(|| (st.selector << 16) | (offset - base))
    }

    fn remote_read(st: &mut SimState, addr: u32) -> u32 {
        if addr == LPCTL {
            if let Some((sync, left)) = st.lpctl_pending {
                if left == 0 {
                    let v = st.remote.entry(LPCTL).or_insert(0);
                    *v = (*v & !Lpctl::HOST_OWN_SYNC.bits()) | sync;
                    st.lpctl_pending = None;
                } else {
                    st.lpctl_pending = Some((sync, left - 1));
                }
            }
        }
        st.remote.get(&addr).copied().unwrap_or(0)
    }

    fn remote_write(&self, st: &mut SimState, addr: u32, val: u32) {
        match addr {
            LPCTL => {
                let cur = st.remote.get(&LPCTL).copied().unwrap_or(0) & Lpctl::HOST_OWN_SYNC.bits();
                st.remote.insert(LPCTL, cur);
                if st.opts.own_dead {
                    return;
                }
                let req = Lpctl::from_bits_retain(val);
                if req.contains(Lpctl::HOST_SET_OWN) {
                    st.lpctl_pending = Some((Lpctl::HOST_OWN_SYNC.bits(), 1));
                } else if req.contains(Lpctl::HOST_CLR_OWN) {
                    st.lpctl_pending = Some((0, 1));
                }
            }
            RST => {
                let now = self.clock.now_ms();
                if val & WFSYS_SW_RST_B == 0 {
                    st.reset_cleared_at = Some(now);
                    st.remote.insert(RST, val & !WFSYS_SW_INIT_DONE);
                } else {
                    let held = st.reset_cleared_at.is_some_and(|t| now - t >= 50);
                    let done = if held { WFSYS_SW_INIT_DONE } else { 0 };
                    st.remote.insert(RST, (val & !WFSYS_SW_INIT_DONE) | done);
                }
            }
            MT_CONN_INFRA_WAKEUP => {
                st.remote.insert(addr, val);
                if val & MT_CONN_INFRA_WAKEUP_TRIGGER != 0 {
                    *st.remote.entry(MT_CONN_ON_MISC).or_insert(0) |= 0x100;
                }
            }
            _ => {
                st.remote.insert(addr, val);
            }
        }
    }

    // ========================================================================
    // Rings
    // ========================================================================

    fn ring_doorbell(&self, st: &mut SimState, ring: u32, cpu_idx: u32) {
        let base = mt_tx_ring(ring);
        let desc_base = st.direct.get(&(base + MT_RING_DESC_BASE)).copied().unwrap_or(0) as u64;
        let cnt = st.direct.get(&(base + MT_RING_CNT)).copied().unwrap_or(0);
        if cnt == 0 {
            return;
        }
        let mut idx = st.tx_consumed.get(&ring).copied().unwrap_or(0);
        while idx != cpu_idx {
            if ring == FWDL_RING && st.opts.stall_fwdl_at == Some(st.fwdl_chunks) {
                break;
            }
            if ring == CMD_RING && st.opts.stall_cmd_at == Some(st.cmds) {
                let now = self.clock.now_ms();
                let until = *st.cmd_stall_until.get_or_insert(now.saturating_add(st.opts.stall_cmd_ms));
                if now < until {
                    break;
                }
            }
            let msg = self.decode(ring, desc_base, idx);
            let d = desc_base + idx as u64 * 16;
            let ctrl = self.dma.read32(d + 4);
            self.dma.write32(d + 4, ctrl | DescCtrl::DMA_DONE.bits());

            if ring == FWDL_RING {
                st.fwdl_chunks += 1;
            } else {
                st.cmds += 1;
            }
            idx = (idx + 1) % cnt;
            st.tx_consumed.insert(ring, idx);
            st.direct.insert(base + MT_RING_DMA_IDX, idx);

            if ring == CMD_RING {
                self.respond(st, &msg);
            }
            st.log.push(msg);
        }
    }

    fn decode(&self, ring: u32, desc_base: u64, idx: u32) -> SimMsg {
        let d = desc_base + idx as u64 * 16;
        let buf = self.dma.read32(d) as u64;
        let len = (self.dma.read32(d + 4) & 0xffff) as usize;
        let raw = self.dma.read(buf, len);
        let w0 = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        SimMsg {
            ring,
            cid: raw[36],
            pkt_fmt: (w0 >> 23) & 0x3,
            seq: raw[39],
            payload: raw[McuTxd::SIZE..].to_vec(),
        }
    }

    fn respond(&self, st: &mut SimState, msg: &SimMsg) {
        let status = match msg.cid {
            mcu_cmd::PATCH_SEM_CTRL if msg.payload.first() == Some(&1) => {
                st.opts.sem_get_status.unwrap_or(2)
            }
            mcu_cmd::PATCH_SEM_CTRL => 3,
            mcu_cmd::FW_START_REQ => {
                if !st.opts.fw_never_ready {
                    *st.remote.entry(MT_CONN_ON_MISC).or_insert(0) |= MT_TOP_MISC2_FW_N9_RDY;
                }
                0
            }
            _ => 0,
        };
        self.push_event(st, msg.cid, msg.seq, &[status, 0, 0, 0]);
    }

    fn push_event(&self, st: &mut SimState, eid: u8, seq: u8, payload: &[u8]) {
        let base = mt_rx_ring(MT7927_RXQ_MCU_WM);
        let desc_base = st.direct.get(&(base + MT_RING_DESC_BASE)).copied().unwrap_or(0) as u64;
        let cnt = st.direct.get(&(base + MT_RING_CNT)).copied().unwrap_or(0);
        if cnt == 0 {
            return;
        }
        let idx = st.direct.get(&(base + MT_RING_DMA_IDX)).copied().unwrap_or(0);

        let mut ev = vec![0u8; McuEvent::HDR_SIZE];
        ev.extend_from_slice(payload);
        let len = ev.len() as u32;
        ev[0..4].copy_from_slice(&len.to_le_bytes());
        ev[32..34].copy_from_slice(&(len as u16 - 32).to_le_bytes());
        ev[36] = eid;
        ev[37] = seq;

        let d = desc_base + idx as u64 * 16;
        let buf = self.dma.read32(d) as u64;
        self.dma.write(buf, &ev);
        self.dma.write32(d + 4, len | (DescCtrl::LAST_SEC0 | DescCtrl::DMA_DONE).bits());
        st.direct.insert(base + MT_RING_DMA_IDX, (idx + 1) % cnt);
    }
}

impl Bar for SimDevice {
    fn len(&self) -> usize {
        SIM_BAR_LEN
    }

    fn read32(&self, offset: usize) -> u32 {
        let mut st = self.state.borrow_mut();
        let off = offset as u32;
        if let Some(addr) = Self::window_addr(&st, off) {
            return Self::remote_read(&mut st, addr);
        }
        // a held command ring resumes once the device gets looked at again
        let cmd = mt_tx_ring(CMD_RING);
        if off == cmd + MT_RING_DMA_IDX && st.cmd_stall_until.is_some() && Self::tx_enabled(&st) {
            let cpu_idx = st.direct.get(&(cmd + MT_RING_CPU_IDX)).copied().unwrap_or(0);
            self.ring_doorbell(&mut st, CMD_RING, cpu_idx);
        }
        st.direct.get(&off).copied().unwrap_or(0)
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut st = self.state.borrow_mut();
        let st = &mut *st;
        let off = offset as u32;
        if let Some(addr) = Self::window_addr(st, off) {
            self.remote_write(st, addr, value);
            return;
        }
        if off == MT_HIF_REMAP_L1 {
            st.selector = value;
        }
        if off == MT_WFDMA0_GLO_CFG && st.opts.glo_cfg_locked {
            return;
        }
        st.direct.insert(off, value);

        for ring in [CMD_RING, FWDL_RING] {
            let base = mt_tx_ring(ring);
            if off == base + MT_RING_DMA_IDX {
                st.tx_consumed.insert(ring, value);
            } else if off == base + MT_RING_CPU_IDX && Self::tx_enabled(st) {
                self.ring_doorbell(st, ring, value);
            }
        }
    }
}

impl SimDevice {
    /// The TX engine only runs while one GLO_CFG alias has TX_DMA_EN set
    fn tx_enabled(st: &SimState) -> bool {
        let en = GloCfg::TX_DMA_EN.bits();
        let direct = st.direct.get(&MT_WFDMA0_GLO_CFG).copied().unwrap_or(0);
        let remap = st.remote.get(&GLO_CFG_REMAP).copied().unwrap_or(0);
        (direct | remap) & en != 0
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub struct Sim {
    pub dev: SimDevice,
    pub clock: SimDelay,
    pub dma: SimDma,
}

impl Sim {
    pub fn new(opts: SimOptions) -> Self {
        let clock = SimDelay::default();
        let dma = SimDma::default();
        let dev = SimDevice::new(clock.clone(), dma.clone(), opts);
        Self { dev, clock, dma }
    }

    pub fn window(&self) -> RegisterWindow<&SimDevice, SimDelay> {
        RegisterWindow::new(&self.dev, self.clock.clone(), RemapConfig::default())
    }
}

// ============================================================================
// Firmware images
// ============================================================================

/// Flat patch: 32-byte header followed by `len` payload bytes.
pub fn flat_patch(len: usize) -> Vec<u8> {
    let mut b = vec![0u8; 32];
    b[0..8].copy_from_slice(b"20240101");
    b[16..20].copy_from_slice(b"ALPS");
    b[24..28].copy_from_slice(&0x0000_0001u32.to_be_bytes());
    b.extend((0..len).map(|i| (i % 251) as u8 | 1));
    b
}

/// RAM image with the given (addr, len, feature_set) regions.
pub fn ram_image(regions: &[(u32, u32, u8)]) -> Vec<u8> {
    let mut b: Vec<u8> = Vec::new();
    for &(_, len, _) in regions {
        b.extend(std::iter::repeat(0x5a).take(len as usize));
    }
    for &(addr, len, feature_set) in regions {
        let mut r = vec![0u8; 40];
        r[16..20].copy_from_slice(&addr.to_le_bytes());
        r[20..24].copy_from_slice(&len.to_le_bytes());
        r[24] = feature_set;
        b.extend(r);
    }
    let mut t = vec![0u8; 36];
    t[0] = 0x39;
    t[2] = regions.len() as u8;
    t[7..17].copy_from_slice(b"2024010100");
    t[17..25].copy_from_slice(b"20240101");
    b.extend(t);
    b
}

pub fn patch_path() -> String {
    format!("{}/{}", MT6639_FIRMWARE_DIR, MT6639_FIRMWARE_PATCH)
}

pub fn ram_path() -> String {
    format!("{}/{}", MT6639_FIRMWARE_DIR, MT6639_FIRMWARE_RAM)
}
