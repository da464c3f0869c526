//! MCU command channel: TXD encoding, sequencing, send/wait
//!
//! Every message to the WM MCU is a 64-byte `McuTxd` followed by its
//! payload, placed in a DMA scratch buffer and submitted on a TX ring.
//! Commands go to the MCU WM ring (TX 15), firmware payload goes to the FWDL
//! ring (TX 16). Completion of a send means the ring drained; responses, when
//! the firmware produces them, arrive on the event ring (RX 0) and are picked
//! up separately with `wait_for_event`.

use alloc::vec::Vec;

use embedded_hal::delay::DelayNs;
use log::{debug, info, trace, warn};

use crate::config::Timeouts;
use crate::device::{Bar, RegisterWindow};
use crate::dma::{dma_wmb, DescCtrl, DmaAllocator, DmaBuffer, DmaRing};
use crate::error::{Error, Result};
use crate::regs::MCU_FW_DL_BUF_SIZE;

// ============================================================================
// Protocol constants
// ============================================================================

/// MCU packet type
pub const MCU_PKT_ID: u8 = 0xa0;

/// Legacy command IDs used during firmware download
pub mod mcu_cmd {
    pub const TARGET_ADDRESS_LEN_REQ: u8 = 0x01;
    pub const FW_START_REQ: u8 = 0x02;
    pub const PATCH_START_REQ: u8 = 0x05;
    pub const PATCH_FINISH_REQ: u8 = 0x07;
    pub const PATCH_SEM_CTRL: u8 = 0x10;
    pub const FW_SCATTER: u8 = 0xee;
}

/// Download mode bits of TARGET_ADDRESS_LEN_REQ / PATCH_START_REQ
pub mod dl_mode {
    pub const ENCRYPT: u32 = 1 << 0;
    pub const KEY_IDX_MASK: u32 = 0x3 << 1;
    pub const RESET_SEC_IV: u32 = 1 << 3;
    pub const WORKING_PDA_CR4: u32 = 1 << 4;
    pub const NEED_RSP: u32 = 1 << 31;
}

/// Region feature_set bits of the RAM image
pub mod fw_feature {
    pub const SET_ENCRYPT: u8 = 1 << 0;
    pub const SET_KEY_IDX_MASK: u8 = 0x6;
    pub const OVERRIDE_ADDR: u8 = 1 << 5;
}

/// FW_START_REQ option bits
pub mod fw_start {
    pub const OVERRIDE: u32 = 1 << 0;
    pub const WORKING_PDA_CR4: u32 = 1 << 2;
    pub const WORKING_PDA_DSP: u32 = 1 << 3;
}

pub mod mcu_q {
    pub const QUERY: u8 = 0;
    pub const SET: u8 = 1;
    pub const NA: u8 = 3;
}

/// Host to WM (N9)
pub const S2D_H2N: u8 = 0;

/// TXD word 0 packet formats and MCU port queues
pub const MT_TX_TYPE_CMD: u32 = 2;
pub const MT_TX_TYPE_FW: u32 = 3;
pub const MT_TX_MCU_PORT_RX_Q0: u32 = 0x20;
pub const MT_TX_MCU_PORT_RX_FWDL: u32 = 0x3e;
const MT_HDR_FORMAT_CMD: u32 = 1;

/// Largest payload after the TXD
pub const MCU_MAX_PAYLOAD: usize = MCU_FW_DL_BUF_SIZE;

/// mt76_connac_mcu_gen_dl_mode()
pub fn gen_dl_mode(feature_set: u8, is_wa: bool) -> u32 {
    let mut ret = 0;
    if feature_set & fw_feature::SET_ENCRYPT != 0 {
        ret |= dl_mode::ENCRYPT | dl_mode::RESET_SEC_IV;
    }
    let key_idx = ((feature_set & fw_feature::SET_KEY_IDX_MASK) >> 1) as u32;
    ret |= (key_idx << 1) & dl_mode::KEY_IDX_MASK;
    if is_wa {
        ret |= dl_mode::WORKING_PDA_CR4;
    }
    ret | dl_mode::NEED_RSP
}

// ============================================================================
// TXD
// ============================================================================

/// Which ring / packet format a message travels as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuPort {
    Cmd,
    Fwdl,
}

impl McuPort {
    fn pkt_fmt(self) -> u32 {
        match self {
            McuPort::Cmd => MT_TX_TYPE_CMD,
            McuPort::Fwdl => MT_TX_TYPE_FW,
        }
    }

    fn queue(self) -> u32 {
        match self {
            McuPort::Cmd => MT_TX_MCU_PORT_RX_Q0,
            McuPort::Fwdl => MT_TX_MCU_PORT_RX_FWDL,
        }
    }
}

/// Legacy (connac2) MCU TXD, 64 bytes on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct McuTxd {
    pub txd: [u32; 8],
    pub len: u16,
    pub pq_id: u16,
    pub cid: u8,
    pub pkt_type: u8,
    pub set_query: u8,
    pub seq: u8,
    pub uc_d2b0_rev: u8,
    pub ext_cid: u8,
    pub s2d_index: u8,
    pub ext_cid_ack: u8,
    pub rsv: [u32; 5],
}

impl McuTxd {
    pub const SIZE: usize = 64;

    pub fn new(port: McuPort, cmd: u8, len: u16, seq: u8) -> Self {
        let total_len = (Self::SIZE + len as usize) as u32;
        let mut txd = Self::default();
        txd.txd[0] = (total_len & 0xffff) | (port.pkt_fmt() << 23) | (port.queue() << 25);
        txd.txd[1] = MT_HDR_FORMAT_CMD << 14;
        txd.len = (total_len - 32) as u16;
        txd.pq_id = 0x8000;
        txd.cid = cmd;
        txd.pkt_type = MCU_PKT_ID;
        txd.set_query = mcu_q::NA;
        txd.seq = seq;
        txd.s2d_index = S2D_H2N;
        txd
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        for (i, w) in self.txd.iter().enumerate() {
            b[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        b[32..34].copy_from_slice(&self.len.to_le_bytes());
        b[34..36].copy_from_slice(&self.pq_id.to_le_bytes());
        b[36] = self.cid;
        b[37] = self.pkt_type;
        b[38] = self.set_query;
        b[39] = self.seq;
        b[40] = self.uc_d2b0_rev;
        b[41] = self.ext_cid;
        b[42] = self.s2d_index;
        b[43] = self.ext_cid_ack;
        for (i, w) in self.rsv.iter().enumerate() {
            b[44 + i * 4..48 + i * 4].copy_from_slice(&w.to_le_bytes());
        }
        b
    }
}

// ============================================================================
// Requests
// ============================================================================

/// TARGET_ADDRESS_LEN_REQ / PATCH_START_REQ payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitDlRequest {
    pub addr: u32,
    pub len: u32,
    pub mode: u32,
}

impl InitDlRequest {
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut b = [0u8; 12];
        b[0..4].copy_from_slice(&self.addr.to_le_bytes());
        b[4..8].copy_from_slice(&self.len.to_le_bytes());
        b[8..12].copy_from_slice(&self.mode.to_le_bytes());
        b
    }
}

/// PATCH_SEM_CTRL operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchSemOp {
    Release = 0,
    Get = 1,
}

impl PatchSemOp {
    pub fn to_bytes(self) -> [u8; 4] {
        (self as u32).to_le_bytes()
    }
}

/// Status byte of the PATCH_SEM_CTRL response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchSemStatus {
    NotDownloadedSemFail,
    AlreadyDownloaded,
    NotDownloadedSemSuccess,
    ReleaseSuccess,
    Unknown(u8),
}

impl From<u8> for PatchSemStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::NotDownloadedSemFail,
            1 => Self::AlreadyDownloaded,
            2 => Self::NotDownloadedSemSuccess,
            3 => Self::ReleaseSuccess,
            other => Self::Unknown(other),
        }
    }
}

/// FW_START_REQ payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwStartRequest {
    pub option: u32,
    pub addr: u32,
}

impl FwStartRequest {
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0..4].copy_from_slice(&self.option.to_le_bytes());
        b[4..8].copy_from_slice(&self.addr.to_le_bytes());
        b
    }
}

// ============================================================================
// Events
// ============================================================================

/// Legacy MCU RXD: `rxd[8]`, then the event header, then payload at 44.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McuEvent {
    pub len: u16,
    pub pkt_type_id: u16,
    pub eid: u8,
    pub seq: u8,
    pub option: u8,
    pub ext_eid: u8,
    pub s2d_index: u8,
    pub payload: Vec<u8>,
}

impl McuEvent {
    pub const HDR_SIZE: usize = 44;

    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::HDR_SIZE {
            return None;
        }
        Some(Self {
            len: u16::from_le_bytes([raw[32], raw[33]]),
            pkt_type_id: u16::from_le_bytes([raw[34], raw[35]]),
            eid: raw[36],
            seq: raw[37],
            option: raw[38],
            ext_eid: raw[40],
            s2d_index: raw[43],
            payload: raw[Self::HDR_SIZE..].to_vec(),
        })
    }

    pub fn sem_status(&self) -> Option<PatchSemStatus> {
        self.payload.first().map(|&b| PatchSemStatus::from(b))
    }
}

// ============================================================================
// Sequence numbers
// ============================================================================

/// 1..=15, wrapping; 0 means "never sent".
#[derive(Debug, Clone, Copy, Default)]
pub struct SeqCounter {
    last: u8,
}

impl SeqCounter {
    pub const MAX: u8 = 0xf;

    pub fn next(&mut self) -> u8 {
        self.last = if self.last >= Self::MAX { 1 } else { self.last + 1 };
        self.last
    }

    pub fn last(&self) -> u8 {
        self.last
    }
}

// ============================================================================
// Channel
// ============================================================================

/// The three rings MCU traffic runs over
pub struct McuRings {
    pub fwdl: DmaRing,
    pub cmd: DmaRing,
    pub event: DmaRing,
}

impl McuRings {
    pub fn free<A: DmaAllocator>(self, alloc: &A) {
        self.fwdl.free(alloc);
        self.cmd.free(alloc);
        self.event.free(alloc);
    }
}

pub struct McuChannel<'w, B, D> {
    dev: &'w RegisterWindow<B, D>,
    rings: McuRings,
    cmd_buf: DmaBuffer,
    fwdl_buf: DmaBuffer,
    seq: SeqCounter,
    cmd_timeout_ms: u32,
    chunk_timeout_ms: u32,
}

impl<'w, B: Bar, D: DelayNs> McuChannel<'w, B, D> {
    /// Take ownership of configured rings and allocate the two scratch
    /// buffers. On failure the rings are freed.
    pub fn new<A: DmaAllocator>(
        dev: &'w RegisterWindow<B, D>,
        rings: McuRings,
        alloc: &A,
        timeouts: &Timeouts,
    ) -> Result<Self> {
        let size = McuTxd::SIZE + MCU_MAX_PAYLOAD;
        let cmd_buf = match alloc.alloc(size) {
            Ok(b) => b,
            Err(e) => {
                rings.free(alloc);
                return Err(e);
            }
        };
        let fwdl_buf = match alloc.alloc(size) {
            Ok(b) => b,
            Err(e) => {
                alloc.free(cmd_buf);
                rings.free(alloc);
                return Err(e);
            }
        };
        Ok(Self {
            dev,
            rings,
            cmd_buf,
            fwdl_buf,
            seq: SeqCounter::default(),
            cmd_timeout_ms: timeouts.cmd_drain_ms,
            chunk_timeout_ms: timeouts.chunk_drain_ms,
        })
    }

    pub fn release<A: DmaAllocator>(self, alloc: &A) -> McuRings {
        alloc.free(self.cmd_buf);
        alloc.free(self.fwdl_buf);
        self.rings
    }

    pub fn dev(&self) -> &'w RegisterWindow<B, D> {
        self.dev
    }

    pub fn rings(&self) -> &McuRings {
        &self.rings
    }

    pub fn last_seq(&self) -> u8 {
        self.seq.last()
    }

    /// Send a command on the WM ring and wait for the ring to drain.
    /// Returns the sequence number used.
    pub fn send_command(&mut self, cid: u8, payload: &[u8]) -> Result<u8> {
        self.transmit(McuPort::Cmd, cid, payload)
    }

    /// Send one FW_SCATTER chunk (at most 4096 bytes) on the FWDL ring.
    pub fn send_firmware_chunk(&mut self, data: &[u8]) -> Result<u8> {
        self.transmit(McuPort::Fwdl, mcu_cmd::FW_SCATTER, data)
    }

    fn transmit(&mut self, port: McuPort, cid: u8, payload: &[u8]) -> Result<u8> {
        if payload.len() > MCU_MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge { len: payload.len(), max: MCU_MAX_PAYLOAD });
        }

        let (ring, buf, timeout) = match port {
            McuPort::Cmd => (&mut self.rings.cmd, &self.cmd_buf, self.cmd_timeout_ms),
            McuPort::Fwdl => (&mut self.rings.fwdl, &self.fwdl_buf, self.chunk_timeout_ms),
        };

        // An earlier send timed out: its descriptor still points at the
        // scratch buffer, which stays untouched until the device lets go.
        if ring.in_flight() != 0 {
            debug!(target: "mcu", "tx_pending port={:?} in_flight={}", port, ring.in_flight());
            if let Err(e) = ring.wait_drain(self.dev, timeout) {
                warn!(target: "mcu", "tx_busy port={:?} cid={:#04x}", port, cid);
                return Err(e);
            }
        }

        let seq = self.seq.next();
        let txd = McuTxd::new(port, cid, payload.len() as u16, seq);
        let total = McuTxd::SIZE + payload.len();

        buf.write_bytes(0, &txd.to_bytes());
        buf.write_bytes(McuTxd::SIZE, payload);
        dma_wmb();

        let idx = ring.submit(self.dev, buf.phys(), total as u32, DescCtrl::LAST_SEC0)?;
        trace!(target: "mcu", "tx port={:?} cid={:#04x} seq={} len={} idx={}", port, cid, seq, total, idx);

        if let Err(e) = ring.wait_drain(self.dev, timeout) {
            warn!(target: "mcu", "tx_timeout port={:?} cid={:#04x} seq={}", port, cid, seq);
            return Err(e);
        }
        Ok(seq)
    }

    /// Next raw event from the event ring, if one shows up in time.
    pub fn wait_for_event(&mut self, timeout_ms: u32) -> Option<Vec<u8>> {
        let dev = self.dev;
        let ring = &mut self.rings.event;
        let mut event = None;
        dev.poll_until(timeout_ms, || {
            event = ring.recv(dev);
            event.is_some()
        });
        if event.is_none() {
            debug!(target: "mcu", "no_event timeout_ms={}", timeout_ms);
        }
        event
    }

    /// Wait for the event carrying `seq`, discarding unrelated ones.
    pub fn wait_for_response(&mut self, seq: u8, timeout_ms: u32) -> Option<McuEvent> {
        let dev = self.dev;
        let ring = &mut self.rings.event;
        let mut found = None;
        dev.poll_until(timeout_ms, || {
            while let Some(raw) = ring.recv(dev) {
                match McuEvent::parse(&raw) {
                    Some(ev) if ev.seq == seq => {
                        found = Some(ev);
                        return true;
                    }
                    Some(ev) => {
                        info!(target: "mcu", "unsolicited_event eid={:#04x} seq={}", ev.eid, ev.seq);
                    }
                    None => warn!(target: "mcu", "short_event len={}", raw.len()),
                }
            }
            false
        });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaRing;
    use crate::regs::{mt_rx_ring, mt_tx_ring};
    use crate::testutil::{window, FakeBar, HeapDma};

    #[test]
    fn txd_command_encoding() {
        let b = McuTxd::new(McuPort::Cmd, mcu_cmd::PATCH_SEM_CTRL, 4, 3).to_bytes();
        let w0 = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        assert_eq!(w0 & 0xffff, 68);
        assert_eq!((w0 >> 23) & 0x3, MT_TX_TYPE_CMD);
        assert_eq!(w0 >> 25, MT_TX_MCU_PORT_RX_Q0);
        assert_eq!(u32::from_le_bytes([b[4], b[5], b[6], b[7]]), 1 << 14);
        assert_eq!(u16::from_le_bytes([b[32], b[33]]), 36);
        assert_eq!(u16::from_le_bytes([b[34], b[35]]), 0x8000);
        assert_eq!(b[36], mcu_cmd::PATCH_SEM_CTRL);
        assert_eq!(b[37], MCU_PKT_ID);
        assert_eq!(b[38], mcu_q::NA);
        assert_eq!(b[39], 3);
        assert_eq!(b[42], S2D_H2N);
        assert!(b[44..].iter().all(|&x| x == 0));
    }

    #[test]
    fn txd_firmware_encoding() {
        let b = McuTxd::new(McuPort::Fwdl, mcu_cmd::FW_SCATTER, 4096, 1).to_bytes();
        let w0 = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        assert_eq!(w0 & 0xffff, 4160);
        assert_eq!((w0 >> 23) & 0x3, MT_TX_TYPE_FW);
        assert_eq!(w0 >> 25, MT_TX_MCU_PORT_RX_FWDL);
    }

    #[test]
    fn seq_wraps_and_skips_zero() {
        let mut s = SeqCounter::default();
        let got: Vec<u8> = (0..32).map(|_| s.next()).collect();
        let want: Vec<u8> = (1..=15).chain(1..=15).chain(1..=2).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn dl_mode_from_feature_set() {
        assert_eq!(gen_dl_mode(0, false), dl_mode::NEED_RSP);
        let m = gen_dl_mode(fw_feature::SET_ENCRYPT | 0x4, false);
        assert_eq!(m & dl_mode::ENCRYPT, dl_mode::ENCRYPT);
        assert_eq!(m & dl_mode::RESET_SEC_IV, dl_mode::RESET_SEC_IV);
        assert_eq!(m & dl_mode::KEY_IDX_MASK, 0x4);
        assert_eq!(gen_dl_mode(0, true) & dl_mode::WORKING_PDA_CR4, dl_mode::WORKING_PDA_CR4);
    }

    #[test]
    fn event_parse() {
        let mut raw = alloc::vec![0u8; 48];
        raw[36] = mcu_cmd::PATCH_SEM_CTRL;
        raw[37] = 7;
        raw[44] = 1;
        let ev = McuEvent::parse(&raw).unwrap();
        assert_eq!(ev.seq, 7);
        assert_eq!(ev.sem_status(), Some(PatchSemStatus::AlreadyDownloaded));
        assert!(McuEvent::parse(&raw[..40]).is_none());
    }

    fn channel_fixture<'a>(
        bar: &'a FakeBar,
        dma: &HeapDma,
    ) -> (crate::device::RegisterWindow<&'a FakeBar, crate::testutil::FakeDelay>, McuRings) {
        let (w, _) = window(bar);
        let mut rings = McuRings {
            fwdl: DmaRing::allocate(dma, "fwdl", 8).unwrap(),
            cmd: DmaRing::allocate(dma, "cmd", 8).unwrap(),
            event: DmaRing::allocate_rx(dma, "event", 8, 512).unwrap(),
        };
        rings.fwdl.configure(&w, mt_tx_ring(16)).unwrap();
        rings.cmd.configure(&w, mt_tx_ring(15)).unwrap();
        rings.event.configure(&w, mt_rx_ring(0)).unwrap();
        (w, rings)
    }

    #[test]
    fn twenty_commands_cycle_sequence() {
        let bar = FakeBar::new(0x100000);
        bar.auto_consume(mt_tx_ring(15));
        let dma = HeapDma::default();
        let (w, rings) = channel_fixture(&bar, &dma);
        let mut ch = McuChannel::new(&w, rings, &dma, &Timeouts::default()).unwrap();

        let seqs: Vec<u8> = (0..20).map(|_| ch.send_command(0x10, &[1, 0, 0, 0]).unwrap()).collect();
        let want: Vec<u8> = (1..=15).chain(1..=5).collect();
        assert_eq!(seqs, want);

        ch.release(&dma).free(&dma);
        assert_eq!(dma.live(), 0);
    }

    #[test]
    fn oversize_chunk_rejected_without_consuming_seq() {
        let bar = FakeBar::new(0x100000);
        let dma = HeapDma::default();
        let (w, rings) = channel_fixture(&bar, &dma);
        let mut ch = McuChannel::new(&w, rings, &dma, &Timeouts::default()).unwrap();
        let big = alloc::vec![0u8; MCU_MAX_PAYLOAD + 1];
        assert!(matches!(ch.send_firmware_chunk(&big), Err(Error::PayloadTooLarge { .. })));
        assert_eq!(ch.last_seq(), 0);
        ch.release(&dma).free(&dma);
    }

    #[test]
    fn stalled_command_ring_times_out() {
        let bar = FakeBar::new(0x100000);
        let dma = HeapDma::default();
        let (w, rings) = channel_fixture(&bar, &dma);
        let timeouts = Timeouts { cmd_drain_ms: 5, ..Timeouts::default() };
        let mut ch = McuChannel::new(&w, rings, &dma, &timeouts).unwrap();
        assert!(matches!(ch.send_command(0x10, &[0; 4]), Err(Error::Timeout { .. })));
        assert!(ch.wait_for_event(3).is_none());
        ch.release(&dma).free(&dma);
    }

    /// Sequence byte of the message a TX descriptor points at
    fn seq_at(ring: &DmaRing, idx: u32) -> u8 {
        let d = ring.read_desc(idx);
        let addr = (((d.buf1 as u64) << 32) | d.buf0 as u64) as *const u8;
        // SAFETY: HeapDma hands out device addresses equal to CPU addresses
        unsafe { core::ptr::read_volatile(addr.add(39)) }
    }

    #[test]
    fn scratch_buffer_kept_while_device_owns_it() {
        let bar = FakeBar::new(0x100000);
        let dma = HeapDma::default();
        let (w, rings) = channel_fixture(&bar, &dma);
        let timeouts = Timeouts { cmd_drain_ms: 5, ..Timeouts::default() };
        let mut ch = McuChannel::new(&w, rings, &dma, &timeouts).unwrap();
        let cmd = mt_tx_ring(15);

        assert!(matches!(ch.send_command(0x10, &[1, 0, 0, 0]), Err(Error::Timeout { .. })));
        assert_eq!(seq_at(&ch.rings().cmd, 0), 1);

        // still stuck: refused before touching the buffer or the ring
        assert!(matches!(ch.send_command(0x10, &[1, 0, 0, 0]), Err(Error::Timeout { .. })));
        assert_eq!(seq_at(&ch.rings().cmd, 0), 1);
        assert_eq!(ch.last_seq(), 1);
        assert_eq!(ch.rings().cmd.cpu_idx(), 1);
        assert_eq!(ch.rings().cmd.read_desc(1).ctrl, DescCtrl::DMA_DONE.bits());

        // device catches up, the next send goes through
        bar.poke(cmd + crate::regs::MT_RING_DMA_IDX, 1);
        bar.auto_consume(cmd);
        assert_eq!(ch.send_command(0x10, &[1, 0, 0, 0]).unwrap(), 2);
        assert_eq!(ch.rings().cmd.in_flight(), 0);
        assert_eq!(seq_at(&ch.rings().cmd, 1), 2);

        ch.release(&dma).free(&dma);
        assert_eq!(dma.live(), 0);
    }
}
