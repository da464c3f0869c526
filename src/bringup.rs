//! Bring-up state machine
//!
//! Takes the chip from power-on to "WFDMA running with MCU rings
//! configured". Phases run in a fixed order and never abort the sequence:
//! a failed phase is recorded in the report and the next one still runs,
//! so a partially responsive chip can still be inspected.
//!
//! ```text
//! DriverOwn → ChipIdentify → EmiSleepProtect → SubsystemReset
//!   → SubsystemWakeup → ConnInfraVersion → RomReady → InterruptMask
//!   → DmaDisable → RingConfig → DmaEnable
//! ```
//!
//! Registers whose location differs between silicon revisions are tried
//! from a candidate list; the first that completes the phase is adopted
//! for the rest of the run.

use alloc::vec::Vec;
use core::fmt;

use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::device::{Bar, RegisterWindow, OOB_SENTINEL};
use crate::dma::{DmaAllocator, DmaRing};
use crate::error::{Error, Result};
use crate::mcu::McuRings;
use crate::regs::{
    GloCfg, Lpctl, Reg, MT6639_CHIP_ID, MT_CONN_INFRA_WAKEUP_TRIGGER, MT_DMASHDL_DMASHDL_BYPASS,
    MT_HW_EMI_CTL_SLPPROT_EN, MT_PCIE_MAC_INT_ENABLE_ALL, MT_WFDMA0_GLO_CFG_EXT0_TX_DMASHDL_EN,
    MT_WFDMA0_RST_DMASHDL_ALL_RST, MT_WFDMA0_RST_LOGIC_RST, ROM_CODE_READY_VALUE, WFSYS_SW_INIT_DONE,
    WFSYS_SW_RST_B,
};

const CONNINFRA_VERSION_READS: u32 = 10;
const CONNINFRA_VERSION_INTERVAL_MS: u32 = 10;

// ============================================================================
// Phases and report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DriverOwn,
    ChipIdentify,
    EmiSleepProtect,
    SubsystemReset,
    SubsystemWakeup,
    ConnInfraVersion,
    RomReady,
    InterruptMask,
    DmaDisable,
    RingConfig,
    DmaEnable,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::DriverOwn,
        Phase::ChipIdentify,
        Phase::EmiSleepProtect,
        Phase::SubsystemReset,
        Phase::SubsystemWakeup,
        Phase::ConnInfraVersion,
        Phase::RomReady,
        Phase::InterruptMask,
        Phase::DmaDisable,
        Phase::RingConfig,
        Phase::DmaEnable,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::DriverOwn => "driver_own",
            Phase::ChipIdentify => "chip_identify",
            Phase::EmiSleepProtect => "emi_sleep_protect",
            Phase::SubsystemReset => "wfsys_reset",
            Phase::SubsystemWakeup => "conninfra_wakeup",
            Phase::ConnInfraVersion => "conninfra_version",
            Phase::RomReady => "rom_ready",
            Phase::InterruptMask => "irq_mask",
            Phase::DmaDisable => "dma_disable",
            Phase::RingConfig => "ring_config",
            Phase::DmaEnable => "dma_enable",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub result: Result<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    pub chip_id: u32,
    pub rev: u32,
    /// Register pair the id was read from
    pub source: (Reg, Reg),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Ready,
    /// At least one phase failed
    Degraded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BringUpReport {
    pub phases: Vec<PhaseOutcome>,
    pub chip: Option<ChipInfo>,
    pub conninfra_version: Option<u32>,
    /// Version matched one of the known ConnInfra ids
    pub conninfra_known: bool,
    pub rom_ready: bool,
    pub lpctl: Option<Reg>,
    pub wfsys_reset: Option<Reg>,
    pub glo_cfg: Option<Reg>,
}

impl BringUpReport {
    pub fn state(&self) -> ReadyState {
        if self.phases.iter().all(|p| p.result.is_ok()) {
            ReadyState::Ready
        } else {
            ReadyState::Degraded
        }
    }

    pub fn outcome(&self, phase: Phase) -> Option<&Result<()>> {
        self.phases.iter().find(|p| p.phase == phase).map(|p| &p.result)
    }

    pub fn failed(&self) -> impl Iterator<Item = &PhaseOutcome> {
        self.phases.iter().filter(|p| p.result.is_err())
    }
}

// ============================================================================
// Candidate registers
// ============================================================================

/// Ordered alternatives for one logical register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates<T> {
    list: Vec<T>,
    adopted: Option<T>,
}

impl<T: Copy + fmt::Display> Candidates<T> {
    pub fn new(list: Vec<T>) -> Self {
        Self { list, adopted: None }
    }

    /// Run `attempt` on each candidate in order and adopt the first one that
    /// succeeds. On total failure the last error is returned and the
    /// previously adopted (or primary) candidate stays current.
    pub fn try_each(&mut self, what: &'static str, mut attempt: impl FnMut(T) -> Result<()>) -> Result<T> {
        let mut last = Error::NotConfigured(what);
        for &c in &self.list {
            match attempt(c) {
                Ok(()) => {
                    self.adopted = Some(c);
                    return Ok(c);
                }
                Err(e) => {
                    warn!(target: "init", "candidate_failed what={} at={} {}", what, c, e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    pub fn adopted(&self) -> Option<T> {
        self.adopted
    }

    /// Adopted candidate, else the primary
    pub fn current(&self) -> Option<T> {
        self.adopted.or_else(|| self.list.first().copied())
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

// ============================================================================
// State machine
// ============================================================================

pub struct BringUp<'a, B, D> {
    win: &'a RegisterWindow<B, D>,
    cfg: &'a Config,
    lpctl: Candidates<Reg>,
    reset: Candidates<Reg>,
    glo_cfg: Candidates<Reg>,
    report: BringUpReport,
    rings: Option<McuRings>,
}

impl<'a, B: Bar, D: DelayNs> BringUp<'a, B, D> {
    pub fn new(win: &'a RegisterWindow<B, D>, cfg: &'a Config) -> Self {
        let regs = &cfg.regs;
        let mut reset = alloc::vec![regs.wfsys_reset];
        if cfg.try_alt_reset {
            reset.push(regs.wfsys_reset_alt);
        }
        Self {
            win,
            cfg,
            lpctl: Candidates::new(regs.lpctl.clone()),
            reset: Candidates::new(reset),
            glo_cfg: Candidates::new(regs.glo_cfg.clone()),
            report: BringUpReport::default(),
            rings: None,
        }
    }

    /// Run every phase in order. Rings are returned only when ring
    /// configuration succeeded.
    pub fn run<A: DmaAllocator>(mut self, alloc: &A) -> (BringUpReport, Option<McuRings>) {
        info!(target: "init", "bringup_start");

        for phase in Phase::ALL {
            debug!(target: "init", "phase_start name={}", phase);
            let result = match phase {
                Phase::DriverOwn => self.driver_own(),
                Phase::ChipIdentify => self.chip_identify(),
                Phase::EmiSleepProtect => self.emi_sleep_protect(),
                Phase::SubsystemReset => self.subsystem_reset(),
                Phase::SubsystemWakeup => self.subsystem_wakeup(),
                Phase::ConnInfraVersion => self.conninfra_version(),
                Phase::RomReady => self.rom_ready(),
                Phase::InterruptMask => self.interrupt_mask(),
                Phase::DmaDisable => self.dma_disable(),
                Phase::RingConfig => self.ring_config(alloc),
                Phase::DmaEnable => self.dma_enable(),
            };
            match &result {
                Ok(()) => info!(target: "init", "phase_ok name={}", phase),
                Err(e) => error!(target: "init", "phase_failed name={} {}", phase, e),
            }
            self.report.phases.push(PhaseOutcome { phase, result });
        }

        self.report.lpctl = self.lpctl.adopted();
        self.report.wfsys_reset = self.reset.adopted();
        self.report.glo_cfg = self.glo_cfg.adopted();

        let state = self.report.state();
        info!(target: "init", "bringup_done state={:?} failed={}", state, self.report.failed().count());
        (self.report, self.rings)
    }

    // ========================================================================
    // Power and reset
    // ========================================================================

    fn driver_own(&mut self) -> Result<()> {
        let (win, cfg) = (self.win, self.cfg);
        self.lpctl.try_each("LPCTL", |reg| own_handoff(win, cfg, reg))?;
        Ok(())
    }

    fn chip_identify(&mut self) -> Result<()> {
        for &(id_reg, rev_reg) in &self.cfg.regs.chip_id {
            let id = self.win.read(id_reg);
            if matches!(id, 0 | u32::MAX | OOB_SENTINEL) {
                debug!(target: "init", "chip_id_invalid reg={} val={:#x}", id_reg, id);
                continue;
            }
            let rev = self.win.read(rev_reg);
            if id & 0xffff != MT6639_CHIP_ID {
                warn!(target: "init", "chip_id_unexpected id={:#x}", id);
            }
            info!(target: "init", "chip_id id={:#x} rev={:#x} reg={}", id, rev, id_reg);
            self.report.chip = Some(ChipInfo { chip_id: id, rev, source: (id_reg, rev_reg) });
            return Ok(());
        }
        warn!(target: "init", "chip_id_unknown");
        Ok(())
    }

    fn emi_sleep_protect(&mut self) -> Result<()> {
        self.win.set_bits(self.cfg.regs.emi_ctl, MT_HW_EMI_CTL_SLPPROT_EN)?;
        Ok(())
    }

    fn subsystem_reset(&mut self) -> Result<()> {
        let win = self.win;
        let t = self.cfg.timeouts;
        self.reset.try_each("WFSYS reset", |reg| {
            win.clear_bits(reg, WFSYS_SW_RST_B)?;
            win.delay_ms(t.reset_hold_ms);
            win.set_bits(reg, WFSYS_SW_RST_B)?;
            match win.poll_with(reg, t.reset_done_ms, |v| v & WFSYS_SW_INIT_DONE != 0) {
                Ok(v) => {
                    debug!(target: "init", "wfsys_init_done reg={} val={:#x}", reg, v);
                    Ok(())
                }
                Err(v) => {
                    warn!(target: "init", "wfsys_init_timeout reg={} val={:#x}", reg, v);
                    Err(Error::Timeout { what: "WFSYS init done", ms: t.reset_done_ms })
                }
            }
        })?;
        Ok(())
    }

    fn subsystem_wakeup(&mut self) -> Result<()> {
        let regs = &self.cfg.regs;
        let ms = self.cfg.timeouts.wakeup_ms;
        self.win.try_write(regs.conninfra_wakeup, MT_CONN_INFRA_WAKEUP_TRIGGER)?;
        match self.win.poll_with(regs.conn_misc, ms, |v| v != 0 && v != u32::MAX) {
            Ok(v) => {
                debug!(target: "init", "conninfra_awake misc={:#x}", v);
                Ok(())
            }
            Err(v) => {
                warn!(target: "init", "conninfra_wakeup_timeout misc={:#x}", v);
                Err(Error::Timeout { what: "ConnInfra wakeup", ms })
            }
        }
    }

    fn conninfra_version(&mut self) -> Result<()> {
        let regs = &self.cfg.regs;
        let mut val = 0;
        for attempt in 0..CONNINFRA_VERSION_READS {
            if attempt > 0 {
                self.win.delay_ms(CONNINFRA_VERSION_INTERVAL_MS);
            }
            val = self.win.try_read(regs.conninfra_version)?;
            if regs.conninfra_versions.contains(&val) {
                info!(target: "init", "conninfra_version val={:#010x} reads={}", val, attempt + 1);
                self.report.conninfra_version = Some(val);
                self.report.conninfra_known = true;
                return Ok(());
            }
        }
        warn!(target: "init", "conninfra_version_unknown val={:#010x}", val);
        self.report.conninfra_version = Some(val);
        Ok(())
    }

    fn rom_ready(&mut self) -> Result<()> {
        if !self.cfg.rom_ready_check {
            debug!(target: "init", "rom_ready_skipped");
            return Ok(());
        }
        let ms = self.cfg.timeouts.rom_ready_ms;
        match self.win.poll_with(self.cfg.regs.romcode_index, ms, |v| v == ROM_CODE_READY_VALUE) {
            Ok(_) => {
                self.report.rom_ready = true;
                Ok(())
            }
            Err(v) => {
                warn!(target: "init", "rom_not_ready val={:#x}", v);
                Err(Error::Timeout { what: "ROM code ready", ms })
            }
        }
    }

    fn interrupt_mask(&mut self) -> Result<()> {
        let regs = &self.cfg.regs;
        self.win.try_write(regs.host_int_sta, !0)?;
        self.win.try_write(regs.host_int_ena, 0)?;
        self.win.try_write(regs.pcie_mac_int_ena, MT_PCIE_MAC_INT_ENABLE_ALL)?;
        Ok(())
    }

    // ========================================================================
    // WFDMA
    // ========================================================================

    fn dma_disable(&mut self) -> Result<()> {
        let regs = &self.cfg.regs;
        let ms = self.cfg.timeouts.dma_idle_ms;
        let glo = self.glo_cfg.current().ok_or(Error::NotConfigured("GLO_CFG"))?;

        let off = GloCfg::ENABLE | GloCfg::SETUP | GloCfg::OMIT_RX_INFO;
        self.win.clear_bits(glo, off.bits())?;
        let idle = match self.win.poll_with(glo, ms, |v| !GloCfg::from_bits_retain(v).intersects(GloCfg::BUSY)) {
            Ok(_) => Ok(()),
            Err(v) => {
                warn!(target: "init", "wfdma_busy glo_cfg={:#010x}", v);
                Err(Error::Timeout { what: "WFDMA idle", ms })
            }
        };

        self.win.clear_bits(regs.glo_cfg_ext0, MT_WFDMA0_GLO_CFG_EXT0_TX_DMASHDL_EN)?;
        self.win.set_bits(regs.dmashdl_sw_control, MT_DMASHDL_DMASHDL_BYPASS)?;

        let rst = MT_WFDMA0_RST_LOGIC_RST | MT_WFDMA0_RST_DMASHDL_ALL_RST;
        self.win.clear_bits(regs.wfdma_rst, rst)?;
        self.win.set_bits(regs.wfdma_rst, rst)?;
        self.win.clear_bits(regs.wfdma_rst, rst)?;
        idle
    }

    fn ring_config<A: DmaAllocator>(&mut self, alloc: &A) -> Result<()> {
        let sizes = self.cfg.rings;
        let regs = &self.cfg.regs;

        let fwdl = DmaRing::allocate(alloc, "fwdl", sizes.fwdl)?;
        let cmd = match DmaRing::allocate(alloc, "mcu_wm", sizes.cmd) {
            Ok(r) => r,
            Err(e) => {
                fwdl.free(alloc);
                return Err(e);
            }
        };
        let event = match DmaRing::allocate_rx(alloc, "mcu_event", sizes.event, sizes.event_buf) {
            Ok(r) => r,
            Err(e) => {
                fwdl.free(alloc);
                cmd.free(alloc);
                return Err(e);
            }
        };

        let mut rings = McuRings { fwdl, cmd, event };
        let configured = rings
            .fwdl
            .configure(self.win, regs.fwdl_ring)
            .and_then(|()| rings.cmd.configure(self.win, regs.cmd_ring))
            .and_then(|()| rings.event.configure(self.win, regs.event_ring));
        if let Err(e) = configured {
            rings.free(alloc);
            return Err(e);
        }

        info!(target: "init", "rings_ready fwdl={} cmd={} event={}x{}",
            sizes.fwdl, sizes.cmd, sizes.event, sizes.event_buf);
        self.rings = Some(rings);
        Ok(())
    }

    fn dma_enable(&mut self) -> Result<()> {
        let win = self.win;
        let regs = &self.cfg.regs;
        win.try_write(regs.rst_dtx_ptr, !0)?;
        win.try_write(regs.rst_drx_ptr, !0)?;
        win.try_write(regs.pri_dly_int_cfg0, 0)?;

        let reg = self.glo_cfg.try_each("GLO_CFG", |reg| {
            win.clear_bits(reg, GloCfg::SETUP.bits())?;
            win.set_bits(reg, GloCfg::SETUP.bits())?;
            win.set_bits(reg, GloCfg::ENABLE.bits())?;
            let value = win.try_read(reg)?;
            if GloCfg::from_bits_retain(value).contains(GloCfg::ENABLE) {
                Ok(())
            } else {
                Err(Error::NotLatched { reg, value })
            }
        })?;
        info!(target: "init", "wfdma_enabled glo_cfg={} val={:#010x}", reg, win.read(reg));
        Ok(())
    }
}

// ============================================================================
// Ownership handshake
// ============================================================================

/// Firmware own, settle, driver own on one LPCTL candidate.
fn own_handoff<B: Bar, D: DelayNs>(win: &RegisterWindow<B, D>, cfg: &Config, reg: Reg) -> Result<()> {
    own_step(win, cfg, reg, Lpctl::HOST_SET_OWN, Lpctl::HOST_OWN_SYNC, "firmware own")?;
    if !cfg.disable_pm_delay {
        win.delay_ms(cfg.timeouts.own_settle_ms);
    }
    own_step(win, cfg, reg, Lpctl::HOST_CLR_OWN, Lpctl::empty(), "driver own")?;
    info!(target: "init", "driver_own reg={}", reg);
    Ok(())
}

fn own_step<B: Bar, D: DelayNs>(
    win: &RegisterWindow<B, D>,
    cfg: &Config,
    reg: Reg,
    request: Lpctl,
    expect: Lpctl,
    what: &'static str,
) -> Result<()> {
    let ms = cfg.timeouts.own_ms;
    let sync = Lpctl::HOST_OWN_SYNC.bits();
    for attempt in 1..=cfg.own_retries.max(1) {
        win.try_write(reg, request.bits())?;
        if win.poll(reg, sync, expect.bits(), ms) {
            debug!(target: "init", "own_sync what={} reg={} attempt={}", what, reg, attempt);
            return Ok(());
        }
        debug!(target: "init", "own_retry what={} reg={} attempt={}", what, reg, attempt);
    }
    Err(Error::Timeout { what, ms })
}
