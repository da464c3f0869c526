//! MT7927 driver
//!
//! Ties bring-up, the MCU channel and the firmware loader together behind
//! one device object. The register window is owned by the caller; the
//! driver owns the DMA allocator handle, the rings and the scratch buffers.

use core::fmt;

use embedded_hal::delay::DelayNs;
use log::{info, warn};

use crate::bringup::{BringUp, BringUpReport, Phase, ReadyState};
use crate::config::Config;
use crate::device::{Bar, RegisterWindow};
use crate::dma::DmaAllocator;
use crate::error::Error;
use crate::firmware::FirmwareProvider;
use crate::loader::{FirmwareLoader, FirmwareStatus, LoadError, LoadStage};
use crate::mcu::McuChannel;
use crate::regs::{GloCfg, MT6639_DEVICE_ID, MT7927_DEVICE_ID, PCI_IDS};

/// PCI vendor:device pairs this driver binds to
pub fn supports(vendor: u16, device: u16) -> bool {
    PCI_IDS.contains(&(vendor, device))
}

pub fn chip_name(device: u16) -> &'static str {
    match device {
        MT7927_DEVICE_ID => "MT7927",
        MT6639_DEVICE_ID => "MT6639",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Window mapped, nothing touched yet
    Attached,
    /// Bring-up completed every phase
    Ready,
    /// Bring-up finished with failed phases
    Degraded,
    FirmwareLoaded,
    FirmwareFailed,
}

pub struct Mt7927<'w, B: Bar, D: DelayNs, A: DmaAllocator> {
    win: &'w RegisterWindow<B, D>,
    alloc: A,
    cfg: Config,
    state: DeviceState,
    report: Option<BringUpReport>,
    chan: Option<McuChannel<'w, B, D>>,
    firmware: Option<FirmwareStatus>,
}

impl<'w, B: Bar, D: DelayNs, A: DmaAllocator> Mt7927<'w, B, D, A> {
    pub fn attach(win: &'w RegisterWindow<B, D>, alloc: A, cfg: Config) -> Self {
        win.set_trace(cfg.trace_registers);
        info!(target: "init", "attach bar_len={:#x} trace={}", win.len(), cfg.trace_registers);
        Self {
            win,
            alloc,
            cfg,
            state: DeviceState::Attached,
            report: None,
            chan: None,
            firmware: None,
        }
    }

    /// Run the bring-up sequence. Rings from a previous run are released
    /// first.
    pub fn bring_up(&mut self) -> &BringUpReport {
        self.teardown();

        let (report, rings) = BringUp::new(self.win, &self.cfg).run(&self.alloc);
        self.chan = match rings {
            Some(rings) => match McuChannel::new(self.win, rings, &self.alloc, &self.cfg.timeouts) {
                Ok(chan) => Some(chan),
                Err(e) => {
                    warn!(target: "init", "mcu_channel_unavailable {}", e);
                    None
                }
            },
            None => None,
        };

        self.state = match report.state() {
            ReadyState::Ready if self.chan.is_some() => DeviceState::Ready,
            _ => DeviceState::Degraded,
        };
        self.firmware = None;
        self.report.insert(report)
    }

    /// Download patch and RAM code. Needs the MCU rings from bring-up;
    /// a degraded bring-up that still produced them is allowed to try.
    pub fn load_firmware<P: FirmwareProvider + ?Sized>(&mut self, provider: &P) -> FirmwareStatus {
        let status = match self.chan.as_mut() {
            Some(chan) => FirmwareLoader::new(chan, &self.cfg).run(provider),
            None => FirmwareStatus::NotLoaded(LoadError {
                stage: LoadStage::Fetch,
                error: Error::NotConfigured("MCU rings"),
            }),
        };
        self.state = if status.is_loaded() {
            DeviceState::FirmwareLoaded
        } else {
            DeviceState::FirmwareFailed
        };
        self.firmware = Some(status.clone());
        status
    }

    /// Bring-up followed by firmware load
    pub fn probe<P: FirmwareProvider + ?Sized>(&mut self, provider: &P) -> FirmwareStatus {
        self.bring_up();
        self.load_firmware(provider)
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn report(&self) -> Option<&BringUpReport> {
        self.report.as_ref()
    }

    pub fn firmware(&self) -> Option<&FirmwareStatus> {
        self.firmware.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn channel(&mut self) -> Option<&mut McuChannel<'w, B, D>> {
        self.chan.as_mut()
    }

    pub fn summary(&self) -> Summary<'_> {
        Summary { state: self.state, report: self.report.as_ref(), firmware: self.firmware.as_ref() }
    }

    /// Stop WFDMA and free every DMA allocation. No chip reset is issued.
    pub fn detach(mut self) {
        self.teardown();
        info!(target: "init", "detach");
    }

    fn teardown(&mut self) {
        let Some(chan) = self.chan.take() else {
            return;
        };
        let glo = self
            .report
            .as_ref()
            .and_then(|r| r.glo_cfg)
            .or_else(|| self.cfg.regs.glo_cfg.first().copied());
        if let Some(reg) = glo {
            if let Err(e) = self.win.clear_bits(reg, GloCfg::ENABLE.bits()) {
                warn!(target: "init", "dma_stop_failed {}", e);
            }
        }
        chan.release(&self.alloc).free(&self.alloc);
        self.state = DeviceState::Attached;
    }
}

impl<B: Bar, D: DelayNs, A: DmaAllocator> Drop for Mt7927<'_, B, D, A> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Human-readable status report
pub struct Summary<'a> {
    state: DeviceState,
    report: Option<&'a BringUpReport>,
    firmware: Option<&'a FirmwareStatus>,
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "state: {:?}", self.state)?;
        let Some(report) = self.report else {
            return writeln!(f, "bring-up: not run");
        };

        match report.chip {
            Some(chip) => writeln!(f, "chip: {:#x} rev {:#x}", chip.chip_id, chip.rev)?,
            None => writeln!(f, "chip: unknown")?,
        }
        let awake = report.outcome(Phase::SubsystemWakeup).is_some_and(|r| r.is_ok());
        match report.conninfra_version {
            Some(v) => writeln!(f, "conninfra: {} version {:#010x}{}",
                if awake { "awake" } else { "asleep" }, v,
                if report.conninfra_known { "" } else { " (unknown)" })?,
            None => writeln!(f, "conninfra: {}", if awake { "awake" } else { "asleep" })?,
        }
        writeln!(f, "rom: {}", if report.rom_ready { "ready" } else { "not ready" })?;

        for p in &report.phases {
            match &p.result {
                Ok(()) => writeln!(f, "  {:<18} ok", p.phase.name())?,
                Err(e) => writeln!(f, "  {:<18} FAILED: {}", p.phase.name(), e)?,
            }
        }

        match self.firmware {
            Some(FirmwareStatus::Loaded(info)) => writeln!(f, "firmware: loaded, ram {} patch {:#x} ({:?})",
                info.ram_version, info.patch_version, info.patch),
            Some(FirmwareStatus::NotLoaded(e)) => writeln!(f, "firmware: not loaded ({})", e),
            None => writeln!(f, "firmware: not attempted"),
        }
    }
}
