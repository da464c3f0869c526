//! Firmware download state machine
//!
//! Patch:  SEM get → (PATCH_START_REQ + FW_SCATTER…)* → PATCH_FINISH_REQ → SEM release
//! RAM:    (TARGET_ADDRESS_LEN_REQ + FW_SCATTER…)* → FW_START_REQ
//! Then:   poll CONN_ON_MISC for N9 ready
//!
//! The patch semaphore is released on every path once acquisition was
//! attempted. Any failure aborts the load; the caller gets
//! `FirmwareStatus::NotLoaded` and the device stays attached.

use alloc::string::String;
use alloc::vec::Vec;

use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::Config;
use crate::device::Bar;
use crate::error::Error;
use crate::firmware::{DownloadSegment, FirmwareProvider, PatchImage, RamImage};
use crate::mcu::{
    dl_mode, fw_start, mcu_cmd, FwStartRequest, InitDlRequest, McuChannel, McuEvent, PatchSemOp,
    PatchSemStatus,
};
use crate::regs::{MCU_FW_DL_BUF_SIZE, MT_TOP_MISC2_FW_N9_RDY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Fetch,
    AcquireSemaphore,
    DeclareTarget,
    TransferChunks,
    Finalize,
    ReleaseSemaphore,
    StartExecution,
    AwaitReady,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("firmware load failed at {stage:?}: {error}")]
pub struct LoadError {
    pub stage: LoadStage,
    pub error: Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Loaded,
    /// ROM reported the patch as already present; transfer skipped
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub patch: PatchOutcome,
    pub patch_version: u32,
    pub ram_version: String,
    pub chip_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareStatus {
    Loaded(FirmwareInfo),
    NotLoaded(LoadError),
}

impl FirmwareStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, FirmwareStatus::Loaded(_))
    }
}

pub struct FirmwareLoader<'a, 'w, B, D> {
    chan: &'a mut McuChannel<'w, B, D>,
    cfg: &'a Config,
    journal: Vec<LoadStage>,
}

impl<'a, 'w, B: Bar, D: DelayNs> FirmwareLoader<'a, 'w, B, D> {
    pub fn new(chan: &'a mut McuChannel<'w, B, D>, cfg: &'a Config) -> Self {
        Self { chan, cfg, journal: Vec::new() }
    }

    /// Stages entered so far, in order
    pub fn journal(&self) -> &[LoadStage] {
        &self.journal
    }

    fn enter(&mut self, stage: LoadStage) {
        debug!(target: "fw", "stage {:?}", stage);
        self.journal.push(stage);
    }

    /// Fetch and parse both images, then download patch and RAM code and
    /// wait for the firmware to come up.
    pub fn run<P: FirmwareProvider + ?Sized>(&mut self, provider: &P) -> FirmwareStatus {
        info!(target: "fw", "load_firmware_start");
        match self.run_inner(provider) {
            Ok(info) => {
                info!(target: "fw", "load_firmware_done patch={:?} ram_ver={}", info.patch, info.ram_version);
                FirmwareStatus::Loaded(info)
            }
            Err(e) => {
                error!(target: "fw", "load_firmware_failed {}", e);
                FirmwareStatus::NotLoaded(e)
            }
        }
    }

    fn run_inner<P: FirmwareProvider + ?Sized>(&mut self, provider: &P) -> Result<FirmwareInfo, LoadError> {
        self.enter(LoadStage::Fetch);
        let fetch = |e: Error| LoadError { stage: LoadStage::Fetch, error: e };

        let patch_name = self.cfg.firmware_file(&self.cfg.patch_name);
        let ram_name = self.cfg.firmware_file(&self.cfg.ram_name);
        let patch_blob = provider.load(&patch_name).map_err(fetch)?;
        let ram_blob = provider.load(&ram_name).map_err(fetch)?;

        let patch = PatchImage::parse(&patch_blob, self.cfg.regs.patch_addr).map_err(|e| fetch(e.into()))?;
        let ram = RamImage::parse(&ram_blob).map_err(|e| fetch(e.into()))?;
        info!(target: "fw", "images patch={} ({} bytes) ram={} ({} bytes, {} regions)",
            patch_name, patch_blob.len(), ram_name, ram_blob.len(), ram.regions.len());

        let dev = self.chan.dev();
        debug!(target: "fw", "fw_state_before val={:#x}", dev.read(self.cfg.regs.fw_ready));

        let outcome = self.load_patch(&patch)?;
        dev.delay_ms(self.cfg.timeouts.fw_settle_ms);
        self.load_ram(&ram)?;
        self.await_ready()?;

        Ok(FirmwareInfo {
            patch: outcome,
            patch_version: patch.header.patch_ver,
            ram_version: String::from(ram.trailer.version()),
            chip_id: ram.trailer.chip_id,
        })
    }

    // ========================================================================
    // Patch
    // ========================================================================

    pub fn load_patch(&mut self, image: &PatchImage<'_>) -> Result<PatchOutcome, LoadError> {
        info!(target: "fw", "load_patch_start segments={} bytes={}", image.segments.len(), image.total_len());

        self.enter(LoadStage::AcquireSemaphore);
        let result = match self.command(LoadStage::AcquireSemaphore, mcu_cmd::PATCH_SEM_CTRL, &PatchSemOp::Get.to_bytes()) {
            Err(e) => Err(e),
            Ok(ev) => match ev.as_ref().and_then(McuEvent::sem_status) {
                Some(PatchSemStatus::AlreadyDownloaded) => {
                    info!(target: "fw", "patch_already_downloaded");
                    Ok(PatchOutcome::AlreadyPresent)
                }
                Some(PatchSemStatus::NotDownloadedSemFail) => Err(LoadError {
                    stage: LoadStage::AcquireSemaphore,
                    error: Error::Rejected { what: "patch semaphore", status: 0 },
                }),
                status => {
                    debug!(target: "fw", "patch_sem status={:?}", status);
                    self.patch_body(image).map(|()| PatchOutcome::Loaded)
                }
            },
        };

        self.enter(LoadStage::ReleaseSemaphore);
        let released = self.command(LoadStage::ReleaseSemaphore, mcu_cmd::PATCH_SEM_CTRL, &PatchSemOp::Release.to_bytes());

        match (result, released) {
            (Ok(outcome), Ok(_)) => {
                info!(target: "fw", "load_patch_done outcome={:?}", outcome);
                Ok(outcome)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(rel)) => {
                warn!(target: "fw", "patch_sem_release_failed {}", rel);
                Err(e)
            }
            (Err(e), Ok(_)) => Err(e),
        }
    }

    fn patch_body(&mut self, image: &PatchImage<'_>) -> Result<(), LoadError> {
        for (i, seg) in image.segments.iter().enumerate() {
            debug!(target: "fw", "patch_region idx={} addr={:#x} len={} mode={:#x}",
                i, seg.addr, seg.data.len(), seg.mode);
            self.download(seg)?;
        }
        self.enter(LoadStage::Finalize);
        self.command(LoadStage::Finalize, mcu_cmd::PATCH_FINISH_REQ, &[])?;
        Ok(())
    }

    // ========================================================================
    // RAM code
    // ========================================================================

    pub fn load_ram(&mut self, image: &RamImage<'_>) -> Result<(), LoadError> {
        info!(target: "fw", "load_ram_start regions={} ver={}", image.regions.len(), image.trailer.version());

        for (i, seg) in image.segments().iter().enumerate() {
            debug!(target: "fw", "ram_region idx={} addr={:#x} len={} mode={:#x}",
                i, seg.addr, seg.data.len(), seg.mode);
            self.download(seg)?;
        }

        self.enter(LoadStage::StartExecution);
        let override_addr = image.override_addr();
        let req = FwStartRequest {
            option: if override_addr.is_some() { fw_start::OVERRIDE } else { 0 },
            addr: override_addr.unwrap_or(0),
        };
        debug!(target: "fw", "fw_start option={:#x} addr={:#x}", req.option, req.addr);
        self.command(LoadStage::StartExecution, mcu_cmd::FW_START_REQ, &req.to_bytes())?;

        info!(target: "fw", "load_ram_done");
        Ok(())
    }

    // ========================================================================
    // Shared steps
    // ========================================================================

    fn download(&mut self, seg: &DownloadSegment<'_>) -> Result<(), LoadError> {
        self.enter(LoadStage::DeclareTarget);
        self.declare_target(seg.addr, seg.data.len() as u32, seg.mode)?;

        self.enter(LoadStage::TransferChunks);
        self.transfer(seg.data)
    }

    /// PATCH_START_REQ for the patch address, TARGET_ADDRESS_LEN_REQ
    /// otherwise. Always asks for a response.
    pub fn declare_target(&mut self, addr: u32, len: u32, mode: u32) -> Result<(), LoadError> {
        let cid = if addr == self.cfg.regs.patch_addr {
            mcu_cmd::PATCH_START_REQ
        } else {
            mcu_cmd::TARGET_ADDRESS_LEN_REQ
        };
        let req = InitDlRequest { addr, len, mode: mode | dl_mode::NEED_RSP };
        self.command(LoadStage::DeclareTarget, cid, &req.to_bytes())?;
        Ok(())
    }

    /// FW_SCATTER in 4096-byte chunks. Any failed chunk is fatal.
    pub fn transfer(&mut self, data: &[u8]) -> Result<(), LoadError> {
        for (i, chunk) in data.chunks(MCU_FW_DL_BUF_SIZE).enumerate() {
            if let Err(e) = self.chan.send_firmware_chunk(chunk) {
                error!(target: "fw", "chunk_failed idx={} len={} {}", i, chunk.len(), e);
                return Err(LoadError { stage: LoadStage::TransferChunks, error: e });
            }
        }
        Ok(())
    }

    /// Poll for the N9 ready pattern.
    pub fn await_ready(&mut self) -> Result<(), LoadError> {
        self.enter(LoadStage::AwaitReady);
        let dev = self.chan.dev();
        let reg = self.cfg.regs.fw_ready;
        let ms = self.cfg.timeouts.fw_ready_ms;
        match dev.poll_with(reg, ms, |v| v & MT_TOP_MISC2_FW_N9_RDY == MT_TOP_MISC2_FW_N9_RDY) {
            Ok(v) => {
                info!(target: "fw", "fw_ready val={:#x}", v);
                Ok(())
            }
            Err(v) => {
                error!(target: "fw", "fw_ready_timeout val={:#x} timeout_ms={}", v, ms);
                Err(LoadError { stage: LoadStage::AwaitReady, error: Error::Timeout { what: "firmware ready", ms } })
            }
        }
    }

    /// Send a control command, retrying on drain timeout, and collect its
    /// response if one arrives. A missing response is not an error.
    fn command(&mut self, stage: LoadStage, cid: u8, payload: &[u8]) -> Result<Option<McuEvent>, LoadError> {
        let mut attempt = 0;
        let seq = loop {
            match self.chan.send_command(cid, payload) {
                Ok(seq) => break seq,
                Err(e @ Error::Timeout { .. }) if attempt < self.cfg.command_retries => {
                    attempt += 1;
                    warn!(target: "fw", "cmd_retry cid={:#04x} attempt={} {}", cid, attempt, e);
                }
                Err(e) => return Err(LoadError { stage, error: e }),
            }
        };

        let ev = self.chan.wait_for_response(seq, self.cfg.timeouts.event_ms);
        if ev.is_none() {
            warn!(target: "fw", "no_response cid={:#04x} seq={}", cid, seq);
        }
        Ok(ev)
    }
}
