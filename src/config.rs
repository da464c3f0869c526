//! Driver configuration
//!
//! Read once at attach. `Config::from_params` accepts the same knobs as
//! module parameters, as a whitespace separated `key=value` list.

use alloc::string::{String, ToString};

use crate::error::{Error, Result};
use crate::regs::{RegisterMap, MT6639_FIRMWARE_DIR, MT6639_FIRMWARE_PATCH, MT6639_FIRMWARE_RAM};

/// Per-phase wait budgets, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Each ownership poll (firmware own / driver own)
    pub own_ms: u32,
    /// Between the firmware-own and driver-own halves
    pub own_settle_ms: u32,
    /// WFSYS reset hold before RST_B is released
    pub reset_hold_ms: u32,
    pub reset_done_ms: u32,
    pub wakeup_ms: u32,
    pub rom_ready_ms: u32,
    /// TX/RX busy bits clearing during DMA disable
    pub dma_idle_ms: u32,
    pub cmd_drain_ms: u32,
    pub chunk_drain_ms: u32,
    pub event_ms: u32,
    /// Pause between the patch and the RAM image
    pub fw_settle_ms: u32,
    pub fw_ready_ms: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            own_ms: 50,
            own_settle_ms: 2,
            reset_hold_ms: 50,
            reset_done_ms: 500,
            wakeup_ms: 50,
            rom_ready_ms: 500,
            dma_idle_ms: 100,
            cmd_drain_ms: 1000,
            chunk_drain_ms: 1000,
            event_ms: 2000,
            fw_settle_ms: 100,
            fw_ready_ms: 3000,
        }
    }
}

/// Descriptor counts of the MCU rings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSizes {
    pub fwdl: u32,
    pub cmd: u32,
    pub event: u32,
    pub event_buf: u32,
}

impl Default for RingSizes {
    fn default() -> Self {
        Self { fwdl: 128, cmd: 256, event: 512, event_buf: 2048 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Trace every register access (log level `trace`, target `mmio`)
    pub trace_registers: bool,
    /// Also try the alternate WFSYS reset register
    pub try_alt_reset: bool,
    /// Skip the settle delay between ownership halves (no ASPM)
    pub disable_pm_delay: bool,
    /// Wait for the ROM code ready pattern during bring-up
    pub rom_ready_check: bool,
    pub own_retries: u32,
    /// Extra attempts for control commands that time out
    pub command_retries: u32,
    pub firmware_path: String,
    pub patch_name: String,
    pub ram_name: String,
    pub timeouts: Timeouts,
    pub rings: RingSizes,
    pub regs: RegisterMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace_registers: true,
            try_alt_reset: false,
            disable_pm_delay: false,
            rom_ready_check: true,
            own_retries: 10,
            command_retries: 1,
            firmware_path: MT6639_FIRMWARE_DIR.to_string(),
            patch_name: MT6639_FIRMWARE_PATCH.to_string(),
            ram_name: MT6639_FIRMWARE_RAM.to_string(),
            timeouts: Timeouts::default(),
            rings: RingSizes::default(),
            regs: RegisterMap::default(),
        }
    }
}

impl Config {
    pub fn from_params(params: &str) -> Result<Self> {
        let mut cfg = Self::default();
        for item in params.split_whitespace() {
            let (key, val) = item
                .split_once('=')
                .ok_or_else(|| Error::InvalidParam(item.to_string()))?;
            match key {
                "debug" => cfg.trace_registers = parse_bool(item, val)?,
                "try_alt_reset" => cfg.try_alt_reset = parse_bool(item, val)?,
                "disable_aspm" | "disable_pm_delay" => cfg.disable_pm_delay = parse_bool(item, val)?,
                "rom_ready_check" => cfg.rom_ready_check = parse_bool(item, val)?,
                "own_retries" => cfg.own_retries = parse_u32(item, val)?,
                "cmd_retries" => cfg.command_retries = parse_u32(item, val)?,
                "fw_ready_ms" => cfg.timeouts.fw_ready_ms = parse_u32(item, val)?,
                "fw_path" => cfg.firmware_path = val.trim_end_matches('/').to_string(),
                "fw_patch" => cfg.patch_name = val.to_string(),
                "fw_ram" => cfg.ram_name = val.to_string(),
                _ => return Err(Error::InvalidParam(item.to_string())),
            }
        }
        Ok(cfg)
    }

    /// `<firmware_path>/<name>`
    pub fn firmware_file(&self, name: &str) -> String {
        if self.firmware_path.is_empty() {
            return name.to_string();
        }
        let mut path = self.firmware_path.clone();
        path.push('/');
        path.push_str(name);
        path
    }
}

fn parse_bool(item: &str, val: &str) -> Result<bool> {
    match val {
        "1" | "y" | "Y" | "true" | "on" => Ok(true),
        "0" | "n" | "N" | "false" | "off" => Ok(false),
        _ => Err(Error::InvalidParam(item.to_string())),
    }
}

fn parse_u32(item: &str, val: &str) -> Result<u32> {
    let parsed = match val.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => val.parse(),
    };
    parsed.map_err(|_| Error::InvalidParam(item.to_string()))
}
