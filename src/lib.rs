//! MT7927 / MT6639 PCIe WiFi bring-up and firmware download
//!
//! Polling-only, single-threaded driver core for the MediaTek MT7927
//! (MT6639 die). It takes the chip from power-on to "WM MCU running
//! downloaded firmware":
//!
//! ```text
//! attach ─► bring_up ─► load_firmware
//!            │             ├─ patch: SEM get → PATCH_START + FW_SCATTER… → FINISH → SEM release
//!            │             ├─ RAM:   TARGET_ADDRESS_LEN + FW_SCATTER… → FW_START
//!            │             └─ poll N9 ready
//!            └─ own handoff, WFSYS reset, ConnInfra wakeup, WFDMA setup, MCU rings
//! ```
//!
//! The host environment plugs in through four seams:
//!
//! - [`device::Bar`]: 32-bit MMIO on BAR0 ([`device::MmioBar`] for real hardware)
//! - [`dma::DmaAllocator`]: coherent DMA memory
//! - [`firmware::FirmwareProvider`]: firmware blobs by name
//! - `embedded_hal::delay::DelayNs`: the time source for every wait
//!
//! ## Testing
//!
//! Unit tests sit next to the code they cover. `tests/` drives the whole
//! sequence against a simulated MT6639 register file.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bringup;
pub mod config;
pub mod device;
pub mod dma;
pub mod driver;
pub mod error;
pub mod firmware;
pub mod loader;
pub mod mcu;
pub mod regs;

#[cfg(test)]
mod testutil;

pub use bringup::{BringUpReport, Phase, ReadyState};
pub use config::Config;
pub use device::{Bar, MmioBar, RegisterWindow};
pub use dma::{DmaAllocator, DmaBuffer};
pub use driver::{supports, DeviceState, Mt7927};
pub use error::{Error, ParseError, Result};
pub use firmware::{FirmwareProvider, FirmwareStore};
pub use loader::{FirmwareStatus, LoadError, LoadStage};
