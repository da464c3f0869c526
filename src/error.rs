//! Error types

use thiserror::Error;

use crate::regs::Reg;

/// Defects found while parsing a firmware image. Always reported before any
/// byte of the image has been transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("image too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("region {index} [{offset:#x}+{len:#x}] runs past the end of the image")]
    RegionOutOfBounds { index: usize, offset: usize, len: usize },
    #[error("region count {0} does not fit in the image")]
    BadRegionCount(u32),
    #[error("patch section {index} has unsupported type {kind:#x}")]
    BadSectionType { index: usize, kind: u32 },
    #[error("patch section {index} uses unsupported encryption {key:#010x}")]
    UnsupportedEncryption { index: usize, key: u32 },
    #[error("image has no payload")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("register offset {offset:#x} outside window of {len:#x} bytes")]
    OutOfBounds { offset: usize, len: usize },
    #[error("timed out after {ms} ms waiting for {what}")]
    Timeout { what: &'static str, ms: u32 },
    #[error("ring {0} is full")]
    RingFull(&'static str),
    #[error("invalid ring size {0}")]
    InvalidRingSize(u32),
    #[error("firmware image: {0}")]
    Parse(#[from] ParseError),
    #[error("DMA allocation of {0} bytes failed")]
    AllocationFailure(usize),
    #[error("firmware {0} not found")]
    FirmwareNotFound(alloc::string::String),
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("{reg} did not latch: read back {value:#010x}")]
    NotLatched { reg: Reg, value: u32 },
    #[error("{what} rejected with status {status}")]
    Rejected { what: &'static str, status: u8 },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("invalid parameter {0}")]
    InvalidParam(alloc::string::String),
}

pub type Result<T> = core::result::Result<T, Error>;
