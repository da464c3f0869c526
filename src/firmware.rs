//! Firmware images: retrieval and container parsing
//!
//! Two containers are handled:
//!
//! - ROM patch: 32-byte header at byte 0. Either the payload follows the
//!   header directly (flat) or the header carries a descriptor and a table
//!   of 64-byte sections pointing into the file (sectioned). Big endian.
//! - RAM code: 36-byte trailer at the end, preceded by `n_region` 40-byte
//!   region records. Region payloads are packed from offset 0 in record
//!   order. Little endian.
//!
//! Parsing validates every offset and length up front, so a load never
//! starts on an image it cannot finish.

use alloc::borrow::Cow;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::debug;

use crate::error::{Error, ParseError, Result};
use crate::mcu::{dl_mode, fw_feature, gen_dl_mode};

// ============================================================================
// Provider
// ============================================================================

/// Where firmware blobs come from. `name` is the full relative path,
/// e.g. `mediatek/mt7925/WIFI_RAM_CODE_MT6639_2_1.bin`.
pub trait FirmwareProvider {
    fn load(&self, name: &str) -> Result<Cow<'_, [u8]>>;
}

impl<T: FirmwareProvider + ?Sized> FirmwareProvider for &T {
    fn load(&self, name: &str) -> Result<Cow<'_, [u8]>> {
        (**self).load(name)
    }
}

/// In-memory firmware, either linked in or handed over at runtime.
#[derive(Default)]
pub struct FirmwareStore {
    entries: Vec<(String, Cow<'static, [u8]>)>,
}

impl FirmwareStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_static(mut self, name: &str, data: &'static [u8]) -> Self {
        self.insert_cow(name, Cow::Borrowed(data));
        self
    }

    pub fn insert(&mut self, name: &str, data: Vec<u8>) {
        self.insert_cow(name, Cow::Owned(data));
    }

    fn insert_cow(&mut self, name: &str, data: Cow<'static, [u8]>) {
        self.entries.retain(|(n, _)| n != name);
        self.entries.push((name.to_string(), data));
    }
}

impl FirmwareProvider for FirmwareStore {
    fn load(&self, name: &str) -> Result<Cow<'_, [u8]>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| Cow::Borrowed(d.as_ref()))
            .ok_or_else(|| Error::FirmwareNotFound(name.to_string()))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn be32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn cstr(b: &[u8]) -> &str {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    core::str::from_utf8(&b[..end]).unwrap_or("")
}

fn slice(blob: &[u8], index: usize, offset: usize, len: usize, limit: usize) -> core::result::Result<&[u8], ParseError> {
    match offset.checked_add(len) {
        Some(end) if end <= limit => Ok(&blob[offset..end]),
        _ => Err(ParseError::RegionOutOfBounds { index, offset, len }),
    }
}

/// One address-declared payload: what TARGET_ADDRESS_LEN_REQ /
/// PATCH_START_REQ announces and FW_SCATTER then carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSegment<'a> {
    pub addr: u32,
    /// Download mode without NEED_RSP; the loader adds it
    pub mode: u32,
    pub data: &'a [u8],
}

// ============================================================================
// ROM patch
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchHeader {
    pub build_date: [u8; 16],
    pub platform: [u8; 4],
    pub hw_sw_ver: u32,
    pub patch_ver: u32,
    pub checksum: u16,
}

impl PatchHeader {
    pub const SIZE: usize = 32;

    fn parse(b: &[u8]) -> Self {
        let mut build_date = [0u8; 16];
        build_date.copy_from_slice(&b[0..16]);
        let mut platform = [0u8; 4];
        platform.copy_from_slice(&b[16..20]);
        Self {
            build_date,
            platform,
            hw_sw_ver: be32(b, 20),
            patch_ver: be32(b, 24),
            checksum: u16::from_be_bytes([b[28], b[29]]),
        }
    }

    pub fn build_date(&self) -> &str {
        cstr(&self.build_date)
    }

    pub fn platform(&self) -> &str {
        cstr(&self.platform)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchLayout {
    Flat,
    Sectioned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchImage<'a> {
    pub header: PatchHeader,
    pub layout: PatchLayout,
    pub segments: Vec<DownloadSegment<'a>>,
}

/// Header descriptor (patch_ver, subsys, feature, n_region, crc, rsv[11])
const PATCH_DESC_SIZE: usize = 64;
const PATCH_SEC_SIZE: usize = 64;
const PATCH_SEC_TYPE_INFO: u32 = 0x2;
const PATCH_MAX_SECTIONS: u32 = 16;

impl<'a> PatchImage<'a> {
    /// `patch_addr` is where a flat payload is loaded.
    pub fn parse(blob: &'a [u8], patch_addr: u32) -> core::result::Result<Self, ParseError> {
        if blob.len() < PatchHeader::SIZE {
            return Err(ParseError::Truncated { need: PatchHeader::SIZE, have: blob.len() });
        }
        let header = PatchHeader::parse(blob);

        let image = if Self::is_sectioned(blob) {
            Self { header, layout: PatchLayout::Sectioned, segments: Self::parse_sections(blob)? }
        } else {
            let data = &blob[PatchHeader::SIZE..];
            if data.is_empty() {
                return Err(ParseError::Empty);
            }
            Self {
                header,
                layout: PatchLayout::Flat,
                segments: alloc::vec![DownloadSegment { addr: patch_addr, mode: 0, data }],
            }
        };

        debug!(target: "fw", "patch_header hw={:#x} ver={:#x} platform={} date={} layout={:?} segments={}",
            header.hw_sw_ver, header.patch_ver, header.platform(), header.build_date(),
            image.layout, image.segments.len());
        Ok(image)
    }

    /// A descriptor with a plausible region count whose first section is an
    /// info section.
    fn is_sectioned(blob: &[u8]) -> bool {
        let table = PatchHeader::SIZE + PATCH_DESC_SIZE;
        if blob.len() < table + PATCH_SEC_SIZE {
            return false;
        }
        let n_region = be32(blob, PatchHeader::SIZE + 12);
        (1..=PATCH_MAX_SECTIONS).contains(&n_region)
            && be32(blob, table) & 0xffff == PATCH_SEC_TYPE_INFO
    }

    fn parse_sections(blob: &'a [u8]) -> core::result::Result<Vec<DownloadSegment<'a>>, ParseError> {
        let n_region = be32(blob, PatchHeader::SIZE + 12);
        let table = PatchHeader::SIZE + PATCH_DESC_SIZE;
        let table_end = table + n_region as usize * PATCH_SEC_SIZE;
        if table_end > blob.len() {
            return Err(ParseError::BadRegionCount(n_region));
        }

        let mut segments = Vec::with_capacity(n_region as usize);
        for i in 0..n_region as usize {
            let sec = &blob[table + i * PATCH_SEC_SIZE..table + (i + 1) * PATCH_SEC_SIZE];
            let kind = be32(sec, 0);
            if kind & 0xffff != PATCH_SEC_TYPE_INFO {
                return Err(ParseError::BadSectionType { index: i, kind });
            }
            let offs = be32(sec, 4) as usize;
            let addr = be32(sec, 12);
            let len = be32(sec, 16) as usize;
            let key = be32(sec, 20);

            let mode = match (key >> 24) & 0xff {
                0x00 => 0,
                0x01 => dl_mode::ENCRYPT | dl_mode::RESET_SEC_IV | ((key & 0x3) << 1),
                0x02 => dl_mode::ENCRYPT,
                _ => return Err(ParseError::UnsupportedEncryption { index: i, key }),
            };
            let data = slice(blob, i, offs, len, blob.len())?;
            segments.push(DownloadSegment { addr, mode, data });
        }
        Ok(segments)
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }
}

// ============================================================================
// RAM code
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwTrailer {
    pub chip_id: u8,
    pub eco_code: u8,
    pub n_region: u8,
    pub format_ver: u8,
    pub format_flag: u8,
    pub fw_ver: [u8; 10],
    pub build_date: [u8; 15],
    pub crc: u32,
}

impl FwTrailer {
    pub const SIZE: usize = 36;

    fn parse(b: &[u8]) -> Self {
        let mut fw_ver = [0u8; 10];
        fw_ver.copy_from_slice(&b[7..17]);
        let mut build_date = [0u8; 15];
        build_date.copy_from_slice(&b[17..32]);
        Self {
            chip_id: b[0],
            eco_code: b[1],
            n_region: b[2],
            format_ver: b[3],
            format_flag: b[4],
            fw_ver,
            build_date,
            crc: le32(b, 32),
        }
    }

    pub fn version(&self) -> &str {
        cstr(&self.fw_ver)
    }

    pub fn build_date(&self) -> &str {
        cstr(&self.build_date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwRegion {
    pub decomp_crc: u32,
    pub decomp_len: u32,
    pub decomp_blk_sz: u32,
    pub addr: u32,
    pub len: u32,
    pub feature_set: u8,
    pub region_type: u8,
}

impl FwRegion {
    pub const SIZE: usize = 40;

    fn parse(b: &[u8]) -> Self {
        Self {
            decomp_crc: le32(b, 0),
            decomp_len: le32(b, 4),
            decomp_blk_sz: le32(b, 8),
            addr: le32(b, 16),
            len: le32(b, 20),
            feature_set: b[24],
            region_type: b[25],
        }
    }

    pub fn is_override(&self) -> bool {
        self.feature_set & fw_feature::OVERRIDE_ADDR != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamImage<'a> {
    pub trailer: FwTrailer,
    pub regions: Vec<FwRegion>,
    data: Vec<&'a [u8]>,
}

impl<'a> RamImage<'a> {
    pub fn parse(blob: &'a [u8]) -> core::result::Result<Self, ParseError> {
        if blob.len() < FwTrailer::SIZE {
            return Err(ParseError::Truncated { need: FwTrailer::SIZE, have: blob.len() });
        }
        let trailer_off = blob.len() - FwTrailer::SIZE;
        let trailer = FwTrailer::parse(&blob[trailer_off..]);

        let n = trailer.n_region as usize;
        if n == 0 {
            return Err(ParseError::Empty);
        }
        let table_len = n * FwRegion::SIZE;
        if table_len > trailer_off {
            return Err(ParseError::BadRegionCount(n as u32));
        }
        let regions_start = trailer_off - table_len;

        let mut regions = Vec::with_capacity(n);
        let mut data = Vec::with_capacity(n);
        let mut offset = 0usize;
        for i in 0..n {
            let at = regions_start + i * FwRegion::SIZE;
            let region = FwRegion::parse(&blob[at..at + FwRegion::SIZE]);
            let payload = slice(blob, i, offset, region.len as usize, regions_start)?;
            offset += payload.len();
            regions.push(region);
            data.push(payload);
        }

        debug!(target: "fw", "ram_header chip_id={:#x} eco={} regions={} ver={} date={}",
            trailer.chip_id, trailer.eco_code, n, trailer.version(), trailer.build_date());
        Ok(Self { trailer, regions, data })
    }

    /// Regions in file order, with their download mode
    pub fn segments(&self) -> Vec<DownloadSegment<'a>> {
        self.regions
            .iter()
            .zip(&self.data)
            .map(|(r, d)| DownloadSegment {
                addr: r.addr,
                mode: gen_dl_mode(r.feature_set, false) & !dl_mode::NEED_RSP,
                data: d,
            })
            .collect()
    }

    /// Entry point from the last region flagged OVERRIDE_ADDR
    pub fn override_addr(&self) -> Option<u32> {
        self.regions.iter().filter(|r| r.is_override()).map(|r| r.addr).last()
    }
}
