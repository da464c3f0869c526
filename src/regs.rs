//! MT7927 / MT6639 register definitions
//!
//! Direct BAR0 offsets (WFDMA0, HIF remap) and chip-bus addresses that are
//! only reachable through the HIF remap window (CONN_INFRA, WFSYS, TOP).
//! The device-specific subset that bring-up touches is collected in
//! [`RegisterMap`], so a caller can swap in different addresses without
//! touching the state machine.

use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;

// ============================================================================
// PCI identity
// ============================================================================

pub const MT7927_VENDOR_ID: u16 = 0x14c3;
pub const MT7927_DEVICE_ID: u16 = 0x7927;
pub const MT6639_DEVICE_ID: u16 = 0x6639;

/// (vendor, device) pairs the driver binds to
pub const PCI_IDS: [(u16, u16); 2] = [
    (MT7927_VENDOR_ID, MT7927_DEVICE_ID),
    (MT7927_VENDOR_ID, MT6639_DEVICE_ID),
];

pub const MT6639_CHIP_ID: u32 = 0x6639;

// ============================================================================
// Register address
// ============================================================================

/// A register, either inside BAR0 or on the chip bus behind the remap window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Direct(u32),
    Remap(u32),
}

impl Reg {
    pub const fn addr(self) -> u32 {
        match self {
            Reg::Direct(a) | Reg::Remap(a) => a,
        }
    }
}

impl From<u32> for Reg {
    fn from(offset: u32) -> Self {
        Reg::Direct(offset)
    }
}

impl core::fmt::Display for Reg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Reg::Direct(a) => write!(f, "bar+{:#x}", a),
            Reg::Remap(a) => write!(f, "remap:{:#010x}", a),
        }
    }
}

// ============================================================================
// HIF remap (L1)
// ============================================================================

pub const MT_HIF_REMAP_L1: u32 = 0x1008c;
pub const MT_HIF_REMAP_L1_MASK: u32 = 0xffff_0000;
pub const MT_HIF_REMAP_L1_OFFSET: u32 = 0x0000_ffff;
pub const MT_HIF_REMAP_BASE: u32 = 0xe0000;
pub const MT_HIF_REMAP_SIZE: u32 = 0x10000;

/// Geometry of the L1 remap indirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapConfig {
    /// BAR offset of the base selector register
    pub selector: u32,
    /// BAR offset of the indirection window
    pub window_base: u32,
    pub window_size: u32,
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            selector: MT_HIF_REMAP_L1,
            window_base: MT_HIF_REMAP_BASE,
            window_size: MT_HIF_REMAP_SIZE,
        }
    }
}

// ============================================================================
// WFDMA0
// ============================================================================

pub const MT_WFDMA0_BASE: u32 = 0xd4000;

#[inline]
pub const fn mt_wfdma0(ofs: u32) -> u32 { MT_WFDMA0_BASE + ofs }

pub const MT_WFDMA0_RST: u32 = mt_wfdma0(0x100);
pub const MT_WFDMA0_RST_LOGIC_RST: u32 = 1 << 4;
pub const MT_WFDMA0_RST_DMASHDL_ALL_RST: u32 = 1 << 5;

pub const MT_WFDMA0_HOST_INT_STA: u32 = mt_wfdma0(0x200);
pub const MT_WFDMA0_HOST_INT_ENA: u32 = mt_wfdma0(0x204);
pub const MT_WFDMA0_GLO_CFG: u32 = mt_wfdma0(0x208);

pub const MT_WFDMA0_RST_DTX_PTR: u32 = mt_wfdma0(0x228);
pub const MT_WFDMA0_PRI_DLY_INT_CFG0: u32 = mt_wfdma0(0x238);
pub const MT_WFDMA0_RST_DRX_PTR: u32 = mt_wfdma0(0x260);

pub const MT_WFDMA0_GLO_CFG_EXT0: u32 = mt_wfdma0(0x2b0);
pub const MT_WFDMA0_GLO_CFG_EXT0_TX_DMASHDL_EN: u32 = 1 << 16;

pub const MT_WFDMA0_TX_RING_BASE: u32 = mt_wfdma0(0x300);
pub const MT_WFDMA0_RX_RING_BASE: u32 = mt_wfdma0(0x500);
pub const MT_RING_SIZE: u32 = 0x10;

/// Per-ring register offsets, relative to the ring's base
pub const MT_RING_DESC_BASE: u32 = 0x0;
pub const MT_RING_CNT: u32 = 0x4;
pub const MT_RING_CPU_IDX: u32 = 0x8;
pub const MT_RING_DMA_IDX: u32 = 0xc;

#[inline]
pub const fn mt_tx_ring(idx: u32) -> u32 { MT_WFDMA0_TX_RING_BASE + idx * MT_RING_SIZE }
#[inline]
pub const fn mt_rx_ring(idx: u32) -> u32 { MT_WFDMA0_RX_RING_BASE + idx * MT_RING_SIZE }

/// Hardware ring indices used for MCU traffic
pub const MT7927_TXQ_MCU_WM: u32 = 15;
pub const MT7927_TXQ_FWDL: u32 = 16;
pub const MT7927_RXQ_MCU_WM: u32 = 0;

bitflags! {
    /// WFDMA0 GLO_CFG
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GloCfg: u32 {
        const TX_DMA_EN = 1 << 0;
        const TX_DMA_BUSY = 1 << 1;
        const RX_DMA_EN = 1 << 2;
        const RX_DMA_BUSY = 1 << 3;
        const DMA_SIZE = 0x3 << 4;
        const TX_WB_DDONE = 1 << 6;
        const FIFO_LITTLE_ENDIAN = 1 << 12;
        const CSR_DISP_BASE_PTR_CHAIN_EN = 1 << 15;
        const OMIT_RX_INFO_PFET2 = 1 << 21;
        const OMIT_RX_INFO = 1 << 27;
        const OMIT_TX_INFO = 1 << 28;
        const CLK_GAT_DIS = 1 << 30;
    }
}

impl GloCfg {
    pub const ENABLE: Self = Self::TX_DMA_EN.union(Self::RX_DMA_EN);
    pub const BUSY: Self = Self::TX_DMA_BUSY.union(Self::RX_DMA_BUSY);

    /// Configuration bits programmed before the engines are enabled
    pub const SETUP: Self = Self::TX_WB_DDONE
        .union(Self::FIFO_LITTLE_ENDIAN)
        .union(Self::CLK_GAT_DIS)
        .union(Self::OMIT_TX_INFO)
        .union(Self::CSR_DISP_BASE_PTR_CHAIN_EN)
        .union(Self::OMIT_RX_INFO_PFET2)
        .union(Self::DMA_SIZE);
}

// ============================================================================
// PCIe MAC
// ============================================================================

pub const MT_PCIE_MAC_INT_ENABLE: u32 = 0x10188;
pub const MT_PCIE_MAC_INT_ENABLE_ALL: u32 = 0xff;

// ============================================================================
// CONN_INFRA / WFSYS (chip bus, via remap)
// ============================================================================

pub const CONNAC3X_CONN_CFG_ON_BASE: u32 = 0x7c06_0000;
pub const MT_CONN_ON_LPCTL: u32 = CONNAC3X_CONN_CFG_ON_BASE + 0x10;
pub const MT_CONN_ON_MISC: u32 = CONNAC3X_CONN_CFG_ON_BASE + 0xf0;
pub const MT_CONN_INFRA_WAKEUP: u32 = CONNAC3X_CONN_CFG_ON_BASE;
pub const MT_CONN_INFRA_WAKEUP_TRIGGER: u32 = 0x1;

/// TOP LPCR_HOST_BAND0 as seen from BAR0
pub const MT_TOP_LPCR_HOST_BAND0: u32 = 0xe0010;

bitflags! {
    /// LPCR_HOST ownership handshake
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Lpctl: u32 {
        const HOST_SET_OWN = 1 << 0;
        const HOST_CLR_OWN = 1 << 1;
        const HOST_OWN_SYNC = 1 << 2;
    }
}

/// Firmware (N9) ready pattern in CONN_ON_MISC
pub const MT_TOP_MISC2_FW_N9_RDY: u32 = 0x3;

pub const MT_WFSYS_SW_RST_B: u32 = 0x7c00_0140;
pub const MT_WFSYS_SW_RST_B_ALT: u32 = 0x7002_8600;
pub const WFSYS_SW_RST_B: u32 = 1 << 0;
pub const WFSYS_SW_INIT_DONE: u32 = 1 << 4;

pub const MT_HW_EMI_CTL: u32 = 0x1801_1100;
pub const MT_HW_EMI_CTL_SLPPROT_EN: u32 = 1 << 1;

pub const MT_DMASHDL_SW_CONTROL: u32 = 0x7c02_6004;
pub const MT_DMASHDL_DMASHDL_BYPASS: u32 = 1 << 0;

pub const CONN_INFRA_CFG_VERSION: u32 = 0x830c_0000;
pub const MT6639_CONNINFRA_VERSION_ID: u32 = 0x0301_0001;
pub const MT6639_CONNINFRA_VERSION_ID_E2: u32 = 0x0301_0002;

pub const WF_TOP_CFG_ON_ROMCODE_INDEX: u32 = 0x7c00_124c;
pub const ROM_CODE_READY_VALUE: u32 = 0x1d1e;

pub const CONNAC3X_TOP_HCR: u32 = 0x8800_0000;
pub const CONNAC3X_TOP_HVR: u32 = 0x8800_0004;
pub const MT_HW_CHIPID: u32 = 0x7001_0200;
pub const MT_HW_REV: u32 = 0x7001_0204;

// ============================================================================
// Firmware
// ============================================================================

pub const MT6639_PATCH_START_ADDR: u32 = 0x0090_0000;
pub const MT6639_FIRMWARE_DIR: &str = "mediatek/mt7925";
pub const MT6639_FIRMWARE_PATCH: &str = "WIFI_MT6639_PATCH_MCU_2_1_hdr.bin";
pub const MT6639_FIRMWARE_RAM: &str = "WIFI_RAM_CODE_MT6639_2_1.bin";

/// Max payload per FW_SCATTER message
pub const MCU_FW_DL_BUF_SIZE: usize = 4096;

// ============================================================================
// Register map
// ============================================================================

/// Device-specific register addresses used by bring-up and firmware load.
///
/// Logical registers whose location is uncertain carry an ordered list of
/// candidates; bring-up adopts the first one that responds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    pub remap: RemapConfig,
    pub lpctl: Vec<Reg>,
    pub wfsys_reset: Reg,
    pub wfsys_reset_alt: Reg,
    pub emi_ctl: Reg,
    pub conninfra_wakeup: Reg,
    pub conn_misc: Reg,
    pub conninfra_version: Reg,
    pub conninfra_versions: Vec<u32>,
    pub romcode_index: Reg,
    /// (chip id, revision) register pairs
    pub chip_id: Vec<(Reg, Reg)>,
    pub host_int_sta: Reg,
    pub host_int_ena: Reg,
    pub pcie_mac_int_ena: Reg,
    pub glo_cfg: Vec<Reg>,
    pub glo_cfg_ext0: Reg,
    pub wfdma_rst: Reg,
    pub dmashdl_sw_control: Reg,
    pub rst_dtx_ptr: Reg,
    pub rst_drx_ptr: Reg,
    pub pri_dly_int_cfg0: Reg,
    pub fwdl_ring: u32,
    pub cmd_ring: u32,
    pub event_ring: u32,
    pub fw_ready: Reg,
    pub patch_addr: u32,
}

impl RegisterMap {
    pub fn mt6639() -> Self {
        Self {
            remap: RemapConfig::default(),
            lpctl: vec![Reg::Remap(MT_CONN_ON_LPCTL), Reg::Direct(MT_TOP_LPCR_HOST_BAND0)],
            wfsys_reset: Reg::Remap(MT_WFSYS_SW_RST_B),
            wfsys_reset_alt: Reg::Remap(MT_WFSYS_SW_RST_B_ALT),
            emi_ctl: Reg::Remap(MT_HW_EMI_CTL),
            conninfra_wakeup: Reg::Remap(MT_CONN_INFRA_WAKEUP),
            conn_misc: Reg::Remap(MT_CONN_ON_MISC),
            conninfra_version: Reg::Remap(CONN_INFRA_CFG_VERSION),
            conninfra_versions: vec![MT6639_CONNINFRA_VERSION_ID, MT6639_CONNINFRA_VERSION_ID_E2],
            romcode_index: Reg::Remap(WF_TOP_CFG_ON_ROMCODE_INDEX),
            chip_id: vec![
                (Reg::Remap(CONNAC3X_TOP_HCR), Reg::Remap(CONNAC3X_TOP_HVR)),
                (Reg::Remap(MT_HW_CHIPID), Reg::Remap(MT_HW_REV)),
            ],
            host_int_sta: Reg::Direct(MT_WFDMA0_HOST_INT_STA),
            host_int_ena: Reg::Direct(MT_WFDMA0_HOST_INT_ENA),
            pcie_mac_int_ena: Reg::Direct(MT_PCIE_MAC_INT_ENABLE),
            glo_cfg: vec![Reg::Direct(MT_WFDMA0_GLO_CFG), Reg::Remap(0x7c02_4208)],
            glo_cfg_ext0: Reg::Direct(MT_WFDMA0_GLO_CFG_EXT0),
            wfdma_rst: Reg::Direct(MT_WFDMA0_RST),
            dmashdl_sw_control: Reg::Remap(MT_DMASHDL_SW_CONTROL),
            rst_dtx_ptr: Reg::Direct(MT_WFDMA0_RST_DTX_PTR),
            rst_drx_ptr: Reg::Direct(MT_WFDMA0_RST_DRX_PTR),
            pri_dly_int_cfg0: Reg::Direct(MT_WFDMA0_PRI_DLY_INT_CFG0),
            fwdl_ring: mt_tx_ring(MT7927_TXQ_FWDL),
            cmd_ring: mt_tx_ring(MT7927_TXQ_MCU_WM),
            event_ring: mt_rx_ring(MT7927_RXQ_MCU_WM),
            fw_ready: Reg::Remap(MT_CONN_ON_MISC),
            patch_addr: MT6639_PATCH_START_ADDR,
        }
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::mt6639()
    }
}

/// Split a device address into the low / high descriptor words
#[inline]
pub fn dma_addr_lo(addr: u64) -> u32 { addr as u32 }

#[inline]
pub fn dma_addr_hi(addr: u64) -> u32 { (addr >> 32) as u32 }
