//! Channel register map and the register access primitive.
//!
//! Offsets are relative to a single channel's control/status window. The
//! engine only ever performs 32-bit accesses.

use std::fmt::Debug;

/// Descriptor write count. Writing it is the doorbell.
pub const DMA_DWRCNT: u32 = 0x00;
/// Descriptor read count, advanced by the transfer engine.
pub const DMA_DRDCNT: u32 = 0x04;
/// Channel control.
pub const DMA_CTL: u32 = 0x08;
/// Channel status.
pub const DMA_STS: u32 = 0x0C;
/// Bus address of the descriptor being (or about to be) processed.
pub const DMA_DPTRL: u32 = 0x10;
pub const DMA_DPTRH: u32 = 0x14;
/// Descriptor ring base address. The engine starts fetching here after init.
pub const DMA_DSBL: u32 = 0x18;
pub const DMA_DSBH: u32 = 0x1C;
/// Descriptor ring size in entries.
pub const DMA_DSSZ: u32 = 0x20;
/// Completion queue base address.
pub const DMA_SBL: u32 = 0x24;
pub const DMA_SBH: u32 = 0x28;
/// Completion queue size in rows.
pub const DMA_SSZ: u32 = 0x2C;
/// Completion queue read pointer (rows), written by software.
pub const DMA_SRDP: u32 = 0x30;
/// Completion queue write pointer (rows), written by hardware.
pub const DMA_SWRP: u32 = 0x34;

/// Size of the register window in bytes.
pub const DMA_REG_SPAN: u32 = 0x38;

/// Reinitialize the channel: counters and completion pointers reset to zero
/// and fetching restarts at the descriptor base.
pub const DMA_CTL_INIT: u32 = 1 << 0;
/// Stop fetching after the current descriptor.
pub const DMA_CTL_SUSPEND: u32 = 1 << 1;

pub const DMA_STS_RUN: u32 = 1 << 21;
pub const DMA_STS_ABORT: u32 = 1 << 20;
pub const DMA_STS_SUSPENDED: u32 = 1 << 19;
pub const DMA_STS_CODE_MASK: u32 = 0x1F;

/// Abort codes reported in `DMA_STS_CODE_MASK`.
pub const ABORT_CODE_NONE: u32 = 0;
pub const ABORT_CODE_PCIE: u32 = 1;
pub const ABORT_CODE_TIMEOUT: u32 = 5;
pub const ABORT_CODE_RIO_ERR: u32 = 6;
pub const ABORT_CODE_IMPL_ERR: u32 = 7;

/// 32-bit register access against one channel's register window.
///
/// Real hardware implements this over a mapped BAR; the simulator keeps an
/// in-memory register file.
pub trait RegisterAccess: Send + Sync + Debug {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);

    fn read64(&self, lo: u32, hi: u32) -> u64 {
        (self.read32(lo) as u64) | ((self.read32(hi) as u64) << 32)
    }

    fn write64(&self, lo: u32, hi: u32, value: u64) {
        self.write32(hi, (value >> 32) as u32);
        self.write32(lo, value as u32);
    }
}
