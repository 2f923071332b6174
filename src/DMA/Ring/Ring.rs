// Views over the two DMA regions a channel owns: the descriptor ring the
// transfer engine fetches from and the completion queue it writes back to.

use crate::Core::alloc::DmaRegion;
use std::sync::Arc;

/// Completion entries per completion-queue row. One row is one 64-byte line.
pub const STS_ROW_ENTRIES: usize = 8;

/// Size of one completion entry in bytes.
pub const STS_ENTRY_SIZE: usize = 8;

/// Smallest ring the engine accepts: one wrap LINK, the reserved margin,
/// and at least two data slots.
pub const MIN_RING_CAPACITY: u32 = 4;

/// Largest ring the engine accepts.
pub const MAX_RING_CAPACITY: u32 = 1 << 16;

/// Write-position value meaning "no work". Positions wrap before reaching it.
pub const WP_NONE: u32 = u32::MAX;

/// Number of distinct write positions.
pub const WP_MODULUS: u64 = WP_NONE as u64;

/// Fixed-size circular array of descriptors in DMA memory.
///
/// The last slot always holds the wrap LINK. Slot 0, or any slot patched
/// during recovery, may temporarily hold a LINK as well.
pub struct DescriptorRing {
    pub(crate) region: Arc<DmaRegion>,
    pub(crate) capacity: u32,
}

/// Hardware-written log of completed descriptor bus addresses.
///
/// A zero entry is empty. Software zeroes each entry once it has been
/// matched so it can never be matched twice.
pub struct CompletionQueue {
    pub(crate) region: Arc<DmaRegion>,
    pub(crate) rows: u32,
}

unsafe impl Send for DescriptorRing {}
unsafe impl Sync for DescriptorRing {}
unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

/// Advance a write position by `n`, skipping [`WP_NONE`].
#[inline]
pub fn wp_add(wp: u32, n: u32) -> u32 {
    ((wp as u64 + n as u64) % WP_MODULUS) as u32
}

/// Number of positions from `from` forward to `to`.
#[inline]
pub fn wp_distance(from: u32, to: u32) -> u32 {
    ((to as u64 + WP_MODULUS - from as u64) % WP_MODULUS) as u32
}

/// True when `pos` is at or past `target`, across the wrap. Positions
/// more than half the modulus apart are taken to be behind.
#[inline]
pub fn wp_reached(pos: u32, target: u32) -> bool {
    (wp_distance(target, pos) as u64) < WP_MODULUS / 2
}
