use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::Ring::{CompletionQueue, DescriptorRing, STS_ENTRY_SIZE, STS_ROW_ENTRIES};
use crate::Core::alloc::DmaRegion;
use crate::DMA::Structs::Descriptor_Structs::{Descriptor, DESC_SIZE, INLINE_MAX};

impl DescriptorRing {
    /// Bytes of DMA memory needed for `capacity` descriptors.
    pub fn region_size(capacity: u32) -> usize {
        capacity as usize * DESC_SIZE
    }

    /// Create a ring view over an existing region.
    ///
    /// Returns `None` if the region is too small.
    pub fn new(region: Arc<DmaRegion>, capacity: u32) -> Option<Self> {
        if region.size() < Self::region_size(capacity) {
            return None;
        }
        Some(Self { region, capacity })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn bus_base(&self) -> u64 {
        self.region.bus_addr()
    }

    /// Index of the permanent wrap LINK.
    #[inline]
    pub fn wrap_idx(&self) -> u32 {
        self.capacity - 1
    }

    #[inline]
    pub fn next(&self, idx: u32) -> u32 {
        if idx + 1 == self.capacity {
            0
        } else {
            idx + 1
        }
    }

    #[inline]
    pub fn prev(&self, idx: u32) -> u32 {
        if idx == 0 {
            self.capacity - 1
        } else {
            idx - 1
        }
    }

    #[inline]
    pub fn slot_bus(&self, idx: u32) -> u64 {
        debug_assert!(idx < self.capacity);
        self.bus_base() + idx as u64 * DESC_SIZE as u64
    }

    /// Map a descriptor bus address back to its ring index.
    ///
    /// Rejects addresses below the base, past the end, or not on a slot
    /// boundary.
    pub fn index_of(&self, bus: u64) -> Option<u32> {
        let offset = bus.checked_sub(self.bus_base())?;
        if offset % DESC_SIZE as u64 != 0 {
            return None;
        }
        let idx = offset / DESC_SIZE as u64;
        if idx < self.capacity as u64 {
            Some(idx as u32)
        } else {
            None
        }
    }

    #[inline]
    unsafe fn slot_ptr(&self, idx: u32) -> *mut Descriptor {
        self.region.as_ptr().add(idx as usize * DESC_SIZE) as *mut Descriptor
    }

    pub fn read(&self, idx: u32) -> Descriptor {
        assert!(idx < self.capacity, "ring index {idx} out of range");
        unsafe { ptr::read_volatile(self.slot_ptr(idx)) }
    }

    pub fn write(&self, idx: u32, desc: &Descriptor) {
        assert!(idx < self.capacity, "ring index {idx} out of range");
        unsafe { ptr::write_volatile(self.slot_ptr(idx), *desc) }
    }

    /// Turn `idx` into a LINK that jumps to `target`.
    pub fn write_link(&self, idx: u32, target: u32) {
        self.write(idx, &Descriptor::link(self.slot_bus(target)));
    }

    /// Inline bytes deposited in a descriptor (read data for inline reads).
    pub fn read_inline(&self, idx: u32) -> [u8; INLINE_MAX] {
        self.read(idx).inline
    }

    /// Clear every slot and install the wrap LINK back to slot 0.
    pub fn reset(&self) {
        self.region.zero();
        self.write_link(self.wrap_idx(), 0);
    }
}

impl CompletionQueue {
    /// Bytes of DMA memory needed for `rows` completion rows.
    pub fn region_size(rows: u32) -> usize {
        rows as usize * STS_ROW_ENTRIES * STS_ENTRY_SIZE
    }

    pub fn new(region: Arc<DmaRegion>, rows: u32) -> Option<Self> {
        if rows == 0 || region.size() < Self::region_size(rows) {
            return None;
        }
        Some(Self { region, rows })
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn entries(&self) -> u32 {
        self.rows * STS_ROW_ENTRIES as u32
    }

    pub fn bus_base(&self) -> u64 {
        self.region.bus_addr()
    }

    #[inline]
    fn entry(&self, i: u32) -> &AtomicU64 {
        assert!(i < self.entries(), "completion entry {i} out of range");
        unsafe { &*(self.region.as_ptr().add(i as usize * STS_ENTRY_SIZE) as *const AtomicU64) }
    }

    /// Descriptor bus address stored in entry `i`, 0 when empty.
    pub fn load(&self, i: u32) -> u64 {
        self.entry(i).load(Ordering::Acquire)
    }

    /// Consume entry `i`.
    pub fn clear(&self, i: u32) {
        self.entry(i).store(0, Ordering::Release);
    }

    /// Entry-level write used by a software transfer engine.
    pub fn store(&self, i: u32, bus: u64) {
        self.entry(i).store(bus, Ordering::Release);
    }

    pub fn reset(&self) {
        self.region.zero();
    }

    #[inline]
    pub fn next(&self, i: u32) -> u32 {
        (i + 1) % self.entries()
    }
}
