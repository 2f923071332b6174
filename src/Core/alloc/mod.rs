use crate::Core::SharedMemory::{
    attach_shared_memory, create_private_memory, create_shared_memory, unlink_shared_memory,
    SharedMemoryBackend,
};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
mod debug;
mod getters;

/// Spacing between synthetic bus addresses; also the largest region the
/// shared-memory allocator hands out.
pub const BUS_STRIDE: u64 = 1 << 24;

lazy_static! {
    /// First synthetic bus address for this process. The pid is folded in so
    /// regions created by different processes never collide.
    static ref BUS_BASE: u64 = (std::process::id() as u64 + 1) << 36;

    /// Bus address -> virtual mappings live in this process.
    static ref BUS_MAP: Mutex<BTreeMap<u64, Vec<BusWindow>>> = Mutex::new(BTreeMap::new());
}

static NEXT_BUS_SLOT: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug)]
struct BusWindow {
    virt: usize,
    size: usize,
}

fn register_window(bus: u64, virt: *mut u8, size: usize) {
    BUS_MAP.lock().entry(bus).or_default().push(BusWindow {
        virt: virt as usize,
        size,
    });
}

fn unregister_window(bus: u64, virt: *mut u8) {
    let mut map = BUS_MAP.lock();
    if let Some(windows) = map.get_mut(&bus) {
        windows.retain(|w| w.virt != virt as usize);
        if windows.is_empty() {
            map.remove(&bus);
        }
    }
}

/// Translate a bus address range to a pointer in this process.
///
/// Returns `None` when no live region mapped in this process covers
/// `[bus, bus + len)`. The pointer is only valid while the region that
/// registered it is alive.
pub fn bus_to_virt(bus: u64, len: usize) -> Option<*mut u8> {
    let map = BUS_MAP.lock();
    let (&base, windows) = map.range(..=bus).next_back()?;
    let window = windows.last()?;
    let offset = bus.checked_sub(base)? as usize;
    let end = offset.checked_add(len)?;
    if end > window.size {
        return None;
    }
    Some((window.virt + offset) as *mut u8)
}

/// Handle to caller memory that has been registered for BULK transfers.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PinnedBuffer {
    pub bus_addr: u64,
    pub size: u64,
    pub offset: u64,
}

impl PinnedBuffer {
    /// Bus address the transfer engine reads from / writes to.
    pub fn transfer_addr(&self) -> u64 {
        self.bus_addr + self.offset
    }
}

/// Contiguous DMA-capable memory: a mapping plus the bus address the
/// transfer engine uses to reach it.
pub struct DmaRegion {
    mem: Box<dyn SharedMemoryBackend>,
    bus_addr: u64,
    size: usize,
    /// Set when this handle created the backing object and must remove it.
    owned_name: Option<String>,
}

impl DmaRegion {
    /// Wrap an existing mapping. The region is registered for bus
    /// translation until dropped.
    pub fn new(mem: Box<dyn SharedMemoryBackend>, bus_addr: u64, size: usize) -> Self {
        register_window(bus_addr, mem.as_ptr(), size);
        Self {
            mem,
            bus_addr,
            size,
            owned_name: None,
        }
    }

    fn with_owned_name(mut self, name: String) -> Self {
        self.owned_name = Some(name);
        self
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mem.as_ptr()
    }

    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Describe `[offset, offset + len)` of this region as a BULK buffer.
    pub fn pin(&self, offset: usize, len: usize) -> io::Result<PinnedBuffer> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size && len > 0 => Ok(PinnedBuffer {
                bus_addr: self.bus_addr,
                size: len as u64,
                offset: offset as u64,
            }),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "pin [{offset}, +{len}) outside region of {} bytes",
                    self.size
                ),
            )),
        }
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> io::Result<()> {
        self.check_range(offset, data.len())?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> io::Result<()> {
        self.check_range(offset, out.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    pub fn zero(&self) {
        unsafe { ptr::write_bytes(self.as_ptr(), 0, self.size) };
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("access [{offset}, +{len}) outside region of {} bytes", self.size),
            )),
        }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        unregister_window(self.bus_addr, self.mem.as_ptr());
        if let Some(name) = self.owned_name.take() {
            if let Err(e) = unlink_shared_memory(&name) {
                log::warn!("dma: failed to unlink {}: {}", name, e);
            }
        }
    }
}

unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

/// Source of DMA-capable memory.
pub trait DmaAllocator: Send + Sync + std::fmt::Debug {
    /// Allocate `size` zeroed bytes of physically addressable memory.
    fn alloc(&self, size: usize) -> io::Result<DmaRegion>;

    /// Map a region previously allocated (possibly by another process).
    fn map(&self, bus_addr: u64, size: usize) -> io::Result<DmaRegion>;
}

fn next_bus_addr(size: usize) -> io::Result<u64> {
    if size == 0 || size as u64 > BUS_STRIDE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("DMA allocation of {size} bytes outside (0, {BUS_STRIDE}]"),
        ));
    }
    let slot = NEXT_BUS_SLOT.fetch_add(1, Ordering::Relaxed);
    Ok(*BUS_BASE + slot * BUS_STRIDE)
}

/// Bus window base that contains `bus`.
pub fn bus_window_base(bus: u64) -> u64 {
    bus & !(BUS_STRIDE - 1)
}

/// Allocator for memory that only this process touches. Regions are
/// anonymous mappings and cannot be mapped by bus address elsewhere.
#[derive(Debug, Clone, Default)]
pub struct PrivateDmaAllocator;

impl DmaAllocator for PrivateDmaAllocator {
    fn alloc(&self, size: usize) -> io::Result<DmaRegion> {
        let bus_addr = next_bus_addr(size)?;
        let mem = create_private_memory(size)?;
        log::debug!("dma: private region of {} bytes at bus {:#x}", size, bus_addr);
        Ok(DmaRegion::new(mem, bus_addr, size))
    }

    fn map(&self, bus_addr: u64, _size: usize) -> io::Result<DmaRegion> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("private DMA region {bus_addr:#x} cannot be mapped from another handle"),
        ))
    }
}

/// Allocator backing every region with a named /dev/shm object so that
/// other processes can map the same bus address.
#[derive(Debug, Clone)]
pub struct ShmDmaAllocator {
    prefix: String,
}

impl Default for ShmDmaAllocator {
    fn default() -> Self {
        Self {
            prefix: "fdma_".to_string(),
        }
    }
}

impl ShmDmaAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn region_name(&self, bus_addr: u64) -> String {
        format!("{}{:x}", self.prefix, bus_addr)
    }
}

impl DmaAllocator for ShmDmaAllocator {
    fn alloc(&self, size: usize) -> io::Result<DmaRegion> {
        let bus_addr = next_bus_addr(size)?;
        let name = self.region_name(bus_addr);

        let mem = create_shared_memory(size, &name).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "Failed to allocate DMA memory:\n\
                    ├─ Bus address: {bus_addr:#x}\n\
                    ├─ Size:        {size}\n\
                    ╰─ Error: {e}"
                ),
            )
        })?;

        log::debug!("dma: allocated {} bytes at bus {:#x}", size, bus_addr);
        Ok(DmaRegion::new(mem, bus_addr, size).with_owned_name(name))
    }

    /// A `size` of 0 maps the whole object.
    fn map(&self, bus_addr: u64, size: usize) -> io::Result<DmaRegion> {
        let mem = attach_shared_memory(&self.region_name(bus_addr), size)?;
        let size = if size == 0 { mem.size() } else { size };
        Ok(DmaRegion::new(mem, bus_addr, size))
    }
}
