pub mod SharedMemory;
pub mod alloc;
pub mod futex;
pub mod regs;
pub mod spinlock;

pub use SharedMemory::{
    attach_shared_memory, create_private_memory, create_shared_memory, unlink_shared_memory,
    RawHandle, SharedMemoryBackend,
};
pub use alloc::{
    bus_to_virt, bus_window_base, DmaAllocator, DmaRegion, PinnedBuffer, PrivateDmaAllocator,
    ShmDmaAllocator,
};
pub use regs::RegisterAccess;
pub use spinlock::{RawSpinLock, SpinGuard};
