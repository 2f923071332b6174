// Versioned, fixed-layout channel state. The same record backs both the
// in-process channel (anonymous mapping) and the cross-process channel
// (named /dev/shm object). It holds only plain data, indices and bus
// addresses; every process derives its own pointers from its own mapping.
//
// Lock order: submit_lock, then busy_lock. The scanner only ever takes
// busy_lock. Nothing holds busy_lock while waiting on anything else.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::io;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::Core::alloc::PinnedBuffer;
use crate::Core::spinlock::{RawSpinLock, SpinGuard};
use crate::Core::SharedMemory::SharedMemoryBackend;
use crate::DMA::mailbox::CompletionMailbox;
use crate::DMA::Structs::Descriptor_Structs::{
    DescKind, DmaOpcode, DmaRequest, Owner, SubmitMode, INLINE_MAX,
};

pub const LAYOUT_MAGIC: u64 = 0x4644_4D41_4348_414E; // "FDMACHAN"
pub const LAYOUT_VERSION: u32 = 1;

/// Upper bound on client processes attached to one channel.
pub const MAX_CLIENTS: u32 = 64;

/// `TrackState::plan_origin` when no non-destructive restart is staged.
pub const NO_PLAN: u32 = u32::MAX;

const LAYOUT_ALIGN: usize = 128;

#[inline]
fn align_up(n: usize) -> usize {
    (n + LAYOUT_ALIGN - 1) & !(LAYOUT_ALIGN - 1)
}

/// Submission-path state, guarded by `submit_lock`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SubmitState {
    /// Next ring slot to fill.
    pub write_idx: u32,
    /// Write position handed to the engine with the doorbell.
    pub wp: u32,
    pub next_ticket: u64,
}

/// Completion-tracking state, guarded by `busy_lock`.
#[repr(C)]
#[derive(Debug)]
pub struct TrackState {
    /// Next completion entry to examine.
    pub sts_rd: u32,
    /// Slot the engine restarts from after `cleanup_bd_queue`.
    pub plan_origin: u32,
    /// Write position to program with that restart.
    pub plan_wp: u32,
    /// Submit-side write position when the plan was staged.
    pub plan_base: u32,
}

impl TrackState {
    pub fn clear_plan(&mut self) {
        self.plan_origin = NO_PLAN;
        self.plan_wp = 0;
        self.plan_base = 0;
    }

    pub fn has_plan(&self) -> bool {
        self.plan_origin != NO_PLAN
    }
}

#[repr(C)]
pub struct ChannelStatsBlock {
    pub submitted: CachePadded<AtomicU64>,
    pub completed: CachePadded<AtomicU64>,
    pub faulted: CachePadded<AtomicU64>,
    pub desync: CachePadded<AtomicU64>,
    pub restarts: CachePadded<AtomicU64>,
}

impl ChannelStatsBlock {
    fn new() -> Self {
        Self {
            submitted: CachePadded::new(AtomicU64::new(0)),
            completed: CachePadded::new(AtomicU64::new(0)),
            faulted: CachePadded::new(AtomicU64::new(0)),
            desync: CachePadded::new(AtomicU64::new(0)),
            restarts: CachePadded::new(AtomicU64::new(0)),
        }
    }
}

/// Header at offset 0 of the channel region.
#[repr(C, align(128))]
pub struct ChannelHeader {
    pub magic: u64,
    pub version: u32,
    pub capacity: u32,
    pub sts_rows: u32,
    pub max_clients: u32,
    pub mailbox_capacity: u32,
    pub port_id: u32,
    pub channel_id: u32,
    pub _rsvd: u32,
    pub ring_bus: u64,
    pub sts_bus: u64,
    pub busy_off: u64,
    pub pending_off: u64,
    pub clients_off: u64,
    pub mailbox_off: u64,
    pub mailbox_stride: u64,
    pub total_size: u64,

    /// Pid of the process that programs the hardware.
    pub master_pid: AtomicU32,
    /// Non-zero while a restart owns the ring; the scanner stands off.
    pub restart_in_progress: AtomicU32,
    pub closed: AtomicU32,
    /// Busy data slots. Mutated only under `busy_lock`.
    pub busy_count: AtomicU32,
    /// Latest write position published by any submitter.
    pub doorbell_wp: AtomicU32,
    /// Bumped by every restart so an in-flight scan can notice one.
    pub restart_gen: AtomicU64,

    pub submit_lock: RawSpinLock,
    pub busy_lock: RawSpinLock,
    submit: UnsafeCell<SubmitState>,
    track: UnsafeCell<TrackState>,

    pub stats: ChannelStatsBlock,
}

/// One row of the pending-work table.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct PendingSlot {
    pub valid: u32,
    pub mode: u8,
    pub _pad: [u8; 3],
    pub owner: Owner,
    pub ticket: u64,
    pub wp: u32,
    pub idx: u32,
    pub submitted_ns: u64,
    pub request: DmaRequest,
}

impl PendingSlot {
    pub const EMPTY: Self = Self {
        valid: 0,
        mode: SubmitMode::FireAndForget as u8,
        _pad: [0; 3],
        owner: Owner {
            client: 0,
            pid: 0,
            tid: 0,
        },
        ticket: 0,
        wp: 0,
        idx: 0,
        submitted_ns: 0,
        request: DmaRequest {
            opcode: DmaOpcode::Read,
            kind: DescKind::Inline,
            dest_id: 0,
            len: 0,
            raddr: 0,
            buffer: PinnedBuffer {
                bus_addr: 0,
                size: 0,
                offset: 0,
            },
            inline: [0; INLINE_MAX],
        },
    };

    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }

    pub fn mode(&self) -> SubmitMode {
        SubmitMode::from_raw(self.mode)
    }
}

/// One row of the client table.
#[repr(C, align(64))]
pub struct ClientEntry {
    /// 0 when the row is free.
    pub pid: AtomicU32,
    pub tid: AtomicU32,
    /// Bumped every time the row is claimed.
    pub generation: AtomicU32,
    pub attached_ns: AtomicU64,
}

impl ClientEntry {
    fn new() -> Self {
        Self {
            pid: AtomicU32::new(0),
            tid: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            attached_ns: AtomicU64::new(0),
        }
    }

    pub fn is_free(&self) -> bool {
        self.pid.load(Ordering::Acquire) == 0
    }
}

/// Sizing inputs for a channel region.
#[derive(Debug, Clone, Copy)]
pub struct LayoutParams {
    pub capacity: u32,
    pub sts_rows: u32,
    pub max_clients: u32,
    pub mailbox_capacity: u32,
    pub port_id: u32,
    pub channel_id: u32,
    pub ring_bus: u64,
    pub sts_bus: u64,
}

#[derive(Debug, Clone, Copy)]
struct Offsets {
    busy: usize,
    pending: usize,
    clients: usize,
    mailboxes: usize,
    mailbox_stride: usize,
    total: usize,
}

impl LayoutParams {
    fn offsets(&self) -> Offsets {
        let busy = align_up(size_of::<ChannelHeader>());
        let pending = align_up(busy + self.capacity as usize);
        let clients = align_up(pending + self.capacity as usize * size_of::<PendingSlot>());
        let mailboxes = align_up(clients + self.max_clients as usize * size_of::<ClientEntry>());
        let mailbox_stride = if self.max_clients > 0 {
            align_up(CompletionMailbox::region_size(self.mailbox_capacity as usize))
        } else {
            0
        };
        let total = mailboxes + self.max_clients as usize * mailbox_stride;
        Offsets {
            busy,
            pending,
            clients,
            mailboxes,
            mailbox_stride,
            total,
        }
    }
}

/// Process-local view of a channel region.
pub struct ChannelLayout {
    mem: Box<dyn SharedMemoryBackend>,
    header: *mut ChannelHeader,
}

unsafe impl Send for ChannelLayout {}
unsafe impl Sync for ChannelLayout {}

impl ChannelLayout {
    pub fn required_size(params: &LayoutParams) -> usize {
        params.offsets().total
    }

    /// Write a fresh layout into `mem`.
    pub fn init(mem: Box<dyn SharedMemoryBackend>, params: &LayoutParams) -> io::Result<Self> {
        let off = params.offsets();
        if mem.size() < off.total {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "ChannelLayout::init(): region too small. Have: {}, Needed: {}",
                    mem.size(),
                    off.total
                ),
            ));
        }
        if params.max_clients > MAX_CLIENTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("at most {MAX_CLIENTS} clients per channel"),
            ));
        }

        let base = mem.as_ptr();
        let header = base as *mut ChannelHeader;
        if (header as usize) % LAYOUT_ALIGN != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Shared memory not properly aligned",
            ));
        }

        unsafe {
            ptr::write(
                header,
                ChannelHeader {
                    magic: 0,
                    version: LAYOUT_VERSION,
                    capacity: params.capacity,
                    sts_rows: params.sts_rows,
                    max_clients: params.max_clients,
                    mailbox_capacity: params.mailbox_capacity,
                    port_id: params.port_id,
                    channel_id: params.channel_id,
                    _rsvd: 0,
                    ring_bus: params.ring_bus,
                    sts_bus: params.sts_bus,
                    busy_off: off.busy as u64,
                    pending_off: off.pending as u64,
                    clients_off: off.clients as u64,
                    mailbox_off: off.mailboxes as u64,
                    mailbox_stride: off.mailbox_stride as u64,
                    total_size: off.total as u64,
                    master_pid: AtomicU32::new(std::process::id()),
                    restart_in_progress: AtomicU32::new(0),
                    closed: AtomicU32::new(0),
                    busy_count: AtomicU32::new(0),
                    doorbell_wp: AtomicU32::new(0),
                    restart_gen: AtomicU64::new(0),
                    submit_lock: RawSpinLock::new(),
                    busy_lock: RawSpinLock::new(),
                    submit: UnsafeCell::new(SubmitState::default()),
                    track: UnsafeCell::new(TrackState {
                        sts_rd: 0,
                        plan_origin: NO_PLAN,
                        plan_wp: 0,
                        plan_base: 0,
                    }),
                    stats: ChannelStatsBlock::new(),
                },
            );

            ptr::write_bytes(base.add(off.busy), 0, params.capacity as usize);

            let pending = base.add(off.pending) as *mut PendingSlot;
            for i in 0..params.capacity as usize {
                ptr::write(pending.add(i), PendingSlot::EMPTY);
            }

            let clients = base.add(off.clients) as *mut ClientEntry;
            for i in 0..params.max_clients as usize {
                ptr::write(clients.add(i), ClientEntry::new());
            }

            for i in 0..params.max_clients as usize {
                CompletionMailbox::init(
                    base.add(off.mailboxes + i * off.mailbox_stride),
                    params.mailbox_capacity as usize,
                );
            }

            // Publish last so an attaching process never sees a half-built layout
            std::sync::atomic::fence(Ordering::Release);
            ptr::write_volatile(ptr::addr_of_mut!((*header).magic), LAYOUT_MAGIC);
        }

        Ok(Self { mem, header })
    }

    /// View a layout written by another process.
    pub fn attach(mem: Box<dyn SharedMemoryBackend>) -> io::Result<Self> {
        if mem.size() < size_of::<ChannelHeader>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Shared memory too small for channel header",
            ));
        }
        let header = mem.as_ptr() as *mut ChannelHeader;
        unsafe {
            let magic = ptr::read_volatile(ptr::addr_of!((*header).magic));
            std::sync::atomic::fence(Ordering::Acquire);
            if magic != LAYOUT_MAGIC {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Invalid magic number - channel region not initialized",
                ));
            }
            if (*header).version != LAYOUT_VERSION {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "channel layout version {} (expected {})",
                        (*header).version,
                        LAYOUT_VERSION
                    ),
                ));
            }
            if (*header).total_size as usize > mem.size() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "channel region truncated: {} < {}",
                        mem.size(),
                        (*header).total_size
                    ),
                ));
            }
        }
        Ok(Self { mem, header })
    }

    #[inline]
    pub fn header(&self) -> &ChannelHeader {
        unsafe { &*self.header }
    }

    pub fn shm(&self) -> &dyn SharedMemoryBackend {
        &*self.mem
    }

    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    pub fn busy_count(&self) -> u32 {
        self.header().busy_count.load(Ordering::Acquire)
    }

    pub fn lock_submit(&self) -> SubmitGuard<'_> {
        let lock = self.header().submit_lock.lock();
        SubmitGuard {
            _lock: lock,
            state: unsafe { &mut *self.header().submit.get() },
        }
    }

    pub fn lock_busy(&self) -> BusyGuard<'_> {
        let header = self.header();
        let lock = header.busy_lock.lock();
        let base = self.mem.as_ptr();
        let cap = header.capacity as usize;
        unsafe {
            BusyGuard {
                _lock: lock,
                header,
                track: &mut *header.track.get(),
                busy: std::slice::from_raw_parts_mut(base.add(header.busy_off as usize), cap),
                pending: std::slice::from_raw_parts_mut(
                    base.add(header.pending_off as usize) as *mut PendingSlot,
                    cap,
                ),
            }
        }
    }

    pub fn client(&self, index: u32) -> Option<&ClientEntry> {
        let header = self.header();
        if index >= header.max_clients {
            return None;
        }
        unsafe {
            let clients = self.mem.as_ptr().add(header.clients_off as usize) as *const ClientEntry;
            Some(&*clients.add(index as usize))
        }
    }

    pub fn mailbox(&self, index: u32) -> Option<CompletionMailbox> {
        let header = self.header();
        if index >= header.max_clients {
            return None;
        }
        unsafe {
            let base = self
                .mem
                .as_ptr()
                .add(header.mailbox_off as usize + index as usize * header.mailbox_stride as usize);
            Some(CompletionMailbox::from_raw(base))
        }
    }
}

/// Proof that `submit_lock` is held.
pub struct SubmitGuard<'a> {
    _lock: SpinGuard<'a>,
    pub state: &'a mut SubmitState,
}

/// Proof that `busy_lock` is held; exposes the busy map and pending table.
pub struct BusyGuard<'a> {
    _lock: SpinGuard<'a>,
    header: &'a ChannelHeader,
    pub track: &'a mut TrackState,
    pub busy: &'a mut [u8],
    pub pending: &'a mut [PendingSlot],
}

impl BusyGuard<'_> {
    pub fn is_busy(&self, idx: u32) -> bool {
        self.busy[idx as usize] != 0
    }

    /// Mark a data slot busy and record its pending work item together.
    pub fn record(&mut self, idx: u32, slot: PendingSlot) {
        let i = idx as usize;
        assert!(
            self.busy[i] == 0 && !self.pending[i].is_valid(),
            "ring slot {idx} recorded while still occupied"
        );
        self.busy[i] = 1;
        self.pending[i] = PendingSlot { valid: 1, ..slot };
        self.header.busy_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark a LINK or skipped slot busy without counting it.
    pub fn mark_artifact(&mut self, idx: u32) {
        self.busy[idx as usize] = 1;
    }

    /// Clear a data slot's busy bit and pending entry together.
    pub fn take(&mut self, idx: u32) -> Option<PendingSlot> {
        let i = idx as usize;
        if !self.pending[i].is_valid() {
            return None;
        }
        assert!(
            self.busy[i] != 0,
            "pending work at ring slot {idx} without its busy bit"
        );
        let slot = self.pending[i];
        self.pending[i] = PendingSlot::EMPTY;
        self.busy[i] = 0;
        let prev = self.header.busy_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "busy count underflow at ring slot {idx}");
        Some(slot)
    }

    /// A busy slot with no pending entry: a LINK or a slot skipped by recovery.
    pub fn is_artifact(&self, idx: u32) -> bool {
        let i = idx as usize;
        self.busy[i] != 0 && !self.pending[i].is_valid()
    }

    pub fn clear_artifact(&mut self, idx: u32) {
        debug_assert!(self.is_artifact(idx));
        self.busy[idx as usize] = 0;
    }

    /// Drop everything. Returns the pending items that were discarded.
    pub fn clear_all(&mut self) -> Vec<PendingSlot> {
        let mut dropped = Vec::new();
        for i in 0..self.pending.len() {
            if self.pending[i].is_valid() {
                dropped.push(self.pending[i]);
            }
            self.pending[i] = PendingSlot::EMPTY;
            self.busy[i] = 0;
        }
        self.header.busy_count.store(0, Ordering::Release);
        dropped
    }
}
