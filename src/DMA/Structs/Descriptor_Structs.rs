// Plain-old-data records shared with the transfer engine and, for the
// cross-process variant, with other processes. No pointers, only bus
// addresses and indices.

use crate::Core::alloc::PinnedBuffer;
use std::fmt;

/// Largest payload carried directly inside a descriptor.
pub const INLINE_MAX: usize = 16;

/// Size of one ring slot in bytes.
pub const DESC_SIZE: usize = 64;

/// Raw descriptor kind values as seen by the transfer engine.
pub const DESC_KIND_EMPTY: u8 = 0;
pub const DESC_KIND_BULK: u8 = 1;
pub const DESC_KIND_INLINE: u8 = 2;
pub const DESC_KIND_LINK: u8 = 3;

/// One hardware-visible ring slot.
#[repr(C, align(64))]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub kind: u8,
    pub opcode: u8,
    pub dest_id: u16,
    /// Transfer length in bytes (0 for LINK).
    pub len: u32,
    /// Remote (fabric) address.
    pub raddr: u64,
    /// BULK: local bus address. LINK: bus address of the next descriptor.
    pub local: u64,
    /// Write position assigned at submission.
    pub wp: u32,
    pub flags: u32,
    /// INLINE: write payload, or read data deposited by the engine.
    pub inline: [u8; INLINE_MAX],
    pub _rsvd: [u8; 16],
}

impl Descriptor {
    pub fn link(target_bus: u64) -> Self {
        Self {
            kind: DESC_KIND_LINK,
            local: target_bus,
            ..Self::default()
        }
    }

    pub fn from_request(req: &DmaRequest, wp: u32) -> Self {
        let mut desc = Self {
            kind: req.kind as u8,
            opcode: req.opcode as u8,
            dest_id: req.dest_id,
            len: req.len,
            raddr: req.raddr,
            wp,
            ..Self::default()
        };
        match req.kind {
            DescKind::Bulk => desc.local = req.buffer.transfer_addr(),
            DescKind::Inline => desc.inline = req.inline,
            DescKind::Link => {}
        }
        desc
    }

    pub fn kind(&self) -> Option<DescKind> {
        DescKind::from_raw(self.kind)
    }

    pub fn opcode(&self) -> Option<DmaOpcode> {
        DmaOpcode::from_raw(self.opcode)
    }

    pub fn is_link(&self) -> bool {
        self.kind == DESC_KIND_LINK
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DescKind {
    Bulk = DESC_KIND_BULK,
    Inline = DESC_KIND_INLINE,
    Link = DESC_KIND_LINK,
}

impl DescKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            DESC_KIND_BULK => Some(Self::Bulk),
            DESC_KIND_INLINE => Some(Self::Inline),
            DESC_KIND_LINK => Some(Self::Link),
            _ => None,
        }
    }
}

/// Transfer direction / fabric transaction type.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DmaOpcode {
    /// Remote read.
    Read = 0,
    /// Write acknowledged by the remote end.
    WriteWithResponse = 1,
    /// Posted write, no response.
    Write = 2,
    /// Series of posted writes, the last one acknowledged.
    AllWrites = 3,
}

impl DmaOpcode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Read),
            1 => Some(Self::WriteWithResponse),
            2 => Some(Self::Write),
            3 => Some(Self::AllWrites),
            _ => None,
        }
    }

    pub fn is_read(self) -> bool {
        self == Self::Read
    }
}

/// The caller's original request, kept in the pending-work table until the
/// matching completion is scanned.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DmaRequest {
    pub opcode: DmaOpcode,
    pub kind: DescKind,
    pub dest_id: u16,
    pub len: u32,
    pub raddr: u64,
    pub buffer: PinnedBuffer,
    pub inline: [u8; INLINE_MAX],
}

impl DmaRequest {
    /// Inline read of up to [`INLINE_MAX`] bytes.
    pub fn read_inline(dest_id: u16, raddr: u64, len: usize) -> Option<Self> {
        if len == 0 || len > INLINE_MAX {
            return None;
        }
        Some(Self {
            opcode: DmaOpcode::Read,
            kind: DescKind::Inline,
            dest_id,
            len: len as u32,
            raddr,
            buffer: PinnedBuffer::default(),
            inline: [0; INLINE_MAX],
        })
    }

    /// Inline write of up to [`INLINE_MAX`] bytes.
    pub fn write_inline(opcode: DmaOpcode, dest_id: u16, raddr: u64, data: &[u8]) -> Option<Self> {
        if opcode.is_read() || data.is_empty() || data.len() > INLINE_MAX {
            return None;
        }
        let mut inline = [0u8; INLINE_MAX];
        inline[..data.len()].copy_from_slice(data);
        Some(Self {
            opcode,
            kind: DescKind::Inline,
            dest_id,
            len: data.len() as u32,
            raddr,
            buffer: PinnedBuffer::default(),
            inline,
        })
    }

    /// Transfer to or from a pre-registered pinned buffer.
    pub fn bulk(opcode: DmaOpcode, dest_id: u16, raddr: u64, buffer: PinnedBuffer) -> Option<Self> {
        if buffer.size == 0 || buffer.size > u32::MAX as u64 {
            return None;
        }
        Some(Self {
            opcode,
            kind: DescKind::Bulk,
            dest_id,
            len: buffer.size as u32,
            raddr,
            buffer,
            inline: [0; INLINE_MAX],
        })
    }
}

/// How the caller waits for a submission.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubmitMode {
    /// Return once the operation has resolved (or the sync timeout elapsed).
    Sync = 0,
    /// Return a ticket immediately; resolve with `poll`.
    Async = 1,
    /// Return once the ring has accepted the descriptor; no ticket.
    FireAndForget = 2,
}

impl SubmitMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Sync,
            1 => Self::Async,
            _ => Self::FireAndForget,
        }
    }
}

/// Classified cause of a channel fault.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AbortReason {
    NoFault = 0,
    /// The remote end did not respond in time.
    Timeout = 1,
    /// The remote end answered with an I/O error.
    RemoteIoError = 2,
    /// The remote end reported an implementation-specific error.
    RemoteImplError = 3,
    /// Local bus (PCIe-class) error while fetching or moving data.
    LocalBusError = 4,
    /// Discarded by a destructive restart or channel close.
    Cancelled = 5,
}

impl AbortReason {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::NoFault,
            1 => Self::Timeout,
            2 => Self::RemoteIoError,
            3 => Self::RemoteImplError,
            4 => Self::LocalBusError,
            _ => Self::Cancelled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoFault => "no fault",
            Self::Timeout => "remote response timeout",
            Self::RemoteIoError => "remote I/O error response",
            Self::RemoteImplError => "remote implementation-specific error",
            Self::LocalBusError => "local bus (PCIe) error",
            Self::Cancelled => "cancelled by channel restart or close",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable name of an abort reason.
pub fn abort_reason_to_string(reason: AbortReason) -> &'static str {
    reason.as_str()
}

/// Caller-visible handle correlating a submission with its completion.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub(crate) u64);

impl Ticket {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Who submitted a pending work item.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Owner {
    /// Client table index, or [`Owner::LOCAL`] for the process that owns
    /// the hardware.
    pub client: u32,
    pub pid: u32,
    pub tid: u32,
}

impl Owner {
    pub const LOCAL: u32 = u32::MAX;

    pub fn local() -> Self {
        Self {
            client: Self::LOCAL,
            pid: std::process::id(),
            tid: current_tid(),
        }
    }

    pub fn client(index: u32) -> Self {
        Self {
            client: index,
            pid: std::process::id(),
            tid: current_tid(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.client == Self::LOCAL
    }
}

pub(crate) fn current_tid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

/// Monotonic clock shared by every process on the host.
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Final state of one operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Finished; inline reads carry the bytes read.
    Completed(Option<Vec<u8>>),
    Faulted(AbortReason),
}

/// A pending work item that has left the engine.
#[derive(Clone, Debug)]
pub struct CompletedItem {
    pub ticket: Ticket,
    pub owner: Owner,
    pub mode: SubmitMode,
    pub request: DmaRequest,
    pub idx: u32,
    pub wp: u32,
    pub submitted_ns: u64,
    pub completed_ns: u64,
    pub outcome: Outcome,
}

impl CompletedItem {
    pub fn latency_ns(&self) -> u64 {
        self.completed_ns.saturating_sub(self.submitted_ns)
    }
}
