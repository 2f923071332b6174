// Per-client completion mailbox living in the channel's shared region.
//
// The master's scanner produces, the owning client consumes. The slot
// protocol is the bounded MPMC sequence scheme: a producer claims `tail`
// once the slot's sequence equals `tail` and publishes `tail + 1`; a
// consumer claims `head` once the sequence equals `head + 1` and frees the
// slot by storing `head + capacity`.

use crossbeam_utils::CachePadded;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::time::Duration;

use crate::DMA::Structs::Descriptor_Structs::{
    AbortReason, CompletedItem, Outcome, Ticket, INLINE_MAX,
};

/// Completion of one operation as handed across the process boundary.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionRecord {
    pub ticket: u64,
    /// 0 = completed, 1 = faulted with `reason`.
    pub faulted: u32,
    pub reason: u32,
    /// Number of valid bytes in `data` (inline reads only).
    pub len: u32,
    pub idx: u32,
    pub data: [u8; INLINE_MAX],
    pub latency_ns: u64,
}

impl CompletionRecord {
    pub fn from_item(item: &CompletedItem) -> Self {
        let mut rec = Self {
            ticket: item.ticket.value(),
            idx: item.idx,
            latency_ns: item.latency_ns(),
            ..Self::default()
        };
        match &item.outcome {
            Outcome::Completed(Some(bytes)) => {
                let len = bytes.len().min(INLINE_MAX);
                rec.data[..len].copy_from_slice(&bytes[..len]);
                rec.len = len as u32;
            }
            Outcome::Completed(None) => {}
            Outcome::Faulted(reason) => {
                rec.faulted = 1;
                rec.reason = *reason as u32;
            }
        }
        rec
    }

    pub fn ticket(&self) -> Ticket {
        Ticket(self.ticket)
    }

    pub fn outcome(&self) -> Outcome {
        if self.faulted != 0 {
            Outcome::Faulted(AbortReason::from_raw(self.reason))
        } else if self.len > 0 {
            Outcome::Completed(Some(self.data[..self.len as usize].to_vec()))
        } else {
            Outcome::Completed(None)
        }
    }
}

#[repr(C, align(128))]
pub struct MailboxHeader {
    pub capacity: u64,
    /// Futex word bumped on every publish.
    pub signal: AtomicU32,
    /// Records discarded because the mailbox was full.
    pub dropped: AtomicU64,
    pub tail: CachePadded<AtomicU64>,
    pub head: CachePadded<AtomicU64>,
}

#[repr(C, align(64))]
pub struct MailSlot {
    pub sequence: AtomicU64,
    pub record: CompletionRecord,
}

/// Transient view over one mailbox. Not stored in shared memory.
pub struct CompletionMailbox {
    header: *const MailboxHeader,
    slots: *mut u8,
    capacity: usize,
    mask: usize,
}

unsafe impl Send for CompletionMailbox {}
unsafe impl Sync for CompletionMailbox {}

impl CompletionMailbox {
    /// Bytes occupied by a mailbox of `capacity` slots (power of two).
    pub fn region_size(capacity: usize) -> usize {
        size_of::<MailboxHeader>() + capacity * size_of::<MailSlot>()
    }

    /// View an already initialized mailbox.
    ///
    /// # Safety
    /// `base` must point to a live, initialized mailbox region.
    pub unsafe fn from_raw(base: *mut u8) -> Self {
        let header = base as *const MailboxHeader;
        let capacity = (*header).capacity as usize;
        Self {
            header,
            slots: base.add(size_of::<MailboxHeader>()),
            capacity,
            mask: capacity - 1,
        }
    }

    /// Write a fresh mailbox into `base` and return a view of it.
    ///
    /// # Safety
    /// `base` must be writable for [`region_size`](Self::region_size) bytes and
    /// aligned to 128 bytes; nobody else may be using it.
    pub unsafe fn init(base: *mut u8, capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "mailbox capacity must be a power of two");
        ptr::write(
            base as *mut MailboxHeader,
            MailboxHeader {
                capacity: capacity as u64,
                signal: AtomicU32::new(0),
                dropped: AtomicU64::new(0),
                tail: CachePadded::new(AtomicU64::new(0)),
                head: CachePadded::new(AtomicU64::new(0)),
            },
        );
        let mailbox = Self::from_raw(base);
        for k in 0..capacity {
            let slot = mailbox.slot_mut(k);
            ptr::write(
                slot,
                MailSlot {
                    sequence: AtomicU64::new(k as u64),
                    record: CompletionRecord::default(),
                },
            );
        }
        mailbox
    }

    #[inline]
    unsafe fn slot_mut(&self, index: usize) -> *mut MailSlot {
        self.slots.add(index * size_of::<MailSlot>()) as *mut MailSlot
    }

    #[inline]
    fn header(&self) -> &MailboxHeader {
        unsafe { &*self.header }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.header().dropped.load(Relaxed)
    }

    /// Publish a record. Returns false (and counts a drop) when full.
    pub fn push(&self, record: CompletionRecord) -> bool {
        let tail_atomic = &self.header().tail;

        loop {
            let tail = tail_atomic.load(Relaxed);
            let idx = (tail as usize) & self.mask;
            let slot_ptr = unsafe { self.slot_mut(idx) };
            let seq = unsafe { &(*slot_ptr).sequence }.load(Acquire);
            let dif = seq as i64 - tail as i64;

            if dif == 0 {
                if tail_atomic
                    .compare_exchange_weak(tail, tail + 1, AcqRel, Relaxed)
                    .is_ok()
                {
                    unsafe {
                        ptr::write(ptr::addr_of_mut!((*slot_ptr).record), record);
                        (*slot_ptr).sequence.store(tail + 1, Release);
                    }
                    self.signal();
                    return true;
                }
            } else if dif < 0 {
                // full
                self.header().dropped.fetch_add(1, Relaxed);
                return false;
            } else {
                // another producer is mid-publish
                std::hint::spin_loop();
            }
        }
    }

    /// Take the oldest record, if any.
    pub fn pop(&self) -> Option<CompletionRecord> {
        let head_atomic = &self.header().head;

        loop {
            let head = head_atomic.load(Relaxed);
            let idx = (head as usize) & self.mask;
            let slot_ptr = unsafe { self.slot_mut(idx) };
            let seq = unsafe { &(*slot_ptr).sequence }.load(Acquire);
            let dif = seq as i64 - (head as i64 + 1);

            if dif == 0 {
                if head_atomic
                    .compare_exchange_weak(head, head + 1, AcqRel, Relaxed)
                    .is_ok()
                {
                    let record = unsafe { ptr::read(ptr::addr_of!((*slot_ptr).record)) };
                    // free slot for future producers
                    unsafe {
                        (*slot_ptr)
                            .sequence
                            .store(head + self.capacity as u64, Release);
                    }
                    return Some(record);
                }
            } else if dif < 0 {
                // empty
                return None;
            } else {
                // producer not finished; retry
                std::hint::spin_loop();
            }
        }
    }

    /// Discard everything queued. Used when a client slot is recycled.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while self.pop().is_some() {
            n += 1;
        }
        n
    }

    pub fn signal_word(&self) -> u32 {
        self.header().signal.load(Acquire)
    }

    fn signal(&self) {
        let signal = &self.header().signal;
        signal.fetch_add(1, Release);
        crate::Core::futex::futex_wake_all(signal);
    }

    /// Block until a publish after `seen` or until `timeout` elapses.
    pub fn wait(&self, seen: u32, timeout: Duration) {
        crate::Core::futex::futex_wait(&self.header().signal, seen, Some(timeout));
    }
}
