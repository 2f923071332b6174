// Cross-process channel. The master owns the hardware and does all
// scanning and recovery; clients map the same channel state, submit into
// the shared ring and collect their completions from a private mailbox.

use std::cell::Cell;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::builder::PollStrategy;
use super::channel::{wait_until, ChannelCore, PollStatus, ServiceOptions, TicketBook};
use super::engine::Engine;
use super::error::{DmaError, Result};
use super::mailbox::{CompletionMailbox, CompletionRecord};
use super::Ring::layout::{ChannelHeader, ChannelLayout};
use super::Ring::Ring::{CompletionQueue, DescriptorRing};
use super::Structs::Descriptor_Structs::{
    current_tid, now_ns, CompletedItem, DmaRequest, Owner, SubmitMode, Ticket,
};
use crate::Core::alloc::DmaAllocator;
use crate::Core::SharedMemory::{attach_shared_memory, unlink_shared_memory};

/// Client-side polls between master liveness probes.
const MASTER_PROBE_EVERY: u32 = 1024;

/// True unless the kernel says `pid` no longer exists.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Hand a completion to the client that submitted it.
pub(crate) fn route_to_client(engine: &Engine, item: &CompletedItem) {
    let client = item.owner.client;
    let (Some(entry), Some(mailbox)) = (engine.layout().client(client), engine.mailbox(client))
    else {
        log::warn!(
            "dma: completion for ticket {} names unknown client {}",
            item.ticket.value(),
            client
        );
        return;
    };
    if entry.pid.load(Ordering::Acquire) != item.owner.pid {
        log::debug!(
            "dma: dropping ticket {} for departed client {} (pid {})",
            item.ticket.value(),
            client,
            item.owner.pid
        );
        return;
    }
    if !mailbox.push(CompletionRecord::from_item(item)) {
        log::warn!(
            "dma: mailbox of client {} full, ticket {} lost ({} dropped so far)",
            client,
            item.ticket.value(),
            mailbox.dropped()
        );
    }
}

/// Free table entries of clients that exited without detaching, along
/// with any engine lock they died holding. Their in-flight work still
/// completes; the results are discarded.
pub fn reap_dead_clients(engine: &Engine) -> usize {
    let layout = engine.layout();
    let header = layout.header();
    let mut reaped = 0;

    for i in 0..header.max_clients {
        let Some(entry) = layout.client(i) else {
            break;
        };
        let pid = entry.pid.load(Ordering::Acquire);
        if pid == 0 || process_alive(pid) {
            continue;
        }

        let submit = header.submit_lock.force_unlock_if_owner(pid);
        let busy = header.busy_lock.force_unlock_if_owner(pid);
        if submit || busy {
            log::error!(
                "dma: client {} (pid {}) died holding the {} lock",
                i,
                pid,
                if submit { "submit" } else { "busy" }
            );
        }

        if entry
            .pid
            .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            if let Some(mailbox) = layout.mailbox(i) {
                mailbox.drain();
            }
            log::warn!("dma: reclaimed client slot {} of dead pid {}", i, pid);
            reaped += 1;
        }
    }
    reaped
}

/// The process that created the channel and programs the hardware.
pub(crate) struct SharedMaster {
    core: Arc<ChannelCore>,
    name: String,
    closed: AtomicBool,
}

impl SharedMaster {
    pub(crate) fn new(core: Arc<ChannelCore>, name: &str) -> Self {
        log::info!(
            "dma: shared channel '{}' ready for {} clients",
            name,
            core.engine.layout().header().max_clients
        );
        Self {
            core,
            name: name.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.close();
        if let Err(e) = unlink_shared_memory(&self.name) {
            log::warn!("dma: failed to unlink channel '{}': {}", self.name, e);
        }
    }
}

/// A process submitting into a channel another process masters.
pub(crate) struct SharedClient {
    engine: Engine,
    index: u32,
    mailbox: CompletionMailbox,
    book: TicketBook,
    opts: ServiceOptions,
    probes: AtomicU32,
    /// Tickets whose completion has not been pumped yet. Capped at the
    /// mailbox capacity so the master never finds the mailbox full.
    in_flight: AtomicU32,
    closed: AtomicBool,
}

impl SharedClient {
    pub(crate) fn attach(
        name: &str,
        allocator: &Arc<dyn DmaAllocator>,
        drain_grace: Duration,
        opts: ServiceOptions,
    ) -> Result<Self> {
        let mem = attach_shared_memory(name, size_of::<ChannelHeader>())?;
        let layout = ChannelLayout::attach(mem).map_err(|e| DmaError::Layout(e.to_string()))?;

        let header = layout.header();
        if header.closed.load(Ordering::Acquire) != 0 {
            return Err(DmaError::Closed);
        }
        let master = header.master_pid.load(Ordering::Acquire);
        if !process_alive(master) {
            return Err(DmaError::Layout(format!(
                "master pid {master} of '{name}' is gone"
            )));
        }

        let ring = allocator.map(header.ring_bus, DescriptorRing::region_size(header.capacity))?;
        let sts = allocator.map(header.sts_bus, CompletionQueue::region_size(header.sts_rows))?;
        let engine = Engine::attach(layout, Arc::new(ring), Arc::new(sts), drain_grace)?;

        let index = claim_slot(engine.layout())?;
        let mailbox = engine
            .mailbox(index)
            .ok_or_else(|| DmaError::Layout(format!("no mailbox for client slot {index}")))?;

        log::info!(
            "dma: attached to '{}' as client {} (master pid {})",
            name,
            index,
            master
        );
        Ok(Self {
            engine,
            index,
            mailbox,
            book: TicketBook::default(),
            opts,
            probes: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Move published completions into the local ticket book.
    pub(crate) fn pump(&self) -> usize {
        let mut n = 0;
        while let Some(record) = self.mailbox.pop() {
            self.book.resolve(record.ticket(), record.outcome());
            self.release_in_flight();
            n += 1;
        }
        n
    }

    /// Claim room in the mailbox for one more completion.
    fn reserve_in_flight(&self) -> bool {
        let limit = self.mailbox.capacity() as u32;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_in_flight(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    fn master_gone(&self) -> bool {
        let n = self.probes.fetch_add(1, Ordering::Relaxed);
        if n % MASTER_PROBE_EVERY != 0 {
            return false;
        }
        let header = self.engine.layout().header();
        header.closed.load(Ordering::Acquire) != 0
            || !process_alive(header.master_pid.load(Ordering::Acquire))
    }

    fn pause(&self, seen: u32) {
        match self.opts.poll {
            PollStrategy::BusyWait => std::hint::spin_loop(),
            PollStrategy::Sleep(d) => self.mailbox.wait(seen, d),
        }
    }

    pub(crate) fn submit(&self, req: &DmaRequest, mode: SubmitMode) -> Result<Option<Ticket>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DmaError::Closed);
        }
        if mode == SubmitMode::FireAndForget {
            // No completion record comes back for these
            self.engine.enqueue(req, mode, Owner::client(self.index))?;
            return Ok(None);
        }
        if !self.reserve_in_flight() {
            self.pump();
            if !self.reserve_in_flight() {
                log::trace!(
                    "dma: client {} has {} completions outstanding",
                    self.index,
                    self.in_flight()
                );
                return Err(DmaError::QueueFull);
            }
        }
        // The master forwards the doorbell on its next service pass
        let assignment = match self.engine.enqueue(req, mode, Owner::client(self.index)) {
            Ok(a) => a,
            Err(e) => {
                self.release_in_flight();
                return Err(e);
            }
        };
        let ticket = assignment.ticket;
        self.book.issue(ticket);
        if mode == SubmitMode::Sync {
            let seen = Cell::new(self.mailbox.signal_word());
            wait_until(self.opts.sync_timeout, || self.pause(seen.get()), || {
                seen.set(self.mailbox.signal_word());
                self.pump();
                (self.book.is_resolved(ticket) || self.master_gone()).then_some(())
            });
        }
        Ok(Some(ticket))
    }

    pub(crate) fn poll(&self, ticket: Ticket, timeout: Duration) -> PollStatus {
        let seen = Cell::new(self.mailbox.signal_word());
        wait_until(
            timeout,
            || self.pause(seen.get()),
            || {
                seen.set(self.mailbox.signal_word());
                self.pump();
                if let Some(outcome) = self.book.take(ticket) {
                    return Some(PollStatus::from(outcome));
                }
                if self.master_gone() {
                    log::warn!("dma: master of client {} is gone", self.index);
                    self.book.cancel_all();
                    return self.book.take(ticket).map(PollStatus::from);
                }
                None
            },
        )
        .unwrap_or(PollStatus::InProgress)
    }

    /// Give the client slot back. Outstanding tickets resolve as cancelled.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pump();
        let cancelled = self.book.cancel_all();
        let pid = std::process::id();
        if let Some(entry) = self.engine.layout().client(self.index) {
            let _ = entry
                .pid
                .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed);
        }
        self.mailbox.drain();
        log::info!(
            "dma: client {} detached, {} tickets cancelled",
            self.index,
            cancelled
        );
    }
}

fn claim_slot(layout: &ChannelLayout) -> Result<u32> {
    let pid = std::process::id();
    for i in 0..layout.header().max_clients {
        let Some(entry) = layout.client(i) else {
            break;
        };
        if entry
            .pid
            .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            entry.tid.store(current_tid(), Ordering::Relaxed);
            entry.generation.fetch_add(1, Ordering::Relaxed);
            entry.attached_ns.store(now_ns(), Ordering::Relaxed);
            if let Some(mailbox) = layout.mailbox(i) {
                // Leftovers from the slot's previous owner
                mailbox.drain();
            }
            return Ok(i);
        }
    }
    Err(DmaError::NoFreeClientSlot)
}
