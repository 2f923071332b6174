use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::builder::PollStrategy;
use super::engine::{ChannelStats, Engine};
use super::error::{DmaError, Result};
use super::shared::{self, SharedClient, SharedMaster};
use super::sim::SimEngine;
use super::Structs::Descriptor_Structs::{
    now_ns, AbortReason, CompletedItem, DmaOpcode, DmaRequest, Outcome, Owner, SubmitMode,
    Ticket,
};
use crate::Core::alloc::{DmaAllocator, DmaRegion, PinnedBuffer};

/// How often the master looks for clients that exited without detaching.
const REAP_INTERVAL_NS: u64 = 100_000_000;

/// What `poll` reports for a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Finished. Inline reads carry the bytes read.
    Completed(Option<Vec<u8>>),
    InProgress,
    Faulted(AbortReason),
}

impl From<Outcome> for PollStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed(data) => Self::Completed(data),
            Outcome::Faulted(reason) => Self::Faulted(reason),
        }
    }
}

/// Data side of a submission.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// Write these bytes inline (at most 16).
    Bytes(&'a [u8]),
    /// Read this many bytes inline (at most 16).
    Len(usize),
    /// Read into or write from a pinned buffer.
    Buffer(PinnedBuffer),
}

/// Turn a caller request into a ring request.
pub fn build_request(
    opcode: DmaOpcode,
    dest_id: u16,
    raddr: u64,
    payload: Payload<'_>,
) -> Result<DmaRequest> {
    let req = match (opcode.is_read(), payload) {
        (true, Payload::Len(len)) => DmaRequest::read_inline(dest_id, raddr, len),
        (false, Payload::Bytes(data)) => DmaRequest::write_inline(opcode, dest_id, raddr, data),
        (_, Payload::Buffer(buffer)) => DmaRequest::bulk(opcode, dest_id, raddr, buffer),
        (true, Payload::Bytes(_)) => {
            return Err(DmaError::InvalidRequest(
                "reads take a length or a buffer, not bytes".into(),
            ))
        }
        (false, Payload::Len(_)) => {
            return Err(DmaError::InvalidRequest(
                "writes take bytes or a buffer, not a length".into(),
            ))
        }
    };
    req.ok_or_else(|| {
        DmaError::InvalidRequest(format!(
            "{:?} to {}:{:#x} is empty or exceeds the inline limit; use a pinned buffer",
            opcode, dest_id, raddr
        ))
    })
}

/// Capabilities every channel flavour offers.
pub trait DmaTransport {
    fn submit(&self, req: &DmaRequest, mode: SubmitMode) -> Result<Option<Ticket>>;
    fn poll(&self, ticket: Ticket, timeout: Duration) -> PollStatus;
    fn restart(&self, nuke_all: bool) -> Result<()>;
    fn stats(&self) -> ChannelStats;
    fn queue_depth(&self) -> usize;
    /// One pass of background work; returns completions handled.
    fn service(&self) -> usize;
    fn close(&self);
}

/// Outcomes waiting to be collected by `poll`, keyed by ticket.
#[derive(Default)]
pub(crate) struct TicketBook {
    inner: Mutex<BookInner>,
}

#[derive(Default)]
struct BookInner {
    issued: HashSet<u64>,
    resolved: HashMap<u64, Outcome>,
}

impl TicketBook {
    pub(crate) fn issue(&self, ticket: Ticket) {
        self.inner.lock().issued.insert(ticket.0);
    }

    pub(crate) fn resolve(&self, ticket: Ticket, outcome: Outcome) {
        self.inner.lock().resolved.insert(ticket.0, outcome);
    }

    pub(crate) fn is_resolved(&self, ticket: Ticket) -> bool {
        self.inner.lock().resolved.contains_key(&ticket.0)
    }

    /// Collect a ticket's outcome. `None` while still outstanding.
    ///
    /// # Panics
    /// If the ticket was never issued here or was already collected.
    pub(crate) fn take(&self, ticket: Ticket) -> Option<Outcome> {
        let mut inner = self.inner.lock();
        if let Some(outcome) = inner.resolved.remove(&ticket.0) {
            inner.issued.remove(&ticket.0);
            return Some(outcome);
        }
        assert!(
            inner.issued.contains(&ticket.0),
            "poll of unknown or already collected ticket {}",
            ticket.0
        );
        None
    }

    /// Resolve everything still outstanding as cancelled.
    pub(crate) fn cancel_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let BookInner { issued, resolved } = &mut *inner;
        let mut n = 0;
        for t in issued.iter() {
            if !resolved.contains_key(t) {
                resolved.insert(*t, Outcome::Faulted(AbortReason::Cancelled));
                n += 1;
            }
        }
        n
    }
}

/// Retry `attempt` until it yields, pausing per `strategy` in between.
/// A zero `timeout` waits indefinitely.
pub(crate) fn wait_until<T>(
    timeout: Duration,
    mut pause: impl FnMut(),
    mut attempt: impl FnMut() -> Option<T>,
) -> Option<T> {
    let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
    loop {
        if let Some(v) = attempt() {
            return Some(v);
        }
        if deadline.map_or(false, |d| Instant::now() >= d) {
            return None;
        }
        pause();
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServiceOptions {
    pub poll: PollStrategy,
    pub sync_timeout: Duration,
    pub scan_budget: usize,
    pub scanner_thread: bool,
    pub scanner_cpu: Option<usize>,
}

/// Everything the process driving the hardware needs: the engine, the
/// simulator if there is one, and the outcomes of local tickets.
pub(crate) struct ChannelCore {
    pub(crate) engine: Engine,
    pub(crate) sim: Option<Arc<SimEngine>>,
    pub(crate) book: TicketBook,
    pub(crate) opts: ServiceOptions,
    /// One service pass at a time.
    service_lock: Mutex<()>,
    pub(crate) shutdown: AtomicBool,
    threaded: AtomicBool,
    last_reap_ns: AtomicU64,
}

impl ChannelCore {
    pub(crate) fn new(engine: Engine, sim: Option<Arc<SimEngine>>, opts: ServiceOptions) -> Self {
        Self {
            engine,
            sim,
            book: TicketBook::default(),
            opts,
            service_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            threaded: AtomicBool::new(false),
            last_reap_ns: AtomicU64::new(now_ns()),
        }
    }

    /// Forward doorbells, advance the simulator, recover from aborts, and
    /// hand out completions.
    pub(crate) fn service(&self) -> usize {
        let Some(_pass) = self.service_lock.try_lock() else {
            return 0;
        };

        // Client submissions only publish the write position
        self.engine.ring_doorbell();

        if let Some(sim) = &self.sim {
            if sim.config().auto_progress {
                sim.step(sim.config().step);
            }
        }

        self.recover_if_aborted();
        let desync_before = self.engine.stats().desync;
        let mut items = self.engine.scan(self.opts.scan_budget);
        if self.engine.stats().desync != desync_before {
            // Unmatched completions usually mean the channel has stopped
            self.recover_if_aborted();
        }
        items.extend(self.engine.take_deferred());

        let n = items.len();
        self.deliver(items);

        let now = now_ns();
        let last = self.last_reap_ns.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= REAP_INTERVAL_NS {
            self.last_reap_ns.store(now, Ordering::Relaxed);
            shared::reap_dead_clients(&self.engine);
        }
        n
    }

    /// Run recovery if the hardware reports an abort. Returns true if it did.
    pub(crate) fn recover_if_aborted(&self) -> bool {
        let Some(reason) = self.engine.check_abort() else {
            return false;
        };
        log::warn!("dma: channel abort: {}", reason);
        // Runs inside the only scanning pass, so there is no other scanner to wait for
        let result = match self.engine.cleanup_bd_queue(false) {
            Some(_) => self.engine.soft_restart(false),
            None => self.engine.soft_restart(true),
        };
        if let Err(e) = result {
            log::error!("dma: restart after abort failed: {}", e);
        }
        true
    }

    pub(crate) fn deliver(&self, items: Vec<CompletedItem>) {
        for item in items {
            if item.mode == SubmitMode::FireAndForget {
                continue;
            }
            if item.owner.is_local() {
                self.book.resolve(item.ticket, item.outcome);
            } else {
                shared::route_to_client(&self.engine, &item);
            }
        }
    }

    pub(crate) fn submit(&self, req: &DmaRequest, mode: SubmitMode) -> Result<Option<Ticket>> {
        let assignment = self.engine.enqueue(req, mode, Owner::local())?;
        if mode == SubmitMode::FireAndForget {
            return Ok(None);
        }
        let ticket = assignment.ticket;
        self.book.issue(ticket);
        if mode == SubmitMode::Sync {
            let threaded = self.threaded.load(Ordering::Relaxed);
            wait_until(self.opts.sync_timeout, || self.opts.poll.pause(), || {
                if !threaded {
                    self.service();
                }
                self.book.is_resolved(ticket).then_some(())
            });
        }
        Ok(Some(ticket))
    }

    pub(crate) fn poll(&self, ticket: Ticket, timeout: Duration) -> PollStatus {
        let threaded = self.threaded.load(Ordering::Relaxed);
        wait_until(timeout, || self.opts.poll.pause(), || {
            if let Some(outcome) = self.book.take(ticket) {
                return Some(outcome);
            }
            if threaded {
                return None;
            }
            self.service();
            self.book.take(ticket)
        })
        .map_or(PollStatus::InProgress, PollStatus::from)
    }

    pub(crate) fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.engine.close();
        let _pass = self.service_lock.lock();
        self.deliver(self.engine.take_deferred());
        let cancelled = self.book.cancel_all();
        if cancelled > 0 {
            log::debug!("dma: {} local tickets cancelled at close", cancelled);
        }
    }
}

/// Spawn the dedicated scanner, optionally pinned to `cpu`.
fn spawn_scanner(core: Arc<ChannelCore>, cpu: Option<usize>) -> Result<JoinHandle<()>> {
    core.threaded.store(true, Ordering::Release);
    let handle = std::thread::Builder::new()
        .name("dma-scanner".into())
        .spawn(move || {
            if let Some(cpu) = cpu {
                pin_to_cpu(cpu);
            }
            while !core.shutdown.load(Ordering::Acquire) {
                if core.service() == 0 {
                    core.opts.poll.pause();
                }
            }
        })?;
    Ok(handle)
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::warn!(
                "dma: could not pin scanner to cpu {}: {}",
                cpu,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(cpu: usize) {
    log::warn!("dma: cpu pinning unsupported here, ignoring cpu {}", cpu);
}

/// The closed set of channel flavours.
pub(crate) enum Transport {
    Local(Arc<ChannelCore>),
    Master(SharedMaster),
    Client(SharedClient),
}

impl Transport {
    fn core(&self) -> Option<&Arc<ChannelCore>> {
        match self {
            Self::Local(core) => Some(core),
            Self::Master(master) => Some(master.core()),
            Self::Client(_) => None,
        }
    }
}

impl DmaTransport for Transport {
    fn submit(&self, req: &DmaRequest, mode: SubmitMode) -> Result<Option<Ticket>> {
        match self {
            Self::Local(core) => core.submit(req, mode),
            Self::Master(master) => master.core().submit(req, mode),
            Self::Client(client) => client.submit(req, mode),
        }
    }

    fn poll(&self, ticket: Ticket, timeout: Duration) -> PollStatus {
        match self {
            Self::Local(core) => core.poll(ticket, timeout),
            Self::Master(master) => master.core().poll(ticket, timeout),
            Self::Client(client) => client.poll(ticket, timeout),
        }
    }

    fn restart(&self, nuke_all: bool) -> Result<()> {
        match self.core() {
            Some(core) => {
                core.engine.soft_restart(nuke_all)?;
                core.deliver(core.engine.take_deferred());
                Ok(())
            }
            None => Err(DmaError::NotMaster),
        }
    }

    fn stats(&self) -> ChannelStats {
        match self {
            Self::Client(client) => client.engine().stats(),
            _ => self.core().map(|c| c.engine.stats()).unwrap_or_default(),
        }
    }

    fn queue_depth(&self) -> usize {
        match self {
            Self::Client(client) => client.engine().queue_depth(),
            _ => self.core().map_or(0, |c| c.engine.queue_depth()),
        }
    }

    fn service(&self) -> usize {
        match self {
            Self::Local(core) => core.service(),
            Self::Master(master) => master.core().service(),
            Self::Client(client) => client.pump(),
        }
    }

    fn close(&self) {
        match self {
            Self::Local(core) => core.close(),
            Self::Master(master) => master.close(),
            Self::Client(client) => client.close(),
        }
    }
}

/// Which side of a channel this handle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Local,
    Master,
    Client,
}

/// Caller-facing handle to one DMA channel.
///
/// Closed on drop; outstanding tickets then resolve as
/// `Faulted(Cancelled)`.
pub struct Channel {
    transport: Transport,
    allocator: Arc<dyn DmaAllocator>,
    scanner: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Channel {
    pub(crate) fn start(transport: Transport, allocator: Arc<dyn DmaAllocator>) -> Result<Self> {
        let scanner = match transport.core() {
            Some(core) if core.opts.scanner_thread => {
                Some(spawn_scanner(core.clone(), core.opts.scanner_cpu)?)
            }
            _ => None,
        };
        Ok(Self {
            transport,
            allocator,
            scanner: Mutex::new(scanner),
            closed: AtomicBool::new(false),
        })
    }

    pub fn role(&self) -> ChannelRole {
        match self.transport {
            Transport::Local(_) => ChannelRole::Local,
            Transport::Master(_) => ChannelRole::Master,
            Transport::Client(_) => ChannelRole::Client,
        }
    }

    /// Submit any request.
    ///
    /// Returns `None` for fire-and-forget submissions. `Sync` returns once
    /// the operation resolved or the sync timeout passed; its outcome is
    /// still collected with [`poll`](Self::poll).
    pub fn submit(
        &self,
        opcode: DmaOpcode,
        dest_id: u16,
        raddr: u64,
        payload: Payload<'_>,
        mode: SubmitMode,
    ) -> Result<Option<Ticket>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DmaError::Closed);
        }
        let req = build_request(opcode, dest_id, raddr, payload)?;
        self.transport.submit(&req, mode)
    }

    pub fn submit_read(
        &self,
        dest_id: u16,
        raddr: u64,
        payload: Payload<'_>,
        mode: SubmitMode,
    ) -> Result<Option<Ticket>> {
        self.submit(DmaOpcode::Read, dest_id, raddr, payload, mode)
    }

    /// Acknowledged write, or a posted write when fire-and-forget.
    pub fn submit_write(
        &self,
        dest_id: u16,
        raddr: u64,
        payload: Payload<'_>,
        mode: SubmitMode,
    ) -> Result<Option<Ticket>> {
        let opcode = match mode {
            SubmitMode::FireAndForget => DmaOpcode::Write,
            _ => DmaOpcode::WriteWithResponse,
        };
        self.submit(opcode, dest_id, raddr, payload, mode)
    }

    /// Outcome of a ticket. A zero `timeout` waits until it resolves.
    ///
    /// # Panics
    /// If `ticket` did not come from this channel or was already collected.
    pub fn poll(&self, ticket: Ticket, timeout: Duration) -> PollStatus {
        self.transport.poll(ticket, timeout)
    }

    /// Inline read that waits for its data.
    pub fn read(&self, dest_id: u16, raddr: u64, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let ticket = self
            .submit_read(dest_id, raddr, Payload::Len(len), SubmitMode::Async)?
            .ok_or(DmaError::Closed)?;
        match self.poll(ticket, timeout) {
            PollStatus::Completed(data) => Ok(data.unwrap_or_default()),
            PollStatus::Faulted(reason) => Err(DmaError::HardwareAbort(reason)),
            PollStatus::InProgress => Err(DmaError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("read of {dest_id}:{raddr:#x} still in flight after {timeout:?}"),
            ))),
        }
    }

    /// Data descriptors in flight on the channel.
    pub fn queue_depth(&self) -> usize {
        self.transport.queue_depth()
    }

    pub fn stats(&self) -> ChannelStats {
        self.transport.stats()
    }

    /// Restart the channel. Master or local channels only.
    pub fn restart(&self, nuke_all: bool) -> Result<()> {
        self.transport.restart(nuke_all)
    }

    /// Do one pass of background work on the calling thread.
    pub fn service(&self) -> usize {
        self.transport.service()
    }

    /// Memory for BULK transfers, reachable by this channel's engine.
    pub fn alloc_buffer(&self, size: usize) -> Result<DmaRegion> {
        Ok(self.allocator.alloc(size)?)
    }

    /// The simulator driving this channel, when there is one here.
    pub fn simulator(&self) -> Option<&Arc<SimEngine>> {
        self.transport.core().and_then(|c| c.sim.as_ref())
    }

    pub fn engine(&self) -> &Engine {
        match &self.transport {
            Transport::Client(client) => client.engine(),
            Transport::Local(core) => &core.engine,
            Transport::Master(master) => &master.core().engine,
        }
    }

    /// Client table index of this handle (client side only).
    pub fn client_index(&self) -> Option<u32> {
        match &self.transport {
            Transport::Client(client) => Some(client.index()),
            _ => None,
        }
    }

    /// Free client slots whose processes have exited. Master only.
    pub fn reap_dead_clients(&self) -> Result<usize> {
        match &self.transport {
            Transport::Master(master) => Ok(shared::reap_dead_clients(&master.core().engine)),
            _ => Err(DmaError::NotMaster),
        }
    }

    /// Stop the channel. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(core) = self.transport.core() {
            core.shutdown.store(true, Ordering::Release);
        }
        if let Some(handle) = self.scanner.lock().take() {
            if handle.join().is_err() {
                log::error!("dma: scanner thread panicked");
            }
        }
        self.transport.close();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
