// One physical DMA channel: the descriptor ring, the completion queue and
// the shared bookkeeping that ties them to caller work.
//
// The submission path lives in submit.rs, completion matching in
// scanner.rs and abort handling in recovery.rs.

use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::Core::alloc::DmaRegion;
use crate::Core::regs::*;
use crate::Core::SharedMemory::SharedMemoryBackend;
use crate::DMA::error::{DmaError, Result};
use crate::DMA::mailbox::CompletionMailbox;
use crate::DMA::Ring::layout::{ChannelLayout, LayoutParams, PendingSlot, MAX_CLIENTS};
use crate::DMA::Ring::Ring::{
    CompletionQueue, DescriptorRing, MAX_RING_CAPACITY, MIN_RING_CAPACITY,
};
use crate::DMA::Structs::Descriptor_Structs::{
    now_ns, AbortReason, CompletedItem, Outcome, Ticket,
};

/// Shape of a channel, fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub capacity: u32,
    pub sts_rows: u32,
    pub max_clients: u32,
    pub mailbox_capacity: u32,
    pub port_id: u32,
    pub channel_id: u32,
}

impl Geometry {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_RING_CAPACITY..=MAX_RING_CAPACITY).contains(&self.capacity) {
            return Err(DmaError::InvalidRequest(format!(
                "ring capacity {} outside [{MIN_RING_CAPACITY}, {MAX_RING_CAPACITY}]",
                self.capacity
            )));
        }
        if self.sts_rows == 0 {
            return Err(DmaError::InvalidRequest(
                "completion queue needs at least one row".into(),
            ));
        }
        if self.max_clients > MAX_CLIENTS {
            return Err(DmaError::InvalidRequest(format!(
                "at most {MAX_CLIENTS} clients per channel"
            )));
        }
        if self.max_clients > 0 && !self.mailbox_capacity.is_power_of_two() {
            return Err(DmaError::InvalidRequest(format!(
                "mailbox capacity {} must be a power of two",
                self.mailbox_capacity
            )));
        }
        Ok(())
    }

    /// Bytes of shared state a channel of this shape needs.
    pub fn layout_size(&self) -> usize {
        ChannelLayout::required_size(&LayoutParams {
            capacity: self.capacity,
            sts_rows: self.sts_rows,
            max_clients: self.max_clients,
            mailbox_capacity: self.mailbox_capacity,
            port_id: self.port_id,
            channel_id: self.channel_id,
            ring_bus: 0,
            sts_bus: 0,
        })
    }
}

/// Where a submission landed in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub idx: u32,
    /// Write position of the descriptor.
    pub wp: u32,
    pub ticket: Ticket,
    /// The wrap LINK was consumed together with this descriptor.
    pub wrapped: bool,
}

/// Snapshot of a channel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub submitted: u64,
    pub completed: u64,
    pub faulted: u64,
    /// Completion entries that matched no pending work.
    pub desync: u64,
    pub restarts: u64,
    pub wraps: u64,
    pub queue_depth: usize,
}

pub(crate) struct Hardware {
    pub(crate) regs: Arc<dyn RegisterAccess>,
    /// Register window lock. Never held while waiting on anything.
    lock: Mutex<()>,
}

pub struct Engine {
    pub(crate) layout: ChannelLayout,
    pub(crate) ring: DescriptorRing,
    pub(crate) sts: CompletionQueue,
    hw: Option<Hardware>,
    /// Items resolved outside `scan` (faults, cancellations, completions
    /// swept up during recovery) waiting to be handed out.
    deferred: Mutex<Vec<CompletedItem>>,
    pub(crate) drain_grace: Duration,
    wraps: std::sync::atomic::AtomicU64,
}

impl Engine {
    /// Build a fresh channel in `layout_mem` and program the hardware.
    pub fn create(
        layout_mem: Box<dyn SharedMemoryBackend>,
        ring_region: Arc<DmaRegion>,
        sts_region: Arc<DmaRegion>,
        geometry: Geometry,
        regs: Arc<dyn RegisterAccess>,
        drain_grace: Duration,
    ) -> Result<Self> {
        geometry.validate()?;

        let ring = DescriptorRing::new(ring_region, geometry.capacity).ok_or_else(|| {
            DmaError::InvalidRequest("descriptor ring region too small".into())
        })?;
        let sts = CompletionQueue::new(sts_region, geometry.sts_rows).ok_or_else(|| {
            DmaError::InvalidRequest("completion queue region too small".into())
        })?;

        let params = LayoutParams {
            capacity: geometry.capacity,
            sts_rows: geometry.sts_rows,
            max_clients: geometry.max_clients,
            mailbox_capacity: geometry.mailbox_capacity,
            port_id: geometry.port_id,
            channel_id: geometry.channel_id,
            ring_bus: ring.bus_base(),
            sts_bus: sts.bus_base(),
        };
        let layout = ChannelLayout::init(layout_mem, &params)?;

        let engine = Self {
            layout,
            ring,
            sts,
            hw: Some(Hardware {
                regs,
                lock: Mutex::new(()),
            }),
            deferred: Mutex::new(Vec::new()),
            drain_grace,
            wraps: std::sync::atomic::AtomicU64::new(0),
        };

        {
            let mut sub = engine.layout.lock_submit();
            let mut busy = engine.layout.lock_busy();
            engine.reset_ring_state(&mut sub, &mut busy);
            engine.program(0, sub.state.wp);
        }

        log::info!(
            "dma: channel {}:{} open, {} descriptors at bus {:#x}, {} completion rows",
            geometry.port_id,
            geometry.channel_id,
            geometry.capacity,
            engine.ring.bus_base(),
            geometry.sts_rows
        );
        Ok(engine)
    }

    /// View an existing channel without hardware access (client side).
    pub fn attach(
        layout: ChannelLayout,
        ring_region: Arc<DmaRegion>,
        sts_region: Arc<DmaRegion>,
        drain_grace: Duration,
    ) -> Result<Self> {
        let header = layout.header();
        if ring_region.bus_addr() != header.ring_bus || sts_region.bus_addr() != header.sts_bus {
            return Err(DmaError::Layout(
                "mapped ring regions do not match the channel header".into(),
            ));
        }
        let ring = DescriptorRing::new(ring_region, header.capacity)
            .ok_or_else(|| DmaError::Layout("descriptor ring mapping too small".into()))?;
        let sts = CompletionQueue::new(sts_region, header.sts_rows)
            .ok_or_else(|| DmaError::Layout("completion queue mapping too small".into()))?;

        Ok(Self {
            layout,
            ring,
            sts,
            hw: None,
            deferred: Mutex::new(Vec::new()),
            drain_grace,
            wraps: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn is_master(&self) -> bool {
        self.hw.is_some()
    }

    pub fn capacity(&self) -> u32 {
        self.ring.capacity()
    }

    pub fn ring(&self) -> &DescriptorRing {
        &self.ring
    }

    pub fn completion_queue(&self) -> &CompletionQueue {
        &self.sts
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Data descriptors submitted but not yet completed.
    pub fn queue_depth(&self) -> usize {
        self.layout.busy_count() as usize
    }

    pub fn is_closed(&self) -> bool {
        self.layout.header().closed.load(Ordering::Acquire) != 0
    }

    pub fn restart_in_progress(&self) -> bool {
        self.layout.header().restart_in_progress.load(Ordering::Acquire) != 0
    }

    /// Next slot to fill and the current write position.
    pub fn write_state(&self) -> (u32, u32) {
        let sub = self.layout.lock_submit();
        (sub.state.write_idx, sub.state.wp)
    }

    pub fn stats(&self) -> ChannelStats {
        let s = &self.layout.header().stats;
        ChannelStats {
            submitted: s.submitted.load(Ordering::Relaxed),
            completed: s.completed.load(Ordering::Relaxed),
            faulted: s.faulted.load(Ordering::Relaxed),
            desync: s.desync.load(Ordering::Relaxed),
            restarts: s.restarts.load(Ordering::Relaxed),
            wraps: self.wraps.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
        }
    }

    pub(crate) fn note_wrap(&self) {
        self.wraps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mailbox(&self, client: u32) -> Option<CompletionMailbox> {
        self.layout.mailbox(client)
    }

    /// Run `f` with the register window locked. `None` on a client.
    pub(crate) fn with_regs<R>(&self, f: impl FnOnce(&dyn RegisterAccess) -> R) -> Option<R> {
        let hw = self.hw.as_ref()?;
        let _guard = hw.lock.lock();
        Some(f(&*hw.regs))
    }

    /// Hand the latest published write position to the hardware.
    ///
    /// Submitters publish under the submit lock and call this after
    /// releasing it, so the count written here never goes backwards.
    pub(crate) fn ring_doorbell(&self) {
        let header = self.layout.header();
        self.with_regs(|regs| {
            let wp = header.doorbell_wp.load(Ordering::Acquire);
            if regs.read32(DMA_DWRCNT) != wp {
                regs.write32(DMA_DWRCNT, wp);
            }
        });
    }

    /// Point the hardware at `origin` with `wp` descriptors to fetch.
    pub(crate) fn program(&self, origin: u32, wp: u32) {
        let ring_bus = self.ring.slot_bus(origin);
        let sts_bus = self.sts.bus_base();
        let capacity = self.ring.capacity();
        let rows = self.sts.rows();
        self.layout.header().doorbell_wp.store(wp, Ordering::Release);
        self.with_regs(|regs| {
            regs.write64(DMA_DSBL, DMA_DSBH, ring_bus);
            regs.write32(DMA_DSSZ, capacity);
            regs.write64(DMA_SBL, DMA_SBH, sts_bus);
            regs.write32(DMA_SSZ, rows);
            regs.write32(DMA_CTL, DMA_CTL_INIT);
            regs.write32(DMA_SRDP, 0);
            regs.write32(DMA_DWRCNT, wp);
        });
    }

    /// Inspect the status register. Does not change channel state.
    pub fn check_abort(&self) -> Option<AbortReason> {
        let status = self.with_regs(|regs| regs.read32(DMA_STS))?;
        classify_status(status)
    }

    /// Queue an item resolved outside the scanner for delivery.
    pub(crate) fn defer(&self, item: CompletedItem) {
        if let Outcome::Faulted(_) = item.outcome {
            self.layout
                .header()
                .stats
                .faulted
                .fetch_add(1, Ordering::Relaxed);
        }
        self.deferred.lock().push(item);
    }

    pub(crate) fn defer_faulted(&self, idx: u32, slot: &PendingSlot, reason: AbortReason) {
        self.defer(CompletedItem {
            ticket: Ticket(slot.ticket),
            owner: slot.owner,
            mode: slot.mode(),
            request: slot.request,
            idx,
            wp: slot.wp,
            submitted_ns: slot.submitted_ns,
            completed_ns: now_ns(),
            outcome: Outcome::Faulted(reason),
        });
    }

    /// Items resolved by recovery, restart or close since the last call.
    pub fn take_deferred(&self) -> Vec<CompletedItem> {
        std::mem::take(&mut *self.deferred.lock())
    }

    /// Stop the hardware and cancel everything still queued.
    pub fn close(&self) {
        let header = self.layout.header();
        if !self.is_master() || header.closed.swap(1, Ordering::AcqRel) != 0 {
            return;
        }
        self.with_regs(|regs| regs.write32(DMA_CTL, DMA_CTL_SUSPEND));

        let _sub = self.layout.lock_submit();
        let mut busy = self.layout.lock_busy();
        let dropped = busy.clear_all();
        let n = dropped.len();
        for slot in &dropped {
            self.defer_faulted(slot.idx, slot, AbortReason::Cancelled);
        }
        log::info!("dma: channel closed, {} queued operations cancelled", n);
    }
}

/// Map a status register value to an abort reason. `None` unless aborted.
pub fn classify_status(status: u32) -> Option<AbortReason> {
    if status & DMA_STS_ABORT == 0 {
        return None;
    }
    Some(match status & DMA_STS_CODE_MASK {
        ABORT_CODE_NONE => AbortReason::NoFault,
        ABORT_CODE_TIMEOUT => AbortReason::Timeout,
        ABORT_CODE_RIO_ERR => AbortReason::RemoteIoError,
        ABORT_CODE_IMPL_ERR => AbortReason::RemoteImplError,
        ABORT_CODE_PCIE => AbortReason::LocalBusError,
        code => {
            log::warn!("dma: unknown abort code {:#x}", code);
            AbortReason::RemoteImplError
        }
    })
}
