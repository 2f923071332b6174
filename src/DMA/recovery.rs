// Abort handling: Running -> Suspected-Abort -> Restarting -> Running.
//
// `cleanup_bd_queue` works out what can be salvaged and patches the ring;
// `soft_restart` reprograms the hardware from that plan, or wipes
// everything when there is no plan worth keeping.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::Core::regs::*;
use crate::DMA::engine::{classify_status, Engine};
use crate::DMA::error::{DmaError, Result};
use crate::DMA::Ring::layout::{BusyGuard, SubmitGuard};
use crate::DMA::Ring::Ring::{wp_add, wp_distance};
use crate::DMA::Structs::Descriptor_Structs::AbortReason;

/// Where the hardware stopped, read under the register lock.
#[derive(Debug, Clone, Copy)]
struct HaltPoint {
    status: u32,
    rd: u32,
    dptr: u64,
}

impl Engine {
    /// Salvage a halted channel.
    ///
    /// Drains completions already written, then computes the work still
    /// queued between the hardware read position and the write position.
    /// On a fault the failing operation is resolved as faulted and the
    /// slot before it becomes a LINK jumping past it. Returns the number of
    /// salvaged descriptors, or `None` when nothing can be trusted and only
    /// `soft_restart(true)` is left.
    ///
    /// When a plan is staged the restart flag stays raised until
    /// `soft_restart` runs. On `None` the flag is dropped again so the
    /// scanner keeps serving the channel.
    pub fn cleanup_bd_queue(&self, multithreaded_scanner: bool) -> Option<u32> {
        if !self.is_master() {
            log::error!("dma: cleanup_bd_queue() on a client handle");
            return None;
        }
        let header = self.layout.header();

        if multithreaded_scanner {
            // Let the live scanner finish what it is already looking at
            let deadline = Instant::now() + self.drain_grace;
            while self.completions_pending() && Instant::now() < deadline {
                std::thread::yield_now();
            }
        }
        header.restart_in_progress.store(1, Ordering::Release);
        let staged = self.stage_plan();
        if staged.is_none() {
            header.restart_in_progress.store(0, Ordering::Release);
        }
        staged
    }

    /// Drain, locate the halt point and patch the ring. Runs with the
    /// restart flag raised.
    fn stage_plan(&self) -> Option<u32> {
        let mut sub = self.layout.lock_submit();
        let mut busy = self.layout.lock_busy();

        // Whatever the scanner did not get to
        let mut swept = Vec::new();
        while self.scan_row(&mut busy, usize::MAX, &mut swept).more {}
        if !swept.is_empty() {
            log::debug!("dma: recovery drained {} completions", swept.len());
            for item in swept {
                self.defer(item);
            }
        }

        let halt = self.with_regs(|regs| HaltPoint {
            status: regs.read32(DMA_STS),
            rd: regs.read32(DMA_DRDCNT),
            dptr: regs.read64(DMA_DPTRL, DMA_DPTRH),
        })?;
        let w = sub.state.wp;

        let plan = match classify_status(halt.status) {
            Some(reason) => self.plan_after_fault(&mut busy, halt, w, reason),
            None if halt.status & (DMA_STS_SUSPENDED | DMA_STS_RUN) != DMA_STS_RUN => {
                self.plan_after_suspend(&mut busy, halt, w)
            }
            None => {
                log::warn!("dma: cleanup requested while the channel is running");
                None
            }
        };

        let (origin, next, outstanding) = plan?;
        self.ring.write_link(origin, next);
        busy.mark_artifact(origin);
        busy.track.plan_origin = origin;
        busy.track.plan_wp = wp_add(outstanding, 1);
        busy.track.plan_base = w;

        log::info!(
            "dma: recovery plan: origin {} -> {}, {} descriptors salvaged (W={}, R={})",
            origin,
            next,
            outstanding,
            w,
            halt.rd
        );
        drop(busy);
        drop(sub);
        Some(outstanding)
    }

    fn plan_after_fault(
        &self,
        busy: &mut BusyGuard<'_>,
        halt: HaltPoint,
        w: u32,
        reason: AbortReason,
    ) -> Option<(u32, u32, u32)> {
        let Some(bad) = self.ring.index_of(halt.dptr) else {
            log::error!(
                "dma: fault at bus {:#x} outside the ring; nothing salvageable",
                halt.dptr
            );
            return None;
        };
        let queued = wp_distance(halt.rd, w);
        if queued == 0 {
            log::error!(
                "dma: fault at slot {} but no descriptors outstanding (W={}, R={})",
                bad,
                w,
                halt.rd
            );
            return None;
        }

        if let Some(slot) = busy.take(bad) {
            log::warn!(
                "dma: ticket {} at slot {} failed: {}",
                slot.ticket,
                bad,
                reason
            );
            self.defer_faulted(bad, &slot, reason);
        }

        let desc = self.ring.read(bad);
        let (origin, next) = if desc.is_link() {
            let Some(target) = self.ring.index_of(desc.local) else {
                log::error!("dma: faulted LINK at slot {} points outside the ring", bad);
                return None;
            };
            (bad, target)
        } else {
            // Slot 0 falls back on the wrap LINK as origin
            (self.ring.prev(bad), self.ring.next(bad))
        };

        if origin != bad {
            if busy.pending[origin as usize].is_valid() {
                self.note_unsalvageable(origin, bad);
                return None;
            }
            busy.mark_artifact(bad);
        }
        Some((origin, next, queued - 1))
    }

    fn plan_after_suspend(
        &self,
        busy: &mut BusyGuard<'_>,
        halt: HaltPoint,
        w: u32,
    ) -> Option<(u32, u32, u32)> {
        let Some(next) = self.ring.index_of(halt.dptr) else {
            log::error!(
                "dma: suspended at bus {:#x} outside the ring; nothing salvageable",
                halt.dptr
            );
            return None;
        };
        let origin = self.ring.prev(next);
        if busy.pending[origin as usize].is_valid() {
            self.note_unsalvageable(origin, next);
            return None;
        }
        Some((origin, next, wp_distance(halt.rd, w)))
    }

    fn note_unsalvageable(&self, origin: u32, at: u32) {
        self.layout
            .header()
            .stats
            .desync
            .fetch_add(1, Ordering::Relaxed);
        log::error!(
            "dma: slot {} before halt point {} still holds pending work; ring and completions disagree",
            origin,
            at
        );
    }

    /// Ask the hardware to stop and wait (bounded) until it has.
    pub fn suspend(&self) -> bool {
        if self
            .with_regs(|regs| regs.write32(DMA_CTL, DMA_CTL_SUSPEND))
            .is_none()
        {
            return false;
        }
        let deadline = Instant::now() + self.drain_grace;
        loop {
            let status = self
                .with_regs(|regs| regs.read32(DMA_STS))
                .unwrap_or_default();
            if status & (DMA_STS_SUSPENDED | DMA_STS_ABORT) != 0 || status & DMA_STS_RUN == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                log::warn!("dma: channel did not suspend within {:?}", self.drain_grace);
                return false;
            }
            std::thread::yield_now();
        }
    }

    /// Reprogram the hardware and resume.
    ///
    /// With `nuke_all` the ring, completion queue and pending table are
    /// wiped and every queued operation resolves as cancelled. Otherwise
    /// the plan staged by `cleanup_bd_queue` is applied; without one the
    /// channel is suspended and salvaged first.
    pub fn soft_restart(&self, nuke_all: bool) -> Result<()> {
        if !self.is_master() {
            return Err(DmaError::NotMaster);
        }
        let header = self.layout.header();

        if !nuke_all && !self.layout.lock_busy().track.has_plan() {
            if !self.suspend() || self.cleanup_bd_queue(false).is_none() {
                log::warn!("dma: nothing salvageable, restarting from empty");
                return self.soft_restart(true);
            }
        }

        header.restart_in_progress.store(1, Ordering::Release);
        {
            let mut sub = self.layout.lock_submit();
            let mut busy = self.layout.lock_busy();

            if nuke_all || !busy.track.has_plan() {
                self.with_regs(|regs| regs.write32(DMA_CTL, DMA_CTL_SUSPEND));
                let dropped = busy.clear_all();
                for slot in &dropped {
                    self.defer_faulted(slot.idx, slot, AbortReason::Cancelled);
                }
                self.reset_ring_state(&mut sub, &mut busy);
                self.program(0, sub.state.wp);
                log::warn!(
                    "dma: channel restarted from empty, {} queued operations cancelled",
                    dropped.len()
                );
            } else {
                let origin = busy.track.plan_origin;
                // Count anything submitted between the plan and now
                let late = wp_distance(busy.track.plan_base, sub.state.wp);
                let wp = wp_add(busy.track.plan_wp, late);
                busy.track.clear_plan();

                self.sts.reset();
                busy.track.sts_rd = 0;
                sub.state.wp = wp;
                self.program(origin, wp);
                log::info!("dma: channel restarted at slot {} with wp {}", origin, wp);
            }

            header.restart_gen.fetch_add(1, Ordering::AcqRel);
            header.stats.restarts.fetch_add(1, Ordering::Relaxed);
        }
        header.restart_in_progress.store(0, Ordering::Release);
        Ok(())
    }

    /// Empty ring with the origin LINK at slot 0 jumping to slot 1.
    pub(crate) fn reset_ring_state(&self, sub: &mut SubmitGuard<'_>, busy: &mut BusyGuard<'_>) {
        self.ring.reset();
        self.ring.write_link(0, 1);
        // Released by the sweep behind the first completion
        busy.mark_artifact(0);
        self.sts.reset();
        busy.track.sts_rd = 0;
        busy.track.clear_plan();
        sub.state.write_idx = 1;
        sub.state.wp = 1;
    }
}
