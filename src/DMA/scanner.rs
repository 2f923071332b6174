// Completion matching. Entries are consumed one completion-queue row at a
// time, each row under one short hold of the busy lock.

use std::sync::atomic::Ordering;

use crate::Core::regs::DMA_SRDP;
use crate::DMA::engine::Engine;
use crate::DMA::Ring::layout::BusyGuard;
use crate::DMA::Ring::Ring::STS_ROW_ENTRIES;
use crate::DMA::Structs::Descriptor_Structs::{
    now_ns, CompletedItem, DescKind, Outcome, Ticket,
};

/// Result of scanning within one completion row.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RowScan {
    /// Row the read pointer moved into, if it left its row.
    pub new_row: Option<u32>,
    /// The row was consumed to its end; the next one may hold more.
    pub more: bool,
}

impl Engine {
    /// Drain up to `max_items` completions.
    ///
    /// Stands off while a restart owns the ring and stops early if one
    /// begins mid-scan. Entries that match no pending work are logged,
    /// counted and discarded.
    pub fn scan(&self, max_items: usize) -> Vec<CompletedItem> {
        let mut out = Vec::new();
        if max_items == 0 || !self.is_master() {
            return out;
        }

        let header = self.layout.header();
        if header.restart_in_progress.load(Ordering::Acquire) != 0 {
            return out;
        }
        let generation = header.restart_gen.load(Ordering::Acquire);

        loop {
            let step = {
                let mut busy = self.layout.lock_busy();
                if header.restart_in_progress.load(Ordering::Acquire) != 0
                    || header.restart_gen.load(Ordering::Acquire) != generation
                {
                    break;
                }
                self.scan_row(&mut busy, max_items - out.len(), &mut out)
            };

            if let Some(row) = step.new_row {
                self.with_regs(|regs| regs.write32(DMA_SRDP, row));
            }
            if !step.more || out.len() >= max_items {
                break;
            }
        }
        out
    }

    /// True when the entry at the read pointer has been written.
    pub fn completions_pending(&self) -> bool {
        let busy = self.layout.lock_busy();
        self.sts.load(busy.track.sts_rd) != 0
    }

    /// Consume entries from the read pointer to the end of its row.
    pub(crate) fn scan_row(
        &self,
        busy: &mut BusyGuard<'_>,
        budget: usize,
        out: &mut Vec<CompletedItem>,
    ) -> RowScan {
        let row_len = STS_ROW_ENTRIES as u32;
        let start = busy.track.sts_rd;
        let row = start / row_len;
        let mut rd = start;
        let mut found = 0usize;
        let mut emptied = false;

        while found < budget {
            let bus = self.sts.load(rd);
            if bus == 0 {
                emptied = true;
                break;
            }
            if let Some(item) = self.match_entry(busy, rd, bus) {
                out.push(item);
                found += 1;
            }
            // Zero so the entry can never be matched again
            self.sts.clear(rd);
            rd = self.sts.next(rd);
            if rd / row_len != row {
                break;
            }
        }

        busy.track.sts_rd = rd;
        let crossed = rd / row_len != row;
        RowScan {
            new_row: crossed.then_some(rd / row_len),
            more: crossed && !emptied,
        }
    }

    fn match_entry(&self, busy: &mut BusyGuard<'_>, entry: u32, bus: u64) -> Option<CompletedItem> {
        let Some(idx) = self.ring.index_of(bus) else {
            self.note_desync(entry, bus, "is outside the ring");
            return None;
        };
        let Some(slot) = busy.take(idx) else {
            self.note_desync(entry, bus, "matches no pending work");
            return None;
        };

        let data = match (slot.request.kind, slot.request.opcode.is_read()) {
            (DescKind::Inline, true) => {
                let len = slot.request.len as usize;
                Some(self.ring.read_inline(idx)[..len].to_vec())
            }
            _ => None,
        };

        self.sweep_artifacts(busy, idx);
        self.layout
            .header()
            .stats
            .completed
            .fetch_add(1, Ordering::Relaxed);

        Some(CompletedItem {
            ticket: Ticket(slot.ticket),
            owner: slot.owner,
            mode: slot.mode(),
            request: slot.request,
            idx,
            wp: slot.wp,
            submitted_ns: slot.submitted_ns,
            completed_ns: now_ns(),
            outcome: Outcome::Completed(data),
        })
    }

    /// Release LINK and skipped slots the hardware has now moved past.
    ///
    /// Walks backwards from `idx` until a free slot or one still holding
    /// pending work.
    fn sweep_artifacts(&self, busy: &mut BusyGuard<'_>, idx: u32) {
        let mut j = self.ring.prev(idx);
        while j != idx && busy.is_artifact(j) {
            busy.clear_artifact(j);
            j = self.ring.prev(j);
        }
    }

    fn note_desync(&self, entry: u32, bus: u64, what: &str) {
        let header = self.layout.header();
        let seen = header.stats.desync.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!(
            "dma: completion entry {} (bus {:#x}) {}; skipped ({} so far)",
            entry,
            bus,
            what,
            seen
        );
    }
}
