use std::sync::atomic::Ordering;

use crate::DMA::engine::{Assignment, Engine};
use crate::DMA::error::{DmaError, Result};
use crate::DMA::Ring::layout::PendingSlot;
use crate::DMA::Ring::Ring::wp_add;
use crate::DMA::Structs::Descriptor_Structs::{
    now_ns, DescKind, Descriptor, DmaRequest, Owner, SubmitMode, Ticket, INLINE_MAX,
};

/// Slots never available to data: the wrap LINK plus the empty/full margin.
pub const RESERVED_SLOTS: u32 = 2;

impl Engine {
    /// Place one request in the ring.
    ///
    /// The pending entry and busy bit are recorded before the descriptor
    /// becomes visible to the hardware, so a concurrent scan can never see
    /// a completion for an unrecorded slot. Fails with `QueueFull` when the
    /// ring has no room; that is a normal, retryable condition.
    pub fn enqueue(&self, req: &DmaRequest, mode: SubmitMode, owner: Owner) -> Result<Assignment> {
        validate_request(req)?;

        let header = self.layout.header();
        let capacity = self.ring.capacity();
        let wrap_idx = self.ring.wrap_idx();

        let mut sub = self.layout.lock_submit();
        if header.closed.load(Ordering::Acquire) != 0 {
            return Err(DmaError::Closed);
        }

        let idx = sub.state.write_idx;
        let wp = sub.state.wp;
        let wraps = idx + 1 == wrap_idx;

        let ticket = {
            let mut busy = self.layout.lock_busy();
            if header.busy_count.load(Ordering::Acquire) + RESERVED_SLOTS >= capacity
                || busy.is_busy(idx)
                || (wraps && busy.is_busy(wrap_idx))
            {
                log::trace!("dma: ring full at slot {}", idx);
                return Err(DmaError::QueueFull);
            }

            sub.state.next_ticket += 1;
            let ticket = sub.state.next_ticket;
            busy.record(
                idx,
                PendingSlot {
                    mode: mode as u8,
                    owner,
                    ticket,
                    wp,
                    idx,
                    submitted_ns: now_ns(),
                    request: *req,
                    ..PendingSlot::EMPTY
                },
            );
            if wraps {
                // The wrap LINK is consumed with this descriptor and never completes on its own
                busy.mark_artifact(wrap_idx);
            }
            ticket
        };

        self.ring.write(idx, &Descriptor::from_request(req, wp));
        if wraps {
            // Recovery may have redirected it
            self.ring.write_link(wrap_idx, 0);
            self.note_wrap();
        }
        std::sync::atomic::fence(Ordering::Release);

        sub.state.wp = wp_add(wp, if wraps { 2 } else { 1 });
        sub.state.write_idx = if wraps { 0 } else { idx + 1 };
        header.doorbell_wp.store(sub.state.wp, Ordering::Release);
        header.stats.submitted.fetch_add(1, Ordering::Relaxed);
        drop(sub);

        self.ring_doorbell();

        Ok(Assignment {
            idx,
            wp,
            ticket: Ticket(ticket),
            wrapped: wraps,
        })
    }
}

fn validate_request(req: &DmaRequest) -> Result<()> {
    match req.kind {
        DescKind::Inline if req.len == 0 || req.len as usize > INLINE_MAX => {
            Err(DmaError::InvalidRequest(format!(
                "inline transfer of {} bytes (1..={INLINE_MAX} allowed)",
                req.len
            )))
        }
        DescKind::Bulk if req.len == 0 || req.len as u64 != req.buffer.size => {
            Err(DmaError::InvalidRequest(format!(
                "bulk transfer length {} does not match buffer of {} bytes",
                req.len, req.buffer.size
            )))
        }
        DescKind::Link => Err(DmaError::InvalidRequest(
            "LINK descriptors are managed by the ring".into(),
        )),
        _ => Ok(()),
    }
}
