use std::fmt;
use std::sync::atomic::Ordering;

use crate::Core::alloc::DmaRegion;
use crate::DMA::engine::Engine;
use crate::DMA::sim::SimEngine;
use crate::DMA::Ring::Ring::{CompletionQueue, DescriptorRing};

/// Debug function for DmaRegion
///
/// Shows the bus window and size, never the mapped contents.
pub fn debug_dma_region(region: &DmaRegion, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DmaRegion")
        .field("bus_addr", &format_args!("0x{:x}", region.bus_addr()))
        .field("size", &region.size())
        .field("owned_name", &region.owned_name())
        .finish()
}

/// Debug function for DescriptorRing
pub fn debug_descriptor_ring(ring: &DescriptorRing, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DescriptorRing")
        .field("bus_base", &format_args!("0x{:x}", ring.bus_base()))
        .field("capacity", &ring.capacity())
        .finish()
}

pub fn debug_completion_queue(queue: &CompletionQueue, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionQueue")
        .field("bus_base", &format_args!("0x{:x}", queue.bus_base()))
        .field("rows", &queue.rows())
        .finish()
}

/// Debug function for Engine
///
/// Shows:
/// - Role (master or client view)
/// - Ring geometry
/// - Current write state and occupancy
/// - Restart flag and generation
pub fn debug_engine(engine: &Engine, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let header = engine.layout().header();
    let (write_idx, wp) = engine.write_state();
    f.debug_struct("Engine")
        .field("master", &engine.is_master())
        .field("port_id", &header.port_id)
        .field("channel_id", &header.channel_id)
        .field("ring", engine.ring())
        .field("completion_queue", engine.completion_queue())
        .field("write_idx", &write_idx)
        .field("wp", &wp)
        .field("queue_depth", &engine.queue_depth())
        .field("restart_in_progress", &engine.restart_in_progress())
        .field("restart_gen", &header.restart_gen.load(Ordering::Relaxed))
        .finish_non_exhaustive()
}

/// Debug function for SimEngine
///
/// Register contents are summarized by the status word only.
pub fn debug_sim_engine(sim: &SimEngine, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SimEngine")
        .field("status", &format_args!("0x{:08x}", sim.status()))
        .field("processed", &sim.processed_total())
        .field("links_followed", &sim.links_followed())
        .field("remote_destinations", &sim.remote_destinations())
        .field("auto_progress", &sim.config().auto_progress)
        .finish()
}
