// Module naming follows project convention (DMA = descriptor-ring channel engine)
#![allow(non_snake_case)]

pub mod Core;
pub mod DMA;

pub mod Debug {
    pub mod StructDebug;
}

pub use DMA::Structs::{abort_reason_to_string, AbortReason, DmaOpcode, SubmitMode, Ticket};
pub use DMA::{
    Channel, ChannelBuilder, ChannelStats, DmaError, Payload, PollStatus, PollStrategy, Result,
    SimConfig,
};
