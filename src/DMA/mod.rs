mod builder;
mod channel;
mod debug;
pub mod engine;
pub mod error;
pub mod mailbox;
mod recovery;
mod scanner;
pub mod shared;
pub mod sim;
mod submit;

pub use builder::{ChannelBuilder, PollStrategy};
pub use channel::{build_request, Channel, ChannelRole, DmaTransport, Payload, PollStatus};
pub use engine::{classify_status, Assignment, ChannelStats, Engine, Geometry};
pub use error::{DmaError, Result};
pub use sim::{
    SimConfig, SimEngine, SIM_INJECT_IMPL_ERR, SIM_INJECT_PCIE_ERR, SIM_INJECT_RIO_ERR,
    SIM_INJECT_TIMEOUT,
};
pub use submit::RESERVED_SLOTS;

pub mod Ring {
    pub mod Ring;
    pub mod Ring_impl;
    pub mod layout;
    pub use Ring::{wp_add, wp_distance, wp_reached, CompletionQueue, DescriptorRing, WP_NONE}; // re-export for stable path
}

pub mod Structs {
    pub mod Descriptor_Structs;
    pub use Descriptor_Structs::{
        abort_reason_to_string, AbortReason, CompletedItem, DescKind, Descriptor, DmaOpcode,
        DmaRequest, Outcome, Owner, SubmitMode, Ticket,
    }; // re-export for stable path
}
