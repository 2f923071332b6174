use crate::DMA::Structs::Descriptor_Structs::AbortReason;
use thiserror::Error;

/// Errors returned to channel callers.
///
/// Ring/bookkeeping inconsistencies are not represented here: they are
/// defects and panic where they are detected.
#[derive(Debug, Error)]
pub enum DmaError {
    /// The ring has no free slot right now. Retry after completions drain.
    #[error("descriptor ring full")]
    QueueFull,

    #[error("hardware abort: {0}")]
    HardwareAbort(AbortReason),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("channel closed")]
    Closed,

    /// Operation reserved for the process that owns the hardware.
    #[error("operation requires the channel master")]
    NotMaster,

    #[error("no free client slot in the shared channel")]
    NoFreeClientSlot,

    #[error("shared channel layout: {0}")]
    Layout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DmaError {
    /// True for conditions a caller is expected to simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull)
    }
}

pub type Result<T> = std::result::Result<T, DmaError>;
