use std::fmt;

use super::engine::Engine;
use super::Ring::Ring::{CompletionQueue, DescriptorRing};

// Debug proxy implementations that call the standalone debug functions
impl fmt::Debug for DescriptorRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_descriptor_ring(self, f)
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_completion_queue(self, f)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_engine(self, f)
    }
}

impl fmt::Debug for super::channel::Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}
