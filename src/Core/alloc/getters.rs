use super::*;

/// Getter methods used by the debug helpers and by monitoring code.
impl DmaRegion {
    /// Name of the backing /dev/shm object if this handle owns it.
    pub fn owned_name(&self) -> Option<&str> {
        self.owned_name.as_deref()
    }
}
