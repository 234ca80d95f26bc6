//! Allocation request flags shared by the façade and every backend.

bitflags::bitflags! {
    /// Flags recognized on allocation and reallocation requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Zero-fill new (or newly grown) bytes.
        const CLEAR = 1 << 0;
        /// Prefer the short-lived pool.
        const TEMP = 1 << 1;
        /// Allocate from high addresses when the backend supports it.
        const TOP = 1 << 2;
    }
}

impl AllocFlags {
    /// Flags with the pool-selection bit removed, used for main-pool fallback.
    #[must_use]
    pub fn without_temp(self) -> Self {
        self.difference(Self::TEMP)
    }
}
