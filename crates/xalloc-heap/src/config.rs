//! Pool backend configuration.

use crate::area::AREA_HEADER_SIZE;
use crate::error::HeapError;

/// Smallest supported block granularity (two header stamps).
pub const MIN_GRANULARITY: usize = 2 * AREA_HEADER_SIZE;

/// Granularity used when none is configured.
pub const DEFAULT_GRANULARITY: usize = 64;

/// Sizes and policy switches for a [`crate::PoolHeap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Bytes of backing storage for the main pool.
    pub main_size: usize,
    /// Bytes of backing storage for the temp pool; 0 disables it.
    pub temp_size: usize,
    /// Block size unit. Power of two, at least [`MIN_GRANULARITY`].
    pub granularity: usize,
    /// Run the full structural audit after every mutating operation.
    pub self_check: bool,
}

impl PoolConfig {
    /// Main pool only.
    #[must_use]
    pub fn single(main_size: usize) -> Self {
        Self {
            main_size,
            temp_size: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_temp(mut self, temp_size: usize) -> Self {
        self.temp_size = temp_size;
        self
    }

    #[must_use]
    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    #[must_use]
    pub fn with_self_check(mut self, enabled: bool) -> Self {
        self.self_check = enabled;
        self
    }

    /// Checks the granularity constraint.
    pub fn validate(&self) -> Result<(), HeapError> {
        if !self.granularity.is_power_of_two() || self.granularity < MIN_GRANULARITY {
            return Err(HeapError::InvalidGranularity(self.granularity));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            main_size: 1024 * 1024,
            temp_size: 256 * 1024,
            granularity: DEFAULT_GRANULARITY,
            self_check: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(PoolConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_non_power_of_two_granularity() {
        let cfg = PoolConfig::single(4096).with_granularity(96);
        assert_eq!(cfg.validate(), Err(HeapError::InvalidGranularity(96)));
    }

    #[test]
    fn rejects_granularity_smaller_than_two_stamps() {
        let cfg = PoolConfig::single(4096).with_granularity(16);
        assert_eq!(cfg.validate(), Err(HeapError::InvalidGranularity(16)));
    }

    #[test]
    fn single_disables_temp_pool() {
        let cfg = PoolConfig::single(8192);
        assert_eq!(cfg.temp_size, 0);
        assert_eq!(cfg.main_size, 8192);
    }
}
