//! Serializable storm reports.

use serde::{Deserialize, Serialize};
use xalloc_heap::PoolStats;

/// Occupancy of one pool at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
}

impl From<PoolStats> for PoolSnapshot {
    fn from(stats: PoolStats) -> Self {
        Self {
            capacity: stats.capacity,
            used_bytes: stats.used_bytes,
            free_bytes: stats.free_bytes,
            used_blocks: stats.used_blocks,
            free_blocks: stats.free_blocks,
            largest_free: stats.largest_free,
        }
    }
}

/// Outcome of one [`crate::Workload`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StormReport {
    pub seed: u64,
    pub steps: u64,
    pub allocs: u64,
    pub frees: u64,
    pub reallocs: u64,
    pub strdups: u64,
    /// Requests the pools could not satisfy.
    pub exhausted: u64,
    /// Reallocations that returned a different pointer.
    pub moved: u64,
    pub peak_live: usize,
    pub peak_bytes: usize,
    pub live_at_end: usize,
    pub bytes_at_end: usize,
    pub main: PoolSnapshot,
    pub temp: Option<PoolSnapshot>,
    /// Usage map of the main pool, one character per bucket.
    pub map: String,
}

impl StormReport {
    /// Fraction of requests that hit exhaustion.
    #[must_use]
    pub fn exhaustion_rate(&self) -> f64 {
        let requests = self.allocs + self.reallocs + self.strdups + self.exhausted;
        if requests == 0 {
            return 0.0;
        }
        self.exhausted as f64 / requests as f64
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
