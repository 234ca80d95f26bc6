//! Seeded allocation storms against a pool-backed allocator.

use log::{debug, info};
use xalloc_core::{
    AllocError, AllocFlags, AllocatorConfig, DEFAULT_ALIGN, ExtendedAllocator, Site, UsageTag, map,
};
use xalloc_heap::{DEFAULT_GRANULARITY, PoolConfig, PoolHeap};

use crate::error::HarnessError;
use crate::report::{PoolSnapshot, StormReport};

const ALIGNS: [usize; 6] = [0, 8, 16, 32, 64, 128];

/// Deterministic xorshift64* generator.
#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        // A zero state never leaves zero.
        Self { state: seed.max(1) }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }

    /// True with probability `percent / 100`.
    pub fn chance(&mut self, percent: usize) -> bool {
        self.gen_range(0, 99) < percent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadConfig {
    pub seed: u64,
    pub steps: u64,
    pub main_bytes: usize,
    pub temp_bytes: usize,
    pub granularity: usize,
    /// Largest single request.
    pub max_size: usize,
    /// Buckets in the rendered usage map.
    pub map_buckets: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: 0xDEAD_BEEF,
            steps: 2_000,
            main_bytes: 256 * 1024,
            temp_bytes: 32 * 1024,
            granularity: DEFAULT_GRANULARITY,
            max_size: 4096,
            map_buckets: 64,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Live {
    ptr: usize,
    size: usize,
    fill: u8,
}

#[derive(Debug, Default)]
struct Counters {
    allocs: u64,
    frees: u64,
    reallocs: u64,
    strdups: u64,
    exhausted: u64,
    moved: u64,
    peak_live: usize,
    peak_bytes: usize,
}

/// A seeded storm over its own allocator instance.
pub struct Workload {
    config: WorkloadConfig,
    allocator: ExtendedAllocator<PoolHeap>,
    rng: XorShift64,
    live: Vec<Live>,
    counters: Counters,
    step: u64,
}

impl Workload {
    pub fn new(config: WorkloadConfig) -> Result<Self, HarnessError> {
        let pool = PoolConfig::single(config.main_bytes)
            .with_temp(config.temp_bytes)
            .with_granularity(config.granularity);
        let allocator = ExtendedAllocator::new(
            PoolHeap::new(&pool)?,
            AllocatorConfig::debug().with_halt_on_corruption(false),
        );
        Ok(Self {
            rng: XorShift64::new(config.seed),
            config,
            allocator,
            live: Vec::new(),
            counters: Counters::default(),
            step: 0,
        })
    }

    #[must_use]
    pub fn allocator(&self) -> &ExtendedAllocator<PoolHeap> {
        &self.allocator
    }

    /// Runs the configured number of steps, auditing after each one.
    pub fn run(&mut self) -> Result<StormReport, HarnessError> {
        info!(
            "storm: seed={:#x} steps={} main={}B temp={}B",
            self.config.seed, self.config.steps, self.config.main_bytes, self.config.temp_bytes
        );
        for _ in 0..self.config.steps {
            self.step += 1;
            self.run_step()?;
            self.audit()?;
        }
        self.verify_all()?;
        Ok(self.report())
    }

    /// Frees every block the storm left live and checks the pools are whole.
    pub fn drain(&mut self) -> Result<(), HarnessError> {
        while let Some(block) = self.live.pop() {
            self.verify(&block)?;
            let step = self.step;
            self.allocator
                .free(Some(block.ptr))
                .map_err(|source| HarnessError::Alloc { step, source })?;
        }
        self.audit()?;
        let whole = self.allocator.with_backend(|heap| {
            let main = heap.main().stats();
            let temp_whole = heap.temp().is_none_or(|t| t.stats().free_blocks == 1);
            main.free_blocks == 1 && main.used_blocks == 0 && temp_whole
        });
        if !whole {
            return Err(self.invariant("pools not fully coalesced after drain".into()));
        }
        Ok(())
    }

    /// Usage map of the main pool.
    #[must_use]
    pub fn usage_map(&self, buckets: usize) -> String {
        let (base, size) = self
            .allocator
            .with_backend(|heap| (heap.main().base(), heap.main().size()));
        map::render(&self.allocator.get_map(base, size, buckets))
    }

    fn run_step(&mut self) -> Result<(), HarnessError> {
        let roll = if self.live.is_empty() {
            0
        } else {
            self.rng.gen_range(0, 99)
        };
        match roll {
            0..45 => self.step_alloc(),
            45..75 => self.step_free(),
            75..93 => self.step_realloc(),
            _ => self.step_strdup(),
        }
    }

    fn step_alloc(&mut self) -> Result<(), HarnessError> {
        let size = self.rng.gen_range(1, self.config.max_size);
        let align = ALIGNS[self.rng.gen_range(0, ALIGNS.len() - 1)];
        let mut flags = AllocFlags::empty();
        if self.rng.chance(25) {
            flags |= AllocFlags::TEMP;
        }
        if self.rng.chance(20) {
            flags |= AllocFlags::TOP;
        }
        if self.rng.chance(20) {
            flags |= AllocFlags::CLEAR;
        }
        let site = self.random_site();

        let Some(ptr) = self.outcome(self.allocator.alloc(size, align, flags, site))? else {
            return Ok(());
        };
        self.counters.allocs += 1;
        let expected = if align == 0 { DEFAULT_ALIGN } else { align };
        if ptr % expected != 0 {
            return Err(self.invariant(format!("{ptr:#x} not aligned to {expected}")));
        }
        if flags.contains(AllocFlags::CLEAR) {
            let bytes = self.read(ptr, size)?;
            if bytes.iter().any(|&b| b != 0) {
                return Err(self.invariant(format!("{ptr:#x} not zero-filled")));
            }
        }
        self.track(ptr, size)
    }

    fn step_free(&mut self) -> Result<(), HarnessError> {
        let idx = self.rng.gen_range(0, self.live.len() - 1);
        let block = self.live.swap_remove(idx);
        self.verify(&block)?;
        let step = self.step;
        self.allocator
            .free(Some(block.ptr))
            .map_err(|source| HarnessError::Alloc { step, source })?;
        self.counters.frees += 1;
        Ok(())
    }

    fn step_realloc(&mut self) -> Result<(), HarnessError> {
        let idx = self.rng.gen_range(0, self.live.len() - 1);
        let block = self.live[idx];
        let size = self.rng.gen_range(1, self.config.max_size);
        let flags = if self.rng.chance(25) {
            AllocFlags::TEMP
        } else {
            AllocFlags::empty()
        };
        let site = self.random_site();

        let result = self.allocator.realloc(Some(block.ptr), size, flags, site);
        let Some(ptr) = self.outcome(result)? else {
            // The original block must survive a failed resize.
            return self.verify(&block);
        };
        self.counters.reallocs += 1;
        if ptr != block.ptr {
            self.counters.moved += 1;
        }
        let kept = Live {
            ptr,
            size: block.size.min(size),
            fill: block.fill,
        };
        self.verify(&kept)?;
        self.live.swap_remove(idx);
        self.track(ptr, size)
    }

    fn step_strdup(&mut self) -> Result<(), HarnessError> {
        let len = self.rng.gen_range(0, 64);
        let text: Vec<u8> = (0..len)
            .map(|_| b'a' + (self.rng.next_u64() % 26) as u8)
            .collect();
        let site = self.random_site();
        let Some(ptr) = self.outcome(self.allocator.strdup(Some(&text), AllocFlags::TEMP, site))?
        else {
            return Ok(());
        };
        self.counters.strdups += 1;
        let copy = self.read(ptr, len + 1)?;
        if copy[..len] != text[..] || copy[len] != 0 {
            return Err(self.invariant(format!("strdup copy at {ptr:#x} differs")));
        }
        self.track(ptr, len + 1)
    }

    /// Splits exhaustion (counted) from real failures.
    fn outcome(
        &mut self,
        result: Result<Option<usize>, AllocError>,
    ) -> Result<Option<usize>, HarnessError> {
        match result {
            Ok(Some(ptr)) => Ok(Some(ptr)),
            Ok(None) => Err(self.invariant("non-zero request returned null".into())),
            Err(err) if err.is_exhaustion() => {
                debug!("step {}: {err}", self.step);
                self.counters.exhausted += 1;
                Ok(None)
            }
            Err(source) => Err(HarnessError::Alloc {
                step: self.step,
                source,
            }),
        }
    }

    fn track(&mut self, ptr: usize, size: usize) -> Result<(), HarnessError> {
        let fill = (self.rng.next_u64() & 0xFF) as u8;
        let step = self.step;
        self.allocator
            .fill(ptr, size, fill)
            .map_err(|source| HarnessError::Alloc { step, source })?;
        self.live.push(Live { ptr, size, fill });
        self.counters.peak_live = self.counters.peak_live.max(self.live.len());
        self.counters.peak_bytes = self
            .counters
            .peak_bytes
            .max(self.allocator.bytes_allocated());
        Ok(())
    }

    fn audit(&self) -> Result<(), HarnessError> {
        if let Err(err) = self.allocator.with_backend(PoolHeap::check) {
            return Err(self.invariant(format!("heap audit: {err}")));
        }
        let expected: usize = self.live.iter().map(|b| b.size).sum();
        let tracked = self.allocator.bytes_allocated();
        if tracked != expected {
            return Err(self.invariant(format!(
                "allocator tracks {tracked} bytes, workload holds {expected}"
            )));
        }
        if self.allocator.live_count() != self.live.len() {
            return Err(self.invariant(format!(
                "allocator tracks {} blocks, workload holds {}",
                self.allocator.live_count(),
                self.live.len()
            )));
        }
        Ok(())
    }

    fn verify_all(&self) -> Result<(), HarnessError> {
        self.live.iter().try_for_each(|block| self.verify(block))
    }

    fn verify(&self, block: &Live) -> Result<(), HarnessError> {
        let bytes = self.read(block.ptr, block.size)?;
        if let Some(offset) = bytes.iter().position(|&b| b != block.fill) {
            return Err(self.invariant(format!(
                "block {:#x} byte {offset} is {:#04x}, expected {:#04x}",
                block.ptr, bytes[offset], block.fill
            )));
        }
        Ok(())
    }

    fn read(&self, ptr: usize, len: usize) -> Result<Vec<u8>, HarnessError> {
        self.allocator
            .read(ptr, len)
            .map_err(|source| HarnessError::Alloc {
                step: self.step,
                source,
            })
    }

    fn random_site(&mut self) -> Site {
        // Skip `Free`: it only marks empty buckets.
        let tag = UsageTag::ALL[self.rng.gen_range(1, UsageTag::ALL.len() - 1)];
        Site::new(file!(), line!(), tag)
    }

    fn invariant(&self, reason: String) -> HarnessError {
        HarnessError::Invariant {
            step: self.step,
            reason,
        }
    }

    fn report(&self) -> StormReport {
        let (main, temp): (PoolSnapshot, Option<PoolSnapshot>) =
            self.allocator.with_backend(|heap| {
                (
                    heap.main().stats().into(),
                    heap.temp().map(|t| t.stats().into()),
                )
            });
        StormReport {
            seed: self.config.seed,
            steps: self.step,
            allocs: self.counters.allocs,
            frees: self.counters.frees,
            reallocs: self.counters.reallocs,
            strdups: self.counters.strdups,
            exhausted: self.counters.exhausted,
            moved: self.counters.moved,
            peak_live: self.counters.peak_live,
            peak_bytes: self.counters.peak_bytes,
            live_at_end: self.live.len(),
            bytes_at_end: self.allocator.bytes_allocated(),
            main,
            temp,
            map: self.usage_map(self.config.map_buckets),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_is_deterministic() {
        let mut a = XorShift64::new(7);
        let mut b = XorShift64::new(7);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        let mut zero = XorShift64::new(0);
        assert_ne!(zero.next_u64(), 0);
    }

    #[test]
    fn gen_range_stays_in_bounds() {
        let mut rng = XorShift64::new(42);
        for _ in 0..1000 {
            let v = rng.gen_range(3, 9);
            assert!((3..=9).contains(&v));
        }
    }
}
