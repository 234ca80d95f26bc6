//! Process-wide allocator instance.
//!
//! Lifecycle is a three-state machine: `UNINIT -> RESERVING -> READY`, and
//! back to `UNINIT` on teardown. Only one caller can win the reservation;
//! concurrent initializers observe `InProgress` or `AlreadyInitialized`.
//!
//! The `mem_*` wrappers mirror the foreign-callable surface: failures are
//! reported as `None`/no-op and logged, never returned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use log::{debug, info, warn};
use parking_lot::RwLock;
use thiserror::Error;
use xalloc_heap::{AllocFlags, Address, HeapError, PoolConfig, PoolHeap, SysHeap};

use crate::allocator::{ExtendedAllocator, LiveAllocation};
use crate::config::AllocatorConfig;
use crate::map::Site;
use crate::system::SystemHeap;

pub const ENV_BACKEND: &str = "XALLOC_BACKEND";
pub const ENV_POOL_BYTES: &str = "XALLOC_POOL_BYTES";
pub const ENV_TEMP_BYTES: &str = "XALLOC_TEMP_BYTES";
pub const ENV_GRANULARITY: &str = "XALLOC_GRANULARITY";

const STATE_UNINIT: u8 = 0;
const STATE_RESERVING: u8 = 1;
const STATE_READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);

/// Type-erased backend held by the global instance.
pub type DynHeap = Box<dyn SysHeap + Send>;

/// The global allocator type.
pub type GlobalAllocator = ExtendedAllocator<DynHeap>;

static GLOBAL: RwLock<Option<Arc<GlobalAllocator>>> = parking_lot::const_rwlock(None);

/// Backend selection for [`init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Pass-through to the Rust global allocator.
    System,
    /// Fixed main/temp pools.
    Pool(PoolConfig),
}

impl Backend {
    fn build(&self) -> Result<DynHeap, InitError> {
        Ok(match self {
            Self::System => Box::new(SystemHeap::new()),
            Self::Pool(config) => Box::new(PoolHeap::new(config)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("allocator is already initialized")]
    AlreadyInitialized,
    #[error("allocator initialization is in progress on another thread")]
    InProgress,
    #[error("pool backend rejected its configuration: {0}")]
    Pool(#[from] HeapError),
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Blocks still live at teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub leaked: Vec<LiveAllocation>,
    pub leaked_bytes: usize,
}

/// Installs the global allocator.
pub fn init(backend: Backend, config: AllocatorConfig) -> Result<(), InitError> {
    match STATE.compare_exchange(
        STATE_UNINIT,
        STATE_RESERVING,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {}
        Err(STATE_RESERVING) => return Err(InitError::InProgress),
        Err(_) => return Err(InitError::AlreadyInitialized),
    }

    let heap = match backend.build() {
        Ok(heap) => heap,
        Err(err) => {
            STATE.store(STATE_UNINIT, Ordering::Release);
            return Err(err);
        }
    };
    *GLOBAL.write() = Some(Arc::new(ExtendedAllocator::new(heap, config)));
    STATE.store(STATE_READY, Ordering::Release);
    info!("xalloc initialized: backend={backend:?} level={:?}", config.level());
    Ok(())
}

/// Installs the global allocator configured from the process environment.
pub fn init_from_env() -> Result<(), InitError> {
    init_from_lookup(|key| std::env::var(key).ok())
}

/// Installs the global allocator configured from `lookup`.
///
/// `XALLOC_BACKEND` is `system` (default) or `pool`; the pool sizes come from
/// `XALLOC_POOL_BYTES`, `XALLOC_TEMP_BYTES` and `XALLOC_GRANULARITY`.
pub fn init_from_lookup<F>(lookup: F) -> Result<(), InitError>
where
    F: Fn(&str) -> Option<String>,
{
    let backend = backend_from_lookup(&lookup)?;
    init(backend, AllocatorConfig::from_lookup(&lookup))
}

fn backend_from_lookup<F>(lookup: &F) -> Result<Backend, InitError>
where
    F: Fn(&str) -> Option<String>,
{
    let kind = lookup(ENV_BACKEND).unwrap_or_default();
    match kind.trim().to_ascii_lowercase().as_str() {
        "" | "system" | "sys" => Ok(Backend::System),
        "pool" => {
            let mut config = PoolConfig::default();
            if let Some(bytes) = parse_usize(lookup, ENV_POOL_BYTES)? {
                config.main_size = bytes;
            }
            if let Some(bytes) = parse_usize(lookup, ENV_TEMP_BYTES)? {
                config.temp_size = bytes;
            }
            if let Some(granularity) = parse_usize(lookup, ENV_GRANULARITY)? {
                config.granularity = granularity;
            }
            Ok(Backend::Pool(config))
        }
        _ => Err(InitError::InvalidEnv {
            key: ENV_BACKEND,
            value: kind,
        }),
    }
}

fn parse_usize<F>(lookup: &F, key: &'static str) -> Result<Option<usize>, InitError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| InitError::InvalidEnv { key, value: raw })
        })
        .transpose()
}

/// The global allocator, if initialized.
pub fn try_global() -> Option<Arc<GlobalAllocator>> {
    if STATE.load(Ordering::Acquire) != STATE_READY {
        return None;
    }
    GLOBAL.read().clone()
}

#[must_use]
pub fn is_initialized() -> bool {
    STATE.load(Ordering::Acquire) == STATE_READY
}

/// Removes the global allocator and reports any blocks it still tracked.
/// Returns `None` when nothing was installed.
pub fn teardown() -> Option<TeardownReport> {
    if STATE
        .compare_exchange(
            STATE_READY,
            STATE_RESERVING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return None;
    }
    let allocator = GLOBAL.write().take();
    STATE.store(STATE_UNINIT, Ordering::Release);

    let allocator = allocator?;
    let leaked = allocator.report_allocs();
    let leaked_bytes = allocator.bytes_allocated();
    if leaked.is_empty() {
        info!("xalloc torn down cleanly");
    } else {
        warn!(
            "xalloc torn down with {} live allocations ({leaked_bytes} bytes)",
            leaked.len()
        );
    }
    Some(TeardownReport {
        leaked,
        leaked_bytes,
    })
}

fn with_global<R>(symbol: &str, f: impl FnOnce(&GlobalAllocator) -> R) -> Option<R> {
    match try_global() {
        Some(allocator) => Some(f(&allocator)),
        None => {
            warn!("{symbol}: allocator is not initialized");
            None
        }
    }
}

/// Allocates through the global instance; `None` on any failure.
pub fn mem_alloc(size: usize, align: usize, flags: AllocFlags, site: Site) -> Option<Address> {
    with_global("mem_alloc", |a| a.alloc(size, align, flags, site))?
        .map_err(|err| debug!("mem_alloc({size}, {align}) at {site}: {err}"))
        .ok()
        .flatten()
}

/// Frees through the global instance.
pub fn mem_free(ptr: Option<Address>) {
    if ptr.is_none() {
        return;
    }
    if let Some(Err(err)) = with_global("mem_free", |a| a.free(ptr)) {
        warn!("mem_free({ptr:x?}): {err}");
    }
}

/// Reallocates through the global instance; `None` on any failure, in which
/// case `ptr` is still live.
pub fn mem_realloc(
    ptr: Option<Address>,
    size: usize,
    flags: AllocFlags,
    site: Site,
) -> Option<Address> {
    with_global("mem_realloc", |a| a.realloc(ptr, size, flags, site))?
        .map_err(|err| debug!("mem_realloc({ptr:x?}, {size}) at {site}: {err}"))
        .ok()
        .flatten()
}

/// Duplicates a byte string through the global instance.
pub fn mem_strdup(s: Option<&[u8]>, flags: AllocFlags, site: Site) -> Option<Address> {
    with_global("mem_strdup", |a| a.strdup(s, flags, site))?
        .map_err(|err| debug!("mem_strdup at {site}: {err}"))
        .ok()
        .flatten()
}

pub fn mem_avail(flags: AllocFlags) -> Option<usize> {
    with_global("mem_avail", |a| a.avail(flags)).flatten()
}

pub fn mem_contig(flags: AllocFlags) -> Option<usize> {
    with_global("mem_contig", |a| a.contig(flags)).flatten()
}
