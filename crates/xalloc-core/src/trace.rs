//! Structured allocation lifecycle journal.

use xalloc_heap::Address;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<TraceLevel> for log::Level {
    fn from(level: TraceLevel) -> Self {
        match level {
            TraceLevel::Trace => Self::Trace,
            TraceLevel::Debug => Self::Debug,
            TraceLevel::Info => Self::Info,
            TraceLevel::Warn => Self::Warn,
            TraceLevel::Error => Self::Error,
        }
    }
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocTraceRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id, `xalloc::<symbol>::<id>`.
    pub trace_id: String,
    pub level: TraceLevel,
    /// API symbol (`alloc`, `free`, `realloc`, ...).
    pub symbol: &'static str,
    /// Event kind (`granted`, `injected_failure`, `temp_fallback`, ...).
    pub event: &'static str,
    pub ptr: Option<Address>,
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
}

#[derive(Debug)]
pub(crate) struct TraceJournal {
    enabled: bool,
    next_decision_id: u64,
    records: Vec<AllocTraceRecord>,
}

impl TraceJournal {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            next_decision_id: 1,
            records: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record(
        &mut self,
        level: TraceLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<Address>,
        size: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        if !self.enabled {
            return;
        }
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        let trace_id = format!("xalloc::{symbol}::{decision_id:016x}");
        let details = details.into();
        log::log!(
            level.into(),
            "{trace_id} {event} outcome={outcome} ptr={ptr:x?} size={size:?} {details}"
        );
        self.records.push(AllocTraceRecord {
            decision_id,
            trace_id,
            level,
            symbol,
            event,
            ptr,
            size,
            outcome,
            details,
        });
    }

    pub(crate) fn drain(&mut self) -> Vec<AllocTraceRecord> {
        std::mem::take(&mut self.records)
    }
}
