//! Runtime configuration for the extended allocator.
//!
//! Diagnostic overlays are chosen at construction time:
//! - `XALLOC_DEBUG`: `off`, `track` or `paranoid`. Unknown values keep the
//!   build default.
//! - `XALLOC_POISON`: fill fresh and freed payloads with marker bytes.
//! - `XALLOC_TRACE`: record a structured lifecycle journal.

use crate::header::PTR_SIZE;

pub const ENV_DEBUG: &str = "XALLOC_DEBUG";
pub const ENV_POISON: &str = "XALLOC_POISON";
pub const ENV_TRACE: &str = "XALLOC_TRACE";

/// Alignment used when a caller passes `0`.
pub const DEFAULT_ALIGN: usize = 16;

/// Depth of live-block bookkeeping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugLevel {
    /// No live list; frees trust the header.
    Off,
    /// Live list maintained; reporting and maps available.
    #[default]
    Track,
    /// Every free is checked against the live list first.
    Paranoid,
}

impl DebugLevel {
    /// Parse from string (case-insensitive). Returns `None` for unknown names.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "release" | "0" => Some(Self::Off),
            "track" | "on" | "debug" | "1" => Some(Self::Track),
            "paranoid" | "full" | "2" => Some(Self::Paranoid),
            _ => None,
        }
    }

    #[must_use]
    pub const fn tracks(self) -> bool {
        !matches!(self, Self::Off)
    }
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Allocator behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Alignment applied to `align == 0` requests. Power of two.
    pub default_align: usize,
    /// Keep every live block on the live list.
    pub track: bool,
    /// Verify list membership before every free. Needs `track`.
    pub paranoid_free: bool,
    /// Pad so returned pointers are never accidentally aligned to twice the
    /// requested alignment.
    pub anti_coincidence: bool,
    /// Fill fresh bytes with `0xCD` and freed payloads with `0xDD`.
    pub poison: bool,
    /// Record the lifecycle journal.
    pub trace: bool,
    /// Panic when corruption is detected instead of returning an error.
    pub halt_on_corruption: bool,
}

impl AllocatorConfig {
    #[must_use]
    pub const fn debug() -> Self {
        Self {
            default_align: DEFAULT_ALIGN,
            track: true,
            paranoid_free: true,
            anti_coincidence: true,
            poison: true,
            trace: false,
            halt_on_corruption: true,
        }
    }

    #[must_use]
    pub const fn release() -> Self {
        Self {
            default_align: DEFAULT_ALIGN,
            track: false,
            paranoid_free: false,
            anti_coincidence: false,
            poison: false,
            trace: false,
            halt_on_corruption: false,
        }
    }

    #[must_use]
    pub const fn with_level(mut self, level: DebugLevel) -> Self {
        self.track = level.tracks();
        self.paranoid_free = matches!(level, DebugLevel::Paranoid);
        self
    }

    #[must_use]
    pub const fn level(&self) -> DebugLevel {
        match (self.track, self.paranoid_free) {
            (false, _) => DebugLevel::Off,
            (true, false) => DebugLevel::Track,
            (true, true) => DebugLevel::Paranoid,
        }
    }

    #[must_use]
    pub const fn with_trace(mut self, enabled: bool) -> Self {
        self.trace = enabled;
        self
    }

    #[must_use]
    pub const fn with_poison(mut self, enabled: bool) -> Self {
        self.poison = enabled;
        self
    }

    #[must_use]
    pub const fn with_anti_coincidence(mut self, enabled: bool) -> Self {
        self.anti_coincidence = enabled;
        self
    }

    #[must_use]
    pub const fn with_halt_on_corruption(mut self, enabled: bool) -> Self {
        self.halt_on_corruption = enabled;
        self
    }

    /// Normalizes inconsistent combinations.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if !self.default_align.is_power_of_two() {
            self.default_align = DEFAULT_ALIGN;
        }
        self.default_align = self.default_align.max(PTR_SIZE);
        if !self.track {
            self.paranoid_free = false;
        }
        self
    }

    /// Build default overlaid with the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build default overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(level) = lookup(ENV_DEBUG).and_then(|raw| DebugLevel::from_str_loose(&raw)) {
            config = config.with_level(level);
        }
        if let Some(poison) = lookup(ENV_POISON).and_then(|raw| parse_switch(&raw)) {
            config.poison = poison;
        }
        if let Some(trace) = lookup(ENV_TRACE).and_then(|raw| parse_switch(&raw)) {
            config.trace = trace;
        }
        config.normalized()
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::debug()
        } else {
            Self::release()
        }
    }
}
