//! Call sites, usage tags and the block-usage map.

use xalloc_heap::Address;

/// Subsystem a block was allocated for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UsageTag {
    /// Bucket with no live block. Never attached to an allocation.
    Free,
    #[default]
    Unknown,
    Debug,
    Library,
    Texture,
    Vertex,
    Sound,
    Font,
    Package,
    Game,
}

impl UsageTag {
    pub const ALL: [Self; 10] = [
        Self::Free,
        Self::Unknown,
        Self::Debug,
        Self::Library,
        Self::Texture,
        Self::Vertex,
        Self::Sound,
        Self::Font,
        Self::Package,
        Self::Game,
    ];

    /// Tie-break rank: on equal byte counts the higher rank wins.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Unknown => 1,
            Self::Debug => 2,
            Self::Library => 3,
            Self::Package => 4,
            Self::Font => 5,
            Self::Sound => 6,
            Self::Vertex => 7,
            Self::Texture => 8,
            Self::Game => 9,
        }
    }

    /// One-character code used when rendering a map.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Free => '.',
            Self::Unknown => '?',
            Self::Debug => 'd',
            Self::Library => 'l',
            Self::Texture => 't',
            Self::Vertex => 'v',
            Self::Sound => 's',
            Self::Font => 'f',
            Self::Package => 'p',
            Self::Game => 'g',
        }
    }

    /// Stable numeric code, as passed across the C boundary.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Free => -1,
            Self::Unknown => 0,
            Self::Debug => 1,
            Self::Library => 2,
            Self::Texture => 3,
            Self::Vertex => 4,
            Self::Sound => 5,
            Self::Font => 6,
            Self::Package => 7,
            Self::Game => 8,
        }
    }

    /// Inverse of [`UsageTag::code`] for allocation tags. Unrecognized codes
    /// map to `Unknown`; `Free` is never produced.
    #[must_use]
    pub const fn from_raw(code: i32) -> Self {
        match code {
            1 => Self::Debug,
            2 => Self::Library,
            3 => Self::Texture,
            4 => Self::Vertex,
            5 => Self::Sound,
            6 => Self::Font,
            7 => Self::Package,
            8 => Self::Game,
            _ => Self::Unknown,
        }
    }

    const fn index(self) -> usize {
        self.priority() as usize
    }
}

/// Where an allocation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Site {
    pub file: &'static str,
    pub line: u32,
    pub tag: UsageTag,
}

impl Site {
    pub const UNKNOWN: Self = Self::new("<unknown>", 0, UsageTag::Unknown);

    #[must_use]
    pub const fn new(file: &'static str, line: u32, tag: UsageTag) -> Self {
        Self { file, line, tag }
    }

    #[must_use]
    pub const fn with_tag(self, tag: UsageTag) -> Self {
        Self { tag, ..self }
    }
}

impl Default for Site {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} [{:?}]", self.file, self.line, self.tag)
    }
}

/// Captures the current source location as a [`Site`].
///
/// ```
/// let site = xalloc_core::site!(Texture);
/// assert_eq!(site.tag, xalloc_core::UsageTag::Texture);
/// ```
#[macro_export]
macro_rules! site {
    () => {
        $crate::Site::new(file!(), line!(), $crate::UsageTag::Unknown)
    };
    ($tag:ident) => {
        $crate::Site::new(file!(), line!(), $crate::UsageTag::$tag)
    };
}

/// Extent of one live block for map construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapExtent {
    pub start: Address,
    pub end: Address,
    pub tag: UsageTag,
}

/// Splits `[base, base + size)` into `buckets` equal ranges and names the
/// tag owning the most bytes in each. `extents` must be sorted by `start`
/// and must not overlap.
#[must_use]
pub fn dominant_tags(
    extents: &[MapExtent],
    base: Address,
    size: usize,
    buckets: usize,
) -> Vec<UsageTag> {
    if buckets == 0 {
        return Vec::new();
    }
    let bound = |i: usize| -> Address {
        // u128 keeps `i * size` exact for any bucket count.
        let offset = (i as u128 * size as u128) / buckets as u128;
        base.saturating_add(offset as usize)
    };

    let mut out = Vec::with_capacity(buckets);
    let mut first = 0;
    for i in 0..buckets {
        let (lo, hi) = (bound(i), bound(i + 1));
        while first < extents.len() && extents[first].end <= lo {
            first += 1;
        }
        let mut bytes = [0usize; UsageTag::ALL.len()];
        for extent in extents[first..].iter().take_while(|e| e.start < hi) {
            let overlap = extent.end.min(hi).saturating_sub(extent.start.max(lo));
            bytes[extent.tag.index()] += overlap;
        }
        let winner = UsageTag::ALL
            .iter()
            .copied()
            .filter(|tag| bytes[tag.index()] > 0)
            .max_by_key(|tag| (bytes[tag.index()], tag.priority()))
            .unwrap_or(UsageTag::Free);
        out.push(winner);
    }
    out
}

/// Renders tags as a character strip.
#[must_use]
pub fn render(tags: &[UsageTag]) -> String {
    tags.iter().map(|tag| tag.as_char()).collect()
}
