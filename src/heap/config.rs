//! Heap construction parameters.

use core::ops::{BitOr, BitOrAssign};

use super::Tag;

/// Behavior switches fixed at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeapFlags(u32);

impl HeapFlags {
    pub const NONE: HeapFlags = HeapFlags(0);
    /// Track per-tag usage in a red-black tree.
    pub const COLLECT_TAG_STATISTICS: HeapFlags = HeapFlags(0x1);
    /// Validate the statistics tree every 256 mutations.
    pub const PERIODIC_VALIDATION: HeapFlags = HeapFlags(0x2);
    /// Never hand memory back to the provider before the heap is destroyed.
    pub const NO_PARTIAL_FREES: HeapFlags = HeapFlags(0x4);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: HeapFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: HeapFlags) -> HeapFlags {
        HeapFlags(self.0 | other.0)
    }
}

impl BitOr for HeapFlags {
    type Output = HeapFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl BitOrAssign for HeapFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

pub const DEFAULT_GRANULARITY: usize = 0x1000;
pub const DEFAULT_MIN_EXPANSION: usize = 0x10000;
pub const DEFAULT_DIRECT_THRESHOLD: usize = 0x40000;
pub const DEFAULT_TRIM_THRESHOLD: usize = 0x200000;

/// Growth policy and flags for [`Heap::init`](super::Heap::init).
///
/// # Example
/// ```rust
/// # use tagalloc::*;
/// let config = HeapConfig::new()
///     .with_min_expansion(0x4000)
///     .with_flags(HeapFlags::COLLECT_TAG_STATISTICS);
/// assert_eq!(config.min_expansion, 0x4000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Smallest request made to the provider when growing.
    pub min_expansion: usize,
    /// Provider requests are multiples of this. Zero is treated as one.
    pub granularity: usize,
    /// Tag passed to the provider along with growth requests.
    pub heap_tag: Tag,
    pub flags: HeapFlags,
    /// Upper bound on bytes held from the provider. Zero means unbounded.
    pub footprint_limit: usize,
    /// Requests at least this large get their own provider allocation.
    pub direct_threshold: usize,
    /// Top chunk size above which a free first tries to trim.
    pub trim_threshold: usize,
}

impl HeapConfig {
    pub const fn new() -> Self {
        Self {
            min_expansion: DEFAULT_MIN_EXPANSION,
            granularity: DEFAULT_GRANULARITY,
            heap_tag: Tag::from_bytes(*b"Heap"),
            flags: HeapFlags::NONE,
            footprint_limit: 0,
            direct_threshold: DEFAULT_DIRECT_THRESHOLD,
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
        }
    }

    pub const fn with_min_expansion(mut self, min_expansion: usize) -> Self {
        self.min_expansion = min_expansion;
        self
    }

    pub const fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    pub const fn with_heap_tag(mut self, heap_tag: Tag) -> Self {
        self.heap_tag = heap_tag;
        self
    }

    pub const fn with_flags(mut self, flags: HeapFlags) -> Self {
        self.flags = flags;
        self
    }

    pub const fn with_footprint_limit(mut self, footprint_limit: usize) -> Self {
        self.footprint_limit = footprint_limit;
        self
    }

    pub const fn with_direct_threshold(mut self, direct_threshold: usize) -> Self {
        self.direct_threshold = direct_threshold;
        self
    }

    pub const fn with_trim_threshold(mut self, trim_threshold: usize) -> Self {
        self.trim_threshold = trim_threshold;
        self
    }

    /// The granularity actually used: a power of two no smaller than the
    /// chunk alignment.
    pub(crate) fn effective_granularity(&self) -> usize {
        let granularity = if self.granularity == 0 { 1 } else { self.granularity };
        let granularity = granularity.checked_next_power_of_two().unwrap_or(1 << (usize::BITS - 1));
        granularity.max(crate::ptr_utils::CHUNK_ALIGN)
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_test() {
        let flags = HeapFlags::COLLECT_TAG_STATISTICS | HeapFlags::NO_PARTIAL_FREES;
        assert!(flags.contains(HeapFlags::COLLECT_TAG_STATISTICS));
        assert!(flags.contains(HeapFlags::NO_PARTIAL_FREES));
        assert!(!flags.contains(HeapFlags::PERIODIC_VALIDATION));
        assert!(flags.contains(HeapFlags::NONE));
        assert_eq!(flags.bits(), 0x5);
    }

    #[test]
    fn granularity_test() {
        assert_eq!(HeapConfig::new().with_granularity(0).effective_granularity(), 16);
        assert_eq!(HeapConfig::new().with_granularity(1).effective_granularity(), 16);
        assert_eq!(HeapConfig::new().with_granularity(3000).effective_granularity(), 4096);
        assert_eq!(HeapConfig::new().effective_granularity(), DEFAULT_GRANULARITY);
    }
}
