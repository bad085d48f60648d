//! The heap engine: a segregated-fits allocator with boundary-tag coalescing.
//!
//! Free chunks below 256 bytes live in exact-size small bins; larger ones
//! live in one of 32 bitwise tries. The most recently split-off remainder is
//! kept aside as the designated victim, and the high end of the newest segment
//! is the top chunk. Memory comes from and goes back to a [`Provider`].

mod alloc;
mod chunk;
mod config;
mod segment;
mod smallbin;
mod stats;
mod treebin;
mod validate;

#[cfg(feature = "counters")]
mod counters;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{HeapConfig, HeapFlags};
pub use stats::{HeapStatistics, TagStatistics};
pub use validate::Corruption;

#[cfg(feature = "counters")]
pub use counters::Counters;

use core::ptr::null_mut;

use crate::provider::Provider;
use chunk::{Chunk, TreeChunk, SMALL_BIN_COUNT, TREE_BIN_COUNT};
use segment::Segment;
use stats::TagStatisticsTree;

/// Marks an initialized heap.
const HEAP_MAGIC: u32 = 0x6C6F6F50;
/// Stamped into the tag word of every free chunk.
pub(crate) const FREE_MAGIC: u32 = 0x65657246;
/// Tag of the heap's own statistics records.
pub const STATISTICS_TAG: Tag = Tag(0x74536D4D);

/// Free operations on tree chunks between scans for idle segments.
const MAX_RELEASE_CHECK_RATE: usize = 4095;

/// An opaque 32-bit word stamped on every allocation for attribution.
///
/// Tags built from four ASCII bytes print back as those bytes in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tag(pub u32);

impl Tag {
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Tag(u32::from_le_bytes(bytes))
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// `0`, `!0` and the free marker can never tag an allocation.
    pub const fn is_reserved(self) -> bool {
        self.0 == 0 || self.0 == u32::MAX || self.0 == FREE_MAGIC
    }
}

impl core::fmt::Display for Tag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for b in self.to_bytes() {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            core::fmt::Write::write_char(f, c)?;
        }
        Ok(())
    }
}

/// Why an allocation could not be made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapError {
    /// The provider refused, the footprint limit was hit, or the request is too large.
    InsufficientResources,
    /// A reserved tag or an unusable alignment was passed.
    InvalidParameter,
}

impl core::fmt::Display for HeapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HeapError::InsufficientResources => f.write_str("insufficient resources"),
            HeapError::InvalidParameter => f.write_str("invalid parameter"),
        }
    }
}

/// Kinds of damage reported through [`Provider::on_corruption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptionCode {
    /// Heap metadata is inconsistent.
    CorruptStructures,
    /// An allocation's footer was overwritten.
    BufferOverrun,
    /// A chunk was freed while already free.
    DoubleFree,
    /// The heap was destroyed twice.
    DoubleDestroy,
}

impl core::fmt::Display for CorruptionCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CorruptionCode::CorruptStructures => f.write_str("corrupt structures"),
            CorruptionCode::BufferOverrun => f.write_str("buffer overrun"),
            CorruptionCode::DoubleFree => f.write_str("double free"),
            CorruptionCode::DoubleDestroy => f.write_str("double destroy"),
        }
    }
}

const EMPTY_BIN: Chunk =
    Chunk { prev_foot: 0, head: 0, tag: 0, next: null_mut(), prev: null_mut() };

/// A tagged dlmalloc-style heap.
///
/// Create with [`new`](Heap::new), then [`init`](Heap::init) in place. The
/// heap refers to its own bins and segment record by address, so it must not
/// move between `init` and [`destroy`](Heap::destroy).
///
/// The heap is single-threaded; wrap it in a [`HeapLock`](crate::HeapLock) to share it.
pub struct Heap<P: Provider> {
    pub provider: P,

    magic: u32,
    flags: HeapFlags,
    heap_tag: Tag,

    min_expansion: usize,
    granularity: usize,
    footprint_limit: usize,
    direct_threshold: usize,
    trim_threshold: usize,

    previous_expansion: usize,
    trim_check: usize,
    release_checks: usize,

    total_heap_size: usize,
    max_heap_size: usize,
    free_list_size: usize,
    direct_allocation_size: usize,
    allocations: usize,
    failed_allocations: u64,
    total_allocation_calls: u64,
    total_free_calls: u64,

    small_map: u32,
    tree_map: u32,
    dv_size: usize,
    top_size: usize,
    least_addr: *mut u8,
    dv: *mut Chunk,
    top: *mut Chunk,

    small_bins: [Chunk; SMALL_BIN_COUNT],
    tree_bins: [*mut TreeChunk; TREE_BIN_COUNT],

    segment: Segment,
    stats: TagStatisticsTree,

    #[cfg(feature = "counters")]
    counters: Counters,
}

unsafe impl<P: Provider + Send> Send for Heap<P> {}

impl<P: Provider> core::fmt::Debug for Heap<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("magic", &format_args!("{:x}", self.magic))
            .field("flags", &self.flags)
            .field("total_heap_size", &self.total_heap_size)
            .field("free_list_size", &self.free_list_size)
            .field("small_map", &format_args!("{:x}", self.small_map))
            .field("tree_map", &format_args!("{:x}", self.tree_map))
            .field("top", &self.top)
            .field("top_size", &self.top_size)
            .field("dv", &self.dv)
            .field("dv_size", &self.dv_size)
            .finish()
    }
}

impl<P: Provider> Heap<P> {
    /// Create an uninitialized heap. Call [`init`](Heap::init) before use.
    pub const fn new(provider: P) -> Self {
        Self {
            provider,
            magic: 0,
            flags: HeapFlags::NONE,
            heap_tag: Tag(0),
            min_expansion: 0,
            granularity: 0,
            footprint_limit: 0,
            direct_threshold: 0,
            trim_threshold: 0,
            previous_expansion: 0,
            trim_check: 0,
            release_checks: 0,
            total_heap_size: 0,
            max_heap_size: 0,
            free_list_size: 0,
            direct_allocation_size: 0,
            allocations: 0,
            failed_allocations: 0,
            total_allocation_calls: 0,
            total_free_calls: 0,
            small_map: 0,
            tree_map: 0,
            dv_size: 0,
            top_size: 0,
            least_addr: null_mut(),
            dv: null_mut(),
            top: null_mut(),
            small_bins: [EMPTY_BIN; SMALL_BIN_COUNT],
            tree_bins: [null_mut(); TREE_BIN_COUNT],
            segment: Segment::empty(),
            stats: TagStatisticsTree::new(),
            #[cfg(feature = "counters")]
            counters: Counters::new(),
        }
    }

    /// Initialize the heap in place. No memory is requested until the first allocation.
    ///
    /// # Safety
    /// The heap must not be moved after this call until [`destroy`](Heap::destroy)
    /// has been called, as bins, chunks and the statistics tree point into it.
    pub unsafe fn init(&mut self, config: HeapConfig) {
        let provider = core::ptr::read(&self.provider);
        core::ptr::write(self, Self::new(provider));

        self.magic = HEAP_MAGIC;
        self.flags = config.flags;
        if !P::SUPPORTS_PARTIAL_FREES {
            self.flags |= HeapFlags::NO_PARTIAL_FREES;
        }
        self.heap_tag = config.heap_tag;
        self.min_expansion = config.min_expansion;
        self.granularity = config.effective_granularity();
        self.footprint_limit = config.footprint_limit;
        self.direct_threshold = config.direct_threshold;
        self.trim_threshold = config.trim_threshold;
        self.trim_check = config.trim_threshold;
        self.release_checks = MAX_RELEASE_CHECK_RATE;

        self.init_bins();
        self.init_statistics();
    }

    pub fn is_initialized(&self) -> bool {
        self.magic == HEAP_MAGIC
    }

    /// Whether any memory has been obtained yet.
    fn has_top(&self) -> bool {
        !self.top.is_null()
    }

    #[inline]
    fn address(&self) -> usize {
        self as *const Self as usize
    }

    /// Return every owned segment to the provider and mark the heap destroyed.
    ///
    /// External segments are left alone. A second call reports
    /// [`CorruptionCode::DoubleDestroy`].
    ///
    /// # Safety
    /// No allocation from this heap may be used afterwards.
    pub unsafe fn destroy(&mut self) {
        if self.magic != HEAP_MAGIC {
            let code = if self.magic == 0 {
                CorruptionCode::DoubleDestroy
            } else {
                CorruptionCode::CorruptStructures
            };
            self.report_corruption(code, null_mut());
            return;
        }

        log::debug!("[heap] {:p}: destroying {} bytes", self, self.total_heap_size);

        // the head record lives inline, the rest live inside the segments they describe
        let mut segment: *mut Segment = &mut self.segment;
        while !segment.is_null() {
            let base = (*segment).base;
            let size = (*segment).size;
            let owned = !(*segment).is_external();
            segment = (*segment).next;

            if owned && !base.is_null() {
                if let Some(base) = core::ptr::NonNull::new(base) {
                    if !self.provider.free(base, size) {
                        log::trace!("[heap] provider kept segment {:p} during destroy", base);
                    }
                }
            }
        }

        let provider = core::ptr::read(&self.provider);
        core::ptr::write(self, Self::new(provider));
    }

    /// Report damage through the provider and the log.
    fn report_corruption(&mut self, code: CorruptionCode, pointer: *mut u8) {
        log::warn!("[heap] {:p}: {} at {:p}", self, code, pointer);
        let heap = self as *const Self as *const u8;
        self.provider.on_corruption(heap, code, pointer);
    }

    #[inline]
    fn ok_address(&self, addr: *const u8) -> bool {
        addr >= self.least_addr as *const u8
    }

    #[inline]
    fn ok_next(current: *const Chunk, next: *const Chunk) -> bool {
        current < next
    }

    pub fn flags(&self) -> HeapFlags {
        self.flags
    }

    /// Bound the bytes held from the provider. Zero removes the bound.
    pub fn set_footprint_limit(&mut self, limit: usize) {
        self.footprint_limit = limit;
    }

    pub fn set_direct_threshold(&mut self, threshold: usize) {
        self.direct_threshold = threshold;
    }

    pub fn set_trim_threshold(&mut self, threshold: usize) {
        self.trim_threshold = threshold;
        self.trim_check = threshold;
    }

    pub fn top_size(&self) -> usize {
        self.top_size
    }

    pub fn designated_victim_size(&self) -> usize {
        self.dv_size
    }

    pub fn designated_victim(&self) -> *mut u8 {
        self.dv.cast()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn tag_bytes_round_trip() {
        let tag = Tag::from_bytes(*b"t001");
        assert_eq!(tag.to_bytes(), *b"t001");
        assert_eq!(std::format!("{}", tag), "t001");
        assert!(Tag(0).is_reserved());
        assert!(Tag(u32::MAX).is_reserved());
        assert!(!tag.is_reserved());
        assert_eq!(std::format!("{}", STATISTICS_TAG), "MmSt");
    }

    #[test]
    fn destroy_twice_reports() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe {
            let a = heap.allocate(100, TAG_A);
            assert!(a.is_some());
            heap.destroy();
            assert_eq!(heap.provider.outstanding(), 0);
            assert!(heap.provider.reports.is_empty());

            heap.destroy();
        }
        assert_eq!(heap.provider.reports, vec![(CorruptionCode::DoubleDestroy, core::ptr::null_mut())]);
    }

    #[test]
    fn init_requests_nothing() {
        let heap = new_heap(HeapConfig::new());
        assert!(heap.is_initialized());
        assert_eq!(heap.provider.allocation_count, 0);
        assert_eq!(heap.statistics().total_heap_size, 0);
    }
}
