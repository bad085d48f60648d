//! Heap-wide statistics and per-tag usage records.
//!
//! Per-tag records live in a red-black tree keyed by tag. The record for the
//! statistics tag itself is embedded in the heap and always present, so
//! allocating a record for a new tag never needs another new record.

use core::{
    cmp::Ordering,
    fmt,
    mem::size_of,
    ptr::{addr_of, addr_of_mut},
};

use crate::{
    provider::Provider,
    rbtree::{self, RbNode, RbTree},
};

use super::{CorruptionCode, Heap, HeapFlags, Tag, STATISTICS_TAG};

/// Marks the start of a [`Heap::profile_snapshot`], `"PooL"` in memory order.
pub const SNAPSHOT_MAGIC: u32 = u32::from_le_bytes(*b"PooL");

const SNAPSHOT_HEADER_SIZE: usize = 4 + 4 + 2 * size_of::<usize>() + 3 * 8;
const SNAPSHOT_RECORD_SIZE: usize = 4 + 4 + 2 * size_of::<usize>() + 8 + 4 + 4;

/// Heap-wide counters, in bytes where not stated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStatistics {
    /// Bytes currently held from the provider, direct chunks included.
    pub total_heap_size: usize,
    /// The high-water mark of `total_heap_size`.
    pub max_heap_size: usize,
    /// Bytes in free chunks, the top chunk and the designated victim.
    pub free_list_size: usize,
    /// Bytes held by direct chunks.
    pub direct_allocation_size: usize,
    /// Live allocations.
    pub allocations: usize,
    pub failed_allocations: u64,
    pub total_allocation_calls: u64,
    pub total_free_calls: u64,
    /// Distinct tags with a usage record.
    pub tag_count: u32,
}

/// Usage attributed to one tag. Sizes are chunk sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TagStatistics {
    pub tag: Tag,
    pub largest_allocation: usize,
    pub active_size: usize,
    pub largest_active_size: usize,
    pub lifetime_allocation_size: u64,
    pub active_allocation_count: u32,
    pub largest_active_allocation_count: u32,
}

#[repr(C)]
#[derive(Debug)]
pub(super) struct TagRecord {
    node: RbNode,
    tag: u32,
    largest: usize,
    active: usize,
    largest_active: usize,
    lifetime: u64,
    active_count: u32,
    largest_active_count: u32,
}

impl TagRecord {
    const fn new(tag: u32) -> Self {
        Self {
            node: RbNode::new(),
            tag,
            largest: 0,
            active: 0,
            largest_active: 0,
            lifetime: 0,
            active_count: 0,
            largest_active_count: 0,
        }
    }

    fn statistics(&self) -> TagStatistics {
        TagStatistics {
            tag: Tag(self.tag),
            largest_allocation: self.largest,
            active_size: self.active,
            largest_active_size: self.largest_active,
            lifetime_allocation_size: self.lifetime,
            active_allocation_count: self.active_count,
            largest_active_allocation_count: self.largest_active_count,
        }
    }

    fn record_allocation(&mut self, size: usize) {
        self.largest = self.largest.max(size);
        self.active += size;
        self.largest_active = self.largest_active.max(self.active);
        self.lifetime += size as u64;
        self.active_count += 1;
        self.largest_active_count = self.largest_active_count.max(self.active_count);
    }

    fn record_free(&mut self, size: usize) {
        debug_assert!(self.active >= size);
        debug_assert!(self.active_count != 0);

        self.active = self.active.saturating_sub(size);
        self.active_count = self.active_count.saturating_sub(1);
    }
}

fn compare_records(_: &RbTree, a: *const RbNode, b: *const RbNode) -> Ordering {
    unsafe { (*a.cast::<TagRecord>()).tag.cmp(&(*b.cast::<TagRecord>()).tag) }
}

#[derive(Debug)]
pub(super) struct TagStatisticsTree {
    tree: RbTree,
    tag_count: u32,
    own: TagRecord,
}

impl TagStatisticsTree {
    pub const fn new() -> Self {
        Self { tree: RbTree::new(0, compare_records), tag_count: 0, own: TagRecord::new(STATISTICS_TAG.0) }
    }

    fn find(&self, tag: u32) -> Option<*mut TagRecord> {
        let key = TagRecord::new(tag);
        self.tree.search(addr_of!(key.node)).map(|node| node.cast::<TagRecord>())
    }

    fn for_each(&self, mut visit: impl FnMut(&TagRecord)) {
        self.tree.iterate(|node, _| visit(unsafe { &*node.cast::<TagRecord>() }));
    }

    pub(super) fn validate(&self) -> Result<(), rbtree::TreeViolation> {
        self.tree.validate()
    }
}

/// Sequential little-endian writer that stops silently when out of room.
struct SnapshotWriter<'a> {
    buffer: &'a mut [u8],
    written: usize,
}

impl SnapshotWriter<'_> {
    fn has_room(&self, size: usize) -> bool {
        self.buffer.len() - self.written >= size
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buffer[self.written..self.written + bytes.len()].copy_from_slice(bytes);
        self.written += bytes.len();
    }
}

impl<P: Provider> Heap<P> {
    /// Reset the statistics tree and insert the embedded statistics record.
    pub(super) fn init_statistics(&mut self) {
        let flags = if self.flags.contains(HeapFlags::PERIODIC_VALIDATION) {
            rbtree::PERIODIC_VALIDATION
        } else {
            0
        };

        self.stats.own = TagRecord::new(STATISTICS_TAG.0);
        self.stats.tag_count = 1;

        unsafe {
            self.stats.tree.init(flags, compare_records);
            let own = addr_of_mut!(self.stats.own).cast::<RbNode>();
            // an empty tree cannot fail validation
            let _ = self.stats.tree.insert(own);
        }
    }

    /// Attribute `size` bytes to `tag`, creating its record if needed.
    unsafe fn collect_tag_statistics(&mut self, tag: u32, size: usize, allocate: bool) {
        let record = match self.stats.find(tag) {
            Some(record) => record,
            None => {
                if !allocate {
                    log::debug!("[heap] {:p}: free for untracked tag {}", self, Tag(tag));
                    return;
                }

                // recurses once: the statistics tag always has a record
                let Some(memory) = self.allocate(size_of::<TagRecord>(), STATISTICS_TAG) else {
                    return;
                };

                let record = memory.as_ptr().cast::<TagRecord>();
                record.write(TagRecord::new(tag));
                if self.stats.tree.insert(record.cast()).is_err() {
                    self.report_corruption(CorruptionCode::CorruptStructures, record.cast());
                }
                self.stats.tag_count += 1;
                record
            }
        };

        if allocate {
            (*record).record_allocation(size);
        } else {
            (*record).record_free(size);
        }
    }

    pub(super) unsafe fn note_allocation(&mut self, tag: u32, chunk_size: usize) {
        #[cfg(feature = "counters")]
        self.counters.account_alloc(chunk_size);

        if self.flags.contains(HeapFlags::COLLECT_TAG_STATISTICS) {
            self.collect_tag_statistics(tag, chunk_size, true);
        }
    }

    pub(super) unsafe fn note_free(&mut self, tag: u32, chunk_size: usize) {
        #[cfg(feature = "counters")]
        self.counters.account_dealloc(chunk_size);

        if self.flags.contains(HeapFlags::COLLECT_TAG_STATISTICS) {
            self.collect_tag_statistics(tag, chunk_size, false);
        }
    }

    pub(super) unsafe fn note_resize(&mut self, tag: u32, old_size: usize, new_size: usize) {
        #[cfg(feature = "counters")]
        self.counters.account_resize_in_place(old_size, new_size);

        if self.flags.contains(HeapFlags::COLLECT_TAG_STATISTICS) {
            self.collect_tag_statistics(tag, old_size, false);
            self.collect_tag_statistics(tag, new_size, true);
        }
    }

    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics {
            total_heap_size: self.total_heap_size,
            max_heap_size: self.max_heap_size,
            free_list_size: self.free_list_size,
            direct_allocation_size: self.direct_allocation_size,
            allocations: self.allocations,
            failed_allocations: self.failed_allocations,
            total_allocation_calls: self.total_allocation_calls,
            total_free_calls: self.total_free_calls,
            tag_count: self.stats.tag_count,
        }
    }

    /// The usage record for `tag`, if the heap has one.
    pub fn tag_statistics(&self, tag: Tag) -> Option<TagStatistics> {
        self.stats.find(tag.0).map(|record| unsafe { (*record).statistics() })
    }

    /// Visit every tag's usage record in ascending tag order.
    pub fn for_each_tag_statistics(&self, mut visit: impl FnMut(TagStatistics)) {
        self.stats.for_each(|record| visit(record.statistics()));
    }

    /// Serialize the heap and per-tag statistics for an external profiler.
    ///
    /// The header holds the magic, the record count, the total and free sizes,
    /// and the allocation, failure and free call counts. Each record holds
    /// the tag, the largest allocation (clamped to 32 bits), active and
    /// largest active sizes, lifetime bytes and the active and largest active
    /// counts. Everything is little-endian, and sizes are machine words.
    ///
    /// Output stops at the first piece that does not fit. Returns the
    /// number of bytes written.
    pub fn profile_snapshot(&self, buffer: &mut [u8]) -> usize {
        let mut writer = SnapshotWriter { buffer, written: 0 };

        if !writer.has_room(SNAPSHOT_HEADER_SIZE) {
            return 0;
        }

        writer.put(&SNAPSHOT_MAGIC.to_le_bytes());
        writer.put(&self.stats.tag_count.to_le_bytes());
        writer.put(&self.total_heap_size.to_le_bytes());
        writer.put(&self.free_list_size.to_le_bytes());
        writer.put(&self.total_allocation_calls.to_le_bytes());
        writer.put(&self.failed_allocations.to_le_bytes());
        writer.put(&self.total_free_calls.to_le_bytes());

        let mut full = false;
        self.stats.for_each(|record| {
            if full || !writer.has_room(SNAPSHOT_RECORD_SIZE) {
                full = true;
                return;
            }

            let largest = u32::try_from(record.largest).unwrap_or(u32::MAX);
            writer.put(&record.tag.to_le_bytes());
            writer.put(&largest.to_le_bytes());
            writer.put(&record.active.to_le_bytes());
            writer.put(&record.largest_active.to_le_bytes());
            writer.put(&record.lifetime.to_le_bytes());
            writer.put(&record.active_count.to_le_bytes());
            writer.put(&record.largest_active_count.to_le_bytes());
        });

        writer.written
    }

    /// Write a human-readable statistics table.
    pub fn debug_print_statistics(&self, out: &mut impl fmt::Write) -> fmt::Result {
        let free_percentage = if self.total_heap_size == 0 {
            0
        } else {
            (self.free_list_size as u128 * 100 / self.total_heap_size as u128) as u32
        };

        writeln!(
            out,
            "Heap {:p}, Size {}, {}% free, {} allocation calls, {} free calls {} failed.",
            self,
            self.total_heap_size,
            free_percentage,
            self.total_allocation_calls,
            self.total_free_calls,
            self.failed_allocations,
        )?;

        out.write_str(
            "     Largest                                    Active   Max Active\n\
             Tag  Alloc    Active Bytes     Max Active Bytes Count    Count      Lifetime Alloc\n\
             ------------------------------------------------------------------------------------\n",
        )?;

        let mut result = Ok(());
        self.stats.for_each(|record| {
            if result.is_err() {
                return;
            }

            let [a, b, c, d] = record.tag.to_le_bytes();
            result = writeln!(
                out,
                "{}{}{}{} 0x{:8x} {:16} {:16} {:8} {:8} {:16}",
                a as char,
                b as char,
                c as char,
                d as char,
                record.largest,
                record.active,
                record.largest_active,
                record.active_count,
                record.largest_active_count,
                record.lifetime,
            );
        });
        result
    }
}
