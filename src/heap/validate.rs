//! Full consistency checks over bins, special chunks, segments and the
//! statistics tree.

use core::ptr::{addr_of, null_mut};

use crate::{provider::Provider, ptr_utils::*};

use super::{
    chunk::*,
    segment::Segment,
    treebin::{compute_tree_index, left_shift_for_tree_index, min_size_for_tree_index},
    CorruptionCode, Heap, FREE_MAGIC, HEAP_MAGIC,
};

/// The first problem found by [`Heap::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Corruption {
    pub code: CorruptionCode,
    /// The chunk or structure at fault, or null.
    pub pointer: *mut u8,
}

impl core::fmt::Display for Corruption {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} at {:p}", self.code, self.pointer)
    }
}

type Check = Result<(), Corruption>;

#[inline]
fn fail<T>(code: CorruptionCode, pointer: *const T) -> Check {
    Err(Corruption { code, pointer: pointer as *mut u8 })
}

#[inline]
fn ensure<T>(condition: bool, pointer: *const T) -> Check {
    if condition {
        Ok(())
    } else {
        fail(CorruptionCode::CorruptStructures, pointer)
    }
}

impl<P: Provider> Heap<P> {
    /// Check every structure in the heap.
    ///
    /// The first problem found is passed to `reporter`, or to the provider's
    /// [`on_corruption`](Provider::on_corruption) if no reporter is given,
    /// and returned.
    pub fn validate(&mut self, reporter: Option<&mut dyn FnMut(*const u8, CorruptionCode, *mut u8)>) -> Result<(), Corruption> {
        let result = if self.magic != HEAP_MAGIC {
            fail(CorruptionCode::CorruptStructures, null_mut::<u8>())
        } else {
            unsafe { self.check_all() }
        };

        if let Err(corruption) = result {
            let heap = self as *const Self as *const u8;
            log::warn!("[heap] {:p}: validation failed: {}", heap, corruption);
            match reporter {
                Some(report) => report(heap, corruption.code, corruption.pointer),
                None => self.provider.on_corruption(heap, corruption.code, corruption.pointer),
            }
        }

        result
    }

    unsafe fn check_all(&self) -> Check {
        for index in 0..SMALL_BIN_COUNT {
            self.check_small_bin(index)?;
        }
        for index in 0..TREE_BIN_COUNT {
            self.check_tree_bin(index)?;
        }

        if self.dv_size != 0 {
            let dv = self.dv;
            ensure(chunk_size(dv) == self.dv_size, dv)?;
            ensure(self.dv_size >= MIN_CHUNK_SIZE, dv)?;
            ensure(!self.find_in_bins(dv), dv)?;
            self.check_free_chunk(dv)?;
        }

        if self.has_top() {
            self.check_top()?;
            let total = self.traverse_and_check()?;
            ensure(total <= self.total_heap_size, self.top)?;
        } else {
            ensure(self.free_list_size == 0, null_mut::<u8>())?;
        }

        ensure(self.total_heap_size <= self.max_heap_size, null_mut::<u8>())?;

        let stats_root = addr_of!(self.stats);
        if self.stats.validate().is_err() {
            return fail(CorruptionCode::CorruptStructures, stats_root);
        }

        Ok(())
    }

    /// Bounds walks over possibly broken links.
    fn step_limit(&self) -> usize {
        self.total_heap_size / MIN_CHUNK_SIZE + 2
    }

    unsafe fn check_chunk(&self, chunk: *const Chunk) -> Check {
        ensure(is_chunk_aligned(chunk_to_payload(chunk as *mut Chunk)), chunk)?;
        ensure(self.ok_address(chunk.cast()), chunk)
    }

    unsafe fn check_free_chunk(&self, chunk: *mut Chunk) -> Check {
        let size = chunk_size(chunk);
        let next = chunk_plus_offset(chunk, size);

        self.check_chunk(chunk)?;
        ensure(!is_inuse(chunk), chunk)?;
        ensure(!next_pinuse(chunk), chunk)?;
        ensure(!is_direct(chunk), chunk)?;

        if chunk != self.dv && chunk != self.top {
            ensure(size >= MIN_CHUNK_SIZE, chunk)?;
            ensure(size & CHUNK_ALIGN_MASK == 0, chunk)?;
            ensure((*next).prev_foot == size, chunk)?;
            ensure(pinuse(chunk), chunk)?;
            ensure(next == self.top || is_inuse(next), chunk)?;
            ensure((*(*chunk).next).prev == chunk, chunk)?;
            ensure((*(*chunk).prev).next == chunk, chunk)?;
        }

        Ok(())
    }

    unsafe fn check_inuse_chunk(&self, chunk: *mut Chunk) -> Check {
        self.check_chunk(chunk)?;
        ensure(is_inuse(chunk), chunk)?;
        ensure(next_pinuse(chunk), chunk)?;
        ensure((*chunk).tag != FREE_MAGIC, chunk)?;
        ensure(pinuse(chunk) || next_chunk(prev_chunk(chunk)) == chunk, chunk)?;

        if footer_heap(chunk) != self.address() {
            return fail(CorruptionCode::BufferOverrun, chunk);
        }

        Ok(())
    }

    unsafe fn check_top(&self) -> Check {
        let top = self.top;
        let size = chunk_size(top);
        let segment = &self.segment;

        ensure(segment.holds(top.cast()), top)?;
        self.check_chunk(top)?;
        ensure(size == self.top_size, top)?;
        ensure(size > 0, top)?;
        ensure(size == segment.end() as usize - top as usize - TOP_FOOTER_SIZE, top)?;
        ensure(pinuse(top), top)?;
        ensure(!pinuse(chunk_plus_offset(top, size)), top)
    }

    unsafe fn check_small_bin(&self, index: usize) -> Check {
        let bin = addr_of!(self.small_bins[index]) as *mut Chunk;
        let empty = self.small_map & (1 << index) == 0;

        if empty {
            return ensure((*bin).next == bin && (*bin).prev == bin, bin);
        }

        ensure((*bin).next != bin, bin)?;

        let mut chunk = (*bin).next;
        let mut steps = 0;
        while chunk != bin {
            steps += 1;
            ensure(steps <= self.step_limit(), bin)?;

            ensure(chunk_size(chunk) == small_index_to_size(index), chunk)?;
            self.check_free_chunk(chunk)?;
            ensure(chunk != self.dv, chunk)?;

            let next = next_chunk(chunk);
            if next != self.top && (*next).head != FENCEPOST_HEADER {
                self.check_inuse_chunk(next)?;
            }

            chunk = (*chunk).next;
        }

        Ok(())
    }

    unsafe fn check_tree_bin(&self, index: usize) -> Check {
        let root = self.tree_bins[index];
        let empty = self.tree_map & (1 << index) == 0;
        let slot = addr_of!(self.tree_bins[index]);

        ensure(root.is_null() == empty, slot)?;
        if root.is_null() {
            return Ok(());
        }

        ensure((*root).parent == slot as *mut TreeChunk, root)?;
        self.check_tree(root, index, 0)
    }

    /// Check a trie node, its same-size siblings and its subtrees.
    unsafe fn check_tree(&self, node: *mut TreeChunk, index: usize, depth: usize) -> Check {
        ensure(depth <= WORD_BITS, node)?;

        let size = chunk_size(node.cast());
        ensure(compute_tree_index(size) == index, node)?;
        ensure(size >= MIN_LARGE_SIZE, node)?;
        ensure(size >= min_size_for_tree_index(index), node)?;
        ensure(index == TREE_BIN_COUNT - 1 || size < min_size_for_tree_index(index + 1), node)?;

        let mut trie_nodes = 0;
        let mut sibling = node;
        let mut steps = 0;
        loop {
            steps += 1;
            ensure(steps <= self.step_limit(), node)?;

            self.check_free_chunk(sibling.cast())?;
            ensure((*sibling).index as usize == index, sibling)?;
            ensure(chunk_size(sibling.cast()) == size, sibling)?;
            ensure((*(*sibling).next).prev == sibling, sibling)?;
            ensure((*(*sibling).prev).next == sibling, sibling)?;

            let [left, right] = (*sibling).child;
            if (*sibling).parent.is_null() {
                ensure(left.is_null() && right.is_null(), sibling)?;
            } else {
                trie_nodes += 1;
                ensure(sibling == node, sibling)?;

                let parent = (*sibling).parent;
                let is_root = parent as *const TreeChunk == addr_of!(self.tree_bins[index]).cast();
                ensure(
                    is_root || (*parent).child[0] == sibling || (*parent).child[1] == sibling,
                    sibling,
                )?;

                for child in [left, right] {
                    if !child.is_null() {
                        ensure((*child).parent == sibling, child)?;
                        ensure(child != sibling, child)?;
                        self.check_tree(child, index, depth + 1)?;
                    }
                }

                if !left.is_null() && !right.is_null() {
                    ensure(chunk_size(left.cast()) < chunk_size(right.cast()), sibling)?;
                }
            }

            sibling = (*sibling).next;
            if sibling == node {
                break;
            }
        }

        ensure(trie_nodes == 1, node)
    }

    /// Whether `chunk` is reachable from its bin.
    unsafe fn find_in_bins(&self, chunk: *mut Chunk) -> bool {
        let size = chunk_size(chunk);

        if is_small(size) {
            let index = small_index(size);
            let bin = addr_of!(self.small_bins[index]) as *mut Chunk;
            if self.small_map & (1 << index) == 0 {
                return false;
            }

            let mut entry = (*bin).next;
            let mut steps = 0;
            while entry != bin && steps <= self.step_limit() {
                if entry == chunk {
                    return true;
                }
                entry = (*entry).next;
                steps += 1;
            }
            return false;
        }

        let index = compute_tree_index(size);
        if self.tree_map & (1 << index) == 0 {
            return false;
        }

        let mut node = self.tree_bins[index];
        let mut bits = size << left_shift_for_tree_index(index);
        while !node.is_null() && chunk_size(node.cast()) != size {
            node = (*node).child[(bits >> (WORD_BITS - 1)) & 1];
            bits <<= 1;
        }

        if node.is_null() {
            return false;
        }

        let first = node;
        let mut steps = 0;
        loop {
            if node.cast::<Chunk>() == chunk {
                return true;
            }
            node = (*node).next;
            steps += 1;
            if node == first || steps > self.step_limit() {
                return false;
            }
        }
    }

    /// Walk every chunk of every segment. Returns the bytes covered.
    unsafe fn traverse_and_check(&self) -> Result<usize, Corruption> {
        let mut total = self.top_size + TOP_FOOTER_SIZE;
        let mut free = self.top_size;

        let mut segment: *const Segment = &self.segment;
        while !segment.is_null() {
            let mut chunk = align_as_chunk((*segment).base);
            let mut previous: *mut Chunk = null_mut();
            let mut steps = 0;

            ensure(pinuse(chunk), chunk)?;

            while (*segment).holds(chunk.cast())
                && chunk != self.top
                && (*chunk).head != FENCEPOST_HEADER
            {
                steps += 1;
                ensure(steps <= self.step_limit(), chunk)?;

                let size = chunk_size(chunk);
                ensure(size != 0, chunk)?;
                total += size;

                if is_inuse(chunk) {
                    ensure(!self.find_in_bins(chunk), chunk)?;
                    self.check_inuse_chunk(chunk)?;
                } else {
                    ensure(chunk == self.dv || self.find_in_bins(chunk), chunk)?;
                    // coalescing never leaves two free chunks side by side
                    ensure(previous.is_null() || is_inuse(previous), chunk)?;
                    self.check_free_chunk(chunk)?;
                    free += size;
                }

                previous = chunk;
                chunk = chunk_plus_offset(chunk, size);
            }

            segment = (*segment).next;
        }

        if free != self.free_list_size {
            log::debug!("[heap] free bytes found {} but recorded {}", free, self.free_list_size);
            return Err(Corruption { code: CorruptionCode::CorruptStructures, pointer: self.top.cast() });
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::*;
    use super::*;

    #[test]
    fn empty_heap_is_valid() {
        let mut heap = new_heap(HeapConfig::new());
        assert_eq!(heap.validate(None), Ok(()));
    }

    #[test]
    fn uninitialized_heap_is_invalid() {
        let mut heap = std::boxed::Box::new(Heap::new(TestProvider::new()));
        assert_eq!(heap.validate(None).unwrap_err().code, CorruptionCode::CorruptStructures);
        assert_eq!(heap.provider.reports.len(), 1);
    }

    #[test]
    fn stray_bitmap_bit_is_caught() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe { heap.allocate(64, TAG_A).unwrap() };

        heap.small_map |= 1 << 10;
        let mut seen = Vec::new();
        let mut record = |_: *const u8, code: CorruptionCode, _: *mut u8| seen.push(code);
        let reporter: &mut dyn FnMut(*const u8, CorruptionCode, *mut u8) = &mut record;
        let result = heap.validate(Some(reporter));

        assert!(result.is_err());
        assert_eq!(seen, vec![CorruptionCode::CorruptStructures]);
        // the reporter replaces the provider callback
        assert!(heap.provider.reports.is_empty());
    }

    #[test]
    fn damaged_free_chunk_is_caught() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe {
            let a = heap.allocate(40, TAG_A).unwrap();
            let _guard = heap.allocate(40, TAG_A).unwrap();
            heap.free(a.as_ptr());
            heap.validate(None).unwrap();

            // an underrun from the neighbour below scribbles over the header
            (*payload_to_chunk(a.as_ptr())).head += 16;
        }
        let error = heap.validate(None).unwrap_err();
        assert_eq!(error.code, CorruptionCode::CorruptStructures);
        assert_eq!(heap.provider.reports.len(), 1);
    }

    #[test]
    fn overrun_footer_is_caught() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe {
            let a = heap.allocate(40, TAG_A).unwrap();
            let _b = heap.allocate(40, TAG_A).unwrap();
            let usable = heap.usable_size(a.as_ptr());
            a.as_ptr().add(usable).write(0xFF);

            let error = heap.validate(None).unwrap_err();
            assert_eq!(error.code, CorruptionCode::BufferOverrun);
            assert_eq!(error.pointer, payload_to_chunk(a.as_ptr()).cast::<u8>());
        }
    }

    #[test]
    fn free_list_drift_is_caught() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe { heap.allocate(64, TAG_A).unwrap() };
        heap.free_list_size += 16;
        assert!(heap.validate(None).is_err());
    }
}
