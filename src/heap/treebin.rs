//! Bitwise tries for chunks of 256 bytes and up.
//!
//! Bin `i` holds sizes in `[min_size_for_tree_index(i), min_size_for_tree_index(i + 1))`.
//! Within a bin, each level of the trie branches on the next lower bit of
//! the size. Equal-sized chunks hang off the trie node in a circular list
//! and have a null parent.

use core::ptr::{addr_of_mut, null_mut};

use crate::{bits::*, provider::Provider, ptr_utils::WORD_BITS};

use super::{chunk::*, Heap, FREE_MAGIC};

/// The tree bin for a chunk of `size` bytes.
pub fn compute_tree_index(size: usize) -> usize {
    let x = size >> TREE_BIN_SHIFT;
    if x == 0 {
        0
    } else if x > 0xFFFF {
        TREE_BIN_COUNT - 1
    } else {
        let k = (usize::BITS - 1 - x.leading_zeros()) as usize;
        (k << 1) + ((size >> (k + TREE_BIN_SHIFT - 1)) & 1)
    }
}

/// Shift placing the first size bit that bin `index` branches on at the top.
#[inline]
pub fn left_shift_for_tree_index(index: usize) -> usize {
    if index == TREE_BIN_COUNT - 1 {
        0
    } else {
        WORD_BITS - 1 - ((index >> 1) + TREE_BIN_SHIFT - 2)
    }
}

/// Smallest chunk size held by bin `index`.
#[inline]
pub const fn min_size_for_tree_index(index: usize) -> usize {
    (1 << ((index >> 1) + TREE_BIN_SHIFT)) | ((index & 1) << ((index >> 1) + TREE_BIN_SHIFT - 1))
}

#[inline]
unsafe fn leftmost_child(chunk: *mut TreeChunk) -> *mut TreeChunk {
    if !(*chunk).child[0].is_null() {
        (*chunk).child[0]
    } else {
        (*chunk).child[1]
    }
}

#[inline]
unsafe fn tree_chunk_size(chunk: *const TreeChunk) -> usize {
    chunk_size(chunk.cast())
}

impl<P: Provider> Heap<P> {
    #[inline]
    pub(super) fn tree_bin_at(&mut self, index: usize) -> *mut *mut TreeChunk {
        debug_assert!(index < TREE_BIN_COUNT);
        addr_of_mut!(self.tree_bins[index])
    }

    #[inline]
    pub(super) fn tree_map_is_marked(&self, index: usize) -> bool {
        self.tree_map & (1 << index) != 0
    }

    pub(super) unsafe fn insert_large(&mut self, chunk: *mut TreeChunk, size: usize) {
        let index = compute_tree_index(size);
        let head = self.tree_bin_at(index);

        (*chunk).index = index as u32;
        (*chunk).child = [null_mut(); 2];

        if !self.tree_map_is_marked(index) {
            self.tree_map |= 1 << index;
            *head = chunk;
            // a root's parent is its bin slot
            (*chunk).parent = head.cast();
            (*chunk).next = chunk;
            (*chunk).prev = chunk;
            return;
        }

        let mut node = *head;
        let mut bits = size << left_shift_for_tree_index(index);
        loop {
            if tree_chunk_size(node) != size {
                let slot = addr_of_mut!((*node).child[(bits >> (WORD_BITS - 1)) & 1]);
                bits <<= 1;

                if !(*slot).is_null() {
                    node = *slot;
                } else if self.ok_address(slot.cast()) {
                    *slot = chunk;
                    (*chunk).parent = node;
                    (*chunk).next = chunk;
                    (*chunk).prev = chunk;
                    return;
                } else {
                    self.corrupt_structures(slot);
                    return;
                }
            } else {
                let next = (*node).next;
                if self.ok_address(node.cast()) && self.ok_address(next.cast()) {
                    (*next).prev = chunk;
                    (*node).next = chunk;
                    (*chunk).next = next;
                    (*chunk).prev = node;
                    (*chunk).parent = null_mut();
                } else {
                    self.corrupt_structures(node);
                }
                return;
            }
        }
    }

    /// Remove a chunk from its tree bin.
    ///
    /// A chunk with same-sized siblings is replaced by one of them. Otherwise
    /// its rightmost descendant takes its place.
    pub(super) unsafe fn unlink_large(&mut self, chunk: *mut TreeChunk) {
        let parent = (*chunk).parent;
        let mut replacement: *mut TreeChunk;

        if (*chunk).prev != chunk {
            let next = (*chunk).next;
            replacement = (*chunk).prev;
            if self.ok_address(next.cast()) && (*next).prev == chunk && (*replacement).next == chunk {
                (*next).prev = replacement;
                (*replacement).next = next;
            } else {
                self.corrupt_structures(chunk);
                return;
            }
        } else {
            let mut slot = addr_of_mut!((*chunk).child[1]);
            replacement = *slot;
            if replacement.is_null() {
                slot = addr_of_mut!((*chunk).child[0]);
                replacement = *slot;
            }

            if !replacement.is_null() {
                loop {
                    let right = addr_of_mut!((*replacement).child[1]);
                    let left = addr_of_mut!((*replacement).child[0]);
                    if !(*right).is_null() {
                        slot = right;
                    } else if !(*left).is_null() {
                        slot = left;
                    } else {
                        break;
                    }
                    replacement = *slot;
                }

                if self.ok_address(slot.cast()) {
                    *slot = null_mut();
                } else {
                    self.corrupt_structures(slot);
                    return;
                }
            }
        }

        if parent.is_null() {
            // a sibling in a same-size list, not a trie node
            return;
        }

        let index = (*chunk).index as usize;
        let head = self.tree_bin_at(index);
        if chunk == *head {
            *head = replacement;
            if replacement.is_null() {
                self.tree_map &= !(1 << index);
            }
        } else if self.ok_address(parent.cast()) {
            if (*parent).child[0] == chunk {
                (*parent).child[0] = replacement;
            } else {
                (*parent).child[1] = replacement;
            }
        } else {
            self.corrupt_structures(parent);
            return;
        }

        if replacement.is_null() {
            return;
        }

        if !self.ok_address(replacement.cast()) {
            self.corrupt_structures(replacement);
            return;
        }

        (*replacement).parent = parent;
        for side in 0..2 {
            let child = (*chunk).child[side];
            if child.is_null() {
                continue;
            }
            if self.ok_address(child.cast()) {
                (*replacement).child[side] = child;
                (*child).parent = replacement;
            } else {
                self.corrupt_structures(child);
            }
        }
    }

    /// Carve the chosen tree chunk, binning or discarding the remainder.
    unsafe fn take_tree_chunk(
        &mut self,
        victim: *mut TreeChunk,
        nb: usize,
        remainder_size: usize,
        tag: u32,
        remainder_to_dv: bool,
    ) -> *mut u8 {
        let chunk = victim.cast::<Chunk>();
        let remainder = chunk_plus_offset(chunk, nb);

        if !self.ok_address(chunk.cast()) || !Self::ok_next(chunk, remainder) {
            self.corrupt_structures(chunk);
            return null_mut();
        }

        self.unlink_large(victim);

        if remainder_size < MIN_CHUNK_SIZE {
            let size = remainder_size + nb;
            set_inuse_and_pinuse(self.address(), chunk, size, tag);
            self.free_list_size -= size;
        } else {
            set_size_pinuse_of_inuse(self.address(), chunk, nb, tag);
            set_size_pinuse_of_free(remainder, remainder_size);
            (*remainder).tag = FREE_MAGIC;
            if remainder_to_dv {
                self.replace_dv(remainder, remainder_size);
            } else {
                self.insert_chunk(remainder, remainder_size);
            }
            self.free_list_size -= nb;
        }

        chunk_to_payload(chunk)
    }

    /// Best fit for a large request, or null when the designated victim
    /// would fit at least as well.
    pub(super) unsafe fn tree_alloc_large(&mut self, nb: usize, tag: u32) -> *mut u8 {
        let mut victim: *mut TreeChunk = null_mut();
        let mut remainder_size = nb.wrapping_neg();
        let index = compute_tree_index(nb);
        let mut node = *self.tree_bin_at(index);

        if !node.is_null() {
            // walk down the trie along nb's bits, remembering the deepest
            // right subtree not taken
            let mut bits = nb << left_shift_for_tree_index(index);
            let mut right_subtree: *mut TreeChunk = null_mut();
            loop {
                let excess = tree_chunk_size(node).wrapping_sub(nb);
                if excess < remainder_size {
                    victim = node;
                    remainder_size = excess;
                    if remainder_size == 0 {
                        break;
                    }
                }

                let right = (*node).child[1];
                node = (*node).child[(bits >> (WORD_BITS - 1)) & 1];
                if !right.is_null() && right != node {
                    right_subtree = right;
                }
                if node.is_null() {
                    node = right_subtree;
                    break;
                }
                bits <<= 1;
            }
        }

        if node.is_null() && victim.is_null() {
            let larger = left_bits(1 << index) & self.tree_map;
            if larger != 0 {
                node = *self.tree_bin_at(bit_index(least_bit(larger)));
            }
        }

        while !node.is_null() {
            let excess = tree_chunk_size(node).wrapping_sub(nb);
            if excess < remainder_size {
                remainder_size = excess;
                victim = node;
            }
            node = leftmost_child(node);
        }

        if !victim.is_null() && remainder_size < self.dv_size.wrapping_sub(nb) {
            return self.take_tree_chunk(victim, nb, remainder_size, tag, false);
        }

        null_mut()
    }

    /// Serve a small request from the smallest tree chunk.
    pub(super) unsafe fn tree_alloc_small(&mut self, nb: usize, tag: u32) -> *mut u8 {
        let index = bit_index(least_bit(self.tree_map));
        let mut victim = *self.tree_bin_at(index);
        let mut node = victim;
        let mut remainder_size = tree_chunk_size(victim) - nb;

        loop {
            node = leftmost_child(node);
            if node.is_null() {
                break;
            }
            let excess = tree_chunk_size(node) - nb;
            if excess < remainder_size {
                remainder_size = excess;
                victim = node;
            }
        }

        self.take_tree_chunk(victim, nb, remainder_size, tag, true)
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use super::super::testing::*;
    use super::super::*;
    use super::*;

    #[test]
    fn tree_index_bounds() {
        assert_eq!(compute_tree_index(256), 0);
        assert_eq!(compute_tree_index(383), 0);
        assert_eq!(compute_tree_index(384), 1);
        assert_eq!(compute_tree_index(512), 2);
        assert_eq!(compute_tree_index(usize::MAX), TREE_BIN_COUNT - 1);

        for index in 0..TREE_BIN_COUNT - 1 {
            let min = min_size_for_tree_index(index);
            assert_eq!(compute_tree_index(min), index);
            assert_eq!(compute_tree_index(min_size_for_tree_index(index + 1) - 1), index);
        }
    }

    #[test]
    fn left_shift_targets_branch_bit() {
        // bin 0 covers [256, 384): bit 7 is fixed, bit 6 is the first branch bit
        let shift = left_shift_for_tree_index(0);
        assert_eq!(((256usize + 64) << shift) >> (WORD_BITS - 1), 1);
        assert_eq!((256usize << shift) >> (WORD_BITS - 1), 0);
        assert_eq!(((256usize + 63) << shift) >> (WORD_BITS - 1), 0);

        // bin 1 covers [384, 512) and branches on bit 6 as well
        assert_eq!(left_shift_for_tree_index(1), shift);
        // bin 2 covers [512, 768) and branches on bit 7
        assert_eq!(((512usize + 128) << left_shift_for_tree_index(2)) >> (WORD_BITS - 1), 1);
        assert_eq!(left_shift_for_tree_index(TREE_BIN_COUNT - 1), 0);
    }

    /// Allocate chunks of the given sizes separated by small guards, then free
    /// the big ones so they land in tree bins.
    unsafe fn scatter(heap: &mut Heap<TestProvider>, sizes: &[usize]) -> Vec<NonNull<u8>> {
        let mut freed = Vec::new();
        let mut guards = Vec::new();
        for &size in sizes {
            freed.push(heap.allocate(size, TAG_A).unwrap());
            guards.push(heap.allocate(24, TAG_B).unwrap());
        }
        for p in &freed {
            heap.free(p.as_ptr());
        }
        freed
    }

    #[test]
    fn best_fit_across_tree() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe {
            let sizes = [1000, 600, 3000, 700, 650, 2000, 610];
            let freed = scatter(&mut heap, &sizes);
            heap.validate(None).unwrap();

            // 620 fits best in the 650-byte request's chunk
            let p = heap.allocate(620, TAG_A).unwrap();
            assert_eq!(p, freed[4]);

            // exact fit
            let p = heap.allocate(700, TAG_A).unwrap();
            assert_eq!(p, freed[3]);

            // nothing in 1000's bin is larger, so a larger bin is used
            let p = heap.allocate(1200, TAG_A).unwrap();
            assert_eq!(p, freed[5]);
        }
        heap.validate(None).unwrap();
    }

    #[test]
    fn same_size_chains_unlink_cleanly() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe {
            let freed = scatter(&mut heap, &[800, 800, 800, 800]);
            heap.validate(None).unwrap();

            let mut got = Vec::new();
            for _ in 0..4 {
                got.push(heap.allocate(800, TAG_A).unwrap());
                heap.validate(None).unwrap();
            }
            got.sort();
            let mut expected = freed.clone();
            expected.sort();
            assert_eq!(got, expected);
            assert_eq!(heap.tree_map & (1 << compute_tree_index(request_to_size(800))), 0);
        }
    }

    #[test]
    fn small_request_falls_back_to_tree() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe {
            let freed = scatter(&mut heap, &[400]);
            assert_eq!(heap.small_map, 0);

            let p = heap.allocate(40, TAG_A).unwrap();
            assert_eq!(p, freed[0]);
            // the remainder became the designated victim
            assert_eq!(heap.designated_victim_size(), request_to_size(400) - request_to_size(40));
        }
        heap.validate(None).unwrap();
    }

    #[test]
    fn random_tree_churn() {
        let mut heap = new_heap(HeapConfig::new());
        let rng = fastrand::Rng::with_seed(0xC0FFEE);
        let mut live = Vec::new();

        unsafe {
            for step in 0..2000 {
                if live.is_empty() || rng.u8(..) < 150 {
                    let size = rng.usize(256..8192);
                    let p = heap.allocate(size, TAG_A).unwrap();
                    p.as_ptr().write_bytes(0x5A, size);
                    live.push((p, size));
                } else {
                    let (p, _) = live.swap_remove(rng.usize(..live.len()));
                    heap.free(p.as_ptr());
                }

                if step % 97 == 0 {
                    heap.validate(None).unwrap();
                }
            }

            for (p, size) in live.drain(..) {
                assert!(heap.usable_size(p.as_ptr()) >= size);
                heap.free(p.as_ptr());
            }
        }
        heap.validate(None).unwrap();
        assert!(heap.provider.reports.is_empty());
    }
}
