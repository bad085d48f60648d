//! Exact-size bins for chunks under 256 bytes.
//!
//! Each bin is a sentinel chunk heading a circular doubly linked list, and a
//! bit in `small_map` records whether the list is non-empty.

use core::ptr::addr_of_mut;

use crate::provider::Provider;

use super::{chunk::*, CorruptionCode, Heap};

impl<P: Provider> Heap<P> {
    #[inline]
    pub(super) fn small_bin_at(&mut self, index: usize) -> *mut Chunk {
        debug_assert!(index < SMALL_BIN_COUNT);
        addr_of_mut!(self.small_bins[index])
    }

    #[inline]
    pub(super) fn small_map_is_marked(&self, index: usize) -> bool {
        self.small_map & (1 << index) != 0
    }

    #[inline]
    fn mark_small_map(&mut self, index: usize) {
        self.small_map |= 1 << index;
    }

    #[inline]
    fn clear_small_map(&mut self, index: usize) {
        self.small_map &= !(1 << index);
    }

    /// Point every small bin at itself.
    pub(super) fn init_bins(&mut self) {
        for index in 0..SMALL_BIN_COUNT {
            let bin = self.small_bin_at(index);
            unsafe {
                (*bin).next = bin;
                (*bin).prev = bin;
            }
        }
    }

    pub(super) fn corrupt_structures<T>(&mut self, pointer: *mut T) {
        self.report_corruption(CorruptionCode::CorruptStructures, pointer.cast());
    }

    /// Push a free chunk onto the front of its bin.
    pub(super) unsafe fn insert_small(&mut self, chunk: *mut Chunk, size: usize) {
        debug_assert!(size >= MIN_CHUNK_SIZE);

        let index = small_index(size);
        let bin = self.small_bin_at(index);
        let mut front = bin;

        if !self.small_map_is_marked(index) {
            self.mark_small_map(index);
        } else if self.ok_address((*bin).next.cast()) {
            front = (*bin).next;
        } else {
            self.corrupt_structures(bin);
            return;
        }

        (*bin).next = chunk;
        (*front).prev = chunk;
        (*chunk).next = front;
        (*chunk).prev = bin;
    }

    pub(super) unsafe fn unlink_small(&mut self, chunk: *mut Chunk, size: usize) {
        let next = (*chunk).next;
        let prev = (*chunk).prev;
        let index = small_index(size);
        let bin = self.small_bin_at(index);

        debug_assert!(chunk != prev && chunk != next);
        debug_assert!(chunk_size(chunk) == small_index_to_size(index));

        let next_ok = next == bin || (self.ok_address(next.cast()) && (*next).prev == chunk);
        let prev_ok = prev == bin || (self.ok_address(prev.cast()) && (*prev).next == chunk);
        if !next_ok || !prev_ok {
            self.corrupt_structures(chunk);
            return;
        }

        (*next).prev = prev;
        (*prev).next = next;
        if next == prev {
            self.clear_small_map(index);
        }
    }

    /// Unlink `chunk`, the first entry of `bin`.
    pub(super) unsafe fn unlink_first_small(&mut self, bin: *mut Chunk, chunk: *mut Chunk, index: usize) {
        let next = (*chunk).next;

        debug_assert!(chunk != bin && chunk != next);
        debug_assert!(chunk_size(chunk) == small_index_to_size(index));

        if next != bin && !(self.ok_address(next.cast()) && (*next).prev == chunk) {
            self.corrupt_structures(chunk);
            return;
        }

        (*next).prev = bin;
        (*bin).next = next;
        if next == bin {
            self.clear_small_map(index);
        }
    }

    /// Make `chunk` the designated victim, binning the previous one.
    pub(super) unsafe fn replace_dv(&mut self, chunk: *mut Chunk, size: usize) {
        if self.dv_size != 0 {
            let dv = self.dv;
            let dv_size = self.dv_size;
            self.insert_chunk(dv, dv_size);
        }

        self.dv = chunk;
        self.dv_size = size;
    }

    pub(super) unsafe fn insert_chunk(&mut self, chunk: *mut Chunk, size: usize) {
        if is_small(size) {
            self.insert_small(chunk, size);
        } else {
            self.insert_large(chunk.cast(), size);
        }
    }

    pub(super) unsafe fn unlink_chunk(&mut self, chunk: *mut Chunk, size: usize) {
        if is_small(size) {
            self.unlink_small(chunk, size);
        } else {
            self.unlink_large(chunk.cast());
        }
    }
}
