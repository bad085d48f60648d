//! Allocation, free, reallocation and aligned allocation.

use core::ptr::{null_mut, NonNull};

use crate::{bits::*, provider::Provider, ptr_utils::*};

use super::{chunk::*, CorruptionCode, Heap, HeapError, Tag, FREE_MAGIC, HEAP_MAGIC};

impl<P: Provider> Heap<P> {
    /// Allocate `size` bytes tagged with `tag`.
    ///
    /// The payload is aligned to twice the word size. Returns `None` when
    /// memory cannot be obtained or `tag` is reserved.
    ///
    /// # Safety
    /// The heap must be initialized and must not have moved since.
    pub unsafe fn allocate(&mut self, size: usize, tag: Tag) -> Option<NonNull<u8>> {
        if self.magic != HEAP_MAGIC {
            self.report_corruption(CorruptionCode::CorruptStructures, null_mut());
            return None;
        }
        if tag.is_reserved() {
            return None;
        }

        self.total_allocation_calls += 1;

        let payload = self.allocate_chunk(size, tag.0);
        match NonNull::new(payload) {
            Some(payload) => {
                self.allocations += 1;
                self.note_allocation(tag.0, chunk_size(payload_to_chunk(payload.as_ptr())));
                Some(payload)
            }
            None => {
                self.failed_allocations += 1;
                log::trace!("[heap] {:p}: allocation of {} bytes for {} failed", self, size, tag);
                None
            }
        }
    }

    /// Find or make a chunk for `bytes` and mark it in use. Returns the payload or null.
    unsafe fn allocate_chunk(&mut self, bytes: usize, tag: u32) -> *mut u8 {
        let nb;

        if bytes <= MAX_SMALL_REQUEST {
            nb = request_to_size(bytes);
            let mut index = small_index(nb);
            let small_bits = self.small_map >> index;

            if small_bits & 0x3 != 0 {
                // an exact fit, or one bin up
                index += (!small_bits & 1) as usize;
                let bin = self.small_bin_at(index);
                let chunk = (*bin).next;
                let size = small_index_to_size(index);
                debug_assert_eq!(chunk_size(chunk), size);

                self.unlink_first_small(bin, chunk, index);
                set_inuse_and_pinuse(self.address(), chunk, size, tag);
                self.free_list_size -= size;
                return chunk_to_payload(chunk);
            }

            if nb > self.dv_size {
                if small_bits != 0 {
                    // split the next nonempty small bin, keeping the rest as victim
                    let left = (small_bits << index) & left_bits(1 << index);
                    let index = bit_index(least_bit(left));
                    let bin = self.small_bin_at(index);
                    let chunk = (*bin).next;
                    let size = small_index_to_size(index);
                    debug_assert_eq!(chunk_size(chunk), size);

                    self.unlink_first_small(bin, chunk, index);
                    let remainder_size = size - nb;

                    if remainder_size < MIN_CHUNK_SIZE {
                        set_inuse_and_pinuse(self.address(), chunk, size, tag);
                        self.free_list_size -= size;
                    } else {
                        set_size_pinuse_of_inuse(self.address(), chunk, nb, tag);
                        let remainder = chunk_plus_offset(chunk, nb);
                        set_size_pinuse_of_free(remainder, remainder_size);
                        (*remainder).tag = FREE_MAGIC;
                        self.replace_dv(remainder, remainder_size);
                        self.free_list_size -= nb;
                    }
                    return chunk_to_payload(chunk);
                }

                if self.tree_map != 0 {
                    let payload = self.tree_alloc_small(nb, tag);
                    if !payload.is_null() {
                        return payload;
                    }
                }
            }
        } else if bytes >= MAX_REQUEST {
            return null_mut();
        } else {
            nb = pad_request(bytes);
            if self.tree_map != 0 {
                let payload = self.tree_alloc_large(nb, tag);
                if !payload.is_null() {
                    return payload;
                }
            }
        }

        if nb <= self.dv_size {
            let chunk = self.dv;
            let remainder_size = self.dv_size - nb;

            if remainder_size >= MIN_CHUNK_SIZE {
                let remainder = chunk_plus_offset(chunk, nb);
                self.dv = remainder;
                self.dv_size = remainder_size;
                set_size_pinuse_of_free(remainder, remainder_size);
                (*remainder).tag = FREE_MAGIC;
                set_size_pinuse_of_inuse(self.address(), chunk, nb, tag);
                self.free_list_size -= nb;
            } else {
                // exhaust the victim
                let size = self.dv_size;
                self.dv = null_mut();
                self.dv_size = 0;
                set_inuse_and_pinuse(self.address(), chunk, size, tag);
                self.free_list_size -= size;
            }
            return chunk_to_payload(chunk);
        }

        if nb < self.top_size {
            return self.split_top(nb, tag);
        }

        self.expand_and_allocate(nb, tag)
    }

    /// Check an in-use chunk before it is freed or resized. Reports and
    /// returns false if it is not an intact allocation from this heap.
    unsafe fn check_inuse_for_release(&mut self, chunk: *mut Chunk) -> bool {
        if !is_inuse(chunk) || (*chunk).tag == FREE_MAGIC {
            self.report_corruption(CorruptionCode::DoubleFree, chunk.cast());
            return false;
        }
        if footer_heap(chunk) != self.address() {
            self.report_corruption(CorruptionCode::BufferOverrun, chunk.cast());
            return false;
        }
        if !self.ok_address(chunk.cast()) {
            self.corrupt_structures(chunk);
            return false;
        }
        true
    }

    /// Free an allocation. Null is ignored.
    ///
    /// Double frees, overrun footers and foreign pointers are reported
    /// through the provider and otherwise ignored.
    ///
    /// # Safety
    /// `payload` must be null or a pointer returned by this heap.
    pub unsafe fn free(&mut self, payload: *mut u8) {
        if payload.is_null() {
            return;
        }
        if self.magic != HEAP_MAGIC {
            self.report_corruption(CorruptionCode::CorruptStructures, payload);
            return;
        }

        self.total_free_calls += 1;

        let chunk = payload_to_chunk(payload);
        if !self.check_inuse_for_release(chunk) {
            return;
        }

        let tag = (*chunk).tag;
        let size = chunk_size(chunk);

        if self.release_chunk(chunk) {
            self.allocations -= 1;
            self.note_free(tag, size);
        }
    }

    /// Return a checked in-use chunk to the free structures, coalescing with
    /// free neighbors.
    unsafe fn release_chunk(&mut self, chunk: *mut Chunk) -> bool {
        let mut chunk = chunk;
        let mut size = chunk_size(chunk);
        let next = chunk_plus_offset(chunk, size);

        if !pinuse(chunk) {
            let prev_size = (*chunk).prev_foot;

            if is_direct(chunk) {
                return self.free_direct(chunk);
            }

            let prev = chunk_minus_offset(chunk, prev_size);
            if !self.ok_address(prev.cast()) {
                self.corrupt_structures(chunk);
                return false;
            }

            (*chunk).tag = FREE_MAGIC;
            self.free_list_size += size;
            size += prev_size;
            chunk = prev;

            if chunk != self.dv {
                self.unlink_chunk(chunk, prev_size);
            } else if (*next).head & INUSE_BITS == INUSE_BITS {
                self.dv_size = size;
                set_free_with_pinuse(chunk, size, next);
                return true;
            }
        } else {
            (*chunk).tag = FREE_MAGIC;
            self.free_list_size += size;
        }

        if !(Self::ok_next(chunk, next) && pinuse(next)) {
            self.corrupt_structures(next);
            return false;
        }

        if !cinuse(next) {
            if next == self.top {
                self.top_size += size;
                self.top = chunk;
                (*chunk).head = self.top_size | PINUSE;
                if chunk == self.dv {
                    self.dv = null_mut();
                    self.dv_size = 0;
                }
                if self.should_trim() {
                    self.trim(0);
                }
                return true;
            }

            if next == self.dv {
                self.dv_size += size;
                self.dv = chunk;
                set_size_pinuse_of_free(chunk, self.dv_size);
                return true;
            }

            let next_size = chunk_size(next);
            size += next_size;
            self.unlink_chunk(next, next_size);
            set_size_pinuse_of_free(chunk, size);
            if chunk == self.dv {
                self.dv_size = size;
                return true;
            }
        } else {
            set_free_with_pinuse(chunk, size, next);
        }

        if is_small(size) {
            self.insert_small(chunk, size);
        } else {
            self.insert_large(chunk.cast(), size);
            self.release_checks = self.release_checks.saturating_sub(1);
            if self.release_checks == 0 {
                self.release_unused();
            }
        }

        true
    }

    /// Free a chunk carved off while resizing or aligning. Unlike
    /// [`release_chunk`](Self::release_chunk) this never trims, and
    /// `free_list_size` is left to the caller.
    unsafe fn dispose_chunk(&mut self, chunk: *mut Chunk, size: usize) {
        let mut chunk = chunk;
        let mut size = size;
        let next = chunk_plus_offset(chunk, size);
        (*chunk).tag = FREE_MAGIC;

        if !pinuse(chunk) {
            let prev_size = (*chunk).prev_foot;

            if is_direct(chunk) {
                self.free_direct(chunk);
                return;
            }

            let prev = chunk_minus_offset(chunk, prev_size);
            if !self.ok_address(prev.cast()) {
                self.corrupt_structures(prev);
                return;
            }

            size += prev_size;
            chunk = prev;

            if chunk != self.dv {
                self.unlink_chunk(chunk, prev_size);
            } else if (*next).head & INUSE_BITS == INUSE_BITS {
                self.dv_size = size;
                set_free_with_pinuse(chunk, size, next);
                return;
            }
        }

        if !self.ok_address(next.cast()) {
            self.corrupt_structures(next);
            return;
        }

        if !cinuse(next) {
            if next == self.top {
                self.top_size += size;
                self.top = chunk;
                (*chunk).head = self.top_size | PINUSE;
                if chunk == self.dv {
                    self.dv = null_mut();
                    self.dv_size = 0;
                }
                return;
            }

            if next == self.dv {
                self.dv_size += size;
                self.dv = chunk;
                set_size_pinuse_of_free(chunk, self.dv_size);
                return;
            }

            let next_size = chunk_size(next);
            size += next_size;
            self.unlink_chunk(next, next_size);
            set_size_pinuse_of_free(chunk, size);
            if chunk == self.dv {
                self.dv_size = size;
                return;
            }
        } else {
            set_free_with_pinuse(chunk, size, next);
        }

        self.insert_chunk(chunk, size);
    }

    /// Resize `chunk` to `nb` bytes without moving it, if possible.
    unsafe fn try_realloc_chunk(&mut self, chunk: *mut Chunk, nb: usize, tag: u32) -> bool {
        let old_size = chunk_size(chunk);
        let next = chunk_plus_offset(chunk, old_size);

        if is_direct(chunk) {
            return false;
        }

        if old_size >= nb {
            let remainder_size = old_size - nb;
            if remainder_size >= MIN_CHUNK_SIZE {
                let remainder = chunk_plus_offset(chunk, nb);
                set_inuse(self.address(), chunk, nb, tag);
                set_inuse(self.address(), remainder, remainder_size, FREE_MAGIC);
                self.free_list_size += remainder_size;
                self.dispose_chunk(remainder, remainder_size);
            }
            return true;
        }

        if next == self.top {
            if old_size + self.top_size > nb {
                let new_top_size = old_size + self.top_size - nb;
                let new_top = chunk_plus_offset(chunk, nb);
                set_inuse(self.address(), chunk, nb, tag);
                (*new_top).head = new_top_size | PINUSE;
                (*new_top).tag = FREE_MAGIC;
                self.top = new_top;
                self.top_size = new_top_size;
                self.free_list_size -= nb - old_size;
                return true;
            }
        } else if next == self.dv {
            let dv_size = self.dv_size;
            if old_size + dv_size >= nb {
                let remainder_size = old_size + dv_size - nb;
                if remainder_size >= MIN_CHUNK_SIZE {
                    let remainder = chunk_plus_offset(chunk, nb);
                    let after = chunk_plus_offset(remainder, remainder_size);
                    set_inuse(self.address(), chunk, nb, tag);
                    set_size_pinuse_of_free(remainder, remainder_size);
                    (*remainder).tag = FREE_MAGIC;
                    clear_pinuse(after);
                    self.dv_size = remainder_size;
                    self.dv = remainder;
                    self.free_list_size -= nb - old_size;
                } else {
                    set_inuse(self.address(), chunk, old_size + dv_size, tag);
                    self.dv_size = 0;
                    self.dv = null_mut();
                    self.free_list_size -= dv_size;
                }
                return true;
            }
        } else if !cinuse(next) {
            let next_size = chunk_size(next);
            if old_size + next_size >= nb {
                let remainder_size = old_size + next_size - nb;
                self.unlink_chunk(next, next_size);

                if remainder_size < MIN_CHUNK_SIZE {
                    set_inuse(self.address(), chunk, old_size + next_size, tag);
                    self.free_list_size -= next_size;
                } else {
                    let remainder = chunk_plus_offset(chunk, nb);
                    set_inuse(self.address(), chunk, nb, tag);
                    set_inuse(self.address(), remainder, remainder_size, FREE_MAGIC);
                    self.free_list_size -= nb - old_size;
                    self.dispose_chunk(remainder, remainder_size);
                }
                return true;
            }
        }

        false
    }

    /// Resize an allocation, moving it if it cannot grow in place.
    ///
    /// A null `payload` allocates; a zero `size` frees and returns `None`.
    /// On failure the original allocation is untouched. A moved allocation
    /// takes `tag`; one resized in place keeps its tag.
    ///
    /// # Safety
    /// `payload` must be null or a pointer returned by this heap.
    pub unsafe fn reallocate(&mut self, payload: *mut u8, size: usize, tag: Tag) -> Option<NonNull<u8>> {
        if payload.is_null() {
            return self.allocate(size, tag);
        }
        if size == 0 {
            self.free(payload);
            return None;
        }
        if self.magic != HEAP_MAGIC {
            self.report_corruption(CorruptionCode::CorruptStructures, payload);
            return None;
        }
        if size >= MAX_REQUEST {
            self.failed_allocations += 1;
            return None;
        }

        let chunk = payload_to_chunk(payload);
        if !self.check_inuse_for_release(chunk) {
            return None;
        }
        if !is_direct(chunk) {
            let next = next_chunk(chunk);
            if !Self::ok_next(chunk, next) || !pinuse(next) {
                self.corrupt_structures(chunk);
                return None;
            }
        }

        let nb = request_to_size(size);
        let old_size = chunk_size(chunk);
        let chunk_tag = (*chunk).tag;

        if self.try_realloc_chunk(chunk, nb, chunk_tag) {
            let new_size = chunk_size(chunk);
            if new_size != old_size {
                self.note_resize(chunk_tag, old_size, new_size);
            }
            return NonNull::new(payload);
        }

        let moved = self.allocate(size, tag)?;
        let usable = old_size - CHUNK_OVERHEAD;
        core::ptr::copy_nonoverlapping(payload, moved.as_ptr(), usable.min(size));
        self.free(payload);
        Some(moved)
    }

    /// Allocate `size` bytes with the payload aligned to `alignment`.
    ///
    /// Alignments up to twice the word size are served by [`allocate`](Self::allocate).
    /// Other alignments are raised to the minimum chunk size and rounded up
    /// to a power of two.
    ///
    /// # Safety
    /// The heap must be initialized and must not have moved since.
    pub unsafe fn aligned_allocate(&mut self, alignment: usize, size: usize, tag: Tag) -> Result<NonNull<u8>, HeapError> {
        if tag.is_reserved() {
            return Err(HeapError::InvalidParameter);
        }
        if alignment <= CHUNK_ALIGN {
            return self.allocate(size, tag).ok_or(HeapError::InsufficientResources);
        }

        let alignment = alignment.max(MIN_CHUNK_SIZE);
        let alignment = if alignment.is_power_of_two() {
            alignment
        } else {
            alignment.checked_next_power_of_two().ok_or(HeapError::InvalidParameter)?
        };

        if size >= MAX_REQUEST - alignment {
            self.total_allocation_calls += 1;
            self.failed_allocations += 1;
            return Err(HeapError::InsufficientResources);
        }

        let nb = request_to_size(size);
        let request = nb + alignment + MIN_CHUNK_SIZE - CHUNK_OVERHEAD;
        let payload = self.allocate(request, tag).ok_or(HeapError::InsufficientResources)?;

        let mut chunk = payload_to_chunk(payload.as_ptr());
        let original_size = chunk_size(chunk);

        if payload.as_ptr() as usize & (alignment - 1) != 0 {
            // the first aligned spot leaving room for a free lead chunk
            let mut aligned = payload_to_chunk(align_up_by(payload.as_ptr(), alignment - 1));
            if (aligned as usize - chunk as usize) < MIN_CHUNK_SIZE {
                aligned = chunk_plus_offset(aligned, alignment);
            }

            let lead_size = aligned as usize - chunk as usize;
            let new_size = chunk_size(chunk) - lead_size;

            if is_direct(chunk) {
                (*aligned).prev_foot = (*chunk).prev_foot + lead_size;
                (*aligned).head = new_size;
                (*aligned).tag = tag.0;
            } else {
                set_inuse(self.address(), aligned, new_size, tag.0);
                set_inuse(self.address(), chunk, lead_size, FREE_MAGIC);
                self.free_list_size += lead_size;
                self.dispose_chunk(chunk, lead_size);
            }

            chunk = aligned;
        }

        if !is_direct(chunk) {
            let size = chunk_size(chunk);
            if size > nb + MIN_CHUNK_SIZE {
                let remainder_size = size - nb;
                let remainder = chunk_plus_offset(chunk, nb);
                set_inuse(self.address(), chunk, nb, tag.0);
                set_inuse(self.address(), remainder, remainder_size, FREE_MAGIC);
                self.free_list_size += remainder_size;
                self.dispose_chunk(remainder, remainder_size);
            }
        }

        let final_size = chunk_size(chunk);
        if final_size != original_size {
            self.note_resize(tag.0, original_size, final_size);
        }

        debug_assert!(chunk_size(chunk) >= nb);
        debug_assert!(chunk_to_payload(chunk) as usize & (alignment - 1) == 0);

        Ok(NonNull::new_unchecked(chunk_to_payload(chunk)))
    }

    /// Bytes usable at `payload`: the chunk size less its overhead. Zero for
    /// null or a chunk that is not in use.
    ///
    /// # Safety
    /// `payload` must be null or a pointer returned by this heap.
    pub unsafe fn usable_size(&self, payload: *mut u8) -> usize {
        if payload.is_null() {
            return 0;
        }

        let chunk = payload_to_chunk(payload);
        if is_inuse(chunk) {
            chunk_size(chunk) - CHUNK_OVERHEAD
        } else {
            0
        }
    }
}
