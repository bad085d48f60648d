//! Segments, the top chunk, growth and shrinking.
//!
//! The head segment record is embedded in the heap. When another segment is
//! linked, the head record is copied into a small in-use chunk at the end of
//! the old top, followed by fenceposts, and the head then describes the new
//! segment. The top chunk therefore always lives in the head segment.

use core::ptr::{null_mut, NonNull};

use crate::{ptr_utils::*, provider::Provider};

use super::{
    chunk::*,
    Heap, HeapFlags, MAX_RELEASE_CHECK_RATE,
};

/// The segment was donated by the caller and is never given to the provider.
pub const SEGMENT_EXTERNAL: usize = 0x1;

/// Growth requests carry room for the top footer and one extra alignment unit.
const EXPANSION_PADDING: usize = TOP_FOOTER_SIZE + CHUNK_ALIGN;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub base: *mut u8,
    pub size: usize,
    pub next: *mut Segment,
    pub flags: usize,
}

impl Segment {
    pub const fn empty() -> Self {
        Self { base: null_mut(), size: 0, next: null_mut(), flags: 0 }
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        self.flags & SEGMENT_EXTERNAL != 0
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.base.wrapping_add(self.size)
    }

    #[inline]
    pub fn holds(&self, addr: *const u8) -> bool {
        addr >= self.base as *const u8 && addr < self.end() as *const u8
    }
}

impl<P: Provider> Heap<P> {
    /// Install `chunk` as the top chunk, aligning it first.
    ///
    /// `free_list_size` is left for the caller to adjust.
    pub(super) unsafe fn init_top(&mut self, chunk: *mut Chunk, size: usize) {
        let offset = align_offset(chunk_to_payload(chunk));
        let chunk = chunk_plus_offset(chunk, offset);
        let size = size - offset;

        self.top = chunk;
        self.top_size = size;
        (*chunk).head = size | PINUSE;
        (*chunk).tag = super::FREE_MAGIC;

        // a fake chunk after the top that nothing ever coalesces with
        (*chunk_plus_offset(chunk, size)).head = TOP_FOOTER_SIZE;
    }

    /// The segment containing `addr`, or null.
    pub(super) fn segment_holding(&mut self, addr: *const u8) -> *mut Segment {
        let mut segment: *mut Segment = &mut self.segment;
        unsafe {
            while !segment.is_null() {
                if (*segment).holds(addr) {
                    return segment;
                }
                segment = (*segment).next;
            }
        }
        null_mut()
    }

    /// Whether any segment record is stored inside `segment`.
    pub(super) fn has_segment_link(&mut self, segment: *mut Segment) -> bool {
        let mut search: *mut Segment = &mut self.segment;
        unsafe {
            while !search.is_null() {
                if (*segment).holds(search as *const u8) {
                    return true;
                }
                search = (*search).next;
            }
        }
        false
    }

    #[inline]
    fn footprint_allows(&self, size: usize) -> bool {
        match self.total_heap_size.checked_add(size) {
            Some(footprint) => self.footprint_limit == 0 || footprint <= self.footprint_limit,
            None => false,
        }
    }

    fn account_acquire(&mut self, size: usize) {
        self.total_heap_size += size;
        if self.total_heap_size > self.max_heap_size {
            self.max_heap_size = self.total_heap_size;
        }

        #[cfg(feature = "counters")]
        self.counters.account_claim(size);
    }

    /// `whole` is false when only the tail of a segment is given back.
    fn account_release(&mut self, size: usize, whole: bool) {
        self.total_heap_size -= size;

        #[cfg(feature = "counters")]
        self.counters.account_release(size, whole);
        #[cfg(not(feature = "counters"))]
        let _ = whole;
    }

    /// Give a large request its own provider allocation.
    pub(super) unsafe fn allocate_direct(&mut self, nb: usize, tag: u32) -> *mut u8 {
        let Some(size) = nb
            .checked_add(DIRECT_CHUNK_OVERHEAD + DIRECT_FOOTER_PAD + CHUNK_ALIGN_MASK)
            .and_then(|s| round_up_checked(s, self.granularity))
        else {
            return null_mut();
        };

        let size = size.max(self.min_expansion);
        if size <= nb || !self.footprint_allows(size) {
            return null_mut();
        }

        let Some(base) = self.provider.allocate(size, self.heap_tag) else {
            log::trace!("[heap] provider refused direct allocation of {} bytes", size);
            return null_mut();
        };

        let base = base.as_ptr();
        debug_assert!(is_chunk_aligned(base));

        let offset = align_offset(base.wrapping_add(PAYLOAD_OFFSET));
        let psize = size - offset - DIRECT_FOOTER_PAD;
        let chunk = base.wrapping_add(offset).cast::<Chunk>();

        (*chunk).prev_foot = offset;
        (*chunk).head = psize;
        (*chunk).tag = tag;
        (*chunk_plus_offset(chunk, psize)).prev_foot = footer_value(self.address(), tag);
        (*chunk_plus_offset(chunk, psize)).head = FENCEPOST_HEADER;
        (*chunk_plus_offset(chunk, psize + WORD_SIZE)).head = 0;

        if self.least_addr.is_null() || base < self.least_addr {
            self.least_addr = base;
        }

        self.account_acquire(size);
        self.direct_allocation_size += size;

        log::debug!("[heap] {:p}: direct chunk {:p} of {} bytes", self, chunk, size);

        chunk_to_payload(chunk)
    }

    /// Hand a direct chunk back to the provider. Returns false if the provider kept it.
    pub(super) unsafe fn free_direct(&mut self, chunk: *mut Chunk) -> bool {
        let offset = (*chunk).prev_foot;
        let size = chunk_size(chunk) + offset + DIRECT_FOOTER_PAD;
        let base = chunk.cast::<u8>().wrapping_sub(offset);

        let Some(base) = NonNull::new(base) else { return false };

        if self.provider.free(base, size) {
            self.account_release(size, true);
            self.direct_allocation_size -= size;
            true
        } else {
            log::trace!("[heap] provider refused to free direct chunk {:p}", chunk);
            false
        }
    }

    /// Obtain more memory from the provider and carve `nb` bytes from it.
    pub(super) unsafe fn expand_and_allocate(&mut self, nb: usize, tag: u32) -> *mut u8 {
        if self.direct_threshold != 0 && nb >= self.direct_threshold && self.top_size != 0 {
            let payload = self.allocate_direct(nb, tag);
            if !payload.is_null() {
                return payload;
            }
        }

        let Some(aligned) = nb.checked_add(EXPANSION_PADDING) else {
            return null_mut();
        };
        let aligned = aligned.max(self.min_expansion);
        let Some(minimum) = round_up_checked(aligned, self.granularity) else {
            return null_mut();
        };

        let mut size = aligned;
        if let Some(doubled) = self.previous_expansion.checked_mul(2) {
            if size < doubled && (self.footprint_limit == 0 || doubled < self.footprint_limit) {
                size = doubled;
            }
        }
        let mut size = round_up_checked(size, self.granularity).unwrap_or(minimum);

        if !self.footprint_allows(size) {
            if !self.footprint_allows(minimum) {
                log::trace!("[heap] {:p}: growth by {} would pass the footprint limit", self, minimum);
                return null_mut();
            }
            size = minimum;
        }

        let base = loop {
            if let Some(base) = self.provider.allocate(size, self.heap_tag) {
                break base.as_ptr();
            }

            if size <= minimum {
                log::trace!("[heap] {:p}: provider refused {} bytes", self, size);
                return null_mut();
            }

            log::trace!("[heap] {:p}: provider refused {} bytes, retrying smaller", self, size);
            size = round_up_checked(size / 2, self.granularity).unwrap_or(minimum).max(minimum);
        };

        debug_assert!(is_chunk_aligned(base));

        self.account_acquire(size);
        self.previous_expansion = size;
        self.trim_check = size.saturating_add(size / 4);

        log::debug!("[heap] {:p}: acquired segment {:p} of {} bytes", self, base, size);

        if !self.has_top() {
            if self.least_addr.is_null() || base < self.least_addr {
                self.least_addr = base;
            }

            self.segment = Segment { base, size, next: null_mut(), flags: 0 };
            self.release_checks = MAX_RELEASE_CHECK_RATE;
            self.init_top(base.cast(), size - TOP_FOOTER_SIZE);
            self.free_list_size += self.top_size;
        } else if self.flags.contains(HeapFlags::NO_PARTIAL_FREES) {
            if base < self.least_addr {
                self.least_addr = base;
            }

            self.add_segment(base, size, 0);
        } else {
            let mut segment: *mut Segment = &mut self.segment;
            while !segment.is_null() && base != (*segment).end() {
                segment = (*segment).next;
            }

            if !segment.is_null()
                && !(*segment).is_external()
                && (*segment).holds(self.top.cast())
            {
                (*segment).size += size;
                let old_top_size = self.top_size;
                self.init_top(self.top, self.top_size + size);
                self.free_list_size += self.top_size - old_top_size;
            } else {
                if base < self.least_addr {
                    self.least_addr = base;
                }

                let end = base.wrapping_add(size);
                let mut segment: *mut Segment = &mut self.segment;
                while !segment.is_null() && (*segment).base != end {
                    segment = (*segment).next;
                }

                if !segment.is_null() && !(*segment).is_external() {
                    let old_base = (*segment).base;
                    (*segment).base = base;
                    (*segment).size += size;
                    return self.prepend_alloc(base, old_base, nb, tag);
                }

                self.add_segment(base, size, 0);
            }
        }

        if nb < self.top_size {
            return self.split_top(nb, tag);
        }

        null_mut()
    }

    /// Carve `nb` bytes off the bottom of the top chunk.
    pub(super) unsafe fn split_top(&mut self, nb: usize, tag: u32) -> *mut u8 {
        debug_assert!(nb < self.top_size);

        let chunk = self.top;
        let remainder_size = self.top_size - nb;
        let remainder = chunk_plus_offset(chunk, nb);

        self.top_size = remainder_size;
        self.top = remainder;
        (*remainder).head = remainder_size | PINUSE;
        (*remainder).tag = super::FREE_MAGIC;
        set_size_pinuse_of_inuse(self.address(), chunk, nb, tag);
        self.free_list_size -= nb;

        chunk_to_payload(chunk)
    }

    /// Allocate from the start of memory just joined below an existing
    /// segment, merging what remains with that segment's first chunk.
    unsafe fn prepend_alloc(&mut self, new_base: *mut u8, old_base: *mut u8, nb: usize, tag: u32) -> *mut u8 {
        let chunk = align_as_chunk(new_base);
        let mut old_first = align_as_chunk(old_base);
        let psize = old_first as usize - chunk as usize;

        debug_assert!(old_first > chunk);
        debug_assert!(pinuse(old_first));
        debug_assert!(psize >= nb + MIN_CHUNK_SIZE);

        let remainder = chunk_plus_offset(chunk, nb);
        let mut remainder_size = psize - nb;
        set_size_pinuse_of_inuse(self.address(), chunk, nb, tag);
        (*remainder).tag = super::FREE_MAGIC;
        self.free_list_size += remainder_size;

        if old_first == self.top {
            self.top_size += remainder_size;
            self.top = remainder;
            (*remainder).head = self.top_size | PINUSE;
        } else if old_first == self.dv {
            self.dv_size += remainder_size;
            self.dv = remainder;
            set_size_pinuse_of_free(remainder, self.dv_size);
        } else {
            if !is_inuse(old_first) {
                let next_size = chunk_size(old_first);
                self.unlink_chunk(old_first, next_size);
                old_first = chunk_plus_offset(old_first, next_size);
                remainder_size += next_size;
            }

            set_free_with_pinuse(remainder, remainder_size, old_first);
            self.insert_chunk(remainder, remainder_size);
        }

        chunk_to_payload(chunk)
    }

    /// Link a new segment and make its memory the new top, turning the old
    /// top into a free chunk plus the old head record and fenceposts.
    pub(super) unsafe fn add_segment(&mut self, base: *mut u8, size: usize, flags: usize) {
        let old_top = self.top.cast::<u8>();
        let old_top_size = self.top_size;
        let old_segment = self.segment_holding(old_top);
        debug_assert!(!old_segment.is_null());
        let old_end = (*old_segment).end();

        let record_size = pad_request(core::mem::size_of::<Segment>());
        let raw = old_end.wrapping_sub(record_size + 4 * WORD_SIZE + CHUNK_ALIGN_MASK);
        let aligned = raw.wrapping_add(align_offset(raw.wrapping_add(PAYLOAD_OFFSET)));
        let record_base =
            if aligned < old_top.wrapping_add(MIN_CHUNK_SIZE) { old_top } else { aligned };

        let record_chunk = record_base.cast::<Chunk>();
        let record = chunk_to_payload(record_chunk).cast::<Segment>();
        let mut fence = chunk_plus_offset(record_chunk, record_size);

        self.init_top(base.cast(), size - TOP_FOOTER_SIZE);

        set_size_pinuse_of_inuse(self.address(), record_chunk, record_size, self.heap_tag.0);
        record.write(self.segment);
        self.segment = Segment { base, size, next: record, flags };

        let mut fences = 0usize;
        loop {
            let next = chunk_plus_offset(fence, WORD_SIZE);
            (*fence).head = FENCEPOST_HEADER;
            fences += 1;

            if core::ptr::addr_of!((*next).head).cast::<u8>() < old_end as *const u8 {
                fence = next;
            } else {
                break;
            }
        }
        debug_assert!(fences >= 2);

        let mut remainder = 0;
        if record_base != old_top {
            let chunk = old_top.cast::<Chunk>();
            remainder = record_base as usize - old_top as usize;
            let next = chunk_plus_offset(chunk, remainder);
            set_free_with_pinuse(chunk, remainder, next);
            (*chunk).tag = super::FREE_MAGIC;
            self.insert_chunk(chunk, remainder);
        }

        self.free_list_size = self.free_list_size + self.top_size + remainder - old_top_size;
    }

    /// Donate caller-owned memory to the heap as an external segment.
    ///
    /// External segments are never handed to the provider, trimmed or released.
    ///
    /// # Safety
    /// `base..base + size` must be valid for reads and writes, exclusively
    /// owned by the heap until it is destroyed, and chunk-aligned.
    pub unsafe fn add_external_segment(&mut self, base: *mut u8, size: usize) -> Result<(), super::HeapError> {
        if !self.is_initialized()
            || !is_chunk_aligned(base)
            || size < TOP_FOOTER_SIZE + MIN_CHUNK_SIZE * 2
        {
            return Err(super::HeapError::InvalidParameter);
        }

        if self.least_addr.is_null() || base < self.least_addr {
            self.least_addr = base;
        }

        self.account_acquire(size);

        if !self.has_top() {
            self.segment = Segment { base, size, next: null_mut(), flags: SEGMENT_EXTERNAL };
            self.release_checks = MAX_RELEASE_CHECK_RATE;
            self.init_top(base.cast(), size - TOP_FOOTER_SIZE);
            self.free_list_size += self.top_size;
        } else {
            self.add_segment(base, size, SEGMENT_EXTERNAL);
        }

        log::debug!("[heap] {:p}: external segment {:p} of {} bytes", self, base, size);
        Ok(())
    }

    /// Give fully idle segments other than the head back to the provider.
    ///
    /// Returns the number of bytes released.
    pub fn release_unused(&mut self) -> usize {
        let mut released = 0;
        let mut segment_count = 0;

        unsafe {
            let mut pred: *mut Segment = &mut self.segment;
            let mut segment = (*pred).next;

            while !segment.is_null() {
                let base = (*segment).base;
                let size = (*segment).size;
                let next = (*segment).next;
                segment_count += 1;

                let mut unlinked = false;
                if !(*segment).is_external() {
                    let chunk = align_as_chunk(base);
                    let chunk_bytes = chunk_size(chunk);

                    if !is_inuse(chunk)
                        && chunk.cast::<u8>().wrapping_add(chunk_bytes)
                            >= base.wrapping_add(size - TOP_FOOTER_SIZE)
                    {
                        if chunk == self.dv {
                            self.dv = null_mut();
                            self.dv_size = 0;
                        } else {
                            self.unlink_chunk(chunk, chunk_bytes);
                        }

                        self.free_list_size -= chunk_bytes;

                        match NonNull::new(base) {
                            Some(nn) if self.provider.free(nn, size) => {
                                self.account_release(size, true);
                                released += size;
                                (*pred).next = next;
                                unlinked = true;
                                log::debug!("[heap] released segment {:p} of {} bytes", base, size);
                            }
                            _ => {
                                log::trace!("[heap] provider kept idle segment {:p}", base);
                                self.free_list_size += chunk_bytes;
                                self.insert_chunk(chunk, chunk_bytes);
                            }
                        }
                    }
                }

                if !unlinked {
                    pred = segment;
                }
                segment = next;
            }
        }

        self.release_checks = segment_count.max(MAX_RELEASE_CHECK_RATE);
        released
    }

    #[inline]
    pub(super) fn should_trim(&self) -> bool {
        self.top_size >= self.trim_check && !self.flags.contains(HeapFlags::NO_PARTIAL_FREES)
    }

    /// Release memory at the top of the heap, keeping at least `pad` bytes
    /// available there, and release idle segments.
    ///
    /// Returns whether anything was given back.
    pub fn trim(&mut self, pad: usize) -> bool {
        let mut released = 0;

        if pad >= MAX_REQUEST || !self.has_top() {
            return false;
        }

        let pad = pad + TOP_FOOTER_SIZE;

        unsafe {
            if self.top_size > pad && !self.flags.contains(HeapFlags::NO_PARTIAL_FREES) {
                let unit = self.granularity;
                let extra = ((self.top_size - pad + (unit - 1)) / unit - 1) * unit;
                let segment = self.segment_holding(self.top.cast());

                if extra != 0
                    && !segment.is_null()
                    && !(*segment).is_external()
                    && (*segment).size >= extra
                    && !self.has_segment_link(segment)
                {
                    let new_size = (*segment).size - extra;
                    let tail = (*segment).base.wrapping_add(new_size);

                    if let Some(tail) = NonNull::new(tail) {
                        if self.provider.free(tail, extra) {
                            released = extra;
                        } else {
                            log::trace!("[heap] provider refused to take back {} bytes", extra);
                        }
                    }

                    if released != 0 {
                        (*segment).size -= released;
                        self.account_release(released, false);
                        self.free_list_size -= released;
                        self.init_top(self.top, self.top_size - released);
                        log::debug!("[heap] {:p}: trimmed {} bytes", self, released);
                    }
                }
            }
        }

        released += self.release_unused();

        if released == 0 {
            if self.top_size > self.trim_check {
                self.trim_check = usize::MAX;
            }
        } else {
            self.trim_check = self.previous_expansion.saturating_add(self.previous_expansion / 4);
            self.previous_expansion /= 2;
        }

        released != 0
    }
}

#[cfg(test)]
mod tests {
    use super::super::chunk::TOP_FOOTER_SIZE;
    use super::super::testing::*;
    use super::super::*;

    #[test]
    fn first_segment_sets_up_top() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe {
            let a = heap.allocate(100, TAG_A).unwrap();
            assert_eq!(heap.provider.allocation_count, 1);
            assert_eq!(heap.statistics().total_heap_size, 0x10000);

            let segment = heap.segment;
            assert!(segment.holds(a.as_ptr()));
            assert!(segment.holds(heap.top.cast()));
            assert_eq!(
                heap.top as usize + heap.top_size,
                segment.end() as usize - TOP_FOOTER_SIZE
            );
        }
        heap.validate(None).unwrap();
    }

    #[test]
    fn growth_appends_contiguous_memory() {
        let mut heap = new_heap_with(TestProvider::contiguous(1 << 20), HeapConfig::new());
        unsafe {
            let first = heap.allocate(0x8000, TAG_A).unwrap();
            let before = heap.statistics().total_heap_size;
            // larger than what remains, lands in the appended region
            let second = heap.allocate(0xC000, TAG_B).unwrap();
            assert!(heap.statistics().total_heap_size > before);
            assert!(heap.segment.next.is_null());
            assert!(heap.segment.holds(second.as_ptr()));
            assert!(heap.segment.holds(first.as_ptr()));
        }
        heap.validate(None).unwrap();
    }

    #[test]
    fn growth_links_disjoint_segments() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe {
            let mut ptrs = Vec::new();
            for _ in 0..8 {
                ptrs.push(heap.allocate(0x6000, TAG_A).unwrap());
            }
            assert!(!heap.segment.next.is_null());
            heap.validate(None).unwrap();

            for p in ptrs {
                heap.free(p.as_ptr());
            }
        }
        heap.validate(None).unwrap();
    }

    #[test]
    fn growth_respects_footprint_limit() {
        let mut heap = new_heap(HeapConfig::new().with_footprint_limit(0x20000));
        unsafe {
            assert!(heap.allocate(0x8000, TAG_A).is_some());
            assert!(heap.allocate(0x30000, TAG_A).is_none());
            assert!(heap.statistics().total_heap_size <= 0x20000);
            assert_eq!(heap.statistics().failed_allocations, 1);
        }
    }

    #[test]
    fn growth_halves_on_refusal() {
        let provider = TestProvider::new().with_max_request(0x18000);
        let mut heap = new_heap_with(provider, HeapConfig::new());
        unsafe {
            let _ = heap.allocate(0x100, TAG_A).unwrap();
            assert_eq!(heap.provider.refusals, 0);

            // too big for the 64 KiB top: the doubled 128 KiB request is
            // refused, and the retry falls back to the smallest fitting size
            let p = heap.allocate(0x14000, TAG_A).unwrap();
            assert_eq!(heap.provider.refusals, 1);
            assert_eq!(heap.provider.allocation_count, 2);
            p.as_ptr().write_bytes(0x5A, 0x14000);
        }
        heap.validate(None).unwrap();
    }

    #[test]
    fn direct_allocation_round_trip() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe {
            let small = heap.allocate(64, TAG_A).unwrap();
            let big = heap.allocate(0x80000, TAG_B).unwrap();
            assert!(crate::ptr_utils::is_chunk_aligned(big.as_ptr()));
            assert!(heap.statistics().direct_allocation_size >= 0x80000);
            big.as_ptr().write_bytes(0xAB, 0x80000);

            let total = heap.statistics().total_heap_size;
            heap.free(big.as_ptr());
            assert_eq!(heap.statistics().direct_allocation_size, 0);
            assert!(heap.statistics().total_heap_size < total);
            heap.free(small.as_ptr());
        }
        assert!(heap.provider.reports.is_empty());
        heap.validate(None).unwrap();
    }

    #[test]
    fn trim_is_idempotent() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe {
            let mut ptrs = Vec::new();
            for _ in 0..64 {
                ptrs.push(heap.allocate(0x1000, TAG_A).unwrap());
            }
            for p in ptrs.into_iter().rev() {
                heap.free(p.as_ptr());
            }
        }

        heap.trim(0);
        let after_first = heap.statistics().total_heap_size;
        let freed_first = heap.provider.freed_bytes;

        assert!(!heap.trim(0));
        assert_eq!(heap.statistics().total_heap_size, after_first);
        assert_eq!(heap.provider.freed_bytes, freed_first);
        heap.validate(None).unwrap();
    }

    #[test]
    fn growth_prepends_below_existing_segment() {
        let mut heap = new_heap_with(TestProvider::descending(1 << 20), HeapConfig::new());
        unsafe {
            let first = heap.allocate(0x100, TAG_A).unwrap();
            let base = heap.segment.base;
            // too big for the remaining top, so the provider hands out the range below
            let second = heap.allocate(0xFF00, TAG_B).unwrap();
            assert!(heap.segment.next.is_null());
            assert!(heap.segment.base < base);
            assert!(second.as_ptr() < first.as_ptr());
            heap.validate(None).unwrap();

            heap.free(first.as_ptr());
            heap.free(second.as_ptr());
        }
        heap.validate(None).unwrap();
    }

    #[test]
    fn trim_releases_top_tail() {
        let config = HeapConfig::new().with_direct_threshold(0);
        let mut heap = new_heap_with(TestProvider::contiguous(1 << 22), config);
        unsafe {
            let b = heap.allocate(64, TAG_B).unwrap();
            let a = heap.allocate(0x60000, TAG_A).unwrap();
            // a borders the top, so freeing it grows the top
            heap.free(a.as_ptr());
            let total = heap.statistics().total_heap_size;

            assert!(heap.trim(0));
            assert!(heap.statistics().total_heap_size < total);
            heap.validate(None).unwrap();

            // the heap still works after shrinking
            let c = heap.allocate(0x100, TAG_A).unwrap();
            heap.free(c.as_ptr());
            heap.free(b.as_ptr());
        }
        heap.validate(None).unwrap();
    }

    #[test]
    fn release_unused_returns_idle_segments() {
        let mut heap = new_heap(HeapConfig::new());
        unsafe {
            let a = heap.allocate(0xE000, TAG_A).unwrap();
            let b = heap.allocate(0xE000, TAG_B).unwrap();
            assert!(!heap.segment.next.is_null());

            // a's segment is now wholly free
            heap.free(a.as_ptr());
            let released = heap.release_unused();
            assert!(released >= 0x10000);
            assert!(heap.segment.next.is_null());
            heap.validate(None).unwrap();

            heap.free(b.as_ptr());
        }
        heap.validate(None).unwrap();
    }

    #[test]
    fn no_partial_frees_keeps_segments_whole() {
        let config = HeapConfig::new().with_flags(HeapFlags::NO_PARTIAL_FREES);
        let mut heap = new_heap_with(TestProvider::contiguous(1 << 20), config);
        unsafe {
            let a = heap.allocate(0x8000, TAG_A).unwrap();
            let b = heap.allocate(0xC000, TAG_B).unwrap();
            // contiguous memory is still linked as its own segment
            assert!(!heap.segment.next.is_null());
            heap.free(a.as_ptr());
            heap.free(b.as_ptr());
        }
        heap.trim(0);
        assert_eq!(heap.provider.partial_frees, 0);
        heap.validate(None).unwrap();
    }

    #[test]
    fn external_segment_is_used_and_kept() {
        let mut heap = new_heap_with(TestProvider::refusing(), HeapConfig::new());
        let arena = leak_arena(0x8000);
        unsafe {
            heap.add_external_segment(arena, 0x8000).unwrap();
            let a = heap.allocate(0x1000, TAG_A).unwrap();
            assert!(a.as_ptr() >= arena && a.as_ptr() < arena.add(0x8000));
            heap.free(a.as_ptr());
            assert_eq!(heap.release_unused(), 0);
            heap.destroy();
        }
        assert_eq!(heap.provider.freed_bytes, 0);
    }
}
