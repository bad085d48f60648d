//! Track allocation counters for a [`Heap`](super::Heap).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Counters {
    /// Number of active allocations.
    pub allocation_count: usize,
    /// Total number of allocations.
    pub total_allocation_count: u64,

    /// Sum of active allocations' chunk sizes.
    pub allocated_bytes: usize,
    /// Sum of all allocations' chunk sizes.
    ///
    /// In-place reallocations' unchanged bytes are not recounted.
    pub total_allocated_bytes: u64,

    /// Number of active provider allocations, segments and direct chunks alike.
    pub segment_count: usize,
    /// Total number of provider allocations.
    pub total_segment_count: u64,

    /// Sum of bytes actively held from the provider.
    pub claimed_bytes: usize,
    /// Sum of bytes ever held from the provider. Reacquired bytes included.
    pub total_claimed_bytes: u64,
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            allocation_count: 0,
            total_allocation_count: 0,
            allocated_bytes: 0,
            total_allocated_bytes: 0,
            segment_count: 0,
            total_segment_count: 0,
            claimed_bytes: 0,
            total_claimed_bytes: 0,
        }
    }

    /// Returns the total number of allocated bytes freed.
    pub const fn total_freed_bytes(&self) -> u64 {
        self.total_allocated_bytes - self.allocated_bytes as u64
    }

    /// Returns the total number of claimed bytes given back.
    pub const fn total_released_bytes(&self) -> u64 {
        self.total_claimed_bytes - self.claimed_bytes as u64
    }

    pub(crate) fn account_alloc(&mut self, chunk_size: usize) {
        self.allocation_count += 1;
        self.allocated_bytes += chunk_size;

        self.total_allocation_count += 1;
        self.total_allocated_bytes += chunk_size as u64;
    }

    pub(crate) fn account_dealloc(&mut self, chunk_size: usize) {
        self.allocation_count -= 1;
        self.allocated_bytes -= chunk_size;
    }

    pub(crate) fn account_resize_in_place(&mut self, old_size: usize, new_size: usize) {
        if new_size >= old_size {
            self.allocated_bytes += new_size - old_size;
            self.total_allocated_bytes += (new_size - old_size) as u64;
        } else {
            self.allocated_bytes -= old_size - new_size;
            self.total_allocated_bytes -= (old_size - new_size) as u64;
        }
    }

    pub(crate) fn account_claim(&mut self, claimed_size: usize) {
        self.segment_count += 1;
        self.claimed_bytes += claimed_size;

        self.total_segment_count += 1;
        self.total_claimed_bytes += claimed_size as u64;
    }

    /// A partial release only shrinks the claimed byte count.
    pub(crate) fn account_release(&mut self, released_size: usize, whole: bool) {
        if whole {
            self.segment_count -= 1;
        }

        self.claimed_bytes -= released_size;
    }
}

impl<P: crate::Provider> super::Heap<P> {
    pub fn get_counters(&self) -> &Counters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::*;

    #[test]
    fn alloc_free_counts() {
        let mut heap = new_heap(HeapConfig::new());

        unsafe {
            let a = heap.allocate(100, TAG_A).unwrap();
            assert_eq!(heap.get_counters().allocation_count, 1);
            assert_eq!(heap.get_counters().allocated_bytes, 128);
            assert_eq!(heap.get_counters().segment_count, 1);
            assert_eq!(heap.get_counters().claimed_bytes, heap.statistics().total_heap_size);

            let b = heap.allocate(1000, TAG_B).unwrap();
            assert_eq!(heap.get_counters().total_allocation_count, 2);

            // shrinking in place gives back the tail
            let b = heap.reallocate(b.as_ptr(), 500, TAG_B).unwrap();
            assert_eq!(heap.get_counters().allocated_bytes, 128 + 528);

            heap.free(a.as_ptr());
            heap.free(b.as_ptr());
        }

        let counters = *heap.get_counters();
        assert_eq!(counters.allocation_count, 0);
        assert_eq!(counters.allocated_bytes, 0);
        assert_eq!(counters.total_freed_bytes(), counters.total_allocated_bytes);
    }

    #[test]
    fn direct_chunks_count_as_claims() {
        let mut heap = new_heap(HeapConfig::new());

        unsafe {
            let a = heap.allocate(64, TAG_A).unwrap();
            let big = heap.allocate(0x80000, TAG_A).unwrap();
            assert_eq!(heap.get_counters().segment_count, 2);

            heap.free(big.as_ptr());
            assert_eq!(heap.get_counters().segment_count, 1);
            assert!(heap.get_counters().total_released_bytes() >= 0x80000);

            heap.free(a.as_ptr());
        }
    }
}
