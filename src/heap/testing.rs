//! A recording provider and helpers shared by the heap's unit tests.

use std::alloc::{alloc, dealloc, Layout};
use std::boxed::Box;
use std::vec::Vec;

use core::ptr::NonNull;

use crate::provider::Provider;

use super::{CorruptionCode, Heap, HeapConfig, Tag};

pub const TAG_A: Tag = Tag::from_bytes(*b"tagA");
pub const TAG_B: Tag = Tag::from_bytes(*b"tagB");

const ARENA_ALIGN: usize = 4096;
const DEFAULT_CAPACITY: usize = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Regions ascend with a page-sized gap between them.
    Scattered,
    /// Regions ascend with no gap.
    Contiguous,
    /// Regions descend with no gap.
    Descending,
    Refusing,
}

/// Hands out regions from one big arena and records every call.
///
/// Memory is never reused, so regions stay distinct for the whole test.
#[derive(Debug)]
pub struct TestProvider {
    arena: *mut u8,
    capacity: usize,
    used: usize,
    placement: Placement,
    max_request: usize,
    regions: Vec<(usize, usize)>,

    pub allocation_count: usize,
    pub refusals: usize,
    pub allocated_bytes: usize,
    pub freed_bytes: usize,
    pub partial_frees: usize,
    pub reports: Vec<(CorruptionCode, *mut u8)>,
}

// the arena is owned and only reached through the provider
unsafe impl Send for TestProvider {}

impl TestProvider {
    fn with_placement(capacity: usize, placement: Placement) -> Self {
        let arena = if placement == Placement::Refusing {
            core::ptr::null_mut()
        } else {
            let arena = unsafe { alloc(Layout::from_size_align(capacity, ARENA_ALIGN).unwrap()) };
            assert!(!arena.is_null());
            arena
        };

        Self {
            arena,
            capacity,
            used: 0,
            placement,
            max_request: usize::MAX,
            regions: Vec::new(),
            allocation_count: 0,
            refusals: 0,
            allocated_bytes: 0,
            freed_bytes: 0,
            partial_frees: 0,
            reports: Vec::new(),
        }
    }

    pub fn new() -> Self {
        Self::with_placement(DEFAULT_CAPACITY, Placement::Scattered)
    }

    pub fn contiguous(capacity: usize) -> Self {
        Self::with_placement(capacity, Placement::Contiguous)
    }

    pub fn descending(capacity: usize) -> Self {
        Self::with_placement(capacity, Placement::Descending)
    }

    pub fn refusing() -> Self {
        Self::with_placement(0, Placement::Refusing)
    }

    /// Refuse any single request above `max_request` bytes.
    pub fn with_max_request(mut self, max_request: usize) -> Self {
        self.max_request = max_request;
        self
    }

    /// Bytes handed out and not yet taken back.
    pub fn outstanding(&self) -> usize {
        self.allocated_bytes - self.freed_bytes
    }
}

impl Drop for TestProvider {
    fn drop(&mut self) {
        if !self.arena.is_null() {
            unsafe { dealloc(self.arena, Layout::from_size_align(self.capacity, ARENA_ALIGN).unwrap()) }
        }
    }
}

unsafe impl Provider for TestProvider {
    fn allocate(&mut self, size: usize, _: Tag) -> Option<NonNull<u8>> {
        let gap = if self.placement == Placement::Scattered { ARENA_ALIGN } else { 0 };

        if self.placement == Placement::Refusing
            || size > self.max_request
            || self.used + size + gap > self.capacity
        {
            self.refusals += 1;
            return None;
        }

        let base = match self.placement {
            Placement::Descending => self.arena.wrapping_add(self.capacity - self.used - size),
            _ => self.arena.wrapping_add(self.used),
        };
        self.used += size + gap;

        self.allocation_count += 1;
        self.allocated_bytes += size;
        self.regions.push((base as usize, size));
        NonNull::new(base)
    }

    unsafe fn free(&mut self, base: NonNull<u8>, size: usize) -> bool {
        let key = (base.as_ptr() as usize, size);
        match self.regions.iter().position(|&region| region == key) {
            Some(index) => {
                self.regions.swap_remove(index);
            }
            None => self.partial_frees += 1,
        }

        self.freed_bytes += size;
        true
    }

    fn on_corruption(&mut self, _: *const u8, code: CorruptionCode, pointer: *mut u8) {
        self.reports.push((code, pointer));
    }
}

pub fn new_heap_with(provider: TestProvider, config: HeapConfig) -> Box<Heap<TestProvider>> {
    let mut heap = Box::new(Heap::new(provider));
    unsafe { heap.init(config) };
    heap
}

pub fn new_heap(config: HeapConfig) -> Box<Heap<TestProvider>> {
    new_heap_with(TestProvider::new(), config)
}

/// Page-aligned memory that outlives the test.
pub fn leak_arena(size: usize) -> *mut u8 {
    let arena = unsafe { alloc(Layout::from_size_align(size, ARENA_ALIGN).unwrap()) };
    assert!(!arena.is_null());
    arena
}
