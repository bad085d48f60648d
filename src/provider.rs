//! Where a [`Heap`](crate::Heap) gets its memory from, and who hears about corruption.

use core::{fmt::Debug, ptr::NonNull};

use allocator_api2::alloc::{Allocator, Layout};

use crate::heap::{CorruptionCode, Tag};

/// A source of large memory regions for a heap.
///
/// # Safety
/// Regions returned by [`allocate`](Provider::allocate) must be valid for
/// reads and writes of `size` bytes, aligned to at least twice the word size,
/// and not used by anything else until handed back through [`free`](Provider::free).
pub unsafe trait Provider {
    /// Whether [`free`](Provider::free) accepts sub-ranges of what
    /// [`allocate`](Provider::allocate) returned, and adjacent regions as one.
    ///
    /// When false, the heap never coalesces regions and never trims a
    /// region's tail, so every `free` matches one `allocate` exactly.
    const SUPPORTS_PARTIAL_FREES: bool = true;

    /// Obtain at least `size` bytes. `tag` is the heap's own tag.
    fn allocate(&mut self, size: usize, tag: Tag) -> Option<NonNull<u8>>;

    /// Take back `size` bytes at `base`. Returning false leaves the memory with the heap.
    ///
    /// # Safety
    /// The range was obtained from this provider and is no longer used by the heap.
    unsafe fn free(&mut self, base: NonNull<u8>, size: usize) -> bool;

    /// Called when the heap detects damage. `heap` is the heap's address and
    /// `pointer` the chunk or structure involved, if any.
    ///
    /// The heap has already logged the event; the default does nothing more.
    fn on_corruption(&mut self, heap: *const u8, code: CorruptionCode, pointer: *mut u8) {
        let _ = (heap, code, pointer);
    }
}

/// Never provides memory. Use with [`Heap::add_external_segment`](crate::Heap::add_external_segment).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProvider;

unsafe impl Provider for NoProvider {
    fn allocate(&mut self, _: usize, _: Tag) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn free(&mut self, _: NonNull<u8>, _: usize) -> bool {
        false
    }
}

/// Regions from a backing allocator are aligned to this.
const REGION_ALIGN: usize = 4096;

/// Source memory from a backing allocator on demand.
///
/// Each region is allocated and deallocated whole, so heaps using this
/// provider never merge or trim regions.
///
/// # Example
///
/// ```
/// # use tagalloc::*;
/// use allocator_api2::alloc::Global;
///
/// let mut heap = Box::new(Heap::new(AllocatorProvider::new(Global)));
/// unsafe {
///     heap.init(HeapConfig::new());
///     let p = heap.allocate(100, Tag::from_bytes(*b"doc1")).unwrap();
///     heap.free(p.as_ptr());
///     heap.destroy();
/// }
/// ```
#[derive(Debug)]
pub struct AllocatorProvider<A: Allocator> {
    allocator: A,
}

impl<A: Allocator> AllocatorProvider<A> {
    pub const fn new(allocator: A) -> Self {
        Self { allocator }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

unsafe impl<A: Allocator + Debug> Provider for AllocatorProvider<A> {
    const SUPPORTS_PARTIAL_FREES: bool = false;

    fn allocate(&mut self, size: usize, tag: Tag) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, REGION_ALIGN).ok()?;
        match self.allocator.allocate(layout) {
            Ok(region) => Some(region.cast::<u8>()),
            Err(_) => {
                log::trace!("[provider] backing allocator refused {} bytes for {}", size, tag);
                None
            }
        }
    }

    unsafe fn free(&mut self, base: NonNull<u8>, size: usize) -> bool {
        let layout = Layout::from_size_align_unchecked(size, REGION_ALIGN);
        self.allocator.deallocate(base, layout);
        true
    }
}

#[cfg(test)]
mod tests {
    use allocator_api2::alloc::Global;

    use super::*;
    use crate::{Heap, HeapConfig, HeapFlags};

    #[test]
    fn allocator_provider_round_trip() {
        let mut heap = Box::new(Heap::new(AllocatorProvider::new(Global)));
        let tag = Tag::from_bytes(*b"prov");

        unsafe {
            heap.init(HeapConfig::new());
            assert!(heap.flags().contains(HeapFlags::NO_PARTIAL_FREES));

            let mut ptrs = Vec::new();
            for i in 0..200 {
                let p = heap.allocate(64 + i * 37, tag).unwrap();
                p.as_ptr().write_bytes(i as u8, 64 + i * 37);
                ptrs.push(p);
            }
            for p in ptrs {
                heap.free(p.as_ptr());
            }
            heap.validate(None).unwrap();
            heap.destroy();
        }
    }

    #[test]
    fn no_provider_needs_external_memory() {
        let mut heap = Box::new(Heap::new(NoProvider));
        unsafe {
            heap.init(HeapConfig::new());
            assert!(heap.allocate(16, Tag::from_bytes(*b"none")).is_none());
            assert_eq!(heap.statistics().failed_allocations, 1);
        }
    }
}
