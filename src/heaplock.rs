use crate::{ptr_utils::CHUNK_ALIGN, Heap, HeapConfig, Provider, Tag};

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

/// A mutex-locked [`Heap`] usable as a global allocator.
///
/// The heap is initialized with the stored [`HeapConfig`] the first time it
/// is locked, and again after a [`destroy`](Heap::destroy). Allocations made
/// through [`GlobalAlloc`] or [`allocator_api_ref`](HeapLock::allocator_api_ref)
/// carry the lock's default tag.
///
/// ```
/// # use tagalloc::*;
/// use allocator_api2::alloc::Global;
///
/// let heap = Box::new(unsafe {
///     HeapLock::<spin::Mutex<()>, _>::new(AllocatorProvider::new(Global), HeapConfig::new(), Tag::from_bytes(*b"glob"))
/// });
/// let v = allocator_api2::vec![in heap.allocator_api_ref(); 1u32, 2, 3];
/// assert_eq!(v.len(), 3);
/// ```
#[derive(Debug)]
pub struct HeapLock<R: lock_api::RawMutex, P: Provider> {
    mutex: lock_api::Mutex<R, Heap<P>>,
    config: HeapConfig,
    default_tag: Tag,
}

impl<R: lock_api::RawMutex, P: Provider> HeapLock<R, P> {
    /// # Safety
    /// The lock must not be moved once it has been locked, since the heap
    /// inside it is initialized in place.
    pub const unsafe fn new(provider: P, config: HeapConfig, default_tag: Tag) -> Self {
        Self { mutex: lock_api::Mutex::const_new(R::INIT, Heap::new(provider)), config, default_tag }
    }

    /// Lock the mutex and access the inner [`Heap`], initializing it if needed.
    pub fn lock(&self) -> lock_api::MutexGuard<'_, R, Heap<P>> {
        let mut heap = self.mutex.lock();
        if !heap.is_initialized() {
            // SAFETY: the heap never leaves the mutex and the lock does not move
            unsafe { heap.init(self.config) };
        }
        heap
    }

    pub fn default_tag(&self) -> Tag {
        self.default_tag
    }

    /// Get a reference that implements the `Allocator` API.
    pub fn allocator_api_ref(&self) -> HeapLockRef<'_, R, P> {
        HeapLockRef(self)
    }

    unsafe fn malloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let mut heap = self.lock();
        if layout.align() <= CHUNK_ALIGN {
            heap.allocate(layout.size(), self.default_tag)
        } else {
            heap.aligned_allocate(layout.align(), layout.size(), self.default_tag).ok()
        }
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, old_layout: Layout, new_size: usize) -> Option<NonNull<u8>> {
        if old_layout.align() <= CHUNK_ALIGN {
            return self.lock().reallocate(ptr.as_ptr(), new_size, self.default_tag);
        }

        // in-place resizing keeps the payload address, so only moves need the alignment
        let new_layout = Layout::from_size_align_unchecked(new_size, old_layout.align());
        let moved = self.malloc(new_layout)?;
        moved.as_ptr().copy_from_nonoverlapping(ptr.as_ptr(), old_layout.size().min(new_size));
        self.lock().free(ptr.as_ptr());
        Some(moved)
    }
}

unsafe impl<R: lock_api::RawMutex, P: Provider> GlobalAlloc for HeapLock<R, P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.malloc(layout).map_or(ptr::null_mut(), |nn| nn.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        self.lock().free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        match NonNull::new(ptr) {
            Some(nn) => self.resize(nn, layout, new_size).map_or(ptr::null_mut(), |nn| nn.as_ptr()),
            None => ptr::null_mut(),
        }
    }
}

#[derive(Debug)]
pub struct HeapLockRef<'a, R: lock_api::RawMutex, P: Provider>(pub &'a HeapLock<R, P>);

impl<'a, R: lock_api::RawMutex, P: Provider> Clone for HeapLockRef<'a, R, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, R: lock_api::RawMutex, P: Provider> Copy for HeapLockRef<'a, R, P> {}

unsafe impl<'a, R: lock_api::RawMutex, P: Provider> allocator_api2::alloc::Allocator for HeapLockRef<'a, R, P> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, allocator_api2::alloc::AllocError> {
        if layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(dangling(layout), 0));
        }

        unsafe { self.0.malloc(layout) }
            .map(|nn| NonNull::slice_from_raw_parts(nn, layout.size()))
            .ok_or(allocator_api2::alloc::AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            self.0.lock().free(ptr.as_ptr());
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, allocator_api2::alloc::AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());

        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }

        self.relocate_or_resize(ptr, old_layout, new_layout)
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, allocator_api2::alloc::AllocError> {
        let res = self.grow(ptr, old_layout, new_layout);

        if let Ok(allocation) = res {
            allocation
                .cast::<u8>()
                .as_ptr()
                .add(old_layout.size())
                .write_bytes(0, new_layout.size() - old_layout.size());
        }

        res
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, allocator_api2::alloc::AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if new_layout.size() == 0 {
            if old_layout.size() > 0 {
                self.0.lock().free(ptr.as_ptr());
            }

            return Ok(NonNull::slice_from_raw_parts(dangling(new_layout), 0));
        }

        self.relocate_or_resize(ptr, old_layout, new_layout)
    }
}

impl<'a, R: lock_api::RawMutex, P: Provider> HeapLockRef<'a, R, P> {
    unsafe fn relocate_or_resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, allocator_api2::alloc::AllocError> {
        if ptr.as_ptr() as usize & (new_layout.align() - 1) != 0 {
            let allocation = self.0.malloc(new_layout).ok_or(allocator_api2::alloc::AllocError)?;
            let kept = old_layout.size().min(new_layout.size());
            allocation.as_ptr().copy_from_nonoverlapping(ptr.as_ptr(), kept);
            self.0.lock().free(ptr.as_ptr());
            return Ok(NonNull::slice_from_raw_parts(allocation, new_layout.size()));
        }

        let layout = Layout::from_size_align_unchecked(old_layout.size(), new_layout.align());
        self.0
            .resize(ptr, layout, new_layout.size())
            .map(|nn| NonNull::slice_from_raw_parts(nn, new_layout.size()))
            .ok_or(allocator_api2::alloc::AllocError)
    }
}

/// A [`RawMutex`](lock_api::RawMutex) for hosts that only ever run one thread.
///
/// Nothing is synchronized. The lock only remembers that it is held, so a
/// heap entered again from inside itself, as by a [`Provider`] that
/// allocates from the [`HeapLock`] it serves, panics rather than corrupting
/// the chunk lists. Use `spin::Mutex<()>` wherever threads exist.
///
/// # Safety
/// Locking from two threads at once is undefined behaviour, even though the
/// caller writes no `unsafe` code.
#[derive(Debug)]
pub struct SingleThreadedLock {
    held: AtomicBool,
}

// SAFETY: only sound on single-threaded hosts, see above
unsafe impl lock_api::RawMutex for SingleThreadedLock {
    const INIT: SingleThreadedLock = SingleThreadedLock { held: AtomicBool::new(false) };

    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        if !self.try_lock() {
            panic!("heap re-entered while it was locked");
        }
    }

    // plain loads and stores, so targets without compare-and-swap work too
    fn try_lock(&self) -> bool {
        if self.held.load(Ordering::Relaxed) {
            return false;
        }
        self.held.store(true, Ordering::Relaxed);
        true
    }

    unsafe fn unlock(&self) {
        self.held.store(false, Ordering::Relaxed);
    }

    fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

fn dangling(layout: Layout) -> NonNull<u8> {
    // an address equal to the alignment is never null and always aligned
    unsafe { NonNull::new_unchecked(layout.align() as *mut u8) }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use allocator_api2::{alloc::Allocator, vec::Vec};

    use super::*;
    use crate::{heap::testing::*, HeapFlags, STATISTICS_TAG};

    type SpinHeap = HeapLock<spin::Mutex<()>, TestProvider>;

    fn new_lock() -> Box<SpinHeap> {
        let config = HeapConfig::new().with_flags(HeapFlags::COLLECT_TAG_STATISTICS);
        Box::new(unsafe { HeapLock::new(TestProvider::new(), config, TAG_A) })
    }

    /// Live allocations other than the heap's own tag records.
    fn user_allocations(heap: &SpinHeap) -> usize {
        let guard = heap.lock();
        let records = guard.tag_statistics(STATISTICS_TAG).map_or(0, |s| s.active_allocation_count);
        guard.statistics().allocations - records as usize
    }

    #[test]
    fn lazily_initialized() {
        let heap = new_lock();
        let guard = heap.lock();
        assert!(guard.is_initialized());
        assert_eq!(guard.provider.allocation_count, 0);
    }

    #[test]
    fn global_alloc_uses_default_tag() {
        let heap = new_lock();
        unsafe {
            let layout = Layout::from_size_align(100, 8).unwrap();
            let p = heap.alloc(layout);
            assert!(!p.is_null());
            p.write_bytes(0xAB, 100);

            let stats = heap.lock().tag_statistics(TAG_A).unwrap();
            assert_eq!(stats.active_allocation_count, 1);

            let q = heap.realloc(p, layout, 5000);
            assert!(!q.is_null());
            assert_eq!(*q.add(99), 0xAB);

            heap.dealloc(q, Layout::from_size_align(5000, 8).unwrap());
        }
        assert_eq!(heap.lock().tag_statistics(TAG_A).unwrap().active_allocation_count, 0);
    }

    #[test]
    fn over_aligned_requests() {
        let heap = new_lock();
        unsafe {
            for align in [32, 64, 256, 4096] {
                let layout = Layout::from_size_align(align + 7, align).unwrap();
                let p = heap.alloc(layout);
                assert_eq!(p as usize % align, 0);
                p.write_bytes(1, layout.size());

                let q = heap.realloc(p, layout, 3 * align);
                assert_eq!(q as usize % align, 0);
                assert_eq!(*q.add(align + 6), 1);
                heap.dealloc(q, Layout::from_size_align(3 * align, align).unwrap());
            }
        }
        assert!(heap.lock().validate(None).is_ok());
        assert_eq!(user_allocations(&heap), 0);
        assert_eq!(heap.lock().tag_statistics(TAG_A).unwrap().active_allocation_count, 0);
    }

    #[test]
    fn allocator_api_vec() {
        let heap = new_lock();
        let mut v = Vec::new_in(heap.allocator_api_ref());
        for i in 0..10_000u32 {
            v.push(i);
        }
        v.shrink_to(100);
        assert_eq!(v.iter().copied().sum::<u32>(), (0..10_000).sum());
        drop(v);

        let zst = heap.allocator_api_ref().allocate(Layout::new::<()>()).unwrap();
        unsafe { heap.allocator_api_ref().deallocate(zst.cast(), Layout::new::<()>()) };

        assert_eq!(user_allocations(&heap), 0);
    }

    #[test]
    fn grow_zeroed_clears_tail() {
        let heap = new_lock();
        let alloc = heap.allocator_api_ref();
        unsafe {
            let old = Layout::from_size_align(16, 8).unwrap();
            let new = Layout::from_size_align(512, 8).unwrap();
            let p = alloc.allocate(old).unwrap().cast::<u8>();
            p.as_ptr().write_bytes(7, 16);

            let q = alloc.grow_zeroed(p, old, new).unwrap().cast::<u8>();
            let bytes = core::slice::from_raw_parts(q.as_ptr(), 512);
            assert!(bytes[..16].iter().all(|&b| b == 7));
            assert!(bytes[16..].iter().all(|&b| b == 0));
            alloc.deallocate(q, new);
        }
    }

    #[test]
    fn threads_share_the_heap() {
        let heap: Arc<SpinHeap> = Arc::from(new_lock());

        let handles = (0..4u64)
            .map(|seed| {
                let heap = heap.clone();
                thread::spawn(move || {
                    let rng = fastrand::Rng::with_seed(seed);
                    let mut live = std::vec::Vec::new();
                    for _ in 0..2000 {
                        if live.is_empty() || rng.bool() {
                            let layout = Layout::from_size_align(rng.usize(1..2000), 8).unwrap();
                            let p = unsafe { heap.alloc(layout) };
                            assert!(!p.is_null());
                            live.push((p as usize, layout));
                        } else {
                            let (p, layout) = live.swap_remove(rng.usize(..live.len()));
                            unsafe { heap.dealloc(p as *mut u8, layout) };
                        }
                    }
                    for (p, layout) in live {
                        unsafe { heap.dealloc(p as *mut u8, layout) };
                    }
                })
            })
            .collect::<std::vec::Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(user_allocations(&heap), 0);
        assert!(heap.lock().tag_statistics(TAG_A).unwrap().lifetime_allocation_size > 0);
        assert!(heap.lock().validate(None).is_ok());
    }

    #[test]
    fn single_threaded_lock_tracks_holder() {
        use lock_api::RawMutex;

        let lock = SingleThreadedLock::INIT;
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        unsafe { lock.unlock() };
        assert!(lock.try_lock());
    }

    #[test]
    fn single_threaded_heap_lock() {
        let config = HeapConfig::new().with_flags(HeapFlags::COLLECT_TAG_STATISTICS);
        let heap = Box::new(unsafe { HeapLock::<SingleThreadedLock, _>::new(TestProvider::new(), config, TAG_A) });

        unsafe {
            let layout = Layout::from_size_align(300, 64).unwrap();
            let p = heap.alloc(layout);
            assert_eq!(p as usize % 64, 0);
            heap.dealloc(p, layout);
        }
        assert_eq!(heap.lock().tag_statistics(TAG_A).unwrap().active_allocation_count, 0);
        assert!(heap.lock().validate(None).is_ok());
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn single_threaded_lock_rejects_reentry() {
        let heap = Box::new(unsafe {
            HeapLock::<SingleThreadedLock, _>::new(TestProvider::new(), HeapConfig::new(), TAG_A)
        });

        let _outer = heap.lock();
        let _inner = heap.lock();
    }
}
