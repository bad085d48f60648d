//! A tagged heap, an intrusive red-black tree and a `printf` engine for `no_std`.
//!
//! ## The heap
//!
//! [`Heap`] is a segregated-fits allocator with boundary-tag coalescing.
//! Small requests are served from exact-size bins, larger ones from
//! bitwise tries, and the rest from the top chunk of the newest segment.
//! Memory comes from a [`Provider`]; large requests bypass the bins and
//! are mapped directly. Every allocation carries a [`Tag`] so usage can be
//! broken down per caller when statistics are enabled.
//!
//! Wrap a heap in a [`HeapLock`] to use it as a
//! [`GlobalAlloc`](core::alloc::GlobalAlloc) or, through
//! [`HeapLockRef`], as an [`Allocator`](allocator_api2::alloc::Allocator).
//!
//! ```
//! use tagalloc::{AllocatorProvider, Heap, HeapConfig, Tag};
//! use allocator_api2::alloc::Global;
//!
//! let mut heap = Box::new(Heap::new(AllocatorProvider::new(Global)));
//! let tag = Tag::from_bytes(*b"demo");
//!
//! unsafe {
//!     heap.init(HeapConfig::new());
//!
//!     let ptr = heap.allocate(100, tag).unwrap();
//!     assert!(heap.usable_size(ptr.as_ptr()) >= 100);
//!     heap.free(ptr.as_ptr());
//!
//!     assert!(heap.validate(None).is_ok());
//!     heap.destroy();
//! }
//! ```
//!
//! ## The tree
//!
//! [`RbTree`] links caller-owned [`RbNode`]s through sentinel nodes kept
//! inside the tree itself, so it must not move once initialized.
//!
//! ## Printing
//!
//! [`print`] implements the C conversion syntax over a typed [`Argument`]
//! slice, writing to byte buffers, wide buffers or any [`PrintSink`].
//!
//! ## Features
//!
//! * `allocator` (default): [`HeapLock`] and its allocator adapters, via `lock_api`.
//! * `counters`: per-heap allocation counters, see [`Heap::get_counters`].

#![cfg_attr(not(test), no_std)]

mod bits;
mod heap;
mod provider;
mod ptr_utils;

pub mod print;
pub mod rbtree;

#[cfg(feature = "lock_api")]
mod heaplock;

#[cfg(feature = "counters")]
pub use heap::Counters;
pub use heap::{
    Corruption, CorruptionCode, Heap, HeapConfig, HeapError, HeapFlags, HeapStatistics, Tag,
    TagStatistics, STATISTICS_TAG,
};
#[cfg(feature = "lock_api")]
pub use heaplock::{HeapLock, HeapLockRef, SingleThreadedLock};
pub use print::{
    format_string, print_to_string, print_to_wide_string, Argument, Encoding, PrintError, PrintSink,
};
pub use provider::{AllocatorProvider, NoProvider, Provider};
pub use rbtree::{RbNode, RbTree, TreeViolation};
