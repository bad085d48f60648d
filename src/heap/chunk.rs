//! Boundary-tag chunk layout.
//!
//! ```text
//!   chunk -> | prev_foot | head (size | flags) | tag | payload ...            |
//!   next  -> | prev_foot | ...
//! ```
//!
//! `prev_foot` belongs to the previous chunk: it holds the size of that chunk
//! when it is free, `heap ^ tag` when it is in use, and the alignment offset
//! of a direct chunk's own base. The payload begins right after the tag, so a
//! free chunk's list links overlay the first words of its payload.

use core::mem::size_of;

use crate::ptr_utils::{align_offset, align_offset_of, CHUNK_ALIGN_MASK, WORD_SIZE};

use super::segment::Segment;

pub const PINUSE: usize = 0x1;
pub const CINUSE: usize = 0x2;
pub const FLAG4: usize = 0x4;
pub const INUSE_BITS: usize = PINUSE | CINUSE;
pub const FLAG_BITS: usize = PINUSE | CINUSE | FLAG4;

/// Header of the fake chunks that terminate a segment.
pub const FENCEPOST_HEADER: usize = INUSE_BITS | WORD_SIZE;

/// Offset from a chunk to its payload.
pub const PAYLOAD_OFFSET: usize = 3 * WORD_SIZE;
/// Bytes an in-use chunk spends beyond its payload: header, tag and footer.
pub const CHUNK_OVERHEAD: usize = PAYLOAD_OFFSET;

/// Extra bytes kept around a direct chunk: the fenceposts after it.
pub const DIRECT_CHUNK_OVERHEAD: usize = 2 * WORD_SIZE;
pub const DIRECT_FOOTER_PAD: usize = 5 * WORD_SIZE;

pub const MIN_CHUNK_SIZE: usize = (size_of::<Chunk>() + CHUNK_ALIGN_MASK) & !CHUNK_ALIGN_MASK;
pub const MIN_REQUEST: usize = MIN_CHUNK_SIZE - CHUNK_OVERHEAD - 1;
pub const MAX_REQUEST: usize = MIN_CHUNK_SIZE.wrapping_neg() << 2;

pub const SMALL_BIN_COUNT: usize = 32;
pub const TREE_BIN_COUNT: usize = 32;
pub const SMALL_BIN_SHIFT: usize = 3;
pub const TREE_BIN_SHIFT: usize = 8;
pub const MIN_LARGE_SIZE: usize = 1 << TREE_BIN_SHIFT;
pub const MAX_SMALL_SIZE: usize = MIN_LARGE_SIZE - 1;
pub const MAX_SMALL_REQUEST: usize = MAX_SMALL_SIZE - CHUNK_ALIGN_MASK - CHUNK_OVERHEAD;

/// Bytes kept free past the top chunk so a segment record and fenceposts
/// can always be written there when a new segment is linked.
pub const TOP_FOOTER_SIZE: usize =
    align_offset_of(PAYLOAD_OFFSET) + pad_request(size_of::<Segment>()) + MIN_CHUNK_SIZE;

#[repr(C)]
#[derive(Debug)]
pub struct Chunk {
    pub prev_foot: usize,
    pub head: usize,
    pub tag: u32,
    pub next: *mut Chunk,
    pub prev: *mut Chunk,
}

/// A free chunk large enough to live in a tree bin.
#[repr(C)]
#[derive(Debug)]
pub struct TreeChunk {
    pub prev_foot: usize,
    pub head: usize,
    pub tag: u32,
    pub next: *mut TreeChunk,
    pub prev: *mut TreeChunk,
    pub child: [*mut TreeChunk; 2],
    pub parent: *mut TreeChunk,
    pub index: u32,
}

#[inline]
pub const fn pad_request(request: usize) -> usize {
    (request + CHUNK_OVERHEAD + CHUNK_ALIGN_MASK) & !CHUNK_ALIGN_MASK
}

/// The chunk size needed to satisfy a `request`-byte allocation.
#[inline]
pub const fn request_to_size(request: usize) -> usize {
    if request < MIN_REQUEST {
        MIN_CHUNK_SIZE
    } else {
        pad_request(request)
    }
}

#[inline]
pub const fn is_small(size: usize) -> bool {
    size >> SMALL_BIN_SHIFT < SMALL_BIN_COUNT
}

#[inline]
pub const fn small_index(size: usize) -> usize {
    size >> SMALL_BIN_SHIFT
}

#[inline]
pub const fn small_index_to_size(index: usize) -> usize {
    index << SMALL_BIN_SHIFT
}

#[inline]
pub fn chunk_to_payload(chunk: *mut Chunk) -> *mut u8 {
    chunk.cast::<u8>().wrapping_add(PAYLOAD_OFFSET)
}

#[inline]
pub fn payload_to_chunk(payload: *mut u8) -> *mut Chunk {
    payload.wrapping_sub(PAYLOAD_OFFSET).cast()
}

/// Move up from `addr` to the nearest address whose payload would be aligned.
#[inline]
pub fn align_as_chunk(addr: *mut u8) -> *mut Chunk {
    addr.wrapping_add(align_offset(addr.wrapping_add(PAYLOAD_OFFSET))).cast()
}

#[inline]
pub fn chunk_plus_offset(chunk: *mut Chunk, offset: usize) -> *mut Chunk {
    chunk.cast::<u8>().wrapping_add(offset).cast()
}

#[inline]
pub fn chunk_minus_offset(chunk: *mut Chunk, offset: usize) -> *mut Chunk {
    chunk.cast::<u8>().wrapping_sub(offset).cast()
}

#[inline]
pub unsafe fn chunk_size(chunk: *const Chunk) -> usize {
    (*chunk).head & !FLAG_BITS
}

#[inline]
pub unsafe fn next_chunk(chunk: *mut Chunk) -> *mut Chunk {
    chunk_plus_offset(chunk, chunk_size(chunk))
}

/// Only meaningful when the chunk's previous-in-use bit is clear.
#[inline]
pub unsafe fn prev_chunk(chunk: *mut Chunk) -> *mut Chunk {
    chunk_minus_offset(chunk, (*chunk).prev_foot)
}

#[inline]
pub unsafe fn cinuse(chunk: *const Chunk) -> bool {
    (*chunk).head & CINUSE != 0
}

#[inline]
pub unsafe fn pinuse(chunk: *const Chunk) -> bool {
    (*chunk).head & PINUSE != 0
}

#[inline]
pub unsafe fn is_inuse(chunk: *const Chunk) -> bool {
    (*chunk).head & INUSE_BITS != PINUSE
}

/// Direct chunks carry neither in-use bit.
#[inline]
pub unsafe fn is_direct(chunk: *const Chunk) -> bool {
    (*chunk).head & INUSE_BITS == 0
}

#[inline]
pub unsafe fn next_pinuse(chunk: *mut Chunk) -> bool {
    pinuse(next_chunk(chunk))
}

#[inline]
pub unsafe fn clear_pinuse(chunk: *mut Chunk) {
    (*chunk).head &= !PINUSE;
}

#[inline]
pub unsafe fn set_foot(chunk: *mut Chunk, size: usize) {
    (*chunk_plus_offset(chunk, size)).prev_foot = size;
}

#[inline]
pub unsafe fn set_size_pinuse_of_free(chunk: *mut Chunk, size: usize) {
    (*chunk).head = size | PINUSE;
    set_foot(chunk, size);
}

/// Mark `chunk` free with its predecessor in use, clearing the successor's
/// previous-in-use bit.
#[inline]
pub unsafe fn set_free_with_pinuse(chunk: *mut Chunk, size: usize, next: *mut Chunk) {
    clear_pinuse(next);
    set_size_pinuse_of_free(chunk, size);
}

/// The footer value stamped after an in-use chunk.
#[inline]
pub fn footer_value(heap: usize, tag: u32) -> usize {
    heap ^ tag as usize
}

#[inline]
unsafe fn mark_inuse_foot(heap: usize, chunk: *mut Chunk, size: usize, tag: u32) {
    (*chunk).tag = tag;
    (*chunk_plus_offset(chunk, size)).prev_foot = footer_value(heap, tag);
}

/// Set the size and in-use bit, keeping the previous-in-use bit, and set the
/// successor's previous-in-use bit.
#[inline]
pub unsafe fn set_inuse(heap: usize, chunk: *mut Chunk, size: usize, tag: u32) {
    (*chunk).head = ((*chunk).head & PINUSE) | size | CINUSE;
    (*chunk_plus_offset(chunk, size)).head |= PINUSE;
    mark_inuse_foot(heap, chunk, size, tag);
}

#[inline]
pub unsafe fn set_inuse_and_pinuse(heap: usize, chunk: *mut Chunk, size: usize, tag: u32) {
    (*chunk).head = size | PINUSE | CINUSE;
    (*chunk_plus_offset(chunk, size)).head |= PINUSE;
    mark_inuse_foot(heap, chunk, size, tag);
}

/// Like [`set_inuse_and_pinuse`] but leaves the successor's header untouched.
#[inline]
pub unsafe fn set_size_pinuse_of_inuse(heap: usize, chunk: *mut Chunk, size: usize, tag: u32) {
    (*chunk).head = size | PINUSE | CINUSE;
    mark_inuse_foot(heap, chunk, size, tag);
}

/// The heap address recovered from an in-use chunk's footer.
#[inline]
pub unsafe fn footer_heap(chunk: *mut Chunk) -> usize {
    (*chunk_plus_offset(chunk, chunk_size(chunk))).prev_foot ^ (*chunk).tag as usize
}
