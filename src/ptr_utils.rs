//! Generic utilities for pointer handling and sizing.

pub const WORD_SIZE: usize = core::mem::size_of::<usize>();
pub const WORD_BITS: usize = usize::BITS as usize;

/// Alignment of every payload handed out by the heap.
pub const CHUNK_ALIGN: usize = 2 * WORD_SIZE;
pub const CHUNK_ALIGN_MASK: usize = CHUNK_ALIGN - 1;

/// Aligns `ptr` up to the next `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one.
#[inline]
pub fn align_up_by(ptr: *mut u8, align_mask: usize) -> *mut u8 {
    debug_assert!((align_mask + 1).is_power_of_two());

    // this incantation maintains provenance of ptr
    // while allowing the compiler to see through the wrapping_add and optimize it
    ptr.wrapping_add(((ptr as usize + align_mask) & !align_mask) - ptr as usize)
}

/// Aligns `ptr` down to `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one.
#[inline]
pub fn align_down_by(ptr: *mut u8, align_mask: usize) -> *mut u8 {
    debug_assert!((align_mask + 1).is_power_of_two());

    ptr.wrapping_sub(ptr as usize & align_mask)
}

/// Number of bytes needed to bring `addr` up to chunk alignment.
#[inline]
pub const fn align_offset_of(addr: usize) -> usize {
    (CHUNK_ALIGN - (addr & CHUNK_ALIGN_MASK)) & CHUNK_ALIGN_MASK
}

/// Number of bytes needed to bring `ptr` up to chunk alignment.
#[inline]
pub fn align_offset(ptr: *const u8) -> usize {
    align_offset_of(ptr as usize)
}

#[inline]
pub fn is_chunk_aligned(ptr: *const u8) -> bool {
    ptr as usize & CHUNK_ALIGN_MASK == 0
}

/// Rounds `size` up to a multiple of `granularity`, which must be a power of two.
///
/// Returns `None` on overflow.
#[inline]
pub const fn round_up_checked(size: usize, granularity: usize) -> Option<usize> {
    match size.checked_add(granularity - 1) {
        Some(s) => Some(s & !(granularity - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::null_mut;

    use super::*;

    #[test]
    fn align_ptr_test() {
        assert!(align_up_by(null_mut(), CHUNK_ALIGN_MASK) == null_mut());
        assert!(align_down_by(null_mut(), CHUNK_ALIGN_MASK) == null_mut());

        for i in 1..=CHUNK_ALIGN {
            let p = null_mut::<u8>().wrapping_add(i);
            assert!(align_up_by(p, CHUNK_ALIGN_MASK) == null_mut::<u8>().wrapping_add(CHUNK_ALIGN));
        }

        for i in 0..CHUNK_ALIGN {
            let p = null_mut::<u8>().wrapping_add(CHUNK_ALIGN + i);
            assert!(align_down_by(p, CHUNK_ALIGN_MASK) == null_mut::<u8>().wrapping_add(CHUNK_ALIGN));
        }
    }

    #[test]
    fn align_offset_test() {
        assert_eq!(align_offset(null_mut()), 0);
        assert_eq!(align_offset(null_mut::<u8>().wrapping_add(1)), CHUNK_ALIGN - 1);
        assert_eq!(align_offset(null_mut::<u8>().wrapping_add(WORD_SIZE)), WORD_SIZE);
        assert!(is_chunk_aligned(null_mut::<u8>().wrapping_add(CHUNK_ALIGN * 3)));
        assert!(!is_chunk_aligned(null_mut::<u8>().wrapping_add(WORD_SIZE)));
    }

    #[test]
    fn round_up_test() {
        assert_eq!(round_up_checked(0, 4096), Some(0));
        assert_eq!(round_up_checked(1, 4096), Some(4096));
        assert_eq!(round_up_checked(4096, 4096), Some(4096));
        assert_eq!(round_up_checked(usize::MAX - 2, 4096), None);
    }
}
