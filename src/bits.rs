//! Bit primitives shared by the heap bitmaps and the printer.
//!
//! Zero inputs are well-defined: the counting functions return the bit width.

#[inline]
pub const fn count_leading_zeros32(value: u32) -> u32 {
    value.leading_zeros()
}

#[inline]
pub const fn count_leading_zeros64(value: u64) -> u32 {
    value.leading_zeros()
}

#[inline]
pub const fn count_trailing_zeros32(value: u32) -> u32 {
    value.trailing_zeros()
}

#[inline]
pub const fn count_trailing_zeros64(value: u64) -> u32 {
    value.trailing_zeros()
}

#[inline]
pub const fn count_set_bits32(value: u32) -> u32 {
    value.count_ones()
}

#[inline]
pub const fn count_set_bits64(value: u64) -> u32 {
    value.count_ones()
}

/// Divides `dividend` by `divisor`, returning `(quotient, remainder)`.
///
/// Returns `None` for a zero divisor.
#[inline]
pub const fn divide64(dividend: u64, divisor: u64) -> Option<(u64, u64)> {
    if divisor == 0 {
        None
    } else {
        Some((dividend / divisor, dividend % divisor))
    }
}

/// The lowest set bit of `x`, isolated.
#[inline]
pub const fn least_bit(x: u32) -> u32 {
    x & x.wrapping_neg()
}

/// A mask with every bit strictly above the lowest set bit of `x`.
#[inline]
pub const fn left_bits(x: u32) -> u32 {
    (x << 1) | (x << 1).wrapping_neg()
}

/// A mask with the lowest set bit of `x` and everything above it.
#[inline]
pub const fn same_or_left_bits(x: u32) -> u32 {
    x | x.wrapping_neg()
}

/// Index of a bit isolated by [`least_bit`].
#[inline]
pub const fn bit_index(x: u32) -> usize {
    x.trailing_zeros() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_test() {
        assert_eq!(count_leading_zeros32(0), 32);
        assert_eq!(count_leading_zeros32(1), 31);
        assert_eq!(count_leading_zeros64(1 << 40), 23);
        assert_eq!(count_trailing_zeros32(0x80), 7);
        assert_eq!(count_trailing_zeros64(0), 64);
        assert_eq!(count_set_bits32(0xF0F0), 8);
        assert_eq!(count_set_bits64(u64::MAX), 64);
    }

    #[test]
    fn divide_test() {
        assert_eq!(divide64(100, 7), Some((14, 2)));
        assert_eq!(divide64(u64::MAX, 10), Some((u64::MAX / 10, 5)));
        assert_eq!(divide64(1, 0), None);
    }

    #[test]
    fn bitmap_masks_test() {
        assert_eq!(least_bit(0b1011_0000), 0b1_0000);
        assert_eq!(left_bits(0b100), !0b111);
        assert_eq!(same_or_left_bits(0b100), !0b11);
        assert_eq!(bit_index(least_bit(0b1011_0000)), 4);
        assert_eq!(left_bits(1 << 31), 0);
    }
}
