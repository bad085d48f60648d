//! The argument pack consumed by the format walker.

use core::cell::Cell;

use super::PrintError;

/// One value for a conversion.
///
/// `None` strings print as `(null)`.
#[derive(Debug, Clone, Copy)]
pub enum Argument<'a> {
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(Option<&'a [u8]>),
    /// A wide string, terminated by its end or the first zero.
    WStr(Option<&'a [u32]>),
    Char(u8),
    WChar(u32),
    Ptr(usize),
    /// Receives the count of characters written so far for `%n`.
    Count(&'a Cell<i32>),
}

impl<'a> Argument<'a> {
    /// The raw bits an integer conversion reads.
    pub(super) fn integer_bits(&self) -> Result<u64, PrintError> {
        match *self {
            Argument::Int(value) => Ok(value as u64),
            Argument::Uint(value) => Ok(value),
            Argument::Char(value) => Ok(value as u64),
            Argument::WChar(value) => Ok(value as u64),
            Argument::Ptr(value) => Ok(value as u64),
            Argument::Str(Some(s)) => Ok(s.as_ptr() as usize as u64),
            Argument::WStr(Some(s)) => Ok(s.as_ptr() as usize as u64),
            Argument::Str(None) | Argument::WStr(None) => Ok(0),
            Argument::Float(_) | Argument::Count(_) => Err(PrintError::InvalidConversion),
        }
    }

    pub(super) fn float(&self) -> Result<f64, PrintError> {
        match *self {
            Argument::Float(value) => Ok(value),
            Argument::Int(value) => Ok(value as f64),
            Argument::Uint(value) => Ok(value as f64),
            _ => Err(PrintError::InvalidConversion),
        }
    }

    /// Field widths and precisions taken from the pack.
    pub(super) fn int(&self) -> Result<i64, PrintError> {
        match *self {
            Argument::Int(value) => Ok(value),
            Argument::Uint(value) => Ok(value.min(i64::MAX as u64) as i64),
            _ => Err(PrintError::InvalidConversion),
        }
    }
}

macro_rules! from_signed {
    ($($t:ty),*) => {$(
        impl<'a> From<$t> for Argument<'a> {
            fn from(value: $t) -> Self {
                Argument::Int(value as i64)
            }
        }
    )*};
}

macro_rules! from_unsigned {
    ($($t:ty),*) => {$(
        impl<'a> From<$t> for Argument<'a> {
            fn from(value: $t) -> Self {
                Argument::Uint(value as u64)
            }
        }
    )*};
}

from_signed!(i8, i16, i32, i64, isize);
from_unsigned!(u8, u16, u32, u64, usize);

impl<'a> From<f64> for Argument<'a> {
    fn from(value: f64) -> Self {
        Argument::Float(value)
    }
}

impl<'a> From<f32> for Argument<'a> {
    fn from(value: f32) -> Self {
        Argument::Float(value as f64)
    }
}

impl<'a> From<char> for Argument<'a> {
    fn from(value: char) -> Self {
        Argument::WChar(value as u32)
    }
}

impl<'a> From<&'a str> for Argument<'a> {
    fn from(value: &'a str) -> Self {
        Argument::Str(Some(value.as_bytes()))
    }
}

impl<'a> From<&'a [u8]> for Argument<'a> {
    fn from(value: &'a [u8]) -> Self {
        Argument::Str(Some(value))
    }
}

impl<'a> From<Option<&'a str>> for Argument<'a> {
    fn from(value: Option<&'a str>) -> Self {
        Argument::Str(value.map(str::as_bytes))
    }
}

impl<'a> From<&'a [u32]> for Argument<'a> {
    fn from(value: &'a [u32]) -> Self {
        Argument::WStr(Some(value))
    }
}

impl<'a, T> From<*const T> for Argument<'a> {
    fn from(value: *const T) -> Self {
        Argument::Ptr(value as usize)
    }
}

impl<'a, T> From<*mut T> for Argument<'a> {
    fn from(value: *mut T) -> Self {
        Argument::Ptr(value as usize)
    }
}

impl<'a> From<&'a Cell<i32>> for Argument<'a> {
    fn from(value: &'a Cell<i32>) -> Self {
        Argument::Count(value)
    }
}

/// Hands out arguments in order, or by 1-based position for `n$`.
///
/// Positional reads do not move the sequential cursor.
#[derive(Debug)]
pub(super) struct ArgumentCursor<'p, 'a> {
    args: &'p [Argument<'a>],
    next: usize,
}

impl<'p, 'a> ArgumentCursor<'p, 'a> {
    pub fn new(args: &'p [Argument<'a>]) -> Self {
        Self { args, next: 0 }
    }

    /// Position `0` means the next sequential argument.
    pub fn get(&mut self, position: usize) -> Result<Argument<'a>, PrintError> {
        let index = if position == 0 {
            self.next += 1;
            self.next - 1
        } else {
            position - 1
        };

        self.args.get(index).copied().ok_or(PrintError::InvalidConversion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_pick_variants() {
        assert!(matches!(Argument::from(-3i8), Argument::Int(-3)));
        assert!(matches!(Argument::from(3usize), Argument::Uint(3)));
        assert!(matches!(Argument::from('x'), Argument::WChar(0x78)));
        assert!(matches!(Argument::from("hi"), Argument::Str(Some(b"hi"))));
        assert!(matches!(Argument::from(None::<&str>), Argument::Str(None)));
        assert_eq!(Argument::Int(-1).integer_bits(), Ok(u64::MAX));
        assert_eq!(Argument::Float(1.5).integer_bits(), Err(PrintError::InvalidConversion));
    }

    #[test]
    fn positional_reads_leave_cursor() {
        let args = [Argument::Int(1), Argument::Int(2), Argument::Int(3)];
        let mut cursor = ArgumentCursor::new(&args);

        assert_eq!(cursor.get(3).and_then(|a| a.int()), Ok(3));
        assert_eq!(cursor.get(0).and_then(|a| a.int()), Ok(1));
        assert_eq!(cursor.get(0).and_then(|a| a.int()), Ok(2));
        assert_eq!(cursor.get(1).and_then(|a| a.int()), Ok(1));
        assert_eq!(cursor.get(0).and_then(|a| a.int()), Ok(3));
        assert_eq!(cursor.get(0).map(|_| ()), Err(PrintError::InvalidConversion));
    }
}
