//! Character encodings for converting between wide characters and bytes.

use core::sync::atomic::{AtomicU32, Ordering};

use super::PrintError;

/// The longest byte sequence one wide character can encode to.
pub const MULTIBYTE_MAX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Encoding {
    /// Whatever [`default_encoding`] returns when a conversion starts.
    #[default]
    Default = 0,
    Ascii = 1,
}

impl Encoding {
    /// `None` for values that name no supported encoding.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Encoding::Default),
            1 => Some(Encoding::Ascii),
            _ => None,
        }
    }

    /// Replace [`Encoding::Default`] with the process default.
    pub fn resolve(self) -> Self {
        match self {
            Encoding::Default => default_encoding(),
            other => other,
        }
    }
}

static DEFAULT_ENCODING: AtomicU32 = AtomicU32::new(Encoding::Ascii as u32);

/// The encoding [`Encoding::Default`] currently stands for.
pub fn default_encoding() -> Encoding {
    match Encoding::from_raw(DEFAULT_ENCODING.load(Ordering::Acquire)) {
        Some(Encoding::Default) | None => Encoding::Ascii,
        Some(encoding) => encoding,
    }
}

/// Change the process default, returning the previous one.
///
/// [`Encoding::Default`] cannot name itself and is refused with `None`.
pub fn set_default_encoding(encoding: Encoding) -> Option<Encoding> {
    if encoding == Encoding::Default {
        return None;
    }

    let previous = DEFAULT_ENCODING.swap(encoding as u32, Ordering::AcqRel);
    Some(Encoding::from_raw(previous).unwrap_or(Encoding::Ascii))
}

/// Conversion state carried across the characters of one stream.
///
/// The supported encodings are stateless, so [`reset`](MultibyteState::reset)
/// only matters to stateful ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultibyteState {
    encoding: Encoding,
}

impl MultibyteState {
    /// A fresh state for `encoding`, resolved against the process default.
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding: encoding.resolve() }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.encoding);
    }

    /// Encode `ch` into `out`, returning the number of bytes used.
    pub fn encode_wide(&mut self, ch: u32, out: &mut [u8; MULTIBYTE_MAX]) -> Result<usize, PrintError> {
        match self.encoding {
            Encoding::Ascii | Encoding::Default => {
                if ch > 0x7F {
                    return Err(PrintError::MalformedDataStream);
                }
                out[0] = ch as u8;
                Ok(1)
            }
        }
    }

    /// Feed one byte, returning the wide character it completes, if any.
    pub fn decode_byte(&mut self, byte: u8) -> Result<Option<u32>, PrintError> {
        match self.encoding {
            Encoding::Ascii | Encoding::Default => {
                if byte > 0x7F {
                    return Err(PrintError::MalformedDataStream);
                }
                Ok(Some(byte as u32))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_rejects_high_code_points() {
        let mut state = MultibyteState::new(Encoding::Ascii);
        let mut out = [0; MULTIBYTE_MAX];

        assert_eq!(state.encode_wide('A' as u32, &mut out), Ok(1));
        assert_eq!(out[0], b'A');
        assert_eq!(state.encode_wide(0xE9, &mut out), Err(PrintError::MalformedDataStream));
        assert_eq!(state.decode_byte(b'z'), Ok(Some('z' as u32)));
        assert_eq!(state.decode_byte(0x80), Err(PrintError::MalformedDataStream));
    }

    #[test]
    fn default_encoding_resolves() {
        assert_eq!(default_encoding(), Encoding::Ascii);
        assert_eq!(MultibyteState::new(Encoding::Default).encoding(), Encoding::Ascii);
        assert_eq!(set_default_encoding(Encoding::Default), None);
        assert_eq!(set_default_encoding(Encoding::Ascii), Some(Encoding::Ascii));
        assert_eq!(Encoding::from_raw(7), None);
    }
}
