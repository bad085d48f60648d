//! A `printf`-style formatter over a typed argument pack.
//!
//! The walker copies the format string to a [`PrintSink`], expanding each
//! `%[pos$][flags][width][.precision][length]specifier` conversion. Every
//! character is counted even once the context's limit stops it from being
//! stored, so a dry run reports the space a full rendering needs.
//!
//! ```
//! use tagalloc::print::{print_to_string, Argument};
//!
//! let mut buf = [0u8; 32];
//! let size = print_to_string(Some(&mut buf), "%s=%#06x", &["mask".into(), 0xf0u32.into()]);
//! assert_eq!(&buf[..size - 1], b"mask=0x00f0");
//! ```

mod args;
mod encoding;
mod float;
mod integer;

pub use args::Argument;
pub use encoding::{default_encoding, set_default_encoding, Encoding, MultibyteState, MULTIBYTE_MAX};

use args::ArgumentCursor;

/// Why a format walk stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrintError {
    /// A wide character could not be converted in the current encoding.
    MalformedDataStream,
    /// The sink refused a character.
    BufferTooSmall,
    /// An unknown specifier, or an argument missing or of the wrong kind.
    InvalidConversion,
}

impl core::fmt::Display for PrintError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PrintError::MalformedDataStream => f.write_str("malformed data stream"),
            PrintError::BufferTooSmall => f.write_str("buffer too small"),
            PrintError::InvalidConversion => f.write_str("invalid conversion"),
        }
    }
}

/// Destination of formatted output.
pub trait PrintSink {
    /// Whether the sink takes wide characters. Narrow output is then
    /// decoded through the context's multibyte state before it arrives.
    const WIDE: bool = false;

    /// Accept one byte. Returning false stops the walk.
    fn write_byte(&mut self, byte: u8) -> bool;

    /// Accept one wide character. Only called on wide sinks.
    fn write_wide(&mut self, ch: u32) -> bool {
        let _ = ch;
        false
    }
}

/// Stores into an optional byte buffer, dropping what does not fit.
#[derive(Debug)]
pub struct BufferSink<'b> {
    buf: Option<&'b mut [u8]>,
    position: usize,
}

impl<'b> BufferSink<'b> {
    pub fn new(buf: Option<&'b mut [u8]>) -> Self {
        Self { buf, position: 0 }
    }

    fn terminate_at(&mut self, index: usize) {
        if let Some(slot) = self.buf.as_deref_mut().and_then(|buf| buf.get_mut(index)) {
            *slot = 0;
        }
    }
}

impl<'b> PrintSink for BufferSink<'b> {
    fn write_byte(&mut self, byte: u8) -> bool {
        if let Some(slot) = self.buf.as_deref_mut().and_then(|buf| buf.get_mut(self.position)) {
            *slot = byte;
        }
        self.position += 1;
        true
    }
}

/// Stores into an optional wide-character buffer.
#[derive(Debug)]
pub struct WideBufferSink<'b> {
    buf: Option<&'b mut [u32]>,
    position: usize,
}

impl<'b> WideBufferSink<'b> {
    pub fn new(buf: Option<&'b mut [u32]>) -> Self {
        Self { buf, position: 0 }
    }

    fn terminate_at(&mut self, index: usize) {
        if let Some(slot) = self.buf.as_deref_mut().and_then(|buf| buf.get_mut(index)) {
            *slot = 0;
        }
    }
}

impl<'b> PrintSink for WideBufferSink<'b> {
    const WIDE: bool = true;

    fn write_byte(&mut self, byte: u8) -> bool {
        self.write_wide(byte as u32)
    }

    fn write_wide(&mut self, ch: u32) -> bool {
        if let Some(slot) = self.buf.as_deref_mut().and_then(|buf| buf.get_mut(self.position)) {
            *slot = ch;
        }
        self.position += 1;
        true
    }
}

/// Forwards to a [`core::fmt::Write`], one character per byte.
#[derive(Debug)]
pub struct FmtSink<'w, W: core::fmt::Write + ?Sized>(pub &'w mut W);

impl<'w, W: core::fmt::Write + ?Sized> PrintSink for FmtSink<'w, W> {
    fn write_byte(&mut self, byte: u8) -> bool {
        self.0.write_char(byte as char).is_ok()
    }
}

/// The walker's state for one format operation.
#[derive(Debug)]
pub struct FormatContext<'s, S: PrintSink + ?Sized> {
    sink: &'s mut S,
    /// Characters produced so far, stored or not.
    pub bytes_written: usize,
    /// Characters past this count are counted but not stored.
    pub limit: usize,
    pub state: MultibyteState,
}

impl<'s, S: PrintSink + ?Sized> FormatContext<'s, S> {
    pub fn new(sink: &'s mut S, limit: usize, encoding: Encoding) -> Self {
        Self { sink, bytes_written: 0, limit, state: MultibyteState::new(encoding) }
    }

    #[inline]
    fn emit(&mut self, store: impl FnOnce(&mut S) -> bool) -> Result<(), PrintError> {
        if self.bytes_written < self.limit && !store(&mut *self.sink) {
            return Err(PrintError::BufferTooSmall);
        }
        self.bytes_written += 1;
        Ok(())
    }

    /// Write one narrow character.
    pub fn write_byte(&mut self, byte: u8) -> Result<(), PrintError> {
        if S::WIDE {
            match self.state.decode_byte(byte)? {
                Some(ch) => self.emit(|sink| sink.write_wide(ch)),
                None => Ok(()),
            }
        } else {
            self.emit(|sink| sink.write_byte(byte))
        }
    }

    /// Write one wide character, encoding it for narrow sinks.
    pub fn write_wide(&mut self, ch: u32) -> Result<(), PrintError> {
        if S::WIDE {
            return self.emit(|sink| sink.write_wide(ch));
        }

        let mut encoded = [0; MULTIBYTE_MAX];
        let length = self.state.encode_wide(ch, &mut encoded)?;
        self.write_bytes(&encoded[..length])
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), PrintError> {
        bytes.iter().try_for_each(|&byte| self.write_byte(byte))
    }

    fn write_repeated(&mut self, byte: u8, count: usize) -> Result<(), PrintError> {
        (0..count).try_for_each(|_| self.write_byte(byte))
    }

    /// Pad `text` to `width`, cutting it at `precision` characters and at its first zero.
    fn print_string(
        &mut self,
        text: &[u8],
        width: usize,
        precision: Option<usize>,
        left_justified: bool,
    ) -> Result<(), PrintError> {
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        let text = &text[..precision.map_or(end, |p| p.min(end))];
        let padding = width.saturating_sub(text.len());

        if !left_justified {
            self.write_repeated(b' ', padding)?;
        }
        self.write_bytes(text)?;
        if left_justified {
            self.write_repeated(b' ', padding)?;
        }
        Ok(())
    }

    fn print_wide_string(
        &mut self,
        text: &[u32],
        width: usize,
        precision: Option<usize>,
        left_justified: bool,
    ) -> Result<(), PrintError> {
        let end = text.iter().position(|&c| c == 0).unwrap_or(text.len());
        let text = &text[..precision.map_or(end, |p| p.min(end))];
        let padding = width.saturating_sub(text.len());

        if !left_justified {
            self.write_repeated(b' ', padding)?;
        }
        text.iter().try_for_each(|&ch| self.write_wide(ch))?;
        if left_justified {
            self.write_repeated(b' ', padding)?;
        }
        Ok(())
    }
}

/// How one conversion is to be rendered.
#[derive(Debug, Clone, Copy, Default)]
struct Properties {
    field_width: usize,
    precision: Option<usize>,
    /// Bytes of the integer argument that are significant.
    integer_size: usize,
    radix: u32,
    left_justified: bool,
    always_print_sign: bool,
    space_for_plus: bool,
    print_radix: bool,
    leading_zeros: bool,
    upper_case: bool,
    unsigned: bool,
    float_format: bool,
    scientific_format: bool,
    significant_digit_precision: bool,
}

const WORD: usize = core::mem::size_of::<usize>();

/// Parse a run of decimal digits at `*index`, saturating on overflow.
fn scan_decimal(format: &[u8], index: &mut usize) -> usize {
    let mut value: usize = 0;
    while let Some(&b) = format.get(*index).filter(|b| b.is_ascii_digit()) {
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
        *index += 1;
    }
    value
}

#[inline]
fn peek(format: &[u8], index: usize) -> u8 {
    format.get(index).copied().unwrap_or(0)
}

/// Read `*` or `*n$` for a width or precision. `*index` is just past the `*`.
fn star_argument(format: &[u8], index: &mut usize, args: &mut ArgumentCursor) -> Result<i64, PrintError> {
    if peek(format, *index).is_ascii_digit() {
        let position = scan_decimal(format, index);
        if position == 0 || peek(format, *index) != b'$' {
            return Err(PrintError::InvalidConversion);
        }
        *index += 1;
        args.get(position)?.int()
    } else {
        args.get(0)?.int()
    }
}

/// Expand the conversion starting at the `%` at `*index`, leaving `*index`
/// just past it.
fn convert_specifier<S: PrintSink + ?Sized>(
    ctx: &mut FormatContext<'_, S>,
    format: &[u8],
    index: &mut usize,
    args: &mut ArgumentCursor,
) -> Result<(), PrintError> {
    debug_assert_eq!(peek(format, *index), b'%');

    let mut props = Properties::default();
    let mut cur = *index + 1;
    let mut position = 0;

    // a leading number is either a position or the field width
    if matches!(peek(format, cur), b'1'..=b'9') {
        let value = scan_decimal(format, &mut cur);
        if peek(format, cur) == b'$' {
            position = value;
            cur += 1;
        } else {
            props.field_width = value;
        }
    }

    loop {
        match peek(format, cur) {
            // grouping is accepted and ignored
            b'\'' => {}
            b'-' => props.left_justified = true,
            b' ' => props.space_for_plus = true,
            b'+' => props.always_print_sign = true,
            b'#' => props.print_radix = true,
            b'0' => props.leading_zeros = true,
            _ => break,
        }
        cur += 1;
    }

    if peek(format, cur) == b'*' {
        cur += 1;
        let width = star_argument(format, &mut cur, args)?;
        if width < 0 {
            props.left_justified = true;
        }
        props.field_width = width.unsigned_abs().min(usize::MAX as u64) as usize;
    } else if matches!(peek(format, cur), b'1'..=b'9') {
        props.field_width = scan_decimal(format, &mut cur);
    }

    if props.left_justified {
        props.leading_zeros = false;
    }
    if props.always_print_sign {
        props.space_for_plus = false;
    }

    if peek(format, cur) == b'.' {
        cur += 1;
        if peek(format, cur) == b'*' {
            cur += 1;
            let precision = star_argument(format, &mut cur, args)?;
            // a negative precision counts as omitted
            props.precision = usize::try_from(precision).ok();
        } else {
            props.precision = Some(scan_decimal(format, &mut cur));
        }
    }

    let mut long_specified = false;
    props.integer_size = 4;
    match peek(format, cur) {
        b'h' => {
            cur += 1;
            props.integer_size = 2;
            if peek(format, cur) == b'h' {
                cur += 1;
                props.integer_size = 1;
            }
        }
        b'l' => {
            cur += 1;
            long_specified = true;
            props.integer_size = WORD;
            if peek(format, cur) == b'l' {
                cur += 1;
                long_specified = false;
                props.integer_size = 8;
            }
        }
        b'j' => {
            cur += 1;
            props.integer_size = 8;
        }
        b'z' | b't' => {
            cur += 1;
            props.integer_size = WORD;
        }
        b'L' => cur += 1,
        b'I' if peek(format, cur + 1) == b'6' && peek(format, cur + 2) == b'4' => {
            cur += 3;
            props.integer_size = 8;
        }
        _ => {}
    }

    let mut specifier = peek(format, cur);
    if long_specified {
        specifier = match specifier {
            b'c' => b'C',
            b's' => b'S',
            other => other,
        };
    }

    // the walk resumes after the specifier whatever happens below
    *index = cur + 1;

    props.unsigned = true;
    let mut is_integer = false;
    let mut is_float = false;
    match specifier {
        b'd' | b'i' => {
            is_integer = true;
            props.radix = 10;
            props.unsigned = false;
        }
        b'o' => {
            is_integer = true;
            props.radix = 8;
        }
        b'u' => {
            is_integer = true;
            props.radix = 10;
        }
        b'x' => {
            is_integer = true;
            props.radix = 16;
        }
        b'X' => {
            is_integer = true;
            props.radix = 16;
            props.upper_case = true;
        }
        b'p' => {
            is_integer = true;
            props.integer_size = WORD;
            props.radix = 16;
            props.upper_case = true;
            props.print_radix = true;
        }
        b'n' => {
            return match args.get(position)? {
                Argument::Count(cell) => {
                    cell.set(ctx.bytes_written.min(i32::MAX as usize) as i32);
                    Ok(())
                }
                _ => Err(PrintError::InvalidConversion),
            };
        }
        b'f' | b'F' => {
            is_float = true;
            props.float_format = true;
            props.upper_case = specifier == b'F';
        }
        b'g' | b'G' => {
            is_float = true;
            props.significant_digit_precision = true;
            props.upper_case = specifier == b'G';
        }
        b'e' | b'E' => {
            is_float = true;
            props.scientific_format = true;
            props.upper_case = specifier == b'E';
        }
        b'a' | b'A' => {
            is_float = true;
            props.scientific_format = true;
            props.radix = 16;
            props.upper_case = specifier == b'A';
        }
        b'C' => {
            ctx.state.reset();
            let ch = match args.get(position)? {
                Argument::WChar(ch) => ch,
                Argument::Char(ch) => ch as u32,
                other => other.integer_bits()? as u32,
            };
            return ctx.print_wide_string(&[ch], props.field_width, None, props.left_justified);
        }
        b'c' => {
            let ch = match args.get(position)? {
                Argument::Char(ch) => ch,
                other => other.integer_bits()? as u8,
            };
            return ctx.print_string(&[ch], props.field_width, None, props.left_justified);
        }
        b'S' => {
            ctx.state.reset();
            return match args.get(position)? {
                Argument::WStr(text) => ctx.print_wide_string(
                    text.unwrap_or(NULL_WIDE),
                    props.field_width,
                    props.precision,
                    props.left_justified,
                ),
                Argument::Str(text) => {
                    ctx.print_string(text.unwrap_or(NULL), props.field_width, props.precision, props.left_justified)
                }
                _ => Err(PrintError::InvalidConversion),
            };
        }
        b's' => {
            return match args.get(position)? {
                Argument::Str(text) => {
                    ctx.print_string(text.unwrap_or(NULL), props.field_width, props.precision, props.left_justified)
                }
                Argument::WStr(text) => ctx.print_wide_string(
                    text.unwrap_or(NULL_WIDE),
                    props.field_width,
                    props.precision,
                    props.left_justified,
                ),
                _ => Err(PrintError::InvalidConversion),
            };
        }
        b'%' => return ctx.print_string(b"%", props.field_width, None, props.left_justified),
        _ => {
            *index = cur;
            return Err(PrintError::InvalidConversion);
        }
    }

    if is_integer {
        let bits = args.get(position)?.integer_bits()?;
        integer::print_integer(ctx, bits, &props)
    } else {
        debug_assert!(is_float);
        let value = args.get(position)?.float()?;
        float::print_double(ctx, value, &props)
    }
}

const NULL: &[u8] = b"(null)";
const NULL_WIDE: &[u32] = &[b'(' as u32, b'n' as u32, b'u' as u32, b'l' as u32, b'l' as u32, b')' as u32];

/// Walk `format`, stopping at its end or its first zero byte.
///
/// Returns an error if a conversion could not be completed; everything up
/// to that point has been written.
pub fn format<S: PrintSink + ?Sized>(
    ctx: &mut FormatContext<'_, S>,
    format: &str,
    args: &[Argument],
) -> Result<(), PrintError> {
    let format = format.as_bytes();
    let mut cursor = ArgumentCursor::new(args);
    let mut index = 0;

    while index < format.len() && format[index] != 0 {
        if format[index] == b'%' {
            convert_specifier(ctx, format, &mut index, &mut cursor)?;
        } else {
            ctx.write_byte(format[index])?;
            index += 1;
        }
    }

    Ok(())
}

/// Format into `buf` using `encoding` for wide arguments.
///
/// Output that does not fit is dropped, and the buffer is always
/// zero-terminated when it has room for anything. Returns the length the
/// complete output would need, terminator included; pass `None` to measure.
pub fn format_string(buf: Option<&mut [u8]>, encoding: Encoding, fmt: &str, args: &[Argument]) -> usize {
    let capacity = buf.as_ref().map_or(0, |b| b.len());
    let mut sink = BufferSink::new(buf);
    let mut ctx = FormatContext::new(&mut sink, capacity.saturating_sub(1), encoding);

    if let Err(error) = format(&mut ctx, fmt, args) {
        log::trace!("[print] format {:?} stopped: {}", fmt, error);
    }

    let written = ctx.bytes_written;
    if capacity != 0 {
        sink.terminate_at(written.min(capacity - 1));
    }
    written + 1
}

/// [`format_string`] with the default encoding.
pub fn print_to_string(buf: Option<&mut [u8]>, fmt: &str, args: &[Argument]) -> usize {
    format_string(buf, Encoding::Default, fmt, args)
}

/// Format into a wide-character buffer. Narrow text is decoded with the
/// default encoding. Returns the length in characters, terminator included.
pub fn print_to_wide_string(buf: Option<&mut [u32]>, fmt: &str, args: &[Argument]) -> usize {
    let capacity = buf.as_ref().map_or(0, |b| b.len());
    let mut sink = WideBufferSink::new(buf);
    let mut ctx = FormatContext::new(&mut sink, capacity.saturating_sub(1), Encoding::Default);

    if let Err(error) = format(&mut ctx, fmt, args) {
        log::trace!("[print] wide format {:?} stopped: {}", fmt, error);
    }

    let written = ctx.bytes_written;
    if capacity != 0 {
        sink.terminate_at(written.min(capacity - 1));
    }
    written + 1
}
