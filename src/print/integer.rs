use super::{FormatContext, PrintError, PrintSink, Properties};

/// Enough digits for a 64-bit value in octal, plus slack.
const MAX_INTEGER_STRING_SIZE: usize = 23;

/// Reinterpret `bits` at the conversion's width, sign-extending signed values.
fn fit_to_size(bits: u64, size: usize, unsigned: bool) -> u64 {
    match (size, unsigned) {
        (1, false) => bits as i8 as i64 as u64,
        (2, false) => bits as i16 as i64 as u64,
        (4, false) => bits as i32 as i64 as u64,
        (1, true) => bits as u8 as u64,
        (2, true) => bits as u16 as u64,
        (4, true) => bits as u32 as u64,
        _ => bits,
    }
}

/// Write `bits` with sign, radix prefix, precision zeros and field padding:
/// `{spaces}{prefix}{zeros}{digits}{spaces}`.
pub(super) fn print_integer<S: PrintSink + ?Sized>(
    ctx: &mut FormatContext<'_, S>,
    bits: u64,
    props: &Properties,
) -> Result<(), PrintError> {
    let mut value = fit_to_size(bits, props.integer_size, props.unsigned);
    let precision = props.precision.unwrap_or(1);
    let radix = props.radix as u64;
    let print_radix = props.print_radix && value != 0;

    let mut digits = [0u8; MAX_INTEGER_STRING_SIZE];
    let mut length = 0;
    let mut negative = false;

    if value != 0 || precision != 0 {
        if !props.unsigned && (value as i64) < 0 {
            negative = true;
            value = (value as i64).unsigned_abs();
        }

        loop {
            let digit = (value % radix) as u8;
            digits[length] = match digit {
                0..=9 => b'0' + digit,
                _ if props.upper_case => b'A' + digit - 10,
                _ => b'a' + digit - 10,
            };
            length += 1;
            value /= radix;
            if value == 0 {
                break;
            }
        }

        digits[..length].reverse();
    }

    let mut prefix = [0u8; 4];
    let mut prefix_size = 0;
    if negative {
        prefix[prefix_size] = b'-';
        prefix_size += 1;
    } else if props.always_print_sign {
        prefix[prefix_size] = b'+';
        prefix_size += 1;
    } else if props.space_for_plus {
        prefix[prefix_size] = b' ';
        prefix_size += 1;
    }

    if print_radix {
        if radix == 8 {
            if digits[0] != b'0' {
                prefix[prefix_size] = b'0';
                prefix_size += 1;
            }
        } else if radix == 16 {
            prefix[prefix_size] = b'0';
            prefix[prefix_size + 1] = if props.upper_case { b'X' } else { b'x' };
            prefix_size += 2;
        }
    }

    let precision_count = precision.saturating_sub(length);
    let mut field_count = props.field_width.saturating_sub(length + prefix_size + precision_count);

    if !props.left_justified || props.leading_zeros {
        // zero padding goes after the sign, or -0001 would come out as 00-1
        let pad = if props.leading_zeros {
            ctx.write_bytes(&prefix[..prefix_size])?;
            prefix_size = 0;
            b'0'
        } else {
            b' '
        };

        ctx.write_repeated(pad, field_count)?;
        field_count = 0;
    }

    ctx.write_bytes(&prefix[..prefix_size])?;
    ctx.write_repeated(b'0', precision_count)?;
    ctx.write_bytes(&digits[..length])?;
    ctx.write_repeated(b' ', field_count)
}
