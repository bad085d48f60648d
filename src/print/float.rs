//! `%e`, `%f`, `%g` and `%a` conversions of IEEE-754 doubles.

use super::{FormatContext, PrintError, PrintSink, Properties};

const DEFAULT_FLOAT_PRECISION: i32 = 6;
/// `%g` switches to scientific form below this decimal exponent.
const SCIENTIFIC_NOTATION_AUTO_LOWER_LIMIT: i32 = -4;
/// Digits worth extracting from a double.
const MAX_DOUBLE_DIGITS_SIZE: usize = 15;
const LOG10_2: f64 = 0.30103;

const SIGN_BIT: u64 = 1 << 63;
const EXPONENT_SHIFT: u32 = 52;
const EXPONENT_MASK: u64 = 0x7FF << EXPONENT_SHIFT;
const EXPONENT_BIAS: i32 = 1023;
const SIGNIFICAND_MASK: u64 = (1 << EXPONENT_SHIFT) - 1;
const SIGNIFICAND_HEX_DIGITS: usize = 13;

/// Subnormals are lifted by this before scaling so no precision is lost.
const SUBNORMAL_SCALE: f64 = (1u64 << 54) as f64;

/// Multiply `value` by `10^power` in steps, dividing for negative powers,
/// so no intermediate overflows on the way to a result in range.
fn scale_by_power_of_ten(mut value: f64, power: i32) -> f64 {
    let mut remaining = power;
    while remaining >= 10 {
        value *= 1.0e10;
        remaining -= 10;
    }
    while remaining > 0 {
        value *= 10.0;
        remaining -= 1;
    }
    while remaining <= -10 {
        value /= 1.0e10;
        remaining += 10;
    }
    while remaining < 0 {
        value /= 10.0;
        remaining += 1;
    }
    value
}

/// Split a finite, non-negative `value` into a decimal exponent and a
/// mantissa in `[1, 10)`. Zero gives `(0, 0.0)`.
fn base10_exponent(value: f64) -> (i32, f64) {
    if value == 0.0 {
        return (0, 0.0);
    }

    let (value, lift, unlift) = if value.to_bits() & EXPONENT_MASK == 0 {
        (value * SUBNORMAL_SCALE, 54, 1.0 / SUBNORMAL_SCALE)
    } else {
        (value, 0, 1.0)
    };

    let base2 = ((value.to_bits() & EXPONENT_MASK) >> EXPONENT_SHIFT) as i32 - EXPONENT_BIAS - lift;
    let mut exponent = (base2 as f64 * LOG10_2) as i32;
    let mut mantissa = scale_by_power_of_ten(value, -exponent) * unlift;

    while mantissa >= 10.0 {
        mantissa /= 10.0;
        exponent += 1;
    }
    while mantissa < 1.0 {
        mantissa *= 10.0;
        exponent -= 1;
    }

    (exponent, mantissa)
}

fn sign_prefix(negative: bool, props: &Properties) -> Option<u8> {
    if negative {
        Some(b'-')
    } else if props.always_print_sign {
        Some(b'+')
    } else if props.space_for_plus {
        Some(b' ')
    } else {
        None
    }
}

/// Render `marker`, a sign and the decimal exponent into `out`, with at
/// least `min_digits` digits. Returns the length used.
fn format_exponent(out: &mut [u8; 8], marker: u8, exponent: i32, min_digits: usize) -> usize {
    out[0] = marker;
    out[1] = if exponent < 0 { b'-' } else { b'+' };

    let mut magnitude = exponent.unsigned_abs();
    let mut digits = [b'0'; 5];
    let mut count = 0;
    while magnitude != 0 || count < min_digits {
        digits[count] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        count += 1;
    }

    for i in 0..count {
        out[2 + i] = digits[count - 1 - i];
    }
    2 + count
}

pub(super) fn print_double<S: PrintSink + ?Sized>(
    ctx: &mut FormatContext<'_, S>,
    value: f64,
    props: &Properties,
) -> Result<(), PrintError> {
    let bits = value.to_bits();

    if bits & EXPONENT_MASK == EXPONENT_MASK {
        let text: &[u8] = match (value.is_nan(), props.upper_case) {
            (true, false) => b"nan",
            (true, true) => b"NAN",
            (false, false) => b"inf",
            (false, true) => b"INF",
        };

        let mut buf = [0u8; 4];
        let mut length = 0;
        if let Some(sign) = sign_prefix(!value.is_nan() && value < 0.0, props) {
            buf[0] = sign;
            length = 1;
        }
        buf[length..length + 3].copy_from_slice(text);

        return ctx.print_string(&buf[..length + 3], props.field_width, None, props.left_justified);
    }

    if props.radix == 16 {
        return print_hex_double(ctx, value, props);
    }

    let significant = props.significant_digit_precision;
    let mut precision = props.precision.map_or(DEFAULT_FLOAT_PRECISION, |p| p.min(i32::MAX as usize) as i32);
    if significant && precision == 0 {
        precision = 1;
    }

    let negative = bits & SIGN_BIT != 0;
    let (mut exponent, mut mantissa) = base10_exponent(f64::from_bits(bits & !SIGN_BIT));

    let mut print_exponent = props.scientific_format;
    if !print_exponent
        && !props.float_format
        && (exponent < SCIENTIFIC_NOTATION_AUTO_LOWER_LIMIT || exponent >= precision)
    {
        print_exponent = true;
    }

    // %f of a value below half the last printed place shows only zeros
    if !print_exponent && !significant && exponent < -(precision.saturating_add(1)) {
        mantissa = 0.0;
    }

    let mut digits = [0u8; MAX_DOUBLE_DIGITS_SIZE];
    let mut digit_count = 0;
    if mantissa != 0.0 {
        // half of the last printed place, relative to the leading digit
        let last_place = if significant {
            precision - 1
        } else if print_exponent {
            precision
        } else {
            precision.saturating_add(exponent)
        };

        // past this many places the half is below the smallest double
        mantissa += scale_by_power_of_ten(0.5, -last_place.min(400));

        // rounding can carry into the next power of ten, as with 9.9999999
        if mantissa >= 10.0 {
            mantissa /= 10.0;
            exponent += 1;
        }

        while mantissa != 0.0 && digit_count < MAX_DOUBLE_DIGITS_SIZE {
            let digit = (mantissa as i32).clamp(0, 9);
            digits[digit_count] = b'0' + digit as u8;
            digit_count += 1;
            mantissa = (mantissa - digit as f64) * 10.0;
        }

        // drop digits only the rounding amount produced
        if significant && digit_count > precision as usize {
            digit_count = precision as usize;
        }

        while digit_count > 1 && digits[digit_count - 1] == b'0' {
            digit_count -= 1;
        }
    }

    let mut prefix = sign_prefix(negative, props);

    // %g caps both the significant digits and the precision at each other,
    // so %.4g prints 0.01 as 0.01 and 0.0123456 as 0.01235
    let mut significant_digits = digit_count as i32;
    if significant {
        significant_digits = significant_digits.min(precision);
        if precision > significant_digits {
            precision = significant_digits;

            // 100 has one significant digit but all three must print
            if !print_exponent && exponent + 1 > precision {
                precision = exponent + 1;
            }
            if precision == 0 {
                precision = 1;
            }
        }
    }

    let mut number_length = precision;
    if props.print_radix {
        number_length += 1;
    } else if significant {
        if print_exponent {
            if precision > 1 {
                number_length += 1;
            }
        } else if exponent < 0 || (exponent + 1) - significant_digits < 0 {
            number_length += 1;
        }
    } else if precision != 0 {
        number_length += 1;
    }

    let mut exponent_text = [0u8; 8];
    let mut exponent_length = 0;
    if print_exponent {
        let marker = if props.upper_case { b'E' } else { b'e' };
        exponent_length = format_exponent(&mut exponent_text, marker, exponent, 2);
        number_length += exponent_length as i32;
        if !significant {
            number_length += 1;
        }
    } else if exponent >= 0 {
        if !significant {
            number_length += exponent + 1;
        }
    } else {
        number_length += 1;
        // make the precision count fractional digits again
        if significant {
            precision += -exponent - 1;
            number_length += -exponent - 1;
        }
    }

    if prefix.is_some() {
        number_length += 1;
    }

    let mut field_count = props.field_width.saturating_sub(number_length.max(0) as usize);

    if props.left_justified || props.leading_zeros {
        if let Some(sign) = prefix.take() {
            ctx.write_byte(sign)?;
        }
    }

    if !props.left_justified || props.leading_zeros {
        let pad = if props.leading_zeros { b'0' } else { b' ' };
        ctx.write_repeated(pad, field_count)?;
        field_count = 0;
    }

    if let Some(sign) = prefix {
        ctx.write_byte(sign)?;
    }

    let mut index = 0;
    let next_digit = |index: &mut usize| {
        if *index < digit_count {
            *index += 1;
            digits[*index - 1]
        } else {
            b'0'
        }
    };

    if print_exponent {
        let first = next_digit(&mut index);
        ctx.write_byte(first)?;

        if significant && precision != 0 {
            precision -= 1;
        }
        if precision != 0 || props.print_radix {
            ctx.write_byte(b'.')?;
        }
        for _ in 0..precision {
            let digit = next_digit(&mut index);
            ctx.write_byte(digit)?;
        }

        ctx.write_bytes(&exponent_text[..exponent_length])?;
    } else {
        let mut current = exponent;
        if exponent >= 0 {
            while current >= 0 {
                let digit = next_digit(&mut index);
                ctx.write_byte(digit)?;
                current -= 1;
                if significant && precision != 0 {
                    precision -= 1;
                }
            }
        } else {
            ctx.write_byte(b'0')?;
            current = -1;
        }

        if precision != 0 || props.print_radix {
            ctx.write_byte(b'.')?;
        }

        for _ in 0..precision {
            // leading zeros of something like 0.000012345
            let digit = if current > exponent { b'0' } else { next_digit(&mut index) };
            ctx.write_byte(digit)?;
            current -= 1;
        }
    }

    ctx.write_repeated(b' ', field_count)
}

/// `[-]0xh.hhhhp±d`: the leading digit is `1` for normal values and `0`
/// for zero and subnormals, whose exponent is pinned at -1022.
fn print_hex_double<S: PrintSink + ?Sized>(
    ctx: &mut FormatContext<'_, S>,
    value: f64,
    props: &Properties,
) -> Result<(), PrintError> {
    let bits = value.to_bits();
    let negative = bits & SIGN_BIT != 0;
    let biased = ((bits & EXPONENT_MASK) >> EXPONENT_SHIFT) as i32;

    let mut precision = props.precision.map(|p| p.min(i32::MAX as usize) as i32);
    let mut digits = [b'0'; SIGNIFICAND_HEX_DIGITS];
    let mut integer_portion = b'0';
    let mut exponent = 0;

    if value != 0.0 {
        let mut significand = bits & SIGNIFICAND_MASK;
        if biased == 0 {
            exponent = 1 - EXPONENT_BIAS;
        } else {
            integer_portion = b'1';
            exponent = biased - EXPONENT_BIAS;
        }

        // add half of the first digit past the precision
        if let Some(p) = precision {
            let half = 1u64 << (EXPONENT_SHIFT - 1);
            let rounding = half.checked_shr(4 * p.min(16) as u32).unwrap_or(0);
            significand += rounding;
            if significand >= 1 << EXPONENT_SHIFT {
                significand -= 1 << EXPONENT_SHIFT;
                integer_portion += 1;
            }
        }

        for (i, digit) in digits.iter_mut().rev().enumerate() {
            let nibble = ((significand >> (i * 4)) & 0xF) as u8;
            *digit = match nibble {
                0..=9 => b'0' + nibble,
                _ if props.upper_case => b'A' + nibble - 10,
                _ => b'a' + nibble - 10,
            };
        }

        if precision.is_none() {
            let mut p = SIGNIFICAND_HEX_DIGITS;
            while p > 0 && digits[p - 1] == b'0' {
                p -= 1;
            }
            precision = Some(p as i32);
        }
    }

    let precision = precision.unwrap_or(0) as usize;

    let mut prefix = [0u8; 3];
    let mut prefix_size = 0;
    if let Some(sign) = sign_prefix(negative, props) {
        prefix[0] = sign;
        prefix_size = 1;
    }
    prefix[prefix_size] = b'0';
    prefix[prefix_size + 1] = if props.upper_case { b'X' } else { b'x' };
    prefix_size += 2;

    let radix = props.print_radix || precision != 0;

    let mut exponent_text = [0u8; 8];
    let marker = if props.upper_case { b'P' } else { b'p' };
    let exponent_length = format_exponent(&mut exponent_text, marker, exponent, 1);

    let number_length = 1 + precision + radix as usize + exponent_length;
    let mut field_count = props.field_width.saturating_sub(number_length + prefix_size);

    if !props.left_justified || props.leading_zeros {
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
    ctx.write_byte(integer_portion)?;
    if radix {
        ctx.write_byte(b'.')?;
    }
    for i in 0..precision {
        ctx.write_byte(digits.get(i).copied().unwrap_or(b'0'))?;
    }
    ctx.write_bytes(&exponent_text[..exponent_length])?;
    ctx.write_repeated(b' ', field_count)
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use super::*;

    fn check(format: &str, args: &[Argument], expected: &str) {
        let mut buf = [0u8; 128];
        let size = print_to_string(Some(&mut buf), format, args);
        assert_eq!(
            core::str::from_utf8(&buf[..size - 1]).unwrap(),
            expected,
            "format {:?}",
            format
        );
    }

    #[test]
    fn exponent_estimate() {
        assert_eq!(base10_exponent(0.0), (0, 0.0));
        assert_eq!(base10_exponent(1.0), (0, 1.0));
        assert_eq!(base10_exponent(12345.678).0, 4);
        assert_eq!(base10_exponent(0.5), (-1, 5.0));
        assert_eq!(base10_exponent(0.001).0, -3);

        for (value, exponent) in [
            (f64::MAX, 308),
            (f64::MIN_POSITIVE, -308),
            (f64::from_bits(1), -324),
            (1e-320, -321),
        ] {
            let (found, mantissa) = base10_exponent(value);
            assert_eq!(found, exponent, "{:e}", value);
            assert!((1.0..10.0).contains(&mantissa), "{:e} -> {}", value, mantissa);
        }
    }

    #[test]
    fn hex_floats() {
        check("%a", &[Argument::Float(1.0)], "0x1p+0");
        check("%a", &[Argument::Float(-0.1)], "-0x1.999999999999ap-4");
        check("%.3a", &[Argument::Float(1.0 / 3.0)], "0x1.555p-2");
        check("%A", &[Argument::Float(-0.1)], "-0X1.999999999999AP-4");
        check("%a", &[Argument::Float(0.0)], "0x0p+0");
        check("%a", &[Argument::Float(-0.0)], "-0x0p+0");
        check("%a", &[Argument::Float(1024.0)], "0x1p+10");
        check("%.0a", &[Argument::Float(1.75)], "0x2p+0");
        check("%#a", &[Argument::Float(1.0)], "0x1.p+0");
        check("%a", &[Argument::Float(f64::from_bits(1))], "0x0.0000000000001p-1022");
        check("[%12a]", &[Argument::Float(1.0)], "[      0x1p+0]");
        check("[%012a]", &[Argument::Float(-1.0)], "[-0x000001p+0]");
    }

    #[test]
    fn fixed_and_scientific() {
        check("%f", &[Argument::Float(3.14159)], "3.141590");
        check("%.2f", &[Argument::Float(2.5)], "2.50");
        check("%.0f", &[Argument::Float(7.0)], "7");
        check("%#.0f", &[Argument::Float(7.0)], "7.");
        check("%f", &[Argument::Float(0.0)], "0.000000");
        check("%f", &[Argument::Float(-1.5)], "-1.500000");
        check("%.3f", &[Argument::Float(0.0625)], "0.062");
        check("%e", &[Argument::Float(12345.678)], "1.234568e+04");
        check("%E", &[Argument::Float(0.00025)], "2.500000E-04");
        check("%.1e", &[Argument::Float(1.0)], "1.0e+00");
        check("[%10.2f]", &[Argument::Float(-1.5)], "[     -1.50]");
        check("[%-8.1f]", &[Argument::Float(1.5)], "[1.5     ]");
        check("[%08.2f]", &[Argument::Float(-1.5)], "[-0001.50]");
        check("%+.1f", &[Argument::Float(1.5)], "+1.5");
    }

    #[test]
    fn general_form() {
        check("%g", &[Argument::Float(100.0)], "100");
        check("%g", &[Argument::Float(0.5)], "0.5");
        check("%g", &[Argument::Float(1e-5)], "1e-05");
        check("%g", &[Argument::Float(123456789.0)], "1.23457e+08");
        check("%.4g", &[Argument::Float(0.01)], "0.01");
        check("%G", &[Argument::Float(1e-10)], "1E-10");
        check("%g", &[Argument::Float(0.0)], "0");
    }

    #[test]
    fn extreme_magnitudes() {
        let cases: &[(&str, f64, &str)] = &[
            ("%f", 1e-7, "0.000000"),
            ("%f", 9.5e-7, "0.000001"),
            ("%f", 1e-10, "0.000000"),
            ("%f", -1e-10, "-0.000000"),
            ("%f", 1e-300, "0.000000"),
            ("%f", f64::from_bits(1), "0.000000"),
            ("%.10f", 1e-10, "0.0000000001"),
            ("[%9.1f]", -1e-300, "[     -0.0]"),
            ("%e", f64::from_bits(1), "4.940656e-324"),
            ("%e", -f64::from_bits(1), "-4.940656e-324"),
            ("%g", 1e-320, "9.99989e-321"),
            ("%g", f64::MIN_POSITIVE, "2.22507e-308"),
            ("%e", f64::MAX, "1.797693e+308"),
            ("%g", f64::MAX, "1.79769e+308"),
            ("%.3e", 9.9996, "1.000e+01"),
        ];

        for &(format, value, expected) in cases {
            check(format, &[Argument::Float(value)], expected);
        }
    }

    #[test]
    fn largest_double_in_fixed_form() {
        let args = [Argument::Float(f64::MAX)];
        // 309 integer digits, the point and six zeros
        assert_eq!(print_to_string(None, "%f", &args), 316 + 1);

        let mut buf = [0u8; 11];
        print_to_string(Some(&mut buf), "%f", &args);
        assert_eq!(&buf[..10], b"1797693134");
    }

    #[test]
    fn non_numbers() {
        check("%f", &[Argument::Float(f64::NAN)], "nan");
        check("%F", &[Argument::Float(f64::INFINITY)], "INF");
        check("%e", &[Argument::Float(f64::NEG_INFINITY)], "-inf");
        check("%+f", &[Argument::Float(f64::INFINITY)], "+inf");
        check("[%6f]", &[Argument::Float(f64::INFINITY)], "[   inf]");
        check("%.1f", &[Argument::Float(f64::INFINITY)], "inf");
    }
}
