//! Arbitrary-width integers as they appear in pickles.
//!
//! Values that fit in an `i64` stay native; anything wider is kept as its
//! exact decimal text, which is all the JSON projection needs.

use std::cmp::Ordering;
use std::fmt;

/// An integer of any width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integer {
    /// Fits in 64 bits.
    Small(i64),
    /// Wider than 64 bits, as normalized decimal text (optional `-`, no
    /// leading zeros).
    Big(String),
}

impl Integer {
    /// Decodes a little-endian two's-complement byte string (LONG1/LONG4).
    ///
    /// An empty byte string is zero.
    pub fn from_le_twos_complement(bytes: &[u8]) -> Self {
        let Some(&last) = bytes.last() else {
            return Self::Small(0);
        };
        let negative = last & 0x80 != 0;

        if bytes.len() <= 8 {
            let fill = if negative { 0xff } else { 0x00 };
            let mut buf = [fill; 8];
            buf[..bytes.len()].copy_from_slice(bytes);
            return Self::Small(i64::from_le_bytes(buf));
        }

        let mut magnitude = bytes.to_vec();
        if negative {
            negate_le(&mut magnitude);
        }
        let digits = le_bytes_to_decimal(&magnitude);
        Self::from_decimal_digits(negative, &digits)
    }

    /// Parses decimal text such as `-12` or `123456789012345678901234`.
    ///
    /// Returns `None` if the text is not an optionally signed run of ASCII
    /// digits.
    pub fn parse_decimal(text: &str) -> Option<Self> {
        let (negative, digits) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self::from_decimal_digits(negative, digits))
    }

    fn from_decimal_digits(negative: bool, digits: &str) -> Self {
        let trimmed = digits.trim_start_matches('0');
        if trimmed.is_empty() {
            return Self::Small(0);
        }
        let text = if negative {
            format!("-{trimmed}")
        } else {
            trimmed.to_string()
        };
        match text.parse::<i64>() {
            Ok(value) => Self::Small(value),
            Err(_) => Self::Big(text),
        }
    }

    /// Returns the value as an `i64` if it fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Small(v) => Some(*v),
            Self::Big(_) => None,
        }
    }

    /// Returns true for zero.
    pub fn is_zero(&self) -> bool {
        matches!(self, Self::Small(0))
    }

    /// Approximates the value as a double.
    pub fn to_f64(&self) -> f64 {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Small(v) => *v as f64,
            Self::Big(text) => text.parse().unwrap_or(f64::NAN),
        }
    }

    fn is_negative(&self) -> bool {
        match self {
            Self::Small(v) => *v < 0,
            Self::Big(text) => text.starts_with('-'),
        }
    }

    /// Numeric comparison.
    pub fn cmp_value(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Small(a), Self::Small(b)) => a.cmp(b),
            _ => {
                let (a_neg, b_neg) = (self.is_negative(), other.is_negative());
                if a_neg != b_neg {
                    return if a_neg { Ordering::Less } else { Ordering::Greater };
                }
                let a = self.to_string();
                let b = other.to_string();
                let a_mag = a.trim_start_matches('-');
                let b_mag = b.trim_start_matches('-');
                let by_magnitude = a_mag.len().cmp(&b_mag.len()).then_with(|| a_mag.cmp(b_mag));
                if a_neg {
                    by_magnitude.reverse()
                } else {
                    by_magnitude
                }
            }
        }
    }
}

impl fmt::Display for Integer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small(v) => write!(f, "{v}"),
            Self::Big(text) => f.write_str(text),
        }
    }
}

impl From<i64> for Integer {
    fn from(value: i64) -> Self {
        Self::Small(value)
    }
}

/// Two's-complement negation in place.
fn negate_le(bytes: &mut [u8]) {
    let mut carry = true;
    for byte in bytes.iter_mut() {
        let (sum, overflow) = (!*byte).overflowing_add(u8::from(carry));
        *byte = sum;
        carry = overflow;
    }
}

/// Converts an unsigned little-endian magnitude to decimal digits.
fn le_bytes_to_decimal(bytes: &[u8]) -> String {
    // Base 2^32 limbs, most significant first.
    let mut limbs: Vec<u32> = bytes
        .chunks(4)
        .rev()
        .map(|chunk| {
            let mut buf = [0u8; 4];
            buf[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(buf)
        })
        .collect();

    const CHUNK: u64 = 1_000_000_000;
    let mut parts = Vec::new();
    while limbs.iter().any(|&l| l != 0) {
        let mut remainder = 0u64;
        for limb in limbs.iter_mut() {
            let acc = (remainder << 32) | u64::from(*limb);
            #[allow(clippy::cast_possible_truncation)]
            {
                *limb = (acc / CHUNK) as u32;
            }
            remainder = acc % CHUNK;
        }
        parts.push(remainder);
        while limbs.first() == Some(&0) {
            limbs.remove(0);
        }
    }

    let Some((most, rest)) = parts.split_last() else {
        return "0".to_string();
    };
    let mut out = most.to_string();
    for part in rest.iter().rev() {
        out.push_str(&format!("{part:09}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_from_long1() {
        assert_eq!(Integer::from_le_twos_complement(&[]), Integer::Small(0));
        assert_eq!(Integer::from_le_twos_complement(&[0xff]), Integer::Small(-1));
        assert_eq!(Integer::from_le_twos_complement(&[0x00, 0x80]), Integer::Small(-32768));
        assert_eq!(Integer::from_le_twos_complement(&[0xff, 0x00]), Integer::Small(255));
    }

    #[test]
    fn wide_values_keep_every_digit() {
        // 1 << 90
        let mut bytes = vec![0u8; 12];
        bytes[11] = 0x04;
        assert_eq!(
            Integer::from_le_twos_complement(&bytes),
            Integer::Big("1237940039285380274899124224".into())
        );

        // -(1 << 70)
        let mut bytes = vec![0u8; 9];
        bytes[8] = 0xc0;
        assert_eq!(
            Integer::from_le_twos_complement(&bytes),
            Integer::Big("-1180591620717411303424".into())
        );
    }

    #[test]
    fn nine_byte_values_that_fit_stay_small() {
        // 2^63 - 1 padded with a sign byte.
        let bytes = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f, 0x00];
        assert_eq!(Integer::from_le_twos_complement(&bytes), Integer::Small(i64::MAX));
    }

    #[test]
    fn parse_decimal_normalizes() {
        assert_eq!(Integer::parse_decimal("0012"), Some(Integer::Small(12)));
        assert_eq!(Integer::parse_decimal("-0"), Some(Integer::Small(0)));
        assert_eq!(
            Integer::parse_decimal("1152921504606846976000"),
            Some(Integer::Big("1152921504606846976000".into()))
        );
        assert_eq!(Integer::parse_decimal("12a"), None);
        assert_eq!(Integer::parse_decimal(""), None);
    }

    #[test]
    fn ordering_spans_widths() {
        let big = Integer::parse_decimal("99999999999999999999").unwrap();
        let neg_big = Integer::parse_decimal("-99999999999999999999").unwrap();
        assert_eq!(Integer::Small(5).cmp_value(&big), Ordering::Less);
        assert_eq!(neg_big.cmp_value(&Integer::Small(-5)), Ordering::Less);
        assert_eq!(big.cmp_value(&big.clone()), Ordering::Equal);
    }
}
