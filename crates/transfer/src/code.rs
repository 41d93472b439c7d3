//! Short, human-typeable download codes.
//!
//! A code is a fixed-length base-21 number over an alphabet without
//! visually confusable glyphs. Generated values come from
//! `[BASE^(LEN-1) + 1, BASE^LEN)` so every code uses the full length.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

/// Code alphabet: no 0/O, l/1, B C D E G P T V Z, M N.
pub const ALPHABET: &[u8; 21] = b"23456789afhijkqrsuwxy";

/// Number of symbols in a code.
pub const CODE_LENGTH: usize = 5;

const BASE: u32 = ALPHABET.len() as u32;

/// Smallest generated value (inclusive).
pub const MIN_VALUE: u32 = BASE.pow(CODE_LENGTH as u32 - 1) + 1;

/// Largest representable value (exclusive).
pub const MAX_VALUE: u32 = BASE.pow(CODE_LENGTH as u32);

/// A validated, lowercase download code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShortCode(String);

impl ShortCode {
    /// Draws a fresh random code.
    ///
    /// Callers retry on registry collisions.
    pub fn generate() -> Self {
        let value = rand::thread_rng().gen_range(MIN_VALUE..MAX_VALUE);
        Self::encode(value)
    }

    /// Encodes `value`, least significant symbol first.
    ///
    /// Values at or above [`MAX_VALUE`] wrap; only the low
    /// [`CODE_LENGTH`] symbols are kept.
    pub fn encode(mut value: u32) -> Self {
        let mut encoded = String::with_capacity(CODE_LENGTH);
        for _ in 0..CODE_LENGTH {
            encoded.push(ALPHABET[(value % BASE) as usize] as char);
            value /= BASE;
        }
        Self(encoded)
    }

    /// Decodes a code, ignoring case.
    ///
    /// Returns `None` for empty input or anything that is not exactly
    /// [`CODE_LENGTH`] alphabet symbols.
    pub fn try_decode(encoded: &str) -> Option<u32> {
        if encoded.len() != CODE_LENGTH {
            return None;
        }
        let mut value = 0u32;
        for (i, b) in encoded.bytes().enumerate() {
            let digit = symbol_value(b.to_ascii_lowercase())?;
            value += digit * BASE.pow(i as u32);
        }
        Some(value)
    }

    /// Returns `true` if `encoded` is a syntactically valid code.
    pub fn check(encoded: &str) -> bool {
        Self::try_decode(encoded).is_some()
    }

    /// Parses and normalizes a code to lowercase.
    pub fn parse(encoded: &str) -> Option<Self> {
        Self::check(encoded).then(|| Self(encoded.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn symbol_value(b: u8) -> Option<u32> {
    ALPHABET.binary_search(&b).ok().map(|i| i as u32)
}

impl fmt::Display for ShortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ShortCode {
    type Err = InvalidCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidCode(s.to_string()))
    }
}

impl AsRef<str> for ShortCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Returned when a string is not a valid code.
#[derive(Debug, thiserror::Error)]
#[error("invalid download code: {0:?}")]
pub struct InvalidCode(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphabet_is_sorted() {
        // symbol_value relies on binary search.
        assert!(ALPHABET.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn encode_decode_full_range() {
        for value in MIN_VALUE..MAX_VALUE {
            let code = ShortCode::encode(value);
            assert_eq!(code.as_str().len(), CODE_LENGTH);
            assert_eq!(ShortCode::try_decode(code.as_str()), Some(value));
        }
    }

    #[test]
    fn generated_codes_are_valid() {
        for _ in 0..1000 {
            let code = ShortCode::generate();
            let value = ShortCode::try_decode(code.as_str()).unwrap();
            assert!((MIN_VALUE..MAX_VALUE).contains(&value));
        }
    }

    #[test]
    fn decode_blank() {
        assert_eq!(ShortCode::try_decode(""), None);
        assert!(!ShortCode::check(""));
    }

    #[test]
    fn decode_invalid() {
        // b, c, d and e are excluded.
        assert!(!ShortCode::check("abcde"));
        assert!(!ShortCode::check("0o1l2"));
    }

    #[test]
    fn decode_wrong_length() {
        assert!(!ShortCode::check("9fak"));
        assert!(!ShortCode::check("9fakrr"));
    }

    #[test]
    fn decode_is_case_insensitive() {
        let code = ShortCode::encode(MIN_VALUE + 4242);
        let upper = code.as_str().to_ascii_uppercase();
        assert_eq!(
            ShortCode::try_decode(&upper),
            ShortCode::try_decode(code.as_str())
        );
        assert_eq!(ShortCode::parse(&upper), Some(code));
    }

    #[test]
    fn decode_rejects_multibyte_input() {
        assert!(!ShortCode::check("9fäk"));
    }

    #[test]
    fn from_str_round_trip() {
        let code: ShortCode = "9FAKR".parse().unwrap();
        assert_eq!(code.to_string(), "9fakr");
        assert!("hello".parse::<ShortCode>().is_err());
    }
}
