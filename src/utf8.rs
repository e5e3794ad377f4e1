//! UTF-8 validation for text payloads
//!
//! One-shot validation uses the `simdutf8` crate. Text messages arriving in
//! fragments, and close reasons split by chopped writes, go through
//! [`Utf8Validator`], which keeps its state between chunks and reports the
//! exact octet where validation failed (the fail-fast cases depend on it).

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Check if data is valid UTF-8, allowing an incomplete sequence at the end
///
/// Returns:
/// - (true, n) if all complete sequences are valid, where n is the number of
///   trailing bytes that form an incomplete sequence (0-3 bytes)
/// - (false, 0) if there's an invalid UTF-8 sequence
pub fn validate_utf8_incomplete(data: &[u8]) -> (bool, usize) {
    let mut validator = Utf8Validator::new();
    let status = validator.validate(data);
    if !status.valid {
        return (false, 0);
    }
    (true, validator.pending as usize)
}

/// Outcome of feeding one chunk to a [`Utf8Validator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utf8Status {
    /// No invalid sequence seen so far
    pub valid: bool,
    /// The input so far ends on a code point boundary
    pub ends_on_codepoint: bool,
    /// Octets of this chunk consumed (the failing octet's index on error)
    pub index: usize,
    /// Octets consumed across all chunks since the last reset
    pub total: usize,
}

/// Incremental UTF-8 validator
///
/// Tracks the number of continuation bytes still expected and the legal
/// range of the next one, which is how overlongs, surrogates and code
/// points above U+10FFFF are rejected at the first offending octet.
#[derive(Debug, Clone)]
pub struct Utf8Validator {
    need: u8,
    pending: u8,
    lower: u8,
    upper: u8,
    total: usize,
    failed: bool,
}

impl Default for Utf8Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self {
            need: 0,
            pending: 0,
            lower: 0x80,
            upper: 0xBF,
            total: 0,
            failed: false,
        }
    }

    /// Forget all state, ready for a new message
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed the next chunk of a text payload
    pub fn validate(&mut self, data: &[u8]) -> Utf8Status {
        if self.failed {
            return Utf8Status {
                valid: false,
                ends_on_codepoint: false,
                index: 0,
                total: self.total,
            };
        }

        for (i, &b) in data.iter().enumerate() {
            if self.need == 0 {
                let (need, lower, upper) = match b {
                    0x00..=0x7F => continue,
                    0xC2..=0xDF => (1, 0x80, 0xBF),
                    0xE0 => (2, 0xA0, 0xBF),
                    0xE1..=0xEC | 0xEE..=0xEF => (2, 0x80, 0xBF),
                    0xED => (2, 0x80, 0x9F),
                    0xF0 => (3, 0x90, 0xBF),
                    0xF1..=0xF3 => (3, 0x80, 0xBF),
                    0xF4 => (3, 0x80, 0x8F),
                    _ => return self.fail(i),
                };
                self.need = need;
                self.pending = 1;
                self.lower = lower;
                self.upper = upper;
            } else {
                if b < self.lower || b > self.upper {
                    return self.fail(i);
                }
                self.lower = 0x80;
                self.upper = 0xBF;
                self.need -= 1;
                self.pending = if self.need == 0 { 0 } else { self.pending + 1 };
            }
        }

        self.total += data.len();
        Utf8Status {
            valid: true,
            ends_on_codepoint: self.need == 0,
            index: data.len(),
            total: self.total,
        }
    }

    fn fail(&mut self, index: usize) -> Utf8Status {
        self.failed = true;
        self.total += index;
        Utf8Status {
            valid: false,
            ends_on_codepoint: false,
            index,
            total: self.total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_ascii() {
        assert!(validate_utf8(b"Hello, World!"));
        assert!(validate_utf8(b""));
    }

    #[test]
    fn test_valid_multibyte() {
        assert!(validate_utf8("Hello-µ@ßöäüàá-UTF-8!!".as_bytes()));
        assert!(validate_utf8("κόσμε".as_bytes()));
        assert!(validate_utf8(b"\xf0\xa4\xad\xa2"));
    }

    #[test]
    fn test_invalid_utf8() {
        assert!(!validate_utf8(b"\xff"));
        assert!(!validate_utf8(b"\xc0\xaf"));
        assert!(!validate_utf8(b"\xed\xa0\x80"));
        assert!(!validate_utf8(b"\xf4\x90\x80\x80"));
    }

    #[test]
    fn test_incremental_positions() {
        let mut v = Utf8Validator::new();
        let s = v.validate("µ@ßöäüàá".as_bytes());
        assert_eq!((s.valid, s.ends_on_codepoint, s.index, s.total), (true, true, 15, 15));

        v.reset();
        let s = v.validate(b"\xF5");
        assert_eq!((s.valid, s.ends_on_codepoint, s.index, s.total), (false, false, 0, 0));

        v.reset();
        let s = v.validate(b"edited");
        assert_eq!((s.valid, s.index, s.total), (true, 6, 6));
        let s = v.validate(b"\xED\xA0\x80");
        assert_eq!((s.valid, s.index, s.total), (false, 1, 7));

        v.reset();
        assert!(v.validate(b"edit").valid);
        let s = v.validate(b"\x65\x64\xED\xA0\x80");
        assert_eq!((s.valid, s.index, s.total), (false, 3, 7));

        v.reset();
        let s = v.validate(b"edited\xED");
        assert_eq!((s.valid, s.ends_on_codepoint, s.index, s.total), (true, false, 7, 7));
        let s = v.validate(b"\xA0\x80");
        assert_eq!((s.valid, s.ends_on_codepoint, s.index, s.total), (false, false, 0, 7));
    }

    #[test]
    fn test_failed_validator_stays_failed() {
        let mut v = Utf8Validator::new();
        assert!(!v.validate(b"\xff").valid);
        assert!(!v.validate(b"abc").valid);
    }

    #[test]
    fn test_incomplete_trailing_bytes() {
        assert_eq!(validate_utf8_incomplete(b"ab\xe2\x82"), (true, 2));
        assert_eq!(validate_utf8_incomplete(b"ab\xf0"), (true, 1));
        assert_eq!(validate_utf8_incomplete(b"ab\xe2\x82\xac"), (true, 0));
        assert_eq!(validate_utf8_incomplete(b"\xe0\x80"), (false, 0));
    }

    proptest! {
        #[test]
        fn prop_agrees_with_std(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut v = Utf8Validator::new();
            let s = v.validate(&data);
            let whole = s.valid && s.ends_on_codepoint;
            prop_assert_eq!(whole, std::str::from_utf8(&data).is_ok());
        }

        #[test]
        fn prop_split_anywhere(text in "\\PC{0,24}", split in 0usize..100) {
            let bytes = text.as_bytes();
            let at = split % (bytes.len() + 1);
            let mut v = Utf8Validator::new();
            prop_assert!(v.validate(&bytes[..at]).valid);
            let s = v.validate(&bytes[at..]);
            prop_assert!(s.valid && s.ends_on_codepoint);
            prop_assert_eq!(s.total, bytes.len());
        }
    }
}
