//! Dotted numeric case identifiers
//!
//! A [`CaseId`] is an ordered tuple of small integers, written `"9.1.2"`.
//! Ordering is numeric per segment, so `"9.10"` sorts after `"9.2"`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigurationError;

/// Case identifier, e.g. `(9, 1, 2)` / `"9.1.2"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaseId(Vec<u32>);

impl CaseId {
    pub fn new(segments: impl Into<Vec<u32>>) -> Self {
        Self(segments.into())
    }

    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    /// Top-level category, e.g. `9` for `9.1.2`
    pub fn category(&self) -> u32 {
        self.0.first().copied().unwrap_or_default()
    }

    /// Sub-category prefix, e.g. `9.1` for `9.1.2`
    pub fn subcategory(&self) -> Option<CaseId> {
        (self.0.len() > 2).then(|| CaseId(self.0[..2].to_vec()))
    }

    /// True when `prefix` names this id or one of its ancestors
    pub fn starts_with(&self, prefix: &[u32]) -> bool {
        self.0.starts_with(prefix)
    }

    /// Underscore-joined form used in report file names
    pub fn file_stem(&self) -> String {
        self.to_string().replace('.', "_")
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{}", seg)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for CaseId {
    type Err = ConfigurationError;

    /// Parse the canonical form: non-empty decimal segments without
    /// leading zeros, joined by single dots
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigurationError::InvalidPattern(s.to_string());
        if s.is_empty() {
            return Err(invalid());
        }
        s.split('.')
            .map(|seg| {
                let canonical = !seg.is_empty()
                    && seg.bytes().all(|b| b.is_ascii_digit())
                    && (seg == "0" || !seg.starts_with('0'));
                if canonical {
                    seg.parse::<u32>().map_err(|_| invalid())
                } else {
                    Err(invalid())
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(CaseId)
    }
}

impl From<&[u32]> for CaseId {
    fn from(segments: &[u32]) -> Self {
        CaseId(segments.to_vec())
    }
}

impl Serialize for CaseId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CaseId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_and_display() {
        let id: CaseId = "9.1.2".parse().unwrap();
        assert_eq!(id.segments(), &[9, 1, 2]);
        assert_eq!(id.to_string(), "9.1.2");
        assert_eq!(id.category(), 9);
        assert_eq!(id.subcategory(), Some(CaseId::new([9, 1])));
        assert_eq!(id.file_stem(), "9_1_2");
    }

    #[test]
    fn test_reject_malformed() {
        for bad in ["", ".", "9.", ".9", "9..1", "9.x", "9.*", "09.1", " 9.1", "9.1 "] {
            assert!(bad.parse::<CaseId>().is_err(), "{:?} should not parse", bad);
        }
        assert!("0".parse::<CaseId>().is_ok());
    }

    #[test]
    fn test_numeric_order() {
        let mut ids: Vec<CaseId> = ["9.10", "9.2", "10.1", "9.2.1", "1.1.8"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let sorted: Vec<String> = ids.iter().map(|c| c.to_string()).collect();
        assert_eq!(sorted, ["1.1.8", "9.2", "9.2.1", "9.10", "10.1"]);
    }

    #[test]
    fn test_serde_as_string() {
        let id = CaseId::new([12, 3, 14]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"12.3.14\"");
        let back: CaseId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    proptest! {
        #[test]
        fn prop_tuple_round_trip(segments in proptest::collection::vec(0u32..1000, 1..5)) {
            let id = CaseId::new(segments.clone());
            let parsed: CaseId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed.segments(), &segments[..]);
        }

        #[test]
        fn prop_string_round_trip(s in "(0|[1-9][0-9]{0,3})(\\.(0|[1-9][0-9]{0,3})){0,4}") {
            let id: CaseId = s.parse().unwrap();
            prop_assert_eq!(id.to_string(), s);
        }
    }
}
