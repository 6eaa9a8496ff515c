use crate::base64::MalformedToken;
use crate::uuid::{Stamp, Uuid, Word};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Per-origin high-water-mark map used to test causal coverage.
///
/// Entries are monotonic: they only ever increase. The `0` origin bucket
/// holds scalar (origin-less) values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionVector {
    max: HashMap<Word, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.max.is_empty()
    }

    /// Highest value seen for an origin (zero when unseen).
    pub fn get(&self, origin: Word) -> u64 {
        self.max.get(&origin).copied().unwrap_or(0)
    }

    /// True iff the stamp has already been accounted for: the entry for its
    /// origin is at least its value. The zero stamp is always covered.
    pub fn covers(&self, stamp: &Stamp) -> bool {
        stamp.value.raw() <= self.get(stamp.origin)
    }

    /// Record an observed stamp; entries never decrease.
    pub fn see(&mut self, stamp: &Stamp) {
        self.add(stamp.origin, stamp.value.raw());
    }

    pub fn add(&mut self, origin: Word, value: u64) {
        let entry = self.max.entry(origin).or_insert(0);
        *entry = (*entry).max(value);
    }

    /// Take the per-origin maximum of both vectors.
    pub fn merge(&mut self, other: &VersionVector) {
        for (&origin, &value) in &other.max {
            self.add(origin, value);
        }
    }

    /// True if every entry of `other` is covered by this vector.
    pub fn descends(&self, other: &VersionVector) -> bool {
        other
            .max
            .iter()
            .all(|(&origin, &value)| self.get(origin) >= value)
    }

    /// The single highest stamp across all origins (zero when empty).
    pub fn tip(&self) -> Stamp {
        self.max
            .iter()
            .map(|(&origin, &value)| Uuid::event(Word::new(value), origin))
            .max()
            .unwrap_or(Uuid::ZERO)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Word, u64)> + '_ {
        self.max.iter().map(|(&origin, &value)| (origin, value))
    }
}

impl fmt::Display for VersionVector {
    /// `origin:value` token pairs, comma-joined, sorted by origin.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs: Vec<_> = self.max.iter().collect();
        pairs.sort_by_key(|&(&origin, _)| origin);
        for (i, (origin, &value)) in pairs.into_iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", origin, Word::new(value))?;
        }
        Ok(())
    }
}

impl FromStr for VersionVector {
    type Err = MalformedToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut vv = VersionVector::new();
        if s.is_empty() {
            return Ok(vv);
        }
        for pair in s.split(',') {
            let (origin, value) = pair.split_once(':').ok_or(MalformedToken::Empty)?;
            vv.add(origin.parse::<Word>()?, value.parse::<Word>()?.raw());
        }
        Ok(vv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(s: &str) -> Stamp {
        s.parse().unwrap()
    }

    #[test]
    fn test_covers_after_see() {
        let mut vv = VersionVector::new();
        let a = stamp("5-X");
        assert!(!vv.covers(&a));
        vv.see(&a);
        assert!(vv.covers(&a));
        // seeing another origin keeps earlier coverage intact
        vv.see(&stamp("3-Y"));
        assert!(vv.covers(&a));
        assert!(vv.covers(&stamp("4-X")));
        assert!(!vv.covers(&stamp("6-X")));
    }

    #[test]
    fn test_zero_always_covered() {
        let vv = VersionVector::new();
        assert!(vv.covers(&Uuid::ZERO));
        assert!(vv.covers(&Uuid::event(Word::ZERO, "X".parse().unwrap())));
    }

    #[test]
    fn test_entries_only_increase() {
        let mut vv = VersionVector::new();
        vv.see(&stamp("7-X"));
        vv.see(&stamp("3-X"));
        assert_eq!(vv.get("X".parse().unwrap()), stamp("7-X").value.raw());
    }

    #[test]
    fn test_merge_and_descends() {
        let mut a = VersionVector::new();
        a.see(&stamp("5-X"));
        a.see(&stamp("1-Y"));
        let mut b = VersionVector::new();
        b.see(&stamp("2-X"));
        b.see(&stamp("4-Z"));

        assert!(!a.descends(&b));
        assert!(!b.descends(&a));

        a.merge(&b);
        assert!(a.descends(&b));
        assert_eq!(a.get("X".parse().unwrap()), stamp("5-X").value.raw());
        assert_eq!(a.get("Z".parse().unwrap()), stamp("4-Z").value.raw());
    }

    #[test]
    fn test_tip() {
        let mut vv = VersionVector::new();
        assert_eq!(vv.tip(), Uuid::ZERO);
        vv.see(&stamp("5-X"));
        vv.see(&stamp("7-Y"));
        assert_eq!(vv.tip(), stamp("7-Y"));
    }

    #[test]
    fn test_string_roundtrip() {
        let mut vv = VersionVector::new();
        vv.see(&stamp("1CQAn5-X"));
        vv.see(&stamp("3-Y"));
        vv.see(&stamp("9-0"));
        let s = vv.to_string();
        assert_eq!(s.parse::<VersionVector>().unwrap(), vv);

        assert_eq!("".parse::<VersionVector>().unwrap(), VersionVector::new());
        assert!("nonsense".parse::<VersionVector>().is_err());
    }
}
