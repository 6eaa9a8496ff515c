use crate::base64;
use crate::uuid::Word;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemeError {
    #[error("replica id scheme must be four digits, e.g. \"0262\"")]
    InvalidFormat,
    #[error("replica id scheme digits exceed {} Base64x64 positions", base64::WORD_DIGITS)]
    TooWide,
}

/// Digit widths carving a replica origin word into tree-position fields.
///
/// An origin encodes primus / peer / client / session from the high digits
/// down; a replica's id is a prefix of every id it hands out, which is what
/// makes `is_upstream_of` a cheap truncation test. The default scheme is
/// `0262`: no primus field, 2 peer digits, 6 client digits, 2 session digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaIdScheme {
    pub primus: u8,
    pub peer: u8,
    pub client: u8,
    pub session: u8,
}

impl ReplicaIdScheme {
    pub fn new(primus: u8, peer: u8, client: u8, session: u8) -> Result<Self, SchemeError> {
        let scheme = Self {
            primus,
            peer,
            client,
            session,
        };
        if scheme.cut(3) > base64::WORD_DIGITS {
            return Err(SchemeError::TooWide);
        }
        Ok(scheme)
    }

    /// Cumulative digit count through the given level (0 primus .. 3 session).
    fn cut(&self, level: usize) -> usize {
        let widths = [self.primus, self.peer, self.client, self.session];
        widths[..=level].iter().map(|&w| w as usize).sum()
    }

    /// Keep only the first `digits` Base64x64 digits of a word.
    pub fn truncate(word: Word, digits: usize) -> Word {
        if digits >= base64::WORD_DIGITS {
            return word;
        }
        let mask = !((1u64 << (60 - 6 * digits)) - 1);
        Word::new(word.raw() & mask)
    }

    /// The coarsest level whose truncation leaves `word` unchanged.
    fn level_of(&self, word: Word) -> usize {
        for level in 0..4 {
            if Self::truncate(word, self.cut(level)) == word {
                return level;
            }
        }
        3
    }

    /// True if `a` names a node strictly above `b` in the replica tree.
    pub fn is_upstream_of(&self, a: Word, b: Word) -> bool {
        a != b && Self::truncate(b, self.cut(self.level_of(a))) == a
    }

    pub fn is_downstream_of(&self, a: Word, b: Word) -> bool {
        self.is_upstream_of(b, a)
    }

    /// The client id owning a session origin.
    pub fn client_of(&self, origin: Word) -> Word {
        Self::truncate(origin, self.cut(2))
    }

    /// Append a session counter to a client id, yielding a session origin.
    pub fn grant_session(&self, client: Word, counter: u64) -> Word {
        let width = self.session as usize;
        if width == 0 {
            return self.client_of(client);
        }
        let field = counter & ((1u64 << (6 * width)) - 1);
        let base = self.client_of(client);
        Word::new(base.raw() | (field << (60 - 6 * self.cut(3))))
    }
}

impl Default for ReplicaIdScheme {
    fn default() -> Self {
        Self {
            primus: 0,
            peer: 2,
            client: 6,
            session: 2,
        }
    }
}

impl fmt::Display for ReplicaIdScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            self.primus, self.peer, self.client, self.session
        )
    }
}

impl FromStr for ReplicaIdScheme {
    type Err = SchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<u8> = s
            .chars()
            .map(|c| c.to_digit(10).map(|d| d as u8))
            .collect::<Option<_>>()
            .ok_or(SchemeError::InvalidFormat)?;
        if digits.len() != 4 {
            return Err(SchemeError::InvalidFormat);
        }
        Self::new(digits[0], digits[1], digits[2], digits[3])
    }
}
