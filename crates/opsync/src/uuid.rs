use crate::base64::{self, MalformedToken};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 60-bit Base64x64 word: the value or origin half of a [`Uuid`].
///
/// Stored numerically; the token form trims trailing zero digits, so numeric
/// order and lexicographic token order agree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Word(u64);

impl Word {
    pub const ZERO: Word = Word(0);
    /// All `~` digits: the far-future sentinel.
    pub const NEVER: Word = Word(base64::MAX_VALUE);

    pub fn new(raw: u64) -> Self {
        Word(raw & base64::MAX_VALUE)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The next word up, unless the 60-bit space is exhausted.
    pub fn next(self) -> Option<Word> {
        if self.0 >= base64::MAX_VALUE {
            None
        } else {
            Some(Word(self.0 + 1))
        }
    }

    /// Compile-time construction from a token literal.
    ///
    /// Panics on characters outside the alphabet; intended for `const`
    /// well-known names only. Parse runtime input with `FromStr`.
    pub const fn from_token(token: &str) -> Word {
        let bytes = token.as_bytes();
        assert!(bytes.len() <= base64::WORD_DIGITS);
        let mut value = 0u64;
        let mut i = 0;
        while i < bytes.len() {
            let digit = match bytes[i] {
                b @ b'0'..=b'9' => (b - b'0') as u64,
                b @ b'A'..=b'Z' => (b - b'A') as u64 + 10,
                b'_' => 36,
                b @ b'a'..=b'z' => (b - b'a') as u64 + 37,
                b'~' => 63,
                _ => panic!("character outside the Base64x64 alphabet"),
            };
            value |= digit << (6 * (base64::WORD_DIGITS - 1 - i));
            i += 1;
        }
        Word(value)
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base64::encode(self.0))
    }
}

impl FromStr for Word {
    type Err = MalformedToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        base64::decode(s).map(Word)
    }
}

/// Separator marking the semantic class of a [`Uuid`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Sep {
    /// `-`: an event timestamp.
    Event,
    /// `+`: a derived event (also time-ordered).
    Derived,
    /// `$`: a name or variable.
    #[default]
    Name,
    /// `%`: a hash or array index.
    Hash,
    /// `` ` ``: a never/error stamp.
    Error,
}

impl Sep {
    pub fn as_char(self) -> char {
        match self {
            Sep::Event => '-',
            Sep::Derived => '+',
            Sep::Name => '$',
            Sep::Hash => '%',
            Sep::Error => '`',
        }
    }

    pub fn from_char(c: char) -> Option<Sep> {
        match c {
            '-' => Some(Sep::Event),
            '+' => Some(Sep::Derived),
            '$' => Some(Sep::Name),
            '%' => Some(Sep::Hash),
            '`' => Some(Sep::Error),
            _ => None,
        }
    }
}

/// An immutable (value, origin, separator) identifier.
///
/// Ordering is lexicographic on (value, origin), which for same-origin event
/// stamps coincides with happened-before.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Uuid {
    pub value: Word,
    pub origin: Word,
    pub sep: Sep,
}

/// A [`Uuid`] used as a Lamport timestamp: `value` is the logical time,
/// `origin` the issuing replica.
pub type Stamp = Uuid;

/// Shared-prefix run-length characters for prefixes of length 4..=9.
const PREFIX_BRACKETS: [char; 6] = ['(', '[', '{', '}', ']', ')'];

fn bracket_len(c: char) -> Option<usize> {
    match c {
        '(' => Some(4),
        '[' => Some(5),
        '{' => Some(6),
        '}' => Some(7),
        ']' => Some(8),
        ')' => Some(9),
        _ => None,
    }
}

/// Render `word` against a context word: `None` when identical, a
/// bracket-compressed or full token otherwise.
fn compress_word(word: Word, ctx: Word) -> Option<String> {
    if word == ctx {
        return None;
    }
    let token = base64::encode(word.raw());
    let ctx_token = base64::encode(ctx.raw());
    let shared = token
        .bytes()
        .zip(ctx_token.bytes())
        .take_while(|(a, b)| a == b)
        .count()
        .min(9);
    if shared >= 4 {
        let mut out = String::with_capacity(token.len() - shared + 1);
        out.push(PREFIX_BRACKETS[shared - 4]);
        out.push_str(&token[shared..]);
        Some(out)
    } else {
        Some(token)
    }
}

/// Inverse of [`compress_word`] for a non-empty serialized word.
fn decompress_word(s: &str, ctx: Word) -> Result<Word, MalformedToken> {
    let first = s.chars().next().ok_or(MalformedToken::Empty)?;
    if let Some(prefix) = bracket_len(first) {
        let suffix = &s[1..];
        if prefix + suffix.len() > base64::WORD_DIGITS {
            return Err(MalformedToken::Overlong);
        }
        let ctx_token = base64::encode(ctx.raw());
        let mut token = String::with_capacity(prefix + suffix.len());
        for i in 0..prefix {
            // context tokens are zero-trimmed; pad back out to the prefix
            token.push(*ctx_token.as_bytes().get(i).unwrap_or(&b'0') as char);
        }
        token.push_str(suffix);
        base64::decode(&token).map(Word)
    } else {
        base64::decode(s).map(Word)
    }
}

/// True if `c` can appear inside a serialized (possibly compressed) UUID.
pub(crate) fn is_spec_char(c: char) -> bool {
    base64::is_digit(c) || bracket_len(c).is_some() || Sep::from_char(c).is_some()
}

/// Consume an optional word (bracket char plus alphabet digits) from `rest`.
fn take_word<'a>(rest: &mut &'a str) -> &'a str {
    let s = *rest;
    let mut len = 0;
    if let Some(c) = s.chars().next() {
        if bracket_len(c).is_some() {
            len = 1;
        }
    }
    while let Some(c) = s[len..].chars().next() {
        if base64::is_digit(c) {
            len += c.len_utf8();
        } else {
            break;
        }
    }
    *rest = &s[len..];
    &s[..len]
}

impl Uuid {
    /// `"0"`: no value yet.
    pub const ZERO: Uuid = Uuid {
        value: Word::ZERO,
        origin: Word::ZERO,
        sep: Sep::Name,
    };

    /// `"~"`: infinitely far in the future.
    pub const NEVER: Uuid = Uuid {
        value: Word::NEVER,
        origin: Word::ZERO,
        sep: Sep::Name,
    };

    /// A well-known name from a token literal (compile-time checked when
    /// used in `const` position).
    pub const fn named(token: &str) -> Uuid {
        Uuid {
            value: Word::from_token(token),
            origin: Word::ZERO,
            sep: Sep::Name,
        }
    }

    pub fn event(value: Word, origin: Word) -> Uuid {
        Uuid {
            value,
            origin,
            sep: Sep::Event,
        }
    }

    /// An error stamp scoped to `origin`.
    pub fn error_stamp(origin: Word) -> Uuid {
        Uuid {
            value: Word::NEVER,
            origin,
            sep: Sep::Error,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero() && self.origin.is_zero()
    }

    pub fn is_never(&self) -> bool {
        self.value == Word::NEVER
    }

    pub fn is_name(&self) -> bool {
        self.sep == Sep::Name
    }

    pub fn is_event(&self) -> bool {
        matches!(self.sep, Sep::Event | Sep::Derived)
    }

    pub fn is_error(&self) -> bool {
        self.sep == Sep::Error
    }

    /// Serialize against a context UUID, eliding everything shared with it.
    ///
    /// Omitted value/separator/origin parts inherit from the context on
    /// parse, and differing words use shared-prefix bracket compression, so
    /// `parse_relative(relative(u, ctx), ctx) == u` holds for every pair.
    pub fn relative(&self, ctx: &Uuid) -> String {
        if self == ctx {
            return String::new();
        }
        let value = compress_word(self.value, ctx.value);
        let origin = compress_word(self.origin, ctx.origin);
        let mut out = String::new();
        if let Some(v) = &value {
            out.push_str(v);
        }
        if origin.is_none() && self.sep == ctx.sep {
            return out;
        }
        out.push(self.sep.as_char());
        if let Some(o) = &origin {
            out.push_str(o);
        }
        out
    }

    /// Parse a (possibly compressed, possibly partial) UUID against the
    /// context it was serialized with.
    pub fn parse_relative(s: &str, ctx: &Uuid) -> Result<Uuid, MalformedToken> {
        if s.is_empty() {
            return Ok(*ctx);
        }
        let mut rest = s;
        let value_part = take_word(&mut rest);
        let value = if value_part.is_empty() {
            ctx.value
        } else {
            decompress_word(value_part, ctx.value)?
        };
        match rest.chars().next() {
            None => Ok(Uuid {
                value,
                origin: ctx.origin,
                sep: ctx.sep,
            }),
            Some(c) => {
                let sep = Sep::from_char(c).ok_or(MalformedToken::BadDigit(c))?;
                rest = &rest[1..];
                let origin_part = take_word(&mut rest);
                let origin = if origin_part.is_empty() {
                    ctx.origin
                } else {
                    decompress_word(origin_part, ctx.origin)?
                };
                if let Some(extra) = rest.chars().next() {
                    return Err(MalformedToken::BadDigit(extra));
                }
                Ok(Uuid { value, origin, sep })
            }
        }
    }
}

impl Default for Uuid {
    fn default() -> Self {
        Uuid::ZERO
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)?;
        if !self.origin.is_zero() || self.sep != Sep::Name {
            write!(f, "{}{}", self.sep.as_char(), self.origin)?;
        }
        Ok(())
    }
}

impl FromStr for Uuid {
    type Err = MalformedToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(MalformedToken::Empty);
        }
        Uuid::parse_relative(s, &Uuid::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(s: &str) -> Uuid {
        s.parse().unwrap()
    }

    #[test]
    fn test_display_roundtrip() {
        for s in ["0", "~", "lww", "1CQAn5-X", "1CQAn5+Xgritzko", "inc%5", "~`X"] {
            assert_eq!(uuid(s).to_string(), s);
        }
    }

    #[test]
    fn test_sentinels() {
        assert!(Uuid::ZERO.is_zero());
        assert!(Uuid::NEVER.is_never());
        assert_eq!(Uuid::ZERO.to_string(), "0");
        assert_eq!(Uuid::NEVER.to_string(), "~");
    }

    #[test]
    fn test_named_const() {
        const LWW: Uuid = Uuid::named("lww");
        assert_eq!(LWW, uuid("lww"));
        assert!(LWW.is_name());
    }

    #[test]
    fn test_ordering_matches_happened_before() {
        let a = uuid("1CQAn5-X");
        let b = uuid("1CQAn6-X");
        let c = uuid("1CQAn6-Y");
        assert!(a < b);
        assert!(b < c);
        assert!(Uuid::ZERO < a);
        assert!(a < Uuid::NEVER);
    }

    #[test]
    fn test_relative_same_origin_event() {
        let ctx = uuid("1CQAn5-X");
        let next = uuid("1CQAn6-X");
        // shared 5-char value prefix, identical sep and origin
        assert_eq!(next.relative(&ctx), "[6");
        assert_eq!(Uuid::parse_relative("[6", &ctx).unwrap(), next);
    }

    #[test]
    fn test_relative_elides_identical() {
        let ctx = uuid("1CQAn5-X");
        assert_eq!(ctx.relative(&ctx), "");
        assert_eq!(Uuid::parse_relative("", &ctx).unwrap(), ctx);
    }

    #[test]
    fn test_relative_origin_only_change() {
        let ctx = uuid("1CQAn5-X");
        let other = uuid("1CQAn5-Y");
        assert_eq!(other.relative(&ctx), "-Y");
        assert_eq!(Uuid::parse_relative("-Y", &ctx).unwrap(), other);
    }

    #[test]
    fn test_relative_sep_only_change() {
        let ctx = uuid("1CQAn5-X");
        let derived = Uuid {
            sep: Sep::Derived,
            ..ctx
        };
        assert_eq!(derived.relative(&ctx), "+");
        assert_eq!(Uuid::parse_relative("+", &ctx).unwrap(), derived);
    }

    #[test]
    fn test_relative_short_value_against_longer_context() {
        // the word is a strict prefix of the context word
        let ctx = uuid("1CQAn5-X");
        let short = uuid("1CQA-X");
        assert_eq!(short.relative(&ctx), "(");
        assert_eq!(Uuid::parse_relative("(", &ctx).unwrap(), short);
    }

    #[test]
    fn test_relative_no_shared_prefix() {
        let ctx = uuid("1CQAn5-X");
        let far = uuid("2-Y");
        assert_eq!(far.relative(&ctx), "2-Y");
        assert_eq!(Uuid::parse_relative("2-Y", &ctx).unwrap(), far);
    }

    #[test]
    fn test_relative_roundtrip_grid() {
        let uuids = [
            Uuid::ZERO,
            Uuid::NEVER,
            uuid("lww"),
            uuid("1CQAn5-X"),
            uuid("1CQAn5-Y"),
            uuid("1CQAn6+X"),
            uuid("1CQ-X"),
            uuid("inc%5"),
            uuid("~~~~~~~~~9-X"),
        ];
        for u in &uuids {
            for ctx in &uuids {
                let s = u.relative(ctx);
                assert_eq!(
                    Uuid::parse_relative(&s, ctx).unwrap(),
                    *u,
                    "u={u} ctx={ctx} s={s:?}"
                );
            }
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Uuid::parse_relative("абв", &Uuid::ZERO).is_err());
        assert!(Uuid::parse_relative("1CQAn5-X-Y", &Uuid::ZERO).is_err());
        assert!("".parse::<Uuid>().is_err());
    }
}
