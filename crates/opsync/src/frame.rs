use crate::base64::MalformedToken;
use crate::op::{Atom, Op, Term};
use crate::uuid::{self, Uuid};
use thiserror::Error;

/// Errors raised while parsing the textual wire form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedFrame {
    #[error("unexpected character '{0}'")]
    Unexpected(char),
    #[error("malformed integer atom")]
    BadInt,
    #[error("malformed float atom")]
    BadFloat,
    #[error("unterminated string atom")]
    UnterminatedString,
    #[error("bad string escape '\\{0}'")]
    BadEscape(char),
    #[error("frame is not valid UTF-8")]
    Utf8,
    #[error(transparent)]
    Token(#[from] MalformedToken),
}

/// An ordered batch of ops sharing structural context.
///
/// The textual form is line-oriented: one op per line with `*type #object
/// @event :location` keys compressed against the previous op's keys, tabbed
/// atoms, and a terminator character; a blank line closes the bundle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    ops: Vec<Op>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: Vec<Op>) -> Self {
        Frame { ops }
    }

    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Op> {
        self.ops.iter()
    }

    /// The leading header op, if the frame is a terminated state frame.
    pub fn header(&self) -> Option<&Op> {
        self.ops.first().filter(|op| op.is_header())
    }

    /// Body ops: everything after the header (or all ops of a raw frame).
    pub fn body(&self) -> &[Op] {
        if self.header().is_some() {
            &self.ops[1..]
        } else {
            &self.ops[..]
        }
    }

    /// CRDT type of the frame (from its first op).
    pub fn ty(&self) -> Uuid {
        self.ops.first().map(|op| op.ty).unwrap_or(Uuid::ZERO)
    }

    /// Object the frame belongs to (from its first op).
    pub fn object(&self) -> Uuid {
        self.ops.first().map(|op| op.object).unwrap_or(Uuid::ZERO)
    }

    /// The highest event stamp mentioned in the frame.
    pub fn tip(&self) -> Uuid {
        self.ops
            .iter()
            .map(|op| op.event)
            .max()
            .unwrap_or(Uuid::ZERO)
    }

    pub fn is_query(&self) -> bool {
        self.ops.iter().any(|op| op.is_query())
    }

    /// Serialize to the canonical textual form, blank-line terminated.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let mut ctx = Op::default();
        for op in &self.ops {
            write_op(&mut out, op, &ctx);
            out.push('\n');
            ctx = op.clone();
        }
        out.push('\n');
        out
    }

    /// One op in absolute (context-free) text form, as persisted by storage.
    pub fn op_text(op: &Op) -> String {
        let mut out = String::new();
        write_op(&mut out, op, &Op::default());
        out
    }

    /// Inverse of [`Frame::op_text`].
    pub fn parse_op_text(line: &str) -> Result<Op, MalformedFrame> {
        parse_op(line, &Op::default())
    }

    /// Parse one bundle of text; stops at the first blank line.
    pub fn parse_text(text: &str) -> Result<Frame, MalformedFrame> {
        let mut ops = Vec::new();
        let mut ctx = Op::default();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }
            let op = parse_op(line, &ctx)?;
            ctx = op.clone();
            ops.push(op);
        }
        Ok(Frame { ops })
    }
}

impl FromIterator<Op> for Frame {
    fn from_iter<I: IntoIterator<Item = Op>>(iter: I) -> Self {
        Frame {
            ops: iter.into_iter().collect(),
        }
    }
}

fn write_op(out: &mut String, op: &Op, ctx: &Op) {
    if op.ty != ctx.ty {
        out.push('*');
        out.push_str(&op.ty.relative(&ctx.ty));
    }
    if op.object != ctx.object {
        out.push('#');
        out.push_str(&op.object.relative(&ctx.object));
    }
    if op.event != ctx.event {
        out.push('@');
        out.push_str(&op.event.relative(&ctx.event));
    }
    if op.location != ctx.location {
        out.push(':');
        out.push_str(&op.location.relative(&ctx.location));
    }
    for atom in &op.atoms {
        out.push('\t');
        out.push_str(&atom.to_string());
    }
    out.push(op.term.as_char());
}

/// Consume a run of UUID spec characters.
fn take_spec<'a>(rest: &mut &'a str) -> &'a str {
    let s = *rest;
    let len = s
        .char_indices()
        .find(|&(_, c)| !uuid::is_spec_char(c))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    *rest = &s[len..];
    &s[..len]
}

fn parse_op(line: &str, ctx: &Op) -> Result<Op, MalformedFrame> {
    let mut rest = line;
    let mut op = Op::new(ctx.ty, ctx.object, ctx.event, ctx.location);

    // keys in canonical order, each optional
    for (prefix, field) in [
        ('*', 0usize),
        ('#', 1),
        ('@', 2),
        (':', 3),
    ] {
        if rest.starts_with(prefix) {
            rest = &rest[1..];
            let spec = take_spec(&mut rest);
            let key_ctx = match field {
                0 => &ctx.ty,
                1 => &ctx.object,
                2 => &ctx.event,
                _ => &ctx.location,
            };
            let parsed = Uuid::parse_relative(spec, key_ctx)?;
            match field {
                0 => op.ty = parsed,
                1 => op.object = parsed,
                2 => op.event = parsed,
                _ => op.location = parsed,
            }
        }
    }

    // atoms, then an optional terminator
    loop {
        rest = rest.trim_start_matches(['\t', ' ']);
        let Some(c) = rest.chars().next() else {
            break;
        };
        match c {
            '=' => {
                rest = &rest[1..];
                let end = rest
                    .char_indices()
                    .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
                    .map(|(i, _)| i)
                    .unwrap_or(rest.len());
                let number = &rest[..end];
                rest = &rest[end..];
                op.atoms.push(Atom::Int(
                    number.parse().map_err(|_| MalformedFrame::BadInt)?,
                ));
            }
            '^' => {
                rest = &rest[1..];
                let end = rest
                    .char_indices()
                    .find(|&(_, c)| !matches!(c, '0'..='9' | '+' | '-' | '.' | 'e' | 'E'))
                    .map(|(i, _)| i)
                    .unwrap_or(rest.len());
                let number = &rest[..end];
                rest = &rest[end..];
                op.atoms.push(Atom::Float(
                    number.parse().map_err(|_| MalformedFrame::BadFloat)?,
                ));
            }
            '\'' => {
                rest = &rest[1..];
                let mut s = String::new();
                let mut chars = rest.char_indices();
                let mut closed = None;
                while let Some((i, c)) = chars.next() {
                    match c {
                        '\'' => {
                            closed = Some(i + 1);
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, '\'')) => s.push('\''),
                            Some((_, '\\')) => s.push('\\'),
                            Some((_, 'n')) => s.push('\n'),
                            Some((_, 't')) => s.push('\t'),
                            Some((_, other)) => return Err(MalformedFrame::BadEscape(other)),
                            None => return Err(MalformedFrame::UnterminatedString),
                        },
                        _ => s.push(c),
                    }
                }
                let consumed = closed.ok_or(MalformedFrame::UnterminatedString)?;
                rest = &rest[consumed..];
                op.atoms.push(Atom::String(s));
            }
            '>' => {
                rest = &rest[1..];
                let spec = take_spec(&mut rest);
                op.atoms.push(Atom::Uuid(Uuid::parse_relative(spec, &Uuid::ZERO)?));
            }
            _ => {
                if let Some(term) = Term::from_char(c) {
                    op.term = term;
                    rest = &rest[1..];
                    if let Some(extra) = rest.trim().chars().next() {
                        return Err(MalformedFrame::Unexpected(extra));
                    }
                    break;
                }
                return Err(MalformedFrame::Unexpected(c));
            }
        }
    }

    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::Word;

    fn uuid(s: &str) -> Uuid {
        s.parse().unwrap()
    }

    fn frame(text: &str) -> Frame {
        Frame::parse_text(text).unwrap()
    }

    #[test]
    fn test_parse_single_op() {
        let f = frame("*lww#test@1CQAn5-X:key\t=1;\n\n");
        assert_eq!(f.len(), 1);
        let op = &f.ops()[0];
        assert_eq!(op.ty, uuid("lww"));
        assert_eq!(op.object, uuid("test"));
        assert_eq!(op.event, uuid("1CQAn5-X"));
        assert_eq!(op.location, uuid("key"));
        assert_eq!(op.atoms, vec![Atom::Int(1)]);
        assert_eq!(op.term, Term::Raw);
    }

    #[test]
    fn test_keys_inherit_from_previous_op() {
        let f = frame("*lww#test@1CQAn5-X!\n:key\t=1,\n:other\t'two',\n\n");
        assert_eq!(f.len(), 3);
        assert!(f.ops()[0].is_header());
        for op in f.body() {
            assert_eq!(op.ty, uuid("lww"));
            assert_eq!(op.object, uuid("test"));
            assert_eq!(op.event, uuid("1CQAn5-X"));
            assert_eq!(op.term, Term::Reduced);
        }
        assert_eq!(f.body()[1].atoms, vec![Atom::String("two".into())]);
    }

    #[test]
    fn test_serialize_elides_shared_keys() {
        let header = Op::new(uuid("lww"), uuid("test"), uuid("1CQAn5-X"), Uuid::ZERO)
            .with_term(Term::Header);
        let body = Op::new(uuid("lww"), uuid("test"), uuid("1CQAn5-X"), uuid("key"))
            .with_atoms(vec![Atom::Int(1)])
            .with_term(Term::Reduced);
        let f = Frame::from_ops(vec![header, body]);
        let text = f.to_text();
        assert_eq!(text, "*lww#test@1CQAn5-X!\n:key\t=1,\n\n");
    }

    #[test]
    fn test_text_roundtrip() {
        let texts = [
            "*lww#test@1CQAn5-X!\n:key\t=1,\n:two\t^2.5,\n:three\t'aha',\n\n",
            "*set#chat@1CQAn5-X:0\t'hi';\n\n",
            "#root@1-X:on\t'X:1'?\n\n",
            "!\n\n",
        ];
        for text in texts {
            let f = frame(text);
            assert_eq!(frame(&f.to_text()), f, "text={text:?}");
        }
    }

    #[test]
    fn test_event_compression_between_ops() {
        let a = Op::new(uuid("log"), uuid("obj"), uuid("1CQAn5-X"), Uuid::ZERO);
        let b = Op::new(uuid("log"), uuid("obj"), uuid("1CQAn6-X"), Uuid::ZERO)
            .with_atoms(vec![Atom::String("hop".into())]);
        let f = Frame::from_ops(vec![a, b]);
        let text = f.to_text();
        // the second op's event shares a 5-char prefix with the first
        assert!(text.contains("@[6"), "got {text:?}");
        assert_eq!(frame(&text), f);
    }

    #[test]
    fn test_tip_and_accessors() {
        let f = frame("*lww#test@1CQAn5-X!\n@1CQAn7-X:a\t=1,\n@1CQAn6-X:b\t=2,\n\n");
        assert_eq!(f.ty(), uuid("lww"));
        assert_eq!(f.object(), uuid("test"));
        assert_eq!(f.tip(), uuid("1CQAn7-X"));
        assert_eq!(f.body().len(), 2);
    }

    #[test]
    fn test_parse_stops_at_blank_line() {
        let f = frame("*lww#a@1-X:k\t=1;\n\n*lww#b@2-X:k\t=2;\n\n");
        assert_eq!(f.len(), 1);
        assert_eq!(f.object(), uuid("a"));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(Frame::parse_text("*lww#test@1-X:key\t=;\n\n").is_err());
        assert!(Frame::parse_text("*lww#test@1-X:key\t'no end;\n\n").is_err());
        assert!(Frame::parse_text("*lww#test@1-X:key\t=1; junk\n\n").is_err());
        assert!(Frame::parse_text("?!?\n\n").is_err());
        assert!(Frame::parse_text("*lww µ\n\n").is_err());
    }

    #[test]
    fn test_float_and_negative_roundtrip() {
        let op = Op::new(uuid("lww"), uuid("t"), uuid("1-X"), uuid("k"))
            .with_atoms(vec![Atom::Int(-7), Atom::Float(0.5), Atom::Uuid(uuid("1CQAn5-X"))]);
        let f = Frame::from_ops(vec![op]);
        assert_eq!(frame(&f.to_text()), f);
    }

    #[test]
    fn test_zero_uuid_key_roundtrip() {
        let op = Op::new(uuid("set"), uuid("t"), uuid("1-X"), Uuid::ZERO)
            .with_atoms(vec![Atom::Int(1)]);
        let f = Frame::from_ops(vec![op]);
        let parsed = frame(&f.to_text());
        assert_eq!(parsed.ops()[0].location, Uuid::ZERO);
        assert_eq!(parsed, f);
    }

    #[test]
    fn test_word_helper_is_consistent() {
        // guards the spec-char set used by the line scanner
        assert!(uuid::is_spec_char('('));
        assert!(uuid::is_spec_char('-'));
        assert!(uuid::is_spec_char('~'));
        assert!(!uuid::is_spec_char('\t'));
        assert_eq!(Word::from_token("on"), uuid("on").value);
    }
}
