use crate::uuid::Uuid;
use std::fmt;

/// Reserved location names.
pub const ON: Uuid = Uuid::named("on");
pub const OFF: Uuid = Uuid::named("off");
pub const REON: Uuid = Uuid::named("reon");
pub const ERROR: Uuid = Uuid::named("error");
pub const STATE: Uuid = Uuid::named("~state");

/// A value carried by an op.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Int(i64),
    Float(f64),
    String(String),
    Uuid(Uuid),
}

impl Atom {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Atom::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Atom::Uuid(u) => Some(*u),
            _ => None,
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Int(i) => write!(f, "={i}"),
            Atom::Float(x) => write!(f, "^{x}"),
            Atom::String(s) => {
                f.write_str("'")?;
                for c in s.chars() {
                    match c {
                        '\'' => f.write_str("\\'")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        _ => write!(f, "{c}")?,
                    }
                }
                f.write_str("'")
            }
            Atom::Uuid(u) => write!(f, ">{u}"),
        }
    }
}

/// Op terminator class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Term {
    /// `;`: a raw (not yet reduced) op.
    #[default]
    Raw,
    /// `,`: an op inside a reduced state frame.
    Reduced,
    /// `!`: a frame header op.
    Header,
    /// `?`: a query op.
    Query,
}

impl Term {
    pub fn as_char(self) -> char {
        match self {
            Term::Raw => ';',
            Term::Reduced => ',',
            Term::Header => '!',
            Term::Query => '?',
        }
    }

    pub fn from_char(c: char) -> Option<Term> {
        match c {
            ';' => Some(Term::Raw),
            ',' => Some(Term::Reduced),
            '!' => Some(Term::Header),
            '?' => Some(Term::Query),
            _ => None,
        }
    }
}

/// The atomic unit of replication: (type, object, event, location) plus
/// value atoms. Ops of one CRDT instance share (type, object); the event
/// stamp is globally unique per object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Op {
    pub ty: Uuid,
    pub object: Uuid,
    pub event: Uuid,
    pub location: Uuid,
    pub atoms: Vec<Atom>,
    pub term: Term,
}

impl Op {
    pub fn new(ty: Uuid, object: Uuid, event: Uuid, location: Uuid) -> Self {
        Op {
            ty,
            object,
            event,
            location,
            atoms: Vec::new(),
            term: Term::Raw,
        }
    }

    pub fn with_atoms(mut self, atoms: Vec<Atom>) -> Self {
        self.atoms = atoms;
        self
    }

    pub fn with_term(mut self, term: Term) -> Self {
        self.term = term;
        self
    }

    pub fn is_header(&self) -> bool {
        self.term == Term::Header
    }

    pub fn is_query(&self) -> bool {
        self.term == Term::Query
    }

    pub fn is_on(&self) -> bool {
        self.location == ON || self.location == REON
    }

    pub fn is_off(&self) -> bool {
        self.location == OFF
    }

    pub fn is_error(&self) -> bool {
        self.location == ERROR
    }

    pub fn is_state(&self) -> bool {
        self.location == STATE
    }

    /// A plain data op: neither handshake traffic nor an error report.
    pub fn is_mutation(&self) -> bool {
        !self.is_on() && !self.is_off() && !self.is_error() && !self.is_query()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_display() {
        assert_eq!(Atom::Int(42).to_string(), "=42");
        assert_eq!(Atom::Int(-5).to_string(), "=-5");
        assert_eq!(Atom::Float(3.25).to_string(), "^3.25");
        assert_eq!(Atom::String("a'b\\c".into()).to_string(), "'a\\'b\\\\c'");
        assert_eq!(
            Atom::Uuid("1CQAn5-X".parse().unwrap()).to_string(),
            ">1CQAn5-X"
        );
    }

    #[test]
    fn test_op_kind_predicates() {
        let on = Op::new(Uuid::named("lww"), Uuid::named("obj"), Uuid::ZERO, ON);
        assert!(on.is_on());
        assert!(!on.is_mutation());

        let data = Op::new(
            Uuid::named("lww"),
            Uuid::named("obj"),
            "1-X".parse().unwrap(),
            Uuid::named("key"),
        );
        assert!(data.is_mutation());
        assert!(!data.is_on() && !data.is_off() && !data.is_error());
    }
}
