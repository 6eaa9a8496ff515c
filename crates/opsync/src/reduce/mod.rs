use crate::frame::Frame;
use crate::op::{self, Atom, Op, Term};
use crate::uuid::{Uuid, Word};
use crate::version::VersionVector;
use std::ops::BitOr;
use thiserror::Error;

pub mod log;
pub mod lww;
pub mod set;

/// Well-known CRDT type names.
pub const LWW: Uuid = Uuid::named("lww");
pub const SET: Uuid = Uuid::named("set");
pub const LOG: Uuid = Uuid::named("log");

/// Reducer capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caps(u8);

impl Caps {
    pub const NONE: Caps = Caps(0);
    /// Can merge raw (unreduced) ops into a state.
    pub const OP_BASED: Caps = Caps(1);
    /// Can merge two state frames.
    pub const STATE_BASED: Caps = Caps(1 << 1);
    /// Accepts frames of any type.
    pub const OMNIVOROUS: Caps = Caps(1 << 2);
    /// Can answer "everything after version vector V".
    pub const VV_DIFF: Caps = Caps(1 << 3);

    pub fn contains(self, other: Caps) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Caps {
    type Output = Caps;

    fn bitor(self, rhs: Caps) -> Caps {
        Caps(self.0 | rhs.0)
    }
}

/// The CRDT kinds this engine ships reducers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrdtKind {
    Lww,
    Set,
    Log,
}

impl CrdtKind {
    pub fn of(ty: &Uuid) -> Option<CrdtKind> {
        if *ty == LWW {
            Some(CrdtKind::Lww)
        } else if *ty == SET {
            Some(CrdtKind::Set)
        } else if *ty == LOG {
            Some(CrdtKind::Log)
        } else {
            None
        }
    }

    pub fn uuid(self) -> Uuid {
        match self {
            CrdtKind::Lww => LWW,
            CrdtKind::Set => SET,
            CrdtKind::Log => LOG,
        }
    }

    pub fn caps(self) -> Caps {
        match self {
            CrdtKind::Lww => Caps::OP_BASED | Caps::STATE_BASED | Caps::VV_DIFF,
            CrdtKind::Set => Caps::OP_BASED | Caps::STATE_BASED | Caps::VV_DIFF,
            CrdtKind::Log => {
                Caps::OP_BASED | Caps::STATE_BASED | Caps::OMNIVOROUS | Caps::VV_DIFF
            }
        }
    }
}

/// A merge the dispatcher refuses to perform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReduceError {
    #[error("NOQUERY: a query frame cannot be reduced")]
    Query,
    #[error("UnknownType: no reducer registered for '{0}'")]
    UnknownType(Uuid),
    #[error("NOOMNIVORS: reducer for '{expected}' fed a '{got}' frame")]
    TypeMismatch { expected: Uuid, got: Uuid },
    #[error("NOOPBASED: reducer for '{0}' cannot merge raw ops")]
    OpBased(Uuid),
    #[error("NOSTATEBASD: reducer for '{0}' cannot merge state frames")]
    StateBased(Uuid),
}

/// Merge a change (state frame or raw ops) into a state frame.
///
/// Both inputs must belong to one object. The output is a terminated state
/// frame: a header op carrying the merged tip event, then body ops sorted by
/// location. Commutative, associative and idempotent for every kind.
pub fn try_reduce(state: &Frame, change: &Frame) -> Result<Frame, ReduceError> {
    if change.is_query() {
        return Err(ReduceError::Query);
    }
    if state.is_empty() && change.is_empty() {
        return Ok(Frame::new());
    }
    let ty = if state.is_empty() { change.ty() } else { state.ty() };
    let kind = CrdtKind::of(&ty).ok_or(ReduceError::UnknownType(ty))?;
    let caps = kind.caps();
    if !change.is_empty() && change.ty() != ty && !caps.contains(Caps::OMNIVOROUS) {
        return Err(ReduceError::TypeMismatch {
            expected: ty,
            got: change.ty(),
        });
    }
    if change.header().is_some() && !caps.contains(Caps::STATE_BASED) {
        return Err(ReduceError::StateBased(ty));
    }
    if !change.is_empty() && change.header().is_none() && !caps.contains(Caps::OP_BASED) {
        return Err(ReduceError::OpBased(ty));
    }

    let object = if state.is_empty() {
        change.object()
    } else {
        state.object()
    };
    let tip = state.tip().max(change.tip());
    let mut out = Frame::new();
    out.push(Op::new(ty, object, tip, Uuid::ZERO).with_term(Term::Header));
    match kind {
        CrdtKind::Lww => lww::reduce(state.body(), change.body(), &mut out),
        CrdtKind::Set => set::reduce(state.body(), change.body(), &mut out),
        CrdtKind::Log => log::reduce(state.body(), change.body(), &mut out),
    }
    Ok(out)
}

/// Like [`try_reduce`], but converts a refusal into a single error op so a
/// bad merge never crosses a stream boundary as a crash.
pub fn reduce(state: &Frame, change: &Frame) -> Frame {
    try_reduce(state, change).unwrap_or_else(|err| {
        let context = if state.is_empty() { change } else { state };
        error_frame(context.ty(), context.object(), &err.to_string())
    })
}

/// A single-op error frame addressed at `object`.
pub fn error_frame(ty: Uuid, object: Uuid, message: &str) -> Frame {
    Frame::from_ops(vec![
        Op::new(ty, object, Uuid::error_stamp(Word::ZERO), op::ERROR)
            .with_atoms(vec![Atom::String(message.to_string())]),
    ])
}

/// Everything in `state` the requester's vector does not cover, as a
/// terminated diff frame.
pub fn diff(state: &Frame, vv: &VersionVector) -> Frame {
    let mut out = Frame::new();
    out.push(
        Op::new(state.ty(), state.object(), state.tip(), Uuid::ZERO).with_term(Term::Header),
    );
    for op in state.body() {
        if !vv.covers(&op.event) {
            out.push(op.clone());
        }
    }
    out
}
