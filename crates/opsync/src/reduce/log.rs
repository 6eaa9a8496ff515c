use crate::frame::Frame;
use crate::op::{Op, Term};
use crate::uuid::Uuid;
use std::collections::HashSet;

/// Append-only log merge: old ops, then new ops, no location comparison.
///
/// Duplicate deliveries are dropped by event stamp, which is what makes the
/// concatenation idempotent. Omnivorous: any op type is accepted.
pub(crate) fn reduce(state: &[Op], change: &[Op], out: &mut Frame) {
    let mut seen: HashSet<Uuid> = HashSet::new();
    for op in state.iter().chain(change.iter()) {
        if seen.insert(op.event) {
            out.push(op.clone().with_term(Term::Reduced));
        }
    }
}
