use crate::frame::Frame;
use crate::op::{Op, Term};
use crate::uuid::Uuid;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Last-write-wins merge: one op per location, the greatest event wins.
///
/// Ties between different origins on the same location resolve by the full
/// (value, origin) comparison of the event stamp. That is the serialized
/// order, so every replica picks the same winner; under a calendar clock the
/// value encodes wall-clock time and the origin only splits same-tick ties.
pub(crate) fn reduce(state: &[Op], change: &[Op], out: &mut Frame) {
    let mut winners: BTreeMap<Uuid, &Op> = BTreeMap::new();
    for op in state.iter().chain(change.iter()) {
        match winners.entry(op.location) {
            Entry::Vacant(slot) => {
                slot.insert(op);
            }
            Entry::Occupied(mut slot) => {
                if op.event > slot.get().event {
                    slot.insert(op);
                }
            }
        }
    }
    for op in winners.values() {
        out.push((*op).clone().with_term(Term::Reduced));
    }
}

/// Read view: location → the winning op.
pub fn fields(state: &Frame) -> BTreeMap<Uuid, &Op> {
    let mut fields = BTreeMap::new();
    for op in state.body() {
        match fields.entry(op.location) {
            Entry::Vacant(slot) => {
                slot.insert(op);
            }
            Entry::Occupied(mut slot) => {
                if op.event > slot.get().event {
                    slot.insert(op);
                }
            }
        }
    }
    fields
}
