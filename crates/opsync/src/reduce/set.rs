use crate::frame::Frame;
use crate::op::{Atom, Op, Term};
use crate::uuid::Uuid;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Observed-remove set merge.
///
/// An add op sits at location `0`, keyed by its event stamp; a remove op's
/// location names the event stamp of the add it erases. Removal is scoped to
/// observed adds only, so an add concurrent with a remove (whose stamp the
/// remover never saw) survives. Removes stay in the state as tombstones.
pub(crate) fn reduce(state: &[Op], change: &[Op], out: &mut Frame) {
    let mut adds: BTreeMap<Uuid, &Op> = BTreeMap::new();
    let mut removes: BTreeMap<Uuid, &Op> = BTreeMap::new();
    for op in state.iter().chain(change.iter()) {
        if op.location.is_zero() {
            adds.insert(op.event, op);
        } else {
            match removes.entry(op.location) {
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
    }
    for victim in removes.keys() {
        adds.remove(victim);
    }
    // adds (location 0) sort before every remove (location = an event stamp)
    for op in adds.values() {
        out.push((*op).clone().with_term(Term::Reduced));
    }
    for op in removes.values() {
        out.push((*op).clone().with_term(Term::Reduced));
    }
}

/// Read view: the atoms of the surviving adds, in add order.
pub fn members(state: &Frame) -> Vec<&Atom> {
    state
        .body()
        .iter()
        .filter(|op| op.location.is_zero())
        .filter_map(|op| op.atoms.first())
        .collect()
}
