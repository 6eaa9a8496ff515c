use opsync::{Atom, Frame, Op, Sep, Term, Uuid, VersionVector, Word, base64, reduce};
use proptest::prelude::*;

fn arb_word() -> impl Strategy<Value = Word> {
    (0u64..(1u64 << 60)).prop_map(Word::new)
}

fn arb_sep() -> impl Strategy<Value = Sep> {
    prop_oneof![
        Just(Sep::Event),
        Just(Sep::Derived),
        Just(Sep::Name),
        Just(Sep::Hash),
        Just(Sep::Error),
    ]
}

fn arb_uuid() -> impl Strategy<Value = Uuid> {
    (arb_word(), arb_word(), arb_sep()).prop_map(|(value, origin, sep)| Uuid { value, origin, sep })
}

fn arb_atom() -> impl Strategy<Value = Atom> {
    prop_oneof![
        any::<i64>().prop_map(Atom::Int),
        "[ -~]{0,12}".prop_map(Atom::String),
        arb_uuid().prop_map(Atom::Uuid),
    ]
}

fn arb_term() -> impl Strategy<Value = Term> {
    prop_oneof![
        Just(Term::Raw),
        Just(Term::Reduced),
        Just(Term::Header),
        Just(Term::Query),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    (
        arb_uuid(),
        arb_uuid(),
        arb_uuid(),
        arb_uuid(),
        prop::collection::vec(arb_atom(), 0..3),
        arb_term(),
    )
        .prop_map(|(ty, object, event, location, atoms, term)| {
            Op::new(ty, object, event, location)
                .with_atoms(atoms)
                .with_term(term)
        })
}

/// Frames of LWW ops over a handful of locations, with unique event stamps.
fn arb_lww_ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec((0u8..5, any::<i64>()), 1..20).prop_map(|entries| {
        let object: Uuid = "doc".parse().unwrap();
        entries
            .iter()
            .enumerate()
            .map(|(i, &(loc, value))| {
                let origin: Word = if i % 2 == 0 { "X" } else { "Y" }.parse().unwrap();
                let location = Uuid {
                    value: Word::new(loc as u64 + 1),
                    origin: Word::ZERO,
                    sep: Sep::Name,
                };
                Op::new(
                    reduce::LWW,
                    object,
                    Uuid::event(Word::new(i as u64 + 1), origin),
                    location,
                )
                .with_atoms(vec![Atom::Int(value)])
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_base64_roundtrip(value in 0u64..(1u64 << 60)) {
        prop_assert_eq!(base64::decode(&base64::encode(value)).unwrap(), value);
    }

    #[test]
    fn prop_token_order_matches_numeric(a in 0u64..(1u64 << 60), b in 0u64..(1u64 << 60)) {
        prop_assert_eq!(a.cmp(&b), base64::encode(a).cmp(&base64::encode(b)));
    }

    #[test]
    fn prop_uuid_display_roundtrip(u in arb_uuid()) {
        prop_assert_eq!(u.to_string().parse::<Uuid>().unwrap(), u);
    }

    #[test]
    fn prop_uuid_relative_roundtrip(u in arb_uuid(), ctx in arb_uuid()) {
        let serialized = u.relative(&ctx);
        prop_assert_eq!(Uuid::parse_relative(&serialized, &ctx).unwrap(), u);
    }

    #[test]
    fn prop_frame_text_roundtrip(ops in prop::collection::vec(arb_op(), 0..6)) {
        let frame = Frame::from_ops(ops);
        let parsed = Frame::parse_text(&frame.to_text()).unwrap();
        prop_assert_eq!(parsed, frame);
    }

    #[test]
    fn prop_vv_covers_after_see(stamps in prop::collection::vec((arb_word(), arb_word()), 0..20)) {
        let mut vv = VersionVector::new();
        let stamps: Vec<Uuid> = stamps
            .into_iter()
            .map(|(value, origin)| Uuid::event(value, origin))
            .collect();
        for stamp in &stamps {
            vv.see(stamp);
        }
        for stamp in &stamps {
            prop_assert!(vv.covers(stamp));
        }
        prop_assert!(vv.covers(&Uuid::ZERO));
    }

    #[test]
    fn prop_lww_reduce_commutes(ops in arb_lww_ops(), split in any::<prop::sample::Index>()) {
        let cut = split.index(ops.len() + 1);
        let a = Frame::from_ops(ops[..cut].to_vec());
        let b = Frame::from_ops(ops[cut..].to_vec());
        prop_assert_eq!(reduce::reduce(&a, &b), reduce::reduce(&b, &a));
    }

    #[test]
    fn prop_lww_reduce_idempotent(ops in arb_lww_ops()) {
        let change = Frame::from_ops(ops);
        let state = reduce::reduce(&Frame::new(), &change);
        prop_assert_eq!(reduce::reduce(&state, &state), state);
    }

    #[test]
    fn prop_lww_reduce_associative(ops in arb_lww_ops(), x in any::<prop::sample::Index>(), y in any::<prop::sample::Index>()) {
        let mut i = x.index(ops.len() + 1);
        let mut j = y.index(ops.len() + 1);
        if i > j {
            std::mem::swap(&mut i, &mut j);
        }
        let a = Frame::from_ops(ops[..i].to_vec());
        let b = Frame::from_ops(ops[i..j].to_vec());
        let c = Frame::from_ops(ops[j..].to_vec());
        let left = reduce::reduce(&reduce::reduce(&a, &b), &c);
        let right = reduce::reduce(&a, &reduce::reduce(&b, &c));
        prop_assert_eq!(left, right);
    }
}
