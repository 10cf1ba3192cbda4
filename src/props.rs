//! Proptest strategies and algebra laws for the three delta algebras.

use crate::caret::{Caret, CaretDelta, CaretField, CaretMap, CaretOp, Color};
use crate::clock::Timestamp;
use crate::id::SessionId;
use crate::prop::{PropDelta, PropMap};
use crate::text::{Attrs, TextDelta};
use proptest::prelude::*;
use serde_json::Value;

fn arb_value() -> impl Strategy<Value = Value> {
    (0..4i64).prop_map(Value::from)
}

fn arb_patch_value() -> impl Strategy<Value = Value> {
    prop_oneof![Just(Value::Null), arb_value()]
}

fn arb_doc_attrs() -> impl Strategy<Value = Option<Attrs>> {
    prop::collection::btree_map("[ab]", arb_value(), 0..2)
        .prop_map(|attrs| if attrs.is_empty() { None } else { Some(attrs) })
}

fn arb_patch_attrs() -> impl Strategy<Value = Option<Attrs>> {
    prop::collection::btree_map("[ab]", arb_patch_value(), 0..2)
        .prop_map(|attrs| if attrs.is_empty() { None } else { Some(attrs) })
}

pub fn arb_doc() -> impl Strategy<Value = TextDelta> {
    prop::collection::vec(("[c-f]{1,2}", arb_doc_attrs()), 0..5).prop_map(|runs| {
        runs.into_iter()
            .fold(TextDelta::new(), |doc, (text, attrs)| doc.insert(text, attrs))
    })
}

#[derive(Clone, Debug)]
enum OpSeed {
    Retain(u8, Option<Attrs>),
    Insert(String, Option<Attrs>),
    Delete(u8),
}

fn arb_op_seed() -> impl Strategy<Value = OpSeed> {
    prop_oneof![
        (1..4u8, arb_patch_attrs()).prop_map(|(n, attrs)| OpSeed::Retain(n, attrs)),
        ("[x-z]{1,2}", arb_doc_attrs()).prop_map(|(text, attrs)| OpSeed::Insert(text, attrs)),
        (1..4u8).prop_map(OpSeed::Delete),
    ]
}

/// Assembles seeds into a delta that fits a document of `doc_len`
/// elements: retains and deletes never overrun the base.
fn build_delta(doc_len: u64, seeds: Vec<OpSeed>) -> TextDelta {
    let mut remaining = doc_len;
    let mut delta = TextDelta::new();
    for seed in seeds {
        match seed {
            OpSeed::Retain(n, attrs) => {
                let n = u64::from(n).min(remaining);
                remaining -= n;
                delta = delta.retain(n, attrs);
            }
            OpSeed::Insert(text, attrs) => delta = delta.insert(text, attrs),
            OpSeed::Delete(n) => {
                let n = u64::from(n).min(remaining);
                remaining -= n;
                delta = delta.delete(n);
            }
        }
    }
    delta
}

fn arb_doc_with_deltas() -> impl Strategy<Value = (TextDelta, TextDelta, TextDelta)> {
    (
        arb_doc(),
        prop::collection::vec(arb_op_seed(), 0..5),
        prop::collection::vec(arb_op_seed(), 0..5),
    )
        .prop_map(|(doc, seeds_a, seeds_b)| {
            let len = doc.target_len();
            let a = build_delta(len, seeds_a);
            let b = build_delta(len, seeds_b);
            (doc, a, b)
        })
}

fn arb_session() -> impl Strategy<Value = SessionId> {
    (0..3u8).prop_map(|i| SessionId::new(format!("s{i}")))
}

fn arb_color() -> impl Strategy<Value = Color> {
    prop_oneof![
        Just(Color::new("#db4437").unwrap()),
        Just(Color::new("#e91e63").unwrap()),
        Just(Color::new("#9c27b0").unwrap()),
    ]
}

fn arb_caret_fields() -> impl Strategy<Value = (u64, u64, u64, u64, Color)> {
    (0..50u64, 0..5u64, 0..20u64, 0..5u64, arb_color())
}

pub fn arb_caret_map() -> impl Strategy<Value = CaretMap> {
    prop::collection::btree_map(arb_session(), arb_caret_fields(), 0..3).prop_map(|entries| {
        entries
            .into_iter()
            .map(|(session_id, (last_active, doc_rev_num, index, length, color))| {
                let caret = Caret {
                    session_id: session_id.clone(),
                    last_active: Timestamp(last_active),
                    doc_rev_num,
                    index,
                    length,
                    color,
                };
                (session_id, caret)
            })
            .collect()
    })
}

fn arb_caret_field() -> impl Strategy<Value = CaretField> {
    prop_oneof![
        Just(CaretField::DocRevNum),
        Just(CaretField::LastActive),
        Just(CaretField::Index),
        Just(CaretField::Length),
    ]
}

fn arb_caret_op() -> impl Strategy<Value = CaretOp> {
    prop_oneof![
        (arb_session(), arb_caret_fields()).prop_map(
            |(session_id, (last_active, doc_rev_num, index, length, color))| {
                CaretOp::Begin(Caret {
                    session_id,
                    last_active: Timestamp(last_active),
                    doc_rev_num,
                    index,
                    length,
                    color,
                })
            }
        ),
        (arb_session(), arb_caret_field(), 0..30u64)
            .prop_map(|(session_id, field, value)| CaretOp::SetField(session_id, field, value)),
        arb_session().prop_map(CaretOp::End),
    ]
}

pub fn arb_caret_delta() -> impl Strategy<Value = CaretDelta> {
    prop::collection::vec(arb_caret_op(), 0..5).prop_map(|ops| {
        ops.into_iter().fold(CaretDelta::new(), |delta, op| match op {
            CaretOp::Begin(caret) => delta.begin(caret),
            CaretOp::SetField(session_id, field, value) => {
                delta.set_field(session_id, field, value)
            }
            CaretOp::End(session_id) => delta.end(session_id),
        })
    })
}

pub fn arb_prop_map() -> impl Strategy<Value = PropMap> {
    prop::collection::btree_map("[a-c]", arb_value(), 0..4)
}

pub fn arb_prop_delta() -> impl Strategy<Value = PropDelta> {
    prop::collection::vec(
        prop_oneof![
            ("[a-c]", arb_value()).prop_map(|(name, value)| (name, Some(value))),
            "[a-c]".prop_map(|name| (name, None)),
        ],
        0..5,
    )
    .prop_map(|ops| {
        ops.into_iter().fold(PropDelta::new(), |delta, (name, op)| match op {
            Some(value) => delta.set(name, value),
            None => delta.delete(name),
        })
    })
}

proptest! {
    #[test]
    fn text_compose_matches_sequential_application(
        (doc, a, _) in arb_doc_with_deltas(),
        seeds in prop::collection::vec(arb_op_seed(), 0..5),
    ) {
        let mid = doc.compose(&a);
        let b = build_delta(mid.target_len(), seeds);
        prop_assert_eq!(doc.compose(&a.compose(&b)), mid.compose(&b));
    }

    #[test]
    fn text_transform_converges((doc, a, b) in arb_doc_with_deltas()) {
        let b_after_a = a.transform(&b, true);
        let a_after_b = b.transform(&a, false);
        prop_assert_eq!(
            doc.compose(&a).compose(&b_after_a),
            doc.compose(&b).compose(&a_after_b)
        );
    }

    #[test]
    fn text_diff_round_trips(x in arb_doc(), y in arb_doc()) {
        prop_assert_eq!(x.compose(&x.diff(&y)), y);
        prop_assert!(x.diff(&x).is_empty());
    }

    #[test]
    fn caret_compose_matches_sequential_application(
        map in arb_caret_map(),
        a in arb_caret_delta(),
        b in arb_caret_delta(),
    ) {
        prop_assert_eq!(a.compose(&b).apply(&map), b.apply(&a.apply(&map)));
    }

    #[test]
    fn caret_diff_round_trips(x in arb_caret_map(), y in arb_caret_map()) {
        prop_assert_eq!(CaretDelta::diff(&x, &y).apply(&x), y);
        prop_assert!(CaretDelta::diff(&x, &x).is_empty());
    }

    #[test]
    fn prop_compose_matches_sequential_application(
        map in arb_prop_map(),
        a in arb_prop_delta(),
        b in arb_prop_delta(),
    ) {
        prop_assert_eq!(a.compose(&b).apply(&map), b.apply(&a.apply(&map)));
    }

    #[test]
    fn prop_diff_round_trips(x in arb_prop_map(), y in arb_prop_map()) {
        prop_assert_eq!(PropDelta::diff(&x, &y).apply(&x), y);
        prop_assert!(PropDelta::diff(&x, &x).is_empty());
    }
}
