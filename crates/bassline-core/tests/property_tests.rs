//! # Property-Based Tests
//!
//! Blend laws and structural invariants checked over generated inputs.

#![allow(clippy::unwrap_used, clippy::panic)]

use bassline_core::{
    BlendMode, BlendOutcome, ContactGroup, ContactId, GadgetRegistry, Position, WireType,
};
use proptest::prelude::*;
use serde_json::{Value, json};

// =============================================================================
// HELPERS
// =============================================================================

/// Fold a sequence of writes through one blend mode.
fn settle(mode: BlendMode, writes: &[Value]) -> Option<Value> {
    let mut current: Option<Value> = None;
    for write in writes {
        if let BlendOutcome::Changed(next) = mode.blend(current.as_ref(), write) {
            current = Some(next);
        }
    }
    current
}

fn wire_type(bidirectional: bool) -> WireType {
    if bidirectional {
        WireType::Bidirectional
    } else {
        WireType::Directed
    }
}

/// A group with `n` contacts, the given wires, and an adder gadget whose
/// inputs are fed by the first contact.
fn network(n: usize, wires: &[(usize, usize, bool)], registry: &GadgetRegistry) -> ContactGroup {
    use bassline_core::PrimitiveRegistry;

    let mut group = ContactGroup::new("generated");
    let ids: Vec<ContactId> = (0..n)
        .map(|_| group.add_contact(Position::default(), None))
        .collect();
    for &(from, to, bidirectional) in wires {
        let (from, to) = (ids[from % n], ids[to % n]);
        if from != to {
            group.connect(from, to, wire_type(bidirectional)).unwrap();
        }
    }
    let adder = registry.build("core/add").unwrap();
    let port = adder.boundary_by_name("a").map(|c| c.id).unwrap();
    group.add_subgroup(adder);
    group.connect(ids[0], port, WireType::Directed).unwrap();
    group
}

// =============================================================================
// BLEND LAWS
// =============================================================================

proptest! {
    #[test]
    fn max_holds_the_largest_write(writes in prop::collection::vec(-1000i64..1000, 1..30)) {
        let values: Vec<Value> = writes.iter().map(|n| json!(n)).collect();
        let expected = writes.iter().max().copied().unwrap();
        prop_assert_eq!(settle(BlendMode::Max, &values), Some(json!(expected)));
    }

    #[test]
    fn min_holds_the_smallest_write(writes in prop::collection::vec(-1000i64..1000, 1..30)) {
        let values: Vec<Value> = writes.iter().map(|n| json!(n)).collect();
        let expected = writes.iter().min().copied().unwrap();
        prop_assert_eq!(settle(BlendMode::Min, &values), Some(json!(expected)));
    }

    #[test]
    fn set_union_keeps_first_seen_order(writes in prop::collection::vec(0u8..20, 1..30)) {
        let values: Vec<Value> = writes.iter().map(|n| json!(n)).collect();
        let mut expected: Vec<Value> = Vec::new();
        for value in &values {
            if !expected.contains(value) {
                expected.push(value.clone());
            }
        }
        let settled = settle(BlendMode::SetUnion, &values);
        prop_assert_eq!(settled.clone(), Some(Value::Array(expected)));

        // Re-delivering any member is a no-op.
        for value in &values {
            prop_assert_eq!(
                BlendMode::SetUnion.blend(settled.as_ref(), value),
                BlendOutcome::Unchanged
            );
        }
    }

    #[test]
    fn boolean_or_latches_true(writes in prop::collection::vec(any::<bool>(), 1..30)) {
        let values: Vec<Value> = writes.iter().map(|b| json!(b)).collect();
        let expected = writes.iter().any(|b| *b);
        prop_assert_eq!(settle(BlendMode::BooleanOr, &values), Some(json!(expected)));
    }

    #[test]
    fn accept_last_keeps_the_final_write(writes in prop::collection::vec(any::<i32>(), 1..30)) {
        let values: Vec<Value> = writes.iter().map(|n| json!(n)).collect();
        prop_assert_eq!(settle(BlendMode::AcceptLast, &values), values.last().cloned());
    }

    #[test]
    fn max_rejects_every_regression(held in 0i64..1000, drop in 1i64..1000) {
        let outcome = BlendMode::Max.blend(Some(&json!(held)), &json!(held - drop));
        prop_assert!(matches!(outcome, BlendOutcome::Contradiction(_)));
    }
}

// =============================================================================
// PROPAGATION
// =============================================================================

proptest! {
    #[test]
    fn directed_chain_carries_value_to_tail(len in 2usize..15, value in any::<i64>()) {
        let mut group = ContactGroup::new("chain");
        let ids: Vec<ContactId> = (0..len)
            .map(|_| group.add_contact(Position::default(), None))
            .collect();
        for pair in ids.windows(2) {
            group.connect(pair[0], pair[1], WireType::Directed).unwrap();
        }

        group.deliver_content(ids[0], Some(json!(value)), None).unwrap();

        for id in &ids {
            prop_assert_eq!(
                group.contact(*id).and_then(|c| c.content.clone()),
                Some(json!(value))
            );
        }
    }

    #[test]
    fn directed_wire_never_flows_backwards(len in 2usize..10, value in any::<i64>()) {
        let mut group = ContactGroup::new("chain");
        let ids: Vec<ContactId> = (0..len)
            .map(|_| group.add_contact(Position::default(), None))
            .collect();
        for pair in ids.windows(2) {
            group.connect(pair[0], pair[1], WireType::Directed).unwrap();
        }

        let tail = ids[len - 1];
        group.deliver_content(tail, Some(json!(value)), None).unwrap();

        for id in &ids[..len - 1] {
            prop_assert_eq!(group.contact(*id).and_then(|c| c.content.clone()), None);
        }
    }
}

// =============================================================================
// TEMPLATES
// =============================================================================

proptest! {
    #[test]
    fn template_survives_import(
        n in 1usize..12,
        wires in prop::collection::vec((0usize..12, 0usize..12, any::<bool>()), 0..20),
    ) {
        let registry = GadgetRegistry::with_builtins();
        let original = network(n, &wires, &registry);
        let template = original.to_template();

        let import = ContactGroup::from_template(&template, &registry).unwrap();

        prop_assert!(import.skipped.is_empty());
        prop_assert_eq!(import.group.counts(), original.counts());
        prop_assert_eq!(import.group.to_template(), template);
    }

    #[test]
    fn imported_copies_share_no_ids(n in 1usize..8) {
        let registry = GadgetRegistry::with_builtins();
        let original = network(n, &[], &registry);
        let import = ContactGroup::from_template(&original.to_template(), &registry).unwrap();

        let before = original.snapshot().contact_ids();
        let after = import.group.snapshot().contact_ids();
        prop_assert!(after.iter().all(|id| !before.contains(id)));
    }
}
