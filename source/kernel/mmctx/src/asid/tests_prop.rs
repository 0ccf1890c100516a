// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the shared ASID table
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic. Drives the table against a plain model.
//!
//! TEST_SCOPE:
//!   - Hits only ever reuse a slot already bound to the same (context, generation)
//!   - A context never owns more than one slot when driven from one processor
//!   - Slot generations for a context never move backwards
//!
//! TEST_SCENARIOS:
//!   - hit_implies_unchanged_binding(): model binding before a Hit equals the grant
//!   - single_binding_per_context(): bindings_for() stays at most 1
//!   - generations_never_decrease(): rebinding keeps the slot generation monotonic

use std::collections::HashMap;

use super::{AsidTable, GrantKind, TagHint};
use crate::types::{Asid, ContextId, Generation};
use proptest::prelude::*;

#[derive(Clone, Copy, Debug)]
enum Op {
    Acquire(usize),
    Bump(usize),
}

fn arb_ops(contexts: usize) -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            3 => (0..contexts).prop_map(Op::Acquire),
            1 => (0..contexts).prop_map(Op::Bump),
        ],
        1..200,
    )
}

struct Model {
    hints: Vec<TagHint>,
    generations: Vec<u64>,
    slots: HashMap<Asid, (ContextId, Generation)>,
}

impl Model {
    fn new(contexts: usize) -> Self {
        Self {
            hints: (0..contexts).map(|_| TagHint::new()).collect(),
            generations: vec![0; contexts],
            slots: HashMap::new(),
        }
    }
}

fn context(index: usize) -> ContextId {
    ContextId::from_raw(index as u64 + 1)
}

proptest! {
    #[test]
    fn hit_implies_unchanged_binding(asids in 2u16..6, ops in arb_ops(8)) {
        let table = AsidTable::new(asids).unwrap();
        let mut model = Model::new(8);
        for op in ops {
            match op {
                Op::Bump(i) => model.generations[i] += 1,
                Op::Acquire(i) => {
                    let gen = Generation::from_raw(model.generations[i]);
                    let grant = table.acquire(context(i), gen, &model.hints[i]);
                    if grant.kind == GrantKind::Hit {
                        prop_assert_eq!(model.slots.get(&grant.tag).copied(), Some((context(i), gen)));
                    }
                    prop_assert_eq!(grant.generation, gen);
                    prop_assert!(table.is_bound(grant.tag, context(i), gen));
                    model.slots.insert(grant.tag, (context(i), gen));
                }
            }
        }
    }

    #[test]
    fn single_binding_per_context(asids in 2u16..6, ops in arb_ops(8)) {
        let table = AsidTable::new(asids).unwrap();
        let mut model = Model::new(8);
        for op in ops {
            match op {
                Op::Bump(i) => model.generations[i] += 1,
                Op::Acquire(i) => {
                    let gen = Generation::from_raw(model.generations[i]);
                    let grant = table.acquire(context(i), gen, &model.hints[i]);
                    prop_assert_ne!(grant.tag, Asid::KERNEL);
                    prop_assert_eq!(model.hints[i].load(), Some(grant.tag));
                }
            }
            for i in 0..8 {
                prop_assert!(table.bindings_for(context(i)) <= 1);
            }
        }
    }

    #[test]
    fn generations_never_decrease(bumps in proptest::collection::vec(0u64..4, 1..50)) {
        let table = AsidTable::new(4).unwrap();
        let hint = TagHint::new();
        let mut requested = 0u64;
        let mut last_bound = 0u64;
        for step in bumps {
            // Requests may lag behind; the slot must keep the newest generation seen.
            requested = (requested + step).saturating_sub(step / 2);
            let grant = table.acquire(context(0), Generation::from_raw(requested), &hint);
            prop_assert!(grant.generation.as_raw() >= last_bound);
            last_bound = grant.generation.as_raw();
        }
    }
}
