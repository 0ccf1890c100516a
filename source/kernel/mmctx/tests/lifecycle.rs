// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host tests for context creation, fork and destruction
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! TEST_COVERAGE: 7 integration tests
//!
//! TEST_SCOPE:
//!   - Identity uniqueness and ordering under concurrent creation
//!   - Fork copies auxiliary resources by value
//!   - Create/destroy round trips leave no tag bindings behind
//!
//! TEST_SCENARIOS:
//!   - concurrent_creation_yields_unique_increasing_ids(): 4 threads x 250 contexts
//!   - fork_is_independent_of_parent(): keys, pointer mask, LDT and flags diverge after fork
//!   - round_trip_leaves_no_bindings(): switch, destroy, scan the table
//!   - destroy_releases_descriptor_table(): weak table reference dies with the context
//!   - live_count_tracks_dropped_handles(): contexts released without destroy still leave
//!
//! DEPENDENCIES:
//!   - common::RecordingHal: recording hardware layer

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use common::{cpu, manager};
use neuron_mmctx::{ContextFlags, Descriptor, HwFeatures, MmCtxError, Pkey, PointerMask};

#[test]
fn concurrent_creation_yields_unique_increasing_ids() {
    let mgr = manager(HwFeatures::PCID, 16);
    let per_thread: Vec<Vec<u64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    (0..250)
                        .map(|_| mgr.create_context().map(|ctx| ctx.id().as_raw()))
                        .collect::<Result<Vec<_>, _>>()
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for ids in &per_thread {
        // Each thread observes its own identities in increasing order.
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        for id in ids {
            assert!(seen.insert(*id));
        }
    }
    assert_eq!(seen.len(), 1000);
    assert_eq!(seen.iter().max(), Some(&1000));
}

#[test]
fn fork_is_independent_of_parent() {
    let all = HwFeatures::PCID | HwFeatures::OSPKE | HwFeatures::LAM | HwFeatures::LDT;
    let mgr = manager(all, 16);
    let parent = mgr.create_context().unwrap();
    let key = parent.pkey_alloc().unwrap();
    let xonly = parent.execute_only_pkey().unwrap();
    parent.enable_pointer_tagging(6).unwrap();
    parent.set_notrack();
    parent.replace_descriptor_table(&[Descriptor::flat_user(true, true), Descriptor::flat_user(false, false)]).unwrap();

    let child = mgr.fork_context(&parent).unwrap();
    assert!(child.id() > parent.id());
    assert_eq!(child.pkey_state(), parent.pkey_state());
    assert_eq!(child.execute_only_pkey().unwrap(), xonly);
    assert_eq!(child.pointer_mask(), PointerMask::U57);
    assert_eq!(child.untag_mask(), parent.untag_mask());
    assert_eq!(child.flags(), ContextFlags::NOTRACK);
    let (pt, ct) = (parent.descriptor_table().unwrap(), child.descriptor_table().unwrap());
    assert_eq!(pt.entries(), ct.entries());
    assert!(!Arc::ptr_eq(&pt, &ct));

    // Diverge.
    child.pkey_free(key).unwrap();
    child.write_descriptor(5, Descriptor::flat_user(false, true)).unwrap();
    mgr.bump_generation(&child);
    assert!(parent.pkey_is_allocated(key));
    assert_eq!(parent.descriptor_table().unwrap().len(), 2);
    assert_eq!(child.descriptor_table().unwrap().len(), 6);
    assert_eq!(parent.generation().as_raw(), 0);
}

#[test]
fn pkeys_follow_hardware_support() {
    let mgr = manager(HwFeatures::PCID, 16);
    let ctx = mgr.create_context().unwrap();
    assert_eq!(ctx.pkey_state().allocation_map(), 0);
    assert_eq!(ctx.pkey_alloc(), Err(MmCtxError::Unsupported));
    assert_eq!(ctx.execute_only_pkey(), Ok(None));

    let mgr = manager(HwFeatures::OSPKE, 16);
    let ctx = mgr.create_context().unwrap();
    assert!(ctx.pkey_is_allocated(Pkey::DEFAULT));
    assert_eq!(ctx.pkey_free(Pkey::DEFAULT), Err(MmCtxError::InvalidArgs));
    assert_eq!(ctx.enable_pointer_tagging(6), Err(MmCtxError::Unsupported));
}

#[test]
fn round_trip_leaves_no_bindings() {
    let mgr = manager(HwFeatures::PCID, 8);
    let contexts: Vec<_> = (0..12).map(|_| mgr.create_context().unwrap()).collect();
    {
        let mut p0 = mgr.claim_processor(cpu(0)).unwrap();
        let mut p1 = mgr.claim_processor(cpu(1)).unwrap();
        for (i, ctx) in contexts.iter().enumerate() {
            let _ = if i % 2 == 0 { p0.switch_to(ctx) } else { p1.switch_to(ctx) };
        }
        p0.switch_to_kernel();
        p1.switch_to_kernel();
    }
    let ids: Vec<_> = contexts.iter().map(|ctx| ctx.id()).collect();
    for ctx in contexts {
        mgr.destroy_context(ctx).unwrap();
    }
    assert_eq!(mgr.live_contexts(), 0);
    for id in ids {
        assert_eq!(mgr.asid_table().bindings_for(id), 0);
    }
}

#[test]
fn destroy_releases_descriptor_table() {
    let mgr = manager(HwFeatures::PCID | HwFeatures::LDT, 8);
    let ctx = mgr.create_context().unwrap();
    ctx.write_descriptor(0, Descriptor::flat_user(false, false)).unwrap();
    let weak_table = Arc::downgrade(&ctx.descriptor_table().unwrap());
    let weak_ctx = ctx.downgrade();
    mgr.destroy_context(ctx).unwrap();
    assert!(weak_table.upgrade().is_none());
    assert!(weak_ctx.upgrade().is_none());
}

#[test]
fn destroy_while_shared_returns_handle() {
    let mgr = manager(HwFeatures::PCID, 8);
    let ctx = mgr.create_context().unwrap();
    let task_ref = ctx.clone();
    let err = mgr.destroy_context(ctx).unwrap_err();
    assert_eq!(err.reason, MmCtxError::InUse);
    assert!(err.handle.same_context(&task_ref));
    assert_eq!(mgr.live_contexts(), 1);
}

#[test]
fn live_count_tracks_dropped_handles() {
    let mgr = manager(HwFeatures::PCID, 8);
    let contexts: Vec<_> = (0..4).map(|_| mgr.create_context().unwrap()).collect();
    let child = mgr.fork_context(&contexts[0]).unwrap();
    assert_eq!(mgr.live_contexts(), 5);
    {
        let mut p0 = mgr.claim_processor(cpu(0)).unwrap();
        let _ = p0.switch_to(&child);
        drop(child);
        // The processor still holds the child.
        assert_eq!(mgr.live_contexts(), 5);
    }
    assert_eq!(mgr.live_contexts(), 4);
    drop(contexts);
    assert_eq!(mgr.live_contexts(), 0);
}
