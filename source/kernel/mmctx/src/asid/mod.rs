// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared ASID table multiplexing hardware tags over unbounded contexts
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests + property tests (tests_prop.rs)
//! PUBLIC API: AsidTable::{new, acquire, is_bound, unbind, binding, epoch}, TagHint, TagGrant
//! DEPENDS_ON: types::{Asid, ContextId, Generation}
//! INVARIANTS: Lock-free on every path; a slot binding only changes through a sequence CAS;
//!             a slot's bound generation for a given context never decreases;
//!             tag 0 is never handed out
//!
//! Each slot is a tiny seqlock: an even sequence means the `(context, generation)`
//! pair is stable, an odd sequence means a writer is mid-update. Writers claim a
//! slot with a CAS on the sequence, so two processors never rebind the same slot at
//! once and a losing processor simply moves to the next candidate.
//!
//! Contexts keep only a [`TagHint`] (a weak reference) to the slot they last used.
//! The hint is re-validated against the slot on every acquisition; eviction by
//! another processor is detected there and never leaves a dangling owner.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use crate::config::MAX_ASIDS;
use crate::error::AllocError;
use crate::types::{Asid, ContextId, Generation};

// Every tag must fit the hint's tag field.
static_assertions::const_assert!(MAX_ASIDS as u64 <= TagHint::TAG_MASK + 1);

/// Binding recorded in one table slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub context: ContextId,
    pub generation: Generation,
}

/// How a tag was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantKind {
    /// The hinted slot was already bound to the requested context and generation.
    Hit,
    /// The hinted slot still belonged to the context but carried an older generation.
    Rebound,
    /// A victim slot was taken over from its previous owner.
    Evicted,
}

/// Result of [`AsidTable::acquire`].
#[must_use = "the granted tag must be installed"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TagGrant {
    pub tag: Asid,
    /// Generation the slot is bound to; never older than the one requested.
    pub generation: Generation,
    pub kind: GrantKind,
}

/// Weak per-context reference to the slot most recently bound to it.
///
/// The low 16 bits hold the tag (0 = none); the rest is a change counter so a hint that
/// went A -> B -> A between a load and a compare-exchange is still seen as changed.
#[derive(Debug)]
pub struct TagHint(AtomicU64);

impl TagHint {
    const TAG_MASK: u64 = 0xFFFF;

    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn load(&self) -> Option<Asid> {
        Self::tag_of(self.snapshot())
    }

    #[inline]
    fn snapshot(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn tag_of(word: u64) -> Option<Asid> {
        match (word & Self::TAG_MASK) as u16 {
            0 => None,
            raw => Some(Asid::from_raw(raw)),
        }
    }

    fn replace(&self, expected: u64, tag: Asid) -> bool {
        let next = ((expected >> 16).wrapping_add(1) << 16) | u64::from(tag.as_raw());
        self.0
            .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Default for TagHint {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TagSlot {
    seq: AtomicU64,
    context: AtomicU64,
    generation: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotRead {
    /// A writer is mid-update.
    Busy,
    Free { seq: u64 },
    Bound { seq: u64, binding: Binding },
}

impl TagSlot {
    const fn new() -> Self {
        Self { seq: AtomicU64::new(0), context: AtomicU64::new(0), generation: AtomicU64::new(0) }
    }

    fn read(&self) -> SlotRead {
        let before = self.seq.load(Ordering::Acquire);
        if before & 1 != 0 {
            return SlotRead::Busy;
        }
        let context = self.context.load(Ordering::Relaxed);
        let generation = self.generation.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if self.seq.load(Ordering::Relaxed) != before {
            return SlotRead::Busy;
        }
        match ContextId::decode(context) {
            None => SlotRead::Free { seq: before },
            Some(context) => SlotRead::Bound {
                seq: before,
                binding: Binding { context, generation: Generation::from_raw(generation) },
            },
        }
    }

    /// Rewrites the slot if its sequence is still `seq`.
    fn try_write(&self, seq: u64, context: u64, generation: u64) -> bool {
        if self
            .seq
            .compare_exchange(seq, seq.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        fence(Ordering::Release);
        self.context.store(context, Ordering::Relaxed);
        self.generation.store(generation, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
        true
    }
}

/// Arena of hardware tags shared by every processor.
pub struct AsidTable {
    slots: Box<[TagSlot]>,
    next_victim: AtomicUsize,
    epoch: AtomicU64,
}

impl AsidTable {
    /// Creates a table with `asid_count` tags; tag 0 is reserved and never bound.
    pub fn new(asid_count: u16) -> Result<Self, AllocError> {
        let len = usize::from(asid_count).max(2);
        let mut slots = Vec::new();
        slots.try_reserve_exact(len).map_err(|_| AllocError)?;
        slots.extend((0..len).map(|_| TagSlot::new()));
        Ok(Self {
            slots: slots.into_boxed_slice(),
            next_victim: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
        })
    }

    /// Number of tags that can be bound (excludes the kernel tag).
    pub fn usable_tags(&self) -> usize {
        self.slots.len() - 1
    }

    /// Global epoch; advances on every rebinding and on generation bumps of bound contexts.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn advance_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn slot(&self, tag: Asid) -> &TagSlot {
        match self.slots.get(tag.as_index()) {
            Some(slot) if tag != Asid::KERNEL => slot,
            _ => crate::diag::fatal(
                "asid",
                format_args!("tag {} outside table of {}", tag, self.slots.len()),
            ),
        }
    }

    /// Current binding of `tag`, or `None` when free or mid-update.
    pub fn binding(&self, tag: Asid) -> Option<Binding> {
        match self.slot(tag).read() {
            SlotRead::Bound { binding, .. } => Some(binding),
            _ => None,
        }
    }

    /// Returns true when `tag` is stably bound to exactly `(context, generation)`.
    pub fn is_bound(&self, tag: Asid, context: ContextId, generation: Generation) -> bool {
        self.binding(tag) == Some(Binding { context, generation })
    }

    /// Returns true when the hinted slot still belongs to `context`.
    pub fn holds(&self, context: ContextId, hint: &TagHint) -> bool {
        hint.load()
            .and_then(|tag| self.binding(tag))
            .map_or(false, |binding| binding.context == context)
    }

    /// Counts slots bound to `context`. Diagnostic scan; not for the switch path.
    pub fn bindings_for(&self, context: ContextId) -> usize {
        self.slots
            .iter()
            .skip(1)
            .filter(|slot| {
                matches!(slot.read(), SlotRead::Bound { binding, .. } if binding.context == context)
            })
            .count()
    }

    fn pick_victim(&self) -> Asid {
        let usable = self.usable_tags();
        let index = 1 + self.next_victim.fetch_add(1, Ordering::Relaxed) % usable;
        Asid::from_raw(index as u16)
    }

    /// Finds or binds a tag for `(context, generation)`.
    ///
    /// A hit reuses the hinted slot. Otherwise the hinted slot is rebound in place when it
    /// still belongs to `context`, or a victim is taken round-robin. Whether the grant needs
    /// a local invalidation is decided by the caller against its own per-tag view.
    ///
    /// Never fails: a slot mid-update is waited out, and every lost compare-exchange means
    /// another processor completed its own binding.
    pub fn acquire(&self, context: ContextId, generation: Generation, hint: &TagHint) -> TagGrant {
        loop {
            let word = hint.snapshot();
            if let Some(tag) = TagHint::tag_of(word) {
                match self.slot(tag).read() {
                    SlotRead::Busy => {
                        core::hint::spin_loop();
                        continue;
                    }
                    SlotRead::Bound { binding, .. }
                        if binding.context == context && binding.generation >= generation =>
                    {
                        return TagGrant { tag, generation: binding.generation, kind: GrantKind::Hit };
                    }
                    SlotRead::Bound { seq, binding } if binding.context == context => {
                        if self.slot(tag).try_write(seq, context.as_raw(), generation.as_raw()) {
                            self.advance_epoch();
                            return TagGrant { tag, generation, kind: GrantKind::Rebound };
                        }
                        continue;
                    }
                    // Evicted or released: fall through to victim selection.
                    _ => {}
                }
            }

            let victim = self.pick_victim();
            let seq = match self.slot(victim).read() {
                SlotRead::Busy => {
                    core::hint::spin_loop();
                    continue;
                }
                SlotRead::Free { seq } | SlotRead::Bound { seq, .. } => seq,
            };
            if !self.slot(victim).try_write(seq, context.as_raw(), generation.as_raw()) {
                continue;
            }
            self.advance_epoch();
            if hint.replace(word, victim) {
                return TagGrant { tag: victim, generation, kind: GrantKind::Evicted };
            }
            // Another processor bound a slot for this context first. Ours was never used
            // for a translation, so it can go back without an invalidation.
            self.unbind(victim, context);
        }
    }

    /// Releases `tag` if it is still bound to `context`.
    pub fn unbind(&self, tag: Asid, context: ContextId) -> bool {
        let slot = self.slot(tag);
        loop {
            match slot.read() {
                SlotRead::Busy => core::hint::spin_loop(),
                SlotRead::Bound { seq, binding } if binding.context == context => {
                    if slot.try_write(seq, ContextId::NONE_RAW, 0) {
                        self.advance_epoch();
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Releases the hinted slot of a dying context and forgets the hint.
    pub fn release_hint(&self, context: ContextId, hint: &TagHint) -> bool {
        let released = hint.load().map_or(false, |tag| self.unbind(tag, context));
        hint.clear();
        released
    }
}


#[cfg(test)]
mod tests_prop;
