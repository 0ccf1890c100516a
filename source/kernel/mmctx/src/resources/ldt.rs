// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Double-buffered local descriptor table of one context
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests + integration (tests/ldt_replace.rs)
//! PUBLIC API: Descriptor, DescriptorTable, LdtSlot, LdtSlots::{current, version}
//! DEPENDS_ON: alloc::sync::Arc, error::MmCtxError
//! INVARIANTS: Entries of a published table never change; a slot is only rewritten once
//!             no reader can still be inside it; writers are serialized by the context lock
//!
//! Two slots back the table. A writer fills the slot that is not visible, flips the
//! visible index, then waits for readers of the old slot to leave before dropping it.
//! Readers announce themselves in a per-slot counter and re-check the visible index,
//! so a reader either sees the flip or the writer sees the reader. Tables handed to
//! processors are reference counted and outlive the slot that published them.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::error::{AllocError, MmCtxError};
use crate::types::ContextId;

/// Architectural limit on descriptor table entries.
pub const LDT_ENTRIES: usize = 8192;

const DESC_S: u64 = 1 << 44;
const DESC_DPL_SHIFT: u32 = 45;
const DESC_DPL_MASK: u64 = 0b11 << DESC_DPL_SHIFT;
const DESC_P: u64 = 1 << 47;
const DESC_TYPE_CODE: u64 = 1 << 43;
const DESC_TYPE_RW: u64 = 1 << 41;
const DESC_L: u64 = 1 << 53;
const DESC_DB: u64 = 1 << 54;
const DESC_G: u64 = 1 << 55;

/// One raw 8-byte segment descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Descriptor(u64);

impl Descriptor {
    pub const NULL: Self = Self(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn is_present(self) -> bool {
        self.0 & DESC_P != 0
    }

    /// Flat 4 GiB user segment; `code` selects execute/read, otherwise read/write data.
    pub const fn flat_user(code: bool, long_mode: bool) -> Self {
        let mut raw = 0xFFFF_u64 | (0xF_u64 << 48) | DESC_P | DESC_S | DESC_DPL_MASK | DESC_G | DESC_TYPE_RW;
        if code {
            raw |= DESC_TYPE_CODE;
            raw |= if long_mode { DESC_L } else { DESC_DB };
        } else {
            raw |= DESC_DB;
        }
        Self(raw)
    }

    /// Present entries must be user-privilege code or data segments.
    pub fn validate(self) -> Result<(), MmCtxError> {
        if !self.is_present() {
            return Ok(());
        }
        if self.0 & DESC_S == 0 || self.0 & DESC_DPL_MASK != DESC_DPL_MASK {
            return Err(MmCtxError::InvalidDescriptor);
        }
        Ok(())
    }
}

/// Which of the two backing slots holds a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LdtSlot {
    A,
    B,
}

impl LdtSlot {
    const fn index(self) -> usize {
        match self {
            LdtSlot::A => 0,
            LdtSlot::B => 1,
        }
    }

    const fn other(self) -> Self {
        match self {
            LdtSlot::A => LdtSlot::B,
            LdtSlot::B => LdtSlot::A,
        }
    }

    const fn visible_tag(self) -> u8 {
        self.index() as u8 + 1
    }

    const fn from_visible_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(LdtSlot::A),
            2 => Some(LdtSlot::B),
            _ => None,
        }
    }
}

/// Immutable descriptor table as loaded into the LDTR.
#[derive(Debug, PartialEq, Eq)]
pub struct DescriptorTable {
    entries: Vec<Descriptor>,
    slot: LdtSlot,
}

impl DescriptorTable {
    fn build(owner: ContextId, entries: &[Descriptor], slot: LdtSlot) -> Result<Self, MmCtxError> {
        if entries.is_empty() || entries.len() > LDT_ENTRIES {
            return Err(MmCtxError::InvalidArgs);
        }
        for desc in entries {
            desc.validate()?;
        }
        #[cfg(feature = "failpoints")]
        if failpoints::take(owner) {
            return Err(AllocError.into());
        }
        #[cfg(not(feature = "failpoints"))]
        let _ = owner;
        let mut copy = Vec::new();
        copy.try_reserve_exact(entries.len()).map_err(|_| AllocError)?;
        copy.extend_from_slice(entries);
        Ok(Self { entries: copy, slot })
    }

    pub fn entries(&self) -> &[Descriptor] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn slot(&self) -> LdtSlot {
        self.slot
    }
}

/// Double-buffered holder of a context's descriptor table.
pub struct LdtSlots {
    /// 0 = no table, 1 = slot A, 2 = slot B.
    visible: AtomicU8,
    readers: [AtomicUsize; 2],
    slots: [UnsafeCell<Option<Arc<DescriptorTable>>>; 2],
    version: AtomicU64,
}

// SAFETY: slot contents are only written by the single lock-holding writer while the
// slot is invisible and drained of readers; readers only clone out of a visible slot
// they have registered in.
unsafe impl Sync for LdtSlots {}

impl LdtSlots {
    /// Empty table, as every context starts.
    pub const fn new() -> Self {
        Self {
            visible: AtomicU8::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            slots: [UnsafeCell::new(None), UnsafeCell::new(None)],
            version: AtomicU64::new(0),
        }
    }

    /// Bumped on every replace or destroy; processors reload when it moves.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_table(&self) -> bool {
        self.visible.load(Ordering::Acquire) != 0
    }

    pub fn visible_slot(&self) -> Option<LdtSlot> {
        LdtSlot::from_visible_tag(self.visible.load(Ordering::SeqCst))
    }

    /// Returns the published table. Never blocks on a writer.
    pub fn current(&self) -> Option<Arc<DescriptorTable>> {
        loop {
            let seen = self.visible.load(Ordering::SeqCst);
            let slot = LdtSlot::from_visible_tag(seen)?;
            let readers = &self.readers[slot.index()];
            readers.fetch_add(1, Ordering::SeqCst);
            if self.visible.load(Ordering::SeqCst) != seen {
                readers.fetch_sub(1, Ordering::Release);
                continue;
            }
            // SAFETY: the slot is visible and we are registered as its reader, so the
            // writer will not touch it until we deregister.
            let table = unsafe { (*self.slots[slot.index()].get()).clone() };
            readers.fetch_sub(1, Ordering::Release);
            return table;
        }
    }

    fn drain(&self, slot: LdtSlot) {
        while self.readers[slot.index()].load(Ordering::SeqCst) != 0 {
            core::hint::spin_loop();
        }
    }

    /// Publishes `entries` as the new table. Caller holds the context lock.
    pub(crate) fn replace(&self, owner: ContextId, entries: &[Descriptor]) -> Result<(), MmCtxError> {
        let old = self.visible_slot();
        let target = old.map_or(LdtSlot::A, LdtSlot::other);
        let table = Arc::new(DescriptorTable::build(owner, entries, target)?);

        self.drain(target);
        // SAFETY: `target` is not visible and has no registered readers; late readers
        // see a different visible index on their re-check and back off.
        unsafe { *self.slots[target.index()].get() = Some(table) };
        self.visible.store(target.visible_tag(), Ordering::SeqCst);
        if let Some(old) = old {
            self.release(old);
        }
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Writes one entry, growing the table as needed. Caller holds the context lock.
    pub(crate) fn write_descriptor(
        &self,
        owner: ContextId,
        index: usize,
        desc: Descriptor,
    ) -> Result<(), MmCtxError> {
        if index >= LDT_ENTRIES {
            return Err(MmCtxError::InvalidArgs);
        }
        desc.validate()?;
        let current = self.current();
        let old = current.as_ref().map_or(&[][..], |table| table.entries());
        let mut entries = Vec::new();
        entries.try_reserve_exact(old.len().max(index + 1)).map_err(|_| AllocError)?;
        entries.extend_from_slice(old);
        if entries.len() <= index {
            entries.resize(index + 1, Descriptor::NULL);
        }
        entries[index] = desc;
        self.replace(owner, &entries)
    }

    /// Deep-copies `source` into this not-yet-published set.
    pub(crate) fn duplicate_from(&self, owner: ContextId, source: &LdtSlots) -> Result<(), MmCtxError> {
        match source.current() {
            Some(table) => self.replace(owner, table.entries()),
            None => Ok(()),
        }
    }

    /// Releases whichever slot is occupied; no-op on an empty table.
    pub(crate) fn destroy(&self) {
        let Some(old) = self.visible_slot() else {
            return;
        };
        self.visible.store(0, Ordering::SeqCst);
        self.release(old);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self, slot: LdtSlot) {
        self.drain(slot);
        // SAFETY: `slot` is no longer visible and every reader registered before the
        // flip has left.
        let stale = unsafe { (*self.slots[slot.index()].get()).take() };
        drop(stale);
    }
}

impl Default for LdtSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for LdtSlots {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LdtSlots")
            .field("visible", &self.visible_slot())
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(feature = "failpoints")]
static DENY_NEXT_TABLE_ALLOC: AtomicU64 = AtomicU64::new(ContextId::NONE_RAW);

#[cfg(feature = "failpoints")]
pub mod failpoints {
    use super::DENY_NEXT_TABLE_ALLOC;
    use crate::types::ContextId;
    use core::sync::atomic::Ordering;

    /// Forces the next descriptor table built on behalf of `owner` to fail allocation.
    ///
    /// For a fork, `owner` is the parent whose table is being copied.
    pub fn deny_next_table_alloc(owner: ContextId) {
        DENY_NEXT_TABLE_ALLOC.store(owner.as_raw(), Ordering::SeqCst);
    }

    pub(crate) fn take(owner: ContextId) -> bool {
        DENY_NEXT_TABLE_ALLOC
            .compare_exchange(owner.as_raw(), ContextId::NONE_RAW, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
