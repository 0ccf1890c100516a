// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space context object and its shared handle
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests + integration (tests/lifecycle.rs)
//! PUBLIC API: MmContext, ContextHandle, ContextFlags
//! DEPENDS_ON: spin::Mutex, resources::{lam, ldt, pkeys}, asid::TagHint
//! INVARIANTS: Identity fixed at creation; the context lock guards descriptor table and
//!             key map mutation and is never taken by the switch path

use alloc::sync::{Arc, Weak};
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use crate::asid::TagHint;
use crate::config::HwFeatures;
use crate::error::MmCtxError;
use crate::generation::GenerationCounter;
use crate::resources::{Descriptor, DescriptorTable, LamState, LdtSlots, Pkey, PkeyState, PointerMask};
use crate::types::{AtomicCpuMask, ContextId, CpuMask, Generation};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Per-context behaviour flags.
    pub struct ContextFlags: u32 {
        /// 32-bit uprobe emulation is in use; the context is not purely 64-bit.
        const UPROBE_IA32 = 1 << 0;
        /// Indirect branch tracking is disabled.
        const NOTRACK = 1 << 1;
        /// Shared virtual addressing is allowed even with pointer tagging enabled.
        const FORCE_TAGGED_SVA = 1 << 2;
    }
}

/// One logical address space.
pub struct MmContext {
    id: ContextId,
    manager: u64,
    features: HwFeatures,
    generation: GenerationCounter,
    active: AtomicCpuMask,
    hint: TagHint,
    flags: AtomicU32,
    lam: LamState,
    ldt: LdtSlots,
    rdpmc_users: AtomicUsize,
    locked: Mutex<PkeyState>,
    live: Arc<AtomicUsize>,
}

impl MmContext {
    pub(crate) fn new(id: ContextId, manager: u64, features: HwFeatures, live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self {
            id,
            manager,
            features,
            generation: GenerationCounter::new(),
            active: AtomicCpuMask::new(),
            hint: TagHint::new(),
            flags: AtomicU32::new(0),
            lam: LamState::new(),
            ldt: LdtSlots::new(),
            rdpmc_users: AtomicUsize::new(0),
            locked: Mutex::new(PkeyState::new(features.contains(HwFeatures::OSPKE))),
            live: Arc::clone(live),
        }
    }

    #[inline]
    pub fn id(&self) -> ContextId {
        self.id
    }

    #[inline]
    pub(crate) fn manager(&self) -> u64 {
        self.manager
    }

    /// Latest published generation.
    #[inline]
    pub fn generation(&self) -> Generation {
        self.generation.current()
    }

    pub(crate) fn generation_counter(&self) -> &GenerationCounter {
        &self.generation
    }

    /// Processors that have (or recently had) this context loaded.
    pub fn active_cpus(&self) -> CpuMask {
        self.active.load()
    }

    pub(crate) fn active(&self) -> &AtomicCpuMask {
        &self.active
    }

    pub(crate) fn hint(&self) -> &TagHint {
        &self.hint
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PkeyState> {
        self.locked.lock()
    }

    pub fn flags(&self) -> ContextFlags {
        ContextFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flag(&self, flag: ContextFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// False once 32-bit uprobe emulation has been set up.
    pub fn is_64bit(&self) -> bool {
        !self.flags().contains(ContextFlags::UPROBE_IA32)
    }

    pub fn set_uprobe_ia32(&self) {
        self.set_flag(ContextFlags::UPROBE_IA32);
    }

    pub fn is_notrack(&self) -> bool {
        self.flags().contains(ContextFlags::NOTRACK)
    }

    pub fn set_notrack(&self) {
        self.set_flag(ContextFlags::NOTRACK);
    }

    pub fn set_force_tagged_sva(&self) {
        self.set_flag(ContextFlags::FORCE_TAGGED_SVA);
    }

    // Pointer masking.

    pub fn pointer_mask(&self) -> PointerMask {
        self.lam.pointer_mask()
    }

    pub fn untag_mask(&self) -> u64 {
        self.lam.untag_mask()
    }

    pub fn untag(&self, addr: u64) -> u64 {
        self.lam.untag(addr)
    }

    /// Whether DMA-capable devices may share this address space.
    pub fn dma_compat(&self) -> bool {
        self.lam.dma_compat(self.flags().contains(ContextFlags::FORCE_TAGGED_SVA))
    }

    /// Enables pointer tagging; processors pick up the new root bits on their next switch.
    pub fn enable_pointer_tagging(&self, nr_bits: u8) -> Result<PointerMask, MmCtxError> {
        let _guard = self.lock();
        let mask = self.lam.enable(nr_bits, self.features)?;
        log_debug!(target: "mmctx", "{}: pointer tagging enabled ({} bits)", self.id, nr_bits);
        Ok(mask)
    }

    // Protection keys.

    pub fn pkey_state(&self) -> PkeyState {
        *self.lock()
    }

    pub fn pkey_alloc(&self) -> Result<Pkey, MmCtxError> {
        self.lock().alloc()
    }

    pub fn pkey_free(&self, key: Pkey) -> Result<(), MmCtxError> {
        self.lock().free(key)
    }

    pub fn pkey_is_allocated(&self, key: Pkey) -> bool {
        self.lock().is_allocated(key)
    }

    pub fn execute_only_pkey(&self) -> Result<Option<Pkey>, MmCtxError> {
        self.lock().execute_only_pkey()
    }

    // User-mode performance counters.

    /// Records a self-monitoring counter mapping; returns the new mapping count.
    ///
    /// Processors running this context pick up the CR4.PCE change on their next switch
    /// or revalidation.
    pub fn map_user_counters(&self) -> usize {
        self.rdpmc_users.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn unmap_user_counters(&self) -> Result<usize, MmCtxError> {
        self.rdpmc_users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |users| users.checked_sub(1))
            .map(|users| users - 1)
            .map_err(|_| MmCtxError::InvalidArgs)
    }

    #[inline]
    pub fn user_counter_mappings(&self) -> usize {
        self.rdpmc_users.load(Ordering::Acquire)
    }

    // Descriptor table.

    /// Currently published descriptor table, if any.
    pub fn descriptor_table(&self) -> Option<Arc<DescriptorTable>> {
        self.ldt.current()
    }

    pub fn has_descriptor_table(&self) -> bool {
        self.ldt.has_table()
    }

    pub fn ldt_version(&self) -> u64 {
        self.ldt.version()
    }

    /// Replaces the whole descriptor table.
    pub fn replace_descriptor_table(&self, entries: &[Descriptor]) -> Result<(), MmCtxError> {
        self.require_ldt()?;
        let _guard = self.lock();
        self.ldt.replace(self.id, entries)
    }

    /// Writes one descriptor, growing the table if needed.
    pub fn write_descriptor(&self, index: usize, desc: Descriptor) -> Result<(), MmCtxError> {
        self.require_ldt()?;
        let _guard = self.lock();
        self.ldt.write_descriptor(self.id, index, desc)
    }

    fn require_ldt(&self) -> Result<(), MmCtxError> {
        if self.features.contains(HwFeatures::LDT) {
            Ok(())
        } else {
            Err(MmCtxError::Unsupported)
        }
    }

    /// Copies the parent's auxiliary resources into this unpublished child.
    pub(crate) fn inherit_from(&self, parent: &MmContext) -> Result<(), MmCtxError> {
        let parent_keys = parent.lock();
        *self.lock() = *parent_keys;
        self.lam.inherit(&parent.lam);
        self.flags.store(parent.flags().bits(), Ordering::Release);
        self.ldt.duplicate_from(parent.id, &parent.ldt)
    }

    pub(crate) fn release_resources(&self) {
        let _guard = self.lock();
        self.ldt.destroy();
    }
}

impl Drop for MmContext {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for MmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmContext")
            .field("id", &self.id)
            .field("generation", &self.generation())
            .field("active", &self.active_cpus())
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

/// Shared reference to a context, held by tasks and by processors that have it loaded.
#[derive(Clone)]
pub struct ContextHandle(Arc<MmContext>);

impl ContextHandle {
    pub(crate) fn new(context: MmContext) -> Self {
        Self(Arc::new(context))
    }

    pub fn id(&self) -> ContextId {
        self.0.id
    }

    pub fn same_context(&self, other: &ContextHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live handles, including this one.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Weak reference that does not keep the context alive.
    pub fn downgrade(&self) -> Weak<MmContext> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn is(&self, weak: &Weak<MmContext>) -> bool {
        core::ptr::eq(Arc::as_ptr(&self.0), weak.as_ptr())
    }

    pub(crate) fn try_into_inner(self) -> Result<MmContext, ContextHandle> {
        Arc::try_unwrap(self.0).map_err(ContextHandle)
    }
}

impl Deref for ContextHandle {
    type Target = MmContext;

    fn deref(&self) -> &MmContext {
        &self.0
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextHandle").field(&self.0.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with_id(raw: u64, features: HwFeatures) -> MmContext {
        MmContext::new(ContextId::from_raw(raw), 0, features, &Arc::new(AtomicUsize::new(0)))
    }

    fn context(features: HwFeatures) -> MmContext {
        context_with_id(1, features)
    }

    #[test]
    fn fresh_context_defaults() {
        let ctx = context(HwFeatures::all());
        assert_eq!(ctx.generation(), Generation::ZERO);
        assert!(ctx.active_cpus().is_empty());
        assert!(ctx.is_64bit());
        assert_eq!(ctx.pkey_state().allocation_map(), 0x1);
        assert_eq!(ctx.untag_mask(), !0);
        assert!(!ctx.has_descriptor_table());
    }

    #[test]
    fn flags_accumulate() {
        let ctx = context(HwFeatures::empty());
        ctx.set_notrack();
        ctx.set_uprobe_ia32();
        assert!(ctx.is_notrack());
        assert!(!ctx.is_64bit());
        assert_eq!(ctx.flags(), ContextFlags::NOTRACK | ContextFlags::UPROBE_IA32);
    }

    #[test]
    fn descriptor_table_requires_feature() {
        let ctx = context(HwFeatures::empty());
        assert_eq!(
            ctx.replace_descriptor_table(&[Descriptor::NULL]),
            Err(MmCtxError::Unsupported)
        );
    }

    #[test]
    fn inherit_copies_resources_by_value() {
        let parent = context(HwFeatures::all());
        parent.set_force_tagged_sva();
        let key = parent.pkey_alloc().unwrap();
        parent.enable_pointer_tagging(6).unwrap();
        parent.write_descriptor(0, Descriptor::flat_user(false, false)).unwrap();

        let child = context_with_id(2, HwFeatures::all());
        child.inherit_from(&parent).unwrap();
        assert!(child.pkey_is_allocated(key));
        assert_eq!(child.pointer_mask(), PointerMask::U57);
        assert!(child.dma_compat());
        assert_eq!(
            child.descriptor_table().unwrap().entries(),
            parent.descriptor_table().unwrap().entries()
        );

        child.pkey_free(key).unwrap();
        assert!(parent.pkey_is_allocated(key));
    }

    #[test]
    fn counter_mappings_are_counted_and_not_inherited() {
        let parent = context(HwFeatures::all());
        assert_eq!(parent.map_user_counters(), 1);
        assert_eq!(parent.map_user_counters(), 2);
        assert_eq!(parent.unmap_user_counters(), Ok(1));

        let child = context_with_id(2, HwFeatures::all());
        child.inherit_from(&parent).unwrap();
        assert_eq!(child.user_counter_mappings(), 0);
        assert_eq!(child.unmap_user_counters(), Err(MmCtxError::InvalidArgs));
    }

    #[test]
    fn live_count_follows_context_lifetime() {
        let live = Arc::new(AtomicUsize::new(0));
        let ctx = MmContext::new(ContextId::from_raw(7), 0, HwFeatures::empty(), &live);
        assert_eq!(live.load(Ordering::Acquire), 1);
        drop(ctx);
        assert_eq!(live.load(Ordering::Acquire), 0);
    }

    #[test]
    fn try_into_inner_fails_while_shared() {
        let handle = ContextHandle::new(context(HwFeatures::empty()));
        let other = handle.clone();
        let handle = handle.try_into_inner().unwrap_err();
        assert_eq!(handle.holders(), 2);
        drop(other);
        assert!(handle.try_into_inner().is_ok());
    }
}
