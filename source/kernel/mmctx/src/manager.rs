// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Owner of identity, tag and per-CPU state for all address-space contexts
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests + integration (tests/lifecycle.rs, tests/switch_protocol.rs)
//! PUBLIC API: ContextManager::{new, create_context, fork_context, destroy_context,
//!             bump_generation, flush_targets, claim_processor}
//! DEPENDS_ON: ident, asid, context, switch, hal::MmuHal
//! INVARIANTS: Explicitly constructed (no implicit globals); contexts are only accepted
//!             by the manager that created them; a processor is driven by one owner

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::asid::AsidTable;
use crate::config::{HwFeatures, MmCtxConfig};
use crate::context::{ContextHandle, MmContext};
use crate::error::{AllocError, DestroyError, MmCtxError};
use crate::hal::MmuHal;
use crate::ident::ContextIdAllocator;
use crate::switch::Processor;
use crate::types::{ContextId, CpuId, CpuMask, Generation};

static NEXT_MANAGER_TAG: AtomicU64 = AtomicU64::new(1);

/// Cross-CPU visible part of a processor's switch state.
#[derive(Debug)]
pub(crate) struct CpuShared {
    /// Identity of the context loaded on the processor; 0 when idle.
    pub(crate) loaded: AtomicU64,
    /// Set while a kernel thread borrows the loaded context.
    pub(crate) lazy: AtomicBool,
    claimed: AtomicBool,
}

impl CpuShared {
    const fn new() -> Self {
        Self {
            loaded: AtomicU64::new(ContextId::NONE_RAW),
            lazy: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
        }
    }

    pub(crate) fn release_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }
}

/// Entry point of the subsystem: creates contexts and hands out per-CPU switch state.
pub struct ContextManager<H: MmuHal> {
    hal: H,
    config: MmCtxConfig,
    features: HwFeatures,
    tag: u64,
    ids: ContextIdAllocator,
    asids: AsidTable,
    cpus: Box<[CpuShared]>,
    live: Arc<AtomicUsize>,
}

impl<H: MmuHal> ContextManager<H> {
    pub fn new(hal: H, config: MmCtxConfig) -> Result<Self, MmCtxError> {
        config.validate()?;
        let features = hal.features();
        let asids = AsidTable::new(config.asid_count)?;
        let mut cpus = Vec::new();
        cpus.try_reserve_exact(config.max_cpus).map_err(|_| AllocError)?;
        cpus.extend((0..config.max_cpus).map(|_| CpuShared::new()));
        log_info!(
            target: "mmctx",
            "context manager up: {} cpus, {} tags, features {:?}",
            config.max_cpus,
            asids.usable_tags(),
            features
        );
        Ok(Self {
            hal,
            config,
            features,
            tag: NEXT_MANAGER_TAG.fetch_add(1, Ordering::Relaxed),
            ids: ContextIdAllocator::new(),
            asids,
            cpus: cpus.into_boxed_slice(),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    #[inline]
    pub fn hal(&self) -> &H {
        &self.hal
    }

    #[inline]
    pub fn config(&self) -> &MmCtxConfig {
        &self.config
    }

    #[inline]
    pub fn features(&self) -> HwFeatures {
        self.features
    }

    #[inline]
    pub fn asid_table(&self) -> &AsidTable {
        &self.asids
    }

    /// Contexts created and not yet dropped, whether through `destroy_context` or by
    /// releasing the last handle.
    pub fn live_contexts(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Creates an empty context with a fresh identity and generation 0.
    pub fn create_context(&self) -> Result<ContextHandle, MmCtxError> {
        let id = self.ids.allocate()?;
        let context = MmContext::new(id, self.tag, self.features, &self.live);
        log_debug!(target: "mmctx", "created {}", id);
        Ok(ContextHandle::new(context))
    }

    /// Creates a child carrying copies of the parent's auxiliary resources.
    ///
    /// Nothing is published on failure; the partially built child is dropped.
    pub fn fork_context(&self, parent: &ContextHandle) -> Result<ContextHandle, MmCtxError> {
        self.check_owner(parent);
        let id = self.ids.allocate()?;
        let child = MmContext::new(id, self.tag, self.features, &self.live);
        if let Err(err) = child.inherit_from(parent) {
            log_warn!(target: "mmctx", "fork of {} failed: {:?}", parent.id(), err);
            return Err(err);
        }
        log_debug!(target: "mmctx", "forked {} from {}", id, parent.id());
        Ok(ContextHandle::new(child))
    }

    /// Destroys a context once no processor or task holds it any more.
    pub fn destroy_context(&self, handle: ContextHandle) -> Result<(), DestroyError> {
        self.check_owner(&handle);
        let context = handle
            .try_into_inner()
            .map_err(|handle| DestroyError { handle, reason: MmCtxError::InUse })?;
        context.release_resources();
        self.asids.release_hint(context.id(), context.hint());
        log_debug!(target: "mmctx", "destroyed {}", context.id());
        Ok(())
    }

    /// Publishes a translation-invalidating change; returns the new generation.
    ///
    /// The caller's page-table update must complete before this call.
    pub fn bump_generation(&self, handle: &ContextHandle) -> Generation {
        self.check_owner(handle);
        let generation = handle.generation_counter().bump();
        if self.asids.holds(handle.id(), handle.hint()) {
            self.asids.advance_epoch();
        }
        log_trace!(target: "mmctx", "{} generation -> {}", handle.id(), generation);
        generation
    }

    /// Processors that must be signalled after a bump to `handle`.
    ///
    /// Lazy processors are left out; they revalidate before returning to user mode.
    pub fn flush_targets(&self, handle: &ContextHandle) -> CpuMask {
        self.check_owner(handle);
        // Pairs with the fence a processor issues after leaving lazy mode.
        fence(Ordering::SeqCst);
        let lazy = self
            .cpus
            .iter()
            .enumerate()
            .filter(|(_, cpu)| cpu.lazy.load(Ordering::SeqCst))
            .fold(0u64, |mask, (index, _)| mask | (1u64 << index));
        handle.active_cpus().without(CpuMask::from_bits(lazy))
    }

    /// Identity loaded on `cpu`, as last published by that processor.
    pub fn loaded_on(&self, cpu: CpuId) -> Option<ContextId> {
        self.cpus
            .get(cpu.as_index())
            .and_then(|shared| ContextId::decode(shared.loaded.load(Ordering::Acquire)))
    }

    /// Takes exclusive ownership of `cpu`'s switch state.
    pub fn claim_processor(&self, cpu: CpuId) -> Result<Processor<'_, H>, MmCtxError> {
        let shared = self.cpus.get(cpu.as_index()).ok_or(MmCtxError::InvalidCpu)?;
        if shared
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MmCtxError::CpuClaimed);
        }
        Processor::new(self, cpu).map_err(|err| {
            shared.release_claim();
            err
        })
    }

    pub(crate) fn cpu(&self, cpu: CpuId) -> &CpuShared {
        match self.cpus.get(cpu.as_index()) {
            Some(shared) => shared,
            None => crate::diag::fatal("mmctx", format_args!("cpu {} was never configured", cpu)),
        }
    }

    /// Rejects handles created by a different manager.
    pub(crate) fn check_owner(&self, handle: &ContextHandle) {
        if handle.manager() != self.tag {
            crate::diag::fatal(
                "mmctx",
                format_args!("{} does not belong to this context manager", handle.id()),
            );
        }
    }
}
