// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-processor address-space switch protocol
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests + integration (tests/switch_protocol.rs, tests/smp_switch.rs)
//! PUBLIC API: Processor::{switch_to, switch_to_kernel, revalidate, enter_lazy,
//!             use_temporary, unuse_temporary, periodic_trim, state}
//! DEPENDS_ON: manager::ContextManager, asid::AsidTable, hal::MmuHal
//! INVARIANTS: No lock on any path; observed generation never exceeds the true one;
//!             a tag is used only after this processor's view of it matches the grant;
//!             a processor only ever removes itself from an active set
//!
//! ## Protocol
//!
//! ```text
//! switch_to(next)
//!   ├─ same context, generation unchanged, tag still bound ──▶ fast path
//!   └─ otherwise
//!        join next.active  ─▶ read generation ─▶ acquire tag
//!        view[tag] != (next, generation) ─▶ invalidate on load
//!        install root + pointer mask ─▶ reload LDT if either side has one
//!        ─▶ update CR4.PCE if the counter policy for next differs
//! ```
//!
//! Each processor keeps its own view of which `(context, generation)` its cached
//! translations under every tag belong to. The shared table decides who owns a tag;
//! the private view decides whether this processor must flush before using it.

use alloc::sync::Weak;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use crate::context::{ContextHandle, MmContext};
use crate::config::HwFeatures;
use crate::error::{AllocError, MmCtxError};
use crate::hal::{MmuHal, RootLoad};
use crate::manager::{ContextManager, CpuShared};
use crate::resources::PointerMask;
use crate::types::{Asid, ContextId, CpuId, Generation};

/// Contexts remembered for self-trim before the oldest is dropped eagerly.
const RECENT_CONTEXTS: usize = 8;

/// Which branch of the protocol a switch took.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchPath {
    Fast,
    Slow,
}

/// What a switch did to the hardware.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub path: SwitchPath,
    pub tag: Asid,
    pub generation: Generation,
    /// Translations under `tag` were dropped as part of the root load.
    pub invalidated: bool,
    pub root_reloaded: bool,
    pub ldt_reloaded: bool,
    /// CR4.PCE was flipped for the new context.
    pub pce_updated: bool,
}

/// Externally visible switch state of one processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchState {
    Idle,
    Active { context: ContextId, tag: Asid, observed: Generation },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct TagView {
    context: u64,
    generation: u64,
}

/// Exclusive handle on one processor's switch state.
///
/// Obtained from [`ContextManager::claim_processor`]; dropping it releases the claim.
pub struct Processor<'m, H: MmuHal> {
    manager: &'m ContextManager<H>,
    cpu: CpuId,
    pcid: bool,
    views: Vec<TagView>,
    loaded: Option<ContextHandle>,
    tag: Asid,
    observed: Generation,
    seen_epoch: u64,
    pointer_mask: PointerMask,
    ldt_version: u64,
    ldt_loaded: bool,
    pce: bool,
    recent: Vec<Weak<MmContext>>,
    next_trim: u64,
}

impl<'m, H: MmuHal> Processor<'m, H> {
    pub(crate) fn new(manager: &'m ContextManager<H>, cpu: CpuId) -> Result<Self, MmCtxError> {
        let tags = usize::from(manager.config().asid_count);
        let mut views = Vec::new();
        views.try_reserve_exact(tags).map_err(|_| AllocError)?;
        views.resize(tags, TagView::default());
        let mut recent = Vec::new();
        recent.try_reserve_exact(RECENT_CONTEXTS).map_err(|_| AllocError)?;
        let next_trim = manager.hal().now_ticks().saturating_add(manager.config().trim_interval_ticks);
        log_debug!(target: "mmctx", "cpu {} switch state claimed", cpu);
        Ok(Self {
            manager,
            cpu,
            pcid: manager.features().contains(HwFeatures::PCID),
            views,
            loaded: None,
            tag: Asid::KERNEL,
            observed: Generation::ZERO,
            seen_epoch: 0,
            pointer_mask: PointerMask::NONE,
            ldt_version: 0,
            ldt_loaded: false,
            pce: false,
            recent,
            next_trim,
        })
    }

    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn state(&self) -> SwitchState {
        match &self.loaded {
            None => SwitchState::Idle,
            Some(ctx) => SwitchState::Active { context: ctx.id(), tag: self.tag, observed: self.observed },
        }
    }

    pub fn loaded(&self) -> Option<&ContextHandle> {
        self.loaded.as_ref()
    }

    #[inline]
    pub fn observed_generation(&self) -> Generation {
        self.observed
    }

    fn shared(&self) -> &'m CpuShared {
        self.manager.cpu(self.cpu)
    }

    /// Makes `next` the address space of this processor. Safe to call redundantly.
    pub fn switch_to(&mut self, next: &ContextHandle) -> SwitchOutcome {
        self.manager.check_owner(next);
        let shared = self.shared();
        if shared.lazy.load(Ordering::Relaxed) {
            shared.lazy.store(false, Ordering::SeqCst);
            // Pairs with the fence in flush_targets: either the initiator sees us
            // leave lazy mode or we see its generation bump below.
            fence(Ordering::SeqCst);
        }

        let same = self.loaded.as_ref().map_or(false, |loaded| loaded.same_context(next));
        if same {
            if let Some(outcome) = self.try_fast(next) {
                return outcome;
            }
        }
        self.switch_slow(next, same)
    }

    fn try_fast(&mut self, next: &ContextHandle) -> Option<SwitchOutcome> {
        let generation = next.generation();
        if generation != self.observed {
            return None;
        }
        if self.pcid {
            let table = self.manager.asid_table();
            let epoch = table.epoch();
            if epoch != self.seen_epoch {
                if !table.is_bound(self.tag, next.id(), generation) {
                    return None;
                }
                self.seen_epoch = epoch;
            }
        }
        if !next.active().contains(self.cpu) {
            next.active().insert(self.cpu);
        }

        let mut outcome = SwitchOutcome {
            path: SwitchPath::Fast,
            tag: self.tag,
            generation,
            invalidated: false,
            root_reloaded: false,
            ldt_reloaded: false,
            pce_updated: false,
        };
        let mask = next.pointer_mask();
        if mask != self.pointer_mask {
            self.load_root(next.id(), generation, mask, false);
            outcome.root_reloaded = true;
        }
        let version = next.ldt_version();
        if version != self.ldt_version {
            outcome.ldt_reloaded = self.load_ldt(next, version);
        }
        outcome.pce_updated = self.sync_pce(next.user_counter_mappings());
        Some(outcome)
    }

    fn switch_slow(&mut self, next: &ContextHandle, same: bool) -> SwitchOutcome {
        let id = next.id();
        let table = self.manager.asid_table();
        let epoch = table.epoch();

        next.active().insert(self.cpu);
        // The active bit must be visible before the generation is sampled.
        fence(Ordering::SeqCst);
        let generation = next.generation();

        let (tag, generation, invalidate) = if self.pcid {
            let grant = table.acquire(id, generation, next.hint());
            let view = match self.views.get_mut(grant.tag.as_index()) {
                Some(view) => view,
                None => crate::diag::fatal(
                    "mmctx",
                    format_args!("cpu {} has no view of tag {}", self.cpu, grant.tag),
                ),
            };
            let current = TagView { context: id.as_raw(), generation: grant.generation.as_raw() };
            let invalidate = *view != current;
            *view = current;
            (grant.tag, grant.generation, invalidate)
        } else {
            (Asid::KERNEL, generation, true)
        };

        self.tag = tag;
        let mask = next.pointer_mask();
        self.load_root(id, generation, mask, invalidate);
        let version = next.ldt_version();
        let ldt_reloaded = self.load_ldt(next, version);
        let pce_updated = self.sync_pce(next.user_counter_mappings());

        self.shared().loaded.store(id.as_raw(), Ordering::SeqCst);
        if !same {
            let previous = self.loaded.replace(next.clone());
            self.forget_recent(next);
            if let Some(previous) = previous {
                self.remember(&previous);
            }
        }
        self.observed = generation;
        self.seen_epoch = epoch;
        log_trace!(
            target: "mmctx",
            "cpu {} -> {} tag {} gen {} flush {}",
            self.cpu,
            id,
            tag,
            generation,
            invalidate
        );
        SwitchOutcome {
            path: SwitchPath::Slow,
            tag,
            generation,
            invalidated: invalidate,
            root_reloaded: true,
            ldt_reloaded,
            pce_updated,
        }
    }

    fn load_root(
        &mut self,
        context: ContextId,
        generation: Generation,
        pointer_mask: PointerMask,
        invalidate: bool,
    ) {
        self.manager.hal().install_root(
            self.cpu,
            RootLoad { context, tag: self.tag, generation, pointer_mask, invalidate },
        );
        self.pointer_mask = pointer_mask;
    }

    /// Applies the counter policy for a context with `users` mappings.
    fn sync_pce(&mut self, users: usize) -> bool {
        let allowed = self.manager.config().rdpmc.allows(users);
        if allowed == self.pce {
            return false;
        }
        self.manager.hal().set_user_pmc_access(self.cpu, allowed);
        self.pce = allowed;
        true
    }

    /// Loads `next`'s descriptor table if either side of the switch has one.
    fn load_ldt(&mut self, next: &ContextHandle, version: u64) -> bool {
        self.ldt_version = version;
        let table = next.descriptor_table();
        let reload = self.ldt_loaded || table.is_some();
        if reload {
            self.manager.hal().load_descriptor_table(self.cpu, table.as_deref());
        }
        self.ldt_loaded = table.is_some();
        reload
    }

    /// Re-runs the protocol for the loaded context, e.g. from a shootdown handler.
    pub fn revalidate(&mut self) -> Option<SwitchOutcome> {
        let loaded = self.loaded.clone()?;
        Some(self.switch_to(&loaded))
    }

    /// Installs the kernel-only root and forgets the user context.
    pub fn switch_to_kernel(&mut self) {
        self.manager.hal().install_kernel_root(self.cpu);
        if self.ldt_loaded {
            self.manager.hal().load_descriptor_table(self.cpu, None);
            self.ldt_loaded = false;
        }
        self.sync_pce(0);
        let shared = self.shared();
        shared.loaded.store(ContextId::NONE_RAW, Ordering::SeqCst);
        shared.lazy.store(false, Ordering::SeqCst);
        if let Some(previous) = self.loaded.take() {
            self.remember(&previous);
        }
        self.tag = Asid::KERNEL;
        self.observed = Generation::ZERO;
        self.pointer_mask = PointerMask::NONE;
        self.ldt_version = 0;
    }

    /// Marks the processor as running a kernel thread on borrowed user translations.
    pub fn enter_lazy(&mut self) {
        if self.loaded.is_some() {
            self.shared().lazy.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_lazy(&self) -> bool {
        self.shared().lazy.load(Ordering::Acquire)
    }

    /// Temporarily switches to `temp`; returns what must be passed to [`Self::unuse_temporary`].
    #[must_use = "the previous context must be restored with unuse_temporary"]
    pub fn use_temporary(&mut self, temp: &ContextHandle) -> Option<ContextHandle> {
        let previous = self.loaded.clone();
        let _ = self.switch_to(temp);
        previous
    }

    pub fn unuse_temporary(&mut self, previous: Option<ContextHandle>) {
        match previous {
            Some(previous) => {
                let _ = self.switch_to(&previous);
            }
            None => self.switch_to_kernel(),
        }
    }

    /// Leaves the active sets of contexts this processor no longer runs.
    ///
    /// Driven by the tick; does nothing until the trim interval has elapsed. Returns the
    /// number of active sets left.
    pub fn periodic_trim(&mut self) -> usize {
        let config = self.manager.config();
        if !config.trim_enabled {
            return 0;
        }
        let now = self.manager.hal().now_ticks();
        if now < self.next_trim {
            return 0;
        }
        self.next_trim = now.saturating_add(config.trim_interval_ticks);
        let mut left = 0;
        // Detach the list so `leave` can borrow self; the buffer goes back afterwards.
        let mut recent = core::mem::take(&mut self.recent);
        for weak in recent.drain(..) {
            if self.leave(&weak) {
                left += 1;
            }
        }
        self.recent = recent;
        if left > 0 {
            log_debug!(target: "mmctx", "cpu {} trimmed from {} active sets", self.cpu, left);
        }
        left
    }

    fn leave(&self, weak: &Weak<MmContext>) -> bool {
        let Some(context) = weak.upgrade() else {
            return false;
        };
        if self.loaded.as_ref().map_or(false, |loaded| loaded.is(weak)) {
            return false;
        }
        context.active().remove(self.cpu)
    }

    fn forget_recent(&mut self, next: &ContextHandle) {
        self.recent.retain(|weak| !next.is(weak));
    }

    fn remember(&mut self, previous: &ContextHandle) {
        if self.recent.iter().any(|weak| previous.is(weak)) {
            return;
        }
        if self.recent.len() == RECENT_CONTEXTS {
            let oldest = self.recent.remove(0);
            self.leave(&oldest);
        }
        if self.recent.len() < self.recent.capacity() {
            self.recent.push(previous.downgrade());
        } else {
            // No room without allocating: leave right away instead of tracking it.
            self.leave(&previous.downgrade());
        }
    }
}

impl<H: MmuHal> Drop for Processor<'_, H> {
    fn drop(&mut self) {
        let shared = self.shared();
        shared.loaded.store(ContextId::NONE_RAW, Ordering::SeqCst);
        shared.lazy.store(false, Ordering::SeqCst);
        if let Some(loaded) = self.loaded.take() {
            loaded.active().remove(self.cpu);
        }
        let recent = core::mem::take(&mut self.recent);
        for weak in &recent {
            self.leave(weak);
        }
        shared.release_claim();
    }
}
