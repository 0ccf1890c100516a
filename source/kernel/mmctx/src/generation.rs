// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-context translation generation counter
//! OWNERS: @kernel-mm-team
//! PUBLIC API: GenerationCounter::{new, current, bump}
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: Non-decreasing; the bump is a release of all prior page-table mutations

use core::sync::atomic::{AtomicU64, Ordering};

use crate::types::Generation;

/// Monotonic counter of translation-invalidating events for one context.
///
/// Callers mutate the page tables first and bump afterwards; any processor that
/// acquires the new value therefore also observes the mutation.
#[derive(Debug)]
pub struct GenerationCounter(AtomicU64);

impl GenerationCounter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn current(&self) -> Generation {
        Generation::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Advances the counter and returns the value it now holds.
    pub fn bump(&self) -> Generation {
        let previous = self.0.fetch_add(1, Ordering::AcqRel);
        if previous == u64::MAX {
            crate::diag::fatal("mmctx", format_args!("generation counter wrapped"));
        }
        Generation::from_raw(previous + 1)
    }
}

impl Default for GenerationCounter {
    fn default() -> Self {
        Self::new()
    }
}
