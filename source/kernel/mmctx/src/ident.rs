// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Context identity allocator
//! OWNERS: @kernel-mm-team
//! PUBLIC API: ContextIdAllocator::{new, allocate, last_issued}
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: Strictly increasing; never wraps; identities are never reclaimed

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::MmCtxError;
use crate::types::ContextId;

/// Issues context identities from a 64-bit counter.
///
/// Identities stay unique for the lifetime of the system so that a stale
/// `(identity, generation)` pair can never be mistaken for a live one.
#[derive(Debug)]
pub struct ContextIdAllocator {
    last: AtomicU64,
}

impl ContextIdAllocator {
    /// Creates an allocator whose first identity is `1`.
    pub const fn new() -> Self {
        Self { last: AtomicU64::new(ContextId::NONE_RAW) }
    }

    #[cfg(test)]
    pub(crate) const fn starting_after(last: u64) -> Self {
        Self { last: AtomicU64::new(last) }
    }

    /// Returns the next identity, or `IdentityExhausted` if the counter would wrap.
    pub fn allocate(&self) -> Result<ContextId, MmCtxError> {
        self.last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| last.checked_add(1))
            .map(|previous| ContextId::from_raw(previous + 1))
            .map_err(|_| MmCtxError::IdentityExhausted)
    }

    /// Most recently issued identity, if any.
    pub fn last_issued(&self) -> Option<ContextId> {
        ContextId::decode(self.last.load(Ordering::Acquire))
    }
}

impl Default for ContextIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
