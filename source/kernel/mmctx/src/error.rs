// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Recoverable error taxonomy for context lifecycle and auxiliary resources
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MmCtxError, AllocError, DestroyError
//! INVARIANTS: Switch-path consistency violations are never represented here (they are fatal)

use core::fmt;

use crate::context::ContextHandle;

/// Allocation failure while building a table or per-CPU state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocError;

/// Errors reported while managing address-space contexts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmCtxError {
    /// The 64-bit identity counter would wrap.
    IdentityExhausted,
    /// Memory for a descriptor table or per-CPU state could not be allocated.
    Alloc(AllocError),
    /// The context is still referenced by a processor or another holder.
    InUse,
    /// Arguments supplied by the caller were invalid.
    InvalidArgs,
    /// A descriptor table entry would grant more than a user code/data segment.
    InvalidDescriptor,
    /// The hardware does not implement the requested feature.
    Unsupported,
    /// The requested state is already established and cannot change.
    Busy,
    /// Every protection key is already allocated.
    NoFreeKey,
    /// CPU index is outside the configured processor range.
    InvalidCpu,
    /// Another owner already drives this processor's switch state.
    CpuClaimed,
    /// Configuration values are out of range.
    InvalidConfig,
}

impl From<AllocError> for MmCtxError {
    fn from(value: AllocError) -> Self {
        Self::Alloc(value)
    }
}

/// Returned by `destroy_context` when the handle is still shared; gives the handle back.
pub struct DestroyError {
    pub handle: ContextHandle,
    pub reason: MmCtxError,
}

impl fmt::Debug for DestroyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyError")
            .field("context", &self.handle.id())
            .field("reason", &self.reason)
            .finish()
    }
}
