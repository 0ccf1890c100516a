// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory protection key allocation and PKRU permission checks
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Pkey, PkeyState, Pkru, access_permitted()
//! INVARIANTS: Key 0 is allocated for the whole lifetime of a context with OSPKE;
//!             the execute-only key, once chosen, stays allocated

use crate::error::MmCtxError;

/// Number of protection keys provided by the architecture.
pub const NR_PKEYS: u8 = 16;

/// A protection key index in `0..16`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pkey(u8);

impl Pkey {
    pub const DEFAULT: Self = Self(0);

    /// Validates a raw key index.
    pub const fn new(raw: u8) -> Option<Self> {
        if raw < NR_PKEYS {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub const fn as_raw(self) -> u8 {
        self.0
    }

    const fn bit(self) -> u16 {
        1 << self.0
    }
}

/// Per-context key allocation map, guarded by the context lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PkeyState {
    allocation_map: u16,
    execute_only: Option<Pkey>,
    supported: bool,
}

impl PkeyState {
    /// Initial state: key 0 allocated when the OS enabled protection keys.
    pub const fn new(supported: bool) -> Self {
        Self { allocation_map: if supported { 0x1 } else { 0 }, execute_only: None, supported }
    }

    pub const fn allocation_map(&self) -> u16 {
        self.allocation_map
    }

    pub const fn execute_only(&self) -> Option<Pkey> {
        self.execute_only
    }

    pub const fn is_allocated(&self, key: Pkey) -> bool {
        self.allocation_map & key.bit() != 0
    }

    /// Allocates the lowest free key.
    pub fn alloc(&mut self) -> Result<Pkey, MmCtxError> {
        if !self.supported {
            return Err(MmCtxError::Unsupported);
        }
        let free = !self.allocation_map;
        if free == 0 {
            return Err(MmCtxError::NoFreeKey);
        }
        let key = Pkey(free.trailing_zeros() as u8);
        self.allocation_map |= key.bit();
        Ok(key)
    }

    pub fn free(&mut self, key: Pkey) -> Result<(), MmCtxError> {
        if !self.supported {
            return Err(MmCtxError::Unsupported);
        }
        if key == Pkey::DEFAULT || !self.is_allocated(key) {
            return Err(MmCtxError::InvalidArgs);
        }
        self.allocation_map &= !key.bit();
        if self.execute_only == Some(key) {
            self.execute_only = None;
        }
        Ok(())
    }

    /// Returns the key backing execute-only mappings, allocating it on first use.
    ///
    /// `Ok(None)` means protection keys are unavailable and execute-only mappings
    /// fall back to plain read-exec.
    pub fn execute_only_pkey(&mut self) -> Result<Option<Pkey>, MmCtxError> {
        if !self.supported {
            return Ok(None);
        }
        if let Some(key) = self.execute_only {
            return Ok(Some(key));
        }
        let key = self.alloc()?;
        self.execute_only = Some(key);
        Ok(Some(key))
    }
}

/// Image of the PKRU register: two bits per key (access-disable, write-disable).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Pkru(pub u32);

impl Pkru {
    const AD: u32 = 0b01;
    const WD: u32 = 0b10;

    /// Whether a data access through `key` is allowed.
    pub const fn allows(self, key: Pkey, write: bool) -> bool {
        let bits = (self.0 >> (2 * key.0 as u32)) & 0b11;
        if bits & Self::AD != 0 {
            return false;
        }
        !(write && bits & Self::WD != 0)
    }

    /// Returns a copy denying all access through `key` except instruction fetch.
    pub const fn deny_access(self, key: Pkey) -> Self {
        Self(self.0 | (Self::AD << (2 * key.0 as u32)))
    }

    /// Returns a copy denying writes through `key`.
    pub const fn deny_write(self, key: Pkey) -> Self {
        Self(self.0 | (Self::WD << (2 * key.0 as u32)))
    }
}

/// Permission check for an access to a mapping tagged with `vma_pkey`.
///
/// Keys only guard data accesses made by the current address space: instruction
/// fetches and accesses on behalf of another address space are never blocked.
pub fn access_permitted(vma_pkey: Pkey, pkru: Pkru, write: bool, execute: bool, foreign: bool) -> bool {
    if execute || foreign {
        return true;
    }
    pkru.allows(vma_pkey, write)
}
