// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Tunables and hardware feature bits for the context subsystem
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MmCtxConfig, HwFeatures, RdpmcPolicy, DEFAULT_TICK_NS
//! DEPENDS_ON: bitflags
//! INVARIANTS: Validated once at manager construction; immutable afterwards
//!
//! Defaults mirror x86-64: a 12-bit PCID space (4096 tags, tag 0 reserved) and a
//! one second active-set trim period at the fixed 1 ms kernel tick.

use bitflags::bitflags;

use crate::error::MmCtxError;
use crate::types::MAX_CPUS;

/// Nominal tick length assumed by the trim interval default.
pub const DEFAULT_TICK_NS: u64 = 1_000_000;

/// Architectural tag space size (12-bit PCID).
pub const MAX_ASIDS: u16 = 4096;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Hardware capabilities reported by the platform layer.
    pub struct HwFeatures: u32 {
        /// Tagged TLB entries (PCID/ASID).
        const PCID = 1 << 0;
        /// User-mode protection keys enabled by the OS.
        const OSPKE = 1 << 1;
        /// Linear address masking (pointer tagging).
        const LAM = 1 << 2;
        /// Per-address-space local descriptor tables.
        const LDT = 1 << 3;
    }
}

/// Who may execute RDPMC in user mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RdpmcPolicy {
    /// User-mode counter reads always fault.
    Never,
    /// Allowed while the loaded context has at least one self-monitoring user.
    PerContext,
    /// Allowed for every context.
    Always,
}

impl RdpmcPolicy {
    /// Whether CR4.PCE must be set for a context with `users` counter mappings.
    pub const fn allows(self, users: usize) -> bool {
        match self {
            RdpmcPolicy::Never => false,
            RdpmcPolicy::PerContext => users > 0,
            RdpmcPolicy::Always => true,
        }
    }
}

/// Construction-time configuration of a `ContextManager`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmCtxConfig {
    /// Number of processors that may claim switch state.
    pub max_cpus: usize,
    /// Size of the shared tag pool including the reserved kernel tag.
    pub asid_count: u16,
    /// Minimum ticks between two trims of the same context's active set.
    pub trim_interval_ticks: u64,
    /// Disabling trim leaves active sets growing; correctness is unaffected.
    pub trim_enabled: bool,
    /// User-mode performance counter access.
    pub rdpmc: RdpmcPolicy,
}

impl MmCtxConfig {
    pub const DEFAULT: Self = Self {
        max_cpus: 8,
        asid_count: MAX_ASIDS,
        trim_interval_ticks: 1_000_000_000 / DEFAULT_TICK_NS,
        trim_enabled: true,
        rdpmc: RdpmcPolicy::PerContext,
    };

    /// Returns a copy with a different tag pool size.
    pub const fn with_asid_count(mut self, asid_count: u16) -> Self {
        self.asid_count = asid_count;
        self
    }

    /// Returns a copy with a different processor count.
    pub const fn with_max_cpus(mut self, max_cpus: usize) -> Self {
        self.max_cpus = max_cpus;
        self
    }

    pub fn validate(&self) -> Result<(), MmCtxError> {
        if self.max_cpus == 0 || self.max_cpus > MAX_CPUS {
            return Err(MmCtxError::InvalidConfig);
        }
        // One usable tag besides the kernel tag is the smallest workable pool.
        if self.asid_count < 2 || self.asid_count > MAX_ASIDS {
            return Err(MmCtxError::InvalidConfig);
        }
        if self.trim_enabled && self.trim_interval_ticks == 0 {
            return Err(MmCtxError::InvalidConfig);
        }
        Ok(())
    }
}

impl Default for MmCtxConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
