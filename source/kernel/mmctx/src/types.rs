// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for address-space identity, hardware tags and CPUs
//! OWNERS: @kernel-mm-team
//! PUBLIC API: ContextId, Generation, Asid, CpuId, CpuMask, AtomicCpuMask
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: ContextId 0 is never issued; Asid 0 is reserved for kernel-only mappings;
//!             CPU masks are bounded to 64 processors
//!
//! ## Newtype Rationale
//!
//! Context identities, generations and tags are all plain integers in hardware. Keeping
//! them apart at the type level stops a generation from being compared against an
//! identity, or a tag from being used as a CPU index.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Upper bound on processors tracked by a context's active set.
pub const MAX_CPUS: usize = 64;

/// Globally unique identity of one logical address space.
///
/// **Ownership**: Only `ContextIdAllocator` creates identities.
/// **Invariant**: Never reused; `0` means "no context" and is never issued.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ContextId(u64);

impl ContextId {
    /// Sentinel stored in atomics for "nothing bound / nothing loaded".
    pub const NONE_RAW: u64 = 0;

    #[inline]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Decodes an atomic slot value, mapping the sentinel to `None`.
    #[inline]
    pub const fn decode(raw: u64) -> Option<Self> {
        if raw == Self::NONE_RAW {
            None
        } else {
            Some(Self(raw))
        }
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Value of a context's translation generation counter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Generation(u64);

impl Generation {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hardware translation-cache tag (PCID/ASID).
///
/// **Ownership**: Only `AsidTable` hands out tags.
/// **Invariant**: Tag 0 is reserved for kernel-only mappings and untagged hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Asid(u16);

impl Asid {
    /// Kernel tag; also the only tag used when the hardware has no tagged TLB.
    pub const KERNEL: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical CPU identifier used by per-CPU switch state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    const fn bit(self) -> u64 {
        1u64 << self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a set of processors.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu.as_index() < MAX_CPUS && self.0 & cpu.bit() != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    #[must_use]
    pub const fn without(self, other: CpuMask) -> Self {
        Self(self.0 & !other.0)
    }

    /// Iterates the processors in ascending order.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let idx = bits.trailing_zeros();
            bits &= bits - 1;
            Some(CpuId::from_raw(idx as u16))
        })
    }
}

/// Processor set updated with atomic bit operations.
///
/// Writers are the switching processor (set) and the trim pass (clear); readers
/// are shootdown initiators sizing their broadcast.
#[derive(Debug, Default)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn load(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn contains(&self, cpu: CpuId) -> bool {
        self.load().contains(cpu)
    }

    /// Adds `cpu`; returns whether it was already present.
    ///
    /// Sequentially consistent so the bit is visible before the caller reads the
    /// generation it is about to install.
    #[inline]
    pub fn insert(&self, cpu: CpuId) -> bool {
        if cpu.as_index() >= MAX_CPUS {
            return false;
        }
        self.0.fetch_or(cpu.bit(), Ordering::SeqCst) & cpu.bit() != 0
    }

    /// Removes `cpu`; returns whether it was present.
    #[inline]
    pub fn remove(&self, cpu: CpuId) -> bool {
        if cpu.as_index() >= MAX_CPUS {
            return false;
        }
        self.0.fetch_and(!cpu.bit(), Ordering::AcqRel) & cpu.bit() != 0
    }
}

static_assertions::const_assert!(MAX_CPUS <= u64::BITS as usize);
