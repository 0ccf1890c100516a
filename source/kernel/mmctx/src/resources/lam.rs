// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Linear-address masking (pointer tagging) configuration of one context
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PointerMask, LamState::{pointer_mask, untag_mask, untag, dma_compat}
//! INVARIANTS: Once enabled the mask never changes for the lifetime of the context;
//!             the untag mask is published before the CR3 bits that make it reachable

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::HwFeatures;
use crate::error::MmCtxError;

/// Widest tag supported by the U57 layout.
pub const LAM_U57_BITS: u8 = 6;

const CR3_LAM_U57: u64 = 1 << 61;
const CR3_LAM_U48: u64 = 1 << 62;
const U57_TAG_BITS: u64 = 0x7E00_0000_0000_0000; // bits 57..=62

/// CR3 bits selecting the pointer-masking layout of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PointerMask(u64);

impl PointerMask {
    pub const NONE: Self = Self(0);
    pub const U57: Self = Self(CR3_LAM_U57);

    pub const fn cr3_bits(self) -> u64 {
        self.0
    }

    pub const fn is_enabled(self) -> bool {
        self.0 & (CR3_LAM_U57 | CR3_LAM_U48) != 0
    }
}

/// Pointer-masking state; written under the context lock, read lock-free by switches.
#[derive(Debug)]
pub struct LamState {
    cr3_mask: AtomicU64,
    untag_mask: AtomicU64,
}

impl LamState {
    /// Fresh state: no CR3 bits, every address bit significant.
    pub const fn new() -> Self {
        Self { cr3_mask: AtomicU64::new(0), untag_mask: AtomicU64::new(!0) }
    }

    #[inline]
    pub fn pointer_mask(&self) -> PointerMask {
        PointerMask(self.cr3_mask.load(Ordering::Acquire))
    }

    #[inline]
    pub fn untag_mask(&self) -> u64 {
        self.untag_mask.load(Ordering::Acquire)
    }

    /// Strips tag bits from a user pointer; kernel-half addresses pass through unchanged.
    pub fn untag(&self, addr: u64) -> u64 {
        let sign = ((addr as i64) >> 63) as u64;
        addr & (self.untag_mask() | sign)
    }

    /// True when devices sharing this address space can consume raw pointers.
    pub fn dma_compat(&self, force_tagged_sva: bool) -> bool {
        !self.pointer_mask().is_enabled() || force_tagged_sva
    }

    /// Copies the parent's configuration into a not-yet-published child.
    pub(crate) fn inherit(&self, parent: &LamState) {
        self.untag_mask.store(parent.untag_mask(), Ordering::Relaxed);
        self.cr3_mask.store(parent.pointer_mask().cr3_bits(), Ordering::Release);
    }

    /// Enables tagging with `nr_bits` tag bits. Caller holds the context lock.
    pub(crate) fn enable(&self, nr_bits: u8, features: HwFeatures) -> Result<PointerMask, MmCtxError> {
        if !features.contains(HwFeatures::LAM) {
            return Err(MmCtxError::Unsupported);
        }
        if self.pointer_mask().is_enabled() {
            return Err(MmCtxError::Busy);
        }
        if nr_bits == 0 || nr_bits > LAM_U57_BITS {
            return Err(MmCtxError::InvalidArgs);
        }
        self.untag_mask.store(!U57_TAG_BITS, Ordering::Release);
        self.cr3_mask.store(CR3_LAM_U57, Ordering::Release);
        Ok(PointerMask::U57)
    }
}

impl Default for LamState {
    fn default() -> Self {
        Self::new()
    }
}
