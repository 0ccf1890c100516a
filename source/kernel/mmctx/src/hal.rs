// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction consumed by the switch protocol.
//!
//! The page-table layer owns root translation structures; it is asked to install the
//! root of a context by identity. Tag invalidation rides on the root load, as a CR3
//! write without the no-flush bit does on x86. Descriptor table load, user counter
//! access and feature discovery are thin per-CPU register hooks.

use crate::config::HwFeatures;
use crate::resources::ldt::DescriptorTable;
use crate::resources::lam::PointerMask;
use crate::types::{Asid, ContextId, CpuId, Generation};

/// CR3 bit requesting that the tagged translations survive the load.
pub const CR3_NOFLUSH: u64 = 1 << 63;
const CR3_PCID_MASK: u64 = 0xFFF;
const CR3_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Everything the hardware layer needs to load a user root on one processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootLoad {
    pub context: ContextId,
    pub tag: Asid,
    /// Generation whose translations the tag holds once the load completes.
    pub generation: Generation,
    pub pointer_mask: PointerMask,
    /// When set, translations cached under `tag` on this processor must be dropped
    /// before the root is used.
    pub invalidate: bool,
}

impl RootLoad {
    /// Composes the CR3 image for a root table at `root_phys`.
    pub fn cr3(&self, root_phys: u64, pcid: bool) -> u64 {
        let mut value = (root_phys & CR3_ADDR_MASK) | self.pointer_mask.cr3_bits();
        if pcid {
            value |= u64::from(self.tag.as_raw()) & CR3_PCID_MASK;
            if !self.invalidate {
                value |= CR3_NOFLUSH;
            }
        }
        value
    }
}

/// Per-processor MMU operations provided by the hosting kernel.
///
/// Every method is invoked on the processor named by `cpu`, with preemption disabled.
pub trait MmuHal: Sync {
    /// Features discovered at boot; read once by the manager.
    fn features(&self) -> HwFeatures;

    /// Monotonic tick counter driving the trim interval.
    fn now_ticks(&self) -> u64;

    /// Loads the root of `load.context` with the given tag and pointer mask.
    fn install_root(&self, cpu: CpuId, load: RootLoad);

    /// Loads the kernel-only root (tag 0).
    fn install_kernel_root(&self, cpu: CpuId);

    /// Loads `table` into the LDTR, or clears it when `None`.
    fn load_descriptor_table(&self, cpu: CpuId, table: Option<&DescriptorTable>);

    /// Sets or clears CR4.PCE, which lets user mode read performance counters.
    fn set_user_pmc_access(&self, cpu: CpuId, allowed: bool);
}
