// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Recording MMU hardware layer shared by the host integration tests
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only. Models a per-CPU tagged TLB to catch reuse of translations that
//!       belong to another context, or to an older generation of the same one, without
//!       an invalidation.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use neuron_mmctx::{
    Asid, ContextId, ContextManager, CpuId, DescriptorTable, Generation, HwFeatures, MmCtxConfig, MmuHal,
    RootLoad,
};
use spin::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HalEvent {
    Root { cpu: CpuId, load: RootLoad },
    KernelRoot { cpu: CpuId },
    Ldt { cpu: CpuId, entries: Option<usize> },
    Pce { cpu: CpuId, allowed: bool },
}

pub struct RecordingHal {
    features: HwFeatures,
    ticks: AtomicU64,
    events: Mutex<Vec<HalEvent>>,
    tlb: Mutex<HashMap<(CpuId, Asid), (ContextId, Generation)>>,
    violations: AtomicUsize,
}

impl RecordingHal {
    pub fn new(features: HwFeatures) -> Self {
        Self {
            features,
            ticks: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
            tlb: Mutex::new(HashMap::new()),
            violations: AtomicUsize::new(0),
        }
    }

    pub fn advance_ticks(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::Relaxed);
    }

    pub fn take_events(&self) -> Vec<HalEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Root loads issued on `cpu` since the last `take_events`.
    pub fn roots(&self, cpu: CpuId) -> Vec<RootLoad> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                HalEvent::Root { cpu: at, load } if *at == cpu => Some(*load),
                _ => None,
            })
            .collect()
    }

    /// Loads that would have reused foreign or stale cached translations.
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }
}

impl MmuHal for RecordingHal {
    fn features(&self) -> HwFeatures {
        self.features
    }

    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn install_root(&self, cpu: CpuId, load: RootLoad) {
        {
            let mut tlb = self.tlb.lock();
            let owner = (load.context, load.generation);
            if load.invalidate {
                tlb.insert((cpu, load.tag), owner);
            } else if tlb.get(&(cpu, load.tag)) != Some(&owner) {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.events.lock().push(HalEvent::Root { cpu, load });
    }

    fn install_kernel_root(&self, cpu: CpuId) {
        self.tlb.lock().remove(&(cpu, Asid::KERNEL));
        self.events.lock().push(HalEvent::KernelRoot { cpu });
    }

    fn load_descriptor_table(&self, cpu: CpuId, table: Option<&DescriptorTable>) {
        self.events.lock().push(HalEvent::Ldt { cpu, entries: table.map(DescriptorTable::len) });
    }

    fn set_user_pmc_access(&self, cpu: CpuId, allowed: bool) {
        self.events.lock().push(HalEvent::Pce { cpu, allowed });
    }
}

pub fn manager(features: HwFeatures, asids: u16) -> ContextManager<RecordingHal> {
    manager_with(features, MmCtxConfig::DEFAULT.with_asid_count(asids))
}

pub fn manager_with(features: HwFeatures, config: MmCtxConfig) -> ContextManager<RecordingHal> {
    ContextManager::new(RecordingHal::new(features), config).expect("valid configuration")
}

pub fn cpu(raw: u16) -> CpuId {
    CpuId::from_raw(raw)
}
