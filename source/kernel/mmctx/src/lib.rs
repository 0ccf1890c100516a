// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space identity and context-switch subsystem
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit + property tests per module, host integration tests under tests/
//! PUBLIC API: ContextManager, ContextHandle, Processor, MmuHal, AsidTable
//! DEPENDS_ON: bitflags, spin, static_assertions, log
//! INVARIANTS: Lock-free switch path; identities never reused; generations monotonic;
//!             a tag is used only after the processor's view of it matches its binding
//!
//! Gives every address space a unique identity and a generation counter, multiplexes a
//! small hardware tag space over any number of contexts, and drives the per-processor
//! switch that installs a context's root, tag, pointer mask and descriptor table.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod asid;
pub mod config;
pub mod context;
pub mod error;
pub mod generation;
pub mod hal;
pub mod ident;
pub mod manager;
pub mod resources;
pub mod switch;
pub mod types;

pub use asid::{AsidTable, Binding, GrantKind, TagGrant};
pub use config::{HwFeatures, MmCtxConfig, RdpmcPolicy};
pub use context::{ContextFlags, ContextHandle, MmContext};
pub use error::{AllocError, DestroyError, MmCtxError};
pub use hal::{MmuHal, RootLoad};
pub use manager::ContextManager;
pub use resources::{access_permitted, Descriptor, DescriptorTable, LdtSlot, Pkey, PkeyState, Pkru, PointerMask};
pub use switch::{Processor, SwitchOutcome, SwitchPath, SwitchState};
pub use types::{Asid, ContextId, CpuId, CpuMask, Generation};

#[cfg(feature = "failpoints")]
pub use resources::ldt::failpoints;
