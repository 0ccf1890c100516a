// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Auxiliary per-address-space resources: descriptor table, pointer masking and
//! protection keys. Each is duplicated on fork and released with its context.

pub mod lam;
pub mod ldt;
pub mod pkeys;

pub use lam::{LamState, PointerMask};
pub use ldt::{Descriptor, DescriptorTable, LdtSlot, LdtSlots};
pub use pkeys::{access_permitted, Pkey, PkeyState, Pkru};
