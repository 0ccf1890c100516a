// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Diagnostics for the address-space context subsystem
//! OWNERS: @kernel-mm-team
//! PUBLIC API: log_* macros, fatal()
//! DEPENDS_ON: log facade
//! INVARIANTS: Fatal paths log before panicking; no allocation on emission

#[macro_use]
pub mod log;

use core::fmt::Arguments;

/// Reports a consistency violation and aborts the current operation.
///
/// Continuing after one of these would risk executing under the wrong address space.
#[cold]
#[track_caller]
pub fn fatal(target: &'static str, args: Arguments<'_>) -> ! {
    self::log::emit(self::log::Level::Error, target, args);
    panic!("mmctx fatal: {}", args);
}
