// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Syscall code reports what went wrong through `Result` and lets one
//! wrapper decide whether that means a response code or a fault, instead of
//! every call site doing its own bookkeeping.

use abi::{FaultInfo, Kerr, UsageError};

use crate::task::NextTask;

/// An error committed by user code when interacting with a syscall.
///
/// This is used internally as the returned error type for syscall
/// implementations.
#[derive(Clone, Debug)]
pub enum UserError {
    /// A recoverable error. Recoverable errors are indicated to the errant
    /// task by returning a `Kerr` code in its result register. They may
    /// still cause a context switch, however, as indicated by the
    /// `NextTask`.
    Recoverable(Kerr, NextTask),
    /// An unrecoverable error. Unrecoverable errors are translated to faults
    /// against the errant task, which is marked faulted and no longer
    /// runnable.
    Unrecoverable(FaultInfo),
}

impl UserError {
    /// Shorthand for the common "return this code, stay on this task" case.
    pub fn code(k: Kerr) -> Self {
        Self::Recoverable(k, NextTask::Same)
    }
}

/// Convenience conversion from `FaultInfo`.
impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

/// Convenience conversion from `UsageError` (by way of `FaultInfo`).
impl From<UsageError> for UserError {
    fn from(f: UsageError) -> Self {
        Self::Unrecoverable(f.into())
    }
}
