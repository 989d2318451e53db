// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate that
//! concern using `Result`.

use abi::{FaultInfo, ResponseCode, UsageError};

use crate::kernel::Kernel;
use crate::thread::{NextThread, ThreadHandle};

/// An error committed by user code when interacting with a syscall.
///
/// This is used internally as the returned error type for syscall
/// implementations.
#[derive(Clone, Debug)]
pub enum UserError {
    /// A recoverable error. Recoverable errors are indicated to the errant
    /// thread by returning a response code. They may still cause a context
    /// switch, however, as indicated by the `NextThread`.
    Recoverable(ResponseCode, NextThread),
    /// An unrecoverable error. Unrecoverable errors are translated to faults
    /// against the errant thread, which is marked faulted and no longer
    /// runnable.
    Unrecoverable(FaultInfo),
}

impl UserError {
    /// Shorthand for the common case of a recoverable error with no
    /// scheduling consequences.
    pub fn code(code: ResponseCode) -> Self {
        Self::Recoverable(code, NextThread::Same)
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

/// A fault that arose in the interaction between two threads (i.e. during
/// message transfer).
///
/// This can assign fault to either or both threads. By convention, an
/// `InteractFault` won't contain both fields as `None`, though the type system
/// doesn't prevent this.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InteractFault {
    /// Fault in the source thread of a transfer.
    pub src: Option<FaultInfo>,
    /// Fault in the destination thread of a transfer.
    pub dst: Option<FaultInfo>,
}

impl InteractFault {
    /// Blames the source side of a transfer.
    pub fn in_src(fi: impl Into<FaultInfo>) -> Self {
        Self {
            src: Some(fi.into()),
            dst: None,
        }
    }

    /// Blames the destination side of a transfer.
    pub fn in_dst(fi: impl Into<FaultInfo>) -> Self {
        Self {
            src: None,
            dst: Some(fi.into()),
        }
    }

    /// Discharges the `src` side of this fault, if any, by forcing it on the
    /// given thread. Returns the `dst` side.
    ///
    /// This is intended to be called during syscalls from the destination's
    /// perspective, to store the src fault and then deal with dst.
    pub fn apply_to_src(
        self,
        kernel: &mut Kernel,
        src: ThreadHandle,
    ) -> Result<NextThread, FaultInfo> {
        let nt = if let Some(f) = self.src {
            kernel.force_fault(src, f)
        } else {
            NextThread::Same
        };
        if let Some(f) = self.dst {
            Err(f)
        } else {
            Ok(nt)
        }
    }
}
