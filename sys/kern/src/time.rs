// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

use abi::TimeoutValue;

use crate::startup::TICK_US;

/// In-kernel timestamp representation.
///
/// This is measured in timer ticks since boot, each `TICK_US` microseconds
/// long.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// Returns the timestamp `ticks` after this one, saturating.
    pub fn after(self, ticks: u64) -> Self {
        Self(self.0.saturating_add(ticks))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// Converts a duration in microseconds to ticks, rounding up, so that a
/// timeout never fires early.
pub fn ticks_for_micros(us: u64) -> u64 {
    us.div_ceil(TICK_US)
}

/// How long a thread is prepared to block in one IPC phase.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitLimit {
    /// Fail at once rather than block.
    NoWait,
    /// Block until the partner shows up.
    Forever,
    /// Block until the partner shows up or this moment passes.
    Until(Timestamp),
}

impl WaitLimit {
    pub fn from_timeout(t: TimeoutValue, now: Timestamp) -> Self {
        match t {
            TimeoutValue::Never => WaitLimit::Forever,
            TimeoutValue::Zero | TimeoutValue::Micros(0) => WaitLimit::NoWait,
            TimeoutValue::Micros(us) => {
                WaitLimit::Until(now.after(ticks_for_micros(us)))
            }
        }
    }

    /// The deadline to record on a thread blocked with this limit.
    pub fn deadline(self) -> Option<Timestamp> {
        match self {
            WaitLimit::Until(t) => Some(t),
            WaitLimit::NoWait | WaitLimit::Forever => None,
        }
    }
}
