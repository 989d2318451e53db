// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A second-generation microkernel core.
//!
//! The kernel provides three things: address spaces built by mapping,
//! granting and unmapping flexpages between spaces; threads that talk by
//! synchronous IPC; and a priority scheduler. Everything else (pagers,
//! drivers, policy) lives in user threads.
//!
//! Code outside of the `arch` module is portable. The only `arch` today is a
//! host simulation, in which user programs are just saved register files that
//! callers load before entering the kernel.
//!
//! # Design principles
//!
//! 1. Static configuration. Table sizes and the machine's page geometry are
//!    fixed at build time by `kernel.toml`.
//! 2. No allocation in the kernel proper. Every table is a fixed-capacity
//!    arena, and queues are intrusive lists threaded through arena entries.
//! 3. Check, then act. Operations that touch several tables validate
//!    everything they will need before changing anything, so failures leave
//!    no partial state behind.
//! 4. A strong preference for safe code. There is no `unsafe` outside `arch`,
//!    and none in the simulation.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

mod atomic;
pub mod err;
pub mod fail;
pub mod ipc;
pub mod kernel;
pub mod mapdb;
pub mod sched;
pub mod space;
pub mod startup;
pub mod syscalls;
pub mod thread;
pub mod time;
pub mod umem;

pub use kernel::Kernel;
