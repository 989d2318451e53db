// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup, build-time configuration, and the kernel singleton.
//!
//! Code that owns a `Kernel` can drive it directly. The singleton is for
//! trap handlers, which have nowhere to keep one: `start_kernel` installs it
//! once per boot, and `with_kernel` hands out exclusive access with
//! interrupts masked.

use core::sync::atomic::{AtomicBool, Ordering};

use abi::ThreadId;
use static_assertions::const_assert;

use crate::arch;
use crate::atomic::AtomicExt;
use crate::fail::{self, OrDie};
use crate::kernel::Kernel;

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

// IDs only have room for so many table slots.
const_assert!(MAX_THREADS <= 1 << abi::ThreadId::INDEX_BITS);
const_assert!(MAX_SPACES <= 1 << abi::SpaceId::INDEX_BITS);
const_assert!(MAX_MAPPINGS <= u16::MAX as usize);
const_assert!(PAGE_SHIFT >= abi::Fpage::MIN_SIZE_LOG2);
const_assert!(PAGE_SHIFT < SUPERPAGE_SHIFT);
const_assert!(STRING_BUFFER_LEN > 0);

/// Set once `start_kernel` has run. A second boot in the same image is a
/// bug.
static BOOTED: AtomicBool = AtomicBool::new(false);

static KERNEL: spin::Mutex<Option<Kernel>> = spin::Mutex::new(None);

/// The main kernel entry point: builds every kernel table, gives sigma0 its
/// memory, creates the root thread and installs the result as the kernel
/// singleton. Returns the thread to run first.
pub fn start_kernel() -> Option<ThreadId> {
    if BOOTED.compare_swap_polyfill(false, true, Ordering::SeqCst) {
        fail::die("start_kernel called twice");
    }
    let k = Kernel::new();
    let first = k.current();
    arch::with_interrupts_disabled(|| {
        *KERNEL.try_lock().or_die("kernel locked during boot") = Some(k);
    });
    first
}

/// Runs `body` with exclusive access to the kernel singleton.
///
/// The kernel is not reentrant; trying to enter it from inside `body` kills
/// it.
pub fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    arch::with_interrupts_disabled(|| {
        let mut guard = KERNEL.try_lock().or_die("kernel entered twice");
        let k = guard.as_mut().or_die("kernel used before start_kernel");
        body(k)
    })
}

/// Trap entry for syscalls, for use once `start_kernel` has run.
pub fn syscall_entry(nr: u32, caller: ThreadId) -> Option<ThreadId> {
    with_kernel(|k| k.syscall_entry(nr, caller))
}

/// Trap entry for the timer interrupt.
pub fn timer_tick() -> Option<ThreadId> {
    with_kernel(Kernel::tick)
}
