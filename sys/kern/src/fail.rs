// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel crashes/failures such that they can be found by
//! tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is false until the kernel
//!   reaches the `die` function (either explicitly or as a result of a
//!   `panic!`), and true afterwards.
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The `die` routine writes
//!   as much of the failure reason into this buffer (as UTF-8) as possible,
//!   truncating if the buffer fills. For printing, trim off any trailing NUL
//!   bytes.
//!
//! On a hosted build the simulated "CPU" is just the calling thread, so after
//! recording the epitaph `die` logs the reason and panics instead of spinning.

use core::fmt::{Debug, Display, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::atomic::AtomicExt;

/// Flag that gets set to `true` by all failure reporting functions, giving
/// tools a one-stop-shop for doing kernel triage.
#[used]
static KERNEL_HAS_FAILED: AtomicBool = AtomicBool::new(false);

pub const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of the
/// event that caused the kernel to fail, padded with NULs.
#[used]
static KERNEL_EPITAPH: spin::Mutex<[u8; EPITAPH_LEN]> =
    spin::Mutex::new([0; EPITAPH_LEN]);

/// Records `msg` as the reason the kernel died, and stops.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let previous_fail =
        KERNEL_HAS_FAILED.swap_polyfill(true, Ordering::SeqCst);

    // A second failure on the way down (a panic inside `die`, say) must not
    // overwrite the first epitaph. A held lock means exactly that.
    if !previous_fail {
        if let Some(mut buf) = KERNEL_EPITAPH.try_lock() {
            buf.fill(0);
            let mut writer = Eulogist { dest: &mut buf[..] };
            write!(writer, "{msg}").ok();
        }
    }

    halt(msg, previous_fail)
}

#[cfg(target_os = "none")]
fn halt(_msg: &dyn Display, _recursive: bool) -> ! {
    loop {
        // Platform-independent NOP
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(not(target_os = "none"))]
fn halt(msg: &dyn Display, _recursive: bool) -> ! {
    log::error!("kernel died: {msg}");
    panic!("kernel died: {msg}")
}

/// Checks whether any kernel in this process has died.
pub fn has_failed() -> bool {
    KERNEL_HAS_FAILED.load(Ordering::SeqCst)
}

/// Reads back the recorded epitaph, with the NUL padding trimmed off.
pub fn epitaph() -> heapless::String<EPITAPH_LEN> {
    let mut out = heapless::String::new();
    let buf = KERNEL_EPITAPH.lock();
    let end = buf.iter().position(|&b| b == 0).unwrap_or(EPITAPH_LEN);
    // Truncation may have split a character; keep the valid prefix.
    let text = match core::str::from_utf8(&buf[..end]) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&buf[..e.valid_up_to()]).unwrap_or(""),
    };
    out.push_str(text).ok();
    out
}

struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl Write for Eulogist<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

/// Extension for values that can only be missing if the kernel's own
/// bookkeeping is broken.
pub trait OrDie<T> {
    /// Unwraps `self`, or dies naming `what` went wrong.
    fn or_die(self, what: &str) -> T;
}

impl<T> OrDie<T> for Option<T> {
    #[track_caller]
    fn or_die(self, what: &str) -> T {
        match self {
            Some(x) => x,
            None => die(what),
        }
    }
}

impl<T, E: Debug> OrDie<T> for Result<T, E> {
    #[track_caller]
    fn or_die(self, what: &str) -> T {
        match self {
            Ok(x) => x,
            Err(e) => die(format_args!("{what}: {e:?}")),
        }
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
