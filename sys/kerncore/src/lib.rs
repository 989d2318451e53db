// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel containers that don't depend on anything kernel-specific.
//!
//! The kernel keeps all of its objects (threads, address spaces, mapping tree
//! nodes) in fixed-capacity tables and links them together by index rather
//! than by pointer. The generic half of that lives here, where it can be
//! tested on the host without dragging in the rest of the kernel:
//!
//! - `Arena` is a fixed-capacity table handing out generational `Handle`s. A
//!   handle outlives the object it names harmlessly: once the slot is freed
//!   (or reused), lookups through the old handle fail instead of aliasing.
//! - `List` is an intrusive doubly-linked list threaded through objects in an
//!   `Arena`, with O(1) insertion and removal given a handle.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

pub mod arena;
pub mod list;

pub use arena::{Arena, Full, Handle};
pub use list::{Adapter, Links, List};
