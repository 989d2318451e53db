// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same set
//! of names:
//!
//! - `SavedState`, implementing `thread::ArchState`;
//! - `PageTable`, implementing `space::AddressSpaceOps` and `Default`;
//! - `PhysMemory`, byte access to physical frames;
//! - `switch_to` and `with_interrupts_disabled`;
//! - `AtomicExt` for `AtomicBool`.

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(target_os = "none")] {
        compile_error!("no bare-metal port yet; build for a hosted target");
    } else {
        #[macro_use]
        pub mod sim;
        pub use sim::*;
    }
}
