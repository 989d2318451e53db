// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel atomic type support.

use core::sync::atomic::Ordering;

/// An atomic type with the operations the kernel needs.
///
/// Some small cores have no native swap or compare-and-swap, and `core`
/// removes those methods on such targets. The kernel only ever touches its
/// atomics with interrupts disabled on a single CPU, so an arch can implement
/// these with a plain load and store where the hardware lacks the real thing.
///
/// Implementations live in the `arch::whatever` module for the target.
pub(crate) trait AtomicExt {
    type Primitive;

    fn swap_polyfill(
        &self,
        value: Self::Primitive,
        ordering: Ordering,
    ) -> Self::Primitive;

    /// Stores `new` if the current value is `current`. Returns the previous
    /// value either way, like `compare_exchange` folded into one result.
    fn compare_swap_polyfill(
        &self,
        current: Self::Primitive,
        new: Self::Primitive,
        ordering: Ordering,
    ) -> Self::Primitive;
}
