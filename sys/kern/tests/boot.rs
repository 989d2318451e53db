// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel singleton can only be booted once per process, so everything
//! about it is checked from a single test.

use abi::{Rights, Sysnum, ThreadState};
use kern::startup::{self, PHYS_FRAMES, PAGE_SHIFT, ROOT_PRIORITY};

#[test]
fn boot_and_trap_through_the_singleton() {
    let _ = env_logger::builder().is_test(true).try_init();

    let root = startup::start_kernel().expect("root thread runs first");

    let (sigma0, state, prio) = startup::with_kernel(|k| {
        assert_eq!(k.root_thread(), root);
        (k.root_space(), k.thread_state(root), k.thread_priority(root))
    });
    assert_eq!(state, Some(ThreadState::READY));
    assert_eq!(prio, Some(ROOT_PRIORITY));

    // Sigma0 owns all of physical memory, identity mapped.
    startup::with_kernel(|k| {
        let top = ((PHYS_FRAMES << PAGE_SHIFT) - 1) as u32;
        let t = k.translate(sigma0, top).expect("top of memory mapped");
        assert_eq!(t.phys_for(top), top);
        assert_eq!(t.rights, Rights::RWX);
        assert!(k.translate(sigma0, top.wrapping_add(1)).is_none());
        k.check().unwrap();
    });

    // A yield with nobody else ready comes straight back.
    assert_eq!(
        startup::syscall_entry(Sysnum::Yield as u32, root),
        Some(root)
    );

    let before = startup::with_kernel(|k| k.now());
    assert_eq!(startup::timer_tick(), Some(root));
    assert_eq!(startup::with_kernel(|k| k.now()), before.after(1));
}
