// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod common;

use abi::{Priority, ResponseCode, Sysnum, ThreadId, ThreadState};
use common::*;
use kern::startup::DEFAULT_QUANTUM;
use kern::Kernel;

/// Drops the root thread to priority 1 so the threads under test get the CPU.
fn step_aside(k: &mut Kernel) -> Option<ThreadId> {
    let root = k.root_thread();
    syscall(k, root, Sysnum::SetPriority, &[root.0, 1])
}

#[test]
fn more_important_thread_runs_first() {
    let mut k = boot();
    let space = k.root_space();
    let _low = spawn(&mut k, space, 5);
    let high = spawn(&mut k, space, 10);

    assert_eq!(step_aside(&mut k), Some(high));
    assert_eq!(ret(&k, k.root_thread(), 1), 128, "old priority returned");
}

#[test]
fn equal_priorities_share_by_quantum() {
    let mut k = boot();
    let space = k.root_space();
    let t: Vec<_> = (0..3).map(|_| spawn(&mut k, space, 20)).collect();

    assert_eq!(step_aside(&mut k), Some(t[0]));
    for _ in 1..DEFAULT_QUANTUM {
        assert_eq!(k.tick(), Some(t[0]));
    }
    assert_eq!(k.tick(), Some(t[1]));
    for _ in 0..DEFAULT_QUANTUM {
        k.tick();
    }
    assert_eq!(k.current(), Some(t[2]));
    for _ in 0..DEFAULT_QUANTUM {
        k.tick();
    }
    assert_eq!(k.current(), Some(t[0]));
}

#[test]
fn yield_passes_the_turn() {
    let mut k = boot();
    let space = k.root_space();
    let a = spawn(&mut k, space, 20);
    let b = spawn(&mut k, space, 20);

    assert_eq!(step_aside(&mut k), Some(a));
    assert_eq!(syscall(&mut k, a, Sysnum::Yield, &[]), Some(b));
    assert_eq!(syscall(&mut k, b, Sysnum::Yield, &[]), Some(a));
}

#[test]
fn thread_switch_donates_to_the_named_thread() {
    let mut k = boot();
    let space = k.root_space();
    let a = spawn(&mut k, space, 20);
    let b = spawn(&mut k, space, 20);
    let c = spawn(&mut k, space, 20);

    assert_eq!(step_aside(&mut k), Some(a));
    assert_eq!(syscall(&mut k, a, Sysnum::ThreadSwitch, &[c.0]), Some(c));
    // A nil target is a plain yield.
    assert_eq!(
        syscall(&mut k, c, Sysnum::ThreadSwitch, &[ThreadId::NIL.0]),
        Some(b)
    );
}

#[test]
fn blocking_hands_over_to_the_next_ready_thread() {
    let mut k = boot();
    let space = k.root_space();
    let server = spawn(&mut k, space, 30);
    let client = spawn(&mut k, space, 20);

    assert_eq!(step_aside(&mut k), Some(server));
    assert_eq!(ipc(&mut k, server, &Ipc::wait()), Some(client));
    // The call wakes the more important server, which runs at once.
    assert_eq!(ipc(&mut k, client, &Ipc::call(server, [1, 2, 3])), Some(server));
    assert_eq!(k.thread_state(server), Some(ThreadState::READY));
}

#[test]
fn priorities_are_bounded_by_the_callers_mcp() {
    let mut k = boot();
    let space = k.root_space();
    let root = k.root_thread();
    let t = spawn(&mut k, space, 50);

    syscall(&mut k, t, Sysnum::CreateThread, &[u32::from(space.0), 60, 0x2000, 0x8000]);
    assert_eq!(ret(&k, t, 0), ResponseCode::NoPermission as u32);

    syscall(&mut k, t, Sysnum::CreateThread, &[u32::from(space.0), 40, 0x2000, 0x8000]);
    assert_eq!(ret(&k, t, 0), 0);
    let child = ThreadId(ret(&k, t, 1));
    assert_eq!(k.thread_priority(child), Some(Priority(40)));

    // Not allowed to touch a thread above its own ceiling.
    syscall(&mut k, t, Sysnum::SetPriority, &[root.0, 10]);
    assert_eq!(ret(&k, t, 0), ResponseCode::NoPermission as u32);
    assert_eq!(k.thread_priority(root), Some(Priority(128)));

    syscall(&mut k, t, Sysnum::SetPriority, &[child.0, 45]);
    assert_eq!(ret(&k, t, 0), 0);
    assert_eq!(ret(&k, t, 1), 40);
    assert_eq!(k.thread_priority(child), Some(Priority(45)));
}

#[test]
fn out_of_range_priority_is_a_fault() {
    let mut k = boot();
    let space = k.root_space();
    let root = k.root_thread();
    syscall(&mut k, root, Sysnum::CreateThread, &[u32::from(space.0), 256, 0x2000, 0x8000]);
    assert_eq!(
        k.thread_fault(root),
        Some(abi::UsageError::BadPriority.into())
    );
}

#[test]
fn thread_info_reports_state_priority_and_partner() {
    let mut k = boot();
    let space = k.root_space();
    let root = k.root_thread();
    let server = spawn(&mut k, space, 10);
    let a = spawn(&mut k, space, 12);

    ipc(&mut k, a, &Ipc::send(server, [0; 3]));
    syscall(&mut k, root, Sysnum::ThreadInfo, &[a.0]);
    assert_eq!(ret(&k, root, 0), 0);
    assert_eq!(
        ret(&k, root, 1),
        (ThreadState::POLLING | ThreadState::SEND_IN_PROGRESS).bits()
    );
    assert_eq!(ret(&k, root, 2), 12);
    assert_eq!(ret(&k, root, 3), server.0);

    syscall(&mut k, root, Sysnum::ThreadInfo, &[ThreadId::NIL.0]);
    assert_eq!(ret(&k, root, 0), ResponseCode::NotExistent as u32);
}
