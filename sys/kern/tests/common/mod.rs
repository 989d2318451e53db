// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Harness for driving a kernel the way user programs would: load argument
//! registers, trap, read result registers.

#![allow(dead_code)]

use abi::{
    Fpage, MsgDope, RecvFlags, SendFlags, SpaceId, Sysnum, ThreadId, Timeout,
    NIL_DESCRIPTOR,
};
use kern::arch::ARG_REGS;
use kern::Kernel;

pub fn boot() -> Box<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    Box::new(Kernel::new())
}

/// Makes syscall `nr` from `t` with the given leading arguments; the rest are
/// zeroed.
pub fn syscall(
    k: &mut Kernel,
    t: ThreadId,
    nr: Sysnum,
    args: &[u32],
) -> Option<ThreadId> {
    let s = k.saved_state_mut(t).expect("caller exists");
    for i in 0..ARG_REGS {
        s.set_arg(i, args.get(i).copied().unwrap_or(0));
    }
    k.syscall_entry(nr as u32, t)
}

pub fn ret(k: &Kernel, t: ThreadId, i: usize) -> u32 {
    k.saved_state(t).expect("thread exists").ret(i)
}

pub fn dope(k: &Kernel, t: ThreadId) -> MsgDope {
    MsgDope(ret(k, t, 0))
}

/// Creates a thread in `space` on behalf of the root thread.
pub fn spawn(k: &mut Kernel, space: SpaceId, prio: u8) -> ThreadId {
    let root = k.root_thread();
    syscall(
        k,
        root,
        Sysnum::CreateThread,
        &[u32::from(space.0), u32::from(prio), 0x2000, 0x8000],
    );
    assert_eq!(ret(k, root, 0), 0, "create_thread failed");
    ThreadId(ret(k, root, 1))
}

/// Creates a space whose chief is `by`'s space.
pub fn new_space(k: &mut Kernel, by: ThreadId) -> SpaceId {
    syscall(k, by, Sysnum::CreateSpace, &[]);
    assert_eq!(ret(k, by, 0), 0, "create_space failed");
    SpaceId(ret(k, by, 1) as u16)
}

/// An IPC request, laid out into registers by `ipc`.
#[derive(Clone, Debug)]
pub struct Ipc {
    pub dest: ThreadId,
    pub send: Option<SendFlags>,
    pub recv: Option<RecvFlags>,
    pub timeout: Timeout,
    pub words: [u32; 3],
    pub window: Fpage,
    pub send_string: (u32, u32),
    pub recv_string: (u32, u32),
}

impl Ipc {
    fn new(dest: ThreadId) -> Self {
        Self {
            dest,
            send: None,
            recv: None,
            timeout: Timeout::NEVER,
            words: [0; 3],
            window: Fpage::NIL,
            send_string: (0, 0),
            recv_string: (0, 0),
        }
    }

    pub fn send(dest: ThreadId, words: [u32; 3]) -> Self {
        Self {
            send: Some(SendFlags::empty()),
            words,
            ..Self::new(dest)
        }
    }

    pub fn call(dest: ThreadId, words: [u32; 3]) -> Self {
        Self {
            recv: Some(RecvFlags::empty()),
            ..Self::send(dest, words)
        }
    }

    pub fn reply_wait(dest: ThreadId, words: [u32; 3]) -> Self {
        Self {
            recv: Some(RecvFlags::OPEN),
            ..Self::send(dest, words)
        }
    }

    pub fn wait() -> Self {
        Self {
            recv: Some(RecvFlags::OPEN),
            ..Self::new(ThreadId::NIL)
        }
    }

    pub fn receive_from(src: ThreadId) -> Self {
        Self {
            recv: Some(RecvFlags::empty()),
            ..Self::new(src)
        }
    }

    pub fn timeout(self, timeout: Timeout) -> Self {
        Self { timeout, ..self }
    }

    pub fn send_flags(mut self, f: SendFlags) -> Self {
        self.send = Some(self.send.unwrap_or(SendFlags::empty()) | f);
        self
    }

    pub fn recv_flags(mut self, f: RecvFlags) -> Self {
        self.recv = Some(self.recv.unwrap_or(RecvFlags::empty()) | f);
        self
    }

    pub fn window(self, window: Fpage) -> Self {
        Self { window, ..self }.recv_flags(RecvFlags::MAP_WINDOW)
    }

    pub fn string(self, addr: u32, len: u32) -> Self {
        Self {
            send_string: (addr, len),
            ..self
        }
        .send_flags(SendFlags::STRING)
    }

    pub fn buffer(self, addr: u32, len: u32) -> Self {
        Self {
            recv_string: (addr, len),
            ..self
        }
        .recv_flags(RecvFlags::STRING)
    }

    pub fn args(&self) -> [u32; ARG_REGS] {
        [
            self.dest.0,
            self.send.map_or(NIL_DESCRIPTOR, |f| f.bits()),
            self.recv.map_or(NIL_DESCRIPTOR, |f| f.bits()),
            self.timeout.0,
            self.words[0],
            self.words[1],
            self.words[2],
            self.window.0,
            self.send_string.0,
            self.send_string.1,
            self.recv_string.0,
            self.recv_string.1,
        ]
    }
}

pub fn ipc(k: &mut Kernel, t: ThreadId, req: &Ipc) -> Option<ThreadId> {
    syscall(k, t, Sysnum::Ipc, &req.args())
}
