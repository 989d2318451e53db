// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous message passing.
//!
//! An IPC has up to two phases, a send to `dest` and then a receive, either
//! from `dest` (closed) or from anyone (open). A thread that can't finish a
//! phase right away blocks:
//!
//! - a sender goes `POLLING` on the receiver's sender queue;
//! - a receiver goes `WAITING` (open) or `RECEIVING` (closed).
//!
//! Nothing about a blocked thread's request is stored in the kernel besides
//! its state bits, partner and deadline. The request itself stays in the
//! thread's saved registers, and whichever thread completes the rendezvous
//! reads it from there and writes the blocked thread's results back.

use abi::{
    IpcPhase, IpcStatus, MsgDope, RecvFlags, Rights, SendFlags, ThreadState,
    UsageError, MESSAGE_WORDS,
};

use crate::err::{InteractFault, UserError};
use crate::kernel::Kernel;
use crate::space;
use crate::startup::{MAX_THREADS, PAGE_SHIFT};
use crate::thread::{self, ArchState, NextThread, ThreadHandle};
use crate::time::WaitLimit;
use crate::umem::{self, USlice};

/// Implementation of the IPC syscall for `caller`.
///
/// Malformed requests are refused here, before anything changes, by faulting
/// the caller. Everything after that is reported in-band through the message
/// dope.
pub fn ipc(
    k: &mut Kernel,
    caller: ThreadHandle,
) -> Result<NextThread, UserError> {
    let args = k.threads[caller].save().as_ipc_args();
    let send = args.send?;
    let recv = args.recv?;

    let space = &k.spaces[k.threads[caller].space()];
    if let Some(flags) = send {
        if flags.contains(SendFlags::MAP) {
            args.send_fpage().validate(PAGE_SHIFT)?;
        }
        if flags.contains(SendFlags::STRING) {
            umem::check_access(space, &args.send_string?, Rights::READ)?;
        }
    }
    if let Some(flags) = recv {
        if flags.contains(RecvFlags::MAP_WINDOW) {
            args.window.validate(PAGE_SHIFT)?;
        }
        if flags.contains(RecvFlags::STRING) {
            umem::check_access(space, &args.recv_string?, Rights::WRITE)?;
        }
    }

    let hint = match (send, recv) {
        (Some(_), _) => send_phase(k, caller),
        (None, Some(_)) => receive_phase(k, caller),
        (None, None) => {
            k.threads[caller].save_mut().set_ipc_status(MsgDope::OK);
            NextThread::Same
        }
    };
    Ok(hint)
}

fn send_phase(k: &mut Kernel, caller: ThreadHandle) -> NextThread {
    let args = k.threads[caller].save().as_ipc_args();
    let dest =
        thread::resolve(&k.threads, args.dest).filter(|&d| d != caller);
    let Some(dest) = dest else {
        log::trace!("ipc: {:?} sends to missing {:?}", k.threads[caller].id(), args.dest);
        return finish(
            k,
            caller,
            MsgDope::error(IpcStatus::NotExistent, IpcPhase::Send),
        );
    };

    let state = k.threads[caller].state();
    k.threads[caller].set_state(state | ThreadState::SEND_IN_PROGRESS);

    if accepts_from(k, dest, caller) {
        return deliver(k, caller, dest);
    }

    let limit = WaitLimit::from_timeout(args.timeout.send(), k.now);
    if let Err(hint) = may_block(k, caller, limit, IpcPhase::Send) {
        return hint;
    }
    thread::enqueue_sender(&mut k.threads, dest, caller);
    block(
        k,
        caller,
        ThreadState::POLLING | ThreadState::SEND_IN_PROGRESS,
        Some(dest),
        limit,
    )
}

fn receive_phase(k: &mut Kernel, h: ThreadHandle) -> NextThread {
    let args = k.threads[h].save().as_ipc_args();
    let Ok(Some(flags)) = args.recv else {
        return finish(k, h, MsgDope::OK);
    };
    let state = k.threads[h].state() - ThreadState::IPC_SENDING;
    k.threads[h].set_state(state);

    let (ready_sender, wait_state, partner) =
        if flags.contains(RecvFlags::OPEN) {
            let first = thread::senders(&k.threads, h).next();
            (first, ThreadState::WAITING, None)
        } else {
            let from =
                thread::resolve(&k.threads, args.dest).filter(|&f| f != h);
            let Some(from) = from else {
                return finish(
                    k,
                    h,
                    MsgDope::error(IpcStatus::NotExistent, IpcPhase::Receive),
                );
            };
            let f = &k.threads[from];
            let polling = f.state().contains(ThreadState::POLLING)
                && f.partner() == Some(h);
            (polling.then_some(from), ThreadState::RECEIVING, Some(from))
        };

    if let Some(s) = ready_sender {
        thread::dequeue_sender(&mut k.threads, h, s);
        k.threads[s].set_deadline(None);
        return deliver(k, s, h);
    }

    let limit = WaitLimit::from_timeout(args.timeout.receive(), k.now);
    if let Err(hint) = may_block(k, h, limit, IpcPhase::Receive) {
        return hint;
    }
    let in_progress = state & ThreadState::IPC_IN_PROGRESS;
    block(k, h, wait_state | in_progress, partner, limit)
}

/// Whether `receiver` is blocked waiting for a message that `sender` may
/// deliver.
fn accepts_from(
    k: &Kernel,
    receiver: ThreadHandle,
    sender: ThreadHandle,
) -> bool {
    let r = &k.threads[receiver];
    let s = r.state();
    s.contains(ThreadState::WAITING)
        || (s.contains(ThreadState::RECEIVING) && r.partner() == Some(sender))
}

/// Checks whether `h` may block in `phase` with the given limit. If not, the
/// IPC has already been ended with the right status, and the scheduling
/// consequence comes back as the error.
fn may_block(
    k: &mut Kernel,
    h: ThreadHandle,
    limit: WaitLimit,
    phase: IpcPhase,
) -> Result<(), NextThread> {
    if limit == WaitLimit::NoWait {
        return Err(finish(k, h, MsgDope::error(IpcStatus::Timeout, phase)));
    }
    let state = k.threads[h].state();
    if state.contains(ThreadState::CANCEL) {
        k.threads[h].set_state(state - ThreadState::CANCEL);
        return Err(finish(k, h, MsgDope::error(IpcStatus::Canceled, phase)));
    }
    Ok(())
}

fn block(
    k: &mut Kernel,
    h: ThreadHandle,
    state: ThreadState,
    partner: Option<ThreadHandle>,
    limit: WaitLimit,
) -> NextThread {
    k.sched.dequeue(&mut k.threads, h);
    let t = &mut k.threads[h];
    t.set_state(state);
    t.set_partner(partner);
    t.set_deadline(limit.deadline());
    log::trace!("ipc: {:?} blocks as {state:?} until {limit:?}", t.id());
    NextThread::Other
}

/// Ends `h`'s IPC with `dope` as its result.
fn finish(k: &mut Kernel, h: ThreadHandle, dope: MsgDope) -> NextThread {
    if dope != MsgDope::OK {
        log::trace!(
            "ipc: {:?} ends with {:?}",
            k.threads[h].id(),
            dope.status()
        );
    }
    k.threads[h].save_mut().set_ipc_status(dope);
    wake(k, h)
}

/// Clears `h`'s IPC state and makes it runnable. Its result registers must
/// already be written.
fn wake(k: &mut Kernel, h: ThreadHandle) -> NextThread {
    let t = &mut k.threads[h];
    let cancel = t.state() & ThreadState::CANCEL;
    t.set_state(ThreadState::READY | cancel);
    t.set_partner(None);
    t.set_deadline(None);
    let prio = t.priority();
    k.sched.enqueue(&mut k.threads, h);

    match k.sched.current() {
        Some(c) if c == h => NextThread::Same,
        Some(c)
            if k.threads.get(c).is_some_and(|t| {
                t.is_ready() && !prio.is_more_important_than(t.priority())
            }) =>
        {
            NextThread::Same
        }
        _ => NextThread::Specific(h),
    }
}

/// What a completed transfer delivered.
struct Transfer {
    words: [u32; MESSAGE_WORDS],
    string_len: usize,
    strings: usize,
    fpage: bool,
    status: IpcStatus,
}

/// Moves the message from `sender` to `receiver`: words, then the string, then
/// the flexpage. Only bad buffers are errors; a flexpage that won't map or a
/// string that doesn't fit is a status.
fn transfer(
    k: &mut Kernel,
    sender: ThreadHandle,
    receiver: ThreadHandle,
) -> Result<Transfer, InteractFault> {
    let s_args = k.threads[sender].save().as_ipc_args();
    let r_args = k.threads[receiver].save().as_ipc_args();
    let s_flags = s_args
        .send
        .ok()
        .flatten()
        .ok_or(InteractFault::in_src(UsageError::InvalidDescriptor))?;
    let r_flags = r_args
        .recv
        .ok()
        .flatten()
        .ok_or(InteractFault::in_dst(UsageError::InvalidDescriptor))?;
    let from = k.threads[sender].space();
    let to = k.threads[receiver].space();

    let mut x = Transfer {
        words: s_args.words,
        string_len: 0,
        strings: 0,
        fpage: false,
        status: IpcStatus::Ok,
    };

    if s_flags.contains(SendFlags::STRING) {
        let src = s_args.send_string.map_err(InteractFault::in_src)?;
        let dst = if r_flags.contains(RecvFlags::STRING) {
            r_args.recv_string.map_err(InteractFault::in_dst)?
        } else {
            USlice::empty()
        };
        x.string_len =
            umem::safe_copy(&k.spaces, &mut k.phys, from, src, to, dst)?;
        x.strings = 1;
        if x.string_len < src.len() {
            x.status = IpcStatus::MessageCut;
        }
    }

    if s_flags.contains(SendFlags::MAP) {
        let fpage = s_args
            .send_fpage()
            .validate(PAGE_SHIFT)
            .map_err(InteractFault::in_src)?;
        let window = if r_flags.contains(RecvFlags::MAP_WINDOW) {
            Some(r_args.window.validate(PAGE_SHIFT).map_err(InteractFault::in_dst)?)
        } else {
            None
        };
        let mapped = window.and_then(|window| {
            space::map_fpage(
                &mut k.spaces,
                &mut k.mapdb,
                from,
                fpage,
                s_args.hot_spot(),
                to,
                window,
            )
            .map_err(|e| log::trace!("ipc: flexpage {fpage:?} refused: {e:?}"))
            .ok()
        });
        match mapped {
            Some(got) => {
                x.words[0] = got.base();
                x.words[1] = got.0;
                x.fpage = true;
            }
            None => x.status = IpcStatus::MapFailed,
        }
    }
    Ok(x)
}

/// Completes a rendezvous between `sender`, whose send phase is under way,
/// and `receiver`, which is ready for it. Neither is on a queue any more.
fn deliver(
    k: &mut Kernel,
    sender: ThreadHandle,
    receiver: ThreadHandle,
) -> NextThread {
    let r_state = k.threads[receiver].state();
    k.threads[receiver].set_state(r_state | ThreadState::BUSY);

    match transfer(k, sender, receiver) {
        Ok(x) => {
            let sender_id = k.threads[sender].id();
            let mut dope = MsgDope::error(x.status, IpcPhase::Receive)
                .with_words(MESSAGE_WORDS)
                .with_strings(x.strings);
            if x.fpage {
                dope = dope.with_fpage();
            }
            k.threads[receiver].save_mut().set_ipc_result(
                dope,
                sender_id,
                &x.words,
                x.string_len,
            );
            log::trace!(
                "ipc: {sender_id:?} -> {:?} ({:?})",
                k.threads[receiver].id(),
                x.status
            );
            let hint = wake(k, receiver);
            hint.combine(after_send(k, sender, receiver, x.status))
        }
        Err(fault) => {
            k.threads[receiver].set_state(r_state);
            let mut hint = match fault.apply_to_src(k, sender) {
                Ok(nt) => nt,
                Err(f) => k.force_fault(receiver, f),
            };
            if fault.src.is_none() {
                hint = hint.combine(finish(
                    k,
                    sender,
                    MsgDope::error(IpcStatus::Aborted, IpcPhase::Send),
                ));
            }
            if fault.dst.is_none() && !r_state.intersects(ThreadState::BLOCKED)
            {
                // The receiver was the one asking; it looks for the next
                // sender. A blocked receiver simply stays blocked.
                hint = hint.combine(receive_phase(k, receiver));
            }
            hint
        }
    }
}

/// Moves `sender` on after its send phase: into its receive phase if it has
/// one, otherwise back to running.
fn after_send(
    k: &mut Kernel,
    sender: ThreadHandle,
    receiver: ThreadHandle,
    status: IpcStatus,
) -> NextThread {
    if status != IpcStatus::Ok {
        return finish(k, sender, MsgDope::error(status, IpcPhase::Send));
    }
    let args = k.threads[sender].save().as_ipc_args();
    let Ok(Some(flags)) = args.recv else {
        return finish(k, sender, MsgDope::OK);
    };

    let mut state = k.threads[sender].state() - ThreadState::IPC_SENDING;
    if !flags.contains(RecvFlags::OPEN) {
        state |= ThreadState::IPC_IN_PROGRESS;
    }
    k.threads[sender].set_state(state);
    let hint = receive_phase(k, sender);

    if !k.threads[sender].is_ready() && k.threads[receiver].is_ready() {
        // A call that now waits for its reply: the callee should run.
        hint.combine(NextThread::Specific(receiver))
    } else {
        hint
    }
}

/// Gives up on every IPC whose deadline has passed.
pub fn expire_timeouts(k: &mut Kernel) -> NextThread {
    let mut hint = NextThread::Same;
    for i in 0..MAX_THREADS {
        let Some(h) = k.threads.handle_at(i) else {
            continue;
        };
        match k.threads[h].deadline() {
            Some(d) if d <= k.now => {
                k.threads[h].set_deadline(None);
                let t = &k.threads[h];
                let phase = if t.state().contains(ThreadState::POLLING) {
                    if let Some(p) = t.partner() {
                        thread::dequeue_sender(&mut k.threads, p, h);
                    }
                    IpcPhase::Send
                } else {
                    IpcPhase::Receive
                };
                hint = hint.combine(finish(
                    k,
                    h,
                    MsgDope::error(IpcStatus::Timeout, phase),
                ));
            }
            _ => (),
        }
    }
    hint
}

/// Cancels `h`'s current IPC wait, or, if it isn't waiting, its next one.
pub fn cancel(k: &mut Kernel, h: ThreadHandle) -> NextThread {
    let t = &k.threads[h];
    let state = t.state();
    if !state.intersects(ThreadState::BLOCKED) {
        k.threads[h].set_state(state | ThreadState::CANCEL);
        return NextThread::Same;
    }

    let phase = if state.contains(ThreadState::POLLING) {
        if let Some(p) = t.partner() {
            thread::dequeue_sender(&mut k.threads, p, h);
        }
        IpcPhase::Send
    } else {
        IpcPhase::Receive
    };
    let status = if state.contains(ThreadState::IPC_IN_PROGRESS) {
        IpcStatus::Aborted
    } else {
        IpcStatus::Canceled
    };
    finish(k, h, MsgDope::error(status, phase))
}

/// Unties every IPC that involves `h`, which is about to disappear.
///
/// - Senders queued on it fail with `NotExistent`.
/// - Threads in a closed receive from it fail with `NotExistent`, or with
///   `Aborted` if they were waiting for the reply to a call.
/// - If `h` was itself queued as a sender, it is unlinked.
pub fn partner_gone(k: &mut Kernel, h: ThreadHandle) -> NextThread {
    let mut hint = NextThread::Same;
    loop {
        let Some(s) = thread::senders(&k.threads, h).next() else {
            break;
        };
        thread::dequeue_sender(&mut k.threads, h, s);
        hint = hint.combine(finish(
            k,
            s,
            MsgDope::error(IpcStatus::NotExistent, IpcPhase::Send),
        ));
    }

    for i in 0..MAX_THREADS {
        let Some(w) = k.threads.handle_at(i) else {
            continue;
        };
        let t = &k.threads[w];
        if w == h
            || t.partner() != Some(h)
            || !t.state().contains(ThreadState::RECEIVING)
        {
            continue;
        }
        let status = if t.state().contains(ThreadState::IPC_IN_PROGRESS) {
            IpcStatus::Aborted
        } else {
            IpcStatus::NotExistent
        };
        hint = hint.combine(finish(
            k,
            w,
            MsgDope::error(status, IpcPhase::Receive),
        ));
    }

    let t = &k.threads[h];
    if t.state().contains(ThreadState::POLLING) {
        if let Some(p) = t.partner() {
            thread::dequeue_sender(&mut k.threads, p, h);
        }
    }
    hint
}
