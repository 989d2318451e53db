// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! # Syscall implementations
//!
//! With only a couple of exceptions, syscalls are implemented by functions with
//! the signature:
//!
//! ```ignore
//! fn syscall(k: &mut Kernel, caller: ThreadHandle) -> Result<NextThread, UserError>;
//! ```
//!
//! `caller` is the handle of the thread that triggered the syscall. On
//! return, a `NextThread` indicates success with a possible scheduling hint,
//! while a `UserError` indicates a condition that needs to either be returned
//! as a response code or recorded as a fault. A common wrapper takes care of
//! the final side effects, reducing code in each syscall.
//!
//! Arguments to syscalls need to be read from the `thread.save()` structure
//! where the thread's registers are stored. Each class of syscall has an
//! *argument proxy* type to make this easy and safe, e.g.
//! `thread.save().as_map_args()`. See the `thread::ArchState` trait for
//! details.
//!
//! # Permissions
//!
//! A thread may manage a space (map into it, unmap from it, create or destroy
//! its threads, and so on) if it is the thread's own space, if the thread's
//! space is its chief, or if the thread lives in sigma0.

use abi::{ResponseCode, Sysnum, ThreadId, UsageError};

use crate::err::UserError;
use crate::ipc;
use crate::kernel::Kernel;
use crate::mapdb::MapDbError;
use crate::space::{self, SpaceHandle};
use crate::startup::PAGE_SHIFT;
use crate::thread::{self, ArchState, NextThread, ThreadHandle};

/// Runs syscall `nr` for `caller` and applies the outcome: a response code
/// for recoverable errors, a fault for the rest.
pub(crate) fn safe_syscall_entry(
    k: &mut Kernel,
    nr: u32,
    caller: ThreadHandle,
) -> NextThread {
    let res = match Sysnum::try_from(nr) {
        Ok(Sysnum::Ipc) => ipc::ipc(k, caller),
        Ok(Sysnum::Map) => map(k, caller),
        Ok(Sysnum::Unmap) => unmap(k, caller),
        Ok(Sysnum::CreateThread) => create_thread(k, caller),
        Ok(Sysnum::DestroyThread) => destroy_thread(k, caller),
        Ok(Sysnum::SetPriority) => set_priority(k, caller),
        Ok(Sysnum::Yield) => Ok(yield_cpu(k, caller)),
        Ok(Sysnum::ThreadSwitch) => Ok(thread_switch(k, caller)),
        Ok(Sysnum::CreateSpace) => create_space(k, caller),
        Ok(Sysnum::DestroySpace) => destroy_space(k, caller),
        Ok(Sysnum::Cancel) => cancel(k, caller),
        Ok(Sysnum::ThreadInfo) => thread_info(k, caller),
        Err(()) => {
            // Bogus syscall number! That's a fault.
            Err(UsageError::BadSyscallNumber.into())
        }
    };
    match res {
        Ok(nt) => nt,
        Err(UserError::Recoverable(code, hint)) => {
            // The caller may have destroyed itself along the way.
            if let Some(t) = k.threads.get_mut(caller) {
                t.save_mut().set_response(code);
            }
            hint
        }
        Err(UserError::Unrecoverable(fault)) => k.force_fault(caller, fault),
    }
}

/// Checks that `caller` may manage `space`.
fn check_manages(
    k: &Kernel,
    caller: ThreadHandle,
    space: SpaceHandle,
) -> Result<(), UserError> {
    let own = k.threads[caller].space();
    if own == space
        || own == k.root_space
        || k.spaces[space].chief() == Some(own)
    {
        Ok(())
    } else {
        Err(UserError::code(ResponseCode::NoPermission))
    }
}

fn resolve_space(
    k: &Kernel,
    id: abi::SpaceId,
) -> Result<SpaceHandle, UserError> {
    space::resolve(&k.spaces, id)
        .ok_or(UserError::code(ResponseCode::NotExistent))
}

fn resolve_thread(k: &Kernel, id: ThreadId) -> Result<ThreadHandle, UserError> {
    thread::resolve(&k.threads, id)
        .ok_or(UserError::code(ResponseCode::NotExistent))
}

fn map(k: &mut Kernel, caller: ThreadHandle) -> Result<NextThread, UserError> {
    let args = k.threads[caller].save().as_map_args();
    let fpage = args.fpage.validate(PAGE_SHIFT)?;
    let window = args.window.validate(PAGE_SHIFT)?;
    let from = resolve_space(k, args.from)?;
    let to = resolve_space(k, args.to)?;
    check_manages(k, caller, from)?;
    check_manages(k, caller, to)?;

    let got = space::map_fpage(
        &mut k.spaces,
        &mut k.mapdb,
        from,
        fpage,
        args.hot_spot,
        to,
        window,
    )
    .map_err(|e| {
        UserError::code(match e {
            MapDbError::NoMemory => ResponseCode::NoMemory,
            _ => ResponseCode::MapFailed,
        })
    })?;
    k.threads[caller]
        .save_mut()
        .set_response_and_value(ResponseCode::Ok, got.0);
    Ok(NextThread::Same)
}

fn unmap(k: &mut Kernel, caller: ThreadHandle) -> Result<NextThread, UserError> {
    let args = k.threads[caller].save().as_unmap_args();
    let flags = args.flags?;
    let fpage = args.fpage.validate(PAGE_SHIFT)?;
    let space = resolve_space(k, args.space)?;
    check_manages(k, caller, space)?;

    let n = space::unmap_fpage(&mut k.spaces, &mut k.mapdb, space, fpage, flags);
    k.threads[caller]
        .save_mut()
        .set_response_and_value(ResponseCode::Ok, n as u32);
    Ok(NextThread::Same)
}

fn create_thread(
    k: &mut Kernel,
    caller: ThreadHandle,
) -> Result<NextThread, UserError> {
    let args = k.threads[caller].save().as_create_thread_args();
    let priority = args.priority?;
    let space = resolve_space(k, args.space)?;
    check_manages(k, caller, space)?;
    let me = &k.threads[caller];
    if !priority.is_within(me.mcp()) {
        return Err(UserError::code(ResponseCode::NoPermission));
    }
    if args.stack & 0x3 != 0 {
        return Err(UserError::code(ResponseCode::Invalid));
    }
    let mine = me.priority();

    let h = k
        .create_thread(space, priority, priority, args.entry, args.stack)
        .map_err(UserError::code)?;
    let id = k.threads[h].id();
    k.threads[caller]
        .save_mut()
        .set_response_and_value(ResponseCode::Ok, id.0);
    Ok(if priority.is_more_important_than(mine) {
        NextThread::Other
    } else {
        NextThread::Same
    })
}

fn destroy_thread(
    k: &mut Kernel,
    caller: ThreadHandle,
) -> Result<NextThread, UserError> {
    let target = resolve_thread(k, k.threads[caller].save().as_thread_args().thread)?;
    check_manages(k, caller, k.threads[target].space())?;

    k.threads[caller].save_mut().set_response(ResponseCode::Ok);
    Ok(k.destroy_thread(target))
}

fn set_priority(
    k: &mut Kernel,
    caller: ThreadHandle,
) -> Result<NextThread, UserError> {
    let args = k.threads[caller].save().as_set_priority_args();
    let priority = args.priority?;
    let target = resolve_thread(k, args.thread)?;
    check_manages(k, caller, k.threads[target].space())?;
    let mcp = k.threads[caller].mcp();
    // Neither the new priority nor the one being replaced may exceed what
    // the caller controls.
    if !priority.is_within(mcp) || !k.threads[target].priority().is_within(mcp)
    {
        return Err(UserError::code(ResponseCode::NoPermission));
    }

    let old = k.set_priority(target, priority);
    k.threads[caller]
        .save_mut()
        .set_response_and_value(ResponseCode::Ok, u32::from(old.0));
    Ok(if old == priority {
        NextThread::Same
    } else {
        NextThread::Other
    })
}

fn yield_cpu(k: &mut Kernel, caller: ThreadHandle) -> NextThread {
    k.threads[caller].save_mut().set_response(ResponseCode::Ok);
    k.sched.rotate(&mut k.threads, caller);
    NextThread::Other
}

/// Gives the rest of the caller's turn to another thread, or to whoever is
/// next if that thread can't run.
fn thread_switch(k: &mut Kernel, caller: ThreadHandle) -> NextThread {
    let dest = thread::resolve(
        &k.threads,
        k.threads[caller].save().as_thread_args().thread,
    )
    .filter(|&d| d != caller && k.threads[d].is_ready());
    let hint = yield_cpu(k, caller);
    match dest {
        Some(d) => {
            k.sched.promote(&mut k.threads, d);
            NextThread::Specific(d)
        }
        None => hint,
    }
}

fn create_space(
    k: &mut Kernel,
    caller: ThreadHandle,
) -> Result<NextThread, UserError> {
    let chief = k.threads[caller].space();
    let h = k.create_space(chief).map_err(UserError::code)?;
    let id = k.spaces[h].id();
    k.threads[caller]
        .save_mut()
        .set_response_and_value(ResponseCode::Ok, u32::from(id.0));
    Ok(NextThread::Same)
}

fn destroy_space(
    k: &mut Kernel,
    caller: ThreadHandle,
) -> Result<NextThread, UserError> {
    let space = resolve_space(k, k.threads[caller].save().as_space_args().space)?;
    if space == k.root_space {
        return Err(UserError::code(ResponseCode::Invalid));
    }
    check_manages(k, caller, space)?;

    k.threads[caller].save_mut().set_response(ResponseCode::Ok);
    Ok(k.destroy_space(space))
}

fn cancel(k: &mut Kernel, caller: ThreadHandle) -> Result<NextThread, UserError> {
    let target = resolve_thread(k, k.threads[caller].save().as_thread_args().thread)?;
    check_manages(k, caller, k.threads[target].space())?;

    k.threads[caller].save_mut().set_response(ResponseCode::Ok);
    Ok(k.cancel(target))
}

fn thread_info(
    k: &mut Kernel,
    caller: ThreadHandle,
) -> Result<NextThread, UserError> {
    let target = resolve_thread(k, k.threads[caller].save().as_thread_args().thread)?;
    let t = &k.threads[target];
    let (state, priority) = (t.state(), t.priority());
    let partner = t
        .partner()
        .and_then(|p| k.threads.get(p))
        .map_or(ThreadId::NIL, |p| p.id());
    k.threads[caller]
        .save_mut()
        .set_thread_info(state, priority, partner);
    Ok(NextThread::Same)
}
