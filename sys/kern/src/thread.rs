// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of threads.

use abi::{
    FaultInfo, Fpage, Generation, MsgDope, Priority, RecvFlags, ResponseCode,
    SendFlags, SpaceId, ThreadId, ThreadState, Timeout, UnmapFlags,
    UsageError, MESSAGE_WORDS, NIL_DESCRIPTOR,
};
use kerncore::{Adapter, Arena, Handle, Links, List};

use crate::arch::SavedState;
use crate::fail;
use crate::space::SpaceHandle;
use crate::startup::{DEFAULT_QUANTUM, MAX_THREADS};
use crate::time::Timestamp;
use crate::umem::USlice;

pub type ThreadHandle = Handle<Thread>;
pub type ThreadTable = Arena<Thread, MAX_THREADS>;

/// Internal representation of a thread.
///
/// The fields of this struct are private to this module so that we can
/// maintain some thread invariants. These mostly have to do with ensuring that
/// the `state` bits and the queue links agree.
#[derive(Debug)]
pub struct Thread {
    /// Saved machine state of the user program.
    save: SavedState,
    id: ThreadId,
    space: SpaceHandle,
    priority: Priority,
    /// Maximum controlled priority: the highest priority this thread may hand
    /// out to threads it creates or adjusts.
    mcp: Priority,
    ticks_left: u32,
    state: ThreadState,
    /// The thread this one is waiting on or queued with, if any.
    partner: Option<ThreadHandle>,
    /// When the current wait gives up, if ever.
    deadline: Option<Timestamp>,
    fault: Option<FaultInfo>,
    ready_link: Links<Thread>,
    send_link: Links<Thread>,
    /// Threads blocked sending to this one, most important first.
    senders: List<Thread, SendLinks>,
}

impl Thread {
    pub fn new(
        id: ThreadId,
        space: SpaceHandle,
        priority: Priority,
        mcp: Priority,
    ) -> Self {
        Self {
            save: SavedState::default(),
            id,
            space,
            priority,
            mcp,
            ticks_left: DEFAULT_QUANTUM,
            state: ThreadState::READY,
            partner: None,
            deadline: None,
            fault: None,
            ready_link: Links::new(),
            send_link: Links::new(),
            senders: List::new(),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: ThreadId) {
        self.id = id;
    }

    pub fn space(&self) -> SpaceHandle {
        self.space
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, p: Priority) {
        self.priority = p;
    }

    pub fn mcp(&self) -> Priority {
        self.mcp
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) fn set_state(&mut self, s: ThreadState) {
        self.state = s;
    }

    pub fn is_ready(&self) -> bool {
        self.state.contains(ThreadState::READY)
    }

    pub fn is_blocked(&self) -> bool {
        self.state.intersects(ThreadState::BLOCKED)
    }

    pub fn partner(&self) -> Option<ThreadHandle> {
        self.partner
    }

    pub(crate) fn set_partner(&mut self, p: Option<ThreadHandle>) {
        self.partner = p;
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub(crate) fn set_deadline(&mut self, d: Option<Timestamp>) {
        self.deadline = d;
    }

    pub fn fault(&self) -> Option<FaultInfo> {
        self.fault
    }

    pub fn save(&self) -> &SavedState {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut SavedState {
        &mut self.save
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Burns one tick of quantum. Returns `true` when the quantum ran out,
    /// in which case it has already been refilled.
    pub(crate) fn charge_tick(&mut self) -> bool {
        self.ticks_left = self.ticks_left.saturating_sub(1);
        if self.ticks_left == 0 {
            self.ticks_left = DEFAULT_QUANTUM;
            true
        } else {
            false
        }
    }

    pub fn has_quantum(&self) -> bool {
        self.ticks_left > 0
    }

    /// Records a fault and takes the thread out of the running. The caller
    /// is responsible for unlinking it from any queue first.
    pub(crate) fn record_fault(&mut self, f: FaultInfo) {
        self.fault = Some(f);
        self.state = ThreadState::FAULTED;
        self.partner = None;
        self.deadline = None;
    }
}

/// List adapter for the scheduler's per-priority ready queues.
pub struct ReadyLinks;

impl Adapter<Thread> for ReadyLinks {
    fn links(t: &Thread) -> &Links<Thread> {
        &t.ready_link
    }

    fn links_mut(t: &mut Thread) -> &mut Links<Thread> {
        &mut t.ready_link
    }
}

/// List adapter for a receiver's queue of blocked senders.
pub struct SendLinks;

impl Adapter<Thread> for SendLinks {
    fn links(t: &Thread) -> &Links<Thread> {
        &t.send_link
    }

    fn links_mut(t: &mut Thread) -> &mut Links<Thread> {
        &mut t.send_link
    }
}

/// Queues `sender` on `receiver`: behind every sender of equal or greater
/// priority, ahead of any less important one.
pub fn enqueue_sender(
    threads: &mut ThreadTable,
    receiver: ThreadHandle,
    sender: ThreadHandle,
) {
    let prio = threads[sender].priority;
    let mut q = threads[receiver].senders;
    let anchor = q
        .iter(threads)
        .find(|&h| prio.is_more_important_than(threads[h].priority));
    let queued = match anchor {
        Some(a) => q.insert_before(threads, a, sender),
        None => q.push_back(threads, sender),
    };
    if !queued {
        fail::die("thread queued as a sender twice");
    }
    threads[receiver].senders = q;
}

/// Takes `sender` off `receiver`'s queue. Returns `false` if it wasn't on it.
pub fn dequeue_sender(
    threads: &mut ThreadTable,
    receiver: ThreadHandle,
    sender: ThreadHandle,
) -> bool {
    let mut q = threads[receiver].senders;
    let removed = q.remove(threads, sender);
    threads[receiver].senders = q;
    removed
}

/// Senders queued on `receiver`, in the order they will be served.
pub fn senders(
    threads: &ThreadTable,
    receiver: ThreadHandle,
) -> impl Iterator<Item = ThreadHandle> + '_ {
    threads[receiver].senders.iter(threads)
}

/// The externally visible name for the thread in slot `h` of `space`.
pub fn id_for(space: SpaceId, h: ThreadHandle) -> ThreadId {
    let gen = (u32::from(h.generation()) & ThreadId::GENERATION_MASK) as u8;
    ThreadId::new(space, h.index(), Generation::from(gen))
}

/// Turns an externally supplied ID back into a handle, if it still names a
/// live thread.
pub fn resolve(threads: &ThreadTable, id: ThreadId) -> Option<ThreadHandle> {
    if id.is_nil() {
        return None;
    }
    let h = threads.handle_at(id.index())?;
    (threads[h].id == id).then_some(h)
}

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to thread state for the rest of the
/// kernel.
///
/// Architectures need to implement the `argX` and `retX` functions plus the
/// entry point accessors, and the rest of the trait (such as the argument
/// proxy types) will just work.
pub trait ArchState: Default {
    fn stack_pointer(&self) -> u32;
    fn program_counter(&self) -> u32;

    /// Resets the register file so the thread starts at `pc` with stack `sp`.
    fn set_entry_point(&mut self, pc: u32, sp: u32);

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> u32;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> u32;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> u32;
    /// Reads syscall argument register 4.
    fn arg4(&self) -> u32;
    /// Reads syscall argument register 5.
    fn arg5(&self) -> u32;
    /// Reads syscall argument register 6.
    fn arg6(&self) -> u32;
    /// Reads syscall argument register 7.
    fn arg7(&self) -> u32;
    /// Reads syscall argument register 8.
    fn arg8(&self) -> u32;
    /// Reads syscall argument register 9.
    fn arg9(&self) -> u32;
    /// Reads syscall argument register 10.
    fn arg10(&self) -> u32;
    /// Reads syscall argument register 11.
    fn arg11(&self) -> u32;

    /// Writes syscall return argument 0.
    fn ret0(&mut self, _: u32);
    /// Writes syscall return argument 1.
    fn ret1(&mut self, _: u32);
    /// Writes syscall return argument 2.
    fn ret2(&mut self, _: u32);
    /// Writes syscall return argument 3.
    fn ret3(&mut self, _: u32);
    /// Writes syscall return argument 4.
    fn ret4(&mut self, _: u32);
    /// Writes syscall return argument 5.
    fn ret5(&mut self, _: u32);

    /// Interprets arguments as for the IPC syscall and returns the results.
    ///
    /// This is inlined because it's called from several places, and most of
    /// those places only use _part_ of its result -- so inlining it lets most
    /// of its code be eliminated and makes text smaller.
    #[inline(always)]
    fn as_ipc_args(&self) -> IpcArgs {
        IpcArgs {
            dest: ThreadId(self.arg0()),
            send: match self.arg1() {
                NIL_DESCRIPTOR => Ok(None),
                d => SendFlags::from_bits(d)
                    .map(Some)
                    .ok_or(UsageError::InvalidDescriptor),
            },
            recv: match self.arg2() {
                NIL_DESCRIPTOR => Ok(None),
                d => RecvFlags::from_bits(d)
                    .map(Some)
                    .ok_or(UsageError::InvalidDescriptor),
            },
            timeout: Timeout(self.arg3()),
            words: [self.arg4(), self.arg5(), self.arg6()],
            window: Fpage(self.arg7()),
            send_string: USlice::from_raw(self.arg8(), self.arg9()),
            recv_string: USlice::from_raw(self.arg10(), self.arg11()),
        }
    }

    /// Interprets arguments as for the MAP syscall and returns the results.
    fn as_map_args(&self) -> MapArgs {
        MapArgs {
            from: SpaceId(self.arg0() as u16),
            fpage: Fpage(self.arg1()),
            to: SpaceId(self.arg2() as u16),
            window: Fpage(self.arg3()),
            hot_spot: self.arg4(),
        }
    }

    /// Interprets arguments as for the UNMAP syscall and returns the results.
    fn as_unmap_args(&self) -> UnmapArgs {
        UnmapArgs {
            space: SpaceId(self.arg0() as u16),
            fpage: Fpage(self.arg1()),
            flags: UnmapFlags::from_bits(self.arg2())
                .ok_or(UsageError::InvalidDescriptor),
        }
    }

    /// Interprets arguments as for the `CREATE_THREAD` syscall and returns
    /// the results.
    fn as_create_thread_args(&self) -> CreateThreadArgs {
        CreateThreadArgs {
            space: SpaceId(self.arg0() as u16),
            priority: Priority::try_from(self.arg1()),
            entry: self.arg2(),
            stack: self.arg3(),
        }
    }

    /// Interprets arguments for syscalls that name a single thread.
    fn as_thread_args(&self) -> ThreadArgs {
        ThreadArgs {
            thread: ThreadId(self.arg0()),
        }
    }

    /// Interprets arguments as for the `SET_PRIORITY` syscall and returns the
    /// results.
    fn as_set_priority_args(&self) -> SetPriorityArgs {
        SetPriorityArgs {
            thread: ThreadId(self.arg0()),
            priority: Priority::try_from(self.arg1()),
        }
    }

    /// Interprets arguments for syscalls that name a single space.
    fn as_space_args(&self) -> SpaceArgs {
        SpaceArgs {
            space: SpaceId(self.arg0() as u16),
        }
    }

    /// Sets the status of a non-IPC syscall.
    fn set_response(&mut self, code: ResponseCode) {
        self.ret0(code.into());
    }

    /// Sets the status of a non-IPC syscall, plus one result value.
    fn set_response_and_value(&mut self, code: ResponseCode, value: u32) {
        self.ret0(code.into());
        self.ret1(value);
    }

    /// Sets the results of an IPC.
    fn set_ipc_result(
        &mut self,
        dope: MsgDope,
        source: ThreadId,
        words: &[u32; MESSAGE_WORDS],
        string_len: usize,
    ) {
        self.ret0(dope.0);
        self.ret1(source.0);
        self.ret2(words[0]);
        self.ret3(words[1]);
        self.ret4(words[2]);
        self.ret5(string_len as u32);
    }

    /// Sets the results of an IPC that failed, or that had no receive phase.
    fn set_ipc_status(&mut self, dope: MsgDope) {
        self.set_ipc_result(dope, ThreadId::NIL, &[0; MESSAGE_WORDS], 0);
    }

    /// Sets the results of `THREAD_INFO`.
    fn set_thread_info(
        &mut self,
        state: ThreadState,
        priority: Priority,
        partner: ThreadId,
    ) {
        self.ret0(ResponseCode::Ok.into());
        self.ret1(state.bits());
        self.ret2(u32::from(priority.0));
        self.ret3(partner.0);
    }
}

/// Decoded arguments for the IPC syscall.
#[derive(Clone, Debug)]
pub struct IpcArgs {
    pub dest: ThreadId,
    /// `None` means there is no send phase.
    pub send: Result<Option<SendFlags>, UsageError>,
    /// `None` means there is no receive phase.
    pub recv: Result<Option<RecvFlags>, UsageError>,
    pub timeout: Timeout,
    pub words: [u32; MESSAGE_WORDS],
    pub window: Fpage,
    pub send_string: Result<USlice, UsageError>,
    pub recv_string: Result<USlice, UsageError>,
}

impl IpcArgs {
    /// In a map message, the first word is the hot spot...
    pub fn hot_spot(&self) -> u32 {
        self.words[0]
    }

    /// ...and the second is the flexpage being sent.
    pub fn send_fpage(&self) -> Fpage {
        Fpage(self.words[1])
    }
}

/// Decoded arguments for the MAP syscall.
#[derive(Clone, Debug)]
pub struct MapArgs {
    pub from: SpaceId,
    pub fpage: Fpage,
    pub to: SpaceId,
    pub window: Fpage,
    pub hot_spot: u32,
}

/// Decoded arguments for the UNMAP syscall.
#[derive(Clone, Debug)]
pub struct UnmapArgs {
    pub space: SpaceId,
    pub fpage: Fpage,
    pub flags: Result<UnmapFlags, UsageError>,
}

/// Decoded arguments for the `CREATE_THREAD` syscall.
#[derive(Clone, Debug)]
pub struct CreateThreadArgs {
    pub space: SpaceId,
    pub priority: Result<Priority, UsageError>,
    pub entry: u32,
    pub stack: u32,
}

#[derive(Clone, Debug)]
pub struct ThreadArgs {
    pub thread: ThreadId,
}

#[derive(Clone, Debug)]
pub struct SetPriorityArgs {
    pub thread: ThreadId,
    pub priority: Result<Priority, UsageError>,
}

#[derive(Clone, Debug)]
pub struct SpaceArgs {
    pub space: SpaceId,
}

/// Return value for operations that can have scheduling implications. This is
/// marked `must_use` because forgetting to actually update the scheduler after
/// performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextThread {
    /// It's fine to keep running whatever thread we were just running.
    Same,
    /// We need to switch threads, but this routine has not concluded which
    /// one should now run. The scheduler needs to figure it out.
    Other,
    /// We need to switch threads, and we already know which one should run
    /// next. This is an optimization available in certain IPC cases.
    Specific(ThreadHandle),
}

impl NextThread {
    pub fn combine(self, other: Self) -> Self {
        use NextThread::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific thread recommendations that *don't* agree get
            // downgraded to Other.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            // All we have left is...
            (Same, Same) => Same,
        }
    }
}
