// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel object: every table, plus the operations that have to keep
//! several of them consistent.
//!
//! Operations here trust their arguments. Permission checks and argument
//! decoding belong to `syscalls`.

use abi::{FaultInfo, Priority, Rights, SpaceId, ThreadId, ThreadState};

use crate::arch::{self, PhysMemory, SavedState};
use crate::fail::OrDie;
use crate::ipc;
use crate::mapdb::{MapDb, Violation};
use crate::sched::Scheduler;
use crate::space::{self, AddressSpaceOps, Space, SpaceHandle, SpaceTable, Translation};
use crate::startup::{
    MAX_SPACES, PAGE_SHIFT, PHYS_FRAMES, ROOT_ENTRY, ROOT_PRIORITY, ROOT_STACK,
    SIGMA0_SUPERPAGES, SUPERPAGE_SHIFT,
};
use crate::syscalls;
use crate::thread::{self, ArchState, NextThread, Thread, ThreadHandle, ThreadTable};
use crate::time::Timestamp;
use crate::umem;

pub struct Kernel {
    pub(crate) threads: ThreadTable,
    pub(crate) spaces: SpaceTable,
    pub(crate) mapdb: MapDb,
    pub(crate) sched: Scheduler,
    pub(crate) phys: PhysMemory,
    pub(crate) now: Timestamp,
    pub(crate) root_space: SpaceHandle,
    root_thread: ThreadId,
}

impl Kernel {
    /// Boots a kernel: sigma0 gets an identity mapping of all physical
    /// memory, and the root thread is created in it, ready to run.
    pub fn new() -> Self {
        let mut spaces = SpaceTable::new();
        let root_space = spaces
            .insert(Space::new(SpaceId(0), None))
            .or_die("no room for sigma0");
        spaces[root_space].set_id(space::id_for(root_space));

        let size_log2 = if SIGMA0_SUPERPAGES {
            SUPERPAGE_SHIFT
        } else {
            PAGE_SHIFT
        };
        let phys_end = (PHYS_FRAMES as u64) << PAGE_SHIFT;
        let pt = spaces[root_space].page_table_mut();
        let mut base = 0u64;
        while base < phys_end {
            pt.map(base as u32, base as u32, size_log2, Rights::RWX)
                .or_die("sigma0 identity map");
            base += 1 << size_log2;
        }

        let mut k = Self {
            threads: ThreadTable::new(),
            spaces,
            mapdb: MapDb::new(),
            sched: Scheduler::new(),
            phys: PhysMemory::new(),
            now: Timestamp::ZERO,
            root_space,
            root_thread: ThreadId::NIL,
        };
        let root = k
            .create_thread(
                root_space,
                ROOT_PRIORITY,
                Priority::MAX,
                ROOT_ENTRY,
                ROOT_STACK,
            )
            .or_die("no room for the root thread");
        k.root_thread = k.threads[root].id();
        let first = k.sched.reschedule(&k.threads, NextThread::Other);
        log::info!(
            "kernel up: {} bytes of sigma0 memory, root thread {:?}",
            phys_end,
            first.map(|h| k.threads[h].id())
        );
        k
    }

    pub fn root_space(&self) -> SpaceId {
        self.spaces[self.root_space].id()
    }

    /// The thread created at boot. It may since have been destroyed.
    pub fn root_thread(&self) -> ThreadId {
        self.root_thread
    }

    /// The thread on the CPU, if any.
    pub fn current(&self) -> Option<ThreadId> {
        self.sched
            .current()
            .and_then(|h| self.threads.get(h))
            .map(Thread::id)
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Handles syscall `nr` made by `caller`, whose arguments are already in
    /// its saved registers. Returns the thread to run next.
    pub fn syscall_entry(&mut self, nr: u32, caller: ThreadId) -> Option<ThreadId> {
        let h = thread::resolve(&self.threads, caller)
            .filter(|&h| self.threads[h].is_ready())
            .or_die("syscall from a thread that can't be running");
        self.sched.set_current(h);
        let hint = syscalls::safe_syscall_entry(self, nr, h);
        self.switch(hint)
    }

    /// Advances time by one tick: expired IPC timeouts fire, and the running
    /// thread is charged a tick of its quantum. Returns the thread to run
    /// next.
    pub fn tick(&mut self) -> Option<ThreadId> {
        self.now = self.now.after(1);
        let mut hint = ipc::expire_timeouts(self);
        let running = self
            .sched
            .current()
            .filter(|&c| self.threads.get(c).is_some_and(Thread::is_ready));
        if let Some(c) = running {
            if self.threads[c].charge_tick() {
                self.sched.rotate(&mut self.threads, c);
                hint = hint.combine(NextThread::Other);
            }
        }
        self.switch(hint)
    }

    fn switch(&mut self, hint: NextThread) -> Option<ThreadId> {
        let next = self.sched.reschedule(&self.threads, hint)?;
        let id = self.threads[next].id();
        arch::switch_to(id);
        Some(id)
    }

    /// Stops `h` with fault `f`. It leaves every queue and never runs again
    /// until it is destroyed.
    pub(crate) fn force_fault(&mut self, h: ThreadHandle, f: FaultInfo) -> NextThread {
        log::warn!("thread {:?} faulted: {f:?}", self.threads[h].id());
        let t = &self.threads[h];
        let queued_on = t
            .state()
            .contains(ThreadState::POLLING)
            .then(|| t.partner())
            .flatten();
        if let Some(p) = queued_on {
            thread::dequeue_sender(&mut self.threads, p, h);
        }
        self.sched.dequeue(&mut self.threads, h);
        self.threads[h].record_fault(f);
        NextThread::Other
    }

    pub(crate) fn create_thread(
        &mut self,
        space: SpaceHandle,
        priority: Priority,
        mcp: Priority,
        entry: u32,
        stack: u32,
    ) -> Result<ThreadHandle, abi::ResponseCode> {
        let h = self
            .threads
            .insert(Thread::new(ThreadId::NIL, space, priority, mcp))
            .map_err(|_| abi::ResponseCode::NoMemory)?;
        let t = &mut self.threads[h];
        t.set_id(thread::id_for(self.spaces[space].id(), h));
        t.save_mut().set_entry_point(entry, stack);
        self.spaces[space].add_thread();
        self.sched.enqueue(&mut self.threads, h);
        log::debug!(
            "created thread {:?} at priority {}",
            self.threads[h].id(),
            priority.0
        );
        Ok(h)
    }

    pub(crate) fn destroy_thread(&mut self, h: ThreadHandle) -> NextThread {
        let hint = ipc::partner_gone(self, h);
        self.sched.dequeue(&mut self.threads, h);
        let space = self.threads[h].space();
        self.spaces[space].remove_thread();
        let id = self.threads[h].id();
        self.threads.remove(h);
        log::debug!("destroyed thread {id:?}");
        hint.combine(NextThread::Other)
    }

    /// Changes `h`'s priority, keeping whatever queue it is on in order.
    /// Returns the old priority.
    pub(crate) fn set_priority(&mut self, h: ThreadHandle, p: Priority) -> Priority {
        let old = self.threads[h].priority();
        let queued_on = self.threads[h]
            .state()
            .contains(ThreadState::POLLING)
            .then(|| self.threads[h].partner())
            .flatten();
        let ready = self.sched.is_queued(&self.threads, h);

        if ready {
            self.sched.dequeue(&mut self.threads, h);
        }
        if let Some(r) = queued_on {
            thread::dequeue_sender(&mut self.threads, r, h);
        }
        self.threads[h].set_priority(p);
        if ready {
            self.sched.enqueue(&mut self.threads, h);
        }
        if let Some(r) = queued_on {
            thread::enqueue_sender(&mut self.threads, r, h);
        }
        old
    }

    pub(crate) fn cancel(&mut self, h: ThreadHandle) -> NextThread {
        ipc::cancel(self, h)
    }

    pub(crate) fn create_space(
        &mut self,
        chief: SpaceHandle,
    ) -> Result<SpaceHandle, abi::ResponseCode> {
        let h = self
            .spaces
            .insert(Space::new(SpaceId(0), Some(chief)))
            .map_err(|_| abi::ResponseCode::NoMemory)?;
        self.spaces[h].set_id(space::id_for(h));
        log::debug!("created space {:?}", self.spaces[h].id());
        Ok(h)
    }

    /// Destroys `h`, the spaces it is chief of, and all their threads. Every
    /// mapping they held is flushed, along with everything derived from it.
    pub(crate) fn destroy_space(&mut self, h: SpaceHandle) -> NextThread {
        let mut hint = NextThread::Same;
        while let Some(sub) = self.first_subspace(h) {
            hint = hint.combine(self.destroy_space(sub));
        }
        while let Some(t) = self.first_thread_in(h) {
            hint = hint.combine(self.destroy_thread(t));
        }
        self.mapdb.flush(&mut self.spaces, h);
        let id = self.spaces[h].id();
        if let Some(s) = self.spaces.remove(h) {
            if !s.page_table().is_empty() {
                log::debug!(
                    "space {id:?} dropped {} untracked mapping(s)",
                    s.page_table().len()
                );
            }
        }
        log::debug!("destroyed space {id:?}");
        hint
    }

    fn first_subspace(&self, chief: SpaceHandle) -> Option<SpaceHandle> {
        (0..MAX_SPACES)
            .filter_map(|i| self.spaces.handle_at(i))
            .find(|&s| s != chief && self.spaces[s].chief() == Some(chief))
    }

    fn first_thread_in(&self, space: SpaceHandle) -> Option<ThreadHandle> {
        self.threads
            .iter()
            .find(|(_, t)| t.space() == space)
            .map(|(h, _)| h)
    }

    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.thread(id).map(Thread::state)
    }

    pub fn thread_priority(&self, id: ThreadId) -> Option<Priority> {
        self.thread(id).map(Thread::priority)
    }

    /// The fault that stopped `id`, if it has one.
    pub fn thread_fault(&self, id: ThreadId) -> Option<FaultInfo> {
        self.thread(id).and_then(Thread::fault)
    }

    pub fn saved_state(&self, id: ThreadId) -> Option<&SavedState> {
        self.thread(id).map(Thread::save)
    }

    pub fn saved_state_mut(&mut self, id: ThreadId) -> Option<&mut SavedState> {
        let h = thread::resolve(&self.threads, id)?;
        Some(self.threads[h].save_mut())
    }

    fn thread(&self, id: ThreadId) -> Option<&Thread> {
        thread::resolve(&self.threads, id).map(|h| &self.threads[h])
    }

    pub fn space_exists(&self, id: SpaceId) -> bool {
        space::resolve(&self.spaces, id).is_some()
    }

    /// Looks `virt` up in `space`'s page table.
    pub fn translate(&self, space: SpaceId, virt: u32) -> Option<Translation> {
        let h = space::resolve(&self.spaces, space)?;
        self.spaces[h].page_table().lookup(virt)
    }

    pub fn mapdb(&self) -> &MapDb {
        &self.mapdb
    }

    /// Checks the mapping database's structural invariants.
    pub fn check(&self) -> Result<(), Violation> {
        self.mapdb.check()
    }

    /// Reads memory as a program in `space` would see it.
    pub fn read_user(
        &self,
        space: SpaceId,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), FaultInfo> {
        let h = space::resolve(&self.spaces, space).ok_or(no_space(addr))?;
        umem::copy_from_user(&self.spaces[h], &self.phys, addr, buf)
    }

    /// Writes memory as a program in `space` would.
    pub fn write_user(
        &mut self,
        space: SpaceId,
        addr: u32,
        data: &[u8],
    ) -> Result<(), FaultInfo> {
        let h = space::resolve(&self.spaces, space).ok_or(no_space(addr))?;
        umem::copy_to_user(&self.spaces[h], &mut self.phys, addr, data)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

fn no_space(addr: u32) -> FaultInfo {
    FaultInfo::MemoryAccess {
        address: Some(addr),
        source: abi::FaultSource::Kernel,
    }
}
