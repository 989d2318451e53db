// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler.
//!
//! Ready threads sit on one FIFO queue per priority level. A 256-bit bitmap
//! records which levels are non-empty, so finding the most important ready
//! thread is a leading-zeros scan over eight words.
//!
//! The running thread stays on its queue. Rotating it to the back of its level
//! is what gives equal-priority threads their turn.

use abi::Priority;
use kerncore::List;

use crate::fail;
use crate::thread::{NextThread, ReadyLinks, Thread, ThreadHandle, ThreadTable};

const WORDS: usize = Priority::LEVELS / 32;

pub struct Scheduler {
    levels: [List<Thread, ReadyLinks>; Priority::LEVELS],
    /// Bit `p % 32` of word `p / 32` is set when level `p` is non-empty.
    occupied: [u32; WORDS],
    current: Option<ThreadHandle>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            levels: [List::new(); Priority::LEVELS],
            occupied: [0; WORDS],
            current: None,
        }
    }

    pub fn current(&self) -> Option<ThreadHandle> {
        self.current
    }

    /// Records that `h` is on the CPU, as when it traps into the kernel.
    pub fn set_current(&mut self, h: ThreadHandle) {
        self.current = Some(h);
    }

    fn mark(&mut self, level: usize) {
        let (w, b) = (level / 32, level % 32);
        if self.levels[level].is_empty() {
            self.occupied[w] &= !(1 << b);
        } else {
            self.occupied[w] |= 1 << b;
        }
    }

    /// Adds `h` at the tail of its level. Does nothing if it is already
    /// queued.
    pub fn enqueue(&mut self, threads: &mut ThreadTable, h: ThreadHandle) {
        let level = usize::from(threads[h].priority().0);
        let mut q = self.levels[level];
        if q.push_back(threads, h) {
            self.levels[level] = q;
            self.mark(level);
        }
    }

    /// Takes `h` off the ready queues, if it was on one.
    pub fn dequeue(&mut self, threads: &mut ThreadTable, h: ThreadHandle) {
        let level = usize::from(threads[h].priority().0);
        let mut q = self.levels[level];
        if q.remove(threads, h) {
            self.levels[level] = q;
            self.mark(level);
        }
    }

    /// Moves `h` to the tail of its level, giving its peers a turn.
    pub fn rotate(&mut self, threads: &mut ThreadTable, h: ThreadHandle) {
        let level = usize::from(threads[h].priority().0);
        let mut q = self.levels[level];
        q.rotate_to_back(threads, h);
        self.levels[level] = q;
    }

    /// Moves `h` to the head of its level, so it runs next among its peers.
    pub fn promote(&mut self, threads: &mut ThreadTable, h: ThreadHandle) {
        let level = usize::from(threads[h].priority().0);
        let mut q = self.levels[level];
        if q.remove(threads, h) {
            q.push_front(threads, h);
            self.levels[level] = q;
        }
    }

    /// The most important non-empty priority level.
    pub fn highest(&self) -> Option<Priority> {
        for (i, &w) in self.occupied.iter().enumerate().rev() {
            if w != 0 {
                let bit = 31 - w.leading_zeros() as usize;
                return Some(Priority((i * 32 + bit) as u8));
            }
        }
        None
    }

    /// Whether `h` is on a ready queue.
    pub fn is_queued(&self, threads: &ThreadTable, h: ThreadHandle) -> bool {
        let level = usize::from(threads[h].priority().0);
        self.levels[level].iter(threads).any(|x| x == h)
    }

    /// Picks the thread to run next and makes it current. Returns `None`
    /// when nothing is ready, in which case the CPU idles.
    pub fn reschedule(
        &mut self,
        threads: &ThreadTable,
        hint: NextThread,
    ) -> Option<ThreadHandle> {
        let top = self.highest();
        let current = self
            .current
            .filter(|&c| threads.get(c).is_some_and(Thread::is_ready));

        let next = match hint {
            NextThread::Same if current.is_some() => current,
            NextThread::Specific(h)
                if threads.get(h).is_some_and(|t| {
                    t.is_ready()
                        && top.is_some_and(|p| {
                            !p.is_more_important_than(t.priority())
                        })
                }) =>
            {
                Some(h)
            }
            // The running thread keeps its place at the head of its level
            // until it blocks, yields or runs out of quantum, so the head of
            // the top level is always the right choice here.
            _ => top.and_then(|p| self.levels[usize::from(p.0)].front()),
        };

        if let Some(n) = next {
            if !threads[n].is_ready() {
                fail::die("scheduler picked a thread that isn't ready");
            }
        }
        self.current = next;
        next
    }
}
