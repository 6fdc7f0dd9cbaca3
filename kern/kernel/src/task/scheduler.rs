//! Round-robin scheduler state: the ready queue, the time-ordered sleep
//! queue and the running slot.
//!
//! The sleep queue is a delta list. Each entry stores the ticks remaining
//! *after* every entry before it, so the queue's cumulative sums are the
//! absolute wake times and only the head entry needs decrementing per
//! tick. Sleep records charge the block allocator for their backing
//! blocks and are released exactly once, when they fire or when they are
//! explicitly cancelled, never both.

use alloc::collections::VecDeque;

use log::{debug, trace};

use crate::config::DEFAULT_TIME_SLICE;
use crate::mm::block::{blocks_for, BlockAllocator, BlockPtr};
use crate::sync::semaphore::SemId;
use crate::task::{thread_mut, ThreadId, ThreadTable};

/// A thread waiting for elapsed time, optionally also blocked on a
/// semaphore (a timed wait).
#[derive(Debug)]
pub(crate) struct SleepEntry {
    pub(crate) thread: ThreadId,
    pub(crate) semaphore: Option<SemId>,
    pub(crate) delta: u64,
    pub(crate) record: BlockPtr,
}

pub(crate) struct Scheduler {
    ready: VecDeque<ThreadId>,
    sleeping: VecDeque<SleepEntry>,
    current: ThreadId,
    idle: ThreadId,
    user_threads: u64,
    #[allow(dead_code)]
    record: BlockPtr,
}

impl Scheduler {
    /// `record` is the run of blocks backing this state: the scheduler
    /// lives in the heap it schedules over.
    pub(crate) fn new(idle: ThreadId, record: BlockPtr) -> Self {
        Self {
            ready: VecDeque::new(),
            sleeping: VecDeque::new(),
            current: idle,
            idle,
            user_threads: 0,
            record,
        }
    }

    /// Admits `thread` to the ready queue's tail with a fresh time slice.
    /// FIFO admission is what makes the policy round-robin.
    pub(crate) fn push(&mut self, threads: &mut ThreadTable, thread: ThreadId) {
        debug_assert!(
            thread != self.idle,
            "the idle thread is the empty-queue fallback, never a queue member"
        );
        thread_mut(threads, thread).time_left = DEFAULT_TIME_SLICE;
        self.ready.push_back(thread);
        trace!("ready <- {}", thread);
    }

    /// Pops the ready queue's head into the running slot. An empty queue
    /// yields the permanent idle thread, which is never dequeued because
    /// it is never enqueued.
    pub(crate) fn next(&mut self, threads: &mut ThreadTable) -> ThreadId {
        let next = match self.ready.pop_front() {
            Some(id) => id,
            None => {
                thread_mut(threads, self.idle).time_left = DEFAULT_TIME_SLICE;
                self.idle
            }
        };
        self.current = next;
        next
    }

    pub(crate) fn current(&self) -> ThreadId {
        self.current
    }

    pub(crate) fn idle(&self) -> ThreadId {
        self.idle
    }

    pub(crate) fn user_thread_count(&self) -> u64 {
        self.user_threads
    }

    pub(crate) fn user_thread_started(&mut self) {
        self.user_threads += 1;
    }

    pub(crate) fn user_thread_exited(&mut self) {
        self.user_threads -= 1;
    }

    /// Registers a wakeup `delta > 0` ticks from now. The entry is placed
    /// so the queue stays sorted by absolute wake time; an entry with an
    /// equal wake time is placed after it (ties wake FIFO). The follower's
    /// delta shrinks by the new entry's share so the cumulative sums
    /// behind it are unchanged.
    pub(crate) fn insert_timeout(
        &mut self,
        mem: &mut BlockAllocator,
        thread: ThreadId,
        delta: u64,
        semaphore: Option<SemId>,
    ) {
        assert!(delta > 0, "zero-tick timeouts never enter the sleep queue");

        let record = mem
            .alloc(blocks_for(core::mem::size_of::<SleepEntry>()))
            .unwrap_or_else(|| panic!("out of memory registering a timeout for {}", thread));

        let mut at = 0;
        let mut accumulated = 0u64;
        while at < self.sleeping.len() && accumulated + self.sleeping[at].delta <= delta {
            accumulated += self.sleeping[at].delta;
            at += 1;
        }

        let own_delta = delta - accumulated;
        if let Some(follower) = self.sleeping.get_mut(at) {
            follower.delta -= own_delta;
        }
        self.sleeping.insert(
            at,
            SleepEntry {
                thread,
                semaphore,
                delta: own_delta,
                record,
            },
        );
        trace!("{} sleeping for {} ticks (slot {})", thread, delta, at);
    }

    /// Unlinks `thread`'s sleep record, folding its remaining delta into
    /// the follower, and returns its blocks to the allocator. A record
    /// that cannot be found means the fire-xor-cancel discipline was
    /// broken somewhere, which is fatal.
    pub(crate) fn remove_timeout(&mut self, mem: &mut BlockAllocator, thread: ThreadId) {
        let at = self
            .sleeping
            .iter()
            .position(|entry| entry.thread == thread)
            .unwrap_or_else(|| panic!("{} has no sleep record to remove", thread));

        let entry = self.sleeping.remove(at).unwrap();
        if let Some(follower) = self.sleeping.get_mut(at) {
            follower.delta += entry.delta;
        }
        if let Err(err) = mem.free(entry.record) {
            panic!("failed to free a sleep record: {}", err);
        }
        trace!("{} timeout cancelled", thread);
    }

    /// Ticks the sleep queue head down by one and, when it reaches zero,
    /// pops every entry now due. Waking the threads (and detaching timed
    /// waiters from their semaphores) is the caller's job; this keeps the
    /// queue bookkeeping in one place.
    pub(crate) fn collect_due(&mut self, mem: &mut BlockAllocator) -> VecDeque<SleepEntry> {
        let mut due = VecDeque::new();

        let Some(head) = self.sleeping.front_mut() else {
            return due;
        };
        head.delta -= 1;
        if head.delta > 0 {
            return due;
        }

        // Bursts of simultaneous timers drain within one tick.
        while self.sleeping.front().map(|e| e.delta) == Some(0) {
            let entry = self.sleeping.pop_front().unwrap();
            if let Err(err) = mem.free(entry.record) {
                panic!("failed to free a sleep record: {}", err);
            }
            due.push_back(entry);
        }
        due
    }

    pub(crate) fn ready_queue(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.ready.iter().copied()
    }

    pub(crate) fn sleep_queue(&self) -> impl Iterator<Item = (ThreadId, u64)> + '_ {
        self.sleeping.iter().map(|e| (e.thread, e.delta))
    }

    /// Debug dump of both queues.
    pub(crate) fn log_queues(&self) {
        if self.ready.is_empty() {
            debug!("ready queue empty");
        } else {
            for id in &self.ready {
                debug!("  ready: {}", id);
            }
        }
        if self.sleeping.is_empty() {
            debug!("sleep queue empty");
        } else {
            for entry in &self.sleeping {
                debug!("  sleeping: {} (+{} ticks)", entry.thread, entry.delta);
            }
        }
    }
}
