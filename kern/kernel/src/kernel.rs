//! The kernel context object.
//!
//! One [`Kernel`] owns the block allocator, the thread arena, the
//! scheduler and the semaphore table. Every operation takes `&mut self`,
//! so "handlers never overlap" is a property of the borrow checker rather
//! than of disabled interrupts: an embedder driving this from real OS
//! threads must funnel all calls through the single owner.
//!
//! The trap layer composes these operations. On a timer interrupt it
//! calls [`Kernel::timer_tick`]; on a blocking syscall it calls the
//! matching operation and, when that returns [`WaitStatus::Blocked`],
//! returns to a different thread; the blocked one resumes later with its
//! outcome in its pending slot.

use alloc::collections::BTreeMap;
use core::fmt;

use log::{debug, trace};

use crate::config::{
    CONTEXT_SAVE_SIZE, DEFAULT_STACK_SIZE, DEFAULT_TIME_SLICE, HEAP_END_ADDR, HEAP_START_ADDR,
};
use crate::mm::block::{blocks_for, BlockAllocator, BlockPtr};
use crate::platform::ContextSwitch;
use crate::sync::semaphore::{SemId, Semaphore, WaitStatus};
use crate::task::scheduler::Scheduler;
use crate::task::{
    thread_mut, Privilege, SavedStatus, StackRegion, Thread, ThreadId, ThreadTable, WaitOutcome,
};

/// Allocation failure surfaced to the caller. The operation that returns
/// this has reserved nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoMemory;

impl fmt::Display for NoMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "out of heap blocks")
    }
}

pub struct Kernel<P: ContextSwitch> {
    mem: BlockAllocator,
    threads: ThreadTable,
    sched: Scheduler,
    sems: BTreeMap<SemId, Semaphore>,
    next_thread: u64,
    next_sem: u64,
    platform: P,
}

impl<P: ContextSwitch> Kernel<P> {
    /// Brings the kernel up over the configured heap region.
    pub fn new(platform: P) -> Self {
        Self::with_heap(platform, HEAP_START_ADDR, HEAP_END_ADDR - HEAP_START_ADDR)
    }

    /// Brings the kernel up over an explicit heap region. The scheduler
    /// state and the permanent idle thread are the heap's first
    /// allocations after the index; failure to place either is fatal,
    /// there is no kernel to come back to.
    pub fn with_heap(platform: P, heap_start: usize, heap_len: usize) -> Self {
        let mut mem = BlockAllocator::new(heap_start, heap_len);

        let sched_record = mem
            .alloc_bytes(core::mem::size_of::<Scheduler>())
            .unwrap_or_else(|| panic!("failed to allocate the scheduler state"));
        let idle_record = mem
            .alloc_bytes(core::mem::size_of::<Thread>())
            .unwrap_or_else(|| panic!("failed to allocate the idle thread"));

        let idle = ThreadId(0);
        let mut threads = ThreadTable::new();
        threads.insert(
            idle,
            Thread {
                sp: 0,
                stack_base: 0,
                status: SavedStatus::PRIVILEGED,
                resume_at: 0,
                entry: 0,
                arg: 0,
                time_left: 1,
                privilege: Privilege::Kernel,
                pending: None,
                timeout_armed: false,
                stack: None,
                record: idle_record,
            },
        );

        debug!("kernel up, idle thread is {}", idle);
        Self {
            mem,
            threads,
            sched: Scheduler::new(idle, sched_record),
            sems: BTreeMap::new(),
            next_thread: 1,
            next_sem: 0,
            platform,
        }
    }

    // ---- threads ----------------------------------------------------

    /// Creates a thread over a caller-provided stack and admits it to the
    /// ready queue. The stack pointer starts below a reserved save area
    /// pre-populated so the platform trampoline finds `entry` and `arg`
    /// at first dispatch.
    ///
    /// On `NoMemory` nothing has been reserved; the stack stays the
    /// caller's to reuse or free.
    pub fn create_thread(
        &mut self,
        entry: usize,
        arg: usize,
        stack: StackRegion,
        privilege: Privilege,
    ) -> Result<ThreadId, NoMemory> {
        let record = self
            .mem
            .alloc_bytes(core::mem::size_of::<Thread>())
            .ok_or(NoMemory)?;

        let status = match privilege {
            Privilege::Kernel => SavedStatus::PRIVILEGED,
            Privilege::User => SavedStatus::INTERRUPTS_ENABLED,
        };

        let id = ThreadId(self.next_thread);
        self.next_thread += 1;
        self.threads.insert(
            id,
            Thread {
                sp: stack.top() - CONTEXT_SAVE_SIZE,
                stack_base: stack.base,
                status,
                resume_at: self.platform.trampoline(),
                entry,
                arg,
                time_left: DEFAULT_TIME_SLICE,
                privilege,
                pending: None,
                timeout_armed: false,
                stack: Some(BlockPtr(stack.base)),
                record,
            },
        );

        if privilege == Privilege::User {
            self.sched.user_thread_started();
        }
        self.sched.push(&mut self.threads, id);

        debug!("created {} (entry {:#x}, {:?})", id, entry, privilege);
        Ok(id)
    }

    /// [`create_thread`](Self::create_thread) over a freshly allocated
    /// default-size stack. The stack goes back to the allocator if the
    /// thread record cannot be placed.
    pub fn spawn(
        &mut self,
        entry: usize,
        arg: usize,
        privilege: Privilege,
    ) -> Result<ThreadId, NoMemory> {
        let stack = self
            .mem
            .alloc(blocks_for(DEFAULT_STACK_SIZE))
            .ok_or(NoMemory)?;
        let region = StackRegion {
            base: stack.0,
            len: DEFAULT_STACK_SIZE,
        };

        match self.create_thread(entry, arg, region, privilege) {
            Ok(id) => Ok(id),
            Err(err) => {
                if let Err(free_err) = self.mem.free(stack) {
                    panic!("failed to return an unused stack: {}", free_err);
                }
                Err(err)
            }
        }
    }

    /// Terminates the running thread: switches to the next runnable one
    /// and only then reclaims the stack and record; nothing references
    /// the exiting thread's stack once control has left it.
    pub fn thread_exit(&mut self) {
        let exiting = self.sched.current();
        if exiting == self.sched.idle() {
            panic!("the idle thread attempted to exit");
        }
        if thread_mut(&mut self.threads, exiting).privilege == Privilege::User {
            self.sched.user_thread_exited();
        }

        let next = self.sched.next(&mut self.threads);
        self.platform.switch(exiting, next);
        self.delete_thread(exiting);
    }

    fn delete_thread(&mut self, id: ThreadId) {
        let thread = self
            .threads
            .remove(&id)
            .unwrap_or_else(|| panic!("{} missing from the thread arena", id));
        if thread.sp < thread.stack_base {
            panic!("stack overflow: {} grew past its stack base", id);
        }
        if let Some(stack) = thread.stack {
            if let Err(err) = self.mem.free(stack) {
                panic!("failed to free a thread stack: {}", err);
            }
        }
        if let Err(err) = self.mem.free(thread.record) {
            panic!("failed to free a thread record: {}", err);
        }
        debug!("deleted {}", id);
    }

    /// Voluntary yield: the caller goes to the ready queue's tail (the
    /// idle thread never queues) and the head runs.
    pub fn dispatch(&mut self) {
        let from = self.sched.current();
        if from != self.sched.idle() {
            self.sched.push(&mut self.threads, from);
        }
        let next = self.sched.next(&mut self.threads);
        self.platform.switch(from, next);
    }

    /// Puts the running thread to sleep for `ticks`. Zero ticks is a
    /// no-op; the sleep queue never holds an already-due entry.
    pub fn sleep(&mut self, ticks: u64) {
        if ticks == 0 {
            return;
        }
        let from = self.sched.current();
        self.sched.insert_timeout(&mut self.mem, from, ticks, None);
        thread_mut(&mut self.threads, from).timeout_armed = true;

        let next = self.sched.next(&mut self.threads);
        self.platform.switch(from, next);
    }

    // ---- timer ------------------------------------------------------

    /// One timer interrupt's worth of sleep-queue work: the head delta
    /// drops by one and every entry now due wakes. A timed semaphore
    /// waiter leaves its wait queue first, with the undone decrement and
    /// a `TimedOut` outcome.
    pub fn tick(&mut self) {
        let due = self.sched.collect_due(&mut self.mem);
        for entry in due {
            if let Some(sem) = entry.semaphore {
                self.cancel_timed_waiter(sem, entry.thread);
            }
            thread_mut(&mut self.threads, entry.thread).timeout_armed = false;
            self.sched.push(&mut self.threads, entry.thread);
            trace!("{} woke", entry.thread);
        }
    }

    /// The full timer-interrupt path: sleep-queue work, then the running
    /// thread's slice drops by one and an expired slice triggers a
    /// round-robin switch.
    pub fn timer_tick(&mut self) {
        self.tick();

        let running = self.sched.current();
        let thread = thread_mut(&mut self.threads, running);
        thread.time_left = thread.time_left.saturating_sub(1);
        if thread.time_left > 0 {
            return;
        }

        if running != self.sched.idle() {
            self.sched.push(&mut self.threads, running);
        }
        let next = self.sched.next(&mut self.threads);
        self.platform.switch(running, next);
    }

    // ---- semaphores -------------------------------------------------

    /// Opens a counting semaphore with the given initial value.
    pub fn sem_open(&mut self, initial: u32) -> Result<SemId, NoMemory> {
        let record = self
            .mem
            .alloc_bytes(core::mem::size_of::<Semaphore>())
            .ok_or(NoMemory)?;

        let id = SemId(self.next_sem);
        self.next_sem += 1;
        self.sems.insert(id, Semaphore::new(initial, record));

        debug!("opened {} (initial {})", id, initial);
        Ok(id)
    }

    /// Wakes every waiter with [`WaitOutcome::ClosedExternally`], cancels
    /// their armed timeouts, and frees the semaphore's state exactly
    /// once. The handle is dead afterwards; using it is the caller's
    /// mistake.
    pub fn sem_close(&mut self, id: SemId) {
        let sem = self
            .sems
            .remove(&id)
            .unwrap_or_else(|| panic!("unknown {}", id));

        for waiter in sem.waiters {
            let thread = thread_mut(&mut self.threads, waiter);
            if thread.timeout_armed {
                thread.timeout_armed = false;
                self.sched.remove_timeout(&mut self.mem, waiter);
            }
            thread_mut(&mut self.threads, waiter).pending = Some(WaitOutcome::ClosedExternally);
            self.sched.push(&mut self.threads, waiter);
        }

        if let Err(err) = self.mem.free(sem.record) {
            panic!("failed to free a semaphore record: {}", err);
        }
        debug!("closed {}", id);
    }

    /// Decrements the value. Non-negative results acquire immediately;
    /// a negative result blocks the caller: it joins the wait queue and
    /// the next runnable thread takes over. The blocked thread's outcome
    /// arrives later through its pending slot.
    pub fn sem_wait(&mut self, id: SemId) -> WaitStatus {
        let sem = self
            .sems
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown {}", id));
        sem.value -= 1;
        if sem.value >= 0 {
            return WaitStatus::Acquired;
        }

        let waiter = self.sched.current();
        sem.waiters.push_back(waiter);
        trace!("{} blocked on {}", waiter, id);

        let next = self.sched.next(&mut self.threads);
        self.platform.switch(waiter, next);
        WaitStatus::Blocked
    }

    /// As [`sem_wait`](Self::sem_wait) but never blocks: a decrement that
    /// would go negative is undone and reported.
    pub fn sem_try_wait(&mut self, id: SemId) -> WaitStatus {
        let sem = self
            .sems
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown {}", id));
        sem.value -= 1;
        if sem.value >= 0 {
            return WaitStatus::Acquired;
        }
        sem.value += 1;
        WaitStatus::WouldBlock
    }

    /// Increments the value. At zero or below there must be a waiter:
    /// the longest-waiting thread wakes with `Success`, its pending
    /// timeout (if any) cancelled.
    pub fn sem_signal(&mut self, id: SemId) {
        let sem = self
            .sems
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown {}", id));
        sem.value += 1;
        if sem.value > 0 {
            return;
        }

        let Some(waiter) = sem.waiters.pop_front() else {
            panic!("{} value is negative with an empty wait queue", id);
        };

        let thread = thread_mut(&mut self.threads, waiter);
        if thread.timeout_armed {
            thread.timeout_armed = false;
            self.sched.remove_timeout(&mut self.mem, waiter);
        }
        thread_mut(&mut self.threads, waiter).pending = Some(WaitOutcome::Success);
        self.sched.push(&mut self.threads, waiter);
        trace!("{} signalled, woke {}", id, waiter);
    }

    /// A wait bounded by `ticks`. The caller's remaining slice is
    /// cleared, a timeout is registered against this semaphore, then the
    /// wait proceeds. Exactly one of two events resolves a blocked timed
    /// wait: the timer fires first (the tick path detaches the waiter,
    /// restores the value and delivers `TimedOut`) or a signal lands
    /// first (the signal path cancels the timeout and delivers
    /// `Success`). A wait that acquires immediately cancels the timeout
    /// it just registered.
    pub fn sem_timed_wait(&mut self, id: SemId, ticks: u64) -> WaitStatus {
        let current = self.sched.current();
        thread_mut(&mut self.threads, current).time_left = 0;

        if ticks == 0 {
            return self.sem_wait(id);
        }

        self.sched
            .insert_timeout(&mut self.mem, current, ticks, Some(id));
        thread_mut(&mut self.threads, current).timeout_armed = true;

        let status = self.sem_wait(id);
        if status == WaitStatus::Acquired {
            thread_mut(&mut self.threads, current).timeout_armed = false;
            self.sched.remove_timeout(&mut self.mem, current);
        }
        status
    }

    /// Tick-path removal of a timed waiter whose timer fired: out of the
    /// wait queue, decrement undone, `TimedOut` delivered.
    fn cancel_timed_waiter(&mut self, id: SemId, waiter: ThreadId) {
        let sem = self
            .sems
            .get_mut(&id)
            .unwrap_or_else(|| panic!("timed wait names the missing {}", id));
        let at = sem
            .waiters
            .iter()
            .position(|&t| t == waiter)
            .unwrap_or_else(|| panic!("{} lost from {}'s wait queue", waiter, id));
        sem.waiters.remove(at);
        sem.value += 1;
        thread_mut(&mut self.threads, waiter).pending = Some(WaitOutcome::TimedOut);
    }

    // ---- inspection -------------------------------------------------

    /// The running thread. Non-owning: the running thread is in no queue.
    pub fn current(&self) -> ThreadId {
        self.sched.current()
    }

    pub fn idle_thread(&self) -> ThreadId {
        self.sched.idle()
    }

    /// Live unprivileged threads; the embedder's bring-up loop runs until
    /// this drops to zero.
    pub fn user_thread_count(&self) -> u64 {
        self.sched.user_thread_count()
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    /// Reads and clears a thread's pending wait outcome; the trap layer
    /// patches this into the thread's saved return slot before resuming
    /// it.
    pub fn take_wait_outcome(&mut self, id: ThreadId) -> Option<WaitOutcome> {
        thread_mut(&mut self.threads, id).pending.take()
    }

    pub fn sem_value(&self, id: SemId) -> Option<i32> {
        self.sems.get(&id).map(|s| s.value)
    }

    pub fn ready_threads(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.sched.ready_queue()
    }

    /// Sleep queue as `(thread, relative delta)` pairs in wake order.
    pub fn sleeping_threads(&self) -> impl Iterator<Item = (ThreadId, u64)> + '_ {
        self.sched.sleep_queue()
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.mem
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Debug dump of the allocator index, both scheduler queues and every
    /// open semaphore.
    pub fn log_state(&self) {
        self.mem.log_index();
        self.sched.log_queues();
        for (id, sem) in &self.sems {
            debug!(
                "  {}: value {} (initial {}), {} waiting",
                id,
                sem.value,
                sem.initial,
                sem.waiters.len()
            );
        }
    }
}
