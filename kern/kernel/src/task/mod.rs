//! Thread records.
//!
//! Threads live in an arena keyed by [`ThreadId`]; the scheduler's queues
//! and the semaphores' wait queues hold ids, never the records themselves.
//! A thread is owned by exactly one queue at a time (ready, sleeping or a
//! semaphore's wait queue) or by the scheduler's running slot.

pub mod scheduler;

use alloc::collections::BTreeMap;
use bitflags::bitflags;
use core::fmt;

use crate::mm::block::BlockPtr;

/// Stable handle to a thread record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(pub(crate) u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {}", self.0)
    }
}

bitflags! {
    /// Saved privileged-mode status word, restored by the platform when
    /// the thread is resumed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SavedStatus: u64 {
        /// Interrupts enabled on resume.
        const INTERRUPTS_ENABLED = 1 << 1;
        /// Resume in privileged (kernel) mode.
        const PRIVILEGED = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Kernel,
}

/// Outcome of a blocking semaphore wait, delivered through the blocked
/// thread's pending slot when it is re-admitted to the ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Success,
    TimedOut,
    ClosedExternally,
}

/// Stack memory handed to [`Kernel::create_thread`]. The region is a run
/// of allocator blocks; its base is what thread deletion returns to the
/// allocator.
///
/// [`Kernel::create_thread`]: crate::Kernel::create_thread
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    pub base: usize,
    pub len: usize,
}

impl StackRegion {
    pub fn top(&self) -> usize {
        self.base + self.len
    }
}

/// An execution context. Register contents are the platform's business;
/// the core keeps only the stack pointer (for the overflow check on
/// deletion), the status word, the resume address and the save-area image
/// the trampoline consumes at first dispatch.
#[derive(Debug)]
pub struct Thread {
    pub(crate) sp: usize,
    pub(crate) stack_base: usize,
    pub(crate) status: SavedStatus,
    pub(crate) resume_at: usize,
    pub(crate) entry: usize,
    pub(crate) arg: usize,
    pub(crate) time_left: u64,
    pub(crate) privilege: Privilege,
    /// Result of the wait this thread is blocked in, patched by whoever
    /// wakes it. Explicitly a field, never a reinterpreted register.
    pub(crate) pending: Option<WaitOutcome>,
    /// Set while a sleep record for this thread is in the delta queue.
    pub(crate) timeout_armed: bool,
    pub(crate) stack: Option<BlockPtr>,
    pub(crate) record: BlockPtr,
}

impl Thread {
    pub fn saved_sp(&self) -> usize {
        self.sp
    }

    pub fn stack_base(&self) -> usize {
        self.stack_base
    }

    pub fn status(&self) -> SavedStatus {
        self.status
    }

    /// Resume address, the externally supplied trampoline for threads
    /// that have not run yet.
    pub fn resume_at(&self) -> usize {
        self.resume_at
    }

    /// Entry point and argument the trampoline delivers at first dispatch.
    pub fn entry(&self) -> (usize, usize) {
        (self.entry, self.arg)
    }

    pub fn time_left(&self) -> u64 {
        self.time_left
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    pub fn pending(&self) -> Option<WaitOutcome> {
        self.pending
    }
}

pub(crate) type ThreadTable = BTreeMap<ThreadId, Thread>;

/// Arena lookup. A queue naming a thread the arena does not hold is
/// kernel-internal corruption.
pub(crate) fn thread_mut(threads: &mut ThreadTable, id: ThreadId) -> &mut Thread {
    threads
        .get_mut(&id)
        .unwrap_or_else(|| panic!("{} missing from the thread arena", id))
}
