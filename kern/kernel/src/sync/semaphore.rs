//! Counting semaphore state.
//!
//! The record itself is passive: every state transition that can block or
//! wake a thread goes through [`Kernel`] operations, because blocking and
//! unblocking are scheduler work (push/next/timeout/remove-timeout).
//!
//! Invariant: the value strictly decrements on each wait and increments
//! on each signal or cancelled wait; while the value is negative, its
//! magnitude equals the wait queue's length.
//!
//! [`Kernel`]: crate::Kernel

use alloc::collections::VecDeque;
use core::fmt;

use crate::mm::block::BlockPtr;
use crate::task::ThreadId;

/// Stable handle to an open semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SemId(pub(crate) u64);

impl fmt::Display for SemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "semaphore {}", self.0)
    }
}

/// Result of a wait operation. The caller's contract is in the type:
/// `Blocked` means the calling thread has been switched away from and its
/// outcome will arrive later through its pending slot, not through a
/// return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WaitStatus {
    /// The semaphore was acquired without blocking.
    Acquired,
    /// `try_wait` only: acquiring would have blocked; nothing changed.
    WouldBlock,
    /// The caller blocked; resumption delivers the outcome.
    Blocked,
}

#[derive(Debug)]
pub(crate) struct Semaphore {
    pub(crate) value: i32,
    pub(crate) initial: i32,
    pub(crate) waiters: VecDeque<ThreadId>,
    pub(crate) record: BlockPtr,
}

impl Semaphore {
    pub(crate) fn new(initial: u32, record: BlockPtr) -> Self {
        Self {
            value: initial as i32,
            initial: initial as i32,
            waiters: VecDeque::new(),
            record,
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::config::MEM_BLOCK_SIZE;
    use crate::kernel::Kernel;
    use crate::platform::NullSwitch;
    use crate::task::{Privilege, WaitOutcome};
    use std::vec::Vec;

    const ENTRY: usize = 0x8000_2000;

    /// A kernel with `n` user threads, the first of them running.
    fn kernel_with_threads(n: usize) -> (Kernel<NullSwitch>, Vec<ThreadId>) {
        let mut k = Kernel::with_heap(NullSwitch, 0x8020_0000, 64 * MEM_BLOCK_SIZE);
        let ids = (0..n)
            .map(|i| k.spawn(ENTRY, i, Privilege::User).unwrap())
            .collect();
        k.dispatch();
        (k, ids)
    }

    #[test]
    fn waiters_wake_in_fifo_order() {
        let (mut k, ids) = kernel_with_threads(3);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        let sem = k.sem_open(0).unwrap();

        assert_eq!(k.sem_wait(sem), WaitStatus::Blocked); // a
        assert_eq!(k.current(), b);
        assert_eq!(k.sem_wait(sem), WaitStatus::Blocked); // b
        assert_eq!(k.sem_wait(sem), WaitStatus::Blocked); // c
        assert_eq!(k.current(), k.idle_thread());
        assert_eq!(k.sem_value(sem), Some(-3));

        k.sem_signal(sem);
        assert_eq!(k.ready_threads().collect::<Vec<_>>(), [a]);
        assert_eq!(k.take_wait_outcome(a), Some(WaitOutcome::Success));
        assert_eq!(k.take_wait_outcome(a), None);

        k.sem_signal(sem);
        k.sem_signal(sem);
        assert_eq!(k.ready_threads().collect::<Vec<_>>(), [a, b, c]);
        assert_eq!(k.sem_value(sem), Some(0));
    }

    #[test]
    fn positive_value_acquires_without_blocking() {
        let (mut k, ids) = kernel_with_threads(1);
        let sem = k.sem_open(2).unwrap();

        assert_eq!(k.sem_wait(sem), WaitStatus::Acquired);
        assert_eq!(k.sem_wait(sem), WaitStatus::Acquired);
        assert_eq!(k.sem_value(sem), Some(0));
        assert_eq!(k.current(), ids[0]);
    }

    #[test]
    fn try_wait_leaves_an_unavailable_semaphore_untouched() {
        let (mut k, ids) = kernel_with_threads(1);
        let empty = k.sem_open(0).unwrap();
        let full = k.sem_open(1).unwrap();

        assert_eq!(k.sem_try_wait(empty), WaitStatus::WouldBlock);
        assert_eq!(k.sem_value(empty), Some(0));
        assert_eq!(k.current(), ids[0]);

        assert_eq!(k.sem_try_wait(full), WaitStatus::Acquired);
        assert_eq!(k.sem_value(full), Some(0));
    }

    #[test]
    fn timed_wait_resolved_by_signal_cancels_the_timeout() {
        let (mut k, ids) = kernel_with_threads(2);
        let (a, b) = (ids[0], ids[1]);
        let sem = k.sem_open(0).unwrap();

        assert_eq!(k.sem_timed_wait(sem, 5), WaitStatus::Blocked);
        assert_eq!(k.current(), b);
        k.tick();
        k.tick();

        k.sem_signal(sem);
        assert_eq!(k.take_wait_outcome(a), Some(WaitOutcome::Success));
        assert_eq!(k.sleeping_threads().count(), 0);
        assert_eq!(k.sem_value(sem), Some(0));

        // The cancelled timer must never fire.
        for _ in 0..10 {
            k.tick();
        }
        assert_eq!(k.ready_threads().collect::<Vec<_>>(), [a]);
    }

    #[test]
    fn timed_wait_resolved_by_the_timer_restores_the_value() {
        let (mut k, ids) = kernel_with_threads(2);
        let a = ids[0];
        let sem = k.sem_open(0).unwrap();

        assert_eq!(k.sem_timed_wait(sem, 5), WaitStatus::Blocked);
        for _ in 0..4 {
            k.tick();
            assert_eq!(k.ready_threads().count(), 0);
        }
        k.tick();
        assert_eq!(k.ready_threads().collect::<Vec<_>>(), [a]);
        assert_eq!(k.take_wait_outcome(a), Some(WaitOutcome::TimedOut));
        assert_eq!(k.sem_value(sem), Some(0));

        // No waiter is left behind: a later signal just banks the value.
        k.sem_signal(sem);
        assert_eq!(k.sem_value(sem), Some(1));
    }

    #[test]
    fn immediate_acquisition_cancels_the_timeout() {
        let (mut k, ids) = kernel_with_threads(1);
        let sem = k.sem_open(1).unwrap();

        assert_eq!(k.sem_timed_wait(sem, 5), WaitStatus::Acquired);
        assert_eq!(k.current(), ids[0]);
        assert_eq!(k.sleeping_threads().count(), 0);
    }

    #[test]
    fn zero_tick_timed_wait_degrades_to_a_plain_wait() {
        let (mut k, ids) = kernel_with_threads(2);
        let a = ids[0];
        let sem = k.sem_open(0).unwrap();

        assert_eq!(k.sem_timed_wait(sem, 0), WaitStatus::Blocked);
        assert_eq!(k.sleeping_threads().count(), 0);

        k.sem_signal(sem);
        assert_eq!(k.take_wait_outcome(a), Some(WaitOutcome::Success));
    }

    #[test]
    fn close_wakes_every_waiter_and_frees_the_record_once() {
        let (mut k, ids) = kernel_with_threads(2);
        let (a, b) = (ids[0], ids[1]);
        let free_before = k.allocator().free_blocks();
        let sem = k.sem_open(0).unwrap();

        assert_eq!(k.sem_wait(sem), WaitStatus::Blocked); // a
        assert_eq!(k.sem_timed_wait(sem, 10), WaitStatus::Blocked); // b

        k.sem_close(sem);
        assert_eq!(k.ready_threads().collect::<Vec<_>>(), [a, b]);
        assert_eq!(k.take_wait_outcome(a), Some(WaitOutcome::ClosedExternally));
        assert_eq!(k.take_wait_outcome(b), Some(WaitOutcome::ClosedExternally));
        assert_eq!(k.sleeping_threads().count(), 0);
        assert_eq!(k.sem_value(sem), None);
        assert_eq!(k.allocator().free_blocks(), free_before);
    }
}
