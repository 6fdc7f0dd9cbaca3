//! End-to-end scenario driven through the public surface: a producer
//! thread and two consumers coordinate over a counting semaphore, with
//! the test standing in for the platform's trap handlers.

use hart_kernel::{Kernel, NullSwitch, Privilege, WaitOutcome, WaitStatus};

const ENTRY: usize = 0x8000_2000;

#[test]
fn producer_consumer_bringup() {
    let mut k = Kernel::with_heap(NullSwitch, 0x8020_0000, 128 * 1024);
    let free_at_start = k.allocator().free_blocks();

    let producer = k.spawn(ENTRY, 0, Privilege::User).unwrap();
    let c1 = k.spawn(ENTRY, 1, Privilege::User).unwrap();
    let c2 = k.spawn(ENTRY, 2, Privilege::User).unwrap();
    assert_eq!(k.user_thread_count(), 3);

    k.dispatch();
    assert_eq!(k.current(), producer);
    let items = k.sem_open(0).unwrap();

    // The producer naps a tick before producing; both consumers block,
    // the first with a deadline.
    k.sleep(1);
    assert_eq!(k.current(), c1);
    assert_eq!(k.sem_timed_wait(items, 4), WaitStatus::Blocked);
    assert_eq!(k.current(), c2);
    assert_eq!(k.sem_wait(items), WaitStatus::Blocked);
    assert_eq!(k.current(), k.idle_thread());
    assert_eq!(k.sem_value(items), Some(-2));

    k.timer_tick();
    assert_eq!(k.ready_threads().collect::<Vec<_>>(), [producer]);
    assert_eq!(k.sleeping_threads().collect::<Vec<_>>(), [(c1, 3)]);

    k.dispatch();
    assert_eq!(k.current(), producer);

    // Two items: c1 acquires before its deadline (timeout cancelled),
    // then c2.
    k.sem_signal(items);
    k.sem_signal(items);
    assert_eq!(k.take_wait_outcome(c1), Some(WaitOutcome::Success));
    assert_eq!(k.take_wait_outcome(c2), Some(WaitOutcome::Success));
    assert_eq!(k.ready_threads().collect::<Vec<_>>(), [c1, c2]);
    assert_eq!(k.sleeping_threads().count(), 0);
    assert_eq!(k.sem_value(items), Some(0));

    // Everyone drains; the heap comes back whole.
    k.sem_close(items);
    k.thread_exit();
    assert_eq!(k.current(), c1);
    k.thread_exit();
    k.thread_exit();
    assert_eq!(k.current(), k.idle_thread());
    assert_eq!(k.user_thread_count(), 0);
    assert_eq!(k.allocator().free_blocks(), free_at_start);
}

#[test]
fn deadline_expires_while_the_producer_stalls() {
    let mut k = Kernel::with_heap(NullSwitch, 0x8020_0000, 128 * 1024);
    let consumer = k.spawn(ENTRY, 0, Privilege::User).unwrap();

    k.dispatch();
    let items = k.sem_open(0).unwrap();
    assert_eq!(k.sem_timed_wait(items, 3), WaitStatus::Blocked);
    assert_eq!(k.current(), k.idle_thread());

    k.timer_tick();
    k.timer_tick();
    assert_eq!(k.ready_threads().count(), 0);
    k.timer_tick();
    assert_eq!(k.ready_threads().collect::<Vec<_>>(), [consumer]);
    assert_eq!(k.take_wait_outcome(consumer), Some(WaitOutcome::TimedOut));
    assert_eq!(k.sem_value(items), Some(0));
}
