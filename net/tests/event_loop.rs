//! Integration tests for the reactor core: wakeups, task ordering, thread
//! affinity, and pool loop selection.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rivet_net::event_loop_thread::EventLoopThread;
use rivet_net::{Channel, EventLoop, EventLoopThreadPool};

/// A loop idle in a long poll must run an off-thread task promptly, not
/// after the poll timeout.
#[test]
fn test_off_thread_task_wakes_idle_loop() {
    let mut host = EventLoopThread::new("wakeup-test", None);
    let lp = host.start_loop().unwrap();

    // Let the loop settle into its poll.
    thread::sleep(Duration::from_millis(50));

    let (tx, rx) = crossbeam_channel::bounded(1);
    let started = Instant::now();
    lp.run_in_loop(move || {
        let _ = tx.send(started.elapsed());
    });

    let elapsed = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("task did not run");
    assert!(elapsed < Duration::from_secs(1), "wakeup too slow: {elapsed:?}");
}

#[test]
fn test_tasks_from_one_thread_run_in_fifo_order() {
    let mut host = EventLoopThread::new("fifo-test", None);
    let lp = host.start_loop().unwrap();

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let (tx, rx) = crossbeam_channel::bounded(1);

    for i in 0..100 {
        let order = order.clone();
        lp.queue_in_loop(move || order.lock().push(i));
    }
    lp.queue_in_loop(move || {
        let _ = tx.send(());
    });

    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let seen = order.lock().clone();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
}

#[test]
fn test_each_task_runs_exactly_once() {
    let mut host = EventLoopThread::new("once-test", None);
    let lp = host.start_loop().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = crossbeam_channel::bounded(1);

    for _ in 0..500 {
        let count = count.clone();
        lp.queue_in_loop(move || {
            count.fetch_add(1, Ordering::Relaxed);
        });
    }
    lp.queue_in_loop(move || {
        let _ = tx.send(());
    });

    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 500);
}

/// A task queued from inside the drain must not deadlock, and must run on a
/// later drain of the same loop.
#[test]
fn test_task_enqueued_during_drain_runs_later() {
    let mut host = EventLoopThread::new("requeue-test", None);
    let lp = host.start_loop().unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    let lp2 = Arc::clone(&lp);
    lp.queue_in_loop(move || {
        let tx = tx.clone();
        lp2.queue_in_loop(move || {
            let _ = tx.send(());
        });
    });

    rx.recv_timeout(Duration::from_secs(2))
        .expect("nested task never ran");
}

#[test]
fn test_run_in_loop_is_inline_on_the_loop_thread() {
    let mut host = EventLoopThread::new("inline-test", None);
    let lp = host.start_loop().unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    let lp2 = Arc::clone(&lp);
    lp.queue_in_loop(move || {
        let inline = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let inline2 = Arc::clone(&inline);
        lp2.run_in_loop(move || inline2.store(true, Ordering::SeqCst));
        let _ = tx.send(inline.load(Ordering::SeqCst));
    });

    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
}

#[test]
fn test_quit_from_another_thread_stops_the_loop() {
    let mut host = EventLoopThread::new("quit-test", None);
    let lp = host.start_loop().unwrap();

    let started = Instant::now();
    lp.quit();
    drop(host); // joins
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_channel_mutation_from_wrong_thread_panics() {
    let mut host = EventLoopThread::new("affinity-test", None);
    let lp = host.start_loop().unwrap();

    // This channel belongs to the hosted loop; arming it from the test
    // thread violates affinity.
    let ch = Channel::new(&lp, 0);
    let result = thread::spawn(move || ch.enable_reading()).join();
    assert!(result.is_err(), "cross-thread channel mutation did not panic");
}

#[test]
fn test_second_loop_on_one_thread_panics() {
    let _lp = EventLoop::new().unwrap();
    let result = std::panic::catch_unwind(AssertUnwindSafe(EventLoop::new));
    assert!(result.is_err(), "second loop on the same thread was allowed");
}

#[test]
fn test_current_points_at_the_thread_loop() {
    assert!(EventLoop::current().is_none());
    let lp = EventLoop::new().unwrap();
    let current = EventLoop::current().expect("current loop missing");
    assert!(Arc::ptr_eq(&lp, &current));

    drop(current);
    drop(lp);
    assert!(EventLoop::current().is_none());
}

#[test]
fn test_iterations_advance_while_running() {
    let mut host = EventLoopThread::new("iteration-test", None);
    let lp = host.start_loop().unwrap();

    let before = lp.iteration();
    let (tx, rx) = crossbeam_channel::bounded(1);
    lp.queue_in_loop(move || {
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(lp.iteration() > before || lp.iteration() >= 1);
}

#[test]
fn test_pool_round_robin_and_hash_affinity() {
    let lp = EventLoop::new().unwrap();
    let pool = EventLoopThreadPool::new(Arc::clone(&lp), "pool-test");
    pool.set_thread_num(3);

    let init_order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorded = init_order.clone();
    pool.start(Some(Arc::new(move |worker: &Arc<EventLoop>| {
        recorded.lock().push(Arc::as_ptr(worker) as usize);
    })))
    .unwrap();

    let workers = init_order.lock().clone();
    assert_eq!(workers.len(), 3);

    // Round-robin follows creation order, wrapping mod 3.
    for round in 0..2 {
        for expected in &workers {
            let got = Arc::as_ptr(&pool.get_next_loop()) as usize;
            assert_eq!(got, *expected, "round {round}");
        }
    }

    // Hash affinity is stable and indexes h mod 3.
    for hash in 0..9usize {
        let a = Arc::as_ptr(&pool.get_loop_for_hash(hash)) as usize;
        let b = Arc::as_ptr(&pool.get_loop_for_hash(hash)) as usize;
        assert_eq!(a, b);
        assert_eq!(a, workers[hash % 3]);
    }

    let all = pool.all_loops();
    assert_eq!(all.len(), 3);
}

#[test]
fn test_empty_pool_hands_out_the_base_loop() {
    let lp = EventLoop::new().unwrap();
    let pool = EventLoopThreadPool::new(Arc::clone(&lp), "empty-pool");

    let init_ran = Arc::new(AtomicUsize::new(0));
    let counter = init_ran.clone();
    let base = Arc::as_ptr(&lp) as usize;
    pool.start(Some(Arc::new(move |worker: &Arc<EventLoop>| {
        assert_eq!(Arc::as_ptr(worker) as usize, base);
        counter.fetch_add(1, Ordering::Relaxed);
    })))
    .unwrap();

    assert_eq!(init_ran.load(Ordering::Relaxed), 1);
    assert!(Arc::ptr_eq(&pool.get_next_loop(), &lp));
    assert!(Arc::ptr_eq(&pool.get_loop_for_hash(17), &lp));
    assert_eq!(pool.all_loops().len(), 1);
}
