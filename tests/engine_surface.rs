//! Integration coverage for the public engine surface that is portable
//! across targets; the completion-port paths themselves are exercised by
//! the Windows-only suites inside the crate.

use std::sync::Arc;
use std::time::Duration;
use winaio::op::{Operation, Poll, Timeout};
use winaio::pool::WorkerPool;
use winaio::timer::TimerQueue;
use winaio::EventSource;

#[test]
fn poll_batches_are_reported_unsupported() {
    let timeout = Operation::Timeout(Timeout {
        duration: Duration::from_millis(1),
    });
    let poll = Operation::Poll(Poll {
        socket: 0,
        events: 0,
    });

    assert!(winaio::is_supported([&timeout]));
    assert!(!winaio::is_supported([&timeout, &poll]));
}

#[cfg(not(windows))]
#[test]
fn driver_is_unsupported_off_windows() {
    let err = winaio::IocpDriver::new(16).expect_err("no completion ports here");
    assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);

    let err = unsafe { winaio::IocpDriver::immediate(&[]) }.expect_err("still unsupported");
    assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
}

#[test]
fn event_source_synchronizes_two_threads() {
    let source = Arc::new(EventSource::new());
    let consumer = {
        let source = Arc::clone(&source);
        std::thread::spawn(move || {
            source.wait();
            source.wait();
        })
    };

    source.notify();
    source.notify();
    consumer.join().expect("consumer panicked");
    assert!(!source.try_wait());
}

#[test]
fn worker_pool_round_trips_work() {
    let pool = WorkerPool::new(2, Duration::from_secs(5), "surface-test");
    let (tx, rx) = std::sync::mpsc::channel();

    for i in 0..8 {
        let tx = tx.clone();
        pool.spawn(move || {
            tx.send(i).expect("receiver alive");
        })
        .expect("spawn");
    }

    let mut seen: Vec<i32> = (0..8).map(|_| rx.recv().expect("job ran")).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..8).collect::<Vec<_>>());
    pool.shutdown();
}

#[test]
fn timer_queue_orders_user_words() {
    let mut timers = TimerQueue::new();
    let now = std::time::Instant::now();
    timers.arm(10, Duration::from_millis(5), now);
    timers.arm(20, Duration::from_millis(1), now);

    let mut fired = Vec::new();
    timers.expire(now + Duration::from_millis(10), |word| fired.push(word));
    assert_eq!(fired, vec![20, 10]);
    assert!(timers.disarm(10) == false, "already fired");
}
