//! Timer, sleep and cancellation behavior end to end.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use weft::EventLoop;

#[test]
fn test_delays_complete_in_deadline_order() {
    let event_loop = EventLoop::new().expect("loop");
    let order = Rc::new(RefCell::new(Vec::new()));

    for delay_ms in [30u64, 10, 20] {
        let event_loop_in = event_loop.clone();
        let order = order.clone();
        event_loop
            .spawn(move || {
                event_loop_in
                    .sleep(Duration::from_millis(delay_ms))
                    .expect("sleep");
                order.borrow_mut().push(delay_ms);
            })
            .expect("spawn");
    }

    event_loop.run();
    assert_eq!(*order.borrow(), vec![10, 20, 30]);
}

#[test]
fn test_sleep_takes_at_least_its_duration() {
    let event_loop = EventLoop::new().expect("loop");
    let started = Instant::now();
    let event_loop_in = event_loop.clone();
    event_loop
        .spawn(move || {
            event_loop_in.sleep(Duration::from_millis(40)).expect("sleep");
        })
        .expect("spawn");
    event_loop.run();
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[test]
fn test_interrupt_unblocks_long_sleep() {
    let event_loop = EventLoop::new().expect("loop");
    let outcome = Rc::new(RefCell::new(None));

    let sleeper_loop = event_loop.clone();
    let outcome_in = outcome.clone();
    let sleeper = event_loop
        .spawn(move || {
            let result = sleeper_loop.sleep(Duration::from_secs(10));
            *outcome_in.borrow_mut() = Some(result);
        })
        .expect("spawn sleeper");

    let canceller_loop = event_loop.clone();
    event_loop
        .spawn(move || {
            canceller_loop.sleep(Duration::from_millis(10)).expect("sleep");
            canceller_loop.interrupt(sleeper);
        })
        .expect("spawn canceller");

    let started = Instant::now();
    event_loop.run();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "cancellation must cut the 10s sleep short"
    );

    let result = outcome.borrow_mut().take().expect("sleeper finished");
    let error = result.expect_err("sleep reports cancellation");
    assert_eq!(error.raw_os_error(), Some(libc::ECANCELED));
}

#[test]
fn test_idle_pipe_read_times_out() {
    let event_loop = EventLoop::new().expect("loop");
    let observed = Rc::new(RefCell::new(None));

    let loop_in = event_loop.clone();
    let observed_in = observed.clone();
    event_loop
        .spawn(move || {
            let (read_end, write_end) = loop_in.pipe().expect("pipe");
            loop_in
                .set_read_timeout(read_end, Some(Duration::from_millis(50)))
                .expect("set timeout");

            let started = Instant::now();
            let mut buffer = [0u8; 16];
            let result = loop_in.read(read_end, &mut buffer);
            *observed_in.borrow_mut() = Some((result, started.elapsed()));

            loop_in.close(read_end).expect("close read end");
            loop_in.close(write_end).expect("close write end");
        })
        .expect("spawn");

    event_loop.run();
    let (result, elapsed) = observed.borrow_mut().take().expect("fiber finished");
    let error = result.expect_err("idle read must time out");
    assert_eq!(error.raw_os_error(), Some(libc::EAGAIN));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(200), "elapsed: {:?}", elapsed);
}

#[test]
fn test_zero_descriptor_poll_sleeps() {
    let event_loop = EventLoop::new().expect("loop");
    let loop_in = event_loop.clone();
    let started = Instant::now();
    event_loop
        .spawn(move || {
            let mut fds: [libc::pollfd; 0] = [];
            let count = loop_in.poll(&mut fds, 30).expect("poll");
            assert_eq!(count, 0);
        })
        .expect("spawn");
    event_loop.run();
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn test_interrupted_pause_returns_cancelled() {
    let event_loop = EventLoop::new().expect("loop");
    let outcome = Rc::new(RefCell::new(None));

    let pauser_loop = event_loop.clone();
    let outcome_in = outcome.clone();
    let pauser = event_loop
        .spawn(move || {
            *outcome_in.borrow_mut() = Some(pauser_loop.pause());
        })
        .expect("spawn pauser");

    let other_loop = event_loop.clone();
    event_loop
        .spawn(move || {
            other_loop.sleep(Duration::from_millis(5)).expect("sleep");
            other_loop.interrupt(pauser);
        })
        .expect("spawn");

    event_loop.run();
    let result = outcome.borrow_mut().take().expect("pauser finished");
    assert_eq!(
        result.expect_err("pause was interrupted").raw_os_error(),
        Some(libc::ECANCELED)
    );
}
