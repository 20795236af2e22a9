//! Blocking-work offload through the bridge: fibers keep running while a
//! worker blocks, results come back to the submitter, cancellation
//! withdraws queued work.

use std::cell::Cell;
use std::net::ToSocketAddrs;
use std::rc::Rc;
use std::thread;
use std::time::Duration;
use weft::{Async, EventLoop};

#[test]
fn test_other_fibers_progress_during_blocking_call() {
    let event_loop = EventLoop::new().expect("loop");
    let bridge = Rc::new(Async::new(&event_loop, 1).expect("bridge"));

    let ticks = Rc::new(Cell::new(0u32));
    let submitter_done = Rc::new(Cell::new(false));

    // A fiber that spins cooperatively while the blocking call is out.
    let ticker_loop = event_loop.clone();
    let ticks_in = ticks.clone();
    let done_in = submitter_done.clone();
    event_loop
        .spawn(move || {
            while !done_in.get() {
                ticks_in.set(ticks_in.get() + 1);
                ticker_loop.sleep(Duration::from_millis(1)).expect("sleep");
            }
        })
        .expect("spawn ticker");

    let bridge_in = bridge.clone();
    let done_out = submitter_done.clone();
    event_loop
        .spawn(move || {
            let value = bridge_in
                .execute(|| {
                    thread::sleep(Duration::from_millis(100));
                    1234
                })
                .expect("execute");
            assert_eq!(value, 1234);
            done_out.set(true);
        })
        .expect("spawn submitter");

    event_loop.run();
    assert!(
        ticks.get() >= 20,
        "fibers must keep running while the worker blocks (ticks: {})",
        ticks.get()
    );
    drop(bridge);
}

#[test]
fn test_name_resolution_offload() {
    let event_loop = EventLoop::new().expect("loop");
    let bridge = Rc::new(Async::new(&event_loop, 2).expect("bridge"));

    let bridge_in = bridge.clone();
    event_loop
        .spawn(move || {
            let addresses = bridge_in
                .execute(|| {
                    "localhost:80"
                        .to_socket_addrs()
                        .map(|addrs| addrs.collect::<Vec<_>>())
                })
                .expect("execute")
                .expect("resolution");
            assert!(!addresses.is_empty());
            assert!(addresses.iter().all(|addr| addr.port() == 80));
        })
        .expect("spawn");

    event_loop.run();
    drop(bridge);
}

#[test]
fn test_interrupt_withdraws_queued_task() {
    let event_loop = EventLoop::new().expect("loop");
    // One worker, so a second task stays queued while the first blocks.
    let bridge = Rc::new(Async::new(&event_loop, 1).expect("bridge"));

    let blocker_bridge = bridge.clone();
    event_loop
        .spawn(move || {
            blocker_bridge
                .execute(|| thread::sleep(Duration::from_millis(150)))
                .expect("blocking execute");
        })
        .expect("spawn blocker");

    let cancelled_result = Rc::new(Cell::new(None));
    let submitter_bridge = bridge.clone();
    let result_in = cancelled_result.clone();
    let submitter = event_loop
        .spawn(move || {
            let result = submitter_bridge.execute(|| 99);
            result_in.set(Some(result.map_err(|error| error.raw_os_error())));
        })
        .expect("spawn submitter");

    let canceller_loop = event_loop.clone();
    event_loop
        .spawn(move || {
            canceller_loop.sleep(Duration::from_millis(20)).expect("sleep");
            canceller_loop.interrupt(submitter);
        })
        .expect("spawn canceller");

    event_loop.run();
    assert_eq!(
        cancelled_result.take().expect("submitter finished"),
        Err(Some(libc::ECANCELED))
    );
    drop(bridge);
}

#[test]
fn test_many_tasks_round_robin() {
    let event_loop = EventLoop::new().expect("loop");
    let bridge = Rc::new(Async::new(&event_loop, 3).expect("bridge"));

    let total = Rc::new(Cell::new(0u64));
    for index in 0..12u64 {
        let bridge_in = bridge.clone();
        let total_in = total.clone();
        event_loop
            .spawn(move || {
                let square = bridge_in.execute(move || index * index).expect("execute");
                total_in.set(total_in.get() + square);
            })
            .expect("spawn");
    }

    event_loop.run();
    let expected: u64 = (0..12u64).map(|index| index * index).sum();
    assert_eq!(total.get(), expected);
    drop(bridge);
}
