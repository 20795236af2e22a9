//! Blocking-work bridge between fibers and the thread pool.
//!
//! A fiber that must run a genuinely blocking syscall (name resolution, a
//! blocking `open` on a network filesystem) hands it to [`Async`]: the
//! thunk runs on a pool worker while the submitting fiber parks on an
//! [`Event`]. A background trigger fiber owns the pool's eventfd through
//! the loop (reading it suspends cooperatively like any other descriptor)
//! and fires the right submitter's event for each drained completion.

use crate::error::cancelled;
use crate::event_loop::EventLoop;
use crate::fiber::{FiberId, SpawnOptions};
use crate::offload::{PoolTask, ThreadPool};
use crate::sync::Event;
use crate::RuntimeError;
use log::debug;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;

struct BridgeCore {
    /// Submitters parked per task id, woken by the trigger fiber.
    waiters: RefCell<FxHashMap<u64, Event>>,
}

/// Blocking-work offload facility bound to one [`EventLoop`].
pub struct Async {
    event_loop: EventLoop,
    pool: Arc<ThreadPool>,
    core: Rc<BridgeCore>,
    trigger: FiberId,
}

impl Async {
    /// Start a pool of `threads` workers (0 means one per CPU) and the
    /// trigger fiber that dispatches completions back to submitters.
    pub fn new(event_loop: &EventLoop, threads: usize) -> Result<Self, RuntimeError> {
        let pool = Arc::new(ThreadPool::new(threads)?);
        event_loop.register_fd(pool.event_fd())?;

        let core = Rc::new(BridgeCore {
            waiters: RefCell::new(FxHashMap::default()),
        });

        let trigger = {
            let loop_handle = event_loop.clone();
            let pool_handle = pool.clone();
            let core_handle = core.clone();
            let spawned = event_loop.spawn_with(
                SpawnOptions {
                    stack_size: 0,
                    background: true,
                },
                move || trigger_loop(&loop_handle, &pool_handle, &core_handle),
            );
            match spawned {
                Ok(fiber) => fiber,
                Err(error) => {
                    event_loop
                        .unregister_fd(pool.event_fd())
                        .expect("rollback of eventfd registration failed");
                    return Err(error);
                }
            }
        };

        Ok(Self {
            event_loop: event_loop.clone(),
            pool,
            core,
            trigger,
        })
    }

    /// Run `work` on a pool worker, parking the calling fiber until the
    /// result is back. A panic inside `work` is re-raised here. When the
    /// fiber is interrupted while parked, the task is withdrawn: if it
    /// never ran the call fails with `ECANCELED`; if it completed anyway
    /// the result is returned and the interrupt re-flagged.
    pub fn execute<R, F>(&self, work: F) -> io::Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let result = Arc::new(parking_lot::Mutex::new(None));
        let result_slot = result.clone();
        let task = PoolTask::new(move || {
            *result_slot.lock() = Some(work());
        });

        let event = self.event_loop.make_event();
        self.core
            .waiters
            .borrow_mut()
            .insert(task.id(), event.clone());
        self.pool.submit(task.clone());

        match event.wait() {
            Ok(()) => {}
            Err(error) => {
                debug_assert!(error.raw_os_error() == Some(libc::ECANCELED));
                self.core.waiters.borrow_mut().remove(&task.id());
                let completed = self.pool.cancel(&task);
                if !completed {
                    return Err(cancelled());
                }
                // The work finished despite the interrupt: deliver the
                // result and leave the cancellation pending for the next
                // blocking call.
                let own = self
                    .event_loop
                    .current_fiber()
                    .expect("execute outside a fiber");
                self.event_loop.interrupt(own);
            }
        }

        task.check();
        let value = result.lock().take().expect("completed task left no result");
        Ok(value)
    }

    /// The number of submitters currently parked.
    pub fn pending_tasks(&self) -> usize {
        self.core.waiters.borrow().len()
    }
}

impl Drop for Async {
    fn drop(&mut self) {
        debug_assert!(
            self.core.waiters.borrow().is_empty(),
            "Async dropped with submitters still parked"
        );
        // Synchronous: the trigger fiber has exited its read and released
        // its watcher by the time interrupt returns.
        self.event_loop.interrupt(self.trigger);
        self.event_loop
            .unregister_fd(self.pool.event_fd())
            .expect("release of pool eventfd failed");
        debug!("async bridge stopped");
        // The pool itself joins its workers when the Arc drops.
    }
}

fn trigger_loop(event_loop: &EventLoop, pool: &ThreadPool, core: &BridgeCore) {
    loop {
        let mut counter = [0u8; 8];
        match event_loop.read(pool.event_fd(), &mut counter) {
            Ok(read) => debug_assert_eq!(read, counter.len()),
            Err(error) if error.raw_os_error() == Some(libc::ECANCELED) => return,
            Err(error) => panic!("eventfd read failed: {}", error),
        }

        pool.drain_completed(|task| {
            if let Some(event) = core.waiters.borrow_mut().remove(&task.id()) {
                event.trigger();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    #[test]
    fn test_bridge_starts_and_stops() {
        let event_loop = EventLoop::new().expect("loop");
        let bridge = Async::new(&event_loop, 2).expect("bridge");
        assert_eq!(bridge.pending_tasks(), 0);
        drop(bridge);
        // The eventfd was released and the trigger fiber exited.
        assert_eq!(event_loop.scheduler().fiber_count(), 0);
    }

    #[test]
    fn test_execute_delivers_result() {
        let event_loop = EventLoop::new().expect("loop");
        let bridge = Rc::new(Async::new(&event_loop, 1).expect("bridge"));

        let outcome = Rc::new(RefCell::new(None));
        let outcome_in = outcome.clone();
        let bridge_in = bridge.clone();
        event_loop
            .spawn(move || {
                let value = bridge_in.execute(|| 6 * 7).expect("execute");
                *outcome_in.borrow_mut() = Some(value);
            })
            .expect("spawn");

        event_loop.run();
        assert_eq!(*outcome.borrow(), Some(42));
        drop(bridge);
    }

    #[test]
    fn test_execute_propagates_worker_panic() {
        let event_loop = EventLoop::new().expect("loop");
        let bridge = Rc::new(Async::new(&event_loop, 1).expect("bridge"));

        let bridge_in = bridge.clone();
        event_loop
            .spawn(move || {
                let _ = bridge_in.execute(|| -> () { panic!("worker boom") });
            })
            .expect("spawn");

        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| event_loop.run()));
        let payload = result.expect_err("panic crosses the bridge");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"worker boom"));
        drop(bridge);
    }
}
