//! Worker-thread pool for genuinely blocking syscalls.
//!
//! The pool is the only piece of the runtime that crosses OS threads. The
//! shared surface is deliberately small: one mutex around the pending
//! queue, one around the completed list, a condvar for worker wake-up, and
//! an eventfd the workers bump after publishing a completion so the loop
//! thread can sleep in epoll and still learn about finished tasks.
//!
//! A task's completion is published with a release store on its state and
//! read with acquire loads; the loop thread never touches a pending task's
//! payload, and a worker never touches a task after the release.

use crate::error::{errno, RuntimeError};
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const STATE_PENDING: u8 = 0;
const STATE_COMPLETED: u8 = 1;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of blocking work handed to the pool.
pub struct PoolTask {
    id: u64,
    state: AtomicU8,
    thunk: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PoolTask {
    /// Wrap a thunk for submission.
    pub fn new<F: FnOnce() + Send + 'static>(thunk: F) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(STATE_PENDING),
            thunk: Mutex::new(Some(Box::new(thunk))),
            panic: Mutex::new(None),
        })
    }

    /// Stable id of this task.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the worker has published completion.
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_COMPLETED
    }

    /// Re-raise the panic the task died with, if any. Called by the
    /// submitter after completion.
    pub fn check(&self) {
        debug_assert!(self.is_completed());
        if let Some(payload) = self.panic.lock().take() {
            std::panic::resume_unwind(payload);
        }
    }
}

struct Pending {
    queue: std::collections::VecDeque<Arc<PoolTask>>,
    closed: bool,
}

struct PoolShared {
    pending: Mutex<Pending>,
    work_available: Condvar,
    completed: Mutex<Vec<Arc<PoolTask>>>,
    event_fd: RawFd,
}

/// Fixed-size pool of OS worker threads.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Start a pool with `threads` workers (0 means one per CPU).
    pub fn new(threads: usize) -> Result<Self, RuntimeError> {
        let threads = if threads == 0 {
            thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            threads
        };

        let event_fd = unsafe { libc::eventfd(0, 0) };
        if event_fd < 0 {
            return Err(RuntimeError::sys("eventfd"));
        }

        let shared = Arc::new(PoolShared {
            pending: Mutex::new(Pending {
                queue: std::collections::VecDeque::new(),
                closed: false,
            }),
            work_available: Condvar::new(),
            completed: Mutex::new(Vec::new()),
            event_fd,
        });

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{}", index))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn pool worker thread");
            workers.push(handle);
        }
        debug!("thread pool started with {} worker(s)", threads);

        Ok(Self { shared, workers })
    }

    /// The eventfd workers bump once per published completion. The loop
    /// reads it to learn how many completions to drain.
    pub fn event_fd(&self) -> RawFd {
        self.shared.event_fd
    }

    /// Queue a task for a worker. Safe from any thread.
    pub fn submit(&self, task: Arc<PoolTask>) {
        let mut pending = self.shared.pending.lock();
        debug_assert!(!pending.closed, "submit after shutdown");
        trace!("submitting pool task {}", task.id());
        pending.queue.push_back(task);
        self.shared.work_available.notify_one();
    }

    /// Take every published completion, invoking `callback` on each.
    pub fn drain_completed<F: FnMut(Arc<PoolTask>)>(&self, mut callback: F) {
        let completed = std::mem::take(&mut *self.shared.completed.lock());
        for task in completed {
            callback(task);
        }
    }

    /// Withdraw a task. Returns `true` when the task ran to completion
    /// (its completion record is consumed here), `false` when it was pulled
    /// from the queue before any worker picked it up.
    ///
    /// A task currently executing is waited for: completion publication is
    /// a store-release the worker performs promptly after the thunk.
    pub fn cancel(&self, task: &Arc<PoolTask>) -> bool {
        {
            let mut pending = self.shared.pending.lock();
            let before = pending.queue.len();
            pending.queue.retain(|queued| !Arc::ptr_eq(queued, task));
            if pending.queue.len() != before {
                return false;
            }
        }

        while !task.is_completed() {
            thread::yield_now();
        }
        self.shared
            .completed
            .lock()
            .retain(|queued| !Arc::ptr_eq(queued, task));
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut pending = self.shared.pending.lock();
            pending.closed = true;
            self.shared.work_available.notify_all();
        }
        for handle in self.workers.drain(..) {
            handle.join().expect("failed to join pool worker thread");
        }
        debug!("thread pool stopped");

        let rc = unsafe { libc::close(self.shared.event_fd) };
        if rc < 0 && errno() != libc::EINTR {
            panic!("close of pool eventfd failed: {}", io::Error::last_os_error());
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut pending = shared.pending.lock();
            loop {
                if let Some(task) = pending.queue.pop_front() {
                    break task;
                }
                if pending.closed {
                    return;
                }
                shared.work_available.wait(&mut pending);
            }
        };

        let thunk = task.thunk.lock().take().expect("pool task ran twice");
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(thunk)) {
            *task.panic.lock() = Some(payload);
        }

        shared.completed.lock().push(task.clone());
        task.state.store(STATE_COMPLETED, Ordering::Release);
        signal_completion(shared.event_fd);
    }
}

/// Bump the eventfd counter; the only failure that is retried is `EINTR`.
fn signal_completion(event_fd: RawFd) {
    let one: u64 = 1;
    loop {
        let rc = unsafe {
            libc::write(
                event_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc >= 0 {
            return;
        }
        if errno() != libc::EINTR {
            panic!("eventfd write failed: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn read_eventfd(fd: RawFd) -> u64 {
        let mut value: u64 = 0;
        let rc = unsafe {
            libc::read(
                fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(rc as usize, std::mem::size_of::<u64>());
        value
    }

    #[test]
    fn test_tasks_complete_and_signal() {
        let pool = ThreadPool::new(3).expect("pool");
        let hits = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let hits = hits.clone();
            let task = PoolTask::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
            pool.submit(task.clone());
            tasks.push(task);
        }

        let mut drained = 0;
        while drained < 5 {
            read_eventfd(pool.event_fd());
            pool.drain_completed(|task| {
                assert!(task.is_completed());
                task.check();
                drained += 1;
            });
        }
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_panicking_task_reports_completion_and_rethrows() {
        let pool = ThreadPool::new(1).expect("pool");
        let task = PoolTask::new(|| panic!("task boom"));
        pool.submit(task.clone());

        read_eventfd(pool.event_fd());
        let mut seen = None;
        pool.drain_completed(|completed| seen = Some(completed));
        let completed = seen.expect("one completion");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| completed.check()));
        let payload = result.expect_err("check re-raises the stored panic");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"task boom"));
    }

    #[test]
    fn test_cancel_before_pickup() {
        // A single worker stuck on a slow task cannot pick up the second
        // one, so cancelling the second finds it still queued.
        let pool = ThreadPool::new(1).expect("pool");
        let picked_up = Arc::new(AtomicUsize::new(0));
        let picked_up_in = picked_up.clone();
        let slow = PoolTask::new(move || {
            picked_up_in.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
        });
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in = ran.clone();
        let queued = PoolTask::new(move || {
            ran_in.fetch_add(1, Ordering::SeqCst);
        });

        pool.submit(slow.clone());
        while picked_up.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        pool.submit(queued.clone());
        assert!(!pool.cancel(&queued), "still queued, must not have run");

        assert!(pool.cancel(&slow), "already picked up, waits for completion");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_drains_queue_first() {
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2).expect("pool");
            for _ in 0..8 {
                let hits = hits.clone();
                pool.submit(PoolTask::new(move || {
                    thread::sleep(Duration::from_millis(5));
                    hits.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }
}
