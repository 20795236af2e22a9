//! weft: a stackful cooperative I/O runtime
//!
//! This crate lets straight-line, blocking-style code run against network
//! and file descriptors while a single OS thread multiplexes many such
//! flows over nonblocking syscalls. It provides:
//! - Fiber scheduler (stackful cooperative tasks on one thread)
//! - Readiness poller (epoll, per-descriptor watcher aggregation)
//! - Timer clock (monotonic-ms deadline heap)
//! - Blocking-work offload (worker threads + eventfd completion)
//! - `EventLoop`: a POSIX-shaped façade composing the above
//!
//! Fibers never migrate across OS threads and are never preempted; they
//! yield only at I/O points, timer waits and explicit yields.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![cfg(target_os = "linux")]

pub mod bridge;
pub mod clock;
pub mod error;
pub mod event_loop;
pub mod fiber;
pub mod heap;
pub mod net;
pub mod offload;
pub mod poller;
pub mod slab;
pub mod sync;

pub use bridge::Async;
pub use clock::{IoClock, TimerId};
pub use error::RuntimeError;
pub use event_loop::EventLoop;
pub use fiber::{FiberId, Scheduler, SpawnOptions, WakeReason};
pub use net::TcpSocket;
pub use offload::{PoolTask, ThreadPool};
pub use poller::{IoCondition, IoPoller, WatcherId};
pub use sync::{Event, Mutex, Semaphore};
