//! Stackful cooperative fibers and their single-thread scheduler.

pub mod context;
pub mod scheduler;
pub mod stack;

pub use scheduler::{FiberId, FiberState, Scheduler, SpawnOptions, WakeReason};
pub use stack::DEFAULT_STACK_SIZE;
