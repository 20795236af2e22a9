//! Fiber-blocking mutual exclusion.

use crate::fiber::Scheduler;
use crate::sync::Semaphore;
use std::io;

/// A mutex for fibers, expressed as a binary semaphore: locked at value 0,
/// unlocked at value 1. Unlocking an unlocked mutex parks the caller until
/// someone locks it, exactly like a second `up` on a full semaphore.
#[derive(Clone)]
pub struct Mutex {
    semaphore: Semaphore,
}

impl Mutex {
    /// Create an unlocked mutex bound to `scheduler`.
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            semaphore: Semaphore::new(scheduler, 1, 0, 1),
        }
    }

    /// Acquire, parking the calling fiber while another fiber holds it.
    pub fn lock(&self) -> io::Result<()> {
        self.semaphore.down()
    }

    /// Release, waking the next parked locker.
    pub fn unlock(&self) -> io::Result<()> {
        self.semaphore.up()
    }

    /// Acquire without parking; `false` if already locked.
    pub fn try_lock(&self) -> bool {
        self.semaphore.try_down()
    }

    /// Release without parking; `false` if already unlocked.
    pub fn try_unlock(&self) -> bool {
        self.semaphore.try_up()
    }

    /// Restore the unlocked state.
    pub fn reset(&self) {
        self.semaphore.reset()
    }
}
