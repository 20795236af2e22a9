//! Counting semaphore with both bounds enforced.
//!
//! The value moves between `min_value` and `max_value`; `down` parks when
//! the value sits at the lower bound, `up` parks at the upper bound. Two
//! FIFO waiter lists (one per direction) mirror that symmetry: producers of
//! a bounded channel built on this semaphore park in the up-list, consumers
//! in the down-list.
//!
//! The cascade rules: a waiter that leaves a bound wakes the next waiter of
//! its own kind (so a chain of waiters drains one by one), and every
//! operation that steps the value off a bound wakes the head waiter of the
//! opposite kind, while stepping onto a bound re-parks the opposite head.

use crate::error::cancelled;
use crate::fiber::{FiberId, Scheduler, WakeReason};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

struct SemaphoreCore {
    value: i64,
    down_waiters: VecDeque<FiberId>,
    up_waiters: VecDeque<FiberId>,
}

/// Fiber-blocking counting semaphore.
#[derive(Clone)]
pub struct Semaphore {
    scheduler: Scheduler,
    initial_value: i64,
    min_value: i64,
    max_value: i64,
    core: Rc<RefCell<SemaphoreCore>>,
}

impl Semaphore {
    /// Create a semaphore with `initial_value` in `[min_value, max_value]`.
    pub fn new(scheduler: Scheduler, initial_value: i64, min_value: i64, max_value: i64) -> Self {
        assert!(min_value <= initial_value && initial_value <= max_value);
        Self {
            scheduler,
            initial_value,
            min_value,
            max_value,
            core: Rc::new(RefCell::new(SemaphoreCore {
                value: initial_value,
                down_waiters: VecDeque::new(),
                up_waiters: VecDeque::new(),
            })),
        }
    }

    /// Current value.
    pub fn value(&self) -> i64 {
        self.core.borrow().value
    }

    /// Restore the initial value, transferring waiter wake-ups accordingly.
    pub fn reset(&self) {
        let value = self.core.borrow().value;
        if value == self.initial_value {
            return;
        }
        if value == self.min_value {
            self.wake_next_down_waiter();
        } else if value == self.max_value {
            self.wake_next_up_waiter();
        }
        if self.initial_value == self.min_value {
            self.park_head_down_waiter();
        } else if self.initial_value == self.max_value {
            self.park_head_up_waiter();
        }
        self.core.borrow_mut().value = self.initial_value;
    }

    /// Decrement, parking while the value sits at the lower bound.
    pub fn down(&self) -> io::Result<()> {
        let at_min = self.core.borrow().value == self.min_value;
        if at_min {
            self.wait_in_down_list()?;
            let value = {
                let mut core = self.core.borrow_mut();
                core.value -= 1;
                core.value
            };
            if value > self.min_value {
                // More room below: pass the wake along the chain.
                self.wake_next_down_waiter();
            }
        } else {
            let value = {
                let mut core = self.core.borrow_mut();
                core.value -= 1;
                core.value
            };
            if value == self.min_value {
                self.park_head_down_waiter();
            }
        }
        if self.core.borrow().value == self.max_value - 1 {
            self.wake_next_up_waiter();
        }
        Ok(())
    }

    /// Increment, parking while the value sits at the upper bound.
    pub fn up(&self) -> io::Result<()> {
        let at_max = self.core.borrow().value == self.max_value;
        if at_max {
            self.wait_in_up_list()?;
            let value = {
                let mut core = self.core.borrow_mut();
                core.value += 1;
                core.value
            };
            if value < self.max_value {
                self.wake_next_up_waiter();
            }
        } else {
            let value = {
                let mut core = self.core.borrow_mut();
                core.value += 1;
                core.value
            };
            if value == self.max_value {
                self.park_head_up_waiter();
            }
        }
        if self.core.borrow().value == self.min_value + 1 {
            self.wake_next_down_waiter();
        }
        Ok(())
    }

    /// Decrement without parking; `false` when the value is at the bound.
    pub fn try_down(&self) -> bool {
        {
            let mut core = self.core.borrow_mut();
            if core.value == self.min_value {
                return false;
            }
            core.value -= 1;
        }
        if self.core.borrow().value == self.min_value {
            self.park_head_down_waiter();
        }
        if self.core.borrow().value == self.max_value - 1 {
            self.wake_next_up_waiter();
        }
        true
    }

    /// Increment without parking; `false` when the value is at the bound.
    pub fn try_up(&self) -> bool {
        {
            let mut core = self.core.borrow_mut();
            if core.value == self.max_value {
                return false;
            }
            core.value += 1;
        }
        if self.core.borrow().value == self.max_value {
            self.park_head_up_waiter();
        }
        if self.core.borrow().value == self.min_value + 1 {
            self.wake_next_down_waiter();
        }
        true
    }

    fn wait_in_down_list(&self) -> io::Result<()> {
        let own = self
            .scheduler
            .current_fiber()
            .expect("semaphore used outside a fiber");
        self.core.borrow_mut().down_waiters.push_back(own);
        let reason = self.scheduler.suspend_current();
        self.core
            .borrow_mut()
            .down_waiters
            .retain(|waiter| *waiter != own);
        if reason == WakeReason::Interrupted {
            return Err(cancelled());
        }
        Ok(())
    }

    fn wait_in_up_list(&self) -> io::Result<()> {
        let own = self
            .scheduler
            .current_fiber()
            .expect("semaphore used outside a fiber");
        self.core.borrow_mut().up_waiters.push_back(own);
        let reason = self.scheduler.suspend_current();
        self.core
            .borrow_mut()
            .up_waiters
            .retain(|waiter| *waiter != own);
        if reason == WakeReason::Interrupted {
            return Err(cancelled());
        }
        Ok(())
    }

    fn wake_next_down_waiter(&self) {
        let head = self.core.borrow().down_waiters.front().copied();
        if let Some(waiter) = head {
            self.scheduler.resume(waiter);
        }
    }

    fn park_head_down_waiter(&self) {
        let head = self.core.borrow().down_waiters.front().copied();
        if let Some(waiter) = head {
            self.scheduler.suspend(waiter);
        }
    }

    fn wake_next_up_waiter(&self) {
        let head = self.core.borrow().up_waiters.front().copied();
        if let Some(waiter) = head {
            self.scheduler.resume(waiter);
        }
    }

    fn park_head_up_waiter(&self) {
        let head = self.core.borrow().up_waiters.front().copied();
        if let Some(waiter) = head {
            self.scheduler.suspend(waiter);
        }
    }
}
