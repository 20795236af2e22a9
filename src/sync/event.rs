//! One-shot latch for fiber wake-up.

use crate::error::cancelled;
use crate::fiber::{FiberId, Scheduler, WakeReason};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

struct EventCore {
    triggered: bool,
    waiters: Vec<FiberId>,
}

/// A latch a fiber can wait on until some other fiber (or a loop callback)
/// triggers it. Once triggered it stays set until [`Event::reset`].
#[derive(Clone)]
pub struct Event {
    scheduler: Scheduler,
    core: Rc<RefCell<EventCore>>,
}

impl Event {
    /// Create an untriggered event bound to `scheduler`.
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            core: Rc::new(RefCell::new(EventCore {
                triggered: false,
                waiters: Vec::new(),
            })),
        }
    }

    /// Park the calling fiber until the event is triggered. Returns at once
    /// if it already is. Fails with `ECANCELED` when the fiber is
    /// interrupted while parked.
    pub fn wait(&self) -> io::Result<()> {
        let own = self
            .scheduler
            .current_fiber()
            .expect("Event::wait outside a fiber");
        loop {
            if self.core.borrow().triggered {
                return Ok(());
            }
            self.core.borrow_mut().waiters.push(own);
            let reason = self.scheduler.suspend_current();
            self.core.borrow_mut().waiters.retain(|waiter| *waiter != own);
            if reason == WakeReason::Interrupted {
                return Err(cancelled());
            }
        }
    }

    /// Latch the event and wake every current waiter.
    pub fn trigger(&self) {
        let waiters = {
            let mut core = self.core.borrow_mut();
            core.triggered = true;
            std::mem::take(&mut core.waiters)
        };
        for waiter in waiters {
            self.scheduler.resume(waiter);
        }
    }

    /// Clear the latch.
    pub fn reset(&self) {
        self.core.borrow_mut().triggered = false;
    }

    /// Whether the latch is currently set.
    pub fn is_triggered(&self) -> bool {
        self.core.borrow().triggered
    }
}
