//! Cooperative fiber scheduler.
//!
//! The scheduler owns every fiber's stack and saved context and drives
//! execution on the one OS thread that calls [`Scheduler::run`]. Scheduling
//! is FIFO and strictly cooperative: a fiber runs until it suspends, yields
//! or returns. Control moves between stacks only inside
//! [`context::weft_switch_context`], and the cardinal rule of this module is
//! that **no `RefCell` borrow is held across a switch**: every switch
//! helper computes raw context pointers under a short borrow, drops it, then
//! switches; bookkeeping resumes with fresh borrows on the other side.
//!
//! Cancellation is cooperative: interrupting a fiber makes its current (or
//! next) suspension point return [`WakeReason::Interrupted`], and the layers
//! above translate that into an `ECANCELED` result from the blocking call.

use crate::error::RuntimeError;
use crate::fiber::context::{weft_switch_context, FiberContext};
use crate::fiber::stack::{FiberStack, DEFAULT_STACK_SIZE};
use crate::poller::IoCondition;
use log::trace;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// Identity of a fiber. Ids are never reused within a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

/// Lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Queued for dispatch.
    Runnable,
    /// Currently executing (at most one per scheduler).
    Running,
    /// Parked at a suspension point, waiting for a wake.
    Suspended,
    /// Thunk returned; stack awaiting reclamation.
    Exited,
}

/// Why a suspended fiber was woken. Stored on the fiber by the waker and
/// returned from the suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Plain resume (event trigger, explicit `resume`).
    Resumed,
    /// A descriptor the fiber was watching became ready.
    Io(IoCondition),
    /// The deadline armed alongside the wait expired.
    TimedOut,
    /// The fiber was interrupted while parked.
    Interrupted,
}

/// Per-spawn knobs.
#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions {
    /// Usable stack bytes; 0 selects the scheduler default.
    pub stack_size: usize,
    /// Background fibers do not keep the composed loop alive.
    pub background: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            stack_size: 0,
            background: false,
        }
    }
}

struct Fiber {
    id: FiberId,
    state: FiberState,
    background: bool,
    // Field order: the context points into the stack; both die at reap time.
    context: FiberContext,
    stack: FiberStack,
    thunk: Option<Box<dyn FnOnce()>>,
    wake: WakeReason,
    interrupted: bool,
    core: *const RefCell<SchedCore>,
}

struct SchedCore {
    fibers: FxHashMap<FiberId, Box<Fiber>>,
    runnable: VecDeque<FiberId>,
    /// `None` while the outer (run-calling) context is executing.
    current: Option<FiberId>,
    main_context: FiberContext,
    /// Exited fiber whose stack the next execution context reclaims.
    dead: Option<FiberId>,
    /// Panic payload carried out of a fiber, re-raised on the outer context.
    pending_panic: Option<Box<dyn Any + Send>>,
    next_id: u64,
    foreground: usize,
    default_stack_size: usize,
}

/// Cheap-clone handle to a single-threaded fiber scheduler.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<RefCell<SchedCore>>,
}

impl Scheduler {
    /// Create a scheduler with the standard default stack size.
    pub fn new() -> Self {
        Self::with_default_stack_size(DEFAULT_STACK_SIZE)
    }

    /// Create a scheduler whose zero-size spawns get `default_stack_size`.
    pub fn with_default_stack_size(default_stack_size: usize) -> Self {
        Self {
            core: Rc::new(RefCell::new(SchedCore {
                fibers: FxHashMap::default(),
                runnable: VecDeque::new(),
                current: None,
                main_context: FiberContext::empty(),
                dead: None,
                pending_panic: None,
                next_id: 1,
                foreground: 0,
                default_stack_size,
            })),
        }
    }

    /// Spawn a foreground fiber with the default stack size.
    pub fn spawn<F: FnOnce() + 'static>(&self, thunk: F) -> Result<FiberId, RuntimeError> {
        self.spawn_with(SpawnOptions::default(), thunk)
    }

    /// Spawn a fiber. It is born runnable and first runs when dispatched.
    pub fn spawn_with<F: FnOnce() + 'static>(
        &self,
        options: SpawnOptions,
        thunk: F,
    ) -> Result<FiberId, RuntimeError> {
        let mut core = self.core.borrow_mut();
        let stack_size = if options.stack_size == 0 {
            core.default_stack_size
        } else {
            options.stack_size
        };
        let stack = FiberStack::allocate(stack_size)?;

        let id = FiberId(core.next_id);
        core.next_id += 1;

        let mut fiber = Box::new(Fiber {
            id,
            state: FiberState::Runnable,
            background: options.background,
            context: FiberContext::empty(),
            stack,
            thunk: Some(Box::new(thunk)),
            wake: WakeReason::Resumed,
            interrupted: false,
            core: Rc::as_ptr(&self.core),
        });
        fiber.context = unsafe {
            FiberContext::init(fiber.stack.top(), fiber_main, &mut *fiber as *mut Fiber as *mut c_void)
        };

        core.fibers.insert(id, fiber);
        core.runnable.push_back(id);
        if !options.background {
            core.foreground += 1;
        }
        trace!("spawned fiber {:?} (background: {})", id, options.background);
        Ok(id)
    }

    /// Id of the fiber executing right now, `None` on the outer context.
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.core.borrow().current
    }

    /// Count of live foreground fibers.
    pub fn foreground_fibers(&self) -> usize {
        self.core.borrow().foreground
    }

    /// Count of live fibers, foreground and background.
    pub fn fiber_count(&self) -> usize {
        let core = self.core.borrow();
        core.fibers.len() - usize::from(core.dead.is_some())
    }

    /// Dispatch runnable fibers FIFO until none remain, then return.
    /// On return no fiber is running.
    pub fn run(&self) {
        loop {
            let next = {
                let mut core = self.core.borrow_mut();
                debug_assert!(core.current.is_none(), "run() re-entered from a fiber");
                core.runnable.pop_front()
            };
            let Some(next) = next else { return };
            transfer(&self.core, None, Some(next));
            self.propagate_fiber_panic();
        }
    }

    /// Park the current fiber and hand control to the next runnable fiber
    /// (or back to the outer context). Returns the reason it was woken.
    pub fn suspend_current(&self) -> WakeReason {
        let current = {
            let mut core = self.core.borrow_mut();
            let id = core.current.expect("suspend_current outside a fiber");
            let fiber = core.fibers.get_mut(&id).expect("current fiber missing");
            if fiber.interrupted {
                fiber.interrupted = false;
                return WakeReason::Interrupted;
            }
            fiber.state = FiberState::Suspended;
            fiber.wake = WakeReason::Resumed;
            id
        };
        let next = self.core.borrow_mut().runnable.pop_front();
        transfer(&self.core, Some(current), next);

        let mut core = self.core.borrow_mut();
        let fiber = core.fibers.get_mut(&current).expect("resumed fiber missing");
        if fiber.interrupted {
            fiber.interrupted = false;
            return WakeReason::Interrupted;
        }
        std::mem::replace(&mut fiber.wake, WakeReason::Resumed)
    }

    /// Park a fiber that is not the current one. Runnable targets are pulled
    /// out of the queue; suspended targets are left as they are.
    pub fn suspend(&self, id: FiberId) {
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        debug_assert_ne!(core.current, Some(id), "use suspend_current for self-suspension");
        if let Some(fiber) = core.fibers.get_mut(&id) {
            if fiber.state == FiberState::Runnable {
                fiber.state = FiberState::Suspended;
                core.runnable.retain(|queued| *queued != id);
            }
        }
    }

    /// Make a suspended fiber runnable again. Idempotent: runnable and
    /// running targets are left untouched.
    pub fn resume(&self, id: FiberId) {
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        if let Some(fiber) = core.fibers.get_mut(&id) {
            if fiber.state == FiberState::Suspended {
                fiber.state = FiberState::Runnable;
                core.runnable.push_back(id);
            }
        }
    }

    /// Store a wake reason on a fiber and make it runnable. A reason stored
    /// later in the same dispatch sweep overwrites an earlier one.
    pub fn wake(&self, id: FiberId, reason: WakeReason) {
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        if let Some(fiber) = core.fibers.get_mut(&id) {
            match fiber.state {
                FiberState::Suspended => {
                    fiber.wake = reason;
                    fiber.state = FiberState::Runnable;
                    core.runnable.push_back(id);
                }
                FiberState::Runnable => fiber.wake = reason,
                FiberState::Running | FiberState::Exited => {}
            }
        }
    }

    /// Interrupt a fiber. The target's current (or next) suspension point
    /// returns [`WakeReason::Interrupted`]; a fiber that never ran exits
    /// without running its thunk. When the target is parked or queued,
    /// control transfers to it at once and the caller is re-queued behind
    /// it, so the target has observed the cancellation by the time this
    /// returns. Interrupting the current fiber only sets the pending flag.
    pub fn interrupt(&self, id: FiberId) {
        let switch_now = {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            let Some(fiber) = core.fibers.get_mut(&id) else { return };
            match fiber.state {
                FiberState::Exited => return,
                FiberState::Running => {
                    fiber.interrupted = true;
                    false
                }
                FiberState::Runnable => {
                    fiber.interrupted = true;
                    core.runnable.retain(|queued| *queued != id);
                    true
                }
                FiberState::Suspended => {
                    fiber.interrupted = true;
                    fiber.wake = WakeReason::Interrupted;
                    true
                }
            }
        };
        if !switch_now {
            return;
        }

        let prev = {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            let prev = core.current;
            if let Some(prev_id) = prev {
                let fiber = core.fibers.get_mut(&prev_id).expect("current fiber missing");
                fiber.state = FiberState::Runnable;
                core.runnable.push_back(prev_id);
            }
            prev
        };
        trace!("interrupting fiber {:?}", id);
        transfer(&self.core, prev, Some(id));
        self.propagate_fiber_panic();
    }

    /// Give up the processor to the next runnable fiber, re-queuing the
    /// current one at the tail. Returns `Interrupted` when a pending
    /// interrupt is consumed instead.
    pub fn yield_now(&self) -> WakeReason {
        let current = {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            let id = core.current.expect("yield_now outside a fiber");
            let fiber = core.fibers.get_mut(&id).expect("current fiber missing");
            if fiber.interrupted {
                fiber.interrupted = false;
                return WakeReason::Interrupted;
            }
            if core.runnable.is_empty() {
                return WakeReason::Resumed;
            }
            fiber.state = FiberState::Runnable;
            core.runnable.push_back(id);
            id
        };
        let next = self
            .core
            .borrow_mut()
            .runnable
            .pop_front()
            .expect("runnable checked non-empty");
        transfer(&self.core, Some(current), Some(next));
        self.consume_pending_interrupt(current)
    }

    /// Yield directly to a specific runnable fiber.
    pub fn yield_to(&self, id: FiberId) -> WakeReason {
        let current = {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            let current = core.current.expect("yield_to outside a fiber");
            if current == id {
                return WakeReason::Resumed;
            }
            let fiber = core.fibers.get_mut(&current).expect("current fiber missing");
            if fiber.interrupted {
                fiber.interrupted = false;
                return WakeReason::Interrupted;
            }
            match core.fibers.get(&id).map(|target| target.state) {
                Some(FiberState::Runnable) => {}
                _ => return WakeReason::Resumed,
            }
            core.runnable.retain(|queued| *queued != id);
            let fiber = core.fibers.get_mut(&current).expect("current fiber missing");
            fiber.state = FiberState::Runnable;
            core.runnable.push_back(current);
            current
        };
        transfer(&self.core, Some(current), Some(id));
        self.consume_pending_interrupt(current)
    }

    /// Interrupt every live fiber, newest first, and run them to exit.
    /// Must be called from the outer context. A fiber that swallows the
    /// cancellation and parks again is unrecoverable here.
    pub fn shutdown(&self) {
        let mut ids: Vec<FiberId> = {
            let core = self.core.borrow();
            debug_assert!(core.current.is_none(), "shutdown from inside a fiber");
            core.fibers
                .values()
                .filter(|fiber| fiber.state != FiberState::Exited)
                .map(|fiber| fiber.id)
                .collect()
        };
        ids.sort_unstable_by(|a, b| b.cmp(a));
        for id in ids {
            self.interrupt(id);
        }
        self.run();
        if self.fiber_count() > 0 {
            panic!("{} fiber(s) survived scheduler shutdown", self.fiber_count());
        }
    }

    fn consume_pending_interrupt(&self, id: FiberId) -> WakeReason {
        let mut core = self.core.borrow_mut();
        let fiber = core.fibers.get_mut(&id).expect("resumed fiber missing");
        if fiber.interrupted {
            fiber.interrupted = false;
            WakeReason::Interrupted
        } else {
            WakeReason::Resumed
        }
    }

    fn propagate_fiber_panic(&self) {
        let payload = self.core.borrow_mut().pending_panic.take();
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Hand control to `next` (`None` = outer context), saving the state of
/// `prev` (`None` = outer context). Returns when `prev` is resumed.
///
/// Callers set the queue/state of `prev` before calling; this helper marks
/// `next` running, updates `current`, and performs the switch with no
/// borrow held. The context pointers stay valid across map rehashes because
/// fibers are boxed.
fn transfer(core: &RefCell<SchedCore>, prev: Option<FiberId>, next: Option<FiberId>) {
    let (save, load) = {
        let mut core = core.borrow_mut();
        let core = &mut *core;
        let save: *mut FiberContext = match prev {
            Some(id) => &mut core.fibers.get_mut(&id).expect("prev fiber missing").context,
            None => &mut core.main_context,
        };
        if let Some(id) = next {
            let fiber = core.fibers.get_mut(&id).expect("next fiber missing");
            fiber.state = FiberState::Running;
        }
        core.current = next;
        let load: *const FiberContext = match next {
            Some(id) => &core.fibers.get(&id).expect("next fiber missing").context,
            None => &core.main_context,
        };
        (save, load)
    };
    unsafe { weft_switch_context(save, load) };
    reap_dead(core);
}

/// Reclaim the stack of a fiber that exited while some other context was
/// switched away. Never runs on the stack being reclaimed.
fn reap_dead(core: &RefCell<SchedCore>) {
    let dead = {
        let mut core = core.borrow_mut();
        core.dead.take().and_then(|id| core.fibers.remove(&id))
    };
    drop(dead);
}

/// First (and only) Rust frame of every fiber.
extern "C" fn fiber_main(arg: *mut c_void) -> ! {
    let fiber_ptr = arg as *mut Fiber;
    let (core, id) = unsafe { ((*fiber_ptr).core, (*fiber_ptr).id) };
    let core = unsafe { &*core };
    reap_dead(core);

    let thunk = {
        let mut state = core.borrow_mut();
        let fiber = state.fibers.get_mut(&id).expect("entered fiber missing");
        if fiber.interrupted {
            // Interrupted before it ever ran: exit without running the thunk.
            fiber.interrupted = false;
            None
        } else {
            fiber.thunk.take()
        }
    };

    if let Some(thunk) = thunk {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(thunk)) {
            core.borrow_mut().pending_panic = Some(payload);
        }
    }

    // Mark self dead and leave; the next context reclaims the stack.
    let next = {
        let mut state = core.borrow_mut();
        let had_panic = state.pending_panic.is_some();
        let fiber = state.fibers.get_mut(&id).expect("exiting fiber missing");
        fiber.state = FiberState::Exited;
        let background = fiber.background;
        state.dead = Some(id);
        if !background {
            state.foreground -= 1;
        }
        if had_panic {
            // Panics unwind on the outer context, bypassing the queue.
            None
        } else {
            state.runnable.pop_front()
        }
    };
    trace!("fiber {:?} exited", id);

    transfer(core, Some(id), next);
    unreachable!("exited fiber was resumed");
}
