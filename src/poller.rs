//! Descriptor readiness demultiplexer over epoll.
//!
//! Each registered descriptor carries an `IoContext`: the aggregate
//! condition set the kernel is watching, the watchers armed on it, and a
//! caller-defined tag (`T`). Arming and disarming watchers only marks the
//! context dirty; the kernel registration is reconciled lazily right before
//! the next blocking wait, so a burst of arm/disarm pairs between two polls
//! costs one `epoll_ctl` at most.
//!
//! Registration is edge-triggered. That is sound here because every
//! consumer retries its syscall until `EAGAIN` before re-arming, so a new
//! edge is always possible when a watcher is waiting for one.

use crate::clock::IoClock;
use crate::error::{errno, RuntimeError};
use crate::fiber::FiberId;
use crate::slab::{Slab, SlabKey};
use bitflags::bitflags;
use log::{debug, trace};
use rustc_hash::FxHashMap;
use std::io;
use std::os::fd::RawFd;

bitflags! {
    /// Kernel readiness conditions.
    ///
    /// `ERR` and `HUP` are reported whenever the kernel signals them, even
    /// if a watcher did not ask for them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoCondition: u32 {
        /// Readable.
        const IN = libc::EPOLLIN as u32;
        /// Writable.
        const OUT = libc::EPOLLOUT as u32;
        /// Peer shut down its writing half.
        const RDHUP = libc::EPOLLRDHUP as u32;
        /// Exceptional condition (urgent data).
        const PRI = libc::EPOLLPRI as u32;
        /// Error (always reported).
        const ERR = libc::EPOLLERR as u32;
        /// Hang-up (always reported).
        const HUP = libc::EPOLLHUP as u32;
    }
}

/// The conditions a watcher can subscribe to (and that interest counting
/// tracks); `ERR`/`HUP` ride along implicitly.
const WATCHABLE: [IoCondition; 4] = [
    IoCondition::IN,
    IoCondition::OUT,
    IoCondition::RDHUP,
    IoCondition::PRI,
];

/// Handle to an armed watcher.
pub type WatcherId = SlabKey;

/// A single-shot interest record: which fiber to wake when `fd` reports a
/// condition in `conditions`.
#[derive(Debug, Clone, Copy)]
pub struct Watcher {
    /// Watched descriptor.
    pub fd: RawFd,
    /// Requested conditions plus the implicit `ERR | HUP`.
    pub conditions: IoCondition,
    /// Fiber to wake on firing.
    pub fiber: FiberId,
}

struct IoContext<T> {
    /// Conditions currently registered with the kernel.
    registered: IoCondition,
    /// Conditions the armed watchers collectively want.
    wanted: IoCondition,
    dirty: bool,
    watchers: Vec<WatcherId>,
    /// Armed watcher count per entry of `WATCHABLE`.
    watcher_counts: [usize; WATCHABLE.len()],
    tag: T,
}

/// Readiness poller. `T` is the per-descriptor tag the composed loop uses
/// to remember file options.
pub struct IoPoller<T> {
    epoll_fd: RawFd,
    contexts: FxHashMap<RawFd, IoContext<T>>,
    watchers: Slab<Watcher>,
    /// Contexts whose `wanted` set changed since the last flush.
    dirty: Vec<RawFd>,
    events: Vec<libc::epoll_event>,
}

impl<T> IoPoller<T> {
    /// Create a poller with its own epoll instance.
    pub fn new() -> Result<Self, RuntimeError> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(RuntimeError::sys("epoll_create1"));
        }
        Ok(Self {
            epoll_fd,
            contexts: FxHashMap::default(),
            watchers: Slab::new(),
            dirty: Vec::new(),
            events: vec![unsafe { std::mem::zeroed() }; 64],
        })
    }

    /// Register a descriptor with an empty interest set.
    pub fn create_context(&mut self, fd: RawFd, tag: T) {
        debug_assert!(fd >= 0);
        debug_assert!(!self.context_exists(fd), "context already exists for fd {}", fd);
        trace!("creating io context for fd {}", fd);
        self.contexts.insert(
            fd,
            IoContext {
                registered: IoCondition::empty(),
                wanted: IoCondition::empty(),
                dirty: false,
                watchers: Vec::new(),
                watcher_counts: [0; WATCHABLE.len()],
                tag,
            },
        );
    }

    /// Deregister a descriptor, returning its tag.
    ///
    /// Callers must remove armed watchers first; a context destroyed with
    /// watchers still armed leaves them orphaned (debug builds assert).
    pub fn destroy_context(&mut self, fd: RawFd) -> T {
        let context = self
            .contexts
            .remove(&fd)
            .expect("destroying a context that does not exist");
        debug_assert!(
            context.watchers.is_empty(),
            "context for fd {} destroyed with {} armed watcher(s)",
            fd,
            context.watchers.len()
        );
        trace!("destroying io context for fd {}", fd);

        if !context.registered.is_empty() {
            let rc = unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if rc < 0 {
                panic!(
                    "epoll_ctl(EPOLL_CTL_DEL) failed for fd {}: {}",
                    fd,
                    io::Error::last_os_error()
                );
            }
        }
        if context.dirty {
            self.dirty.retain(|dirty_fd| *dirty_fd != fd);
        }
        context.tag
    }

    /// Whether a context exists for `fd`.
    pub fn context_exists(&self, fd: RawFd) -> bool {
        self.contexts.contains_key(&fd)
    }

    /// Borrow the tag stored on the context of `fd`.
    pub fn tag(&self, fd: RawFd) -> Option<&T> {
        self.contexts.get(&fd).map(|context| &context.tag)
    }

    /// Mutably borrow the tag stored on the context of `fd`.
    pub fn tag_mut(&mut self, fd: RawFd) -> Option<&mut T> {
        self.contexts.get_mut(&fd).map(|context| &mut context.tag)
    }

    /// Arm a watcher for `conditions` on `fd`. The descriptor must have a
    /// context. `ERR` and `HUP` are added to the subscription implicitly.
    pub fn add_watcher(&mut self, fd: RawFd, conditions: IoCondition, fiber: FiberId) -> WatcherId {
        let context = self
            .contexts
            .get_mut(&fd)
            .expect("arming a watcher on an unregistered descriptor");
        let id = self.watchers.insert(Watcher {
            fd,
            conditions: conditions | IoCondition::ERR | IoCondition::HUP,
            fiber,
        });
        context.watchers.push(id);

        let mut widened = false;
        for (slot, condition) in WATCHABLE.iter().enumerate() {
            if conditions.contains(*condition) {
                context.watcher_counts[slot] += 1;
                if context.watcher_counts[slot] == 1 {
                    context.wanted |= *condition;
                    widened = true;
                }
            }
        }
        if widened && !context.dirty {
            context.dirty = true;
            self.dirty.push(fd);
        }
        id
    }

    /// Disarm a watcher. Returns `false` when the watcher already fired or
    /// was removed (stale handles are safely rejected).
    pub fn remove_watcher(&mut self, id: WatcherId) -> bool {
        let Some(watcher) = self.watchers.remove(id) else {
            return false;
        };
        let context = self
            .contexts
            .get_mut(&watcher.fd)
            .expect("armed watcher on a destroyed context");
        context.watchers.retain(|armed| *armed != id);

        let mut narrowed = false;
        for (slot, condition) in WATCHABLE.iter().enumerate() {
            if watcher.conditions.contains(*condition) {
                context.watcher_counts[slot] -= 1;
                if context.watcher_counts[slot] == 0 {
                    context.wanted -= *condition;
                    narrowed = true;
                }
            }
        }
        if narrowed && !context.dirty {
            context.dirty = true;
            self.dirty.push(watcher.fd);
        }
        true
    }

    /// Aggregate interest currently wanted on `fd` (for diagnostics and
    /// tests; equals the OR of the armed watchers' maskable conditions).
    pub fn interest(&self, fd: RawFd) -> Option<IoCondition> {
        self.contexts.get(&fd).map(|context| context.wanted)
    }

    /// Count of watchers armed on `fd`.
    pub fn watcher_count(&self, fd: RawFd) -> usize {
        self.contexts.get(&fd).map_or(0, |context| context.watchers.len())
    }

    /// The single blocking point: reconcile kernel registrations, wait for
    /// readiness no longer than the clock's next deadline, and report every
    /// fired watcher through `callback` after detaching it.
    ///
    /// Watchers armed while the callback runs are not observed until the
    /// next sweep. The clock's `now` is advanced across the wait.
    pub fn get_ready_watchers<C, F>(&mut self, clock: &mut IoClock<C>, mut callback: F)
    where
        F: FnMut(Watcher, IoCondition),
    {
        self.flush_contexts();
        let ready_count = self.poll_events(clock);

        for index in 0..ready_count {
            let event = self.events[index];
            let fd = event.u64 as RawFd;
            let ready = IoCondition::from_bits_truncate(event.events);

            let Some(context) = self.contexts.get(&fd) else {
                // Destroyed by an earlier callback in this sweep.
                continue;
            };
            // Snapshot: callbacks must see the arm-time watcher list.
            let armed: Vec<WatcherId> = context.watchers.clone();
            for id in armed {
                let Some(watcher) = self.watchers.get(id).copied() else {
                    continue;
                };
                let fired = watcher.conditions & ready;
                if !fired.is_empty() {
                    self.remove_watcher(id);
                    callback(watcher, fired);
                }
            }
        }
    }

    /// Apply pending interest changes to the kernel registration.
    fn flush_contexts(&mut self) {
        let dirty = std::mem::take(&mut self.dirty);
        for fd in dirty {
            let Some(context) = self.contexts.get_mut(&fd) else {
                continue;
            };
            context.dirty = false;
            if context.registered == context.wanted {
                continue;
            }

            let op = if context.registered.is_empty() {
                libc::EPOLL_CTL_ADD
            } else if context.wanted.is_empty() {
                libc::EPOLL_CTL_DEL
            } else {
                libc::EPOLL_CTL_MOD
            };
            let mut event = libc::epoll_event {
                events: context.wanted.bits() | libc::EPOLLET as u32,
                u64: fd as u64,
            };
            debug!(
                "epoll interest for fd {}: {:?} -> {:?}",
                fd, context.registered, context.wanted
            );
            let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
            if rc < 0 {
                if op == libc::EPOLL_CTL_DEL {
                    panic!(
                        "epoll_ctl(EPOLL_CTL_DEL) failed for fd {}: {}",
                        fd,
                        io::Error::last_os_error()
                    );
                }
                panic!(
                    "epoll_ctl({}) failed for fd {}: {}",
                    if op == libc::EPOLL_CTL_ADD { "EPOLL_CTL_ADD" } else { "EPOLL_CTL_MOD" },
                    fd,
                    io::Error::last_os_error()
                );
            }
            context.registered = context.wanted;
        }
    }

    /// Block until readiness or the clock's next deadline. Returns the
    /// number of events gathered; grows the event buffer and drains with a
    /// zero timeout when a wait fills it.
    fn poll_events<C>(&mut self, clock: &mut IoClock<C>) -> usize {
        clock.start();
        let mut timeout = clamp_timeout(clock.due_time());
        let mut gathered = 0usize;

        loop {
            let spare = &mut self.events[gathered..];
            let count = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    spare.as_mut_ptr(),
                    spare.len() as libc::c_int,
                    timeout,
                )
            };
            if count < 0 {
                if errno() == libc::EINTR {
                    clock.restart();
                    timeout = clamp_timeout(clock.due_time());
                    continue;
                }
                clock.stop();
                panic!("epoll_wait failed: {}", io::Error::last_os_error());
            }

            clock.stop();
            gathered += count as usize;
            if gathered < self.events.len() {
                return gathered;
            }
            // Full buffer: more may be pending. Double and drain.
            self.events.resize(self.events.len() * 2, unsafe { std::mem::zeroed() });
            clock.start();
            timeout = 0;
        }
    }
}

impl<T> Drop for IoPoller<T> {
    fn drop(&mut self) {
        let rc = unsafe { libc::close(self.epoll_fd) };
        if rc < 0 && errno() != libc::EINTR {
            panic!("close of epoll fd failed: {}", io::Error::last_os_error());
        }
    }
}

fn clamp_timeout(due: i64) -> libc::c_int {
    if due < 0 {
        -1
    } else {
        due.min(libc::c_int::MAX as i64) as libc::c_int
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Scheduler;
    use std::io::Write;
    use std::os::fd::RawFd;
    use std::thread;
    use std::time::Duration;

    fn nonblocking_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(rc, 0, "pipe2: {}", std::io::Error::last_os_error());
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn some_fiber(sched: &Scheduler) -> crate::fiber::FiberId {
        sched.spawn(|| {}).expect("spawn")
    }

    #[test]
    fn test_interest_is_or_of_watchers() {
        let sched = Scheduler::new();
        let fiber = some_fiber(&sched);
        let (read_end, write_end) = nonblocking_pipe();

        let mut poller: IoPoller<()> = IoPoller::new().expect("poller");
        poller.create_context(read_end, ());

        let a = poller.add_watcher(read_end, IoCondition::IN, fiber);
        let b = poller.add_watcher(read_end, IoCondition::IN | IoCondition::RDHUP, fiber);
        assert_eq!(
            poller.interest(read_end),
            Some(IoCondition::IN | IoCondition::RDHUP)
        );

        poller.remove_watcher(b);
        assert_eq!(poller.interest(read_end), Some(IoCondition::IN));
        poller.remove_watcher(a);
        assert_eq!(poller.interest(read_end), Some(IoCondition::empty()));

        poller.destroy_context(read_end);
        close(read_end);
        close(write_end);
    }

    #[test]
    fn test_stale_watcher_handle_rejected() {
        let sched = Scheduler::new();
        let fiber = some_fiber(&sched);
        let (read_end, write_end) = nonblocking_pipe();

        let mut poller: IoPoller<()> = IoPoller::new().expect("poller");
        poller.create_context(read_end, ());
        let id = poller.add_watcher(read_end, IoCondition::IN, fiber);
        assert!(poller.remove_watcher(id));
        assert!(!poller.remove_watcher(id));

        poller.destroy_context(read_end);
        close(read_end);
        close(write_end);
    }

    #[test]
    fn test_readiness_fires_watcher_and_timer_expires() {
        let sched = Scheduler::new();
        let fiber = some_fiber(&sched);
        let (read_end, write_end) = nonblocking_pipe();

        let mut poller: IoPoller<()> = IoPoller::new().expect("poller");
        let mut clock: IoClock<u32> = IoClock::new();
        clock.add_timer(100, 7);

        poller.create_context(read_end, ());
        poller.add_watcher(read_end, IoCondition::IN, fiber);

        // Nothing written yet: the wait should end on the timer deadline
        // with no watcher fired.
        let mut fired = Vec::new();
        poller.get_ready_watchers(&mut clock, |watcher, _| fired.push(watcher.fd));
        assert!(fired.is_empty());

        let mut expired = Vec::new();
        clock.remove_expired_timers(|tag| expired.push(tag));
        assert_eq!(expired, vec![7]);

        // A writer from another thread makes the read end ready.
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut file = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(write_end) };
            file.write_all(b"x").expect("write");
            std::mem::forget(file);
        });

        poller.get_ready_watchers(&mut clock, |watcher, ready| {
            assert!(ready.contains(IoCondition::IN));
            fired.push(watcher.fd);
        });
        assert_eq!(fired, vec![read_end]);
        // Firing detached the watcher.
        assert_eq!(poller.watcher_count(read_end), 0);

        writer.join().expect("writer thread");
        poller.destroy_context(read_end);
        close(read_end);
        close(write_end);
    }

    #[test]
    fn test_two_watchers_same_fd_both_fire() {
        let sched = Scheduler::new();
        let fiber_a = some_fiber(&sched);
        let fiber_b = some_fiber(&sched);
        let (read_end, write_end) = nonblocking_pipe();

        let mut poller: IoPoller<()> = IoPoller::new().expect("poller");
        let mut clock: IoClock<()> = IoClock::new();
        clock.add_timer(500, ());

        poller.create_context(read_end, ());
        poller.add_watcher(read_end, IoCondition::IN, fiber_a);
        poller.add_watcher(read_end, IoCondition::IN, fiber_b);

        let rc = unsafe { libc::write(write_end, b"y".as_ptr().cast(), 1) };
        assert_eq!(rc, 1);

        let mut woken = Vec::new();
        poller.get_ready_watchers(&mut clock, |watcher, _| woken.push(watcher.fiber));
        assert_eq!(woken, vec![fiber_a, fiber_b]);

        poller.destroy_context(read_end);
        close(read_end);
        close(write_end);
    }
}
