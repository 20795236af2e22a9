//! The loop façade: POSIX-shaped I/O over fibers.
//!
//! An [`EventLoop`] composes the scheduler, the readiness poller and the
//! timer clock. Its I/O methods mirror the syscalls they wrap (same
//! argument meaning, same errno vocabulary) except that "blocking" means
//! suspending the calling fiber, never the OS thread. Every descriptor the
//! loop touches is switched to `O_NONBLOCK` at the kernel; the blocking
//! mode the caller asked for is virtualized in the descriptor's context
//! tag together with its per-direction timeouts.
//!
//! Handles are cheap clones; fibers capture one to perform I/O. All of it
//! stays on the thread that calls [`EventLoop::run`].

use crate::clock::IoClock;
use crate::error::{cancelled, errno, sys_err, RuntimeError};
use crate::fiber::{FiberId, Scheduler, SpawnOptions, WakeReason};
use crate::net::{sockaddr_in_of, socket_addr_of};
use crate::poller::{IoCondition, IoPoller};
use crate::sync::{Event, Mutex, Semaphore};
use libc::c_int;
use log::{debug, trace};
use std::cell::RefCell;
use std::ffi::CString;
use std::io::{self, IoSlice, IoSliceMut};
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

pub use crate::fiber::DEFAULT_STACK_SIZE;

/// "No timeout" in the millisecond convention used throughout the loop.
const NO_TIMEOUT: i64 = -1;

/// Virtualized per-descriptor options, stored in the poller context tag.
#[derive(Debug, Clone, Copy)]
struct FileOptions {
    is_socket: bool,
    /// The blocking mode the caller asked for; the kernel fd is always
    /// nonblocking.
    blocking: bool,
    read_timeout_ms: i64,
    write_timeout_ms: i64,
}

struct LoopCore {
    scheduler: Scheduler,
    poller: RefCell<IoPoller<FileOptions>>,
    clock: RefCell<IoClock<FiberId>>,
}

impl Drop for LoopCore {
    fn drop(&mut self) {
        // Reached only once no fiber holds a handle; interrupt whatever is
        // still parked so its frames release watchers and timers.
        if self.scheduler.current_fiber().is_none() && self.scheduler.fiber_count() > 0 {
            self.scheduler.shutdown();
        }
    }
}

/// Cheap-clone handle to a single-threaded cooperative I/O loop.
#[derive(Clone)]
pub struct EventLoop {
    core: Rc<LoopCore>,
}

impl EventLoop {
    /// Create a loop with the default fiber stack size.
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_default_stack_size(DEFAULT_STACK_SIZE)
    }

    /// Create a loop whose zero-size spawns get `stack_size` stacks.
    pub fn with_default_stack_size(stack_size: usize) -> Result<Self, RuntimeError> {
        Ok(Self {
            core: Rc::new(LoopCore {
                scheduler: Scheduler::with_default_stack_size(stack_size),
                poller: RefCell::new(IoPoller::new()?),
                clock: RefCell::new(IoClock::new()),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Fibers and primitives
    // ------------------------------------------------------------------

    /// Spawn a foreground fiber.
    pub fn spawn<F: FnOnce() + 'static>(&self, thunk: F) -> Result<FiberId, RuntimeError> {
        self.core.scheduler.spawn(thunk)
    }

    /// Spawn a fiber with explicit options.
    pub fn spawn_with<F: FnOnce() + 'static>(
        &self,
        options: SpawnOptions,
        thunk: F,
    ) -> Result<FiberId, RuntimeError> {
        self.core.scheduler.spawn_with(options, thunk)
    }

    /// Interrupt a fiber; its pending or next blocking call fails with
    /// `ECANCELED`.
    pub fn interrupt(&self, fiber: FiberId) {
        self.core.scheduler.interrupt(fiber)
    }

    /// Id of the calling fiber, if any.
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.core.scheduler.current_fiber()
    }

    /// Reschedule cooperatively behind the other runnable fibers.
    pub fn yield_now(&self) -> io::Result<()> {
        match self.core.scheduler.yield_now() {
            WakeReason::Interrupted => Err(cancelled()),
            _ => Ok(()),
        }
    }

    /// The scheduler driving this loop.
    pub fn scheduler(&self) -> &Scheduler {
        &self.core.scheduler
    }

    /// A fresh [`Event`] bound to this loop's scheduler.
    pub fn make_event(&self) -> Event {
        Event::new(self.core.scheduler.clone())
    }

    /// A fresh [`Mutex`] bound to this loop's scheduler.
    pub fn make_mutex(&self) -> Mutex {
        Mutex::new(self.core.scheduler.clone())
    }

    /// A fresh [`Semaphore`] bound to this loop's scheduler.
    pub fn make_semaphore(&self, initial: i64, min: i64, max: i64) -> Semaphore {
        Semaphore::new(self.core.scheduler.clone(), initial, min, max)
    }

    /// Drive fibers and I/O until no foreground fiber is left.
    ///
    /// Each cycle dispatches every runnable fiber, then waits for
    /// readiness no longer than the nearest deadline, then fires
    /// readiness wake-ups followed by expired timers.
    pub fn run(&self) {
        loop {
            self.core.scheduler.run();
            if self.core.scheduler.foreground_fibers() == 0 {
                return;
            }

            {
                let mut poller = self.core.poller.borrow_mut();
                let mut clock = self.core.clock.borrow_mut();
                let scheduler = &self.core.scheduler;
                poller.get_ready_watchers(&mut clock, |watcher, ready| {
                    scheduler.wake(watcher.fiber, WakeReason::Io(ready));
                });
            }
            {
                let mut clock = self.core.clock.borrow_mut();
                let scheduler = &self.core.scheduler;
                clock.remove_expired_timers(|fiber| {
                    scheduler.wake(fiber, WakeReason::TimedOut);
                });
            }
        }
    }

    /// Park the calling fiber for `duration`.
    pub fn sleep(&self, duration: Duration) -> io::Result<()> {
        self.delay_for(duration.as_millis().min(i64::MAX as u128) as i64)
    }

    /// Park the calling fiber until it is interrupted or resumed.
    pub fn pause(&self) -> io::Result<()> {
        self.delay_for(NO_TIMEOUT)
    }

    // ------------------------------------------------------------------
    // Descriptor adoption
    // ------------------------------------------------------------------

    /// Adopt a descriptor created outside the loop: probe whether it is a
    /// socket, capture its blocking flag and socket timeouts, and switch
    /// the kernel fd to nonblocking. [`EventLoop::unregister_fd`] restores
    /// everything exactly. Rolls back on failure.
    pub fn register_fd(&self, fd: RawFd) -> Result<(), RuntimeError> {
        debug_assert!(!self.fd_is_managed(fd), "fd {} registered twice", fd);

        let is_socket = {
            let mut status: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut status) } < 0 {
                return Err(RuntimeError::sys("fstat"));
            }
            (status.st_mode & libc::S_IFMT) == libc::S_IFSOCK
        };

        let was_blocking = set_nonblocking(fd).map_err(|source| RuntimeError::Sys {
            call: "fcntl(F_SETFL)",
            source,
        })?;
        let rollback = |fd: RawFd| {
            if was_blocking {
                set_blocking(fd).expect("rollback of blocking flag failed");
            }
        };

        let (read_timeout_ms, write_timeout_ms) = if is_socket {
            let read = match read_socket_timeout(fd, libc::SO_RCVTIMEO, "getsockopt(SO_RCVTIMEO)") {
                Ok(timeout) => timeout,
                Err(error) => {
                    rollback(fd);
                    return Err(error);
                }
            };
            let write = match read_socket_timeout(fd, libc::SO_SNDTIMEO, "getsockopt(SO_SNDTIMEO)") {
                Ok(timeout) => timeout,
                Err(error) => {
                    rollback(fd);
                    return Err(error);
                }
            };
            (read, write)
        } else {
            (NO_TIMEOUT, NO_TIMEOUT)
        };

        debug!(
            "adopting fd {} (socket: {}, blocking: {})",
            fd, is_socket, was_blocking
        );
        self.create_io_context(fd, is_socket, was_blocking, read_timeout_ms, write_timeout_ms);
        Ok(())
    }

    /// Release an adopted (or created) descriptor, restoring the blocking
    /// flag and, for sockets, the original `SO_RCVTIMEO`/`SO_SNDTIMEO`.
    pub fn unregister_fd(&self, fd: RawFd) -> io::Result<()> {
        self.require_context(fd)?;
        let options = self.file_options(fd);

        if options.blocking {
            set_blocking(fd)?;
        }
        if options.is_socket {
            write_socket_timeout(fd, libc::SO_RCVTIMEO, options.read_timeout_ms)
                .expect("restore of SO_RCVTIMEO failed");
            write_socket_timeout(fd, libc::SO_SNDTIMEO, options.write_timeout_ms)
                .expect("restore of SO_SNDTIMEO failed");
        }
        debug!("releasing fd {}", fd);
        self.core.poller.borrow_mut().destroy_context(fd);
        Ok(())
    }

    /// Whether `fd` currently has a context with this loop.
    pub fn fd_is_managed(&self, fd: RawFd) -> bool {
        self.core.poller.borrow().context_exists(fd)
    }

    // ------------------------------------------------------------------
    // Files and pipes
    // ------------------------------------------------------------------

    /// `open(2)`. The descriptor is made nonblocking at the kernel; the
    /// blocking mode requested through `flags` is virtualized.
    pub fn open(&self, path: &Path, flags: c_int, mode: libc::mode_t) -> io::Result<RawFd> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| sys_err(libc::EINVAL))?;
        loop {
            let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_NONBLOCK, mode) };
            if fd < 0 {
                if errno() != libc::EINTR {
                    return Err(io::Error::last_os_error());
                }
                continue;
            }
            let blocking = flags & libc::O_NONBLOCK == 0;
            self.create_io_context(fd, false, blocking, NO_TIMEOUT, NO_TIMEOUT);
            return Ok(fd);
        }
    }

    /// `pipe2(2)`; both ends become managed. Rolls back fully if either
    /// end cannot be set up.
    pub fn pipe2(&self, flags: c_int) -> io::Result<(RawFd, RawFd)> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let blocking = flags & libc::O_NONBLOCK == 0;
        self.create_io_context(fds[0], false, blocking, NO_TIMEOUT, NO_TIMEOUT);
        self.create_io_context(fds[1], false, blocking, NO_TIMEOUT, NO_TIMEOUT);
        Ok((fds[0], fds[1]))
    }

    /// `pipe(2)`.
    pub fn pipe(&self) -> io::Result<(RawFd, RawFd)> {
        self.pipe2(0)
    }

    /// `read(2)`; suspends on `EAGAIN` up to the effective read timeout.
    pub fn read(&self, fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
        self.require_context(fd)?;
        let timeout = self.effective_read_timeout(fd);
        self.io_with_retry(fd, IoCondition::IN, timeout, || unsafe {
            libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len())
        })
    }

    /// `write(2)`; suspends on `EAGAIN` up to the effective write timeout.
    pub fn write(&self, fd: RawFd, data: &[u8]) -> io::Result<usize> {
        self.require_context(fd)?;
        let timeout = self.effective_write_timeout(fd);
        self.io_with_retry(fd, IoCondition::OUT, timeout, || unsafe {
            libc::write(fd, data.as_ptr().cast(), data.len())
        })
    }

    /// `readv(2)`.
    pub fn readv(&self, fd: RawFd, buffers: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.require_context(fd)?;
        let timeout = self.effective_read_timeout(fd);
        self.io_with_retry(fd, IoCondition::IN, timeout, || unsafe {
            libc::readv(fd, buffers.as_mut_ptr().cast(), buffers.len() as c_int)
        })
    }

    /// `writev(2)`.
    pub fn writev(&self, fd: RawFd, buffers: &[IoSlice<'_>]) -> io::Result<usize> {
        self.require_context(fd)?;
        let timeout = self.effective_write_timeout(fd);
        self.io_with_retry(fd, IoCondition::OUT, timeout, || unsafe {
            libc::writev(fd, buffers.as_ptr().cast(), buffers.len() as c_int)
        })
    }

    /// `close(2)`: the context is destroyed first, then the fd closed.
    /// All watchers must be gone (no fiber may be blocked on `fd`).
    pub fn close(&self, fd: RawFd) -> io::Result<()> {
        self.require_context(fd)?;
        self.core.poller.borrow_mut().destroy_context(fd);
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// `fcntl(2)` with `O_NONBLOCK` virtualized: `F_GETFL` reports the
    /// caller's requested blocking mode, `F_SETFL` records it while the
    /// kernel fd stays nonblocking. Other commands pass through.
    pub fn fcntl(&self, fd: RawFd, command: c_int, argument: c_int) -> io::Result<c_int> {
        self.require_context(fd)?;
        match command {
            libc::F_GETFL => {
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                if flags < 0 {
                    return Err(io::Error::last_os_error());
                }
                let blocking = self.file_options(fd).blocking;
                Ok((flags & !libc::O_NONBLOCK) | if blocking { 0 } else { libc::O_NONBLOCK })
            }
            libc::F_SETFL => {
                if unsafe { libc::fcntl(fd, libc::F_SETFL, argument | libc::O_NONBLOCK) } < 0 {
                    return Err(io::Error::last_os_error());
                }
                self.update_options(fd, |options| {
                    options.blocking = argument & libc::O_NONBLOCK == 0;
                });
                Ok(0)
            }
            _ => {
                let result = unsafe { libc::fcntl(fd, command, argument) };
                if result < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(result)
            }
        }
    }

    /// `poll(2)` limited to the shapes a cooperative loop can express:
    /// zero descriptors sleeps for `timeout` ms, one descriptor waits for
    /// the translated conditions, more fail with `ENOSYS`.
    pub fn poll(&self, fds: &mut [libc::pollfd], timeout: c_int) -> io::Result<usize> {
        match fds.len() {
            0 => {
                self.delay_for(timeout as i64)?;
                Ok(0)
            }
            1 => {
                let pollfd = &mut fds[0];
                if !self.fd_is_managed(pollfd.fd) {
                    pollfd.revents = libc::POLLNVAL;
                    return Ok(1);
                }

                let mut conditions = IoCondition::empty();
                for (flag, condition) in [
                    (libc::POLLIN, IoCondition::IN),
                    (libc::POLLOUT, IoCondition::OUT),
                    (libc::POLLRDHUP, IoCondition::RDHUP),
                    (libc::POLLPRI, IoCondition::PRI),
                ] {
                    if pollfd.events & flag != 0 {
                        conditions |= condition;
                    }
                }

                match self.wait_for_file(pollfd.fd, conditions, timeout as i64)? {
                    Some(ready) => {
                        pollfd.revents = 0;
                        for (condition, flag) in [
                            (IoCondition::IN, libc::POLLIN),
                            (IoCondition::OUT, libc::POLLOUT),
                            (IoCondition::RDHUP, libc::POLLRDHUP),
                            (IoCondition::PRI, libc::POLLPRI),
                            (IoCondition::ERR, libc::POLLERR),
                            (IoCondition::HUP, libc::POLLHUP),
                        ] {
                            if ready.contains(condition) {
                                pollfd.revents |= flag;
                            }
                        }
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            _ => Err(sys_err(libc::ENOSYS)),
        }
    }

    // ------------------------------------------------------------------
    // Sockets
    // ------------------------------------------------------------------

    /// `socket(2)`; `SOCK_NONBLOCK` is forced at the kernel and the
    /// requested mode virtualized.
    pub fn socket(&self, domain: c_int, socket_type: c_int, protocol: c_int) -> io::Result<RawFd> {
        let fd = unsafe { libc::socket(domain, socket_type | libc::SOCK_NONBLOCK, protocol) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let blocking = socket_type & libc::SOCK_NONBLOCK == 0;
        self.create_io_context(fd, true, blocking, NO_TIMEOUT, NO_TIMEOUT);
        Ok(fd)
    }

    /// `accept4(2)`; the accepted socket becomes managed and inherits the
    /// listener's timeouts. Waits up to the effective read timeout.
    pub fn accept4(&self, fd: RawFd, flags: c_int) -> io::Result<RawFd> {
        self.require_context(fd)?;
        loop {
            let accepted = unsafe {
                libc::accept4(
                    fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    flags | libc::SOCK_NONBLOCK,
                )
            };
            if accepted >= 0 {
                let listener = self.file_options(fd);
                let blocking = flags & libc::SOCK_NONBLOCK == 0;
                self.create_io_context(
                    accepted,
                    true,
                    blocking,
                    listener.read_timeout_ms,
                    listener.write_timeout_ms,
                );
                return Ok(accepted);
            }
            match errno() {
                libc::EAGAIN => {
                    let timeout = self.effective_read_timeout(fd);
                    if self.wait_for_file(fd, IoCondition::IN, timeout)?.is_none() {
                        return Err(sys_err(libc::EAGAIN));
                    }
                }
                libc::EINTR => {}
                code => return Err(sys_err(code)),
            }
        }
    }

    /// `accept(2)`.
    pub fn accept(&self, fd: RawFd) -> io::Result<RawFd> {
        self.accept4(fd, 0)
    }

    /// `connect(2)`: `EINPROGRESS` waits for writability (up to the
    /// effective write timeout) and reads `SO_ERROR`; a timeout surfaces
    /// as `EINPROGRESS`.
    pub fn connect(&self, fd: RawFd, address: SocketAddrV4) -> io::Result<()> {
        self.require_context(fd)?;
        let name = sockaddr_in_of(address);
        let rc = unsafe {
            libc::connect(
                fd,
                &name as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        match errno() {
            libc::EINTR | libc::EINPROGRESS => {
                let timeout = self.effective_write_timeout(fd);
                if self.wait_for_file(fd, IoCondition::OUT, timeout)?.is_none() {
                    return Err(sys_err(libc::EINPROGRESS));
                }
                let error = socket_error(fd);
                if error == 0 {
                    Ok(())
                } else {
                    Err(sys_err(error))
                }
            }
            code => Err(sys_err(code)),
        }
    }

    /// `recv(2)`. `MSG_DONTWAIT` polls once; `MSG_WAITALL` loops short
    /// reads to the full buffer, re-using the same timeout per wait and
    /// returning the partial count once any bytes have arrived.
    pub fn recv(&self, fd: RawFd, buffer: &mut [u8], flags: c_int) -> io::Result<usize> {
        self.require_context(fd)?;
        let (flags, timeout) = self.recv_flags_and_timeout(fd, flags);

        if flags & libc::MSG_WAITALL != 0 {
            let flags = flags & !libc::MSG_WAITALL;
            let mut received = 0usize;
            loop {
                let result = self.io_with_retry(fd, IoCondition::IN, timeout, || unsafe {
                    libc::recv(
                        fd,
                        buffer.as_mut_ptr().add(received).cast(),
                        buffer.len() - received,
                        flags,
                    )
                });
                match result {
                    Err(error) if received == 0 => return Err(error),
                    Err(_) => return Ok(received),
                    Ok(0) => return Ok(received),
                    Ok(count) => {
                        received += count;
                        if received == buffer.len() {
                            return Ok(received);
                        }
                    }
                }
            }
        } else {
            self.io_with_retry(fd, IoCondition::IN, timeout, || unsafe {
                libc::recv(fd, buffer.as_mut_ptr().cast(), buffer.len(), flags)
            })
        }
    }

    /// `send(2)`. `MSG_DONTWAIT` polls once.
    pub fn send(&self, fd: RawFd, data: &[u8], flags: c_int) -> io::Result<usize> {
        self.require_context(fd)?;
        let (flags, timeout) = self.send_flags_and_timeout(fd, flags);
        self.io_with_retry(fd, IoCondition::OUT, timeout, || unsafe {
            libc::send(fd, data.as_ptr().cast(), data.len(), flags)
        })
    }

    /// `recvfrom(2)` for IPv4 datagrams; returns the byte count and the
    /// sender, when the kernel reports one.
    pub fn recvfrom(
        &self,
        fd: RawFd,
        buffer: &mut [u8],
        flags: c_int,
    ) -> io::Result<(usize, Option<SocketAddrV4>)> {
        self.require_context(fd)?;
        let (flags, timeout) = self.recv_flags_and_timeout(fd, flags);

        let mut name: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut name_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        if flags & libc::MSG_WAITALL != 0 {
            let flags = flags & !libc::MSG_WAITALL;
            let mut received = 0usize;
            loop {
                let result = self.io_with_retry(fd, IoCondition::IN, timeout, || unsafe {
                    name_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
                    libc::recvfrom(
                        fd,
                        buffer.as_mut_ptr().add(received).cast(),
                        buffer.len() - received,
                        flags,
                        &mut name as *mut libc::sockaddr_in as *mut libc::sockaddr,
                        &mut name_len,
                    )
                });
                match result {
                    Err(error) if received == 0 => return Err(error),
                    Err(_) => return Ok((received, sender_of(&name, name_len))),
                    Ok(0) => return Ok((received, sender_of(&name, name_len))),
                    Ok(count) => {
                        received += count;
                        if received == buffer.len() {
                            return Ok((received, sender_of(&name, name_len)));
                        }
                    }
                }
            }
        } else {
            let count = self.io_with_retry(fd, IoCondition::IN, timeout, || unsafe {
                name_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
                libc::recvfrom(
                    fd,
                    buffer.as_mut_ptr().cast(),
                    buffer.len(),
                    flags,
                    &mut name as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut name_len,
                )
            })?;
            Ok((count, sender_of(&name, name_len)))
        }
    }

    /// `sendto(2)` for IPv4 datagrams.
    pub fn sendto(
        &self,
        fd: RawFd,
        data: &[u8],
        flags: c_int,
        address: SocketAddrV4,
    ) -> io::Result<usize> {
        self.require_context(fd)?;
        let (flags, timeout) = self.send_flags_and_timeout(fd, flags);
        let name = sockaddr_in_of(address);
        self.io_with_retry(fd, IoCondition::OUT, timeout, || unsafe {
            libc::sendto(
                fd,
                data.as_ptr().cast(),
                data.len(),
                flags,
                &name as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        })
    }

    /// `shutdown(2)`.
    pub fn shutdown(&self, fd: RawFd, how: c_int) -> io::Result<()> {
        self.require_context(fd)?;
        if unsafe { libc::shutdown(fd, how) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// `getsockopt(2)`. `SO_RCVTIMEO`/`SO_SNDTIMEO` are served from the
    /// virtualized options (`ENOTSOCK` for non-sockets, `EINVAL` for a
    /// short buffer); everything else passes through. Returns the option
    /// length.
    pub fn getsockopt(
        &self,
        fd: RawFd,
        level: c_int,
        option: c_int,
        value: &mut [u8],
    ) -> io::Result<usize> {
        self.require_context(fd)?;
        if level == libc::SOL_SOCKET && (option == libc::SO_RCVTIMEO || option == libc::SO_SNDTIMEO) {
            let options = self.file_options(fd);
            if !options.is_socket {
                return Err(sys_err(libc::ENOTSOCK));
            }
            if value.len() < std::mem::size_of::<libc::timeval>() {
                return Err(sys_err(libc::EINVAL));
            }
            let time = timeout_to_timeval(if option == libc::SO_RCVTIMEO {
                options.read_timeout_ms
            } else {
                options.write_timeout_ms
            });
            unsafe {
                std::ptr::write_unaligned(value.as_mut_ptr() as *mut libc::timeval, time);
            }
            Ok(std::mem::size_of::<libc::timeval>())
        } else {
            let mut length = value.len() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(fd, level, option, value.as_mut_ptr().cast(), &mut length)
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(length as usize)
        }
    }

    /// `setsockopt(2)` with the same timeout virtualization.
    pub fn setsockopt(
        &self,
        fd: RawFd,
        level: c_int,
        option: c_int,
        value: &[u8],
    ) -> io::Result<()> {
        self.require_context(fd)?;
        if level == libc::SOL_SOCKET && (option == libc::SO_RCVTIMEO || option == libc::SO_SNDTIMEO) {
            if !self.file_options(fd).is_socket {
                return Err(sys_err(libc::ENOTSOCK));
            }
            if value.len() < std::mem::size_of::<libc::timeval>() {
                return Err(sys_err(libc::EINVAL));
            }
            let time: libc::timeval =
                unsafe { std::ptr::read_unaligned(value.as_ptr() as *const libc::timeval) };
            let timeout = timeout_from_timeval(time);
            self.update_options(fd, |options| {
                if option == libc::SO_RCVTIMEO {
                    options.read_timeout_ms = timeout;
                } else {
                    options.write_timeout_ms = timeout;
                }
            });
            Ok(())
        } else {
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    level,
                    option,
                    value.as_ptr().cast(),
                    value.len() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    /// Set the virtualized read timeout of any managed descriptor (`None`
    /// waits forever). For sockets this is what `SO_RCVTIMEO` reports.
    pub fn set_read_timeout(&self, fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
        self.require_context(fd)?;
        let timeout_ms = timeout.map_or(NO_TIMEOUT, |timeout| {
            timeout.as_millis().min(i64::MAX as u128) as i64
        });
        self.update_options(fd, |options| options.read_timeout_ms = timeout_ms);
        Ok(())
    }

    /// Set the virtualized write timeout of any managed descriptor.
    pub fn set_write_timeout(&self, fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
        self.require_context(fd)?;
        let timeout_ms = timeout.map_or(NO_TIMEOUT, |timeout| {
            timeout.as_millis().min(i64::MAX as u128) as i64
        });
        self.update_options(fd, |options| options.write_timeout_ms = timeout_ms);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn require_context(&self, fd: RawFd) -> io::Result<()> {
        if self.fd_is_managed(fd) {
            Ok(())
        } else {
            Err(sys_err(libc::EBADF))
        }
    }

    fn create_io_context(
        &self,
        fd: RawFd,
        is_socket: bool,
        blocking: bool,
        read_timeout_ms: i64,
        write_timeout_ms: i64,
    ) {
        self.core.poller.borrow_mut().create_context(
            fd,
            FileOptions {
                is_socket,
                blocking,
                read_timeout_ms,
                write_timeout_ms,
            },
        );
    }

    fn file_options(&self, fd: RawFd) -> FileOptions {
        *self
            .core
            .poller
            .borrow()
            .tag(fd)
            .expect("context checked by caller")
    }

    fn update_options(&self, fd: RawFd, update: impl FnOnce(&mut FileOptions)) {
        let mut poller = self.core.poller.borrow_mut();
        update(poller.tag_mut(fd).expect("context checked by caller"));
    }

    fn effective_read_timeout(&self, fd: RawFd) -> i64 {
        let options = self.file_options(fd);
        if options.blocking {
            options.read_timeout_ms
        } else {
            0
        }
    }

    fn effective_write_timeout(&self, fd: RawFd) -> i64 {
        let options = self.file_options(fd);
        if options.blocking {
            options.write_timeout_ms
        } else {
            0
        }
    }

    fn recv_flags_and_timeout(&self, fd: RawFd, flags: c_int) -> (c_int, i64) {
        if flags & libc::MSG_DONTWAIT != 0 {
            (flags & !libc::MSG_DONTWAIT, 0)
        } else {
            (flags, self.effective_read_timeout(fd))
        }
    }

    fn send_flags_and_timeout(&self, fd: RawFd, flags: c_int) -> (c_int, i64) {
        if flags & libc::MSG_DONTWAIT != 0 {
            (flags & !libc::MSG_DONTWAIT, 0)
        } else {
            (flags, self.effective_write_timeout(fd))
        }
    }

    /// Retry `operation` until it stops failing with `EAGAIN`/`EINTR`,
    /// waiting for `condition` between attempts. `EINTR` retries without
    /// re-waiting; an exhausted wait allowance surfaces as `EAGAIN`.
    fn io_with_retry<F>(
        &self,
        fd: RawFd,
        condition: IoCondition,
        timeout_ms: i64,
        mut operation: F,
    ) -> io::Result<usize>
    where
        F: FnMut() -> libc::ssize_t,
    {
        loop {
            let count = operation();
            if count >= 0 {
                return Ok(count as usize);
            }
            match errno() {
                libc::EAGAIN => {
                    if self.wait_for_file(fd, condition, timeout_ms)?.is_none() {
                        return Err(sys_err(libc::EAGAIN));
                    }
                }
                libc::EINTR => {}
                code => return Err(sys_err(code)),
            }
        }
    }

    /// Arm a watcher (and a timer for positive timeouts) and park the
    /// calling fiber. `Ok(Some(ready))` on readiness, `Ok(None)` on an
    /// expired or zero allowance, `Err(ECANCELED)` on interruption. Watcher
    /// and timer are disarmed on every exit path; stale handles after a
    /// same-sweep double fire are rejected by their generation counters.
    fn wait_for_file(
        &self,
        fd: RawFd,
        conditions: IoCondition,
        timeout_ms: i64,
    ) -> io::Result<Option<IoCondition>> {
        if timeout_ms == 0 {
            return Ok(None);
        }
        let scheduler = &self.core.scheduler;
        let fiber = scheduler
            .current_fiber()
            .expect("blocking I/O is only available inside a fiber");
        trace!("fiber {:?} waiting on fd {} for {:?}", fiber, fd, conditions);

        let watcher = self
            .core
            .poller
            .borrow_mut()
            .add_watcher(fd, conditions, fiber);
        let timer = if timeout_ms > 0 {
            Some(self.core.clock.borrow_mut().add_timer(timeout_ms, fiber))
        } else {
            None
        };

        loop {
            match scheduler.suspend_current() {
                WakeReason::Io(ready) => {
                    if let Some(timer) = timer {
                        self.core.clock.borrow_mut().remove_timer(timer);
                    }
                    return Ok(Some(ready));
                }
                WakeReason::TimedOut => {
                    self.core.poller.borrow_mut().remove_watcher(watcher);
                    return Ok(None);
                }
                WakeReason::Interrupted => {
                    self.core.poller.borrow_mut().remove_watcher(watcher);
                    if let Some(timer) = timer {
                        self.core.clock.borrow_mut().remove_timer(timer);
                    }
                    return Err(cancelled());
                }
                WakeReason::Resumed => {
                    // Not a wake the loop produced; park again.
                }
            }
        }
    }

    /// Park for `timeout_ms` (negative parks until resumed/interrupted).
    fn delay_for(&self, timeout_ms: i64) -> io::Result<()> {
        let scheduler = &self.core.scheduler;
        let fiber = scheduler
            .current_fiber()
            .expect("sleeping is only available inside a fiber");

        if timeout_ms < 0 {
            return match scheduler.suspend_current() {
                WakeReason::Interrupted => Err(cancelled()),
                _ => Ok(()),
            };
        }

        let timer = self.core.clock.borrow_mut().add_timer(timeout_ms, fiber);
        match scheduler.suspend_current() {
            WakeReason::TimedOut => Ok(()),
            WakeReason::Interrupted => {
                self.core.clock.borrow_mut().remove_timer(timer);
                Err(cancelled())
            }
            WakeReason::Io(_) | WakeReason::Resumed => {
                // Woken early by an explicit resume; the deadline is moot.
                self.core.clock.borrow_mut().remove_timer(timer);
                Ok(())
            }
        }
    }
}

fn sender_of(name: &libc::sockaddr_in, length: libc::socklen_t) -> Option<SocketAddrV4> {
    if length as usize >= std::mem::size_of::<libc::sockaddr_in>()
        && name.sin_family == libc::AF_INET as libc::sa_family_t
    {
        Some(socket_addr_of(name))
    } else {
        None
    }
}

fn socket_error(fd: RawFd) -> c_int {
    let mut error: c_int = 0;
    let mut length = std::mem::size_of::<c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut c_int as *mut libc::c_void,
            &mut length,
        )
    };
    if rc < 0 {
        panic!("getsockopt(SO_ERROR) failed: {}", io::Error::last_os_error());
    }
    error
}

/// Make `fd` nonblocking, reporting whether it was blocking before.
fn set_nonblocking(fd: RawFd) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(false);
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(true)
}

/// Restore blocking mode on `fd`.
fn set_blocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn read_socket_timeout(
    fd: RawFd,
    option: c_int,
    call: &'static str,
) -> Result<i64, RuntimeError> {
    let mut time: libc::timeval = unsafe { std::mem::zeroed() };
    let mut length = std::mem::size_of::<libc::timeval>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &mut time as *mut libc::timeval as *mut libc::c_void,
            &mut length,
        )
    };
    if rc < 0 {
        return Err(RuntimeError::sys(call));
    }
    Ok(timeout_from_timeval(time))
}

fn write_socket_timeout(fd: RawFd, option: c_int, timeout_ms: i64) -> io::Result<()> {
    let time = timeout_to_timeval(timeout_ms);
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &time as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `{0,0}` means "no timeout"; anything else is `sec*1000 + usec/1000` ms.
fn timeout_from_timeval(time: libc::timeval) -> i64 {
    if time.tv_sec == 0 && time.tv_usec == 0 {
        NO_TIMEOUT
    } else {
        time.tv_sec as i64 * 1000 + time.tv_usec as i64 / 1000
    }
}

fn timeout_to_timeval(timeout_ms: i64) -> libc::timeval {
    if timeout_ms < 0 {
        libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        }
    } else {
        libc::timeval {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeval_round_trip() {
        assert_eq!(timeout_from_timeval(timeout_to_timeval(NO_TIMEOUT)), NO_TIMEOUT);
        assert_eq!(timeout_from_timeval(timeout_to_timeval(1500)), 1500);
        assert_eq!(timeout_from_timeval(timeout_to_timeval(50)), 50);

        let time = timeout_to_timeval(2750);
        assert_eq!(time.tv_sec, 2);
        assert_eq!(time.tv_usec, 750_000);
    }

    #[test]
    fn test_zero_timeval_is_no_timeout() {
        let zero = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        assert_eq!(timeout_from_timeval(zero), NO_TIMEOUT);
    }

    #[test]
    fn test_unmanaged_fd_is_ebadf() {
        let event_loop = EventLoop::new().expect("loop");
        let mut buffer = [0u8; 4];
        let error = event_loop.read(9999, &mut buffer).expect_err("EBADF");
        assert_eq!(error.raw_os_error(), Some(libc::EBADF));
        let error = event_loop.fcntl(9999, libc::F_GETFL, 0).expect_err("EBADF");
        assert_eq!(error.raw_os_error(), Some(libc::EBADF));
    }
}
