//! Error types and errno plumbing.
//!
//! Syscall-shaped methods on [`EventLoop`](crate::event_loop::EventLoop)
//! report failures through `std::io::Error` carrying the raw errno, mirroring
//! the POSIX contract of the calls they wrap. Construction and descriptor
//! adoption use [`RuntimeError`] instead, which names the failing call.

use std::io;

/// Errors raised while building runtime pieces or adopting descriptors.
///
/// These are distinct from the errno-style results of the I/O surface:
/// a `RuntimeError` means a multi-step setup could not complete (and was
/// rolled back), not that a single syscall would block or failed.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A syscall failed during setup or adoption.
    #[error("{call} failed: {source}")]
    Sys {
        /// The syscall (and option, where relevant) that failed.
        call: &'static str,
        /// The underlying OS error.
        source: io::Error,
    },

    /// A fiber stack could not be mapped.
    #[error("fiber stack allocation of {size} bytes failed: {source}")]
    StackAlloc {
        /// Requested mapping size in bytes.
        size: usize,
        /// The underlying OS error.
        source: io::Error,
    },
}

impl RuntimeError {
    pub(crate) fn sys(call: &'static str) -> Self {
        RuntimeError::Sys {
            call,
            source: io::Error::last_os_error(),
        }
    }
}

/// Raw errno of the most recent failed syscall on this thread.
pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// An `io::Error` for a specific errno value.
pub(crate) fn sys_err(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// The cancellation condition delivered when a blocked fiber is interrupted.
pub(crate) fn cancelled() -> io::Error {
    sys_err(libc::ECANCELED)
}
