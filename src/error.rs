//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. Violations of a component's preconditions
//! (resuming a dead fiber, double-adding an event on the same fd, scheduling
//! after `stop`) are bugs in the caller, not runtime conditions, and are
//! modeled as panics rather than `Error` variants — see each module's docs
//! for which calls can panic.

use std::io;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong at runtime once preconditions are satisfied.
///
/// This type is `#[non_exhaustive]`: new variants may be added without a
/// breaking change, so callers must always include a wildcard arm.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A syscall made on behalf of a hooked operation failed. The wrapped
    /// [`io::Error`] carries the original `errno`.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// A hooked operation did not complete before its deadline. Surfaced to
    /// callers the same way the kernel would report it: as `ETIMEDOUT`.
    #[error("operation timed out")]
    TimedOut,

    /// The epoll/timer reactor itself failed to initialize or poll. Distinct
    /// from [`Error::Io`] so callers can tell a reactor-level failure (which
    /// is unrecoverable for the whole scheduler) from a per-operation one.
    #[error("reactor error: {0}")]
    Reactor(#[source] io::Error),

    /// An operation was attempted on a file descriptor that has already been
    /// closed through [`crate::hook::close`].
    #[error("bad file descriptor")]
    BadFd,
}

impl Error {
    /// The `errno` this error should be reported as, for callers that need
    /// to set `errno` rather than return a `Result` (e.g. a future
    /// `LD_PRELOAD` shim built on this crate).
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            Error::Reactor(e) => e.raw_os_error(),
            Error::TimedOut => Some(libc::ETIMEDOUT),
            Error::BadFd => Some(libc::EBADF),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::Reactor(e) => e,
            Error::TimedOut => io::Error::from_raw_os_error(libc::ETIMEDOUT),
            Error::BadFd => io::Error::from_raw_os_error(libc::EBADF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_out_maps_to_etimedout() {
        let err = Error::TimedOut;
        assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
        let io_err: io::Error = err.into();
        assert_eq!(io_err.raw_os_error(), Some(libc::ETIMEDOUT));
    }

    #[test]
    fn io_preserves_errno() {
        let io_err = io::Error::from_raw_os_error(libc::EAGAIN);
        let err: Error = io_err.into();
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
    }
}
