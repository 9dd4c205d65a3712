//! Runtime error types.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::io::IoEvent;

/// Errors surfaced by the runtime's fallible operations.
///
/// Syscall hooks do not use this type: they keep the POSIX `-1`/`errno`
/// convention of the calls they replace.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Creating the epoll instance failed. The reactor cannot be built.
    #[error("epoll instance creation failed")]
    EpollCreate(#[source] io::Error),

    /// Creating or configuring the wakeup pipe failed.
    #[error("tickle pipe setup failed")]
    TicklePipe(#[source] io::Error),

    /// An `epoll_ctl` call was rejected by the kernel.
    #[error("epoll_ctl failed for fd {fd}")]
    EpollCtl {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// A direction was registered twice for the same fd without firing.
    #[error("{event:?} event already registered for fd {fd}")]
    DuplicateEvent { fd: RawFd, event: IoEvent },

    /// Capturing or preparing a machine context failed.
    #[error("machine context operation failed")]
    Context(#[source] io::Error),

    /// A fiber operation was attempted in an invalid state.
    #[error("fiber {id} is {state:?}, expected {expected:?}")]
    FiberState {
        id: u64,
        state: crate::fiber::FiberState,
        expected: crate::fiber::FiberState,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;
