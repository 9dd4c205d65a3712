//! fiberio - Cooperative Fiber Runtime
//!
//! An N:M runtime for Linux: stackful fibers multiplexed over a worker
//! thread pool, driven by an edge-triggered epoll reactor with a timer set,
//! plus drop-in replacements for the blocking Unix syscalls that suspend
//! the calling fiber instead of the thread.
//!
//! # Features
//!
//! - **Stackful fibers**: explicit `resume`/`yield_now` switching, reusable
//!   stacks, one running fiber per thread
//! - **Scheduler**: FIFO task queue with optional OS-thread pinning,
//!   caller-thread enrollment, per-worker scheduling fibers
//! - **Reactor**: one-shot READ/WRITE events per fd, self-pipe cross-thread
//!   wakeup, 5s wait cap
//! - **Timers**: deadline-ordered set with cancel/refresh/reset and
//!   witness-gated conditional timers
//! - **Syscall hooks**: `read`/`write`/`connect`/`accept`/`sleep`/... that
//!   cooperate with the reactor transparently; `SO_RCVTIMEO`/`SO_SNDTIMEO`
//!   surface as `ETIMEDOUT`
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   schedule()   ┌───────────────────────────────┐
//! │  user fiber  │ ─────────────> │   Scheduler (worker pool)     │
//! └──────┬───────┘                │  task queue + pinning         │
//!        │ hooked read()          └──────┬────────────────────────┘
//!        │ EAGAIN                        │ idle fiber
//!        ▼                               ▼
//! ┌──────────────┐   add_event    ┌───────────────────────────────┐
//! │  hook layer  │ ─────────────> │   Reactor (epoll, ET)         │
//! │  fd contexts │    + timer     │  per-fd slots · timers · pipe │
//! └──────────────┘                └───────────────────────────────┘
//!          readiness fires -> fiber rescheduled -> syscall retried
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fiberio::{IoManager, hook};
//!
//! let iom = IoManager::new(2, false, "io").unwrap();
//! iom.schedule(|| {
//!     // Runs inside a fiber on the worker pool; hooked sleep parks the
//!     // fiber, not the thread.
//!     hook::sleep(1);
//!     println!("one second later");
//! });
//! iom.stop();
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod fd_manager;
pub mod fiber;
pub mod hook;
pub mod io;
pub mod scheduler;
pub mod timer;
pub(crate) mod util;

pub use error::{Result, RuntimeError};
pub use fd_manager::{FdCtx, FdManager, TimeoutKind};
pub use fiber::{Fiber, FiberState};
pub use io::{IoEvent, IoManager};
pub use scheduler::{Scheduler, Task};
pub use timer::Timer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
