//! Stackful fibers.
//!
//! A fiber is a cooperatively scheduled execution unit with its own heap
//! stack and saved machine context. Exactly one fiber runs per OS thread at
//! any time; `resume` switches into a fiber and `yield_now` switches back
//! out. The first call to [`Fiber::current`] on a thread wraps the thread's
//! own execution in a stackless "main" fiber so the switch primitives apply
//! uniformly.
//!
//! A fiber created with `run_in_scheduler` swaps against the worker's
//! scheduling fiber instead of the thread main fiber, which is what lets
//! scheduler workers interleave task fibers without unwinding their own
//! dispatch loop.

mod context;

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::config;
use crate::error::{Result, RuntimeError};
use context::{MachineContext, Stack};

/// Boxed fiber body.
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Fiber lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Runnable: freshly created, reset, or suspended by a yield.
    Ready = 0,
    /// Currently executing on some thread.
    Running = 1,
    /// The body returned; only `reset` can revive the fiber.
    Term = 2,
}

impl FiberState {
    fn from_u8(v: u8) -> FiberState {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// This thread's main fiber (the thread's original execution context).
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// A stackful coroutine.
///
/// Shared as `Arc<Fiber>`: the scheduler queue, the reactor's event slots
/// and user code may all hold handles to the same fiber.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    run_in_scheduler: bool,
    ctx: MachineContext,
    stack: Option<Stack>,
    cb: Mutex<Option<FiberFn>>,
}

impl Fiber {
    /// Create a fiber running `cb` on its own stack.
    ///
    /// `stack_size == 0` uses the configured default. `run_in_scheduler`
    /// selects the worker's scheduling fiber as the switch partner; pass
    /// `false` for fibers driven directly from a thread (the scheduling
    /// fibers themselves, or bare fibers in tests).
    pub fn new(
        cb: impl FnOnce() + Send + 'static,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> Result<Arc<Fiber>> {
        let size = if stack_size == 0 {
            config::fiber_stack_size()
        } else {
            stack_size
        };
        let stack = Stack::alloc(size)?;
        let ctx = MachineContext::new();
        ctx.make(&stack, fiber_entry)?;

        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            ctx,
            stack: Some(stack),
            cb: Mutex::new(Some(Box::new(cb))),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("fiber {} created, stack {} bytes", fiber.id, size);
        Ok(fiber)
    }

    /// The fiber currently running on this thread, creating and installing
    /// the thread's main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let main = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Running as u8),
            run_in_scheduler: false,
            ctx: MachineContext::new(),
            stack: None,
            cb: Mutex::new(None),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = main.ctx.capture() {
            tracing::error!("main fiber context capture failed: {}", e);
        }
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        THREAD_MAIN.with(|c| *c.borrow_mut() = Some(main.clone()));
        tracing::debug!("main fiber {} created", main.id);
        main
    }

    /// Id of the running fiber, or 0 when the thread has no fiber yet.
    pub fn fiber_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(0))
    }

    /// Number of live fibers in the process.
    pub fn live_count() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Switch execution into this fiber. Returns when the fiber yields or
    /// terminates.
    ///
    /// The fiber must be `Ready`; resuming a `Running` or `Term` fiber is a
    /// programmer error and is refused with a logged error.
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        if state != FiberState::Ready {
            tracing::error!("fiber {} resume refused: state is {:?}", self.id, state);
            return;
        }
        // Make sure the thread has a main fiber to come back to.
        let _ = Fiber::current();

        let partner: Arc<Fiber> = if self.run_in_scheduler {
            match crate::scheduler::scheduling_fiber() {
                Some(f) => f,
                None => {
                    tracing::error!("fiber {} resume refused: no scheduling fiber", self.id);
                    return;
                }
            }
        } else {
            match thread_main() {
                Some(f) => f,
                None => return,
            }
        };

        set_current(self.clone());
        self.set_state(FiberState::Running);

        let from: *const MachineContext = &partner.ctx;
        let to: *const MachineContext = &self.ctx;
        // The partner stays alive through thread-local storage; holding an
        // Arc across the switch is unnecessary.
        drop(partner);
        unsafe { MachineContext::swap(from, to) };
        // Control returns here once the fiber yields or terminates.
    }

    /// Suspend the running fiber and switch back to its partner.
    ///
    /// A `Running` fiber becomes `Ready`; a `Term` fiber stays `Term` (that
    /// is the trampoline's final switch out).
    pub fn yield_now() {
        let cur = Fiber::current();
        // Drop the handle before switching: when a terminating fiber
        // switches out its stack is abandoned, and anything owned by this
        // frame would leak. The running fiber is kept alive by its resumer
        // (or by thread-local storage for main fibers).
        let raw: *const Fiber = Arc::as_ptr(&cur);
        drop(cur);
        unsafe { (*raw).switch_out() };
    }

    fn switch_out(&self) {
        let state = self.state();
        if state != FiberState::Running && state != FiberState::Term {
            tracing::error!("fiber {} yield refused: state is {:?}", self.id, state);
            return;
        }
        if state == FiberState::Running {
            self.set_state(FiberState::Ready);
        }

        let Some(main) = thread_main() else {
            tracing::error!("fiber {} yield refused: thread has no main fiber", self.id);
            return;
        };
        let partner: Arc<Fiber> = if self.run_in_scheduler {
            match crate::scheduler::scheduling_fiber() {
                Some(f) => f,
                None => {
                    tracing::error!("fiber {} yield refused: no scheduling fiber", self.id);
                    return;
                }
            }
        } else {
            main.clone()
        };

        set_current(main.clone());

        let from: *const MachineContext = &self.ctx;
        let to: *const MachineContext = &partner.ctx;
        drop(partner);
        drop(main);
        unsafe { MachineContext::swap(from, to) };
    }

    /// Rebind a terminated fiber to a new body, reusing its stack.
    pub fn reset(&self, cb: impl FnOnce() + Send + 'static) -> Result<()> {
        let Some(stack) = &self.stack else {
            tracing::error!("fiber {} reset refused: no owned stack", self.id);
            return Err(RuntimeError::FiberState {
                id: self.id,
                state: self.state(),
                expected: FiberState::Term,
            });
        };
        let state = self.state();
        if state != FiberState::Term {
            tracing::error!("fiber {} reset refused: state is {:?}", self.id, state);
            return Err(RuntimeError::FiberState {
                id: self.id,
                state,
                expected: FiberState::Term,
            });
        }
        *self.cb.lock().unwrap() = Some(Box::new(cb));
        self.ctx.make(stack, fiber_entry)?;
        self.set_state(FiberState::Ready);
        Ok(())
    }
}

// A fiber's context and stack are only touched by the thread that currently
// runs or resumes it; handles merely carry identity and state.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() && self.state() != FiberState::Term {
            // The stack still holds a suspended frame; freeing it strands
            // whatever the fiber owned.
            tracing::error!(
                "fiber {} dropped in state {:?} before terminating",
                self.id,
                self.state()
            );
        } else {
            tracing::debug!("fiber {} dropped", self.id);
        }
    }
}

pub(crate) fn thread_main() -> Option<Arc<Fiber>> {
    THREAD_MAIN.with(|c| c.borrow().clone())
}

fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber));
}

/// Trampoline every stackful fiber starts on.
///
/// Runs the body, marks the fiber terminated and switches out through
/// `yield_now` so the abandoned stack owns nothing.
extern "C" fn fiber_entry() {
    // Bind the fiber at entry: bodies that resume other fibers (the
    // scheduling fibers do) leave the thread-local current pointing
    // elsewhere by the time the body returns.
    let raw: *const Fiber;
    {
        let cur = Fiber::current();
        raw = Arc::as_ptr(&cur);
        let cb = cur.cb.lock().unwrap().take();
        match cb {
            Some(cb) => cb(),
            None => tracing::error!("fiber {} started without a body", cur.id()),
        }
        cur.set_state(FiberState::Term);
        // The handle drops here; the final switch goes through the raw
        // pointer so the abandoned stack owns nothing.
    }
    unsafe { (*raw).switch_out() };
    unreachable!("terminated fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_ids_are_unique() {
        let a = Fiber::new(|| {}, 0, false).unwrap();
        let b = Fiber::new(|| {}, 0, false).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), FiberState::Ready);
    }

    #[test]
    fn test_reset_requires_term() {
        let fiber = Fiber::new(|| {}, 0, false).unwrap();
        assert!(fiber.reset(|| {}).is_err());
    }

    #[test]
    fn test_main_fiber_identity() {
        std::thread::spawn(|| {
            assert_eq!(Fiber::fiber_id(), 0);
            let main = Fiber::current();
            assert_eq!(main.state(), FiberState::Running);
            assert_eq!(Fiber::fiber_id(), main.id());
            assert!(Arc::ptr_eq(&main, &Fiber::current()));
        })
        .join()
        .unwrap();
    }
}
