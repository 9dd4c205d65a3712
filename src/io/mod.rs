//! I/O multiplexer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          IoManager                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Scheduler: worker pool consuming the task queue                │
//! │  Reactor:   per-fd READ/WRITE slots over edge-triggered epoll   │
//! │  Timers:    deadline-ordered set driven by the reactor wait     │
//! │  Self-pipe: lets any thread interrupt a blocked epoll_wait      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Workers with nothing to run park inside the reactor loop (the idle
//! fiber): they wait on epoll, dispatch expired timers, translate readiness
//! into the registered one-shot events and then yield back to the dispatch
//! loop so the freshly scheduled fibers get picked up.
//!
//! Events are one-shot: firing a direction clears it, and a consumer that
//! wants to keep watching an fd re-registers after each firing.

mod event_loop;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use crate::error::{Result, RuntimeError};
use crate::fiber::{Fiber, FiberFn, FiberState};
use crate::scheduler::{Scheduler, Task};
use crate::timer::{Timer, TimerCallback, TimerManager};

use event_loop::{EventLoop, MAX_EVENTS};

/// Cap on a single reactor wait so workers periodically re-check for
/// shutdown even with no timers armed.
const MAX_TIMEOUT_MS: u64 = 5000;

/// A registerable I/O direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Read,
    Write,
}

impl IoEvent {
    pub(crate) fn mask(self) -> u32 {
        match self {
            IoEvent::Read => libc::EPOLLIN as u32,
            IoEvent::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// Work to run when a registered event fires.
enum EventJob {
    /// Resume this fiber (the common case: a hooked syscall waiting).
    Fiber(Arc<Fiber>),
    /// Run this callback.
    Call(FiberFn),
}

#[derive(Default)]
struct EventSlot {
    /// Scheduler that registered the interest and receives the work.
    scheduler: Weak<Scheduler>,
    job: Option<EventJob>,
}

struct FdContextInner {
    /// Registered directions as an epoll mask (EPOLLIN/EPOLLOUT bits).
    events: u32,
    read: EventSlot,
    write: EventSlot,
}

impl FdContextInner {
    fn slot_mut(&mut self, event: IoEvent) -> &mut EventSlot {
        match event {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }
}

/// Per-fd registration state. A slot is populated iff the matching bit is
/// set in `events`.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdContextInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdContextInner {
                events: 0,
                read: EventSlot::default(),
                write: EventSlot::default(),
            }),
        }
    }
}

/// The reactor core shared by the scheduler and the [`IoManager`] facade.
///
/// Holds the epoll instance, the self-pipe, the fd slot table, the pending
/// event count and the timer set. The scheduler keeps a strong reference so
/// `tickle` keeps working for the whole worker lifetime; the back-reference
/// to the scheduler is weak.
pub(crate) struct Reactor {
    poller: EventLoop,
    tickle_fds: [RawFd; 2],
    fd_contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    pending: AtomicUsize,
    timers: TimerManager,
    scheduler: OnceLock<Weak<Scheduler>>,
}

impl Reactor {
    pub(crate) fn new() -> Result<Reactor> {
        let poller = EventLoop::new()?;

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(RuntimeError::TicklePipe(io::Error::last_os_error()));
        }
        // Non-blocking read end so the edge-triggered drain can run dry.
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL) };
        let rc = if flags < 0 {
            flags
        } else {
            unsafe { libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) }
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(RuntimeError::TicklePipe(err));
        }
        if let Err(source) = poller.add(fds[0], IoEvent::Read.mask(), fds[0] as u64) {
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(RuntimeError::EpollCtl { fd: fds[0], source });
        }

        Ok(Reactor {
            poller,
            tickle_fds: fds,
            fd_contexts: RwLock::new(vec![None; 32]),
            pending: AtomicUsize::new(0),
            timers: TimerManager::new(),
            scheduler: OnceLock::new(),
        })
    }

    /// The reactor attached to the current thread's scheduler, if any.
    pub(crate) fn current() -> Option<Arc<Reactor>> {
        Scheduler::current().and_then(|s| s.reactor().cloned())
    }

    pub(crate) fn set_scheduler(&self, scheduler: Weak<Scheduler>) {
        let _ = self.scheduler.set(scheduler);
    }

    fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.get().and_then(Weak::upgrade)
    }

    pub(crate) fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// True when no registered events and no timers remain.
    pub(crate) fn idle_done(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && !self.timers.has_timer()
    }

    pub(crate) fn add_timer(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        self.timers.add_timer(ms, cb, recurring)
    }

    pub(crate) fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: TimerCallback,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.timers.add_condition_timer(ms, cb, witness, recurring)
    }

    pub(crate) fn set_timer_waker(&self, waker: Box<dyn Fn() + Send + Sync>) {
        self.timers.set_waker(waker);
    }

    fn lookup_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let table = self.fd_contexts.read().unwrap();
        table.get(fd as usize).and_then(|slot| slot.clone())
    }

    fn ensure_context(&self, fd: RawFd) -> Arc<FdContext> {
        if let Some(ctx) = self.lookup_context(fd) {
            return ctx;
        }
        let idx = fd as usize;
        let mut table = self.fd_contexts.write().unwrap();
        if table.len() <= idx {
            let new_len = idx + idx / 2 + 1;
            table.resize(new_len, None);
        }
        table[idx]
            .get_or_insert_with(|| Arc::new(FdContext::new(fd)))
            .clone()
    }

    /// Register one-shot interest in `event` on `fd`.
    ///
    /// With `cb == None` the currently running fiber is stored and will be
    /// rescheduled when the event fires. Registering a direction that is
    /// already armed is a programmer error.
    pub(crate) fn add_event(
        &self,
        fd: RawFd,
        event: IoEvent,
        cb: Option<FiberFn>,
    ) -> Result<()> {
        if fd < 0 {
            return Err(RuntimeError::Io(io::Error::from_raw_os_error(libc::EBADF)));
        }
        let ctx = self.ensure_context(fd);
        let mut inner = ctx.inner.lock().unwrap();

        if inner.events & event.mask() != 0 {
            tracing::error!(
                "fd {} already has a {:?} event registered (mask {:#x})",
                fd,
                event,
                inner.events
            );
            return Err(RuntimeError::DuplicateEvent { fd, event });
        }

        let new_mask = inner.events | event.mask();
        let rc = if inner.events == 0 {
            self.poller.add(fd, new_mask, fd as u64)
        } else {
            self.poller.modify(fd, new_mask, fd as u64)
        };
        rc.map_err(|source| {
            tracing::error!("epoll_ctl for fd {} failed: {}", fd, source);
            RuntimeError::EpollCtl { fd, source }
        })?;
        set_nonblocking(fd);

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.events = new_mask;

        let scheduler = match Scheduler::current() {
            Some(s) => Arc::downgrade(&s),
            None => self.scheduler.get().cloned().unwrap_or_default(),
        };
        let slot = inner.slot_mut(event);
        debug_assert!(slot.job.is_none(), "slot for armed direction not empty");
        slot.scheduler = scheduler;
        slot.job = Some(match cb {
            Some(cb) => EventJob::Call(cb),
            None => {
                let fiber = Fiber::current();
                debug_assert_eq!(fiber.state(), FiberState::Running);
                EventJob::Fiber(fiber)
            }
        });
        Ok(())
    }

    /// Unregister `event` on `fd` without running its work.
    pub(crate) fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events & event.mask() == 0 {
            return false;
        }

        let left = inner.events & !event.mask();
        let rc = if left != 0 {
            self.poller.modify(fd, left, fd as u64)
        } else {
            self.poller.delete(fd)
        };
        if let Err(e) = rc {
            tracing::error!("del_event epoll_ctl for fd {} failed: {}", fd, e);
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.events = left;
        let slot = inner.slot_mut(event);
        slot.scheduler = Weak::new();
        slot.job = None;
        true
    }

    /// Unregister `event` on `fd`, firing its work once first.
    pub(crate) fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events & event.mask() == 0 {
            return false;
        }

        let left = inner.events & !event.mask();
        let rc = if left != 0 {
            self.poller.modify(fd, left, fd as u64)
        } else {
            self.poller.delete(fd)
        };
        if let Err(e) = rc {
            tracing::error!("cancel_event epoll_ctl for fd {} failed: {}", fd, e);
            return false;
        }

        Self::trigger(&mut inner, event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Unregister both directions on `fd`, firing any registered work.
    pub(crate) fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events == 0 {
            return false;
        }

        if let Err(e) = self.poller.delete(fd) {
            tracing::error!("cancel_all epoll_ctl for fd {} failed: {}", fd, e);
            return false;
        }
        if inner.events & IoEvent::Read.mask() != 0 {
            Self::trigger(&mut inner, IoEvent::Read);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events & IoEvent::Write.mask() != 0 {
            Self::trigger(&mut inner, IoEvent::Write);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert_eq!(inner.events, 0);
        true
    }

    /// Fire one registered direction: clear the bit, hand the stored work
    /// to its scheduler and reset the slot.
    fn trigger(inner: &mut FdContextInner, event: IoEvent) {
        debug_assert!(inner.events & event.mask() != 0);
        inner.events &= !event.mask();
        let slot = inner.slot_mut(event);
        let scheduler = slot.scheduler.upgrade();
        let job = slot.job.take();
        slot.scheduler = Weak::new();
        match (scheduler, job) {
            (Some(sched), Some(EventJob::Fiber(fiber))) => sched.schedule_fiber(fiber),
            (Some(sched), Some(EventJob::Call(cb))) => sched.schedule_task(Task::call_boxed(cb)),
            _ => tracing::error!("event fired with no scheduler or job attached"),
        }
    }

    /// Wake one worker blocked in the reactor wait. Skipped when no worker
    /// is idle: the queue will be seen on the next dispatch pass anyway.
    pub(crate) fn tickle(&self) {
        let Some(sched) = self.scheduler() else {
            return;
        };
        if !sched.has_idle_threads() {
            return;
        }
        let rc = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        if rc != 1 {
            tracing::error!("tickle write failed: {}", io::Error::last_os_error());
        }
    }

    /// The reactor loop run by every worker's idle fiber.
    pub(crate) fn idle(&self) {
        tracing::debug!("reactor idle loop entered");
        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(MAX_EVENTS);
        loop {
            let Some(sched) = self.scheduler() else {
                break;
            };
            let next_timeout = self.timers.next_timer_ms();
            if sched.stopping() {
                // Pass the wakeup along so the remaining workers do not
                // ride out the full wait cap before noticing.
                self.tickle();
                tracing::debug!("reactor idle loop exiting");
                break;
            }
            drop(sched);

            let wait_ms = next_timeout.min(MAX_TIMEOUT_MS) as i32;
            if let Err(e) = self.poller.wait(&mut events, wait_ms) {
                tracing::error!("epoll_wait failed: {}", e);
                continue;
            }

            for cb in self.timers.take_expired() {
                if let Some(sched) = self.scheduler() {
                    sched.schedule(move || cb());
                }
            }

            for ev in &events {
                let token = ev.u64;
                let revents = ev.events;
                if token == self.tickle_fds[0] as u64 {
                    // Just drain the notification bytes; edge-triggered, so
                    // read until dry.
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(
                            self.tickle_fds[0],
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    } > 0
                    {}
                    continue;
                }

                let fd = token as RawFd;
                let Some(ctx) = self.lookup_context(fd) else {
                    continue;
                };
                let mut inner = ctx.inner.lock().unwrap();

                let mut revents = revents;
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // Error or hangup wakes both directions, but only the
                    // ones actually registered.
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events;
                }
                let mut real = 0u32;
                if revents & IoEvent::Read.mask() != 0 {
                    real |= IoEvent::Read.mask();
                }
                if revents & IoEvent::Write.mask() != 0 {
                    real |= IoEvent::Write.mask();
                }
                if inner.events & real == 0 {
                    continue;
                }

                // Drop the fired directions from the kernel mask before
                // handing the work over.
                let left = inner.events & !real;
                let rc = if left != 0 {
                    self.poller.modify(ctx.fd, left, token)
                } else {
                    self.poller.delete(ctx.fd)
                };
                if let Err(e) = rc {
                    tracing::error!("re-arm epoll_ctl for fd {} failed: {}", ctx.fd, e);
                    continue;
                }

                if real & IoEvent::Read.mask() != 0 {
                    Self::trigger(&mut inner, IoEvent::Read);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if real & IoEvent::Write.mask() != 0 {
                    Self::trigger(&mut inner, IoEvent::Write);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Let the dispatch loop pick up whatever got scheduled.
            Fiber::yield_now();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
        tracing::debug!("reactor dropped");
    }
}

fn set_nonblocking(fd: RawFd) {
    let fcntl = crate::hook::origin::fcntl_f();
    let flags = unsafe { fcntl(fd, libc::F_GETFL) };
    if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
        unsafe { fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    }
}

/// Scheduler + reactor + timers behind one handle.
///
/// Dropping the manager stops the scheduler (pending tasks, events and
/// timers are drained first) and then releases the kernel resources.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    reactor: Arc<Reactor>,
}

impl IoManager {
    /// Build the reactor, attach it to a new scheduler and start the pool.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        let reactor = Arc::new(Reactor::new()?);
        let scheduler = Scheduler::new(threads, use_caller, name);
        reactor.set_scheduler(Arc::downgrade(&scheduler));
        {
            let weak = Arc::downgrade(&reactor);
            reactor.set_timer_waker(Box::new(move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.tickle();
                }
            }));
        }

        let manager = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            scheduler.attach_reactor(reactor.clone(), weak.clone());
            IoManager {
                scheduler: scheduler.clone(),
                reactor,
            }
        });
        manager.scheduler.start();
        tracing::debug!("io manager {} running", name);
        Ok(manager)
    }

    /// The manager owning the current thread's scheduler, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        Scheduler::current().and_then(|s| s.io_manager())
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Queue a callback onto the worker pool.
    pub fn schedule(&self, cb: impl FnOnce() + Send + 'static) {
        self.scheduler.schedule(cb);
    }

    /// Queue a fiber onto the worker pool.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler.schedule_fiber(fiber);
    }

    /// Register interest in `event` on `fd`, resuming the calling fiber
    /// when it fires.
    pub fn add_event(&self, fd: RawFd, event: IoEvent) -> Result<()> {
        self.reactor.add_event(fd, event, None)
    }

    /// Register interest in `event` on `fd`, running `cb` when it fires.
    pub fn add_event_cb(
        &self,
        fd: RawFd,
        event: IoEvent,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.reactor.add_event(fd, event, Some(Box::new(cb)))
    }

    /// Drop a registered direction without firing it.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        self.reactor.del_event(fd, event)
    }

    /// Drop a registered direction, firing its work once.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        self.reactor.cancel_event(fd, event)
    }

    /// Drop both directions on `fd`, firing anything registered.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor.cancel_all(fd)
    }

    /// Number of armed, not-yet-fired event registrations.
    pub fn pending_events(&self) -> usize {
        self.reactor.pending_events()
    }

    /// Arm a timer `ms` milliseconds out.
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.reactor.add_timer(ms, Arc::new(cb), recurring)
    }

    /// Arm a timer gated on `witness` still being alive when it fires.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.reactor
            .add_condition_timer(ms, Arc::new(cb), witness, recurring)
    }

    /// Stop the scheduler, draining queued tasks, armed events and timers.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        tracing::debug!("io manager {} shutting down", self.scheduler.name());
        self.scheduler.stop();
    }
}
