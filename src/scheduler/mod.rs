//! N:M fiber scheduler.
//!
//! A scheduler multiplexes a FIFO queue of tasks (fibers or plain callbacks,
//! optionally pinned to one OS thread) onto a pool of worker threads. Each
//! worker runs the dispatch loop on its own scheduling fiber; task fibers
//! swap against that fiber, so a yield lands back in the dispatch loop
//! rather than unwinding the worker.
//!
//! With `use_caller` the constructing thread is enrolled as a worker: a
//! dedicated scheduling fiber is created up front, and `stop()` drives it on
//! the caller thread until the queue drains.
//!
//! On its own the scheduler busy-rotates between the dispatch loop and an
//! idle fiber. The I/O manager attaches a reactor that replaces the idle
//! fiber's body with an epoll wait and gives `tickle` a real wakeup
//! mechanism.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;

use crate::fiber::{Fiber, FiberFn, FiberState};
use crate::io::{IoManager, Reactor};
use crate::util;

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
    static SCHEDULING_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// The per-worker scheduling fiber (the dispatch loop's own context).
pub(crate) fn scheduling_fiber() -> Option<Arc<Fiber>> {
    SCHEDULING_FIBER.with(|c| c.borrow().clone())
}

enum TaskPayload {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

/// One queued unit of work: a fiber to resume or a callback to run, plus an
/// optional OS thread id it is pinned to (-1 = any worker).
pub struct Task {
    payload: TaskPayload,
    thread: libc::pid_t,
}

impl Task {
    /// A callback task runnable on any worker.
    pub fn call(cb: impl FnOnce() + Send + 'static) -> Task {
        Task {
            payload: TaskPayload::Call(Box::new(cb)),
            thread: -1,
        }
    }

    /// A fiber task runnable on any worker.
    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            payload: TaskPayload::Fiber(fiber),
            thread: -1,
        }
    }

    /// Pin the task to one OS thread id.
    pub fn pinned_to(mut self, thread: libc::pid_t) -> Task {
        self.thread = thread;
        self
    }

    pub(crate) fn call_boxed(cb: FiberFn) -> Task {
        Task {
            payload: TaskPayload::Call(cb),
            thread: -1,
        }
    }
}

struct SchedulerState {
    tasks: VecDeque<Task>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// Fiber scheduler over a pool of worker threads.
pub struct Scheduler {
    name: String,
    /// Number of worker threads this scheduler spawns (excludes the caller).
    thread_count: usize,
    use_caller: bool,
    /// OS thread id of the caller when `use_caller`, else -1.
    root_thread: libc::pid_t,
    /// The caller thread's scheduling fiber when `use_caller`.
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    state: Mutex<SchedulerState>,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stopping: AtomicBool,
    /// Installed by the I/O manager; replaces tickle/idle/stopping behavior.
    reactor: OnceLock<Arc<Reactor>>,
    io: OnceLock<Weak<IoManager>>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers. When `use_caller` is true
    /// the constructing thread counts as one of them and must later call
    /// [`Scheduler::stop`] itself.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one thread");

        let scheduler = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let mut thread_count = threads;
            let mut root_thread = -1;
            let mut root_fiber = None;

            if use_caller {
                thread_count -= 1;
                // Enroll the caller: it needs a main fiber and a dedicated
                // scheduling fiber that stop() will drive.
                Fiber::current();
                if Scheduler::current().is_some() {
                    tracing::error!("thread already has a scheduler, {} will shadow it", name);
                }
                root_thread = util::thread_id();
                let w = weak.clone();
                let fiber = Fiber::new(
                    move || {
                        if let Some(sched) = w.upgrade() {
                            sched.run();
                        }
                    },
                    0,
                    false,
                )
                .expect("caller scheduling fiber");
                root_fiber = Some(fiber);
            }

            Scheduler {
                name: name.to_string(),
                thread_count,
                use_caller,
                root_thread,
                root_fiber: Mutex::new(root_fiber),
                state: Mutex::new(SchedulerState {
                    tasks: VecDeque::new(),
                    workers: Vec::new(),
                }),
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                reactor: OnceLock::new(),
                io: OnceLock::new(),
            }
        });

        if use_caller {
            CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(scheduler.clone()));
            let root = scheduler.root_fiber.lock().unwrap().clone();
            SCHEDULING_FIBER.with(|c| *c.borrow_mut() = root);
        }
        tracing::debug!(
            "scheduler {} created: {} workers, use_caller={}",
            name,
            scheduler.thread_count,
            use_caller
        );
        scheduler
    }

    /// The scheduler owning the current thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().clone())
    }

    /// The calling thread's scheduling fiber, if the thread belongs to a
    /// scheduler.
    pub fn main_fiber() -> Option<Arc<Fiber>> {
        scheduling_fiber()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a callback for any worker.
    pub fn schedule(&self, cb: impl FnOnce() + Send + 'static) {
        self.schedule_task(Task::call(cb));
    }

    /// Queue a callback pinned to one OS thread.
    pub fn schedule_to(&self, thread: libc::pid_t, cb: impl FnOnce() + Send + 'static) {
        self.schedule_task(Task::call(cb).pinned_to(thread));
    }

    /// Queue a fiber for any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_task(Task::fiber(fiber));
    }

    /// Queue a fiber pinned to one OS thread.
    pub fn schedule_fiber_to(&self, thread: libc::pid_t, fiber: Arc<Fiber>) {
        self.schedule_task(Task::fiber(fiber).pinned_to(thread));
    }

    /// Queue a single task, waking a sleeping worker if the queue was empty.
    pub fn schedule_task(&self, task: Task) {
        let need_tickle = {
            let mut state = self.state.lock().unwrap();
            let was_empty = state.tasks.is_empty();
            state.tasks.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queue several tasks atomically with at most one wakeup.
    pub fn schedule_batch(&self, tasks: impl IntoIterator<Item = Task>) {
        let need_tickle = {
            let mut state = self.state.lock().unwrap();
            let was_empty = state.tasks.is_empty();
            state.tasks.extend(tasks);
            was_empty && !state.tasks.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Spawn the worker threads. Does nothing if already started.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if self.stopping.load(Ordering::SeqCst) {
            tracing::error!("scheduler {} cannot start after stop", self.name);
            return;
        }
        if !state.workers.is_empty() {
            return;
        }
        for i in 0..self.thread_count {
            let sched = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || sched.run())
                .expect("spawn scheduler worker");
            state.workers.push(handle);
        }
        tracing::debug!("scheduler {} started {} workers", self.name, self.thread_count);
    }

    /// Stop the scheduler: wake every worker, drain the caller's scheduling
    /// fiber when `use_caller`, and join the pool. Pending work is executed,
    /// not discarded.
    pub fn stop(self: &Arc<Self>) {
        if self.stopping() {
            return;
        }
        tracing::debug!("scheduler {} stopping", self.name);
        self.stopping.store(true, Ordering::SeqCst);

        if self.use_caller {
            let on_caller = Scheduler::current()
                .map(|s| Arc::ptr_eq(&s, self))
                .unwrap_or(false);
            if !on_caller {
                tracing::error!("stop() of {} must run on its caller thread", self.name);
            }
        }

        for _ in 0..self.thread_count {
            self.tickle();
        }
        let root = self.root_fiber.lock().unwrap().clone();
        if root.is_some() {
            self.tickle();
        }
        if let Some(root) = root {
            // Consume the queue on the caller thread until the dispatch
            // loop exits.
            while root.state() != FiberState::Term {
                root.resume();
            }
            tracing::debug!("caller scheduling fiber of {} finished", self.name);
        }

        let workers = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.workers)
        };
        for worker in workers {
            let _ = worker.join();
        }

        if self.use_caller {
            CURRENT_SCHEDULER.with(|c| c.borrow_mut().take());
            SCHEDULING_FIBER.with(|c| c.borrow_mut().take());
        }
        tracing::debug!("scheduler {} stopped", self.name);
    }

    /// Whether the scheduler has fully wound down: stop was requested, the
    /// queue is empty, no worker is mid-task, and (with a reactor attached)
    /// no I/O events or timers remain.
    pub fn stopping(&self) -> bool {
        let base = self.stopping.load(Ordering::SeqCst)
            && self.active_threads.load(Ordering::SeqCst) == 0
            && self.state.lock().unwrap().tasks.is_empty();
        match self.reactor.get() {
            Some(reactor) => base && reactor.idle_done(),
            None => base,
        }
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn attach_reactor(&self, reactor: Arc<Reactor>, io: Weak<IoManager>) {
        if self.reactor.set(reactor).is_err() {
            tracing::error!("scheduler {} already has a reactor", self.name);
        }
        let _ = self.io.set(io);
    }

    pub(crate) fn reactor(&self) -> Option<&Arc<Reactor>> {
        self.reactor.get()
    }

    pub(crate) fn io_manager(&self) -> Option<Arc<IoManager>> {
        self.io.get().and_then(Weak::upgrade)
    }

    /// Wake a sleeping worker. Without a reactor the idle fiber busy-spins,
    /// so there is nobody to wake.
    pub(crate) fn tickle(&self) {
        match self.reactor.get() {
            Some(reactor) => reactor.tickle(),
            None => tracing::debug!("scheduler {} tickle", self.name),
        }
    }

    /// Body of the per-worker idle fiber.
    fn idle(&self) {
        tracing::debug!("scheduler {} idle fiber running", self.name);
        match self.reactor.get() {
            Some(reactor) => reactor.idle(),
            None => {
                while !self.stopping() {
                    Fiber::yield_now();
                }
            }
        }
    }

    /// Worker dispatch loop. Runs on each pool thread and, via the caller's
    /// scheduling fiber, on the caller thread during `stop()`.
    fn run(self: &Arc<Self>) {
        tracing::debug!("scheduler {} worker running", self.name);
        crate::hook::set_hook_enabled(true);
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(self.clone()));

        let tid = util::thread_id();
        if tid != self.root_thread {
            // Pool thread: its main fiber doubles as the scheduling fiber.
            SCHEDULING_FIBER.with(|c| *c.borrow_mut() = Some(Fiber::current()));
        }

        let weak = Arc::downgrade(self);
        let idle_fiber = Fiber::new(
            move || {
                if let Some(sched) = weak.upgrade() {
                    sched.idle();
                }
            },
            0,
            true,
        )
        .expect("idle fiber");
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut task = None;
            {
                let mut state = self.state.lock().unwrap();
                let mut i = 0;
                while i < state.tasks.len() {
                    let pinned = state.tasks[i].thread;
                    if pinned != -1 && pinned != tid {
                        // Pinned to another worker; leave it and make sure
                        // that worker gets woken.
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    task = state.tasks.remove(i);
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                if task.is_some() {
                    tickle_me = tickle_me || i < state.tasks.len();
                }
            }
            if tickle_me {
                self.tickle();
            }

            match task {
                Some(Task {
                    payload: TaskPayload::Fiber(fiber),
                    thread,
                }) => {
                    match fiber.state() {
                        FiberState::Ready => fiber.resume(),
                        FiberState::Running => {
                            // Scheduled from another worker before it
                            // finished switching out; retry shortly.
                            self.schedule_task(Task::fiber(fiber).pinned_to(thread));
                        }
                        FiberState::Term => {
                            tracing::debug!("discarding terminated fiber task");
                        }
                    }
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Task {
                    payload: TaskPayload::Call(cb),
                    ..
                }) => {
                    let reuse = cb_fiber
                        .as_ref()
                        .map(|f| f.state() == FiberState::Term)
                        .unwrap_or(false);
                    let runner = if reuse {
                        let fiber = cb_fiber.clone().unwrap();
                        if let Err(e) = fiber.reset(cb) {
                            tracing::error!("callback fiber reset failed: {}", e);
                            self.active_threads.fetch_sub(1, Ordering::SeqCst);
                            continue;
                        }
                        fiber
                    } else {
                        match Fiber::new(cb, 0, true) {
                            Ok(fiber) => {
                                cb_fiber = Some(fiber.clone());
                                fiber
                            }
                            Err(e) => {
                                tracing::error!("callback fiber creation failed: {}", e);
                                self.active_threads.fetch_sub(1, Ordering::SeqCst);
                                continue;
                            }
                        }
                    };
                    runner.resume();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    if runner.state() != FiberState::Term {
                        // The callback suspended mid-flight; it now owns its
                        // own rescheduling and this stack cannot be reused.
                        cb_fiber = None;
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        tracing::debug!("scheduler {} idle fiber terminated", self.name);
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        if tid != self.root_thread {
            CURRENT_SCHEDULER.with(|c| c.borrow_mut().take());
            SCHEDULING_FIBER.with(|c| c.borrow_mut().take());
        }
        tracing::debug!("scheduler {} worker exiting", self.name);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        tracing::debug!("scheduler {} dropped", self.name);
    }
}
