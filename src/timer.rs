//! Ordered timer set.
//!
//! Timers are kept in a map ordered by (deadline, id) so the front entry is
//! always the next one due. The reactor asks for [`TimerManager::next_timer_ms`]
//! to size its wait and drains due callbacks with [`TimerManager::take_expired`].
//! Handles returned by `add_timer` support cancel/refresh/reset from any
//! thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use crate::util::now_ms;

/// Callback type for timers. `Fn` rather than `FnOnce` because recurring
/// timers fire repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Clock steps larger than this are treated as a rollback and drain every
/// pending timer rather than stalling them for the difference.
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct TimerInner {
    deadline_ms: u64,
    period_ms: u64,
    recurring: bool,
    /// Cleared on cancel and after a one-shot firing.
    cb: Option<TimerCallback>,
}

struct TimerNode {
    id: u64,
    shared: Weak<TimerShared>,
    inner: Mutex<TimerInner>,
}

/// Handle to a pending timer.
#[derive(Clone)]
pub struct Timer {
    node: Arc<TimerNode>,
}

impl Timer {
    /// Cancel the timer. Safe to call repeatedly and from any thread;
    /// returns whether the timer was still pending.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.node.shared.upgrade() else {
            return false;
        };
        let mut inner = self.node.inner.lock().unwrap();
        if inner.cb.is_none() {
            return false;
        }
        inner.cb = None;
        let key = (inner.deadline_ms, self.node.id);
        shared.timers.write().unwrap().remove(&key);
        true
    }

    /// Push the deadline out to `now + period`. Never moves a deadline
    /// earlier. A timer that already fired (or was cancelled) refuses.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.node.shared.upgrade() else {
            return false;
        };
        let mut inner = self.node.inner.lock().unwrap();
        if inner.cb.is_none() {
            return false;
        }
        let old_key = (inner.deadline_ms, self.node.id);
        let mut timers = shared.timers.write().unwrap();
        timers.remove(&old_key);
        inner.deadline_ms = now_ms() + inner.period_ms;
        timers.insert((inner.deadline_ms, self.node.id), self.node.clone());
        true
    }

    /// Change the period and recompute the deadline, either from now or
    /// from the original start point.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.node.shared.upgrade() else {
            return false;
        };
        let deadline = {
            let mut inner = self.node.inner.lock().unwrap();
            if inner.cb.is_none() {
                return false;
            }
            if ms == inner.period_ms && !from_now {
                return true;
            }
            let old_key = (inner.deadline_ms, self.node.id);
            shared.timers.write().unwrap().remove(&old_key);
            let start = if from_now {
                now_ms()
            } else {
                inner.deadline_ms.saturating_sub(inner.period_ms)
            };
            inner.period_ms = ms;
            inner.deadline_ms = start + ms;
            inner.deadline_ms
        };
        shared.insert_node(self.node.clone(), deadline);
        true
    }
}

struct TimerShared {
    timers: RwLock<BTreeMap<(u64, u64), Arc<TimerNode>>>,
    /// Set when the front of the set changed and the waker already ran;
    /// cleared every time the owner recomputes its wait.
    tickled: AtomicBool,
    previous_ms: AtomicU64,
    waker: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerShared {
    /// Insert and run the waker when the new timer became the front entry.
    fn insert_node(self: &Arc<Self>, node: Arc<TimerNode>, deadline: u64) {
        let notify = {
            let mut timers = self.timers.write().unwrap();
            let key = (deadline, node.id);
            timers.insert(key, node);
            let at_front = timers.keys().next() == Some(&key);
            at_front && !self.tickled.swap(true, Ordering::Relaxed)
        };
        if notify {
            if let Some(waker) = self.waker.get() {
                waker();
            }
        }
    }
}

/// The timer set. Owned by the I/O manager; the reactor loop drives it.
pub(crate) struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                timers: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                previous_ms: AtomicU64::new(now_ms()),
                waker: OnceLock::new(),
            }),
        }
    }

    /// Install the front-insertion waker. May only be set once.
    pub fn set_waker(&self, waker: Box<dyn Fn() + Send + Sync>) {
        if self.shared.waker.set(waker).is_err() {
            tracing::error!("timer waker installed twice");
        }
    }

    /// Add a timer firing `ms` from now.
    pub fn add_timer(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let node = Arc::new(TimerNode {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            shared: Arc::downgrade(&self.shared),
            inner: Mutex::new(TimerInner {
                deadline_ms: now_ms() + ms,
                period_ms: ms,
                recurring,
                cb: Some(cb),
            }),
        });
        let deadline = node.inner.lock().unwrap().deadline_ms;
        self.shared.insert_node(node.clone(), deadline);
        Timer { node }
    }

    /// Add a timer whose firing is gated on `witness` still being alive.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: TimerCallback,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        let gated: TimerCallback = Arc::new(move || {
            if witness.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(ms, gated, recurring)
    }

    /// Milliseconds until the next timer is due, saturating at zero;
    /// `u64::MAX` when the set is empty.
    pub fn next_timer_ms(&self) -> u64 {
        self.shared.tickled.store(false, Ordering::Relaxed);
        let timers = self.shared.timers.read().unwrap();
        match timers.keys().next() {
            Some(&(deadline, _)) => deadline.saturating_sub(now_ms()),
            None => u64::MAX,
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.timers.read().unwrap().is_empty()
    }

    /// Remove every timer with deadline <= now and return their callbacks
    /// in deadline order. Recurring timers are re-armed at `now + period`.
    pub fn take_expired(&self) -> Vec<TimerCallback> {
        let now = now_ms();
        let previous = self.shared.previous_ms.swap(now, Ordering::Relaxed);
        let rollover = now < previous.saturating_sub(ROLLOVER_MS);
        if rollover {
            tracing::error!(
                "monotonic clock moved back from {} to {}, draining all timers",
                previous,
                now
            );
        }

        let expired = {
            let mut timers = self.shared.timers.write().unwrap();
            if timers.is_empty() {
                return Vec::new();
            }
            if rollover {
                std::mem::take(&mut *timers)
            } else {
                // Everything strictly after `now` stays.
                let rest = timers.split_off(&(now + 1, 0));
                std::mem::replace(&mut *timers, rest)
            }
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        let mut rearm = Vec::new();
        for node in expired.into_values() {
            let mut inner = node.inner.lock().unwrap();
            let Some(cb) = inner.cb.clone() else {
                continue; // cancelled between removal and dispatch
            };
            if inner.recurring {
                inner.deadline_ms = now + inner.period_ms;
                rearm.push((inner.deadline_ms, node.clone()));
            } else {
                inner.cb = None;
            }
            drop(inner);
            callbacks.push(cb);
        }
        if !rearm.is_empty() {
            let mut timers = self.shared.timers.write().unwrap();
            for (deadline, node) in rearm {
                timers.insert((deadline, node.id), node);
            }
        }
        callbacks
    }

    #[cfg(test)]
    fn force_previous(&self, ms: u64) {
        self.shared.previous_ms.store(ms, Ordering::Relaxed);
    }
}
