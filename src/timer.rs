//! Deadline-ordered timers, driven by [`crate::clock::current_ms`].
//!
//! A [`TimerManager`] is a cheaply cloneable handle around a shared,
//! mutex-protected set of pending [`Timer`]s, ordered by `(deadline,
//! sequence)` so that ties between timers scheduled for the same
//! millisecond resolve deterministically. [`crate::iomanager::IoManager`]
//! owns one and polls it each time its epoll wait returns (or is about to
//! block), using [`TimerManager::next_timeout_ms`] to bound how long it is
//! allowed to block and [`TimerManager::drain_expired`] to collect the
//! callbacks that are now due.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::clock::current_ms;

/// A clock rollback larger than this is treated as a rollover rather than
/// ordinary small NTP jitter, and expires every pending timer immediately.
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

struct TimerState {
    timers: BTreeSet<Arc<Timer>>,
    tickled: bool,
    previous_time_ms: u64,
}

struct TimerManagerInner {
    on_timer_inserted_at_front: Box<dyn Fn() + Send + Sync>,
    state: Mutex<TimerState>,
    sequence: AtomicU64,
}

/// A shared handle to a set of pending timers.
///
/// Cloning a `TimerManager` shares the same underlying timer set — it is a
/// thin `Arc` wrapper, not a separate manager.
#[derive(Clone)]
pub struct TimerManager(Arc<TimerManagerInner>);

impl TimerManager {
    /// Create an empty timer manager. `on_timer_inserted_at_front` is
    /// invoked (outside any lock) whenever a newly added or refreshed timer
    /// becomes the new earliest deadline, so that a blocked reactor can be
    /// woken up to recompute how long it's allowed to sleep.
    pub fn new(on_timer_inserted_at_front: impl Fn() + Send + Sync + 'static) -> Self {
        TimerManager(Arc::new(TimerManagerInner {
            on_timer_inserted_at_front: Box::new(on_timer_inserted_at_front),
            state: Mutex::new(TimerState {
                timers: BTreeSet::new(),
                tickled: false,
                previous_time_ms: current_ms(),
            }),
            sequence: AtomicU64::new(0),
        }))
    }

    /// Schedule `cb` to run after `ms` milliseconds, repeating every `ms`
    /// milliseconds if `recurring` is set.
    pub fn add_timer(
        &self,
        cb: impl FnMut() + Send + 'static,
        ms: u64,
        recurring: bool,
    ) -> Arc<Timer> {
        let sequence = self.0.sequence.fetch_add(1, Ordering::Relaxed);
        let timer = Arc::new(Timer {
            sequence,
            next_ms: AtomicU64::new(current_ms() + ms),
            interval_ms: AtomicU64::new(ms),
            recurring,
            cb: Mutex::new(Box::new(cb)),
            manager: Arc::downgrade(&self.0),
        });
        let mut state = self.0.state.lock().unwrap();
        let should_notify = self.insert_locked(&mut state, timer.clone());
        drop(state);
        if should_notify {
            (self.0.on_timer_inserted_at_front)();
        }
        timer
    }

    /// Like [`TimerManager::add_timer`], but `cb` only runs if `cond` can
    /// still be upgraded when the deadline fires — a racy-safe way to
    /// cancel a timer whose owner may have already been dropped, mirroring
    /// the original's `weak_ptr<void>` condition parameter.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        mut cb: impl FnMut() + Send + 'static,
        ms: u64,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer> {
        self.add_timer(
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            ms,
            recurring,
        )
    }

    /// Insert `timer` into `state` (already locked by the caller) and
    /// report whether [`TimerManagerInner::on_timer_inserted_at_front`]
    /// needs to run. The caller is responsible for dropping the lock
    /// before acting on a `true` result, so the hook never runs while the
    /// timer mutex is held.
    fn insert_locked(&self, state: &mut TimerState, timer: Arc<Timer>) -> bool {
        let sequence = timer.sequence;
        state.timers.insert(timer);
        let inserted_at_front = state
            .timers
            .iter()
            .next()
            .map(|t| t.sequence == sequence)
            .unwrap_or(false);
        let should_notify = inserted_at_front && !state.tickled;
        if should_notify {
            state.tickled = true;
        }
        should_notify
    }

    /// Milliseconds until the next timer is due, `Some(0)` if one is
    /// already overdue, or `None` if there are no pending timers.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        let mut state = self.0.state.lock().unwrap();
        state.tickled = false;
        let next = state.timers.iter().next()?;
        let now = current_ms();
        let next_ms = next.next_ms.load(Ordering::Relaxed);
        Some(next_ms.saturating_sub(now))
    }

    pub fn has_timer(&self) -> bool {
        !self.0.state.lock().unwrap().timers.is_empty()
    }

    /// Remove and return every timer that is now due, rearming any
    /// recurring ones for their next deadline. Callbacks are not invoked by
    /// this call — the caller runs [`Timer::fire`] on each after releasing
    /// whatever locks it's holding, matching the original's two-phase
    /// "collect expired, then invoke" design.
    pub fn drain_expired(&self) -> Vec<Arc<Timer>> {
        let now = current_ms();
        let mut state = self.0.state.lock().unwrap();
        if state.timers.is_empty() {
            return Vec::new();
        }

        let rollover = {
            let previous = state.previous_time_ms;
            state.previous_time_ms = now;
            now < previous && now < previous.saturating_sub(ROLLOVER_THRESHOLD_MS)
        };

        if !rollover {
            let earliest = state.timers.iter().next().unwrap().next_ms.load(Ordering::Relaxed);
            if earliest > now {
                return Vec::new();
            }
        }

        let expired: Vec<Arc<Timer>> = if rollover {
            state.timers.iter().cloned().collect()
        } else {
            state
                .timers
                .iter()
                .take_while(|t| t.next_ms.load(Ordering::Relaxed) <= now)
                .cloned()
                .collect()
        };

        for timer in &expired {
            state.timers.remove(timer);
        }

        for timer in &expired {
            if timer.recurring {
                timer
                    .next_ms
                    .store(now + timer.interval_ms.load(Ordering::Relaxed), Ordering::Relaxed);
                state.timers.insert(timer.clone());
            }
        }

        expired
    }
}

/// A single pending or recurring deadline.
pub struct Timer {
    sequence: u64,
    next_ms: AtomicU64,
    interval_ms: AtomicU64,
    recurring: bool,
    cb: Mutex<Box<dyn FnMut() + Send>>,
    manager: Weak<TimerManagerInner>,
}

impl Timer {
    /// Invoke this timer's callback. Meant to be called by whoever drained
    /// this timer from its manager, after releasing the manager's lock.
    pub fn fire(&self) {
        (self.cb.lock().unwrap())();
    }

    /// Cancel this timer. Returns `false` if it had already fired (for a
    /// non-recurring timer) or been cancelled.
    pub fn cancel(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut state = manager.state.lock().unwrap();
        state.timers.remove(self)
    }

    /// Push this timer's next deadline out by its configured interval,
    /// starting from now. Returns `false` if the timer is not currently
    /// pending.
    pub fn refresh(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut state = manager.state.lock().unwrap();
        if !state.timers.remove(self) {
            return false;
        }
        self.next_ms
            .store(current_ms() + self.interval_ms.load(Ordering::Relaxed), Ordering::Relaxed);
        state.timers.insert(self.clone());
        true
    }

    /// Change this timer's interval to `ms`, either starting from now or
    /// preserving its original start time. Returns `false` if the timer is
    /// not currently pending.
    pub fn reset(self: &Arc<Self>, ms: u64, from_now: bool) -> bool {
        if ms == self.interval_ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut state = manager.state.lock().unwrap();
        if !state.timers.remove(self) {
            return false;
        }
        let start = if from_now {
            current_ms()
        } else {
            self.next_ms.load(Ordering::Relaxed) - self.interval_ms.load(Ordering::Relaxed)
        };
        self.interval_ms.store(ms, Ordering::Relaxed);
        self.next_ms.store(start + ms, Ordering::Relaxed);
        let handle = TimerManager(manager.clone());
        let should_notify = handle.insert_locked(&mut state, self.clone());
        drop(state);
        if should_notify {
            (handle.0.on_timer_inserted_at_front)();
        }
        true
    }

    pub fn deadline_ms(&self) -> u64 {
        self.next_ms.load(Ordering::Relaxed)
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.next_ms.load(Ordering::Relaxed) == other.next_ms.load(Ordering::Relaxed)
            && self.sequence == other.sequence
    }
}
impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.next_ms
            .load(Ordering::Relaxed)
            .cmp(&other.next_ms.load(Ordering::Relaxed))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn orders_by_deadline() {
        let mgr = TimerManager::new(|| {});
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f1 = fired.clone();
        mgr.add_timer(move || f1.lock().unwrap().push(1), 50, false);
        let f2 = fired.clone();
        mgr.add_timer(move || f2.lock().unwrap().push(2), 10, false);

        std::thread::sleep(std::time::Duration::from_millis(60));
        let expired = mgr.drain_expired();
        for t in &expired {
            t.fire();
        }
        assert_eq!(*fired.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let mgr = TimerManager::new(|| {});
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let t = mgr.add_timer(move || { c.fetch_add(1, Ordering::SeqCst); }, 1000, false);
        assert!(t.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn recurring_timer_is_rearmed() {
        let mgr = TimerManager::new(|| {});
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        mgr.add_timer(move || { c.fetch_add(1, Ordering::SeqCst); }, 5, true);

        std::thread::sleep(std::time::Duration::from_millis(20));
        let expired = mgr.drain_expired();
        assert_eq!(expired.len(), 1);
        expired[0].fire();
        assert!(mgr.has_timer());
    }

    #[test]
    fn condition_timer_skips_callback_after_drop() {
        let mgr = TimerManager::new(|| {});
        let witness = Arc::new(());
        let weak = Arc::downgrade(&witness);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        mgr.add_condition_timer(move || { c.fetch_add(1, Ordering::SeqCst); }, 5, weak, false);
        drop(witness);

        std::thread::sleep(std::time::Duration::from_millis(15));
        let expired = mgr.drain_expired();
        for t in &expired {
            t.fire();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn next_timeout_reflects_earliest_deadline() {
        let mgr = TimerManager::new(|| {});
        assert_eq!(mgr.next_timeout_ms(), None);
        mgr.add_timer(|| {}, 100, false);
        let remaining = mgr.next_timeout_ms().unwrap();
        assert!(remaining <= 100);
    }
}
