//! M:N task scheduler: a pool of worker threads draining a shared queue of
//! runnable fibers and plain closures.
//!
//! A bare [`Scheduler`] is already usable on its own — its idle loop just
//! spins the idle fiber until [`Scheduler::can_stop`] — but its real job is
//! to host an event-driven extension through [`SchedulerHooks`], which is
//! what [`crate::iomanager::IoManager`] plugs in to turn idle time into
//! `epoll_wait`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::fiber::{Fiber, FiberHandle};

fn thread_id() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// A unit of work a [`Scheduler`] can run: either an existing fiber (which
/// may have already run and yielded once before) or a plain closure, which
/// the scheduler wraps in a reusable per-thread fiber the first time it
/// runs.
pub enum Task {
    Fiber(FiberHandle),
    Callback(Box<dyn FnOnce() + Send>),
}

impl From<Arc<Fiber>> for Task {
    fn from(f: Arc<Fiber>) -> Self {
        Task::Fiber(FiberHandle(f))
    }
}

impl<F: FnOnce() + Send + 'static> From<F> for Task {
    fn from(f: F) -> Self {
        Task::Callback(Box::new(f))
    }
}

struct ScheduleEntry {
    task: Task,
    thread: Option<i32>,
}

/// Extension points a [`Scheduler`] defers to when it would otherwise just
/// spin: what "there is new work" notification to send
/// ([`SchedulerHooks::tickle`]), what to do with genuinely idle time
/// ([`SchedulerHooks::idle`]), and whether any hook-specific condition
/// (pending I/O, pending timers) should keep the scheduler alive past its
/// own task-queue-empty check ([`SchedulerHooks::can_stop_extra`]).
pub trait SchedulerHooks: Send + Sync {
    fn tickle(&self, scheduler: &Scheduler);
    fn idle(&self, scheduler: &Arc<Scheduler>);
    fn can_stop_extra(&self, scheduler: &Scheduler) -> bool {
        let _ = scheduler;
        true
    }
    /// Called once on each thread that will run this scheduler's tasks
    /// (worker threads right after spawning, and the caller thread the one
    /// time its root fiber runs), before the run loop starts pulling tasks.
    /// [`crate::iomanager::IoManager`] uses this to install itself as this
    /// thread's "current IoManager" so [`crate::hook`] can find it.
    fn on_thread_start(&self, scheduler: &Arc<Scheduler>) {
        let _ = scheduler;
    }
}

/// The idle behavior of a [`Scheduler`] with no hooks installed: busy-yield
/// until the scheduler can stop. Sufficient for a scheduler that only ever
/// runs explicitly-scheduled fibers/closures and never waits on I/O.
pub struct DefaultHooks;

impl SchedulerHooks for DefaultHooks {
    fn tickle(&self, _scheduler: &Scheduler) {
        log::debug!(target: crate::log::SYSTEM, "tickle");
    }

    fn idle(&self, scheduler: &Arc<Scheduler>) {
        while !scheduler.can_stop() {
            Fiber::yield_now();
        }
    }
}

struct SchedulerState {
    tasks: VecDeque<ScheduleEntry>,
    worker_threads: Vec<JoinHandle<()>>,
    thread_ids: Vec<i32>,
}

/// A pool of worker threads (plus, optionally, the constructing thread
/// itself) cooperatively running scheduled fibers and closures.
pub struct Scheduler {
    name: String,
    hooks: Arc<dyn SchedulerHooks>,
    state: Mutex<SchedulerState>,
    thread_count: usize,
    use_caller: bool,
    root_thread_id: i32,
    root_fiber: Mutex<Option<FiberHandle>>,
    active_thread_count: AtomicUsize,
    idle_thread_count: AtomicUsize,
    stopping: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler with the default (busy-spin) idle hooks.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        Self::with_hooks(threads, use_caller, name, Arc::new(DefaultHooks))
    }

    /// Create a scheduler with custom extension hooks, e.g. the epoll-backed
    /// hooks [`crate::iomanager::IoManager`] installs.
    pub fn with_hooks(
        threads: usize,
        use_caller: bool,
        name: impl Into<String>,
        hooks: Arc<dyn SchedulerHooks>,
    ) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one thread");
        let worker_threads = if use_caller { threads - 1 } else { threads };

        let scheduler = Arc::new(Scheduler {
            name: name.into(),
            hooks,
            state: Mutex::new(SchedulerState {
                tasks: VecDeque::new(),
                worker_threads: Vec::new(),
                thread_ids: Vec::new(),
            }),
            thread_count: worker_threads,
            use_caller,
            root_thread_id: if use_caller { thread_id() } else { -1 },
            root_fiber: Mutex::new(None),
            active_thread_count: AtomicUsize::new(0),
            idle_thread_count: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
        });

        if use_caller {
            let root = {
                let sched = scheduler.clone();
                Fiber::new(move || sched.run(false), 0, false)
            };
            crate::fiber::set_scheduler_fiber(root.clone());
            *scheduler.root_fiber.lock().unwrap() = Some(FiberHandle(root));
            scheduler.state.lock().unwrap().thread_ids.push(scheduler.root_thread_id);
        }

        scheduler
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn has_idle_threads(&self) -> bool {
        self.idle_thread_count.load(Ordering::Relaxed) > 0
    }

    /// Start the worker thread pool. No-op (logs an error) if the scheduler
    /// has already been stopped.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if self.stopping.load(Ordering::Relaxed) {
            log::error!(target: crate::log::SYSTEM, "scheduler {} is stopped", self.name);
            return;
        }
        assert!(state.worker_threads.is_empty(), "scheduler already started");
        for i in 0..self.thread_count {
            let sched = self.clone();
            let name = format!("{}_{}", self.name, i);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || sched.run(true))
                .expect("failed to spawn scheduler worker thread");
            state.worker_threads.push(handle);
        }
    }

    /// Signal every worker (and the caller thread's root fiber, if any) to
    /// stop once the task queue drains, then block until all worker threads
    /// have exited.
    pub fn stop(self: &Arc<Self>) {
        self.stopping.store(true, Ordering::Relaxed);

        for _ in 0..self.thread_count {
            self.tickle();
        }

        let root_fiber = self.root_fiber.lock().unwrap().clone();
        if let Some(root) = &root_fiber {
            self.tickle();
            root.resume();
        }

        let threads = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.worker_threads)
        };
        for t in threads {
            let _ = t.join();
        }
    }

    pub fn tickle(&self) {
        self.hooks.clone().tickle(self);
    }

    /// Queue `task`, optionally pinned to a specific OS thread id.
    pub fn schedule(self: &Arc<Self>, task: impl Into<Task>, thread: Option<i32>) {
        let needs_tickle = {
            let mut state = self.state.lock().unwrap();
            self.schedule_locked(&mut state, task.into(), thread)
        };
        if needs_tickle {
            self.tickle();
        }
    }

    /// Queue many tasks at once, tickling at most once.
    pub fn schedule_range<T: Into<Task>>(self: &Arc<Self>, tasks: impl IntoIterator<Item = T>) {
        let needs_tickle = {
            let mut state = self.state.lock().unwrap();
            let mut needs_tickle = false;
            for task in tasks {
                needs_tickle |= self.schedule_locked(&mut state, task.into(), None);
            }
            needs_tickle
        };
        if needs_tickle {
            self.tickle();
        }
    }

    fn schedule_locked(&self, state: &mut SchedulerState, task: Task, thread: Option<i32>) -> bool {
        let needs_tickle = state.tasks.is_empty();
        state.tasks.push_back(ScheduleEntry { task, thread });
        needs_tickle
    }

    /// Whether the scheduler's task queue, active-thread count, and any
    /// hook-specific condition (pending I/O, pending timers) all agree
    /// there is nothing left to do.
    pub fn can_stop(&self) -> bool {
        let base = {
            let state = self.state.lock().unwrap();
            self.stopping.load(Ordering::Relaxed)
                && state.tasks.is_empty()
                && self.active_thread_count.load(Ordering::Relaxed) == 0
        };
        base && self.hooks.clone().can_stop_extra(self)
    }

    /// The worker loop. `is_worker_thread` is `false` only for the single
    /// invocation made from inside the `use_caller` root fiber, where the
    /// scheduler fiber was already registered at construction time.
    fn run(self: &Arc<Self>, is_worker_thread: bool) {
        log::debug!(target: crate::log::SYSTEM, "scheduler {} run starting", self.name);
        if is_worker_thread {
            crate::fiber::set_scheduler_fiber(Fiber::current());
            self.state.lock().unwrap().thread_ids.push(thread_id());
        }
        self.hooks.clone().on_thread_start(self);

        let idle_fiber = {
            let sched = self.clone();
            Fiber::new(move || sched.hooks.clone().idle(&sched), 0, true)
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;
        let this_thread = thread_id();

        loop {
            let mut tickle_me = false;
            let task = {
                let mut state = self.state.lock().unwrap();
                let mut found = None;
                let mut i = 0;
                while i < state.tasks.len() {
                    let pinned_elsewhere = matches!(state.tasks[i].thread, Some(t) if t != this_thread);
                    if pinned_elsewhere {
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    if let Task::Fiber(f) = &state.tasks[i].task {
                        if f.state() == crate::fiber::State::Running {
                            i += 1;
                            continue;
                        }
                    }
                    found = Some(state.tasks.remove(i).unwrap());
                    break;
                }
                tickle_me |= i < state.tasks.len();
                found
            };

            if tickle_me {
                self.tickle();
            }

            match task {
                Some(ScheduleEntry { task: Task::Fiber(f), .. }) => {
                    self.active_thread_count.fetch_add(1, Ordering::Relaxed);
                    f.resume();
                    self.active_thread_count.fetch_sub(1, Ordering::Relaxed);
                }
                Some(ScheduleEntry { task: Task::Callback(cb), .. }) => {
                    // A callback may itself suspend on a hooked I/O wait
                    // (e.g. `hook::read` hitting EAGAIN) and yield back here
                    // with its fiber still Ready, not Term — it stays alive
                    // through its own event registration, so drop it from
                    // this slot instead of reusing it for the next callback.
                    let f = match cb_fiber.take() {
                        Some(f) if f.state() == crate::fiber::State::Term => {
                            f.reset(cb);
                            f
                        }
                        _ => Fiber::new(cb, 0, true),
                    };
                    cb_fiber = Some(f.clone());
                    self.active_thread_count.fetch_add(1, Ordering::Relaxed);
                    f.resume();
                    self.active_thread_count.fetch_sub(1, Ordering::Relaxed);
                }
                None => {
                    if idle_fiber.state() == crate::fiber::State::Term {
                        log::debug!(target: crate::log::SYSTEM, "scheduler {} idle fiber terminated, exiting run loop", self.name);
                        break;
                    }
                    self.idle_thread_count.fetch_add(1, Ordering::Relaxed);
                    idle_fiber.resume();
                    self.idle_thread_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    #[test]
    fn runs_scheduled_closures() {
        let scheduler = Scheduler::new(2, false, "test");
        scheduler.start();

        let count = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..10 {
            let c = count.clone();
            scheduler.schedule(move || { c.fetch_add(1, Ordering::SeqCst); }, None);
        }

        std::thread::sleep(Duration::from_millis(100));
        scheduler.stop();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn runs_scheduled_fibers() {
        let scheduler = Scheduler::new(1, false, "test-fiber");
        scheduler.start();

        let ran = Arc::new(std::sync::Mutex::new(false));
        let ran2 = ran.clone();
        let fiber = Fiber::new(move || *ran2.lock().unwrap() = true, 0, true);
        scheduler.schedule(fiber, None);

        std::thread::sleep(Duration::from_millis(50));
        scheduler.stop();
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn callback_that_yields_does_not_poison_the_next_callback() {
        // Regression test: a callback that suspends (e.g. a hooked I/O call
        // hitting EAGAIN) leaves the shared callback fiber Ready, not Term.
        // The next callback task must not reuse that still-live fiber.
        let scheduler = Scheduler::new(1, false, "test-cb-yield");
        scheduler.start();

        scheduler.schedule(move || crate::fiber::Fiber::yield_now(), None);

        let count = Arc::new(StdAtomicUsize::new(0));
        let c = count.clone();
        scheduler.schedule(move || { c.fetch_add(1, Ordering::SeqCst); }, None);

        std::thread::sleep(Duration::from_millis(100));
        scheduler.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn use_caller_runs_on_calling_thread_during_stop() {
        let scheduler = Scheduler::new(1, true, "test-caller");
        scheduler.start();

        let count = Arc::new(StdAtomicUsize::new(0));
        let c = count.clone();
        scheduler.schedule(move || { c.fetch_add(1, Ordering::SeqCst); }, None);

        scheduler.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
