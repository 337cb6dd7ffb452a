//! Stackful cooperative tasks.
//!
//! A [`Fiber`] is a unit of cooperative execution with its own stack: it
//! runs until it explicitly calls [`Fiber::yield_now`] (or its entry
//! closure returns), rather than being preempted. [`Fiber::resume`] and
//! [`Fiber::yield_now`] are the only two ways control ever moves between a
//! fiber and whatever resumed it — there is no timer-driven preemption
//! anywhere in this crate.
//!
//! Every OS thread that ever calls [`Fiber::current`] implicitly gets a
//! *thread-root fiber* representing the thread itself; resuming a fiber
//! created with `run_in_scheduler: false` switches against that
//! thread-root fiber, while a scheduler-owned fiber switches against
//! whatever fiber [`crate::scheduler`] registered as this thread's
//! scheduling fiber (see [`set_scheduler_fiber`]).
//!
//! A [`Fiber`] created with [`Fiber::new`] may be resumed by one thread,
//! yield, and later be resumed by a *different* thread — [`crate::scheduler`]
//! relies on this to let any worker thread pick up any runnable task. The
//! type is therefore wrapped for cross-thread handoff as [`FiberHandle`]
//! rather than being `Send`/`Sync` itself: nothing about a fiber's
//! internals is safe to touch from two threads at once, but the scheduler
//! guarantees only one thread ever holds the handle at a time.

pub mod context;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use context::Context;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Freshly created, or yielded — ready to be resumed.
    Ready,
    /// Currently executing (is the one fiber running on this thread).
    Running,
    /// The entry closure has returned; the fiber can only be dropped or
    /// [`Fiber::reset`], never resumed again.
    Term,
}

type Entry = Box<dyn FnOnce() + Send>;

/// A stackful, cooperatively scheduled task.
pub struct Fiber {
    id: u64,
    // `None` for the implicit thread-root fiber, which borrows the thread's
    // own stack and never runs a trampoline.
    stack: Option<RefCell<Vec<u8>>>,
    state: Cell<State>,
    context: UnsafeCell<Context>,
    entry: RefCell<Option<Entry>>,
    run_in_scheduler: bool,
}

impl Fiber {
    fn next_id() -> u64 {
        NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a new fiber with its own stack, ready to run `entry`.
    ///
    /// `stack_size` of `0` uses [`crate::config::fiber_stack_size`].
    /// `run_in_scheduler` controls which fiber [`Fiber::resume`] and
    /// [`Fiber::yield_now`] switch against: `true` switches against this
    /// thread's scheduler fiber (see [`set_scheduler_fiber`]), `false`
    /// against the thread-root fiber.
    pub fn new(entry: impl FnOnce() + Send + 'static, stack_size: u32, run_in_scheduler: bool) -> Arc<Fiber> {
        let stack_size = if stack_size == 0 {
            crate::config::fiber_stack_size()
        } else {
            stack_size
        } as usize;
        let mut stack = vec![0u8; stack_size];
        let context = Context::new(&mut stack, trampoline);
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        Arc::new(Fiber {
            id: Self::next_id(),
            stack: Some(RefCell::new(stack)),
            state: Cell::new(State::Ready),
            context: UnsafeCell::new(context),
            entry: RefCell::new(Some(Box::new(entry))),
            run_in_scheduler,
        })
    }

    fn new_thread_root() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: Self::next_id(),
            stack: None,
            state: Cell::new(State::Running),
            context: UnsafeCell::new(Context::empty()),
            entry: RefCell::new(None),
            run_in_scheduler: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Total number of fibers currently alive in the process (including
    /// each thread's implicit root fiber).
    pub fn total_fibers() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    /// Reuse a terminated fiber's stack for a new entry closure.
    ///
    /// # Panics
    /// Panics if this fiber has no stack of its own (the thread-root fiber)
    /// or is not in [`State::Term`].
    pub fn reset(&self, entry: impl FnOnce() + Send + 'static) {
        assert!(self.stack.is_some(), "cannot reset the thread-root fiber");
        assert_eq!(self.state.get(), State::Term, "cannot reset a live fiber");

        let mut stack = self.stack.as_ref().unwrap().borrow_mut();
        let new_context = Context::new(&mut stack, trampoline);
        // SAFETY: this fiber is not currently running (state == Term), so
        // nothing else holds a live reference into its context right now.
        unsafe { *self.context.get() = new_context };
        *self.entry.borrow_mut() = Some(Box::new(entry));
        self.state.set(State::Ready);
    }

    /// Switch from the calling context into this fiber, running it until
    /// its next [`Fiber::yield_now`] or until its entry closure returns.
    ///
    /// # Panics
    /// Panics if the fiber is already [`State::Running`] or [`State::Term`].
    pub fn resume(self: &Arc<Self>) {
        assert!(
            !matches!(self.state.get(), State::Running | State::Term),
            "cannot resume a fiber in state {:?}",
            self.state.get()
        );

        let main = if self.run_in_scheduler {
            scheduler_fiber().expect("fiber runs in scheduler but no scheduler fiber is set")
        } else {
            thread_root_fiber()
        };

        set_current(self.clone());
        self.state.set(State::Running);

        // SAFETY: `main` and `self` are distinct fibers; this thread is the
        // only one touching either context right now, and `main`'s context
        // is resumed later by the matching `yield_now`.
        unsafe { Context::swap(main.context.get(), self.context.get()) };
    }

    /// Suspend the currently running fiber, returning control to whatever
    /// called [`Fiber::resume`] on it.
    ///
    /// # Panics
    /// Panics if called while no fiber (besides the implicit thread-root
    /// fiber) is running on this thread.
    pub fn yield_now() {
        let cur = current();
        assert!(
            matches!(cur.state.get(), State::Running | State::Term),
            "yield_now called outside a running fiber"
        );

        let main = if cur.run_in_scheduler {
            scheduler_fiber().expect("fiber runs in scheduler but no scheduler fiber is set")
        } else {
            thread_root_fiber()
        };

        set_current(thread_root_fiber());
        if cur.state.get() != State::Term {
            cur.state.set(State::Ready);
        }

        // SAFETY: see `resume`; roles are reversed.
        unsafe { Context::swap(cur.context.get(), main.context.get()) };
    }

    /// The fiber currently running on this thread, creating this thread's
    /// implicit root fiber on first use.
    pub fn current() -> Arc<Fiber> {
        current()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("run_in_scheduler", &self.run_in_scheduler)
            .finish()
    }
}

/// A fiber, packaged for handoff to whichever worker thread picks it up
/// next out of [`crate::scheduler`]'s task queue.
///
/// `Fiber` itself holds only thread-confined primitives (`Cell`, `RefCell`,
/// a raw machine context); nothing in this crate ever dereferences a
/// [`Fiber`] from two threads at the same instant, so wrapping the handle
/// this way and asserting `Send` is sound, but it is the one place in the
/// crate this invariant is load-bearing rather than enforced by the type
/// system itself.
pub struct FiberHandle(pub Arc<Fiber>);

// SAFETY: see the `FiberHandle` doc comment; the scheduler never exposes a
// fiber to concurrent access from two threads.
unsafe impl Send for FiberHandle {}

impl std::ops::Deref for FiberHandle {
    type Target = Arc<Fiber>;
    fn deref(&self) -> &Arc<Fiber> {
        &self.0
    }
}

impl Clone for FiberHandle {
    fn clone(&self) -> Self {
        FiberHandle(self.0.clone())
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static SCHEDULER_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

fn current() -> Arc<Fiber> {
    if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
        return f;
    }
    let root = thread_root_fiber();
    set_current(root.clone());
    root
}

fn thread_root_fiber() -> Arc<Fiber> {
    if let Some(f) = THREAD_ROOT.with(|c| c.borrow().clone()) {
        return f;
    }
    let root = Fiber::new_thread_root();
    THREAD_ROOT.with(|c| *c.borrow_mut() = Some(root.clone()));
    root
}

fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber));
}

/// Register `fiber` as this thread's scheduler fiber — the context that
/// [`Fiber::resume`]/[`Fiber::yield_now`] switch against for any fiber
/// created with `run_in_scheduler: true`. Called by [`crate::scheduler`]
/// once per worker thread before it starts running tasks.
pub fn set_scheduler_fiber(fiber: Arc<Fiber>) {
    SCHEDULER_FIBER.with(|c| *c.borrow_mut() = Some(fiber));
}

/// This thread's scheduler fiber, if [`set_scheduler_fiber`] has been called.
pub fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHEDULER_FIBER.with(|c| c.borrow().clone())
}

/// The id of the fiber currently running on this thread, or `0` if none
/// has been created yet (mirroring the original's `GetFiberId`).
pub fn current_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map_or(0, |f| f.id))
}

extern "C" fn trampoline() {
    let cur = current();
    let entry = cur
        .entry
        .borrow_mut()
        .take()
        .expect("fiber trampoline entered with no entry closure");

    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)) {
        log::error!(target: crate::log::SYSTEM, "fiber {} panicked: {:?}", cur.id, payload);
    }

    cur.state.set(State::Term);
    Fiber::yield_now();
    unreachable!("a terminated fiber must never be resumed again");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn fiber_runs_and_terminates() {
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        let f = Fiber::new(move || *ran2.lock().unwrap() = true, 0, false);
        assert_eq!(f.state(), State::Ready);
        f.resume();
        assert!(*ran.lock().unwrap());
        assert_eq!(f.state(), State::Term);
    }

    #[test]
    fn fiber_can_yield_and_be_resumed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let f = Fiber::new(
            move || {
                log2.lock().unwrap().push(1);
                Fiber::yield_now();
                log2.lock().unwrap().push(2);
            },
            0,
            false,
        );
        f.resume();
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert_eq!(f.state(), State::Ready);
        f.resume();
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(f.state(), State::Term);
    }

    #[test]
    fn reset_reuses_terminated_fiber() {
        let f = Fiber::new(|| {}, 0, false);
        f.resume();
        assert_eq!(f.state(), State::Term);

        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        f.reset(move || *ran2.lock().unwrap() = true);
        assert_eq!(f.state(), State::Ready);
        f.resume();
        assert!(*ran.lock().unwrap());
    }

    #[test]
    #[should_panic(expected = "cannot resume")]
    fn resuming_a_running_fiber_panics() {
        let f = Fiber::new(|| {}, 0, false);
        f.state.set(State::Running);
        f.resume();
    }

    #[test]
    fn panicking_entry_terminates_fiber_without_unwinding_caller() {
        let f = Fiber::new(|| panic!("boom"), 0, false);
        f.resume();
        assert_eq!(f.state(), State::Term);
    }

    #[test]
    fn fiber_can_be_resumed_from_a_different_thread() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let f = Fiber::new(
            move || {
                log2.lock().unwrap().push("first");
                Fiber::yield_now();
                log2.lock().unwrap().push("second");
            },
            0,
            false,
        );
        f.resume();

        let handle = FiberHandle(f);
        let handle = std::thread::spawn(move || {
            handle.resume();
            handle
        })
        .join()
        .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(handle.state(), State::Term);
    }
}
