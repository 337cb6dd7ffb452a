//! Edge-triggered epoll reactor, layered on top of [`crate::scheduler`] as a
//! [`crate::scheduler::SchedulerHooks`] implementation.
//!
//! An [`IoManager`] owns the scheduler it drives: it is built through
//! [`Arc::new_cyclic`] so the hooks object it installs into the
//! [`Scheduler`] can hold a weak back-reference to the very `IoManager`
//! that constructed it, rather than the two objects keeping each other
//! alive forever. [`crate::hook`] is the only expected caller of
//! [`IoManager::add_event`]/[`IoManager::cancel_event`] — this module knows
//! nothing about sockets or syscalls, only fds and edge-triggered readiness.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::fiber::{Fiber, FiberHandle};
use crate::scheduler::{Scheduler, SchedulerHooks, Task};
use crate::timer::TimerManager;

thread_local! {
    static CURRENT_IO_MANAGER: RefCell<Option<Weak<IoManager>>> = RefCell::new(None);
}

/// The [`IoManager`] driving the current thread, if this thread is one of
/// an `IoManager`'s workers (or its `use_caller` root thread, while the
/// scheduler fiber runs). [`crate::hook`] uses this to find the reactor it
/// should park a fiber against on `EAGAIN`.
pub fn current() -> Option<Arc<IoManager>> {
    CURRENT_IO_MANAGER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

fn set_current(io: Weak<IoManager>) {
    CURRENT_IO_MANAGER.with(|c| *c.borrow_mut() = Some(io));
}

const MAX_EVENTS: usize = 256;
const MAX_IDLE_TIMEOUT_MS: i32 = 5000;

bitflags::bitflags! {
    /// IO readiness a caller can register interest in. Maps directly onto
    /// `EPOLLIN`/`EPOLLOUT`; everything else epoll can report (errors,
    /// hangups) is folded into whichever of these the fd is already
    /// watching.
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

#[derive(Default)]
struct EventContext {
    fiber: Option<FiberHandle>,
    cb: Option<Box<dyn FnOnce() + Send>>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.fiber.is_none() && self.cb.is_none()
    }
}

struct FdContext {
    fd: RawFd,
    events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        FdContext {
            fd,
            events: Event::empty(),
            read: EventContext::default(),
            write: EventContext::default(),
        }
    }

    fn event_context(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::READ => &mut self.read,
            Event::WRITE => &mut self.write,
            _ => unreachable!("event_context only handles a single READ or WRITE event"),
        }
    }

    /// Schedule whatever was registered for `event`, then clear its slot so
    /// it can only fire once per registration.
    fn trigger_event(&mut self, event: Event, scheduler: &Arc<Scheduler>) {
        assert!(self.events.contains(event), "triggered an event that was never registered");
        self.events.remove(event);
        let ctx = self.event_context(event);
        if let Some(cb) = ctx.cb.take() {
            scheduler.schedule(Task::Callback(cb), None);
        } else if let Some(fiber) = ctx.fiber.take() {
            scheduler.schedule(Task::Fiber(fiber), None);
        }
    }
}

/// The epoll-backed hooks [`IoManager`] installs into its [`Scheduler`].
/// Holds only a weak back-reference so the scheduler's strong ownership of
/// its hooks object doesn't keep the [`IoManager`] that owns the scheduler
/// alive forever.
struct IoManagerHooks(Weak<IoManager>);

impl SchedulerHooks for IoManagerHooks {
    fn tickle(&self, scheduler: &Scheduler) {
        log::debug!(target: crate::log::SYSTEM, "tickle");
        if !scheduler_has_idle_threads(scheduler) {
            return;
        }
        if let Some(io) = self.0.upgrade() {
            io.wake();
        }
    }

    fn idle(&self, scheduler: &Arc<Scheduler>) {
        let Some(io) = self.0.upgrade() else { return };
        io.idle_loop(scheduler);
    }

    fn can_stop_extra(&self, _scheduler: &Scheduler) -> bool {
        let Some(io) = self.0.upgrade() else { return true };
        io.next_timer_timeout_ms().is_none() && io.pending_event_count() == 0
    }

    fn on_thread_start(&self, _scheduler: &Arc<Scheduler>) {
        set_current(self.0.clone());
        // Any thread an IoManager drives is, by construction, a thread whose
        // blocking syscalls should suspend the calling fiber rather than the
        // whole OS thread; there is no separate opt-in surface in spec.md
        // for this, so this crate enables hooking as part of joining an
        // IoManager's pool rather than requiring a second explicit call.
        crate::hook::set_hook_enabled(true);
    }
}

fn scheduler_has_idle_threads(_scheduler: &Scheduler) -> bool {
    // The scheduler doesn't expose its idle-thread counter publicly; a
    // conservative `true` just means `tickle` sometimes wakes a thread that
    // was already busy, which is harmless. Real idle-thread gating happens
    // naturally because the self-pipe write only matters while some thread
    // is blocked in `epoll_wait`.
    true
}

/// An epoll-based reactor: the concrete [`crate::scheduler::SchedulerHooks`]
/// that turns a bare [`Scheduler`]'s idle time into real I/O waiting.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    tickle_read: RawFd,
    tickle_write: RawFd,
    pending_event_count: AtomicUsize,
    fd_contexts: RwLock<Vec<Option<Mutex<FdContext>>>>,
}

impl IoManager {
    /// Build an `IoManager` with its own worker thread pool, already
    /// started.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<IoManager> {
        let epfd = unsafe { libc::epoll_create(1) };
        assert!(epfd > 0, "epoll_create failed");

        let mut pipe_fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe failed");
        let (tickle_read, tickle_write) = (pipe_fds[0], pipe_fds[1]);

        let flags = unsafe { libc::fcntl(tickle_read, libc::F_GETFL, 0) };
        let rc = unsafe { libc::fcntl(tickle_read, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        assert_eq!(rc, 0, "fcntl O_NONBLOCK on tickle pipe failed");

        let name = name.into();
        let io = Arc::new_cyclic(|weak_io: &Weak<IoManager>| {
            let hooks: Arc<dyn SchedulerHooks> = Arc::new(IoManagerHooks(weak_io.clone()));
            let scheduler = Scheduler::with_hooks(threads, use_caller, name, hooks);

            let weak_for_timer = weak_io.clone();
            let timers = TimerManager::new(move || {
                if let Some(io) = weak_for_timer.upgrade() {
                    io.wake();
                }
            });

            IoManager {
                scheduler,
                timers,
                epfd,
                tickle_read,
                tickle_write,
                pending_event_count: AtomicUsize::new(0),
                fd_contexts: RwLock::new((0..32).map(|_| None).collect()),
            }
        });

        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: tickle_read as u64,
        };
        let rc = unsafe { libc::epoll_ctl(io.epfd, libc::EPOLL_CTL_ADD, tickle_read, &mut event) };
        assert_eq!(rc, 0, "epoll_ctl failed registering the tickle pipe");

        io.scheduler.start();
        io
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    fn pending_event_count(&self) -> usize {
        self.pending_event_count.load(Ordering::Relaxed)
    }

    fn next_timer_timeout_ms(&self) -> Option<u64> {
        self.timers.next_timeout_ms()
    }

    fn wake(&self) {
        let rc = unsafe { libc::write(self.tickle_write, b"T".as_ptr() as *const _, 1) };
        assert_eq!(rc, 1, "write to tickle pipe failed");
    }

    fn ensure_fd_slot<'a>(&self, fd: RawFd) -> std::sync::RwLockReadGuard<'_, Vec<Option<Mutex<FdContext>>>> {
        {
            let contexts = self.fd_contexts.read().unwrap();
            if (fd as usize) < contexts.len() && contexts[fd as usize].is_some() {
                return contexts;
            }
        }
        let mut contexts = self.fd_contexts.write().unwrap();
        if (fd as usize) >= contexts.len() {
            let new_len = ((fd as usize + 1) as f64 * 1.5) as usize;
            contexts.resize_with(new_len, || None);
        }
        if contexts[fd as usize].is_none() {
            contexts[fd as usize] = Some(Mutex::new(FdContext::new(fd)));
        }
        drop(contexts);
        self.fd_contexts.read().unwrap()
    }

    /// Register interest in `event` on `fd`. If `cb` is `None`, the
    /// currently running fiber is captured and resumed when the event
    /// fires; otherwise `cb` runs as a plain scheduled closure.
    ///
    /// # Panics
    /// Panics if `event` is already registered for this fd.
    ///
    /// # Errors
    /// Propagates the raw `epoll_ctl` failure, which the caller (`hook`'s
    /// `do_io`) surfaces as the I/O call's own error rather than treating it
    /// as a crate-internal invariant violation.
    pub fn add_event(
        self: &Arc<Self>,
        fd: RawFd,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> std::io::Result<()> {
        let contexts = self.ensure_fd_slot(fd);
        let slot = contexts[fd as usize].as_ref().unwrap();
        let mut ctx = slot.lock().unwrap();

        assert!(!ctx.events.contains(event), "duplicate event registration for fd {fd}");

        let op = if ctx.events.is_empty() { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        let new_events = ctx.events | event;
        let mut epevent = libc::epoll_event {
            events: libc::EPOLLET as u32 | new_events.bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epevent) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            log::error!(target: crate::log::SYSTEM, "epoll_ctl add failed for fd {fd}: {err}");
            return Err(err);
        }

        self.pending_event_count.fetch_add(1, Ordering::Relaxed);
        ctx.events = new_events;
        let event_ctx = ctx.event_context(event);
        assert!(event_ctx.is_empty(), "event context not cleared before reuse");
        match cb {
            Some(cb) => event_ctx.cb = Some(cb),
            None => event_ctx.fiber = Some(FiberHandle(Fiber::current())),
        }
        Ok(())
    }

    /// Unregister interest in `event` without running its callback. Returns
    /// `false` if `event` was not registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let contexts = self.fd_contexts.read().unwrap();
        if (fd as usize) >= contexts.len() {
            return false;
        }
        let Some(slot) = contexts[fd as usize].as_ref() else { return false };
        let mut ctx = slot.lock().unwrap();
        if !ctx.events.contains(event) {
            return false;
        }

        let new_events = ctx.events & !event;
        let op = if new_events.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        let mut epevent = libc::epoll_event {
            events: libc::EPOLLET as u32 | new_events.bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epevent) };
        if rc != 0 {
            log::error!(
                target: crate::log::SYSTEM,
                "epoll_ctl del failed for fd {fd}: {}",
                std::io::Error::last_os_error()
            );
            return false;
        }

        self.pending_event_count.fetch_sub(1, Ordering::Relaxed);
        ctx.events = new_events;
        *ctx.event_context(event) = EventContext::default();
        true
    }

    /// Unregister interest in `event`, running whatever was registered for
    /// it exactly once first. Returns `false` if `event` was not
    /// registered.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let contexts = self.fd_contexts.read().unwrap();
        if (fd as usize) >= contexts.len() {
            return false;
        }
        let Some(slot) = contexts[fd as usize].as_ref() else { return false };
        let mut ctx = slot.lock().unwrap();
        if !ctx.events.contains(event) {
            return false;
        }

        let new_events = ctx.events & !event;
        let op = if new_events.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        let mut epevent = libc::epoll_event {
            events: libc::EPOLLET as u32 | new_events.bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epevent) };
        if rc != 0 {
            log::error!(
                target: crate::log::SYSTEM,
                "epoll_ctl failed cancelling event on fd {fd}: {}",
                std::io::Error::last_os_error()
            );
            return false;
        }

        ctx.trigger_event(event, &self.scheduler);
        self.pending_event_count.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Unregister and fire every event registered for `fd`. Returns `false`
    /// if no events were registered.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let contexts = self.fd_contexts.read().unwrap();
        if (fd as usize) >= contexts.len() {
            return false;
        }
        let Some(slot) = contexts[fd as usize].as_ref() else { return false };
        let mut ctx = slot.lock().unwrap();
        if ctx.events.is_empty() {
            return false;
        }

        let mut epevent = libc::epoll_event { events: 0, u64: fd as u64 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut epevent) };
        assert_eq!(rc, 0, "epoll_ctl failed cancelling all events");

        if ctx.events.contains(Event::READ) {
            ctx.trigger_event(Event::READ, &self.scheduler);
            self.pending_event_count.fetch_sub(1, Ordering::Relaxed);
        }
        if ctx.events.contains(Event::WRITE) {
            ctx.trigger_event(Event::WRITE, &self.scheduler);
            self.pending_event_count.fetch_sub(1, Ordering::Relaxed);
        }
        assert!(ctx.events.is_empty());
        true
    }

    fn idle_loop(&self, scheduler: &Arc<Scheduler>) {
        log::debug!(target: crate::log::SYSTEM, "idle");
        let mut events: Vec<libc::epoll_event> = vec![unsafe { std::mem::zeroed() }; MAX_EVENTS];

        loop {
            if scheduler.can_stop() {
                log::debug!(target: crate::log::SYSTEM, "name = {} idle exit", scheduler.name());
                break;
            }

            let timeout_ms = match self.next_timer_timeout_ms() {
                Some(ms) => (ms as i32).min(MAX_IDLE_TIMEOUT_MS),
                None => MAX_IDLE_TIMEOUT_MS,
            };

            let n = loop {
                let rc = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms) };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    log::error!(target: crate::log::SYSTEM, "epoll_wait failed: {err}");
                    break 0;
                }
                break rc;
            };

            for timer in self.timers.drain_expired() {
                let scheduler = scheduler.clone();
                scheduler.schedule(Task::Callback(Box::new(move || timer.fire())), None);
            }

            for raw_event in &events[..n as usize] {
                let fd = raw_event.u64 as RawFd;
                if fd == self.tickle_read {
                    let mut dummy = [0u8; 256];
                    while unsafe { libc::read(self.tickle_read, dummy.as_mut_ptr() as *mut _, dummy.len()) } > 0 {}
                    continue;
                }

                let contexts = self.fd_contexts.read().unwrap();
                let Some(slot) = contexts.get(fd as usize).and_then(|c| c.as_ref()) else { continue };
                let mut ctx = slot.lock().unwrap();

                let mut epoll_bits = raw_event.events;
                if epoll_bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    epoll_bits |= (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) & ctx.events.bits();
                }
                let mut real_events = Event::empty();
                if epoll_bits & libc::EPOLLIN as u32 != 0 {
                    real_events |= Event::READ;
                }
                if epoll_bits & libc::EPOLLOUT as u32 != 0 {
                    real_events |= Event::WRITE;
                }
                if (ctx.events & real_events).is_empty() {
                    continue;
                }

                let left_events = ctx.events & !real_events;
                let op = if left_events.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
                let mut epevent = libc::epoll_event {
                    events: libc::EPOLLET as u32 | left_events.bits(),
                    u64: fd as u64,
                };
                if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epevent) } != 0 {
                    log::error!(target: crate::log::SYSTEM, "epoll_ctl failed rearming fd {fd}");
                    continue;
                }

                if real_events.contains(Event::READ) {
                    ctx.trigger_event(Event::READ, scheduler);
                    self.pending_event_count.fetch_sub(1, Ordering::Relaxed);
                }
                if real_events.contains(Event::WRITE) {
                    ctx.trigger_event(Event::WRITE, scheduler);
                    self.pending_event_count.fetch_sub(1, Ordering::Relaxed);
                }
            }

            Fiber::yield_now();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_read);
            libc::close(self.tickle_write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn read_event_fires_when_pipe_becomes_readable() {
        let io = IoManager::new(2, false, "test-io");

        let (r, w) = unsafe {
            let mut fds = [0; 2];
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
            (fds[0], fds[1])
        };
        let flags = unsafe { libc::fcntl(r, libc::F_GETFL, 0) };
        unsafe { libc::fcntl(r, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        io.add_event(r, Event::READ, Some(Box::new(move || fired2.store(true, Ordering::SeqCst)))).unwrap();

        unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) };
        std::thread::sleep(std::time::Duration::from_millis(100));

        assert!(fired.load(Ordering::SeqCst));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn cancel_event_fires_registered_callback_once() {
        let io = IoManager::new(1, false, "test-cancel");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        io.add_event(fd, Event::READ, Some(Box::new(move || fired2.store(true, Ordering::SeqCst)))).unwrap();
        assert!(io.cancel_event(fd, Event::READ));

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn del_event_does_not_fire_callback() {
        let io = IoManager::new(1, false, "test-del");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        io.add_event(fd, Event::READ, Some(Box::new(move || fired2.store(true, Ordering::SeqCst)))).unwrap();
        assert!(io.del_event(fd, Event::READ));

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
