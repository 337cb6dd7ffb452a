//! Raw machine-context switch, built directly on POSIX `ucontext.h`.
//!
//! This is the only `unsafe` boundary [`crate::fiber`] needs: everything
//! above this module operates on [`crate::fiber::Fiber`] handles and never
//! touches a [`Context`] directly.

use std::mem::MaybeUninit;

/// A saved CPU register file plus stack pointer, as produced by
/// `getcontext`/`makecontext` and consumed by `swapcontext`.
#[repr(transparent)]
pub struct Context(libc::ucontext_t);

impl Context {
    /// An empty context, as `getcontext` leaves it. Used for the two kinds
    /// of fiber that never run a trampoline: the thread-root fiber (which
    /// represents the OS thread itself) and the target of the very first
    /// `swapcontext` call, which only needs somewhere to save *into*.
    pub fn empty() -> Self {
        let mut ctx = MaybeUninit::<libc::ucontext_t>::zeroed();
        // SAFETY: ctx is large enough and getcontext only writes to it.
        let rc = unsafe { libc::getcontext(ctx.as_mut_ptr()) };
        assert_eq!(rc, 0, "getcontext failed");
        Context(unsafe { ctx.assume_init() })
    }

    /// A context that, when switched to, begins executing `entry` on top of
    /// `stack`. `entry` must not return in the normal sense — the fiber
    /// trampoline it points to yields back to its caller instead.
    pub fn new(stack: &mut [u8], entry: extern "C" fn()) -> Self {
        let mut ctx = Self::empty();
        ctx.0.uc_link = std::ptr::null_mut();
        ctx.0.uc_stack.ss_sp = stack.as_mut_ptr() as *mut libc::c_void;
        ctx.0.uc_stack.ss_size = stack.len();
        // SAFETY: uc_stack was just set to a valid, live allocation owned by
        // the caller for at least as long as this context is in use.
        unsafe { libc::makecontext(&mut ctx.0, entry, 0) };
        ctx
    }

    /// Save the currently running machine context into `from`, then resume
    /// the machine context previously saved in `to`. Does not return until
    /// some later `swap` switches back into `from`.
    ///
    /// # Safety
    /// Both pointers must refer to live, properly initialized contexts, and
    /// `to` must have been produced by `Context::empty`/`Context::new` and
    /// not concurrently accessed from another thread.
    pub unsafe fn swap(from: *mut Context, to: *mut Context) {
        let rc = libc::swapcontext(from as *mut libc::ucontext_t, to as *mut libc::ucontext_t);
        assert_eq!(rc, 0, "swapcontext failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static VISITED: Cell<bool> = Cell::new(false);
    }

    extern "C" fn mark_visited() {
        VISITED.with(|v| v.set(true));
        // Swap back into whatever context we were launched from. Tests
        // drive this through a second `Context::empty()` used purely as
        // the "caller" context to save into.
        CALLER.with(|caller| {
            let caller_ptr = caller.get();
            SELF_CTX.with(|self_ctx| {
                let self_ptr = self_ctx.get();
                unsafe { Context::swap(self_ptr, caller_ptr) }
            });
        });
    }

    thread_local! {
        static CALLER: Cell<*mut Context> = Cell::new(std::ptr::null_mut());
        static SELF_CTX: Cell<*mut Context> = Cell::new(std::ptr::null_mut());
    }

    #[test]
    fn switches_into_entry_and_back() {
        let mut stack = vec![0u8; 256 * 1024];
        let mut target = Context::new(&mut stack, mark_visited);
        let mut caller = Context::empty();

        CALLER.with(|c| c.set(&mut caller as *mut Context));
        SELF_CTX.with(|c| c.set(&mut target as *mut Context));

        unsafe { Context::swap(&mut caller, &mut target) };

        assert!(VISITED.with(|v| v.get()));
    }
}
