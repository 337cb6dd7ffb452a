//! Process-wide configuration knobs this crate consumes.
//!
//! This crate owns no configuration registry: it holds a small set of
//! atomics with documented defaults, and exposes a setter for each so that
//! a host application's own config layer (a YAML-backed registry, an env
//! parser, whatever it uses) can drive them, the way `focus::Config`'s
//! `ConfigVar<T>` drives `focus::hook`'s timeout through `addCallBack`.
//! Nothing in this crate re-reads a config file; values only change when a
//! caller calls a setter here.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Default stack size for a new fiber, in bytes (128 KiB), matching
/// `focus`'s `MallocStackAllocator` default.
pub const DEFAULT_FIBER_STACK_SIZE: u32 = 128 * 1024;

/// Default TCP connect timeout, in milliseconds.
pub const DEFAULT_TCP_CONNECT_TIMEOUT_MS: i32 = 5000;

static FIBER_STACK_SIZE: AtomicU32 = AtomicU32::new(DEFAULT_FIBER_STACK_SIZE);
static TCP_CONNECT_TIMEOUT_MS: AtomicI32 = AtomicI32::new(DEFAULT_TCP_CONNECT_TIMEOUT_MS);

/// Stack size, in bytes, used for fibers created after this call returns.
/// Does not affect fibers that already exist.
#[inline]
pub fn fiber_stack_size() -> u32 {
    FIBER_STACK_SIZE.load(Ordering::Relaxed)
}

/// Set the stack size used for newly created fibers.
///
/// # Panics
/// Panics if `size` is smaller than `libc::SIGSTKSZ` worth of headroom a
/// fiber needs to make any progress at all (below 16 KiB).
pub fn set_fiber_stack_size(size: u32) {
    assert!(size >= 16 * 1024, "fiber stack size too small: {size}");
    FIBER_STACK_SIZE.store(size, Ordering::Relaxed);
}

/// Timeout, in milliseconds, applied by [`crate::hook::connect`]/
/// [`crate::net::TcpStream::connect`] when the caller does not supply one
/// explicitly.
#[inline]
pub fn tcp_connect_timeout_ms() -> i32 {
    TCP_CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

/// Set the default TCP connect timeout. A negative value disables the
/// timeout (connect blocks the fiber until the kernel itself gives up).
pub fn set_tcp_connect_timeout_ms(timeout_ms: i32) {
    TCP_CONNECT_TIMEOUT_MS.store(timeout_ms, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both tests below mutate process-wide statics, so they share a single
    // test function instead of running as independent #[test]s that `cargo
    // test`'s default thread-per-test runner could interleave.
    #[test]
    fn setters_round_trip() {
        let orig_stack = fiber_stack_size();
        let orig_timeout = tcp_connect_timeout_ms();

        set_fiber_stack_size(256 * 1024);
        assert_eq!(fiber_stack_size(), 256 * 1024);

        set_tcp_connect_timeout_ms(1000);
        assert_eq!(tcp_connect_timeout_ms(), 1000);

        set_fiber_stack_size(orig_stack);
        set_tcp_connect_timeout_ms(orig_timeout);
    }

    #[test]
    #[should_panic(expected = "too small")]
    fn rejects_tiny_stack() {
        set_fiber_stack_size(1024);
    }
}
