#![allow(clippy::let_and_return)]
//! A user-space cooperative task runtime for Linux-style network servers.
//!
//! This crate lets application code issue ordinary blocking-style I/O calls
//! while the runtime transparently multiplexes thousands of in-flight
//! operations onto a small pool of OS threads. It is built from three
//! tightly coupled subsystems:
//!
//! - [`fiber`]: stackful cooperative tasks with explicit resume/yield, built
//!   over a `ucontext`-based machine-context switch.
//! - [`scheduler`]: an M:N task queue binding runnable fibers (or plain
//!   closures) to worker threads, with optional participation of the caller
//!   thread.
//! - [`iomanager`] and [`timer`]: a readiness-based event loop (edge
//!   triggered `epoll`) that parks fibers on file-descriptor events or timed
//!   expirations and resumes them when ready.
//!
//! [`fdtable`] records per-fd blocking/timeout state so that [`hook`] can
//! translate `EAGAIN` into fiber suspension, and [`net`] layers a safe
//! `TcpListener`/`TcpStream` on top of that.
//!
//! This crate deliberately does not provide: a logging sink (it only emits
//! [`log`] records), a configuration registry (it only consumes the values
//! in [`config`]), or the `LD_PRELOAD`-style syscall interposition needed to
//! make unmodified blocking code transparently hooked — [`hook`] is the
//! surface such a shim would call into.
//!
//! See also:
//! - [Fibers](fiber)
//! - [Scheduler](scheduler)
//! - [I/O manager](iomanager)
//! - [Timers](timer)
//! - [FD table](fdtable)
//! - [Hooked I/O envelope](hook)
//! - [Hooked TCP/sleep surface](net)
//! - [Error handling](error)
//! - [Configuration](config)

pub mod clock;
pub mod config;
pub mod error;
pub mod fdtable;
pub mod fiber;
pub mod hook;
pub mod iomanager;
pub mod log;
pub mod net;
pub mod scheduler;
pub mod timer;

pub use error::Result;
pub type StdResult<T, E> = std::result::Result<T, E>;
