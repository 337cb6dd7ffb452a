//! Logging conventions used throughout this crate.
//!
//! This crate does not own a log sink: it only emits records through the
//! [`log`](https://docs.rs/log/) facade, at target [`SYSTEM`], the way a
//! host application's logging configuration expects. Installing a logger
//! (`log::set_logger`, `log::set_max_level`) and routing `target: "system"`
//! records wherever the application wants them is the host's job.
//!
//! Example, from the application side:
//! ```no_run
//! use log::LevelFilter;
//!
//! env_logger::Builder::new().filter_level(LevelFilter::Debug).init();
//! ```
//!
//! Scheduler, reactor, and hook code in this crate logs fiber switches,
//! epoll registrations, and syscall retries at [`log::Level::Debug`] or
//! below, and reactor-fatal conditions at [`log::Level::Error`], all under
//! [`SYSTEM`].

/// The `log` target every record emitted by this crate is tagged with.
pub const SYSTEM: &str = "system";

#[cfg(test)]
mod tests {
    use super::SYSTEM;

    #[test]
    fn target_is_stable() {
        assert_eq!(SYSTEM, "system");
    }
}
