//! Wall-clock time, in milliseconds.
//!
//! Every deadline in this crate — timer expirations, fd recv/send timeouts,
//! `connect` timeouts — is expressed in milliseconds on this clock. It is
//! derived from `CLOCK_REALTIME`, so it tracks wall-clock adjustments (NTP
//! steps, `settimeofday`, DST, manual clock changes) exactly like
//! `gettimeofday` does — which is what makes a clock rollback observable at
//! all; see [`crate::timer`] for how the timer manager detects and handles
//! one.

/// Current wall-clock time in milliseconds.
///
/// Derived from `clock_gettime(CLOCK_REALTIME)`, mirroring
/// `focus::util::GetCurrentMS`'s use of `gettimeofday`.
#[inline]
pub fn current_ms() -> u64 {
    let mut ts = std::mem::MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: CLOCK_REALTIME is always supported on Linux; ts is fully
    // written by the kernel before this call returns successfully.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, ts.as_mut_ptr()) };
    assert_eq!(rc, 0, "clock_gettime(CLOCK_REALTIME) failed");
    let ts = unsafe { ts.assume_init() };
    (ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_with_wall_time() {
        let a = current_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = current_ms();
        assert!(b >= a);
        assert!(b - a < 1000, "sleeping 5ms should not report a huge jump");
    }
}
