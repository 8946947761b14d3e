//! Monotonic Time Source
//!
//! All timestamps in the delay pipeline come from this module. The clock is
//! `std::time::Instant`: monotonic (non-decreasing), infallible to read, and
//! its time points support addition with a `Duration` and comparison, which
//! is the only arithmetic the pipeline needs.

use std::thread;
use std::time::Instant;

/// Reads the clock. Never fails.
#[inline]
pub(crate) fn now() -> Instant {
    Instant::now()
}

/// Blocks the calling thread until at least `deadline`.
///
/// Returns immediately if the deadline has already passed. Stable Rust has no
/// `thread::sleep_until`, so this is expressed as a relative sleep; the OS
/// guarantees the sleep lasts at least the requested duration.
pub(crate) fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        thread::sleep(deadline - now);
    }
}
