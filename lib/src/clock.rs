//! Monotonic clock.
//!
//! All functions are safe to call from any context (interrupt, kernel thread,
//! syscall handler). Before the platform services are wired during early boot,
//! every accessor returns `0`.

use crate::kernel_services::platform;

/// Returns the monotonic clock value in nanoseconds since boot.
#[inline]
pub fn monotonic_ns() -> u64 {
    platform::clock_monotonic_ns()
}

/// Returns system uptime in milliseconds.
#[inline]
pub fn uptime_ms() -> u64 {
    monotonic_ns() / 1_000_000
}
