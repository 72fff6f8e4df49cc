//! Service tables through which the library reaches the rest of the kernel.
//!
//! The scheduler and the platform layer register their tables during boot.
//! Host builds install [`crate::host_runtime`] instead.

pub mod platform;
pub mod task_runtime;
