#![cfg_attr(not(any(test, feature = "std-runtime")), no_std)]

pub mod clock;
pub mod kernel_services;
pub mod klog;
pub mod service_macro;
pub mod spinlock;
pub mod waitqueue;

#[cfg(any(test, feature = "std-runtime"))]
pub mod host_runtime;


#[doc(hidden)]
pub use paste;

pub use kernel_services::task_runtime::TaskHandle;
pub use klog::{KlogLevel, klog_get_level, klog_register_backend, klog_set_level};
pub use spinlock::{IrqMutex, IrqMutexGuard};
pub use waitqueue::WaitQueue;
