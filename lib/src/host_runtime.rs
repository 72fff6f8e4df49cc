//! Host-thread backend for the kernel services.
//!
//! Lets library and stack code that blocks on [`WaitQueue`](crate::WaitQueue)
//! run as an ordinary process.  Each OS thread is a task; blocking parks the
//! thread and waking unparks it.  The monotonic clock counts from the first
//! `install`.  Interrupt masking is a no-op.
//!
//! Call [`install`] once before any blocking call; repeated calls are harmless.

use std::cell::Cell;
use std::thread::{self, Thread};
use std::time::Instant;
use std::vec::Vec;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::kernel_services::platform::{self, PlatformServices};
use crate::kernel_services::task_runtime::{self, TaskHandle, TaskRuntimeServices};

static NEXT_TASK_ID: AtomicUsize = AtomicUsize::new(1);

/// Threads that have asked for a handle, indexed by handle value.
static TASKS: spin::Mutex<Vec<(TaskHandle, Thread)>> = spin::Mutex::new(Vec::new());

static EPOCH: spin::Once<Instant> = spin::Once::new();

static RNG_STATE: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

std::thread_local! {
    static CURRENT: Cell<TaskHandle> = const { Cell::new(TaskHandle::NULL) };
}

fn host_current_task() -> TaskHandle {
    CURRENT.with(|current| {
        let handle = current.get();
        if !handle.is_null() {
            return handle;
        }
        let handle = TaskHandle(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        TASKS.lock().push((handle, thread::current()));
        current.set(handle);
        handle
    })
}

fn host_block_current_task() {
    thread::park();
}

fn host_unblock_task(task: TaskHandle) -> bool {
    let thread = TASKS
        .lock()
        .iter()
        .find(|(handle, _)| *handle == task)
        .map(|(_, thread)| thread.clone());
    match thread {
        Some(thread) => {
            thread.unpark();
            true
        }
        None => false,
    }
}

fn host_clock_monotonic_ns() -> u64 {
    let epoch = EPOCH.call_once(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

fn host_irq_save() -> u64 {
    0
}

fn host_irq_restore(_flags: u64) {}

/// xorshift64*, good enough for initial sequence numbers in tests.
fn host_rng_next() -> u64 {
    let mut x = RNG_STATE.load(Ordering::Relaxed);
    loop {
        let mut next = x;
        next ^= next >> 12;
        next ^= next << 25;
        next ^= next >> 27;
        match RNG_STATE.compare_exchange_weak(x, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next.wrapping_mul(0x2545_F491_4F6C_DD1D),
            Err(seen) => x = seen,
        }
    }
}

static HOST_TASK_RUNTIME: TaskRuntimeServices = TaskRuntimeServices {
    current_task: host_current_task,
    block_current_task: host_block_current_task,
    unblock_task: host_unblock_task,
};

static HOST_PLATFORM: PlatformServices = PlatformServices {
    clock_monotonic_ns: host_clock_monotonic_ns,
    irq_save: host_irq_save,
    irq_restore: host_irq_restore,
    rng_next: host_rng_next,
};

/// Register the host task runtime and platform services.
pub fn install() {
    EPOCH.call_once(Instant::now);
    task_runtime::register_task_runtime_services(&HOST_TASK_RUNTIME);
    platform::register_platform_services(&HOST_PLATFORM);
}
