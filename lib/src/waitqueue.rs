//! Wait queue primitive for blocking/waking kernel tasks.
//!
//! Provides a fixed-capacity queue of blocked tasks that can be woken
//! individually (`wake_one`) or all at once (`wake_all`).  Integrates with
//! the scheduler through the `task_runtime` kernel service, with no direct
//! dependency on the scheduler crate.
//!
//! # Design
//!
//! - Fixed-capacity array of opaque [`TaskHandle`]s
//! - Protected by `IrqMutex` for interrupt-safe access
//! - Uses `block_current_task()` / `unblock_task()` from the task runtime
//! - The runtime remembers a wakeup that lands before the block, so the window
//!   between enqueue and block cannot lose it
//!
//! # Condition-variable use
//!
//! Every `wake_all` advances [`WaitQueue::generation`].  A caller that owns
//! some other lock can read the generation while holding it, drop the lock and
//! then wait for the generation to move: any broadcast issued after the read
//! ends the wait, which is exactly `pthread_cond_wait` semantics.
//!
//! ```rust,ignore
//! let seen = {
//!     let state = STATE.lock();
//!     if state.ready { return; }
//!     WQ.generation()
//! };
//! WQ.wait_generation(seen);
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use crate::IrqMutex;
use crate::kernel_services::task_runtime::{
    self, TaskHandle, block_current_task, current_task, unblock_task,
};

/// Maximum number of tasks that can wait on a single `WaitQueue`.
const WAITQUEUE_CAPACITY: usize = 32;

/// Inner state of a wait queue, protected by `IrqMutex`.
struct WaitQueueInner {
    /// Waiting task handles.  Null entries are empty slots.
    waiters: [TaskHandle; WAITQUEUE_CAPACITY],
    /// Number of active waiters.
    count: usize,
}

impl WaitQueueInner {
    const fn new() -> Self {
        Self {
            waiters: [TaskHandle::NULL; WAITQUEUE_CAPACITY],
            count: 0,
        }
    }

    /// Add `task` to the queue.  A task already queued stays queued once.
    /// Returns `false` if the queue is full.
    fn enqueue(&mut self, task: TaskHandle) -> bool {
        if task.is_null() {
            return false;
        }
        if self.waiters.contains(&task) {
            return true;
        }
        for slot in self.waiters.iter_mut() {
            if slot.is_null() {
                *slot = task;
                self.count += 1;
                return true;
            }
        }
        false
    }

    /// Remove and return the first waiting task, or `None`.
    fn dequeue_one(&mut self) -> Option<TaskHandle> {
        for slot in self.waiters.iter_mut() {
            if !slot.is_null() {
                let task = *slot;
                *slot = TaskHandle::NULL;
                self.count = self.count.saturating_sub(1);
                return Some(task);
            }
        }
        None
    }

    /// Remove all waiting tasks, calling `f` for each.  Returns the count.
    fn dequeue_all(&mut self, mut f: impl FnMut(TaskHandle)) -> usize {
        let mut woken = 0;
        for slot in self.waiters.iter_mut() {
            if !slot.is_null() {
                f(*slot);
                *slot = TaskHandle::NULL;
                woken += 1;
            }
        }
        self.count = 0;
        woken
    }

    fn remove_task(&mut self, task: TaskHandle) -> bool {
        for slot in self.waiters.iter_mut() {
            if *slot == task {
                *slot = TaskHandle::NULL;
                self.count = self.count.saturating_sub(1);
                return true;
            }
        }
        false
    }
}

/// A wait queue for blocking and waking kernel tasks.
///
/// Tasks call [`wait_event`](Self::wait_event) to sleep until a condition is
/// met.  Producers call [`wake_one`](Self::wake_one) or
/// [`wake_all`](Self::wake_all) when the condition changes.
pub struct WaitQueue {
    inner: IrqMutex<WaitQueueInner>,
    /// Advanced by every `wake_all`, whether or not anybody was queued.
    generation: AtomicU32,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(WaitQueueInner::new()),
            generation: AtomicU32::new(0),
        }
    }

    /// Block the current task until `condition()` returns `true`.
    ///
    /// The condition is re-checked under the wait queue lock before sleeping,
    /// closing the race with a concurrent `wake_*`.
    ///
    /// Returns `true` if the condition was met, `false` if the task runtime is
    /// missing or the queue is full (the caller should treat that as EAGAIN).
    pub fn wait_event<F: Fn() -> bool>(&self, condition: F) -> bool {
        loop {
            if condition() {
                return true;
            }

            if !task_runtime::is_task_runtime_initialized() {
                return false;
            }

            let task = current_task();
            if task.is_null() {
                return false;
            }

            {
                let mut inner = self.inner.lock();
                if condition() {
                    return true;
                }
                if !inner.enqueue(task) {
                    return false;
                }
            }

            block_current_task();

            // Woken (or spuriously resumed): forget our slot and re-check.
            self.inner.lock().remove_task(task);
        }
    }

    /// Block until a `wake_all` issued after `seen` was read.
    pub fn wait_generation(&self, seen: u32) -> bool {
        self.wait_event(|| self.generation() != seen)
    }

    /// Wake one waiting task.
    ///
    /// Returns `true` if a task was woken, `false` if the queue was empty.
    pub fn wake_one(&self) -> bool {
        let task = self.inner.lock().dequeue_one();

        if let Some(task) = task {
            let _ = unblock_task(task);
            true
        } else {
            false
        }
    }

    /// Wake all waiting tasks.
    ///
    /// Returns the number of tasks woken.
    pub fn wake_all(&self) -> usize {
        let mut tasks = [TaskHandle::NULL; WAITQUEUE_CAPACITY];
        let count = {
            let mut inner = self.inner.lock();
            // Bumped under the queue lock so a waiter re-checking its
            // condition there either sees the new value or gets dequeued.
            self.generation.fetch_add(1, Ordering::AcqRel);
            let mut i = 0;
            inner.dequeue_all(|t| {
                if i < tasks.len() {
                    tasks[i] = t;
                    i += 1;
                }
            })
        };

        for task in &tasks[..count] {
            let _ = unblock_task(*task);
        }
        count
    }

    /// Check if there are any waiters.
    pub fn has_waiters(&self) -> bool {
        self.inner.lock().count != 0
    }

    /// Get the number of waiting tasks.
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().count
    }

    /// Remove a specific task from the wait queue.
    pub fn remove_task(&self, task: TaskHandle) {
        self.inner.lock().remove_task(task);
    }

    /// Current wake generation.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
