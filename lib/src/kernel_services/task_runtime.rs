use core::fmt;

/// Opaque scheduler handle for a task.  `TaskHandle::NULL` means "no task".
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub usize);

impl TaskHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskHandle({:#x})", self.0)
    }
}

crate::define_service! {
    task_runtime => TaskRuntimeServices {
        /// Handle of the task running on this CPU.
        current_task() -> TaskHandle;
        /// Put the current task to sleep until someone calls `unblock_task` on it.
        /// A wakeup that arrives first is remembered and makes this return at once.
        block_current_task();
        /// Make `task` runnable again.  Returns `false` for an unknown handle.
        unblock_task(task: TaskHandle) -> bool;
    }
}
