use core::ops::{Deref, DerefMut};

use crate::kernel_services::platform;

/// Mutex that disables interrupts while held.
///
/// Essential for state shared between interrupt context and task context:
/// a task holding the lock cannot be interrupted by a handler that would spin
/// on the same lock.  Interrupt masking goes through the platform service, so
/// on hosts without one the lock degrades to a plain spin lock.
pub struct IrqMutex<T> {
    inner: spin::Mutex<T>,
}

/// Restores the interrupt flags on drop.  Declared after the data guard in
/// [`IrqMutexGuard`] so the lock is released before interrupts come back.
struct IrqRestore {
    saved_flags: u64,
}

impl Drop for IrqRestore {
    #[inline]
    fn drop(&mut self) {
        platform::irq_restore(self.saved_flags);
    }
}

pub struct IrqMutexGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _irq: IrqRestore,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }

    /// Check if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq = IrqRestore {
            saved_flags: platform::irq_save(),
        };
        IrqMutexGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let irq = IrqRestore {
            saved_flags: platform::irq_save(),
        };
        // On failure `irq` drops here and the flags are restored.
        let guard = self.inner.try_lock()?;
        Some(IrqMutexGuard { guard, _irq: irq })
    }

    /// Consume the mutex, returning the protected data.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for IrqMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
