//! Soft-irq request state.
//!
//! `Idle -> Scheduled` is raised from interrupt context by
//! [`SoftIrq::schedule`]; the deferred handler claims the request with
//! [`SoftIrq::begin_poll`] and drops back to `Idle` with
//! [`SoftIrq::complete`].  A request raised while polling is refused, so the
//! handler re-checks its queues after `complete` and reschedules itself.

use core::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoftIrqState {
    Idle = 0,
    Scheduled = 1,
    Polling = 2,
}

pub struct SoftIrq {
    state: AtomicU8,
}

impl SoftIrq {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(SoftIrqState::Idle as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> SoftIrqState {
        match self.state.load(Ordering::Acquire) {
            1 => SoftIrqState::Scheduled,
            2 => SoftIrqState::Polling,
            _ => SoftIrqState::Idle,
        }
    }

    #[inline]
    pub fn is_scheduled(&self) -> bool {
        matches!(self.state(), SoftIrqState::Scheduled)
    }

    /// Raise the request.  Returns `true` if this call moved it out of `Idle`.
    pub fn schedule(&self) -> bool {
        self.state
            .compare_exchange(
                SoftIrqState::Idle as u8,
                SoftIrqState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn begin_poll(&self) -> bool {
        self.state
            .compare_exchange(
                SoftIrqState::Scheduled as u8,
                SoftIrqState::Polling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn complete(&self) {
        self.state.store(SoftIrqState::Idle as u8, Ordering::Release);
    }
}

impl Default for SoftIrq {
    fn default() -> Self {
        Self::new()
    }
}
