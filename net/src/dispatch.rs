//! Input dispatch, soft-irq draining and periodic timers.
//!
//! Receive is split across two contexts:
//!
//! - **interrupt side** ([`NetStack::dispatch_input`]): copies the payload onto
//!   the FIFO of the protocol registered for its EtherType and raises the
//!   soft-irq request.  It takes only the input-queue lock and runs no
//!   protocol logic.
//! - **deferred side** ([`NetStack::softirq_handler`]): pops entries one at a
//!   time and runs the protocol handler under the core lock.
//!
//! [`NetStack::timer_handler`] is driven by the scheduler tick and runs every
//! timer whose interval has strictly elapsed since its last run.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use laplus_lib::{klog_debug, klog_info};

use crate::netstack::{NetStack, StackCore};
use crate::types::{DevIndex, NetError};

/// Protocol input handler, run under the core lock.
pub type InputHandler = fn(&mut StackCore, &[u8], DevIndex);

/// Periodic handler, run under the core lock.
pub type TimerHandler = fn(&mut StackCore);

struct InputEntry {
    dev: DevIndex,
    data: Vec<u8>,
}

/// FIFO of received payloads for one EtherType.
pub(crate) struct InputQueue {
    ether_type: u16,
    handler: InputHandler,
    entries: VecDeque<InputEntry>,
}

impl InputQueue {
    pub(crate) fn new(ether_type: u16, handler: InputHandler) -> Self {
        Self {
            ether_type,
            handler,
            entries: VecDeque::new(),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct TimerEntry {
    interval_ms: u64,
    last_ms: u64,
    handler: TimerHandler,
}

impl StackCore {
    pub fn register_timer(&mut self, interval_ms: u64, handler: TimerHandler) {
        let last_ms = self.now_ms();
        self.timers.push(TimerEntry {
            interval_ms,
            last_ms,
            handler,
        });
        klog_debug!("net: timer registered, interval={}ms", interval_ms);
    }
}

impl NetStack {
    /// Register the input handler for `ether_type`.
    pub fn register_protocol(&self, ether_type: u16, handler: InputHandler) -> Result<(), NetError> {
        let mut inputs = self.inputs.lock();
        if inputs.iter().any(|q| q.ether_type == ether_type) {
            return Err(NetError::AlreadyExists);
        }
        inputs.push(InputQueue::new(ether_type, handler));
        klog_info!("net: protocol registered, type=0x{:04x}", ether_type);
        Ok(())
    }

    pub fn register_timer(&self, interval_ms: u64, handler: TimerHandler) {
        self.core.lock().register_timer(interval_ms, handler);
    }

    /// Interrupt side of receive.  Unknown EtherTypes are dropped.
    pub fn dispatch_input(&self, ether_type: u16, data: &[u8], dev: DevIndex) {
        {
            let mut inputs = self.inputs.lock();
            let Some(queue) = inputs.iter_mut().find(|q| q.ether_type == ether_type) else {
                return;
            };
            queue.entries.push_back(InputEntry {
                dev,
                data: data.to_vec(),
            });
        }
        if self.softirq.schedule() {
            self.softirq_wait.wake_all();
        }
    }

    /// `true` while input is waiting for [`softirq_handler`](Self::softirq_handler).
    pub fn softirq_pending(&self) -> bool {
        self.softirq.is_scheduled()
    }

    /// Block until the soft-irq request is raised.
    pub fn wait_softirq(&self) -> bool {
        self.softirq_wait.wait_event(|| self.softirq.is_scheduled())
    }

    /// Deferred side of receive.  Drains every protocol queue in FIFO order.
    ///
    /// Returns the number of entries handled.
    pub fn softirq_handler(&self) -> usize {
        let mut processed = 0;
        while self.softirq.begin_poll() {
            let count = self.inputs.lock().len();
            for index in 0..count {
                loop {
                    let next = {
                        let mut inputs = self.inputs.lock();
                        let queue = &mut inputs[index];
                        let handler = queue.handler;
                        queue.entries.pop_front().map(|entry| (handler, entry))
                    };
                    let Some((handler, entry)) = next else {
                        break;
                    };
                    let mut core = self.core.lock();
                    handler(&mut core, &entry.data, entry.dev);
                    processed += 1;
                }
            }
            self.softirq.complete();
            // Input raised while polling was refused a schedule; pick it up here.
            let pending = self.inputs.lock().iter().any(|q| !q.entries.is_empty());
            if pending {
                self.softirq.schedule();
            }
        }
        processed
    }

    /// Run every timer whose interval has strictly elapsed.
    pub fn timer_handler(&self) {
        let mut core = self.core.lock();
        let now = core.now_ms();
        for index in 0..core.timers.len() {
            let timer = core.timers[index];
            if now.saturating_sub(timer.last_ms) > timer.interval_ms {
                core.timers[index].last_ms = now;
                (timer.handler)(&mut core);
            }
        }
    }
}
