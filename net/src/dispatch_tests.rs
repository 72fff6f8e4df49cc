//! Device registry, input dispatch and timer tests.
//!
//! Covers:
//! - devices are numbered from 1 and named `net<index>` by default
//! - open/close fail when the device is already in that state
//! - run opens every device and shutdown closes them again
//! - output fails when the device is down or the payload exceeds the MTU
//! - duplicate protocol registration is refused
//! - soft-irq drain runs the handler once per entry, in FIFO order
//! - unknown EtherTypes are dropped
//! - a soft-irq worker parked on the request wakes when input arrives
//! - a timer runs only once its interval has strictly elapsed

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use laplus_lib::host_runtime;

use crate::netdev::{DeviceInfo, DeviceType, NetDevice};
use crate::netstack::StackCore;
use crate::testutil::{new_stack, wait_until};
use crate::types::{DevIndex, NetError};

struct NullDevice;

impl NetDevice for NullDevice {
    fn transmit(
        &self,
        _dev: &DeviceInfo,
        _ether_type: u16,
        data: &[u8],
        _dst: &[u8],
    ) -> Result<usize, NetError> {
        Ok(data.len())
    }
}

fn null_info(mtu: u16) -> DeviceInfo {
    DeviceInfo::new(DeviceType::Null, mtu)
}

/// Local experimental EtherType, unused by the stack.
const ETH_P_TEST: u16 = 0x88b5;

// =============================================================================
// Registry
// =============================================================================

#[test]
fn devices_are_numbered_from_one() {
    let (stack, _) = new_stack(1);
    let first = stack.register_device(null_info(1500), Box::new(NullDevice)).unwrap();
    let second = stack.register_device(null_info(1500), Box::new(NullDevice)).unwrap();
    assert_eq!(first, DevIndex(1));
    assert_eq!(second, DevIndex(2));

    let core = stack.lock();
    assert_eq!(core.devices.get(first).unwrap().info.name, "net1");
    assert_eq!(core.devices.get(second).unwrap().info.name, "net2");
    assert!(core.devices.get(DevIndex(0)).is_none());
    assert!(core.devices.get(DevIndex(3)).is_none());
}

#[test]
fn duplicate_device_name_is_rejected() {
    let (stack, _) = new_stack(1);
    let mut info = null_info(1500);
    info.name = "eth0".into();
    stack.register_device(info.clone(), Box::new(NullDevice)).unwrap();
    assert_eq!(
        stack.register_device(info, Box::new(NullDevice)),
        Err(NetError::AlreadyExists)
    );
}

#[test]
fn open_and_close_reject_repeated_transitions() {
    let (stack, _) = new_stack(1);
    let dev = stack.register_device(null_info(1500), Box::new(NullDevice)).unwrap();

    assert_eq!(stack.close_device(dev), Err(NetError::DeviceDown));
    stack.open_device(dev).unwrap();
    assert_eq!(stack.open_device(dev), Err(NetError::DeviceBusy));
    stack.close_device(dev).unwrap();
    assert_eq!(stack.close_device(dev), Err(NetError::DeviceDown));
    assert_eq!(stack.open_device(DevIndex(9)), Err(NetError::NoSuchDevice));
}

#[test]
fn run_and_shutdown_toggle_every_device() {
    let (stack, _) = new_stack(1);
    let first = stack.register_device(null_info(1500), Box::new(NullDevice)).unwrap();
    let second = stack.register_device(null_info(1500), Box::new(NullDevice)).unwrap();
    stack.open_device(second).unwrap();

    stack.run().unwrap();
    {
        let core = stack.lock();
        assert!(core.devices.get(first).unwrap().info.is_up());
        assert!(core.devices.get(second).unwrap().info.is_up());
    }

    stack.shutdown().unwrap();
    {
        let core = stack.lock();
        assert!(!core.devices.get(first).unwrap().info.is_up());
        assert!(!core.devices.get(second).unwrap().info.is_up());
    }
    // Nothing left to close.
    stack.shutdown().unwrap();
}

#[test]
fn output_checks_state_and_mtu() {
    let (stack, _) = new_stack(1);
    let dev = stack.register_device(null_info(64), Box::new(NullDevice)).unwrap();

    let core = stack.lock();
    assert_eq!(
        core.devices.output(dev, ETH_P_TEST, &[0; 16], &[]),
        Err(NetError::DeviceDown)
    );
    drop(core);

    stack.open_device(dev).unwrap();
    let core = stack.lock();
    assert_eq!(core.devices.output(dev, ETH_P_TEST, &[0; 64], &[]), Ok(64));
    assert_eq!(
        core.devices.output(dev, ETH_P_TEST, &[0; 65], &[]),
        Err(NetError::MessageTooLong)
    );
}

// =============================================================================
// Input dispatch
// =============================================================================

static SEEN: Mutex<Vec<(u8, DevIndex)>> = Mutex::new(Vec::new());

fn record_input(_core: &mut StackCore, data: &[u8], dev: DevIndex) {
    SEEN.lock().unwrap().push((data[0], dev));
}

#[test]
fn duplicate_protocol_is_rejected() {
    let (stack, _) = new_stack(1);
    assert_eq!(
        stack.register_protocol(0x0800, record_input),
        Err(NetError::AlreadyExists)
    );
}

#[test]
fn softirq_drains_in_fifo_order() {
    let (stack, _) = new_stack(1);
    stack.register_protocol(ETH_P_TEST, record_input).unwrap();
    assert!(!stack.softirq_pending());

    for byte in 1..=3u8 {
        stack.dispatch_input(ETH_P_TEST, &[byte, 0, 0], DevIndex(1));
    }
    assert!(stack.softirq_pending());
    assert_eq!(stack.softirq_handler(), 3);
    assert!(!stack.softirq_pending());

    let seen = SEEN.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![(1, DevIndex(1)), (2, DevIndex(1)), (3, DevIndex(1))]
    );
}

#[test]
fn unknown_ether_type_is_dropped() {
    let (stack, _) = new_stack(1);
    stack.dispatch_input(0x86dd, &[0; 40], DevIndex(1));
    assert!(!stack.softirq_pending());
    assert_eq!(stack.softirq_handler(), 0);
}

static WORKER_INPUT: AtomicUsize = AtomicUsize::new(0);

fn count_input(_core: &mut StackCore, _data: &[u8], _dev: DevIndex) {
    WORKER_INPUT.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn parked_worker_wakes_on_input() {
    host_runtime::install();
    let (stack, _) = new_stack(1);
    stack.register_protocol(ETH_P_TEST, count_input).unwrap();

    let s = Arc::clone(&stack);
    let worker = thread::spawn(move || {
        assert!(s.wait_softirq());
        s.softirq_handler()
    });
    wait_until(|| stack.softirq_wait.waiter_count() == 1);

    stack.dispatch_input(ETH_P_TEST, &[7], DevIndex(1));
    assert_eq!(worker.join().unwrap(), 1);
    assert_eq!(WORKER_INPUT.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Timers
// =============================================================================

static TICKS: AtomicUsize = AtomicUsize::new(0);

fn count_tick(_core: &mut StackCore) {
    TICKS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn timer_needs_a_strictly_elapsed_interval() {
    let (stack, clock) = new_stack(1);
    stack.register_timer(50, count_tick);

    clock.advance(50);
    stack.timer_handler();
    assert_eq!(TICKS.load(Ordering::SeqCst), 0);

    clock.advance(1);
    stack.timer_handler();
    assert_eq!(TICKS.load(Ordering::SeqCst), 1);

    // The interval restarts from the last run.
    clock.advance(50);
    stack.timer_handler();
    assert_eq!(TICKS.load(Ordering::SeqCst), 1);
    clock.advance(1);
    stack.timer_handler();
    assert_eq!(TICKS.load(Ordering::SeqCst), 2);
}
