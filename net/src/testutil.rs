//! Test doubles shared by the stack's unit tests.
//!
//! - `TestDevice`: an Ethernet driver that records every frame it is asked to
//!   send and, when wired to a peer, delivers it to the peer stack.
//! - `Pair`: two stacks on one `/24`, wired back to back, with static ARP
//!   entries so that nothing waits on resolution.
//! - `Pump`: a background thread that drains the soft-irq queues while test
//!   threads block in socket calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use laplus_lib::host_runtime;

use crate::ethernet;
use crate::netdev::{DeviceInfo, NetDevice};
use crate::netstack::{IfaceConfig, ManualClock, NetConfig, NetStack};
use crate::types::{DevIndex, Ipv4Addr, MacAddr, NetError};

pub const MAC_A: MacAddr = MacAddr([0x00, 0x00, 0x5e, 0x00, 0x53, 0x01]);
pub const MAC_B: MacAddr = MacAddr([0x00, 0x00, 0x5e, 0x00, 0x53, 0x02]);
pub const IP_A: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
pub const IP_B: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 2);
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

// =============================================================================
// TestDevice
// =============================================================================

struct Peer {
    stack: Weak<NetStack>,
    dev: DevIndex,
    mac: MacAddr,
}

/// Test-side handle on a `TestDevice`.
#[derive(Clone, Default)]
pub struct TestLink {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    peer: Arc<Mutex<Option<Peer>>>,
}

impl TestLink {
    /// Frames sent so far, oldest first.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }

    /// Deliver every later frame to `dev` of `stack`.
    pub fn connect(&self, stack: &Arc<NetStack>, dev: DevIndex, mac: MacAddr) {
        *self.peer.lock().unwrap() = Some(Peer {
            stack: Arc::downgrade(stack),
            dev,
            mac,
        });
    }
}

struct TestDevice {
    mac: MacAddr,
    link: TestLink,
}

impl NetDevice for TestDevice {
    fn transmit(
        &self,
        _dev: &DeviceInfo,
        ether_type: u16,
        data: &[u8],
        dst: &[u8],
    ) -> Result<usize, NetError> {
        ethernet::transmit_helper(self.mac, ether_type, data, dst, |frame| {
            self.link.frames.lock().unwrap().push(frame.to_vec());
            let peer = self.link.peer.lock().unwrap();
            if let Some(peer) = peer.as_ref() {
                if let Some(stack) = peer.stack.upgrade() {
                    ethernet::receive(&stack, peer.dev, peer.mac, frame);
                }
            }
            Ok(frame.len())
        })
    }
}

/// A stack on a manual clock starting at 1000 ms.
pub fn new_stack(iss_seed: u32) -> (Arc<NetStack>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let stack = NetStack::with_clock(NetConfig::new().with_iss_seed(iss_seed), clock.clone());
    (stack, clock)
}

/// Register, address and open an Ethernet `TestDevice`.
pub fn add_ether(stack: &Arc<NetStack>, mac: MacAddr, ip: Ipv4Addr) -> (DevIndex, TestLink) {
    let link = TestLink::default();
    let mut info = DeviceInfo::default();
    ethernet::ether_setup_helper(&mut info);
    info.set_mac(mac);
    let driver = TestDevice {
        mac,
        link: link.clone(),
    };
    let dev = stack.register_device(info, Box::new(driver)).unwrap();
    stack.configure(dev, IfaceConfig::new(ip, NETMASK)).unwrap();
    stack.open_device(dev).unwrap();
    (dev, link)
}

/// Poll until `cond` holds, giving blocked threads time to park.
pub fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..5_000 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("condition never became true");
}

/// Run the soft-irq handler until no input is pending.
pub fn pump(stack: &NetStack) -> usize {
    let mut total = 0;
    while stack.softirq_pending() {
        total += stack.softirq_handler();
    }
    total
}

// =============================================================================
// Pair
// =============================================================================

/// `a` (`IP_A`, ISS 100) and `b` (`IP_B`, ISS 300) wired back to back.
pub struct Pair {
    pub a: Arc<NetStack>,
    pub b: Arc<NetStack>,
    pub link_a: TestLink,
    pub link_b: TestLink,
}

impl Pair {
    pub fn new() -> Self {
        host_runtime::install();
        let (a, _) = new_stack(100);
        let (b, _) = new_stack(300);
        let (dev_a, link_a) = add_ether(&a, MAC_A, IP_A);
        let (dev_b, link_b) = add_ether(&b, MAC_B, IP_B);
        link_a.connect(&b, dev_b, MAC_B);
        link_b.connect(&a, dev_a, MAC_A);
        a.lock().arp.add_static(IP_B, MAC_B).unwrap();
        b.lock().arp.add_static(IP_A, MAC_A).unwrap();
        Self {
            a,
            b,
            link_a,
            link_b,
        }
    }

    /// Drain both stacks until neither has input left.
    pub fn pump(&self) {
        while self.a.softirq_pending() || self.b.softirq_pending() {
            pump(&self.a);
            pump(&self.b);
        }
    }

    /// Keep both stacks drained from a background thread.
    pub fn spawn_pump(&self) -> Pump {
        Pump::spawn(vec![self.a.clone(), self.b.clone()])
    }
}

// =============================================================================
// Pump
// =============================================================================

/// Background soft-irq drain, stopped on drop.
pub struct Pump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Pump {
    pub fn spawn(stacks: Vec<Arc<NetStack>>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    for stack in &stacks {
                        pump(stack);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
