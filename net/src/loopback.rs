//! Loopback device.
//!
//! Every frame handed to the driver is fed straight back into the stack's
//! input queues, so it is processed on the next soft-irq pass like any
//! received frame.  The device has no link header and needs no ARP.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};

use laplus_lib::klog_debug;

use crate::netdev::{DeviceFlags, DeviceInfo, DeviceType, NetDevice};
use crate::netstack::{IfaceConfig, NetStack};
use crate::types::{DevIndex, Ipv4Addr, NetError};

/// Largest datagram the loopback carries.
pub const LOOPBACK_MTU: u16 = 4096;
pub const LOOPBACK_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 0, 0, 0);

pub struct Loopback {
    stack: Weak<NetStack>,
}

impl Loopback {
    pub fn new(stack: &Arc<NetStack>) -> Self {
        Self {
            stack: Arc::downgrade(stack),
        }
    }

    pub fn info() -> DeviceInfo {
        DeviceInfo {
            name: String::from("lo"),
            kind: DeviceType::Loopback,
            mtu: LOOPBACK_MTU,
            flags: DeviceFlags::LOOPBACK,
            ..DeviceInfo::default()
        }
    }
}

impl NetDevice for Loopback {
    fn transmit(
        &self,
        dev: &DeviceInfo,
        ether_type: u16,
        data: &[u8],
        _dst: &[u8],
    ) -> Result<usize, NetError> {
        let stack = self.stack.upgrade().ok_or(NetError::DeviceDown)?;
        klog_debug!(
            "loopback: dev={}, type=0x{:04x}, len={}",
            dev.name,
            ether_type,
            data.len()
        );
        stack.dispatch_input(ether_type, data, dev.dev_index());
        Ok(data.len())
    }
}

/// Register the loopback device and give it `127.0.0.1/8`.
pub fn init_loopback(stack: &Arc<NetStack>) -> Result<DevIndex, NetError> {
    let dev = stack.register_device(Loopback::info(), Box::new(Loopback::new(stack)))?;
    stack.configure(dev, IfaceConfig::new(Ipv4Addr::LOCALHOST, LOOPBACK_NETMASK))?;
    Ok(dev)
}
