//! Network device abstraction: the `NetDevice` driver trait and the device registry.
//!
//! This module is the boundary between drivers (which move frames) and the
//! protocol stack (which understands them).  A driver hands the registry a
//! [`DeviceInfo`] describing the link and a boxed [`NetDevice`]; from then on
//! the device is known only by its [`DevIndex`].
//!
//! # Concurrency model
//!
//! The registry lives inside [`StackCore`](crate::netstack::StackCore) and is
//! only touched with the core lock held.  Driver methods take `&self`;
//! implementations use interior mutability for their own state.  A driver's
//! `transmit` runs under the core lock, so it must not call back into the
//! stack other than through [`NetStack::dispatch_input`](crate::NetStack::dispatch_input),
//! which only takes the input-queue lock.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use laplus_abi::net::IFNAMSIZ;
use laplus_lib::klog_info;

use crate::types::{DevIndex, IfaceId, MacAddr, NetError};

/// Storage size of hardware and broadcast addresses in a device record.
pub const DEVICE_ADDR_LEN: usize = 16;

// =============================================================================
// NetDevice trait
// =============================================================================

/// Driver side of a network device.
///
/// `open`/`close` are invoked when the device changes administrative state;
/// the registry has already checked that the transition is valid.
pub trait NetDevice: Send + Sync {
    fn open(&self) -> Result<(), NetError> {
        Ok(())
    }

    fn close(&self) -> Result<(), NetError> {
        Ok(())
    }

    /// Put one frame of `ether_type` on the link, addressed to `dst`
    /// (a hardware address of `dev.alen` bytes).
    ///
    /// Returns the number of payload bytes handed to the link.
    fn transmit(
        &self,
        dev: &DeviceInfo,
        ether_type: u16,
        data: &[u8],
        dst: &[u8],
    ) -> Result<usize, NetError>;
}

// =============================================================================
// Device description
// =============================================================================

/// Link type of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceType {
    #[default]
    Null,
    Loopback,
    Ethernet,
}

impl DeviceType {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Loopback => "loopback",
            Self::Ethernet => "ethernet",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Device state and capability flags.  Values match the `IFF_*` ABI.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeviceFlags: u16 {
        const UP        = 0x0001;
        const LOOPBACK  = 0x0010;
        const BROADCAST = 0x0020;
        const P2P       = 0x0040;
        /// Link-layer addresses must be resolved with ARP before transmit.
        const NEED_ARP  = 0x0100;
    }
}

/// Registry record describing one device.
///
/// `index` and an empty `name` are filled in by [`DeviceRegistry::register`].
#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub kind: DeviceType,
    pub mtu: u16,
    pub flags: DeviceFlags,
    /// Link header length.
    pub hlen: u16,
    /// Hardware address length.
    pub alen: u16,
    pub addr: [u8; DEVICE_ADDR_LEN],
    pub broadcast: [u8; DEVICE_ADDR_LEN],
}

impl DeviceInfo {
    pub fn new(kind: DeviceType, mtu: u16) -> Self {
        Self {
            kind,
            mtu,
            ..Self::default()
        }
    }

    #[inline]
    pub fn dev_index(&self) -> DevIndex {
        DevIndex(self.index)
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.flags.contains(DeviceFlags::UP)
    }

    /// Hardware address bytes (`alen` long).
    pub fn hw_addr(&self) -> &[u8] {
        &self.addr[..(self.alen as usize).min(DEVICE_ADDR_LEN)]
    }

    /// Link broadcast address bytes (`alen` long).
    pub fn hw_broadcast(&self) -> &[u8] {
        &self.broadcast[..(self.alen as usize).min(DEVICE_ADDR_LEN)]
    }

    /// The hardware address as a MAC, or all-zero for devices without one.
    pub fn mac(&self) -> MacAddr {
        MacAddr::from_slice(&self.addr).unwrap_or(MacAddr::ZERO)
    }

    pub fn set_mac(&mut self, mac: MacAddr) {
        self.addr[..6].copy_from_slice(mac.as_bytes());
    }
}

/// Protocol family of an interface bound to a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IfaceFamily {
    Ipv4,
}

/// A registered device: description, driver, and bound interfaces.
pub struct Device {
    pub info: DeviceInfo,
    driver: Box<dyn NetDevice>,
    ifaces: Vec<(IfaceFamily, IfaceId)>,
}

impl Device {
    /// Interface of `family` bound to this device.
    pub fn iface(&self, family: IfaceFamily) -> Option<IfaceId> {
        self.ifaces
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, id)| *id)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Device {{ index={}, name={}, type={}, mtu={}, flags={:?} }}",
            self.info.index, self.info.name, self.info.kind, self.info.mtu, self.info.flags
        )
    }
}

// =============================================================================
// Registry
// =============================================================================

/// All registered devices, indexed from 1 in registration order.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    /// Register a device.  The next index is assigned and, when `info.name` is
    /// empty, the name defaults to `net<index>`.
    pub fn register(
        &mut self,
        mut info: DeviceInfo,
        driver: Box<dyn NetDevice>,
    ) -> Result<DevIndex, NetError> {
        let index = self.devices.len() + 1;
        if info.name.is_empty() {
            info.name = format!("net{}", index);
        }
        if info.name.len() >= IFNAMSIZ {
            return Err(NetError::InvalidArgument);
        }
        if self.by_name(&info.name).is_some() {
            return Err(NetError::AlreadyExists);
        }
        info.index = index;
        info.flags.remove(DeviceFlags::UP);
        klog_info!(
            "net: registered, dev={}, type={}, mtu={}",
            info.name,
            info.kind,
            info.mtu
        );
        self.devices.push(Device {
            info,
            driver,
            ifaces: Vec::new(),
        });
        Ok(DevIndex(index))
    }

    pub fn get(&self, dev: DevIndex) -> Option<&Device> {
        self.devices.get(dev.0.checked_sub(1)?)
    }

    pub fn get_mut(&mut self, dev: DevIndex) -> Option<&mut Device> {
        self.devices.get_mut(dev.0.checked_sub(1)?)
    }

    pub fn by_name(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.info.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Bind `iface` to `dev`.  A device carries at most one interface per family.
    pub fn add_iface(
        &mut self,
        dev: DevIndex,
        family: IfaceFamily,
        iface: IfaceId,
    ) -> Result<(), NetError> {
        let device = self.get_mut(dev).ok_or(NetError::NoSuchDevice)?;
        if device.iface(family).is_some() {
            return Err(NetError::AlreadyExists);
        }
        device.ifaces.push((family, iface));
        Ok(())
    }

    pub fn iface(&self, dev: DevIndex, family: IfaceFamily) -> Option<IfaceId> {
        self.get(dev)?.iface(family)
    }

    pub fn open(&mut self, dev: DevIndex) -> Result<(), NetError> {
        let device = self.get_mut(dev).ok_or(NetError::NoSuchDevice)?;
        if device.info.is_up() {
            return Err(NetError::DeviceBusy);
        }
        device.driver.open()?;
        device.info.flags.insert(DeviceFlags::UP);
        klog_info!("net: dev={}, state=up", device.info.name);
        Ok(())
    }

    pub fn close(&mut self, dev: DevIndex) -> Result<(), NetError> {
        let device = self.get_mut(dev).ok_or(NetError::NoSuchDevice)?;
        if !device.info.is_up() {
            return Err(NetError::DeviceDown);
        }
        device.driver.close()?;
        device.info.flags.remove(DeviceFlags::UP);
        klog_info!("net: dev={}, state=down", device.info.name);
        Ok(())
    }

    /// Hand `data` to the driver.  Returns the payload length.
    pub fn output(
        &self,
        dev: DevIndex,
        ether_type: u16,
        data: &[u8],
        dst: &[u8],
    ) -> Result<usize, NetError> {
        let device = self.get(dev).ok_or(NetError::NoSuchDevice)?;
        if !device.info.is_up() {
            return Err(NetError::DeviceDown);
        }
        if data.len() > device.info.mtu as usize {
            return Err(NetError::MessageTooLong);
        }
        device
            .driver
            .transmit(&device.info, ether_type, data, dst)?;
        Ok(data.len())
    }
}
