//! IPv4: interfaces, header codec, input validation and output.
//!
//! Each device carries at most one IPv4 [`Iface`].  Output picks the route
//! for the destination, builds a 20-byte header and resolves the next hop
//! with ARP on devices that need it.  Fragmented datagrams are refused on
//! input and never produced on output.

use alloc::vec::Vec;
use core::fmt;

use laplus_lib::{klog_debug, klog_info};

use crate::arp::{self, ArpResult};
use crate::checksum::cksum16;
use crate::netdev::{DEVICE_ADDR_LEN, DeviceFlags, IfaceFamily};
use crate::netstack::StackCore;
use crate::types::{DevIndex, EtherType, IfaceId, Ipv4Addr, NetError};

pub const IP_VERSION_IPV4: u8 = 4;
pub const IP_HDR_SIZE_MIN: usize = 20;
pub const IP_HDR_SIZE_MAX: usize = 60;
pub const IP_TOTAL_SIZE_MAX: usize = 4096;
pub const IP_PAYLOAD_SIZE_MAX: usize = IP_TOTAL_SIZE_MAX - IP_HDR_SIZE_MIN;
pub const IP_TTL_DEFAULT: u8 = 0xff;

const IP_FLAG_MF: u16 = 0x2000;
const IP_OFFSET_MASK: u16 = 0x1fff;

/// Upper-layer input handler: `(payload, src, dst, iface)`, run under the core lock.
pub type IpHandler = fn(&mut StackCore, &[u8], Ipv4Addr, Ipv4Addr, IfaceId);

// =============================================================================
// Interfaces
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Iface {
    pub dev: DevIndex,
    pub unicast: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

impl Iface {
    pub fn new(dev: DevIndex, unicast: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            dev,
            unicast,
            netmask,
            broadcast: unicast.directed_broadcast(netmask),
        }
    }
}

impl fmt::Debug for Iface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dev={}, unicast={}, netmask={}, broadcast={}",
            self.dev, self.unicast, self.netmask, self.broadcast
        )
    }
}

/// Every registered IPv4 interface, addressed by [`IfaceId`].
#[derive(Default)]
pub struct IfaceTable {
    ifaces: Vec<Iface>,
}

impl IfaceTable {
    pub const fn new() -> Self {
        Self { ifaces: Vec::new() }
    }

    pub fn get(&self, id: IfaceId) -> Option<&Iface> {
        self.ifaces.get(id.0)
    }

    pub fn get_mut(&mut self, id: IfaceId) -> Option<&mut Iface> {
        self.ifaces.get_mut(id.0)
    }

    /// Interface whose unicast address is `addr`.
    pub fn select(&self, addr: Ipv4Addr) -> Option<IfaceId> {
        self.ifaces
            .iter()
            .position(|i| i.unicast == addr)
            .map(IfaceId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (IfaceId, &Iface)> {
        self.ifaces.iter().enumerate().map(|(i, iface)| (IfaceId(i), iface))
    }

    fn push(&mut self, iface: Iface) -> IfaceId {
        self.ifaces.push(iface);
        IfaceId(self.ifaces.len() - 1)
    }
}

/// Bind a new interface to `dev` and add its connected route.
pub fn iface_register(
    core: &mut StackCore,
    dev: DevIndex,
    unicast: Ipv4Addr,
    netmask: Ipv4Addr,
) -> Result<IfaceId, NetError> {
    let device = core.devices.get(dev).ok_or(NetError::NoSuchDevice)?;
    if device.iface(IfaceFamily::Ipv4).is_some() {
        return Err(NetError::AlreadyExists);
    }
    let iface = Iface::new(dev, unicast, netmask);
    let id = core.ifaces.push(iface);
    core.devices.add_iface(dev, IfaceFamily::Ipv4, id)?;
    core.routes
        .add(unicast.mask(netmask), netmask, Ipv4Addr::UNSPECIFIED, id);
    klog_info!("ip: registered, {:?}", iface);
    Ok(id)
}

/// Change an interface's address and rewrite its connected route.
pub fn iface_reconfigure(
    core: &mut StackCore,
    id: IfaceId,
    unicast: Ipv4Addr,
    netmask: Ipv4Addr,
) -> Result<(), NetError> {
    let iface = core.ifaces.get_mut(id).ok_or(NetError::NotFound)?;
    *iface = Iface::new(iface.dev, unicast, netmask);
    let iface = *iface;
    core.routes.update_connected(id, unicast, netmask);
    klog_info!("ip: reconfigured, {:?}", iface);
    Ok(())
}

/// Register an upper-layer protocol handler.
pub fn protocol_register(
    core: &mut StackCore,
    protocol: u8,
    handler: IpHandler,
) -> Result<(), NetError> {
    if core.ip_protocols.iter().any(|(p, _)| *p == protocol) {
        return Err(NetError::AlreadyExists);
    }
    core.ip_protocols.push((protocol, handler));
    klog_info!("ip: protocol registered, type={}", protocol);
    Ok(())
}

// =============================================================================
// Header
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in bytes.
    pub hlen: usize,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    /// Flags and fragment offset, as on the wire.
    pub offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Decode the fixed part of a header.  No validation beyond length.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IP_HDR_SIZE_MIN {
            return None;
        }
        Some(Self {
            version: data[0] >> 4,
            hlen: ((data[0] & 0x0f) as usize) << 2,
            tos: data[1],
            total_len: u16::from_be_bytes([data[2], data[3]]),
            id: u16::from_be_bytes([data[4], data[5]]),
            offset: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src: Ipv4Addr([data[12], data[13], data[14], data[15]]),
            dst: Ipv4Addr([data[16], data[17], data[18], data[19]]),
        })
    }

    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.offset & IP_FLAG_MF != 0 || self.offset & IP_OFFSET_MASK != 0
    }
}

/// Build a complete datagram: 20-byte header with checksum, then `payload`.
pub fn build_datagram(
    protocol: u8,
    id: u16,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    payload: &[u8],
) -> Vec<u8> {
    let total = IP_HDR_SIZE_MIN + payload.len();
    let mut buf = Vec::with_capacity(total);
    buf.push((IP_VERSION_IPV4 << 4) | (IP_HDR_SIZE_MIN >> 2) as u8);
    buf.push(0);
    buf.extend_from_slice(&(total as u16).to_be_bytes());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.push(IP_TTL_DEFAULT);
    buf.push(protocol);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(src.as_bytes());
    buf.extend_from_slice(dst.as_bytes());
    let sum = cksum16(&buf[..IP_HDR_SIZE_MIN], 0);
    buf[10..12].copy_from_slice(&sum.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

// =============================================================================
// Input
// =============================================================================

/// IPv4 input handler.
pub fn input(core: &mut StackCore, data: &[u8], dev: DevIndex) {
    let Some(hdr) = Ipv4Header::parse(data) else {
        klog_debug!("ip: too short, len={}", data.len());
        return;
    };
    if hdr.version != IP_VERSION_IPV4 {
        klog_debug!("ip: version error, v={}", hdr.version);
        return;
    }
    if hdr.hlen < IP_HDR_SIZE_MIN || data.len() < hdr.hlen {
        klog_debug!("ip: header length error, len={}, hlen={}", data.len(), hdr.hlen);
        return;
    }
    let total = hdr.total_len as usize;
    if data.len() < total || total < hdr.hlen {
        klog_debug!("ip: total length error, len={}, total={}", data.len(), total);
        return;
    }
    if cksum16(&data[..hdr.hlen], 0) != 0 {
        klog_debug!("ip: checksum error, sum=0x{:04x}", hdr.checksum);
        return;
    }
    if hdr.is_fragment() {
        klog_debug!("ip: fragments not supported, id={}", hdr.id);
        return;
    }
    let Some(iface_id) = core.devices.iface(dev, IfaceFamily::Ipv4) else {
        return;
    };
    let Some(iface) = core.ifaces.get(iface_id).copied() else {
        return;
    };
    if hdr.dst != iface.unicast && hdr.dst != iface.broadcast && !hdr.dst.is_broadcast() {
        // For another host.
        return;
    }
    klog_debug!(
        "ip: dev={}, iface={}, protocol={}, total={}",
        dev,
        iface.unicast,
        hdr.protocol,
        total
    );
    let Some(handler) = core
        .ip_protocols
        .iter()
        .find(|(p, _)| *p == hdr.protocol)
        .map(|(_, h)| *h)
    else {
        return;
    };
    handler(core, &data[hdr.hlen..total], hdr.src, hdr.dst, iface_id);
}

// =============================================================================
// Output
// =============================================================================

fn generate_id(core: &mut StackCore) -> u16 {
    let id = core.ip_id;
    core.ip_id = id.wrapping_add(1);
    id
}

fn output_device(
    core: &mut StackCore,
    iface_id: IfaceId,
    datagram: &[u8],
    nexthop: Ipv4Addr,
) -> Result<(), NetError> {
    let iface = *core.ifaces.get(iface_id).ok_or(NetError::NotFound)?;
    let (need_arp, mut hwaddr, alen) = {
        let info = &core.devices.get(iface.dev).ok_or(NetError::NoSuchDevice)?.info;
        (
            info.flags.contains(DeviceFlags::NEED_ARP),
            info.broadcast,
            info.hw_addr().len(),
        )
    };
    if !need_arp {
        hwaddr = [0; DEVICE_ADDR_LEN];
    } else if nexthop != iface.broadcast && !nexthop.is_broadcast() {
        match arp::resolve(core, iface_id, nexthop) {
            ArpResult::Found(mac) => {
                hwaddr = [0; DEVICE_ADDR_LEN];
                hwaddr[..6].copy_from_slice(mac.as_bytes());
            }
            // Dropped; the sender retransmits once the address is learned.
            ArpResult::Incomplete => return Ok(()),
            ArpResult::Error => return Err(NetError::HostUnreachable),
        }
    }
    core.devices
        .output(iface.dev, EtherType::Ipv4.as_u16(), datagram, &hwaddr[..alen])
        .map(|_| ())
}

/// Send `payload` as one datagram of `protocol` from `src` to `dst`.
///
/// `src` may be `UNSPECIFIED`, in which case the route's interface address is
/// used.  Returns the payload length.
pub fn output(
    core: &mut StackCore,
    protocol: u8,
    payload: &[u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<usize, NetError> {
    if src.is_unspecified() && dst.is_broadcast() {
        klog_debug!("ip: source address is required for broadcast addresses");
        return Err(NetError::InvalidArgument);
    }
    let Some(route) = core.routes.lookup(dst) else {
        klog_debug!("ip: no route to host, addr={}", dst);
        return Err(NetError::NetworkUnreachable);
    };
    let iface = *core.ifaces.get(route.iface).ok_or(NetError::NotFound)?;
    if !src.is_unspecified() && src != iface.unicast {
        klog_debug!("ip: unable to output with specified source address, addr={}", src);
        return Err(NetError::AddressNotAvailable);
    }
    let mtu = core
        .devices
        .get(iface.dev)
        .map(|d| d.info.mtu as usize)
        .ok_or(NetError::NoSuchDevice)?;
    if mtu < IP_HDR_SIZE_MIN + payload.len() {
        klog_debug!("ip: too long, mtu={} < {}", mtu, IP_HDR_SIZE_MIN + payload.len());
        return Err(NetError::MessageTooLong);
    }
    let nexthop = route.next_hop(dst);
    let id = generate_id(core);
    let datagram = build_datagram(protocol, id, iface.unicast, dst, payload);
    klog_debug!(
        "ip: iface={}, protocol={}, len={}",
        iface.unicast,
        protocol,
        datagram.len()
    );
    output_device(core, route.iface, &datagram, nexthop)?;
    Ok(payload.len())
}
