//! BSD-like socket layer over the TCP and UDP user commands.
//!
//! A socket descriptor is an index into a fixed table of [`MAX_SOCKETS`]
//! slots; each used slot remembers its type and the PCB id it fronts.
//! Addresses cross this boundary as [`SockAddress`] and are decoded from the
//! user layout exactly once.
//!
//! # Locking
//!
//! The socket table has its own lock.  Every command copies the slot out and
//! drops that lock before calling into TCP or UDP, so a blocked `accept` or
//! `recv` never stalls other descriptors.

use core::fmt;

use laplus_abi::net::{
    AF_INET, ARPHRD_ETHER, ARPHRD_LOOPBACK, IfReq, MAX_SOCKETS, SIOCGIFADDR, SIOCGIFBRDADDR,
    SIOCGIFFLAGS, SIOCGIFHWADDR, SIOCGIFINDEX, SIOCGIFMTU, SIOCGIFNAME, SIOCGIFNETMASK,
    SIOCSIFADDR, SIOCSIFBRDADDR, SIOCSIFFLAGS, SIOCSIFHWADDR, SIOCSIFMTU, SIOCSIFNAME,
    SIOCSIFNETMASK, SOCK_DGRAM, SOCK_STREAM, SockAddrAny, SockAddrIn,
};
use laplus_lib::{klog_debug, klog_warn};

use crate::ipv4;
use crate::netdev::{DeviceFlags, DeviceType, IfaceFamily};
use crate::netstack::{NetStack, StackCore};
use crate::types::{DevIndex, Ipv4Addr, NetError, Port, SockAddr};

/// Netmask given to an interface created by `SIOCSIFADDR`.
const HOST_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

// =============================================================================
// Addresses and types
// =============================================================================

/// A decoded socket address.  Only IPv4 is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockAddress {
    Inet(SockAddr),
}

impl SockAddress {
    /// Decode a user `sockaddr`, rejecting every family but `AF_INET`.
    pub fn from_user(raw: &SockAddrAny) -> Result<Self, NetError> {
        match raw.family {
            AF_INET => SockAddr::from_user(&SockAddrIn::from_any(raw)).map(Self::Inet),
            other => {
                klog_debug!("socket: unsupported address family, family={}", other);
                Err(NetError::AddressFamilyNotSupported)
            }
        }
    }

    pub fn to_user(&self) -> SockAddrAny {
        match self {
            Self::Inet(addr) => addr.to_user().to_any(),
        }
    }
}

impl From<SockAddr> for SockAddress {
    fn from(addr: SockAddr) -> Self {
        Self::Inet(addr)
    }
}

impl fmt::Display for SockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{}", addr),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketType {
    /// `SOCK_STREAM`, backed by a TCP PCB.
    Stream,
    /// `SOCK_DGRAM`, backed by a UDP PCB.
    Dgram,
}

impl SocketType {
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            SOCK_STREAM => Some(Self::Stream),
            SOCK_DGRAM => Some(Self::Dgram),
            _ => None,
        }
    }
}

// =============================================================================
// Descriptor table
// =============================================================================

#[derive(Clone, Copy, Debug)]
struct Socket {
    kind: SocketType,
    /// TCP or UDP PCB id.
    desc: usize,
}

pub struct SocketTable {
    slots: [Option<Socket>; MAX_SOCKETS],
}

impl SocketTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_SOCKETS],
        }
    }

    fn alloc(&mut self, sock: Socket) -> Option<usize> {
        let fd = self.slots.iter().position(Option::is_none)?;
        self.slots[fd] = Some(sock);
        Some(fd)
    }

    fn get(&self, fd: usize) -> Result<Socket, NetError> {
        self.slots
            .get(fd)
            .copied()
            .flatten()
            .ok_or(NetError::BadDescriptor)
    }

    fn free(&mut self, fd: usize) -> Result<Socket, NetError> {
        self.slots
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(NetError::BadDescriptor)
    }

    /// Number of descriptors in use.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Socket commands
// =============================================================================

impl NetStack {
    fn socket_of(&self, fd: usize, want: SocketType) -> Result<usize, NetError> {
        let sock = self.sockets.lock().get(fd)?;
        if sock.kind != want {
            klog_debug!("socket: wrong socket type, fd={}, type={:?}", fd, sock.kind);
            return Err(NetError::OperationNotSupported);
        }
        Ok(sock.desc)
    }

    fn socket_install(&self, kind: SocketType, desc: usize) -> Result<usize, NetError> {
        self.sockets
            .lock()
            .alloc(Socket { kind, desc })
            .ok_or_else(|| {
                klog_warn!("socket: descriptor table full");
                NetError::NoBufferSpace
            })
    }

    /// Number of open socket descriptors.
    pub fn socket_count(&self) -> usize {
        self.sockets.lock().open_count()
    }

    /// `socket(2)`.  Only `AF_INET` with protocol 0.
    pub fn socket_open(&self, domain: u16, kind: u16, protocol: u16) -> Result<usize, NetError> {
        if domain != AF_INET {
            return Err(NetError::AddressFamilyNotSupported);
        }
        let kind = SocketType::from_raw(kind).ok_or(NetError::SocketTypeNotSupported)?;
        if protocol != 0 {
            return Err(NetError::ProtocolNotSupported);
        }
        let desc = match kind {
            SocketType::Stream => self.tcp_open()?,
            SocketType::Dgram => self.udp_open()?,
        };
        match self.socket_install(kind, desc) {
            Ok(fd) => {
                klog_debug!("socket: opened, fd={}, type={:?}, desc={}", fd, kind, desc);
                Ok(fd)
            }
            Err(err) => {
                let _ = match kind {
                    SocketType::Stream => self.tcp_close(desc),
                    SocketType::Dgram => self.udp_close(desc),
                };
                Err(err)
            }
        }
    }

    /// `close(2)`.  The descriptor is freed even when the PCB refuses.
    pub fn socket_close(&self, fd: usize) -> Result<(), NetError> {
        let sock = self.sockets.lock().free(fd)?;
        klog_debug!("socket: closed, fd={}", fd);
        match sock.kind {
            SocketType::Stream => self.tcp_close(sock.desc),
            SocketType::Dgram => self.udp_close(sock.desc),
        }
    }

    pub fn socket_bind(&self, fd: usize, addr: &SockAddress) -> Result<(), NetError> {
        let sock = self.sockets.lock().get(fd)?;
        let SockAddress::Inet(local) = *addr;
        match sock.kind {
            SocketType::Stream => self.tcp_bind(sock.desc, local),
            SocketType::Dgram => self.udp_bind(sock.desc, local),
        }
    }

    pub fn socket_listen(&self, fd: usize, backlog: usize) -> Result<(), NetError> {
        let desc = self.socket_of(fd, SocketType::Stream)?;
        self.tcp_listen(desc, backlog)
    }

    /// `accept(2)`.  Blocks for a connection and gives it a new descriptor.
    pub fn socket_accept(&self, fd: usize) -> Result<(usize, SockAddress), NetError> {
        let desc = self.socket_of(fd, SocketType::Stream)?;
        let (child, foreign) = self.tcp_accept(desc)?;
        match self.socket_install(SocketType::Stream, child) {
            Ok(new_fd) => Ok((new_fd, SockAddress::Inet(foreign))),
            Err(err) => {
                let _ = self.tcp_close(child);
                Err(err)
            }
        }
    }

    pub fn socket_connect(&self, fd: usize, addr: &SockAddress) -> Result<(), NetError> {
        let desc = self.socket_of(fd, SocketType::Stream)?;
        let SockAddress::Inet(foreign) = *addr;
        self.tcp_connect(desc, foreign)
    }

    pub fn socket_send(&self, fd: usize, buf: &[u8]) -> Result<usize, NetError> {
        let desc = self.socket_of(fd, SocketType::Stream)?;
        self.tcp_send(desc, buf)
    }

    pub fn socket_recv(&self, fd: usize, buf: &mut [u8]) -> Result<usize, NetError> {
        let desc = self.socket_of(fd, SocketType::Stream)?;
        self.tcp_receive(desc, buf)
    }

    pub fn socket_sendto(&self, fd: usize, buf: &[u8], addr: &SockAddress) -> Result<usize, NetError> {
        let desc = self.socket_of(fd, SocketType::Dgram)?;
        let SockAddress::Inet(foreign) = *addr;
        self.udp_sendto(desc, buf, foreign)
    }

    pub fn socket_recvfrom(&self, fd: usize, buf: &mut [u8]) -> Result<(usize, SockAddress), NetError> {
        let desc = self.socket_of(fd, SocketType::Dgram)?;
        let (len, foreign) = self.udp_recvfrom(desc, buf)?;
        Ok((len, SockAddress::Inet(foreign)))
    }

    /// `ioctl(2)` interface requests (`SIOC*`).  The interface is named by
    /// `req.name`, except for `SIOCGIFNAME` which looks it up by index.
    pub fn socket_ioctl(&self, fd: usize, request: u32, req: &mut IfReq) -> Result<(), NetError> {
        self.sockets.lock().get(fd)?;
        let mut core = self.core.lock();
        if request == SIOCGIFNAME {
            let index = usize::try_from(req.ifindex()).map_err(|_| NetError::NotFound)?;
            let dev = core.devices.get(DevIndex(index)).ok_or(NetError::NotFound)?;
            req.set_name(&dev.info.name);
            return Ok(());
        }
        let dev = lookup_device(&core, req)?;
        match request {
            SIOCGIFINDEX => req.set_ifindex(dev.0 as i32),
            SIOCSIFNAME => {
                let name = core::str::from_utf8(req.newname_bytes()).unwrap_or("?");
                klog_debug!("socket: rename to {} ignored, dev={}", name, dev.0);
            }
            SIOCSIFHWADDR | SIOCSIFBRDADDR | SIOCSIFMTU => {
                klog_debug!("socket: ignored ioctl, request=0x{:04x}", request);
            }
            SIOCGIFHWADDR => {
                let info = &core.devices.get(dev).ok_or(NetError::NotFound)?.info;
                let family = match info.kind {
                    DeviceType::Loopback => ARPHRD_LOOPBACK,
                    _ => ARPHRD_ETHER,
                };
                let mut data = [0u8; 14];
                let alen = (info.alen as usize).min(data.len());
                data[..alen].copy_from_slice(&info.addr[..alen]);
                req.set_sockaddr(&SockAddrAny { family, data });
            }
            SIOCGIFFLAGS => {
                let flags = core.devices.get(dev).ok_or(NetError::NotFound)?.info.flags;
                req.set_flags(flags.bits() as i16);
            }
            SIOCSIFFLAGS => {
                let up = core
                    .devices
                    .get(dev)
                    .ok_or(NetError::NotFound)?
                    .info
                    .is_up();
                let want = DeviceFlags::from_bits_truncate(req.flags() as u16)
                    .contains(DeviceFlags::UP);
                if want && !up {
                    core.devices.open(dev)?;
                } else if !want && up {
                    core.devices.close(dev)?;
                }
            }
            SIOCGIFADDR | SIOCGIFNETMASK | SIOCGIFBRDADDR => {
                let iface = core
                    .devices
                    .iface(dev, IfaceFamily::Ipv4)
                    .and_then(|id| core.ifaces.get(id))
                    .ok_or(NetError::AddressNotAvailable)?;
                let addr = match request {
                    SIOCGIFADDR => iface.unicast,
                    SIOCGIFNETMASK => iface.netmask,
                    _ => iface.broadcast,
                };
                req.set_sockaddr(&inet_any(addr));
            }
            SIOCSIFADDR | SIOCSIFNETMASK => {
                let SockAddress::Inet(addr) = SockAddress::from_user(&req.sockaddr())?;
                set_iface_addr(&mut core, dev, request, addr.ip)?;
            }
            SIOCGIFMTU => {
                let mtu = core.devices.get(dev).ok_or(NetError::NotFound)?.info.mtu;
                req.set_mtu(mtu as i32);
            }
            _ => {
                klog_debug!("socket: unsupported ioctl, request=0x{:04x}", request);
                return Err(NetError::InvalidArgument);
            }
        }
        Ok(())
    }
}

fn lookup_device(core: &StackCore, req: &IfReq) -> Result<DevIndex, NetError> {
    let name = req.name_str().ok_or(NetError::NotFound)?;
    core.devices
        .by_name(name)
        .map(|d| d.info.dev_index())
        .ok_or_else(|| {
            klog_debug!("socket: interface not found, name={}", name);
            NetError::NotFound
        })
}

fn inet_any(ip: Ipv4Addr) -> SockAddrAny {
    SockAddr::new(ip, Port::ANY).to_user().to_any()
}

/// `SIOCSIFADDR` / `SIOCSIFNETMASK`.  Setting an address on a device without
/// an interface creates one with a host netmask.
fn set_iface_addr(
    core: &mut StackCore,
    dev: DevIndex,
    request: u32,
    value: Ipv4Addr,
) -> Result<(), NetError> {
    match core.devices.iface(dev, IfaceFamily::Ipv4) {
        Some(id) => {
            let iface = *core.ifaces.get(id).ok_or(NetError::NotFound)?;
            let (unicast, netmask) = if request == SIOCSIFADDR {
                (value, iface.netmask)
            } else {
                (iface.unicast, value)
            };
            ipv4::iface_reconfigure(core, id, unicast, netmask)
        }
        None if request == SIOCSIFADDR => {
            ipv4::iface_register(core, dev, value, HOST_NETMASK).map(|_| ())
        }
        None => Err(NetError::AddressNotAvailable),
    }
}
