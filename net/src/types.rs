//! Type-safe network primitives shared by every layer of the stack.
//!
//! Newtype wrappers keep byte order and identity explicit: an [`Ipv4Addr`] is
//! always stored in network order, a [`Port`] in host order, and devices and
//! interfaces are referenced by index ([`DevIndex`], [`IfaceId`]) rather than
//! by pointer.  [`NetError`] is the single internal error type; it becomes a
//! negative errno only at the socket boundary.

use core::fmt;

use laplus_abi::errno::*;
use laplus_abi::net::{AF_INET, SockAddrIn};

// =============================================================================
// Newtype wrappers
// =============================================================================

/// IPv4 address stored in **network byte order** (`[u8; 4]`).
///
/// Conversion to/from host-order `u32` is explicit via [`from_u32_be`] /
/// [`to_u32_be`].
///
/// [`from_u32_be`]: Ipv4Addr::from_u32_be
/// [`to_u32_be`]: Ipv4Addr::to_u32_be
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// `0.0.0.0`, the unspecified address (bind to any interface).
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);
    /// `255.255.255.255`, the limited broadcast address.
    pub const BROADCAST: Self = Self([255, 255, 255, 255]);
    /// `127.0.0.1`, the loopback address.
    pub const LOCALHOST: Self = Self([127, 0, 0, 1]);

    #[inline]
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    /// Construct from a big-endian `u32`.
    #[inline]
    pub const fn from_u32_be(val: u32) -> Self {
        Self(val.to_be_bytes())
    }

    /// Return the address as a big-endian `u32`.
    #[inline]
    pub const fn to_u32_be(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// `true` if the address is `255.255.255.255`.
    #[inline]
    pub const fn is_broadcast(&self) -> bool {
        self.to_u32_be() == u32::MAX
    }

    /// `true` if the address is `0.0.0.0`.
    #[inline]
    pub const fn is_unspecified(&self) -> bool {
        self.to_u32_be() == 0
    }

    /// Bitwise AND, e.g. `addr.mask(netmask)` for the network part.
    #[inline]
    pub const fn mask(self, netmask: Ipv4Addr) -> Self {
        Self::from_u32_be(self.to_u32_be() & netmask.to_u32_be())
    }

    /// Directed broadcast of the subnet `self/netmask`.
    #[inline]
    pub const fn directed_broadcast(self, netmask: Ipv4Addr) -> Self {
        Self::from_u32_be((self.to_u32_be() & netmask.to_u32_be()) | !netmask.to_u32_be())
    }

    /// `true` if `addr` falls within the subnet defined by `network` and `mask`.
    #[inline]
    pub const fn in_subnet(addr: Ipv4Addr, network: Ipv4Addr, mask: Ipv4Addr) -> bool {
        let m = mask.to_u32_be();
        (addr.to_u32_be() & m) == (network.to_u32_be() & m)
    }

    /// Parse dotted-quad notation (`"192.0.2.1"`).
    pub fn parse(s: &str) -> Option<Self> {
        let mut out = [0u8; 4];
        let mut parts = s.split('.');
        for octet in out.iter_mut() {
            let part = parts.next()?;
            if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            *octet = part.parse().ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self(out))
    }

    /// Return the raw bytes in network byte order.
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Port number in **host byte order**.
///
/// Conversion to/from network (big-endian) byte order is explicit via
/// [`to_network_bytes`] / [`from_network_bytes`].
///
/// [`to_network_bytes`]: Port::to_network_bytes
/// [`from_network_bytes`]: Port::from_network_bytes
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port(pub u16);

impl Port {
    /// Port zero: "let the stack pick one".
    pub const ANY: Self = Self(0);

    #[inline]
    pub const fn new(val: u16) -> Self {
        Self(val)
    }

    /// Serialize to big-endian bytes for the wire.
    #[inline]
    pub const fn to_network_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Deserialize from big-endian wire bytes.
    #[inline]
    pub const fn from_network_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    #[inline]
    pub const fn is_any(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port({})", self.0)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ethernet MAC address (6 bytes).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// `ff:ff:ff:ff:ff:ff`.
    pub const BROADCAST: Self = Self([0xff; 6]);
    /// `00:00:00:00:00:00`.
    pub const ZERO: Self = Self([0; 6]);

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Build from the first six bytes of `bytes`, or `None` if it is shorter.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self(raw))
    }

    /// Parse colon-separated hex notation (`"00:00:5e:00:53:01"`).
    pub fn parse(s: &str) -> Option<Self> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts.next()?;
            if part.is_empty() || part.len() > 2 {
                return None;
            }
            *byte = u8::from_str_radix(part, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self(out))
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Device index, assigned by the registry starting at 1.
///
/// Cannot be confused with a socket descriptor, PCB id, or other `usize`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevIndex(pub usize);

impl fmt::Debug for DevIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevIndex({})", self.0)
    }
}

impl fmt::Display for DevIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a registered IPv4 interface (position in the interface table).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfaceId(pub usize);

impl fmt::Debug for IfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IfaceId({})", self.0)
    }
}

impl fmt::Display for IfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// NetError
// =============================================================================

/// Network error type.
///
/// Internal code uses `NetError` exclusively.  Conversion to errno happens at
/// the socket boundary via [`to_errno`](NetError::to_errno).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetError {
    /// Blocking is impossible here: no task runtime, or the wait queue is full.
    WouldBlock,
    /// Connection reset (RST received, retransmission deadline, or closed
    /// underneath a blocked caller).
    ConnectionReset,
    /// The connection is already being closed.
    ConnectionClosing,
    AddressInUse,
    AddressNotAvailable,
    NotConnected,
    NetworkUnreachable,
    /// Link-layer resolution failed outright.
    HostUnreachable,
    InvalidArgument,
    /// A fixed pool (PCBs, sockets, ARP cache) is exhausted.
    NoBufferSpace,
    /// The connection cannot carry the request yet (handshake in progress).
    InsufficientResources,
    ProtocolNotSupported,
    SocketTypeNotSupported,
    AddressFamilyNotSupported,
    OperationNotSupported,
    NoSuchDevice,
    /// Device is already up.
    DeviceBusy,
    /// Device is down.
    DeviceDown,
    MessageTooLong,
    /// Duplicate registration.
    AlreadyExists,
    /// Named object (interface, route, cache entry) does not exist.
    NotFound,
    /// Descriptor or PCB id does not name a live object.
    BadDescriptor,
    /// Woken without the awaited condition becoming true.
    Interrupted,
}

impl NetError {
    /// Convert to a negative errno value for the socket boundary.
    pub const fn to_errno(&self) -> i32 {
        -match self {
            Self::WouldBlock => ERRNO_EAGAIN,
            Self::ConnectionReset => ERRNO_ECONNRESET,
            Self::ConnectionClosing => ERRNO_EPIPE,
            Self::AddressInUse => ERRNO_EADDRINUSE,
            Self::AddressNotAvailable => ERRNO_EADDRNOTAVAIL,
            Self::NotConnected => ERRNO_ENOTCONN,
            Self::NetworkUnreachable => ERRNO_ENETUNREACH,
            Self::HostUnreachable => ERRNO_EHOSTUNREACH,
            Self::InvalidArgument => ERRNO_EINVAL,
            Self::NoBufferSpace => ERRNO_ENOBUFS,
            Self::InsufficientResources => ERRNO_ENOSPC,
            Self::ProtocolNotSupported => ERRNO_EPROTONOSUPPORT,
            Self::SocketTypeNotSupported => ERRNO_ESOCKTNOSUPPORT,
            Self::AddressFamilyNotSupported => ERRNO_EAFNOSUPPORT,
            Self::OperationNotSupported => ERRNO_EOPNOTSUPP,
            Self::NoSuchDevice => ERRNO_ENODEV,
            Self::DeviceBusy => ERRNO_EBUSY,
            Self::DeviceDown => ERRNO_ENETDOWN,
            Self::MessageTooLong => ERRNO_EMSGSIZE,
            Self::AlreadyExists => ERRNO_EEXIST,
            Self::NotFound => ERRNO_ENOENT,
            Self::BadDescriptor => ERRNO_EBADF,
            Self::Interrupted => ERRNO_EINTR,
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::WouldBlock => "operation would block",
            Self::ConnectionReset => "connection reset",
            Self::ConnectionClosing => "connection closing",
            Self::AddressInUse => "address already in use",
            Self::AddressNotAvailable => "address not available",
            Self::NotConnected => "not connected",
            Self::NetworkUnreachable => "network unreachable",
            Self::HostUnreachable => "host unreachable",
            Self::InvalidArgument => "invalid argument",
            Self::NoBufferSpace => "no buffer space available",
            Self::InsufficientResources => "insufficient resources",
            Self::ProtocolNotSupported => "protocol not supported",
            Self::SocketTypeNotSupported => "socket type not supported",
            Self::AddressFamilyNotSupported => "address family not supported",
            Self::OperationNotSupported => "operation not supported",
            Self::NoSuchDevice => "no such device",
            Self::DeviceBusy => "device already up",
            Self::DeviceDown => "device down",
            Self::MessageTooLong => "message too long",
            Self::AlreadyExists => "already exists",
            Self::NotFound => "not found",
            Self::BadDescriptor => "connection does not exist",
            Self::Interrupted => "interrupted",
        };
        f.write_str(msg)
    }
}

// =============================================================================
// SockAddr
// =============================================================================

/// Transport endpoint: an [`Ipv4Addr`] and a [`Port`].
///
/// This is the single conversion point between the stack's address
/// representation and the user-visible [`SockAddrIn`] layout.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SockAddr {
    pub ip: Ipv4Addr,
    pub port: Port,
}

impl SockAddr {
    /// `0.0.0.0:0`.
    pub const ANY: Self = Self::new(Ipv4Addr::UNSPECIFIED, Port::ANY);

    #[inline]
    pub const fn new(ip: Ipv4Addr, port: Port) -> Self {
        Self { ip, port }
    }

    /// Parse `"a.b.c.d:port"`.  Port zero is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, port) = s.rsplit_once(':')?;
        let ip = Ipv4Addr::parse(addr)?;
        let port: u16 = port.parse().ok()?;
        if port == 0 {
            return None;
        }
        Some(Self::new(ip, Port(port)))
    }

    /// Decode a user [`SockAddrIn`], validating `sin_family == AF_INET`.
    pub fn from_user(raw: &SockAddrIn) -> Result<Self, NetError> {
        if raw.family != AF_INET {
            return Err(NetError::AddressFamilyNotSupported);
        }
        Ok(Self {
            ip: Ipv4Addr(raw.addr),
            port: Port(u16::from_be(raw.port)),
        })
    }

    /// Encode as the user-visible [`SockAddrIn`] layout.
    pub fn to_user(&self) -> SockAddrIn {
        SockAddrIn {
            family: AF_INET,
            port: self.port.0.to_be(),
            addr: self.ip.0,
            _pad: [0; 8],
        }
    }
}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

// =============================================================================
// EtherType and IpProtocol
// =============================================================================

/// Ethernet frame type field values the stack understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EtherType {
    Ipv4 = 0x0800,
    Arp = 0x0806,
}

impl EtherType {
    /// Parse a host-order type value.  Returns `None` for unknown types.
    #[inline]
    pub const fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x0800 => Some(Self::Ipv4),
            0x0806 => Some(Self::Arp),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "IPv4"),
            Self::Arp => write!(f, "ARP"),
        }
    }
}

/// IP protocol number field values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IpProtocol {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

impl IpProtocol {
    #[inline]
    pub const fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::Icmp),
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Icmp => write!(f, "ICMP"),
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}
