// =============================================================================
// Address families and socket types
// =============================================================================

/// Unspecified address family.
pub const AF_UNSPEC: u16 = 0;
/// Local (Unix domain) sockets.  Recognised, never supported by the stack.
pub const AF_LOCAL: u16 = 1;
/// Address family: IPv4 Internet protocols.
pub const AF_INET: u16 = 2;
/// IPv6.  Recognised, never supported by the stack.
pub const AF_INET6: u16 = 10;

/// Socket type: byte-stream (TCP).
pub const SOCK_STREAM: u16 = 1;
/// Socket type: datagram (UDP).
pub const SOCK_DGRAM: u16 = 2;

/// Maximum number of socket descriptors.
pub const MAX_SOCKETS: usize = 128;

/// Interface name length, including the terminating NUL.
pub const IFNAMSIZ: usize = 16;

// =============================================================================
// Socket addresses
// =============================================================================

/// Generic socket address, the POSIX `struct sockaddr`.
///
/// Only the family tag is interpreted directly; the payload is decoded by the
/// family-specific view ([`SockAddrIn`] for `AF_INET`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SockAddrAny {
    pub family: u16,
    pub data: [u8; 14],
}

/// IPv4 socket address, mirrors POSIX `sockaddr_in` layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SockAddrIn {
    pub family: u16,
    /// Port in **network** byte order (big-endian).
    pub port: u16,
    /// IPv4 address in network byte order.
    pub addr: [u8; 4],
    pub _pad: [u8; 8],
}

impl SockAddrIn {
    /// Reinterpret a generic address as `sockaddr_in`.  The family tag is
    /// carried over unchecked.
    pub fn from_any(raw: &SockAddrAny) -> Self {
        let mut pad = [0u8; 8];
        pad.copy_from_slice(&raw.data[6..14]);
        Self {
            family: raw.family,
            port: u16::from_ne_bytes([raw.data[0], raw.data[1]]),
            addr: [raw.data[2], raw.data[3], raw.data[4], raw.data[5]],
            _pad: pad,
        }
    }

    /// Encode as the generic `sockaddr` layout.
    pub fn to_any(&self) -> SockAddrAny {
        let mut data = [0u8; 14];
        data[0..2].copy_from_slice(&self.port.to_ne_bytes());
        data[2..6].copy_from_slice(&self.addr);
        data[6..14].copy_from_slice(&self._pad);
        SockAddrAny {
            family: self.family,
            data,
        }
    }
}

// =============================================================================
// Interface request (ifreq)
// =============================================================================

/// Size of the `ifreq` union on LP64 (largest member is `struct ifmap`).
pub const IFREQ_UNION_SIZE: usize = 24;

/// Interface request, the Linux `struct ifreq`.
///
/// The anonymous union is stored as raw bytes; the typed accessors below read
/// and write the member each `SIOC*` request uses.  Integer members use native
/// byte order, exactly like the C union.
#[repr(C, align(8))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IfReq {
    pub name: [u8; IFNAMSIZ],
    pub ifru: [u8; IFREQ_UNION_SIZE],
}

impl IfReq {
    /// Build a request for the interface `name` (truncated to 15 bytes).
    pub fn with_name(name: &str) -> Self {
        let mut req = Self::default();
        req.set_name(name);
        req
    }

    /// Interface name up to the first NUL.
    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IFNAMSIZ);
        &self.name[..end]
    }

    /// Interface name as UTF-8, or `None` if it is not valid UTF-8.
    pub fn name_str(&self) -> Option<&str> {
        core::str::from_utf8(self.name_bytes()).ok()
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = encode_name(name);
    }

    /// `ifr_addr` / `ifr_netmask` / `ifr_broadaddr` / `ifr_hwaddr`.
    pub fn sockaddr(&self) -> SockAddrAny {
        let mut data = [0u8; 14];
        data.copy_from_slice(&self.ifru[2..16]);
        SockAddrAny {
            family: u16::from_ne_bytes([self.ifru[0], self.ifru[1]]),
            data,
        }
    }

    pub fn set_sockaddr(&mut self, addr: &SockAddrAny) {
        self.ifru[0..2].copy_from_slice(&addr.family.to_ne_bytes());
        self.ifru[2..16].copy_from_slice(&addr.data);
    }

    /// `ifr_flags`.
    pub fn flags(&self) -> i16 {
        i16::from_ne_bytes([self.ifru[0], self.ifru[1]])
    }

    pub fn set_flags(&mut self, flags: i16) {
        self.ifru[0..2].copy_from_slice(&flags.to_ne_bytes());
    }

    /// `ifr_ifindex`.
    pub fn ifindex(&self) -> i32 {
        self.read_i32()
    }

    pub fn set_ifindex(&mut self, index: i32) {
        self.write_i32(index);
    }

    /// `ifr_mtu`.
    pub fn mtu(&self) -> i32 {
        self.read_i32()
    }

    pub fn set_mtu(&mut self, mtu: i32) {
        self.write_i32(mtu);
    }

    /// `ifr_newname`, NUL-trimmed.
    pub fn newname_bytes(&self) -> &[u8] {
        let field = &self.ifru[..IFNAMSIZ];
        let end = field.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        &field[..end]
    }

    pub fn set_newname(&mut self, name: &str) {
        self.ifru[..IFNAMSIZ].copy_from_slice(&encode_name(name));
    }

    fn read_i32(&self) -> i32 {
        i32::from_ne_bytes([self.ifru[0], self.ifru[1], self.ifru[2], self.ifru[3]])
    }

    fn write_i32(&mut self, val: i32) {
        self.ifru[0..4].copy_from_slice(&val.to_ne_bytes());
    }
}

fn encode_name(name: &str) -> [u8; IFNAMSIZ] {
    let mut out = [0u8; IFNAMSIZ];
    let len = name.len().min(IFNAMSIZ - 1);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

// =============================================================================
// SIOC* request codes (Linux numbering)
// =============================================================================

pub const SIOCGIFNAME: u32 = 0x8910;
pub const SIOCGIFFLAGS: u32 = 0x8913;
pub const SIOCSIFFLAGS: u32 = 0x8914;
pub const SIOCGIFADDR: u32 = 0x8915;
pub const SIOCSIFADDR: u32 = 0x8916;
pub const SIOCGIFBRDADDR: u32 = 0x8919;
pub const SIOCSIFBRDADDR: u32 = 0x891a;
pub const SIOCGIFNETMASK: u32 = 0x891b;
pub const SIOCSIFNETMASK: u32 = 0x891c;
pub const SIOCGIFMTU: u32 = 0x8921;
pub const SIOCSIFMTU: u32 = 0x8922;
pub const SIOCSIFNAME: u32 = 0x8923;
pub const SIOCSIFHWADDR: u32 = 0x8924;
pub const SIOCGIFHWADDR: u32 = 0x8927;
pub const SIOCGIFINDEX: u32 = 0x8933;

// =============================================================================
// Interface flags (as reported by SIOCGIFFLAGS)
// =============================================================================

/// Device is administratively up.
pub const IFF_UP: u16 = 0x0001;
/// Loopback device.
pub const IFF_LOOPBACK: u16 = 0x0010;
/// Device supports broadcast.
pub const IFF_BROADCAST: u16 = 0x0020;
/// Point-to-point link.
pub const IFF_POINTOPOINT: u16 = 0x0040;
/// Device needs ARP to resolve link-layer addresses.
pub const IFF_NEED_ARP: u16 = 0x0100;

// =============================================================================
// Hardware address families (sa_family of ifr_hwaddr)
// =============================================================================

pub const ARPHRD_ETHER: u16 = 1;
pub const ARPHRD_LOOPBACK: u16 = 772;
