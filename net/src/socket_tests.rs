//! Socket layer tests.
//!
//! Covers:
//! - socket(2) argument checks and descriptor bookkeeping
//! - operations on the wrong socket type or a closed descriptor
//! - user address encoding and errno mapping
//! - stream and datagram sockets end to end across a wired pair
//! - SIOC* interface requests: lookup by name and index, flags, addresses,
//!   hardware address and MTU

use std::sync::Arc;
use std::thread;

use laplus_abi::errno::{ERRNO_EADDRINUSE, ERRNO_EAGAIN, ERRNO_EBADF, ERRNO_ECONNRESET};
use laplus_abi::net::{
    AF_INET, AF_INET6, AF_LOCAL, ARPHRD_ETHER, ARPHRD_LOOPBACK, IFF_BROADCAST, IFF_UP, IfReq, SIOCGIFADDR,
    SIOCGIFBRDADDR, SIOCGIFFLAGS, SIOCGIFHWADDR, SIOCGIFINDEX, SIOCGIFMTU, SIOCGIFNAME,
    SIOCGIFNETMASK, SIOCSIFADDR, SIOCSIFFLAGS, SIOCSIFMTU, SIOCSIFNAME, SIOCSIFNETMASK, SOCK_DGRAM,
    SOCK_STREAM, SockAddrAny,
};

use crate::loopback::Loopback;
use crate::netstack::NetStack;
use crate::socket::{SockAddress, SocketType};
use crate::testutil::{IP_A, IP_B, MAC_A, NETMASK, Pair, add_ether, new_stack};
use crate::types::{DevIndex, Ipv4Addr, NetError, Port, SockAddr};

fn inet(ip: Ipv4Addr, port: u16) -> SockAddress {
    SockAddress::Inet(SockAddr::new(ip, Port(port)))
}

/// Stack with one Ethernet device (`net1`) and a datagram socket to issue
/// interface requests on.
fn ioctl_host() -> (Arc<NetStack>, DevIndex, usize) {
    let (stack, _) = new_stack(1);
    let (dev, _link) = add_ether(&stack, MAC_A, IP_A);
    let fd = stack.socket_open(AF_INET, SOCK_DGRAM, 0).unwrap();
    (stack, dev, fd)
}

fn get_addr(stack: &NetStack, fd: usize, name: &str, request: u32) -> Result<Ipv4Addr, NetError> {
    let mut req = IfReq::with_name(name);
    stack.socket_ioctl(fd, request, &mut req)?;
    let SockAddress::Inet(addr) = SockAddress::from_user(&req.sockaddr())?;
    Ok(addr.ip)
}

fn set_addr(stack: &NetStack, fd: usize, name: &str, request: u32, ip: Ipv4Addr) -> Result<(), NetError> {
    let mut req = IfReq::with_name(name);
    req.set_sockaddr(&inet(ip, 0).to_user());
    stack.socket_ioctl(fd, request, &mut req)
}

// =============================================================================
// Descriptors
// =============================================================================

#[test]
fn open_checks_arguments() {
    let (stack, _) = new_stack(1);
    assert_eq!(
        stack.socket_open(AF_INET6, SOCK_STREAM, 0),
        Err(NetError::AddressFamilyNotSupported)
    );
    assert_eq!(
        stack.socket_open(AF_LOCAL, SOCK_DGRAM, 0),
        Err(NetError::AddressFamilyNotSupported)
    );
    assert_eq!(
        stack.socket_open(AF_INET, 3, 0),
        Err(NetError::SocketTypeNotSupported)
    );
    assert_eq!(
        stack.socket_open(AF_INET, SOCK_DGRAM, 17),
        Err(NetError::ProtocolNotSupported)
    );
    assert_eq!(stack.socket_count(), 0);
    assert_eq!(SocketType::from_raw(SOCK_STREAM), Some(SocketType::Stream));
    assert_eq!(SocketType::from_raw(SOCK_DGRAM), Some(SocketType::Dgram));
}

#[test]
fn descriptors_are_reused_after_close() {
    let (stack, _) = new_stack(1);
    let a = stack.socket_open(AF_INET, SOCK_STREAM, 0).unwrap();
    let b = stack.socket_open(AF_INET, SOCK_DGRAM, 0).unwrap();
    assert_eq!((a, b), (0, 1));
    assert_eq!(stack.socket_count(), 2);

    stack.socket_close(a).unwrap();
    assert_eq!(stack.socket_count(), 1);
    assert_eq!(stack.lock().tcp.active_count(), 0);
    assert_eq!(stack.socket_open(AF_INET, SOCK_DGRAM, 0), Ok(a));

    assert_eq!(stack.socket_close(7), Err(NetError::BadDescriptor));
    assert_eq!(stack.socket_close(10_000), Err(NetError::BadDescriptor));
}

#[test]
fn operations_check_socket_type() {
    let (stack, _) = new_stack(1);
    let stream = stack.socket_open(AF_INET, SOCK_STREAM, 0).unwrap();
    let dgram = stack.socket_open(AF_INET, SOCK_DGRAM, 0).unwrap();
    let mut buf = [0u8; 4];

    assert_eq!(stack.socket_listen(dgram, 1), Err(NetError::OperationNotSupported));
    assert_eq!(stack.socket_recv(dgram, &mut buf), Err(NetError::OperationNotSupported));
    assert_eq!(
        stack.socket_sendto(stream, b"x", &inet(IP_B, 7)),
        Err(NetError::OperationNotSupported)
    );
    assert_eq!(
        stack.socket_recvfrom(stream, &mut buf),
        Err(NetError::OperationNotSupported)
    );

    stack.socket_close(stream).unwrap();
    assert_eq!(stack.socket_send(stream, b"x"), Err(NetError::BadDescriptor));
    assert_eq!(
        stack.socket_bind(stream, &inet(IP_A, 80)),
        Err(NetError::BadDescriptor)
    );
}

#[test]
fn bind_conflict_surfaces_per_type() {
    let (stack, _) = new_stack(1);
    let first = stack.socket_open(AF_INET, SOCK_DGRAM, 0).unwrap();
    let second = stack.socket_open(AF_INET, SOCK_DGRAM, 0).unwrap();
    stack.socket_bind(first, &inet(IP_A, 53)).unwrap();
    let err = stack.socket_bind(second, &inet(IP_A, 53)).unwrap_err();
    assert_eq!(err.to_errno(), -ERRNO_EADDRINUSE);

    // TCP and UDP port spaces are separate.
    let stream = stack.socket_open(AF_INET, SOCK_STREAM, 0).unwrap();
    stack.socket_bind(stream, &inet(IP_A, 53)).unwrap();
}

// =============================================================================
// Addresses and errno
// =============================================================================

#[test]
fn user_addresses_use_network_byte_order() {
    let addr = inet(IP_B, 0x1f90);
    let raw = addr.to_user();
    assert_eq!(raw.family, AF_INET);
    assert_eq!(&raw.data[..2], &[0x1f, 0x90]);
    assert_eq!(&raw.data[2..6], IP_B.as_bytes());
    assert_eq!(SockAddress::from_user(&raw), Ok(addr));
    assert_eq!(addr.to_string(), "192.0.2.2:8080");

    let v6 = SockAddrAny {
        family: AF_INET6,
        data: [0; 14],
    };
    assert_eq!(
        SockAddress::from_user(&v6),
        Err(NetError::AddressFamilyNotSupported)
    );
}

#[test]
fn errors_map_to_negative_errno() {
    assert_eq!(NetError::WouldBlock.to_errno(), -ERRNO_EAGAIN);
    assert_eq!(NetError::BadDescriptor.to_errno(), -ERRNO_EBADF);
    assert_eq!(NetError::ConnectionReset.to_errno(), -ERRNO_ECONNRESET);
}

// =============================================================================
// End to end
// =============================================================================

#[test]
fn stream_sockets_across_a_pair() {
    let pair = Pair::new();
    let listener = pair.b.socket_open(AF_INET, SOCK_STREAM, 0).unwrap();
    pair.b.socket_bind(listener, &inet(IP_B, 7)).unwrap();
    pair.b.socket_listen(listener, 1).unwrap();
    let _pump = pair.spawn_pump();

    let b = Arc::clone(&pair.b);
    let server = thread::spawn(move || {
        let (conn, peer) = b.socket_accept(listener).unwrap();
        let mut buf = [0u8; 16];
        let len = b.socket_recv(conn, &mut buf).unwrap();
        assert_eq!(b.socket_send(conn, &buf[..len]), Ok(len));
        (conn, peer)
    });

    let client = pair.a.socket_open(AF_INET, SOCK_STREAM, 0).unwrap();
    pair.a.socket_bind(client, &inet(IP_A, 5000)).unwrap();
    pair.a.socket_connect(client, &inet(IP_B, 7)).unwrap();
    assert_eq!(pair.a.socket_send(client, b"hi"), Ok(2));

    let mut buf = [0u8; 16];
    let len = pair.a.socket_recv(client, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"hi");

    let (conn, peer) = server.join().unwrap();
    assert_eq!(peer, inet(IP_A, 5000));
    assert_ne!(conn, listener);
    assert_eq!(pair.b.socket_count(), 2);
}

#[test]
fn datagram_sockets_across_a_pair() {
    let pair = Pair::new();
    let server = pair.b.socket_open(AF_INET, SOCK_DGRAM, 0).unwrap();
    pair.b.socket_bind(server, &inet(Ipv4Addr::UNSPECIFIED, 7)).unwrap();
    let client = pair.a.socket_open(AF_INET, SOCK_DGRAM, 0).unwrap();

    assert_eq!(pair.a.socket_sendto(client, b"ping", &inet(IP_B, 7)), Ok(4));
    pair.pump();

    let mut buf = [0u8; 16];
    let (len, from) = pair.b.socket_recvfrom(server, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"ping");
    assert_eq!(from, inet(IP_A, 49152));
}

// =============================================================================
// Interface requests
// =============================================================================

#[test]
fn ioctl_maps_names_and_indices() {
    let (stack, dev, fd) = ioctl_host();

    let mut req = IfReq::with_name("net1");
    stack.socket_ioctl(fd, SIOCGIFINDEX, &mut req).unwrap();
    assert_eq!(req.ifindex(), dev.0 as i32);

    let mut req = IfReq::default();
    req.set_ifindex(dev.0 as i32);
    stack.socket_ioctl(fd, SIOCGIFNAME, &mut req).unwrap();
    assert_eq!(req.name_str(), Some("net1"));

    req.set_ifindex(9);
    assert_eq!(stack.socket_ioctl(fd, SIOCGIFNAME, &mut req), Err(NetError::NotFound));
    let mut req = IfReq::with_name("eth7");
    assert_eq!(stack.socket_ioctl(fd, SIOCGIFINDEX, &mut req), Err(NetError::NotFound));
}

#[test]
fn ioctl_rejects_bad_descriptor_and_request() {
    let (stack, _, fd) = ioctl_host();
    let mut req = IfReq::with_name("net1");
    assert_eq!(stack.socket_ioctl(fd, 0x89ff, &mut req), Err(NetError::InvalidArgument));
    assert_eq!(
        stack.socket_ioctl(fd + 1, SIOCGIFINDEX, &mut req),
        Err(NetError::BadDescriptor)
    );
}

#[test]
fn ioctl_rename_is_accepted_and_ignored() {
    let (stack, dev, fd) = ioctl_host();
    let mut req = IfReq::with_name("net1");
    req.set_newname("eth9");
    assert_eq!(req.newname_bytes(), b"eth9");
    stack.socket_ioctl(fd, SIOCSIFNAME, &mut req).unwrap();
    assert_eq!(stack.lock().devices.get(dev).unwrap().info.name, "net1");
}

#[test]
fn ioctl_flags_bring_the_device_down_and_up() {
    let (stack, dev, fd) = ioctl_host();

    let mut req = IfReq::with_name("net1");
    stack.socket_ioctl(fd, SIOCGIFFLAGS, &mut req).unwrap();
    let flags = req.flags() as u16;
    assert_ne!(flags & IFF_UP, 0);
    assert_ne!(flags & IFF_BROADCAST, 0);

    req.set_flags((flags & !IFF_UP) as i16);
    stack.socket_ioctl(fd, SIOCSIFFLAGS, &mut req).unwrap();
    assert!(!stack.lock().devices.get(dev).unwrap().info.is_up());

    req.set_flags(flags as i16);
    stack.socket_ioctl(fd, SIOCSIFFLAGS, &mut req).unwrap();
    assert!(stack.lock().devices.get(dev).unwrap().info.is_up());
}

#[test]
fn ioctl_reads_and_writes_addresses() {
    let (stack, _, fd) = ioctl_host();
    assert_eq!(get_addr(&stack, fd, "net1", SIOCGIFADDR), Ok(IP_A));
    assert_eq!(get_addr(&stack, fd, "net1", SIOCGIFNETMASK), Ok(NETMASK));
    assert_eq!(
        get_addr(&stack, fd, "net1", SIOCGIFBRDADDR),
        Ok(Ipv4Addr::new(192, 0, 2, 255))
    );

    let moved = Ipv4Addr::new(198, 51, 100, 9);
    set_addr(&stack, fd, "net1", SIOCSIFADDR, moved).unwrap();
    set_addr(&stack, fd, "net1", SIOCSIFNETMASK, Ipv4Addr::new(255, 255, 0, 0)).unwrap();
    assert_eq!(get_addr(&stack, fd, "net1", SIOCGIFADDR), Ok(moved));
    assert_eq!(
        get_addr(&stack, fd, "net1", SIOCGIFBRDADDR),
        Ok(Ipv4Addr::new(198, 51, 255, 255))
    );
    // The connected route follows.
    assert!(stack.lock().routes.get_iface(Ipv4Addr::new(198, 51, 7, 7)).is_some());
    assert!(stack.lock().routes.get_iface(IP_B).is_none());

    let mut req = IfReq::with_name("net1");
    req.set_sockaddr(&SockAddrAny {
        family: AF_INET6,
        data: [0; 14],
    });
    assert_eq!(
        stack.socket_ioctl(fd, SIOCSIFADDR, &mut req),
        Err(NetError::AddressFamilyNotSupported)
    );
}

#[test]
fn ioctl_address_on_unconfigured_device_creates_host_interface() {
    let (stack, fd) = {
        let (stack, _) = new_stack(1);
        let fd = stack.socket_open(AF_INET, SOCK_DGRAM, 0).unwrap();
        (stack, fd)
    };
    stack
        .register_device(Loopback::info(), Box::new(Loopback::new(&stack)))
        .unwrap();

    assert_eq!(
        get_addr(&stack, fd, "lo", SIOCGIFADDR),
        Err(NetError::AddressNotAvailable)
    );
    assert_eq!(
        set_addr(&stack, fd, "lo", SIOCSIFNETMASK, Ipv4Addr::new(255, 0, 0, 0)),
        Err(NetError::AddressNotAvailable)
    );

    set_addr(&stack, fd, "lo", SIOCSIFADDR, Ipv4Addr::LOCALHOST).unwrap();
    assert_eq!(get_addr(&stack, fd, "lo", SIOCGIFADDR), Ok(Ipv4Addr::LOCALHOST));
    assert_eq!(
        get_addr(&stack, fd, "lo", SIOCGIFNETMASK),
        Ok(Ipv4Addr::BROADCAST)
    );

    let mut req = IfReq::with_name("lo");
    stack.socket_ioctl(fd, SIOCGIFHWADDR, &mut req).unwrap();
    assert_eq!(req.sockaddr().family, ARPHRD_LOOPBACK);
}

#[test]
fn ioctl_reports_hardware_address_and_mtu() {
    let (stack, _, fd) = ioctl_host();

    let mut req = IfReq::with_name("net1");
    stack.socket_ioctl(fd, SIOCGIFHWADDR, &mut req).unwrap();
    let hw = req.sockaddr();
    assert_eq!(hw.family, ARPHRD_ETHER);
    assert_eq!(&hw.data[..6], MAC_A.as_bytes());

    let mut req = IfReq::with_name("net1");
    stack.socket_ioctl(fd, SIOCGIFMTU, &mut req).unwrap();
    assert_eq!(req.mtu(), 1500);

    // Accepted and ignored.
    req.set_mtu(9000);
    stack.socket_ioctl(fd, SIOCSIFMTU, &mut req).unwrap();
    let mut req = IfReq::with_name("net1");
    stack.socket_ioctl(fd, SIOCGIFMTU, &mut req).unwrap();
    assert_eq!(req.mtu(), 1500);
}
