//! UDP tests.
//!
//! Covers:
//! - a datagram sent on one stack is received on the other with its source
//! - bind refuses an endpoint already taken, wildcard bindings included
//! - an unbound PCB gets the first ephemeral port on its first send
//! - oversized reads are truncated to the caller's buffer
//! - a blocked recvfrom is woken by arrival, and by close
//! - the PCB pool is finite
//! - the loopback device carries datagrams back to the same stack

use std::sync::Arc;
use std::thread;

use laplus_lib::host_runtime;

use crate::loopback::init_loopback;
use crate::testutil::{IP_A, IP_B, Pair, Pump, new_stack, wait_until};
use crate::types::{Ipv4Addr, NetError, Port, SockAddr};
use crate::udp::{UDP_PAYLOAD_SIZE_MAX, UDP_PCB_COUNT};

fn bound(stack: &crate::netstack::NetStack, addr: SockAddr) -> usize {
    let id = stack.udp_open().unwrap();
    stack.udp_bind(id, addr).unwrap();
    id
}

// =============================================================================
// Send and receive
// =============================================================================

#[test]
fn datagram_crosses_the_pair() {
    let pair = Pair::new();
    let server = bound(&pair.b, SockAddr::new(IP_B, Port(7)));
    let client = bound(&pair.a, SockAddr::new(IP_A, Port(5000)));

    let sent = pair
        .a
        .udp_sendto(client, b"ping", SockAddr::new(IP_B, Port(7)))
        .unwrap();
    assert_eq!(sent, 4);
    pair.pump();
    assert_eq!(pair.b.lock().udp.get(server).unwrap().pending(), 1);

    let mut buf = [0u8; 64];
    let (len, from) = pair.b.udp_recvfrom(server, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"ping");
    assert_eq!(from, SockAddr::new(IP_A, Port(5000)));
}

#[test]
fn unbound_port_drops_datagram() {
    let pair = Pair::new();
    let client = pair.a.udp_open().unwrap();
    pair.a
        .udp_sendto(client, b"x", SockAddr::new(IP_B, Port(9)))
        .unwrap();
    pair.pump();
    assert_eq!(pair.b.lock().udp.active_count(), 0);
}

#[test]
fn oversized_read_is_truncated() {
    let pair = Pair::new();
    let server = bound(&pair.b, SockAddr::new(Ipv4Addr::UNSPECIFIED, Port(7)));
    let client = pair.a.udp_open().unwrap();
    pair.a
        .udp_sendto(client, b"0123456789", SockAddr::new(IP_B, Port(7)))
        .unwrap();
    pair.pump();

    let mut buf = [0u8; 4];
    let (len, _) = pair.b.udp_recvfrom(server, &mut buf).unwrap();
    assert_eq!(len, 4);
    assert_eq!(&buf, b"0123");
    // The rest of the datagram is gone.
    assert_eq!(pair.b.lock().udp.get(server).unwrap().pending(), 0);
}

#[test]
fn too_long_payload_is_refused() {
    let (stack, _) = new_stack(1);
    init_loopback(&stack).unwrap();
    let id = stack.udp_open().unwrap();
    let data = vec![0u8; UDP_PAYLOAD_SIZE_MAX + 1];
    assert_eq!(
        stack.udp_sendto(id, &data, SockAddr::new(Ipv4Addr::LOCALHOST, Port(7))),
        Err(NetError::MessageTooLong)
    );
}

// =============================================================================
// Binding
// =============================================================================

#[test]
fn bind_conflicts_are_refused() {
    let (stack, _) = new_stack(1);
    bound(&stack, SockAddr::new(IP_A, Port(53)));

    let id = stack.udp_open().unwrap();
    assert_eq!(
        stack.udp_bind(id, SockAddr::new(IP_A, Port(53))),
        Err(NetError::AddressInUse)
    );
    stack.udp_bind(id, SockAddr::new(IP_A, Port(54))).unwrap();

    // A wildcard owner takes the port on every address.
    bound(&stack, SockAddr::new(Ipv4Addr::UNSPECIFIED, Port(67)));
    let other = stack.udp_open().unwrap();
    assert_eq!(
        stack.udp_bind(other, SockAddr::new(IP_B, Port(67))),
        Err(NetError::AddressInUse)
    );
}

#[test]
fn first_send_assigns_ephemeral_port() {
    let pair = Pair::new();
    let id = pair.a.udp_open().unwrap();
    assert!(pair.a.udp_local(id).unwrap().port.is_any());

    pair.a
        .udp_sendto(id, b"x", SockAddr::new(IP_B, Port(7)))
        .unwrap();
    let port = pair.a.udp_local(id).unwrap().port;
    assert_eq!(port, Port(pair.a.config().ephemeral_port_min));

    // The next unbound PCB skips it.
    let next = pair.a.udp_open().unwrap();
    pair.a
        .udp_sendto(next, b"y", SockAddr::new(IP_B, Port(7)))
        .unwrap();
    assert_eq!(pair.a.udp_local(next).unwrap().port, Port(port.0 + 1));
}

#[test]
fn send_without_route_fails() {
    let (stack, _) = new_stack(1);
    let id = stack.udp_open().unwrap();
    assert_eq!(
        stack.udp_sendto(id, b"x", SockAddr::new(IP_B, Port(7))),
        Err(NetError::NetworkUnreachable)
    );
}

// =============================================================================
// Pool and descriptors
// =============================================================================

#[test]
fn pool_runs_out() {
    let (stack, _) = new_stack(1);
    let ids: Vec<usize> = (0..UDP_PCB_COUNT).map(|_| stack.udp_open().unwrap()).collect();
    assert_eq!(stack.udp_open(), Err(NetError::NoBufferSpace));

    stack.udp_close(ids[3]).unwrap();
    assert_eq!(stack.udp_open(), Ok(ids[3]));
    assert_eq!(stack.udp_close(UDP_PCB_COUNT + 1), Err(NetError::BadDescriptor));
}

#[test]
fn closed_pcb_is_a_bad_descriptor() {
    let (stack, _) = new_stack(1);
    let id = stack.udp_open().unwrap();
    stack.udp_close(id).unwrap();
    assert_eq!(stack.udp_close(id), Err(NetError::BadDescriptor));
    assert_eq!(stack.udp_local(id), Err(NetError::BadDescriptor));
    let mut buf = [0u8; 4];
    assert_eq!(stack.udp_recvfrom(id, &mut buf), Err(NetError::BadDescriptor));
}

// =============================================================================
// Blocking
// =============================================================================

#[test]
fn blocked_recvfrom_wakes_on_arrival() {
    let pair = Pair::new();
    let server = bound(&pair.b, SockAddr::new(IP_B, Port(7)));
    let _pump: Pump = pair.spawn_pump();

    let b = Arc::clone(&pair.b);
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 16];
        let (len, from) = b.udp_recvfrom(server, &mut buf).unwrap();
        (buf[..len].to_vec(), from)
    });
    wait_until(|| pair.b.waits.udp[server].waiter_count() == 1);

    let client = bound(&pair.a, SockAddr::new(IP_A, Port(5000)));
    pair.a
        .udp_sendto(client, b"late", SockAddr::new(IP_B, Port(7)))
        .unwrap();

    let (data, from) = reader.join().unwrap();
    assert_eq!(data, b"late");
    assert_eq!(from, SockAddr::new(IP_A, Port(5000)));
}

#[test]
fn close_wakes_blocked_reader() {
    host_runtime::install();
    let (stack, _) = new_stack(1);
    let id = stack.udp_open().unwrap();

    let s = Arc::clone(&stack);
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 16];
        s.udp_recvfrom(id, &mut buf)
    });
    wait_until(|| stack.waits.udp[id].waiter_count() == 1);

    stack.udp_close(id).unwrap();
    assert_eq!(reader.join().unwrap(), Err(NetError::BadDescriptor));
    // The last waiter out freed the slot.
    assert_eq!(stack.lock().udp.active_count(), 0);
}

// =============================================================================
// Loopback
// =============================================================================

#[test]
fn loopback_round_trip() {
    let (stack, _) = new_stack(1);
    init_loopback(&stack).unwrap();
    stack.run().unwrap();
    let server = bound(&stack, SockAddr::new(Ipv4Addr::LOCALHOST, Port(7)));
    let client = stack.udp_open().unwrap();

    stack
        .udp_sendto(client, b"hello", SockAddr::new(Ipv4Addr::LOCALHOST, Port(7)))
        .unwrap();
    crate::testutil::pump(&stack);

    let mut buf = [0u8; 16];
    let (len, from) = stack.udp_recvfrom(server, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"hello");
    assert_eq!(from.ip, Ipv4Addr::LOCALHOST);
    assert_eq!(from.port, stack.udp_local(client).unwrap().port);
}
