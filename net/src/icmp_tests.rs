//! ICMP tests.
//!
//! Covers:
//! - an Echo request is answered with an Echo Reply carrying the same
//!   identifier, sequence and data, sourced from the receiving interface
//! - other message types and corrupted messages produce nothing
//! - an Echo request crosses a wired pair and comes back

use crate::ethernet::ETHER_HDR_SIZE;
use crate::icmp::{self, ICMP_HDR_SIZE, IcmpType, build_message};
use crate::ipv4::{IP_HDR_SIZE_MIN, Ipv4Header};
use crate::netdev::IfaceFamily;
use crate::testutil::{IP_A, IP_B, MAC_A, MAC_B, Pair, add_ether, new_stack};
use crate::types::{IpProtocol, Ipv4Addr};

/// `(header, icmp message)` of an IPv4 frame.
fn icmp_of(frame: &[u8]) -> (Ipv4Header, Vec<u8>) {
    let hdr = Ipv4Header::parse(&frame[ETHER_HDR_SIZE..]).unwrap();
    assert_eq!(hdr.protocol, IpProtocol::Icmp.as_u8());
    let start = ETHER_HDR_SIZE + IP_HDR_SIZE_MIN;
    let end = ETHER_HDR_SIZE + hdr.total_len as usize;
    (hdr, frame[start..end].to_vec())
}

fn echo(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut values = [0u8; 4];
    values[..2].copy_from_slice(&id.to_be_bytes());
    values[2..].copy_from_slice(&seq.to_be_bytes());
    build_message(IcmpType::Echo as u8, 0, values, payload)
}

// =============================================================================
// Responder
// =============================================================================

#[test]
fn echo_request_gets_a_reply() {
    let (stack, _) = new_stack(1);
    let (dev, link) = add_ether(&stack, MAC_A, IP_A);
    let mut core = stack.lock();
    core.arp.add_static(IP_B, MAC_B).unwrap();
    let iface = core.devices.iface(dev, IfaceFamily::Ipv4).unwrap();

    icmp::input(&mut core, &echo(0x1234, 7, b"abcdefgh"), IP_B, IP_A, iface);

    let frames = link.frames();
    assert_eq!(frames.len(), 1);
    let (hdr, msg) = icmp_of(&frames[0]);
    assert_eq!(hdr.src, IP_A);
    assert_eq!(hdr.dst, IP_B);
    assert_eq!(msg[0], IcmpType::EchoReply as u8);
    assert_eq!(u16::from_be_bytes([msg[4], msg[5]]), 0x1234);
    assert_eq!(u16::from_be_bytes([msg[6], msg[7]]), 7);
    assert_eq!(&msg[ICMP_HDR_SIZE..], b"abcdefgh");
    assert_eq!(crate::checksum::cksum16(&msg, 0), 0);
}

#[test]
fn broadcast_echo_is_answered_from_the_interface_address() {
    let (stack, _) = new_stack(1);
    let (dev, link) = add_ether(&stack, MAC_A, IP_A);
    let mut core = stack.lock();
    core.arp.add_static(IP_B, MAC_B).unwrap();
    let iface = core.devices.iface(dev, IfaceFamily::Ipv4).unwrap();

    icmp::input(&mut core, &echo(1, 1, b""), IP_B, Ipv4Addr::BROADCAST, iface);

    let (hdr, _) = icmp_of(&link.frames()[0]);
    assert_eq!(hdr.src, IP_A);
}

#[test]
fn other_messages_are_ignored() {
    let (stack, _) = new_stack(1);
    let (dev, link) = add_ether(&stack, MAC_A, IP_A);
    let mut core = stack.lock();
    core.arp.add_static(IP_B, MAC_B).unwrap();
    let iface = core.devices.iface(dev, IfaceFamily::Ipv4).unwrap();

    let unreach = build_message(IcmpType::DestUnreach as u8, 3, [0; 4], &[0; 28]);
    icmp::input(&mut core, &unreach, IP_B, IP_A, iface);

    let mut corrupt = echo(1, 1, b"data");
    corrupt[8] ^= 0x01;
    icmp::input(&mut core, &corrupt, IP_B, IP_A, iface);

    icmp::input(&mut core, &echo(1, 1, b"")[..ICMP_HDR_SIZE - 1], IP_B, IP_A, iface);

    assert!(link.frames().is_empty());
}

// =============================================================================
// End to end
// =============================================================================

#[test]
fn ping_across_a_pair() {
    let pair = Pair::new();
    icmp::echo_request(&mut pair.a.lock(), 42, 1, b"ping", IP_A, IP_B).unwrap();
    pair.pump();

    let replies = pair.link_b.frames();
    assert_eq!(replies.len(), 1);
    let (hdr, msg) = icmp_of(&replies[0]);
    assert_eq!(hdr.src, IP_B);
    assert_eq!(hdr.dst, IP_A);
    assert_eq!(msg[0], IcmpType::EchoReply as u8);
    assert_eq!(u16::from_be_bytes([msg[4], msg[5]]), 42);
    assert_eq!(&msg[ICMP_HDR_SIZE..], b"ping");

    let (request, _) = icmp_of(&pair.link_a.frames()[0]);
    assert_eq!(request.id, 128);
}
