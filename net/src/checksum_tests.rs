//! Internet checksum tests.
//!
//! Covers:
//! - RFC 1071 worked example
//! - a buffer carrying its own checksum sums to zero, odd lengths included
//! - pseudo-header checksum verifies a built UDP datagram

use crate::checksum::{cksum16, transport_checksum};
use crate::types::{IpProtocol, Ipv4Addr, Port, SockAddr};
use crate::udp;

/// Deterministic filler so the property runs over varied contents.
fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

// =============================================================================
// cksum16
// =============================================================================

#[test]
fn rfc1071_example() {
    let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
    assert_eq!(cksum16(&data, 0), 0x220d);
}

#[test]
fn embedded_checksum_folds_to_zero() {
    for len in [4usize, 5, 20, 21, 63, 64, 1499] {
        for seed in [0u8, 7, 0xff] {
            let mut buf = pattern(len, seed);
            buf[2] = 0;
            buf[3] = 0;
            let sum = cksum16(&buf, 0);
            buf[2..4].copy_from_slice(&sum.to_be_bytes());
            assert_eq!(cksum16(&buf, 0), 0, "len={} seed={}", len, seed);
        }
    }
}

#[test]
fn all_zero_buffer_checksum_is_ffff() {
    assert_eq!(cksum16(&[0; 32], 0), 0xffff);
}

// =============================================================================
// Pseudo-header
// =============================================================================

#[test]
fn udp_datagram_verifies_against_pseudo_header() {
    let src = SockAddr::new(Ipv4Addr::new(192, 0, 2, 1), Port(5000));
    let dst = SockAddr::new(Ipv4Addr::new(192, 0, 2, 2), Port(7));
    let datagram = udp::build_datagram(src, dst, b"ping");
    assert_eq!(
        transport_checksum(src.ip, dst.ip, IpProtocol::Udp.as_u8(), &datagram),
        0
    );
    // The same bytes do not verify between other hosts.
    let other = Ipv4Addr::new(192, 0, 2, 3);
    assert_ne!(
        transport_checksum(src.ip, other, IpProtocol::Udp.as_u8(), &datagram),
        0
    );
}
