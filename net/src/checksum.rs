//! Internet checksum (RFC 1071).
//!
//! All values are computed over big-endian 16-bit words, so a checksum is
//! written to the wire with `to_be_bytes()`.  A buffer whose checksum field
//! already holds the correct value sums to zero, which is how every receive
//! path verifies.

use crate::types::Ipv4Addr;

/// Compute the one's-complement sum over a byte slice (for checksum accumulation).
fn ones_complement_sum(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    // Trailing odd byte is padded with zero.
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold a 32-bit accumulator into a 16-bit one's-complement value.
fn fold_checksum(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of `data`, continuing from the partial sum `init`.
pub fn cksum16(data: &[u8], init: u32) -> u16 {
    fold_checksum(init.wrapping_add(ones_complement_sum(data)))
}

/// Partial sum of the IPv4 pseudo-header used by TCP and UDP.
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: u16) -> u32 {
    let mut sum = ones_complement_sum(src.as_bytes());
    sum = sum.wrapping_add(ones_complement_sum(dst.as_bytes()));
    sum = sum.wrapping_add(protocol as u32);
    sum.wrapping_add(len as u32)
}

/// Checksum over pseudo-header plus `segment`.
///
/// Returns `0` for a received segment whose checksum is correct.
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let psum = pseudo_header_sum(src, dst, protocol, segment.len() as u16);
    cksum16(segment, psum)
}
