//! Ethernet framing tests.
//!
//! Covers:
//! - short payloads are zero-padded to the 60-byte minimum frame
//! - a driver that sends a partial frame is reported as a failure
//! - receive keeps frames for our address or broadcast, drops the rest
//! - frames shorter than the header are dropped

use crate::ethernet::{
    self, ETHER_FRAME_SIZE_MIN, ETHER_HDR_SIZE, ETHER_PAYLOAD_SIZE_MAX, EtherHeader,
};
use crate::testutil::{MAC_A, MAC_B, new_stack};
use crate::types::{DevIndex, EtherType, MacAddr, NetError};

// =============================================================================
// Transmit
// =============================================================================

#[test]
fn short_payload_is_padded() {
    let mut sent = Vec::new();
    let len = ethernet::transmit_helper(MAC_A, 0x0806, &[0xaa; 28], MAC_B.as_bytes(), |frame| {
        sent = frame.to_vec();
        Ok(frame.len())
    })
    .unwrap();

    assert_eq!(len, 28);
    assert_eq!(sent.len(), ETHER_FRAME_SIZE_MIN);
    let hdr = EtherHeader::parse(&sent).unwrap();
    assert_eq!(hdr.dst, MAC_B);
    assert_eq!(hdr.src, MAC_A);
    assert_eq!(hdr.ether_type, 0x0806);
    assert!(sent[ETHER_HDR_SIZE..ETHER_HDR_SIZE + 28].iter().all(|&b| b == 0xaa));
    assert!(sent[ETHER_HDR_SIZE + 28..].iter().all(|&b| b == 0));
}

#[test]
fn full_payload_is_not_padded() {
    let mut flen = 0;
    ethernet::transmit_helper(MAC_A, 0x0800, &[1; 100], MAC_B.as_bytes(), |frame| {
        flen = frame.len();
        Ok(frame.len())
    })
    .unwrap();
    assert_eq!(flen, ETHER_HDR_SIZE + 100);
}

#[test]
fn partial_send_is_an_error() {
    let res = ethernet::transmit_helper(MAC_A, 0x0800, &[1; 100], MAC_B.as_bytes(), |frame| {
        Ok(frame.len() - 1)
    });
    assert_eq!(res, Err(NetError::NoBufferSpace));
}

#[test]
fn oversized_payload_is_rejected() {
    let payload = vec![0; ETHER_PAYLOAD_SIZE_MAX + 1];
    let res = ethernet::transmit_helper(MAC_A, 0x0800, &payload, MAC_B.as_bytes(), |frame| {
        Ok(frame.len())
    });
    assert_eq!(res, Err(NetError::MessageTooLong));
}

// =============================================================================
// Receive
// =============================================================================

fn frame_to(dst: MacAddr) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(dst.as_bytes());
    frame.extend_from_slice(MAC_B.as_bytes());
    frame.extend_from_slice(&EtherType::Arp.as_u16().to_be_bytes());
    frame.resize(ETHER_FRAME_SIZE_MIN, 0);
    frame
}

#[test]
fn receive_accepts_unicast_to_us() {
    let (stack, _) = new_stack(1);
    ethernet::receive(&stack, DevIndex(1), MAC_A, &frame_to(MAC_A));
    assert!(stack.softirq_pending());
}

#[test]
fn receive_accepts_broadcast() {
    let (stack, _) = new_stack(1);
    ethernet::receive(&stack, DevIndex(1), MAC_A, &frame_to(MacAddr::BROADCAST));
    assert!(stack.softirq_pending());
}

#[test]
fn receive_drops_frames_for_other_hosts() {
    let (stack, _) = new_stack(1);
    let other = MacAddr([0x02, 0, 0, 0, 0, 0x99]);
    ethernet::receive(&stack, DevIndex(1), MAC_A, &frame_to(other));
    assert!(!stack.softirq_pending());
}

#[test]
fn receive_drops_truncated_header() {
    let (stack, _) = new_stack(1);
    let frame = frame_to(MAC_A);
    ethernet::receive(&stack, DevIndex(1), MAC_A, &frame[..ETHER_HDR_SIZE - 1]);
    assert!(!stack.softirq_pending());
}
