//! Ethernet II framing.
//!
//! Drivers build outgoing frames with [`transmit_helper`] and feed received
//! frames to [`receive`], which filters on the destination address and hands
//! the payload to [`NetStack::dispatch_input`].

use alloc::vec::Vec;

use laplus_lib::klog_debug;

use crate::netdev::{DeviceFlags, DeviceInfo, DeviceType};
use crate::netstack::NetStack;
use crate::types::{DevIndex, MacAddr, NetError};

pub const ETHER_ADDR_LEN: usize = 6;
pub const ETHER_HDR_SIZE: usize = 14;
pub const ETHER_FRAME_SIZE_MIN: usize = 60;
pub const ETHER_FRAME_SIZE_MAX: usize = 1514;
pub const ETHER_PAYLOAD_SIZE_MIN: usize = ETHER_FRAME_SIZE_MIN - ETHER_HDR_SIZE;
pub const ETHER_PAYLOAD_SIZE_MAX: usize = ETHER_FRAME_SIZE_MAX - ETHER_HDR_SIZE;

/// Parsed Ethernet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EtherHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ether_type: u16,
}

impl EtherHeader {
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < ETHER_HDR_SIZE {
            return None;
        }
        Some(Self {
            dst: MacAddr::from_slice(&frame[0..6])?,
            src: MacAddr::from_slice(&frame[6..12])?,
            ether_type: u16::from_be_bytes([frame[12], frame[13]]),
        })
    }
}

/// Fill in the link fields of an Ethernet device record.
pub fn ether_setup_helper(info: &mut DeviceInfo) {
    info.kind = DeviceType::Ethernet;
    info.mtu = ETHER_PAYLOAD_SIZE_MAX as u16;
    info.flags = DeviceFlags::BROADCAST | DeviceFlags::NEED_ARP;
    info.hlen = ETHER_HDR_SIZE as u16;
    info.alen = ETHER_ADDR_LEN as u16;
    info.broadcast[..ETHER_ADDR_LEN].copy_from_slice(MacAddr::BROADCAST.as_bytes());
}

/// Build a frame from `src` to `dst` and pass it to `emit`.
///
/// Payloads shorter than [`ETHER_PAYLOAD_SIZE_MIN`] are zero-padded.  `emit`
/// must report the whole frame as sent.  Returns the payload length.
pub fn transmit_helper<F>(
    src: MacAddr,
    ether_type: u16,
    payload: &[u8],
    dst: &[u8],
    emit: F,
) -> Result<usize, NetError>
where
    F: FnOnce(&[u8]) -> Result<usize, NetError>,
{
    let dst = MacAddr::from_slice(dst).ok_or(NetError::InvalidArgument)?;
    if payload.len() > ETHER_PAYLOAD_SIZE_MAX {
        return Err(NetError::MessageTooLong);
    }
    let flen = ETHER_HDR_SIZE + payload.len().max(ETHER_PAYLOAD_SIZE_MIN);
    let mut frame = Vec::with_capacity(flen);
    frame.extend_from_slice(dst.as_bytes());
    frame.extend_from_slice(src.as_bytes());
    frame.extend_from_slice(&ether_type.to_be_bytes());
    frame.extend_from_slice(payload);
    frame.resize(flen, 0);
    klog_debug!("ether: src={}, type=0x{:04x}, len={}", src, ether_type, flen);
    if emit(&frame)? != flen {
        return Err(NetError::NoBufferSpace);
    }
    Ok(payload.len())
}

/// Receive path for Ethernet drivers.
///
/// Frames addressed to neither `local` nor broadcast belong to another host
/// and are dropped.
pub fn receive(stack: &NetStack, dev: DevIndex, local: MacAddr, frame: &[u8]) {
    let Some(hdr) = EtherHeader::parse(frame) else {
        klog_debug!("ether: too short, dev={}, len={}", dev, frame.len());
        return;
    };
    if hdr.dst != local && !hdr.dst.is_broadcast() {
        return;
    }
    klog_debug!(
        "ether: dev={}, type=0x{:04x}, len={}",
        dev,
        hdr.ether_type,
        frame.len()
    );
    stack.dispatch_input(hdr.ether_type, &frame[ETHER_HDR_SIZE..], dev);
}
