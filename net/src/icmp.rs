//! ICMP (RFC 792): echo responder and message output.
//!
//! Only Echo is acted on.  Every other type is validated, logged and ignored.

use alloc::vec::Vec;
use core::fmt;

use laplus_lib::klog_debug;

use crate::checksum::cksum16;
use crate::ipv4;
use crate::netstack::StackCore;
use crate::types::{IfaceId, IpProtocol, Ipv4Addr, NetError};

pub const ICMP_HDR_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IcmpType {
    EchoReply = 0,
    DestUnreach = 3,
    SourceQuench = 4,
    Redirect = 5,
    Echo = 8,
    TimeExceeded = 11,
    ParamProblem = 12,
    Timestamp = 13,
    TimestampReply = 14,
    InfoRequest = 15,
    InfoReply = 16,
}

impl IcmpType {
    pub const fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Self::EchoReply),
            3 => Some(Self::DestUnreach),
            4 => Some(Self::SourceQuench),
            5 => Some(Self::Redirect),
            8 => Some(Self::Echo),
            11 => Some(Self::TimeExceeded),
            12 => Some(Self::ParamProblem),
            13 => Some(Self::Timestamp),
            14 => Some(Self::TimestampReply),
            15 => Some(Self::InfoRequest),
            16 => Some(Self::InfoReply),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::EchoReply => "EchoReply",
            Self::DestUnreach => "DestinationUnreachable",
            Self::SourceQuench => "SourceQuench",
            Self::Redirect => "Redirect",
            Self::Echo => "Echo",
            Self::TimeExceeded => "TimeExceeded",
            Self::ParamProblem => "ParameterProblem",
            Self::Timestamp => "Timestamp",
            Self::TimestampReply => "TimestampReply",
            Self::InfoRequest => "InformationRequest",
            Self::InfoReply => "InformationReply",
        }
    }
}

impl fmt::Display for IcmpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn type_name(raw: u8) -> &'static str {
    IcmpType::from_u8(raw).map_or("Unknown", IcmpType::name)
}

/// Build a message: type, code, checksum, the 4-byte `values` word, payload.
pub fn build_message(icmp_type: u8, code: u8, values: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ICMP_HDR_SIZE + payload.len());
    msg.push(icmp_type);
    msg.push(code);
    msg.extend_from_slice(&[0, 0]);
    msg.extend_from_slice(&values);
    msg.extend_from_slice(payload);
    let sum = cksum16(&msg, 0);
    msg[2..4].copy_from_slice(&sum.to_be_bytes());
    msg
}

/// ICMP input handler.
pub fn input(core: &mut StackCore, data: &[u8], src: Ipv4Addr, dst: Ipv4Addr, iface: IfaceId) {
    if data.len() < ICMP_HDR_SIZE {
        klog_debug!("icmp: too short, len={}", data.len());
        return;
    }
    if cksum16(data, 0) != 0 {
        klog_debug!(
            "icmp: checksum error, sum=0x{:04x}",
            u16::from_be_bytes([data[2], data[3]])
        );
        return;
    }
    klog_debug!(
        "icmp: {} => {}, type={}, len={}",
        src,
        dst,
        type_name(data[0]),
        data.len()
    );
    if IcmpType::from_u8(data[0]) != Some(IcmpType::Echo) {
        return;
    }
    // Reply from the receiving interface even for broadcast requests.
    let Some(local) = core.ifaces.get(iface).map(|i| i.unicast) else {
        return;
    };
    let values = [data[4], data[5], data[6], data[7]];
    if let Err(err) = output(
        core,
        IcmpType::EchoReply as u8,
        data[1],
        values,
        &data[ICMP_HDR_SIZE..],
        local,
        src,
    ) {
        klog_debug!("icmp: echo reply failed, dst={}, err={}", src, err);
    }
}

/// Send one ICMP message.
pub fn output(
    core: &mut StackCore,
    icmp_type: u8,
    code: u8,
    values: [u8; 4],
    payload: &[u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<usize, NetError> {
    let msg = build_message(icmp_type, code, values, payload);
    klog_debug!(
        "icmp: {} => {}, type={}, len={}",
        src,
        dst,
        type_name(icmp_type),
        msg.len()
    );
    ipv4::output(core, IpProtocol::Icmp.as_u8(), &msg, src, dst)
}

/// Send an Echo request carrying `id`, `seq` and `payload`.
pub fn echo_request(
    core: &mut StackCore,
    id: u16,
    seq: u16,
    payload: &[u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<usize, NetError> {
    let mut values = [0u8; 4];
    values[..2].copy_from_slice(&id.to_be_bytes());
    values[2..].copy_from_slice(&seq.to_be_bytes());
    output(core, IcmpType::Echo as u8, 0, values, payload, src, dst)
}
