//! ARP (RFC 826) for IPv4 over Ethernet.
//!
//! A fixed 32-entry cache maps protocol addresses to hardware addresses.
//! Entries are `Incomplete` while a request is outstanding, `Resolved` once
//! learned, and `Static` when configured by hand (never aged, never evicted,
//! never overwritten by traffic).
//!
//! A resolve that misses sends a broadcast request and reports
//! [`ArpResult::Incomplete`]; the caller drops the packet that triggered it.
//! Upper layers retransmit, so nothing is queued here.

use alloc::vec::Vec;
use core::fmt;

use laplus_lib::{klog_debug, klog_warn};

use crate::netdev::{DeviceType, IfaceFamily};
use crate::netstack::StackCore;
use crate::types::{DevIndex, EtherType, IfaceId, Ipv4Addr, MacAddr, NetError};

pub const ARP_CACHE_SIZE: usize = 32;
/// Ethernet/IPv4 ARP message length.
pub const ARP_MSG_SIZE: usize = 28;

const ARP_HRD_ETHER: u16 = 0x0001;
const ARP_PRO_IP: u16 = 0x0800;
const ARP_HLN_ETHER: u8 = 6;
const ARP_PLN_IP: u8 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

impl ArpOp {
    pub const fn from_u16(val: u16) -> Option<Self> {
        match val {
            1 => Some(Self::Request),
            2 => Some(Self::Reply),
            _ => None,
        }
    }
}

// =============================================================================
// Wire format
// =============================================================================

/// An Ethernet/IPv4 ARP message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpMessage {
    /// Raw opcode; unknown values are still cached from.
    pub op: u16,
    pub sha: MacAddr,
    pub spa: Ipv4Addr,
    pub tha: MacAddr,
    pub tpa: Ipv4Addr,
}

impl ArpMessage {
    pub fn new(op: ArpOp, sha: MacAddr, spa: Ipv4Addr, tha: MacAddr, tpa: Ipv4Addr) -> Self {
        Self {
            op: op as u16,
            sha,
            spa,
            tha,
            tpa,
        }
    }

    /// Parse and validate the fixed header fields.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_MSG_SIZE {
            return None;
        }
        let hrd = u16::from_be_bytes([data[0], data[1]]);
        let pro = u16::from_be_bytes([data[2], data[3]]);
        if hrd != ARP_HRD_ETHER || data[4] != ARP_HLN_ETHER {
            return None;
        }
        if pro != ARP_PRO_IP || data[5] != ARP_PLN_IP {
            return None;
        }
        Some(Self {
            op: u16::from_be_bytes([data[6], data[7]]),
            sha: MacAddr::from_slice(&data[8..14])?,
            spa: Ipv4Addr([data[14], data[15], data[16], data[17]]),
            tha: MacAddr::from_slice(&data[18..24])?,
            tpa: Ipv4Addr([data[24], data[25], data[26], data[27]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_MSG_SIZE] {
        let mut out = [0u8; ARP_MSG_SIZE];
        out[0..2].copy_from_slice(&ARP_HRD_ETHER.to_be_bytes());
        out[2..4].copy_from_slice(&ARP_PRO_IP.to_be_bytes());
        out[4] = ARP_HLN_ETHER;
        out[5] = ARP_PLN_IP;
        out[6..8].copy_from_slice(&self.op.to_be_bytes());
        out[8..14].copy_from_slice(self.sha.as_bytes());
        out[14..18].copy_from_slice(self.spa.as_bytes());
        out[18..24].copy_from_slice(self.tha.as_bytes());
        out[24..28].copy_from_slice(self.tpa.as_bytes());
        out
    }
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArpState {
    #[default]
    Free,
    Incomplete,
    Resolved,
    Static,
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ArpEntry {
    pub state: ArpState,
    pub pa: Ipv4Addr,
    pub ha: MacAddr,
    /// Last update, in stack milliseconds.
    pub timestamp_ms: u64,
}

impl fmt::Debug for ArpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} -> {}", self.state, self.pa, self.ha)
    }
}

/// Outcome of [`resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArpResult {
    Error,
    Incomplete,
    Found(MacAddr),
}

pub struct ArpCache {
    entries: [ArpEntry; ARP_CACHE_SIZE],
}

impl ArpCache {
    pub const fn new() -> Self {
        const FREE: ArpEntry = ArpEntry {
            state: ArpState::Free,
            pa: Ipv4Addr::UNSPECIFIED,
            ha: MacAddr::ZERO,
            timestamp_ms: 0,
        };
        Self {
            entries: [FREE; ARP_CACHE_SIZE],
        }
    }

    fn select(&self, pa: Ipv4Addr) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.state != ArpState::Free && e.pa == pa)
    }

    /// A free slot, else the oldest non-static entry.  `None` when every
    /// entry is static.
    fn alloc(&mut self) -> Option<usize> {
        if let Some(free) = self.entries.iter().position(|e| e.state == ArpState::Free) {
            return Some(free);
        }
        let oldest = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state != ArpState::Static)
            .min_by_key(|(_, e)| e.timestamp_ms)
            .map(|(i, _)| i)?;
        klog_debug!("arp: evict, pa={}", self.entries[oldest].pa);
        self.entries[oldest] = ArpEntry::default();
        Some(oldest)
    }

    /// Refresh an existing entry for `pa`.  Returns `true` if one exists.
    /// Static entries count as present but keep their address.
    fn update(&mut self, pa: Ipv4Addr, ha: MacAddr, now_ms: u64) -> bool {
        let Some(idx) = self.select(pa) else {
            return false;
        };
        let entry = &mut self.entries[idx];
        if entry.state == ArpState::Static {
            return true;
        }
        entry.state = ArpState::Resolved;
        entry.ha = ha;
        entry.timestamp_ms = now_ms;
        klog_debug!("arp: update, pa={}, ha={}", pa, ha);
        true
    }

    fn insert(&mut self, pa: Ipv4Addr, ha: MacAddr, now_ms: u64) -> bool {
        let Some(idx) = self.alloc() else {
            klog_warn!("arp: cache full, pa={}", pa);
            return false;
        };
        self.entries[idx] = ArpEntry {
            state: ArpState::Resolved,
            pa,
            ha,
            timestamp_ms: now_ms,
        };
        klog_debug!("arp: insert, pa={}, ha={}", pa, ha);
        true
    }

    fn delete(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        klog_debug!("arp: delete, pa={}, ha={}", entry.pa, entry.ha);
        *entry = ArpEntry::default();
    }

    /// Cached hardware address of a resolved or static entry.
    pub fn lookup(&self, pa: Ipv4Addr) -> Option<MacAddr> {
        let entry = &self.entries[self.select(pa)?];
        match entry.state {
            ArpState::Resolved | ArpState::Static => Some(entry.ha),
            _ => None,
        }
    }

    /// Pin `pa` to `ha`.  Replaces any learned entry for `pa`.
    pub fn add_static(&mut self, pa: Ipv4Addr, ha: MacAddr) -> Result<(), NetError> {
        let idx = match self.select(pa) {
            Some(idx) => idx,
            None => self.alloc().ok_or(NetError::NoBufferSpace)?,
        };
        self.entries[idx] = ArpEntry {
            state: ArpState::Static,
            pa,
            ha,
            timestamp_ms: 0,
        };
        klog_debug!("arp: static, pa={}, ha={}", pa, ha);
        Ok(())
    }

    pub fn remove(&mut self, pa: Ipv4Addr) -> Result<(), NetError> {
        let idx = self.select(pa).ok_or(NetError::NotFound)?;
        self.delete(idx);
        Ok(())
    }

    /// Snapshot of every non-free entry.
    pub fn entries(&self) -> Vec<ArpEntry> {
        self.entries
            .iter()
            .filter(|e| e.state != ArpState::Free)
            .copied()
            .collect()
    }

    /// Evict learned and pending entries older than `timeout_ms`.
    pub fn sweep(&mut self, now_ms: u64, timeout_ms: u64) {
        for idx in 0..ARP_CACHE_SIZE {
            let entry = self.entries[idx];
            if entry.state == ArpState::Free || entry.state == ArpState::Static {
                continue;
            }
            if now_ms.saturating_sub(entry.timestamp_ms) > timeout_ms {
                self.delete(idx);
            }
        }
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Protocol
// =============================================================================

fn output(core: &StackCore, dev: DevIndex, msg: &ArpMessage, dst: &[u8]) {
    if let Err(err) = core
        .devices
        .output(dev, EtherType::Arp.as_u16(), &msg.to_bytes(), dst)
    {
        klog_debug!("arp: output failed, dev={}, err={}", dev, err);
    }
}

fn request(core: &StackCore, iface: IfaceId, tpa: Ipv4Addr) {
    let Some(ifc) = core.ifaces.get(iface) else {
        return;
    };
    let Some(device) = core.devices.get(ifc.dev) else {
        return;
    };
    let msg = ArpMessage::new(ArpOp::Request, device.info.mac(), ifc.unicast, MacAddr::ZERO, tpa);
    klog_debug!("arp: request, dev={}, tpa={}", device.info.name, tpa);
    output(core, ifc.dev, &msg, device.info.hw_broadcast());
}

fn reply(core: &StackCore, iface: IfaceId, tha: MacAddr, tpa: Ipv4Addr) {
    let Some(ifc) = core.ifaces.get(iface) else {
        return;
    };
    let Some(device) = core.devices.get(ifc.dev) else {
        return;
    };
    let msg = ArpMessage::new(ArpOp::Reply, device.info.mac(), ifc.unicast, tha, tpa);
    klog_debug!("arp: reply, dev={}, tpa={}", device.info.name, tpa);
    output(core, ifc.dev, &msg, tha.as_bytes());
}

/// Map `pa` to a hardware address on `iface`'s link.
pub fn resolve(core: &mut StackCore, iface: IfaceId, pa: Ipv4Addr) -> ArpResult {
    let Some(dev) = core.ifaces.get(iface).map(|i| i.dev) else {
        return ArpResult::Error;
    };
    let is_ether = core
        .devices
        .get(dev)
        .is_some_and(|d| d.info.kind == DeviceType::Ethernet);
    if !is_ether {
        klog_debug!("arp: unsupported hardware address type, dev={}", dev);
        return ArpResult::Error;
    }
    let now = core.now_ms();
    match core.arp.select(pa) {
        None => {
            let Some(idx) = core.arp.alloc() else {
                klog_warn!("arp: cache full, pa={}", pa);
                return ArpResult::Error;
            };
            core.arp.entries[idx] = ArpEntry {
                state: ArpState::Incomplete,
                pa,
                ha: MacAddr::ZERO,
                timestamp_ms: now,
            };
            request(core, iface, pa);
            klog_debug!("arp: cache not found, pa={}", pa);
            ArpResult::Incomplete
        }
        Some(idx) if core.arp.entries[idx].state == ArpState::Incomplete => {
            // The earlier request may have been lost.
            request(core, iface, pa);
            ArpResult::Incomplete
        }
        Some(idx) => {
            let ha = core.arp.entries[idx].ha;
            klog_debug!("arp: resolved, pa={}, ha={}", pa, ha);
            ArpResult::Found(ha)
        }
    }
}

/// ARP input handler.
pub fn input(core: &mut StackCore, data: &[u8], dev: DevIndex) {
    let Some(msg) = ArpMessage::parse(data) else {
        klog_debug!("arp: malformed message, dev={}, len={}", dev, data.len());
        return;
    };
    let now = core.now_ms();
    let merged = core.arp.update(msg.spa, msg.sha, now);

    let Some(iface) = core.devices.iface(dev, IfaceFamily::Ipv4) else {
        return;
    };
    let ours = core.ifaces.get(iface).is_some_and(|i| i.unicast == msg.tpa);
    if !ours {
        return;
    }
    if !merged {
        core.arp.insert(msg.spa, msg.sha, now);
    }
    if ArpOp::from_u16(msg.op) == Some(ArpOp::Request) {
        reply(core, iface, msg.sha, msg.spa);
    }
}

/// Periodic sweep of aged entries.
pub fn timer(core: &mut StackCore) {
    let now = core.now_ms();
    let timeout = core.config.arp_timeout_ms;
    core.arp.sweep(now, timeout);
}
