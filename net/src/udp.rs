//! UDP (RFC 768): PCB pool, datagram codec and user commands.
//!
//! Each of the 16 PCBs holds one local endpoint and a FIFO of received
//! datagrams.  `recvfrom` blocks on the PCB's wait queue until a datagram is
//! queued or the PCB is closed underneath it.
//!
//! # Concurrency
//!
//! PCB state lives in [`StackCore`]; the wait queues live in
//! [`WaitChannels`](crate::netstack::WaitChannels).  A PCB with blocked
//! callers is never freed directly: `close` marks it `Closing` and wakes
//! them, and the last one to leave frees the slot.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use laplus_lib::{IrqMutexGuard, klog_debug};

use crate::checksum::transport_checksum;
use crate::ipv4::{self, IP_PAYLOAD_SIZE_MAX};
use crate::netstack::{NetStack, StackCore};
use crate::types::{IfaceId, IpProtocol, Ipv4Addr, NetError, Port, SockAddr};

pub const UDP_PCB_COUNT: usize = 16;
pub const UDP_HDR_SIZE: usize = 8;
pub const UDP_PAYLOAD_SIZE_MAX: usize = IP_PAYLOAD_SIZE_MAX - UDP_HDR_SIZE;

// =============================================================================
// PCB pool
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UdpState {
    #[default]
    Free,
    Open,
    /// Closed while callers were blocked on it.
    Closing,
}

#[derive(Clone, Debug)]
pub struct UdpQueueEntry {
    pub foreign: SockAddr,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct UdpPcb {
    pub state: UdpState,
    pub local: SockAddr,
    queue: VecDeque<UdpQueueEntry>,
    waiters: usize,
}

impl UdpPcb {
    /// Datagrams waiting to be read.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

pub struct UdpPcbTable {
    pcbs: [UdpPcb; UDP_PCB_COUNT],
}

impl UdpPcbTable {
    pub fn new() -> Self {
        Self {
            pcbs: core::array::from_fn(|_| UdpPcb::default()),
        }
    }

    fn alloc(&mut self) -> Option<usize> {
        let id = self.pcbs.iter().position(|p| p.state == UdpState::Free)?;
        self.pcbs[id].state = UdpState::Open;
        Some(id)
    }

    /// Open PCB `id`.
    pub fn get(&self, id: usize) -> Option<&UdpPcb> {
        self.pcbs.get(id).filter(|p| p.state == UdpState::Open)
    }

    fn get_mut(&mut self, id: usize) -> Option<&mut UdpPcb> {
        self.pcbs.get_mut(id).filter(|p| p.state == UdpState::Open)
    }

    /// Open PCB bound to `(addr, port)`.  A PCB bound to `UNSPECIFIED`
    /// matches any address.
    pub fn select(&self, addr: Ipv4Addr, port: Port) -> Option<usize> {
        self.pcbs.iter().position(|p| {
            p.state == UdpState::Open
                && (p.local.ip.is_unspecified() || p.local.ip == addr)
                && p.local.port == port
        })
    }

    pub fn active_count(&self) -> usize {
        self.pcbs.iter().filter(|p| p.state != UdpState::Free).count()
    }
}

impl Default for UdpPcbTable {
    fn default() -> Self {
        Self::new()
    }
}

fn release(core: &mut StackCore, id: usize) {
    let pcb = &mut core.udp.pcbs[id];
    if pcb.waiters > 0 {
        pcb.state = UdpState::Closing;
        core.waits.udp[id].wake_all();
        return;
    }
    klog_debug!("udp: released, id={}, local={}", id, pcb.local);
    *pcb = UdpPcb::default();
}

/// Drop one waiter registration; the last waiter frees a closing PCB.
fn leave_wait(core: &mut StackCore, id: usize) {
    let pcb = &mut core.udp.pcbs[id];
    pcb.waiters = pcb.waiters.saturating_sub(1);
    if pcb.state == UdpState::Closing && pcb.waiters == 0 {
        release(core, id);
    }
}

// =============================================================================
// Input / output
// =============================================================================

/// UDP input handler.
pub fn input(core: &mut StackCore, data: &[u8], src: Ipv4Addr, dst: Ipv4Addr, _iface: IfaceId) {
    if data.len() < UDP_HDR_SIZE {
        klog_debug!("udp: too short, len={}", data.len());
        return;
    }
    let src_port = Port::from_network_bytes([data[0], data[1]]);
    let dst_port = Port::from_network_bytes([data[2], data[3]]);
    let len = u16::from_be_bytes([data[4], data[5]]) as usize;
    if data.len() != len {
        klog_debug!("udp: length error, len={}, hdr.len={}", data.len(), len);
        return;
    }
    if transport_checksum(src, dst, IpProtocol::Udp.as_u8(), data) != 0 {
        klog_debug!(
            "udp: checksum error, sum=0x{:04x}",
            u16::from_be_bytes([data[6], data[7]])
        );
        return;
    }
    klog_debug!(
        "udp: {}:{} => {}:{}, len={}",
        src,
        src_port,
        dst,
        dst_port,
        data.len()
    );
    let Some(id) = core.udp.select(dst, dst_port) else {
        // Port not in use.
        return;
    };
    core.udp.pcbs[id].queue.push_back(UdpQueueEntry {
        foreign: SockAddr::new(src, src_port),
        data: data[UDP_HDR_SIZE..].to_vec(),
    });
    core.waits.udp[id].wake_all();
}

/// Build a datagram with its pseudo-header checksum.
pub fn build_datagram(src: SockAddr, dst: SockAddr, payload: &[u8]) -> Vec<u8> {
    let total = UDP_HDR_SIZE + payload.len();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&src.port.to_network_bytes());
    buf.extend_from_slice(&dst.port.to_network_bytes());
    buf.extend_from_slice(&(total as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(payload);
    let sum = transport_checksum(src.ip, dst.ip, IpProtocol::Udp.as_u8(), &buf);
    buf[6..8].copy_from_slice(&sum.to_be_bytes());
    buf
}

/// Send one datagram.  Returns the payload length.
pub fn output(
    core: &mut StackCore,
    src: SockAddr,
    dst: SockAddr,
    payload: &[u8],
) -> Result<usize, NetError> {
    if payload.len() > UDP_PAYLOAD_SIZE_MAX {
        klog_debug!("udp: too long, len={}", payload.len());
        return Err(NetError::MessageTooLong);
    }
    let datagram = build_datagram(src, dst, payload);
    klog_debug!("udp: {} => {}, len={}", src, dst, datagram.len());
    ipv4::output(core, IpProtocol::Udp.as_u8(), &datagram, src.ip, dst.ip)?;
    Ok(payload.len())
}

// =============================================================================
// User commands
// =============================================================================

impl NetStack {
    /// Sleep on UDP PCB `id` until its queue is woken.  The core lock is
    /// released while asleep and held again on return.
    fn sleep_udp<'a>(
        &'a self,
        mut core: IrqMutexGuard<'a, StackCore>,
        id: usize,
    ) -> Result<IrqMutexGuard<'a, StackCore>, NetError> {
        let wq = &self.waits.udp[id];
        let seen = wq.generation();
        core.udp.pcbs[id].waiters += 1;
        drop(core);
        let woke = wq.wait_generation(seen);
        let mut core = self.core.lock();
        leave_wait(&mut core, id);
        if woke { Ok(core) } else { Err(NetError::WouldBlock) }
    }

    pub fn udp_open(&self) -> Result<usize, NetError> {
        let mut core = self.core.lock();
        core.udp.alloc().ok_or_else(|| {
            klog_debug!("udp: no free pcb");
            NetError::NoBufferSpace
        })
    }

    pub fn udp_close(&self, id: usize) -> Result<(), NetError> {
        let mut core = self.core.lock();
        if core.udp.get(id).is_none() {
            return Err(NetError::BadDescriptor);
        }
        release(&mut core, id);
        Ok(())
    }

    pub fn udp_bind(&self, id: usize, local: SockAddr) -> Result<(), NetError> {
        let mut core = self.core.lock();
        if core.udp.get(id).is_none() {
            return Err(NetError::BadDescriptor);
        }
        if let Some(exist) = core.udp.select(local.ip, local.port) {
            klog_debug!(
                "udp: already in use, id={}, want={}, exist={}",
                id,
                local,
                core.udp.pcbs[exist].local
            );
            return Err(NetError::AddressInUse);
        }
        if let Some(pcb) = core.udp.get_mut(id) {
            pcb.local = local;
        }
        klog_debug!("udp: bound, id={}, local={}", id, local);
        Ok(())
    }

    /// Local endpoint of PCB `id`.
    pub fn udp_local(&self, id: usize) -> Result<SockAddr, NetError> {
        let core = self.core.lock();
        core.udp.get(id).map(|p| p.local).ok_or(NetError::BadDescriptor)
    }

    /// Send `data` to `foreign`, picking a source address from the route and
    /// an ephemeral port when the PCB has none.
    pub fn udp_sendto(&self, id: usize, data: &[u8], foreign: SockAddr) -> Result<usize, NetError> {
        let mut core = self.core.lock();
        let bound = core.udp.get(id).ok_or(NetError::BadDescriptor)?.local;
        let mut local = bound;
        if local.ip.is_unspecified() {
            let iface = core.routes.get_iface(foreign.ip).ok_or_else(|| {
                klog_debug!("udp: no iface can reach foreign address, addr={}", foreign.ip);
                NetError::NetworkUnreachable
            })?;
            local.ip = core
                .ifaces
                .get(iface)
                .map(|i| i.unicast)
                .ok_or(NetError::NetworkUnreachable)?;
        }
        if local.port.is_any() {
            let (min, max) = (core.config.ephemeral_port_min, core.config.ephemeral_port_max);
            let port = (min..=max)
                .map(Port)
                .find(|p| core.udp.select(local.ip, *p).is_none())
                .ok_or_else(|| {
                    klog_debug!("udp: no ephemeral port, addr={}", local.ip);
                    NetError::AddressInUse
                })?;
            if let Some(pcb) = core.udp.get_mut(id) {
                pcb.local.port = port;
            }
            local.port = port;
            klog_debug!("udp: assigned local port, id={}, port={}", id, port);
        }
        output(&mut core, local, foreign, data)
    }

    /// Receive one datagram into `buf` (truncated to fit).  Blocks while the
    /// queue is empty.
    pub fn udp_recvfrom(&self, id: usize, buf: &mut [u8]) -> Result<(usize, SockAddr), NetError> {
        let mut core = self.core.lock();
        if core.udp.get(id).is_none() {
            return Err(NetError::BadDescriptor);
        }
        loop {
            if core.udp.pcbs[id].state != UdpState::Open {
                // Closed while we slept.
                return Err(NetError::BadDescriptor);
            }
            if let Some(entry) = core.udp.pcbs[id].queue.pop_front() {
                let len = buf.len().min(entry.data.len());
                buf[..len].copy_from_slice(&entry.data[..len]);
                return Ok((len, entry.foreign));
            }
            core = self.sleep_udp(core, id)?;
        }
    }
}
