//! TCP (Transmission Control Protocol), RFC 793.
//!
//! Header codec, the PCB pool, the retransmission queue and the "segment
//! arrives" state machine of RFC 793 §3.9.  The blocking user commands
//! (`connect`, `accept`, `send`, ...) live in [`tcp_socket`](crate::tcp_socket).
//!
//! PCBs are addressed by pool index.  A listening PCB in socket mode spawns a
//! child per SYN; the child records its parent's index and is pushed onto the
//! parent's backlog once the handshake completes.
//!
//! Receive is in-order only: text is accepted when it starts at `RCV.NXT`
//! and is clipped to the receive window.  Anything else is acknowledged and
//! dropped, leaving recovery to the peer's retransmission.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use laplus_lib::{klog_debug, klog_info, klog_warn};

use crate::checksum::transport_checksum;
use crate::ipv4;
use crate::netstack::StackCore;
use crate::types::{IfaceId, IpProtocol, Ipv4Addr, NetError, Port, SockAddr};

// =============================================================================
// Constants
// =============================================================================

pub const TCP_PCB_COUNT: usize = 16;

/// Header length without options.
pub const TCP_HDR_SIZE: usize = 20;

/// Receive buffer per PCB; also the largest advertised window.
pub const TCP_RCV_BUF_SIZE: usize = 8192;

bitflags! {
    /// Control bits of the header's flags byte.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

impl TcpFlags {
    pub const fn fin() -> Self {
        Self::FIN
    }

    pub const fn syn() -> Self {
        Self::SYN
    }

    pub const fn rst() -> Self {
        Self::RST
    }

    pub const fn psh() -> Self {
        Self::PSH
    }

    pub const fn ack() -> Self {
        Self::ACK
    }
}

impl fmt::Display for TcpFlags {
    /// `--UAPRSF` with `-` for clear bits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = [
            (Self::URG, 'U'),
            (Self::ACK, 'A'),
            (Self::PSH, 'P'),
            (Self::RST, 'R'),
            (Self::SYN, 'S'),
            (Self::FIN, 'F'),
        ];
        f.write_str("--")?;
        for (flag, ch) in bits {
            let c = if self.contains(flag) { ch } else { '-' };
            fmt::Write::write_char(f, c)?;
        }
        Ok(())
    }
}

// =============================================================================
// Sequence number arithmetic
// =============================================================================

/// `a` is before `b` in sequence space (wrapping comparison).
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` is before or equal to `b` in sequence space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a` is after `b` in sequence space.
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `a` is after or equal to `b` in sequence space.
#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

// =============================================================================
// Header
// =============================================================================

/// Parsed TCP header, host byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: Port,
    pub dst_port: Port,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes.
    pub hlen: usize,
    pub flags: TcpFlags,
    pub wnd: u16,
    pub checksum: u16,
    pub up: u16,
}

impl TcpHeader {
    /// Parse the fixed header.  Options are skipped, never interpreted.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < TCP_HDR_SIZE {
            return None;
        }
        let hlen = ((data[12] >> 4) as usize) << 2;
        if hlen < TCP_HDR_SIZE || hlen > data.len() {
            return None;
        }
        Some(Self {
            src_port: Port::from_network_bytes([data[0], data[1]]),
            dst_port: Port::from_network_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            hlen,
            flags: TcpFlags::from_bits_truncate(data[13]),
            wnd: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            up: u16::from_be_bytes([data[18], data[19]]),
        })
    }
}

/// Build a segment with a 20-byte header and its pseudo-header checksum.
pub fn build_segment(
    local: SockAddr,
    foreign: SockAddr,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    wnd: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut seg = Vec::with_capacity(TCP_HDR_SIZE + payload.len());
    seg.extend_from_slice(&local.port.to_network_bytes());
    seg.extend_from_slice(&foreign.port.to_network_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&ack.to_be_bytes());
    seg.push(((TCP_HDR_SIZE >> 2) as u8) << 4);
    seg.push(flags.bits());
    seg.extend_from_slice(&wnd.to_be_bytes());
    seg.extend_from_slice(&[0, 0, 0, 0]);
    seg.extend_from_slice(payload);
    let sum = transport_checksum(local.ip, foreign.ip, IpProtocol::Tcp.as_u8(), &seg);
    seg[16..18].copy_from_slice(&sum.to_be_bytes());
    seg
}

// =============================================================================
// PCB
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TcpState {
    /// Slot not in use.
    #[default]
    Free,
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

impl TcpState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT1",
            Self::FinWait2 => "FIN_WAIT2",
            Self::Closing => "CLOSING",
            Self::TimeWait => "TIME_WAIT",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which user command family opened the PCB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TcpMode {
    /// `open_rfc793`: a passive open waits in place for one connection.
    Rfc793,
    /// Socket commands: a listener spawns a child per connection.
    #[default]
    Socket,
}

/// Send sequence variables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendSeq {
    pub nxt: u32,
    pub una: u32,
    pub wnd: u16,
    pub up: u16,
    pub wl1: u32,
    pub wl2: u32,
}

/// Receive sequence variables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecvSeq {
    pub nxt: u32,
    pub wnd: u16,
    pub up: u16,
}

/// One unacknowledged SYN, FIN or data segment.
#[derive(Clone, Debug)]
pub struct RetransmitEntry {
    pub first_ms: u64,
    pub last_ms: u64,
    pub rto_ms: u64,
    pub seq: u32,
    pub flags: TcpFlags,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct TcpPcb {
    pub state: TcpState,
    pub mode: TcpMode,
    pub local: SockAddr,
    pub foreign: SockAddr,
    pub snd: SendSeq,
    pub iss: u32,
    pub rcv: RecvSeq,
    pub irs: u32,
    pub mtu: u16,
    pub mss: u16,
    pub(crate) buf: Vec<u8>,
    queue: VecDeque<RetransmitEntry>,
    time_wait_deadline_ms: u64,
    pub(crate) parent: Option<usize>,
    pub(crate) backlog: VecDeque<usize>,
    pub(crate) waiters: usize,
    /// Released while callers slept on it; the last one out frees the slot.
    pub(crate) release_pending: bool,
    /// CLOSE was issued; no user command will touch the slot again.
    pub(crate) user_closed: bool,
}

impl TcpPcb {
    pub fn retransmit_queue(&self) -> impl Iterator<Item = &RetransmitEntry> {
        self.queue.iter()
    }

    /// Bytes received and not yet read.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Established children waiting for `accept`.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }
}

pub struct TcpPcbTable {
    pcbs: [TcpPcb; TCP_PCB_COUNT],
}

impl TcpPcbTable {
    pub fn new() -> Self {
        Self {
            pcbs: core::array::from_fn(|_| TcpPcb::default()),
        }
    }

    pub(crate) fn alloc(&mut self, mode: TcpMode) -> Option<usize> {
        let id = self.pcbs.iter().position(|p| p.state == TcpState::Free)?;
        let pcb = &mut self.pcbs[id];
        pcb.state = TcpState::Closed;
        pcb.mode = mode;
        Some(id)
    }

    /// PCB `id` if the slot is in use.
    pub fn get(&self, id: usize) -> Option<&TcpPcb> {
        self.pcbs.get(id).filter(|p| p.state != TcpState::Free)
    }

    pub(crate) fn get_mut(&mut self, id: usize) -> Option<&mut TcpPcb> {
        self.pcbs.get_mut(id).filter(|p| p.state != TcpState::Free)
    }

    pub(crate) fn pcb(&self, id: usize) -> &TcpPcb {
        &self.pcbs[id]
    }

    pub(crate) fn pcb_mut(&mut self, id: usize) -> &mut TcpPcb {
        &mut self.pcbs[id]
    }

    /// PCB for a segment to `local` from `foreign`.
    ///
    /// `local` matches a PCB bound to its address or to `UNSPECIFIED` on the
    /// same port.  Without `foreign` the first such PCB is returned.  With it,
    /// an exact foreign match wins over a wildcard LISTEN PCB.
    pub fn select(&self, local: SockAddr, foreign: Option<SockAddr>) -> Option<usize> {
        let mut listener = None;
        for (id, pcb) in self.pcbs.iter().enumerate() {
            if pcb.state == TcpState::Free {
                continue;
            }
            if !(pcb.local.ip.is_unspecified() || pcb.local.ip == local.ip)
                || pcb.local.port != local.port
            {
                continue;
            }
            let Some(foreign) = foreign else {
                return Some(id);
            };
            if pcb.foreign == foreign {
                return Some(id);
            }
            if pcb.state == TcpState::Listen && pcb.foreign == SockAddr::ANY {
                listener = Some(id);
            }
        }
        listener
    }

    pub fn active_count(&self) -> usize {
        self.pcbs.iter().filter(|p| p.state != TcpState::Free).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &TcpPcb)> {
        self.pcbs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state != TcpState::Free)
    }
}

impl Default for TcpPcbTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Wake every caller blocked on PCB `id`.
pub(crate) fn wake(core: &StackCore, id: usize) {
    core.waits.tcp[id].wake_all();
}

/// Free PCB `id`, its unaccepted children and its retransmission queue.
///
/// A PCB with blocked callers is only marked `Closed`; they are woken and
/// the last of them frees it through [`leave_wait`].
pub(crate) fn release(core: &mut StackCore, id: usize) {
    let pcb = &mut core.tcp.pcbs[id];
    if pcb.state == TcpState::Free {
        return;
    }
    if pcb.waiters > 0 {
        pcb.state = TcpState::Closed;
        pcb.release_pending = true;
        pcb.queue.clear();
        wake(core, id);
        return;
    }
    let parent = pcb.parent;
    let backlog = core::mem::take(&mut pcb.backlog);
    klog_debug!("tcp: released, local={}, foreign={}", pcb.local, pcb.foreign);
    *pcb = TcpPcb::default();
    if let Some(parent) = parent {
        core.tcp.pcbs[parent].backlog.retain(|&child| child != id);
    }
    for child in backlog {
        release(core, child);
    }
    // Children still in the handshake.
    for child in 0..TCP_PCB_COUNT {
        if core.tcp.pcbs[child].state != TcpState::Free && core.tcp.pcbs[child].parent == Some(id)
        {
            release(core, child);
        }
    }
}

/// Drop one waiter registration taken by a sleeping user command.
pub(crate) fn leave_wait(core: &mut StackCore, id: usize) {
    let pcb = &mut core.tcp.pcbs[id];
    pcb.waiters = pcb.waiters.saturating_sub(1);
    if pcb.release_pending && pcb.waiters == 0 {
        release(core, id);
    }
}

fn set_time_wait_timer(core: &mut StackCore, id: usize) {
    let deadline = core.now_ms() + core.config.tcp_time_wait_ms;
    core.tcp.pcbs[id].time_wait_deadline_ms = deadline;
    klog_debug!("tcp: start time_wait timer, {}ms", core.config.tcp_time_wait_ms);
}

// =============================================================================
// Output
// =============================================================================

#[allow(clippy::too_many_arguments)]
pub(crate) fn output_segment(
    core: &mut StackCore,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    wnd: u16,
    data: &[u8],
    local: SockAddr,
    foreign: SockAddr,
) -> Result<usize, NetError> {
    let seg = build_segment(local, foreign, seq, ack, flags, wnd, data);
    klog_debug!(
        "tcp: {} => {}, flags={}, seq={}, ack={}, len={} (payload={})",
        local,
        foreign,
        flags,
        seq,
        ack,
        seg.len(),
        data.len()
    );
    ipv4::output(core, IpProtocol::Tcp.as_u8(), &seg, local.ip, foreign.ip)?;
    Ok(data.len())
}

/// Send a segment on PCB `id` from `SND.NXT` (or `ISS` for a SYN).  SYN, FIN
/// and data segments are queued for retransmission.
pub(crate) fn output(
    core: &mut StackCore,
    id: usize,
    flags: TcpFlags,
    data: &[u8],
) -> Result<usize, NetError> {
    let now = core.now_ms();
    let rto_ms = core.config.tcp_rto_ms;
    let pcb = &mut core.tcp.pcbs[id];
    let seq = if flags.contains(TcpFlags::SYN) {
        pcb.iss
    } else {
        pcb.snd.nxt
    };
    if flags.intersects(TcpFlags::SYN | TcpFlags::FIN) || !data.is_empty() {
        pcb.queue.push_back(RetransmitEntry {
            first_ms: now,
            last_ms: now,
            rto_ms,
            seq,
            flags,
            data: data.to_vec(),
        });
    }
    let (ack, wnd, local, foreign) = (pcb.rcv.nxt, pcb.rcv.wnd, pcb.local, pcb.foreign);
    output_segment(core, seq, ack, flags, wnd, data, local, foreign)
}

/// Control segment where a transmit failure only matters to the peer's
/// retransmission.
fn output_quiet(core: &mut StackCore, id: usize, flags: TcpFlags) {
    if let Err(err) = output(core, id, flags, &[]) {
        klog_debug!("tcp: output failed, flags={}, err={}", flags, err);
    }
}

fn reset_segment(core: &mut StackCore, seq: u32, ack: u32, flags: TcpFlags, local: SockAddr, foreign: SockAddr) {
    if let Err(err) = output_segment(core, seq, ack, flags, 0, &[], local, foreign) {
        klog_debug!("tcp: rst output failed, err={}", err);
    }
}

/// Drop acknowledged entries from the head of the retransmission queue.
fn retransmit_queue_cleanup(pcb: &mut TcpPcb) {
    while let Some(entry) = pcb.queue.front() {
        if seq_ge(entry.seq, pcb.snd.una) {
            break;
        }
        klog_debug!(
            "tcp: remove, seq={}, flags={}, len={}",
            entry.seq,
            entry.flags,
            entry.data.len()
        );
        pcb.queue.pop_front();
    }
}

/// Resend due entries of PCB `id`; abort the connection once the oldest
/// entry passes the deadline.
fn retransmit_queue_emit(core: &mut StackCore, id: usize, now: u64) {
    let deadline = core.config.tcp_retransmit_deadline_ms;
    let mut index = 0;
    while index < core.tcp.pcbs[id].queue.len() {
        let pcb = &mut core.tcp.pcbs[id];
        let (ack, wnd, local, foreign) = (pcb.rcv.nxt, pcb.rcv.wnd, pcb.local, pcb.foreign);
        let entry = &mut pcb.queue[index];
        index += 1;
        if now.saturating_sub(entry.first_ms) >= deadline {
            klog_info!(
                "tcp: retransmission deadline exceeded, local={}, foreign={}",
                local,
                foreign
            );
            if pcb.user_closed {
                release(core, id);
                return;
            }
            pcb.state = TcpState::Closed;
            pcb.queue.clear();
            wake(core, id);
            return;
        }
        if now <= entry.last_ms + entry.rto_ms {
            continue;
        }
        entry.last_ms = now;
        entry.rto_ms *= 2;
        let (seq, flags, data) = (entry.seq, entry.flags, entry.data.clone());
        klog_debug!("tcp: retransmit, seq={}, flags={}, len={}", seq, flags, data.len());
        if let Err(err) = output_segment(core, seq, ack, flags, wnd, &data, local, foreign) {
            klog_debug!("tcp: retransmit failed, err={}", err);
        }
    }
}

/// Periodic TCP timer: TIME_WAIT expiry and retransmission.
pub fn timer(core: &mut StackCore) {
    let now = core.now_ms();
    for id in 0..TCP_PCB_COUNT {
        let pcb = &core.tcp.pcbs[id];
        if pcb.state == TcpState::Free {
            continue;
        }
        if pcb.state == TcpState::TimeWait && now > pcb.time_wait_deadline_ms {
            klog_debug!(
                "tcp: timewait has elapsed, local={}, foreign={}",
                pcb.local,
                pcb.foreign
            );
            release(core, id);
            continue;
        }
        retransmit_queue_emit(core, id, now);
    }
}

// =============================================================================
// Input
// =============================================================================

/// Segment fields used by the state machine.  `len` counts SYN and FIN.
#[derive(Clone, Copy, Debug)]
struct SegmentInfo {
    seq: u32,
    ack: u32,
    len: u32,
    wnd: u16,
}

/// RFC 793 §3.9, SEGMENT ARRIVES.
fn segment_arrives(
    core: &mut StackCore,
    seg: SegmentInfo,
    flags: TcpFlags,
    data: &[u8],
    local: SockAddr,
    foreign: SockAddr,
) {
    let id = match core.tcp.select(local, Some(foreign)) {
        Some(id) if core.tcp.pcbs[id].state != TcpState::Closed => id,
        _ => {
            if flags.contains(TcpFlags::RST) {
                return;
            }
            if !flags.contains(TcpFlags::ACK) {
                let ack = seg.seq.wrapping_add(seg.len);
                reset_segment(core, 0, ack, TcpFlags::RST | TcpFlags::ACK, local, foreign);
            } else {
                reset_segment(core, seg.ack, 0, TcpFlags::RST, local, foreign);
            }
            return;
        }
    };

    match core.tcp.pcbs[id].state {
        TcpState::Listen => {
            listen_arrives(core, id, seg, flags, local, foreign);
            return;
        }
        TcpState::SynSent => {
            syn_sent_arrives(core, id, seg, flags, local, foreign);
            return;
        }
        _ => {}
    }

    // First, check the sequence number.
    let pcb = &core.tcp.pcbs[id];
    let (state, rcv_nxt, rcv_wnd) = (pcb.state, pcb.rcv.nxt, pcb.rcv.wnd as u32);
    let in_window = |s: u32| seq_le(rcv_nxt, s) && seq_lt(s, rcv_nxt.wrapping_add(rcv_wnd));
    let acceptable = if seg.len == 0 {
        if rcv_wnd == 0 {
            seg.seq == rcv_nxt
        } else {
            in_window(seg.seq)
        }
    } else if rcv_wnd == 0 {
        false
    } else {
        in_window(seg.seq) || in_window(seg.seq.wrapping_add(seg.len - 1))
    };
    if !acceptable {
        if !flags.contains(TcpFlags::RST) {
            output_quiet(core, id, TcpFlags::ACK);
        }
        return;
    }

    // Second, check the RST bit.
    if flags.contains(TcpFlags::RST) {
        if matches!(
            state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 | TcpState::CloseWait
        ) {
            klog_info!("tcp: connection reset, local={}, foreign={}", local, foreign);
        }
        core.tcp.pcbs[id].state = TcpState::Closed;
        release(core, id);
        return;
    }

    // Fourth, check the SYN bit: a SYN in the window is an error.
    if flags.contains(TcpFlags::SYN) {
        output_quiet(core, id, TcpFlags::RST);
        klog_info!("tcp: connection reset, local={}, foreign={}", local, foreign);
        core.tcp.pcbs[id].state = TcpState::Closed;
        release(core, id);
        return;
    }

    // Fifth, check the ACK field.
    if !flags.contains(TcpFlags::ACK) {
        return;
    }
    match state {
        TcpState::SynReceived => {
            let pcb = &mut core.tcp.pcbs[id];
            if !(seq_le(pcb.snd.una, seg.ack) && seq_le(seg.ack, pcb.snd.nxt)) {
                reset_segment(core, seg.ack, 0, TcpFlags::RST, local, foreign);
                return;
            }
            pcb.state = TcpState::Established;
            pcb.snd.wnd = seg.wnd;
            pcb.snd.wl1 = seg.seq;
            pcb.snd.wl2 = seg.ack;
            let parent = pcb.parent;
            wake(core, id);
            if let Some(parent) = parent {
                core.tcp.pcbs[parent].backlog.push_back(id);
                wake(core, parent);
            }
        }
        TcpState::LastAck => {
            if seg.ack == core.tcp.pcbs[id].snd.nxt {
                core.tcp.pcbs[id].state = TcpState::Closed;
                release(core, id);
            }
            return;
        }
        TcpState::TimeWait => {
            if flags.contains(TcpFlags::FIN) {
                set_time_wait_timer(core, id);
            }
        }
        _ => {}
    }
    let pcb = &mut core.tcp.pcbs[id];
    if matches!(
        pcb.state,
        TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait
            | TcpState::Closing
    ) {
        if seq_gt(seg.ack, pcb.snd.nxt) {
            // Acknowledges something not yet sent.
            output_quiet(core, id, TcpFlags::ACK);
            return;
        }
        let mut progressed = false;
        if seq_lt(pcb.snd.una, seg.ack) {
            pcb.snd.una = seg.ack;
            retransmit_queue_cleanup(pcb);
            progressed = true;
        }
        if seq_le(pcb.snd.una, seg.ack)
            && (seq_lt(pcb.snd.wl1, seg.seq)
                || (pcb.snd.wl1 == seg.seq && seq_le(pcb.snd.wl2, seg.ack)))
        {
            progressed |= pcb.snd.wnd != seg.wnd;
            pcb.snd.wnd = seg.wnd;
            pcb.snd.wl1 = seg.seq;
            pcb.snd.wl2 = seg.ack;
        }
        let acked_all = seg.ack == pcb.snd.nxt;
        match pcb.state {
            TcpState::FinWait1 if acked_all => {
                pcb.state = TcpState::FinWait2;
            }
            TcpState::Closing if acked_all => {
                pcb.state = TcpState::TimeWait;
                set_time_wait_timer(core, id);
                progressed = true;
            }
            _ => {}
        }
        if progressed {
            wake(core, id);
        }
    }

    // Seventh, process the segment text.
    let mut text_end = seg.seq.wrapping_add(data.len() as u32);
    let pcb = &mut core.tcp.pcbs[id];
    if matches!(
        pcb.state,
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
    ) && !data.is_empty()
    {
        if seg.seq == pcb.rcv.nxt {
            let len = data.len().min(pcb.rcv.wnd as usize);
            pcb.buf.extend_from_slice(&data[..len]);
            pcb.rcv.nxt = seg.seq.wrapping_add(len as u32);
            pcb.rcv.wnd -= len as u16;
            text_end = pcb.rcv.nxt;
            if len < data.len() {
                // Clipped; the FIN (if any) is beyond the window.
                text_end = text_end.wrapping_add(1);
            }
            output_quiet(core, id, TcpFlags::ACK);
            wake(core, id);
        } else {
            klog_debug!(
                "tcp: out of order, seq={}, rcv.nxt={}",
                seg.seq,
                pcb.rcv.nxt
            );
            output_quiet(core, id, TcpFlags::ACK);
            return;
        }
    }

    // Eighth, check the FIN bit.
    if !flags.contains(TcpFlags::FIN) {
        return;
    }
    let pcb = &mut core.tcp.pcbs[id];
    if text_end != pcb.rcv.nxt {
        return;
    }
    pcb.rcv.nxt = text_end.wrapping_add(1);
    output_quiet(core, id, TcpFlags::ACK);
    let pcb = &mut core.tcp.pcbs[id];
    let acked_all = seg.ack == pcb.snd.nxt;
    match pcb.state {
        TcpState::SynReceived | TcpState::Established => {
            pcb.state = TcpState::CloseWait;
        }
        TcpState::FinWait1 => {
            if acked_all {
                pcb.state = TcpState::TimeWait;
                set_time_wait_timer(core, id);
            } else {
                pcb.state = TcpState::Closing;
            }
        }
        TcpState::FinWait2 | TcpState::TimeWait => {
            pcb.state = TcpState::TimeWait;
            set_time_wait_timer(core, id);
        }
        // CLOSE_WAIT, CLOSING and LAST_ACK stay put.
        _ => {}
    }
    wake(core, id);
}

fn listen_arrives(
    core: &mut StackCore,
    id: usize,
    seg: SegmentInfo,
    flags: TcpFlags,
    local: SockAddr,
    foreign: SockAddr,
) {
    if flags.contains(TcpFlags::RST) {
        return;
    }
    if flags.contains(TcpFlags::ACK) {
        reset_segment(core, seg.ack, 0, TcpFlags::RST, local, foreign);
        return;
    }
    if !flags.contains(TcpFlags::SYN) {
        return;
    }
    let id = match core.tcp.pcbs[id].mode {
        TcpMode::Socket => {
            let Some(child) = core.tcp.alloc(TcpMode::Socket) else {
                klog_warn!("tcp: no free pcb for connection from {}", foreign);
                return;
            };
            core.tcp.pcbs[child].parent = Some(id);
            child
        }
        TcpMode::Rfc793 => id,
    };
    let iss = core.alloc_iss();
    let pcb = &mut core.tcp.pcbs[id];
    pcb.local = local;
    pcb.foreign = foreign;
    pcb.rcv.wnd = TCP_RCV_BUF_SIZE as u16;
    pcb.rcv.nxt = seg.seq.wrapping_add(1);
    pcb.irs = seg.seq;
    pcb.iss = iss;
    output_quiet(core, id, TcpFlags::SYN | TcpFlags::ACK);
    let pcb = &mut core.tcp.pcbs[id];
    pcb.snd.nxt = iss.wrapping_add(1);
    pcb.snd.una = iss;
    pcb.state = TcpState::SynReceived;
}

fn syn_sent_arrives(
    core: &mut StackCore,
    id: usize,
    seg: SegmentInfo,
    flags: TcpFlags,
    local: SockAddr,
    foreign: SockAddr,
) {
    let pcb = &core.tcp.pcbs[id];
    let mut acceptable = false;
    if flags.contains(TcpFlags::ACK) {
        if seq_le(seg.ack, pcb.iss) || seq_gt(seg.ack, pcb.snd.nxt) {
            if !flags.contains(TcpFlags::RST) {
                reset_segment(core, seg.ack, 0, TcpFlags::RST, local, foreign);
            }
            return;
        }
        acceptable = seq_le(pcb.snd.una, seg.ack) && seq_le(seg.ack, pcb.snd.nxt);
    }
    if flags.contains(TcpFlags::RST) {
        if acceptable {
            klog_info!("tcp: connection refused, local={}, foreign={}", local, foreign);
            core.tcp.pcbs[id].state = TcpState::Closed;
            release(core, id);
        }
        return;
    }
    if !flags.contains(TcpFlags::SYN) {
        return;
    }
    let pcb = &mut core.tcp.pcbs[id];
    pcb.rcv.nxt = seg.seq.wrapping_add(1);
    pcb.irs = seg.seq;
    if acceptable {
        pcb.snd.una = seg.ack;
        retransmit_queue_cleanup(pcb);
    }
    if seq_gt(pcb.snd.una, pcb.iss) {
        pcb.state = TcpState::Established;
        pcb.snd.wnd = seg.wnd;
        pcb.snd.wl1 = seg.seq;
        pcb.snd.wl2 = seg.ack;
        output_quiet(core, id, TcpFlags::ACK);
        wake(core, id);
    } else {
        // Simultaneous open.
        pcb.state = TcpState::SynReceived;
        output_quiet(core, id, TcpFlags::SYN | TcpFlags::ACK);
    }
}

/// TCP input handler.
pub fn input(core: &mut StackCore, data: &[u8], src: Ipv4Addr, dst: Ipv4Addr, iface: IfaceId) {
    if data.len() < TCP_HDR_SIZE {
        klog_debug!("tcp: too short, len={}", data.len());
        return;
    }
    if transport_checksum(src, dst, IpProtocol::Tcp.as_u8(), data) != 0 {
        klog_debug!(
            "tcp: checksum error, sum=0x{:04x}",
            u16::from_be_bytes([data[16], data[17]])
        );
        return;
    }
    let iface_broadcast = core.ifaces.get(iface).map(|i| i.broadcast);
    let is_broadcast = |a: Ipv4Addr| a.is_broadcast() || Some(a) == iface_broadcast;
    if is_broadcast(src) || is_broadcast(dst) {
        klog_debug!("tcp: only supports unicast, src={}, dst={}", src, dst);
        return;
    }
    let Some(hdr) = TcpHeader::parse(data) else {
        klog_debug!("tcp: header length error, len={}", data.len());
        return;
    };
    let payload = &data[hdr.hlen..];
    klog_debug!(
        "tcp: {}:{} => {}:{}, flags={}, len={} (payload={})",
        src,
        hdr.src_port,
        dst,
        hdr.dst_port,
        hdr.flags,
        data.len(),
        payload.len()
    );
    let mut len = payload.len() as u32;
    if hdr.flags.contains(TcpFlags::SYN) {
        len += 1;
    }
    if hdr.flags.contains(TcpFlags::FIN) {
        len += 1;
    }
    let seg = SegmentInfo {
        seq: hdr.seq,
        ack: hdr.ack,
        len,
        wnd: hdr.wnd,
    };
    segment_arrives(
        core,
        seg,
        hdr.flags,
        payload,
        SockAddr::new(dst, hdr.dst_port),
        SockAddr::new(src, hdr.src_port),
    );
}
