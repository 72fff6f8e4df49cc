//! Blocking TCP user commands.
//!
//! Every command runs under the core lock and sleeps on the PCB's wait queue
//! when it has to wait for the peer: the lock is dropped for the sleep and
//! re-taken afterwards, so the state is re-checked after every wake.
//!
//! Two families of commands exist.  [`NetStack::tcp_open_rfc793`] is the
//! RFC 793 OPEN call: a passive open turns the PCB itself into the
//! connection.  The socket commands ([`NetStack::tcp_open`],
//! [`NetStack::tcp_listen`], [`NetStack::tcp_accept`], ...) keep the
//! listener in LISTEN and hand out one child PCB per connection.

use laplus_lib::{IrqMutexGuard, klog_debug, klog_warn};

use crate::netstack::{NetStack, StackCore};
use crate::tcp::{self, TCP_RCV_BUF_SIZE, TcpFlags, TcpMode, TcpState};
use crate::types::{NetError, SockAddr};

/// IPv4 and TCP headers, both without options.
const TCP_IP_HDR_SIZE: usize = 40;

type CoreGuard<'a> = IrqMutexGuard<'a, StackCore>;

/// Fail with `ConnectionReset` if PCB `id` was torn down while we slept.
fn check_alive(core: &StackCore, id: usize) -> Result<(), NetError> {
    let pcb = core.tcp.pcb(id);
    if pcb.state == TcpState::Free || pcb.release_pending {
        return Err(NetError::ConnectionReset);
    }
    Ok(())
}

/// PCB `id` must exist and have been opened with [`NetStack::tcp_open`].
fn check_socket_mode(core: &StackCore, id: usize) -> Result<(), NetError> {
    let pcb = core.tcp.get(id).ok_or_else(|| {
        klog_debug!("tcp: pcb not found, id={}", id);
        NetError::BadDescriptor
    })?;
    if pcb.mode != TcpMode::Socket {
        klog_debug!("tcp: not opened in socket mode, id={}", id);
        return Err(NetError::InvalidArgument);
    }
    Ok(())
}

/// Send the initial SYN of an active open and enter SYN_SENT.
fn send_syn(core: &mut StackCore, id: usize) -> Result<(), NetError> {
    let iss = core.alloc_iss();
    let pcb = core.tcp.pcb_mut(id);
    pcb.rcv.wnd = TCP_RCV_BUF_SIZE as u16;
    pcb.iss = iss;
    if let Err(err) = tcp::output(core, id, TcpFlags::syn(), &[]) {
        klog_debug!("tcp: syn output failed, err={}", err);
        core.tcp.pcb_mut(id).state = TcpState::Closed;
        tcp::release(core, id);
        return Err(err);
    }
    let pcb = core.tcp.pcb_mut(id);
    pcb.snd.una = iss;
    pcb.snd.nxt = iss.wrapping_add(1);
    pcb.state = TcpState::SynSent;
    Ok(())
}

/// Abandon an open that did not reach ESTABLISHED.
fn abort_open(core: &mut StackCore, id: usize) {
    let pcb = core.tcp.pcb_mut(id);
    if pcb.state != TcpState::Free && !pcb.release_pending {
        pcb.state = TcpState::Closed;
        tcp::release(core, id);
    }
}

impl NetStack {
    /// Sleep until PCB `id`'s wait queue is woken.  Returns the re-taken lock
    /// and whether the wait actually happened.
    fn sleep_tcp<'a>(&'a self, mut core: CoreGuard<'a>, id: usize) -> (CoreGuard<'a>, bool) {
        let wq = &self.waits.tcp[id];
        let seen = wq.generation();
        core.tcp.pcb_mut(id).waiters += 1;
        drop(core);
        let woke = wq.wait_generation(seen);
        let mut core = self.core.lock();
        tcp::leave_wait(&mut core, id);
        (core, woke)
    }

    /// Wait for an opening PCB to leave its current state, passing through
    /// SYN_RECEIVED, until it is ESTABLISHED.  Any other outcome releases it.
    fn await_established<'a>(&'a self, mut core: CoreGuard<'a>, id: usize) -> Result<(), NetError> {
        loop {
            let state = core.tcp.pcb(id).state;
            while core.tcp.pcb(id).state == state && !core.tcp.pcb(id).release_pending {
                let (guard, woke) = self.sleep_tcp(core, id);
                core = guard;
                if !woke {
                    abort_open(&mut core, id);
                    return Err(NetError::WouldBlock);
                }
            }
            let pcb = core.tcp.pcb(id);
            match pcb.state {
                TcpState::Established if !pcb.release_pending => {
                    klog_debug!(
                        "tcp: connection established, local={}, foreign={}",
                        pcb.local,
                        pcb.foreign
                    );
                    return Ok(());
                }
                TcpState::SynReceived if !pcb.release_pending => continue,
                other => {
                    klog_debug!("tcp: open error, state={}", other);
                    abort_open(&mut core, id);
                    return Err(NetError::ConnectionReset);
                }
            }
        }
    }

    // =========================================================================
    // RFC 793 commands
    // =========================================================================

    /// OPEN (RFC 793 §3.8).  Blocks until the connection is established.
    ///
    /// A passive open listens on `local`, optionally only for `foreign`.  An
    /// active open needs `foreign`.
    pub fn tcp_open_rfc793(
        &self,
        local: SockAddr,
        foreign: Option<SockAddr>,
        active: bool,
    ) -> Result<usize, NetError> {
        let mut core = self.core.lock();
        let id = core.tcp.alloc(TcpMode::Rfc793).ok_or_else(|| {
            klog_warn!("tcp: no free pcb");
            NetError::NoBufferSpace
        })?;
        if !active {
            klog_debug!("tcp: passive open, local={}, waiting for connection...", local);
            let pcb = core.tcp.pcb_mut(id);
            pcb.local = local;
            if let Some(foreign) = foreign {
                pcb.foreign = foreign;
            }
            pcb.state = TcpState::Listen;
        } else {
            let Some(foreign) = foreign else {
                tcp::release(&mut core, id);
                return Err(NetError::InvalidArgument);
            };
            klog_debug!("tcp: active open, local={}, foreign={}, connecting...", local, foreign);
            let pcb = core.tcp.pcb_mut(id);
            pcb.local = local;
            pcb.foreign = foreign;
            send_syn(&mut core, id)?;
        }
        self.await_established(core, id)?;
        Ok(id)
    }

    /// STATUS of a PCB opened with [`tcp_open_rfc793`](Self::tcp_open_rfc793).
    pub fn tcp_state(&self, id: usize) -> Result<TcpState, NetError> {
        let core = self.core.lock();
        let pcb = core.tcp.get(id).ok_or(NetError::BadDescriptor)?;
        if pcb.mode != TcpMode::Rfc793 {
            klog_debug!("tcp: not opened in rfc793 mode, id={}", id);
            return Err(NetError::InvalidArgument);
        }
        Ok(pcb.state)
    }

    // =========================================================================
    // Socket commands
    // =========================================================================

    /// Allocate a CLOSED PCB for the socket commands.
    pub fn tcp_open(&self) -> Result<usize, NetError> {
        let mut core = self.core.lock();
        core.tcp.alloc(TcpMode::Socket).ok_or_else(|| {
            klog_warn!("tcp: no free pcb");
            NetError::NoBufferSpace
        })
    }

    /// Actively connect PCB `id` to `foreign`.  An unbound PCB takes the
    /// route interface's address and the first free ephemeral port.
    pub fn tcp_connect(&self, id: usize, foreign: SockAddr) -> Result<(), NetError> {
        let mut core = self.core.lock();
        check_socket_mode(&core, id)?;
        if core.tcp.pcb(id).state != TcpState::Closed {
            return Err(NetError::InvalidArgument);
        }
        let mut local = core.tcp.pcb(id).local;
        if local.ip.is_unspecified() {
            let unicast = core
                .routes
                .get_iface(foreign.ip)
                .and_then(|iface| core.ifaces.get(iface))
                .map(|iface| iface.unicast)
                .ok_or_else(|| {
                    klog_debug!("tcp: no route to foreign address, addr={}", foreign.ip);
                    NetError::NetworkUnreachable
                })?;
            klog_debug!("tcp: select source address, addr={}", unicast);
            local.ip = unicast;
        }
        if local.port.is_any() {
            let (min, max) = (core.config.ephemeral_port_min, core.config.ephemeral_port_max);
            let candidate = (min..=max)
                .map(|port| SockAddr::new(local.ip, crate::types::Port(port)))
                .find(|addr| core.tcp.select(*addr, Some(foreign)).is_none())
                .ok_or_else(|| {
                    klog_debug!("tcp: failed to assign source port");
                    NetError::AddressInUse
                })?;
            klog_debug!("tcp: assigned source port, port={}", candidate.port);
            local = candidate;
        }
        let pcb = core.tcp.pcb_mut(id);
        pcb.local = local;
        pcb.foreign = foreign;
        send_syn(&mut core, id)?;
        self.await_established(core, id)
    }

    pub fn tcp_bind(&self, id: usize, local: SockAddr) -> Result<(), NetError> {
        let mut core = self.core.lock();
        check_socket_mode(&core, id)?;
        if let Some(exist) = core.tcp.select(local, None) {
            klog_debug!("tcp: already bound, exist={}", core.tcp.pcb(exist).local);
            return Err(NetError::AddressInUse);
        }
        if let Some(pcb) = core.tcp.get_mut(id) {
            pcb.local = local;
        }
        klog_debug!("tcp: bound, id={}, local={}", id, local);
        Ok(())
    }

    /// Put PCB `id` into LISTEN.  `backlog` is not enforced: the pool size
    /// bounds pending connections.
    pub fn tcp_listen(&self, id: usize, backlog: usize) -> Result<(), NetError> {
        let mut core = self.core.lock();
        check_socket_mode(&core, id)?;
        let pcb = core.tcp.pcb_mut(id);
        if !matches!(pcb.state, TcpState::Closed | TcpState::Listen) {
            return Err(NetError::InvalidArgument);
        }
        pcb.state = TcpState::Listen;
        klog_debug!("tcp: listening, local={}, backlog={}", pcb.local, backlog);
        Ok(())
    }

    /// Wait for an established child of listener `id`.  Returns the child's
    /// PCB id and the peer endpoint.
    pub fn tcp_accept(&self, id: usize) -> Result<(usize, SockAddr), NetError> {
        let mut core = self.core.lock();
        check_socket_mode(&core, id)?;
        if core.tcp.pcb(id).state != TcpState::Listen {
            klog_debug!("tcp: not in LISTEN state, id={}", id);
            return Err(NetError::InvalidArgument);
        }
        loop {
            check_alive(&core, id)?;
            if core.tcp.pcb(id).state != TcpState::Listen {
                return Err(NetError::ConnectionReset);
            }
            if let Some(child) = core.tcp.pcb_mut(id).backlog.pop_front() {
                let pcb = core.tcp.pcb_mut(child);
                // Accepted connections outlive their listener.
                pcb.parent = None;
                return Ok((child, pcb.foreign));
            }
            let (guard, woke) = self.sleep_tcp(core, id);
            core = guard;
            if !woke {
                return Err(NetError::WouldBlock);
            }
        }
    }

    /// SEND.  Slices `data` into segments of at most MSS bytes that fit the
    /// peer's window, blocking while the window is full.
    pub fn tcp_send(&self, id: usize, data: &[u8]) -> Result<usize, NetError> {
        let mut core = self.core.lock();
        if core.tcp.get(id).is_none() {
            return Err(NetError::BadDescriptor);
        }
        let mut sent = 0;
        'retry: loop {
            check_alive(&core, id)?;
            match core.tcp.pcb(id).state {
                TcpState::Closed => {
                    klog_debug!("tcp: connection does not exist, id={}", id);
                    return Err(NetError::BadDescriptor);
                }
                TcpState::Listen => {
                    klog_debug!("tcp: this connection is passive, id={}", id);
                    return Err(NetError::NotConnected);
                }
                TcpState::SynSent | TcpState::SynReceived => {
                    klog_debug!("tcp: insufficient resources, id={}", id);
                    return Err(NetError::InsufficientResources);
                }
                TcpState::Established | TcpState::CloseWait => {}
                _ => {
                    klog_debug!("tcp: connection closing, id={}", id);
                    return Err(NetError::ConnectionClosing);
                }
            }
            let local_ip = core.tcp.pcb(id).local.ip;
            let mtu = core
                .routes
                .get_iface(local_ip)
                .and_then(|iface| core.ifaces.get(iface))
                .and_then(|iface| core.devices.get(iface.dev))
                .map(|dev| dev.info.mtu)
                .ok_or_else(|| {
                    klog_debug!("tcp: iface not found, addr={}", local_ip);
                    NetError::NetworkUnreachable
                })?;
            let mss = (mtu as usize).saturating_sub(TCP_IP_HDR_SIZE);
            let pcb = core.tcp.pcb_mut(id);
            pcb.mtu = mtu;
            pcb.mss = mss as u16;
            while sent < data.len() {
                let pcb = core.tcp.pcb(id);
                let in_flight = pcb.snd.nxt.wrapping_sub(pcb.snd.una) as usize;
                let cap = (pcb.snd.wnd as usize).saturating_sub(in_flight);
                if cap == 0 {
                    let (guard, woke) = self.sleep_tcp(core, id);
                    core = guard;
                    if !woke {
                        return if sent > 0 { Ok(sent) } else { Err(NetError::WouldBlock) };
                    }
                    continue 'retry;
                }
                let slen = mss.min(data.len() - sent).min(cap);
                let chunk = &data[sent..sent + slen];
                if let Err(err) = tcp::output(&mut core, id, TcpFlags::ack() | TcpFlags::psh(), chunk) {
                    klog_debug!("tcp: output failed, err={}", err);
                    core.tcp.pcb_mut(id).state = TcpState::Closed;
                    tcp::release(&mut core, id);
                    return Err(err);
                }
                let pcb = core.tcp.pcb_mut(id);
                pcb.snd.nxt = pcb.snd.nxt.wrapping_add(slen as u32);
                sent += slen;
            }
            return Ok(sent);
        }
    }

    /// RECEIVE.  Blocks while nothing is buffered and the peer has not
    /// closed.  Returns 0 at end of stream.
    pub fn tcp_receive(&self, id: usize, buf: &mut [u8]) -> Result<usize, NetError> {
        let mut core = self.core.lock();
        if core.tcp.get(id).is_none() {
            return Err(NetError::BadDescriptor);
        }
        loop {
            check_alive(&core, id)?;
            let pcb = core.tcp.pcb(id);
            match pcb.state {
                TcpState::Closed => {
                    klog_debug!("tcp: connection does not exist, id={}", id);
                    return Err(NetError::BadDescriptor);
                }
                TcpState::Listen | TcpState::SynSent | TcpState::SynReceived => {
                    klog_debug!("tcp: insufficient resources, id={}", id);
                    return Err(NetError::InsufficientResources);
                }
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
                    if !pcb.buf.is_empty() {
                        break;
                    }
                    let (guard, woke) = self.sleep_tcp(core, id);
                    core = guard;
                    if !woke {
                        return Err(NetError::WouldBlock);
                    }
                }
                TcpState::CloseWait if !pcb.buf.is_empty() => break,
                _ => {
                    klog_debug!("tcp: connection closing, id={}", id);
                    return Ok(0);
                }
            }
        }
        let pcb = core.tcp.pcb_mut(id);
        let len = buf.len().min(pcb.buf.len());
        buf[..len].copy_from_slice(&pcb.buf[..len]);
        pcb.buf.drain(..len);
        let reopened = pcb.rcv.wnd == 0 && len > 0;
        pcb.rcv.wnd += len as u16;
        if reopened && pcb.state == TcpState::Established {
            // Window update; the peer may be stalled on a zero window.
            if let Err(err) = tcp::output(&mut core, id, TcpFlags::ack(), &[]) {
                klog_debug!("tcp: window update failed, err={}", err);
            }
        }
        Ok(len)
    }

    /// CLOSE.  Sends FIN from a synchronized state; a PCB that never got one
    /// (or whose connection died) is released at once.
    pub fn tcp_close(&self, id: usize) -> Result<(), NetError> {
        let mut core = self.core.lock();
        let state = core.tcp.get(id).ok_or(NetError::BadDescriptor)?.state;
        let next = match state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => TcpState::Closed,
            TcpState::SynReceived | TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            _ => {
                klog_debug!("tcp: connection closing, id={}", id);
                return Err(NetError::ConnectionClosing);
            }
        };
        if next != TcpState::Closed {
            if let Err(err) = tcp::output(&mut core, id, TcpFlags::ack() | TcpFlags::fin(), &[]) {
                klog_debug!("tcp: fin output failed, err={}", err);
            }
            let pcb = core.tcp.pcb_mut(id);
            pcb.snd.nxt = pcb.snd.nxt.wrapping_add(1);
        }
        let pcb = core.tcp.pcb_mut(id);
        pcb.state = next;
        pcb.user_closed = true;
        if next == TcpState::Closed {
            tcp::release(&mut core, id);
        } else {
            tcp::wake(&core, id);
        }
        Ok(())
    }
}
