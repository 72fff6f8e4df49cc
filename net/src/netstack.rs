//! Stack configuration and the centralised network stack state.
//!
//! # Architecture
//!
//! [`NetStack`] is the handle every caller shares (usually as
//! `Arc<NetStack>`).  It owns:
//!
//! - [`StackCore`]: every protocol table (devices, interfaces, routes, ARP
//!   cache, TCP/UDP PCB pools, timers) behind one `IrqMutex`.
//! - the per-protocol input queues, behind their own `IrqMutex` so that the
//!   interrupt side never contends with protocol processing.
//! - the socket table, behind a third lock that is never held while the core
//!   lock is taken.
//! - [`WaitChannels`]: one wait queue per TCP and UDP PCB, outside every lock.
//!
//! # Concurrency
//!
//! Lock order is `core -> inputs` and `core -> wait queue`.  Blocking calls
//! read a wait queue's generation under the core lock, drop the lock and
//! sleep until the generation moves; protocol code wakes the queue while still
//! holding the core lock, exactly like `pthread_cond_broadcast` under the
//! mutex.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use laplus_lib::kernel_services::platform;
use laplus_lib::{IrqMutex, IrqMutexGuard, WaitQueue, klog_info};

use crate::arp::{self, ArpCache};
use crate::dispatch::{InputQueue, TimerEntry};
use crate::icmp;
use crate::ipv4::{self, IfaceTable};
use crate::netdev::{DeviceInfo, DeviceRegistry, NetDevice};
use crate::route::RouteTable;
use crate::socket::SocketTable;
use crate::softirq::SoftIrq;
use crate::tcp::{self, TCP_PCB_COUNT, TcpPcbTable};
use crate::types::{DevIndex, EtherType, IfaceId, IpProtocol, Ipv4Addr, NetError};
use crate::udp::{self, UDP_PCB_COUNT, UdpPcbTable};

// =============================================================================
// Configuration
// =============================================================================

/// Stack tunables.  `NetConfig::new()` gives the standard values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetConfig {
    /// Age after which a learned ARP entry is evicted.
    pub arp_timeout_ms: u64,
    pub arp_sweep_interval_ms: u64,
    pub tcp_timer_interval_ms: u64,
    /// Initial retransmission timeout of every queued segment.
    pub tcp_rto_ms: u64,
    /// A segment outstanding this long aborts the connection.
    pub tcp_retransmit_deadline_ms: u64,
    /// Substitute for 2MSL.
    pub tcp_time_wait_ms: u64,
    pub ephemeral_port_min: u16,
    pub ephemeral_port_max: u16,
    /// First IPv4 identification value.
    pub ip_id_initial: u16,
    /// Initial send sequence of the first connection.  `None` draws one from
    /// the platform RNG.
    pub iss_seed: Option<u32>,
}

impl NetConfig {
    pub const fn new() -> Self {
        Self {
            arp_timeout_ms: 30_000,
            arp_sweep_interval_ms: 1_000,
            tcp_timer_interval_ms: 100,
            tcp_rto_ms: 200,
            tcp_retransmit_deadline_ms: 12_000,
            tcp_time_wait_ms: 30_000,
            ephemeral_port_min: 49152,
            ephemeral_port_max: 65535,
            ip_id_initial: 128,
            iss_seed: None,
        }
    }

    pub const fn with_iss_seed(mut self, seed: u32) -> Self {
        self.iss_seed = Some(seed);
        self
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Static IPv4 assignment for one device.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IfaceConfig {
    pub unicast: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Default gateway (`UNSPECIFIED` if none).
    pub gateway: Ipv4Addr,
}

impl IfaceConfig {
    pub const fn new(unicast: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            unicast,
            netmask,
            gateway: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub const fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = gateway;
        self
    }

    /// `broadcast = (unicast & netmask) | !netmask`
    #[inline]
    pub const fn broadcast(&self) -> Ipv4Addr {
        self.unicast.directed_broadcast(self.netmask)
    }

    /// Count the number of leading 1-bits in the netmask (prefix length).
    #[inline]
    pub fn prefix_len(&self) -> u8 {
        self.netmask.to_u32_be().leading_ones() as u8
    }
}

impl fmt::Debug for IfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IfaceConfig {{ ip={}/{}, gw={} }}",
            self.unicast,
            self.prefix_len(),
            self.gateway
        )
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Millisecond time source for timers, ARP ageing and retransmission.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Monotonic platform clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        laplus_lib::clock::uptime_ms()
    }
}

/// Clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub const fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

// =============================================================================
// Wait channels
// =============================================================================

/// One wait queue per PCB slot.  Shared by [`NetStack`] (sleepers) and
/// [`StackCore`] (wakers).
pub struct WaitChannels {
    pub tcp: [WaitQueue; TCP_PCB_COUNT],
    pub udp: [WaitQueue; UDP_PCB_COUNT],
}

impl WaitChannels {
    pub const fn new() -> Self {
        Self {
            tcp: [const { WaitQueue::new() }; TCP_PCB_COUNT],
            udp: [const { WaitQueue::new() }; UDP_PCB_COUNT],
        }
    }
}

impl Default for WaitChannels {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// StackCore
// =============================================================================

/// All mutable protocol state.  Reached only through [`NetStack::lock`].
pub struct StackCore {
    pub config: NetConfig,
    clock: Arc<dyn Clock>,
    pub(crate) waits: Arc<WaitChannels>,
    pub devices: DeviceRegistry,
    pub(crate) timers: Vec<TimerEntry>,
    pub ifaces: IfaceTable,
    pub routes: RouteTable,
    pub(crate) ip_protocols: Vec<(u8, ipv4::IpHandler)>,
    pub(crate) ip_id: u16,
    pub arp: ArpCache,
    pub tcp: TcpPcbTable,
    pub udp: UdpPcbTable,
    next_iss: u32,
}

impl StackCore {
    fn new(config: NetConfig, clock: Arc<dyn Clock>, waits: Arc<WaitChannels>) -> Self {
        let next_iss = match config.iss_seed {
            Some(seed) => seed,
            None => platform::rng_next() as u32,
        };
        Self {
            config,
            clock,
            waits,
            devices: DeviceRegistry::new(),
            timers: Vec::new(),
            ifaces: IfaceTable::new(),
            routes: RouteTable::new(),
            ip_protocols: Vec::new(),
            ip_id: config.ip_id_initial,
            arp: ArpCache::new(),
            tcp: TcpPcbTable::new(),
            udp: UdpPcbTable::new(),
            next_iss,
        }
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Initial send sequence number for a new connection.
    pub(crate) fn alloc_iss(&mut self) -> u32 {
        let iss = self.next_iss;
        self.next_iss = iss.wrapping_add(64_000);
        iss
    }
}

// =============================================================================
// NetStack
// =============================================================================

pub struct NetStack {
    pub(crate) core: IrqMutex<StackCore>,
    pub(crate) inputs: IrqMutex<Vec<InputQueue>>,
    pub(crate) softirq: SoftIrq,
    pub(crate) softirq_wait: WaitQueue,
    pub(crate) sockets: IrqMutex<SocketTable>,
    pub(crate) waits: Arc<WaitChannels>,
}

impl NetStack {
    /// Build a stack on the platform clock.
    pub fn new(config: NetConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a stack with ARP, IPv4, ICMP, TCP and UDP installed and their
    /// timers armed.  No device is registered yet.
    pub fn with_clock(config: NetConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let waits = Arc::new(WaitChannels::new());
        let mut core = StackCore::new(config, clock, Arc::clone(&waits));

        core.ip_protocols.push((IpProtocol::Icmp.as_u8(), icmp::input));
        core.ip_protocols.push((IpProtocol::Tcp.as_u8(), tcp::input));
        core.ip_protocols.push((IpProtocol::Udp.as_u8(), udp::input));
        core.register_timer(config.arp_sweep_interval_ms, arp::timer);
        core.register_timer(config.tcp_timer_interval_ms, tcp::timer);

        let inputs = alloc::vec![
            InputQueue::new(EtherType::Arp.as_u16(), arp::input),
            InputQueue::new(EtherType::Ipv4.as_u16(), ipv4::input),
        ];

        Arc::new(Self {
            core: IrqMutex::new(core),
            inputs: IrqMutex::new(inputs),
            softirq: SoftIrq::new(),
            softirq_wait: WaitQueue::new(),
            sockets: IrqMutex::new(SocketTable::new()),
            waits,
        })
    }

    /// Lock the protocol state.
    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, StackCore> {
        self.core.lock()
    }

    pub fn config(&self) -> NetConfig {
        self.core.lock().config
    }

    pub fn register_device(
        &self,
        info: DeviceInfo,
        driver: Box<dyn NetDevice>,
    ) -> Result<DevIndex, NetError> {
        self.core.lock().devices.register(info, driver)
    }

    /// Assign a static IPv4 address to `dev`: interface, connected route and,
    /// when set, the default gateway.
    pub fn configure(&self, dev: DevIndex, cfg: IfaceConfig) -> Result<IfaceId, NetError> {
        let mut core = self.core.lock();
        let iface = ipv4::iface_register(&mut core, dev, cfg.unicast, cfg.netmask)?;
        if !cfg.gateway.is_unspecified() {
            core.routes.set_default_gateway(iface, cfg.gateway);
        }
        klog_info!("net: dev={}, {:?}", dev, cfg);
        Ok(iface)
    }

    pub fn open_device(&self, dev: DevIndex) -> Result<(), NetError> {
        self.core.lock().devices.open(dev)
    }

    pub fn close_device(&self, dev: DevIndex) -> Result<(), NetError> {
        self.core.lock().devices.close(dev)
    }

    /// Open every registered device that is not up yet.
    pub fn run(&self) -> Result<(), NetError> {
        let mut core = self.core.lock();
        for index in 1..=core.devices.len() {
            let dev = DevIndex(index);
            let up = core.devices.get(dev).is_some_and(|d| d.info.is_up());
            if !up {
                core.devices.open(dev)?;
            }
        }
        klog_info!("net: running");
        Ok(())
    }

    /// Close every device that is up.
    pub fn shutdown(&self) -> Result<(), NetError> {
        let mut core = self.core.lock();
        for index in 1..=core.devices.len() {
            let dev = DevIndex(index);
            let up = core.devices.get(dev).is_some_and(|d| d.info.is_up());
            if up {
                core.devices.close(dev)?;
            }
        }
        klog_info!("net: shutting down");
        Ok(())
    }
}
