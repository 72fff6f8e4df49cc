//! laplus network protocol stack.
//!
//! A small layered stack: device registry with deferred (soft-irq) input
//! dispatch and periodic timers, Ethernet framing, ARP, IPv4 with a routing
//! table, ICMP echo, TCP (RFC 793) and UDP, fronted by a BSD-like socket
//! layer with `SIOC*` interface configuration.
//!
//! # Architecture
//!
//! ```text
//!  socket ─┬─ tcp ─┐
//!          └─ udp ─┼─ ipv4 ─ arp ─ ethernet ─ netdev ─ driver
//!           icmp ──┘    route
//! ```
//!
//! Everything mutable lives in [`netstack::StackCore`] behind one
//! `IrqMutex`.  Drivers call [`NetStack::dispatch_input`] from their
//! interrupt path; protocol code runs later from
//! [`NetStack::softirq_handler`] and [`NetStack::timer_handler`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arp;
pub mod checksum;
pub mod dispatch;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod loopback;
pub mod netdev;
pub mod netstack;
pub mod route;
pub mod socket;
pub mod softirq;
pub mod tcp;
pub mod tcp_socket;
pub mod types;
pub mod udp;

#[cfg(test)]
mod testutil;

#[cfg(test)]
mod checksum_tests;
#[cfg(test)]
mod dispatch_tests;
#[cfg(test)]
mod ethernet_tests;
#[cfg(test)]
mod icmp_tests;
#[cfg(test)]
mod socket_tests;
#[cfg(test)]
mod udp_tests;

pub use netdev::{DeviceFlags, DeviceInfo, DeviceType, NetDevice};
pub use netstack::{Clock, IfaceConfig, ManualClock, NetConfig, NetStack, StackCore};
pub use types::{DevIndex, IfaceId, Ipv4Addr, MacAddr, NetError, Port, SockAddr};
