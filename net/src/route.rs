//! IPv4 routing table.
//!
//! Routes are kept in insertion order and selected by longest netmask.  On a
//! tie the earliest route wins.  A default route is the entry `0.0.0.0/0`
//! whose nexthop is the gateway.  Connected routes (one per interface) have
//! an unspecified nexthop: the destination itself is the next hop.

use alloc::vec::Vec;
use core::fmt;

use laplus_lib::klog_info;

use crate::types::{IfaceId, Ipv4Addr};

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// `UNSPECIFIED` for a directly connected network.
    pub nexthop: Ipv4Addr,
    pub iface: IfaceId,
}

impl RouteEntry {
    #[inline]
    pub fn matches(&self, dst: Ipv4Addr) -> bool {
        Ipv4Addr::in_subnet(dst, self.network, self.netmask)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.nexthop.is_unspecified()
    }

    /// Next hop for `dst` through this route.
    #[inline]
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.is_connected() { dst } else { self.nexthop }
    }

    #[inline]
    pub fn prefix_len(&self) -> u32 {
        self.netmask.to_u32_be().leading_ones()
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} via {} iface {}",
            self.network,
            self.prefix_len(),
            self.nexthop,
            self.iface
        )
    }
}

#[derive(Default)]
pub struct RouteTable {
    routes: Vec<RouteEntry>,
}

impl RouteTable {
    pub const fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn add(
        &mut self,
        network: Ipv4Addr,
        netmask: Ipv4Addr,
        nexthop: Ipv4Addr,
        iface: IfaceId,
    ) -> RouteEntry {
        let entry = RouteEntry {
            network: network.mask(netmask),
            netmask,
            nexthop,
            iface,
        };
        klog_info!("ip: route added, {:?}", entry);
        self.routes.push(entry);
        entry
    }

    pub fn set_default_gateway(&mut self, iface: IfaceId, gateway: Ipv4Addr) -> RouteEntry {
        self.add(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            gateway,
            iface,
        )
    }

    /// Longest-prefix match for `dst`.
    pub fn lookup(&self, dst: Ipv4Addr) -> Option<RouteEntry> {
        let mut best: Option<RouteEntry> = None;
        for route in self.routes.iter().filter(|r| r.matches(dst)) {
            // Strict comparison keeps the earliest route on a tie.
            if best.is_none_or(|b| route.netmask.to_u32_be() > b.netmask.to_u32_be()) {
                best = Some(*route);
            }
        }
        best
    }

    pub fn get_iface(&self, dst: Ipv4Addr) -> Option<IfaceId> {
        self.lookup(dst).map(|r| r.iface)
    }

    /// Point `iface`'s connected routes at a new network.
    pub fn update_connected(&mut self, iface: IfaceId, network: Ipv4Addr, netmask: Ipv4Addr) {
        for route in self
            .routes
            .iter_mut()
            .filter(|r| r.iface == iface && r.is_connected())
        {
            route.network = network.mask(netmask);
            route.netmask = netmask;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
