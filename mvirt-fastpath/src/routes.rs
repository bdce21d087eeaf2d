//! LPM route table consulted by the fast path.
//!
//! This module provides:
//! - `RouteFlags`: classification of a prefix (local host, workload, pool, ...)
//! - `Route`: flags plus next hop and owning interface
//! - `RouteTable`: lock-free readable LPM table, updated copy-on-write by the
//!   control plane

use arc_swap::ArcSwap;
use bitflags::bitflags;
use ipnet::Ipv4Net;
use prefix_trie::PrefixMap;
use std::net::Ipv4Addr;
use tracing::debug;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RouteFlags: u32 {
        /// Destination lives on this node
        const LOCAL = 1 << 0;
        /// Destination is a host address
        const HOST = 1 << 1;
        /// Destination is a workload address
        const WORKLOAD = 1 << 2;
        /// Prefix belongs to a cluster IP pool
        const IN_POOL = 1 << 3;
        /// Pool has outgoing NAT enabled
        const NAT_OUT = 1 << 4;
        /// Reached through a node-to-node tunnel
        const TUNNELED = 1 << 5;
    }
}

impl RouteFlags {
    pub fn is_local_host(self) -> bool {
        self.contains(RouteFlags::LOCAL | RouteFlags::HOST)
    }

    pub fn is_remote_host(self) -> bool {
        self.contains(RouteFlags::HOST) && !self.contains(RouteFlags::LOCAL)
    }

    pub fn is_local_workload(self) -> bool {
        self.contains(RouteFlags::LOCAL | RouteFlags::WORKLOAD)
    }
}

/// A route entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub flags: RouteFlags,
    /// Node owning a remote prefix (tunnel peer)
    pub next_hop: Ipv4Addr,
    /// Interface of a local workload, 0 if none
    pub if_index: u32,
}

impl Route {
    pub fn local_host() -> Self {
        Self {
            flags: RouteFlags::LOCAL | RouteFlags::HOST,
            next_hop: Ipv4Addr::UNSPECIFIED,
            if_index: 0,
        }
    }

    pub fn remote_host() -> Self {
        Self {
            flags: RouteFlags::HOST,
            next_hop: Ipv4Addr::UNSPECIFIED,
            if_index: 0,
        }
    }

    pub fn local_workload(if_index: u32) -> Self {
        Self {
            flags: RouteFlags::LOCAL | RouteFlags::WORKLOAD | RouteFlags::IN_POOL,
            next_hop: Ipv4Addr::UNSPECIFIED,
            if_index,
        }
    }

    pub fn remote_workload(next_hop: Ipv4Addr) -> Self {
        Self {
            flags: RouteFlags::WORKLOAD | RouteFlags::IN_POOL | RouteFlags::TUNNELED,
            next_hop,
            if_index: 0,
        }
    }

    pub fn with_flags(mut self, flags: RouteFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_local(&self) -> bool {
        self.flags.contains(RouteFlags::LOCAL)
    }

    pub fn is_workload(&self) -> bool {
        self.flags.contains(RouteFlags::WORKLOAD)
    }
}

/// Route table. Reads load a snapshot, writes swap in a modified copy.
pub struct RouteTable {
    inner: ArcSwap<PrefixMap<Ipv4Net, Route>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(PrefixMap::new()),
        }
    }

    /// Longest prefix match for a single address.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<Route> {
        let prefix = Ipv4Net::new(addr, 32).ok()?;
        self.inner.load().get_lpm(&prefix).map(|(_, route)| *route)
    }

    /// Flags of the matching route, empty if there is none.
    pub fn lookup_flags(&self, addr: Ipv4Addr) -> RouteFlags {
        self.lookup(addr).map_or(RouteFlags::empty(), |r| r.flags)
    }

    pub fn is_local_host(&self, addr: Ipv4Addr) -> bool {
        self.lookup_flags(addr).is_local_host()
    }

    pub fn is_remote_host(&self, addr: Ipv4Addr) -> bool {
        self.lookup_flags(addr).is_remote_host()
    }

    /// Insert or replace a route.
    pub fn upsert(&self, prefix: Ipv4Net, route: Route) {
        let prefix = prefix.trunc();
        self.inner.rcu(|current| {
            let mut next = PrefixMap::clone(current);
            next.insert(prefix, route);
            next
        });
        debug!(%prefix, flags = ?route.flags, if_index = route.if_index, "Route upserted");
    }

    /// Remove a route; returns whether it existed.
    pub fn remove(&self, prefix: &Ipv4Net) -> bool {
        let prefix = prefix.trunc();
        let mut removed = false;
        self.inner.rcu(|current| {
            let mut next = PrefixMap::clone(current);
            removed = next.remove(&prefix).is_some();
            next
        });
        if removed {
            debug!(%prefix, "Route removed");
        }
        removed
    }
}
