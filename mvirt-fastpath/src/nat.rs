//! Service NAT tables.
//!
//! A frontend (service address, port, protocol) maps to a backend set
//! identified by `id`; backends are stored per (id, ordinal). The ordinal
//! for a flow is a stable hash of the flow tuple, so every node holding the
//! same tables picks the same backend, including the node that receives
//! forwarded node port traffic through the tunnel.

use crate::routes::{RouteFlags, RouteTable};
use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::Ipv4Addr;
use tracing::debug;

/// Wildcard frontend address for node ports.
pub const NODEPORT_ADDR: Ipv4Addr = Ipv4Addr::BROADCAST;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatFrontendKey {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub proto: u8,
}

impl NatFrontendKey {
    pub fn new(addr: Ipv4Addr, port: u16, proto: u8) -> Self {
        Self { addr, port, proto }
    }

    pub fn nodeport(port: u16, proto: u8) -> Self {
        Self::new(NODEPORT_ADDR, port, proto)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatFrontend {
    /// Backend set id
    pub id: u32,
    /// Number of backends in the set
    pub count: u32,
    /// If non-empty, only sources within these prefixes may use the service
    pub source_ranges: Vec<Ipv4Net>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatBackendKey {
    pub id: u32,
    pub ordinal: u32,
}

/// A translated destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatDest {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl NatDest {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

/// Outcome of a NAT lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatLookup {
    /// No frontend matched; forward untranslated
    Allow,
    /// Translate to this backend
    Backend(NatDest),
    /// Service exists but has no usable backend
    NoBackend,
    /// Source may not reach this service
    Drop,
}

/// Frontend and backend tables.
#[derive(Default)]
pub struct NatTable {
    frontends: ArcSwap<HashMap<NatFrontendKey, NatFrontend>>,
    backends: ArcSwap<HashMap<NatBackendKey, NatDest>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a service. Backends are published before the frontend so the
    /// packet path never sees a frontend pointing at missing backends.
    pub fn set_service(
        &self,
        key: NatFrontendKey,
        id: u32,
        backends: &[NatDest],
        source_ranges: Vec<Ipv4Net>,
    ) {
        self.backends.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.retain(|k, _| k.id != id);
            for (ordinal, dest) in (0u32..).zip(backends) {
                next.insert(NatBackendKey { id, ordinal }, *dest);
            }
            next
        });
        let frontend = NatFrontend {
            id,
            count: backends.len() as u32,
            source_ranges,
        };
        self.frontends.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key, frontend.clone());
            next
        });
        debug!(
            addr = %key.addr,
            port = key.port,
            proto = key.proto,
            id,
            count = backends.len(),
            "NAT service set"
        );
    }

    /// Remove a service frontend. Its backends stay until the id is reused.
    pub fn remove_service(&self, key: &NatFrontendKey) {
        self.frontends.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(key);
            next
        });
    }

    pub fn frontend(&self, key: &NatFrontendKey) -> Option<NatFrontend> {
        self.frontends.load().get(key).cloned()
    }

    /// Resolve the destination of a new flow.
    ///
    /// Node port frontends apply when the destination is a local host
    /// address or, for traffic forwarded through the tunnel, the address of
    /// the cluster host that forwarded it. A tunneled flow only resolves to
    /// a backend local to this node.
    pub fn lookup(
        &self,
        routes: &RouteTable,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: u8,
        dport: u16,
        from_tunnel: bool,
    ) -> NatLookup {
        let frontends = self.frontends.load();
        let frontend = match frontends.get(&NatFrontendKey::new(dst, dport, proto)) {
            Some(fe) => fe,
            None => {
                let dst_flags = routes.lookup_flags(dst);
                let host_dst = if from_tunnel {
                    dst_flags.is_local_host() || dst_flags.is_remote_host()
                } else {
                    dst_flags.is_local_host()
                };
                if !host_dst {
                    return NatLookup::Allow;
                }
                match frontends.get(&NatFrontendKey::nodeport(dport, proto)) {
                    Some(fe) => fe,
                    None => return NatLookup::Allow,
                }
            }
        };

        if !frontend.source_ranges.is_empty()
            && !frontend.source_ranges.iter().any(|n| n.contains(&src))
        {
            debug!(%src, %dst, dport, "Source outside service source ranges");
            return NatLookup::Drop;
        }

        if frontend.count == 0 {
            return NatLookup::NoBackend;
        }

        let ordinal = backend_ordinal(src, dst, proto, dport, frontend.count);
        let key = NatBackendKey {
            id: frontend.id,
            ordinal,
        };
        let Some(dest) = self.backends.load().get(&key).copied() else {
            return NatLookup::NoBackend;
        };

        if from_tunnel && !routes.lookup_flags(dest.addr).contains(RouteFlags::LOCAL) {
            debug!(%src, backend = %dest.addr, "Tunneled flow resolved to a non-local backend");
            return NatLookup::Drop;
        }

        NatLookup::Backend(dest)
    }
}

fn backend_ordinal(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, dport: u16, count: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    (src, dst, proto, dport).hash(&mut hasher);
    (hasher.finish() % count as u64) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketNatKey {
    pub cookie: u64,
    pub proto: u8,
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Reverse NAT for connections translated at the socket layer: maps the
/// translated destination a local socket connects to back to the service
/// address it asked for.
#[derive(Default)]
pub struct SocketNatTable {
    entries: ArcSwap<HashMap<SocketNatKey, NatDest>>,
}

impl SocketNatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: SocketNatKey, original: NatDest) {
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key, original);
            next
        });
    }

    pub fn remove(&self, key: &SocketNatKey) {
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(key);
            next
        });
    }

    pub fn lookup(&self, key: &SocketNatKey) -> Option<NatDest> {
        self.entries.load().get(key).copied()
    }
}
