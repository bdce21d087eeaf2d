//! Failsafe ports: host traffic that must never be blocked by policy, so a
//! broken policy cannot lock operators out of a node.

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailsafeDirection {
    /// Towards a local host address
    Inbound,
    /// From a local host address
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FailsafeKey {
    direction: FailsafeDirection,
    proto: u8,
    port: u16,
}

/// (protocol, port) allow-lists, each restricted to a set of peer prefixes.
#[derive(Default)]
pub struct FailsafeTable {
    entries: ArcSwap<HashMap<FailsafeKey, Vec<Ipv4Net>>>,
}

impl FailsafeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `proto`/`port` in `direction` for peers within `peers`.
    pub fn add(&self, direction: FailsafeDirection, proto: u8, port: u16, peers: Ipv4Net) {
        let key = FailsafeKey { direction, proto, port };
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            let nets = next.entry(key).or_default();
            if !nets.contains(&peers) {
                nets.push(peers);
            }
            next
        });
    }

    pub fn clear(&self) {
        self.entries.store(Default::default());
    }

    fn matches(&self, key: FailsafeKey, peer: Ipv4Addr) -> bool {
        self.entries
            .load()
            .get(&key)
            .is_some_and(|nets| nets.iter().any(|n| n.contains(&peer)))
    }

    /// Inbound to a local host address from `src`.
    pub fn is_failsafe_in(&self, proto: u8, port: u16, src: Ipv4Addr) -> bool {
        let key = FailsafeKey {
            direction: FailsafeDirection::Inbound,
            proto,
            port,
        };
        self.matches(key, src)
    }

    /// Outbound from a local host address to `dst`.
    pub fn is_failsafe_out(&self, proto: u8, port: u16, dst: Ipv4Addr) -> bool {
        let key = FailsafeKey {
            direction: FailsafeDirection::Outbound,
            proto,
            port,
        };
        self.matches(key, dst)
    }
}
