//! ARP cache: next-hop link-layer addresses per (address, interface).

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArpKey {
    pub ip: Ipv4Addr,
    pub ifindex: u32,
}

/// MAC pair to put on a frame sent to the key's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub mac_src: [u8; 6],
    pub mac_dst: [u8; 6],
}

#[derive(Default)]
pub struct ArpTable {
    entries: ArcSwap<HashMap<ArpKey, ArpEntry>>,
}

impl ArpTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, ip: Ipv4Addr, ifindex: u32) -> Option<ArpEntry> {
        self.entries.load().get(&ArpKey { ip, ifindex }).copied()
    }

    pub fn insert(&self, ip: Ipv4Addr, ifindex: u32, entry: ArpEntry) {
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(ArpKey { ip, ifindex }, entry);
            next
        });
    }

    pub fn remove(&self, ip: Ipv4Addr, ifindex: u32) {
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&ArpKey { ip, ifindex });
            next
        });
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_per_interface() {
        let table = ArpTable::new();
        let entry = ArpEntry {
            mac_src: [2, 0, 0, 0, 0, 1],
            mac_dst: [2, 0, 0, 0, 0, 2],
        };
        table.insert(Ipv4Addr::new(10, 0, 0, 9), 4, entry);

        assert_eq!(table.lookup(Ipv4Addr::new(10, 0, 0, 9), 4), Some(entry));
        assert_eq!(table.lookup(Ipv4Addr::new(10, 0, 0, 9), 5), None);

        table.remove(Ipv4Addr::new(10, 0, 0, 9), 4);
        assert!(table.is_empty());
    }
}
