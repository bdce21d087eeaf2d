//! Test utilities for mvirt-fastpath unit and integration tests.
//!
//! Provides frame builders and a node fixture wiring shared tables, a jump
//! table and one [`FastPath`] per hook the way a node attaches them.

pub mod packets;

pub use packets::*;

use crate::arp::ArpEntry;
use crate::config::{FastPathConfig, Hook};
use crate::fwd::Verdict;
use crate::jump::{AllowAll, JumpTable, PolicyProgram};
use crate::maps::Maps;
use crate::nat::{NatDest, NatFrontendKey};
use crate::routes::Route;
use crate::skb::SkBuff;
use crate::tc::FastPath;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Address of the node under test.
pub const HOST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);

/// Address of the other cluster node.
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 2);

/// Interface index of the host's data interface.
pub const HOST_IFINDEX: u32 = 2;

/// One node: shared tables plus its jump table.
pub struct TestNode {
    pub host_ip: Ipv4Addr,
    pub maps: Arc<Maps>,
    pub jumps: Arc<JumpTable>,
}

impl TestNode {
    /// Node at `host_ip` knowing `peers` as the other cluster hosts, with
    /// an allow-all policy installed.
    pub fn new(host_ip: Ipv4Addr, peers: &[Ipv4Addr]) -> Self {
        Self::with_maps(host_ip, peers, Maps::new())
    }

    /// As [`TestNode::new`], on tables built by the caller.
    pub fn with_maps(host_ip: Ipv4Addr, peers: &[Ipv4Addr], maps: Maps) -> Self {
        let maps = Arc::new(maps);
        maps.routes.upsert(Ipv4Net::from(host_ip), Route::local_host());
        for peer in peers {
            maps.routes.upsert(Ipv4Net::from(*peer), Route::remote_host());
        }
        let jumps = Arc::new(JumpTable::with_core_programs());
        jumps.set_policy(Arc::new(AllowAll));
        Self {
            host_ip,
            maps,
            jumps,
        }
    }

    /// The usual node under test, with `PEER_IP` as its only peer.
    pub fn local() -> Self {
        Self::new(HOST_IP, &[PEER_IP])
    }

    pub fn config(&self, hook: Hook) -> FastPathConfig {
        FastPathConfig::new(hook, self.host_ip)
    }

    pub fn fast_path(&self, hook: Hook) -> FastPath {
        self.fast_path_with(self.config(hook))
    }

    pub fn fast_path_with(&self, config: FastPathConfig) -> FastPath {
        FastPath::new(config, Arc::clone(&self.maps), Arc::clone(&self.jumps))
    }

    pub fn set_policy(&self, program: impl PolicyProgram + 'static) {
        self.jumps.set_policy(Arc::new(program));
    }

    /// Workload on this node behind interface `ifindex`, with a neighbour entry.
    pub fn add_local_workload(&self, ip: Ipv4Addr, ifindex: u32) {
        self.maps
            .routes
            .upsert(Ipv4Net::from(ip), Route::local_workload(ifindex));
        self.maps.arp.insert(
            ip,
            ifindex,
            ArpEntry {
                mac_src: HOST_MAC,
                mac_dst: workload_mac(ip),
            },
        );
    }

    /// Workload on the node at `node`.
    pub fn add_remote_workload(&self, ip: Ipv4Addr, node: Ipv4Addr) {
        self.maps
            .routes
            .upsert(Ipv4Net::from(ip), Route::remote_workload(node));
    }

    pub fn add_service(&self, key: NatFrontendKey, id: u32, backends: &[NatDest]) {
        self.maps.nat.set_service(key, id, backends, Vec::new());
    }
}

/// Run `frame` through `fast_path` and return the verdict and resulting frame.
pub fn run(fast_path: &FastPath, frame: Vec<u8>, ifindex: u32) -> (Verdict, Vec<u8>) {
    run_skb(fast_path, SkBuff::new(frame, ifindex))
}

/// As [`run`], with buffer metadata set by the caller.
pub fn run_skb(fast_path: &FastPath, mut skb: SkBuff) -> (Verdict, Vec<u8>) {
    let verdict = fast_path.process(&mut skb);
    (verdict, skb.into_data())
}
