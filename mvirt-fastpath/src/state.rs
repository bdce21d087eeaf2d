//! Per-packet scratch state carried across jump table hops.

use crate::conntrack::CtResult;
use crate::nat::NatDest;
use bitflags::bitflags;
use std::net::Ipv4Addr;

bitflags! {
    /// Flags accumulated while processing one packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateFlags: u32 {
        /// Masquerade via the fallback stack
        const NAT_OUTGOING = 1 << 0;
        /// Do not attempt a fast path redirect
        const SKIP_FIB = 1 << 1;
        /// Post-NAT destination is a local host address
        const DEST_IS_HOST = 1 << 2;
        /// Source is a local host address
        const SRC_IS_HOST = 1 << 3;
    }
}

impl Default for StateFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Result of the admission policy program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyResult {
    /// End of rules without a terminal action; treated as deny
    #[default]
    NoMatch,
    Allow,
    Deny,
}

/// Fields derived from the packet and passed between stages.
///
/// Created zeroed at pipeline entry and owned by the invocation; the policy
/// hop and the ICMP hop receive it by reference and hand it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcState {
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    /// Destination before any socket-level NAT done on the host
    pub pre_nat_ip_dst: Ipv4Addr,
    pub post_nat_ip_dst: Ipv4Addr,
    /// Tunnel peer the packet arrived from (or must be sent to)
    pub tun_ip: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub pre_nat_dport: u16,
    pub post_nat_dport: u16,
    pub ip_proto: u8,
    pub ip_size: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// Next-hop MTU reported in a fragmentation-needed reply
    pub icmp_mtu: u16,
    pub flags: StateFlags,
    pub pol_rc: PolicyResult,
    pub ct_result: CtResult,
    pub nat_dest: Option<NatDest>,
}

impl Default for TcState {
    fn default() -> Self {
        Self {
            ip_src: Ipv4Addr::UNSPECIFIED,
            ip_dst: Ipv4Addr::UNSPECIFIED,
            pre_nat_ip_dst: Ipv4Addr::UNSPECIFIED,
            post_nat_ip_dst: Ipv4Addr::UNSPECIFIED,
            tun_ip: Ipv4Addr::UNSPECIFIED,
            sport: 0,
            dport: 0,
            pre_nat_dport: 0,
            post_nat_dport: 0,
            ip_proto: 0,
            ip_size: 0,
            icmp_type: 0,
            icmp_code: 0,
            icmp_mtu: 0,
            flags: StateFlags::empty(),
            pol_rc: PolicyResult::NoMatch,
            ct_result: CtResult::default(),
            nat_dest: None,
        }
    }
}

impl TcState {
    pub fn has_tunnel_peer(&self) -> bool {
        !self.tun_ip.is_unspecified()
    }
}
