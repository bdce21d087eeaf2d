//! VXLAN tunnel between cluster nodes.
//!
//! Node port traffic whose backend lives on another node is wrapped in
//! VXLAN (outer IPv4 + UDP + VXLAN + inner Ethernet) and sent to that node,
//! which strips the wrapper again on its host interface.

use crate::config::FastPathConfig;
use crate::csum;
use crate::ctx::TcCtx;
use crate::error::{EncapError, Reason};
use crate::routes::RouteTable;
use crate::skb::{CsumField, ETH_HLEN, IPPROTO_UDP, IPV4_HLEN, UDP_CHECK, UDP_HLEN, UDP_SIZE, ipv4};
use std::net::Ipv4Addr;
use tracing::debug;

pub const VXLAN_HLEN: usize = 8;

/// Bytes added in front of the original IP header.
pub const VXLAN_ENCAP_SIZE: usize = IPV4_HLEN + UDP_HLEN + VXLAN_HLEN + ETH_HLEN;

/// "VNI valid" flag
const VXLAN_FLAG_I: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decap {
    /// Wrapper stripped, continue with the inner packet
    Decapped,
    /// Foreign VXLAN between cluster hosts, let it through
    KnownHostAllow,
    /// Not tunnel traffic for us, process as is
    NotOurs,
}

/// UDP datagram to the tunnel port.
pub fn is_vxlan_tunnel(ctx: &TcCtx<'_>, config: &FastPathConfig) -> Result<bool, Reason> {
    Ok(ctx.ip_proto()? == IPPROTO_UDP && ctx.l4_dport()? == config.vxlan_port)
}

pub fn vxlan_attempt_decap(
    ctx: &mut TcCtx<'_>,
    config: &FastPathConfig,
    routes: &RouteTable,
) -> Result<Decap, Reason> {
    let src = ctx.ip_saddr()?;
    let dst = ctx.ip_daddr()?;

    // only packets addressed to this node
    if !routes.is_local_host(dst) {
        return Ok(Decap::NotOurs);
    }

    ctx.refresh_validate(UDP_SIZE + VXLAN_HLEN + ETH_HLEN + IPV4_HLEN)?;
    let l4 = ctx.l4_off()?;
    let vxlan = l4 + UDP_HLEN;

    if ctx.skb.load_u8(vxlan)? & VXLAN_FLAG_I == 0 {
        return Ok(Decap::NotOurs);
    }
    let vni = ctx.skb.load_be32(vxlan + 4)? >> 8;

    if vni != config.vxlan_vni {
        if routes.is_remote_host(src) {
            debug!(%src, vni, "VXLAN from cluster host with foreign VNI");
            return Ok(Decap::KnownHostAllow);
        }
        return Ok(Decap::NotOurs);
    }

    if !routes.is_remote_host(src) {
        debug!(%src, "VXLAN with our VNI from unexpected source");
        return Err(Reason::UnauthSource);
    }

    // we always send a zero UDP checksum
    if ctx.skb.load_be16(l4 + UDP_CHECK)? != 0 {
        return Err(Reason::CsumFail);
    }

    ctx.state.tun_ip = src;
    let ip = ctx.ip_off()?;
    ctx.skb.remove(ip, vxlan + VXLAN_HLEN + ETH_HLEN - ip)?;
    ctx.refresh_validate(UDP_SIZE)?;
    debug!(tun_ip = %src, "VXLAN decapsulated");
    Ok(Decap::Decapped)
}

/// Frame would exceed the tunnel MTU once wrapped.
pub fn vxlan_encap_too_big(ctx: &TcCtx<'_>, config: &FastPathConfig) -> bool {
    ctx.skb.len() > ETH_HLEN + config.tunnel_mtu as usize
}

/// Wrap the frame for `dst`, with `src` as outer source.
///
/// The outer IPv4 header inherits TOS, ID, flags and TTL from the inner
/// one; the inner TTL is decremented since this node routes the packet.
pub fn vxlan_encap(
    ctx: &mut TcCtx<'_>,
    config: &FastPathConfig,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<(), EncapError> {
    let len = ctx.skb.len();
    let short = move |_| EncapError::TooShort(len);

    let mut eth = [0u8; ETH_HLEN];
    eth.copy_from_slice(ctx.skb.bytes(0, ETH_HLEN).map_err(short)?);
    let mut inner = [0u8; IPV4_HLEN];
    inner.copy_from_slice(ctx.skb.bytes(ETH_HLEN, IPV4_HLEN).map_err(short)?);

    let tot_len = u16::from_be_bytes([inner[2], inner[3]]) as usize + VXLAN_ENCAP_SIZE;
    let Ok(outer_len) = u16::try_from(tot_len) else {
        return Err(EncapError::TooLong(tot_len));
    };

    let mut hdr = [0u8; VXLAN_ENCAP_SIZE];
    let (ip, rest) = hdr.split_at_mut(IPV4_HLEN);
    ip[0] = 0x45;
    ip[1] = inner[1];
    ip[2..4].copy_from_slice(&outer_len.to_be_bytes());
    ip[4..8].copy_from_slice(&inner[4..8]);
    ip[ipv4::TTL] = inner[ipv4::TTL];
    ip[ipv4::PROTOCOL] = IPPROTO_UDP;
    ip[ipv4::SADDR..ipv4::SADDR + 4].copy_from_slice(&src.octets());
    ip[ipv4::DADDR..ipv4::DADDR + 4].copy_from_slice(&dst.octets());
    let check = csum::checksum(ip);
    ip[ipv4::CHECK..ipv4::CHECK + 2].copy_from_slice(&check.to_be_bytes());

    let (udp, rest) = rest.split_at_mut(UDP_HLEN);
    udp[0..2].copy_from_slice(&config.vxlan_port.to_be_bytes());
    udp[2..4].copy_from_slice(&config.vxlan_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(outer_len - IPV4_HLEN as u16).to_be_bytes());

    let (vxlan, inner_eth) = rest.split_at_mut(VXLAN_HLEN);
    vxlan[0] = VXLAN_FLAG_I;
    vxlan[4..8].copy_from_slice(&(config.vxlan_vni << 8).to_be_bytes());
    inner_eth.copy_from_slice(&eth);

    ctx.skb.insert(ETH_HLEN, &hdr).map_err(short)?;

    let inner_ip = ETH_HLEN + VXLAN_ENCAP_SIZE;
    let ttl = inner[ipv4::TTL];
    if ttl > 0 {
        let word = u16::from_be_bytes([ttl - 1, inner[ipv4::PROTOCOL]]);
        ctx.skb
            .rewrite_be16(
                inner_ip + ipv4::TTL,
                word,
                &[CsumField::Plain(inner_ip + ipv4::CHECK)],
            )
            .map_err(short)?;
    }

    debug!(%src, %dst, "VXLAN encapsulated");
    Ok(())
}
