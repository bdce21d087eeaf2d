//! Header parsing.
//!
//! `parse_packet_ip` classifies the link layer and validates the IPv4
//! header, `fill_from_iphdr` and `fill_from_nexthdr` copy the fields later
//! stages need into the scratch state.

use crate::config::FastPathConfig;
use crate::ctx::TcCtx;
use crate::error::Reason;
use crate::routes::RouteTable;
use crate::skb::{
    ETH_HLEN, ETH_P_ARP, ETH_P_IP, ETH_P_IPV6, IPPROTO_ICMP, IPPROTO_IPIP, IPPROTO_TCP,
    IPPROTO_UDP, SkBuff, TCP_SIZE, UDP_SIZE,
};
use crate::state::TcState;
use tracing::debug;

/// Outcome of a parsing stage that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parse {
    Continue,
    /// Let the packet through without conntrack or policy
    AllowWithoutPolicy,
}

/// Result of parsing a packet on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
    Continue(TcState),
    AllowWithoutPolicy,
    Deny(Reason),
}

/// Run the parsing stages over `skb` and return the extracted state.
pub fn parse(config: &FastPathConfig, routes: &RouteTable, skb: &mut SkBuff) -> Parsed {
    let mut ctx = TcCtx::new(skb);
    let run = |ctx: &mut TcCtx<'_>| -> Result<Parse, Reason> {
        if parse_packet_ip(ctx, config, routes)? == Parse::AllowWithoutPolicy {
            return Ok(Parse::AllowWithoutPolicy);
        }
        fill_from_iphdr(ctx)?;
        fill_from_nexthdr(ctx, config, routes)
    };
    match run(&mut ctx) {
        Ok(Parse::Continue) => Parsed::Continue(ctx.state),
        Ok(Parse::AllowWithoutPolicy) => Parsed::AllowWithoutPolicy,
        Err(reason) => Parsed::Deny(reason),
    }
}

pub fn parse_packet_ip(
    ctx: &mut TcCtx<'_>,
    config: &FastPathConfig,
    routes: &RouteTable,
) -> Result<Parse, Reason> {
    // XDP has no ethertype hint, it must be read from the frame first.
    let protocol = if config.xdp {
        ctx.refresh_validate(UDP_SIZE)?;
        ctx.skb.load_be16(ETH_HLEN - 2)?
    } else {
        ctx.skb.protocol
    };

    match protocol {
        ETH_P_IP => {}
        ETH_P_ARP => {
            debug!("ARP: allowing packet");
            return Ok(Parse::AllowWithoutPolicy);
        }
        ETH_P_IPV6 => {
            if config.wep() {
                debug!("IPv6 from workload: drop");
                return Err(Reason::Unknown);
            }
            // IPv6 is not enforced on host interfaces
            debug!("IPv6 on host interface: allow");
            return Ok(Parse::AllowWithoutPolicy);
        }
        other => {
            if config.wep() {
                debug!(
                    protocol = format_args!("{other:#06x}"),
                    "Unknown ethertype on workload: drop"
                );
                return Err(Reason::Unknown);
            }
            debug!(protocol = format_args!("{other:#06x}"), "Unknown ethertype on host: allow");
            return Ok(Parse::AllowWithoutPolicy);
        }
    }

    if !config.xdp {
        ctx.refresh_validate(UDP_SIZE)?;
    }

    let ihl = ctx.ip_ihl()?;
    if ihl < 5 {
        return Err(Reason::IpMalformed);
    }
    if ihl > 5 {
        if config.wep() || (config.from_hep() && !routes.is_local_host(ctx.ip_daddr()?)) {
            debug!("IP options: drop");
            return Err(Reason::IpOptions);
        }
        debug!("IP options towards host: allow");
        return Ok(Parse::AllowWithoutPolicy);
    }

    Ok(Parse::Continue)
}

pub fn fill_from_iphdr(ctx: &mut TcCtx<'_>) -> Result<(), Reason> {
    ctx.state.ip_src = ctx.ip_saddr()?;
    ctx.state.ip_dst = ctx.ip_daddr()?;
    ctx.state.pre_nat_ip_dst = ctx.state.ip_dst;
    ctx.state.ip_proto = ctx.ip_proto()?;
    ctx.state.ip_size = ctx.ip_tot_len()?;
    Ok(())
}

pub fn fill_from_nexthdr(
    ctx: &mut TcCtx<'_>,
    config: &FastPathConfig,
    routes: &RouteTable,
) -> Result<Parse, Reason> {
    match ctx.state.ip_proto {
        IPPROTO_TCP => {
            ctx.refresh_validate(TCP_SIZE)?;
            ctx.state.sport = ctx.l4_sport()?;
            ctx.state.dport = ctx.l4_dport()?;
            ctx.state.pre_nat_dport = ctx.state.dport;
        }
        IPPROTO_UDP => {
            ctx.state.sport = ctx.l4_sport()?;
            ctx.state.dport = ctx.l4_dport()?;
            ctx.state.pre_nat_dport = ctx.state.dport;
            // From-host tunnel traffic was already handled by decap.
            if ctx.state.dport == config.vxlan_port
                && config.to_hep()
                && routes.is_remote_host(ctx.state.ip_dst)
                && routes.is_local_host(ctx.state.ip_src)
            {
                debug!("VXLAN to another node: allow");
                return Ok(Parse::AllowWithoutPolicy);
            }
        }
        IPPROTO_ICMP => {
            ctx.state.icmp_type = ctx.icmp_type()?;
            ctx.state.icmp_code = ctx.icmp_code()?;
        }
        IPPROTO_IPIP => {
            if config.tunnel || config.wireguard {
                debug!("IPIP inside a tunnel: drop");
                return Err(Reason::UnauthSource);
            }
            if config.from_hep() {
                if routes.is_remote_host(ctx.state.ip_src) {
                    return Ok(Parse::AllowWithoutPolicy);
                }
                debug!(src = %ctx.state.ip_src, "IPIP from unknown host: drop");
                return Err(Reason::UnauthSource);
            }
            if config.to_hep() {
                if routes.is_remote_host(ctx.state.ip_dst) {
                    return Ok(Parse::AllowWithoutPolicy);
                }
                return Err(Reason::UnauthSource);
            }
            if config.from_wep() {
                return Err(Reason::UnauthSource);
            }
        }
        proto => debug!(proto, "Unknown protocol, no ports"),
    }
    Ok(Parse::Continue)
}
