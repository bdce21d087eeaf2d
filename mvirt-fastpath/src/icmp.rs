//! ICMP error synthesis.
//!
//! The offending frame is replaced by an ICMP error addressed to its
//! source, carrying the original IP header and the first eight bytes of its
//! payload.

use crate::config::FastPathConfig;
use crate::ctx::TcCtx;
use crate::error::Reason;
use crate::skb::{ETH_ALEN, ETH_HLEN, ICMP_HLEN, IPV4_HLEN};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv4Packet, IpProtocol,
    Ipv4Packet, Ipv4Repr,
};
use tracing::debug;

pub const ICMP_ECHOREPLY: u8 = 0;
pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PARAMETERPROB: u8 = 12;

/// Codes for `ICMP_DEST_UNREACH`
pub const ICMP_PORT_UNREACH: u8 = 3;
pub const ICMP_FRAG_NEEDED: u8 = 4;

/// Code for `ICMP_TIME_EXCEEDED`
pub const ICMP_EXC_TTL: u8 = 0;

/// Bytes of the original payload quoted after its IP header.
const ICMP_QUOTE_LEN: usize = 8;

const ICMP_REPLY_TTL: u8 = 64;

/// ICMP types that carry an embedded packet.
pub fn icmp_type_is_err(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        ICMP_DEST_UNREACH | ICMP_TIME_EXCEEDED | ICMP_PARAMETERPROB
    )
}

/// Forwarding would take the TTL to zero.
pub fn ip_ttl_exceeded(ctx: &TcCtx<'_>) -> Result<bool, Reason> {
    Ok(ctx.ip_ttl()? <= 1)
}

/// Replace the frame with an ICMP error of `icmp_type`/`code`.
///
/// `mtu` fills the next-hop MTU of a fragmentation-needed reply and is
/// ignored otherwise.
pub fn icmp_v4_reply(
    ctx: &mut TcCtx<'_>,
    config: &FastPathConfig,
    icmp_type: u8,
    code: u8,
    mtu: u16,
) -> Result<(), Reason> {
    ctx.refresh_validate(0)?;
    let ip = ctx.ip_off()?;
    let orig_src = ctx.ip_saddr()?;
    let ihl = ctx.ip_ihl()? as usize * 4;
    let quote_len = (ihl + ICMP_QUOTE_LEN).min(ctx.skb.len() - ip);
    let quote = ctx.skb.bytes(ip, quote_len)?;

    let icmp_len = ICMP_HLEN + quote_len;
    let mut frame = vec![0u8; ETH_HLEN + IPV4_HLEN + icmp_len];

    let orig_eth = ctx.skb.bytes(0, 2 * ETH_ALEN)?;
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&orig_eth[..ETH_ALEN]),
        dst_addr: EthernetAddress::from_bytes(&orig_eth[ETH_ALEN..]),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: config.host_ip,
        dst_addr: orig_src,
        next_header: IpProtocol::Icmp,
        payload_len: icmp_len,
        hop_limit: ICMP_REPLY_TTL,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    let icmp_buf = ip_packet.payload_mut();
    icmp_buf[0] = icmp_type;
    icmp_buf[1] = code;
    if icmp_type == ICMP_DEST_UNREACH && code == ICMP_FRAG_NEEDED {
        icmp_buf[6..8].copy_from_slice(&mtu.to_be_bytes());
    }
    icmp_buf[ICMP_HLEN..].copy_from_slice(quote);
    Icmpv4Packet::new_unchecked(icmp_buf).fill_checksum();

    debug!(icmp_type, code, dst = %orig_src, "Sending ICMP reply");
    ctx.skb.replace(frame);
    ctx.refresh_validate(0)
}
