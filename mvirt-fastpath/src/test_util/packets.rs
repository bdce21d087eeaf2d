//! Frame builders and checkers for tests.
//!
//! Frames start with the Ethernet header, as seen by a tc hook.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Packet, Icmpv4Repr, IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr,
    TcpPacket, TcpSeqNumber, UdpPacket,
};
use std::net::Ipv4Addr;

// ============================================================================
// Constants
// ============================================================================

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

pub const UDP_HDR_SIZE: usize = 8;

pub const TCP_HDR_SIZE: usize = 20;

pub const VXLAN_PORT: u16 = 4789;

/// Host side MAC of every interface in tests
pub const HOST_MAC: [u8; 6] = [0xee, 0xee, 0xee, 0xee, 0xee, 0xee];

/// MAC of the workload sending test frames
pub const WORKLOAD_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

const DEFAULT_TTL: u8 = 64;

/// MAC derived from a workload address.
pub fn workload_mac(ip: Ipv4Addr) -> [u8; 6] {
    let [a, b, c, d] = ip.octets();
    [0x52, 0x54, a, b, c, d]
}

// ============================================================================
// IPv4 frames
// ============================================================================

fn ipv4_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: IpProtocol,
    payload_len: usize,
    fill: impl FnOnce(&mut [u8]),
) -> Vec<u8> {
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + payload_len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(WORKLOAD_MAC),
        dst_addr: EthernetAddress(HOST_MAC),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: protocol,
        payload_len,
        hop_limit: DEFAULT_TTL,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
    fill(ip_packet.payload_mut());

    packet
}

/// UDP datagram with a valid checksum.
pub fn udp_frame(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
    ipv4_frame(src, dst, IpProtocol::Udp, UDP_HDR_SIZE + payload.len(), |buf| {
        let mut udp = UdpPacket::new_unchecked(buf);
        udp.set_src_port(sport);
        udp.set_dst_port(dport);
        udp.set_len((UDP_HDR_SIZE + payload.len()) as u16);
        udp.payload_mut().copy_from_slice(payload);
        udp.fill_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst));
    })
}

/// TCP segment without payload.
pub fn tcp_frame(
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    syn: bool,
    ack: bool,
) -> Vec<u8> {
    ipv4_frame(src, dst, IpProtocol::Tcp, TCP_HDR_SIZE, |buf| {
        let mut tcp = TcpPacket::new_unchecked(buf);
        tcp.set_src_port(sport);
        tcp.set_dst_port(dport);
        tcp.set_seq_number(TcpSeqNumber(1000));
        tcp.set_ack_number(TcpSeqNumber(if ack { 2000 } else { 0 }));
        tcp.set_header_len(TCP_HDR_SIZE as u8);
        tcp.clear_flags();
        tcp.set_syn(syn);
        tcp.set_ack(ack);
        tcp.set_window_len(64240);
        tcp.fill_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst));
    })
}

pub fn tcp_syn(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Vec<u8> {
    tcp_frame(src, sport, dst, dport, true, false)
}

pub fn tcp_ack(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Vec<u8> {
    tcp_frame(src, sport, dst, dport, false, true)
}

/// ICMP echo request.
pub fn icmp_echo(src: Ipv4Addr, dst: Ipv4Addr, ident: u16, seq_no: u16) -> Vec<u8> {
    let data = b"ping from test!";
    let icmp_repr = Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data,
    };
    ipv4_frame(src, dst, IpProtocol::Icmp, icmp_repr.buffer_len(), |buf| {
        let mut icmp = Icmpv4Packet::new_unchecked(buf);
        icmp_repr.emit(&mut icmp, &ChecksumCapabilities::default());
    })
}

/// ICMP error quoting `quoted` (an IP header plus leading payload bytes).
pub fn icmp_error(src: Ipv4Addr, dst: Ipv4Addr, icmp_type: u8, code: u8, quoted: &[u8]) -> Vec<u8> {
    ipv4_frame(src, dst, IpProtocol::Icmp, 8 + quoted.len(), |buf| {
        buf[0] = icmp_type;
        buf[1] = code;
        buf[8..].copy_from_slice(quoted);
        Icmpv4Packet::new_unchecked(buf).fill_checksum();
    })
}

/// The IP header and first 8 payload bytes of a frame, as an ICMP error
/// quotes them.
pub fn icmp_quote(frame: &[u8]) -> Vec<u8> {
    let ip = Ipv4Packet::new_checked(&frame[ETHERNET_HDR_SIZE..]).expect("IPv4 frame");
    let len = ip.header_len() as usize + 8;
    frame[ETHERNET_HDR_SIZE..ETHERNET_HDR_SIZE + len].to_vec()
}

/// Copy of an IPv4 frame with four bytes of NOP options after the header.
pub fn with_ip_options(frame: &[u8]) -> Vec<u8> {
    let ip_start = ETHERNET_HDR_SIZE;
    let ip_end = ip_start + IP_HDR_SIZE;
    let mut out = Vec::with_capacity(frame.len() + 4);
    out.extend_from_slice(&frame[..ip_end]);
    out.extend_from_slice(&[1, 1, 1, 1]);
    out.extend_from_slice(&frame[ip_end..]);

    let mut ip = Ipv4Packet::new_unchecked(&mut out[ip_start..]);
    let total_len = ip.total_len() + 4;
    ip.set_header_len((IP_HDR_SIZE + 4) as u8);
    ip.set_total_len(total_len);
    ip.fill_checksum();
    out
}

/// Set TTL and fix the IP checksum.
pub fn set_ttl(frame: &mut [u8], ttl: u8) {
    let mut ip = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HDR_SIZE..]);
    ip.set_hop_limit(ttl);
    ip.fill_checksum();
}

/// Mark as a non-initial fragment and fix the IP checksum.
pub fn set_frag_offset(frame: &mut [u8], offset: u16) {
    let mut ip = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HDR_SIZE..]);
    ip.set_dont_frag(false);
    ip.set_frag_offset(offset);
    ip.fill_checksum();
}

/// Clear the don't-fragment bit and fix the IP checksum.
pub fn clear_dont_frag(frame: &mut [u8]) {
    let mut ip = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HDR_SIZE..]);
    ip.set_dont_frag(false);
    ip.fill_checksum();
}

// ============================================================================
// Other link layer frames
// ============================================================================

/// Raw Ethernet frame.
pub fn ethernet_frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: EthernetAddress(WORKLOAD_MAC),
        dst_addr: EthernetAddress(HOST_MAC),
        ethertype: EthernetProtocol::from(ethertype),
    };
    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer[..]);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}

pub fn arp_request(sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress(WORKLOAD_MAC),
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: target_ip,
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(WORKLOAD_MAC),
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::Arp,
    };

    let mut buffer = vec![0u8; eth_repr.buffer_len() + arp_repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer[..]);
    eth_repr.emit(&mut frame);
    let mut arp_packet = ArpPacket::new_unchecked(frame.payload_mut());
    arp_repr.emit(&mut arp_packet);
    buffer
}

/// IPv6 frame with an empty IPv6 header; only the ethertype matters.
pub fn ipv6_frame() -> Vec<u8> {
    let mut payload = [0u8; 48];
    payload[0] = 0x60;
    ethernet_frame(0x86dd, &payload)
}

// ============================================================================
// VXLAN
// ============================================================================

/// Wrap a frame in outer IPv4/UDP/VXLAN, UDP checksum zero.
pub fn vxlan_wrap(inner: &[u8], outer_src: Ipv4Addr, outer_dst: Ipv4Addr, vni: u32) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + 8 + inner.len();
    let mut frame = ipv4_frame(outer_src, outer_dst, IpProtocol::Udp, udp_len, |buf| {
        let mut udp = UdpPacket::new_unchecked(&mut buf[..]);
        udp.set_src_port(VXLAN_PORT);
        udp.set_dst_port(VXLAN_PORT);
        udp.set_len(udp_len as u16);
        udp.set_checksum(0);
        let vxlan = &mut buf[UDP_HDR_SIZE..];
        vxlan[0] = 0x08;
        vxlan[4..8].copy_from_slice(&(vni << 8).to_be_bytes());
        vxlan[8..].copy_from_slice(inner);
    });
    frame[..ETHERNET_HDR_SIZE].copy_from_slice(&inner[..ETHERNET_HDR_SIZE]);
    frame
}

/// Frame carried inside a VXLAN packet.
pub fn vxlan_inner(frame: &[u8]) -> &[u8] {
    &frame[ETHERNET_HDR_SIZE + IP_HDR_SIZE + UDP_HDR_SIZE + 8..]
}

// ============================================================================
// Inspection
// ============================================================================

pub fn ip_packet(frame: &[u8]) -> Ipv4Packet<&[u8]> {
    let eth = EthernetFrame::new_checked(frame).expect("Ethernet frame");
    assert_eq!(eth.ethertype(), EthernetProtocol::Ipv4);
    Ipv4Packet::new_checked(&frame[ETHERNET_HDR_SIZE..]).expect("IPv4 packet")
}

/// Transport ports of a TCP or UDP frame.
pub fn ports(frame: &[u8]) -> (u16, u16) {
    let ip = ip_packet(frame);
    let l4 = ip.payload();
    (
        u16::from_be_bytes([l4[0], l4[1]]),
        u16::from_be_bytes([l4[2], l4[3]]),
    )
}

/// Whether the IPv4 and transport checksums of a frame verify.
pub fn checksums_valid(frame: &[u8]) -> bool {
    let ip = ip_packet(frame);
    if !ip.verify_checksum() {
        return false;
    }
    let src = IpAddress::Ipv4(ip.src_addr());
    let dst = IpAddress::Ipv4(ip.dst_addr());
    match ip.next_header() {
        IpProtocol::Tcp => TcpPacket::new_checked(ip.payload())
            .map(|tcp| tcp.verify_checksum(&src, &dst))
            .unwrap_or(false),
        IpProtocol::Udp => UdpPacket::new_checked(ip.payload())
            .map(|udp| udp.checksum() == 0 || udp.verify_checksum(&src, &dst))
            .unwrap_or(false),
        IpProtocol::Icmp => Icmpv4Packet::new_checked(ip.payload())
            .map(|icmp| icmp.verify_checksum())
            .unwrap_or(false),
        _ => true,
    }
}
