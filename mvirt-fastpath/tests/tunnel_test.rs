//! Node port forwarding through the VXLAN tunnel.
//!
//! Two nodes sharing the service tables: node A receives node port traffic
//! and forwards it to node B, where the backend lives. The reply goes back
//! through A, which answers the client from its own address.

mod common;

use mvirt_fastpath::icmp::{ICMP_DEST_UNREACH, ICMP_FRAG_NEEDED};
use mvirt_fastpath::nat::{NatDest, NatFrontendKey};
use mvirt_fastpath::skb::IPPROTO_UDP;
use mvirt_fastpath::test_util::*;
use mvirt_fastpath::{Action, FastPath, Hook, Reason, SkBuff, Verdict, marks};
use smoltcp::wire::IpProtocol;
use std::net::Ipv4Addr;

const BACKEND: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 9);
const BACKEND_IF: u32 = 9;
const CLIENT: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);
const NODE_PORT: u16 = 30080;
const VNI: u32 = 0xca11c0;

fn add_node_port(node: &TestNode) {
    node.add_service(
        NatFrontendKey::nodeport(NODE_PORT, IPPROTO_UDP),
        7,
        &[NatDest::new(BACKEND, 8080)],
    );
}

/// The node receiving node port traffic.
fn node_a() -> TestNode {
    common::init_tracing();
    let node = TestNode::new(HOST_IP, &[PEER_IP]);
    node.add_remote_workload(BACKEND, PEER_IP);
    add_node_port(&node);
    node
}

/// The node hosting the backend, knowing `peers`.
fn node_b(peers: &[Ipv4Addr]) -> TestNode {
    let node = TestNode::new(PEER_IP, peers);
    node.add_local_workload(BACKEND, BACKEND_IF);
    add_node_port(&node);
    node
}

fn request(payload: &[u8]) -> Vec<u8> {
    udp_frame(CLIENT, 5555, HOST_IP, NODE_PORT, payload)
}

/// Forward a request from A to B, returning B's verdict and the frame it
/// delivers towards the backend.
fn forward(a: &FastPath, b: &FastPath, frame: Vec<u8>) -> (Verdict, Vec<u8>) {
    let (verdict, wrapped) = run(a, frame, HOST_IFINDEX);
    assert_eq!(verdict.action, Action::Unspec, "node A verdict {verdict:?}");
    assert_eq!(verdict.mark, marks::SKIP_RPF);
    run(b, wrapped, HOST_IFINDEX)
}

#[test]
fn test_node_port_round_trip() {
    let a = node_a();
    let b = node_b(&[HOST_IP]);
    let a_from_hep = a.fast_path(Hook::FromHost);
    let b_from_hep = b.fast_path(Hook::FromHost);

    // A forwards the untranslated request to B
    let (verdict, wrapped) = run(&a_from_hep, request(b"question"), HOST_IFINDEX);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(verdict.mark, marks::SKIP_RPF);
    let outer = ip_packet(&wrapped);
    assert_eq!(outer.src_addr(), HOST_IP);
    assert_eq!(outer.dst_addr(), PEER_IP);
    assert_eq!(ports(&wrapped), (4789, 4789));
    assert!(checksums_valid(&wrapped));
    let inner = vxlan_inner(&wrapped);
    assert_eq!(ip_packet(inner).src_addr(), CLIENT);
    assert_eq!(ip_packet(inner).dst_addr(), HOST_IP);
    assert_eq!(ip_packet(inner).hop_limit(), 63);
    assert_eq!(ports(inner), (5555, NODE_PORT));
    assert!(checksums_valid(inner));
    assert_eq!(a.maps.conntrack.len(), 2);

    // B decapsulates and translates to the local backend
    let (verdict, delivered) = run(&b_from_hep, wrapped, HOST_IFINDEX);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(verdict.mark, marks::SEEN);
    let ip = ip_packet(&delivered);
    assert_eq!(ip.src_addr(), CLIENT);
    assert_eq!(ip.dst_addr(), BACKEND);
    assert_eq!(ports(&delivered), (5555, 8080));
    assert!(checksums_valid(&delivered));

    let skb = SkBuff::new(delivered, BACKEND_IF).with_mark(verdict.mark);
    let (verdict, _) = run_skb(&b.fast_path(Hook::ToWorkload), skb);
    assert_eq!(verdict.action, Action::Unspec);

    // the reply returns to A, sourced from the node port
    let reply = udp_frame(BACKEND, 8080, CLIENT, 5555, b"answer");
    let (verdict, wrapped) = run(&b.fast_path(Hook::FromWorkload), reply, BACKEND_IF);
    assert_eq!(verdict.redirect_ifindex(), Some(HOST_IFINDEX));
    assert_eq!(verdict.mark, marks::BYPASS_FWD_SRC_FIXUP);
    assert_eq!(ip_packet(&wrapped).dst_addr(), HOST_IP);
    let inner = vxlan_inner(&wrapped);
    assert_eq!(ip_packet(inner).src_addr(), HOST_IP);
    assert_eq!(ip_packet(inner).dst_addr(), CLIENT);
    assert_eq!(ports(inner), (NODE_PORT, 5555));

    // leaving B the outer source is fixed up to B's address
    let skb = SkBuff::new(wrapped, HOST_IFINDEX).with_mark(verdict.mark);
    let (verdict, wrapped) = run_skb(&b.fast_path(Hook::ToHost), skb);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(verdict.reason, Reason::Bypass);
    assert_eq!(ip_packet(&wrapped).src_addr(), PEER_IP);
    assert!(checksums_valid(&wrapped));

    // A decapsulates and lets the reply through untouched
    let (verdict, answer) = run(&a_from_hep, wrapped, HOST_IFINDEX);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(verdict.mark, marks::BYPASS_FWD);
    let ip = ip_packet(&answer);
    assert_eq!(ip.src_addr(), HOST_IP);
    assert_eq!(ip.dst_addr(), CLIENT);
    assert_eq!(ports(&answer), (NODE_PORT, 5555));
    assert!(checksums_valid(&answer));
}

#[test]
fn test_later_requests_follow_conntrack() {
    let a = node_a();
    let b = node_b(&[HOST_IP]);
    let a_from_hep = a.fast_path(Hook::FromHost);
    let b_from_hep = b.fast_path(Hook::FromHost);

    // new flows are left to the stack for its RPF check
    let (verdict, first) = forward(&a_from_hep, &b_from_hep, request(b"one"));
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(ip_packet(&first).dst_addr(), BACKEND);

    // established ones go straight to the backend
    let (verdict, second) = forward(&a_from_hep, &b_from_hep, request(b"two"));
    assert_eq!(verdict.redirect_ifindex(), Some(BACKEND_IF));
    assert_eq!(verdict.mark, marks::SEEN);
    let ip = ip_packet(&second);
    assert_eq!(ip.dst_addr(), BACKEND);
    assert_eq!(ip.hop_limit(), 62);
    assert_eq!(ports(&second), (5555, 8080));
    assert!(checksums_valid(&second));
    assert_eq!(second[..6], workload_mac(BACKEND));
    assert_eq!(a.maps.conntrack.len(), 2);
    assert_eq!(b.maps.conntrack.len(), 2);
}

#[test]
fn test_too_big_for_tunnel() {
    let a = node_a();
    let fp = a.fast_path(Hook::FromHost);
    let frame = request(&[0u8; 1500]);

    let (verdict, reply) = run(&fp, frame.clone(), HOST_IFINDEX);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(verdict.mark, marks::BYPASS_FWD);
    let ip = ip_packet(&reply);
    assert_eq!(ip.next_header(), IpProtocol::Icmp);
    assert_eq!(ip.src_addr(), HOST_IP);
    assert_eq!(ip.dst_addr(), CLIENT);
    let icmp = ip.payload();
    assert_eq!((icmp[0], icmp[1]), (ICMP_DEST_UNREACH, ICMP_FRAG_NEEDED));
    assert_eq!(icmp[6..8], 1450u16.to_be_bytes());
    assert!(checksums_valid(&reply));

    // without DF the packet is encapsulated anyway
    let mut frame = request(&[0u8; 1500]);
    clear_dont_frag(&mut frame);
    let (verdict, wrapped) = run(&fp, frame.clone(), HOST_IFINDEX);
    assert_eq!(verdict.mark, marks::SKIP_RPF);
    assert_eq!(wrapped.len(), frame.len() + 50);
    assert_eq!(ip_packet(&wrapped).dst_addr(), PEER_IP);
}

#[test]
fn test_reply_too_big_for_tunnel() {
    let a = node_a();
    let b = node_b(&[HOST_IP]);
    let (verdict, delivered) = forward(
        &a.fast_path(Hook::FromHost),
        &b.fast_path(Hook::FromHost),
        request(b"question"),
    );
    let skb = SkBuff::new(delivered, BACKEND_IF).with_mark(verdict.mark);
    let (verdict, _) = run_skb(&b.fast_path(Hook::ToWorkload), skb);
    assert_eq!(verdict.action, Action::Unspec);

    let reply = udp_frame(BACKEND, 8080, CLIENT, 5555, &[0u8; 1500]);
    let (verdict, error) = run(&b.fast_path(Hook::FromWorkload), reply.clone(), BACKEND_IF);
    // sent back to the backend, not through the tunnel
    assert_eq!(verdict.redirect_ifindex(), Some(BACKEND_IF));
    assert_eq!(verdict.mark, marks::BYPASS_FWD);

    let ip = ip_packet(&error);
    assert_eq!(ip.next_header(), IpProtocol::Icmp);
    assert_eq!(ip.src_addr(), PEER_IP);
    assert_eq!(ip.dst_addr(), BACKEND);
    let icmp = ip.payload();
    assert_eq!((icmp[0], icmp[1]), (ICMP_DEST_UNREACH, ICMP_FRAG_NEEDED));
    assert_eq!(icmp[6..8], 1450u16.to_be_bytes());
    assert_eq!(icmp[8..], icmp_quote(&reply)[..]);
    assert!(checksums_valid(&error));
    assert_eq!(b.maps.conntrack.len(), 2);
}

#[test]
fn test_vxlan_sources() {
    let a = node_a();
    let fp = a.fast_path(Hook::FromHost);
    let inner = udp_frame(BACKEND, 8080, CLIENT, 5555, b"x");

    // another overlay between cluster hosts
    let frame = vxlan_wrap(&inner, PEER_IP, HOST_IP, 42);
    let (verdict, out) = run(&fp, frame.clone(), HOST_IFINDEX);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(out, frame);
    assert!(a.maps.conntrack.is_empty());

    // our overlay from outside the cluster
    let stranger = Ipv4Addr::new(198, 51, 100, 1);
    let frame = vxlan_wrap(&inner, stranger, HOST_IP, VNI);
    let (verdict, _) = run(&fp, frame, HOST_IFINDEX);
    assert!(verdict.is_drop());
    assert_eq!(verdict.reason, Reason::UnauthSource);
}

#[test]
fn test_tunnel_source_change() {
    common::init_tracing();
    let third = Ipv4Addr::new(192, 168, 0, 3);
    let b = node_b(&[HOST_IP, third]);
    let fp = b.fast_path(Hook::FromHost);
    let inner = request(b"question");

    let (verdict, delivered) = run(&fp, vxlan_wrap(&inner, HOST_IP, PEER_IP, VNI), HOST_IFINDEX);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(ip_packet(&delivered).dst_addr(), BACKEND);

    // same flow, different forwarding node
    let (verdict, _) = run(&fp, vxlan_wrap(&inner, third, PEER_IP, VNI), HOST_IFINDEX);
    assert!(verdict.is_drop());
    assert_eq!(verdict.reason, Reason::UnauthSource);
}

#[test]
fn test_tunneled_flow_needs_local_backend() {
    common::init_tracing();
    let b = TestNode::new(PEER_IP, &[HOST_IP]);
    // the backend is not on this node either
    b.add_remote_workload(BACKEND, Ipv4Addr::new(192, 168, 0, 3));
    add_node_port(&b);

    let frame = vxlan_wrap(&request(b"question"), HOST_IP, PEER_IP, VNI);
    let (verdict, _) = run(&b.fast_path(Hook::FromHost), frame, HOST_IFINDEX);
    assert!(verdict.is_drop());
    assert_eq!(verdict.reason, Reason::UnauthSource);
    assert!(b.maps.conntrack.is_empty());
}
