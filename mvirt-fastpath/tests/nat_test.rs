//! Service NAT integration tests.
//!
//! Flows between workloads of one node through a service address, with
//! every hook a packet crosses run in order on the shared tables.

mod common;

use mvirt_fastpath::icmp::{ICMP_DEST_UNREACH, ICMP_PORT_UNREACH, ICMP_TIME_EXCEEDED};
use mvirt_fastpath::nat::{NatDest, NatFrontendKey};
use mvirt_fastpath::skb::{IPPROTO_TCP, IPPROTO_UDP};
use mvirt_fastpath::test_util::*;
use mvirt_fastpath::{Action, FastPath, Hook, Reason, SkBuff, marks};
use smoltcp::wire::{IpProtocol, Ipv4Packet};
use std::net::Ipv4Addr;

const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const BACKEND: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);
const VIP: Ipv4Addr = Ipv4Addr::new(10, 96, 0, 1);
const CLIENT_IF: u32 = 5;
const BACKEND_IF: u32 = 9;

struct Hooks {
    node: TestNode,
    from_wep: FastPath,
    to_wep: FastPath,
}

fn setup(proto: u8) -> Hooks {
    common::init_tracing();
    let node = TestNode::local();
    node.add_local_workload(CLIENT, CLIENT_IF);
    node.add_local_workload(BACKEND, BACKEND_IF);
    node.add_service(NatFrontendKey::new(VIP, 80, proto), 1, &[NatDest::new(BACKEND, 8080)]);
    Hooks {
        from_wep: node.fast_path(Hook::FromWorkload),
        to_wep: node.fast_path(Hook::ToWorkload),
        node,
    }
}

/// Deliver a redirected frame through the egress hook of `ifindex`.
fn deliver(to_wep: &FastPath, frame: Vec<u8>, ifindex: u32, mark: u32) -> Vec<u8> {
    let (verdict, out) = run_skb(to_wep, SkBuff::new(frame, ifindex).with_mark(mark));
    assert_eq!(verdict.action, Action::Unspec, "egress verdict {verdict:?}");
    out
}

#[test]
fn test_tcp_round_trip_through_service() {
    let hooks = setup(IPPROTO_TCP);

    // client -> service
    let (verdict, request) = run(&hooks.from_wep, tcp_syn(CLIENT, 4000, VIP, 80), CLIENT_IF);
    assert_eq!(verdict.redirect_ifindex(), Some(BACKEND_IF));
    assert_eq!(verdict.mark, marks::SEEN);
    let ip = ip_packet(&request);
    assert_eq!(ip.src_addr(), CLIENT);
    assert_eq!(ip.dst_addr(), BACKEND);
    assert_eq!(ip.hop_limit(), 63);
    assert_eq!(ports(&request), (4000, 8080));
    assert!(checksums_valid(&request));
    assert_eq!(request[..6], workload_mac(BACKEND));
    assert_eq!(request[6..12], HOST_MAC);
    assert_eq!(hooks.node.maps.conntrack.len(), 2);

    let request = deliver(&hooks.to_wep, request, BACKEND_IF, verdict.mark);
    assert_eq!(ports(&request), (4000, 8080));

    // backend -> client appears to come from the service
    let (verdict, reply) = run(
        &hooks.from_wep,
        tcp_frame(BACKEND, 8080, CLIENT, 4000, true, true),
        BACKEND_IF,
    );
    assert_eq!(verdict.redirect_ifindex(), Some(CLIENT_IF));
    let ip = ip_packet(&reply);
    assert_eq!(ip.src_addr(), VIP);
    assert_eq!(ip.dst_addr(), CLIENT);
    assert_eq!(ports(&reply), (80, 4000));
    assert!(checksums_valid(&reply));
    deliver(&hooks.to_wep, reply, CLIENT_IF, verdict.mark);

    // later packets of the flow are translated from conntrack
    let (verdict, request) = run(&hooks.from_wep, tcp_ack(CLIENT, 4000, VIP, 80), CLIENT_IF);
    assert_eq!(verdict.redirect_ifindex(), Some(BACKEND_IF));
    assert_eq!(ip_packet(&request).dst_addr(), BACKEND);
    assert_eq!(ports(&request), (4000, 8080));
    assert!(checksums_valid(&request));
    assert_eq!(hooks.node.maps.conntrack.len(), 2);
}

#[test]
fn test_udp_round_trip_through_service() {
    let hooks = setup(IPPROTO_UDP);

    let (verdict, request) = run(
        &hooks.from_wep,
        udp_frame(CLIENT, 5353, VIP, 80, b"question"),
        CLIENT_IF,
    );
    assert_eq!(verdict.redirect_ifindex(), Some(BACKEND_IF));
    assert_eq!(ip_packet(&request).dst_addr(), BACKEND);
    assert_eq!(ports(&request), (5353, 8080));
    assert!(checksums_valid(&request));
    deliver(&hooks.to_wep, request, BACKEND_IF, verdict.mark);

    let (verdict, reply) = run(
        &hooks.from_wep,
        udp_frame(BACKEND, 8080, CLIENT, 5353, b"answer"),
        BACKEND_IF,
    );
    assert_eq!(verdict.redirect_ifindex(), Some(CLIENT_IF));
    assert_eq!(ip_packet(&reply).src_addr(), VIP);
    assert_eq!(ports(&reply), (80, 5353));
    assert!(checksums_valid(&reply));
}

#[test]
fn test_reply_without_egress_approval_needs_policy() {
    let hooks = setup(IPPROTO_UDP);
    let (_, request) = run(&hooks.from_wep, udp_frame(CLIENT, 5353, VIP, 80, b"q"), CLIENT_IF);
    assert_eq!(ip_packet(&request).dst_addr(), BACKEND);

    // the backend's side never approved the flow
    hooks.node.set_policy(mvirt_fastpath::DenyAll);
    let (verdict, _) = run(
        &hooks.from_wep,
        udp_frame(BACKEND, 8080, CLIENT, 5353, b"a"),
        BACKEND_IF,
    );
    assert!(verdict.is_drop());
}

#[test]
fn test_no_backend_replies_port_unreachable() {
    common::init_tracing();
    let node = TestNode::local();
    node.add_local_workload(CLIENT, CLIENT_IF);
    node.add_service(NatFrontendKey::new(VIP, 53, IPPROTO_UDP), 2, &[]);

    let request = udp_frame(CLIENT, 5353, VIP, 53, b"question");
    let (verdict, reply) = run(&node.fast_path(Hook::FromWorkload), request.clone(), CLIENT_IF);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(verdict.mark, marks::BYPASS_FWD);

    let ip = ip_packet(&reply);
    assert_eq!(ip.next_header(), IpProtocol::Icmp);
    assert_eq!(ip.src_addr(), HOST_IP);
    assert_eq!(ip.dst_addr(), CLIENT);
    assert!(checksums_valid(&reply));
    let icmp = ip.payload();
    assert_eq!((icmp[0], icmp[1]), (ICMP_DEST_UNREACH, ICMP_PORT_UNREACH));
    assert_eq!(icmp[8..], icmp_quote(&request)[..]);
    assert!(node.maps.conntrack.is_empty());
}

#[test]
fn test_ttl_expiring_at_nat_replies_time_exceeded() {
    let hooks = setup(IPPROTO_UDP);
    let mut request = udp_frame(CLIENT, 5353, VIP, 80, b"question");
    set_ttl(&mut request, 1);

    let (verdict, reply) = run(&hooks.from_wep, request.clone(), CLIENT_IF);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(verdict.mark, marks::BYPASS_FWD);

    let ip = ip_packet(&reply);
    assert_eq!(ip.next_header(), IpProtocol::Icmp);
    assert_eq!(ip.dst_addr(), CLIENT);
    assert_eq!(ip.payload()[0], ICMP_TIME_EXCEEDED);
    assert_eq!(ip.payload()[1], 0);
    assert!(checksums_valid(&reply));
    // quotes the untranslated packet
    assert_eq!(ip.payload()[8..], icmp_quote(&request)[..]);
    // nothing was forwarded, nothing tracked
    assert!(hooks.node.maps.conntrack.is_empty());
}

/// `reply` is a single time exceeded error to `to` quoting `original`.
fn assert_time_exceeded(reply: &[u8], to: Ipv4Addr, original: &[u8]) {
    let ip = ip_packet(reply);
    assert_eq!(ip.next_header(), IpProtocol::Icmp);
    assert_eq!(ip.src_addr(), HOST_IP);
    assert_eq!(ip.dst_addr(), to);
    assert_eq!((ip.payload()[0], ip.payload()[1]), (ICMP_TIME_EXCEEDED, 0));
    assert_eq!(ip.payload()[8..], icmp_quote(original)[..]);
    assert!(checksums_valid(reply));
}

#[test]
fn test_ttl_expiring_on_established_dnat_flow() {
    let hooks = setup(IPPROTO_UDP);
    let (verdict, request) = run(
        &hooks.from_wep,
        udp_frame(CLIENT, 5353, VIP, 80, b"one"),
        CLIENT_IF,
    );
    deliver(&hooks.to_wep, request, BACKEND_IF, verdict.mark);

    let mut request = udp_frame(CLIENT, 5353, VIP, 80, b"two");
    set_ttl(&mut request, 1);
    let (verdict, reply) = run(&hooks.from_wep, request.clone(), CLIENT_IF);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(verdict.redirect_ifindex(), None);
    assert_eq!(verdict.mark, marks::BYPASS_FWD);
    assert_time_exceeded(&reply, CLIENT, &request);
    assert_eq!(hooks.node.maps.conntrack.len(), 2);
}

#[test]
fn test_ttl_expiring_on_snat_reply() {
    let hooks = setup(IPPROTO_UDP);
    let (verdict, request) = run(
        &hooks.from_wep,
        udp_frame(CLIENT, 5353, VIP, 80, b"question"),
        CLIENT_IF,
    );
    deliver(&hooks.to_wep, request, BACKEND_IF, verdict.mark);

    let mut reply = udp_frame(BACKEND, 8080, CLIENT, 5353, b"answer");
    set_ttl(&mut reply, 1);
    let (verdict, error) = run(&hooks.from_wep, reply.clone(), BACKEND_IF);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(verdict.redirect_ifindex(), None);
    assert_eq!(verdict.mark, marks::BYPASS_FWD);
    // quotes the reply before un-NAT
    assert_time_exceeded(&error, BACKEND, &reply);
    assert_eq!(hooks.node.maps.conntrack.len(), 2);
}

#[test]
fn test_ttl_expiring_on_fragment_is_dropped() {
    let hooks = setup(IPPROTO_UDP);
    let mut request = udp_frame(CLIENT, 5353, VIP, 80, b"question");
    set_frag_offset(&mut request, 1480);
    set_ttl(&mut request, 1);

    let (verdict, _) = run(&hooks.from_wep, request, CLIENT_IF);
    assert!(verdict.is_drop());
}

#[test]
fn test_ttl_expiring_without_nat_is_left_to_the_stack() {
    let hooks = setup(IPPROTO_UDP);
    let mut request = udp_frame(CLIENT, 5353, BACKEND, 8080, b"question");
    set_ttl(&mut request, 1);

    let (verdict, out) = run(&hooks.from_wep, request.clone(), CLIENT_IF);
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(out, request);
}

#[test]
fn test_related_icmp_error_is_untranslated() {
    let hooks = setup(IPPROTO_UDP);
    let (_, request) = run(
        &hooks.from_wep,
        udp_frame(CLIENT, 5353, VIP, 80, b"question"),
        CLIENT_IF,
    );

    // the backend reports the translated request as unreachable
    let error = icmp_error(
        BACKEND,
        CLIENT,
        ICMP_DEST_UNREACH,
        ICMP_PORT_UNREACH,
        &icmp_quote(&request),
    );
    let (verdict, out) = run(&hooks.from_wep, error, BACKEND_IF);
    assert!(!verdict.is_drop());
    assert!(checksums_valid(&out));

    let ip = ip_packet(&out);
    assert_eq!(ip.dst_addr(), CLIENT);
    let quoted = &ip.payload()[8..];
    let inner = Ipv4Packet::new_unchecked(quoted);
    assert!(inner.verify_checksum());
    assert_eq!(inner.src_addr(), CLIENT);
    assert_eq!(inner.dst_addr(), VIP);
    let l4 = &quoted[IP_HDR_SIZE..];
    assert_eq!(u16::from_be_bytes([l4[0], l4[1]]), 5353);
    assert_eq!(u16::from_be_bytes([l4[2], l4[3]]), 80);
}

#[test]
fn test_service_source_ranges() {
    common::init_tracing();
    let node = TestNode::local();
    node.add_local_workload(CLIENT, CLIENT_IF);
    node.add_local_workload(BACKEND, BACKEND_IF);
    node.maps.nat.set_service(
        NatFrontendKey::new(VIP, 80, IPPROTO_TCP),
        3,
        &[NatDest::new(BACKEND, 8080)],
        vec!["10.1.0.0/16".parse().unwrap()],
    );

    let (verdict, _) = run(
        &node.fast_path(Hook::FromWorkload),
        tcp_syn(CLIENT, 4000, VIP, 80),
        CLIENT_IF,
    );
    assert!(verdict.is_drop());
    assert_eq!(verdict.reason, Reason::UnauthSource);
}
