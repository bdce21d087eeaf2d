//! Policy integration tests.
//!
//! Admission of new flows through the policy slot, the pipeline's own
//! shortcuts around it and the handling of a broken jump table.

mod common;

use mvirt_fastpath::config::EndpointToHostAction;
use mvirt_fastpath::failsafe::FailsafeDirection;
use mvirt_fastpath::nat::{NatDest, SocketNatKey};
use mvirt_fastpath::skb::{IPPROTO_TCP, IPPROTO_UDP};
use mvirt_fastpath::test_util::*;
use mvirt_fastpath::{
    Action, AllowAll, DenyAll, Hook, JumpTarget, PolicyResult, ProgIndex, Reason, SkBuff, TcState,
};
use std::net::Ipv4Addr;

const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);
const EXTERNAL: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);
const CLIENT_IF: u32 = 5;
const SERVER_IF: u32 = 9;

fn node() -> TestNode {
    common::init_tracing();
    let node = TestNode::local();
    node.add_local_workload(CLIENT, CLIENT_IF);
    node.add_local_workload(SERVER, SERVER_IF);
    node
}

#[test]
fn test_deny_all_drops_new_flows() {
    let node = node();
    node.set_policy(DenyAll);

    let (verdict, _) = run(
        &node.fast_path(Hook::FromWorkload),
        tcp_syn(CLIENT, 4000, SERVER, 443),
        CLIENT_IF,
    );
    assert!(verdict.is_drop());
    assert!(node.maps.conntrack.is_empty());
}

#[test]
fn test_policy_sees_the_flow() {
    let node = node();
    node.set_policy(|state: &TcState| {
        if state.ip_proto == IPPROTO_TCP && state.dport == 443 {
            PolicyResult::Allow
        } else {
            PolicyResult::Deny
        }
    });
    let fp = node.fast_path(Hook::FromWorkload);

    let (verdict, out) = run(&fp, tcp_syn(CLIENT, 4000, SERVER, 443), CLIENT_IF);
    assert_eq!(verdict.redirect_ifindex(), Some(SERVER_IF));
    assert_eq!(ip_packet(&out).hop_limit(), 63);
    assert!(checksums_valid(&out));
    assert_eq!(node.maps.conntrack.len(), 1);

    let (verdict, _) = run(&fp, tcp_syn(CLIENT, 4001, SERVER, 80), CLIENT_IF);
    assert!(verdict.is_drop());
    assert_eq!(node.maps.conntrack.len(), 1);
}

#[test]
fn test_no_match_is_a_deny() {
    let node = node();
    node.set_policy(|_: &TcState| PolicyResult::NoMatch);

    let (verdict, _) = run(
        &node.fast_path(Hook::FromWorkload),
        udp_frame(CLIENT, 5353, SERVER, 53, b"q"),
        CLIENT_IF,
    );
    assert!(verdict.is_drop());
    assert!(node.maps.conntrack.is_empty());
}

#[test]
fn test_missing_policy() {
    let node = node();
    node.jumps.clear(ProgIndex::Policy);

    // workloads get nothing until their policy is installed
    let (verdict, _) = run(
        &node.fast_path(Hook::FromWorkload),
        tcp_syn(CLIENT, 4000, SERVER, 443),
        CLIENT_IF,
    );
    assert!(verdict.is_drop());

    // host interfaces stay usable
    let (verdict, _) = run(
        &node.fast_path(Hook::FromHost),
        udp_frame(EXTERNAL, 5353, HOST_IP, 8080, b"q"),
        HOST_IFINDEX,
    );
    assert_eq!(verdict.action, Action::Unspec);
    assert_eq!(node.maps.conntrack.len(), 1);
}

#[test]
fn test_missing_accept_slot_drops() {
    let node = node();
    node.jumps.clear(ProgIndex::Allowed);

    let (verdict, _) = run(
        &node.fast_path(Hook::FromWorkload),
        tcp_syn(CLIENT, 4000, SERVER, 443),
        CLIENT_IF,
    );
    assert!(verdict.is_drop());
    assert!(node.maps.conntrack.is_empty());
}

#[test]
fn test_jump_loop_is_bounded() {
    let node = node();
    node.jumps.set(ProgIndex::Allowed, JumpTarget::Policy(std::sync::Arc::new(AllowAll)));

    let (verdict, _) = run(
        &node.fast_path(Hook::FromWorkload),
        tcp_syn(CLIENT, 4000, SERVER, 443),
        CLIENT_IF,
    );
    assert!(verdict.is_drop());
}

#[test]
fn test_established_flow_skips_policy() {
    let node = node();
    let from_wep = node.fast_path(Hook::FromWorkload);
    let to_wep = node.fast_path(Hook::ToWorkload);

    let (verdict, out) = run(&from_wep, udp_frame(CLIENT, 5353, SERVER, 53, b"q"), CLIENT_IF);
    assert_eq!(verdict.redirect_ifindex(), Some(SERVER_IF));
    let (verdict, _) = run_skb(&to_wep, SkBuff::new(out, SERVER_IF).with_mark(verdict.mark));
    assert_eq!(verdict.action, Action::Unspec);

    node.set_policy(DenyAll);

    let (verdict, _) = run(&from_wep, udp_frame(SERVER, 53, CLIENT, 5353, b"a"), SERVER_IF);
    assert_eq!(verdict.redirect_ifindex(), Some(CLIENT_IF));

    let (verdict, _) = run(&from_wep, udp_frame(CLIENT, 5353, SERVER, 53, b"q2"), CLIENT_IF);
    assert_eq!(verdict.redirect_ifindex(), Some(SERVER_IF));

    // a different flow is subject to the new policy
    let (verdict, _) = run(&from_wep, udp_frame(CLIENT, 5354, SERVER, 53, b"q"), CLIENT_IF);
    assert!(verdict.is_drop());
}

#[test]
fn test_host_to_workload_skips_policy() {
    let node = node();
    node.set_policy(DenyAll);

    let (verdict, _) = run(
        &node.fast_path(Hook::ToWorkload),
        tcp_syn(HOST_IP, 40000, SERVER, 443),
        SERVER_IF,
    );
    assert_eq!(verdict.action, Action::Unspec);
}

#[test]
fn test_failsafe_ports() {
    let node = node();
    node.set_policy(DenyAll);
    node.maps
        .failsafe
        .add(FailsafeDirection::Inbound, IPPROTO_TCP, 22, "0.0.0.0/0".parse().unwrap());
    node.maps
        .failsafe
        .add(FailsafeDirection::Outbound, IPPROTO_UDP, 53, "198.51.100.0/24".parse().unwrap());

    let from_hep = node.fast_path(Hook::FromHost);
    let (verdict, _) = run(&from_hep, tcp_syn(EXTERNAL, 50000, HOST_IP, 22), HOST_IFINDEX);
    assert_eq!(verdict.action, Action::Unspec);

    let (verdict, _) = run(&from_hep, tcp_syn(EXTERNAL, 50000, HOST_IP, 23), HOST_IFINDEX);
    assert!(verdict.is_drop());

    let to_hep = node.fast_path(Hook::ToHost);
    let resolver = Ipv4Addr::new(198, 51, 100, 53);
    let (verdict, _) = run(&to_hep, udp_frame(HOST_IP, 40000, resolver, 53, b"q"), HOST_IFINDEX);
    assert_eq!(verdict.action, Action::Unspec);

    let (verdict, _) = run(&to_hep, udp_frame(HOST_IP, 40000, EXTERNAL, 53, b"q"), HOST_IFINDEX);
    assert!(verdict.is_drop());
}

#[test]
fn test_endpoint_to_host_drop() {
    let node = node();
    let frame = tcp_syn(CLIENT, 4000, HOST_IP, 22);

    let (verdict, _) = run(&node.fast_path(Hook::FromWorkload), frame.clone(), CLIENT_IF);
    assert_eq!(verdict.action, Action::Unspec);

    let mut config = node.config(Hook::FromWorkload);
    config.endpoint_to_host_action = EndpointToHostAction::Drop;
    let (verdict, _) = run(
        &node.fast_path_with(config),
        tcp_syn(CLIENT, 4001, HOST_IP, 22),
        CLIENT_IF,
    );
    assert!(verdict.is_drop());
}

#[test]
fn test_socket_nat_restores_original_destination() {
    let node = node();
    let vip = Ipv4Addr::new(10, 96, 0, 1);
    let backend = Ipv4Addr::new(10, 0, 1, 9);
    node.add_remote_workload(backend, PEER_IP);
    node.set_policy(move |state: &TcState| {
        if state.pre_nat_ip_dst == vip && state.pre_nat_dport == 80 {
            PolicyResult::Allow
        } else {
            PolicyResult::Deny
        }
    });
    node.maps.ct_nats.insert(
        SocketNatKey {
            cookie: 77,
            proto: IPPROTO_TCP,
            addr: backend,
            port: 8080,
        },
        NatDest::new(vip, 80),
    );
    let to_hep = node.fast_path(Hook::ToHost);

    let skb =
        SkBuff::new(tcp_syn(HOST_IP, 40000, backend, 8080), HOST_IFINDEX).with_socket_cookie(77);
    let (verdict, _) = run_skb(&to_hep, skb);
    assert_eq!(verdict.action, Action::Unspec);

    // another socket connecting to the backend directly
    let skb =
        SkBuff::new(tcp_syn(HOST_IP, 40001, backend, 8080), HOST_IFINDEX).with_socket_cookie(78);
    let (verdict, _) = run_skb(&to_hep, skb);
    assert!(verdict.is_drop());
}

#[test]
fn test_spoofed_workload_source() {
    let node = node();
    let from_wep = node.fast_path(Hook::FromWorkload);

    let spoofed = Ipv4Addr::new(10, 0, 0, 77);
    let (verdict, _) = run(&from_wep, tcp_syn(spoofed, 4000, SERVER, 443), CLIENT_IF);
    assert_eq!(verdict.reason, Reason::UnauthSource);

    // right address, wrong interface
    let (verdict, _) = run(&from_wep, tcp_syn(CLIENT, 4000, SERVER, 443), 6);
    assert_eq!(verdict.reason, Reason::UnauthSource);
    assert!(verdict.is_drop());

    // host addresses are not workloads
    let (verdict, _) = run(&from_wep, tcp_syn(HOST_IP, 4000, SERVER, 443), CLIENT_IF);
    assert_eq!(verdict.reason, Reason::UnauthSource);
    assert!(node.maps.conntrack.is_empty());
}
