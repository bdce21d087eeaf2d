//! The packet pipeline.
//!
//! [`FastPath::process`] runs the main entry point and then follows the
//! hops it requests through the jump table until a verdict is produced:
//!
//! ```text
//! main --Policy--> policy program --Allowed--> accept --+--> verdict
//!   |                                                    |
//!   +-----------------------Icmp-------------------------+--> icmp reply --> verdict
//! ```
//!
//! Each hop starts from the scratch state handed over by the previous one;
//! nothing else survives between hops.

use crate::config::FastPathConfig;
use crate::conntrack::{
    CT_INVALID_IFINDEX, CtCreate, CtFlags, CtLookup, CtResult, CtResultCode, InnerTuple,
    monotonic_ns,
};
use crate::ctx::TcCtx;
use crate::error::Reason;
use crate::fwd::{FibFlags, Fwd, FwdRes, Verdict, forward_or_drop};
use crate::icmp::{
    ICMP_DEST_UNREACH, ICMP_EXC_TTL, ICMP_FRAG_NEEDED, ICMP_PORT_UNREACH, ICMP_TIME_EXCEEDED,
    icmp_type_is_err, icmp_v4_reply, ip_ttl_exceeded,
};
use crate::jump::{JumpTable, JumpTarget, MAX_TAIL_CALLS, ProgIndex};
use crate::maps::Maps;
use crate::marks::{self, skb_seen};
use crate::nat::{NatDest, NatLookup, SocketNatKey};
use crate::parsing::{Parse, fill_from_iphdr, fill_from_nexthdr, parse_packet_ip};
use crate::routes::RouteFlags;
use crate::skb::{
    CsumField, ETH_ALEN, ICMP_CHECK, ICMP_HLEN, ICMP_SIZE, IPPROTO_ICMP, IPPROTO_TCP,
    IPPROTO_UDP, IPV4_HLEN, SkBuff, TCP_CHECK, TCP_SIZE, UDP_CHECK, UDP_SIZE, ipv4,
};
use crate::state::{PolicyResult, StateFlags, TcState};
use crate::vxlan::{Decap, is_vxlan_tunnel, vxlan_attempt_decap, vxlan_encap, vxlan_encap_too_big};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_ACK: u8 = 0x10;

/// What to do when a hop finds its jump slot empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JumpMiss {
    Deny,
    /// No policy installed yet: accept as if policy allowed
    AllowSkipPolicy,
}

/// Outcome of one pipeline hop.
enum Flow {
    Done(Verdict),
    TailCall {
        index: ProgIndex,
        state: TcState,
        on_miss: JumpMiss,
    },
}

/// Where the main entry point continues.
enum Stage {
    Finalize,
    SkipPolicy,
    Jump(ProgIndex, JumpMiss),
}

/// Outcome of the accept path.
enum Accepted {
    Fwd(Fwd),
    /// Reply with the ICMP error described in the state
    Icmp,
}

/// Forwarding decision accumulated by the accept path.
struct AcceptFwd {
    res: FwdRes,
    mark: u32,
    fib: bool,
}

impl AcceptFwd {
    fn allow(&self) -> Result<Accepted, Reason> {
        Ok(Accepted::Fwd(Fwd {
            res: self.res,
            mark: self.mark,
            fib: self.fib,
            ..Fwd::default()
        }))
    }
}

/// Checksum fields covering the header being translated.
struct NatCsums {
    l3: CsumField,
    l4: Option<CsumField>,
    port: Option<CsumField>,
}

impl NatCsums {
    fn rewrite_addr(&self, skb: &mut SkBuff, off: usize, new: Ipv4Addr) -> Result<(), Reason> {
        let res = match self.l4 {
            Some(l4) => skb.rewrite_addr(off, new, &[self.l3, l4]),
            None => skb.rewrite_addr(off, new, &[self.l3]),
        };
        res.map(|_| ()).map_err(|_| Reason::CsumFail)
    }

    fn rewrite_port(&self, skb: &mut SkBuff, off: usize, new: u16) -> Result<(), Reason> {
        let res = match self.port {
            Some(field) => skb.rewrite_be16(off, new, &[field]),
            None => skb.rewrite_be16(off, new, &[]),
        };
        res.map(|_| ()).map_err(|_| Reason::CsumFail)
    }
}

/// The pipeline of one hook.
pub struct FastPath {
    config: FastPathConfig,
    maps: Arc<Maps>,
    jumps: Arc<JumpTable>,
}

impl FastPath {
    pub fn new(config: FastPathConfig, maps: Arc<Maps>, jumps: Arc<JumpTable>) -> Self {
        Self {
            config,
            maps,
            jumps,
        }
    }

    pub fn config(&self) -> &FastPathConfig {
        &self.config
    }

    pub fn maps(&self) -> &Arc<Maps> {
        &self.maps
    }

    pub fn jumps(&self) -> &Arc<JumpTable> {
        &self.jumps
    }

    /// Process one packet to its verdict. The buffer is rewritten in place.
    pub fn process(&self, skb: &mut SkBuff) -> Verdict {
        let mut flow = self.calico_tc(skb);
        let mut hops = 0;
        loop {
            let (index, state, on_miss) = match flow {
                Flow::Done(verdict) => return verdict,
                Flow::TailCall {
                    index,
                    state,
                    on_miss,
                } => (index, state, on_miss),
            };

            hops += 1;
            if hops > MAX_TAIL_CALLS {
                warn!(hops, "Tail call limit reached: DROP");
                return Verdict::drop(Reason::Unknown);
            }

            flow = match self.jumps.get(index) {
                Some(JumpTarget::Policy(program)) => {
                    debug!("Entering policy program");
                    let mut state = state;
                    state.pol_rc = program.execute(&state);
                    Flow::TailCall {
                        index: ProgIndex::Allowed,
                        state,
                        on_miss: JumpMiss::Deny,
                    }
                }
                Some(JumpTarget::Accepted) => self.skb_accepted_entrypoint(skb, state),
                Some(JumpTarget::Icmp) => Flow::Done(self.send_icmp_replies(skb, state)),
                None => self.jump_failed(skb, index, state, on_miss),
            };
        }
    }

    fn jump_failed(
        &self,
        skb: &mut SkBuff,
        index: ProgIndex,
        mut state: TcState,
        on_miss: JumpMiss,
    ) -> Flow {
        match on_miss {
            JumpMiss::AllowSkipPolicy => {
                warn!(?index, "HEP with no policy, allow");
                state.pol_rc = PolicyResult::Allow;
                self.accept(TcCtx::with_state(skb, state))
            }
            JumpMiss::Deny => {
                warn!(?index, "Tail call failed: DROP");
                Flow::Done(Verdict::drop(Reason::Unknown))
            }
        }
    }

    /// Main entry point.
    fn calico_tc(&self, skb: &mut SkBuff) -> Flow {
        let config = &self.config;
        debug!(
            ifindex = skb.ifindex,
            mark = format_args!("{:#x}", skb.mark),
            "New packet"
        );

        // Pre-approved by another hook.
        if !config.to_host() && skb.mark == marks::BYPASS {
            debug!("Final result=ALLOW. Bypass mark bit set");
            return Flow::Done(Verdict::pass(Reason::Bypass, skb.mark));
        }

        if config.from_hep() && skb.xdp_meta & marks::META_ACCEPTED_BY_XDP != 0 {
            debug!("Final result=ALLOW. Accepted by XDP");
            return Flow::Done(Verdict::pass(Reason::AcceptedByXdp, skb.mark));
        }

        let mut ctx = TcCtx::new(skb);
        // Traffic leaving the host namespace has been routed already.
        ctx.fwd.fib = config.to_host();

        if config.from_host() {
            match ctx.skb.mark & marks::BYPASS_MASK {
                marks::BYPASS_FWD => {
                    debug!("Packet approved for forward");
                    ctx.fwd.reason = Reason::Bypass;
                    return self.finalize(ctx);
                }
                marks::BYPASS_FWD_SRC_FIXUP => {
                    debug!("Packet approved for forward - src ip fixup");
                    ctx.fwd.reason = Reason::Bypass;
                    if let Err(reason) = self.src_fixup(&mut ctx) {
                        return Flow::Done(Verdict::drop(reason));
                    }
                    return self.finalize(ctx);
                }
                _ => {}
            }
        }

        match self.tc_main(&mut ctx) {
            Ok(Stage::Finalize) => self.finalize(ctx),
            Ok(Stage::SkipPolicy) => self.accept(ctx),
            Ok(Stage::Jump(index, on_miss)) => {
                debug!(?index, "Tail call");
                Flow::TailCall {
                    index,
                    state: ctx.state,
                    on_miss,
                }
            }
            Err(reason) => {
                debug!(%reason, "Final result=DENY");
                Flow::Done(Verdict::drop(reason))
            }
        }
    }

    fn finalize(&self, mut ctx: TcCtx<'_>) -> Flow {
        Flow::Done(forward_or_drop(&mut ctx, &self.config, &self.maps))
    }

    /// Outer source of return tunnel traffic must be this node.
    fn src_fixup(&self, ctx: &mut TcCtx<'_>) -> Result<(), Reason> {
        ctx.refresh_validate(UDP_SIZE)?;
        let host_ip = self.config.host_ip;
        if ctx.ip_saddr()? == host_ip {
            debug!("src ip fixup not needed");
            return Ok(());
        }
        let ip = ctx.ip_off()?;
        ctx.skb
            .rewrite_addr(ip + ipv4::SADDR, host_ip, &[CsumField::Plain(ip + ipv4::CHECK)])
            .map_err(|_| Reason::CsumFail)?;
        debug!(%host_ip, "src ip fixup");
        Ok(())
    }

    fn tc_main(&self, ctx: &mut TcCtx<'_>) -> Result<Stage, Reason> {
        let config = &self.config;
        let maps = &*self.maps;
        let routes = &maps.routes;

        if parse_packet_ip(ctx, config, routes)? == Parse::AllowWithoutPolicy {
            ctx.fwd.fib = false;
            return Ok(Stage::Finalize);
        }

        if config.dnat_should_decap() && is_vxlan_tunnel(ctx, config)? {
            match vxlan_attempt_decap(ctx, config, routes)? {
                Decap::KnownHostAllow => {
                    debug!("VXLAN packet from known cluster host, allow");
                    ctx.fwd.fib = false;
                    return Ok(Stage::Finalize);
                }
                Decap::Decapped | Decap::NotOurs => {}
            }
        }

        fill_from_iphdr(ctx)?;
        if fill_from_nexthdr(ctx, config, routes)? == Parse::AllowWithoutPolicy {
            return Ok(Stage::Finalize);
        }

        ctx.state.pol_rc = PolicyResult::NoMatch;

        let ct = self.ct_lookup(ctx)?;
        ctx.state.ct_result = ct;
        debug!(rc = ?ct.rc, flags = ?ct.flags, "Conntrack result");

        if config.from_hep() && ct.tun_src_changed {
            debug!("Dropping tunnel packet with changed source node");
            return Err(Reason::UnauthSource);
        }

        if ct.flags.contains(CtFlags::NAT_OUT) {
            ctx.state.flags |= StateFlags::NAT_OUTGOING;
        }

        // Past (D)NAT the fallback stack still does RPF on the source.
        if ct.rpf_failed {
            ctx.fwd.fib = false;
        }

        if ct.rc == CtResultCode::MidFlowMiss {
            if config.to_host() {
                debug!("CT mid-flow miss; fall through to the fallback stack");
                ctx.fwd.mark = marks::FALLTHROUGH;
                ctx.fwd.fib = false;
                return Ok(Stage::Finalize);
            }
            if config.hep() {
                // TODO: allow only on data interfaces; active host endpoints need policy here
                debug!("CT mid-flow miss away from host, allow");
                return Ok(Stage::Finalize);
            }
            debug!("CT mid-flow miss away from host, drop");
            return Err(Reason::Unknown);
        }

        if ct.rc != CtResultCode::New {
            if ct.flags.contains(CtFlags::SKIP_FIB) {
                ctx.state.flags |= StateFlags::SKIP_FIB;
            }
            debug!("CT hit");
            return Ok(Stage::SkipPolicy);
        }

        // The fallback stack does RPF for new flows from outside the host.
        if config.from_hep() {
            ctx.state.ct_result.rpf_failed = true;
        }

        let state = &mut ctx.state;
        match maps.nat.lookup(
            routes,
            state.ip_src,
            state.ip_dst,
            state.ip_proto,
            state.dport,
            state.has_tunnel_peer(),
        ) {
            NatLookup::Drop => {
                debug!("Packet is from an unauthorised source: DROP");
                return Err(Reason::UnauthSource);
            }
            NatLookup::Backend(dest) => {
                state.post_nat_ip_dst = dest.addr;
                state.post_nat_dport = dest.port;
                state.nat_dest = Some(dest);
            }
            NatLookup::NoBackend => {
                debug!("No backend for service, reply port unreachable");
                state.icmp_type = ICMP_DEST_UNREACH;
                state.icmp_code = ICMP_PORT_UNREACH;
                state.icmp_mtu = 0;
                state.tun_ip = Ipv4Addr::UNSPECIFIED;
                return Ok(Stage::Jump(ProgIndex::Icmp, JumpMiss::Deny));
            }
            NatLookup::Allow => {
                state.post_nat_ip_dst = state.ip_dst;
                state.post_nat_dport = state.dport;
                state.nat_dest = None;
            }
        }

        // Seen packets came in through another interface.
        if config.to_wep() && !skb_seen(ctx.skb.mark) && routes.is_local_host(ctx.state.ip_src) {
            debug!("Packet is from the host: ACCEPT");
            ctx.state.pol_rc = PolicyResult::Allow;
            return Ok(Stage::SkipPolicy);
        }

        if config.from_wep() {
            self.workload_rpf(ctx)?;
        }

        ctx.refresh_validate(UDP_SIZE)?;
        ctx.state.pol_rc = PolicyResult::NoMatch;

        // Undo a socket level DNAT so policy sees the address the socket asked for.
        let cookie = ctx.skb.socket_cookie;
        if cookie != 0 {
            let key = SocketNatKey {
                cookie,
                proto: ctx.state.ip_proto,
                addr: ctx.state.ip_dst,
                port: ctx.state.dport,
            };
            if let Some(orig) = maps.ct_nats.lookup(&key) {
                debug!(cookie, orig = %orig.addr, "Flow was NATed at the socket");
                ctx.state.pre_nat_ip_dst = orig.addr;
                ctx.state.pre_nat_dport = orig.port;
            }
        }

        let state = &mut ctx.state;
        if routes.is_local_host(state.post_nat_ip_dst) {
            if config.from_hep()
                && maps
                    .failsafe
                    .is_failsafe_in(state.ip_proto, state.post_nat_dport, state.ip_src)
            {
                debug!(port = state.post_nat_dport, "Inbound failsafe port. Skip policy");
                state.pol_rc = PolicyResult::Allow;
                return Ok(Stage::SkipPolicy);
            }
            state.flags |= StateFlags::DEST_IS_HOST;
        }
        if routes.is_local_host(state.ip_src) {
            if config.to_hep()
                && maps.failsafe.is_failsafe_out(
                    state.ip_proto,
                    state.post_nat_dport,
                    state.post_nat_ip_dst,
                )
            {
                debug!(port = state.post_nat_dport, "Outbound failsafe port. Skip policy");
                state.pol_rc = PolicyResult::Allow;
                return Ok(Stage::SkipPolicy);
            }
            state.flags |= StateFlags::SRC_IS_HOST;
        }

        let on_miss = if config.hep() {
            JumpMiss::AllowSkipPolicy
        } else {
            JumpMiss::Deny
        };
        Ok(Stage::Jump(ProgIndex::Policy, on_miss))
    }

    fn ct_lookup(&self, ctx: &TcCtx<'_>) -> Result<CtResult, Reason> {
        let state = &ctx.state;
        let tcp_syn = if state.ip_proto == IPPROTO_TCP {
            let flags = ctx.tcp_flags()?;
            flags & TCP_FLAG_SYN != 0 && flags & TCP_FLAG_ACK == 0
        } else {
            false
        };
        let icmp_inner = if state.ip_proto == IPPROTO_ICMP && icmp_type_is_err(state.icmp_type) {
            icmp_inner_tuple(ctx)
        } else {
            None
        };

        let query = CtLookup {
            proto: state.ip_proto,
            src: state.ip_src,
            sport: state.sport,
            dst: state.ip_dst,
            dport: state.dport,
            tcp_syn,
            icmp_inner,
            tun_ip: state.tun_ip,
            ifindex: ctx.skb.ifindex,
            from_side: self.config.to_host(),
            seen: skb_seen(ctx.skb.mark),
            now_ns: monotonic_ns(),
        };
        Ok(self.maps.conntrack.lookup(&query))
    }

    /// Workload source must be routed back through the interface it came from.
    fn workload_rpf(&self, ctx: &mut TcCtx<'_>) -> Result<(), Reason> {
        let routes = &self.maps.routes;
        let src = ctx.state.ip_src;
        let ifindex = ctx.skb.ifindex;
        debug!(%src, ifindex, "Workload RPF check");

        let Some(route) = routes.lookup(src) else {
            info!(%src, "Workload RPF fail: missing route");
            return Err(Reason::UnauthSource);
        };
        if !route.flags.is_local_workload() {
            info!(%src, "Workload RPF fail: not a local workload");
            return Err(Reason::UnauthSource);
        }
        if route.if_index != ifindex {
            info!(
                %src,
                ifindex,
                route_ifindex = route.if_index,
                "Workload RPF fail: wrong interface"
            );
            return Err(Reason::UnauthSource);
        }

        let dst = ctx.state.post_nat_ip_dst;
        if route.flags.contains(RouteFlags::NAT_OUT)
            && !routes.lookup_flags(dst).contains(RouteFlags::IN_POOL)
        {
            debug!(%dst, "Source is in NAT-outgoing pool but dest is not, need to SNAT");
            ctx.state.flags |= StateFlags::NAT_OUTGOING;
        }
        if !route.flags.contains(RouteFlags::IN_POOL) {
            let in_cluster = routes
                .lookup(dst)
                .is_some_and(|r| r.flags.intersects(RouteFlags::WORKLOAD | RouteFlags::HOST));
            if !in_cluster {
                debug!(%dst, "Outside cluster dest");
                ctx.state.flags |= StateFlags::SKIP_FIB;
            }
        }
        Ok(())
    }

    /// Post-policy accept entry point.
    fn skb_accepted_entrypoint(&self, skb: &mut SkBuff, state: TcState) -> Flow {
        debug!("Entering skb_accepted_entrypoint");
        self.accept(TcCtx::with_state(skb, state))
    }

    fn accept(&self, mut ctx: TcCtx<'_>) -> Flow {
        if let Err(reason) = ctx.refresh_validate(UDP_SIZE) {
            debug!("Too short");
            return Flow::Done(Verdict::drop(reason));
        }
        match self.skb_accepted(&mut ctx) {
            Ok(Accepted::Fwd(fwd)) => {
                ctx.fwd = fwd;
                self.finalize(ctx)
            }
            Ok(Accepted::Icmp) => Flow::TailCall {
                index: ProgIndex::Icmp,
                state: ctx.state,
                on_miss: JumpMiss::Deny,
            },
            Err(reason) => {
                ctx.fwd = Fwd::deny(reason);
                self.finalize(ctx)
            }
        }
    }

    fn skb_accepted(&self, ctx: &mut TcCtx<'_>) -> Result<Accepted, Reason> {
        let config = &self.config;
        let nat_dest = ctx.state.nat_dest;
        let ct = ctx.state.ct_result;
        let mut ct_rc = ct.rc;
        let ct_related = ct.related;
        let seen = skb_seen(ctx.skb.mark);

        debug!(
            src = %ctx.state.ip_src,
            dst = %ctx.state.ip_dst,
            post_nat = %ctx.state.post_nat_ip_dst,
            post_nat_port = ctx.state.post_nat_dport,
            tun_ip = %ctx.state.tun_ip,
            pol_rc = ?ctx.state.pol_rc,
            flags = ?ctx.state.flags,
            ct_rc = ?ct_rc,
            ct_related,
            "Entering skb_accepted"
        );

        // Conntrack keys ICMP flows without ports.
        if ctx.state.ip_proto == IPPROTO_ICMP {
            ctx.state.dport = 0;
        }

        let mut acc = AcceptFwd {
            res: FwdRes::Unspec,
            mark: marks::SEEN,
            fib: false,
        };
        if config.from_wep() && ctx.state.flags.contains(StateFlags::NAT_OUTGOING) {
            // masqueraded by the fallback stack, no FIB
            acc.mark = marks::NAT_OUT;
        } else if !ctx.state.flags.contains(StateFlags::SKIP_FIB)
            && config.to_host()
            && !ct.rpf_failed
        {
            acc.fib = true;
        }

        // Replying here avoids handling related traffic back from the host.
        if ip_ttl_exceeded(ctx)? {
            let reply = match ct_rc {
                CtResultCode::New => nat_dest.is_some(),
                CtResultCode::EstablishedDnat | CtResultCode::EstablishedSnat => true,
                _ => false,
            };
            if reply {
                return self.icmp_ttl_exceeded(ctx);
            }
        }

        let mut related_icmp_csum = None;
        if ct_related && ctx.ip_proto()? == IPPROTO_ICMP {
            let outer_ip_snat = ct_rc == CtResultCode::EstablishedSnat
                && ct.has_tunnel()
                && ((config.dnat_return_should_encap() && !config.dsr)
                    || (config.to_hep() && (!seen || config.dsr)));
            if outer_ip_snat {
                let ip = ctx.ip_off()?;
                ctx.skb
                    .rewrite_addr(
                        ip + ipv4::SADDR,
                        ct.nat_ip,
                        &[CsumField::Plain(ip + ipv4::CHECK)],
                    )
                    .map_err(|_| Reason::CsumFail)?;
                debug!(nat_ip = %ct.nat_ip, "ICMP related: outer IP SNAT");
            }

            // An ICMP error quotes the inner IP header and 8 bytes.
            ctx.refresh_validate(ICMP_SIZE + IPV4_HLEN + 8)?;
            let icmp = ctx.l4_off()?;
            related_icmp_csum = Some(CsumField::Plain(icmp + ICMP_CHECK));
            ctx.enter_inner(icmp + ICMP_HLEN)?;
            if ctx.ip_ihl()? != 5 {
                info!("ICMP inner IP header has options; unsupported");
                return Err(Reason::IpOptions);
            }

            // The quoted packet travels the other way.
            ct_rc = match ct_rc {
                CtResultCode::EstablishedSnat => {
                    if config.dnat_return_should_encap() && ct.has_tunnel() && config.dsr {
                        debug!("DSR enabled, skipping SNAT + encap");
                        return acc.allow();
                    }
                    CtResultCode::EstablishedDnat
                }
                CtResultCode::EstablishedDnat => {
                    if config.from_hep() && ctx.state.has_tunnel_peer() && ct.np_node() {
                        debug!("ICMP related returned from NAT tunnel");
                        acc.mark = marks::BYPASS_FWD;
                        return acc.allow();
                    }
                    CtResultCode::EstablishedSnat
                }
                other => other,
            };
        }

        let ip = ctx.ip_off()?;
        let l4 = ctx.l4_off()?;
        let l4_proto = ctx.ip_proto()?;
        let l4_csum = match (related_icmp_csum, l4_proto) {
            // the quoted transport checksum is left as it was
            (Some(_), _) => None,
            (None, IPPROTO_TCP) => Some(CsumField::Plain(l4 + TCP_CHECK)),
            (None, IPPROTO_UDP) => Some(CsumField::Udp(l4 + UDP_CHECK)),
            _ => None,
        };
        let csums = NatCsums {
            l3: CsumField::Plain(ip + ipv4::CHECK),
            l4: l4_csum,
            port: related_icmp_csum.or(l4_csum),
        };
        let has_ports = matches!(l4_proto, IPPROTO_TCP | IPPROTO_UDP);

        let create = match ct_rc {
            CtResultCode::New => {
                match ctx.state.pol_rc {
                    PolicyResult::NoMatch => {
                        debug!("Implicitly denied by policy: DROP");
                        return Err(Reason::Unknown);
                    }
                    PolicyResult::Deny => {
                        debug!("Denied by policy: DROP");
                        return Err(Reason::Unknown);
                    }
                    PolicyResult::Allow => debug!("Allowed by policy: ACCEPT"),
                }

                if config.from_wep()
                    && config.drop_workload_to_host()
                    && self.maps.routes.is_local_host(ctx.state.post_nat_ip_dst)
                {
                    debug!(
                        "Workload to host traffic blocked by default endpoint-to-host action: DROP"
                    );
                    return Err(Reason::Unknown);
                }

                let create = self.ct_create_request(ctx);
                if ctx.state.ip_proto == IPPROTO_TCP {
                    ctx.refresh_validate(TCP_SIZE)?;
                }

                if nat_dest.is_none() {
                    return self.create_normal(&create, acc);
                }
                Some(CtCreate {
                    orig_dst: Some(NatDest::new(ctx.state.ip_dst, ctx.state.dport)),
                    ..create
                })
            }
            CtResultCode::EstablishedDnat => None,
            CtResultCode::EstablishedSnat => {
                return self.snat(ctx, &csums, has_ports, acc);
            }
            CtResultCode::EstablishedBypass => {
                acc.mark = marks::BYPASS;
                return acc.allow();
            }
            CtResultCode::Established => return acc.allow(),
            CtResultCode::MidFlowMiss | CtResultCode::Invalid => {
                if config.from_hep() {
                    // TODO: host endpoint conntrack is incomplete, such traffic can be
                    // reported as invalid; let the fallback stack decide
                    debug!("Traffic towards host namespace not conntracked, fall through");
                    acc.fib = false;
                    return acc.allow();
                }
                return Err(Reason::Unknown);
            }
        };

        self.dnat(ctx, create, ct_rc, ct_related, &csums, has_ports, acc)
    }

    fn ct_create_request(&self, ctx: &TcCtx<'_>) -> CtCreate {
        let config = &self.config;
        let state = &ctx.state;
        let mut flags = CtFlags::empty();
        if state.flags.contains(StateFlags::NAT_OUTGOING) {
            flags |= CtFlags::NAT_OUT;
        }
        if config.from_wep() && state.flags.contains(StateFlags::SKIP_FIB) {
            flags |= CtFlags::SKIP_FIB;
        }
        // tunneled flows terminating here return through the same interface
        let ifindex_fwd = if config.from_hep() && state.has_tunnel_peer() {
            ctx.skb.ifindex
        } else {
            CT_INVALID_IFINDEX
        };
        CtCreate {
            proto: state.ip_proto,
            src: state.ip_src,
            sport: state.sport,
            dst: state.post_nat_ip_dst,
            dport: state.post_nat_dport,
            orig_dst: None,
            tun_ip: state.tun_ip,
            flags,
            allow_return: false,
            from_side: config.to_host(),
            ifindex: ctx.skb.ifindex,
            ifindex_fwd,
            now_ns: monotonic_ns(),
        }
    }

    fn create_normal(&self, create: &CtCreate, acc: AcceptFwd) -> Result<Accepted, Reason> {
        let Err(err) = self.maps.conntrack.create(create) else {
            return acc.allow();
        };
        debug!(%err, "Creating normal conntrack failed");

        let config = &self.config;
        let routes = &self.maps.routes;
        if (config.from_hep() && routes.is_local_host(create.dst))
            || (config.to_hep() && routes.is_local_host(create.src))
        {
            debug!("Allowing local host traffic without CT");
            return acc.allow();
        }
        Err(Reason::Unknown)
    }

    #[allow(clippy::too_many_arguments)]
    fn dnat(
        &self,
        ctx: &mut TcCtx<'_>,
        create: Option<CtCreate>,
        ct_rc: CtResultCode,
        ct_related: bool,
        csums: &NatCsums,
        has_ports: bool,
        mut acc: AcceptFwd,
    ) -> Result<Accepted, Reason> {
        let config = &self.config;
        let ct = ctx.state.ct_result;

        if ct_rc == CtResultCode::EstablishedDnat {
            if config.from_hep() && ctx.state.has_tunnel_peer() && ct.np_node() {
                // already SNATed by the backend's node
                debug!("Returned from NAT tunnel");
                acc.mark = marks::BYPASS_FWD;
                return acc.allow();
            }
            ctx.state.post_nat_ip_dst = ct.nat_ip;
            ctx.state.post_nat_dport = ct.nat_port;
        }

        debug!(
            dst = %ctx.state.post_nat_ip_dst,
            port = ctx.state.post_nat_dport,
            "CT: DNAT"
        );

        let mut encap_needed = config.dnat_should_encap();

        match create {
            Some(mut create) => {
                // Encap and the conntrack entry depend on where the backend is.
                if encap_needed {
                    let Some(rt) = self.maps.routes.lookup(ctx.state.post_nat_ip_dst) else {
                        debug!(dst = %ctx.state.post_nat_ip_dst, "No route for backend");
                        return Err(Reason::RtUnknown);
                    };
                    debug!(
                        dst = %ctx.state.post_nat_ip_dst,
                        local = rt.is_local(),
                        "Backend route"
                    );

                    encap_needed = !rt.is_local();
                    if encap_needed {
                        if config.from_hep() && !ctx.state.has_tunnel_peer() {
                            if config.dsr {
                                create.flags |= CtFlags::DSR_FWD;
                            }
                            create.flags |= CtFlags::NP_FWD;
                        }
                        create.allow_return = true;
                        create.tun_ip = rt.next_hop;
                        ctx.state.ip_dst = rt.next_hop;
                    } else if rt.is_workload() && ctx.state.ip_dst != ctx.state.post_nat_ip_dst {
                        // routing must not RPF on the post-NAT address
                        create.flags |= CtFlags::EXT_LOCAL;
                        ctx.state.ct_result.flags |= CtFlags::EXT_LOCAL;
                        debug!("CT_NEW marked with EXT_LOCAL");
                    }
                }

                if let Err(err) = self.maps.conntrack.create(&create) {
                    debug!(%err, "Creating NAT conntrack failed");
                    return Err(Reason::Unknown);
                }
            }
            None => {
                if encap_needed && ct.np_node() {
                    debug!(node = %ct.tun_ip, "CT says encap to node");
                    ctx.state.ip_dst = ct.tun_ip;
                } else {
                    encap_needed = false;
                }
            }
        }

        if encap_needed {
            if self.encap_too_big(ctx)? {
                debug!("Request packet with DNF set is too big");
                return Ok(self.icmp_too_big(ctx));
            }
            ctx.state.ip_src = config.host_ip;
            acc.mark = marks::SKIP_RPF;
            // RPF cannot be enforced on encapsulated traffic
            acc.fib = true;
            return self.nat_encap(ctx, acc);
        }

        let ip = ctx.ip_off()?;
        let l4 = ctx.l4_off()?;
        csums.rewrite_addr(ctx.skb, ip + ipv4::DADDR, ctx.state.post_nat_ip_dst)?;
        if has_ports {
            csums.rewrite_port(ctx.skb, l4 + 2, ctx.state.post_nat_dport)?;
        }

        // Returning ICMP related to a tunneled flow. It is assumed to fit the MTU.
        if ct_related && ctx.state.ip_proto == IPPROTO_ICMP && ct.has_tunnel() && !config.dsr {
            if config.dnat_return_should_encap() {
                debug!("Returning related ICMP from workload to tunnel");
                ctx.state.ip_dst = ct.tun_ip;
                acc.mark = marks::BYPASS_FWD_SRC_FIXUP;
                return self.nat_encap(ctx, acc);
            }
            if config.to_hep() {
                debug!("Returning related ICMP from host to tunnel");
                ctx.state.ip_src = config.host_ip;
                ctx.state.ip_dst = ct.tun_ip;
                return self.nat_encap(ctx, acc);
            }
        }

        ctx.state.dport = ctx.state.post_nat_dport;
        ctx.state.ip_dst = ctx.state.post_nat_ip_dst;
        acc.allow()
    }

    fn snat(
        &self,
        ctx: &mut TcCtx<'_>,
        csums: &NatCsums,
        has_ports: bool,
        mut acc: AcceptFwd,
    ) -> Result<Accepted, Reason> {
        let config = &self.config;
        let ct = ctx.state.ct_result;
        debug!(nat_ip = %ct.nat_ip, nat_port = ct.nat_port, "CT: SNAT");

        if config.dnat_return_should_encap() && ct.has_tunnel() {
            if config.dsr {
                // SNAT happens after routing, when leaving the host interface
                debug!("DSR enabled, skipping SNAT + encap");
                return acc.allow();
            }
            if self.encap_too_big(ctx)? {
                debug!("Return packet with DNF set is too big");
                return Ok(self.icmp_too_big(ctx));
            }
        }

        let ip = ctx.ip_off()?;
        let l4 = ctx.l4_off()?;
        csums.rewrite_addr(ctx.skb, ip + ipv4::SADDR, ct.nat_ip)?;
        if has_ports {
            csums.rewrite_port(ctx.skb, l4, ct.nat_port)?;
        }

        // Return traffic to a node port client whose request was forwarded to
        // us, from a workload or from the host namespace.
        if (config.dnat_return_should_encap() || (config.to_hep() && !config.dsr))
            && ct.has_tunnel()
        {
            ctx.state.ip_dst = ct.tun_ip;
            acc.mark = marks::BYPASS_FWD_SRC_FIXUP;
            return self.nat_encap(ctx, acc);
        }

        ctx.state.sport = ct.nat_port;
        ctx.state.ip_src = ct.nat_ip;
        acc.allow()
    }

    /// DF packet that would exceed the tunnel MTU. GSO TCP is segmented later.
    fn encap_too_big(&self, ctx: &TcCtx<'_>) -> Result<bool, Reason> {
        if ctx.state.ip_proto == IPPROTO_TCP && ctx.skb.gso {
            return Ok(false);
        }
        Ok(ctx.ip_is_dnf()? && vxlan_encap_too_big(ctx, &self.config))
    }

    fn nat_encap(&self, ctx: &mut TcCtx<'_>, mut acc: AcceptFwd) -> Result<Accepted, Reason> {
        let config = &self.config;

        // Return traffic from the host namespace was routed towards the
        // client, not the node that forwarded it.
        if config.to_hep() {
            let dst = ctx.state.ip_dst;
            let ifindex = ctx.skb.ifindex;
            match self.maps.arp.lookup(dst, ifindex) {
                None => debug!(%dst, ifindex, "ARP lookup failed at HEP"),
                Some(arp) => {
                    ctx.refresh_validate(0)?;
                    ctx.skb.bytes_mut(0, ETH_ALEN)?.copy_from_slice(&arp.mac_dst);
                }
            }
        }

        let (src, dst) = (ctx.state.ip_src, ctx.state.ip_dst);
        if let Err(err) = vxlan_encap(ctx, config, src, dst) {
            debug!(%err, "VXLAN encap failed");
            return Err(err.into());
        }

        ctx.state.sport = config.vxlan_port;
        ctx.state.dport = config.vxlan_port;
        ctx.state.ip_proto = IPPROTO_UDP;

        let ifindex_fwd = ctx.state.ct_result.ifindex_fwd;
        debug!(ifindex_fwd, "VXLAN return");
        if config.dnat_return_should_encap() && ifindex_fwd != CT_INVALID_IFINDEX {
            acc.res = FwdRes::RedirIfindex;
        }
        acc.allow()
    }

    fn icmp_ttl_exceeded(&self, ctx: &mut TcCtx<'_>) -> Result<Accepted, Reason> {
        if ctx.ip_frag_no()? {
            debug!("TTL exceeded on a fragment: DROP");
            return Err(Reason::Unknown);
        }
        ctx.state.icmp_type = ICMP_TIME_EXCEEDED;
        ctx.state.icmp_code = ICMP_EXC_TTL;
        ctx.state.icmp_mtu = 0;
        ctx.state.tun_ip = Ipv4Addr::UNSPECIFIED;
        Ok(Accepted::Icmp)
    }

    fn icmp_too_big(&self, ctx: &mut TcCtx<'_>) -> Accepted {
        ctx.state.icmp_type = ICMP_DEST_UNREACH;
        ctx.state.icmp_code = ICMP_FRAG_NEEDED;
        ctx.state.icmp_mtu = self.config.tunnel_mtu;
        Accepted::Icmp
    }

    /// ICMP reply entry point.
    fn send_icmp_replies(&self, skb: &mut SkBuff, state: TcState) -> Verdict {
        let config = &self.config;
        let mut ctx = TcCtx::with_state(skb, state);
        let icmp_type = ctx.state.icmp_type;
        let icmp_code = ctx.state.icmp_code;
        let mtu = ctx.state.icmp_mtu;
        debug!(icmp_type, icmp_code, "Entering send_icmp_replies");

        let mut fib_flags = FibFlags::empty();
        if icmp_type == ICMP_DEST_UNREACH && icmp_code == ICMP_FRAG_NEEDED {
            fib_flags |= FibFlags::OUTPUT;
            if config.from_wep() {
                // came from the workload, send it back the same way
                ctx.fwd.res = FwdRes::RedirBack;
            }
        }

        match icmp_v4_reply(&mut ctx, config, icmp_type, icmp_code, mtu) {
            Ok(()) => {
                ctx.fwd.mark = marks::BYPASS_FWD;
                ctx.fwd.fib = false;
                ctx.fwd.fib_flags = fib_flags;
            }
            Err(reason) => {
                ctx.fwd.res = FwdRes::Shot;
                ctx.fwd.reason = reason;
            }
        }

        if let Err(reason) = ctx.refresh_validate(ICMP_SIZE) {
            debug!("Too short");
            return Verdict::drop(reason);
        }
        if let Err(reason) = fill_from_iphdr(&mut ctx) {
            return Verdict::drop(reason);
        }
        ctx.state.sport = 0;
        ctx.state.dport = 0;
        forward_or_drop(&mut ctx, config, &self.maps)
    }
}

/// Tuple of the packet quoted in an ICMP error, if it is all there.
fn icmp_inner_tuple(ctx: &TcCtx<'_>) -> Option<InnerTuple> {
    let inner = ctx.l4_off().ok()? + ICMP_HLEN;
    let skb = &*ctx.skb;
    let ihl = (skb.load_u8(inner).ok()? & 0x0f) as usize * 4;
    let proto = skb.load_u8(inner + ipv4::PROTOCOL).ok()?;
    let src = skb.load_addr(inner + ipv4::SADDR).ok()?;
    let dst = skb.load_addr(inner + ipv4::DADDR).ok()?;
    let (sport, dport) = match proto {
        IPPROTO_TCP | IPPROTO_UDP => (
            skb.load_be16(inner + ihl).ok()?,
            skb.load_be16(inner + ihl + 2).ok()?,
        ),
        _ => (0, 0),
    };
    Some(InnerTuple {
        proto,
        src,
        sport,
        dst,
        dport,
    })
}
