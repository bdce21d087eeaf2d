//! Connection tracking table.
//!
//! Entries are keyed by a normalized tuple (lower address/port pair first) so
//! both directions of a flow share one key. Each entry has two legs, one per
//! side, recording whether policy at that side approved the flow.
//!
//! A translated flow has two entries:
//! - `NatFwd` under the pre-DNAT tuple (client, service), pointing at the
//!   reverse key
//! - `NatRev` under the post-DNAT tuple (client, backend), holding the
//!   original service address used to un-NAT replies
//!
//! The pair lives and expires as one unit. A `NatFwd` hit refreshes its
//! `NatRev` and takes the backend from the reverse key, so a `NatFwd`
//! without its reverse entry is treated as a miss.
//!
//! Creation goes through `DashMap::entry`, so racing invocations for the
//! same flow merge into one entry instead of overwriting each other.

use crate::error::CtError;
use crate::nat::NatDest;
use crate::skb::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use bitflags::bitflags;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Interface index meaning "none recorded".
pub const CT_INVALID_IFINDEX: u32 = 0;

/// Default capacity of the table.
pub const DEFAULT_CT_CAPACITY: usize = 512 * 1024;

/// Default timeout for established TCP connections (5 minutes)
const TCP_ESTABLISHED_TIMEOUT_NS: u64 = 300_000_000_000;

/// Default timeout for UDP connections (30 seconds)
const UDP_TIMEOUT_NS: u64 = 30_000_000_000;

/// Default timeout for other connections (60 seconds)
const DEFAULT_TIMEOUT_NS: u64 = 60_000_000_000;

/// Monotonic nanoseconds since the first call.
pub fn monotonic_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Normalized flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtKey {
    pub proto: u8,
    pub addr_a: Ipv4Addr,
    pub port_a: u16,
    pub addr_b: Ipv4Addr,
    pub port_b: u16,
}

impl CtKey {
    pub fn new(proto: u8, src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Self {
        if (src, sport) <= (dst, dport) {
            Self {
                proto,
                addr_a: src,
                port_a: sport,
                addr_b: dst,
                port_b: dport,
            }
        } else {
            Self {
                proto,
                addr_a: dst,
                port_a: dport,
                addr_b: src,
                port_b: sport,
            }
        }
    }

    /// Whether `(addr, port)` is the A side of this key.
    pub fn is_a(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.addr_a == addr && self.port_a == port
    }

    /// The side of the key that is not `(addr, port)`.
    pub fn peer_of(&self, addr: Ipv4Addr, port: u16) -> NatDest {
        if self.is_a(addr, port) {
            NatDest::new(self.addr_b, self.port_b)
        } else {
            NatDest::new(self.addr_a, self.port_a)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtType {
    Normal,
    NatFwd,
    NatRev,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CtFlags: u16 {
        /// Masqueraded by the fallback stack
        const NAT_OUT = 1 << 0;
        /// Never fast path redirect this flow
        const SKIP_FIB = 1 << 1;
        /// Node port flow answered directly by the backend
        const DSR_FWD = 1 << 2;
        /// Node port flow forwarded to a backend on another node
        const NP_FWD = 1 << 3;
        /// External traffic DNATed to a local workload
        const EXT_LOCAL = 1 << 4;
    }
}

impl Default for CtFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// One direction of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CtLeg {
    /// Policy at this side allowed the flow
    pub approved: bool,
    /// This side sent the first packet
    pub opener: bool,
    /// Interface the opener's packets arrived on (towards the host)
    pub ifindex: u32,
}

#[derive(Debug)]
pub struct CtEntry {
    pub kind: CtType,
    pub flags: CtFlags,
    pub a: CtLeg,
    pub b: CtLeg,
    /// Tunnel peer of the flow, unspecified if local
    pub tun_ip: Ipv4Addr,
    /// Interface to redirect return traffic to
    pub ifindex_fwd: u32,
    /// NatFwd: reverse entry key
    pub rev_key: Option<CtKey>,
    /// NatRev: original service address
    pub nat: Option<NatDest>,
    pub created_ns: u64,
    last_seen_ns: AtomicU64,
    /// Creates merged into this entry after it was inserted
    merges: u32,
}

impl Clone for CtEntry {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            flags: self.flags,
            a: self.a,
            b: self.b,
            tun_ip: self.tun_ip,
            ifindex_fwd: self.ifindex_fwd,
            rev_key: self.rev_key,
            nat: self.nat,
            created_ns: self.created_ns,
            last_seen_ns: AtomicU64::new(self.last_seen()),
            merges: self.merges,
        }
    }
}

impl CtEntry {
    fn new(kind: CtType, now_ns: u64) -> Self {
        Self {
            kind,
            flags: CtFlags::empty(),
            a: CtLeg::default(),
            b: CtLeg::default(),
            tun_ip: Ipv4Addr::UNSPECIFIED,
            ifindex_fwd: CT_INVALID_IFINDEX,
            rev_key: None,
            nat: None,
            created_ns: now_ns,
            last_seen_ns: AtomicU64::new(now_ns),
            merges: 0,
        }
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen_ns.load(Ordering::Relaxed)
    }

    fn is_live(&self, now_ns: u64, timeout_ns: u64) -> bool {
        now_ns.saturating_sub(self.last_seen()) <= timeout_ns
    }

    fn touch(&self, now_ns: u64) {
        self.last_seen_ns.fetch_max(now_ns, Ordering::Relaxed);
    }

    fn legs(&self, a_side: bool) -> (&CtLeg, &CtLeg) {
        if a_side {
            (&self.a, &self.b)
        } else {
            (&self.b, &self.a)
        }
    }

    fn legs_mut(&mut self, a_side: bool) -> (&mut CtLeg, &mut CtLeg) {
        if a_side {
            (&mut self.a, &mut self.b)
        } else {
            (&mut self.b, &mut self.a)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CtResultCode {
    #[default]
    New,
    Established,
    EstablishedBypass,
    EstablishedSnat,
    EstablishedDnat,
    MidFlowMiss,
    Invalid,
}

/// Lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtResult {
    pub rc: CtResultCode,
    /// Packet is an ICMP error about a tracked flow
    pub related: bool,
    /// Source arrived on an unexpected interface
    pub rpf_failed: bool,
    /// Tunneled packet from a different peer than the flow's
    pub tun_src_changed: bool,
    pub flags: CtFlags,
    /// Address/port to translate to (DNAT) or back to (SNAT)
    pub nat_ip: Ipv4Addr,
    pub nat_port: u16,
    pub tun_ip: Ipv4Addr,
    pub ifindex_fwd: u32,
}

impl Default for CtResult {
    fn default() -> Self {
        Self {
            rc: CtResultCode::New,
            related: false,
            rpf_failed: false,
            tun_src_changed: false,
            flags: CtFlags::empty(),
            nat_ip: Ipv4Addr::UNSPECIFIED,
            nat_port: 0,
            tun_ip: Ipv4Addr::UNSPECIFIED,
            ifindex_fwd: CT_INVALID_IFINDEX,
        }
    }
}

impl CtResult {
    /// Flow was forwarded to a backend on another node.
    pub fn np_node(&self) -> bool {
        self.flags.contains(CtFlags::NP_FWD)
    }

    pub fn has_tunnel(&self) -> bool {
        !self.tun_ip.is_unspecified()
    }
}

/// Tuple embedded in an ICMP error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerTuple {
    pub proto: u8,
    pub src: Ipv4Addr,
    pub sport: u16,
    pub dst: Ipv4Addr,
    pub dport: u16,
}

/// Everything a lookup needs to know about the packet and the hook.
#[derive(Debug, Clone, Copy)]
pub struct CtLookup {
    pub proto: u8,
    pub src: Ipv4Addr,
    pub sport: u16,
    pub dst: Ipv4Addr,
    pub dport: u16,
    /// TCP SYN without ACK
    pub tcp_syn: bool,
    pub icmp_inner: Option<InnerTuple>,
    /// Peer the packet was decapsulated from
    pub tun_ip: Ipv4Addr,
    pub ifindex: u32,
    /// Hook sits on the sending side of the packet (traffic towards the host)
    pub from_side: bool,
    /// Packet already passed another hook on this node
    pub seen: bool,
    pub now_ns: u64,
}

/// Request to create (or merge into) the entry of a newly allowed flow.
#[derive(Debug, Clone, Copy)]
pub struct CtCreate {
    pub proto: u8,
    pub src: Ipv4Addr,
    pub sport: u16,
    /// Post-DNAT destination
    pub dst: Ipv4Addr,
    pub dport: u16,
    /// Pre-DNAT destination, `Some` creates a NAT entry pair
    pub orig_dst: Option<NatDest>,
    pub tun_ip: Ipv4Addr,
    pub flags: CtFlags,
    /// Approve both legs (the other side has no hook to do it)
    pub allow_return: bool,
    pub from_side: bool,
    pub ifindex: u32,
    pub ifindex_fwd: u32,
    pub now_ns: u64,
}

/// Idle timeouts used by [`ConnTrack::expire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtTimeouts {
    pub tcp_ns: u64,
    pub udp_ns: u64,
    pub other_ns: u64,
}

impl Default for CtTimeouts {
    fn default() -> Self {
        Self {
            tcp_ns: TCP_ESTABLISHED_TIMEOUT_NS,
            udp_ns: UDP_TIMEOUT_NS,
            other_ns: DEFAULT_TIMEOUT_NS,
        }
    }
}

impl CtTimeouts {
    fn for_proto(&self, proto: u8) -> u64 {
        match proto {
            IPPROTO_TCP => self.tcp_ns,
            IPPROTO_UDP => self.udp_ns,
            _ => self.other_ns,
        }
    }
}

/// The connection tracking table.
pub struct ConnTrack {
    map: DashMap<CtKey, CtEntry>,
    count: AtomicUsize,
    capacity: usize,
}

impl Default for ConnTrack {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CT_CAPACITY)
    }
}

impl ConnTrack {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: DashMap::new(),
            count: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the entry stored under `key`.
    pub fn get(&self, key: &CtKey) -> Option<CtEntry> {
        self.map.get(key).map(|e| e.value().clone())
    }

    fn snapshot(&self, key: &CtKey, now_ns: u64) -> Option<CtEntry> {
        self.map.get(key).map(|e| {
            e.touch(now_ns);
            e.value().clone()
        })
    }

    /// Entry under `key` and, for a `NatFwd`, the reverse key of its
    /// pair. Both are refreshed. `None` if either half is missing.
    fn snapshot_pair(&self, key: &CtKey, now_ns: u64) -> Option<(CtEntry, Option<CtKey>)> {
        let entry = self.snapshot(key, now_ns)?;
        if entry.kind != CtType::NatFwd {
            return Some((entry, None));
        }
        let rev_key = entry.rev_key?;
        match self.snapshot(&rev_key, now_ns) {
            Some(_) => Some((entry, Some(rev_key))),
            None => {
                debug!(?key, ?rev_key, "CT NAT pair without reverse entry");
                None
            }
        }
    }

    pub fn lookup(&self, q: &CtLookup) -> CtResult {
        let key = CtKey::new(q.proto, q.src, q.sport, q.dst, q.dport);
        if let Some((entry, rev_key)) = self.snapshot_pair(&key, q.now_ns) {
            let res = classify(&key, &entry, rev_key, q.src, q.sport, q, false);
            debug!(?key, kind = ?entry.kind, rc = ?res.rc, "CT hit");
            return res;
        }

        if q.proto == IPPROTO_ICMP
            && let Some(inner) = q.icmp_inner
        {
            let inner_key = CtKey::new(inner.proto, inner.src, inner.sport, inner.dst, inner.dport);
            if let Some((entry, rev_key)) = self.snapshot_pair(&inner_key, q.now_ns) {
                // The error travels against the embedded packet.
                let res = classify(&inner_key, &entry, rev_key, inner.dst, inner.dport, q, true);
                debug!(?inner_key, rc = ?res.rc, "CT related hit");
                return res;
            }
        }

        let rc = if q.proto == IPPROTO_TCP && !q.tcp_syn {
            CtResultCode::MidFlowMiss
        } else {
            CtResultCode::New
        };
        CtResult {
            rc,
            ..CtResult::default()
        }
    }

    /// Create the entry (or entry pair for NAT) of an allowed new flow.
    pub fn create(&self, c: &CtCreate) -> Result<(), CtError> {
        match c.orig_dst {
            None => {
                let key = CtKey::new(c.proto, c.src, c.sport, c.dst, c.dport);
                self.upsert(key, CtType::Normal, c, None, None).map(|_| ())
            }
            Some(orig) => {
                let rev_key = CtKey::new(c.proto, c.src, c.sport, c.dst, c.dport);
                let fwd_key = CtKey::new(c.proto, c.src, c.sport, orig.addr, orig.port);
                let inserted_rev = self.upsert(rev_key, CtType::NatRev, c, Some(orig), None)?;
                if let Err(e) = self.upsert(fwd_key, CtType::NatFwd, c, None, Some(rev_key)) {
                    if inserted_rev {
                        self.rollback(&rev_key);
                    }
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Insert a new entry or merge approvals into the existing one.
    /// Returns whether a new entry was inserted.
    fn upsert(
        &self,
        key: CtKey,
        kind: CtType,
        c: &CtCreate,
        nat: Option<NatDest>,
        rev_key: Option<CtKey>,
    ) -> Result<bool, CtError> {
        let src_is_a = key.is_a(c.src, c.sport);
        match self.map.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.touch(c.now_ns);
                entry.merges = entry.merges.saturating_add(1);
                let (src_leg, dst_leg) = entry.legs_mut(src_is_a);
                approve(src_leg, dst_leg, c);
                debug!(?key, kind = ?entry.kind, "CT merged");
                Ok(false)
            }
            Entry::Vacant(vacant) => {
                let reserved = self
                    .count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < self.capacity).then_some(n + 1)
                    });
                if reserved.is_err() {
                    warn!(capacity = self.capacity, "Connection tracking table full");
                    return Err(CtError::TableFull(self.capacity));
                }
                let mut entry = CtEntry::new(kind, c.now_ns);
                entry.flags = c.flags;
                entry.tun_ip = c.tun_ip;
                entry.ifindex_fwd = c.ifindex_fwd;
                entry.nat = nat;
                entry.rev_key = rev_key;
                let (src_leg, dst_leg) = entry.legs_mut(src_is_a);
                src_leg.opener = true;
                if c.from_side {
                    src_leg.ifindex = c.ifindex;
                }
                approve(src_leg, dst_leg, c);
                debug!(?key, ?kind, flags = ?c.flags, "CT created");
                vacant.insert(entry);
                Ok(true)
            }
        }
    }

    pub fn remove(&self, key: &CtKey) -> Option<CtEntry> {
        let removed = self.map.remove(key).map(|(_, e)| e);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Remove an entry this invocation inserted, unless another create
    /// merged into it meanwhile.
    fn rollback(&self, key: &CtKey) {
        if self.map.remove_if(key, |_, e| e.merges == 0).is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            debug!(?key, "CT rolled back");
        }
    }

    /// Remove entries idle for longer than their protocol's timeout.
    /// A NAT pair is live while either half is and is removed as a whole.
    /// Returns the number of removed entries.
    pub fn expire(&self, now_ns: u64, timeouts: &CtTimeouts) -> usize {
        let live = |key: &CtKey, entry: &CtEntry| {
            entry.is_live(now_ns, timeouts.for_proto(key.proto))
        };

        let live_revs: HashSet<CtKey> = self
            .map
            .iter()
            .filter(|e| e.kind == CtType::NatRev && live(e.key(), e.value()))
            .map(|e| *e.key())
            .collect();
        let pair_live = |key: &CtKey, entry: &CtEntry| {
            live(key, entry) || entry.rev_key.is_some_and(|rev| live_revs.contains(&rev))
        };
        let kept_revs: HashSet<CtKey> = self
            .map
            .iter()
            .filter(|e| e.kind == CtType::NatFwd && pair_live(e.key(), e.value()))
            .filter_map(|e| e.rev_key)
            .collect();

        let mut removed = 0;
        self.map.retain(|key, entry| {
            let entry = &*entry;
            let keep = match entry.kind {
                CtType::Normal => live(key, entry),
                CtType::NatFwd => pair_live(key, entry),
                CtType::NatRev => kept_revs.contains(key) || live(key, entry),
            };
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            self.count.fetch_sub(removed, Ordering::AcqRel);
        }
        removed
    }
}

fn approve(src_leg: &mut CtLeg, dst_leg: &mut CtLeg, c: &CtCreate) {
    if c.allow_return {
        src_leg.approved = true;
        dst_leg.approved = true;
    } else if c.from_side {
        src_leg.approved = true;
    } else {
        dst_leg.approved = true;
    }
}

/// Map an entry hit to a result for a packet sent by `(src, sport)`.
fn classify(
    key: &CtKey,
    entry: &CtEntry,
    rev_key: Option<CtKey>,
    src: Ipv4Addr,
    sport: u16,
    q: &CtLookup,
    related: bool,
) -> CtResult {
    let (src_leg, dst_leg) = entry.legs(key.is_a(src, sport));
    let local_leg = if q.from_side { src_leg } else { dst_leg };

    let mut res = CtResult {
        related,
        flags: entry.flags,
        tun_ip: entry.tun_ip,
        ifindex_fwd: entry.ifindex_fwd,
        ..CtResult::default()
    };

    if !related {
        if q.from_side
            && !q.tun_ip.is_unspecified()
            && !entry.tun_ip.is_unspecified()
            && q.tun_ip != entry.tun_ip
        {
            res.tun_src_changed = true;
        }
        if q.from_side && src_leg.ifindex != CT_INVALID_IFINDEX && src_leg.ifindex != q.ifindex {
            res.rpf_failed = true;
        }
        if !local_leg.approved {
            res.rc = CtResultCode::New;
            return res;
        }
    }

    res.rc = match entry.kind {
        CtType::Normal => {
            if !related && q.seen && entry.a.approved && entry.b.approved {
                CtResultCode::EstablishedBypass
            } else {
                CtResultCode::Established
            }
        }
        CtType::NatFwd => {
            if src_leg.opener {
                // The reverse entry is keyed by (client, backend).
                if let Some(rev_key) = rev_key {
                    let backend = rev_key.peer_of(src, sport);
                    res.nat_ip = backend.addr;
                    res.nat_port = backend.port;
                }
                CtResultCode::EstablishedDnat
            } else if res.np_node() && !q.tun_ip.is_unspecified() {
                // Reply of a forwarded node port flow coming back through
                // the tunnel, already translated by the backend's node.
                CtResultCode::EstablishedDnat
            } else {
                CtResultCode::Established
            }
        }
        CtType::NatRev => {
            if src_leg.opener {
                CtResultCode::Established
            } else {
                if let Some(orig) = entry.nat {
                    res.nat_ip = orig.addr;
                    res.nat_port = orig.port;
                }
                CtResultCode::EstablishedSnat
            }
        }
    };
    res
}
