//! Per-invocation processing context and header cursor.

use crate::error::Reason;
use crate::fwd::Fwd;
use crate::skb::{ETH_HLEN, IPV4_HLEN, SkBuff, ipv4};
use crate::state::TcState;
use std::net::Ipv4Addr;

/// Offsets of the current IP and transport headers, valid for one buffer
/// generation.
#[derive(Debug, Clone, Copy)]
struct Headers {
    ip: usize,
    l4: usize,
    generation: u64,
}

/// Context of one pipeline invocation: the packet, the scratch state and
/// the forwarding decision being built.
pub struct TcCtx<'a> {
    pub skb: &'a mut SkBuff,
    pub state: TcState,
    pub fwd: Fwd,
    hdr: Option<Headers>,
}

impl<'a> TcCtx<'a> {
    /// Fresh context with zeroed state.
    pub fn new(skb: &'a mut SkBuff) -> Self {
        Self::with_state(skb, TcState::default())
    }

    /// Context for a re-entry point, resuming with the carried state.
    pub fn with_state(skb: &'a mut SkBuff, state: TcState) -> Self {
        Self {
            skb,
            state,
            fwd: Fwd::default(),
            hdr: None,
        }
    }

    /// Re-derive header offsets after the buffer may have changed and check
    /// the frame holds at least `min_len` bytes.
    pub fn refresh_validate(&mut self, min_len: usize) -> Result<(), Reason> {
        self.hdr = None;
        if self.skb.len() < min_len.max(ETH_HLEN + IPV4_HLEN) {
            return Err(Reason::Short);
        }
        let ip = ETH_HLEN;
        let ihl = (self.skb.load_u8(ip)? & 0x0f) as usize;
        let l4 = ip + (ihl * 4).max(IPV4_HLEN);
        self.hdr = Some(Headers {
            ip,
            l4,
            generation: self.skb.generation(),
        });
        Ok(())
    }

    /// Point the cursor at an IP header embedded at `ip` (ICMP error
    /// payload). The caller must have validated the length.
    pub(crate) fn enter_inner(&mut self, ip: usize) -> Result<(), Reason> {
        let ihl = (self.skb.load_u8(ip)? & 0x0f) as usize;
        self.hdr = Some(Headers {
            ip,
            l4: ip + (ihl * 4).max(IPV4_HLEN),
            generation: self.skb.generation(),
        });
        Ok(())
    }

    fn headers(&self) -> Result<Headers, Reason> {
        match self.hdr {
            Some(h) if h.generation == self.skb.generation() => Ok(h),
            _ => Err(Reason::Short),
        }
    }

    pub fn ip_off(&self) -> Result<usize, Reason> {
        self.headers().map(|h| h.ip)
    }

    pub fn l4_off(&self) -> Result<usize, Reason> {
        self.headers().map(|h| h.l4)
    }

    pub fn ip_ihl(&self) -> Result<u8, Reason> {
        Ok(self.skb.load_u8(self.ip_off()?)? & 0x0f)
    }

    pub fn ip_tot_len(&self) -> Result<u16, Reason> {
        self.skb.load_be16(self.ip_off()? + ipv4::TOT_LEN)
    }

    pub fn ip_ttl(&self) -> Result<u8, Reason> {
        self.skb.load_u8(self.ip_off()? + ipv4::TTL)
    }

    pub fn ip_proto(&self) -> Result<u8, Reason> {
        self.skb.load_u8(self.ip_off()? + ipv4::PROTOCOL)
    }

    pub fn ip_saddr(&self) -> Result<Ipv4Addr, Reason> {
        self.skb.load_addr(self.ip_off()? + ipv4::SADDR)
    }

    pub fn ip_daddr(&self) -> Result<Ipv4Addr, Reason> {
        self.skb.load_addr(self.ip_off()? + ipv4::DADDR)
    }

    fn ip_frag(&self) -> Result<u16, Reason> {
        self.skb.load_be16(self.ip_off()? + ipv4::FRAG_OFF)
    }

    /// Don't-fragment bit set.
    pub fn ip_is_dnf(&self) -> Result<bool, Reason> {
        Ok(self.ip_frag()? & 0x4000 != 0)
    }

    /// Non-initial fragment.
    pub fn ip_frag_no(&self) -> Result<bool, Reason> {
        Ok(self.ip_frag()? & 0x1fff != 0)
    }

    pub fn l4_sport(&self) -> Result<u16, Reason> {
        self.skb.load_be16(self.l4_off()?)
    }

    pub fn l4_dport(&self) -> Result<u16, Reason> {
        self.skb.load_be16(self.l4_off()? + 2)
    }

    /// TCP flags byte.
    pub fn tcp_flags(&self) -> Result<u8, Reason> {
        self.skb.load_u8(self.l4_off()? + 13)
    }

    pub fn icmp_type(&self) -> Result<u8, Reason> {
        self.skb.load_u8(self.l4_off()?)
    }

    pub fn icmp_code(&self) -> Result<u8, Reason> {
        self.skb.load_u8(self.l4_off()? + 1)
    }
}
