//! Forwarding decision engine.
//!
//! Stages accumulate a [`Fwd`]; [`forward_or_drop`] turns it into the single
//! [`Verdict`] of the packet, attempting a fast path redirect when the
//! packet is moving towards the host and nothing disqualified it.

use crate::config::FastPathConfig;
use crate::ctx::TcCtx;
use crate::error::Reason;
use crate::maps::Maps;
use crate::skb::{CsumField, ETH_ALEN, ipv4};
use bitflags::bitflags;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FwdRes {
    /// Continue to the fallback stack
    #[default]
    Unspec,
    Shot,
    /// Redirect to the interface recorded in conntrack
    RedirIfindex,
    /// Send back out of the ingress interface
    RedirBack,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FibFlags: u32 {
        /// Route as locally generated output
        const OUTPUT = 1 << 1;
    }
}

impl Default for FibFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Forwarding decision under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fwd {
    pub res: FwdRes,
    pub reason: Reason,
    pub mark: u32,
    pub fib: bool,
    pub fib_flags: FibFlags,
}

impl Fwd {
    pub fn allow(mark: u32, fib: bool) -> Self {
        Self {
            mark,
            fib,
            ..Self::default()
        }
    }

    pub fn deny(reason: Reason) -> Self {
        Self {
            res: FwdRes::Shot,
            reason,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Let the fallback stack continue
    Unspec,
    Redirect { ifindex: u32 },
    Drop,
}

/// Final per-packet outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub action: Action,
    pub reason: Reason,
    /// Mark the packet carries on
    pub mark: u32,
    pub redirect_flags: FibFlags,
}

impl Verdict {
    /// Fallback with the packet's mark untouched.
    pub fn pass(reason: Reason, mark: u32) -> Self {
        Self {
            action: Action::Unspec,
            reason,
            mark,
            redirect_flags: FibFlags::empty(),
        }
    }

    pub fn drop(reason: Reason) -> Self {
        Self {
            action: Action::Drop,
            reason,
            mark: 0,
            redirect_flags: FibFlags::empty(),
        }
    }

    pub fn is_drop(&self) -> bool {
        self.action == Action::Drop
    }

    pub fn redirect_ifindex(&self) -> Option<u32> {
        match self.action {
            Action::Redirect { ifindex } => Some(ifindex),
            _ => None,
        }
    }
}

/// Emit the verdict for the accumulated decision.
pub fn forward_or_drop(ctx: &mut TcCtx<'_>, config: &FastPathConfig, maps: &Maps) -> Verdict {
    let fwd = ctx.fwd;

    if fwd.res == FwdRes::Shot {
        debug!(reason = %fwd.reason, "Final result=DENY");
        return Verdict::drop(fwd.reason);
    }

    if fwd.mark != 0 {
        ctx.skb.mark = fwd.mark;
    }
    let mark = ctx.skb.mark;

    let redirect = |ifindex| Verdict {
        action: Action::Redirect { ifindex },
        reason: fwd.reason,
        mark,
        redirect_flags: fwd.fib_flags,
    };

    match fwd.res {
        FwdRes::RedirBack => {
            debug!(ifindex = ctx.skb.ifindex, "Redirect back to ingress interface");
            return redirect(ctx.skb.ifindex);
        }
        FwdRes::RedirIfindex => {
            let ifindex = ctx.state.ct_result.ifindex_fwd;
            debug!(ifindex, "Redirect to conntrack interface");
            return redirect(ifindex);
        }
        FwdRes::Unspec | FwdRes::Shot => {}
    }

    if config.to_host() && fwd.fib {
        match try_fib(ctx, maps) {
            Ok(Some(ifindex)) => {
                debug!(ifindex, dst = %ctx.state.ip_dst, "FIB redirect");
                return redirect(ifindex);
            }
            Ok(None) => {}
            Err(reason) => return Verdict::drop(reason),
        }
    }

    debug!(mark = format_args!("{mark:#x}"), "Final result=ALLOW");
    Verdict::pass(fwd.reason, mark)
}

/// Software fast path: redirect straight to a local workload whose
/// neighbour entry is known. `Ok(None)` means fall back to the stack.
fn try_fib(ctx: &mut TcCtx<'_>, maps: &Maps) -> Result<Option<u32>, Reason> {
    let dst = ctx.state.ip_dst;
    let Some(route) = maps.routes.lookup(dst) else {
        return Ok(None);
    };
    if !route.flags.is_local_workload() || route.if_index == 0 {
        return Ok(None);
    }
    let Some(arp) = maps.arp.lookup(dst, route.if_index) else {
        debug!(%dst, ifindex = route.if_index, "FIB: no neighbour, fall back");
        return Ok(None);
    };

    ctx.refresh_validate(0)?;
    let ip = ctx.ip_off()?;
    let ttl = ctx.ip_ttl()?;
    if ttl <= 1 {
        // the stack generates the time-exceeded reply
        return Ok(None);
    }
    // TTL and protocol share one checksummed word
    let proto = ctx.ip_proto()?;
    let word = u16::from_be_bytes([ttl - 1, proto]);
    ctx.skb
        .rewrite_be16(ip + ipv4::TTL, word, &[CsumField::Plain(ip + ipv4::CHECK)])
        .map_err(|_| Reason::CsumFail)?;

    let eth = ctx.skb.bytes_mut(0, 2 * ETH_ALEN)?;
    eth[..ETH_ALEN].copy_from_slice(&arp.mac_dst);
    eth[ETH_ALEN..].copy_from_slice(&arp.mac_src);
    Ok(Some(route.if_index))
}
