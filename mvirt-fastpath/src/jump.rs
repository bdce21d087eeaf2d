//! Jump table for the non-returning hops of the pipeline.
//!
//! Slot 0 holds the externally compiled admission policy; slots 1 and 2
//! are the pipeline's own re-entry points (post-policy accept and ICMP
//! reply). The control plane swaps slots at any time; a hop that finds its
//! slot empty is handled by the caller.

use crate::state::{PolicyResult, TcState};
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Bound on hops per packet.
pub const MAX_TAIL_CALLS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ProgIndex {
    Policy = 0,
    Allowed = 1,
    Icmp = 2,
}

impl ProgIndex {
    pub const COUNT: usize = 3;

    pub fn slot(self) -> usize {
        self as usize
    }
}

/// An admission policy stage.
///
/// Returns `NoMatch` when no rule reached a terminal action; the pipeline
/// treats that as a deny.
pub trait PolicyProgram: Send + Sync {
    fn execute(&self, state: &TcState) -> PolicyResult;
}

/// Policy that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PolicyProgram for AllowAll {
    fn execute(&self, _state: &TcState) -> PolicyResult {
        PolicyResult::Allow
    }
}

/// Policy that denies everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl PolicyProgram for DenyAll {
    fn execute(&self, _state: &TcState) -> PolicyResult {
        PolicyResult::Deny
    }
}

impl<F> PolicyProgram for F
where
    F: Fn(&TcState) -> PolicyResult + Send + Sync,
{
    fn execute(&self, state: &TcState) -> PolicyResult {
        self(state)
    }
}

#[derive(Clone)]
pub enum JumpTarget {
    Policy(Arc<dyn PolicyProgram>),
    /// Post-policy accept entry point
    Accepted,
    /// ICMP reply entry point
    Icmp,
}

impl fmt::Debug for JumpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JumpTarget::Policy(_) => f.write_str("Policy"),
            JumpTarget::Accepted => f.write_str("Accepted"),
            JumpTarget::Icmp => f.write_str("Icmp"),
        }
    }
}

pub struct JumpTable {
    slots: ArcSwap<Vec<Option<JumpTarget>>>,
}

impl Default for JumpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JumpTable {
    /// All slots empty.
    pub fn new() -> Self {
        Self {
            slots: ArcSwap::from_pointee(vec![None; ProgIndex::COUNT]),
        }
    }

    /// Re-entry points installed, no policy yet.
    pub fn with_core_programs() -> Self {
        let table = Self::new();
        table.set(ProgIndex::Allowed, JumpTarget::Accepted);
        table.set(ProgIndex::Icmp, JumpTarget::Icmp);
        table
    }

    pub fn set(&self, index: ProgIndex, target: JumpTarget) {
        debug!(?index, ?target, "Jump slot set");
        self.slots.rcu(|current| {
            let mut next = Vec::clone(current);
            next[index.slot()] = Some(target.clone());
            next
        });
    }

    pub fn set_policy(&self, program: Arc<dyn PolicyProgram>) {
        self.set(ProgIndex::Policy, JumpTarget::Policy(program));
    }

    pub fn clear(&self, index: ProgIndex) {
        debug!(?index, "Jump slot cleared");
        self.slots.rcu(|current| {
            let mut next = Vec::clone(current);
            next[index.slot()] = None;
            next
        });
    }

    pub fn get(&self, index: ProgIndex) -> Option<JumpTarget> {
        self.slots.load().get(index.slot()).cloned().flatten()
    }
}
