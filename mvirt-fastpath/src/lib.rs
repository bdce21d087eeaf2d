//! mvirt-fastpath: policy-enforcing packet fast path for cluster networking.
//!
//! Every packet crossing a workload or host interface runs through one
//! [`FastPath`] per hook. The pipeline parses the frame, consults connection
//! tracking, resolves service NAT, hands new flows to an external admission
//! policy and then rewrites, encapsulates or answers the packet before
//! deciding where it goes.
//!
//! # Architecture
//!
//! ```text
//! frame --> parse --> (VXLAN decap) --> conntrack --> NAT --> policy
//!                                                               |
//!            verdict <-- forward_or_drop <-- rewrite / encap <--+
//!                                 ^
//!                                 +-- ICMP reply (TTL, MTU, no backend)
//! ```
//!
//! All hooks of a node share one [`Maps`] bundle. The control plane updates
//! the tables and swaps policy programs in the [`JumpTable`] while packets
//! are being processed.

pub mod arp;
pub mod cleaner;
pub mod config;
pub mod conntrack;
pub mod csum;
pub mod ctx;
pub mod error;
pub mod failsafe;
pub mod fwd;
pub mod icmp;
pub mod jump;
pub mod maps;
pub mod marks;
pub mod nat;
pub mod parsing;
pub mod routes;
pub mod skb;
pub mod state;
pub mod tc;
pub mod vxlan;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use cleaner::ConnTrackCleaner;
pub use config::{FastPathConfig, Hook};
pub use error::{ConfigError, CtError, EncapError, Reason};
pub use fwd::{Action, Verdict};
pub use jump::{AllowAll, DenyAll, JumpTable, JumpTarget, PolicyProgram, ProgIndex};
pub use maps::Maps;
pub use skb::SkBuff;
pub use state::{PolicyResult, TcState};
pub use tc::FastPath;
