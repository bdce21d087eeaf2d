//! Error and diagnostic types.
//!
//! `Reason` is the per-packet diagnostic code carried by every verdict. It is
//! also the error type of the stage functions, so a failing stage simply
//! returns `Err(reason)` and the orchestrator turns that into a drop.

use thiserror::Error;

/// Diagnostic reason attached to a forwarding verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Error)]
pub enum Reason {
    /// Catch-all for unclassified decisions (including policy denies)
    #[default]
    #[error("unknown")]
    Unknown,

    /// Buffer does not contain the headers the stage needs
    #[error("packet too short")]
    Short,

    /// IPv4 header length below the minimum
    #[error("malformed IP header")]
    IpMalformed,

    /// IPv4 options present where they are not allowed
    #[error("disallowed IP options")]
    IpOptions,

    /// Checksum could not be patched
    #[error("checksum update failed")]
    CsumFail,

    /// Source is not allowed to send this traffic (spoofing, rogue tunnel peer)
    #[error("unauthorized source")]
    UnauthSource,

    /// No route known for a destination that needs one
    #[error("unknown route")]
    RtUnknown,

    /// Tunnel encapsulation failed
    #[error("encapsulation failed")]
    EncapFail,

    /// Pre-approved by an earlier hop (informational, not a drop)
    #[error("bypass mark")]
    Bypass,

    /// Accepted by the XDP program (informational, not a drop)
    #[error("accepted by XDP")]
    AcceptedByXdp,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Connection tracking errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CtError {
    /// Table reached its configured capacity
    #[error("conntrack table full ({0} entries)")]
    TableFull(usize),
}

/// Tunnel encapsulation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncapError {
    #[error("packet too short to encapsulate: {0} bytes")]
    TooShort(usize),

    #[error("encapsulated packet exceeds maximum IP length: {0} bytes")]
    TooLong(usize),
}

impl From<EncapError> for Reason {
    fn from(_: EncapError) -> Self {
        Reason::EncapFail
    }
}
