//! Packet mark bits shared with the fallback stack and with later hooks
//! processing the same packet.
//!
//! The values are part of the wire contract with the host's routing rules
//! and firewall, so they must not change.

/// All marks owned by the fast path live under this prefix.
pub const CALICO: u32 = 0xc000_0000;
pub const CALICO_MASK: u32 = 0xe000_0000;

/// Packet has been processed by a fast path hook.
pub const SEEN: u32 = 0xc100_0000;
pub const SEEN_MASK: u32 = CALICO_MASK | SEEN;

/// Pre-approved; later hooks may skip all processing.
pub const BYPASS: u32 = SEEN | 0x0200_0000;
pub const BYPASS_MASK: u32 = SEEN_MASK | BYPASS | 0x00f0_0000;

/// Not handled here, let the fallback stack's conntrack decide.
pub const FALLTHROUGH: u32 = SEEN | 0x0400_0000;

/// Pre-approved for forwarding as-is.
pub const BYPASS_FWD: u32 = BYPASS | 0x0030_0000;

/// Pre-approved for forwarding, but the outer source must become the host IP.
pub const BYPASS_FWD_SRC_FIXUP: u32 = BYPASS | 0x0050_0000;

/// Encapsulated by us, the fallback stack must not apply RPF.
pub const SKIP_RPF: u32 = BYPASS | 0x0040_0000;

/// Masquerade via the fallback stack's SNAT rules.
pub const NAT_OUT: u32 = BYPASS | 0x0080_0000;

/// Metadata bit set by the XDP program when it accepted a packet.
pub const META_ACCEPTED_BY_XDP: u32 = 0x80;

/// Whether another fast path hook already handled the packet.
pub fn skb_seen(mark: u32) -> bool {
    mark & SEEN_MASK == SEEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_values() {
        assert_eq!(BYPASS, 0xc300_0000);
        assert_eq!(FALLTHROUGH, 0xc500_0000);
        assert_eq!(BYPASS_FWD, 0xc330_0000);
        assert_eq!(BYPASS_FWD_SRC_FIXUP, 0xc350_0000);
        assert_eq!(SKIP_RPF, 0xc340_0000);
        assert_eq!(NAT_OUT, 0xc380_0000);
        assert_eq!(BYPASS_MASK, 0xe3f0_0000);
    }

    #[test]
    fn test_bypass_marks_are_seen() {
        for mark in [
            SEEN,
            BYPASS,
            BYPASS_FWD,
            BYPASS_FWD_SRC_FIXUP,
            SKIP_RPF,
            NAT_OUT,
            FALLTHROUGH,
        ] {
            assert!(skb_seen(mark), "{mark:#x}");
        }
        assert!(!skb_seen(0));
        assert!(!skb_seen(0x1000));
    }

    #[test]
    fn test_bypass_mask_separates_forward_marks() {
        assert_eq!(BYPASS_FWD & BYPASS_MASK, BYPASS_FWD);
        assert_eq!(BYPASS_FWD_SRC_FIXUP & BYPASS_MASK, BYPASS_FWD_SRC_FIXUP);
        assert_ne!(SEEN & BYPASS_MASK, BYPASS_FWD);
    }
}
