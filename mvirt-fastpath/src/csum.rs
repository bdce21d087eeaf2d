//! Internet checksum arithmetic.
//!
//! Rewrites patch the existing checksum with the delta of the changed bytes
//! (RFC 1624, `HC' = ~(~HC + ~m + m')`) instead of recomputing over the
//! whole packet.

/// Fold a 32-bit accumulator into 16 bits with end-around carry.
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Ones' complement sum of `data` (odd trailing byte padded with zero).
pub fn sum(data: &[u8]) -> u32 {
    let mut acc: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        acc += u16::from_be_bytes([c[0], c[1]]) as u32;
        acc = (acc & 0xffff) + (acc >> 16);
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u32) << 8;
    }
    acc
}

/// Full checksum of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum(data))
}

/// Patch `check` for a 16-bit word changing from `old` to `new`.
pub fn replace16(check: u16, old: u16, new: u16) -> u16 {
    let acc = (!check) as u32 + (!old) as u32 + new as u32;
    !fold(acc)
}

/// Patch `check` for a 32-bit field changing from `old` to `new`.
pub fn replace32(check: u16, old: u32, new: u32) -> u16 {
    let acc = (!check) as u32
        + (!(old >> 16) as u16) as u32
        + (!(old as u16)) as u32
        + (new >> 16)
        + (new & 0xffff);
    !fold(acc)
}

/// UDP uses zero for "no checksum"; a computed zero is sent as all ones.
pub fn mangle_udp_zero(check: u16) -> u16 {
    if check == 0 { 0xffff } else { check }
}
