//! Packet buffer with the metadata the pipeline reads and writes.
//!
//! All field access is bounds checked and returns `Reason::Short` instead of
//! panicking. Checksum-carrying fields are only written through
//! [`SkBuff::rewrite_be32`] / [`SkBuff::rewrite_be16`], which take the new
//! value plus the list of checksum fields covering it and patch each one
//! incrementally.
//!
//! Operations that move bytes (`insert`, `remove`, `replace`) bump the
//! buffer generation; header offsets recorded against an older generation
//! are rejected (see `TcCtx`).

use crate::csum;
use crate::error::Reason;
use std::net::Ipv4Addr;

pub const ETH_HLEN: usize = 14;
pub const ETH_ALEN: usize = 6;
pub const IPV4_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;
pub const TCP_HLEN: usize = 20;
pub const ICMP_HLEN: usize = 8;

/// Minimal frame sizes up to and including the transport header.
pub const UDP_SIZE: usize = ETH_HLEN + IPV4_HLEN + UDP_HLEN;
pub const TCP_SIZE: usize = ETH_HLEN + IPV4_HLEN + TCP_HLEN;
pub const ICMP_SIZE: usize = ETH_HLEN + IPV4_HLEN + ICMP_HLEN;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;
pub const ETH_P_IPV6: u16 = 0x86dd;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_IPIP: u8 = 4;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Offsets of fields within the IPv4 header.
pub mod ipv4 {
    pub const TOT_LEN: usize = 2;
    pub const FRAG_OFF: usize = 6;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECK: usize = 10;
    pub const SADDR: usize = 12;
    pub const DADDR: usize = 16;
}

/// Offsets of the checksum field within each transport header.
pub const TCP_CHECK: usize = 16;
pub const UDP_CHECK: usize = 6;
pub const ICMP_CHECK: usize = 2;

/// A checksum field affected by a rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsumField {
    /// IPv4, TCP or ICMP checksum at this offset
    Plain(usize),
    /// UDP checksum: zero means absent, a computed zero is sent as all ones
    Udp(usize),
}

/// An owned frame (starting at the Ethernet header) plus stack metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkBuff {
    data: Vec<u8>,
    generation: u64,
    /// Interface the packet was received on / is being sent from
    pub ifindex: u32,
    pub mark: u32,
    /// Ethertype hint from the stack; unavailable (0) at XDP
    pub protocol: u16,
    /// Cookie of the originating local socket, 0 if none
    pub socket_cookie: u64,
    /// Packet is a GSO super-packet
    pub gso: bool,
    /// Metadata left by the XDP program
    pub xdp_meta: u32,
}

impl SkBuff {
    pub fn new(data: Vec<u8>, ifindex: u32) -> Self {
        let protocol = match data.get(12..14) {
            Some(b) => u16::from_be_bytes([b[0], b[1]]),
            None => 0,
        };
        Self {
            data,
            generation: 0,
            ifindex,
            mark: 0,
            protocol,
            socket_cookie: 0,
            gso: false,
            xdp_meta: 0,
        }
    }

    pub fn with_mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }

    pub fn with_socket_cookie(mut self, cookie: u64) -> Self {
        self.socket_cookie = cookie;
        self
    }

    pub fn with_gso(mut self, gso: bool) -> Self {
        self.gso = gso;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn bytes(&self, off: usize, len: usize) -> Result<&[u8], Reason> {
        self.data.get(off..off + len).ok_or(Reason::Short)
    }

    pub(crate) fn bytes_mut(&mut self, off: usize, len: usize) -> Result<&mut [u8], Reason> {
        self.data.get_mut(off..off + len).ok_or(Reason::Short)
    }

    /// Insert `bytes` at `at`, shifting the rest of the frame.
    pub(crate) fn insert(&mut self, at: usize, bytes: &[u8]) -> Result<(), Reason> {
        if at > self.data.len() {
            return Err(Reason::Short);
        }
        self.data.splice(at..at, bytes.iter().copied());
        self.generation += 1;
        Ok(())
    }

    /// Remove `len` bytes starting at `at`.
    pub(crate) fn remove(&mut self, at: usize, len: usize) -> Result<(), Reason> {
        if at + len > self.data.len() {
            return Err(Reason::Short);
        }
        self.data.drain(at..at + len);
        self.generation += 1;
        Ok(())
    }

    /// Replace the whole frame.
    pub(crate) fn replace(&mut self, data: Vec<u8>) {
        self.data = data;
        self.generation += 1;
    }

    pub(crate) fn load_u8(&self, off: usize) -> Result<u8, Reason> {
        self.data.get(off).copied().ok_or(Reason::Short)
    }

    pub(crate) fn load_be16(&self, off: usize) -> Result<u16, Reason> {
        let b = self.bytes(off, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn load_be32(&self, off: usize) -> Result<u32, Reason> {
        let b = self.bytes(off, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn load_addr(&self, off: usize) -> Result<Ipv4Addr, Reason> {
        self.load_be32(off).map(Ipv4Addr::from)
    }

    pub(crate) fn store_u8(&mut self, off: usize, value: u8) -> Result<(), Reason> {
        *self.data.get_mut(off).ok_or(Reason::Short)? = value;
        Ok(())
    }

    pub(crate) fn store_be16(&mut self, off: usize, value: u16) -> Result<(), Reason> {
        self.bytes_mut(off, 2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Patch one checksum field for a 32-bit change.
    fn patch32(&mut self, field: CsumField, old: u32, new: u32) -> Result<(), Reason> {
        let (off, udp) = match field {
            CsumField::Plain(off) => (off, false),
            CsumField::Udp(off) => (off, true),
        };
        let check = self.load_be16(off).map_err(|_| Reason::CsumFail)?;
        if udp && check == 0 {
            return Ok(());
        }
        let mut patched = csum::replace32(check, old, new);
        if udp {
            patched = csum::mangle_udp_zero(patched);
        }
        self.store_be16(off, patched).map_err(|_| Reason::CsumFail)
    }

    fn patch16(&mut self, field: CsumField, old: u16, new: u16) -> Result<(), Reason> {
        let (off, udp) = match field {
            CsumField::Plain(off) => (off, false),
            CsumField::Udp(off) => (off, true),
        };
        let check = self.load_be16(off).map_err(|_| Reason::CsumFail)?;
        if udp && check == 0 {
            return Ok(());
        }
        let mut patched = csum::replace16(check, old, new);
        if udp {
            patched = csum::mangle_udp_zero(patched);
        }
        self.store_be16(off, patched).map_err(|_| Reason::CsumFail)
    }

    /// Write a 32-bit field and patch every checksum covering it.
    /// Returns the previous value.
    pub fn rewrite_be32(
        &mut self,
        off: usize,
        new: u32,
        csums: &[CsumField],
    ) -> Result<u32, Reason> {
        let old = self.load_be32(off)?;
        self.bytes_mut(off, 4)?.copy_from_slice(&new.to_be_bytes());
        for field in csums {
            self.patch32(*field, old, new)?;
        }
        Ok(old)
    }

    /// Write a 16-bit field and patch every checksum covering it.
    /// Returns the previous value.
    pub fn rewrite_be16(
        &mut self,
        off: usize,
        new: u16,
        csums: &[CsumField],
    ) -> Result<u16, Reason> {
        let old = self.load_be16(off)?;
        self.store_be16(off, new)?;
        for field in csums {
            self.patch16(*field, old, new)?;
        }
        Ok(old)
    }

    pub fn rewrite_addr(
        &mut self,
        off: usize,
        new: Ipv4Addr,
        csums: &[CsumField],
    ) -> Result<Ipv4Addr, Reason> {
        self.rewrite_be32(off, u32::from(new), csums).map(Ipv4Addr::from)
    }
}
