//! IPv4 and IPv6 header views.
//!
//! Grounded on `IpPacket.{hpp,cpp}`: field accessors/mutators mirror
//! `getSrcAddr`/`setAddress`/`getProtoType`/etc, and every mutator routes
//! through [`crate::checksum::adjust_checksum_u32`] the same way the
//! original's setters are documented to "adjust the checksum when run".
//! Only the first IPv6 extension header is walked (no Non-goal-excluded
//! extension-header chain traversal).

use crate::addr::IpAddr;
use crate::checksum::{adjust_checksum_bytes, adjust_checksum_u16, adjust_checksum_u32, IpChecksum};
use crate::error::{Result, TermError};
use crate::packet::{require_len, AddressType, Proto};
use std::net::{Ipv4Addr, Ipv6Addr};

pub const IPV4_HEADER_SIZE: usize = 20;
pub const IPV6_HEADER_SIZE: usize = 40;

/// A parsed, borrowed view into an IPv4 or IPv6 header at the start of
/// `data`. Does not own the buffer; callers keep the backing `BytesMut`
/// alive and pass a mutable slice in for in-place header mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Examines the first byte of `data` to determine the IP version and total
/// header size (v4's IHL is variable; v6's is fixed at 40 bytes, only the
/// first next-header is reported — extension header chains are not walked).
pub fn examine(data: &[u8]) -> Result<(IpVersion, usize, Proto)> {
    require_len(data, 1, "ip header")?;
    let version = data[0] >> 4;
    match version {
        4 => {
            require_len(data, IPV4_HEADER_SIZE, "ipv4 header")?;
            let ihl = (data[0] & 0x0F) as usize * 4;
            if ihl < IPV4_HEADER_SIZE {
                return Err(TermError::InvalidData("ipv4 IHL too small".into()));
            }
            require_len(data, ihl, "ipv4 header with options")?;
            let proto = Proto::from_number(data[9]);
            Ok((IpVersion::V4, ihl, proto))
        }
        6 => {
            require_len(data, IPV6_HEADER_SIZE, "ipv6 header")?;
            let proto = Proto::from_number(data[6]);
            Ok((IpVersion::V6, IPV6_HEADER_SIZE, proto))
        }
        other => Err(TermError::InvalidData(format!("unknown ip version {other}"))),
    }
}

/// Offset of the transport-layer checksum field within a full packet buffer
/// (`ihl`/`40` bytes of IP header followed by the transport header),
/// mirroring `IpPacket::setAddress`'s `pDesc.protoType` switch over
/// TCP/UDP/ICMP header checksums. `None` if the protocol has no checksum
/// this crate knows how to locate, or the buffer doesn't reach it.
fn transport_checksum_offset(proto: u8, header_len: usize, total_len: usize) -> Option<usize> {
    let rel = match proto {
        6 => 16,     // TCP
        17 => 6,     // UDP
        1 | 58 => 2, // ICMP / ICMPv6
        _ => return None,
    };
    let offset = header_len + rel;
    (offset + 2 <= total_len).then_some(offset)
}

/// A read-only view of the fields this crate needs from an IPv4 header.
pub struct Ipv4View<'a> {
    data: &'a [u8],
}

impl<'a> Ipv4View<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        require_len(data, IPV4_HEADER_SIZE, "ipv4 header")?;
        Ok(Self { data })
    }

    pub fn ihl(&self) -> usize {
        (self.data[0] & 0x0F) as usize * 4
    }

    pub fn tos(&self) -> u8 {
        self.data[1]
    }

    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn identification(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn is_more_fragments(&self) -> bool {
        (self.data[6] & 0x20) != 0
    }

    pub fn fragment_offset(&self) -> u16 {
        u16::from_be_bytes([self.data[6] & 0x1F, self.data[7]])
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    pub fn protocol(&self) -> u8 {
        self.data[9]
    }

    pub fn header_checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[10], self.data[11]])
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.ihl()..]
    }
}

/// A mutable view that keeps the IP header checksum consistent as fields
/// are changed, mirroring `IpPacket::setAddress`'s "adjusts checksum" note.
pub struct Ipv4ViewMut<'a> {
    data: &'a mut [u8],
}

impl<'a> Ipv4ViewMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<Self> {
        require_len(data, IPV4_HEADER_SIZE, "ipv4 header")?;
        Ok(Self { data })
    }

    /// Replaces the source or destination address, adjusting the IP header
    /// checksum and, if `data` extends into a TCP/UDP/ICMP header, that
    /// transport checksum too (its pseudo-header covers the address being
    /// replaced). `data` should be the whole packet, not just the header,
    /// for the transport-checksum fixup to apply.
    pub fn set_address(&mut self, which: AddressType, addr: Ipv4Addr) {
        let offset = match which {
            AddressType::Source => 12,
            AddressType::Dest => 16,
        };
        let old = u32::from_be_bytes(self.data[offset..offset + 4].try_into().unwrap());
        let new = u32::from_be_bytes(addr.octets());
        let old_checksum = u16::from_be_bytes([self.data[10], self.data[11]]);
        let new_checksum = adjust_checksum_u32(old_checksum, old, new);
        self.data[offset..offset + 4].copy_from_slice(&new.to_be_bytes());
        self.data[10..12].copy_from_slice(&new_checksum.to_be_bytes());

        let ihl = (self.data[0] & 0x0F) as usize * 4;
        let proto = self.data[9];
        if let Some(csum_off) = transport_checksum_offset(proto, ihl, self.data.len()) {
            let old_t_checksum = u16::from_be_bytes([self.data[csum_off], self.data[csum_off + 1]]);
            // A zero UDP checksum means "checksum not used" (RFC 768) and
            // must stay zero rather than become a bogus nonzero value.
            if !(proto == 17 && old_t_checksum == 0) {
                let new_t_checksum = adjust_checksum_u32(old_t_checksum, old, new);
                self.data[csum_off..csum_off + 2].copy_from_slice(&new_t_checksum.to_be_bytes());
            }
        }
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        let old = self.data[8];
        let old_checksum = u16::from_be_bytes([self.data[10], self.data[11]]);
        // TTL shares a 16-bit word with the protocol byte; adjust as a u16
        // word the way IpPacket::adjustChecksum is invoked for single-byte
        // field changes elsewhere in the header.
        let old_word = u16::from_be_bytes([old, self.data[9]]);
        let new_word = u16::from_be_bytes([ttl, self.data[9]]);
        let new_checksum = adjust_checksum_u16(old_checksum, old_word, new_word);
        self.data[8] = ttl;
        self.data[10..12].copy_from_slice(&new_checksum.to_be_bytes());
    }

    pub fn recompute_header_checksum(&mut self) {
        self.data[10] = 0;
        self.data[11] = 0;
        let ihl = (self.data[0] & 0x0F) as usize * 4;
        let cksum = IpChecksum::of(&self.data[..ihl]);
        self.data[10..12].copy_from_slice(&cksum.to_be_bytes());
    }
}

/// A read-only view of the fields this crate needs from an IPv6 header
/// (only the first next-header field is exposed; extension header chains
/// are not walked).
pub struct Ipv6View<'a> {
    data: &'a [u8],
}

impl<'a> Ipv6View<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        require_len(data, IPV6_HEADER_SIZE, "ipv6 header")?;
        Ok(Self { data })
    }

    pub fn traffic_class(&self) -> u8 {
        ((self.data[0] & 0x0F) << 4) | (self.data[1] >> 4)
    }

    pub fn payload_length(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn next_header(&self) -> u8 {
        self.data[6]
    }

    pub fn hop_limit(&self) -> u8 {
        self.data[7]
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(<[u8; 16]>::try_from(&self.data[8..24]).unwrap())
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(<[u8; 16]>::try_from(&self.data[24..40]).unwrap())
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[IPV6_HEADER_SIZE..]
    }
}

pub struct Ipv6ViewMut<'a> {
    data: &'a mut [u8],
}

impl<'a> Ipv6ViewMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<Self> {
        require_len(data, IPV6_HEADER_SIZE, "ipv6 header")?;
        Ok(Self { data })
    }

    /// Replaces the source or destination address. IPv6 has no header
    /// checksum, but if `data` extends into a TCP/UDP/ICMPv6 header, that
    /// transport checksum is adjusted word-at-a-time the same way
    /// `IpPacket::setAddress` does for IPv6 (its pseudo-header always
    /// includes the address).
    pub fn set_address(&mut self, which: AddressType, addr: Ipv6Addr) {
        let offset = match which {
            AddressType::Source => 8,
            AddressType::Dest => 24,
        };
        let mut old_bytes = [0u8; 16];
        old_bytes.copy_from_slice(&self.data[offset..offset + 16]);
        let new_bytes = addr.octets();
        self.data[offset..offset + 16].copy_from_slice(&new_bytes);

        let proto = self.data[6];
        if let Some(csum_off) = transport_checksum_offset(proto, IPV6_HEADER_SIZE, self.data.len()) {
            let old_t_checksum = u16::from_be_bytes([self.data[csum_off], self.data[csum_off + 1]]);
            if !(proto == 17 && old_t_checksum == 0) {
                let new_t_checksum = adjust_checksum_bytes(old_t_checksum, &old_bytes, &new_bytes);
                self.data[csum_off..csum_off + 2].copy_from_slice(&new_t_checksum.to_be_bytes());
            }
        }
    }

    pub fn set_hop_limit(&mut self, hop_limit: u8) {
        self.data[7] = hop_limit;
    }
}

/// Reads both addresses out of an already-classified header, independent of
/// IP version, for flow-descriptor setup.
pub fn addresses(data: &[u8], version: IpVersion) -> Result<(IpAddr, IpAddr)> {
    match version {
        IpVersion::V4 => {
            let v = Ipv4View::new(data)?;
            Ok((IpAddr::V4(v.src_addr()), IpAddr::V4(v.dst_addr())))
        }
        IpVersion::V6 => {
            let v = Ipv6View::new(data)?;
            Ok((IpAddr::V6(v.src_addr()), IpAddr::V6(v.dst_addr())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_v4() -> Vec<u8> {
        let mut h = vec![0u8; 20];
        h[0] = 0x45;
        h[8] = 64; // ttl
        h[9] = 6; // tcp
        h[12..16].copy_from_slice(&[10, 0, 0, 1]);
        h[16..20].copy_from_slice(&[10, 0, 0, 2]);
        let mut v = Ipv4ViewMut::new(&mut h).unwrap();
        v.recompute_header_checksum();
        h
    }

    #[test]
    fn examine_classifies_v4_tcp() {
        let h = sample_v4();
        let (version, ihl, proto) = examine(&h).unwrap();
        assert_eq!(version, IpVersion::V4);
        assert_eq!(ihl, 20);
        assert_eq!(proto, Proto::Tcp);
    }

    #[test]
    fn set_address_keeps_checksum_consistent() {
        let mut h = sample_v4();
        {
            let mut v = Ipv4ViewMut::new(&mut h).unwrap();
            v.set_address(AddressType::Source, Ipv4Addr::new(192, 168, 1, 1));
        }
        let incremental = u16::from_be_bytes([h[10], h[11]]);

        let mut recomputed = h.clone();
        {
            let mut v = Ipv4ViewMut::new(&mut recomputed).unwrap();
            v.recompute_header_checksum();
        }
        assert_eq!(incremental, u16::from_be_bytes([recomputed[10], recomputed[11]]));
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(examine(&[0x45, 0, 0]).is_err());
    }

    #[test]
    fn examine_classifies_v6() {
        let mut h = vec![0u8; 40];
        h[0] = 0x60;
        h[6] = 17; // udp
        let (version, size, proto) = examine(&h).unwrap();
        assert_eq!(version, IpVersion::V6);
        assert_eq!(size, 40);
        assert_eq!(proto, Proto::Udp);
    }
}
