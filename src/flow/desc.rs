//! Flow descriptor: the address/port tuple identifying one flow.
//!
//! Grounded on `FlowDesc.hpp`: a 16-byte (v4) or 40-byte (v6) value with a
//! `type` tag, protocol number, client/server ports and addresses.
//! `hash()` ports the dual CRC32C-or-FNV-1a path: `crc32fast` (a
//! pack-grounded dependency, see DESIGN.md) is used as the hardware-
//! accelerated path — note this computes the CRC-32/IEEE polynomial, not
//! CRC32C/Castagnoli, a deliberate documented substitution since no
//! pack-grounded `crc32c` crate exists and hand-rolled SSE4.2 intrinsics
//! would require `unsafe`, which this crate forbids. The software fallback
//! is a faithful FNV-1a port, reading bytes from the end of the struct
//! toward the start exactly as the original's `for (i = len; i > 0;)` loop
//! does.

use crate::addr::IpAddr;
use std::net::{Ipv4Addr, Ipv6Addr};

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Bit 15 of `heProto` marks a non-initial IPv4 fragment, so later fragments
/// (which carry no transport header of their own) never alias the bucket of
/// the flow's first fragment.
const NON_INITIAL_FRAGMENT_BIT: u16 = 0x8000;

/// Identifies one flow by its 5-tuple (here represented as client/server
/// roles rather than raw source/dest, matching the original's
/// client-vs-server framing for NAT-aware lookups).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowDescriptor {
    pub proto: u16,
    /// Set when this descriptor was built from a non-initial IPv4 fragment.
    /// Folded into `heProto`'s bit 15 for hashing and the wire layout; kept
    /// as its own field here rather than pre-packed into `proto` so callers
    /// can read/compare the protocol number directly.
    pub non_initial_fragment: bool,
    pub client_port: u16,
    pub server_port: u16,
    pub client_addr: IpAddr,
    pub server_addr: IpAddr,
}

impl FlowDescriptor {
    pub fn new_v4(
        proto: u16,
        client_addr: Ipv4Addr,
        client_port: u16,
        server_addr: Ipv4Addr,
        server_port: u16,
    ) -> Self {
        Self {
            proto,
            non_initial_fragment: false,
            client_port,
            server_port,
            client_addr: IpAddr::V4(client_addr),
            server_addr: IpAddr::V4(server_addr),
        }
    }

    pub fn new_v6(
        proto: u16,
        client_addr: Ipv6Addr,
        client_port: u16,
        server_addr: Ipv6Addr,
        server_port: u16,
    ) -> Self {
        Self {
            proto,
            non_initial_fragment: false,
            client_port,
            server_port,
            client_addr: IpAddr::V6(client_addr),
            server_addr: IpAddr::V6(server_addr),
        }
    }

    /// Returns a copy of this descriptor with the non-initial-fragment bit
    /// set, mirroring `setupFlowDesc`'s fragment handling.
    pub fn with_non_initial_fragment(mut self, non_initial_fragment: bool) -> Self {
        self.non_initial_fragment = non_initial_fragment;
        self
    }

    pub fn is_valid(&self) -> bool {
        matches!((self.client_addr, self.server_addr), (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)))
    }

    /// True if this is a UDP flow (proto 17) to server port 53 (DNS).
    pub fn is_udp_dns(&self) -> bool {
        self.is_valid() && self.proto == 17 && self.server_port == 53
    }

    /// `heProto`: the protocol number in the low byte, non-initial-fragment
    /// flag in bit 15, host-endian, matching the wire layout in spec §6.
    fn he_proto(&self) -> u16 {
        let flag = if self.non_initial_fragment { NON_INITIAL_FRAGMENT_BIT } else { 0 };
        (self.proto & 0x00FF) | flag
    }

    fn raw_bytes(&self) -> Vec<u8> {
        let is_v4 = matches!(self.client_addr, IpAddr::V4(_));
        let mut out = Vec::with_capacity(if is_v4 { 16 } else { 40 });
        out.push(if is_v4 { 4 } else { 6 });
        out.push(0); // reserved
        out.extend_from_slice(&self.he_proto().to_ne_bytes());
        out.extend_from_slice(&self.client_port.to_be_bytes());
        out.extend_from_slice(&self.server_port.to_be_bytes());
        match (self.client_addr, self.server_addr) {
            (IpAddr::V4(c), IpAddr::V4(s)) => {
                out.extend_from_slice(&c.octets());
                out.extend_from_slice(&s.octets());
            }
            (IpAddr::V6(c), IpAddr::V6(s)) => {
                out.extend_from_slice(&c.octets());
                out.extend_from_slice(&s.octets());
            }
            _ => {}
        }
        out
    }

    /// Hash used for flow-map bucket selection. Not a cryptographic hash
    /// and not meant to be stable across process restarts or platforms.
    pub fn hash(&self) -> u32 {
        let bytes = self.raw_bytes();
        if std::is_x86_feature_detected!("sse4.2") {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&bytes);
            hasher.finalize()
        } else {
            fnv1a(&bytes)
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes.iter().rev() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_udp_dns_detects_server_port_53() {
        let f = FlowDescriptor::new_v4(17, Ipv4Addr::new(10, 0, 0, 1), 5000, Ipv4Addr::new(8, 8, 8, 8), 53);
        assert!(f.is_udp_dns());

        let not_dns = FlowDescriptor::new_v4(17, Ipv4Addr::new(10, 0, 0, 1), 5000, Ipv4Addr::new(8, 8, 8, 8), 80);
        assert!(!not_dns.is_udp_dns());
    }

    #[test]
    fn hash_is_deterministic_and_distinguishes_flows() {
        let a = FlowDescriptor::new_v4(6, Ipv4Addr::new(10, 0, 0, 1), 1111, Ipv4Addr::new(10, 0, 0, 2), 80);
        let b = FlowDescriptor::new_v4(6, Ipv4Addr::new(10, 0, 0, 1), 2222, Ipv4Addr::new(10, 0, 0, 2), 80);
        assert_eq!(a.hash(), a.hash());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn hash_distinguishes_v4_from_v6() {
        let v4 = FlowDescriptor::new_v4(6, Ipv4Addr::new(10, 0, 0, 1), 1, Ipv4Addr::new(10, 0, 0, 2), 2);
        let v6 = FlowDescriptor::new_v6(6, "::1".parse().unwrap(), 1, "::2".parse().unwrap(), 2);
        assert_ne!(v4.hash(), v6.hash());
    }

    #[test]
    fn hash_distinguishes_fragment_bit() {
        let first = FlowDescriptor::new_v4(6, Ipv4Addr::new(10, 0, 0, 1), 1, Ipv4Addr::new(10, 0, 0, 2), 2);
        let later = first.with_non_initial_fragment(true);
        assert_ne!(first.hash(), later.hash());
        assert_eq!(first.he_proto(), 6);
        assert_eq!(later.he_proto(), 6 | NON_INITIAL_FRAGMENT_BIT);
    }

    #[test]
    fn fnv1a_matches_reference_vector() {
        // FNV-1a reversed-byte-order hash, matching the original's
        // backward-iterating loop, for a trivial 1-byte input.
        let mut expected = FNV_OFFSET_BASIS;
        expected ^= b'a' as u32;
        expected = expected.wrapping_mul(FNV_PRIME);
        assert_eq!(fnv1a(b"a"), expected);
    }
}
