//! IP address and socket address value types.
//!
//! Ported from the address-manipulation surface of a C++ networking toolkit's
//! `IpAddress` class: construction, netmask/network/broadcast derivation,
//! prefix-length detection, v4-mapped-v6 conversion and byte-wise increment.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

/// An IPv4 or IPv6 address. Unlike `std::net::IpAddr` this type additionally
/// exposes the netmask/network/broadcast derivation and prefix-length
/// helpers the terminators and flow code need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl IpAddr {
    pub const V4_ZERO: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    pub const V6_ZERO: IpAddr = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
    pub const V4_LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    pub const V6_LOCALHOST: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

    pub fn is_v4(&self) -> bool {
        matches!(self, IpAddr::V4(_))
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, IpAddr::V6(_))
    }

    pub fn is_unspecified(&self) -> bool {
        match self {
            IpAddr::V4(a) => a.is_unspecified(),
            IpAddr::V6(a) => a.is_unspecified(),
        }
    }

    pub fn is_loopback(&self) -> bool {
        match self {
            IpAddr::V4(a) => a.is_loopback(),
            IpAddr::V6(a) => a.is_loopback(),
        }
    }

    /// Link-local: `169.254.0.0/16` for v4, `fe80::/10` for v6.
    ///
    /// The v6 check is the full `/10` IANA-assigned link-local block, not a
    /// `/64`: this matches the original runtime's `IN6_IS_ADDR_LINKLOCAL`
    /// (see DESIGN.md, "addr.rs: IPv6 link-local range").
    pub fn is_link_local(&self) -> bool {
        match self {
            IpAddr::V4(a) => {
                Ipv4Net::new(Ipv4Addr::new(169, 254, 0, 0), 16).expect("valid constant prefix").contains(a)
            }
            IpAddr::V6(a) => {
                Ipv6Net::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10).expect("valid constant prefix").contains(a)
            }
        }
    }

    /// True if this is an IPv6 address in the IPv4-mapped range `::ffff:0:0/96`.
    pub fn is_v6_mapped_v4(&self) -> bool {
        match self {
            IpAddr::V6(a) => {
                let s = a.segments();
                s[0] == 0 && s[1] == 0 && s[2] == 0 && s[3] == 0 && s[4] == 0 && s[5] == 0xffff
            }
            IpAddr::V4(_) => false,
        }
    }

    /// Converts a plain v4 address into its `::ffff:a.b.c.d` v6-mapped form.
    /// No-op (returns unchanged) if this is already v6.
    pub fn to_v4_mapped_v6(&self) -> IpAddr {
        match self {
            IpAddr::V4(a) => IpAddr::V6(a.to_ipv6_mapped()),
            v6 @ IpAddr::V6(_) => *v6,
        }
    }

    /// Converts an IPv4-mapped IPv6 address back to plain v4. Returns `None`
    /// if this isn't a v4-mapped address.
    pub fn to_v4(&self) -> Option<IpAddr> {
        match self {
            IpAddr::V6(a) => a.to_ipv4().map(IpAddr::V4),
            IpAddr::V4(_) => None,
        }
    }

    fn as_bytes(&self) -> Vec<u8> {
        match self {
            IpAddr::V4(a) => a.octets().to_vec(),
            IpAddr::V6(a) => a.octets().to_vec(),
        }
    }

    fn from_bytes(version_like: &IpAddr, bytes: &[u8]) -> IpAddr {
        match version_like {
            IpAddr::V4(_) => {
                let arr: [u8; 4] = bytes.try_into().expect("v4 byte length");
                IpAddr::V4(Ipv4Addr::from(arr))
            }
            IpAddr::V6(_) => {
                let arr: [u8; 16] = bytes.try_into().expect("v6 byte length");
                IpAddr::V6(Ipv6Addr::from(arr))
            }
        }
    }

    /// Adds `val` to the address, treating it as a big-endian integer and
    /// propagating carry from the last byte toward the first, same as the
    /// original `incrementBy`.
    pub fn increment_by(&self, val: u8) -> IpAddr {
        let mut bytes = self.as_bytes();
        let len = bytes.len();
        let (new_last, carried) = bytes[len - 1].overflowing_add(val);
        bytes[len - 1] = new_last;
        if carried {
            for b in bytes[..len - 1].iter_mut().rev() {
                let (v, c) = b.overflowing_add(1);
                *b = v;
                if !c {
                    break;
                }
            }
        }
        IpAddr::from_bytes(self, &bytes)
    }

    fn addr_bits(&self) -> u32 {
        match self {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Returns the netmask address of `mask_len` bits, matching this
    /// address's family.
    pub fn netmask_address(&self, mask_len: u8) -> IpAddr {
        self.generate_addr(mask_len, SpecAddrType::Netmask)
    }

    /// Returns the network address for this address under a `mask_len`-bit
    /// netmask.
    pub fn network_address(&self, mask_len: u8) -> IpAddr {
        self.generate_addr(mask_len, SpecAddrType::Network)
    }

    /// Returns the broadcast address for this address under a
    /// `mask_len`-bit netmask.
    pub fn broadcast_address(&self, mask_len: u8) -> IpAddr {
        self.generate_addr(mask_len, SpecAddrType::Bcast)
    }

    fn generate_addr(&self, mask_len: u8, addr_type: SpecAddrType) -> IpAddr {
        let bits = self.addr_bits();
        let mask_len = (mask_len as u32).min(bits) as u8;
        let orig = self.as_bytes();
        let size = orig.len();
        let mut out = vec![if addr_type == SpecAddrType::Bcast { 0xFF } else { 0x00 }; size];

        let full_bytes = (mask_len >> 3) as usize;

        if full_bytes >= size {
            return match addr_type {
                SpecAddrType::Netmask => {
                    IpAddr::from_bytes(self, &vec![0xFFu8; size])
                }
                SpecAddrType::Network | SpecAddrType::Bcast => *self,
            };
        }

        let shift = 8 - (mask_len % 8);
        // Mirrors `0xFF << (8 - maskLen % 8)` truncated to a byte; shifting
        // by 8 yields 0, matching the C++ behavior on an 8-bit value.
        let b_mask: u8 = if shift >= 8 { 0 } else { 0xFFu8 << shift };

        match addr_type {
            SpecAddrType::Netmask => {
                for b in out.iter_mut().take(full_bytes) {
                    *b = 0xFF;
                }
                out[full_bytes] = b_mask;
            }
            SpecAddrType::Network => {
                out[..full_bytes].copy_from_slice(&orig[..full_bytes]);
                out[full_bytes] = orig[full_bytes] & b_mask;
            }
            SpecAddrType::Bcast => {
                out[..full_bytes].copy_from_slice(&orig[..full_bytes]);
                out[full_bytes] = (orig[full_bytes] & b_mask) | !b_mask;
            }
        }

        IpAddr::from_bytes(self, &out)
    }

    /// Converts a netmask address back to a prefix length, returning `None`
    /// if the bits aren't a contiguous run of 1s followed by 0s.
    pub fn to_prefix(&self) -> Option<u8> {
        match self {
            IpAddr::V4(a) => to_prefix_bytes(&a.octets()),
            IpAddr::V6(a) => to_prefix_bytes(&a.octets()),
        }
    }
}

#[derive(PartialEq, Eq)]
enum SpecAddrType {
    Netmask,
    Network,
    Bcast,
}

fn to_prefix_int(byte: u8, len: u8) -> Option<u8> {
    let mut count = 0u8;
    let mut found_zero = false;
    let mask = 1u16 << (len - 1);
    let mut val = byte as u16;
    for _ in 0..len {
        if (val & mask) > 0 {
            if found_zero {
                return None;
            }
            count += 1;
        } else {
            found_zero = true;
        }
        val <<= 1;
    }
    Some(count)
}

fn to_prefix_bytes(bytes: &[u8]) -> Option<u8> {
    let mut count = 0u8;
    let mut has_zero = false;
    for &byte in bytes {
        let pre = to_prefix_int(byte, 8)?;
        count += pre;
        if has_zero && pre > 0 {
            return None;
        }
        if pre < 8 {
            has_zero = true;
        }
    }
    Some(count)
}

/// Address family, mirrored separately from `IpAddr` because `SockAddr`
/// needs to represent a family even when carrying no routable address
/// (e.g. `AF_UNSPEC`-equivalent placeholders are not modeled; every
/// `SockAddr` here carries a concrete v4 or v6 address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// An address + port pair, kept distinct from `IpAddr` the same way the
/// original toolkit keeps `SockAddr` distinct from `IpAddress` — ports are
/// meaningless for raw IP-layer addresses but required for flow lookups and
/// terminator identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl SockAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn family(&self) -> Family {
        match self.ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Equivalence that treats an IPv4-mapped-IPv6 address as equal to its
    /// plain v4 form, matching `IpAddress::isEqual`'s cross-family leniency.
    pub fn is_equivalent(&self, other: &SockAddr) -> bool {
        if self.port != other.port {
            return false;
        }
        normalize(self.ip) == normalize(other.ip)
    }
}

fn normalize(a: IpAddr) -> IpAddr {
    a.to_v4().unwrap_or(a)
}

impl From<std::net::SocketAddr> for SockAddr {
    fn from(sa: std::net::SocketAddr) -> Self {
        match sa {
            std::net::SocketAddr::V4(v4) => SockAddr::new(IpAddr::V4(*v4.ip()), v4.port()),
            std::net::SocketAddr::V6(v6) => SockAddr::new(IpAddr::V6(*v6.ip()), v6.port()),
        }
    }
}

impl From<SockAddr> for std::net::SocketAddr {
    fn from(sa: SockAddr) -> Self {
        match sa.ip {
            IpAddr::V4(a) => std::net::SocketAddr::V4(std::net::SocketAddrV4::new(a, sa.port)),
            IpAddr::V6(a) => {
                std::net::SocketAddr::V6(std::net::SocketAddrV6::new(a, sa.port, 0, 0))
            }
        }
    }
}
