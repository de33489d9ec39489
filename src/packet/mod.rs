//! IP packet model: a gather-list buffer plus per-protocol header views.
//!
//! Grounded on a C++ networking toolkit's `IpPacket`/`TcpPacket`/
//! `UdpPacket`/`IcmpPacket`/`RtpParser` classes. The original stores packet
//! data as a `MemVector` (a reference-counted scatter/gather buffer) and
//! hands out typed header pointers into it; here a [`Packet`] is a gather
//! list of [`bytes::Bytes`] chunks (the teacher already depends on `bytes`
//! for exactly this "reference-counted, cheaply sliceable buffer" role),
//! and header views parse/mutate a single linearized [`bytes::BytesMut`]
//! copy-on-write.

pub mod icmp;
pub mod ip;
pub mod rtp;
pub mod tcp;
pub mod udp;

use bytes::{Bytes, BytesMut};

use crate::addr::IpAddr;
use crate::error::{Result, TermError};
use crate::flow::FlowDescriptor;

/// Well-known IP protocol numbers this crate understands, plus a catch-all
/// for everything else. An unrecognized protocol number is not a parse
/// error: the IP header itself still classifies and examines cleanly, it's
/// only the per-protocol header views (`tcp::TcpView`, etc.) that a caller
/// can't construct for it.
/// <http://www.iana.org/assignments/protocol-numbers>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl Proto {
    pub fn from_number(n: u8) -> Proto {
        match n {
            1 => Proto::Icmp,
            6 => Proto::Tcp,
            17 => Proto::Udp,
            58 => Proto::Icmpv6,
            other => Proto::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Proto::Icmp => 1,
            Proto::Tcp => 6,
            Proto::Udp => 17,
            Proto::Icmpv6 => 58,
            Proto::Other(n) => *n,
        }
    }
}

/// Which address to read/replace in [`Packet::set_address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Source,
    Dest,
}

/// A gather-list IP packet: zero or more `Bytes` chunks that together make
/// up one on-wire IP datagram. Holding the data as a list of cheaply cloned
/// reference-counted chunks (rather than one contiguous owned buffer) lets
/// callers build a packet out of a pre-existing payload slice plus a freshly
/// allocated header without copying the payload.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    chunks: Vec<Bytes>,
}

impl Packet {
    pub fn empty() -> Self {
        Self { chunks: Vec::new() }
    }

    pub fn from_bytes(data: Bytes) -> Self {
        if data.is_empty() {
            Self::empty()
        } else {
            Self { chunks: vec![data] }
        }
    }

    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Self { chunks: chunks.into_iter().filter(|c| !c.is_empty()).collect() }
    }

    pub fn is_valid(&self) -> bool {
        !self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Flattens the gather list into one contiguous, owned buffer. Chunk
    /// boundaries disappear; this is the entry point for header parsing,
    /// which needs to read fields that might straddle chunk boundaries
    /// (header modification always operates on the linearized copy).
    pub fn linearize(&self) -> BytesMut {
        if self.chunks.len() == 1 {
            return BytesMut::from(&self.chunks[0][..]);
        }
        let mut out = BytesMut::with_capacity(self.len());
        for c in &self.chunks {
            out.extend_from_slice(c);
        }
        out
    }

    pub fn into_single_chunk(self) -> Packet {
        if self.chunks.len() <= 1 {
            return self;
        }
        Packet::from_bytes(self.linearize().freeze())
    }

    pub fn push_chunk(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.chunks.push(data);
        }
    }
}

impl From<BytesMut> for Packet {
    fn from(b: BytesMut) -> Self {
        Packet::from_bytes(b.freeze())
    }
}

pub(crate) fn require_len(data: &[u8], min: usize, what: &'static str) -> Result<()> {
    if data.len() < min {
        return Err(TermError::InvalidData(format!(
            "{what}: expected at least {min} bytes, got {}",
            data.len()
        )));
    }
    Ok(())
}

/// Which side of this packet's addresses/ports is the flow's "client",
/// needed because a terminator sees both the original request and the
/// mirror-image reply and must derive the *same* canonical descriptor for
/// both (spec §4.2's `setupFlowDesc` direction parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    /// `src` is the client, `dst` is the server.
    ClientToServer,
    /// `src` is the server, `dst` is the client.
    ServerToClient,
}

/// Materializes a [`FlowDescriptor`] from a parsed IP packet, mirroring
/// `IpPacket::setupFlowDesc`. Extracts TCP/UDP ports (0 for protocols
/// without ports), and for a non-initial IPv4 fragment sets the descriptor's
/// fragment flag so later fragments of one datagram — which carry no
/// transport header of their own past the first — never alias the flow's
/// first-fragment bucket entry. Returns `None` if the packet doesn't parse.
pub fn setup_flow_desc(packet: &Packet, direction: FlowDirection) -> Option<FlowDescriptor> {
    let data = packet.linearize();
    let (version, ihl, proto) = ip::examine(&data).ok()?;
    let (src, dst) = ip::addresses(&data, version).ok()?;

    let non_initial_fragment = match version {
        ip::IpVersion::V4 => ip::Ipv4View::new(&data).ok()?.fragment_offset() != 0,
        ip::IpVersion::V6 => false,
    };

    let transport = data.get(ihl..)?;
    let (src_port, dst_port) = match proto {
        Proto::Tcp => tcp::TcpView::new(transport).map(|v| (v.src_port(), v.dest_port())).unwrap_or((0, 0)),
        Proto::Udp => udp::UdpView::new(transport).map(|v| (v.src_port(), v.dest_port())).unwrap_or((0, 0)),
        _ => (0, 0),
    };

    let (client_addr, server_addr, client_port, server_port) = match direction {
        FlowDirection::ClientToServer => (src, dst, src_port, dst_port),
        FlowDirection::ServerToClient => (dst, src, dst_port, src_port),
    };

    let desc = match (client_addr, server_addr) {
        (IpAddr::V4(c), IpAddr::V4(s)) => FlowDescriptor::new_v4(proto.as_u8() as u16, c, client_port, s, server_port),
        (IpAddr::V6(c), IpAddr::V6(s)) => FlowDescriptor::new_v6(proto.as_u8() as u16, c, client_port, s, server_port),
        _ => return None,
    }
    .with_non_initial_fragment(non_initial_fragment);

    desc.is_valid().then_some(desc)
}

/// Returns a 16-bit seed for load-balancing-style consistent hashing,
/// matching `IpPacket::getSeed`: invariant under swapping (src,dst) and
/// (sport,dport), byte-order independent, derived from whichever of ports
/// or addresses actually varies between the two endpoints. Returns `None`
/// if the packet doesn't parse.
pub fn get_seed(packet: &Packet) -> Option<u16> {
    let data = packet.linearize();
    let (version, ihl, proto) = ip::examine(&data).ok()?;
    let (src, dst) = ip::addresses(&data, version).ok()?;

    let transport = data.get(ihl..)?;
    let (src_port, dst_port) = match proto {
        Proto::Tcp => tcp::TcpView::new(transport).map(|v| (v.src_port(), v.dest_port())).unwrap_or((0, 0)),
        Proto::Udp => udp::UdpView::new(transport).map(|v| (v.src_port(), v.dest_port())).unwrap_or((0, 0)),
        _ => (0, 0),
    };

    Some(seed_from_parts(src, dst, src_port, dst_port))
}

fn seed_from_parts(a: IpAddr, b: IpAddr, port1: u16, port2: u16) -> u16 {
    if port1 != port2 {
        port1 ^ port2
    } else if port1 != 0 {
        port1
    } else {
        addr_lanes(a).chain(addr_lanes(b)).fold(0u16, |acc, lane| acc ^ lane)
    }
}

/// Splits an address into 16-bit big-endian lanes: two for v4, eight for v6.
fn addr_lanes(addr: IpAddr) -> impl Iterator<Item = u16> {
    let octets: Vec<u8> = match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    };
    (0..octets.len() / 2).map(move |i| u16::from_be_bytes([octets[2 * i], octets[2 * i + 1]])).collect::<Vec<_>>().into_iter()
}

#[cfg(test)]
mod flow_setup_tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn setup_flow_desc_extracts_tcp_ports_client_to_server() {
        let pkt = tcp::build(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            40000,
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            80,
            tcp::FLAG_SYN,
            100,
            0,
            8192,
            &[],
            &[],
            64,
        )
        .unwrap();

        let desc = setup_flow_desc(&pkt, FlowDirection::ClientToServer).unwrap();
        assert_eq!(desc.client_port, 40000);
        assert_eq!(desc.server_port, 80);
        assert_eq!(desc.proto, Proto::Tcp.as_u8() as u16);
        assert!(!desc.non_initial_fragment);
    }

    #[test]
    fn setup_flow_desc_reverses_roles_server_to_client() {
        let pkt = tcp::build(
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            80,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            40000,
            tcp::FLAG_SYN | tcp::FLAG_ACK,
            200,
            101,
            8192,
            &[],
            &[],
            64,
        )
        .unwrap();

        let desc = setup_flow_desc(&pkt, FlowDirection::ServerToClient).unwrap();
        assert_eq!(desc.client_port, 40000);
        assert_eq!(desc.server_port, 80);
        assert_eq!(desc.client_addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(desc.server_addr, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
    }

    #[test]
    fn setup_flow_desc_sets_fragment_bit_for_non_initial_fragment() {
        let mut header = vec![0u8; 20];
        header[0] = 0x45;
        header[6] = 0x00;
        header[7] = 0x01; // fragment offset = 1 (non-initial)
        header[8] = 64;
        header[9] = 17; // UDP
        let pkt = Packet::from_bytes(header.into());

        let desc = setup_flow_desc(&pkt, FlowDirection::ClientToServer).unwrap();
        assert!(desc.non_initial_fragment);
        assert_eq!(desc.client_port, 0);
        assert_eq!(desc.server_port, 0);
    }

    #[test]
    fn get_seed_is_invariant_under_endpoint_swap() {
        let forward = tcp::build(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            40000,
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            80,
            tcp::FLAG_ACK,
            100,
            200,
            8192,
            &[],
            &[],
            64,
        )
        .unwrap();
        let reverse = tcp::build(
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            80,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            40000,
            tcp::FLAG_ACK,
            200,
            100,
            8192,
            &[],
            &[],
            64,
        )
        .unwrap();

        assert_eq!(get_seed(&forward), get_seed(&reverse));
    }

    #[test]
    fn get_seed_falls_back_to_address_lanes_when_ports_absent() {
        let mut header = vec![0u8; 20 + 8]; // ip + icmp header, no ports
        let total_len = header.len() as u16;
        header[0] = 0x45;
        header[2..4].copy_from_slice(&total_len.to_be_bytes());
        header[8] = 64;
        header[9] = 1; // ICMP
        header[12..16].copy_from_slice(&Ipv4Addr::new(10, 0, 0, 1).octets());
        header[16..20].copy_from_slice(&Ipv4Addr::new(10, 0, 0, 2).octets());
        let pkt = Packet::from_bytes(header.into());

        let seed = get_seed(&pkt).unwrap();
        let expected = addr_lanes(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .chain(addr_lanes(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))))
            .fold(0u16, |acc, lane| acc ^ lane);
        assert_eq!(seed, expected);
    }
}
