//! ICMP header view.
//!
//! Grounded on the general shape of `IcmpPacket.{hpp,cpp}`: type/code plus
//! a 4-byte "rest of header" field whose interpretation depends on the
//! type (echo id/seq for Echo Request/Reply, unused for Destination
//! Unreachable, etc). Only single-packet classification is in scope — no
//! ICMP error payload re-parsing beyond exposing the embedded original
//! datagram bytes.

use bytes::BytesMut;

use crate::addr::IpAddr;
use crate::checksum::IpChecksum;
use crate::error::{Result, TermError};
use crate::packet::{ip, require_len, Packet, Proto};

pub const HEADER_SIZE: usize = 8;

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_DEST_UNREACHABLE: u8 = 3;
pub const TYPE_ECHO_REQUEST: u8 = 8;
pub const TYPE_TIME_EXCEEDED: u8 = 11;

pub struct IcmpView<'a> {
    data: &'a [u8],
}

impl<'a> IcmpView<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        require_len(data, HEADER_SIZE, "icmp header")?;
        Ok(Self { data })
    }

    pub fn icmp_type(&self) -> u8 {
        self.data[0]
    }

    pub fn code(&self) -> u8 {
        self.data[1]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn rest_of_header(&self) -> [u8; 4] {
        self.data[4..8].try_into().unwrap()
    }

    /// Valid only for Echo Request/Reply.
    pub fn echo_id(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    /// Valid only for Echo Request/Reply.
    pub fn echo_seq(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    pub fn is_echo_request(&self) -> bool {
        self.icmp_type() == TYPE_ECHO_REQUEST
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[HEADER_SIZE..]
    }
}

/// Builds an ICMP Echo Reply in response to an Echo Request, by flipping
/// the type and recomputing the checksum; all other fields (id, seq,
/// payload) are copied unchanged, matching standard ping-responder
/// behavior. Fails if `request` is not itself an Echo Request.
pub fn build_echo_reply(request: &[u8]) -> Result<Vec<u8>> {
    let view = IcmpView::new(request)?;
    if !view.is_echo_request() {
        return Err(TermError::InvalidParameter("build_echo_reply requires an ICMP Echo Request".into()));
    }
    let mut reply = request.to_vec();
    reply[0] = TYPE_ECHO_REPLY;
    reply[1] = 0;
    reply[2] = 0;
    reply[3] = 0;
    let checksum = IpChecksum::of(&reply);
    reply[2..4].copy_from_slice(&checksum.to_be_bytes());
    Ok(reply)
}

/// Builds a complete IPv4 or IPv6 packet carrying an ICMP message, mirroring
/// `tcp::build`/`udp::build`: install the IP header, zero the ICMP header,
/// install type/code/id/seq, set checksum=0, then compute the checksum over
/// the header and payload (ICMP has no pseudo-header, unlike TCP/UDP) and
/// store it.
#[allow(clippy::too_many_arguments)]
pub fn build(
    src: IpAddr,
    dst: IpAddr,
    icmp_type: u8,
    code: u8,
    id: u16,
    seq: u16,
    payload: &[u8],
    tos_or_traffic_class: u8,
    ttl_or_hop_limit: u8,
) -> Result<Packet> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            Ok(build_v4(s, d, icmp_type, code, id, seq, payload, tos_or_traffic_class, ttl_or_hop_limit))
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            Ok(build_v6(s, d, icmp_type, code, id, seq, payload, tos_or_traffic_class, ttl_or_hop_limit))
        }
        _ => Err(TermError::InvalidParameter("source/destination address family mismatch".into())),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_v4(
    src: std::net::Ipv4Addr,
    dst: std::net::Ipv4Addr,
    icmp_type: u8,
    code: u8,
    id: u16,
    seq: u16,
    payload: &[u8],
    tos: u8,
    ttl: u8,
) -> Packet {
    let icmp_len = HEADER_SIZE + payload.len();
    let total_len = ip::IPV4_HEADER_SIZE + icmp_len;
    let mut buf = BytesMut::with_capacity(total_len);
    buf.resize(total_len, 0);

    buf[0] = 0x45;
    buf[1] = tos;
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[8] = ttl;
    buf[9] = Proto::Icmp.as_u8();
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());

    write_icmp_message(&mut buf[ip::IPV4_HEADER_SIZE..], icmp_type, code, id, seq, payload);

    let off = ip::IPV4_HEADER_SIZE;
    let icmp_checksum = IpChecksum::of(&buf[off..]);
    buf[off + 2..off + 4].copy_from_slice(&icmp_checksum.to_be_bytes());

    let ip_checksum = IpChecksum::of(&buf[..ip::IPV4_HEADER_SIZE]);
    buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    Packet::from_bytes(buf.freeze())
}

#[allow(clippy::too_many_arguments)]
fn build_v6(
    src: std::net::Ipv6Addr,
    dst: std::net::Ipv6Addr,
    icmp_type: u8,
    code: u8,
    id: u16,
    seq: u16,
    payload: &[u8],
    traffic_class: u8,
    hop_limit: u8,
) -> Packet {
    let icmp_len = HEADER_SIZE + payload.len();
    let total_len = ip::IPV6_HEADER_SIZE + icmp_len;
    let mut buf = BytesMut::with_capacity(total_len);
    buf.resize(total_len, 0);

    buf[0] = 0x60 | (traffic_class >> 4);
    buf[1] = traffic_class << 4;
    buf[4..6].copy_from_slice(&(icmp_len as u16).to_be_bytes());
    buf[6] = Proto::Icmpv6.as_u8();
    buf[7] = hop_limit;
    buf[8..24].copy_from_slice(&src.octets());
    buf[24..40].copy_from_slice(&dst.octets());

    write_icmp_message(&mut buf[ip::IPV6_HEADER_SIZE..], icmp_type, code, id, seq, payload);

    let off = ip::IPV6_HEADER_SIZE;
    let icmp_checksum = IpChecksum::of(&buf[off..]);
    buf[off + 2..off + 4].copy_from_slice(&icmp_checksum.to_be_bytes());

    Packet::from_bytes(buf.freeze())
}

fn write_icmp_message(out: &mut [u8], icmp_type: u8, code: u8, id: u16, seq: u16, payload: &[u8]) {
    out[0] = icmp_type;
    out[1] = code;
    out[2..4].copy_from_slice(&0u16.to_be_bytes());
    out[4..6].copy_from_slice(&id.to_be_bytes());
    out[6..8].copy_from_slice(&seq.to_be_bytes());
    out[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_reply_flips_type_and_checksum() {
        let mut req = vec![TYPE_ECHO_REQUEST, 0, 0, 0, 0, 1, 0, 1];
        req.extend_from_slice(b"ping");
        let checksum = IpChecksum::of(&req);
        req[2..4].copy_from_slice(&checksum.to_be_bytes());

        let reply = build_echo_reply(&req).unwrap();
        let view = IcmpView::new(&reply).unwrap();
        assert_eq!(view.icmp_type(), TYPE_ECHO_REPLY);
        assert_eq!(view.echo_id(), 1);
        assert_eq!(view.echo_seq(), 1);
        assert_eq!(view.payload(), b"ping");
    }

    #[test]
    fn echo_reply_rejects_non_echo_request() {
        let mut unreachable_msg = vec![TYPE_DEST_UNREACHABLE, 0, 0, 0, 0, 0, 0, 0];
        let checksum = IpChecksum::of(&unreachable_msg);
        unreachable_msg[2..4].copy_from_slice(&checksum.to_be_bytes());

        assert!(build_echo_reply(&unreachable_msg).is_err());
    }

    #[test]
    fn build_v4_roundtrips_through_ip_examine() {
        use crate::addr::IpAddr;
        use std::net::Ipv4Addr;

        let pkt = build(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
            TYPE_ECHO_REQUEST,
            0,
            7,
            1,
            b"ping",
            0,
            64,
        )
        .unwrap();

        let data = pkt.linearize();
        let (_version, ihl, proto) = crate::packet::ip::examine(&data).unwrap();
        assert_eq!(proto, Proto::Icmp);

        let view = IcmpView::new(&data[ihl..]).unwrap();
        assert!(view.is_echo_request());
        assert_eq!(view.echo_id(), 7);
        assert_eq!(view.echo_seq(), 1);
        assert_eq!(view.payload(), b"ping");

        // The checksum is recomputed from scratch over the built bytes and
        // must match what's stored.
        let mut zeroed = data[ihl..].to_vec();
        zeroed[2] = 0;
        zeroed[3] = 0;
        assert_eq!(IpChecksum::of(&zeroed), view.checksum());
    }

    #[test]
    fn build_v6_roundtrips_through_ip_examine() {
        use crate::addr::IpAddr;
        use std::net::Ipv6Addr;

        let pkt = build(
            IpAddr::V6("::1".parse::<Ipv6Addr>().unwrap()),
            IpAddr::V6("::2".parse::<Ipv6Addr>().unwrap()),
            128,
            0,
            9,
            3,
            b"pong",
            0,
            64,
        )
        .unwrap();

        let data = pkt.linearize();
        let (_version, ihl, proto) = crate::packet::ip::examine(&data).unwrap();
        assert_eq!(proto, Proto::Icmpv6);

        let view = IcmpView::new(&data[ihl..]).unwrap();
        assert_eq!(view.icmp_type(), 128);
        assert_eq!(view.echo_id(), 9);
        assert_eq!(view.echo_seq(), 3);
        assert_eq!(view.payload(), b"pong");
    }

    #[test]
    fn build_rejects_mismatched_address_families() {
        use crate::addr::IpAddr;
        use std::net::{Ipv4Addr, Ipv6Addr};

        let err = build(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            IpAddr::V6("::1".parse::<Ipv6Addr>().unwrap()),
            TYPE_ECHO_REQUEST,
            0,
            1,
            1,
            &[],
            0,
            64,
        );
        assert!(err.is_err());
    }
}
