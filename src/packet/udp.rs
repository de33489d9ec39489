//! UDP header view and packet construction.
//!
//! Grounded on `UdpPacket.{hpp,cpp}`: the 8-byte `Header` layout and its
//! `setSrcPort`/`setDestPort` "adjusts checksum when run" contract.

use bytes::BytesMut;

use crate::addr::IpAddr;
use crate::checksum::{adjust_checksum_u16, IpChecksum};
use crate::error::{Result, TermError};
use crate::packet::ip;
use crate::packet::{require_len, Packet, Proto};

pub const HEADER_SIZE: usize = 8;

pub struct UdpView<'a> {
    data: &'a [u8],
}

impl<'a> UdpView<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        require_len(data, HEADER_SIZE, "udp header")?;
        Ok(Self { data })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn dest_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[HEADER_SIZE..]
    }
}

pub struct UdpViewMut<'a> {
    data: &'a mut [u8],
}

impl<'a> UdpViewMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<Self> {
        require_len(data, HEADER_SIZE, "udp header")?;
        Ok(Self { data })
    }

    pub fn set_src_port(&mut self, port: u16) {
        let old = u16::from_be_bytes([self.data[0], self.data[1]]);
        let old_checksum = u16::from_be_bytes([self.data[6], self.data[7]]);
        let new_checksum = adjust_checksum_u16(old_checksum, old, port);
        self.data[0..2].copy_from_slice(&port.to_be_bytes());
        self.data[6..8].copy_from_slice(&new_checksum.to_be_bytes());
    }

    pub fn set_dest_port(&mut self, port: u16) {
        let old = u16::from_be_bytes([self.data[2], self.data[3]]);
        let old_checksum = u16::from_be_bytes([self.data[6], self.data[7]]);
        let new_checksum = adjust_checksum_u16(old_checksum, old, port);
        self.data[2..4].copy_from_slice(&port.to_be_bytes());
        self.data[6..8].copy_from_slice(&new_checksum.to_be_bytes());
    }
}

/// Builds a complete IPv4 or IPv6 packet carrying a UDP datagram.
pub fn build(
    src: IpAddr,
    src_port: u16,
    dst: IpAddr,
    dst_port: u16,
    payload: &[u8],
    tos_or_traffic_class: u8,
    ttl_or_hop_limit: u8,
) -> Result<Packet> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => Ok(build_v4(s, src_port, d, dst_port, payload, tos_or_traffic_class, ttl_or_hop_limit)),
        (IpAddr::V6(s), IpAddr::V6(d)) => Ok(build_v6(s, src_port, d, dst_port, payload, tos_or_traffic_class, ttl_or_hop_limit)),
        _ => Err(TermError::InvalidParameter("source/destination address family mismatch".into())),
    }
}

fn build_v4(
    src: std::net::Ipv4Addr,
    src_port: u16,
    dst: std::net::Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
    tos: u8,
    ttl: u8,
) -> Packet {
    let udp_len = HEADER_SIZE + payload.len();
    let total_len = ip::IPV4_HEADER_SIZE + udp_len;
    let mut buf = BytesMut::with_capacity(total_len);
    buf.resize(total_len, 0);

    buf[0] = 0x45;
    buf[1] = tos;
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[8] = ttl;
    buf[9] = Proto::Udp.as_u8();
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());

    write_udp_datagram(&mut buf[ip::IPV4_HEADER_SIZE..], src_port, dst_port, payload);

    let mut c = IpChecksum::new();
    c.add_bytes(&src.octets());
    c.add_bytes(&dst.octets());
    c.add_bytes(&[0, Proto::Udp.as_u8()]);
    c.add_bytes(&(udp_len as u16).to_be_bytes());
    c.add_bytes(&buf[ip::IPV4_HEADER_SIZE..]);
    let checksum = c.checksum();
    buf[ip::IPV4_HEADER_SIZE + 6..ip::IPV4_HEADER_SIZE + 8].copy_from_slice(&checksum.to_be_bytes());

    let ip_checksum = IpChecksum::of(&buf[..ip::IPV4_HEADER_SIZE]);
    buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    Packet::from_bytes(buf.freeze())
}

fn build_v6(
    src: std::net::Ipv6Addr,
    src_port: u16,
    dst: std::net::Ipv6Addr,
    dst_port: u16,
    payload: &[u8],
    traffic_class: u8,
    hop_limit: u8,
) -> Packet {
    let udp_len = HEADER_SIZE + payload.len();
    let total_len = ip::IPV6_HEADER_SIZE + udp_len;
    let mut buf = BytesMut::with_capacity(total_len);
    buf.resize(total_len, 0);

    buf[0] = 0x60 | (traffic_class >> 4);
    buf[1] = traffic_class << 4;
    buf[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buf[6] = Proto::Udp.as_u8();
    buf[7] = hop_limit;
    buf[8..24].copy_from_slice(&src.octets());
    buf[24..40].copy_from_slice(&dst.octets());

    write_udp_datagram(&mut buf[ip::IPV6_HEADER_SIZE..], src_port, dst_port, payload);

    let mut c = IpChecksum::new();
    c.add_bytes(&src.octets());
    c.add_bytes(&dst.octets());
    c.add_bytes(&(udp_len as u32).to_be_bytes());
    c.add_bytes(&[0, 0, 0, Proto::Udp.as_u8()]);
    c.add_bytes(&buf[ip::IPV6_HEADER_SIZE..]);
    let checksum = c.checksum();
    buf[ip::IPV6_HEADER_SIZE + 6..ip::IPV6_HEADER_SIZE + 8].copy_from_slice(&checksum.to_be_bytes());

    Packet::from_bytes(buf.freeze())
}

fn write_udp_datagram(out: &mut [u8], src_port: u16, dst_port: u16, payload: &[u8]) {
    out[0..2].copy_from_slice(&src_port.to_be_bytes());
    out[2..4].copy_from_slice(&dst_port.to_be_bytes());
    out[4..6].copy_from_slice(&((HEADER_SIZE + payload.len()) as u16).to_be_bytes());
    out[6..8].copy_from_slice(&0u16.to_be_bytes());
    out[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
}
