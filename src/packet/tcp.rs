//! TCP header view and packet construction.
//!
//! Grounded on `TcpPacket.{hpp,cpp}`: flag bit constants, option-type
//! constants, the `getOptLen`/`getOptData`/`getOptMss`/`getOptWindowScale`
//! option-area scanning contract, and `generateResetResponse`'s RFC 793
//! §3.4 reset-generation rules.

use bytes::{Bytes, BytesMut};

use crate::addr::IpAddr;
use crate::checksum::{adjust_checksum_u16, adjust_checksum_u32, IpChecksum};
use crate::error::{Result, TermError};
use crate::packet::ip::{self, IpVersion};
use crate::packet::{require_len, AddressType, Packet, Proto};

pub const MIN_HEADER_SIZE: usize = 20;
pub const MAX_HEADER_SIZE: usize = 60;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;
pub const FLAG_URG: u8 = 0x20;
pub const FLAG_ECE: u8 = 0x40;
pub const FLAG_CWR: u8 = 0x80;

pub const OPT_END: u8 = 0;
pub const OPT_NOP: u8 = 1;
pub const OPT_MSS: u8 = 2;
pub const OPT_WSCALE: u8 = 3;
pub const OPT_SACK_PERM: u8 = 4;
pub const OPT_SACK: u8 = 5;
pub const OPT_TSTAMP: u8 = 8;

/// A single TCP option to be emitted by [`build`]. `OptNop`-equivalent by
/// default, matching the original `Option`'s default constructor.
#[derive(Debug, Clone)]
pub struct TcpOption {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl TcpOption {
    pub fn mss(value: u16) -> Self {
        Self { kind: OPT_MSS, data: value.to_be_bytes().to_vec() }
    }

    pub fn window_scale(shift: u8) -> Self {
        Self { kind: OPT_WSCALE, data: vec![shift] }
    }
}

/// Computes the padded option-area length for `options`, capped at 40 bytes
/// (the maximum TCP header allows). Returns 0 if an `OPT_END` is present or
/// the total would overflow 40 bytes, matching `getOptLen`.
pub fn opt_len(options: &[TcpOption]) -> u8 {
    let mut total = 0usize;
    for opt in options {
        if opt.kind == OPT_END {
            return 0;
        }
        total += 2 + opt.data.len();
    }
    let padded = (total + 3) / 4 * 4;
    if padded > 40 {
        0
    } else {
        padded as u8
    }
}

/// A read-only view into a TCP header at the start of `data` (the IP
/// payload). The option area, if any, is assumed to immediately follow the
/// fixed 20-byte header up to `data_offset()*4`.
pub struct TcpView<'a> {
    data: &'a [u8],
}

impl<'a> TcpView<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        require_len(data, MIN_HEADER_SIZE, "tcp header")?;
        let v = Self { data };
        let off = v.data_offset_bytes();
        if !(MIN_HEADER_SIZE..=MAX_HEADER_SIZE).contains(&off) || off > data.len() {
            return Err(TermError::InvalidData("tcp data offset out of range".into()));
        }
        Ok(v)
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn dest_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn seq_num(&self) -> u32 {
        u32::from_be_bytes(self.data[4..8].try_into().unwrap())
    }

    pub fn ack_num(&self) -> u32 {
        u32::from_be_bytes(self.data[8..12].try_into().unwrap())
    }

    pub fn data_offset_bytes(&self) -> usize {
        ((self.data[12] >> 4) as usize) * 4
    }

    pub fn flags(&self) -> u8 {
        self.data[13]
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags() & flag != 0
    }

    pub fn window(&self) -> u16 {
        u16::from_be_bytes([self.data[14], self.data[15]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[16], self.data[17]])
    }

    pub fn urgent_ptr(&self) -> u16 {
        u16::from_be_bytes([self.data[18], self.data[19]])
    }

    fn options(&self) -> &'a [u8] {
        &self.data[MIN_HEADER_SIZE..self.data_offset_bytes()]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.data_offset_bytes()..]
    }

    /// Scans the option area linearly, treating `OPT_NOP` as a single byte
    /// and everything else as `{type, length>=2, value...}`. Returns the
    /// option's value bytes if found.
    pub fn opt_data(&self, opt_type: u8) -> Option<&'a [u8]> {
        let opts = self.options();
        let mut i = 0;
        while i < opts.len() {
            let kind = opts[i];
            if kind == OPT_END {
                break;
            }
            if kind == OPT_NOP {
                i += 1;
                continue;
            }
            if i + 1 >= opts.len() {
                break;
            }
            let len = opts[i + 1] as usize;
            if len < 2 || i + len > opts.len() {
                break;
            }
            let value = &opts[i + 2..i + len];
            if kind == opt_type {
                return Some(value);
            }
            i += len;
        }
        None
    }

    /// Only meaningful when SYN is set, matching the original's contract.
    pub fn opt_mss(&self) -> Option<u16> {
        if !self.has_flag(FLAG_SYN) {
            return None;
        }
        let data = self.opt_data(OPT_MSS)?;
        (data.len() == 2).then(|| u16::from_be_bytes([data[0], data[1]]))
    }

    /// Only meaningful when SYN is set, matching the original's contract.
    pub fn opt_window_scale(&self) -> Option<u8> {
        if !self.has_flag(FLAG_SYN) {
            return None;
        }
        let data = self.opt_data(OPT_WSCALE)?;
        (data.len() == 1).then(|| data[0])
    }
}

pub struct TcpViewMut<'a> {
    data: &'a mut [u8],
}

impl<'a> TcpViewMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<Self> {
        require_len(data, MIN_HEADER_SIZE, "tcp header")?;
        Ok(Self { data })
    }

    fn adjust_u16(&mut self, old: u16, new: u16) {
        let old_checksum = u16::from_be_bytes([self.data[16], self.data[17]]);
        let new_checksum = adjust_checksum_u16(old_checksum, old, new);
        self.data[16..18].copy_from_slice(&new_checksum.to_be_bytes());
    }

    fn adjust_u32(&mut self, old: u32, new: u32) {
        let old_checksum = u16::from_be_bytes([self.data[16], self.data[17]]);
        let new_checksum = adjust_checksum_u32(old_checksum, old, new);
        self.data[16..18].copy_from_slice(&new_checksum.to_be_bytes());
    }

    pub fn set_src_port(&mut self, port: u16) {
        let old = u16::from_be_bytes([self.data[0], self.data[1]]);
        self.adjust_u16(old, port);
        self.data[0..2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_dest_port(&mut self, port: u16) {
        let old = u16::from_be_bytes([self.data[2], self.data[3]]);
        self.adjust_u16(old, port);
        self.data[2..4].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_seq_num(&mut self, seq: u32) {
        let old = u32::from_be_bytes(self.data[4..8].try_into().unwrap());
        self.adjust_u32(old, seq);
        self.data[4..8].copy_from_slice(&seq.to_be_bytes());
    }

    pub fn set_ack_num(&mut self, ack: u32) {
        let old = u32::from_be_bytes(self.data[8..12].try_into().unwrap());
        self.adjust_u32(old, ack);
        self.data[8..12].copy_from_slice(&ack.to_be_bytes());
    }

    pub fn set_flag(&mut self, flag: u8, value: bool) {
        let old = self.data[13];
        let new = if value { old | flag } else { old & !flag };
        // Flags share a byte with reserved bits in the 16-bit word at
        // offset 12; adjust using that whole word, as the original does
        // via the individual setFIN/setSYN/etc helpers.
        let old_word = u16::from_be_bytes([self.data[12], old]);
        let new_word = u16::from_be_bytes([self.data[12], new]);
        self.adjust_u16(old_word, new_word);
        self.data[13] = new;
    }

    pub fn set_window(&mut self, window: u16) {
        let old = u16::from_be_bytes([self.data[14], self.data[15]]);
        self.adjust_u16(old, window);
        self.data[14..16].copy_from_slice(&window.to_be_bytes());
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        self.data[16..18].copy_from_slice(&checksum.to_be_bytes());
    }
}

/// RFC 1071-style pseudo-header + TCP-segment checksum for IPv4.
fn pseudo_checksum_v4(src: std::net::Ipv4Addr, dst: std::net::Ipv4Addr, tcp_len: u16, tcp_segment: &[u8]) -> u16 {
    let mut c = IpChecksum::new();
    c.add_bytes(&src.octets());
    c.add_bytes(&dst.octets());
    c.add_bytes(&[0, Proto::Tcp.as_u8()]);
    c.add_bytes(&tcp_len.to_be_bytes());
    c.add_bytes(tcp_segment);
    c.checksum()
}

fn pseudo_checksum_v6(src: std::net::Ipv6Addr, dst: std::net::Ipv6Addr, tcp_len: u32, tcp_segment: &[u8]) -> u16 {
    let mut c = IpChecksum::new();
    c.add_bytes(&src.octets());
    c.add_bytes(&dst.octets());
    c.add_bytes(&tcp_len.to_be_bytes());
    c.add_bytes(&[0, 0, 0, Proto::Tcp.as_u8()]);
    c.add_bytes(tcp_segment);
    c.checksum()
}

/// Builds a complete IPv4 or IPv6 packet carrying a TCP segment, with a
/// correct IP header checksum (v4 only) and TCP checksum already computed.
#[allow(clippy::too_many_arguments)]
pub fn build(
    src: IpAddr,
    src_port: u16,
    dst: IpAddr,
    dst_port: u16,
    flags: u8,
    seq: u32,
    ack: u32,
    window: u16,
    payload: &[u8],
    options: &[TcpOption],
    ttl: u8,
) -> Result<Packet> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            Ok(build_v4(s, src_port, d, dst_port, flags, seq, ack, window, payload, options, ttl))
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            Ok(build_v6(s, src_port, d, dst_port, flags, seq, ack, window, payload, options, ttl))
        }
        _ => Err(TermError::InvalidParameter("source/destination address family mismatch".into())),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_v4(
    src: std::net::Ipv4Addr,
    src_port: u16,
    dst: std::net::Ipv4Addr,
    dst_port: u16,
    flags: u8,
    seq: u32,
    ack: u32,
    window: u16,
    payload: &[u8],
    options: &[TcpOption],
    ttl: u8,
) -> Packet {
    let opts = encode_options(options);
    let tcp_hdr_len = MIN_HEADER_SIZE + opts.len();
    let total_len = ip::IPV4_HEADER_SIZE + tcp_hdr_len + payload.len();

    let mut buf = BytesMut::with_capacity(total_len);
    buf.resize(total_len, 0);

    buf[0] = 0x45;
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[8] = ttl;
    buf[9] = Proto::Tcp.as_u8();
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());

    write_tcp_segment(
        &mut buf[ip::IPV4_HEADER_SIZE..],
        src_port,
        dst_port,
        flags,
        seq,
        ack,
        window,
        payload,
        &opts,
    );

    let checksum = pseudo_checksum_v4(src, dst, (tcp_hdr_len + payload.len()) as u16, &buf[ip::IPV4_HEADER_SIZE..]);
    buf[ip::IPV4_HEADER_SIZE + 16..ip::IPV4_HEADER_SIZE + 18].copy_from_slice(&checksum.to_be_bytes());

    let ip_checksum = IpChecksum::of(&buf[..ip::IPV4_HEADER_SIZE]);
    buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    Packet::from_bytes(buf.freeze())
}

#[allow(clippy::too_many_arguments)]
fn build_v6(
    src: std::net::Ipv6Addr,
    src_port: u16,
    dst: std::net::Ipv6Addr,
    dst_port: u16,
    flags: u8,
    seq: u32,
    ack: u32,
    window: u16,
    payload: &[u8],
    options: &[TcpOption],
    hop_limit: u8,
) -> Packet {
    let opts = encode_options(options);
    let tcp_hdr_len = MIN_HEADER_SIZE + opts.len();
    let total_len = ip::IPV6_HEADER_SIZE + tcp_hdr_len + payload.len();

    let mut buf = BytesMut::with_capacity(total_len);
    buf.resize(total_len, 0);

    buf[0] = 0x60;
    let payload_len = (tcp_hdr_len + payload.len()) as u16;
    buf[4..6].copy_from_slice(&payload_len.to_be_bytes());
    buf[6] = Proto::Tcp.as_u8();
    buf[7] = hop_limit;
    buf[8..24].copy_from_slice(&src.octets());
    buf[24..40].copy_from_slice(&dst.octets());

    write_tcp_segment(
        &mut buf[ip::IPV6_HEADER_SIZE..],
        src_port,
        dst_port,
        flags,
        seq,
        ack,
        window,
        payload,
        &opts,
    );

    let checksum = pseudo_checksum_v6(src, dst, payload_len as u32, &buf[ip::IPV6_HEADER_SIZE..]);
    buf[ip::IPV6_HEADER_SIZE + 16..ip::IPV6_HEADER_SIZE + 18].copy_from_slice(&checksum.to_be_bytes());

    Packet::from_bytes(buf.freeze())
}

fn encode_options(options: &[TcpOption]) -> Vec<u8> {
    let mut raw = Vec::new();
    for opt in options {
        if opt.kind == OPT_NOP {
            raw.push(OPT_NOP);
            continue;
        }
        raw.push(opt.kind);
        raw.push(2 + opt.data.len() as u8);
        raw.extend_from_slice(&opt.data);
    }
    while raw.len() % 4 != 0 {
        raw.push(OPT_NOP);
    }
    raw
}

#[allow(clippy::too_many_arguments)]
fn write_tcp_segment(
    out: &mut [u8],
    src_port: u16,
    dst_port: u16,
    flags: u8,
    seq: u32,
    ack: u32,
    window: u16,
    payload: &[u8],
    opts: &[u8],
) {
    let hdr_len = MIN_HEADER_SIZE + opts.len();
    out[0..2].copy_from_slice(&src_port.to_be_bytes());
    out[2..4].copy_from_slice(&dst_port.to_be_bytes());
    out[4..8].copy_from_slice(&seq.to_be_bytes());
    out[8..12].copy_from_slice(&ack.to_be_bytes());
    out[12] = ((hdr_len / 4) as u8) << 4;
    out[13] = flags;
    out[14..16].copy_from_slice(&window.to_be_bytes());
    // checksum (16..18) left as 0 for the caller to fill in.
    out[18..20].copy_from_slice(&0u16.to_be_bytes());
    out[20..20 + opts.len()].copy_from_slice(opts);
    out[hdr_len..hdr_len + payload.len()].copy_from_slice(payload);
}

/// Generates a TCP RST in response to `packet`, per RFC 793 §3.4: if the
/// original segment had ACK set, the reset carries `seq = original.ack`
/// and no ACK; otherwise it carries `seq = 0`, ACK set, and
/// `ack = original.seq + segment_length` (SYN/FIN each counting as one
/// byte). Returns `None` if `packet` isn't TCP or is itself a RST — per
/// RFC 793 it is invalid to respond to a reset with a reset.
pub fn generate_reset_response(packet: &Packet) -> Result<Option<Packet>> {
    let data = packet.linearize();
    let (version, ip_hdr_len, proto) = ip::examine(&data)?;
    if proto != Proto::Tcp {
        return Ok(None);
    }

    let (src, dst) = ip::addresses(&data, version)?;
    let tcp = TcpView::new(&data[ip_hdr_len..])?;
    if tcp.has_flag(FLAG_RST) {
        return Ok(None);
    }

    let mut seg_len = tcp.payload().len() as u32;
    if tcp.has_flag(FLAG_SYN) {
        seg_len += 1;
    }
    if tcp.has_flag(FLAG_FIN) {
        seg_len += 1;
    }

    let (flags, seq, ack) = if tcp.has_flag(FLAG_ACK) {
        (FLAG_RST, tcp.ack_num(), 0)
    } else {
        (FLAG_RST | FLAG_ACK, 0, tcp.seq_num().wrapping_add(seg_len))
    };

    let response = build(dst, tcp.dest_port(), src, tcp.src_port(), flags, seq, ack, 0, &[], &[], 64)?;
    Ok(Some(response))
}

/// Adjusts the MSS option in a SYN packet. `modif_mss > 0` clamps the MSS
/// down to that ceiling; `modif_mss < 0` decreases it by that many bytes.
/// Returns `(old_mss, new_mss)` if a change was made.
pub fn fix_mss(packet: &mut Packet, modif_mss: i32) -> Result<Option<(u16, u16)>> {
    let mut data = packet.linearize();
    let (_version, ip_hdr_len, proto) = ip::examine(&data)?;
    if proto != Proto::Tcp {
        return Ok(None);
    }

    let old_mss = {
        let view = TcpView::new(&data[ip_hdr_len..])?;
        match view.opt_mss() {
            Some(v) => v,
            None => return Ok(None),
        }
    };

    let new_mss = if modif_mss > 0 {
        old_mss.min(modif_mss as u16)
    } else {
        old_mss.saturating_sub((-modif_mss) as u16)
    };

    if new_mss == old_mss {
        return Ok(Some((old_mss, old_mss)));
    }

    let mss_offset = find_mss_option_offset(&data[ip_hdr_len..]).ok_or_else(|| {
        TermError::InternalError("MSS option vanished between parse and rewrite".into())
    })?;
    let abs_offset = ip_hdr_len + mss_offset;

    {
        let mut tcp_mut = TcpViewMut::new(&mut data[ip_hdr_len..])?;
        tcp_mut.adjust_u16(old_mss, new_mss);
    }
    data[abs_offset..abs_offset + 2].copy_from_slice(&new_mss.to_be_bytes());

    *packet = Packet::from_bytes(Bytes::from(data.to_vec()));
    Ok(Some((old_mss, new_mss)))
}

fn find_mss_option_offset(tcp_data: &[u8]) -> Option<usize> {
    let view = TcpView::new(tcp_data).ok()?;
    if !view.has_flag(FLAG_SYN) {
        return None;
    }
    let opts_start = MIN_HEADER_SIZE;
    let opts_end = view.data_offset_bytes();
    let opts = &tcp_data[opts_start..opts_end];
    let mut i = 0;
    while i < opts.len() {
        let kind = opts[i];
        if kind == OPT_END {
            break;
        }
        if kind == OPT_NOP {
            i += 1;
            continue;
        }
        if i + 1 >= opts.len() {
            break;
        }
        let len = opts[i + 1] as usize;
        if len < 2 || i + len > opts.len() {
            break;
        }
        if kind == OPT_MSS && len == 4 {
            return Some(opts_start + i + 2);
        }
        i += len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn build_then_parse_round_trip() {
        let pkt = build(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            1,
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
            2,
            FLAG_SYN,
            100,
            0,
            0,
            &[],
            &[TcpOption::mss(1460)],
            64,
        )
        .unwrap();

        let data = pkt.linearize();
        let (version, ihl, proto) = ip::examine(&data).unwrap();
        assert_eq!(version, IpVersion::V4);
        assert_eq!(proto, Proto::Tcp);

        let tcp = TcpView::new(&data[ihl..]).unwrap();
        assert!(tcp.has_flag(FLAG_SYN));
        assert_eq!(tcp.seq_num(), 100);
        assert_eq!(tcp.data_offset_bytes(), 24);
        assert_eq!(tcp.opt_mss(), Some(1460));
    }

    #[test]
    fn reset_response_with_ack_uses_ack_as_seq() {
        let pkt = build(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            1000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            2000,
            FLAG_ACK,
            500,
            700,
            0,
            &[],
            &[],
            64,
        )
        .unwrap();

        let rst = generate_reset_response(&pkt).unwrap().unwrap();
        let data = rst.linearize();
        let (_v, ihl, _p) = ip::examine(&data).unwrap();
        let tcp = TcpView::new(&data[ihl..]).unwrap();
        assert!(tcp.has_flag(FLAG_RST));
        assert!(!tcp.has_flag(FLAG_ACK));
        assert_eq!(tcp.seq_num(), 700);
        assert_eq!(tcp.src_port(), 2000);
        assert_eq!(tcp.dest_port(), 1000);
    }

    #[test]
    fn reset_response_without_ack_counts_syn_as_one_byte() {
        let pkt = build(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            1000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            2000,
            FLAG_SYN,
            1000,
            0,
            0,
            &[],
            &[],
            64,
        )
        .unwrap();

        let rst = generate_reset_response(&pkt).unwrap().unwrap();
        let data = rst.linearize();
        let (_v, ihl, _p) = ip::examine(&data).unwrap();
        let tcp = TcpView::new(&data[ihl..]).unwrap();
        assert!(tcp.has_flag(FLAG_RST));
        assert!(tcp.has_flag(FLAG_ACK));
        assert_eq!(tcp.ack_num(), 1001);
    }

    #[test]
    fn no_reset_for_reset() {
        let pkt = build(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            1,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            2,
            FLAG_RST,
            1,
            0,
            0,
            &[],
            &[],
            64,
        )
        .unwrap();
        assert!(generate_reset_response(&pkt).unwrap().is_none());
    }

    #[test]
    fn fix_mss_clamps_down() {
        let mut pkt = build(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            1,
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
            2,
            FLAG_SYN,
            1,
            0,
            0,
            &[],
            &[TcpOption::mss(1460)],
            64,
        )
        .unwrap();

        let (old, new) = fix_mss(&mut pkt, 1300).unwrap().unwrap();
        assert_eq!(old, 1460);
        assert_eq!(new, 1300);

        let data = pkt.linearize();
        let (_v, ihl, _p) = ip::examine(&data).unwrap();
        let tcp = TcpView::new(&data[ihl..]).unwrap();
        assert_eq!(tcp.opt_mss(), Some(1300));
    }

    #[test]
    fn opt_len_rejects_end_option_and_caps_at_40() {
        assert_eq!(opt_len(&[TcpOption { kind: OPT_END, data: vec![] }]), 0);
        let many: Vec<TcpOption> = (0..10).map(|_| TcpOption::mss(1460)).collect();
        assert_eq!(opt_len(&many), 0);
    }
}
