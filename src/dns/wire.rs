//! Minimal RFC 1035 message codec: encodes single-question A/AAAA/SRV
//! queries and decodes their responses.
//!
//! `original_source/lib/asyncDns/DnsResolver.{hpp,cpp}` performs real DNS
//! transactions against caller-supplied servers, but delegates the actual
//! wire encoding/decoding to an external C resolver library
//! (`dns_resolve_ext`, from `dns/DnsInternal.h`) that is not part of this
//! pack. This module supplies that missing layer directly from the RFC,
//! since the rest of `DnsResolver`'s contract (server list, timeout,
//! interface binding, per-type worker threads) is otherwise fully grounded
//! here.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Result, TermError};

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_SRV: u16 = 33;
const QCLASS_IN: u16 = 1;

/// A single decoded resource record relevant to this crate (A/AAAA/SRV;
/// anything else is silently dropped by [`decode_message`]).
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Srv { priority: u16, weight: u16, port: u16, target: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub ttl: u32,
    pub answer: Answer,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: u16,
    pub truncated: bool,
    pub records: Vec<Record>,
}

/// Encodes a single-question, recursion-desired query for `name`/`qtype`.
pub fn encode_query(id: u16, name: &str, qtype: u16) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(name.len() + 16);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1, standard query, no error
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&0u16.to_be_bytes()); // ancount
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount
    encode_name(&mut out, name)?;
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(out)
}

/// Prefixes `msg` with its big-endian `u16` length, as DNS-over-TCP
/// framing requires.
pub fn with_tcp_length_prefix(msg: &[u8]) -> Result<Vec<u8>> {
    let len: u16 = msg
        .len()
        .try_into()
        .map_err(|_| TermError::InvalidData("DNS message too large for TCP framing".into()))?;
    let mut out = Vec::with_capacity(msg.len() + 2);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(msg);
    Ok(out)
}

fn encode_name(out: &mut Vec<u8>, name: &str) -> Result<()> {
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > 63 {
            return Err(TermError::InvalidParameter(format!("DNS label '{label}' exceeds 63 bytes")));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// Decodes a complete response message (no TCP length prefix), keeping
/// only answers whose type matches `expected_qtype` and silently dropping
/// the rest, the same filtering `DnsResolver::lookupComplete` applies to
/// `dns_resolve_ext`'s results.
pub fn decode_message(data: &[u8], expected_qtype: u16) -> Result<Message> {
    require(data, 0, 12)?;
    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let truncated = flags & 0x0200 != 0;
    let rcode = flags & 0x000f;
    let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
    let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

    let mut pos = 12usize;
    for _ in 0..qdcount {
        pos = skip_name(data, pos)?;
        require(data, pos, 4)?;
        pos += 4;
    }

    if rcode != 0 {
        return Ok(Message { id, truncated, records: Vec::new() });
    }

    let mut records = Vec::with_capacity(ancount);
    for _ in 0..ancount {
        let (record, next) = decode_answer(data, pos, expected_qtype)?;
        pos = next;
        if let Some(record) = record {
            records.push(record);
        }
    }

    Ok(Message { id, truncated, records })
}

fn decode_answer(data: &[u8], pos: usize, expected_qtype: u16) -> Result<(Option<Record>, usize)> {
    let pos = skip_name(data, pos)?;
    require(data, pos, 10)?;
    let rtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
    let ttl = u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
    let rdlength = u16::from_be_bytes([data[pos + 8], data[pos + 9]]) as usize;
    let rdata_start = pos + 10;
    require(data, rdata_start, rdlength)?;
    let rdata_end = rdata_start + rdlength;

    let answer = if rtype != expected_qtype {
        None
    } else {
        match rtype {
            QTYPE_A if rdlength == 4 => Some(Answer::A(Ipv4Addr::new(
                data[rdata_start],
                data[rdata_start + 1],
                data[rdata_start + 2],
                data[rdata_start + 3],
            ))),
            QTYPE_AAAA if rdlength == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[rdata_start..rdata_start + 16]);
                Some(Answer::Aaaa(Ipv6Addr::from(octets)))
            }
            QTYPE_SRV if rdlength >= 6 => {
                let priority = u16::from_be_bytes([data[rdata_start], data[rdata_start + 1]]);
                let weight = u16::from_be_bytes([data[rdata_start + 2], data[rdata_start + 3]]);
                let port = u16::from_be_bytes([data[rdata_start + 4], data[rdata_start + 5]]);
                let (target, _) = decode_name(data, rdata_start + 6)?;
                Some(Answer::Srv { priority, weight, port, target })
            }
            _ => None,
        }
    };

    Ok((answer.map(|answer| Record { ttl, answer }), rdata_end))
}

fn require(data: &[u8], pos: usize, len: usize) -> Result<()> {
    if pos.checked_add(len).map(|end| end > data.len()).unwrap_or(true) {
        return Err(TermError::InvalidData("DNS message truncated".into()));
    }
    Ok(())
}

/// Skips over a (possibly compressed) name, returning the position right
/// after its on-the-wire representation, without allocating the decoded
/// string. Used to walk past the question section.
fn skip_name(data: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        require(data, pos, 1)?;
        let len = data[pos];
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xc0 == 0xc0 {
            require(data, pos, 2)?;
            return Ok(pos + 2);
        }
        if len & 0xc0 != 0 {
            return Err(TermError::InvalidData("unsupported DNS name label".into()));
        }
        pos = pos
            .checked_add(1 + len as usize)
            .ok_or_else(|| TermError::InvalidData("DNS name overflowed message".into()))?;
    }
}

/// Decodes a (possibly compressed) name starting at `start`, returning the
/// decoded name and the position right after its on-the-wire
/// representation (the pointer itself when compressed, not the
/// pointed-to bytes).
fn decode_name(data: &[u8], start: usize) -> Result<(String, usize)> {
    let mut labels = Vec::new();
    let mut pos = start;
    let mut end_pos = None;
    let mut jumps = 0;

    loop {
        require(data, pos, 1)?;
        let len = data[pos];
        if len == 0 {
            if end_pos.is_none() {
                end_pos = Some(pos + 1);
            }
            break;
        }
        if len & 0xc0 == 0xc0 {
            require(data, pos, 2)?;
            if end_pos.is_none() {
                end_pos = Some(pos + 2);
            }
            jumps += 1;
            if jumps > 64 {
                return Err(TermError::InvalidData("DNS name compression loop".into()));
            }
            let offset = (((len & 0x3f) as usize) << 8) | data[pos + 1] as usize;
            if offset >= data.len() {
                return Err(TermError::InvalidData("DNS name pointer out of range".into()));
            }
            pos = offset;
            continue;
        }
        if len & 0xc0 != 0 {
            return Err(TermError::InvalidData("unsupported DNS name label".into()));
        }
        let label_start = pos + 1;
        require(data, label_start, len as usize)?;
        labels.push(String::from_utf8_lossy(&data[label_start..label_start + len as usize]).into_owned());
        pos = label_start + len as usize;
    }

    Ok((labels.join("."), end_pos.unwrap_or(pos)))
}
