//! Per-record-type DNS lookup worker: queries each configured server over
//! UDP, falling back to TCP when a response is truncated (unless
//! disabled), until one answers or the timeout elapses.
//!
//! Grounded on `threadMain` in `original_source/lib/asyncDns/
//! DnsResolver.cpp` ("one worker thread per requested record type",
//! `MaxTimeout` clamp, `dnsBoundSocket`'s interface-binding socket
//! factory). `dns_resolve_ext` itself (the underlying C resolver) is
//! replaced by [`super::wire`] plus the socket handling below.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::addr::IpAddr;
use crate::error::{Result, TermError};

use super::wire::{self, Answer, QTYPE_A, QTYPE_AAAA, QTYPE_SRV};
use super::{IfaceConfig, SrvRecord, REQ_FLAG_DONT_USE_TCP, REQ_FLAG_USE_TCP, REQ_TYPE_A, REQ_TYPE_AAAA, REQ_TYPE_SRV};

pub(crate) enum WorkerOutcome {
    Addrs(Vec<IpAddr>),
    Srv(Vec<SrvRecord>),
}

/// Resolves `name` for the single `req_type` bit against `servers`, trying
/// each server in order until one returns an answer or the deadline
/// passes. Mirrors `threadMain`'s single-shot-per-thread query loop.
pub(crate) fn resolve(
    name: &str,
    req_type: u8,
    servers: &[SocketAddr],
    flags: u8,
    iface_config: Option<&IfaceConfig>,
    timeout_secs: u16,
) -> Result<WorkerOutcome> {
    let qtype = match req_type {
        REQ_TYPE_A => QTYPE_A,
        REQ_TYPE_AAAA => QTYPE_AAAA,
        REQ_TYPE_SRV => QTYPE_SRV,
        _ => return Err(TermError::InvalidParameter("worker requires exactly one request type bit".into())),
    };

    let deadline = Instant::now() + Duration::from_secs(timeout_secs as u64);
    let query_id = (std::process::id() as u16) ^ rand::random::<u16>();
    let query = wire::encode_query(query_id, name, qtype)?;

    let mut last_err = TermError::InternalError("no DNS servers configured".into());

    for server in servers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match query_one(server, &query, qtype, flags, iface_config, remaining) {
            Ok(message) => return Ok(to_outcome(qtype, message.records)),
            Err(err) => {
                tracing::debug!(server = %server, error = %err, "DNS server did not answer, trying next");
                last_err = err;
            }
        }
    }

    Err(last_err)
}

fn query_one(
    server: &SocketAddr,
    query: &[u8],
    qtype: u16,
    flags: u8,
    iface_config: Option<&IfaceConfig>,
    timeout: Duration,
) -> Result<wire::Message> {
    if flags & REQ_FLAG_USE_TCP != 0 {
        return query_tcp(server, query, qtype, iface_config, timeout);
    }

    let message = query_udp(server, query, qtype, iface_config, timeout)?;
    if message.truncated && flags & REQ_FLAG_DONT_USE_TCP == 0 {
        return query_tcp(server, query, qtype, iface_config, timeout);
    }
    Ok(message)
}

fn query_udp(server: &SocketAddr, query: &[u8], qtype: u16, iface_config: Option<&IfaceConfig>, timeout: Duration) -> Result<wire::Message> {
    let socket = bound_udp_socket(server, iface_config)?;
    socket.set_read_timeout(Some(timeout)).map_err(io_err)?;
    socket.set_write_timeout(Some(timeout)).map_err(io_err)?;
    socket.send(query).map_err(io_err)?;

    let mut buf = [0u8; 4096];
    let n = socket.recv(&mut buf).map_err(io_err)?;
    wire::decode_message(&buf[..n], qtype)
}

fn query_tcp(server: &SocketAddr, query: &[u8], qtype: u16, iface_config: Option<&IfaceConfig>, timeout: Duration) -> Result<wire::Message> {
    let mut stream = bound_tcp_stream(server, iface_config, timeout)?;
    stream.set_read_timeout(Some(timeout)).map_err(io_err)?;
    stream.set_write_timeout(Some(timeout)).map_err(io_err)?;

    let framed = wire::with_tcp_length_prefix(query)?;
    stream.write_all(&framed).map_err(io_err)?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).map_err(io_err)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut msg_buf = vec![0u8; len];
    stream.read_exact(&mut msg_buf).map_err(io_err)?;

    wire::decode_message(&msg_buf, qtype)
}

fn bound_udp_socket(server: &SocketAddr, iface_config: Option<&IfaceConfig>) -> Result<UdpSocket> {
    let domain = if server.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(io_err)?;
    bind_to_iface(&socket, server, iface_config)?;
    let local: SocketAddr = if server.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };
    socket.bind(&local.into()).map_err(io_err)?;
    socket.connect(&(*server).into()).map_err(io_err)?;
    Ok(socket.into())
}

fn bound_tcp_stream(server: &SocketAddr, iface_config: Option<&IfaceConfig>, timeout: Duration) -> Result<TcpStream> {
    let domain = if server.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(io_err)?;
    bind_to_iface(&socket, server, iface_config)?;
    socket.connect_timeout(&(*server).into(), timeout).map_err(io_err)?;
    Ok(socket.into())
}

/// Binds the socket to a named interface before it connects, matching
/// `dnsBoundSocket`'s `SO_BINDTODEVICE`/`IP_BOUND_IF` handling. Only
/// implemented on Linux, where `socket2::Socket::bind_device` maps
/// directly onto `SO_BINDTODEVICE`; other platforms log and continue
/// unbound, the same outcome the original's `#else` branch falls back to
/// when neither `IP_BOUND_IF` nor `SO_BINDTODEVICE` is available.
#[cfg(target_os = "linux")]
fn bind_to_iface(socket: &Socket, server: &SocketAddr, iface_config: Option<&IfaceConfig>) -> Result<()> {
    let Some(cfg) = iface_config else { return Ok(()) };
    let iface = if server.is_ipv4() { cfg.bind_to_iface_v4.as_deref() } else { cfg.bind_to_iface_v6.as_deref() };
    let Some(iface) = iface else { return Ok(()) };
    if iface.is_empty() {
        return Ok(());
    }
    socket.bind_device(Some(iface.as_bytes())).map_err(io_err)
}

#[cfg(not(target_os = "linux"))]
fn bind_to_iface(_socket: &Socket, server: &SocketAddr, iface_config: Option<&IfaceConfig>) -> Result<()> {
    if let Some(cfg) = iface_config {
        let wants = if server.is_ipv4() { cfg.bind_to_iface_v4.as_deref() } else { cfg.bind_to_iface_v6.as_deref() };
        if wants.map(|s| !s.is_empty()).unwrap_or(false) {
            tracing::warn!("binding DNS sockets to a specific interface is not supported on this platform");
        }
    }
    Ok(())
}

fn to_outcome(qtype: u16, records: Vec<wire::Record>) -> WorkerOutcome {
    match qtype {
        QTYPE_SRV => WorkerOutcome::Srv(
            records
                .into_iter()
                .filter_map(|r| {
                    let ttl = r.ttl;
                    match r.answer {
                        Answer::Srv { priority, weight, port, target } => Some(SrvRecord { target, ttl, priority, weight, port }),
                        _ => None,
                    }
                })
                .collect(),
        ),
        _ => WorkerOutcome::Addrs(
            records
                .into_iter()
                .filter_map(|r| match r.answer {
                    Answer::A(a) => Some(IpAddr::V4(a)),
                    Answer::Aaaa(a) => Some(IpAddr::V6(a)),
                    _ => None,
                })
                .collect(),
        ),
    }
}

fn io_err(e: std::io::Error) -> TermError {
    TermError::InternalError(format!("DNS socket I/O error: {e}"))
}
