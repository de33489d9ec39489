//! Asynchronous DNS front end: resolves A/AAAA/SRV records on background
//! threads and delivers completions back onto the embedder's event loop.
//!
//! Grounded on `original_source/lib/asyncDns/DnsResolver.{hpp,cpp}`.

mod wire;
mod worker;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::addr::IpAddr;
use crate::config::DnsConfig;
use crate::error::{Result, TermError};
use crate::iface::EventLoop;

/// Request an A (IPv4 address) lookup.
pub const REQ_TYPE_A: u8 = 1 << 0;
/// Request an AAAA (IPv6 address) lookup.
pub const REQ_TYPE_AAAA: u8 = 1 << 1;
/// Request an SRV (service) lookup. Mutually exclusive with the address
/// types: a single [`DnsResolver::start`] call resolves either addresses
/// or a service, never both.
pub const REQ_TYPE_SRV: u8 = 1 << 2;

/// Force queries onto TCP from the start, skipping the UDP attempt.
pub const REQ_FLAG_USE_TCP: u8 = 1 << 0;
/// Never retry a truncated UDP response over TCP.
pub const REQ_FLAG_DONT_USE_TCP: u8 = 1 << 1;

const ADDR_TYPES: u8 = REQ_TYPE_A | REQ_TYPE_AAAA;

/// Per-server-family interface binding, mirroring `DnsResolver::IfaceConfig`.
/// The original also carries an Android-specific `bindToNetwork` handle;
/// dropped here since it has no portable Rust equivalent (see `DESIGN.md`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfaceConfig {
    pub bind_to_iface_v4: Option<String>,
    pub bind_to_iface_v6: Option<String>,
}

impl IfaceConfig {
    pub fn is_used(&self) -> bool {
        self.bind_to_iface_v4.as_deref().is_some_and(|s| !s.is_empty())
            || self.bind_to_iface_v6.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// A single SRV answer.
#[derive(Debug, Clone, PartialEq)]
pub struct SrvRecord {
    pub target: String,
    pub ttl: u32,
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
}

impl SrvRecord {
    pub fn is_valid(&self) -> bool {
        !self.target.is_empty() && self.port != 0
    }
}

/// Ascending by priority; among equal priorities, a weighted random draw
/// mirroring `DnsResolver::compareRecords` so that higher-weight records
/// sort first more often, without being deterministic about it.
pub fn compare_records(a: &SrvRecord, b: &SrvRecord) -> std::cmp::Ordering {
    if a.priority != b.priority {
        return a.priority.cmp(&b.priority);
    }
    let total = a.weight as u32 + b.weight as u32;
    let a_first = if total == 0 { rand::random::<bool>() } else { rand::random::<u32>() % total < a.weight as u32 };
    if a_first {
        std::cmp::Ordering::Less
    } else {
        std::cmp::Ordering::Greater
    }
}

/// The outcome delivered to a [`DnsOwner`] once a lookup completes.
#[derive(Debug, Clone)]
pub enum LookupResult {
    Addrs(Vec<IpAddr>),
    Srv(Vec<SrvRecord>),
}

/// Callback interface a [`DnsResolver`] reports completions to, mirroring
/// `DnsResolver::Owner`.
pub trait DnsOwner {
    fn dns_lookup_complete(&mut self, resolver_tag: u64, name: &str, result: LookupResult);
}

struct Inner {
    owner: Box<dyn DnsOwner + Send>,
    tag: u64,
    current_name: String,
    current_id: u64,
    last_id: u64,
    pending_req_type: u8,
    pending_addrs: Vec<IpAddr>,
}

impl Inner {
    /// Mirrors `DnsResolver::lookupComplete`: results whose generation
    /// doesn't match the in-progress lookup are stale (a `stop`/`start`
    /// happened since the worker thread was spawned) and silently dropped.
    fn lookup_complete(&mut self, id: u64, req_type: u8, outcome: Result<worker::WorkerOutcome>) {
        if id != self.current_id {
            tracing::debug!(name = %self.current_name, "dropping stale DNS completion");
            return;
        }

        if req_type == REQ_TYPE_SRV {
            let mut records = match outcome {
                Ok(worker::WorkerOutcome::Srv(records)) => records,
                Ok(worker::WorkerOutcome::Addrs(_)) => Vec::new(),
                Err(err) => {
                    tracing::debug!(name = %self.current_name, error = %err, "SRV lookup failed");
                    Vec::new()
                }
            };
            records.sort_by(compare_records);
            self.pending_req_type = 0;
            self.owner.dns_lookup_complete(self.tag, &self.current_name, LookupResult::Srv(records));
            return;
        }

        match outcome {
            Ok(worker::WorkerOutcome::Addrs(addrs)) => {
                for addr in addrs {
                    if !self.pending_addrs.contains(&addr) {
                        self.pending_addrs.push(addr);
                    }
                }
            }
            Ok(worker::WorkerOutcome::Srv(_)) => {}
            Err(err) => tracing::debug!(name = %self.current_name, error = %err, "address lookup failed"),
        }

        self.pending_req_type &= !req_type;
        if self.pending_req_type & ADDR_TYPES == 0 {
            let addrs = std::mem::take(&mut self.pending_addrs);
            self.owner.dns_lookup_complete(self.tag, &self.current_name, LookupResult::Addrs(addrs));
        }
    }
}

/// Resolves names on background threads, delivering completions back onto
/// the owner's event loop via [`EventLoop::post`]. Grounded on
/// `DnsResolver`'s thread-per-record-type worker model.
pub struct DnsResolver {
    inner: Arc<Mutex<Inner>>,
    events: Arc<dyn EventLoop + Send + Sync>,
}

impl DnsResolver {
    pub fn new(owner: Box<dyn DnsOwner + Send>, tag: u64, events: Arc<dyn EventLoop + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                owner,
                tag,
                current_name: String::new(),
                current_id: 0,
                last_id: 0,
                pending_req_type: 0,
                pending_addrs: Vec::new(),
            })),
            events,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.inner.lock().unwrap().current_id != 0
    }

    /// Abandons any in-progress lookup, resetting `currentId` to the
    /// reserved "no lookup" value of 0. Worker threads already spawned keep
    /// running to completion (they cannot be cancelled once the blocking
    /// socket call is underway) but their eventual result is recognized as
    /// stale and dropped, mirroring the original's generation-counter guard.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.current_id = 0;
        inner.pending_req_type = 0;
        inner.pending_addrs.clear();
    }

    /// Starts a new lookup, replacing any in-progress one. Validates
    /// `req_type`/`flags` exactly as `DnsResolver::start` does before
    /// spawning one worker thread per requested record type.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        servers: Vec<SocketAddr>,
        req_type: u8,
        name: &str,
        flags: u8,
        iface_config: Option<IfaceConfig>,
        timeout_secs: u16,
        config: &DnsConfig,
    ) -> Result<()> {
        if servers.is_empty() {
            return Err(TermError::InvalidParameter("no DNS servers configured".into()));
        }
        if name.is_empty() {
            return Err(TermError::InvalidParameter("DNS name must not be empty".into()));
        }
        if req_type == 0 || req_type & !(ADDR_TYPES | REQ_TYPE_SRV) != 0 {
            return Err(TermError::InvalidParameter("invalid DNS request type bitmask".into()));
        }
        if req_type & REQ_TYPE_SRV != 0 && req_type != REQ_TYPE_SRV {
            return Err(TermError::InvalidParameter("SRV lookups cannot be combined with A/AAAA".into()));
        }
        if flags & REQ_FLAG_USE_TCP != 0 && flags & REQ_FLAG_DONT_USE_TCP != 0 {
            return Err(TermError::InvalidParameter("useTcp and dontUseTcp are mutually exclusive".into()));
        }

        let timeout_secs = if timeout_secs == 0 || timeout_secs > config.max_timeout_secs { config.max_timeout_secs } else { timeout_secs };

        let generation = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_id = inner.last_id.wrapping_add(1);
            inner.current_id = inner.last_id;
            inner.current_name = name.to_string();
            inner.pending_req_type = req_type;
            inner.pending_addrs.clear();
            inner.current_id
        };

        tracing::debug!(name, req_type, timeout_secs, "starting DNS lookup");

        for bit in [REQ_TYPE_A, REQ_TYPE_AAAA, REQ_TYPE_SRV] {
            if req_type & bit == 0 {
                continue;
            }
            let name = name.to_string();
            let servers = servers.clone();
            let iface_config = iface_config.clone();
            let inner = Arc::clone(&self.inner);
            let events = Arc::clone(&self.events);

            std::thread::spawn(move || {
                let outcome = worker::resolve(&name, bit, &servers, flags, iface_config.as_ref(), timeout_secs);
                events.post(Box::new(move || {
                    inner.lock().unwrap().lookup_complete(generation, bit, outcome);
                }));
            });
        }

        Ok(())
    }
}
