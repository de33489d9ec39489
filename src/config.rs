use serde::Deserialize;

/// Top-level tunables for the TCP and UDP terminators plus the DNS front
/// end. This crate does not read files itself — loading configuration from
/// disk or a remote source is the embedder's job (see `iface`), this type
/// only parses an already-read TOML string via [`TermConfig::from_toml_str`].
#[derive(Debug, Deserialize, Clone)]
pub struct TermConfig {
    #[serde(default)]
    pub tcp: TcpTerminatorConfig,
    #[serde(default)]
    pub udp: UdpTerminatorConfig,
    #[serde(default)]
    pub dns: DnsConfig,
}

impl Default for TermConfig {
    fn default() -> Self {
        Self {
            tcp: TcpTerminatorConfig::default(),
            udp: UdpTerminatorConfig::default(),
            dns: DnsConfig::default(),
        }
    }
}

impl TermConfig {
    /// Parses configuration from an already-loaded TOML string.
    pub fn from_toml_str(s: &str) -> crate::error::Result<Self> {
        toml::from_str(s).map_err(|e| crate::error::TermError::Config(e.to_string()))
    }
}

/// TCP terminator tunables.
#[derive(Debug, Deserialize, Clone)]
pub struct TcpTerminatorConfig {
    /// Default negotiated MSS when the client does not offer one, or when
    /// its offer exceeds the configured path MTU minus overhead.
    /// Default: 1300.
    #[serde(default = "default_mss")]
    pub default_mss: u16,
    /// Lowest MSS this terminator will ever negotiate down to.
    /// Default: 536 (the RFC 879 minimum IPv4 default).
    #[serde(default = "default_min_mss")]
    pub min_mss: u16,
    /// Retransmit timer, in milliseconds.
    /// Default: 500.
    #[serde(default = "default_retrans_ms")]
    pub retrans_ms: u32,
    /// Linger time after a connection is marked Broken (RST seen), in
    /// milliseconds, before the terminator is evicted.
    /// Default: 30000 (30 s).
    #[serde(default = "default_broken_linger_ms")]
    pub broken_linger_ms: u32,
    /// Linger time after both FINs are acknowledged, in milliseconds,
    /// before the terminator is evicted.
    /// Default: 1000 (1 s).
    #[serde(default = "default_closed_linger_ms")]
    pub closed_linger_ms: u32,
}

impl Default for TcpTerminatorConfig {
    fn default() -> Self {
        Self {
            default_mss: default_mss(),
            min_mss: default_min_mss(),
            retrans_ms: default_retrans_ms(),
            broken_linger_ms: default_broken_linger_ms(),
            closed_linger_ms: default_closed_linger_ms(),
        }
    }
}

/// UDP terminator tunables.
#[derive(Debug, Deserialize, Clone)]
pub struct UdpTerminatorConfig {
    /// Idle timeout before a UDP terminator is evicted, in milliseconds.
    /// Default: 60000 (60 s).
    #[serde(default = "default_udp_idle_ms")]
    pub idle_ms: u32,
}

impl Default for UdpTerminatorConfig {
    fn default() -> Self {
        Self { idle_ms: default_udp_idle_ms() }
    }
}

/// DNS front-end tunables.
#[derive(Debug, Deserialize, Clone)]
pub struct DnsConfig {
    /// Maximum per-query timeout, in seconds. Caller-provided timeouts
    /// greater than this (or equal to 0) are clamped down to this value.
    /// Default: 120.
    #[serde(default = "default_dns_max_timeout_secs")]
    pub max_timeout_secs: u16,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self { max_timeout_secs: default_dns_max_timeout_secs() }
    }
}

fn default_mss() -> u16 {
    1300
}

fn default_min_mss() -> u16 {
    536
}

fn default_retrans_ms() -> u32 {
    500
}

fn default_broken_linger_ms() -> u32 {
    30_000
}

fn default_closed_linger_ms() -> u32 {
    1_000
}

fn default_udp_idle_ms() -> u32 {
    60_000
}

fn default_dns_max_timeout_secs() -> u16 {
    120
}
