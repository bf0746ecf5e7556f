//! Proxy options.
//!
//! [`ProxyConfig`] is shared read-only by every layer through the root
//! [`Context`](crate::layer::Context). It deserializes from the `[proxy]`
//! table of the command-line's TOML file, so every field has a default.

use std::{
    fmt::Display,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use regex::{
    Regex,
    RegexBuilder,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::address::{
    TcpAddress,
    TcpAddressParseError,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid proxy mode: {0}")]
    InvalidMode(String),

    #[error("invalid upstream address")]
    InvalidAddress(#[from] TcpAddressParseError),

    #[error("invalid host pattern: {pattern}")]
    InvalidHostPattern {
        #[source]
        error: regex::Error,
        pattern: String,
    },

    #[error("probability must be between 0 and 1, but is {0}")]
    InvalidProbability(f64),
}

/// Topology the proxy runs in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProxyMode {
    /// Explicit HTTP proxy. Clients send `CONNECT` or absolute-form requests.
    #[default]
    Regular,

    /// Clients don't know about the proxy. The destination is taken from the
    /// socket's original destination, the SNI or the `Host` header.
    Transparent,

    /// Every connection is forwarded to a fixed server.
    Reverse { scheme: Scheme, server: TcpAddress },

    /// Like [`ProxyMode::Regular`], but server connections are tunneled
    /// through another HTTP proxy.
    Upstream { proxy: TcpAddress },
}

impl ProxyMode {
    pub fn upstream_proxy(&self) -> Option<&TcpAddress> {
        match self {
            Self::Upstream { proxy } => Some(proxy),
            _ => None,
        }
    }

    /// Whether clients talk to us as an explicit proxy.
    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::Regular | Self::Upstream { .. })
    }
}

impl FromStr for ProxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, argument) = match s.split_once(':') {
            Some((name, argument)) => (name, Some(argument)),
            None => (s, None),
        };

        match (name, argument) {
            ("regular", None) => Ok(Self::Regular),
            ("transparent", None) => Ok(Self::Transparent),
            ("reverse", Some(url)) => {
                let (scheme, authority) = match url.split_once("://") {
                    Some((scheme, authority)) => (scheme.parse()?, authority),
                    None => (Scheme::Https, url),
                };
                let server = TcpAddress::from_authority(
                    authority.trim_end_matches('/'),
                    scheme.default_port(),
                )?;
                Ok(Self::Reverse { scheme, server })
            }
            ("upstream", Some(url)) => {
                let authority = url.strip_prefix("http://").unwrap_or(url);
                let proxy = TcpAddress::from_authority(authority.trim_end_matches('/'), 8080)?;
                Ok(Self::Upstream { proxy })
            }
            _ => Err(Error::InvalidMode(s.to_owned())),
        }
    }
}

impl Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regular => write!(f, "regular"),
            Self::Transparent => write!(f, "transparent"),
            Self::Reverse { scheme, server } => write!(f, "reverse:{scheme}://{server}"),
            Self::Upstream { proxy } => write!(f, "upstream:http://{proxy}"),
        }
    }
}

impl TryFrom<String> for ProxyMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProxyMode> for String {
    fn from(value: ProxyMode) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

impl From<strum::ParseError> for Error {
    fn from(value: strum::ParseError) -> Self {
        Self::InvalidMode(value.to_string())
    }
}

/// Which [`InterceptionStrategy`](crate::tls::strategy::InterceptionStrategy)
/// decides whether TLS connections are intercepted.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    Conservative,
    Probabilistic,
    PassthroughCache,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub kind: StrategyKind,

    /// Interception probability for [`StrategyKind::Probabilistic`].
    #[serde(default = "default_probability")]
    pub probability: f64,

    /// Number of outcomes remembered per destination.
    #[serde(default = "default_history_length")]
    pub history_length: usize,

    /// Where [`StrategyKind::PassthroughCache`] persists learned hosts.
    #[serde(default)]
    pub passthrough_cache_file: Option<PathBuf>,

    /// More hosts [`StrategyKind::PassthroughCache`] never intercepts, as
    /// regular expressions matching the whole host name.
    #[serde(default)]
    pub pinned_hosts: Vec<String>,
}

fn default_probability() -> f64 {
    0.5
}

fn default_history_length() -> usize {
    10
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: Default::default(),
            probability: default_probability(),
            history_length: default_history_length(),
            passthrough_cache_file: None,
            pinned_hosts: vec![],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub mode: ProxyMode,

    /// Maximum size of a request or response body that is buffered. Bigger
    /// bodies reset the HTTP/2 stream or close the HTTP/1 connection.
    #[serde(default)]
    pub body_size_limit: Option<usize>,

    /// Maximum size of an HTTP/1 head or an HTTP/2 header block.
    #[serde(default = "default_header_size_limit")]
    pub header_size_limit: usize,

    /// Offer and accept HTTP/2.
    #[serde(default = "default_true")]
    pub http2: bool,

    /// Forward HTTP/2 priority information to the server.
    #[serde(default)]
    pub http2_priority: bool,

    /// Don't verify server certificates.
    #[serde(default)]
    pub ssl_insecure: bool,

    /// Socket read timeout in seconds. `0` disables it.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,

    /// Timeout for establishing server connections in seconds. `0` disables
    /// it.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Number of forged certificates kept in memory.
    #[serde(default = "default_cert_cache_capacity")]
    pub cert_cache_capacity: usize,

    #[serde(default)]
    pub strategy: StrategyConfig,

    /// Destinations matching any of these are relayed without interception.
    #[serde(default)]
    pub ignore_hosts: Vec<String>,

    /// If not empty, only destinations matching one of these are
    /// intercepted.
    #[serde(default)]
    pub allow_hosts: Vec<String>,

    /// Destinations matching any of these are relayed as raw TCP after TLS
    /// has been handled.
    #[serde(default)]
    pub tcp_hosts: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_header_size_limit() -> usize {
    64 * 1024
}

fn default_read_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_cert_cache_capacity() -> usize {
    100
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: Default::default(),
            body_size_limit: None,
            header_size_limit: default_header_size_limit(),
            http2: true,
            http2_priority: false,
            ssl_insecure: false,
            read_timeout: default_read_timeout(),
            connect_timeout: default_connect_timeout(),
            cert_cache_capacity: default_cert_cache_capacity(),
            strategy: Default::default(),
            ignore_hosts: vec![],
            allow_hosts: vec![],
            tcp_hosts: vec![],
        }
    }
}

impl ProxyConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout > 0).then(|| Duration::from_secs(self.read_timeout))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout > 0).then(|| Duration::from_secs(self.connect_timeout))
    }

    /// Checks the options that can't be checked while deserializing.
    pub fn validate(&self) -> Result<(), Error> {
        let p = self.strategy.probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(Error::InvalidProbability(p));
        }
        HostFilters::new(self)?;
        Ok(())
    }
}

/// Compiled `ignore_hosts`, `allow_hosts` and `tcp_hosts` patterns.
#[derive(Clone, Debug, Default)]
pub struct HostFilters {
    ignore: Vec<Regex>,
    allow: Vec<Regex>,
    tcp: Vec<Regex>,
}

impl HostFilters {
    pub fn new(config: &ProxyConfig) -> Result<Self, Error> {
        Ok(Self {
            ignore: compile(&config.ignore_hosts)?,
            allow: compile(&config.allow_hosts)?,
            tcp: compile(&config.tcp_hosts)?,
        })
    }

    /// Whether the connection to `address` (with optional SNI) should be
    /// relayed without looking at it.
    pub fn ignores(&self, address: Option<&TcpAddress>, sni: Option<&str>) -> bool {
        if !self.allow.is_empty() && !matches_any(&self.allow, address, sni) {
            return true;
        }
        matches_any(&self.ignore, address, sni)
    }

    /// Whether the decrypted stream should be relayed raw instead of parsed.
    pub fn is_tcp(&self, address: Option<&TcpAddress>, sni: Option<&str>) -> bool {
        matches_any(&self.tcp, address, sni)
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, Error> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|error| {
                    Error::InvalidHostPattern {
                        error,
                        pattern: pattern.clone(),
                    }
                })
        })
        .collect()
}

fn matches_any(patterns: &[Regex], address: Option<&TcpAddress>, sni: Option<&str>) -> bool {
    patterns.iter().any(|pattern| {
        let by_address = address.map_or(false, |address| {
            pattern.is_match(&address.to_string())
                || pattern.is_match(&address.host.to_host_string())
        });
        let by_sni = sni.map_or(false, |sni| {
            pattern.is_match(sni)
                || address.map_or(false, |address| {
                    pattern.is_match(&format!("{sni}:{}", address.port))
                })
        });
        by_address || by_sni
    })
}
