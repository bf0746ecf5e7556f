//! Destination addresses.

use std::{
    convert::Infallible,
    fmt::Display,
    net::{
        IpAddr,
        SocketAddr,
    },
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

/// The host part of a destination: either an IP address or a DNS name.
#[derive(Clone, Debug, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub enum HostAddress {
    IpAddress(IpAddr),
    DnsName(String),
}

impl HostAddress {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_else(|never: Infallible| match never {})
    }

    /// The host as it is used in SNI, `Host` headers and certificates. IPv6
    /// addresses are not bracketed.
    pub fn to_host_string(&self) -> String {
        match self {
            Self::IpAddress(ip_address) => ip_address.to_string(),
            Self::DnsName(name) => name.clone(),
        }
    }
}

impl Display for HostAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IpAddress(IpAddr::V6(ip_address)) => write!(f, "[{ip_address}]"),
            Self::IpAddress(ip_address) => write!(f, "{ip_address}"),
            Self::DnsName(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for HostAddress {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(s);
        Ok(match IpAddr::from_str(s) {
            Ok(ip_address) => HostAddress::IpAddress(ip_address),
            Err(_) => HostAddress::DnsName(s.to_ascii_lowercase()),
        })
    }
}

/// A `host:port` pair.
#[derive(Clone, Debug, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct TcpAddress {
    pub host: HostAddress,
    pub port: u16,
}

impl TcpAddress {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: HostAddress::parse(host.as_ref()),
            port,
        }
    }

    /// Parses an authority like `example.com:443` or `[::1]:80`. If the port
    /// is missing, `default_port` is used.
    pub fn from_authority(authority: &str, default_port: u16) -> Result<Self, TcpAddressParseError> {
        let err = || TcpAddressParseError(authority.to_owned());
        if authority.is_empty() {
            return Err(err());
        }

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(err)?;
            let port = match &rest[end + 1..] {
                "" => None,
                port => Some(port.strip_prefix(':').ok_or_else(err)?),
            };
            (&authority[..end + 2], port)
        }
        else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        let port = match port {
            Some(port) => port.parse().map_err(|_| err())?,
            None => default_port,
        };
        Ok(Self {
            host: HostAddress::parse(host),
            port,
        })
    }
}

impl From<SocketAddr> for TcpAddress {
    fn from(value: SocketAddr) -> Self {
        Self {
            host: HostAddress::IpAddress(value.ip()),
            port: value.port(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid tcp address: {0}")]
pub struct TcpAddressParseError(String);

impl FromStr for TcpAddress {
    type Err = TcpAddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Self::from_authority(s, 0)?;
        if address.port == 0 {
            return Err(TcpAddressParseError(s.to_owned()));
        }
        Ok(address)
    }
}

impl Display for TcpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Serialize for TcpAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TcpAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{
        IpAddr,
        Ipv6Addr,
    };

    use super::{
        HostAddress,
        TcpAddress,
    };

    #[test]
    fn it_parses_a_dns_authority() {
        let address: TcpAddress = "Example.COM:8443".parse().unwrap();
        assert_eq!(address.host, HostAddress::DnsName("example.com".to_owned()));
        assert_eq!(address.port, 8443);
    }

    #[test]
    fn it_parses_a_bracketed_ipv6_authority() {
        let address = TcpAddress::from_authority("[::1]", 443).unwrap();
        assert_eq!(
            address.host,
            HostAddress::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
        assert_eq!(address.port, 443);
        assert_eq!(address.to_string(), "[::1]:443");
    }

    #[test]
    fn it_uses_the_default_port() {
        let address = TcpAddress::from_authority("example.com", 80).unwrap();
        assert_eq!(address.port, 80);
    }

    #[test]
    fn it_rejects_a_missing_port() {
        assert!("example.com".parse::<TcpAddress>().is_err());
        assert!("example.com:http".parse::<TcpAddress>().is_err());
    }
}
