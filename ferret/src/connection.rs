//! Connection metadata.
//!
//! The byte streams themselves are [`BoxedIo`]s owned by whichever layer
//! currently runs. The types here describe them and are copied into every
//! [`Flow`](crate::flow::Flow) that passes over the connection.

use std::{
    fmt::Display,
    net::SocketAddr,
};

use chrono::{
    DateTime,
    Utc,
};
use rustls::pki_types::CertificateDer;
use serde::{
    Deserialize,
    Serialize,
};
use uuid::Uuid;

use crate::{
    address::TcpAddress,
    util::io::BoxedIo,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of an established TLS session on one side of the proxy.
#[derive(Clone, Debug, Default)]
pub struct TlsInfo {
    pub sni: Option<String>,
    pub alpn: Option<Vec<u8>>,
    /// The peer's leaf certificate for server connections, our forged one
    /// for client connections.
    pub certificate: Option<CertificateDer<'static>>,
    pub cipher: Option<String>,
    pub version: Option<String>,
}

impl TlsInfo {
    pub fn alpn_is(&self, protocol: &[u8]) -> bool {
        self.alpn.as_deref() == Some(protocol)
    }

    pub(crate) fn from_common_state(state: &rustls::CommonState, sni: Option<String>) -> Self {
        Self {
            sni,
            alpn: state.alpn_protocol().map(ToOwned::to_owned),
            certificate: state
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.clone().into_owned()),
            cipher: state
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            version: state.protocol_version().map(|version| format!("{version:?}")),
        }
    }
}

/// The connection between the client and the proxy.
#[derive(Clone, Debug)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub peer_address: Option<SocketAddr>,
    pub local_address: Option<SocketAddr>,
    pub tls: Option<TlsInfo>,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_tls_setup: Option<DateTime<Utc>>,
    pub timestamp_end: Option<DateTime<Utc>>,
}

impl ClientConnection {
    pub fn new(peer_address: Option<SocketAddr>, local_address: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer_address,
            local_address,
            tls: None,
            timestamp_start: Utc::now(),
            timestamp_tls_setup: None,
            timestamp_end: None,
        }
    }

    /// Stand-in for replayed flows, which have no real client.
    pub fn detached() -> Self {
        Self::new(None, None)
    }
}

/// The connection between the proxy and the server.
#[derive(Clone, Debug)]
pub struct ServerConnection {
    pub id: ConnectionId,
    pub address: TcpAddress,
    pub peer_address: Option<SocketAddr>,
    /// Upstream proxy this connection is tunneled through.
    pub via: Option<TcpAddress>,
    pub tls: Option<TlsInfo>,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_tcp_setup: Option<DateTime<Utc>>,
    pub timestamp_tls_setup: Option<DateTime<Utc>>,
    pub timestamp_end: Option<DateTime<Utc>>,
}

impl ServerConnection {
    pub fn new(address: TcpAddress) -> Self {
        Self {
            id: ConnectionId::new(),
            address,
            peer_address: None,
            via: None,
            tls: None,
            timestamp_start: Utc::now(),
            timestamp_tcp_setup: None,
            timestamp_tls_setup: None,
            timestamp_end: None,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// An open server connection.
pub struct ServerStream {
    pub connection: ServerConnection,
    pub io: BoxedIo,
}

impl ServerStream {
    /// Whether this stream can carry requests for `address`, with or without
    /// TLS.
    pub fn serves(&self, address: &TcpAddress, tls: bool) -> bool {
        &self.connection.address == address && self.connection.is_tls() == tls
    }

    pub fn close(mut self) -> ServerConnection {
        self.connection.timestamp_end = Some(Utc::now());
        self.connection
    }
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
