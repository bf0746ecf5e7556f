//! The layer stack.
//!
//! A connection is handled by a chain of [`Layer`]s. Each one speaks one
//! protocol, and hands the (possibly decrypted) stream to the next layer,
//! which is usually picked by [`next_layer`] sniffing the first bytes.
//!
//! Layers don't pass state to each other directly. Instead each layer runs
//! with a [`Context`] that is a child of its parent's context, and lookups of
//! things like the server address walk up the chain until some layer set them.

pub mod modes;
pub mod sniff;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub use self::sniff::next_layer;
use crate::{
    address::TcpAddress,
    config::ProxyConfig,
    connection::{
        ClientConnection,
        ServerConnection,
        ServerStream,
        TlsInfo,
    },
    hooks::Hooks,
    proxy::Proxy,
    tls,
    util::io::BoxedIo,
};

#[async_trait]
pub trait Layer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs until this layer's protocol is done with the connection.
    async fn layer(&self, context: Context, client: BoxedIo) -> Result<(), crate::Error>;
}

/// What a layer knows and wants to tell the layers below it.
#[derive(Debug, Default)]
pub struct Scope {
    /// Where the connection is going.
    pub server_address: Option<TcpAddress>,
    /// Whether the server must be talked to over TLS.
    pub server_tls: Option<bool>,
    /// TLS state of the client connection, once decrypted.
    pub client_tls: Option<TlsInfo>,
    /// A server connection that was already opened.
    pub server: Option<ServerStream>,
}

struct Root {
    proxy: Proxy,
    client: ClientConnection,
    shutdown: CancellationToken,
}

struct Node {
    parent: Option<Context>,
    layer: &'static str,
    server_address: Option<TcpAddress>,
    server_tls: Option<bool>,
    client_tls: Option<TlsInfo>,
    server: Mutex<Option<ServerStream>>,
    root: Arc<Root>,
}

/// A layer's view of the connection. Cheap to clone.
///
/// Contexts form a singly linked list from the innermost layer to the root,
/// which holds the proxy's shared services and the client connection.
#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

impl Context {
    pub fn new(proxy: Proxy, client: ClientConnection, shutdown: CancellationToken) -> Self {
        let root = Arc::new(Root {
            proxy,
            client,
            shutdown,
        });
        Self {
            node: Arc::new(Node {
                parent: None,
                layer: "root",
                server_address: None,
                server_tls: None,
                client_tls: None,
                server: Mutex::new(None),
                root,
            }),
        }
    }

    /// Context for a layer running below this one.
    pub fn child(&self, layer: &'static str, scope: Scope) -> Self {
        Self {
            node: Arc::new(Node {
                parent: Some(self.clone()),
                layer,
                server_address: scope.server_address,
                server_tls: scope.server_tls,
                client_tls: scope.client_tls,
                server: Mutex::new(scope.server),
                root: self.node.root.clone(),
            }),
        }
    }

    fn find<T>(&self, f: impl Fn(&Node) -> Option<T>) -> Option<T> {
        let mut node = &self.node;
        loop {
            if let Some(value) = f(node) {
                return Some(value);
            }
            match &node.parent {
                Some(parent) => node = &parent.node,
                None => return None,
            }
        }
    }

    pub fn layer_name(&self) -> &'static str {
        self.node.layer
    }

    /// Names of the layers from the root to this one.
    pub fn layer_names(&self) -> Vec<&'static str> {
        let mut names = vec![];
        let mut node = &self.node;
        loop {
            names.push(node.layer);
            match &node.parent {
                Some(parent) => node = &parent.node,
                None => break,
            }
        }
        names.reverse();
        names
    }

    pub fn proxy(&self) -> &Proxy {
        &self.node.root.proxy
    }

    pub fn config(&self) -> &ProxyConfig {
        self.proxy().config()
    }

    pub fn hooks(&self) -> &Arc<dyn Hooks> {
        self.proxy().hooks()
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.node.root.shutdown
    }

    /// The client connection, with the TLS state the innermost TLS layer set.
    pub fn client(&self) -> ClientConnection {
        let mut client = self.node.root.client.clone();
        if let Some(tls) = self.client_tls() {
            client.timestamp_tls_setup.get_or_insert_with(Utc::now);
            client.tls = Some(tls);
        }
        client
    }

    pub fn client_tls(&self) -> Option<TlsInfo> {
        self.find(|node| node.client_tls.clone())
    }

    pub fn server_address(&self) -> Option<TcpAddress> {
        self.find(|node| node.server_address.clone())
    }

    /// Whether the server must be talked to over TLS. Defaults to whether the
    /// client connection is encrypted.
    pub fn server_tls(&self) -> bool {
        self.server_tls_setting()
            .unwrap_or_else(|| self.client_tls().is_some())
    }

    /// Whether a layer above decided if the server is talked to over TLS.
    pub fn server_tls_setting(&self) -> Option<bool> {
        self.find(|node| node.server_tls)
    }

    /// Takes the server connection a layer above opened.
    pub fn take_server(&self) -> Option<ServerStream> {
        self.find(|node| node.server.lock().take())
    }

    /// Opens a new server connection, through the upstream proxy if one is
    /// configured.
    pub async fn open_server(
        &self,
        address: &TcpAddress,
        tls: Option<ServerTls>,
    ) -> Result<ServerStream, crate::http::Error> {
        self.proxy().open_server(address, tls).await
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("layers", &self.layer_names())
            .field("server_address", &self.server_address())
            .finish_non_exhaustive()
    }
}

/// How to do the TLS handshake with a server.
#[derive(Clone, Debug, Default)]
pub struct ServerTls {
    /// Server name to send. Defaults to the host of the server address.
    pub sni: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl ServerTls {
    pub fn new(sni: Option<String>, alpn_protocols: Vec<Vec<u8>>) -> Self {
        Self {
            sni,
            alpn_protocols,
        }
    }
}

/// Fills in what [`Proxy::open_server`] needs from a finished TLS stream.
pub(crate) fn server_tls_info(
    connection: &mut ServerConnection,
    state: &rustls::CommonState,
    sni: Option<String>,
) {
    connection.tls = Some(TlsInfo::from_common_state(state, sni));
    connection.timestamp_tls_setup = Some(Utc::now());
}

pub(crate) fn tls_error(address: &TcpAddress, error: tls::Error) -> crate::http::Error {
    crate::http::Error::ServerTls {
        address: address.clone(),
        error,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio_util::sync::CancellationToken;

    use super::{
        Context,
        Scope,
    };
    use crate::{
        address::TcpAddress,
        config::ProxyConfig,
        connection::{
            ClientConnection,
            TlsInfo,
        },
        hooks::NoHooks,
        proxy::Proxy,
        tls::ca::Ca,
    };

    pub(crate) async fn proxy(config: ProxyConfig) -> Proxy {
        Proxy::new(config, NoHooks, Ca::generate().await.unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn it_looks_up_values_in_parent_contexts() {
        let root = Context::new(
            proxy(ProxyConfig::default()).await,
            ClientConnection::detached(),
            CancellationToken::new(),
        );
        assert!(root.server_address().is_none());
        assert!(!root.server_tls());

        let connect = root.child(
            "http1",
            Scope {
                server_address: Some(TcpAddress::new("example.com", 443)),
                ..Default::default()
            },
        );
        let tls = connect.child(
            "tls",
            Scope {
                client_tls: Some(TlsInfo {
                    sni: Some("example.com".to_owned()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let inner = tls.child("http1", Scope::default());

        assert_eq!(
            inner.server_address(),
            Some(TcpAddress::new("example.com", 443))
        );
        assert!(inner.server_tls());
        assert!(inner.client().tls.is_some());
        assert!(connect.client().tls.is_none());
        assert_eq!(inner.layer_names(), vec!["root", "http1", "tls", "http1"]);
    }
}
