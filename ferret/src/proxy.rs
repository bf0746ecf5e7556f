//! Services shared by all connections of a proxy.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    address::TcpAddress,
    config::{
        HostFilters,
        ProxyConfig,
    },
    connect::Connector,
    connection::{
        ClientConnection,
        ServerConnection,
        ServerStream,
    },
    hooks::Hooks,
    http,
    layer::{
        modes::ModeLayer,
        server_tls_info,
        tls_error,
        Context,
        Layer,
        ServerTls,
    },
    tls::{
        self,
        ca::Ca,
    },
    util::io::BoxedIo,
};

struct Inner {
    config: Arc<ProxyConfig>,
    hooks: Arc<dyn Hooks>,
    tls: tls::Context,
    connector: Connector,
    filters: HostFilters,
}

/// An intercepting proxy. Cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

impl Proxy {
    pub async fn new(config: ProxyConfig, hooks: impl Hooks, ca: Ca) -> Result<Self, crate::Error> {
        let tls = tls::Context::new(ca, &config).await?;
        Self::with_tls(config, Arc::new(hooks), tls)
    }

    /// Creates a proxy with an existing TLS context, e.g. to share the
    /// certificate cache or use a custom interception strategy.
    pub fn with_tls(
        config: ProxyConfig,
        hooks: Arc<dyn Hooks>,
        tls: tls::Context,
    ) -> Result<Self, crate::Error> {
        config.validate()?;
        let filters = HostFilters::new(&config)?;
        let connector = Connector::new(
            config.mode.upstream_proxy().cloned(),
            config.connect_timeout(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                hooks,
                tls,
                connector,
                filters,
            }),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn hooks(&self) -> &Arc<dyn Hooks> {
        &self.inner.hooks
    }

    pub fn tls(&self) -> &tls::Context {
        &self.inner.tls
    }

    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }

    pub fn filters(&self) -> &HostFilters {
        &self.inner.filters
    }

    /// Handles one client connection until it's closed or `shutdown` is
    /// triggered.
    ///
    /// `original_destination` is where a transparently redirected connection
    /// was going.
    pub async fn handle(
        &self,
        client: BoxedIo,
        connection: ClientConnection,
        original_destination: Option<TcpAddress>,
        shutdown: CancellationToken,
    ) -> Result<(), crate::Error> {
        let span = tracing::info_span!(
            "connection",
            id = %connection.id,
            client = ?connection.peer_address,
        );
        let context = Context::new(self.clone(), connection, shutdown.clone());
        let layer = ModeLayer::new(self.config().mode.clone(), original_destination);

        tokio::select! {
            result = layer.layer(context, client).instrument(span) => result,
            _ = shutdown.cancelled() => Ok(()),
        }
    }

    /// Connects to `address`, with TLS if `tls` is set.
    pub async fn open_server(
        &self,
        address: &TcpAddress,
        tls: Option<ServerTls>,
    ) -> Result<ServerStream, http::Error> {
        let mut connection = ServerConnection::new(address.clone());
        connection.via = self.connector().upstream_proxy().cloned();

        let stream = self
            .connector()
            .connect(address)
            .await
            .map_err(|error| {
                http::Error::Connect {
                    address: address.clone(),
                    error,
                }
            })?;
        connection.peer_address = stream.get_ref().peer_addr().ok();
        connection.timestamp_tcp_setup = Some(Utc::now());
        tracing::debug!(server = %address, via = ?connection.via, "connected to server");

        let io: BoxedIo = match tls {
            None => Box::new(stream),
            Some(ServerTls {
                sni,
                alpn_protocols,
            }) => {
                let host = sni.clone().unwrap_or_else(|| address.host.to_host_string());
                let server_name = tls::server_name(&host).map_err(|error| tls_error(address, error))?;
                let stream = self
                    .tls()
                    .connect(stream, server_name, alpn_protocols)
                    .await
                    .map_err(|error| tls_error(address, error))?;
                server_tls_info(&mut connection, stream.get_ref().1, Some(host));
                Box::new(stream)
            }
        };

        Ok(ServerStream { connection, io })
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("config", &self.inner.config)
            .field("tls", &self.inner.tls)
            .finish_non_exhaustive()
    }
}
