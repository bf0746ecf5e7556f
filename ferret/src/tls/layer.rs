//! The TLS layer.
//!
//! Reads the ClientHello without consuming it and decides whether to
//! intercept. Intercepting means: connect to the server first, forge a
//! certificate with the names the server's certificate has, then finish the
//! handshake with the client and hand the decrypted stream to the next layer.
//! Whether the client accepted our certificate is recorded with the
//! interception strategy, so pinned hosts end up being passed through.

use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::BytesMut;
use rustls::server::Acceptor;
use tokio_rustls::LazyConfigAcceptor;
use tracing::Instrument;

use super::{
    certificate_names,
    client_hello::read_client_hello,
    strategy::{
        Attempt,
        FailureReason,
        Outcome,
    },
    ClientHelloData,
    TlsFailure,
};
use crate::{
    address::TcpAddress,
    connection::{
        ServerStream,
        TlsInfo,
    },
    http::{
        http1::Http1Layer,
        http2::Http2Layer,
    },
    layer::{
        sniff::run_next,
        tcp::Passthrough,
        Context,
        Layer,
        Scope,
        ServerTls,
    },
    util::io::{
        rewind,
        BoxedIo,
    },
    Error,
};

const ALPN_HTTP1: &[u8] = b"http/1.1";
const ALPN_HTTP2: &[u8] = b"h2";

#[derive(Clone, Copy, Debug, Default)]
pub struct TlsLayer;

impl TlsLayer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Layer for TlsLayer {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn layer(&self, context: Context, client: BoxedIo) -> Result<(), Error> {
        let span = tracing::debug_span!("tls");
        handle(context, client).instrument(span).await
    }
}

async fn handle(context: Context, mut client: BoxedIo) -> Result<(), Error> {
    let mut buf = BytesMut::new();
    let result = read_client_hello(&mut client, &mut buf, context.config().read_timeout()).await;
    let client = rewind(client, buf.freeze());

    let client_hello = match result {
        Ok(client_hello) => client_hello,
        Err(error) => {
            tracing::debug!(%error, "no valid client hello, relaying");
            return passthrough(context, client, None).await;
        }
    };

    let mut data = ClientHelloData {
        client: context.client(),
        destination: context.server_address(),
        sni: client_hello.sni,
        alpn_protocols: client_hello.alpn_protocols,
        ignore_connection: false,
    };
    context.hooks().tls_client_hello(&mut data).await;

    let destination = data.destination.clone().or_else(|| {
        data.sni
            .as_ref()
            .map(|sni| TcpAddress::new(sni, 443))
    });
    let Some(destination) = destination
    else {
        return Err(Error::NoDestination { layer: "tls" });
    };
    let host = data
        .sni
        .clone()
        .unwrap_or_else(|| destination.host.to_host_string());

    let proxy = context.proxy();
    if data.ignore_connection || proxy.filters().ignores(Some(&destination), data.sni.as_deref()) {
        tracing::debug!(%host, "ignored host, relaying");
        return passthrough(context, client, Some(destination)).await;
    }
    let strategy = proxy.tls().strategy().clone();
    if !strategy.should_intercept(&host) {
        tracing::debug!(%host, "not intercepting");
        return passthrough(context, client, Some(destination)).await;
    }

    intercept(context, client, data, destination, Attempt::new(strategy, host)).await
}

async fn intercept(
    context: Context,
    client: BoxedIo,
    data: ClientHelloData,
    destination: TcpAddress,
    attempt: Attempt,
) -> Result<(), Error> {
    let config = context.config();
    let alpn_protocols: Vec<Vec<u8>> = data
        .alpn_protocols
        .iter()
        .filter(|protocol| {
            protocol.as_slice() == ALPN_HTTP1 || (config.http2 && protocol.as_slice() == ALPN_HTTP2)
        })
        .cloned()
        .collect();

    // the server's certificate tells us which names to forge
    let server = if context.server_tls_setting() == Some(false) {
        None
    }
    else {
        let server_tls = ServerTls::new(data.sni.clone(), alpn_protocols.clone());
        match context.open_server(&destination, Some(server_tls)).await {
            Ok(server) => Some(server),
            Err(error) => {
                tracing::info!(server = %destination, %error, "could not connect to server, relaying");
                drop(attempt);
                return passthrough(context, client, Some(destination)).await;
            }
        }
    };

    let (common_name, sans, alpn) = forged_names(server.as_ref(), &data, &destination, &alpn_protocols);
    let server_config = match context
        .proxy()
        .tls()
        .server_config(common_name, sans, alpn)
        .await
    {
        Ok((server_config, _)) => server_config,
        Err(error) => {
            tracing::warn!(host = attempt.host(), %error, "could not forge a certificate, relaying");
            attempt.record(Outcome::Failure(FailureReason(format!(
                "forging a certificate failed: {error}"
            ))));
            drop(server);
            return passthrough(context, client, Some(destination)).await;
        }
    };

    let handshake = async {
        let start = LazyConfigAcceptor::new(Acceptor::default(), client).await?;
        start.into_stream(server_config).await
    };
    let stream = match handshake.await {
        Ok(stream) => stream,
        Err(error) => {
            let reason = FailureReason::from_handshake_error(&error);
            tracing::info!(host = attempt.host(), %reason, "client rejected our certificate");
            attempt.record(Outcome::Failure(reason.clone()));
            let failure = TlsFailure {
                client: context.client(),
                destination: Some(destination),
                sni: data.sni,
                reason,
            };
            context.hooks().tls_failed_client(&failure).await;
            return Ok(());
        }
    };
    attempt.record(Outcome::Success);

    let tls = TlsInfo::from_common_state(stream.get_ref().1, data.sni.clone());
    tracing::debug!(alpn = ?tls.alpn.as_deref().map(String::from_utf8_lossy), "intercepted");
    let is_http1 = tls.alpn_is(ALPN_HTTP1);
    let is_http2 = tls.alpn_is(ALPN_HTTP2);

    let server_tls = server.is_some();
    let context = context.child(
        "tls",
        Scope {
            server_address: Some(destination.clone()),
            server_tls: Some(server_tls),
            client_tls: Some(tls),
            server,
        },
    );
    let client: BoxedIo = Box::new(stream);

    if context
        .proxy()
        .filters()
        .is_tcp(Some(&destination), data.sni.as_deref())
    {
        Passthrough.layer(context, client).await
    }
    else if is_http2 {
        Http2Layer::new().layer(context, client).await
    }
    else if is_http1 {
        Http1Layer::transparent().layer(context, client).await
    }
    else {
        run_next(context, client).await
    }
}

/// Names and ALPN protocol for the certificate we show the client.
fn forged_names(
    server: Option<&ServerStream>,
    data: &ClientHelloData,
    destination: &TcpAddress,
    offered: &[Vec<u8>],
) -> (Option<String>, BTreeSet<String>, Option<Vec<u8>>) {
    let server_tls = server.and_then(|server| server.connection.tls.as_ref());

    let (mut common_name, mut sans) = server_tls
        .and_then(|tls| tls.certificate.as_ref())
        .map(certificate_names)
        .unwrap_or_default();

    let fallback = data
        .sni
        .clone()
        .unwrap_or_else(|| destination.host.to_host_string())
        .to_lowercase();
    common_name.get_or_insert_with(|| fallback.clone());
    sans.insert(fallback);

    let alpn = match server_tls {
        Some(tls) => tls.alpn.clone(),
        None => {
            offered
                .iter()
                .find(|protocol| protocol.as_slice() == ALPN_HTTP1)
                .cloned()
        }
    };

    (common_name, sans, alpn)
}

/// Relays the still encrypted connection.
async fn passthrough(
    context: Context,
    client: BoxedIo,
    destination: Option<TcpAddress>,
) -> Result<(), Error> {
    let context = match destination {
        Some(address) if context.server_address().as_ref() != Some(&address) => {
            context.child(
                "passthrough",
                Scope {
                    server_address: Some(address),
                    ..Default::default()
                },
            )
        }
        _ => context,
    };
    Passthrough.layer(context, client).await
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::Arc,
    };

    use rustls::{
        pki_types::{
            CertificateDer,
            PrivateKeyDer,
            PrivatePkcs8KeyDer,
            ServerName,
        },
        ClientConfig,
        RootCertStore,
        ServerConfig,
    };
    use tokio::{
        io::AsyncWriteExt,
        net::TcpListener,
    };
    use tokio_rustls::{
        TlsAcceptor,
        TlsConnector,
    };
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::TlsLayer;
    use crate::{
        address::TcpAddress,
        config::ProxyConfig,
        connection::ClientConnection,
        hooks::Hooks,
        http::{
            http1::{
                assemble::response_head,
                parse::BodySize,
                reader::Reader,
            },
            message::Response,
        },
        layer::{
            tests::proxy,
            Context,
            Layer,
            Scope,
        },
        proxy::Proxy,
        tls::{
            ca::Ca,
            strategy::Outcome,
            ClientHelloData,
        },
    };

    /// A TLS server for `localhost` that answers every request with `hello`.
    /// Returns its address and certificate.
    async fn tls_origin() -> (SocketAddr, CertificateDer<'static>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        let certificate = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![certificate.clone()], key)
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(stream) = acceptor.accept(stream).await
                    else {
                        return;
                    };
                    let mut reader = Reader::new(stream, None, 64 * 1024);
                    while let Ok(Some(_)) = reader.read_request().await {
                        let response = Response::text(200, "hello");
                        let mut data = response_head(&response).to_vec();
                        data.extend_from_slice(b"hello");
                        if reader.get_mut().write_all(&data).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (address, certificate)
    }

    async fn start(origin: SocketAddr) -> (Proxy, tokio::io::DuplexStream, tokio::task::JoinHandle<()>) {
        let proxy = proxy(ProxyConfig {
            ssl_insecure: true,
            ..Default::default()
        })
        .await;
        start_with(proxy, origin, None)
    }

    fn start_with(
        proxy: Proxy,
        origin: SocketAddr,
        server_tls: Option<bool>,
    ) -> (Proxy, tokio::io::DuplexStream, tokio::task::JoinHandle<()>) {
        let context = Context::new(proxy.clone(), ClientConnection::detached(), CancellationToken::new())
            .child(
                "transparent",
                Scope {
                    server_address: Some(TcpAddress::from(origin)),
                    server_tls,
                    ..Default::default()
                },
            );
        let (client, proxy_side) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            let _ = TlsLayer::new().layer(context, Box::new(proxy_side)).await;
        });
        (proxy, client, task)
    }

    fn client_config(roots: RootCertStore) -> TlsConnector {
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        TlsConnector::from(Arc::new(config))
    }

    #[tokio::test]
    async fn it_intercepts_with_a_forged_certificate() {
        let (origin, _) = tls_origin().await;
        let (proxy, client, _task) = start(origin).await;

        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::clone(proxy.tls().ca().root_cert()))
            .unwrap();
        let stream = client_config(roots)
            .connect(ServerName::try_from("localhost").unwrap(), client)
            .await
            .unwrap();

        let mut reader = Reader::new(stream, None, 64 * 1024);
        reader
            .get_mut()
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let response = reader.read_response().await.unwrap();
        assert_eq!(response.status, 200);
        let (body, _) = reader
            .body(BodySize::Known(5), None)
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(body, "hello");

        assert!(proxy.tls().strategy().should_intercept("localhost"));
    }

    #[tokio::test]
    async fn it_passes_through_after_the_client_rejected_our_certificate() {
        let (origin, _) = tls_origin().await;
        let (proxy, client, task) = start(origin).await;

        // a client that doesn't trust our CA, like one pinning certificates
        let result = client_config(RootCertStore::empty())
            .connect(ServerName::try_from("localhost").unwrap(), client)
            .await;
        assert!(result.is_err());
        task.await.unwrap();

        assert!(!proxy.tls().strategy().should_intercept("localhost"));
    }

    /// Claims a server name no certificate can carry.
    struct UnencodableName;

    #[async_trait]
    impl Hooks for UnencodableName {
        async fn tls_client_hello(&self, data: &mut ClientHelloData) {
            data.sni = Some("bücher.example".to_owned());
        }
    }

    #[tokio::test]
    async fn it_passes_through_when_forging_fails() {
        let (origin, certificate) = tls_origin().await;
        let proxy = Proxy::new(ProxyConfig::default(), UnencodableName, Ca::generate().await.unwrap())
            .await
            .unwrap();
        // no upstream handshake, so the forged names come from the server name
        let (proxy, client, _task) = start_with(proxy, origin, Some(false));

        // only the origin itself can complete this handshake
        let mut roots = RootCertStore::empty();
        roots.add(certificate).unwrap();
        let stream = client_config(roots)
            .connect(ServerName::try_from("localhost").unwrap(), client)
            .await
            .unwrap();

        let mut reader = Reader::new(stream, None, 64 * 1024);
        reader
            .get_mut()
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let response = reader.read_response().await.unwrap();
        assert_eq!(response.status, 200);

        let history = proxy.tls().strategy().history("bücher.example");
        assert!(matches!(history.as_slice(), [Outcome::Failure(_)]));
    }
}
