//! Accepting client connections.

use std::net::SocketAddr;

use ferret_util::error::ResultExt;
use tokio::net::{
    TcpListener,
    TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    address::TcpAddress,
    config::ProxyMode,
    connection::ClientConnection,
    proxy::Proxy,
};

pub const DEFAULT_PORT: u16 = 8080;

pub struct Builder {
    bind_address: SocketAddr,
    shutdown: CancellationToken,
    proxy: Proxy,
}

impl Builder {
    pub fn new(proxy: Proxy) -> Self {
        Self {
            bind_address: ([127, 0, 0, 1], DEFAULT_PORT).into(),
            shutdown: Default::default(),
            proxy,
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<SocketAddr>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_graceful_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn bind(self) -> Result<Server, crate::Error> {
        let listener = TcpListener::bind(self.bind_address).await?;
        Ok(Server {
            listener,
            shutdown: self.shutdown,
            proxy: self.proxy,
        })
    }

    pub async fn serve(self) -> Result<(), crate::Error> {
        self.bind().await?.serve().await
    }
}

/// A bound proxy listener.
pub struct Server {
    listener: TcpListener,
    shutdown: CancellationToken,
    proxy: Proxy,
}

impl Server {
    pub fn builder(proxy: Proxy) -> Builder {
        Builder::new(proxy)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, crate::Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the shutdown token is cancelled. Every
    /// connection is handled in its own task.
    pub async fn serve(self) -> Result<(), crate::Error> {
        tracing::info!(address = ?self.listener.local_addr().ok(), mode = %self.proxy.config().mode, "listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (socket, address) = match result {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            // e.g. out of file descriptors. Keep accepting.
                            tracing::warn!(%error, "accept failed");
                            continue;
                        }
                    };
                    self.spawn(socket, address);
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    fn spawn(&self, socket: TcpStream, address: SocketAddr) {
        let _ = socket.set_nodelay(true);
        let local_address = socket.local_addr().ok();
        let original_destination = match self.proxy.config().mode {
            ProxyMode::Transparent => original_destination(&socket, local_address),
            _ => None,
        };
        let connection = ClientConnection::new(Some(address), local_address);
        let proxy = self.proxy.clone();
        let shutdown = self.shutdown.child_token();

        tokio::spawn(
            async move {
                let _ = proxy
                    .handle(Box::new(socket), connection, original_destination, shutdown)
                    .await
                    .log_error();
            }
            .in_current_span(),
        );
    }
}

/// Where a transparently redirected connection was going. Connections that
/// weren't redirected report our own address, which is ignored.
#[cfg(target_os = "linux")]
fn original_destination(socket: &TcpStream, local_address: Option<SocketAddr>) -> Option<TcpAddress> {
    use std::net::Ipv4Addr;

    use nix::sys::socket::{
        getsockopt,
        sockopt::OriginalDst,
    };

    let destination = match getsockopt(socket, OriginalDst) {
        Ok(destination) => destination,
        Err(error) => {
            tracing::debug!(%error, "no original destination");
            return None;
        }
    };
    let address = SocketAddr::from((
        Ipv4Addr::from(u32::from_be(destination.sin_addr.s_addr)),
        u16::from_be(destination.sin_port),
    ));

    (Some(address) != local_address).then(|| address.into())
}

#[cfg(not(target_os = "linux"))]
fn original_destination(_socket: &TcpStream, _local_address: Option<SocketAddr>) -> Option<TcpAddress> {
    None
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{
            AsyncReadExt,
            AsyncWriteExt,
        },
        net::{
            TcpListener,
            TcpStream,
        },
    };
    use tokio_util::sync::CancellationToken;

    use super::Server;
    use crate::{
        config::ProxyConfig,
        hooks::NoHooks,
        proxy::Proxy,
        tls::ca::Ca,
    };

    #[tokio::test]
    async fn it_proxies_plain_http_requests() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_address = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = origin.accept().await.unwrap();
            let mut buf = vec![0; 1024];
            let mut head = vec![];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                head.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let proxy = Proxy::new(ProxyConfig::default(), NoHooks, Ca::generate().await.unwrap())
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let server = Server::builder(proxy)
            .with_bind_address(([127, 0, 0, 1], 0))
            .with_graceful_shutdown(shutdown.clone())
            .bind()
            .await
            .unwrap();
        let address = server.local_addr().unwrap();
        let serving = tokio::spawn(server.serve());

        let mut client = TcpStream::connect(address).await.unwrap();
        client
            .write_all(
                format!(
                    "GET http://{origin_address}/ HTTP/1.1\r\nhost: {origin_address}\r\nconnection: close\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let mut response = vec![];
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\nok"), "{response}");

        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }
}
