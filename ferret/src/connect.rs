//! Outbound connections.

use std::{
    future::Future,
    time::Duration,
};

use bytes::BytesMut;
use tokio::{
    io::{
        AsyncRead,
        AsyncWrite,
        AsyncWriteExt,
    },
    net::TcpStream,
};

use super::address::{
    HostAddress,
    TcpAddress,
};
use crate::util::io::{
    read_buf_timeout,
    Rewind,
};

pub trait Connect {
    type Connection: AsyncRead + AsyncWrite + Send + Sync + Unpin;

    fn connect(
        &self,
        address: &TcpAddress,
    ) -> impl Future<Output = Result<Self::Connection, std::io::Error>> + Send;
}

#[derive(Clone, Copy, Debug)]
pub struct ConnectTcp;

impl Connect for ConnectTcp {
    type Connection = TcpStream;

    async fn connect(&self, address: &TcpAddress) -> Result<Self::Connection, std::io::Error> {
        let stream = match &address.host {
            HostAddress::IpAddress(ip) => TcpStream::connect((*ip, address.port)).await?,
            HostAddress::DnsName(dns_name) => {
                TcpStream::connect((dns_name.as_str(), address.port)).await?
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Connects through another HTTP proxy using `CONNECT`.
#[derive(Clone, Debug)]
pub struct ConnectUpstream {
    pub proxy: TcpAddress,
}

impl Connect for ConnectUpstream {
    type Connection = Rewind<TcpStream>;

    async fn connect(&self, address: &TcpAddress) -> Result<Self::Connection, std::io::Error> {
        let mut stream = ConnectTcp.connect(&self.proxy).await?;

        let request = format!(
            "CONNECT {address} HTTP/1.1\r\nHost: {address}\r\nProxy-Connection: keep-alive\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await?;

        let mut buf = BytesMut::with_capacity(1024);
        let head_length = loop {
            if read_buf_timeout(&mut stream, &mut buf, None).await? == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }

            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(&buf) {
                Ok(httparse::Status::Complete(n)) => {
                    let code = response.code.unwrap_or_default();
                    if !(200..300).contains(&code) {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::ConnectionRefused,
                            format!("upstream proxy refused CONNECT to {address}: {code}"),
                        ));
                    }
                    break n;
                }
                Ok(httparse::Status::Partial) if buf.len() < 16 * 1024 => {}
                Ok(httparse::Status::Partial) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "upstream proxy response head too large",
                    ));
                }
                Err(e) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
                }
            }
        };

        let rest = buf.split_off(head_length);
        Ok(Rewind::new(stream, rest.freeze()))
    }
}

/// The connector used by the layers: direct or through an upstream proxy,
/// with a connect timeout.
#[derive(Clone, Debug)]
pub struct Connector {
    upstream: Option<ConnectUpstream>,
    timeout: Option<Duration>,
}

impl Connector {
    pub fn new(upstream_proxy: Option<TcpAddress>, timeout: Option<Duration>) -> Self {
        Self {
            upstream: upstream_proxy.map(|proxy| ConnectUpstream { proxy }),
            timeout,
        }
    }

    pub fn upstream_proxy(&self) -> Option<&TcpAddress> {
        self.upstream.as_ref().map(|upstream| &upstream.proxy)
    }

    pub async fn connect(&self, address: &TcpAddress) -> Result<Rewind<TcpStream>, std::io::Error> {
        let connect = async {
            match &self.upstream {
                Some(upstream) => upstream.connect(address).await,
                None => Ok(Rewind::new(ConnectTcp.connect(address).await?, BytesMut::new())),
            }
        };

        match self.timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, connect)
                    .await
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
            }
            None => connect.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{
            AsyncReadExt,
            AsyncWriteExt,
        },
        net::TcpListener,
    };

    use super::{
        Connect,
        ConnectUpstream,
    };
    use crate::address::TcpAddress;

    #[tokio::test]
    async fn it_tunnels_through_an_upstream_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy: TcpAddress = listener.local_addr().unwrap().into();

        let upstream = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nearly")
                .await
                .unwrap();
            request
        });

        let connect = ConnectUpstream { proxy };
        let mut stream = connect
            .connect(&TcpAddress::new("example.com", 443))
            .await
            .unwrap();

        let mut early = [0; 5];
        stream.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early");

        let request = upstream.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    }
}
