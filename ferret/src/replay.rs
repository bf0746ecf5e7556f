//! Replaying finished flows.
//!
//! A replay sends a copy of a flow's request to the server again, on a fresh
//! connection that no client is attached to. The copy goes through the same
//! hooks as live traffic, so addons see replays like any other flow.

use bytes::BytesMut;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use crate::{
    config::Scheme,
    flow::{
        Flow,
        FlowId,
        FlowState,
    },
    hooks::Hooks,
    http::{
        self,
        exchange::{
            fail,
            fire,
            HttpHook,
        },
        http1::{
            assemble::{
                body_bytes,
                request_head,
            },
            layer::read_response,
            parse::expected_body_size,
            reader::Reader,
        },
    },
    layer::ServerTls,
    proxy::Proxy,
};

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The flow is still attached to a connection.
    #[error("flow {0} is still live")]
    FlowLive(FlowId),

    #[error("replayed flow was killed")]
    Killed,

    #[error("replay failed")]
    Http(#[from] http::Error),
}

impl Proxy {
    /// Sends the request of a finished flow again and returns the new flow.
    ///
    /// The original flow is marked as replayed. Flows that are still live
    /// are refused with [`ReplayError::FlowLive`].
    pub async fn replay(&self, flow: &mut Flow) -> Result<Flow, ReplayError> {
        if flow.is_live() {
            return Err(ReplayError::FlowLive(flow.id));
        }

        let mut replay = flow.new_replay();
        flow.mark_replayed();

        let span = tracing::info_span!("replay", flow = %replay.id, original = %flow.id);
        let hooks = self.hooks().clone();
        let result = self.run_replay(&*hooks, &mut replay).instrument(span).await;
        replay.finish();

        match result {
            Ok(()) if replay.is_killed() => Err(ReplayError::Killed),
            Ok(()) => Ok(replay),
            Err(error) => Err(error),
        }
    }

    async fn run_replay(&self, hooks: &dyn Hooks, flow: &mut Flow) -> Result<(), ReplayError> {
        if fire(hooks, flow, HttpHook::RequestHeaders).await.is_err()
            || fire(hooks, flow, HttpHook::Request).await.is_err()
        {
            return Err(ReplayError::Killed);
        }

        if flow.response().is_some() {
            tracing::debug!("answered from the request hook");
            flow.transition(FlowState::Accepted);
            flow.transition(FlowState::ResponseReceived);
            if fire(hooks, flow, HttpHook::Response).await.is_err() {
                return Err(ReplayError::Killed);
            }
            return Ok(());
        }

        match self.send_replay(hooks, flow).await {
            Ok(()) => Ok(()),
            Err(ReplayError::Http(error)) => {
                tracing::debug!(%error, "replay failed");
                fail(hooks, flow, &error).await;
                Err(error.into())
            }
            Err(error) => Err(error),
        }
    }

    async fn send_replay(&self, hooks: &dyn Hooks, flow: &mut Flow) -> Result<(), ReplayError> {
        let address = flow.request.address();
        let tls = (flow.request.scheme == Scheme::Https)
            .then(|| ServerTls::new(None, vec![b"http/1.1".to_vec()]));
        let server = self.open_server(&address, tls).await?;
        flow.server_conn = Some(server.connection);
        flow.transition(FlowState::Accepted);
        tracing::debug!(url = %flow.request.url(), "replaying request");

        let config = self.config();
        let mut reader = Reader::new(server.io, config.read_timeout(), config.header_size_limit);

        let content = flow.request.content.clone().unwrap_or_default();
        let mut data = BytesMut::from(&request_head(&flow.request)[..]);
        data.extend_from_slice(&body_bytes(
            &flow.request.headers,
            &content,
            flow.request.trailers.as_ref(),
        ));
        let writer = reader.get_mut();
        writer
            .write_all(&data)
            .await
            .map_err(http::Error::from)?;
        writer.flush().await.map_err(http::Error::from)?;

        let response = read_response(&mut reader).await?;
        let size = expected_body_size(&flow.request, Some(&response))?;
        let _ = flow.set_response(response);
        flow.transition(FlowState::ResponseReceived);
        if fire(hooks, flow, HttpHook::ResponseHeaders).await.is_err() {
            return Err(ReplayError::Killed);
        }

        let (content, trailers) = reader
            .body(size, config.body_size_limit)?
            .read_to_end()
            .await?;
        // nothing to stream to, so a transform sees the body as one chunk
        let content = match flow.stream.take_transform() {
            Some(mut transform) => {
                let mut content = BytesMut::from(&transform.transform(content)[..]);
                if let Some(rest) = transform.finish() {
                    content.extend_from_slice(&rest);
                }
                content.freeze()
            }
            None => content,
        };
        if let Some(response) = flow.response_mut() {
            response.content = Some(content);
            response.trailers = trailers;
            response.timestamp_end = Some(Utc::now());
        }

        if fire(hooks, flow, HttpHook::Response).await.is_err() {
            return Err(ReplayError::Killed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use tokio::{
        io::{
            AsyncReadExt,
            AsyncWriteExt,
        },
        net::TcpListener,
    };

    use super::ReplayError;
    use crate::{
        config::ProxyConfig,
        connection::ClientConnection,
        flow::{
            Flow,
            FlowState,
        },
        hooks::{
            Hooks,
            NoHooks,
        },
        http::message::Request,
        proxy::Proxy,
        tls::ca::Ca,
    };

    /// Answers every request with its request line.
    async fn origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut head = vec![];
                    let mut buf = [0; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = socket.read(&mut buf).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        head.extend_from_slice(&buf[..n]);
                    }
                    let head = String::from_utf8(head).unwrap();
                    let line = head.lines().next().unwrap().to_owned();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{line}",
                        line.len()
                    );
                    socket.write_all(response.as_bytes()).await.unwrap();
                });
            }
        });
        address
    }

    async fn proxy(hooks: impl Hooks) -> Proxy {
        Proxy::new(ProxyConfig::default(), hooks, Ca::generate().await.unwrap())
            .await
            .unwrap()
    }

    fn finished_flow(address: SocketAddr) -> Flow {
        let request = Request::get(&format!("http://{address}/original")).unwrap();
        let mut flow = Flow::new(ClientConnection::detached(), request);
        flow.transition(FlowState::Accepted);
        flow.finish();
        flow
    }

    #[tokio::test]
    async fn it_refuses_to_replay_live_flows() {
        let proxy = proxy(NoHooks).await;
        let mut flow = Flow::new(
            ClientConnection::detached(),
            Request::get("http://example.com/").unwrap(),
        );

        let result = proxy.replay(&mut flow).await;
        assert!(matches!(result, Err(ReplayError::FlowLive(id)) if id == flow.id));
        assert_eq!(flow.state(), FlowState::Started);
    }

    #[tokio::test]
    async fn it_replays_finished_flows() {
        let address = origin().await;
        let proxy = proxy(NoHooks).await;
        let mut flow = finished_flow(address);

        let replay = proxy.replay(&mut flow).await.unwrap();

        assert_eq!(flow.state(), FlowState::Replayed);
        assert!(replay.is_replay());
        assert!(!replay.is_live());
        assert_ne!(replay.id, flow.id);
        assert_eq!(replay.state(), FlowState::Completed);
        let response = replay.response().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            response.content.as_deref(),
            Some(&b"GET /original HTTP/1.1"[..])
        );
    }

    struct Rewrite;

    #[async_trait]
    impl Hooks for Rewrite {
        async fn request(&self, flow: &mut Flow) {
            flow.request.path = "/changed".to_owned();
        }
    }

    #[tokio::test]
    async fn it_runs_replays_through_the_hooks() {
        let address = origin().await;
        let proxy = proxy(Rewrite).await;
        let mut flow = finished_flow(address);

        let replay = proxy.replay(&mut flow).await.unwrap();

        assert_eq!(flow.request.path, "/original");
        assert_eq!(
            replay.response().unwrap().content.as_deref(),
            Some(&b"GET /changed HTTP/1.1"[..])
        );
    }

    struct Killer;

    #[async_trait]
    impl Hooks for Killer {
        async fn request(&self, flow: &mut Flow) {
            flow.kill();
        }
    }

    #[tokio::test]
    async fn it_reports_killed_replays() {
        let proxy = proxy(Killer).await;
        // nothing listens here, a connection attempt would fail differently
        let mut flow = finished_flow("127.0.0.1:9".parse().unwrap());

        let result = proxy.replay(&mut flow).await;
        assert!(matches!(result, Err(ReplayError::Killed)));
    }
}
