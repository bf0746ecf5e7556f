//! The HTTP/1 layer.
//!
//! Reads requests from the client one after another, runs them through the
//! hooks and forwards them to the server. The server connection is opened
//! lazily and kept as long as both sides allow it, so keep-alive requests to
//! the same destination share one server connection.

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use http::{
    header::{
        CONTENT_LENGTH,
        EXPECT,
        HOST,
        TRANSFER_ENCODING,
    },
    HeaderName,
    HeaderValue,
    Method,
    StatusCode,
    Version,
};
use tokio::io::{
    AsyncRead,
    AsyncWrite,
    AsyncWriteExt,
};
use tracing::Instrument;

use super::{
    assemble::{
        body_bytes,
        encode_chunk,
        is_chunked,
        last_chunk,
        request_head,
        response_head,
    },
    parse::{
        expected_body_size,
        expects_continue,
        should_close,
        BodySize,
    },
    reader::{
        BodyReader,
        Reader,
    },
};
use crate::{
    address::TcpAddress,
    config::{
        ProxyMode,
        Scheme,
    },
    connection::{
        ServerConnection,
        ServerStream,
    },
    flow::{
        BodyStream,
        ChunkTransform,
        Flow,
        FlowState,
        Killed,
        StreamMode,
        Transformed,
    },
    http::{
        exchange::{
            fail,
            fire,
            HttpHook,
        },
        message::{
            header_value,
            Request,
            Response,
            TargetForm,
        },
        websocket,
        Error,
    },
    layer::{
        next_layer,
        tcp,
        Context,
        Layer,
        Scope,
        ServerTls,
    },
    util::io::{
        rewind,
        BoxedIo,
    },
};

const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Whether requests are addressed to a proxy or to the server itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Http1Mode {
    /// The client knows it talks to a proxy: requests are in absolute form,
    /// or `CONNECT`.
    Explicit,
    /// The destination comes from the layers above or the `Host` header.
    Transparent,
}

#[derive(Debug)]
pub struct Http1Layer {
    mode: Http1Mode,
}

impl Http1Layer {
    pub fn explicit() -> Self {
        Self {
            mode: Http1Mode::Explicit,
        }
    }

    pub fn transparent() -> Self {
        Self {
            mode: Http1Mode::Transparent,
        }
    }

    pub fn mode(&self) -> Http1Mode {
        self.mode
    }
}

#[async_trait]
impl Layer for Http1Layer {
    fn name(&self) -> &'static str {
        "http1"
    }

    async fn layer(&self, context: Context, client: BoxedIo) -> Result<(), crate::Error> {
        let span = tracing::debug_span!("http1", mode = ?self.mode);
        Http1Connection::new(context, client, self.mode)
            .run()
            .instrument(span)
            .await
    }
}

struct Server {
    connection: ServerConnection,
    reader: Reader<BoxedIo>,
}

impl Server {
    fn new(stream: ServerStream, context: &Context) -> Self {
        let config = context.config();
        Self {
            connection: stream.connection,
            reader: Reader::new(stream.io, config.read_timeout(), config.header_size_limit),
        }
    }

    fn serves(&self, address: &TcpAddress, tls: bool) -> bool {
        &self.connection.address == address && self.connection.is_tls() == tls
    }

    fn into_io(self) -> BoxedIo {
        let (io, buf) = self.reader.into_parts();
        rewind(io, buf.freeze())
    }
}

/// What to do after an exchange.
enum Next {
    Continue,
    Close,
    /// Tunnel the client connection to `address` after a `CONNECT`.
    Connect(TcpAddress),
    /// The server switched protocols. Only returned from the exchange, which
    /// doesn't own the flow.
    Switch(Server),
    Upgrade { flow: Flow, server: Server },
}

struct Http1Connection {
    context: Context,
    client: Reader<BoxedIo>,
    server: Option<Server>,
    mode: Http1Mode,
}

impl Http1Connection {
    fn new(context: Context, client: BoxedIo, mode: Http1Mode) -> Self {
        let config = context.config();
        let client = Reader::new(client, config.read_timeout(), config.header_size_limit);
        let server = context
            .take_server()
            .map(|stream| Server::new(stream, &context));
        Self {
            context,
            client,
            server,
            mode,
        }
    }

    async fn run(mut self) -> Result<(), crate::Error> {
        loop {
            let request = match self.client.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) | Err(Error::Timeout | Error::Disconnected) => break,
                Err(error @ (Error::Syntax(_) | Error::HeadTooLarge { .. })) => {
                    tracing::debug!(%error, "invalid request");
                    self.send_error(&error).await;
                    break;
                }
                Err(error) => return Err(error.into()),
            };

            match self.handle(request).await? {
                Next::Continue => {}
                Next::Close | Next::Switch(_) => break,
                Next::Connect(address) => return self.tunnel(address).await,
                Next::Upgrade { flow, server } => return self.upgrade(flow, server).await,
            }
        }

        let _ = self.client.get_mut().shutdown().await;
        Ok(())
    }

    async fn handle(&mut self, mut request: Request) -> Result<Next, crate::Error> {
        if request.method == Method::CONNECT && self.mode == Http1Mode::Explicit {
            let address = request.address();
            tracing::debug!(%address, "connect");
            self.client
                .get_mut()
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .map_err(Error::from)?;
            return Ok(Next::Connect(address));
        }

        if let Err(error) = self.resolve_destination(&mut request) {
            self.send_error(&error).await;
            return Ok(Next::Close);
        }

        let hooks = self.context.hooks().clone();
        let mut flow = Flow::new(self.context.client(), request);
        tracing::debug!(flow = %flow.id, method = %flow.request.method, url = %flow.request.url(), "request");

        Ok(match self.exchange(&*hooks, &mut flow).await? {
            Next::Switch(server) => Next::Upgrade { flow, server },
            next => {
                flow.finish();
                next
            }
        })
    }

    /// Fills in where the request goes and with which scheme.
    fn resolve_destination(&self, request: &mut Request) -> Result<(), Error> {
        request.headers.remove(PROXY_CONNECTION);

        match (self.mode, request.target_form) {
            (Http1Mode::Explicit, TargetForm::Absolute) => {}
            (Http1Mode::Explicit, _) => {
                return Err(Error::Syntax(
                    "a proxy request needs an absolute target".to_owned(),
                ));
            }
            (Http1Mode::Transparent, _) => {
                request.scheme = if self.context.server_tls() {
                    Scheme::Https
                }
                else {
                    Scheme::Http
                };

                let address = match self.context.server_address() {
                    Some(address) => address,
                    None => {
                        TcpAddress::from_authority(
                            &request.host_header(),
                            request.scheme.default_port(),
                        )
                        .map_err(|_| Error::Syntax("request has no destination".to_owned()))?
                    }
                };
                request.host = address.host.to_host_string();
                request.port = address.port;

                if matches!(self.context.config().mode, ProxyMode::Reverse { .. }) {
                    request.authority = None;
                    request.headers.remove(HOST);
                    let host = header_value(&request.host_header())?;
                    request.headers.insert(HOST, host);
                }
            }
        }

        if request.host.is_empty() {
            return Err(Error::Syntax("request has no destination".to_owned()));
        }
        Ok(())
    }

    /// Runs one request/response exchange. Killed flows end the connection
    /// without a response.
    async fn exchange(&mut self, hooks: &dyn crate::hooks::Hooks, flow: &mut Flow) -> Result<Next, crate::Error> {
        if fire(hooks, flow, HttpHook::RequestHeaders).await.is_err() {
            return Ok(Next::Close);
        }

        if expects_continue(&flow.request) {
            flow.request.headers.remove(EXPECT);
            self.client
                .get_mut()
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                .await
                .map_err(Error::from)?;
        }

        let request_size = match expected_body_size(&flow.request, None) {
            Ok(size) => size,
            Err(error) => return Ok(self.reject(hooks, flow, error).await),
        };

        let sent = if flow.stream.is_streamed() {
            // the request hook only sees the head of a streamed request
            let server = match self.stream_request(flow, request_size).await {
                Ok(server) => server,
                Err(error) => return Ok(self.reject(hooks, flow, error).await),
            };
            flow.stream = StreamMode::Buffered;
            if fire(hooks, flow, HttpHook::Request).await.is_err() {
                return Ok(Next::Close);
            }
            if flow.response().is_some() {
                // the server's response to the forwarded request is never read
                tracing::debug!(flow = %flow.id, "dropping the server connection");
                drop(server);
                return self.send_synthetic_response(hooks, flow).await;
            }
            flow.transition(FlowState::Accepted);
            Some(server)
        }
        else {
            let limit = self.context.config().body_size_limit;
            let result = match self.client.body(request_size, limit) {
                Ok(body) => body.read_to_end().await,
                Err(error) => Err(error),
            };
            match result {
                Ok((content, trailers)) => {
                    flow.request.content = Some(content);
                    flow.request.trailers = trailers;
                    flow.request.timestamp_end = Some(chrono::Utc::now());
                }
                Err(error) => return Ok(self.reject(hooks, flow, error).await),
            }

            if fire(hooks, flow, HttpHook::Request).await.is_err() {
                return Ok(Next::Close);
            }

            if flow.response().is_some() {
                return self.send_synthetic_response(hooks, flow).await;
            }
            flow.transition(FlowState::Accepted);
            None
        };

        let result = match sent {
            Some(mut server) => {
                match read_response(&mut server.reader).await {
                    Ok(response) => Ok((server, response)),
                    Err(error) => Err(error),
                }
            }
            None => self.send_request(flow).await,
        };
        let (mut server, response) = match result {
            Ok(result) => result,
            Err(error) => {
                tracing::debug!(flow = %flow.id, %error, "request failed");
                return Ok(self.reject(hooks, flow, error).await);
            }
        };

        if flow.set_response(response).is_err() {
            tracing::debug!(flow = %flow.id, "flow has a response already, ignoring the server's");
        }
        flow.transition(FlowState::ResponseReceived);
        if fire(hooks, flow, HttpHook::ResponseHeaders).await.is_err() {
            return Ok(Next::Close);
        }

        let response = flow.response().ok_or(Error::NoResponse)?;
        if response.status == StatusCode::SWITCHING_PROTOCOLS {
            let head = response_head(response);
            self.client
                .get_mut()
                .write_all(&head)
                .await
                .map_err(Error::from)?;
            if fire(hooks, flow, HttpHook::Response).await.is_err() {
                return Ok(Next::Close);
            }
            return Ok(Next::Switch(server));
        }

        let response_size = match expected_body_size(&flow.request, Some(response)) {
            Ok(size) => size,
            Err(error) => return Ok(self.reject(hooks, flow, error).await),
        };

        if flow.stream.is_streamed() {
            if let Err(error) = self.stream_response(flow, &mut server, response_size).await {
                tracing::debug!(flow = %flow.id, %error, "streaming the response failed");
                fail(hooks, flow, &error).await;
                return Ok(Next::Close);
            }
            // the body was forwarded already, so a kill has nothing left to stop
            let _ = fire(hooks, flow, HttpHook::Response).await;
        }
        else {
            let limit = self.context.config().body_size_limit;
            let result = match server.reader.body(response_size, limit) {
                Ok(body) => body.read_to_end().await,
                Err(error) => Err(error),
            };
            let (content, trailers) = match result {
                Ok(body) => body,
                Err(error) => return Ok(self.reject(hooks, flow, error).await),
            };
            if let Some(response) = flow.response_mut() {
                response.content = Some(content);
                response.trailers = trailers;
                response.timestamp_end = Some(chrono::Utc::now());
            }

            if fire(hooks, flow, HttpHook::Response).await.is_err() {
                return Ok(Next::Close);
            }
            let response = flow.response().ok_or(Error::NoResponse)?;
            self.send_response(&flow.request, response, response_size)
                .await?;
        }

        let response = flow.response().ok_or(Error::NoResponse)?;
        let close = should_close(&flow.request, response, response_size);
        self.server = (!close).then_some(server);
        Ok(if close { Next::Close } else { Next::Continue })
    }

    /// Sends a response a hook assigned in the `request` hook. The server is
    /// never contacted.
    async fn send_synthetic_response(
        &mut self,
        hooks: &dyn crate::hooks::Hooks,
        flow: &mut Flow,
    ) -> Result<Next, crate::Error> {
        tracing::debug!(flow = %flow.id, "answering from the request hook");
        if fire(hooks, flow, HttpHook::Response).await.is_err() {
            return Ok(Next::Close);
        }
        let response = flow.response().ok_or(Error::NoResponse)?;
        let size = response
            .content
            .as_ref()
            .map_or(BodySize::Known(0), |content| BodySize::Known(content.len() as u64));
        self.send_response(&flow.request, response, size).await?;
        Ok(if should_close(&flow.request, response, size) {
            Next::Close
        }
        else {
            Next::Continue
        })
    }

    /// Records the error on the flow and tells the client, unless a hook killed
    /// the flow.
    async fn reject(&mut self, hooks: &dyn crate::hooks::Hooks, flow: &mut Flow, error: Error) -> Next {
        fail(hooks, flow, &error).await;
        if !flow.is_killed() {
            self.send_error(&error).await;
        }
        self.server = None;
        Next::Close
    }

    async fn send_error(&mut self, error: &Error) {
        let response = Response::error(error.status_code(), &error.to_string());
        let mut data = response_head(&response).to_vec();
        data.extend_from_slice(response.content.as_deref().unwrap_or_default());
        let client = self.client.get_mut();
        if let Err(error) = client.write_all(&data).await {
            tracing::debug!(%error, "could not send error response");
        }
        let _ = client.flush().await;
    }

    async fn send_response(
        &mut self,
        request: &Request,
        response: &Response,
        size: BodySize,
    ) -> Result<(), Error> {
        let mut data = response_head(response).to_vec();
        let content = response.content.clone().unwrap_or_default();
        if !has_no_body(&request.method, response, size, &content) {
            data.extend_from_slice(&body_bytes(
                &response.headers,
                &content,
                response.trailers.as_ref(),
            ));
        }
        let client = self.client.get_mut();
        client.write_all(&data).await?;
        client.flush().await?;
        Ok(())
    }

    /// Takes the current server connection if it can carry a request to
    /// `address`, or opens a new one.
    async fn server_for(&mut self, address: &TcpAddress, tls: bool) -> Result<Server, Error> {
        match self.server.take() {
            Some(server) if server.serves(address, tls) => return Ok(server),
            Some(server) => {
                tracing::debug!(old = %server.connection.address, new = %address, "changing server");
            }
            None => {}
        }

        let server_tls = tls.then(|| {
            // keep the client's server name while talking to its original
            // destination
            let sni = if self.context.server_address().as_ref() == Some(address) {
                self.context.client_tls().and_then(|tls| tls.sni)
            }
            else {
                None
            };
            ServerTls::new(sni, vec![b"http/1.1".to_vec()])
        });
        let stream = self.context.open_server(address, server_tls).await?;
        Ok(Server::new(stream, &self.context))
    }

    /// Sends a buffered request. Retries once on a fresh connection if the
    /// server went away before sending anything back.
    async fn send_request(&mut self, flow: &mut Flow) -> Result<(Server, Response), Error> {
        let address = flow.request.address();
        let tls = flow.request.scheme == Scheme::Https;
        let head = request_head(&flow.request);
        let body = match &flow.request.content {
            Some(content) => {
                body_bytes(
                    &flow.request.headers,
                    content,
                    flow.request.trailers.as_ref(),
                )
            }
            None => Bytes::new(),
        };

        let mut retried = false;
        loop {
            let (error, received) = match self.server_for(&address, tls).await {
                Ok(mut server) => {
                    flow.server_conn = Some(server.connection.clone());
                    server.reader.reset_received();
                    match send(&mut server, &head, &body).await {
                        Ok(response) => return Ok((server, response)),
                        Err(error) => (error, server.reader.received()),
                    }
                }
                Err(error) => (error, 0),
            };

            if retried || received > 0 || !error.is_retryable() {
                return Err(error);
            }
            tracing::debug!(%address, %error, "retrying on a new connection");
            retried = true;
        }
    }

    /// Sends the request head and streams the body from the client.
    async fn stream_request(&mut self, flow: &mut Flow, size: BodySize) -> Result<Server, Error> {
        let address = flow.request.address();
        let tls = flow.request.scheme == Scheme::Https;
        let mut server = self.server_for(&address, tls).await?;
        flow.server_conn = Some(server.connection.clone());
        flow.transition(FlowState::Accepted);

        let transform = flow.stream.take_transform();
        let has_body = size != BodySize::Known(0);
        if transform.is_some() && has_body {
            flow.request.headers.remove(CONTENT_LENGTH);
            flow.request
                .headers
                .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            flow.request.version = Version::HTTP_11;
        }

        let writer = server.reader.get_mut();
        writer.write_all(&request_head(&flow.request)).await?;
        if has_body {
            let chunked = is_chunked(&flow.request.headers);
            let body = self.client.body(size, None)?;
            flow.request.trailers = pipe(body, transform, chunked, writer, flow.killed()).await?;
        }
        writer.flush().await?;
        flow.request.timestamp_end = Some(chrono::Utc::now());
        Ok(server)
    }

    /// Sends the response head and streams the body from the server.
    async fn stream_response(
        &mut self,
        flow: &mut Flow,
        server: &mut Server,
        size: BodySize,
    ) -> Result<(), Error> {
        let transform = flow.stream.take_transform();
        flow.stream = StreamMode::Buffered;
        let method = flow.request.method.clone();
        let version = flow.request.version;
        let killed = flow.killed();
        let response = flow.response_mut().ok_or(Error::NoResponse)?;

        let has_body = !has_no_body(&method, response, size, &Bytes::new());
        if transform.is_some() && has_body {
            response.headers.remove(CONTENT_LENGTH);
            if version >= Version::HTTP_11 {
                response
                    .headers
                    .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
            else {
                response.headers.remove(TRANSFER_ENCODING);
                response
                    .headers
                    .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
            }
        }

        let client = self.client.get_mut();
        client.write_all(&response_head(response)).await?;
        if has_body {
            let chunked = is_chunked(&response.headers);
            let body = server.reader.body(size, None)?;
            response.trailers = pipe(body, transform, chunked, client, killed).await?;
        }
        client.flush().await?;
        response.content = None;
        response.timestamp_end = Some(chrono::Utc::now());
        Ok(())
    }

    /// Hands the client connection to the layer below after a `CONNECT`.
    async fn tunnel(self, address: TcpAddress) -> Result<(), crate::Error> {
        let (io, buf) = self.client.into_parts();
        let client = rewind(io, buf.freeze());
        let context = self.context.child(
            "connect",
            Scope {
                server_address: Some(address.clone()),
                ..Default::default()
            },
        );

        if context.proxy().filters().ignores(Some(&address), None) {
            tracing::debug!(%address, "ignored host, relaying");
            return tcp::Passthrough.layer(context, client).await;
        }

        let (layer, client) = next_layer(&context, client).await;
        layer.layer(context, client).await
    }

    /// Relays the connection after `101 Switching Protocols`.
    async fn upgrade(self, mut flow: Flow, server: Server) -> Result<(), crate::Error> {
        let (io, buf) = self.client.into_parts();
        let client = rewind(io, buf.freeze());
        let server = server.into_io();

        if flow.request.is_websocket_upgrade() {
            let result = websocket::relay(&self.context, &mut flow, client, server).await;
            flow.finish();
            result?;
        }
        else {
            tracing::debug!(flow = %flow.id, "switching to a raw relay");
            flow.finish();
            tcp::relay(client, server).await.map_err(Error::from)?;
        }
        Ok(())
    }
}

/// Sends a request and reads the response head.
async fn send(server: &mut Server, head: &[u8], body: &[u8]) -> Result<Response, Error> {
    let writer = server.reader.get_mut();
    writer.write_all(head).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    read_response(&mut server.reader).await
}

/// Reads a response head, skipping informational responses other than
/// `101`.
pub(crate) async fn read_response<T: AsyncRead + Unpin>(reader: &mut Reader<T>) -> Result<Response, Error> {
    loop {
        let response = reader.read_response().await?;
        if response.status.is_informational() && response.status != StatusCode::SWITCHING_PROTOCOLS {
            tracing::trace!(status = %response.status, "skipping informational response");
            continue;
        }
        return Ok(response);
    }
}

fn has_no_body(method: &Method, response: &Response, size: BodySize, content: &Bytes) -> bool {
    content.is_empty()
        && (size == BodySize::Known(0)
            || method == Method::HEAD
            || response.status == StatusCode::NO_CONTENT
            || response.status == StatusCode::NOT_MODIFIED)
}

/// Forwards a body chunk by chunk, re-framing it for the other side. Gives up
/// with [`Killed`] once `killed` resolves.
async fn pipe<T, W>(
    body: BodyReader<'_, T>,
    transform: Option<Box<dyn ChunkTransform>>,
    chunked: bool,
    writer: &mut W,
    killed: impl Future<Output = ()>,
) -> Result<Option<http::HeaderMap>, Error>
where
    T: AsyncRead + Send + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stream = Transformed::new(body, transform);
    let forward = async {
        while let Some(chunk) = stream.next_chunk().await? {
            if chunked {
                writer.write_all(&encode_chunk(&chunk)).await?;
            }
            else {
                writer.write_all(&chunk).await?;
            }
        }
        Ok::<_, Error>(())
    };
    tokio::select! {
        result = forward => result?,
        _ = killed => return Err(Killed.into()),
    }
    let trailers = stream.into_inner().take_trailers();
    if chunked {
        writer.write_all(&last_chunk(trailers.as_ref())).await?;
    }
    Ok(trailers)
}
