use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

use async_trait::async_trait;
use bytes::{
    Bytes,
    BytesMut,
};
use chrono::Utc;
use ferret_util::error::ResultExt;
use http::{
    header::{
        CONNECTION,
        CONTENT_LENGTH,
        HOST,
        TE,
        TRANSFER_ENCODING,
        UPGRADE,
    },
    HeaderMap,
    HeaderName,
    HeaderValue,
    Method,
    StatusCode,
    Version,
};
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
        ReadHalf,
        WriteHalf,
    },
    sync::{
        mpsc,
        Mutex,
        Notify,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    connection::{
        Connection,
        Role,
        Settings,
    },
    events::{
        Event,
        HeaderList,
    },
    frame::{
        setting,
        ErrorCode,
        Priority,
    },
    stream::{
        StreamEvent,
        StreamHandle,
        StreamTable,
    },
    Error,
};
use crate::{
    address::TcpAddress,
    config::Scheme,
    connection::{
        ServerConnection,
        ServerStream,
    },
    flow::{
        ChunkTransform,
        Flow,
        FlowState,
        StreamMode,
    },
    hooks::Hooks,
    http::{
        exchange::{
            fail,
            fire,
            HttpHook,
        },
        message::{
            Request,
            Response,
            TargetForm,
        },
    },
    layer::{
        Context,
        Layer,
        ServerTls,
    },
    util::io::BoxedIo,
};

const ALPN_HTTP2: &[u8] = b"h2";
const READ_BUFFER_SIZE: usize = 16 * 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Intercepts an HTTP/2 connection.
#[derive(Debug, Default)]
pub struct Http2Layer;

impl Http2Layer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Layer for Http2Layer {
    fn name(&self) -> &'static str {
        "http2"
    }

    async fn layer(&self, context: Context, client: BoxedIo) -> Result<(), crate::Error> {
        let span = tracing::debug_span!("http2");
        Ok(run(context, client).instrument(span).await?)
    }
}

async fn run(context: Context, client: BoxedIo) -> Result<(), crate::http::Error> {
    let server = match open_server(&context).await {
        Ok(server) => server,
        Err(error) => {
            tracing::debug!(%error, "could not open an http/2 server connection");
            refuse(client).await;
            return Err(error);
        }
    };

    let (client_reader, client_writer) = tokio::io::split(client);
    let (server_reader, server_writer) = tokio::io::split(server.io);

    let mut client_connection = Connection::new(Role::Server, Settings::default());
    client_connection.initiate();
    let mut server_connection = Connection::new(Role::Client, Settings::default());
    server_connection.initiate();

    let multiplexer = Arc::new(Multiplexer {
        context,
        client: Side::new("client", client_connection, client_writer),
        server: Side::new("server", server_connection, server_writer),
        streams: StreamTable::default(),
        server_info: server.connection,
        draining: AtomicBool::new(false),
    });

    let result = async {
        multiplexer.client.flush().await?;
        multiplexer.server.flush().await?;
        multiplexer.clone().run(client_reader, server_reader).await
    }
    .await;

    multiplexer.streams.zombify(Instant::now());
    multiplexer.client.closed.cancel();
    multiplexer.server.closed.cancel();
    Ok(result?)
}

/// Takes the server connection a layer above opened, or opens one.
async fn open_server(context: &Context) -> Result<ServerStream, crate::http::Error> {
    if let Some(server) = context.take_server() {
        return Ok(server);
    }

    let address = context
        .server_address()
        .ok_or(crate::http::Error::Unsupported("http/2 connection without destination"))?;
    let tls = context.server_tls().then(|| {
        ServerTls::new(
            context.client_tls().and_then(|tls| tls.sni),
            vec![ALPN_HTTP2.to_vec()],
        )
    });
    let server = context.open_server(&address, tls).await?;

    let alpn = server
        .connection
        .tls
        .as_ref()
        .and_then(|tls| tls.alpn.as_deref());
    if alpn.map_or(false, |alpn| alpn != ALPN_HTTP2) {
        return Err(crate::http::Error::Unsupported("server doesn't speak http/2"));
    }
    Ok(server)
}

/// Sends GOAWAY to a client we can't serve.
async fn refuse(mut client: BoxedIo) {
    let mut connection = Connection::new(Role::Server, Settings::default());
    connection.initiate();
    connection.close(ErrorCode::INTERNAL_ERROR);
    let _ = client.write_all(&connection.data_to_send()).await;
    let _ = client.shutdown().await;
}

/// One connection's state machine and write half.
struct Side {
    name: &'static str,
    state: Mutex<SideState>,
    /// Notified when send windows may have grown.
    window: Notify,
    closed: CancellationToken,
}

struct SideState {
    connection: Connection,
    writer: WriteHalf<BoxedIo>,
}

enum Progress {
    Done,
    Sent,
    Blocked,
}

impl Side {
    fn new(name: &'static str, connection: Connection, writer: WriteHalf<BoxedIo>) -> Self {
        Self {
            name,
            state: Mutex::new(SideState { connection, writer }),
            window: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Runs `f` on the state machine and writes out whatever it queued, both
    /// under the lock. Frames hit the wire in the order the lock was taken.
    async fn with<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R, Error>) -> Result<R, Error> {
        let mut state = self.state.lock().await;
        let result = f(&mut state.connection);

        let data = state.connection.data_to_send();
        if !data.is_empty() {
            let written = async {
                state.writer.write_all(&data).await?;
                state.writer.flush().await
            }
            .await;
            if let Err(error) = written {
                tracing::debug!(side = self.name, %error, "write failed");
                self.closed.cancel();
                return Err(error.into());
            }
        }

        result
    }

    /// Like [`Side::with`], but fails fast once the connection is gone.
    async fn with_stream<R>(
        &self,
        stream_id: u32,
        f: impl FnOnce(&mut Connection) -> Result<R, Error>,
    ) -> Result<R, Error> {
        if self.closed.is_cancelled() {
            return Err(Error::ZombieStream { stream_id });
        }
        self.with(f).await
    }

    async fn flush(&self) -> Result<(), Error> {
        self.with(|_| Ok(())).await
    }

    async fn reset(&self, stream_id: u32, error_code: ErrorCode) -> Result<(), Error> {
        self.with(|connection| {
            connection.reset_stream(stream_id, error_code);
            Ok(())
        })
        .await
    }

    /// Sends a body as DATA frames, waiting for window updates when the flow
    /// control window is used up. The wait ends early once `killed` resolves.
    async fn send_body(
        &self,
        stream_id: u32,
        mut data: Bytes,
        end_stream: bool,
        killed: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        if data.is_empty() && !end_stream {
            return Ok(());
        }
        tokio::pin!(killed);

        loop {
            let window_changed = self.window.notified();
            tokio::pin!(window_changed);
            window_changed.as_mut().enable();

            let progress = self
                .with_stream(stream_id, |connection| {
                    let window = connection.local_flow_control_window(stream_id)?;
                    let length = data
                        .len()
                        .min(connection.max_outbound_frame_size())
                        .min(window.max(0) as usize);
                    if length == 0 && !data.is_empty() {
                        return Ok(Progress::Blocked);
                    }
                    let chunk = data.split_to(length);
                    let last = data.is_empty();
                    connection.send_data(stream_id, chunk, last && end_stream)?;
                    Ok(if last { Progress::Done } else { Progress::Sent })
                })
                .await?;

            match progress {
                Progress::Done => return Ok(()),
                Progress::Sent => {}
                Progress::Blocked => {
                    tokio::select! {
                        _ = &mut window_changed => {}
                        _ = self.closed.cancelled() => return Err(Error::ZombieStream { stream_id }),
                        _ = &mut killed => {
                            return Err(Error::StreamReset {
                                stream_id,
                                error_code: ErrorCode::CANCEL,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Sends the rest of a message after its headers.
    async fn send_tail(
        &self,
        stream_id: u32,
        body: Bytes,
        trailers: Option<HeaderList>,
        killed: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        self.send_body(stream_id, body, trailers.is_none(), killed)
            .await?;
        if let Some(trailers) = trailers {
            self.with_stream(stream_id, |connection| {
                connection.send_headers(stream_id, &trailers, true, None)
            })
            .await?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Continue,
    Stop,
}

/// State shared between the connection loop and the stream workers.
struct Multiplexer {
    context: Context,
    client: Side,
    server: Side,
    streams: StreamTable,
    server_info: ServerConnection,
    /// The server sent a graceful GOAWAY. No new streams are accepted.
    draining: AtomicBool,
}

impl Multiplexer {
    async fn run(
        self: Arc<Self>,
        mut client_reader: ReadHalf<BoxedIo>,
        mut server_reader: ReadHalf<BoxedIo>,
    ) -> Result<(), Error> {
        let mut client_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut server_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let shutdown = self.context.shutdown().clone();

        loop {
            client_buf.reserve(READ_BUFFER_SIZE);
            server_buf.reserve(READ_BUFFER_SIZE);

            let control = tokio::select! {
                result = client_reader.read_buf(&mut client_buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("client closed the connection");
                            Control::Stop
                        }
                        Ok(_) => {
                            let data = client_buf.split();
                            self.receive_from_client(&data).await?
                        }
                        Err(error) => {
                            tracing::debug!(%error, "client read failed");
                            Control::Stop
                        }
                    }
                }
                result = server_reader.read_buf(&mut server_buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("server closed the connection");
                            self.server_gone(ErrorCode::NO_ERROR).await;
                            Control::Stop
                        }
                        Ok(_) => {
                            let data = server_buf.split();
                            self.receive_from_server(&data).await?
                        }
                        Err(error) => {
                            tracing::debug!(%error, "server read failed");
                            self.server_gone(ErrorCode::INTERNAL_ERROR).await;
                            Control::Stop
                        }
                    }
                }
                _ = sweep.tick() => {
                    let swept = self.streams.sweep(Instant::now());
                    if swept > 0 {
                        tracing::debug!(swept, "removed zombie streams");
                    }
                    Control::Continue
                }
                _ = shutdown.cancelled() => {
                    let _ = self.client.with(|connection| {
                        connection.close(ErrorCode::NO_ERROR);
                        Ok(())
                    }).await;
                    Control::Stop
                }
            };

            if control == Control::Stop {
                break;
            }

            if self.draining.load(Ordering::Relaxed) && self.streams.is_empty() {
                tracing::debug!("all streams drained");
                let _ = self
                    .client
                    .with(|connection| {
                        connection.close(ErrorCode::NO_ERROR);
                        Ok(())
                    })
                    .await;
                break;
            }
        }

        Ok(())
    }

    async fn receive_from_client(self: &Arc<Self>, data: &[u8]) -> Result<Control, Error> {
        let events = match self.client.with(|connection| connection.receive(data)).await {
            Ok(events) => events,
            Err(error) => {
                tracing::debug!(%error, "client connection error");
                let error_code = error.error_code();
                let _ = self
                    .client
                    .with(|connection| {
                        connection.close(error_code);
                        Ok(())
                    })
                    .await;
                let _ = self
                    .server
                    .with(|connection| {
                        connection.close(ErrorCode::CANCEL);
                        Ok(())
                    })
                    .await;
                return Ok(Control::Stop);
            }
        };

        for event in events {
            if self.client_event(event).await? == Control::Stop {
                return Ok(Control::Stop);
            }
        }
        Ok(Control::Continue)
    }

    async fn receive_from_server(self: &Arc<Self>, data: &[u8]) -> Result<Control, Error> {
        let events = match self.server.with(|connection| connection.receive(data)).await {
            Ok(events) => events,
            Err(error) => {
                tracing::debug!(%error, "server connection error");
                let error_code = error.error_code();
                let _ = self
                    .server
                    .with(|connection| {
                        connection.close(error_code);
                        Ok(())
                    })
                    .await;
                self.server_gone(ErrorCode::INTERNAL_ERROR).await;
                return Ok(Control::Stop);
            }
        };

        for event in events {
            if self.server_event(event).await? == Control::Stop {
                return Ok(Control::Stop);
            }
        }
        Ok(Control::Continue)
    }

    async fn client_event(self: &Arc<Self>, event: Event) -> Result<Control, Error> {
        match event {
            Event::RequestReceived {
                stream_id,
                headers,
                priority,
            } => {
                if self.draining.load(Ordering::Relaxed) {
                    self.client.reset(stream_id, ErrorCode::REFUSED_STREAM).await?;
                    return Ok(Control::Continue);
                }
                let handle = self.streams.insert(stream_id, None, priority);
                self.spawn_worker(handle, headers, false);
            }
            Event::DataReceived {
                stream_id,
                data,
                flow_controlled_length,
            } => {
                // stream window comes back when the worker takes the data
                self.client
                    .with(|connection| {
                        connection.release_connection_window(flow_controlled_length);
                        Ok(())
                    })
                    .await?;
                self.streams.dispatch(
                    stream_id,
                    StreamEvent::Data {
                        from_client: true,
                        data,
                        flow_controlled_length,
                    },
                );
            }
            Event::TrailersReceived { stream_id, headers } => {
                self.streams.dispatch(
                    stream_id,
                    StreamEvent::Headers {
                        from_client: true,
                        headers,
                    },
                );
            }
            Event::StreamEnded { stream_id } => {
                self.streams
                    .dispatch(stream_id, StreamEvent::Ended { from_client: true });
            }
            Event::StreamReset {
                stream_id,
                error_code,
            } => {
                tracing::debug!(stream_id, %error_code, "client reset stream");
                self.streams.dispatch(
                    stream_id,
                    StreamEvent::Reset {
                        from_client: true,
                        error_code,
                    },
                );
                if error_code == ErrorCode::CANCEL {
                    if let Some(server_id) = self.streams.server_id(stream_id) {
                        self.server.reset(server_id, ErrorCode::CANCEL).await?;
                    }
                }
                self.client.window.notify_waiters();
            }
            Event::WindowUpdated { .. } => self.client.window.notify_waiters(),
            Event::RemoteSettingsChanged { changed } => {
                self.client.window.notify_waiters();
                let mirrored = mirrored_settings(changed);
                if !mirrored.is_empty() {
                    self.server
                        .with(|connection| connection.update_settings(mirrored))
                        .await?;
                }
            }
            Event::PriorityUpdated {
                stream_id,
                priority,
            } => {
                self.streams.set_priority(stream_id, priority);
                if self.context.config().http2_priority {
                    if let Some(server_id) = self.streams.server_id(stream_id) {
                        let priority = self.translate_priority(server_id, priority);
                        self.server
                            .with(|connection| {
                                connection.send_priority(server_id, priority);
                                Ok(())
                            })
                            .await?;
                    }
                }
            }
            Event::ConnectionTerminated { error_code, .. } => {
                tracing::debug!(%error_code, "client terminated the connection");
                let _ = self
                    .server
                    .with(|connection| {
                        connection.close(error_code);
                        Ok(())
                    })
                    .await;
                return Ok(Control::Stop);
            }
            Event::ResponseReceived { .. }
            | Event::PushedStreamReceived { .. }
            | Event::SettingsAcknowledged => {}
        }

        Ok(Control::Continue)
    }

    async fn server_event(self: &Arc<Self>, event: Event) -> Result<Control, Error> {
        match event {
            Event::ResponseReceived { stream_id, headers } => {
                self.route(
                    stream_id,
                    StreamEvent::Headers {
                        from_client: false,
                        headers,
                    },
                );
            }
            Event::DataReceived {
                stream_id,
                data,
                flow_controlled_length,
            } => {
                self.server
                    .with(|connection| {
                        connection.release_connection_window(flow_controlled_length);
                        Ok(())
                    })
                    .await?;
                self.route(
                    stream_id,
                    StreamEvent::Data {
                        from_client: false,
                        data,
                        flow_controlled_length,
                    },
                );
            }
            Event::TrailersReceived { stream_id, headers } => {
                self.route(
                    stream_id,
                    StreamEvent::Headers {
                        from_client: false,
                        headers,
                    },
                );
            }
            Event::StreamEnded { stream_id } => {
                self.route(stream_id, StreamEvent::Ended { from_client: false });
            }
            Event::StreamReset {
                stream_id,
                error_code,
            } => {
                tracing::debug!(stream_id, %error_code, "server reset stream");
                if let Some(client_id) = self.streams.client_id(stream_id) {
                    self.streams.dispatch(
                        client_id,
                        StreamEvent::Reset {
                            from_client: false,
                            error_code,
                        },
                    );
                    if error_code == ErrorCode::CANCEL {
                        self.client.reset(client_id, ErrorCode::CANCEL).await?;
                    }
                }
                self.server.window.notify_waiters();
            }
            Event::PushedStreamReceived {
                pushed_stream_id,
                parent_stream_id,
                headers,
            } => {
                self.push(pushed_stream_id, parent_stream_id, headers)
                    .await?;
            }
            Event::WindowUpdated { .. } => self.server.window.notify_waiters(),
            Event::RemoteSettingsChanged { changed } => {
                self.server.window.notify_waiters();
                let mirrored = mirrored_settings(changed)
                    .into_iter()
                    .filter(|(id, _)| *id != setting::ENABLE_PUSH)
                    .collect::<Vec<_>>();
                if !mirrored.is_empty() {
                    self.client
                        .with(|connection| connection.update_settings(mirrored))
                        .await?;
                }
            }
            Event::ConnectionTerminated { error_code, .. } => {
                if error_code == ErrorCode::NO_ERROR {
                    // let in-flight streams finish before telling the client
                    tracing::debug!("server is going away");
                    self.draining.store(true, Ordering::Relaxed);
                }
                else {
                    tracing::debug!(%error_code, "server terminated the connection");
                    self.server_gone(error_code).await;
                    return Ok(Control::Stop);
                }
            }
            Event::RequestReceived { .. }
            | Event::PriorityUpdated { .. }
            | Event::SettingsAcknowledged => {}
        }

        Ok(Control::Continue)
    }

    /// Delivers a server stream's event to the worker of the client stream
    /// it's mapped to.
    fn route(&self, server_id: u32, event: StreamEvent) {
        match self.streams.client_id(server_id) {
            Some(client_id) => {
                self.streams.dispatch(client_id, event);
            }
            None => tracing::trace!(server_id, "event for unknown stream"),
        }
    }

    /// The server connection is gone. All streams become zombies and the
    /// client is told to go away.
    async fn server_gone(&self, error_code: ErrorCode) {
        self.server.closed.cancel();
        self.streams.zombify(Instant::now());
        let _ = self
            .client
            .with(|connection| {
                connection.close(error_code);
                Ok(())
            })
            .await;
    }

    /// Forwards a server push to the client, if the client accepts pushes.
    async fn push(
        self: &Arc<Self>,
        pushed_stream_id: u32,
        parent_stream_id: u32,
        headers: HeaderList,
    ) -> Result<(), Error> {
        let parent = self.streams.client_id(parent_stream_id);
        let enabled = self
            .client
            .with(|connection| Ok(connection.remote_settings().enable_push))
            .await?;

        let promised = match parent {
            Some(parent) if enabled => {
                self.client
                    .with(|connection| {
                        let promised = connection.next_stream_id();
                        connection.push_stream(parent, promised, &headers)?;
                        Ok(promised)
                    })
                    .await
            }
            _ => Err(Error::Protocol("client doesn't accept this push")),
        };

        match promised {
            Ok(promised) => {
                tracing::debug!(pushed_stream_id, promised, "forwarding push");
                let handle = self
                    .streams
                    .insert(promised, Some(pushed_stream_id), None);
                self.spawn_worker(handle, headers, true);
            }
            Err(error) => {
                tracing::debug!(pushed_stream_id, %error, "refusing push");
                self.server
                    .reset(pushed_stream_id, ErrorCode::REFUSED_STREAM)
                    .await?;
            }
        }
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, handle: StreamHandle, headers: HeaderList, pushed: bool) {
        let span = tracing::debug_span!("stream", id = handle.client_id);
        let worker = StreamWorker {
            multiplexer: self.clone(),
            client_id: handle.client_id,
            events: handle.events,
            cancel: handle.cancel,
            deferred: VecDeque::new(),
            response_started: false,
        };
        tokio::spawn(worker.run(headers, pushed).instrument(span));
    }

    /// Maps a client priority onto the server's stream IDs.
    fn translate_priority(&self, server_id: u32, priority: Priority) -> Priority {
        let depends_on = match priority.depends_on {
            0 => 0,
            client_id => self.streams.server_id(client_id).unwrap_or(0),
        };
        // a stream can't depend on itself
        let depends_on = if depends_on == server_id {
            server_id + 2
        }
        else {
            depends_on
        };
        Priority {
            depends_on,
            ..priority
        }
    }
}

/// Settings one side announced that the proxy announces to the other side.
/// The header table size is left alone, since it describes our decoder.
fn mirrored_settings(changed: Vec<(u16, u32)>) -> Vec<(u16, u32)> {
    changed
        .into_iter()
        .filter(|(id, _)| *id != setting::HEADER_TABLE_SIZE)
        .collect()
}

/// How reading a message body ended.
enum BodyEnd {
    Complete {
        content: Bytes,
        trailers: Option<HeaderMap>,
    },
    TooLarge {
        limit: usize,
    },
    Reset {
        from_client: bool,
        error_code: ErrorCode,
    },
}

/// How forwarding a streamed body ended. Streamed bodies have no size limit.
enum PipeEnd {
    Complete {
        trailers: Option<HeaderMap>,
    },
    Reset {
        from_client: bool,
        error_code: ErrorCode,
    },
}

/// Runs one stream through the hooks and forwards it.
struct StreamWorker {
    multiplexer: Arc<Multiplexer>,
    client_id: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
    /// Events for the other direction that arrived early.
    deferred: VecDeque<StreamEvent>,
    /// Final response headers went out to the client. From then on the
    /// client can only be told about failures with a reset.
    response_started: bool,
}

impl StreamWorker {
    async fn run(mut self, headers: HeaderList, pushed: bool) {
        let context = self.multiplexer.context.clone();
        let hooks = context.hooks().clone();

        match request_from_headers(&headers, &context) {
            Ok(request) => {
                let mut flow = Flow::new(context.client(), request);
                flow.server_conn = Some(self.multiplexer.server_info.clone());
                tracing::debug!(
                    flow = %flow.id,
                    method = %flow.request.method,
                    url = %flow.request.url(),
                    pushed,
                    "request"
                );

                if let Err(error) = self.exchange(&*hooks, &mut flow, pushed).await.log_debug() {
                    if flow.is_killed() {
                        let _ = self.reset(ErrorCode::CANCEL).await;
                    }
                    else if !matches!(error, Error::ZombieStream { .. }) {
                        let error_code = error.error_code();
                        fail(&*hooks, &mut flow, &error.into()).await;
                        let _ = self.reset(error_code).await;
                    }
                    else {
                        fail(&*hooks, &mut flow, &error.into()).await;
                    }
                }
                flow.finish();
            }
            Err(error) => {
                tracing::debug!(%error, "invalid request");
                let _ = self
                    .multiplexer
                    .client
                    .reset(self.client_id, ErrorCode::PROTOCOL_ERROR)
                    .await;
            }
        }

        self.multiplexer.streams.remove(self.client_id);
    }

    async fn exchange(&mut self, hooks: &dyn Hooks, flow: &mut Flow, pushed: bool) -> Result<(), Error> {
        if fire(hooks, flow, HttpHook::RequestHeaders).await.is_err() {
            return self.kill().await;
        }

        if pushed {
            // the promise carries the whole request
            flow.request.content = Some(Bytes::new());
            flow.request.timestamp_end = Some(Utc::now());
            if fire(hooks, flow, HttpHook::Request).await.is_err() {
                return self.kill().await;
            }
            flow.transition(FlowState::Accepted);
        }
        else if flow.stream.is_streamed() {
            // the request hook only sees the head of a streamed request
            let transform = flow.stream.take_transform();
            flow.stream = StreamMode::Buffered;
            if transform.is_some() {
                flow.request.headers.remove(CONTENT_LENGTH);
            }
            let server_id = self.open_server_stream(flow, false).await?;
            flow.transition(FlowState::Accepted);
            match self.pipe_body(flow, true, server_id, transform).await? {
                PipeEnd::Complete { trailers } => {
                    flow.request.content = None;
                    flow.request.trailers = trailers;
                    flow.request.timestamp_end = Some(Utc::now());
                }
                PipeEnd::Reset {
                    from_client,
                    error_code,
                } => return self.on_reset(hooks, flow, from_client, error_code).await,
            }
            if fire(hooks, flow, HttpHook::Request).await.is_err() {
                return self.kill().await;
            }
            if let Some(response) = flow.response().cloned() {
                // the server's response is not wanted anymore
                self.multiplexer
                    .server
                    .reset(server_id, ErrorCode::CANCEL)
                    .await?;
                return self.answer(hooks, flow, response).await;
            }
        }
        else {
            match self.read_body(flow, true).await? {
                BodyEnd::Complete { content, trailers } => {
                    flow.request.content = Some(content);
                    flow.request.trailers = trailers;
                    flow.request.timestamp_end = Some(Utc::now());
                }
                BodyEnd::TooLarge { limit } => return self.too_large(hooks, flow, limit).await,
                BodyEnd::Reset {
                    from_client,
                    error_code,
                } => return self.on_reset(hooks, flow, from_client, error_code).await,
            }

            if fire(hooks, flow, HttpHook::Request).await.is_err() {
                return self.kill().await;
            }
            if let Some(response) = flow.response().cloned() {
                return self.answer(hooks, flow, response).await;
            }

            flow.transition(FlowState::Accepted);
            self.send_request(flow).await?;
        }

        let response = loop {
            match self.next_event(flow, false).await? {
                StreamEvent::Headers { headers, .. } => {
                    let response = response_from_headers(&headers)?;
                    if response.status.is_informational() {
                        let client_id = self.client_id;
                        let headers = response_headers(&response);
                        self.multiplexer
                            .client
                            .with_stream(client_id, |connection| {
                                connection.send_headers(client_id, &headers, false, None)
                            })
                            .await?;
                        continue;
                    }
                    break response;
                }
                StreamEvent::Reset {
                    from_client,
                    error_code,
                } => return self.on_reset(hooks, flow, from_client, error_code).await,
                StreamEvent::Ended { .. } | StreamEvent::Data { .. } => {
                    return self
                        .on_reset(hooks, flow, false, ErrorCode::PROTOCOL_ERROR)
                        .await;
                }
            }
        };

        if flow.set_response(response).is_err() {
            tracing::debug!(flow = %flow.id, "flow has a response already, ignoring the server's");
        }
        flow.transition(FlowState::ResponseReceived);
        if fire(hooks, flow, HttpHook::ResponseHeaders).await.is_err() {
            return self.kill().await;
        }

        if flow.stream.is_streamed() {
            let transform = flow.stream.take_transform();
            flow.stream = StreamMode::Buffered;
            let client_id = self.client_id;
            let headers = match flow.response_mut() {
                Some(response) => {
                    if transform.is_some() {
                        response.headers.remove(CONTENT_LENGTH);
                    }
                    response_headers(response)
                }
                None => return Err(Error::InvalidMessage("response went missing".to_owned())),
            };
            self.multiplexer
                .client
                .with_stream(client_id, |connection| {
                    connection.send_headers(client_id, &headers, false, None)
                })
                .await?;
            self.response_started = true;

            match self.pipe_body(flow, false, client_id, transform).await? {
                PipeEnd::Complete { trailers } => {
                    if let Some(response) = flow.response_mut() {
                        response.content = None;
                        response.trailers = trailers;
                        response.timestamp_end = Some(Utc::now());
                    }
                }
                PipeEnd::Reset {
                    from_client,
                    error_code,
                } => return self.on_reset(hooks, flow, from_client, error_code).await,
            }
            // the body was forwarded already, so a kill has nothing left to stop
            let _ = fire(hooks, flow, HttpHook::Response).await;
        }
        else {
            match self.read_body(flow, false).await? {
                BodyEnd::Complete { content, trailers } => {
                    if let Some(response) = flow.response_mut() {
                        response.content = Some(content);
                        response.trailers = trailers;
                        response.timestamp_end = Some(Utc::now());
                    }
                }
                BodyEnd::TooLarge { limit } => return self.too_large(hooks, flow, limit).await,
                BodyEnd::Reset {
                    from_client,
                    error_code,
                } => return self.on_reset(hooks, flow, from_client, error_code).await,
            }

            if fire(hooks, flow, HttpHook::Response).await.is_err() {
                return self.kill().await;
            }
            let response = flow
                .response()
                .cloned()
                .ok_or_else(|| Error::InvalidMessage("response went missing".to_owned()))?;
            self.send_response(&response, flow.killed()).await?;
        }

        Ok(())
    }

    /// Returns the next event for one direction of the stream. Resets always
    /// come through. Taking data releases its stream window, so a sender
    /// can't get further ahead than one window.
    async fn next_event(&mut self, flow: &mut Flow, from_client: bool) -> Result<StreamEvent, Error> {
        let event = self.take_event(flow, from_client).await?;
        if let StreamEvent::Data {
            from_client,
            flow_controlled_length,
            ..
        } = &event
        {
            self.release(*from_client, *flow_controlled_length).await?;
        }
        Ok(event)
    }

    async fn take_event(&mut self, flow: &mut Flow, from_client: bool) -> Result<StreamEvent, Error> {
        let deferred = self.deferred.iter().position(|event| {
            event.from_client() == from_client || matches!(event, StreamEvent::Reset { .. })
        });
        if let Some(event) = deferred.and_then(|i| self.deferred.remove(i)) {
            return Ok(event);
        }

        loop {
            let event = tokio::select! {
                event = self.events.recv() => event.ok_or(Error::ZombieStream { stream_id: self.client_id })?,
                _ = self.cancel.cancelled() => return Err(Error::ZombieStream { stream_id: self.client_id }),
                _ = flow.killed() => return Err(Error::StreamReset { stream_id: self.client_id, error_code: ErrorCode::CANCEL }),
            };
            if event.from_client() == from_client || matches!(event, StreamEvent::Reset { .. }) {
                return Ok(event);
            }
            self.deferred.push_back(event);
        }
    }

    async fn release(&self, from_client: bool, length: u32) -> Result<(), Error> {
        let multiplexer = &self.multiplexer;
        let (side, stream_id) = if from_client {
            (&multiplexer.client, Some(self.client_id))
        }
        else {
            (&multiplexer.server, multiplexer.streams.server_id(self.client_id))
        };

        match stream_id {
            Some(stream_id) => {
                side.with_stream(stream_id, |connection| {
                    connection.release_stream_window(stream_id, length);
                    Ok(())
                })
                .await
            }
            None => Ok(()),
        }
    }

    /// Buffers a body, up to the configured limit.
    async fn read_body(&mut self, flow: &mut Flow, from_client: bool) -> Result<BodyEnd, Error> {
        let limit = self.multiplexer.context.config().body_size_limit;
        let mut content = BytesMut::new();
        let mut trailers = None;

        loop {
            match self.next_event(flow, from_client).await? {
                StreamEvent::Data { data, .. } => {
                    if let Some(limit) = limit {
                        if content.len() + data.len() > limit {
                            return Ok(BodyEnd::TooLarge { limit });
                        }
                    }
                    content.extend_from_slice(&data);
                }
                StreamEvent::Headers { headers, .. } => trailers = Some(header_map(&headers)?),
                StreamEvent::Ended { .. } => {
                    return Ok(BodyEnd::Complete {
                        content: content.freeze(),
                        trailers,
                    });
                }
                StreamEvent::Reset {
                    from_client,
                    error_code,
                } => {
                    return Ok(BodyEnd::Reset {
                        from_client,
                        error_code,
                    });
                }
            }
        }
    }

    /// Forwards a body chunk by chunk to stream `to` on the other side.
    async fn pipe_body(
        &mut self,
        flow: &mut Flow,
        from_client: bool,
        to: u32,
        mut transform: Option<Box<dyn ChunkTransform>>,
    ) -> Result<PipeEnd, Error> {
        let multiplexer = self.multiplexer.clone();
        let side = if from_client {
            &multiplexer.server
        }
        else {
            &multiplexer.client
        };
        let mut trailers = None;

        loop {
            match self.next_event(flow, from_client).await? {
                StreamEvent::Data { data, .. } => {
                    let data = match &mut transform {
                        Some(transform) => transform.transform(data),
                        None => data,
                    };
                    side.send_body(to, data, false, flow.killed()).await?;
                }
                StreamEvent::Headers { headers, .. } => trailers = Some(headers),
                StreamEvent::Ended { .. } => {
                    if let Some(last) = transform.as_mut().and_then(|transform| transform.finish()) {
                        side.send_body(to, last, false, flow.killed()).await?;
                    }
                    let trailer_map = trailers.as_ref().map(header_map).transpose()?;
                    side.send_tail(to, Bytes::new(), trailers, flow.killed())
                        .await?;
                    return Ok(PipeEnd::Complete {
                        trailers: trailer_map,
                    });
                }
                StreamEvent::Reset {
                    from_client,
                    error_code,
                } => {
                    return Ok(PipeEnd::Reset {
                        from_client,
                        error_code,
                    });
                }
            }
        }
    }

    /// Opens the server stream and sends the request headers. The stream ID
    /// is allocated, mapped and used under the server lock, so IDs go out in
    /// increasing order.
    async fn open_server_stream(&self, flow: &mut Flow, end_stream: bool) -> Result<u32, Error> {
        let headers = request_headers(&flow.request);
        let client_id = self.client_id;
        let multiplexer = &self.multiplexer;
        let priority = multiplexer
            .streams
            .priority(client_id)
            .filter(|_| multiplexer.context.config().http2_priority);

        multiplexer
            .server
            .with_stream(client_id, |connection| {
                let server_id = connection.next_stream_id();
                let priority = priority.map(|priority| multiplexer.translate_priority(server_id, priority));
                multiplexer.streams.set_server_id(client_id, server_id)?;
                connection.send_headers(server_id, &headers, end_stream, priority)?;
                Ok(server_id)
            })
            .await
    }

    async fn send_request(&self, flow: &mut Flow) -> Result<u32, Error> {
        let body = flow.request.content.clone().unwrap_or_default();
        let trailers = flow.request.trailers.as_ref().map(header_list);
        let end_stream = body.is_empty() && trailers.is_none();

        let server_id = self.open_server_stream(flow, end_stream).await?;
        if !end_stream {
            self.multiplexer
                .server
                .send_tail(server_id, body, trailers, flow.killed())
                .await?;
        }
        Ok(server_id)
    }

    async fn send_response(&self, response: &Response, killed: impl Future<Output = ()>) -> Result<(), Error> {
        let client_id = self.client_id;
        let headers = response_headers(response);
        let body = response.content.clone().unwrap_or_default();
        let trailers = response.trailers.as_ref().map(header_list);
        let end_stream = body.is_empty() && trailers.is_none();

        let client = &self.multiplexer.client;
        client
            .with_stream(client_id, |connection| {
                connection.send_headers(client_id, &headers, end_stream, None)
            })
            .await?;
        if !end_stream {
            client.send_tail(client_id, body, trailers, killed).await?;
        }
        Ok(())
    }

    /// Sends the response a `request` hook assigned.
    async fn answer(&self, hooks: &dyn Hooks, flow: &mut Flow, response: Response) -> Result<(), Error> {
        tracing::debug!(flow = %flow.id, "answering from the request hook");
        if fire(hooks, flow, HttpHook::Response).await.is_err() {
            return self.kill().await;
        }
        let response = flow.response().cloned().unwrap_or(response);
        self.send_response(&response, flow.killed()).await
    }

    /// Resets the stream on both sides.
    async fn reset(&self, error_code: ErrorCode) -> Result<(), Error> {
        if let Some(server_id) = self.multiplexer.streams.server_id(self.client_id) {
            let _ = self.multiplexer.server.reset(server_id, error_code).await;
        }
        self.multiplexer.client.reset(self.client_id, error_code).await
    }

    async fn kill(&self) -> Result<(), Error> {
        tracing::debug!("flow killed, cancelling stream");
        self.reset(ErrorCode::CANCEL).await
    }

    async fn too_large(&self, hooks: &dyn Hooks, flow: &mut Flow, limit: usize) -> Result<(), Error> {
        tracing::debug!(flow = %flow.id, limit, "body too large, refusing stream");
        fail(hooks, flow, &crate::http::Error::BodyTooLarge { limit }).await;
        self.reset(ErrorCode::REFUSED_STREAM).await
    }

    /// One side reset the stream. A client reset ends the flow quietly. A
    /// server reset is answered with an error response, unless it was a
    /// cancellation, which was passed on already. Once the response head is
    /// out, the reset is passed on instead.
    async fn on_reset(
        &self,
        hooks: &dyn Hooks,
        flow: &mut Flow,
        from_client: bool,
        error_code: ErrorCode,
    ) -> Result<(), Error> {
        let error = crate::http::Error::from(Error::StreamReset {
            stream_id: self.client_id,
            error_code,
        });
        fail(hooks, flow, &error).await;

        if from_client || error_code == ErrorCode::CANCEL || flow.is_killed() {
            return Ok(());
        }
        if self.response_started {
            return self
                .multiplexer
                .client
                .reset(self.client_id, error_code)
                .await;
        }
        let response = Response::error(StatusCode::BAD_GATEWAY, &format!("server reset the stream: {error_code}"));
        if self.send_response(&response, flow.killed()).await.is_err() {
            self.multiplexer
                .client
                .reset(self.client_id, error_code)
                .await?;
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidMessage(message.into())
}

fn to_str(value: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(value).map_err(|_| invalid("header is not utf-8"))
}

fn header_map(headers: &HeaderList) -> Result<HeaderMap, Error> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if name.starts_with(b":") {
            continue;
        }
        let name = HeaderName::from_bytes(name).map_err(|_| invalid("invalid header name"))?;
        let value = HeaderValue::from_bytes(value).map_err(|_| invalid("invalid header value"))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Connection-specific headers are not allowed in HTTP/2.
fn is_connection_specific(name: &HeaderName, value: &HeaderValue) -> bool {
    name == CONNECTION
        || name == TRANSFER_ENCODING
        || name == UPGRADE
        || name == HOST
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
        || (name == TE && value.as_bytes() != b"trailers")
}

fn header_list(headers: &HeaderMap) -> HeaderList {
    headers
        .iter()
        .filter(|(name, value)| !is_connection_specific(name, value))
        .map(|(name, value)| {
            (
                Bytes::copy_from_slice(name.as_str().as_bytes()),
                Bytes::copy_from_slice(value.as_bytes()),
            )
        })
        .collect()
}

fn pseudo(name: &'static str, value: impl AsRef<[u8]>) -> (Bytes, Bytes) {
    (
        Bytes::from_static(name.as_bytes()),
        Bytes::copy_from_slice(value.as_ref()),
    )
}

fn request_from_headers(headers: &HeaderList, context: &Context) -> Result<Request, Error> {
    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;

    for (name, value) in headers {
        match &name[..] {
            b":method" => {
                method = Some(Method::from_bytes(value).map_err(|_| invalid("invalid method"))?);
            }
            b":scheme" => scheme = Some(to_str(value)?.to_owned()),
            b":authority" => authority = Some(to_str(value)?.to_owned()),
            b":path" => path = Some(to_str(value)?.to_owned()),
            name if name.starts_with(b":") => return Err(invalid("unknown pseudo-header")),
            _ => {}
        }
    }

    let method = method.ok_or_else(|| invalid("missing :method"))?;
    if method == Method::CONNECT {
        return Err(invalid("CONNECT over http/2 is not supported"));
    }
    let scheme = match scheme.as_deref() {
        Some("https") => Scheme::Https,
        Some("http") => Scheme::Http,
        Some(scheme) => return Err(invalid(format!("unsupported scheme: {scheme}"))),
        None => return Err(invalid("missing :scheme")),
    };
    let path = path.ok_or_else(|| invalid("missing :path"))?;
    let header_map = header_map(headers)?;

    let authority = authority.or_else(|| {
        header_map
            .get(HOST)
            .and_then(|host| host.to_str().ok())
            .map(ToOwned::to_owned)
    });
    let address = match &authority {
        Some(authority) => {
            TcpAddress::from_authority(authority, scheme.default_port())
                .map_err(|error| invalid(error.to_string()))?
        }
        None => {
            context
                .server_address()
                .ok_or_else(|| invalid("request has no authority"))?
        }
    };

    let target_form = if path == "*" {
        TargetForm::Asterisk
    }
    else {
        TargetForm::Origin
    };
    let mut request = Request::new(method, scheme, &address, path);
    request.authority = authority;
    request.version = Version::HTTP_2;
    request.headers = header_map;
    request.content = None;
    request.target_form = target_form;
    Ok(request)
}

fn request_headers(request: &Request) -> HeaderList {
    let mut headers = vec![
        pseudo(":method", request.method.as_str()),
        pseudo(":scheme", request.scheme.to_string()),
        pseudo(":authority", request.host_header()),
        pseudo(":path", &request.path),
    ];
    headers.extend(header_list(&request.headers));
    headers
}

fn response_from_headers(headers: &HeaderList) -> Result<Response, Error> {
    let status = headers
        .iter()
        .find(|(name, _)| &name[..] == b":status")
        .ok_or_else(|| invalid("missing :status"))?;
    let status = to_str(&status.1)?
        .parse::<u16>()
        .ok()
        .and_then(|status| StatusCode::from_u16(status).ok())
        .ok_or_else(|| invalid("invalid :status"))?;

    Ok(Response {
        status,
        reason: None,
        version: Version::HTTP_2,
        headers: header_map(headers)?,
        content: None,
        trailers: None,
        timestamp_start: Utc::now(),
        timestamp_end: None,
    })
}

fn response_headers(response: &Response) -> HeaderList {
    let mut headers = vec![pseudo(":status", response.status.as_str())];
    headers.extend(header_list(&response.headers));
    headers
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{
            HashMap,
            VecDeque,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::{
        io::{
            AsyncReadExt,
            AsyncWriteExt,
            DuplexStream,
        },
        sync::mpsc,
    };
    use tokio_util::sync::CancellationToken;

    use super::Http2Layer;
    use crate::{
        address::TcpAddress,
        config::ProxyConfig,
        connection::{
            ClientConnection,
            ServerConnection,
            ServerStream,
        },
        flow::{
            Flow,
            InterceptHandle,
            StreamMode,
        },
        hooks::{
            Hooks,
            NoHooks,
        },
        http::{
            http2::{
                connection::{
                    Connection,
                    Role,
                    Settings,
                },
                events::{
                    Event,
                    HeaderList,
                },
                frame::ErrorCode,
            },
            message::Response,
        },
        layer::{
            Context,
            Layer,
            Scope,
        },
        proxy::Proxy,
        tls::ca::Ca,
    };

    /// One end of an HTTP/2 connection, driven by hand.
    struct Peer {
        connection: Connection,
        io: DuplexStream,
        events: VecDeque<Event>,
    }

    impl Peer {
        async fn new(role: Role, io: DuplexStream, settings: Settings) -> Self {
            let mut connection = Connection::new(role, settings);
            connection.initiate();
            let mut peer = Self {
                connection,
                io,
                events: VecDeque::new(),
            };
            peer.flush().await;
            peer
        }

        async fn flush(&mut self) {
            let data = self.connection.data_to_send();
            self.io.write_all(&data).await.unwrap();
        }

        async fn next(&mut self) -> Event {
            loop {
                if let Some(event) = self.events.pop_front() {
                    return event;
                }
                let mut buf = vec![0; 64 * 1024];
                let n = self.io.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed");
                let events = self.connection.receive(&buf[..n]).unwrap();
                self.events.extend(events);
                self.flush().await;
            }
        }

        async fn next_matching(&mut self, f: impl Fn(&Event) -> bool) -> Event {
            loop {
                let event = self.next().await;
                if f(&event) {
                    return event;
                }
            }
        }

        async fn request(&mut self, path: &str, headers: &[(&'static str, String)], body: Option<&'static [u8]>) -> u32 {
            let stream_id = self.connection.next_stream_id();
            let mut list = vec![
                header(":method", "GET"),
                header(":scheme", "https"),
                header(":authority", "example.com"),
                header(":path", path),
            ];
            for (name, value) in headers {
                list.push(header(name, value));
            }
            self.connection
                .send_headers(stream_id, &list, body.is_none(), None)
                .unwrap();
            if let Some(body) = body {
                self.connection
                    .send_data(stream_id, Bytes::from_static(body), true)
                    .unwrap();
            }
            self.flush().await;
            stream_id
        }
    }

    fn header(name: &'static str, value: &str) -> (Bytes, Bytes) {
        (
            Bytes::from_static(name.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        )
    }

    fn value<'a>(headers: &'a HeaderList, name: &str) -> &'a [u8] {
        &headers
            .iter()
            .find(|(n, _)| &n[..] == name.as_bytes())
            .unwrap()
            .1
    }

    async fn start(config: ProxyConfig, hooks: impl Hooks) -> (Peer, Peer) {
        start_with(config, hooks, Settings::default()).await
    }

    async fn start_with(config: ProxyConfig, hooks: impl Hooks, client_settings: Settings) -> (Peer, Peer) {
        let proxy = Proxy::new(config, hooks, Ca::generate().await.unwrap())
            .await
            .unwrap();
        let (client_io, proxy_client) = tokio::io::duplex(1 << 20);
        let (server_io, proxy_server) = tokio::io::duplex(1 << 20);

        let address = TcpAddress::new("example.com", 443);
        let root = Context::new(proxy, ClientConnection::detached(), CancellationToken::new());
        let context = root.child(
            "test",
            Scope {
                server_address: Some(address.clone()),
                server: Some(ServerStream {
                    connection: ServerConnection::new(address),
                    io: Box::new(proxy_server),
                }),
                ..Default::default()
            },
        );
        tokio::spawn(async move { Http2Layer::new().layer(context, Box::new(proxy_client)).await });

        let client = Peer::new(Role::Client, client_io, client_settings).await;
        let server = Peer::new(Role::Server, server_io, Settings::default()).await;
        (client, server)
    }

    /// Answers requests with their path until `count` were answered. Returns
    /// the stream IDs in the order the requests arrived.
    async fn answer_paths(server: &mut Peer, count: usize) -> Vec<u32> {
        let mut paths = HashMap::new();
        let mut order = vec![];
        let mut answered = 0;
        while answered < count {
            match server.next().await {
                Event::RequestReceived {
                    stream_id, headers, ..
                } => {
                    order.push(stream_id);
                    paths.insert(stream_id, value(&headers, ":path").to_vec());
                }
                Event::StreamEnded { stream_id } => {
                    let path = Bytes::from(paths[&stream_id].clone());
                    server
                        .connection
                        .send_headers(stream_id, &[header(":status", "200")], false, None)
                        .unwrap();
                    server.connection.send_data(stream_id, path, true).unwrap();
                    server.flush().await;
                    answered += 1;
                }
                _ => {}
            }
        }
        order
    }

    /// Collects response bodies by client stream ID.
    async fn read_responses(client: &mut Peer, count: usize) -> HashMap<u32, Vec<u8>> {
        let mut bodies: HashMap<u32, Vec<u8>> = HashMap::new();
        let mut ended = 0;
        while ended < count {
            match client.next().await {
                Event::ResponseReceived { headers, .. } => {
                    assert_eq!(value(&headers, ":status"), b"200");
                }
                Event::DataReceived {
                    stream_id, data, ..
                } => {
                    bodies.entry(stream_id).or_default().extend_from_slice(&data);
                }
                Event::StreamEnded { .. } => ended += 1,
                Event::StreamReset { .. } => panic!("stream was reset"),
                _ => {}
            }
        }
        bodies
    }

    #[tokio::test]
    async fn it_opens_server_streams_in_increasing_order() {
        let (mut client, mut server) = start(ProxyConfig::default(), NoHooks).await;

        let mut ids = vec![];
        for i in 0..4 {
            ids.push(client.request(&format!("/{i}"), &[], None).await);
        }

        let server_task = tokio::spawn(async move { answer_paths(&mut server, 4).await });
        let bodies = read_responses(&mut client, 4).await;
        let order = server_task.await.unwrap();

        assert_eq!(order, vec![1, 3, 5, 7]);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(bodies[id], format!("/{i}").into_bytes());
        }
    }

    #[tokio::test]
    async fn it_keeps_header_blocks_contiguous() {
        let (mut client, mut server) = start(ProxyConfig::default(), NoHooks).await;

        // forces CONTINUATION frames on both connections
        let big = "x".repeat(40_000);
        let first = client
            .request("/big", &[("x-big", big)], Some(&b"one"[..]))
            .await;
        let second = client.request("/small", &[], Some(&b"three"[..])).await;

        // the server's state machine rejects interleaved header blocks
        let server_task = tokio::spawn(async move { answer_paths(&mut server, 2).await });
        let bodies = read_responses(&mut client, 2).await;
        server_task.await.unwrap();

        assert_eq!(bodies[&first], b"/big");
        assert_eq!(bodies[&second], b"/small");
    }

    #[tokio::test]
    async fn it_propagates_cancellations() {
        let (mut client, mut server) = start(ProxyConfig::default(), NoHooks).await;

        let first = client.request("/a", &[], None).await;
        let second = client.request("/b", &[], None).await;

        // workers may open their server streams in any order
        let mut server_ids = HashMap::new();
        while server_ids.len() < 2 {
            if let Event::RequestReceived {
                stream_id, headers, ..
            } = server.next().await
            {
                server_ids.insert(value(&headers, ":path").to_vec(), stream_id);
            }
        }

        client.connection.reset_stream(first, ErrorCode::CANCEL);
        client.flush().await;
        let event = server
            .next_matching(|event| matches!(event, Event::StreamReset { .. }))
            .await;
        assert_eq!(
            event,
            Event::StreamReset {
                stream_id: server_ids[&b"/a"[..]],
                error_code: ErrorCode::CANCEL
            }
        );

        server
            .connection
            .reset_stream(server_ids[&b"/b"[..]], ErrorCode::CANCEL);
        server.flush().await;
        let event = client
            .next_matching(|event| matches!(event, Event::StreamReset { .. }))
            .await;
        assert_eq!(
            event,
            Event::StreamReset {
                stream_id: second,
                error_code: ErrorCode::CANCEL
            }
        );
    }

    #[tokio::test]
    async fn it_refuses_streams_over_the_body_limit() {
        let config = ProxyConfig {
            body_size_limit: Some(4),
            ..Default::default()
        };
        let (mut client, mut server) = start(config, NoHooks).await;

        let stream_id = client.request("/", &[], None).await;
        let server_id = match server
            .next_matching(|event| matches!(event, Event::RequestReceived { .. }))
            .await
        {
            Event::RequestReceived { stream_id, .. } => stream_id,
            _ => unreachable!(),
        };
        server
            .connection
            .send_headers(server_id, &[header(":status", "200")], false, None)
            .unwrap();
        server
            .connection
            .send_data(server_id, Bytes::from_static(b"far too long"), false)
            .unwrap();
        server.flush().await;

        let event = server
            .next_matching(|event| matches!(event, Event::StreamReset { .. }))
            .await;
        assert_eq!(
            event,
            Event::StreamReset {
                stream_id: server_id,
                error_code: ErrorCode::REFUSED_STREAM
            }
        );
        let event = client
            .next_matching(|event| matches!(event, Event::StreamReset { .. }))
            .await;
        assert_eq!(
            event,
            Event::StreamReset {
                stream_id,
                error_code: ErrorCode::REFUSED_STREAM
            }
        );
    }

    struct Answer;

    #[async_trait]
    impl Hooks for Answer {
        async fn request(&self, flow: &mut Flow) {
            flow.set_response(Response::text(418, "teapot")).unwrap();
        }
    }

    #[tokio::test]
    async fn it_answers_from_the_request_hook() {
        let (mut client, _server) = start(ProxyConfig::default(), Answer).await;

        let stream_id = client.request("/", &[], None).await;
        let headers = match client
            .next_matching(|event| matches!(event, Event::ResponseReceived { .. }))
            .await
        {
            Event::ResponseReceived { headers, .. } => headers,
            _ => unreachable!(),
        };
        assert_eq!(value(&headers, ":status"), b"418");

        let event = client
            .next_matching(|event| matches!(event, Event::DataReceived { .. }))
            .await;
        assert!(matches!(
            event,
            Event::DataReceived { stream_id: id, data, .. } if id == stream_id && data == "teapot"
        ));
    }

    struct StreamResponses;

    #[async_trait]
    impl Hooks for StreamResponses {
        async fn response_headers(&self, flow: &mut Flow) {
            flow.stream = StreamMode::Streamed;
        }
    }

    #[tokio::test]
    async fn it_resets_a_streamed_response_the_server_reset() {
        let (mut client, mut server) = start(ProxyConfig::default(), StreamResponses).await;

        let stream_id = client.request("/", &[], None).await;
        let server_id = match server
            .next_matching(|event| matches!(event, Event::RequestReceived { .. }))
            .await
        {
            Event::RequestReceived { stream_id, .. } => stream_id,
            _ => unreachable!(),
        };
        server
            .connection
            .send_headers(server_id, &[header(":status", "200")], false, None)
            .unwrap();
        server
            .connection
            .send_data(server_id, Bytes::from_static(b"partial"), false)
            .unwrap();
        server.connection.reset_stream(server_id, ErrorCode::INTERNAL_ERROR);
        server.flush().await;

        // a second header block would fail the client's connection here
        let mut heads = 0;
        let reset = loop {
            match client.next().await {
                Event::ResponseReceived { .. } => heads += 1,
                Event::TrailersReceived { .. } => panic!("error response after the head"),
                event @ Event::StreamReset { .. } => break event,
                _ => {}
            }
        };
        assert_eq!(heads, 1);
        assert_eq!(
            reset,
            Event::StreamReset {
                stream_id,
                error_code: ErrorCode::INTERNAL_ERROR
            }
        );
    }

    /// Intercepts every request before its body is read.
    struct Hold(mpsc::UnboundedSender<InterceptHandle>);

    #[async_trait]
    impl Hooks for Hold {
        async fn request_headers(&self, flow: &mut Flow) {
            let _ = self.0.send(flow.intercept());
        }
    }

    #[tokio::test]
    async fn it_holds_back_stream_window_while_a_flow_is_intercepted() {
        let (handles, mut intercepted) = mpsc::unbounded_channel();
        let (mut client, _server) = start(ProxyConfig::default(), Hold(handles)).await;

        let stream_id = client.connection.next_stream_id();
        let headers = [
            header(":method", "POST"),
            header(":scheme", "https"),
            header(":authority", "example.com"),
            header(":path", "/upload"),
        ];
        client
            .connection
            .send_headers(stream_id, &headers, false, None)
            .unwrap();
        for length in [16_384, 16_384, 16_384, 16_383] {
            client
                .connection
                .send_data(stream_id, Bytes::from(vec![0u8; length]), false)
                .unwrap();
        }
        client.flush().await;
        let handle = intercepted.recv().await.unwrap();

        let updated = tokio::time::timeout(
            Duration::from_millis(200),
            client.next_matching(|event| {
                matches!(event, Event::WindowUpdated { stream_id: id, .. } if *id == stream_id)
            }),
        )
        .await;
        assert!(updated.is_err(), "stream window was released while intercepted");
        assert_eq!(client.connection.local_flow_control_window(stream_id).unwrap(), 0);

        handle.resume();
        client
            .next_matching(|event| {
                matches!(event, Event::WindowUpdated { stream_id: id, .. } if *id == stream_id)
            })
            .await;
        assert!(client.connection.local_flow_control_window(stream_id).unwrap() > 0);
    }

    /// Answers every request and hands out the flow's handle.
    struct AnswerAndShare(mpsc::UnboundedSender<InterceptHandle>);

    #[async_trait]
    impl Hooks for AnswerAndShare {
        async fn request(&self, flow: &mut Flow) {
            flow.set_response(Response::text(200, "never sent")).unwrap();
            let _ = self.0.send(flow.handle());
        }
    }

    #[tokio::test]
    async fn it_cancels_a_body_blocked_on_the_window_when_killed() {
        let (handles, mut answered) = mpsc::unbounded_channel();
        let client_settings = Settings {
            initial_window_size: 0,
            ..Default::default()
        };
        let (mut client, _server) = start_with(ProxyConfig::default(), AnswerAndShare(handles), client_settings).await;

        let stream_id = client.request("/", &[], None).await;
        client
            .next_matching(|event| matches!(event, Event::ResponseReceived { .. }))
            .await;
        // the body can't move until the client opens its window
        answered.recv().await.unwrap().kill();

        let event = client
            .next_matching(|event| matches!(event, Event::StreamReset { .. }))
            .await;
        assert_eq!(
            event,
            Event::StreamReset {
                stream_id,
                error_code: ErrorCode::CANCEL
            }
        );
    }
}
