//! Flows: one HTTP exchange as seen by hooks.
//!
//! A [`Flow`] is created when a request head has been parsed and lives until
//! the response (or error) was delivered and all hooks ran. Hooks get
//! `&mut Flow` and may change the request or response, assign a response from
//! the `request` hook, kill the flow, or intercept it. An intercepted flow
//! holds up its exchange until someone calls [`InterceptHandle::resume`] or
//! [`InterceptHandle::kill`].

use std::{
    fmt::Display,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    connection::{
        ClientConnection,
        ServerConnection,
    },
    http::message::{
        Request,
        Response,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub Uuid);

impl FlowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a flow.
///
/// ```text
/// Started -> [Intercepted] -> Accepted -> ResponseReceived -> Completed -> [Replayed]
///    \______________\______________\____________\______________> Killed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum FlowState {
    Started,
    Intercepted,
    Accepted,
    ResponseReceived,
    Completed,
    Killed,
    Replayed,
}

impl FlowState {
    pub fn can_transition_to(self, next: FlowState) -> bool {
        use FlowState::*;
        match (self, next) {
            (Killed, _) | (Replayed, _) => false,
            (Completed, Replayed) => true,
            (Completed, _) => false,
            (_, Killed) => true,
            (Started, Intercepted | Accepted) => true,
            (Accepted, Intercepted | ResponseReceived | Completed) => true,
            (ResponseReceived, Intercepted | Completed) => true,
            (Intercepted, Started | Accepted | ResponseReceived) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Killed | Self::Replayed)
    }
}

/// Error attached to a flow in place of (or after) a response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl FlowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Returned when a flow was killed while the exchange waited on it.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("flow was killed")]
pub struct Killed;

#[derive(Debug, thiserror::Error)]
pub enum SetError {
    #[error("flow already has a response")]
    ResponseAlreadySet,

    #[error("flow already has an error")]
    ErrorAlreadySet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Decision {
    Running,
    Intercepted,
    Killed,
}

#[derive(Debug)]
struct Control {
    decision: watch::Sender<Decision>,
    killed: CancellationToken,
}

/// Cloneable handle to resume or kill an intercepted flow from outside the
/// hook that intercepted it.
#[derive(Clone, Debug)]
pub struct InterceptHandle {
    flow_id: FlowId,
    control: Arc<Control>,
}

impl InterceptHandle {
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Lets the exchange continue. Does nothing if the flow was killed.
    pub fn resume(&self) {
        self.control.decision.send_if_modified(|decision| {
            if *decision == Decision::Intercepted {
                *decision = Decision::Running;
                true
            }
            else {
                false
            }
        });
    }

    pub fn kill(&self) {
        self.control.decision.send_replace(Decision::Killed);
        self.control.killed.cancel();
    }

    pub fn is_intercepted(&self) -> bool {
        *self.control.decision.borrow() == Decision::Intercepted
    }
}

/// Per-chunk transformation of a streamed body.
pub trait ChunkTransform: Send {
    fn transform(&mut self, chunk: Bytes) -> Bytes;

    /// Called once after the last chunk. Whatever is returned is sent as a
    /// final chunk.
    fn finish(&mut self) -> Option<Bytes> {
        None
    }
}

impl<F> ChunkTransform for F
where
    F: FnMut(Bytes) -> Bytes + Send,
{
    fn transform(&mut self, chunk: Bytes) -> Bytes {
        self(chunk)
    }
}

/// How a message body is handed to the other side.
#[derive(Default)]
pub enum StreamMode {
    /// The body is read completely, the hooks see it, then it is sent on.
    #[default]
    Buffered,

    /// Chunks are forwarded as they arrive. The hooks never see the body.
    Streamed,

    /// Like [`StreamMode::Streamed`], but every chunk passes through the
    /// transform.
    Transform(Box<dyn ChunkTransform>),
}

impl StreamMode {
    pub fn is_streamed(&self) -> bool {
        !matches!(self, Self::Buffered)
    }

    /// Takes the transform out, leaving [`StreamMode::Streamed`] behind. The
    /// transform is single-pass, so this can only be done once.
    pub fn take_transform(&mut self) -> Option<Box<dyn ChunkTransform>> {
        match std::mem::replace(self, Self::Streamed) {
            Self::Transform(transform) => Some(transform),
            Self::Buffered => {
                *self = Self::Buffered;
                None
            }
            Self::Streamed => None,
        }
    }
}

impl std::fmt::Debug for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered => write!(f, "Buffered"),
            Self::Streamed => write!(f, "Streamed"),
            Self::Transform(_) => write!(f, "Transform(..)"),
        }
    }
}

/// A body that is read chunk by chunk. Finite and single-pass.
#[async_trait]
pub trait BodyStream: Send {
    type Error: Send;

    /// Returns the next chunk, or `None` once the body is complete.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, Self::Error>;
}

/// A [`BodyStream`] with a [`ChunkTransform`] applied.
pub struct Transformed<S> {
    inner: S,
    transform: Option<Box<dyn ChunkTransform>>,
    finished: bool,
}

impl<S> Transformed<S> {
    pub fn new(inner: S, transform: Option<Box<dyn ChunkTransform>>) -> Self {
        Self {
            inner,
            transform,
            finished: false,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: BodyStream> BodyStream for Transformed<S> {
    type Error = S::Error;

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, S::Error> {
        if self.finished {
            return Ok(None);
        }
        match self.inner.next_chunk().await? {
            Some(chunk) => {
                Ok(Some(match &mut self.transform {
                    Some(transform) => transform.transform(chunk),
                    None => chunk,
                }))
            }
            None => {
                self.finished = true;
                Ok(self
                    .transform
                    .as_mut()
                    .and_then(|transform| transform.finish()))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebSocketContent {
    Text(String),
    Binary(Bytes),
}

/// A WebSocket message relayed after an upgrade.
#[derive(Clone, Debug)]
pub struct WebSocketMessage {
    pub from_client: bool,
    pub content: WebSocketContent,
    pub timestamp: DateTime<Utc>,
    /// Set by a hook to not forward this message.
    pub dropped: bool,
}

impl WebSocketMessage {
    pub fn new(from_client: bool, content: WebSocketContent) -> Self {
        Self {
            from_client,
            content,
            timestamp: Utc::now(),
            dropped: false,
        }
    }

    pub fn drop_message(&mut self) {
        self.dropped = true;
    }
}

#[derive(Clone, Debug, Default)]
pub struct WebSocketData {
    pub messages: Vec<WebSocketMessage>,
    pub closed_by_client: Option<bool>,
    pub close_code: Option<u16>,
    pub close_reason: Option<String>,
}

pub struct Flow {
    pub id: FlowId,
    pub client_conn: ClientConnection,
    pub server_conn: Option<ServerConnection>,
    pub request: Request,
    response: Option<Response>,
    error: Option<FlowError>,
    pub websocket: Option<WebSocketData>,
    /// Set from the `requestheaders` or `responseheaders` hook to stream the
    /// corresponding body.
    pub stream: StreamMode,
    state: FlowState,
    live: bool,
    is_replay: bool,
    control: Arc<Control>,
}

impl Flow {
    pub fn new(client_conn: ClientConnection, request: Request) -> Self {
        let (decision, _) = watch::channel(Decision::Running);
        Self {
            id: FlowId::new(),
            client_conn,
            server_conn: None,
            request,
            response: None,
            error: None,
            websocket: None,
            stream: StreamMode::Buffered,
            state: FlowState::Started,
            live: true,
            is_replay: false,
            control: Arc::new(Control {
                decision,
                killed: CancellationToken::new(),
            }),
        }
    }

    /// A fresh, live flow carrying a copy of this flow's request.
    pub(crate) fn new_replay(&self) -> Self {
        let mut request = self.request.clone();
        request.timestamp_start = Utc::now();
        request.timestamp_end = None;
        let mut flow = Self::new(ClientConnection::detached(), request);
        flow.is_replay = true;
        flow
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Whether the flow is still attached to an open connection.
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn is_replay(&self) -> bool {
        self.is_replay
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response> {
        self.response.as_mut()
    }

    /// Sets the response. A response can only be set once. Setting it from
    /// the `request` hook answers the request without contacting the server.
    pub fn set_response(&mut self, response: Response) -> Result<(), SetError> {
        if self.response.is_some() {
            return Err(SetError::ResponseAlreadySet);
        }
        self.response = Some(response);
        Ok(())
    }

    pub fn error(&self) -> Option<&FlowError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: FlowError) -> Result<(), SetError> {
        if self.error.is_some() {
            return Err(SetError::ErrorAlreadySet);
        }
        self.error = Some(error);
        Ok(())
    }

    /// Kills the flow. Nothing more is forwarded and no more hooks run.
    pub fn kill(&mut self) {
        self.handle().kill();
        self.state = FlowState::Killed;
    }

    pub fn is_killed(&self) -> bool {
        self.state == FlowState::Killed || self.control.killed.is_cancelled()
    }

    /// Holds up the exchange after the current hook returns. Resume or kill
    /// it through the returned handle.
    pub fn intercept(&mut self) -> InterceptHandle {
        if !self.is_killed() && self.transition(FlowState::Intercepted) {
            self.control.decision.send_replace(Decision::Intercepted);
        }
        self.handle()
    }

    pub fn handle(&self) -> InterceptHandle {
        InterceptHandle {
            flow_id: self.id,
            control: self.control.clone(),
        }
    }

    /// Resolves when the flow gets killed.
    pub fn killed(&self) -> tokio_util::sync::WaitForCancellationFutureOwned {
        self.control.killed.clone().cancelled_owned()
    }

    pub(crate) fn transition(&mut self, next: FlowState) -> bool {
        if self.state.can_transition_to(next) {
            tracing::trace!(flow = %self.id, from = %self.state, to = %next, "flow state");
            self.state = next;
            true
        }
        else {
            false
        }
    }

    /// Waits until an intercepted flow is resumed or killed. `state` is the
    /// state the flow continues in.
    pub(crate) async fn wait_for_decision(&mut self, state: FlowState) -> Result<(), Killed> {
        let mut decision = self.control.decision.subscribe();
        let result = decision
            .wait_for(|decision| *decision != Decision::Intercepted)
            .await
            .map(|decision| *decision);

        match result {
            Ok(Decision::Running) if !self.is_killed() => {
                if self.state != state {
                    self.transition(state);
                }
                Ok(())
            }
            _ => {
                self.state = FlowState::Killed;
                Err(Killed)
            }
        }
    }

    /// Marks the flow as done. It is no longer live and may be replayed.
    pub(crate) fn finish(&mut self) {
        if !self.is_killed() {
            self.transition(FlowState::Completed);
        }
        self.live = false;
    }

    pub(crate) fn mark_replayed(&mut self) {
        self.transition(FlowState::Replayed);
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("live", &self.live)
            .field("is_replay", &self.is_replay)
            .field("request", &self.request)
            .field("response", &self.response)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{
        BodyStream,
        Flow,
        FlowError,
        FlowState,
        Transformed,
    };
    use crate::{
        connection::ClientConnection,
        http::message::{
            Request,
            Response,
        },
    };

    fn flow() -> Flow {
        Flow::new(
            ClientConnection::detached(),
            Request::get("http://example.com/").unwrap(),
        )
    }

    #[test]
    fn it_sets_a_response_only_once() {
        let mut flow = flow();
        flow.set_response(Response::text(200, "a")).unwrap();
        assert!(flow.set_response(Response::text(200, "b")).is_err());
        assert_eq!(flow.response().unwrap().content.as_deref(), Some(&b"a"[..]));
    }

    #[test]
    fn it_sets_an_error_only_once() {
        let mut flow = flow();
        flow.set_error(FlowError::new("first")).unwrap();
        assert!(flow.set_error(FlowError::new("second")).is_err());
        assert_eq!(flow.error().unwrap().message, "first");
    }

    #[test]
    fn it_only_allows_valid_transitions() {
        assert!(FlowState::Started.can_transition_to(FlowState::Intercepted));
        assert!(FlowState::Accepted.can_transition_to(FlowState::Killed));
        assert!(FlowState::Completed.can_transition_to(FlowState::Replayed));
        assert!(!FlowState::Completed.can_transition_to(FlowState::Killed));
        assert!(!FlowState::Killed.can_transition_to(FlowState::Accepted));
        assert!(!FlowState::Started.can_transition_to(FlowState::Completed));
    }

    #[tokio::test]
    async fn it_waits_for_an_intercepted_flow_to_resume() {
        let mut flow = flow();
        let handle = flow.intercept();
        assert_eq!(flow.state(), FlowState::Intercepted);

        let resume = tokio::spawn(async move {
            tokio::task::yield_now().await;
            handle.resume();
        });

        flow.wait_for_decision(FlowState::Accepted).await.unwrap();
        assert_eq!(flow.state(), FlowState::Accepted);
        resume.await.unwrap();
    }

    #[tokio::test]
    async fn it_stops_waiting_when_killed() {
        let mut flow = flow();
        let handle = flow.intercept();
        handle.kill();
        assert!(flow.wait_for_decision(FlowState::Accepted).await.is_err());
        assert!(flow.is_killed());
        assert_eq!(flow.state(), FlowState::Killed);
    }

    #[tokio::test]
    async fn it_does_not_wait_when_not_intercepted() {
        let mut flow = flow();
        flow.wait_for_decision(FlowState::Accepted).await.unwrap();
        assert_eq!(flow.state(), FlowState::Accepted);
    }

    struct Chunks(Vec<Bytes>);

    #[async_trait::async_trait]
    impl BodyStream for Chunks {
        type Error = std::convert::Infallible;

        async fn next_chunk(&mut self) -> Result<Option<Bytes>, Self::Error> {
            Ok((!self.0.is_empty()).then(|| self.0.remove(0)))
        }
    }

    #[tokio::test]
    async fn it_transforms_a_stream_once() {
        let chunks = Chunks(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]);
        let upper = |chunk: Bytes| Bytes::from(chunk.to_ascii_uppercase());
        let mut stream = Transformed::new(chunks, Some(Box::new(upper)));

        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "AB");
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "CD");
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert!(stream.next_chunk().await.unwrap().is_none());
    }
}
