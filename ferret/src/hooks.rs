//! Hooks let observers inspect and modify traffic.
//!
//! For every HTTP exchange the engines call, in order:
//!
//! 1. [`Hooks::request_headers`] once the request head is parsed,
//! 2. [`Hooks::request`] with the complete request. Setting a response here
//!    answers the client without ever contacting the server.
//! 3. [`Hooks::response_headers`] once the response head is parsed. Set
//!    [`Flow::stream`] here to stream (and optionally transform) the body.
//! 4. [`Hooks::response`] with the complete response,
//!
//! or [`Hooks::error`] in place of the response hooks if the exchange failed.
//!
//! Any hook may kill the flow or [intercept](Flow::intercept) it, in which case
//! the exchange waits until the flow is resumed or killed. Hooks for the same
//! flow are never called concurrently.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    flow::{
        Flow,
        WebSocketMessage,
    },
    tls::{
        ClientHelloData,
        TlsFailure,
    },
};

#[async_trait]
pub trait Hooks: Send + Sync + 'static {
    async fn request_headers(&self, _flow: &mut Flow) {}

    async fn request(&self, _flow: &mut Flow) {}

    async fn response_headers(&self, _flow: &mut Flow) {}

    async fn response(&self, _flow: &mut Flow) {}

    async fn error(&self, _flow: &mut Flow) {}

    /// Called with the parsed ClientHello before deciding whether to intercept
    /// the connection. Set [`ClientHelloData::ignore_connection`] to relay it
    /// untouched.
    async fn tls_client_hello(&self, _data: &mut ClientHelloData) {}

    /// The client rejected our certificate.
    async fn tls_failed_client(&self, _failure: &TlsFailure) {}

    async fn websocket_start(&self, _flow: &mut Flow) {}

    /// Called for every text or binary message. The hook may change its content
    /// or [drop](WebSocketMessage::drop_message) it.
    async fn websocket_message(&self, _flow: &mut Flow, _message: &mut WebSocketMessage) {}

    async fn websocket_end(&self, _flow: &mut Flow) {}
}

/// Hooks that do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}

/// Calls a list of hooks in order. Stops calling flow hooks once one of them
/// killed the flow.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn Hooks>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hooks: impl Hooks) -> Self {
        self.hooks.push(Arc::new(hooks));
        self
    }

    pub fn push(&mut self, hooks: Arc<dyn Hooks>) {
        self.hooks.push(hooks);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookChain")
            .field("len", &self.hooks.len())
            .finish()
    }
}

#[async_trait]
impl Hooks for HookChain {
    async fn request_headers(&self, flow: &mut Flow) {
        for hooks in &self.hooks {
            if flow.is_killed() {
                break;
            }
            hooks.request_headers(flow).await;
        }
    }

    async fn request(&self, flow: &mut Flow) {
        for hooks in &self.hooks {
            if flow.is_killed() {
                break;
            }
            hooks.request(flow).await;
        }
    }

    async fn response_headers(&self, flow: &mut Flow) {
        for hooks in &self.hooks {
            if flow.is_killed() {
                break;
            }
            hooks.response_headers(flow).await;
        }
    }

    async fn response(&self, flow: &mut Flow) {
        for hooks in &self.hooks {
            if flow.is_killed() {
                break;
            }
            hooks.response(flow).await;
        }
    }

    async fn error(&self, flow: &mut Flow) {
        for hooks in &self.hooks {
            if flow.is_killed() {
                break;
            }
            hooks.error(flow).await;
        }
    }

    async fn websocket_start(&self, flow: &mut Flow) {
        for hooks in &self.hooks {
            if flow.is_killed() {
                break;
            }
            hooks.websocket_start(flow).await;
        }
    }

    async fn websocket_end(&self, flow: &mut Flow) {
        for hooks in &self.hooks {
            if flow.is_killed() {
                break;
            }
            hooks.websocket_end(flow).await;
        }
    }

    async fn tls_client_hello(&self, data: &mut ClientHelloData) {
        for hooks in &self.hooks {
            hooks.tls_client_hello(data).await;
        }
    }

    async fn tls_failed_client(&self, failure: &TlsFailure) {
        for hooks in &self.hooks {
            hooks.tls_failed_client(failure).await;
        }
    }

    async fn websocket_message(&self, flow: &mut Flow, message: &mut WebSocketMessage) {
        for hooks in &self.hooks {
            if flow.is_killed() || message.dropped {
                break;
            }
            hooks.websocket_message(flow, message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    use async_trait::async_trait;

    use super::{
        HookChain,
        Hooks,
    };
    use crate::{
        connection::ClientConnection,
        flow::Flow,
        http::message::Request,
    };

    struct Killer;

    #[async_trait]
    impl Hooks for Killer {
        async fn request(&self, flow: &mut Flow) {
            flow.kill();
        }
    }

    #[derive(Clone, Default)]
    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Hooks for Counter {
        async fn request(&self, _flow: &mut Flow) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn it_stops_the_chain_when_a_flow_is_killed() {
        let counter = Counter::default();
        let chain = HookChain::new()
            .with(counter.clone())
            .with(Killer)
            .with(counter.clone());

        let mut flow = Flow::new(
            ClientConnection::detached(),
            Request::get("http://example.com/").unwrap(),
        );
        chain.request(&mut flow).await;

        assert!(flow.is_killed());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
