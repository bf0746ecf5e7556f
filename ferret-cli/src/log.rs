//! Hooks that log traffic to the console.

use async_trait::async_trait;
use ferret::{
    flow::{
        Flow,
        WebSocketContent,
        WebSocketMessage,
    },
    hooks::Hooks,
    tls::{
        ClientHelloData,
        TlsFailure,
    },
};

/// Logs one line per finished flow.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogFlows;

#[async_trait]
impl Hooks for LogFlows {
    async fn response(&self, flow: &mut Flow) {
        if let Some(response) = flow.response() {
            let size = response.content.as_ref().map(|content| content.len());
            tracing::info!(
                client = ?flow.client_conn.peer_address,
                replay = flow.is_replay(),
                "{} {} -> {} {}",
                flow.request.method,
                flow.request.url(),
                response.status.as_u16(),
                size.map_or_else(|| "streamed".to_owned(), |size| format!("{size} bytes")),
            );
        }
    }

    async fn error(&self, flow: &mut Flow) {
        if let Some(error) = flow.error() {
            tracing::warn!(
                client = ?flow.client_conn.peer_address,
                "{} {} -> {}",
                flow.request.method,
                flow.request.url(),
                error.message,
            );
        }
    }

    async fn tls_client_hello(&self, data: &mut ClientHelloData) {
        tracing::debug!(sni = ?data.sni, destination = ?data.destination, "client hello");
    }

    async fn tls_failed_client(&self, failure: &TlsFailure) {
        tracing::warn!(
            sni = ?failure.sni,
            destination = ?failure.destination,
            "client rejected our certificate: {}",
            failure.reason,
        );
    }

    async fn websocket_start(&self, flow: &mut Flow) {
        tracing::info!("websocket {}", flow.request.url());
    }

    async fn websocket_message(&self, _flow: &mut Flow, message: &mut WebSocketMessage) {
        let direction = if message.from_client { "->" } else { "<-" };
        match &message.content {
            WebSocketContent::Text(text) => tracing::debug!("{direction} {text}"),
            WebSocketContent::Binary(data) => tracing::debug!("{direction} {} bytes", data.len()),
        }
    }

    async fn websocket_end(&self, flow: &mut Flow) {
        let messages = flow
            .websocket
            .as_ref()
            .map_or(0, |websocket| websocket.messages.len());
        tracing::info!(messages, "websocket closed {}", flow.request.url());
    }
}
