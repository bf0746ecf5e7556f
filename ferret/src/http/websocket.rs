//! WebSocket relay after a successful upgrade.
//!
//! Both sides are parsed into messages so that hooks can look at, change or
//! drop every text and binary message. Pings are answered on each side by the
//! WebSocket implementation and not forwarded. A close frame from either side
//! is passed on and ends the relay.

use bytes::Bytes;
use futures::{
    SinkExt,
    StreamExt,
};
use tokio_tungstenite::{
    tungstenite::{
        self,
        protocol::Role,
        Message,
    },
    WebSocketStream,
};
use tracing::Instrument;

use super::Error;
use crate::{
    flow::{
        Flow,
        WebSocketContent,
        WebSocketData,
        WebSocketMessage,
    },
    layer::Context,
    util::io::BoxedIo,
};

/// Relays WebSocket messages between `client` and `server` until either side
/// closes the connection or the flow is killed.
pub async fn relay(
    context: &Context,
    flow: &mut Flow,
    client: BoxedIo,
    server: BoxedIo,
) -> Result<(), Error> {
    let span = tracing::debug_span!("websocket", flow = %flow.id);
    relay_messages(context, flow, client, server)
        .instrument(span)
        .await
}

async fn relay_messages(
    context: &Context,
    flow: &mut Flow,
    client: BoxedIo,
    server: BoxedIo,
) -> Result<(), Error> {
    let hooks = context.hooks().clone();
    let (mut client_tx, mut client_rx) = WebSocketStream::from_raw_socket(client, Role::Server, None)
        .await
        .split();
    let (mut server_tx, mut server_rx) = WebSocketStream::from_raw_socket(server, Role::Client, None)
        .await
        .split();

    flow.websocket = Some(WebSocketData::default());
    hooks.websocket_start(flow).await;

    let result = loop {
        if flow.is_killed() {
            break Ok(());
        }

        let (from_client, message) = tokio::select! {
            message = client_rx.next() => (true, message),
            message = server_rx.next() => (false, message),
            _ = flow.killed() => break Ok(()),
        };
        let sink = if from_client {
            &mut server_tx
        }
        else {
            &mut client_tx
        };

        let content = match message {
            None => {
                record_close(flow, from_client, None);
                break Ok(());
            }
            Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                record_close(flow, from_client, None);
                break Ok(());
            }
            Some(Err(error)) => break Err(error.into()),
            Some(Ok(Message::Close(frame))) => {
                record_close(
                    flow,
                    from_client,
                    frame
                        .as_ref()
                        .map(|frame| (u16::from(frame.code), frame.reason.to_string())),
                );
                let _ = sink.send(Message::Close(frame)).await;
                break Ok(());
            }
            Some(Ok(Message::Text(text))) => WebSocketContent::Text(text),
            Some(Ok(Message::Binary(data))) => WebSocketContent::Binary(Bytes::from(data)),
            Some(Ok(_)) => continue,
        };

        let mut message = WebSocketMessage::new(from_client, content);
        hooks.websocket_message(flow, &mut message).await;
        if !message.dropped && !flow.is_killed() {
            let forward = match &message.content {
                WebSocketContent::Text(text) => Message::Text(text.clone()),
                WebSocketContent::Binary(data) => Message::Binary(data.to_vec()),
            };
            if let Err(error) = sink.send(forward).await {
                break Err(error.into());
            }
        }
        else {
            tracing::trace!(from_client, "message dropped");
        }

        if let Some(websocket) = &mut flow.websocket {
            websocket.messages.push(message);
        }
    };

    let _ = client_tx.close().await;
    let _ = server_tx.close().await;
    hooks.websocket_end(flow).await;
    result
}

fn record_close(flow: &mut Flow, from_client: bool, frame: Option<(u16, String)>) {
    if let Some(websocket) = &mut flow.websocket {
        websocket.closed_by_client = Some(from_client);
        if let Some((code, reason)) = frame {
            websocket.close_code = Some(code);
            websocket.close_reason = Some(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::{
        SinkExt,
        StreamExt,
    };
    use tokio_tungstenite::{
        tungstenite::{
            protocol::{
                frame::coding::CloseCode,
                CloseFrame,
                Role,
            },
            Message,
        },
        WebSocketStream,
    };
    use tokio_util::sync::CancellationToken;

    use super::relay;
    use crate::{
        config::ProxyConfig,
        connection::ClientConnection,
        flow::{
            Flow,
            WebSocketContent,
            WebSocketMessage,
        },
        hooks::Hooks,
        http::message::Request,
        layer::Context,
        proxy::Proxy,
        tls::ca::Ca,
    };

    struct Shout;

    #[async_trait]
    impl Hooks for Shout {
        async fn websocket_message(&self, _flow: &mut Flow, message: &mut WebSocketMessage) {
            match &mut message.content {
                WebSocketContent::Text(text) => *text = text.to_uppercase(),
                WebSocketContent::Binary(_) => message.drop_message(),
            }
        }
    }

    #[tokio::test]
    async fn it_relays_messages_through_the_hooks() {
        let proxy = Proxy::new(ProxyConfig::default(), Shout, Ca::generate().await.unwrap())
            .await
            .unwrap();
        let context = Context::new(proxy, ClientConnection::detached(), CancellationToken::new());
        let (client_end, proxy_client) = tokio::io::duplex(4096);
        let (proxy_server, server_end) = tokio::io::duplex(4096);

        let task = tokio::spawn(async move {
            let mut flow = Flow::new(
                ClientConnection::detached(),
                Request::get("http://example.com/chat").unwrap(),
            );
            relay(&context, &mut flow, Box::new(proxy_client), Box::new(proxy_server))
                .await
                .unwrap();
            flow
        });

        let mut client = WebSocketStream::from_raw_socket(client_end, Role::Client, None).await;
        let mut server = WebSocketStream::from_raw_socket(server_end, Role::Server, None).await;

        client.send(Message::Text("hello".to_owned())).await.unwrap();
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Message::Text("HELLO".to_owned())
        );
        client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        client.send(Message::Text("x".to_owned())).await.unwrap();
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Message::Text("X".to_owned())
        );
        server.send(Message::Text("bye".to_owned())).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("BYE".to_owned())
        );

        client
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            }))
            .await
            .unwrap();
        assert!(server.next().await.unwrap().unwrap().is_close());

        let flow = task.await.unwrap();
        let websocket = flow.websocket.unwrap();
        assert_eq!(websocket.messages.len(), 4);
        assert!(websocket.messages[1].dropped);
        assert!(!websocket.messages[3].from_client);
        assert_eq!(websocket.closed_by_client, Some(true));
        assert_eq!(websocket.close_code, Some(1000));
        assert_eq!(websocket.close_reason.as_deref(), Some("done"));
    }
}
