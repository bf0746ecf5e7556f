//! Picking the next layer by looking at the first bytes the client sends.

use std::time::Duration;

use bytes::BytesMut;

use super::{
    tcp::Passthrough,
    Context,
    Layer,
};
use crate::{
    http::{
        http1::Http1Layer,
        http2::Http2Layer,
    },
    tls::{
        client_hello::is_tls_record,
        layer::TlsLayer,
    },
    util::io::{
        read_buf_timeout,
        rewind,
        BoxedIo,
    },
};

pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// How long to wait for the client to speak first. Protocols where the server
/// speaks first end up being relayed.
const SNIFF_TIMEOUT: Duration = Duration::from_secs(3);

/// Give up on recognizing a protocol after this many bytes.
const MAX_SNIFF_LENGTH: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tls,
    Http1,
    Http2,
    Tcp,
}

/// Classifies the start of a stream. Returns `None` if more data is needed.
pub fn classify(data: &[u8], eof: bool) -> Option<Protocol> {
    if data.is_empty() {
        return eof.then_some(Protocol::Tcp);
    }

    if data[0] == 0x16 {
        if data.len() < 3 {
            return eof.then_some(Protocol::Tcp);
        }
        return Some(if is_tls_record(data) {
            Protocol::Tls
        }
        else {
            Protocol::Tcp
        });
    }

    if data.len() >= HTTP2_PREFACE.len() && data.starts_with(HTTP2_PREFACE) {
        return Some(Protocol::Http2);
    }
    let preface_prefix = HTTP2_PREFACE.starts_with(&data[..data.len().min(HTTP2_PREFACE.len())]);
    if preface_prefix && !eof {
        return None;
    }

    // a method token: uppercase letters followed by a space
    let token = data.iter().take_while(|b| b.is_ascii_uppercase()).count();
    if token < data.len() {
        return Some(if token >= 3 && data[token] == b' ' {
            Protocol::Http1
        }
        else {
            Protocol::Tcp
        });
    }

    if eof || data.len() >= MAX_SNIFF_LENGTH {
        Some(Protocol::Tcp)
    }
    else {
        None
    }
}

async fn sniff(client: &mut BoxedIo, buf: &mut BytesMut) -> Protocol {
    loop {
        if let Some(protocol) = classify(buf, false) {
            return protocol;
        }
        match read_buf_timeout(client, buf, Some(SNIFF_TIMEOUT)).await {
            Ok(0) => return classify(buf, true).unwrap_or(Protocol::Tcp),
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(%error, "sniffing failed, relaying");
                return Protocol::Tcp;
            }
        }
    }
}

/// Decides which layer handles `client` next. The sniffed bytes are put back
/// in front of the returned stream.
pub async fn next_layer(context: &Context, mut client: BoxedIo) -> (Box<dyn Layer>, BoxedIo) {
    let mut buf = BytesMut::new();
    let protocol = sniff(&mut client, &mut buf).await;
    let client = rewind(client, buf.freeze());

    let sni = context.client_tls().and_then(|tls| tls.sni);
    let address = context.server_address();
    let is_tcp = context
        .proxy()
        .filters()
        .is_tcp(address.as_ref(), sni.as_deref());

    let layer: Box<dyn Layer> = match protocol {
        Protocol::Tls => Box::new(TlsLayer::new()),
        _ if is_tcp => Box::new(Passthrough),
        Protocol::Http1 => Box::new(Http1Layer::transparent()),
        Protocol::Http2 if context.config().http2 => Box::new(Http2Layer::new()),
        Protocol::Http2 | Protocol::Tcp => Box::new(Passthrough),
    };
    tracing::debug!(?protocol, layer = layer.name(), "next layer");

    (layer, client)
}

/// Sniffs and runs the next layer.
pub async fn run_next(context: Context, client: BoxedIo) -> Result<(), crate::Error> {
    let (layer, client) = next_layer(&context, client).await;
    layer.layer(context, client).await
}
