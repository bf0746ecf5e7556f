//! HTTP engines.
//!
//! [`http1`] and [`http2`] parse and serialize their wire formats and drive
//! [`Flow`](crate::flow::Flow)s through the hooks via [`exchange`]. A `101
//! Switching Protocols` answer to a WebSocket upgrade hands the connection to
//! [`websocket`].

pub mod exchange;
pub mod http1;
pub mod http2;
pub mod message;
pub mod websocket;

use http::StatusCode;

use crate::{
    address::TcpAddress,
    util::io::is_disconnect,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[source] std::io::Error),

    #[error("read timed out")]
    Timeout,

    #[error("peer disconnected")]
    Disconnected,

    #[error("malformed message: {0}")]
    Syntax(String),

    #[error("message head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("message body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("connection closed before the body was complete")]
    IncompleteBody,

    #[error("could not connect to {address}")]
    Connect {
        address: TcpAddress,
        #[source]
        error: std::io::Error,
    },

    #[error("tls handshake with {address} failed")]
    ServerTls {
        address: TcpAddress,
        #[source]
        error: crate::tls::Error,
    },

    #[error("server closed the connection without a response")]
    NoResponse,

    #[error("{0}")]
    Unsupported(&'static str),

    #[error("http/2 error")]
    Http2(#[from] http2::Error),

    #[error("websocket error")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("flow was killed")]
    Killed(#[from] crate::flow::Killed),
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::TimedOut {
            Self::Timeout
        }
        else if is_disconnect(&error) {
            Self::Disconnected
        }
        else {
            Self::Io(error)
        }
    }
}

impl Error {
    /// Status code of the response the proxy sends when this error ends an
    /// exchange before the server answered.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Syntax(_) | Self::HeadTooLarge { .. } => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether retrying on a new server connection could help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Disconnected
                | Self::NoResponse
                | Self::IncompleteBody
                | Self::Connect { .. }
        )
    }
}
