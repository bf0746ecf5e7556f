//! HTTP/2 interception.
//!
//! Both sides get their own [`Connection`](connection::Connection) state
//! machine. The [`Http2Layer`] reads frames from both, and hands each stream
//! to a worker task that runs the flow hooks and forwards it to the other
//! side under a new stream ID.

pub mod connection;
pub mod events;
pub mod frame;
mod multiplexer;
pub mod stream;

pub use self::{
    frame::ErrorCode,
    multiplexer::Http2Layer,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("frame size error")]
    FrameSize,

    #[error("header block could not be decoded")]
    Compression,

    #[error("flow control window exceeded")]
    FlowControl,

    #[error("stream {stream_id} is closed")]
    StreamClosed { stream_id: u32 },

    #[error("stream {stream_id} was reset: {error_code}")]
    StreamReset { stream_id: u32, error_code: ErrorCode },

    /// The stream outlived its connection.
    #[error("stream {stream_id} belongs to a closed connection")]
    ZombieStream { stream_id: u32 },

    #[error("connection terminated: {error_code}")]
    ConnectionTerminated { error_code: ErrorCode },

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl Error {
    /// Error code for the GOAWAY that ends the connection because of this
    /// error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Protocol(_) | Self::InvalidMessage(_) => ErrorCode::PROTOCOL_ERROR,
            Self::FrameSize => ErrorCode::FRAME_SIZE_ERROR,
            Self::Compression => ErrorCode::COMPRESSION_ERROR,
            Self::FlowControl => ErrorCode::FLOW_CONTROL_ERROR,
            Self::StreamClosed { .. } => ErrorCode::STREAM_CLOSED,
            Self::StreamReset { error_code, .. } | Self::ConnectionTerminated { error_code } => {
                *error_code
            }
            Self::Io(_) | Self::ZombieStream { .. } => ErrorCode::INTERNAL_ERROR,
        }
    }
}
