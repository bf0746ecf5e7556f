use bytes::Bytes;

use super::frame::{
    ErrorCode,
    Priority,
};

/// Decoded header block, pseudo-headers first, names lowercase.
pub type HeaderList = Vec<(Bytes, Bytes)>;

/// What the peer did, as reported by [`Connection::receive`].
///
/// A stream's events arrive as one of the `*Received` header events, followed
/// by any [`Event::DataReceived`], optionally [`Event::TrailersReceived`] and
/// finally [`Event::StreamEnded`]. A [`Event::StreamReset`] can replace the
/// end at any point.
///
/// [`Connection::receive`]: super::connection::Connection::receive
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    RequestReceived {
        stream_id: u32,
        headers: HeaderList,
        priority: Option<Priority>,
    },
    /// Includes informational (1xx) responses, which may be followed by the
    /// final response on the same stream.
    ResponseReceived {
        stream_id: u32,
        headers: HeaderList,
    },
    TrailersReceived {
        stream_id: u32,
        headers: HeaderList,
    },
    DataReceived {
        stream_id: u32,
        data: Bytes,
        flow_controlled_length: u32,
    },
    StreamEnded {
        stream_id: u32,
    },
    StreamReset {
        stream_id: u32,
        error_code: ErrorCode,
    },
    PushedStreamReceived {
        pushed_stream_id: u32,
        parent_stream_id: u32,
        headers: HeaderList,
    },
    PriorityUpdated {
        stream_id: u32,
        priority: Priority,
    },
    /// `stream_id` is 0 for the connection window.
    WindowUpdated {
        stream_id: u32,
        delta: u32,
    },
    RemoteSettingsChanged {
        changed: Vec<(u16, u32)>,
    },
    SettingsAcknowledged,
    ConnectionTerminated {
        error_code: ErrorCode,
        last_stream_id: u32,
        additional_data: Bytes,
    },
}

impl Event {
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Self::RequestReceived { stream_id, .. }
            | Self::ResponseReceived { stream_id, .. }
            | Self::TrailersReceived { stream_id, .. }
            | Self::DataReceived { stream_id, .. }
            | Self::StreamEnded { stream_id }
            | Self::StreamReset { stream_id, .. }
            | Self::PriorityUpdated { stream_id, .. } => Some(*stream_id),
            Self::PushedStreamReceived {
                parent_stream_id, ..
            } => Some(*parent_stream_id),
            Self::WindowUpdated { stream_id, .. } if *stream_id != 0 => Some(*stream_id),
            _ => None,
        }
    }
}
