//! HTTP/2 frame codec.

use std::fmt::Display;

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};

use super::Error;

pub const FRAME_HEADER_LENGTH: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub const MAX_WINDOW_SIZE: i64 = (1 << 31) - 1;

mod kind {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Setting identifiers.
pub mod setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_ERROR: Self = Self(0x0);
    pub const PROTOCOL_ERROR: Self = Self(0x1);
    pub const INTERNAL_ERROR: Self = Self(0x2);
    pub const FLOW_CONTROL_ERROR: Self = Self(0x3);
    pub const SETTINGS_TIMEOUT: Self = Self(0x4);
    pub const STREAM_CLOSED: Self = Self(0x5);
    pub const FRAME_SIZE_ERROR: Self = Self(0x6);
    pub const REFUSED_STREAM: Self = Self(0x7);
    pub const CANCEL: Self = Self(0x8);
    pub const COMPRESSION_ERROR: Self = Self(0x9);
    pub const CONNECT_ERROR: Self = Self(0xa);
    pub const ENHANCE_YOUR_CALM: Self = Self(0xb);
    pub const INADEQUATE_SECURITY: Self = Self(0xc);
    pub const HTTP_1_1_REQUIRED: Self = Self(0xd);

    fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Self::NO_ERROR => "NO_ERROR",
            Self::PROTOCOL_ERROR => "PROTOCOL_ERROR",
            Self::INTERNAL_ERROR => "INTERNAL_ERROR",
            Self::FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            Self::SETTINGS_TIMEOUT => "SETTINGS_TIMEOUT",
            Self::STREAM_CLOSED => "STREAM_CLOSED",
            Self::FRAME_SIZE_ERROR => "FRAME_SIZE_ERROR",
            Self::REFUSED_STREAM => "REFUSED_STREAM",
            Self::CANCEL => "CANCEL",
            Self::COMPRESSION_ERROR => "COMPRESSION_ERROR",
            Self::CONNECT_ERROR => "CONNECT_ERROR",
            Self::ENHANCE_YOUR_CALM => "ENHANCE_YOUR_CALM",
            Self::INADEQUATE_SECURITY => "INADEQUATE_SECURITY",
            Self::HTTP_1_1_REQUIRED => "HTTP_1_1_REQUIRED",
            _ => return None,
        })
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:x}", self.0),
        }
    }
}

/// Stream dependency and weight. `weight` is the wire value, so the actual
/// weight is `weight + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub depends_on: u32,
    pub weight: u8,
}

impl Priority {
    fn decode(data: &[u8]) -> Self {
        let dependency = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Self {
            exclusive: dependency & 0x8000_0000 != 0,
            depends_on: dependency & 0x7fff_ffff,
            weight: data[4],
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        let exclusive = if self.exclusive { 0x8000_0000 } else { 0 };
        buf.put_u32(self.depends_on | exclusive);
        buf.put_u8(self.weight);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Length including padding, which counts against flow control.
        flow_controlled_length: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    Priority {
        stream_id: u32,
        priority: Priority,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// Frames of unknown type are ignored.
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

impl Frame {
    pub fn data(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        let flow_controlled_length = data.len() as u32;
        Self::Data {
            stream_id,
            data,
            end_stream,
            flow_controlled_length,
        }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Data { stream_id, .. }
            | Self::Headers { stream_id, .. }
            | Self::Priority { stream_id, .. }
            | Self::RstStream { stream_id, .. }
            | Self::PushPromise { stream_id, .. }
            | Self::WindowUpdate { stream_id, .. }
            | Self::Continuation { stream_id, .. }
            | Self::Unknown { stream_id, .. } => *stream_id,
            Self::Settings { .. } | Self::Ping { .. } | Self::GoAway { .. } => 0,
        }
    }

    /// Decodes one frame from the start of `buf`. Returns `None` if the frame
    /// isn't complete yet.
    pub fn decode(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Self>, Error> {
        if buf.len() < FRAME_HEADER_LENGTH {
            return Ok(None);
        }
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        if length > max_frame_size {
            return Err(Error::FrameSize);
        }
        if buf.len() < FRAME_HEADER_LENGTH + length as usize {
            return Ok(None);
        }

        let kind = buf[3];
        let flags = buf[4];
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
        buf.advance(FRAME_HEADER_LENGTH);
        let mut payload = buf.split_to(length as usize).freeze();

        let needs_stream = |stream_id: u32| {
            if stream_id == 0 {
                Err(Error::Protocol("frame needs a stream"))
            }
            else {
                Ok(())
            }
        };
        let needs_connection = |stream_id: u32| {
            if stream_id != 0 {
                Err(Error::Protocol("frame can't have a stream"))
            }
            else {
                Ok(())
            }
        };

        let frame = match kind {
            kind::DATA => {
                needs_stream(stream_id)?;
                let data = strip_padding(payload, flags)?;
                Self::Data {
                    stream_id,
                    data,
                    end_stream: flags & flags::END_STREAM != 0,
                    flow_controlled_length: length,
                }
            }
            kind::HEADERS => {
                needs_stream(stream_id)?;
                let mut block = strip_padding(payload, flags)?;
                let priority = if flags & flags::PRIORITY != 0 {
                    if block.len() < 5 {
                        return Err(Error::FrameSize);
                    }
                    let priority = Priority::decode(&block[..5]);
                    block.advance(5);
                    Some(priority)
                }
                else {
                    None
                };
                Self::Headers {
                    stream_id,
                    block,
                    end_stream: flags & flags::END_STREAM != 0,
                    end_headers: flags & flags::END_HEADERS != 0,
                    priority,
                }
            }
            kind::PRIORITY => {
                needs_stream(stream_id)?;
                if payload.len() != 5 {
                    return Err(Error::FrameSize);
                }
                Self::Priority {
                    stream_id,
                    priority: Priority::decode(&payload),
                }
            }
            kind::RST_STREAM => {
                needs_stream(stream_id)?;
                if payload.len() != 4 {
                    return Err(Error::FrameSize);
                }
                Self::RstStream {
                    stream_id,
                    error_code: ErrorCode(payload.get_u32()),
                }
            }
            kind::SETTINGS => {
                needs_connection(stream_id)?;
                let ack = flags & flags::ACK != 0;
                if payload.len() % 6 != 0 || (ack && !payload.is_empty()) {
                    return Err(Error::FrameSize);
                }
                let mut settings = Vec::with_capacity(payload.len() / 6);
                while payload.has_remaining() {
                    settings.push((payload.get_u16(), payload.get_u32()));
                }
                Self::Settings { ack, settings }
            }
            kind::PUSH_PROMISE => {
                needs_stream(stream_id)?;
                let mut block = strip_padding(payload, flags)?;
                if block.len() < 4 {
                    return Err(Error::FrameSize);
                }
                let promised_stream_id = block.get_u32() & 0x7fff_ffff;
                Self::PushPromise {
                    stream_id,
                    promised_stream_id,
                    block,
                    end_headers: flags & flags::END_HEADERS != 0,
                }
            }
            kind::PING => {
                needs_connection(stream_id)?;
                let payload: [u8; 8] = payload[..]
                    .try_into()
                    .map_err(|_| Error::FrameSize)?;
                Self::Ping {
                    ack: flags & flags::ACK != 0,
                    payload,
                }
            }
            kind::GOAWAY => {
                needs_connection(stream_id)?;
                if payload.len() < 8 {
                    return Err(Error::FrameSize);
                }
                let last_stream_id = payload.get_u32() & 0x7fff_ffff;
                let error_code = ErrorCode(payload.get_u32());
                Self::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data: payload,
                }
            }
            kind::WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(Error::FrameSize);
                }
                Self::WindowUpdate {
                    stream_id,
                    increment: payload.get_u32() & 0x7fff_ffff,
                }
            }
            kind::CONTINUATION => {
                needs_stream(stream_id)?;
                Self::Continuation {
                    stream_id,
                    block: payload,
                    end_headers: flags & flags::END_HEADERS != 0,
                }
            }
            kind => Self::Unknown { kind, stream_id },
        };

        Ok(Some(frame))
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();
        // the length is filled in once the payload is written
        buf.put_slice(&[0, 0, 0]);

        match self {
            Self::Data {
                stream_id,
                data,
                end_stream,
                ..
            } => {
                put_header(buf, kind::DATA, flag(*end_stream, flags::END_STREAM), *stream_id);
                buf.put_slice(data);
            }
            Self::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => {
                let flags = flag(*end_stream, flags::END_STREAM)
                    | flag(*end_headers, flags::END_HEADERS)
                    | flag(priority.is_some(), flags::PRIORITY);
                put_header(buf, kind::HEADERS, flags, *stream_id);
                if let Some(priority) = priority {
                    priority.encode(buf);
                }
                buf.put_slice(block);
            }
            Self::Priority {
                stream_id,
                priority,
            } => {
                put_header(buf, kind::PRIORITY, 0, *stream_id);
                priority.encode(buf);
            }
            Self::RstStream {
                stream_id,
                error_code,
            } => {
                put_header(buf, kind::RST_STREAM, 0, *stream_id);
                buf.put_u32(error_code.0);
            }
            Self::Settings { ack, settings } => {
                put_header(buf, kind::SETTINGS, flag(*ack, flags::ACK), 0);
                for (id, value) in settings {
                    buf.put_u16(*id);
                    buf.put_u32(*value);
                }
            }
            Self::PushPromise {
                stream_id,
                promised_stream_id,
                block,
                end_headers,
            } => {
                put_header(
                    buf,
                    kind::PUSH_PROMISE,
                    flag(*end_headers, flags::END_HEADERS),
                    *stream_id,
                );
                buf.put_u32(*promised_stream_id);
                buf.put_slice(block);
            }
            Self::Ping { ack, payload } => {
                put_header(buf, kind::PING, flag(*ack, flags::ACK), 0);
                buf.put_slice(payload);
            }
            Self::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                put_header(buf, kind::GOAWAY, 0, 0);
                buf.put_u32(*last_stream_id);
                buf.put_u32(error_code.0);
                buf.put_slice(debug_data);
            }
            Self::WindowUpdate {
                stream_id,
                increment,
            } => {
                put_header(buf, kind::WINDOW_UPDATE, 0, *stream_id);
                buf.put_u32(*increment);
            }
            Self::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                put_header(
                    buf,
                    kind::CONTINUATION,
                    flag(*end_headers, flags::END_HEADERS),
                    *stream_id,
                );
                buf.put_slice(block);
            }
            Self::Unknown { .. } => {
                buf.truncate(start);
                return;
            }
        }

        let length = (buf.len() - start - FRAME_HEADER_LENGTH) as u32;
        buf[start..start + 3].copy_from_slice(&length.to_be_bytes()[1..]);
    }
}

fn flag(set: bool, flag: u8) -> u8 {
    if set {
        flag
    }
    else {
        0
    }
}

fn put_header(buf: &mut BytesMut, kind: u8, flags: u8, stream_id: u32) {
    buf.put_u8(kind);
    buf.put_u8(flags);
    buf.put_u32(stream_id & 0x7fff_ffff);
}

fn strip_padding(mut payload: Bytes, flags: u8) -> Result<Bytes, Error> {
    if flags & flags::PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(Error::Protocol("padded frame without pad length"));
    }
    let padding = payload.get_u8() as usize;
    if padding > payload.len() {
        return Err(Error::Protocol("padding exceeds the frame"));
    }
    Ok(payload.slice(..payload.len() - padding))
}

#[cfg(test)]
mod tests {
    use bytes::{
        Bytes,
        BytesMut,
    };

    use super::{
        ErrorCode,
        Frame,
        Priority,
        DEFAULT_MAX_FRAME_SIZE,
    };
    use crate::http::http2::Error;

    fn decode_all(data: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(data);
        let mut frames = vec![];
        while let Some(frame) = Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            frames.push(frame);
        }
        assert!(buf.is_empty());
        frames
    }

    #[test]
    fn it_encodes_frames_it_decodes() {
        let frames = vec![
            Frame::Headers {
                stream_id: 1,
                block: Bytes::from_static(b"\x82\x86"),
                end_stream: false,
                end_headers: true,
                priority: Some(Priority {
                    exclusive: true,
                    depends_on: 3,
                    weight: 15,
                }),
            },
            Frame::data(1, Bytes::from_static(b"body"), true),
            Frame::Settings {
                ack: false,
                settings: vec![(4, 1 << 20), (2, 0)],
            },
            Frame::GoAway {
                last_stream_id: 7,
                error_code: ErrorCode::ENHANCE_YOUR_CALM,
                debug_data: Bytes::from_static(b"bye"),
            },
        ];

        let mut buf = BytesMut::new();
        for frame in &frames {
            frame.encode(&mut buf);
        }
        assert_eq!(decode_all(&buf), frames);
    }

    #[test]
    fn it_strips_padding() {
        // DATA, PADDED | END_STREAM, stream 1, pad length 2
        let data = b"\x00\x00\x05\x00\x09\x00\x00\x00\x01\x02abXX";
        assert_eq!(
            decode_all(data),
            vec![Frame::Data {
                stream_id: 1,
                data: Bytes::from_static(b"ab"),
                end_stream: true,
                flow_controlled_length: 5,
            }]
        );
    }

    #[test]
    fn it_waits_for_complete_frames() {
        let mut buf = BytesMut::from(&b"\x00\x00\x04\x00\x00\x00\x00\x00\x01ab"[..]);
        assert!(Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().is_none());
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn it_rejects_invalid_frames() {
        let mut oversized = BytesMut::from(&b"\x00\x40\x01\x00\x00\x00\x00\x00\x01"[..]);
        assert!(matches!(
            Frame::decode(&mut oversized, DEFAULT_MAX_FRAME_SIZE),
            Err(Error::FrameSize)
        ));

        let mut data_without_stream = BytesMut::from(&b"\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        assert!(matches!(
            Frame::decode(&mut data_without_stream, DEFAULT_MAX_FRAME_SIZE),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn it_displays_error_codes() {
        assert_eq!(ErrorCode::CANCEL.to_string(), "CANCEL");
        assert_eq!(ErrorCode(0x42).to_string(), "0x42");
    }
}
