//! HTTP/2 connection state machine.
//!
//! [`Connection`] doesn't do any IO. Bytes read from the peer are fed into
//! [`Connection::receive`], which returns [`Event`]s, and everything the
//! connection wants to send accumulates until it's taken with
//! [`Connection::data_to_send`].

use std::collections::HashMap;

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};

use super::{
    events::{
        Event,
        HeaderList,
    },
    frame::{
        setting,
        ErrorCode,
        Frame,
        Priority,
        DEFAULT_MAX_FRAME_SIZE,
        DEFAULT_WINDOW_SIZE,
        MAX_MAX_FRAME_SIZE,
        MAX_WINDOW_SIZE,
    },
    Error,
};
use crate::layer::sniff::HTTP2_PREFACE;

/// Which end of the connection we are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    pub fn apply(&mut self, id: u16, value: u32) -> Result<(), Error> {
        match id {
            setting::HEADER_TABLE_SIZE => self.header_table_size = value,
            setting::ENABLE_PUSH => {
                self.enable_push = match value {
                    0 => false,
                    1 => true,
                    _ => return Err(Error::Protocol("invalid ENABLE_PUSH setting")),
                }
            }
            setting::MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
            setting::INITIAL_WINDOW_SIZE => {
                if i64::from(value) > MAX_WINDOW_SIZE {
                    return Err(Error::FlowControl);
                }
                self.initial_window_size = value;
            }
            setting::MAX_FRAME_SIZE => {
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                    return Err(Error::Protocol("invalid MAX_FRAME_SIZE setting"));
                }
                self.max_frame_size = value;
            }
            setting::MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
            // unknown settings must be ignored
            _ => {}
        }
        Ok(())
    }

    fn to_list(&self, role: Role) -> Vec<(u16, u32)> {
        let defaults = Self::default();
        let mut list = vec![];
        if self.header_table_size != defaults.header_table_size {
            list.push((setting::HEADER_TABLE_SIZE, self.header_table_size));
        }
        // servers must not send ENABLE_PUSH
        if role == Role::Client {
            list.push((setting::ENABLE_PUSH, self.enable_push.into()));
        }
        if let Some(max) = self.max_concurrent_streams {
            list.push((setting::MAX_CONCURRENT_STREAMS, max));
        }
        if self.initial_window_size != defaults.initial_window_size {
            list.push((setting::INITIAL_WINDOW_SIZE, self.initial_window_size));
        }
        if self.max_frame_size != defaults.max_frame_size {
            list.push((setting::MAX_FRAME_SIZE, self.max_frame_size));
        }
        if let Some(max) = self.max_header_list_size {
            list.push((setting::MAX_HEADER_LIST_SIZE, max));
        }
        list
    }
}

#[derive(Debug)]
struct StreamState {
    send_window: i64,
    local_closed: bool,
    remote_closed: bool,
    /// Final (non-informational) headers were received, so the next header
    /// block is the trailers.
    headers_received: bool,
}

#[derive(Debug)]
enum BlockKind {
    Headers {
        end_stream: bool,
        priority: Option<Priority>,
    },
    PushPromise {
        promised_stream_id: u32,
    },
}

/// A header block that still waits for CONTINUATION frames.
#[derive(Debug)]
struct PartialBlock {
    stream_id: u32,
    kind: BlockKind,
    block: BytesMut,
}

pub struct Connection {
    role: Role,
    decoder: hpack::Decoder<'static>,
    local_settings: Settings,
    remote_settings: Settings,
    streams: HashMap<u32, StreamState>,
    send_window: i64,
    next_stream_id: u32,
    highest_remote_stream_id: u32,
    partial_block: Option<PartialBlock>,
    preface_pending: bool,
    input: BytesMut,
    output: BytesMut,
    terminated: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("streams", &self.streams.len())
            .field("send_window", &self.send_window)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(role: Role, local_settings: Settings) -> Self {
        Self {
            role,
            decoder: hpack::Decoder::new(),
            local_settings,
            remote_settings: Settings::default(),
            streams: HashMap::new(),
            send_window: DEFAULT_WINDOW_SIZE.into(),
            next_stream_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            highest_remote_stream_id: 0,
            partial_block: None,
            preface_pending: role == Role::Server,
            input: BytesMut::new(),
            output: BytesMut::new(),
            terminated: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Queues the connection preface (for clients) and our settings.
    pub fn initiate(&mut self) {
        if self.role == Role::Client {
            self.output.put_slice(HTTP2_PREFACE);
        }
        let settings = self.local_settings.to_list(self.role);
        self.write(&Frame::Settings {
            ack: false,
            settings,
        });
    }

    pub fn data_to_send(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    fn write(&mut self, frame: &Frame) {
        frame.encode(&mut self.output);
    }

    /// Stream IDs are handed out in increasing order. Clients get odd IDs,
    /// servers get even IDs for pushed streams.
    pub fn next_stream_id(&mut self) -> u32 {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        stream_id
    }

    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<Event>, Error> {
        self.input.extend_from_slice(data);

        if self.preface_pending {
            let length = self.input.len().min(HTTP2_PREFACE.len());
            if self.input[..length] != HTTP2_PREFACE[..length] {
                return Err(Error::Protocol("invalid connection preface"));
            }
            if length < HTTP2_PREFACE.len() {
                return Ok(vec![]);
            }
            self.input.advance(HTTP2_PREFACE.len());
            self.preface_pending = false;
        }

        let mut events = vec![];
        while let Some(frame) = Frame::decode(&mut self.input, self.local_settings.max_frame_size)? {
            self.receive_frame(frame, &mut events)?;
        }
        Ok(events)
    }

    fn receive_frame(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<(), Error> {
        // header blocks must be contiguous
        if let Some(partial) = &self.partial_block {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == partial.stream_id => {}
                _ => return Err(Error::Protocol("expected CONTINUATION frame")),
            }
        }

        match frame {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                flow_controlled_length,
            } => {
                match self.streams.get_mut(&stream_id) {
                    Some(stream) if !stream.remote_closed => {
                        events.push(Event::DataReceived {
                            stream_id,
                            data,
                            flow_controlled_length,
                        });
                        if end_stream {
                            stream.remote_closed = true;
                            events.push(Event::StreamEnded { stream_id });
                            self.remove_if_closed(stream_id);
                        }
                    }
                    _ => {
                        // the data still counts against the connection window
                        if flow_controlled_length > 0 {
                            self.write(&Frame::WindowUpdate {
                                stream_id: 0,
                                increment: flow_controlled_length,
                            });
                        }
                        self.write(&Frame::RstStream {
                            stream_id,
                            error_code: ErrorCode::STREAM_CLOSED,
                        });
                    }
                }
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => {
                self.begin_block(
                    PartialBlock {
                        stream_id,
                        kind: BlockKind::Headers {
                            end_stream,
                            priority,
                        },
                        block: BytesMut::from(&block[..]),
                    },
                    end_headers,
                    events,
                )?;
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                block,
                end_headers,
            } => {
                if self.role == Role::Server || !self.local_settings.enable_push {
                    return Err(Error::Protocol("unexpected PUSH_PROMISE"));
                }
                self.begin_block(
                    PartialBlock {
                        stream_id,
                        kind: BlockKind::PushPromise { promised_stream_id },
                        block: BytesMut::from(&block[..]),
                    },
                    end_headers,
                    events,
                )?;
            }
            Frame::Continuation {
                block, end_headers, ..
            } => {
                let Some(mut partial) = self.partial_block.take()
                else {
                    return Err(Error::Protocol("unexpected CONTINUATION frame"));
                };
                partial.block.extend_from_slice(&block);
                if end_headers {
                    self.finish_block(partial, events)?;
                }
                else {
                    self.partial_block = Some(partial);
                }
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                events.push(Event::PriorityUpdated {
                    stream_id,
                    priority,
                });
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                if self.streams.remove(&stream_id).is_some() {
                    events.push(Event::StreamReset {
                        stream_id,
                        error_code,
                    });
                }
            }
            Frame::Settings { ack: true, .. } => events.push(Event::SettingsAcknowledged),
            Frame::Settings {
                ack: false,
                settings,
            } => {
                for (id, value) in &settings {
                    if *id == setting::INITIAL_WINDOW_SIZE {
                        let delta =
                            i64::from(*value) - i64::from(self.remote_settings.initial_window_size);
                        for stream in self.streams.values_mut() {
                            stream.send_window += delta;
                            if stream.send_window > MAX_WINDOW_SIZE {
                                return Err(Error::FlowControl);
                            }
                        }
                    }
                    self.remote_settings.apply(*id, *value)?;
                }
                self.write(&Frame::Settings {
                    ack: true,
                    settings: vec![],
                });
                events.push(Event::RemoteSettingsChanged { changed: settings });
            }
            Frame::Ping {
                ack: false,
                payload,
            } => {
                self.write(&Frame::Ping { ack: true, payload });
            }
            Frame::Ping { ack: true, .. } => {}
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                self.terminated = true;
                events.push(Event::ConnectionTerminated {
                    error_code,
                    last_stream_id,
                    additional_data: debug_data,
                });
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                if stream_id == 0 {
                    if increment == 0 {
                        return Err(Error::Protocol("zero window increment"));
                    }
                    self.send_window += i64::from(increment);
                    if self.send_window > MAX_WINDOW_SIZE {
                        return Err(Error::FlowControl);
                    }
                }
                else if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.send_window += i64::from(increment);
                    if increment == 0 || stream.send_window > MAX_WINDOW_SIZE {
                        let error_code = if increment == 0 {
                            ErrorCode::PROTOCOL_ERROR
                        }
                        else {
                            ErrorCode::FLOW_CONTROL_ERROR
                        };
                        self.reset_stream(stream_id, error_code);
                        events.push(Event::StreamReset {
                            stream_id,
                            error_code,
                        });
                        return Ok(());
                    }
                }
                events.push(Event::WindowUpdated {
                    stream_id,
                    delta: increment,
                });
            }
            Frame::Unknown { .. } => {}
        }

        Ok(())
    }

    fn begin_block(
        &mut self,
        partial: PartialBlock,
        end_headers: bool,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        if end_headers {
            self.finish_block(partial, events)
        }
        else {
            self.partial_block = Some(partial);
            Ok(())
        }
    }

    fn finish_block(&mut self, partial: PartialBlock, events: &mut Vec<Event>) -> Result<(), Error> {
        // always decode, so that the decoder's table stays in sync
        let headers = self
            .decoder
            .decode(&partial.block)
            .map_err(|_| Error::Compression)?
            .into_iter()
            .map(|(name, value)| (Bytes::from(name), Bytes::from(value)))
            .collect::<HeaderList>();
        let stream_id = partial.stream_id;

        match partial.kind {
            BlockKind::PushPromise { promised_stream_id } => {
                if promised_stream_id % 2 != 0 || promised_stream_id <= self.highest_remote_stream_id
                {
                    return Err(Error::Protocol("invalid promised stream id"));
                }
                self.highest_remote_stream_id = promised_stream_id;
                self.streams.insert(
                    promised_stream_id,
                    StreamState {
                        send_window: self.remote_settings.initial_window_size.into(),
                        local_closed: true,
                        remote_closed: false,
                        headers_received: false,
                    },
                );
                events.push(Event::PushedStreamReceived {
                    pushed_stream_id: promised_stream_id,
                    parent_stream_id: stream_id,
                    headers,
                });
            }
            BlockKind::Headers {
                end_stream,
                priority,
            } => {
                let Some(stream) = self.streams.get_mut(&stream_id)
                else {
                    return self.open_remote_stream(stream_id, headers, end_stream, priority, events);
                };

                if stream.remote_closed {
                    self.write(&Frame::RstStream {
                        stream_id,
                        error_code: ErrorCode::STREAM_CLOSED,
                    });
                    return Ok(());
                }

                if stream.headers_received {
                    if !end_stream {
                        return Err(Error::Protocol("trailers without END_STREAM"));
                    }
                    events.push(Event::TrailersReceived { stream_id, headers });
                }
                else {
                    if !is_informational(&headers) {
                        stream.headers_received = true;
                    }
                    events.push(Event::ResponseReceived { stream_id, headers });
                }

                if end_stream {
                    stream.remote_closed = true;
                    events.push(Event::StreamEnded { stream_id });
                    self.remove_if_closed(stream_id);
                }
            }
        }

        Ok(())
    }

    fn open_remote_stream(
        &mut self,
        stream_id: u32,
        headers: HeaderList,
        end_stream: bool,
        priority: Option<Priority>,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        if self.role == Role::Client || stream_id <= self.highest_remote_stream_id {
            // a stream that was already closed
            self.write(&Frame::RstStream {
                stream_id,
                error_code: ErrorCode::STREAM_CLOSED,
            });
            return Ok(());
        }
        if stream_id % 2 == 0 {
            return Err(Error::Protocol("client opened a stream with an even id"));
        }
        self.highest_remote_stream_id = stream_id;

        if let Some(max) = self.local_settings.max_concurrent_streams {
            let open = self.streams.keys().filter(|id| *id % 2 == 1).count();
            if open >= max as usize {
                self.write(&Frame::RstStream {
                    stream_id,
                    error_code: ErrorCode::REFUSED_STREAM,
                });
                return Ok(());
            }
        }

        self.streams.insert(
            stream_id,
            StreamState {
                send_window: self.remote_settings.initial_window_size.into(),
                local_closed: false,
                remote_closed: end_stream,
                headers_received: true,
            },
        );
        events.push(Event::RequestReceived {
            stream_id,
            headers,
            priority,
        });
        if end_stream {
            events.push(Event::StreamEnded { stream_id });
        }
        Ok(())
    }

    fn remove_if_closed(&mut self, stream_id: u32) {
        if self
            .streams
            .get(&stream_id)
            .map_or(false, |stream| stream.local_closed && stream.remote_closed)
        {
            self.streams.remove(&stream_id);
        }
    }

    fn write_header_block(&mut self, stream_id: u32, mut block: Bytes, first: impl FnOnce(Bytes, bool) -> Frame) {
        // leave room for the priority or promised stream id
        let max = self.remote_settings.max_frame_size as usize - 5;
        let head = block.split_to(block.len().min(max));
        let frame = first(head, block.is_empty());
        self.write(&frame);
        while !block.is_empty() {
            let chunk = block.split_to(block.len().min(max));
            self.write(&Frame::Continuation {
                stream_id,
                block: chunk,
                end_headers: block.is_empty(),
            });
        }
    }

    /// Sends a header block, opening the stream if we are the client and it
    /// doesn't exist yet. The HEADERS frame and its CONTINUATION frames are
    /// queued back to back.
    pub fn send_headers(
        &mut self,
        stream_id: u32,
        headers: &[(Bytes, Bytes)],
        end_stream: bool,
        priority: Option<Priority>,
    ) -> Result<(), Error> {
        if !self.streams.contains_key(&stream_id) {
            if self.role == Role::Server || self.terminated {
                return Err(Error::StreamClosed { stream_id });
            }
            self.streams.insert(
                stream_id,
                StreamState {
                    send_window: self.remote_settings.initial_window_size.into(),
                    local_closed: false,
                    remote_closed: false,
                    headers_received: false,
                },
            );
        }

        let stream = self
            .streams
            .get_mut(&stream_id)
            .filter(|stream| !stream.local_closed)
            .ok_or(Error::StreamClosed { stream_id })?;
        if end_stream {
            stream.local_closed = true;
        }

        let block = encode_headers(headers);
        self.write_header_block(stream_id, block, |block, end_headers| {
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            }
        });
        self.remove_if_closed(stream_id);
        Ok(())
    }

    /// Sends one DATA frame. The caller must respect
    /// [`local_flow_control_window`](Self::local_flow_control_window) and
    /// [`max_outbound_frame_size`](Self::max_outbound_frame_size).
    pub fn send_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool) -> Result<(), Error> {
        if data.len() > self.max_outbound_frame_size() {
            return Err(Error::FrameSize);
        }
        let length = data.len() as i64;
        let connection_window = self.send_window;
        let stream = self
            .streams
            .get_mut(&stream_id)
            .filter(|stream| !stream.local_closed)
            .ok_or(Error::StreamClosed { stream_id })?;
        if length > stream.send_window.min(connection_window) {
            return Err(Error::FlowControl);
        }
        stream.send_window -= length;
        if end_stream {
            stream.local_closed = true;
        }
        self.send_window -= length;

        self.write(&Frame::data(stream_id, data, end_stream));
        self.remove_if_closed(stream_id);
        Ok(())
    }

    /// Resets a stream. Unknown or closed streams are ignored.
    pub fn reset_stream(&mut self, stream_id: u32, error_code: ErrorCode) {
        if self.streams.remove(&stream_id).is_some() {
            self.write(&Frame::RstStream {
                stream_id,
                error_code,
            });
        }
    }

    /// Promises a pushed stream on `parent_stream_id`.
    pub fn push_stream(
        &mut self,
        parent_stream_id: u32,
        promised_stream_id: u32,
        headers: &[(Bytes, Bytes)],
    ) -> Result<(), Error> {
        if self.role != Role::Server || !self.remote_settings.enable_push {
            return Err(Error::Protocol("push is disabled"));
        }
        if !self
            .streams
            .get(&parent_stream_id)
            .map_or(false, |stream| !stream.local_closed)
        {
            return Err(Error::StreamClosed {
                stream_id: parent_stream_id,
            });
        }

        self.streams.insert(
            promised_stream_id,
            StreamState {
                send_window: self.remote_settings.initial_window_size.into(),
                local_closed: false,
                remote_closed: true,
                headers_received: true,
            },
        );

        let block = encode_headers(headers);
        self.write_header_block(parent_stream_id, block, |block, end_headers| {
            Frame::PushPromise {
                stream_id: parent_stream_id,
                promised_stream_id,
                block,
                end_headers,
            }
        });
        Ok(())
    }

    pub fn send_priority(&mut self, stream_id: u32, priority: Priority) {
        self.write(&Frame::Priority {
            stream_id,
            priority,
        });
    }

    /// Changes our settings and announces them to the peer.
    pub fn update_settings(&mut self, settings: Vec<(u16, u32)>) -> Result<(), Error> {
        for (id, value) in &settings {
            self.local_settings.apply(*id, *value)?;
        }
        self.write(&Frame::Settings {
            ack: false,
            settings,
        });
        Ok(())
    }

    /// Gives the peer back connection window it used up with received data.
    pub fn release_connection_window(&mut self, length: u32) {
        if length > 0 {
            self.write(&Frame::WindowUpdate {
                stream_id: 0,
                increment: length,
            });
        }
    }

    /// Gives the peer back stream window, once the data was consumed. Streams
    /// the peer finished sending on are skipped.
    pub fn release_stream_window(&mut self, stream_id: u32, length: u32) {
        if length > 0
            && self
                .streams
                .get(&stream_id)
                .map_or(false, |stream| !stream.remote_closed)
        {
            self.write(&Frame::WindowUpdate {
                stream_id,
                increment: length,
            });
        }
    }

    /// How many bytes may be sent on a stream right now. Can be negative
    /// after the peer shrunk its initial window.
    pub fn local_flow_control_window(&self, stream_id: u32) -> Result<i64, Error> {
        let stream = self
            .streams
            .get(&stream_id)
            .filter(|stream| !stream.local_closed)
            .ok_or(Error::StreamClosed { stream_id })?;
        Ok(stream.send_window.min(self.send_window))
    }

    pub fn max_outbound_frame_size(&self) -> usize {
        self.remote_settings.max_frame_size as usize
    }

    /// Sends GOAWAY.
    pub fn close(&mut self, error_code: ErrorCode) {
        self.write(&Frame::GoAway {
            last_stream_id: self.highest_remote_stream_id,
            error_code,
            debug_data: Bytes::new(),
        });
        self.terminated = true;
    }
}

fn is_informational(headers: &HeaderList) -> bool {
    headers
        .iter()
        .find(|(name, _)| &name[..] == b":status")
        .map_or(false, |(_, value)| value.starts_with(b"1"))
}

/// Encodes headers as literals without indexing, so the peer's dynamic table
/// size doesn't matter.
fn encode_headers(headers: &[(Bytes, Bytes)]) -> Bytes {
    let mut buf = BytesMut::new();
    for (name, value) in headers {
        buf.put_u8(0);
        encode_string(&mut buf, name);
        encode_string(&mut buf, value);
    }
    buf.freeze()
}

fn encode_string(buf: &mut BytesMut, data: &[u8]) {
    encode_integer(buf, data.len(), 7);
    buf.put_slice(data);
}

fn encode_integer(buf: &mut BytesMut, value: usize, prefix_bits: u8) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        buf.put_u8(value as u8);
        return;
    }
    buf.put_u8(max as u8);
    let mut rest = value - max;
    while rest >= 128 {
        buf.put_u8((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    buf.put_u8(rest as u8);
}
