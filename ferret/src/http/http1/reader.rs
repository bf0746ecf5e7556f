//! Buffered reading of HTTP/1 messages.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{
    Buf,
    Bytes,
    BytesMut,
};
use http::HeaderMap;
use tokio::io::AsyncRead;

use super::parse::{
    header_map,
    parse_request_head,
    parse_response_head,
    BodySize,
};
use crate::{
    flow::BodyStream,
    http::{
        message::{
            Request,
            Response,
        },
        Error,
    },
    util::io::read_buf_timeout,
};

/// Longest chunk size line we accept.
const MAX_CHUNK_LINE_LENGTH: usize = 4096;

/// Reads HTTP/1 messages from a stream. Bytes read past the end of one message
/// stay buffered for the next.
#[derive(Debug)]
pub struct Reader<T> {
    io: T,
    buf: BytesMut,
    timeout: Option<Duration>,
    head_limit: usize,
    received: usize,
}

impl<T: AsyncRead + Unpin> Reader<T> {
    pub fn new(io: T, timeout: Option<Duration>, head_limit: usize) -> Self {
        Self {
            io,
            buf: BytesMut::new(),
            timeout,
            head_limit,
            received: 0,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.io
    }

    pub fn into_parts(self) -> (T, BytesMut) {
        (self.io, self.buf)
    }

    /// Number of bytes received since the last [`Reader::reset_received`].
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn reset_received(&mut self) {
        self.received = 0;
    }

    async fn fill(&mut self) -> Result<usize, Error> {
        let n = read_buf_timeout(&mut self.io, &mut self.buf, self.timeout).await?;
        self.received += n;
        Ok(n)
    }

    /// Reads a request head. Returns `None` if the stream ended cleanly before
    /// a new request started.
    pub async fn read_request(&mut self) -> Result<Option<Request>, Error> {
        self.read_head(parse_request_head).await
    }

    pub async fn read_response(&mut self) -> Result<Response, Error> {
        self.read_head(parse_response_head)
            .await?
            .ok_or(Error::NoResponse)
    }

    async fn read_head<H>(
        &mut self,
        parse: impl Fn(&[u8]) -> Result<Option<(H, usize)>, Error>,
    ) -> Result<Option<H>, Error> {
        loop {
            // empty lines before a message are ignored
            while self.buf.starts_with(b"\r\n") || self.buf.starts_with(b"\n") {
                let n = if self.buf[0] == b'\r' { 2 } else { 1 };
                self.buf.advance(n);
            }

            if !self.buf.is_empty() {
                if let Some((head, length)) = parse(&self.buf)? {
                    self.buf.advance(length);
                    return Ok(Some(head));
                }
                if self.buf.len() > self.head_limit {
                    return Err(Error::HeadTooLarge {
                        limit: self.head_limit,
                    });
                }
            }

            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Syntax("connection closed in message head".to_owned()));
            }
        }
    }

    /// Reads a body framed as `size`. Fails with [`Error::BodyTooLarge`] once
    /// it exceeds `limit`.
    pub fn body(&mut self, size: BodySize, limit: Option<usize>) -> Result<BodyReader<'_, T>, Error> {
        let state = match size {
            BodySize::Known(length) => {
                if let Some(limit) = limit {
                    if length > limit as u64 {
                        return Err(Error::BodyTooLarge { limit });
                    }
                }
                BodyState::Known { remaining: length }
            }
            BodySize::Chunked => BodyState::ChunkSize,
            BodySize::UntilEof => BodyState::UntilEof,
        };

        Ok(BodyReader {
            reader: self,
            state,
            limit,
            read: 0,
            trailers: None,
        })
    }
}

#[derive(Clone, Copy, Debug)]
enum BodyState {
    Known { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailers,
    UntilEof,
    Done,
}

/// A message body being read chunk by chunk.
#[derive(Debug)]
pub struct BodyReader<'a, T> {
    reader: &'a mut Reader<T>,
    state: BodyState,
    limit: Option<usize>,
    read: usize,
    trailers: Option<HeaderMap>,
}

impl<'a, T: AsyncRead + Unpin> BodyReader<'a, T> {
    /// Returns the next piece of the body, or `None` at its end.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            match self.state {
                BodyState::Done => return Ok(None),
                BodyState::Known { remaining: 0 } => {
                    self.state = BodyState::Done;
                    return Ok(None);
                }
                BodyState::Known { remaining } => {
                    let chunk = self.take_data(remaining).await?;
                    self.state = BodyState::Known {
                        remaining: remaining - chunk.len() as u64,
                    };
                    return Ok(Some(chunk));
                }
                BodyState::UntilEof => {
                    if self.reader.buf.is_empty() && self.reader.fill().await? == 0 {
                        self.state = BodyState::Done;
                        return Ok(None);
                    }
                    let chunk = self.reader.buf.split().freeze();
                    self.count(chunk.len())?;
                    return Ok(Some(chunk));
                }
                BodyState::ChunkSize => {
                    let line = self.read_line().await?;
                    let size = line.split(|b| *b == b';').next().unwrap_or_default();
                    let size = std::str::from_utf8(size)
                        .ok()
                        .and_then(|size| u64::from_str_radix(size.trim(), 16).ok())
                        .ok_or_else(|| Error::Syntax("invalid chunk size".to_owned()))?;
                    if size == 0 {
                        self.state = BodyState::Trailers;
                    }
                    else {
                        self.count(usize::try_from(size).unwrap_or(usize::MAX))?;
                        self.state = BodyState::ChunkData { remaining: size };
                    }
                }
                BodyState::ChunkData { remaining } => {
                    let chunk = self.take_data(remaining).await?;
                    let remaining = remaining - chunk.len() as u64;
                    self.state = if remaining == 0 {
                        BodyState::ChunkEnd
                    }
                    else {
                        BodyState::ChunkData { remaining }
                    };
                    return Ok(Some(chunk));
                }
                BodyState::ChunkEnd => {
                    while self.reader.buf.len() < 2 {
                        if self.reader.fill().await? == 0 {
                            return Err(Error::IncompleteBody);
                        }
                    }
                    if &self.reader.buf[..2] != b"\r\n" {
                        return Err(Error::Syntax("missing CRLF after chunk".to_owned()));
                    }
                    self.reader.buf.advance(2);
                    self.state = BodyState::ChunkSize;
                }
                BodyState::Trailers => {
                    self.read_trailers().await?;
                    self.state = BodyState::Done;
                    return Ok(None);
                }
            }
        }
    }

    /// Trailers of a chunked body, once it was read completely.
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    pub async fn read_to_end(mut self) -> Result<(Bytes, Option<HeaderMap>), Error> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok((body.freeze(), self.trailers.take()))
    }

    fn count(&mut self, n: usize) -> Result<(), Error> {
        self.read = self.read.saturating_add(n);
        match self.limit {
            Some(limit) if self.read > limit => Err(Error::BodyTooLarge { limit }),
            _ => Ok(()),
        }
    }

    async fn take_data(&mut self, remaining: u64) -> Result<Bytes, Error> {
        if self.reader.buf.is_empty() && self.reader.fill().await? == 0 {
            return Err(Error::IncompleteBody);
        }
        let n = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(self.reader.buf.len());
        Ok(self.reader.buf.split_to(n).freeze())
    }

    async fn read_line(&mut self) -> Result<Bytes, Error> {
        loop {
            if let Some(end) = self.reader.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.reader.buf.split_to(end).freeze();
                self.reader.buf.advance(2);
                return Ok(line);
            }
            if self.reader.buf.len() > MAX_CHUNK_LINE_LENGTH {
                return Err(Error::Syntax("chunk size line too long".to_owned()));
            }
            if self.reader.fill().await? == 0 {
                return Err(Error::IncompleteBody);
            }
        }
    }

    async fn read_trailers(&mut self) -> Result<(), Error> {
        loop {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            match httparse::parse_headers(&self.reader.buf, &mut headers) {
                Ok(httparse::Status::Complete((length, headers))) => {
                    let trailers = header_map(headers)?;
                    self.reader.buf.advance(length);
                    if !trailers.is_empty() {
                        self.trailers = Some(trailers);
                    }
                    return Ok(());
                }
                Ok(httparse::Status::Partial) => {
                    if self.reader.buf.len() > self.reader.head_limit {
                        return Err(Error::HeadTooLarge {
                            limit: self.reader.head_limit,
                        });
                    }
                }
                Err(error) => return Err(Error::Syntax(format!("invalid trailers: {error}"))),
            }
            if self.reader.fill().await? == 0 {
                return Err(Error::IncompleteBody);
            }
        }
    }
}

#[async_trait]
impl<'a, T: AsyncRead + Send + Unpin> BodyStream for BodyReader<'a, T> {
    type Error = Error;

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        BodyReader::next_chunk(self).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    use super::Reader;
    use crate::http::{
        http1::{
            assemble::encode_chunked,
            parse::BodySize,
        },
        Error,
    };

    fn reader(data: &[u8]) -> Reader<&[u8]> {
        Reader::new(data, None, 64 * 1024)
    }

    #[tokio::test]
    async fn it_round_trips_chunked_bodies() {
        let chunks = vec![
            Bytes::from_static(b"hello"),
            Bytes::from_static(b", "),
            Bytes::from(vec![b'x'; 5000]),
        ];
        let encoded = encode_chunked(&chunks, None);

        let mut reader = reader(&encoded);
        let (body, trailers) = reader
            .body(BodySize::Chunked, None)
            .unwrap()
            .read_to_end()
            .await
            .unwrap();

        assert_eq!(body, chunks.concat());
        assert!(trailers.is_none());
    }

    #[tokio::test]
    async fn it_reads_trailers() {
        let mut reader = reader(b"5;ext=1\r\nhello\r\n0\r\nx-checksum: abc\r\n\r\nGET");
        let (body, trailers) = reader
            .body(BodySize::Chunked, None)
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(body, "hello");
        assert_eq!(trailers.unwrap()["x-checksum"], "abc");
        assert_eq!(reader.into_parts().1.as_ref(), b"GET");
    }

    #[tokio::test]
    async fn it_fails_on_truncated_chunked_bodies() {
        let mut reader = reader(b"5\r\nhello\r\n3\r\nab");
        let result = reader
            .body(BodySize::Chunked, None)
            .unwrap()
            .read_to_end()
            .await;
        assert!(matches!(result, Err(Error::IncompleteBody)));

        let mut reader = super::Reader::new(&b"5\r\nhello\r\n"[..], None, 1024);
        let result = reader
            .body(BodySize::Chunked, None)
            .unwrap()
            .read_to_end()
            .await;
        assert!(matches!(result, Err(Error::IncompleteBody)));
    }

    #[tokio::test]
    async fn it_enforces_the_body_size_limit() {
        let mut reader = reader(b"a\r\n0123456789\r\n0\r\n\r\n");
        let result = reader
            .body(BodySize::Chunked, Some(5))
            .unwrap()
            .read_to_end()
            .await;
        assert!(matches!(result, Err(Error::BodyTooLarge { limit: 5 })));

        let mut known = super::Reader::new(&b"0123456789"[..], None, 1024);
        assert!(matches!(
            known.body(BodySize::Known(10), Some(5)),
            Err(Error::BodyTooLarge { limit: 5 })
        ));
    }

    #[tokio::test]
    async fn it_reads_pipelined_messages() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"\r\nGET /a HTTP/1.1\r\nHost: a\r\n\r\nGET /b HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap();
        drop(server);

        let mut reader = Reader::new(client, None, 1024);
        assert_eq!(reader.read_request().await.unwrap().unwrap().path, "/a");
        assert_eq!(reader.read_request().await.unwrap().unwrap().path, "/b");
        assert!(reader.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn it_limits_the_head_size() {
        let head = format!("GET / HTTP/1.1\r\nX-Long: {}\r\n\r\n", "a".repeat(200));
        let mut reader = Reader::new(head.as_bytes(), None, 64);
        assert!(matches!(
            reader.read_request().await,
            Err(Error::HeadTooLarge { limit: 64 })
        ));
    }

    #[tokio::test]
    async fn it_reports_missing_responses() {
        let mut reader = reader(b"");
        assert!(matches!(
            reader.read_response().await,
            Err(Error::NoResponse)
        ));
    }
}
