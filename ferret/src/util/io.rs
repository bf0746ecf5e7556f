//! IO utilities.

use std::{
    pin::Pin,
    task::{
        Context,
        Poll,
    },
    time::Duration,
};

use bytes::{
    Buf,
    Bytes,
    BytesMut,
};
use pin_project_lite::pin_project;
use tokio::io::{
    AsyncRead,
    AsyncReadExt,
    AsyncWrite,
    ReadBuf,
};

/// Duplex byte stream that layers pass around.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Type-erased [`Io`]. The layer stack changes the concrete stream type on
/// every TLS upgrade or rewind, so layers only ever see this.
pub type BoxedIo = Box<dyn Io>;

pin_project! {
    /// Wrapper for [`AsyncRead`]/[`AsyncWrite`] types that "rewinds" a read operation.
    /// This is done by giving it the bytes that you already read, but want to put back.
    /// [`Rewind`] will return these buffered bytes first when read is called on it.
    ///
    /// Writes go straight to the inner stream.
    #[derive(Debug)]
    pub struct Rewind<T> {
        #[pin]
        inner: T,
        buf: Bytes,
    }
}

impl<T> Rewind<T> {
    pub fn new(inner: T, buf: impl Into<Bytes>) -> Self {
        Self {
            inner,
            buf: buf.into(),
        }
    }

    /// Returns the underlying IO stream and the buffer containing data that
    /// wasn't read yet.
    pub fn into_parts(self) -> (T, Bytes) {
        (self.inner, self.buf)
    }

    /// Bytes that will be returned before reading from the inner stream.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: AsyncRead> AsyncRead for Rewind<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let this = self.project();
        if this.buf.remaining() == 0 {
            this.inner.poll_read(cx, buf)
        }
        else {
            let n = std::cmp::min(this.buf.len(), buf.remaining());
            buf.put_slice(&this.buf[..n]);
            this.buf.advance(n);
            if this.buf.remaining() == 0 {
                // make sure the underlying buffer can be deallocated
                *this.buf = Bytes::from_static(b"");
            }
            Poll::Ready(Ok(()))
        }
    }
}

impl<T: AsyncWrite> AsyncWrite for Rewind<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Puts `buf` back in front of `io`. Returns `io` unchanged if there is
/// nothing to put back.
pub fn rewind(io: BoxedIo, buf: impl Into<Bytes>) -> BoxedIo {
    let buf = buf.into();
    if buf.is_empty() {
        io
    }
    else {
        Box::new(Rewind::new(io, buf))
    }
}

/// Reads into `buf`, failing with [`std::io::ErrorKind::TimedOut`] if no data
/// arrives within `timeout`. Returns the number of bytes read, `0` meaning
/// end of stream.
pub async fn read_buf_timeout<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    timeout: Option<Duration>,
) -> Result<usize, std::io::Error>
where
    R: AsyncRead + Unpin,
{
    if buf.capacity() - buf.len() < 4096 {
        buf.reserve(8192);
    }

    match timeout {
        Some(timeout) => {
            tokio::time::timeout(timeout, reader.read_buf(buf))
                .await
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
        }
        None => reader.read_buf(buf).await,
    }
}

/// Returns `true` if the error means the peer went away, as opposed to a
/// timeout or a protocol problem.
pub fn is_disconnect(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::io::AsyncReadExt;

    use super::{
        read_buf_timeout,
        Rewind,
    };

    #[tokio::test]
    async fn it_returns_rewound_bytes_first() {
        let inner: &[u8] = b" world";
        let mut rewind = Rewind::new(inner, &b"hello"[..]);
        let mut out = String::new();
        rewind.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn it_times_out_distinctly() {
        let (mut a, _b) = tokio::io::duplex(64);
        let mut buf = BytesMut::new();
        let error = read_buf_timeout(&mut a, &mut buf, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::TimedOut);
    }
}
