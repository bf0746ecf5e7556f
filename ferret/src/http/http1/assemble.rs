//! Serialization of HTTP/1 messages.

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};
use http::{
    header::{
        HOST,
        TRANSFER_ENCODING,
    },
    HeaderMap,
    Version,
};

use crate::http::message::{
    header_contains_token,
    Request,
    Response,
    TargetForm,
};

fn version(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    }
    else {
        "HTTP/1.1"
    }
}

fn put_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
}

/// Request line and headers, in origin form unless the request targets an
/// authority or `*`.
pub fn request_head(request: &Request) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(request.method.as_str().as_bytes());
    buf.put_u8(b' ');
    match request.target_form {
        TargetForm::Authority => buf.put_slice(request.host_header().as_bytes()),
        TargetForm::Asterisk => buf.put_u8(b'*'),
        TargetForm::Origin | TargetForm::Absolute => {
            if request.path.is_empty() {
                buf.put_u8(b'/');
            }
            else {
                buf.put_slice(request.path.as_bytes());
            }
        }
    }
    buf.put_u8(b' ');
    buf.put_slice(version(request.version).as_bytes());
    buf.put_slice(b"\r\n");

    if !request.headers.contains_key(HOST) {
        buf.put_slice(b"host: ");
        buf.put_slice(request.host_header().as_bytes());
        buf.put_slice(b"\r\n");
    }
    put_headers(&mut buf, &request.headers);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

pub fn response_head(response: &Response) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(version(response.version).as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(response.status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(response.reason().as_bytes());
    buf.put_slice(b"\r\n");
    put_headers(&mut buf, &response.headers);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// A single chunk of a chunked body. Empty input gives an empty buffer, since
/// an empty chunk would end the body.
pub fn encode_chunk(data: &[u8]) -> Bytes {
    if data.is_empty() {
        return Bytes::new();
    }
    let mut buf = BytesMut::with_capacity(data.len() + 12);
    buf.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// The terminating chunk, with trailers.
pub fn last_chunk(trailers: Option<&HeaderMap>) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_slice(b"0\r\n");
    if let Some(trailers) = trailers {
        put_headers(&mut buf, trailers);
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}

pub fn encode_chunked(chunks: &[Bytes], trailers: Option<&HeaderMap>) -> Bytes {
    let mut buf = BytesMut::new();
    for chunk in chunks {
        buf.put(encode_chunk(chunk));
    }
    buf.put(last_chunk(trailers));
    buf.freeze()
}

pub fn is_chunked(headers: &HeaderMap) -> bool {
    header_contains_token(headers, &TRANSFER_ENCODING, "chunked")
}

/// A buffered body framed as its headers say.
pub fn body_bytes(headers: &HeaderMap, content: &Bytes, trailers: Option<&HeaderMap>) -> Bytes {
    if is_chunked(headers) {
        encode_chunked(std::slice::from_ref(content), trailers)
    }
    else {
        content.clone()
    }
}
