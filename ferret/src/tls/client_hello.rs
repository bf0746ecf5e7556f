//! Reads a ClientHello without starting a handshake.
//!
//! We need SNI and ALPN to decide whether to intercept, and the raw bytes to
//! replay them into either rustls or a passthrough relay.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncRead;

use super::Error;
use crate::util::io::read_buf_timeout;

const RECORD_HEADER_LENGTH: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0;
const EXTENSION_ALPN: u16 = 16;

/// Upper bound for a (possibly fragmented) ClientHello.
const MAX_CLIENT_HELLO_LENGTH: usize = 64 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub sni: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
}

/// Whether `data` starts like a TLS handshake record.
pub fn is_tls_record(data: &[u8]) -> bool {
    data.len() >= 3 && data[0] == CONTENT_TYPE_HANDSHAKE && data[1] == 0x03 && data[2] <= 0x04
}

/// Parses a ClientHello from the start of `data`, which may span multiple
/// records. Returns `None` if more data is needed.
pub fn parse_client_hello(data: &[u8]) -> Result<Option<ClientHello>, Error> {
    let Some(handshake) = reassemble(data)?
    else {
        return Ok(None);
    };

    let mut reader = Reader::new(&handshake);
    if reader.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(invalid("not a client hello"));
    }
    let length = reader.u24()?;
    let mut body = Reader::new(reader.take(length)?);

    // version and random
    body.take(2 + 32)?;
    let session_id = body.u8()? as usize;
    body.take(session_id)?;
    let cipher_suites = body.u16()? as usize;
    body.take(cipher_suites)?;
    let compression_methods = body.u8()? as usize;
    body.take(compression_methods)?;

    let mut client_hello = ClientHello::default();
    if body.is_empty() {
        return Ok(Some(client_hello));
    }

    let extensions_length = body.u16()? as usize;
    let mut extensions = Reader::new(body.take(extensions_length)?);
    while !extensions.is_empty() {
        let extension_type = extensions.u16()?;
        let length = extensions.u16()? as usize;
        let mut data = Reader::new(extensions.take(length)?);

        match extension_type {
            EXTENSION_SERVER_NAME => {
                let list_length = data.u16()? as usize;
                let mut list = Reader::new(data.take(list_length)?);
                while !list.is_empty() {
                    let name_type = list.u8()?;
                    let length = list.u16()? as usize;
                    let name = list.take(length)?;
                    if name_type == 0 {
                        let name = std::str::from_utf8(name)
                            .map_err(|_| invalid("server name is not utf-8"))?;
                        client_hello.sni = Some(name.to_ascii_lowercase());
                    }
                }
            }
            EXTENSION_ALPN => {
                let list_length = data.u16()? as usize;
                let mut list = Reader::new(data.take(list_length)?);
                while !list.is_empty() {
                    let length = list.u8()? as usize;
                    client_hello.alpn_protocols.push(list.take(length)?.to_vec());
                }
            }
            _ => {}
        }
    }

    Ok(Some(client_hello))
}

/// Reads from `reader` into `buf` until it holds a complete ClientHello. The
/// bytes stay in `buf` so they can be replayed.
pub async fn read_client_hello<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    timeout: Option<Duration>,
) -> Result<ClientHello, Error> {
    loop {
        if let Some(client_hello) = parse_client_hello(buf)? {
            return Ok(client_hello);
        }
        if buf.len() > MAX_CLIENT_HELLO_LENGTH {
            return Err(invalid("client hello too long"));
        }
        if read_buf_timeout(reader, buf, timeout).await? == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
    }
}

/// Joins the payloads of the leading handshake records until they contain the
/// whole first handshake message.
fn reassemble(mut data: &[u8]) -> Result<Option<Vec<u8>>, Error> {
    let mut handshake = Vec::new();

    loop {
        if data.len() < RECORD_HEADER_LENGTH {
            return Ok(None);
        }
        if !is_tls_record(data) {
            return Err(invalid("not a tls handshake record"));
        }
        let length = u16::from_be_bytes([data[3], data[4]]) as usize;
        if data.len() < RECORD_HEADER_LENGTH + length {
            return Ok(None);
        }
        handshake.extend_from_slice(&data[RECORD_HEADER_LENGTH..RECORD_HEADER_LENGTH + length]);
        data = &data[RECORD_HEADER_LENGTH + length..];

        if handshake.len() >= 4 {
            let message_length =
                u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
            if handshake.len() >= 4 + message_length {
                return Ok(Some(handshake));
            }
            if message_length > MAX_CLIENT_HELLO_LENGTH {
                return Err(invalid("client hello too long"));
            }
        }
    }
}

fn invalid(reason: &'static str) -> Error {
    Error::InvalidClientHello { reason }
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.data.len() < n {
            return Err(invalid("truncated client hello"));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, Error> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]) as usize)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{
        is_tls_record,
        parse_client_hello,
        ClientHello,
    };

    /// Builds a minimal ClientHello, split into records of at most
    /// `fragment` bytes.
    pub(crate) fn client_hello(sni: Option<&str>, alpn: &[&[u8]], fragment: usize) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(sni) = sni {
            let mut entry = vec![0u8];
            entry.extend_from_slice(&(sni.len() as u16).to_be_bytes());
            entry.extend_from_slice(sni.as_bytes());
            extensions.extend_from_slice(&0u16.to_be_bytes());
            extensions.extend_from_slice(&(entry.len() as u16 + 2).to_be_bytes());
            extensions.extend_from_slice(&(entry.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&entry);
        }
        if !alpn.is_empty() {
            let mut list = Vec::new();
            for protocol in alpn {
                list.push(protocol.len() as u8);
                list.extend_from_slice(protocol);
            }
            extensions.extend_from_slice(&16u16.to_be_bytes());
            extensions.extend_from_slice(&(list.len() as u16 + 2).to_be_bytes());
            extensions.extend_from_slice(&(list.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&list);
        }

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut records = Vec::new();
        for chunk in handshake.chunks(fragment) {
            records.extend_from_slice(&[0x16, 0x03, 0x01]);
            records.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            records.extend_from_slice(chunk);
        }
        records
    }

    #[test]
    fn it_parses_sni_and_alpn() {
        let data = client_hello(Some("Example.COM"), &[b"h2", b"http/1.1"], 4096);
        assert!(is_tls_record(&data));

        let parsed = parse_client_hello(&data).unwrap().unwrap();
        assert_eq!(
            parsed,
            ClientHello {
                sni: Some("example.com".to_owned()),
                alpn_protocols: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            }
        );
    }

    #[test]
    fn it_reassembles_fragmented_records() {
        let data = client_hello(Some("example.com"), &[], 10);
        let parsed = parse_client_hello(&data).unwrap().unwrap();
        assert_eq!(parsed.sni.as_deref(), Some("example.com"));
    }

    #[test]
    fn it_asks_for_more_data() {
        let data = client_hello(Some("example.com"), &[], 4096);
        assert!(parse_client_hello(&data[..data.len() - 1]).unwrap().is_none());
        assert!(parse_client_hello(&data[..3]).unwrap().is_none());
    }

    #[test]
    fn it_rejects_other_records() {
        assert!(parse_client_hello(b"GET / HTTP/1.1\r\n\r\n").is_err());
    }
}
