//! HTTP/1 heads and the rules that decide how a body is framed.

use std::str::FromStr;

use chrono::Utc;
use http::{
    header::{
        CONNECTION,
        CONTENT_LENGTH,
        EXPECT,
        HOST,
        TRANSFER_ENCODING,
    },
    HeaderMap,
    HeaderName,
    HeaderValue,
    Method,
    StatusCode,
    Version,
};

use crate::{
    address::TcpAddress,
    config::Scheme,
    http::{
        message::{
            header_contains_token,
            Request,
            Response,
            TargetForm,
        },
        Error,
    },
};

const MAX_HEADERS: usize = 256;

/// How the length of a message body is determined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodySize {
    Known(u64),
    Chunked,
    /// The body ends when the connection is closed.
    UntilEof,
}

/// Parses a request head from the start of `data`. Returns the request and the
/// length of the head, or `None` if the head is incomplete.
pub fn parse_request_head(data: &[u8]) -> Result<Option<(Request, usize)>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let length = match parsed.parse(data) {
        Ok(httparse::Status::Complete(length)) => length,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(error) => return Err(Error::Syntax(format!("invalid request head: {error}"))),
    };

    let method = parsed.method.unwrap_or_default();
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| Error::Syntax(format!("invalid method: {method:?}")))?;
    let version = version(parsed.version)?;
    let headers = header_map(parsed.headers)?;
    let target = parsed.path.unwrap_or_default();

    let (target_form, scheme, authority, path) = parse_target(&method, target)?;
    let scheme = scheme.unwrap_or(Scheme::Http);

    let address = match (&authority, headers.get(HOST)) {
        (Some(authority), _) => Some(authority.as_str()),
        (None, Some(host)) => host.to_str().ok(),
        (None, None) => None,
    }
    .map(|authority| TcpAddress::from_authority(authority, scheme.default_port()))
    .transpose()
    .map_err(|error| Error::Syntax(error.to_string()))?;

    let request = Request {
        method,
        scheme,
        host: address
            .as_ref()
            .map(|address| address.host.to_host_string())
            .unwrap_or_default(),
        port: address.map_or(0, |address| address.port),
        authority,
        path,
        version,
        headers,
        content: None,
        trailers: None,
        target_form,
        timestamp_start: Utc::now(),
        timestamp_end: None,
    };

    Ok(Some((request, length)))
}

/// Parses a response head from the start of `data`.
pub fn parse_response_head(data: &[u8]) -> Result<Option<(Response, usize)>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let length = match parsed.parse(data) {
        Ok(httparse::Status::Complete(length)) => length,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(error) => return Err(Error::Syntax(format!("invalid response head: {error}"))),
    };

    let status = StatusCode::from_u16(parsed.code.unwrap_or_default())
        .map_err(|_| Error::Syntax(format!("invalid status code: {:?}", parsed.code)))?;

    let response = Response {
        status,
        reason: parsed.reason.map(ToOwned::to_owned),
        version: version(parsed.version)?,
        headers: header_map(parsed.headers)?,
        content: None,
        trailers: None,
        timestamp_start: Utc::now(),
        timestamp_end: None,
    };

    Ok(Some((response, length)))
}

pub(crate) fn header_map(headers: &[httparse::Header<'_>]) -> Result<HeaderMap, Error> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::Syntax(format!("invalid header name: {:?}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| Error::Syntax(format!("invalid value for header {name}")))?;
        map.append(name, value);
    }
    Ok(map)
}

fn version(version: Option<u8>) -> Result<Version, Error> {
    match version {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        _ => Err(Error::Syntax("unsupported http version".to_owned())),
    }
}

fn parse_target(
    method: &Method,
    target: &str,
) -> Result<(TargetForm, Option<Scheme>, Option<String>, String), Error> {
    if target == "*" {
        return Ok((TargetForm::Asterisk, None, None, "*".to_owned()));
    }
    if method == Method::CONNECT {
        TcpAddress::from_str(target)
            .map_err(|_| Error::Syntax(format!("invalid CONNECT target: {target}")))?;
        return Ok((TargetForm::Authority, None, Some(target.to_owned()), String::new()));
    }
    if target.starts_with('/') {
        return Ok((TargetForm::Origin, None, None, target.to_owned()));
    }
    if let Some((scheme, rest)) = target.split_once("://") {
        let scheme = Scheme::from_str(&scheme.to_ascii_lowercase())
            .map_err(|_| Error::Syntax(format!("unsupported scheme: {scheme}")))?;
        let (authority, path) = match rest.find(['/', '?']) {
            Some(i) if rest.as_bytes()[i] == b'?' => (&rest[..i], format!("/{}", &rest[i..])),
            Some(i) => (&rest[..i], rest[i..].to_owned()),
            None => (rest, "/".to_owned()),
        };
        if authority.is_empty() {
            return Err(Error::Syntax(format!("missing authority: {target}")));
        }
        return Ok((
            TargetForm::Absolute,
            Some(scheme),
            Some(authority.to_owned()),
            path,
        ));
    }
    Err(Error::Syntax(format!("invalid request target: {target}")))
}

/// Whether the client waits for `100 Continue` before sending the body.
pub fn expects_continue(request: &Request) -> bool {
    request.version == Version::HTTP_11
        && request
            .headers
            .get(EXPECT)
            .and_then(|value| value.to_str().ok())
            .map_or(false, |value| value.trim().eq_ignore_ascii_case("100-continue"))
}

/// Determines how the body of the request, or of the response to it if
/// `response` is set, is framed.
pub fn expected_body_size(request: &Request, response: Option<&Response>) -> Result<BodySize, Error> {
    let headers = match response {
        None => {
            if expects_continue(request) {
                return Ok(BodySize::Known(0));
            }
            &request.headers
        }
        Some(response) => {
            if request.method == Method::HEAD
                || response.status.is_informational()
                || response.status == StatusCode::NO_CONTENT
                || response.status == StatusCode::NOT_MODIFIED
            {
                return Ok(BodySize::Known(0));
            }
            if request.method == Method::CONNECT && response.status.is_success() {
                return Ok(BodySize::Known(0));
            }
            &response.headers
        }
    };

    if headers.contains_key(TRANSFER_ENCODING) {
        if headers.contains_key(CONTENT_LENGTH) {
            return Err(Error::Syntax(
                "both Transfer-Encoding and Content-Length are set".to_owned(),
            ));
        }

        let mut codings = vec![];
        for value in headers.get_all(TRANSFER_ENCODING) {
            let value = value
                .to_str()
                .map_err(|_| Error::Syntax("invalid Transfer-Encoding".to_owned()))?;
            codings.extend(
                value
                    .split(',')
                    .map(|coding| coding.trim().to_ascii_lowercase())
                    .filter(|coding| !coding.is_empty()),
            );
        }

        let known = |coding: &String| {
            matches!(
                coding.as_str(),
                "chunked" | "identity" | "gzip" | "deflate" | "compress"
            )
        };
        if !codings.iter().all(known) {
            return Err(Error::Syntax(format!(
                "unknown Transfer-Encoding: {}",
                codings.join(", ")
            )));
        }
        if codings.last().map(String::as_str) == Some("chunked") {
            return Ok(BodySize::Chunked);
        }
        if response.is_some() {
            return Ok(BodySize::UntilEof);
        }
        return Err(Error::Syntax(format!(
            "invalid request Transfer-Encoding: {}",
            codings.join(", ")
        )));
    }

    if headers.contains_key(CONTENT_LENGTH) {
        let mut length = None;
        for value in headers.get_all(CONTENT_LENGTH) {
            let value = value
                .to_str()
                .map_err(|_| Error::Syntax("invalid Content-Length".to_owned()))?;
            for item in value.split(',') {
                let item = item.trim();
                if item.starts_with('-') {
                    return Err(Error::Syntax(format!("negative Content-Length: {item}")));
                }
                let item: u64 = item
                    .parse()
                    .map_err(|_| Error::Syntax(format!("unparseable Content-Length: {item}")))?;
                match length {
                    Some(length) if length != item => {
                        return Err(Error::Syntax("conflicting Content-Length values".to_owned()));
                    }
                    _ => length = Some(item),
                }
            }
        }
        if let Some(length) = length {
            return Ok(BodySize::Known(length));
        }
    }

    if response.is_some() {
        Ok(BodySize::UntilEof)
    }
    else {
        Ok(BodySize::Known(0))
    }
}

/// Whether a message asks to close the connection after it. An explicit
/// `Connection` header wins over the version's default.
pub fn connection_close(version: Version, headers: &HeaderMap) -> bool {
    if header_contains_token(headers, &CONNECTION, "close") {
        return true;
    }
    if header_contains_token(headers, &CONNECTION, "keep-alive") {
        return false;
    }
    version < Version::HTTP_11
}

/// Whether the connection must be closed after this exchange.
pub fn should_close(request: &Request, response: &Response, body_size: BodySize) -> bool {
    // HTTP/1.0 proxies answer CONNECT without Content-Length, but keep the
    // tunnel open.
    if request.method == Method::CONNECT
        && response.status.is_success()
        && response.version == Version::HTTP_10
        && !response.headers.contains_key(CONTENT_LENGTH)
    {
        return header_contains_token(&request.headers, &CONNECTION, "close")
            || header_contains_token(&response.headers, &CONNECTION, "close");
    }

    connection_close(request.version, &request.headers)
        || connection_close(response.version, &response.headers)
        || body_size == BodySize::UntilEof
}

#[cfg(test)]
mod tests {
    use http::{
        header::{
            CONNECTION,
            CONTENT_LENGTH,
            TRANSFER_ENCODING,
        },
        HeaderValue,
        Method,
        Version,
    };

    use super::{
        expected_body_size,
        parse_request_head,
        parse_response_head,
        should_close,
        BodySize,
    };
    use crate::{
        config::Scheme,
        http::{
            message::{
                Request,
                Response,
                TargetForm,
            },
            Error,
        },
    };

    fn request(head: &str) -> Request {
        parse_request_head(head.as_bytes()).unwrap().unwrap().0
    }

    fn response(head: &str) -> Response {
        parse_response_head(head.as_bytes()).unwrap().unwrap().0
    }

    #[test]
    fn it_parses_request_target_forms() {
        let origin = request("GET /p/200?x=1 HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        assert_eq!(origin.target_form, TargetForm::Origin);
        assert_eq!(origin.host, "example.com");
        assert_eq!(origin.port, 8080);
        assert_eq!(origin.path, "/p/200?x=1");

        let absolute = request("GET https://example.com/index.html HTTP/1.1\r\n\r\n");
        assert_eq!(absolute.target_form, TargetForm::Absolute);
        assert_eq!(absolute.scheme, Scheme::Https);
        assert_eq!(absolute.port, 443);
        assert_eq!(absolute.path, "/index.html");

        let connect = request("CONNECT example.com:443 HTTP/1.1\r\n\r\n");
        assert_eq!(connect.target_form, TargetForm::Authority);
        assert_eq!(connect.address().to_string(), "example.com:443");

        let asterisk = request("OPTIONS * HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(asterisk.target_form, TargetForm::Asterisk);
    }

    #[test]
    fn it_waits_for_a_complete_head() {
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nHost: exa")
            .unwrap()
            .is_none());
    }

    #[test]
    fn it_rejects_malformed_heads() {
        assert!(matches!(
            parse_request_head(b"GET / HTTP/1.1\r\nBad Header: x\r\n\r\n"),
            Err(Error::Syntax(_))
        ));
        assert!(matches!(
            parse_request_head(b"GET example.com HTTP/1.1\r\n\r\n"),
            Err(Error::Syntax(_))
        ));
    }

    #[test]
    fn it_rejects_transfer_encoding_with_content_length() {
        let request = request(
            "POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n",
        );
        assert!(matches!(
            expected_body_size(&request, None),
            Err(Error::Syntax(_))
        ));

        let get = Request::get("http://a/").unwrap();
        let mut response = Response::text(200, "hello");
        response
            .headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert!(expected_body_size(&get, Some(&response)).is_err());
    }

    #[test]
    fn it_computes_request_body_sizes() {
        let chunked = request("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip, chunked\r\n\r\n");
        assert_eq!(expected_body_size(&chunked, None).unwrap(), BodySize::Chunked);

        let known = request("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 42\r\n\r\n");
        assert_eq!(expected_body_size(&known, None).unwrap(), BodySize::Known(42));

        let duplicated = request(
            "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 42\r\nContent-Length: 42\r\n\r\n",
        );
        assert_eq!(
            expected_body_size(&duplicated, None).unwrap(),
            BodySize::Known(42)
        );

        let conflicting = request(
            "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 42\r\nContent-Length: 7\r\n\r\n",
        );
        assert!(expected_body_size(&conflicting, None).is_err());

        let negative = request("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: -1\r\n\r\n");
        assert!(expected_body_size(&negative, None).is_err());

        let gzip = request("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip\r\n\r\n");
        assert!(expected_body_size(&gzip, None).is_err());

        let unknown = request("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: foo\r\n\r\n");
        assert!(expected_body_size(&unknown, None).is_err());

        let expect = request(
            "POST / HTTP/1.1\r\nHost: a\r\nExpect: 100-continue\r\nContent-Length: 42\r\n\r\n",
        );
        assert_eq!(expected_body_size(&expect, None).unwrap(), BodySize::Known(0));

        let none = request("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(expected_body_size(&none, None).unwrap(), BodySize::Known(0));
    }

    #[test]
    fn it_computes_response_body_sizes() {
        let get = request("GET / HTTP/1.1\r\nHost: a\r\n\r\n");

        let not_modified = response("HTTP/1.1 304 Not Modified\r\n\r\n");
        assert_eq!(
            expected_body_size(&get, Some(&not_modified)).unwrap(),
            BodySize::Known(0)
        );

        let no_content = response("HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(
            expected_body_size(&get, Some(&no_content)).unwrap(),
            BodySize::Known(0)
        );

        let mut head = get.clone();
        head.method = Method::HEAD;
        let ok = response("HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n");
        assert_eq!(
            expected_body_size(&head, Some(&ok)).unwrap(),
            BodySize::Known(0)
        );
        assert_eq!(
            expected_body_size(&get, Some(&ok)).unwrap(),
            BodySize::Known(100)
        );

        let connect = request("CONNECT a:443 HTTP/1.1\r\n\r\n");
        let established = response("HTTP/1.1 200 Connection established\r\n\r\n");
        assert_eq!(
            expected_body_size(&connect, Some(&established)).unwrap(),
            BodySize::Known(0)
        );

        let until_eof = response("HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(
            expected_body_size(&get, Some(&until_eof)).unwrap(),
            BodySize::UntilEof
        );

        let gzip = response("HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip\r\n\r\n");
        assert_eq!(
            expected_body_size(&get, Some(&gzip)).unwrap(),
            BodySize::UntilEof
        );
    }

    #[test]
    fn it_decides_when_to_close() {
        let keep_alive = request("GET /p/200 HTTP/1.1\r\nHost: a\r\nConnection: keep-alive\r\n\r\n");
        let ok = response("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert!(!should_close(&keep_alive, &ok, BodySize::Known(0)));
        assert!(should_close(&keep_alive, &ok, BodySize::UntilEof));

        let close = response("HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
        assert!(should_close(&keep_alive, &close, BodySize::Known(0)));

        let http10 = request("GET / HTTP/1.0\r\n\r\n");
        assert!(should_close(&http10, &ok, BodySize::Known(0)));

        let mut http10_keep_alive = http10.clone();
        http10_keep_alive
            .headers
            .insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
        assert!(!should_close(&http10_keep_alive, &ok, BodySize::Known(0)));
    }

    #[test]
    fn it_keeps_http10_connect_tunnels_open() {
        let connect = request("CONNECT a:443 HTTP/1.1\r\n\r\n");
        let established = response("HTTP/1.0 200 Connection established\r\n\r\n");
        assert_eq!(established.version, Version::HTTP_10);
        assert!(!established.headers.contains_key(CONTENT_LENGTH));
        assert!(!should_close(&connect, &established, BodySize::Known(0)));

        let get = request("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        let http10 = response("HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert!(should_close(&get, &http10, BodySize::Known(0)));
    }
}
