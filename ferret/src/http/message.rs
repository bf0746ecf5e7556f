//! HTTP messages, independent of the wire protocol.

use bytes::Bytes;
use chrono::{
    DateTime,
    Utc,
};
use http::{
    header::{
        CONNECTION,
        CONTENT_LENGTH,
        CONTENT_TYPE,
        HOST,
        TRANSFER_ENCODING,
        UPGRADE,
    },
    HeaderMap,
    HeaderValue,
    Method,
    StatusCode,
    Version,
};

use super::Error;
use crate::{
    address::TcpAddress,
    config::Scheme,
};

/// The form of the request target in an HTTP/1 request line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetForm {
    /// `/path?query`
    Origin,
    /// `host:port`, only for `CONNECT`.
    Authority,
    /// `http://host:port/path`, as sent to explicit proxies.
    Absolute,
    /// `*`, only for `OPTIONS`.
    Asterisk,
}

#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub scheme: Scheme,
    /// Destination host, without brackets for IPv6.
    pub host: String,
    pub port: u16,
    /// The authority as sent by the client (request target or `:authority`).
    pub authority: Option<String>,
    pub path: String,
    pub version: Version,
    pub headers: HeaderMap,
    /// `None` if the body was streamed and never buffered.
    pub content: Option<Bytes>,
    pub trailers: Option<HeaderMap>,
    pub target_form: TargetForm,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: Option<DateTime<Utc>>,
}

impl Request {
    pub fn new(method: Method, scheme: Scheme, address: &TcpAddress, path: impl Into<String>) -> Self {
        Self {
            method,
            scheme,
            host: address.host.to_host_string(),
            port: address.port,
            authority: None,
            path: path.into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            content: Some(Bytes::new()),
            trailers: None,
            target_form: TargetForm::Origin,
            timestamp_start: Utc::now(),
            timestamp_end: None,
        }
    }

    /// Builds a `GET` request for an absolute URL like `https://example.com/x`.
    pub fn get(url: &str) -> Result<Self, Error> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Syntax(format!("not an absolute url: {url}")))?;
        let scheme: Scheme = scheme
            .parse()
            .map_err(|_| Error::Syntax(format!("unsupported scheme: {scheme}")))?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let address = TcpAddress::from_authority(authority, scheme.default_port())
            .map_err(|e| Error::Syntax(e.to_string()))?;

        let mut request = Self::new(Method::GET, scheme, &address, path);
        request
            .headers
            .insert(HOST, header_value(authority)?);
        Ok(request)
    }

    pub fn address(&self) -> TcpAddress {
        TcpAddress::new(&self.host, self.port)
    }

    /// The authority to put into `Host` or `:authority`: the one the client
    /// sent, or host and port with the default port omitted.
    pub fn host_header(&self) -> String {
        if let Some(authority) = &self.authority {
            return authority.clone();
        }
        if let Some(host) = self.headers.get(HOST).and_then(|host| host.to_str().ok()) {
            return host.to_owned();
        }
        let host = match self.host.parse::<std::net::Ipv6Addr>() {
            Ok(_) => format!("[{}]", self.host),
            Err(_) => self.host.clone(),
        };
        if self.port == self.scheme.default_port() {
            host
        }
        else {
            format!("{host}:{}", self.port)
        }
    }

    pub fn url(&self) -> String {
        if self.target_form == TargetForm::Authority {
            return self.host_header();
        }
        format!("{}://{}{}", self.scheme, self.host_header(), self.path)
    }

    /// Replaces the body and fixes up `Content-Length`.
    pub fn set_content(&mut self, content: impl Into<Bytes>) {
        let content = content.into();
        update_content_length(&mut self.headers, content.len());
        self.content = Some(content);
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        header_contains_token(&self.headers, &CONNECTION, "upgrade")
            && header_contains_token(&self.headers, &UPGRADE, "websocket")
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    /// Reason phrase as sent by an HTTP/1 server.
    pub reason: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
    pub content: Option<Bytes>,
    pub trailers: Option<HeaderMap>,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: Option<DateTime<Utc>>,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, content: impl Into<Bytes>) -> Self {
        let mut response = Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers,
            content: None,
            trailers: None,
            timestamp_start: Utc::now(),
            timestamp_end: Some(Utc::now()),
        };
        let content = content.into();
        if !response.headers.contains_key(TRANSFER_ENCODING) {
            update_content_length(&mut response.headers, content.len());
        }
        response.content = Some(content);
        response
    }

    /// A plain text response. Invalid status codes turn into a 500.
    pub fn text(status: u16, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self::new(
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers,
            body,
        )
    }

    /// Response the proxy sends on its own behalf when something went wrong.
    pub fn error(status: StatusCode, message: &str) -> Self {
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = format!(
            "<html><head><title>{code} {reason}</title></head>\n<body><h1>{code} {reason}</h1><p>{message}</p></body></html>\n",
            code = status.as_u16(),
            message = html_escape(message),
        );
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        Self::new(status, headers, body)
    }

    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }

    pub fn set_content(&mut self, content: impl Into<Bytes>) {
        let content = content.into();
        update_content_length(&mut self.headers, content.len());
        self.content = Some(content);
    }
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(value).map_err(|_| Error::Syntax(format!("invalid header value: {value:?}")))
}

/// Whether a comma separated header contains `token`, case-insensitively.
pub(crate) fn header_contains_token(
    headers: &HeaderMap,
    name: &http::header::HeaderName,
    token: &str,
) -> bool {
    headers.get_all(name).iter().any(|value| {
        value.to_str().map_or(false, |value| {
            value
                .split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        })
    })
}

fn update_content_length(headers: &mut HeaderMap, length: usize) {
    if headers.contains_key(TRANSFER_ENCODING) {
        return;
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
}

fn html_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use http::{
        header::{
            CONNECTION,
            CONTENT_LENGTH,
            UPGRADE,
        },
        HeaderValue,
        StatusCode,
    };

    use super::{
        Request,
        Response,
    };
    use crate::config::Scheme;

    #[test]
    fn it_builds_a_request_from_an_url() {
        let request = Request::get("https://example.com:8443/a?b=c").unwrap();
        assert_eq!(request.scheme, Scheme::Https);
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, 8443);
        assert_eq!(request.path, "/a?b=c");
        assert_eq!(request.url(), "https://example.com:8443/a?b=c");
    }

    #[test]
    fn it_detects_websocket_upgrades() {
        let mut request = Request::get("http://example.com/chat").unwrap();
        assert!(!request.is_websocket_upgrade());
        request
            .headers
            .insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        request
            .headers
            .insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(request.is_websocket_upgrade());
    }

    #[test]
    fn it_updates_the_content_length() {
        let mut response = Response::text(200, "hello");
        assert_eq!(response.headers[CONTENT_LENGTH], "5");
        response.set_content("hello world");
        assert_eq!(response.headers[CONTENT_LENGTH], "11");
    }

    #[test]
    fn it_escapes_error_messages() {
        let response = Response::error(StatusCode::BAD_GATEWAY, "<script>");
        let body = String::from_utf8(response.content.unwrap().to_vec()).unwrap();
        assert!(body.contains("502 Bad Gateway"));
        assert!(body.contains("&lt;script&gt;"));
    }
}
