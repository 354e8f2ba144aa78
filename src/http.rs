//! Minimal HTTP/1.1 message types for the API server.
//!
//! Requests are read head-only (the API has no request bodies) and parsed with
//! `httparse`; responses are always sent with `Connection: close`.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

/// Why a request head could not be read.
#[derive(Debug, Error)]
pub enum HeadError {
    /// The head exceeded the configured byte limit or header count.
    #[error("request header fields too large")]
    TooLarge,
    #[error("malformed request: {0}")]
    Malformed(String),
    /// The peer closed the connection before sending anything.
    #[error("connection closed before request")]
    Closed,
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Path component of the request target, without the query.
    pub path: String,
    /// Raw query string (no leading `?`), possibly empty.
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub peer: IpAddr,
}

impl Request {
    /// Convenience constructor, mostly for tests: `target` may carry a query.
    pub fn new(method: &str, target: &str, peer: IpAddr) -> Self {
        let (path, query) = split_target(target);
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: query.to_string(),
            headers: Vec::new(),
            peer,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decoded query parameters; the first occurrence of a key wins.
    pub fn query_params(&self) -> HashMap<String, String> {
        parse_query(&self.query)
    }

    /// Path plus query, as it appeared on the request line.
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

fn split_target(target: &str) -> (&str, &str) {
    match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    }
}

/// Parse a complete or partial head. `Ok(None)` means more bytes are needed.
pub fn parse_head(buf: &[u8], peer: IpAddr) -> Result<Option<Request>, HeadError> {
    Ok(parse_head_len(buf, peer)?.map(|(req, _)| req))
}

/// Like [`parse_head`], also returning the byte length of the head.
fn parse_head_len(buf: &[u8], peer: IpAddr) -> Result<Option<(Request, usize)>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(HeadError::TooLarge),
        Err(e) => return Err(HeadError::Malformed(e.to_string())),
    };

    let method = req.method.unwrap_or_default().to_string();
    let target = req.path.unwrap_or("/");
    let (path, query) = split_target(target);
    let headers = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    let request = Request {
        method,
        path: path.to_string(),
        query: query.to_string(),
        headers,
        peer,
    };
    Ok(Some((request, head_len)))
}

/// Read bytes from `reader` until a full request head has arrived.
///
/// Fails with [`HeadError::TooLarge`] when the head is longer than
/// `max_head_bytes`, whether or not it has arrived in full.
pub async fn read_request<R>(
    reader: &mut R,
    max_head_bytes: usize,
    peer: IpAddr,
) -> Result<Request, HeadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK.min(max_head_bytes));
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                HeadError::Closed
            } else {
                HeadError::Malformed("unexpected end of request".to_string())
            });
        }
        buf.extend_from_slice(&chunk[..n]);

        match parse_head_len(&buf, peer)? {
            Some((_, head_len)) if head_len > max_head_bytes => return Err(HeadError::TooLarge),
            Some((request, _)) => return Ok(request),
            None if buf.len() > max_head_bytes => return Err(HeadError::TooLarge),
            None => {}
        }
    }
}

/// Percent-decoding for URL query components; `+` is a space.
///
/// Decodes to bytes first so multi-byte UTF-8 sequences survive; invalid
/// escapes are kept literally and invalid UTF-8 is replaced.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .filter(|h| h.iter().all(u8::is_ascii_hexdigit))
                    .and_then(|h| std::str::from_utf8(h).ok());
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a query string into decoded key-value pairs. Repeated keys keep
/// their first value.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, val) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(url_decode(key))
            .or_insert_with(|| url_decode(val));
    }
    params
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// An outgoing response. Serialized by [`Response::to_bytes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn no_content() -> Self {
        Self::new(204)
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.as_bytes().to_vec())
    }

    /// JSON body; an unserializable value becomes a 500.
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status)
                .with_header("Content-Type", "application/json; charset=utf-8")
                .with_body(body),
            Err(_) => Self::new(500)
                .with_header("Content-Type", "application/json; charset=utf-8")
                .with_body(br#"{"error":"internal server error"}"#.to_vec()),
        }
    }

    /// `{"error": message}` with the given status.
    pub fn error(status: u16, message: &str) -> Self {
        Self::json(status, &ErrorBody { error: message })
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    /// Insert or replace a header.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Wire form: status line, headers, `Content-Length` (except on 204),
    /// `Connection: close`, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if self.status != 204 {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("Connection: close\r\n\r\n");

        let mut out = head.into_bytes();
        if self.status != 204 {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

/// Canonical reason phrase for the statuses this server emits.
pub fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
