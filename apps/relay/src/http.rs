//! Minimal HTTP/1.x surface.
//!
//! The relay answers GET and HEAD only and never keeps a connection alive:
//! a streaming response ends by closing the socket (MPEG-TS has no in-band
//! way to signal an error anyway). Request heads are parsed with httparse
//! straight out of the read buffer.

use bytes::Bytes;
use thiserror::Error;

pub const CONTENT_TYPE_MPEGTS: &str = "video/MP2T";
pub const CONTENT_TYPE_JPEG: &str = "image/jpeg";

const MAX_HEADERS: usize = 48;
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("request head exceeds {MAX_REQUEST_HEAD} bytes")]
    HeadTooLarge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Other(String),
}

/// A parsed request head; only what dispatch and streaming need.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub cookie: Option<String>,
    pub accept: Option<String>,
    pub snapshot_header: bool,
}

impl HttpRequest {
    /// Parse a request head from `buf`. `Ok(None)` means more bytes are
    /// needed; on success the consumed length is returned alongside.
    pub fn parse(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let consumed = match req.parse(buf)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                if buf.len() > MAX_REQUEST_HEAD {
                    return Err(HttpError::HeadTooLarge);
                }
                return Ok(None);
            }
        };

        let method = match req.method.unwrap_or("") {
            m if m.eq_ignore_ascii_case("GET") => Method::Get,
            m if m.eq_ignore_ascii_case("HEAD") => Method::Head,
            m => Method::Other(m.to_string()),
        };

        let target = req.path.unwrap_or("/");
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (target.to_string(), String::new()),
        };

        let mut request = HttpRequest {
            method,
            path,
            query,
            host: None,
            user_agent: None,
            cookie: None,
            accept: None,
            snapshot_header: false,
        };
        for header in req.headers.iter() {
            let value = || String::from_utf8_lossy(header.value).trim().to_string();
            if header.name.eq_ignore_ascii_case("host") {
                request.host = Some(value());
            } else if header.name.eq_ignore_ascii_case("user-agent") {
                request.user_agent = Some(value());
            } else if header.name.eq_ignore_ascii_case("cookie") {
                request.cookie = Some(value());
            } else if header.name.eq_ignore_ascii_case("accept") {
                request.accept = Some(value());
            } else if header.name.eq_ignore_ascii_case("x-request-snapshot") {
                request.snapshot_header = value() == "1";
            }
        }
        Ok(Some((request, consumed)))
    }

    /// Decoded query pairs, in order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Host header with any port stripped.
    pub fn hostname(&self) -> Option<&str> {
        self.host
            .as_deref()
            .map(|h| h.rsplit_once(':').map_or(h, |(name, _)| name))
    }

    /// The request asks for a snapshot instead of the stream.
    pub fn wants_snapshot(&self) -> bool {
        if self.snapshot_header {
            return true;
        }
        if self.query_param("snapshot").as_deref() == Some("1") {
            return true;
        }
        self.accept
            .as_deref()
            .is_some_and(|accept| accept.contains(CONTENT_TYPE_JPEG))
    }
}

/// Response statuses the relay can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Unauthorized,
    NotFound,
    NotImplemented,
    ServiceUnavailable,
}

impl Status {
    fn line(self) -> &'static str {
        match self {
            Status::Ok => "200 OK",
            Status::BadRequest => "400 Bad Request",
            Status::Unauthorized => "401 Unauthorized",
            Status::NotFound => "404 Not Found",
            Status::NotImplemented => "501 Not Implemented",
            Status::ServiceUnavailable => "503 Service Unavailable",
        }
    }
}

/// Serialize a response head. Streaming responses carry no Content-Length;
/// everything is `Connection: close`.
pub fn response_head(status: Status, content_type: Option<&str>) -> Bytes {
    let mut head = format!(
        "HTTP/1.1 {}\r\nServer: streamrelay/{}\r\nConnection: close\r\n",
        status.line(),
        env!("CARGO_PKG_VERSION"),
    );
    if let Some(content_type) = content_type {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    if status != Status::Ok {
        head.push_str("Content-Length: 0\r\n");
    }
    head.push_str("\r\n");
    Bytes::from(head)
}
