//! Plain-HTTP reverse proxy upstream.
//!
//! Connects (optionally pinned to the upstream interface), forwards the
//! request with a rewritten Host, and relays the body. M3U playlists are
//! rewritten so every segment URL routes back through this proxy, query
//! strings (auth tokens) included. No TLS by design.

use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use url::Url;

use crate::error::RelayError;
use crate::http::HttpRequest;
use crate::sendq::{ChunkData, ClientSink, Pump};
use crate::stream::multicast::enqueue_counted;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_HEAD: usize = 32 * 1024;
const MAX_PLAYLIST: usize = 8 * 1024 * 1024;
const BODY_CHUNK: usize = 16 * 1024;

pub async fn run(
    url: &Url,
    request: &HttpRequest,
    upstream_interface: Option<&str>,
    sink: &mut ClientSink,
) -> Result<(), RelayError> {
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::UpstreamProtocol("proxy URL without host".into()))?
        .to_string();
    let port = url.port().unwrap_or(80);

    let mut upstream = timeout(CONNECT_TIMEOUT, connect(&host, port, upstream_interface))
        .await
        .map_err(|_| RelayError::UpstreamTimeout(CONNECT_TIMEOUT))??;

    send_request(&mut upstream, url, request, &host).await?;

    let (head, mut body_start) = read_response_head(&mut upstream).await?;
    let now = Instant::now();

    if head.is_m3u(url) {
        let mut playlist = std::mem::take(&mut body_start);
        read_to_end_bounded(&mut upstream, &mut playlist, MAX_PLAYLIST).await?;
        let rewritten = match std::str::from_utf8(&playlist) {
            Ok(text) => rewrite_m3u(text, url),
            Err(_) => {
                warn!("playlist is not UTF-8, relaying unmodified");
                String::from_utf8_lossy(&playlist).into_owned()
            }
        };
        let head_bytes = head.client_head(Some(rewritten.len()));
        let head_len = head_bytes.len();
        enqueue_counted(sink, ChunkData::Shared(head_bytes), 0, head_len, now)?;
        let body = Bytes::from(rewritten.into_bytes());
        let body_len = body.len();
        enqueue_counted(sink, ChunkData::Shared(body), 0, body_len, now)?;
        return drain_queue(sink).await;
    }

    let head_bytes = head.client_head(None);
    let head_len = head_bytes.len();
    enqueue_counted(sink, ChunkData::Shared(head_bytes), 0, head_len, now)?;
    if !body_start.is_empty() {
        let bytes = Bytes::from(body_start);
        let len = bytes.len();
        enqueue_counted(sink, ChunkData::Shared(bytes), 0, len, now)?;
    }
    sink.try_flush().map_err(RelayError::Io)?;

    relay_body(&mut upstream, sink).await
}

async fn relay_body(upstream: &mut TcpStream, sink: &mut ClientSink) -> Result<(), RelayError> {
    enum Event {
        Pump(Pump),
        Body(usize),
    }

    let mut buf = vec![0u8; BODY_CHUNK];
    loop {
        let event = tokio::select! {
            pump = sink.pump() => Event::Pump(pump?),
            read = upstream.read(&mut buf) => Event::Body(read?),
        };
        match event {
            Event::Pump(Pump::Disconnected) => return Err(RelayError::ClientGone),
            Event::Pump(Pump::Progress) => {}
            Event::Body(0) => return drain_queue(sink).await,
            Event::Body(n) => {
                let bytes = Bytes::copy_from_slice(&buf[..n]);
                enqueue_counted(sink, ChunkData::Shared(bytes), 0, n, Instant::now())?;
                sink.try_flush().map_err(RelayError::Io)?;
            }
        }
    }
}

async fn drain_queue(sink: &mut ClientSink) -> Result<(), RelayError> {
    while !sink.queue().is_empty() {
        if sink.pump().await? == Pump::Disconnected {
            return Err(RelayError::ClientGone);
        }
    }
    Ok(())
}

async fn connect(host: &str, port: u16, iface: Option<&str>) -> io::Result<TcpStream> {
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for upstream"))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if let Some(iface) = iface {
        // Pin to the upstream device when asked; on failure fall back to
        // whatever the routing table picks.
        if let Err(err) = socket.bind_device(Some(iface.as_bytes())) {
            warn!(iface, %err, "cannot bind upstream interface");
        }
    }
    socket.set_nonblocking(true)?;

    let tcp_socket = TcpSocket::from_std_stream(socket.into());
    tcp_socket.connect(addr).await
}

async fn send_request(
    upstream: &mut TcpStream,
    url: &Url,
    request: &HttpRequest,
    host: &str,
) -> Result<(), RelayError> {
    use tokio::io::AsyncWriteExt;

    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    let mut head = format!("GET {target} HTTP/1.0\r\nHost: {host}\r\n");
    if let Some(user_agent) = request.user_agent.as_deref() {
        head.push_str(&format!("User-Agent: {user_agent}\r\n"));
    }
    head.push_str("Accept: */*\r\nConnection: close\r\n\r\n");

    upstream.write_all(head.as_bytes()).await?;
    Ok(())
}

struct UpstreamHead {
    status: u16,
    reason: String,
    content_type: Option<String>,
}

impl UpstreamHead {
    fn is_m3u(&self, url: &Url) -> bool {
        if let Some(content_type) = self.content_type.as_deref() {
            let content_type = content_type.to_ascii_lowercase();
            if content_type.contains("mpegurl") {
                return true;
            }
        }
        let path = url.path().to_ascii_lowercase();
        path.ends_with(".m3u") || path.ends_with(".m3u8")
    }

    fn client_head(&self, content_length: Option<usize>) -> Bytes {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nServer: streamrelay/{}\r\nConnection: close\r\n",
            self.status,
            self.reason,
            env!("CARGO_PKG_VERSION"),
        );
        if let Some(content_type) = self.content_type.as_deref() {
            head.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        if let Some(len) = content_length {
            head.push_str(&format!("Content-Length: {len}\r\n"));
        }
        head.push_str("\r\n");
        Bytes::from(head)
    }
}

/// Parse the upstream response head; returns it plus whatever body bytes
/// came along in the same segments.
async fn read_response_head(
    upstream: &mut TcpStream,
) -> Result<(UpstreamHead, Vec<u8>), RelayError> {
    let mut buf = Vec::with_capacity(4096);
    loop {
        let mut chunk = [0u8; 4096];
        let n = timeout(HEAD_TIMEOUT, upstream.read(&mut chunk))
            .await
            .map_err(|_| RelayError::UpstreamTimeout(HEAD_TIMEOUT))??;
        if n == 0 {
            return Err(RelayError::UpstreamProtocol(
                "upstream closed before response head".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 48];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(consumed)) => {
                let content_type = response
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-type"))
                    .map(|h| String::from_utf8_lossy(h.value).trim().to_string());
                let head = UpstreamHead {
                    status: response.code.unwrap_or(502),
                    reason: response.reason.unwrap_or("").to_string(),
                    content_type,
                };
                let body_start = buf.split_off(consumed);
                return Ok((head, body_start));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_RESPONSE_HEAD {
                    return Err(RelayError::UpstreamProtocol(
                        "upstream response head too large".into(),
                    ));
                }
            }
            Err(err) => {
                return Err(RelayError::UpstreamProtocol(format!(
                    "bad upstream response: {err}"
                )))
            }
        }
    }
}

async fn read_to_end_bounded(
    upstream: &mut TcpStream,
    buf: &mut Vec<u8>,
    cap: usize,
) -> Result<(), RelayError> {
    let mut chunk = [0u8; BODY_CHUNK];
    loop {
        let n = timeout(HEAD_TIMEOUT, upstream.read(&mut chunk))
            .await
            .map_err(|_| RelayError::UpstreamTimeout(HEAD_TIMEOUT))??;
        if n == 0 {
            return Ok(());
        }
        if buf.len() + n > cap {
            return Err(RelayError::UpstreamProtocol("playlist too large".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Rewrite playlist entry URLs through `/http/<host>[:<port>]<path>` so
/// segment fetches come back to us. Comments and non-HTTP URLs pass
/// through untouched; query strings survive.
fn rewrite_m3u(body: &str, base: &Url) -> String {
    let mut out = String::with_capacity(body.len() + body.len() / 4);
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            match base.join(trimmed) {
                Ok(resolved) if resolved.scheme() == "http" => {
                    out.push_str(&proxy_path(&resolved));
                }
                Ok(_) | Err(_) => {
                    debug!(line = trimmed, "leaving unproxyable playlist entry");
                    out.push_str(line);
                }
            }
        }
        out.push('\n');
    }
    out
}

fn proxy_path(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let mut out = match url.port() {
        Some(port) => format!("/http/{host}:{port}{}", url.path()),
        None => format!("/http/{host}{}", url.path()),
    };
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_relative_and_absolute_entries() {
        let base = Url::parse("http://cdn.example.com:8080/live/list.m3u8?auth=tok").unwrap();
        let body = "#EXTM3U\n\
                    #EXTINF:10,\n\
                    seg001.ts?auth=tok\n\
                    #EXTINF:10,\n\
                    http://cdn2.example.com/seg002.ts\n\
                    #EXTINF:10,\n\
                    https://secure.example.com/seg003.ts\n";
        let out = rewrite_m3u(body, &base);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[2], "/http/cdn.example.com:8080/live/seg001.ts?auth=tok");
        assert_eq!(lines[4], "/http/cdn2.example.com/seg002.ts");
        assert_eq!(lines[6], "https://secure.example.com/seg003.ts");
    }

    #[test]
    fn m3u_detection_by_type_and_suffix() {
        let url = Url::parse("http://x/playlist.m3u8").unwrap();
        let head = UpstreamHead {
            status: 200,
            reason: "OK".into(),
            content_type: None,
        };
        assert!(head.is_m3u(&url));

        let url = Url::parse("http://x/data").unwrap();
        let head = UpstreamHead {
            status: 200,
            reason: "OK".into(),
            content_type: Some("application/vnd.apple.mpegurl".into()),
        };
        assert!(head.is_m3u(&url));

        let head = UpstreamHead {
            status: 200,
            reason: "OK".into(),
            content_type: Some("video/mp2t".into()),
        };
        assert!(!head.is_m3u(&url));
    }

    #[tokio::test]
    async fn proxies_body_from_mock_upstream() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]);
            assert!(req.starts_with("GET /data HTTP/1.0\r\n"), "{req}");
            sock.write_all(b"HTTP/1.0 200 OK\r\nContent-Type: application/octet-stream\r\n\r\npayload-bytes")
                .await
                .unwrap();
        });

        let mut upstream = connect("127.0.0.1", addr.port(), None).await.unwrap();
        let url = Url::parse(&format!("http://127.0.0.1:{}/data", addr.port())).unwrap();
        let request = HttpRequest {
            method: crate::http::Method::Get,
            path: "/http/ignored".into(),
            query: String::new(),
            host: None,
            user_agent: None,
            cookie: None,
            accept: None,
            snapshot_header: false,
        };
        send_request(&mut upstream, &url, &request, "127.0.0.1").await.unwrap();
        let (head, body_start) = read_response_head(&mut upstream).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(body_start, b"payload-bytes");
    }
}
