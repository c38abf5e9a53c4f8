//! Protocol-upgrade tunnels (WebSocket and friends)
//!
//! ```text
//! client ── upgrade request ──> proxy ── rebuilt request + forwarding headers ──> backend
//! client <── 101 + backend headers ── proxy <── 101 ── backend
//! client <════════════ raw bytes, both directions ════════════> backend
//! ```
//!
//! The request head is rebuilt by hand from the parsed request because the inbound
//! connection leaves ordinary request/response handling once the upgrade completes.

use crate::error::{empty_body, full_body, status_line_response, ProxyBody, ProxyErrorCode};
use crate::readiness::ReadinessGate;
use crate::upstream::{Upstream, UpstreamError};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for forwarded-for
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Header name for forwarded host
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for the real client IP
pub const X_REAL_IP: &str = "x-real-ip";

/// Protocol name used when the client sent an empty Upgrade header
const DEFAULT_UPGRADE_PROTOCOL: &str = "websocket";

/// Upper bound on the backend's handshake response head
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Upper bound on a refused handshake's body relayed to the client
const MAX_REJECTION_BODY: usize = 1024 * 1024;

/// Check if a request asks for a protocol upgrade
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.headers().contains_key(UPGRADE)
}

/// Forwarding metadata derived from an upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedMetadata {
    /// Original client address: first hop of an existing X-Forwarded-For, else the peer
    pub client: String,
    /// "https" when the request target declares a secure scheme, else "http"
    pub proto: &'static str,
    /// Host header as sent by the client
    pub host: Option<String>,
    /// Requested upgrade protocol
    pub upgrade: String,
}

impl ForwardedMetadata {
    pub fn from_request<B>(req: &Request<B>, peer: SocketAddr) -> Self {
        let headers = req.headers();

        let client = header_str(headers, X_FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
            .unwrap_or_else(|| peer.ip().to_string());

        let proto = match req.uri().scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("https") || s.eq_ignore_ascii_case("wss") => "https",
            _ => "http",
        };

        let host = header_str(headers, HOST.as_str()).map(String::from);

        let upgrade = header_str(headers, UPGRADE.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_UPGRADE_PROTOCOL)
            .to_string();

        Self {
            client,
            proto,
            host,
            upgrade,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// True if any Connection header value lists the `upgrade` token
fn connection_requests_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn has_upgrade_protocol(headers: &HeaderMap) -> bool {
    headers
        .get_all(UPGRADE)
        .iter()
        .any(|v| !v.as_bytes().iter().all(u8::is_ascii_whitespace))
}

fn push_header(buf: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    buf.extend_from_slice(name);
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
}

/// Build the raw HTTP upgrade request to send to the backend.
///
/// Inbound headers are replayed in order, with repeated values folded onto one line.
/// Forwarding headers the client did not send are appended, and the Connection and
/// Upgrade headers are guaranteed to be present exactly once.
pub fn build_upgrade_request<B>(req: &Request<B>, peer: SocketAddr) -> Vec<u8> {
    let meta = ForwardedMetadata::from_request(req, peer);
    let headers = req.headers();
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let mut buf = Vec::with_capacity(512);
    buf.extend_from_slice(format!("{} {} {:?}\r\n", req.method(), path, req.version()).as_bytes());

    let keep_connection = connection_requests_upgrade(headers);
    let keep_upgrade = has_upgrade_protocol(headers);

    for name in headers.keys() {
        if (*name == CONNECTION && !keep_connection) || (*name == UPGRADE && !keep_upgrade) {
            continue;
        }
        let value = headers
            .get_all(name)
            .iter()
            .map(HeaderValue::as_bytes)
            .collect::<Vec<_>>()
            .join(&b", "[..]);
        push_header(&mut buf, name.as_str().as_bytes(), &value);
    }

    if !headers.contains_key(X_FORWARDED_FOR) {
        push_header(&mut buf, b"X-Forwarded-For", meta.client.as_bytes());
    }
    if !headers.contains_key(X_FORWARDED_PROTO) {
        push_header(&mut buf, b"X-Forwarded-Proto", meta.proto.as_bytes());
    }
    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = &meta.host {
            push_header(&mut buf, b"X-Forwarded-Host", host.as_bytes());
        }
    }
    if !headers.contains_key(X_REAL_IP) {
        push_header(&mut buf, b"X-Real-IP", meta.client.as_bytes());
    }

    if !keep_connection {
        push_header(&mut buf, b"Connection", b"Upgrade");
    }
    if !keep_upgrade {
        push_header(&mut buf, b"Upgrade", meta.upgrade.as_bytes());
    }

    buf.extend_from_slice(b"\r\n");
    buf
}

/// The backend's answer to the upgrade request
#[derive(Debug)]
pub struct BackendHandshake {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    /// Bytes the backend sent after its response head
    pub leftover: Bytes,
}

/// Find the end of an HTTP head, returning the offset just past the blank line
fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse the status line and headers of a response head
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let head = std::str::from_utf8(head).ok()?;
    let mut lines = head.split("\r\n");

    // Format: "HTTP/1.1 101 Switching Protocols"
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Some((status, headers))
}

/// Read the backend's response head, keeping anything that arrived after it
pub async fn read_backend_handshake<S>(backend: &mut S) -> Result<BackendHandshake, UpstreamError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        let n = backend.read(&mut chunk).await?;
        if n == 0 {
            return Err(UpstreamError::ClosedEarly);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(UpstreamError::ResponseTooLarge(MAX_RESPONSE_HEAD));
        }
    };

    let (status, headers) =
        parse_upgrade_response(&buf[..head_end]).ok_or(UpstreamError::MalformedResponse)?;
    let leftover = Bytes::copy_from_slice(&buf[head_end..]);

    Ok(BackendHandshake {
        status,
        headers,
        leftover,
    })
}

/// Which side ended a tunnel, with the bytes it had sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEnd {
    ClientClosed { client_to_backend: u64 },
    BackendClosed { backend_to_client: u64 },
}

/// Splice two streams until either one closes or errors.
///
/// `client_head` (bytes already read from the client) goes to the backend first and
/// `backend_head` (bytes already read from the backend) goes to the client first. When
/// one direction finishes the other is abandoned and both streams are dropped, closing
/// them; half-closed tunnels are not kept alive.
pub async fn splice<C, B>(
    client: C,
    backend: B,
    client_head: Bytes,
    backend_head: Bytes,
) -> std::io::Result<TunnelEnd>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    if !client_head.is_empty() {
        backend_write.write_all(&client_head).await?;
    }
    if !backend_head.is_empty() {
        client_write.write_all(&backend_head).await?;
    }

    let client_to_backend = tokio::io::copy(&mut client_read, &mut backend_write);
    let backend_to_client = tokio::io::copy(&mut backend_read, &mut client_write);

    tokio::select! {
        result = client_to_backend => Ok(TunnelEnd::ClientClosed {
            client_to_backend: result? + client_head.len() as u64,
        }),
        result = backend_to_client => Ok(TunnelEnd::BackendClosed {
            backend_to_client: result? + backend_head.len() as u64,
        }),
    }
}

/// Splice an upgraded client connection with its backend connection
async fn forward_upgraded(upgraded: Upgraded, backend: TcpStream, backend_head: Bytes, tunnel_id: Uuid) {
    // Recover the raw socket so bytes hyper buffered past the request head can be
    // replayed explicitly
    let result = match upgraded.downcast::<TokioIo<TcpStream>>() {
        Ok(parts) => splice(parts.io.into_inner(), backend, parts.read_buf, backend_head).await,
        Err(upgraded) => splice(TokioIo::new(upgraded), backend, Bytes::new(), backend_head).await,
    };

    match result {
        Ok(end) => debug!(%tunnel_id, ?end, "Tunnel closed"),
        Err(e) => debug!(%tunnel_id, error = %e, "Tunnel closed with error"),
    }
}

/// How the body of a non-101 backend response is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

fn response_framing(
    status: StatusCode,
    headers: &[(String, String)],
    head_only: bool,
) -> Result<Framing, UpstreamError> {
    if head_only
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::Empty);
    }

    let header = |wanted: &str| {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value.as_str())
    };

    if header("transfer-encoding").is_some_and(is_chunked_coding) {
        return Ok(Framing::Chunked);
    }
    match header("content-length") {
        Some(len) => len
            .trim()
            .parse()
            .map(Framing::Length)
            .map_err(|_| UpstreamError::MalformedResponse),
        None => Ok(Framing::UntilClose),
    }
}

/// True if `chunked` is the final transfer coding
fn is_chunked_coding(value: &str) -> bool {
    value
        .rsplit(',')
        .next()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn request_is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .last()
        .is_some_and(is_chunked_coding)
}

/// Send the client's request body after the rebuilt head, in the client's framing.
///
/// hyper has already decoded the body, so chunked bodies are re-chunked here.
pub async fn send_request_body<B, W>(
    mut body: B,
    chunked: bool,
    backend: &mut W,
) -> Result<u64, UpstreamError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    W: AsyncWrite + Unpin,
{
    let mut sent = 0u64;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| UpstreamError::ClientBody(e.into()))?;
        // trailers are dropped
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if data.is_empty() {
            continue;
        }

        if chunked {
            backend
                .write_all(format!("{:x}\r\n", data.len()).as_bytes())
                .await?;
            backend.write_all(&data).await?;
            backend.write_all(b"\r\n").await?;
        } else {
            backend.write_all(&data).await?;
        }
        sent += data.len() as u64;
    }

    if chunked {
        backend.write_all(b"0\r\n\r\n").await?;
    }
    Ok(sent)
}

/// Read the rest of a refused handshake's body, starting with the bytes already buffered
pub async fn read_rejection_body<S>(
    backend: &mut S,
    handshake: &BackendHandshake,
    head_only: bool,
) -> Result<Bytes, UpstreamError>
where
    S: AsyncRead + Unpin,
{
    let framing = response_framing(handshake.status, &handshake.headers, head_only)?;
    let mut reader = BufReader::new((&handshake.leftover[..]).chain(backend));

    match framing {
        Framing::Empty => Ok(Bytes::new()),
        Framing::Length(len) => {
            if len > MAX_REJECTION_BODY {
                return Err(UpstreamError::ResponseTooLarge(MAX_REJECTION_BODY));
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            Ok(body.into())
        }
        Framing::Chunked => read_chunked_body(&mut reader).await,
        Framing::UntilClose => {
            let mut body = Vec::new();
            (&mut reader)
                .take(MAX_REJECTION_BODY as u64 + 1)
                .read_to_end(&mut body)
                .await?;
            if body.len() > MAX_REJECTION_BODY {
                return Err(UpstreamError::ResponseTooLarge(MAX_REJECTION_BODY));
            }
            Ok(body.into())
        }
    }
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Bytes, UpstreamError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(UpstreamError::ClosedEarly);
        }
        // Format: "1a;ext=value\r\n"
        let size = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size, 16).map_err(|_| UpstreamError::MalformedResponse)?;
        if size == 0 {
            break;
        }
        if body.len() + size > MAX_REJECTION_BODY {
            return Err(UpstreamError::ResponseTooLarge(MAX_REJECTION_BODY));
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        line.clear();
        reader.read_line(&mut line).await?;
    }

    // skip trailers up to the closing blank line
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim_end().is_empty() {
            break;
        }
    }

    Ok(body.into())
}

/// Relay a non-101 backend answer to the client as an ordinary response
fn rejection_response(
    status: StatusCode,
    headers: &[(String, String)],
    body: Bytes,
) -> Response<ProxyBody> {
    let mut response = Response::builder().status(status);
    for (name, value) in headers {
        // the body is complete, hyper frames it again
        if is_framing_header(name) {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    response
        .header(CONNECTION, "close")
        .body(full_body(body))
        .unwrap_or_else(|_| status_line_response(ProxyErrorCode::InternalError))
}

fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
}

/// Handle a protocol-upgrade request
pub async fn handle_upgrade(
    mut req: Request<Incoming>,
    gate: &ReadinessGate,
    upstream: &Upstream,
    peer: SocketAddr,
) -> Response<ProxyBody> {
    // Checked before the first await so the decision can't go stale
    if !gate.is_ready() {
        debug!(%peer, uri = %req.uri(), "Rejecting upgrade, backend not ready");
        return status_line_response(ProxyErrorCode::NotReady);
    }

    let tunnel_id = Uuid::new_v4();
    let raw_request = build_upgrade_request(&req, peer);
    let upgrade_type = ForwardedMetadata::from_request(&req, peer).upgrade;
    let chunked = request_is_chunked(req.headers());
    let head_only = *req.method() == Method::HEAD;
    debug!(%tunnel_id, %peer, uri = %req.uri(), %upgrade_type, "Handling upgrade request");

    // Claimed before the body is taken; resolves once the 101 has gone out
    let on_upgrade = hyper::upgrade::on(&mut req);
    let body = req.into_body();

    let mut backend = match upstream.connect().await {
        Ok(stream) => stream,
        Err(e) => {
            error!(%tunnel_id, error = %e, "Failed to connect to backend for upgrade");
            return status_line_response(ProxyErrorCode::ConnectionFailed);
        }
    };

    if let Err(e) = backend.write_all(&raw_request).await {
        error!(%tunnel_id, error = %e, "Failed to send upgrade request to backend");
        return status_line_response(ProxyErrorCode::ConnectionFailed);
    }

    match send_request_body(body, chunked, &mut backend).await {
        Ok(0) => {}
        Ok(sent) => debug!(%tunnel_id, sent, "Upgrade request body sent to backend"),
        Err(e) => {
            error!(%tunnel_id, error = %e, "Failed to send upgrade request body to backend");
            return status_line_response(ProxyErrorCode::ConnectionFailed);
        }
    }

    let handshake = match read_backend_handshake(&mut backend).await {
        Ok(handshake) => handshake,
        Err(e) => {
            error!(%tunnel_id, error = %e, "Failed to read upgrade response from backend");
            return status_line_response(ProxyErrorCode::ConnectionFailed);
        }
    };

    if handshake.status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(%tunnel_id, status = %handshake.status, "Backend rejected upgrade request");
        return match read_rejection_body(&mut backend, &handshake, head_only).await {
            Ok(body) => rejection_response(handshake.status, &handshake.headers, body),
            Err(e) => {
                error!(%tunnel_id, error = %e, "Failed to read rejection body from backend");
                status_line_response(ProxyErrorCode::ConnectionFailed)
            }
        };
    }

    info!(%tunnel_id, %upgrade_type, "Upgrade accepted by backend");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &handshake.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = match response.body(empty_body()) {
        Ok(response) => response,
        Err(e) => {
            error!(%tunnel_id, error = %e, "Invalid upgrade response headers from backend");
            return status_line_response(ProxyErrorCode::InternalError);
        }
    };

    let backend_head = handshake.leftover;
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => forward_upgraded(upgraded, backend, backend_head, tunnel_id).await,
            Err(e) => debug!(%tunnel_id, error = %e, "Failed to upgrade client connection"),
        }
    });

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn peer() -> SocketAddr {
        "203.0.113.5:51234".parse().unwrap()
    }

    fn upgrade_request() -> hyper::http::request::Builder {
        Request::builder()
            .method("GET")
            .uri("/ws?room=1")
            .header("Host", "gateway.example.com")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
    }

    fn head_lines(raw: &[u8]) -> Vec<String> {
        let text = std::str::from_utf8(raw).unwrap();
        assert!(text.ends_with("\r\n\r\n"));
        text.trim_end_matches("\r\n").split("\r\n").map(String::from).collect()
    }

    fn count_header(lines: &[String], name: &str) -> usize {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        lines
            .iter()
            .filter(|l| l.to_ascii_lowercase().starts_with(&prefix))
            .count()
    }

    #[test]
    fn test_request_line_reconstructed() {
        let req = upgrade_request().body(()).unwrap();
        let lines = head_lines(&build_upgrade_request(&req, peer()));
        assert_eq!(lines[0], "GET /ws?room=1 HTTP/1.1");
    }

    #[test]
    fn test_adds_four_forwarding_headers() {
        let req = upgrade_request().body(()).unwrap();
        let lines = head_lines(&build_upgrade_request(&req, peer()));

        // request line + 5 inbound headers + 4 forwarding headers
        assert_eq!(lines.len(), 1 + 5 + 4);
        assert!(lines.contains(&"X-Forwarded-For: 203.0.113.5".to_string()));
        assert!(lines.contains(&"X-Forwarded-Proto: http".to_string()));
        assert!(lines.contains(&"X-Forwarded-Host: gateway.example.com".to_string()));
        assert!(lines.contains(&"X-Real-IP: 203.0.113.5".to_string()));
    }

    #[test]
    fn test_existing_forwarded_for_preserved() {
        let req = upgrade_request()
            .header("X-Forwarded-For", "198.51.100.7, 10.0.0.1")
            .body(())
            .unwrap();
        let lines = head_lines(&build_upgrade_request(&req, peer()));

        assert_eq!(count_header(&lines, "x-forwarded-for"), 1);
        assert!(lines.contains(&"x-forwarded-for: 198.51.100.7, 10.0.0.1".to_string()));
        // the first hop becomes the real client address
        assert!(lines.contains(&"X-Real-IP: 198.51.100.7".to_string()));
    }

    #[test]
    fn test_existing_forwarding_headers_not_duplicated() {
        let req = upgrade_request()
            .header("X-Forwarded-Proto", "https")
            .header("X-Forwarded-Host", "public.example.com")
            .header("X-Real-IP", "192.0.2.1")
            .body(())
            .unwrap();
        let lines = head_lines(&build_upgrade_request(&req, peer()));

        for name in [X_FORWARDED_PROTO, X_FORWARDED_HOST, X_REAL_IP, X_FORWARDED_FOR] {
            assert_eq!(count_header(&lines, name), 1, "{name} duplicated or missing");
        }
        assert!(lines.contains(&"x-forwarded-proto: https".to_string()));
        assert!(lines.contains(&"x-real-ip: 192.0.2.1".to_string()));
    }

    #[test]
    fn test_secure_scheme_sets_https_proto() {
        let req = upgrade_request().uri("wss://gateway.example.com/ws").body(()).unwrap();
        let meta = ForwardedMetadata::from_request(&req, peer());
        assert_eq!(meta.proto, "https");

        let lines = head_lines(&build_upgrade_request(&req, peer()));
        assert!(lines.contains(&"X-Forwarded-Proto: https".to_string()));
        assert_eq!(lines[0], "GET /ws HTTP/1.1");
    }

    #[test]
    fn test_repeated_header_values_joined() {
        let req = upgrade_request()
            .header("Sec-WebSocket-Protocol", "chat")
            .header("Sec-WebSocket-Protocol", "superchat")
            .body(())
            .unwrap();
        let lines = head_lines(&build_upgrade_request(&req, peer()));

        assert_eq!(count_header(&lines, "sec-websocket-protocol"), 1);
        assert!(lines.contains(&"sec-websocket-protocol: chat, superchat".to_string()));
    }

    #[test]
    fn test_header_order_preserved() {
        let req = upgrade_request().body(()).unwrap();
        let lines = head_lines(&build_upgrade_request(&req, peer()));
        let names: Vec<&str> = lines[1..6].iter().map(|l| l.split(':').next().unwrap()).collect();
        assert_eq!(
            names,
            ["host", "upgrade", "connection", "sec-websocket-key", "sec-websocket-version"]
        );
    }

    #[test]
    fn test_connection_upgrade_not_duplicated() {
        let req = upgrade_request()
            .header("Connection", "keep-alive")
            .body(())
            .unwrap();
        let lines = head_lines(&build_upgrade_request(&req, peer()));
        assert_eq!(count_header(&lines, "connection"), 1);
        assert!(lines.contains(&"connection: Upgrade, keep-alive".to_string()));
        assert_eq!(count_header(&lines, "upgrade"), 1);
    }

    #[test]
    fn test_missing_connection_upgrade_added() {
        let req = Request::builder()
            .uri("/ws")
            .header("Host", "localhost")
            .header("Upgrade", "websocket")
            .header("Connection", "keep-alive")
            .body(())
            .unwrap();
        let lines = head_lines(&build_upgrade_request(&req, peer()));

        assert_eq!(count_header(&lines, "connection"), 1);
        assert!(lines.contains(&"Connection: Upgrade".to_string()));
        assert!(lines.contains(&"upgrade: websocket".to_string()));
    }

    #[test]
    fn test_empty_upgrade_defaults_to_websocket() {
        let req = Request::builder()
            .uri("/ws")
            .header("Upgrade", "")
            .header("Connection", "upgrade")
            .body(())
            .unwrap();
        let lines = head_lines(&build_upgrade_request(&req, peer()));

        assert_eq!(count_header(&lines, "upgrade"), 1);
        assert!(lines.contains(&"Upgrade: websocket".to_string()));
        // no Host header, so no X-Forwarded-Host either
        assert_eq!(count_header(&lines, "x-forwarded-host"), 0);
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = upgrade_request().body(()).unwrap();
        assert!(is_upgrade_request(&req));

        let plain = Request::builder().uri("/").body(()).unwrap();
        assert!(!is_upgrade_request(&plain));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_upgrade_response(b"SSH-2.0-OpenSSH\r\n\r\n").is_none());
        assert!(parse_upgrade_response(b"HTTP/1.1 abc Nope\r\n\r\n").is_none());
    }

    #[tokio::test]
    async fn test_read_handshake_keeps_leftover() {
        let (mut backend, mut proxy_side) = duplex(4096);
        backend
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x02hi")
            .await
            .unwrap();

        let handshake = read_backend_handshake(&mut proxy_side).await.unwrap();
        assert_eq!(handshake.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(&handshake.leftover[..], b"\x81\x02hi");
    }

    #[tokio::test]
    async fn test_read_handshake_closed_early() {
        let (backend, mut proxy_side) = duplex(64);
        drop(backend);
        let err = read_backend_handshake(&mut proxy_side).await.unwrap_err();
        assert!(matches!(err, UpstreamError::ClosedEarly));
    }

    #[tokio::test]
    async fn test_splice_moves_bytes_both_ways() {
        let (mut client, client_proxy) = duplex(1024);
        let (backend_proxy, mut backend) = duplex(1024);

        let tunnel = tokio::spawn(splice(
            client_proxy,
            backend_proxy,
            Bytes::from_static(b"early"),
            Bytes::from_static(b"hello"),
        ));

        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        let end = tunnel.await.unwrap().unwrap();
        assert_eq!(end, TunnelEnd::ClientClosed { client_to_backend: 9 });

        // backend side sees the tunnel go away too
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_splice_backend_close_ends_tunnel() {
        let (mut client, client_proxy) = duplex(1024);
        let (backend_proxy, backend) = duplex(1024);

        let tunnel = tokio::spawn(splice(client_proxy, backend_proxy, Bytes::new(), Bytes::new()));
        drop(backend);

        let end = tunnel.await.unwrap().unwrap();
        assert_eq!(end, TunnelEnd::BackendClosed { backend_to_client: 0 });

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_request_body_sent_with_length_framing() {
        let (mut proxy_side, mut backend) = duplex(1024);
        let body = http_body_util::Full::new(Bytes::from_static(b"hello"));

        let sent = send_request_body(body, false, &mut proxy_side).await.unwrap();
        assert_eq!(sent, 5);
        drop(proxy_side);

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn test_request_body_rechunked() {
        let (mut proxy_side, mut backend) = duplex(1024);
        let body = http_body_util::Full::new(Bytes::from_static(b"hello world"));

        send_request_body(body, true, &mut proxy_side).await.unwrap();
        drop(proxy_side);

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"b\r\nhello world\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn test_empty_request_body_sends_nothing() {
        let (mut proxy_side, mut backend) = duplex(64);
        let body = http_body_util::Empty::<Bytes>::new();

        assert_eq!(send_request_body(body, false, &mut proxy_side).await.unwrap(), 0);
        drop(proxy_side);

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[test]
    fn test_request_chunked_detection() {
        let mut headers = HeaderMap::new();
        assert!(!request_is_chunked(&headers));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip, chunked"));
        assert!(request_is_chunked(&headers));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked, gzip"));
        assert!(!request_is_chunked(&headers));
    }

    #[tokio::test]
    async fn test_rejection_body_arriving_later() {
        let (mut backend, mut proxy_side) = duplex(1024);
        backend
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 11\r\n\r\n")
            .await
            .unwrap();

        let handshake = read_backend_handshake(&mut proxy_side).await.unwrap();
        assert!(handshake.leftover.is_empty());

        let writer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            backend.write_all(b"denied-full").await.unwrap();
            backend
        });

        let body = read_rejection_body(&mut proxy_side, &handshake, false).await.unwrap();
        assert_eq!(&body[..], b"denied-full");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_rejection_body_dechunked() {
        let (mut backend, mut proxy_side) = duplex(1024);
        backend
            .write_all(
                b"HTTP/1.1 400 Bad Request\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: t\r\n\r\n",
            )
            .await
            .unwrap();

        let handshake = read_backend_handshake(&mut proxy_side).await.unwrap();
        let body = read_rejection_body(&mut proxy_side, &handshake, false).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_rejection_body_until_close() {
        let (mut backend, mut proxy_side) = duplex(1024);
        backend
            .write_all(b"HTTP/1.1 426 Upgrade Required\r\n\r\nuse h2c")
            .await
            .unwrap();
        drop(backend);

        let handshake = read_backend_handshake(&mut proxy_side).await.unwrap();
        let body = read_rejection_body(&mut proxy_side, &handshake, false).await.unwrap();
        assert_eq!(&body[..], b"use h2c");
    }

    #[tokio::test]
    async fn test_rejection_without_body() {
        let (mut backend, mut proxy_side) = duplex(1024);
        backend
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n")
            .await
            .unwrap();

        // HEAD responses carry no body whatever the headers say
        let handshake = read_backend_handshake(&mut proxy_side).await.unwrap();
        let body = read_rejection_body(&mut proxy_side, &handshake, true).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_relays_status_and_headers() {
        let headers = vec![
            ("X-Reason".to_string(), "origin".to_string()),
            ("Content-Length".to_string(), "6".to_string()),
        ];
        let response = rejection_response(StatusCode::FORBIDDEN, &headers, Bytes::from_static(b"denied"));

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers().get("x-reason").unwrap(), "origin");
        assert_eq!(response.headers().get(CONNECTION).unwrap(), "close");
        assert!(response.headers().get("content-length").is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"denied");
    }

    #[test]
    fn test_rejection_with_invalid_header_name_is_internal_error() {
        let headers = vec![("Bad Header".to_string(), "x".to_string())];
        let response = rejection_response(StatusCode::FORBIDDEN, &headers, Bytes::new());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
