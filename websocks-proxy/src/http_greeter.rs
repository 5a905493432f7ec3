//! HTTP CONNECT and absolute-URI greeters on the shared listener port.
//!
//! CONNECT tunnels opaque bytes (almost always TLS) after a `200`
//! reply. Absolute-URI requests (any other method, addressed as
//! `METHOD scheme://host[:port]/path HTTP/1.x`) have their request
//! target rewritten to `path`, any inbound `Connection`/
//! `Proxy-Connection` header stripped and replaced with
//! `Connection: close`, and the rewritten head forwarded verbatim.
//! Forcing connection-close on the upstream leg means the origin server
//! itself ends the TCP connection once its response is complete, so the
//! byte bridge that follows can stay a dumb EOF-driven copy instead of
//! tracking `Content-Length`/chunked framing to find the message
//! boundary itself — one request per accepted connection, matching how
//! this listener treats CONNECT.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("missing or malformed Host")]
    MissingHost,
    #[error("request head exceeded {0} bytes without a terminator")]
    HeadTooLarge(usize),
    #[error("unsupported request (neither CONNECT nor an absolute-URI)")]
    UnsupportedCommand,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub enum ParsedRequest {
    Connect { host: String, port: u16 },
    Forward { host: String, port: u16, head: Vec<u8> },
}

/// Read bytes one at a time until `\r\n\r\n` is seen (no pipelined data
/// is assumed to follow within the head itself). Bounded so a client
/// can't hold a listener slot open forever by never terminating headers.
async fn read_head(stream: &mut TcpStream) -> Result<Vec<u8>, HttpError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(HttpError::HeadTooLarge(MAX_HEAD_BYTES));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(HttpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before headers completed",
            )));
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            return Ok(buf);
        }
    }
}

pub async fn parse_request(stream: &mut TcpStream) -> Result<ParsedRequest, HttpError> {
    let raw = read_head(stream).await?;
    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(HttpError::MalformedRequestLine)?;
    let rest: Vec<&str> = lines.collect();

    let mut parts = request_line.split(' ');
    let method = parts.next().ok_or(HttpError::MalformedRequestLine)?;
    let target = parts.next().ok_or(HttpError::MalformedRequestLine)?;
    let version = parts.next().ok_or(HttpError::MalformedRequestLine)?;

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(target, 443).ok_or(HttpError::MalformedRequestLine)?;
        return Ok(ParsedRequest::Connect { host, port });
    }

    if let Some(rest_of_uri) = target.strip_prefix("http://") {
        return build_forward(method, rest_of_uri, 80, version, &rest, &raw);
    }
    if let Some(rest_of_uri) = target.strip_prefix("https://") {
        return build_forward(method, rest_of_uri, 443, version, &rest, &raw);
    }

    Err(HttpError::UnsupportedCommand)
}

fn build_forward(
    method: &str,
    rest_of_uri: &str,
    default_port: u16,
    version: &str,
    header_lines: &[&str],
    raw: &[u8],
) -> Result<ParsedRequest, HttpError> {
    let (authority, path) = match rest_of_uri.find('/') {
        Some(idx) => (&rest_of_uri[..idx], &rest_of_uri[idx..]),
        None => (rest_of_uri, "/"),
    };
    let (host, port) = split_host_port(authority, default_port).ok_or(HttpError::MissingHost)?;

    let mut rewritten = format!("{method} {path} {version}\r\n").into_bytes();
    for line in header_lines {
        if line.is_empty() {
            continue;
        }
        let name = line.split_once(':').map(|(n, _)| n.trim()).unwrap_or(line);
        if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("proxy-connection") {
            continue;
        }
        rewritten.extend_from_slice(line.as_bytes());
        rewritten.extend_from_slice(b"\r\n");
    }
    rewritten.extend_from_slice(b"Connection: close\r\n");
    rewritten.extend_from_slice(b"\r\n");

    // Anything already buffered past the head terminator in `raw` (e.g.
    // a request body the client sent in the same initial write) rides
    // along unchanged; `read_head` stops exactly at the terminator so
    // there is nothing trailing to preserve here, but a proxy that grows
    // pipelining support would append it after `rewritten`.
    let _ = raw;

    Ok(ParsedRequest::Forward { host, port, head: rewritten })
}

fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(bracket_end) = authority.strip_prefix('[') {
        let (host, rest) = bracket_end.split_once(']')?;
        let port = match rest.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            Some((host.to_string(), port.parse().ok()?))
        }
        _ => Some((authority.to_string(), default_port)),
    }
}

pub async fn reply_connect_success(stream: &mut TcpStream) -> std::io::Result<()> {
    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\nContent-Length: 0\r\n\r\n")
        .await
}

pub async fn reply_status(stream: &mut TcpStream, status: u16, reason: &str) -> std::io::Result<()> {
    let response = format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_defaults_when_no_port() {
        assert_eq!(
            split_host_port("example.com", 443),
            Some(("example.com".to_string(), 443))
        );
    }

    #[test]
    fn split_host_port_honors_explicit_port() {
        assert_eq!(
            split_host_port("example.com:8080", 443),
            Some(("example.com".to_string(), 8080))
        );
    }

    #[test]
    fn split_host_port_handles_ipv6_literal() {
        assert_eq!(
            split_host_port("[::1]:8443", 443),
            Some(("::1".to_string(), 8443))
        );
    }

    #[test]
    fn build_forward_rewrites_target_and_forces_connection_close() {
        let header_lines = vec!["Host: example.com", "Connection: keep-alive", "Accept: */*"];
        let parsed = build_forward("GET", "example.com/index.html", 80, "HTTP/1.1", &header_lines, b"")
            .expect("forward parses");
        let ParsedRequest::Forward { host, port, head } = parsed else {
            panic!("expected Forward");
        };
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com\r\n"));
        assert!(head.contains("Accept: */*\r\n"));
        assert!(!head.to_ascii_lowercase().contains("keep-alive"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }
}
