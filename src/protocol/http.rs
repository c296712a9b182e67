use crate::utils::error::{BalancerError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROXY_AUTH_REALM: &str = "Basic realm=\"Access to internal site\", charset=\"UTF-8\"";

/// A parsed HTTP proxy request head: the request line plus headers, and the
/// raw bytes of the head (request line + headers + trailing CRLFCRLF) as
/// received, for verbatim forwarding to the upstream on non-CONNECT verbs.
#[derive(Debug, Clone)]
pub struct HttpRequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub raw: Vec<u8>,
}

impl HttpRequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Resolve `host:port` for this request: from the request-target for
    /// CONNECT, from the `Host` header otherwise.
    pub fn target_host_port(&self, default_port: u16) -> Result<(String, u16)> {
        let raw = if self.is_connect() {
            self.target.clone()
        } else {
            self.header("Host")
                .map(|h| h.to_string())
                .ok_or_else(|| BalancerError::Protocol("missing Host header".to_string()))?
        };
        split_host_port(&raw, default_port)
    }
}

fn split_host_port(raw: &str, default_port: u16) -> Result<(String, u16)> {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('[') {
        // IPv6 literal: [::1]:443
        let end = rest
            .find(']')
            .ok_or_else(|| BalancerError::Protocol("malformed IPv6 host".to_string()))?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| BalancerError::Protocol("invalid port".to_string()))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match raw.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| BalancerError::Protocol("invalid port".to_string()))?;
            Ok((host.to_string(), port))
        }
        None => Ok((raw.to_string(), default_port)),
    }
}

/// Read an HTTP request head byte-by-byte until `\r\n\r\n`, given the bytes
/// already consumed during protocol sniffing. `prefix` is prepended to the
/// stream bytes that follow.
pub async fn read_http_request_head<S>(stream: &mut S, prefix: &[u8]) -> Result<HttpRequestHead>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    const MAX_HEAD_LEN: usize = 16 * 1024;
    let mut raw = Vec::with_capacity(512);
    raw.extend_from_slice(prefix);

    loop {
        if raw.len() >= 4 && raw[raw.len() - 4..] == *b"\r\n\r\n" {
            break;
        }
        if raw.len() >= MAX_HEAD_LEN {
            return Err(BalancerError::Protocol(
                "HTTP request head too large".to_string(),
            ));
        }
        let byte = stream.read_u8().await?;
        raw.push(byte);
    }

    parse_request_head(raw)
}

fn parse_request_head(raw: Vec<u8>) -> Result<HttpRequestHead> {
    let text = std::str::from_utf8(&raw)
        .map_err(|_| BalancerError::Protocol("non-UTF8 HTTP request head".to_string()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| BalancerError::Protocol("empty HTTP request".to_string()))?;
    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .ok_or_else(|| BalancerError::Protocol("malformed request line".to_string()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| BalancerError::Protocol("malformed request line".to_string()))?
        .to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(HttpRequestHead {
        method,
        target,
        version,
        headers,
        raw,
    })
}

/// Does this header value present a "Basic" proxy credential? Returns the
/// base64 payload if so (unverified).
pub fn basic_credential_payload(value: &str) -> Option<&str> {
    value.strip_prefix("Basic ")
}

pub async fn send_407_challenge<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let body = format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: {}\r\n\r\n",
        PROXY_AUTH_REALM
    );
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn send_connect_established<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;
    Ok(())
}

pub async fn send_503_unavailable<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream
        .write_all(b"HTTP/1.1 503 Service Unavailable\r\n\r\n")
        .await?;
    stream.flush().await?;
    Ok(())
}
