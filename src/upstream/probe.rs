use crate::protocol::parser::{
    read_socks5_response, read_userpass_auth_response, send_socks5_request, send_userpass_auth,
};
use crate::protocol::types::{Address, AuthMethod, Command, ReplyCode, Socks5Request};
use crate::utils::error::{BalancerError, Result};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Fire-and-forget TCP reachability probe. Returns the observed RTT in
/// milliseconds on success.
pub async fn tcp_probe(host: &str, port: u16, connect_timeout: Duration) -> Result<i64> {
    let start = Instant::now();
    let addr = format!("{}:{}", host, port);
    match timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => Ok(start.elapsed().as_millis() as i64),
        Ok(Err(e)) => Err(BalancerError::Io(e)),
        Err(_) => Err(BalancerError::Timeout),
    }
}

fn tls_root_store() -> rustls::RootCertStore {
    let mut store = rustls::RootCertStore::empty();
    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    store
}

/// Opens a SOCKS5 session through `upstream` to `(test_host, test_port)`, then
/// performs a TLS handshake and a minimal HTTP HEAD request over it. Returns
/// `(rtt_ms, "status_code:N")` on success.
pub async fn https_probe(
    upstream_host: &str,
    upstream_port: u16,
    upstream_auth: Option<(&str, &str)>,
    test_host: &str,
    test_port: u16,
    timeout_dur: Duration,
) -> Result<(i64, String)> {
    let fut = https_probe_inner(
        upstream_host,
        upstream_port,
        upstream_auth,
        test_host,
        test_port,
    );
    let start = Instant::now();
    match timeout(timeout_dur, fut).await {
        Ok(Ok(status)) => Ok((start.elapsed().as_millis() as i64, status)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(BalancerError::Timeout),
    }
}

async fn https_probe_inner(
    upstream_host: &str,
    upstream_port: u16,
    upstream_auth: Option<(&str, &str)>,
    test_host: &str,
    test_port: u16,
) -> Result<String> {
    let addr = format!("{}:{}", upstream_host, upstream_port);
    let mut stream = TcpStream::connect(&addr).await?;

    let method = if upstream_auth.is_some() {
        AuthMethod::UserPass
    } else {
        AuthMethod::NoAuth
    };
    stream.write_all(&[0x05, 0x01, method as u8]).await?;
    stream.flush().await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        return Err(BalancerError::UpstreamHandshake(
            "bad SOCKS5 version in probe".to_string(),
        ));
    }

    if choice[1] == 0x02 {
        let (user, pwd) = upstream_auth.ok_or_else(|| {
            BalancerError::UpstreamHandshake("auth requested but none configured".into())
        })?;
        send_userpass_auth(&mut stream, user, pwd).await?;
        if !read_userpass_auth_response(&mut stream).await? {
            return Err(BalancerError::UpstreamHandshake(
                "upstream rejected probe credentials".to_string(),
            ));
        }
    } else if choice[1] != 0x00 {
        return Err(BalancerError::UpstreamHandshake(
            "upstream offered no acceptable auth method".to_string(),
        ));
    }

    send_socks5_request(
        &mut stream,
        &Socks5Request {
            command: Command::Connect,
            address: Address::Domain(test_host.to_string()),
            port: test_port,
        },
    )
    .await?;

    let resp = read_socks5_response(&mut stream).await?;
    if resp.reply != ReplyCode::Succeeded {
        return Err(BalancerError::UpstreamHandshake(format!(
            "upstream refused probe CONNECT: {:?}",
            resp.reply
        )));
    }

    let root_store = tls_root_store();
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(test_host.to_string())
        .map_err(|_| BalancerError::Protocol("invalid TLS server name".to_string()))?;
    let mut tls = connector.connect(server_name, stream).await?;

    let request = format!(
        "HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        test_host
    );
    tls.write_all(request.as_bytes()).await?;
    tls.flush().await?;

    let mut buf = [0u8; 64];
    let n = tls.read(&mut buf).await?;
    let line = String::from_utf8_lossy(&buf[..n]);
    let status_code = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| BalancerError::Protocol("malformed HTTP status line".to_string()))?;

    trace!(test_host, status_code, "https probe completed");
    Ok(format!("status_code:{}", status_code))
}
