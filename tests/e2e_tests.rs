/// End-to-end integration tests driving the balancer through real sockets:
/// SOCKS5 and SOCKS4a CONNECT, HTTP CONNECT with Proxy-Authorization, upstream
/// exhaustion, and the admin HTTP op surface.
use socks_balancer::config::{AuthClientEntry, Config, UpstreamEntry};
use socks_balancer::server::ProxyServer;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;

/// Binds to an ephemeral port and hands back the address, freeing the port
/// immediately so the caller's config can name it ahead of the real bind.
async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Spawns a bare echo server for the upstream's final destination to relay to.
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            if let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

/// Spawns a bare SOCKS5 server standing in for one upstream proxy: accepts a
/// CONNECT and then relays straight through to whatever address it was asked
/// for, ignoring its own auth unless `require_auth` is set.
async fn spawn_upstream_socks5(require_auth: Option<(&'static str, &'static str)>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut s, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                s.read_exact(&mut greeting).await.unwrap();
                let mut methods = vec![0u8; greeting[1] as usize];
                s.read_exact(&mut methods).await.unwrap();

                if let Some((user, pwd)) = require_auth {
                    s.write_all(&[0x05, 0x02]).await.unwrap();
                    let mut ver_ulen = [0u8; 2];
                    s.read_exact(&mut ver_ulen).await.unwrap();
                    let mut uname = vec![0u8; ver_ulen[1] as usize];
                    s.read_exact(&mut uname).await.unwrap();
                    let mut plen = [0u8; 1];
                    s.read_exact(&mut plen).await.unwrap();
                    let mut pwd_buf = vec![0u8; plen[0] as usize];
                    s.read_exact(&mut pwd_buf).await.unwrap();
                    let ok = uname == user.as_bytes() && pwd_buf == pwd.as_bytes();
                    s.write_all(&[0x01, if ok { 0x00 } else { 0x01 }])
                        .await
                        .unwrap();
                    if !ok {
                        return;
                    }
                } else {
                    s.write_all(&[0x05, 0x00]).await.unwrap();
                }

                let mut head = [0u8; 4];
                s.read_exact(&mut head).await.unwrap();
                match head[3] {
                    0x01 => {
                        let mut rest = [0u8; 6];
                        s.read_exact(&mut rest).await.unwrap();
                    }
                    0x03 => {
                        let mut len = [0u8; 1];
                        s.read_exact(&mut len).await.unwrap();
                        let mut rest = vec![0u8; len[0] as usize + 2];
                        s.read_exact(&mut rest).await.unwrap();
                    }
                    other => panic!("unexpected address type {}", other),
                }

                s.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();

                let mut buf = [0u8; 1024];
                loop {
                    let n = match s.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if s.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

fn base_config(listen_addr: SocketAddr, upstream_port: u16) -> Config {
    Config {
        listen_host: listen_addr.ip().to_string(),
        listen_port: listen_addr.port(),
        disable_connect_test: true,
        retry_times: 1,
        upstream: vec![UpstreamEntry {
            host: "127.0.0.1".to_string(),
            port: upstream_port,
            name: "u0".to_string(),
            disable: false,
            auth_user: None,
            auth_pwd: None,
        }],
        ..Config::default()
    }
}

async fn spawn_balancer(config: Config) -> std::sync::Arc<ProxyServer> {
    let server = ProxyServer::new(config);
    let run_server = server.clone();
    tokio::spawn(async move {
        let _ = run_server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    server
}

#[tokio::test]
async fn e2e_socks5_noauth_connect() {
    let echo_addr = spawn_echo_server().await;
    let upstream_addr = spawn_upstream_socks5(None).await;
    let listen_addr = free_addr().await;
    let _server = spawn_balancer(base_config(listen_addr, upstream_addr.port())).await;

    let mut client = TcpStream::connect(listen_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    match echo_addr.ip() {
        std::net::IpAddr::V4(ip) => req.extend_from_slice(&ip.octets()),
        _ => unreachable!(),
    }
    req.extend_from_slice(&echo_addr.port().to_be_bytes());
    client.write_all(&req).await.unwrap();

    let mut ack = [0u8; 10];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[1], 0x00, "CONNECT should succeed");

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn e2e_socks5_userpass_auth_valid_and_invalid() {
    let echo_addr = spawn_echo_server().await;
    let upstream_addr = spawn_upstream_socks5(None).await;
    let listen_addr = free_addr().await;
    let mut config = base_config(listen_addr, upstream_addr.port());
    config.auth_client_info = vec![AuthClientEntry {
        user: "alice".to_string(),
        pwd: "secret123".to_string(),
    }];
    let _server = spawn_balancer(config).await;

    // Valid credentials.
    let mut client = TcpStream::connect(listen_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x02]);

    let mut auth = vec![0x01, 5];
    auth.extend_from_slice(b"alice");
    auth.push(9);
    auth.extend_from_slice(b"secret123");
    client.write_all(&auth).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x01, 0x00]);

    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    match echo_addr.ip() {
        std::net::IpAddr::V4(ip) => req.extend_from_slice(&ip.octets()),
        _ => unreachable!(),
    }
    req.extend_from_slice(&echo_addr.port().to_be_bytes());
    client.write_all(&req).await.unwrap();
    let mut ack = [0u8; 10];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[1], 0x00);

    // Invalid credentials on a fresh connection.
    let mut bad_client = TcpStream::connect(listen_addr).await.unwrap();
    bad_client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut choice = [0u8; 2];
    bad_client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x02]);

    let mut auth = vec![0x01, 5];
    auth.extend_from_slice(b"alice");
    auth.push(6);
    auth.extend_from_slice(b"wrong1");
    bad_client.write_all(&auth).await.unwrap();
    let mut resp = [0u8; 2];
    bad_client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x01, 0x01], "bad credentials should be rejected");
}

#[tokio::test]
async fn e2e_socks4a_connect() {
    let echo_addr = spawn_echo_server().await;
    let upstream_addr = spawn_upstream_socks5(None).await;
    let listen_addr = free_addr().await;
    let _server = spawn_balancer(base_config(listen_addr, upstream_addr.port())).await;

    let mut client = TcpStream::connect(listen_addr).await.unwrap();
    // SOCKS4a: dest IP is 0.0.0.x with a trailing hostname after the userid NUL.
    let mut req = vec![0x04, 0x01];
    req.extend_from_slice(&echo_addr.port().to_be_bytes());
    req.extend_from_slice(&[0, 0, 0, 1]);
    req.push(0); // empty userid
    req.extend_from_slice(b"127.0.0.1");
    req.push(0);
    client.write_all(&req).await.unwrap();

    let mut resp = [0u8; 8];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp[1], 0x5a, "SOCKS4 request should be granted");

    client.write_all(b"socks4a").await.unwrap();
    let mut buf = [0u8; 7];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"socks4a");
}

#[tokio::test]
async fn e2e_http_connect_with_proxy_auth() {
    let echo_addr = spawn_echo_server().await;
    let upstream_addr = spawn_upstream_socks5(None).await;
    let listen_addr = free_addr().await;
    let mut config = base_config(listen_addr, upstream_addr.port());
    config.auth_client_info = vec![AuthClientEntry {
        user: "bob".to_string(),
        pwd: "hunter2".to_string(),
    }];
    let _server = spawn_balancer(config).await;

    let mut client = TcpStream::connect(listen_addr).await.unwrap();
    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n",
        echo_addr, echo_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut buf = [0u8; 256];
    let n = client.read(&mut buf).await.unwrap();
    let head = String::from_utf8_lossy(&buf[..n]);
    assert!(
        head.starts_with("HTTP/1.1 407"),
        "expected 407 without credentials, got {head}"
    );

    let mut client = TcpStream::connect(listen_addr).await.unwrap();
    let auth = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"bob:hunter2");
    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: Basic {}\r\n\r\n",
        echo_addr, echo_addr, auth
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut buf = [0u8; 256];
    let n = client.read(&mut buf).await.unwrap();
    let head = String::from_utf8_lossy(&buf[..n]);
    assert!(
        head.starts_with("HTTP/1.1 200"),
        "expected 200 with credentials, got {head}"
    );

    client.write_all(b"through-http-connect").await.unwrap();
    let mut buf = [0u8; 20];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through-http-connect");
}

#[tokio::test]
async fn e2e_all_upstreams_down_rejects_with_socks5_failure() {
    let listen_addr = free_addr().await;
    // An address nothing listens on: the upstream dial fails every retry.
    let dead_upstream_port = free_addr().await.port();
    let mut config = base_config(listen_addr, dead_upstream_port);
    config.retry_times = 1;
    let _server = spawn_balancer(config).await;

    let mut client = TcpStream::connect(listen_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    req.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&req).await.unwrap();

    let mut ack = [0u8; 10];
    client.read_exact(&mut ack).await.unwrap();
    assert_ne!(
        ack[1], 0x00,
        "CONNECT must fail when no upstream is reachable"
    );
}

#[tokio::test]
async fn e2e_admin_force_close_ends_active_session() {
    let echo_addr = spawn_echo_server().await;
    let upstream_addr = spawn_upstream_socks5(None).await;
    let listen_addr = free_addr().await;
    let admin_addr = free_addr().await;
    let mut config = base_config(listen_addr, upstream_addr.port());
    config.state_server_host = admin_addr.ip().to_string();
    config.state_server_port = admin_addr.port();
    let server = spawn_balancer(config).await;

    let admin_server = server.clone();
    tokio::spawn(async move {
        let _ = socks_balancer::api::run_admin_server(
            admin_server,
            &admin_addr.ip().to_string(),
            admin_addr.port(),
        )
        .await;
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut client = TcpStream::connect(listen_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    match echo_addr.ip() {
        std::net::IpAddr::V4(ip) => req.extend_from_slice(&ip.octets()),
        _ => unreachable!(),
    }
    req.extend_from_slice(&echo_addr.port().to_be_bytes());
    client.write_all(&req).await.unwrap();
    let mut ack = [0u8; 10];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[1], 0x00);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        server
            .registry()
            .bucket_by_upstream(0)
            .unwrap()
            .session_count(),
        1
    );

    let admin_client = TcpStream::connect(admin_addr).await.unwrap();
    let (mut admin_client, _) = (admin_client, ());
    admin_client
        .write_all(
            b"GET /op?endConnectOnServer=0 HTTP/1.1\r\nHost: admin\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut buf = Vec::new();
    admin_client.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf);
    assert!(
        response.contains("200 OK"),
        "admin op should succeed: {response}"
    );

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(
        server
            .registry()
            .bucket_by_upstream(0)
            .unwrap()
            .session_count()
            == 0
            || client.read(&mut [0u8; 1]).await.unwrap_or(0) == 0,
        "forced close should end the relayed connection"
    );
}
