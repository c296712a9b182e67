use crate::auth::AuthDirectory;
use crate::protocol::http::{
    read_http_request_head, send_407_challenge, send_503_unavailable, send_connect_established,
    HttpRequestHead,
};
use crate::protocol::parser::{
    parse_socks4_request, parse_socks5_client_greeting, parse_socks5_request, parse_userpass_auth,
    read_socks5_response, read_userpass_auth_response, send_auth_response, send_server_choice,
    send_socks4_response, send_socks5_request, send_socks5_response, send_userpass_auth,
};
use crate::protocol::types::{
    Address, AuthMethod, Command, ReplyCode, Socks4Reply, Socks5Request, SOCKS4_VERSION,
    SOCKS5_VERSION,
};
use crate::session::registry::StatsRegistry;
use crate::session::types::Session;
use crate::upstream::{UpstreamPool, UpstreamServer};
use crate::utils::error::{BalancerError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Per-I/O-step expiry: every read/write chain in the handshake is wrapped so
/// a stalled peer (downstream or upstream) cannot pin a task forever.
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared, process-wide dependencies the handshake coordinator consults: the
/// upstream pool (for selection and dialing), the auth directory (downstream
/// credential checks), and the registry (per-client targeted selection, and
/// session bookkeeping once both ends are ready).
pub struct HandshakeContext {
    pub pool: Arc<UpstreamPool>,
    pub auth: Arc<AuthDirectory>,
    pub registry: Arc<StatsRegistry>,
    pub disable_socks4: bool,
}

/// What the downstream side asked for, and how to finish talking to it once
/// the upstream leg is ready (or has failed for good).
enum Downstream {
    Socks5,
    Socks4,
    HttpConnect,
    /// Non-CONNECT forward proxy request: the request head was already fully
    /// read off the wire and must be replayed to the upstream verbatim, since
    /// those bytes can never be read from the client again.
    HttpForward(HttpRequestHead),
}

async fn step<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(STEP_TIMEOUT, fut).await {
        Ok(r) => r,
        Err(_) => Err(BalancerError::Timeout),
    }
}

/// Runs the full handshake: downstream protocol detection and authentication,
/// upstream selection and dialing (retried up to `retryTimes` on handshake
/// failure only), and the upstream SOCKS5 client handshake. On success returns
/// the connected upstream stream, ready to be handed to the relay engine.
pub async fn run_handshake(
    client: &mut TcpStream,
    ctx: &HandshakeContext,
    session: &Arc<Session>,
) -> Result<TcpStream> {
    let (downstream, command, address, port) = step(detect_and_parse(client, ctx, session)).await?;

    session.set_target(address.to_string(), port);

    let mut last_err = None;
    let retry_times = ctx.pool.retry_times().max(1);
    for attempt in 0..retry_times {
        let server = match pick_upstream(ctx, session) {
            Some(s) => s,
            None => {
                last_err = Some(BalancerError::NoUpstreamAvailable);
                break;
            }
        };

        match step(connect_upstream(&server, command, &address, port)).await {
            Ok((mut upstream, response)) => {
                step(finish_downstream(
                    client,
                    &mut upstream,
                    &downstream,
                    &response,
                ))
                .await?;
                session.set_upstream_index(server.index);
                return Ok(upstream);
            }
            Err(e) => {
                debug!(upstream = server.index, attempt, error = %e, "upstream handshake failed, retrying");
                server.record_tcp_failure();
                last_err = Some(e);
            }
        }
    }

    let err = last_err.unwrap_or(BalancerError::NoUpstreamAvailable);
    let _ = fail_downstream(client, &downstream).await;
    Err(err)
}

/// Consults the client's own bucket for a targeted selection rule before
/// falling back to the pool's global policy. A bucket only exists once the
/// client has completed at least one prior session, so a brand-new client
/// always resolves through the global rule.
fn pick_upstream(ctx: &HandshakeContext, session: &Arc<Session>) -> Option<Arc<UpstreamServer>> {
    if let Some(bucket) = ctx.registry.bucket_by_client(session.client_addr.ip()) {
        if bucket.rule() != crate::config::SelectionRule::Inherit {
            if let Some(server) = ctx
                .pool
                .get_server_by_hint(bucket.rule(), &bucket.hint, true)
            {
                return Some(server);
            }
        }
    }
    ctx.pool.get_server_global()
}

async fn detect_and_parse(
    client: &mut TcpStream,
    ctx: &HandshakeContext,
    session: &Arc<Session>,
) -> Result<(Downstream, Command, Address, u16)> {
    let first = client.read_u8().await?;
    match first {
        SOCKS5_VERSION => {
            let (command, address, port) = socks5_server_flow(client, ctx, session).await?;
            Ok((Downstream::Socks5, command, address, port))
        }
        SOCKS4_VERSION if !ctx.disable_socks4 => {
            let (address, port) = socks4_server_flow(client, ctx, session).await?;
            Ok((Downstream::Socks4, Command::Connect, address, port))
        }
        SOCKS4_VERSION => Err(BalancerError::Protocol("SOCKS4 disabled".to_string())),
        b if is_http_method_start(b) => http_server_flow(client, ctx, session, b).await,
        other => Err(BalancerError::Protocol(format!(
            "unrecognized protocol byte: 0x{:02x}",
            other
        ))),
    }
}

fn is_http_method_start(b: u8) -> bool {
    matches!(
        b.to_ascii_uppercase(),
        b'C' | b'G' | b'H' | b'P' | b'D' | b'O' | b'T'
    )
}

// ---------------------------------------------------------------------
// SOCKS5 downstream
// ---------------------------------------------------------------------

async fn socks5_server_flow(
    client: &mut TcpStream,
    ctx: &HandshakeContext,
    session: &Arc<Session>,
) -> Result<(Command, Address, u16)> {
    let greeting = parse_socks5_client_greeting(client, SOCKS5_VERSION).await?;

    if ctx.auth.is_empty() {
        send_server_choice(client, AuthMethod::NoAuth).await?;
    } else if greeting.methods.contains(&AuthMethod::UserPass) {
        send_server_choice(client, AuthMethod::UserPass).await?;
        let (username, password) = parse_userpass_auth(client).await?;
        match ctx.auth.by_username_password(&username, &password) {
            Some(user) => {
                send_auth_response(client, true).await?;
                session.set_auth_user(user.id);
            }
            None => {
                send_auth_response(client, false).await?;
                return Err(BalancerError::AuthFailed(format!(
                    "unknown socks5 credentials for {}",
                    username
                )));
            }
        }
    } else {
        send_server_choice(client, AuthMethod::NoAcceptable).await?;
        return Err(BalancerError::AuthFailed(
            "client did not offer username/password".to_string(),
        ));
    }

    let request = parse_socks5_request(client).await?;
    if request.command == Command::Bind {
        send_socks5_response(
            client,
            ReplyCode::CommandNotSupported,
            Address::IPv4([0; 4]),
            0,
        )
        .await?;
        return Err(BalancerError::UnsupportedCommand(Command::Bind as u8));
    }

    Ok((request.command, request.address, request.port))
}

// ---------------------------------------------------------------------
// SOCKS4 / SOCKS4a downstream
// ---------------------------------------------------------------------

async fn socks4_server_flow(
    client: &mut TcpStream,
    ctx: &HandshakeContext,
    session: &Arc<Session>,
) -> Result<(Address, u16)> {
    let request = parse_socks4_request(client).await?;

    if request.command == Command::Bind {
        send_socks4_response(client, Socks4Reply::Rejected, [0; 4], 0).await?;
        return Err(BalancerError::UnsupportedCommand(Command::Bind as u8));
    }

    if !ctx.auth.is_empty() {
        match ctx.auth.by_username(&request.user_id) {
            Some(user) => session.set_auth_user(user.id),
            None => {
                send_socks4_response(client, Socks4Reply::NoIdentd, [0; 4], 0).await?;
                return Err(BalancerError::AuthFailed(format!(
                    "unknown socks4 userid {}",
                    request.user_id
                )));
            }
        }
    }

    Ok((request.address, request.port))
}

// ---------------------------------------------------------------------
// HTTP CONNECT / forward proxy downstream
// ---------------------------------------------------------------------

async fn http_server_flow(
    client: &mut TcpStream,
    ctx: &HandshakeContext,
    session: &Arc<Session>,
    first_byte: u8,
) -> Result<(Downstream, Command, Address, u16)> {
    loop {
        let head = read_http_request_head(client, &[first_byte]).await?;

        if !ctx.auth.is_empty() {
            let authed = authenticate_http(&head, ctx, session);
            if !authed {
                send_407_challenge(client).await?;
                continue;
            }
        }

        let (host, port) = head.target_host_port(if head.is_connect() { 443 } else { 80 })?;
        let address = parse_host_address(&host);

        if head.is_connect() {
            return Ok((Downstream::HttpConnect, Command::Connect, address, port));
        }
        return Ok((
            Downstream::HttpForward(head),
            Command::Connect,
            address,
            port,
        ));
    }
}

fn authenticate_http(
    head: &HttpRequestHead,
    ctx: &HandshakeContext,
    session: &Arc<Session>,
) -> bool {
    let header_value = head
        .header("Proxy-Authorization")
        .or_else(|| head.header("Authorization"));
    let Some(value) = header_value else {
        return false;
    };
    let Some(payload) = crate::protocol::http::basic_credential_payload(value) else {
        return false;
    };

    if let Some(user) = ctx.auth.by_pre_encoded_basic(payload) {
        session.set_auth_user(user.id);
        return true;
    }
    if let Some(user) = ctx.auth.by_basic_payload_decoded(payload) {
        session.set_auth_user(user.id);
        return true;
    }
    false
}

fn parse_host_address(host: &str) -> Address {
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        return Address::IPv4(ip.octets());
    }
    if let Ok(ip) = host.parse::<std::net::Ipv6Addr>() {
        return Address::IPv6(ip.octets());
    }
    Address::Domain(host.to_string())
}

// ---------------------------------------------------------------------
// Upstream SOCKS5 client flow
// ---------------------------------------------------------------------

async fn connect_upstream(
    server: &Arc<UpstreamServer>,
    command: Command,
    address: &Address,
    port: u16,
) -> Result<(TcpStream, crate::protocol::types::Socks5Response)> {
    let addr = format!("{}:{}", server.host, server.port);
    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| BalancerError::UpstreamHandshake(format!("connect to {}: {}", addr, e)))?;
    stream.set_nodelay(true)?;

    let want_auth = server.auth_user.is_some() && server.auth_pwd.is_some();
    let methods: &[u8] = if want_auth { &[0x00, 0x02] } else { &[0x00] };
    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(SOCKS5_VERSION);
    greeting.push(methods.len() as u8);
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(BalancerError::UpstreamHandshake(
            "unexpected version in upstream method choice".to_string(),
        ));
    }
    match choice[1] {
        0x00 => {}
        0x02 => {
            let (user, pwd) = match (&server.auth_user, &server.auth_pwd) {
                (Some(u), Some(p)) => (u.as_str(), p.as_str()),
                _ => {
                    return Err(BalancerError::UpstreamHandshake(
                        "upstream requested userpass auth but none configured".to_string(),
                    ))
                }
            };
            send_userpass_auth(&mut stream, user, pwd).await?;
            if !read_userpass_auth_response(&mut stream).await? {
                return Err(BalancerError::UpstreamHandshake(
                    "upstream rejected credentials".to_string(),
                ));
            }
        }
        0xFF => {
            return Err(BalancerError::UpstreamHandshake(
                "upstream has no acceptable auth method".to_string(),
            ))
        }
        other => {
            return Err(BalancerError::UpstreamHandshake(format!(
                "unsupported upstream auth method 0x{:02x}",
                other
            )))
        }
    }

    send_socks5_request(
        &mut stream,
        &Socks5Request {
            command,
            address: address.clone(),
            port,
        },
    )
    .await?;

    let response = read_socks5_response(&mut stream).await?;
    if response.reply != ReplyCode::Succeeded {
        return Err(BalancerError::UpstreamHandshake(format!(
            "upstream refused with {:?}",
            response.reply
        )));
    }

    Ok((stream, response))
}

// ---------------------------------------------------------------------
// Downstream finalization
// ---------------------------------------------------------------------

async fn finish_downstream(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    downstream: &Downstream,
    response: &crate::protocol::types::Socks5Response,
) -> Result<()> {
    match downstream {
        Downstream::Socks5 => {
            send_socks5_response(
                client,
                ReplyCode::Succeeded,
                response.address.clone(),
                response.port,
            )
            .await
        }
        Downstream::Socks4 => send_socks4_response(client, Socks4Reply::Granted, [0; 4], 0).await,
        Downstream::HttpConnect => send_connect_established(client).await,
        Downstream::HttpForward(head) => {
            // Replayed to the upstream SOCKS5 connection, not echoed back to
            // the client: the request line was already drained off the
            // client socket and can never be forwarded by a later read.
            upstream.write_all(&head.raw).await?;
            upstream.flush().await?;
            Ok(())
        }
    }
}

async fn fail_downstream(client: &mut TcpStream, downstream: &Downstream) -> Result<()> {
    match downstream {
        Downstream::Socks5 => {
            client
                .write_all(&[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            client.flush().await?;
            Ok(())
        }
        Downstream::Socks4 => send_socks4_response(client, Socks4Reply::Rejected, [0; 4], 0).await,
        Downstream::HttpConnect | Downstream::HttpForward(_) => send_503_unavailable(client).await,
    }
}
