use super::types::*;
use crate::utils::error::{BalancerError, Result};
use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

// ---------------------------------------------------------------------
// SOCKS5 server-side (downstream) wire format
// ---------------------------------------------------------------------

/// Parse client greeting (method selection) for SOCKS5.
/// The caller must provide the already-read version byte.
pub async fn parse_socks5_client_greeting<S>(stream: &mut S, version: u8) -> Result<ClientGreeting>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if version != SOCKS5_VERSION {
        return Err(BalancerError::Protocol(format!(
            "unsupported SOCKS version: 0x{:02x}",
            version
        )));
    }

    let nmethods = stream.read_u8().await?;
    if nmethods == 0 {
        return Err(BalancerError::Protocol(
            "no authentication methods provided".to_string(),
        ));
    }

    let mut methods_buf = SmallVec::<[u8; 8]>::from_elem(0, nmethods as usize);
    stream.read_exact(&mut methods_buf).await?;
    let methods: Vec<AuthMethod> = methods_buf.into_iter().map(AuthMethod::from).collect();

    trace!("parsed client greeting: {} methods", methods.len());
    Ok(ClientGreeting { methods })
}

/// Send server choice (or method advertisement, from the upstream client side).
#[inline(always)]
pub async fn send_server_choice<S>(stream: &mut S, method: AuthMethod) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let buf = [SOCKS5_VERSION, method as u8];
    stream.write_all(&buf).await?;
    stream.flush().await?;
    trace!("sent server choice: {:?}", method);
    Ok(())
}

/// Parse username/password authentication sub-negotiation (RFC 1929), server side.
pub async fn parse_userpass_auth<S>(stream: &mut S) -> Result<(String, String)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let version = stream.read_u8().await?;
    if version != 0x01 {
        return Err(BalancerError::Protocol(format!(
            "unsupported userpass version: 0x{:02x}",
            version
        )));
    }

    let username_len = stream.read_u8().await? as usize;
    if username_len == 0 {
        return Err(BalancerError::Protocol("empty username".to_string()));
    }
    let mut username_buf = SmallVec::<[u8; 64]>::from_elem(0, username_len);
    stream.read_exact(&mut username_buf).await?;
    let username = String::from_utf8(username_buf.to_vec())
        .map_err(|_| BalancerError::Protocol("invalid username encoding".to_string()))?;

    let password_len = stream.read_u8().await? as usize;
    if password_len == 0 {
        return Err(BalancerError::Protocol("empty password".to_string()));
    }
    let mut password_buf = SmallVec::<[u8; 64]>::from_elem(0, password_len);
    stream.read_exact(&mut password_buf).await?;
    let password = String::from_utf8(password_buf.to_vec())
        .map_err(|_| BalancerError::Protocol("invalid password encoding".to_string()))?;

    trace!("parsed userpass auth for user: {}", username);
    Ok((username, password))
}

/// Send username/password sub-negotiation request, upstream client side.
pub async fn send_userpass_auth<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = SmallVec::<[u8; 256]>::new();
    buf.push(0x01);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Send authentication response (server side).
#[inline(always)]
pub async fn send_auth_response<S>(stream: &mut S, success: bool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let status = if success { 0x00 } else { 0x01 };
    let buf = [0x01, status];
    stream.write_all(&buf).await?;
    stream.flush().await?;
    trace!(
        "sent auth response: {}",
        if success { "success" } else { "failure" }
    );
    Ok(())
}

/// Read the auth response on the upstream client side, return whether it succeeded.
pub async fn read_userpass_auth_response<S>(stream: &mut S) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    Ok(buf[1] == 0x00)
}

async fn read_address<S>(stream: &mut S, address_type: u8) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match address_type {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ok(Address::IPv4(addr))
        }
        0x03 => {
            let domain_len = stream.read_u8().await? as usize;
            let mut domain_buf = SmallVec::<[u8; 128]>::from_elem(0, domain_len);
            stream.read_exact(&mut domain_buf).await?;
            let domain = String::from_utf8(domain_buf.to_vec())
                .map_err(|_| BalancerError::Protocol("invalid domain encoding".to_string()))?;
            Ok(Address::Domain(domain))
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ok(Address::IPv6(addr))
        }
        _ => Err(BalancerError::UnsupportedAddressType(address_type)),
    }
}

/// Parse SOCKS5 request (server side: reading the client's CMD request).
pub async fn parse_socks5_request<S>(stream: &mut S) -> Result<Socks5Request>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let command = buf[1];
    let reserved = buf[2];
    let address_type = buf[3];

    if version != SOCKS5_VERSION {
        return Err(BalancerError::Protocol(format!(
            "unsupported SOCKS version: 0x{:02x}",
            version
        )));
    }
    if reserved != 0x00 {
        trace!(
            "non-zero reserved field in SOCKS5 request: 0x{:02x}",
            reserved
        );
    }

    let command = Command::try_from(command)?;
    let address = read_address(stream, address_type).await?;
    let port = stream.read_u16().await?;

    debug!(
        "parsed SOCKS5 request: command={:?}, address={}, port={}",
        command, address, port
    );

    Ok(Socks5Request {
        command,
        address,
        port,
    })
}

fn encode_address_port(buf: &mut SmallVec<[u8; 256]>, addr: &Address, port: u16) -> Result<()> {
    match addr {
        Address::IPv4(octets) => {
            buf.push(0x01);
            buf.extend_from_slice(octets);
        }
        Address::IPv6(octets) => {
            buf.push(0x04);
            buf.extend_from_slice(octets);
        }
        Address::Domain(domain) => {
            if domain.len() > 255 {
                return Err(BalancerError::Protocol(format!(
                    "domain name too long: {} octets",
                    domain.len()
                )));
            }
            buf.push(0x03);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    Ok(())
}

/// Send SOCKS5 response (server side: the final acknowledgement to the client).
#[inline(always)]
pub async fn send_socks5_response<S>(
    stream: &mut S,
    reply: ReplyCode,
    bind_addr: Address,
    bind_port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = SmallVec::<[u8; 256]>::new();
    buf.push(SOCKS5_VERSION);
    buf.push(reply as u8);
    buf.push(0x00);
    encode_address_port(&mut buf, &bind_addr, bind_port)?;

    stream.write_all(&buf).await?;
    stream.flush().await?;

    debug!(
        "sent SOCKS5 response: reply={:?}, bind_addr={}, bind_port={}",
        reply, bind_addr, bind_port
    );
    Ok(())
}

/// Issue a SOCKS5 CMD request, upstream client side.
pub async fn send_socks5_request<S>(stream: &mut S, req: &Socks5Request) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = SmallVec::<[u8; 256]>::new();
    buf.push(SOCKS5_VERSION);
    buf.push(req.command as u8);
    buf.push(0x00);
    encode_address_port(&mut buf, &req.address, req.port)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the upstream's SOCKS5 CMD reply, client side. Tolerates upstreams that
/// only deliver the fixed 4-byte header on the first read (`slowImpl`) by
/// following up with an exact-size read sized from ATYP.
pub async fn read_socks5_response<S>(stream: &mut S) -> Result<Socks5Response>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS5_VERSION {
        return Err(BalancerError::UpstreamHandshake(format!(
            "unexpected SOCKS version in upstream reply: 0x{:02x}",
            head[0]
        )));
    }
    let reply = match head[1] {
        0x00 => ReplyCode::Succeeded,
        0x01 => ReplyCode::GeneralFailure,
        0x02 => ReplyCode::ConnectionNotAllowed,
        0x03 => ReplyCode::NetworkUnreachable,
        0x04 => ReplyCode::HostUnreachable,
        0x05 => ReplyCode::ConnectionRefused,
        0x06 => ReplyCode::TtlExpired,
        0x07 => ReplyCode::CommandNotSupported,
        _ => ReplyCode::AddressTypeNotSupported,
    };

    let address = read_address(stream, head[3]).await?;
    let port = stream.read_u16().await?;

    Ok(Socks5Response {
        reply,
        address,
        port,
    })
}

// ---------------------------------------------------------------------
// SOCKS4 / SOCKS4a server-side wire format
// ---------------------------------------------------------------------

/// Parse SOCKS4/4a request (the version byte must already be consumed by the caller).
pub async fn parse_socks4_request<S>(stream: &mut S) -> Result<Socks4Request>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let command_byte = stream.read_u8().await?;
    let command = Command::try_from(command_byte)?;

    let port = stream.read_u16().await?;

    let mut ip_octets = [0u8; 4];
    stream.read_exact(&mut ip_octets).await?;

    let user_id = read_null_terminated_string(stream).await?;

    let address =
        if ip_octets[0] == 0 && ip_octets[1] == 0 && ip_octets[2] == 0 && ip_octets[3] != 0 {
            let domain = read_null_terminated_string(stream).await?;
            if domain.is_empty() {
                return Err(BalancerError::Protocol(
                    "SOCKS4a domain name missing".to_string(),
                ));
            }
            Address::Domain(domain)
        } else {
            Address::IPv4(ip_octets)
        };

    debug!(
        "parsed SOCKS4 request: command={:?}, address={}, port={}, user_id={}",
        command, address, port, user_id
    );

    Ok(Socks4Request {
        command,
        address,
        port,
        user_id,
    })
}

/// Send SOCKS4 response.
pub async fn send_socks4_response<S>(
    stream: &mut S,
    reply: Socks4Reply,
    bind_addr: [u8; 4],
    bind_port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = [0u8; 8];
    buf[0] = 0x00;
    buf[1] = reply as u8;
    buf[2..4].copy_from_slice(&bind_port.to_be_bytes());
    buf[4..8].copy_from_slice(&bind_addr);

    stream.write_all(&buf).await?;
    stream.flush().await?;

    debug!("sent SOCKS4 response: reply={:?}", reply);
    Ok(())
}

/// Read a NUL-terminated string; SOCKS4a's HOSTNAME field is terminated by the
/// *second* NUL in the frame (the first ends USERID).
async fn read_null_terminated_string<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    const MAX_LEN: usize = 255;
    let mut bytes = SmallVec::<[u8; 256]>::new();

    loop {
        let byte = stream.read_u8().await?;
        if byte == 0x00 {
            break;
        }
        if bytes.len() >= MAX_LEN {
            return Err(BalancerError::Protocol(
                "SOCKS4 field exceeds maximum length".to_string(),
            ));
        }
        bytes.push(byte);
    }

    String::from_utf8(bytes.to_vec())
        .map_err(|_| BalancerError::Protocol("invalid string encoding".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_client_greeting_parsing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut server_stream, _) = listener.accept().await.unwrap();
            let version = server_stream.read_u8().await.unwrap();
            assert_eq!(version, SOCKS5_VERSION);
            parse_socks5_client_greeting(&mut server_stream, version)
                .await
                .unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();

        let greeting = server.await.unwrap();
        assert_eq!(
            greeting.methods,
            vec![AuthMethod::NoAuth, AuthMethod::UserPass]
        );
    }

    #[tokio::test]
    async fn test_socks5_request_roundtrip_domain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut server_stream, _) = listener.accept().await.unwrap();
            parse_socks5_request(&mut server_stream).await.unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        send_socks5_request(
            &mut client,
            &Socks5Request {
                command: Command::Connect,
                address: Address::Domain("example.com".to_string()),
                port: 443,
            },
        )
        .await
        .unwrap();

        let req = server.await.unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.address, Address::Domain("example.com".to_string()));
        assert_eq!(req.port, 443);
    }

    #[tokio::test]
    async fn test_socks4a_hostname_second_nul() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut server_stream, _) = listener.accept().await.unwrap();
            parse_socks4_request(&mut server_stream).await.unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut frame = vec![0x01, 0x01, 0xBB];
        frame.extend_from_slice(&[0, 0, 0, 1]);
        frame.extend_from_slice(b"user\0");
        frame.extend_from_slice(b"example.com\0");
        client.write_all(&frame).await.unwrap();

        let req = server.await.unwrap();
        assert_eq!(req.user_id, "user");
        assert_eq!(req.address, Address::Domain("example.com".to_string()));
        assert_eq!(req.port, 0x01BB);
    }
}
