use crate::session::registry::StatsRegistry;
use crate::session::types::Session;
use crate::utils::error::{BalancerError, Result};
use std::io;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{instrument, trace};

const BUFFER_SIZE: usize = 8 * 1024;

fn is_connection_closed_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

/// Relays bytes bidirectionally between the downstream client and the chosen
/// upstream proxy once both handshakes have completed. Closes when either
/// side reaches EOF, the session is cancelled, or an unrecoverable I/O error
/// occurs. Returns the total bytes moved in each direction.
#[instrument(level = "debug", skip(client, upstream, session, registry), fields(relay_id = session.relay_id))]
pub async fn relay(
    client: TcpStream,
    upstream: TcpStream,
    session: Arc<Session>,
    registry: Arc<StatsRegistry>,
) -> Result<(u64, u64)> {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let up_total = Arc::new(AtomicI64::new(0));
    let down_total = Arc::new(AtomicI64::new(0));

    let upload = tokio::spawn(pump(
        client_read,
        upstream_write,
        session.clone(),
        registry.clone(),
        up_total.clone(),
        "upload",
        true,
    ));
    let download = tokio::spawn(pump(
        upstream_read,
        client_write,
        session.clone(),
        registry.clone(),
        down_total.clone(),
        "download",
        false,
    ));

    let (upload_result, download_result) = tokio::join!(upload, download);
    session.cancel.cancel();

    upload_result.map_err(join_error)??;
    download_result.map_err(join_error)??;

    Ok((
        up_total.load(Ordering::Relaxed) as u64,
        down_total.load(Ordering::Relaxed) as u64,
    ))
}

fn join_error(err: tokio::task::JoinError) -> BalancerError {
    BalancerError::Relay(format!("relay task join error: {}", err))
}

#[allow(clippy::too_many_arguments)]
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    session: Arc<Session>,
    registry: Arc<StatsRegistry>,
    total: Arc<AtomicI64>,
    direction: &'static str,
    is_upload: bool,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buffer = [0u8; BUFFER_SIZE];
    loop {
        let read_result = tokio::select! {
            _ = session.cancel.cancelled() => {
                trace!(direction, "relay cancelled");
                break;
            }
            result = reader.read(&mut buffer) => result,
        };

        let n = match read_result {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if is_connection_closed_error(&e) => break,
            Err(e) => return Err(BalancerError::Io(e)),
        };

        if let Err(e) = writer.write_all(&buffer[..n]).await {
            if is_connection_closed_error(&e) {
                break;
            }
            return Err(BalancerError::Io(e));
        }

        total.fetch_add(n as i64, Ordering::Relaxed);
        if is_upload {
            registry.add_byte_up(&session, n as i64);
        } else {
            registry.add_byte_down(&session, n as i64);
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, UpstreamEntry};
    use crate::upstream::UpstreamPool;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, Duration};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connect_addr = listener.local_addr().unwrap();
        let (client, (server, _)) = tokio::join!(TcpStream::connect(connect_addr), async {
            listener.accept().await.unwrap()
        });
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn test_bucket_byte_counters_update_during_relay_not_only_at_teardown() {
        let mut config = Config::default();
        config.upstream.push(UpstreamEntry {
            host: "127.0.0.1".to_string(),
            port: 1080,
            name: "s0".to_string(),
            disable: false,
            auth_user: None,
            auth_pwd: None,
        });
        let pool = UpstreamPool::from_config(&config);
        let registry = StatsRegistry::new(pool);

        let session = Session::new(1, addr(100), addr(5000), 0);
        session.set_upstream_index(0);
        registry.add_session(&session, 0).unwrap();

        let (mut client_local, client_remote) = loopback_pair().await;
        let (upstream_local, mut upstream_remote) = loopback_pair().await;

        let relay_session = session.clone();
        let relay_registry = registry.clone();
        let handle = tokio::spawn(async move {
            relay(client_remote, upstream_local, relay_session, relay_registry).await
        });

        client_local.write_all(b"hello-upstream").await.unwrap();
        client_local.flush().await.unwrap();

        let mut buf = [0u8; 64];
        let n = upstream_remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-upstream");

        // Bytes must already be visible in the bucket while the relay is still
        // running, not only after `relay()` returns at teardown.
        let bucket = registry.bucket_by_upstream(0).unwrap();
        let mut waited = 0;
        while bucket.byte_up() == 0 && waited < 50 {
            sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(bucket.byte_up(), n as i64);
        assert_eq!(bucket.byte_down(), 0);

        drop(client_local);
        drop(upstream_remote);
        let _ = handle.await;
    }
}
