use crate::auth::AuthDirectory;
use crate::config::Config;
use crate::server::handshake::{run_handshake, HandshakeContext};
use crate::server::relay::relay;
use crate::session::registry::StatsRegistry;
use crate::session::types::Session;
use crate::upstream::{RelayIdCounter, UpstreamPool};
use crate::utils::error::Result;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Binds every configured listen endpoint, runs the accept loops, and drives
/// the background ticks (upstream probing, byte-rate accounting, expired
/// session sweeping) until shut down.
pub struct ProxyServer {
    config: Arc<Config>,
    ctx: Arc<HandshakeContext>,
    registry: Arc<StatsRegistry>,
    relay_ids: Arc<RelayIdCounter>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(config: Config) -> Arc<Self> {
        let config = Arc::new(config);
        let pool = UpstreamPool::from_config(&config);
        let auth = Arc::new(AuthDirectory::from_config(&config));
        let registry = StatsRegistry::new(pool.clone());
        let ctx = Arc::new(HandshakeContext {
            pool,
            auth,
            registry: registry.clone(),
            disable_socks4: config.disable_socks4,
        });
        Arc::new(Self {
            config,
            ctx,
            registry,
            relay_ids: Arc::new(RelayIdCounter::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.ctx.pool
    }
    pub fn registry(&self) -> &Arc<StatsRegistry> {
        &self.registry
    }
    pub fn auth(&self) -> &Arc<AuthDirectory> {
        &self.ctx.auth
    }
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.ctx.pool.start_check_timers();
        self.spawn_registry_ticks();

        let mut endpoints = vec![(self.config.listen_host.clone(), self.config.listen_port)];
        endpoints.extend(
            self.config
                .multi_listen
                .iter()
                .map(|e| (e.host.clone(), e.port)),
        );

        let mut listeners = Vec::with_capacity(endpoints.len());
        for (host, port) in &endpoints {
            let listener = TcpListener::bind((host.as_str(), *port)).await?;
            info!(host, port, "listening");
            listeners.push(listener);
        }

        let mut accept_tasks = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let this = self.clone();
            accept_tasks.push(tokio::spawn(
                async move { this.accept_loop(listener).await },
            ));
        }

        for task in accept_tasks {
            let _ = task.await;
        }
        self.ctx.pool.stop();
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let listen_addr = match listener.local_addr() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "could not read local address for bound listener");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, client_addr) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_connection(stream, client_addr, listen_addr).await;
                    });
                }
            }
        }
    }

    #[instrument(level = "debug", skip(self, stream), fields(client = %client_addr))]
    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        client_addr: SocketAddr,
        listen_addr: SocketAddr,
    ) {
        let relay_id = self.relay_ids.next();
        let session = Session::new(relay_id, client_addr, listen_addr, now_ms());
        self.ctx.pool.update_last_connect_come_time();

        let upstream = match run_handshake(&mut stream, &self.ctx, &session).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(relay_id, error = %e, "handshake failed");
                session.cancel.cancel();
                return;
            }
        };

        if let Some(idx) = session.upstream_index() {
            if let Err(e) = self.registry.add_session(&session, idx) {
                warn!(relay_id, error = %e, "failed to register session in stats registry");
            }
        }

        if let Err(e) = relay(stream, upstream, session.clone(), self.registry.clone()).await {
            warn!(relay_id, error = %e, "relay ended with error");
        }
        session.mark_closed();
    }

    fn spawn_registry_ticks(self: &Arc<Self>) {
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => registry.calc_byte_all(),
                }
            }
        });

        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => registry.remove_expired_session_all(),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamEntry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(upstream_port: u16) -> Config {
        Config {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
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

    #[tokio::test]
    async fn test_socks5_connect_relays_end_to_end() {
        // A bare SOCKS5 server standing in for the upstream: accepts the
        // balancer's CONNECT handshake then echoes one line back.
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = upstream_listener.accept().await.unwrap();
            let mut greeting = [0u8; 2];
            s.read_exact(&mut greeting).await.unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            s.read_exact(&mut methods).await.unwrap();
            s.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            s.read_exact(&mut head).await.unwrap();
            let domain_len = {
                let mut b = [0u8; 1];
                s.read_exact(&mut b).await.unwrap();
                b[0] as usize
            };
            let mut domain = vec![0u8; domain_len];
            s.read_exact(&mut domain).await.unwrap();
            let mut port = [0u8; 2];
            s.read_exact(&mut port).await.unwrap();

            s.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            s.write_all(b"world").await.unwrap();
        });

        let server = ProxyServer::new(test_config(upstream_port));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound = listener.local_addr().unwrap();
        let srv = server.clone();
        tokio::spawn(async move {
            srv.accept_loop(listener).await;
        });

        let mut client = TcpStream::connect(bound).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x03];
        req.push(11);
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut ack = [0u8; 10];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[1], 0x00);

        client.write_all(b"hello").await.unwrap();
        let mut resp = [0u8; 5];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"world");

        server.shutdown();
    }
}
