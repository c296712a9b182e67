use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Resolved after the handshake completes: what the client actually asked to reach.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub host: String,
    pub port: u16,
}

impl TargetInfo {
    pub fn addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One end-to-end client connection and its chosen upstream connection.
///
/// The registry and the accept loop hold only `Weak<Session>` references —
/// the session's own task tree is what keeps it alive. The handshake
/// coordinator holds the only strong back-reference, and clears it on the
/// first of `whenComplete`/`whenError` to break the cycle.
#[derive(Debug)]
pub struct Session {
    pub relay_id: u64,
    pub client_addr: SocketAddr,
    pub listen_addr: SocketAddr,
    pub start_time_ms: i64,
    pub cancel: CancellationToken,

    target: Mutex<Option<TargetInfo>>,
    auth_user_id: Mutex<Option<u64>>,
    upstream_index: AtomicI64,
    connect_counted: AtomicBool,
    closed: AtomicBool,
}

impl Session {
    pub fn new(
        relay_id: u64,
        client_addr: SocketAddr,
        listen_addr: SocketAddr,
        now_ms: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            relay_id,
            client_addr,
            listen_addr,
            start_time_ms: now_ms,
            cancel: CancellationToken::new(),
            target: Mutex::new(None),
            auth_user_id: Mutex::new(None),
            upstream_index: AtomicI64::new(-1),
            connect_counted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_target(&self, host: String, port: u16) {
        *self.target.lock().unwrap() = Some(TargetInfo { host, port });
    }

    pub fn target(&self) -> Option<TargetInfo> {
        self.target.lock().unwrap().clone()
    }

    pub fn set_auth_user(&self, id: u64) {
        *self.auth_user_id.lock().unwrap() = Some(id);
    }

    pub fn auth_user_id(&self) -> Option<u64> {
        *self.auth_user_id.lock().unwrap()
    }

    pub fn upstream_index(&self) -> Option<usize> {
        let v = self.upstream_index.load(Ordering::Relaxed);
        if v < 0 {
            None
        } else {
            Some(v as usize)
        }
    }

    pub fn set_upstream_index(&self, idx: usize) {
        self.upstream_index.store(idx as i64, Ordering::Relaxed);
    }

    /// Marks this session as having incremented the upstream's connect count;
    /// returns `true` only the first time, so the caller increments exactly once.
    pub fn mark_connect_counted(&self) -> bool {
        self.connect_counted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clears the counted flag, returning whether a decrement is owed.
    pub fn take_connect_counted(&self) -> bool {
        self.connect_counted
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// `close()` is idempotent: returns `true` only on the transition to closed.
    pub fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.relay_id == other.relay_id
    }
}
impl Eq for Session {}
