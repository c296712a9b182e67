use super::types::Session;
use crate::config::SelectionRule;
use crate::upstream::{SelectionHint, UpstreamPool};
use crate::utils::error::{BalancerError, Result};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A weak-referenced handle to one live session, indexed inside a [`Bucket`].
/// The registry never extends a session's lifetime.
#[derive(Clone)]
pub struct SessionView {
    pub weak: Weak<Session>,
    pub client_addr_port: String,
    pub listen_addr: String,
    pub start_time_ms: i64,
}

impl SessionView {
    fn from_session(session: &Arc<Session>) -> Self {
        Self {
            weak: Arc::downgrade(session),
            client_addr_port: session.client_addr.to_string(),
            listen_addr: session.listen_addr.to_string(),
            start_time_ms: session.start_time_ms,
        }
    }

    fn is_live(&self) -> bool {
        self.weak.upgrade().is_some()
    }

    fn composite_key(&self) -> (String, String) {
        (self.client_addr_port.clone(), self.listen_addr.clone())
    }
}

/// Aggregate bucket: per-upstream, per-client-IP, per-listen-endpoint, or
/// per-auth-user record of the sessions routed through it plus its traffic
/// counters.
pub struct Bucket {
    sessions: Mutex<Vec<SessionView>>,
    byte_up: AtomicI64,
    byte_down: AtomicI64,
    byte_up_last: AtomicI64,
    byte_down_last: AtomicI64,
    byte_up_change: AtomicI64,
    byte_down_change: AtomicI64,
    byte_up_change_max: AtomicI64,
    byte_down_change_max: AtomicI64,
    connect_count: AtomicI64,
    rule: Mutex<SelectionRule>,
    last_use_upstream_index: AtomicI64,
    pub hint: SelectionHint,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            byte_up: AtomicI64::new(0),
            byte_down: AtomicI64::new(0),
            byte_up_last: AtomicI64::new(0),
            byte_down_last: AtomicI64::new(0),
            byte_up_change: AtomicI64::new(0),
            byte_down_change: AtomicI64::new(0),
            byte_up_change_max: AtomicI64::new(0),
            byte_down_change_max: AtomicI64::new(0),
            connect_count: AtomicI64::new(0),
            rule: Mutex::new(SelectionRule::Inherit),
            last_use_upstream_index: AtomicI64::new(-1),
            hint: SelectionHint::default(),
        }
    }
}

impl Bucket {
    pub fn byte_up(&self) -> i64 {
        self.byte_up.load(Ordering::Relaxed)
    }
    pub fn byte_down(&self) -> i64 {
        self.byte_down.load(Ordering::Relaxed)
    }
    pub fn byte_up_change(&self) -> i64 {
        self.byte_up_change.load(Ordering::Relaxed)
    }
    pub fn byte_down_change(&self) -> i64 {
        self.byte_down_change.load(Ordering::Relaxed)
    }
    pub fn byte_up_change_max(&self) -> i64 {
        self.byte_up_change_max.load(Ordering::Relaxed)
    }
    pub fn byte_down_change_max(&self) -> i64 {
        self.byte_down_change_max.load(Ordering::Relaxed)
    }
    pub fn connect_count(&self) -> i64 {
        self.connect_count.load(Ordering::Relaxed)
    }
    pub fn rule(&self) -> SelectionRule {
        *self.rule.lock().unwrap()
    }
    pub fn set_rule(&self, rule: SelectionRule) {
        *self.rule.lock().unwrap() = rule;
    }
    pub fn last_use_upstream_index(&self) -> Option<i64> {
        let v = self.last_use_upstream_index.load(Ordering::Relaxed);
        if v < 0 {
            None
        } else {
            Some(v)
        }
    }
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v.is_live())
            .count()
    }
    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter_map(|v| v.weak.upgrade())
            .collect()
    }
}

/// Multi-indexed registry of live sessions: by upstream index, by client IP,
/// by listen endpoint, and by authenticated user id.
pub struct StatsRegistry {
    by_upstream: DashMap<usize, Arc<Bucket>>,
    by_client: DashMap<IpAddr, Arc<Bucket>>,
    by_listen: DashMap<String, Arc<Bucket>>,
    by_auth_user: DashMap<u64, Arc<Bucket>>,
    pool: Arc<UpstreamPool>,
}

impl StatsRegistry {
    pub fn new(pool: Arc<UpstreamPool>) -> Arc<Self> {
        Arc::new(Self {
            by_upstream: DashMap::new(),
            by_client: DashMap::new(),
            by_listen: DashMap::new(),
            by_auth_user: DashMap::new(),
            pool,
        })
    }

    pub fn bucket_by_upstream(&self, idx: usize) -> Option<Arc<Bucket>> {
        self.by_upstream.get(&idx).map(|b| b.clone())
    }
    pub fn bucket_by_client(&self, ip: IpAddr) -> Option<Arc<Bucket>> {
        self.by_client.get(&ip).map(|b| b.clone())
    }
    pub fn bucket_by_listen(&self, listen: &str) -> Option<Arc<Bucket>> {
        self.by_listen.get(listen).map(|b| b.clone())
    }
    pub fn bucket_by_auth_user(&self, id: u64) -> Option<Arc<Bucket>> {
        self.by_auth_user.get(&id).map(|b| b.clone())
    }

    pub fn upstream_indices(&self) -> Vec<usize> {
        self.by_upstream.iter().map(|e| *e.key()).collect()
    }
    pub fn client_ips(&self) -> Vec<IpAddr> {
        self.by_client.iter().map(|e| *e.key()).collect()
    }
    pub fn listen_endpoints(&self) -> Vec<String> {
        self.by_listen.iter().map(|e| e.key().clone()).collect()
    }

    /// Registers a session's view in all four bucket families. Fails if the
    /// `(clientAddrPort, listenAddr)` composite already exists in any of them.
    pub fn add_session(&self, session: &Arc<Session>, upstream_index: usize) -> Result<()> {
        let view = SessionView::from_session(session);
        let key = view.composite_key();

        let upstream_bucket = self.by_upstream.entry(upstream_index).or_default().clone();
        let client_bucket = self
            .by_client
            .entry(session.client_addr.ip())
            .or_default()
            .clone();
        let listen_bucket = self
            .by_listen
            .entry(session.listen_addr.to_string())
            .or_default()
            .clone();

        for bucket in [&upstream_bucket, &client_bucket, &listen_bucket] {
            let mut sessions = bucket.sessions.lock().unwrap();
            if sessions
                .iter()
                .any(|v| v.is_live() && v.composite_key() == key)
            {
                return Err(BalancerError::Protocol(format!(
                    "duplicate session for {}/{}",
                    key.0, key.1
                )));
            }
            sessions.push(view.clone());
            bucket
                .last_use_upstream_index
                .store(upstream_index as i64, Ordering::Relaxed);
            bucket.connect_count.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(user_id) = session.auth_user_id() {
            let auth_bucket = self.by_auth_user.entry(user_id).or_default().clone();
            let mut sessions = auth_bucket.sessions.lock().unwrap();
            sessions.push(view);
            auth_bucket
                .last_use_upstream_index
                .store(upstream_index as i64, Ordering::Relaxed);
            auth_bucket.connect_count.fetch_add(1, Ordering::Relaxed);
        }

        if session.mark_connect_counted() {
            if let Some(server) = self.pool.server(upstream_index) {
                server.connect_count_add();
            }
        }

        Ok(())
    }

    /// After the handshake completes, the session's target fields become
    /// known; since views read live data through their weak reference there is
    /// nothing to copy, but this keeps the entry point the operation list names.
    pub fn update_session_info(&self, _session: &Arc<Session>) {}

    /// Adds to the byte-up counter for every bucket family a session belongs
    /// to. Grounds the per-family `add_byte_up_*` operations in a single
    /// call, the way the teacher's `update_traffic` updates every interested
    /// index from one call site. Called on every successful upload write so
    /// `byteUpChange` reflects live throughput, not just totals at teardown.
    pub fn add_byte_up(&self, session: &Session, n: i64) {
        self.for_each_bucket(session, |b| {
            b.byte_up.fetch_add(n, Ordering::Relaxed);
        });
    }

    /// Same as [`Self::add_byte_up`] for the download direction.
    pub fn add_byte_down(&self, session: &Session, n: i64) {
        self.for_each_bucket(session, |b| {
            b.byte_down.fetch_add(n, Ordering::Relaxed);
        });
    }

    fn for_each_bucket(&self, session: &Session, f: impl Fn(&Bucket)) {
        if let Some(idx) = session.upstream_index() {
            if let Some(b) = self.bucket_by_upstream(idx) {
                f(&b);
            }
        }
        if let Some(b) = self.bucket_by_client(session.client_addr.ip()) {
            f(&b);
        }
        if let Some(b) = self.bucket_by_listen(&session.listen_addr.to_string()) {
            f(&b);
        }
        if let Some(user_id) = session.auth_user_id() {
            if let Some(b) = self.bucket_by_auth_user(user_id) {
                f(&b);
            }
        }
    }

    /// Called every 1 s: `change = now - last; last = now; max = max(max, change)`.
    pub fn calc_byte_all(&self) {
        for bucket in self
            .by_upstream
            .iter()
            .map(|e| e.value().clone())
            .chain(self.by_client.iter().map(|e| e.value().clone()))
            .chain(self.by_listen.iter().map(|e| e.value().clone()))
            .chain(self.by_auth_user.iter().map(|e| e.value().clone()))
        {
            calc_one(
                &bucket.byte_up,
                &bucket.byte_up_last,
                &bucket.byte_up_change,
                &bucket.byte_up_change_max,
            );
            calc_one(
                &bucket.byte_down,
                &bucket.byte_down_last,
                &bucket.byte_down_change,
                &bucket.byte_down_change_max,
            );
        }
    }

    /// Called every 5 s: drops views whose weak reference has expired and
    /// reconciles `connectCount` back down to the set of still-live sessions,
    /// for both the upstream server record and every bucket family.
    pub fn remove_expired_session_all(&self) {
        for entry in self.by_upstream.iter() {
            let idx = *entry.key();
            sweep(entry.value());
            if let Some(server) = self.pool.server(idx) {
                let live = entry.value().session_count() as i64;
                let current = server.connect_count();
                if current != live {
                    server.connect_count_sub_n(current - live);
                }
            }
        }
        for entry in self.by_client.iter() {
            sweep(entry.value());
        }
        for entry in self.by_listen.iter() {
            sweep(entry.value());
        }
        for entry in self.by_auth_user.iter() {
            sweep(entry.value());
        }
    }

    /// Forcibly closes every live session in the given upstream bucket.
    pub fn close_all_sessions_for_upstream(&self, idx: usize) -> usize {
        match self.bucket_by_upstream(idx) {
            Some(b) => close_bucket(&b),
            None => 0,
        }
    }

    pub fn close_all_sessions_for_client(&self, ip: IpAddr) -> usize {
        match self.bucket_by_client(ip) {
            Some(b) => close_bucket(&b),
            None => 0,
        }
    }

    pub fn close_all_sessions_for_listen(&self, listen: &str) -> usize {
        match self.bucket_by_listen(listen) {
            Some(b) => close_bucket(&b),
            None => 0,
        }
    }

    pub fn close_all_sessions(&self) -> usize {
        let mut n = 0;
        for entry in self.by_upstream.iter() {
            n += close_bucket(entry.value());
        }
        n
    }
}

fn close_bucket(bucket: &Bucket) -> usize {
    let sessions = bucket.live_sessions();
    for s in &sessions {
        s.cancel.cancel();
    }
    sessions.len()
}

fn calc_one(value: &AtomicI64, last: &AtomicI64, change: &AtomicI64, change_max: &AtomicI64) {
    let current = value.load(Ordering::Relaxed);
    let previous = last.swap(current, Ordering::Relaxed);
    let delta = current - previous;
    change.store(delta, Ordering::Relaxed);
    change_max.fetch_max(delta, Ordering::Relaxed);
}

/// Drops dead weak refs and reconciles `connect_count` down to the number of
/// sessions that survive the sweep (`add_session` only ever increments it).
fn sweep(bucket: &Bucket) {
    let live = {
        let mut sessions = bucket.sessions.lock().unwrap();
        sessions.retain(|v| v.is_live());
        sessions.len() as i64
    };
    bucket.connect_count.store(live, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::types::Session;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn registry() -> Arc<StatsRegistry> {
        let mut config = Config::default();
        config.upstream.push(crate::config::UpstreamEntry {
            host: "127.0.0.1".to_string(),
            port: 1080,
            name: "s0".to_string(),
            disable: false,
            auth_user: None,
            auth_pwd: None,
        });
        let pool = UpstreamPool::from_config(&config);
        StatsRegistry::new(pool)
    }

    #[test]
    fn test_add_session_rejects_duplicate_composite_key() {
        let reg = registry();
        let s1 = Session::new(1, addr(100), addr(5000), 0);
        reg.add_session(&s1, 0).unwrap();
        let s2 = Session::new(2, addr(100), addr(5000), 0);
        assert!(reg.add_session(&s2, 0).is_err());
    }

    #[test]
    fn test_calc_byte_all_computes_change() {
        let reg = registry();
        let s1 = Session::new(1, addr(100), addr(5000), 0);
        s1.set_upstream_index(0);
        reg.add_session(&s1, 0).unwrap();
        reg.add_byte_up(&s1, 100);
        reg.add_byte_down(&s1, 200);
        reg.calc_byte_all();
        let bucket = reg.bucket_by_upstream(0).unwrap();
        assert_eq!(bucket.byte_up_change(), 100);
        assert_eq!(bucket.byte_down_change(), 200);
        reg.calc_byte_all();
        assert_eq!(bucket.byte_up_change(), 0);
    }

    #[test]
    fn test_remove_expired_session_all_drops_dead_weak_refs() {
        let reg = registry();
        {
            let s1 = Session::new(1, addr(100), addr(5000), 0);
            reg.add_session(&s1, 0).unwrap();
            assert_eq!(reg.bucket_by_upstream(0).unwrap().session_count(), 1);
        }
        reg.remove_expired_session_all();
        assert_eq!(reg.bucket_by_upstream(0).unwrap().session_count(), 0);
    }

    #[test]
    fn test_remove_expired_session_all_decrements_bucket_connect_count() {
        let reg = registry();
        {
            let s1 = Session::new(1, addr(100), addr(5000), 0);
            reg.add_session(&s1, 0).unwrap();
            let s2 = Session::new(2, addr(101), addr(5000), 0);
            reg.add_session(&s2, 0).unwrap();
            assert_eq!(reg.bucket_by_upstream(0).unwrap().connect_count(), 2);
        }
        reg.remove_expired_session_all();
        assert_eq!(reg.bucket_by_upstream(0).unwrap().connect_count(), 0);
        assert_eq!(
            reg.bucket_by_client(addr(100).ip())
                .unwrap()
                .connect_count(),
            0
        );
        assert_eq!(
            reg.bucket_by_listen("127.0.0.1:5000")
                .unwrap()
                .connect_count(),
            0
        );
    }

    #[test]
    fn test_close_all_sessions_for_upstream_cancels_tokens() {
        let reg = registry();
        let s1 = Session::new(1, addr(100), addr(5000), 0);
        reg.add_session(&s1, 0).unwrap();
        let n = reg.close_all_sessions_for_upstream(0);
        assert_eq!(n, 1);
        assert!(s1.cancel.is_cancelled());
    }
}
