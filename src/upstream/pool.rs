use super::probe::{https_probe, tcp_probe};
use super::types::UpstreamServer;
use crate::config::{Config, SelectionRule};
use chrono::Utc;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Per-caller cursor used by `get_server_by_hint`; bucket state in the
/// statistics registry owns one of these per aggregate.
#[derive(Debug, Default)]
pub struct SelectionHint(AtomicUsize);

impl SelectionHint {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, v: usize) {
        self.0.store(v, Ordering::Relaxed);
    }
}

struct PoolTimers {
    cancel: CancellationToken,
}

/// Owns the upstream list, schedules health probes, and applies the
/// configured selection policy.
pub struct UpstreamPool {
    servers: Arc<Vec<Arc<UpstreamServer>>>,
    global_rule: Mutex<SelectionRule>,
    retry_times: u32,
    server_change_time: i64,
    connect_timeout: Duration,
    sleep_time: i64,
    tcp_check_period: Duration,
    tcp_check_start: Duration,
    connect_check_period: Duration,
    connect_check_start: Duration,
    addition_check_period: Duration,
    disable_connect_test: bool,
    test_remote_host: String,
    test_remote_port: u16,

    global_cursor: AtomicUsize,
    last_change_by_time: AtomicI64,
    last_connect_come_time: AtomicI64,
    recovery_burst_running: AtomicBool,
    last_recovery_burst: AtomicI64,

    timers: std::sync::Mutex<Option<PoolTimers>>,
}

impl UpstreamPool {
    pub fn from_config(config: &Config) -> Arc<Self> {
        let servers = config
            .upstream
            .iter()
            .enumerate()
            .map(|(idx, u)| {
                Arc::new(UpstreamServer::new(
                    idx,
                    if u.name.is_empty() {
                        format!("{}:{}", u.host, u.port)
                    } else {
                        u.name.clone()
                    },
                    u.host.clone(),
                    u.port,
                    u.disable,
                    u.auth_user.clone(),
                    u.auth_pwd.clone(),
                ))
            })
            .collect();

        Arc::new(Self {
            servers: Arc::new(servers),
            global_rule: Mutex::new(config.upstream_select_rule.resolve_global()),
            retry_times: config.retry_times,
            server_change_time: config.server_change_time as i64,
            connect_timeout: Duration::from_millis(config.connect_timeout),
            sleep_time: config.sleep_time as i64,
            tcp_check_period: Duration::from_millis(config.tcp_check_period),
            tcp_check_start: Duration::from_millis(config.tcp_check_start),
            connect_check_period: Duration::from_millis(config.connect_check_period),
            connect_check_start: Duration::from_millis(config.connect_check_start),
            addition_check_period: Duration::from_millis(config.addition_check_period),
            disable_connect_test: config.disable_connect_test,
            test_remote_host: config.test_remote_host.clone(),
            test_remote_port: config.test_remote_port,
            global_cursor: AtomicUsize::new(0),
            last_change_by_time: AtomicI64::new(now_ms()),
            last_connect_come_time: AtomicI64::new(now_ms()),
            recovery_burst_running: AtomicBool::new(false),
            last_recovery_burst: AtomicI64::new(0),
            timers: std::sync::Mutex::new(None),
        })
    }

    pub fn servers(&self) -> &[Arc<UpstreamServer>] {
        &self.servers
    }

    pub fn retry_times(&self) -> u32 {
        self.retry_times
    }

    pub fn server(&self, idx: usize) -> Option<&Arc<UpstreamServer>> {
        self.servers.get(idx)
    }

    fn valid(&self, u: &UpstreamServer) -> bool {
        u.effective_healthy(!self.disable_connect_test)
    }

    pub fn update_last_connect_come_time(&self) {
        self.last_connect_come_time
            .store(now_ms(), Ordering::Relaxed);
    }

    fn is_sleeping(&self) -> bool {
        now_ms() - self.last_connect_come_time.load(Ordering::Relaxed) > self.sleep_time
    }

    pub fn global_rule(&self) -> SelectionRule {
        *self.global_rule.lock().unwrap()
    }

    /// `inherit` is coerced to `random` at the global level.
    pub fn set_global_rule(&self, rule: SelectionRule) {
        *self.global_rule.lock().unwrap() = rule.resolve_global();
    }

    /// Forces the next `one_by_one`/`change_by_time` selection to land on
    /// `idx` immediately; under `loop` the cursor still advances past it once.
    pub fn force_use_server(&self, idx: usize) {
        self.global_cursor.store(idx, Ordering::Relaxed);
    }

    /// Apply the global selection rule using the pool's shared cursor.
    pub fn get_server_global(&self) -> Option<Arc<UpstreamServer>> {
        self.select(
            self.global_rule(),
            &self.global_cursor,
            &self.last_change_by_time,
        )
    }

    /// Apply a specific rule using the caller's own hint cursor.
    ///
    /// `inherit` returns `None` when `dont_fallback_to_global`, else falls back
    /// to the global rule. Per-bucket hint cursors do not advance the pool's
    /// global `changedByTime` timer (see design notes: unspecified by source,
    /// decided here to keep bucket-local timing independent of global state).
    pub fn get_server_by_hint(
        &self,
        rule: SelectionRule,
        hint: &SelectionHint,
        dont_fallback_to_global: bool,
    ) -> Option<Arc<UpstreamServer>> {
        if rule == SelectionRule::Inherit {
            if dont_fallback_to_global {
                return None;
            }
            return self.get_server_global();
        }
        let cursor = AtomicUsize::new(hint.get());
        let local_last_change = AtomicI64::new(self.last_change_by_time.load(Ordering::Relaxed));
        let result = self.select(rule, &cursor, &local_last_change);
        hint.set(cursor.load(Ordering::Relaxed));
        result
    }

    fn select(
        &self,
        rule: SelectionRule,
        cursor: &AtomicUsize,
        last_change: &AtomicI64,
    ) -> Option<Arc<UpstreamServer>> {
        let n = self.servers.len();
        if n == 0 {
            return None;
        }

        match rule {
            SelectionRule::Random | SelectionRule::Inherit => {
                let valid_idxs: Vec<usize> =
                    (0..n).filter(|&i| self.valid(&self.servers[i])).collect();
                valid_idxs
                    .choose(&mut rand::thread_rng())
                    .map(|&i| self.servers[i].clone())
            }
            SelectionRule::Loop => self.advance_loop(cursor, n),
            SelectionRule::OneByOne => {
                let idx = cursor.load(Ordering::Relaxed) % n;
                if self.valid(&self.servers[idx]) {
                    return Some(self.servers[idx].clone());
                }
                self.advance_loop(cursor, n)
            }
            SelectionRule::ChangeByTime => {
                let now = now_ms();
                let last = last_change.load(Ordering::Relaxed);
                if now - last > self.server_change_time {
                    last_change.store(now, Ordering::Relaxed);
                    self.advance_loop(cursor, n)
                } else {
                    let idx = cursor.load(Ordering::Relaxed) % n;
                    if self.valid(&self.servers[idx]) {
                        return Some(self.servers[idx].clone());
                    }
                    self.advance_loop(cursor, n)
                }
            }
        }
    }

    fn advance_loop(&self, cursor: &AtomicUsize, n: usize) -> Option<Arc<UpstreamServer>> {
        let start = cursor.load(Ordering::Relaxed) % n;
        for step in 1..=n {
            let idx = (start + step) % n;
            if self.valid(&self.servers[idx]) {
                cursor.store(idx, Ordering::Relaxed);
                return Some(self.servers[idx].clone());
            }
        }
        None
    }

    pub fn force_check_now(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.run_tcp_probe_round().await });
        let this = self.clone();
        tokio::spawn(async move { this.run_https_probe_round().await });
    }

    pub fn force_check_one(self: &Arc<Self>, idx: usize) {
        if let Some(server) = self.servers.get(idx).cloned() {
            let this = self.clone();
            tokio::spawn(async move {
                this.probe_tcp(&server).await;
                this.probe_https(&server).await;
            });
        }
    }

    pub fn start_check_timers(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        {
            let this = self.clone();
            let cancel = cancel.clone();
            let period = self.tcp_check_period;
            let start = self.tcp_check_start;
            tokio::spawn(async move {
                tokio::time::sleep(start).await;
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            if !this.is_sleeping() {
                                this.run_tcp_probe_round().await;
                            }
                        }
                    }
                }
            });
        }
        {
            let this = self.clone();
            let cancel = cancel.clone();
            let period = self.connect_check_period;
            let start = self.connect_check_start;
            tokio::spawn(async move {
                tokio::time::sleep(start).await;
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            if !this.is_sleeping() {
                                this.run_https_probe_round().await;
                            }
                        }
                    }
                }
            });
        }
        {
            let this = self.clone();
            let cancel = cancel.clone();
            let period = self.addition_check_period;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            this.maybe_run_recovery_burst().await;
                        }
                    }
                }
            });
        }

        *self.timers.lock().unwrap() = Some(PoolTimers { cancel });
    }

    pub fn stop(&self) {
        if let Some(timers) = self.timers.lock().unwrap().take() {
            timers.cancel.cancel();
        }
    }

    async fn maybe_run_recovery_burst(self: &Arc<Self>) {
        if self.disable_connect_test || self.is_sleeping() {
            return;
        }
        let all_invalid = self.servers.iter().all(|s| !self.valid(s));
        if !all_invalid {
            return;
        }

        let cooldown = self.addition_check_period.as_millis() as i64 * 3;
        let last = self.last_recovery_burst.load(Ordering::Relaxed);
        if now_ms() - last < cooldown {
            return;
        }
        if self
            .recovery_burst_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!("all upstreams invalid, starting recovery probe burst");
        self.last_recovery_burst.store(now_ms(), Ordering::Relaxed);
        self.run_tcp_probe_round().await;
        self.run_https_probe_round().await;
        self.recovery_burst_running.store(false, Ordering::Relaxed);
    }

    async fn run_tcp_probe_round(self: &Arc<Self>) {
        if self.disable_connect_test {
            return;
        }
        let mut tasks = Vec::new();
        for server in self.servers.iter() {
            if server.is_operator_disabled() {
                continue;
            }
            let this = self.clone();
            let server = server.clone();
            tasks.push(tokio::spawn(async move {
                jitter(this.addition_check_period).await;
                this.probe_tcp(&server).await;
            }));
        }
        for t in tasks {
            let _ = t.await;
        }
    }

    async fn run_https_probe_round(self: &Arc<Self>) {
        if self.disable_connect_test {
            return;
        }
        let mut tasks = Vec::new();
        for server in self.servers.iter() {
            if server.is_operator_disabled() {
                continue;
            }
            let this = self.clone();
            let server = server.clone();
            tasks.push(tokio::spawn(async move {
                jitter(this.addition_check_period).await;
                this.probe_https(&server).await;
            }));
        }
        for t in tasks {
            let _ = t.await;
        }
    }

    async fn probe_tcp(&self, server: &Arc<UpstreamServer>) {
        match tcp_probe(&server.host, server.port, self.connect_timeout).await {
            Ok(rtt) => {
                debug!(upstream = server.index, rtt, "tcp probe succeeded");
                server.record_tcp_success(now_ms(), rtt);
            }
            Err(e) => {
                warn!(upstream = server.index, error = %e, "tcp probe failed");
                server.record_tcp_failure();
            }
        }
    }

    async fn probe_https(&self, server: &Arc<UpstreamServer>) {
        let auth = match (&server.auth_user, &server.auth_pwd) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        };
        match https_probe(
            &server.host,
            server.port,
            auth,
            &self.test_remote_host,
            self.test_remote_port,
            self.connect_timeout * 15,
        )
        .await
        {
            Ok((rtt, status)) => {
                debug!(upstream = server.index, rtt, %status, "https probe succeeded");
                server.record_https_success(now_ms(), rtt, status);
            }
            Err(e) => {
                warn!(upstream = server.index, error = %e, "https probe failed");
                server.record_https_failure(e.to_string());
            }
        }
    }
}

async fn jitter(max: Duration) {
    if max.is_zero() {
        return;
    }
    let ms = rand::random::<u64>() % max.as_millis().max(1) as u64;
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
