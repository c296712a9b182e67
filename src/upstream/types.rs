use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// One point of a delay history series: `{delay, time}`.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DelayPoint {
    pub delay: i64,
    pub time: i64,
}

const HISTORY_CAP: usize = 50;

#[derive(Debug, Default)]
struct BoundedSeries(Vec<DelayPoint>);

impl BoundedSeries {
    fn push(&mut self, point: DelayPoint) {
        if self.0.len() >= HISTORY_CAP {
            self.0.remove(0);
        }
        self.0.push(point);
    }
}

/// Delay histories for one upstream: TCP reachability ping, the HTTPS-through-proxy
/// ping, and relay-first-delay. The latter is never stamped by any code path in
/// this system (see design notes) and always reports an empty series.
#[derive(Debug, Default)]
pub struct DelayHistory {
    tcp_ping: Mutex<BoundedSeries>,
    http_ping: Mutex<BoundedSeries>,
    relay_first_delay: Mutex<BoundedSeries>,
}

impl DelayHistory {
    pub fn record_tcp_ping(&self, delay_ms: i64, now_ms: i64) {
        self.tcp_ping.lock().unwrap().push(DelayPoint {
            delay: delay_ms,
            time: now_ms,
        });
    }

    pub fn record_http_ping(&self, delay_ms: i64, now_ms: i64) {
        self.http_ping.lock().unwrap().push(DelayPoint {
            delay: delay_ms,
            time: now_ms,
        });
    }

    pub fn tcp_ping_series(&self) -> Vec<DelayPoint> {
        self.tcp_ping.lock().unwrap().0.clone()
    }

    pub fn http_ping_series(&self) -> Vec<DelayPoint> {
        self.http_ping.lock().unwrap().0.clone()
    }

    pub fn relay_first_delay_series(&self) -> Vec<DelayPoint> {
        self.relay_first_delay.lock().unwrap().0.clone()
    }
}

/// One upstream SOCKS5 proxy the balancer dials through.
#[derive(Debug)]
pub struct UpstreamServer {
    pub index: usize,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub auth_user: Option<String>,
    pub auth_pwd: Option<String>,

    operator_disabled: AtomicBool,
    offline: AtomicBool,
    last_connect_failed: AtomicBool,
    last_online_time: AtomicI64,
    last_connect_time: AtomicI64,
    last_online_rtt: AtomicI64,
    last_connect_rtt: AtomicI64,
    last_connect_check_text: Mutex<String>,
    connect_count: AtomicI64,
    pub delay_history: DelayHistory,
}

impl UpstreamServer {
    pub fn new(
        index: usize,
        name: String,
        host: String,
        port: u16,
        disabled: bool,
        auth_user: Option<String>,
        auth_pwd: Option<String>,
    ) -> Self {
        Self {
            index,
            name,
            host,
            port,
            auth_user,
            auth_pwd,
            operator_disabled: AtomicBool::new(disabled),
            offline: AtomicBool::new(false),
            last_connect_failed: AtomicBool::new(false),
            last_online_time: AtomicI64::new(0),
            last_connect_time: AtomicI64::new(0),
            last_online_rtt: AtomicI64::new(-1),
            last_connect_rtt: AtomicI64::new(-1),
            last_connect_check_text: Mutex::new(String::new()),
            connect_count: AtomicI64::new(0),
            delay_history: DelayHistory::default(),
        }
    }

    pub fn is_operator_disabled(&self) -> bool {
        self.operator_disabled.load(Ordering::Relaxed)
    }

    pub fn set_operator_disabled(&self, v: bool) {
        self.operator_disabled.store(v, Ordering::Relaxed);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    pub fn is_last_connect_failed(&self) -> bool {
        self.last_connect_failed.load(Ordering::Relaxed)
    }

    pub fn last_online_time(&self) -> i64 {
        self.last_online_time.load(Ordering::Relaxed)
    }

    pub fn last_connect_time(&self) -> i64 {
        self.last_connect_time.load(Ordering::Relaxed)
    }

    pub fn last_online_rtt(&self) -> i64 {
        self.last_online_rtt.load(Ordering::Relaxed)
    }

    pub fn last_connect_rtt(&self) -> i64 {
        self.last_connect_rtt.load(Ordering::Relaxed)
    }

    pub fn last_connect_check_text(&self) -> String {
        self.last_connect_check_text.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> i64 {
        self.connect_count.load(Ordering::Relaxed)
    }

    pub fn connect_count_add(&self) -> i64 {
        self.connect_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connect_count_sub(&self) -> i64 {
        self.connect_count.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn connect_count_sub_n(&self, n: i64) -> i64 {
        self.connect_count.fetch_sub(n, Ordering::Relaxed) - n
    }

    /// `effective_healthy` per the upstream-record invariant. When `disable_connect_test`
    /// is set, probing never ran and health collapses to "not operator-disabled".
    pub fn effective_healthy(&self, probing_enabled: bool) -> bool {
        if self.is_operator_disabled() {
            return false;
        }
        if !probing_enabled {
            return true;
        }
        self.last_connect_time() != 0
            && self.last_online_time() != 0
            && !self.is_last_connect_failed()
            && !self.is_offline()
    }

    /// TCP probe outcome hook: success clears offline; if transitioning from
    /// offline it also clears last-connect-failed (a fresh TCP success warrants
    /// re-evaluating the upstream, not carrying a stale connect failure forward).
    pub fn record_tcp_success(&self, now_ms: i64, rtt_ms: i64) {
        let was_offline = self.offline.swap(false, Ordering::Relaxed);
        if was_offline {
            self.last_connect_failed.store(false, Ordering::Relaxed);
        }
        self.last_online_time.store(now_ms, Ordering::Relaxed);
        self.last_online_rtt.store(rtt_ms, Ordering::Relaxed);
        self.delay_history.record_tcp_ping(rtt_ms, now_ms);
    }

    pub fn record_tcp_failure(&self) {
        self.offline.store(true, Ordering::Relaxed);
    }

    pub fn record_https_success(&self, now_ms: i64, rtt_ms: i64, status_text: String) {
        self.last_connect_time.store(now_ms, Ordering::Relaxed);
        self.last_connect_failed.store(false, Ordering::Relaxed);
        self.last_connect_rtt.store(rtt_ms, Ordering::Relaxed);
        *self.last_connect_check_text.lock().unwrap() = status_text;
        self.delay_history.record_http_ping(rtt_ms, now_ms);
    }

    pub fn record_https_failure(&self, status_text: String) {
        self.last_connect_failed.store(true, Ordering::Relaxed);
        *self.last_connect_check_text.lock().unwrap() = status_text;
    }

    pub fn reset_check_state(&self) {
        self.offline.store(false, Ordering::Relaxed);
        self.last_connect_failed.store(false, Ordering::Relaxed);
        self.last_online_time.store(0, Ordering::Relaxed);
        self.last_connect_time.store(0, Ordering::Relaxed);
        self.last_online_rtt.store(-1, Ordering::Relaxed);
        self.last_connect_rtt.store(-1, Ordering::Relaxed);
        *self.last_connect_check_text.lock().unwrap() = String::new();
    }
}

/// Monotonic, process-wide relay id counter (one "global mutable" of the
/// original design, passed around as a shared atomic owned by the accept loop).
#[derive(Debug, Default)]
pub struct RelayIdCounter(AtomicU64);

impl RelayIdCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}
