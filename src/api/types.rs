use crate::config::SelectionRule;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct UpstreamSnapshot {
    pub index: usize,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub operator_disabled: bool,
    pub offline: bool,
    pub last_connect_failed: bool,
    pub last_online_time: i64,
    pub last_connect_time: i64,
    pub last_online_rtt: i64,
    pub last_connect_rtt: i64,
    pub last_connect_check_text: String,
    pub connect_count: i64,
    pub effective_healthy: bool,
}

#[derive(Debug, Serialize)]
pub struct AuthUserSnapshot {
    pub id: u64,
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct BucketSnapshot {
    pub key: String,
    pub byte_up: i64,
    pub byte_down: i64,
    pub byte_up_change: i64,
    pub byte_down_change: i64,
    pub byte_up_change_max: i64,
    pub byte_down_change_max: i64,
    pub connect_count: i64,
    pub rule: SelectionRule,
    pub last_use_upstream_index: Option<i64>,
    pub session_count: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionSnapshot {
    pub relay_id: u64,
    pub client_addr_port: String,
    pub listen_addr: String,
    pub start_time_ms: i64,
    pub target: Option<String>,
    pub upstream_index: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub listen_host: String,
    pub listen_port: u16,
    pub multi_listen: Vec<String>,
    pub upstream_select_rule: SelectionRule,
    pub retry_times: u32,
    pub upstreams: Vec<UpstreamSnapshot>,
    pub auth_users: Vec<AuthUserSnapshot>,
    pub upstream_buckets: Vec<BucketSnapshot>,
    pub client_buckets: Vec<BucketSnapshot>,
    pub listen_buckets: Vec<BucketSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct TargetInfoResponse {
    pub bucket: Option<BucketSnapshot>,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct DelayInfoResponse {
    pub tcp_ping: Vec<crate::upstream::DelayPoint>,
    pub http_ping: Vec<crate::upstream::DelayPoint>,
    pub relay_first_delay: Vec<crate::upstream::DelayPoint>,
}

#[derive(Debug, Serialize)]
pub struct OpResult {
    pub applied: Vec<String>,
    pub errors: Vec<String>,
}
