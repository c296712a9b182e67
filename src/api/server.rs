use crate::api::types::{
    AuthUserSnapshot, BucketSnapshot, DelayInfoResponse, OpResult, SessionSnapshot,
    SnapshotResponse, TargetInfoResponse, UpstreamSnapshot,
};
use crate::config::SelectionRule;
use crate::server::ProxyServer;
use crate::session::registry::Bucket;
use crate::session::types::Session;
use crate::utils::error::{BalancerError, Result};
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
struct AdminState {
    server: Arc<ProxyServer>,
}

pub fn build_router(server: Arc<ProxyServer>) -> Router {
    let embed = server.config().embed_web_server_config.clone();
    let state = AdminState { server };
    let mut router = Router::new()
        .route("/", get(root_snapshot))
        .route("/clientInfo", get(client_or_listen_info))
        .route("/listenInfo", get(client_or_listen_info))
        .route("/delayInfo", get(delay_info))
        .route("/op", get(op));

    if embed.enabled {
        if let Some(root) = embed.root {
            router = router.fallback_service(tower_http::services::ServeDir::new(root));
        }
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(mirror_origin))
                .layer(middleware::from_fn(request_timeout)),
        )
        .with_state(state)
}

/// Runs the admin HTTP surface until the server is shut down. Each connection
/// is bounded to 60 s total, matching the handshake's own per-step budget.
pub async fn run_admin_server(server: Arc<ProxyServer>, host: &str, port: u16) -> Result<()> {
    let router = build_router(server);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(BalancerError::Io)?;
    info!(%addr, "admin HTTP listening");

    axum::serve(listener, router)
        .await
        .map_err(|e| BalancerError::Config(format!("admin server error: {}", e)))
}

const ADMIN_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

async fn request_timeout(req: axum::extract::Request, next: Next) -> Response {
    match tokio::time::timeout(ADMIN_CONNECTION_TIMEOUT, next.run(req)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::REQUEST_TIMEOUT, "admin request timed out").into_response(),
    }
}

async fn mirror_origin(req: axum::extract::Request, next: Next) -> Response {
    let origin = req.headers().get(header::ORIGIN).cloned();
    let mut response = next.run(req).await;
    if let Some(origin) = origin {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    } else {
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    }
    response
}

fn upstream_snapshot(
    server: &crate::upstream::UpstreamServer,
    probing_enabled: bool,
) -> UpstreamSnapshot {
    UpstreamSnapshot {
        index: server.index,
        name: server.name.clone(),
        host: server.host.clone(),
        port: server.port,
        operator_disabled: server.is_operator_disabled(),
        offline: server.is_offline(),
        last_connect_failed: server.is_last_connect_failed(),
        last_online_time: server.last_online_time(),
        last_connect_time: server.last_connect_time(),
        last_online_rtt: server.last_online_rtt(),
        last_connect_rtt: server.last_connect_rtt(),
        last_connect_check_text: server.last_connect_check_text(),
        connect_count: server.connect_count(),
        effective_healthy: server.effective_healthy(probing_enabled),
    }
}

fn bucket_snapshot(key: String, bucket: &Bucket) -> BucketSnapshot {
    BucketSnapshot {
        key,
        byte_up: bucket.byte_up(),
        byte_down: bucket.byte_down(),
        byte_up_change: bucket.byte_up_change(),
        byte_down_change: bucket.byte_down_change(),
        byte_up_change_max: bucket.byte_up_change_max(),
        byte_down_change_max: bucket.byte_down_change_max(),
        connect_count: bucket.connect_count(),
        rule: bucket.rule(),
        last_use_upstream_index: bucket.last_use_upstream_index(),
        session_count: bucket.session_count(),
    }
}

fn session_snapshot(session: &Arc<Session>) -> SessionSnapshot {
    SessionSnapshot {
        relay_id: session.relay_id,
        client_addr_port: session.client_addr.to_string(),
        listen_addr: session.listen_addr.to_string(),
        start_time_ms: session.start_time_ms,
        target: session.target().map(|t| t.addr_string()),
        upstream_index: session.upstream_index(),
    }
}

async fn root_snapshot(State(state): State<AdminState>) -> Json<SnapshotResponse> {
    let config = state.server.config();
    let pool = state.server.pool();
    let registry = state.server.registry();
    let auth = state.server.auth();

    let upstreams = pool
        .servers()
        .iter()
        .map(|s| upstream_snapshot(s, !config.disable_connect_test))
        .collect();

    let auth_users = (0..)
        .map_while(|id| auth.by_id(id))
        .map(|u| AuthUserSnapshot {
            id: u.id,
            username: u.username.clone(),
        })
        .collect();

    let upstream_buckets = registry
        .upstream_indices()
        .into_iter()
        .filter_map(|idx| {
            registry
                .bucket_by_upstream(idx)
                .map(|b| bucket_snapshot(idx.to_string(), &b))
        })
        .collect();
    let client_buckets = registry
        .client_ips()
        .into_iter()
        .filter_map(|ip| {
            registry
                .bucket_by_client(ip)
                .map(|b| bucket_snapshot(ip.to_string(), &b))
        })
        .collect();
    let listen_buckets = registry
        .listen_endpoints()
        .into_iter()
        .filter_map(|ep| {
            registry
                .bucket_by_listen(&ep)
                .map(|b| bucket_snapshot(ep, &b))
        })
        .collect();

    Json(SnapshotResponse {
        listen_host: config.listen_host.clone(),
        listen_port: config.listen_port,
        multi_listen: config
            .multi_listen
            .iter()
            .map(|e| format!("{}:{}", e.host, e.port))
            .collect(),
        upstream_select_rule: pool.global_rule(),
        retry_times: pool.retry_times(),
        upstreams,
        auth_users,
        upstream_buckets,
        client_buckets,
        listen_buckets,
    })
}

/// Resolves a `targetMode=client|listen&target=<value>` pair to a bucket,
/// shared by `/clientInfo` and `/listenInfo`.
async fn client_or_listen_info(
    State(state): State<AdminState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let registry = state.server.registry();
    let mode = params
        .get("targetMode")
        .map(String::as_str)
        .unwrap_or("client");
    let target = match params.get("target") {
        Some(t) => t,
        None => return (StatusCode::BAD_REQUEST, "missing target").into_response(),
    };

    let bucket = match mode {
        "listen" => registry.bucket_by_listen(target),
        _ => match IpAddr::from_str(target) {
            Ok(ip) => registry.bucket_by_client(ip),
            Err(_) => return (StatusCode::BAD_REQUEST, "invalid client IP").into_response(),
        },
    };

    let Some(bucket) = bucket else {
        return (
            StatusCode::OK,
            Json(TargetInfoResponse {
                bucket: None,
                sessions: Vec::new(),
            }),
        )
            .into_response();
    };

    let sessions = bucket
        .live_sessions()
        .iter()
        .map(session_snapshot)
        .collect();
    (
        StatusCode::OK,
        Json(TargetInfoResponse {
            bucket: Some(bucket_snapshot(target.clone(), &bucket)),
            sessions,
        }),
    )
        .into_response()
}

async fn delay_info(
    State(state): State<AdminState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(idx) = params
        .get("backendServerIndex")
        .and_then(|v| v.parse::<usize>().ok())
    else {
        return (
            StatusCode::BAD_REQUEST,
            "missing or invalid backendServerIndex",
        )
            .into_response();
    };
    let Some(server) = state.server.pool().server(idx) else {
        return (StatusCode::NOT_FOUND, "no such upstream").into_response();
    };

    (
        StatusCode::OK,
        Json(DelayInfoResponse {
            tcp_ping: server.delay_history.tcp_ping_series(),
            http_ping: server.delay_history.http_ping_series(),
            relay_first_delay: server.delay_history.relay_first_delay_series(),
        }),
    )
        .into_response()
}

async fn op(
    State(state): State<AdminState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let server = &state.server;
    let pool = server.pool();
    let registry = server.registry();

    let mut result = OpResult {
        applied: Vec::new(),
        errors: Vec::new(),
    };

    let target_bucket = |params: &HashMap<String, String>| -> Option<Arc<Bucket>> {
        let mode = params.get("_targetMode").map(String::as_str)?;
        let target = params.get("_target")?;
        match mode {
            "listen" => registry.bucket_by_listen(target),
            _ => IpAddr::from_str(target)
                .ok()
                .and_then(|ip| registry.bucket_by_client(ip)),
        }
    };

    if let Some(idx) = params.get("enable").and_then(|v| v.parse::<usize>().ok()) {
        apply_idx(
            pool,
            idx,
            |s| s.set_operator_disabled(false),
            "enable",
            &mut result,
        );
    }
    if let Some(idx) = params.get("disable").and_then(|v| v.parse::<usize>().ok()) {
        apply_idx(
            pool,
            idx,
            |s| s.set_operator_disabled(true),
            "disable",
            &mut result,
        );
    }
    if let Some(idx) = params
        .get("forceNowUseServer")
        .and_then(|v| v.parse::<usize>().ok())
    {
        match target_bucket(&params) {
            Some(bucket) => bucket.hint.set(idx),
            None => pool.force_use_server(idx),
        }
        result.applied.push(format!("forceNowUseServer={}", idx));
    }
    if let Some(idx) = params
        .get("forceCheckServer")
        .and_then(|v| v.parse::<usize>().ok())
    {
        pool.force_check_one(idx);
        result.applied.push(format!("forceCheckServer={}", idx));
    }
    if params.get("enableAllServer").map(String::as_str) == Some("1") {
        for s in pool.servers() {
            s.set_operator_disabled(false);
        }
        result.applied.push("enableAllServer".to_string());
    }
    if params.get("disableAllServer").map(String::as_str) == Some("1") {
        for s in pool.servers() {
            s.set_operator_disabled(true);
        }
        result.applied.push("disableAllServer".to_string());
    }
    if params.get("cleanAllCheckState").map(String::as_str) == Some("1") {
        for s in pool.servers() {
            s.reset_check_state();
        }
        result.applied.push("cleanAllCheckState".to_string());
    }
    if params.get("forceCheckAllServer").map(String::as_str) == Some("1") {
        pool.force_check_now();
        result.applied.push("forceCheckAllServer".to_string());
    }
    if let Some(idx) = params
        .get("endConnectOnServer")
        .and_then(|v| v.parse::<usize>().ok())
    {
        let n = registry.close_all_sessions_for_upstream(idx);
        result
            .applied
            .push(format!("endConnectOnServer={} ({} sessions)", idx, n));
    }
    match params.get("endAllConnect").map(String::as_str) {
        Some("2") => {
            let n = registry.close_all_sessions();
            result
                .applied
                .push(format!("endAllConnect=2 ({} sessions)", n));
        }
        Some("1") => match target_bucket(&params) {
            Some(bucket) => {
                let n = registry.close_all_sessions_for_upstream(
                    bucket.last_use_upstream_index().unwrap_or(-1).max(0) as usize,
                );
                result
                    .applied
                    .push(format!("endAllConnect=1 ({} sessions)", n));
            }
            None => result
                .errors
                .push("endAllConnect=1 requires _targetMode/_target".to_string()),
        },
        _ => {}
    }
    if let Some(name) = params.get("newRule") {
        match parse_rule(name) {
            Some(rule) => match target_bucket(&params) {
                Some(bucket) => {
                    bucket.set_rule(rule);
                    result.applied.push(format!("newRule={} (targeted)", name));
                }
                None => {
                    pool.set_global_rule(rule);
                    result.applied.push(format!("newRule={} (global)", name));
                }
            },
            None => result
                .errors
                .push(format!("unknown selection rule: {}", name)),
        }
    }

    Json(result)
}

fn apply_idx(
    pool: &crate::upstream::UpstreamPool,
    idx: usize,
    f: impl FnOnce(&crate::upstream::UpstreamServer),
    label: &str,
    result: &mut OpResult,
) {
    match pool.server(idx) {
        Some(server) => {
            f(server);
            result.applied.push(format!("{}={}", label, idx));
        }
        None => result.errors.push(format!("no such upstream: {}", idx)),
    }
}

fn parse_rule(name: &str) -> Option<SelectionRule> {
    match name {
        "loop" => Some(SelectionRule::Loop),
        "random" => Some(SelectionRule::Random),
        "one_by_one" => Some(SelectionRule::OneByOne),
        "change_by_time" => Some(SelectionRule::ChangeByTime),
        "inherit" => Some(SelectionRule::Inherit),
        _ => None,
    }
}
