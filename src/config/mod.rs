use crate::utils::error::{BalancerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    #[default]
    Random,
    Loop,
    OneByOne,
    ChangeByTime,
    Inherit,
}

impl SelectionRule {
    /// `inherit` at the global level is coerced to `random`.
    pub fn resolve_global(self) -> SelectionRule {
        if self == SelectionRule::Inherit {
            SelectionRule::Random
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamEntry {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub auth_user: Option<String>,
    #[serde(default)]
    pub auth_pwd: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClientEntry {
    pub user: String,
    pub pwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EmbedWebServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub multi_listen: Vec<ListenEndpoint>,

    #[serde(default = "default_test_remote_host")]
    pub test_remote_host: String,
    #[serde(default = "default_test_remote_port")]
    pub test_remote_port: u16,

    #[serde(default = "default_state_server_host")]
    pub state_server_host: String,
    #[serde(default = "default_state_server_port")]
    pub state_server_port: u16,

    #[serde(default)]
    pub upstream_select_rule: SelectionRule,
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
    #[serde(default = "default_server_change_time")]
    pub server_change_time: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_sleep_time")]
    pub sleep_time: u64,

    #[serde(default = "default_tcp_check_period")]
    pub tcp_check_period: u64,
    #[serde(default = "default_tcp_check_start")]
    pub tcp_check_start: u64,
    #[serde(default = "default_connect_check_period")]
    pub connect_check_period: u64,
    #[serde(default = "default_connect_check_start")]
    pub connect_check_start: u64,
    #[serde(default = "default_addition_check_period")]
    pub addition_check_period: u64,

    #[serde(default)]
    pub disable_connect_test: bool,
    #[serde(default)]
    pub disable_socks4: bool,
    #[serde(default)]
    pub tradition_tcp_relay: bool,
    #[serde(default)]
    pub disable_connection_tracker: bool,

    #[serde(default = "default_thread_num")]
    pub thread_num: usize,

    #[serde(default)]
    pub upstream: Vec<UpstreamEntry>,
    #[serde(default)]
    pub auth_client_info: Vec<AuthClientEntry>,
    #[serde(default)]
    pub embed_web_server_config: EmbedWebServerConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}
fn default_listen_port() -> u16 {
    5000
}
fn default_test_remote_host() -> String {
    "www.google.com".to_string()
}
fn default_test_remote_port() -> u16 {
    443
}
fn default_state_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_state_server_port() -> u16 {
    5010
}
fn default_retry_times() -> u32 {
    3
}
fn default_server_change_time() -> u64 {
    60_000
}
fn default_connect_timeout() -> u64 {
    2_000
}
fn default_sleep_time() -> u64 {
    1_800_000
}
fn default_tcp_check_period() -> u64 {
    5_000
}
fn default_tcp_check_start() -> u64 {
    1_000
}
fn default_connect_check_period() -> u64 {
    300_000
}
fn default_connect_check_start() -> u64 {
    1_000
}
fn default_addition_check_period() -> u64 {
    10_000
}
fn default_thread_num() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            multi_listen: Vec::new(),
            test_remote_host: default_test_remote_host(),
            test_remote_port: default_test_remote_port(),
            state_server_host: default_state_server_host(),
            state_server_port: default_state_server_port(),
            upstream_select_rule: SelectionRule::default(),
            retry_times: default_retry_times(),
            server_change_time: default_server_change_time(),
            connect_timeout: default_connect_timeout(),
            sleep_time: default_sleep_time(),
            tcp_check_period: default_tcp_check_period(),
            tcp_check_start: default_tcp_check_start(),
            connect_check_period: default_connect_check_period(),
            connect_check_start: default_connect_check_start(),
            addition_check_period: default_addition_check_period(),
            disable_connect_test: false,
            disable_socks4: false,
            tradition_tcp_relay: false,
            disable_connection_tracker: false,
            thread_num: default_thread_num(),
            upstream: Vec::new(),
            auth_client_info: Vec::new(),
            embed_web_server_config: EmbedWebServerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BalancerError::Config(format!("failed to read config file: {}", e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| BalancerError::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.upstream.is_empty() {
            return Err(BalancerError::Config(
                "at least one upstream server must be configured".to_string(),
            ));
        }
        for (i, u) in self.upstream.iter().enumerate() {
            if u.host.trim().is_empty() {
                return Err(BalancerError::Config(format!(
                    "upstream[{}] has an empty host",
                    i
                )));
            }
            if u.port == 0 {
                return Err(BalancerError::Config(format!(
                    "upstream[{}] has an invalid port",
                    i
                )));
            }
        }
        if self.retry_times == 0 {
            return Err(BalancerError::Config(
                "retryTimes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = serde_json::to_string_pretty(&Config {
            upstream: vec![UpstreamEntry {
                host: "127.0.0.1".to_string(),
                port: 1080,
                name: "local".to_string(),
                disable: false,
                auth_user: None,
                auth_pwd: None,
            }],
            ..Config::default()
        })
        .map_err(|e| BalancerError::Config(format!("failed to render example config: {}", e)))?;

        std::fs::write(path.as_ref(), example)
            .map_err(|e| BalancerError::Config(format!("failed to write example config: {}", e)))?;
        Ok(())
    }
}
