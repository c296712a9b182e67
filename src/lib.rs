// A TCP-level SOCKS5/SOCKS4/HTTP load-balancing proxy.

#![recursion_limit = "256"]

pub mod api;
pub mod auth;
pub mod config;
pub mod protocol;
pub mod server;
pub mod session;
pub mod upstream;
pub mod utils;

// Re-export commonly used types
pub use utils::error::{BalancerError, Result};
