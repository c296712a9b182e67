use thiserror::Error;

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("invalid request")]
    InvalidRequest,

    #[error("no healthy upstream available")]
    NoUpstreamAvailable,

    #[error("upstream handshake failed: {0}")]
    UpstreamHandshake(String),

    #[error("handshake step timed out")]
    Timeout,

    #[error("relay I/O error: {0}")]
    Relay(String),
}

pub type Result<T> = std::result::Result<T, BalancerError>;
