pub mod handshake;
pub mod listener;
pub mod relay;

pub use handshake::{run_handshake, HandshakeContext};
pub use listener::ProxyServer;
pub use relay::relay as relay_connection;
