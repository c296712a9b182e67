pub mod pool;
pub mod probe;
pub mod types;

pub use pool::{SelectionHint, UpstreamPool};
pub use types::{DelayHistory, DelayPoint, RelayIdCounter, UpstreamServer};
