pub mod registry;
pub mod types;

pub use registry::{Bucket, SessionView, StatsRegistry};
pub use types::{Session, TargetInfo};
