pub mod server;
pub mod types;

pub use server::{build_router, run_admin_server};
