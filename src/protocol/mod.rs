pub mod http;
pub mod parser;
pub mod types;

pub use http::*;
pub use parser::*;
pub use types::*;
