pub mod config;
pub mod types;

pub use config::ConnPoolConfig;
pub use types::*;
