//! Common utilities and types shared across stockgroup

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, GroupConfig, NodeConfig};
pub use error::{Error, Result};
pub use utils::{crc32, parse_duration, validate_key, MemberStatus};
