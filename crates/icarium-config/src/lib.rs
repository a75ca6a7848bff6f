//! KDL configuration parsing for the icarium image builder.
//!
//! This crate handles parsing of the daemon configuration (`icarium.kdl`):
//! - Store connection settings
//! - Queue polling settings
//! - Dispatcher retry and concurrency limits
//! - Build tool and registry settings

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    BuilderConfig, DatabaseConfig, DispatcherConfig, QueueConfig, SystemConfig, load_system_config,
    parse_system_config,
};
