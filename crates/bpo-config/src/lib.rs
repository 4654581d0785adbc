//! KDL configuration parsing for the bpo build coordinator.
//!
//! This crate handles parsing of the system configuration: server and
//! database settings, repository paths, branches with their architectures,
//! the job service and signing keys.

pub mod error;
mod kdl_ext;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    BranchConfig, JobServiceConfig, PathsConfig, SecretConfig, ServerConfig, SignConfig,
    SystemConfig, TokensConfig, parse_system_config,
};
