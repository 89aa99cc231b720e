//! Configuration for disposable PostgreSQL test clusters.
//!
//! The configuration is loaded once per process (see [`load_config`]) and then shared by
//! reference with every component that needs it.

mod load;
pub mod shared;

pub use load::{CONFIG_FILE_STEM, ENV_PREFIX, LoadConfigError, load_config, load_config_from};
pub use shared::{SandboxConfig, ServerConfig, ValidationError};
