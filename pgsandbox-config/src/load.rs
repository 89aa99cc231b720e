use std::{
    io,
    path::{Path, PathBuf},
};

use rust_cli_config::builder::{ConfigBuilder, DefaultState};
use thiserror::Error;

use crate::shared::{SandboxConfig, ValidationError};

/// File stem of the optional configuration file looked up in the working directory.
pub const CONFIG_FILE_STEM: &str = "pgsandbox";

/// Supported extensions for the configuration file.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml"];

/// Prefix for environment variable configuration overrides.
pub const ENV_PREFIX: &str = "PGSANDBOX";

/// Separator between environment variable prefix and key segments.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested configuration keys in environment variables.
const ENV_SEPARATOR: &str = "__";

/// Errors that can occur while loading the configuration.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    /// Failed to determine the current working directory.
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    /// The configuration file existed but could not be parsed.
    #[error("failed to load configuration from `{path}`: {source}")]
    ConfigurationFileLoad {
        path: PathBuf,
        source: rust_cli_config::ConfigError,
    },

    /// The merged sources could not be built.
    #[error("failed to build configuration: {0}")]
    Builder(#[source] rust_cli_config::ConfigError),

    /// The sources were merged but deserialization failed.
    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),

    /// The configuration was deserialized but is not valid.
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
}

/// Loads the [`SandboxConfig`] from the current working directory.
///
/// See [`load_config_from`].
pub fn load_config() -> Result<SandboxConfig, LoadConfigError> {
    let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    load_config_from(&base_path)
}

/// Loads the [`SandboxConfig`] from built-in defaults, an optional
/// `pgsandbox.(yaml|yml)` file in `directory` and `PGSANDBOX_`-prefixed environment
/// variables, in increasing order of precedence.
///
/// Nested keys use double underscores (`PGSANDBOX_SERVER__READINESS_TIMEOUT_MS`).
/// `PGSANDBOX_HOST` switches the sandbox to an externally managed server.
pub fn load_config_from(directory: &Path) -> Result<SandboxConfig, LoadConfigError> {
    let mut builder = rust_cli_config::Config::builder();

    if let Some(file) = find_configuration_file(directory) {
        builder = builder.add_source(rust_cli_config::File::from(file.clone()));
        validate_configuration_source(&builder, &file)?;
    }

    let environment_source = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    let settings = builder
        .add_source(environment_source)
        .build()
        .map_err(LoadConfigError::Builder)?;

    let config = settings
        .try_deserialize::<SandboxConfig>()
        .map_err(LoadConfigError::Deserialization)?;

    config.validate()?;

    Ok(config)
}

/// Finds the first configuration file with a supported extension, if any.
fn find_configuration_file(directory: &Path) -> Option<PathBuf> {
    CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{CONFIG_FILE_STEM}.{extension}")))
        .find(|path| path.is_file())
}

fn validate_configuration_source(
    builder: &ConfigBuilder<DefaultState>,
    path: &Path,
) -> Result<(), LoadConfigError> {
    builder
        .clone()
        .build()
        .map_err(|source| LoadConfigError::ConfigurationFileLoad {
            path: path.to_path_buf(),
            source,
        })
        .map(|_| ())
}
