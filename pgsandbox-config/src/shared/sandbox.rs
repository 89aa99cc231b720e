use std::path::PathBuf;

use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::{ServerConfig, ValidationError};

/// Process-wide configuration of the sandbox.
///
/// When [`SandboxConfig::host`] is set, the sandbox attaches to an externally managed
/// server instead of bootstrapping and owning its own cluster.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SandboxConfig {
    /// Externally managed server to attach to: a socket directory or a host name.
    #[serde(default)]
    pub host: Option<String>,
    /// Role used by every command and connection.
    ///
    /// Owned clusters are bootstrapped with this role as their superuser.
    #[serde(default = "default_superuser")]
    pub superuser: String,
    /// Password for [`SandboxConfig::superuser`]. Redacted in debug output.
    #[serde(default)]
    pub password: Option<SecretString>,
    /// Directory holding the PostgreSQL binaries. Binaries are looked up on `PATH` when unset.
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
    /// Prefix of every instance name handed out by a cluster.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Background replenishment is scheduled when a template buffer holds at most this many
    /// ready clones.
    #[serde(default = "default_preload_high_water_mark")]
    pub preload_high_water_mark: usize,
    /// Whether backends still connected to an instance are terminated before dropping it.
    #[serde(default = "default_terminate_connections_on_drop")]
    pub terminate_connections_on_drop: bool,
    /// Settings of the owned server process.
    #[serde(default)]
    pub server: ServerConfig,
}

impl SandboxConfig {
    /// Default superuser of owned clusters.
    pub const DEFAULT_SUPERUSER: &'static str = "postgres";

    /// Default instance name prefix.
    pub const DEFAULT_NAME_PREFIX: &'static str = "test_db";

    /// Default preload high-water mark.
    pub const DEFAULT_PRELOAD_HIGH_WATER_MARK: usize = 1;

    /// Returns `true` if the sandbox attaches to an externally managed server.
    pub fn is_external(&self) -> bool {
        self.host.is_some()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name_prefix.is_empty() {
            return Err(ValidationError::EmptyNamePrefix);
        }

        if !self
            .name_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ValidationError::InvalidNamePrefix(self.name_prefix.clone()));
        }

        if self.superuser.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "superuser".to_string(),
                constraint: "cannot be empty".to_string(),
            });
        }

        self.server.validate()
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            host: None,
            superuser: default_superuser(),
            password: None,
            bin_dir: None,
            name_prefix: default_name_prefix(),
            preload_high_water_mark: default_preload_high_water_mark(),
            terminate_connections_on_drop: default_terminate_connections_on_drop(),
            server: ServerConfig::default(),
        }
    }
}

fn default_superuser() -> String {
    SandboxConfig::DEFAULT_SUPERUSER.to_owned()
}

fn default_name_prefix() -> String {
    SandboxConfig::DEFAULT_NAME_PREFIX.to_owned()
}

fn default_preload_high_water_mark() -> usize {
    SandboxConfig::DEFAULT_PRELOAD_HIGH_WATER_MARK
}

fn default_terminate_connections_on_drop() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let config: SandboxConfig = serde_json::from_str("{}").unwrap();

        assert!(!config.is_external());
        assert_eq!(config.name_prefix, "test_db");
        assert_eq!(config.superuser, "postgres");
        assert_eq!(config.preload_high_water_mark, 1);
        assert!(config.terminate_connections_on_drop);
        assert_eq!(config.server.readiness_poll_interval_ms, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"host": "/var/run/postgresql", "password": "hunter2"}"#)
                .unwrap();

        assert!(config.is_external());
        assert_eq!(
            config.password.as_ref().map(|p| p.expose_secret().as_str()),
            Some("hunter2")
        );
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn validate_rejects_bad_prefixes() {
        let empty = SandboxConfig {
            name_prefix: String::new(),
            ..SandboxConfig::default()
        };
        assert!(matches!(
            empty.validate(),
            Err(ValidationError::EmptyNamePrefix)
        ));

        let quoted = SandboxConfig {
            name_prefix: "test-db".into(),
            ..SandboxConfig::default()
        };
        assert!(matches!(
            quoted.validate(),
            Err(ValidationError::InvalidNamePrefix(_))
        ));
    }
}
