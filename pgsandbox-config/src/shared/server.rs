use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::shared::ValidationError;

/// Settings for the PostgreSQL server process owned by a sandbox cluster.
///
/// Ignored when attaching to an externally managed server.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Maximum time, in milliseconds, to wait for a started server to answer queries.
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    /// Interval, in milliseconds, between two readiness probes.
    #[serde(default = "default_readiness_poll_interval_ms")]
    pub readiness_poll_interval_ms: u64,
    /// Time, in milliseconds, to wait for a fast shutdown before killing the server.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Encoding passed to `initdb -E`.
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Server runtime parameters passed as `-c key=value`.
    ///
    /// Merged on top of [`ServerConfig::DEFAULT_OPTIONS`], see [`ServerConfig::effective_options`].
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ServerConfig {
    /// Default readiness timeout.
    pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 10_000;

    /// Default readiness poll interval.
    pub const DEFAULT_READINESS_POLL_INTERVAL_MS: u64 = 50;

    /// Default shutdown timeout before escalating to `SIGKILL`.
    pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

    /// Default encoding of the bootstrapped cluster.
    pub const DEFAULT_ENCODING: &'static str = "utf-8";

    /// Non-durable defaults for throwaway clusters. Caller options take precedence.
    pub const DEFAULT_OPTIONS: &'static [(&'static str, &'static str)] = &[
        ("fsync", "off"),
        ("full_page_writes", "off"),
        ("synchronous_commit", "off"),
        ("log_min_messages", "panic"),
    ];

    /// Returns the readiness timeout as a [`Duration`].
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    /// Returns the readiness poll interval as a [`Duration`].
    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    /// Returns the shutdown timeout as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Builds the server options by merging [`ServerConfig::DEFAULT_OPTIONS`] with
    /// [`ServerConfig::options`].
    pub fn effective_options(&self) -> BTreeMap<String, String> {
        let mut options: BTreeMap<String, String> = Self::DEFAULT_OPTIONS
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();

        for (key, value) in &self.options {
            options.insert(key.clone(), value.clone());
        }

        options
    }

    /// Validates server settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.readiness_poll_interval_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "server.readiness_poll_interval_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.readiness_timeout_ms < self.readiness_poll_interval_ms {
            return Err(ValidationError::InvalidFieldValue {
                field: "server.readiness_timeout_ms".to_string(),
                constraint: "must be at least `server.readiness_poll_interval_ms`".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_ms: default_readiness_timeout_ms(),
            readiness_poll_interval_ms: default_readiness_poll_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            encoding: default_encoding(),
            options: BTreeMap::new(),
        }
    }
}

fn default_readiness_timeout_ms() -> u64 {
    ServerConfig::DEFAULT_READINESS_TIMEOUT_MS
}

fn default_readiness_poll_interval_ms() -> u64 {
    ServerConfig::DEFAULT_READINESS_POLL_INTERVAL_MS
}

fn default_shutdown_timeout_ms() -> u64 {
    ServerConfig::DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_encoding() -> String {
    ServerConfig::DEFAULT_ENCODING.to_owned()
}
