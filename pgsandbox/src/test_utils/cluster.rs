use std::sync::Arc;

use pgsandbox_config::SandboxConfig;
use tokio_postgres::{Client, NoTls};
use tracing::{error, warn};

use crate::database::Database;
use crate::process::{Binary, CommandRunner};

/// Returns the configuration for clusters started by a test, read from the environment.
///
/// Falls back to the defaults when no configuration can be loaded.
pub fn test_config() -> SandboxConfig {
    pgsandbox_config::load_config().unwrap_or_else(|err| {
        warn!(error = %err, "falling back to the default sandbox configuration");
        SandboxConfig::default()
    })
}

/// Returns `true` if every binary an owned cluster needs can be resolved.
pub fn postgres_binaries_available(config: &Arc<SandboxConfig>) -> bool {
    let runner = CommandRunner::new(config.clone());

    [
        Binary::Initdb,
        Binary::Postgres,
        Binary::Psql,
        Binary::Createdb,
        Binary::Dropdb,
    ]
    .into_iter()
    .all(|binary| match runner.resolve(binary) {
        Ok(_) => true,
        Err(err) => {
            warn!(%binary, error = %err, "postgres binary is not available");
            false
        }
    })
}

/// Connects to `database`, driving the connection on a background task.
///
/// # Panics
///
/// Panics if the connection cannot be established.
pub async fn connect(database: &Database) -> Client {
    let config = database
        .pg_config()
        .await
        .expect("Failed to build the connection configuration");
    let (client, connection) = config
        .connect(NoTls)
        .await
        .expect("Failed to connect to the test database");

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(error = %err, "test database connection failed");
        }
    });

    client
}
