use std::future::Future;
use std::sync::Arc;

use pgsandbox_config::SandboxConfig;
use tracing::{debug, warn};

use crate::error::{ErrorKind, SandboxResult};
use crate::process::{Binary, CommandRunner, Invocation};

/// Maintenance database used for catalog queries.
const MAINTENANCE_DATABASE: &str = "postgres";

/// Query answered by a server that accepts connections.
const READINESS_QUERY: &str = "SELECT 'YAY';";

/// Marker returned by [`READINESS_QUERY`].
const READINESS_MARKER: &str = "YAY";

/// Query listing every database of the server.
const LIST_DATABASES_QUERY: &str = "SELECT datname FROM pg_catalog.pg_database;";

/// Outcome of a readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The server did not answer; holds what the probe printed.
    NotReady(String),
}

/// Creates and drops database instances on a server.
///
/// Implementations are cloned into background tasks, so they must be cheap to clone and
/// safe to use from several tasks. Instance names are plain identifiers handed out by a
/// [`crate::names::NameAllocator`].
pub trait Provision: Clone + Send + Sync + 'static {
    /// Creates `name`, as a copy of `template` when one is given.
    fn create(
        &self,
        name: &str,
        template: Option<&str>,
    ) -> impl Future<Output = SandboxResult<()>> + Send;

    /// Drops `name`.
    fn drop(&self, name: &str) -> impl Future<Output = SandboxResult<()>> + Send;

    /// Lists the names of every database present on the server.
    fn list(&self) -> impl Future<Output = SandboxResult<Vec<String>>> + Send;
}

/// [`Provision`] implementation shelling out to `createdb`, `dropdb` and `psql`.
#[derive(Debug, Clone)]
pub struct PgProvisioner {
    host: String,
    config: Arc<SandboxConfig>,
    runner: CommandRunner,
}

impl PgProvisioner {
    /// Creates a provisioner talking to the server reachable at `host`, which is either a
    /// socket directory or a host name.
    pub fn new(host: impl Into<String>, config: Arc<SandboxConfig>) -> Self {
        let runner = CommandRunner::new(config.clone());

        Self {
            host: host.into(),
            config,
            runner,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Runs the readiness query once.
    ///
    /// A failing `psql` means the server is not ready yet; only failures to run `psql` at
    /// all are returned as errors.
    pub async fn probe(&self) -> SandboxResult<Readiness> {
        let result = self
            .runner
            .run(self.psql(READINESS_QUERY, MAINTENANCE_DATABASE))
            .await;

        match result {
            Ok(output) if output.contains(READINESS_MARKER) => Ok(Readiness::Ready),
            Ok(output) => Ok(Readiness::NotReady(output)),
            Err(err) if err.kind() == ErrorKind::CommandFailed => Ok(Readiness::NotReady(
                err.detail().unwrap_or_default().to_owned(),
            )),
            Err(err) => Err(err),
        }
    }

    /// Returns `true` if the server answers the readiness query.
    pub async fn ping(&self) -> SandboxResult<bool> {
        Ok(matches!(self.probe().await?, Readiness::Ready))
    }

    /// Terminates every backend connected to `name`.
    pub async fn terminate_connections(&self, name: &str) -> SandboxResult<()> {
        let query = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_catalog.pg_stat_activity \
             WHERE datname = {} AND pid <> pg_backend_pid();",
            quote_literal(name)
        );

        self.runner
            .run(self.psql(&query, MAINTENANCE_DATABASE))
            .await
            .map(|_| ())
    }

    fn connection_args(&self, binary: Binary) -> Invocation {
        Invocation::new(binary).args([
            "-h",
            self.host.as_str(),
            "-U",
            self.config.superuser.as_str(),
        ])
    }

    fn psql(&self, query: &str, database: &str) -> Invocation {
        self.connection_args(Binary::Psql)
            .args(["-X", "-t", "-A", "-c", query])
            .arg(database)
    }
}

impl Provision for PgProvisioner {
    async fn create(&self, name: &str, template: Option<&str>) -> SandboxResult<()> {
        let mut invocation = self.connection_args(Binary::Createdb);
        if let Some(template) = template {
            invocation = invocation.args(["--template", template]);
        }

        self.runner.run(invocation.arg(name)).await?;

        debug!(%name, ?template, "created database");

        Ok(())
    }

    async fn drop(&self, name: &str) -> SandboxResult<()> {
        if self.config.terminate_connections_on_drop
            && let Err(err) = self.terminate_connections(name).await
        {
            warn!(%name, error = %err, "failed to terminate backends before drop");
        }

        self.runner
            .run(self.connection_args(Binary::Dropdb).arg(name))
            .await?;

        debug!(%name, "dropped database");

        Ok(())
    }

    async fn list(&self) -> SandboxResult<Vec<String>> {
        let output = self
            .runner
            .run(self.psql(LIST_DATABASES_QUERY, MAINTENANCE_DATABASE))
            .await?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

/// Quotes `value` as an SQL string literal.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
