use std::fmt;
use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::debug;

use crate::cluster::Cluster;
use crate::dirty::{DirtyFlag, DirtyListener, DirtyOnCommit};
use crate::error::SandboxResult;
use crate::provisioner::{PgProvisioner, Provision};

/// Hook releasing client handles to a database before it is dropped.
pub type DisposeHook<P = PgProvisioner> = Arc<dyn Fn(&Database<P>) + Send + Sync>;

/// A database instance handed to a test.
///
/// The handle knows which instance it names; the owning [`Cluster`] owns the storage.
/// Clones share the dirty flag.
pub struct Database<P = PgProvisioner> {
    cluster: Arc<Cluster<P>>,
    name: String,
    dirty: DirtyFlag,
    dispose: Option<DisposeHook<P>>,
}

impl<P> Database<P>
where
    P: Provision,
{
    pub fn new(cluster: Arc<Cluster<P>>, name: impl Into<String>) -> Self {
        let name = name.into();

        Self {
            dirty: DirtyFlag::new(name.clone(), None),
            cluster,
            name,
            dispose: None,
        }
    }

    /// Notifies `listener` the first time the database becomes dirty.
    pub fn with_listener(mut self, listener: Arc<dyn DirtyListener>) -> Self {
        self.dirty = DirtyFlag::new(self.name.clone(), Some(listener));
        self
    }

    /// Runs `hook` before the instance is dropped by [`Database::drop_instance`].
    pub fn with_dispose_hook(mut self, hook: DisposeHook<P>) -> Self {
        self.dispose = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster(&self) -> &Arc<Cluster<P>> {
        &self.cluster
    }

    /// Returns where the instance is served, derived from the cluster on every call.
    pub async fn host(&self) -> SandboxResult<String> {
        self.cluster.host().await
    }

    /// Returns a client configuration for connecting to the instance.
    pub async fn pg_config(&self) -> SandboxResult<tokio_postgres::Config> {
        let host = self.host().await?;
        let sandbox = self.cluster.config();

        let mut config = tokio_postgres::Config::new();
        config
            .host(&host)
            .user(&sandbox.superuser)
            .dbname(&self.name)
            .application_name("pgsandbox");
        if let Some(password) = &sandbox.password {
            config.password(password.expose_secret());
        }

        Ok(config)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_dirty()
    }

    pub fn mark_dirty(&self) {
        self.dirty.mark_dirty();
    }

    pub fn reset_dirty(&self) {
        self.dirty.reset();
    }

    pub fn dirty_flag(&self) -> DirtyFlag {
        self.dirty.clone()
    }

    /// Wraps `client` so that everything it commits marks this database dirty.
    pub fn dirty_on_commit(&self, client: tokio_postgres::Client) -> DirtyOnCommit {
        DirtyOnCommit::wrap(client, self.dirty.clone())
    }

    /// Runs the dispose hook, then drops the instance from the cluster.
    pub async fn drop_instance(&self) -> SandboxResult<()> {
        if let Some(dispose) = &self.dispose {
            debug!(name = %self.name, "disposing database handles");
            dispose(self);
        }

        self.cluster.drop_instance(&self.name).await
    }
}

impl<P> Clone for Database<P> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            name: self.name.clone(),
            dirty: self.dirty.clone(),
            dispose: self.dispose.clone(),
        }
    }
}

impl<P> fmt::Debug for Database<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}
