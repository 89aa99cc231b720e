//! Make/clean contract consumed by an external test resource optimizer.
//!
//! The optimizer decides when resources are built and torn down, and asks
//! [`ResourceManager::is_dirty`] whether a resource can be handed to the next test
//! unmodified. [`ClusterManager`] provides the server, [`DatabaseManager`] the database
//! instances on it, optionally cloned from a template database built by another manager.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use pgsandbox_config::SandboxConfig;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::bail;
use crate::cluster::Cluster;
use crate::database::{Database, DisposeHook};
use crate::dirty::{CommitSynchronizer, DirtyListener};
use crate::error::{ErrorKind, SandboxError, SandboxResult};
use crate::provisioner::{PgProvisioner, Provision};
use crate::sandbox_error;
use crate::transaction::{SynchronizerId, TransactionManager};

/// Name of the cluster dependency of a [`DatabaseManager`].
pub const CLUSTER_DEPENDENCY: &str = "cluster";

/// Name of the template dependency of a [`DatabaseManager`].
pub const TEMPLATE_DEPENDENCY: &str = "template_db";

/// A test resource built and torn down on behalf of an optimizer.
pub trait ResourceManager: Send + Sync {
    type Resource: Send + Sync;
    type Dependencies: Send;

    /// Names of the resources that must be made before this one.
    fn dependency_names(&self) -> Vec<&'static str>;

    fn make(
        &self,
        dependencies: Self::Dependencies,
    ) -> impl Future<Output = SandboxResult<Self::Resource>> + Send;

    fn clean(&self, resource: Self::Resource) -> impl Future<Output = SandboxResult<()>> + Send;

    /// Returns `true` if `resource` was modified and must be rebuilt before reuse.
    fn is_dirty(&self, resource: &Self::Resource) -> bool;

    /// Relative cost of making the resource.
    fn set_up_cost(&self) -> u32 {
        1
    }

    /// Relative cost of cleaning the resource.
    fn tear_down_cost(&self) -> u32 {
        1
    }
}

/// Process-wide sandbox state, constructed once and shared through an [`Arc`].
///
/// When the configuration names an external server, the attached cluster is created on
/// first use and shared by every [`ClusterManager`] of the process.
#[derive(Debug)]
pub struct SandboxContext {
    config: Arc<SandboxConfig>,
    attached: OnceCell<Arc<Cluster>>,
}

impl SandboxContext {
    pub fn new(config: SandboxConfig) -> SandboxResult<Self> {
        config.validate()?;

        Ok(Self {
            config: Arc::new(config),
            attached: OnceCell::new(),
        })
    }

    /// Creates a context from the configuration found in the working directory and the
    /// environment.
    pub fn from_env() -> SandboxResult<Self> {
        let config = pgsandbox_config::load_config()?;
        Self::new(config)
    }

    pub fn config(&self) -> &Arc<SandboxConfig> {
        &self.config
    }

    /// Returns the cluster attached to the configured external server, attaching on the
    /// first call.
    pub async fn attached_cluster(&self) -> SandboxResult<Arc<Cluster>> {
        let cluster = self
            .attached
            .get_or_try_init(|| async {
                Cluster::attach(self.config.clone()).await.map(Arc::new)
            })
            .await?;

        Ok(cluster.clone())
    }
}

/// Provides the [`Cluster`] every database lives on.
///
/// Without an external server configured, each make bootstraps and starts a private
/// cluster which clean tears down entirely. With one, every make returns the shared
/// attached cluster and clean only releases its preloaded instances.
#[derive(Debug, Clone)]
pub struct ClusterManager {
    context: Arc<SandboxContext>,
}

impl ClusterManager {
    pub const SET_UP_COST: u32 = 10;
    pub const TEAR_DOWN_COST: u32 = 5;

    pub fn new(context: Arc<SandboxContext>) -> Self {
        Self { context }
    }
}

impl ResourceManager for ClusterManager {
    type Resource = Arc<Cluster>;
    type Dependencies = ();

    fn dependency_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    async fn make(&self, _dependencies: ()) -> SandboxResult<Arc<Cluster>> {
        if self.context.config().is_external() {
            return self.context.attached_cluster().await;
        }

        let cluster = Cluster::new(self.context.config().clone());
        let started = match cluster.initialize().await {
            Ok(()) => cluster.start().await,
            Err(err) => Err(err),
        };

        if let Err(err) = started {
            if let Err(cleanup_err) = cluster.cleanup().await {
                error!(error = %cleanup_err, "failed to clean up cluster after a failed start");
            }
            return Err(err);
        }

        Ok(Arc::new(cluster))
    }

    async fn clean(&self, cluster: Arc<Cluster>) -> SandboxResult<()> {
        if cluster.is_external().await {
            return cluster.release_preloaded().await;
        }

        cluster.cleanup().await
    }

    fn is_dirty(&self, _cluster: &Arc<Cluster>) -> bool {
        false
    }

    fn set_up_cost(&self) -> u32 {
        Self::SET_UP_COST
    }

    fn tear_down_cost(&self) -> u32 {
        Self::TEAR_DOWN_COST
    }
}

/// Hook preparing a freshly created database, e.g. loading a schema.
pub type InitializeHook<P = PgProvisioner> =
    Arc<dyn for<'a> Fn(&'a Database<P>) -> BoxFuture<'a, SandboxResult<()>> + Send + Sync>;

/// Resources a [`DatabaseManager`] builds on.
pub struct DatabaseDependencies<P = PgProvisioner> {
    pub cluster: Arc<Cluster<P>>,
    /// Template to clone, required when the manager was built with a template manager.
    pub template: Option<Database<P>>,
}

/// Provides database instances, optionally cloned from a template database.
pub struct DatabaseManager<P = PgProvisioner> {
    template: Option<Arc<DatabaseManager<P>>>,
    initialize: Option<InitializeHook<P>>,
    dispose: Option<DisposeHook<P>>,
    dirty_on_commit: Option<Arc<dyn TransactionManager>>,
    listener: Option<Arc<dyn DirtyListener>>,
    synchronizers: Mutex<HashMap<String, SynchronizerId>>,
}

impl<P> DatabaseManager<P>
where
    P: Provision,
{
    pub fn new() -> Self {
        Self {
            template: None,
            initialize: None,
            dispose: None,
            dirty_on_commit: None,
            listener: None,
            synchronizers: Mutex::new(HashMap::new()),
        }
    }

    /// Clones every database from the template built by `manager`.
    pub fn with_template(mut self, manager: Arc<DatabaseManager<P>>) -> Self {
        self.template = Some(manager);
        self
    }

    /// Runs `hook` on every database right after it is created.
    pub fn with_initialize<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a Database<P>) -> BoxFuture<'a, SandboxResult<()>>
            + Send
            + Sync
            + 'static,
    {
        self.initialize = Some(Arc::new(hook));
        self
    }

    /// Runs `hook` before every database is dropped.
    pub fn with_dispose(mut self, hook: DisposeHook<P>) -> Self {
        self.dispose = Some(hook);
        self
    }

    /// Marks databases dirty whenever a transaction of `manager` commits.
    pub fn with_dirty_on_commit(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.dirty_on_commit = Some(manager);
        self
    }

    /// Notifies `listener` the first time a database becomes dirty.
    pub fn with_listener(mut self, listener: Arc<dyn DirtyListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    fn synchronizers(&self) -> MutexGuard<'_, HashMap<String, SynchronizerId>> {
        self.synchronizers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P> Default for DatabaseManager<P>
where
    P: Provision,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P> ResourceManager for DatabaseManager<P>
where
    P: Provision,
{
    type Resource = Database<P>;
    type Dependencies = DatabaseDependencies<P>;

    fn dependency_names(&self) -> Vec<&'static str> {
        let mut names = vec![CLUSTER_DEPENDENCY];
        if self.template.is_some() {
            names.push(TEMPLATE_DEPENDENCY);
        }
        names
    }

    async fn make(&self, dependencies: DatabaseDependencies<P>) -> SandboxResult<Database<P>> {
        let DatabaseDependencies { cluster, template } = dependencies;

        if self.template.is_some() && template.is_none() {
            bail!(
                ErrorKind::ConfigError,
                "Template database dependency is missing",
                TEMPLATE_DEPENDENCY
            );
        }

        if let Some(template) = &template
            && !Arc::ptr_eq(template.cluster(), &cluster)
        {
            bail!(
                ErrorKind::TemplateMismatch,
                "Template database belongs to another cluster",
                template.name().to_owned()
            );
        }

        let name = cluster
            .create_instance(template.as_ref().map(Database::name))
            .await?;

        let mut database = Database::new(cluster, name);
        if let Some(listener) = &self.listener {
            database = database.with_listener(listener.clone());
        }
        if let Some(dispose) = &self.dispose {
            database = database.with_dispose_hook(dispose.clone());
        }

        if let Some(initialize) = &self.initialize
            && let Err(err) = initialize(&database).await
        {
            if let Err(drop_err) = database.drop_instance().await {
                error!(name = %database.name(), error = %drop_err, "failed to drop database after a failed initialize hook");
            }

            return Err(sandbox_error!(
                ErrorKind::HookFailed,
                "Initialize hook failed",
                format!("{}: {err}", database.name()),
                source: err
            ));
        }

        if let Some(manager) = &self.dirty_on_commit {
            let synchronizer = CommitSynchronizer::new(database.dirty_flag());
            let id = manager.register_synchronizer(Arc::new(synchronizer));
            self.synchronizers().insert(database.name().to_owned(), id);
        }

        info!(name = %database.name(), template = ?template.as_ref().map(Database::name), "made database");

        Ok(database)
    }

    async fn clean(&self, database: Database<P>) -> SandboxResult<()> {
        let mut errors: Vec<SandboxError> = Vec::new();

        if let Some(manager) = &self.dirty_on_commit {
            let id = self.synchronizers().remove(database.name());
            if let Some(id) = id {
                manager.unregister_synchronizer(id);
            }

            if let Err(err) = manager.abort() {
                errors.push(err);
            }
        }

        if let Err(err) = database.drop_instance().await {
            errors.push(err);
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    fn is_dirty(&self, database: &Database<P>) -> bool {
        database.is_dirty()
    }
}

impl<P> fmt::Debug for DatabaseManager<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("template", &self.template.is_some())
            .field("initialize", &self.initialize.is_some())
            .field("dispose", &self.dispose.is_some())
            .field("dirty_on_commit", &self.dirty_on_commit.is_some())
            .finish()
    }
}
