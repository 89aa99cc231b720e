//! Background preloading of template clones.
//!
//! Cloning a template is the slow part of handing out a database. After every templated
//! request the pool clones the template once more in a background task, so the next
//! request for the same template is served from the buffer while the clone cost was paid
//! during test execution.
//!
//! At most one background task exists per pool. It is always joined before anything else
//! touches the pool, so the buffer never exposes an instance whose creation is still running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bail;
use crate::error::{ErrorKind, SandboxError, SandboxResult};
use crate::names::{AllocatedName, NameAllocator};
use crate::provisioner::Provision;

/// Ready clones, keyed by template name.
type Buffers = Arc<Mutex<HashMap<String, Vec<String>>>>;

#[derive(Debug)]
struct PreloadTask {
    template: String,
    name: String,
    handle: JoinHandle<SandboxResult<()>>,
}

/// Per-cluster pool of pre-cloned template instances.
#[derive(Debug)]
pub struct TemplatePreloadPool<P> {
    provisioner: P,
    names: NameAllocator,
    buffers: Buffers,
    in_flight: Option<PreloadTask>,
    high_water_mark: usize,
    strict_ownership: bool,
}

impl<P> TemplatePreloadPool<P>
where
    P: Provision,
{
    /// Creates a pool handing out names from `names`.
    ///
    /// With `strict_ownership`, templates and dropped instances must have been issued by
    /// `names`, which protects databases of a shared server the pool does not own.
    pub fn new(
        provisioner: P,
        names: NameAllocator,
        high_water_mark: usize,
        strict_ownership: bool,
    ) -> Self {
        Self {
            provisioner,
            names,
            buffers: Arc::new(Mutex::new(HashMap::new())),
            in_flight: None,
            high_water_mark,
            strict_ownership,
        }
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// Returns the number of ready clones of `template`.
    pub fn depth(&self, template: &str) -> usize {
        self.buffers().get(template).map_or(0, Vec::len)
    }

    /// Returns `true` if a background task has been spawned and not joined yet.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Records the instance names present on the server.
    pub fn reconcile(&mut self, existing: Vec<String>) {
        self.names.reconcile_existing(existing);
    }

    /// Returns a new instance, cloned from `template` when given.
    ///
    /// A buffered clone is handed out when available. Otherwise the instance is created
    /// synchronously. Templated requests then schedule a replenishment if the buffer holds
    /// at most the high-water mark.
    pub async fn acquire(&mut self, template: Option<&str>) -> SandboxResult<String> {
        self.join().await?;

        if let Some(template) = template {
            self.ensure_owned(template, "Template was not created by this cluster")?;
        }

        let popped = template.and_then(|template| self.pop(template));
        let name = match popped {
            Some(name) => {
                debug!(%name, ?template, "handing out preloaded instance");
                name
            }
            None => {
                let name = self.allocate().await?;
                self.provisioner.create(&name, template).await?;
                name
            }
        };

        if let Some(template) = template
            && self.depth(template) <= self.high_water_mark
        {
            self.replenish(template).await?;
        }

        Ok(name)
    }

    /// Drops `name`, retiring its preloaded clones first if it is a template.
    pub async fn drop(&mut self, name: &str) -> SandboxResult<()> {
        self.ensure_owned(name, "Instance was not created by this cluster")?;

        if self.is_template(name) {
            self.retire(name).await?;
        }

        self.provisioner.drop(name).await
    }

    /// Joins the in-flight task and drops every ready clone of `template`.
    pub async fn retire(&mut self, template: &str) -> SandboxResult<()> {
        self.join().await?;

        let clones = self.buffers().remove(template).unwrap_or_default();
        if !clones.is_empty() {
            info!(%template, count = clones.len(), "retiring preloaded instances");
        }

        let mut errors = Vec::new();
        for name in clones {
            if let Err(err) = self.provisioner.drop(&name).await {
                errors.push(err);
            }
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    /// Joins the in-flight task and retires every buffer.
    ///
    /// Keeps going after a failure and returns every failure aggregated.
    pub async fn drain_all(&mut self) -> SandboxResult<()> {
        let mut errors = Vec::new();

        if let Err(err) = self.join().await {
            errors.push(err);
        }

        let templates: Vec<String> = self.buffers().keys().cloned().collect();
        for template in templates {
            if let Err(err) = self.retire(&template).await {
                errors.push(err);
            }
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    /// Waits for the in-flight task, if any, and returns its result.
    pub async fn join(&mut self) -> SandboxResult<()> {
        let Some(task) = self.in_flight.take() else {
            return Ok(());
        };

        match task.handle.await {
            Ok(result) => result,
            Err(err) => {
                warn!(template = %task.template, name = %task.name, "preload task did not complete");
                Err(SandboxError::from(err))
            }
        }
    }

    /// Allocates the next name, dropping a stale instance of the same name first.
    async fn allocate(&mut self) -> SandboxResult<String> {
        let AllocatedName { name, stale } = self.names.next();

        if stale {
            warn!(%name, "dropping stale instance left by a previous run");
            self.provisioner.drop(&name).await?;
            self.names.forget(&name);
        }

        Ok(name)
    }

    async fn replenish(&mut self, template: &str) -> SandboxResult<()> {
        debug_assert!(self.in_flight.is_none());

        let name = self.allocate().await?;
        // Registers the buffer before the clone exists so the template is known to be one.
        self.buffers().entry(template.to_owned()).or_default();

        let provisioner = self.provisioner.clone();
        let buffers = self.buffers.clone();
        let task_template = template.to_owned();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            provisioner
                .create(&task_name, Some(task_template.as_str()))
                .await?;

            buffers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(task_template)
                .or_default()
                .push(task_name);

            Ok(())
        });

        debug!(%name, %template, "scheduled preload");

        self.in_flight = Some(PreloadTask {
            template: template.to_owned(),
            name,
            handle,
        });

        Ok(())
    }

    fn pop(&self, template: &str) -> Option<String> {
        self.buffers().get_mut(template).and_then(Vec::pop)
    }

    fn is_template(&self, name: &str) -> bool {
        self.buffers().contains_key(name)
            || self
                .in_flight
                .as_ref()
                .is_some_and(|task| task.template == name)
    }

    fn ensure_owned(&self, name: &str, description: &'static str) -> SandboxResult<()> {
        if self.strict_ownership && !self.names.owns(name) {
            bail!(ErrorKind::ForeignInstance, description, name.to_owned());
        }

        Ok(())
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::memory_provisioner::{MemoryProvisioner, ProvisionCall};

    fn pool(provisioner: &MemoryProvisioner) -> TemplatePreloadPool<MemoryProvisioner> {
        TemplatePreloadPool::new(provisioner.clone(), NameAllocator::new("test_db"), 1, false)
    }

    #[tokio::test]
    async fn plain_requests_are_created_synchronously() {
        let provisioner = MemoryProvisioner::new();
        let mut pool = pool(&provisioner);

        assert_eq!(pool.acquire(None).await.unwrap(), "test_db1");
        assert_eq!(pool.acquire(None).await.unwrap(), "test_db2");
        assert!(!pool.has_in_flight());
        assert_eq!(
            provisioner.created().await,
            vec![("test_db1".into(), None), ("test_db2".into(), None)]
        );
    }

    #[tokio::test]
    async fn templated_request_schedules_one_replenishment() {
        let provisioner = MemoryProvisioner::new();
        let mut pool = pool(&provisioner);
        let template = pool.acquire(None).await.unwrap();

        let first = pool.acquire(Some(&template)).await.unwrap();

        assert_eq!(first, "test_db2");
        assert!(pool.has_in_flight());

        pool.join().await.unwrap();
        assert_eq!(pool.depth(&template), 1);
        assert!(provisioner.exists("test_db3").await);
    }

    #[tokio::test]
    async fn second_request_receives_the_replenished_clone() {
        let provisioner = MemoryProvisioner::new().with_create_delay(Duration::from_millis(20));
        let mut pool = pool(&provisioner);
        let template = pool.acquire(None).await.unwrap();
        provisioner.write(&template, "fixture row").await.unwrap();

        let first = pool.acquire(Some(&template)).await.unwrap();
        let second = pool.acquire(Some(&template)).await.unwrap();

        assert_eq!(first, "test_db2");
        assert_eq!(second, "test_db3");
        assert_eq!(
            provisioner.rows(&second).await,
            Some(vec!["fixture row".to_owned()])
        );
        // The buffer was popped so a new clone is on its way.
        assert!(pool.has_in_flight());
        assert_eq!(provisioner.max_concurrent_creates(), 1);
    }

    #[tokio::test]
    async fn replenishment_depends_on_buffer_depth() {
        let provisioner = MemoryProvisioner::new();
        let mut pool =
            TemplatePreloadPool::new(provisioner.clone(), NameAllocator::new("test_db"), 0, false);
        let template = pool.acquire(None).await.unwrap();

        pool.acquire(Some(&template)).await.unwrap();
        assert!(pool.has_in_flight());
        pool.join().await.unwrap();
        assert_eq!(pool.depth(&template), 1);

        // Depth is back to zero after the pop, which is at the high-water mark.
        pool.acquire(Some(&template)).await.unwrap();
        assert!(pool.has_in_flight());
        pool.join().await.unwrap();
        assert_eq!(pool.depth(&template), 1);
    }

    #[tokio::test]
    async fn full_buffer_skips_replenishment() {
        let provisioner = MemoryProvisioner::new();
        let mut pool =
            TemplatePreloadPool::new(provisioner.clone(), NameAllocator::new("test_db"), 0, false);
        let template = pool.acquire(None).await.unwrap();

        pool.acquire(Some(&template)).await.unwrap();
        pool.join().await.unwrap();
        // Manually grow the buffer past the high-water mark.
        pool.replenish(&template).await.unwrap();
        pool.join().await.unwrap();
        assert_eq!(pool.depth(&template), 2);

        pool.acquire(Some(&template)).await.unwrap();

        assert_eq!(pool.depth(&template), 1);
        assert!(!pool.has_in_flight());
    }

    #[tokio::test]
    async fn stale_instances_are_dropped_before_reuse() {
        let provisioner = MemoryProvisioner::new()
            .with_existing(["postgres", "test_db3"])
            .await;
        let mut pool = pool(&provisioner);
        pool.reconcile(provisioner.database_names().await);
        pool.acquire(None).await.unwrap();
        pool.acquire(None).await.unwrap();

        let third = pool.acquire(None).await.unwrap();

        assert_eq!(third, "test_db3");
        assert_eq!(provisioner.dropped().await, vec!["test_db3".to_owned()]);
        let calls = provisioner.calls().await;
        let drop_at = calls
            .iter()
            .position(|c| *c == ProvisionCall::Drop { name: "test_db3".into() })
            .unwrap();
        let create_at = calls
            .iter()
            .position(|c| {
                *c == ProvisionCall::Create {
                    name: "test_db3".into(),
                    template: None,
                }
            })
            .unwrap();
        assert!(drop_at < create_at);
    }

    #[tokio::test]
    async fn dropping_a_template_retires_its_clones() {
        let provisioner = MemoryProvisioner::new();
        let mut pool = pool(&provisioner);
        let template = pool.acquire(None).await.unwrap();
        let clone = pool.acquire(Some(&template)).await.unwrap();

        pool.drop(&clone).await.unwrap();
        pool.drop(&template).await.unwrap();

        assert!(!pool.has_in_flight());
        assert_eq!(pool.depth(&template), 0);
        assert!(provisioner.database_names().await.is_empty());
    }

    #[tokio::test]
    async fn drain_all_drops_every_buffered_clone() {
        let provisioner = MemoryProvisioner::new();
        let mut pool = pool(&provisioner);
        let first = pool.acquire(None).await.unwrap();
        let second = pool.acquire(None).await.unwrap();
        pool.acquire(Some(&first)).await.unwrap();
        pool.acquire(Some(&second)).await.unwrap();

        pool.drain_all().await.unwrap();

        assert_eq!(pool.depth(&first), 0);
        assert_eq!(pool.depth(&second), 0);
        assert_eq!(
            provisioner.database_names().await,
            vec!["test_db1", "test_db2", "test_db3", "test_db5"]
        );
        // Draining twice is harmless.
        pool.drain_all().await.unwrap();
    }

    #[tokio::test]
    async fn background_failures_surface_on_next_join() {
        let provisioner = MemoryProvisioner::new();
        let mut pool = pool(&provisioner);
        let template = pool.acquire(None).await.unwrap();
        // Created behind the pool's back, so the background clone into it fails.
        provisioner.create("test_db3", None).await.unwrap();
        pool.acquire(Some(&template)).await.unwrap();

        let err = pool.acquire(None).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert!(!pool.has_in_flight());
        assert_eq!(pool.depth(&template), 0);
    }

    #[tokio::test]
    async fn strict_pools_reject_foreign_names() {
        let provisioner = MemoryProvisioner::new().with_existing(["production"]).await;
        let mut pool =
            TemplatePreloadPool::new(provisioner.clone(), NameAllocator::new("test_db"), 1, true);

        let err = pool.drop("production").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ForeignInstance);

        let err = pool.acquire(Some("production")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ForeignInstance);

        let own = pool.acquire(None).await.unwrap();
        pool.drop(&own).await.unwrap();
        assert!(provisioner.exists("production").await);
    }
}
