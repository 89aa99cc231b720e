use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::bail;
use crate::error::{ErrorKind, SandboxResult};
use crate::provisioner::Provision;

/// A call received by a [`MemoryProvisioner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionCall {
    Create {
        name: String,
        template: Option<String>,
    },
    Drop {
        name: String,
    },
    List,
}

#[derive(Debug, Default)]
struct Inner {
    /// Rows of every database, keyed by database name.
    databases: BTreeMap<String, Vec<String>>,
    calls: Vec<ProvisionCall>,
}

/// In-memory [`Provision`] implementation for tests.
///
/// Databases are maps of rows so that clones can be checked for equal contents. Every call
/// is recorded, and the number of concurrently running creations is tracked so tests can
/// assert that background work never overlaps.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvisioner {
    inner: Arc<Mutex<Inner>>,
    creating: Arc<AtomicUsize>,
    max_creating: Arc<AtomicUsize>,
    create_delay: Option<Duration>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every creation take `delay`, leaving room for overlapping work.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Seeds databases left over on the server, e.g. by a crashed run.
    pub async fn with_existing<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut inner = self.inner.lock().await;
            for name in names {
                inner.databases.insert(name.into(), Vec::new());
            }
        }
        self
    }

    /// Appends a row to `name`.
    pub async fn write(&self, name: &str, row: impl Into<String>) -> SandboxResult<()> {
        let mut inner = self.inner.lock().await;
        let Some(rows) = inner.databases.get_mut(name) else {
            bail!(
                ErrorKind::CommandFailed,
                "Database does not exist",
                name.to_owned()
            );
        };
        rows.push(row.into());

        Ok(())
    }

    /// Returns the rows of `name`, if it exists.
    pub async fn rows(&self, name: &str) -> Option<Vec<String>> {
        self.inner.lock().await.databases.get(name).cloned()
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.inner.lock().await.databases.contains_key(name)
    }

    pub async fn database_names(&self) -> Vec<String> {
        self.inner.lock().await.databases.keys().cloned().collect()
    }

    pub async fn calls(&self) -> Vec<ProvisionCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Returns the recorded creations, in order.
    pub async fn created(&self) -> Vec<(String, Option<String>)> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|call| match call {
                ProvisionCall::Create { name, template } => Some((name.clone(), template.clone())),
                _ => None,
            })
            .collect()
    }

    /// Returns the recorded drops, in order.
    pub async fn dropped(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|call| match call {
                ProvisionCall::Drop { name } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the highest number of creations observed running at the same time.
    pub fn max_concurrent_creates(&self) -> usize {
        self.max_creating.load(Ordering::SeqCst)
    }
}

impl Provision for MemoryProvisioner {
    async fn create(&self, name: &str, template: Option<&str>) -> SandboxResult<()> {
        let running = self.creating.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_creating.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut inner = self.inner.lock().await;
            inner.calls.push(ProvisionCall::Create {
                name: name.to_owned(),
                template: template.map(str::to_owned),
            });

            let rows = match template {
                Some(template) => inner.databases.get(template).cloned(),
                None => Some(Vec::new()),
            };

            match rows {
                _ if inner.databases.contains_key(name) => Err(crate::sandbox_error!(
                    ErrorKind::CommandFailed,
                    "Command exited unsuccessfully",
                    format!("command failed: createdb {name}\nOUTPUT:\ndatabase \"{name}\" already exists")
                )),
                None => Err(crate::sandbox_error!(
                    ErrorKind::CommandFailed,
                    "Command exited unsuccessfully",
                    format!("command failed: createdb {name}\nOUTPUT:\ntemplate database does not exist")
                )),
                Some(rows) => {
                    inner.databases.insert(name.to_owned(), rows);
                    Ok(())
                }
            }
        };

        self.creating.fetch_sub(1, Ordering::SeqCst);

        info!(%name, ?template, "created in-memory database");

        result
    }

    async fn drop(&self, name: &str) -> SandboxResult<()> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(ProvisionCall::Drop {
            name: name.to_owned(),
        });

        if inner.databases.remove(name).is_none() {
            bail!(
                ErrorKind::CommandFailed,
                "Command exited unsuccessfully",
                format!("command failed: dropdb {name}\nOUTPUT:\ndatabase \"{name}\" does not exist")
            );
        }

        Ok(())
    }

    async fn list(&self) -> SandboxResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(ProvisionCall::List);

        Ok(inner.databases.keys().cloned().collect())
    }
}
