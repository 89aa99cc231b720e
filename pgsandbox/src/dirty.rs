//! Tracking of databases modified by a committed transaction.
//!
//! A database is dirty once something committed to it, after which the resource optimizer
//! must rebuild it instead of handing it to the next test. Commits are observed either by
//! wrapping the connection in [`DirtyOnCommit`] or by registering a [`CommitSynchronizer`]
//! with an external transaction manager. A consumer picks one of the two per database.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Error, Row, SimpleQueryMessage, Statement, ToStatement};
use tracing::debug;

use crate::transaction::{Synchronizer, Transaction};

/// Notified the first time a database becomes dirty.
pub trait DirtyListener: Send + Sync {
    fn dirtied(&self, database: &str);
}

struct DirtyFlagInner {
    database: String,
    dirty: AtomicBool,
    listener: Option<Arc<dyn DirtyListener>>,
}

/// Shared dirty flag of a database.
///
/// Clones observe and update the same flag.
#[derive(Clone)]
pub struct DirtyFlag {
    inner: Arc<DirtyFlagInner>,
}

impl DirtyFlag {
    /// Creates a clean flag for `database`.
    pub fn new(database: impl Into<String>, listener: Option<Arc<dyn DirtyListener>>) -> Self {
        Self {
            inner: Arc::new(DirtyFlagInner {
                database: database.into(),
                dirty: AtomicBool::new(false),
                listener,
            }),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// Marks the database dirty.
    ///
    /// Idempotent; the listener only hears about the clean-to-dirty transition.
    pub fn mark_dirty(&self) {
        if self.inner.dirty.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(database = %self.inner.database, "database marked dirty");

        if let Some(listener) = &self.inner.listener {
            listener.dirtied(&self.inner.database);
        }
    }

    pub fn reset(&self) {
        self.inner.dirty.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for DirtyFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirtyFlag")
            .field("database", &self.inner.database)
            .field("dirty", &self.is_dirty())
            .field("has_listener", &self.inner.listener.is_some())
            .finish()
    }
}

/// Marks the database dirty if `result` is a success, then hands the result back.
fn mark_on_success<T, E>(flag: &DirtyFlag, result: Result<T, E>) -> Result<T, E> {
    if result.is_ok() {
        flag.mark_dirty();
    }

    result
}

/// Client proxy marking its database dirty whenever something may have been committed.
///
/// The client runs in autocommit mode, so every statement executed directly through the
/// proxy counts as committed once it succeeds, reads included. Statements run inside a
/// transaction opened with [`DirtyOnCommit::transaction`] only count when that transaction
/// commits. The wrapped client is not reachable while wrapped, except through
/// [`DirtyOnCommit::into_inner`].
#[derive(Debug)]
pub struct DirtyOnCommit {
    client: Client,
    flag: DirtyFlag,
}

impl DirtyOnCommit {
    pub fn wrap(client: Client, flag: DirtyFlag) -> Self {
        Self { client, flag }
    }

    pub fn flag(&self) -> &DirtyFlag {
        &self.flag
    }

    pub async fn execute<T>(
        &self,
        statement: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, Error>
    where
        T: ?Sized + ToStatement,
    {
        mark_on_success(&self.flag, self.client.execute(statement, params).await)
    }

    pub async fn batch_execute(&self, query: &str) -> Result<(), Error> {
        mark_on_success(&self.flag, self.client.batch_execute(query).await)
    }

    pub async fn simple_query(&self, query: &str) -> Result<Vec<SimpleQueryMessage>, Error> {
        mark_on_success(&self.flag, self.client.simple_query(query).await)
    }

    pub async fn query<T>(
        &self,
        statement: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, Error>
    where
        T: ?Sized + ToStatement,
    {
        mark_on_success(&self.flag, self.client.query(statement, params).await)
    }

    pub async fn query_one<T>(
        &self,
        statement: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, Error>
    where
        T: ?Sized + ToStatement,
    {
        mark_on_success(&self.flag, self.client.query_one(statement, params).await)
    }

    pub async fn query_opt<T>(
        &self,
        statement: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, Error>
    where
        T: ?Sized + ToStatement,
    {
        mark_on_success(&self.flag, self.client.query_opt(statement, params).await)
    }

    pub async fn prepare(&self, query: &str) -> Result<Statement, Error> {
        self.client.prepare(query).await
    }

    /// Commits a transaction begun with a plain `BEGIN`, then marks the database dirty.
    ///
    /// A failed commit leaves the flag untouched.
    pub async fn commit(&self) -> Result<(), Error> {
        self.batch_execute("COMMIT").await
    }

    /// Begins a transaction whose successful commit marks the database dirty.
    pub async fn transaction(&mut self) -> Result<DirtyTransaction<'_>, Error> {
        let transaction = self.client.transaction().await?;

        Ok(DirtyTransaction {
            transaction,
            flag: self.flag.clone(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    pub fn into_inner(self) -> Client {
        self.client
    }
}

/// Transaction opened through [`DirtyOnCommit::transaction`].
///
/// Statements run through [`Deref`] to the underlying transaction; only
/// [`DirtyTransaction::commit`] marks the database dirty. Dropping it rolls back.
pub struct DirtyTransaction<'a> {
    transaction: tokio_postgres::Transaction<'a>,
    flag: DirtyFlag,
}

impl DirtyTransaction<'_> {
    pub async fn commit(self) -> Result<(), Error> {
        mark_on_success(&self.flag, self.transaction.commit().await)
    }

    pub async fn rollback(self) -> Result<(), Error> {
        self.transaction.rollback().await
    }
}

impl<'a> Deref for DirtyTransaction<'a> {
    type Target = tokio_postgres::Transaction<'a>;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

impl fmt::Debug for DirtyTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirtyTransaction")
            .field("flag", &self.flag)
            .finish_non_exhaustive()
    }
}

/// [`Synchronizer`] marking a database dirty after every successful commit.
#[derive(Debug, Clone)]
pub struct CommitSynchronizer {
    flag: DirtyFlag,
}

impl CommitSynchronizer {
    pub fn new(flag: DirtyFlag) -> Self {
        Self { flag }
    }
}

impl Synchronizer for CommitSynchronizer {
    fn before_completion(&self, _transaction: &mut dyn Transaction) {}

    fn new_transaction(&self, _transaction: &mut dyn Transaction) {}

    fn after_completion(&self, transaction: &mut dyn Transaction) {
        let flag = self.flag.clone();
        transaction.add_after_commit_hook(Box::new(move |committed| {
            if committed {
                flag.mark_dirty();
            }
        }));
    }
}
