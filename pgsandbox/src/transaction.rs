//! Boundary to an external transaction manager.
//!
//! The sandbox does not manage transactions itself. A consumer owning a transaction manager
//! implements [`TransactionManager`] and [`Transaction`], and the sandbox registers a
//! [`Synchronizer`] with it to learn about successful commits.

use std::fmt;
use std::sync::Arc;

use crate::error::SandboxResult;

/// Callback invoked once a transaction finished committing.
///
/// The argument is `true` if the commit succeeded.
pub type AfterCommitHook = Box<dyn FnOnce(bool) + Send>;

/// A transaction driven by an external [`TransactionManager`].
pub trait Transaction {
    /// Registers `hook` to run after the transaction commits.
    ///
    /// Hooks are discarded without being called if the transaction aborts.
    fn add_after_commit_hook(&mut self, hook: AfterCommitHook);
}

/// Receives transaction boundary notifications from a [`TransactionManager`].
pub trait Synchronizer: Send + Sync {
    /// Called before a transaction starts committing or aborting.
    fn before_completion(&self, transaction: &mut dyn Transaction);

    /// Called when a new transaction begins.
    fn new_transaction(&self, transaction: &mut dyn Transaction);

    /// Called after a transaction committed or aborted, before its after-commit hooks run.
    fn after_completion(&self, transaction: &mut dyn Transaction);
}

/// Identifies a registered [`Synchronizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SynchronizerId(pub u64);

impl fmt::Display for SynchronizerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "synchronizer-{}", self.0)
    }
}

/// An external transaction manager the sandbox can hook into.
pub trait TransactionManager: Send + Sync {
    fn register_synchronizer(&self, synchronizer: Arc<dyn Synchronizer>) -> SynchronizerId;

    /// Unregisters a synchronizer. Unknown ids are ignored.
    fn unregister_synchronizer(&self, id: SynchronizerId);

    /// Aborts the current transaction, if any.
    fn abort(&self) -> SandboxResult<()>;
}
