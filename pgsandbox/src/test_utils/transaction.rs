use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::SandboxResult;
use crate::transaction::{
    AfterCommitHook, Synchronizer, SynchronizerId, Transaction, TransactionManager,
};

/// Transaction of a [`LocalTransactionManager`], holding its after-commit hooks.
#[derive(Default)]
pub struct LocalTransaction {
    hooks: Vec<AfterCommitHook>,
}

impl Transaction for LocalTransaction {
    fn add_after_commit_hook(&mut self, hook: AfterCommitHook) {
        self.hooks.push(hook);
    }
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    synchronizers: Vec<(SynchronizerId, Arc<dyn Synchronizer>)>,
    current: Option<LocalTransaction>,
    aborts: usize,
}

/// Minimal single-threaded [`TransactionManager`] for tests.
///
/// Commits run the registered synchronizers and then the after-commit hooks with a
/// successful status. Aborts run the synchronizers and discard the hooks.
#[derive(Default)]
pub struct LocalTransactionManager {
    inner: Mutex<Inner>,
}

impl LocalTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a new transaction, discarding the current one.
    pub fn begin(&self) {
        let mut transaction = LocalTransaction::default();
        for synchronizer in self.synchronizers() {
            synchronizer.new_transaction(&mut transaction);
        }

        self.lock().current = Some(transaction);
    }

    /// Commits the current transaction, or an empty one if none was begun.
    pub fn commit(&self) {
        let mut transaction = self.lock().current.take().unwrap_or_default();
        let synchronizers = self.synchronizers();

        for synchronizer in &synchronizers {
            synchronizer.before_completion(&mut transaction);
        }
        for synchronizer in &synchronizers {
            synchronizer.after_completion(&mut transaction);
        }
        for hook in transaction.hooks {
            hook(true);
        }
    }

    pub fn synchronizer_count(&self) -> usize {
        self.lock().synchronizers.len()
    }

    pub fn abort_count(&self) -> usize {
        self.lock().aborts
    }

    fn synchronizers(&self) -> Vec<Arc<dyn Synchronizer>> {
        self.lock()
            .synchronizers
            .iter()
            .map(|(_, synchronizer)| synchronizer.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransactionManager for LocalTransactionManager {
    fn register_synchronizer(&self, synchronizer: Arc<dyn Synchronizer>) -> SynchronizerId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = SynchronizerId(inner.next_id);
        inner.synchronizers.push((id, synchronizer));

        id
    }

    fn unregister_synchronizer(&self, id: SynchronizerId) {
        self.lock()
            .synchronizers
            .retain(|(registered, _)| *registered != id);
    }

    fn abort(&self) -> SandboxResult<()> {
        let mut transaction = {
            let mut inner = self.lock();
            inner.aborts += 1;
            inner.current.take().unwrap_or_default()
        };

        for synchronizer in self.synchronizers() {
            synchronizer.before_completion(&mut transaction);
            synchronizer.after_completion(&mut transaction);
        }

        Ok(())
    }
}
