//! Process-wide registry of scopes.

use crate::config::ScopeConfig;
use crate::error::{CoreError, CoreResult};
use crate::identity::SessionInitializer;
use crate::scope::Scope;
use crate::transaction::ThreadAffinityTable;
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use txscope_pool::ConnectionSource;

/// Owns every [`Scope`] of the process.
///
/// All scopes registered here share one [`ThreadAffinityTable`], so a
/// single `share_connections` call lets a worker thread see the caller's
/// transactions in every scope at once.
#[derive(Default)]
pub struct ScopeManager {
    affinity: Arc<ThreadAffinityTable>,
    scopes: RwLock<Vec<Arc<Scope>>>,
}

impl ScopeManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a scope for `source`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateScope` if a scope with the same name exists.
    pub fn register(
        &self,
        source: Arc<dyn ConnectionSource>,
        config: ScopeConfig,
    ) -> CoreResult<Arc<Scope>> {
        let scope = Scope::with_config(source, config).with_affinity(Arc::clone(&self.affinity));
        self.insert(scope)
    }

    /// Like [`ScopeManager::register`], with custom session setup.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateScope` if a scope with the same name exists.
    pub fn register_with_initializer(
        &self,
        source: Arc<dyn ConnectionSource>,
        config: ScopeConfig,
        initializer: Arc<dyn SessionInitializer>,
    ) -> CoreResult<Arc<Scope>> {
        let scope = Scope::with_config(source, config)
            .with_affinity(Arc::clone(&self.affinity))
            .with_initializer(initializer);
        self.insert(scope)
    }

    fn insert(&self, scope: Scope) -> CoreResult<Arc<Scope>> {
        let mut scopes = self.scopes.write();
        if scopes.iter().any(|s| s.name() == scope.name()) {
            return Err(CoreError::DuplicateScope {
                name: scope.name().to_string(),
            });
        }
        let scope = Arc::new(scope);
        scopes.push(Arc::clone(&scope));
        tracing::info!(scope = %scope.name(), "registered scope");
        Ok(scope)
    }

    /// Looks up a scope by name.
    ///
    /// # Errors
    ///
    /// Returns `ScopeNotFound` if no scope has that name.
    pub fn get(&self, name: &str) -> CoreResult<Arc<Scope>> {
        self.scopes
            .read()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| CoreError::ScopeNotFound {
                name: name.to_string(),
            })
    }

    /// Returns every registered scope in registration order.
    #[must_use]
    pub fn scopes(&self) -> Vec<Arc<Scope>> {
        self.scopes.read().clone()
    }

    /// Returns the shared thread affinity table.
    #[must_use]
    pub fn affinity(&self) -> &Arc<ThreadAffinityTable> {
        &self.affinity
    }

    /// Lets `borrower` use the calling thread's transactions in every scope.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySharing` if `borrower` is already sharing.
    pub fn share_connections(&self, borrower: ThreadId) -> CoreResult<()> {
        self.affinity.share(borrower, thread::current().id())
    }

    /// Ends a redirect created by [`ScopeManager::share_connections`].
    ///
    /// # Errors
    ///
    /// Returns `NotSharing` if `borrower` is not sharing.
    pub fn stop_sharing_connections(&self, borrower: ThreadId) -> CoreResult<()> {
        self.affinity.stop_sharing(borrower).map(|_| ())
    }

    /// Forcibly closes every transaction in every scope.
    ///
    /// Meant for shutdown. Returns the number of transactions closed.
    pub fn close_all_connections(&self) -> usize {
        let closed: usize = self
            .scopes()
            .iter()
            .map(|scope| scope.close_all_transactions())
            .sum();
        if closed > 0 {
            tracing::warn!(closed, "closed transactions left open at shutdown");
        }
        closed
    }
}

impl std::fmt::Debug for ScopeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .scopes
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        f.debug_struct("ScopeManager")
            .field("scopes", &names)
            .field("sharing", &self.affinity.len())
            .finish()
    }
}
