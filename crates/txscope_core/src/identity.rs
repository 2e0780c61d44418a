//! Identity-keyed cache of per-connection session metadata.
//!
//! Pools recycle physical connections. Session setup (dialect-specific
//! `SET` statements, fetching a backend session id, ...) only has to run
//! once per physical connection, so its result is remembered against the
//! connection's *identity*: the `Arc` allocation handed out by the source.
//! Value equality is never consulted.
//!
//! Each entry holds a [`Weak`] to its connection. While the entry exists the
//! allocation cannot be freed, so its address cannot be reused by a
//! different connection. Entries whose connection has been dropped
//! everywhere else are purged opportunistically, and a hard capacity evicts
//! the oldest entries first.

use crate::error::CoreResult;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use txscope_pool::{connection_addr, RawConnection, SharedConnection};
use uuid::Uuid;

/// Metadata produced by one-time session setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Backend session identifier.
    pub session_id: String,
}

impl SessionInfo {
    /// Creates session info with the given id.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

/// Runs one-time setup on a freshly seen connection.
pub trait SessionInitializer: Send + Sync {
    /// Prepares the connection and returns its session metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if setup fails; the connection is then returned to
    /// its source and the acquisition fails.
    fn initialize(&self, connection: &dyn RawConnection) -> CoreResult<SessionInfo>;
}

/// Default initializer: issues no statements and assigns a random session id.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidSessionInitializer;

impl SessionInitializer for UuidSessionInitializer {
    fn initialize(&self, _connection: &dyn RawConnection) -> CoreResult<SessionInfo> {
        Ok(SessionInfo::new(Uuid::new_v4().to_string()))
    }
}

impl<F> SessionInitializer for F
where
    F: Fn(&dyn RawConnection) -> CoreResult<SessionInfo> + Send + Sync,
{
    fn initialize(&self, connection: &dyn RawConnection) -> CoreResult<SessionInfo> {
        self(connection)
    }
}

struct CacheEntry<V> {
    connection: Weak<dyn RawConnection>,
    value: V,
    generation: u64,
}

struct CacheInner<V> {
    entries: HashMap<usize, CacheEntry<V>>,
    /// Insertion order as (address, generation). Stale pairs are skipped.
    order: VecDeque<(usize, u64)>,
    next_generation: u64,
}

impl<V> CacheInner<V> {
    fn remove_dead(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.connection.strong_count() > 0);
        before - self.entries.len()
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((addr, generation)) = self.order.pop_front() {
            let current = self
                .entries
                .get(&addr)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                self.entries.remove(&addr);
                return true;
            }
        }
        false
    }

    fn compact_order(&mut self) {
        let entries = &self.entries;
        self.order.retain(|(addr, generation)| {
            entries
                .get(addr)
                .is_some_and(|entry| entry.generation == *generation)
        });
    }
}

/// A bounded map from connection identity to a value.
pub struct ConnectionIdentityCache<V> {
    capacity: usize,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> ConnectionIdentityCache<V> {
    /// Creates a cache that holds at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_generation: 0,
            }),
        }
    }

    /// Returns the maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of entries, including ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if the cache has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the value cached for this exact connection.
    #[must_use]
    pub fn get(&self, connection: &SharedConnection) -> Option<V> {
        let addr = connection_addr(connection);
        let mut inner = self.inner.lock();
        let live = inner
            .entries
            .get(&addr)
            .map(|entry| entry.connection.strong_count() > 0)?;
        if !live {
            inner.entries.remove(&addr);
            return None;
        }
        inner.entries.get(&addr).map(|entry| entry.value.clone())
    }

    /// Caches `value` for the connection, replacing any previous value.
    pub fn insert(&self, connection: &SharedConnection, value: V) {
        let addr = connection_addr(connection);
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(&addr) && inner.entries.len() >= self.capacity {
            let purged = inner.remove_dead();
            if purged > 0 {
                tracing::trace!(purged, "purged unreachable connections from identity cache");
            }
            while inner.entries.len() >= self.capacity {
                if !inner.evict_oldest() {
                    break;
                }
            }
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.entries.insert(
            addr,
            CacheEntry {
                connection: Arc::downgrade(connection),
                value,
                generation,
            },
        );
        inner.order.push_back((addr, generation));

        if inner.order.len() > self.capacity * 2 {
            inner.compact_order();
        }
    }

    /// Returns the cached value, or computes and caches it.
    ///
    /// The boolean is true on a cache hit. `init` runs without the cache
    /// lock held.
    ///
    /// # Errors
    ///
    /// Returns whatever `init` returns; nothing is cached on error.
    pub fn get_or_try_insert_with<F>(
        &self,
        connection: &SharedConnection,
        init: F,
    ) -> CoreResult<(V, bool)>
    where
        F: FnOnce() -> CoreResult<V>,
    {
        if let Some(value) = self.get(connection) {
            return Ok((value, true));
        }
        let value = init()?;
        self.insert(connection, value.clone());
        Ok((value, false))
    }

    /// Forgets the connection. The next lookup misses.
    pub fn remove(&self, connection: &SharedConnection) -> Option<V> {
        let addr = connection_addr(connection);
        self.inner.lock().entries.remove(&addr).map(|entry| entry.value)
    }

    /// Drops every entry whose connection is no longer reachable.
    ///
    /// Returns the number of entries removed.
    pub fn purge(&self) -> usize {
        let mut inner = self.inner.lock();
        let purged = inner.remove_dead();
        inner.compact_order();
        purged
    }
}

impl<V> std::fmt::Debug for ConnectionIdentityCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionIdentityCache")
            .field("capacity", &self.capacity)
            .field("len", &self.inner.lock().entries.len())
            .finish()
    }
}
