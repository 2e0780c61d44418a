//! Connection and connection source traits.

use crate::error::PoolResult;
use std::fmt;
use std::sync::Arc;

/// A raw, driver-level database connection.
///
/// Connections are **opaque** to the transaction core. It only needs to
/// start a unit of work, issue statements, and finish the unit of work with
/// either a commit or a rollback. Dialects and statement generation live
/// elsewhere.
///
/// Methods take `&self`: a connection is shared behind an [`Arc`] and the
/// implementation is responsible for its own interior synchronization.
pub trait RawConnection: Send + Sync + fmt::Debug {
    /// Human-readable label, used in log output and error messages.
    fn label(&self) -> &str;

    /// Switches the connection out of auto-commit mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver rejects the request.
    fn begin(&self) -> PoolResult<()>;

    /// Issues a statement on the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver fails to execute the statement.
    fn execute(&self, statement: &str) -> PoolResult<()>;

    /// Commits the current unit of work and returns to auto-commit mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails. The work is then lost.
    fn commit(&self) -> PoolResult<()>;

    /// Discards the current unit of work and returns to auto-commit mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver fails to roll back.
    fn rollback(&self) -> PoolResult<()>;
}

/// A connection handle as passed between a source and its borrowers.
///
/// The `Arc` allocation is the connection's identity: a pool that recycles
/// a physical connection hands out the same allocation again.
pub type SharedConnection = Arc<dyn RawConnection>;

/// A pool or driver that hands out raw connections.
///
/// # Invariants
///
/// - Every connection returned by `acquire` is handed back through
///   `release` exactly once
/// - A connection is never handed to two borrowers at the same time
/// - Sources must be `Send + Sync` so scopes can be shared across threads
pub trait ConnectionSource: Send + Sync {
    /// Name of the source (database URL, pool name, ...).
    fn name(&self) -> &str;

    /// Borrows a connection, blocking until one is available.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No connection becomes available in time
    /// - The source has been closed
    /// - The driver fails to open a new connection
    fn acquire(&self) -> PoolResult<SharedConnection>;

    /// Returns a previously acquired connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection did not come from this source.
    fn release(&self, connection: SharedConnection) -> PoolResult<()>;
}

/// Returns the identity address of a shared connection.
///
/// Two handles have the same address only if they point at the same
/// allocation. Equal-looking connections in distinct allocations never
/// share an address while both are alive.
#[must_use]
pub fn connection_addr(connection: &SharedConnection) -> usize {
    Arc::as_ptr(connection) as *const () as usize
}
