//! # txscope pool
//!
//! Connection source trait and an in-memory pool for txscope.
//!
//! This crate is the lowest layer of txscope. Connections are **opaque**:
//! the transaction core only begins, commits and rolls back units of work
//! on them, and hands them to callers for issuing statements.
//!
//! ## Design Principles
//!
//! - A source lends connections out and takes them back, nothing more
//! - No knowledge of SQL dialects, statements or sessions
//! - Must be `Send + Sync` so a scope can be shared across worker threads
//! - Connection identity is the `Arc` allocation, never value equality
//!
//! ## Available Sources
//!
//! - [`MemorySource`] - A bounded pool of recording [`MemoryConnection`]s
//!
//! ## Example
//!
//! ```rust
//! use txscope_pool::{ConnectionSource, MemorySource};
//!
//! let pool = MemorySource::new("main", 4);
//! let conn = pool.acquire().unwrap();
//! conn.begin().unwrap();
//! conn.execute("INSERT INTO t VALUES (1)").unwrap();
//! conn.commit().unwrap();
//! pool.release(conn).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod source;

pub use error::{PoolError, PoolResult};
pub use memory::{MemoryConnection, MemorySource};
pub use source::{connection_addr, ConnectionSource, RawConnection, SharedConnection};
