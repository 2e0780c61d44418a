//! # txscope testkit
//!
//! Test utilities for txscope.
//!
//! This crate provides:
//! - Test fixtures over an in-memory connection pool
//! - Property-based generators of scope operations using proptest
//! - A model-checking harness for the commit/close protocol
//! - Helpers for sharing a transaction with a worker thread
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust
//! use txscope_testkit::prelude::*;
//!
//! let ts = TestScope::new(1);
//! let levels = scenarios::open_levels(&ts, 3);
//! scenarios::commit_levels(&levels);
//! assert_eq!(ts.total_commits(), 1);
//! ts.assert_quiescent();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
