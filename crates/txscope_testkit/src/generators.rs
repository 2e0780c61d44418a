//! Property-based test generators using proptest.
//!
//! Provides strategies for generating sequences of scope operations,
//! including ones that misuse the commit/close protocol on purpose.

use proptest::prelude::*;

/// One step a caller can take against a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOp {
    /// `ensure_transaction`: join or create.
    Open,
    /// `commit` on the current level.
    Commit,
    /// `close` on the current level.
    Close,
}

/// Strategy for a single operation, weighted towards well-formed use.
pub fn scope_op_strategy() -> impl Strategy<Value = ScopeOp> {
    prop_oneof![
        3 => Just(ScopeOp::Open),
        2 => Just(ScopeOp::Commit),
        3 => Just(ScopeOp::Close),
    ]
}

/// Strategy for arbitrary operation sequences.
pub fn scope_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<ScopeOp>> {
    prop::collection::vec(scope_op_strategy(), 0..max_len)
}

/// Strategy for a well-formed nesting: one commit flag per level, applied
/// innermost first.
pub fn nesting_plan_strategy(max_depth: usize) -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 1..=max_depth.max(1))
}

/// Strategy for commit task keys; small alphabet so duplicates are common.
pub fn task_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-c]{1,2}").expect("Invalid regex")
}
