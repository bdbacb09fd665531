//! Property-based test generators using proptest.
//!
//! Provides strategies for generating keys, tree options and operation
//! sequences.

use proptest::prelude::*;
use strata_core::Options;

/// An operation applied to both a tree and its reference model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Insert a record whose key is the record itself.
    Insert(Vec<u8>),
    /// Remove a key, present or not.
    Remove(Vec<u8>),
    /// Run the balancer.
    Balance,
    /// Evict cached pages down to the given heft.
    Purge(usize),
}

/// Strategy for keys drawn from a small alphabet so sequences collide.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::string::string_regex("[a-f]{1,3}")
        .expect("Invalid regex")
        .prop_map(String::into_bytes)
}

/// Strategy for arbitrary binary keys, including newlines and spaces.
pub fn binary_key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..16)
}

/// Strategy for a single operation, weighted towards inserts.
pub fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => key_strategy().prop_map(Op::Insert),
        3 => key_strategy().prop_map(Op::Remove),
        1 => Just(Op::Balance),
        1 => (0usize..64).prop_map(Op::Purge),
    ]
}

/// Strategy for an operation sequence.
pub fn ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 0..max_len)
}

/// Strategy for small tree thresholds.
pub fn options_strategy() -> impl Strategy<Value = Options> {
    (1usize..6, 2usize..5)
        .prop_map(|(leaf, branch)| Options::new().leaf_size(leaf).branch_size(branch))
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
