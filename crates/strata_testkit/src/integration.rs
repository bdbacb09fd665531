//! Model-based test harness.
//!
//! Drives a tree and a `BTreeMap` reference side by side and checks that
//! they agree, along with the structural rules a balanced tree obeys.

use crate::fixtures::{gather, TestTree};
use crate::generators::Op;
use std::collections::BTreeMap;
use strata_core::{Address, BalanceReport, Options, Strata, Vivified};

/// A tree paired with a reference model of its contents.
pub struct ModelHarness {
    /// The tree under test.
    pub tree: TestTree,
    model: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl ModelHarness {
    /// Creates a harness over a fresh tree.
    #[must_use]
    pub fn new(options: Options) -> Self {
        Self {
            tree: TestTree::with_options(options),
            model: BTreeMap::new(),
        }
    }

    /// Applies an operation to both the tree and the model.
    pub fn apply(&mut self, op: &Op) {
        match op {
            Op::Insert(record) => self.insert(record),
            Op::Remove(key) => self.remove(key),
            Op::Balance => {
                self.tree.balance().expect("Balance failed");
            }
            Op::Purge(max_heft) => {
                self.tree.purge(*max_heft);
            }
        }
    }

    /// Inserts a record and checks the replaced flag against the model.
    pub fn insert(&mut self, record: &[u8]) {
        let key = self.tree.options().extract(record);
        let replaced = self.tree.insert(record).expect("Insert failed");
        let expected = self.model.insert(key, record.to_vec()).is_some();
        assert_eq!(replaced, expected, "replaced flag for {record:?}");
    }

    /// Removes a key and checks the removed flag against the model.
    pub fn remove(&mut self, key: &[u8]) {
        let removed = self.tree.remove(key).expect("Remove failed");
        let expected = self.model.remove(key).is_some();
        assert_eq!(removed, expected, "removed flag for {key:?}");
    }

    /// Balances the tree.
    pub fn balance(&mut self) {
        self.tree.balance().expect("Balance failed");
    }

    /// Balances the tree and returns what changed.
    pub fn balance_report(&mut self) -> BalanceReport {
        self.tree.balance().expect("Balance failed")
    }

    /// Snapshots the tree.
    ///
    /// # Errors
    ///
    /// Returns the tree error if a page cannot be loaded.
    pub fn vivify(&self) -> strata_core::CoreResult<Vivified> {
        self.tree.vivify()
    }

    /// Closes and reopens the tree, keeping the model.
    #[must_use]
    pub fn reopen(self) -> Self {
        Self {
            tree: self.tree.reopen(),
            model: self.model,
        }
    }

    /// Number of records the model holds.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.model.len()
    }

    /// Verifies that a left-to-right walk and point lookups match the model.
    pub fn verify_all(&self) {
        let expected: Vec<Vec<u8>> = self.model.values().cloned().collect();
        assert_eq!(gather(&self.tree), expected, "leaf walk differs from model");

        for (key, record) in &self.model {
            let found = self.tree.get(key).expect("Get failed");
            assert_eq!(found.as_ref(), Some(record), "lookup of {key:?}");
        }
    }

    /// Verifies the shape of the tree; see [`verify_structure`].
    pub fn verify_structure(&self) {
        verify_structure(&self.tree);
    }
}

/// Verifies the shape of a freshly balanced tree.
///
/// Leaves sit at one depth and chain left to right, no page is over its
/// threshold, ghosts only remain as the anchor of an empty leaf, and every
/// leaf's first record is at or after the pivot routing to it.
pub fn verify_structure(tree: &Strata) {
    let vivified = tree.vivify().expect("Vivify failed");
    let options = tree.options();
    let mut depths = Vec::new();
    check_page(&vivified, None, 1, options, &mut depths);
    depths.dedup();
    assert_eq!(depths.len(), 1, "leaves at different depths");

    let leaves = vivified.leaves();
    assert_eq!(leaves[0].address(), Address::LEFTMOST);
    for (i, leaf) in leaves.iter().enumerate() {
        let Vivified::Leaf { right, .. } = leaf else {
            unreachable!("leaves() only yields leaves");
        };
        let next = leaves.get(i + 1).map(|l| l.address());
        assert_eq!(*right, next, "right link of {}", leaf.address());
    }
}

fn check_page(
    page: &Vivified,
    lower: Option<&[u8]>,
    depth: usize,
    options: &Options,
    depths: &mut Vec<usize>,
) {
    match page {
        Vivified::Branch { address, children } => {
            assert!(!children.is_empty(), "branch {address} is empty");
            assert!(
                children.len() <= options.branch_size,
                "branch {address} has {} children",
                children.len()
            );
            for (pivot, child) in children {
                let lower = pivot.as_deref().or(lower);
                check_page(child, lower, depth + 1, options, depths);
            }
        }
        Vivified::Leaf {
            address,
            ghosts,
            records,
            ..
        } => {
            depths.push(depth);
            assert!(
                records.len() <= options.leaf_size,
                "leaf {address} holds {} records",
                records.len()
            );
            if records.is_empty() {
                assert!(*ghosts <= 1, "empty leaf {address} has {ghosts} ghosts");
            } else {
                assert_eq!(*ghosts, 0, "leaf {address} kept ghosts");
            }
            if let (Some(lower), Some(first)) = (lower, records.first()) {
                let key = options.extract(first);
                assert!(
                    options.compare(lower, &key).is_le(),
                    "leaf {address} starts before its pivot"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_tracks_inserts_and_removes() {
        let mut harness = ModelHarness::new(Options::new().leaf_size(2).branch_size(2));
        for key in ["m", "c", "x", "a", "q", "e"] {
            harness.insert(key.as_bytes());
        }
        harness.remove(b"c");
        harness.remove(b"zz");
        assert_eq!(harness.tracked_count(), 5);
        harness.verify_all();
        harness.balance();
        harness.verify_all();
        harness.verify_structure();
    }

    #[test]
    fn harness_survives_purge_and_reopen() {
        let mut harness = ModelHarness::new(Options::new().leaf_size(3));
        for i in 0..30u8 {
            harness.insert(&[b'a' + i % 26, b'0' + i / 26]);
        }
        harness.apply(&Op::Balance);
        harness.apply(&Op::Purge(0));
        harness.verify_all();
        let harness = harness.reopen();
        harness.verify_all();
        harness.verify_structure();
    }

    #[test]
    fn replacing_a_record_keeps_one_copy() {
        let options = Options::new().extractor(|record: &[u8]| record[..1].to_vec());
        let mut harness = ModelHarness::new(options);
        harness.insert(b"a1");
        harness.insert(b"b1");
        harness.insert(b"a2");
        harness.verify_all();
        assert_eq!(harness.tree.get(b"a").unwrap(), Some(b"a2".to_vec()));
    }
}
