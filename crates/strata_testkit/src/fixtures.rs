//! Test fixtures and tree helpers.
//!
//! Provides convenience functions for setting up trees in temporary
//! directories and common test scenarios.

use std::path::Path;
use strata_core::{Options, Strata};
use tempfile::TempDir;

/// Options with tiny thresholds so a handful of records exercises every
/// split and merge path.
#[must_use]
pub fn small_options() -> Options {
    Options::new().leaf_size(3).branch_size(3)
}

/// A tree in a temporary directory, removed on drop.
pub struct TestTree {
    /// The tree instance.
    pub tree: Strata,
    options: Options,
    temp_dir: TempDir,
}

impl TestTree {
    /// Creates a tree with [`small_options`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(small_options())
    }

    /// Creates a tree with the given options.
    #[must_use]
    pub fn with_options(options: Options) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let tree = Strata::create(temp_dir.path(), options.clone()).expect("Failed to create tree");
        Self {
            tree,
            options,
            temp_dir,
        }
    }

    /// The tree directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// The options the tree was created with.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Closes the tree and opens it again from disk with a cold cache.
    #[must_use]
    pub fn reopen(self) -> Self {
        self.with_closed(|_| {})
    }

    /// Closes the tree, runs `f` against its directory, then opens it again.
    #[must_use]
    pub fn with_closed<F>(self, f: F) -> Self
    where
        F: FnOnce(&Path),
    {
        let Self {
            tree,
            options,
            temp_dir,
        } = self;
        tree.close().expect("Failed to close tree");
        f(temp_dir.path());
        let tree = Strata::open(temp_dir.path(), options.clone()).expect("Failed to reopen tree");
        Self {
            tree,
            options,
            temp_dir,
        }
    }
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestTree {
    type Target = Strata;

    fn deref(&self) -> &Self::Target {
        &self.tree
    }
}

/// Runs a test against a fresh tree with [`small_options`].
///
/// # Example
///
/// ```rust
/// use strata_testkit::with_temp_tree;
///
/// with_temp_tree(|tree| {
///     tree.insert(b"a").unwrap();
///     assert_eq!(tree.get(b"a").unwrap(), Some(b"a".to_vec()));
/// });
/// ```
pub fn with_temp_tree<F, R>(f: F) -> R
where
    F: FnOnce(&Strata) -> R,
{
    let test_tree = TestTree::new();
    f(&test_tree.tree)
}

/// Collects every live record by walking the leaves left to right.
#[must_use]
pub fn gather(tree: &Strata) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    let mut cursor = tree.leftmost().expect("Failed to lock left-most leaf");
    loop {
        records.extend(cursor.records().expect("Failed to read leaf"));
        if !cursor.next().expect("Failed to step right") {
            break;
        }
    }
    records
}

/// [`gather`] as UTF-8 strings.
#[must_use]
pub fn gather_strings(tree: &Strata) -> Vec<String> {
    gather(tree)
        .into_iter()
        .map(|r| String::from_utf8(r).expect("Record is not UTF-8"))
        .collect()
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Zero-padded key for record `i`, so byte order matches numeric order.
    #[must_use]
    pub fn numbered(i: usize) -> Vec<u8> {
        format!("{i:05}").into_bytes()
    }

    /// Creates a balanced tree holding records `0..count`.
    #[must_use]
    pub fn populated_tree(count: usize) -> TestTree {
        let test_tree = TestTree::new();
        for i in 0..count {
            test_tree
                .insert(&numbered(i))
                .expect("Failed to insert record");
        }
        test_tree.balance().expect("Failed to balance");
        test_tree
    }

    /// Creates a tree whose left-most leaf holds `a` and whose second leaf
    /// holds `c` and `d`.
    #[must_use]
    pub fn split_pair() -> TestTree {
        let test_tree = TestTree::with_options(Options::new().leaf_size(2));
        for record in [b"a", b"c", b"d"] {
            test_tree.insert(record).expect("Failed to insert record");
        }
        test_tree.balance().expect("Failed to balance");
        test_tree
    }
}

#[cfg(test)]
mod tests {
    use super::scenarios::*;
    use super::*;

    #[test]
    fn test_tree_starts_empty() {
        let tree = TestTree::new();
        assert!(gather(&tree).is_empty());
        assert!(tree.path().join("0.0").exists());
    }

    #[test]
    fn reopen_keeps_records() {
        let tree = populated_tree(10).reopen();
        assert_eq!(tree.cached(), 0);
        assert_eq!(gather(&tree).len(), 10);
        assert_eq!(gather(&tree)[9], numbered(9));
    }

    #[test]
    fn split_pair_layout() {
        let tree = split_pair();
        let vivified = tree.vivify().unwrap();
        let leaves = vivified.leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(gather_strings(&tree), vec!["a", "c", "d"]);
    }

    #[test]
    fn with_temp_tree_passes_a_live_tree() {
        let count = with_temp_tree(|tree| {
            tree.insert(b"x").unwrap();
            tree.records().unwrap().len()
        });
        assert_eq!(count, 1);
    }
}
