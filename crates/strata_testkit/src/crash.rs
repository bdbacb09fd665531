//! Crash simulation.
//!
//! Damages page files on disk the way an interrupted process would, so
//! tests can check what a reopened tree reports. [`interrupt_commit`]
//! leaves a multi-page change journaled but not applied.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use strata_core::page::Page;
use strata_core::{Address, Options};
use strata_storage::{Commit, PageStore, StorageResult};

/// Ways a crash can leave a page file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// The last append lost its final `bytes` bytes.
    TornAppend {
        /// Bytes cut from the end of the file.
        bytes: u64,
    },
    /// Bytes that do not form a line were appended.
    GarbageTail,
    /// A rewrite was interrupted before its rename.
    PendingRewrite,
    /// An older version survived a rewrite.
    StaleVersion,
}

fn parse_version(name: &str, address: Address) -> Option<u64> {
    let (prefix, version) = name.split_once('.')?;
    if prefix.parse::<u64>().ok()? != address.as_u64() {
        return None;
    }
    version.parse().ok()
}

/// Path and version of the newest file of a page, if it exists.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be listed.
pub fn page_file(directory: &Path, address: Address) -> io::Result<Option<(PathBuf, u64)>> {
    let mut newest: Option<(PathBuf, u64)> = None;
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(version) = name.to_str().and_then(|n| parse_version(n, address)) else {
            continue;
        };
        if newest.as_ref().is_none_or(|(_, v)| version > *v) {
            newest = Some((entry.path(), version));
        }
    }
    Ok(newest)
}

/// Damages the newest file of `address` as described by `point`.
///
/// The tree must be closed first.
///
/// # Errors
///
/// Returns `NotFound` if the page has no file, `InvalidInput` for a stale
/// version of a page still at version 0, or an I/O error.
pub fn simulate(directory: &Path, address: Address, point: CrashPoint) -> io::Result<()> {
    let (path, version) = page_file(directory, address)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("page {address} has no file"))
    })?;

    match point {
        CrashPoint::TornAppend { bytes } => {
            let file = OpenOptions::new().write(true).open(&path)?;
            let len = file.metadata()?.len();
            file.set_len(len.saturating_sub(bytes))?;
        }
        CrashPoint::GarbageTail => {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(b"not a line\n")?;
        }
        CrashPoint::PendingRewrite => {
            let pending = directory.join(format!("{address}.{}.pending", version + 1));
            fs::write(pending, b"12 0 half")?;
        }
        CrashPoint::StaleVersion => {
            let older = version.checked_sub(1).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "page has no older version")
            })?;
            fs::copy(&path, directory.join(format!("{address}.{older}")))?;
        }
    }
    Ok(())
}

/// Journals `pages` and `retired` against the closed tree in `directory`
/// without applying them, as if the process died just after the commit
/// point.
///
/// # Errors
///
/// Returns the storage error if the store cannot be opened or the commit
/// cannot be prepared.
pub fn interrupt_commit(
    directory: &Path,
    options: &Options,
    pages: Vec<(Address, Page)>,
    retired: &[Address],
) -> StorageResult<()> {
    let store = PageStore::open(directory, options.store_config())?;
    let mut changes = Commit::new();
    for (address, page) in pages {
        changes.rewrite(address.as_u64(), vec![page.checkpoint().encode()]);
    }
    for address in retired {
        changes.remove(address.as_u64());
    }
    drop(store.prepare(changes)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{gather_strings, TestTree};
    use strata_core::page::{Branch, Child, Item, Leaf};
    use strata_storage::LineFault;

    fn leaf(records: &[&str], right: Option<Address>) -> Page {
        let identity = |record: &[u8]| record.to_vec();
        Page::Leaf(Leaf {
            items: records
                .iter()
                .map(|r| Item::new(r.as_bytes().to_vec(), &identity))
                .collect(),
            ghosts: 0,
            right,
        })
    }

    /// The pages a balance writes when it splits [a, b, c, d] at c.
    fn split_of_first_leaf() -> Vec<(Address, Page)> {
        vec![
            (Address(3), leaf(&["c", "d"], None)),
            (Address::LEFTMOST, leaf(&["a", "b"], Some(Address(3)))),
            (
                Address::ROOT,
                Page::Branch(Branch {
                    children: vec![
                        Child {
                            pivot: None,
                            address: Address::LEFTMOST,
                        },
                        Child {
                            pivot: Some(b"c".to_vec()),
                            address: Address(3),
                        },
                    ],
                }),
            ),
        ]
    }

    fn tree_with(records: &[&str]) -> TestTree {
        let tree = TestTree::new();
        for record in records {
            tree.insert(record.as_bytes()).unwrap();
        }
        tree
    }

    fn crash(tree: TestTree, address: Address, point: CrashPoint) -> TestTree {
        tree.with_closed(|path| simulate(path, address, point).unwrap())
    }

    #[test]
    fn page_file_finds_newest_version() {
        let tree = tree_with(&["a", "b", "c", "d"]);
        assert_eq!(page_file(tree.path(), Address::LEFTMOST).unwrap().unwrap().1, 0);
        tree.balance().unwrap();
        assert_eq!(page_file(tree.path(), Address::LEFTMOST).unwrap().unwrap().1, 1);
        assert!(page_file(tree.path(), Address(99)).unwrap().is_none());
    }

    #[test]
    fn torn_append_reports_truncated_line() {
        let tree = crash(
            tree_with(&["a", "b"]),
            Address::LEFTMOST,
            CrashPoint::TornAppend { bytes: 3 },
        );
        let err = tree.get(b"a").unwrap_err();
        let fault = err.storage_error().and_then(|e| e.line_fault());
        assert_eq!(fault, Some(LineFault::Truncated));
    }

    #[test]
    fn torn_page_does_not_poison_other_pages() {
        let tree = tree_with(&["a", "b", "c", "d", "e", "f"]);
        tree.balance().unwrap();
        let right = tree.vivify().unwrap().leaves()[1].address();
        tree.insert(b"g").unwrap();

        let tree = crash(tree, right, CrashPoint::TornAppend { bytes: 3 });
        assert_eq!(tree.get(b"a").unwrap(), Some(b"a".to_vec()));
        assert!(tree.get(b"g").is_err());
    }

    #[test]
    fn garbage_tail_is_a_corrupt_line() {
        let tree = crash(tree_with(&["a"]), Address::LEFTMOST, CrashPoint::GarbageTail);
        let err = tree.iterator(b"a").unwrap_err();
        assert!(err.storage_error().and_then(|e| e.line_fault()).is_some());
    }

    #[test]
    fn pending_rewrite_is_discarded() {
        let tree = crash(
            tree_with(&["a", "b"]),
            Address::LEFTMOST,
            CrashPoint::PendingRewrite,
        );
        assert!(!tree.path().join("1.1.pending").exists());
        assert_eq!(gather_strings(&tree), vec!["a", "b"]);
    }

    #[test]
    fn stale_version_is_discarded() {
        let tree = tree_with(&["a", "b", "c", "d"]);
        tree.balance().unwrap();
        tree.insert(b"e").unwrap();

        let tree = crash(tree, Address::LEFTMOST, CrashPoint::StaleVersion);
        assert!(!tree.path().join("1.0").exists());
        assert!(tree.path().join("1.1").exists());
        assert_eq!(gather_strings(&tree), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn journaled_split_is_finished_on_reopen() {
        let tree = tree_with(&["a", "b", "c", "d"]);
        let options = tree.options().clone();

        let tree = tree.with_closed(|path| {
            interrupt_commit(path, &options, split_of_first_leaf(), &[]).unwrap();
            assert!(path.join("commit").exists());
            assert!(path.join("3.0.pending").exists());
        });

        assert!(!tree.path().join("commit").exists());
        let leaves: Vec<usize> = tree
            .vivify()
            .unwrap()
            .leaves()
            .iter()
            .map(|leaf| leaf.address().as_u64() as usize)
            .collect();
        assert_eq!(leaves, vec![1, 3]);

        // a record routed to the new leaf is also reached by traversal
        tree.insert(b"e").unwrap();
        assert_eq!(tree.get(b"e").unwrap(), Some(b"e".to_vec()));
        assert_eq!(gather_strings(&tree), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn split_without_journal_leaves_nothing_behind() {
        let tree = tree_with(&["a", "b", "c", "d"]);
        let options = tree.options().clone();

        // the crash came before the journal reached its commit point
        let tree = tree.with_closed(|path| {
            interrupt_commit(path, &options, split_of_first_leaf(), &[]).unwrap();
            fs::rename(path.join("commit"), path.join("commit.pending")).unwrap();
        });

        assert!(!tree.path().join("3.0.pending").exists());
        assert!(!tree.path().join("commit.pending").exists());
        assert_eq!(tree.vivify().unwrap().leaves().len(), 1);
        tree.insert(b"e").unwrap();
        assert_eq!(gather_strings(&tree), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn journaled_merge_retires_the_absorbed_leaf() {
        let tree = tree_with(&["a", "b", "c", "d"]);
        tree.balance().unwrap();
        assert!(tree.remove(b"c").unwrap());
        assert!(tree.remove(b"d").unwrap());
        let right = tree.vivify().unwrap().leaves()[1].address();
        let options = tree.options().clone();

        let merged = vec![
            (Address::LEFTMOST, leaf(&["a", "b"], None)),
            (
                Address::ROOT,
                Page::Branch(Branch {
                    children: vec![Child {
                        pivot: None,
                        address: Address::LEFTMOST,
                    }],
                }),
            ),
        ];
        let tree = tree.with_closed(|path| {
            interrupt_commit(path, &options, merged, &[right]).unwrap();
        });

        assert!(page_file(tree.path(), right).unwrap().is_none());
        assert_eq!(tree.vivify().unwrap().leaves().len(), 1);
        assert_eq!(gather_strings(&tree), vec!["a", "b"]);

        // the retired address is never handed out again
        tree.insert(b"c").unwrap();
        tree.insert(b"d").unwrap();
        tree.balance().unwrap();
        let leaves = tree.vivify().unwrap();
        assert!(leaves.leaves().iter().all(|leaf| leaf.address() != right));
    }

    #[test]
    fn stale_version_needs_a_rewrite() {
        let tree = tree_with(&["a"]);
        let err = simulate(tree.path(), Address::LEFTMOST, CrashPoint::StaleVersion).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
