//! In-memory pages.
//!
//! A page is rebuilt from its log by [`crate::log::replay`] and kept in step
//! with the log afterwards by applying each entry right after it is appended.
//! Both paths go through [`Page::apply`].

use crate::error::{CoreError, CoreResult};
use crate::log::{Checkpoint, LogEntry};
use crate::types::{Address, PageKind};
use std::cmp::Ordering;

/// Key order used by page searches.
pub type Compare<'a> = &'a dyn Fn(&[u8], &[u8]) -> Ordering;

/// Key extraction used while applying entries.
pub type Extract<'a> = &'a dyn Fn(&[u8]) -> Vec<u8>;

/// Per-child heft of a branch, on top of its pivot bytes.
const CHILD_HEFT: usize = 8;

/// Result of a binary search within a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Search {
    /// The key is at this index.
    Found(usize),
    /// The key is absent and would be inserted at this index.
    Missing(usize),
}

impl Search {
    /// Returns the index, found or not.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Found(i) | Self::Missing(i) => i,
        }
    }

    /// Returns `true` for an exact match.
    #[must_use]
    pub const fn is_found(self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// Encodes a miss as the bitwise complement of the insertion point.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn to_signed(self) -> isize {
        match self {
            Self::Found(i) => i as isize,
            Self::Missing(i) => !(i as isize),
        }
    }
}

/// A record and its extracted key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// The key, as produced by the extractor.
    pub key: Vec<u8>,
    /// The record bytes.
    pub record: Vec<u8>,
}

impl Item {
    /// Wraps a record, extracting its key.
    #[must_use]
    pub fn new(record: Vec<u8>, extract: Extract<'_>) -> Self {
        Self {
            key: extract(&record),
            record,
        }
    }

    /// Accounted size of the item.
    #[must_use]
    pub fn heft(&self) -> usize {
        self.record.len()
    }
}

/// A leaf page.
///
/// The first `ghosts` items are logically deleted. They stay until the
/// balancer rewrites the page because the first item of a leaf other than
/// the left-most carries the key of the pivot that routes to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Leaf {
    /// Items in key order, ghosts first.
    pub items: Vec<Item>,
    /// Length of the leading run of deleted items.
    pub ghosts: usize,
    /// Right sibling, `None` at the right edge of the tree.
    pub right: Option<Address>,
}

impl Leaf {
    /// Returns the live items.
    #[must_use]
    pub fn live(&self) -> &[Item] {
        &self.items[self.ghosts..]
    }

    /// Number of live items.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.items.len() - self.ghosts
    }

    /// Heft of the live items.
    #[must_use]
    pub fn live_heft(&self) -> usize {
        self.live().iter().map(Item::heft).sum()
    }

    /// Key of the first item, ghost or live.
    #[must_use]
    pub fn first_key(&self) -> Option<&[u8]> {
        self.items.first().map(|item| item.key.as_slice())
    }

    /// Binary search for `key` among the live items.
    pub fn search(&self, key: &[u8], compare: Compare<'_>) -> Search {
        match self
            .live()
            .binary_search_by(|item| compare(&item.key, key))
        {
            Ok(i) => Search::Found(self.ghosts + i),
            Err(i) => Search::Missing(self.ghosts + i),
        }
    }
}

/// A branch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Child {
    /// Least key routed to this child; `None` for the first child.
    pub pivot: Option<Vec<u8>>,
    /// Address of the child page.
    pub address: Address,
}

/// A branch page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Branch {
    /// Children in key order.
    pub children: Vec<Child>,
}

impl Branch {
    /// Index of the child that routes `key`.
    ///
    /// With `strict`, a pivot equal to `key` routes left, which finds the
    /// page holding the keys strictly before `key`.
    pub fn route(&self, key: &[u8], compare: Compare<'_>, strict: bool) -> usize {
        self.children
            .get(1..)
            .unwrap_or_default()
            .partition_point(|child| {
                let pivot = child.pivot.as_deref().unwrap_or_default();
                match compare(pivot, key) {
                    Ordering::Less => true,
                    Ordering::Equal => !strict,
                    Ordering::Greater => false,
                }
            })
    }

    /// Index of the child with `address`.
    #[must_use]
    pub fn position(&self, address: Address) -> Option<usize> {
        self.children
            .iter()
            .position(|child| child.address == address)
    }
}

/// A materialized page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    /// A leaf page.
    Leaf(Leaf),
    /// A branch page.
    Branch(Branch),
}

impl Page {
    /// An empty page of the given kind.
    #[must_use]
    pub fn empty(kind: PageKind) -> Self {
        match kind {
            PageKind::Leaf => Self::Leaf(Leaf::default()),
            PageKind::Branch => Self::Branch(Branch::default()),
        }
    }

    /// Accounted size of the page.
    #[must_use]
    pub fn heft(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.items.iter().map(Item::heft).sum(),
            Self::Branch(branch) => branch
                .children
                .iter()
                .map(|child| child.pivot.as_ref().map_or(0, Vec::len) + CHILD_HEFT)
                .sum(),
        }
    }

    /// Returns the leaf, if this is one.
    #[must_use]
    pub fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Branch(_) => None,
        }
    }

    /// Returns the branch, if this is one.
    #[must_use]
    pub fn as_branch(&self) -> Option<&Branch> {
        match self {
            Self::Branch(branch) => Some(branch),
            Self::Leaf(_) => None,
        }
    }

    /// The checkpoint entry that reproduces this page.
    #[must_use]
    pub fn checkpoint(&self) -> LogEntry {
        match self {
            Self::Leaf(leaf) => LogEntry::Checkpoint(Checkpoint::Leaf {
                right: leaf.right,
                ghosts: leaf.ghosts,
                records: leaf.items.iter().map(|item| item.record.clone()).collect(),
            }),
            Self::Branch(branch) => LogEntry::Checkpoint(Checkpoint::Branch {
                children: branch.children.clone(),
            }),
        }
    }

    /// Validates `entry` against the current state of the page at `address`.
    ///
    /// # Errors
    ///
    /// Returns a replay error describing the first structural problem.
    pub fn check(&self, address: Address, entry: &LogEntry) -> CoreResult<()> {
        match (self, entry) {
            (Self::Leaf(_), LogEntry::Checkpoint(Checkpoint::Leaf { ghosts, records, .. })) => {
                if *ghosts > records.len() {
                    return Err(CoreError::replay(
                        address,
                        format!("{ghosts} ghosts in a checkpoint of {} records", records.len()),
                    ));
                }
                Ok(())
            }
            (Self::Branch(_), LogEntry::Checkpoint(Checkpoint::Branch { children })) => {
                check_children(address, children)
            }
            (Self::Leaf(leaf), LogEntry::Insert { index, .. }) => {
                if *index < leaf.ghosts || *index > leaf.items.len() {
                    return Err(CoreError::replay(
                        address,
                        format!(
                            "insert at {index} outside live range {}..={}",
                            leaf.ghosts,
                            leaf.items.len()
                        ),
                    ));
                }
                Ok(())
            }
            (Self::Leaf(leaf), LogEntry::Delete { index }) => {
                if *index < leaf.ghosts || *index >= leaf.items.len() {
                    return Err(CoreError::replay(
                        address,
                        format!(
                            "delete at {index} outside live range {}..{}",
                            leaf.ghosts,
                            leaf.items.len()
                        ),
                    ));
                }
                Ok(())
            }
            (Self::Leaf(_), LogEntry::Right(right)) => match right {
                Some(right) if right.is_branch() => Err(CoreError::replay(
                    address,
                    format!("right sibling {right} is not a leaf"),
                )),
                _ => Ok(()),
            },
            (Self::Leaf(_), _) => Err(CoreError::replay(address, "branch entry in a leaf page")),
            (Self::Branch(_), _) => Err(CoreError::replay(address, "leaf entry in a branch page")),
        }
    }

    /// Validates and applies `entry`.
    ///
    /// Deleting the first live item of any leaf but the left-most turns it
    /// into a ghost instead of removing it.
    ///
    /// # Errors
    ///
    /// Returns a replay error if the entry does not fit the page; the page is
    /// left unchanged.
    pub fn apply(&mut self, address: Address, entry: LogEntry, extract: Extract<'_>) -> CoreResult<()> {
        self.check(address, &entry)?;
        match (self, entry) {
            (Self::Leaf(leaf), LogEntry::Checkpoint(Checkpoint::Leaf { right, ghosts, records })) => {
                leaf.items = records
                    .into_iter()
                    .map(|record| Item::new(record, extract))
                    .collect();
                leaf.ghosts = ghosts;
                leaf.right = right;
            }
            (Self::Branch(branch), LogEntry::Checkpoint(Checkpoint::Branch { children })) => {
                branch.children = children;
            }
            (Self::Leaf(leaf), LogEntry::Insert { index, record }) => {
                leaf.items.insert(index, Item::new(record, extract));
            }
            (Self::Leaf(leaf), LogEntry::Delete { index }) => {
                if index == leaf.ghosts && address != Address::LEFTMOST {
                    leaf.ghosts += 1;
                } else {
                    leaf.items.remove(index);
                }
            }
            (Self::Leaf(leaf), LogEntry::Right(right)) => {
                leaf.right = right;
            }
            _ => return Err(CoreError::replay(address, "entry does not match page kind")),
        }
        Ok(())
    }
}

fn check_children(address: Address, children: &[Child]) -> CoreResult<()> {
    let Some(first) = children.first() else {
        return Err(CoreError::replay(address, "branch checkpoint without children"));
    };
    if first.pivot.is_some() {
        return Err(CoreError::replay(address, "first child carries a pivot"));
    }
    if children[1..].iter().any(|child| child.pivot.is_none()) {
        return Err(CoreError::replay(address, "child without a pivot"));
    }
    let kind = first.address.kind();
    if children.iter().any(|child| child.address.kind() != kind) {
        return Err(CoreError::replay(address, "branch mixes leaves and branches"));
    }
    Ok(())
}
