//! Cursors over a single locked leaf.
//!
//! A [`ReadCursor`] holds its leaf shared and can walk right; a [`Mutator`]
//! holds it exclusively and can insert and remove. Both release the page
//! lock on [`Cursor::unlock`] or when dropped, and every page operation after
//! `unlock()` fails with [`CoreError::UseAfterUnlock`].
//!
//! # Boundary protocol
//!
//! A search is only authoritative within its page. [`Cursor::index_of`]
//! gives a tentative index; [`Mutator::insert`] confirms it against the page
//! boundaries and refuses with [`Insert::BelongsLeft`] or
//! [`Insert::BelongsRight`] when the record belongs on a neighbour.

use crate::error::{CoreError, CoreResult};
use crate::lock::{LockMode, PageGuard};
use crate::log::LogEntry;
use crate::page::{Leaf, Search};
use crate::sheaf::SharedPage;
use crate::tree::Strata;
use crate::types::Address;
use std::cmp::Ordering;
use std::marker::PhantomData;

mod sealed {
    pub trait Sealed {}
}

/// Lock mode of a cursor.
pub trait Mode: sealed::Sealed {
    /// The page lock mode the cursor holds.
    const LOCK: LockMode;
}

/// Marker for read-only cursors.
#[derive(Debug)]
pub enum Shared {}

/// Marker for mutating cursors.
#[derive(Debug)]
pub enum Exclusive {}

impl sealed::Sealed for Shared {}
impl sealed::Sealed for Exclusive {}

impl Mode for Shared {
    const LOCK: LockMode = LockMode::Shared;
}

impl Mode for Exclusive {
    const LOCK: LockMode = LockMode::Exclusive;
}

/// A read-only cursor.
pub type ReadCursor<'a> = Cursor<'a, Shared>;

/// A mutating cursor.
pub type Mutator<'a> = Cursor<'a, Exclusive>;

/// Outcome of [`Mutator::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Insert {
    /// The record was written.
    Inserted,
    /// The record sorts before this page; nothing was written.
    BelongsLeft,
    /// The record sorts at or after the first key of the right sibling;
    /// nothing was written.
    BelongsRight,
}

/// A cursor bound to one locked leaf.
pub struct Cursor<'a, M: Mode> {
    tree: &'a Strata,
    guard: Option<PageGuard<'a>>,
    page: SharedPage,
    address: Address,
    index: usize,
    found: bool,
    _mode: PhantomData<M>,
}

impl<M: Mode> std::fmt::Debug for Cursor<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("address", &self.address)
            .field("mode", &M::LOCK)
            .field("index", &self.index)
            .field("found", &self.found)
            .field("locked", &self.guard.is_some())
            .finish()
    }
}

impl<'a, M: Mode> Cursor<'a, M> {
    pub(crate) fn new(
        tree: &'a Strata,
        guard: PageGuard<'a>,
        page: SharedPage,
        search: Search,
    ) -> Self {
        Self {
            tree,
            address: guard.address(),
            guard: Some(guard),
            page,
            index: search.index(),
            found: search.is_found(),
            _mode: PhantomData,
        }
    }

    fn leaf<R>(&self, f: impl FnOnce(&Leaf) -> R) -> CoreResult<R> {
        if self.guard.is_none() {
            return Err(CoreError::UseAfterUnlock);
        }
        let page = self.page.read();
        let leaf = page.as_leaf().ok_or_else(|| {
            CoreError::invalid_format(format!("cursor page {} is not a leaf", self.address))
        })?;
        Ok(f(leaf))
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.tree.options().compare(a, b)
    }

    /// Address of the bound leaf.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Index found by the search that created the cursor.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether that search was an exact match.
    #[must_use]
    pub fn found(&self) -> bool {
        self.found
    }

    /// Whether the page lock is still held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.guard.is_some()
    }

    /// Searches the live records of the page for `key`.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked.
    pub fn index_of(&self, key: &[u8]) -> CoreResult<Search> {
        let compare = |a: &[u8], b: &[u8]| self.compare(a, b);
        self.leaf(|leaf| leaf.search(key, &compare))
    }

    /// Returns the live record at `index`.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked.
    pub fn get(&self, index: usize) -> CoreResult<Option<Vec<u8>>> {
        self.leaf(|leaf| {
            (index >= leaf.ghosts)
                .then(|| leaf.items.get(index))
                .flatten()
                .map(|item| item.record.clone())
        })
    }

    /// Returns the key of the live record at `index`.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked.
    pub fn key(&self, index: usize) -> CoreResult<Option<Vec<u8>>> {
        self.leaf(|leaf| {
            (index >= leaf.ghosts)
                .then(|| leaf.items.get(index))
                .flatten()
                .map(|item| item.key.clone())
        })
    }

    /// Returns the live records of the page in order.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked.
    pub fn records(&self) -> CoreResult<Vec<Vec<u8>>> {
        self.leaf(|leaf| leaf.live().iter().map(|item| item.record.clone()).collect())
    }

    /// Number of items in the page, ghosts included.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked.
    pub fn len(&self) -> CoreResult<usize> {
        self.leaf(|leaf| leaf.items.len())
    }

    /// Returns `true` if the page holds no live records.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked.
    pub fn is_empty(&self) -> CoreResult<bool> {
        self.leaf(|leaf| leaf.live_len() == 0)
    }

    /// Index of the first live record.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked.
    pub fn offset(&self) -> CoreResult<usize> {
        self.ghosts()
    }

    /// Number of ghosts at the start of the page.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked.
    pub fn ghosts(&self) -> CoreResult<usize> {
        self.leaf(|leaf| leaf.ghosts)
    }

    /// Address of the right sibling.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked.
    pub fn right(&self) -> CoreResult<Option<Address>> {
        self.leaf(|leaf| leaf.right)
    }

    /// Releases the page lock. The cursor cannot be used afterwards.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` if the cursor was already unlocked.
    pub fn unlock(&mut self) -> CoreResult<()> {
        self.guard.take().map(drop).ok_or(CoreError::UseAfterUnlock)
    }
}

impl ReadCursor<'_> {
    /// Moves to the right sibling.
    ///
    /// The sibling is locked before the current page is released, so no
    /// writer can slip in between. Returns `false` at the right edge, leaving
    /// the cursor where it was.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked, or a lock error
    /// if the sibling cannot be loaded; the cursor then stays on its page.
    pub fn next(&mut self) -> CoreResult<bool> {
        let Some(right) = self.right()? else {
            return Ok(false);
        };

        let guard = self.tree.locks.acquire(right, LockMode::Shared);
        let page = self
            .tree
            .sheaf
            .load(right)
            .map_err(|e| CoreError::lock(right, e))?;
        let offset = page.read().as_leaf().map_or(0, |leaf| leaf.ghosts);

        self.guard = Some(guard);
        self.page = page;
        self.address = right;
        self.index = offset;
        self.found = false;
        Ok(true)
    }
}

impl Mutator<'_> {
    /// Inserts `record` at `index` if it belongs on this page.
    ///
    /// `index` is usually the insertion point from [`Cursor::index_of`]. An
    /// insertion before the first item of a page other than the left-most
    /// belongs left. An insertion after the last item belongs right when the
    /// key does not sort before the first key of the right sibling.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked,
    /// `InvalidOperation` if `index` is outside the live range, or the
    /// storage error if the append fails.
    pub fn insert(&mut self, record: &[u8], index: usize) -> CoreResult<Insert> {
        let key = self.tree.options().extract(record);
        let (len, ghosts, anchor, right) = self.leaf(|leaf| {
            (
                leaf.items.len(),
                leaf.ghosts,
                leaf.first_key().map(<[u8]>::to_vec),
                leaf.right,
            )
        })?;

        if index < ghosts || index > len {
            return Err(CoreError::invalid_operation(format!(
                "insert at {index} outside live range {ghosts}..={len}"
            )));
        }

        if self.address != Address::LEFTMOST {
            if index == 0 {
                return Ok(Insert::BelongsLeft);
            }
            if index == ghosts
                && anchor.is_some_and(|anchor| self.compare(&key, &anchor) == Ordering::Less)
            {
                return Ok(Insert::BelongsLeft);
            }
        }

        if index == len {
            if let Some(right) = right {
                if let Some(first) = self.peek(right)? {
                    if self.compare(&key, &first) != Ordering::Less {
                        return Ok(Insert::BelongsRight);
                    }
                }
            }
        }

        let entry = LogEntry::Insert {
            index,
            record: record.to_vec(),
        };
        self.tree
            .sheaf
            .append(self.address, &mut self.page.write(), entry)?;
        Ok(Insert::Inserted)
    }

    /// First key of a sibling, read under a shared lock.
    fn peek(&self, address: Address) -> CoreResult<Option<Vec<u8>>> {
        let _guard = self.tree.locks.acquire(address, LockMode::Shared);
        let page = self
            .tree
            .sheaf
            .load(address)
            .map_err(|e| CoreError::lock(address, e))?;
        let page = page.read();
        Ok(page
            .as_leaf()
            .and_then(Leaf::first_key)
            .map(<[u8]>::to_vec))
    }

    /// Removes the live record at `index`.
    ///
    /// Removing the first live record of a page other than the left-most
    /// leaves it behind as a ghost until the next balance.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterUnlock` once the cursor is unlocked,
    /// `InvalidOperation` if `index` is not a live record, or the storage
    /// error if the append fails.
    pub fn remove(&mut self, index: usize) -> CoreResult<()> {
        let (len, ghosts) = self.leaf(|leaf| (leaf.items.len(), leaf.ghosts))?;
        if index < ghosts || index >= len {
            return Err(CoreError::invalid_operation(format!(
                "remove at {index} outside live range {ghosts}..{len}"
            )));
        }
        self.tree
            .sheaf
            .append(self.address, &mut self.page.write(), LogEntry::Delete { index })
    }
}
