//! The tree handle.
//!
//! [`Strata`] ties a locked directory, the sheaf, and the page lock table
//! together. Cursors descend from the root holding shared locks hand over
//! hand and lock the leaf they stop on in their own mode. Structural changes
//! happen only in [`Strata::balance`], which excludes descents for its
//! duration.

use crate::balancer::{BalanceReport, Balancer};
use crate::config::Options;
use crate::cursor::{Cursor, Exclusive, Insert, Mode, Mutator, ReadCursor};
use crate::dir::TreeDir;
use crate::error::{CoreError, CoreResult};
use crate::lock::{LockMode, LockTable};
use crate::page::{Branch, Child, Leaf, Page, Search};
use crate::sheaf::{Batch, Sheaf};
use crate::types::Address;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use strata_storage::PageStore;
use tracing::{debug, info};

/// Where a descent stops.
#[derive(Debug, Clone, Copy)]
enum Route<'k> {
    /// The leaf that holds `key`.
    Key(&'k [u8]),
    /// The leaf that holds the keys strictly before `key`.
    Before(&'k [u8]),
    /// The left-most leaf.
    Leftmost,
    /// The right-most leaf.
    Rightmost,
}

/// A snapshot of the tree structure, for debugging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vivified {
    /// A branch with its pivots and children.
    Branch {
        /// Page address.
        address: Address,
        /// Children in order, each with its pivot.
        children: Vec<(Option<Vec<u8>>, Vivified)>,
    },
    /// A leaf with its records.
    Leaf {
        /// Page address.
        address: Address,
        /// Ghost count.
        ghosts: usize,
        /// Live records.
        records: Vec<Vec<u8>>,
        /// Right sibling.
        right: Option<Address>,
    },
}

impl Vivified {
    /// Address of the page.
    #[must_use]
    pub fn address(&self) -> Address {
        match self {
            Self::Branch { address, .. } | Self::Leaf { address, .. } => *address,
        }
    }

    /// Number of levels below and including this page.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            Self::Leaf { .. } => 1,
            Self::Branch { children, .. } => {
                1 + children.iter().map(|(_, c)| c.depth()).max().unwrap_or(0)
            }
        }
    }

    /// Leaves in key order.
    #[must_use]
    pub fn leaves(&self) -> Vec<&Vivified> {
        match self {
            Self::Leaf { .. } => vec![self],
            Self::Branch { children, .. } => {
                children.iter().flat_map(|(_, c)| c.leaves()).collect()
            }
        }
    }
}

/// An open tree.
pub struct Strata {
    dir: TreeDir,
    pub(crate) sheaf: Sheaf,
    pub(crate) locks: LockTable,
    pub(crate) structure: RwLock<()>,
    pub(crate) balancing: AtomicBool,
    generation: AtomicU64,
}

impl std::fmt::Debug for Strata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strata")
            .field("directory", &self.dir.path())
            .field("cached", &self.sheaf.cached())
            .finish_non_exhaustive()
    }
}

/// Clears the balancing flag when the balance ends.
struct BalancingFlag<'a>(&'a AtomicBool);

impl Drop for BalancingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Strata {
    /// Creates a new tree in `directory`.
    ///
    /// The directory is created if missing. It must not already hold pages.
    /// The new tree is a root branch over one empty leaf.
    ///
    /// # Errors
    ///
    /// Returns `NotADirectory` or `DirectoryNotEmpty` for an unusable
    /// directory, `DatabaseLocked` if another handle owns it, or an I/O error.
    pub fn create(directory: impl AsRef<Path>, options: Options) -> CoreResult<Self> {
        let directory = directory.as_ref();
        let dir = TreeDir::lock(directory, true)?;
        let store = PageStore::create(directory, options.store_config())?;
        let sheaf = Sheaf::new(store, options);

        let mut batch = Batch::new();
        batch.checkpoint(Address::LEFTMOST, Page::Leaf(Leaf::default()));
        batch.checkpoint(
            Address::ROOT,
            Page::Branch(Branch {
                children: vec![Child {
                    pivot: None,
                    address: Address::LEFTMOST,
                }],
            }),
        );
        sheaf.commit(batch)?;

        info!(path = %directory.display(), "created tree");
        Ok(Self::assemble(dir, sheaf))
    }

    /// Opens an existing tree.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory is missing, `NotADirectory` if
    /// it is a file, `DatabaseLocked` if another handle owns it, or
    /// `InvalidFormat` if the root or the left-most leaf is missing.
    pub fn open(directory: impl AsRef<Path>, options: Options) -> CoreResult<Self> {
        let directory = directory.as_ref();
        let dir = TreeDir::lock(directory, false)?;
        let store = PageStore::open(directory, options.store_config())?;

        for address in [Address::ROOT, Address::LEFTMOST] {
            if store.version(address.as_u64()).is_none() {
                return Err(CoreError::invalid_format(format!(
                    "tree in {} has no page {address}",
                    directory.display()
                )));
            }
        }

        let sheaf = Sheaf::new(store, options);
        info!(path = %directory.display(), pages = sheaf.store().addresses().len(), "opened tree");
        Ok(Self::assemble(dir, sheaf))
    }

    fn assemble(dir: TreeDir, sheaf: Sheaf) -> Self {
        Self {
            dir,
            sheaf,
            locks: LockTable::new(),
            structure: RwLock::new(()),
            balancing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Closes the tree, releasing the directory lock.
    ///
    /// Every change is already on disk; closing only drops the cache.
    ///
    /// # Errors
    ///
    /// Currently infallible.
    pub fn close(self) -> CoreResult<()> {
        info!(path = %self.dir.path().display(), "closed tree");
        Ok(())
    }

    /// The tree options.
    #[must_use]
    pub fn options(&self) -> &Options {
        self.sheaf.options()
    }

    /// The tree directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        self.dir.path()
    }

    /// A read cursor on the leaf that holds `key`.
    ///
    /// # Errors
    ///
    /// Returns a lock error if a page on the path cannot be loaded.
    pub fn iterator(&self, key: &[u8]) -> CoreResult<ReadCursor<'_>> {
        self.descend(Route::Key(key))
    }

    /// A mutator on the leaf that holds `key`.
    ///
    /// # Errors
    ///
    /// Returns a lock error if a page on the path cannot be loaded.
    pub fn mutator(&self, key: &[u8]) -> CoreResult<Mutator<'_>> {
        self.descend(Route::Key(key))
    }

    /// A read cursor on the left-most leaf.
    ///
    /// # Errors
    ///
    /// Returns a lock error if a page on the path cannot be loaded.
    pub fn leftmost(&self) -> CoreResult<ReadCursor<'_>> {
        self.descend(Route::Leftmost)
    }

    /// A read cursor on the right-most leaf.
    ///
    /// # Errors
    ///
    /// Returns a lock error if a page on the path cannot be loaded.
    pub fn rightmost(&self) -> CoreResult<ReadCursor<'_>> {
        self.descend(Route::Rightmost)
    }

    /// A read cursor on the leaf that holds the keys strictly before `key`.
    ///
    /// # Errors
    ///
    /// Returns a lock error if a page on the path cannot be loaded.
    pub fn left_of(&self, key: &[u8]) -> CoreResult<ReadCursor<'_>> {
        self.descend(Route::Before(key))
    }

    fn descend<M: Mode>(&self, route: Route<'_>) -> CoreResult<Cursor<'_, M>> {
        let _structure = self.structure.read();
        let options = self.options();
        let compare = |a: &[u8], b: &[u8]| options.compare(a, b);

        let mut address = Address::ROOT;
        let mut guard = self.locks.acquire(address, LockMode::Shared);
        loop {
            let page = self
                .sheaf
                .load(address)
                .map_err(|e| CoreError::lock(address, e))?;

            let child = {
                let content = page.read();
                match &*content {
                    Page::Leaf(leaf) => {
                        let search = match route {
                            Route::Key(key) | Route::Before(key) => leaf.search(key, &compare),
                            Route::Leftmost => Search::Missing(leaf.ghosts),
                            Route::Rightmost => Search::Missing(leaf.items.len()),
                        };
                        drop(content);
                        return Ok(Cursor::new(self, guard, page, search));
                    }
                    Page::Branch(branch) => {
                        if branch.children.is_empty() {
                            return Err(CoreError::invalid_format(format!(
                                "branch {address} has no children"
                            )));
                        }
                        let index = match route {
                            Route::Key(key) => branch.route(key, &compare, false),
                            Route::Before(key) => branch.route(key, &compare, true),
                            Route::Leftmost => 0,
                            Route::Rightmost => branch.children.len() - 1,
                        };
                        branch.children[index].address
                    }
                }
            };

            let mode = if child.is_leaf() {
                M::LOCK
            } else {
                LockMode::Shared
            };
            guard = self.locks.acquire(child, mode);
            address = child;
        }
    }

    /// Returns the record with `key`.
    ///
    /// # Errors
    ///
    /// Returns a lock error if a page on the path cannot be loaded.
    pub fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        let cursor: ReadCursor<'_> = self.iterator(key)?;
        match cursor.index_of(key)? {
            Search::Found(index) => cursor.get(index),
            Search::Missing(_) => Ok(None),
        }
    }

    /// Inserts `record`, replacing any record with the same key.
    ///
    /// Returns `true` if a record was replaced. Refusals from the boundary
    /// protocol are settled by descending again: to the leaf before the key
    /// for a left refusal, by the key itself for a right one.
    ///
    /// # Errors
    ///
    /// Returns a lock or storage error, or `InvalidFormat` if the tree routes
    /// the key in a cycle.
    pub fn insert(&self, record: &[u8]) -> CoreResult<bool> {
        let key = self.options().extract(record);
        let mut generation = self.generation.load(Ordering::Acquire);
        let cursor: Mutator<'_> = self.mutator(&key)?;
        self.settle(cursor, &key, record, &mut generation)
    }

    fn settle<'a>(
        &'a self,
        mut cursor: Mutator<'a>,
        key: &[u8],
        record: &[u8],
        generation: &mut u64,
    ) -> CoreResult<bool> {
        let mut visited = vec![cursor.address()];
        let mut replaced = false;

        loop {
            let index = match cursor.index_of(key)? {
                Search::Found(index) => {
                    cursor.remove(index)?;
                    replaced = true;
                    continue;
                }
                Search::Missing(index) => index,
            };

            let route = match cursor.insert(record, index)? {
                Insert::Inserted => return Ok(replaced),
                Insert::BelongsLeft => Route::Before(key),
                Insert::BelongsRight => Route::Key(key),
            };
            drop(cursor);
            let next = self.descend::<Exclusive>(route)?;

            // a balance in between may legitimately lead back to a leaf
            let now = self.generation.load(Ordering::Acquire);
            if now != *generation {
                *generation = now;
                visited.clear();
            }
            if visited.contains(&next.address()) {
                return Err(CoreError::invalid_format(format!(
                    "key routes back to leaf {}",
                    next.address()
                )));
            }
            debug!(key = ?key, to = %next.address(), "insert moved to a neighbouring leaf");
            visited.push(next.address());
            cursor = next;
        }
    }

    /// Removes the record with `key`. Returns `true` if one was removed.
    ///
    /// # Errors
    ///
    /// Returns a lock or storage error.
    pub fn remove(&self, key: &[u8]) -> CoreResult<bool> {
        let mut cursor: Mutator<'_> = self.mutator(key)?;
        match cursor.index_of(key)? {
            Search::Found(index) => {
                cursor.remove(index)?;
                Ok(true)
            }
            Search::Missing(_) => Ok(false),
        }
    }

    /// Every live record in key order.
    ///
    /// # Errors
    ///
    /// Returns a lock error if a leaf cannot be loaded.
    pub fn records(&self) -> CoreResult<Vec<Vec<u8>>> {
        let mut cursor = self.leftmost()?;
        let mut records = cursor.records()?;
        while cursor.next()? {
            records.extend(cursor.records()?);
        }
        Ok(records)
    }

    /// Splits, merges, and tidies every leaf changed since the last balance.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyBalancing` if another balance is running, or the
    /// first storage error hit; the untouched work is kept for a retry.
    pub fn balance(&self) -> CoreResult<BalanceReport> {
        if self
            .balancing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoreError::AlreadyBalancing);
        }
        let _flag = BalancingFlag(&self.balancing);
        let _structure = self.structure.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        Balancer::new(self).run()
    }

    /// Evicts pages until the cache heft is at most `max_heft`.
    ///
    /// Pages locked by a cursor are never evicted. Returns the number of
    /// pages evicted.
    pub fn purge(&self, max_heft: usize) -> usize {
        self.locks
            .with_held(|held| self.sheaf.purge(max_heft, held))
    }

    /// Aggregate heft of the cached pages.
    #[must_use]
    pub fn heft(&self) -> usize {
        self.sheaf.heft()
    }

    /// Number of cached pages.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.sheaf.cached()
    }

    /// Snapshot of the whole tree.
    ///
    /// # Errors
    ///
    /// Returns a lock error if a page cannot be loaded.
    pub fn vivify(&self) -> CoreResult<Vivified> {
        let _structure = self.structure.read();
        self.vivify_page(Address::ROOT)
    }

    fn vivify_page(&self, address: Address) -> CoreResult<Vivified> {
        let guard = self.locks.acquire(address, LockMode::Shared);
        let shared = self
            .sheaf
            .load(address)
            .map_err(|e| CoreError::lock(address, e))?;
        let page = shared.read().clone();
        drop(guard);

        match page {
            Page::Leaf(leaf) => Ok(Vivified::Leaf {
                address,
                ghosts: leaf.ghosts,
                records: leaf.live().iter().map(|item| item.record.clone()).collect(),
                right: leaf.right,
            }),
            Page::Branch(branch) => {
                let children = branch
                    .children
                    .into_iter()
                    .map(|child| Ok((child.pivot, self.vivify_page(child.address)?)))
                    .collect::<CoreResult<_>>()?;
                Ok(Vivified::Branch { address, children })
            }
        }
    }
}
