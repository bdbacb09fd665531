//! The sheaf: materialized pages, their heft, and address allocation.
//!
//! Pages are loaded from the page store on first use and kept until
//! [`Sheaf::purge`] evicts them. Every change to a page is written to its
//! log before it is applied in memory, so eviction never loses anything.
//! Changes that span pages are gathered in a [`Batch`] and reach disk in
//! one commit.

use crate::config::Options;
use crate::error::CoreResult;
use crate::log::{self, LogEntry};
use crate::page::Page;
use crate::types::{Address, PageKind};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_storage::{Commit, PageStore};
use tracing::debug;

/// A page shared between the cache and the cursors holding it.
pub type SharedPage = Arc<RwLock<Page>>;

#[derive(Debug)]
struct Slot {
    page: SharedPage,
    last_used: u64,
}

/// Page changes that reach disk together.
///
/// A page named twice keeps only its last change.
#[derive(Debug, Default)]
pub struct Batch {
    pages: Vec<(Address, Page)>,
    retired: Vec<Address>,
}

impl Batch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the page at `address` with `page`.
    pub fn checkpoint(&mut self, address: Address, page: Page) {
        self.forget(address);
        self.pages.push((address, page));
    }

    /// Deletes the page at `address`.
    pub fn retire(&mut self, address: Address) {
        self.forget(address);
        self.retired.push(address);
    }

    fn forget(&mut self, address: Address) {
        self.pages.retain(|(a, _)| *a != address);
        self.retired.retain(|&a| a != address);
    }

    /// Returns `true` if the batch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.retired.is_empty()
    }
}

#[derive(Debug)]
struct Allocator {
    next_leaf: u64,
    next_branch: u64,
}

/// Page cache over a [`PageStore`].
#[derive(Debug)]
pub struct Sheaf {
    store: PageStore,
    options: Options,
    cache: Mutex<HashMap<Address, Slot>>,
    clock: AtomicU64,
    allocator: Mutex<Allocator>,
    dirty: Mutex<BTreeSet<Address>>,
}

impl Sheaf {
    /// Wraps a store, resuming allocation past every address it has ever
    /// held, retired pages included.
    ///
    /// The root branch and the left-most leaf are never handed out.
    #[must_use]
    pub fn new(store: PageStore, options: Options) -> Self {
        let high_water = store.high_water();
        // first address of each parity above the mark
        let above = high_water + 1;
        let (odd, even) = if above % 2 == 1 {
            (above, above + 1)
        } else {
            (above + 1, above)
        };
        let allocator = Allocator {
            next_leaf: odd.max(Address::LEFTMOST.as_u64() + 2),
            next_branch: even.max(Address::ROOT.as_u64() + 2),
        };
        Self {
            store,
            options,
            cache: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            allocator: Mutex::new(allocator),
            dirty: Mutex::new(BTreeSet::new()),
        }
    }

    /// The underlying page store.
    #[must_use]
    pub fn store(&self) -> &PageStore {
        &self.store
    }

    /// The tree options.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the page at `address`, reading and replaying it if needed.
    ///
    /// When two threads load the same page at once, the first copy to reach
    /// the cache wins and both receive it.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the page cannot be read, or a replay error
    /// if its log is invalid.
    pub fn load(&self, address: Address) -> CoreResult<SharedPage> {
        if let Some(slot) = self.cache.lock().get_mut(&address) {
            slot.last_used = self.tick();
            return Ok(Arc::clone(&slot.page));
        }

        let log = self.store.read_page(address.as_u64())?;
        let page = log::replay(address, &log.lines, &*self.options.extractor)?;
        debug!(%address, version = log.version, heft = page.heft(), "loaded page");

        let tick = self.tick();
        let mut cache = self.cache.lock();
        let slot = cache.entry(address).or_insert_with(|| Slot {
            page: Arc::new(RwLock::new(page)),
            last_used: tick,
        });
        slot.last_used = tick;
        Ok(Arc::clone(&slot.page))
    }

    /// Writes `entry` to the log of `address` and applies it to `page`.
    ///
    /// The caller holds the page exclusively. The entry is validated first,
    /// so a rejected entry leaves both the file and the page untouched.
    ///
    /// # Errors
    ///
    /// Returns a replay error if the entry does not fit the page, or a
    /// storage error if the append fails.
    pub fn append(&self, address: Address, page: &mut Page, entry: LogEntry) -> CoreResult<()> {
        page.check(address, &entry)?;
        self.store
            .append_committed(address.as_u64(), &entry.encode())?;
        page.apply(address, entry, &*self.options.extractor)?;
        self.mark_dirty(address);
        Ok(())
    }

    /// Replaces the page at `address` with a fresh checkpointed version.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the rewrite fails; the cached copy is only
    /// replaced once the new version is durable.
    pub fn checkpoint(&self, address: Address, page: Page) -> CoreResult<()> {
        self.store
            .rewrite_page(address.as_u64(), &[page.checkpoint().encode()])?;
        let tick = self.tick();
        Self::install(&mut self.cache.lock(), address, page, tick);
        Ok(())
    }

    fn install(cache: &mut HashMap<Address, Slot>, address: Address, page: Page, tick: u64) {
        match cache.get_mut(&address) {
            Some(slot) => {
                *slot.page.write() = page;
                slot.last_used = tick;
            }
            None => {
                cache.insert(
                    address,
                    Slot {
                        page: Arc::new(RwLock::new(page)),
                        last_used: tick,
                    },
                );
            }
        }
    }

    /// Writes every page of `batch` as a fresh checkpointed version and
    /// deletes its retired pages, all in one commit.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the commit fails. The cache is only
    /// changed once the commit has been applied.
    pub fn commit(&self, batch: Batch) -> CoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut changes = Commit::new();
        for (address, page) in &batch.pages {
            changes.rewrite(address.as_u64(), vec![page.checkpoint().encode()]);
        }
        for address in &batch.retired {
            changes.remove(address.as_u64());
        }
        self.store.commit(changes)?;

        let (written, retired) = (batch.pages.len(), batch.retired.len());
        let tick = self.tick();
        {
            let mut cache = self.cache.lock();
            for (address, page) in batch.pages {
                Self::install(&mut cache, address, page, tick);
            }
            for address in &batch.retired {
                cache.remove(address);
            }
        }
        let mut dirty = self.dirty.lock();
        for address in &batch.retired {
            dirty.remove(address);
        }
        debug!(written, retired, "committed batch");
        Ok(())
    }

    /// Returns a fresh address of the given kind.
    pub fn allocate(&self, kind: PageKind) -> Address {
        let mut allocator = self.allocator.lock();
        let next = match kind {
            PageKind::Leaf => &mut allocator.next_leaf,
            PageKind::Branch => &mut allocator.next_branch,
        };
        let address = Address(*next);
        *next += 2;
        address
    }

    /// Flags a leaf for the next balance.
    pub fn mark_dirty(&self, address: Address) {
        if address.is_leaf() {
            self.dirty.lock().insert(address);
        }
    }

    /// Takes the set of pages flagged since the last call.
    pub fn take_dirty(&self) -> BTreeSet<Address> {
        std::mem::take(&mut *self.dirty.lock())
    }

    /// Returns `true` if any page is flagged.
    #[must_use]
    pub fn has_dirty(&self) -> bool {
        !self.dirty.lock().is_empty()
    }

    /// Aggregate heft of the cached pages.
    #[must_use]
    pub fn heft(&self) -> usize {
        self.cache
            .lock()
            .values()
            .map(|slot| slot.page.read().heft())
            .sum()
    }

    /// Number of cached pages.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    /// Returns `true` if `address` is cached.
    #[must_use]
    pub fn is_cached(&self, address: Address) -> bool {
        self.cache.lock().contains_key(&address)
    }

    /// Evicts least recently used pages not held by anyone until the
    /// aggregate heft is at most `max_heft`. Returns the number evicted.
    pub fn purge(&self, max_heft: usize, held: &dyn Fn(Address) -> bool) -> usize {
        let mut cache = self.cache.lock();
        let mut total: usize = cache.values().map(|slot| slot.page.read().heft()).sum();
        if total <= max_heft {
            return 0;
        }

        let mut candidates: Vec<(u64, Address)> = cache
            .iter()
            .filter(|(address, _)| !held(**address))
            .map(|(address, slot)| (slot.last_used, *address))
            .collect();
        candidates.sort_unstable();

        let mut evicted = 0;
        for (_, address) in candidates {
            if total <= max_heft {
                break;
            }
            if let Some(slot) = cache.remove(&address) {
                total -= slot.page.read().heft();
                evicted += 1;
                debug!(%address, "evicted page");
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Checkpoint;
    use crate::page::{Branch, Child, Leaf};
    use strata_storage::StoreConfig;
    use tempfile::tempdir;

    fn leaf_checkpoint(records: &[&str]) -> Vec<u8> {
        LogEntry::Checkpoint(Checkpoint::Leaf {
            right: None,
            ghosts: 0,
            records: records.iter().map(|r| r.as_bytes().to_vec()).collect(),
        })
        .encode()
    }

    fn sheaf_with(dir: &std::path::Path, pages: &[(u64, Vec<u8>)]) -> Sheaf {
        let store = PageStore::create(dir, StoreConfig::default()).unwrap();
        for (address, payload) in pages {
            store.rewrite_page(*address, &[payload.clone()]).unwrap();
        }
        Sheaf::new(store, Options::default())
    }

    #[test]
    fn load_is_idempotent() {
        let dir = tempdir().unwrap();
        let sheaf = sheaf_with(dir.path(), &[(1, leaf_checkpoint(&["a", "b"]))]);

        let first = sheaf.load(Address(1)).unwrap();
        let second = sheaf.load(Address(1)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sheaf.cached(), 1);
        assert_eq!(first.read().as_leaf().unwrap().live_len(), 2);
    }

    #[test]
    fn load_missing_page_fails() {
        let dir = tempdir().unwrap();
        let sheaf = sheaf_with(dir.path(), &[]);
        assert!(sheaf.load(Address(9)).is_err());
    }

    #[test]
    fn allocation_resumes_past_existing() {
        let dir = tempdir().unwrap();
        let sheaf = sheaf_with(
            dir.path(),
            &[
                (1, leaf_checkpoint(&[])),
                (7, leaf_checkpoint(&[])),
                (
                    4,
                    LogEntry::Checkpoint(Checkpoint::Branch {
                        children: vec![Child {
                            pivot: None,
                            address: Address(1),
                        }],
                    })
                    .encode(),
                ),
            ],
        );

        assert_eq!(sheaf.allocate(PageKind::Leaf), Address(9));
        assert_eq!(sheaf.allocate(PageKind::Leaf), Address(11));
        assert_eq!(sheaf.allocate(PageKind::Branch), Address(8));
    }

    #[test]
    fn append_writes_through() {
        let dir = tempdir().unwrap();
        let sheaf = sheaf_with(dir.path(), &[(1, leaf_checkpoint(&["a"]))]);

        let page = sheaf.load(Address(1)).unwrap();
        sheaf
            .append(
                Address(1),
                &mut page.write(),
                LogEntry::Insert {
                    index: 1,
                    record: b"b".to_vec(),
                },
            )
            .unwrap();
        assert!(sheaf.has_dirty());
        assert_eq!(sheaf.take_dirty().into_iter().collect::<Vec<_>>(), vec![Address(1)]);

        let log = sheaf.store().read_page(1).unwrap();
        let replayed = log::replay(Address(1), &log.lines, &|r: &[u8]| r.to_vec()).unwrap();
        assert_eq!(replayed, *page.read());
    }

    #[test]
    fn rejected_append_leaves_file_alone() {
        let dir = tempdir().unwrap();
        let sheaf = sheaf_with(dir.path(), &[(1, leaf_checkpoint(&["a"]))]);
        let page = sheaf.load(Address(1)).unwrap();
        let size_before = std::fs::metadata(sheaf.store().page_path(1).unwrap())
            .unwrap()
            .len();

        let result = sheaf.append(Address(1), &mut page.write(), LogEntry::Delete { index: 5 });
        assert!(result.is_err());
        let size_after = std::fs::metadata(sheaf.store().page_path(1).unwrap())
            .unwrap()
            .len();
        assert_eq!(size_before, size_after);
        assert!(!sheaf.has_dirty());
    }

    #[test]
    fn checkpoint_replaces_cached_copy() {
        let dir = tempdir().unwrap();
        let sheaf = sheaf_with(dir.path(), &[(3, leaf_checkpoint(&["x"]))]);
        let page = sheaf.load(Address(3)).unwrap();

        let replacement = Leaf {
            right: Some(Address(5)),
            ..Leaf::default()
        };
        sheaf
            .checkpoint(Address(3), Page::Leaf(replacement.clone()))
            .unwrap();

        assert_eq!(*page.read(), Page::Leaf(replacement));
        assert_eq!(sheaf.store().version(3), Some(1));
    }

    #[test]
    fn checkpoint_caches_new_pages() {
        let dir = tempdir().unwrap();
        let sheaf = sheaf_with(dir.path(), &[]);
        let address = sheaf.allocate(PageKind::Branch);
        assert_eq!(address, Address(2));

        let branch = Page::Branch(Branch {
            children: vec![Child {
                pivot: None,
                address: Address(1),
            }],
        });
        sheaf.checkpoint(address, branch).unwrap();
        assert!(sheaf.is_cached(address));
        assert_eq!(sheaf.heft(), 8);
    }

    #[test]
    fn purge_evicts_least_recent_unheld() {
        let dir = tempdir().unwrap();
        let sheaf = sheaf_with(
            dir.path(),
            &[
                (1, leaf_checkpoint(&["aaaa"])),
                (3, leaf_checkpoint(&["bbbb"])),
                (5, leaf_checkpoint(&["cccc"])),
            ],
        );
        for address in [1, 3, 5] {
            sheaf.load(Address(address)).unwrap();
        }
        assert_eq!(sheaf.heft(), 12);

        // page 1 is the oldest but held
        let evicted = sheaf.purge(4, &|address| address == Address(1));
        assert_eq!(evicted, 2);
        assert!(sheaf.is_cached(Address(1)));
        assert!(!sheaf.is_cached(Address(3)));
        assert_eq!(sheaf.heft(), 4);

        // under the limit already
        assert_eq!(sheaf.purge(100, &|_| false), 0);
        assert_eq!(sheaf.purge(0, &|_| false), 1);
        assert_eq!(sheaf.heft(), 0);
    }

    #[test]
    fn batch_commits_pages_and_retirements() {
        let dir = tempdir().unwrap();
        let sheaf = sheaf_with(
            dir.path(),
            &[(1, leaf_checkpoint(&["a"])), (5, leaf_checkpoint(&["b"]))],
        );
        let first = sheaf.load(Address(1)).unwrap();
        sheaf.load(Address(5)).unwrap();
        sheaf.mark_dirty(Address(5));

        let merged = Leaf {
            right: None,
            ..first.read().as_leaf().unwrap().clone()
        };
        let mut batch = Batch::new();
        batch.checkpoint(Address(1), Page::Leaf(merged.clone()));
        batch.retire(Address(5));
        sheaf.commit(batch).unwrap();

        assert_eq!(*first.read(), Page::Leaf(merged));
        assert!(!sheaf.is_cached(Address(5)));
        assert!(!sheaf.has_dirty());
        assert_eq!(sheaf.store().addresses(), vec![1]);
        assert_eq!(sheaf.store().version(1), Some(1));
    }

    #[test]
    fn retired_addresses_are_not_reused_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let sheaf = sheaf_with(
                dir.path(),
                &[(1, leaf_checkpoint(&[])), (9, leaf_checkpoint(&[]))],
            );
            let mut batch = Batch::new();
            batch.retire(Address(9));
            sheaf.commit(batch).unwrap();
        }

        let store = PageStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.addresses(), vec![1]);
        let sheaf = Sheaf::new(store, Options::default());
        assert_eq!(sheaf.allocate(PageKind::Leaf), Address(11));
        assert_eq!(sheaf.allocate(PageKind::Branch), Address(10));
    }
}
