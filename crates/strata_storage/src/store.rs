//! The directory-backed page store.
//!
//! Every page lives in its own append-only log file:
//!
//! ```text
//! <directory>/
//! ├─ 0.0              # root branch, version 0
//! ├─ 1.3              # left-most leaf, rewritten three times
//! ├─ 5.0.pending      # rewrite in flight (removed on open)
//! ├─ commit           # journal of an unfinished multi-page commit
//! ├─ high             # highest address ever removed
//! └─ LOCK             # owned by the tree handle, ignored here
//! ```
//!
//! A file is a sequence of lines (see [`crate::line`]). Each committed
//! append is followed by a footer that records where the newest checkpoint
//! of the page begins, so a reader can skip straight to it. Lines after the
//! last footer were never committed and are not returned. The payloads are
//! opaque to the store.

use crate::checksum::{Checksum, NoChecksum};
use crate::commit::{self, Commit, Step};
use crate::error::{LineFault, StorageError, StorageResult};
use crate::file::{remove_if_exists, sync_directory, PageFile};
use crate::line::{self, Decode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Suffix of a page version that has not yet been renamed into place.
const PENDING_SUFFIX: &str = "pending";

/// Page store settings.
#[derive(Clone)]
pub struct StoreConfig {
    /// Strategy used to compute and verify line checksums.
    pub checksum: Arc<dyn Checksum>,
    /// Initial tail window scanned for a footer.
    pub read_leaf_start_length: usize,
    /// Minimum buffer size once a line outgrows the initial buffer.
    pub read_record_start_length: usize,
    /// Initial buffer size for the forward read.
    pub read_buffer_start_size: usize,
    /// Ignore footers and replay every file from offset 0.
    pub replay: bool,
    /// Call `sync_data` after every committed append.
    pub sync_on_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            checksum: Arc::new(NoChecksum),
            read_leaf_start_length: 1024,
            read_record_start_length: 1024,
            read_buffer_start_size: 4096,
            replay: false,
            sync_on_write: false,
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("read_leaf_start_length", &self.read_leaf_start_length)
            .field("read_record_start_length", &self.read_record_start_length)
            .field("read_buffer_start_size", &self.read_buffer_start_size)
            .field("replay", &self.replay)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

/// The committed contents of one page file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLog {
    /// Version of the file that was read.
    pub version: u64,
    /// Offset of the newest checkpoint.
    pub checkpoint: u64,
    /// Non-footer payloads from the read position to end of file, in order.
    pub lines: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct PageSlot {
    version: u64,
    file: Option<Arc<PageFile>>,
    checkpoint: Option<u64>,
}

impl PageSlot {
    fn new(version: u64) -> Self {
        Self {
            version,
            file: None,
            checkpoint: None,
        }
    }
}

/// A file name within the store directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Page { address: u64, version: u64 },
    Pending,
}

fn parse_name(name: &str) -> Option<Entry> {
    let mut parts = name.split('.');
    let address = parts.next()?.parse().ok()?;
    let version = parts.next()?.parse().ok()?;
    match (parts.next(), parts.next()) {
        (None, _) => Some(Entry::Page { address, version }),
        (Some(PENDING_SUFFIX), None) => Some(Entry::Pending),
        _ => None,
    }
}

pub(crate) fn page_name(address: u64, version: u64) -> String {
    format!("{address}.{version}")
}

pub(crate) fn pending_name(address: u64, version: u64) -> String {
    format!("{address}.{version}.{PENDING_SUFFIX}")
}

/// Reads and writes page logs within one directory.
///
/// # Thread Safety
///
/// The store is `Send + Sync`. Callers serialize appends to a single page;
/// the store itself only guards its version table.
pub struct PageStore {
    directory: PathBuf,
    config: StoreConfig,
    pages: Mutex<HashMap<u64, PageSlot>>,
    high_water: AtomicU64,
}

impl fmt::Debug for PageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageStore")
            .field("directory", &self.directory)
            .field("config", &self.config)
            .field("pages", &self.pages.lock().len())
            .finish()
    }
}

impl PageStore {
    /// Prepares an empty store in `directory`, creating it if missing.
    ///
    /// No page file is written.
    ///
    /// # Errors
    ///
    /// - `NotADirectory` if the path exists and is not a directory
    /// - `DirectoryNotEmpty` if it already holds page files
    /// - `Io` for any other failure of the pre-check
    pub fn create(directory: &Path, config: StoreConfig) -> StorageResult<Self> {
        match fs::metadata(directory) {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(StorageError::NotADirectory {
                    path: directory.to_path_buf(),
                });
            }
            Ok(_) => {
                for entry in fs::read_dir(directory)? {
                    let entry = entry?;
                    let name = entry.file_name();
                    if name.to_str().and_then(parse_name).is_some() {
                        return Err(StorageError::DirectoryNotEmpty {
                            path: directory.to_path_buf(),
                        });
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(directory)?;
            }
            Err(e) => return Err(e.into()),
        }

        debug!(directory = %directory.display(), "created page store");
        Ok(Self {
            directory: directory.to_path_buf(),
            config,
            pages: Mutex::new(HashMap::new()),
            high_water: AtomicU64::new(0),
        })
    }

    /// Opens the store in an existing directory.
    ///
    /// A commit journal left by an interrupted commit is played forward
    /// first. Then the newest version of each page is authoritative; older
    /// versions and abandoned `.pending` files are deleted.
    ///
    /// # Errors
    ///
    /// Returns `NotADirectory` if the path is not a directory,
    /// `CorruptJournal` if an interrupted commit cannot be finished, or an
    /// I/O error if the directory cannot be listed or reclaimed.
    pub fn open(directory: &Path, config: StoreConfig) -> StorageResult<Self> {
        if !fs::metadata(directory)?.is_dir() {
            return Err(StorageError::NotADirectory {
                path: directory.to_path_buf(),
            });
        }

        let checksum = config.checksum.as_ref();
        if let Some(steps) = commit::read_journal(directory, checksum)? {
            info!(directory = %directory.display(), steps = steps.len(), "finishing interrupted commit");
            commit::play(directory, checksum, &steps)?;
            commit::finish(directory)?;
        }
        let high_water = commit::read_high_water(directory, checksum)?;

        let mut newest: HashMap<u64, u64> = HashMap::new();
        let mut reclaim = Vec::new();
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            match parse_name(&name) {
                Some(Entry::Page { address, version }) => match newest.get(&address) {
                    Some(&current) if current > version => {
                        reclaim.push(page_name(address, version));
                    }
                    Some(&current) => {
                        reclaim.push(page_name(address, current));
                        newest.insert(address, version);
                    }
                    None => {
                        newest.insert(address, version);
                    }
                },
                Some(Entry::Pending) => reclaim.push(name),
                None if name == commit::JOURNAL_PENDING || name == commit::HIGH_WATER_PENDING => {
                    reclaim.push(name);
                }
                None => {}
            }
        }

        for name in &reclaim {
            debug!(file = %name, "reclaiming stale page file");
            fs::remove_file(directory.join(name))?;
        }

        let pages = newest
            .into_iter()
            .map(|(address, version)| (address, PageSlot::new(version)))
            .collect();

        Ok(Self {
            directory: directory.to_path_buf(),
            config,
            pages: Mutex::new(pages),
            high_water: AtomicU64::new(high_water),
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the store settings.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns every page address present, ascending.
    #[must_use]
    pub fn addresses(&self) -> Vec<u64> {
        let mut addresses: Vec<u64> = self.pages.lock().keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    /// Returns the highest page address this store has ever held.
    ///
    /// Removed pages count, so an allocator that starts above this mark
    /// never reuses an address.
    #[must_use]
    pub fn high_water(&self) -> u64 {
        let present = self.pages.lock().keys().copied().max().unwrap_or(0);
        present.max(self.high_water.load(Ordering::Acquire))
    }

    /// Returns the current version of a page.
    #[must_use]
    pub fn version(&self, address: u64) -> Option<u64> {
        self.pages.lock().get(&address).map(|slot| slot.version)
    }

    /// Returns the path of the current version of a page.
    #[must_use]
    pub fn page_path(&self, address: u64) -> Option<PathBuf> {
        self.version(address)
            .map(|version| self.directory.join(page_name(address, version)))
    }

    fn file(&self, address: u64) -> StorageResult<(u64, Arc<PageFile>)> {
        let mut pages = self.pages.lock();
        let slot = pages
            .get_mut(&address)
            .ok_or(StorageError::MissingPage { address })?;
        if let Some(file) = &slot.file {
            return Ok((slot.version, Arc::clone(file)));
        }
        let file = Arc::new(PageFile::open(
            &self.directory.join(page_name(address, slot.version)),
        )?);
        slot.file = Some(Arc::clone(&file));
        Ok((slot.version, file))
    }

    fn set_checkpoint(&self, address: u64, checkpoint: u64) {
        if let Some(slot) = self.pages.lock().get_mut(&address) {
            slot.checkpoint = Some(checkpoint);
        }
    }

    fn known_checkpoint(&self, address: u64) -> Option<u64> {
        self.pages
            .lock()
            .get(&address)
            .and_then(|slot| slot.checkpoint)
    }

    /// Cuts bytes past the last footer left by an earlier process, so a
    /// later footer cannot commit them.
    fn discard_uncommitted(&self, address: u64, file: &PageFile, committed: u64) -> StorageResult<()> {
        let size = file.size();
        if size > committed {
            warn!(address, bytes = size - committed, "discarding uncommitted tail");
            file.truncate(committed)?;
            file.sync()?;
        }
        Ok(())
    }

    fn checkpoint(&self, address: u64, file: &PageFile) -> StorageResult<u64> {
        if let Some(checkpoint) = self.known_checkpoint(address) {
            return Ok(checkpoint);
        }
        let (checkpoint, committed) = self.find_footer(address, file)?;
        self.discard_uncommitted(address, file, committed)?;
        self.set_checkpoint(address, checkpoint);
        Ok(checkpoint)
    }

    /// Reads the committed log of a page.
    ///
    /// Only lines followed by a footer are returned. Complete lines after the
    /// last footer were never committed; the first read of a file in this
    /// process cuts them off. With `replay` set, footers are ignored and
    /// every line is returned.
    ///
    /// # Errors
    ///
    /// - `MissingPage` if the page does not exist
    /// - `CorruptPage` if no footer is found (unless replay is forced)
    /// - `CorruptLine` if any line from the read position onward is invalid,
    ///   including a trailing line cut short by a crash
    pub fn read_page(&self, address: u64) -> StorageResult<PageLog> {
        let (version, file) = self.file(address)?;
        let first_read = self.known_checkpoint(address).is_none();

        let start = if self.config.replay {
            0
        } else {
            self.find_footer(address, &file)?.0
        };

        let mut lines = Vec::new();
        let mut uncommitted = Vec::new();
        let mut last_footer = None;
        let mut committed = start;
        self.read_forward(address, &file, start, |payload, end| {
            match line::parse_footer(payload) {
                Some(checkpoint) => {
                    last_footer = Some(checkpoint);
                    lines.append(&mut uncommitted);
                    committed = end;
                }
                None => uncommitted.push(payload.to_vec()),
            }
        })?;

        if self.config.replay {
            lines.append(&mut uncommitted);
        } else if !uncommitted.is_empty() {
            debug!(address, lines = uncommitted.len(), "ignoring lines without a footer");
            if first_read {
                self.discard_uncommitted(address, &file, committed)?;
            }
        }

        let checkpoint = last_footer.unwrap_or(start);
        self.set_checkpoint(address, checkpoint);

        debug!(
            address,
            version,
            checkpoint,
            lines = lines.len(),
            "read page"
        );
        Ok(PageLog {
            version,
            checkpoint,
            lines,
        })
    }

    /// Scans backward from the end of the file for the newest footer.
    ///
    /// Returns the checkpoint offset it records and the offset just past
    /// it. The window starts at `read_leaf_start_length` and doubles until
    /// the footer is found or the whole file has been scanned.
    fn find_footer(&self, address: u64, file: &PageFile) -> StorageResult<(u64, u64)> {
        let size = file.size();
        let initial = u64::try_from(self.config.read_leaf_start_length.max(1)).unwrap_or(u64::MAX);
        let mut window = initial.min(size);

        loop {
            let start = size - window;
            let len = usize::try_from(window).unwrap_or(usize::MAX);
            let tail = file.read_at(start, len)?;

            for position in (0..tail.len()).rev() {
                let at_boundary = if position == 0 {
                    start == 0
                } else {
                    tail[position - 1] == b'\n'
                };
                if !at_boundary {
                    continue;
                }
                if let Ok(Decode::Line(found)) =
                    line::decode(self.config.checksum.as_ref(), &tail, position)
                {
                    if let Some(checkpoint) = line::parse_footer(&tail[found.payload]) {
                        if checkpoint <= start + position as u64 {
                            return Ok((checkpoint, start + found.end as u64));
                        }
                    }
                }
            }

            if window >= size {
                return Err(StorageError::CorruptPage { address, window });
            }
            window = window.saturating_mul(2).min(size);
        }
    }

    /// Decodes every line from `offset` to end of file, passing each payload
    /// with the offset just past its line.
    ///
    /// The buffer starts at `read_buffer_start_size` and grows whenever a
    /// line does not fit, to at least `read_record_start_length`.
    fn read_forward<F>(
        &self,
        address: u64,
        file: &PageFile,
        offset: u64,
        mut visit: F,
    ) -> StorageResult<()>
    where
        F: FnMut(&[u8], u64),
    {
        let size = file.size();
        let checksum = self.config.checksum.as_ref();
        let mut chunk = self.config.read_buffer_start_size.max(1);
        let mut base = offset;
        let mut buffer = file.read_at(base, chunk)?;
        let mut position = 0;

        while base + (position as u64) < size {
            match line::decode(checksum, &buffer, position) {
                Ok(Decode::Line(found)) => {
                    visit(&buffer[found.payload], base + found.end as u64);
                    position = found.end;
                }
                Ok(Decode::Incomplete) => {
                    let line_offset = base + position as u64;
                    if base + buffer.len() as u64 >= size {
                        return Err(StorageError::CorruptLine {
                            address,
                            offset: line_offset,
                            fault: LineFault::Truncated,
                        });
                    }

                    let remaining = buffer.len() - position;
                    let needed = line::required_len(&buffer, position).unwrap_or(remaining + 1);
                    if needed > chunk {
                        chunk = needed
                            .max(self.config.read_record_start_length)
                            .next_power_of_two();
                    }

                    buffer.drain(..position);
                    base = line_offset;
                    position = 0;

                    let want = chunk.max(needed) - remaining;
                    let more = file.read_at(base + remaining as u64, want)?;
                    buffer.extend_from_slice(&more);
                }
                Err(fault) => {
                    return Err(StorageError::CorruptLine {
                        address,
                        offset: base + position as u64,
                        fault,
                    });
                }
            }
        }

        Ok(())
    }

    /// Appends one line to a page without a footer, returning its offset.
    ///
    /// The line is not committed until a footer follows it.
    ///
    /// # Errors
    ///
    /// Returns `MissingPage` or an I/O error.
    pub fn append_record(&self, address: u64, payload: &[u8]) -> StorageResult<u64> {
        let (_, file) = self.file(address)?;
        let line = line::encode(self.config.checksum.as_ref(), payload);
        let offset = file.append(&line)?;
        self.sync_if_configured(&file)?;
        Ok(offset)
    }

    /// Appends a footer committing everything written so far.
    ///
    /// # Errors
    ///
    /// Returns `MissingPage`, `CorruptPage` if the checkpoint cannot be
    /// located, or an I/O error.
    pub fn write_footer(&self, address: u64) -> StorageResult<()> {
        let (_, file) = self.file(address)?;
        let checkpoint = self.checkpoint(address, &file)?;
        let footer = line::encode(
            self.config.checksum.as_ref(),
            &line::footer_payload(checkpoint),
        );
        file.append(&footer)?;
        self.sync_if_configured(&file)
    }

    /// Appends a line and its footer with a single write.
    ///
    /// # Errors
    ///
    /// Returns `MissingPage`, `CorruptPage` if the checkpoint cannot be
    /// located, or an I/O error.
    pub fn append_committed(&self, address: u64, payload: &[u8]) -> StorageResult<u64> {
        let (_, file) = self.file(address)?;
        let checkpoint = self.checkpoint(address, &file)?;
        let checksum = self.config.checksum.as_ref();

        let mut bytes = line::encode(checksum, payload);
        bytes.extend(line::encode(checksum, &line::footer_payload(checkpoint)));

        let offset = file.append(&bytes)?;
        self.sync_if_configured(&file)?;
        Ok(offset)
    }

    fn sync_if_configured(&self, file: &PageFile) -> StorageResult<()> {
        if self.config.sync_on_write {
            file.sync()?;
        }
        Ok(())
    }

    /// Writes `<address>.<version>.pending` holding exactly `payloads`,
    /// synced, with a footer pointing at offset 0.
    fn write_pending(&self, address: u64, version: u64, payloads: &[Vec<u8>]) -> StorageResult<PathBuf> {
        let checksum = self.config.checksum.as_ref();
        let mut bytes = Vec::new();
        for payload in payloads {
            bytes.extend(line::encode(checksum, payload));
        }
        bytes.extend(line::encode(checksum, &line::footer_payload(0)));

        let path = self.directory.join(pending_name(address, version));
        remove_if_exists(&path)?;
        let file = PageFile::create(&path)?;
        file.append(&bytes)?;
        file.sync()?;
        Ok(path)
    }

    fn next_version(&self, address: u64) -> u64 {
        self.version(address).map_or(0, |v| v + 1)
    }

    fn emplaced(&self, address: u64, version: u64) {
        let mut pages = self.pages.lock();
        let slot = pages.entry(address).or_insert_with(|| PageSlot::new(version));
        slot.version = version;
        slot.file = None;
        slot.checkpoint = Some(0);
    }

    /// Writes a new version of a page holding exactly `payloads`.
    ///
    /// The file is written as `<address>.<version>.pending`, synced, renamed
    /// into place, and the directory synced before the superseded version
    /// is deleted. A page that does not exist yet starts at version 0.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if any step fails; the previous version stays
    /// authoritative until the rename.
    pub fn rewrite_page(&self, address: u64, payloads: &[Vec<u8>]) -> StorageResult<u64> {
        let previous = self.version(address);
        let version = self.next_version(address);

        let pending = self.write_pending(address, version, payloads)?;
        fs::rename(&pending, self.directory.join(page_name(address, version)))?;
        sync_directory(&self.directory)?;
        self.emplaced(address, version);

        if let Some(old) = previous {
            fs::remove_file(self.directory.join(page_name(address, old)))?;
        }

        debug!(address, version, lines = payloads.len(), "rewrote page");
        Ok(version)
    }

    /// Deletes every file of a page.
    ///
    /// # Errors
    ///
    /// Returns `MissingPage` if the page does not exist, or the unlink error
    /// verbatim.
    pub fn remove_page(&self, address: u64) -> StorageResult<()> {
        if self.version(address).is_none() {
            return Err(StorageError::MissingPage { address });
        }
        let mut commit = Commit::new();
        commit.remove(address);
        self.commit(commit)
    }

    /// Applies every change in `commit` so that all or none of them survive
    /// a crash.
    ///
    /// # Errors
    ///
    /// Returns `MissingPage` if a removed page does not exist, or an I/O
    /// error. A failure before the journal is written leaves every page as
    /// it was; a failure after it is finished by the next open.
    pub fn commit(&self, changes: Commit) -> StorageResult<()> {
        self.prepare(changes)?.apply()
    }

    /// Writes every new page version and the journal of `commit` without
    /// changing any page.
    ///
    /// Once this returns the commit is durable: it either completes through
    /// [`Prepared::apply`] or, after a crash, when the store is next opened.
    ///
    /// # Errors
    ///
    /// Returns `MissingPage` if a removed page does not exist,
    /// `CorruptJournal` if an earlier commit was never applied, or an I/O
    /// error.
    pub fn prepare(&self, changes: Commit) -> StorageResult<Prepared<'_>> {
        let journal = self.directory.join(commit::JOURNAL);
        if journal.exists() {
            return Err(StorageError::corrupt_journal(
                journal,
                "an earlier commit was never applied",
            ));
        }

        let mut removals = Vec::with_capacity(changes.removals.len());
        for &address in &changes.removals {
            let version = self
                .version(address)
                .ok_or(StorageError::MissingPage { address })?;
            removals.push(Step::Remove { address, version });
        }

        let mut steps = Vec::with_capacity(changes.len() + 1);
        for (address, payloads) in &changes.rewrites {
            let version = self.next_version(*address);
            self.write_pending(*address, version, payloads)?;
            steps.push(Step::Emplace {
                address: *address,
                version,
            });
        }
        steps.extend(removals);
        if let Some(&highest) = changes.removals.iter().max() {
            if highest > self.high_water.load(Ordering::Acquire) {
                steps.push(Step::High(highest));
            }
        }

        commit::write_journal(&self.directory, self.config.checksum.as_ref(), &steps)?;
        debug!(steps = steps.len(), "prepared commit");
        Ok(Prepared { store: self, steps })
    }
}

/// A commit whose journal is durable but whose pages are not yet in place.
///
/// Dropping it without [`Prepared::apply`] leaves the journal for the next
/// [`PageStore::open`] to finish; the store that prepared it should not be
/// used for further commits.
#[derive(Debug)]
#[must_use = "a prepared commit only takes effect once applied or replayed"]
pub struct Prepared<'a> {
    store: &'a PageStore,
    steps: Vec<Step>,
}

impl Prepared<'_> {
    /// Moves every new page version into place and deletes removed pages.
    ///
    /// # Errors
    ///
    /// Returns an I/O error; the journal then stays for the next open.
    pub fn apply(self) -> StorageResult<()> {
        let store = self.store;
        commit::play(&store.directory, store.config.checksum.as_ref(), &self.steps)?;

        for step in &self.steps {
            match *step {
                Step::Emplace { address, version } => store.emplaced(address, version),
                Step::Remove { address, .. } => {
                    store.pages.lock().remove(&address);
                }
                Step::High(address) => {
                    store.high_water.fetch_max(address, Ordering::AcqRel);
                }
            }
        }

        commit::finish(&store.directory)?;
        debug!(steps = self.steps.len(), "applied commit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Sha256Checksum;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn lines(items: &[&[u8]]) -> Vec<Vec<u8>> {
        items.iter().map(|item| item.to_vec()).collect()
    }

    fn append_raw(store: &PageStore, address: u64, bytes: &[u8]) {
        let path = store.page_path(address).unwrap();
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
    }

    #[test]
    fn create_makes_missing_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree");

        let store = PageStore::create(&path, StoreConfig::default()).unwrap();
        assert!(path.is_dir());
        assert!(store.addresses().is_empty());
        assert_eq!(fs::read_dir(&path).unwrap().count(), 0);
    }

    #[test]
    fn create_refuses_page_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("0.0"), b"").unwrap();

        let err = PageStore::create(dir.path(), StoreConfig::default()).unwrap_err();
        assert!(matches!(err, StorageError::DirectoryNotEmpty { .. }));
    }

    #[test]
    fn create_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("LOCK"), b"").unwrap();

        assert!(PageStore::create(dir.path(), StoreConfig::default()).is_ok());
    }

    #[test]
    fn create_refuses_plain_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"x").unwrap();

        let err = PageStore::create(&path, StoreConfig::default()).unwrap_err();
        assert!(matches!(err, StorageError::NotADirectory { .. }));
        let err = PageStore::open(&path, StoreConfig::default()).unwrap_err();
        assert!(matches!(err, StorageError::NotADirectory { .. }));
    }

    #[test]
    fn rewrite_then_read() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();

        assert_eq!(store.rewrite_page(1, &lines(&[b"a", b"b"])).unwrap(), 0);
        let log = store.read_page(1).unwrap();
        assert_eq!(log.version, 0);
        assert_eq!(log.checkpoint, 0);
        assert_eq!(log.lines, lines(&[b"a", b"b"]));
        assert!(dir.path().join("1.0").exists());
    }

    #[test]
    fn rewrite_bumps_version_and_removes_old() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();

        store.rewrite_page(3, &lines(&[b"a"])).unwrap();
        assert_eq!(store.rewrite_page(3, &lines(&[b"b"])).unwrap(), 1);

        assert!(!dir.path().join("3.0").exists());
        assert!(dir.path().join("3.1").exists());
        assert_eq!(store.read_page(3).unwrap().lines, lines(&[b"b"]));
    }

    #[test]
    fn appends_are_committed() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
        store.rewrite_page(1, &lines(&[b"base"])).unwrap();

        store.append_committed(1, b"one").unwrap();
        store.append_record(1, b"two").unwrap();
        store.write_footer(1).unwrap();

        let log = store.read_page(1).unwrap();
        assert_eq!(log.lines, lines(&[b"base", b"one", b"two"]));
    }

    #[test]
    fn reopen_reads_same_lines() {
        let dir = tempdir().unwrap();
        {
            let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
            store.rewrite_page(0, &lines(&[b"root"])).unwrap();
            store.rewrite_page(1, &lines(&[b"leaf"])).unwrap();
            store.append_committed(1, b"more").unwrap();
        }

        let store = PageStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.addresses(), vec![0, 1]);
        assert_eq!(store.read_page(1).unwrap().lines, lines(&[b"leaf", b"more"]));
        // appending before any read locates the checkpoint on its own
        store.append_committed(0, b"again").unwrap();
        assert_eq!(store.read_page(0).unwrap().lines, lines(&[b"root", b"again"]));
    }

    #[test]
    fn open_reclaims_stale_versions_and_pending() {
        let dir = tempdir().unwrap();
        {
            let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
            store.rewrite_page(1, &lines(&[b"new"])).unwrap();
            store.rewrite_page(1, &lines(&[b"newer"])).unwrap();
        }
        fs::write(dir.path().join("1.0"), b"stale").unwrap();
        fs::write(dir.path().join("7.0.pending"), b"half").unwrap();
        fs::write(dir.path().join("commit.pending"), b"half").unwrap();
        fs::write(dir.path().join("high.pending"), b"half").unwrap();

        let store = PageStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.version(1), Some(1));
        assert!(!dir.path().join("1.0").exists());
        assert!(!dir.path().join("7.0.pending").exists());
        assert!(!dir.path().join("commit.pending").exists());
        assert!(!dir.path().join("high.pending").exists());
        assert_eq!(store.addresses(), vec![1]);
    }

    #[test]
    fn missing_footer_is_corrupt_page() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("1.0"), b"3 0 abc\n").unwrap();

        let config = StoreConfig {
            read_leaf_start_length: 3,
            ..StoreConfig::default()
        };
        let store = PageStore::open(dir.path(), config).unwrap();
        let err = store.read_page(1).unwrap_err();
        assert!(matches!(err, StorageError::CorruptPage { address: 1, window: 8 }));
        assert_eq!(
            err.to_string(),
            "corrupt page 1: cannot find footer in last 8 bytes"
        );
    }

    #[test]
    fn footer_window_doubles() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            read_leaf_start_length: 4,
            ..StoreConfig::default()
        };
        let store = PageStore::create(dir.path(), config).unwrap();
        store.rewrite_page(1, &[vec![b'x'; 500]]).unwrap();

        let log = store.read_page(1).unwrap();
        assert_eq!(log.lines, vec![vec![b'x'; 500]]);
    }

    #[test]
    fn small_buffer_grows_for_large_lines() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            read_buffer_start_size: 8,
            read_record_start_length: 16,
            ..StoreConfig::default()
        };
        let store = PageStore::create(dir.path(), config).unwrap();
        let big = vec![b'y'; 5000];
        store
            .rewrite_page(1, &[b"small".to_vec(), big.clone(), b"tail".to_vec()])
            .unwrap();

        let log = store.read_page(1).unwrap();
        assert_eq!(log.lines, vec![b"small".to_vec(), big, b"tail".to_vec()]);
    }

    #[test]
    fn truncated_trailing_line_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
        store.rewrite_page(1, &lines(&[b"a"])).unwrap();
        append_raw(&store, 1, b"10 0 abc");

        let err = store.read_page(1).unwrap_err();
        assert_eq!(err.line_fault(), Some(LineFault::Truncated));
    }

    #[test]
    fn bad_checksum_is_corrupt_line() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            checksum: Arc::new(Sha256Checksum),
            ..StoreConfig::default()
        };
        let store = PageStore::create(dir.path(), config).unwrap();
        store.rewrite_page(1, &lines(&[b"abc"])).unwrap();

        let path = store.page_path(1).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        let at = bytes.iter().position(|&b| b == b'\n').unwrap() - 1;
        bytes[at] = b'z';
        fs::write(&path, bytes).unwrap();

        let err = store.read_page(1).unwrap_err();
        assert_eq!(err.line_fault(), Some(LineFault::InvalidChecksum));
    }

    #[test]
    fn garbage_header_is_missing_header() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
        store.rewrite_page(1, &lines(&[b"a"])).unwrap();
        append_raw(&store, 1, b"x x\n");

        let err = store.read_page(1).unwrap_err();
        assert_eq!(err.line_fault(), Some(LineFault::MissingHeader));
    }

    #[test]
    fn replay_reads_without_footer() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("1.0"), b"3 0 abc\n").unwrap();

        let config = StoreConfig {
            replay: true,
            ..StoreConfig::default()
        };
        let store = PageStore::open(dir.path(), config).unwrap();
        assert_eq!(store.read_page(1).unwrap().lines, lines(&[b"abc"]));
    }

    #[test]
    fn remove_page_deletes_file() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
        store.rewrite_page(5, &lines(&[b"a"])).unwrap();

        store.remove_page(5).unwrap();
        assert!(!dir.path().join("5.0").exists());
        assert!(matches!(
            store.read_page(5),
            Err(StorageError::MissingPage { address: 5 })
        ));
        assert!(matches!(
            store.remove_page(5),
            Err(StorageError::MissingPage { address: 5 })
        ));
    }

    #[test]
    fn lines_without_footer_are_not_committed() {
        let dir = tempdir().unwrap();
        {
            let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
            store.rewrite_page(1, &lines(&[b"base"])).unwrap();
            store.append_record(1, b"uncommitted").unwrap();
            assert_eq!(store.read_page(1).unwrap().lines, lines(&[b"base"]));
        }

        let store = PageStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.read_page(1).unwrap().lines, lines(&[b"base"]));

        // a later footer must not commit the abandoned line
        store.append_committed(1, b"next").unwrap();
        assert_eq!(store.read_page(1).unwrap().lines, lines(&[b"base", b"next"]));
    }

    #[test]
    fn append_before_read_drops_uncommitted_tail() {
        let dir = tempdir().unwrap();
        {
            let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
            store.rewrite_page(1, &lines(&[b"base"])).unwrap();
            store.append_record(1, b"uncommitted").unwrap();
        }

        let store = PageStore::open(dir.path(), StoreConfig::default()).unwrap();
        store.append_committed(1, b"next").unwrap();
        assert_eq!(store.read_page(1).unwrap().lines, lines(&[b"base", b"next"]));
    }

    #[test]
    fn footer_commits_pending_lines_in_process() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
        store.rewrite_page(1, &lines(&[b"base"])).unwrap();

        store.append_record(1, b"two").unwrap();
        assert_eq!(store.read_page(1).unwrap().lines, lines(&[b"base"]));
        store.write_footer(1).unwrap();
        assert_eq!(store.read_page(1).unwrap().lines, lines(&[b"base", b"two"]));
    }

    #[test]
    fn commit_applies_every_change() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
        store.rewrite_page(1, &lines(&[b"a"])).unwrap();
        store.rewrite_page(5, &lines(&[b"b"])).unwrap();

        let mut changes = Commit::new();
        changes.rewrite(1, lines(&[b"x"]));
        changes.rewrite(7, lines(&[b"y"]));
        changes.remove(5);
        store.commit(changes).unwrap();

        assert_eq!(store.addresses(), vec![1, 7]);
        assert_eq!(store.version(1), Some(1));
        assert_eq!(store.read_page(1).unwrap().lines, lines(&[b"x"]));
        assert_eq!(store.read_page(7).unwrap().lines, lines(&[b"y"]));
        assert!(!dir.path().join("1.0").exists());
        assert!(!dir.path().join("5.0").exists());
        assert!(!dir.path().join("commit").exists());
    }

    #[test]
    fn prepared_commit_is_finished_by_open() {
        let dir = tempdir().unwrap();
        {
            let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
            store.rewrite_page(1, &lines(&[b"a", b"b", b"c"])).unwrap();
            store.rewrite_page(5, &lines(&[b"gone"])).unwrap();

            let mut changes = Commit::new();
            changes.rewrite(1, lines(&[b"a"]));
            changes.rewrite(3, lines(&[b"b", b"c"]));
            changes.remove(5);
            drop(store.prepare(changes).unwrap());

            // nothing is in place until the journal is played
            assert_eq!(store.read_page(1).unwrap().lines, lines(&[b"a", b"b", b"c"]));
            assert!(dir.path().join("commit").exists());
        }

        let store = PageStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.addresses(), vec![1, 3]);
        assert_eq!(store.read_page(1).unwrap().lines, lines(&[b"a"]));
        assert_eq!(store.read_page(3).unwrap().lines, lines(&[b"b", b"c"]));
        assert!(!dir.path().join("commit").exists());
        assert_eq!(store.high_water(), 5);
    }

    #[test]
    fn prepare_refuses_an_unapplied_journal() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
        let mut changes = Commit::new();
        changes.rewrite(1, lines(&[b"a"]));
        drop(store.prepare(changes.clone()).unwrap());

        let err = store.prepare(changes).unwrap_err();
        assert!(matches!(err, StorageError::CorruptJournal { .. }));
    }

    #[test]
    fn removed_addresses_stay_below_high_water() {
        let dir = tempdir().unwrap();
        {
            let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
            store.rewrite_page(1, &lines(&[b"a"])).unwrap();
            store.rewrite_page(9, &lines(&[b"b"])).unwrap();
            store.remove_page(9).unwrap();
            assert_eq!(store.high_water(), 9);
        }

        let store = PageStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.addresses(), vec![1]);
        assert_eq!(store.high_water(), 9);
    }

    #[test]
    fn parse_names() {
        assert_eq!(
            parse_name("12.3"),
            Some(Entry::Page {
                address: 12,
                version: 3
            })
        );
        assert_eq!(parse_name("12.3.pending"), Some(Entry::Pending));
        assert_eq!(parse_name("LOCK"), None);
        assert_eq!(parse_name("12"), None);
        assert_eq!(parse_name("12.3.old"), None);
    }
}
