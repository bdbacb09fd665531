//! Multi-page commits.
//!
//! A commit changes several pages at once. Every new page version is
//! written in full as a `.pending` file first. Then a journal naming each
//! step is written beside them and renamed to `commit`:
//!
//! ```text
//! <directory>/
//! ├─ 7.0.pending      # new leaf
//! ├─ 1.4.pending      # the leaf it was split from
//! ├─ 0.9.pending      # the parent
//! └─ commit           # emplace 7 0, emplace 1 4, emplace 0 9, remove 5 2, high 5
//! ```
//!
//! The rename is the commit point. An open that finds a `commit` journal
//! plays it forward; an open that finds only `.pending` files deletes them,
//! so a commit is either entirely visible or not at all.
//!
//! The journal also persists the highest address ever removed, so a page
//! address is never handed out twice.

use crate::checksum::Checksum;
use crate::error::{LineFault, StorageError, StorageResult};
use crate::file::{remove_if_exists, sync_directory, PageFile};
use crate::line::{self, Decode};
use crate::store::{page_name, pending_name};
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// File name of a journal that has reached its commit point.
pub(crate) const JOURNAL: &str = "commit";

/// File name of a journal still being written.
pub(crate) const JOURNAL_PENDING: &str = "commit.pending";

/// File name of the persisted address high-water mark.
pub(crate) const HIGH_WATER: &str = "high";

/// File name of a high-water mark still being written.
pub(crate) const HIGH_WATER_PENDING: &str = "high.pending";

/// Page changes that reach disk together.
///
/// A page named twice keeps only its last change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commit {
    pub(crate) rewrites: Vec<(u64, Vec<Vec<u8>>)>,
    pub(crate) removals: Vec<u64>,
}

impl Commit {
    /// Creates an empty commit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces page `address` with a new version holding exactly `payloads`.
    pub fn rewrite(&mut self, address: u64, payloads: Vec<Vec<u8>>) {
        self.forget(address);
        self.rewrites.push((address, payloads));
    }

    /// Deletes page `address`.
    pub fn remove(&mut self, address: u64) {
        self.forget(address);
        self.removals.push(address);
    }

    fn forget(&mut self, address: u64) {
        self.rewrites.retain(|(a, _)| *a != address);
        self.removals.retain(|&a| a != address);
    }

    /// Returns `true` if the commit changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rewrites.is_empty() && self.removals.is_empty()
    }

    /// Number of pages the commit changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rewrites.len() + self.removals.len()
    }
}

/// One journaled step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Rename `<address>.<version>.pending` into place and drop the version
    /// before it.
    Emplace {
        /// Page address.
        address: u64,
        /// The new version.
        version: u64,
    },
    /// Delete `<address>.<version>`.
    Remove {
        /// Page address.
        address: u64,
        /// The version on disk.
        version: u64,
    },
    /// Raise the persisted high-water mark.
    High(u64),
}

impl Step {
    fn encode(self) -> Vec<u8> {
        match self {
            Self::Emplace { address, version } => format!("emplace {address} {version}"),
            Self::Remove { address, version } => format!("remove {address} {version}"),
            Self::High(address) => format!("high {address}"),
        }
        .into_bytes()
    }

    fn decode(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        let mut words = text.split(' ');
        let step = match (words.next()?, words.next(), words.next()) {
            ("emplace", Some(address), Some(version)) => Self::Emplace {
                address: address.parse().ok()?,
                version: version.parse().ok()?,
            },
            ("remove", Some(address), Some(version)) => Self::Remove {
                address: address.parse().ok()?,
                version: version.parse().ok()?,
            },
            ("high", Some(address), None) => Self::High(address.parse().ok()?),
            _ => return None,
        };
        words.next().is_none().then_some(step)
    }
}

/// Writes `bytes` to `temporary`, syncs it, and renames it to `name`.
pub(crate) fn write_durably(
    directory: &Path,
    temporary: &str,
    name: &str,
    bytes: &[u8],
) -> StorageResult<()> {
    let path = directory.join(temporary);
    remove_if_exists(&path)?;
    let file = PageFile::create(&path)?;
    file.append(bytes)?;
    file.sync()?;
    drop(file);

    fs::rename(&path, directory.join(name))?;
    sync_directory(directory)
}

/// Writes the journal for `steps`. Once this returns the commit is durable.
pub(crate) fn write_journal(
    directory: &Path,
    checksum: &dyn Checksum,
    steps: &[Step],
) -> StorageResult<()> {
    let mut bytes = Vec::new();
    for step in steps {
        bytes.extend(line::encode(checksum, &step.encode()));
    }
    write_durably(directory, JOURNAL_PENDING, JOURNAL, &bytes)
}

/// Decodes every line of a small whole file.
fn read_lines(path: &Path, checksum: &dyn Checksum) -> StorageResult<Option<Vec<Vec<u8>>>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut payloads = Vec::new();
    let mut position = 0;
    while position < bytes.len() {
        let fault = match line::decode(checksum, &bytes, position) {
            Ok(Decode::Line(found)) => {
                payloads.push(bytes[found.payload].to_vec());
                position = found.end;
                continue;
            }
            Ok(Decode::Incomplete) => LineFault::Truncated,
            Err(fault) => fault,
        };
        return Err(StorageError::corrupt_journal(
            path,
            format!("{fault} at offset {position}"),
        ));
    }
    Ok(Some(payloads))
}

/// Reads the journal, if a commit reached its commit point.
pub(crate) fn read_journal(
    directory: &Path,
    checksum: &dyn Checksum,
) -> StorageResult<Option<Vec<Step>>> {
    let path = directory.join(JOURNAL);
    let Some(payloads) = read_lines(&path, checksum)? else {
        return Ok(None);
    };
    payloads
        .iter()
        .map(|payload| {
            Step::decode(payload).ok_or_else(|| {
                StorageError::corrupt_journal(
                    &path,
                    format!("unknown step {:?}", String::from_utf8_lossy(payload)),
                )
            })
        })
        .collect::<StorageResult<Vec<_>>>()
        .map(Some)
}

/// Reads the persisted high-water mark, or 0 if none was ever written.
pub(crate) fn read_high_water(directory: &Path, checksum: &dyn Checksum) -> StorageResult<u64> {
    let path = directory.join(HIGH_WATER);
    match read_lines(&path, checksum)?.as_deref() {
        None => Ok(0),
        Some([payload]) => match Step::decode(payload) {
            Some(Step::High(address)) => Ok(address),
            _ => Err(StorageError::corrupt_journal(&path, "not a high-water mark")),
        },
        Some(_) => Err(StorageError::corrupt_journal(&path, "expected one line")),
    }
}

/// Performs `steps`. Every step can be repeated, so a journal interrupted
/// part way is simply played again.
pub(crate) fn play(directory: &Path, checksum: &dyn Checksum, steps: &[Step]) -> StorageResult<()> {
    for &step in steps {
        match step {
            Step::Emplace { address, version } => {
                let target = directory.join(page_name(address, version));
                match fs::rename(directory.join(pending_name(address, version)), &target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound && target.exists() => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(StorageError::corrupt_journal(
                            directory.join(JOURNAL),
                            format!("page {address} version {version} was never written"),
                        ));
                    }
                    Err(e) => return Err(e.into()),
                }
                if let Some(previous) = version.checked_sub(1) {
                    remove_if_exists(&directory.join(page_name(address, previous)))?;
                }
            }
            Step::Remove { address, version } => {
                remove_if_exists(&directory.join(page_name(address, version)))?;
            }
            Step::High(address) => {
                if address > read_high_water(directory, checksum)? {
                    let bytes = line::encode(checksum, &step.encode());
                    write_durably(directory, HIGH_WATER_PENDING, HIGH_WATER, &bytes)?;
                }
            }
        }
    }
    sync_directory(directory)?;
    debug!(steps = steps.len(), "played commit");
    Ok(())
}

/// Deletes the journal once every step has been played.
pub(crate) fn finish(directory: &Path) -> StorageResult<()> {
    fs::remove_file(directory.join(JOURNAL))?;
    sync_directory(directory)
}
