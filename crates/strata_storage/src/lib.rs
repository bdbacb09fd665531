//! # Strata Storage
//!
//! The page store underneath a Strata tree.
//!
//! Each page is an append-only log file of self-delimiting, checksummed
//! lines. This crate knows the line format, footers, versioned rewrites and
//! chunked reads; it does **not** interpret the payloads. The tree layer
//! owns the meaning of every line.
//!
//! ## Design Principles
//!
//! - Appends never rewrite existing bytes
//! - A footer commits everything before it and points at the newest checkpoint
//! - Rewrites produce a new file version through a rename
//! - Changes to several pages go through one journaled [`Commit`]
//! - Checksums are an injected strategy, never a subclass
//!
//! ## Example
//!
//! ```rust
//! use strata_storage::{PageStore, StoreConfig};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = PageStore::create(dir.path(), StoreConfig::default()).unwrap();
//! store.rewrite_page(1, &[b"hello".to_vec()]).unwrap();
//! store.append_committed(1, b"world").unwrap();
//!
//! let log = store.read_page(1).unwrap();
//! assert_eq!(log.lines, vec![b"hello".to_vec(), b"world".to_vec()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod commit;
mod error;
mod file;
pub mod line;
mod store;

pub use checksum::{checksum_by_name, Checksum, NoChecksum, Sha256Checksum};
pub use commit::Commit;
pub use error::{LineFault, StorageError, StorageResult};
pub use file::PageFile;
pub use store::{PageLog, PageStore, Prepared, StoreConfig};
