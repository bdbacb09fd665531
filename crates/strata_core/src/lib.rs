//! # Strata Core
//!
//! An embedded, ordered key-record store built as a paged B-tree whose
//! leaves are append-only logs.
//!
//! This crate provides:
//! - Leaf and branch pages materialized by replaying their logs
//! - A sheaf that caches pages and accounts for their heft
//! - FIFO reader/writer locks per page
//! - Read cursors and mutators bound to one leaf at a time
//! - A balancer that splits, merges, and removes ghosts
//!
//! ## Example
//!
//! ```rust
//! use strata_core::{Options, Strata};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let tree = Strata::create(dir.path(), Options::new().leaf_size(4))?;
//!
//! for record in [b"d", b"b", b"a", b"c", b"e"] {
//!     tree.insert(record)?;
//! }
//! tree.balance()?;
//!
//! let mut cursor = tree.iterator(b"c")?;
//! assert!(cursor.found());
//! assert_eq!(cursor.get(cursor.index())?, Some(b"c".to_vec()));
//! while cursor.next()? {}
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod balancer;
mod config;
mod cursor;
mod dir;
mod error;
mod lock;
pub mod log;
pub mod page;
mod sheaf;
mod tree;
mod types;

pub use balancer::BalanceReport;
pub use config::{Comparator, Extractor, Options};
pub use cursor::{Cursor, Exclusive, Insert, Mode, Mutator, ReadCursor, Shared};
pub use dir::TreeDir;
pub use error::{CoreError, CoreResult};
pub use lock::{LockMode, LockTable, PageGuard};
pub use page::Search;
pub use sheaf::{Batch, Sheaf, SharedPage};
pub use tree::{Strata, Vivified};
pub use types::{Address, PageKind};

pub use strata_storage::{Checksum, NoChecksum, Sha256Checksum, StorageError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
