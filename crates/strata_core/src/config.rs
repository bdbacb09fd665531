//! Tree configuration.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use strata_storage::{Checksum, NoChecksum, StoreConfig};

/// Orders two keys.
pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Derives the key of a record.
pub type Extractor = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Options for creating or opening a tree.
#[derive(Clone)]
pub struct Options {
    /// Maximum live records in a leaf before the balancer splits it.
    pub leaf_size: usize,

    /// Maximum children in a branch before the balancer splits it.
    pub branch_size: usize,

    /// Maximum record bytes in a leaf before the balancer splits it.
    pub leaf_heft: Option<usize>,

    /// Line checksum strategy.
    pub checksum: Arc<dyn Checksum>,

    /// Key order.
    pub comparator: Comparator,

    /// Record to key mapping.
    pub extractor: Extractor,

    /// Initial tail window scanned for a page footer.
    pub read_leaf_start_length: usize,

    /// Minimum read buffer once a line outgrows the initial buffer.
    pub read_record_start_length: usize,

    /// Initial read buffer size.
    pub read_buffer_start_size: usize,

    /// Replay whole page logs instead of starting at the newest checkpoint.
    pub replay: bool,

    /// Whether to sync every committed append (safer but slower).
    pub sync_on_write: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            leaf_size: 16,
            branch_size: 16,
            leaf_heft: None,
            checksum: Arc::new(NoChecksum),
            comparator: Arc::new(|a: &[u8], b: &[u8]| a.cmp(b)),
            extractor: Arc::new(<[u8]>::to_vec),
            read_leaf_start_length: 1024,
            read_record_start_length: 1024,
            read_buffer_start_size: 4096,
            replay: false,
            sync_on_write: false,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("leaf_size", &self.leaf_size)
            .field("branch_size", &self.branch_size)
            .field("leaf_heft", &self.leaf_heft)
            .field("read_leaf_start_length", &self.read_leaf_start_length)
            .field("read_record_start_length", &self.read_record_start_length)
            .field("read_buffer_start_size", &self.read_buffer_start_size)
            .field("replay", &self.replay)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

impl Options {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the leaf split threshold (at least 1).
    #[must_use]
    pub fn leaf_size(mut self, size: usize) -> Self {
        self.leaf_size = size.max(1);
        self
    }

    /// Sets the branch split threshold (at least 2).
    #[must_use]
    pub fn branch_size(mut self, size: usize) -> Self {
        self.branch_size = size.max(2);
        self
    }

    /// Sets the leaf byte threshold.
    #[must_use]
    pub fn leaf_heft(mut self, heft: usize) -> Self {
        self.leaf_heft = Some(heft);
        self
    }

    /// Sets the checksum strategy.
    #[must_use]
    pub fn checksum(mut self, checksum: Arc<dyn Checksum>) -> Self {
        self.checksum = checksum;
        self
    }

    /// Sets the key comparator.
    #[must_use]
    pub fn comparator<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
    {
        self.comparator = Arc::new(comparator);
        self
    }

    /// Sets the record to key extractor.
    #[must_use]
    pub fn extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.extractor = Arc::new(extractor);
        self
    }

    /// Sets the initial footer scan window.
    #[must_use]
    pub fn read_leaf_start_length(mut self, length: usize) -> Self {
        self.read_leaf_start_length = length;
        self
    }

    /// Sets the minimum grown read buffer.
    #[must_use]
    pub fn read_record_start_length(mut self, length: usize) -> Self {
        self.read_record_start_length = length;
        self
    }

    /// Sets the initial read buffer.
    #[must_use]
    pub fn read_buffer_start_size(mut self, size: usize) -> Self {
        self.read_buffer_start_size = size;
        self
    }

    /// Forces full log replay on load.
    #[must_use]
    pub fn replay(mut self, value: bool) -> Self {
        self.replay = value;
        self
    }

    /// Sets whether to sync every committed append.
    #[must_use]
    pub fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Compares two keys.
    #[must_use]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.comparator)(a, b)
    }

    /// Extracts the key of a record.
    #[must_use]
    pub fn extract(&self, record: &[u8]) -> Vec<u8> {
        (self.extractor)(record)
    }

    /// Returns `true` if a leaf with `count` live records of `heft` bytes
    /// exceeds a threshold.
    #[must_use]
    pub fn leaf_overflows(&self, count: usize, heft: usize) -> bool {
        count > self.leaf_size || self.leaf_heft.is_some_and(|max| heft > max)
    }

    /// Returns `true` if `count` live records of `heft` bytes fit in one leaf.
    #[must_use]
    pub fn leaf_fits(&self, count: usize, heft: usize) -> bool {
        !self.leaf_overflows(count, heft)
    }

    /// Page store settings derived from these options.
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            checksum: Arc::clone(&self.checksum),
            read_leaf_start_length: self.read_leaf_start_length,
            read_record_start_length: self.read_record_start_length,
            read_buffer_start_size: self.read_buffer_start_size,
            replay: self.replay,
            sync_on_write: self.sync_on_write,
        }
    }
}
