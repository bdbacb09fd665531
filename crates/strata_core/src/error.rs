//! Error types for Strata core.

use crate::types::Address;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Strata core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Page store error.
    #[error("storage error: {0}")]
    Storage(#[from] strata_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A page log holds a structurally invalid entry.
    #[error("replay error on page {address}: {message}")]
    Replay {
        /// Page being replayed.
        address: Address,
        /// Description of the invalid entry.
        message: String,
    },

    /// Another balance is in progress on this tree.
    #[error("already balancing")]
    AlreadyBalancing,

    /// A cursor could not be bound because its page failed to load.
    #[error("cannot lock page {address}: {source}")]
    Lock {
        /// Page that was being locked.
        address: Address,
        /// Why the page could not be loaded.
        source: Box<CoreError>,
    },

    /// A cursor was used after `unlock()`.
    #[error("cursor used after unlock")]
    UseAfterUnlock,

    /// The tree directory is owned by another handle.
    #[error("tree locked: another handle has exclusive access")]
    DatabaseLocked,

    /// Invalid tree layout on disk.
    #[error("invalid tree format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a replay error.
    pub fn replay(address: Address, message: impl Into<String>) -> Self {
        Self::Replay {
            address,
            message: message.into(),
        }
    }

    /// Wraps a page load failure as a lock error.
    #[must_use]
    pub fn lock(address: Address, source: CoreError) -> Self {
        Self::Lock {
            address,
            source: Box::new(source),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns the page store error at the root of this error, if any.
    #[must_use]
    pub fn storage_error(&self) -> Option<&strata_storage::StorageError> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Lock { source, .. } => source.storage_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_storage::{LineFault, StorageError};

    #[test]
    fn lock_error_reaches_storage_cause() {
        let cause = CoreError::Storage(StorageError::CorruptLine {
            address: 3,
            offset: 10,
            fault: LineFault::InvalidChecksum,
        });
        let err = CoreError::lock(Address(3), cause);

        let storage = err.storage_error().unwrap();
        assert_eq!(storage.line_fault(), Some(LineFault::InvalidChecksum));
        assert!(err.to_string().starts_with("cannot lock page 3"));
    }

    #[test]
    fn replay_message() {
        let err = CoreError::replay(Address(5), "delete out of range");
        assert_eq!(
            err.to_string(),
            "replay error on page 5: delete out of range"
        );
    }
}
