//! Error types for page store operations.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for page store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// The reason a log line was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFault {
    /// The `<length> <checksum>` prefix could not be parsed.
    MissingHeader,
    /// The checksum token does not match the payload.
    InvalidChecksum,
    /// The declared payload runs past the end of the file.
    Truncated,
    /// The payload is not followed by a newline.
    Unterminated,
}

impl fmt::Display for LineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::MissingHeader => "missing header",
            Self::InvalidChecksum => "invalid checksum",
            Self::Truncated => "truncated line",
            Self::Unterminated => "unterminated line",
        };
        f.write_str(reason)
    }
}

/// Errors that can occur during page store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The directory given to `create` already holds page files.
    #[error("directory is not empty: {}", path.display())]
    DirectoryNotEmpty {
        /// The offending directory.
        path: PathBuf,
    },

    /// The path given to `create` or `open` is not a directory.
    #[error("not a directory: {}", path.display())]
    NotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// A log line failed validation.
    #[error("corrupt line: {fault} at offset {offset} of page {address}")]
    CorruptLine {
        /// Page whose file holds the line.
        address: u64,
        /// Byte offset of the start of the line.
        offset: u64,
        /// What was wrong with it.
        fault: LineFault,
    },

    /// No footer could be found in a page file.
    #[error("corrupt page {address}: cannot find footer in last {window} bytes")]
    CorruptPage {
        /// Page whose file lacks a footer.
        address: u64,
        /// Size of the last tail window scanned.
        window: u64,
    },

    /// A commit journal or the high-water file cannot be used.
    #[error("corrupt journal {}: {reason}", path.display())]
    CorruptJournal {
        /// The offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// No file exists for the requested page.
    #[error("page {address} does not exist")]
    MissingPage {
        /// The requested page.
        address: u64,
    },
}

impl StorageError {
    /// Creates a corrupt journal error.
    pub fn corrupt_journal(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptJournal {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns the line fault if this is a corrupt line error.
    #[must_use]
    pub fn line_fault(&self) -> Option<LineFault> {
        match self {
            Self::CorruptLine { fault, .. } => Some(*fault),
            _ => None,
        }
    }
}
