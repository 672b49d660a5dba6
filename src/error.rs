//! Error types for the index crate.

use crate::types::Key;
use thiserror::Error;

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors that can occur while building or querying an index
#[derive(Error, Debug)]
pub enum IndexError {
    /// I/O error from the underlying file system or transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key has the wrong arity, an empty element, or a forbidden byte
    #[error("bad index key: {0}")]
    BadKey(String),

    /// Value contains a NUL or newline byte
    #[error("bad index value: {0}")]
    BadValue(String),

    /// Number of reference lists does not match the index configuration
    #[error("bad reference lists: expected {expected}, got {actual}")]
    BadRefLists { expected: usize, actual: usize },

    /// The same key was added twice, or surfaced from two backing indices
    #[error("duplicate key: {0}")]
    DuplicateKey(Key),

    /// The file's leading bytes do not match the expected signature
    #[error("bad index signature in {name}")]
    BadSignature { name: String },

    /// One of the header option lines is missing or unparseable
    #[error("bad index options in {name}: {reason}")]
    BadOptions { name: String, reason: String },

    /// Page or record data failed to parse or decompress
    #[error("bad index data in {name}: {reason}")]
    BadData { name: String, reason: String },

    /// The transport reports the backing file missing
    #[error("no such file: {name}")]
    NoSuchFile { name: String },

    /// The header text did not fit in the reserved space
    #[error("index header too large: {size} > {max} bytes")]
    HeaderTooLarge { size: usize, max: usize },

    /// zlib compression failed
    #[error("compression error: {0}")]
    Compress(String),

    /// An internal invariant was violated
    #[error("internal error: {0}")]
    Internal(String),
}

impl IndexError {
    /// Create a bad-key error with a message
    pub fn bad_key(msg: impl Into<String>) -> Self {
        Self::BadKey(msg.into())
    }

    /// Create a bad-options error for a named file
    pub fn bad_options(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadOptions {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a bad-data error for a named file
    pub fn bad_data(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadData {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a no-such-file error
    pub fn no_such_file(name: impl Into<String>) -> Self {
        Self::NoSuchFile { name: name.into() }
    }

    /// Create an internal invariant error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True if this error means the backing file has disappeared
    pub fn is_no_such_file(&self) -> bool {
        matches!(self, Self::NoSuchFile { .. })
    }
}
