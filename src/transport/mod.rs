//! Byte-transport abstraction.
//!
//! Readers fetch index bytes through a [`Transport`] so the same code
//! serves local files, in-memory fixtures, and remote stores. Written
//! files are immutable once stored.

mod local;
mod memory;

pub use local::LocalTransport;
pub use memory::{MemoryTransport, TransportActivity};

use crate::error::Result;
use std::io::Read;

/// Default read-batch hint for local disks, one page
pub const DEFAULT_RECOMMENDED_PAGE_SIZE: usize = 4096;

/// Abstraction over the store holding index files.
///
/// `readv` performs vectored partial reads and returns `(offset, bytes)`
/// pairs for exactly the requested ranges. Implementations may fetch the
/// ranges however they like, but must not return short reads; a missing
/// file surfaces as a no-such-file error from any operation.
pub trait Transport: Send + Sync {
    /// Read an entire named object
    fn get_bytes(&self, name: &str) -> Result<Vec<u8>>;

    /// Read the given `(offset, length)` ranges of a named object
    fn readv(&self, name: &str, ranges: &[(u64, usize)]) -> Result<Vec<(u64, Vec<u8>)>>;

    /// Store a newly written object and return its length
    fn put_file(&self, name: &str, data: &mut dyn Read) -> Result<u64>;

    /// Hint, in bytes, for an efficient read batch size
    fn recommended_page_size(&self) -> usize {
        DEFAULT_RECOMMENDED_PAGE_SIZE
    }
}
