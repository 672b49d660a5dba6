//! # B+Tree Graph Index
//!
//! A persistent, immutable B+Tree index for sorted tuple-keyed records
//! with optional cross-record references: the storage layer underneath
//! a content-addressed version-control repository.
//!
//! ## Architecture
//!
//! The crate is composed of modular, swappable components:
//!
//! - **Page Codec** (`page`): compressed leaf/internal page framing and
//!   the budgeted chunk writer
//! - **Builder** (`builder`): streaming page emission with
//!   power-of-two disk spilling
//! - **Reader** (`reader`): LRU-cached, prefetch-aware lookup over an
//!   immutable index file
//! - **Flat Index** (`flat`): the legacy variable-length format, read
//!   by bisection
//! - **Combined Index** (`combined`): one query facade over a stack of
//!   indices
//! - **Transport** (`transport`): pluggable byte access (local disk,
//!   memory)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use btree_index::{BTreeBuilder, BTreeReader, BuilderConfig, Key, LocalTransport};
//! use std::sync::Arc;
//!
//! let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 0));
//! builder.add(Key::from_strs(&["a-key"]), b"a value".to_vec(), vec![])?;
//! let finished = builder.finish()?;
//!
//! let transport = Arc::new(LocalTransport::new("/srv/indices"));
//! let size = finished.store(transport.as_ref(), "example.bix")?;
//!
//! let reader = BTreeReader::open(transport, "example.bix", Some(size));
//! for entry in reader.iter_all()? {
//!     let entry = entry?;
//!     println!("{} -> {:?}", entry.key, entry.value);
//! }
//! ```

pub mod builder;
pub mod combined;
pub mod error;
pub mod flat;
pub mod page;
pub mod query;
pub mod reader;
pub mod transport;
pub mod types;

pub use error::{IndexError, Result};
pub use types::{
    BuilderConfig, Entry, Key, KeyPrefix, ReaderConfig, DEFAULT_NODE_CACHE_SIZE, DEFAULT_SPILL_AT,
    PAGE_SIZE, RESERVED_HEADER_BYTES,
};

// Re-export main public API
pub use builder::{BTreeBuilder, FinishedIndex};
pub use combined::{CombinedIndex, ReloadFn};
pub use flat::{FlatIndex, FlatIndexBuilder};
pub use query::Index;
pub use reader::BTreeReader;
pub use transport::{LocalTransport, MemoryTransport, Transport};
