//! Common types used throughout the index crate.

use crate::error::{IndexError, Result};
use std::fmt;

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Space reserved at the front of the file for the header
pub const RESERVED_HEADER_BYTES: usize = 120;

/// Default leaf-page LRU capacity (4K per page: roughly 4MB)
pub const DEFAULT_NODE_CACHE_SIZE: usize = 1000;

/// Default number of in-memory records before the builder spills to disk
pub const DEFAULT_SPILL_AT: usize = 100_000;

/// One element of a key tuple
pub type KeyElement = Vec<u8>;

/// An ordered tuple of byte-string key elements.
///
/// Every key in a given index has the same number of elements. Elements
/// must be non-empty and free of NUL, TAB, LF, VT, FF, CR and space.
/// Keys order lexicographically, element by element.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<KeyElement>);

impl Key {
    /// Create a key from its elements
    pub fn new(elements: Vec<KeyElement>) -> Self {
        Self(elements)
    }

    /// Create a key from string slices
    pub fn from_strs(elements: &[&str]) -> Self {
        Self(elements.iter().map(|e| e.as_bytes().to_vec()).collect())
    }

    /// The elements of this key
    pub fn elements(&self) -> &[KeyElement] {
        &self.0
    }

    /// Number of elements in this key
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the key has no elements
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialise the key as elements joined by NUL
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.iter().map(|e| e.len() + 1).sum());
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(0);
            }
            out.extend_from_slice(element);
        }
        out
    }

    /// Parse a serialised key by splitting on NUL
    pub fn parse(bytes: &[u8]) -> Self {
        Self(bytes.split(|&b| b == 0).map(|e| e.to_vec()).collect())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(")?;
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", String::from_utf8_lossy(element))?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", String::from_utf8_lossy(element))?;
        }
        write!(f, ")")
    }
}

/// A key probe with trailing elements wildcarded.
///
/// Leading elements are fixed; a `None` element and everything after it
/// match any suffix. The first element may not be a wildcard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPrefix(Vec<Option<KeyElement>>);

impl KeyPrefix {
    /// Create a prefix probe from its elements
    pub fn new(elements: Vec<Option<KeyElement>>) -> Self {
        Self(elements)
    }

    /// Create a prefix probe from string slices, `None` for wildcards
    pub fn from_strs(elements: &[Option<&str>]) -> Self {
        Self(
            elements
                .iter()
                .map(|e| e.map(|s| s.as_bytes().to_vec()))
                .collect(),
        )
    }

    /// The elements of this probe
    pub fn elements(&self) -> &[Option<KeyElement>] {
        &self.0
    }

    /// Number of elements (fixed plus wildcarded)
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the probe has no elements
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The leading fixed elements, up to the first wildcard
    pub fn fixed_elements(&self) -> impl Iterator<Item = &KeyElement> {
        self.0.iter().map_while(|e| e.as_ref())
    }

    /// True if every element is fixed
    pub fn is_full_key(&self) -> bool {
        self.0.iter().all(|e| e.is_some())
    }

    /// The full key, if no element is wildcarded
    pub fn as_full_key(&self) -> Option<Key> {
        if self.is_full_key() {
            Some(Key::new(self.0.iter().map(|e| e.clone().unwrap()).collect()))
        } else {
            None
        }
    }
}

/// A record: key, opaque value, and one list of references per
/// configured reference list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// The record's key
    pub key: Key,
    /// Opaque value bytes (no NUL, no LF)
    pub value: Vec<u8>,
    /// Reference lists, each a list of keys in this index
    pub refs: Vec<Vec<Key>>,
}

impl Entry {
    /// Create an entry with no references
    pub fn new(key: Key, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            value: value.into(),
            refs: Vec::new(),
        }
    }

    /// Create an entry with references
    pub fn with_refs(key: Key, value: impl Into<Vec<u8>>, refs: Vec<Vec<Key>>) -> Self {
        Self {
            key,
            value: value.into(),
            refs,
        }
    }
}

/// Bytes that may not appear in a key element
const FORBIDDEN_KEY_BYTES: &[u8] = b"\t\n\x0b\x0c\r\x00 ";

/// Check that a key has the right arity and clean elements
pub fn check_key(key: &Key, key_elements: usize) -> Result<()> {
    if key.len() != key_elements {
        return Err(IndexError::bad_key(format!(
            "{} has {} elements, index has {}",
            key,
            key.len(),
            key_elements
        )));
    }
    for element in key.elements() {
        if element.is_empty() {
            return Err(IndexError::bad_key(format!("{} has an empty element", key)));
        }
        if element.iter().any(|b| FORBIDDEN_KEY_BYTES.contains(b)) {
            return Err(IndexError::bad_key(format!(
                "{} contains a forbidden byte",
                key
            )));
        }
    }
    Ok(())
}

/// Check that a value contains neither NUL nor newline
pub fn check_value(value: &[u8]) -> Result<()> {
    if value.iter().any(|&b| b == 0 || b == b'\n') {
        return Err(IndexError::BadValue(
            String::from_utf8_lossy(value).into_owned(),
        ));
    }
    Ok(())
}

/// Check a key, its value, and the shape and contents of its reference
/// lists against the index configuration.
pub fn check_entry(key: &Key, value: &[u8], refs: &[Vec<Key>], key_elements: usize, ref_lists: usize) -> Result<()> {
    check_key(key, key_elements)?;
    check_value(value)?;
    if refs.len() != ref_lists {
        return Err(IndexError::BadRefLists {
            expected: ref_lists,
            actual: refs.len(),
        });
    }
    for ref_list in refs {
        for reference in ref_list {
            check_key(reference, key_elements)?;
        }
    }
    Ok(())
}

/// Builder configuration
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Number of elements in every key
    pub key_elements: usize,
    /// Number of reference lists per record
    pub ref_lists: usize,
    /// In-memory record cap before spilling to disk
    pub spill_at: usize,
    /// Spend CPU to make pages smaller
    pub optimize_for_size: bool,
}

impl BuilderConfig {
    /// Create a configuration with default spill and compression settings
    pub fn new(key_elements: usize, ref_lists: usize) -> Self {
        Self {
            key_elements,
            ref_lists,
            spill_at: DEFAULT_SPILL_AT,
            optimize_for_size: false,
        }
    }

    /// Set the spill threshold
    pub fn spill_at(mut self, spill_at: usize) -> Self {
        self.spill_at = spill_at;
        self
    }

    /// Trade CPU for smaller pages
    pub fn optimize_for_size(mut self, enabled: bool) -> Self {
        self.optimize_for_size = enabled;
        self
    }
}

/// Reader configuration
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Leaf-page LRU capacity
    pub node_cache_size: usize,
    /// Cache key to value mappings directly, bypassing the tree on hit
    pub leaf_value_cache: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            node_cache_size: DEFAULT_NODE_CACHE_SIZE,
            leaf_value_cache: false,
        }
    }
}

impl ReaderConfig {
    /// Set the leaf-page LRU capacity
    pub fn node_cache_size(mut self, size: usize) -> Self {
        self.node_cache_size = size;
        self
    }

    /// Enable the direct key to value cache
    pub fn leaf_value_cache(mut self, enabled: bool) -> Self {
        self.leaf_value_cache = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let a = Key::from_strs(&["a", "b"]);
        let b = Key::from_strs(&["a", "c"]);
        let c = Key::from_strs(&["b", "a"]);
        assert!(a < b);
        assert!(b < c);
        // element-wise, not concatenated: ("ab","a") sorts before ("b","a")
        let d = Key::from_strs(&["ab", "a"]);
        assert!(a < d);
        assert!(d < c);
    }

    #[test]
    fn test_key_serialize_parse() {
        let key = Key::from_strs(&["rev", "id-1"]);
        let bytes = key.serialize();
        assert_eq!(bytes, b"rev\x00id-1");
        assert_eq!(Key::parse(&bytes), key);
    }

    #[test]
    fn test_check_key_rejects_bad_bytes() {
        for bad in ["a\tkey", "a\nkey", "a\x0bkey", "a\x0ckey", "a\rkey", "a\x00key", "a key"] {
            let key = Key::new(vec![bad.as_bytes().to_vec()]);
            assert!(check_key(&key, 1).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_check_key_rejects_empty_element_and_bad_arity() {
        assert!(check_key(&Key::from_strs(&[""]), 1).is_err());
        assert!(check_key(&Key::from_strs(&["a", "b"]), 1).is_err());
        assert!(check_key(&Key::from_strs(&["a"]), 2).is_err());
        assert!(check_key(&Key::from_strs(&["a"]), 1).is_ok());
    }

    #[test]
    fn test_check_value() {
        assert!(check_value(b"anything goes\texcept").is_ok());
        assert!(check_value(b"no\nnewline").is_err());
        assert!(check_value(b"no\x00nul").is_err());
    }

    #[test]
    fn test_check_entry_ref_shape() {
        let key = Key::from_strs(&["k"]);
        let r = Key::from_strs(&["r"]);
        assert!(check_entry(&key, b"v", &[], 1, 0).is_ok());
        assert!(check_entry(&key, b"v", &[vec![r.clone()]], 1, 0).is_err());
        assert!(check_entry(&key, b"v", &[vec![r.clone()]], 1, 1).is_ok());
        // reference keys are validated too
        let bad_ref = Key::from_strs(&["has space"]);
        assert!(check_entry(&key, b"v", &[vec![bad_ref]], 1, 1).is_err());
    }

    #[test]
    fn test_prefix_fixed_elements() {
        let p = KeyPrefix::from_strs(&[Some("a"), None]);
        let fixed: Vec<_> = p.fixed_elements().cloned().collect();
        assert_eq!(fixed, vec![b"a".to_vec()]);
        assert!(!p.is_full_key());
        let full = KeyPrefix::from_strs(&[Some("a"), Some("b")]);
        assert_eq!(full.as_full_key(), Some(Key::from_strs(&["a", "b"])));
    }
}
