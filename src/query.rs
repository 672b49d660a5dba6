//! The query interface shared by builders and readers.
//!
//! Builders (over memory plus spilled backings) and on-disk readers
//! answer the same five questions, so the combined index can stack any
//! mix of them.

use crate::error::{IndexError, Result};
use crate::types::{Entry, Key, KeyElement, KeyPrefix};
use std::collections::HashMap;

/// Query operations common to builders and readers.
pub trait Index {
    /// Yield every record in ascending key order.
    fn iter_all<'a>(&'a self) -> Result<Box<dyn Iterator<Item = Result<Entry>> + 'a>>;

    /// Return the records whose keys appear in `keys`. Each match is
    /// returned once; no order is guaranteed.
    fn lookup(&self, keys: &[Key]) -> Result<Vec<Entry>>;

    /// Return the records matching the given prefix probes. Matching is
    /// applied per key element, never within an element.
    fn lookup_prefix(&self, prefixes: &[KeyPrefix]) -> Result<Vec<Entry>>;

    /// Exact number of records in this index.
    fn key_count(&self) -> Result<u64>;

    /// Check that everything in the index can be read and parsed.
    fn validate(&self) -> Result<()>;
}

/// Nested per-element map used for prefix matching over multi-element
/// keys.
pub(crate) enum KeyTrie {
    Branch(HashMap<KeyElement, KeyTrie>),
    Leaf(Entry),
}

impl KeyTrie {
    pub(crate) fn new() -> Self {
        KeyTrie::Branch(HashMap::new())
    }

    /// Build a trie from entries
    pub(crate) fn build(entries: impl IntoIterator<Item = Entry>) -> Self {
        let mut trie = Self::new();
        for entry in entries {
            trie.insert(entry);
        }
        trie
    }

    /// Insert one entry; branches are created for all but the last
    /// key element.
    pub(crate) fn insert(&mut self, entry: Entry) {
        let elements = entry.key.elements().to_vec();
        let (last, prefix) = elements.split_last().expect("keys are non-empty");
        let mut node = self;
        for element in prefix {
            match node {
                KeyTrie::Branch(map) => {
                    node = map.entry(element.clone()).or_insert_with(KeyTrie::new);
                }
                // a full key equalling another key's prefix is ruled
                // out by the fixed arity
                KeyTrie::Leaf(_) => return,
            }
        }
        if let KeyTrie::Branch(map) = node {
            map.insert(last.clone(), KeyTrie::Leaf(entry));
        }
    }

    /// Collect entries matching a probe into `out`
    pub(crate) fn match_prefix(&self, prefix: &KeyPrefix, out: &mut Vec<Entry>) {
        let mut node = self;
        for element in prefix.fixed_elements() {
            match node {
                KeyTrie::Branch(map) => match map.get(element) {
                    Some(child) => node = child,
                    None => return,
                },
                KeyTrie::Leaf(_) => return,
            }
        }
        node.collect_all(out);
    }

    fn collect_all(&self, out: &mut Vec<Entry>) {
        match self {
            KeyTrie::Leaf(entry) => out.push(entry.clone()),
            KeyTrie::Branch(map) => {
                for child in map.values() {
                    child.collect_all(out);
                }
            }
        }
    }
}

/// Validate one prefix probe against the index arity: the arity must
/// match and the first element may not be wildcarded.
pub(crate) fn check_prefix(prefix: &KeyPrefix, key_elements: usize) -> Result<()> {
    if prefix.len() != key_elements {
        return Err(IndexError::bad_key(format!(
            "prefix has {} elements, index has {}",
            prefix.len(),
            key_elements
        )));
    }
    if prefix.elements().first().map_or(true, |e| e.is_none()) {
        return Err(IndexError::bad_key(
            "first element of a prefix probe cannot be wildcarded",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(elements: &[&str], value: &str) -> Entry {
        Entry::new(Key::from_strs(elements), value)
    }

    #[test]
    fn test_trie_prefix_matching() {
        let trie = KeyTrie::build(vec![
            entry(&["foo", "bar"], "1"),
            entry(&["foo", "baz"], "2"),
            entry(&["foobar", "gam"], "3"),
        ]);

        // ("foo", *) matches within elements, not within bytestrings
        let mut out = Vec::new();
        trie.match_prefix(&KeyPrefix::from_strs(&[Some("foo"), None]), &mut out);
        let mut keys: Vec<Key> = out.iter().map(|e| e.key.clone()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![Key::from_strs(&["foo", "bar"]), Key::from_strs(&["foo", "baz"])]
        );

        // fully-fixed probe matches exactly one
        let mut out = Vec::new();
        trie.match_prefix(&KeyPrefix::from_strs(&[Some("foobar"), Some("gam")]), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, b"3");

        // no match
        let mut out = Vec::new();
        trie.match_prefix(&KeyPrefix::from_strs(&[Some("quux"), None]), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_check_prefix() {
        assert!(check_prefix(&KeyPrefix::from_strs(&[Some("a"), None]), 2).is_ok());
        assert!(check_prefix(&KeyPrefix::from_strs(&[None, Some("a")]), 2).is_err());
        assert!(check_prefix(&KeyPrefix::from_strs(&[Some("a")]), 2).is_err());
    }
}
