//! k-way merge of sorted entry streams.
//!
//! Merging is by smallest key through a small binary heap; the same key
//! surfacing from two sources is a fatal duplicate, which is how the
//! builder's uniqueness invariant survives spills.

use crate::error::{IndexError, Result};
use crate::types::{Entry, Key};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

type EntrySource<'a> = Box<dyn Iterator<Item = Result<Entry>> + 'a>;

/// Merge sorted sources into one sorted stream.
///
/// A single source is passed through untouched (and unchecked, like the
/// in-memory iteration it comes from).
pub(crate) fn merged(mut sources: Vec<EntrySource<'_>>) -> Result<EntrySource<'_>> {
    if sources.len() == 1 {
        return Ok(sources.pop().expect("one source"));
    }
    Ok(Box::new(MergeIter::new(sources)?))
}

struct MergeIter<'a> {
    sources: Vec<EntrySource<'a>>,
    /// Current front entry of each source
    heads: Vec<Option<Entry>>,
    heap: BinaryHeap<Reverse<(Key, usize)>>,
    last: Option<Key>,
    failed: bool,
}

impl<'a> MergeIter<'a> {
    fn new(mut sources: Vec<EntrySource<'a>>) -> Result<Self> {
        let mut heads = Vec::with_capacity(sources.len());
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (i, source) in sources.iter_mut().enumerate() {
            match source.next() {
                Some(Ok(entry)) => {
                    heap.push(Reverse((entry.key.clone(), i)));
                    heads.push(Some(entry));
                }
                Some(Err(e)) => return Err(e),
                None => heads.push(None),
            }
        }
        Ok(Self {
            sources,
            heads,
            heap,
            last: None,
            failed: false,
        })
    }
}

impl Iterator for MergeIter<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let Reverse((key, source_idx)) = self.heap.pop()?;
        let entry = self.heads[source_idx].take().expect("head primed");
        if self.last.as_ref() == Some(&key) {
            self.failed = true;
            return Some(Err(IndexError::DuplicateKey(key)));
        }
        self.last = Some(key);
        match self.sources[source_idx].next() {
            Some(Ok(next_entry)) => {
                self.heap.push(Reverse((next_entry.key.clone(), source_idx)));
                self.heads[source_idx] = Some(next_entry);
            }
            Some(Err(e)) => {
                self.failed = true;
                return Some(Err(e));
            }
            None => {}
        }
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(keys: &[&str]) -> EntrySource<'static> {
        let entries: Vec<Result<Entry>> = keys
            .iter()
            .map(|k| Ok(Entry::new(Key::from_strs(&[k]), format!("v-{}", k))))
            .collect();
        Box::new(entries.into_iter())
    }

    fn merged_keys(sources: Vec<EntrySource<'static>>) -> Result<Vec<String>> {
        merged(sources)?
            .map(|e| e.map(|e| String::from_utf8_lossy(&e.key.elements()[0]).into_owned()))
            .collect()
    }

    #[test]
    fn test_merge_interleaves_by_key() -> Result<()> {
        let keys = merged_keys(vec![
            source(&["a", "d", "e"]),
            source(&["b", "f"]),
            source(&["c"]),
        ])?;
        assert_eq!(keys, vec!["a", "b", "c", "d", "e", "f"]);
        Ok(())
    }

    #[test]
    fn test_merge_with_empty_sources() -> Result<()> {
        let keys = merged_keys(vec![source(&[]), source(&["a", "b"]), source(&[])])?;
        assert_eq!(keys, vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn test_duplicate_across_sources_is_fatal() {
        let result = merged_keys(vec![source(&["a", "b"]), source(&["b", "c"])]);
        assert!(matches!(result, Err(IndexError::DuplicateKey(_))));
    }

    #[test]
    fn test_single_source_passthrough_skips_duplicate_check() -> Result<()> {
        // one source is trusted; only cross-source merges police keys
        let keys = merged_keys(vec![source(&["a", "a"])])?;
        assert_eq!(keys, vec!["a", "a"]);
        Ok(())
    }
}
