//! A single logical index over an ordered list of child indices.
//!
//! Queries walk the children in order and keep the first occurrence of
//! each key, so earlier children shadow later ones. When a child's
//! backing file disappears underneath it (a compaction elsewhere
//! replaced it), a reload hook gets the chance to swap in a fresh child
//! list; if it reports a change the query restarts, otherwise the
//! original error propagates.

use crate::error::{IndexError, Result};
use crate::query::Index;
use crate::types::{Entry, Key, KeyPrefix};
use log::debug;
use std::collections::HashSet;

/// Hook invoked when a child index is missing. Returns true if it
/// changed the child list.
pub type ReloadFn = Box<dyn FnMut(&mut Vec<Box<dyn Index>>) -> bool>;

/// The union of an ordered list of child indices.
pub struct CombinedIndex {
    children: Vec<Box<dyn Index>>,
    reload: Option<ReloadFn>,
}

impl CombinedIndex {
    /// Combine children; queries hit earlier children first
    pub fn new(children: Vec<Box<dyn Index>>) -> Self {
        Self {
            children,
            reload: None,
        }
    }

    /// Combine children with a reload hook for vanished backing files
    pub fn with_reload(children: Vec<Box<dyn Index>>, reload: ReloadFn) -> Self {
        Self {
            children,
            reload: Some(reload),
        }
    }

    /// Number of children currently stacked
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True if no children are stacked
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Insert a child at `pos` in the query order
    pub fn insert_index(&mut self, pos: usize, index: Box<dyn Index>) {
        self.children.insert(pos, index);
    }

    /// All records across all children, first occurrence of each key
    /// winning. Order is child-list order, then per-child key order.
    pub fn iter_all(&mut self) -> Result<Vec<Entry>> {
        let mut seen: HashSet<Key> = HashSet::new();
        let mut out = Vec::new();
        loop {
            let mut restart = false;
            let mut child = 0;
            while child < self.children.len() {
                match collect_child_all(&*self.children[child], &mut seen, &mut out) {
                    Ok(()) => child += 1,
                    Err(e) if e.is_no_such_file() => {
                        self.reload_or_raise(e)?;
                        restart = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !restart {
                return Ok(out);
            }
        }
    }

    /// Records for the given keys; each key is answered by the first
    /// child holding it.
    pub fn lookup(&mut self, keys: &[Key]) -> Result<Vec<Entry>> {
        let mut remaining: Vec<Key> = keys.to_vec();
        remaining.sort_unstable();
        remaining.dedup();
        let mut out = Vec::new();
        loop {
            let mut restart = false;
            let mut child = 0;
            while child < self.children.len() && !remaining.is_empty() {
                match self.children[child].lookup(&remaining) {
                    Ok(found) => {
                        for entry in found {
                            remaining.retain(|k| k != &entry.key);
                            out.push(entry);
                        }
                        child += 1;
                    }
                    Err(e) if e.is_no_such_file() => {
                        self.reload_or_raise(e)?;
                        restart = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !restart {
                return Ok(out);
            }
        }
    }

    /// Prefix matches across all children, deduplicated by key
    pub fn lookup_prefix(&mut self, prefixes: &[KeyPrefix]) -> Result<Vec<Entry>> {
        let mut seen: HashSet<Key> = HashSet::new();
        let mut out = Vec::new();
        loop {
            let mut restart = false;
            let mut child = 0;
            while child < self.children.len() {
                match self.children[child].lookup_prefix(prefixes) {
                    Ok(found) => {
                        for entry in found {
                            if seen.insert(entry.key.clone()) {
                                out.push(entry);
                            }
                        }
                        child += 1;
                    }
                    Err(e) if e.is_no_such_file() => {
                        self.reload_or_raise(e)?;
                        restart = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !restart {
                return Ok(out);
            }
        }
    }

    /// Sum of the children's key counts.
    ///
    /// Keys shared between children are counted once per child; the
    /// sum is cheap and an upper bound, which is all callers need.
    pub fn key_count(&mut self) -> Result<u64> {
        loop {
            let mut total = 0u64;
            let mut restart = false;
            let mut child = 0;
            while child < self.children.len() {
                match self.children[child].key_count() {
                    Ok(count) => {
                        total += count;
                        child += 1;
                    }
                    Err(e) if e.is_no_such_file() => {
                        self.reload_or_raise(e)?;
                        restart = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !restart {
                return Ok(total);
            }
        }
    }

    /// Validate every child
    pub fn validate(&mut self) -> Result<()> {
        loop {
            let mut restart = false;
            let mut child = 0;
            while child < self.children.len() {
                match self.children[child].validate() {
                    Ok(()) => child += 1,
                    Err(e) if e.is_no_such_file() => {
                        self.reload_or_raise(e)?;
                        restart = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !restart {
                return Ok(());
            }
        }
    }

    /// Give the reload hook a chance after a missing backing file; if
    /// nothing changed, the error stands.
    fn reload_or_raise(&mut self, error: IndexError) -> Result<()> {
        let Some(reload) = self.reload.as_mut() else {
            return Err(error);
        };
        debug!("trying to reload after: {}", error);
        if reload(&mut self.children) {
            Ok(())
        } else {
            debug!("reload changed nothing, raising the original error");
            Err(error)
        }
    }
}

fn collect_child_all(
    child: &dyn Index,
    seen: &mut HashSet<Key>,
    out: &mut Vec<Entry>,
) -> Result<()> {
    for entry in child.iter_all()? {
        let entry = entry?;
        if seen.insert(entry.key.clone()) {
            out.push(entry);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BTreeBuilder;
    use crate::reader::BTreeReader;
    use crate::transport::MemoryTransport;
    use crate::types::BuilderConfig;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn key(s: &str) -> Key {
        Key::from_strs(&[s])
    }

    fn store_index(
        transport: &Arc<MemoryTransport>,
        name: &str,
        records: &[(&str, &str)],
    ) -> Box<dyn Index> {
        let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 0));
        for (k, v) in records {
            builder.add(key(k), v.as_bytes().to_vec(), vec![]).unwrap();
        }
        let finished = builder.finish().unwrap();
        let size = finished.size();
        transport.put_bytes(name, finished.bytes().unwrap());
        Box::new(BTreeReader::open(transport.clone(), name, Some(size)))
    }

    #[test]
    fn test_first_child_wins() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let a = store_index(&transport, "a", &[("shared", "from-a"), ("only-a", "1")]);
        let b = store_index(&transport, "b", &[("shared", "from-b"), ("only-b", "2")]);
        let mut combined = CombinedIndex::new(vec![a, b]);

        let all = combined.iter_all()?;
        assert_eq!(all.len(), 3);
        let shared = all.iter().find(|e| e.key == key("shared")).unwrap();
        assert_eq!(shared.value, b"from-a");

        let found = combined.lookup(&[key("shared"), key("only-b")])?;
        assert_eq!(found.len(), 2);
        assert_eq!(
            found.iter().find(|e| e.key == key("shared")).unwrap().value,
            b"from-a"
        );
        Ok(())
    }

    #[test]
    fn test_key_count_is_summed() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let a = store_index(&transport, "a", &[("shared", "x"), ("only-a", "1")]);
        let b = store_index(&transport, "b", &[("shared", "x")]);
        let mut combined = CombinedIndex::new(vec![a, b]);
        // shared keys are deliberately double-counted
        assert_eq!(combined.key_count()?, 3);
        Ok(())
    }

    #[test]
    fn test_missing_child_without_reload_raises() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let a = store_index(&transport, "a", &[("in-a", "1")]);
        let b = store_index(&transport, "b", &[("in-b", "2")]);
        transport.remove("a");
        let mut combined = CombinedIndex::new(vec![a, b]);
        let err = combined.lookup(&[key("in-a")]).unwrap_err();
        assert!(err.is_no_such_file());
        Ok(())
    }

    #[test]
    fn test_reload_hook_replaces_children_and_restarts() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let a = store_index(&transport, "a", &[("in-a", "1")]);
        let b = store_index(&transport, "b", &[("in-b", "2")]);
        // c replaces both after "compaction"
        let c = store_index(&transport, "c", &[("in-a", "1"), ("in-b", "2")]);
        transport.remove("a");

        let reload_count = Rc::new(Cell::new(0));
        let counter = reload_count.clone();
        let mut replacement = Some(c);
        let mut combined = CombinedIndex::with_reload(
            vec![a, b],
            Box::new(move |children| {
                counter.set(counter.get() + 1);
                match replacement.take() {
                    Some(c) => {
                        *children = vec![c];
                        true
                    }
                    None => false,
                }
            }),
        );

        let found = combined.lookup(&[key("in-a")])?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, b"1");
        assert_eq!(reload_count.get(), 1);
        Ok(())
    }

    #[test]
    fn test_reload_hook_reporting_no_change_reraises() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let a = store_index(&transport, "a", &[("in-a", "1")]);
        transport.remove("a");

        let mut combined =
            CombinedIndex::with_reload(vec![a], Box::new(|_children| false));
        let err = combined.iter_all().unwrap_err();
        assert!(err.is_no_such_file());
        Ok(())
    }

    #[test]
    fn test_builder_stacks_as_child() -> Result<()> {
        // a mutable builder and an immutable reader behind one facade
        let transport = Arc::new(MemoryTransport::new());
        let reader = store_index(&transport, "a", &[("old", "disk")]);
        let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 0));
        builder.add(key("new"), b"memory".to_vec(), vec![])?;

        let children: Vec<Box<dyn Index>> = vec![Box::new(builder), reader];
        let mut combined = CombinedIndex::new(children);
        assert_eq!(combined.key_count()?, 2);
        let all = combined.iter_all()?;
        assert_eq!(all.len(), 2);
        Ok(())
    }

    #[test]
    fn test_insert_index_changes_precedence() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let a = store_index(&transport, "a", &[("shared", "from-a")]);
        let b = store_index(&transport, "b", &[("shared", "from-b")]);
        let mut combined = CombinedIndex::new(vec![a]);
        combined.insert_index(0, b);
        assert_eq!(combined.len(), 2);
        let found = combined.lookup(&[key("shared")])?;
        assert_eq!(found[0].value, b"from-b");
        Ok(())
    }
}
