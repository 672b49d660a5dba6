//! The B+Tree index builder.
//!
//! Records accumulate in memory in any order; when the in-memory set
//! reaches `spill_at` they are merged with previously spilled runs into
//! a new on-disk sub-index following a power-of-two slot scheme, so at
//! most log2(N / spill_at) backing indices are ever live. `finish`
//! merges memory and every backing index into the final file.
//!
//! Page emission works bottom-up: records stream into the current leaf
//! page; when one does not fit, the page is sealed and the offending
//! record's key propagates upward as a boundary key, growing new
//! internal rows above the root as needed.

mod merge;

use merge::merged;

use crate::error::{IndexError, Result};
use crate::page::{serialize_leaf_line, ChunkWriter, BTREE_SIGNATURE, INTERNAL_FLAG, LEAF_FLAG};
use crate::query::{check_prefix, Index, KeyTrie};
use crate::reader::BTreeReader;
use crate::transport::{LocalTransport, Transport};
use crate::types::{
    check_entry, BuilderConfig, Entry, Key, KeyPrefix, PAGE_SIZE, RESERVED_HEADER_BYTES,
};
use log::debug;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};

type NodeValue = (Vec<Vec<Key>>, Vec<u8>);
type EntrySource<'a> = Box<dyn Iterator<Item = Result<Entry>> + 'a>;

/// Builds an immutable B+Tree index.
pub struct BTreeBuilder {
    key_elements: usize,
    ref_lists: usize,
    spill_at: usize,
    optimize_for_size: bool,
    /// In-memory records, sorted by key
    nodes: BTreeMap<Key, NodeValue>,
    /// Spilled sub-indices; merged slots are None
    backing: Vec<Option<BTreeReader>>,
    /// Lazily built prefix trie; dropped on spill
    nodes_by_key: Mutex<Option<KeyTrie>>,
    spill_dir: Option<TempDir>,
    spill_transport: Option<Arc<LocalTransport>>,
    spill_count: usize,
}

impl BTreeBuilder {
    /// Create a builder for the given index shape
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            key_elements: config.key_elements,
            ref_lists: config.ref_lists,
            spill_at: config.spill_at,
            optimize_for_size: config.optimize_for_size,
            nodes: BTreeMap::new(),
            backing: Vec::new(),
            nodes_by_key: Mutex::new(None),
            spill_dir: None,
            spill_transport: None,
            spill_count: 0,
        }
    }

    /// Add a record.
    ///
    /// The key must match the index arity and byte rules, the value may
    /// not contain NUL or LF, and `refs` must hold exactly as many
    /// lists as configured. Adding a key twice is a fatal error. May
    /// trigger a spill to disk.
    pub fn add(&mut self, key: Key, value: Vec<u8>, refs: Vec<Vec<Key>>) -> Result<()> {
        check_entry(&key, &value, &refs, self.key_elements, self.ref_lists)?;
        if self.nodes.contains_key(&key) {
            return Err(IndexError::DuplicateKey(key));
        }
        if self.key_elements > 1 {
            if let Some(trie) = self.nodes_by_key.get_mut().as_mut() {
                trie.insert(Entry {
                    key: key.clone(),
                    value: value.clone(),
                    refs: refs.clone(),
                });
            }
        }
        self.nodes.insert(key, (refs, value));
        if self.nodes.len() < self.spill_at {
            return Ok(());
        }
        self.spill()
    }

    /// Add a batch of entries
    pub fn add_entries(&mut self, entries: impl IntoIterator<Item = Entry>) -> Result<()> {
        for entry in entries {
            self.add(entry.key, entry.value, entry.refs)?;
        }
        Ok(())
    }

    /// Merge memory and all backing indices into the final index file.
    pub fn finish(mut self) -> Result<FinishedIndex> {
        let mem = std::mem::take(&mut self.nodes);
        let mut file = NamedTempFile::new()?;
        let (size, key_count) = {
            let sources = self.merge_sources(mem, self.backing.len())?;
            write_pages(
                merged(sources)?,
                self.ref_lists,
                self.key_elements,
                self.optimize_for_size,
                file.as_file_mut(),
            )?
        };
        Ok(FinishedIndex {
            file,
            size,
            key_count,
        })
    }

    /// Exact number of records across memory and backings
    pub fn key_count(&self) -> Result<u64> {
        let mut total = self.nodes.len() as u64;
        for backing in self.backing.iter().flatten() {
            total += backing.key_count()?;
        }
        Ok(total)
    }

    /// Yield all records in key order, merging memory and backings
    pub fn iter_all(&self) -> Result<EntrySource<'_>> {
        let mut sources: Vec<EntrySource<'_>> = Vec::new();
        sources.push(Box::new(self.nodes.iter().map(|(key, (refs, value))| {
            Ok(Entry {
                key: key.clone(),
                value: value.clone(),
                refs: refs.clone(),
            })
        })));
        for backing in self.backing.iter().flatten() {
            sources.push(Box::new(backing.iter_all()?));
        }
        merged(sources)
    }

    /// Return the records whose keys appear in `keys`, once each
    pub fn lookup(&self, keys: &[Key]) -> Result<Vec<Entry>> {
        let mut remaining: Vec<Key> = keys.to_vec();
        remaining.sort_unstable();
        remaining.dedup();
        let mut out = Vec::new();
        remaining.retain(|key| match self.nodes.get(key) {
            Some((refs, value)) => {
                out.push(Entry {
                    key: key.clone(),
                    value: value.clone(),
                    refs: refs.clone(),
                });
                false
            }
            None => true,
        });
        for backing in self.backing.iter().flatten() {
            if remaining.is_empty() {
                break;
            }
            for entry in backing.lookup(&remaining)? {
                remaining.retain(|k| k != &entry.key);
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Return the records matching the prefix probes
    pub fn lookup_prefix(&self, prefixes: &[KeyPrefix]) -> Result<Vec<Entry>> {
        if prefixes.is_empty() {
            return Ok(Vec::new());
        }
        for prefix in prefixes {
            check_prefix(prefix, self.key_elements)?;
        }
        let mut unique: Vec<&KeyPrefix> = Vec::new();
        for prefix in prefixes {
            if !unique.contains(&prefix) {
                unique.push(prefix);
            }
        }
        let mut out = Vec::new();
        for backing in self.backing.iter().flatten() {
            out.extend(backing.lookup_prefix(prefixes)?);
        }
        if self.key_elements == 1 {
            for prefix in unique {
                let key = prefix.as_full_key().expect("checked: arity 1, first fixed");
                if let Some((refs, value)) = self.nodes.get(&key) {
                    out.push(Entry {
                        key,
                        value: value.clone(),
                        refs: refs.clone(),
                    });
                }
            }
            return Ok(out);
        }
        let mut trie = self.nodes_by_key.lock();
        let trie = trie.get_or_insert_with(|| {
            KeyTrie::build(self.nodes.iter().map(|(key, (refs, value))| Entry {
                key: key.clone(),
                value: value.clone(),
                refs: refs.clone(),
            }))
        });
        for prefix in unique {
            trie.match_prefix(prefix, &mut out);
        }
        Ok(out)
    }

    /// In-memory state has no corruption to find
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Write memory plus the leading run of backing indices into a new
    /// backing slot, freeing the merged slots.
    fn spill(&mut self) -> Result<()> {
        let pos = self
            .backing
            .iter()
            .position(|b| b.is_none())
            .unwrap_or(self.backing.len());
        debug!(
            "spilling {} in-memory keys into backing slot {}",
            self.nodes.len(),
            pos
        );
        self.ensure_spill_dir()?;
        let transport = self.spill_transport.clone().expect("spill dir created");
        let name = format!("spill-{}.btx", self.spill_count);
        self.spill_count += 1;
        let mem = std::mem::take(&mut self.nodes);
        *self.nodes_by_key.get_mut() = None;

        let path = transport.root().join(&name);
        let size = {
            let mut file = File::create(&path)?;
            let sources = self.merge_sources(mem, pos)?;
            let (size, _) = write_pages(
                merged(sources)?,
                self.ref_lists,
                self.key_elements,
                self.optimize_for_size,
                &mut file,
            )?;
            size
        };
        let reader_transport: Arc<dyn Transport> = transport.clone();
        let reader = BTreeReader::open(reader_transport, name, Some(size));

        let merged_away: Vec<BTreeReader> = self.backing[..pos]
            .iter_mut()
            .filter_map(|slot| slot.take())
            .collect();
        if self.backing.len() == pos {
            self.backing.push(None);
        }
        self.backing[pos] = Some(reader);
        for old in merged_away {
            let old_path = transport.root().join(old.name());
            drop(old);
            let _ = std::fs::remove_file(old_path);
        }
        Ok(())
    }

    fn ensure_spill_dir(&mut self) -> Result<()> {
        if self.spill_dir.is_none() {
            let dir = tempfile::tempdir()?;
            self.spill_transport = Some(Arc::new(LocalTransport::new(dir.path())));
            self.spill_dir = Some(dir);
        }
        Ok(())
    }

    /// Sorted sources for a merge: memory first, then each live backing
    /// index among the first `upto` slots.
    fn merge_sources(
        &self,
        mem: BTreeMap<Key, NodeValue>,
        upto: usize,
    ) -> Result<Vec<EntrySource<'_>>> {
        let mut sources: Vec<EntrySource<'_>> = Vec::new();
        sources.push(Box::new(mem.into_iter().map(|(key, (refs, value))| {
            Ok(Entry { key, value, refs })
        })));
        for backing in self.backing[..upto].iter().flatten() {
            sources.push(Box::new(backing.iter_all()?));
        }
        Ok(sources)
    }

    #[cfg(test)]
    pub(crate) fn backing_slots(&self) -> Vec<Option<u64>> {
        self.backing
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .map(|reader| reader.key_count().expect("backing readable"))
            })
            .collect()
    }
}

impl Index for BTreeBuilder {
    fn iter_all<'a>(&'a self) -> Result<Box<dyn Iterator<Item = Result<Entry>> + 'a>> {
        BTreeBuilder::iter_all(self)
    }

    fn lookup(&self, keys: &[Key]) -> Result<Vec<Entry>> {
        BTreeBuilder::lookup(self, keys)
    }

    fn lookup_prefix(&self, prefixes: &[KeyPrefix]) -> Result<Vec<Entry>> {
        BTreeBuilder::lookup_prefix(self, prefixes)
    }

    fn key_count(&self) -> Result<u64> {
        BTreeBuilder::key_count(self)
    }

    fn validate(&self) -> Result<()> {
        BTreeBuilder::validate(self)
    }
}

/// A finalised index in a temporary file, unlinked on drop.
pub struct FinishedIndex {
    file: NamedTempFile,
    size: u64,
    key_count: u64,
}

impl FinishedIndex {
    /// Size of the index file in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of records written
    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    /// Path of the temporary file
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Read the whole index back
    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.file.path())?)
    }

    /// Store the index through a transport; returns the stored size
    pub fn store(&self, transport: &dyn Transport, name: &str) -> Result<u64> {
        let mut file = File::open(self.file.path())?;
        transport.put_file(name, &mut file)
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum RowKind {
    Leaf,
    Internal,
}

/// State accumulated while writing out one row of the tree
struct BuilderRow {
    kind: RowKind,
    /// Finished pages for this row, in order
    spool: File,
    /// Count of pages sealed so far
    nodes: usize,
    writer: Option<ChunkWriter>,
}

impl BuilderRow {
    fn new(kind: RowKind) -> Result<Self> {
        Ok(Self {
            kind,
            spool: tempfile::tempfile()?,
            nodes: 0,
            writer: None,
        })
    }

    /// Seal the active page into the spool. The first page of a row is
    /// prefixed with the reserved header space; an unpadded final leaf
    /// page drops the padding block.
    fn finish_node(&mut self, pad: bool) -> Result<()> {
        if !pad && self.kind == RowKind::Internal {
            return Err(IndexError::internal("internal pages are always padded"));
        }
        let writer = self
            .writer
            .take()
            .ok_or_else(|| IndexError::internal("no active page writer"))?;
        let (mut blocks, _unused, padding) = writer.finish()?;
        if self.nodes == 0 {
            self.spool.write_all(&[0u8; RESERVED_HEADER_BYTES])?;
        }
        let mut skipped = 0;
        if !pad && padding > 0 {
            blocks.pop();
            skipped = padding;
        }
        for block in &blocks {
            self.spool.write_all(block)?;
        }
        let position = self.spool.stream_position()? as usize;
        if (position + skipped) % PAGE_SIZE != 0 {
            return Err(IndexError::internal(format!(
                "incorrect page length: {} + {}",
                position, skipped
            )));
        }
        self.nodes += 1;
        Ok(())
    }
}

/// Append one serialised record to the tree, opening pages and growing
/// rows as needed.
fn add_record_to_rows(
    rows: &mut Vec<BuilderRow>,
    string_key: &[u8],
    line: &[u8],
    optimize_for_size: bool,
) -> Result<()> {
    loop {
        let leaf = rows.len() - 1;
        if rows[leaf].writer.is_none() {
            // opening a new leaf page; flesh out any internal pages
            // needed to preserve the height of the tree
            for pos in 0..leaf {
                if rows[pos].writer.is_none() {
                    let mut length = PAGE_SIZE;
                    if rows[pos].nodes == 0 {
                        length -= RESERVED_HEADER_BYTES;
                    }
                    let mut writer = ChunkWriter::new(length, 0, optimize_for_size);
                    writer.write(INTERNAL_FLAG)?;
                    writer.write(format!("offset={}\n", rows[pos + 1].nodes).as_bytes())?;
                    rows[pos].writer = Some(writer);
                }
            }
            let mut length = PAGE_SIZE;
            if rows[leaf].nodes == 0 {
                length -= RESERVED_HEADER_BYTES;
            }
            let mut writer = ChunkWriter::new(length, 0, optimize_for_size);
            writer.write(LEAF_FLAG)?;
            rows[leaf].writer = Some(writer);
        }
        let overflowed = rows[leaf]
            .writer
            .as_mut()
            .expect("leaf writer opened")
            .write(line)?;
        if !overflowed {
            return Ok(());
        }
        // the record did not fit: seal the leaf page and propagate its
        // key upward until a page has room for the division point
        rows[leaf].finish_node(true)?;
        let mut key_line = string_key.to_vec();
        key_line.push(b'\n');
        let mut need_new_root = true;
        for pos in (0..leaf).rev() {
            let overflowed = rows[pos]
                .writer
                .as_mut()
                .expect("internal writer open")
                .write(&key_line)?;
            if overflowed {
                rows[pos].finish_node(true)?;
            } else {
                need_new_root = false;
                break;
            }
        }
        if need_new_root {
            let mut new_root = BuilderRow::new(RowKind::Internal)?;
            let mut writer = ChunkWriter::new(PAGE_SIZE - RESERVED_HEADER_BYTES, 0, optimize_for_size);
            writer.write(INTERNAL_FLAG)?;
            writer.write(format!("offset={}\n", rows[0].nodes - 1).as_bytes())?;
            writer.write(&key_line)?;
            new_root.writer = Some(writer);
            rows.insert(0, new_root);
        }
        // retry the record against the fresh leaf page
    }
}

/// Write a sorted entry stream out as a complete B+Tree file.
///
/// Returns the file size and the record count.
fn write_pages(
    entries: impl Iterator<Item = Result<Entry>>,
    ref_lists: usize,
    key_elements: usize,
    optimize_for_size: bool,
    out: &mut File,
) -> Result<(u64, u64)> {
    let mut rows: Vec<BuilderRow> = Vec::new();
    let mut key_count: u64 = 0;
    for entry in entries {
        let entry = entry?;
        if key_count == 0 {
            rows.push(BuilderRow::new(RowKind::Leaf)?);
        }
        key_count += 1;
        let (string_key, line) = serialize_leaf_line(&entry);
        add_record_to_rows(&mut rows, &string_key, &line, optimize_for_size)?;
    }
    // leaf first, so boundary keys never propagate into sealed pages
    for row in rows.iter_mut().rev() {
        row.finish_node(row.kind == RowKind::Internal)?;
    }

    let mut header = Vec::new();
    header.extend_from_slice(BTREE_SIGNATURE);
    header.extend_from_slice(format!("node_ref_lists={}\n", ref_lists).as_bytes());
    header.extend_from_slice(format!("key_elements={}\n", key_elements).as_bytes());
    header.extend_from_slice(format!("len={}\n", key_count).as_bytes());
    let row_lengths: Vec<String> = rows.iter().map(|r| r.nodes.to_string()).collect();
    header.extend_from_slice(format!("row_lengths={}\n", row_lengths.join(",")).as_bytes());
    if header.len() > RESERVED_HEADER_BYTES {
        return Err(IndexError::HeaderTooLarge {
            size: header.len(),
            max: RESERVED_HEADER_BYTES,
        });
    }
    out.write_all(&header)?;
    let mut written = header.len() as u64;

    // the root row's first page follows the header directly; every
    // row's first page was budgeted PAGE_SIZE - 120 wide
    let mut position = header.len();
    for row in rows.iter_mut() {
        row.spool.flush()?;
        row.spool.seek(SeekFrom::Start(0))?;
        let mut first = vec![0u8; PAGE_SIZE];
        let got = read_up_to(&mut row.spool, &mut first)?;
        if got < RESERVED_HEADER_BYTES {
            return Err(IndexError::internal("spooled row shorter than reserved space"));
        }
        out.write_all(&first[RESERVED_HEADER_BYTES..got])?;
        written += (got - RESERVED_HEADER_BYTES) as u64;
        if got == PAGE_SIZE {
            // complete the first page slot; a short final leaf page is
            // left short
            let pad = RESERVED_HEADER_BYTES - position;
            out.write_all(&vec![0u8; pad])?;
            written += pad as u64;
        }
        position = 0;
        let copied = std::io::copy(&mut row.spool, out)?;
        written += copied;
        if row.kind == RowKind::Internal && copied != ((row.nodes - 1) * PAGE_SIZE) as u64 {
            return Err(IndexError::internal(format!(
                "incorrect amount of row data copied: expected {}, got {}",
                (row.nodes - 1) * PAGE_SIZE,
                copied
            )));
        }
    }
    out.flush()?;
    Ok((written, key_count))
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let got = reader.read(&mut buf[filled..])?;
        if got == 0 {
            break;
        }
        filled += got;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::decompress_page;
    use crate::transport::MemoryTransport;

    fn key(s: &str) -> Key {
        Key::from_strs(&[s])
    }

    #[test]
    fn test_empty_index_is_header_only() -> Result<()> {
        let builder = BTreeBuilder::new(BuilderConfig::new(1, 0));
        let finished = builder.finish()?;
        assert_eq!(finished.size(), 72);
        assert_eq!(finished.key_count(), 0);
        assert_eq!(
            finished.bytes()?,
            b"B+Tree Graph Index 2\nnode_ref_lists=0\nkey_elements=1\nlen=0\nrow_lengths=\n"
        );
        Ok(())
    }

    #[test]
    fn test_single_leaf_layout() -> Result<()> {
        let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 0));
        for i in 0..5u8 {
            let element = vec![b'0' + i; 40];
            builder.add(Key::new(vec![element]), format!("value:{}", i).into_bytes(), vec![])?;
        }
        let finished = builder.finish()?;
        let bytes = finished.bytes()?;

        let header_end = 73;
        assert_eq!(
            &bytes[..header_end],
            b"B+Tree Graph Index 2\nnode_ref_lists=0\nkey_elements=1\nlen=5\nrow_lengths=1\n"
        );
        // a lone short leaf page is written unpadded, straight after
        // the header
        assert!(bytes.len() < PAGE_SIZE);
        let mut expected = b"type=leaf\n".to_vec();
        for i in 0..5u8 {
            expected.extend_from_slice(&vec![b'0' + i; 40]);
            expected.extend_from_slice(format!("\x00\x00\x00value:{}\n", i).as_bytes());
        }
        assert_eq!(decompress_page("test", &bytes[header_end..])?, expected);
        Ok(())
    }

    #[test]
    fn test_two_row_layout() -> Result<()> {
        let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 0));
        for i in 0..400 {
            builder.add(
                Key::new(vec![format!("{}{}", i, "X".repeat(100)).into_bytes()]),
                format!("value:{}{}", i, "Y".repeat(100)).into_bytes(),
                vec![],
            )?;
        }
        let finished = builder.finish()?;
        let bytes = finished.bytes()?;

        // header names one root page and at least two leaf pages
        let (header, header_end) = crate::reader::parse_header("test", &bytes)?;
        assert_eq!(header.key_count, 400);
        assert_eq!(header.row_lengths.len(), 2);
        assert_eq!(header.row_lengths[0], 1);
        let leaf_pages = header.row_lengths[1];
        assert!(leaf_pages >= 2);

        // every page boundary is page-sized except the final leaf page
        let total_pages = 1 + leaf_pages;
        assert!(bytes.len() > (total_pages - 1) * PAGE_SIZE);
        assert!(bytes.len() <= total_pages * PAGE_SIZE);

        // the root page decompresses to boundary keys, starting at the
        // first child
        let root = decompress_page("test", &bytes[header_end..PAGE_SIZE])?;
        let root_text = String::from_utf8_lossy(&root);
        assert!(root_text.starts_with("type=internal\noffset=0\n"));
        assert_eq!(root_text.trim_end().lines().count(), 2 + (leaf_pages - 1));
        Ok(())
    }

    #[test]
    fn test_round_trip_with_references() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let mut builder = BTreeBuilder::new(BuilderConfig::new(2, 2));
        let mut expected = Vec::new();
        for i in 0..50 {
            let k = Key::from_strs(&["file", &format!("rev-{:03}", i)]);
            let refs = if i == 0 {
                vec![vec![], vec![]]
            } else {
                vec![
                    vec![Key::from_strs(&["file", &format!("rev-{:03}", i - 1)])],
                    vec![],
                ]
            };
            builder.add(k.clone(), format!("v{}", i).into_bytes(), refs.clone())?;
            expected.push(Entry::with_refs(k, format!("v{}", i), refs));
        }
        let finished = builder.finish()?;
        let size = finished.store(transport.as_ref(), "ix")?;
        assert_eq!(size, finished.size());

        let reader = BTreeReader::open(transport, "ix", Some(size));
        let entries: Vec<Entry> = reader.iter_all()?.collect::<Result<_>>()?;
        expected.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(entries, expected);
        Ok(())
    }

    #[test]
    fn test_duplicate_add_is_fatal() {
        let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 0));
        builder.add(key("a"), b"1".to_vec(), vec![]).unwrap();
        let err = builder.add(key("a"), b"2".to_vec(), vec![]).unwrap_err();
        assert!(matches!(err, IndexError::DuplicateKey(_)));
    }

    #[test]
    fn test_bad_shapes_rejected() {
        let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 1));
        assert!(matches!(
            builder.add(Key::from_strs(&["a", "b"]), vec![], vec![vec![]]),
            Err(IndexError::BadKey(_))
        ));
        assert!(matches!(
            builder.add(key("a"), b"bad\nvalue".to_vec(), vec![vec![]]),
            Err(IndexError::BadValue(_))
        ));
        assert!(matches!(
            builder.add(key("a"), vec![], vec![]),
            Err(IndexError::BadRefLists { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn test_spill_slot_sequence() -> Result<()> {
        let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 0).spill_at(2));
        let add = |builder: &mut BTreeBuilder, i: usize| {
            builder
                .add(Key::new(vec![format!("key-{:02}", i).into_bytes()]), b"v".to_vec(), vec![])
                .unwrap();
        };
        for i in 0..4 {
            add(&mut builder, i);
        }
        assert_eq!(builder.backing_slots(), vec![None, Some(4)]);
        for i in 4..8 {
            add(&mut builder, i);
        }
        assert_eq!(builder.backing_slots(), vec![None, None, Some(8)]);
        for i in 8..16 {
            add(&mut builder, i);
        }
        assert_eq!(builder.backing_slots(), vec![None, None, None, Some(16)]);
        assert_eq!(builder.key_count()?, 16);

        // spill accounting: live backing count equals the 1-bits of
        // records / spill_at
        let finished = builder.finish()?;
        assert_eq!(finished.key_count(), 16);
        Ok(())
    }

    #[test]
    fn test_spill_accounting_popcount() -> Result<()> {
        let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 0).spill_at(2));
        for i in 0..14 {
            builder.add(Key::new(vec![format!("key-{:02}", i).into_bytes()]), b"v".to_vec(), vec![])?;
        }
        // 14 ingested / 2 per spill = 7 = 0b111: three live backings
        let live = builder
            .backing_slots()
            .iter()
            .filter(|slot| slot.is_some())
            .count();
        assert_eq!(live, (14usize / 2).count_ones() as usize);
        Ok(())
    }

    #[test]
    fn test_insertion_order_does_not_matter() -> Result<()> {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x1db5);
        let mut ids: Vec<usize> = (0..200).collect();
        ids.shuffle(&mut rng);

        let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 0).spill_at(32));
        for i in ids {
            builder.add(
                Key::new(vec![format!("key-{:03}", i).into_bytes()]),
                format!("v{}", i).into_bytes(),
                vec![],
            )?;
        }
        let all: Vec<Entry> = builder.iter_all()?.collect::<Result<_>>()?;
        assert_eq!(all.len(), 200);
        for (i, entry) in all.iter().enumerate() {
            assert_eq!(entry.key, Key::new(vec![format!("key-{:03}", i).into_bytes()]));
        }
        Ok(())
    }

    #[test]
    fn test_queries_span_memory_and_backings() -> Result<()> {
        let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 0).spill_at(3));
        for i in 0..10 {
            builder.add(Key::new(vec![format!("key-{:02}", i).into_bytes()]), format!("v{}", i).into_bytes(), vec![])?;
        }
        // 9 spilled, 1 in memory
        let all: Vec<Entry> = builder.iter_all()?.collect::<Result<_>>()?;
        assert_eq!(all.len(), 10);
        for pair in all.windows(2) {
            assert!(pair[0].key < pair[1].key);
        }

        let found = builder.lookup(&[
            Key::from_strs(&["key-00"]),
            Key::from_strs(&["key-09"]),
            Key::from_strs(&["key-55"]),
        ])?;
        assert_eq!(found.len(), 2);
        Ok(())
    }

    #[test]
    fn test_duplicate_against_backing_surfaces_at_merge() -> Result<()> {
        let mut builder = BTreeBuilder::new(BuilderConfig::new(1, 0).spill_at(2));
        builder.add(key("a"), b"1".to_vec(), vec![])?;
        builder.add(key("b"), b"2".to_vec(), vec![])?;
        // "a" now lives only on disk, so the add is accepted...
        builder.add(key("a"), b"3".to_vec(), vec![])?;
        builder.add(key("c"), b"4".to_vec(), vec![])?;
        // ...and the duplicate is caught when the streams merge
        let result: Result<Vec<Entry>> = builder.iter_all()?.collect();
        assert!(matches!(result, Err(IndexError::DuplicateKey(_))));
        Ok(())
    }

    #[test]
    fn test_prefix_lookup_multi_element_with_spill() -> Result<()> {
        let mut builder = BTreeBuilder::new(BuilderConfig::new(2, 0).spill_at(4));
        for (a, b) in [
            ("foo", "bar"),
            ("foo", "baz"),
            ("foobar", "gam"),
            ("quux", "one"),
            ("quux", "two"),
        ] {
            builder.add(Key::from_strs(&[a, b]), b"v".to_vec(), vec![])?;
        }
        let mut found = builder.lookup_prefix(&[KeyPrefix::from_strs(&[Some("foo"), None])])?;
        found.sort_by(|a, b| a.key.cmp(&b.key));
        let keys: Vec<Key> = found.into_iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            vec![Key::from_strs(&["foo", "bar"]), Key::from_strs(&["foo", "baz"])]
        );
        Ok(())
    }

}
