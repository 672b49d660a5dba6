//! Read access to an immutable B+Tree index file.
//!
//! Pages are fetched through the transport on demand: the root page is
//! pinned after its first read, internal pages go into an unbounded LRU
//! and leaf pages into a bounded one. Lookups bisect key batches down
//! the tree; small page requests are expanded to neighbouring pages so
//! high-latency transports see few, large reads; once more than half
//! the file has been fetched piecemeal the whole file is read in one
//! request and served from memory.

mod lru;

use lru::LruCache;

use crate::error::{IndexError, Result};
use crate::page::{self, Node, BTREE_SIGNATURE};
use crate::query::{check_prefix, Index, KeyTrie};
use crate::transport::Transport;
use crate::types::{Entry, Key, KeyPrefix, ReaderConfig, PAGE_SIZE};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Leaf pages fetched per batch while scanning the whole index
const ITER_BATCH_PAGES: usize = 100;

/// Capacity of the optional key to value cache
const LEAF_VALUE_CACHE_SIZE: usize = 100_000;

/// Parsed header of a B+Tree index file
#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub ref_lists: usize,
    pub key_elements: usize,
    pub key_count: u64,
    pub row_lengths: Vec<usize>,
    /// Page index where each row begins; the final entry is the total
    /// page count
    pub row_offsets: Vec<usize>,
}

struct ReaderInner {
    size: Option<u64>,
    header: Option<Header>,
    /// Root page, pinned after the first read
    root: Option<Arc<Node>>,
    internal_cache: LruCache<usize, Arc<Node>>,
    leaf_cache: LruCache<usize, Arc<Node>>,
    leaf_value_cache: Option<LruCache<Key, (Vec<u8>, Vec<Vec<Key>>)>>,
    /// Total bytes fetched so far, for the buffer-all heuristic
    bytes_read: u64,
    /// True once the whole file has been read and cached
    buffered: bool,
}

/// Reader over one immutable B+Tree index file.
pub struct BTreeReader {
    transport: Arc<dyn Transport>,
    name: String,
    recommended_pages: usize,
    inner: Mutex<ReaderInner>,
}

impl BTreeReader {
    /// Open an index file. `size` may be unknown, in which case the
    /// first read fetches the whole file and discovers it.
    pub fn open(transport: Arc<dyn Transport>, name: impl Into<String>, size: Option<u64>) -> Self {
        Self::open_with_config(transport, name, size, ReaderConfig::default())
    }

    /// Open an index file with explicit cache configuration
    pub fn open_with_config(
        transport: Arc<dyn Transport>,
        name: impl Into<String>,
        size: Option<u64>,
        config: ReaderConfig,
    ) -> Self {
        let recommended_pages = transport.recommended_page_size().div_ceil(PAGE_SIZE);
        Self {
            transport,
            name: name.into(),
            recommended_pages,
            inner: Mutex::new(ReaderInner {
                size,
                header: None,
                root: None,
                internal_cache: LruCache::new(None),
                leaf_cache: LruCache::new(Some(config.node_cache_size)),
                leaf_value_cache: config
                    .leaf_value_cache
                    .then(|| LruCache::new(Some(LEAF_VALUE_CACHE_SIZE))),
                bytes_read: 0,
                buffered: false,
            }),
        }
    }

    /// The file name this reader serves
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exact number of records, from the header
    pub fn key_count(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.ensure_root(&mut inner)?;
        Ok(inner.header.as_ref().expect("header parsed").key_count)
    }

    /// Look up a set of keys. Each present key yields its entry once;
    /// order follows leaf-page placement.
    pub fn lookup(&self, keys: &[Key]) -> Result<Vec<Entry>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock();
        self.ensure_root(&mut inner)?;
        let header = inner.header.clone().expect("header parsed");
        if header.key_count == 0 {
            return Ok(Vec::new());
        }
        let mut needed: Vec<Key> = keys.to_vec();
        needed.sort_unstable();
        needed.dedup();

        let mut out = Vec::new();
        if let Some(cache) = inner.leaf_value_cache.as_mut() {
            let mut misses = Vec::new();
            for key in needed {
                match cache.get(&key) {
                    Some((value, refs)) => out.push(Entry {
                        key,
                        value: value.clone(),
                        refs: refs.clone(),
                    }),
                    None => misses.push(key),
                }
            }
            needed = misses;
        }
        if needed.is_empty() {
            return Ok(out);
        }

        let mut nodes_and_keys: Vec<(usize, Vec<Key>)> = vec![(0, needed)];
        let rows = header.row_offsets.len() - 1;
        for row in 0..rows.saturating_sub(1) {
            let next_row_start = header.row_offsets[row + 1];
            let idxs: Vec<usize> = nodes_and_keys.iter().map(|(i, _)| *i).collect();
            let nodes = self.get_nodes(&mut inner, &idxs)?;
            let mut next = Vec::new();
            for (node_index, sub_keys) in nodes_and_keys {
                let node = nodes
                    .get(&node_index)
                    .ok_or_else(|| IndexError::internal("internal page not fetched"))?;
                let internal = node.as_internal(&self.name)?;
                for (pos, keys) in multi_bisect_right(sub_keys, &internal.keys) {
                    next.push((next_row_start + internal.offset + pos, keys));
                }
            }
            nodes_and_keys = next;
        }

        let idxs: Vec<usize> = nodes_and_keys.iter().map(|(i, _)| *i).collect();
        let nodes = self.get_nodes(&mut inner, &idxs)?;
        self.cache_leaf_values(&mut inner, &nodes);
        for (node_index, sub_keys) in nodes_and_keys {
            let node = nodes
                .get(&node_index)
                .ok_or_else(|| IndexError::internal("leaf page not fetched"))?;
            let leaf = node.as_leaf(&self.name)?;
            for key in sub_keys {
                if let Some((value, refs)) = leaf.get(&key) {
                    out.push(Entry {
                        key,
                        value: value.clone(),
                        refs: refs.clone(),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Iterate every record in ascending key order, reading leaf pages
    /// in batches without disturbing the page caches.
    pub fn iter_all(&self) -> Result<AllEntries<'_>> {
        let mut inner = self.inner.lock();
        self.ensure_root(&mut inner)?;
        let header = inner.header.clone().expect("header parsed");
        let leaf_offsets: Vec<usize> = if header.key_count == 0 {
            Vec::new()
        } else {
            let start = header.row_offsets[header.row_offsets.len() - 2];
            let end = *header.row_offsets.last().unwrap();
            (start..end).collect()
        };
        Ok(AllEntries {
            reader: self,
            offsets: leaf_offsets,
            next: 0,
            queue: VecDeque::new(),
            failed: false,
        })
    }

    /// Find records matching key prefixes.
    ///
    /// This materialises the whole index and filters in memory; it is
    /// an expensive path by design.
    pub fn lookup_prefix(&self, prefixes: &[KeyPrefix]) -> Result<Vec<Entry>> {
        if prefixes.is_empty() {
            return Ok(Vec::new());
        }
        let key_elements = {
            let mut inner = self.inner.lock();
            self.ensure_root(&mut inner)?;
            inner.header.as_ref().expect("header parsed").key_elements
        };
        for prefix in prefixes {
            check_prefix(prefix, key_elements)?;
        }
        let mut unique: Vec<&KeyPrefix> = Vec::new();
        for prefix in prefixes {
            if !unique.contains(&prefix) {
                unique.push(prefix);
            }
        }
        let mut entries = Vec::new();
        for entry in self.iter_all()? {
            entries.push(entry?);
        }
        if key_elements == 1 {
            let map: HashMap<Key, Entry> =
                entries.into_iter().map(|e| (e.key.clone(), e)).collect();
            let mut out = Vec::new();
            for prefix in unique {
                let key = prefix.as_full_key().expect("checked: arity 1, first fixed");
                if let Some(entry) = map.get(&key) {
                    out.push(entry.clone());
                }
            }
            return Ok(out);
        }
        let trie = KeyTrie::build(entries);
        let mut out = Vec::new();
        for prefix in unique {
            trie.match_prefix(prefix, &mut out);
        }
        Ok(out)
    }

    /// Read and parse every page in the file
    pub fn validate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_root(&mut inner)?;
        let header = inner.header.clone().expect("header parsed");
        let start = if header.row_lengths.len() > 1 {
            header.row_offsets[1]
        } else {
            1
        };
        let end = *header.row_offsets.last().unwrap();
        let mut idx = start;
        while idx < end {
            let batch: Vec<usize> = (idx..end.min(idx + ITER_BATCH_PAGES)).collect();
            self.fetch_pages(&mut inner, &batch, false)?;
            idx += batch.len();
        }
        Ok(())
    }

    fn ensure_root(&self, inner: &mut ReaderInner) -> Result<()> {
        if inner.header.is_some() {
            return Ok(());
        }
        self.get_nodes(inner, &[0])?;
        if inner.header.is_none() {
            return Err(IndexError::bad_data(&self.name, "header not parsed"));
        }
        Ok(())
    }

    /// Fetch pages for the lookup path: cache hits first, then an
    /// expanded read whose results are all cached.
    fn get_nodes(
        &self,
        inner: &mut ReaderInner,
        offsets: &[usize],
    ) -> Result<HashMap<usize, Arc<Node>>> {
        let (mut found, needed) = self.collect_cached(inner, offsets);
        if needed.is_empty() {
            return Ok(found);
        }
        let expanded = {
            let cached = Self::cached_offsets(inner);
            let ctx = ExpandContext {
                recommended_pages: self.recommended_pages,
                size: inner.size,
                root_known: inner.root.is_some(),
                tree_depth: inner.header.as_ref().map(|h| h.row_lengths.len()),
                row_offsets: inner.header.as_ref().map(|h| h.row_offsets.as_slice()),
                cached: &cached,
            };
            let expanded = expand_offsets(&ctx, needed);
            trace!("expanded request for {}: {:?}", self.name, expanded);
            expanded
        };
        for (idx, node) in self.read_nodes(inner, &expanded)? {
            self.cache_node(inner, idx, node.clone());
            found.insert(idx, node);
        }
        Ok(found)
    }

    /// Fetch pages without expansion; results are cached only when
    /// `cache_results` is set (scans leave the LRUs alone).
    fn fetch_pages(
        &self,
        inner: &mut ReaderInner,
        offsets: &[usize],
        cache_results: bool,
    ) -> Result<HashMap<usize, Arc<Node>>> {
        let (mut found, needed) = self.collect_cached(inner, offsets);
        if needed.is_empty() {
            return Ok(found);
        }
        for (idx, node) in self.read_nodes(inner, &needed)? {
            if cache_results || idx == 0 {
                self.cache_node(inner, idx, node.clone());
            }
            found.insert(idx, node);
        }
        Ok(found)
    }

    fn collect_cached(
        &self,
        inner: &mut ReaderInner,
        offsets: &[usize],
    ) -> (HashMap<usize, Arc<Node>>, Vec<usize>) {
        let mut found = HashMap::new();
        let mut needed = Vec::new();
        for &idx in offsets {
            if idx == 0 {
                if let Some(root) = &inner.root {
                    found.insert(0, root.clone());
                    continue;
                }
            }
            if let Some(node) = inner.internal_cache.get(&idx) {
                found.insert(idx, node.clone());
            } else if let Some(node) = inner.leaf_cache.get(&idx) {
                found.insert(idx, node.clone());
            } else {
                needed.push(idx);
            }
        }
        needed.sort_unstable();
        needed.dedup();
        (found, needed)
    }

    fn cache_node(&self, inner: &mut ReaderInner, idx: usize, node: Arc<Node>) {
        if idx == 0 {
            if inner.root.is_none() {
                inner.root = Some(node);
            }
            return;
        }
        let start_of_leaves = match &inner.header {
            Some(h) if h.row_offsets.len() >= 2 => h.row_offsets[h.row_offsets.len() - 2],
            _ => return,
        };
        if idx < start_of_leaves {
            inner.internal_cache.insert(idx, node);
        } else {
            inner.leaf_cache.insert(idx, node);
        }
    }

    fn cached_offsets(inner: &ReaderInner) -> HashSet<usize> {
        let mut cached: HashSet<usize> = inner.internal_cache.keys().copied().collect();
        cached.extend(inner.leaf_cache.keys().copied());
        if inner.root.is_some() {
            cached.insert(0);
        }
        cached
    }

    /// Read pages from the transport and parse them. Requests must be
    /// sorted ascending. Parsing page 0 also parses the header.
    fn read_nodes(
        &self,
        inner: &mut ReaderInner,
        offsets: &[usize],
    ) -> Result<Vec<(usize, Arc<Node>)>> {
        let mut whole_file: Option<Vec<u8>> = None;
        let mut ranges: Vec<(u64, usize)> = Vec::new();
        for &idx in offsets {
            let offset = (idx * PAGE_SIZE) as u64;
            if idx == 0 {
                match inner.size {
                    Some(size) => ranges.push((0, PAGE_SIZE.min(size as usize))),
                    None => {
                        // size unknown only for tiny indices: read the
                        // whole thing and discover it
                        let bytes = self.transport.get_bytes(&self.name)?;
                        inner.bytes_read += bytes.len() as u64;
                        inner.size = Some(bytes.len() as u64);
                        whole_file = Some(bytes);
                        break;
                    }
                }
            } else {
                let size = inner
                    .size
                    .ok_or_else(|| IndexError::internal("page read before size known"))?;
                if offset > size {
                    return Err(IndexError::internal(format!(
                        "tried to read past the end of {}: {} > {}",
                        self.name, offset, size
                    )));
                }
                ranges.push((offset, PAGE_SIZE.min((size - offset) as usize)));
            }
        }

        let data_ranges: Vec<(u64, Vec<u8>)> = if let Some(bytes) = whole_file {
            bytes
                .chunks(PAGE_SIZE)
                .enumerate()
                .map(|(i, chunk)| ((i * PAGE_SIZE) as u64, chunk.to_vec()))
                .collect()
        } else if ranges.is_empty() {
            Vec::new()
        } else {
            let size = inner.size.expect("size known when ranges built");
            if !inner.buffered && inner.bytes_read * 2 > size {
                // over half the file fetched piecemeal: stop issuing
                // readv and take the rest in one request
                self.buffer_all(inner)?;
                let (found, missing) = self.collect_cached(inner, offsets);
                if !missing.is_empty() {
                    return Err(IndexError::bad_data(
                        &self.name,
                        format!("pages {:?} beyond buffered file", missing),
                    ));
                }
                return Ok(offsets.iter().map(|i| (*i, found[i].clone())).collect());
            }
            let got = self.transport.readv(&self.name, &ranges)?;
            for (_, data) in &got {
                inner.bytes_read += data.len() as u64;
            }
            got
        };

        let mut results = Vec::new();
        for (offset, data) in data_ranges {
            let mut body: &[u8] = &data;
            if offset == 0 {
                let (header, header_end) = parse_header(&self.name, body)?;
                if inner.header.is_none() {
                    inner.header = Some(header);
                }
                body = &body[header_end..];
                if body.is_empty() {
                    continue;
                }
            }
            let (key_elements, ref_lists) = {
                let h = inner
                    .header
                    .as_ref()
                    .ok_or_else(|| IndexError::internal("page parsed before header"))?;
                (h.key_elements, h.ref_lists)
            };
            let node = page::parse_page(&self.name, body, key_elements, ref_lists)?;
            results.push(((offset as usize) / PAGE_SIZE, Arc::new(node)));
        }
        Ok(results)
    }

    /// Read the entire file in one request and cache every page.
    fn buffer_all(&self, inner: &mut ReaderInner) -> Result<()> {
        debug!("reading entire index {}", self.name);
        let bytes = self.transport.get_bytes(&self.name)?;
        inner.bytes_read += bytes.len() as u64;
        inner.size = Some(bytes.len() as u64);
        let (header, header_end) = parse_header(&self.name, &bytes)?;
        if inner.header.is_none() {
            inner.header = Some(header);
        }
        let (key_elements, ref_lists) = {
            let h = inner.header.as_ref().expect("header parsed");
            (h.key_elements, h.ref_lists)
        };
        inner.leaf_cache.set_unbounded();
        for (idx, chunk) in bytes.chunks(PAGE_SIZE).enumerate() {
            let body = if idx == 0 { &chunk[header_end..] } else { chunk };
            if body.is_empty() {
                continue;
            }
            let node = Arc::new(page::parse_page(&self.name, body, key_elements, ref_lists)?);
            self.cache_node(inner, idx, node);
        }
        inner.buffered = true;
        Ok(())
    }

    fn cache_leaf_values(&self, inner: &mut ReaderInner, nodes: &HashMap<usize, Arc<Node>>) {
        let Some(cache) = inner.leaf_value_cache.as_mut() else {
            return;
        };
        for node in nodes.values() {
            if let Node::Leaf(leaf) = node.as_ref() {
                for (key, value) in leaf.entries() {
                    if cache.contains_key(key) {
                        // the rest of this page was cached with it
                        break;
                    }
                    cache.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

impl Index for BTreeReader {
    fn iter_all<'a>(&'a self) -> Result<Box<dyn Iterator<Item = Result<Entry>> + 'a>> {
        Ok(Box::new(BTreeReader::iter_all(self)?))
    }

    fn lookup(&self, keys: &[Key]) -> Result<Vec<Entry>> {
        BTreeReader::lookup(self, keys)
    }

    fn lookup_prefix(&self, prefixes: &[KeyPrefix]) -> Result<Vec<Entry>> {
        BTreeReader::lookup_prefix(self, prefixes)
    }

    fn key_count(&self) -> Result<u64> {
        BTreeReader::key_count(self)
    }

    fn validate(&self) -> Result<()> {
        BTreeReader::validate(self)
    }
}

/// Streaming iterator over every record of a B+Tree index
pub struct AllEntries<'a> {
    reader: &'a BTreeReader,
    offsets: Vec<usize>,
    next: usize,
    queue: VecDeque<Entry>,
    failed: bool,
}

impl Iterator for AllEntries<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.queue.pop_front() {
                return Some(Ok(entry));
            }
            if self.failed || self.next >= self.offsets.len() {
                return None;
            }
            let end = (self.next + ITER_BATCH_PAGES).min(self.offsets.len());
            let batch = &self.offsets[self.next..end];
            self.next = end;
            let mut inner = self.reader.inner.lock();
            let nodes = match self.reader.fetch_pages(&mut inner, batch, false) {
                Ok(nodes) => nodes,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            for idx in batch {
                let leaf = match nodes
                    .get(idx)
                    .ok_or_else(|| IndexError::internal("leaf page not fetched"))
                    .and_then(|n| n.as_leaf(&self.reader.name))
                {
                    Ok(leaf) => leaf,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                };
                for (key, (value, refs)) in leaf.entries() {
                    self.queue.push_back(Entry {
                        key: key.clone(),
                        value: value.clone(),
                        refs: refs.clone(),
                    });
                }
            }
        }
    }
}

/// Parse the file header; returns the header and the byte index where
/// page 0's compressed body begins.
pub(crate) fn parse_header(name: &str, bytes: &[u8]) -> Result<(Header, usize)> {
    if bytes.len() < BTREE_SIGNATURE.len() || &bytes[..BTREE_SIGNATURE.len()] != BTREE_SIGNATURE {
        return Err(IndexError::BadSignature {
            name: name.to_string(),
        });
    }
    let mut pos = BTREE_SIGNATURE.len();
    let ref_lists = parse_count(name, option_line(name, bytes, &mut pos, b"node_ref_lists=")?)?;
    let key_elements = parse_count(name, option_line(name, bytes, &mut pos, b"key_elements=")?)?;
    let key_count = parse_count(name, option_line(name, bytes, &mut pos, b"len=")?)? as u64;
    let row_lengths_raw = option_line(name, bytes, &mut pos, b"row_lengths=")?;
    let mut row_lengths = Vec::new();
    for part in row_lengths_raw.split(|&b| b == b',') {
        if part.is_empty() {
            continue;
        }
        row_lengths.push(parse_count(name, part)?);
    }
    let mut row_offsets = Vec::with_capacity(row_lengths.len() + 1);
    let mut offset = 0;
    for &length in &row_lengths {
        row_offsets.push(offset);
        offset += length;
    }
    row_offsets.push(offset);
    Ok((
        Header {
            ref_lists,
            key_elements,
            key_count,
            row_lengths,
            row_offsets,
        },
        pos,
    ))
}

fn option_line<'a>(
    name: &str,
    bytes: &'a [u8],
    pos: &mut usize,
    prefix: &[u8],
) -> Result<&'a [u8]> {
    let rest = &bytes[*pos..];
    let newline = rest
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| IndexError::bad_options(name, "truncated header"))?;
    let line = &rest[..newline];
    if !line.starts_with(prefix) {
        return Err(IndexError::bad_options(
            name,
            format!("missing {}", String::from_utf8_lossy(prefix)),
        ));
    }
    *pos += newline + 1;
    Ok(&line[prefix.len()..])
}

fn parse_count(name: &str, bytes: &[u8]) -> Result<usize> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| IndexError::bad_options(name, "unparseable option value"))
}

/// Partition sorted `in_keys` by their bisect-right position against
/// the sorted `fixed_keys`, in O(|in| + |fixed|).
pub(crate) fn multi_bisect_right(in_keys: Vec<Key>, fixed_keys: &[Key]) -> Vec<(usize, Vec<Key>)> {
    if in_keys.is_empty() {
        return Vec::new();
    }
    if fixed_keys.is_empty() {
        // nothing to compare against: everything falls to the left
        return vec![(0, in_keys)];
    }
    if in_keys.len() == 1 {
        let pos = fixed_keys.partition_point(|f| f <= &in_keys[0]);
        return vec![(pos, in_keys)];
    }
    let mut output: Vec<(usize, Vec<Key>)> = Vec::new();
    let mut fpos = 0;
    for key in in_keys {
        while fpos < fixed_keys.len() && fixed_keys[fpos] <= key {
            fpos += 1;
        }
        match output.last_mut() {
            Some((pos, keys)) if *pos == fpos => keys.push(key),
            _ => output.push((fpos, vec![key])),
        }
    }
    output
}

/// Inputs for the request-expansion policy
pub(crate) struct ExpandContext<'a> {
    pub recommended_pages: usize,
    pub size: Option<u64>,
    pub root_known: bool,
    pub tree_depth: Option<usize>,
    pub row_offsets: Option<&'a [usize]>,
    pub cached: &'a HashSet<usize>,
}

/// Decide which extra pages to download alongside `offsets`.
///
/// Requests are grown towards neighbours within the same tree layer so
/// transports with per-request overhead see batches near their
/// recommended size; already-large requests, unknown file sizes, and
/// the very first probes of an index are left alone.
pub(crate) fn expand_offsets(ctx: &ExpandContext<'_>, offsets: Vec<usize>) -> Vec<usize> {
    if offsets.len() >= ctx.recommended_pages {
        // already requesting more than enough
        return offsets;
    }
    let Some(size) = ctx.size else {
        // don't guess where the file ends
        return offsets;
    };
    let total_pages = match ctx.row_offsets {
        Some(row_offsets) if ctx.root_known => *row_offsets.last().unwrap_or(&0),
        _ => (size as usize).div_ceil(PAGE_SIZE),
    };
    if total_pages.saturating_sub(ctx.cached.len()) <= ctx.recommended_pages {
        // reading the remainder costs no more than the batch size
        return (0..total_pages).filter(|i| !ctx.cached.contains(i)).collect();
    }
    if !ctx.root_known {
        // first read of a large index: odds are low that neighbours of
        // the root are interesting
        return offsets;
    }
    let tree_depth = ctx.tree_depth.unwrap_or(1);
    if ctx.cached.len() < tree_depth && offsets.len() == 1 {
        // root plus one leaf doesn't justify expansion; once a search
        // pattern shows, it does
        return offsets;
    }
    let row_offsets = ctx.row_offsets.expect("row offsets known with root");

    let mut final_offsets: HashSet<usize> = offsets.iter().copied().collect();
    let mut layer: Option<(usize, usize)> = None;
    let mut new_tips: HashSet<usize> = final_offsets.clone();
    while final_offsets.len() < ctx.recommended_pages && !new_tips.is_empty() {
        let mut next_tips = HashSet::new();
        for &pos in &new_tips {
            let (first, end) =
                *layer.get_or_insert_with(|| find_layer_first_and_end(row_offsets, pos));
            if pos > 1 {
                let previous = pos - 1;
                if previous >= first
                    && !ctx.cached.contains(&previous)
                    && !final_offsets.contains(&previous)
                {
                    next_tips.insert(previous);
                }
            }
            let after = pos + 1;
            if after < total_pages
                && after < end
                && !ctx.cached.contains(&after)
                && !final_offsets.contains(&after)
            {
                next_tips.insert(after);
            }
        }
        final_offsets.extend(next_tips.iter().copied());
        new_tips = next_tips;
    }
    let mut out: Vec<usize> = final_offsets.into_iter().collect();
    out.sort_unstable();
    out
}

/// Start of the layer containing `offset`, and the start of the next
fn find_layer_first_and_end(row_offsets: &[usize], offset: usize) -> (usize, usize) {
    let mut first = 0;
    let mut end = 0;
    for &row_offset in row_offsets {
        first = end;
        end = row_offset;
        if offset < row_offset {
            break;
        }
    }
    (first, end)
}
