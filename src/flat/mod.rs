//! The legacy flat index format.
//!
//! Records are variable-length text lines after a short header;
//! references are fixed-width zero-padded decimal byte offsets into
//! the same file. The reader answers point lookups by bisection over
//! byte ranges: each probe reads a small window, parses the complete
//! lines inside it, and folds the result into sorted maps of parsed
//! byte ranges and parsed key ranges so no region is fetched twice.
//! Once more than half the file has been read piecemeal, the whole
//! file is buffered instead.

use crate::error::{IndexError, Result};
use crate::query::{check_prefix, Index, KeyTrie};
use crate::transport::Transport;
use crate::types::{check_entry, Entry, Key, KeyPrefix};
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Signature line of the flat format
pub const FLAT_SIGNATURE: &[u8] = b"Bazaar Graph Index 1\n";

/// Bytes fetched to parse the header on first contact
const HEADER_READV_LENGTH: usize = 200;

/// Window fetched around each bisection probe
const BISECT_WINDOW: usize = 800;

type RawRecord = (Key, bool, Vec<Vec<u64>>, Vec<u8>);

struct FlatInner {
    size: Option<u64>,
    key_count: Option<u64>,
    ref_lists: usize,
    key_elements: usize,
    /// Key elements plus the absent, references and value fields
    expected_elements: usize,
    /// Fully-buffered, reference-resolved records
    nodes: Option<BTreeMap<Key, (Vec<u8>, Vec<Vec<Key>>)>>,
    /// Records parsed during bisection, references still as offsets.
    /// None until the header has been parsed.
    bisect_nodes: Option<HashMap<Key, (Vec<u8>, Vec<Vec<u64>>)>>,
    /// Every parsed record (absent ones included) by byte offset
    keys_by_offset: HashMap<u64, RawRecord>,
    /// Sorted, disjoint byte ranges already parsed
    parsed_byte_map: Vec<(u64, u64)>,
    /// First and last record key of each parsed range; None marks a
    /// file edge (the header has no keys)
    parsed_key_map: Vec<(Option<Key>, Option<Key>)>,
    bytes_read: u64,
}

/// What one bisection probe learned about one key
enum ProbeAnswer {
    Found(Entry),
    Missing,
    /// The record, if present, starts before the probed location
    Lower,
    /// The record, if present, starts after the probed location
    Higher,
}

/// Reader over one flat index file.
pub struct FlatIndex {
    transport: Arc<dyn Transport>,
    name: String,
    inner: Mutex<FlatInner>,
}

impl FlatIndex {
    /// Open a flat index. Without `size`, bisection is disabled and
    /// the first use buffers the whole file.
    pub fn open(transport: Arc<dyn Transport>, name: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            transport,
            name: name.into(),
            inner: Mutex::new(FlatInner {
                size,
                key_count: None,
                ref_lists: 0,
                key_elements: 1,
                expected_elements: 4,
                nodes: None,
                bisect_nodes: None,
                keys_by_offset: HashMap::new(),
                parsed_byte_map: Vec::new(),
                parsed_key_map: Vec::new(),
                bytes_read: 0,
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
        self.key_count_locked(&mut inner)
    }

    fn key_count_locked(&self, inner: &mut FlatInner) -> Result<u64> {
        if let Some(count) = inner.key_count {
            return Ok(count);
        }
        match inner.size {
            Some(size) => {
                let length = HEADER_READV_LENGTH.min(size as usize);
                self.read_and_parse(inner, vec![(0, length)])?;
            }
            None => self.buffer_all(inner, None)?,
        }
        inner
            .key_count
            .ok_or_else(|| IndexError::bad_options(&self.name, "missing len option"))
    }

    /// Look up a set of keys. Lookups for a large share of the index
    /// buffer the whole file; otherwise each key is bisected in.
    pub fn lookup(&self, keys: &[Key]) -> Result<Vec<Entry>> {
        let mut unique: Vec<Key> = keys.to_vec();
        unique.sort_unstable();
        unique.dedup();
        if unique.is_empty() {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock();
        if inner.nodes.is_none() && inner.size.is_none() {
            self.buffer_all(&mut inner, None)?;
        }
        if inner.nodes.is_none() {
            // roughly twenty keys fit a minimum read, so probing more
            // than a twentieth of the index would read most of it
            let count = self.key_count_locked(&mut inner)?;
            if unique.len() as u64 * 20 > count {
                self.buffer_all(&mut inner, None)?;
            }
        }
        if let Some(nodes) = inner.nodes.as_ref() {
            return Ok(unique
                .iter()
                .filter_map(|key| {
                    nodes.get(key).map(|(value, refs)| Entry {
                        key: key.clone(),
                        value: value.clone(),
                        refs: refs.clone(),
                    })
                })
                .collect());
        }
        self.lookup_via_bisection(&mut inner, unique)
    }

    /// Yield every record in key order; buffers the whole index.
    pub fn iter_all(&self) -> Result<Box<dyn Iterator<Item = Result<Entry>> + '_>> {
        let mut inner = self.inner.lock();
        self.buffer_all(&mut inner, None)?;
        let entries: Vec<Entry> = inner
            .nodes
            .as_ref()
            .expect("buffered")
            .iter()
            .map(|(key, (value, refs))| Entry {
                key: key.clone(),
                value: value.clone(),
                refs: refs.clone(),
            })
            .collect();
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    /// Find records matching key prefixes; buffers the whole index.
    pub fn lookup_prefix(&self, prefixes: &[KeyPrefix]) -> Result<Vec<Entry>> {
        if prefixes.is_empty() {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock();
        self.buffer_all(&mut inner, None)?;
        let key_elements = inner.key_elements;
        for prefix in prefixes {
            check_prefix(prefix, key_elements)?;
        }
        let mut unique: Vec<&KeyPrefix> = Vec::new();
        for prefix in prefixes {
            if !unique.contains(&prefix) {
                unique.push(prefix);
            }
        }
        let nodes = inner.nodes.as_ref().expect("buffered");
        if key_elements == 1 {
            let mut out = Vec::new();
            for prefix in unique {
                let key = prefix.as_full_key().expect("checked: arity 1, first fixed");
                if let Some((value, refs)) = nodes.get(&key) {
                    out.push(Entry {
                        key,
                        value: value.clone(),
                        refs: refs.clone(),
                    });
                }
            }
            return Ok(out);
        }
        let trie = KeyTrie::build(nodes.iter().map(|(key, (value, refs))| Entry {
            key: key.clone(),
            value: value.clone(),
            refs: refs.clone(),
        }));
        let mut out = Vec::new();
        for prefix in unique {
            trie.match_prefix(prefix, &mut out);
        }
        Ok(out)
    }

    /// Parse the whole index; any malformed data surfaces here.
    pub fn validate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.buffer_all(&mut inner, None)
    }

    /// Read and parse the entire file into resolved records.
    fn buffer_all(&self, inner: &mut FlatInner, data: Option<Vec<u8>>) -> Result<()> {
        if inner.nodes.is_some() {
            return Ok(());
        }
        debug!("reading entire index {}", self.name);
        let bytes = match data {
            Some(bytes) => bytes,
            None => self.transport.get_bytes(&self.name)?,
        };
        if inner.size.is_none() {
            inner.size = Some(bytes.len() as u64);
        }
        let header_end = self.parse_option_header(inner, &bytes)?;
        let mut keys_by_offset: HashMap<u64, RawRecord> = HashMap::new();
        let mut trailers = 0;
        let mut pos = header_end as u64;
        let mut lines: Vec<&[u8]> = bytes[header_end..].split(|&b| b == b'\n').collect();
        lines.pop();
        for line in lines {
            if line.is_empty() {
                // the empty trailer line, always last
                if let Some(size) = inner.size {
                    if pos + 1 != size {
                        return Err(IndexError::bad_data(&self.name, "trailer before end of file"));
                    }
                }
                trailers += 1;
                continue;
            }
            let record = self.parse_record_line(inner, line)?;
            let advance = line.len() as u64 + 1;
            keys_by_offset.insert(pos, record);
            pos += advance;
        }
        if trailers != 1 {
            return Err(IndexError::bad_data(&self.name, "missing trailer line"));
        }
        let mut nodes = BTreeMap::new();
        for (key, absent, ref_offsets, value) in keys_by_offset.values() {
            if *absent {
                continue;
            }
            let refs = self.resolve_offset_references(&keys_by_offset, ref_offsets)?;
            nodes.insert(key.clone(), (value.clone(), refs));
        }
        inner.keys_by_offset = keys_by_offset;
        inner.nodes = Some(nodes);
        Ok(())
    }

    /// Per-key windowed bisection: probe each pending key's window
    /// midpoint, and narrow or answer from what the probes parsed.
    fn lookup_via_bisection(&self, inner: &mut FlatInner, keys: Vec<Key>) -> Result<Vec<Entry>> {
        let size = inner.size.expect("bisection requires a known size");
        let mut out = Vec::new();
        let mut states: Vec<(Key, u64, u64)> =
            keys.into_iter().map(|key| (key, 0, size)).collect();
        while !states.is_empty() {
            let probes: Vec<(u64, Key)> = states
                .iter()
                .map(|(key, low, high)| (low + (high - low) / 2, key.clone()))
                .collect();
            let answers = self.lookup_keys_via_location(inner, &probes)?;
            let mut next_states = Vec::new();
            for (((location, key), answer), (_, low, high)) in
                probes.into_iter().zip(answers).zip(states)
            {
                match answer {
                    ProbeAnswer::Found(entry) => out.push(entry),
                    ProbeAnswer::Missing => {}
                    ProbeAnswer::Lower => {
                        if location > low {
                            next_states.push((key, low, location));
                        }
                    }
                    ProbeAnswer::Higher => {
                        if location + 1 < high {
                            next_states.push((key, location + 1, high));
                        }
                    }
                }
            }
            states = next_states;
        }
        Ok(out)
    }

    /// One probe round. Reads windows for keys that cannot be answered
    /// from parsed state, then classifies every key; references landing
    /// outside parsed ranges trigger one follow-up read.
    fn lookup_keys_via_location(
        &self,
        inner: &mut FlatInner,
        location_keys: &[(u64, Key)],
    ) -> Result<Vec<ProbeAnswer>> {
        let size = inner.size.expect("bisection requires a known size");
        let mut readv_ranges: Vec<(u64, usize)> = Vec::new();
        for (location, key) in location_keys {
            if let Some(bisect_nodes) = inner.bisect_nodes.as_ref() {
                if bisect_nodes.contains_key(key) {
                    continue;
                }
            }
            if inner.bisect_nodes.is_some() && self.key_range_parsed(inner, key) {
                continue;
            }
            if self.byte_parsed(inner, *location) {
                continue;
            }
            let length = BISECT_WINDOW.min((size - *location) as usize);
            if length > 0 {
                readv_ranges.push((*location, length));
            }
        }
        if inner.bisect_nodes.is_none() {
            readv_ranges.push((0, HEADER_READV_LENGTH.min(size as usize)));
        }
        self.read_and_parse(inner, readv_ranges)?;

        if let Some(nodes) = inner.nodes.as_ref() {
            // reading tipped into buffer-all; answer everything
            return Ok(location_keys
                .iter()
                .map(|(_, key)| match nodes.get(key) {
                    Some((value, refs)) => ProbeAnswer::Found(Entry {
                        key: key.clone(),
                        value: value.clone(),
                        refs: refs.clone(),
                    }),
                    None => ProbeAnswer::Missing,
                })
                .collect());
        }

        let mut answers: Vec<ProbeAnswer> = Vec::with_capacity(location_keys.len());
        let mut pending: Vec<(usize, Key)> = Vec::new();
        let mut pending_locations: HashSet<u64> = HashSet::new();
        for (slot, (location, key)) in location_keys.iter().enumerate() {
            let bisect_nodes = inner.bisect_nodes.as_ref().expect("header parsed");
            if let Some((value, ref_offsets)) = bisect_nodes.get(key) {
                let wanted: Vec<u64> = ref_offsets
                    .iter()
                    .flatten()
                    .filter(|offset| !inner.keys_by_offset.contains_key(offset))
                    .copied()
                    .collect();
                if !wanted.is_empty() {
                    pending_locations.extend(wanted);
                    pending.push((slot, key.clone()));
                    answers.push(ProbeAnswer::Missing); // patched below
                    continue;
                }
                let refs = self.resolve_offset_references(&inner.keys_by_offset, ref_offsets)?;
                answers.push(ProbeAnswer::Found(Entry {
                    key: key.clone(),
                    value: value.clone(),
                    refs,
                }));
                continue;
            }
            if self.key_range_parsed(inner, key) {
                answers.push(ProbeAnswer::Missing);
                continue;
            }
            // direction relative to the parsed range at the probe
            let index = parsed_byte_index(&inner.parsed_byte_map, *location);
            let range_first = inner.parsed_key_map[index].0.as_ref();
            if Some(key) < range_first {
                answers.push(ProbeAnswer::Lower);
            } else {
                answers.push(ProbeAnswer::Higher);
            }
        }

        if pending.is_empty() {
            return Ok(answers);
        }
        let mut ref_ranges: Vec<(u64, usize)> = Vec::new();
        for location in pending_locations {
            let length = BISECT_WINDOW.min((size - location) as usize);
            if length > 0 {
                ref_ranges.push((location, length));
            }
        }
        self.read_and_parse(inner, ref_ranges)?;
        if let Some(nodes) = inner.nodes.as_ref() {
            for (slot, key) in pending {
                let (value, refs) = nodes
                    .get(&key)
                    .ok_or_else(|| IndexError::bad_data(&self.name, "referenced record vanished"))?;
                answers[slot] = ProbeAnswer::Found(Entry {
                    key,
                    value: value.clone(),
                    refs: refs.clone(),
                });
            }
            return Ok(answers);
        }
        for (slot, key) in pending {
            let (value, ref_offsets) = inner
                .bisect_nodes
                .as_ref()
                .expect("header parsed")
                .get(&key)
                .cloned()
                .ok_or_else(|| IndexError::bad_data(&self.name, "pending record vanished"))?;
            let refs = self.resolve_offset_references(&inner.keys_by_offset, &ref_offsets)?;
            answers[slot] = ProbeAnswer::Found(Entry { key, value, refs });
        }
        Ok(answers)
    }

    /// Read ranges and parse the returned regions. Switches to
    /// buffer-all past the 50% threshold, or when the transport hands
    /// back the whole file in one piece.
    fn read_and_parse(&self, inner: &mut FlatInner, mut ranges: Vec<(u64, usize)>) -> Result<()> {
        if ranges.is_empty() {
            return Ok(());
        }
        let size = inner.size.expect("size known");
        if inner.nodes.is_none() && inner.bytes_read * 2 > size {
            return self.buffer_all(inner, None);
        }
        // probes for different keys can land on the same window
        ranges.sort_unstable();
        ranges.dedup();
        let data = self.transport.readv(&self.name, &ranges)?;
        for (mut offset, mut bytes) in data {
            inner.bytes_read += bytes.len() as u64;
            if offset == 0 && bytes.len() as u64 == size {
                // the transport coalesced our ranges into the whole file
                return self.buffer_all(inner, Some(bytes));
            }
            if inner.bisect_nodes.is_none() {
                if offset != 0 {
                    return Err(IndexError::internal("first parse must include the header"));
                }
                let header_end = self.parse_option_header(inner, &bytes)?;
                inner.bisect_nodes = Some(HashMap::new());
                self.parsed_bytes(inner, 0, None, header_end as u64, None);
                bytes = bytes[header_end..].to_vec();
                offset = header_end as u64;
            }
            if !bytes.is_empty() {
                self.parse_region(inner, offset, &bytes)?;
            }
        }
        Ok(())
    }

    /// Fold a fetched region into the parsed maps, one segment at a
    /// time (a region may bridge several previously parsed ranges).
    fn parse_region(&self, inner: &mut FlatInner, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        let mut high_parsed = offset;
        loop {
            let index = parsed_byte_index(&inner.parsed_byte_map, high_parsed);
            if end <= inner.parsed_byte_map[index].1 {
                return Ok(());
            }
            let (new_high, last_segment) = self.parse_segment(inner, offset, data, end, index)?;
            high_parsed = new_high;
            if last_segment {
                return Ok(());
            }
        }
    }

    /// Parse the unparsed slice of `data` adjacent to parsed range
    /// `index`, trimming partial lines at non-adjacent edges.
    fn parse_segment(
        &self,
        inner: &mut FlatInner,
        offset: u64,
        data: &[u8],
        end: u64,
        index: usize,
    ) -> Result<(u64, bool)> {
        let size = inner.size.expect("size known");
        let mut trim_start: Option<usize> = None;
        let mut trim_end: Option<usize> = None;
        let lower_end = inner.parsed_byte_map[index].1;
        // overlap with data parsed before this segment
        let start_adjacent = if offset < lower_end {
            trim_start = Some((lower_end - offset) as usize);
            true
        } else {
            offset == lower_end
        };
        let (end_adjacent, last_segment) = if end == size {
            (true, true)
        } else if index + 1 == inner.parsed_byte_map.len() {
            (false, true)
        } else if end == inner.parsed_byte_map[index + 1].0 {
            (true, true)
        } else if end > inner.parsed_byte_map[index + 1].0 {
            // only consider the data up to the next parsed range
            trim_end = Some((inner.parsed_byte_map[index + 1].0 - offset) as usize);
            (true, end < inner.parsed_byte_map[index + 1].1)
        } else {
            (false, true)
        };
        if !start_adjacent {
            // drop the leading partial line
            let from = trim_start.unwrap_or(0);
            let newline = data[from..]
                .iter()
                .position(|&b| b == b'\n')
                .ok_or_else(|| IndexError::bad_data(&self.name, "no newline in window"))?;
            trim_start = Some(from + newline + 1);
        }
        if !end_adjacent {
            // drop the trailing partial line
            let upto = trim_end.unwrap_or(data.len());
            let newline = data[..upto]
                .iter()
                .rposition(|&b| b == b'\n')
                .ok_or_else(|| IndexError::bad_data(&self.name, "no newline in window"))?;
            trim_end = Some(newline + 1);
        }
        let trim_start = trim_start.unwrap_or(0);
        let trim_end = trim_end.unwrap_or(data.len());
        if trim_start >= trim_end {
            return Err(IndexError::bad_data(&self.name, "window held no complete records"));
        }
        let trimmed = &data[trim_start..trim_end];
        let segment_offset = offset + trim_start as u64;

        let mut lines: Vec<&[u8]> = trimmed.split(|&b| b == b'\n').collect();
        lines.pop();
        let mut pos = segment_offset;
        let mut first_key: Option<Key> = None;
        let mut last_key: Option<Key> = None;
        for line in lines {
            if line.is_empty() {
                if pos + 1 != size {
                    return Err(IndexError::bad_data(&self.name, "trailer before end of file"));
                }
                continue;
            }
            let (key, absent, ref_offsets, value) = self.parse_record_line(inner, line)?;
            if first_key.is_none() {
                first_key = Some(key.clone());
            }
            last_key = Some(key.clone());
            if !absent {
                inner
                    .bisect_nodes
                    .as_mut()
                    .expect("header parsed")
                    .insert(key.clone(), (value.clone(), ref_offsets.clone()));
            }
            inner.keys_by_offset.insert(pos, (key, absent, ref_offsets, value));
            pos += line.len() as u64 + 1;
        }
        let segment_end = segment_offset + trimmed.len() as u64;
        self.parsed_bytes(inner, segment_offset, first_key, segment_end, last_key);
        Ok((segment_end, last_segment))
    }

    /// Record `[start, end)` as parsed, coalescing with neighbours.
    fn parsed_bytes(
        &self,
        inner: &mut FlatInner,
        start: u64,
        start_key: Option<Key>,
        end: u64,
        end_key: Option<Key>,
    ) {
        let byte_map = &mut inner.parsed_byte_map;
        let key_map = &mut inner.parsed_key_map;
        if byte_map.is_empty() {
            byte_map.push((start, end));
            key_map.push((start_key, end_key));
            return;
        }
        let index = parsed_byte_index(byte_map, start);
        if index + 1 < byte_map.len()
            && byte_map[index].1 == start
            && byte_map[index + 1].0 == end
        {
            // combine two regions
            byte_map[index].1 = byte_map[index + 1].1;
            let upper_key = key_map[index + 1].1.clone();
            key_map[index].1 = upper_key;
            byte_map.remove(index + 1);
            key_map.remove(index + 1);
        } else if byte_map[index].1 == start {
            // extend the lower region
            byte_map[index].1 = end;
            key_map[index].1 = end_key;
        } else if index + 1 < byte_map.len() && byte_map[index + 1].0 == end {
            // extend the higher region
            byte_map[index + 1].0 = start;
            key_map[index + 1].0 = start_key;
        } else {
            // new region
            byte_map.insert(index + 1, (start, end));
            key_map.insert(index + 1, (start_key, end_key));
        }
    }

    /// True if the key falls inside a fully parsed key range
    fn key_range_parsed(&self, inner: &FlatInner, key: &Key) -> bool {
        if inner.parsed_key_map.is_empty() {
            return false;
        }
        let index = parsed_key_index(&inner.parsed_key_map, key);
        let (first, last) = &inner.parsed_key_map[index];
        first.as_ref() <= Some(key)
            && (last.as_ref() >= Some(key)
                || inner.parsed_byte_map[index].1 == inner.size.unwrap_or(0))
    }

    /// True if the byte at `offset` has been parsed
    fn byte_parsed(&self, inner: &FlatInner, offset: u64) -> bool {
        if inner.parsed_byte_map.is_empty() {
            return false;
        }
        let index = parsed_byte_index(&inner.parsed_byte_map, offset);
        let (start, end) = inner.parsed_byte_map[index];
        offset >= start && offset < end
    }

    fn parse_option_header(&self, inner: &mut FlatInner, bytes: &[u8]) -> Result<usize> {
        if bytes.len() < FLAT_SIGNATURE.len() || &bytes[..FLAT_SIGNATURE.len()] != FLAT_SIGNATURE {
            return Err(IndexError::BadSignature {
                name: self.name.clone(),
            });
        }
        let mut pos = FLAT_SIGNATURE.len();
        let ref_lists = self.option_value(bytes, &mut pos, b"node_ref_lists=")?;
        let key_elements = self.option_value(bytes, &mut pos, b"key_elements=")?;
        let key_count = self.option_value(bytes, &mut pos, b"len=")?;
        inner.ref_lists = ref_lists;
        inner.key_elements = key_elements;
        inner.expected_elements = key_elements + 3;
        inner.key_count = Some(key_count as u64);
        Ok(pos)
    }

    fn option_value(&self, bytes: &[u8], pos: &mut usize, prefix: &[u8]) -> Result<usize> {
        let rest = &bytes[(*pos).min(bytes.len())..];
        let newline = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| IndexError::bad_options(&self.name, "truncated header"))?;
        let line = &rest[..newline];
        if !line.starts_with(prefix) {
            return Err(IndexError::bad_options(
                &self.name,
                format!("missing {}", String::from_utf8_lossy(prefix)),
            ));
        }
        *pos += newline + 1;
        std::str::from_utf8(&line[prefix.len()..])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| IndexError::bad_options(&self.name, "unparseable option value"))
    }

    fn parse_record_line(&self, inner: &FlatInner, line: &[u8]) -> Result<RawRecord> {
        let elements: Vec<&[u8]> = line.split(|&b| b == 0).collect();
        if elements.len() != inner.expected_elements {
            return Err(IndexError::bad_data(&self.name, "wrong number of record fields"));
        }
        let key = Key::new(
            elements[..inner.key_elements]
                .iter()
                .map(|e| e.to_vec())
                .collect(),
        );
        let absent = !elements[inner.key_elements].is_empty();
        let references = elements[inner.key_elements + 1];
        let value = elements[inner.key_elements + 2].to_vec();
        let mut ref_offsets: Vec<Vec<u64>> = Vec::new();
        if inner.ref_lists > 0 {
            for ref_string in references.split(|&b| b == b'\t') {
                let mut list = Vec::new();
                for reference in ref_string.split(|&b| b == b'\r') {
                    if reference.is_empty() {
                        continue;
                    }
                    let offset = std::str::from_utf8(reference)
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                        .ok_or_else(|| {
                            IndexError::bad_data(&self.name, "unparseable reference offset")
                        })?;
                    list.push(offset);
                }
                ref_offsets.push(list);
            }
        }
        Ok((key, absent, ref_offsets, value))
    }

    fn resolve_offset_references(
        &self,
        keys_by_offset: &HashMap<u64, RawRecord>,
        ref_offsets: &[Vec<u64>],
    ) -> Result<Vec<Vec<Key>>> {
        ref_offsets
            .iter()
            .map(|list| {
                list.iter()
                    .map(|offset| {
                        keys_by_offset
                            .get(offset)
                            .map(|(key, _, _, _)| key.clone())
                            .ok_or_else(|| {
                                IndexError::bad_data(&self.name, "unresolved reference offset")
                            })
                    })
                    .collect()
            })
            .collect()
    }
}

impl Index for FlatIndex {
    fn iter_all<'a>(&'a self) -> Result<Box<dyn Iterator<Item = Result<Entry>> + 'a>> {
        FlatIndex::iter_all(self)
    }

    fn lookup(&self, keys: &[Key]) -> Result<Vec<Entry>> {
        FlatIndex::lookup(self, keys)
    }

    fn lookup_prefix(&self, prefixes: &[KeyPrefix]) -> Result<Vec<Entry>> {
        FlatIndex::lookup_prefix(self, prefixes)
    }

    fn key_count(&self) -> Result<u64> {
        FlatIndex::key_count(self)
    }

    fn validate(&self) -> Result<()> {
        FlatIndex::validate(self)
    }
}

/// Index of the last parsed byte range starting at or before `offset`
fn parsed_byte_index(map: &[(u64, u64)], offset: u64) -> usize {
    map.partition_point(|(start, _)| *start <= offset)
        .saturating_sub(1)
}

/// Index of the last parsed key range starting at or before `key`
fn parsed_key_index(map: &[(Option<Key>, Option<Key>)], key: &Key) -> usize {
    map.partition_point(|(first, _)| first.as_ref() <= Some(key))
        .saturating_sub(1)
}

/// Builds a flat index file.
///
/// References are written as byte offsets, so every referenced key
/// must have an address: referenced-but-never-added keys are
/// materialised as absent placeholder records.
pub struct FlatIndexBuilder {
    key_elements: usize,
    ref_lists: usize,
    /// All records, placeholders included, sorted by key
    nodes: BTreeMap<Key, (bool, Vec<Vec<Key>>, Vec<u8>)>,
}

impl FlatIndexBuilder {
    /// Create a builder for the given index shape
    pub fn new(key_elements: usize, ref_lists: usize) -> Self {
        Self {
            key_elements,
            ref_lists,
            nodes: BTreeMap::new(),
        }
    }

    /// Add a record. Re-adding a key that only exists as an absent
    /// placeholder upgrades it; re-adding a real record is fatal.
    pub fn add(&mut self, key: Key, value: Vec<u8>, refs: Vec<Vec<Key>>) -> Result<()> {
        check_entry(&key, &value, &refs, self.key_elements, self.ref_lists)?;
        if let Some((absent, _, _)) = self.nodes.get(&key) {
            if !absent {
                return Err(IndexError::DuplicateKey(key));
            }
        }
        for ref_list in &refs {
            for reference in ref_list {
                if !self.nodes.contains_key(reference) {
                    self.nodes
                        .insert(reference.clone(), (true, Vec::new(), Vec::new()));
                }
            }
        }
        self.nodes.insert(key, (false, refs, value));
        Ok(())
    }

    /// Number of real (non-placeholder) records
    pub fn key_count(&self) -> u64 {
        self.nodes.values().filter(|(absent, _, _)| !absent).count() as u64
    }

    /// Serialise the index.
    ///
    /// Reference offsets cannot be known until every earlier record's
    /// width is known, and widths depend on the offsets' digit count;
    /// a counting pass fixes the digit width, then addresses follow.
    pub fn finish(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(FLAT_SIGNATURE);
        out.extend_from_slice(format!("node_ref_lists={}\n", self.ref_lists).as_bytes());
        out.extend_from_slice(format!("key_elements={}\n", self.key_elements).as_bytes());
        out.extend_from_slice(format!("len={}\n", self.key_count()).as_bytes());
        let prefix_length = out.len();

        let mut digits = 0;
        let mut expected_bytes = 0;
        let mut key_addresses: HashMap<&Key, usize> = HashMap::new();
        if self.ref_lists > 0 {
            let mut key_offset_info: Vec<(&Key, usize, usize)> = Vec::new();
            let mut non_ref_bytes = prefix_length;
            let mut total_references = 0;
            for (key, (absent, references, value)) in &self.nodes {
                key_offset_info.push((key, non_ref_bytes, total_references));
                non_ref_bytes += key.elements().iter().map(|e| e.len()).sum::<usize>();
                if self.key_elements > 1 {
                    non_ref_bytes += self.key_elements - 1;
                }
                // three NULs and a newline frame every record
                non_ref_bytes += value.len() + 3 + 1;
                if *absent {
                    non_ref_bytes += 1;
                } else {
                    non_ref_bytes += self.ref_lists - 1;
                    for ref_list in references {
                        total_references += ref_list.len();
                        if !ref_list.is_empty() {
                            non_ref_bytes += ref_list.len() - 1;
                        }
                    }
                }
            }
            digits = 1;
            let mut possible_total_bytes = non_ref_bytes + total_references * digits;
            while 10usize.pow(digits as u32) < possible_total_bytes {
                digits += 1;
                possible_total_bytes = non_ref_bytes + total_references * digits;
            }
            expected_bytes = possible_total_bytes + 1;
            for (key, non_ref, refs_before) in key_offset_info {
                key_addresses.insert(key, non_ref + refs_before * digits);
            }
        }

        for (key, (absent, references, value)) in &self.nodes {
            out.extend_from_slice(&key.serialize());
            out.push(0);
            if *absent {
                out.push(b'a');
            }
            out.push(0);
            for (i, ref_list) in references.iter().enumerate() {
                if i > 0 {
                    out.push(b'\t');
                }
                for (j, reference) in ref_list.iter().enumerate() {
                    if j > 0 {
                        out.push(b'\r');
                    }
                    let address = key_addresses[reference];
                    out.extend_from_slice(format!("{:0width$}", address, width = digits).as_bytes());
                }
            }
            out.push(0);
            out.extend_from_slice(value);
            out.push(b'\n');
        }
        out.push(b'\n');
        if self.ref_lists > 0 && out.len() != expected_bytes {
            return Err(IndexError::internal(format!(
                "mismatched output length: {} != {}",
                out.len(),
                expected_bytes
            )));
        }
        Ok(out)
    }
}
