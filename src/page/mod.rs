//! Page codec: serialisation and parsing of leaf and internal pages.
//!
//! Every page after the file header is a zlib stream padded with
//! trailing NUL to the page size. A decompressed body starts with
//! `type=leaf\n` or `type=internal\n`; leaf bodies carry one record per
//! line, internal bodies carry a child offset and one boundary key per
//! line.

mod chunk;

pub use chunk::ChunkWriter;

use crate::error::{IndexError, Result};
use crate::types::{Entry, Key};
use std::io::Read;

/// Signature line of the B+Tree format
pub const BTREE_SIGNATURE: &[u8] = b"B+Tree Graph Index 2\n";

/// First bytes of a decompressed leaf page
pub const LEAF_FLAG: &[u8] = b"type=leaf\n";

/// First bytes of a decompressed internal page
pub const INTERNAL_FLAG: &[u8] = b"type=internal\n";

/// Prefix of the child-offset line in an internal page
pub const INTERNAL_OFFSET: &[u8] = b"offset=";

/// A parsed leaf page: records in on-disk (ascending key) order
#[derive(Debug)]
pub struct LeafPage {
    entries: Vec<(Key, (Vec<u8>, Vec<Vec<Key>>))>,
}

impl LeafPage {
    /// The records of this page in key order
    pub fn entries(&self) -> &[(Key, (Vec<u8>, Vec<Vec<Key>>))] {
        &self.entries
    }

    /// Look up one key in this page
    pub fn get(&self, key: &Key) -> Option<&(Vec<u8>, Vec<Vec<Key>>)> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|i| &self.entries[i].1)
    }
}

/// A parsed internal page: child offset plus boundary keys
#[derive(Debug)]
pub struct InternalPage {
    /// Index of this page's first child within the row below
    pub offset: usize,
    /// Smallest key of each child subtree after the first
    pub keys: Vec<Key>,
}

/// A decompressed, parsed page
#[derive(Debug)]
pub enum Node {
    Leaf(LeafPage),
    Internal(InternalPage),
}

impl Node {
    /// This node as a leaf page, or bad-data
    pub fn as_leaf(&self, name: &str) -> Result<&LeafPage> {
        match self {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(IndexError::bad_data(name, "expected leaf page")),
        }
    }

    /// This node as an internal page, or bad-data
    pub fn as_internal(&self, name: &str) -> Result<&InternalPage> {
        match self {
            Node::Internal(page) => Ok(page),
            Node::Leaf(_) => Err(IndexError::bad_data(name, "expected internal page")),
        }
    }
}

/// Decompress one page body. Trailing NUL padding after the zlib
/// stream is ignored.
pub fn decompress_page(name: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| IndexError::bad_data(name, format!("decompression failed: {}", e)))?;
    Ok(out)
}

/// Decompress and parse one page into a leaf or internal node
pub fn parse_page(name: &str, data: &[u8], key_elements: usize, ref_lists: usize) -> Result<Node> {
    let bytes = decompress_page(name, data)?;
    if bytes.starts_with(LEAF_FLAG) {
        Ok(Node::Leaf(parse_leaf(name, &bytes, key_elements, ref_lists)?))
    } else if bytes.starts_with(INTERNAL_FLAG) {
        Ok(Node::Internal(parse_internal(name, &bytes)?))
    } else {
        Err(IndexError::bad_data(name, "unknown page type"))
    }
}

/// Parse a decompressed leaf body. Absent placeholder rows are skipped;
/// their keys only matter to reference encoding.
fn parse_leaf(name: &str, bytes: &[u8], key_elements: usize, ref_lists: usize) -> Result<LeafPage> {
    let mut entries = Vec::new();
    // split on \n only: reference lists use \r as a separator in-line
    for line in bytes[LEAF_FLAG.len()..].split(|&b| b == b'\n') {
        if line.is_empty() {
            break;
        }
        let mut elements: Vec<&[u8]> = line.splitn(key_elements + 1, |&b| b == 0).collect();
        if elements.len() != key_elements + 1 {
            return Err(IndexError::bad_data(name, "truncated leaf line"));
        }
        let rest = elements.pop().unwrap();
        let key = Key::new(elements.iter().map(|e| e.to_vec()).collect());
        let mut tail = rest.splitn(3, |&b| b == 0);
        let (absent, references, value) = match (tail.next(), tail.next(), tail.next()) {
            (Some(a), Some(r), Some(v)) => (a, r, v),
            _ => return Err(IndexError::bad_data(name, "malformed leaf line")),
        };
        if !absent.is_empty() {
            continue;
        }
        let refs = parse_references(references, ref_lists);
        entries.push((key, (value.to_vec(), refs)));
    }
    Ok(LeafPage { entries })
}

fn parse_references(references: &[u8], ref_lists: usize) -> Vec<Vec<Key>> {
    if ref_lists == 0 {
        return Vec::new();
    }
    references
        .split(|&b| b == b'\t')
        .map(|ref_string| {
            ref_string
                .split(|&b| b == b'\r')
                .filter(|r| !r.is_empty())
                .map(Key::parse)
                .collect()
        })
        .collect()
}

/// Parse a decompressed internal body
fn parse_internal(name: &str, bytes: &[u8]) -> Result<InternalPage> {
    let mut lines = bytes[INTERNAL_FLAG.len()..].split(|&b| b == b'\n');
    let offset_line = lines
        .next()
        .ok_or_else(|| IndexError::bad_data(name, "internal page missing offset"))?;
    if !offset_line.starts_with(INTERNAL_OFFSET) {
        return Err(IndexError::bad_data(name, "internal page missing offset"));
    }
    let offset = std::str::from_utf8(&offset_line[INTERNAL_OFFSET.len()..])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| IndexError::bad_data(name, "unparseable internal offset"))?;
    let mut keys = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        keys.push(Key::parse(line));
    }
    Ok(InternalPage { offset, keys })
}

/// Serialise a record to its leaf line.
///
/// Returns the serialised key (used as a boundary key upward) and the
/// full line, newline included.
pub fn serialize_leaf_line(entry: &Entry) -> (Vec<u8>, Vec<u8>) {
    let string_key = entry.key.serialize();
    let mut line = Vec::with_capacity(string_key.len() + entry.value.len() + 8);
    line.extend_from_slice(&string_key);
    // absent flag is always empty for built records
    line.extend_from_slice(b"\x00\x00");
    for (i, ref_list) in entry.refs.iter().enumerate() {
        if i > 0 {
            line.push(b'\t');
        }
        for (j, reference) in ref_list.iter().enumerate() {
            if j > 0 {
                line.push(b'\r');
            }
            line.extend_from_slice(&reference.serialize());
        }
    }
    line.push(0);
    line.extend_from_slice(&entry.value);
    line.push(b'\n');
    (string_key, line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn compress(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_serialize_leaf_line_no_refs() {
        let entry = Entry::new(Key::from_strs(&["akey"]), "data");
        let (string_key, line) = serialize_leaf_line(&entry);
        assert_eq!(string_key, b"akey");
        assert_eq!(line, b"akey\x00\x00\x00data\n");
    }

    #[test]
    fn test_serialize_leaf_line_with_refs() {
        let entry = Entry::with_refs(
            Key::from_strs(&["k", "1"]),
            "v",
            vec![
                vec![Key::from_strs(&["r", "a"]), Key::from_strs(&["r", "b"])],
                vec![],
            ],
        );
        let (string_key, line) = serialize_leaf_line(&entry);
        assert_eq!(string_key, b"k\x001");
        assert_eq!(line, b"k\x001\x00\x00r\x00a\rr\x00b\t\x00v\n");
    }

    #[test]
    fn test_parse_leaf_roundtrip() -> Result<()> {
        let entries = vec![
            Entry::with_refs(
                Key::from_strs(&["a"]),
                "value-a",
                vec![vec![Key::from_strs(&["b"])]],
            ),
            Entry::with_refs(Key::from_strs(&["b"]), "value-b", vec![vec![]]),
        ];
        let mut body = LEAF_FLAG.to_vec();
        for entry in &entries {
            body.extend_from_slice(&serialize_leaf_line(entry).1);
        }
        let node = parse_page("test", &compress(&body), 1, 1)?;
        let leaf = node.as_leaf("test")?;
        assert_eq!(leaf.entries().len(), 2);
        let (value, refs) = leaf.get(&Key::from_strs(&["a"])).unwrap();
        assert_eq!(value, b"value-a");
        assert_eq!(refs, &vec![vec![Key::from_strs(&["b"])]]);
        let (value, refs) = leaf.get(&Key::from_strs(&["b"])).unwrap();
        assert_eq!(value, b"value-b");
        assert_eq!(refs, &vec![Vec::<Key>::new()]);
        assert!(leaf.get(&Key::from_strs(&["c"])).is_none());
        Ok(())
    }

    #[test]
    fn test_parse_leaf_skips_absent() -> Result<()> {
        let body = b"type=leaf\nghost\x00a\x00\x00\nreal\x00\x00\x00data\n".to_vec();
        let node = parse_page("test", &compress(&body), 1, 0)?;
        let leaf = node.as_leaf("test")?;
        assert_eq!(leaf.entries().len(), 1);
        assert!(leaf.get(&Key::from_strs(&["real"])).is_some());
        assert!(leaf.get(&Key::from_strs(&["ghost"])).is_none());
        Ok(())
    }

    #[test]
    fn test_parse_internal() -> Result<()> {
        let body = b"type=internal\noffset=7\nkeyone\nkey\x00two\n".to_vec();
        let node = parse_page("test", &compress(&body), 2, 0)?;
        let page = node.as_internal("test")?;
        assert_eq!(page.offset, 7);
        assert_eq!(
            page.keys,
            vec![Key::from_strs(&["keyone"]), Key::from_strs(&["key", "two"])]
        );
        Ok(())
    }

    #[test]
    fn test_parse_ignores_trailing_padding() -> Result<()> {
        let body = b"type=internal\noffset=0\nk\n".to_vec();
        let mut data = compress(&body);
        data.extend_from_slice(&[0u8; 64]);
        let node = parse_page("test", &data, 1, 0)?;
        assert_eq!(node.as_internal("test")?.keys, vec![Key::from_strs(&["k"])]);
        Ok(())
    }

    #[test]
    fn test_unknown_page_type_is_bad_data() {
        let data = compress(b"type=mystery\n");
        let err = parse_page("test", &data, 1, 0).unwrap_err();
        assert!(matches!(err, IndexError::BadData { .. }));
    }

    #[test]
    fn test_garbage_is_bad_data() {
        let err = parse_page("test", b"not zlib at all", 1, 0).unwrap_err();
        assert!(matches!(err, IndexError::BadData { .. }));
    }
}
