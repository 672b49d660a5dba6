//! Budgeted compressed page packing.
//!
//! A [`ChunkWriter`] accepts record lines one at a time and guarantees
//! the compressed page never exceeds its byte budget. zlib's ratio
//! depends on history, so acceptance is decided against a live
//! compressor: input streams in optimistically while the raw byte count
//! provably fits, switches to sync-flush accounting near the boundary,
//! and as a last resort recompresses all accepted lines from scratch to
//! see whether a tighter packing admits one more line.

use crate::error::{IndexError, Result};
use flate2::{Compress, Compression, FlushCompress, Status};

/// Sync-flush margin: a flush may emit a few bytes of block framing
const SYNC_MARGIN: usize = 10;

/// Conservative slack kept after a sync flush before accepting a line
const ACCEPT_MARGIN: usize = 100;

/// Packs lines into one compressed page of at most `chunk_size` bytes.
pub struct ChunkWriter {
    chunk_size: usize,
    reserved_size: usize,
    level: Compression,
    compressor: Compress,
    /// Raw lines accepted so far, kept for repacking
    bytes_in: Vec<Vec<u8>>,
    /// Compressed output blocks emitted so far
    bytes_list: Vec<Vec<u8>>,
    bytes_out_len: usize,
    /// Raw bytes handed to the compressor since the last flush
    unflushed_in_bytes: usize,
    num_repack: usize,
    num_zsync: usize,
    max_repack: usize,
    max_zsync: usize,
    unused: Option<Vec<u8>>,
}

impl ChunkWriter {
    /// Create a writer with a byte budget and reserved trailer space.
    ///
    /// `optimize_for_size` raises the compression level at the cost of
    /// CPU.
    pub fn new(chunk_size: usize, reserved: usize, optimize_for_size: bool) -> Self {
        let level = if optimize_for_size {
            Compression::best()
        } else {
            Compression::default()
        };
        Self {
            chunk_size,
            reserved_size: reserved,
            level,
            compressor: Compress::new(level, true),
            bytes_in: Vec::new(),
            bytes_list: Vec::new(),
            bytes_out_len: 0,
            unflushed_in_bytes: 0,
            num_repack: 0,
            num_zsync: 0,
            max_repack: 2,
            max_zsync: 8,
            unused: None,
        }
    }

    /// Try to append `bytes` (a complete line, terminator included).
    ///
    /// Returns false if the line was accepted and the caller may write
    /// more; true if it would overflow the page, in which case the
    /// accepted content is unchanged and the caller must `finish`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<bool> {
        if self.num_repack > self.max_repack {
            self.unused = Some(bytes.to_vec());
            return Ok(true);
        }
        let capacity = self.chunk_size - self.reserved_size;
        let next_unflushed = self.unflushed_in_bytes + bytes.len();
        let remaining_capacity = capacity.saturating_sub(self.bytes_out_len + SYNC_MARGIN);
        if next_unflushed < remaining_capacity {
            // fits even if it compresses to nothing smaller
            let out = self.compress_block(bytes, FlushCompress::None)?;
            self.push_output(out);
            self.bytes_in.push(bytes.to_vec());
            self.unflushed_in_bytes += bytes.len();
            return Ok(false);
        }
        // near the boundary: flush to get an exact size
        self.num_zsync += 1;
        if self.max_repack == 0 && self.num_zsync > self.max_zsync {
            self.num_repack += 1;
            self.unused = Some(bytes.to_vec());
            return Ok(true);
        }
        let mut out = self.compress_block(bytes, FlushCompress::None)?;
        out.extend(self.compress_block(&[], FlushCompress::Sync)?);
        self.unflushed_in_bytes = 0;
        self.push_output(out);
        if self.bytes_out_len + ACCEPT_MARGIN <= capacity {
            self.bytes_in.push(bytes.to_vec());
            return Ok(false);
        }
        // over budget with flushes in the stream; repack from scratch
        self.num_repack += 1;
        let (blocks, packed_len, compressor) = self.recompress_accepted(Some(bytes))?;
        if self.num_repack >= self.max_repack {
            self.num_repack += 1;
        }
        if packed_len + SYNC_MARGIN > capacity {
            // even tightly packed it does not fit; roll back to the
            // accepted lines alone
            let (blocks, packed_len, compressor) = self.recompress_accepted(None)?;
            self.compressor = compressor;
            self.num_repack = self.max_repack + 1;
            self.bytes_list = blocks;
            self.bytes_out_len = packed_len;
            self.unused = Some(bytes.to_vec());
            return Ok(true);
        }
        self.bytes_in.push(bytes.to_vec());
        self.bytes_list = blocks;
        self.bytes_out_len = packed_len;
        self.compressor = compressor;
        Ok(false)
    }

    /// Seal the page.
    ///
    /// Returns the ordered output blocks (whose concatenation is exactly
    /// `chunk_size` bytes, final NUL padding block included), the line
    /// that did not fit if any, and the padding byte count.
    pub fn finish(mut self) -> Result<(Vec<Vec<u8>>, Option<Vec<u8>>, usize)> {
        let out = self.compress_block(&[], FlushCompress::Finish)?;
        self.push_output(out);
        if self.bytes_out_len > self.chunk_size {
            return Err(IndexError::internal(format!(
                "compressed page is {} bytes, budget {}",
                self.bytes_out_len, self.chunk_size
            )));
        }
        let padding = self.chunk_size - self.bytes_out_len;
        if padding > 0 {
            self.bytes_list.push(vec![0u8; padding]);
        }
        Ok((self.bytes_list, self.unused, padding))
    }

    fn push_output(&mut self, out: Vec<u8>) {
        if !out.is_empty() {
            self.bytes_out_len += out.len();
            self.bytes_list.push(out);
        }
    }

    fn compress_block(&mut self, input: &[u8], flush: FlushCompress) -> Result<Vec<u8>> {
        compress_into(&mut self.compressor, input, flush)
    }

    /// Compress all accepted lines (plus, optionally, one candidate
    /// line ending in a sync flush) with a fresh compressor.
    fn recompress_accepted(
        &self,
        extra: Option<&[u8]>,
    ) -> Result<(Vec<Vec<u8>>, usize, Compress)> {
        let mut compressor = Compress::new(self.level, true);
        let mut blocks = Vec::new();
        for accepted in &self.bytes_in {
            let out = compress_into(&mut compressor, accepted, FlushCompress::None)?;
            if !out.is_empty() {
                blocks.push(out);
            }
        }
        if let Some(extra) = extra {
            let mut out = compress_into(&mut compressor, extra, FlushCompress::None)?;
            out.extend(compress_into(&mut compressor, &[], FlushCompress::Sync)?);
            if !out.is_empty() {
                blocks.push(out);
            }
        }
        let total = blocks.iter().map(|b| b.len()).sum();
        Ok((blocks, total, compressor))
    }
}

/// Drive `Compress::compress_vec` to completion for one input block.
fn compress_into(compressor: &mut Compress, input: &[u8], flush: FlushCompress) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let mut consumed = 0;
    loop {
        if out.capacity() == out.len() {
            out.reserve(128);
        }
        let before_in = compressor.total_in();
        let status = compressor
            .compress_vec(&input[consumed..], &mut out, flush)
            .map_err(|e| IndexError::Compress(e.to_string()))?;
        consumed += (compressor.total_in() - before_in) as usize;
        match (status, flush) {
            (Status::StreamEnd, _) => break,
            (_, FlushCompress::None) => {
                if consumed >= input.len() {
                    break;
                }
            }
            _ => {
                // flushing: complete once all input is in and the
                // compressor stopped short of filling the output
                if consumed >= input.len() && out.len() < out.capacity() {
                    break;
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::decompress_page;

    fn concat(blocks: &[Vec<u8>]) -> Vec<u8> {
        blocks.iter().flat_map(|b| b.iter().copied()).collect()
    }

    #[test]
    fn test_empty_page_pads_to_budget() -> Result<()> {
        let writer = ChunkWriter::new(4096, 0, false);
        let (blocks, unused, padding) = writer.finish()?;
        let page = concat(&blocks);
        assert_eq!(page.len(), 4096);
        assert!(unused.is_none());
        assert_eq!(padding, 4096 - (page.len() - padding));
        assert_eq!(decompress_page("test", &page)?, b"");
        Ok(())
    }

    #[test]
    fn test_accepted_lines_roundtrip() -> Result<()> {
        let mut writer = ChunkWriter::new(4096, 0, false);
        let mut expected = Vec::new();
        for i in 0..10 {
            let line = format!("key-{:03}\x00\x00\x00value-{}\n", i, i);
            assert!(!writer.write(line.as_bytes())?);
            expected.extend_from_slice(line.as_bytes());
        }
        let (blocks, unused, _padding) = writer.finish()?;
        let page = concat(&blocks);
        assert_eq!(page.len(), 4096);
        assert!(unused.is_none());
        assert_eq!(decompress_page("test", &page)?, expected);
        Ok(())
    }

    #[test]
    fn test_overflow_leaves_accepted_content_unchanged() -> Result<()> {
        // incompressible lines so the budget fills quickly
        let mut writer = ChunkWriter::new(1024, 0, false);
        let mut accepted = Vec::new();
        let mut overflow_line = None;
        for i in 0..200u32 {
            let mut line = Vec::new();
            for j in 0..32u32 {
                line.extend_from_slice(&(i.wrapping_mul(2654435761).wrapping_add(j * 97)).to_be_bytes());
            }
            // keep it a "line"
            line.retain(|&b| b != b'\n');
            line.push(b'\n');
            if writer.write(&line)? {
                overflow_line = Some(line);
                break;
            }
            accepted.extend_from_slice(&line);
        }
        let line = overflow_line.expect("budget was never exceeded");
        let (blocks, unused, _padding) = writer.finish()?;
        let page = concat(&blocks);
        assert_eq!(page.len(), 1024);
        assert_eq!(unused, Some(line));
        assert_eq!(decompress_page("test", &page)?, accepted);
        Ok(())
    }

    #[test]
    fn test_rejects_everything_after_overflow() -> Result<()> {
        let mut writer = ChunkWriter::new(512, 0, false);
        let line = vec![b'x'; 200];
        while !writer.write(&line)? {}
        // once an overflow was reported, further writes are refused
        assert!(writer.write(b"tiny\n")?);
        Ok(())
    }

    #[test]
    fn test_reserved_space_shrinks_budget() -> Result<()> {
        let mut plain_budget = 0;
        let mut writer = ChunkWriter::new(1024, 0, false);
        let rng_line = |i: usize| {
            let mut line: Vec<u8> = (0..64).map(|j| ((i * 31 + j * 7) % 251) as u8).collect();
            line.retain(|&b| b != b'\n');
            line.push(b'\n');
            line
        };
        for i in 0..100 {
            if writer.write(&rng_line(i))? {
                break;
            }
            plain_budget += 1;
        }
        let mut reserved_budget = 0;
        let mut writer = ChunkWriter::new(1024, 256, false);
        for i in 0..100 {
            if writer.write(&rng_line(i))? {
                break;
            }
            reserved_budget += 1;
        }
        assert!(reserved_budget < plain_budget);
        // the page is still padded to the full chunk size
        let (blocks, _, _) = writer.finish()?;
        assert_eq!(concat(&blocks).len(), 1024);
        Ok(())
    }

    #[test]
    fn test_optimize_for_size_roundtrips() -> Result<()> {
        let mut writer = ChunkWriter::new(4096, 0, true);
        let mut expected = Vec::new();
        for i in 0..50 {
            let line = format!("repetitive-key-{:04}\x00\x00\x00repetitive-value\n", i);
            assert!(!writer.write(line.as_bytes())?);
            expected.extend_from_slice(line.as_bytes());
        }
        let (blocks, unused, _) = writer.finish()?;
        assert!(unused.is_none());
        assert_eq!(decompress_page("test", &concat(&blocks))?, expected);
        Ok(())
    }
}
