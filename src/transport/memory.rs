//! In-memory transport, used by tests and small tools.
//!
//! Records every operation so tests can assert on read behaviour
//! (prefetch expansion, buffer-all switchover).

use crate::error::{IndexError, Result};
use crate::transport::{Transport, DEFAULT_RECOMMENDED_PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;

/// One recorded transport operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportActivity {
    /// Whole-file read
    GetBytes { name: String },
    /// Vectored partial read with the requested ranges
    Readv {
        name: String,
        ranges: Vec<(u64, usize)>,
    },
    /// Store of a new file
    PutFile { name: String },
}

/// A transport backed by a map of named byte buffers
pub struct MemoryTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    activity: Mutex<Vec<TransportActivity>>,
    recommended_page_size: usize,
}

impl MemoryTransport {
    /// Create an empty transport with the local-disk read hint
    pub fn new() -> Self {
        Self::with_recommended_page_size(DEFAULT_RECOMMENDED_PAGE_SIZE)
    }

    /// Create an empty transport with a custom read-batch hint
    pub fn with_recommended_page_size(bytes: usize) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            activity: Mutex::new(Vec::new()),
            recommended_page_size: bytes,
        }
    }

    /// Store a file without recording activity
    pub fn put_bytes(&self, name: &str, bytes: Vec<u8>) {
        self.files.lock().insert(name.to_string(), bytes);
    }

    /// Remove a file; true if it existed
    pub fn remove(&self, name: &str) -> bool {
        self.files.lock().remove(name).is_some()
    }

    /// Size of a stored file
    pub fn size_of(&self, name: &str) -> Option<u64> {
        self.files.lock().get(name).map(|b| b.len() as u64)
    }

    /// Snapshot of the recorded operations
    pub fn activity(&self) -> Vec<TransportActivity> {
        self.activity.lock().clone()
    }

    /// Drain the recorded operations
    pub fn take_activity(&self) -> Vec<TransportActivity> {
        std::mem::take(&mut self.activity.lock())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn get_bytes(&self, name: &str) -> Result<Vec<u8>> {
        self.activity.lock().push(TransportActivity::GetBytes {
            name: name.to_string(),
        });
        self.files
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| IndexError::no_such_file(name))
    }

    fn readv(&self, name: &str, ranges: &[(u64, usize)]) -> Result<Vec<(u64, Vec<u8>)>> {
        self.activity.lock().push(TransportActivity::Readv {
            name: name.to_string(),
            ranges: ranges.to_vec(),
        });
        let files = self.files.lock();
        let bytes = files
            .get(name)
            .ok_or_else(|| IndexError::no_such_file(name))?;
        let mut out = Vec::with_capacity(ranges.len());
        for &(offset, length) in ranges {
            let start = offset as usize;
            let end = start
                .checked_add(length)
                .filter(|&e| e <= bytes.len())
                .ok_or_else(|| {
                    IndexError::bad_data(name, format!("readv past end: {}+{}", offset, length))
                })?;
            out.push((offset, bytes[start..end].to_vec()));
        }
        Ok(out)
    }

    fn put_file(&self, name: &str, data: &mut dyn Read) -> Result<u64> {
        self.activity.lock().push(TransportActivity::PutFile {
            name: name.to_string(),
        });
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        let size = buf.len() as u64;
        self.files.lock().insert(name.to_string(), buf);
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() -> Result<()> {
        let transport = MemoryTransport::new();
        transport.put_bytes("a", b"0123456789".to_vec());

        assert_eq!(transport.get_bytes("a")?, b"0123456789");
        assert_eq!(
            transport.readv("a", &[(2, 3)])?,
            vec![(2, b"234".to_vec())]
        );
        assert!(transport.readv("a", &[(8, 5)]).is_err());
        assert!(transport.get_bytes("b").unwrap_err().is_no_such_file());
        Ok(())
    }

    #[test]
    fn test_activity_log() -> Result<()> {
        let transport = MemoryTransport::new();
        transport.put_bytes("a", vec![0; 16]);
        transport.get_bytes("a")?;
        transport.readv("a", &[(0, 4)])?;

        let activity = transport.take_activity();
        assert_eq!(
            activity,
            vec![
                TransportActivity::GetBytes { name: "a".into() },
                TransportActivity::Readv {
                    name: "a".into(),
                    ranges: vec![(0, 4)],
                },
            ]
        );
        assert!(transport.activity().is_empty());
        Ok(())
    }
}
