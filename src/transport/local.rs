//! Directory-rooted transport over the local file system.

use crate::error::{IndexError, Result};
use crate::transport::Transport;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A transport serving files from one directory
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    /// Create a transport rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory this transport serves
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn open(&self, name: &str) -> Result<File> {
        File::open(self.root.join(name)).map_err(|e| Self::map_err(name, e))
    }

    fn map_err(name: &str, e: std::io::Error) -> IndexError {
        if e.kind() == std::io::ErrorKind::NotFound {
            IndexError::no_such_file(name)
        } else {
            IndexError::Io(e)
        }
    }
}

impl Transport for LocalTransport {
    fn get_bytes(&self, name: &str) -> Result<Vec<u8>> {
        std::fs::read(self.root.join(name)).map_err(|e| Self::map_err(name, e))
    }

    fn readv(&self, name: &str, ranges: &[(u64, usize)]) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut file = self.open(name)?;
        let mut out = Vec::with_capacity(ranges.len());
        for &(offset, length) in ranges {
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; length];
            file.read_exact(&mut buf)?;
            out.push((offset, buf));
        }
        Ok(out)
    }

    fn put_file(&self, name: &str, data: &mut dyn Read) -> Result<u64> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.root.join(name))?;
        let size = std::io::copy(data, &mut file)?;
        file.flush()?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_and_readv() -> Result<()> {
        let dir = tempdir().unwrap();
        let transport = LocalTransport::new(dir.path());

        let payload = b"hello index world".to_vec();
        let size = transport.put_file("blob", &mut &payload[..])?;
        assert_eq!(size, payload.len() as u64);

        assert_eq!(transport.get_bytes("blob")?, payload);

        let ranges = transport.readv("blob", &[(0, 5), (6, 5)])?;
        assert_eq!(ranges, vec![(0, b"hello".to_vec()), (6, b"index".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_no_such_file() {
        let dir = tempdir().unwrap();
        let transport = LocalTransport::new(dir.path());
        let err = transport.get_bytes("absent").unwrap_err();
        assert!(err.is_no_such_file());
        let err = transport.readv("absent", &[(0, 1)]).unwrap_err();
        assert!(err.is_no_such_file());
    }
}
