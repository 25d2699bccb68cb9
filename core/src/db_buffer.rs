//! Backing storage for an open artifact.

use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::Path;

/// Artifact bytes, either read into memory or mapped from a file.
#[derive(Debug)]
pub enum DbBuffer {
    /// Bytes owned on the heap.
    Owned(Vec<u8>),
    /// A read only memory map of the artifact file.
    Mapped(Mmap),
}

impl DbBuffer {
    /// Read the whole file at path into memory.
    pub fn read_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::Owned(std::fs::read(path)?))
    }

    /// Memory map the file at path.  The artifact format is immutable, the file must not be
    /// modified in place while mapped (publishing a new artifact with rename is fine).
    pub fn map_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            // Can not map an empty file, let the header check reject it.
            return Ok(Self::Owned(Vec::new()));
        }
        // Safety: artifacts are never written after they are published, see above.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self::Mapped(map))
    }

    /// Is this buffer a memory map?
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }
}

impl Deref for DbBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Mapped(map) => map,
        }
    }
}

impl AsRef<[u8]> for DbBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl From<Vec<u8>> for DbBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Owned(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_and_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bytes");
        std::fs::write(&path, b"some bytes").unwrap();
        let read = DbBuffer::read_path(&path).unwrap();
        let mapped = DbBuffer::map_path(&path).unwrap();
        assert!(!read.is_mapped());
        assert!(mapped.is_mapped());
        assert_eq!(&read[..], b"some bytes");
        assert_eq!(read.as_ref(), mapped.as_ref());

        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        assert!(DbBuffer::map_path(&empty).unwrap().is_empty());
        assert!(DbBuffer::map_path(dir.path().join("missing")).is_err());
    }
}
