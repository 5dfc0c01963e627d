//! The fixed-size random-access block store. This is the seam the raw
//! block device backend (out of scope here, `spec.md` §1) would implement;
//! [`FileBlockDevice`] is the only implementation this crate ships, backing
//! the store with a regular file so the engine can be exercised without a
//! real block device.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::BLOCK_SIZE;

/// A fixed-size, randomly addressable store of `BLOCK_SIZE`-byte blocks.
/// Implementations are assumed thread-safe at the granularity of whole-block
/// `get`/`put` (`spec.md` §5).
pub trait BlockDevice: Send + Sync {
    /// Reads the block at `pbid` into `buf`, which must be `BLOCK_SIZE`
    /// bytes.
    fn get(&self, pbid: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `buf` (`BLOCK_SIZE` bytes) to the block at `pbid`.
    fn put(&self, pbid: u64, buf: &[u8]) -> io::Result<()>;

    /// The total number of addressable blocks.
    fn block_count(&self) -> u64;
}

/// A `BlockDevice` backed by a regular file, guarded by a single mutex since
/// `File` doesn't give us positioned reads/writes without shared mutable
/// access to the cursor.
pub struct FileBlockDevice {
    file: Mutex<File>,
    block_count: u64,
}

impl FileBlockDevice {
    /// Opens an existing device file; `block_count` is derived from its
    /// length.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            block_count: len / BLOCK_SIZE as u64,
        })
    }

    /// Creates (or truncates) a device file sized to hold exactly
    /// `block_count` blocks, as used by `bfs-mkfs`.
    pub fn create(path: &Path, block_count: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count * BLOCK_SIZE as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            block_count,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn get(&self, pbid: u64, buf: &mut [u8]) -> io::Result<()> {
        assert_eq!(buf.len(), BLOCK_SIZE, "block reads must be whole blocks");
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(pbid * BLOCK_SIZE as u64))?;
        file.read_exact(buf)
    }

    fn put(&self, pbid: u64, buf: &[u8]) -> io::Result<()> {
        assert_eq!(buf.len(), BLOCK_SIZE, "block writes must be whole blocks");
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(pbid * BLOCK_SIZE as u64))?;
        file.write_all(buf)
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn write_then_read_matches() {
        let tmp = NamedTempFile::new().unwrap();
        let dev = FileBlockDevice::create(tmp.path(), 16).unwrap();
        let mut data = vec![0u8; BLOCK_SIZE];
        data[0] = 0xAB;
        dev.put(3, &data).unwrap();
        let mut out = vec![0u8; BLOCK_SIZE];
        dev.get(3, &mut out).unwrap();
        assert_eq!(data, out);
        assert_eq!(dev.block_count(), 16);
    }
}
