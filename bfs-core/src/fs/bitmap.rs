//! The inode bitmap: one bit per inode id, packed across
//! `Layout::ibitmap_blocks` blocks starting at `Layout::ibitmap_start`.
//!
//! Every block is AEAD-encrypted and tag-checked through [`MetaRegion`],
//! the same as the inode table (`fs::filesystem`) — these blocks sit
//! outside the Merkle tree's leaf address space, but `spec.md` §1 still
//! requires every persistent block to be encrypted and integrity-checked,
//! so a storage adversary can't flip allocation bits undetected. See
//! `DESIGN.md`.

use std::sync::Arc;

use crate::crypto::SecAssociation;
use crate::error::ServerError;
use crate::fs::layout::Layout;
use crate::meta::MetaRegion;
use crate::BLOCK_SIZE;

/// Inode ids are 1-indexed; id 0 means "no inode" (an empty dentry slot,
/// an unallocated pointer).
pub struct InodeBitmap {
    meta: Arc<MetaRegion>,
    sa: Arc<SecAssociation>,
    layout: Layout,
}

impl InodeBitmap {
    pub fn new(meta: Arc<MetaRegion>, sa: Arc<SecAssociation>, layout: Layout) -> Self {
        Self { meta, sa, layout }
    }

    fn locate(&self, ino: u64) -> (u64, usize, u8) {
        let index = ino - 1;
        let bits_per_block = (BLOCK_SIZE * 8) as u64;
        let block = self.layout.ibitmap_start + index / bits_per_block;
        let bit_in_block = index % bits_per_block;
        let byte = (bit_in_block / 8) as usize;
        let bit = (bit_in_block % 8) as u8;
        (block, byte, bit)
    }

    pub fn is_set(&self, ino: u64) -> Result<bool, ServerError> {
        let (block, byte, bit) = self.locate(ino);
        let buf = self.meta.read_metadata_block(&self.sa, block)?;
        Ok(buf[byte] & (1 << bit) != 0)
    }

    pub fn set(&self, ino: u64, value: bool) -> Result<(), ServerError> {
        let (block, byte, bit) = self.locate(ino);
        let mut buf = self.meta.read_metadata_block(&self.sa, block)?;
        if value {
            buf[byte] |= 1 << bit;
        } else {
            buf[byte] &= !(1 << bit);
        }
        self.meta.write_metadata_block(&self.sa, block, &buf)
    }

    /// Scans for the first clear bit at or after `first_unreserved_ino`,
    /// returning its inode id without setting it (the caller sets it once
    /// it has also written the inode itself, matching `spec.md` §4.7's
    /// allocation sequence).
    pub fn first_free(
        &self,
        first_unreserved_ino: u64,
        num_inodes: u64,
    ) -> Result<Option<u64>, ServerError> {
        for ino in first_unreserved_ino..=num_inodes {
            if !self.is_set(ino)? {
                return Ok(Some(ino));
            }
        }
        Ok(None)
    }

    /// Zeroes every bitmap block, then sets the reserved inode ids
    /// `[1, first_unreserved_ino)` — used by `bfs-mkfs`.
    pub fn format(&self, first_unreserved_ino: u64) -> Result<(), ServerError> {
        let zero = [0u8; BLOCK_SIZE];
        for i in 0..self.layout.ibitmap_blocks {
            self.meta
                .write_metadata_block(&self.sa, self.layout.ibitmap_start + i, &zero)?;
        }
        for ino in 1..first_unreserved_ino {
            self.set(ino, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecAssociation;
    use crate::device::{BlockDevice, FileBlockDevice};
    use tempfile::NamedTempFile;

    fn bitmap() -> InodeBitmap {
        let layout = Layout::new(1024, 64);
        let tmp = NamedTempFile::new().unwrap();
        let device: Arc<dyn BlockDevice> =
            Arc::new(FileBlockDevice::create(tmp.path(), layout.total_blocks()).unwrap());
        let meta = Arc::new(MetaRegion::new(device, layout));
        let sa = Arc::new(SecAssociation::new([6u8; 16]));
        InodeBitmap::new(meta, sa, layout)
    }

    #[test]
    fn set_and_query_roundtrip() {
        let bm = bitmap();
        bm.format(1).unwrap();
        assert!(!bm.is_set(5).unwrap());
        bm.set(5, true).unwrap();
        assert!(bm.is_set(5).unwrap());
        bm.set(5, false).unwrap();
        assert!(!bm.is_set(5).unwrap());
    }

    #[test]
    fn first_free_skips_reserved_and_set_bits() {
        let bm = bitmap();
        bm.format(5).unwrap();
        bm.set(5, true).unwrap();
        assert_eq!(bm.first_free(5, 1024).unwrap(), Some(6));
    }

    #[test]
    fn bits_across_block_boundary_are_independent() {
        let bm = bitmap();
        bm.format(1).unwrap();
        let bits_per_block = (BLOCK_SIZE * 8) as u64;
        bm.set(bits_per_block, true).unwrap();
        bm.set(bits_per_block + 1, true).unwrap();
        assert!(bm.is_set(bits_per_block).unwrap());
        assert!(bm.is_set(bits_per_block + 1).unwrap());
        assert!(!bm.is_set(bits_per_block - 1).unwrap());
    }
}
