//! On-disk geometry: where each region starts, and the formulas converting
//! an inode id, a vbid, or a dentry index into a block offset. All of
//! `spec.md` §3 ("On-disk layout") lives here as pure arithmetic, so both
//! `bfs-mkfs` (laying the regions out) and the mounted filesystem (walking
//! them) share one source of truth.

use crate::meta::META_SLOT_SIZE;
use crate::{BLOCK_SIZE, INODE_SIZE};

/// Block 0: the superblock.
pub const SUPERBLOCK_BLOCK: u64 = 0;
/// Block 1: the Merkle-tree root-hash record.
pub const ROOT_HASH_BLOCK: u64 = 1;

/// How many (nonce, tag) slots fit in one meta block.
pub const SLOTS_PER_META_BLOCK: u64 = (BLOCK_SIZE / META_SLOT_SIZE) as u64;

/// The concrete block-number boundaries of every on-disk region, computed
/// once at mount/format time from the filesystem's size parameters.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub num_inodes: u64,
    pub num_data_blocks: u64,
    pub bits_per_block: u64,

    pub ibitmap_start: u64,
    pub ibitmap_blocks: u64,

    pub itable_start: u64,
    pub itable_blocks: u64,

    /// (nonce, tag) slots authenticating the inode bitmap and inode table
    /// blocks, mirroring `meta_start`/`meta_blocks` for the data region —
    /// these blocks sit outside the Merkle tree's `N`-leaf address space
    /// (the tree commits to data blocks only) but are still AEAD-encrypted
    /// and tag-checked, since a storage adversary could otherwise tamper an
    /// inode's owner/mode/size/block pointers undetected.
    pub mtab_meta_start: u64,
    pub mtab_meta_blocks: u64,

    pub meta_start: u64,
    pub meta_blocks: u64,

    pub data_start: u64,
}

impl Layout {
    /// Derives a layout from the desired inode count and data block count.
    pub fn new(num_inodes: u64, num_data_blocks: u64) -> Self {
        let bits_per_block = (BLOCK_SIZE * 8) as u64;
        let ibitmap_blocks = ceil_division(num_inodes, bits_per_block);
        let ibitmap_start = ROOT_HASH_BLOCK + 1;

        let itable_start = ibitmap_start + ibitmap_blocks;
        let itable_blocks = ceil_division(num_inodes * INODE_SIZE as u64, BLOCK_SIZE as u64);

        let mtab_meta_start = itable_start + itable_blocks;
        let mtab_meta_blocks = ceil_division(ibitmap_blocks + itable_blocks, SLOTS_PER_META_BLOCK);

        let meta_start = mtab_meta_start + mtab_meta_blocks;
        let meta_blocks = ceil_division(num_data_blocks, SLOTS_PER_META_BLOCK);

        let data_start = meta_start + meta_blocks;

        Self {
            num_inodes,
            num_data_blocks,
            bits_per_block,
            ibitmap_start,
            ibitmap_blocks,
            itable_start,
            itable_blocks,
            mtab_meta_start,
            mtab_meta_blocks,
            meta_start,
            meta_blocks,
            data_start,
        }
    }

    /// Total block count the device must provide to hold this layout.
    pub fn total_blocks(&self) -> u64 {
        self.data_start + self.num_data_blocks
    }

    /// The meta block and in-block byte offset holding `vbid`'s
    /// (nonce, tag) slot.
    pub fn meta_slot_location(&self, vbid: u64) -> (u64, usize) {
        let data_index = vbid - self.data_start;
        let meta_block = self.meta_start + data_index / SLOTS_PER_META_BLOCK;
        let offset = (data_index % SLOTS_PER_META_BLOCK) as usize * META_SLOT_SIZE;
        (meta_block, offset)
    }

    /// The (nonce, tag) slot authenticating the inode-bitmap or inode-table
    /// block at absolute block number `block_no`.
    pub fn mtab_slot_location(&self, block_no: u64) -> (u64, usize) {
        let index = block_no - self.ibitmap_start;
        let block = self.mtab_meta_start + index / SLOTS_PER_META_BLOCK;
        let offset = (index % SLOTS_PER_META_BLOCK) as usize * META_SLOT_SIZE;
        (block, offset)
    }

    /// Whether `vbid` falls in the data region (as opposed to super/bitmap
    /// /itable/meta), per the region check in `spec.md` §4.5.
    pub fn is_data_block(&self, vbid: u64) -> bool {
        vbid >= self.data_start && vbid < self.data_start + self.num_data_blocks
    }

    /// The block and byte offset of inode `ino` (1-indexed; inode 0 is
    /// never used) within the inode table.
    pub fn inode_location(&self, ino: u64) -> (u64, usize) {
        let index = ino - 1;
        let per_block = BLOCK_SIZE as u64 / INODE_SIZE as u64;
        let block = self.itable_start + index / per_block;
        let offset = (index % per_block) as usize * INODE_SIZE;
        (block, offset)
    }
}

pub fn ceil_division(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_regions_are_contiguous_and_ordered() {
        let l = Layout::new(1024, 4096);
        assert_eq!(l.ibitmap_start, ROOT_HASH_BLOCK + 1);
        assert_eq!(l.itable_start, l.ibitmap_start + l.ibitmap_blocks);
        assert_eq!(l.mtab_meta_start, l.itable_start + l.itable_blocks);
        assert_eq!(l.meta_start, l.mtab_meta_start + l.mtab_meta_blocks);
        assert_eq!(l.data_start, l.meta_start + l.meta_blocks);
        assert_eq!(l.total_blocks(), l.data_start + l.num_data_blocks);
    }

    #[test]
    fn meta_slot_location_packs_146_per_block() {
        let l = Layout::new(256, 512);
        let (blk0, off0) = l.meta_slot_location(l.data_start);
        let (blk1, off1) = l.meta_slot_location(l.data_start + 1);
        assert_eq!(blk0, l.meta_start);
        assert_eq!(off0, 0);
        assert_eq!(blk1, l.meta_start);
        assert_eq!(off1, 28);
    }

    #[test]
    fn mtab_slot_location_packs_146_per_block() {
        let l = Layout::new(256, 512);
        let (blk0, off0) = l.mtab_slot_location(l.ibitmap_start);
        let (blk1, off1) = l.mtab_slot_location(l.ibitmap_start + 1);
        assert_eq!(blk0, l.mtab_meta_start);
        assert_eq!(off0, 0);
        assert_eq!(blk1, l.mtab_meta_start);
        assert_eq!(off1, 28);
    }

    #[test]
    fn is_data_block_rejects_metadata_region() {
        let l = Layout::new(256, 512);
        assert!(!l.is_data_block(SUPERBLOCK_BLOCK));
        assert!(!l.is_data_block(l.meta_start));
        assert!(l.is_data_block(l.data_start));
        assert!(!l.is_data_block(l.data_start + l.num_data_blocks));
    }
}
