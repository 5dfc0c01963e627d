//! The superblock: the fixed-field record at block 0 (`spec.md` §3, §6).
//! Stored in the clear like the bitmap and inode table (see `fs::bitmap`'s
//! doc comment for the rationale).

use std::sync::Arc;

use crate::device::BlockDevice;
use crate::error::{IntegrityError, ServerError};
use crate::fs::layout::SUPERBLOCK_BLOCK;
use crate::BLOCK_SIZE;

pub const BFS_MAGIC: u64 = 0xABCD_ABCD_ABCD_ABCD;

/// `spec.md` §9's `ServerState` machine, persisted as a plain integer so a
/// remounting server can tell `Formatted` from `Corrupted`.
pub const SB_STATE_FORMATTED: u64 = 1;
pub const SB_STATE_MOUNTED: u64 = 2;
pub const SB_STATE_CORRUPTED: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u64,
    pub blk_sz: u64,
    pub ino_sz: u64,
    pub no_blocks: u64,
    pub no_dblocks: u64,
    pub no_inodes: u64,
    pub no_dblocks_free: u64,
    pub no_inodes_free: u64,
    pub first_data_blk_loc: u64,
    pub next_vbid: u64,
    pub root_ino: u64,
    pub ibm_ino: u64,
    pub itab_ino: u64,
    pub journal_ino: u64,
    pub first_unresv_ino: u64,
    pub state: u64,
}

const FIELD_COUNT: usize = 16;

impl Superblock {
    pub fn serialize(&self) -> [u8; BLOCK_SIZE] {
        let fields = [
            self.magic,
            self.blk_sz,
            self.ino_sz,
            self.no_blocks,
            self.no_dblocks,
            self.no_inodes,
            self.no_dblocks_free,
            self.no_inodes_free,
            self.first_data_blk_loc,
            self.next_vbid,
            self.root_ino,
            self.ibm_ino,
            self.itab_ino,
            self.journal_ino,
            self.first_unresv_ino,
            self.state,
        ];
        let mut buf = [0u8; BLOCK_SIZE];
        for (i, f) in fields.iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&f.to_le_bytes());
        }
        buf
    }

    pub fn deserialize(buf: &[u8; BLOCK_SIZE]) -> Result<Self, ServerError> {
        let mut fields = [0u64; FIELD_COUNT];
        for (i, f) in fields.iter_mut().enumerate() {
            *f = u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
        }
        if fields[0] != BFS_MAGIC {
            return Err(IntegrityError::RootMismatch.into());
        }
        Ok(Self {
            magic: fields[0],
            blk_sz: fields[1],
            ino_sz: fields[2],
            no_blocks: fields[3],
            no_dblocks: fields[4],
            no_inodes: fields[5],
            no_dblocks_free: fields[6],
            no_inodes_free: fields[7],
            first_data_blk_loc: fields[8],
            next_vbid: fields[9],
            root_ino: fields[10],
            ibm_ino: fields[11],
            itab_ino: fields[12],
            journal_ino: fields[13],
            first_unresv_ino: fields[14],
            state: fields[15],
        })
    }

    pub fn read(device: &Arc<dyn BlockDevice>) -> Result<Self, ServerError> {
        let mut buf = [0u8; BLOCK_SIZE];
        device.get(SUPERBLOCK_BLOCK, &mut buf)?;
        Self::deserialize(&buf)
    }

    pub fn write(&self, device: &Arc<dyn BlockDevice>) -> Result<(), ServerError> {
        device.put(SUPERBLOCK_BLOCK, &self.serialize())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            magic: BFS_MAGIC,
            blk_sz: 4096,
            ino_sz: 256,
            no_blocks: 1000,
            no_dblocks: 800,
            no_inodes: 128,
            no_dblocks_free: 799,
            no_inodes_free: 126,
            first_data_blk_loc: 200,
            next_vbid: 201,
            root_ino: 2,
            ibm_ino: 3,
            itab_ino: 4,
            journal_ino: 5,
            first_unresv_ino: 6,
            state: SB_STATE_FORMATTED,
        }
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let sb = sample();
        let back = Superblock::deserialize(&sb.serialize()).unwrap();
        assert_eq!(sb, back);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = sample().serialize();
        buf[0] ^= 0xff;
        let err = Superblock::deserialize(&buf).unwrap_err();
        assert!(matches!(
            err,
            ServerError::Integrity(IntegrityError::RootMismatch)
        ));
    }
}
