//! Directory entries and the single parameterized directory-scan routine
//! that backs `get_de`/`readdir`/`create`'s "find a free slot" step
//! (`spec.md` §4.7's "directory entry search handlers": one routine,
//! parameterized by handler code, collapsing three duplicated scans in
//! the source).

use crate::{DIRENT_SZ, MAX_FILE_NAME_LEN};

/// One directory entry record: an inode id plus a null-padded name. An
/// empty slot has `ino == 0` and an empty name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
}

impl DirEntry {
    pub fn empty() -> Self {
        Self {
            ino: 0,
            name: String::new(),
        }
    }

    pub fn is_empty_slot(&self) -> bool {
        self.ino == 0
    }

    pub fn serialize(&self) -> [u8; DIRENT_SZ] {
        let mut buf = [0u8; DIRENT_SZ];
        buf[..8].copy_from_slice(&self.ino.to_le_bytes());
        let name_bytes = self.name.as_bytes();
        let n = name_bytes.len().min(MAX_FILE_NAME_LEN);
        buf[8..8 + n].copy_from_slice(&name_bytes[..n]);
        buf
    }

    pub fn deserialize(buf: &[u8; DIRENT_SZ]) -> Self {
        let ino = u64::from_le_bytes(buf[..8].try_into().unwrap());
        let name_region = &buf[8..];
        let end = name_region.iter().position(|&b| b == 0).unwrap_or(name_region.len());
        let name = String::from_utf8_lossy(&name_region[..end]).into_owned();
        Self { ino, name }
    }
}

/// How many dentries fit in one data block.
pub const DENTRIES_PER_BLOCK: usize = crate::BLOCK_SIZE / DIRENT_SZ;

/// Splits a data block's payload into its dentry slots, deserializing
/// each. Trailing bytes that don't fill a whole slot are unused padding.
pub fn dentries_in_block(block: &[u8; crate::BLOCK_SIZE]) -> Vec<DirEntry> {
    (0..DENTRIES_PER_BLOCK)
        .map(|i| {
            let start = i * DIRENT_SZ;
            let mut raw = [0u8; DIRENT_SZ];
            raw.copy_from_slice(&block[start..start + DIRENT_SZ]);
            DirEntry::deserialize(&raw)
        })
        .collect()
}

/// Writes `entries` back into a block buffer at their slot positions.
pub fn pack_block(entries: &[DirEntry]) -> [u8; crate::BLOCK_SIZE] {
    let mut block = [0u8; crate::BLOCK_SIZE];
    for (i, e) in entries.iter().enumerate().take(DENTRIES_PER_BLOCK) {
        let start = i * DIRENT_SZ;
        block[start..start + DIRENT_SZ].copy_from_slice(&e.serialize());
    }
    block
}

/// The three handler codes `spec.md` §4.7 collapses into one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode<'a> {
    /// Return the first dentry whose name matches.
    GetDe(&'a str),
    /// Collect every live dentry.
    ReadDir,
    /// Return the location of the first empty slot.
    FindEmpty,
}

/// The outcome of a directory scan: a live dentry at `(block_index, slot)`,
/// every live dentry (`ReadDir`), or an empty slot's location.
pub enum ScanResult {
    Found { block_index: usize, slot: usize, entry: DirEntry },
    All(Vec<DirEntry>),
    EmptySlot { block_index: usize, slot: usize },
    /// `FindEmpty` only: the scan reached an unallocated block pointer
    /// before finding a free slot in any allocated block. The caller
    /// should allocate a fresh block at `block_index`.
    NoBlockAt { block_index: usize },
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_deserialize_roundtrip() {
        let de = DirEntry {
            ino: 42,
            name: "hello.txt".to_string(),
        };
        let buf = de.serialize();
        let back = DirEntry::deserialize(&buf);
        assert_eq!(de, back);
    }

    #[test]
    fn empty_slot_roundtrips() {
        let de = DirEntry::empty();
        assert!(de.is_empty_slot());
        let back = DirEntry::deserialize(&de.serialize());
        assert!(back.is_empty_slot());
    }

    #[test]
    fn pack_and_unpack_a_block() {
        let entries = vec![
            DirEntry { ino: 1, name: ".".to_string() },
            DirEntry { ino: 2, name: "..".to_string() },
        ];
        let block = pack_block(&entries);
        let back = dentries_in_block(&block);
        assert_eq!(back[0], entries[0]);
        assert_eq!(back[1], entries[1]);
        assert!(back[2].is_empty_slot());
    }
}
