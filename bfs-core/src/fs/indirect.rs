//! The single indirect block: a packed array of `vbid`s, one per 8 bytes,
//! extending a file past its `NUM_DIRECT_BLOCKS` direct pointers
//! (`spec.md` §3).

use crate::{BLOCK_SIZE, INDIRECT_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectBlock {
    pub entries: [u64; INDIRECT_CAPACITY],
}

impl IndirectBlock {
    pub fn empty() -> Self {
        Self {
            entries: [0u64; INDIRECT_CAPACITY],
        }
    }

    pub fn serialize(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        for (i, v) in self.entries.iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    pub fn deserialize(buf: &[u8; BLOCK_SIZE]) -> Self {
        let mut entries = [0u64; INDIRECT_CAPACITY];
        for (i, e) in entries.iter_mut().enumerate() {
            *e = u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
        }
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_deserialize_roundtrip() {
        let mut ib = IndirectBlock::empty();
        ib.entries[0] = 42;
        ib.entries[511] = 99;
        let buf = ib.serialize();
        let back = IndirectBlock::deserialize(&buf);
        assert_eq!(ib, back);
    }
}
