//! The packed on-disk inode format and the in-memory `Inode` object that
//! the inode cache holds (`spec.md` §3, §6).

use crate::{INODE_SIZE, NUM_DIRECT_BLOCKS};

/// "Unallocated" sentinel for a direct/indirect block pointer: any value
/// less than `Layout::data_start` (`spec.md` §3's inode invariant).
pub const UNALLOCATED: u64 = 0;

pub const IFDIR: u32 = libc::S_IFDIR as u32;
pub const IFREG: u32 = libc::S_IFREG as u32;

/// One 256-byte inode record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub i_no: u64,
    pub uid: u32,
    pub mode: u32,
    pub ref_cnt: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub size: u64,
    /// Live dentry count reachable from this directory's own data blocks,
    /// including `.` and `..` — see `DESIGN.md`'s resolution of `spec.md`
    /// §9's open question on `i_links` accounting. Meaningless for
    /// regular files (left at 0).
    pub links: u64,
    pub direct: [u64; NUM_DIRECT_BLOCKS],
    pub indirect: u64,
}

impl Inode {
    pub fn new_file(i_no: u64, uid: u32, mode: u32, now: u64) -> Self {
        Self {
            i_no,
            uid,
            mode: IFREG | (mode & 0o7777),
            ref_cnt: 0,
            atime: now,
            mtime: now,
            ctime: now,
            size: 0,
            links: 0,
            direct: [UNALLOCATED; NUM_DIRECT_BLOCKS],
            indirect: UNALLOCATED,
        }
    }

    pub fn new_dir(i_no: u64, uid: u32, mode: u32, now: u64) -> Self {
        Self {
            i_no,
            uid,
            mode: IFDIR | (mode & 0o7777),
            ref_cnt: 0,
            atime: now,
            mtime: now,
            ctime: now,
            size: 0,
            links: 0,
            direct: [UNALLOCATED; NUM_DIRECT_BLOCKS],
            indirect: UNALLOCATED,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == IFREG
    }

    pub fn perm_bits(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn serialize(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0u8; INODE_SIZE];
        let mut w = 0;
        macro_rules! put_u64 {
            ($v:expr) => {
                buf[w..w + 8].copy_from_slice(&($v).to_le_bytes());
                w += 8;
            };
        }
        macro_rules! put_u32 {
            ($v:expr) => {
                buf[w..w + 4].copy_from_slice(&($v).to_le_bytes());
                w += 4;
            };
        }
        put_u64!(self.i_no);
        put_u32!(self.uid);
        put_u32!(self.mode);
        put_u64!(self.ref_cnt);
        put_u64!(self.atime);
        put_u64!(self.mtime);
        put_u64!(self.ctime);
        put_u64!(self.size);
        put_u64!(self.links);
        for d in self.direct {
            put_u64!(d);
        }
        put_u64!(self.indirect);
        buf
    }

    pub fn deserialize(buf: &[u8; INODE_SIZE]) -> Self {
        let mut r = 0;
        macro_rules! get_u64 {
            () => {{
                let v = u64::from_le_bytes(buf[r..r + 8].try_into().unwrap());
                r += 8;
                v
            }};
        }
        macro_rules! get_u32 {
            () => {{
                let v = u32::from_le_bytes(buf[r..r + 4].try_into().unwrap());
                r += 4;
                v
            }};
        }
        let i_no = get_u64!();
        let uid = get_u32!();
        let mode = get_u32!();
        let ref_cnt = get_u64!();
        let atime = get_u64!();
        let mtime = get_u64!();
        let ctime = get_u64!();
        let size = get_u64!();
        let links = get_u64!();
        let mut direct = [0u64; NUM_DIRECT_BLOCKS];
        for d in direct.iter_mut() {
            *d = get_u64!();
        }
        let indirect = get_u64!();
        Self {
            i_no,
            uid,
            mode,
            ref_cnt,
            atime,
            mtime,
            ctime,
            size,
            links,
            direct,
            indirect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_deserialize_roundtrip() {
        let mut ino = Inode::new_dir(7, 1000, 0o755, 12345);
        ino.direct[0] = 99;
        ino.indirect = 200;
        ino.links = 2;
        let buf = ino.serialize();
        let back = Inode::deserialize(&buf);
        assert_eq!(ino, back);
        assert!(back.is_dir());
        assert_eq!(back.perm_bits(), 0o755);
    }

    #[test]
    fn new_file_has_ifreg_set() {
        let ino = Inode::new_file(2, 0, 0o644, 0);
        assert!(ino.is_reg());
        assert!(!ino.is_dir());
    }
}
