//! The open-file table: `(inode_id, offset)` handles, with a separate
//! numeric range for directory handles so `release` can route without an
//! extra lookup (`spec.md` §3's `OpenFile`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{BfsError, ClientError};
use crate::START_FD;

/// First fd handed out in the directory-handle range, chosen so a bare
/// numeric comparison tells `release` which table to free from without
/// carrying a separate tag alongside the handle.
pub const DIR_FD_BASE: u64 = 1_000_000 + START_FD as u64;

#[derive(Debug, Clone, Copy)]
pub struct OpenFile {
    pub inode_id: u64,
    pub offset: u64,
}

pub fn is_dir_handle(fd: u64) -> bool {
    fd >= DIR_FD_BASE
}

/// Guarded by a single mutex with short critical sections, per `spec.md`
/// §5.
pub struct OpenFileTable {
    files: Mutex<HashMap<u64, OpenFile>>,
    next_file_fd: AtomicU64,
    next_dir_fd: AtomicU64,
    max_open: usize,
}

impl OpenFileTable {
    pub fn new(max_open: usize) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            next_file_fd: AtomicU64::new(START_FD as u64),
            next_dir_fd: AtomicU64::new(DIR_FD_BASE),
            max_open,
        }
    }

    pub fn open(&self, inode_id: u64, offset: u64, is_dir: bool) -> Result<u64, BfsError> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        if files.len() >= self.max_open {
            return Err(ClientError::TooManyOpen.into());
        }
        let fd = if is_dir {
            self.next_dir_fd.fetch_add(1, Ordering::SeqCst)
        } else {
            self.next_file_fd.fetch_add(1, Ordering::SeqCst)
        };
        files.insert(fd, OpenFile { inode_id, offset });
        Ok(fd)
    }

    pub fn get(&self, fd: u64) -> Option<OpenFile> {
        self.files.lock().unwrap_or_else(|e| e.into_inner()).get(&fd).copied()
    }

    pub fn set_offset(&self, fd: u64, offset: u64) {
        if let Some(entry) = self.files.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&fd) {
            entry.offset = offset;
        }
    }

    pub fn release(&self, fd: u64) -> Option<OpenFile> {
        self.files.lock().unwrap_or_else(|e| e.into_inner()).remove(&fd)
    }

    pub fn count_open_for(&self, inode_id: u64) -> usize {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|f| f.inode_id == inode_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_and_dir_fds_come_from_disjoint_ranges() {
        let t = OpenFileTable::new(16);
        let file_fd = t.open(1, 0, false).unwrap();
        let dir_fd = t.open(2, 0, true).unwrap();
        assert!(!is_dir_handle(file_fd));
        assert!(is_dir_handle(dir_fd));
    }

    #[test]
    fn too_many_open_is_rejected() {
        let t = OpenFileTable::new(1);
        t.open(1, 0, false).unwrap();
        let err = t.open(2, 0, false).unwrap_err();
        assert!(matches!(err, BfsError::Client(ClientError::TooManyOpen)));
    }

    #[test]
    fn release_frees_the_slot() {
        let t = OpenFileTable::new(1);
        let fd = t.open(1, 0, false).unwrap();
        assert!(t.release(fd).is_some());
        assert!(t.open(2, 0, false).is_ok());
    }
}
