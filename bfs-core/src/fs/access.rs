//! The access-control seam. `spec.md` §1 treats ACL as an opaque
//! `is_permitted(user, mode)` predicate the core calls but never
//! implements; this module is exactly that seam plus the one
//! allow-everything implementation this crate ships so the FS operations
//! can be exercised without a real ACL backend wired in.

use crate::fs::inode::Inode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Execute,
}

pub trait AccessControl: Send + Sync {
    fn is_permitted(&self, uid: u32, inode: &Inode, mode: AccessMode) -> bool;
}

/// Grants every request. The default for a crate that doesn't implement
/// the ACL layer itself (`spec.md` §1).
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn is_permitted(&self, _uid: u32, _inode: &Inode, _mode: AccessMode) -> bool {
        true
    }
}

/// A minimal owner-or-world POSIX check, useful for tests that want to
/// exercise the `AccessError` path without a full ACL implementation.
pub struct OwnerWorldCheck;

impl AccessControl for OwnerWorldCheck {
    fn is_permitted(&self, uid: u32, inode: &Inode, mode: AccessMode) -> bool {
        let bit = match mode {
            AccessMode::Read => 0o4,
            AccessMode::Write => 0o2,
            AccessMode::Execute => 0o1,
        };
        let perm = inode.perm_bits();
        if uid == inode.uid {
            perm & (bit << 6) != 0
        } else {
            perm & bit != 0
        }
    }
}
