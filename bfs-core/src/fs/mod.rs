//! The ext2/3-style filesystem object layer: superblock, inode bitmap,
//! inodes, directory entries, and the `Filesystem` handle that exposes
//! the full operation surface in [`ops`] (`spec.md` §3, §4.6-4.7).

pub mod access;
pub mod bitmap;
pub mod dentry;
pub mod filesystem;
pub mod indirect;
pub mod inode;
pub mod layout;
pub mod ops;
pub mod open_file;
pub mod superblock;

pub use access::{AccessControl, AccessMode, AllowAll, OwnerWorldCheck};
pub use dentry::DirEntry;
pub use filesystem::{Filesystem, FIRST_UNRESV_INO, IBM_INO, ITAB_INO, JOURNAL_INO, ROOT_INO};
pub use inode::Inode;
pub use layout::Layout;
pub use ops::{Attr, OpenFlags};
pub use open_file::OpenFile;
pub use superblock::Superblock;
