//! Core engine for the encrypted block filesystem: crypto, integrity,
//! on-disk layout, caching, and the filesystem operations themselves.
//! `bfs-server` and `bfs-mkfs` are thin drivers over this crate.

pub mod block_security;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod flexbuffer;
pub mod fs;
pub mod logging;
pub mod merkle;
pub mod meta;
pub mod rpc;
pub mod session;
pub mod state;

/// Size in bytes of every block on the device, encrypted or plaintext.
pub const BLOCK_SIZE: usize = 4096;
/// Size in bytes of one packed on-disk inode record.
pub const INODE_SIZE: usize = 256;
/// Direct block pointers carried in every inode.
pub const NUM_DIRECT_BLOCKS: usize = 12;
/// Block pointers reachable through the single indirect block.
pub const INDIRECT_CAPACITY: usize = BLOCK_SIZE / std::mem::size_of::<u64>();
/// Maximum bytes in one path component.
pub const MAX_FILE_NAME_LEN: usize = 255;
/// Maximum bytes in a fully qualified path.
pub const MAX_PATH_LEN: usize = 1024;
/// Packed on-disk size of one directory entry record.
pub const DIRENT_SZ: usize = 263;
/// First file descriptor number handed out to a session (0-2 reserved).
pub const START_FD: u32 = 3;

pub use error::{AccessError, BfsError, BfsResult, ClientError, ServerError};
