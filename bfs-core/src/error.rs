//! The error taxonomy shared by every layer of the storage engine.
//!
//! Three kinds exist, matching how a caller must react: [`ServerError`] is
//! fatal to the owning connection (integrity failures, I/O failures, lock
//! poisoning), [`ClientError`] maps to a POSIX errno and the connection
//! continues, and [`AccessError`] maps to `EACCES`/`EPERM`.

use std::io;

use thiserror::Error;

/// A tag mismatch, tree-root mismatch, or leaf/parent mismatch. Always fatal:
/// the session is dropped and, at mount time, the server refuses to mount.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("AEAD tag verification failed for block {vbid}")]
    TagMismatch { vbid: u64 },
    #[error("merkle leaf/parent hash mismatch at node {node}")]
    TreeMismatch { node: u64 },
    #[error("persisted merkle root does not match the recomputed root")]
    RootMismatch,
}

/// A failure surfaced by the underlying cryptographic primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    EncryptFailed,
    #[error("AEAD authentication failed")]
    AuthenticationFailed,
    #[error("invalid key length: expected {expected}, got {got}")]
    BadKeyLength { expected: usize, got: usize },
}

/// Fatal, logged, connection-dropping errors (`spec.md` §7, category 1-3).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("integrity violation: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("failed to acquire a required lock")]
    Lock,
    #[error("assertion failed: {0}")]
    Assertion(&'static str),
}

/// Errors that are surfaced to the client as a POSIX errno (`spec.md` §7,
/// category 4).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ClientError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("device or resource busy")]
    Busy,
    #[error("is a directory")]
    IsDir,
    #[error("not a directory")]
    NotDir,
    #[error("file name too long")]
    NameTooLong,
    #[error("too many open files")]
    TooManyOpen,
    #[error("no space left on device")]
    NoSpace,
}

impl ClientError {
    /// The POSIX errno this error maps to on the wire.
    pub fn errno(self) -> i32 {
        match self {
            ClientError::NotFound => libc::ENOENT,
            ClientError::Exists => libc::EEXIST,
            ClientError::NotEmpty => libc::ENOTEMPTY,
            ClientError::Busy => libc::EBUSY,
            ClientError::IsDir => libc::EISDIR,
            ClientError::NotDir => libc::ENOTDIR,
            ClientError::NameTooLong => libc::ENAMETOOLONG,
            ClientError::TooManyOpen => libc::EMFILE,
            ClientError::NoSpace => libc::ENOSPC,
        }
    }
}

/// Permission failures (`spec.md` §7, category 5). Mapped to `EACCES`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("permission denied")]
pub struct AccessError;

impl AccessError {
    pub fn errno(self) -> i32 {
        libc::EACCES
    }
}

/// The union of all three error kinds; this is what every FS operation
/// returns.
#[derive(Debug, Error)]
pub enum BfsError {
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Access(#[from] AccessError),
}

impl From<IntegrityError> for BfsError {
    fn from(e: IntegrityError) -> Self {
        BfsError::Server(ServerError::Integrity(e))
    }
}

impl From<CryptoError> for BfsError {
    fn from(e: CryptoError) -> Self {
        BfsError::Server(ServerError::Crypto(e))
    }
}

impl From<io::Error> for BfsError {
    fn from(e: io::Error) -> Self {
        BfsError::Server(ServerError::Io(e))
    }
}

impl BfsError {
    /// Whether this error must terminate the owning connection's worker
    /// loop, per `spec.md` §7's propagation policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BfsError::Server(_))
    }

    /// The errno to place on the wire for non-fatal errors. Returns `None`
    /// for `ServerError`, which has no errno: the connection is dropped
    /// instead.
    pub fn errno(&self) -> Option<i32> {
        match self {
            BfsError::Server(_) => None,
            BfsError::Client(e) => Some(e.errno()),
            BfsError::Access(e) => Some(e.errno()),
        }
    }
}

pub type BfsResult<T> = Result<T, BfsError>;
