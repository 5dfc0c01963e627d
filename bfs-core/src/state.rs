//! The server's own lifecycle, made an explicit, passed-around value
//! instead of the source's global mutable singletons (`spec.md` §9's
//! redesign flag on `BfsFsLayer`/`bfsBlockLayer`/static counters).

/// The filesystem's lifecycle. Transitions are one-directional except for
/// `Mounted -> Corrupted`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// No device has been opened yet.
    Uninit,
    /// Device opened, layout computed, nothing loaded from disk yet.
    Initialized,
    /// `bfs-mkfs` is laying out a fresh filesystem.
    Formatting,
    /// Format complete; on-disk structures exist but are unmounted.
    Formatted,
    /// Mounted and serving requests.
    Mounted,
    /// An integrity violation or unrecoverable I/O failure was observed.
    /// No further operations are permitted; the only valid action is to
    /// drop the session.
    Corrupted,
}

impl ServerState {
    /// Whether an FS operation may run in this state.
    pub fn accepts_operations(self) -> bool {
        matches!(self, ServerState::Mounted)
    }
}
