//! Per-connection state: the client's identity, its bound `SecAssociation`,
//! and the send/receive sequence counters bound into every frame's AAD
//! (`spec.md` §3's `UserContext`, §4.8's sequence-number binding).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::crypto::SecAssociation;

/// Created on client connect, destroyed on disconnect; the session keys
/// are freed with it (`spec.md` §3's lifecycle rules).
pub struct UserContext {
    pub uid: u32,
    sa: SecAssociation,
    send_seq: AtomicU32,
    recv_seq: AtomicU32,
}

impl UserContext {
    pub fn new(uid: u32, sa: SecAssociation) -> Self {
        Self {
            uid,
            sa,
            send_seq: AtomicU32::new(0),
            recv_seq: AtomicU32::new(0),
        }
    }

    pub fn sa(&self) -> &SecAssociation {
        &self.sa
    }

    /// The sequence number to bind as AAD on the next frame this side
    /// sends, incrementing it for the one after.
    pub fn next_send_seq(&self) -> u32 {
        self.send_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// The sequence number the next received frame must carry. Call
    /// [`Self::advance_recv_seq`] only after the frame authenticates.
    pub fn expected_recv_seq(&self) -> u32 {
        self.recv_seq.load(Ordering::SeqCst)
    }

    /// Advances the expected receive sequence after a frame has
    /// successfully authenticated against it. A caller that authenticates
    /// with a stale or future sequence number must drop the connection
    /// instead of calling this (`spec.md` §4.8: mismatch drops the
    /// connection).
    pub fn advance_recv_seq(&self) {
        self.recv_seq.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_seq_increments_each_call() {
        let ctx = UserContext::new(1000, SecAssociation::new([0u8; 16]));
        assert_eq!(ctx.next_send_seq(), 0);
        assert_eq!(ctx.next_send_seq(), 1);
        assert_eq!(ctx.next_send_seq(), 2);
    }

    #[test]
    fn recv_seq_only_advances_explicitly() {
        let ctx = UserContext::new(1000, SecAssociation::new([0u8; 16]));
        assert_eq!(ctx.expected_recv_seq(), 0);
        assert_eq!(ctx.expected_recv_seq(), 0);
        ctx.advance_recv_seq();
        assert_eq!(ctx.expected_recv_seq(), 1);
    }
}
