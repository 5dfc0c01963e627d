//! The fixed cipher suite used to secure every block and every RPC frame:
//! AES-128-GCM for AEAD, HMAC-SHA-256 for the Merkle tree's internal nodes.

mod sec_association;

pub use sec_association::{KEY_LEN, NONCE_LEN, SecAssociation, TAG_LEN};
