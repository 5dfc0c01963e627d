//! `SecAssociation` owns one symmetric key and provides the two primitives
//! every other layer builds on: AEAD encrypt/decrypt, and HMAC over a pair
//! of hashes for the Merkle tree.
//!
//! Mirrors the original `bfsSecAssociation`: a bound (initiator, responder)
//! pair is implied by whichever two endpoints share the key, but this crate
//! only needs the key itself, since the identity bookkeeping lives in
//! `UserContext`.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::error::CryptoError;

pub const KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const HMAC_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Binds one AES-128-GCM/HMAC-SHA-256 key to both its AEAD and MAC uses.
pub struct SecAssociation {
    key: [u8; KEY_LEN],
}

impl SecAssociation {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Parses a key from a byte slice of exactly [`KEY_LEN`] bytes.
    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::BadKeyLength {
                expected: KEY_LEN,
                got: key.len(),
            });
        }
        let mut k = [0u8; KEY_LEN];
        k.copy_from_slice(key);
        Ok(Self::new(k))
    }

    /// Encrypts `plaintext` in place, returning the fresh random nonce and
    /// the authentication tag. `aad` is always non-empty and binds the
    /// ciphertext to its context (a block address, a sequence number, ...).
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; NONCE_LEN], [u8; TAG_LEN]), CryptoError> {
        debug_assert!(!aad.is_empty(), "AAD must be non-empty");
        let cipher = Aes128Gcm::new_from_slice(&self.key)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;
        let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut tag_out = [0u8; TAG_LEN];
        tag_out.copy_from_slice(tag);
        Ok((ct.to_vec(), nonce_bytes, tag_out))
    }

    /// Verifies `tag` against `ciphertext`/`aad`/`nonce` and returns the
    /// plaintext. Any tag mismatch is reported as `AuthenticationFailed`,
    /// never a partial/garbage plaintext.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        aad: &[u8],
        nonce: &[u8; NONCE_LEN],
        tag: &[u8; TAG_LEN],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes128Gcm::new_from_slice(&self.key)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let nonce = Nonce::from_slice(nonce);
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);
        cipher
            .decrypt(nonce, Payload { msg: &sealed, aad })
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// HMAC-SHA-256 over `left || right`, used only by the Merkle tree to
    /// combine two child hashes into a parent hash.
    pub fn hmac(&self, left: &[u8], right: &[u8]) -> [u8; HMAC_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(left);
        mac.update(right);
        let out = mac.finalize().into_bytes();
        let mut result = [0u8; HMAC_LEN];
        result.copy_from_slice(&out);
        result
    }

    /// PKCS#7 padding, used only for variable-length RPC payloads, never
    /// for fixed-4096-byte blocks.
    pub fn pkcs7_pad(data: &mut Vec<u8>, block_size: usize) {
        let pad_len = block_size - (data.len() % block_size);
        let pad_len = if pad_len == 0 { block_size } else { pad_len };
        data.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    }

    /// Removes PKCS#7 padding, validating that the pad bytes are consistent.
    pub fn pkcs7_unpad(data: &mut Vec<u8>) -> Result<(), CryptoError> {
        let pad_len = *data.last().ok_or(CryptoError::AuthenticationFailed)? as usize;
        if pad_len == 0 || pad_len > data.len() {
            return Err(CryptoError::AuthenticationFailed);
        }
        if !data[data.len() - pad_len..].iter().all(|&b| b as usize == pad_len) {
            return Err(CryptoError::AuthenticationFailed);
        }
        data.truncate(data.len() - pad_len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa() -> SecAssociation {
        SecAssociation::new([7u8; KEY_LEN])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let sa = sa();
        let plaintext = b"the quick brown fox".to_vec();
        let (ct, nonce, tag) = sa.encrypt(&plaintext, b"aad-context").unwrap();
        let pt = sa.decrypt(&ct, b"aad-context", &nonce, &tag).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn tampered_tag_fails_authentication() {
        let sa = sa();
        let (ct, nonce, mut tag) = sa.encrypt(b"payload", b"ctx").unwrap();
        tag[0] ^= 0xff;
        let err = sa.decrypt(&ct, b"ctx", &nonce, &tag).unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed));
    }

    #[test]
    fn mismatched_aad_fails_authentication() {
        let sa = sa();
        let (ct, nonce, tag) = sa.encrypt(b"payload", b"ctx-a").unwrap();
        let err = sa.decrypt(&ct, b"ctx-b", &nonce, &tag).unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed));
    }

    #[test]
    fn hmac_is_order_sensitive() {
        let sa = sa();
        let a = sa.hmac(b"left", b"right");
        let b = sa.hmac(b"right", b"left");
        assert_ne!(a, b);
    }

    #[test]
    fn pkcs7_pad_unpad_roundtrip() {
        let mut data = b"hello".to_vec();
        let original = data.clone();
        SecAssociation::pkcs7_pad(&mut data, 16);
        assert_eq!(data.len() % 16, 0);
        SecAssociation::pkcs7_unpad(&mut data).unwrap();
        assert_eq!(data, original);
    }
}
