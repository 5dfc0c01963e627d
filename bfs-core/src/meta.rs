//! Packed per-block (nonce, tag) records, stored in the clear in reserved
//! tail blocks. A tamper with a slot isn't covered by the Merkle tree
//! directly; it is still caught transitively, because it makes either
//! decryption of the target block fail or tree verification fail.
//!
//! Two slot tables share this layout: the data-region table (`read_meta`/
//! `write_meta`, keyed by vbid, covered by the Merkle tree) and the
//! `mtab` table (`read_meta_mtab`/`write_meta_mtab`, keyed by the absolute
//! block number of an inode-bitmap or inode-table block). The latter backs
//! [`MetaRegion::read_metadata_block`]/[`MetaRegion::write_metadata_block`],
//! which AEAD-encrypt those blocks the same way [`crate::block_security::BlockSecurityLayer`]
//! does for data blocks, just without Merkle coverage (`DESIGN.md`).

use std::sync::Arc;

use crate::crypto::{SecAssociation, NONCE_LEN, TAG_LEN};
use crate::device::BlockDevice;
use crate::error::{IntegrityError, ServerError};
use crate::fs::layout::Layout;
use crate::BLOCK_SIZE;

pub const META_SLOT_SIZE: usize = NONCE_LEN + TAG_LEN;

/// Reads and writes the (nonce, tag) slots, and the Merkle-tree root-hash
/// block, that live in the reserved regions of the device.
pub struct MetaRegion {
    device: Arc<dyn BlockDevice>,
    layout: Layout,
}

impl MetaRegion {
    pub fn new(device: Arc<dyn BlockDevice>, layout: Layout) -> Self {
        Self { device, layout }
    }

    /// Reads the (nonce, tag) slot for `vbid`.
    pub fn read_meta(&self, vbid: u64) -> Result<([u8; NONCE_LEN], [u8; TAG_LEN]), ServerError> {
        let (block, offset) = self.layout.meta_slot_location(vbid);
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.device.get(block, &mut buf)?;
        let slot = &buf[offset..offset + META_SLOT_SIZE];
        let mut nonce = [0u8; NONCE_LEN];
        let mut tag = [0u8; TAG_LEN];
        nonce.copy_from_slice(&slot[..NONCE_LEN]);
        tag.copy_from_slice(&slot[NONCE_LEN..]);
        Ok((nonce, tag))
    }

    /// Writes the (nonce, tag) slot for `vbid`, read-modify-write on the
    /// containing meta block.
    pub fn write_meta(
        &self,
        vbid: u64,
        nonce: &[u8; NONCE_LEN],
        tag: &[u8; TAG_LEN],
    ) -> Result<(), ServerError> {
        let (block, offset) = self.layout.meta_slot_location(vbid);
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.device.get(block, &mut buf)?;
        buf[offset..offset + NONCE_LEN].copy_from_slice(nonce);
        buf[offset + NONCE_LEN..offset + META_SLOT_SIZE].copy_from_slice(tag);
        self.device.put(block, &buf)?;
        Ok(())
    }

    /// Reads the raw 32-byte root hash record straight off disk, without
    /// decryption. Callers that need the authenticated root go through
    /// [`crate::merkle::MerkleTree`], which decrypts this block with the
    /// server's own `SecAssociation`.
    ///
    /// Freshness of this value across restarts is not guaranteed by this
    /// crate alone: a storage adversary that can replay an old root-hash
    /// block defeats the whole integrity story. Production deployments
    /// must back this with a monotonic counter or TEE-sealed storage, per
    /// `spec.md` §4.3 and §9.
    pub fn read_root_block(&self) -> Result<[u8; BLOCK_SIZE], ServerError> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.get(crate::fs::layout::ROOT_HASH_BLOCK, &mut buf)?;
        Ok(buf)
    }

    pub fn write_root_block(&self, block: &[u8; BLOCK_SIZE]) -> Result<(), ServerError> {
        self.device.put(crate::fs::layout::ROOT_HASH_BLOCK, block)?;
        Ok(())
    }

    /// Reads the (nonce, tag) slot authenticating inode-bitmap/inode-table
    /// block `block_no`.
    pub fn read_meta_mtab(
        &self,
        block_no: u64,
    ) -> Result<([u8; NONCE_LEN], [u8; TAG_LEN]), ServerError> {
        let (block, offset) = self.layout.mtab_slot_location(block_no);
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.device.get(block, &mut buf)?;
        let slot = &buf[offset..offset + META_SLOT_SIZE];
        let mut nonce = [0u8; NONCE_LEN];
        let mut tag = [0u8; TAG_LEN];
        nonce.copy_from_slice(&slot[..NONCE_LEN]);
        tag.copy_from_slice(&slot[NONCE_LEN..]);
        Ok((nonce, tag))
    }

    /// Writes the (nonce, tag) slot authenticating inode-bitmap/inode-table
    /// block `block_no`, read-modify-write on the containing meta block.
    pub fn write_meta_mtab(
        &self,
        block_no: u64,
        nonce: &[u8; NONCE_LEN],
        tag: &[u8; TAG_LEN],
    ) -> Result<(), ServerError> {
        let (block, offset) = self.layout.mtab_slot_location(block_no);
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.device.get(block, &mut buf)?;
        buf[offset..offset + NONCE_LEN].copy_from_slice(nonce);
        buf[offset + NONCE_LEN..offset + META_SLOT_SIZE].copy_from_slice(tag);
        self.device.put(block, &buf)?;
        Ok(())
    }

    /// Decrypts and authenticates the inode-bitmap/inode-table block at
    /// `block_no`, using the caller's `SecAssociation` and the block
    /// address as AAD, the same binding discipline `BlockSecurityLayer`
    /// applies to data blocks. These blocks are outside the Merkle tree's
    /// leaf address space, so a tampered block is caught here by AEAD
    /// authentication rather than by tree verification.
    pub fn read_metadata_block(
        &self,
        sa: &SecAssociation,
        block_no: u64,
    ) -> Result<[u8; BLOCK_SIZE], ServerError> {
        let (nonce, tag) = self.read_meta_mtab(block_no)?;
        let mut ct = vec![0u8; BLOCK_SIZE];
        self.device.get(block_no, &mut ct)?;
        let pt = sa
            .decrypt(&ct, &block_no.to_le_bytes(), &nonce, &tag)
            .map_err(|_| IntegrityError::TagMismatch { vbid: block_no })?;
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&pt);
        Ok(out)
    }

    /// Encrypts `plaintext` and writes it to `block_no`, updating its
    /// authentication slot first so a crash between the two writes never
    /// leaves a ciphertext whose tag doesn't match the recorded one.
    pub fn write_metadata_block(
        &self,
        sa: &SecAssociation,
        block_no: u64,
        plaintext: &[u8; BLOCK_SIZE],
    ) -> Result<(), ServerError> {
        let (ct, nonce, tag) = sa.encrypt(plaintext, &block_no.to_le_bytes())?;
        self.write_meta_mtab(block_no, &nonce, &tag)?;
        self.device.put(block_no, &ct)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileBlockDevice;
    use tempfile::NamedTempFile;

    #[test]
    fn meta_slot_roundtrip() {
        let layout = Layout::new(64, 128);
        let tmp = NamedTempFile::new().unwrap();
        let device: Arc<dyn BlockDevice> =
            Arc::new(FileBlockDevice::create(tmp.path(), layout.total_blocks()).unwrap());
        let meta = MetaRegion::new(device, layout);

        let nonce = [7u8; NONCE_LEN];
        let tag = [9u8; TAG_LEN];
        meta.write_meta(layout.data_start + 5, &nonce, &tag).unwrap();
        let (n, t) = meta.read_meta(layout.data_start + 5).unwrap();
        assert_eq!(n, nonce);
        assert_eq!(t, tag);
    }

    #[test]
    fn distinct_vbids_do_not_clobber_each_other() {
        let layout = Layout::new(64, 512);
        let tmp = NamedTempFile::new().unwrap();
        let device: Arc<dyn BlockDevice> =
            Arc::new(FileBlockDevice::create(tmp.path(), layout.total_blocks()).unwrap());
        let meta = MetaRegion::new(device, layout);

        for i in 0..10u64 {
            let vbid = layout.data_start + i;
            meta.write_meta(vbid, &[i as u8; NONCE_LEN], &[(i * 2) as u8; TAG_LEN])
                .unwrap();
        }
        for i in 0..10u64 {
            let vbid = layout.data_start + i;
            let (n, t) = meta.read_meta(vbid).unwrap();
            assert_eq!(n, [i as u8; NONCE_LEN]);
            assert_eq!(t, [(i * 2) as u8; TAG_LEN]);
        }
    }

    #[test]
    fn metadata_block_roundtrips() {
        use crate::crypto::SecAssociation;

        let layout = Layout::new(64, 128);
        let tmp = NamedTempFile::new().unwrap();
        let device: Arc<dyn BlockDevice> =
            Arc::new(FileBlockDevice::create(tmp.path(), layout.total_blocks()).unwrap());
        let meta = MetaRegion::new(device, layout);
        let sa = SecAssociation::new([5u8; crate::crypto::KEY_LEN]);

        let mut plaintext = [0u8; BLOCK_SIZE];
        plaintext[..4].copy_from_slice(b"inod");
        meta.write_metadata_block(&sa, layout.itable_start, &plaintext)
            .unwrap();
        let out = meta.read_metadata_block(&sa, layout.itable_start).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn metadata_block_tamper_is_detected() {
        use crate::crypto::SecAssociation;

        let layout = Layout::new(64, 128);
        let tmp = NamedTempFile::new().unwrap();
        let device: Arc<dyn BlockDevice> =
            Arc::new(FileBlockDevice::create(tmp.path(), layout.total_blocks()).unwrap());
        let meta = MetaRegion::new(device.clone(), layout);
        let sa = SecAssociation::new([5u8; crate::crypto::KEY_LEN]);

        let plaintext = [0xABu8; BLOCK_SIZE];
        meta.write_metadata_block(&sa, layout.ibitmap_start, &plaintext)
            .unwrap();

        let mut ct = vec![0u8; BLOCK_SIZE];
        device.get(layout.ibitmap_start, &mut ct).unwrap();
        ct[0] ^= 0xff;
        device.put(layout.ibitmap_start, &ct).unwrap();

        let err = meta.read_metadata_block(&sa, layout.ibitmap_start).unwrap_err();
        assert!(matches!(
            err,
            ServerError::Integrity(IntegrityError::TagMismatch { .. })
        ));
    }
}
