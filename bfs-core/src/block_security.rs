//! Orchestrates a single logical block's read/write: metadata, the AEAD
//! encrypt/decrypt step, the Merkle tree, and the underlying device, in the
//! order `spec.md` §4.5 lays out.

use std::sync::Arc;

use crate::crypto::{SecAssociation, TAG_LEN};
use crate::device::BlockDevice;
use crate::error::{IntegrityError, ServerError};
use crate::fs::layout::Layout;
use crate::merkle::MerkleTree;
use crate::meta::MetaRegion;
use crate::BLOCK_SIZE;

bitflags::bitflags! {
    /// Write flags; `SYNC` forces root persistence before returning.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        const NONE = 0;
        const SYNC = 1 << 0;
    }
}

/// The seam between file-system objects and the raw, encrypted device.
pub struct BlockSecurityLayer {
    device: Arc<dyn BlockDevice>,
    meta: Arc<MetaRegion>,
    tree: Arc<MerkleTree>,
    sa: Arc<SecAssociation>,
    layout: Layout,
    merkle_enabled: bool,
}

impl BlockSecurityLayer {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        meta: Arc<MetaRegion>,
        tree: Arc<MerkleTree>,
        sa: Arc<SecAssociation>,
        layout: Layout,
        merkle_enabled: bool,
    ) -> Self {
        Self {
            device,
            meta,
            tree,
            sa,
            layout,
            merkle_enabled,
        }
    }

    /// Reads and decrypts `vbid`, verifying its tag against the Merkle tree
    /// unless the integrity layer has been disabled in config.
    pub fn read_blk(&self, vbid: u64) -> Result<[u8; BLOCK_SIZE], ServerError> {
        if !self.layout.is_data_block(vbid) {
            return Err(ServerError::Assertion("read_blk: vbid outside data region"));
        }
        let (nonce, tag) = self.meta.read_meta(vbid)?;
        let mut ct = vec![0u8; BLOCK_SIZE];
        self.device.get(vbid, &mut ct)?;
        let pt = self
            .sa
            .decrypt(&ct, &vbid.to_le_bytes(), &nonce, &tag)
            .map_err(|_| IntegrityError::TagMismatch { vbid })?;
        if self.merkle_enabled {
            self.tree.verify(vbid - self.layout.data_start, &tag)?;
        }
        let mut out = [0u8; BLOCK_SIZE];
        if pt.len() != BLOCK_SIZE {
            return Err(ServerError::Assertion("decrypted block has wrong length"));
        }
        out.copy_from_slice(&pt);
        Ok(out)
    }

    /// Encrypts and writes `plaintext` to `vbid`, updating metadata and the
    /// Merkle tree. Persists the root immediately when `flags` carries
    /// `SYNC`.
    pub fn write_blk(
        &self,
        vbid: u64,
        plaintext: &[u8; BLOCK_SIZE],
        flags: WriteFlags,
    ) -> Result<(), ServerError> {
        if !self.layout.is_data_block(vbid) {
            return Err(ServerError::Assertion("write_blk: vbid outside data region"));
        }
        let (ct, nonce, tag) = self.sa.encrypt(plaintext, &vbid.to_le_bytes())?;
        self.meta.write_meta(vbid, &nonce, &tag)?;
        self.device.put(vbid, &ct)?;
        if self.merkle_enabled {
            let leaf_tag = tag_as_leaf(&tag);
            self.tree.update(
                vbid - self.layout.data_start,
                &leaf_tag,
                flags.contains(WriteFlags::SYNC),
            )?;
        }
        Ok(())
    }

    /// Writes a contiguous run of blocks, recomputing the tree once instead
    /// of once per block (`spec.md` §4.4's batch update).
    pub fn write_blk_batch(
        &self,
        first_vbid: u64,
        plaintexts: &[[u8; BLOCK_SIZE]],
        flags: WriteFlags,
    ) -> Result<(), ServerError> {
        let mut updates = Vec::with_capacity(plaintexts.len());
        for (i, pt) in plaintexts.iter().enumerate() {
            let vbid = first_vbid + i as u64;
            if !self.layout.is_data_block(vbid) {
                return Err(ServerError::Assertion("write_blk_batch: vbid outside data region"));
            }
            let (ct, nonce, tag) = self.sa.encrypt(pt, &vbid.to_le_bytes())?;
            self.meta.write_meta(vbid, &nonce, &tag)?;
            self.device.put(vbid, &ct)?;
            updates.push((vbid - self.layout.data_start, tag_as_leaf(&tag)));
        }
        if self.merkle_enabled {
            self.tree
                .update_batch(&updates, flags.contains(WriteFlags::SYNC))?;
        }
        Ok(())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }
}

fn tag_as_leaf(tag: &[u8; TAG_LEN]) -> [u8; TAG_LEN] {
    *tag
}
