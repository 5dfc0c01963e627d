//! A full binary tree over the `N` data blocks: leaves are AEAD tags,
//! internal nodes are `HMAC(left || right)`. The root commits to every
//! leaf and is persisted (encrypted, under the server's own
//! `SecAssociation`) in a reserved block.

use std::sync::{Arc, RwLock};

use crate::crypto::{SecAssociation, TAG_LEN};
use crate::error::{IntegrityError, ServerError};
use crate::meta::MetaRegion;
use crate::BLOCK_SIZE;

const ROOT_HASH_AAD: &[u8] = b"mt-root";
pub const ROOT_HASH_LEN: usize = 32;

/// Tree lifecycle, per `spec.md` §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Uninit,
    Initialized,
    Flushed,
}

struct Inner {
    /// `2n - 1` heap-ordered hashes; `nodes[i + (n-1)]` is leaf `i`.
    nodes: Vec<[u8; TAG_LEN.max(ROOT_HASH_LEN)]>,
    state: TreeState,
}

/// The Merkle tree over the entire virtual block address space. Held
/// process-lived: allocated at mount, freed at destroy.
pub struct MerkleTree {
    n: u64,
    /// The absolute vbid of data block 0; leaf `i` corresponds to vbid
    /// `data_start + i` in [`MetaRegion`], which is keyed by absolute vbid.
    data_start: u64,
    inner: RwLock<Inner>,
    meta: Arc<MetaRegion>,
    sa: Arc<SecAssociation>,
    paranoid: bool,
}

fn leaf_index(n: u64, vbid: u64) -> usize {
    (vbid + (n - 1)) as usize
}

fn parent_index(i: usize) -> Option<usize> {
    if i == 0 {
        None
    } else {
        Some((i - 1) / 2)
    }
}

fn sibling_index(i: usize) -> usize {
    if i % 2 == 0 {
        i - 1
    } else {
        i + 1
    }
}

/// Whether heap index `i` is a leaf in an `n`-leaf tree (`n - 1` internal
/// nodes precede the leaves in heap order).
fn is_leaf(n: u64, i: usize) -> bool {
    i >= (n - 1) as usize
}

/// The meaningful byte width stored at heap index `i`: `TAG_LEN` for a leaf
/// (an AEAD tag), `ROOT_HASH_LEN` for an internal node (an HMAC output). The
/// build path and the verify path must agree on this per-node, not assume a
/// single width, since a tree taller than two levels hashes internal nodes
/// together as often as it hashes leaf pairs.
fn node_width(n: u64, i: usize) -> usize {
    if is_leaf(n, i) {
        TAG_LEN
    } else {
        ROOT_HASH_LEN
    }
}

impl MerkleTree {
    /// Allocates an empty tree over `n` leaves (`n` must be a power of two).
    /// `data_start` is the absolute vbid of leaf 0, since [`MetaRegion`] is
    /// keyed by absolute vbid while the tree itself is indexed 0..n.
    pub fn new(
        n: u64,
        data_start: u64,
        meta: Arc<MetaRegion>,
        sa: Arc<SecAssociation>,
        paranoid: bool,
    ) -> Self {
        assert!(n.is_power_of_two(), "N must be a power of two");
        let num_nodes = (2 * n - 1) as usize;
        Self {
            n,
            data_start,
            inner: RwLock::new(Inner {
                nodes: vec![[0u8; TAG_LEN.max(ROOT_HASH_LEN)]; num_nodes],
                state: TreeState::Uninit,
            }),
            meta,
            sa,
            paranoid,
        }
    }

    /// Builds the tree from the current meta-region tags and, unless
    /// `initial` (the format path), verifies the recomputed root against
    /// the persisted one.
    pub fn init(&self, initial: bool) -> Result<(), ServerError> {
        let mut inner = self.inner.write().unwrap();
        for i in 0..self.n {
            if initial {
                continue;
            }
            let (_, tag) = self.meta.read_meta(self.data_start + i)?;
            let leaf = leaf_index(self.n, i);
            inner.nodes[leaf][..TAG_LEN].copy_from_slice(&tag);
        }
        if !initial {
            Self::recompute_internal(&mut inner.nodes, self.n, &self.sa);
            let persisted = self.read_persisted_root()?;
            let computed = &inner.nodes[0][..ROOT_HASH_LEN];
            if persisted.as_deref() != Some(computed) {
                return Err(IntegrityError::RootMismatch.into());
            }
        }
        inner.state = TreeState::Initialized;
        Ok(())
    }

    fn recompute_internal(
        nodes: &mut [[u8; TAG_LEN.max(ROOT_HASH_LEN)]],
        n: u64,
        sa: &SecAssociation,
    ) {
        let first_internal = (n - 1) as usize;
        for i in (0..first_internal).rev() {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let lw = node_width(n, left);
            let rw = node_width(n, right);
            let h = sa.hmac(&nodes[left][..lw], &nodes[right][..rw]);
            nodes[i][..ROOT_HASH_LEN].copy_from_slice(&h);
        }
    }

    /// Verifies that `tag` is consistent with the currently trusted
    /// in-memory path from leaf `vbid` to the root. Stops after one level
    /// unless `paranoid` is set, in which case it always walks to the root
    /// (`spec.md` §4.4).
    pub fn verify(&self, vbid: u64, tag: &[u8; TAG_LEN]) -> Result<(), ServerError> {
        let inner = self.inner.read().unwrap();
        let mut idx = leaf_index(self.n, vbid);
        let mut current_hash = [0u8; ROOT_HASH_LEN];
        current_hash[..TAG_LEN].copy_from_slice(tag);
        let mut cur_width = TAG_LEN;
        let mut levels = 0usize;
        loop {
            let Some(parent) = parent_index(idx) else {
                break;
            };
            let sib = sibling_index(idx);
            // `sib` is always at the same depth as `idx`, so it carries the
            // same meaningful width as `current_hash` currently does.
            let (left_hash, right_hash) = if idx % 2 == 1 {
                (&current_hash[..cur_width], &inner.nodes[sib][..cur_width])
            } else {
                (&inner.nodes[sib][..cur_width], &current_hash[..cur_width])
            };
            let expected = self.sa.hmac(left_hash, right_hash);
            let stored = &inner.nodes[parent][..ROOT_HASH_LEN];
            if expected != stored {
                return Err(IntegrityError::TreeMismatch { node: parent as u64 }.into());
            }
            current_hash[..ROOT_HASH_LEN].copy_from_slice(&expected);
            idx = parent;
            cur_width = ROOT_HASH_LEN;
            levels += 1;
            if !self.paranoid && levels >= 1 {
                break;
            }
        }
        Ok(())
    }

    /// Swaps in the new tag at `vbid`'s leaf and recomputes every ancestor.
    /// If `sync`, the new root is persisted before returning.
    pub fn update(&self, vbid: u64, tag: &[u8; TAG_LEN], sync: bool) -> Result<(), ServerError> {
        let mut inner = self.inner.write().unwrap();
        let mut idx = leaf_index(self.n, vbid);
        inner.nodes[idx][..TAG_LEN].copy_from_slice(tag);
        while let Some(parent) = parent_index(idx) {
            let left = 2 * parent + 1;
            let right = 2 * parent + 2;
            let lw = node_width(self.n, left);
            let rw = node_width(self.n, right);
            let h = self.sa.hmac(&inner.nodes[left][..lw], &inner.nodes[right][..rw]);
            inner.nodes[parent][..ROOT_HASH_LEN].copy_from_slice(&h);
            idx = parent;
        }
        if sync {
            self.persist_root(&inner.nodes[0][..ROOT_HASH_LEN])?;
        }
        Ok(())
    }

    /// Updates every leaf in `updates`, then recomputes the unique set of
    /// ancestors once, deepest-first, so each HMAC sees already-updated
    /// children (`spec.md` §4.4's batch update).
    pub fn update_batch(
        &self,
        updates: &[(u64, [u8; TAG_LEN])],
        sync: bool,
    ) -> Result<(), ServerError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap();
        let mut dirty = std::collections::BTreeSet::new();
        for (vbid, tag) in updates {
            let leaf = leaf_index(self.n, *vbid);
            inner.nodes[leaf][..TAG_LEN].copy_from_slice(tag);
            if let Some(p) = parent_index(leaf) {
                dirty.insert(p);
            }
        }
        while let Some(&deepest) = dirty.iter().next_back() {
            dirty.remove(&deepest);
            let left = 2 * deepest + 1;
            let right = 2 * deepest + 2;
            let lw = node_width(self.n, left);
            let rw = node_width(self.n, right);
            let h = self.sa.hmac(&inner.nodes[left][..lw], &inner.nodes[right][..rw]);
            inner.nodes[deepest][..ROOT_HASH_LEN].copy_from_slice(&h);
            if let Some(p) = parent_index(deepest) {
                dirty.insert(p);
            }
        }
        if sync {
            self.persist_root(&inner.nodes[0][..ROOT_HASH_LEN])?;
        }
        Ok(())
    }

    /// Encrypts and writes the current root hash to its reserved block.
    pub fn persist_root(&self, root: &[u8]) -> Result<(), ServerError> {
        let (ct, nonce, tag) = self.sa.encrypt(root, ROOT_HASH_AAD)?;
        let mut block = [0u8; BLOCK_SIZE];
        block[..crate::crypto::NONCE_LEN].copy_from_slice(&nonce);
        block[crate::crypto::NONCE_LEN..crate::crypto::NONCE_LEN + crate::crypto::TAG_LEN]
            .copy_from_slice(&tag);
        let ct_start = crate::crypto::NONCE_LEN + crate::crypto::TAG_LEN;
        block[ct_start..ct_start + ct.len()].copy_from_slice(&ct);
        self.meta.write_root_block(&block)
    }

    fn read_persisted_root(&self) -> Result<Option<Vec<u8>>, ServerError> {
        let block = self.meta.read_root_block()?;
        let nonce_len = crate::crypto::NONCE_LEN;
        let tag_len = crate::crypto::TAG_LEN;
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&block[..nonce_len]);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&block[nonce_len..nonce_len + tag_len]);
        let ct = &block[nonce_len + tag_len..nonce_len + tag_len + ROOT_HASH_LEN];
        if ct.iter().all(|&b| b == 0) && tag.iter().all(|&b| b == 0) {
            // Freshly formatted device: no root persisted yet.
            return Ok(None);
        }
        let pt = self.sa.decrypt(ct, ROOT_HASH_AAD, &nonce, &tag)?;
        Ok(Some(pt))
    }

    pub fn state(&self) -> TreeState {
        self.inner.read().unwrap().state
    }

    /// Current root hash, for tests and diagnostics.
    pub fn root(&self) -> [u8; ROOT_HASH_LEN] {
        let inner = self.inner.read().unwrap();
        let mut out = [0u8; ROOT_HASH_LEN];
        out.copy_from_slice(&inner.nodes[0][..ROOT_HASH_LEN]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileBlockDevice;
    use crate::fs::layout::Layout;
    use tempfile::NamedTempFile;

    fn tree(n: u64, paranoid: bool) -> (MerkleTree, Arc<MetaRegion>, Layout) {
        let layout = Layout::new(64, n);
        let tmp = NamedTempFile::new().unwrap();
        let device: Arc<dyn crate::device::BlockDevice> =
            Arc::new(FileBlockDevice::create(tmp.path(), layout.total_blocks()).unwrap());
        let meta = Arc::new(MetaRegion::new(device, layout));
        let sa = Arc::new(SecAssociation::new([3u8; 16]));
        (
            MerkleTree::new(n, layout.data_start, meta.clone(), sa, paranoid),
            meta,
            layout,
        )
    }

    #[test]
    fn update_then_verify_succeeds() {
        let (t, meta, layout) = tree(8, true);
        t.init(true).unwrap();
        for i in 0..8u64 {
            let tag = [i as u8; TAG_LEN];
            meta.write_meta(layout.data_start + i, &[0u8; 12], &tag)
                .unwrap();
            t.update(i, &tag, false).unwrap();
        }
        for i in 0..8u64 {
            t.verify(i, &[i as u8; TAG_LEN]).unwrap();
        }
    }

    #[test]
    fn verify_detects_tampered_leaf() {
        let (t, _meta, _layout) = tree(8, true);
        t.init(true).unwrap();
        for i in 0..8u64 {
            t.update(i, &[i as u8; TAG_LEN], false).unwrap();
        }
        let err = t.verify(3, &[0xffu8; TAG_LEN]).unwrap_err();
        assert!(matches!(
            err,
            ServerError::Integrity(IntegrityError::TreeMismatch { .. })
        ));
    }

    #[test]
    fn batch_update_matches_sequential_updates() {
        let (seq_tree, _m1, _l1) = tree(8, true);
        seq_tree.init(true).unwrap();
        for i in 0..8u64 {
            seq_tree.update(i, &[(i + 1) as u8; TAG_LEN], false).unwrap();
        }

        let (batch_tree, _m2, _l2) = tree(8, true);
        batch_tree.init(true).unwrap();
        let updates: Vec<_> = (0..8u64).map(|i| (i, [(i + 1) as u8; TAG_LEN])).collect();
        batch_tree.update_batch(&updates, false).unwrap();

        assert_eq!(seq_tree.root(), batch_tree.root());
    }

    #[test]
    fn persist_and_reload_root_roundtrips() {
        let (t, _meta, _layout) = tree(4, true);
        t.init(true).unwrap();
        for i in 0..4u64 {
            t.update(i, &[i as u8 + 1; TAG_LEN], true).unwrap();
        }
        let persisted = t.read_persisted_root().unwrap().unwrap();
        assert_eq!(&persisted[..], &t.root()[..]);
    }

    /// `init(false)` rebuilds leaves from [`MetaRegion`], which is keyed by
    /// absolute vbid (`layout.data_start + i`), not the tree's own 0-based
    /// leaf index; a tree that forgets the offset would either underflow or
    /// read the wrong meta block and spuriously fail to mount.
    #[test]
    fn init_after_restart_rebuilds_from_absolute_vbids() {
        let layout = Layout::new(64, 8);
        let tmp = NamedTempFile::new().unwrap();
        let device: Arc<dyn crate::device::BlockDevice> =
            Arc::new(FileBlockDevice::create(tmp.path(), layout.total_blocks()).unwrap());
        let meta = Arc::new(MetaRegion::new(device, layout));
        let sa = Arc::new(SecAssociation::new([9u8; 16]));

        let t = MerkleTree::new(8, layout.data_start, meta.clone(), sa.clone(), true);
        t.init(true).unwrap();
        for i in 0..8u64 {
            let tag = [i as u8 + 1; TAG_LEN];
            meta.write_meta(layout.data_start + i, &[0u8; 12], &tag).unwrap();
            t.update(i, &tag, true).unwrap();
        }

        let reloaded = MerkleTree::new(8, layout.data_start, meta, sa, true);
        reloaded.init(false).unwrap();
        assert_eq!(reloaded.root(), t.root());
    }
}
