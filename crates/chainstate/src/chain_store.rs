//! In-memory header tree with named branch heads, backed by the header
//! column of the key-value store.
//!
//! Nodes live in an arena addressed by integer handles; parent links are
//! handles, never pointers, so reorgs cannot dangle.

use std::collections::HashMap;
use std::sync::Arc;

use mwd_primitives::block::BlockHeader;
use mwd_primitives::hash::Hash;
use mwd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainError;

pub type NodeId = u32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Branch {
    /// The validated best chain.
    Confirmed = 0,
    /// The header-validated best chain; may lead Confirmed during sync.
    Candidate = 1,
    /// Scratch chain while downloading headers from a peer.
    Sync = 2,
}

impl Branch {
    pub const ALL: [Branch; 3] = [Branch::Confirmed, Branch::Candidate, Branch::Sync];

    fn key(self) -> [u8; 1] {
        [self as u8]
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BlockIndex {
    pub hash: Hash,
    pub height: u64,
    pub timestamp: i64,
    pub total_difficulty: u64,
    pub parent: Option<NodeId>,
    pub failed: bool,
}

pub struct ChainStore<S> {
    store: Arc<S>,
    nodes: Vec<BlockIndex>,
    by_hash: HashMap<Hash, NodeId>,
    heads: [NodeId; 3],
}

impl<S: KeyValueStore> ChainStore<S> {
    /// Loads the tree from persisted headers, creating the genesis state on
    /// an empty store.
    pub fn load(store: Arc<S>, genesis: &BlockHeader) -> Result<Self, ChainError> {
        let genesis_hash = genesis.hash();
        let mut chain_store = Self {
            store,
            nodes: Vec::new(),
            by_hash: HashMap::new(),
            heads: [0; 3],
        };

        if chain_store
            .store
            .get(Column::BranchHead, &Branch::Confirmed.key())?
            .is_none()
        {
            // Fresh store: persist genesis and point every branch at it.
            let mut batch = WriteBatch::new();
            batch.put(Column::Header, genesis_hash, genesis.serialize());
            for branch in Branch::ALL {
                batch.put(Column::BranchHead, branch.key(), genesis_hash);
            }
            chain_store.store.write_batch(&batch)?;
        }

        chain_store.rebuild(genesis)?;
        Ok(chain_store)
    }

    fn rebuild(&mut self, genesis: &BlockHeader) -> Result<(), ChainError> {
        let genesis_hash = genesis.hash();
        let mut headers: Vec<(Hash, BlockHeader)> = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::Header, &[])? {
            if key.len() != 32 {
                return Err(ChainError::Corrupt("header key is not a hash"));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key);
            headers.push((hash, BlockHeader::deserialize(&value)?));
        }
        headers.sort_by_key(|(_, header)| header.height);

        self.nodes.clear();
        self.by_hash.clear();
        for (hash, header) in headers {
            if hash == genesis_hash {
                self.insert_node(hash, &header, None);
                continue;
            }
            let Some(parent) = self.by_hash.get(&header.prev_hash).copied() else {
                // Parentless non-genesis header; skip rather than poison the
                // whole tree.
                continue;
            };
            self.insert_node(hash, &header, Some(parent));
        }
        if self.by_hash.get(&genesis_hash).is_none() {
            return Err(ChainError::Corrupt("genesis header missing from store"));
        }

        for branch in Branch::ALL {
            let head_hash = match self.store.get(Column::BranchHead, &branch.key())? {
                Some(bytes) if bytes.len() == 32 => {
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(&bytes);
                    hash
                }
                _ => genesis_hash,
            };
            let id = self.by_hash.get(&head_hash).copied().unwrap_or(0);
            self.heads[branch as usize] = id;
        }
        Ok(())
    }

    fn insert_node(&mut self, hash: Hash, header: &BlockHeader, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(BlockIndex {
            hash,
            height: header.height,
            timestamp: header.timestamp,
            total_difficulty: header.total_difficulty,
            parent,
            failed: false,
        });
        self.by_hash.insert(hash, id);
        id
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn node(&self, id: NodeId) -> &BlockIndex {
        &self.nodes[id as usize]
    }

    pub fn mark_failed(&mut self, id: NodeId) {
        self.nodes[id as usize].failed = true;
    }

    /// Attaches a header whose parent is already in the tree and persists it.
    pub fn add_header(&mut self, header: &BlockHeader) -> Result<NodeId, ChainError> {
        let hash = header.hash();
        if let Some(id) = self.by_hash.get(&hash) {
            return Ok(*id);
        }
        let parent = self
            .by_hash
            .get(&header.prev_hash)
            .copied()
            .ok_or(ChainError::Corrupt("parent header missing on attach"))?;
        self.store
            .put(Column::Header, &hash, &header.serialize())?;
        Ok(self.insert_node(hash, header, Some(parent)))
    }

    pub fn head(&self, branch: Branch) -> &BlockIndex {
        &self.nodes[self.heads[branch as usize] as usize]
    }

    pub fn head_id(&self, branch: Branch) -> NodeId {
        self.heads[branch as usize]
    }

    /// Atomically repoints a branch head and persists it.
    pub fn reorg(&mut self, branch: Branch, new_head: NodeId) -> Result<(), ChainError> {
        let hash = self.nodes[new_head as usize].hash;
        self.store.put(Column::BranchHead, &branch.key(), &hash)?;
        self.heads[branch as usize] = new_head;
        Ok(())
    }

    /// Walks parent links from the branch head down to `height`.
    pub fn get_by_height(&self, branch: Branch, height: u64) -> Option<&BlockIndex> {
        let mut id = self.heads[branch as usize];
        loop {
            let node = &self.nodes[id as usize];
            if node.height == height {
                return Some(node);
            }
            if node.height < height {
                return None;
            }
            id = node.parent?;
        }
    }

    /// True iff the header lies on the named branch.
    pub fn is_on_branch(&self, branch: Branch, hash: &Hash) -> bool {
        let Some(id) = self.by_hash.get(hash) else {
            return false;
        };
        let height = self.nodes[*id as usize].height;
        self.get_by_height(branch, height)
            .map(|node| node.hash == *hash)
            .unwrap_or(false)
    }

    /// Last common ancestor of two nodes.
    pub fn common_ancestor(&self, a: NodeId, b: NodeId) -> NodeId {
        let mut a = a;
        let mut b = b;
        while self.nodes[a as usize].height > self.nodes[b as usize].height {
            a = self.nodes[a as usize].parent.unwrap_or(a);
        }
        while self.nodes[b as usize].height > self.nodes[a as usize].height {
            b = self.nodes[b as usize].parent.unwrap_or(b);
        }
        while a != b {
            let (pa, pb) = (self.nodes[a as usize].parent, self.nodes[b as usize].parent);
            match (pa, pb) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                _ => break,
            }
        }
        a
    }

    /// Node ids from just above `ancestor` up to and including `tip`, in
    /// ascending height order.
    pub fn path(&self, ancestor: NodeId, tip: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut id = tip;
        while id != ancestor {
            out.push(id);
            match self.nodes[id as usize].parent {
                Some(parent) => id = parent,
                None => break,
            }
        }
        out.reverse();
        out
    }

    pub fn header(&self, hash: &Hash) -> Result<Option<BlockHeader>, ChainError> {
        let Some(bytes) = self.store.get(Column::Header, hash)? else {
            return Ok(None);
        };
        Ok(Some(BlockHeader::deserialize(&bytes)?))
    }

    pub fn header_by_height(
        &self,
        branch: Branch,
        height: u64,
    ) -> Result<Option<BlockHeader>, ChainError> {
        let Some(node) = self.get_by_height(branch, height) else {
            return Ok(None);
        };
        self.header(&node.hash)
    }

    /// Sparse locator: dense near the head, then doubling gaps back to
    /// genesis.
    pub fn locator(&self, branch: Branch) -> Vec<Hash> {
        let head = self.head(branch);
        let mut hashes = Vec::new();
        let mut height = head.height;
        let mut step = 1u64;
        loop {
            if let Some(node) = self.get_by_height(branch, height) {
                hashes.push(node.hash);
            }
            if height == 0 {
                break;
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            height = height.saturating_sub(step);
        }
        hashes
    }

    /// Headers after the first locator hash found on `branch`, ascending,
    /// capped at `max`.
    pub fn headers_from_locator(
        &self,
        branch: Branch,
        locator: &[Hash],
        max: usize,
    ) -> Result<Vec<BlockHeader>, ChainError> {
        let mut start_height = 0;
        for hash in locator {
            if self.is_on_branch(branch, hash) {
                if let Some(id) = self.get(hash) {
                    start_height = self.node(id).height;
                    break;
                }
            }
        }
        let head_height = self.head(branch).height;
        let mut headers = Vec::new();
        let mut height = start_height + 1;
        while height <= head_height && headers.len() < max {
            if let Some(header) = self.header_by_height(branch, height)? {
                headers.push(header);
            }
            height += 1;
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mwd_primitives::block::PROOF_NONCE_COUNT;
    use mwd_primitives::hash::ZERO_HASH;
    use mwd_storage::memory::MemoryStore;

    fn header(height: u64, prev_hash: Hash, tag: u8) -> BlockHeader {
        BlockHeader {
            version: 1,
            height,
            prev_hash,
            timestamp: 1_700_000_000 + height as i64 * 60,
            output_root: ZERO_HASH,
            rangeproof_root: ZERO_HASH,
            kernel_root: ZERO_HASH,
            output_mmr_size: 0,
            kernel_mmr_size: 0,
            total_difficulty: height,
            total_kernel_offset: [0u8; 32],
            secondary_scaling: 1,
            nonce: tag as u64,
            proof_nonces: vec![tag as u64; PROOF_NONCE_COUNT],
        }
    }

    fn extend(store: &mut ChainStore<MemoryStore>, prev: &BlockHeader, tag: u8) -> BlockHeader {
        let next = header(prev.height + 1, prev.hash(), tag);
        store.add_header(&next).unwrap();
        next
    }

    #[test]
    fn lookup_by_hash_and_height_agree() {
        let genesis = header(0, ZERO_HASH, 0);
        let mut store = ChainStore::load(Arc::new(MemoryStore::new()), &genesis).unwrap();
        let h1 = extend(&mut store, &genesis, 1);
        let h2 = extend(&mut store, &h1, 2);
        let id = store.get(&h2.hash()).unwrap();
        store.reorg(Branch::Candidate, id).unwrap();

        assert_eq!(store.header(&h1.hash()).unwrap().unwrap(), h1);
        assert_eq!(
            store
                .header_by_height(Branch::Candidate, 1)
                .unwrap()
                .unwrap(),
            h1
        );
        // h1 is not on the confirmed branch until blocks catch up.
        assert!(store.is_on_branch(Branch::Candidate, &h1.hash()));
        assert!(!store.is_on_branch(Branch::Confirmed, &h1.hash()));
    }

    #[test]
    fn reload_restores_tree_and_heads() {
        let backing = Arc::new(MemoryStore::new());
        let genesis = header(0, ZERO_HASH, 0);
        let h2 = {
            let mut store = ChainStore::load(Arc::clone(&backing), &genesis).unwrap();
            let h1 = extend(&mut store, &genesis, 1);
            let h2 = extend(&mut store, &h1, 2);
            let id = store.get(&h2.hash()).unwrap();
            store.reorg(Branch::Candidate, id).unwrap();
            h2
        };
        let store = ChainStore::load(backing, &genesis).unwrap();
        assert_eq!(store.head(Branch::Candidate).hash, h2.hash());
        assert_eq!(store.head(Branch::Confirmed).hash, genesis.hash());
        assert_eq!(store.head(Branch::Candidate).height, 2);
    }

    #[test]
    fn common_ancestor_of_fork() {
        let genesis = header(0, ZERO_HASH, 0);
        let mut store = ChainStore::load(Arc::new(MemoryStore::new()), &genesis).unwrap();
        let h1 = extend(&mut store, &genesis, 1);
        let a2 = extend(&mut store, &h1, 2);
        let b2 = extend(&mut store, &h1, 3);
        let b3 = extend(&mut store, &b2, 4);

        let a_id = store.get(&a2.hash()).unwrap();
        let b_id = store.get(&b3.hash()).unwrap();
        let ancestor = store.common_ancestor(a_id, b_id);
        assert_eq!(store.node(ancestor).hash, h1.hash());

        let path = store.path(ancestor, b_id);
        assert_eq!(path.len(), 2);
        assert_eq!(store.node(path[0]).hash, b2.hash());
        assert_eq!(store.node(path[1]).hash, b3.hash());
    }

    #[test]
    fn locator_is_sparse_to_genesis() {
        let genesis = header(0, ZERO_HASH, 0);
        let mut store = ChainStore::load(Arc::new(MemoryStore::new()), &genesis).unwrap();
        let mut prev = genesis.clone();
        for tag in 1..=40u8 {
            prev = extend(&mut store, &prev, tag);
        }
        let id = store.get(&prev.hash()).unwrap();
        store.reorg(Branch::Candidate, id).unwrap();

        let locator = store.locator(Branch::Candidate);
        assert_eq!(locator.first(), Some(&prev.hash()));
        assert_eq!(locator.last(), Some(&genesis.hash()));
        assert!(locator.len() < 20);
    }

    #[test]
    fn headers_from_locator_caps_results() {
        let genesis = header(0, ZERO_HASH, 0);
        let mut store = ChainStore::load(Arc::new(MemoryStore::new()), &genesis).unwrap();
        let mut prev = genesis.clone();
        for tag in 1..=20u8 {
            prev = extend(&mut store, &prev, tag);
        }
        let id = store.get(&prev.hash()).unwrap();
        store.reorg(Branch::Candidate, id).unwrap();

        let headers = store
            .headers_from_locator(Branch::Candidate, &[genesis.hash()], 8)
            .unwrap();
        assert_eq!(headers.len(), 8);
        assert_eq!(headers[0].height, 1);
        assert_eq!(headers[7].height, 8);
    }
}
