use std::sync::Arc;

use mwd_primitives::block::Block;
use mwd_primitives::hash::Hash;
use mwd_storage::{Column, KeyValueStore};

use crate::error::ChainError;

/// Full blocks keyed by header hash. Prunable below the finality horizon.
pub struct BlockStore<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> BlockStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn put(&self, block: &Block) -> Result<(), ChainError> {
        let hash = block.hash();
        self.store
            .put(Column::Block, &hash, &block.serialize())?;
        Ok(())
    }

    pub fn get(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        let Some(bytes) = self.store.get(Column::Block, hash)? else {
            return Ok(None);
        };
        Ok(Some(Block::deserialize(&bytes)?))
    }

    pub fn has(&self, hash: &Hash) -> Result<bool, ChainError> {
        Ok(self.store.get(Column::Block, hash)?.is_some())
    }

    pub fn delete(&self, hash: &Hash) -> Result<(), ChainError> {
        self.store.delete(Column::Block, hash)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mwd_primitives::block::{BlockHeader, PROOF_NONCE_COUNT};
    use mwd_primitives::hash::ZERO_HASH;
    use mwd_primitives::transaction::TransactionBody;
    use mwd_storage::memory::MemoryStore;

    #[test]
    fn put_get_delete() {
        let store = BlockStore::new(Arc::new(MemoryStore::new()));
        let block = Block {
            header: BlockHeader {
                version: 1,
                height: 1,
                prev_hash: ZERO_HASH,
                timestamp: 0,
                output_root: ZERO_HASH,
                rangeproof_root: ZERO_HASH,
                kernel_root: ZERO_HASH,
                output_mmr_size: 0,
                kernel_mmr_size: 0,
                total_difficulty: 1,
                total_kernel_offset: [0u8; 32],
                secondary_scaling: 1,
                nonce: 0,
                proof_nonces: vec![0; PROOF_NONCE_COUNT],
            },
            body: TransactionBody::default(),
        };
        let hash = block.hash();
        store.put(&block).unwrap();
        assert!(store.has(&hash).unwrap());
        assert_eq!(store.get(&hash).unwrap().unwrap(), block);
        store.delete(&hash).unwrap();
        assert!(!store.has(&hash).unwrap());
    }
}
