//! The single-writer façade over the chain's mutable state.
//!
//! One non-reentrant lock guards the header tree, the block store, the
//! header file and the txhashset. Processors receive `&mut ChainBody` — the
//! proof of exclusive access — and never reacquire the lock, so observers
//! can never see headers advanced without the MMRs following.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use mwd_consensus::ChainParams;
use mwd_primitives::block::{Block, BlockHeader};
use mwd_primitives::hash::Hash;
use mwd_primitives::transaction::Commitment;
use mwd_storage::{Column, KeyValueStore, WriteBatch};

use crate::block_store::BlockStore;
use crate::chain_store::{Branch, ChainStore};
use crate::error::{ChainError, ChainStatus};
use crate::header_chain::HeaderChainFile;
use crate::txhashset::TxHashSet;
use crate::{pipe, txhashset_proc};

pub(crate) struct ChainBody<S> {
    pub(crate) params: ChainParams,
    pub(crate) store: Arc<S>,
    pub(crate) chain_store: ChainStore<S>,
    pub(crate) block_store: BlockStore<S>,
    pub(crate) header_file: HeaderChainFile,
    pub(crate) txhashset: TxHashSet<S>,
}

/// Heights and difficulties the syncer steers by.
#[derive(Clone, Copy, Debug, Default)]
pub struct TipInfo {
    pub confirmed_height: u64,
    pub confirmed_difficulty: u64,
    pub candidate_height: u64,
    pub candidate_difficulty: u64,
    pub sync_height: u64,
}

pub struct ChainState<S> {
    inner: RwLock<ChainBody<S>>,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Opens (or creates) the chain state under `data_dir`. A fresh store
    /// comes up at genesis with empty MMRs.
    pub fn open(
        params: ChainParams,
        store: Arc<S>,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self, ChainError> {
        let data_dir = data_dir.into();
        let genesis_hash = params.genesis_hash();
        let chain_store = ChainStore::load(Arc::clone(&store), &params.genesis)?;
        let confirmed_hash = chain_store.head(Branch::Confirmed).hash;
        let confirmed_header = chain_store
            .header(&confirmed_hash)?
            .ok_or(ChainError::Corrupt("confirmed head header missing"))?;
        let txhashset = TxHashSet::open(
            data_dir.join("txhashset"),
            Arc::clone(&store),
            &confirmed_header,
        )?;
        let mut header_file = HeaderChainFile::open(&data_dir)?;
        if header_file.is_empty() {
            header_file.append(genesis_hash);
            header_file.flush()?;
        }
        if store.get(Column::LeafSnapshot, &genesis_hash)?.is_none() {
            let empty = mwd_mmr::LeafSet::empty();
            store.put(Column::LeafSnapshot, &genesis_hash, &empty.to_bytes())?;
        }
        let block_store = BlockStore::new(Arc::clone(&store));

        Ok(Self {
            inner: RwLock::new(ChainBody {
                params,
                store,
                chain_store,
                block_store,
                header_file,
                txhashset,
            }),
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChainBody<S>> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ChainBody<S>> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn process_single_header(&self, header: &BlockHeader) -> Result<ChainStatus, ChainError> {
        let mut body = self.write();
        pipe::process_header(&mut body, header, Self::now())
    }

    pub fn process_sync_headers(&self, headers: &[BlockHeader]) -> Result<ChainStatus, ChainError> {
        let mut body = self.write();
        pipe::process_sync_headers(&mut body, headers, Self::now())
    }

    pub fn process_block(&self, block: &Block) -> Result<ChainStatus, ChainError> {
        let mut body = self.write();
        pipe::process_block(&mut body, block, Self::now())
    }

    /// Swaps in a downloaded txhashset snapshot for `header_hash` per the
    /// state-sync protocol; on failure the previous set stays active.
    pub fn process_txhashset(
        &self,
        header_hash: Hash,
        bundle_path: &Path,
    ) -> Result<ChainStatus, ChainError> {
        let mut body = self.write();
        txhashset_proc::process_txhashset(&mut body, header_hash, bundle_path)
    }

    /// Packs the confirmed txhashset into a snapshot bundle for a peer.
    /// Returns the confirmed head it represents.
    pub fn write_txhashset_snapshot(&self, dest: &Path) -> Result<(Hash, u64), ChainError> {
        let mut body = self.write();
        let head = *body.chain_store.head(Branch::Confirmed);
        body.txhashset.write_snapshot(dest)?;
        Ok((head.hash, head.height))
    }

    pub fn height(&self, branch: Branch) -> u64 {
        self.read().chain_store.head(branch).height
    }

    pub fn total_difficulty(&self, branch: Branch) -> u64 {
        self.read().chain_store.head(branch).total_difficulty
    }

    pub fn head_hash(&self, branch: Branch) -> Hash {
        self.read().chain_store.head(branch).hash
    }

    pub fn tip_info(&self) -> TipInfo {
        let body = self.read();
        let confirmed = body.chain_store.head(Branch::Confirmed);
        let candidate = body.chain_store.head(Branch::Candidate);
        let sync = body.chain_store.head(Branch::Sync);
        TipInfo {
            confirmed_height: confirmed.height,
            confirmed_difficulty: confirmed.total_difficulty,
            candidate_height: candidate.height,
            candidate_difficulty: candidate.total_difficulty,
            sync_height: sync.height,
        }
    }

    pub fn has_header(&self, hash: &Hash) -> bool {
        self.read().chain_store.contains(hash)
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Result<Option<BlockHeader>, ChainError> {
        self.read().chain_store.header(hash)
    }

    pub fn header_by_height(
        &self,
        height: u64,
        branch: Branch,
    ) -> Result<Option<BlockHeader>, ChainError> {
        self.read().chain_store.header_by_height(branch, height)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        self.read().block_store.get(hash)
    }

    pub fn is_output_unspent(&self, commitment: &Commitment) -> Result<bool, ChainError> {
        self.read().txhashset.is_unspent(commitment)
    }

    pub fn locator(&self) -> Vec<Hash> {
        self.read().chain_store.locator(Branch::Candidate)
    }

    pub fn headers_from_locator(
        &self,
        locator: &[Hash],
        max: usize,
    ) -> Result<Vec<BlockHeader>, ChainError> {
        self.read()
            .chain_store
            .headers_from_locator(Branch::Candidate, locator, max)
    }

    /// Prunes spent outputs and old blocks below the finality horizon.
    pub fn compact(&self) -> Result<(), ChainError> {
        let mut body = self.write();
        let confirmed_height = body.chain_store.head(Branch::Confirmed).height;
        let horizon = confirmed_height.saturating_sub(body.params.finality_depth);
        if horizon == 0 {
            return Ok(());
        }
        let horizon_header = body
            .chain_store
            .header_by_height(Branch::Confirmed, horizon)?
            .ok_or(ChainError::Corrupt("horizon header missing"))?;
        body.txhashset.compact(&horizon_header)?;

        let mut batch = WriteBatch::new();
        for height in 1..horizon {
            if let Some(node) = body.chain_store.get_by_height(Branch::Confirmed, height) {
                batch.delete(Column::Block, node.hash);
                batch.delete(Column::LeafSnapshot, node.hash);
            }
        }
        body.store.write_batch(&batch)?;
        Ok(())
    }

    /// Drains any in-flight writer, then flushes every store. Called once at
    /// shutdown.
    pub fn shutdown(&self) -> Result<(), ChainError> {
        let mut body = self.write();
        body.txhashset.flush()?;
        body.header_file.flush()?;
        body.store.flush()?;
        Ok(())
    }
}
