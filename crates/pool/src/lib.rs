//! Unconfirmed transaction pool, keyed by kernel excess.
//!
//! Entries arrive after standalone validation and leave when a confirming
//! block is accepted or a higher-fee conflict supersedes them. The pool is
//! also the hydration source for compact blocks.

use std::collections::{HashMap, HashSet};

use mwd_consensus::{verify_kernel_signatures, verify_kernel_sums, verify_rangeproof};
use mwd_log::log_debug;
use mwd_primitives::block::Block;
use mwd_primitives::compact::{kernel_short_id, CompactBlock, ShortId};
use mwd_primitives::hash::{short_hash, Hash};
use mwd_primitives::transaction::{Commitment, Transaction};

pub const DEFAULT_MAX_ENTRIES: usize = 50_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolError {
    AlreadyInPool,
    /// Conflicting input with an equal-or-better entry already pooled.
    Conflict,
    NoKernel,
    BodyNotSorted,
    InvalidRangeproof,
    InvalidSignature,
    /// Transaction commitments do not balance against its offset.
    Unbalanced,
    PoolFull,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            PoolError::AlreadyInPool => "transaction already in pool",
            PoolError::Conflict => "conflicting input already spent in pool",
            PoolError::NoKernel => "transaction has no kernel",
            PoolError::BodyNotSorted => "transaction body not sorted",
            PoolError::InvalidRangeproof => "rangeproof malformed",
            PoolError::InvalidSignature => "kernel signature invalid",
            PoolError::Unbalanced => "transaction does not balance",
            PoolError::PoolFull => "pool full",
        };
        write!(f, "{message}")
    }
}

impl std::error::Error for PoolError {}

struct PoolEntry {
    tx: Transaction,
    tx_hash: Hash,
    fee: u64,
}

#[derive(Default)]
pub struct TransactionPool {
    /// Primary index: first kernel excess → entry.
    entries: HashMap<Commitment, PoolEntry>,
    /// Input commitment → excess of the entry spending it.
    spent: HashMap<Commitment, Commitment>,
    max_entries: usize,
}

impl TransactionPool {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            spent: HashMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_excess(&self, excess: &Commitment) -> bool {
        self.entries.contains_key(excess)
    }

    fn validate(tx: &Transaction) -> Result<(), PoolError> {
        if tx.body.kernels.is_empty() {
            return Err(PoolError::NoKernel);
        }
        if !tx.body.verify_sorted() {
            return Err(PoolError::BodyNotSorted);
        }
        for output in &tx.body.outputs {
            verify_rangeproof(output).map_err(|_| PoolError::InvalidRangeproof)?;
        }
        verify_kernel_signatures(tx.body.kernels.iter())
            .map_err(|_| PoolError::InvalidSignature)?;
        let inputs: Vec<Commitment> = tx.body.inputs.iter().map(|input| input.commitment).collect();
        let outputs: Vec<Commitment> = tx
            .body
            .outputs
            .iter()
            .map(|output| output.commitment)
            .collect();
        let excesses: Vec<Commitment> = tx
            .body
            .kernels
            .iter()
            .map(|kernel| kernel.excess)
            .collect();
        verify_kernel_sums(&inputs, &outputs, &excesses, &tx.offset)
            .map_err(|_| PoolError::Unbalanced)?;
        Ok(())
    }

    /// Validates and inserts. A conflicting input supersedes the existing
    /// entry only when the newcomer pays a strictly higher fee.
    pub fn insert(&mut self, tx: Transaction) -> Result<(), PoolError> {
        let excess = tx.kernel_excess().ok_or(PoolError::NoKernel)?;
        if self.entries.contains_key(&excess) {
            return Err(PoolError::AlreadyInPool);
        }
        Self::validate(&tx)?;

        let fee = tx.body.fee();
        let mut superseded: Vec<Commitment> = Vec::new();
        for tx_input in &tx.body.inputs {
            if let Some(existing_excess) = self.spent.get(&tx_input.commitment) {
                let existing = &self.entries[existing_excess];
                if existing.fee >= fee {
                    return Err(PoolError::Conflict);
                }
                superseded.push(*existing_excess);
            }
        }
        if self.entries.len() >= self.max_entries && superseded.is_empty() {
            return Err(PoolError::PoolFull);
        }
        for loser in superseded {
            self.remove(&loser);
        }

        let tx_hash = tx.hash();
        for tx_input in &tx.body.inputs {
            self.spent.insert(tx_input.commitment, excess);
        }
        self.entries.insert(
            excess,
            PoolEntry {
                tx,
                tx_hash,
                fee,
            },
        );
        Ok(())
    }

    fn remove(&mut self, excess: &Commitment) -> Option<Transaction> {
        let entry = self.entries.remove(excess)?;
        for tx_input in &entry.tx.body.inputs {
            if self.spent.get(&tx_input.commitment) == Some(excess) {
                self.spent.remove(&tx_input.commitment);
            }
        }
        Some(entry.tx)
    }

    /// Drops entries confirmed by the block (kernel excess present) or
    /// invalidated by it (input spent by the block).
    pub fn reconcile_block(&mut self, block: &Block) {
        let mut stale: Vec<Commitment> = Vec::new();
        for kernel in &block.body.kernels {
            if self.entries.contains_key(&kernel.excess) {
                stale.push(kernel.excess);
            }
        }
        for block_input in &block.body.inputs {
            if let Some(excess) = self.spent.get(&block_input.commitment) {
                stale.push(*excess);
            }
        }
        stale.sort();
        stale.dedup();
        let removed = stale.len();
        for excess in stale {
            self.remove(&excess);
        }
        if removed > 0 {
            log_debug!(
                "pool reconciled against block {}: {removed} entries dropped",
                short_hash(&block.hash())
            );
        }
    }

    /// Highest-fee transactions first; aggregation candidates for block
    /// building and relay.
    pub fn candidates(&self, max: usize) -> Vec<Transaction> {
        let mut entries: Vec<&PoolEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| b.fee.cmp(&a.fee).then(a.tx_hash.cmp(&b.tx_hash)));
        entries
            .into_iter()
            .take(max)
            .map(|entry| entry.tx.clone())
            .collect()
    }

    pub fn transaction_by_hash(&self, hash: &Hash) -> Option<Transaction> {
        self.entries
            .values()
            .find(|entry| entry.tx_hash == *hash)
            .map(|entry| entry.tx.clone())
    }

    /// Resolves a compact block against the pool: a pool transaction is
    /// pulled in when every one of its kernel short ids appears in the
    /// block. Returns the hydrated full block, or the short ids no pool
    /// transaction covers.
    pub fn hydrate(&self, compact: &CompactBlock) -> Result<Block, Vec<ShortId>> {
        let key = compact.short_id_key();
        let needed: HashSet<ShortId> = compact.kern_ids.iter().copied().collect();

        let mut matched = Vec::new();
        let mut covered: HashSet<ShortId> = HashSet::new();
        for entry in self.entries.values() {
            let ids: Vec<ShortId> = entry
                .tx
                .body
                .kernels
                .iter()
                .map(|kernel| kernel_short_id(kernel, &key))
                .collect();
            if ids.iter().all(|id| needed.contains(id)) {
                covered.extend(ids.iter().copied());
                matched.push(entry.tx.clone());
            }
        }
        for kernel in &compact.kern_full {
            covered.insert(kernel_short_id(kernel, &key));
        }

        let missing: Vec<ShortId> = needed.difference(&covered).copied().collect();
        if !missing.is_empty() {
            return Err(missing);
        }
        Ok(compact.hydrate(&matched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mwd_consensus::crypto::{commit_to_point, sign_kernel};
    use mwd_primitives::block::{BlockHeader, PROOF_NONCE_COUNT};
    use mwd_primitives::hash::ZERO_HASH;
    use mwd_primitives::transaction::{Input, Output, TransactionBody, TxKernel};
    use secp256k1::SecretKey;

    fn sk(value: u64) -> SecretKey {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        SecretKey::from_slice(&bytes).expect("nonzero scalar")
    }

    fn commit(value: u64) -> Commitment {
        commit_to_point(&sk(value))
    }

    fn offset_bytes(value: u64) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        bytes
    }

    fn balanced_tx(spend: &[u64], create: &[u64], offset: u64, fee: u64) -> Transaction {
        let excess: u64 = create.iter().sum::<u64>() - spend.iter().sum::<u64>() - offset;
        let kernel = TxKernel {
            excess: commit(excess),
            signature: sign_kernel(&sk(excess), fee, 0),
            fee,
            lock_height: 0,
        };
        Transaction::new(
            offset_bytes(offset),
            TransactionBody {
                inputs: spend
                    .iter()
                    .map(|value| Input {
                        commitment: commit(*value),
                    })
                    .collect(),
                outputs: create
                    .iter()
                    .map(|value| Output {
                        commitment: commit(*value),
                        rangeproof: vec![0x07; 64],
                    })
                    .collect(),
                kernels: vec![kernel],
            },
        )
    }

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            height: 9,
            prev_hash: ZERO_HASH,
            timestamp: 1_700_000_000,
            output_root: ZERO_HASH,
            rangeproof_root: ZERO_HASH,
            kernel_root: ZERO_HASH,
            output_mmr_size: 0,
            kernel_mmr_size: 0,
            total_difficulty: 9,
            total_kernel_offset: [0u8; 32],
            secondary_scaling: 1,
            nonce: 4,
            proof_nonces: vec![0; PROOF_NONCE_COUNT],
        }
    }

    #[test]
    fn insert_validates_and_dedupes() {
        let mut pool = TransactionPool::new(16);
        let tx = balanced_tx(&[], &[100], 3, 2);
        pool.insert(tx.clone()).unwrap();
        assert_eq!(pool.insert(tx.clone()), Err(PoolError::AlreadyInPool));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains_excess(&tx.kernel_excess().unwrap()));
    }

    #[test]
    fn unbalanced_transaction_rejected() {
        let mut pool = TransactionPool::new(16);
        let mut tx = balanced_tx(&[], &[100], 3, 2);
        tx.body.outputs[0].commitment = commit(555);
        assert_eq!(pool.insert(tx), Err(PoolError::Unbalanced));
    }

    #[test]
    fn conflicting_input_supersedes_only_on_higher_fee() {
        let mut pool = TransactionPool::new(16);
        let low_fee = balanced_tx(&[50], &[100], 0, 1);
        let equal_fee = balanced_tx(&[50], &[101], 0, 1);
        let high_fee = balanced_tx(&[50], &[102], 0, 5);

        pool.insert(low_fee.clone()).unwrap();
        assert_eq!(pool.insert(equal_fee), Err(PoolError::Conflict));
        pool.insert(high_fee.clone()).unwrap();

        assert_eq!(pool.len(), 1);
        assert!(!pool.contains_excess(&low_fee.kernel_excess().unwrap()));
        assert!(pool.contains_excess(&high_fee.kernel_excess().unwrap()));
    }

    #[test]
    fn reconcile_drops_confirmed_and_conflicting() {
        let mut pool = TransactionPool::new(16);
        let confirmed = balanced_tx(&[], &[100], 0, 1);
        let conflicted = balanced_tx(&[60], &[101], 0, 1);
        let untouched = balanced_tx(&[], &[102], 0, 1);
        pool.insert(confirmed.clone()).unwrap();
        pool.insert(conflicted.clone()).unwrap();
        pool.insert(untouched.clone()).unwrap();

        // The block confirms `confirmed` and spends input 60 itself.
        let block_body =
            Block::body_from_transactions(&[confirmed.clone(), balanced_tx(&[60], &[103], 0, 2)]);
        let block = Block {
            header: header(),
            body: block_body,
        };
        pool.reconcile_block(&block);

        assert_eq!(pool.len(), 1);
        assert!(pool.contains_excess(&untouched.kernel_excess().unwrap()));
    }

    #[test]
    fn candidates_order_by_fee() {
        let mut pool = TransactionPool::new(16);
        pool.insert(balanced_tx(&[], &[100], 0, 1)).unwrap();
        pool.insert(balanced_tx(&[], &[101], 0, 9)).unwrap();
        pool.insert(balanced_tx(&[], &[102], 0, 4)).unwrap();
        let candidates = pool.candidates(2);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].body.fee(), 9);
        assert_eq!(candidates[1].body.fee(), 4);
    }

    #[test]
    fn compact_block_hydrates_from_pool() {
        let mut pool = TransactionPool::new(16);
        let tx_a = balanced_tx(&[], &[100], 1, 1);
        let tx_b = balanced_tx(&[], &[101], 2, 2);
        pool.insert(tx_a.clone()).unwrap();
        pool.insert(tx_b.clone()).unwrap();
        // A bystander entry must not leak into the hydrated block.
        pool.insert(balanced_tx(&[], &[102], 3, 1)).unwrap();

        let original = Block {
            header: header(),
            body: Block::body_from_transactions(&[tx_a, tx_b]),
        };
        let compact = CompactBlock::from_block(&original, 7);
        let hydrated = pool.hydrate(&compact).expect("all short ids resolve");
        assert_eq!(hydrated, original);
    }

    #[test]
    fn missing_pool_transaction_reports_short_ids() {
        let mut pool = TransactionPool::new(16);
        let tx_a = balanced_tx(&[], &[100], 1, 1);
        let tx_b = balanced_tx(&[], &[101], 2, 2);
        pool.insert(tx_a.clone()).unwrap();

        let block = Block {
            header: header(),
            body: Block::body_from_transactions(&[tx_a, tx_b.clone()]),
        };
        let compact = CompactBlock::from_block(&block, 7);
        let missing = pool.hydrate(&compact).expect_err("one id unresolved");
        assert_eq!(missing.len(), 1);
        let key = compact.short_id_key();
        assert_eq!(missing[0], kernel_short_id(&tx_b.body.kernels[0], &key));
    }
}
