//! Fixture toolkit: deterministic keys, balanced transactions, and a shadow
//! txhashset that turns bodies into headers with correct roots.
#![allow(dead_code)]

use std::sync::Arc;

use mwd_chainstate::{ChainState, TxHashSet};
use mwd_consensus::crypto::{commit_to_point, sign_kernel};
use mwd_consensus::{chain_params, ChainParams, Network};
use mwd_primitives::block::{Block, BlockHeader, PROOF_NONCE_COUNT};
use mwd_primitives::transaction::{Commitment, Input, Output, Transaction, TransactionBody, TxKernel};
use mwd_storage::memory::MemoryStore;
use secp256k1::SecretKey;
use tempfile::TempDir;

pub fn sk(value: u64) -> SecretKey {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&value.to_be_bytes());
    SecretKey::from_slice(&bytes).expect("nonzero scalar")
}

pub fn offset_bytes(value: u64) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&value.to_be_bytes());
    bytes
}

pub fn commit(value: u64) -> Commitment {
    commit_to_point(&sk(value))
}

pub fn output(value: u64) -> Output {
    Output {
        commitment: commit(value),
        rangeproof: vec![0x07; 64],
    }
}

pub fn input(value: u64) -> Input {
    Input {
        commitment: commit(value),
    }
}

/// Builds a balanced transaction: spends the outputs blinded by `spend`,
/// creates outputs blinded by `create`, with the given kernel offset. The
/// caller keeps `sum(create) > sum(spend) + offset` so the kernel scalar
/// stays positive.
pub fn build_tx(spend: &[u64], create: &[u64], offset: u64, fee: u64) -> Transaction {
    let create_sum: u64 = create.iter().sum();
    let spend_sum: u64 = spend.iter().sum();
    let excess = create_sum - spend_sum - offset;
    assert!(excess > 0, "fixture kernel scalar must be positive");
    let kernel = TxKernel {
        excess: commit(excess),
        signature: sign_kernel(&sk(excess), fee, 0),
        fee,
        lock_height: 0,
    };
    Transaction::new(
        offset_bytes(offset),
        TransactionBody {
            inputs: spend.iter().map(|value| input(*value)).collect(),
            outputs: create.iter().map(|value| output(*value)).collect(),
            kernels: vec![kernel],
        },
    )
}

fn offset_value(offset: &[u8; 32]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&offset[24..]);
    u64::from_be_bytes(bytes)
}

/// Builds blocks against a private shadow txhashset so headers carry the
/// roots the real chain will compute.
pub struct BlockFactory {
    _dir: TempDir,
    shadow: TxHashSet<MemoryStore>,
    pub tip: BlockHeader,
    total_offset: u64,
}

impl BlockFactory {
    pub fn new(params: &ChainParams) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let shadow = TxHashSet::open(
            dir.path().join("txhashset"),
            Arc::new(MemoryStore::new()),
            &params.genesis,
        )
        .expect("shadow txhashset");
        Self {
            _dir: dir,
            shadow,
            tip: params.genesis.clone(),
            total_offset: 0,
        }
    }

    pub fn next_block(&mut self, txs: &[Transaction]) -> Block {
        let body = Block::body_from_transactions(txs);
        let roots = self.shadow.apply_body_unchecked(&body).expect("shadow apply");
        for tx in txs {
            self.total_offset += offset_value(&tx.offset);
        }
        let height = self.tip.height + 1;
        let header = BlockHeader {
            version: 1,
            height,
            prev_hash: self.tip.hash(),
            timestamp: self.tip.timestamp + 60,
            output_root: roots.output_root,
            rangeproof_root: roots.rangeproof_root,
            kernel_root: roots.kernel_root,
            output_mmr_size: roots.output_mmr_size,
            kernel_mmr_size: roots.kernel_mmr_size,
            total_difficulty: self.tip.total_difficulty + 1,
            total_kernel_offset: offset_bytes(self.total_offset),
            secondary_scaling: 1,
            nonce: height,
            proof_nonces: vec![height; PROOF_NONCE_COUNT],
        };
        self.tip = header.clone();
        Block { header, body }
    }

    /// Replays a block built elsewhere so this factory can fork from it.
    pub fn apply_existing(&mut self, block: &Block) {
        self.shadow
            .apply_body_unchecked(&block.body)
            .expect("shadow replay");
        self.total_offset = offset_value(&block.header.total_kernel_offset);
        self.tip = block.header.clone();
    }
}

pub struct TestNode {
    pub _dir: TempDir,
    pub params: ChainParams,
    pub state: ChainState<MemoryStore>,
}

pub fn new_node() -> TestNode {
    let params = chain_params(Network::Regtest);
    let dir = TempDir::new().expect("tempdir");
    let state = ChainState::open(params.clone(), Arc::new(MemoryStore::new()), dir.path())
        .expect("chain state");
    TestNode {
        _dir: dir,
        params,
        state,
    }
}
