//! Compact blocks: a header plus 6-byte short ids of the kernels the
//! receiver is expected to already hold via its transaction pool, with any
//! remaining outputs and kernels carried inline.

use blake2b_simd::Params;

use crate::block::{Block, BlockHeader};
use crate::hash::{blake2b, Hash};
use crate::ser::{DecodeError, Decoder, Encoder};
use crate::transaction::{Output, Transaction, TransactionBody, TxKernel};

pub const SHORT_ID_LEN: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortId(pub [u8; SHORT_ID_LEN]);

/// Key mixed into every short id so ids are unlinkable across blocks.
pub fn short_id_key(header_hash: &Hash, nonce: u64) -> [u8; 32] {
    let mut state = Params::new().hash_length(32).to_state();
    state.update(header_hash);
    state.update(&nonce.to_be_bytes());
    let digest = state.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Short id of one kernel under the block's key.
pub fn kernel_short_id(kernel: &TxKernel, key: &[u8; 32]) -> ShortId {
    let kernel_hash = blake2b(&kernel.serialize());
    let digest = Params::new()
        .hash_length(SHORT_ID_LEN)
        .key(key)
        .hash(&kernel_hash);
    let mut out = [0u8; SHORT_ID_LEN];
    out.copy_from_slice(digest.as_bytes());
    ShortId(out)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactBlock {
    pub header: BlockHeader,
    /// Key material for the short ids.
    pub nonce: u64,
    /// Outputs carried inline (not reconstructible from the pool).
    pub out_full: Vec<Output>,
    /// Kernels carried inline.
    pub kern_full: Vec<TxKernel>,
    /// Short ids of kernels the receiver should resolve from its pool.
    pub kern_ids: Vec<ShortId>,
}

impl CompactBlock {
    /// Compacts a stored block: every kernel is shortened; the receiver
    /// resolves them against its pool and falls back to a full fetch.
    pub fn from_block(block: &Block, nonce: u64) -> Self {
        let key = short_id_key(&block.header.hash(), nonce);
        let mut kern_ids: Vec<ShortId> = block
            .body
            .kernels
            .iter()
            .map(|kernel| kernel_short_id(kernel, &key))
            .collect();
        kern_ids.sort();
        Self {
            header: block.header.clone(),
            nonce,
            out_full: Vec::new(),
            kern_full: Vec::new(),
            kern_ids,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn short_id_key(&self) -> [u8; 32] {
        short_id_key(&self.hash(), self.nonce)
    }

    /// Rebuilds the full block from resolved pool transactions plus the
    /// inline outputs and kernels.
    pub fn hydrate(&self, matched: &[Transaction]) -> Block {
        let mut body = TransactionBody::default();
        for tx in matched {
            body.inputs.extend_from_slice(&tx.body.inputs);
            body.outputs.extend_from_slice(&tx.body.outputs);
            body.kernels.extend_from_slice(&tx.body.kernels);
        }
        body.outputs.extend_from_slice(&self.out_full);
        body.kernels.extend_from_slice(&self.kern_full);
        body.sort();
        Block {
            header: self.header.clone(),
            body,
        }
    }

    pub fn write(&self, encoder: &mut Encoder) {
        self.header.write(encoder);
        encoder.write_u64(self.nonce);
        encoder.write_u64(self.out_full.len() as u64);
        encoder.write_u64(self.kern_full.len() as u64);
        encoder.write_u64(self.kern_ids.len() as u64);
        for output in &self.out_full {
            output.write(encoder);
        }
        for kernel in &self.kern_full {
            kernel.write(encoder);
        }
        for id in &self.kern_ids {
            encoder.write_bytes(&id.0);
        }
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::read(decoder)?;
        let nonce = decoder.read_u64()?;
        let out_count = decoder.read_len()?;
        let kern_count = decoder.read_len()?;
        let id_count = decoder.read_len()?;
        let mut out_full = Vec::with_capacity(out_count);
        for _ in 0..out_count {
            out_full.push(Output::read(decoder)?);
        }
        let mut kern_full = Vec::with_capacity(kern_count);
        for _ in 0..kern_count {
            kern_full.push(TxKernel::read(decoder)?);
        }
        let mut kern_ids = Vec::with_capacity(id_count);
        for _ in 0..id_count {
            kern_ids.push(ShortId(decoder.read_fixed::<SHORT_ID_LEN>()?));
        }
        Ok(Self {
            header,
            nonce,
            out_full,
            kern_full,
            kern_ids,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.write(&mut encoder);
        encoder.into_inner()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let compact = Self::read(&mut decoder)?;
        decoder.finish()?;
        Ok(compact)
    }
}
