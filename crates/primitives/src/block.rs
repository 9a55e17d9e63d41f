use crate::hash::{blake2b, Hash};
use crate::ser::{DecodeError, Decoder, Encoder};
use crate::transaction::{Transaction, TransactionBody};

/// Number of proof-of-work nonces carried by every header.
pub const PROOF_NONCE_COUNT: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u16,
    pub height: u64,
    pub prev_hash: Hash,
    pub timestamp: i64,
    pub output_root: Hash,
    pub rangeproof_root: Hash,
    pub kernel_root: Hash,
    pub output_mmr_size: u64,
    pub kernel_mmr_size: u64,
    /// Cumulative difficulty of the chain up to and including this header.
    pub total_difficulty: u64,
    /// Accumulated kernel offset of the chain up to this header.
    pub total_kernel_offset: [u8; 32],
    pub secondary_scaling: u32,
    pub nonce: u64,
    pub proof_nonces: Vec<u64>,
}

impl BlockHeader {
    pub fn write(&self, encoder: &mut Encoder) {
        self.write_pre_pow(encoder);
        encoder.write_u64(self.nonce);
        for nonce in &self.proof_nonces {
            encoder.write_u64(*nonce);
        }
    }

    /// Everything the proof of work commits to.
    pub fn write_pre_pow(&self, encoder: &mut Encoder) {
        encoder.write_u16(self.version);
        encoder.write_u64(self.height);
        encoder.write_hash(&self.prev_hash);
        encoder.write_i64(self.timestamp);
        encoder.write_hash(&self.output_root);
        encoder.write_hash(&self.rangeproof_root);
        encoder.write_hash(&self.kernel_root);
        encoder.write_u64(self.output_mmr_size);
        encoder.write_u64(self.kernel_mmr_size);
        encoder.write_u64(self.total_difficulty);
        encoder.write_bytes(&self.total_kernel_offset);
        encoder.write_u32(self.secondary_scaling);
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_u16()?;
        let height = decoder.read_u64()?;
        let prev_hash = decoder.read_hash()?;
        let timestamp = decoder.read_i64()?;
        let output_root = decoder.read_hash()?;
        let rangeproof_root = decoder.read_hash()?;
        let kernel_root = decoder.read_hash()?;
        let output_mmr_size = decoder.read_u64()?;
        let kernel_mmr_size = decoder.read_u64()?;
        let total_difficulty = decoder.read_u64()?;
        let total_kernel_offset = decoder.read_fixed::<32>()?;
        let secondary_scaling = decoder.read_u32()?;
        let nonce = decoder.read_u64()?;
        let mut proof_nonces = Vec::with_capacity(PROOF_NONCE_COUNT);
        for _ in 0..PROOF_NONCE_COUNT {
            proof_nonces.push(decoder.read_u64()?);
        }
        Ok(Self {
            version,
            height,
            prev_hash,
            timestamp,
            output_root,
            rangeproof_root,
            kernel_root,
            output_mmr_size,
            kernel_mmr_size,
            total_difficulty,
            total_kernel_offset,
            secondary_scaling,
            nonce,
            proof_nonces,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(200);
        self.write(&mut encoder);
        encoder.into_inner()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::read(&mut decoder)?;
        decoder.finish()?;
        Ok(header)
    }

    pub fn hash(&self) -> Hash {
        blake2b(&self.serialize())
    }

    /// Bytes hashed by the proof-of-work check: pre-pow fields plus nonce.
    pub fn pre_pow(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(200);
        self.write_pre_pow(&mut encoder);
        encoder.write_u64(self.nonce);
        encoder.into_inner()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub body: TransactionBody,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Assembles a block body from transactions: the union of all inputs,
    /// outputs and kernels, re-sorted.
    pub fn body_from_transactions(transactions: &[Transaction]) -> TransactionBody {
        let mut body = TransactionBody::default();
        for tx in transactions {
            body.inputs.extend_from_slice(&tx.body.inputs);
            body.outputs.extend_from_slice(&tx.body.outputs);
            body.kernels.extend_from_slice(&tx.body.kernels);
        }
        body.sort();
        body
    }

    pub fn write(&self, encoder: &mut Encoder) {
        self.header.write(encoder);
        self.body.write(encoder);
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::read(decoder)?;
        let body = TransactionBody::read(decoder)?;
        Ok(Self { header, body })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.write(&mut encoder);
        encoder.into_inner()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let block = Self::read(&mut decoder)?;
        decoder.finish()?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ZERO_HASH;

    pub fn test_header(height: u64, prev_hash: Hash) -> BlockHeader {
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
            nonce: height * 31,
            proof_nonces: vec![height; PROOF_NONCE_COUNT],
        }
    }

    #[test]
    fn header_round_trip() {
        let header = test_header(42, blake2b(b"prev"));
        let decoded = BlockHeader::deserialize(&header.serialize()).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }

    #[test]
    fn hash_commits_to_every_field() {
        let header = test_header(1, ZERO_HASH);
        let mut tweaked = header.clone();
        tweaked.secondary_scaling += 1;
        assert_ne!(header.hash(), tweaked.hash());
        let mut tweaked = header.clone();
        tweaked.nonce += 1;
        assert_ne!(header.hash(), tweaked.hash());
    }

    #[test]
    fn block_round_trip() {
        let block = Block {
            header: test_header(3, blake2b(b"parent")),
            body: TransactionBody::default(),
        };
        let decoded = Block::deserialize(&block.serialize()).expect("decode");
        assert_eq!(decoded, block);
    }

    #[test]
    fn truncated_header_rejected() {
        let bytes = test_header(1, ZERO_HASH).serialize();
        assert!(BlockHeader::deserialize(&bytes[..bytes.len() - 1]).is_err());
    }
}
