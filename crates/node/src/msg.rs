//! Wire message codec: a 2-byte magic, a 1-byte kind and a big-endian u64
//! payload length frame every message. All payload integers are big-endian;
//! hashes travel as 32 raw bytes.

use std::net::SocketAddr;

use mwd_primitives::block::{Block, BlockHeader};
use mwd_primitives::compact::CompactBlock;
use mwd_primitives::hash::Hash;
use mwd_primitives::ser::{DecodeError, Decoder, Encoder};
use mwd_primitives::transaction::Transaction;

pub const FRAME_HEADER_LEN: usize = 11;
pub const MAX_PAYLOAD_SIZE: u64 = 4 * 1024 * 1024;
/// Archives bypass the payload cap and spool to disk while being read.
pub const MAX_ARCHIVE_SIZE: u64 = 1024 * 1024 * 1024;
pub const MAX_LOCATOR_HASHES: usize = 128;
pub const MAX_HEADERS_PER_MSG: usize = 512;
pub const MAX_PEER_ADDRS: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MsgKind {
    Hand = 1,
    Shake = 2,
    Ping = 3,
    Pong = 4,
    GetPeerAddrs = 5,
    PeerAddrs = 6,
    GetHeaders = 7,
    Headers = 8,
    GetBlock = 9,
    Block = 10,
    GetCompactBlock = 11,
    CompactBlock = 12,
    Transaction = 13,
    TxHashSetRequest = 14,
    TxHashSetArchive = 15,
}

impl MsgKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => MsgKind::Hand,
            2 => MsgKind::Shake,
            3 => MsgKind::Ping,
            4 => MsgKind::Pong,
            5 => MsgKind::GetPeerAddrs,
            6 => MsgKind::PeerAddrs,
            7 => MsgKind::GetHeaders,
            8 => MsgKind::Headers,
            9 => MsgKind::GetBlock,
            10 => MsgKind::Block,
            11 => MsgKind::GetCompactBlock,
            12 => MsgKind::CompactBlock,
            13 => MsgKind::Transaction,
            14 => MsgKind::TxHashSetRequest,
            15 => MsgKind::TxHashSetArchive,
            _ => return None,
        })
    }
}

/// Frames a payload for the wire.
pub fn frame(magic: [u8; 2], kind: MsgKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&magic);
    out.push(kind as u8);
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Peer identity and tip exchanged during the handshake. `Hand` carries a
/// nonce for self-connection detection; `Shake` echoes without one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub version: u32,
    pub capabilities: u32,
    pub nonce: u64,
    pub total_difficulty: u64,
    pub height: u64,
    pub genesis: Hash,
    pub user_agent: String,
}

pub fn build_hand(info: &HandshakeInfo) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u32(info.version);
    encoder.write_u32(info.capabilities);
    encoder.write_u64(info.nonce);
    encoder.write_u64(info.total_difficulty);
    encoder.write_u64(info.height);
    encoder.write_hash(&info.genesis);
    encoder.write_var_bytes(info.user_agent.as_bytes());
    encoder.into_inner()
}

pub fn parse_hand(payload: &[u8]) -> Result<HandshakeInfo, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let info = HandshakeInfo {
        version: decoder.read_u32()?,
        capabilities: decoder.read_u32()?,
        nonce: decoder.read_u64()?,
        total_difficulty: decoder.read_u64()?,
        height: decoder.read_u64()?,
        genesis: decoder.read_hash()?,
        user_agent: String::from_utf8(decoder.read_var_bytes()?)
            .map_err(|_| DecodeError::InvalidData("user agent not utf8"))?,
    };
    decoder.finish()?;
    Ok(info)
}

pub fn build_shake(info: &HandshakeInfo) -> Vec<u8> {
    build_hand(info)
}

pub fn parse_shake(payload: &[u8]) -> Result<HandshakeInfo, DecodeError> {
    parse_hand(payload)
}

pub fn build_ping(total_difficulty: u64, height: u64) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(16);
    encoder.write_u64(total_difficulty);
    encoder.write_u64(height);
    encoder.into_inner()
}

pub fn parse_ping(payload: &[u8]) -> Result<(u64, u64), DecodeError> {
    let mut decoder = Decoder::new(payload);
    let total_difficulty = decoder.read_u64()?;
    let height = decoder.read_u64()?;
    decoder.finish()?;
    Ok((total_difficulty, height))
}

pub fn build_get_peer_addrs(capabilities: u32) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(4);
    encoder.write_u32(capabilities);
    encoder.into_inner()
}

pub fn parse_get_peer_addrs(payload: &[u8]) -> Result<u32, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let capabilities = decoder.read_u32()?;
    decoder.finish()?;
    Ok(capabilities)
}

pub fn build_peer_addrs(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    let count = addrs.len().min(MAX_PEER_ADDRS);
    encoder.write_u64(count as u64);
    for addr in addrs.iter().take(count) {
        encoder.write_var_bytes(addr.to_string().as_bytes());
    }
    encoder.into_inner()
}

pub fn parse_peer_addrs(payload: &[u8]) -> Result<Vec<SocketAddr>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_len()?;
    if count > MAX_PEER_ADDRS {
        return Err(DecodeError::SizeTooLarge);
    }
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = String::from_utf8(decoder.read_var_bytes()?)
            .map_err(|_| DecodeError::InvalidData("peer address not utf8"))?;
        let addr = raw
            .parse()
            .map_err(|_| DecodeError::InvalidData("peer address does not parse"))?;
        addrs.push(addr);
    }
    decoder.finish()?;
    Ok(addrs)
}

pub fn build_get_headers(locator: &[Hash]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    let count = locator.len().min(MAX_LOCATOR_HASHES);
    encoder.write_u64(count as u64);
    for hash in locator.iter().take(count) {
        encoder.write_hash(hash);
    }
    encoder.into_inner()
}

pub fn parse_get_headers(payload: &[u8]) -> Result<Vec<Hash>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_len()?;
    if count > MAX_LOCATOR_HASHES {
        return Err(DecodeError::SizeTooLarge);
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(decoder.read_hash()?);
    }
    decoder.finish()?;
    Ok(locator)
}

pub fn build_headers(headers: &[BlockHeader]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    let count = headers.len().min(MAX_HEADERS_PER_MSG);
    encoder.write_u64(count as u64);
    for header in headers.iter().take(count) {
        header.write(&mut encoder);
    }
    encoder.into_inner()
}

pub fn parse_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_len()?;
    if count > MAX_HEADERS_PER_MSG {
        return Err(DecodeError::SizeTooLarge);
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        headers.push(BlockHeader::read(&mut decoder)?);
    }
    decoder.finish()?;
    Ok(headers)
}

pub fn build_get_block(hash: &Hash) -> Vec<u8> {
    hash.to_vec()
}

pub fn parse_get_block(payload: &[u8]) -> Result<Hash, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let hash = decoder.read_hash()?;
    decoder.finish()?;
    Ok(hash)
}

pub fn build_block(block: &Block) -> Vec<u8> {
    block.serialize()
}

pub fn parse_block(payload: &[u8]) -> Result<Block, DecodeError> {
    Block::deserialize(payload)
}

pub fn build_compact_block(compact: &CompactBlock) -> Vec<u8> {
    compact.serialize()
}

pub fn parse_compact_block(payload: &[u8]) -> Result<CompactBlock, DecodeError> {
    CompactBlock::deserialize(payload)
}

pub fn build_transaction(tx: &Transaction) -> Vec<u8> {
    tx.serialize()
}

pub fn parse_transaction(payload: &[u8]) -> Result<Transaction, DecodeError> {
    Transaction::deserialize(payload)
}

pub fn build_txhashset_request(hash: &Hash, height: u64) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(40);
    encoder.write_hash(hash);
    encoder.write_u64(height);
    encoder.into_inner()
}

pub fn parse_txhashset_request(payload: &[u8]) -> Result<(Hash, u64), DecodeError> {
    let mut decoder = Decoder::new(payload);
    let hash = decoder.read_hash()?;
    let height = decoder.read_u64()?;
    decoder.finish()?;
    Ok((hash, height))
}

/// Archive prefix preceding the raw bundle bytes within the payload.
pub fn build_txhashset_archive_prefix(hash: &Hash, height: u64, data_len: u64) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(48);
    encoder.write_hash(hash);
    encoder.write_u64(height);
    encoder.write_u64(data_len);
    encoder.into_inner()
}

pub fn parse_txhashset_archive_prefix(prefix: &[u8]) -> Result<(Hash, u64, u64), DecodeError> {
    let mut decoder = Decoder::new(prefix);
    let hash = decoder.read_hash()?;
    let height = decoder.read_u64()?;
    let data_len = decoder.read_u64()?;
    decoder.finish()?;
    Ok((hash, height, data_len))
}
