pub mod block;
pub mod compact;
pub mod hash;
pub mod ser;
pub mod transaction;

pub use block::{Block, BlockHeader, PROOF_NONCE_COUNT};
pub use compact::{kernel_short_id, short_id_key, CompactBlock, ShortId};
pub use hash::{blake2b, Hash, ZERO_HASH};
pub use ser::{DecodeError, Decoder, Encoder};
pub use transaction::{
    Commitment, Input, Output, Transaction, TransactionBody, TxKernel, COMMITMENT_LEN,
};
