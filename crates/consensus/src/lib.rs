pub mod crypto;
pub mod difficulty;
pub mod params;

pub use crypto::{
    add_kernel_offsets, sub_kernel_offsets, verify_kernel_signature, verify_kernel_signatures,
    verify_kernel_sums, verify_rangeproof, CryptoError,
};
pub use difficulty::{next_difficulty, proof_difficulty, verify_proof_of_work, HeaderInfo, PowError};
pub use params::{chain_params, ChainParams, Network};
