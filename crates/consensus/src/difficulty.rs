//! Difficulty retargeting and proof-of-work evaluation.

use blake2b_simd::Params as Blake2bParams;
use mwd_primitives::block::{BlockHeader, PROOF_NONCE_COUNT};

use crate::params::ChainParams;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowError {
    WrongProofSize,
    InsufficientDifficulty,
    SecondaryScalingOutOfRange,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::WrongProofSize => write!(f, "wrong proof nonce count"),
            PowError::InsufficientDifficulty => write!(f, "proof does not meet difficulty"),
            PowError::SecondaryScalingOutOfRange => write!(f, "secondary scaling out of range"),
        }
    }
}

impl std::error::Error for PowError {}

/// Snapshot of the per-header fields the retarget consumes.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub timestamp: i64,
    /// Difficulty of this single header (total minus parent total).
    pub difficulty: u64,
}

impl HeaderInfo {
    pub fn from_header(header: &BlockHeader, prev_total: u64) -> Self {
        Self {
            timestamp: header.timestamp,
            difficulty: header.total_difficulty.saturating_sub(prev_total),
        }
    }
}

/// Damping factor applied to the measured window timespan; smooths out
/// timestamp manipulation by single miners.
const DAMP_FACTOR: i64 = 3;
/// The adjusted timespan is clamped to `window / CLAMP_FACTOR ..= window * CLAMP_FACTOR`.
const CLAMP_FACTOR: i64 = 2;

/// Difficulty required for the header following `window`, oldest first.
/// With fewer than two entries the minimum applies.
pub fn next_difficulty(params: &ChainParams, window: &[HeaderInfo]) -> u64 {
    if window.len() < 2 {
        return params.min_difficulty;
    }

    let first = &window[0];
    let last = &window[window.len() - 1];
    let intervals = (window.len() - 1) as i64;
    let target_timespan = intervals * params.block_time_secs;
    let actual_timespan = (last.timestamp - first.timestamp).max(1);

    // Damped: ts = (actual + (damp-1)*target) / damp, then clamped.
    let damped = (actual_timespan + (DAMP_FACTOR - 1) * target_timespan) / DAMP_FACTOR;
    let clamped = damped.clamp(
        target_timespan / CLAMP_FACTOR,
        target_timespan * CLAMP_FACTOR,
    );

    let diff_sum: u128 = window
        .iter()
        .skip(1)
        .map(|info| info.difficulty as u128)
        .sum();
    let next = diff_sum * target_timespan as u128 / (intervals as u128) / clamped.max(1) as u128;

    u64::try_from(next)
        .unwrap_or(u64::MAX)
        .max(params.min_difficulty)
}

/// Difficulty achieved by a header's proof: the proof nonces are hashed with
/// the pre-pow commitment, and the leading 64 bits of the digest scale the
/// maximum target down.
pub fn proof_difficulty(pre_pow: &[u8], proof_nonces: &[u64]) -> u64 {
    let mut state = Blake2bParams::new().hash_length(32).to_state();
    state.update(pre_pow);
    for nonce in proof_nonces {
        state.update(&nonce.to_be_bytes());
    }
    let digest = state.finalize();
    let mut leading = [0u8; 8];
    leading.copy_from_slice(&digest.as_bytes()[..8]);
    let value = u64::from_be_bytes(leading).max(1);
    u64::MAX / value
}

/// Policy checks on a header's proof of work: proof shape, secondary scaling
/// bounds, and achieved difficulty at least the required difficulty.
pub fn verify_proof_of_work(
    params: &ChainParams,
    header: &BlockHeader,
    required_difficulty: u64,
) -> Result<(), PowError> {
    if header.proof_nonces.len() != PROOF_NONCE_COUNT {
        return Err(PowError::WrongProofSize);
    }
    if header.secondary_scaling == 0 || header.secondary_scaling > params.max_secondary_scaling {
        return Err(PowError::SecondaryScalingOutOfRange);
    }
    let achieved = proof_difficulty(&header.pre_pow(), &header.proof_nonces);
    if achieved < required_difficulty {
        return Err(PowError::InsufficientDifficulty);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{chain_params, Network};

    fn window(spacing: i64, difficulty: u64, len: usize) -> Vec<HeaderInfo> {
        (0..len)
            .map(|i| HeaderInfo {
                timestamp: 1_700_000_000 + i as i64 * spacing,
                difficulty,
            })
            .collect()
    }

    #[test]
    fn on_target_window_keeps_difficulty() {
        let params = chain_params(Network::Mainnet);
        let window = window(params.block_time_secs, 5_000, params.difficulty_window);
        let next = next_difficulty(&params, &window);
        assert_eq!(next, 5_000);
    }

    #[test]
    fn fast_blocks_raise_difficulty() {
        let params = chain_params(Network::Mainnet);
        let fast = window(params.block_time_secs / 2, 5_000, params.difficulty_window);
        assert!(next_difficulty(&params, &fast) > 5_000);
    }

    #[test]
    fn slow_blocks_lower_difficulty() {
        let params = chain_params(Network::Mainnet);
        let slow = window(params.block_time_secs * 2, 5_000, params.difficulty_window);
        assert!(next_difficulty(&params, &slow) < 5_000);
    }

    #[test]
    fn short_window_uses_minimum() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(next_difficulty(&params, &[]), params.min_difficulty);
    }

    #[test]
    fn minimum_difficulty_always_met() {
        // difficulty 1 accepts any digest: u64::MAX / h >= 1 for all h.
        let params = chain_params(Network::Regtest);
        let header = params.genesis.clone();
        assert!(verify_proof_of_work(&params, &header, 1).is_ok());
    }

    #[test]
    fn wrong_proof_size_rejected() {
        let params = chain_params(Network::Regtest);
        let mut header = params.genesis.clone();
        header.proof_nonces.pop();
        assert_eq!(
            verify_proof_of_work(&params, &header, 1),
            Err(PowError::WrongProofSize)
        );
    }
}
