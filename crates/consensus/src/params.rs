use mwd_primitives::block::{BlockHeader, PROOF_NONCE_COUNT};
use mwd_primitives::hash::ZERO_HASH;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/// Everything the validators need to know about the chain being followed.
#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Two magic bytes prefixing every wire message.
    pub magic: [u8; 2],
    pub protocol_version: u32,
    pub genesis: BlockHeader,
    /// Target seconds between blocks.
    pub block_time_secs: i64,
    /// Number of prior headers consulted by the difficulty retarget.
    pub difficulty_window: usize,
    pub min_difficulty: u64,
    /// Headers stamped further than this into the future are rejected.
    pub max_future_drift_secs: i64,
    /// Median-time window for the past-timestamp bound.
    pub median_time_window: usize,
    /// Depth past which the confirmed chain is considered final; blocks below
    /// the horizon are prunable.
    pub finality_depth: u64,
    pub max_secondary_scaling: u32,
    /// Lowest header version accepted at or above the paired height.
    pub version_schedule: Vec<(u64, u16)>,
}

impl ChainParams {
    pub fn genesis_hash(&self) -> mwd_primitives::Hash {
        self.genesis.hash()
    }

    /// Header version validity is a step function of height.
    pub fn valid_header_version(&self, height: u64, version: u16) -> bool {
        let mut required = 1;
        for (from_height, from_version) in &self.version_schedule {
            if height >= *from_height {
                required = *from_version;
            }
        }
        version == required
    }
}

fn genesis_header(timestamp: i64) -> BlockHeader {
    BlockHeader {
        version: 1,
        height: 0,
        prev_hash: ZERO_HASH,
        timestamp,
        output_root: ZERO_HASH,
        rangeproof_root: ZERO_HASH,
        kernel_root: ZERO_HASH,
        output_mmr_size: 0,
        kernel_mmr_size: 0,
        total_difficulty: 0,
        total_kernel_offset: [0u8; 32],
        secondary_scaling: 1,
        nonce: 0,
        proof_nonces: vec![0; PROOF_NONCE_COUNT],
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            magic: [0x4d, 0x57],
            protocol_version: 1,
            genesis: genesis_header(1_696_118_400),
            block_time_secs: 60,
            difficulty_window: 60,
            min_difficulty: 1_000,
            max_future_drift_secs: 12 * 60,
            median_time_window: 11,
            finality_depth: 60,
            max_secondary_scaling: 1_000,
            version_schedule: vec![(0, 1)],
        },
        Network::Testnet => ChainParams {
            network,
            magic: [0x54, 0x57],
            protocol_version: 1,
            genesis: genesis_header(1_693_526_400),
            block_time_secs: 60,
            difficulty_window: 60,
            min_difficulty: 10,
            max_future_drift_secs: 12 * 60,
            median_time_window: 11,
            finality_depth: 60,
            max_secondary_scaling: 1_000,
            version_schedule: vec![(0, 1)],
        },
        Network::Regtest => ChainParams {
            network,
            magic: [0x52, 0x57],
            protocol_version: 1,
            genesis: genesis_header(1_690_000_000),
            block_time_secs: 60,
            difficulty_window: 10,
            min_difficulty: 1,
            max_future_drift_secs: i64::MAX / 4,
            median_time_window: 11,
            finality_depth: 10,
            max_secondary_scaling: 1_000,
            version_schedule: vec![(0, 1)],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn networks_have_distinct_genesis() {
        let mainnet = chain_params(Network::Mainnet);
        let testnet = chain_params(Network::Testnet);
        assert_ne!(mainnet.genesis_hash(), testnet.genesis_hash());
    }

    #[test]
    fn version_schedule_is_step_function() {
        let mut params = chain_params(Network::Regtest);
        params.version_schedule = vec![(0, 1), (100, 2)];
        assert!(params.valid_header_version(0, 1));
        assert!(params.valid_header_version(99, 1));
        assert!(!params.valid_header_version(100, 1));
        assert!(params.valid_header_version(100, 2));
    }
}
