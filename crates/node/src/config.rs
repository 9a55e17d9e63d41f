use std::net::SocketAddr;
use std::path::PathBuf;

use mwd_consensus::Network;
use serde::Deserialize;

const DEFAULT_PORT: u16 = 13414;

/// Node configuration: a JSON config file overlaid with command-line flags.
/// Protocol policy values (ping interval, broadcast fanout, queue bounds)
/// are tunables here, not constants.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: String,
    pub data_dir: PathBuf,
    pub listen_addr: SocketAddr,
    pub seeds: Vec<SocketAddr>,
    pub max_connections: usize,
    pub min_outbound: usize,
    /// Peers pinged this often from the prune loop.
    pub ping_interval_secs: u64,
    /// Broadcasts forward to at most this many peers.
    pub broadcast_fanout: usize,
    pub pipeline_workers: usize,
    /// A connection beyond this many undispatched messages is slow and gets
    /// disconnected.
    pub pipeline_queue_bound: usize,
    pub peer_inactivity_secs: u64,
    pub txhashset_timeout_secs: u64,
    pub ban_secs: u64,
    pub pool_max_entries: usize,
    pub log_level: String,
    pub log_format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            data_dir: PathBuf::from("data"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            seeds: Vec::new(),
            max_connections: 32,
            min_outbound: 4,
            ping_interval_secs: 10,
            broadcast_fanout: 8,
            pipeline_workers: 4,
            pipeline_queue_bound: 128,
            peer_inactivity_secs: 90,
            txhashset_timeout_secs: 300,
            ban_secs: 3 * 60 * 60,
            pool_max_entries: 50_000,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn network_kind(&self) -> Result<Network, String> {
        match self.network.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network {other:?}")),
        }
    }

    /// Loads the config file (when present), then applies flag overrides.
    pub fn load(args: &[String]) -> Result<Self, String> {
        let mut config_path: Option<PathBuf> = None;
        let mut iter = args.iter().peekable();
        while let Some(arg) = iter.next() {
            if arg == "--config" {
                let value = iter.next().ok_or("--config requires a path")?;
                config_path = Some(PathBuf::from(value));
            }
        }

        let mut config = match config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|err| format!("config {}: {err}", path.display()))?;
                serde_json::from_str(&raw)
                    .map_err(|err| format!("config {}: {err}", path.display()))?
            }
            None => NodeConfig::default(),
        };

        let mut iter = args.iter().peekable();
        while let Some(arg) = iter.next() {
            let mut take = |name: &str| -> Result<String, String> {
                iter.next()
                    .cloned()
                    .ok_or_else(|| format!("{name} requires a value"))
            };
            match arg.as_str() {
                "--config" => {
                    let _ = take("--config")?;
                }
                "--network" => config.network = take("--network")?,
                "--data-dir" => config.data_dir = PathBuf::from(take("--data-dir")?),
                "--listen" => {
                    config.listen_addr = take("--listen")?
                        .parse()
                        .map_err(|_| "--listen expects host:port".to_string())?;
                }
                "--seed" => {
                    let seed = take("--seed")?
                        .parse()
                        .map_err(|_| "--seed expects host:port".to_string())?;
                    config.seeds.push(seed);
                }
                "--log-level" => config.log_level = take("--log-level")?,
                "--log-format" => config.log_format = take("--log-format")?,
                other if other.starts_with("--") => {
                    return Err(format!("unknown flag {other}"));
                }
                _ => {}
            }
        }
        config.network_kind()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn defaults_hold_policy_values() {
        let config = NodeConfig::default();
        assert_eq!(config.ping_interval_secs, 10);
        assert_eq!(config.broadcast_fanout, 8);
        assert_eq!(config.network_kind().unwrap(), Network::Mainnet);
    }

    #[test]
    fn flags_override_defaults() {
        let config = NodeConfig::load(&args(&[
            "--network",
            "regtest",
            "--listen",
            "127.0.0.1:24000",
            "--seed",
            "10.0.0.2:13414",
        ]))
        .unwrap();
        assert_eq!(config.network_kind().unwrap(), Network::Regtest);
        assert_eq!(config.listen_addr.port(), 24000);
        assert_eq!(config.seeds.len(), 1);
    }

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(NodeConfig::load(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn config_file_merges_with_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mwd.json");
        std::fs::write(&path, r#"{"network":"testnet","broadcast_fanout":4}"#).unwrap();
        let config = NodeConfig::load(&args(&[
            "--config",
            path.to_str().unwrap(),
            "--network",
            "regtest",
        ]))
        .unwrap();
        assert_eq!(config.broadcast_fanout, 4);
        assert_eq!(config.network_kind().unwrap(), Network::Regtest);
    }
}
