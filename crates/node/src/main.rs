//! `mwd` — a Mimblewimble full node daemon.

mod config;
mod conn_manager;
mod msg;
mod node;
mod peer;
mod peer_book;
mod pipeline;
mod seeder;
mod syncer;

use std::sync::Arc;

use mwd_chainstate::ChainState;
use mwd_consensus::chain_params;
use mwd_log::{log_error, log_info, Format, Level, LogConfig};
use mwd_storage::fjall::FjallStore;

use crate::config::NodeConfig;
use crate::node::Node;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match NodeConfig::load(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("mwd: {err}");
            std::process::exit(2);
        }
    };

    mwd_log::init(LogConfig {
        level: Level::parse(&config.log_level).unwrap_or(Level::Info),
        format: Format::parse(&config.log_format).unwrap_or(Format::Text),
        timestamps: true,
    });

    let network = match config.network_kind() {
        Ok(network) => network,
        Err(err) => {
            log_error!("{err}");
            std::process::exit(2);
        }
    };
    let params = chain_params(network);
    log_info!(
        "starting mwd {} on {:?}, data dir {}",
        env!("CARGO_PKG_VERSION"),
        network,
        config.data_dir.display()
    );

    if let Err(err) = std::fs::create_dir_all(&config.data_dir) {
        log_error!("data dir {}: {err}", config.data_dir.display());
        std::process::exit(1);
    }
    let store = match FjallStore::open(config.data_dir.join("db")) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            log_error!("opening block db: {err}");
            std::process::exit(1);
        }
    };
    let chain = match ChainState::open(params.clone(), store, &config.data_dir) {
        Ok(chain) => Arc::new(chain),
        Err(err) => {
            log_error!("opening chain state: {err}");
            std::process::exit(1);
        }
    };
    log_info!(
        "chain state at height {} (candidate {})",
        chain.tip_info().confirmed_height,
        chain.tip_info().candidate_height
    );

    let node = match Node::start(config, params, chain).await {
        Ok(node) => node,
        Err(err) => {
            log_error!("node start failed: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        log_error!("signal handler failed: {err}");
    }
    node.shutdown();
}
