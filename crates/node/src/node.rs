//! Node assembly: owns the worker threads and tasks, and tears them down in
//! order on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mwd_chainstate::ChainState;
use mwd_consensus::ChainParams;
use mwd_log::{log_info, log_warn};
use mwd_pool::TransactionPool;
use mwd_storage::KeyValueStore;
use rand::Rng;
use tokio::net::TcpListener;

use crate::config::NodeConfig;
use crate::conn_manager::ConnectionManager;
use crate::peer_book::PeerBook;
use crate::pipeline::{self, PipelineContext};
use crate::seeder::{self, SeederContext};
use crate::syncer::{SyncStatus, Syncer};

pub struct Node<S> {
    pub chain: Arc<ChainState<S>>,
    pub manager: Arc<ConnectionManager>,
    pub sync: Arc<SyncStatus>,
    pub peer_book: Arc<PeerBook>,
    terminate: Arc<AtomicBool>,
    threads: Vec<std::thread::JoinHandle<()>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl<S: KeyValueStore + 'static> Node<S> {
    /// Brings the whole node up: pipeline workers, broadcast and prune
    /// loops, the syncer, the seeder tasks and the status display.
    pub async fn start(
        config: NodeConfig,
        params: ChainParams,
        chain: Arc<ChainState<S>>,
    ) -> Result<Node<S>, String> {
        let terminate = Arc::new(AtomicBool::new(false));
        let manager = Arc::new(ConnectionManager::new(config.broadcast_fanout));
        let peer_book = Arc::new(PeerBook::load(config.data_dir.join("peers.json")));
        for seed in &config.seeds {
            peer_book.add_address(*seed);
        }
        let sync = Arc::new(SyncStatus::new());
        let pool = Arc::new(Mutex::new(TransactionPool::new(config.pool_max_entries)));

        let (pipeline_tx, pipeline_rx) = crossbeam_channel::unbounded();
        let ctx = Arc::new(PipelineContext {
            chain: Arc::clone(&chain),
            pool,
            manager: Arc::clone(&manager),
            peer_book: Arc::clone(&peer_book),
            sync: Arc::clone(&sync),
            magic: params.magic,
            ban_secs: config.ban_secs,
            orphans: Mutex::new(Default::default()),
        });
        let mut threads = pipeline::spawn_workers(ctx, pipeline_rx, config.pipeline_workers);

        // Broadcast worker.
        {
            let manager = Arc::clone(&manager);
            threads.push(
                std::thread::Builder::new()
                    .name("broadcast".to_string())
                    .spawn(move || manager.run_broadcast_worker())
                    .map_err(|err| err.to_string())?,
            );
        }

        // Prune loop: ping with the local tip and drop stale peers.
        {
            let manager = Arc::clone(&manager);
            let chain = Arc::clone(&chain);
            let peer_book = Arc::clone(&peer_book);
            let terminate = Arc::clone(&terminate);
            let magic = params.magic;
            let interval = Duration::from_secs(config.ping_interval_secs.max(1));
            let inactivity_ms = config.peer_inactivity_secs.saturating_mul(1_000);
            threads.push(
                std::thread::Builder::new()
                    .name("prune".to_string())
                    .spawn(move || {
                        while !terminate.load(Ordering::Relaxed) {
                            std::thread::sleep(interval);
                            let tip = chain.tip_info();
                            manager.prune_connections(
                                true,
                                (tip.confirmed_difficulty, tip.confirmed_height),
                                inactivity_ms,
                                magic,
                                &peer_book,
                            );
                        }
                    })
                    .map_err(|err| err.to_string())?,
            );
        }

        // Syncer.
        {
            let syncer = Syncer::new(
                Arc::clone(&chain),
                Arc::clone(&manager),
                Arc::clone(&peer_book),
                Arc::clone(&sync),
                params.magic,
                params.finality_depth,
                config.txhashset_timeout_secs,
                config.ban_secs,
                Arc::clone(&terminate),
            );
            threads.push(
                std::thread::Builder::new()
                    .name("syncer".to_string())
                    .spawn(move || syncer.run())
                    .map_err(|err| err.to_string())?,
            );
        }

        // Status display.
        {
            let chain = Arc::clone(&chain);
            let manager = Arc::clone(&manager);
            let sync = Arc::clone(&sync);
            let terminate = Arc::clone(&terminate);
            threads.push(
                std::thread::Builder::new()
                    .name("status".to_string())
                    .spawn(move || {
                        while !terminate.load(Ordering::Relaxed) {
                            std::thread::sleep(Duration::from_secs(10));
                            let tip = chain.tip_info();
                            let network_height = sync.network_height();
                            let header_pct = if network_height > 0 {
                                tip.candidate_height * 100 / network_height
                            } else {
                                0
                            };
                            log_info!(
                                "status: {} | peers {} | headers {} ({header_pct}%) | blocks {} | network {}",
                                sync.phase().as_str(),
                                manager.connection_count(),
                                tip.candidate_height,
                                tip.confirmed_height,
                                network_height,
                            );
                        }
                    })
                    .map_err(|err| err.to_string())?,
            );
        }

        // Seeder: listener + dialer tasks.
        let seeder_ctx = Arc::new(SeederContext {
            chain: Arc::clone(&chain),
            manager: Arc::clone(&manager),
            peer_book: Arc::clone(&peer_book),
            pipeline_tx,
            magic: params.magic,
            genesis: params.genesis_hash(),
            protocol_version: params.protocol_version,
            node_nonce: rand::thread_rng().gen(),
            user_agent: format!("mwd/{}", env!("CARGO_PKG_VERSION")),
            archive_dir: config.data_dir.join("archives"),
            queue_bound: config.pipeline_queue_bound,
            max_connections: config.max_connections,
            min_outbound: config.min_outbound,
            seeds: config.seeds.clone(),
            terminate: Arc::clone(&terminate),
        });
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|err| format!("bind {}: {err}", config.listen_addr))?;
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(seeder::run_listener(
            Arc::clone(&seeder_ctx),
            listener,
        )));
        tasks.push(tokio::spawn(seeder::run_dialer(seeder_ctx)));

        Ok(Node {
            chain,
            manager,
            sync,
            peer_book,
            terminate,
            threads,
            tasks,
        })
    }

    /// Ordered teardown: stop accepting work, drain workers, disconnect
    /// peers, then flush chain state and the peer book.
    pub fn shutdown(mut self) {
        log_info!("shutting down");
        self.terminate.store(true, Ordering::Relaxed);
        self.manager.terminate();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        let tip = self.chain.tip_info();
        self.manager.prune_connections(
            false,
            (tip.confirmed_difficulty, tip.confirmed_height),
            0,
            [0, 0],
            &self.peer_book,
        );
        self.peer_book.save();
        if let Err(err) = self.chain.shutdown() {
            log_warn!("chain shutdown flush failed: {err}");
        }
        log_info!("shutdown complete");
    }
}
