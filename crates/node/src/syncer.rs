//! Sync phase machine: observes local chain heights against the best peer
//! and drives outbound header, state and block requests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mwd_chainstate::{Branch, ChainState};
use mwd_log::{log_info, log_warn};
use mwd_storage::KeyValueStore;

use crate::conn_manager::ConnectionManager;
use crate::msg::{self, MsgKind};
use crate::peer_book::PeerBook;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncPhase {
    WaitingForPeers,
    SyncingHeaders,
    SyncingTxHashSet,
    ProcessingTxHashSet,
    SyncingBlocks,
    NotSyncing,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::WaitingForPeers => "waiting for peers",
            SyncPhase::SyncingHeaders => "syncing headers",
            SyncPhase::SyncingTxHashSet => "downloading txhashset",
            SyncPhase::ProcessingTxHashSet => "validating txhashset",
            SyncPhase::SyncingBlocks => "syncing blocks",
            SyncPhase::NotSyncing => "running",
        }
    }
}

/// Shared between the syncer thread, the pipeline workers and the status
/// display.
pub struct SyncStatus {
    phase: Mutex<SyncPhase>,
    network_height: AtomicU64,
    network_difficulty: AtomicU64,
    /// Connection expected to deliver the txhashset archive; 0 when none.
    txhashset_source: AtomicU64,
    txhashset_outcome: Mutex<Option<bool>>,
    txhashset_wait_ticks: AtomicU64,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(SyncPhase::WaitingForPeers),
            network_height: AtomicU64::new(0),
            network_difficulty: AtomicU64::new(0),
            txhashset_source: AtomicU64::new(0),
            txhashset_outcome: Mutex::new(None),
            txhashset_wait_ticks: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().expect("sync phase lock")
    }

    pub fn set_phase(&self, next: SyncPhase) {
        let mut phase = self.phase.lock().expect("sync phase lock");
        if *phase != next {
            log_info!("sync: {} -> {}", phase.as_str(), next.as_str());
            *phase = next;
        }
    }

    pub fn update_network(&self, difficulty: u64, height: u64) {
        self.network_difficulty.store(difficulty, Ordering::Relaxed);
        self.network_height.store(height, Ordering::Relaxed);
    }

    pub fn network_difficulty(&self) -> u64 {
        self.network_difficulty.load(Ordering::Relaxed)
    }

    pub fn network_height(&self) -> u64 {
        self.network_height.load(Ordering::Relaxed)
    }

    pub fn txhashset_requested(&self, source: u64) {
        self.txhashset_source.store(source, Ordering::Relaxed);
        self.txhashset_wait_ticks.store(0, Ordering::Relaxed);
        *self.txhashset_outcome.lock().expect("sync outcome lock") = None;
    }

    pub fn expecting_txhashset_from(&self, source: u64) -> bool {
        self.txhashset_source.load(Ordering::Relaxed) == source
    }

    pub fn txhashset_source(&self) -> u64 {
        self.txhashset_source.load(Ordering::Relaxed)
    }

    pub fn txhashset_done(&self, accepted: bool) {
        *self.txhashset_outcome.lock().expect("sync outcome lock") = Some(accepted);
    }

    fn take_txhashset_outcome(&self) -> Option<bool> {
        self.txhashset_outcome
            .lock()
            .expect("sync outcome lock")
            .take()
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Syncer<S> {
    chain: Arc<ChainState<S>>,
    manager: Arc<ConnectionManager>,
    peer_book: Arc<PeerBook>,
    status: Arc<SyncStatus>,
    magic: [u8; 2],
    finality_depth: u64,
    txhashset_timeout_ticks: u64,
    ban_secs: u64,
    terminate: Arc<AtomicBool>,
}

impl<S: KeyValueStore> Syncer<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<ChainState<S>>,
        manager: Arc<ConnectionManager>,
        peer_book: Arc<PeerBook>,
        status: Arc<SyncStatus>,
        magic: [u8; 2],
        finality_depth: u64,
        txhashset_timeout_secs: u64,
        ban_secs: u64,
        terminate: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chain,
            manager,
            peer_book,
            status,
            magic,
            finality_depth,
            txhashset_timeout_ticks: txhashset_timeout_secs.max(1),
            ban_secs,
            terminate,
        }
    }

    /// Thread body; one step per second until shutdown.
    pub fn run(&self) {
        while !self.terminate.load(Ordering::Relaxed) {
            self.step();
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    pub fn step(&self) {
        if let Some((difficulty, height)) = self.manager.most_work_tip() {
            self.status.update_network(difficulty, height);
        }
        let tip = self.chain.tip_info();
        let network_difficulty = self.status.network_difficulty();
        let peers = self.manager.connection_count();

        match self.status.phase() {
            SyncPhase::WaitingForPeers => {
                if peers == 0 {
                    return;
                }
                if network_difficulty > tip.candidate_difficulty {
                    self.status.set_phase(SyncPhase::SyncingHeaders);
                } else {
                    self.status.set_phase(SyncPhase::NotSyncing);
                }
            }
            SyncPhase::SyncingHeaders => {
                if peers == 0 {
                    self.status.set_phase(SyncPhase::WaitingForPeers);
                    return;
                }
                if tip.candidate_difficulty >= network_difficulty {
                    self.choose_body_sync(&tip);
                    return;
                }
                let locator = self.chain.locator();
                let frame = msg::frame(self.magic, MsgKind::GetHeaders, &msg::build_get_headers(&locator));
                self.manager.send_to_most_work_peer(frame);
            }
            SyncPhase::SyncingTxHashSet | SyncPhase::ProcessingTxHashSet => {
                match self.status.take_txhashset_outcome() {
                    Some(true) => {
                        self.status.txhashset_requested(0);
                        self.status.set_phase(SyncPhase::SyncingBlocks);
                    }
                    Some(false) => {
                        // The pipeline already banned the offending peer.
                        self.status.txhashset_requested(0);
                        self.status.set_phase(SyncPhase::WaitingForPeers);
                    }
                    None => {
                        let waited = self
                            .status
                            .txhashset_wait_ticks
                            .fetch_add(1, Ordering::Relaxed)
                            + 1;
                        if waited > self.txhashset_timeout_ticks {
                            let source = self.status.txhashset_source();
                            log_warn!("txhashset download timed out (connection {source})");
                            if let Some(addr) = self.manager.peer_addr(source) {
                                self.peer_book.ban(addr, self.ban_secs);
                            }
                            self.manager
                                .ban_connection(source, "txhashset download timed out");
                            self.status.txhashset_requested(0);
                            self.status.set_phase(SyncPhase::WaitingForPeers);
                        }
                    }
                }
            }
            SyncPhase::SyncingBlocks => {
                if tip.confirmed_difficulty >= network_difficulty {
                    self.status.set_phase(SyncPhase::NotSyncing);
                    return;
                }
                if peers == 0 {
                    self.status.set_phase(SyncPhase::WaitingForPeers);
                    return;
                }
                self.request_missing_blocks(&tip);
            }
            SyncPhase::NotSyncing => {
                if network_difficulty > tip.confirmed_difficulty {
                    self.status.set_phase(SyncPhase::SyncingHeaders);
                }
            }
        }
    }

    /// Headers are caught up; decide between state download and plain block
    /// sync based on how far the confirmed chain trails.
    fn choose_body_sync(&self, tip: &mwd_chainstate::TipInfo) {
        let far_behind =
            tip.candidate_height > tip.confirmed_height + 2 * self.finality_depth;
        if !far_behind {
            self.status.set_phase(SyncPhase::SyncingBlocks);
            return;
        }
        let target_height = tip.candidate_height.saturating_sub(self.finality_depth);
        let header = match self.chain.header_by_height(target_height, Branch::Candidate) {
            Ok(Some(header)) => header,
            _ => {
                self.status.set_phase(SyncPhase::SyncingBlocks);
                return;
            }
        };
        let frame = msg::frame(
            self.magic,
            MsgKind::TxHashSetRequest,
            &msg::build_txhashset_request(&header.hash(), target_height),
        );
        if let Some(source) = self.manager.send_to_most_work_peer(frame) {
            self.status.txhashset_requested(source);
            self.status.set_phase(SyncPhase::SyncingTxHashSet);
        }
    }

    fn request_missing_blocks(&self, tip: &mwd_chainstate::TipInfo) {
        const BLOCK_BATCH: u64 = 16;
        let from = tip.confirmed_height + 1;
        let to = tip.candidate_height.min(tip.confirmed_height + BLOCK_BATCH);
        for height in from..=to {
            let Ok(Some(header)) = self.chain.header_by_height(height, Branch::Candidate) else {
                continue;
            };
            let hash = header.hash();
            match self.chain.block_by_hash(&hash) {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    let frame =
                        msg::frame(self.magic, MsgKind::GetBlock, &msg::build_get_block(&hash));
                    self.manager.send_to_most_work_peer(frame);
                }
                Err(_) => continue,
            }
        }
    }
}
