//! Inbound message processing pool. Reader tasks enqueue decoded frames
//! tagged with their source connection; a small pool of workers dispatches
//! them to the chain, the pool and the peer layer. Backpressure is per
//! connection: a queue past its bound marks the peer slow and disconnects
//! it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use mwd_chainstate::{Branch, ChainState, ChainStatus};
use mwd_log::{log_debug, log_warn};
use mwd_pool::{PoolError, TransactionPool};
use mwd_primitives::block::Block;
use mwd_primitives::compact::CompactBlock;
use mwd_primitives::hash::{short_hash, Hash};
use mwd_storage::KeyValueStore;
use rand::Rng;

use crate::conn_manager::ConnectionManager;
use crate::msg::{self, MsgKind};
use crate::peer::{InboundFrame, PeerInfo};
use crate::peer_book::PeerBook;
use crate::syncer::{SyncPhase, SyncStatus};

pub struct WorkItem {
    pub info: Arc<PeerInfo>,
    pub frame: InboundFrame,
    pub queue_depth: Arc<AtomicUsize>,
}

pub struct PipelineContext<S> {
    pub chain: Arc<ChainState<S>>,
    pub pool: Arc<Mutex<TransactionPool>>,
    pub manager: Arc<ConnectionManager>,
    pub peer_book: Arc<PeerBook>,
    pub sync: Arc<SyncStatus>,
    pub magic: [u8; 2],
    pub ban_secs: u64,
    /// Blocks whose previous block has not been applied yet, keyed by the
    /// missing parent hash.
    pub orphans: Mutex<HashMap<Hash, Block>>,
}

impl<S: KeyValueStore> PipelineContext<S> {
    fn local_tip(&self) -> (u64, u64) {
        let tip = self.chain.tip_info();
        (tip.confirmed_difficulty, tip.confirmed_height)
    }

    fn reply(&self, info: &PeerInfo, kind: MsgKind, payload: &[u8]) {
        let frame = msg::frame(self.magic, kind, payload);
        self.manager.send_to_peer(info.id, frame);
    }

    fn ban(&self, info: &PeerInfo, reason: &str) {
        self.peer_book.ban(info.addr, self.ban_secs);
        self.manager.ban_connection(info.id, reason);
    }
}

/// Spawns the worker pool; each worker drains the shared channel until it
/// closes.
pub fn spawn_workers<S: KeyValueStore + 'static>(
    ctx: Arc<PipelineContext<S>>,
    receiver: Receiver<WorkItem>,
    workers: usize,
) -> Vec<std::thread::JoinHandle<()>> {
    (0..workers.max(1))
        .map(|index| {
            let ctx = Arc::clone(&ctx);
            let receiver = receiver.clone();
            std::thread::Builder::new()
                .name(format!("pipeline-{index}"))
                .spawn(move || {
                    while let Ok(item) = receiver.recv() {
                        if ctx.manager.is_terminated() {
                            break;
                        }
                        item.queue_depth.fetch_sub(1, Ordering::Relaxed);
                        handle_item(&ctx, item);
                    }
                })
                .expect("spawn pipeline worker")
        })
        .collect()
}

/// Entry point used by reader tasks; enqueues and enforces the per
/// connection bound.
pub fn submit(
    sender: &Sender<WorkItem>,
    item: WorkItem,
    queue_bound: usize,
    manager: &ConnectionManager,
) {
    let depth = item.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
    if depth > queue_bound {
        log_warn!(
            "connection {} is slow ({} queued messages); disconnecting",
            item.info.id,
            depth
        );
        manager.ban_connection(item.info.id, "pipeline queue overflow");
        return;
    }
    let _ = sender.send(item);
}

pub fn handle_item<S: KeyValueStore>(ctx: &PipelineContext<S>, item: WorkItem) {
    item.info.touch();
    match item.frame {
        InboundFrame::Message(kind, payload) => {
            if let Err(reason) = dispatch(ctx, &item.info, kind, &payload) {
                ctx.ban(&item.info, reason);
            }
        }
        InboundFrame::Archive {
            header_hash,
            height,
            path,
        } => {
            handle_archive(ctx, &item.info, header_hash, height, &path);
            let _ = std::fs::remove_file(&path);
        }
    }
}

fn dispatch<S: KeyValueStore>(
    ctx: &PipelineContext<S>,
    info: &PeerInfo,
    kind: MsgKind,
    payload: &[u8],
) -> Result<(), &'static str> {
    match kind {
        MsgKind::Hand | MsgKind::Shake => Err("handshake message after handshake"),
        MsgKind::Ping => {
            let (difficulty, height) =
                msg::parse_ping(payload).map_err(|_| "malformed ping")?;
            info.update_tip(difficulty, height);
            let (local_difficulty, local_height) = ctx.local_tip();
            ctx.reply(
                info,
                MsgKind::Pong,
                &msg::build_ping(local_difficulty, local_height),
            );
            Ok(())
        }
        MsgKind::Pong => {
            let (difficulty, height) =
                msg::parse_ping(payload).map_err(|_| "malformed pong")?;
            info.update_tip(difficulty, height);
            Ok(())
        }
        MsgKind::GetPeerAddrs => {
            let _capabilities =
                msg::parse_get_peer_addrs(payload).map_err(|_| "malformed getpeeraddrs")?;
            let addrs = ctx.peer_book.addresses(msg::MAX_PEER_ADDRS);
            ctx.reply(info, MsgKind::PeerAddrs, &msg::build_peer_addrs(&addrs));
            Ok(())
        }
        MsgKind::PeerAddrs => {
            let addrs = msg::parse_peer_addrs(payload).map_err(|_| "malformed peeraddrs")?;
            for addr in addrs {
                ctx.peer_book.add_address(addr);
            }
            Ok(())
        }
        MsgKind::GetHeaders => {
            let locator = msg::parse_get_headers(payload).map_err(|_| "malformed getheaders")?;
            let headers = ctx
                .chain
                .headers_from_locator(&locator, msg::MAX_HEADERS_PER_MSG)
                .unwrap_or_default();
            ctx.reply(info, MsgKind::Headers, &msg::build_headers(&headers));
            Ok(())
        }
        MsgKind::Headers => {
            let headers = msg::parse_headers(payload).map_err(|_| "malformed headers")?;
            handle_headers(ctx, info, &headers)
        }
        MsgKind::GetBlock => {
            let hash = msg::parse_get_block(payload).map_err(|_| "malformed getblock")?;
            if let Ok(Some(block)) = ctx.chain.block_by_hash(&hash) {
                ctx.reply(info, MsgKind::Block, &msg::build_block(&block));
            }
            Ok(())
        }
        MsgKind::Block => {
            let block = msg::parse_block(payload).map_err(|_| "malformed block")?;
            handle_block(ctx, info, block, true)
        }
        MsgKind::GetCompactBlock => {
            let hash = msg::parse_get_block(payload).map_err(|_| "malformed getcompactblock")?;
            if let Ok(Some(block)) = ctx.chain.block_by_hash(&hash) {
                let nonce = rand::thread_rng().gen();
                let compact = CompactBlock::from_block(&block, nonce);
                ctx.reply(
                    info,
                    MsgKind::CompactBlock,
                    &msg::build_compact_block(&compact),
                );
            }
            Ok(())
        }
        MsgKind::CompactBlock => {
            let compact =
                msg::parse_compact_block(payload).map_err(|_| "malformed compact block")?;
            let hydrated = {
                let pool = ctx.pool.lock().expect("pool lock");
                pool.hydrate(&compact)
            };
            match hydrated {
                Ok(block) => handle_block(ctx, info, block, true),
                Err(missing) => {
                    // Transactions missing: fall back to the full block.
                    log_debug!(
                        "compact block {} missing {} short id(s); requesting full block",
                        short_hash(&compact.hash()),
                        missing.len()
                    );
                    ctx.reply(info, MsgKind::GetBlock, &msg::build_get_block(&compact.hash()));
                    Ok(())
                }
            }
        }
        MsgKind::Transaction => {
            let tx = msg::parse_transaction(payload).map_err(|_| "malformed transaction")?;
            let verdict = {
                let mut pool = ctx.pool.lock().expect("pool lock");
                pool.insert(tx)
            };
            match verdict {
                Ok(()) => {
                    ctx.manager
                        .broadcast(msg::frame(ctx.magic, MsgKind::Transaction, payload), info.id);
                    Ok(())
                }
                Err(PoolError::AlreadyInPool)
                | Err(PoolError::Conflict)
                | Err(PoolError::PoolFull) => Ok(()),
                Err(_) => Err("invalid transaction"),
            }
        }
        MsgKind::TxHashSetRequest => {
            let (_hash, _height) =
                msg::parse_txhashset_request(payload).map_err(|_| "malformed txhashset request")?;
            serve_txhashset(ctx, info);
            Ok(())
        }
        MsgKind::TxHashSetArchive => unreachable!("archives spool in the reader"),
    }
}

fn handle_headers<S: KeyValueStore>(
    ctx: &PipelineContext<S>,
    info: &PeerInfo,
    headers: &[mwd_primitives::block::BlockHeader],
) -> Result<(), &'static str> {
    let status = if headers.len() == 1 {
        ctx.chain.process_single_header(&headers[0])
    } else {
        ctx.chain.process_sync_headers(headers)
    };
    match status {
        Ok(ChainStatus::Success) => {
            if headers.len() == 1 {
                // Gossip the fresh header onward.
                ctx.manager.broadcast(
                    msg::frame(ctx.magic, MsgKind::Headers, &msg::build_headers(headers)),
                    info.id,
                );
            }
            Ok(())
        }
        Ok(ChainStatus::AlreadyExists) => Ok(()),
        Ok(ChainStatus::Orphaned) => {
            // Walk back: ask the peer to fill the gap from our locator.
            let locator = ctx.chain.locator();
            ctx.reply(info, MsgKind::GetHeaders, &msg::build_get_headers(&locator));
            Ok(())
        }
        Ok(ChainStatus::Invalid(reason)) => Err(reason),
        Ok(ChainStatus::TransactionsMissing) => Ok(()),
        Err(err) => {
            log_warn!("header processing store error: {err}");
            Ok(())
        }
    }
}

fn handle_block<S: KeyValueStore>(
    ctx: &PipelineContext<S>,
    info: &PeerInfo,
    block: Block,
    relay: bool,
) -> Result<(), &'static str> {
    let hash = block.hash();
    match ctx.chain.process_block(&block) {
        Ok(ChainStatus::Success) => {
            {
                let mut pool = ctx.pool.lock().expect("pool lock");
                pool.reconcile_block(&block);
            }
            if relay {
                ctx.manager.broadcast(
                    msg::frame(ctx.magic, MsgKind::Block, &msg::build_block(&block)),
                    info.id,
                );
            }
            retry_orphans(ctx, info, hash);
            Ok(())
        }
        Ok(ChainStatus::AlreadyExists) => Ok(()),
        Ok(ChainStatus::Orphaned) => {
            // Hold the block for its parent and chase the gap.
            let parent = block.header.prev_hash;
            {
                let mut orphans = ctx.orphans.lock().expect("orphans lock");
                orphans.insert(parent, block);
            }
            if !ctx.chain.has_header(&parent) {
                let locator = ctx.chain.locator();
                ctx.reply(info, MsgKind::GetHeaders, &msg::build_get_headers(&locator));
            } else {
                ctx.reply(info, MsgKind::GetBlock, &msg::build_get_block(&parent));
            }
            Ok(())
        }
        Ok(ChainStatus::Invalid(reason)) => Err(reason),
        Ok(ChainStatus::TransactionsMissing) => Ok(()),
        Err(err) => {
            log_warn!("block processing store error: {err}");
            Ok(())
        }
    }
}

/// After a block lands, retry any orphan waiting on it (and cascade).
fn retry_orphans<S: KeyValueStore>(ctx: &PipelineContext<S>, info: &PeerInfo, mut parent: Hash) {
    loop {
        let next = {
            let mut orphans = ctx.orphans.lock().expect("orphans lock");
            orphans.remove(&parent)
        };
        let Some(block) = next else {
            break;
        };
        let hash = block.hash();
        match ctx.chain.process_block(&block) {
            Ok(ChainStatus::Success) => {
                let mut pool = ctx.pool.lock().expect("pool lock");
                pool.reconcile_block(&block);
                drop(pool);
                parent = hash;
            }
            Ok(ChainStatus::Invalid(reason)) => {
                ctx.ban(info, reason);
                break;
            }
            _ => break,
        }
    }
}

fn handle_archive<S: KeyValueStore>(
    ctx: &PipelineContext<S>,
    info: &PeerInfo,
    header_hash: Hash,
    height: u64,
    path: &std::path::Path,
) {
    if !ctx.sync.expecting_txhashset_from(info.id) {
        log_debug!(
            "unsolicited txhashset archive from connection {}; dropped",
            info.id
        );
        return;
    }
    ctx.sync.set_phase(SyncPhase::ProcessingTxHashSet);
    match ctx.chain.process_txhashset(header_hash, path) {
        Ok(ChainStatus::Success) => {
            log_debug!(
                "txhashset archive for height {height} applied ({})",
                short_hash(&header_hash)
            );
            ctx.sync.txhashset_done(true);
        }
        Ok(status) => {
            let reason = match status {
                ChainStatus::Invalid(reason) => reason,
                _ => "txhashset archive not applicable",
            };
            ctx.ban(info, reason);
            ctx.sync.txhashset_done(false);
        }
        Err(err) => {
            log_warn!("txhashset processing store error: {err}");
            ctx.sync.txhashset_done(false);
        }
    }
}

/// Packs and ships the confirmed txhashset to a requesting peer.
fn serve_txhashset<S: KeyValueStore>(ctx: &PipelineContext<S>, info: &PeerInfo) {
    let staging = std::env::temp_dir().join(format!("mwd_snapshot_{}.bundle", info.id));
    let (head_hash, head_height) = match ctx.chain.write_txhashset_snapshot(&staging) {
        Ok(head) => head,
        Err(err) => {
            log_warn!("snapshot write failed: {err}");
            return;
        }
    };
    let data = match std::fs::read(&staging) {
        Ok(data) => data,
        Err(err) => {
            log_warn!("snapshot read failed: {err}");
            let _ = std::fs::remove_file(&staging);
            return;
        }
    };
    let _ = std::fs::remove_file(&staging);

    let mut payload =
        msg::build_txhashset_archive_prefix(&head_hash, head_height, data.len() as u64);
    payload.extend_from_slice(&data);
    ctx.reply(info, MsgKind::TxHashSetArchive, &payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mwd_consensus::{chain_params, Network};
    use mwd_storage::memory::MemoryStore;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    fn test_ctx() -> (Arc<PipelineContext<MemoryStore>>, tempfile::TempDir) {
        let params = chain_params(Network::Regtest);
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = Arc::new(
            ChainState::open(params.clone(), Arc::new(MemoryStore::new()), dir.path())
                .expect("chain state"),
        );
        let ctx = PipelineContext {
            chain,
            pool: Arc::new(Mutex::new(TransactionPool::new(1_000))),
            manager: Arc::new(ConnectionManager::new(8)),
            peer_book: Arc::new(PeerBook::in_memory()),
            sync: Arc::new(SyncStatus::new()),
            magic: params.magic,
            ban_secs: 3_600,
            orphans: Mutex::new(HashMap::new()),
        };
        (Arc::new(ctx), dir)
    }

    fn register_peer(
        ctx: &PipelineContext<MemoryStore>,
    ) -> (Arc<PeerInfo>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let id = ctx.manager.next_conn_id();
        let addr: SocketAddr = format!("127.0.0.1:{}", 20_000 + id).parse().unwrap();
        let info = Arc::new(PeerInfo::new(id, addr, false));
        let (tx, rx) = mpsc::unbounded_channel();
        ctx.manager.add_connection(crate::conn_manager::Connection::new(
            Arc::clone(&info),
            tx,
            Arc::new(AtomicBool::new(false)),
        ));
        (info, rx)
    }

    #[test]
    fn ping_updates_peer_and_replies_pong() {
        let (ctx, _dir) = test_ctx();
        let (info, mut rx) = register_peer(&ctx);

        dispatch(&ctx, &info, MsgKind::Ping, &msg::build_ping(77, 9)).unwrap();
        assert_eq!(info.total_difficulty(), 77);
        assert_eq!(info.height(), 9);

        let frame = rx.try_recv().expect("pong queued");
        assert_eq!(frame[2], MsgKind::Pong as u8);
    }

    #[test]
    fn invalid_header_gets_the_peer_banned() {
        let (ctx, _dir) = test_ctx();
        let (info, _rx) = register_peer(&ctx);

        let mut header = chain_params(Network::Regtest).genesis.clone();
        header.height = 1;
        header.prev_hash = chain_params(Network::Regtest).genesis_hash();
        header.total_difficulty = 999; // retarget mismatch
        let payload = msg::build_headers(&[header]);

        let item = WorkItem {
            info: Arc::clone(&info),
            frame: InboundFrame::Message(MsgKind::Headers, payload),
            queue_depth: Arc::new(AtomicUsize::new(1)),
        };
        handle_item(&ctx, item);
        assert!(ctx.manager.is_marked_for_ban(info.id));
        assert!(ctx.peer_book.is_banned(info.addr));
    }

    #[test]
    fn slow_connection_is_disconnected() {
        let (ctx, _dir) = test_ctx();
        let (info, _rx) = register_peer(&ctx);
        let (sender, _receiver) = crossbeam_channel::unbounded();
        let depth = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            submit(
                &sender,
                WorkItem {
                    info: Arc::clone(&info),
                    frame: InboundFrame::Message(MsgKind::Ping, msg::build_ping(1, 1)),
                    queue_depth: Arc::clone(&depth),
                },
                3,
                &ctx.manager,
            );
        }
        assert!(ctx.manager.is_marked_for_ban(info.id));
    }

    #[test]
    fn unsolicited_archive_is_dropped() {
        let (ctx, dir) = test_ctx();
        let (info, _rx) = register_peer(&ctx);
        let path = dir.path().join("archive.bundle");
        std::fs::write(&path, b"junk").unwrap();

        handle_archive(&ctx, &info, [9u8; 32], 5, &path);
        assert!(!ctx.manager.is_marked_for_ban(info.id));
        assert_eq!(ctx.sync.phase(), SyncPhase::WaitingForPeers);
    }
}
