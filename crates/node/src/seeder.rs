//! Connection establishment: dials seeds and peer-book addresses to keep a
//! minimum of outbound peers, accepts inbound connections up to the cap,
//! and wires every accepted socket into the reader/writer tasks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use mwd_chainstate::ChainState;
use mwd_log::{log_debug, log_info, log_warn};
use mwd_primitives::hash::Hash;
use mwd_storage::KeyValueStore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::conn_manager::{Connection, ConnectionManager};
use crate::msg::HandshakeInfo;
use crate::peer::{self, PeerInfo, PeerStream};
use crate::peer_book::PeerBook;
use crate::pipeline::{self, WorkItem};

const CONNECT_TIMEOUT_SECS: u64 = 5;
const READ_IDLE_TIMEOUT_SECS: u64 = 300;
const DIAL_INTERVAL_SECS: u64 = 10;

pub struct SeederContext<S> {
    pub chain: Arc<ChainState<S>>,
    pub manager: Arc<ConnectionManager>,
    pub peer_book: Arc<PeerBook>,
    pub pipeline_tx: Sender<WorkItem>,
    pub magic: [u8; 2],
    pub genesis: Hash,
    pub protocol_version: u32,
    pub node_nonce: u64,
    pub user_agent: String,
    pub archive_dir: PathBuf,
    pub queue_bound: usize,
    pub max_connections: usize,
    pub min_outbound: usize,
    pub seeds: Vec<SocketAddr>,
    pub terminate: Arc<AtomicBool>,
}

impl<S: KeyValueStore> SeederContext<S> {
    fn local_handshake(&self) -> HandshakeInfo {
        let tip = self.chain.tip_info();
        HandshakeInfo {
            version: self.protocol_version,
            capabilities: 1,
            nonce: self.node_nonce,
            total_difficulty: tip.confirmed_difficulty,
            height: tip.confirmed_height,
            genesis: self.genesis,
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Accept loop for inbound peers.
pub async fn run_listener<S: KeyValueStore + 'static>(
    ctx: Arc<SeederContext<S>>,
    listener: TcpListener,
) {
    if let Ok(addr) = listener.local_addr() {
        log_info!("listening for peers on {addr}");
    }
    loop {
        if ctx.terminate.load(Ordering::Relaxed) {
            return;
        }
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                log_warn!("accept failed: {err}");
                continue;
            }
        };
        if ctx.manager.connection_count() >= ctx.max_connections {
            log_debug!("refusing inbound peer {remote_addr}: at connection cap");
            drop(stream);
            continue;
        }
        if ctx.peer_book.is_banned(remote_addr) {
            log_debug!("refusing banned peer {remote_addr}");
            drop(stream);
            continue;
        }

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let mut peer_stream = PeerStream::new(stream, ctx.magic);
            match peer_stream.handshake_inbound(&ctx.local_handshake()).await {
                Ok(remote) => {
                    register_connection(&ctx, peer_stream, remote_addr, remote, true);
                }
                Err(err) => {
                    log_debug!("inbound handshake with {remote_addr} failed: {err}");
                }
            }
        });
    }
}

/// Dial loop keeping `min_outbound` outbound peers alive.
pub async fn run_dialer<S: KeyValueStore + 'static>(ctx: Arc<SeederContext<S>>) {
    loop {
        if ctx.terminate.load(Ordering::Relaxed) {
            return;
        }
        let connected = ctx.manager.connected_addrs();
        let outbound_deficit = ctx
            .min_outbound
            .saturating_sub(ctx.manager.connection_count());
        if outbound_deficit > 0 {
            let mut candidates = ctx.seeds.clone();
            candidates.extend(ctx.peer_book.addresses(32));
            candidates.retain(|addr| !connected.contains(addr) && !ctx.peer_book.is_banned(*addr));
            candidates.sort_unstable();
            candidates.dedup();
            for addr in candidates.into_iter().take(outbound_deficit) {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    dial(&ctx, addr).await;
                });
            }
        }
        tokio::time::sleep(Duration::from_secs(DIAL_INTERVAL_SECS)).await;
    }
}

async fn dial<S: KeyValueStore + 'static>(ctx: &Arc<SeederContext<S>>, addr: SocketAddr) {
    let stream = match timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        TcpStream::connect(addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            log_debug!("dial {addr} failed: {err}");
            ctx.peer_book.record_failure(addr);
            return;
        }
        Err(_) => {
            log_debug!("dial {addr} timed out");
            ctx.peer_book.record_failure(addr);
            return;
        }
    };
    let mut peer_stream = PeerStream::new(stream, ctx.magic);
    match peer_stream.handshake_outbound(&ctx.local_handshake()).await {
        Ok(remote) => {
            register_connection(ctx, peer_stream, addr, remote, false);
        }
        Err(err) => {
            log_debug!("outbound handshake with {addr} failed: {err}");
            ctx.peer_book.record_failure(addr);
        }
    }
}

/// Registers a handshaken socket with the manager and spawns its dedicated
/// reader and writer tasks.
pub fn register_connection<S: KeyValueStore + 'static>(
    ctx: &Arc<SeederContext<S>>,
    peer_stream: PeerStream,
    addr: SocketAddr,
    remote: HandshakeInfo,
    inbound: bool,
) {
    let id = ctx.manager.next_conn_id();
    let info = Arc::new(PeerInfo::new(id, addr, inbound));
    info.update_tip(remote.total_difficulty, remote.height);
    info.set_user_agent(remote.user_agent);

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let connection = Connection::new(Arc::clone(&info), outbox_tx, Arc::clone(&closed));
    let queue_depth = Arc::clone(&connection.queue_depth);
    ctx.manager.add_connection(connection);
    ctx.peer_book.record_connected(addr);
    log_info!(
        "peer {} connected ({}, height {}, {:?})",
        addr,
        if inbound { "inbound" } else { "outbound" },
        info.height(),
        info.user_agent()
    );

    let (read_half, write_half) = peer_stream.into_split();
    tokio::spawn(run_writer(write_half, outbox_rx, Arc::clone(&closed)));
    tokio::spawn(run_reader(
        read_half,
        Arc::clone(ctx),
        info,
        queue_depth,
        closed,
    ));
}

async fn run_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = outbox.recv().await {
        if closed.load(Ordering::Relaxed) {
            break;
        }
        if let Err(err) = peer::write_frame(&mut write_half, &frame).await {
            log_debug!("peer write failed: {err}");
            break;
        }
    }
    closed.store(true, Ordering::Relaxed);
}

async fn run_reader<S: KeyValueStore + 'static>(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    ctx: Arc<SeederContext<S>>,
    info: Arc<PeerInfo>,
    queue_depth: Arc<std::sync::atomic::AtomicUsize>,
    closed: Arc<AtomicBool>,
) {
    loop {
        if closed.load(Ordering::Relaxed) || ctx.terminate.load(Ordering::Relaxed) {
            break;
        }
        let frame = match timeout(
            Duration::from_secs(READ_IDLE_TIMEOUT_SECS),
            peer::read_frame(&mut read_half, ctx.magic, &ctx.archive_dir),
        )
        .await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                log_debug!("peer {} read failed: {err}", info.addr);
                break;
            }
            Err(_) => {
                log_debug!("peer {} idle too long", info.addr);
                break;
            }
        };
        pipeline::submit(
            &ctx.pipeline_tx,
            WorkItem {
                info: Arc::clone(&info),
                frame,
                queue_depth: Arc::clone(&queue_depth),
            },
            ctx.queue_bound,
            &ctx.manager,
        );
    }
    closed.store(true, Ordering::Relaxed);
}
