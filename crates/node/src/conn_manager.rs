//! Owns the live connections: dispatch targets, the broadcast queue and its
//! worker, banning, and the periodic prune/ping pass.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use mwd_log::{log_debug, log_info, log_warn};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::mpsc;

use crate::msg::{self, MsgKind};
use crate::peer::{now_ms, PeerInfo};
use crate::peer_book::PeerBook;

/// Handle to one live peer connection. The socket lives in the reader and
/// writer tasks; this handle carries the outbox and the shared stats.
#[derive(Clone)]
pub struct Connection {
    pub info: Arc<PeerInfo>,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    pub queue_depth: Arc<AtomicUsize>,
}

impl Connection {
    pub fn new(
        info: Arc<PeerInfo>,
        outbox: mpsc::UnboundedSender<Vec<u8>>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            info,
            outbox,
            closed,
            queue_depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn send(&self, frame: Vec<u8>) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.outbox.send(frame).is_ok()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && !self.outbox.is_closed()
    }
}

pub struct ConnectionManager {
    connections: RwLock<Vec<Connection>>,
    broadcast_queue: Mutex<VecDeque<(u64, Vec<u8>)>>,
    broadcast_cond: Condvar,
    to_ban: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    fanout: usize,
    terminate: AtomicBool,
}

impl ConnectionManager {
    pub fn new(fanout: usize) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            broadcast_queue: Mutex::new(VecDeque::new()),
            broadcast_cond: Condvar::new(),
            to_ban: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            fanout,
            terminate: AtomicBool::new(false),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_connection(&self, connection: Connection) {
        let mut connections = self.connections.write().expect("connections lock");
        connections.push(connection);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().expect("connections lock").len()
    }

    /// Marks a connection for removal on the next prune pass.
    pub fn ban_connection(&self, id: u64, reason: &str) {
        let connections = self.connections.read().expect("connections lock");
        if let Some(connection) = connections.iter().find(|conn| conn.id() == id) {
            connection.info.ban();
            log_warn!(
                "banning peer {} at {}: {reason}",
                id,
                connection.info.addr
            );
        }
        drop(connections);
        self.to_ban.lock().expect("ban lock").insert(id);
    }

    pub fn is_marked_for_ban(&self, id: u64) -> bool {
        self.to_ban.lock().expect("ban lock").contains(&id)
    }

    /// Most-work peer: max total difficulty, then max height, then uniform
    /// random among the remaining ties. Peers with no known height are
    /// excluded so a silent peer never wins.
    pub fn most_work_peer(&self) -> Option<Connection> {
        let connections = self.connections.read().expect("connections lock");
        let mut best: Vec<&Connection> = Vec::new();
        let mut best_difficulty = 0u64;
        let mut best_height = 0u64;
        for connection in connections.iter() {
            if !connection.is_alive() || connection.info.is_banned() {
                continue;
            }
            let height = connection.info.height();
            if height == 0 {
                continue;
            }
            let difficulty = connection.info.total_difficulty();
            if difficulty > best_difficulty {
                best_difficulty = difficulty;
                best_height = height;
                best.clear();
                best.push(connection);
            } else if difficulty == best_difficulty {
                if height > best_height {
                    best_height = height;
                    best.clear();
                    best.push(connection);
                } else if height == best_height {
                    best.push(connection);
                }
            }
        }
        if best.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..best.len());
        Some(best[index].clone())
    }

    pub fn most_work_tip(&self) -> Option<(u64, u64)> {
        self.most_work_peer()
            .map(|connection| (connection.info.total_difficulty(), connection.info.height()))
    }

    pub fn send_to_most_work_peer(&self, frame: Vec<u8>) -> Option<u64> {
        let connection = self.most_work_peer()?;
        if connection.send(frame) {
            Some(connection.id())
        } else {
            None
        }
    }

    pub fn connected_addrs(&self) -> Vec<std::net::SocketAddr> {
        let connections = self.connections.read().expect("connections lock");
        connections
            .iter()
            .filter(|connection| connection.is_alive())
            .map(|connection| connection.info.addr)
            .collect()
    }

    pub fn peer_addr(&self, id: u64) -> Option<std::net::SocketAddr> {
        let connections = self.connections.read().expect("connections lock");
        connections
            .iter()
            .find(|connection| connection.id() == id)
            .map(|connection| connection.info.addr)
    }

    pub fn send_to_peer(&self, id: u64, frame: Vec<u8>) -> bool {
        let connections = self.connections.read().expect("connections lock");
        connections
            .iter()
            .find(|connection| connection.id() == id)
            .map(|connection| connection.send(frame))
            .unwrap_or(false)
    }

    /// Enqueues a message for the broadcast worker; the source is excluded
    /// from delivery to prevent echo.
    pub fn broadcast(&self, frame: Vec<u8>, source_id: u64) {
        let mut queue = self.broadcast_queue.lock().expect("broadcast lock");
        queue.push_back((source_id, frame));
        self.broadcast_cond.notify_one();
    }

    /// Broadcast worker body: drains the queue and forwards each message to
    /// at most `fanout` randomly chosen peers, never the source.
    pub fn run_broadcast_worker(&self) {
        loop {
            let entry = {
                let mut queue = self.broadcast_queue.lock().expect("broadcast lock");
                loop {
                    if self.terminate.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Some(entry) = queue.pop_front() {
                        break Some(entry);
                    }
                    let (guard, _) = self
                        .broadcast_cond
                        .wait_timeout(queue, Duration::from_millis(200))
                        .expect("broadcast wait");
                    queue = guard;
                }
            };
            let Some((source_id, frame)) = entry else {
                return;
            };

            let targets: Vec<Connection> = {
                let connections = self.connections.read().expect("connections lock");
                let eligible: Vec<&Connection> = connections
                    .iter()
                    .filter(|connection| {
                        connection.id() != source_id
                            && connection.is_alive()
                            && !connection.info.is_banned()
                    })
                    .collect();
                eligible
                    .choose_multiple(&mut rand::thread_rng(), self.fanout)
                    .map(|connection| (*connection).clone())
                    .collect()
            };
            for connection in targets {
                connection.send(frame.clone());
            }
        }
    }

    /// Closes banned, dead and (optionally only) inactive connections, and
    /// pings the survivors with the local tip. The peer book records every
    /// disconnect.
    pub fn prune_connections(
        &self,
        inactive_only: bool,
        local_tip: (u64, u64),
        inactivity_ms: u64,
        magic: [u8; 2],
        peer_book: &PeerBook,
    ) {
        let mut to_close: Vec<Connection> = Vec::new();
        {
            let mut connections = self.connections.write().expect("connections lock");
            let bans = self.to_ban.lock().expect("ban lock");
            let now = now_ms();
            connections.retain(|connection| {
                let idle = now.saturating_sub(connection.info.last_seen_ms());
                let dead = !connection.is_alive();
                let banned = bans.contains(&connection.id()) || connection.info.is_banned();
                let inactive = idle > inactivity_ms;
                if banned || dead || inactive || !inactive_only {
                    to_close.push(connection.clone());
                    false
                } else {
                    true
                }
            });
            drop(bans);

            if inactive_only {
                let ping = msg::frame(magic, MsgKind::Ping, &msg::build_ping(local_tip.0, local_tip.1));
                for connection in connections.iter() {
                    connection.send(ping.clone());
                }
            }
        }

        for connection in &to_close {
            connection.close();
            peer_book.record_disconnect(connection.info.addr);
            log_debug!(
                "closed connection {} to {}",
                connection.id(),
                connection.info.addr
            );
        }
        if !to_close.is_empty() {
            log_info!("pruned {} connection(s)", to_close.len());
        }
        let mut bans = self.to_ban.lock().expect("ban lock");
        for connection in &to_close {
            bans.remove(&connection.id());
        }
    }

    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::Relaxed);
        self.broadcast_cond.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn fake_connection(
        manager: &ConnectionManager,
        difficulty: u64,
        height: u64,
    ) -> (Connection, mpsc::UnboundedReceiver<Vec<u8>>) {
        let id = manager.next_conn_id();
        let addr: SocketAddr = format!("127.0.0.1:{}", 10_000 + id).parse().unwrap();
        let info = Arc::new(PeerInfo::new(id, addr, false));
        info.update_tip(difficulty, height);
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(info, tx, Arc::new(AtomicBool::new(false)));
        manager.add_connection(connection.clone());
        (connection, rx)
    }

    #[test]
    fn most_work_prefers_difficulty_then_height() {
        let manager = ConnectionManager::new(8);
        let (low, _rx_low) = fake_connection(&manager, 90, 2_000);
        let (_mid, _rx_mid) = fake_connection(&manager, 100, 1_000);
        let (high, _rx_high) = fake_connection(&manager, 100, 1_001);

        for _ in 0..50 {
            let chosen = manager.most_work_peer().unwrap();
            assert_eq!(chosen.id(), high.id());
        }
        assert_ne!(low.id(), high.id());
    }

    #[test]
    fn most_work_ignores_heightless_peers() {
        let manager = ConnectionManager::new(8);
        let (_silent, _rx) = fake_connection(&manager, 1_000, 0);
        assert!(manager.most_work_peer().is_none());
    }

    #[test]
    fn most_work_tie_break_is_roughly_uniform() {
        let manager = ConnectionManager::new(8);
        let (_a, _rx_a) = fake_connection(&manager, 100, 1_000);
        let (b, _rx_b) = fake_connection(&manager, 100, 1_001);
        let (c, _rx_c) = fake_connection(&manager, 100, 1_001);

        let mut picked_b = 0u32;
        for _ in 0..1_000 {
            let chosen = manager.most_work_peer().unwrap();
            assert!(chosen.id() == b.id() || chosen.id() == c.id());
            if chosen.id() == b.id() {
                picked_b += 1;
            }
        }
        assert!((450..=550).contains(&picked_b), "picked_b = {picked_b}");
    }

    #[test]
    fn banned_connection_is_closed_by_prune() {
        let manager = ConnectionManager::new(8);
        let book = PeerBook::in_memory();
        let (bad, mut rx_bad) = fake_connection(&manager, 100, 10);
        let (good, _rx_good) = fake_connection(&manager, 100, 10);

        manager.ban_connection(bad.id(), "invalid proof of work");
        assert!(manager.is_marked_for_ban(bad.id()));

        manager.prune_connections(true, (5, 5), 60_000, [0x52, 0x57], &book);
        assert_eq!(manager.connection_count(), 1);
        assert!(!bad.is_alive());
        assert!(good.is_alive());
        // The survivor got the ping carrying our tip.
        assert!(manager.send_to_peer(good.id(), b"x".to_vec()));
        // The banned peer's receiver sees a closed channel after drain.
        rx_bad.close();
    }

    #[test]
    fn broadcast_excludes_source_and_caps_fanout() {
        let manager = ConnectionManager::new(2);
        let (source, mut rx_source) = fake_connection(&manager, 1, 1);
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (_conn, rx) = fake_connection(&manager, 1, 1);
            receivers.push(rx);
        }

        manager.broadcast(b"gossip".to_vec(), source.id());
        // Run one drain pass on a helper thread, then stop the worker.
        let manager = Arc::new(manager);
        let worker = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.run_broadcast_worker())
        };
        std::thread::sleep(Duration::from_millis(300));
        manager.terminate();
        worker.join().unwrap();

        assert!(rx_source.try_recv().is_err());
        let mut delivered = 0;
        for rx in receivers.iter_mut() {
            if rx.try_recv().is_ok() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 2);
    }
}
