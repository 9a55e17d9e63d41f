//! Known peer addresses and the ban list, persisted as one JSON file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mwd_log::{log_debug, log_warn};
use serde::{Deserialize, Serialize};

const PEER_BOOK_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize)]
struct PeerBookFile {
    version: u32,
    peers: Vec<PeerFileEntry>,
    banned: Vec<BanFileEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
struct PeerFileEntry {
    addr: SocketAddr,
    last_seen_secs: u64,
    failures: u32,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanFileEntry {
    addr: SocketAddr,
    banned_until_secs: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct PeerRecord {
    last_seen_secs: u64,
    failures: u32,
}

#[derive(Default)]
struct PeerBookInner {
    known: HashMap<SocketAddr, PeerRecord>,
    banned: HashMap<SocketAddr, u64>,
}

pub struct PeerBook {
    path: Option<PathBuf>,
    inner: Mutex<PeerBookInner>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

impl PeerBook {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(PeerBookInner::default()),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut inner = PeerBookInner::default();
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<PeerBookFile>(&raw) {
                Ok(file) if file.version == PEER_BOOK_VERSION => {
                    for entry in file.peers {
                        inner.known.insert(
                            entry.addr,
                            PeerRecord {
                                last_seen_secs: entry.last_seen_secs,
                                failures: entry.failures,
                            },
                        );
                    }
                    let now = now_secs();
                    for entry in file.banned {
                        if entry.banned_until_secs > now {
                            inner.banned.insert(entry.addr, entry.banned_until_secs);
                        }
                    }
                }
                Ok(file) => {
                    log_warn!("peer book version {} not supported; starting empty", file.version);
                }
                Err(err) => {
                    log_warn!("peer book does not parse ({err}); starting empty");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                log_warn!("peer book unreadable ({err}); starting empty");
            }
        }
        Self {
            path: Some(path),
            inner: Mutex::new(inner),
        }
    }

    pub fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let inner = self.inner.lock().expect("peer book lock");
        let file = PeerBookFile {
            version: PEER_BOOK_VERSION,
            peers: inner
                .known
                .iter()
                .map(|(addr, record)| PeerFileEntry {
                    addr: *addr,
                    last_seen_secs: record.last_seen_secs,
                    failures: record.failures,
                })
                .collect(),
            banned: inner
                .banned
                .iter()
                .map(|(addr, until)| BanFileEntry {
                    addr: *addr,
                    banned_until_secs: *until,
                })
                .collect(),
        };
        drop(inner);
        match serde_json::to_string_pretty(&file) {
            Ok(raw) => {
                if let Err(err) = std::fs::write(path, raw) {
                    log_warn!("peer book save failed: {err}");
                }
            }
            Err(err) => log_warn!("peer book serialize failed: {err}"),
        }
    }

    pub fn add_address(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().expect("peer book lock");
        inner.known.entry(addr).or_default();
    }

    pub fn record_connected(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().expect("peer book lock");
        let record = inner.known.entry(addr).or_default();
        record.last_seen_secs = now_secs();
        record.failures = 0;
    }

    pub fn record_disconnect(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().expect("peer book lock");
        let record = inner.known.entry(addr).or_default();
        record.last_seen_secs = now_secs();
    }

    pub fn record_failure(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().expect("peer book lock");
        let record = inner.known.entry(addr).or_default();
        record.failures = record.failures.saturating_add(1);
    }

    pub fn ban(&self, addr: SocketAddr, secs: u64) {
        let until = now_secs().saturating_add(secs);
        let mut inner = self.inner.lock().expect("peer book lock");
        inner.banned.insert(addr, until);
        log_debug!("peer {addr} banned for {secs}s");
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        let mut inner = self.inner.lock().expect("peer book lock");
        match inner.banned.get(&addr).copied() {
            Some(until) if until > now_secs() => true,
            Some(_) => {
                inner.banned.remove(&addr);
                false
            }
            None => false,
        }
    }

    /// Dialable addresses, least-failing and most recently seen first.
    pub fn addresses(&self, limit: usize) -> Vec<SocketAddr> {
        let inner = self.inner.lock().expect("peer book lock");
        let now = now_secs();
        let mut entries: Vec<(SocketAddr, PeerRecord)> = inner
            .known
            .iter()
            .filter(|(addr, _)| match inner.banned.get(addr) {
                Some(until) => *until <= now,
                None => true,
            })
            .map(|(addr, record)| (*addr, *record))
            .collect();
        entries.sort_by(|a, b| {
            a.1.failures
                .cmp(&b.1.failures)
                .then(b.1.last_seen_secs.cmp(&a.1.last_seen_secs))
        });
        entries.truncate(limit);
        entries.into_iter().map(|(addr, _)| addr).collect()
    }

    pub fn known_count(&self) -> usize {
        self.inner.lock().expect("peer book lock").known.len()
    }
}
