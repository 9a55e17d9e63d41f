//! One connected peer: handshake, framed I/O, and the shared read-mostly
//! stats record the rest of the node steers by.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use mwd_primitives::hash::Hash;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::msg::{
    self, HandshakeInfo, MsgKind, FRAME_HEADER_LEN, MAX_ARCHIVE_SIZE, MAX_PAYLOAD_SIZE,
};

const HANDSHAKE_TIMEOUT_SECS: u64 = 20;
const SEND_TIMEOUT_SECS: u64 = 20;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared per-peer record. Connections own the socket; everything else
/// reads these counters.
pub struct PeerInfo {
    pub id: u64,
    pub addr: SocketAddr,
    pub inbound: bool,
    height: AtomicU64,
    total_difficulty: AtomicU64,
    last_seen_ms: AtomicU64,
    banned: AtomicBool,
    user_agent: Mutex<String>,
}

impl PeerInfo {
    pub fn new(id: u64, addr: SocketAddr, inbound: bool) -> Self {
        Self {
            id,
            addr,
            inbound,
            height: AtomicU64::new(0),
            total_difficulty: AtomicU64::new(0),
            last_seen_ms: AtomicU64::new(now_ms()),
            banned: AtomicBool::new(false),
            user_agent: Mutex::new(String::new()),
        }
    }

    pub fn update_tip(&self, total_difficulty: u64, height: u64) {
        self.total_difficulty
            .store(total_difficulty, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
        self.touch();
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn total_difficulty(&self) -> u64 {
        self.total_difficulty.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    pub fn ban(&self) {
        self.banned.store(true, Ordering::Relaxed);
    }

    pub fn is_banned(&self) -> bool {
        self.banned.load(Ordering::Relaxed)
    }

    pub fn set_user_agent(&self, agent: String) {
        if let Ok(mut guard) = self.user_agent.lock() {
            *guard = agent;
        }
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

/// A frame read off the wire. Archives spool to disk while being received
/// instead of buffering in memory.
#[derive(Debug)]
pub enum InboundFrame {
    Message(MsgKind, Vec<u8>),
    Archive {
        header_hash: Hash,
        height: u64,
        path: PathBuf,
    },
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), String> {
    timeout(
        Duration::from_secs(SEND_TIMEOUT_SECS),
        writer.write_all(bytes),
    )
    .await
    .map_err(|_| "peer write timed out".to_string())?
    .map_err(|err| err.to_string())
}

async fn read_frame_header<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 2],
) -> Result<(MsgKind, u64), String> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|err| err.to_string())?;
    if header[..2] != magic {
        return Err("invalid message magic".to_string());
    }
    let kind = MsgKind::from_u8(header[2]).ok_or("unknown message kind".to_string())?;
    let len = u64::from_be_bytes(header[3..11].try_into().expect("frame length slice"));
    Ok((kind, len))
}

async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, len: u64) -> Result<Vec<u8>, String> {
    if len > MAX_PAYLOAD_SIZE {
        return Err("payload exceeds maximum size".to_string());
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| err.to_string())?;
    Ok(payload)
}

/// Reads one frame; a txhashset archive payload is streamed into a file
/// under `archive_dir`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 2],
    archive_dir: &Path,
) -> Result<InboundFrame, String> {
    let (kind, len) = read_frame_header(reader, magic).await?;
    if kind == MsgKind::TxHashSetArchive {
        return read_archive(reader, len, archive_dir).await;
    }
    let payload = read_payload(reader, len).await?;
    Ok(InboundFrame::Message(kind, payload))
}

async fn read_archive<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u64,
    archive_dir: &Path,
) -> Result<InboundFrame, String> {
    if len < 48 || len > MAX_ARCHIVE_SIZE {
        return Err("archive payload size out of range".to_string());
    }
    let mut prefix = [0u8; 48];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|err| err.to_string())?;
    let (header_hash, height, data_len) =
        msg::parse_txhashset_archive_prefix(&prefix).map_err(|err| err.to_string())?;
    if data_len != len - 48 {
        return Err("archive length prefix disagrees with frame".to_string());
    }

    std::fs::create_dir_all(archive_dir).map_err(|err| err.to_string())?;
    let path = archive_dir.join(format!(
        "txhashset_{}.bundle",
        mwd_primitives::hash::short_hash(&header_hash)
    ));
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|err| err.to_string())?;
    let mut remaining = data_len;
    let mut buffer = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let chunk = remaining.min(buffer.len() as u64) as usize;
        reader
            .read_exact(&mut buffer[..chunk])
            .await
            .map_err(|err| err.to_string())?;
        file.write_all(&buffer[..chunk])
            .await
            .map_err(|err| err.to_string())?;
        remaining -= chunk as u64;
    }
    file.sync_all().await.map_err(|err| err.to_string())?;
    Ok(InboundFrame::Archive {
        header_hash,
        height,
        path,
    })
}

/// Pre-registration wrapper around a fresh socket; performs the handshake
/// and then splits into reader and writer halves.
pub struct PeerStream {
    stream: TcpStream,
    magic: [u8; 2],
}

impl PeerStream {
    pub fn new(stream: TcpStream, magic: [u8; 2]) -> Self {
        Self { stream, magic }
    }

    /// Initiator side: send `Hand`, expect `Shake`, enforce the genesis
    /// check.
    pub async fn handshake_outbound(
        &mut self,
        local: &HandshakeInfo,
    ) -> Result<HandshakeInfo, String> {
        let hand = msg::frame(self.magic, MsgKind::Hand, &msg::build_hand(local));
        write_frame(&mut self.stream, &hand).await?;

        let (kind, payload) = timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            read_handshake_frame(&mut self.stream, self.magic),
        )
        .await
        .map_err(|_| "handshake timed out".to_string())??;
        if kind != MsgKind::Shake {
            return Err("expected shake".to_string());
        }
        let remote = msg::parse_shake(&payload).map_err(|err| err.to_string())?;
        if remote.genesis != local.genesis {
            return Err("peer is on a different chain".to_string());
        }
        Ok(remote)
    }

    /// Responder side: expect `Hand`, reply `Shake`. Rejects self-connects
    /// by nonce.
    pub async fn handshake_inbound(
        &mut self,
        local: &HandshakeInfo,
    ) -> Result<HandshakeInfo, String> {
        let (kind, payload) = timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            read_handshake_frame(&mut self.stream, self.magic),
        )
        .await
        .map_err(|_| "handshake timed out".to_string())??;
        if kind != MsgKind::Hand {
            return Err("expected hand".to_string());
        }
        let remote = msg::parse_hand(&payload).map_err(|err| err.to_string())?;
        if remote.genesis != local.genesis {
            return Err("peer is on a different chain".to_string());
        }
        if remote.nonce == local.nonce {
            return Err("connected to self".to_string());
        }
        let shake = msg::frame(self.magic, MsgKind::Shake, &msg::build_shake(local));
        write_frame(&mut self.stream, &shake).await?;
        Ok(remote)
    }

    pub fn into_split(
        self,
    ) -> (
        tokio::net::tcp::OwnedReadHalf,
        tokio::net::tcp::OwnedWriteHalf,
    ) {
        self.stream.into_split()
    }
}

async fn read_handshake_frame(
    stream: &mut TcpStream,
    magic: [u8; 2],
) -> Result<(MsgKind, Vec<u8>), String> {
    let (kind, len) = read_frame_header(stream, magic).await?;
    let payload = read_payload(stream, len).await?;
    Ok((kind, payload))
}
