use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use mwd_primitives::hash::Hash;

use crate::error::MmrError;

const STRIDE: u64 = 32;

/// Append-only log of 32-byte hashes with an in-memory tail.
///
/// Entries below `base` live on disk; the tail holds appends since the last
/// flush. `rewind` only moves the logical boundary, so `discard` can undo it
/// as long as no flush intervened.
pub struct HashFile {
    path: PathBuf,
    /// Entries physically on disk.
    disk_len: u64,
    /// Disk entries that are part of the current logical state.
    base: u64,
    tail: Vec<Hash>,
}

impl HashFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MmrError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let disk_bytes = match std::fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        if disk_bytes % STRIDE != 0 {
            return Err(MmrError::Corrupt("hash file length not a multiple of 32"));
        }
        let disk_len = disk_bytes / STRIDE;
        Ok(Self {
            path,
            disk_len,
            base: disk_len,
            tail: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.base + self.tail.len() as u64
    }

    pub fn append(&mut self, hash: Hash) {
        self.tail.push(hash);
    }

    pub fn get(&self, index: u64) -> Result<Hash, MmrError> {
        if index >= self.size() {
            return Err(MmrError::OutOfBounds(index));
        }
        if index >= self.base {
            return Ok(self.tail[(index - self.base) as usize]);
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(index * STRIDE))?;
        let mut hash = [0u8; 32];
        file.read_exact(&mut hash)?;
        Ok(hash)
    }

    /// Truncates the logical size to `size` without touching disk.
    pub fn rewind(&mut self, size: u64) -> Result<(), MmrError> {
        if size > self.size() {
            return Err(MmrError::OutOfBounds(size));
        }
        if size >= self.base {
            self.tail.truncate((size - self.base) as usize);
        } else {
            self.base = size;
            self.tail.clear();
        }
        Ok(())
    }

    /// Makes the current logical state durable. After a flush, a crash and
    /// reopen yields exactly this prefix.
    pub fn flush(&mut self) -> Result<(), MmrError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)?;
        if self.disk_len > self.base {
            file.set_len(self.base * STRIDE)?;
            self.disk_len = self.base;
        }
        if !self.tail.is_empty() {
            file.seek(SeekFrom::Start(self.base * STRIDE))?;
            for hash in &self.tail {
                file.write_all(hash)?;
            }
            self.base += self.tail.len() as u64;
            self.disk_len = self.base;
            self.tail.clear();
        }
        file.sync_data()?;
        Ok(())
    }

    /// Drops everything since the last flush, including rewinds.
    pub fn discard(&mut self) {
        self.tail.clear();
        self.base = self.disk_len;
    }

    /// Replaces the entire content; used by compaction. Flushes implicitly.
    pub fn replace_all(&mut self, hashes: &[Hash]) -> Result<(), MmrError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        for hash in hashes {
            file.write_all(hash)?;
        }
        file.sync_data()?;
        self.disk_len = hashes.len() as u64;
        self.base = self.disk_len;
        self.tail.clear();
        Ok(())
    }
}
