use std::path::Path;

use mwd_mmr::{HashFile, MmrError};
use mwd_primitives::hash::Hash;

/// Hash file of candidate-branch header hashes keyed by height: entry `h`
/// is the hash of the candidate header at height `h`.
pub struct HeaderChainFile {
    file: HashFile,
}

impl HeaderChainFile {
    pub fn open(dir: &Path) -> Result<Self, MmrError> {
        let file = HashFile::open(dir.join("headers").join("pmmr_hash.bin"))?;
        Ok(Self { file })
    }

    /// Number of header entries; equals candidate head height + 1.
    pub fn len(&self) -> u64 {
        self.file.size()
    }

    pub fn is_empty(&self) -> bool {
        self.file.size() == 0
    }

    pub fn get(&self, height: u64) -> Result<Hash, MmrError> {
        self.file.get(height)
    }

    pub fn append(&mut self, hash: Hash) {
        self.file.append(hash);
    }

    /// Truncates so the last retained entry is at `height`.
    pub fn rewind_to_height(&mut self, height: u64) -> Result<(), MmrError> {
        self.file.rewind(height + 1)
    }

    pub fn flush(&mut self) -> Result<(), MmrError> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_rewind_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut file = HeaderChainFile::open(dir.path()).unwrap();
            file.append([1u8; 32]);
            file.append([2u8; 32]);
            file.append([3u8; 32]);
            file.rewind_to_height(1).unwrap();
            file.flush().unwrap();
        }
        let file = HeaderChainFile::open(dir.path()).unwrap();
        assert_eq!(file.len(), 2);
        assert_eq!(file.get(1).unwrap(), [2u8; 32]);
    }
}
