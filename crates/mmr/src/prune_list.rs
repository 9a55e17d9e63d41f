use std::path::PathBuf;

use roaring::RoaringBitmap;

use crate::error::MmrError;
use crate::pos::family;

/// Tracks pruned MMR positions and derives the physical shift they cause.
///
/// `add` marks a leaf pruned and bubbles upward while the sibling is also
/// pruned. A position is *compacted* (physically removable) once its parent
/// is pruned too; the root of each maximal pruned subtree stays physical so
/// appends and proofs above it keep working.
#[derive(Clone)]
pub struct PruneList {
    path: Option<PathBuf>,
    pruned: RoaringBitmap,
    compacted: RoaringBitmap,
}

impl PruneList {
    pub fn empty() -> Self {
        Self {
            path: None,
            pruned: RoaringBitmap::new(),
            compacted: RoaringBitmap::new(),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MmrError> {
        let path = path.into();
        let pruned = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => RoaringBitmap::new(),
            Ok(bytes) => RoaringBitmap::deserialize_from(&bytes[..])
                .map_err(|_| MmrError::Corrupt("prune list bitmap does not parse"))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RoaringBitmap::new(),
            Err(err) => return Err(err.into()),
        };
        let mut list = Self {
            path: Some(path),
            pruned,
            compacted: RoaringBitmap::new(),
        };
        list.rebuild_compacted();
        Ok(list)
    }

    fn rebuild_compacted(&mut self) {
        let mut compacted = RoaringBitmap::new();
        for pos in self.pruned.iter() {
            let (parent, _) = family(pos as u64);
            if parent <= u32::MAX as u64 && self.pruned.contains(parent as u32) {
                compacted.insert(pos);
            }
        }
        self.compacted = compacted;
    }

    /// Marks a leaf position pruned and bubbles upward.
    pub fn add(&mut self, pos: u64) {
        let mut pos = pos as u32;
        self.pruned.insert(pos);
        loop {
            let (parent, sibling) = family(pos as u64);
            if sibling > u32::MAX as u64 || !self.pruned.contains(sibling as u32) {
                break;
            }
            self.pruned.insert(parent as u32);
            self.compacted.insert(pos);
            self.compacted.insert(sibling as u32);
            pos = parent as u32;
        }
    }

    pub fn is_pruned(&self, pos: u64) -> bool {
        pos <= u32::MAX as u64 && self.pruned.contains(pos as u32)
    }

    /// True iff the position has been physically removed from the hash file.
    pub fn is_compacted(&self, pos: u64) -> bool {
        pos <= u32::MAX as u64 && self.compacted.contains(pos as u32)
    }

    /// Count of compacted positions strictly before `pos`.
    pub fn shift(&self, pos: u64) -> u64 {
        if pos == 0 {
            return 0;
        }
        let bound = pos.min(u32::MAX as u64 + 1) - 1;
        self.compacted.rank(bound as u32)
    }

    /// Count of compacted positions across the whole range.
    pub fn total_shift(&self) -> u64 {
        self.compacted.len()
    }

    pub fn flush(&self) -> Result<(), MmrError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut bytes = Vec::with_capacity(self.pruned.serialized_size());
        self.pruned
            .serialize_into(&mut bytes)
            .map_err(|_| MmrError::Corrupt("prune list bitmap does not serialize"))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn iter_compacted(&self) -> impl Iterator<Item = u64> + '_ {
        self.compacted.iter().map(|pos| pos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lone_leaf_is_not_compacted() {
        let mut list = PruneList::empty();
        list.add(0);
        assert!(list.is_pruned(0));
        assert!(!list.is_compacted(0));
        assert_eq!(list.total_shift(), 0);
    }

    #[test]
    fn sibling_pair_compacts_children() {
        let mut list = PruneList::empty();
        list.add(0);
        list.add(1);
        // Parent 2 is now pruned; children 0 and 1 are removable.
        assert!(list.is_pruned(2));
        assert!(list.is_compacted(0));
        assert!(list.is_compacted(1));
        assert!(!list.is_compacted(2));
        assert_eq!(list.total_shift(), 2);
    }

    #[test]
    fn full_mountain_keeps_only_its_root() {
        let mut list = PruneList::empty();
        // Prune all four leaves of the first perfect subtree (positions 0..6).
        for pos in [0u64, 1, 3, 4] {
            list.add(pos);
        }
        assert!(list.is_pruned(6));
        for pos in [0u64, 1, 2, 3, 4, 5] {
            assert!(list.is_compacted(pos), "pos {pos}");
        }
        assert!(!list.is_compacted(6));
        assert_eq!(list.total_shift(), 6);
    }

    #[test]
    fn shift_counts_strictly_before() {
        let mut list = PruneList::empty();
        list.add(0);
        list.add(1);
        assert_eq!(list.shift(0), 0);
        assert_eq!(list.shift(1), 1);
        assert_eq!(list.shift(2), 2);
        assert_eq!(list.shift(10), 2);
    }

    #[test]
    fn reopen_restores_compaction_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pmmr_prun.bin");
        {
            let mut list = PruneList::open(&path).unwrap();
            list.add(0);
            list.add(1);
            list.flush().unwrap();
        }
        let list = PruneList::open(&path).unwrap();
        assert!(list.is_compacted(0));
        assert!(list.is_compacted(1));
        assert!(!list.is_compacted(2));
        assert_eq!(list.total_shift(), 2);
    }
}
