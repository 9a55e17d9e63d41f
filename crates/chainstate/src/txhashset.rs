//! The pruned UTXO commitment set: output, rangeproof and kernel MMRs in
//! parallel, plus the unspent-leaf bitmap and the commitment position index.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mwd_consensus::{verify_kernel_signatures, verify_kernel_sums};
use mwd_mmr::pos::{insertion_to_pmmr_index, is_leaf, n_leaves};
use mwd_mmr::{bundle, hash_leaf, DataFile, HashFile, LeafSet, Pmmr, PruneList};
use mwd_primitives::block::BlockHeader;
use mwd_primitives::hash::Hash;
use mwd_primitives::transaction::{Commitment, Output, TransactionBody, TxKernel};
use mwd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::{ApplyError, ChainError};

const OUTPUT_DIR: &str = "output";
const RANGEPROOF_DIR: &str = "rangeproof";
const KERNEL_DIR: &str = "kernel";
const HASH_FILE: &str = "pmmr_hash.bin";
const DATA_FILE: &str = "pmmr_data.bin";
const PRUNE_FILE: &str = "pmmr_prun.bin";
const LEAF_FILE: &str = "pmmr_leaf.bin";
const KERNEL_DATA_FILE: &str = "kernel_data.bin";

/// The three roots and two sizes a header commits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roots {
    pub output_root: Hash,
    pub rangeproof_root: Hash,
    pub kernel_root: Hash,
    pub output_mmr_size: u64,
    pub kernel_mmr_size: u64,
}

struct Checkpoint {
    output_size: u64,
    kernel_size: u64,
    data_size: u64,
    leaf_set: LeafSet,
}

enum ApplyAbort {
    Invalid(ApplyError),
    Infra(ChainError),
}

impl From<ApplyError> for ApplyAbort {
    fn from(err: ApplyError) -> Self {
        ApplyAbort::Invalid(err)
    }
}

impl From<ChainError> for ApplyAbort {
    fn from(err: ChainError) -> Self {
        ApplyAbort::Infra(err)
    }
}

impl From<mwd_mmr::MmrError> for ApplyAbort {
    fn from(err: mwd_mmr::MmrError) -> Self {
        ApplyAbort::Infra(err.into())
    }
}

impl From<mwd_storage::StoreError> for ApplyAbort {
    fn from(err: mwd_storage::StoreError) -> Self {
        ApplyAbort::Infra(err.into())
    }
}

pub struct TxHashSet<S> {
    root_dir: PathBuf,
    store: Arc<S>,
    output_pmmr: Pmmr,
    rangeproof_pmmr: Pmmr,
    kernel_pmmr: Pmmr,
    output_data: DataFile,
    leaf_set: LeafSet,
}

impl<S: KeyValueStore> TxHashSet<S> {
    /// Opens the file set under `root_dir` and reconciles it with `head`:
    /// anything past the head's recorded sizes (a crash between flush and
    /// head update) is rewound away.
    pub fn open(
        root_dir: impl Into<PathBuf>,
        store: Arc<S>,
        head: &BlockHeader,
    ) -> Result<Self, ChainError> {
        let root_dir = root_dir.into();
        let output_dir = root_dir.join(OUTPUT_DIR);
        let rangeproof_dir = root_dir.join(RANGEPROOF_DIR);
        let kernel_dir = root_dir.join(KERNEL_DIR);

        let output_pmmr = Pmmr::new(
            HashFile::open(output_dir.join(HASH_FILE))?,
            PruneList::open(output_dir.join(PRUNE_FILE))?,
        );
        let rangeproof_pmmr = Pmmr::new(
            HashFile::open(rangeproof_dir.join(HASH_FILE))?,
            PruneList::open(rangeproof_dir.join(PRUNE_FILE))?,
        );
        let kernel_pmmr = Pmmr::new(
            HashFile::open(kernel_dir.join(HASH_FILE))?,
            PruneList::empty(),
        );
        let output_data = DataFile::open(output_dir.join(DATA_FILE))?;
        let leaf_set = LeafSet::open(output_dir.join(LEAF_FILE))?;

        let mut txhashset = Self {
            root_dir,
            store,
            output_pmmr,
            rangeproof_pmmr,
            kernel_pmmr,
            output_data,
            leaf_set,
        };

        if txhashset.output_pmmr.size() < head.output_mmr_size
            || txhashset.kernel_pmmr.size() < head.kernel_mmr_size
        {
            return Err(ChainError::Corrupt("txhashset behind the confirmed head"));
        }
        txhashset.output_pmmr.rewind(head.output_mmr_size)?;
        txhashset.rangeproof_pmmr.rewind(head.output_mmr_size)?;
        txhashset.kernel_pmmr.rewind(head.kernel_mmr_size)?;
        txhashset
            .output_data
            .rewind(n_leaves(head.output_mmr_size))?;
        if let Some(snapshot) = txhashset
            .store
            .get(Column::LeafSnapshot, &head.hash())?
        {
            txhashset.leaf_set.restore(&snapshot)?;
        }
        Ok(txhashset)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn output_mmr_size(&self) -> u64 {
        self.output_pmmr.size()
    }

    pub fn kernel_mmr_size(&self) -> u64 {
        self.kernel_pmmr.size()
    }

    pub fn unspent_count(&self) -> u64 {
        self.leaf_set.len()
    }

    pub fn is_unspent(&self, commitment: &Commitment) -> Result<bool, ChainError> {
        let Some(pos) = self.output_pos(commitment)? else {
            return Ok(false);
        };
        Ok(self.leaf_set.contains(pos))
    }

    pub fn output_pos(&self, commitment: &Commitment) -> Result<Option<u64>, ChainError> {
        let Some(bytes) = self
            .store
            .get(Column::OutputPos, commitment.as_bytes())?
        else {
            return Ok(None);
        };
        if bytes.len() != 8 {
            return Err(ChainError::Corrupt("output position index entry malformed"));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(Some(u64::from_be_bytes(buf)))
    }

    pub fn merkle_proof(&self, commitment: &Commitment) -> Result<Option<mwd_mmr::MerkleProof>, ChainError> {
        let Some(pos) = self.output_pos(commitment)? else {
            return Ok(None);
        };
        if !self.leaf_set.contains(pos) {
            return Ok(None);
        }
        Ok(Some(self.output_pmmr.merkle_proof(pos)?))
    }

    pub fn roots(&self) -> Result<Roots, ChainError> {
        Ok(Roots {
            output_root: self.output_pmmr.root()?,
            rangeproof_root: self.rangeproof_pmmr.root()?,
            kernel_root: self.kernel_pmmr.root()?,
            output_mmr_size: self.output_pmmr.size(),
            kernel_mmr_size: self.kernel_pmmr.size(),
        })
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            output_size: self.output_pmmr.size(),
            kernel_size: self.kernel_pmmr.size(),
            data_size: self.output_data.size(),
            leaf_set: self.leaf_set.clone(),
        }
    }

    fn roll_back(&mut self, checkpoint: Checkpoint) -> Result<(), ChainError> {
        self.output_pmmr.rewind(checkpoint.output_size)?;
        self.rangeproof_pmmr.rewind(checkpoint.output_size)?;
        self.kernel_pmmr.rewind(checkpoint.kernel_size)?;
        self.output_data.rewind(checkpoint.data_size)?;
        self.leaf_set = checkpoint.leaf_set;
        Ok(())
    }

    /// Appends a block body without committing anything durable. Index
    /// writes accumulate into `batch`; the caller commits on success.
    fn apply_body(
        &mut self,
        batch: &mut WriteBatch,
        body: &TransactionBody,
    ) -> Result<(), ApplyAbort> {
        for input in &body.inputs {
            let pos = self
                .output_pos(&input.commitment)?
                .ok_or(ApplyError::UnknownInput)?;
            if pos >= self.output_pmmr.size() || !self.leaf_set.contains(pos) {
                return Err(ApplyError::AlreadySpent.into());
            }
            self.leaf_set.remove(pos);
        }
        for output in &body.outputs {
            if let Some(pos) = self.output_pos(&output.commitment)? {
                if self.leaf_set.contains(pos) {
                    return Err(ApplyError::DuplicateCommitment.into());
                }
            }
            let pos = self.output_pmmr.push(output.commitment.as_bytes())?;
            self.rangeproof_pmmr.push(&output.rangeproof)?;
            self.output_data.append(output.serialize());
            batch.put(Column::OutputPos, output.commitment.as_bytes(), pos.to_be_bytes());
            self.leaf_set.add(pos);
        }
        for kernel in &body.kernels {
            let serialized = kernel.serialize();
            let pos = self.kernel_pmmr.push(&serialized)?;
            batch.put(Column::Kernel, pos.to_be_bytes(), serialized);
        }
        Ok(())
    }

    /// Applies a body with no header to compare against and returns the
    /// resulting roots. Used when assembling a block (the header is built
    /// from the result), not when validating one.
    pub fn apply_body_unchecked(
        &mut self,
        body: &TransactionBody,
    ) -> Result<Roots, ChainError> {
        let checkpoint = self.checkpoint();
        let mut batch = WriteBatch::new();
        if let Err(abort) = self.apply_body(&mut batch, body) {
            self.roll_back(checkpoint)?;
            return match abort {
                ApplyAbort::Invalid(_) => {
                    Err(ChainError::Corrupt("body does not apply to the utxo set"))
                }
                ApplyAbort::Infra(err) => Err(err),
            };
        }
        self.store.write_batch(&batch)?;
        self.roots()
    }

    /// Applies a block: spends inputs, appends outputs and kernels, then
    /// compares the resulting roots and sizes against the header. On any
    /// disagreement the whole application is rolled back.
    ///
    /// Outer error is infrastructure failure; inner is a validation verdict.
    pub fn apply_block(
        &mut self,
        header: &BlockHeader,
        body: &TransactionBody,
    ) -> Result<Result<(), ApplyError>, ChainError> {
        let checkpoint = self.checkpoint();
        let mut batch = WriteBatch::new();

        if let Err(abort) = self.apply_body(&mut batch, body) {
            self.roll_back(checkpoint)?;
            return match abort {
                ApplyAbort::Invalid(err) => Ok(Err(err)),
                ApplyAbort::Infra(err) => Err(err),
            };
        }

        let roots = self.roots()?;
        if roots.output_mmr_size != header.output_mmr_size
            || roots.kernel_mmr_size != header.kernel_mmr_size
        {
            self.roll_back(checkpoint)?;
            return Ok(Err(ApplyError::SizeMismatch));
        }
        if roots.output_root != header.output_root
            || roots.rangeproof_root != header.rangeproof_root
            || roots.kernel_root != header.kernel_root
        {
            self.roll_back(checkpoint)?;
            return Ok(Err(ApplyError::RootMismatch));
        }

        batch.put(
            Column::LeafSnapshot,
            header.hash(),
            self.leaf_set.to_bytes(),
        );
        self.flush()?;
        self.store.write_batch(&batch)?;
        Ok(Ok(()))
    }

    /// Rewinds to the sizes a previously applied header records and restores
    /// the unspent bitmap snapshot taken at that height. Idempotent for a
    /// fixed header.
    pub fn rewind(&mut self, header: &BlockHeader) -> Result<(), ChainError> {
        let new_leaf_count = n_leaves(header.output_mmr_size);
        let mut batch = WriteBatch::new();
        for leaf_index in new_leaf_count..self.output_data.size() {
            let bytes = self.output_data.get(leaf_index)?;
            let output = Output::deserialize(&bytes)?;
            batch.delete(Column::OutputPos, output.commitment.as_bytes());
        }
        for pos in header.kernel_mmr_size..self.kernel_pmmr.size() {
            if is_leaf(pos) {
                batch.delete(Column::Kernel, pos.to_be_bytes());
            }
        }

        self.output_pmmr.rewind(header.output_mmr_size)?;
        self.rangeproof_pmmr.rewind(header.output_mmr_size)?;
        self.kernel_pmmr.rewind(header.kernel_mmr_size)?;
        self.output_data.rewind(new_leaf_count)?;

        let snapshot = self
            .store
            .get(Column::LeafSnapshot, &header.hash())?
            .ok_or(ChainError::Corrupt("no leaf snapshot for rewind target"))?;
        self.leaf_set.restore(&snapshot)?;

        self.flush()?;
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Full validation against a header: roots, the kernel sum identity over
    /// the unspent set, and every kernel signature.
    pub fn validate(
        &self,
        header: &BlockHeader,
    ) -> Result<Result<(), ApplyError>, ChainError> {
        let kernels = self.read_kernels()?;
        self.validate_with_kernels(header, &kernels)
    }

    /// Like [`TxHashSet::validate`], but with the kernels supplied by the
    /// caller and cross-checked against the kernel MMR. Used on staged
    /// snapshots, whose kernels travel in the bundle's dump file.
    pub fn validate_with_kernels(
        &self,
        header: &BlockHeader,
        kernels: &[TxKernel],
    ) -> Result<Result<(), ApplyError>, ChainError> {
        let roots = self.roots()?;
        if roots.output_mmr_size != header.output_mmr_size
            || roots.kernel_mmr_size != header.kernel_mmr_size
        {
            return Ok(Err(ApplyError::SizeMismatch));
        }
        if roots.output_root != header.output_root
            || roots.rangeproof_root != header.rangeproof_root
            || roots.kernel_root != header.kernel_root
        {
            return Ok(Err(ApplyError::RootMismatch));
        }

        if kernels.len() as u64 != n_leaves(header.kernel_mmr_size) {
            return Ok(Err(ApplyError::SizeMismatch));
        }
        for (index, kernel) in kernels.iter().enumerate() {
            let pos = insertion_to_pmmr_index(index as u64);
            if self.kernel_pmmr.get_hash(pos)? != hash_leaf(pos, &kernel.serialize()) {
                return Ok(Err(ApplyError::RootMismatch));
            }
        }
        if let Err(err) = verify_kernel_signatures(kernels.iter()) {
            return Ok(Err(err.into()));
        }

        let mut unspent = Vec::with_capacity(self.leaf_set.len() as usize);
        for pos in self.leaf_set.iter() {
            let bytes = self.output_data.get(n_leaves(pos))?;
            let output = Output::deserialize(&bytes)?;
            unspent.push(output.commitment);
        }
        let excesses: Vec<Commitment> = kernels.iter().map(|kernel| kernel.excess).collect();
        if let Err(err) =
            verify_kernel_sums(&[], &unspent, &excesses, &header.total_kernel_offset)
        {
            return Ok(Err(err.into()));
        }
        Ok(Ok(()))
    }

    /// Kernels shipped alongside a snapshot, in insertion order.
    pub fn read_kernel_dump(&self) -> Result<Vec<TxKernel>, ChainError> {
        let data = DataFile::open(self.root_dir.join(KERNEL_DATA_FILE))?;
        let mut kernels = Vec::with_capacity(data.size() as usize);
        for index in 0..data.size() {
            kernels.push(TxKernel::deserialize(&data.get(index)?)?);
        }
        Ok(kernels)
    }

    pub fn leaf_snapshot_bytes(&self) -> Vec<u8> {
        self.leaf_set.to_bytes()
    }

    pub fn read_kernels(&self) -> Result<Vec<TxKernel>, ChainError> {
        let mut kernels = Vec::new();
        for pos in 0..self.kernel_pmmr.size() {
            if !is_leaf(pos) {
                continue;
            }
            let bytes = self
                .store
                .get(Column::Kernel, &pos.to_be_bytes())?
                .ok_or(ChainError::Corrupt("kernel missing from index"))?;
            kernels.push(TxKernel::deserialize(&bytes)?);
        }
        Ok(kernels)
    }

    /// Prunes spent outputs at or below the horizon header and physically
    /// compacts the output and rangeproof hash files. Roots are unchanged.
    pub fn compact(&mut self, horizon: &BlockHeader) -> Result<(), ChainError> {
        self.flush()?;
        let mut prunable = Vec::new();
        for pos in 0..horizon.output_mmr_size {
            if is_leaf(pos)
                && !self.leaf_set.contains(pos)
                && !self.output_pmmr.prune_list().is_pruned(pos)
            {
                prunable.push(pos);
            }
        }
        if prunable.is_empty() {
            return Ok(());
        }
        self.output_pmmr.compact(&prunable)?;
        self.rangeproof_pmmr.compact(&prunable)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ChainError> {
        self.output_pmmr.flush()?;
        self.rangeproof_pmmr.flush()?;
        self.kernel_pmmr.flush()?;
        self.output_data.flush()?;
        self.leaf_set.flush()?;
        Ok(())
    }

    /// Rebuilds the commitment and kernel indexes from the file set; used
    /// after a snapshot replaces the files wholesale.
    pub fn rebuild_index(&mut self) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.store.scan_prefix(Column::OutputPos, &[])? {
            batch.delete(Column::OutputPos, key);
        }
        for leaf_index in 0..self.output_data.size() {
            let bytes = self.output_data.get(leaf_index)?;
            let output = Output::deserialize(&bytes)?;
            let pos = insertion_to_pmmr_index(leaf_index);
            batch.put(Column::OutputPos, output.commitment.as_bytes(), pos.to_be_bytes());
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Loads the kernels shipped alongside a snapshot into the kernel index.
    pub fn load_kernel_data(&mut self) -> Result<(), ChainError> {
        let data = DataFile::open(self.root_dir.join(KERNEL_DATA_FILE))?;
        let mut batch = WriteBatch::new();
        for (key, _) in self.store.scan_prefix(Column::Kernel, &[])? {
            batch.delete(Column::Kernel, key);
        }
        for index in 0..data.size() {
            let bytes = data.get(index)?;
            // Validate the shape before indexing.
            let _ = TxKernel::deserialize(&bytes)?;
            let pos = insertion_to_pmmr_index(index);
            batch.put(Column::Kernel, pos.to_be_bytes(), bytes);
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Packs the flushed file set (plus a kernel dump) into a snapshot
    /// bundle at `dest`.
    pub fn write_snapshot(&mut self, dest: &Path) -> Result<(), ChainError> {
        self.flush()?;

        let kernel_dump_path = self.root_dir.join(KERNEL_DATA_FILE);
        let mut kernel_dump = DataFile::open(&kernel_dump_path)?;
        kernel_dump.rewind(0)?;
        for kernel in self.read_kernels()? {
            kernel_dump.append(kernel.serialize());
        }
        kernel_dump.flush()?;

        let entry = |relative: &str| {
            (
                relative.to_string(),
                self.root_dir.join(relative.replace('/', std::path::MAIN_SEPARATOR_STR)),
            )
        };
        let files = vec![
            entry("output/pmmr_hash.bin"),
            entry("output/pmmr_data.bin"),
            entry("output/pmmr_prun.bin"),
            entry("output/pmmr_leaf.bin"),
            entry("rangeproof/pmmr_hash.bin"),
            entry("rangeproof/pmmr_prun.bin"),
            entry("kernel/pmmr_hash.bin"),
            entry("kernel_data.bin"),
        ];
        bundle::pack(&files, dest)?;
        Ok(())
    }

    /// Unpacks a snapshot bundle into a fresh directory.
    pub fn unpack_snapshot(bundle_path: &Path, staging_dir: &Path) -> Result<(), ChainError> {
        if staging_dir.exists() {
            std::fs::remove_dir_all(staging_dir).map_err(mwd_mmr::MmrError::from)?;
        }
        bundle::unpack(bundle_path, staging_dir)?;
        Ok(())
    }
}
