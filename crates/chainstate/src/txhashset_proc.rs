//! State-sync snapshot application: unpack, validate against the target
//! header, atomically swap the active txhashset, move CONFIRMED.

use std::path::Path;
use std::sync::Arc;

use mwd_log::{log_info, log_warn};
use mwd_primitives::hash::{short_hash, Hash};
use mwd_storage::{Column, KeyValueStore, WriteBatch};

use crate::chain_store::Branch;
use crate::error::{ChainError, ChainStatus};
use crate::state::ChainBody;
use crate::txhashset::TxHashSet;

pub fn process_txhashset<S: KeyValueStore>(
    body: &mut ChainBody<S>,
    header_hash: Hash,
    bundle_path: &Path,
) -> Result<ChainStatus, ChainError> {
    let Some(node_id) = body.chain_store.get(&header_hash) else {
        return Ok(ChainStatus::Orphaned);
    };
    if !body.chain_store.is_on_branch(Branch::Candidate, &header_hash) {
        return Ok(ChainStatus::Invalid("snapshot header not on candidate chain"));
    }
    let header = body
        .chain_store
        .header(&header_hash)?
        .ok_or(ChainError::Corrupt("snapshot target header missing"))?;

    let active_dir = body.txhashset.root_dir().to_path_buf();
    let parent_dir = active_dir
        .parent()
        .ok_or(ChainError::Corrupt("txhashset directory has no parent"))?
        .to_path_buf();
    let staging_dir = parent_dir.join("txhashset_staging");
    let old_dir = parent_dir.join("txhashset_old");

    if TxHashSet::<S>::unpack_snapshot(bundle_path, &staging_dir).is_err() {
        let _ = std::fs::remove_dir_all(&staging_dir);
        return Ok(ChainStatus::Invalid("snapshot bundle does not unpack"));
    }

    // Validate the staged set before touching the active one. Kernels come
    // from the shipped dump, cross-checked against the kernel MMR, so the
    // active kernel index stays untouched until the swap is committed.
    let verdict = (|| -> Result<Result<(), &'static str>, ChainError> {
        let staging = match TxHashSet::open(&staging_dir, Arc::clone(&body.store), &header) {
            Ok(staging) => staging,
            Err(_) => return Ok(Err("snapshot file set does not open")),
        };
        let kernels = match staging.read_kernel_dump() {
            Ok(kernels) => kernels,
            Err(_) => return Ok(Err("snapshot kernel dump malformed")),
        };
        match staging.validate_with_kernels(&header, &kernels)? {
            Ok(()) => Ok(Ok(())),
            Err(apply_err) => Ok(Err(apply_err.reason())),
        }
    })();
    match verdict {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => {
            log_warn!(
                "txhashset snapshot for {} rejected: {reason}",
                short_hash(&header_hash)
            );
            let _ = std::fs::remove_dir_all(&staging_dir);
            return Ok(ChainStatus::Invalid(reason));
        }
        Err(err) => {
            let _ = std::fs::remove_dir_all(&staging_dir);
            return Err(err);
        }
    }

    // Swap: the previous set moves aside first so a failed second rename can
    // be undone, leaving the old state active.
    if old_dir.exists() {
        std::fs::remove_dir_all(&old_dir).map_err(mwd_mmr::MmrError::from)?;
    }
    std::fs::rename(&active_dir, &old_dir).map_err(mwd_mmr::MmrError::from)?;
    if let Err(err) = std::fs::rename(&staging_dir, &active_dir) {
        let _ = std::fs::rename(&old_dir, &active_dir);
        let _ = std::fs::remove_dir_all(&staging_dir);
        return Err(ChainError::Mmr(err.into()));
    }
    let _ = std::fs::remove_dir_all(&old_dir);

    let mut replacement = TxHashSet::open(&active_dir, Arc::clone(&body.store), &header)?;
    replacement.rebuild_index()?;
    replacement.load_kernel_data()?;
    let mut batch = WriteBatch::new();
    batch.put(
        Column::LeafSnapshot,
        header_hash,
        replacement.leaf_snapshot_bytes(),
    );
    body.store.write_batch(&batch)?;
    body.txhashset = replacement;

    body.chain_store.reorg(Branch::Confirmed, node_id)?;
    log_info!(
        "txhashset snapshot applied; confirmed head now {} at height {}",
        short_hash(&header_hash),
        header.height
    );
    Ok(ChainStatus::Success)
}
