//! Header and block validation state machines. Every function here receives
//! the locked chain body; nothing reacquires the state lock.

use mwd_consensus::difficulty::{next_difficulty, verify_proof_of_work, HeaderInfo};
use mwd_consensus::{verify_kernel_signatures, verify_kernel_sums, verify_rangeproof};
use mwd_log::log_warn;
use mwd_primitives::block::{Block, BlockHeader};
use mwd_primitives::transaction::Commitment;
use mwd_storage::KeyValueStore;

use crate::chain_store::{Branch, NodeId};
use crate::error::{ChainError, ChainStatus};
use crate::state::ChainBody;

/// (height, timestamp, total difficulty) snapshots of a header's ancestors,
/// oldest first, used by the contextual checks.
type AncestorWindow = Vec<(u64, i64, u64)>;

fn ancestor_window<S: KeyValueStore>(
    body: &ChainBody<S>,
    tip: NodeId,
    count: usize,
) -> AncestorWindow {
    let mut window = Vec::with_capacity(count);
    let mut id = Some(tip);
    while let Some(node_id) = id {
        if window.len() >= count {
            break;
        }
        let node = body.chain_store.node(node_id);
        window.push((node.height, node.timestamp, node.total_difficulty));
        id = node.parent;
    }
    window.reverse();
    window
}

/// Contextual checks for a header whose ancestry ends with the last entry of
/// `window`: version schedule, timestamp bounds, difficulty retarget and
/// proof of work.
fn validate_header_contextual(
    body_params: &mwd_consensus::ChainParams,
    window: &AncestorWindow,
    header: &BlockHeader,
    now: i64,
) -> Result<(), &'static str> {
    let (parent_height, _, parent_total) = *window.last().ok_or("missing parent window")?;
    if header.height != parent_height + 1 {
        return Err("header height not parent height plus one");
    }
    if !body_params.valid_header_version(header.height, header.version) {
        return Err("header version not allowed at height");
    }

    let median_window = window
        .len()
        .min(body_params.median_time_window);
    let mut times: Vec<i64> = window[window.len() - median_window..]
        .iter()
        .map(|(_, timestamp, _)| *timestamp)
        .collect();
    times.sort_unstable();
    let median = times[times.len() / 2];
    if header.timestamp <= median {
        return Err("header timestamp below median of recent headers");
    }
    if header.timestamp > now + body_params.max_future_drift_secs {
        return Err("header timestamp too far in the future");
    }

    let retarget_window = window.len().min(body_params.difficulty_window + 1);
    let tail = &window[window.len() - retarget_window..];
    let infos: Vec<HeaderInfo> = tail
        .iter()
        .enumerate()
        .map(|(i, (_, timestamp, total))| HeaderInfo {
            timestamp: *timestamp,
            difficulty: if i == 0 {
                0
            } else {
                total.saturating_sub(tail[i - 1].2)
            },
        })
        .collect();
    let required = next_difficulty(body_params, &infos);
    if header.total_difficulty != parent_total.saturating_add(required) {
        return Err("total difficulty does not match retarget");
    }
    if verify_proof_of_work(body_params, header, required).is_err() {
        return Err("invalid proof of work");
    }
    Ok(())
}

/// Repoints CANDIDATE at `id` if it carries more total difficulty, keeping
/// the by-height header file in sync.
fn maybe_update_candidate<S: KeyValueStore>(
    body: &mut ChainBody<S>,
    id: NodeId,
) -> Result<(), ChainError> {
    let old_head = body.chain_store.head_id(Branch::Candidate);
    if body.chain_store.node(id).total_difficulty
        <= body.chain_store.node(old_head).total_difficulty
    {
        return Ok(());
    }
    let ancestor = body.chain_store.common_ancestor(old_head, id);
    body.chain_store.reorg(Branch::Candidate, id)?;

    let ancestor_height = body.chain_store.node(ancestor).height;
    body.header_file.rewind_to_height(ancestor_height)?;
    for node_id in body.chain_store.path(ancestor, id) {
        body.header_file.append(body.chain_store.node(node_id).hash);
    }
    body.header_file.flush()?;
    Ok(())
}

pub fn process_header<S: KeyValueStore>(
    body: &mut ChainBody<S>,
    header: &BlockHeader,
    now: i64,
) -> Result<ChainStatus, ChainError> {
    let hash = header.hash();
    if let Some(id) = body.chain_store.get(&hash) {
        if body.chain_store.node(id).failed {
            return Ok(ChainStatus::Invalid("header previously failed validation"));
        }
        return Ok(ChainStatus::AlreadyExists);
    }
    let Some(parent) = body.chain_store.get(&header.prev_hash) else {
        return Ok(ChainStatus::Orphaned);
    };
    if body.chain_store.node(parent).failed {
        return Ok(ChainStatus::Invalid("header extends an invalid chain"));
    }

    let window_len = body.params.difficulty_window + 1;
    let window = ancestor_window(body, parent, window_len.max(body.params.median_time_window));
    if let Err(reason) = validate_header_contextual(&body.params, &window, header, now) {
        return Ok(ChainStatus::Invalid(reason));
    }

    let id = body.chain_store.add_header(header)?;
    maybe_update_candidate(body, id)?;
    Ok(ChainStatus::Success)
}

/// Validates a contiguous batch of sync headers before any mutation; either
/// the whole batch attaches or none of it does.
pub fn process_sync_headers<S: KeyValueStore>(
    body: &mut ChainBody<S>,
    headers: &[BlockHeader],
    now: i64,
) -> Result<ChainStatus, ChainError> {
    if headers.is_empty() {
        return Ok(ChainStatus::Success);
    }
    for pair in headers.windows(2) {
        if pair[1].prev_hash != pair[0].hash() || pair[1].height != pair[0].height + 1 {
            return Ok(ChainStatus::Invalid("sync headers not contiguous"));
        }
    }

    // Skip the prefix we already have.
    let mut first_new = headers.len();
    for (index, header) in headers.iter().enumerate() {
        if !body.chain_store.contains(&header.hash()) {
            first_new = index;
            break;
        }
    }
    if first_new == headers.len() {
        return Ok(ChainStatus::AlreadyExists);
    }
    let headers = &headers[first_new..];

    let Some(parent) = body.chain_store.get(&headers[0].prev_hash) else {
        return Ok(ChainStatus::Orphaned);
    };
    if body.chain_store.node(parent).failed {
        return Ok(ChainStatus::Invalid("sync headers extend an invalid chain"));
    }

    // Validate the whole batch against a rolling window; no mutation yet.
    let window_len = (body.params.difficulty_window + 1).max(body.params.median_time_window);
    let mut window = ancestor_window(body, parent, window_len);
    for header in headers {
        if let Err(reason) = validate_header_contextual(&body.params, &window, header, now) {
            return Ok(ChainStatus::Invalid(reason));
        }
        window.push((header.height, header.timestamp, header.total_difficulty));
        if window.len() > window_len {
            window.remove(0);
        }
    }

    let mut last = parent;
    for header in headers {
        last = body.chain_store.add_header(header)?;
    }
    body.chain_store.reorg(Branch::Sync, last)?;
    maybe_update_candidate(body, last)?;
    Ok(ChainStatus::Success)
}

/// Stateless block checks: sorted body, rangeproof policy, kernel lock
/// heights and signatures, and the block-level balance identity.
fn validate_block<S: KeyValueStore>(
    body: &ChainBody<S>,
    block: &Block,
) -> Result<(), &'static str> {
    if !block.body.verify_sorted() {
        return Err("block body not sorted");
    }
    for output in &block.body.outputs {
        if verify_rangeproof(output).is_err() {
            return Err("output rangeproof malformed");
        }
    }
    for kernel in &block.body.kernels {
        if kernel.lock_height > block.header.height {
            return Err("kernel lock height not reached");
        }
    }
    if verify_kernel_signatures(block.body.kernels.iter()).is_err() {
        return Err("kernel signature invalid");
    }

    let parent_offset = match body.chain_store.header(&block.header.prev_hash) {
        Ok(Some(parent)) => parent.total_kernel_offset,
        _ => return Err("parent header unavailable"),
    };
    let block_offset = match mwd_consensus::crypto::sub_kernel_offsets(
        &block.header.total_kernel_offset,
        &parent_offset,
    ) {
        Ok(offset) => offset,
        Err(_) => return Err("kernel offset out of range"),
    };
    let inputs: Vec<Commitment> = block.body.inputs.iter().map(|input| input.commitment).collect();
    let outputs: Vec<Commitment> = block
        .body
        .outputs
        .iter()
        .map(|output| output.commitment)
        .collect();
    let excesses: Vec<Commitment> = block
        .body
        .kernels
        .iter()
        .map(|kernel| kernel.excess)
        .collect();
    if verify_kernel_sums(&inputs, &outputs, &excesses, &block_offset).is_err() {
        return Err("block commitments do not balance");
    }
    Ok(())
}

pub fn process_block<S: KeyValueStore>(
    body: &mut ChainBody<S>,
    block: &Block,
    now: i64,
) -> Result<ChainStatus, ChainError> {
    let hash = block.hash();

    let id = match body.chain_store.get(&hash) {
        Some(id) => {
            if body.chain_store.node(id).failed {
                return Ok(ChainStatus::Invalid("block header previously failed"));
            }
            id
        }
        None => match process_header(body, &block.header, now)? {
            ChainStatus::Success | ChainStatus::AlreadyExists => body
                .chain_store
                .get(&hash)
                .ok_or(ChainError::Corrupt("header vanished after attach"))?,
            other => return Ok(other),
        },
    };

    if body.chain_store.is_on_branch(Branch::Confirmed, &hash) {
        return Ok(ChainStatus::AlreadyExists);
    }

    if let Err(reason) = validate_block(body, block) {
        body.chain_store.mark_failed(id);
        return Ok(ChainStatus::Invalid(reason));
    }

    body.block_store.put(block)?;
    advance_confirmed(body)?;

    if body.chain_store.node(id).failed {
        return Ok(ChainStatus::Invalid("block failed to apply"));
    }
    if body.chain_store.is_on_branch(Branch::Confirmed, &hash) {
        Ok(ChainStatus::Success)
    } else {
        Ok(ChainStatus::Orphaned)
    }
}

/// Moves CONFIRMED toward CANDIDATE as far as stored blocks allow, but never
/// onto a head with less total difficulty than the current one. Handles both
/// plain extension and reorgs (rewind to the fork, apply the better branch).
pub fn advance_confirmed<S: KeyValueStore>(body: &mut ChainBody<S>) -> Result<(), ChainError> {
    let confirmed = body.chain_store.head_id(Branch::Confirmed);
    let candidate = body.chain_store.head_id(Branch::Candidate);
    if confirmed == candidate {
        return Ok(());
    }

    let ancestor = body.chain_store.common_ancestor(confirmed, candidate);
    let path = body.chain_store.path(ancestor, candidate);
    let mut prefix = Vec::with_capacity(path.len());
    for id in path {
        let node_hash = body.chain_store.node(id).hash;
        if body.chain_store.node(id).failed || !body.block_store.has(&node_hash)? {
            break;
        }
        prefix.push(id);
    }
    let Some(&target) = prefix.last() else {
        return Ok(());
    };
    if body.chain_store.node(target).total_difficulty
        <= body.chain_store.node(confirmed).total_difficulty
    {
        return Ok(());
    }

    let ancestor_header = body
        .chain_store
        .header(&body.chain_store.node(ancestor).hash)?
        .ok_or(ChainError::Corrupt("fork point header missing"))?;
    if ancestor != confirmed {
        body.txhashset.rewind(&ancestor_header)?;
    }

    let mut applied = ancestor;
    for id in prefix {
        let node_hash = body.chain_store.node(id).hash;
        let block = body
            .block_store
            .get(&node_hash)?
            .ok_or(ChainError::Corrupt("stored block vanished"))?;
        match body.txhashset.apply_block(&block.header, &block.body)? {
            Ok(()) => applied = id,
            Err(apply_err) => {
                log_warn!(
                    "block {} rejected at height {}: {}",
                    mwd_primitives::hash::short_hash(&node_hash),
                    block.header.height,
                    apply_err.reason()
                );
                body.chain_store.mark_failed(id);
                restore_confirmed(body, ancestor, confirmed, &ancestor_header)?;
                return Ok(());
            }
        }
    }

    if applied != confirmed {
        body.chain_store.reorg(Branch::Confirmed, applied)?;
    }
    Ok(())
}

/// Puts the txhashset back onto the old confirmed chain after a failed
/// reorg attempt, and drops CANDIDATE back to the confirmed head.
fn restore_confirmed<S: KeyValueStore>(
    body: &mut ChainBody<S>,
    ancestor: NodeId,
    confirmed: NodeId,
    ancestor_header: &BlockHeader,
) -> Result<(), ChainError> {
    body.txhashset.rewind(ancestor_header)?;
    for id in body.chain_store.path(ancestor, confirmed) {
        let node_hash = body.chain_store.node(id).hash;
        let block = body
            .block_store
            .get(&node_hash)?
            .ok_or(ChainError::Corrupt("confirmed block missing during restore"))?;
        if body
            .txhashset
            .apply_block(&block.header, &block.body)?
            .is_err()
        {
            return Err(ChainError::Corrupt(
                "previously confirmed block no longer applies",
            ));
        }
    }
    body.chain_store.reorg(Branch::Candidate, confirmed)?;
    let ancestor_height = body.chain_store.node(ancestor).height;
    body.header_file.rewind_to_height(ancestor_height)?;
    for id in body.chain_store.path(ancestor, confirmed) {
        body.header_file.append(body.chain_store.node(id).hash);
    }
    body.header_file.flush()?;
    Ok(())
}
