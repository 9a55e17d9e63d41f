mod common;

use common::{build_tx, commit, new_node, BlockFactory};
use mwd_chainstate::{Branch, ChainStatus};
use mwd_primitives::hash::ZERO_HASH;

#[test]
fn genesis_only_start() {
    let node = new_node();
    let genesis_hash = node.params.genesis_hash();

    assert_eq!(node.state.height(Branch::Confirmed), 0);
    assert_eq!(node.state.height(Branch::Candidate), 0);
    let header = node
        .state
        .header_by_height(0, Branch::Confirmed)
        .unwrap()
        .expect("genesis on confirmed");
    assert_eq!(header.hash(), genesis_hash);
    // Empty MMRs accumulate to the zero hash.
    assert_eq!(header.output_root, ZERO_HASH);
    assert_eq!(header.rangeproof_root, ZERO_HASH);
    assert_eq!(header.kernel_root, ZERO_HASH);
}

#[test]
fn lookup_by_hash_and_height_agree() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    let mut hashes = Vec::new();
    for _ in 0..5 {
        let block = factory.next_block(&[]);
        hashes.push(block.hash());
        assert_eq!(
            node.state.process_block(&block).unwrap(),
            ChainStatus::Success
        );
    }
    for (height, hash) in hashes.iter().enumerate() {
        let by_hash = node.state.header_by_hash(hash).unwrap().unwrap();
        let by_height = node
            .state
            .header_by_height(height as u64 + 1, Branch::Confirmed)
            .unwrap()
            .unwrap();
        assert_eq!(by_hash, by_height);
        assert_eq!(by_hash.hash(), *hash);
    }
}

#[test]
fn orphan_header_leaves_state_untouched() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    // Build out to height 5, but only to craft the orphan; nothing attaches.
    for _ in 0..5 {
        factory.next_block(&[]);
    }
    let mut orphan = factory.next_block(&[]).header;
    orphan.prev_hash = [0xAB; 32];

    assert_eq!(
        node.state.process_single_header(&orphan).unwrap(),
        ChainStatus::Orphaned
    );
    assert!(!node.state.has_header(&orphan.hash()));
    assert_eq!(node.state.height(Branch::Candidate), 0);
}

#[test]
fn duplicate_header_reports_already_exists() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    let header = factory.next_block(&[]).header;
    assert_eq!(
        node.state.process_single_header(&header).unwrap(),
        ChainStatus::Success
    );
    assert_eq!(
        node.state.process_single_header(&header).unwrap(),
        ChainStatus::AlreadyExists
    );
}

#[test]
fn header_with_wrong_difficulty_is_invalid() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    let mut header = factory.next_block(&[]).header;
    header.total_difficulty += 5;

    let status = node.state.process_single_header(&header).unwrap();
    assert!(matches!(status, ChainStatus::Invalid(_)), "{status:?}");
    assert!(!node.state.has_header(&header.hash()));
}

#[test]
fn sync_header_batch_attaches_all_or_nothing() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    let mut headers: Vec<_> = (0..6).map(|_| factory.next_block(&[]).header).collect();

    // Poison the middle of the batch.
    headers[3].total_difficulty += 1;
    let status = node.state.process_sync_headers(&headers).unwrap();
    assert!(matches!(status, ChainStatus::Invalid(_)));
    for header in &headers {
        assert!(!node.state.has_header(&header.hash()));
    }
    assert_eq!(node.state.height(Branch::Sync), 0);

    // Intact batch attaches and moves both scratch and candidate heads.
    headers[3].total_difficulty -= 1;
    assert_eq!(
        node.state.process_sync_headers(&headers).unwrap(),
        ChainStatus::Success
    );
    assert_eq!(node.state.height(Branch::Sync), 6);
    assert_eq!(node.state.height(Branch::Candidate), 6);
    assert_eq!(node.state.height(Branch::Confirmed), 0);
}

#[test]
fn block_with_unbalanced_commitments_is_invalid() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    let tx = build_tx(&[], &[501], 3, 1);
    let mut block = factory.next_block(&[tx]);
    // Swap in a commitment the kernel does not balance.
    block.body.outputs[0].commitment = commit(999);

    let status = node.state.process_block(&block).unwrap();
    assert!(matches!(status, ChainStatus::Invalid(_)), "{status:?}");
    assert_eq!(node.state.height(Branch::Confirmed), 0);
}

#[test]
fn confirmed_difficulty_is_monotone_across_applies() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    let mut last = node.state.total_difficulty(Branch::Confirmed);
    for round in 0..8u64 {
        let tx = build_tx(&[], &[1_000 + round], 0, 1);
        let block = factory.next_block(&[tx]);
        assert_eq!(
            node.state.process_block(&block).unwrap(),
            ChainStatus::Success
        );
        let current = node.state.total_difficulty(Branch::Confirmed);
        assert!(current > last);
        last = current;
    }
}

#[test]
fn reorg_switches_utxo_set_to_heavier_branch() {
    let node = new_node();

    // Shared prefix: blocks 1..=5, one fresh output each.
    let mut factory_a = BlockFactory::new(&node.params);
    let mut shared = Vec::new();
    for height in 1..=5u64 {
        let tx = build_tx(&[], &[100 + height], 0, 1);
        shared.push(factory_a.next_block(&[tx]));
    }
    let mut factory_b = BlockFactory::new(&node.params);
    for block in &shared {
        factory_b.apply_existing(block);
    }

    // Branch A: blocks 6..=10.
    let mut branch_a = Vec::new();
    for height in 6..=10u64 {
        let tx = build_tx(&[], &[200 + height], 0, 1);
        branch_a.push(factory_a.next_block(&[tx]));
    }
    // Branch B: blocks 6'..=11', one block heavier.
    let mut branch_b = Vec::new();
    for height in 6..=11u64 {
        let tx = build_tx(&[], &[300 + height], 0, 1);
        branch_b.push(factory_b.next_block(&[tx]));
    }

    for block in shared.iter().chain(branch_a.iter()) {
        assert_eq!(
            node.state.process_block(block).unwrap(),
            ChainStatus::Success
        );
    }
    assert_eq!(node.state.height(Branch::Confirmed), 10);
    assert_eq!(node.state.total_difficulty(Branch::Confirmed), 10);

    // Branch B blocks cannot connect until the branch overtakes.
    for block in &branch_b[..5] {
        assert_eq!(
            node.state.process_block(block).unwrap(),
            ChainStatus::Orphaned
        );
        assert_eq!(node.state.height(Branch::Confirmed), 10);
    }
    assert_eq!(
        node.state.process_block(&branch_b[5]).unwrap(),
        ChainStatus::Success
    );

    assert_eq!(node.state.height(Branch::Confirmed), 11);
    assert_eq!(node.state.height(Branch::Candidate), 11);
    assert_eq!(
        node.state.head_hash(Branch::Confirmed),
        branch_b[5].hash()
    );
    assert_eq!(node.state.total_difficulty(Branch::Confirmed), 11);

    // Branch A's outputs fell out of the unspent set; branch B's are in.
    for height in 6..=10u64 {
        assert!(!node.state.is_output_unspent(&commit(200 + height)).unwrap());
    }
    for height in 6..=11u64 {
        assert!(node.state.is_output_unspent(&commit(300 + height)).unwrap());
    }
    // The shared prefix stays unspent throughout.
    for height in 1..=5u64 {
        assert!(node.state.is_output_unspent(&commit(100 + height)).unwrap());
    }
}

#[test]
fn spend_then_reorg_restores_spent_output() {
    let node = new_node();
    let mut factory_a = BlockFactory::new(&node.params);

    let create = build_tx(&[], &[777], 0, 1);
    let block1 = factory_a.next_block(&[create]);

    let mut factory_b = BlockFactory::new(&node.params);
    factory_b.apply_existing(&block1);

    // Branch A spends the output at height 2.
    let spend = build_tx(&[777], &[888], 0, 1);
    let block2a = factory_a.next_block(&[spend]);

    // Branch B keeps it and grows heavier.
    let block2b = factory_b.next_block(&[build_tx(&[], &[901], 0, 1)]);
    let block3b = factory_b.next_block(&[build_tx(&[], &[902], 0, 1)]);

    for block in [&block1, &block2a] {
        assert_eq!(
            node.state.process_block(block).unwrap(),
            ChainStatus::Success
        );
    }
    assert!(!node.state.is_output_unspent(&commit(777)).unwrap());

    assert_eq!(
        node.state.process_block(&block2b).unwrap(),
        ChainStatus::Orphaned
    );
    assert_eq!(
        node.state.process_block(&block3b).unwrap(),
        ChainStatus::Success
    );
    assert_eq!(node.state.height(Branch::Confirmed), 3);
    assert!(node.state.is_output_unspent(&commit(777)).unwrap());
    assert!(!node.state.is_output_unspent(&commit(888)).unwrap());
}

#[test]
fn spending_unknown_output_is_rejected() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);

    // The shadow set must contain the output so the factory can build the
    // block; the node under test never sees it.
    let seed = build_tx(&[], &[4_000], 0, 1);
    let _seeded = factory.next_block(&[seed]);
    let spend = build_tx(&[4_000], &[4_001], 0, 1);
    let block2 = factory.next_block(&[spend]);

    // Skip block 1: the spend at height 2 orphans, and stays orphaned.
    assert_eq!(
        node.state.process_block(&block2).unwrap(),
        ChainStatus::Orphaned
    );
    assert_eq!(node.state.height(Branch::Confirmed), 0);
}
