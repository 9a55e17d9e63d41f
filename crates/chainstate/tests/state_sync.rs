mod common;

use common::{build_tx, commit, new_node, BlockFactory};
use mwd_chainstate::{Branch, ChainStatus};

#[test]
fn snapshot_round_trip_between_nodes() {
    // Source node builds a short chain with spends.
    let source = new_node();
    let mut factory = BlockFactory::new(&source.params);
    let mut headers = Vec::new();
    for step in 1..=4u64 {
        let tx = if step == 3 {
            build_tx(&[100 + 1], &[200 + step], 2, 1)
        } else {
            build_tx(&[], &[100 + step], 2, 1)
        };
        let block = factory.next_block(&[tx]);
        headers.push(block.header.clone());
        assert_eq!(
            source.state.process_block(&block).unwrap(),
            ChainStatus::Success
        );
    }

    let bundle = source._dir.path().join("snapshot.bundle");
    let (head_hash, head_height) = source.state.write_txhashset_snapshot(&bundle).unwrap();
    assert_eq!(head_height, 4);

    // Joining node has headers only.
    let joiner = new_node();
    assert_eq!(
        joiner.state.process_sync_headers(&headers).unwrap(),
        ChainStatus::Success
    );
    assert_eq!(joiner.state.height(Branch::Candidate), 4);
    assert_eq!(joiner.state.height(Branch::Confirmed), 0);

    assert_eq!(
        joiner.state.process_txhashset(head_hash, &bundle).unwrap(),
        ChainStatus::Success
    );
    assert_eq!(joiner.state.height(Branch::Confirmed), 4);
    assert_eq!(joiner.state.head_hash(Branch::Confirmed), head_hash);

    // The unspent set came across: 101 was spent at step 3, the rest live.
    assert!(!joiner.state.is_output_unspent(&commit(101)).unwrap());
    assert!(joiner.state.is_output_unspent(&commit(102)).unwrap());
    assert!(joiner.state.is_output_unspent(&commit(203)).unwrap());

    // The joiner keeps extending from the snapshot.
    let next = factory.next_block(&[build_tx(&[], &[500], 0, 1)]);
    assert_eq!(
        joiner.state.process_block(&next).unwrap(),
        ChainStatus::Success
    );
    assert_eq!(joiner.state.height(Branch::Confirmed), 5);
}

#[test]
fn corrupt_snapshot_is_rejected_and_state_survives() {
    let source = new_node();
    let mut factory = BlockFactory::new(&source.params);
    let mut headers = Vec::new();
    let mut blocks = Vec::new();
    for step in 1..=3u64 {
        let block = factory.next_block(&[build_tx(&[], &[300 + step], 0, 1)]);
        headers.push(block.header.clone());
        blocks.push(block.clone());
        assert_eq!(
            source.state.process_block(&block).unwrap(),
            ChainStatus::Success
        );
    }
    let bundle = source._dir.path().join("snapshot.bundle");
    let (head_hash, _) = source.state.write_txhashset_snapshot(&bundle).unwrap();

    // Flip one byte in the middle of the bundle.
    let mut bytes = std::fs::read(&bundle).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;
    std::fs::write(&bundle, &bytes).unwrap();

    let joiner = new_node();
    assert_eq!(
        joiner.state.process_sync_headers(&headers).unwrap(),
        ChainStatus::Success
    );
    let status = joiner.state.process_txhashset(head_hash, &bundle).unwrap();
    assert!(matches!(status, ChainStatus::Invalid(_)), "{status:?}");
    assert_eq!(joiner.state.height(Branch::Confirmed), 0);

    // The previous (genesis) txhashset is still the active one: block sync
    // from scratch still works.
    for block in &blocks {
        assert_eq!(
            joiner.state.process_block(block).unwrap(),
            ChainStatus::Success
        );
    }
    assert_eq!(joiner.state.height(Branch::Confirmed), 3);
}

#[test]
fn snapshot_for_unknown_header_is_orphaned() {
    let source = new_node();
    let mut factory = BlockFactory::new(&source.params);
    let block = factory.next_block(&[build_tx(&[], &[42], 0, 1)]);
    assert_eq!(
        source.state.process_block(&block).unwrap(),
        ChainStatus::Success
    );
    let bundle = source._dir.path().join("snapshot.bundle");
    let (head_hash, _) = source.state.write_txhashset_snapshot(&bundle).unwrap();

    let joiner = new_node();
    assert_eq!(
        joiner.state.process_txhashset(head_hash, &bundle).unwrap(),
        ChainStatus::Orphaned
    );
}
