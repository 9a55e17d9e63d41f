mod common;

use std::sync::Arc;

use common::{build_tx, new_node, offset_bytes, BlockFactory};
use mwd_chainstate::{ApplyError, TxHashSet};
use mwd_primitives::block::Block;
use mwd_storage::memory::MemoryStore;
use tempfile::TempDir;

fn fresh_txhashset(
    node: &common::TestNode,
) -> (TempDir, TxHashSet<MemoryStore>) {
    let dir = TempDir::new().expect("tempdir");
    let set = TxHashSet::open(
        dir.path().join("txhashset"),
        Arc::new(MemoryStore::new()),
        &node.params.genesis,
    )
    .expect("txhashset");
    (dir, set)
}

fn apply(set: &mut TxHashSet<MemoryStore>, block: &Block) {
    set.apply_block(&block.header, &block.body)
        .expect("infra")
        .expect("block applies");
}

#[test]
fn roots_match_header_after_apply_and_rewind() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    let block1 = factory.next_block(&[build_tx(&[], &[11], 0, 1)]);
    let block2 = factory.next_block(&[build_tx(&[11], &[12, 13], 2, 1)]);

    let (_dir, mut set) = fresh_txhashset(&node);
    apply(&mut set, &block1);
    apply(&mut set, &block2);

    let roots = set.roots().unwrap();
    assert_eq!(roots.output_root, block2.header.output_root);
    assert_eq!(roots.rangeproof_root, block2.header.rangeproof_root);
    assert_eq!(roots.kernel_root, block2.header.kernel_root);
    assert_eq!(roots.output_mmr_size, block2.header.output_mmr_size);
    assert_eq!(roots.kernel_mmr_size, block2.header.kernel_mmr_size);

    set.rewind(&block1.header).unwrap();
    let roots = set.roots().unwrap();
    assert_eq!(roots.output_root, block1.header.output_root);
    assert_eq!(roots.rangeproof_root, block1.header.rangeproof_root);
    assert_eq!(roots.kernel_root, block1.header.kernel_root);

    // Rewind is idempotent for the same target.
    set.rewind(&block1.header).unwrap();
    assert_eq!(set.roots().unwrap().output_root, block1.header.output_root);

    // The spend was undone and the replacement outputs are gone.
    assert!(set.is_unspent(&common::commit(11)).unwrap());
    assert!(!set.is_unspent(&common::commit(12)).unwrap());
}

#[test]
fn root_mismatch_rolls_back_cleanly() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    let block1 = factory.next_block(&[build_tx(&[], &[21], 0, 1)]);
    let mut block2 = factory.next_block(&[build_tx(&[], &[22], 0, 1)]);
    block2.header.output_root = [0xEE; 32];

    let (_dir, mut set) = fresh_txhashset(&node);
    apply(&mut set, &block1);
    let before = set.roots().unwrap();

    let verdict = set.apply_block(&block2.header, &block2.body).unwrap();
    assert_eq!(verdict, Err(ApplyError::RootMismatch));
    assert_eq!(set.roots().unwrap(), before);
    assert!(!set.is_unspent(&common::commit(22)).unwrap());
}

#[test]
fn double_spend_within_chain_is_rejected() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    let block1 = factory.next_block(&[build_tx(&[], &[31], 0, 1)]);
    let block2 = factory.next_block(&[build_tx(&[31], &[32], 0, 1)]);

    let (_dir, mut set) = fresh_txhashset(&node);
    apply(&mut set, &block1);
    apply(&mut set, &block2);

    // A second spend of the same output must fail on the bitmap.
    let mut respend = Block {
        header: block2.header.clone(),
        body: build_tx(&[31], &[33], 0, 1).body,
    };
    respend.header.height += 1;
    let verdict = set.apply_block(&respend.header, &respend.body).unwrap();
    assert_eq!(verdict, Err(ApplyError::AlreadySpent));
}

#[test]
fn full_validation_checks_sums_and_signatures() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    let block1 = factory.next_block(&[build_tx(&[], &[41], 5, 1)]);
    let block2 = factory.next_block(&[build_tx(&[41], &[42, 43], 7, 2)]);

    let (_dir, mut set) = fresh_txhashset(&node);
    apply(&mut set, &block1);
    apply(&mut set, &block2);

    assert_eq!(set.validate(&block2.header).unwrap(), Ok(()));

    // A wrong accumulated offset breaks the sum identity.
    let mut tampered = block2.header.clone();
    tampered.total_kernel_offset = offset_bytes(9);
    let verdict = set.validate(&tampered).unwrap();
    assert!(matches!(verdict, Err(ApplyError::Crypto(_))), "{verdict:?}");
}

#[test]
fn compaction_keeps_roots_and_unspent_lookups() {
    let node = new_node();
    let mut factory = BlockFactory::new(&node.params);
    let mut blocks = vec![factory.next_block(&[build_tx(&[], &[51], 0, 1)])];
    blocks.push(factory.next_block(&[build_tx(&[51], &[52], 0, 1)]));
    // Bury the spend beyond the regtest finality depth.
    for extra in 0..10u64 {
        blocks.push(factory.next_block(&[build_tx(&[], &[60 + extra], 0, 1)]));
    }

    let (_dir, mut set) = fresh_txhashset(&node);
    for block in &blocks {
        apply(&mut set, block);
    }
    let tip = &blocks.last().unwrap().header;
    let roots_before = set.roots().unwrap();

    set.compact(tip).unwrap();
    assert_eq!(set.roots().unwrap(), roots_before);
    assert!(!set.is_unspent(&common::commit(51)).unwrap());
    assert!(set.is_unspent(&common::commit(52)).unwrap());
    assert_eq!(set.validate(tip).unwrap(), Ok(()));
}
