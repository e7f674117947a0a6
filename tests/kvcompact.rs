mod common;

use common::{assert_samp_consistent, fixture, ingest_values};
use kvset_tree::{
    CompactAction, CompactRequest, InternalValue, TreeParams, ValueType,
};
use test_log::test;

const LEAF: u64 = 7;

fn leaf_fixture() -> common::Fixture {
    let fx = fixture(TreeParams {
        fanout: 4,
        ..Default::default()
    });
    fx.tree.restore_node(LEAF, "z".into()).unwrap();
    fx
}

fn insert_at_leaf(fx: &common::Fixture, dgen: u64, entries: Vec<InternalValue>) {
    let mut entries = entries;
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    let mut builder = fx.tree.kvset_builder();
    for entry in entries {
        builder.add(entry).unwrap();
    }
    let built = builder.finish().unwrap().unwrap();

    fx.tree
        .insert_kvset_at(LEAF, dgen, dgen, 0, built)
        .unwrap();
}

#[test]
fn kvcompact_drops_tombstones_at_tail() {
    let fx = leaf_fixture();

    // Oldest kvset carries the tombstone shadowing the live value in
    // the middle one
    insert_at_leaf(
        &fx,
        1,
        vec![
            InternalValue::new_tombstone("k", 9),
            InternalValue::from_components("x", "keep", 1, ValueType::Value),
        ],
    );
    insert_at_leaf(
        &fx,
        2,
        vec![InternalValue::from_components("k", "dead", 5, ValueType::Value)],
    );
    insert_at_leaf(
        &fx,
        3,
        vec![InternalValue::from_components("y", "keep", 2, ValueType::Value)],
    );

    fx.tree
        .compact(&CompactRequest {
            node_id: LEAF,
            action: CompactAction::KvCompact,
            kvset_cnt: 0,
            horizon: u64::MAX,
        })
        .unwrap();

    let view = fx.tree.view();
    let leaf = view.nodes.iter().find(|n| n.node_id == LEAF).unwrap();
    assert_eq!(1, leaf.kvsets.len());
    assert_eq!(3, leaf.kvsets.first().unwrap().dgen());

    // "k" is gone at every seqno
    assert_eq!(None, fx.tree.get(b"k", u64::MAX).unwrap());
    assert_eq!(None, fx.tree.get(b"k", 5).unwrap());

    assert_eq!(Some("keep".into()), fx.tree.get(b"x", 9).unwrap());
    assert_eq!(Some("keep".into()), fx.tree.get(b"y", 9).unwrap());

    assert_samp_consistent(&fx.tree);
}

#[test]
fn kvcompact_rewrites_value_blocks() {
    let fx = leaf_fixture();

    insert_at_leaf(
        &fx,
        1,
        vec![InternalValue::from_components("a", "one", 1, ValueType::Value)],
    );
    insert_at_leaf(
        &fx,
        2,
        vec![InternalValue::from_components("b", "two", 2, ValueType::Value)],
    );

    let view = fx.tree.view();
    let input_blocks: Vec<_> = view
        .nodes
        .iter()
        .find(|n| n.node_id == LEAF)
        .unwrap()
        .kvsets
        .iter()
        .flat_map(|ks| {
            let mut blocks = ks.vblocks();
            blocks.extend(ks.kblks());
            blocks.push(ks.hblk());
            blocks
        })
        .collect();
    drop(view);

    fx.tree
        .compact(&CompactRequest {
            node_id: LEAF,
            action: CompactAction::KvCompact,
            kvset_cnt: 0,
            horizon: 0,
        })
        .unwrap();

    // All input blocks retired, output blocks are fresh and committed
    assert!(input_blocks.iter().all(|&b| fx.allocator.is_deleted(b)));

    let view = fx.tree.view();
    let merged = view
        .nodes
        .iter()
        .find(|n| n.node_id == LEAF)
        .unwrap()
        .kvsets
        .first()
        .unwrap()
        .clone();

    assert!(fx.allocator.is_committed(merged.hblk()));
    assert!(merged.vblocks().iter().all(|&b| fx.allocator.is_committed(b)));
    assert!(merged.vblocks().iter().all(|&b| !fx.allocator.is_deleted(b)));
}

#[test]
fn samp_refresh_is_idempotent() {
    let fx = leaf_fixture();

    insert_at_leaf(
        &fx,
        1,
        vec![InternalValue::from_components("a", "one", 1, ValueType::Value)],
    );
    ingest_values(&fx.tree, &[("r", "root", 1)]);

    let first = fx.tree.samp_refresh(LEAF).unwrap();
    let stats_first = fx.tree.node_stats(LEAF).unwrap();

    let second = fx.tree.samp_refresh(LEAF).unwrap();
    let stats_second = fx.tree.node_stats(LEAF).unwrap();

    assert_eq!(first, second);
    assert_eq!(stats_first.uniq_keys, stats_second.uniq_keys);
    assert_eq!(stats_first.kclen, stats_second.kclen);
    assert_eq!(stats_first.vclen, stats_second.vclen);
    assert_eq!(stats_first.pcap, stats_second.pcap);
    assert_eq!(stats_first.alen(), stats_second.alen());

    assert_samp_consistent(&fx.tree);
}

#[test]
fn view_is_reference_neutral() {
    let fx = leaf_fixture();
    ingest_values(&fx.tree, &[("a", "x", 1)]);

    let probe = fx.tree.view();
    let kvset = probe.nodes.first().unwrap().kvsets.first().unwrap().clone();
    drop(probe);

    let before = std::sync::Arc::strong_count(&kvset);

    let view = fx.tree.view();
    assert!(std::sync::Arc::strong_count(&kvset) > before);
    drop(view);

    assert_eq!(before, std::sync::Arc::strong_count(&kvset));
}
