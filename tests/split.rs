mod common;

use common::{assert_samp_consistent, fixture};
use kvset_tree::{
    CompactAction, CompactRequest, Error, InternalValue, TreeParams, ValueType,
};
use test_log::test;

const LEAF: u64 = 9;

fn split_leaf() -> CompactRequest {
    CompactRequest {
        node_id: LEAF,
        action: CompactAction::Split,
        kvset_cnt: 0,
        horizon: 0,
    }
}

// A leaf whose stored edge key went stale: as the last route entry it
// caught keys far beyond its edge
fn overflowing_fixture() -> common::Fixture {
    let fx = fixture(TreeParams {
        fanout: 4,
        ..Default::default()
    });

    fx.tree.restore_node(LEAF, "m".into()).unwrap();

    for (dgen, keys) in [
        (1, vec!["n", "p", "r"]),
        (2, vec!["s", "t", "u"]),
        (3, vec!["c", "w", "z"]),
    ] {
        let mut builder = fx.tree.kvset_builder();
        let mut entries: Vec<_> = keys
            .iter()
            .map(|k| InternalValue::from_components(*k, *k, dgen, ValueType::Value))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        for entry in entries {
            builder.add(entry).unwrap();
        }
        let built = builder.finish().unwrap().unwrap();
        fx.tree.insert_kvset_at(LEAF, dgen, dgen, 0, built).unwrap();
    }

    fx
}

#[test]
fn split_partitions_leaf_around_split_key() {
    let fx = overflowing_fixture();

    let pre_split_max = fx.tree.node_min_max_key(LEAF).unwrap().1;
    assert_eq!(b"z", pre_split_max.as_ref());

    fx.tree.compact(&split_leaf()).unwrap();

    let view = fx.tree.view();
    assert_eq!(3, view.nodes.len());

    let right = view.nodes.iter().find(|n| n.node_id == LEAF).unwrap();
    let left = view
        .nodes
        .iter()
        .find(|n| n.node_id != LEAF && n.node_id != 0)
        .unwrap();

    let split_key = left.edge_key.clone().unwrap();

    // Left max <= split key <= right min
    let (_, left_max) = fx.tree.node_min_max_key(left.node_id).unwrap();
    let (right_min, right_max) = fx.tree.node_min_max_key(LEAF).unwrap();
    assert!(left_max <= split_key);
    assert!(split_key < right_min);

    // The stale last-entry edge grew to the actual pre-split max key
    assert_eq!(pre_split_max, right.edge_key.clone().unwrap());
    assert_eq!(pre_split_max, right_max);

    // Outputs carry their inputs' dgens, newest first in both halves
    for node in [left, right] {
        let dgens: Vec<_> = node.kvsets.iter().map(|ks| ks.dgen()).collect();
        let mut sorted = dgens.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(sorted, dgens);
        assert!(dgens.iter().all(|&d| (1..=3).contains(&d)));
    }

    // No keys orphaned: every key resolves through the route map
    for key in ["c", "n", "p", "r", "s", "t", "u", "w", "z"] {
        assert_eq!(
            Some(key.into()),
            fx.tree.get(key.as_bytes(), u64::MAX).unwrap(),
            "key {key} must stay reachable",
        );
    }

    assert_samp_consistent(&fx.tree);
}

#[test]
fn split_carries_compc_and_purges_inputs() {
    let fx = overflowing_fixture();

    let view = fx.tree.view();
    let input_blocks: Vec<_> = view
        .nodes
        .iter()
        .find(|n| n.node_id == LEAF)
        .unwrap()
        .kvsets
        .iter()
        .flat_map(|ks| {
            let mut blocks = vec![ks.hblk()];
            blocks.extend(ks.kblks());
            blocks.extend(ks.vblocks());
            blocks
        })
        .collect();
    let input_compcs: Vec<_> = view
        .nodes
        .iter()
        .find(|n| n.node_id == LEAF)
        .unwrap()
        .kvsets
        .iter()
        .map(|ks| (ks.dgen(), ks.compc()))
        .collect();
    drop(view);

    fx.tree.compact(&split_leaf()).unwrap();

    // Purge lists freed every input block
    assert!(input_blocks.iter().all(|&b| fx.allocator.is_deleted(b)));

    // compc carried per contributing input
    let view = fx.tree.view();
    for node in view.nodes.iter().skip(1) {
        for kvset in &node.kvsets {
            let carried = input_compcs
                .iter()
                .find(|(dgen, _)| *dgen == kvset.dgen())
                .map(|(_, compc)| *compc);
            assert_eq!(carried, Some(kvset.compc()));
        }
    }

    // Node is idle again afterwards
    assert_eq!(Some((0, 0)), fx.tree.node_busy(LEAF));
}

#[test]
fn split_rejects_single_key_node() {
    let fx = fixture(TreeParams {
        fanout: 4,
        ..Default::default()
    });

    fx.tree.restore_node(LEAF, "z".into()).unwrap();

    let mut builder = fx.tree.kvset_builder();
    builder
        .add(InternalValue::from_components("k", "v", 1, ValueType::Value))
        .unwrap();
    let built = builder.finish().unwrap().unwrap();
    fx.tree.insert_kvset_at(LEAF, 1, 1, 0, built).unwrap();

    assert!(matches!(
        fx.tree.compact(&split_leaf()),
        Err(Error::Invalid(_))
    ));

    // The failed job released its staking
    assert_eq!(Some((0, 0)), fx.tree.node_busy(LEAF));
    assert_eq!(Some("v".into()), fx.tree.get(b"k", 9).unwrap());
}

#[test]
fn root_never_splits() {
    let fx = fixture(TreeParams {
        fanout: 4,
        ..Default::default()
    });

    common::ingest_values(&fx.tree, &[("a", "x", 1), ("b", "y", 2)]);

    assert!(matches!(
        fx.tree.compact(&CompactRequest {
            node_id: 0,
            action: CompactAction::Split,
            kvset_cnt: 0,
            horizon: 0,
        }),
        Err(Error::Invalid(_))
    ));
}
