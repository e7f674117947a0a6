mod common;

use common::{assert_samp_consistent, fixture, fixture_with, ingest_entries};
use kvset_tree::{
    CompactAction, CompactRequest, InternalValue, RuntimeParams, TreeParams, ValueType,
    ROOT_NODE_ID,
};
use test_log::test;

fn spill_all() -> CompactRequest {
    CompactRequest {
        node_id: ROOT_NODE_ID,
        action: CompactAction::Spill,
        kvset_cnt: 0,
        horizon: 0,
    }
}

// 1000 keys uniformly spread over four prefix buckets
fn bucketed_entries() -> Vec<InternalValue> {
    let mut entries = Vec::new();
    for (bucket, prefix) in ["a", "b", "c", "d"].iter().enumerate() {
        for i in 0..250u32 {
            let key = format!("{prefix}{i:04}");
            entries.push(InternalValue::from_components(
                key.as_str(),
                "v",
                (bucket * 250 + i as usize + 1) as u64,
                ValueType::Value,
            ));
        }
    }
    entries
}

#[test]
fn spill_partitions_across_children() {
    let fx = fixture(TreeParams {
        fanout: 4,
        ..Default::default()
    });

    ingest_entries(&fx.tree, bucketed_entries());

    let hi = {
        let view = fx.tree.view();
        view.nodes.first().unwrap().kvsets.first().unwrap().dgen()
    };

    fx.tree.compact(&spill_all()).unwrap();

    let view = fx.tree.view();

    let root = view.nodes.first().unwrap();
    assert_eq!(0, root.kvsets.len());

    let leaves: Vec<_> = view.nodes.iter().skip(1).collect();
    assert_eq!(4, leaves.len());

    let mut total_keys = 0;
    for leaf in &leaves {
        assert_eq!(1, leaf.kvsets.len());
        let kvset = leaf.kvsets.first().unwrap();
        assert_eq!(hi, kvset.dgen());
        total_keys += kvset.entry_count();
    }
    assert_eq!(1_000, total_keys);

    // Count-balanced buckets over a uniform keyspace
    for leaf in &leaves {
        assert_eq!(250, leaf.kvsets.first().unwrap().entry_count());
    }

    let samp = fx.tree.samp();
    assert_eq!(0, samp.r_alen);
    assert_eq!(0, samp.i_alen);
    assert!(samp.l_alen > 0);
    assert_samp_consistent(&fx.tree);

    // Keys remain reachable through the leaves
    assert_eq!(Some("v".into()), fx.tree.get(b"a0000", u64::MAX).unwrap());
    assert_eq!(Some("v".into()), fx.tree.get(b"d0249", u64::MAX).unwrap());
    assert_eq!(None, fx.tree.get(b"zzz", u64::MAX).unwrap());
}

#[test]
fn spill_keeps_leaf_routing_consistent() {
    let fx = fixture(TreeParams {
        fanout: 4,
        ..Default::default()
    });

    ingest_entries(&fx.tree, bucketed_entries());
    fx.tree.compact(&spill_all()).unwrap();

    // Every non-root node owns exactly one route entry, and every key
    // resolves to the node that holds it
    let view = fx.tree.view();
    for leaf in view.nodes.iter().skip(1) {
        assert!(leaf.edge_key.is_some());

        for kvset in &leaf.kvsets {
            for entry in kvset.iter() {
                let entry = entry.unwrap();
                assert_eq!(
                    Some("v".into()),
                    fx.tree.get(&entry.key.user_key, u64::MAX).unwrap(),
                );
            }
        }
    }
}

#[test]
fn second_spill_stacks_on_leaf_heads() {
    let fx = fixture(TreeParams {
        fanout: 2,
        ..Default::default()
    });

    ingest_entries(
        &fx.tree,
        vec![
            InternalValue::from_components("a", "1", 1, ValueType::Value),
            InternalValue::from_components("m", "2", 2, ValueType::Value),
        ],
    );
    fx.tree.compact(&spill_all()).unwrap();

    // "A" sorts below the first edge, "n" beyond the last one and is
    // caught by the tail leaf
    ingest_entries(
        &fx.tree,
        vec![
            InternalValue::from_components("A", "3", 3, ValueType::Value),
            InternalValue::from_components("n", "4", 4, ValueType::Value),
        ],
    );
    fx.tree.compact(&spill_all()).unwrap();

    let view = fx.tree.view();
    assert_eq!(0, view.nodes.first().unwrap().kvsets.len());

    for leaf in view.nodes.iter().skip(1) {
        assert_eq!(2, leaf.kvsets.len());
        // Newer spill output sits above the older one
        assert!(leaf.kvsets.first().unwrap().dgen() > leaf.kvsets.last().unwrap().dgen());
    }

    for (key, value) in [("a", "1"), ("m", "2"), ("A", "3"), ("n", "4")] {
        assert_eq!(
            Some(value.into()),
            fx.tree.get(key.as_bytes(), u64::MAX).unwrap(),
        );
    }
}

#[test]
fn spill_seed_boost_applies_to_bulky_first_kvset() {
    // Tiny kblocks so each output crosses the kblock threshold
    let rparams = RuntimeParams {
        keys_per_kblock: 4,
        ..Default::default()
    };

    let fx = fixture_with(
        TreeParams {
            fanout: 4,
            ..Default::default()
        },
        rparams,
    );

    ingest_entries(&fx.tree, bucketed_entries());
    fx.tree.compact(&spill_all()).unwrap();

    let view = fx.tree.view();
    for leaf in view.nodes.iter().skip(1) {
        let kvset = leaf.kvsets.first().unwrap();
        assert!(kvset.kblk_count() > 2);
        assert_eq!(7, kvset.compc(), "seed boost lands on empty destinations");
    }
}

#[test]
fn spill_no_boost_below_thresholds() {
    let fx = fixture(TreeParams {
        fanout: 4,
        ..Default::default()
    });

    ingest_entries(&fx.tree, bucketed_entries());
    fx.tree.compact(&spill_all()).unwrap();

    let view = fx.tree.view();
    for leaf in view.nodes.iter().skip(1) {
        // 250 keys fit one kblock at default granularity
        assert_eq!(0, leaf.kvsets.first().unwrap().compc());
    }
}

#[test]
fn spill_boost_is_tunable() {
    let rparams = RuntimeParams {
        keys_per_kblock: 4,
        seed_boost: 11,
        ..Default::default()
    };

    let fx = fixture_with(
        TreeParams {
            fanout: 4,
            ..Default::default()
        },
        rparams,
    );

    ingest_entries(&fx.tree, bucketed_entries());
    fx.tree.compact(&spill_all()).unwrap();

    let view = fx.tree.view();
    for leaf in view.nodes.iter().skip(1) {
        assert_eq!(11, leaf.kvsets.first().unwrap().compc());
    }
}
