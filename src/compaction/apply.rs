// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Action-specific tree updates, the last step of a commit. Each
//! variant splices the retired inputs out under the write lock, installs
//! the new kvsets, recomputes samp, drops the node's busy accounting and
//! deletes the retired kvsets outside the lock.
//!
//! The journal already recorded this transition; a structural mismatch
//! found here is corruption and asserts fatally.

use super::CompactionWork;
use crate::{
    kvset::KvsetHandle,
    tree::{node::Node, node_index, samp, Tree},
};

/// Installs a k-compact or kv-compact result: the input run is replaced
/// in place by the single output (if any).
pub(crate) fn apply_compact(
    tree: &Tree,
    work: &mut CompactionWork,
    output: Option<KvsetHandle>,
    keep_vblocks: bool,
) {
    let retired = {
        let mut state = tree.state.write().expect("lock is poisoned");

        let idx = node_index(&state, work.node_id).expect("compacted node exists");
        let node = state.nodes.get_mut(idx).expect("index is valid");

        let pos = node
            .position_of_dgen(work.dgen_hi)
            .expect("input window is present");

        let window_tail = node
            .list
            .get(pos + work.kvset_cnt - 1)
            .expect("input window is contiguous");
        assert_eq!(
            work.dgen_lo,
            window_tail.dgen(),
            "input window no longer contiguous",
        );

        let retired: Vec<KvsetHandle> =
            node.list.drain(pos..pos + work.kvset_cnt).collect();

        if let Some(output) = output {
            node.list.insert(pos, output);
        }
        node.cgen += 1;

        #[cfg(debug_assertions)]
        node.assert_dgen_order();

        samp::update_compact(&mut state, idx, &tree.rparams);
        work.shared.job_end(work.kvset_cnt);

        retired
    };

    for kvset in retired {
        kvset.mark_for_delete(keep_vblocks);
    }
}

/// Installs a spill: every non-empty output lands at the head of its
/// destination leaf, the inputs leave the root's tail.
pub(crate) fn apply_spill(
    tree: &Tree,
    work: &mut CompactionWork,
    opened: Vec<Option<KvsetHandle>>,
) {
    // Structural updates share the root with other spills only through
    // the token
    while !work.shared.try_claim_token() {
        std::thread::yield_now();
    }

    let retired = {
        let mut state = tree.state.write().expect("lock is poisoned");

        // First spill: the destination leaves are created here, under
        // the same lock that installs their first kvsets
        for &(out_idx, ref edge_key) in &work.new_leaves {
            let node_id = *work.out_nodes.get(out_idx).expect("destination exists");

            let mut node = Node::new(node_id, tree.params.node_size_max);
            node.route_key = Some(edge_key.clone());
            node.cgen = 1;

            state
                .route
                .insert(edge_key.clone(), node_id)
                .expect("new leaf edge key is unique");
            state.nodes.push(node);
        }

        let mut leaf_idxs = Vec::new();

        for (i, output) in opened.into_iter().enumerate() {
            let Some(output) = output else {
                continue;
            };

            let node_id = *work.out_nodes.get(i).expect("destination exists");
            let leaf_idx = node_index(&state, node_id).expect("destination leaf exists");

            state
                .nodes
                .get_mut(leaf_idx)
                .expect("index is valid")
                .push_head(output)
                .expect("spill output dgen exceeds destination head");

            leaf_idxs.push(leaf_idx);
        }

        let root = state.nodes.first_mut().expect("root exists");

        assert_eq!(
            Some(work.dgen_lo),
            root.tail_dgen(),
            "spill completions must apply in submission order",
        );

        let mut retired = Vec::with_capacity(work.kvset_cnt);
        for _ in 0..work.kvset_cnt {
            let kvset = root.list.pop_back().expect("window is present");
            debug_assert!(kvset.dgen() <= work.dgen_hi);
            retired.push(kvset);
        }
        root.cgen += 1;

        samp::update_spill(&mut state, &leaf_idxs, &tree.rparams);
        work.shared.job_end(work.kvset_cnt);

        retired
    };

    work.shared.release_token();

    for kvset in retired {
        kvset.mark_for_delete(false);
    }
}

/// Installs a split: the source node keeps the right halves, a new left
/// node takes the left halves, and the route map gains the split key.
pub(crate) fn apply_split(
    tree: &Tree,
    work: &mut CompactionWork,
    opened: Vec<Option<KvsetHandle>>,
) {
    let cnt = work.kvset_cnt;
    let scratch = work.split.take().expect("split scratch exists");
    let split_key = scratch
        .split_key
        .clone()
        .expect("split key chosen during build");

    let retired = {
        let mut state = tree.state.write().expect("lock is poisoned");

        let src_idx = node_index(&state, work.node_id).expect("split node exists");

        let mut halves = opened.into_iter();
        let mut left: Vec<KvsetHandle> = halves.by_ref().take(cnt).flatten().collect();
        let mut right: Vec<KvsetHandle> = halves.flatten().collect();

        left.sort_by_key(|ks| std::cmp::Reverse(ks.dgen()));
        right.sort_by_key(|ks| std::cmp::Reverse(ks.dgen()));

        let src = state.nodes.get_mut(src_idx).expect("index is valid");
        let retired: Vec<KvsetHandle> = src.list.drain(..).collect();
        assert_eq!(cnt, retired.len(), "split consumes the whole node");

        src.list = right.into();
        src.cgen += 1;

        #[cfg(debug_assertions)]
        src.assert_dgen_order();

        // The last route entry catches keys beyond its edge, so a stale
        // edge at or below the split key must grow to the real max key
        // before the left node slots in above it
        if state.route.is_last(work.node_id) {
            let stale = state
                .route
                .edge_key(work.node_id)
                .is_some_and(|edge| *edge <= split_key);

            if stale {
                state
                    .route
                    .key_modify(work.node_id, scratch.source_max_key.clone())
                    .expect("source node has a route entry");
                state
                    .nodes
                    .get_mut(src_idx)
                    .expect("index is valid")
                    .route_key = Some(scratch.source_max_key.clone());
            }
        }

        let left_idx = if left.is_empty() {
            None
        } else {
            let mut node = Node::new(scratch.left_node_id, tree.params.node_size_max);
            node.list = left.into();
            node.cgen = 1;
            node.route_key = Some(split_key.clone());

            #[cfg(debug_assertions)]
            node.assert_dgen_order();

            state
                .route
                .insert(split_key.clone(), node.id)
                .expect("split key is a fresh edge");
            state.nodes.push(node);

            Some(state.nodes.len() - 1)
        };

        samp::update_compact(&mut state, src_idx, &tree.rparams);
        if let Some(left_idx) = left_idx {
            samp::update_compact(&mut state, left_idx, &tree.rparams);
        }

        work.shared.job_end(cnt);

        retired
    };

    // The purge lists travel with the retired kvsets so their blocks
    // are freed even though the kvsets themselves stay unmarked
    for (kvset, purge) in retired.into_iter().zip(scratch.purge_lists) {
        if let Err(e) = tree.allocator.delete(&purge) {
            log::error!("purge list delete failed for kvset {}: {e}", kvset.id());
        }
        drop(kvset);
    }
}
