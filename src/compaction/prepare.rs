// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{mint_workid, CompactAction, CompactRequest, CompactionWork, SplitScratch};
use crate::{
    kvset::KvsetHandle,
    tree::{node_index, Tree},
    Error, Result,
};
use std::{sync::Arc, time::Instant};

/// Stakes inputs and allocates the output descriptors for one job.
///
/// Returns `None` if the node has nothing eligible, which is a no-op
/// for the scheduler, not an error.
pub(crate) fn prepare(tree: &Tree, req: &CompactRequest) -> Result<Option<CompactionWork>> {
    if tree.cancel.is_stopped() {
        return Err(Error::Shutdown);
    }

    let workid = mint_workid();

    let mut state = tree.state.write().expect("lock is poisoned");

    let Some(node_idx) = node_index(&state, req.node_id) else {
        return Err(Error::Bug("no node with that id"));
    };

    let is_root = node_idx == 0;
    match req.action {
        CompactAction::Spill if !is_root => {
            return Err(Error::Invalid("only the root spills"));
        }
        CompactAction::Split if is_root => {
            return Err(Error::Invalid("the root spills instead of splitting"));
        }
        _ => {}
    }

    let node = state.nodes.get(node_idx).expect("index is valid");

    // One token job per node; concurrent spills share the root and only
    // claim the token around their structural updates
    let token_held = if req.action == CompactAction::Spill {
        false
    } else {
        if !node.shared.try_claim_token() {
            return Err(Error::Bug("compaction token already held"));
        }
        true
    };

    let release_on_bail = |node: &crate::tree::node::Node| {
        if token_held {
            node.shared.release_token();
        }
    };

    // Select inputs from the old end, skipping the contiguous run
    // already staked by earlier jobs
    let len = node.list.len();

    let mut skipped = 0;
    while skipped < len
        && node
            .list
            .get(len - 1 - skipped)
            .expect("index is valid")
            .workid()
            != 0
    {
        skipped += 1;
    }

    let avail = len - skipped;

    let want = match req.action {
        CompactAction::Split => avail,
        _ if req.kvset_cnt == 0 => avail,
        _ => req.kvset_cnt.min(avail),
    };

    let mut inputs: Vec<KvsetHandle> = Vec::with_capacity(want);

    // Oldest first while collecting; the window must stay contiguous
    for offset in 0..want {
        let kvset = node
            .list
            .get(len - 1 - skipped - offset)
            .expect("index is valid");
        if kvset.workid() != 0 {
            break;
        }
        inputs.push(kvset.clone());
    }

    if inputs.is_empty() {
        release_on_bail(node);
        log::trace!("node {} has nothing to compact", req.node_id);
        return Ok(None);
    }

    // Empty kvsets never exist in the tree, so min/max keys of every
    // input are well-defined
    debug_assert!(inputs.iter().all(|ks| ks.entry_count() > 0));

    let kvset_cnt = inputs.len();
    let dgen_lo = inputs.first().expect("at least one input").dgen();
    let dgen_hi = inputs.last().expect("at least one input").dgen();

    let next_older_compc = if skipped > 0 {
        Some(
            node.list
                .get(len - skipped)
                .expect("index is valid")
                .compc(),
        )
    } else {
        None
    };

    let drop_tombstones = req.action != CompactAction::Spill && skipped == 0;

    // newest first from here on
    inputs.reverse();

    let mut work = CompactionWork {
        workid,
        node_id: req.node_id,
        action: req.action,
        horizon: req.horizon,
        kvset_cnt,
        inputs,
        dgen_lo,
        dgen_hi,
        drop_tombstones,
        next_older_compc,
        carry_vbsets: Vec::new(),
        carry_valen: 0,
        carry_vwlen: 0,
        outs: Vec::new(),
        kvset_ids: Vec::new(),
        out_nodes: Vec::new(),
        out_edges: Vec::new(),
        first_spill: false,
        new_leaves: Vec::new(),
        commit_lists: Vec::new(),
        split: None,
        rspill: None,
        token_held,
        canceled: false,
        err: None,
        shared: node.shared.clone(),
        t_start: Instant::now(),
    };

    let n_outs = match req.action {
        CompactAction::KCompact | CompactAction::KvCompact => 1,

        CompactAction::Spill => {
            if state.route.is_empty() {
                // The leaves do not exist yet; this spill creates them,
                // which cannot overlap with another in-flight spill
                let in_flight = !work
                    .shared
                    .rspills
                    .lock()
                    .expect("lock is poisoned")
                    .is_empty();
                if in_flight {
                    release_on_bail(node);
                    return Err(Error::Invalid("concurrent spill while tree has no leaves"));
                }

                work.first_spill = true;
                work.out_nodes = (0..tree.params.fanout)
                    .map(|_| tree.journal.mint_node_id())
                    .collect();
                tree.params.fanout
            } else {
                for entry in state.route.iter() {
                    work.out_nodes.push(entry.node_id());
                    work.out_edges.push(entry.edge_key().clone());
                }
                work.out_nodes.len()
            }
        }

        CompactAction::Split => {
            let source_max_key = node.max_key().expect("node has kvsets");

            // Output j gets the left half of input j, output kvset_cnt + j
            // its right half; both carry the input's dgen and compc
            let mut dgens = Vec::with_capacity(2 * kvset_cnt);
            let mut compcs = Vec::with_capacity(2 * kvset_cnt);
            for _ in 0..2 {
                for kvset in &work.inputs {
                    dgens.push(kvset.dgen());
                    compcs.push(kvset.compc());
                }
            }

            work.split = Some(SplitScratch {
                split_key: None,
                source_max_key,
                dgens,
                compcs,
                purge_lists: work.inputs.iter().map(|ks| ks.purge_blocks()).collect(),
                left_node_id: tree.journal.mint_node_id(),
            });

            2 * kvset_cnt
        }
    };

    if req.action == CompactAction::KCompact {
        // K-compact keeps every input vblock; only kblocks are rewritten
        for kvset in work.inputs.iter().rev() {
            work.carry_vbsets.extend(kvset.vbsets().iter().cloned());
            work.carry_valen += kvset.stats().valen;
            work.carry_vwlen += kvset.stats().vwlen;
        }
    }

    work.outs = (0..n_outs).map(|_| None).collect();
    work.commit_lists = (0..n_outs).map(|_| Vec::new()).collect();
    work.kvset_ids = (0..n_outs).map(|_| tree.journal.mint_kvset_id()).collect();

    // Stake the window
    for kvset in &work.inputs {
        let staked = kvset.reserve(workid);
        assert!(staked, "kvset already staked by another job");
    }
    work.shared.job_begin(kvset_cnt);

    // Spills join the in-flight FIFO here, under the same write lock
    // that staked the window, so queue order equals window order
    if req.action == CompactAction::Spill {
        let slot = Arc::new(super::rspill::SpillSlot::default());
        work.shared
            .rspills
            .lock()
            .expect("lock is poisoned")
            .push_back(slot.clone());
        work.rspill = Some(slot);
    }

    log::debug!(
        "prepared {:?} on node {}: {} inputs, dgens [{}, {}], workid {}",
        req.action,
        req.node_id,
        kvset_cnt,
        dgen_lo,
        dgen_hi,
        workid,
    );

    drop(state);
    Ok(Some(work))
}
