// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    apply, prepare,
    stream::CompactionStream,
    CompactAction, CompactRequest, CompactionWork,
};
use crate::{
    binary_search::partition_point,
    health,
    journal::{JournalTx, KvsetMeta, INVALID_INGEST_ID},
    kvset::{
        builder::{BuiltKvset, KvsetBuilder},
        Kvset, KvsetHandle,
    },
    merge::{BoxedIterator, Merger},
    mblock::MblockId,
    tree::{node_index, Tree},
    Error, InternalValue, NodeId, Result, UserKey,
};
use std::sync::atomic::Ordering;

impl Tree {
    /// Runs one compaction job to completion on the calling thread:
    /// stake, build, journal commit, tree update.
    ///
    /// A node with nothing eligible is a no-op. Spills go through the
    /// root's in-flight FIFO so concurrent spill effects land in
    /// submission order.
    ///
    /// # Errors
    ///
    /// Returns `Shutdown` on cancellation or a wedged root, `NoSpace`
    /// when the media fills up, `Io` on journal failures.
    pub fn compact(&self, req: &CompactRequest) -> Result<()> {
        if req.action == CompactAction::Spill {
            let Some(handle) = self.spill_begin(req)? else {
                return Ok(());
            };
            self.spill_build(&handle);
            return self.spill_finish(handle);
        }

        let Some(mut work) = prepare::prepare(self, req)? else {
            return Ok(());
        };

        let result = build(self, &mut work).and_then(|()| commit(self, &mut work));

        match result {
            Ok(()) => {
                work.shared.release_token();
                work.token_held = false;

                log::debug!(
                    "{:?} on node {} done in {:?}",
                    req.action,
                    req.node_id,
                    work.t_start.elapsed(),
                );
                Ok(())
            }
            Err(e) => {
                if self.cancel.is_stopped() {
                    work.canceled = true;
                }
                cleanup(self, &mut work, &e);
                Err(e)
            }
        }
    }
}

/// The build phase: merges the staked inputs into the output kvsets.
pub(crate) fn build(tree: &Tree, work: &mut CompactionWork) -> Result<()> {
    if tree.cancel.is_stopped() {
        return Err(Error::Shutdown);
    }

    match work.action {
        CompactAction::KCompact => build_kcompact(tree, work)?,
        CompactAction::KvCompact => build_kvcompact(tree, work)?,
        CompactAction::Spill => build_spill(tree, work)?,
        CompactAction::Split => build_split(tree, work)?,
    }

    // Owned output blocks, per output: the split commit lists and the
    // cleanup target
    work.commit_lists = work
        .outs
        .iter()
        .map(|out| out.as_ref().map(BuiltKvset::owned_block_ids).unwrap_or_default())
        .collect();

    Ok(())
}

fn input_iters(work: &CompactionWork) -> Vec<BoxedIterator<'static>> {
    work.inputs
        .iter()
        .map(|ks| Box::new(ks.iter()) as BoxedIterator<'static>)
        .collect()
}

// Rewrites key blocks only; the inputs' value blocks are carried into
// the output untouched.
fn build_kcompact(tree: &Tree, work: &mut CompactionWork) -> Result<()> {
    let merger = Merger::new(input_iters(work));
    let stream = CompactionStream::new(
        merger,
        work.horizon,
        work.drop_tombstones,
        tree.cancel.clone(),
    );

    let mut builder = tree.kvset_builder().keys_only();
    for item in stream {
        builder.add(item?)?;
    }

    if let Some(mut built) = builder.finish()? {
        built.vbsets = work.carry_vbsets.clone();
        built.carried_vbsets = true;
        built.stats.valen = work.carry_valen;
        built.stats.vwlen = work.carry_vwlen;

        *work.outs.first_mut().expect("one output slot") = Some(built);
    } else {
        log::debug!(
            "k-compact on node {} produced no kblocks, skipping commit",
            work.node_id,
        );
    }

    Ok(())
}

fn build_kvcompact(tree: &Tree, work: &mut CompactionWork) -> Result<()> {
    let merger = Merger::new(input_iters(work));
    let stream = CompactionStream::new(
        merger,
        work.horizon,
        work.drop_tombstones,
        tree.cancel.clone(),
    );

    let mut builder = tree.kvset_builder();
    for item in stream {
        builder.add(item?)?;
    }

    *work.outs.first_mut().expect("one output slot") = builder.finish()?;
    Ok(())
}

fn route_bucket(edges: &[UserKey], key: &[u8]) -> usize {
    let idx = partition_point(edges, |edge| &**edge < key);
    if idx == edges.len() {
        idx.saturating_sub(1)
    } else {
        idx
    }
}

// Merges the root inputs into one stream per destination leaf. On the
// very first spill the leaves do not exist yet; the stream is cut into
// fanout count-balanced buckets at user-key boundaries and the bucket
// max keys become the new leaves' edge keys.
fn build_spill(tree: &Tree, work: &mut CompactionWork) -> Result<()> {
    let merger = Merger::new(input_iters(work));
    let stream = CompactionStream::new(
        merger,
        work.horizon,
        work.drop_tombstones,
        tree.cancel.clone(),
    );

    let n_outs = work.outs.len();
    let mut builders: Vec<KvsetBuilder> =
        (0..n_outs).map(|_| tree.kvset_builder()).collect();

    if work.first_spill {
        let entries = stream.collect::<Result<Vec<InternalValue>>>()?;
        let target = entries.len().div_ceil(n_outs).max(1);

        let mut bucket = 0usize;
        let mut count = 0usize;
        let mut last_key: Option<UserKey> = None;

        let mut iter = entries.into_iter().peekable();
        while let Some(item) = iter.next() {
            let key = item.key.user_key.clone();

            builders
                .get_mut(bucket)
                .expect("bucket index is valid")
                .add(item)?;
            count += 1;

            let boundary = count >= target
                && bucket + 1 < n_outs
                && iter.peek().is_some_and(|next| next.key.user_key != key);

            if boundary {
                work.new_leaves.push((bucket, key));
                bucket += 1;
                count = 0;
            } else {
                last_key = Some(key);
            }
        }

        if count > 0 {
            let key = last_key.expect("bucket has entries");
            work.new_leaves.push((bucket, key));
        }
    } else {
        for item in stream {
            let item = item?;
            let bucket = route_bucket(&work.out_edges, &item.key.user_key);

            builders
                .get_mut(bucket)
                .expect("bucket index is valid")
                .add(item)?;
        }
    }

    for (i, builder) in builders.into_iter().enumerate() {
        *work.outs.get_mut(i).expect("output slot exists") = builder.finish()?;
    }

    Ok(())
}

// Range-partitions each input around the chosen split key: the first
// kvset_cnt outputs form the left halves, the rest the right halves.
fn build_split(tree: &Tree, work: &mut CompactionWork) -> Result<()> {
    let split_key = choose_split_key(tree, work)?;

    let cnt = work.kvset_cnt;

    for j in 0..cnt {
        let input = work.inputs.get(j).expect("input index is valid").clone();

        let mut left = tree.kvset_builder();
        let mut right = tree.kvset_builder();

        for item in input.iter() {
            let item = item?;
            if item.key.user_key <= split_key {
                left.add(item)?;
            } else {
                right.add(item)?;
            }
        }

        *work.outs.get_mut(j).expect("left slot exists") = left.finish()?;
        *work.outs.get_mut(cnt + j).expect("right slot exists") = right.finish()?;
    }

    work.split.as_mut().expect("split scratch exists").split_key = Some(split_key);
    Ok(())
}

// The median key of the merged input stream, constrained to be
// strictly below the max key so the right half is never empty.
fn choose_split_key(tree: &Tree, work: &CompactionWork) -> Result<UserKey> {
    let mut keys: Vec<UserKey> = Vec::new();

    for (n, item) in Merger::new(input_iters(work)).enumerate() {
        if n % 1_024 == 0 && tree.cancel.is_stopped() {
            return Err(Error::Shutdown);
        }
        keys.push(item?.key.user_key);
    }

    let max = keys.last().expect("inputs are not empty").clone();

    let median = keys.get(keys.len() / 2).expect("median index is valid");
    if *median < max {
        return Ok(median.clone());
    }

    // Median collides with the max: fall back to the largest key below it
    let below = partition_point(&keys, |k| *k < max);
    if below == 0 {
        return Err(Error::Invalid("node cannot split around a single key"));
    }

    Ok(keys
        .get(below - 1)
        .expect("index below partition point")
        .clone())
}

/// The commit phase: journals the adds and deletes, commits the output
/// blocks, opens the outputs and installs them into the tree.
pub(crate) fn commit(tree: &Tree, work: &mut CompactionWork) -> Result<()> {
    if tree.cancel.is_stopped() {
        return Err(Error::Shutdown);
    }

    let live: Vec<usize> = work
        .outs
        .iter()
        .enumerate()
        .filter_map(|(i, out)| out.as_ref().map(|_| i))
        .collect();

    // A k-compact whose keys all tombstoned away: no adds, and the
    // inputs' vblocks must not be kept either
    let kcompact_skip = work.action == CompactAction::KCompact && live.is_empty();
    let keep_vblocks = work.action == CompactAction::KCompact && !kcompact_skip;

    let mut txn =
        tree.journal
            .txstart(INVALID_INGEST_ID, work.horizon, live.len(), work.kvset_cnt)?;

    match commit_records(tree, work, &live, txn.as_mut()) {
        Ok(opened) => {
            match work.action {
                CompactAction::KCompact | CompactAction::KvCompact => {
                    let output = opened.into_iter().next().flatten();
                    apply::apply_compact(tree, work, output, keep_vblocks);
                }
                CompactAction::Spill => apply::apply_spill(tree, work, opened),
                CompactAction::Split => apply::apply_split(tree, work, opened),
            }
            Ok(())
        }
        Err(e) => {
            if let Err(nak_err) = txn.nak() {
                log::error!("journal nak failed: {nak_err}");
            }
            Err(e)
        }
    }
}

// Everything between transaction open and tree update; every failure
// here naks the transaction in the caller.
fn commit_records(
    tree: &Tree,
    work: &mut CompactionWork,
    live: &[usize],
    txn: &mut dyn JournalTx,
) -> Result<Vec<Option<KvsetHandle>>> {
    let cnt = work.kvset_cnt;

    // Spill seed boost needs to know destination emptiness, evaluated
    // now that every earlier spill in the queue has committed
    let dest_empty: Vec<bool> = if work.action == CompactAction::Spill {
        if work.first_spill {
            vec![true; work.outs.len()]
        } else {
            let state = tree.state.read().expect("lock is poisoned");
            work.out_nodes
                .iter()
                .map(|&id| {
                    node_index(&state, id)
                        .and_then(|idx| state.nodes.get(idx))
                        .is_none_or(|node| node.list.is_empty())
                })
                .collect()
        }
    } else {
        Vec::new()
    };

    let mut cookies = Vec::with_capacity(live.len());
    let mut dgens = vec![0u64; work.outs.len()];
    let mut compcs = vec![0u32; work.outs.len()];

    for &i in live {
        let out = work.outs.get(i).and_then(Option::as_ref).expect("live output");

        let dgen = match work.action {
            CompactAction::Split => *work
                .split
                .as_ref()
                .expect("split scratch exists")
                .dgens
                .get(i)
                .expect("per-output dgen exists"),
            _ => work.dgen_hi,
        };

        let dest: NodeId = match work.action {
            CompactAction::Spill => *work.out_nodes.get(i).expect("destination exists"),
            CompactAction::Split => {
                let scratch = work.split.as_ref().expect("split scratch exists");
                if i < cnt {
                    scratch.left_node_id
                } else {
                    work.node_id
                }
            }
            _ => work.node_id,
        };

        let compc = derive_compc(tree, work, i, out, &dest_empty);

        let vblks: Vec<MblockId> = out
            .vbsets
            .iter()
            .flat_map(|set| set.blocks().iter().copied())
            .collect();

        let meta = KvsetMeta {
            kvset_id: *work.kvset_ids.get(i).expect("kvset id exists"),
            node_id: dest,
            dgen,
            compc,
            hblk: out.hblk,
            kblks: out.kblks.clone(),
            vblks,
        };

        cookies.push(txn.record_kvset_add(tree.cnid, &meta)?);

        *dgens.get_mut(i).expect("index is valid") = dgen;
        *compcs.get_mut(i).expect("index is valid") = compc;
    }

    // Commit the blocks: splits per output, everything else in bulk
    if work.action == CompactAction::Split {
        for &i in live {
            tree.allocator
                .commit(work.commit_lists.get(i).expect("commit list exists"))?;
        }
    } else {
        let bulk: Vec<MblockId> = live
            .iter()
            .flat_map(|&i| {
                work.commit_lists
                    .get(i)
                    .expect("commit list exists")
                    .iter()
                    .copied()
            })
            .collect();
        tree.allocator.commit(&bulk)?;
    }

    // Open the outputs; a k-compact output already shares the inputs'
    // vblock sets
    let mut opened: Vec<Option<KvsetHandle>> = (0..work.outs.len()).map(|_| None).collect();
    for &i in live {
        let built = work
            .outs
            .get_mut(i)
            .expect("output slot exists")
            .take()
            .expect("live output");

        let kvset = Kvset::open(
            *work.kvset_ids.get(i).expect("kvset id exists"),
            *dgens.get(i).expect("index is valid"),
            *compcs.get(i).expect("index is valid"),
            built,
            tree.allocator.clone(),
        );

        *opened.get_mut(i).expect("index is valid") = Some(kvset);
    }

    for kvset in &work.inputs {
        txn.record_kvset_delete(tree.cnid, kvset.id())?;
    }

    for cookie in cookies {
        txn.ack_add(cookie)?;
    }

    Ok(opened)
}

fn derive_compc(
    tree: &Tree,
    work: &CompactionWork,
    out_idx: usize,
    out: &BuiltKvset,
    dest_empty: &[bool],
) -> u32 {
    match work.action {
        // Seeding an empty leaf with a bulky kvset defers rewriting of
        // monotonic-load regions
        CompactAction::Spill => {
            let rp = tree.rparams();
            let empty = dest_empty.get(out_idx).copied().unwrap_or(false);

            if empty
                && (out.kblk_count() > rp.seed_boost_kblks
                    || out.vblk_count() > rp.seed_boost_vblks)
            {
                rp.seed_boost
            } else {
                0
            }
        }

        CompactAction::Split => *work
            .split
            .as_ref()
            .expect("split scratch exists")
            .compcs
            .get(out_idx)
            .expect("per-output compc exists"),

        // Bump, unless the run already sits above its older neighbor
        CompactAction::KCompact | CompactAction::KvCompact => {
            let base = work
                .inputs
                .iter()
                .map(|ks| ks.compc())
                .max()
                .unwrap_or(0);

            match work.next_older_compc {
                Some(sibling) if sibling < base => base,
                _ => base + 1,
            }
        }
    }
}

/// Unwinds a failed job: releases the token and the staked inputs,
/// destroys the allocated output blocks and reports to health.
pub(crate) fn cleanup(tree: &Tree, work: &mut CompactionWork, err: &Error) {
    log::debug!(
        "cleanup after failed {:?} on node {}: {err}",
        work.action,
        work.node_id,
    );

    if work.token_held {
        work.shared.release_token();
        work.token_held = false;
    }

    for kvset in &work.inputs {
        kvset.release_reservation(work.workid);
    }
    work.shared.job_end(work.kvset_cnt);

    for list in &work.commit_lists {
        if list.is_empty() {
            continue;
        }
        if let Err(e) = tree.allocator.delete(list) {
            log::error!("output block delete failed during cleanup: {e}");
        }
    }

    if matches!(err, Error::NoSpace) {
        tree.nospace.store(true, Ordering::Release);
    }

    // Errors from canceled jobs stay out of the health channel
    if !work.canceled {
        health::report(&*tree.health, err);
    }
}
