// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{node_index, Tree};
use crate::{
    kvset::GetResult,
    Error, Result, SeqNo, UserValue,
};

/// Outcome of a prefix probe, sufficient to answer "does anything with
/// this prefix exist"
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    /// No live key carries the prefix
    NotFound,

    /// Exactly one live key carries the prefix
    One,

    /// More than one live key carries the prefix
    Multiple,
}

impl Tree {
    /// Point lookup: walks the root's kvset list newest to oldest, then
    /// the one leaf the route map resolves the key to. Descent depth is
    /// at most two nodes.
    ///
    /// Returns `None` for missing and deleted keys alike.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if the key violates the hashing policy.
    pub fn get(&self, key: &[u8], seqno: SeqNo) -> Result<Option<UserValue>> {
        self.get_hashed(key, seqno, None)
    }

    /// Point lookup reusing the caller's precomputed full-key hash.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if the key violates the hashing policy.
    pub fn get_hashed(
        &self,
        key: &[u8],
        seqno: SeqNo,
        precomputed: Option<u64>,
    ) -> Result<Option<UserValue>> {
        let hash = self.hasher.hash_with(key, precomputed)?;
        let pfx_len = self.params.pfx_len;

        let state = self.state.read().expect("lock is poisoned");

        let Some(root) = state.nodes.first() else {
            return Ok(None);
        };

        for kvset in &root.list {
            match kvset.get(key, hash, seqno, pfx_len) {
                GetResult::Found(value) => return Ok(Some(value)),
                GetResult::Tombstone => return Ok(None),
                GetResult::NotFound => {}
            }
        }

        let Some(leaf_id) = state.route.lookup(key) else {
            return Ok(None);
        };

        let leaf = node_index(&state, leaf_id)
            .and_then(|idx| state.nodes.get(idx))
            .ok_or(Error::Bug("route map names a missing node"))?;

        for kvset in &leaf.list {
            match kvset.get(key, hash, seqno, pfx_len) {
                GetResult::Found(value) => return Ok(Some(value)),
                GetResult::Tombstone => return Ok(None),
                GetResult::NotFound => {}
            }
        }

        Ok(None)
    }

    /// Prefix probe: same root-then-leaf descent, accumulating hits
    /// until a prefix tombstone shadows everything older or more than
    /// one hit answers the existence question.
    ///
    /// # Errors
    ///
    /// Returns `Bug` if the route map names a missing node.
    pub fn probe_prefix(&self, prefix: &[u8], seqno: SeqNo) -> Result<ProbeResult> {
        let state = self.state.read().expect("lock is poisoned");

        let mut hits = 0usize;

        let Some(root) = state.nodes.first() else {
            return Ok(ProbeResult::NotFound);
        };

        for kvset in &root.list {
            let step = kvset.probe_prefix(prefix, seqno);
            hits += step.hits;

            if step.ptomb || hits > 1 {
                return Ok(summarize(hits));
            }
        }

        if let Some(leaf_id) = state.route.lookup(prefix) {
            let leaf = node_index(&state, leaf_id)
                .and_then(|idx| state.nodes.get(idx))
                .ok_or(Error::Bug("route map names a missing node"))?;

            for kvset in &leaf.list {
                let step = kvset.probe_prefix(prefix, seqno);
                hits += step.hits;

                if step.ptomb || hits > 1 {
                    return Ok(summarize(hits));
                }
            }
        }

        Ok(summarize(hits))
    }
}

fn summarize(hits: usize) -> ProbeResult {
    match hits {
        0 => ProbeResult::NotFound,
        1 => ProbeResult::One,
        _ => ProbeResult::Multiple,
    }
}
