// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Capped trees retain an append-mostly, time-bounded keyspace: instead
//! of compacting, the trimmer evicts expired kvsets from the tail of the
//! root list once every sequence number they contain fell behind the
//! eviction horizon.

use crate::{
    journal::INVALID_INGEST_ID,
    kvset::KvsetHandle,
    tree::{samp, Tree},
    Error, Result, SeqNo,
};

impl Tree {
    /// One trimmer tick: evicts the expired tail run of the root list.
    ///
    /// `seq_horizon` is the caller's retention cut-off; the remembered
    /// prefix-tombstone seqno lowers it further. Returns the number of
    /// kvsets trimmed.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` on a non-capped tree, `Io` when the journal
    /// rejects the delete transaction.
    pub fn capped_trim(&self, seq_horizon: SeqNo) -> Result<usize> {
        if !self.params.capped {
            return Err(Error::Invalid("tree is not capped"));
        }
        if self.cancel.is_stopped() {
            return Err(Error::Shutdown);
        }

        // Snapshot the candidates under the read lock
        let expired: Vec<KvsetHandle> = {
            let state = self.state.read().expect("lock is poisoned");

            let Some(root) = state.nodes.first() else {
                return Ok(0);
            };

            let (Some(tail_dgen), Some(_head_dgen)) = (root.tail_dgen(), root.head_dgen())
            else {
                return Ok(0);
            };

            let ptomb = state.capped.ptomb.clone();

            let horizon = ptomb
                .as_ref()
                .map_or(seq_horizon, |(_, seqno)| seq_horizon.min(*seqno));

            // Nothing moved and nothing newly expirable since last time
            if state.capped.last_tail_dgen == tail_dgen
                && state.capped.last_horizon == horizon
            {
                return Ok(0);
            }

            let mut expired = Vec::new();

            for kvset in root.list.iter().rev() {
                if kvset.seqno_max() >= horizon {
                    break;
                }

                let shadowed = match &ptomb {
                    None => true,
                    Some((prefix, _)) => prefix.as_ref() < kvset.max_key().as_ref(),
                };
                if !shadowed {
                    break;
                }

                expired.push(kvset.clone());
            }

            expired
        };

        if expired.is_empty() {
            let mut state = self.state.write().expect("lock is poisoned");
            remember_cursor(&mut state, seq_horizon);
            return Ok(0);
        }

        log::debug!(
            "capped trim: {} expired kvsets below horizon {seq_horizon}",
            expired.len(),
        );

        // Journal the deletes before touching the tree
        let mut txn =
            self.journal
                .txstart(INVALID_INGEST_ID, seq_horizon, 0, expired.len())?;

        let mut recorded = Ok(());
        for kvset in &expired {
            if let Err(e) = txn.record_kvset_delete(self.cnid, kvset.id()) {
                recorded = Err(e);
                break;
            }
        }

        if let Err(e) = recorded {
            if let Err(nak_err) = txn.nak() {
                log::error!("journal nak failed: {nak_err}");
            }

            // Cheap fallback reclaim: at least get the oldest value
            // pages out of the cache
            if let Some(oldest) = expired.first() {
                oldest.cache_evict_hint();
            }

            return Err(e);
        }

        // Splice the run out
        let trimmed = {
            let mut state = self.state.write().expect("lock is poisoned");

            let root = state.nodes.first_mut().expect("root exists");

            let mut trimmed = Vec::with_capacity(expired.len());
            for kvset in &expired {
                // A concurrent job may have raced the run away; stop at
                // the first mismatch
                let matches = root
                    .list
                    .back()
                    .is_some_and(|tail| tail.id() == kvset.id());
                if !matches {
                    break;
                }
                trimmed.push(root.list.pop_back().expect("tail is present"));
            }
            root.cgen += 1;

            samp::update_compact(&mut state, 0, &self.rparams);
            remember_cursor(&mut state, seq_horizon);

            trimmed
        };

        let n = trimmed.len();
        for kvset in trimmed {
            kvset.mark_for_delete(false);
        }

        Ok(n)
    }
}

fn remember_cursor(state: &mut crate::tree::TreeState, seq_horizon: SeqNo) {
    let horizon = state
        .capped
        .ptomb
        .as_ref()
        .map_or(seq_horizon, |(_, seqno)| seq_horizon.min(*seqno));

    state.capped.last_horizon = horizon;
    state.capped.last_tail_dgen = state
        .nodes
        .first()
        .and_then(crate::tree::node::Node::tail_dgen)
        .unwrap_or(0);
}
