// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{samp, Tree};
use crate::{
    kvset::{builder::BuiltKvset, Kvset},
    Error, Result, SeqNo, UserKey,
};

impl Tree {
    /// Attaches a freshly built kvset at the head of the root list.
    ///
    /// `max_ptomb` carries the largest prefix tombstone of the batch;
    /// capped trees remember it as the eviction high-water mark.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for an empty kvset, `Shutdown` when the tree is
    /// being torn down.
    #[allow(clippy::cast_possible_wrap)]
    pub fn ingest(
        &self,
        built: BuiltKvset,
        max_ptomb: Option<(UserKey, SeqNo)>,
    ) -> Result<()> {
        if self.cancel.is_stopped() {
            return Err(Error::Shutdown);
        }
        if built.entry_count() == 0 {
            return Err(Error::Invalid("kvset may not be empty"));
        }

        let kvset_id = self.journal.mint_kvset_id();

        let (dr_alen, dr_wlen) = {
            let mut state = self.state.write().expect("lock is poisoned");

            let dgen = state.dgen_hwm + 1;
            let kvset = Kvset::open(kvset_id, dgen, 0, built, self.allocator.clone());

            log::trace!(
                "ingest kvset {kvset_id} dgen={dgen} ({} entries)",
                kvset.entry_count(),
            );

            let root = state.nodes.first_mut().ok_or(Error::Shutdown)?;
            root.push_head(kvset)?;
            state.dgen_hwm = dgen;

            if self.params.capped {
                if let Some((prefix, seqno)) = max_ptomb {
                    let newer = state
                        .capped
                        .ptomb
                        .as_ref()
                        .is_none_or(|(_, stored)| seqno > *stored);
                    if newer {
                        state.capped.ptomb = Some((prefix, seqno));
                    }
                }
            }

            let (pre, post) = samp::update_ingest(&mut state, 0, &self.rparams);

            // Ingest grows the root and never touches leaf totals
            debug_assert!(post.i_alen >= pre.i_alen);
            debug_assert!(post.r_wlen >= pre.r_wlen);
            debug_assert_eq!(pre.l_alen, post.l_alen);
            debug_assert_eq!(pre.l_good, post.l_good);

            (
                post.r_alen as i64 - pre.r_alen as i64,
                post.r_wlen as i64 - pre.r_wlen as i64,
            )
        };

        self.scheduler.notify_ingest(dr_alen, dr_wlen);

        Ok(())
    }
}
