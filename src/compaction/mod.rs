// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub(crate) mod apply;
pub(crate) mod prepare;
pub mod rspill;
pub(crate) mod stream;
pub(crate) mod worker;

use crate::{
    kvset::{builder::BuiltKvset, KvsetHandle},
    mblock::{Mbset, MblockId},
    tree::node::NodeShared,
    Error, KvsetId, NodeId, SeqNo, UserKey,
};
use std::{
    sync::{atomic::AtomicU64, Arc},
    time::Instant,
};

// Reservation stamps; 0 means unreserved
static NEXT_WORKID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn mint_workid() -> u64 {
    NEXT_WORKID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// Kind of compaction work
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactAction {
    /// Merge a run into one kvset, rewriting key blocks and carrying
    /// value blocks
    KCompact,

    /// Merge a run into one kvset, rewriting keys and values
    KvCompact,

    /// Rewrite root kvsets into per-leaf streams
    Spill,

    /// Partition a leaf's kvsets across a chosen split key into two nodes
    Split,
}

/// A scheduler's order to compact one node
#[derive(Clone, Debug)]
pub struct CompactRequest {
    /// Target node
    pub node_id: NodeId,

    /// What to do
    pub action: CompactAction,

    /// How many kvsets to take from the old end of the list (0 = all);
    /// splits always take the whole node
    pub kvset_cnt: usize,

    /// Seqno below which shadowed versions and droppable tombstones
    /// may vanish
    pub horizon: SeqNo,
}

/// Split-specific scratch state
pub(crate) struct SplitScratch {
    /// Chosen during the build phase
    pub split_key: Option<UserKey>,

    /// Source node's actual max key, captured under token before the build
    pub source_max_key: UserKey,

    /// Per-output dgen (carried from the contributing input)
    pub dgens: Vec<u64>,

    /// Per-output compc (carried from the contributing input)
    pub compcs: Vec<u32>,

    /// Per-input block lists to purge once the inputs retire
    pub purge_lists: Vec<Vec<MblockId>>,

    /// Minted id for the new left node
    pub left_node_id: NodeId,
}

/// One in-flight compaction job
pub(crate) struct CompactionWork {
    pub workid: u64,
    pub node_id: NodeId,
    pub action: CompactAction,
    pub horizon: SeqNo,

    /// Number of staked inputs
    pub kvset_cnt: usize,

    /// Staked inputs, newest first; the last one is the mark
    pub inputs: Vec<KvsetHandle>,

    /// Dgen window spanned by the inputs
    pub dgen_lo: u64,
    pub dgen_hi: u64,

    /// The input window reaches the node's oldest kvset and the action
    /// is not a spill
    pub drop_tombstones: bool,

    /// Compc of the sibling just below the input window, if any
    pub next_older_compc: Option<u32>,

    /// K-compact: value-block sets preserved from the inputs
    pub carry_vbsets: Vec<Arc<Mbset>>,
    pub carry_valen: u64,
    pub carry_vwlen: u64,

    /// Outputs, one slot per destination; `None` = nothing for that slot
    pub outs: Vec<Option<BuiltKvset>>,

    /// Minted kvset ids, aligned with `outs`
    pub kvset_ids: Vec<KvsetId>,

    /// Spill: destination node per output, aligned with `outs`
    pub out_nodes: Vec<NodeId>,

    /// Spill routing snapshot: destination edge keys, aligned with
    /// `out_nodes` (empty on the first spill)
    pub out_edges: Vec<UserKey>,

    /// This spill creates the leaves (route map was empty)
    pub first_spill: bool,

    /// First spill: `(output index, edge key)` of each leaf to create
    pub new_leaves: Vec<(usize, UserKey)>,

    /// Block ids each live output owns, filled by the build phase;
    /// the split commit list and the cleanup target
    pub commit_lists: Vec<Vec<MblockId>>,

    pub split: Option<SplitScratch>,

    /// Spill: this job's slot in the root's in-flight FIFO, registered
    /// under the same write lock that staked the inputs
    pub rspill: Option<Arc<rspill::SpillSlot>>,

    pub token_held: bool,
    pub canceled: bool,
    pub err: Option<Error>,

    pub shared: Arc<NodeShared>,
    pub t_start: Instant,
}
