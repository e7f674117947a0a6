// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::samp::{NodeStats, SampStats};
use crate::{
    compaction::rspill::SpillSlot, kvset::KvsetHandle, Error, NodeId, Result, UserKey,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Condvar, Mutex,
    },
};

/// Node id of the root
pub const ROOT_NODE_ID: NodeId = 0;

// Busy-counter layout: upper half counts active jobs, lower half
// counts kvsets staked by those jobs
const BUSY_JOB: u32 = 1 << 16;
const BUSY_KVSET_MASK: u32 = BUSY_JOB - 1;

/// Concurrency state of a node, shared with in-flight compaction jobs
///
/// Jobs hold an `Arc` to this rather than a reference to the node
/// itself, so a job survives arbitrary tree reshaping and re-resolves
/// the node by id whenever it needs to mutate it.
pub(crate) struct NodeShared {
    token: AtomicBool,
    busy: AtomicU32,

    /// Set after an unrecoverable spill failure; later spill commits
    /// short-circuit to shutdown
    pub(crate) wedged: AtomicBool,

    /// In-flight concurrent root spills, in submission order
    pub(crate) rspills: Mutex<VecDeque<Arc<SpillSlot>>>,
    pub(crate) rspill_cv: Condvar,
}

impl NodeShared {
    fn new() -> Self {
        Self {
            token: AtomicBool::new(false),
            busy: AtomicU32::new(0),
            wedged: AtomicBool::new(false),
            rspills: Mutex::new(VecDeque::new()),
            rspill_cv: Condvar::new(),
        }
    }

    /// Claims the exclusive compaction token.
    pub fn try_claim_token(&self) -> bool {
        self.token
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the compaction token.
    pub fn release_token(&self) {
        let prev = self.token.swap(false, Ordering::AcqRel);
        debug_assert!(prev, "token released while not held");
    }

    /// Accounts a starting job and its staked kvsets.
    pub fn job_begin(&self, kvset_cnt: usize) {
        debug_assert!(kvset_cnt < BUSY_JOB as usize);
        #[allow(clippy::cast_possible_truncation)]
        self.busy
            .fetch_add(BUSY_JOB + kvset_cnt as u32, Ordering::AcqRel);
    }

    /// Accounts a finished job.
    pub fn job_end(&self, kvset_cnt: usize) {
        #[allow(clippy::cast_possible_truncation)]
        let prev = self
            .busy
            .fetch_sub(BUSY_JOB + kvset_cnt as u32, Ordering::AcqRel);
        debug_assert!(prev >= BUSY_JOB, "busy counter underflow");
    }

    /// Returns the number of active jobs.
    pub fn active_jobs(&self) -> u32 {
        self.busy.load(Ordering::Acquire) / BUSY_JOB
    }

    /// Returns the number of staked kvsets.
    pub fn reserved_kvsets(&self) -> u32 {
        self.busy.load(Ordering::Acquire) & BUSY_KVSET_MASK
    }

    pub fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::Acquire)
    }
}

/// One tree node: an ordered list of kvsets plus statistics
///
/// The list is newest-first; dgens are unique and strictly decreasing
/// from head to tail. Structural access is guarded by the tree's
/// read-mostly lock, not by the node itself.
pub struct Node {
    pub(crate) id: NodeId,

    /// Front = newest (highest dgen)
    pub(crate) list: VecDeque<KvsetHandle>,

    /// Rolled-up kvset statistics
    pub(crate) ns: NodeStats,

    /// This node's share of the tree-wide sampling record
    pub(crate) samp: SampStats,

    /// Highest dgen already folded into `ns` by incremental updates
    pub(crate) samp_dgen: u64,

    /// Change generation, bumped on any mutation
    pub(crate) cgen: u64,

    /// Size threshold feeding `pcap` and split decisions
    pub(crate) split_size: u64,

    /// Edge key of this node's route entry (leaves only)
    pub(crate) route_key: Option<UserKey>,

    pub(crate) shared: Arc<NodeShared>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node#{}({} kvsets)", self.id, self.list.len())
    }
}

impl Node {
    pub(crate) fn new(id: NodeId, split_size: u64) -> Self {
        Self {
            id,
            list: VecDeque::new(),
            ns: NodeStats::default(),
            samp: SampStats::default(),
            samp_dgen: 0,
            cgen: 0,
            split_size,
            route_key: None,
            shared: Arc::new(NodeShared::new()),
        }
    }

    /// Returns `true` for the root node.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.id == ROOT_NODE_ID
    }

    /// Returns the dgen of the newest kvset, if any.
    #[must_use]
    pub fn head_dgen(&self) -> Option<u64> {
        self.list.front().map(|ks| ks.dgen())
    }

    /// Returns the dgen of the oldest kvset, if any.
    #[must_use]
    pub fn tail_dgen(&self) -> Option<u64> {
        self.list.back().map(|ks| ks.dgen())
    }

    /// Returns the largest key across all kvsets, if any.
    #[must_use]
    pub fn max_key(&self) -> Option<UserKey> {
        self.list.iter().map(|ks| ks.max_key().clone()).max()
    }

    /// Returns the smallest key across all kvsets, if any.
    #[must_use]
    pub fn min_key(&self) -> Option<UserKey> {
        self.list.iter().map(|ks| ks.min_key().clone()).min()
    }

    /// Appends a freshly ingested kvset at the head.
    ///
    /// # Errors
    ///
    /// Returns `Bug` if the dgen does not exceed the current head's.
    pub(crate) fn push_head(&mut self, kvset: KvsetHandle) -> Result<()> {
        if self.head_dgen().is_some_and(|head| head >= kvset.dgen()) {
            return Err(Error::Bug("ingested kvset dgen must exceed head dgen"));
        }

        self.list.push_front(kvset);
        self.cgen += 1;
        Ok(())
    }

    /// Ordered insert used while initializing a replayed tree: the new
    /// entry lands before the first existing entry with a smaller dgen.
    ///
    /// # Errors
    ///
    /// Returns `Bug` on a duplicate dgen.
    pub(crate) fn insert_ordered(&mut self, kvset: KvsetHandle) -> Result<()> {
        let dgen = kvset.dgen();

        let mut idx = self.list.len();
        for (i, existing) in self.list.iter().enumerate() {
            if existing.dgen() == dgen {
                return Err(Error::Bug("duplicate kvset dgen in node"));
            }
            if existing.dgen() < dgen {
                idx = i;
                break;
            }
        }

        self.list.insert(idx, kvset);
        self.cgen += 1;
        Ok(())
    }

    /// Position of the kvset carrying `dgen`, if present.
    pub(crate) fn position_of_dgen(&self, dgen: u64) -> Option<usize> {
        self.list.iter().position(|ks| ks.dgen() == dgen)
    }

    #[cfg(debug_assertions)]
    pub(crate) fn assert_dgen_order(&self) {
        let mut prev: Option<u64> = None;
        for ks in &self.list {
            if let Some(prev) = prev {
                assert!(
                    prev > ks.dgen(),
                    "kvset dgens must strictly decrease head to tail",
                );
            }
            prev = Some(ks.dgen());
        }
    }
}
