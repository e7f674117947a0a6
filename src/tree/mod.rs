// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod ingest;
pub mod lookup;
pub mod node;
pub mod samp;

use crate::{
    config::{Config, MediaClass, RuntimeParams, SchedulerHook, TreeParams},
    hasher::KeyHasher,
    health::Health,
    journal::Journal,
    kvset::{builder::{BuiltKvset, KvsetBuilder}, Kvset, KvsetHandle},
    mblock::BlockAllocator,
    pool::WorkerPool,
    route::RouteMap,
    Error, NodeId, Result, SeqNo, StopSignal, UserKey,
};
use node::{Node, ROOT_NODE_ID};
use samp::{NodeStats, SampStats};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock,
};

/// Capped-tree bookkeeping: the remembered prefix-tombstone high-water
/// mark and the trimmer's resume state
#[derive(Default)]
pub(crate) struct CappedState {
    pub ptomb: Option<(UserKey, SeqNo)>,
    pub last_horizon: SeqNo,
    pub last_tail_dgen: u64,
}

/// Everything guarded by the tree's read-mostly lock: node membership,
/// per-node kvset lists, the route map and the rolled-up samp record
pub(crate) struct TreeState {
    /// All nodes, root first
    pub nodes: Vec<Node>,

    pub route: RouteMap,

    /// Sum of every node's samp record
    pub samp: SampStats,

    /// Highest dgen ever handed out
    pub dgen_hwm: u64,

    pub capped: CappedState,
}

pub(crate) fn node_index(state: &TreeState, node_id: NodeId) -> Option<usize> {
    state.nodes.iter().position(|n| n.id == node_id)
}

#[doc(hidden)]
pub struct TreeInner {
    pub(crate) cnid: u64,
    pub(crate) params: TreeParams,
    pub(crate) rparams: RuntimeParams,
    pub(crate) hasher: KeyHasher,

    pub(crate) state: RwLock<TreeState>,

    pub(crate) cancel: StopSignal,
    pub(crate) nospace: AtomicBool,

    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) allocator: Arc<dyn BlockAllocator>,
    pub(crate) health: Arc<dyn Health>,
    pub(crate) scheduler: Arc<dyn SchedulerHook>,

    pub(crate) pool: Mutex<Option<WorkerPool>>,
}

/// A log-structured tree of immutable kvsets
///
/// The root takes ingests; compaction reshapes the root and the leaves
/// below it. Cheap to clone; all clones share one tree.
#[derive(Clone)]
pub struct Tree(#[doc(hidden)] pub Arc<TreeInner>);

impl std::ops::Deref for Tree {
    type Target = TreeInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Traversal order of [`Tree::walk_preorder`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkOrder {
    /// Newest kvset of each node first
    NewestFirst,

    /// Oldest kvset of each node first
    OldestFirst,
}

/// Stable snapshot of one node
pub struct NodeView {
    /// Node id
    pub node_id: NodeId,

    /// Route edge key (`None` for the root)
    pub edge_key: Option<UserKey>,

    /// Kvsets, newest first; the view pins each via its handle
    pub kvsets: Vec<KvsetHandle>,
}

/// Stable, reference-counted snapshot of the whole tree
///
/// Dropping the view releases every reference it acquired.
pub struct TreeView {
    /// Per-node views, root first
    pub nodes: Vec<NodeView>,
}

impl TreeView {
    /// Returns the total number of kvsets in the view.
    #[must_use]
    pub fn kvset_count(&self) -> usize {
        self.nodes.iter().map(|n| n.kvsets.len()).sum()
    }
}

impl Tree {
    pub(crate) fn open(config: Config) -> Result<Self> {
        config.params.validate()?;

        log::debug!(
            "opening tree cnid={} fanout={} capped={}",
            config.cnid,
            config.params.fanout,
            config.params.capped,
        );

        let mut root = Node::new(ROOT_NODE_ID, config.params.node_size_max);
        root.cgen = 1;

        let state = TreeState {
            nodes: vec![root],
            route: RouteMap::with_capacity(config.params.fanout),
            samp: SampStats::default(),
            dgen_hwm: 0,
            capped: CappedState::default(),
        };

        let hasher = KeyHasher::new(config.params.pfx_len, config.params.sfx_len);
        let pool = WorkerPool::new(config.rparams.destroy_threads);

        Ok(Self(Arc::new(TreeInner {
            cnid: config.cnid,
            params: config.params,
            rparams: config.rparams,
            hasher,
            state: RwLock::new(state),
            cancel: StopSignal::default(),
            nospace: AtomicBool::new(false),
            journal: config.journal,
            allocator: config.allocator,
            health: config.health,
            scheduler: config.scheduler,
            pool: Mutex::new(Some(pool)),
        })))
    }

    /// Returns the keyspace id.
    #[must_use]
    pub fn cnid(&self) -> u64 {
        self.cnid
    }

    /// Returns the create-time parameters.
    #[must_use]
    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    /// Returns the runtime parameters.
    #[must_use]
    pub fn rparams(&self) -> &RuntimeParams {
        &self.rparams
    }

    /// Requests cancellation of all in-flight and future compaction work.
    pub fn cancel(&self) {
        self.cancel.send();
    }

    /// Returns `true` once the media-full flag was raised.
    #[must_use]
    pub fn is_nospace(&self) -> bool {
        self.nospace.load(Ordering::Acquire)
    }

    /// Returns a builder wired to this tree's hashing policy and allocator.
    #[must_use]
    pub fn kvset_builder(&self) -> KvsetBuilder {
        KvsetBuilder::new(self.hasher, self.allocator.clone(), &self.rparams)
    }

    /// Tears the tree down, releasing kvset references on background
    /// workers and waiting for them.
    pub fn close(&self) {
        log::debug!("closing tree cnid={}", self.cnid);

        let nodes = {
            let mut state = self.state.write().expect("lock is poisoned");
            state.samp = SampStats::default();
            std::mem::take(&mut state.nodes)
        };

        let pool = self.pool.lock().expect("lock is poisoned").take();

        if let Some(pool) = pool {
            for node in nodes {
                pool.spawn(move || {
                    log::trace!("releasing {} kvsets of node {}", node.list.len(), node.id);
                    drop(node);
                });
            }
            pool.join();
        }
    }

    /// Returns the tree-wide samp record.
    #[must_use]
    pub fn samp(&self) -> SampStats {
        self.state.read().expect("lock is poisoned").samp
    }

    /// Fully recomputes one node's statistics and returns the tree-wide
    /// samp record. The scheduler calls this when it wants a coherent
    /// snapshot instead of the eventually-consistent rolled-up values.
    ///
    /// # Errors
    ///
    /// Returns `Bug` for an unknown node.
    pub fn samp_refresh(&self, node_id: NodeId) -> Result<SampStats> {
        let mut state = self.state.write().expect("lock is poisoned");

        let Some(idx) = node_index(&state, node_id) else {
            return Err(Error::Bug("no node with that id"));
        };

        samp::update_compact(&mut state, idx, &self.rparams);
        Ok(state.samp)
    }

    /// Returns one node's samp record.
    #[must_use]
    pub fn node_samp(&self, node_id: NodeId) -> Option<SampStats> {
        let state = self.state.read().expect("lock is poisoned");
        node_index(&state, node_id).map(|idx| state.nodes.get(idx).expect("index is valid").samp)
    }

    /// Returns one node's accumulated statistics.
    #[must_use]
    pub fn node_stats(&self, node_id: NodeId) -> Option<NodeStats> {
        let state = self.state.read().expect("lock is poisoned");
        node_index(&state, node_id)
            .map(|idx| state.nodes.get(idx).expect("index is valid").ns.clone())
    }

    /// Returns all node ids, root first.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        let state = self.state.read().expect("lock is poisoned");
        state.nodes.iter().map(|n| n.id).collect()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.read().expect("lock is poisoned").nodes.len()
    }

    /// Returns a node's smallest and largest key, if it holds any kvset.
    #[must_use]
    pub fn node_min_max_key(&self, node_id: NodeId) -> Option<(UserKey, UserKey)> {
        let state = self.state.read().expect("lock is poisoned");
        let node = state.nodes.get(node_index(&state, node_id)?)?;
        Some((node.min_key()?, node.max_key()?))
    }

    /// Returns the media classes a node's key and value blocks land on.
    #[must_use]
    pub fn node_mclass(&self, node_id: NodeId) -> Option<(MediaClass, MediaClass)> {
        let state = self.state.read().expect("lock is poisoned");
        node_index(&state, node_id)?;
        Some((self.rparams.kblock_mclass, self.rparams.vblock_mclass))
    }

    /// Returns one node's busy accounting `(active jobs, staked kvsets)`.
    #[must_use]
    pub fn node_busy(&self, node_id: NodeId) -> Option<(u32, u32)> {
        let state = self.state.read().expect("lock is poisoned");
        let node = state.nodes.get(node_index(&state, node_id)?)?;
        Some((node.shared.active_jobs(), node.shared.reserved_kvsets()))
    }

    /// Returns `true` if the node was wedged by a failed spill.
    #[must_use]
    pub fn is_wedged(&self, node_id: NodeId) -> bool {
        let state = self.state.read().expect("lock is poisoned");
        node_index(&state, node_id)
            .and_then(|idx| state.nodes.get(idx))
            .is_some_and(|node| node.shared.is_wedged())
    }

    /// Re-creates a leaf while initializing a replayed tree.
    ///
    /// # Errors
    ///
    /// Returns `Bug` if the node id or edge key already exists.
    pub fn restore_node(&self, node_id: NodeId, edge_key: UserKey) -> Result<()> {
        let mut state = self.state.write().expect("lock is poisoned");

        if node_index(&state, node_id).is_some() {
            return Err(Error::Bug("node id already exists"));
        }

        state.route.insert(edge_key.clone(), node_id)?;

        let mut node = Node::new(node_id, self.params.node_size_max);
        node.route_key = Some(edge_key);
        state.nodes.push(node);

        Ok(())
    }

    /// Inserts a replayed kvset into a node, keeping the list dgen-ordered.
    /// Initialization only.
    ///
    /// # Errors
    ///
    /// Returns `Bug` for an unknown node or duplicate dgen, `Invalid`
    /// for an empty kvset.
    pub fn insert_kvset_at(
        &self,
        node_id: NodeId,
        kvset_id: crate::KvsetId,
        dgen: u64,
        compc: u32,
        built: BuiltKvset,
    ) -> Result<()> {
        if built.entry_count() == 0 {
            return Err(Error::Invalid("kvset may not be empty"));
        }

        let kvset = Kvset::open(kvset_id, dgen, compc, built, self.allocator.clone());

        let mut state = self.state.write().expect("lock is poisoned");

        let Some(idx) = node_index(&state, node_id) else {
            return Err(Error::Bug("no node with that id"));
        };

        state
            .nodes
            .get_mut(idx)
            .expect("index is valid")
            .insert_ordered(kvset)?;

        state.dgen_hwm = state.dgen_hwm.max(dgen);

        samp::update_compact(&mut state, idx, &self.rparams);

        Ok(())
    }

    /// Builds a stable snapshot of every node's kvset list.
    #[must_use]
    pub fn view(&self) -> TreeView {
        let state = self.state.read().expect("lock is poisoned");

        let nodes = state
            .nodes
            .iter()
            .map(|node| NodeView {
                node_id: node.id,
                edge_key: node.route_key.clone(),
                kvsets: node.list.iter().cloned().collect(),
            })
            .collect();

        TreeView { nodes }
    }

    /// Visits every kvset node by node, root first.
    ///
    /// The read lock is released between nodes so writers can interleave
    /// with long walks; each node's list is visited atomically.
    pub fn walk_preorder<F>(&self, order: WalkOrder, mut visitor: F)
    where
        F: FnMut(NodeId, &KvsetHandle),
    {
        let mut idx = 0;

        loop {
            let state = self.state.read().expect("lock is poisoned");

            let Some(node) = state.nodes.get(idx) else {
                return;
            };

            match order {
                WalkOrder::NewestFirst => {
                    for kvset in &node.list {
                        visitor(node.id, kvset);
                    }
                }
                WalkOrder::OldestFirst => {
                    for kvset in node.list.iter().rev() {
                        visitor(node.id, kvset);
                    }
                }
            }

            drop(state);
            idx += 1;
        }
    }
}
