// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{node::Node, TreeState};
use crate::{
    config::RuntimeParams,
    hlog::Hlog,
    kvset::Kvset,
    mblock::PAGE_SIZE,
};

/// Sampling-derived size budget, the scheduler's currency
///
/// The tree-wide record is the sum of every node's record; each update
/// primitive applies the exact delta it caused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampStats {
    /// Raw allocated length at the root
    pub r_alen: u64,

    /// Raw written length at the root
    pub r_wlen: u64,

    /// Allocated length of internal nodes (the root, in a two-level tree)
    pub i_alen: u64,

    /// Allocated length of the leaves
    pub l_alen: u64,

    /// Compacted-equivalent length of the leaves
    pub l_good: u64,
}

impl std::ops::AddAssign for SampStats {
    fn add_assign(&mut self, rhs: Self) {
        self.r_alen += rhs.r_alen;
        self.r_wlen += rhs.r_wlen;
        self.i_alen += rhs.i_alen;
        self.l_alen += rhs.l_alen;
        self.l_good += rhs.l_good;
    }
}

impl std::ops::SubAssign for SampStats {
    fn sub_assign(&mut self, rhs: Self) {
        self.r_alen -= rhs.r_alen;
        self.r_wlen -= rhs.r_wlen;
        self.i_alen -= rhs.i_alen;
        self.l_alen -= rhs.l_alen;
        self.l_good -= rhs.l_good;
    }
}

/// Rolled-up kvset statistics of one node, plus the derived fields the
/// scheduler reads
#[derive(Clone, Debug, Default)]
pub struct NodeStats {
    /// Number of kvsets folded in
    pub nkvsets: u64,

    /// Number of entries
    pub nkeys: u64,

    /// Number of point tombstones
    pub ntombs: u64,

    /// Number of prefix tombstones
    pub nptombs: u64,

    /// Logical key bytes
    pub kwlen: u64,

    /// Allocated key bytes
    pub kalen: u64,

    /// Logical value bytes
    pub vwlen: u64,

    /// Allocated value bytes
    pub valen: u64,

    /// Merged key-uniqueness sketch
    pub hlog: Hlog,

    /// Estimated distinct keys, clamped to `[0, nkeys]`
    pub uniq_keys: u64,

    /// Compacted-equivalent key length
    pub kclen: u64,

    /// Compacted-equivalent value length
    pub vclen: u64,

    /// Percent of the size threshold filled, saturated at 65535
    pub pcap: u16,
}

impl NodeStats {
    /// Total allocated length, one header page per kvset included.
    #[must_use]
    pub fn alen(&self) -> u64 {
        self.nkvsets * PAGE_SIZE + self.kalen + self.valen
    }

    /// Total logical written length.
    #[must_use]
    pub fn wlen(&self) -> u64 {
        self.kwlen + self.vwlen
    }

    /// Compacted-equivalent length.
    #[must_use]
    pub fn clen(&self) -> u64 {
        self.kclen + self.vclen
    }

    pub(crate) fn fold(&mut self, kvset: &Kvset) {
        let stats = kvset.stats();

        self.nkvsets += 1;
        self.nkeys += stats.nkeys;
        self.ntombs += stats.ntombs;
        self.nptombs += stats.nptombs;
        self.kwlen += stats.kwlen;
        self.kalen += stats.kalen;
        self.vwlen += stats.vwlen;
        self.valen += stats.valen;
        self.hlog.merge(kvset.hlog());
    }
}

// Derives the estimated fields and this node's samp record from the
// folded raw statistics.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn finish(node: &mut Node, rparams: &RuntimeParams) {
    let ns = &mut node.ns;

    // No sketch means no better guess than "all keys are unique"
    let uniq = if ns.hlog.is_empty() {
        ns.nkeys
    } else {
        ns.hlog.estimate().min(ns.nkeys)
    };

    let frac = if ns.nkeys == 0 {
        1.0
    } else {
        uniq as f64 / ns.nkeys as f64
    };

    ns.uniq_keys = uniq;
    ns.kclen = rparams
        .estimator
        .estimate((ns.kwlen as f64 * frac) as u64, rparams.kblock_mclass);
    ns.vclen = rparams
        .estimator
        .estimate((ns.vwlen as f64 * frac) as u64, rparams.vblock_mclass);

    let pcap = 100 * ns.clen() / node.split_size.max(1);
    ns.pcap = pcap.min(u64::from(u16::MAX)) as u16;

    let alen = ns.alen();
    let wlen = ns.wlen();
    let clen = ns.clen();

    node.samp = if node.is_root() {
        SampStats {
            r_alen: alen,
            r_wlen: wlen,
            i_alen: alen,
            l_alen: 0,
            l_good: 0,
        }
    } else {
        SampStats {
            r_alen: 0,
            r_wlen: 0,
            i_alen: 0,
            l_alen: alen,
            l_good: clen,
        }
    };
}

/// Full recompute of one node's statistics; returns `(pre, post)`.
pub(crate) fn update_compact(
    state: &mut TreeState,
    node_idx: usize,
    rparams: &RuntimeParams,
) -> (SampStats, SampStats) {
    let node = state.nodes.get_mut(node_idx).expect("node index is valid");

    let pre = node.samp;

    let mut ns = NodeStats::default();
    for kvset in &node.list {
        ns.fold(kvset);
    }
    node.ns = ns;
    node.samp_dgen = node.head_dgen().unwrap_or(0);

    finish(node, rparams);
    let post = node.samp;

    state.samp -= pre;
    state.samp += post;

    (pre, post)
}

/// Incremental update after a head append; folds the head kvset only if
/// its dgen exceeds the fold watermark. Returns `(pre, post)`.
pub(crate) fn update_ingest(
    state: &mut TreeState,
    node_idx: usize,
    rparams: &RuntimeParams,
) -> (SampStats, SampStats) {
    let node = state.nodes.get_mut(node_idx).expect("node index is valid");

    let pre = node.samp;

    let head = node.list.front().cloned();
    if let Some(head) = head {
        if head.dgen() > node.samp_dgen {
            node.samp_dgen = head.dgen();
            node.ns.fold(&head);
        }
    }

    finish(node, rparams);
    let post = node.samp;

    state.samp -= pre;
    state.samp += post;

    (pre, post)
}

/// Samp update after a spill: full recompute at the root, incremental
/// fold at every destination leaf.
pub(crate) fn update_spill(
    state: &mut TreeState,
    leaf_idxs: &[usize],
    rparams: &RuntimeParams,
) {
    update_compact(state, 0, rparams);

    for &idx in leaf_idxs {
        update_ingest(state, idx, rparams);
    }
}
