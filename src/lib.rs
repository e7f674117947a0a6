// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A log-structured tree of immutable key-value sets ("kvsets").
//!
//! ##### NOTE
//!
//! > This crate is a storage engine's write-amplification control
//! > plane, not a full storage engine: it manages the tree shape, the
//! > compaction machinery and the sampling statistics that drive an
//! > external compaction scheduler. Durable state lives entirely behind
//! > the journal and block-allocator interfaces the embedder attaches.
//!
//! ##### About
//!
//! The tree has a root node and one level of leaves. Ingest appends
//! immutable kvsets at the head of the root's list; each kvset carries
//! a monotonically increasing data generation (dgen), so within a node
//! the list is always newest-first.
//!
//! Four kinds of compaction keep read and space amplification bounded:
//!
//! - *k-compact* merges a run of kvsets, rewriting key blocks and
//!   carrying value blocks,
//! - *kv-compact* merges a run, rewriting keys and values,
//! - *spill* partitions the root's oldest kvsets across the leaves,
//! - *split* divides an oversized leaf around a chosen split key.
//!
//! Sampling statistics (raw vs. compacted-equivalent lengths) roll up
//! from kvsets through nodes into a tree-wide record that the external
//! scheduler reads to decide what to compact next.
//!
//! # Example usage
//!
//! ```
//! use kvset_tree::{CompactAction, CompactRequest, Config, TreeParams, ValueType};
//!
//! let tree = Config::new(TreeParams {
//!     fanout: 4,
//!     ..Default::default()
//! })
//! .open()?;
//!
//! // Ingest a built kvset
//! let mut builder = tree.kvset_builder();
//! builder.add(kvset_tree::InternalValue::from_components(
//!     "my_key", "my_value", 1, ValueType::Value,
//! ))?;
//! let built = builder.finish()?.expect("kvset is not empty");
//! tree.ingest(built, None)?;
//!
//! assert_eq!(Some("my_value".as_bytes().into()), tree.get(b"my_key", 1)?);
//!
//! // Let a (stand-in) scheduler compact the root
//! tree.compact(&CompactRequest {
//!     node_id: kvset_tree::ROOT_NODE_ID,
//!     action: CompactAction::KvCompact,
//!     kvset_cnt: 0,
//!     horizon: 0,
//! })?;
//!
//! assert_eq!(Some("my_value".as_bytes().into()), tree.get(b"my_key", 1)?);
//! #
//! # Ok::<(), kvset_tree::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

mod binary_search;

mod capped;

mod compaction;

mod config;

mod error;

mod hasher;

mod health;

mod hlog;

mod journal;

mod kvset;

mod mblock;

mod merge;

mod pool;

mod route;

mod seqno;

mod slice;

mod stop_signal;

mod tree;

mod value;

/// Stable 64-bit node id; the root is always id 0
pub type NodeId = u64;

/// Stable 64-bit kvset id, minted by the journal
pub type KvsetId = u64;

pub use crate::{
    compaction::{rspill::SpillHandle, CompactAction, CompactRequest},
    config::{
        ClenEstimator, Config, MediaClass, MemScheduler, NoopScheduler, RuntimeParams,
        SchedulerHook, TreeParams,
    },
    error::{Error, Result},
    hasher::KeyHasher,
    health::{Health, MemHealth, NoopHealth},
    hlog::Hlog,
    journal::{
        Cookie, Journal, JournalRecord, JournalTx, KvsetMeta, MemJournal, INVALID_INGEST_ID,
    },
    kvset::{
        builder::{BuiltKvset, KvsetBuilder},
        GetResult, Kvset, KvsetHandle, KvsetIter, KvsetStats, ProbeStep,
    },
    mblock::{BlockAllocator, Mbset, MblockId, MemAllocator, PAGE_SIZE},
    route::{RouteEntry, RouteMap},
    seqno::SequenceNumberCounter,
    slice::Slice,
    stop_signal::StopSignal,
    tree::{
        lookup::ProbeResult,
        node::ROOT_NODE_ID,
        samp::{NodeStats, SampStats},
        NodeView, Tree, TreeView, WalkOrder,
    },
    value::{InternalKey, InternalValue, SeqNo, UserKey, UserValue, ValueType},
};
